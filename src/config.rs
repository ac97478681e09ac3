// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Run configuration: test scenarios, worker counts and yield injection.
//!
//! | Test | Branches | Accounts/branch | Notes |
//! |------|----------|-----------------|-------|
//! | 1 | 16 | 1024 | normal run |
//! | 2 | 4 | 2 | tiny bank, maximum contention |
//! | 3 | 256 | 4096 | no bank-balance actions |
//! | 4 | 16 | 1024 | normal run with failure injection |
//! | 5 | 256 | 64 | no cross-branch transfers, no bank-balance |
//! | 6 | 32 | 4 | as 5 with few accounts per branch |
//! | 7 | 256 | 64 | bank-balance verification, no funds flow |

use crate::action::ControlFlags;
use crate::bank::Bank;
use crate::base::{AccountId, Amount, BranchId};
use crate::error::ConfigError;
use rand::Rng;
use std::thread;

/// Worker counts the action generator can partition its streams across.
pub const SUPPORTED_WORKERS: [usize; 5] = [1, 2, 4, 8, 16];

/// Largest supported worker count, and the number of logical action streams.
pub const MAX_WORKERS: usize = 16;

/// Command volume used when running under a race checker.
const RACE_CHECKER_COMMANDS: usize = 4 * 1024;

/// Injects `thread::yield_now()` calls inside critical sections.
///
/// Only changes scheduling. A run with any percentage must produce the
/// same balances as a run with none.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct YieldPolicy {
    percent: u8,
}

impl YieldPolicy {
    pub const NEVER: YieldPolicy = YieldPolicy { percent: 0 };

    pub fn new(percent: u8) -> Result<Self, ConfigError> {
        if percent > 100 {
            return Err(ConfigError::InvalidYieldPercent(percent));
        }
        Ok(Self { percent })
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    #[inline]
    pub fn maybe_yield(&self) {
        if self.percent > 0 && rand::thread_rng().gen_range(0..100u8) < self.percent {
            thread::yield_now();
        }
    }
}

/// Options that come from the command line rather than the test table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub workers: usize,
    pub test_run: u32,
    pub seed: u64,
    pub yield_policy: YieldPolicy,
    pub inject_failures: bool,
    pub verify_bank_balance: bool,
    pub race_checker: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            test_run: 1,
            seed: 0,
            yield_policy: YieldPolicy::NEVER,
            inject_failures: false,
            verify_bank_balance: false,
            race_checker: false,
        }
    }
}

impl RunOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_workers(self.workers)
    }
}

pub fn validate_workers(workers: usize) -> Result<(), ConfigError> {
    if SUPPORTED_WORKERS.contains(&workers) {
        Ok(())
    } else {
        Err(ConfigError::UnsupportedWorkerCount(workers))
    }
}

/// Bank shape and workload volume for one test run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scenario {
    pub test_run: u32,
    pub branches: u32,
    pub accounts_per_branch: u32,
    /// Balance-changing and query commands across all workers, reports
    /// not included.
    pub commands: usize,
    pub max_transaction: Amount,
    pub initial_amount: Amount,
    /// Report actions in each logical stream. Every worker ends up with the
    /// same number, which keeps the barrier rounds aligned.
    pub reports_per_stream: usize,
    pub flags: ControlFlags,
    /// Every fourth account starts deeply negative so debits against it fail.
    pub inject_failures: bool,
    /// Every bank-balance query must equal the initial total.
    pub verify_bank_balance: bool,
}

impl Scenario {
    pub fn for_test_run(test_run: u32) -> Result<Self, ConfigError> {
        let base = Scenario {
            test_run,
            branches: 16,
            accounts_per_branch: 1024,
            commands: 8 * 1024 * 1024,
            max_transaction: 1024,
            initial_amount: 100_000,
            reports_per_stream: 63,
            flags: ControlFlags::NONE,
            inject_failures: false,
            verify_bank_balance: false,
        };

        let scenario = match test_run {
            1 => base,
            2 => Scenario {
                branches: 4,
                accounts_per_branch: 2,
                max_transaction: 128,
                initial_amount: 10_000,
                reports_per_stream: 8,
                ..base
            },
            3 => Scenario {
                branches: 256,
                accounts_per_branch: 4096,
                commands: 16 * 1024 * 1024,
                max_transaction: 20,
                initial_amount: 5_000,
                reports_per_stream: 1,
                flags: ControlFlags::NO_BANK_BALANCE,
                ..base
            },
            4 => Scenario {
                inject_failures: true,
                ..base
            },
            5 => Scenario {
                branches: 256,
                accounts_per_branch: 64,
                commands: 16 * 1024 * 1024,
                max_transaction: 20,
                initial_amount: 5_000,
                reports_per_stream: 1,
                flags: ControlFlags::NO_CROSS_TRANSFER | ControlFlags::NO_BANK_BALANCE,
                ..base
            },
            6 => Scenario {
                branches: 32,
                accounts_per_branch: 4,
                commands: 16 * 1024 * 1024,
                max_transaction: 20,
                initial_amount: 5_000,
                reports_per_stream: 1,
                flags: ControlFlags::NO_CROSS_TRANSFER | ControlFlags::NO_BANK_BALANCE,
                ..base
            },
            7 => Scenario {
                branches: 256,
                accounts_per_branch: 64,
                commands: 4 * 1024 * 1024,
                max_transaction: 20,
                initial_amount: 5_000,
                reports_per_stream: 1,
                verify_bank_balance: true,
                flags: ControlFlags::NO_FUNDS_FLOW,
                ..base
            },
            other => return Err(ConfigError::UnknownTestRun(other)),
        };
        Ok(scenario)
    }

    /// Folds command-line switches into the scenario.
    pub fn with_options(mut self, options: &RunOptions) -> Self {
        self.inject_failures |= options.inject_failures;
        self.verify_bank_balance |= options.verify_bank_balance;
        if self.verify_bank_balance {
            self.flags |= ControlFlags::NO_FUNDS_FLOW;
        }
        if options.race_checker {
            self.commands = RACE_CHECKER_COMMANDS;
        }
        self
    }

    pub fn num_accounts(&self) -> u64 {
        self.branches as u64 * self.accounts_per_branch as u64
    }

    /// Whether failure injection makes every debit against `account` fail.
    pub fn is_doomed(&self, account: AccountId) -> bool {
        self.inject_failures && account.index() % 4 == 3
    }

    /// Starting balance of a doomed account. Even if every command credited
    /// it with the maximum amount it would never climb above zero.
    fn doomed_balance(&self) -> Amount {
        -(self.commands as Amount).saturating_mul(self.max_transaction)
    }

    /// Per-branch starting balances, honouring failure injection.
    pub fn initial_balances(&self) -> Vec<Vec<Amount>> {
        (0..self.branches)
            .map(|branch| {
                (0..self.accounts_per_branch)
                    .map(|index| {
                        let id = AccountId::new(BranchId(branch), index);
                        if self.is_doomed(id) {
                            self.doomed_balance()
                        } else {
                            self.initial_amount
                        }
                    })
                    .collect()
            })
            .collect()
    }

    pub fn build_bank(&self, yield_policy: YieldPolicy) -> Bank {
        Bank::from_balances(&self.initial_balances()).with_yield_policy(yield_policy)
    }
}
