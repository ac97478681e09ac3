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

//! Actions and the sources workers pull them from.
//!
//! [`GeneratedActions`] is the seeded workload used by the bank driver. It
//! splits the workload into [`MAX_WORKERS`] logical streams and hands worker
//! `w` of `N` the streams `w, w + N, ...`, so the multiset of actions does
//! not depend on the worker count. Each stream only emits debits that fit an
//! allowance it tracks for itself, which makes every debit succeed in every
//! interleaving: the concurrent run and the sequential replay must agree to
//! the cent.
//!
//! [`ScriptedActions`] replays fixed per-worker lists, optionally read from
//! CSV (`kind,worker,account,dst,branch,amount`).

use crate::base::{AccountId, Amount, BranchId, WorkerId};
use crate::config::{MAX_WORKERS, Scenario};
use crate::error::ActionError;
use csv::{ReaderBuilder, Trim};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::io::Read;
use std::ops::{BitOr, BitOrAssign};

/// One unit of work for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Deposit {
        account: AccountId,
        amount: Amount,
    },
    Withdraw {
        account: AccountId,
        amount: Amount,
    },
    Transfer {
        src: AccountId,
        dst: AccountId,
        amount: Amount,
    },
    BranchBalance {
        branch: BranchId,
    },
    BankBalance,
    Report {
        worker: WorkerId,
    },
    Done,
}

/// Restricts which action kinds a source may produce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ControlFlags(u8);

impl ControlFlags {
    pub const NONE: ControlFlags = ControlFlags(0);
    pub const NO_CROSS_TRANSFER: ControlFlags = ControlFlags(1);
    pub const NO_BANK_BALANCE: ControlFlags = ControlFlags(1 << 1);
    pub const NO_FUNDS_FLOW: ControlFlags = ControlFlags(1 << 2);

    pub const fn contains(self, other: ControlFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for ControlFlags {
    type Output = ControlFlags;

    fn bitor(self, rhs: ControlFlags) -> ControlFlags {
        ControlFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for ControlFlags {
    fn bitor_assign(&mut self, rhs: ControlFlags) {
        self.0 |= rhs.0;
    }
}

/// Where workers get their next action from.
///
/// Once a worker's actions are exhausted the source keeps returning
/// [`Action::Done`].
pub trait ActionSource: Send + Sync {
    fn next_action(&self, worker: WorkerId, flags: ControlFlags) -> Result<Action, ActionError>;
}

// =============================================================================
// Generated workload
// =============================================================================

/// Relative weights of funds actions, queries and transfers.
const DEPOSIT_WEIGHT: u32 = 10;
const WITHDRAW_WEIGHT: u32 = 10;
const TRANSFER_WEIGHT: u32 = 60;
const BRANCH_BALANCE_WEIGHT: u32 = 10;
const BANK_BALANCE_WEIGHT: u32 = 10;

/// Bank shape the generator draws account identifiers from.
#[derive(Debug, Clone, Copy)]
struct Shape {
    branches: u32,
    accounts_per_branch: u32,
    max_transaction: Amount,
    inject_failures: bool,
}

impl Shape {
    fn is_doomed(&self, account: AccountId) -> bool {
        self.inject_failures && account.index() % 4 == 3
    }
}

/// One logical stream of the generated workload.
struct Stream {
    rng: StdRng,
    worker_hint: usize,
    commands: usize,
    commands_emitted: usize,
    reports: usize,
    reports_emitted: usize,
    /// This stream's share of every account's starting balance.
    share: Amount,
    /// Current allowance for accounts this stream has touched.
    allowances: HashMap<AccountId, Amount>,
}

impl Stream {
    fn allowance(&self, account: AccountId) -> Amount {
        self.allowances.get(&account).copied().unwrap_or(self.share)
    }

    fn credit(&mut self, shape: &Shape, account: AccountId, amount: Amount) {
        // Nothing is ever debited from a doomed account, so its credits
        // are not worth tracking.
        if !shape.is_doomed(account) {
            let allowance = self.allowance(account) + amount;
            self.allowances.insert(account, allowance);
        }
    }

    /// Reserves `amount` from the account's allowance, if it fits.
    ///
    /// Debits against doomed accounts are always let through: they fail in
    /// every interleaving, so they cannot make the runs diverge.
    fn try_debit(&mut self, shape: &Shape, account: AccountId, amount: Amount) -> bool {
        if shape.is_doomed(account) {
            return true;
        }
        let allowance = self.allowance(account);
        if allowance < amount {
            return false;
        }
        self.allowances.insert(account, allowance - amount);
        true
    }

    fn random_account(&mut self, shape: &Shape) -> AccountId {
        let branch = self.rng.gen_range(0..shape.branches);
        self.random_account_in(shape, BranchId(branch))
    }

    fn random_account_in(&mut self, shape: &Shape, branch: BranchId) -> AccountId {
        AccountId::new(branch, self.rng.gen_range(0..shape.accounts_per_branch))
    }

    fn is_exhausted(&self) -> bool {
        self.commands_emitted >= self.commands && self.reports_emitted >= self.reports
    }

    fn next(&mut self, shape: &Shape, flags: ControlFlags) -> Option<Action> {
        if self.is_exhausted() {
            return None;
        }
        // Report `i` (1-based) is due once `i * commands / reports` commands
        // have gone out, so the last one follows the final command.
        if self.reports_emitted < self.reports {
            let due = (self.reports_emitted + 1) * self.commands / self.reports;
            if self.commands_emitted >= due {
                self.reports_emitted += 1;
                return Some(Action::Report {
                    worker: WorkerId(self.worker_hint),
                });
            }
        }
        self.commands_emitted += 1;
        Some(self.command(shape, flags))
    }

    fn command(&mut self, shape: &Shape, flags: ControlFlags) -> Action {
        let funds_flow = !flags.contains(ControlFlags::NO_FUNDS_FLOW);
        let bank_balance = !flags.contains(ControlFlags::NO_BANK_BALANCE);

        let deposit = if funds_flow { DEPOSIT_WEIGHT } else { 0 };
        let withdraw = if funds_flow { WITHDRAW_WEIGHT } else { 0 };
        let bank = if bank_balance { BANK_BALANCE_WEIGHT } else { 0 };
        let total = deposit + withdraw + TRANSFER_WEIGHT + BRANCH_BALANCE_WEIGHT + bank;

        let mut pick = self.rng.gen_range(0..total);
        let account = self.random_account(shape);
        let amount = self.rng.gen_range(1..=shape.max_transaction);

        if pick < deposit {
            self.credit(shape, account, amount);
            return Action::Deposit { account, amount };
        }
        pick -= deposit;

        if pick < withdraw {
            if self.try_debit(shape, account, amount) {
                return Action::Withdraw { account, amount };
            }
            return Action::BranchBalance {
                branch: account.branch(),
            };
        }
        pick -= withdraw;

        if pick < TRANSFER_WEIGHT {
            let dst = if flags.contains(ControlFlags::NO_CROSS_TRANSFER) {
                self.random_account_in(shape, account.branch())
            } else {
                self.random_account(shape)
            };
            if self.try_debit(shape, account, amount) {
                if !shape.is_doomed(account) {
                    self.credit(shape, dst, amount);
                }
                return Action::Transfer {
                    src: account,
                    dst,
                    amount,
                };
            }
            return Action::BranchBalance {
                branch: account.branch(),
            };
        }
        pick -= TRANSFER_WEIGHT;

        if pick < BRANCH_BALANCE_WEIGHT {
            return Action::BranchBalance {
                branch: account.branch(),
            };
        }
        Action::BankBalance
    }
}

/// Decorrelates the per-stream generators derived from one run seed.
fn stream_seed(seed: u64, stream: usize) -> u64 {
    seed ^ (stream as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// Seeded, deterministic workload generator.
pub struct GeneratedActions {
    shape: Shape,
    workers: usize,
    streams: Vec<Mutex<Stream>>,
    /// Per worker: how many of its streams it has finished.
    cursors: Vec<Mutex<usize>>,
}

impl GeneratedActions {
    /// Builds the workload for `scenario`, partitioned across `workers`.
    ///
    /// `workers` must divide [`MAX_WORKERS`]; see
    /// [`validate_workers`](crate::config::validate_workers).
    pub fn new(scenario: &Scenario, workers: usize, seed: u64) -> Self {
        debug_assert!(workers > 0 && MAX_WORKERS % workers == 0);

        let shape = Shape {
            branches: scenario.branches,
            accounts_per_branch: scenario.accounts_per_branch,
            max_transaction: scenario.max_transaction,
            inject_failures: scenario.inject_failures,
        };
        let per_stream = scenario.commands / MAX_WORKERS;
        let longer_streams = scenario.commands % MAX_WORKERS;
        let share = scenario.initial_amount / MAX_WORKERS as Amount;

        let streams = (0..MAX_WORKERS)
            .map(|stream| {
                Mutex::new(Stream {
                    rng: StdRng::seed_from_u64(stream_seed(seed, stream)),
                    worker_hint: stream % workers,
                    commands: per_stream + usize::from(stream < longer_streams),
                    commands_emitted: 0,
                    reports: scenario.reports_per_stream,
                    reports_emitted: 0,
                    share,
                    allowances: HashMap::new(),
                })
            })
            .collect();

        Self {
            shape,
            workers,
            streams,
            cursors: (0..workers).map(|_| Mutex::new(0)).collect(),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

impl ActionSource for GeneratedActions {
    fn next_action(&self, worker: WorkerId, flags: ControlFlags) -> Result<Action, ActionError> {
        let mut finished = self
            .cursors
            .get(worker.0)
            .ok_or(ActionError::WorkerOutOfRange(worker))?
            .lock();

        loop {
            let stream = worker.0 + *finished * self.workers;
            let Some(stream) = self.streams.get(stream) else {
                return Ok(Action::Done);
            };
            if let Some(action) = stream.lock().next(&self.shape, flags) {
                return Ok(action);
            }
            *finished += 1;
        }
    }
}

// =============================================================================
// Scripted actions
// =============================================================================

/// Raw action record matching the CSV script format.
///
/// Fields: `kind, worker, account, dst, branch, amount`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ActionRecord {
    pub kind: String,
    pub worker: usize,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub account: Option<u64>,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub dst: Option<u64>,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub branch: Option<u32>,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub amount: Option<Amount>,
}

impl ActionRecord {
    fn new(kind: &str, worker: usize) -> Self {
        Self {
            kind: kind.to_string(),
            worker,
            account: None,
            dst: None,
            branch: None,
            amount: None,
        }
    }

    fn from_action(worker: usize, action: &Action) -> Self {
        match *action {
            Action::Deposit { account, amount } => ActionRecord {
                account: Some(account.0),
                amount: Some(amount),
                ..Self::new("deposit", worker)
            },
            Action::Withdraw { account, amount } => ActionRecord {
                account: Some(account.0),
                amount: Some(amount),
                ..Self::new("withdraw", worker)
            },
            Action::Transfer { src, dst, amount } => ActionRecord {
                account: Some(src.0),
                dst: Some(dst.0),
                amount: Some(amount),
                ..Self::new("transfer", worker)
            },
            Action::BranchBalance { branch } => ActionRecord {
                branch: Some(branch.0),
                ..Self::new("branch_balance", worker)
            },
            Action::BankBalance => Self::new("bank_balance", worker),
            Action::Report { .. } => Self::new("report", worker),
            Action::Done => Self::new("done", worker),
        }
    }

    /// Decodes the record. Unknown kinds and missing payload fields are
    /// both reported as [`ActionError::UnknownAction`].
    pub fn into_action(self) -> Result<Action, ActionError> {
        let kind = self.kind.to_lowercase();
        let malformed = || ActionError::UnknownAction(self.kind.clone());
        let account = || self.account.map(AccountId).ok_or_else(malformed);
        let amount = || self.amount.ok_or_else(malformed);

        let action = match kind.as_str() {
            "deposit" => Action::Deposit {
                account: account()?,
                amount: amount()?,
            },
            "withdraw" | "withdrawal" => Action::Withdraw {
                account: account()?,
                amount: amount()?,
            },
            "transfer" => Action::Transfer {
                src: account()?,
                dst: self.dst.map(AccountId).ok_or_else(malformed)?,
                amount: amount()?,
            },
            "branch_balance" => Action::BranchBalance {
                branch: self.branch.map(BranchId).ok_or_else(malformed)?,
            },
            "bank_balance" => Action::BankBalance,
            "report" => Action::Report {
                worker: WorkerId(self.worker),
            },
            "done" => Action::Done,
            _ => return Err(malformed()),
        };
        Ok(action)
    }
}

/// Fixed per-worker action lists. Control flags are ignored.
pub struct ScriptedActions {
    queues: Vec<Mutex<VecDeque<ActionRecord>>>,
}

impl ScriptedActions {
    pub fn new(scripts: Vec<Vec<Action>>) -> Self {
        let queues = scripts
            .into_iter()
            .enumerate()
            .map(|(worker, actions)| {
                Mutex::new(
                    actions
                        .iter()
                        .map(|action| ActionRecord::from_action(worker, action))
                        .collect(),
                )
            })
            .collect();
        Self { queues }
    }

    /// Reads a CSV script with a header row. Each record goes to the queue
    /// of the worker named in its `worker` column.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::Csv`] for unreadable rows and
    /// [`ActionError::WorkerOutOfRange`] for rows naming a worker
    /// `>= workers`. Unknown kinds are kept and surface when fetched.
    pub fn from_csv<R: Read>(reader: R, workers: usize) -> Result<Self, ActionError> {
        let mut queues: Vec<VecDeque<ActionRecord>> = vec![VecDeque::new(); workers];

        let mut rdr = ReaderBuilder::new()
            .trim(Trim::All)
            .flexible(true)
            .has_headers(true)
            .from_reader(reader);

        for result in rdr.deserialize::<ActionRecord>() {
            let record = result?;
            queues
                .get_mut(record.worker)
                .ok_or(ActionError::WorkerOutOfRange(WorkerId(record.worker)))?
                .push_back(record);
        }

        Ok(Self {
            queues: queues.into_iter().map(Mutex::new).collect(),
        })
    }

    pub fn workers(&self) -> usize {
        self.queues.len()
    }
}

impl ActionSource for ScriptedActions {
    fn next_action(&self, worker: WorkerId, _flags: ControlFlags) -> Result<Action, ActionError> {
        let record = self
            .queues
            .get(worker.0)
            .ok_or(ActionError::WorkerOutOfRange(worker))?
            .lock()
            .pop_front();
        match record {
            Some(record) => record.into_action(),
            None => Ok(Action::Done),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Cursor;

    fn small_scenario() -> Scenario {
        Scenario {
            branches: 4,
            accounts_per_branch: 8,
            commands: 1_600,
            max_transaction: 50,
            initial_amount: 1_600,
            reports_per_stream: 3,
            ..Scenario::for_test_run(1).unwrap()
        }
    }

    fn drain(source: &GeneratedActions, worker: WorkerId, flags: ControlFlags) -> Vec<Action> {
        let mut actions = Vec::new();
        loop {
            match source.next_action(worker, flags).unwrap() {
                Action::Done => return actions,
                action => actions.push(action),
            }
        }
    }

    fn tally(actions: impl IntoIterator<Item = Action>) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for action in actions {
            let key = match action {
                Action::Report { .. } => "report".to_string(),
                other => format!("{other:?}"),
            };
            *counts.entry(key).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn control_flags_combine() {
        let flags = ControlFlags::NO_CROSS_TRANSFER | ControlFlags::NO_FUNDS_FLOW;
        assert!(flags.contains(ControlFlags::NO_CROSS_TRANSFER));
        assert!(flags.contains(ControlFlags::NO_FUNDS_FLOW));
        assert!(!flags.contains(ControlFlags::NO_BANK_BALANCE));
        assert!(flags.contains(ControlFlags::NONE));
        assert_eq!(flags.bits(), 0b101);
    }

    #[test]
    fn same_seed_same_stream() {
        let scenario = small_scenario();
        let a = GeneratedActions::new(&scenario, 2, 42);
        let b = GeneratedActions::new(&scenario, 2, 42);
        assert_eq!(
            drain(&a, WorkerId(1), ControlFlags::NONE),
            drain(&b, WorkerId(1), ControlFlags::NONE)
        );
    }

    #[test]
    fn multiset_is_independent_of_worker_count() {
        let scenario = small_scenario();
        let single = GeneratedActions::new(&scenario, 1, 7);
        let expected = tally(drain(&single, WorkerId(0), ControlFlags::NONE));

        for workers in [2, 4, 8, 16] {
            let split = GeneratedActions::new(&scenario, workers, 7);
            let actions =
                (0..workers).flat_map(|w| drain(&split, WorkerId(w), ControlFlags::NONE));
            assert_eq!(tally(actions), expected, "workers = {workers}");
        }
    }

    #[test]
    fn every_worker_gets_the_same_number_of_reports() {
        let scenario = small_scenario();
        let source = GeneratedActions::new(&scenario, 4, 3);
        for worker in 0..4 {
            let reports = drain(&source, WorkerId(worker), ControlFlags::NONE)
                .into_iter()
                .filter(|a| matches!(a, Action::Report { .. }))
                .count();
            assert_eq!(reports, 4 * scenario.reports_per_stream);
        }
    }

    #[test]
    fn flags_restrict_generated_kinds() {
        let scenario = small_scenario();
        let flags = ControlFlags::NO_CROSS_TRANSFER
            | ControlFlags::NO_BANK_BALANCE
            | ControlFlags::NO_FUNDS_FLOW;
        let source = GeneratedActions::new(&scenario, 1, 11);
        let actions = drain(&source, WorkerId(0), flags);
        assert!(!actions.is_empty());
        for action in actions {
            match action {
                Action::Transfer { src, dst, .. } => assert!(src.is_same_branch(dst)),
                Action::BranchBalance { .. } | Action::Report { .. } => {}
                other => panic!("unexpected action {other:?}"),
            }
        }
    }

    #[test]
    fn uneven_command_count_is_generated_in_full() {
        let scenario = Scenario {
            commands: 1_000,
            reports_per_stream: 2,
            ..small_scenario()
        };
        let source = GeneratedActions::new(&scenario, 4, 5);
        let actions: Vec<Action> = (0..4)
            .flat_map(|w| drain(&source, WorkerId(w), ControlFlags::NONE))
            .collect();
        let reports = actions
            .iter()
            .filter(|a| matches!(a, Action::Report { .. }))
            .count();
        assert_eq!(reports, MAX_WORKERS * 2);
        assert_eq!(actions.len() - reports, 1_000);
    }

    #[test]
    fn exhausted_worker_keeps_getting_done() {
        let scenario = Scenario {
            commands: 0,
            reports_per_stream: 0,
            ..small_scenario()
        };
        let source = GeneratedActions::new(&scenario, 1, 1);
        assert_eq!(source.next_action(WorkerId(0), ControlFlags::NONE), Ok(Action::Done));
        assert_eq!(source.next_action(WorkerId(0), ControlFlags::NONE), Ok(Action::Done));
    }

    #[test]
    fn unknown_worker_is_an_error() {
        let source = GeneratedActions::new(&small_scenario(), 2, 1);
        assert_eq!(
            source.next_action(WorkerId(2), ControlFlags::NONE),
            Err(ActionError::WorkerOutOfRange(WorkerId(2)))
        );
    }

    #[test]
    fn scripted_actions_replay_in_order() {
        let a = AccountId::new(BranchId(0), 0);
        let b = AccountId::new(BranchId(1), 0);
        let script = vec![
            Action::Deposit { account: a, amount: 5 },
            Action::Transfer { src: a, dst: b, amount: 2 },
            Action::BranchBalance { branch: BranchId(1) },
            Action::BankBalance,
        ];
        let source = ScriptedActions::new(vec![script.clone()]);
        for expected in script {
            assert_eq!(source.next_action(WorkerId(0), ControlFlags::NONE), Ok(expected));
        }
        assert_eq!(source.next_action(WorkerId(0), ControlFlags::NONE), Ok(Action::Done));
    }

    #[test]
    fn parse_script_from_csv() {
        let csv = "kind,worker,account,dst,branch,amount\n\
                   deposit,0,4294967296,,,100\n\
                   transfer,1,4294967296,1,,30\n\
                   branch_balance,1,,,1,\n\
                   report,0,,,,\n";
        let source = ScriptedActions::from_csv(Cursor::new(csv), 2).unwrap();
        assert_eq!(source.workers(), 2);

        assert_eq!(
            source.next_action(WorkerId(0), ControlFlags::NONE),
            Ok(Action::Deposit {
                account: AccountId::new(BranchId(1), 0),
                amount: 100
            })
        );
        assert_eq!(
            source.next_action(WorkerId(0), ControlFlags::NONE),
            Ok(Action::Report { worker: WorkerId(0) })
        );
        assert_eq!(
            source.next_action(WorkerId(1), ControlFlags::NONE),
            Ok(Action::Transfer {
                src: AccountId::new(BranchId(1), 0),
                dst: AccountId(1),
                amount: 30
            })
        );
        assert_eq!(
            source.next_action(WorkerId(1), ControlFlags::NONE),
            Ok(Action::BranchBalance { branch: BranchId(1) })
        );
    }

    #[test]
    fn unknown_kind_surfaces_when_fetched() {
        let csv = "kind,worker,account,dst,branch,amount\naudit,0,,,,\n";
        let source = ScriptedActions::from_csv(Cursor::new(csv), 1).unwrap();
        assert_eq!(
            source.next_action(WorkerId(0), ControlFlags::NONE),
            Err(ActionError::UnknownAction("audit".into()))
        );
    }

    #[test]
    fn missing_amount_is_malformed() {
        let record = ActionRecord {
            account: Some(1),
            ..ActionRecord::new("deposit", 0)
        };
        assert_eq!(
            record.into_action(),
            Err(ActionError::UnknownAction("deposit".into()))
        );
    }

    #[test]
    fn script_row_for_missing_worker_is_rejected() {
        let csv = "kind,worker,account,dst,branch,amount\nbank_balance,3,,,,\n";
        assert!(matches!(
            ScriptedActions::from_csv(Cursor::new(csv), 2),
            Err(ActionError::WorkerOutOfRange(WorkerId(3)))
        ));
    }
}
