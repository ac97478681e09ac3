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

//! The bank: a fixed set of branches and the bank-wide guard.
//!
//! The topology never changes after construction, so looking up an account
//! or a branch takes no lock. Only balances are guarded.
//!
//! # Lock order
//!
//! Every operation acquires guards in this global order, which is what keeps
//! the ledger deadlock free:
//!
//! 1. the bank-wide guard
//! 2. account guards, by increasing [`AccountId`]
//! 3. branch guards, by increasing [`BranchId`]
//!
//! Operations may skip levels but never go back up.

use crate::account::{Account, Branch};
use crate::base::{AccountId, Amount, BranchId};
use crate::config::YieldPolicy;
use crate::error::{CompareMismatch, LedgerError};
use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug)]
pub struct Bank {
    branches: Vec<Branch>,
    /// Cut point for transfer acquisition phases and whole-bank snapshots.
    /// Protects no data of its own.
    guard: Mutex<()>,
    yield_policy: YieldPolicy,
}

impl Bank {
    /// Builds `branches` branches of `accounts_per_branch` accounts, each
    /// starting at `initial`.
    pub fn new(branches: u32, accounts_per_branch: u32, initial: Amount) -> Self {
        let balances = vec![vec![initial; accounts_per_branch as usize]; branches as usize];
        Self::from_balances(&balances)
    }

    /// Builds a bank where account `j` of branch `i` starts at `balances[i][j]`.
    ///
    /// # Panics
    ///
    /// Panics if there are more branches, or more accounts in one branch,
    /// than a `u32` id can address.
    pub fn from_balances(balances: &[Vec<Amount>]) -> Self {
        assert!(
            u32::try_from(balances.len()).is_ok(),
            "more branches than a branch id can index"
        );
        let branches = balances
            .iter()
            .zip(0u32..)
            .map(|(accounts, id)| Branch::new(BranchId(id), accounts))
            .collect();
        Self {
            branches,
            guard: Mutex::new(()),
            yield_policy: YieldPolicy::NEVER,
        }
    }

    pub fn with_yield_policy(mut self, yield_policy: YieldPolicy) -> Self {
        self.yield_policy = yield_policy;
        self
    }

    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    pub fn num_accounts(&self) -> usize {
        self.branches.iter().map(|b| b.accounts().len()).sum()
    }

    pub fn branch(&self, id: BranchId) -> Result<&Branch, LedgerError> {
        self.branches
            .get(id.0 as usize)
            .ok_or(LedgerError::BranchNotFound(id))
    }

    pub fn account(&self, id: AccountId) -> Result<&Account, LedgerError> {
        self.branches
            .get(id.branch().0 as usize)
            .and_then(|branch| branch.account(id.index()))
            .ok_or(LedgerError::AccountNotFound(id))
    }

    /// Locks the account and reads its balance.
    pub fn account_balance(&self, id: AccountId) -> Result<Amount, LedgerError> {
        Ok(self.account(id)?.balance())
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ()> {
        self.guard.lock()
    }

    pub(crate) fn yield_policy(&self) -> &YieldPolicy {
        &self.yield_policy
    }

    pub(crate) fn branch_mut(&mut self, id: BranchId) -> Result<&mut Branch, LedgerError> {
        self.branches
            .get_mut(id.0 as usize)
            .ok_or(LedgerError::BranchNotFound(id))
    }

    pub(crate) fn branches_mut(&mut self) -> &mut [Branch] {
        &mut self.branches
    }

    // =========================================================================
    // Aggregates
    // =========================================================================

    /// Returns the cached balance of one branch. Never sums accounts.
    pub fn branch_balance(&self, id: BranchId) -> Result<Amount, LedgerError> {
        let balance = self.branch(id)?.balance();
        debug!(target: "ledger::balance", branch = %id, balance, "branch balance");
        Ok(balance)
    }

    /// Returns the sum of every account balance at a single instant.
    ///
    /// Takes the bank-wide guard first, so no transfer is in its acquisition
    /// phase, then holds every branch guard at once while summing. Branch
    /// caches only move under their guard, so the sum cannot be torn.
    pub fn bank_balance(&self) -> Amount {
        let _bank = self.lock();
        let guards: Vec<MutexGuard<'_, Amount>> = self
            .branches
            .iter()
            .map(|branch| {
                let guard = branch.lock();
                self.yield_policy.maybe_yield();
                guard
            })
            .collect();
        let balance: Amount = guards.iter().map(|guard| **guard).sum();
        debug!(target: "ledger::balance", balance, "bank balance");
        balance
    }

    /// Compares two banks account by account and branch by branch.
    ///
    /// Used after a run to check the concurrent bank against a sequential
    /// replay of the same workload. An empty result means they agree.
    pub fn compare(&self, other: &Bank) -> Vec<CompareMismatch> {
        let same_shape = self.branches.len() == other.branches.len()
            && self
                .branches
                .iter()
                .zip(&other.branches)
                .all(|(a, b)| a.accounts().len() == b.accounts().len());
        if !same_shape {
            return vec![CompareMismatch::Topology];
        }

        let mut mismatches = Vec::new();
        for (ours, theirs) in self.branches.iter().zip(&other.branches) {
            for (a, b) in ours.accounts().iter().zip(theirs.accounts()) {
                let (left, right) = (a.balance(), b.balance());
                if left != right {
                    mismatches.push(CompareMismatch::Account {
                        account: a.id(),
                        left,
                        right,
                    });
                }
            }
            let (left, right) = (ours.balance(), theirs.balance());
            if left != right {
                mismatches.push(CompareMismatch::Branch {
                    branch: ours.id(),
                    left,
                    right,
                });
            }
        }
        mismatches
    }
}
