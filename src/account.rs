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

//! Account and branch balance cells.
//!
//! Neither type exposes a mutating method that takes its own guard. Mutation
//! goes through [`adjust`], which takes balances the caller has already
//! locked (or borrowed exclusively), so the lock order stays in one place:
//! the teller.
//!
//! # Example
//!
//! ```
//! use branch_ledger::{Account, AccountId, BranchId};
//!
//! let account = Account::new(AccountId::new(BranchId(0), 1), 500);
//! assert_eq!(account.balance(), 500);
//! ```

use crate::base::{AccountId, Amount, BranchId};
use parking_lot::{Mutex, MutexGuard};

/// A single balance cell with its own guard.
#[derive(Debug)]
pub struct Account {
    id: AccountId,
    balance: Mutex<Amount>,
}

impl Account {
    pub fn new(id: AccountId, balance: Amount) -> Self {
        Self {
            id,
            balance: Mutex::new(balance),
        }
    }

    pub fn id(&self) -> AccountId {
        self.id
    }

    /// Locks the account and reads its balance.
    pub fn balance(&self) -> Amount {
        *self.balance.lock()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Amount> {
        self.balance.lock()
    }
}

/// A fixed set of accounts plus a cached sum of their balances.
///
/// The cache has its own guard, distinct from every account guard, and is
/// kept in step incrementally by [`adjust`].
#[derive(Debug)]
pub struct Branch {
    id: BranchId,
    accounts: Vec<Account>,
    balance: Mutex<Amount>,
}

impl Branch {
    /// Builds a branch whose account `i` starts with `balances[i]`.
    ///
    /// # Panics
    ///
    /// Panics if there are more accounts than a `u32` index can address.
    pub fn new(id: BranchId, balances: &[Amount]) -> Self {
        assert!(
            u32::try_from(balances.len()).is_ok(),
            "branch {id} has more accounts than an account id can index"
        );
        let accounts = balances
            .iter()
            .zip(0u32..)
            .map(|(&balance, index)| Account::new(AccountId::new(id, index), balance))
            .collect();
        Self {
            id,
            accounts,
            balance: Mutex::new(balances.iter().sum()),
        }
    }

    pub fn id(&self) -> BranchId {
        self.id
    }

    pub fn accounts(&self) -> &[Account] {
        &self.accounts
    }

    pub fn account(&self, index: u32) -> Option<&Account> {
        self.accounts.get(index as usize)
    }

    /// Locks the branch and reads the cached balance.
    pub fn balance(&self) -> Amount {
        *self.balance.lock()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Amount> {
        self.balance.lock()
    }

    pub(crate) fn balance_mut(&mut self) -> &mut Amount {
        self.balance.get_mut()
    }

    /// Borrows one account balance together with the branch cache.
    pub(crate) fn split_mut(&mut self, index: u32) -> Option<(&mut Amount, &mut Amount)> {
        let account = self.accounts.get_mut(index as usize)?;
        Some((account.balance.get_mut(), self.balance.get_mut()))
    }

    /// Borrows two distinct account balances of this branch.
    pub(crate) fn pair_mut(&mut self, a: u32, b: u32) -> Option<(&mut Amount, &mut Amount)> {
        let (first, second) = pair_mut(&mut self.accounts, a as usize, b as usize)?;
        Some((first.balance.get_mut(), second.balance.get_mut()))
    }
}

/// Applies `delta` to an account and, when given, to its branch cache.
///
/// The caller must already hold both guards (or exclusive borrows). The
/// branch is skipped for an intra-branch transfer whose legs cancel out.
pub(crate) fn adjust(balance: &mut Amount, branch_balance: Option<&mut Amount>, delta: Amount) {
    *balance += delta;
    if let Some(branch_balance) = branch_balance {
        *branch_balance += delta;
    }
}

/// Mutable references to two distinct slots of a slice.
pub(crate) fn pair_mut<T>(items: &mut [T], a: usize, b: usize) -> Option<(&mut T, &mut T)> {
    if a == b || a >= items.len() || b >= items.len() {
        return None;
    }
    if a < b {
        let (head, tail) = items.split_at_mut(b);
        Some((&mut head[a], &mut tail[0]))
    } else {
        let (head, tail) = items.split_at_mut(a);
        Some((&mut tail[0], &mut head[b]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_cache_starts_at_sum_of_accounts() {
        let branch = Branch::new(BranchId(2), &[10, 20, -5]);
        assert_eq!(branch.balance(), 25);
        assert_eq!(branch.accounts().len(), 3);
        assert_eq!(branch.accounts()[1].id(), AccountId::new(BranchId(2), 1));
    }

    #[test]
    fn adjust_updates_branch_only_when_asked() {
        let mut account = 100;
        let mut branch = 1_000;

        adjust(&mut account, Some(&mut branch), -40);
        assert_eq!((account, branch), (60, 960));

        adjust(&mut account, None, 15);
        assert_eq!((account, branch), (75, 960));
    }

    #[test]
    fn split_mut_reaches_account_and_cache() {
        let mut branch = Branch::new(BranchId(0), &[5, 6]);
        let (account, cache) = branch.split_mut(1).unwrap();
        adjust(account, Some(cache), 4);
        assert_eq!(branch.accounts()[1].balance(), 10);
        assert_eq!(branch.balance(), 15);
        assert!(branch.split_mut(2).is_none());
    }

    #[test]
    fn pair_mut_preserves_argument_order() {
        let mut items = [1, 2, 3, 4];
        let (a, b) = pair_mut(&mut items, 3, 1).unwrap();
        assert_eq!((*a, *b), (4, 2));
        *a = 40;
        *b = 20;
        assert_eq!(items, [1, 20, 3, 40]);
    }

    #[test]
    fn pair_mut_rejects_aliasing_and_out_of_range() {
        let mut items = [1, 2];
        assert!(pair_mut(&mut items, 1, 1).is_none());
        assert!(pair_mut(&mut items, 0, 2).is_none());
    }
}
