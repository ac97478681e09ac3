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

//! Teller operations: deposit, withdraw, transfer and balance queries.
//!
//! Two implementations of [`Ledger`] share the same semantics:
//!
//! - [`Teller`] works on a shared `&Bank` and follows the lock order
//!   documented in [`crate::bank`].
//! - [`Exclusive`] works on `&mut Bank` and takes no locks at all. It is the
//!   sequential oracle the concurrent run is checked against.
//!
//! | Operation | Guards taken by [`Teller`] |
//! |-----------|----------------------------|
//! | deposit / withdraw | account, then its branch |
//! | transfer, same branch | bank, then both accounts by id |
//! | transfer, cross branch | bank, both accounts by id, both branches by id |
//! | branch balance | that branch |
//! | bank balance | bank, then every branch by id |
//!
//! A transfer holds the bank-wide guard only for its acquisition phase. Once
//! all its account and branch guards are held it releases the bank guard and
//! mutates under the narrower guards.

use crate::account::{adjust, pair_mut};
use crate::bank::Bank;
use crate::base::{AccountId, Amount, BranchId};
use crate::error::LedgerError;
use tracing::trace;

/// Ledger operations as seen by a worker.
///
/// Amounts must be non-negative; a negative amount is a caller bug, checked
/// with `debug_assert!`. Failed operations change nothing.
pub trait Ledger {
    /// Credits `amount` to the account and its branch.
    fn deposit(&mut self, account: AccountId, amount: Amount) -> Result<(), LedgerError>;

    /// Debits `amount` if the balance covers it.
    fn withdraw(&mut self, account: AccountId, amount: Amount) -> Result<(), LedgerError>;

    /// Moves `amount` from `src` to `dst`. A transfer to the same account
    /// always succeeds and changes nothing.
    fn transfer(&mut self, src: AccountId, dst: AccountId, amount: Amount)
    -> Result<(), LedgerError>;

    fn branch_balance(&mut self, branch: BranchId) -> Result<Amount, LedgerError>;

    fn bank_balance(&mut self) -> Amount;

    fn bank(&self) -> &Bank;
}

/// Locking teller over a shared bank.
#[derive(Debug, Clone, Copy)]
pub struct Teller<'a> {
    bank: &'a Bank,
}

impl<'a> Teller<'a> {
    pub fn new(bank: &'a Bank) -> Self {
        Self { bank }
    }

    pub fn deposit(&self, id: AccountId, amount: Amount) -> Result<(), LedgerError> {
        debug_assert!(amount >= 0, "negative deposit amount {amount}");
        trace!(target: "ledger::teller", account = %id, amount, "deposit");

        let account = self.bank.account(id)?;
        let branch = self.bank.branch(id.branch())?;

        let mut balance = account.lock();
        self.bank.yield_policy().maybe_yield();
        let mut branch_balance = branch.lock();

        adjust(&mut balance, Some(&mut *branch_balance), amount);
        Ok(())
    }

    pub fn withdraw(&self, id: AccountId, amount: Amount) -> Result<(), LedgerError> {
        debug_assert!(amount >= 0, "negative withdraw amount {amount}");
        trace!(target: "ledger::teller", account = %id, amount, "withdraw");

        let account = self.bank.account(id)?;
        let branch = self.bank.branch(id.branch())?;

        let mut balance = account.lock();
        self.bank.yield_policy().maybe_yield();
        let mut branch_balance = branch.lock();

        if amount > *balance {
            return Err(LedgerError::InsufficientFunds);
        }
        self.bank.yield_policy().maybe_yield();
        adjust(&mut balance, Some(&mut *branch_balance), -amount);
        Ok(())
    }

    pub fn transfer(
        &self,
        src: AccountId,
        dst: AccountId,
        amount: Amount,
    ) -> Result<(), LedgerError> {
        debug_assert!(amount >= 0, "negative transfer amount {amount}");
        trace!(target: "ledger::teller", %src, %dst, amount, "transfer");

        let src_account = self.bank.account(src)?;
        let dst_account = self.bank.account(dst)?;
        if src == dst {
            return Ok(());
        }
        let src_branch = self.bank.branch(src.branch())?;
        let dst_branch = self.bank.branch(dst.branch())?;
        let policy = self.bank.yield_policy();

        // Acquisition phase. Accounts go in id order, never src/dst order,
        // then branches in id order.
        let acquisition = self.bank.lock();
        let update_branch = !src.is_same_branch(dst);
        let src_first = src < dst;

        let (first, second) = if src_first {
            (src_account, dst_account)
        } else {
            (dst_account, src_account)
        };
        let mut first_balance = first.lock();
        policy.maybe_yield();
        let mut second_balance = second.lock();

        let (mut low_branch, mut high_branch) = if update_branch {
            let (low, high) = if src.branch() < dst.branch() {
                (src_branch, dst_branch)
            } else {
                (dst_branch, src_branch)
            };
            let low = low.lock();
            policy.maybe_yield();
            let high = high.lock();
            (Some(low), Some(high))
        } else {
            (None, None)
        };
        drop(acquisition);
        policy.maybe_yield();

        let (src_balance, dst_balance) = if src_first {
            (&mut *first_balance, &mut *second_balance)
        } else {
            (&mut *second_balance, &mut *first_balance)
        };

        if amount > *src_balance {
            return Err(LedgerError::InsufficientFunds);
        }

        match (low_branch.as_deref_mut(), high_branch.as_deref_mut()) {
            (Some(low), Some(high)) => {
                let (src_cache, dst_cache) = if src.branch() < dst.branch() {
                    (low, high)
                } else {
                    (high, low)
                };
                adjust(src_balance, Some(src_cache), -amount);
                adjust(dst_balance, Some(dst_cache), amount);
            }
            _ => {
                adjust(src_balance, None, -amount);
                adjust(dst_balance, None, amount);
            }
        }
        Ok(())
    }
}

impl Ledger for Teller<'_> {
    fn deposit(&mut self, account: AccountId, amount: Amount) -> Result<(), LedgerError> {
        Teller::deposit(self, account, amount)
    }

    fn withdraw(&mut self, account: AccountId, amount: Amount) -> Result<(), LedgerError> {
        Teller::withdraw(self, account, amount)
    }

    fn transfer(
        &mut self,
        src: AccountId,
        dst: AccountId,
        amount: Amount,
    ) -> Result<(), LedgerError> {
        Teller::transfer(self, src, dst, amount)
    }

    fn branch_balance(&mut self, branch: BranchId) -> Result<Amount, LedgerError> {
        self.bank.branch_balance(branch)
    }

    fn bank_balance(&mut self) -> Amount {
        self.bank.bank_balance()
    }

    fn bank(&self) -> &Bank {
        self.bank
    }
}

/// Lock-free ledger over an exclusively borrowed bank.
#[derive(Debug)]
pub struct Exclusive<'a> {
    bank: &'a mut Bank,
}

impl<'a> Exclusive<'a> {
    pub fn new(bank: &'a mut Bank) -> Self {
        Self { bank }
    }
}

impl Ledger for Exclusive<'_> {
    fn deposit(&mut self, id: AccountId, amount: Amount) -> Result<(), LedgerError> {
        debug_assert!(amount >= 0, "negative deposit amount {amount}");
        let (balance, cache) = self
            .bank
            .branch_mut(id.branch())
            .ok()
            .and_then(|branch| branch.split_mut(id.index()))
            .ok_or(LedgerError::AccountNotFound(id))?;
        adjust(balance, Some(cache), amount);
        Ok(())
    }

    fn withdraw(&mut self, id: AccountId, amount: Amount) -> Result<(), LedgerError> {
        debug_assert!(amount >= 0, "negative withdraw amount {amount}");
        let (balance, cache) = self
            .bank
            .branch_mut(id.branch())
            .ok()
            .and_then(|branch| branch.split_mut(id.index()))
            .ok_or(LedgerError::AccountNotFound(id))?;
        if amount > *balance {
            return Err(LedgerError::InsufficientFunds);
        }
        adjust(balance, Some(cache), -amount);
        Ok(())
    }

    fn transfer(
        &mut self,
        src: AccountId,
        dst: AccountId,
        amount: Amount,
    ) -> Result<(), LedgerError> {
        debug_assert!(amount >= 0, "negative transfer amount {amount}");
        self.bank.account(src)?;
        self.bank.account(dst)?;
        if src == dst {
            return Ok(());
        }

        if src.is_same_branch(dst) {
            let branch = self.bank.branch_mut(src.branch())?;
            let (src_balance, dst_balance) = branch
                .pair_mut(src.index(), dst.index())
                .ok_or(LedgerError::AccountNotFound(src))?;
            if amount > *src_balance {
                return Err(LedgerError::InsufficientFunds);
            }
            adjust(src_balance, None, -amount);
            adjust(dst_balance, None, amount);
        } else {
            let (src_branch, dst_branch) = pair_mut(
                self.bank.branches_mut(),
                src.branch().0 as usize,
                dst.branch().0 as usize,
            )
            .ok_or(LedgerError::AccountNotFound(src))?;
            let (src_balance, src_cache) = src_branch
                .split_mut(src.index())
                .ok_or(LedgerError::AccountNotFound(src))?;
            let (dst_balance, dst_cache) = dst_branch
                .split_mut(dst.index())
                .ok_or(LedgerError::AccountNotFound(dst))?;
            if amount > *src_balance {
                return Err(LedgerError::InsufficientFunds);
            }
            adjust(src_balance, Some(src_cache), -amount);
            adjust(dst_balance, Some(dst_cache), amount);
        }
        Ok(())
    }

    fn branch_balance(&mut self, branch: BranchId) -> Result<Amount, LedgerError> {
        Ok(*self.bank.branch_mut(branch)?.balance_mut())
    }

    fn bank_balance(&mut self) -> Amount {
        self.bank
            .branches_mut()
            .iter_mut()
            .map(|branch| *branch.balance_mut())
            .sum()
    }

    fn bank(&self) -> &Bank {
        self.bank
    }
}
