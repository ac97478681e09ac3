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

//! Core identifier types for branches, accounts and workers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Monetary amount in minor units (cents). Balances are signed so that
/// deliberately inconsistent test banks can start below zero.
pub type Amount = i64;

/// Identifier of a branch. Equal to the branch's position in the bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct BranchId(pub u32);

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for an account.
///
/// The owning branch lives in the upper 32 bits and the account's index
/// inside that branch in the lower 32 bits, so ordering by `AccountId` is
/// branch-major. The teller relies on this when it orders lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct AccountId(pub u64);

impl AccountId {
    const BRANCH_SHIFT: u32 = 32;
    const INDEX_MASK: u64 = 0xFFFF_FFFF;

    pub const fn new(branch: BranchId, index: u32) -> Self {
        Self(((branch.0 as u64) << Self::BRANCH_SHIFT) | index as u64)
    }

    pub const fn branch(self) -> BranchId {
        BranchId((self.0 >> Self::BRANCH_SHIFT) as u32)
    }

    /// Position of the account inside its branch.
    pub const fn index(self) -> u32 {
        (self.0 & Self::INDEX_MASK) as u32
    }

    pub const fn is_same_branch(self, other: AccountId) -> bool {
        self.0 >> Self::BRANCH_SHIFT == other.0 >> Self::BRANCH_SHIFT
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Index of a worker thread, `0..workers`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
