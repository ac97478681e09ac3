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

//! Error types for ledger operations, action sources, reports and configuration.

use crate::base::{AccountId, Amount, BranchId, WorkerId};
use thiserror::Error;

/// Teller and aggregate operation errors.
///
/// A failed operation never leaves a partial mutation behind.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// No account with this identifier exists in the bank
    #[error("account {0} not found")]
    AccountNotFound(AccountId),

    /// No branch with this identifier exists in the bank
    #[error("branch {0} not found")]
    BranchNotFound(BranchId),

    /// Debit would take the balance below the permitted minimum
    #[error("insufficient funds")]
    InsufficientFunds,
}

/// Errors raised while fetching the next action for a worker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// The action record carried a tag the dispatcher does not know
    #[error("unknown action '{0}'")]
    UnknownAction(String),

    /// The worker index is outside the range the source was built for
    #[error("worker {0} out of range")]
    WorkerOutOfRange(WorkerId),

    /// The action script could not be read
    #[error("malformed action script: {0}")]
    Csv(String),
}

impl From<csv::Error> for ActionError {
    fn from(err: csv::Error) -> Self {
        ActionError::Csv(err.to_string())
    }
}

/// Report generation failures. Workers log these and carry on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReportError {
    /// Branch balance does not match the previous report plus recorded flows
    #[error("branch {branch} balance {actual} != expected {expected}")]
    Inconsistent {
        branch: BranchId,
        expected: Amount,
        actual: Amount,
    },

    /// Writing the report failed
    #[error("report output failed: {0}")]
    Csv(String),
}

impl From<csv::Error> for ReportError {
    fn from(err: csv::Error) -> Self {
        ReportError::Csv(err.to_string())
    }
}

/// Invalid run configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("number of workers must be 1, 2, 4, 8 or 16 (got {0})")]
    UnsupportedWorkerCount(usize),

    #[error("yield percentage must be 0-100 (got {0})")]
    InvalidYieldPercent(u8),

    #[error("unknown test run {0} (expected 1-7)")]
    UnknownTestRun(u32),
}

/// A difference found when comparing two banks after a run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompareMismatch {
    #[error("banks have different shapes")]
    Topology,

    #[error("account {account} balance {left} != {right}")]
    Account {
        account: AccountId,
        left: Amount,
        right: Amount,
    },

    #[error("branch {branch} balance {left} != {right}")]
    Branch {
        branch: BranchId,
        left: Amount,
        right: Amount,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let id = AccountId::new(BranchId(1), 2);
        assert_eq!(
            LedgerError::AccountNotFound(id).to_string(),
            "account 0x100000002 not found"
        );
        assert_eq!(
            LedgerError::BranchNotFound(BranchId(9)).to_string(),
            "branch 9 not found"
        );
        assert_eq!(LedgerError::InsufficientFunds.to_string(), "insufficient funds");
        assert_eq!(
            ActionError::UnknownAction("audit".into()).to_string(),
            "unknown action 'audit'"
        );
        assert_eq!(
            ReportError::Inconsistent {
                branch: BranchId(0),
                expected: 10,
                actual: 12
            }
            .to_string(),
            "branch 0 balance 12 != expected 10"
        );
        assert_eq!(
            ConfigError::UnsupportedWorkerCount(3).to_string(),
            "number of workers must be 1, 2, 4, 8 or 16 (got 3)"
        );
    }

    #[test]
    fn errors_are_cloneable() {
        let error = LedgerError::InsufficientFunds;
        let cloned = error.clone();
        assert_eq!(error, cloned);
    }
}
