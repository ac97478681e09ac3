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

//! # Branch Ledger
//!
//! A concurrent banking ledger: a fixed set of branches, each holding a fixed
//! set of accounts, mutated by many worker threads at once.
//!
//! ## Core Components
//!
//! - [`Bank`]: Branches, accounts and the bank-wide guard, plus the
//!   branch and bank balance aggregates
//! - [`Teller`]: Deposit, withdraw and transfer under a global lock order
//! - [`ReportBarrier`]: Reusable rendezvous that quiesces every worker for a
//!   report
//! - [`run_concurrent`] / [`run_sequential`]: Drive an [`ActionSource`]
//!   through the ledger on many threads or on one
//!
//! ## Example
//!
//! ```
//! use branch_ledger::{AccountId, Bank, BranchId, LedgerError, Teller};
//!
//! let bank = Bank::new(2, 4, 100);
//! let teller = Teller::new(&bank);
//!
//! let alice = AccountId::new(BranchId(0), 1);
//! let bob = AccountId::new(BranchId(1), 3);
//!
//! teller.transfer(alice, bob, 40).unwrap();
//! assert_eq!(bank.branch_balance(BranchId(0)), Ok(360));
//! assert_eq!(bank.branch_balance(BranchId(1)), Ok(440));
//!
//! // A failed operation changes nothing.
//! assert_eq!(teller.withdraw(alice, 61), Err(LedgerError::InsufficientFunds));
//! assert_eq!(bank.bank_balance(), 800);
//! ```
//!
//! ## Thread Safety
//!
//! Every balance has its own guard. Operations acquire guards in the global
//! order documented in [`bank`], so any mix of operations from any number of
//! threads is deadlock free.

pub mod account;
pub mod action;
pub mod bank;
mod barrier;
mod base;
pub mod config;
pub mod error;
pub mod report;
mod teller;
pub mod worker;

pub use account::{Account, Branch};
pub use action::{Action, ActionSource, ControlFlags, GeneratedActions, ScriptedActions};
pub use bank::Bank;
pub use barrier::ReportBarrier;
pub use base::{AccountId, Amount, BranchId, WorkerId};
pub use config::{RunOptions, Scenario, YieldPolicy};
pub use error::{ActionError, CompareMismatch, ConfigError, LedgerError, ReportError};
pub use report::{Report, Reporter};
pub use teller::{Exclusive, Ledger, Teller};
pub use worker::{RunSummary, WorkerConfig, WorkerOutcome, WorkerStats, run_concurrent, run_sequential};
