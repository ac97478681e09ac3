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

//! Worker threads and the dispatch loop.
//!
//! Every worker repeatedly fetches its next action and dispatches it to the
//! teller, the aggregates or the report barrier. Ledger errors are counted
//! and the worker carries on; only [`Action::Done`] or a fetch error ends
//! the loop.
//!
//! [`run_concurrent`] drives one OS thread per worker over a shared bank.
//! [`run_sequential`] runs the identical loop on one thread over an
//! exclusively borrowed bank, without any locking, and serves as the oracle
//! the concurrent result is compared against.

use crate::action::{Action, ActionSource, ControlFlags};
use crate::bank::Bank;
use crate::barrier::ReportBarrier;
use crate::base::{Amount, WorkerId};
use crate::error::{ActionError, LedgerError};
use crate::report::Reporter;
use crate::teller::{Exclusive, Ledger, Teller};
use std::io;
use std::ops::AddAssign;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Per-worker operation counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub deposits: u64,
    pub withdrawals: u64,
    pub transfers: u64,
    pub branch_balances: u64,
    pub bank_balances: u64,
    /// Report actions this worker took part in.
    pub reports: u64,
    /// Reports this worker produced as the last arrival.
    pub reports_produced: u64,
    pub report_failures: u64,
    pub insufficient_funds: u64,
    pub not_found: u64,
    /// Bank-balance queries that disagreed with the expected total.
    pub balance_errors: u64,
}

impl AddAssign for WorkerStats {
    fn add_assign(&mut self, rhs: WorkerStats) {
        self.deposits += rhs.deposits;
        self.withdrawals += rhs.withdrawals;
        self.transfers += rhs.transfers;
        self.branch_balances += rhs.branch_balances;
        self.bank_balances += rhs.bank_balances;
        self.reports += rhs.reports;
        self.reports_produced += rhs.reports_produced;
        self.report_failures += rhs.report_failures;
        self.insufficient_funds += rhs.insufficient_funds;
        self.not_found += rhs.not_found;
        self.balance_errors += rhs.balance_errors;
    }
}

/// How one worker's loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOutcome {
    pub worker: WorkerId,
    pub stats: WorkerStats,
    /// Set when the loop stopped on a fetch error rather than [`Action::Done`].
    pub error: Option<ActionError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub outcomes: Vec<WorkerOutcome>,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn total(&self) -> WorkerStats {
        let mut total = WorkerStats::default();
        for outcome in &self.outcomes {
            total += outcome.stats;
        }
        total
    }

    pub fn errors(&self) -> impl Iterator<Item = &ActionError> {
        self.outcomes.iter().filter_map(|o| o.error.as_ref())
    }
}

/// Settings shared by every worker in a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerConfig {
    pub flags: ControlFlags,
    /// When set, every bank-balance query is checked against this total.
    pub expected_bank_balance: Option<Amount>,
}

/// Where report actions go.
#[derive(Clone, Copy)]
enum Rendezvous<'a> {
    /// Report immediately; there is nobody to wait for.
    Direct,
    Barrier(&'a ReportBarrier),
}

/// Leaves the barrier when a worker thread ends, by return or by panic.
struct Departure<'a> {
    barrier: &'a ReportBarrier,
    worker: WorkerId,
}

impl Drop for Departure<'_> {
    fn drop(&mut self) {
        self.barrier.leave(self.worker);
    }
}

fn count_failure(stats: &mut WorkerStats, worker: WorkerId, err: LedgerError) {
    debug!(target: "ledger::worker", %worker, %err, "operation failed");
    match err {
        LedgerError::InsufficientFunds => stats.insufficient_funds += 1,
        LedgerError::AccountNotFound(_) | LedgerError::BranchNotFound(_) => stats.not_found += 1,
    }
}

fn produce_report<R>(reporter: &R, bank: &Bank, requested_by: WorkerId, stats: &mut WorkerStats)
where
    R: Reporter + ?Sized,
{
    stats.reports_produced += 1;
    if let Err(err) = reporter.render_report(bank, requested_by) {
        // Masked: a failed report never aborts the barrier protocol.
        warn!(target: "ledger::report", worker = %requested_by, %err, "report failed");
        stats.report_failures += 1;
    }
}

/// The dispatch loop shared by the concurrent and sequential runners.
fn work<L, S, R>(
    ledger: &mut L,
    worker: WorkerId,
    source: &S,
    reporter: &R,
    rendezvous: Rendezvous<'_>,
    config: &WorkerConfig,
) -> WorkerOutcome
where
    L: Ledger,
    S: ActionSource + ?Sized,
    R: Reporter + ?Sized,
{
    debug!(target: "ledger::worker", %worker, "starting");
    let mut stats = WorkerStats::default();

    let error = loop {
        let action = match source.next_action(worker, config.flags) {
            Ok(action) => action,
            Err(err) => {
                error!(target: "ledger::worker", %worker, %err, "cannot fetch next action");
                break Some(err);
            }
        };

        match action {
            Action::Done => break None,
            Action::Deposit { account, amount } => {
                stats.deposits += 1;
                match ledger.deposit(account, amount) {
                    Ok(()) => reporter.record_transfer(worker, account, amount),
                    Err(err) => count_failure(&mut stats, worker, err),
                }
            }
            Action::Withdraw { account, amount } => {
                stats.withdrawals += 1;
                match ledger.withdraw(account, amount) {
                    Ok(()) => reporter.record_transfer(worker, account, -amount),
                    Err(err) => count_failure(&mut stats, worker, err),
                }
            }
            Action::Transfer { src, dst, amount } => {
                stats.transfers += 1;
                match ledger.transfer(src, dst, amount) {
                    Ok(()) => {
                        reporter.record_transfer(worker, src, -amount);
                        reporter.record_transfer(worker, dst, amount);
                    }
                    Err(err) => count_failure(&mut stats, worker, err),
                }
            }
            Action::BranchBalance { branch } => {
                stats.branch_balances += 1;
                if let Err(err) = ledger.branch_balance(branch) {
                    count_failure(&mut stats, worker, err);
                }
            }
            Action::BankBalance => {
                stats.bank_balances += 1;
                let balance = ledger.bank_balance();
                if let Some(expected) = config.expected_bank_balance {
                    if balance != expected {
                        warn!(
                            target: "ledger::worker",
                            %worker, balance, expected, "bank balance incorrect"
                        );
                        stats.balance_errors += 1;
                    }
                }
            }
            Action::Report { worker: requested_by } => {
                stats.reports += 1;
                match rendezvous {
                    Rendezvous::Direct => {
                        produce_report(reporter, ledger.bank(), requested_by, &mut stats)
                    }
                    Rendezvous::Barrier(barrier) => {
                        barrier.arrive(worker, || {
                            produce_report(reporter, ledger.bank(), requested_by, &mut stats)
                        });
                    }
                }
            }
        }
    };

    debug!(target: "ledger::worker", %worker, ?stats, "exiting");
    WorkerOutcome {
        worker,
        stats,
        error,
    }
}

/// Runs `workers` threads against the shared bank until every one of them
/// sees [`Action::Done`] or fails to fetch.
///
/// Report actions rendezvous on a [`ReportBarrier`]. A worker whose loop
/// ends leaves the barrier, so the remaining workers' reports still complete.
///
/// # Errors
///
/// Returns an error if a worker thread cannot be spawned.
///
/// # Panics
///
/// Re-raises the panic of any worker thread that panicked.
pub fn run_concurrent<S, R>(
    bank: &Arc<Bank>,
    workers: usize,
    source: &Arc<S>,
    reporter: &Arc<R>,
    config: WorkerConfig,
) -> io::Result<RunSummary>
where
    S: ActionSource + ?Sized + 'static,
    R: Reporter + ?Sized + 'static,
{
    let start = Instant::now();
    let barrier = Arc::new(ReportBarrier::new(workers));

    let mut handles = Vec::with_capacity(workers);
    for w in 0..workers {
        let bank = Arc::clone(bank);
        let source = Arc::clone(source);
        let reporter = Arc::clone(reporter);
        let rendezvous = Arc::clone(&barrier);

        let spawned = thread::Builder::new()
            .name(format!("worker-{w}"))
            .spawn(move || {
                let _departure = Departure {
                    barrier: &rendezvous,
                    worker: WorkerId(w),
                };
                let mut teller = Teller::new(&bank);
                work(
                    &mut teller,
                    WorkerId(w),
                    &*source,
                    &*reporter,
                    Rendezvous::Barrier(&rendezvous),
                    &config,
                )
            });
        match spawned {
            Ok(handle) => handles.push(handle),
            Err(err) => {
                // Workers already running must not wait for the missing ones.
                for missing in w..workers {
                    barrier.leave(WorkerId(missing));
                }
                for handle in handles {
                    let _ = handle.join();
                }
                return Err(err);
            }
        }
    }

    let outcomes = handles
        .into_iter()
        .map(|handle| handle.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
        .collect();

    let summary = RunSummary {
        outcomes,
        elapsed: start.elapsed(),
    };
    info!(
        target: "ledger::worker",
        workers,
        elapsed_ms = summary.elapsed.as_millis() as u64,
        rounds = barrier.rounds(),
        "concurrent run finished"
    );
    Ok(summary)
}

/// Runs the whole workload on the calling thread as worker 0, without
/// locking. The source must have been built for a single worker.
pub fn run_sequential<S, R>(
    bank: &mut Bank,
    source: &S,
    reporter: &R,
    config: WorkerConfig,
) -> RunSummary
where
    S: ActionSource + ?Sized,
    R: Reporter + ?Sized,
{
    let start = Instant::now();
    let mut ledger = Exclusive::new(bank);
    let outcome = work(
        &mut ledger,
        WorkerId(0),
        source,
        reporter,
        Rendezvous::Direct,
        &config,
    );
    let summary = RunSummary {
        outcomes: vec![outcome],
        elapsed: start.elapsed(),
    };
    info!(
        target: "ledger::worker",
        elapsed_ms = summary.elapsed.as_millis() as u64,
        "sequential run finished"
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ScriptedActions;
    use crate::base::{AccountId, BranchId};
    use crate::error::ReportError;

    /// Reporter that only counts.
    #[derive(Default)]
    struct Tally {
        recorded: parking_lot::Mutex<Vec<(WorkerId, AccountId, Amount)>>,
        rendered: std::sync::atomic::AtomicU64,
        fail: bool,
    }

    impl Reporter for Tally {
        fn record_transfer(&self, worker: WorkerId, account: AccountId, delta: Amount) {
            self.recorded.lock().push((worker, account, delta));
        }

        fn render_report(&self, _bank: &Bank, _worker: WorkerId) -> Result<(), ReportError> {
            self.rendered
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if self.fail {
                return Err(ReportError::Csv("disk full".into()));
            }
            Ok(())
        }
    }

    fn id(branch: u32, index: u32) -> AccountId {
        AccountId::new(BranchId(branch), index)
    }

    #[test]
    fn sequential_dispatch_counts_every_kind() {
        let mut bank = Bank::new(2, 2, 100);
        let source = ScriptedActions::new(vec![vec![
            Action::Deposit { account: id(0, 0), amount: 10 },
            Action::Withdraw { account: id(0, 1), amount: 500 },
            Action::Transfer { src: id(0, 0), dst: id(1, 1), amount: 60 },
            Action::Transfer { src: id(0, 0), dst: id(9, 9), amount: 1 },
            Action::BranchBalance { branch: BranchId(1) },
            Action::BankBalance,
            Action::Report { worker: WorkerId(0) },
        ]]);
        let tally = Tally::default();

        let summary = run_sequential(&mut bank, &source, &tally, WorkerConfig::default());
        let stats = summary.total();

        assert_eq!(stats.deposits, 1);
        assert_eq!(stats.withdrawals, 1);
        assert_eq!(stats.transfers, 2);
        assert_eq!(stats.branch_balances, 1);
        assert_eq!(stats.bank_balances, 1);
        assert_eq!(stats.reports, 1);
        assert_eq!(stats.reports_produced, 1);
        assert_eq!(stats.insufficient_funds, 1);
        assert_eq!(stats.not_found, 1);
        assert!(summary.errors().next().is_none());

        assert_eq!(
            *tally.recorded.lock(),
            vec![
                (WorkerId(0), id(0, 0), 10),
                (WorkerId(0), id(0, 0), -60),
                (WorkerId(0), id(1, 1), 60),
            ]
        );
        assert_eq!(bank.account_balance(id(0, 0)), Ok(50));
        assert_eq!(bank.account_balance(id(1, 1)), Ok(160));
        assert_eq!(bank.bank_balance(), 410);
    }

    #[test]
    fn report_failure_is_masked() {
        let mut bank = Bank::new(1, 1, 0);
        let source = ScriptedActions::new(vec![vec![
            Action::Report { worker: WorkerId(0) },
            Action::Deposit { account: id(0, 0), amount: 1 },
        ]]);
        let tally = Tally {
            fail: true,
            ..Tally::default()
        };

        let summary = run_sequential(&mut bank, &source, &tally, WorkerConfig::default());
        assert_eq!(summary.total().report_failures, 1);
        assert_eq!(summary.total().deposits, 1);
        assert_eq!(bank.bank_balance(), 1);
    }

    #[test]
    fn bank_balance_check_counts_errors() {
        let mut bank = Bank::new(1, 2, 10);
        let source = ScriptedActions::new(vec![vec![
            Action::BankBalance,
            Action::Deposit { account: id(0, 0), amount: 1 },
            Action::BankBalance,
        ]]);
        let config = WorkerConfig {
            expected_bank_balance: Some(20),
            ..WorkerConfig::default()
        };
        let summary = run_sequential(&mut bank, &source, &Tally::default(), config);
        assert_eq!(summary.total().balance_errors, 1);
    }

    #[test]
    fn unknown_action_stops_only_that_worker() {
        let csv = "kind,worker,account,dst,branch,amount\n\
                   deposit,0,0,,,5\n\
                   audit,0,,,,\n\
                   deposit,0,0,,,5\n\
                   deposit,1,0,,,7\n";
        let source = Arc::new(ScriptedActions::from_csv(csv.as_bytes(), 2).unwrap());
        let bank = Arc::new(Bank::new(1, 1, 0));
        let tally = Arc::new(Tally::default());

        let summary =
            run_concurrent(&bank, 2, &source, &tally, WorkerConfig::default()).unwrap();

        assert_eq!(
            summary.outcomes[0].error,
            Some(ActionError::UnknownAction("audit".into()))
        );
        assert_eq!(summary.outcomes[0].stats.deposits, 1);
        assert_eq!(summary.outcomes[1].error, None);
        assert_eq!(bank.bank_balance(), 12);
    }

    #[test]
    fn concurrent_reports_rendezvous() {
        const WORKERS: usize = 4;
        const REPORTS: usize = 5;

        let scripts = (0..WORKERS)
            .map(|w| {
                let mut script = Vec::new();
                for _ in 0..REPORTS {
                    script.push(Action::Deposit { account: id(0, w as u32), amount: 1 });
                    script.push(Action::Report { worker: WorkerId(w) });
                }
                script
            })
            .collect();
        let source = Arc::new(ScriptedActions::new(scripts));
        let bank = Arc::new(Bank::new(1, WORKERS as u32, 0));
        let tally = Arc::new(Tally::default());

        let summary =
            run_concurrent(&bank, WORKERS, &source, &tally, WorkerConfig::default()).unwrap();
        let total = summary.total();

        assert_eq!(total.reports, (WORKERS * REPORTS) as u64);
        assert_eq!(total.reports_produced, REPORTS as u64);
        assert_eq!(
            tally.rendered.load(std::sync::atomic::Ordering::SeqCst),
            REPORTS as u64
        );
        assert_eq!(bank.bank_balance(), (WORKERS * REPORTS) as Amount);
    }
}
