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

//! Periodic branch reports.
//!
//! Workers record the net effect of every successful balance-changing
//! operation per branch. At a quiescence point the report checks that each
//! branch balance equals the previous report's balance plus the recorded
//! flows, and writes one CSV row per branch.
//!
//! # CSV Format
//!
//! ```csv
//! report,worker,branch,balance,flow,consistent
//! 1,0,0,1600000.00,-1024.37,true
//! ```
//!
//! Balances are kept in cents and written in currency units.

use crate::bank::Bank;
use crate::base::{AccountId, Amount, BranchId, WorkerId};
use crate::error::ReportError;
use csv::Writer;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Decimal places of the currency unit an [`Amount`] is counted in.
const CURRENCY_SCALE: u32 = 2;

/// The report collaborator as seen by workers.
pub trait Reporter: Send + Sync {
    /// Notes a successful balance change of `delta` on `account`.
    fn record_transfer(&self, worker: WorkerId, account: AccountId, delta: Amount);

    /// Produces one report. Only called while every worker is parked.
    fn render_report(&self, bank: &Bank, worker: WorkerId) -> Result<(), ReportError>;
}

/// Converts cents to currency units.
pub fn to_currency(amount: Amount) -> Decimal {
    Decimal::new(amount, CURRENCY_SCALE)
}

#[derive(Debug, Serialize)]
struct ReportRow {
    report: u64,
    worker: WorkerId,
    branch: BranchId,
    balance: Decimal,
    flow: Decimal,
    consistent: bool,
}

/// CSV branch report with flow tracking.
pub struct Report<W: Write> {
    writer: Mutex<Writer<W>>,
    /// Per worker, net flow per branch since the last report.
    flows: Vec<Mutex<Vec<Amount>>>,
    /// Branch balances as of the last report.
    last: Mutex<Vec<Amount>>,
    reports: AtomicU64,
    inconsistencies: AtomicU64,
}

impl<W: Write> Report<W> {
    /// Starts tracking from the bank's current branch balances.
    pub fn new(bank: &Bank, workers: usize, writer: W) -> Self {
        let branches = bank.branches().len();
        Self {
            writer: Mutex::new(Writer::from_writer(writer)),
            flows: (0..workers.max(1))
                .map(|_| Mutex::new(vec![0; branches]))
                .collect(),
            last: Mutex::new(bank.branches().iter().map(|b| b.balance()).collect()),
            reports: AtomicU64::new(0),
            inconsistencies: AtomicU64::new(0),
        }
    }

    pub fn reports(&self) -> u64 {
        self.reports.load(Ordering::Acquire)
    }

    /// Branches found inconsistent across all reports so far.
    pub fn inconsistencies(&self) -> u64 {
        self.inconsistencies.load(Ordering::Acquire)
    }

    /// Flushes and returns the underlying writer.
    pub fn into_inner(self) -> Result<W, ReportError> {
        self.writer
            .into_inner()
            .into_inner()
            .map_err(|err| ReportError::Csv(err.error().to_string()))
    }

    /// Sums and clears every worker's recorded flows.
    fn drain_flows(&self, branches: usize) -> Vec<Amount> {
        let mut total = vec![0; branches];
        for slot in &self.flows {
            let mut slot = slot.lock();
            for (sum, flow) in total.iter_mut().zip(slot.iter_mut()) {
                *sum += std::mem::take(flow);
            }
        }
        total
    }
}

impl<W: Write + Send> Reporter for Report<W> {
    fn record_transfer(&self, worker: WorkerId, account: AccountId, delta: Amount) {
        let slot = &self.flows[worker.0 % self.flows.len()];
        if let Some(flow) = slot.lock().get_mut(account.branch().0 as usize) {
            *flow += delta;
        }
    }

    fn render_report(&self, bank: &Bank, worker: WorkerId) -> Result<(), ReportError> {
        let report = self.reports.fetch_add(1, Ordering::AcqRel) + 1;
        let flows = self.drain_flows(bank.branches().len());
        let mut first_mismatch = None;

        // Re-base every branch before writing, so a failed write loses rows
        // but never tracking state.
        let rows: Vec<ReportRow> = {
            let mut last = self.last.lock();
            bank.branches()
                .iter()
                .zip(last.iter_mut())
                .zip(flows)
                .map(|((branch, previous), flow)| {
                    let balance = branch.balance();
                    let expected = *previous + flow;
                    let consistent = balance == expected;
                    if !consistent {
                        self.inconsistencies.fetch_add(1, Ordering::AcqRel);
                        first_mismatch.get_or_insert(ReportError::Inconsistent {
                            branch: branch.id(),
                            expected,
                            actual: balance,
                        });
                    }
                    *previous = balance;
                    ReportRow {
                        report,
                        worker,
                        branch: branch.id(),
                        balance: to_currency(balance),
                        flow: to_currency(flow),
                        consistent,
                    }
                })
                .collect()
        };

        let mut writer = self.writer.lock();
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush().map_err(|err| ReportError::Csv(err.to_string()))?;

        match first_mismatch {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::teller::Teller;
    use rust_decimal_macros::dec;

    fn id(branch: u32, index: u32) -> AccountId {
        AccountId::new(BranchId(branch), index)
    }

    #[test]
    fn currency_has_two_decimal_places() {
        assert_eq!(to_currency(123_456), dec!(1234.56));
        assert_eq!(to_currency(-5), dec!(-0.05));
    }

    #[test]
    fn consistent_report_writes_one_row_per_branch() {
        let bank = Bank::new(2, 2, 1_000);
        let report = Report::new(&bank, 2, Vec::new());
        let teller = Teller::new(&bank);

        teller.transfer(id(0, 0), id(1, 1), 250).unwrap();
        report.record_transfer(WorkerId(0), id(0, 0), -250);
        report.record_transfer(WorkerId(0), id(1, 1), 250);
        teller.deposit(id(1, 0), 5).unwrap();
        report.record_transfer(WorkerId(1), id(1, 0), 5);

        assert_eq!(report.render_report(&bank, WorkerId(1)), Ok(()));
        assert_eq!(report.reports(), 1);
        assert_eq!(report.inconsistencies(), 0);

        let output = String::from_utf8(report.into_inner().unwrap()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(
            lines,
            vec![
                "report,worker,branch,balance,flow,consistent",
                "1,1,0,17.50,-2.50,true",
                "1,1,1,22.55,2.55,true",
            ]
        );
    }

    #[test]
    fn flows_reset_between_reports() {
        let bank = Bank::new(1, 1, 100);
        let report = Report::new(&bank, 1, Vec::new());

        Teller::new(&bank).withdraw(id(0, 0), 40).unwrap();
        report.record_transfer(WorkerId(0), id(0, 0), -40);
        assert_eq!(report.render_report(&bank, WorkerId(0)), Ok(()));
        assert_eq!(report.render_report(&bank, WorkerId(0)), Ok(()));
        assert_eq!(report.reports(), 2);
    }

    #[test]
    fn unrecorded_change_is_inconsistent() {
        let bank = Bank::new(2, 1, 100);
        let report = Report::new(&bank, 1, Vec::new());

        Teller::new(&bank).deposit(id(1, 0), 7).unwrap();

        assert_eq!(
            report.render_report(&bank, WorkerId(0)),
            Err(ReportError::Inconsistent {
                branch: BranchId(1),
                expected: 100,
                actual: 107
            })
        );
        assert_eq!(report.inconsistencies(), 1);

        // The report re-bases on what it saw.
        assert_eq!(report.render_report(&bank, WorkerId(0)), Ok(()));
    }

    /// Accepts `budget` bytes, then fails every write.
    struct Brittle {
        budget: usize,
    }

    impl Write for Brittle {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.budget < buf.len() {
                return Err(std::io::Error::other("disk full"));
            }
            self.budget -= buf.len();
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn failed_write_keeps_flow_tracking() {
        let bank = Bank::new(4, 1, 100);
        let report = Report::new(&bank, 1, Brittle { budget: 0 });
        let teller = Teller::new(&bank);

        for branch in 0..4 {
            teller.deposit(id(branch, 0), 10).unwrap();
            report.record_transfer(WorkerId(0), id(branch, 0), 10);
        }
        assert!(matches!(
            report.render_report(&bank, WorkerId(0)),
            Err(ReportError::Csv(_))
        ));
        assert_eq!(report.inconsistencies(), 0);

        assert_eq!(*report.last.lock(), vec![110; 4]);

        // Nothing changed since, so the next report finds every branch in step
        // even though its write fails again.
        assert!(matches!(
            report.render_report(&bank, WorkerId(0)),
            Err(ReportError::Csv(_))
        ));
        assert_eq!(report.inconsistencies(), 0);
        assert_eq!(report.reports(), 2);
    }
}
