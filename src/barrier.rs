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

//! Reusable rendezvous for report actions.
//!
//! Each round moves through three states:
//!
//! ```text
//!  Counting ──last arrival──► Reporting ──reset + signal──► Released
//!     ▲                                                        │
//!     └──────────────────────── next round ────────────────────┘
//! ```
//!
//! Arrivals join the round's waiting list under its guard. Every arrival
//! but the last parks on its own release channel. The last one runs the
//! report while everybody else is parked, clears the list, then sends one
//! release to each parked worker. A worker cannot arrive again before it
//! has been released, so each channel holds at most one pending signal.
//!
//! A worker whose loop ends [`leave`](ReportBarrier::leave)s the barrier and
//! is no longer waited for. If its departure completes the round, the
//! report is handed to one of the parked workers.

use crate::base::WorkerId;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

/// What a parked worker is woken with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Release,
    /// Everyone else has arrived or left; run the report.
    Report,
}

#[derive(Debug)]
struct Round {
    /// Workers that have not left.
    participants: usize,
    /// Workers parked in the current round.
    waiting: Vec<WorkerId>,
}

#[derive(Debug)]
pub struct ReportBarrier {
    workers: usize,
    round: Mutex<Round>,
    releases: Vec<(Sender<Signal>, Receiver<Signal>)>,
    rounds: AtomicU64,
}

impl ReportBarrier {
    /// Builds a barrier for `workers` workers. Zero is treated as one.
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            workers,
            round: Mutex::new(Round {
                participants: workers,
                waiting: Vec::with_capacity(workers),
            }),
            releases: (0..workers).map(|_| channel::bounded(1)).collect(),
            rounds: AtomicU64::new(0),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Workers that have not left yet.
    pub fn participants(&self) -> usize {
        self.round.lock().participants
    }

    /// Completed rounds so far.
    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::Acquire)
    }

    /// Arrives at the barrier as `worker`.
    ///
    /// The last worker to arrive runs `report` and gets `Some` of its
    /// result; everyone else blocks until that report is done and gets
    /// `None`.
    ///
    /// # Panics
    ///
    /// Panics if `worker` is not below the barrier's worker count.
    pub fn arrive<T>(&self, worker: WorkerId, report: impl FnOnce() -> T) -> Option<T> {
        let (_, release) = &self.releases[worker.0];

        let mut round = self.round.lock();
        if round.waiting.len() + 1 < round.participants {
            round.waiting.push(worker);
            trace!(target: "ledger::barrier", %worker, waiting = round.waiting.len(), "waiting");
            drop(round);
            // The sender lives in `self`, so this only returns on a signal.
            if release.recv() != Ok(Signal::Report) {
                return None;
            }
        } else {
            drop(round);
        }

        trace!(target: "ledger::barrier", %worker, "reporting");
        let result = report();
        self.finish_round();
        Some(result)
    }

    /// Withdraws `worker` from every future round.
    ///
    /// Must be called at most once per worker, and never while that worker
    /// is parked. When everyone still taking part is already parked, one of
    /// them is woken to run the report.
    pub fn leave(&self, worker: WorkerId) {
        let mut round = self.round.lock();
        round.participants = round.participants.saturating_sub(1);
        debug!(
            target: "ledger::barrier",
            %worker, participants = round.participants, "left"
        );
        if round.waiting.is_empty() || round.waiting.len() < round.participants {
            return;
        }
        // Everyone remaining is parked. Nobody can arrive until released.
        let Some(reporter) = round.waiting.pop() else {
            return;
        };
        drop(round);
        let _ = self.releases[reporter.0].0.send(Signal::Report);
    }

    fn finish_round(&self) {
        let waiting = std::mem::take(&mut self.round.lock().waiting);
        self.rounds.fetch_add(1, Ordering::AcqRel);
        for worker in waiting {
            let _ = self.releases[worker.0].0.send(Signal::Release);
        }
    }
}
