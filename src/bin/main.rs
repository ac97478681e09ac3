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

use branch_ledger::{
    CompareMismatch, GeneratedActions, Report, RunOptions, RunSummary, Scenario, WorkerConfig,
    YieldPolicy, run_concurrent, run_sequential,
};
use clap::Parser;
use std::error::Error;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Bank driver - Stress the ledger and cross-check it
///
/// Runs a generated workload on several workers, replays the same workload
/// on one worker without locking, and compares the two banks.
#[derive(Parser, Debug)]
#[command(name = "bankdriver")]
#[command(about = "Runs a concurrent bank workload and checks it against a sequential replay", long_about = None)]
struct Args {
    /// Number of workers (1, 2, 4, 8 or 16)
    #[arg(short = 'w', long, default_value_t = 1)]
    workers: usize,

    /// Test run to execute (1-7)
    #[arg(short = 't', long = "test", default_value_t = 1)]
    test_run: u32,

    /// Random seed; 0 picks one from the clock
    #[arg(short = 's', long, default_value_t = 0)]
    seed: u64,

    /// Make every fourth account fail all debits
    #[arg(short = 'f', long = "inject-failures")]
    inject_failures: bool,

    /// Check every bank balance against the starting total
    #[arg(short = 'b', long = "verify-bank-balance")]
    verify_bank_balance: bool,

    /// Shrink the workload for runs under a race checker
    #[arg(short = 'r', long = "race-checker")]
    race_checker: bool,

    /// Yield inside critical sections with this percentage (5 if no value)
    #[arg(
        short = 'y',
        long = "yield",
        value_name = "PERCENT",
        num_args = 0..=1,
        default_value_t = 0,
        default_missing_value = "5"
    )]
    yield_percent: u8,

    /// Write the concurrent run's branch reports to this CSV file
    #[arg(long, value_name = "FILE")]
    report_file: Option<PathBuf>,

    /// Log filter, e.g. `ledger::worker=debug`. Overrides `RUST_LOG`.
    #[arg(long, value_name = "FILTER")]
    log: Option<String>,
}

fn main() {
    let args = Args::parse();
    init_tracing(args.log.as_deref());

    let options = match run_options(&args) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };

    let report: Box<dyn Write + Send> = match &args.report_file {
        Some(path) => match File::create(path) {
            Ok(file) => Box::new(BufWriter::new(file)),
            Err(e) => {
                eprintln!("Error creating report file '{}': {}", path.display(), e);
                process::exit(1);
            }
        },
        None => Box::new(io::sink()),
    };

    match drive(&options, report) {
        Ok(outcome) => {
            print!("{}", outcome);
            if !outcome.passed() {
                process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn init_tracing(filter: Option<&str>) {
    let filter = match filter {
        Some(filter) => EnvFilter::new(filter),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .init();
}

fn run_options(args: &Args) -> Result<RunOptions, Box<dyn Error>> {
    let seed = if args.seed == 0 {
        SystemTime::now().duration_since(UNIX_EPOCH)?.as_nanos() as u64
    } else {
        args.seed
    };
    let options = RunOptions {
        workers: args.workers,
        test_run: args.test_run,
        seed,
        yield_policy: YieldPolicy::new(args.yield_percent)?,
        inject_failures: args.inject_failures,
        verify_bank_balance: args.verify_bank_balance,
        race_checker: args.race_checker,
    };
    options.validate()?;
    Ok(options)
}

/// What the driver learned from one concurrent run and its replay.
#[derive(Debug)]
struct Outcome {
    options: RunOptions,
    concurrent: RunSummary,
    sequential: RunSummary,
    mismatches: Vec<CompareMismatch>,
    inconsistent_reports: u64,
}

impl Outcome {
    fn passed(&self) -> bool {
        let total = self.concurrent.total();
        self.mismatches.is_empty()
            && self.inconsistent_reports == 0
            && total.balance_errors == 0
            && self.concurrent.errors().next().is_none()
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let total = self.concurrent.total();
        writeln!(
            f,
            "Test {} with {} workers, seed {}",
            self.options.test_run, self.options.workers, self.options.seed
        )?;
        writeln!(
            f,
            "  {} deposits, {} withdrawals, {} transfers, {} reports, {} failed debits",
            total.deposits,
            total.withdrawals,
            total.transfers,
            total.reports_produced,
            total.insufficient_funds
        )?;
        if total.balance_errors > 0 {
            writeln!(f, "  {} incorrect bank balances", total.balance_errors)?;
        }
        if self.inconsistent_reports > 0 {
            writeln!(f, "  {} inconsistent branch reports", self.inconsistent_reports)?;
        }
        for error in self.concurrent.errors() {
            writeln!(f, "  worker stopped early: {}", error)?;
        }
        for mismatch in &self.mismatches {
            writeln!(f, "  {}", mismatch)?;
        }

        let concurrent = self.concurrent.elapsed.as_secs_f64();
        let sequential = self.sequential.elapsed.as_secs_f64();
        writeln!(
            f,
            "  concurrent {:.3}s, sequential {:.3}s, ratio {:.2}",
            concurrent,
            sequential,
            if concurrent > 0.0 { sequential / concurrent } else { 0.0 }
        )?;
        writeln!(f, "Test {}", if self.passed() { "PASSED" } else { "FAILED" })
    }
}

/// Runs the scenario concurrently, replays it sequentially and compares.
fn drive(options: &RunOptions, report: Box<dyn Write + Send>) -> Result<Outcome, Box<dyn Error>> {
    let scenario = Scenario::for_test_run(options.test_run)?.with_options(options);

    let bank = Arc::new(scenario.build_bank(options.yield_policy));
    let config = WorkerConfig {
        flags: scenario.flags,
        expected_bank_balance: scenario
            .verify_bank_balance
            .then(|| bank.bank_balance()),
    };

    let source = Arc::new(GeneratedActions::new(&scenario, options.workers, options.seed));
    let reporter = Arc::new(Report::new(&bank, options.workers, report));
    let concurrent = run_concurrent(&bank, options.workers, &source, &reporter, config)?;
    let inconsistent_reports = reporter.inconsistencies();

    let mut replay = scenario.build_bank(YieldPolicy::NEVER);
    let source = GeneratedActions::new(&scenario, 1, options.seed);
    let sink = Report::new(&replay, 1, io::sink());
    let sequential = run_sequential(&mut replay, &source, &sink, config);

    Ok(Outcome {
        options: *options,
        concurrent,
        sequential,
        mismatches: bank.compare(&replay),
        inconsistent_reports,
    })
}
