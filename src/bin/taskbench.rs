// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! CLI tool that benchmarks every runner strategy against the workload
//! catalog and validates the results.

use clap::{Parser, ValueEnum};
use std::num::NonZeroUsize;
use std::process::ExitCode;
use taskpool::workload::{catalog, run_trials};
use taskpool::{CpuPinningPolicy, RunnerKind, ThreadCount};

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let workloads = catalog();
    if cli.list {
        for workload in &workloads {
            println!("{}", workload.name);
        }
        return ExitCode::SUCCESS;
    }

    if let Some(name) = &cli.name {
        if !workloads.iter().any(|w| w.name == name.as_str()) {
            eprintln!("Unknown workload: {name}");
            return ExitCode::FAILURE;
        }
    }

    let num_threads = match cli.threads {
        Some(count) => ThreadCount::Count(count),
        None => ThreadCount::AvailableParallelism,
    };
    let resolved_threads: NonZeroUsize = match num_threads {
        ThreadCount::Count(count) => count,
        ThreadCount::AvailableParallelism => {
            std::thread::available_parallelism().expect("Getting the available parallelism failed")
        }
    };
    let cpu_pinning = match cli.pin {
        CpuPinningCli::No => CpuPinningPolicy::No,
        CpuPinningCli::IfSupported => CpuPinningPolicy::IfSupported,
        CpuPinningCli::Always => CpuPinningPolicy::Always,
    };

    let mut any_failure = false;
    for workload in &workloads {
        if let Some(name) = &cli.name {
            if workload.name != name.as_str() {
                continue;
            }
        }

        println!("Workload [{resolved_threads} threads]: {}", workload.name);
        for kind in RunnerKind::ALL {
            if let Some(selected) = cli.runner {
                if RunnerKind::from(selected) != kind {
                    continue;
                }
            }

            // A correctness failure terminates this workload's trials, not
            // the whole run; the remaining workloads still report.
            match run_trials(workload, kind, num_threads, cpu_pinning) {
                Ok(min_time) => println!(
                    "[{}]:\t{:.3} ms",
                    kind.name(),
                    min_time.as_secs_f64() * 1000.0
                ),
                Err(failure) => {
                    eprintln!(
                        "Error: correctness check failed for workload {} with runner {}: {failure}",
                        workload.name,
                        kind.name()
                    );
                    any_failure = true;
                }
            }
        }
    }

    if any_failure {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// CLI tool that benchmarks every runner strategy against the workload
/// catalog and validates the results.
#[derive(Parser, Debug)]
#[command(version)]
struct Cli {
    /// Number of threads participating in each launch, including the calling
    /// thread. Defaults to the available parallelism.
    #[arg(short, long)]
    threads: Option<NonZeroUsize>,

    /// Run only the workload with this name.
    #[arg(short, long)]
    name: Option<String>,

    /// Run only this runner strategy.
    #[arg(short, long, value_enum)]
    runner: Option<RunnerKindCli>,

    /// List the available workloads and exit.
    #[arg(short, long, default_value_t = false)]
    list: bool,

    /// Policy to pin pool worker threads to CPUs.
    #[arg(long, value_enum, default_value = "no")]
    pin: CpuPinningCli,
}

/// Runner strategy to benchmark.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum RunnerKindCli {
    /// Every task on the calling thread, in order.
    Serial,
    /// Fresh threads spawned and joined on every launch.
    Spawn,
    /// Persistent pool, busy-waiting workers.
    Spin,
    /// Persistent pool, workers sleeping on a condition variable.
    Sleep,
}

impl From<RunnerKindCli> for RunnerKind {
    fn from(kind: RunnerKindCli) -> Self {
        match kind {
            RunnerKindCli::Serial => RunnerKind::Serial,
            RunnerKindCli::Spawn => RunnerKind::Spawn,
            RunnerKindCli::Spin => RunnerKind::Spin,
            RunnerKindCli::Sleep => RunnerKind::Sleep,
        }
    }
}

/// Policy to pin pool worker threads to CPUs.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum CpuPinningCli {
    /// Don't pin worker threads to CPUs.
    No,
    /// Pin each worker thread to a CPU, if supported on this platform.
    IfSupported,
    /// Pin each worker thread to a CPU; fail if unsupported on this platform.
    Always,
}
