// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Benchmark and validation workloads for the runners.
//!
//! Each workload drives one or more launches against a runner it is handed,
//! measures the wall-clock time of the launches, and then checks the results
//! against algebraically derived expected values. The workloads double as
//! acceptance scenarios: an incorrect runner fails a check rather than just
//! benchmarking poorly.

pub mod tasks;

use crate::runner::{CpuPinningPolicy, Runner, RunnerBuilder, RunnerKind, ThreadCount};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use self::tasks::{FastTask, PingPongTask, RecursiveFibonacciTask, ValidatorTask};

/// A mismatch between an expected and an actual output value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckFailure {
    /// Index of the offending element (or task id, for per-task checks).
    pub index: usize,
    /// The algebraically derived expected value.
    pub expected: i64,
    /// The value actually found in the output buffer.
    pub actual: i64,
}

impl fmt::Display for CheckFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "error at index {}: expected value {}, actual value {}",
            self.index, self.expected, self.actual
        )
    }
}

/// Outcome of running a workload once against a runner.
pub struct TrialResult {
    /// Wall-clock time of the launches, excluding setup and validation.
    pub elapsed: Duration,
    /// Whether the output matched the expected values.
    pub check: Result<(), CheckFailure>,
}

/// A named workload from the catalog.
pub struct Workload {
    /// Stable name, used by the CLI to select and list workloads.
    pub name: &'static str,
    /// Runs the workload once against the given runner.
    pub run: fn(&mut Runner) -> TrialResult,
}

/// The workload catalog, in reporting order.
pub fn catalog() -> Vec<Workload> {
    vec![
        Workload {
            name: "super_super_light",
            run: super_super_light,
        },
        Workload {
            name: "super_light",
            run: super_light,
        },
        Workload {
            name: "ping_pong_equal",
            run: ping_pong_equal,
        },
        Workload {
            name: "ping_pong_unequal",
            run: ping_pong_unequal,
        },
        Workload {
            name: "spin_between_tasks",
            run: spin_between_tasks,
        },
        Workload {
            name: "only_runs_task_once",
            run: only_runs_task_once,
        },
    ]
}

/// Number of trials per workload and runner; the reported time is the
/// minimum.
pub const NUM_TRIALS: usize = 3;

/// Runs a workload [`NUM_TRIALS`] times against the given runner
/// configuration, each trial on a freshly built runner so that pool
/// construction and shutdown are exercised too.
///
/// Returns the minimum wall-clock time, or the first correctness failure.
pub fn run_trials(
    workload: &Workload,
    kind: RunnerKind,
    num_threads: ThreadCount,
    cpu_pinning: CpuPinningPolicy,
) -> Result<Duration, CheckFailure> {
    let mut min_time: Option<Duration> = None;
    for _ in 0..NUM_TRIALS {
        let mut runner = RunnerBuilder {
            kind,
            num_threads,
            cpu_pinning,
        }
        .build();
        let result = (workload.run)(&mut runner);
        result.check?;
        min_time = Some(match min_time {
            None => result.elapsed,
            Some(time) => time.min(result.elapsed),
        });
    }
    Ok(min_time.unwrap())
}

fn super_super_light(runner: &mut Runner) -> TrialResult {
    ping_pong(runner, true, 32 * 1024, 0)
}

fn super_light(runner: &mut Runner) -> TrialResult {
    ping_pong(runner, true, 32 * 1024, 32)
}

fn ping_pong_equal(runner: &mut Runner) -> TrialResult {
    ping_pong(runner, true, 512 * 1024, 32)
}

fn ping_pong_unequal(runner: &mut Runner) -> TrialResult {
    ping_pong(runner, false, 512 * 1024, 32)
}

/// Hundreds of back-to-back launches alternating between two buffers. This is
/// the stress test for launch-handshake latency and for stale-launch bugs in
/// the persistent pools: every launch must see exactly the buffers and
/// iteration counts of its own pass.
fn ping_pong(
    runner: &mut Runner,
    equal_work: bool,
    num_elements: usize,
    base_iterations: usize,
) -> TrialResult {
    const NUM_TASKS: usize = 64;
    const NUM_LAUNCHES: usize = 400;

    let input: Vec<AtomicI64> = (0..num_elements).map(|i| AtomicI64::new(i as i64)).collect();
    let output: Vec<AtomicI64> = (0..num_elements).map(|_| AtomicI64::new(0)).collect();

    // Ping-pong the two buffers across all the back-to-back launches.
    let passes: Vec<PingPongTask> = (0..NUM_LAUNCHES)
        .map(|i| {
            if i % 2 == 0 {
                PingPongTask::new(num_elements, &input, &output, equal_work, base_iterations)
            } else {
                PingPongTask::new(num_elements, &output, &input, equal_work, base_iterations)
            }
        })
        .collect();

    let start = Instant::now();
    for pass in &passes {
        runner.run(pass, NUM_TASKS);
    }
    let elapsed = start.elapsed();

    // An even number of passes leaves the result in the input buffer.
    let buffer = if NUM_LAUNCHES % 2 == 1 {
        &output
    } else {
        &input
    };

    let mut check = Ok(());
    for i in 0..num_elements {
        let mut expected = i as i64;
        for pass in &passes {
            let iterations = if equal_work {
                base_iterations
            } else {
                pass.num_iterations(i)
            };
            expected += (iterations as i64 + 1) / 2;
        }

        let actual = buffer[i].load(Ordering::Relaxed);
        if actual != expected {
            check = Err(CheckFailure {
                index: i,
                expected,
                actual,
            });
            break;
        }
    }

    TrialResult { elapsed, check }
}

/// A launch of one trivially cheap task, then a launch of a few very
/// expensive ones, then cheap again. Exposes runners that assume launches are
/// uniform, and pools that fail to pick up work promptly after idling.
fn spin_between_tasks(runner: &mut Runner) -> TrialResult {
    const NUM_SMALL_TASKS: usize = 1;
    const NUM_MED_TASKS: usize = 2;
    const FIBONACCI_N: u32 = 40;
    const FIBONACCI_EXPECTED: u64 = 102_334_155;

    let small_output: Vec<AtomicI64> = (0..NUM_SMALL_TASKS).map(|_| AtomicI64::new(0)).collect();
    let med_output: Vec<AtomicU64> = (0..NUM_MED_TASKS).map(|_| AtomicU64::new(0)).collect();

    let small_task = FastTask::new(&small_output);
    let med_task = RecursiveFibonacciTask::new(&med_output, FIBONACCI_N);

    let start = Instant::now();
    runner.run(&small_task, NUM_SMALL_TASKS);
    runner.run(&med_task, NUM_MED_TASKS);
    runner.run(&small_task, NUM_SMALL_TASKS);
    let elapsed = start.elapsed();

    let mut check = Ok(());
    for (i, out) in med_output.iter().enumerate() {
        let actual = out.load(Ordering::Relaxed);
        if actual != FIBONACCI_EXPECTED {
            check = Err(CheckFailure {
                index: i,
                expected: FIBONACCI_EXPECTED as i64,
                actual: actual as i64,
            });
            break;
        }
    }

    TrialResult { elapsed, check }
}

/// Two launches of a validator task on the same runner: every id must be
/// invoked exactly once per launch, which catches both dropped and duplicated
/// ids as well as work leaking between launches.
fn only_runs_task_once(runner: &mut Runner) -> TrialResult {
    const NUM_LAUNCHES: usize = 2;
    const NUM_TASKS: usize = 100;

    let validators: Vec<ValidatorTask> = (0..NUM_LAUNCHES)
        .map(|_| ValidatorTask::new(NUM_TASKS))
        .collect();

    let start = Instant::now();
    for validator in &validators {
        runner.run(validator, NUM_TASKS);
    }
    let elapsed = start.elapsed();

    let mut check = Ok(());
    'outer: for validator in &validators {
        for task_id in 0..NUM_TASKS {
            let count = validator.count(task_id);
            if count != 1 {
                check = Err(CheckFailure {
                    index: task_id,
                    expected: 1,
                    actual: count as i64,
                });
                break 'outer;
            }
        }
    }

    TrialResult { elapsed, check }
}

#[cfg(test)]
mod test {
    use super::*;

    fn build(kind: RunnerKind) -> Runner {
        RunnerBuilder {
            kind,
            num_threads: ThreadCount::try_from(4).unwrap(),
            cpu_pinning: CpuPinningPolicy::No,
        }
        .build()
    }

    #[test]
    fn catalog_names_are_unique() {
        let catalog = catalog();
        for (i, workload) in catalog.iter().enumerate() {
            for other in &catalog[i + 1..] {
                assert_ne!(workload.name, other.name);
            }
        }
    }

    #[test]
    fn small_ping_pong_is_correct_for_each_kind() {
        for kind in RunnerKind::ALL {
            let mut runner = build(kind);
            let result = ping_pong(&mut runner, true, 1000, 4);
            assert_eq!(result.check, Ok(()), "runner {}", kind.name());

            let mut runner = build(kind);
            let result = ping_pong(&mut runner, false, 1000, 4);
            assert_eq!(result.check, Ok(()), "runner {}", kind.name());
        }
    }

    #[test]
    fn validator_workload_passes_for_each_kind() {
        for kind in RunnerKind::ALL {
            let mut runner = build(kind);
            let result = only_runs_task_once(&mut runner);
            assert_eq!(result.check, Ok(()), "runner {}", kind.name());
        }
    }
}
