// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! End-to-end tests of the launch contract, run against every strategy.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use taskpool::workload::tasks::{recursive_fibonacci, PingPongTask};
use taskpool::{CpuPinningPolicy, Runner, RunnerBuilder, RunnerKind, ThreadCount};

fn build(kind: RunnerKind, num_threads: usize) -> Runner {
    RunnerBuilder {
        kind,
        num_threads: ThreadCount::try_from(num_threads).unwrap(),
        cpu_pinning: CpuPinningPolicy::No,
    }
    .build()
}

#[test]
fn executes_each_task_exactly_once() {
    for kind in RunnerKind::ALL {
        for num_tasks in [0, 1, 100] {
            let counts: Vec<AtomicUsize> = (0..num_tasks).map(|_| AtomicUsize::new(0)).collect();
            let mut runner = build(kind, 4);
            runner.run(
                &|task_id: usize, n: usize| {
                    assert_eq!(n, num_tasks);
                    counts[task_id].fetch_add(1, Ordering::Relaxed);
                },
                num_tasks,
            );
            for (task_id, count) in counts.iter().enumerate() {
                assert_eq!(
                    count.load(Ordering::Relaxed),
                    1,
                    "runner {}, num_tasks {num_tasks}, task {task_id}",
                    kind.name()
                );
            }
        }
    }
}

// Catches launches leaking into each other on a reused pool: every launch
// must claim exactly its own task set.
#[test]
fn repeated_launches_on_one_runner() {
    const NUM_TASKS: usize = 100;
    const NUM_LAUNCHES: usize = 10;

    for kind in RunnerKind::ALL {
        let mut runner = build(kind, 4);
        for _ in 0..NUM_LAUNCHES {
            let counts: Vec<AtomicUsize> = (0..NUM_TASKS).map(|_| AtomicUsize::new(0)).collect();
            runner.run(
                &|task_id: usize, _num_tasks: usize| {
                    counts[task_id].fetch_add(1, Ordering::Relaxed);
                },
                NUM_TASKS,
            );
            for count in &counts {
                assert_eq!(count.load(Ordering::Relaxed), 1, "runner {}", kind.name());
            }
        }
    }
}

#[test]
fn matches_serial_output() {
    const NUM_TASKS: usize = 512 * 1024;

    fn value_for(task_id: usize) -> u64 {
        (task_id as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ (task_id as u64)
    }

    let expected: Vec<AtomicU64> = (0..NUM_TASKS).map(|_| AtomicU64::new(0)).collect();
    let mut serial = build(RunnerKind::Serial, 1);
    serial.run(
        &|task_id: usize, _num_tasks: usize| {
            expected[task_id].store(value_for(task_id), Ordering::Relaxed);
        },
        NUM_TASKS,
    );

    for kind in [RunnerKind::Spawn, RunnerKind::Spin, RunnerKind::Sleep] {
        for num_threads in [1, 2, 4, 8] {
            let output: Vec<AtomicU64> = (0..NUM_TASKS).map(|_| AtomicU64::new(0)).collect();
            let mut runner = build(kind, num_threads);
            runner.run(
                &|task_id: usize, _num_tasks: usize| {
                    output[task_id].store(value_for(task_id), Ordering::Relaxed);
                },
                NUM_TASKS,
            );
            for task_id in 0..NUM_TASKS {
                assert_eq!(
                    output[task_id].load(Ordering::Relaxed),
                    expected[task_id].load(Ordering::Relaxed),
                    "runner {}, {num_threads} threads, task {task_id}",
                    kind.name()
                );
            }
        }
    }
}

// A launch mixing one cheap task with a few expensive ones must complete for
// every strategy, whatever thread ends up claiming the expensive ids.
#[test]
fn imbalanced_workload_completes() {
    const FIBONACCI_N: u32 = 30;

    let expected = recursive_fibonacci(FIBONACCI_N);
    for kind in RunnerKind::ALL {
        let outputs: Vec<AtomicU64> = (0..3).map(|_| AtomicU64::new(0)).collect();
        let mut runner = build(kind, 4);
        runner.run(
            &|task_id: usize, _num_tasks: usize| {
                let value = if task_id == 0 {
                    1
                } else {
                    recursive_fibonacci(FIBONACCI_N)
                };
                outputs[task_id].store(value, Ordering::Relaxed);
            },
            3,
        );
        assert_eq!(outputs[0].load(Ordering::Relaxed), 1, "runner {}", kind.name());
        for output in &outputs[1..] {
            assert_eq!(output.load(Ordering::Relaxed), expected, "runner {}", kind.name());
        }
    }
}

// 400 alternating passes with no per-element work: an even number of
// ping-pongs must leave the buffer exactly as initialized. This is the stress
// test for stale launches on the persistent pools.
#[test]
fn ping_pong_buffers_return_to_initial() {
    const NUM_ELEMENTS: usize = 32768;
    const NUM_TASKS: usize = 64;
    const NUM_LAUNCHES: usize = 400;

    for kind in RunnerKind::ALL {
        let input: Vec<AtomicI64> = (0..NUM_ELEMENTS).map(|i| AtomicI64::new(i as i64)).collect();
        let output: Vec<AtomicI64> = (0..NUM_ELEMENTS).map(|_| AtomicI64::new(0)).collect();
        let forward = PingPongTask::new(NUM_ELEMENTS, &input, &output, true, 0);
        let backward = PingPongTask::new(NUM_ELEMENTS, &output, &input, true, 0);

        let mut runner = build(kind, 4);
        for i in 0..NUM_LAUNCHES {
            if i % 2 == 0 {
                runner.run(&forward, NUM_TASKS);
            } else {
                runner.run(&backward, NUM_TASKS);
            }
        }

        for (i, element) in input.iter().enumerate() {
            assert_eq!(
                element.load(Ordering::Relaxed),
                i as i64,
                "runner {}, element {i}",
                kind.name()
            );
        }
    }
}

// Many short-lived pools: workers must be joined on every drop, with no
// launch state leaking between pool instances.
#[test]
fn construct_launch_destroy_cycles() {
    const NUM_CYCLES: usize = 25;
    const NUM_TASKS: usize = 64;

    for kind in [RunnerKind::Spin, RunnerKind::Sleep] {
        for _ in 0..NUM_CYCLES {
            let counts: Vec<AtomicUsize> = (0..NUM_TASKS).map(|_| AtomicUsize::new(0)).collect();
            let mut runner = build(kind, 4);
            runner.run(
                &|task_id: usize, _num_tasks: usize| {
                    counts[task_id].fetch_add(1, Ordering::Relaxed);
                },
                NUM_TASKS,
            );
            drop(runner);
            for count in &counts {
                assert_eq!(count.load(Ordering::Relaxed), 1, "runner {}", kind.name());
            }
        }
    }
}

// A panicking task body must re-raise on the calling thread, after the launch
// has drained, for every strategy.
#[test]
fn task_panic_reaches_the_caller() {
    for kind in RunnerKind::ALL {
        let executed: Vec<AtomicUsize> = (0..64).map(|_| AtomicUsize::new(0)).collect();
        let mut runner = build(kind, 4);
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            runner.run(
                &|task_id: usize, _num_tasks: usize| {
                    if task_id == 13 {
                        panic!("task failure");
                    }
                    executed[task_id].fetch_add(1, Ordering::Relaxed);
                },
                64,
            );
        }));
        assert!(result.is_err(), "runner {}", kind.name());
    }
}
