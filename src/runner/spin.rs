// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Spin runner: a persistent pool whose idle workers busy-wait.

use super::sync::LaunchState;
use super::{CpuPinningPolicy, Task};
use crate::macros::{log_debug, log_error};
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// A persistent pool of workers that poll for new launches without ever
/// blocking in the operating system.
///
/// Spinning avoids the kernel wake-up latency of [`SleepRunner`], which wins
/// when task bodies are short and launches are frequent, at the cost of
/// burning CPU on all pool threads even when idle.
///
/// [`SleepRunner`]: super::sleep::SleepRunner
pub(crate) struct SpinRunner {
    /// Handles to the persistent worker threads.
    threads: Vec<JoinHandle<()>>,
    /// State shared with the workers.
    shared: Arc<SpinShared>,
    /// Epoch of the most recent launch published by this runner.
    epoch: u64,
}

/// Context shared between the launching thread and the spinning workers.
struct SpinShared {
    /// Epoch of the launch currently published to the workers. Written with
    /// release ordering by the launcher, polled with acquire ordering by the
    /// workers, so that observing a new epoch makes the whole launch state
    /// visible.
    epoch: CachePadded<AtomicU64>,
    /// Set once when the pool shuts down. Distinct from the epoch so an idle
    /// worker can tell "new work" from "exit" without extra state.
    stop: AtomicBool,
    /// Per-launch claim and completion state.
    state: LaunchState,
}

impl SpinRunner {
    /// Creates the pool, spawning `num_threads - 1` persistent workers. The
    /// launching thread is the remaining participant of every launch.
    pub(crate) fn new(num_threads: usize, cpu_pinning: CpuPinningPolicy) -> Self {
        let shared = Arc::new(SpinShared {
            epoch: CachePadded::new(AtomicU64::new(0)),
            stop: AtomicBool::new(false),
            state: LaunchState::new(),
        });

        let threads = (0..num_threads - 1)
            .map(|id| {
                let shared = shared.clone();
                std::thread::spawn(move || {
                    super::pin_worker_thread(cpu_pinning, id);
                    worker_loop(id, &shared);
                })
            })
            .collect();
        log_debug!("[launcher] Spawned spinning workers");

        Self {
            threads,
            shared,
            epoch: 0,
        }
    }

    pub(crate) fn num_threads(&self) -> usize {
        self.threads.len() + 1
    }

    pub(crate) fn run(&mut self, task: &dyn Task, num_tasks: usize) {
        self.shared.state.task.write().unwrap().set(task, num_tasks);
        self.shared.state.begin(self.threads.len(), num_tasks);

        self.epoch += 1;
        let epoch = self.epoch;
        // Publication point: pairs with the acquire loads in the worker poll
        // loop, so no worker can claim before seeing the reset counters and
        // the new task set.
        self.shared.epoch.store(epoch, Ordering::Release);
        log_debug!("[launcher, epoch {epoch}] Published a new launch");

        // The drain guard waits for the launch to complete even if a task
        // body panics on this thread, so the workers never observe a torn
        // down task set.
        let drain = LaunchDrain {
            shared: &self.shared,
        };
        self.shared.state.run_claimed(task, num_tasks);
        drop(drain);
        log_debug!("[launcher, epoch {epoch}] All tasks of this launch completed");

        self.shared.state.check_worker_panics();
    }
}

impl Drop for SpinRunner {
    /// Stops and joins all the workers in the pool.
    #[allow(clippy::unused_enumerate_index)]
    fn drop(&mut self) {
        log_debug!("[launcher] Notifying workers to stop...");
        self.shared.stop.store(true, Ordering::Release);

        for (_i, t) in self.threads.drain(..).enumerate() {
            let result = t.join();
            match result {
                Ok(_) => log_debug!("[launcher] Worker {_i} joined with result: {result:?}"),
                Err(_) => log_error!("[launcher] Worker {_i} joined with result: {result:?}"),
            }
        }
        log_debug!("[launcher] Joined all workers.");
    }
}

/// Completion wait for one launch, run on drop so that it also happens when a
/// task body panics on the launching thread.
struct LaunchDrain<'a> {
    shared: &'a SpinShared,
}

impl Drop for LaunchDrain<'_> {
    fn drop(&mut self) {
        let state = &self.shared.state;
        // All task ids of the launch have completed (or unwound)...
        while state.remaining.load(Ordering::SeqCst) != 0 {
            std::hint::spin_loop();
        }
        // ...and all workers are out of the claim loop, so the cursor and the
        // task view may be reused for the next launch.
        while state.active_workers.load(Ordering::SeqCst) != 0 {
            std::hint::spin_loop();
        }
        state.task.write().unwrap().clear();
    }
}

/// Main function run by a spinning worker.
fn worker_loop(_id: usize, shared: &SpinShared) {
    let mut epoch: u64 = 0;
    loop {
        loop {
            if shared.stop.load(Ordering::Acquire) {
                log_debug!("[worker {_id}] Received stop signal");
                return;
            }
            if shared.epoch.load(Ordering::Acquire) != epoch {
                break;
            }
            std::hint::spin_loop();
        }
        // Launches advance in lockstep: the launcher publishes epoch K+1 only
        // after every worker has finished epoch K.
        epoch += 1;
        assert_eq!(shared.epoch.load(Ordering::Acquire), epoch);
        log_debug!("[worker {_id}, epoch {epoch}] Observed a new launch. Claiming...");

        let round = RoundGuard { shared };
        {
            let guard = shared.state.task.read().unwrap();
            // SAFETY: the launcher keeps the published task set alive and not
            // mutated until all workers have finished this launch, as
            // synchronized by `active_workers`.
            let (task, num_tasks) = unsafe { guard.get().unwrap() };
            shared.state.run_claimed(task, num_tasks);
        }
        drop(round);
    }
}

/// Marks this worker as done with the current launch when dropped, and counts
/// the worker as panicking if it unwinds out of a task body.
struct RoundGuard<'a> {
    shared: &'a SpinShared,
}

impl Drop for RoundGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.shared
                .state
                .panicking_workers
                .fetch_add(1, Ordering::SeqCst);
        }
        let active = self.shared.state.active_workers.fetch_sub(1, Ordering::SeqCst);
        assert!(active > 0);
    }
}
