// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Sleep runner: a persistent pool whose idle workers block on a condition
//! variable.

use super::sync::{LaunchState, Status};
use super::{CpuPinningPolicy, Task};
use crate::macros::{log_debug, log_error};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

/// A persistent pool of workers that sleep between launches and are woken by
/// a condition variable when a new launch is published.
///
/// Task distribution is identical to [`SpinRunner`]: claiming goes through
/// the same lock-free cursor, so dispatch never serializes through the mutex.
/// Only the idle/wake handshake differs. Blocking avoids burning CPU between
/// launches, at the cost of wake-up latency (mutex acquisition plus OS
/// scheduling) on every launch, which is the right choice for sparse or
/// heavy workloads.
///
/// [`SpinRunner`]: super::spin::SpinRunner
pub(crate) struct SleepRunner {
    /// Handles to the persistent worker threads.
    threads: Vec<JoinHandle<()>>,
    /// State shared with the workers.
    shared: Arc<SleepShared>,
    /// Epoch of the most recent launch published by this runner.
    epoch: u64,
}

/// Signal from the launching thread to the workers. The epoch and the
/// shutdown flag live under the same mutex as the condition variable the
/// workers wait on, so shutdown can never race with a worker that is about to
/// go to sleep.
#[derive(Clone, Copy, PartialEq, Eq)]
enum WorkerSignal {
    /// The workers need to execute the launch with the given epoch.
    Launch(u64),
    /// There is nothing more to do and the workers must exit.
    Finished,
}

/// Status of the launching thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MainStatus {
    /// The launcher is waiting for the workers to finish the launch.
    Waiting,
    /// The last worker of the launch has finished; the launcher may proceed.
    Ready,
}

/// Context shared between the launching thread and the sleeping workers.
struct SleepShared {
    /// Signal published to the workers.
    worker_signal: Status<WorkerSignal>,
    /// Signal from the last finishing worker back to the launcher.
    main_status: Status<MainStatus>,
    /// Per-launch claim and completion state.
    state: LaunchState,
}

impl SleepRunner {
    /// Creates the pool, spawning `num_threads - 1` persistent workers. The
    /// launching thread is the remaining participant of every launch.
    pub(crate) fn new(num_threads: usize, cpu_pinning: CpuPinningPolicy) -> Self {
        let shared = Arc::new(SleepShared {
            worker_signal: Status::new(WorkerSignal::Launch(0)),
            main_status: Status::new(MainStatus::Waiting),
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
        log_debug!("[launcher] Spawned sleeping workers");

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
        // Publication point: the mutex inside `notify_all` orders the counter
        // resets and the task set before any worker wakes up.
        self.shared
            .worker_signal
            .notify_all(WorkerSignal::Launch(epoch));
        log_debug!("[launcher, epoch {epoch}] Published a new launch");

        // The drain guard waits for the launch to complete even if a task
        // body panics on this thread, so the workers never observe a torn
        // down task set.
        let drain = LaunchDrain {
            shared: &self.shared,
            has_workers: !self.threads.is_empty(),
        };
        self.shared.state.run_claimed(task, num_tasks);
        drop(drain);
        log_debug!("[launcher, epoch {epoch}] All tasks of this launch completed");

        self.shared.state.check_worker_panics();
    }
}

impl Drop for SleepRunner {
    /// Wakes and joins all the workers in the pool.
    #[allow(clippy::unused_enumerate_index)]
    fn drop(&mut self) {
        log_debug!("[launcher] Notifying workers to finish...");
        self.shared.worker_signal.notify_all(WorkerSignal::Finished);

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
    shared: &'a SleepShared,
    has_workers: bool,
}

impl Drop for LaunchDrain<'_> {
    fn drop(&mut self) {
        // The last worker to finish the launch signals `Ready`. With no
        // workers, the launcher drained the whole launch itself and there is
        // nobody to wait for.
        if self.has_workers {
            let mut guard = self
                .shared
                .main_status
                .wait_while(|status| *status == MainStatus::Waiting);
            assert_eq!(*guard, MainStatus::Ready);
            *guard = MainStatus::Waiting;
            drop(guard);
        }

        let state = &self.shared.state;
        debug_assert_eq!(state.remaining.load(Ordering::SeqCst), 0);
        debug_assert_eq!(state.active_workers.load(Ordering::SeqCst), 0);
        state.task.write().unwrap().clear();
    }
}

/// Main function run by a sleeping worker.
fn worker_loop(_id: usize, shared: &SleepShared) {
    let mut epoch: u64 = 0;
    loop {
        epoch += 1;
        log_debug!("[worker {_id}, epoch {epoch}] Waiting for a launch");

        let signal: WorkerSignal = *shared.worker_signal.wait_while(|signal| match signal {
            WorkerSignal::Finished => false,
            // Wait until the epoch has advanced past what this worker last
            // saw.
            WorkerSignal::Launch(e) => *e < epoch,
        });
        match signal {
            WorkerSignal::Finished => {
                log_debug!("[worker {_id}, epoch {epoch}] Received finish signal");
                return;
            }
            WorkerSignal::Launch(e) => {
                // Launches advance in lockstep: the launcher publishes epoch
                // K+1 only after every worker has finished epoch K.
                assert_eq!(e, epoch);
                log_debug!("[worker {_id}, epoch {epoch}] Woke up for a new launch. Claiming...");

                // Whether the claim loop returns or unwinds, the launcher
                // must learn that this worker is done with the launch. This
                // happens when the notifier is dropped.
                let notifier = Notifier { shared };
                {
                    let guard = shared.state.task.read().unwrap();
                    // SAFETY: the launcher keeps the published task set alive
                    // and not mutated until all workers have finished this
                    // launch, as synchronized by `active_workers` and
                    // `main_status`.
                    let (task, num_tasks) = unsafe { guard.get().unwrap() };
                    shared.state.run_claimed(task, num_tasks);
                }
                drop(notifier);
            }
        }
    }
}

/// Object whose destructor notifies the launcher that a worker has finished
/// its launch (or has panicked).
struct Notifier<'a> {
    shared: &'a SleepShared,
}

impl Drop for Notifier<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.shared
                .state
                .panicking_workers
                .fetch_add(1, Ordering::SeqCst);
        }

        let active = self.shared.state.active_workers.fetch_sub(1, Ordering::SeqCst);
        assert!(active > 0);

        if active == 1 {
            // We're the last worker of this launch: wake up the launcher.
            match self.shared.main_status.try_notify_one(MainStatus::Ready) {
                Ok(_) => log_debug!("Notified the launcher."),
                Err(e) => {
                    log_error!("Failed to notify the launcher, the mutex was poisoned: {e:?}");
                    panic!("Failed to notify the launcher, the mutex was poisoned: {e:?}");
                }
            }
        }
    }
}
