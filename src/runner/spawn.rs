// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Spawn runner: fork-join with fresh threads on every launch.

use super::Task;
use crate::macros::log_debug;

/// Parallelizes each launch by spawning fresh scoped threads and joining them
/// all before returning.
///
/// Task ids are assigned in a strided pattern: thread rank `r` executes ids
/// `r, r + T, r + 2T, ...` for `T` participating threads. Interleaving keeps
/// the ranks balanced when the task cost grows with the id, unlike contiguous
/// blocks where the last rank would receive all the expensive tasks.
///
/// Thread creation and destruction is paid on every launch, so this runner is
/// expected to lose against the persistent pools on launch-heavy workloads
/// with cheap tasks.
pub(crate) struct SpawnRunner {
    num_threads: usize,
}

impl SpawnRunner {
    pub(crate) fn new(num_threads: usize) -> Self {
        Self { num_threads }
    }

    pub(crate) fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// If a spawned thread panics, [`std::thread::scope`] re-raises on the
    /// calling thread only after all the threads of the launch are joined.
    pub(crate) fn run(&mut self, task: &dyn Task, num_tasks: usize) {
        // Never spawn more threads than there are tasks.
        let num_participants = self.num_threads.min(num_tasks).max(1);

        log_debug!("[launcher] Spawning {} threads", num_participants - 1);
        std::thread::scope(|scope| {
            for rank in 1..num_participants {
                scope.spawn(move || run_strided(task, rank, num_participants, num_tasks));
            }
            // The calling thread participates as rank 0.
            run_strided(task, 0, num_participants, num_tasks);
        });
        log_debug!("[launcher] Joined all threads of this launch");
    }
}

/// Executes the strided id sequence of one thread rank.
fn run_strided(task: &dyn Task, rank: usize, num_participants: usize, num_tasks: usize) {
    for task_id in (rank..num_tasks).step_by(num_participants) {
        task.run_task(task_id, num_tasks);
    }
}
