// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Core engine: the task and runner contracts and the four scheduling
//! strategies.

mod serial;
mod sleep;
mod spawn;
mod spin;
mod sync;

#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use crate::macros::log_debug;
use crate::macros::log_warn;
use serial::SerialRunner;
use sleep::SleepRunner;
use spawn::SpawnRunner;
use spin::SpinRunner;
use std::convert::TryFrom;
use std::num::NonZeroUsize;

/// A unit of work that a [`Runner`] can launch in bulk.
///
/// The task body is invoked once per id in `0..num_tasks` per launch. Bodies
/// belonging to the same launch may run concurrently on different threads, in
/// any order: a body may read and write caller-owned memory, but must not
/// assume exclusive access beyond the data associated with its own id.
///
/// Any closure `Fn(task_id, num_tasks)` that is [`Sync`] is a task.
pub trait Task: Sync {
    /// Executes the unit of work with the given id.
    ///
    /// `num_tasks` is the total number of tasks in the launch, so a body can
    /// derive the slice of data it is responsible for.
    fn run_task(&self, task_id: usize, num_tasks: usize);
}

impl<F: Fn(usize, usize) + Sync> Task for F {
    fn run_task(&self, task_id: usize, num_tasks: usize) {
        self(task_id, num_tasks)
    }
}

/// Number of threads participating in each launch, including the calling
/// thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadCount {
    /// Use the number of threads returned by
    /// [`std::thread::available_parallelism()`].
    AvailableParallelism,
    /// Use the given number of threads.
    Count(NonZeroUsize),
}

impl TryFrom<usize> for ThreadCount {
    type Error = <NonZeroUsize as TryFrom<usize>>::Error;

    fn try_from(thread_count: usize) -> Result<Self, Self::Error> {
        let count = NonZeroUsize::try_from(thread_count)?;
        Ok(ThreadCount::Count(count))
    }
}

/// Policy to pin the persistent worker threads of a pool-based runner to
/// CPUs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuPinningPolicy {
    /// Don't pin worker threads to CPUs.
    No,
    /// Pin each worker thread to a CPU, if CPU pinning is supported and
    /// implemented on this platform.
    IfSupported,
    /// Pin each worker thread to a CPU. If CPU pinning isn't supported on
    /// this platform (or not implemented), building a pool-based runner will
    /// panic.
    Always,
}

/// The scheduling strategy of a [`Runner`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunnerKind {
    /// Run every task on the calling thread, in increasing id order.
    Serial,
    /// Fork-join: spawn fresh threads for every launch and join them all
    /// before returning.
    Spawn,
    /// Persistent pool whose idle workers busy-wait for the next launch.
    Spin,
    /// Persistent pool whose idle workers block on a condition variable until
    /// the next launch.
    Sleep,
}

impl RunnerKind {
    /// All the strategies, in benchmark-reporting order.
    pub const ALL: [RunnerKind; 4] = [
        RunnerKind::Serial,
        RunnerKind::Spawn,
        RunnerKind::Spin,
        RunnerKind::Sleep,
    ];

    /// A stable lowercase name for this strategy.
    pub fn name(self) -> &'static str {
        match self {
            RunnerKind::Serial => "serial",
            RunnerKind::Spawn => "spawn",
            RunnerKind::Spin => "spin",
            RunnerKind::Sleep => "sleep",
        }
    }
}

/// A builder for [`Runner`].
pub struct RunnerBuilder {
    /// Scheduling strategy of the runner.
    pub kind: RunnerKind,
    /// Number of threads participating in each launch, including the calling
    /// thread. A pool-based runner spawns one fewer worker than this count.
    /// Ignored by the [`Serial`](RunnerKind::Serial) strategy.
    pub num_threads: ThreadCount,
    /// Policy to pin worker threads to CPUs. Only applies to the persistent
    /// pool strategies.
    pub cpu_pinning: CpuPinningPolicy,
}

impl RunnerBuilder {
    /// Builds a runner, spawning its persistent workers if the strategy has
    /// any.
    ///
    /// ```
    /// # use std::sync::atomic::{AtomicUsize, Ordering};
    /// # use taskpool::{CpuPinningPolicy, RunnerBuilder, RunnerKind, ThreadCount};
    /// let mut runner = RunnerBuilder {
    ///     kind: RunnerKind::Spin,
    ///     num_threads: ThreadCount::AvailableParallelism,
    ///     cpu_pinning: CpuPinningPolicy::No,
    /// }
    /// .build();
    ///
    /// let counter = AtomicUsize::new(0);
    /// runner.run(
    ///     &|_task_id: usize, _num_tasks: usize| {
    ///         counter.fetch_add(1, Ordering::Relaxed);
    ///     },
    ///     42,
    /// );
    /// assert_eq!(counter.into_inner(), 42);
    /// ```
    pub fn build(&self) -> Runner {
        Runner::new(self)
    }
}

/// A bulk-synchronous task launcher.
///
/// A runner owns its persistent worker threads (if its strategy has any) for
/// its whole lifetime: workers are spawned once when the runner is built and
/// joined once when it is dropped, never per launch.
pub struct Runner {
    inner: RunnerEnum,
}

/// Underlying [`Runner`] implementation, dispatching over the [`RunnerKind`].
enum RunnerEnum {
    Serial(SerialRunner),
    Spawn(SpawnRunner),
    Spin(SpinRunner),
    Sleep(SleepRunner),
}

impl Runner {
    /// Creates a new runner using the given parameters.
    fn new(builder: &RunnerBuilder) -> Self {
        let num_threads: NonZeroUsize = match builder.num_threads {
            ThreadCount::AvailableParallelism => std::thread::available_parallelism()
                .expect("Getting the available parallelism failed"),
            ThreadCount::Count(count) => count,
        };
        let num_threads: usize = num_threads.into();
        let inner = match builder.kind {
            RunnerKind::Serial => RunnerEnum::Serial(SerialRunner),
            RunnerKind::Spawn => RunnerEnum::Spawn(SpawnRunner::new(num_threads)),
            RunnerKind::Spin => {
                check_pinning_support(builder.cpu_pinning);
                RunnerEnum::Spin(SpinRunner::new(num_threads, builder.cpu_pinning))
            }
            RunnerKind::Sleep => {
                check_pinning_support(builder.cpu_pinning);
                RunnerEnum::Sleep(SleepRunner::new(num_threads, builder.cpu_pinning))
            }
        };
        Self { inner }
    }

    /// The scheduling strategy of this runner.
    pub fn kind(&self) -> RunnerKind {
        match &self.inner {
            RunnerEnum::Serial(_) => RunnerKind::Serial,
            RunnerEnum::Spawn(_) => RunnerKind::Spawn,
            RunnerEnum::Spin(_) => RunnerKind::Spin,
            RunnerEnum::Sleep(_) => RunnerKind::Sleep,
        }
    }

    /// Number of threads participating in each launch, including the calling
    /// thread.
    pub fn num_threads(&self) -> NonZeroUsize {
        match &self.inner {
            RunnerEnum::Serial(_) => 1,
            RunnerEnum::Spawn(runner) => runner.num_threads(),
            RunnerEnum::Spin(runner) => runner.num_threads(),
            RunnerEnum::Sleep(runner) => runner.num_threads(),
        }
        .try_into()
        .unwrap()
    }

    /// Launches `num_tasks` tasks and blocks until every one of them has
    /// completed.
    ///
    /// Each id in `0..num_tasks` is executed exactly once, with no ordering
    /// guarantee between ids of the same launch. Successive launches on the
    /// same runner are strictly ordered: no task of this launch starts before
    /// every task of the previous launch has completed, and all side effects
    /// of the launch are visible to the caller when this returns, without
    /// additional synchronization.
    ///
    /// `num_tasks == 0` is legal and returns immediately having executed no
    /// task bodies.
    ///
    /// # Panics
    ///
    /// If a task body panics, the panic is re-raised on the calling thread
    /// once all in-flight tasks of the launch have drained. A pool-based
    /// runner whose worker observed a panic is poisoned and must be dropped.
    pub fn run(&mut self, task: &dyn Task, num_tasks: usize) {
        if num_tasks == 0 {
            return;
        }
        match &mut self.inner {
            RunnerEnum::Serial(runner) => runner.run(task, num_tasks),
            RunnerEnum::Spawn(runner) => runner.run(task, num_tasks),
            RunnerEnum::Spin(runner) => runner.run(task, num_tasks),
            RunnerEnum::Sleep(runner) => runner.run(task, num_tasks),
        }
    }
}

/// Pins the calling worker thread to a CPU according to the policy.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
pub(crate) fn pin_worker_thread(cpu_pinning: CpuPinningPolicy, id: usize) {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    match cpu_pinning {
        CpuPinningPolicy::No => (),
        CpuPinningPolicy::IfSupported => {
            let mut cpu_set = CpuSet::new();
            if let Err(_e) = cpu_set.set(id) {
                log_warn!("Failed to set CPU affinity for thread #{id}: {_e}");
            } else if let Err(_e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
                log_warn!("Failed to set CPU affinity for thread #{id}: {_e}");
            } else {
                log_debug!("Pinned thread #{id} to CPU #{id}");
            }
        }
        CpuPinningPolicy::Always => {
            let mut cpu_set = CpuSet::new();
            if let Err(e) = cpu_set.set(id) {
                panic!("Failed to set CPU affinity for thread #{id}: {e}");
            } else if let Err(e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
                panic!("Failed to set CPU affinity for thread #{id}: {e}");
            } else {
                log_debug!("Pinned thread #{id} to CPU #{id}");
            }
        }
    }
}

/// Pins the calling worker thread to a CPU according to the policy.
///
/// Not implemented on this platform; feasibility was already checked when the
/// pool was built.
#[cfg(any(
    miri,
    not(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    ))
))]
pub(crate) fn pin_worker_thread(_cpu_pinning: CpuPinningPolicy, _id: usize) {}

/// Checks that the pinning policy can be honored on this platform before any
/// pool worker is spawned.
#[cfg(any(
    miri,
    not(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    ))
))]
fn check_pinning_support(cpu_pinning: CpuPinningPolicy) {
    match cpu_pinning {
        CpuPinningPolicy::No => (),
        CpuPinningPolicy::IfSupported => {
            log_warn!("Pinning threads to CPUs is not implemented on this platform.")
        }
        CpuPinningPolicy::Always => {
            panic!("Pinning threads to CPUs is not implemented on this platform.")
        }
    }
}

/// Checks that the pinning policy can be honored on this platform before any
/// pool worker is spawned.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
fn check_pinning_support(_cpu_pinning: CpuPinningPolicy) {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn thread_count_try_from_usize() {
        assert!(ThreadCount::try_from(0).is_err());
        assert_eq!(
            ThreadCount::try_from(1),
            Ok(ThreadCount::Count(NonZeroUsize::try_from(1).unwrap()))
        );
    }

    #[test]
    fn build_each_kind() {
        for kind in RunnerKind::ALL {
            let runner = RunnerBuilder {
                kind,
                num_threads: ThreadCount::try_from(4).unwrap(),
                cpu_pinning: CpuPinningPolicy::No,
            }
            .build();
            assert_eq!(runner.kind(), kind);
            let expected_threads = match kind {
                RunnerKind::Serial => 1,
                _ => 4,
            };
            assert_eq!(runner.num_threads().get(), expected_threads);
        }
    }

    #[test]
    fn zero_tasks_returns_immediately() {
        for kind in RunnerKind::ALL {
            let mut runner = RunnerBuilder {
                kind,
                num_threads: ThreadCount::try_from(2).unwrap(),
                cpu_pinning: CpuPinningPolicy::No,
            }
            .build();
            runner.run(
                &|_task_id: usize, _num_tasks: usize| {
                    panic!("no task body should run");
                },
                0,
            );
        }
    }
}
