// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Synchronization primitives shared by the pool-based runners.

use super::Task;
use crate::macros::log_error;
use crossbeam_utils::CachePadded;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, RwLock};

/// An ergonomic wrapper around a [`Mutex`]-[`Condvar`] pair.
pub(crate) struct Status<T> {
    mutex: Mutex<T>,
    condvar: Condvar,
}

impl<T> Status<T> {
    /// Creates a new status initialized with the given value.
    pub(crate) fn new(t: T) -> Self {
        Self {
            mutex: Mutex::new(t),
            condvar: Condvar::new(),
        }
    }

    /// Attempts to set the status to the given value and notifies one waiting
    /// thread.
    ///
    /// Fails if the [`Mutex`] is poisoned.
    pub(crate) fn try_notify_one(&self, t: T) -> Result<(), PoisonError<MutexGuard<'_, T>>> {
        *self.mutex.lock()? = t;
        self.condvar.notify_one();
        Ok(())
    }

    /// Sets the status to the given value and notifies all waiting threads.
    pub(crate) fn notify_all(&self, t: T) {
        *self.mutex.lock().unwrap() = t;
        self.condvar.notify_all();
    }

    /// Waits until the predicate is false on this status.
    ///
    /// This returns a [`MutexGuard`], allowing to further inspect or modify
    /// the status.
    pub(crate) fn wait_while(&self, predicate: impl FnMut(&mut T) -> bool) -> MutexGuard<'_, T> {
        self.condvar
            .wait_while(self.mutex.lock().unwrap(), predicate)
            .unwrap()
    }
}

/// A lifetime-erased view of the task set published for one launch. This acts
/// as a `&'a dyn Task` paired with the task count, but whose lifetime can be
/// adjusted via the `unsafe` function [`get()`](Self::get).
pub(crate) struct TaskView {
    ptr: Option<NonNull<dyn Task + 'static>>,
    num_tasks: usize,
}

impl TaskView {
    /// Creates a new empty view.
    pub(crate) fn empty() -> Self {
        Self {
            ptr: None,
            num_tasks: 0,
        }
    }

    /// Publishes the given task set. Subsequent calls to [`get()`](Self::get)
    /// must ensure that the obtained reference doesn't outlive the reference
    /// that was set here.
    // The lifetime is erased to 'static; `get()` restores an appropriate one.
    pub(crate) fn set(&mut self, task: &dyn Task, num_tasks: usize) {
        // SAFETY: Erasing the lifetime of a trait-object pointer via `transmute`
        // keeps the pointer (data and vtable) bit-identical. Raw-pointer `as`
        // casts can no longer extend trait-object lifetimes. `get()` documents
        // the obligation not to let the restored reference outlive `task`.
        let ptr: NonNull<dyn Task + 'static> =
            unsafe { std::mem::transmute::<NonNull<dyn Task>, NonNull<dyn Task + 'static>>(NonNull::from(task)) };
        self.ptr = Some(ptr);
        self.num_tasks = num_tasks;
    }

    /// Clears the underlying reference. Subsequent calls to
    /// [`get()`](Self::get) will obtain [`None`].
    pub(crate) fn clear(&mut self) {
        self.ptr = None;
        self.num_tasks = 0;
    }

    /// Returns the task set that was previously published with
    /// [`set()`](Self::set), or [`None`] if no task set is published.
    ///
    /// # Safety
    ///
    /// The underlying task must be valid and not mutated during the whole
    /// output lifetime.
    // The cast is necessary because the lifetime is coerced to 'a.
    #[allow(clippy::unnecessary_cast)]
    pub(crate) unsafe fn get<'a>(&self) -> Option<(&'a (dyn Task + 'a), usize)> {
        self.ptr.map(|static_ptr| {
            let ptr = static_ptr.as_ptr() as *mut (dyn Task + 'a);
            // SAFETY:
            // - This pointer points to a valid initialized task, as previously set via
            //   `set()`.
            // - The underlying task outlives the output lifetime, as ensured by the
            //   caller.
            // - The underlying task isn't mutated during the whole output lifetime, as
            //   ensured by the caller.
            let task = unsafe { &*ptr };
            (task, self.num_tasks)
        })
    }
}

/// SAFETY:
///
/// A [`TaskView`] acts as a [`&'a dyn Task`](reference), and [`Task`] requires
/// [`Sync`]. Therefore it is [`Send`].
unsafe impl Send for TaskView {}
/// SAFETY:
///
/// A [`TaskView`] acts as a [`&'a dyn Task`](reference), and [`Task`] requires
/// [`Sync`]. Therefore it is [`Sync`].
unsafe impl Sync for TaskView {}

/// State shared between the launching thread and the persistent workers of a
/// pool-based runner, valid for one launch at a time.
///
/// The launcher must call [`begin()`](Self::begin) and publish the task set
/// before signaling a new launch to the workers, and must wait for both
/// [`remaining`](Self::remaining) and [`active_workers`](Self::active_workers)
/// to reach zero before this state may be reused for the next launch.
pub(crate) struct LaunchState {
    /// Claim cursor: the next unclaimed task id of the current launch.
    pub(crate) cursor: CachePadded<AtomicUsize>,
    /// Number of task ids of the current launch that haven't completed yet.
    pub(crate) remaining: CachePadded<AtomicUsize>,
    /// Number of pool workers that haven't finished the current launch yet.
    pub(crate) active_workers: CachePadded<AtomicUsize>,
    /// Number of workers that panicked while executing the current launch.
    pub(crate) panicking_workers: CachePadded<AtomicUsize>,
    /// Task set currently published to the workers.
    pub(crate) task: RwLock<TaskView>,
}

impl LaunchState {
    /// Creates an empty launch state with no published task set.
    pub(crate) fn new() -> Self {
        Self {
            cursor: CachePadded::new(AtomicUsize::new(0)),
            remaining: CachePadded::new(AtomicUsize::new(0)),
            active_workers: CachePadded::new(AtomicUsize::new(0)),
            panicking_workers: CachePadded::new(AtomicUsize::new(0)),
            task: RwLock::new(TaskView::empty()),
        }
    }

    /// Resets the per-launch counters. Must happen before the new launch is
    /// signaled to the workers, so that the signal's release ordering makes
    /// the reset visible to every worker.
    pub(crate) fn begin(&self, num_workers: usize, num_tasks: usize) {
        self.cursor.store(0, Ordering::SeqCst);
        self.remaining.store(num_tasks, Ordering::SeqCst);
        self.active_workers.store(num_workers, Ordering::SeqCst);
    }

    /// Claims task ids from the shared cursor and executes them until the
    /// cursor is exhausted. Called by every participant of a launch: the pool
    /// workers and the launching thread itself.
    pub(crate) fn run_claimed(&self, task: &dyn Task, num_tasks: usize) {
        loop {
            let task_id = self.cursor.fetch_add(1, Ordering::SeqCst);
            if task_id >= num_tasks {
                break;
            }
            // The guard decrements `remaining` even if the task body panics,
            // so that a launch always drains and the launcher never deadlocks.
            let done = TaskDoneGuard {
                remaining: &self.remaining,
            };
            task.run_task(task_id, num_tasks);
            drop(done);
        }
    }

    /// Re-raises on the calling thread after a launch has drained, if any
    /// worker panicked while executing it.
    pub(crate) fn check_worker_panics(&self) {
        let num_panicking = self.panicking_workers.load(Ordering::SeqCst);
        if num_panicking != 0 {
            log_error!("{num_panicking} worker thread(s) panicked!");
            panic!("{num_panicking} worker thread(s) panicked!");
        }
    }
}

/// Marks one claimed task id as completed when dropped, whether the task body
/// returned or unwound.
struct TaskDoneGuard<'a> {
    remaining: &'a AtomicUsize,
}

impl Drop for TaskDoneGuard<'_> {
    fn drop(&mut self) {
        let remaining = self.remaining.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(remaining > 0);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::panic::AssertUnwindSafe;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct CountingTask {
        counts: Vec<AtomicUsize>,
    }

    impl CountingTask {
        fn new(num_tasks: usize) -> Self {
            Self {
                counts: (0..num_tasks).map(|_| AtomicUsize::new(0)).collect(),
            }
        }
    }

    impl Task for CountingTask {
        fn run_task(&self, task_id: usize, num_tasks: usize) {
            assert_eq!(num_tasks, self.counts.len());
            self.counts[task_id].fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn status_notify_all_wakes_waiter() {
        let status = Arc::new(Status::new(0));

        let waiter = std::thread::spawn({
            let status = status.clone();
            move || {
                let guard = status.wait_while(|s| *s != 42);
                *guard
            }
        });

        status.notify_all(42);
        assert_eq!(waiter.join().unwrap(), 42);
    }

    #[test]
    fn task_view_set_get_clear() {
        let mut view = TaskView::empty();
        assert!(unsafe { view.get() }.is_none());

        let task = CountingTask::new(3);
        view.set(&task, 3);
        let (view_task, num_tasks) = unsafe { view.get().unwrap() };
        assert_eq!(num_tasks, 3);
        view_task.run_task(1, 3);
        assert_eq!(task.counts[1].load(Ordering::Relaxed), 1);

        view.clear();
        assert!(unsafe { view.get() }.is_none());
    }

    #[test]
    fn run_claimed_executes_each_id_once() {
        const NUM_TASKS: usize = 1000;
        const NUM_THREADS: usize = 4;

        let state = LaunchState::new();
        let task = CountingTask::new(NUM_TASKS);
        state.begin(NUM_THREADS - 1, NUM_TASKS);

        std::thread::scope(|scope| {
            for _ in 1..NUM_THREADS {
                scope.spawn(|| state.run_claimed(&task, NUM_TASKS));
            }
            state.run_claimed(&task, NUM_TASKS);
        });

        assert_eq!(state.remaining.load(Ordering::SeqCst), 0);
        for count in &task.counts {
            assert_eq!(count.load(Ordering::Relaxed), 1);
        }
    }

    #[test]
    fn run_claimed_drains_remaining_on_panic() {
        struct PanickingTask;

        impl Task for PanickingTask {
            fn run_task(&self, task_id: usize, _num_tasks: usize) {
                if task_id == 1 {
                    panic!("task failure");
                }
            }
        }

        let state = LaunchState::new();
        state.begin(0, 3);

        let result =
            std::panic::catch_unwind(AssertUnwindSafe(|| state.run_claimed(&PanickingTask, 3)));
        assert!(result.is_err());
        // Ids 0 and 1 were claimed and drained; id 2 was never claimed.
        assert_eq!(state.remaining.load(Ordering::SeqCst), 1);
    }
}
