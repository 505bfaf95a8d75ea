// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Task bodies used by the benchmark workloads.
//!
//! Output buffers are slices of atomics so that task bodies can write to
//! caller-owned memory through a shared reference; each id writes a disjoint
//! set of elements, so relaxed ordering is sufficient and the runner's
//! completion barrier makes the writes visible to the validation code.

use crate::runner::Task;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

/// Counts how many times each task id is invoked, to validate the
/// exactly-once contract.
pub struct ValidatorTask {
    counts: Vec<AtomicUsize>,
}

impl ValidatorTask {
    /// Creates a validator for launches of `num_tasks` tasks.
    pub fn new(num_tasks: usize) -> Self {
        Self {
            counts: (0..num_tasks).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    /// Number of times the given id was invoked.
    pub fn count(&self, task_id: usize) -> usize {
        self.counts[task_id].load(Ordering::Relaxed)
    }

    /// Whether every id was invoked exactly once.
    pub fn is_valid(&self) -> bool {
        self.counts
            .iter()
            .all(|count| count.load(Ordering::Relaxed) == 1)
    }
}

impl Task for ValidatorTask {
    fn run_task(&self, task_id: usize, num_tasks: usize) {
        assert!(num_tasks == self.counts.len() && task_id < num_tasks);
        self.counts[task_id].fetch_add(1, Ordering::Relaxed);
    }
}

/// A trivially cheap task: writes its own id to its output slot.
pub struct FastTask<'a> {
    output: &'a [AtomicI64],
}

impl<'a> FastTask<'a> {
    /// Creates a fast task writing to the given buffer, one slot per id.
    pub fn new(output: &'a [AtomicI64]) -> Self {
        Self { output }
    }
}

impl Task for FastTask<'_> {
    fn run_task(&self, task_id: usize, _num_tasks: usize) {
        self.output[task_id].store(task_id as i64, Ordering::Relaxed);
    }
}

/// Computes the `n`-th Fibonacci number by naive recursion.
pub fn recursive_fibonacci(n: u32) -> u64 {
    if n == 0 {
        0
    } else if n == 1 {
        1
    } else {
        recursive_fibonacci(n - 1) + recursive_fibonacci(n - 2)
    }
}

/// A deliberately expensive task: computes a Fibonacci number by naive
/// recursion and writes it to its output slot.
pub struct RecursiveFibonacciTask<'a> {
    output: &'a [AtomicU64],
    n: u32,
}

impl<'a> RecursiveFibonacciTask<'a> {
    /// Creates a task computing `fibonacci(n)` into the given buffer, one
    /// slot per id.
    pub fn new(output: &'a [AtomicU64], n: u32) -> Self {
        Self { output, n }
    }
}

impl Task for RecursiveFibonacciTask<'_> {
    fn run_task(&self, task_id: usize, _num_tasks: usize) {
        self.output[task_id].store(recursive_fibonacci(self.n), Ordering::Relaxed);
    }
}

/// One direction of a ping-pong pass: each task transforms a contiguous chunk
/// of the input buffer into the output buffer. Successive launches swap the
/// two buffers.
pub struct PingPongTask<'a> {
    num_elements: usize,
    input: &'a [AtomicI64],
    output: &'a [AtomicI64],
    equal_work: bool,
    base_iterations: usize,
}

impl<'a> PingPongTask<'a> {
    /// Creates one ping-pong pass over `num_elements` elements.
    ///
    /// With `equal_work`, every element runs `base_iterations` iterations of
    /// the work function; otherwise the iteration count decreases linearly
    /// with the element index, which makes early tasks far more expensive
    /// than late ones.
    pub fn new(
        num_elements: usize,
        input: &'a [AtomicI64],
        output: &'a [AtomicI64],
        equal_work: bool,
        base_iterations: usize,
    ) -> Self {
        Self {
            num_elements,
            input,
            output,
            equal_work,
            base_iterations,
        }
    }

    /// Iteration count for the element at index `i` in the unequal-work
    /// variant.
    pub fn num_iterations(&self, i: usize) -> usize {
        let max_iters = (2 * self.base_iterations) as f32;
        (((self.num_elements - i) as f32 / self.num_elements as f32) * max_iters).floor() as usize
    }

    /// The per-element work function: adds one to the accumulator on every
    /// even iteration, so `iterations` iterations add `(iterations + 1) / 2`.
    pub fn work(iterations: usize, input: i64) -> i64 {
        let mut accum = input;
        for j in 0..iterations {
            if j % 2 == 0 {
                accum += 1;
            }
        }
        accum
    }
}

impl Task for PingPongTask<'_> {
    fn run_task(&self, task_id: usize, num_tasks: usize) {
        // The element count may not be evenly divisible by the task count;
        // the last task picks up the remainder.
        let elements_per_task = self.num_elements.div_ceil(num_tasks);
        let start_index = elements_per_task * task_id;
        let end_index = (start_index + elements_per_task).min(self.num_elements);

        if self.equal_work {
            for i in start_index..end_index {
                let input = self.input[i].load(Ordering::Relaxed);
                self.output[i].store(Self::work(self.base_iterations, input), Ordering::Relaxed);
            }
        } else {
            for i in start_index..end_index {
                let iterations = self.num_iterations(i);
                let input = self.input[i].load(Ordering::Relaxed);
                self.output[i].store(Self::work(iterations, input), Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fibonacci_small_values() {
        let expected = [0, 1, 1, 2, 3, 5, 8, 13, 21, 34];
        for (n, &value) in expected.iter().enumerate() {
            assert_eq!(recursive_fibonacci(n as u32), value);
        }
    }

    #[test]
    fn work_adds_half_the_iterations_rounded_up() {
        for iterations in 0..10 {
            assert_eq!(
                PingPongTask::work(iterations, 100),
                100 + (iterations as i64 + 1) / 2
            );
        }
    }

    #[test]
    fn validator_counts_invocations() {
        let validator = ValidatorTask::new(3);
        assert!(!validator.is_valid());
        for task_id in 0..3 {
            validator.run_task(task_id, 3);
        }
        assert!(validator.is_valid());
        validator.run_task(1, 3);
        assert!(!validator.is_valid());
        assert_eq!(validator.count(1), 2);
    }

    #[test]
    fn ping_pong_covers_uneven_chunks() {
        // 10 elements over 4 tasks: chunks of 3, 3, 3, 1.
        let input: Vec<AtomicI64> = (0..10).map(AtomicI64::new).collect();
        let output: Vec<AtomicI64> = (0..10).map(|_| AtomicI64::new(0)).collect();
        let task = PingPongTask::new(10, &input, &output, true, 2);
        for task_id in 0..4 {
            task.run_task(task_id, 4);
        }
        for (i, out) in output.iter().enumerate() {
            assert_eq!(out.load(Ordering::Relaxed), i as i64 + 1);
        }
    }

    #[test]
    fn unequal_iterations_decrease_with_index() {
        let input: Vec<AtomicI64> = (0..8).map(AtomicI64::new).collect();
        let output: Vec<AtomicI64> = (0..8).map(|_| AtomicI64::new(0)).collect();
        let task = PingPongTask::new(8, &input, &output, false, 16);
        assert_eq!(task.num_iterations(0), 32);
        assert!(task.num_iterations(7) < task.num_iterations(0));
    }
}
