// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the priority scheduler.
//!
//! The scheduler keeps one FIFO ready queue per [`Priority`]
//! level. Picking the next thread scans the queues from
//! `Realtime` down to `Idle` and takes the head of the first
//! non-empty queue; the idle thread runs when nothing else can.
//! A thread that is still running when the scheduler is invoked
//! rejoins the tail of its priority's queue, which is what makes
//! sharing within a level round-robin.
//!
//! The scheduler never performs a context switch itself: each
//! scheduling decision reports the `(previous, next)` pair, and
//! the caller drives the architecture switch (see
//! [`switch`](crate::switch)) with the scheduler lock released.
//! On the timer tick the scheduler advances its nanosecond
//! clock, charges the running thread, and reports which blocked
//! threads have reached their deadlines.

use crate::thread::{Priority, ThreadState, ThreadTable};
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use serial::println;
use syscalls::{EndpointId, ThreadId};

/// A basic preemptive thread scheduler.
///
/// Five ready queues, one per priority level, FIFO within a
/// queue. Scheduling never fails; a missing idle thread is a
/// fatal configuration error.
///
pub struct Scheduler {
    // The ready queues, indexed by priority.
    ready: [VecDeque<ThreadId>; Priority::COUNT],

    // The thread currently executing.
    current: ThreadId,

    // The idle thread, which runs when every queue is
    // empty. Never enters a ready queue.
    idle: Option<ThreadId>,

    // The scheduler's monotonic clock, in nanoseconds.
    now: u64,
}

impl Scheduler {
    /// Returns a new scheduler with no threads.
    ///
    /// The idle thread must be registered with
    /// [`set_idle_thread`](Self::set_idle_thread) before the
    /// first call to [`schedule`](Self::schedule).
    ///
    pub fn new() -> Scheduler {
        Scheduler {
            ready: [
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
            ],
            current: ThreadId::IDLE,
            idle: None,
            now: 0,
        }
    }

    /// Registers the idle thread and makes it current.
    ///
    pub fn set_idle_thread(&mut self, idle: ThreadId) {
        self.idle = Some(idle);
        self.current = idle;
    }

    /// Returns the currently executing thread.
    ///
    pub fn current_thread(&self) -> ThreadId {
        self.current
    }

    /// Returns the scheduler's clock, in nanoseconds.
    ///
    pub fn now(&self) -> u64 {
        self.now
    }

    fn idle_thread(&self) -> ThreadId {
        match self.idle {
            Some(idle) => idle,
            None => panic!("BROKEN INVARIANT: scheduler has no idle thread"),
        }
    }

    /// Queues a ready thread onto its priority's ready
    /// queue. The currently running thread is unaffected.
    ///
    pub fn add_thread(&mut self, threads: &ThreadTable, thread: ThreadId) {
        if let Some(found) = threads.get(thread) {
            self.ready[found.priority().as_index()].push_back(thread);
        }
    }

    /// Removes the thread from the ready queues. The
    /// currently running thread is unaffected.
    ///
    pub fn remove_thread(&mut self, thread: ThreadId) {
        for queue in self.ready.iter_mut() {
            queue.retain(|id| *id != thread);
        }
    }

    /// Removes and returns the next thread able to run:
    /// the head of the highest-priority non-empty queue,
    /// or the idle thread.
    ///
    /// Threads that are no longer ready are discarded as
    /// they surface.
    ///
    pub fn pick_next(&mut self, threads: &ThreadTable) -> ThreadId {
        for queue in self.ready.iter_mut().rev() {
            while let Some(thread) = queue.pop_front() {
                match threads.get(thread) {
                    Some(found) if found.state() == ThreadState::Ready => return thread,
                    Some(found) if found.state() == ThreadState::Running => return thread,
                    _ => {} // Stale entry; drop it.
                }
            }
        }

        self.idle_thread()
    }

    /// Selects the next thread to run.
    ///
    /// A previous thread that is still running rejoins the
    /// tail of its priority's queue. If a different thread
    /// is selected, it is marked running and the
    /// `(previous, next)` pair is returned so the caller can
    /// perform the context switch; `None` means the current
    /// thread simply keeps the CPU.
    ///
    pub fn schedule(&mut self, threads: &mut ThreadTable) -> Option<(ThreadId, ThreadId)> {
        let idle = self.idle_thread();
        let prev = self.current;

        let prev_running = threads
            .get(prev)
            .map(|thread| thread.state() == ThreadState::Running)
            .unwrap_or(false);

        // A still-running thread goes back to the tail of
        // its queue; the idle thread never queues.
        if prev_running && prev != idle {
            if let Some(thread) = threads.get_mut(prev) {
                thread.set_state(ThreadState::Ready);
                self.ready[thread.priority().as_index()].push_back(prev);
            }
        }

        let next = self.pick_next(threads);
        if next == prev {
            // The same thread keeps the CPU.
            if let Some(thread) = threads.get_mut(prev) {
                thread.set_state(ThreadState::Running);
            }

            return None;
        }

        if prev_running && prev == idle {
            if let Some(thread) = threads.get_mut(idle) {
                thread.set_state(ThreadState::Ready);
            }
        }

        if let Some(thread) = threads.get_mut(next) {
            thread.set_state(ThreadState::Running);
        }

        self.current = next;
        Some((prev, next))
    }

    /// Gives up the CPU voluntarily: the current thread is
    /// marked ready and the scheduler runs.
    ///
    pub fn yield_now(&mut self, threads: &mut ThreadTable) -> Option<(ThreadId, ThreadId)> {
        self.schedule(threads)
    }

    /// Suspends the current thread, optionally with a wake
    /// deadline and the endpoint it is waiting on, and
    /// selects the next thread.
    ///
    /// # Panics
    ///
    /// `block_current` will panic if the idle thread tries
    /// to block; the idle thread must always be runnable.
    ///
    pub fn block_current(
        &mut self,
        threads: &mut ThreadTable,
        wake_at: Option<u64>,
        endpoint: Option<EndpointId>,
    ) -> Option<(ThreadId, ThreadId)> {
        if self.current == self.idle_thread() {
            panic!("BROKEN INVARIANT: idle thread tried to block");
        }

        if let Some(thread) = threads.get_mut(self.current) {
            thread.block(wake_at, endpoint);
        }

        self.schedule(threads)
    }

    /// Makes a blocked thread runnable again, queueing it at
    /// the tail of its priority's ready queue. Threads that
    /// are not blocked are left alone.
    ///
    pub fn unblock(&mut self, threads: &mut ThreadTable, thread: ThreadId) {
        let ready = match threads.get_mut(thread) {
            Some(found) if found.state() == ThreadState::Blocked => {
                found.unblock();
                true
            }
            _ => false,
        };

        if ready {
            self.add_thread(threads, thread);
        }
    }

    /// Advances the scheduler clock by `delta` nanoseconds,
    /// charging the running thread, and returns the blocked
    /// threads whose deadlines have now passed.
    ///
    /// The caller wakes the expired threads (removing them
    /// from whatever wait queues they sit on) and then calls
    /// [`schedule`](Self::schedule) to preempt.
    ///
    pub fn tick(&mut self, threads: &mut ThreadTable, delta: u64) -> Vec<ThreadId> {
        self.now += delta;
        if let Some(thread) = threads.get_mut(self.current) {
            thread.charge(delta);
        }

        let now = self.now;
        threads
            .iter()
            .filter(|thread| {
                thread.state() == ThreadState::Blocked
                    && thread.wake_at().map(|at| at <= now).unwrap_or(false)
            })
            .map(|thread| thread.id())
            .collect()
    }

    /// Prints the current set of threads and their
    /// scheduling state.
    ///
    pub fn debug(&self, threads: &ThreadTable) {
        println!("Scheduler: current {:?} at {} ns", self.current, self.now);
        for thread in threads.iter() {
            println!(
                "  {:?} {:?} {:?}: {:?}",
                thread.id(),
                thread.process(),
                thread.priority(),
                thread.state()
            );
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
