// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements threads, the unit of execution the scheduler
//! multiplexes.
//!
//! Each thread belongs to exactly one process and carries its
//! own kernel stack, saved stack pointer, scheduling priority,
//! and accumulated CPU time. The [`ThreadTable`] owns every
//! thread and hands out monotonically increasing ids; processes
//! and the scheduler refer to threads by id only.

use alloc::collections::btree_map::BTreeMap;
use memory::{PhysFrameRange, VirtAddr};
use syscalls::{EndpointId, Error, ProcessId, ThreadId};

/// The scheduling priority of a thread.
///
/// Higher priorities always run before lower ones; threads at
/// the same priority share the CPU round-robin.
///
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum Priority {
    /// The idle priority. Only the idle thread runs here.
    Idle = 0,

    /// Background work.
    Low = 1,

    /// The default priority.
    Normal = 2,

    /// Latency-sensitive work.
    High = 3,

    /// Runs before everything else.
    Realtime = 4,
}

impl Priority {
    /// The number of distinct priority levels.
    ///
    pub const COUNT: usize = 5;

    /// Returns the priority's ready-queue index.
    ///
    pub const fn as_index(self) -> usize {
        self as usize
    }
}

/// Describes the scheduling state of a thread.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ThreadState {
    /// The thread is ready to run and waiting in a ready
    /// queue.
    Ready,

    /// The thread is executing on the CPU.
    Running,

    /// The thread is suspended, waiting for an event or a
    /// deadline.
    Blocked,

    /// The thread has finished and will never run again.
    Dead,
}

/// Contains the metadata for a thread of execution.
///
#[derive(Debug)]
pub struct Thread {
    // This thread's unique id.
    id: ThreadId,

    // The process that owns this thread.
    process: ProcessId,

    // The thread's current scheduling state.
    state: ThreadState,

    // The thread's scheduling priority.
    priority: Priority,

    // The frames backing the thread's kernel stack, or
    // `None` for the idle thread, which inherits the
    // kernel's boot stack.
    kernel_stack: Option<PhysFrameRange>,

    // The top of the thread's kernel stack.
    kernel_stack_pointer: VirtAddr,

    // The thread's user stack pointer.
    user_stack_pointer: VirtAddr,

    // The address at which the thread starts executing.
    entry_point: VirtAddr,

    // The CPU time the thread has accumulated, in
    // nanoseconds.
    cpu_time: u64,

    // The saved stack pointer. While the thread is
    // executing this value is stale; it is written by the
    // context switch when the thread is switched out.
    saved_stack_pointer: usize,

    // When the thread is blocked with a deadline, the
    // scheduler clock value at which it times out.
    wake_at: Option<u64>,

    // When the thread is blocked on an IPC endpoint, the
    // endpoint in question.
    blocked_on: Option<EndpointId>,

    // Why the thread's last blocking wait ended, when it
    // ended for a reason other than the awaited event:
    // a timeout, or the endpoint being destroyed.
    wake_status: Option<Error>,
}

impl Thread {
    /// Returns the thread's unique id.
    ///
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Returns the id of the process owning this thread.
    ///
    pub fn process(&self) -> ProcessId {
        self.process
    }

    /// Returns the thread's scheduling state.
    ///
    pub fn state(&self) -> ThreadState {
        self.state
    }

    /// Sets the thread's scheduling state.
    ///
    pub fn set_state(&mut self, state: ThreadState) {
        self.state = state;
    }

    /// Returns the thread's priority.
    ///
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Returns the thread's entry point.
    ///
    pub fn entry_point(&self) -> VirtAddr {
        self.entry_point
    }

    /// Returns the thread's user stack pointer.
    ///
    pub fn user_stack_pointer(&self) -> VirtAddr {
        self.user_stack_pointer
    }

    /// Returns the top of the thread's kernel stack.
    ///
    pub fn kernel_stack_pointer(&self) -> VirtAddr {
        self.kernel_stack_pointer
    }

    /// Returns the frames backing the thread's kernel
    /// stack, if it owns one.
    ///
    pub fn kernel_stack(&self) -> Option<PhysFrameRange> {
        self.kernel_stack
    }

    /// Returns the CPU time the thread has accumulated, in
    /// nanoseconds.
    ///
    pub fn cpu_time(&self) -> u64 {
        self.cpu_time
    }

    /// Adds to the thread's accumulated CPU time.
    ///
    pub fn charge(&mut self, ns: u64) {
        self.cpu_time += ns;
    }

    /// Returns a pointer to the thread's saved stack
    /// pointer, for the context switch.
    ///
    pub fn saved_stack_pointer(&mut self) -> *mut usize {
        &mut self.saved_stack_pointer
    }

    /// Records the thread's saved stack pointer, for a
    /// thread that has not run yet.
    ///
    pub fn set_saved_stack_pointer(&mut self, stack_pointer: usize) {
        self.saved_stack_pointer = stack_pointer;
    }

    /// Returns the deadline at which the thread's blocking
    /// wait times out, if it has one.
    ///
    pub fn wake_at(&self) -> Option<u64> {
        self.wake_at
    }

    /// Returns the endpoint the thread is blocked on, if
    /// any.
    ///
    pub fn blocked_on(&self) -> Option<EndpointId> {
        self.blocked_on
    }

    /// Marks the thread blocked, with an optional deadline
    /// and the endpoint it is waiting on.
    ///
    pub fn block(&mut self, wake_at: Option<u64>, endpoint: Option<EndpointId>) {
        self.state = ThreadState::Blocked;
        self.wake_at = wake_at;
        self.blocked_on = endpoint;
    }

    /// Clears the thread's blocking metadata and marks it
    /// ready.
    ///
    pub fn unblock(&mut self) {
        self.state = ThreadState::Ready;
        self.wake_at = None;
        self.blocked_on = None;
    }

    /// Records why the thread's blocking wait ended early.
    ///
    pub fn set_wake_status(&mut self, status: Error) {
        self.wake_status = Some(status);
    }

    /// Takes the reason the thread's last wait ended early,
    /// if it did.
    ///
    pub fn take_wake_status(&mut self) -> Option<Error> {
        self.wake_status.take()
    }
}

/// The table of all live threads, keyed by thread id.
///
pub struct ThreadTable {
    threads: BTreeMap<ThreadId, Thread>,
    next_id: u64,
}

impl ThreadTable {
    /// Returns an empty thread table.
    ///
    pub fn new() -> Self {
        ThreadTable {
            threads: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Creates the idle thread, which has the reserved id 0
    /// and inherits the kernel's boot stack.
    ///
    pub fn create_idle(&mut self, process: ProcessId) -> ThreadId {
        let id = ThreadId::IDLE;
        self.threads.insert(
            id,
            Thread {
                id,
                process,
                state: ThreadState::Running,
                priority: Priority::Idle,
                kernel_stack: None,
                kernel_stack_pointer: VirtAddr::zero(),
                user_stack_pointer: VirtAddr::zero(),
                entry_point: VirtAddr::zero(),
                cpu_time: 0,
                saved_stack_pointer: 0,
                wake_at: None,
                blocked_on: None,
                wake_status: None,
            },
        );

        id
    }

    /// Creates a new thread, marked ready.
    ///
    pub fn create(
        &mut self,
        process: ProcessId,
        priority: Priority,
        entry_point: VirtAddr,
        kernel_stack: Option<PhysFrameRange>,
        kernel_stack_pointer: VirtAddr,
        user_stack_pointer: VirtAddr,
    ) -> ThreadId {
        let id = ThreadId::new(self.next_id);
        self.next_id += 1;

        self.threads.insert(
            id,
            Thread {
                id,
                process,
                state: ThreadState::Ready,
                priority,
                kernel_stack,
                kernel_stack_pointer,
                user_stack_pointer,
                entry_point,
                cpu_time: 0,
                saved_stack_pointer: 0,
                wake_at: None,
                blocked_on: None,
                wake_status: None,
            },
        );

        id
    }

    /// Returns the thread with the given id.
    ///
    pub fn get(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.get(&id)
    }

    /// Returns the thread with the given id, mutably.
    ///
    pub fn get_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        self.threads.get_mut(&id)
    }

    /// Removes the thread with the given id, returning it.
    ///
    pub fn remove(&mut self, id: ThreadId) -> Option<Thread> {
        self.threads.remove(&id)
    }

    /// Returns an iterator over all threads.
    ///
    pub fn iter(&self) -> impl Iterator<Item = &Thread> {
        self.threads.values()
    }

    /// Returns the number of live threads.
    ///
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    /// Returns whether the table is empty.
    ///
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new()
    }
}
