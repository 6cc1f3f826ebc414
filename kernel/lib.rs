// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The Ember kernel: one context owning every subsystem.
//!
//! A [`Kernel`] is created from the physical memory region the
//! boot loader hands over, the offset at which physical memory
//! is mapped, and the filesystem used to read executables. It
//! owns a single instance of each subsystem (frame allocator,
//! kernel address space, process and thread tables, scheduler,
//! endpoint registry, and capability space), each behind its own
//! spinlock, and exposes the operation surface the surrounding
//! layers (personas, syscall dispatch) build on.
//!
//! ## Capability gating
//!
//! Operations that only touch the caller's own state (fork,
//! exec, brk, exit, waiting for a child) need no capability.
//! Every operation that names a foreign resource is gated: a
//! process sends to or receives from an endpoint it does not own
//! only with an `IpcEndpoint` capability carrying the matching
//! permission, destroys a foreign endpoint only with `REVOKE`,
//! and signals an unrelated process only with a `Process`
//! capability carrying `WRITE`.
//!
//! ## Blocking
//!
//! The kernel context is where IPC waits become thread
//! suspensions. A synchronous send to a full ring (or a receive
//! from an empty one) with a nonzero timeout parks the calling
//! thread on the endpoint's wait queue with a deadline; the
//! operation reports [`SendOutcome::Parked`] (or
//! [`ReceiveOutcome::Parked`]) and the syscall layer retries it
//! when the thread runs again. Wakeups come from the matching
//! ring transition, from endpoint destruction (the waiter's
//! wake status becomes [`Denied`](Error::Denied)), or from the
//! deadline passing at a timer tick ([`Busy`](Error::Busy) for
//! senders, [`Timeout`](Error::Timeout) for receivers). A zero
//! timeout never parks, and there is no infinite timeout.
//!
//! ## Locking
//!
//! Lock order is kernel space, processes, threads, scheduler,
//! endpoints, capabilities, allocator; an operation may skip
//! locks but never acquires one out of order while holding a
//! later one. The scheduler lock is always released before a
//! context switch is performed.

#![no_std]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

extern crate alloc;

use alloc::sync::Arc;
use cap::{CapabilitySpace, ObjectKind, Permissions};
use filesystem::FileSystem;
use ipc::{EndpointRegistry, EndpointStats, Message, MessageFlags, WaitRole};
use memory::{FrameAllocator, FrameDeallocator, PhysAddr, PhysFrame, PhysFrameRange, VirtAddr};
use multitasking::process::ProcessTable;
use multitasking::scheduler::Scheduler;
use multitasking::switch::switch_stack;
use multitasking::thread::{Priority, ThreadTable};
use physmem::{BitmapFrameAllocator, MemoryStats};
use serial::println;
use spin::{lock, Mutex};
use syscalls::{CapabilityId, EndpointId, Error, ProcessId, ThreadId};
use virtmem::{AddressSpace, FaultClass, PageFaultCode};

/// The result of a send that could not complete immediately
/// but has not failed.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SendOutcome {
    /// The message was enqueued.
    Sent,

    /// The calling thread was parked on the endpoint's
    /// sender wait queue; the send is retried when the
    /// thread runs again.
    Parked,
}

/// The result of a receive that could not complete
/// immediately but has not failed.
///
#[derive(Debug)]
pub enum ReceiveOutcome {
    /// A message was dequeued.
    Received(Message),

    /// The calling thread was parked on the endpoint's
    /// receiver wait queue; the receive is retried when the
    /// thread runs again.
    Parked,
}

/// The kernel context: every subsystem instance, each behind
/// its own lock.
///
pub struct Kernel {
    allocator: Mutex<BitmapFrameAllocator>,
    kernel_space: Mutex<AddressSpace>,
    processes: Mutex<ProcessTable>,
    threads: Mutex<ThreadTable>,
    scheduler: Mutex<Scheduler>,
    endpoints: Mutex<EndpointRegistry>,
    capabilities: Mutex<CapabilitySpace>,
    fs: Arc<dyn FileSystem>,
}

impl Kernel {
    /// Builds the kernel context over the physical memory
    /// region `[base, base + size)`.
    ///
    /// The frame allocator takes over the region, the kernel
    /// address space is built (identity map plus the
    /// physical memory window), and the idle thread is
    /// registered with the scheduler.
    ///
    /// # Safety
    ///
    /// The caller must ensure the region is unused physical
    /// memory whose frames can be dereferenced at
    /// `physmem_offset`, and must call `new` at most once
    /// per region.
    ///
    pub unsafe fn new(
        base: PhysAddr,
        size: usize,
        physmem_offset: VirtAddr,
        fs: Arc<dyn FileSystem>,
    ) -> Result<Kernel, Error> {
        let mut allocator = BitmapFrameAllocator::new(base, size)?;
        let kernel_space = AddressSpace::new_kernel(&mut allocator, physmem_offset)?;

        let mut threads = ThreadTable::new();
        let idle = threads.create_idle(ProcessId::new(0));
        let mut scheduler = Scheduler::new();
        scheduler.set_idle_thread(idle);

        Ok(Kernel {
            allocator: Mutex::new(allocator),
            kernel_space: Mutex::new(kernel_space),
            processes: Mutex::new(ProcessTable::new()),
            threads: Mutex::new(threads),
            scheduler: Mutex::new(scheduler),
            endpoints: Mutex::new(EndpointRegistry::new()),
            capabilities: Mutex::new(CapabilitySpace::new()),
            fs,
        })
    }

    // Memory.

    /// Returns a snapshot of physical memory usage.
    ///
    pub fn memory_stats(&self) -> MemoryStats {
        lock!(self.allocator).stats()
    }

    /// Allocates one physical frame.
    ///
    pub fn allocate_frame(&self) -> Option<PhysFrame> {
        lock!(self.allocator).allocate_frame()
    }

    /// Allocates `n` physically contiguous frames.
    ///
    pub fn allocate_frames(&self, n: usize) -> Option<PhysFrameRange> {
        lock!(self.allocator).allocate_n_frames(n)
    }

    /// Frees one physical frame.
    ///
    /// # Safety
    ///
    /// The caller must ensure the frame is unused.
    ///
    pub unsafe fn free_frame(&self, frame: PhysFrame) {
        lock!(self.allocator).deallocate_frame(frame);
    }

    /// Frees a range of physical frames.
    ///
    /// # Safety
    ///
    /// The caller must ensure the frames are unused.
    ///
    pub unsafe fn free_frames(&self, range: PhysFrameRange) {
        lock!(self.allocator).deallocate_n_frames(range);
    }

    /// Handles a page fault. With no demand paging, every
    /// fault is fatal: the kernel panics with the fault's
    /// classification.
    ///
    pub fn page_fault(&self, addr: VirtAddr, code: PageFaultCode) -> ! {
        virtmem::page_fault(addr, code)
    }

    /// Classifies a page fault error code.
    ///
    pub fn classify_fault(&self, code: PageFaultCode) -> FaultClass {
        virtmem::classify(code)
    }

    // Threads and scheduling.

    /// Returns the currently executing thread.
    ///
    pub fn current_thread(&self) -> ThreadId {
        lock!(self.scheduler).current_thread()
    }

    /// Returns the process owning the currently executing
    /// thread.
    ///
    pub fn current_process(&self) -> ProcessId {
        let current = self.current_thread();
        lock!(self.threads)
            .get(current)
            .map(|thread| thread.process())
            .unwrap_or(ProcessId::new(0))
    }

    /// Creates an additional thread in the given process and
    /// queues it.
    ///
    pub fn create_thread(
        &self,
        pid: ProcessId,
        priority: Priority,
        entry_point: VirtAddr,
        user_stack_pointer: VirtAddr,
    ) -> Result<ThreadId, Error> {
        let physmem_offset = lock!(self.kernel_space).physmem_offset();
        let mut processes = lock!(self.processes);
        let mut threads = lock!(self.threads);
        let mut allocator = lock!(self.allocator);

        let tid = unsafe {
            processes.create_thread(
                &mut threads,
                pid,
                priority,
                entry_point,
                user_stack_pointer,
                physmem_offset,
                &mut *allocator,
            )
        }?;
        drop(allocator);

        lock!(self.scheduler).add_thread(&threads, tid);
        Ok(tid)
    }

    /// Terminates one thread. When the last thread of a
    /// process exits, the process exits with it.
    ///
    pub fn exit_thread(&self, tid: ThreadId) -> Result<(), Error> {
        let pid = lock!(self.threads)
            .get(tid)
            .map(|thread| thread.process())
            .ok_or(Error::NotFound)?;

        let last = {
            let mut processes = lock!(self.processes);
            let mut threads = lock!(self.threads);
            let mut scheduler = lock!(self.scheduler);
            let mut allocator = lock!(self.allocator);
            unsafe {
                processes.detach_thread(pid, tid, &mut threads, &mut scheduler, &mut *allocator)
            }?
        };

        if last {
            self.exit(pid, 0)?;
        }

        Ok(())
    }

    /// Runs the scheduler, returning the context switch to
    /// perform, if any.
    ///
    pub fn schedule(&self) -> Option<(ThreadId, ThreadId)> {
        let mut threads = lock!(self.threads);
        lock!(self.scheduler).schedule(&mut threads)
    }

    /// Gives up the CPU voluntarily.
    ///
    pub fn yield_now(&self) -> Option<(ThreadId, ThreadId)> {
        self.schedule()
    }

    /// Performs the scheduling decision's context switch.
    ///
    /// Every lock is released before the switch: the stack
    /// pointers are read under the thread lock, then the
    /// switch happens lock-free.
    ///
    /// # Safety
    ///
    /// Must only be called from the thread being switched
    /// out, with interrupts disabled.
    ///
    pub unsafe fn run_switch(&self, previous: ThreadId, next: ThreadId) {
        let (prev_sp, next_sp) = {
            let mut threads = lock!(self.threads);
            let prev_sp = match threads.get_mut(previous) {
                Some(thread) => thread.saved_stack_pointer(),
                None => return,
            };
            let next_sp = match threads.get_mut(next) {
                Some(thread) => thread.saved_stack_pointer() as *const usize,
                None => return,
            };
            (prev_sp, next_sp)
        };

        switch_stack(prev_sp, next_sp);
    }

    /// The timer tick: advances the scheduler clock, charges
    /// the running thread and its process, wakes expired
    /// waiters, and preempts.
    ///
    pub fn tick(&self, delta_ns: u64) -> Option<(ThreadId, ThreadId)> {
        // Charge the running process.
        let current_pid = self.current_process();
        if let Some(process) = lock!(self.processes).get_mut(current_pid) {
            process.charge(delta_ns);
        }

        let expired = {
            let mut threads = lock!(self.threads);
            lock!(self.scheduler).tick(&mut threads, delta_ns)
        };

        // Waiters whose deadlines passed leave their wait
        // queues and wake with the timeout status for their
        // side of the endpoint.
        for tid in expired {
            let endpoint = lock!(self.threads)
                .get(tid)
                .and_then(|thread| thread.blocked_on());
            let role = endpoint.and_then(|id| lock!(self.endpoints).cancel_wait(id, tid));
            let status = match role {
                Some(WaitRole::Sender) => Error::Busy,
                _ => Error::Timeout,
            };

            let mut threads = lock!(self.threads);
            if let Some(thread) = threads.get_mut(tid) {
                thread.set_wake_status(status);
            }
            lock!(self.scheduler).unblock(&mut threads, tid);
        }

        self.schedule()
    }

    /// Takes the reason the thread's last blocking wait
    /// ended early, if it did. The syscall layer reads this
    /// when a parked operation resumes.
    ///
    pub fn take_wake_status(&self, tid: ThreadId) -> Option<Error> {
        lock!(self.threads)
            .get_mut(tid)
            .and_then(|thread| thread.take_wake_status())
    }

    // Process lifecycle.

    /// Creates a new process running the executable at
    /// `path`, returning its pid and main thread.
    ///
    pub fn spawn(
        &self,
        parent: Option<ProcessId>,
        path: &str,
    ) -> Result<(ProcessId, ThreadId), Error> {
        let now = lock!(self.scheduler).now();
        let pid = lock!(self.processes).create(parent, now)?;
        let main = self.exec(pid, path, &[], &[])?;

        Ok((pid, main))
    }

    /// Replaces the process's program with the executable at
    /// `path`.
    ///
    pub fn exec(
        &self,
        pid: ProcessId,
        path: &str,
        argv: &[&str],
        envp: &[&str],
    ) -> Result<ThreadId, Error> {
        let kernel_space = lock!(self.kernel_space);
        let mut processes = lock!(self.processes);
        let mut threads = lock!(self.threads);
        let mut scheduler = lock!(self.scheduler);
        let mut allocator = lock!(self.allocator);

        unsafe {
            processes.exec(
                pid,
                path,
                argv,
                envp,
                self.fs.as_ref(),
                &*kernel_space,
                &mut threads,
                &mut scheduler,
                &mut *allocator,
            )
        }
    }

    /// Forks the given process, returning the child's pid.
    ///
    pub fn fork(&self, pid: ProcessId) -> Result<ProcessId, Error> {
        let mut processes = lock!(self.processes);
        let mut threads = lock!(self.threads);
        let mut scheduler = lock!(self.scheduler);
        let mut allocator = lock!(self.allocator);

        unsafe { processes.fork(pid, &mut threads, &mut scheduler, &mut *allocator) }
    }

    /// Terminates the given process with an exit code.
    ///
    /// The process's endpoints are destroyed (waking their
    /// waiters with [`Denied`](Error::Denied)), its
    /// capabilities are released, and the process becomes a
    /// zombie, or is reclaimed at once if it has no live
    /// parent.
    ///
    pub fn exit(&self, pid: ProcessId, code: i32) -> Result<(), Error> {
        // Tear down the process's endpoints first, so their
        // waiters are woken before the process disappears.
        let owned = lock!(self.endpoints).owned_by(pid);
        for endpoint in owned {
            let _ = self.destroy_endpoint_waking_waiters(endpoint);
        }

        lock!(self.capabilities).release_holder(pid);

        let mut processes = lock!(self.processes);
        let mut threads = lock!(self.threads);
        let mut scheduler = lock!(self.scheduler);
        let mut allocator = lock!(self.allocator);

        unsafe { processes.exit(pid, code, &mut threads, &mut scheduler, &mut *allocator) }
    }

    /// Delivers a termination signal to `target` on behalf
    /// of `caller`.
    ///
    /// A process may signal itself and its children freely;
    /// anything else requires a `Process` capability with
    /// `WRITE`.
    ///
    pub fn kill(&self, caller: ProcessId, target: ProcessId, signal: i32) -> Result<(), Error> {
        let permitted = caller == target || {
            let processes = lock!(self.processes);
            processes
                .get(caller)
                .map(|process| process.children().contains(&target))
                .unwrap_or(false)
        };
        if !permitted {
            lock!(self.capabilities).check(
                caller,
                ObjectKind::Process,
                target.as_u64(),
                Permissions::WRITE,
            )?;
        }

        self.exit(target, signal)
    }

    /// Reaps a zombie child of `parent`, returning its pid
    /// and exit status. Fails with [`Error::Invalid`] if no
    /// matching zombie child exists; waiting never blocks.
    ///
    pub fn wait(
        &self,
        parent: ProcessId,
        pid: Option<ProcessId>,
    ) -> Result<(ProcessId, i32), Error> {
        let mut processes = lock!(self.processes);
        let mut allocator = lock!(self.allocator);

        unsafe { processes.wait(parent, pid, &mut *allocator) }
    }

    /// Queries or moves the process's program break.
    ///
    pub fn brk(&self, pid: ProcessId, new_brk: usize) -> Result<VirtAddr, Error> {
        let mut processes = lock!(self.processes);
        let mut allocator = lock!(self.allocator);

        unsafe { processes.brk(pid, new_brk, &mut *allocator) }
    }

    // IPC.

    /// Creates an endpoint owned by `owner`, returning its
    /// id and the full capability minted for the owner.
    ///
    pub fn endpoint_create(&self, owner: ProcessId) -> (EndpointId, CapabilityId) {
        let id = lock!(self.endpoints).create(owner);
        let capability = lock!(self.capabilities).create(
            owner,
            ObjectKind::IpcEndpoint,
            id.as_u64(),
            Permissions::READ | Permissions::WRITE | Permissions::GRANT | Permissions::REVOKE,
            0,
        );

        (id, capability)
    }

    /// Destroys an endpoint on behalf of `caller`.
    ///
    /// The owner may always destroy its endpoint; anyone
    /// else needs an `IpcEndpoint` capability with `REVOKE`.
    /// Every parked waiter wakes with
    /// [`Denied`](Error::Denied).
    ///
    pub fn endpoint_destroy(&self, caller: ProcessId, id: EndpointId) -> Result<(), Error> {
        let owner = lock!(self.endpoints).owner(id)?;
        if owner != caller {
            lock!(self.capabilities).check(
                caller,
                ObjectKind::IpcEndpoint,
                id.as_u64(),
                Permissions::REVOKE,
            )?;
        }

        self.destroy_endpoint_waking_waiters(id)
    }

    fn destroy_endpoint_waking_waiters(&self, id: EndpointId) -> Result<(), Error> {
        let waiters = lock!(self.endpoints).destroy(id)?;
        let mut threads = lock!(self.threads);
        let mut scheduler = lock!(self.scheduler);
        for tid in waiters {
            if let Some(thread) = threads.get_mut(tid) {
                thread.set_wake_status(Error::Denied);
            }
            scheduler.unblock(&mut threads, tid);
        }
        drop(scheduler);
        drop(threads);

        lock!(self.capabilities).destroy_for_object(ObjectKind::IpcEndpoint, id.as_u64());
        Ok(())
    }

    // Checks that `pid` may perform the given operation on
    // the endpoint: owners may always, everyone else needs
    // a capability.
    fn check_endpoint(
        &self,
        pid: ProcessId,
        id: EndpointId,
        permission: Permissions,
    ) -> Result<(), Error> {
        let owner = lock!(self.endpoints).owner(id)?;
        if owner == pid {
            return Ok(());
        }

        lock!(self.capabilities).check(pid, ObjectKind::IpcEndpoint, id.as_u64(), permission)
    }

    /// Sends a message to the endpoint on behalf of the
    /// calling thread.
    ///
    /// Sending to a foreign endpoint requires an
    /// `IpcEndpoint` capability with `WRITE`. A full ring
    /// fails with [`Busy`](Error::Busy), after counting the
    /// drop for an async message, unless the send is
    /// synchronous with a nonzero timeout, in which case the
    /// calling thread parks on the sender wait queue until a
    /// slot frees, the timeout passes, or the endpoint dies.
    ///
    pub fn ipc_send(
        &self,
        caller: ThreadId,
        id: EndpointId,
        msg: Message,
        timeout_ns: u64,
    ) -> Result<SendOutcome, Error> {
        let pid = lock!(self.threads)
            .get(caller)
            .map(|thread| thread.process())
            .ok_or(Error::NotFound)?;
        self.check_endpoint(pid, id, Permissions::WRITE)?;

        let sent = lock!(self.endpoints).send(id, pid, msg);
        match sent {
            Ok(waker) => {
                if let Some(tid) = waker {
                    let mut threads = lock!(self.threads);
                    lock!(self.scheduler).unblock(&mut threads, tid);
                }

                Ok(SendOutcome::Sent)
            }
            Err(Error::Busy) => {
                if msg.flags.contains(MessageFlags::ASYNC) || timeout_ns == 0 {
                    return Err(Error::Busy);
                }

                self.park(caller, id, WaitRole::Sender, timeout_ns)?;
                Ok(SendOutcome::Parked)
            }
            Err(err) => Err(err),
        }
    }

    /// Receives the oldest message from the endpoint on
    /// behalf of the calling thread.
    ///
    /// Receiving from a foreign endpoint requires an
    /// `IpcEndpoint` capability with `READ`. An empty ring
    /// fails with [`Timeout`](Error::Timeout) when the
    /// timeout is zero; otherwise the calling thread parks
    /// on the receiver wait queue until a message arrives,
    /// the timeout passes, or the endpoint dies.
    ///
    pub fn ipc_receive(
        &self,
        caller: ThreadId,
        id: EndpointId,
        timeout_ns: u64,
    ) -> Result<ReceiveOutcome, Error> {
        let pid = lock!(self.threads)
            .get(caller)
            .map(|thread| thread.process())
            .ok_or(Error::NotFound)?;
        self.check_endpoint(pid, id, Permissions::READ)?;

        let received = lock!(self.endpoints).receive(id);
        match received {
            Ok((msg, waker)) => {
                if let Some(tid) = waker {
                    let mut threads = lock!(self.threads);
                    lock!(self.scheduler).unblock(&mut threads, tid);
                }

                Ok(ReceiveOutcome::Received(msg))
            }
            Err(Error::Timeout) => {
                if timeout_ns == 0 {
                    return Err(Error::Timeout);
                }

                self.park(caller, id, WaitRole::Receiver, timeout_ns)?;
                Ok(ReceiveOutcome::Parked)
            }
            Err(err) => Err(err),
        }
    }

    /// Sends a reply correlated with a received message.
    ///
    pub fn ipc_reply(
        &self,
        caller: ThreadId,
        id: EndpointId,
        msg_id: u64,
        payload: &[u8],
    ) -> Result<SendOutcome, Error> {
        let msg = Message::new(msg_id, MessageFlags::ASYNC, payload)?;
        self.ipc_send(caller, id, msg, 0)
    }

    /// Returns a snapshot of the endpoint's counters.
    ///
    pub fn ipc_stats(&self, id: EndpointId) -> Result<EndpointStats, Error> {
        lock!(self.endpoints).stats(id)
    }

    // Parks the calling thread on one of the endpoint's
    // wait queues with a deadline. Only the running thread
    // can park itself.
    fn park(
        &self,
        caller: ThreadId,
        id: EndpointId,
        role: WaitRole,
        timeout_ns: u64,
    ) -> Result<(), Error> {
        {
            let mut endpoints = lock!(self.endpoints);
            match role {
                WaitRole::Sender => endpoints.wait_to_send(id, caller)?,
                WaitRole::Receiver => endpoints.wait_to_receive(id, caller)?,
            }
        }

        let mut threads = lock!(self.threads);
        let mut scheduler = lock!(self.scheduler);
        if scheduler.current_thread() != caller {
            lock!(self.endpoints).cancel_wait(id, caller);
            return Err(Error::Invalid);
        }

        let deadline = scheduler.now() + timeout_ns;
        scheduler.block_current(&mut threads, Some(deadline), Some(id));
        Ok(())
    }

    // Capabilities.

    /// Mints a capability held by `owner`.
    ///
    pub fn cap_create(
        &self,
        owner: ProcessId,
        kind: ObjectKind,
        object_id: u64,
        permissions: Permissions,
        metadata: u64,
    ) -> CapabilityId {
        lock!(self.capabilities).create(owner, kind, object_id, permissions, metadata)
    }

    /// Destroys a capability, revoking it everywhere. The
    /// caller must hold it with `REVOKE`.
    ///
    pub fn cap_destroy(&self, caller: ProcessId, id: CapabilityId) -> Result<(), Error> {
        let mut capabilities = lock!(self.capabilities);
        let permitted = capabilities
            .get(id)
            .map(|capability| capability.permissions.contains(Permissions::REVOKE))
            .unwrap_or(false)
            && capabilities.holds(caller, id);
        if !permitted {
            return Err(Error::Denied);
        }

        capabilities.destroy(id)
    }

    /// Installs a capability reference in `target`.
    ///
    pub fn cap_grant(
        &self,
        granter: ProcessId,
        target: ProcessId,
        id: CapabilityId,
    ) -> Result<(), Error> {
        lock!(self.capabilities).grant(granter, target, id)
    }

    /// Withdraws a capability reference from `target`.
    ///
    pub fn cap_revoke(
        &self,
        revoker: ProcessId,
        target: ProcessId,
        id: CapabilityId,
    ) -> Result<(), Error> {
        lock!(self.capabilities).revoke(revoker, target, id)
    }

    /// Creates a narrowed child capability.
    ///
    pub fn cap_derive(
        &self,
        holder: ProcessId,
        parent: CapabilityId,
        permissions: Permissions,
    ) -> Result<CapabilityId, Error> {
        lock!(self.capabilities).derive(holder, parent, permissions)
    }

    // Diagnostics.

    /// Prints a summary of the kernel's state.
    ///
    pub fn debug(&self) {
        lock!(self.allocator).debug();
        let threads = lock!(self.threads);
        lock!(self.scheduler).debug(&threads);
        drop(threads);

        let processes = lock!(self.processes);
        for process in processes.iter() {
            println!(
                "{:?} {} ({:?}): {} threads",
                process.pid(),
                process.name(),
                process.state(),
                process.threads().len()
            );
        }
    }
}

// Needed so tests can look at process state without kernel
// helpers for every field.
impl Kernel {
    /// Runs a closure with the process table locked.
    ///
    pub fn with_processes<R>(&self, f: impl FnOnce(&ProcessTable) -> R) -> R {
        f(&*lock!(self.processes))
    }

    /// Runs a closure with the thread table locked.
    ///
    pub fn with_threads<R>(&self, f: impl FnOnce(&ThreadTable) -> R) -> R {
        f(&*lock!(self.threads))
    }
}
