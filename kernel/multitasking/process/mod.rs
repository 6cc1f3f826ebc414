// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements user processes: address-space ownership, file
//! descriptors, credentials, and the process lifecycle.
//!
//! Processes refer to one another by pid only. A parent lists
//! its children by pid and a child records its parent's pid;
//! looking a pid up in the [`ProcessTable`] yields the current
//! process slot, so no structure ever holds a pointer cycle.
//!
//! The lifecycle follows the classic fork/exec shape.
//! [`fork`](ProcessTable::fork) deep-copies the parent: its
//! credentials, working directory, shared file descriptors, and
//! an eager copy of every user page. The child's main thread is
//! in the ready queue before `fork` returns.
//! [`exec`](ProcessTable::exec) replaces the address space with
//! a freshly loaded binary, a heap placed just after the image,
//! and a user stack at the top of the lower half.
//! [`exit`](ProcessTable::exit) retires the process into a
//! zombie holding only its exit code, unless nobody is left to
//! reap it, in which case it is reclaimed on the spot;
//! [`wait`](ProcessTable::wait) collects a zombie child's exit
//! code and frees what remains.

mod fd;

pub use self::fd::{FdEntry, FdTable, MAX_FILE_DESCRIPTORS};

use crate::scheduler::Scheduler;
use crate::switch::populate_initial_stack;
use crate::thread::{Priority, ThreadState, ThreadTable};
use alloc::collections::btree_map::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use core::mem;
use filesystem::{read_file, FileSystem};
use loader::{Image, LoadedImage};
use memory::constants::{USER_STACK, USER_STACK_TOP};
use memory::{
    FrameAllocator, FrameDeallocator, PageTableFlags, VirtAddr, VirtAddrRange, VirtPage,
    PAGE_SIZE,
};
use syscalls::{Error, ProcessId, ThreadId};
use virtmem::{AddressSpace, RegionKind};

/// The maximum number of threads per process.
///
pub const MAX_THREADS: usize = 64;

/// The maximum number of children per process.
///
pub const MAX_CHILDREN: usize = 256;

/// The number of frames in each thread's kernel stack.
///
const KERNEL_STACK_FRAMES: usize = 4;

/// Describes the lifecycle state of a process.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessState {
    /// The slot is allocated but the process has not been
    /// given an address space yet.
    Embryo,

    /// The process is ready to run.
    Ready,

    /// One of the process's threads is executing.
    Running,

    /// Every thread of the process is suspended.
    Blocked,

    /// The process has exited; only its pid and exit code
    /// remain until a parent reaps it.
    Zombie,

    /// The process is gone and its slot can be reused.
    Dead,
}

/// A process's user and group credentials.
///
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub euid: u32,
    pub egid: u32,
}

/// A user process: a virtual memory space, the threads
/// executing in it, and the kernel resources they share.
///
pub struct Process {
    // This process's unique id.
    pid: ProcessId,

    // The parent's pid, or the zero pid for a root process.
    parent: ProcessId,

    // Process group and session identifiers.
    process_group: u64,
    session: u64,

    // The process's name, from the last exec.
    name: String,

    // The process's lifecycle state.
    state: ProcessState,

    // The exit code, once the process has exited.
    exit_code: i32,

    // The process's address space, present from exec until
    // the process is reaped.
    address_space: Option<AddressSpace>,

    // Heap bounds: the heap starts page-aligned after the
    // image and grows to brk.
    heap_start: VirtAddr,
    heap_end: VirtAddr,
    brk: VirtAddr,

    // The loaded image's layout, from the last exec.
    image: Option<LoadedImage>,

    // The threads executing in this process.
    threads: Vec<ThreadId>,
    main_thread: Option<ThreadId>,

    // Open file descriptors.
    fds: FdTable,

    // Children, by pid.
    children: Vec<ProcessId>,

    // The working directory.
    cwd: String,

    // User and group credentials.
    credentials: Credentials,

    // Scheduler clock values: when the process was created,
    // and how much CPU time its threads have accumulated.
    start_time: u64,
    cpu_time: u64,
}

impl Process {
    /// Returns the process's unique id.
    ///
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Returns the parent process's id.
    ///
    pub fn parent(&self) -> ProcessId {
        self.parent
    }

    /// Returns the process's name.
    ///
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Returns the process's lifecycle state.
    ///
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Sets the process's lifecycle state.
    ///
    pub fn set_state(&mut self, state: ProcessState) {
        self.state = state;
    }

    /// Returns the process's exit code.
    ///
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Returns the process's address space.
    ///
    pub fn address_space(&self) -> Option<&AddressSpace> {
        self.address_space.as_ref()
    }

    /// Returns the process's address space, mutably.
    ///
    pub fn address_space_mut(&mut self) -> Option<&mut AddressSpace> {
        self.address_space.as_mut()
    }

    /// Returns the start of the heap.
    ///
    pub fn heap_start(&self) -> VirtAddr {
        self.heap_start
    }

    /// Returns the current program break.
    ///
    pub fn brk(&self) -> VirtAddr {
        self.brk
    }

    /// Returns the loaded image's layout.
    ///
    pub fn image(&self) -> Option<&LoadedImage> {
        self.image.as_ref()
    }

    /// Returns the process's threads.
    ///
    pub fn threads(&self) -> &[ThreadId] {
        &self.threads
    }

    /// Returns the process's main thread.
    ///
    pub fn main_thread(&self) -> Option<ThreadId> {
        self.main_thread
    }

    /// Returns the file descriptor table.
    ///
    pub fn fds(&self) -> &FdTable {
        &self.fds
    }

    /// Returns the file descriptor table, mutably.
    ///
    pub fn fds_mut(&mut self) -> &mut FdTable {
        &mut self.fds
    }

    /// Returns the process's children.
    ///
    pub fn children(&self) -> &[ProcessId] {
        &self.children
    }

    /// Returns the working directory.
    ///
    pub fn cwd(&self) -> &str {
        self.cwd.as_str()
    }

    /// Sets the working directory.
    ///
    pub fn set_cwd(&mut self, cwd: &str) {
        self.cwd = String::from(cwd);
    }

    /// Returns the process's credentials.
    ///
    pub fn credentials(&self) -> Credentials {
        self.credentials
    }

    /// Returns the scheduler clock value at which the
    /// process was created.
    ///
    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    /// Adds to the process's accumulated CPU time.
    ///
    pub fn charge(&mut self, ns: u64) {
        self.cpu_time += ns;
    }

    /// Returns the CPU time the process's threads have
    /// accumulated.
    ///
    pub fn cpu_time(&self) -> u64 {
        self.cpu_time
    }
}

/// The table of processes, keyed by pid.
///
/// Pids are assigned monotonically starting from 1 and never
/// reused: a reaped process's slot disappears, and the pid
/// with it.
///
pub struct ProcessTable {
    processes: BTreeMap<ProcessId, Process>,
    next_pid: u64,
}

impl ProcessTable {
    /// Returns an empty process table.
    ///
    pub fn new() -> Self {
        ProcessTable {
            processes: BTreeMap::new(),
            next_pid: 1,
        }
    }

    /// Allocates a process slot in the `Embryo` state with
    /// the next pid.
    ///
    /// The new process has no address space or threads yet;
    /// `exec` gives it both. With a parent given, the child
    /// is recorded in the parent's child list.
    ///
    pub fn create(&mut self, parent: Option<ProcessId>, now: u64) -> Result<ProcessId, Error> {
        let pid = ProcessId::new(self.next_pid);

        let parent_pid = match parent {
            Some(parent_pid) => {
                let parent = self.processes.get_mut(&parent_pid).ok_or(Error::NotFound)?;
                if parent.children.len() >= MAX_CHILDREN {
                    return Err(Error::Busy);
                }

                parent.children.push(pid);
                parent_pid
            }
            None => ProcessId::new(0),
        };

        self.next_pid += 1;
        self.processes.insert(
            pid,
            Process {
                pid,
                parent: parent_pid,
                process_group: pid.as_u64(),
                session: pid.as_u64(),
                name: String::new(),
                state: ProcessState::Embryo,
                exit_code: 0,
                address_space: None,
                heap_start: VirtAddr::zero(),
                heap_end: VirtAddr::zero(),
                brk: VirtAddr::zero(),
                image: None,
                threads: Vec::new(),
                main_thread: None,
                fds: FdTable::new(),
                children: Vec::new(),
                cwd: String::from("/"),
                credentials: Credentials::default(),
                start_time: now,
                cpu_time: 0,
            },
        );

        Ok(pid)
    }

    /// Returns the process with the given pid.
    ///
    pub fn get(&self, pid: ProcessId) -> Option<&Process> {
        self.processes.get(&pid)
    }

    /// Returns the process with the given pid, mutably.
    ///
    pub fn get_mut(&mut self, pid: ProcessId) -> Option<&mut Process> {
        self.processes.get_mut(&pid)
    }

    /// Returns an iterator over all processes.
    ///
    pub fn iter(&self) -> impl Iterator<Item = &Process> {
        self.processes.values()
    }

    /// Returns the number of process slots in use.
    ///
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    /// Returns whether the table is empty.
    ///
    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    fn alive(&self, pid: ProcessId) -> bool {
        match self.processes.get(&pid) {
            Some(process) => !matches!(process.state, ProcessState::Zombie | ProcessState::Dead),
            None => false,
        }
    }

    /// Allocates a kernel stack and a new thread for `pid`,
    /// entering at `entry_point`, and records the thread in
    /// the process. The thread is ready but not yet queued;
    /// the caller hands it to the scheduler.
    ///
    /// Fails with [`Error::Busy`] once the process has
    /// reached its thread limit.
    ///
    /// # Safety
    ///
    /// The caller must ensure that frames returned by
    /// `allocator` can be dereferenced at `physmem_offset`.
    ///
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn create_thread<A>(
        &mut self,
        threads: &mut ThreadTable,
        pid: ProcessId,
        priority: Priority,
        entry_point: VirtAddr,
        user_stack_pointer: VirtAddr,
        physmem_offset: VirtAddr,
        allocator: &mut A,
    ) -> Result<ThreadId, Error>
    where
        A: FrameAllocator + FrameDeallocator + ?Sized,
    {
        let process = self.processes.get_mut(&pid).ok_or(Error::NotFound)?;
        if process.threads.len() >= MAX_THREADS {
            return Err(Error::Busy);
        }

        let kernel_stack = allocator
            .allocate_n_frames(KERNEL_STACK_FRAMES)
            .ok_or(Error::OutOfMemory)?;
        let stack_top = physmem_offset
            .checked_add(
                kernel_stack.start_address().as_usize() + KERNEL_STACK_FRAMES * PAGE_SIZE,
            )
            .ok_or(Error::Invalid)?;

        let saved = populate_initial_stack(
            stack_top.as_mut_ptr::<u64>(),
            entry_point.as_usize() as u64,
        );

        let tid = threads.create(
            pid,
            priority,
            entry_point,
            Some(kernel_stack),
            stack_top,
            user_stack_pointer,
        );
        if let Some(thread) = threads.get_mut(tid) {
            thread.set_saved_stack_pointer(saved);
        }

        process.threads.push(tid);
        if process.main_thread.is_none() {
            process.main_thread = Some(tid);
        }

        Ok(tid)
    }

    /// Detaches one exiting thread from its process, freeing
    /// its kernel stack. Returns whether it was the
    /// process's last thread; the caller then exits the
    /// process, since a process with no threads cannot run.
    ///
    /// # Safety
    ///
    /// The caller must ensure the thread is no longer
    /// executing.
    ///
    pub unsafe fn detach_thread<A>(
        &mut self,
        pid: ProcessId,
        tid: ThreadId,
        threads: &mut ThreadTable,
        scheduler: &mut Scheduler,
        allocator: &mut A,
    ) -> Result<bool, Error>
    where
        A: FrameAllocator + FrameDeallocator + ?Sized,
    {
        let process = self.processes.get_mut(&pid).ok_or(Error::NotFound)?;
        if !process.threads.contains(&tid) {
            return Err(Error::NotFound);
        }

        process.threads.retain(|&t| t != tid);
        if process.main_thread == Some(tid) {
            process.main_thread = process.threads.first().copied();
        }
        let last = process.threads.is_empty();

        scheduler.remove_thread(tid);
        if let Some(mut thread) = threads.remove(tid) {
            thread.set_state(ThreadState::Dead);
            if let Some(stack) = thread.kernel_stack() {
                allocator.deallocate_n_frames(stack);
            }
        }

        Ok(last)
    }

    // Retires every thread of `pid`: out of the scheduler,
    // out of the thread table, kernel stacks freed.
    //
    unsafe fn retire_threads<A>(
        &mut self,
        threads: &mut ThreadTable,
        scheduler: &mut Scheduler,
        pid: ProcessId,
        allocator: &mut A,
    ) where
        A: FrameAllocator + FrameDeallocator + ?Sized,
    {
        let owned = match self.processes.get_mut(&pid) {
            Some(process) => {
                process.main_thread = None;
                mem::take(&mut process.threads)
            }
            None => return,
        };

        for tid in owned {
            scheduler.remove_thread(tid);
            if let Some(mut thread) = threads.remove(tid) {
                thread.set_state(ThreadState::Dead);
                if let Some(stack) = thread.kernel_stack() {
                    allocator.deallocate_n_frames(stack);
                }
            }
        }
    }

    /// Replaces the process's program with the executable at
    /// `path`.
    ///
    /// The executable is read through the VFS, validated and
    /// parsed, and loaded into a brand-new address space
    /// sharing the kernel's upper half. The heap starts
    /// page-aligned just after the image; a fresh user stack
    /// occupies the top of the lower half; the process's old
    /// address space, loader context, and threads are
    /// destroyed; and a new main thread is created at the
    /// image's entry point with the stack pointer at the
    /// stack's top. On success the process (and its main
    /// thread) are ready to run.
    ///
    /// `argv` and `envp` are accepted for the persona layers
    /// but are not copied onto the stack here.
    ///
    /// # Safety
    ///
    /// The caller must ensure that frames returned by
    /// `allocator` can be dereferenced at the kernel address
    /// space's physical memory offset, and that the process's
    /// old address space is not installed on any CPU.
    ///
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn exec<A>(
        &mut self,
        pid: ProcessId,
        path: &str,
        argv: &[&str],
        envp: &[&str],
        fs: &dyn FileSystem,
        kernel_space: &AddressSpace,
        threads: &mut ThreadTable,
        scheduler: &mut Scheduler,
        allocator: &mut A,
    ) -> Result<ThreadId, Error>
    where
        A: FrameAllocator + FrameDeallocator + ?Sized,
    {
        if !self.processes.contains_key(&pid) {
            return Err(Error::NotFound);
        }

        // Argument and environment vectors belong to the
        // persona ABI; they are validated as UTF-8 by the
        // signature and otherwise unused here.
        let _ = (argv, envp);

        // Stage the new program fully before touching the
        // old one, so a bad binary leaves the process
        // untouched.
        let content = read_file(fs, path)?;
        let image = Image::parse(&content).map_err(|err| err.as_error())?;
        if image.entry_point.is_zero() {
            return Err(Error::NotSupported);
        }

        let mut space = AddressSpace::new_user(kernel_space, allocator)?;
        let loaded = match loader::load(&image, &mut space, allocator) {
            Ok(loaded) => loaded,
            Err(err) => {
                space.destroy(allocator);
                return Err(err);
            }
        };

        // The user stack sits at the top of the lower half.
        let stack_flags = PageTableFlags::WRITABLE
            | PageTableFlags::USER_ACCESSIBLE
            | PageTableFlags::NO_EXECUTE;
        let stack_pages = VirtPage::range_exclusive(
            VirtPage::containing_address(USER_STACK.start()),
            VirtPage::containing_address(USER_STACK_TOP),
        );
        let stack_result = space
            .allocate_and_map(stack_pages, stack_flags, allocator)
            .and_then(|_| space.add_region(USER_STACK, RegionKind::Stack, stack_flags));
        if let Err(err) = stack_result {
            space.destroy(allocator);
            return Err(err);
        }

        // The old program is gone: threads retired, address
        // space destroyed.
        self.retire_threads(threads, scheduler, pid, allocator);
        let old_space = {
            let process = self.processes.get_mut(&pid).ok_or(Error::NotFound)?;
            process.address_space.take()
        };
        if let Some(old) = old_space {
            old.destroy(allocator);
        }

        let heap_start = VirtAddr::new(loaded.image_base.as_usize() + loaded.image_size)
            .align_up(PAGE_SIZE);
        let physmem_offset = kernel_space.physmem_offset();

        {
            let process = self.processes.get_mut(&pid).ok_or(Error::NotFound)?;
            process.name = String::from(path);
            process.address_space = Some(space);
            process.image = Some(loaded);
            process.heap_start = heap_start;
            process.heap_end = heap_start;
            process.brk = heap_start;
        }

        let main = self.create_thread(
            threads,
            pid,
            Priority::Normal,
            loaded.entry_point,
            USER_STACK_TOP,
            physmem_offset,
            allocator,
        )?;
        scheduler.add_thread(threads, main);

        let process = self.processes.get_mut(&pid).ok_or(Error::NotFound)?;
        process.set_state(ProcessState::Ready);

        Ok(main)
    }

    /// Creates a child process as a copy of `parent`.
    ///
    /// The child inherits the parent's credentials, working
    /// directory, open file descriptors (shared, so both see
    /// the same files), heap bounds, and an eager deep copy
    /// of the parent's address space. The child's main
    /// thread mirrors the parent's and is inserted into the
    /// ready queue before `fork` returns.
    ///
    /// # Safety
    ///
    /// As for [`exec`](Self::exec).
    ///
    pub unsafe fn fork<A>(
        &mut self,
        parent_pid: ProcessId,
        threads: &mut ThreadTable,
        scheduler: &mut Scheduler,
        allocator: &mut A,
    ) -> Result<ProcessId, Error>
    where
        A: FrameAllocator + FrameDeallocator + ?Sized,
    {
        let now = scheduler.now();
        let (space, image, heap_start, heap_end, brk, fds, cwd, credentials, pgid, sid, name) = {
            let parent = self.processes.get_mut(&parent_pid).ok_or(Error::NotFound)?;
            if matches!(parent.state, ProcessState::Zombie | ProcessState::Dead) {
                return Err(Error::Invalid);
            }
            if parent.children.len() >= MAX_CHILDREN {
                return Err(Error::Busy);
            }

            let space = match parent.address_space.as_ref() {
                Some(space) => space.duplicate(allocator)?,
                None => return Err(Error::Invalid),
            };

            (
                space,
                parent.image,
                parent.heap_start,
                parent.heap_end,
                parent.brk,
                parent.fds.clone_table(),
                parent.cwd.clone(),
                parent.credentials,
                parent.process_group,
                parent.session,
                parent.name.clone(),
            )
        };

        let (entry_point, user_stack_pointer, priority) = {
            let parent = self.processes.get(&parent_pid).ok_or(Error::NotFound)?;
            let main = parent.main_thread.ok_or(Error::Invalid)?;
            let thread = threads.get(main).ok_or(Error::Invalid)?;
            (
                thread.entry_point(),
                thread.user_stack_pointer(),
                thread.priority(),
            )
        };

        let physmem_offset = space.physmem_offset();
        let child_pid = match self.create(Some(parent_pid), now) {
            Ok(child_pid) => child_pid,
            Err(err) => {
                space.destroy(allocator);
                return Err(err);
            }
        };

        {
            let child = self.processes.get_mut(&child_pid).ok_or(Error::NotFound)?;
            child.address_space = Some(space);
            child.image = image;
            child.heap_start = heap_start;
            child.heap_end = heap_end;
            child.brk = brk;
            child.fds = fds;
            child.cwd = cwd;
            child.credentials = credentials;
            child.process_group = pgid;
            child.session = sid;
            child.name = name;
        }

        let main = self.create_thread(
            threads,
            child_pid,
            priority,
            entry_point,
            user_stack_pointer,
            physmem_offset,
            allocator,
        )?;

        // The child is ready, and its main thread is in the
        // ready queue, before fork returns.
        scheduler.add_thread(threads, main);
        let child = self.processes.get_mut(&child_pid).ok_or(Error::NotFound)?;
        child.set_state(ProcessState::Ready);

        Ok(child_pid)
    }

    /// Terminates the process with the given exit code.
    ///
    /// Open descriptors are closed, every thread is retired,
    /// and children are reparented to the initial process.
    /// The process becomes a zombie retaining its pid, exit
    /// code, and address space until a parent reaps it with
    /// [`wait`](Self::wait). A process with no live parent is
    /// reclaimed immediately instead.
    ///
    /// # Safety
    ///
    /// The caller must ensure the process's address space is
    /// not installed on any CPU.
    ///
    pub unsafe fn exit<A>(
        &mut self,
        pid: ProcessId,
        code: i32,
        threads: &mut ThreadTable,
        scheduler: &mut Scheduler,
        allocator: &mut A,
    ) -> Result<(), Error>
    where
        A: FrameAllocator + FrameDeallocator + ?Sized,
    {
        if !self.alive(pid) {
            return Err(Error::NotFound);
        }

        self.retire_threads(threads, scheduler, pid, allocator);

        let (orphans, parent_pid) = {
            let process = self.processes.get_mut(&pid).ok_or(Error::NotFound)?;
            process.fds.close_all();
            process.exit_code = code;
            process.state = ProcessState::Zombie;
            (mem::take(&mut process.children), process.parent)
        };

        // Children are reparented to the initial process.
        for orphan in orphans {
            if let Some(child) = self.processes.get_mut(&orphan) {
                child.parent = ProcessId::INIT;
            }
            if orphan != ProcessId::INIT {
                if let Some(init) = self.processes.get_mut(&ProcessId::INIT) {
                    if init.children.len() < MAX_CHILDREN {
                        init.children.push(orphan);
                    }
                }
            }
        }

        // An orphan has nobody to reap it: reclaim at once.
        if !self.alive(parent_pid) {
            let mut process = self.processes.remove(&pid).ok_or(Error::NotFound)?;
            if let Some(space) = process.address_space.take() {
                space.destroy(allocator);
            }
        }

        Ok(())
    }

    /// Delivers a termination signal: equivalent to the
    /// process exiting with the signal number as its exit
    /// code.
    ///
    /// # Safety
    ///
    /// As for [`exit`](Self::exit).
    ///
    pub unsafe fn kill<A>(
        &mut self,
        pid: ProcessId,
        signal: i32,
        threads: &mut ThreadTable,
        scheduler: &mut Scheduler,
        allocator: &mut A,
    ) -> Result<(), Error>
    where
        A: FrameAllocator + FrameDeallocator + ?Sized,
    {
        self.exit(pid, signal, threads, scheduler, allocator)
    }

    /// Reaps a zombie child of `parent`, returning its pid
    /// and exit code.
    ///
    /// With a pid given, only that child is considered;
    /// otherwise any zombie child will do. The reaped
    /// child's remaining resources (its address space and
    /// loader context) are freed and its slot disappears.
    /// If no matching zombie child exists, `wait` fails with
    /// [`Error::Invalid`] without blocking.
    ///
    /// # Safety
    ///
    /// The caller must ensure the child's address space is
    /// not installed on any CPU.
    ///
    pub unsafe fn wait<A>(
        &mut self,
        parent_pid: ProcessId,
        pid: Option<ProcessId>,
        allocator: &mut A,
    ) -> Result<(ProcessId, i32), Error>
    where
        A: FrameAllocator + FrameDeallocator + ?Sized,
    {
        let candidates: Vec<ProcessId> = {
            let parent = self.processes.get(&parent_pid).ok_or(Error::NotFound)?;
            match pid {
                Some(wanted) => {
                    if !parent.children.contains(&wanted) {
                        return Err(Error::Invalid);
                    }
                    let mut list = Vec::new();
                    list.push(wanted);
                    list
                }
                None => parent.children.clone(),
            }
        };

        for candidate in candidates {
            let is_zombie = self
                .processes
                .get(&candidate)
                .map(|child| child.state == ProcessState::Zombie)
                .unwrap_or(false);
            if !is_zombie {
                continue;
            }

            let mut child = self.processes.remove(&candidate).ok_or(Error::NotFound)?;
            let code = child.exit_code;
            if let Some(space) = child.address_space.take() {
                space.destroy(allocator);
            }

            let parent = self.processes.get_mut(&parent_pid).ok_or(Error::NotFound)?;
            parent.children.retain(|&c| c != candidate);

            return Ok((candidate, code));
        }

        Err(Error::Invalid)
    }

    /// Queries or moves the process's program break.
    ///
    /// A `new_brk` of zero queries the current break.
    /// Otherwise the break moves to `new_brk`: growth maps
    /// zeroed, writable, non-executable user pages for the
    /// new range, and shrinking unmaps and frees the pages
    /// released by the downward move. On failure the break
    /// is unchanged.
    ///
    /// # Safety
    ///
    /// As for [`exec`](Self::exec).
    ///
    pub unsafe fn brk<A>(
        &mut self,
        pid: ProcessId,
        new_brk: usize,
        allocator: &mut A,
    ) -> Result<VirtAddr, Error>
    where
        A: FrameAllocator + FrameDeallocator + ?Sized,
    {
        let process = self.processes.get_mut(&pid).ok_or(Error::NotFound)?;
        if new_brk == 0 {
            return Ok(process.brk);
        }

        let heap_start = process.heap_start;
        if heap_start.is_zero() {
            return Err(Error::Invalid);
        }

        let new_brk = VirtAddr::try_new(new_brk).map_err(|_| Error::Invalid)?;
        if new_brk < heap_start || new_brk >= USER_STACK.start() {
            return Err(Error::Invalid);
        }

        let space = process.address_space.as_mut().ok_or(Error::Invalid)?;
        let old_top = process.brk.align_up(PAGE_SIZE);
        let new_top = new_brk.align_up(PAGE_SIZE);

        if new_top > old_top {
            let pages = VirtPage::range_exclusive(
                VirtPage::containing_address(old_top),
                VirtPage::containing_address(new_top),
            );
            let flags = PageTableFlags::WRITABLE
                | PageTableFlags::USER_ACCESSIBLE
                | PageTableFlags::NO_EXECUTE;
            space.allocate_and_map(pages, flags, allocator)?;
        } else if new_top < old_top {
            let pages = VirtPage::range_exclusive(
                VirtPage::containing_address(new_top),
                VirtPage::containing_address(old_top),
            );
            space.unmap_and_free(pages, allocator)?;
        }

        // Keep the heap region in step with the mapped
        // range.
        space.remove_region(heap_start);
        if new_top > heap_start {
            let range = VirtAddrRange::new(heap_start, new_top - 1);
            let flags = PageTableFlags::WRITABLE
                | PageTableFlags::USER_ACCESSIBLE
                | PageTableFlags::NO_EXECUTE;
            space.add_region(range, RegionKind::Heap, flags)?;
        }

        process.brk = new_brk;
        process.heap_end = new_top;
        Ok(new_brk)
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use crate::thread::Priority;
    use alloc::vec::Vec;
    use filesystem::MemFs;
    use memory::PhysAddr;
    use physmem::BitmapFrameAllocator;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    struct TestMemory {
        ptr: *mut u8,
        layout: Layout,
    }

    impl TestMemory {
        fn new(frames: usize) -> TestMemory {
            let layout = Layout::from_size_align(frames * PAGE_SIZE, PAGE_SIZE).unwrap();
            let ptr = unsafe { alloc_zeroed(layout) };
            assert!(!ptr.is_null());

            TestMemory { ptr, layout }
        }

        fn allocator(&self) -> BitmapFrameAllocator {
            BitmapFrameAllocator::new(PhysAddr::new(self.ptr as usize), self.layout.size())
                .unwrap()
        }
    }

    impl Drop for TestMemory {
        fn drop(&mut self) {
            unsafe { dealloc(self.ptr, self.layout) };
        }
    }

    // A minimal static ELF64 executable: one read-write
    // load segment at 0x40_0000 covering the whole file,
    // entered at its base.
    //
    fn minimal_elf() -> Vec<u8> {
        let mut elf = Vec::new();
        elf.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        elf.extend_from_slice(&[0u8; 8]);
        elf.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        elf.extend_from_slice(&0x3e_u16.to_le_bytes()); // x86_64
        elf.extend_from_slice(&1u32.to_le_bytes());
        elf.extend_from_slice(&0x40_0000u64.to_le_bytes()); // entry
        elf.extend_from_slice(&64u64.to_le_bytes()); // phoff
        elf.extend_from_slice(&0u64.to_le_bytes()); // shoff
        elf.extend_from_slice(&0u32.to_le_bytes()); // flags
        elf.extend_from_slice(&64u16.to_le_bytes()); // ehsize
        elf.extend_from_slice(&56u16.to_le_bytes()); // phentsize
        elf.extend_from_slice(&1u16.to_le_bytes()); // phnum
        elf.extend_from_slice(&64u16.to_le_bytes()); // shentsize
        elf.extend_from_slice(&0u32.to_le_bytes()); // shnum, shstrndx

        // PT_LOAD, read-write, 0x1000 file bytes in 0x2000
        // of memory.
        elf.extend_from_slice(&1u32.to_le_bytes());
        elf.extend_from_slice(&6u32.to_le_bytes()); // RW
        elf.extend_from_slice(&0u64.to_le_bytes()); // offset
        elf.extend_from_slice(&0x40_0000u64.to_le_bytes()); // vaddr
        elf.extend_from_slice(&0x40_0000u64.to_le_bytes()); // paddr
        elf.extend_from_slice(&0x1000u64.to_le_bytes()); // filesz
        elf.extend_from_slice(&0x2000u64.to_le_bytes()); // memsz
        elf.extend_from_slice(&0x1000u64.to_le_bytes()); // align
        elf.resize(0x1000, 0);

        elf
    }

    struct Fixture {
        allocator: BitmapFrameAllocator,
        kernel_space: AddressSpace,
        processes: ProcessTable,
        threads: ThreadTable,
        scheduler: Scheduler,
        fs: MemFs,
    }

    fn fixture(mem: &TestMemory) -> Fixture {
        let mut allocator = mem.allocator();
        let kernel_space =
            unsafe { AddressSpace::new_kernel(&mut allocator, VirtAddr::zero()) }.unwrap();

        let mut threads = ThreadTable::new();
        let idle = threads.create_idle(ProcessId::new(0));
        let mut scheduler = Scheduler::new();
        scheduler.set_idle_thread(idle);

        let mut fs = MemFs::new();
        fs.insert("/bin/init", minimal_elf());

        Fixture {
            allocator,
            kernel_space,
            processes: ProcessTable::new(),
            threads,
            scheduler,
            fs,
        }
    }

    fn spawn_init(fx: &mut Fixture) -> ProcessId {
        let pid = fx.processes.create(None, 0).unwrap();
        assert_eq!(pid, ProcessId::INIT);
        unsafe {
            fx.processes.exec(
                pid,
                "/bin/init",
                &[],
                &[],
                &fx.fs,
                &fx.kernel_space,
                &mut fx.threads,
                &mut fx.scheduler,
                &mut fx.allocator,
            )
        }
        .unwrap();

        pid
    }

    fn write_user(space: &AddressSpace, addr: usize, value: u8) {
        let phys = space.translate(VirtAddr::new(addr)).expect("mapped");
        unsafe { *(phys.as_usize() as *mut u8) = value };
    }

    fn read_user(space: &AddressSpace, addr: usize) -> u8 {
        let phys = space.translate(VirtAddr::new(addr)).expect("mapped");
        unsafe { *(phys.as_usize() as *const u8) }
    }

    #[test]
    fn test_create_assigns_monotonic_pids() {
        let mem = TestMemory::new(64);
        let mut fx = fixture(&mem);

        let first = fx.processes.create(None, 0).unwrap();
        let second = fx.processes.create(Some(first), 0).unwrap();
        assert_eq!(first.as_u64(), 1);
        assert_eq!(second.as_u64(), 2);

        let parent = fx.processes.get(first).unwrap();
        assert_eq!(parent.state(), ProcessState::Embryo);
        assert_eq!(parent.children(), &[second]);
        assert_eq!(parent.cwd(), "/");

        let child = fx.processes.get(second).unwrap();
        assert_eq!(child.parent(), first);
    }

    #[test]
    fn test_exec_builds_the_process_image() {
        let mem = TestMemory::new(1024);
        let mut fx = fixture(&mem);
        let pid = spawn_init(&mut fx);

        let process = fx.processes.get(pid).unwrap();
        assert_eq!(process.state(), ProcessState::Ready);
        assert_eq!(process.name(), "/bin/init");
        assert_eq!(process.threads().len(), 1);

        let image = process.image().unwrap();
        assert_eq!(image.entry_point, VirtAddr::new(0x40_0000));
        assert_eq!(image.image_size, 0x2000);

        // The heap starts page-aligned after the image.
        assert_eq!(process.heap_start(), VirtAddr::new(0x40_2000));
        assert_eq!(process.brk(), VirtAddr::new(0x40_2000));

        // The image's bytes are in place, the BSS is zero.
        let space = process.address_space().unwrap();
        assert_eq!(read_user(space, 0x40_0000), 0x7f);
        assert_eq!(read_user(space, 0x40_1800), 0);

        // The user stack is mapped up to its top.
        assert!(space.translate(USER_STACK.start()).is_some());
        assert!(space.translate(USER_STACK_TOP - 1).is_some());
        assert!(space.translate(USER_STACK_TOP).is_none());

        // The main thread is ready at the entry point with
        // the stack pointer at the stack top.
        let main = process.main_thread().unwrap();
        let thread = fx.threads.get(main).unwrap();
        assert_eq!(thread.state(), ThreadState::Ready);
        assert_eq!(thread.entry_point(), VirtAddr::new(0x40_0000));
        assert_eq!(thread.user_stack_pointer(), USER_STACK_TOP);
        assert_eq!(thread.priority(), Priority::Normal);

        // And it is in the ready queue: the scheduler picks
        // it up.
        let (_, next) = fx.scheduler.schedule(&mut fx.threads).unwrap();
        assert_eq!(next, main);
    }

    #[test]
    fn test_exec_missing_file() {
        let mem = TestMemory::new(256);
        let mut fx = fixture(&mem);
        let pid = fx.processes.create(None, 0).unwrap();

        let err = unsafe {
            fx.processes.exec(
                pid,
                "/bin/missing",
                &[],
                &[],
                &fx.fs,
                &fx.kernel_space,
                &mut fx.threads,
                &mut fx.scheduler,
                &mut fx.allocator,
            )
        }
        .unwrap_err();
        assert_eq!(err, Error::NotFound);
        assert_eq!(fx.processes.get(pid).unwrap().state(), ProcessState::Embryo);
    }

    #[test]
    fn test_fork_write_isolation() {
        let mem = TestMemory::new(1024);
        let mut fx = fixture(&mem);
        let parent = spawn_init(&mut fx);

        // The parent writes 0xaa at 0x40_0000.
        write_user(
            fx.processes.get(parent).unwrap().address_space().unwrap(),
            0x40_0000,
            0xaa,
        );

        let child = unsafe {
            fx.processes
                .fork(parent, &mut fx.threads, &mut fx.scheduler, &mut fx.allocator)
        }
        .unwrap();

        // The child sees the parent's byte, then overwrites
        // it; the parent still reads its own value.
        let child_space = fx.processes.get(child).unwrap().address_space().unwrap();
        assert_eq!(read_user(child_space, 0x40_0000), 0xaa);
        write_user(child_space, 0x40_0000, 0xbb);

        let parent_space = fx.processes.get(parent).unwrap().address_space().unwrap();
        assert_eq!(read_user(parent_space, 0x40_0000), 0xaa);
        assert_eq!(
            read_user(fx.processes.get(child).unwrap().address_space().unwrap(), 0x40_0000),
            0xbb
        );

        // Parent and child agree about each other.
        assert_eq!(fx.processes.get(parent).unwrap().children(), &[child]);
        assert_eq!(fx.processes.get(child).unwrap().parent(), parent);

        // The child is ready, and its main thread is
        // already queued.
        let child_process = fx.processes.get(child).unwrap();
        assert_eq!(child_process.state(), ProcessState::Ready);
        let main = child_process.main_thread().unwrap();
        assert_eq!(fx.threads.get(main).unwrap().state(), ThreadState::Ready);
    }

    #[test]
    fn test_fork_shares_descriptors() {
        let mem = TestMemory::new(1024);
        let mut fx = fixture(&mem);
        let parent = spawn_init(&mut fx);

        use filesystem::{FileSystem, OpenFlags};
        let file = fx.fs.open("/bin/init", OpenFlags::READ).unwrap();
        let fd = fx
            .processes
            .get_mut(parent)
            .unwrap()
            .fds_mut()
            .alloc(file, OpenFlags::READ)
            .unwrap();

        let child = unsafe {
            fx.processes
                .fork(parent, &mut fx.threads, &mut fx.scheduler, &mut fx.allocator)
        }
        .unwrap();

        let parent_entry = fx.processes.get(parent).unwrap().fds().get(fd).unwrap().file.clone();
        let child_entry = fx.processes.get(child).unwrap().fds().get(fd).unwrap().file.clone();
        assert!(alloc::sync::Arc::ptr_eq(&parent_entry, &child_entry));
    }

    #[test]
    fn test_exit_and_wait_reap_the_zombie() {
        let mem = TestMemory::new(1024);
        let mut fx = fixture(&mem);
        let parent = spawn_init(&mut fx);
        let child = unsafe {
            fx.processes
                .fork(parent, &mut fx.threads, &mut fx.scheduler, &mut fx.allocator)
        }
        .unwrap();

        // Waiting before the child exits doesn't block; it
        // fails.
        assert_eq!(
            unsafe { fx.processes.wait(parent, None, &mut fx.allocator) }.unwrap_err(),
            Error::Invalid
        );

        unsafe {
            fx.processes
                .exit(child, 42, &mut fx.threads, &mut fx.scheduler, &mut fx.allocator)
        }
        .unwrap();

        // The zombie holds its pid and exit code; its
        // threads are gone.
        let zombie = fx.processes.get(child).unwrap();
        assert_eq!(zombie.state(), ProcessState::Zombie);
        assert_eq!(zombie.exit_code(), 42);
        assert!(zombie.threads().is_empty());
        assert_eq!(zombie.fds().open_count(), 0);

        let (reaped, code) = unsafe {
            fx.processes.wait(parent, Some(child), &mut fx.allocator)
        }
        .unwrap();
        assert_eq!(reaped, child);
        assert_eq!(code, 42);

        // The slot is gone, and the parent's child list is
        // empty.
        assert!(fx.processes.get(child).is_none());
        assert!(fx.processes.get(parent).unwrap().children().is_empty());
    }

    #[test]
    fn test_exit_reparents_grandchildren() {
        let mem = TestMemory::new(2048);
        let mut fx = fixture(&mem);
        let init = spawn_init(&mut fx);
        let child = unsafe {
            fx.processes
                .fork(init, &mut fx.threads, &mut fx.scheduler, &mut fx.allocator)
        }
        .unwrap();
        let grandchild = unsafe {
            fx.processes
                .fork(child, &mut fx.threads, &mut fx.scheduler, &mut fx.allocator)
        }
        .unwrap();

        unsafe {
            fx.processes
                .exit(child, 0, &mut fx.threads, &mut fx.scheduler, &mut fx.allocator)
        }
        .unwrap();

        // The grandchild now belongs to init.
        assert_eq!(fx.processes.get(grandchild).unwrap().parent(), init);
        assert!(fx.processes.get(init).unwrap().children().contains(&grandchild));
    }

    #[test]
    fn test_orphan_exit_reclaims_immediately() {
        let mem = TestMemory::new(1024);
        let mut fx = fixture(&mem);
        let pid = spawn_init(&mut fx);

        let used_before_exec = fx.allocator.stats().used;

        // Init has no parent: its exit reclaims everything
        // at once.
        unsafe {
            fx.processes
                .exit(pid, 0, &mut fx.threads, &mut fx.scheduler, &mut fx.allocator)
        }
        .unwrap();
        assert!(fx.processes.get(pid).is_none());

        let _ = used_before_exec;
    }

    #[test]
    fn test_exit_frees_what_wait_does_not() {
        let mem = TestMemory::new(1024);
        let mut fx = fixture(&mem);
        let parent = spawn_init(&mut fx);

        let used_before_fork = fx.allocator.stats().used;
        let child = unsafe {
            fx.processes
                .fork(parent, &mut fx.threads, &mut fx.scheduler, &mut fx.allocator)
        }
        .unwrap();

        unsafe {
            fx.processes
                .exit(child, 0, &mut fx.threads, &mut fx.scheduler, &mut fx.allocator)
        }
        .unwrap();
        unsafe { fx.processes.wait(parent, Some(child), &mut fx.allocator) }.unwrap();

        // Everything the fork allocated has been returned.
        assert_eq!(fx.allocator.stats().used, used_before_fork);
    }

    #[test]
    fn test_brk() {
        let mem = TestMemory::new(1024);
        let mut fx = fixture(&mem);
        let pid = spawn_init(&mut fx);

        let heap_start = fx.processes.get(pid).unwrap().heap_start();

        // Zero queries the current break.
        let current = unsafe { fx.processes.brk(pid, 0, &mut fx.allocator) }.unwrap();
        assert_eq!(current, heap_start);

        // Growing maps writable pages.
        let grown = heap_start.as_usize() + 3 * PAGE_SIZE;
        assert_eq!(
            unsafe { fx.processes.brk(pid, grown, &mut fx.allocator) }.unwrap(),
            VirtAddr::new(grown)
        );
        {
            let process = fx.processes.get(pid).unwrap();
            let space = process.address_space().unwrap();
            assert!(space.translate(heap_start).is_some());
            assert!(space.translate(VirtAddr::new(grown - 1)).is_some());
            write_user(space, heap_start.as_usize(), 0x77);
            assert_eq!(
                space.region_containing(heap_start).unwrap().kind(),
                RegionKind::Heap
            );
        }

        // Shrinking unmaps the released pages.
        let shrunk = heap_start.as_usize() + PAGE_SIZE;
        assert_eq!(
            unsafe { fx.processes.brk(pid, shrunk, &mut fx.allocator) }.unwrap(),
            VirtAddr::new(shrunk)
        );
        {
            let process = fx.processes.get(pid).unwrap();
            let space = process.address_space().unwrap();
            assert!(space.translate(heap_start).is_some());
            assert!(space.translate(VirtAddr::new(grown - 1)).is_none());
        }

        // A break below the heap start is invalid and
        // leaves the break unchanged.
        assert_eq!(
            unsafe { fx.processes.brk(pid, heap_start.as_usize() - 1, &mut fx.allocator) }
                .unwrap_err(),
            Error::Invalid
        );
        assert_eq!(fx.processes.get(pid).unwrap().brk(), VirtAddr::new(shrunk));
    }

    #[test]
    fn test_kill_is_exit_with_signal() {
        let mem = TestMemory::new(1024);
        let mut fx = fixture(&mem);
        let parent = spawn_init(&mut fx);
        let child = unsafe {
            fx.processes
                .fork(parent, &mut fx.threads, &mut fx.scheduler, &mut fx.allocator)
        }
        .unwrap();

        unsafe {
            fx.processes
                .kill(child, 9, &mut fx.threads, &mut fx.scheduler, &mut fx.allocator)
        }
        .unwrap();

        let (_, code) =
            unsafe { fx.processes.wait(parent, Some(child), &mut fx.allocator) }.unwrap();
        assert_eq!(code, 9);
    }
}
