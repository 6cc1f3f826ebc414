// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

use crate::region::{Region, RegionKind};
use alloc::vec::Vec;
use core::ptr;
use memory::constants::{KERNEL_IDENTITY_BASE, KERNEL_IDENTITY_SIZE, PHYSICAL_MEMORY_OFFSET};
use memory::{KERNEL_HALF_START, NUM_ENTRIES};
use memory::{
    FrameAllocator, FrameDeallocator, PageMappingError, PageRemappingError, PageTable,
    PageTableFlags, PageUnmappingError, PhysAddr, PhysFrame, PhysFrameRange, VirtAddr,
    VirtAddrRange, VirtPage, VirtPageRange, PAGE_SIZE,
};
use serial::println;
use syscalls::Error;

/// A snapshot of an address space's usage counters.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AddressSpaceStats {
    /// The number of user pages currently mapped.
    pub mapped_pages: usize,

    /// The number of semantic regions recorded.
    pub regions: usize,
}

/// A virtual memory address space: the root of a 4-level page
/// table hierarchy, its semantic regions, and usage counters.
///
/// See the [crate documentation](crate) for ownership and
/// sharing rules.
///
pub struct AddressSpace {
    // The physical frame holding the level 4 page table.
    pml4: PhysFrame,

    // The virtual address at which this address space's
    // page tables access physical memory.
    physmem_offset: VirtAddr,

    // Whether this is the kernel's address space, which
    // must never be destroyed.
    kernel: bool,

    // Whether this address space is currently installed on
    // the CPU. Mapping changes to an installed space flush
    // the TLB; changes to any other space take effect when
    // it is next installed.
    active: bool,

    // The semantic regions mapped into the user half.
    regions: Vec<Region>,

    // The number of user pages currently mapped.
    mapped_pages: usize,
}

impl AddressSpace {
    /// Builds the kernel's address space.
    ///
    /// The first 4 GiB of physical memory are identity-mapped
    /// writable, and all physical memory is mapped at
    /// [`PHYSICAL_MEMORY_OFFSET`] in the upper half. Both
    /// windows use 1 GiB mappings, so construction costs a
    /// handful of page table frames.
    ///
    /// # Safety
    ///
    /// The caller must ensure that frames returned by
    /// `allocator` can be dereferenced at `physmem_offset`.
    ///
    pub unsafe fn new_kernel<A>(
        allocator: &mut A,
        physmem_offset: VirtAddr,
    ) -> Result<AddressSpace, Error>
    where
        A: FrameAllocator + ?Sized,
    {
        let pml4 = allocator.allocate_frame().ok_or(Error::OutOfMemory)?;
        let mut table = PageTable::at_offset(pml4.start_address(), physmem_offset);
        table.zero();

        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::GLOBAL;
        const GIB: usize = 1024 * 1024 * 1024;
        for i in 0..KERNEL_IDENTITY_SIZE / GIB {
            // The identity window.
            let phys = PhysAddr::new(KERNEL_IDENTITY_BASE.as_usize() + i * GIB);
            table
                .map_1gib(VirtAddr::new(phys.as_usize()), phys, flags, allocator)
                .map_err(mapping_error)?
                .ignore();

            // The all-physical-memory window in the upper
            // half, which is what user spaces will share.
            table
                .map_1gib(
                    PHYSICAL_MEMORY_OFFSET + i * GIB,
                    phys,
                    flags | PageTableFlags::NO_EXECUTE,
                    allocator,
                )
                .map_err(mapping_error)?
                .ignore();
        }

        Ok(AddressSpace {
            pml4,
            physmem_offset,
            kernel: true,
            active: false,
            regions: Vec::new(),
            mapped_pages: 0,
        })
    }

    /// Creates a new user address space sharing the kernel's
    /// upper half.
    ///
    /// The new level 4 table is zeroed and the kernel's
    /// upper-half entries are copied in, so every kernel
    /// mapping is visible in the new space. The user half
    /// starts empty.
    ///
    /// # Safety
    ///
    /// As for [`new_kernel`](Self::new_kernel).
    ///
    pub unsafe fn new_user<A>(kernel: &AddressSpace, allocator: &mut A) -> Result<AddressSpace, Error>
    where
        A: FrameAllocator + ?Sized,
    {
        let physmem_offset = kernel.physmem_offset;
        let pml4 = allocator.allocate_frame().ok_or(Error::OutOfMemory)?;
        let mut table = PageTable::at_offset(pml4.start_address(), physmem_offset);
        table.zero();

        let kernel_table = PageTable::at_offset(kernel.pml4.start_address(), physmem_offset);
        for index in KERNEL_HALF_START..NUM_ENTRIES {
            *table.entry_mut(index) = kernel_table.entry(index).clone();
        }

        Ok(AddressSpace {
            pml4,
            physmem_offset,
            kernel: false,
            active: false,
            regions: Vec::new(),
            mapped_pages: 0,
        })
    }

    /// Returns the physical frame holding the level 4 page
    /// table.
    ///
    pub fn page_table(&self) -> PhysFrame {
        self.pml4
    }

    /// Returns the offset at which this address space's page
    /// tables access physical memory.
    ///
    pub fn physmem_offset(&self) -> VirtAddr {
        self.physmem_offset
    }

    /// Returns whether this is the kernel's address space.
    ///
    pub fn is_kernel(&self) -> bool {
        self.kernel
    }

    /// Returns whether this address space is installed on
    /// the CPU.
    ///
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Installs this address space on the CPU.
    ///
    /// # Safety
    ///
    /// The address space must contain the kernel mappings
    /// the CPU is currently executing from.
    ///
    pub unsafe fn install(&mut self) {
        use x86_64::registers::control::{Cr3, Cr3Flags};

        let frame = x86_64::structures::paging::PhysFrame::from_start_address(
            self.pml4.start_address().as_x86_64(),
        )
        .expect("page table frame is aligned");
        Cr3::write(frame, Cr3Flags::empty());
        self.active = true;
    }

    /// Records that this address space is no longer
    /// installed on the CPU.
    ///
    pub fn mark_inactive(&mut self) {
        self.active = false;
    }

    fn table(&self) -> PageTable {
        // The PML4 frame was allocated by us (or handed to
        // us at construction) and remains valid for the
        // address space's lifetime.
        unsafe { PageTable::at_offset(self.pml4.start_address(), self.physmem_offset) }
    }

    /// Returns whether the frames mapped at the given
    /// address are owned by this address space.
    ///
    fn owns_frame_at(&self, addr: VirtAddr) -> bool {
        match self.region_containing(addr) {
            Some(region) => region.owns_frames(),
            None => true,
        }
    }

    // Region bookkeeping.

    /// Records a semantic region.
    ///
    /// Fails with [`Error::AlreadyExists`] if the range
    /// overlaps an existing region.
    ///
    pub fn add_region(
        &mut self,
        range: VirtAddrRange,
        kind: RegionKind,
        flags: PageTableFlags,
    ) -> Result<(), Error> {
        for region in self.regions.iter() {
            if region.range().overlaps_with(&range) {
                return Err(Error::AlreadyExists);
            }
        }

        self.regions.push(Region::new(range, kind, flags));
        Ok(())
    }

    /// Removes and returns the region starting at the given
    /// address.
    ///
    pub fn remove_region(&mut self, start: VirtAddr) -> Option<Region> {
        let index = self
            .regions
            .iter()
            .position(|region| region.range().start() == start)?;

        Some(self.regions.remove(index))
    }

    /// Returns the region containing the given address, if
    /// any. This is what fault handling uses to attribute a
    /// faulting address.
    ///
    pub fn region_containing(&self, addr: VirtAddr) -> Option<&Region> {
        self.regions.iter().find(|region| region.contains(addr))
    }

    /// Returns an iterator over the recorded regions.
    ///
    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    // Mapping.

    /// Maps the given page to the given frame.
    ///
    /// The `PRESENT` flag is always set. If this address
    /// space is installed, the TLB entry for `page` is
    /// invalidated before returning.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `frame` is not in use
    /// elsewhere, unless the mapping is within a region
    /// marked shared.
    ///
    pub unsafe fn map_page<A>(
        &mut self,
        page: VirtPage,
        frame: PhysFrame,
        flags: PageTableFlags,
        allocator: &mut A,
    ) -> Result<(), Error>
    where
        A: FrameAllocator + ?Sized,
    {
        let change = self
            .table()
            .map(page, frame, flags | PageTableFlags::PRESENT, allocator)
            .map_err(mapping_error)?;

        if self.active {
            change.flush();
        } else {
            change.ignore();
        }

        self.mapped_pages += 1;
        Ok(())
    }

    /// Maps each page in `pages` to the corresponding frame
    /// in `frames`.
    ///
    /// The mapping is transactional: if mapping page `k`
    /// fails, the first `k-1` mappings are removed before
    /// the error is returned. The frames themselves are not
    /// deallocated; they belong to the caller.
    ///
    /// # Safety
    ///
    /// As for [`map_page`](Self::map_page).
    ///
    pub unsafe fn map_range<A>(
        &mut self,
        pages: VirtPageRange,
        frames: PhysFrameRange,
        flags: PageTableFlags,
        allocator: &mut A,
    ) -> Result<(), Error>
    where
        A: FrameAllocator + ?Sized,
    {
        if pages.num_pages() != frames.num_frames() {
            return Err(Error::Invalid);
        }

        let mut mapped = Vec::new();
        let mut frames = frames;
        for page in pages {
            let frame = frames.next().ok_or(Error::Invalid)?;
            match self.map_page(page, frame, flags, allocator) {
                Ok(()) => mapped.push(page),
                Err(err) => {
                    for done in mapped {
                        // The unmap of a just-mapped page
                        // cannot fail.
                        let _ = self.unmap_page(done);
                    }

                    return Err(err);
                }
            }
        }

        Ok(())
    }

    /// Allocates a zeroed frame for each page in `pages` and
    /// maps it, returning the frames in page order.
    ///
    /// On failure, pages mapped so far are unmapped and
    /// their frames returned to the allocator.
    ///
    /// # Safety
    ///
    /// The caller must ensure that frames returned by
    /// `allocator` can be dereferenced at this space's
    /// physical memory offset.
    ///
    pub unsafe fn allocate_and_map<A>(
        &mut self,
        pages: VirtPageRange,
        flags: PageTableFlags,
        allocator: &mut A,
    ) -> Result<Vec<PhysFrame>, Error>
    where
        A: FrameAllocator + FrameDeallocator + ?Sized,
    {
        let mut mapped = Vec::new();
        for page in pages {
            let frame = match allocator.allocate_frame() {
                Some(frame) => frame,
                None => {
                    self.rollback(&mapped, allocator);
                    return Err(Error::OutOfMemory);
                }
            };

            // Zero the frame so the process can't observe
            // stale memory.
            let virt = self
                .physmem_offset
                .checked_add(frame.start_address().as_usize())
                .ok_or(Error::Invalid)?;
            ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0x00, PAGE_SIZE);

            match self.map_page(page, frame, flags, allocator) {
                Ok(()) => mapped.push((page, frame)),
                Err(err) => {
                    allocator.deallocate_frame(frame);
                    self.rollback(&mapped, allocator);
                    return Err(err);
                }
            }
        }

        Ok(mapped.into_iter().map(|(_page, frame)| frame).collect())
    }

    unsafe fn rollback<A>(&mut self, mapped: &[(VirtPage, PhysFrame)], allocator: &mut A)
    where
        A: FrameAllocator + FrameDeallocator + ?Sized,
    {
        for (page, frame) in mapped.iter() {
            let _ = self.unmap_page(*page);
            allocator.deallocate_frame(*frame);
        }
    }

    /// Removes the mapping for the given page, returning
    /// the frame it mapped.
    ///
    /// Fails with [`Error::NotFound`] if any level of the
    /// hierarchy is absent. If this address space is
    /// installed, the TLB entry for `page` is invalidated.
    ///
    /// # Safety
    ///
    /// The caller must ensure the page is no longer in use.
    ///
    pub unsafe fn unmap_page(&mut self, page: VirtPage) -> Result<PhysFrame, Error> {
        let (frame, change) = self.table().unmap(page).map_err(unmapping_error)?;

        if self.active {
            change.flush();
        } else {
            change.ignore();
        }

        self.mapped_pages -= 1;
        Ok(frame)
    }

    /// Removes the mappings for every page in the range,
    /// returning the frames of owned pages to `allocator`.
    ///
    /// Pages that were not mapped are skipped; if any page
    /// in the range was unmapped, the whole call reports
    /// [`Error::NotFound`] after processing the rest.
    ///
    /// # Safety
    ///
    /// The caller must ensure the pages are no longer in
    /// use.
    ///
    pub unsafe fn unmap_and_free<A>(
        &mut self,
        pages: VirtPageRange,
        allocator: &mut A,
    ) -> Result<(), Error>
    where
        A: FrameAllocator + FrameDeallocator + ?Sized,
    {
        let mut missing = false;
        for page in pages {
            match self.unmap_page(page) {
                Ok(frame) => {
                    if self.owns_frame_at(page.start_address()) {
                        allocator.deallocate_frame(frame);
                    }
                }
                Err(Error::NotFound) => missing = true,
                Err(err) => return Err(err),
            }
        }

        if missing {
            Err(Error::NotFound)
        } else {
            Ok(())
        }
    }

    /// Translates a virtual address to the physical address
    /// it maps to, or `None`.
    ///
    pub fn translate(&self, addr: VirtAddr) -> Option<PhysAddr> {
        self.table().translate_addr(addr)
    }

    /// Rewrites the protection flags of every present leaf
    /// in `[addr, addr + size)`.
    ///
    /// Pages in the range that are not mapped are skipped.
    /// The `PRESENT` flag is always retained.
    ///
    /// # Safety
    ///
    /// Changing page protections is unsafe, as it may
    /// invalidate assumptions made about the memory.
    ///
    pub unsafe fn protect(
        &mut self,
        addr: VirtAddr,
        size: usize,
        flags: PageTableFlags,
    ) -> Result<(), Error> {
        if size == 0 {
            return Ok(());
        }

        let start = VirtPage::containing_address(addr);
        let end = VirtPage::containing_address(addr + (size - 1));
        for page in VirtPage::range_inclusive(start, end) {
            match self
                .table()
                .change_flags(page, flags | PageTableFlags::PRESENT)
            {
                Ok(change) => {
                    if self.active {
                        change.flush();
                    } else {
                        change.ignore();
                    }
                }
                Err(PageRemappingError::PageNotMapped) => {}
                Err(PageRemappingError::LargerParentMappingExists) => {
                    return Err(Error::Invalid);
                }
            }
        }

        Ok(())
    }

    /// Produces an eager deep copy of this address space.
    ///
    /// Every present user page is copied into a freshly
    /// allocated frame with the source's flag bits, through
    /// fresh intermediate tables; afterwards, writes through
    /// either address space are invisible to the other. The
    /// kernel upper half is re-shared, not copied, and the
    /// frames of shared regions are re-referenced.
    ///
    /// # Safety
    ///
    /// As for [`new_kernel`](Self::new_kernel): frames must
    /// be dereferenceable at this space's physical memory
    /// offset.
    ///
    pub unsafe fn duplicate<A>(&self, allocator: &mut A) -> Result<AddressSpace, Error>
    where
        A: FrameAllocator + FrameDeallocator + ?Sized,
    {
        let offset = self.physmem_offset;
        let pml4 = allocator.allocate_frame().ok_or(Error::OutOfMemory)?;
        let mut dst = AddressSpace {
            pml4,
            physmem_offset: offset,
            kernel: false,
            active: false,
            regions: self.regions.clone(),
            mapped_pages: 0,
        };

        let mut dst_table = PageTable::at_offset(pml4.start_address(), offset);
        dst_table.zero();

        // Re-share the kernel upper half.
        let src_table = self.table();
        for index in KERNEL_HALF_START..NUM_ENTRIES {
            *dst_table.entry_mut(index) = src_table.entry(index).clone();
        }
        drop(dst_table);

        // Deep-copy the user half.
        let result = self.copy_user_half(&mut dst, allocator);
        if let Err(err) = result {
            dst.destroy(allocator);
            return Err(err);
        }

        Ok(dst)
    }

    unsafe fn copy_user_half<A>(&self, dst: &mut AddressSpace, allocator: &mut A) -> Result<(), Error>
    where
        A: FrameAllocator + FrameDeallocator + ?Sized,
    {
        let offset = self.physmem_offset;
        let src_table = self.table();
        for i4 in 0..KERNEL_HALF_START {
            let entry4 = src_table.entry(i4);
            if !entry4.is_present() {
                continue;
            }

            let table3 = entry4.child_table(offset);
            for i3 in 0..NUM_ENTRIES {
                let entry3 = table3.entry(i3);
                if !entry3.is_present() || entry3.flags().huge() {
                    continue;
                }

                let table2 = entry3.child_table(offset);
                for i2 in 0..NUM_ENTRIES {
                    let entry2 = table2.entry(i2);
                    if !entry2.is_present() || entry2.flags().huge() {
                        continue;
                    }

                    let table1 = entry2.child_table(offset);
                    for i1 in 0..NUM_ENTRIES {
                        let entry1 = table1.entry(i1);
                        if !entry1.is_present() {
                            continue;
                        }

                        let vaddr =
                            VirtAddr::new(i4 << 39 | i3 << 30 | i2 << 21 | i1 << 12);
                        let page = VirtPage::from_start_address(vaddr)
                            .expect("page table walk produced an unaligned page");
                        let flags = entry1.flags();
                        let src_frame = entry1
                            .phys_frame()
                            .expect("malformed page table entry");

                        if !self.owns_frame_at(vaddr) {
                            // Shared or device memory is
                            // re-referenced, not copied.
                            dst.map_page(page, src_frame, flags, allocator)?;
                            continue;
                        }

                        let new_frame =
                            allocator.allocate_frame().ok_or(Error::OutOfMemory)?;
                        let src_virt = offset
                            .checked_add(src_frame.start_address().as_usize())
                            .ok_or(Error::Invalid)?;
                        let dst_virt = offset
                            .checked_add(new_frame.start_address().as_usize())
                            .ok_or(Error::Invalid)?;
                        ptr::copy_nonoverlapping(
                            src_virt.as_mut_ptr::<u8>(),
                            dst_virt.as_mut_ptr::<u8>(),
                            PAGE_SIZE,
                        );

                        dst.map_page(page, new_frame, flags, allocator)?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Tears down this address space, returning every owned
    /// user frame and intermediate page table to `allocator`.
    ///
    /// Only the user half is walked: the kernel's upper-half
    /// tables are shared and remain untouched.
    ///
    /// # Panics
    ///
    /// `destroy` will panic if called on the kernel address
    /// space or on a space that is still installed.
    ///
    /// # Safety
    ///
    /// The caller must ensure no thread can still touch this
    /// address space's user memory.
    ///
    pub unsafe fn destroy<A>(self, allocator: &mut A)
    where
        A: FrameAllocator + FrameDeallocator + ?Sized,
    {
        if self.kernel {
            panic!("BROKEN INVARIANT: attempted to destroy the kernel address space");
        }
        if self.active {
            panic!("BROKEN INVARIANT: attempted to destroy an installed address space");
        }

        let offset = self.physmem_offset;
        let pml4_table = PageTable::at_offset(self.pml4.start_address(), offset);
        for i4 in 0..KERNEL_HALF_START {
            let entry4 = pml4_table.entry(i4);
            if !entry4.is_present() {
                continue;
            }

            let frame3 = entry4.phys_frame().expect("malformed page table entry");
            let table3 = entry4.child_table(offset);
            for i3 in 0..NUM_ENTRIES {
                let entry3 = table3.entry(i3);
                if !entry3.is_present() || entry3.flags().huge() {
                    continue;
                }

                let frame2 = entry3.phys_frame().expect("malformed page table entry");
                let table2 = entry3.child_table(offset);
                for i2 in 0..NUM_ENTRIES {
                    let entry2 = table2.entry(i2);
                    if !entry2.is_present() || entry2.flags().huge() {
                        continue;
                    }

                    let frame1 = entry2.phys_frame().expect("malformed page table entry");
                    let table1 = entry2.child_table(offset);
                    for i1 in 0..NUM_ENTRIES {
                        let entry1 = table1.entry(i1);
                        if !entry1.is_present() {
                            continue;
                        }

                        let vaddr =
                            VirtAddr::new(i4 << 39 | i3 << 30 | i2 << 21 | i1 << 12);
                        if self.owns_frame_at(vaddr) {
                            let frame = entry1
                                .phys_frame()
                                .expect("malformed page table entry");
                            allocator.deallocate_frame(frame);
                        }
                    }

                    allocator.deallocate_frame(frame1);
                }

                allocator.deallocate_frame(frame2);
            }

            allocator.deallocate_frame(frame3);
        }

        allocator.deallocate_frame(self.pml4);
    }

    /// Returns a snapshot of the address space's counters.
    ///
    pub fn stats(&self) -> AddressSpaceStats {
        AddressSpaceStats {
            mapped_pages: self.mapped_pages,
            regions: self.regions.len(),
        }
    }

    /// Prints debug information about the address space.
    ///
    pub fn debug(&self) {
        println!(
            "Address space at {:?}: {} pages mapped.",
            self.pml4,
            self.mapped_pages
        );
        for region in self.regions.iter() {
            println!("  {}", region);
        }
    }
}

fn mapping_error(err: PageMappingError) -> Error {
    match err {
        PageMappingError::PageTableAllocationFailed => Error::OutOfMemory,
        PageMappingError::PageAlreadyMapped(_) => Error::AlreadyExists,
        PageMappingError::LargerParentMappingExists => Error::Invalid,
        PageMappingError::InvalidPhysAddr(_) => Error::Invalid,
    }
}

fn unmapping_error(err: PageUnmappingError) -> Error {
    match err {
        PageUnmappingError::PageNotMapped => Error::NotFound,
        PageUnmappingError::LargerParentMappingExists => Error::Invalid,
        PageUnmappingError::InvalidPhysAddr(_) => Error::Invalid,
    }
}
