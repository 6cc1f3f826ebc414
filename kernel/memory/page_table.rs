// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

use crate::constants::PHYSICAL_MEMORY_OFFSET;
use crate::{FrameAllocator, InvalidPhysAddr, PhysAddr, PhysFrame, VirtAddr, VirtPage};
use bitflags::bitflags;
use x86_64::instructions::tlb;

/// The mask covering the frame address bits of a page table
/// entry. Bits 12 through 51 hold the 40-bit frame number;
/// everything else is flags or reserved.
///
const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// The number of entries in a page table.
///
pub const NUM_ENTRIES: usize = 512;

/// The mask for indices into a page table.
///
const ENTRY_MASK: usize = NUM_ENTRIES - 1;

/// The index of the first upper-half entry in a level 4
/// page table. Entries at this index and above describe
/// kernel space and are shared between address spaces.
///
pub const KERNEL_HALF_START: usize = 256;

bitflags! {
    /// The flags in a page table entry.
    ///
    pub struct PageTableFlags: u64 {
        /// Indicates that the referenced page table or
        /// physical frame is mapped and usable.
        const PRESENT = 1 << 0;

        /// Indicates that the referenced page table or
        /// physical frame is writable. When unset on an
        /// intermediate table, nothing beneath that table
        /// is writable, irrespective of leaf flags.
        const WRITABLE = 1 << 1;

        /// Indicates that accesses from ring 3 are
        /// allowed.
        const USER_ACCESSIBLE = 1 << 2;

        /// Indicates that the caching behaviour for this
        /// memory is write-through, rather than
        /// write-back.
        const WRITE_THROUGH = 1 << 3;

        /// Indicates that the memory should not be
        /// cached.
        const NO_CACHE = 1 << 4;

        /// Indicates that the referenced page table or
        /// physical frame has been read since this bit
        /// was last cleared.
        const ACCESSED = 1 << 5;

        /// Indicates that the referenced page table or
        /// physical frame has been written since this
        /// bit was last cleared.
        const DIRTY = 1 << 6;

        /// Indicates that this entry references a huge
        /// physical frame directly, rather than a child
        /// page table.
        const HUGE_PAGE = 1 << 7;

        /// Indicates that this mapping survives TLB
        /// flushes when the address space changes.
        const GLOBAL = 1 << 8;

        /// Indicates that the referenced memory cannot
        /// be used for instruction fetches.
        const NO_EXECUTE = 1 << 63;
    }
}

impl PageTableFlags {
    /// Returns whether the `PRESENT` flag is set.
    ///
    pub const fn present(&self) -> bool {
        self.contains(Self::PRESENT)
    }

    /// Returns whether the `PRESENT` flag is unset.
    ///
    pub const fn absent(&self) -> bool {
        !self.contains(Self::PRESENT)
    }

    /// Returns whether the `WRITABLE` flag is set.
    ///
    pub const fn writable(&self) -> bool {
        self.contains(Self::WRITABLE)
    }

    /// Returns whether the `HUGE_PAGE` flag is set.
    ///
    pub const fn huge(&self) -> bool {
        self.contains(Self::HUGE_PAGE)
    }

    /// Returns whether the `USER_ACCESSIBLE` flag is set.
    ///
    pub const fn user(&self) -> bool {
        self.contains(Self::USER_ACCESSIBLE)
    }

    /// Returns whether the `NO_EXECUTE` flag is unset.
    ///
    pub const fn executable(&self) -> bool {
        !self.contains(Self::NO_EXECUTE)
    }
}

/// Represents a single 64-bit entry in a page table.
///
#[derive(Clone)]
#[repr(transparent)]
pub struct PageTableEntry {
    entry: u64,
}

impl PageTableEntry {
    /// Returns a new, empty page table entry.
    ///
    #[inline]
    pub const fn new() -> Self {
        PageTableEntry { entry: 0 }
    }

    /// Clears this entry.
    ///
    #[inline]
    pub fn zero(&mut self) {
        self.entry = 0;
    }

    /// Returns whether the entry is marked as present.
    ///
    #[inline]
    pub const fn is_present(&self) -> bool {
        self.flags().present()
    }

    /// Returns whether the entry is entirely unused.
    ///
    #[inline]
    pub const fn is_unused(&self) -> bool {
        self.entry == 0
    }

    /// Returns the flags for this entry.
    ///
    #[inline]
    pub const fn flags(&self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.entry)
    }

    /// Returns the physical address in this entry. The
    /// least significant 12 bits are always zero.
    ///
    #[inline]
    pub const fn addr(&self) -> PhysAddr {
        PhysAddr::new((self.entry & ADDR_MASK) as usize)
    }

    /// Returns the physical frame referenced by this
    /// entry.
    ///
    #[inline]
    pub fn phys_frame(&self) -> Result<PhysFrame, InvalidPhysAddr> {
        PhysFrame::from_start_address(self.addr())
    }

    /// Sets the entry's flags, leaving its address
    /// unchanged.
    ///
    #[inline]
    pub fn set_flags(&mut self, flags: PageTableFlags) {
        self.entry = flags.bits() | (self.entry & ADDR_MASK);
    }

    /// Sets the entry's physical address to `addr` and its
    /// flags to `flags`. If `addr` has bits outside the
    /// frame address mask, it is returned as an
    /// [`InvalidPhysAddr`].
    ///
    #[inline]
    pub fn set_addr_flags(
        &mut self,
        addr: PhysAddr,
        flags: PageTableFlags,
    ) -> Result<(), InvalidPhysAddr> {
        let addr = addr.as_usize() as u64;
        if addr & ADDR_MASK != addr {
            Err(InvalidPhysAddr(addr as usize))
        } else {
            self.entry = flags.bits() | addr;
            Ok(())
        }
    }

    /// Sets the entry's physical address to the given
    /// frame and its flags to `flags`.
    ///
    #[inline]
    pub fn set_frame_flags(
        &mut self,
        frame: PhysFrame,
        flags: PageTableFlags,
    ) -> Result<(), InvalidPhysAddr> {
        self.set_addr_flags(frame.start_address(), flags)
    }

    /// Returns the child page table referenced by this
    /// entry, using the given physical memory offset.
    ///
    /// # Safety
    ///
    /// This dereferences the address in this entry, which
    /// is unsafe.
    ///
    #[inline]
    pub unsafe fn child_table(&self, physmem_offset: VirtAddr) -> PageTable {
        PageTable::at_offset(self.addr(), physmem_offset)
    }

    /// Creates a new page table for this entry if one does
    /// not already exist, setting at least the bits in
    /// `flags` on this entry.
    ///
    fn ensure_child_table<A>(
        &mut self,
        flags: PageTableFlags,
        allocator: &mut A,
        offset: VirtAddr,
    ) -> Result<PageTable, PageMappingError>
    where
        A: FrameAllocator + ?Sized,
    {
        // If a table is already present, update the flags
        // and return it.
        if self.is_present() || !self.addr().is_zero() {
            let current = self.flags();
            if !flags.is_empty() && !current.contains(flags) {
                self.set_flags(flags | current);
            }

            return Ok(unsafe { self.child_table(offset) });
        }

        let frame = allocator
            .allocate_frame()
            .ok_or(PageMappingError::PageTableAllocationFailed)?;
        self.set_frame_flags(frame, flags)
            .map_err(|InvalidPhysAddr(addr)| PageMappingError::InvalidPhysAddr(addr))?;

        let mut table = unsafe { self.child_table(offset) };
        table.zero();

        Ok(table)
    }
}

/// Provides access to a page table and its contents.
///
/// Page tables store physical addresses, so all accesses go
/// through the virtual address at which physical memory is
/// mapped. The running kernel uses
/// [`PHYSICAL_MEMORY_OFFSET`]; tests use an offset of zero
/// so that heap buffers stand in for physical memory.
///
pub struct PageTable<'entries> {
    // Virtual address at which all physical memory is
    // mapped.
    physmem_offset: VirtAddr,

    // The actual table contents.
    table: &'entries mut [PageTableEntry; NUM_ENTRIES],
}

impl<'entries> PageTable<'entries> {
    /// Creates a page table referring to the page table data
    /// at the given physical address, which must be
    /// frame-aligned.
    ///
    /// # Safety
    ///
    /// This dereferences `addr`, which is unsafe.
    ///
    pub unsafe fn at(addr: PhysAddr) -> Result<Self, InvalidPhysAddr> {
        if !addr.is_aligned(crate::PAGE_SIZE) {
            Err(InvalidPhysAddr(addr.as_usize()))
        } else {
            Ok(Self::at_offset(addr, PHYSICAL_MEMORY_OFFSET))
        }
    }

    /// Creates a page table from the page table data at the
    /// given physical address, using the provided offset at
    /// which physical memory is mapped.
    ///
    /// An offset of zero treats physical addresses as
    /// directly dereferenceable, which allows page tables
    /// built in ordinary memory to be exercised in tests.
    /// Outside tests, use [`PageTable::at`].
    ///
    /// # Safety
    ///
    /// This dereferences `addr`, which is unsafe.
    ///
    pub unsafe fn at_offset(addr: PhysAddr, physmem_offset: VirtAddr) -> Self {
        let table_addr = physmem_offset
            .checked_add(addr.as_usize())
            .expect("invalid physical address");
        let table = &mut *(table_addr.as_mut_ptr::<[PageTableEntry; NUM_ENTRIES]>());

        PageTable {
            physmem_offset,
            table,
        }
    }

    /// Returns the offset at which this table accesses
    /// physical memory.
    ///
    pub fn physmem_offset(&self) -> VirtAddr {
        self.physmem_offset
    }

    /// Clears the page table, setting every entry to zero.
    ///
    /// Note that this does nothing to any child page tables
    /// or physical frames currently referenced by this page
    /// table.
    ///
    pub fn zero(&mut self) {
        for entry in self.table.iter_mut() {
            entry.zero();
        }
    }

    /// Returns the entry at the given index.
    ///
    pub fn entry(&self, index: usize) -> &PageTableEntry {
        &self.table[index & ENTRY_MASK]
    }

    /// Returns the entry at the given index, mutably.
    ///
    pub fn entry_mut(&mut self, index: usize) -> &mut PageTableEntry {
        &mut self.table[index & ENTRY_MASK]
    }

    /// Iterate through the entries in this page table.
    ///
    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.table.iter()
    }

    /// Translate the given virtual address to a physical
    /// address, according to the page tables.
    ///
    pub fn translate(&self, addr: VirtAddr) -> PageMapping {
        let level4_entry = &self.table[level4_index(addr)];
        let level4_flags = level4_entry.flags();
        if level4_flags.absent() {
            return PageMapping::NotMapped;
        } else if level4_flags.huge() {
            return PageMapping::InvalidLevel4PageTable;
        }

        let level3_table = unsafe { level4_entry.child_table(self.physmem_offset) };
        let level3_entry = level3_table.entry(level3_index(addr));
        let level3_flags = level3_entry.flags();
        if level3_flags.absent() {
            return PageMapping::NotMapped;
        } else if level3_flags.huge() {
            // A 1 GiB mapping.
            let offset = addr.as_usize() & (SIZE_1GIB - 1);
            return PageMapping::Mapping {
                addr: level3_entry.addr() + offset,
                flags: level3_flags,
            };
        }

        let level2_table = unsafe { level3_entry.child_table(self.physmem_offset) };
        let level2_entry = level2_table.entry(level2_index(addr));
        let level2_flags = level2_entry.flags();
        if level2_flags.absent() {
            return PageMapping::NotMapped;
        } else if level2_flags.huge() {
            // A 2 MiB mapping.
            let offset = addr.as_usize() & (SIZE_2MIB - 1);
            return PageMapping::Mapping {
                addr: level2_entry.addr() + offset,
                flags: level2_flags,
            };
        }

        let level1_table = unsafe { level2_entry.child_table(self.physmem_offset) };
        let level1_entry = level1_table.entry(level1_index(addr));
        let level1_flags = level1_entry.flags();
        if level1_flags.absent() {
            return PageMapping::NotMapped;
        }

        PageMapping::Mapping {
            addr: level1_entry.addr() + addr.page_offset(),
            flags: level1_flags,
        }
    }

    /// Translate the given virtual address to a physical
    /// address, according to the page tables.
    ///
    pub fn translate_addr(&self, addr: VirtAddr) -> Option<PhysAddr> {
        if let PageMapping::Mapping { addr, .. } = self.translate(addr) {
            Some(addr)
        } else {
            None
        }
    }

    /// Translate the given virtual page to the physical
    /// frame of a 4 KiB mapping, according to the page
    /// tables.
    ///
    pub fn translate_page(&self, page: VirtPage) -> Option<PhysFrame> {
        match self.translate(page.start_address()) {
            PageMapping::Mapping { addr, flags } if !flags.huge() => {
                Some(PhysFrame::containing_address(addr))
            }
            _ => None,
        }
    }

    /// Create a new 4 KiB mapping in the page table.
    ///
    /// The `allocator` may be called to allocate physical
    /// memory for any new page tables that are created.
    ///
    /// # Safety
    ///
    /// Making a page mapping is unsafe, as the caller must
    /// ensure that any other mappings to `frame` are not
    /// used concurrently with changes to `page`.
    ///
    pub unsafe fn map<A>(
        &mut self,
        page: VirtPage,
        frame: PhysFrame,
        flags: PageTableFlags,
        allocator: &mut A,
    ) -> Result<PageMappingChange, PageMappingError>
    where
        A: FrameAllocator + ?Sized,
    {
        let addr = page.start_address();
        let offset = self.physmem_offset;
        let parent_table_flags =
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;

        let level4_entry = &mut self.table[level4_index(addr)];
        if level4_entry.flags().huge() {
            return Err(PageMappingError::LargerParentMappingExists);
        }

        let mut level3_table =
            level4_entry.ensure_child_table(parent_table_flags, allocator, offset)?;
        let level3_entry = level3_table.entry_mut(level3_index(addr));
        if level3_entry.flags().huge() {
            return Err(PageMappingError::LargerParentMappingExists);
        }

        let mut level2_table =
            level3_entry.ensure_child_table(parent_table_flags, allocator, offset)?;
        let level2_entry = level2_table.entry_mut(level2_index(addr));
        if level2_entry.flags().huge() {
            return Err(PageMappingError::LargerParentMappingExists);
        }

        let mut level1_table =
            level2_entry.ensure_child_table(parent_table_flags, allocator, offset)?;
        let level1_entry = level1_table.entry_mut(level1_index(addr));
        if level1_entry.is_present() || !level1_entry.addr().is_zero() {
            return Err(PageMappingError::PageAlreadyMapped(
                PhysFrame::containing_address(level1_entry.addr()),
            ));
        }

        level1_entry
            .set_frame_flags(frame, flags & !PageTableFlags::HUGE_PAGE)
            .map_err(|InvalidPhysAddr(addr)| PageMappingError::InvalidPhysAddr(addr))?;

        Ok(PageMappingChange::new(page))
    }

    /// Create a new 1 GiB mapping in the page table.
    ///
    /// Both `addr` and `phys` must be 1 GiB aligned. This
    /// is used to build the kernel's identity and physical
    /// memory windows; ordinary mappings use [`map`](Self::map).
    ///
    /// # Safety
    ///
    /// As for [`map`](Self::map).
    ///
    pub unsafe fn map_1gib<A>(
        &mut self,
        addr: VirtAddr,
        phys: PhysAddr,
        flags: PageTableFlags,
        allocator: &mut A,
    ) -> Result<PageMappingChange, PageMappingError>
    where
        A: FrameAllocator + ?Sized,
    {
        if !addr.is_aligned(SIZE_1GIB) || !phys.is_aligned(SIZE_1GIB) {
            return Err(PageMappingError::InvalidPhysAddr(phys.as_usize()));
        }

        let offset = self.physmem_offset;
        let parent_table_flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;

        let level4_entry = &mut self.table[level4_index(addr)];
        if level4_entry.flags().huge() {
            return Err(PageMappingError::LargerParentMappingExists);
        }

        let mut level3_table =
            level4_entry.ensure_child_table(parent_table_flags, allocator, offset)?;
        let level3_entry = level3_table.entry_mut(level3_index(addr));
        if level3_entry.is_present() || !level3_entry.addr().is_zero() {
            return Err(PageMappingError::PageAlreadyMapped(
                PhysFrame::containing_address(level3_entry.addr()),
            ));
        }

        level3_entry
            .set_addr_flags(phys, flags | PageTableFlags::HUGE_PAGE)
            .map_err(|InvalidPhysAddr(addr)| PageMappingError::InvalidPhysAddr(addr))?;

        Ok(PageMappingChange::new(
            VirtPage::from_start_address(addr).expect("1 GiB aligned address"),
        ))
    }

    /// Change the page table flags for an existing 4 KiB
    /// mapping in the page table.
    ///
    /// # Safety
    ///
    /// Changing a page mapping is unsafe, as it may
    /// invalidate assumptions made by the compiler about
    /// whether data can be modified.
    ///
    pub unsafe fn change_flags(
        &mut self,
        page: VirtPage,
        flags: PageTableFlags,
    ) -> Result<PageMappingChange, PageRemappingError> {
        let addr = page.start_address();
        let offset = self.physmem_offset;

        let level4_entry = &mut self.table[level4_index(addr)];
        let level4_flags = level4_entry.flags();
        if level4_flags.absent() {
            return Err(PageRemappingError::PageNotMapped);
        } else if level4_flags.huge() {
            return Err(PageRemappingError::LargerParentMappingExists);
        }

        let mut level3_table = level4_entry.child_table(offset);
        let level3_entry = level3_table.entry_mut(level3_index(addr));
        let level3_flags = level3_entry.flags();
        if level3_flags.absent() {
            return Err(PageRemappingError::PageNotMapped);
        } else if level3_flags.huge() {
            return Err(PageRemappingError::LargerParentMappingExists);
        }

        let mut level2_table = level3_entry.child_table(offset);
        let level2_entry = level2_table.entry_mut(level2_index(addr));
        let level2_flags = level2_entry.flags();
        if level2_flags.absent() {
            return Err(PageRemappingError::PageNotMapped);
        } else if level2_flags.huge() {
            return Err(PageRemappingError::LargerParentMappingExists);
        }

        let mut level1_table = level2_entry.child_table(offset);
        let level1_entry = level1_table.entry_mut(level1_index(addr));
        let level1_flags = level1_entry.flags();
        if level1_flags.absent() || level1_flags.huge() {
            return Err(PageRemappingError::PageNotMapped);
        }

        level1_entry.set_flags(flags & !PageTableFlags::HUGE_PAGE);

        Ok(PageMappingChange::new(page))
    }

    /// Remove a 4 KiB mapping from the page table.
    ///
    /// The previous physical frame is returned. Note that
    /// no page tables are allocated or deallocated.
    ///
    /// # Safety
    ///
    /// Removing a page mapping is unsafe, as the caller must
    /// ensure that the virtual address range being unmapped
    /// is no longer in use.
    ///
    pub unsafe fn unmap(
        &mut self,
        page: VirtPage,
    ) -> Result<(PhysFrame, PageMappingChange), PageUnmappingError> {
        let addr = page.start_address();
        let offset = self.physmem_offset;

        let level4_entry = &mut self.table[level4_index(addr)];
        let level4_flags = level4_entry.flags();
        if level4_flags.absent() {
            return Err(PageUnmappingError::PageNotMapped);
        } else if level4_flags.huge() {
            return Err(PageUnmappingError::LargerParentMappingExists);
        }

        let mut level3_table = level4_entry.child_table(offset);
        let level3_entry = level3_table.entry_mut(level3_index(addr));
        let level3_flags = level3_entry.flags();
        if level3_flags.absent() {
            return Err(PageUnmappingError::PageNotMapped);
        } else if level3_flags.huge() {
            return Err(PageUnmappingError::LargerParentMappingExists);
        }

        let mut level2_table = level3_entry.child_table(offset);
        let level2_entry = level2_table.entry_mut(level2_index(addr));
        let level2_flags = level2_entry.flags();
        if level2_flags.absent() {
            return Err(PageUnmappingError::PageNotMapped);
        } else if level2_flags.huge() {
            return Err(PageUnmappingError::LargerParentMappingExists);
        }

        let mut level1_table = level2_entry.child_table(offset);
        let level1_entry = level1_table.entry_mut(level1_index(addr));
        let level1_flags = level1_entry.flags();
        if level1_flags.absent() || level1_flags.huge() {
            return Err(PageUnmappingError::PageNotMapped);
        }

        let frame = level1_entry
            .phys_frame()
            .map_err(|InvalidPhysAddr(addr)| PageUnmappingError::InvalidPhysAddr(addr))?;
        level1_entry.zero();

        Ok((frame, PageMappingChange::new(page)))
    }
}

/// The number of bytes in a 2 MiB mapping.
///
const SIZE_2MIB: usize = 2 * 1024 * 1024;

/// The number of bytes in a 1 GiB mapping.
///
const SIZE_1GIB: usize = 1024 * 1024 * 1024;

/// Describes the result of translating a virtual address
/// to a physical address using a set of page tables.
///
#[derive(Debug, PartialEq)]
pub enum PageMapping {
    /// A valid mapping.
    Mapping {
        /// The translated physical address.
        addr: PhysAddr,
        /// The page table flags of the leaf entry.
        flags: PageTableFlags,
    },
    /// An invalid mapping, due to the [`PRESENT`](PageTableFlags::PRESENT)
    /// flag being unset at some level.
    NotMapped,
    /// An invalid mapping, due to an incorrect page table
    /// physical address.
    InvalidPageTableAddr(usize),
    /// An invalid mapping, due to the level 4 page table
    /// having the [`HUGE_PAGE`](PageTableFlags::HUGE_PAGE)
    /// bit set.
    InvalidLevel4PageTable,
}

/// Describes a page mapping that has been changed. This
/// must either be flushed to update the TLB, or ignored
/// explicitly when the change applies to an address space
/// that is not installed.
///
#[derive(Debug)]
#[must_use = "Page mapping changes must either flush the TLB or be ignored explicitly."]
pub struct PageMappingChange(VirtPage);

impl PageMappingChange {
    fn new(page: VirtPage) -> Self {
        PageMappingChange(page)
    }

    /// Flush the relevant portion of the TLB for this
    /// page mapping.
    ///
    #[inline]
    pub fn flush(self) {
        tlb::flush(self.0.start_address().as_x86_64());
    }

    /// Ignore the page mapping change.
    ///
    /// The CPU will not observe the change until the
    /// affected address space is next installed.
    ///
    #[inline]
    pub fn ignore(self) {}
}

/// Describes an error encountered while trying to make a
/// new page mapping.
///
#[derive(Debug, PartialEq)]
pub enum PageMappingError {
    /// Failed to allocate a new physical memory frame
    /// for use as a new page table.
    PageTableAllocationFailed,
    /// Tried to create a new page mapping within a
    /// larger existing mapping, such as a 4 KiB page
    /// inside a 1 GiB mapping.
    LargerParentMappingExists,
    /// This virtual page is already mapped to a physical
    /// memory frame. The frame that is already mapped is
    /// returned.
    PageAlreadyMapped(PhysFrame),
    /// The provided physical address cannot be used in a
    /// page table entry.
    InvalidPhysAddr(usize),
}

/// Describes an error encountered while trying to change
/// the flags on an existing page mapping.
///
#[derive(Debug, PartialEq)]
pub enum PageRemappingError {
    /// Tried to change a page mapping within a larger
    /// mapping.
    LargerParentMappingExists,
    /// This virtual page is not mapped.
    PageNotMapped,
}

/// Describes an error encountered while trying to remove
/// a page mapping.
///
#[derive(Debug, PartialEq)]
pub enum PageUnmappingError {
    /// Tried to remove a page mapping within a larger
    /// mapping.
    LargerParentMappingExists,
    /// This virtual page is not mapped.
    PageNotMapped,
    /// The current mapping was to an invalid physical
    /// frame address.
    InvalidPhysAddr(usize),
}

/// Returns the index into the level 4 page table for the
/// given virtual address.
///
pub const fn level4_index(addr: VirtAddr) -> usize {
    (addr.as_usize() >> 39) & ENTRY_MASK
}

/// Returns the index into the level 3 page table for the
/// given virtual address.
///
pub const fn level3_index(addr: VirtAddr) -> usize {
    (addr.as_usize() >> 30) & ENTRY_MASK
}

/// Returns the index into the level 2 page table for the
/// given virtual address.
///
pub const fn level2_index(addr: VirtAddr) -> usize {
    (addr.as_usize() >> 21) & ENTRY_MASK
}

/// Returns the index into the level 1 page table for the
/// given virtual address.
///
pub const fn level1_index(addr: VirtAddr) -> usize {
    (addr.as_usize() >> 12) & ENTRY_MASK
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use std::boxed::Box;
    use std::vec::Vec;
    use x86_64::structures::paging;
    use x86_64::structures::paging::{Mapper, Translate};

    #[test]
    fn test_page_table_indices() {
        let addr = VirtAddr::new(0xffff_8234_5678_9abc);
        assert_eq!(level4_index(addr), 260);
        assert_eq!(level3_index(addr), 209);
        assert_eq!(level2_index(addr), 179);
        assert_eq!(level1_index(addr), 393);
    }

    // A frame-aligned byte buffer the same size as a page
    // table. Allocated on the heap, these can be used as
    // page tables with a physical memory offset of 0.
    //
    #[repr(C)]
    #[repr(align(4096))]
    struct FakePageTable {
        entries: [u8; crate::PAGE_SIZE],
    }

    impl FakePageTable {
        fn new() -> Self {
            FakePageTable {
                entries: [0u8; crate::PAGE_SIZE],
            }
        }
    }

    // A "physical frame allocator" handing out heap buffers
    // that are not otherwise in use, so page mapping can be
    // tested in userspace.
    //
    struct FakeFrameAllocator {
        buffers: Vec<Box<FakePageTable>>,
    }

    impl FakeFrameAllocator {
        fn new() -> Self {
            FakeFrameAllocator {
                buffers: Vec::new(),
            }
        }

        fn allocate(&mut self) -> PhysAddr {
            let next = Box::new(FakePageTable::new());
            let addr = PhysAddr::new(next.as_ref() as *const FakePageTable as usize);
            self.buffers.push(next);

            addr
        }
    }

    unsafe impl FrameAllocator for FakeFrameAllocator {
        fn allocate_frame(&mut self) -> Option<PhysFrame> {
            let addr = self.allocate();
            Some(PhysFrame::from_start_address(addr).expect("got unaligned fake page table"))
        }

        fn allocate_n_frames(&mut self, _n: usize) -> Option<crate::PhysFrameRange> {
            // Contiguous allocation is the real allocator's
            // job; page tables only need single frames.
            None
        }
    }

    unsafe impl paging::FrameAllocator<paging::Size4KiB> for FakeFrameAllocator {
        fn allocate_frame(&mut self) -> Option<paging::PhysFrame> {
            let addr = self.allocate().as_x86_64();
            let frame =
                paging::PhysFrame::from_start_address(addr).expect("got unaligned fake page table");
            Some(frame)
        }
    }

    fn page_for(addr: usize) -> VirtPage {
        VirtPage::from_start_address(VirtAddr::new(addr)).unwrap()
    }

    fn frame_for(addr: usize) -> PhysFrame {
        PhysFrame::from_start_address(PhysAddr::new(addr)).unwrap()
    }

    // Build mappings with this implementation, then check
    // that both our translation and the x86_64 crate's
    // agree on the result. The x86_64 crate acts as the
    // reference for the bit layout.
    //
    #[test]
    fn test_page_table_map_and_translate() {
        // We pretend that we're using physical memory by
        // using an offset of 0.
        let offset = VirtAddr::zero();

        let mut allocator = FakeFrameAllocator::new();
        let mut pml4 = Box::new(paging::PageTable::new());
        let pml4_addr = PhysAddr::new(pml4.as_ref() as *const paging::PageTable as usize);
        let mut page_table = unsafe { PageTable::at_offset(pml4_addr, offset) };

        let cases = [
            (
                page_for(0x7123_4567_8000),
                frame_for(0x000f_edcb_a987_6000),
                PageTableFlags::PRESENT,
            ),
            (
                page_for(0x1000),
                frame_for(0x6000),
                PageTableFlags::PRESENT
                    | PageTableFlags::USER_ACCESSIBLE
                    | PageTableFlags::WRITABLE
                    | PageTableFlags::GLOBAL
                    | PageTableFlags::NO_EXECUTE,
            ),
            (
                page_for(0xffff_8000_4444_0000),
                frame_for(0x123_4000),
                PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE,
            ),
        ];

        for (page, frame, flags) in cases.iter() {
            unsafe {
                page_table
                    .map(*page, *frame, *flags, &mut allocator)
                    .expect("map")
                    .ignore();

                // Mapping the same page again must fail.
                assert_eq!(
                    page_table
                        .map(*page, *frame, *flags, &mut allocator)
                        .expect_err("second mapping"),
                    PageMappingError::PageAlreadyMapped(*frame),
                );
            }
        }

        for (page, frame, flags) in cases.iter() {
            // Our own translation.
            assert_eq!(page_table.translate_page(*page), Some(*frame));
            assert_eq!(
                page_table.translate(page.start_address()),
                PageMapping::Mapping {
                    addr: frame.start_address(),
                    flags: *flags,
                }
            );
            assert_eq!(
                page_table.translate(page.start_address() + 0xfff),
                PageMapping::Mapping {
                    addr: frame.start_address() + 0xfff,
                    flags: *flags,
                }
            );

            // The addresses around the mapping are not
            // mapped.
            assert_eq!(
                page_table.translate(page.start_address() - 1),
                PageMapping::NotMapped
            );
            assert_eq!(
                page_table.translate(page.start_address() + crate::PAGE_SIZE),
                PageMapping::NotMapped
            );
        }

        // Check the x86_64 crate agrees with every
        // translation.
        drop(page_table);
        let x86_table =
            unsafe { paging::OffsetPageTable::new(pml4.as_mut(), x86_64::VirtAddr::new(0)) };
        for (page, frame, _flags) in cases.iter() {
            assert_eq!(
                x86_table.translate_addr(page.start_address().as_x86_64()),
                Some(frame.start_address().as_x86_64()),
            );
            assert_eq!(
                x86_table.translate_addr((page.start_address() + 0x123).as_x86_64()),
                Some((frame.start_address() + 0x123).as_x86_64()),
            );
        }
        drop(x86_table);

        // Unmap everything, checking we get the right
        // frames back and that the mappings are gone.
        let mut page_table = unsafe { PageTable::at_offset(pml4_addr, offset) };
        for (page, frame, _flags) in cases.iter() {
            let (unmapped, change) = unsafe { page_table.unmap(*page) }.expect("unmap");
            change.ignore();
            assert_eq!(unmapped, *frame);
            assert_eq!(page_table.translate_page(*page), None);
            assert_eq!(
                unsafe { page_table.unmap(*page) }.expect_err("second unmap"),
                PageUnmappingError::PageNotMapped
            );
        }
    }

    #[test]
    fn test_page_table_map_against_x86_64() {
        // Make mappings with the x86_64 crate, then check
        // our translations agree.
        let offset = VirtAddr::zero();
        let mut allocator = FakeFrameAllocator::new();
        let mut pml4 = Box::new(paging::PageTable::new());
        let mut x86_table =
            unsafe { paging::OffsetPageTable::new(pml4.as_mut(), x86_64::VirtAddr::new(0)) };

        let page = page_for(0x40_0000);
        let frame = frame_for(0x789_a000);
        let flags = paging::PageTableFlags::PRESENT
            | paging::PageTableFlags::WRITABLE
            | paging::PageTableFlags::USER_ACCESSIBLE;
        unsafe {
            x86_table
                .map_to(
                    paging::Page::<paging::Size4KiB>::from_start_address(
                        page.start_address().as_x86_64(),
                    )
                    .unwrap(),
                    paging::PhysFrame::from_start_address(frame.start_address().as_x86_64())
                        .unwrap(),
                    flags,
                    &mut allocator,
                )
                .expect("map_to")
                .ignore();
        }
        drop(x86_table);

        let pml4_addr = PhysAddr::new(pml4.as_ref() as *const paging::PageTable as usize);
        let page_table = unsafe { PageTable::at_offset(pml4_addr, offset) };
        assert_eq!(page_table.translate_page(page), Some(frame));
        assert_eq!(
            page_table.translate(page.start_address() + 0x321),
            PageMapping::Mapping {
                addr: frame.start_address() + 0x321,
                flags: PageTableFlags::PRESENT
                    | PageTableFlags::WRITABLE
                    | PageTableFlags::USER_ACCESSIBLE,
            }
        );
    }

    #[test]
    fn test_page_table_change_flags() {
        let offset = VirtAddr::zero();
        let mut allocator = FakeFrameAllocator::new();
        let mut pml4 = Box::new(paging::PageTable::new());
        let pml4_addr = PhysAddr::new(pml4.as_ref() as *const paging::PageTable as usize);
        let mut page_table = unsafe { PageTable::at_offset(pml4_addr, offset) };

        let page = page_for(0x40_0000);
        let frame = frame_for(0x9000);
        let rw = PageTableFlags::PRESENT
            | PageTableFlags::WRITABLE
            | PageTableFlags::USER_ACCESSIBLE
            | PageTableFlags::NO_EXECUTE;
        unsafe {
            page_table.map(page, frame, rw, &mut allocator).unwrap().ignore();
        }

        // Tighten to read-execute and check both the flags
        // and the frame address survive.
        let rx = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
        unsafe {
            page_table.change_flags(page, rx).unwrap().ignore();
        }
        assert_eq!(
            page_table.translate(page.start_address()),
            PageMapping::Mapping {
                addr: frame.start_address(),
                flags: rx,
            }
        );

        // Changing the flags of an unmapped page fails.
        assert_eq!(
            unsafe { page_table.change_flags(page_for(0x50_0000), rx) }.expect_err("unmapped"),
            PageRemappingError::PageNotMapped
        );
    }

    #[test]
    fn test_page_table_map_1gib() {
        let offset = VirtAddr::zero();
        let mut allocator = FakeFrameAllocator::new();
        let mut pml4 = Box::new(paging::PageTable::new());
        let pml4_addr = PhysAddr::new(pml4.as_ref() as *const paging::PageTable as usize);
        let mut page_table = unsafe { PageTable::at_offset(pml4_addr, offset) };

        let virt = VirtAddr::new(0xffff_8000_8000_0000);
        let phys = PhysAddr::new(0x4000_0000);
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::GLOBAL;
        unsafe {
            page_table
                .map_1gib(virt, phys, flags, &mut allocator)
                .expect("map_1gib")
                .ignore();
        }

        // Translation resolves through the huge entry,
        // carrying the offset within the gigabyte.
        assert_eq!(
            page_table.translate(virt + 0x1234_5678),
            PageMapping::Mapping {
                addr: phys + 0x1234_5678,
                flags: flags | PageTableFlags::HUGE_PAGE,
            }
        );

        // A 4 KiB mapping inside the huge mapping is
        // refused.
        assert_eq!(
            unsafe {
                page_table.map(
                    VirtPage::containing_address(virt),
                    frame_for(0x7000),
                    PageTableFlags::PRESENT,
                    &mut allocator,
                )
            }
            .expect_err("mapping inside huge mapping"),
            PageMappingError::LargerParentMappingExists
        );

        // The x86_64 crate agrees.
        drop(page_table);
        let x86_table =
            unsafe { paging::OffsetPageTable::new(pml4.as_mut(), x86_64::VirtAddr::new(0)) };
        assert_eq!(
            x86_table.translate_addr((virt + 0x1234_5678).as_x86_64()),
            Some((phys + 0x1234_5678).as_x86_64()),
        );
    }
}
