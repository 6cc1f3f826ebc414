// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Contains types and functionality to represent physical and virtual memory.
//!
//! This crate provides the core vocabulary of the memory system:
//!
//! - [`PhysAddr`]: An address in the 52-bit physical address space.
//! - [`PhysFrame`]: A 4 KiB frame of physical memory.
//! - [`PhysFrameRange`]: A contiguous sequence of physical frames.
//! - [`VirtAddr`]: A canonical address in the 48-bit virtual address space.
//! - [`VirtAddrRange`]: A contiguous sequence of virtual addresses.
//! - [`VirtPage`]: A 4 KiB page of virtual memory.
//! - [`VirtPageRange`]: A contiguous sequence of virtual pages.
//!
//! The [`PageTable`] type parses and modifies 4-level page tables,
//! mapping pages of virtual memory to frames of physical memory
//! according to [`PageTableFlags`]. A page table is always accessed
//! through the virtual address at which physical memory is mapped.
//! In the running kernel that is [`constants::PHYSICAL_MEMORY_OFFSET`];
//! tests instead use an offset of zero, so heap buffers stand in for
//! physical memory and the same walking code is exercised on the host.
//!
//! The [`FrameAllocator`] and [`FrameDeallocator`] traits abstract
//! the management of physical memory, so address spaces and loaders
//! can be used with any frame allocator.
//!
//! The [`constants`] module fixes the virtual memory layout.

#![no_std]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

pub mod constants;
mod page_table;
mod phys_addr;
mod phys_frame;
mod virt_addr;
mod virt_page;
mod virt_range;

pub use crate::page_table::{
    level1_index, level2_index, level3_index, level4_index, PageMapping, PageMappingChange,
    PageMappingError, PageRemappingError, PageTable, PageTableEntry, PageTableFlags,
    PageUnmappingError, KERNEL_HALF_START, NUM_ENTRIES,
};
pub use crate::phys_addr::{InvalidPhysAddr, PhysAddr};
pub use crate::phys_frame::{PhysFrame, PhysFrameRange};
pub use crate::virt_addr::{InvalidVirtAddr, VirtAddr};
pub use crate::virt_page::{VirtPage, VirtPageRange};
pub use crate::virt_range::VirtAddrRange;

/// The size of a frame of physical memory and a page of virtual
/// memory, in bytes.
///
pub const PAGE_SIZE: usize = 4096;

/// Returns a virtual address that is mapped to the given physical
/// address.
///
/// This uses the mapping of all physical memory at the virtual
/// address [`constants::PHYSICAL_MEMORY_OFFSET`].
///
pub fn phys_to_virt_addr(phys: PhysAddr) -> VirtAddr {
    constants::PHYSICAL_MEMORY_OFFSET
        .checked_add(phys.as_usize())
        .expect("invalid physical address")
}

/// A trait for types that can allocate frames of physical
/// memory.
///
/// # Safety
///
/// This trait is unsafe, as each implementation must ensure
/// that it only ever returns unused frames.
///
pub unsafe trait FrameAllocator {
    /// Allocate a frame of physical memory and return it,
    /// if possible.
    ///
    fn allocate_frame(&mut self) -> Option<PhysFrame>;

    /// Allocate `n` physically contiguous frames, if
    /// possible.
    ///
    fn allocate_n_frames(&mut self, n: usize) -> Option<PhysFrameRange>;
}

/// A trait for types that can deallocate frames of physical
/// memory.
///
pub trait FrameDeallocator {
    /// Deallocate the given frame of memory.
    ///
    /// # Safety
    ///
    /// The caller must ensure that the given frame is
    /// unused.
    ///
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame);

    /// Deallocate each frame in the given range.
    ///
    /// # Safety
    ///
    /// The caller must ensure that the given frames are
    /// unused.
    ///
    unsafe fn deallocate_n_frames(&mut self, range: PhysFrameRange) {
        for frame in range {
            self.deallocate_frame(frame);
        }
    }
}
