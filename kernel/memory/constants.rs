// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Contains constants describing the virtual memory layout.
//!
//! Each [`VirtAddrRange`] reserves a region of virtual memory for a
//! prescribed purpose:
//!
//! - [`NULL_PAGE`]: The lowest virtual memory, never mapped, so null pointer dereferences fault.
//! - [`USERSPACE`]: The rest of the lower half, used by userspace processes.
//! - [`USER_STACK`]: The pages of a process's initial user stack, at the top of the lower half.
//! - [`KERNELSPACE`]: The upper half, shared between all address spaces.
//! - [`KERNEL_IDENTITY`]: The physical region identity-mapped in the kernel's address space.
//! - [`PHYSICAL_MEMORY`]: The region into which all physical memory is mapped.
//!
//! There are also the following address constants:
//!
//! - [`USER_IMAGE_BASE`]: The deterministic base address for position-independent binaries.
//! - [`USER_STACK_TOP`]: The initial stack pointer of a newly created process.
//! - [`PHYSICAL_MEMORY_OFFSET`]: The offset at which all physical memory is mapped.
//!
//! The memory layout is summarised below:
//!
//! | Region              |           Start address |            Last address |
//! | ------------------- | ----------------------: | ----------------------: |
//! | [`NULL_PAGE`]       |                   `0x0` |             `0x1f_ffff` |
//! | [`USERSPACE`]       |             `0x20_0000` |      `0x7fff_ffff_ffff` |
//! | [`USER_STACK`]      |      `0x7fff_fffb_f000` |      `0x7fff_ffff_efff` |
//! | [`KERNELSPACE`]     | `0xffff_8000_0000_0000` | `0xffff_ffff_ffff_ffff` |
//! | [`PHYSICAL_MEMORY`] | `0xffff_8000_8000_0000` | `0xffff_ffff_ffff_ffff` |

use crate::{PhysAddr, VirtAddr, VirtAddrRange, PAGE_SIZE};

/// The lowest virtual memory, which is never mapped, so that null
/// pointer dereferences cause a page fault.
///
pub const NULL_PAGE: VirtAddrRange =
    VirtAddrRange::new(VirtAddr::zero(), VirtAddr::new(0x1f_ffff));

/// The portion of the lower half of virtual memory that is available
/// to userspace processes.
///
pub const USERSPACE: VirtAddrRange = VirtAddrRange::new(
    VirtAddr::new(0x20_0000),
    VirtAddr::new(0x7fff_ffff_ffff),
);

/// The base address at which position-independent binaries are
/// loaded.
///
/// The base is deterministic: address space randomisation is a
/// refinement this kernel does not perform.
///
pub const USER_IMAGE_BASE: VirtAddr = VirtAddr::new(0x40_0000);

/// The number of pages in a process's initial user stack.
///
pub const USER_STACK_PAGES: usize = 64;

/// The initial user stack pointer: the exclusive top of the user
/// stack, just below the non-canonical gap.
///
pub const USER_STACK_TOP: VirtAddr = VirtAddr::new(0x7fff_ffff_f000);

/// The pages of a process's initial user stack.
///
pub const USER_STACK: VirtAddrRange = VirtAddrRange::new(
    VirtAddr::new(0x7fff_ffff_f000 - USER_STACK_PAGES * PAGE_SIZE),
    VirtAddr::new(0x7fff_ffff_f000 - 1),
);

/// The upper half of virtual memory, which belongs to the kernel
/// and is shared between all address spaces.
///
pub const KERNELSPACE: VirtAddrRange = VirtAddrRange::new(
    VirtAddr::new(0xffff_8000_0000_0000),
    VirtAddr::new(0xffff_ffff_ffff_ffff),
);

/// The region of physical memory that the kernel's address space
/// identity-maps at initialisation: the first 4 GiB.
///
pub const KERNEL_IDENTITY_SIZE: usize = 4 * 1024 * 1024 * 1024;

/// The start of the identity-mapped physical region.
///
pub const KERNEL_IDENTITY_BASE: PhysAddr = PhysAddr::zero();

/// The region into which all physical memory is mapped.
///
pub const PHYSICAL_MEMORY: VirtAddrRange = VirtAddrRange::new(
    PHYSICAL_MEMORY_OFFSET,
    VirtAddr::new(0xffff_ffff_ffff_ffff),
);

/// The offset at which all physical memory is mapped.
///
/// For any valid physical address, that address can be reached at
/// the same numerical address plus `PHYSICAL_MEMORY_OFFSET`.
///
pub const PHYSICAL_MEMORY_OFFSET: VirtAddr = VirtAddr::new(0xffff_8000_8000_0000);
