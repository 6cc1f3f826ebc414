// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

use core::fmt;
use memory::{PageTableFlags, VirtAddr, VirtAddrRange};

/// The semantic purpose of a region of an address space.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegionKind {
    /// Executable program text.
    Code,

    /// Program data, including read-only data and BSS.
    Data,

    /// The process heap, managed by `brk`.
    Heap,

    /// A thread stack.
    Stack,

    /// A memory-mapped allocation.
    Mmap,

    /// Device memory. The frames behind a device region
    /// are never owned by the address space.
    Device,

    /// Memory shared with another address space. Shared
    /// frames are not owned: destruction does not free
    /// them and cloning re-references them.
    Shared,
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            RegionKind::Code => "code",
            RegionKind::Data => "data",
            RegionKind::Heap => "heap",
            RegionKind::Stack => "stack",
            RegionKind::Mmap => "mmap",
            RegionKind::Device => "device",
            RegionKind::Shared => "shared",
        };

        f.write_str(name)
    }
}

/// A semantic region of an address space.
///
/// Regions record what each part of the address space is for,
/// which protection it carries, and whether its frames are
/// owned. They never overlap within one address space and are
/// used for bookkeeping and fault attribution.
///
#[derive(Clone)]
pub struct Region {
    range: VirtAddrRange,
    kind: RegionKind,
    flags: PageTableFlags,
}

impl Region {
    /// Returns a new region covering the given address
    /// range.
    ///
    pub fn new(range: VirtAddrRange, kind: RegionKind, flags: PageTableFlags) -> Self {
        Region { range, kind, flags }
    }

    /// Returns the range of addresses the region covers.
    ///
    pub fn range(&self) -> &VirtAddrRange {
        &self.range
    }

    /// Returns the region's semantic kind.
    ///
    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    /// Returns the protection flags the region was created
    /// with.
    ///
    pub fn flags(&self) -> PageTableFlags {
        self.flags
    }

    /// Returns whether the region contains the given
    /// address.
    ///
    pub fn contains(&self, addr: VirtAddr) -> bool {
        self.range.contains_addr(addr)
    }

    /// Returns whether the frames behind this region are
    /// owned by the address space that maps them.
    ///
    pub fn owns_frames(&self) -> bool {
        !matches!(self.kind, RegionKind::Shared | RegionKind::Device)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:#x}-{:#x} {}",
            self.range.start().as_usize(),
            self.range.end().as_usize(),
            self.kind
        )
    }
}
