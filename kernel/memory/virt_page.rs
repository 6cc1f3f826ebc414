// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

use crate::{InvalidVirtAddr, VirtAddr, PAGE_SIZE};
use core::fmt;

/// A 4 KiB page of virtual memory.
///
/// A page is identified by its page-aligned start address.
///
#[derive(Clone, Copy, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct VirtPage(VirtAddr);

impl VirtPage {
    /// Returns the page starting at the given address.
    ///
    /// If `addr` is not page-aligned, `from_start_address`
    /// returns it as an [`InvalidVirtAddr`].
    ///
    pub fn from_start_address(addr: VirtAddr) -> Result<Self, InvalidVirtAddr> {
        if !addr.is_aligned(PAGE_SIZE) {
            Err(InvalidVirtAddr(addr.as_usize()))
        } else {
            Ok(VirtPage(addr))
        }
    }

    /// Returns the page containing the given address.
    ///
    pub fn containing_address(addr: VirtAddr) -> Self {
        VirtPage(addr.align_down(PAGE_SIZE))
    }

    /// Returns the page's start address.
    ///
    pub const fn start_address(self) -> VirtAddr {
        self.0
    }

    /// Returns the page's size in bytes.
    ///
    pub const fn size(self) -> usize {
        PAGE_SIZE
    }

    /// Returns whether the page contains the given address.
    ///
    pub fn contains(self, addr: VirtAddr) -> bool {
        self.0 <= addr && addr.as_usize() < self.0.as_usize() + PAGE_SIZE
    }

    /// Returns the range of pages `[start, end)`.
    ///
    pub const fn range_exclusive(start: VirtPage, end: VirtPage) -> VirtPageRange {
        VirtPageRange { start, end }
    }

    /// Returns the range of pages `[start, end]`.
    ///
    /// # Panics
    ///
    /// `range_inclusive` will panic if `end` is the very
    /// last page of the address space.
    ///
    pub fn range_inclusive(start: VirtPage, end: VirtPage) -> VirtPageRange {
        VirtPageRange {
            start,
            end: VirtPage(end.0 + PAGE_SIZE),
        }
    }
}

impl fmt::Debug for VirtPage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("VirtPage")
            .field(&format_args!("{:#x}", self.0.as_usize()))
            .finish()
    }
}

/// A contiguous range of virtual pages, exclusive of the end
/// page.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VirtPageRange {
    /// The first page in the range.
    pub start: VirtPage,
    /// The first page after the range.
    pub end: VirtPage,
}

impl VirtPageRange {
    /// Returns the number of pages in the range.
    ///
    pub fn num_pages(&self) -> usize {
        (self.end.start_address().as_usize() - self.start.start_address().as_usize()) / PAGE_SIZE
    }
}

impl Iterator for VirtPageRange {
    type Item = VirtPage;

    fn next(&mut self) -> Option<Self::Item> {
        if self.start.start_address() < self.end.start_address() {
            let page = self.start;
            self.start = VirtPage(page.start_address() + PAGE_SIZE);
            Some(page)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virt_page_alignment() {
        assert!(VirtPage::from_start_address(VirtAddr::new(0x40_0000)).is_ok());
        assert_eq!(
            VirtPage::from_start_address(VirtAddr::new(0x40_0004)),
            Err(InvalidVirtAddr(0x40_0004))
        );

        let page = VirtPage::containing_address(VirtAddr::new(0x40_1234));
        assert_eq!(page.start_address(), VirtAddr::new(0x40_1000));
        assert!(page.contains(VirtAddr::new(0x40_1fff)));
        assert!(!page.contains(VirtAddr::new(0x40_2000)));
    }

    #[test]
    fn test_virt_page_range() {
        let start = VirtPage::containing_address(VirtAddr::new(0x40_0000));
        let end = VirtPage::containing_address(VirtAddr::new(0x40_2000));
        assert_eq!(VirtPage::range_exclusive(start, end).num_pages(), 2);
        assert_eq!(VirtPage::range_inclusive(start, end).num_pages(), 3);

        let mut range = VirtPage::range_exclusive(start, start);
        assert_eq!(range.next(), None);
    }
}
