// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

use crate::{InvalidPhysAddr, PhysAddr, PAGE_SIZE};
use core::fmt;

/// A 4 KiB frame of physical memory.
///
/// A frame is identified by its frame-aligned start address.
/// Frames are the unit in which the physical memory manager
/// allocates memory; a frame is either free or held by exactly
/// one owner.
///
#[derive(Clone, Copy, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct PhysFrame(PhysAddr);

impl PhysFrame {
    /// Returns the frame starting at the given address.
    ///
    /// If `addr` is not frame-aligned, `from_start_address`
    /// returns it as an [`InvalidPhysAddr`].
    ///
    pub fn from_start_address(addr: PhysAddr) -> Result<Self, InvalidPhysAddr> {
        if !addr.is_aligned(PAGE_SIZE) {
            Err(InvalidPhysAddr(addr.as_usize()))
        } else {
            Ok(PhysFrame(addr))
        }
    }

    /// Returns the frame containing the given address.
    ///
    pub fn containing_address(addr: PhysAddr) -> Self {
        PhysFrame(addr.align_down(PAGE_SIZE))
    }

    /// Returns the frame's start address.
    ///
    pub const fn start_address(self) -> PhysAddr {
        self.0
    }

    /// Returns the frame's size in bytes.
    ///
    pub const fn size(self) -> usize {
        PAGE_SIZE
    }

    /// Returns the range of frames `[start, end)`.
    ///
    pub const fn range_exclusive(start: PhysFrame, end: PhysFrame) -> PhysFrameRange {
        PhysFrameRange { start, end }
    }
}

impl fmt::Debug for PhysFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("PhysFrame")
            .field(&format_args!("{:#x}", self.0.as_usize()))
            .finish()
    }
}

/// A contiguous range of physical frames, exclusive of the
/// end frame.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PhysFrameRange {
    /// The first frame in the range.
    pub start: PhysFrame,
    /// The first frame after the range.
    pub end: PhysFrame,
}

impl PhysFrameRange {
    /// Returns the number of frames in the range.
    ///
    pub fn num_frames(&self) -> usize {
        (self.end.start_address().as_usize() - self.start.start_address().as_usize()) / PAGE_SIZE
    }

    /// Returns the range's start address.
    ///
    pub fn start_address(&self) -> PhysAddr {
        self.start.start_address()
    }
}

impl Iterator for PhysFrameRange {
    type Item = PhysFrame;

    fn next(&mut self) -> Option<Self::Item> {
        if self.start.start_address() < self.end.start_address() {
            let frame = self.start;
            self.start = PhysFrame(frame.start_address() + PAGE_SIZE);
            Some(frame)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use std::vec;
    use std::vec::Vec;

    #[test]
    fn test_phys_frame_alignment() {
        assert!(PhysFrame::from_start_address(PhysAddr::new(0x1000)).is_ok());
        assert_eq!(
            PhysFrame::from_start_address(PhysAddr::new(0x1001)),
            Err(InvalidPhysAddr(0x1001))
        );
        assert_eq!(
            PhysFrame::containing_address(PhysAddr::new(0x1fff)).start_address(),
            PhysAddr::new(0x1000)
        );
    }

    #[test]
    fn test_phys_frame_range() {
        let start = PhysFrame::from_start_address(PhysAddr::new(0x1000)).unwrap();
        let end = PhysFrame::from_start_address(PhysAddr::new(0x4000)).unwrap();
        let range = PhysFrame::range_exclusive(start, end);
        assert_eq!(range.num_frames(), 3);

        let frames: Vec<PhysFrame> = range.collect();
        assert_eq!(
            frames,
            vec![
                PhysFrame::from_start_address(PhysAddr::new(0x1000)).unwrap(),
                PhysFrame::from_start_address(PhysAddr::new(0x2000)).unwrap(),
                PhysFrame::from_start_address(PhysAddr::new(0x3000)).unwrap(),
            ]
        );
    }
}
