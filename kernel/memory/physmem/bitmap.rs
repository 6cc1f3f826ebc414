// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Provides a bitmap frame allocator, which allocates and
//! deallocates physical memory frames from one contiguous region.

use bitmap_index::Bitmap;
use memory::{FrameAllocator, FrameDeallocator, PhysAddr, PhysFrame, PhysFrameRange, PAGE_SIZE};
use pretty::Bytes;
use serial::println;
use syscalls::Error;

/// A snapshot of physical memory usage, in frames.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemoryStats {
    /// The number of frames tracked by the allocator.
    pub total: usize,

    /// The number of frames currently allocated or reserved.
    pub used: usize,

    /// The number of frames available for allocation.
    pub free: usize,
}

/// A physical memory allocator over one contiguous region,
/// tracked using a bitmap.
///
/// One bit tracks each 4 KiB frame in the region; a set bit
/// means the frame is used. The frames that the bitmap itself
/// occupies are the region's leading frames and are reserved
/// at construction, so they are never handed out.
///
#[derive(Debug)]
pub struct BitmapFrameAllocator {
    // start_address is the address of the first frame
    // in the region. start_address is guaranteed to be
    // frame-aligned.
    start_address: PhysAddr,

    // num_frames is the number of 4 KiB frames tracked.
    num_frames: usize,

    // used_frames is the number of tracked frames that
    // are currently allocated or reserved.
    used_frames: usize,

    // bitmap records each frame's state. A set bit means
    // the frame is used.
    bitmap: Bitmap,
}

impl BitmapFrameAllocator {
    /// Creates an allocator over the physical memory region
    /// `[base, base + size)`.
    ///
    /// The region is aligned inwards to frame boundaries.
    /// The leading frames, which the bitmap itself occupies
    /// (one bit per frame, rounded up to whole frames), are
    /// reserved; the remaining frames are free.
    ///
    /// `new` fails with [`Error::Invalid`] if the aligned
    /// region is too small to hold the bitmap and at least
    /// one allocatable frame.
    ///
    pub fn new(base: PhysAddr, size: usize) -> Result<Self, Error> {
        let start = base.align_up(PAGE_SIZE);
        let end = match base.checked_add(size) {
            Some(end) => end.align_down(PAGE_SIZE),
            None => return Err(Error::Invalid),
        };

        if end.as_usize() <= start.as_usize() {
            return Err(Error::Invalid);
        }

        let num_frames = (end - start) / PAGE_SIZE;

        // The bitmap occupies the region's leading frames.
        let bitmap_bytes = (num_frames + 7) / 8;
        let bitmap_frames = (bitmap_bytes + PAGE_SIZE - 1) / PAGE_SIZE;
        if bitmap_frames >= num_frames {
            return Err(Error::Invalid);
        }

        let mut bitmap = Bitmap::new_unset(num_frames);
        for frame in 0..bitmap_frames {
            bitmap.set(frame);
        }

        Ok(BitmapFrameAllocator {
            start_address: start,
            num_frames,
            used_frames: bitmap_frames,
            bitmap,
        })
    }

    /// Returns the index of the given frame within the
    /// region, or `None` if the frame is not tracked.
    ///
    fn index_for(&self, frame: PhysFrame) -> Option<usize> {
        let addr = frame.start_address();
        if addr < self.start_address {
            return None;
        }

        let index = (addr - self.start_address) / PAGE_SIZE;
        if index < self.num_frames {
            Some(index)
        } else {
            None
        }
    }

    /// Returns the physical frame at the given index.
    ///
    fn frame_at(&self, index: usize) -> PhysFrame {
        PhysFrame::from_start_address(self.start_address + index * PAGE_SIZE)
            .expect("frame index within an aligned region")
    }

    /// Returns whether the given frame is currently
    /// allocated (or reserved). Frames outside the managed
    /// region are reported as not allocated.
    ///
    pub fn is_allocated(&self, frame: PhysFrame) -> bool {
        match self.index_for(frame) {
            Some(index) => self.bitmap.get(index),
            None => false,
        }
    }

    /// Returns a snapshot of current physical memory
    /// statistics, in frames.
    ///
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            total: self.num_frames,
            used: self.used_frames,
            free: self.num_frames - self.used_frames,
        }
    }

    /// Prints debug information about the allocator's state.
    ///
    pub fn debug(&self) {
        let stats = self.stats();
        println!(
            "Physical memory manager: {}/{} frames available.",
            stats.free, stats.total
        );
        println!(
            "{} used, {} free, {} total",
            Bytes::from_usize(stats.used * PAGE_SIZE),
            Bytes::from_usize(stats.free * PAGE_SIZE),
            Bytes::from_usize(stats.total * PAGE_SIZE)
        );
    }
}

unsafe impl FrameAllocator for BitmapFrameAllocator {
    /// Returns the lowest-addressed free frame, marking it
    /// used, or `None` if every frame is allocated.
    ///
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        let index = self.bitmap.next_unset()?;
        self.bitmap.set(index);
        self.used_frames += 1;

        Some(self.frame_at(index))
    }

    /// Returns `n` sequential free frames, marking them
    /// used, or `None`.
    ///
    /// The lowest-addressed run of `n` free frames is
    /// chosen. It's possible that `n` frames are free but
    /// `allocate_n_frames` still returns `None`: the frames
    /// must be contiguous for it to succeed.
    ///
    fn allocate_n_frames(&mut self, n: usize) -> Option<PhysFrameRange> {
        let index = self.bitmap.next_n_unset(n)?;
        for i in index..index + n {
            self.bitmap.set(i);
        }

        self.used_frames += n;
        let start = self.frame_at(index);
        let end = self.frame_at(index + n);
        Some(PhysFrame::range_exclusive(start, end))
    }
}

impl FrameDeallocator for BitmapFrameAllocator {
    /// Marks the given frame as unused, returning it to the
    /// pool of free frames.
    ///
    /// Frames outside the managed region are silently
    /// ignored, and freeing a frame that is already free is
    /// a no-op, so a double free can never push the used
    /// count below zero.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `frame` is unused.
    ///
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame) {
        let index = match self.index_for(frame) {
            Some(index) => index,
            None => return,
        };

        if !self.bitmap.get(index) {
            return;
        }

        self.bitmap.unset(index);
        self.used_frames -= 1;
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use std::vec::Vec;

    fn frame_for(addr: usize) -> PhysFrame {
        PhysFrame::from_start_address(PhysAddr::new(addr)).unwrap()
    }

    // 16 MiB at 1 MiB: 4096 frames, of which the bitmap
    // (512 bytes) reserves the first.
    //
    fn test_allocator() -> BitmapFrameAllocator {
        BitmapFrameAllocator::new(PhysAddr::new(0x10_0000), 16 * 1024 * 1024).unwrap()
    }

    #[test]
    fn test_region_setup() {
        let alloc = test_allocator();
        assert_eq!(
            alloc.stats(),
            MemoryStats {
                total: 4096,
                used: 1,
                free: 4095,
            }
        );

        // The bitmap's frame is reserved.
        assert!(alloc.is_allocated(frame_for(0x10_0000)));
        assert!(!alloc.is_allocated(frame_for(0x10_1000)));
    }

    #[test]
    fn test_first_allocation_address() {
        let mut alloc = test_allocator();

        // The first free frame follows the bitmap.
        assert_eq!(alloc.allocate_frame(), Some(frame_for(0x10_1000)));
        assert_eq!(alloc.allocate_frame(), Some(frame_for(0x10_2000)));
    }

    #[test]
    fn test_unaligned_region_is_trimmed() {
        // An unaligned region is aligned inwards.
        let alloc = BitmapFrameAllocator::new(PhysAddr::new(0x10_0800), 4 * PAGE_SIZE).unwrap();

        // [0x100800, 0x104800) trims to [0x101000, 0x104000):
        // 3 frames, 1 reserved for the bitmap.
        assert_eq!(
            alloc.stats(),
            MemoryStats {
                total: 3,
                used: 1,
                free: 2,
            }
        );
    }

    #[test]
    fn test_too_small_region() {
        assert_eq!(
            BitmapFrameAllocator::new(PhysAddr::new(0x10_0000), PAGE_SIZE).unwrap_err(),
            Error::Invalid
        );
        assert_eq!(
            BitmapFrameAllocator::new(PhysAddr::new(0x10_0000), 100).unwrap_err(),
            Error::Invalid
        );
    }

    #[test]
    fn test_conservation() {
        let mut alloc = test_allocator();

        // total = used + free holds through any sequence of
        // allocations and frees.
        let mut frames = Vec::new();
        for _ in 0..64 {
            frames.push(alloc.allocate_frame().unwrap());
            let stats = alloc.stats();
            assert_eq!(stats.total, stats.used + stats.free);
        }

        for frame in frames.drain(..) {
            unsafe { alloc.deallocate_frame(frame) };
            let stats = alloc.stats();
            assert_eq!(stats.total, stats.used + stats.free);
        }

        assert_eq!(alloc.stats().used, 1);
    }

    #[test]
    fn test_double_free_is_tolerated() {
        let mut alloc = test_allocator();
        let frame = alloc.allocate_frame().unwrap();
        let used_before = alloc.stats().used;

        unsafe { alloc.deallocate_frame(frame) };
        assert_eq!(alloc.stats().used, used_before - 1);

        // A second free of the same frame is a no-op.
        unsafe { alloc.deallocate_frame(frame) };
        assert_eq!(alloc.stats().used, used_before - 1);
    }

    #[test]
    fn test_foreign_frames_are_ignored() {
        let mut alloc = test_allocator();
        let used_before = alloc.stats().used;

        // Below and above the managed region.
        unsafe { alloc.deallocate_frame(frame_for(0x1000)) };
        unsafe { alloc.deallocate_frame(frame_for(0x7fff_0000)) };
        assert_eq!(alloc.stats().used, used_before);
    }

    #[test]
    fn test_contiguous_allocation() {
        let mut alloc = test_allocator();

        // Carve up some frames, then free two separated
        // singles and a longer run.
        let first = alloc.allocate_n_frames(8).unwrap();
        let frames: Vec<PhysFrame> = first.collect();
        unsafe {
            alloc.deallocate_frame(frames[1]);
            alloc.deallocate_frame(frames[3]);
            alloc.deallocate_frame(frames[5]);
            alloc.deallocate_frame(frames[6]);
        }

        // A run of two exists at frames[5], but none of
        // three within the freed singles; the next run of
        // three is fresh memory after the first eight.
        let pair = alloc.allocate_n_frames(2).unwrap();
        assert_eq!(pair.start, frames[5]);

        let triple = alloc.allocate_n_frames(3).unwrap();
        assert_eq!(triple.start_address(), frames[7].start_address() + PAGE_SIZE);

        // Immediately before the run was allocated, all its
        // bits were clear; immediately after, all are set.
        for frame in triple {
            assert!(alloc.is_allocated(frame));
        }
    }

    #[test]
    fn test_exhaustion() {
        let mut alloc = BitmapFrameAllocator::new(PhysAddr::new(0x10_0000), 4 * PAGE_SIZE).unwrap();

        // 4 frames, 1 reserved: 3 allocations succeed.
        assert!(alloc.allocate_frame().is_some());
        assert!(alloc.allocate_frame().is_some());
        assert!(alloc.allocate_frame().is_some());
        assert_eq!(alloc.allocate_frame(), None);
        assert_eq!(alloc.stats().free, 0);

        // Contiguous requests larger than the region fail
        // without changing the accounting.
        assert!(alloc.allocate_n_frames(2).is_none());
        assert_eq!(alloc.stats().free, 0);
    }
}
