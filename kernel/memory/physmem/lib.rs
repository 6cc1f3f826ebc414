// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Physical memory management and allocation.
//!
//! The physical memory manager is handed one contiguous region of
//! physical memory at boot and tracks every 4 KiB frame in it with
//! a bitmap, one bit per frame. The leading frames of the region
//! are reserved for the bitmap's own storage; everything after
//! them starts out free.
//!
//! The allocator is an instance type. The kernel owns a single
//! instance behind a spinlock; tests construct as many independent
//! instances as they like, over regions that need not be backed by
//! real memory, because the allocator itself never dereferences
//! the frames it manages.
//!
//! [`BitmapFrameAllocator`] implements the
//! [`FrameAllocator`](memory::FrameAllocator) and
//! [`FrameDeallocator`](memory::FrameDeallocator) traits, so
//! address spaces and loaders can draw frames from it directly.

#![no_std]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

mod bitmap;

pub use crate::bitmap::{BitmapFrameAllocator, MemoryStats};
