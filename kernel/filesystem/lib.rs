// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Defines the virtual filesystem contract the kernel consumes.
//!
//! The kernel core touches files in exactly one place: `exec`
//! reads an executable into memory. Everything else about
//! filesystems lives outside the core, so this crate only fixes
//! the contract ([`FileSystem`] and [`File`]) plus [`MemFs`], a
//! flat in-memory implementation used by tests and early boot
//! images.
//!
//! Open files are shared through [`Arc`]: a process's file
//! descriptor table holds one reference per descriptor, `fork`
//! and `dup` add references, and the file closes when the last
//! reference is dropped.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]
#![forbid(unsafe_code)]

extern crate alloc;

mod memfs;

pub use crate::memfs::MemFs;

use align::align_up_usize;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use bitflags::bitflags;
use memory::PAGE_SIZE;
use syscalls::Error;

bitflags! {
    /// The access flags a file is opened with.
    ///
    pub struct OpenFlags: u32 {
        /// Open for reading.
        const READ = 1 << 0;

        /// Open for writing.
        const WRITE = 1 << 1;
    }
}

/// Metadata about an open file.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileStat {
    /// The file's size in bytes.
    pub size: usize,
}

/// An open file.
///
/// The file is closed when the last [`Arc`] reference to it is
/// dropped; implementations that need teardown implement `Drop`.
///
pub trait File: Send + Sync {
    /// Returns the file's metadata.
    ///
    fn stat(&self) -> FileStat;

    /// Reads up to `buf.len()` bytes starting at `offset`,
    /// returning the number of bytes read. Reads past the
    /// end of the file return 0.
    ///
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, Error>;
}

/// A filesystem the kernel can open files from.
///
pub trait FileSystem: Send + Sync {
    /// Opens the file at `path`.
    ///
    fn open(&self, path: &str, flags: OpenFlags) -> Result<Arc<dyn File>, Error>;
}

/// Reads the entire file at `path` into memory.
///
/// The backing buffer is allocated in whole pages, matching
/// how `exec` stages an executable before loading it.
///
pub fn read_file(fs: &dyn FileSystem, path: &str) -> Result<Vec<u8>, Error> {
    let file = fs.open(path, OpenFlags::READ)?;
    let size = file.stat().size;

    let mut buf = vec![0u8; align_up_usize(size, PAGE_SIZE)];
    let mut done = 0;
    while done < size {
        let n = file.read(done, &mut buf[done..size])?;
        if n == 0 {
            // The file shrank underneath us.
            return Err(Error::Invalid);
        }

        done += n;
    }

    buf.truncate(size);
    Ok(buf)
}
