// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

use alloc::sync::Arc;
use alloc::vec::Vec;
use filesystem::{File, OpenFlags};
use syscalls::Error;

/// The maximum number of open file descriptors per process.
///
pub const MAX_FILE_DESCRIPTORS: usize = 1024;

/// One open file descriptor: the file it refers to and the
/// flags it was opened with.
///
/// The file itself is shared: `fork` and `dup` hand out
/// further references, and the file closes when the last
/// reference anywhere is dropped.
///
#[derive(Clone)]
pub struct FdEntry {
    /// The open file.
    pub file: Arc<dyn File>,

    /// The flags the descriptor was opened with.
    pub flags: OpenFlags,
}

/// A process's file descriptor table.
///
pub struct FdTable {
    entries: Vec<Option<FdEntry>>,
}

impl FdTable {
    /// Returns an empty descriptor table.
    ///
    pub fn new() -> Self {
        FdTable {
            entries: Vec::new(),
        }
    }

    /// Allocates the lowest free descriptor for the given
    /// file.
    ///
    /// Fails with [`Error::Busy`] when the table is full.
    ///
    pub fn alloc(&mut self, file: Arc<dyn File>, flags: OpenFlags) -> Result<usize, Error> {
        let entry = FdEntry { file, flags };
        for (fd, slot) in self.entries.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(entry);
                return Ok(fd);
            }
        }

        if self.entries.len() >= MAX_FILE_DESCRIPTORS {
            return Err(Error::Busy);
        }

        self.entries.push(Some(entry));
        Ok(self.entries.len() - 1)
    }

    /// Returns the entry for the given descriptor.
    ///
    pub fn get(&self, fd: usize) -> Option<&FdEntry> {
        self.entries.get(fd).and_then(|slot| slot.as_ref())
    }

    /// Closes the given descriptor. The underlying file
    /// closes when its last reference is dropped.
    ///
    pub fn free(&mut self, fd: usize) -> Result<(), Error> {
        match self.entries.get_mut(fd) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                Ok(())
            }
            _ => Err(Error::Invalid),
        }
    }

    /// Duplicates descriptor `old` onto descriptor `new`,
    /// closing `new` first if it is open. Afterwards both
    /// descriptors refer to the same file.
    ///
    pub fn dup(&mut self, old: usize, new: usize) -> Result<(), Error> {
        if new >= MAX_FILE_DESCRIPTORS || old == new {
            return Err(Error::Invalid);
        }

        let entry = self.get(old).cloned().ok_or(Error::Invalid)?;
        if self.entries.len() <= new {
            self.entries.resize_with(new + 1, || None);
        }

        self.entries[new] = Some(entry);
        Ok(())
    }

    /// Returns a copy of the table, sharing every open
    /// file. Used by `fork`.
    ///
    pub fn clone_table(&self) -> FdTable {
        FdTable {
            entries: self.entries.clone(),
        }
    }

    /// Closes every open descriptor.
    ///
    pub fn close_all(&mut self) {
        self.entries.clear();
    }

    /// Returns the number of open descriptors.
    ///
    pub fn open_count(&self) -> usize {
        self.entries.iter().filter(|slot| slot.is_some()).count()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}
