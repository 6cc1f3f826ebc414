// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

use crate::{File, FileStat, FileSystem, OpenFlags};
use alloc::collections::btree_map::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use syscalls::Error;

/// A flat in-memory filesystem: a map from absolute paths to
/// file contents.
///
/// `MemFs` backs `exec` in tests and can serve a boot image's
/// bundled binaries before a real filesystem is available. It
/// is read-only once populated.
///
pub struct MemFs {
    files: BTreeMap<String, Arc<MemFile>>,
}

struct MemFile {
    data: Vec<u8>,
}

impl MemFs {
    /// Returns an empty filesystem.
    ///
    pub fn new() -> Self {
        MemFs {
            files: BTreeMap::new(),
        }
    }

    /// Adds a file at the given path, replacing any previous
    /// contents.
    ///
    pub fn insert(&mut self, path: &str, data: Vec<u8>) {
        self.files
            .insert(String::from(path), Arc::new(MemFile { data }));
    }
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for MemFs {
    fn open(&self, path: &str, _flags: OpenFlags) -> Result<Arc<dyn File>, Error> {
        match self.files.get(path) {
            Some(file) => Ok(file.clone() as Arc<dyn File>),
            None => Err(Error::NotFound),
        }
    }
}

impl File for MemFile {
    fn stat(&self) -> FileStat {
        FileStat {
            size: self.data.len(),
        }
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, Error> {
        if offset >= self.data.len() {
            return Ok(0);
        }

        let n = buf.len().min(self.data.len() - offset);
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);

        Ok(n)
    }
}
