// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the capability system: unforgeable tokens granting
//! specific operations on specific kernel objects.
//!
//! A [`Capability`] pairs a kernel object (named by its
//! [`ObjectKind`] and object id) with a set of [`Permissions`].
//! Capabilities live in a [`CapabilitySpace`], which tracks which
//! processes hold each capability. Every kernel operation that
//! touches a resource belonging to another process checks for a
//! held capability of the expected kind with the required
//! permission bit; operations without one fail with
//! [`Denied`](syscalls::Error::Denied).
//!
//! Capabilities can be passed on with [`grant`](CapabilitySpace::grant)
//! (itself gated on the `GRANT` permission), withdrawn with
//! [`revoke`](CapabilitySpace::revoke), and narrowed with
//! [`derive`](CapabilitySpace::derive), which can only ever shed
//! permissions, never add them.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]
#![forbid(unsafe_code)]

extern crate alloc;

use alloc::collections::btree_map::BTreeMap;
use alloc::vec::Vec;
use bitflags::bitflags;
use syscalls::{CapabilityId, Error, ProcessId};

bitflags! {
    /// The permission bits a capability can carry.
    ///
    pub struct Permissions: u32 {
        /// The holder can read from the object.
        const READ = 1 << 0;

        /// The holder can write to the object.
        const WRITE = 1 << 1;

        /// The holder can execute the object.
        const EXECUTE = 1 << 2;

        /// The holder can grant the capability to another
        /// process.
        const GRANT = 1 << 3;

        /// The holder can revoke the capability from
        /// another process.
        const REVOKE = 1 << 4;
    }
}

/// The kind of kernel object a capability refers to.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ObjectKind {
    /// A region of physical memory.
    Memory,

    /// An IPC endpoint.
    IpcEndpoint,

    /// A thread.
    Thread,

    /// A process.
    Process,

    /// A hardware interrupt line.
    Irq,

    /// An I/O port range.
    IoPort,

    /// A device.
    Device,
}

/// An unforgeable token granting operations on one kernel
/// object.
///
#[derive(Clone, Debug)]
pub struct Capability {
    /// The capability's unique id.
    pub id: CapabilityId,

    /// The kind of object the capability refers to.
    pub kind: ObjectKind,

    /// The object's id within its subsystem, such as an
    /// endpoint id or a process id.
    pub object_id: u64,

    /// The operations the capability permits.
    pub permissions: Permissions,

    /// Opaque metadata attached at creation.
    pub metadata: u64,
}

// One capability plus the set of processes holding it.
//
struct CapabilityEntry {
    capability: Capability,
    holders: Vec<ProcessId>,
}

/// The registry of live capabilities and their holders.
///
pub struct CapabilitySpace {
    entries: BTreeMap<CapabilityId, CapabilityEntry>,
    next_id: u64,
}

impl CapabilitySpace {
    /// Returns an empty capability space.
    ///
    pub fn new() -> Self {
        CapabilitySpace {
            entries: BTreeMap::new(),
            next_id: 1,
        }
    }

    fn next_id(&mut self) -> CapabilityId {
        let id = CapabilityId::new(self.next_id);
        self.next_id += 1;

        id
    }

    /// Creates a new capability held by `owner`.
    ///
    pub fn create(
        &mut self,
        owner: ProcessId,
        kind: ObjectKind,
        object_id: u64,
        permissions: Permissions,
        metadata: u64,
    ) -> CapabilityId {
        let id = self.next_id();
        let capability = Capability {
            id,
            kind,
            object_id,
            permissions,
            metadata,
        };

        let mut holders = Vec::new();
        holders.push(owner);
        self.entries.insert(
            id,
            CapabilityEntry {
                capability,
                holders,
            },
        );

        id
    }

    /// Destroys a capability, revoking it from every holder
    /// at once.
    ///
    pub fn destroy(&mut self, id: CapabilityId) -> Result<(), Error> {
        self.entries.remove(&id).map(|_| ()).ok_or(Error::NotFound)
    }

    /// Returns the capability with the given id.
    ///
    pub fn get(&self, id: CapabilityId) -> Option<&Capability> {
        self.entries.get(&id).map(|entry| &entry.capability)
    }

    /// Returns whether `process` holds the capability with
    /// the given id.
    ///
    pub fn holds(&self, process: ProcessId, id: CapabilityId) -> bool {
        match self.entries.get(&id) {
            Some(entry) => entry.holders.contains(&process),
            None => false,
        }
    }

    /// Installs a reference to the capability in `target`.
    ///
    /// The granter must hold the capability, and the
    /// capability must carry the `GRANT` permission.
    ///
    pub fn grant(
        &mut self,
        granter: ProcessId,
        target: ProcessId,
        id: CapabilityId,
    ) -> Result<(), Error> {
        let entry = self.entries.get_mut(&id).ok_or(Error::NotFound)?;
        if !entry.holders.contains(&granter) {
            return Err(Error::Denied);
        }
        if !entry.capability.permissions.contains(Permissions::GRANT) {
            return Err(Error::Denied);
        }

        if !entry.holders.contains(&target) {
            entry.holders.push(target);
        }

        Ok(())
    }

    /// Withdraws the capability from `target`.
    ///
    /// The revoker must hold the capability, and the
    /// capability must carry the `REVOKE` permission.
    ///
    pub fn revoke(
        &mut self,
        revoker: ProcessId,
        target: ProcessId,
        id: CapabilityId,
    ) -> Result<(), Error> {
        let entry = self.entries.get_mut(&id).ok_or(Error::NotFound)?;
        if !entry.holders.contains(&revoker) {
            return Err(Error::Denied);
        }
        if !entry.capability.permissions.contains(Permissions::REVOKE) {
            return Err(Error::Denied);
        }

        entry.holders.retain(|holder| *holder != target);
        if entry.holders.is_empty() {
            // A capability nobody holds can never be used
            // or granted again.
            self.entries.remove(&id);
        }

        Ok(())
    }

    /// Creates a new capability for the same object with a
    /// subset of the parent's permissions, held by `holder`.
    ///
    /// Fails with [`Error::Denied`] if `new_permissions` is
    /// not a subset of the parent's permissions, or if
    /// `holder` does not hold the parent.
    ///
    pub fn derive(
        &mut self,
        holder: ProcessId,
        parent: CapabilityId,
        new_permissions: Permissions,
    ) -> Result<CapabilityId, Error> {
        let entry = self.entries.get(&parent).ok_or(Error::NotFound)?;
        if !entry.holders.contains(&holder) {
            return Err(Error::Denied);
        }
        if !entry.capability.permissions.contains(new_permissions) {
            return Err(Error::Denied);
        }

        let kind = entry.capability.kind;
        let object_id = entry.capability.object_id;
        let metadata = entry.capability.metadata;

        Ok(self.create(holder, kind, object_id, new_permissions, metadata))
    }

    /// Checks that `process` holds a capability of the given
    /// kind for the given object, carrying `permission`.
    ///
    pub fn check(
        &self,
        process: ProcessId,
        kind: ObjectKind,
        object_id: u64,
        permission: Permissions,
    ) -> Result<(), Error> {
        let permitted = self.entries.values().any(|entry| {
            entry.capability.kind == kind
                && entry.capability.object_id == object_id
                && entry.capability.permissions.contains(permission)
                && entry.holders.contains(&process)
        });

        if permitted {
            Ok(())
        } else {
            Err(Error::Denied)
        }
    }

    /// Destroys every capability referring to the given
    /// object, for when the object itself is destroyed.
    ///
    pub fn destroy_for_object(&mut self, kind: ObjectKind, object_id: u64) {
        let doomed: Vec<CapabilityId> = self
            .entries
            .values()
            .filter(|entry| {
                entry.capability.kind == kind && entry.capability.object_id == object_id
            })
            .map(|entry| entry.capability.id)
            .collect();

        for id in doomed {
            self.entries.remove(&id);
        }
    }

    /// Releases every capability held by `process`, for use
    /// when the process exits. Capabilities left with no
    /// holder are destroyed.
    ///
    pub fn release_holder(&mut self, process: ProcessId) {
        let mut orphaned = Vec::new();
        for (id, entry) in self.entries.iter_mut() {
            entry.holders.retain(|holder| *holder != process);
            if entry.holders.is_empty() {
                orphaned.push(*id);
            }
        }

        for id in orphaned {
            self.entries.remove(&id);
        }
    }

    /// Returns the number of live capabilities.
    ///
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether no capabilities are live.
    ///
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for CapabilitySpace {
    fn default() -> Self {
        Self::new()
    }
}
