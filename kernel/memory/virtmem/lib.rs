// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Virtual memory management: address spaces, mapping, translation,
//! and cloning.
//!
//! An [`AddressSpace`] is the root of a 4-level page table
//! hierarchy, together with the list of semantic [`Region`]s mapped
//! into it and usage counters. The kernel's own address space is
//! built once at boot by [`AddressSpace::new_kernel`], which
//! identity-maps the first 4 GiB of physical memory and maps all
//! physical memory into the upper half. Every user address space
//! shares the kernel's upper half: creation copies the kernel's
//! upper-half level 4 entries, so kernel mappings are visible (and
//! identical) everywhere.
//!
//! The address space owns the frames mapped into its user half,
//! except for frames within a region marked
//! [`RegionKind::Shared`]. Destruction walks the user half only,
//! returning every owned leaf frame and intermediate page table to
//! the frame allocator. Cloning performs an eager deep copy of the
//! user half: fresh intermediate tables, a fresh frame per mapped
//! page with its full 4 KiB of contents, and the source's flag
//! bits; shared regions are re-referenced rather than copied.
//!
//! Page faults are classified by [`fault`]; with no demand paging,
//! every fault is fatal and panics with its classification.

#![no_std]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

extern crate alloc;

mod address_space;
mod fault;
mod region;

pub use crate::address_space::{AddressSpace, AddressSpaceStats};
pub use crate::fault::{classify, page_fault, FaultClass, PageFaultCode};
pub use crate::region::{Region, RegionKind};
