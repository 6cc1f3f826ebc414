// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Classifies page faults.
//!
//! The kernel performs no demand paging, so every page fault
//! indicates a genuine error and is fatal. Faults are decoded
//! from the architecture's error code into a [`FaultClass`],
//! which names the failure in the panic message. Classification
//! is the extension point: a future pager would dispatch on the
//! class instead of panicking.

use bitflags::bitflags;
use core::fmt;
use memory::VirtAddr;

bitflags! {
    /// The page fault error code pushed by the CPU.
    ///
    pub struct PageFaultCode: u64 {
        /// When set, the fault was a protection violation
        /// on a present page. When unset, the page was not
        /// present.
        const PROTECTION_VIOLATION = 1 << 0;

        /// When set, the faulting access was a write.
        const CAUSED_BY_WRITE = 1 << 1;

        /// When set, the fault occurred in user mode.
        const USER_MODE = 1 << 2;

        /// When set, a reserved bit was set in a page
        /// table entry.
        const MALFORMED_TABLE = 1 << 3;

        /// When set, the faulting access was an
        /// instruction fetch.
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

/// The classification of a page fault.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FaultClass {
    /// A read from an unmapped page.
    NotPresentRead,

    /// A write to an unmapped page.
    NotPresentWrite,

    /// A read denied by the page's protection.
    ProtectionRead,

    /// A write denied by the page's protection, such as a
    /// write to a read-only page.
    ProtectionWrite,

    /// An instruction fetch from an unmapped or
    /// non-executable page.
    InstructionFetch,

    /// A page table entry has a reserved bit set. The
    /// page tables themselves are corrupt.
    MalformedPageTable,
}

impl fmt::Display for FaultClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            FaultClass::NotPresentRead => "read from unmapped page",
            FaultClass::NotPresentWrite => "write to unmapped page",
            FaultClass::ProtectionRead => "read protection violation",
            FaultClass::ProtectionWrite => "write protection violation",
            FaultClass::InstructionFetch => "instruction fetch fault",
            FaultClass::MalformedPageTable => "malformed page table",
        };

        f.write_str(name)
    }
}

/// Decodes a page fault error code into its classification.
///
pub fn classify(code: PageFaultCode) -> FaultClass {
    if code.contains(PageFaultCode::MALFORMED_TABLE) {
        return FaultClass::MalformedPageTable;
    }

    if code.contains(PageFaultCode::INSTRUCTION_FETCH) {
        return FaultClass::InstructionFetch;
    }

    let present = code.contains(PageFaultCode::PROTECTION_VIOLATION);
    let write = code.contains(PageFaultCode::CAUSED_BY_WRITE);
    match (present, write) {
        (false, false) => FaultClass::NotPresentRead,
        (false, true) => FaultClass::NotPresentWrite,
        (true, false) => FaultClass::ProtectionRead,
        (true, true) => FaultClass::ProtectionWrite,
    }
}

/// Handles a page fault at the given address.
///
/// With no demand paging, there is nothing to recover: the
/// fault is classified and the kernel panics with the
/// classification.
///
pub fn page_fault(addr: VirtAddr, code: PageFaultCode) -> ! {
    let class = classify(code);
    let mode = if code.contains(PageFaultCode::USER_MODE) {
        "user"
    } else {
        "kernel"
    };

    panic!("PAGE FAULT: {} at {} in {} mode", class, addr, mode);
}
