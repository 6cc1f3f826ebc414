// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! switch contains the functionality to switch between threads.

use core::arch::global_asm;

global_asm!(include_str!("switch.s"));

// The following functions are implemented in switch.s.
//
extern "sysv64" {
    /// switch_stack replaces the current stack with a new
    /// stack, using the System V ABI. Its last action is
    /// to start executing the new thread.
    ///
    /// switch_stack takes a pointer to each thread's saved
    /// stack pointer.
    ///
    pub fn switch_stack(current_stack_pointer: *mut usize, new_stack_pointer: *const usize);

    /// start_thread is used to start a new thread: its
    /// address is placed on the thread's initial stack, so
    /// the first return out of [`switch_stack`] lands here.
    /// It enables interrupts, then pops the thread's entry
    /// point from the stack and jumps to it.
    ///
    /// The entry point must never return.
    ///
    pub fn start_thread() -> !;
}

/// The reserved bits of the RFLAGS register, included in a
/// new thread's initial stack. Bit 1 is always set.
///
const DEFAULT_RFLAGS: u64 = 0x2;

/// The number of values in a new thread's initial stack:
/// the flags, the six callee-saved registers, the
/// springboard address, and the entry point.
///
const INITIAL_STACK_VALUES: usize = 9;

/// Prepares a brand-new thread's stack so the first
/// [`switch_stack`] into it lands in [`start_thread`] and
/// then the thread's entry point.
///
/// `stack_top` is the exclusive top of the thread's kernel
/// stack. Returns the initial saved stack pointer.
///
/// # Safety
///
/// `stack_top` must point just past at least
/// [`INITIAL_STACK_VALUES`] writable `u64` slots.
///
pub unsafe fn populate_initial_stack(stack_top: *mut u64, entry_point: u64) -> usize {
    let values = [
        DEFAULT_RFLAGS, // popfq
        0,              // r15
        0,              // r14
        0,              // r13
        0,              // r12
        0,              // rbx
        0,              // rbp
        start_thread as *const u8 as u64,
        entry_point,
    ];

    let base = stack_top.sub(INITIAL_STACK_VALUES);
    for (index, value) in values.iter().enumerate() {
        base.add(index).write(*value);
    }

    base as usize
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;

    #[test]
    fn test_initial_stack_layout() {
        let mut stack = [0u64; 32];
        let top = unsafe { stack.as_mut_ptr().add(32) };

        let rsp = unsafe { populate_initial_stack(top, 0x40_0500) };
        assert_eq!(rsp, unsafe { top.sub(9) } as usize);

        // From the saved stack pointer upwards: the flags,
        // six zeroed registers, the springboard, and the
        // entry point.
        assert_eq!(stack[23], DEFAULT_RFLAGS);
        for slot in stack[24..30].iter() {
            assert_eq!(*slot, 0);
        }
        assert_eq!(stack[30], start_thread as *const u8 as u64);
        assert_eq!(stack[31], 0x40_0500);
    }
}
