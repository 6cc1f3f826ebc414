// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Provides the kernel's console byte sink and the `print` and
//! `println` macros.
//!
//! The kernel's logging and panic output is a stream of bytes
//! written to the first serial port, [`COM1`]. Format strings are
//! evaluated with `core::fmt` directly into the port, so logging
//! never allocates.
//!
//! Each of the four serial devices is provided ([`COM1`] through
//! [`COM4`]), guarded by a spinlock. The macros disable interrupts
//! for the duration of a write so an interrupt handler logging on
//! the same CPU cannot deadlock against a half-finished line.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![allow(unsafe_code)]
#![deny(unused_crate_dependencies)]

use core::fmt::Write;
use spin::{lock, Mutex};
use uart_16550::SerialPort;
use x86_64::instructions::interrupts::without_interrupts;

/// The first serial port device, which receives the kernel's
/// log and panic output.
///
pub static COM1: Mutex<SerialPort> = unsafe { Mutex::new(SerialPort::new(0x3f8)) };

/// The second serial port device.
///
pub static COM2: Mutex<SerialPort> = unsafe { Mutex::new(SerialPort::new(0x2f8)) };

/// The third serial port device.
///
pub static COM3: Mutex<SerialPort> = unsafe { Mutex::new(SerialPort::new(0x3e8)) };

/// The fourth serial port device.
///
pub static COM4: Mutex<SerialPort> = unsafe { Mutex::new(SerialPort::new(0x2e8)) };

/// Write a string to the console.
///
pub fn write_str(s: &str) -> core::fmt::Result {
    without_interrupts(|| lock!(COM1).write_str(s))
}

/// Write raw bytes to the console.
///
pub fn write_bytes(bytes: &[u8]) {
    without_interrupts(|| {
        let mut port = lock!(COM1);
        for &b in bytes {
            port.send(b);
        }
    });
}

/// _print writes formatted text to the console, holding
/// the port lock with interrupts disabled.
///
#[doc(hidden)]
pub fn _print(args: ::core::fmt::Arguments) {
    without_interrupts(|| {
        lock!(COM1)
            .write_fmt(args)
            .expect("Printing to COM1 failed");
    });
}

/// Print to the console.
///
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::_print(format_args!($($arg)*)));
}

/// Print to the console, with a trailing newline.
///
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}
