// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Provides pretty printing for quantities of bytes, using binary
//! units.
//!
//! # Examples
//!
//! ```
//! # use pretty::Bytes;
//! println!("{}", Bytes::from_usize(2)); // Prints "2 B"
//! println!("{}", Bytes::from_usize(4096)); // Prints "4 KiB"
//! ```

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::panic)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]
#![forbid(unsafe_code)]

#[cfg(test)]
extern crate alloc;

use core::fmt;

/// Contains a number of bytes.
///
/// The [`Display`](fmt::Display) implementation prints the
/// quantity in the largest binary unit that divides it without
/// losing precision below whole units.
///
pub struct Bytes(usize);

impl Bytes {
    /// Wraps a number of bytes.
    ///
    pub fn from_u64(n: u64) -> Self {
        Bytes(n as usize)
    }

    /// Wraps a number of bytes.
    ///
    pub fn from_usize(n: usize) -> Self {
        Bytes(n)
    }
}

impl fmt::Display for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

        let mut quantity = self.0;
        for unit in UNITS.iter() {
            if quantity >= 1024 {
                quantity >>= 10;
                continue;
            }

            return match f.width() {
                None => write!(f, "{} {}", quantity, unit),
                Some(width) => write!(
                    f,
                    "{:width$} {}",
                    quantity,
                    unit,
                    width = width.saturating_sub(1 + unit.len())
                ),
            };
        }

        write!(f, "{} EiB", quantity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;

    #[test]
    fn test_bytes() {
        assert_eq!(format!("{}", Bytes::from_usize(0)), "0 B");
        assert_eq!(format!("{}", Bytes::from_usize(513)), "513 B");
        assert_eq!(format!("{}", Bytes::from_usize(1023)), "1023 B");
        assert_eq!(format!("{}", Bytes::from_usize(1024)), "1 KiB");
        assert_eq!(format!("{}", Bytes::from_usize(512 * 1024)), "512 KiB");
        assert_eq!(format!("{}", Bytes::from_usize(1024 * 1024)), "1 MiB");
        assert_eq!(format!("{}", Bytes::from_u64(3 << 30)), "3 GiB");
        assert_eq!(format!("{:8}", Bytes::from_usize(4096)), "   4 KiB");
    }
}
