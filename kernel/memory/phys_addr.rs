// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

use align::{align_down_usize, align_up_usize};
use core::fmt;
use core::ops::{Add, AddAssign, Sub, SubAssign};

/// An address in the physical address space.
///
/// A `PhysAddr` can only store a valid physical address:
/// the top 12 bits are always zero, per the 52-bit
/// physical address space.
///
#[repr(transparent)]
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PhysAddr(usize);

/// An invalid physical memory address.
///
/// Returned when an attempt is made to create a [`PhysAddr`]
/// from a value with any of the top 12 bits set, carrying the
/// attempted value.
///
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct InvalidPhysAddr(pub usize);

impl PhysAddr {
    /// Creates a new physical memory address.
    ///
    /// # Panics
    ///
    /// `new` will panic if `addr` is not a valid physical
    /// address.
    ///
    #[inline]
    #[track_caller]
    pub const fn new(addr: usize) -> Self {
        match Self::try_new(addr) {
            Ok(addr) => addr,
            Err(_) => panic!("invalid address passed to PhysAddr::new"),
        }
    }

    /// Tries to create a new physical memory address,
    /// returning an error if any of the top 12 bits of
    /// `addr` are set.
    ///
    #[inline]
    pub const fn try_new(addr: usize) -> Result<Self, InvalidPhysAddr> {
        if addr & 0xfff0_0000_0000_0000_usize == 0 {
            Ok(PhysAddr(addr))
        } else {
            Err(InvalidPhysAddr(addr))
        }
    }

    /// Returns the zero physical memory address.
    ///
    #[inline]
    pub const fn zero() -> Self {
        PhysAddr(0)
    }

    /// Returns whether this is the zero address.
    ///
    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Returns the address's numerical value.
    ///
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns the address as a [`x86_64::PhysAddr`], for
    /// interoperation at the architecture boundary.
    ///
    #[inline]
    #[must_use]
    pub fn as_x86_64(self) -> x86_64::PhysAddr {
        x86_64::PhysAddr::new(self.0 as u64)
    }

    /// Aligns the address downwards to the largest exact
    /// multiple of `align` that is no larger than the
    /// address. `align` must be a power of two.
    ///
    #[inline]
    #[must_use]
    pub const fn align_down(self, align: usize) -> Self {
        // Rounding down cannot make a valid address
        // invalid, so the constructor checks can be
        // skipped.
        PhysAddr(align_down_usize(self.0, align))
    }

    /// Aligns the address upwards to the smallest exact
    /// multiple of `align` that is no smaller than the
    /// address. `align` must be a power of two.
    ///
    #[inline]
    #[must_use]
    pub const fn align_up(self, align: usize) -> Self {
        PhysAddr(align_up_usize(self.0, align))
    }

    /// Checks whether the address has the given alignment,
    /// which must be a power of two.
    ///
    #[inline]
    pub const fn is_aligned(self, align: usize) -> bool {
        self.align_down(align).0 == self.0
    }

    /// Checked integer addition. Computes `self + rhs`,
    /// returning `None` if overflow occurred or if the
    /// result is not a valid physical address.
    ///
    #[inline]
    pub const fn checked_add(self, rhs: usize) -> Option<Self> {
        if let Some(sum) = self.0.checked_add(rhs) {
            if let Ok(addr) = PhysAddr::try_new(sum) {
                Some(addr)
            } else {
                None
            }
        } else {
            None
        }
    }

    /// Checked integer subtraction. Computes `self - rhs`,
    /// returning `None` if the subtraction underflowed.
    ///
    #[inline]
    pub const fn checked_sub(self, rhs: usize) -> Option<Self> {
        if let Some(diff) = self.0.checked_sub(rhs) {
            Some(PhysAddr(diff))
        } else {
            None
        }
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("PhysAddr")
            .field(&format_args!("{:#x}", self.0))
            .finish()
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#012x}", self.0)
    }
}

impl fmt::LowerHex for PhysAddr {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::UpperHex for PhysAddr {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::UpperHex::fmt(&self.0, f)
    }
}

impl Add<usize> for PhysAddr {
    type Output = Self;

    #[inline]
    #[track_caller]
    fn add(self, rhs: usize) -> Self::Output {
        PhysAddr::new(self.0 + rhs)
    }
}

impl AddAssign<usize> for PhysAddr {
    #[inline]
    #[track_caller]
    fn add_assign(&mut self, rhs: usize) {
        *self = *self + rhs;
    }
}

impl Sub<usize> for PhysAddr {
    type Output = Self;

    #[inline]
    #[track_caller]
    fn sub(self, rhs: usize) -> Self::Output {
        PhysAddr::new(self.0 - rhs)
    }
}

impl SubAssign<usize> for PhysAddr {
    #[inline]
    #[track_caller]
    fn sub_assign(&mut self, rhs: usize) {
        self.0 -= rhs;
    }
}

impl Sub<PhysAddr> for PhysAddr {
    type Output = usize;

    #[inline]
    #[track_caller]
    fn sub(self, rhs: PhysAddr) -> Self::Output {
        self.0.checked_sub(rhs.0).unwrap()
    }
}
