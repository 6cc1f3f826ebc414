// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

use align::{align_down_usize, align_up_usize};
use core::fmt;
use core::ops::{Add, AddAssign, Sub, SubAssign};

/// A canonical address in the 48-bit virtual address space.
///
/// Bits 48 through 63 of a canonical address are copies of
/// bit 47, so the address space consists of a lower half and
/// an upper half with a non-canonical gap between them. A
/// `VirtAddr` can only store a canonical address.
///
#[repr(transparent)]
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct VirtAddr(usize);

/// A non-canonical virtual memory address.
///
/// Returned when an attempt is made to create a [`VirtAddr`]
/// from a non-canonical value, carrying the attempted value.
///
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct InvalidVirtAddr(pub usize);

impl VirtAddr {
    /// Creates a new virtual memory address.
    ///
    /// # Panics
    ///
    /// `new` will panic if `addr` is not canonical.
    ///
    #[inline]
    #[track_caller]
    pub const fn new(addr: usize) -> Self {
        match Self::try_new(addr) {
            Ok(addr) => addr,
            Err(_) => panic!("non-canonical address passed to VirtAddr::new"),
        }
    }

    /// Tries to create a new virtual memory address,
    /// returning an error if `addr` is not canonical.
    ///
    #[inline]
    pub const fn try_new(addr: usize) -> Result<Self, InvalidVirtAddr> {
        // Bits 48..64 must all equal bit 47.
        let top = addr >> 47;
        if top == 0 || top == 0x1_ffff {
            Ok(VirtAddr(addr))
        } else {
            Err(InvalidVirtAddr(addr))
        }
    }

    /// Returns the zero virtual memory address.
    ///
    #[inline]
    pub const fn zero() -> Self {
        VirtAddr(0)
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

    /// Returns the address as a mutable pointer to `T`.
    ///
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Returns the address as a [`x86_64::VirtAddr`], for
    /// interoperation at the architecture boundary.
    ///
    #[inline]
    #[must_use]
    pub fn as_x86_64(self) -> x86_64::VirtAddr {
        x86_64::VirtAddr::new(self.0 as u64)
    }

    /// Returns the offset of the address within its 4 KiB
    /// page.
    ///
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & 0xfff
    }

    /// Aligns the address downwards to the largest exact
    /// multiple of `align` that is no larger than the
    /// address. `align` must be a power of two.
    ///
    #[inline]
    #[must_use]
    pub const fn align_down(self, align: usize) -> Self {
        // Rounding down cannot make a canonical address
        // non-canonical.
        VirtAddr(align_down_usize(self.0, align))
    }

    /// Aligns the address upwards to the smallest exact
    /// multiple of `align` that is no smaller than the
    /// address. `align` must be a power of two.
    ///
    /// # Panics
    ///
    /// `align_up` will panic if the rounded address enters
    /// the non-canonical gap.
    ///
    #[inline]
    #[must_use]
    pub const fn align_up(self, align: usize) -> Self {
        VirtAddr::new(align_up_usize(self.0, align))
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
    /// result is not canonical.
    ///
    #[inline]
    pub const fn checked_add(self, rhs: usize) -> Option<Self> {
        if let Some(sum) = self.0.checked_add(rhs) {
            if let Ok(addr) = VirtAddr::try_new(sum) {
                Some(addr)
            } else {
                None
            }
        } else {
            None
        }
    }

    /// Checked integer subtraction. Computes `self - rhs`,
    /// returning `None` if the subtraction underflowed or
    /// if the result is not canonical.
    ///
    #[inline]
    pub const fn checked_sub(self, rhs: usize) -> Option<Self> {
        if let Some(diff) = self.0.checked_sub(rhs) {
            if let Ok(addr) = VirtAddr::try_new(diff) {
                Some(addr)
            } else {
                None
            }
        } else {
            None
        }
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("VirtAddr")
            .field(&format_args!("{:#x}", self.0))
            .finish()
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl fmt::LowerHex for VirtAddr {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::UpperHex for VirtAddr {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::UpperHex::fmt(&self.0, f)
    }
}

impl Add<usize> for VirtAddr {
    type Output = Self;

    #[inline]
    #[track_caller]
    fn add(self, rhs: usize) -> Self::Output {
        VirtAddr::new(self.0 + rhs)
    }
}

impl AddAssign<usize> for VirtAddr {
    #[inline]
    #[track_caller]
    fn add_assign(&mut self, rhs: usize) {
        *self = *self + rhs;
    }
}

impl Sub<usize> for VirtAddr {
    type Output = Self;

    #[inline]
    #[track_caller]
    fn sub(self, rhs: usize) -> Self::Output {
        VirtAddr::new(self.0 - rhs)
    }
}

impl SubAssign<usize> for VirtAddr {
    #[inline]
    #[track_caller]
    fn sub_assign(&mut self, rhs: usize) {
        *self = *self - rhs;
    }
}

impl Sub<VirtAddr> for VirtAddr {
    type Output = usize;

    #[inline]
    #[track_caller]
    fn sub(self, rhs: VirtAddr) -> Self::Output {
        self.0.checked_sub(rhs.0).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virt_addr_canonical() {
        // Valid lower-half addresses.
        assert!(VirtAddr::try_new(0).is_ok());
        assert!(VirtAddr::try_new(0x7fff_ffff_ffff).is_ok());

        // Valid upper-half addresses.
        assert!(VirtAddr::try_new(0xffff_8000_0000_0000).is_ok());
        assert!(VirtAddr::try_new(0xffff_ffff_ffff_ffff).is_ok());

        // Non-canonical addresses.
        assert_eq!(
            VirtAddr::try_new(0x8000_0000_0000),
            Err(InvalidVirtAddr(0x8000_0000_0000))
        );
        assert_eq!(
            VirtAddr::try_new(0xfff7_8000_0000_0000),
            Err(InvalidVirtAddr(0xfff7_8000_0000_0000))
        );
    }

    #[test]
    fn test_virt_addr_page_offset() {
        assert_eq!(VirtAddr::new(0x40_1234).page_offset(), 0x234);
        assert_eq!(VirtAddr::new(0x40_1000).page_offset(), 0);
    }
}
