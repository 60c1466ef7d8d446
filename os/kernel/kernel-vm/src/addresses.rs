//! # User Address Types
//!
//! Typed wrappers for user virtual addresses, user pages and physical frame
//! numbers of the user pool, so page bases, in-page addresses and frames
//! cannot be mixed up.
//!
//! All user pages are 4 KiB; the pool never hands out huge pages to user
//! processes.

use core::fmt;
use core::ops::Add;

/// log2 of the user page size.
pub const PAGE_SHIFT: u32 = 12;

/// User page (and frame) size in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

const PAGE_MASK: u64 = (PAGE_SIZE as u64) - 1;

/// The contents of one physical frame.
pub type Page = [u8; PAGE_SIZE];

/// A user virtual address.
///
/// No validation happens on construction; whether the address actually lies
/// in user space is decided against a [`VmConfig`](crate::VmConfig).
///
/// ### Examples
/// ```rust
/// # use kernel_vm::*;
/// let va = UserAddress::new(0x0804_8123);
/// assert_eq!(va.page().base().as_u64(), 0x0804_8000);
/// assert_eq!(va.offset(), 0x123);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct UserAddress(u64);

impl UserAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Page that contains this address (aligns down).
    #[inline]
    #[must_use]
    pub const fn page(self) -> UserPage {
        UserPage(self.0 & !PAGE_MASK)
    }

    /// Offset of this address inside its page.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn offset(self) -> usize {
        (self.0 & PAGE_MASK) as usize
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, bytes: u64) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn checked_sub(self, bytes: u64) -> Option<Self> {
        match self.0.checked_sub(bytes) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for UserAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UA(0x{:08X})", self.0)
    }
}

impl fmt::Display for UserAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

impl From<u64> for UserAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl From<UserPage> for UserAddress {
    #[inline]
    fn from(page: UserPage) -> Self {
        page.base()
    }
}

impl Add<u64> for UserAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

/// Page-aligned base of a user page.
///
/// The low [`PAGE_SHIFT`] bits are always zero; the only ways to obtain a
/// `UserPage` are rounding an address down or a checked conversion from an
/// aligned address.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct UserPage(u64);

impl UserPage {
    /// Page that contains `addr` (aligns down to page boundary).
    #[inline]
    #[must_use]
    pub const fn containing_address(addr: UserAddress) -> Self {
        addr.page()
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> UserAddress {
        UserAddress(self.0)
    }

    /// The page `count` pages above this one, if it does not wrap.
    #[inline]
    #[must_use]
    pub const fn checked_add_pages(self, count: u64) -> Option<Self> {
        match count.checked_mul(PAGE_SIZE as u64) {
            Some(bytes) => match self.0.checked_add(bytes) {
                Some(v) => Some(Self(v)),
                None => None,
            },
            None => None,
        }
    }

    /// The page directly below this one.
    #[inline]
    #[must_use]
    pub const fn previous(self) -> Option<Self> {
        match self.0.checked_sub(PAGE_SIZE as u64) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Display for UserPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

impl fmt::Debug for UserPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserPage(0x{:08X})", self.0)
    }
}

impl TryFrom<UserAddress> for UserPage {
    type Error = ();

    #[inline]
    fn try_from(va: UserAddress) -> Result<Self, ()> {
        if va.offset() == 0 { Ok(va.page()) } else { Err(()) }
    }
}

/// Index of a physical frame inside the user pool.
///
/// The pool numbers its frames densely from zero, which is what makes the
/// frame index an array rather than a map.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FrameNumber(usize);

impl FrameNumber {
    #[inline]
    #[must_use]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Debug for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame#{}", self.0)
    }
}

impl fmt::Display for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_rounds_down() {
        let va = UserAddress::new(0xBFFF_FFFC);
        assert_eq!(va.page().base(), UserAddress::new(0xBFFF_F000));
        assert_eq!(va.offset(), 0xFFC);
        assert_eq!(UserPage::containing_address(va), va.page());
    }

    #[test]
    fn try_from_rejects_unaligned() {
        assert!(UserPage::try_from(UserAddress::new(0x1000)).is_ok());
        assert!(UserPage::try_from(UserAddress::new(0x1001)).is_err());
    }

    #[test]
    fn page_arithmetic_does_not_wrap() {
        let page = UserAddress::new(0x1000).page();
        assert_eq!(page.checked_add_pages(2).unwrap().base().as_u64(), 0x3000);
        assert_eq!(page.previous().unwrap().base().as_u64(), 0);
        assert!(page.previous().unwrap().previous().is_none());
        assert!(UserAddress::new(u64::MAX).page().checked_add_pages(1).is_none());
    }

    #[test]
    fn checked_address_arithmetic() {
        let va = UserAddress::new(8);
        assert_eq!(va.checked_sub(4), Some(UserAddress::new(4)));
        assert_eq!(va.checked_sub(9), None);
        assert_eq!(UserAddress::new(u64::MAX).checked_add(1), None);
    }
}
