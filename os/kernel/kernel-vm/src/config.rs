//! # User Address-Space Layout

use crate::addresses::{PAGE_SIZE, UserAddress, UserPage};

/// First address above user space. Everything at or above belongs to the kernel.
pub const USER_TOP: u64 = 0xC000_0000;

/// Largest size the user stack may grow to.
pub const STACK_MAX_SIZE: u64 = 8 * 1024 * 1024;

/// Lowest address the stack may grow down to.
pub const STACK_FLOOR: u64 = USER_TOP - STACK_MAX_SIZE;

/// How far below the stack pointer an access may land and still count as a
/// stack access. 32 bytes covers `PUSHA`; 4 covers `PUSH`.
pub const STACK_PUSH_SLACK: u64 = 32;

/// Sector size of the swap block device.
pub const SECTOR_SIZE: usize = 512;

/// Number of sectors that make up one swap slot.
pub const SECTORS_PER_SLOT: usize = PAGE_SIZE / SECTOR_SIZE;

const _: () = {
    assert!(PAGE_SIZE.is_multiple_of(SECTOR_SIZE));
    assert!(USER_TOP.is_multiple_of(PAGE_SIZE as u64));
    assert!(STACK_MAX_SIZE.is_multiple_of(PAGE_SIZE as u64));
    assert!(STACK_FLOOR < USER_TOP);
};

/// Per-address-space layout parameters.
///
/// The defaults match the constants above; tests shrink the stack envelope
/// to exercise its edges.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct VmConfig {
    /// First non-user address.
    pub user_top: UserAddress,
    /// Lowest address the stack may grow to.
    pub stack_floor: UserAddress,
    /// Accepted displacement below the stack pointer.
    pub push_slack: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            user_top: UserAddress::new(USER_TOP),
            stack_floor: UserAddress::new(STACK_FLOOR),
            push_slack: STACK_PUSH_SLACK,
        }
    }
}

impl VmConfig {
    /// Whether `addr` lies in user space.
    #[inline]
    #[must_use]
    pub fn is_user(&self, addr: UserAddress) -> bool {
        addr < self.user_top
    }

    /// The topmost user page, where the initial stack lives.
    #[must_use]
    pub fn stack_top_page(&self) -> UserPage {
        UserAddress::new(self.user_top.as_u64() - PAGE_SIZE as u64).page()
    }

    /// Whether a fault at `addr` with stack pointer `esp` is a legitimate
    /// stack access that warrants growing the stack.
    #[must_use]
    pub fn may_grow_stack(&self, addr: UserAddress, esp: UserAddress) -> bool {
        if addr < self.stack_floor || !self.is_user(addr) {
            return false;
        }
        addr.as_u64().saturating_add(self.push_slack) >= esp.as_u64()
    }
}
