use crate::addresses::{UserAddress, UserPage};

/// Errors reported by the virtual memory subsystem.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmError {
    /// Metadata or a frame could not be allocated, even after eviction.
    #[error("out of memory")]
    AllocationFailure,
    /// Write to a read-only page, or an access outside every valid region.
    #[error("protection violation at {0}")]
    ProtectionViolation(UserAddress),
    /// The backing store returned fewer bytes than the page needs.
    #[error("short read from backing store: expected {expected} bytes, got {actual}")]
    BackingStoreReadShortfall { expected: usize, actual: usize },
    /// The frame tables disagree with themselves, or the kernel faulted on
    /// an address it has no business touching.
    #[error("kernel invariant violated: {0}")]
    KernelInvariantViolation(&'static str),
    /// A supplemental page table entry already exists for this page.
    #[error("page {0} is already registered")]
    AlreadyRegistered(UserPage),
    /// No supplemental page table entry exists for this address.
    #[error("no page registered at {0}")]
    NotMapped(UserAddress),
    /// Bad mmap/munmap or segment request.
    #[error("invalid mapping request")]
    InvalidMapping,
    /// The address space is not registered with the frame table.
    #[error("unknown address space")]
    UnknownAddressSpace,
}

/// How far the damage of an error reaches.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Severity {
    /// The offending process is terminated.
    Process,
    /// The kernel halts.
    System,
}

impl VmError {
    #[must_use]
    pub const fn severity(self) -> Severity {
        match self {
            Self::KernelInvariantViolation(_) => Severity::System,
            _ => Severity::Process,
        }
    }
}
