//! # Collaborator Interfaces
//!
//! The pieces of the kernel this subsystem drives but does not own. Real
//! implementations wrap the page-directory code, the palloc user pool, the
//! inode layer and the block driver; tests use in-memory fakes.

use crate::addresses::{FrameNumber, Page, UserAddress, UserPage};

/// The user frame pool.
///
/// Frames are numbered densely from `0` to [`frame_count`](Self::frame_count).
/// Exhaustion of the pool is the only thing that triggers eviction.
pub trait PhysicalPool: Send + Sync {
    /// Number of frames in the pool.
    fn frame_count(&self) -> usize;

    /// Take a free frame, zero-filled if `zeroed`. `None` when exhausted.
    fn get_page(&self, zeroed: bool) -> Option<FrameNumber>;

    /// Return a frame to the pool.
    fn free_page(&self, frame: FrameNumber);

    /// Kernel view of a frame's contents.
    ///
    /// # Safety
    /// - `frame` must have been handed out by [`get_page`](Self::get_page) and not freed.
    /// - The caller must have exclusive use of the frame for `'a`; in this crate
    ///   that is guaranteed by holding the frame table lock or a pin.
    unsafe fn frame_mut<'a>(&self, frame: FrameNumber) -> &'a mut Page;
}

/// One address space's hardware page directory.
///
/// All page-table bit access happens through this trait; the core never
/// manipulates page-table entries itself.
pub trait PageDirectory: Send + Sync {
    /// Map `page` to `frame`, replacing any existing mapping.
    /// Returns `false` if a page table could not be allocated.
    fn install(&self, page: UserPage, frame: FrameNumber, writable: bool) -> bool;

    /// Remove the mapping of `page`, if any, and flush it from the TLB.
    fn clear(&self, page: UserPage);

    /// The hardware accessed bit of `page`'s mapping.
    fn is_accessed(&self, page: UserPage) -> bool;

    /// Set or clear the accessed bit of `page`'s mapping.
    fn set_accessed(&self, page: UserPage, accessed: bool);

    /// The hardware dirty bit of `page`'s mapping.
    fn is_dirty(&self, page: UserPage) -> bool;
}

/// Identity of a backing store; two handles with the same id refer to the
/// same file.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StoreId(pub u64);

/// A file (inode) that page contents derive from or are written back to.
///
/// Reads and writes are synchronous and serialized by the store itself.
pub trait BackingStore: Send + Sync {
    fn id(&self) -> StoreId;

    /// Length of the store in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read up to `buf.len()` bytes at `offset`; returns the bytes read.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize;

    /// Write up to `buf.len()` bytes at `offset`; returns the bytes written.
    fn write_at(&self, buf: &[u8], offset: u64) -> usize;
}

/// The swap partition.
///
/// Buffers passed in are exactly [`SECTOR_SIZE`](crate::config::SECTOR_SIZE) bytes.
pub trait BlockDevice: Send + Sync {
    fn sector_count(&self) -> u32;
    fn read_sector(&self, sector: u32, buf: &mut [u8]);
    fn write_sector(&self, sector: u32, buf: &[u8]);
}

/// CPU state consulted by the page-fault entry path.
pub trait FaultRegisters {
    /// The faulting linear address (`CR2`).
    fn fault_address(&self) -> UserAddress;

    /// Re-enable interrupts after the fault address has been captured.
    fn enable_interrupts(&self);
}
