//! # Page Metadata
//!
//! What a process knows about one of its virtual pages, resident or not.

use crate::addresses::{PAGE_SIZE, UserPage};
use crate::error::VmError;
use crate::hal::{BackingStore, StoreId};
use alloc::sync::Arc;
use core::fmt;

/// Where a page's content comes from, which decides how it is shared and
/// what happens to it on eviction.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum PageKind {
    /// Grown on demand; zero-filled, private.
    Stack,
    /// Read-only segment of an executable; shared between processes.
    ExecutableCode,
    /// Writable segment of an executable; private copy-on-load. Writable
    /// pages that read nothing from the file are of this kind too, without
    /// backing, so that their modifications survive eviction.
    ExecutableData,
    /// Read-only segment tail that reads nothing from the executable.
    AllZero,
    /// Page of a memory-mapped file; shared, written back when dirty.
    MemoryMapped,
}

impl PageKind {
    /// Classify a page of an executable segment.
    #[must_use]
    pub const fn for_segment(reads_file: bool, writable: bool) -> Self {
        match (reads_file, writable) {
            (_, true) => Self::ExecutableData,
            (true, false) => Self::ExecutableCode,
            (false, false) => Self::AllZero,
        }
    }

    /// The disposal policy fixed for frames holding this kind of page.
    #[must_use]
    pub const fn policy(self) -> DisposalPolicy {
        match self {
            Self::Stack => DisposalPolicy::Swap,
            Self::ExecutableData => DisposalPolicy::SwapIfDirty,
            Self::MemoryMapped => DisposalPolicy::WriteIfDirty,
            Self::ExecutableCode | Self::AllZero => DisposalPolicy::Delete,
        }
    }

    /// Whether frames of this kind are found through the shared-frame index.
    #[must_use]
    pub const fn is_shareable(self) -> bool {
        matches!(self, Self::ExecutableCode | Self::MemoryMapped)
    }
}

/// What happens to a frame's content when it is evicted or its last owner
/// goes away.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DisposalPolicy {
    /// Always persisted to swap on eviction.
    Swap,
    /// Persisted to swap if modified, otherwise reloaded from the backing store.
    SwapIfDirty,
    /// Written back to the backing store if modified, then discarded.
    WriteIfDirty,
    /// Discarded; the content is reproducible.
    Delete,
}

/// Key of the shared-frame index: the same file region, loaded as the same
/// kind of page, maps to one frame. Code and mapped views of one file region
/// never share, since their disposal policies differ.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ShareKey {
    pub store: StoreId,
    pub offset: u64,
    pub kind: PageKind,
}

/// A region of a backing store a page is loaded from.
#[derive(Clone)]
pub struct Backing {
    store: Arc<dyn BackingStore>,
    offset: u64,
}

impl Backing {
    #[must_use]
    pub fn new(store: Arc<dyn BackingStore>, offset: u64) -> Self {
        Self { store, offset }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub fn share_key(&self, kind: PageKind) -> ShareKey {
        ShareKey {
            store: self.store.id(),
            offset: self.offset,
            kind,
        }
    }
}

impl fmt::Debug for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backing")
            .field("store", &self.store.id())
            .field("offset", &self.offset)
            .finish()
    }
}

/// Supplemental page table entry.
///
/// Whether the page currently occupies a frame is not stored here: the
/// frame link is kept by the frame table, keyed by `(address space, page)`,
/// so that eviction on behalf of another process never has to reach into
/// this process's table.
#[derive(Clone, Debug)]
pub struct PageEntry {
    page: UserPage,
    kind: PageKind,
    backing: Option<Backing>,
    valid_bytes: usize,
    writable: bool,
}

impl PageEntry {
    /// # Errors
    /// [`VmError::InvalidMapping`] if `valid_bytes` exceeds a page.
    pub fn new(
        page: UserPage,
        kind: PageKind,
        backing: Option<Backing>,
        valid_bytes: usize,
        writable: bool,
    ) -> Result<Self, VmError> {
        if valid_bytes > PAGE_SIZE {
            return Err(VmError::InvalidMapping);
        }
        Ok(Self {
            page,
            kind,
            backing,
            valid_bytes,
            writable,
        })
    }

    #[must_use]
    pub const fn page(&self) -> UserPage {
        self.page
    }

    #[must_use]
    pub const fn kind(&self) -> PageKind {
        self.kind
    }

    #[must_use]
    pub const fn backing(&self) -> Option<&Backing> {
        self.backing.as_ref()
    }

    /// Bytes read from the backing store; the rest of the page is zero.
    /// Pages without backing are entirely zero regardless of this value.
    #[must_use]
    pub const fn valid_bytes(&self) -> usize {
        self.valid_bytes
    }

    #[must_use]
    pub const fn writable(&self) -> bool {
        self.writable
    }

    /// Fold a second loader segment touching the same page into this entry.
    ///
    /// The page is writable if either segment is, and a writable page is
    /// always private data.
    pub(crate) fn merge(&mut self, backing: Option<Backing>, valid_bytes: usize, writable: bool) {
        self.writable |= writable;
        self.kind = PageKind::for_segment(backing.is_some(), self.writable);
        self.backing = backing;
        self.valid_bytes = valid_bytes.min(PAGE_SIZE);
    }
}
