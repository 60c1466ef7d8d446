//! # Supplemental Page Table
//!
//! Per-address-space table of every virtual page the process knows about,
//! kept sorted by page so lookups are a binary search and growth can fail
//! gracefully instead of aborting the kernel.
//!
//! The table is owned by its address space and has no lock of its own.
//! Releasing a resident entry's frame requires the frame table, so removal
//! with frame release lives on [`AddressSpace`](crate::AddressSpace); the
//! methods here only manage metadata.

use crate::addresses::{UserAddress, UserPage};
use crate::error::VmError;
use crate::page::{Backing, PageEntry, PageKind};
use alloc::vec::Vec;

#[derive(Debug, Default)]
pub struct SupplementalPageTable {
    entries: Vec<PageEntry>,
}

impl SupplementalPageTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register a page.
    ///
    /// # Errors
    /// - [`VmError::AllocationFailure`] if the table cannot grow.
    /// - [`VmError::AlreadyRegistered`] if `page` already has an entry.
    /// - [`VmError::InvalidMapping`] if `length` exceeds a page.
    pub fn add_entry(
        &mut self,
        page: UserPage,
        kind: PageKind,
        backing: Option<Backing>,
        length: usize,
        writable: bool,
    ) -> Result<&PageEntry, VmError> {
        let entry = PageEntry::new(page, kind, backing, length, writable)?;
        self.insert(entry)
    }

    /// Insert a prepared entry.
    ///
    /// # Errors
    /// See [`add_entry`](Self::add_entry).
    pub fn insert(&mut self, entry: PageEntry) -> Result<&PageEntry, VmError> {
        let at = match self.position(entry.page()) {
            Ok(_) => return Err(VmError::AlreadyRegistered(entry.page())),
            Err(at) => at,
        };
        self.entries
            .try_reserve(1)
            .map_err(|_| VmError::AllocationFailure)?;
        self.entries.insert(at, entry);
        Ok(&self.entries[at])
    }

    /// Entry for the page containing `addr`. Never allocates.
    #[must_use]
    pub fn find_entry(&self, addr: UserAddress) -> Option<&PageEntry> {
        let at = self.position(addr.page()).ok()?;
        Some(&self.entries[at])
    }

    #[must_use]
    pub fn find_entry_mut(&mut self, addr: UserAddress) -> Option<&mut PageEntry> {
        let at = self.position(addr.page()).ok()?;
        Some(&mut self.entries[at])
    }

    #[must_use]
    pub fn contains(&self, page: UserPage) -> bool {
        self.position(page).is_ok()
    }

    /// Detach an entry's metadata.
    pub fn take_entry(&mut self, page: UserPage) -> Option<PageEntry> {
        let at = self.position(page).ok()?;
        Some(self.entries.remove(at))
    }

    /// Highest registered page.
    #[must_use]
    pub fn last_page(&self) -> Option<UserPage> {
        self.entries.last().map(PageEntry::page)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageEntry> {
        self.entries.iter()
    }

    fn position(&self, page: UserPage) -> Result<usize, usize> {
        self.entries.binary_search_by_key(&page, PageEntry::page)
    }
}
