//! # Address Spaces
//!
//! One [`AddressSpace`] per user process: its supplemental page table, its
//! page directory and its memory-mapped regions, plus a handle on the shared
//! [`FrameTable`]. The owning thread mutates it without locking; everything
//! that touches frames goes through the frame table lock.

use crate::addresses::{PAGE_SIZE, UserAddress, UserPage};
use crate::config::VmConfig;
use crate::error::VmError;
use crate::frame::{FrameId, Owner, SpaceId};
use crate::frame_table::FrameTable;
use crate::hal::{BackingStore, PageDirectory};
use crate::mmap::{MapId, MmapTable};
use crate::page::{Backing, PageEntry, PageKind};
use crate::spt::SupplementalPageTable;
use alloc::sync::Arc;
use core::fmt;
use log::{debug, error, trace};

pub struct AddressSpace {
    id: SpaceId,
    frames: Arc<FrameTable>,
    directory: Arc<dyn PageDirectory>,
    pages: SupplementalPageTable,
    mappings: MmapTable,
    config: VmConfig,
    faults: u64,
    released: bool,
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .field("pages", &self.pages.len())
            .field("mappings", &self.mappings.len())
            .field("faults", &self.faults)
            .finish_non_exhaustive()
    }
}

impl AddressSpace {
    /// Create an empty address space over `directory`.
    ///
    /// # Errors
    /// [`VmError::AllocationFailure`] if the frame table cannot register it.
    pub fn new(frames: Arc<FrameTable>, directory: Arc<dyn PageDirectory>, config: VmConfig) -> Result<Self, VmError> {
        let id = frames.register_space(Arc::clone(&directory))?;
        Ok(Self {
            id,
            frames,
            directory,
            pages: SupplementalPageTable::new(),
            mappings: MmapTable::new(),
            config,
            faults: 0,
            released: false,
        })
    }

    #[must_use]
    pub const fn id(&self) -> SpaceId {
        self.id
    }

    #[must_use]
    pub const fn config(&self) -> &VmConfig {
        &self.config
    }

    #[must_use]
    pub const fn frames(&self) -> &Arc<FrameTable> {
        &self.frames
    }

    #[must_use]
    pub const fn directory(&self) -> &Arc<dyn PageDirectory> {
        &self.directory
    }

    #[must_use]
    pub const fn pages(&self) -> &SupplementalPageTable {
        &self.pages
    }

    #[must_use]
    pub const fn mappings(&self) -> &MmapTable {
        &self.mappings
    }

    /// Page faults resolved or rejected in this address space.
    #[must_use]
    pub const fn fault_count(&self) -> u64 {
        self.faults
    }

    pub(crate) const fn record_fault(&mut self) {
        self.faults += 1;
    }

    /// Register a page without loading it.
    ///
    /// # Errors
    /// - [`VmError::InvalidMapping`] if `page` is not a user page or `length`
    ///   exceeds a page.
    /// - See [`SupplementalPageTable::add_entry`].
    pub fn add_entry(
        &mut self,
        page: UserPage,
        kind: PageKind,
        backing: Option<Backing>,
        length: usize,
        writable: bool,
    ) -> Result<(), VmError> {
        if !self.config.is_user(page.base()) {
            return Err(VmError::InvalidMapping);
        }
        self.pages.add_entry(page, kind, backing, length, writable)?;
        Ok(())
    }

    #[must_use]
    pub fn find_entry(&self, addr: UserAddress) -> Option<&PageEntry> {
        self.pages.find_entry(addr)
    }

    /// The frame the page containing `addr` currently uses.
    #[must_use]
    pub fn frame_ref(&self, addr: UserAddress) -> Option<FrameId> {
        self.frames.lock().frame_of(self.id, addr.page())
    }

    /// Unregister the page containing `addr`, releasing its frame first.
    ///
    /// # Errors
    /// - [`VmError::NotMapped`] if no page is registered there.
    /// - [`VmError::KernelInvariantViolation`] if the frame tables disagree.
    pub fn remove_entry(&mut self, addr: UserAddress) -> Result<(), VmError> {
        let page = addr.page();
        if !self.pages.contains(page) {
            return Err(VmError::NotMapped(addr));
        }
        self.release_frame(page)?;
        self.pages.take_entry(page);
        Ok(())
    }

    fn release_frame(&self, page: UserPage) -> Result<(), VmError> {
        let mut frames = self.frames.lock();
        if let Some(id) = frames.frame_of(self.id, page) {
            let owner = frames.remove_owner(id, self.id, page)?;
            frames.dispose_if_unowned(id, owner)?;
        }
        Ok(())
    }

    /// Register an executable segment of `read_bytes` file bytes at `offset`
    /// followed by `zero_bytes` zeros, starting at `page`.
    ///
    /// Writable pages are [`PageKind::ExecutableData`]; read-only pages are
    /// [`PageKind::ExecutableCode`] if they read from the file and
    /// [`PageKind::AllZero`] otherwise. A page shared with a previous segment
    /// takes the new segment's content, stays writable if either segment
    /// grants it and is reclassified accordingly.
    ///
    /// # Errors
    /// - [`VmError::InvalidMapping`] if the segment does not cover whole pages
    ///   or leaves user space.
    /// - [`VmError::AllocationFailure`] if the table cannot grow.
    pub fn register_segment(
        &mut self,
        store: &Arc<dyn BackingStore>,
        mut offset: u64,
        mut page: UserPage,
        mut read_bytes: usize,
        mut zero_bytes: usize,
        writable: bool,
    ) -> Result<(), VmError> {
        if !(read_bytes + zero_bytes).is_multiple_of(PAGE_SIZE) {
            return Err(VmError::InvalidMapping);
        }

        while read_bytes > 0 || zero_bytes > 0 {
            let page_read = read_bytes.min(PAGE_SIZE);
            let kind = PageKind::for_segment(page_read > 0, writable);
            let backing = (page_read > 0).then(|| Backing::new(Arc::clone(store), offset));

            if let Some(existing) = self.pages.find_entry_mut(page.base()) {
                existing.merge(backing, page_read, writable);
            } else {
                self.add_entry(page, kind, backing, page_read, writable)?;
            }

            read_bytes -= page_read;
            zero_bytes -= PAGE_SIZE - page_read;
            offset += page_read as u64;
            if read_bytes > 0 || zero_bytes > 0 {
                page = page.checked_add_pages(1).ok_or(VmError::InvalidMapping)?;
            }
        }
        Ok(())
    }

    /// Register and load the initial stack page. Returns the initial stack
    /// pointer.
    ///
    /// # Errors
    /// Any error of registering or loading the page.
    pub fn setup_stack(&mut self) -> Result<UserAddress, VmError> {
        let page = self.config.stack_top_page();
        self.add_entry(page, PageKind::Stack, None, 0, true)?;
        self.load_page(page, false)?;
        Ok(self.config.user_top)
    }

    /// Map the whole of `store` at `addr`.
    ///
    /// # Errors
    /// [`VmError::InvalidMapping`] if `addr` is null or unaligned, the store
    /// is empty, or the region leaves user space or overlaps a registered page.
    pub fn mmap(&mut self, store: &Arc<dyn BackingStore>, addr: UserAddress) -> Result<MapId, VmError> {
        let length = store.len();
        if addr.is_null() || length == 0 {
            return Err(VmError::InvalidMapping);
        }
        let start = UserPage::try_from(addr).map_err(|()| VmError::InvalidMapping)?;
        let count = length.div_ceil(PAGE_SIZE as u64);
        let end = count
            .checked_mul(PAGE_SIZE as u64)
            .and_then(|bytes| addr.checked_add(bytes))
            .ok_or(VmError::InvalidMapping)?;
        if end > self.config.user_top {
            return Err(VmError::InvalidMapping);
        }
        for i in 0..count {
            let page = start.checked_add_pages(i).ok_or(VmError::InvalidMapping)?;
            if self.pages.contains(page) {
                return Err(VmError::InvalidMapping);
            }
        }

        for i in 0..count {
            let result = start
                .checked_add_pages(i)
                .ok_or(VmError::InvalidMapping)
                .and_then(|page| {
                    let offset = i * PAGE_SIZE as u64;
                    #[allow(clippy::cast_possible_truncation)]
                    let valid = (length - offset).min(PAGE_SIZE as u64) as usize;
                    let backing = Backing::new(Arc::clone(store), offset);
                    self.add_entry(page, PageKind::MemoryMapped, Some(backing), valid, true)
                });
            if let Err(err) = result {
                self.forget_pages(start, i);
                return Err(err);
            }
        }

        match self.mappings.insert(start, count) {
            Ok(id) => {
                debug!("mmap {id:?}: {count} pages at {addr}");
                Ok(id)
            }
            Err(err) => {
                self.forget_pages(start, count);
                Err(err)
            }
        }
    }

    /// Drop freshly registered, never loaded pages.
    fn forget_pages(&mut self, start: UserPage, count: u64) {
        for i in 0..count {
            if let Some(page) = start.checked_add_pages(i) {
                self.pages.take_entry(page);
            }
        }
    }

    /// Unmap a region, writing modified pages back to the file once their
    /// last owner leaves.
    ///
    /// # Errors
    /// - [`VmError::InvalidMapping`] for an unknown handle.
    /// - See [`remove_entry`](Self::remove_entry).
    pub fn munmap(&mut self, id: MapId) -> Result<(), VmError> {
        let mapping = self.mappings.remove(id).ok_or(VmError::InvalidMapping)?;
        for page in mapping.pages() {
            self.remove_entry(page.base())?;
        }
        debug!("munmap {id:?}");
        Ok(())
    }

    /// Release a pin taken with `left_pinned`.
    ///
    /// # Errors
    /// - [`VmError::NotMapped`] if the page has no frame.
    /// - [`VmError::KernelInvariantViolation`] if it is not pinned.
    pub fn unpin(&self, addr: UserAddress) -> Result<(), VmError> {
        let mut frames = self.frames.lock();
        let id = frames
            .frame_of(self.id, addr.page())
            .ok_or(VmError::NotMapped(addr))?;
        frames.unpin(id)
    }

    /// Bring a registered page into a frame and map it, optionally leaving
    /// the frame pinned.
    pub(crate) fn load_page(&self, page: UserPage, left_pinned: bool) -> Result<(), VmError> {
        let entry = self
            .pages
            .find_entry(page.base())
            .ok_or(VmError::NotMapped(page.base()))?;

        let mut frames = self.frames.lock();
        let id = frames.get_frame(self.id, entry)?;
        if let Err(err) = frames.install_frame(self.id, entry, id) {
            if let Err(undo) = frames.abandon(id, Owner::new(self.id, page)) {
                error!("abandoning {id:?} after failed install of {page:?}: {undo}");
            }
            return Err(err);
        }
        if left_pinned {
            frames.pin(id)?;
        }
        trace!("loaded {page:?} into {id:?}");
        Ok(())
    }

    /// Tear the address space down: unmap every region, release every page
    /// and unregister from the frame table.
    ///
    /// # Errors
    /// The first error encountered; teardown stops there.
    pub fn destroy(mut self) -> Result<(), VmError> {
        self.release()
    }

    fn release(&mut self) -> Result<(), VmError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        for mapping in self.mappings.take_all() {
            for page in mapping.pages() {
                self.remove_entry(page.base())?;
            }
        }
        while let Some(page) = self.pages.last_page() {
            self.remove_entry(page.base())?;
        }
        self.frames.unregister_space(self.id)
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            error!("teardown of address space {:?} failed: {err}", self.id);
        }
    }
}
