//! # Frame Table
//!
//! The system-wide registry of frames, shared by every address space.
//!
//! All state sits behind one lock. Taking the lock yields a
//! [`FrameTableGuard`], and every operation that inspects or changes an
//! owner set, a pin count, a frame location or one of the indices is a
//! method on that guard. Holding the guard across a `get_frame` /
//! `install_frame` pair makes the pair atomic with respect to eviction and
//! owner removal.
//!
//! ## Indices
//!
//! * The **frame index** maps a pool frame number to the entry occupying it.
//!   The clock hand walks it.
//! * The **shared index** maps `(backing store, offset, page kind)` to the
//!   entry of a shareable frame.
//! * The **back-links** map `(address space, page)` to the entry that page
//!   currently uses, resident or swapped. This is the frame reference of a
//!   supplemental page table entry, kept here so that evicting a frame
//!   shared by several processes only ever touches this table.
//!
//! Entries live in a slab addressed by [`FrameId`] handles; no pointer
//! crosses an address-space boundary.

use crate::addresses::{FrameNumber, UserPage};
use crate::error::VmError;
use crate::evict::Clock;
use crate::frame::{FrameEntry, FrameId, Location, Owner, Owners, SpaceId};
use crate::hal::{BlockDevice, PageDirectory, PhysicalPool};
use crate::page::{DisposalPolicy, PageEntry, ShareKey};
use crate::swap::SwapSpace;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use log::{trace, warn};

/// The frame table monitor.
pub struct FrameTable {
    pub(crate) pool: Box<dyn PhysicalPool>,
    pub(crate) swap: SwapSpace,
    state: spin::Mutex<FrameTableState>,
}

/// Everything the frame table lock protects.
pub(crate) struct FrameTableState {
    pub(crate) entries: Vec<Option<FrameEntry>>,
    free_ids: Vec<FrameId>,
    pub(crate) frame_index: Vec<Option<FrameId>>,
    pub(crate) shared: BTreeMap<ShareKey, FrameId>,
    pub(crate) links: BTreeMap<Owner, FrameId>,
    pub(crate) spaces: Vec<Option<Arc<dyn PageDirectory>>>,
    pub(crate) clock: Clock,
    pub(crate) counters: Counters,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Counters {
    pub(crate) evictions: u64,
    pub(crate) swap_outs: u64,
    pub(crate) swap_ins: u64,
}

/// A snapshot of frame table occupancy and activity.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct FrameStats {
    /// Entries occupying a pool frame.
    pub resident: usize,
    /// Entries whose content is in a swap slot.
    pub swapped: usize,
    /// Entries with two or more owners.
    pub shared: usize,
    /// Entries with a non-zero pin count.
    pub pinned: usize,
    pub evictions: u64,
    pub swap_outs: u64,
    pub swap_ins: u64,
}

impl fmt::Debug for FrameTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameTable")
            .field("frames", &self.pool.frame_count())
            .field("swap", &self.swap)
            .finish_non_exhaustive()
    }
}

impl FrameTable {
    /// Build the table over the user pool and the swap device.
    ///
    /// # Errors
    /// [`VmError::AllocationFailure`] if the frame index or the swap bitmap
    /// cannot be allocated.
    pub fn new(pool: Box<dyn PhysicalPool>, swap_device: Box<dyn BlockDevice>) -> Result<Self, VmError> {
        let frames = pool.frame_count();
        let mut frame_index = Vec::new();
        frame_index
            .try_reserve_exact(frames)
            .map_err(|_| VmError::AllocationFailure)?;
        frame_index.resize(frames, None);

        Ok(Self {
            pool,
            swap: SwapSpace::new(swap_device)?,
            state: spin::Mutex::new(FrameTableState {
                entries: Vec::new(),
                free_ids: Vec::new(),
                frame_index,
                shared: BTreeMap::new(),
                links: BTreeMap::new(),
                spaces: Vec::new(),
                clock: Clock::default(),
                counters: Counters::default(),
            }),
        })
    }

    /// Acquire the frame table lock.
    pub fn lock(&self) -> FrameTableGuard<'_> {
        FrameTableGuard {
            table: self,
            state: self.state.lock(),
        }
    }

    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.pool.frame_count()
    }

    #[must_use]
    pub const fn swap(&self) -> &SwapSpace {
        &self.swap
    }

    /// Make an address space's page directory reachable by eviction.
    ///
    /// # Errors
    /// [`VmError::AllocationFailure`] if the registry cannot grow.
    pub fn register_space(&self, directory: Arc<dyn PageDirectory>) -> Result<SpaceId, VmError> {
        let mut state = self.state.lock();
        if let Some(at) = state.spaces.iter().position(Option::is_none) {
            state.spaces[at] = Some(directory);
            return Ok(SpaceId::from_index(at));
        }
        state
            .spaces
            .try_reserve(1)
            .map_err(|_| VmError::AllocationFailure)?;
        state.spaces.push(Some(directory));
        Ok(SpaceId::from_index(state.spaces.len() - 1))
    }

    /// Forget an address space. It must not own any frame anymore.
    ///
    /// # Errors
    /// - [`VmError::UnknownAddressSpace`] if `space` is not registered.
    /// - [`VmError::KernelInvariantViolation`] if frames still link to it.
    pub fn unregister_space(&self, space: SpaceId) -> Result<(), VmError> {
        let mut state = self.state.lock();
        directory(&state.spaces, space)?;
        if state.links.keys().any(|owner| owner.space == space) {
            return Err(VmError::KernelInvariantViolation(
                "address space torn down while still owning frames",
            ));
        }
        state.spaces[space.index()] = None;
        Ok(())
    }
}

/// Exclusive access to the frame table.
pub struct FrameTableGuard<'a> {
    pub(crate) table: &'a FrameTable,
    pub(crate) state: spin::MutexGuard<'a, FrameTableState>,
}

impl FrameTableGuard<'_> {
    /// Return a pinned frame holding the content of `entry` for `space`.
    ///
    /// 1. A frame already linked to the page is returned, brought back from
    ///    swap first if necessary.
    /// 2. A shareable page reuses the frame registered for its backing
    ///    region, if any.
    /// 3. Otherwise a new frame is constructed. This may evict.
    ///
    /// # Errors
    /// - [`VmError::AllocationFailure`] if no frame can be obtained.
    /// - [`VmError::BackingStoreReadShortfall`] if the backing store returns
    ///   fewer bytes than the page holds; nothing is left behind.
    pub fn get_frame(&mut self, space: SpaceId, entry: &PageEntry) -> Result<FrameId, VmError> {
        let owner = Owner::new(space, entry.page());
        if let Some(&id) = self.state.links.get(&owner) {
            self.make_resident(id)?;
            self.pin(id)?;
            trace!("{owner:?} reuses linked frame {id:?}");
            return Ok(id);
        }

        if entry.kind().is_shareable()
            && let Some(key) = entry.backing().map(|backing| backing.share_key(entry.kind()))
            && let Some(&id) = self.state.shared.get(&key)
        {
            self.make_resident(id)?;
            self.pin(id)?;
            trace!("{owner:?} shares frame {id:?} at {key:?}");
            return Ok(id);
        }

        self.construct(entry)
    }

    fn construct(&mut self, entry: &PageEntry) -> Result<FrameId, VmError> {
        self.state
            .entries
            .try_reserve(1)
            .map_err(|_| VmError::AllocationFailure)?;

        let backing = entry.backing().cloned();
        let frame = self.allocate_page(backing.is_none())?;

        if let Some(backing) = &backing {
            // SAFETY: the frame was just taken from the pool and is not yet
            // reachable through any index; the table lock is held.
            let page = unsafe { self.table.pool.frame_mut(frame) };
            let expected = entry.valid_bytes();
            let actual = backing.store().read_at(&mut page[..expected], backing.offset());
            if actual < expected {
                self.table.pool.free_page(frame);
                return Err(VmError::BackingStoreReadShortfall { expected, actual });
            }
            page[expected..].fill(0);
        }

        let fte = FrameEntry::new(frame, entry.kind(), backing, entry.valid_bytes());
        let shared_key = fte.share_key().filter(|_| entry.kind().is_shareable());

        let state = &mut *self.state;
        let id = insert_entry(state, fte);
        state.frame_index[frame.index()] = Some(id);
        if let Some(key) = shared_key {
            state.shared.insert(key, id);
        }
        trace!("constructed frame {id:?} in {frame:?} for {:?}", entry.page());
        Ok(id)
    }

    /// Map a pinned frame into `space` at `entry`'s page, record the owner
    /// and link, and release the pin taken by [`get_frame`](Self::get_frame).
    ///
    /// # Errors
    /// - [`VmError::AllocationFailure`] if the mapping or the owner list
    ///   cannot be allocated. The mapping is cleared again in the latter case.
    /// - [`VmError::KernelInvariantViolation`] if the frame is not resident.
    pub fn install_frame(&mut self, space: SpaceId, entry: &PageEntry, id: FrameId) -> Result<(), VmError> {
        let state = &mut *self.state;
        let dir = directory(&state.spaces, space)?;
        let fte = entry_mut(&mut state.entries, id)?;
        let Location::Resident(frame) = fte.location else {
            return Err(VmError::KernelInvariantViolation("installing a frame that is not resident"));
        };

        let page = entry.page();
        let owner = Owner::new(space, page);
        let reinstall = fte.owners.contains(&owner);
        // Installing afresh resets the hardware bits of the old mapping.
        if reinstall && dir.is_dirty(page) {
            fte.dirty = true;
        }
        if !dir.install(page, frame, entry.writable()) {
            return Err(VmError::AllocationFailure);
        }

        if !reinstall
            && let Err(err) = fte.owners.insert(owner)
        {
            dir.clear(page);
            return Err(err);
        }
        fte.pin_count = fte.pin_count.saturating_sub(1);
        state.links.insert(owner, id);
        trace!("installed {id:?} at {owner:?}");
        Ok(())
    }

    /// Remove `(space, page)` from the frame's owners and clear its mapping.
    ///
    /// The mapping's dirty bit is folded into the entry before the mapping
    /// goes away.
    ///
    /// # Errors
    /// [`VmError::KernelInvariantViolation`] if the pair does not own the frame.
    pub fn remove_owner(&mut self, id: FrameId, space: SpaceId, page: UserPage) -> Result<Owner, VmError> {
        let state = &mut *self.state;
        let dir = directory(&state.spaces, space)?;
        let fte = entry_mut(&mut state.entries, id)?;
        let owner = Owner::new(space, page);
        let removed = fte
            .owners
            .remove(&owner)
            .ok_or(VmError::KernelInvariantViolation("removing a non-owner of a frame"))?;

        if fte.resident_frame().is_some() && dir.is_dirty(page) {
            fte.dirty = true;
        }
        dir.clear(page);
        state.links.remove(&owner);
        trace!("removed owner {owner:?} of {id:?}");
        Ok(removed)
    }

    /// Dispose of a frame whose owner set has become empty.
    ///
    /// Returns `false`, doing nothing, while owners remain. Otherwise the
    /// content is written back if the policy asks for it and the frame was
    /// modified, the pool page or swap slot is released and the entry is
    /// dropped from every index.
    ///
    /// # Errors
    /// [`VmError::KernelInvariantViolation`] for a stale handle.
    pub fn dispose_if_unowned(&mut self, id: FrameId, last_owner: Owner) -> Result<bool, VmError> {
        let table = self.table;
        let state = &mut *self.state;
        if !entry(&state.entries, id)?.owners.is_empty() {
            return Ok(false);
        }
        let Some(fte) = state.entries[id.index()].take() else {
            return Err(VmError::KernelInvariantViolation("stale frame handle"));
        };

        match fte.location {
            Location::Resident(frame) => {
                if fte.policy() == DisposalPolicy::WriteIfDirty && fte.dirty {
                    write_back(&*table.pool, &fte, frame);
                }
                table.pool.free_page(frame);
                state.frame_index[frame.index()] = None;
            }
            Location::Swapped(slot) => {
                if fte.policy() == DisposalPolicy::WriteIfDirty {
                    warn!("dropping {id:?} from {slot:?}; its write-back had failed");
                }
                table.swap.swap_remove(slot);
            }
        }
        forget_shared(state, &fte, id);
        release_id(state, id);
        trace!("disposed of {id:?} after {last_owner:?} left");
        Ok(true)
    }

    /// Undo a [`get_frame`](Self::get_frame) whose installation failed.
    ///
    /// # Errors
    /// See [`unpin`](Self::unpin) and [`dispose_if_unowned`](Self::dispose_if_unowned).
    pub fn abandon(&mut self, id: FrameId, owner: Owner) -> Result<(), VmError> {
        self.unpin(id)?;
        self.dispose_if_unowned(id, owner)?;
        Ok(())
    }

    /// Exclude a frame from eviction. Pins nest.
    ///
    /// # Errors
    /// [`VmError::KernelInvariantViolation`] for a stale handle or on overflow.
    pub fn pin(&mut self, id: FrameId) -> Result<(), VmError> {
        let fte = entry_mut(&mut self.state.entries, id)?;
        fte.pin_count = fte
            .pin_count
            .checked_add(1)
            .ok_or(VmError::KernelInvariantViolation("pin count overflow"))?;
        Ok(())
    }

    /// Release one pin.
    ///
    /// # Errors
    /// [`VmError::KernelInvariantViolation`] if the frame is not pinned.
    pub fn unpin(&mut self, id: FrameId) -> Result<(), VmError> {
        let fte = entry_mut(&mut self.state.entries, id)?;
        if fte.pin_count == 0 {
            warn!("unpin of unpinned frame {id:?}");
            return Err(VmError::KernelInvariantViolation("unpin of an unpinned frame"));
        }
        fte.pin_count -= 1;
        Ok(())
    }

    /// The frame a page currently uses, resident or swapped.
    #[must_use]
    pub fn frame_of(&self, space: SpaceId, page: UserPage) -> Option<FrameId> {
        self.state.links.get(&Owner::new(space, page)).copied()
    }

    #[must_use]
    pub fn entry(&self, id: FrameId) -> Option<&FrameEntry> {
        self.state.entries.get(id.index())?.as_ref()
    }

    /// The frame registered for a shareable backing region.
    #[must_use]
    pub fn shared_frame(&self, key: ShareKey) -> Option<FrameId> {
        self.state.shared.get(&key).copied()
    }

    /// The entry occupying a pool frame.
    #[must_use]
    pub fn resident(&self, frame: FrameNumber) -> Option<FrameId> {
        self.state.frame_index.get(frame.index()).copied().flatten()
    }

    #[must_use]
    pub fn stats(&self) -> FrameStats {
        let mut stats = FrameStats {
            evictions: self.state.counters.evictions,
            swap_outs: self.state.counters.swap_outs,
            swap_ins: self.state.counters.swap_ins,
            ..FrameStats::default()
        };
        for fte in self.state.entries.iter().flatten() {
            match fte.location {
                Location::Resident(_) => stats.resident += 1,
                Location::Swapped(_) => stats.swapped += 1,
            }
            if matches!(fte.owners, Owners::Shared(_)) {
                stats.shared += 1;
            }
            if fte.is_pinned() {
                stats.pinned += 1;
            }
        }
        stats
    }

    /// Check the cross-index invariants of the table.
    ///
    /// # Errors
    /// [`VmError::KernelInvariantViolation`] naming the first broken rule.
    pub fn audit(&self) -> Result<(), VmError> {
        let state = &*self.state;
        let broken = VmError::KernelInvariantViolation;
        let mut swapped = 0;

        for (at, slot) in state.entries.iter().enumerate() {
            let Some(fte) = slot else { continue };
            let id = FrameId::from_index(at);
            if !fte.owners.is_well_formed() {
                return Err(broken("shared owner list with fewer than two owners"));
            }
            match fte.location {
                Location::Resident(frame) => {
                    if state.frame_index.get(frame.index()).copied().flatten() != Some(id) {
                        return Err(broken("resident frame missing from the frame index"));
                    }
                }
                Location::Swapped(slot) => {
                    swapped += 1;
                    if !self.table.swap.is_used(slot) {
                        return Err(broken("swapped frame in a free slot"));
                    }
                }
            }
            for owner in fte.owners.as_slice() {
                if state.links.get(owner) != Some(&id) {
                    return Err(broken("owner without a back-link"));
                }
            }
        }

        for (owner, &id) in &state.links {
            if !entry(&state.entries, id)?.owners.contains(owner) {
                return Err(broken("back-link without an owner"));
            }
        }

        for (at, id) in state.frame_index.iter().enumerate() {
            let Some(id) = *id else { continue };
            if entry(&state.entries, id)?.location != Location::Resident(FrameNumber::new(at)) {
                return Err(broken("frame index disagrees with frame location"));
            }
        }

        for (key, &id) in &state.shared {
            if entry(&state.entries, id)?.share_key() != Some(*key) {
                return Err(broken("shared index key does not match the frame's backing"));
            }
        }

        if swapped != self.table.swap.used_slots() {
            return Err(broken("swap slots in use without a frame"));
        }
        Ok(())
    }

    /// Bring a swapped frame back into a pool frame.
    fn make_resident(&mut self, id: FrameId) -> Result<(), VmError> {
        let Location::Swapped(slot) = entry(&self.state.entries, id)?.location else {
            return Ok(());
        };
        let frame = self.allocate_page(false)?;
        // SAFETY: fresh pool frame, unreachable from any index; lock held.
        let page = unsafe { self.table.pool.frame_mut(frame) };
        self.table.swap.swap_in(slot, page);

        let state = &mut *self.state;
        let fte = entry_mut(&mut state.entries, id)?;
        fte.location = Location::Resident(frame);
        fte.dirty = true;
        state.frame_index[frame.index()] = Some(id);
        state.counters.swap_ins += 1;
        Ok(())
    }

    /// Take a page from the pool, evicting a frame if the pool is exhausted.
    pub(crate) fn allocate_page(&mut self, zeroed: bool) -> Result<FrameNumber, VmError> {
        if let Some(frame) = self.table.pool.get_page(zeroed) {
            return Ok(frame);
        }
        let frame = self.evict()?;
        if zeroed {
            // SAFETY: the victim's mappings are cleared and its index slot is
            // empty; the page belongs to this allocation.
            unsafe { self.table.pool.frame_mut(frame) }.fill(0);
        }
        Ok(frame)
    }
}

pub(crate) fn entry(entries: &[Option<FrameEntry>], id: FrameId) -> Result<&FrameEntry, VmError> {
    entries
        .get(id.index())
        .and_then(Option::as_ref)
        .ok_or(VmError::KernelInvariantViolation("stale frame handle"))
}

pub(crate) fn entry_mut(entries: &mut [Option<FrameEntry>], id: FrameId) -> Result<&mut FrameEntry, VmError> {
    entries
        .get_mut(id.index())
        .and_then(Option::as_mut)
        .ok_or(VmError::KernelInvariantViolation("stale frame handle"))
}

pub(crate) fn directory(
    spaces: &[Option<Arc<dyn PageDirectory>>],
    space: SpaceId,
) -> Result<&Arc<dyn PageDirectory>, VmError> {
    spaces
        .get(space.index())
        .and_then(Option::as_ref)
        .ok_or(VmError::UnknownAddressSpace)
}

/// Store an entry in the slab. Capacity must have been reserved.
fn insert_entry(state: &mut FrameTableState, fte: FrameEntry) -> FrameId {
    if let Some(id) = state.free_ids.pop() {
        state.entries[id.index()] = Some(fte);
        return id;
    }
    state.entries.push(Some(fte));
    FrameId::from_index(state.entries.len() - 1)
}

/// Make a slab slot reusable. If the free list cannot grow the slot is
/// simply never reused.
pub(crate) fn release_id(state: &mut FrameTableState, id: FrameId) {
    state.entries[id.index()] = None;
    if state.free_ids.try_reserve(1).is_ok() {
        state.free_ids.push(id);
    }
}

/// Drop the shared-index entry pointing at `id`, if there is one.
pub(crate) fn forget_shared(state: &mut FrameTableState, fte: &FrameEntry, id: FrameId) {
    if let Some(key) = fte.share_key()
        && state.shared.get(&key) == Some(&id)
    {
        state.shared.remove(&key);
    }
}

/// Write a resident frame's valid bytes back to its backing store.
/// Returns whether every byte reached the store.
pub(crate) fn write_back(pool: &dyn PhysicalPool, fte: &FrameEntry, frame: FrameNumber) -> bool {
    let Some(backing) = &fte.backing else { return false };
    // SAFETY: the frame belongs to `fte` and the table lock is held.
    let page = unsafe { pool.frame_mut(frame) };
    let written = backing.store().write_at(&page[..fte.valid_bytes], backing.offset());
    if written < fte.valid_bytes {
        warn!(
            "short write-back of {frame:?}: {written} of {} bytes at offset {}",
            fte.valid_bytes,
            backing.offset()
        );
        return false;
    }
    true
}
