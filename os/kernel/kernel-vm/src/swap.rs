//! # Swap Space
//!
//! Page-sized slots on a dedicated block device, tracked by a bitmap with one
//! bit per slot. A set bit means a frame's content is persisted in that slot.
//! The slot layout has no header: slot `n` occupies sectors
//! `n * SECTORS_PER_SLOT .. (n + 1) * SECTORS_PER_SLOT`.
//!
//! The bitmap lock covers the scan-and-flip only; sector I/O runs outside it.

use crate::addresses::Page;
use crate::config::{SECTOR_SIZE, SECTORS_PER_SLOT};
use crate::error::VmError;
use crate::hal::BlockDevice;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use log::{debug, warn};

/// Index of a swap slot.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SwapSlot(u32);

impl SwapSlot {
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    #[must_use]
    pub const fn index(self) -> u32 {
        self.0
    }

    /// First device sector of this slot.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn first_sector(self) -> u32 {
        self.0 * SECTORS_PER_SLOT as u32
    }
}

impl fmt::Debug for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Slot#{}", self.0)
    }
}

/// One bit per slot.
#[derive(Debug)]
pub struct SlotBitmap {
    words: Vec<u64>,
    len: usize,
    used: usize,
}

impl SlotBitmap {
    /// # Errors
    /// [`VmError::AllocationFailure`] if the bitmap cannot be allocated.
    pub fn new(len: usize) -> Result<Self, VmError> {
        let count = len.div_ceil(64);
        let mut words = Vec::new();
        words
            .try_reserve_exact(count)
            .map_err(|_| VmError::AllocationFailure)?;
        words.resize(count, 0);
        Ok(Self {
            words,
            len,
            used: 0,
        })
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn used(&self) -> usize {
        self.used
    }

    #[must_use]
    pub fn test(&self, index: usize) -> bool {
        index < self.len && self.words[index / 64] & (1 << (index % 64)) != 0
    }

    /// Find the first clear bit, set it and return its index.
    pub fn scan_and_flip(&mut self) -> Option<usize> {
        for (w, word) in self.words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = word.trailing_ones() as usize;
            let index = w * 64 + bit;
            if index >= self.len {
                return None;
            }
            *word |= 1 << bit;
            self.used += 1;
            return Some(index);
        }
        None
    }

    /// Clear a bit. Returns whether it was set.
    pub fn reset(&mut self, index: usize) -> bool {
        if !self.test(index) {
            return false;
        }
        self.words[index / 64] &= !(1 << (index % 64));
        self.used -= 1;
        true
    }
}

/// The swap partition and its slot bitmap.
pub struct SwapSpace {
    device: Box<dyn BlockDevice>,
    slots: spin::Mutex<SlotBitmap>,
}

impl fmt::Debug for SwapSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwapSpace")
            .field("slots", &self.slot_count())
            .field("used", &self.used_slots())
            .finish_non_exhaustive()
    }
}

impl SwapSpace {
    /// Take over `device`; every whole slot on it starts out free.
    ///
    /// # Errors
    /// [`VmError::AllocationFailure`] if the bitmap cannot be allocated.
    pub fn new(device: Box<dyn BlockDevice>) -> Result<Self, VmError> {
        let slots = device.sector_count() as usize / SECTORS_PER_SLOT;
        Ok(Self {
            device,
            slots: spin::Mutex::new(SlotBitmap::new(slots)?),
        })
    }

    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }

    #[must_use]
    pub fn used_slots(&self) -> usize {
        self.slots.lock().used()
    }

    #[must_use]
    pub fn is_used(&self, slot: SwapSlot) -> bool {
        self.slots.lock().test(slot.index() as usize)
    }

    /// Persist a page into a free slot.
    ///
    /// # Panics
    /// When no slot is free. There is nowhere left to put the content of a
    /// frame that must be preserved, so the kernel cannot continue.
    #[allow(clippy::cast_possible_truncation)]
    pub fn swap_out(&self, page: &Page) -> SwapSlot {
        let Some(index) = self.slots.lock().scan_and_flip() else {
            panic!("swap space exhausted");
        };
        let slot = SwapSlot(index as u32);
        for (i, chunk) in page.chunks_exact(SECTOR_SIZE).enumerate() {
            self.device.write_sector(slot.first_sector() + i as u32, chunk);
        }
        debug!("swapped out to {slot:?}");
        slot
    }

    /// Read a slot back into `page` and release the slot.
    #[allow(clippy::cast_possible_truncation)]
    pub fn swap_in(&self, slot: SwapSlot, page: &mut Page) {
        for (i, chunk) in page.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            self.device.read_sector(slot.first_sector() + i as u32, chunk);
        }
        self.release(slot);
        debug!("swapped in from {slot:?}");
    }

    /// Release a slot without reading it back.
    pub fn swap_remove(&self, slot: SwapSlot) {
        self.release(slot);
    }

    /// Clear a slot's bit. A slot that was not in use is left alone.
    fn release(&self, slot: SwapSlot) -> bool {
        let released = self.slots.lock().reset(slot.index() as usize);
        if !released {
            warn!("release of free swap {slot:?}");
        }
        released
    }
}
