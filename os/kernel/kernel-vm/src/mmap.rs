//! Per-process list of memory-mapped file regions.

use crate::addresses::UserPage;
use crate::error::VmError;
use alloc::vec::Vec;

/// Handle returned by `mmap` and consumed by `munmap`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MapId(u32);

impl MapId {
    #[must_use]
    pub const fn to_raw(self) -> u32 {
        self.0
    }
}

/// A mapped region: `pages` consecutive pages starting at `start`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Mapping {
    id: MapId,
    start: UserPage,
    pages: u64,
}

impl Mapping {
    #[must_use]
    pub const fn id(&self) -> MapId {
        self.id
    }

    #[must_use]
    pub const fn start(&self) -> UserPage {
        self.start
    }

    #[must_use]
    pub const fn page_count(&self) -> u64 {
        self.pages
    }

    pub fn pages(&self) -> impl Iterator<Item = UserPage> + use<> {
        let start = self.start;
        (0..self.pages).filter_map(move |i| start.checked_add_pages(i))
    }
}

#[derive(Debug, Default)]
pub struct MmapTable {
    next: u32,
    maps: Vec<Mapping>,
}

impl MmapTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: 0,
            maps: Vec::new(),
        }
    }

    /// # Errors
    /// [`VmError::AllocationFailure`] if the list cannot grow.
    pub fn insert(&mut self, start: UserPage, pages: u64) -> Result<MapId, VmError> {
        self.maps
            .try_reserve(1)
            .map_err(|_| VmError::AllocationFailure)?;
        let id = MapId(self.next);
        self.next = self.next.wrapping_add(1);
        self.maps.push(Mapping { id, start, pages });
        Ok(id)
    }

    pub fn remove(&mut self, id: MapId) -> Option<Mapping> {
        let at = self.maps.iter().position(|m| m.id == id)?;
        Some(self.maps.swap_remove(at))
    }

    /// Detach every mapping, e.g. at process exit.
    pub fn take_all(&mut self) -> Vec<Mapping> {
        core::mem::take(&mut self.maps)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addresses::UserAddress;

    #[test]
    fn ids_are_unique_and_removable() {
        let mut table = MmapTable::new();
        let start = UserAddress::new(0x1000_0000).page();
        let a = table.insert(start, 3).unwrap();
        let b = table.insert(start.checked_add_pages(3).unwrap(), 1).unwrap();
        assert_ne!(a, b);

        let mapping = table.remove(a).unwrap();
        assert_eq!(mapping.id(), a);
        let pages: Vec<_> = mapping.pages().collect();
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[2].base().as_u64(), 0x1000_2000);
        assert!(table.remove(a).is_none());
        assert_eq!(table.take_all().len(), 1);
        assert!(table.is_empty());
    }
}
