//! # Frame Table Entries
//!
//! Metadata for one frame's worth of content, wherever it currently lives.
//! Location and ownership are sum types so that a frame can never be both
//! resident and swapped, or carry a one-element "shared" owner list.

use crate::addresses::{FrameNumber, UserPage};
use crate::error::VmError;
use crate::page::{Backing, DisposalPolicy, PageKind, ShareKey};
use crate::swap::SwapSlot;
use alloc::vec::Vec;
use core::num::NonZeroU32;

/// Handle of a frame table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(NonZeroU32);

impl FrameId {
    /// Creates a handle from the backing slab index.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) const fn from_index(index: usize) -> Self {
        // index + 1 is never zero.
        match NonZeroU32::new(index as u32 + 1) {
            Some(raw) => Self(raw),
            None => unreachable!(),
        }
    }

    /// Returns the slab index backing this handle.
    pub(crate) const fn index(self) -> usize {
        self.0.get() as usize - 1
    }
}

/// Handle of an address space registered with the frame table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpaceId(NonZeroU32);

impl SpaceId {
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) const fn from_index(index: usize) -> Self {
        match NonZeroU32::new(index as u32 + 1) {
            Some(raw) => Self(raw),
            None => unreachable!(),
        }
    }

    pub(crate) const fn index(self) -> usize {
        self.0.get() as usize - 1
    }

    /// Raw value, e.g. for log lines.
    #[must_use]
    pub const fn to_raw(self) -> u32 {
        self.0.get()
    }
}

/// One live mapping of a frame: `(address space, user page)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Owner {
    pub space: SpaceId,
    pub page: UserPage,
}

impl Owner {
    #[must_use]
    pub const fn new(space: SpaceId, page: UserPage) -> Self {
        Self { space, page }
    }
}

/// Where the frame's content currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Location {
    Resident(FrameNumber),
    Swapped(SwapSlot),
}

/// The owner set of a frame.
///
/// `Unowned` only exists between construction and installation, and while
/// a frame is being torn down. `Shared` always holds at least two owners.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Owners {
    #[default]
    Unowned,
    Single(Owner),
    Shared(Vec<Owner>),
}

impl Owners {
    #[must_use]
    pub fn as_slice(&self) -> &[Owner] {
        match self {
            Self::Unowned => &[],
            Self::Single(owner) => core::slice::from_ref(owner),
            Self::Shared(owners) => owners,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Unowned)
    }

    #[must_use]
    pub fn contains(&self, owner: &Owner) -> bool {
        self.as_slice().contains(owner)
    }

    /// Add an owner, promoting a singleton to a list on first sharing.
    ///
    /// # Errors
    /// [`VmError::AllocationFailure`] if the owner list cannot be allocated
    /// or grown; the set is unchanged in that case.
    pub fn insert(&mut self, owner: Owner) -> Result<(), VmError> {
        match self {
            Self::Unowned => *self = Self::Single(owner),
            Self::Single(first) => {
                let mut list = Vec::new();
                list.try_reserve_exact(2)
                    .map_err(|_| VmError::AllocationFailure)?;
                list.push(*first);
                list.push(owner);
                *self = Self::Shared(list);
            }
            Self::Shared(list) => {
                list.try_reserve(1)
                    .map_err(|_| VmError::AllocationFailure)?;
                list.push(owner);
            }
        }
        Ok(())
    }

    /// Remove an owner, collapsing a two-element list back to a singleton.
    pub fn remove(&mut self, owner: &Owner) -> Option<Owner> {
        match self {
            Self::Unowned => None,
            Self::Single(only) => {
                if only != owner {
                    return None;
                }
                let removed = *only;
                *self = Self::Unowned;
                Some(removed)
            }
            Self::Shared(list) => {
                let at = list.iter().position(|o| o == owner)?;
                let removed = list.swap_remove(at);
                if list.len() == 1 {
                    *self = Self::Single(list[0]);
                }
                Some(removed)
            }
        }
    }

    pub(crate) const fn is_well_formed(&self) -> bool {
        match self {
            Self::Shared(list) => list.len() >= 2,
            _ => true,
        }
    }
}

/// Frame table entry.
#[derive(Debug)]
pub struct FrameEntry {
    pub(crate) location: Location,
    pub(crate) owners: Owners,
    pub(crate) pin_count: u32,
    pub(crate) dirty: bool,
    pub(crate) kind: PageKind,
    pub(crate) backing: Option<Backing>,
    pub(crate) valid_bytes: usize,
}

impl FrameEntry {
    /// A freshly populated resident frame, pinned once for its constructor.
    pub(crate) const fn new(
        frame: FrameNumber,
        kind: PageKind,
        backing: Option<Backing>,
        valid_bytes: usize,
    ) -> Self {
        Self {
            location: Location::Resident(frame),
            owners: Owners::Unowned,
            pin_count: 1,
            dirty: false,
            kind,
            backing,
            valid_bytes,
        }
    }

    #[must_use]
    pub const fn location(&self) -> Location {
        self.location
    }

    #[must_use]
    pub const fn owners(&self) -> &Owners {
        &self.owners
    }

    #[must_use]
    pub const fn pin_count(&self) -> u32 {
        self.pin_count
    }

    #[must_use]
    pub const fn is_pinned(&self) -> bool {
        self.pin_count > 0
    }

    /// Cached "content differs from the backing store" flag. The hardware
    /// dirty bits are consulted in addition whenever it matters.
    #[must_use]
    pub const fn dirty(&self) -> bool {
        self.dirty
    }

    /// Kind of the page the frame was built for.
    #[must_use]
    pub const fn kind(&self) -> PageKind {
        self.kind
    }

    #[must_use]
    pub const fn policy(&self) -> DisposalPolicy {
        self.kind.policy()
    }

    /// The shared-index key this frame is registered under, if it is backed.
    #[must_use]
    pub fn share_key(&self) -> Option<ShareKey> {
        self.backing.as_ref().map(|backing| backing.share_key(self.kind))
    }

    #[must_use]
    pub const fn backing(&self) -> Option<&Backing> {
        self.backing.as_ref()
    }

    #[must_use]
    pub const fn valid_bytes(&self) -> usize {
        self.valid_bytes
    }

    #[must_use]
    pub const fn resident_frame(&self) -> Option<FrameNumber> {
        match self.location {
            Location::Resident(frame) => Some(frame),
            Location::Swapped(_) => None,
        }
    }
}
