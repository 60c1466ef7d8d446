//! # Clock Eviction
//!
//! Second-chance replacement over the frame index. The hand skips empty and
//! pinned slots; a frame whose accessed bit is set in any owner's mapping has
//! the bit cleared in every owner and is passed over once. The first frame
//! found with no accessed bit becomes the victim and the hand moves past it.
//!
//! The victim is disposed of according to its policy. A modified mapped page
//! whose write-back falls short is swapped out instead, so that the only copy
//! of its content is not lost. The victim's pool page goes
//! straight to the allocation that triggered the eviction. The whole
//! scan-and-dispose sequence runs with the frame table lock held.

use crate::addresses::FrameNumber;
use crate::error::VmError;
use crate::frame::{FrameId, Location};
use crate::frame_table::{FrameTableGuard, directory, entry, entry_mut, forget_shared, release_id, write_back};
use crate::page::DisposalPolicy;
use log::{debug, warn};

/// Full rotations of the hand before giving up. One rotation clears every
/// accessed bit, so the second one finds a victim unless all frames are pinned.
const MAX_ROTATIONS: usize = 2;

/// The clock hand: the next frame index slot to inspect.
#[derive(Debug, Default, Clone, Copy)]
pub struct Clock {
    hand: usize,
}

impl Clock {
    /// Return the current slot and step past it.
    const fn advance(&mut self, len: usize) -> usize {
        let at = self.hand % len;
        self.hand = (at + 1) % len;
        at
    }
}

impl FrameTableGuard<'_> {
    /// Free one pool page by evicting an unpinned frame.
    ///
    /// # Errors
    /// [`VmError::AllocationFailure`] if every resident frame is pinned.
    pub(crate) fn evict(&mut self) -> Result<FrameNumber, VmError> {
        let (id, frame) = self.select_victim()?;
        self.dispose_victim(id, frame)?;
        Ok(frame)
    }

    fn select_victim(&mut self) -> Result<(FrameId, FrameNumber), VmError> {
        let state = &mut *self.state;
        let len = state.frame_index.len();
        if len == 0 {
            return Err(VmError::AllocationFailure);
        }

        for _ in 0..len * MAX_ROTATIONS {
            let at = state.clock.advance(len);
            let Some(id) = state.frame_index[at] else {
                continue;
            };
            let fte = entry(&state.entries, id)?;
            if fte.is_pinned() {
                continue;
            }

            let mut accessed = false;
            for owner in fte.owners.as_slice() {
                accessed |= directory(&state.spaces, owner.space)?.is_accessed(owner.page);
            }
            if accessed {
                for owner in fte.owners.as_slice() {
                    directory(&state.spaces, owner.space)?.set_accessed(owner.page, false);
                }
                continue;
            }
            return Ok((id, FrameNumber::new(at)));
        }

        warn!("clock found no evictable frame among {len}");
        Err(VmError::AllocationFailure)
    }

    fn dispose_victim(&mut self, id: FrameId, frame: FrameNumber) -> Result<(), VmError> {
        let table = self.table;
        let state = &mut *self.state;
        let fte = entry_mut(&mut state.entries, id)?;

        for owner in fte.owners.as_slice() {
            let dir = directory(&state.spaces, owner.space)?;
            fte.dirty |= dir.is_dirty(owner.page);
            dir.clear(owner.page);
        }

        let persist = match fte.policy() {
            DisposalPolicy::Swap => true,
            DisposalPolicy::SwapIfDirty => fte.dirty,
            DisposalPolicy::WriteIfDirty => fte.dirty && !write_back(&*table.pool, fte, frame),
            DisposalPolicy::Delete => false,
        };

        if persist {
            // SAFETY: every mapping of the frame was just cleared and the
            // table lock is held.
            let page = unsafe { table.pool.frame_mut(frame) };
            let slot = table.swap.swap_out(page);
            fte.location = Location::Swapped(slot);
            state.counters.swap_outs += 1;
            debug!("evicted {id:?} from {frame:?} to {slot:?}");
        } else {
            for owner in fte.owners.as_slice() {
                state.links.remove(owner);
            }
            let Some(fte) = state.entries[id.index()].take() else {
                return Err(VmError::KernelInvariantViolation("stale frame handle"));
            };
            forget_shared(state, &fte, id);
            release_id(state, id);
            debug!("evicted {id:?} from {frame:?}, discarded ({:?})", fte.policy());
        }

        state.frame_index[frame.index()] = None;
        state.counters.evictions += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hand_wraps_around() {
        let mut clock = Clock::default();
        assert_eq!(clock.advance(3), 0);
        assert_eq!(clock.advance(3), 1);
        assert_eq!(clock.advance(3), 2);
        assert_eq!(clock.advance(3), 0);
        assert_eq!(clock.advance(2), 1);
        assert_eq!(clock.advance(2), 0);
    }
}
