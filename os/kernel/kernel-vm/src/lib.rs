//! # User Virtual Memory
//!
//! Demand paging for user address spaces: page-fault resolution, a system-wide
//! frame table that multiplexes the user frame pool across processes, sharing
//! of read-only and file-backed pages, clock (second-chance) eviction and a
//! bitmap-indexed swap area on a dedicated block device.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │              Page-Fault Resolution ([`fault`])               │
//! │    • fault register capture, stack growth, buffer pinning    │
//! └───────────────┬──────────────────────────────────────────────┘
//!                 │ per process
//! ┌───────────────▼──────────────────────────────────────────────┐
//! │   Address Space ([`space`]) = Supplemental Page Table ([`spt`])
//! │    • virtual page → backing store, kind, permissions         │
//! │    • loader segments, initial stack, mmap regions ([`mmap`]) │
//! └───────────────┬──────────────────────────────────────────────┘
//!                 │ all cross-process access goes through the monitor
//! ┌───────────────▼──────────────────────────────────────────────┐
//! │              Frame Table ([`frame_table`])                   │
//! │    • frame index, shared-frame index, owner back-links       │
//! │    • pinning, disposal policy, clock eviction ([`evict`])    │
//! └───────────────┬──────────────────────────────────────────────┘
//!                 │
//! ┌───────────────▼──────────────────────────────────────────────┐
//! │               Swap Space ([`swap`])                          │
//! │    • one bitmap bit per page-sized slot, own lock            │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Collaborators
//!
//! The crate never touches hardware directly. Everything it needs from the
//! rest of the kernel is expressed as a trait in [`hal`]:
//!
//! * [`PhysicalPool`](hal::PhysicalPool): the user frame allocator and access to frame contents.
//! * [`PageDirectory`](hal::PageDirectory): mapping install/clear and the accessed/dirty bits.
//! * [`BackingStore`](hal::BackingStore): files (inodes) that pages are loaded from and written back to.
//! * [`BlockDevice`](hal::BlockDevice): the swap partition.
//! * [`FaultRegisters`](hal::FaultRegisters): the faulting address register and the interrupt flag.
//!
//! ## Locking
//!
//! One [`FrameTable`] lock serializes every frame-index, shared-index, owner
//! and pin-count change, including the whole eviction scan. The swap bitmap
//! has its own, strictly narrower lock. Supplemental page tables are owned by
//! their address space and have no lock; the frame back-links they would need
//! for cross-process eviction live inside the frame table instead.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use alloc::sync::Arc;
//! use kernel_vm::{AddressSpace, FrameTable, VmConfig, fault};
//!
//! let frames = Arc::new(FrameTable::new(Box::new(pool), Box::new(swap_disk))?);
//! let mut space = AddressSpace::new(Arc::clone(&frames), page_directory, VmConfig::default())?;
//! space.register_segment(executable, 0, text_page, 0x1234, 0x1dcc, false)?;
//! let esp = space.setup_stack()?;
//!
//! // from the #PF handler
//! match fault::page_fault(&cpu, &mut space, code, esp) {
//!     fault::FaultOutcome::Resolved => {}
//!     fault::FaultOutcome::TerminateProcess(err) => process_exit(-1),
//! }
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod addresses;
pub mod config;
mod error;
pub mod evict;
pub mod fault;
pub mod frame;
pub mod frame_table;
pub mod hal;
pub mod mmap;
pub mod page;
pub mod space;
pub mod spt;
pub mod swap;

pub use crate::addresses::{FrameNumber, PAGE_SIZE, Page, UserAddress, UserPage};
pub use crate::config::VmConfig;
pub use crate::error::{Severity, VmError};
pub use crate::frame::{FrameEntry, FrameId, Location, Owner, Owners, SpaceId};
pub use crate::frame_table::{FrameStats, FrameTable, FrameTableGuard};
pub use crate::page::{Backing, DisposalPolicy, PageEntry, PageKind, ShareKey};
pub use crate::space::AddressSpace;
pub use crate::spt::SupplementalPageTable;
pub use crate::swap::{SwapSlot, SwapSpace};
