#![allow(dead_code)]

use kernel_vm::config::SECTOR_SIZE;
use kernel_vm::fault::{self, Fault, FaultCode, FaultOutcome};
use kernel_vm::hal::{BackingStore, BlockDevice, FaultRegisters, PageDirectory, PhysicalPool, StoreId};
use kernel_vm::{AddressSpace, FrameNumber, FrameTable, PAGE_SIZE, Page, UserAddress, UserPage, VmConfig};
use std::cell::UnsafeCell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A user pool of `n` frames held in host memory.
#[derive(Clone)]
pub struct FakePool(Arc<PoolInner>);

struct PoolInner {
    pages: Box<[UnsafeCell<Page>]>,
    used: Mutex<Vec<bool>>,
}

// Frame contents are only touched through `frame_mut`, whose callers hold
// the frame table lock, or from the single test thread.
unsafe impl Sync for PoolInner {}

impl FakePool {
    pub fn new(frames: usize) -> Self {
        Self(Arc::new(PoolInner {
            pages: (0..frames).map(|_| UnsafeCell::new([0; PAGE_SIZE])).collect(),
            used: Mutex::new(vec![false; frames]),
        }))
    }

    pub fn in_use(&self) -> usize {
        self.0.used.lock().unwrap().iter().filter(|u| **u).count()
    }

    pub fn read(&self, frame: FrameNumber) -> Page {
        unsafe { *self.0.pages[frame.index()].get() }
    }

    pub fn write(&self, frame: FrameNumber, offset: usize, bytes: &[u8]) {
        let page = unsafe { &mut *self.0.pages[frame.index()].get() };
        page[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

impl PhysicalPool for FakePool {
    fn frame_count(&self) -> usize {
        self.0.pages.len()
    }

    fn get_page(&self, zeroed: bool) -> Option<FrameNumber> {
        let mut used = self.0.used.lock().unwrap();
        let at = used.iter().position(|u| !*u)?;
        used[at] = true;
        let frame = FrameNumber::new(at);
        if zeroed {
            unsafe { (*self.0.pages[at].get()).fill(0) };
        } else {
            // Stale garbage, so that missing zero-fills show up.
            unsafe { (*self.0.pages[at].get()).fill(0xCC) };
        }
        Some(frame)
    }

    fn free_page(&self, frame: FrameNumber) {
        let mut used = self.0.used.lock().unwrap();
        assert!(used[frame.index()], "double free of {frame:?}");
        used[frame.index()] = false;
    }

    unsafe fn frame_mut<'a>(&self, frame: FrameNumber) -> &'a mut Page {
        unsafe { &mut *self.0.pages[frame.index()].get() }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Pte {
    pub frame: FrameNumber,
    pub writable: bool,
    pub accessed: bool,
    pub dirty: bool,
}

/// A page directory that records mappings and lets tests play hardware.
#[derive(Default)]
pub struct FakeDirectory {
    ptes: Mutex<BTreeMap<UserPage, Pte>>,
    fail_next_install: AtomicBool,
}

impl FakeDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn mapping(&self, page: UserPage) -> Option<Pte> {
        self.ptes.lock().unwrap().get(&page).copied()
    }

    pub fn mapped(&self) -> usize {
        self.ptes.lock().unwrap().len()
    }

    pub fn fail_next_install(&self) {
        self.fail_next_install.store(true, Ordering::SeqCst);
    }

    /// What the MMU does on an access through a present mapping.
    pub fn touch(&self, page: UserPage, write: bool) {
        let mut ptes = self.ptes.lock().unwrap();
        let pte = ptes.get_mut(&page).expect("touching an unmapped page");
        pte.accessed = true;
        pte.dirty |= write;
    }
}

impl PageDirectory for FakeDirectory {
    fn install(&self, page: UserPage, frame: FrameNumber, writable: bool) -> bool {
        if self.fail_next_install.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.ptes.lock().unwrap().insert(
            page,
            Pte {
                frame,
                writable,
                accessed: false,
                dirty: false,
            },
        );
        true
    }

    fn clear(&self, page: UserPage) {
        self.ptes.lock().unwrap().remove(&page);
    }

    fn is_accessed(&self, page: UserPage) -> bool {
        self.mapping(page).is_some_and(|pte| pte.accessed)
    }

    fn set_accessed(&self, page: UserPage, accessed: bool) {
        if let Some(pte) = self.ptes.lock().unwrap().get_mut(&page) {
            pte.accessed = accessed;
        }
    }

    fn is_dirty(&self, page: UserPage) -> bool {
        self.mapping(page).is_some_and(|pte| pte.dirty)
    }
}

/// An in-memory file.
pub struct MemStore {
    id: StoreId,
    data: Mutex<Vec<u8>>,
    read_limit: Option<usize>,
    write_limit: Option<usize>,
    writes: AtomicUsize,
}

impl MemStore {
    fn build(id: u64, data: Vec<u8>, read_limit: Option<usize>, write_limit: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            id: StoreId(id),
            data: Mutex::new(data),
            read_limit,
            write_limit,
            writes: AtomicUsize::new(0),
        })
    }

    pub fn new(id: u64, data: Vec<u8>) -> Arc<Self> {
        Self::build(id, data, None, None)
    }

    /// A file whose reads never return more than `limit` bytes.
    pub fn truncated(id: u64, data: Vec<u8>, limit: usize) -> Arc<Self> {
        Self::build(id, data, Some(limit), None)
    }

    /// A file whose writes never store more than `limit` bytes.
    pub fn with_write_limit(id: u64, data: Vec<u8>, limit: usize) -> Arc<Self> {
        Self::build(id, data, None, Some(limit))
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl BackingStore for MemStore {
    fn id(&self) -> StoreId {
        self.id
    }

    fn len(&self) -> u64 {
        self.data.lock().unwrap().len() as u64
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        let data = self.data.lock().unwrap();
        let start = (offset as usize).min(data.len());
        let n = buf
            .len()
            .min(data.len() - start)
            .min(self.read_limit.unwrap_or(usize::MAX));
        buf[..n].copy_from_slice(&data[start..start + n]);
        n
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> usize {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut data = self.data.lock().unwrap();
        let start = (offset as usize).min(data.len());
        let n = buf
            .len()
            .min(data.len() - start)
            .min(self.write_limit.unwrap_or(usize::MAX));
        data[start..start + n].copy_from_slice(&buf[..n]);
        n
    }
}

/// A swap partition of `slots` page-sized slots.
pub struct RamDisk(Mutex<Vec<u8>>);

impl RamDisk {
    pub fn new(slots: usize) -> Box<Self> {
        Box::new(Self(Mutex::new(vec![0; slots * PAGE_SIZE])))
    }
}

impl BlockDevice for RamDisk {
    fn sector_count(&self) -> u32 {
        (self.0.lock().unwrap().len() / SECTOR_SIZE) as u32
    }

    fn read_sector(&self, sector: u32, buf: &mut [u8]) {
        let at = sector as usize * SECTOR_SIZE;
        buf.copy_from_slice(&self.0.lock().unwrap()[at..at + SECTOR_SIZE]);
    }

    fn write_sector(&self, sector: u32, buf: &[u8]) {
        let at = sector as usize * SECTOR_SIZE;
        self.0.lock().unwrap()[at..at + SECTOR_SIZE].copy_from_slice(buf);
    }
}

/// CPU registers of a faulting thread; records the order of accesses.
pub struct FakeRegisters {
    pub address: UserAddress,
    pub calls: Mutex<Vec<&'static str>>,
}

impl FakeRegisters {
    pub fn new(address: u64) -> Self {
        Self {
            address: UserAddress::new(address),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl FaultRegisters for FakeRegisters {
    fn fault_address(&self) -> UserAddress {
        self.calls.lock().unwrap().push("cr2");
        self.address
    }

    fn enable_interrupts(&self) {
        self.calls.lock().unwrap().push("sti");
    }
}

/// A frame table over a fake pool and RAM disk.
pub struct Rig {
    pub pool: FakePool,
    pub frames: Arc<FrameTable>,
}

impl Rig {
    pub fn new(frames: usize, swap_slots: usize) -> Self {
        let pool = FakePool::new(frames);
        let frames = Arc::new(FrameTable::new(Box::new(pool.clone()), RamDisk::new(swap_slots)).unwrap());
        Self { pool, frames }
    }

    pub fn space(&self) -> (AddressSpace, Arc<FakeDirectory>) {
        self.space_with(VmConfig::default())
    }

    pub fn space_with(&self, config: VmConfig) -> (AddressSpace, Arc<FakeDirectory>) {
        let dir = FakeDirectory::new();
        let space = AddressSpace::new(Arc::clone(&self.frames), dir.clone(), config).unwrap();
        (space, dir)
    }

    pub fn audit(&self) {
        self.frames.lock().audit().unwrap();
    }

    /// Contents of the frame a page currently occupies.
    pub fn contents(&self, space: &AddressSpace, addr: u64) -> Page {
        let frames = self.frames.lock();
        let id = frames
            .frame_of(space.id(), page(addr))
            .expect("page has no frame");
        let frame = frames.entry(id).unwrap().resident_frame().expect("frame is swapped");
        self.pool.read(frame)
    }

    /// Write through the MMU, as a user process would.
    pub fn write_user(&self, dir: &FakeDirectory, addr: u64, bytes: &[u8]) {
        let va = UserAddress::new(addr);
        let pte = dir.mapping(va.page()).expect("page not mapped");
        assert!(pte.writable, "write to read-only mapping");
        self.pool.write(pte.frame, va.offset(), bytes);
        dir.touch(va.page(), true);
    }

    /// Read a whole page through the MMU.
    pub fn read_user(&self, dir: &FakeDirectory, addr: u64) -> Page {
        let va = UserAddress::new(addr);
        let pte = dir.mapping(va.page()).expect("page not mapped");
        dir.touch(va.page(), false);
        self.pool.read(pte.frame)
    }
}

pub fn page(addr: u64) -> UserPage {
    UserAddress::new(addr).page()
}

pub fn store(file: &Arc<MemStore>) -> Arc<dyn BackingStore> {
    file.clone()
}

/// Deterministic, non-zero file content.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed) | 1)
        .collect()
}

/// A user-mode fault.
pub fn user_fault(space: &mut AddressSpace, addr: u64, write: bool, esp: u64) -> FaultOutcome {
    fault::handle(
        space,
        Fault {
            address: UserAddress::new(addr),
            code: FaultCode::new().with_user(true).with_write(write),
            user_esp: UserAddress::new(esp),
        },
    )
}

/// A user-mode read fault far away from the stack.
pub fn touch(space: &mut AddressSpace, addr: u64) -> FaultOutcome {
    user_fault(space, addr, false, 0xBFFF_FF00)
}
