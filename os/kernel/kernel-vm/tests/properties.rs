mod common;

use common::*;
use kernel_vm::fault::FaultOutcome;
use kernel_vm::{PAGE_SIZE, Page, PageKind, SwapSpace};
use proptest::prelude::*;

const DATA: u64 = 0x0804_8000;
const BSS: u64 = 0x0805_0000;
const MAP: u64 = 0x1000_0000;
const STACK: u64 = 0xBFFF_D000;

struct Tracked {
    addr: u64,
    writable: bool,
    expected: Vec<u8>,
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Under heavy memory pressure every page keeps the content last written
    /// to it, whatever mix of swapping, dropping and write-back happened.
    #[test]
    fn pages_keep_their_content_under_pressure(
        ops in proptest::collection::vec((0usize..10, any::<bool>(), 0usize..PAGE_SIZE, any::<u8>()), 1..120)
    ) {
        let rig = Rig::new(3, 32);
        let exe = MemStore::new(1, pattern(3 * PAGE_SIZE, 1));
        let mapped = MemStore::new(2, pattern(2 * PAGE_SIZE, 2));
        let (mut space, dir) = rig.space();

        space.register_segment(&store(&exe), 0, page(DATA), 3 * PAGE_SIZE, 0, true).unwrap();
        space.register_segment(&store(&exe), 0, page(BSS), 0, 2 * PAGE_SIZE, true).unwrap();
        space.mmap(&store(&mapped), MAP.into()).unwrap();
        space.setup_stack().unwrap();
        for addr in [STACK, STACK + 0x1000] {
            space.add_entry(page(addr), PageKind::Stack, None, 0, true).unwrap();
        }

        let mut pages = Vec::new();
        for i in 0..3 {
            let at = i * PAGE_SIZE;
            pages.push(Tracked { addr: DATA + at as u64, writable: true, expected: exe.contents()[at..at + PAGE_SIZE].to_vec() });
        }
        for i in 0..2 {
            pages.push(Tracked { addr: BSS + (i * PAGE_SIZE) as u64, writable: true, expected: vec![0; PAGE_SIZE] });
        }
        for i in 0..2 {
            let at = i * PAGE_SIZE;
            pages.push(Tracked { addr: MAP + at as u64, writable: true, expected: mapped.contents()[at..at + PAGE_SIZE].to_vec() });
        }
        for addr in [STACK, STACK + 0x1000, STACK + 0x2000] {
            pages.push(Tracked { addr, writable: true, expected: vec![0; PAGE_SIZE] });
        }

        for (index, write, offset, value) in ops {
            let tracked = &mut pages[index];
            let write = write && tracked.writable;
            if dir.mapping(page(tracked.addr)).is_none() {
                prop_assert_eq!(user_fault(&mut space, tracked.addr, write, 0), FaultOutcome::Resolved);
            }
            if write {
                rig.write_user(&dir, tracked.addr + offset as u64, &[value]);
                tracked.expected[offset] = value;
            } else {
                let actual: Page = rig.read_user(&dir, tracked.addr);
                prop_assert_eq!(&actual[..], &tracked.expected[..]);
            }
            prop_assert!(rig.frames.lock().audit().is_ok());
            prop_assert!(rig.pool.in_use() <= 3);
        }

        space.destroy().unwrap();
        prop_assert_eq!(rig.pool.in_use(), 0);
        prop_assert_eq!(rig.frames.swap().used_slots(), 0);
        let written = mapped.contents();
        for tracked in &pages[5..7] {
            let at = (tracked.addr - MAP) as usize;
            prop_assert_eq!(&written[at..at + PAGE_SIZE], &tracked.expected[..]);
        }
    }

    /// Slots come back byte-identical, in any order, and each swap-in frees
    /// exactly one slot.
    #[test]
    fn swap_round_trips_in_any_order(
        seeds in proptest::collection::vec(any::<u8>(), 1..8),
        order in any::<u64>()
    ) {
        let swap = SwapSpace::new(RamDisk::new(8)).unwrap();
        let pages: Vec<Page> = seeds
            .iter()
            .map(|seed| pattern(PAGE_SIZE, *seed).try_into().unwrap())
            .collect();
        let slots: Vec<_> = pages.iter().map(|p| swap.swap_out(p)).collect();
        prop_assert_eq!(swap.used_slots(), pages.len());

        let mut remaining: Vec<usize> = (0..pages.len()).collect();
        let mut state = order;
        while !remaining.is_empty() {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            let pick = remaining.swap_remove((state >> 33) as usize % remaining.len());
            let before = swap.used_slots();
            let mut back = [0u8; PAGE_SIZE];
            swap.swap_in(slots[pick], &mut back);
            prop_assert_eq!(&back[..], &pages[pick][..]);
            prop_assert_eq!(swap.used_slots(), before - 1);
            prop_assert!(!swap.is_used(slots[pick]));
        }
        prop_assert_eq!(swap.used_slots(), 0);
    }
}
