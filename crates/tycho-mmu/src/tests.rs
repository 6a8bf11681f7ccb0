use pretty_assertions::assert_eq;
use proptest::prelude::*;

use crate::priv_check::PrivCheckTable;
use crate::test_util::TestMemory;
use crate::{
    cached_permission_ok, is_canonical_48, lpf_of, AccessType, MemoryBus, Mmu, Tlb,
    TranslateFault, Walk, WalkEntry, CR0_PE, CR0_PG, CR4_PGE, PTE_A, PTE_D, PTE_G, PTE_P,
    TLB_GLOBAL_PAGE, TLB_NX_PAGE, TLB_READ_SYS_OK, TLB_READ_USER_OK, TLB_WRITE_SYS_OK,
    TLB_WRITE_USER_OK,
};

const PTE_RW: u64 = 1 << 1;
const PTE_US: u64 = 1 << 2;

#[test]
fn priv_check_matrix_matches_reference() {
    let table = PrivCheckTable::new();
    for i in 0..32usize {
        let wp = i & 0x10 != 0;
        let user_access = i & 0x08 != 0;
        let page_user = i & 0x04 != 0;
        let page_writable = i & 0x02 != 0;
        let write_access = i & 0x01 != 0;

        // 486+ semantics, spelled out the long way.
        let expected = if user_access {
            page_user && (!write_access || page_writable)
        } else if write_access && wp {
            page_writable
        } else {
            true
        };

        assert_eq!(table.allows(i), expected, "index {i:#07b}");
    }
}

fn seed_walk(user: bool, writable: bool, global: bool, nx: bool) -> Walk {
    let mut combined = 0;
    if user {
        combined |= 0x4;
    }
    if writable {
        combined |= 0x2;
    }
    if global {
        combined |= TLB_GLOBAL_PAGE;
    }
    Walk {
        ppf: 0x5000,
        combined,
        nx,
        wide: false,
        len: 1,
        entries: [WalkEntry::NONE; 4],
    }
}

#[test]
fn seeded_access_bits_follow_the_permission_matrix() {
    let mmu = Mmu::new();
    for bits in 0..16u32 {
        let user = bits & 1 != 0;
        let writable = bits & 2 != 0;
        let is_write = bits & 4 != 0;
        let nx = bits & 8 != 0;

        let walk = seed_walk(user, writable, false, nx);
        let access_bits = mmu.seed_access_bits(&walk, is_write);

        // Reads for the page's privilege class are always cached.
        assert_eq!(access_bits & TLB_READ_SYS_OK, TLB_READ_SYS_OK);
        assert_eq!(access_bits & TLB_READ_USER_OK != 0, user);

        // Write permission is only cached when this access wrote (and set
        // the dirty bit).
        if !is_write {
            assert_eq!(access_bits & (TLB_WRITE_SYS_OK | TLB_WRITE_USER_OK), 0);
        } else {
            assert_eq!(access_bits & TLB_WRITE_SYS_OK, TLB_WRITE_SYS_OK);
            assert_eq!(
                access_bits & TLB_WRITE_USER_OK != 0,
                user && writable,
                "user write rights need U/S and R/W"
            );
        }

        assert_eq!(access_bits & TLB_NX_PAGE != 0, nx);

        // Host-pointer bits are only ever set by the install path.
        assert_eq!(access_bits & 0xff, 0);
    }

    let global = mmu.seed_access_bits(&seed_walk(false, false, true, false), false);
    assert_ne!(global & TLB_GLOBAL_PAGE, 0);
}

#[test]
fn cached_permission_probe() {
    // Supervisor read-only install.
    let bits = TLB_READ_SYS_OK;
    for cpl in 0..3u8 {
        assert!(cached_permission_ok(bits, AccessType::Read, cpl));
        assert!(!cached_permission_ok(bits, AccessType::Write, cpl));
    }
    assert!(!cached_permission_ok(bits, AccessType::Read, 3));

    // Full user mapping.
    let bits = TLB_READ_SYS_OK | TLB_READ_USER_OK | TLB_WRITE_SYS_OK | TLB_WRITE_USER_OK;
    for cpl in 0..=3u8 {
        assert!(cached_permission_ok(bits, AccessType::Write, cpl));
        assert!(cached_permission_ok(bits, AccessType::Execute, cpl));
    }

    // The NX veto only affects fetches.
    let bits = bits | TLB_NX_PAGE;
    assert!(cached_permission_ok(bits, AccessType::Read, 3));
    assert!(!cached_permission_ok(bits, AccessType::Execute, 3));
}

#[test]
fn tlb_invalidate_clears_the_indexed_slot_unconditionally() {
    let mut tlb = Tlb::new();
    let laddr = 0x0123_4000u64;

    let slot = tlb.entry_mut(laddr);
    slot.lpf = lpf_of(laddr);
    slot.ppf = 0x9000;
    slot.access_bits = TLB_READ_SYS_OK;

    // An INVLPG for a *different* frame that maps to the same slot still
    // clears it: the slot index is all that matters.
    let aliased = laddr + (crate::TLB_SIZE as u64) * 0x1000;
    assert_eq!(Tlb::index_of(laddr), Tlb::index_of(aliased));
    tlb.invalidate_page(aliased);
    assert!(!tlb.entry(laddr).is_valid());
}

#[test]
fn tlb_flush_respects_global_entries() {
    let mut tlb = Tlb::new();

    let slot = tlb.entry_mut(0x1000);
    slot.lpf = 0x1000;
    slot.access_bits = TLB_READ_SYS_OK;

    let slot = tlb.entry_mut(0x2000);
    slot.lpf = 0x2000;
    slot.access_bits = TLB_READ_SYS_OK | TLB_GLOBAL_PAGE;

    tlb.flush(false);
    assert!(!tlb.entry(0x1000).is_valid());
    assert!(tlb.entry(0x2000).is_valid());
    for entry in tlb.iter_valid() {
        assert!(entry.is_global());
    }

    tlb.flush(true);
    assert_eq!(tlb.iter_valid().count(), 0);
}

/// Legacy two-level tables: PDE[0] at `cr3`, PT at 0x2000, data page 0x5000
/// (plus a second, global data page 0x6000 behind PTE[1]).
fn legacy_mmu(mem: &mut TestMemory) -> Mmu {
    mem.write_u32(0x1000, (0x2000 | PTE_P | PTE_RW | PTE_US) as u32);
    mem.write_u32(0x2000, (0x5000 | PTE_P | PTE_RW | PTE_US) as u32);
    mem.write_u32(0x2004, (0x6000 | PTE_P | PTE_RW | PTE_US | PTE_G) as u32);

    let mut mmu = Mmu::new();
    mmu.set_cr4(CR4_PGE);
    mmu.set_cr3(0x1000);
    mmu.set_cr0(CR0_PG | CR0_PE);
    mmu
}

#[test]
fn host_pointer_bits_are_a_subset_of_the_logical_bits() {
    let mut mem = TestMemory::with_host_pages(0x10000);
    let mut mmu = legacy_mmu(&mut mem);

    mmu.translate(&mut mem, 0x0000, AccessType::Read, 3).unwrap();
    mmu.translate(&mut mem, 0x1000, AccessType::Write, 0).unwrap();

    for entry in mmu.tlb().iter_valid() {
        let bits = entry.access_bits;
        for n in 0..8 {
            if bits & (1 << n) != 0 {
                assert_ne!(bits & (1 << (n + 8)), 0, "bit {n} set without bit {}", n + 8);
            }
        }
        // Host pages are exposed, so here the pointer bits mirror the
        // logical bits exactly.
        assert_eq!(bits & 0xff, (bits >> 8) & 0xff);
        assert!(entry.host_page().is_some());
    }
}

#[test]
fn vetoed_host_pointer_leaves_pointer_bits_clear() {
    let mut mem = TestMemory::with_host_pages(0x10000);
    mem.veto_write_page(0x5000);
    let mut mmu = legacy_mmu(&mut mem);

    mmu.translate(&mut mem, 0x0000, AccessType::Write, 0).unwrap();

    let entry = mmu.tlb().entry(0x0000);
    assert!(entry.is_valid());
    assert!(entry.host_page().is_none());
    assert_eq!(entry.access_bits & 0xff, 0);
    assert_ne!(entry.access_bits & TLB_WRITE_SYS_OK, 0);
}

#[test]
fn global_entries_survive_cr3_writes() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = legacy_mmu(&mut mem);

    mmu.translate(&mut mem, 0x0000, AccessType::Read, 0).unwrap();
    mmu.translate(&mut mem, 0x1000, AccessType::Read, 0).unwrap();
    assert!(!mmu.tlb().entry(0x0000).is_global());
    assert!(mmu.tlb().entry(0x1000).is_global());

    mmu.set_cr3(0x1000);
    assert!(!mmu.tlb().entry(0x0000).is_valid());
    assert!(mmu.tlb().entry(0x1000).is_valid());

    // CR0 writes that touch PG/WP/PE drop global entries too.
    mmu.set_cr0(CR0_PG | CR0_PE | crate::CR0_WP);
    assert_eq!(mmu.tlb().iter_valid().count(), 0);
}

#[test]
fn page_fault_invalidates_the_faulting_slot_and_sets_cr2() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = legacy_mmu(&mut mem);

    mmu.translate(&mut mem, 0x0000, AccessType::Read, 0).unwrap();
    assert!(mmu.tlb().entry(0x0000).is_valid());

    // Clear the PTE behind the engine's back; the cached entry still serves
    // reads, but a write (not cached) rewalks and faults.
    mem.write_u32(0x2000, 0);
    let fault = mmu
        .translate(&mut mem, 0x0000_0ABC, AccessType::Write, 0)
        .unwrap_err();
    match fault {
        TranslateFault::PageFault(pf) => {
            assert_eq!(pf.error_code, 0x02); // not-present, write, supervisor
            assert_eq!(pf.addr, 0x0ABC);
        }
        other => panic!("expected #PF, got {other:?}"),
    }
    assert_eq!(mmu.cr2(), 0x0ABC);
    assert!(!mmu.tlb().entry(0x0000).is_valid());
}

#[test]
fn accessed_and_dirty_bits_are_written_back() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = legacy_mmu(&mut mem);

    mmu.translate(&mut mem, 0x0000, AccessType::Read, 0).unwrap();
    assert_ne!(mem.read_u32(0x1000) as u64 & PTE_A, 0);
    assert_ne!(mem.read_u32(0x2000) as u64 & PTE_A, 0);
    assert_eq!(mem.read_u32(0x2000) as u64 & PTE_D, 0);

    mmu.translate(&mut mem, 0x0000, AccessType::Write, 0).unwrap();
    assert_ne!(mem.read_u32(0x2000) as u64 & PTE_D, 0);
    // The non-leaf level never takes a dirty bit.
    assert_eq!(mem.read_u32(0x1000) as u64 & PTE_D, 0);
}

proptest! {
    #[test]
    fn slot_index_ignores_the_page_offset(laddr in any::<u64>()) {
        prop_assert_eq!(Tlb::index_of(laddr), Tlb::index_of(lpf_of(laddr)));
        prop_assert!(Tlb::index_of(laddr) < crate::TLB_SIZE);
    }

    #[test]
    fn canonical_check_matches_sign_extension(laddr in any::<u64>()) {
        let top = laddr >> 47;
        let expected = top == 0 || top == 0x1_ffff;
        prop_assert_eq!(is_canonical_48(laddr), expected);
    }
}
