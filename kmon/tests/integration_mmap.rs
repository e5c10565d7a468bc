//! Integration tests for the guest memory manager and mmap engine.
//!
//! These run against plain process memory: the layout, translation, and
//! list machinery do not need a virtualization device, only the backing
//! reservation.

#![cfg(target_os = "linux")]

use kmon::filesys::NoFds;
use kmon::mem::MemManager;

const RW: i32 = libc::PROT_READ | libc::PROT_WRITE;
const ANON: i32 = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
const PAGE: u64 = 4096;

fn mgr() -> MemManager {
    MemManager::new(32 << 30).expect("layout")
}

#[test]
fn large_anonymous_map_touch_every_page() {
    let m = mgr();
    let baseline = m.busy_region_count();
    let size: u64 = 1020 << 20;

    let got = m.guest_mmap(&NoFds, 0, size, RW, ANON, -1, 0);
    assert!(got > 0, "mmap failed: {got}");
    let gva = got as u64;

    // One byte per page, all the way through.
    let mut page = 0;
    while page < size {
        assert!(m.write_obj::<u8>(gva + page, 0x5a), "write at +{page:#x}");
        page += PAGE;
    }
    assert_eq!(m.read_obj::<u8>(gva + size - PAGE), Some(0x5a));

    assert_eq!(m.guest_munmap(gva, size), 0);
    assert_eq!(m.busy_region_count(), baseline, "busy count back to baseline");
    m.mmap_check_invariants().unwrap();
}

#[test]
fn fixed_replacement_over_prot_none() {
    let m = mgr();
    let got = m.guest_mmap(&NoFds, 0, 1 << 30, libc::PROT_NONE, ANON, -1, 0);
    assert!(got > 0);
    let base = got as u64;

    let fixed = base + (100 << 20);
    let rc = m.guest_mmap(&NoFds, fixed, 200 << 20, RW, ANON | libc::MAP_FIXED, -1, 0);
    assert_eq!(rc, fixed as i64);

    // The gigabyte is now three pieces: NONE | RW | NONE.
    let regs: Vec<_> = m
        .busy_regions()
        .into_iter()
        .filter(|r| r.start >= base && r.start < base + (1 << 30))
        .collect();
    assert_eq!(regs.len(), 3);
    assert_eq!(regs[0].protection, libc::PROT_NONE);
    assert_eq!(regs[1].protection, RW);
    assert_eq!(regs[2].protection, libc::PROT_NONE);
    assert_eq!(regs[1].start, fixed);
    assert_eq!(regs[1].size, 200 << 20);

    // Reading inside the replaced window yields zero.
    assert_eq!(m.read_obj::<u64>(base + (200 << 20)), Some(0));
    m.mmap_check_invariants().unwrap();
}

#[test]
fn mixed_operation_sequence_keeps_invariants() {
    let m = mgr();
    let a = m.guest_mmap(&NoFds, 0, 64 << 20, RW, ANON, -1, 0) as u64;
    let b = m.guest_mmap(&NoFds, 0, 32 << 20, libc::PROT_READ, ANON, -1, 0) as u64;
    m.mmap_check_invariants().unwrap();

    assert_eq!(m.guest_mprotect(a + (8 << 20), 8 << 20, libc::PROT_READ), 0);
    m.mmap_check_invariants().unwrap();
    assert_eq!(m.guest_munmap(a + (16 << 20), 16 << 20), 0);
    m.mmap_check_invariants().unwrap();
    assert_eq!(m.guest_mprotect(b, 32 << 20, RW), 0);
    m.mmap_check_invariants().unwrap();

    let c = m.guest_mremap(b, 32 << 20, 48 << 20, libc::MREMAP_MAYMOVE);
    assert!(c > 0);
    m.mmap_check_invariants().unwrap();

    assert_eq!(m.guest_munmap(a, 64 << 20), 0);
    assert_eq!(m.guest_munmap(c as u64, 48 << 20), 0);
    m.mmap_check_invariants().unwrap();
}

#[test]
fn every_busy_region_is_accessible_at_its_protection() {
    let m = mgr();
    let a = m.guest_mmap(&NoFds, 0, 8 << 20, RW, ANON, -1, 0) as u64;
    let b = m.guest_mmap(&NoFds, 0, 4 << 20, libc::PROT_READ, ANON, -1, 0) as u64;
    assert!(m.mmap_prot_check(a, 8 << 20, RW));
    assert!(m.mmap_prot_check(b, 4 << 20, libc::PROT_READ));
    assert!(!m.mmap_prot_check(b, 4 << 20, libc::PROT_WRITE));
    for r in m.busy_regions() {
        if r.protection != libc::PROT_NONE {
            assert!(m.mmap_prot_check(r.start, r.size, r.protection), "region {:#x}", r.start);
        }
    }
}

#[test]
fn translation_is_its_own_inverse_on_mapped_memory() {
    let m = mgr();
    let a = m.guest_mmap(&NoFds, 0, 2 << 20, RW, ANON, -1, 0) as u64;
    for off in [0u64, 4096, (2 << 20) - 8] {
        let kma = m.gva_to_kma(a + off).expect("mapped");
        assert_eq!(m.kma_to_gva(kma).unwrap(), a + off);
    }
    // And fails fast outside.
    let bogus = 0x10usize as *mut u8;
    assert!(m.kma_to_gva(bogus).is_err());
}

#[test]
fn arena_reclaim_raises_tbrk() {
    let m = mgr();
    let t0 = m.tbrk();
    let a = m.guest_mmap(&NoFds, 0, 16 << 20, RW, ANON, -1, 0) as u64;
    let b = m.guest_mmap(&NoFds, 0, 16 << 20, RW, ANON, -1, 0) as u64;
    assert!(m.tbrk() < t0);
    // Freeing the upper one first leaves a free region not at tbrk.
    assert_eq!(m.guest_munmap(a, 16 << 20), 0);
    assert!(m.tbrk() < t0);
    // Freeing the bottom one merges down to tbrk and gives it all back.
    assert_eq!(m.guest_munmap(b, 16 << 20), 0);
    assert_eq!(m.tbrk(), t0);
    m.mmap_check_invariants().unwrap();
}
