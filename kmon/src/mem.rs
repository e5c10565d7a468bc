//! Guest memory layout and translation.
//!
//! The guest sees a flat space split at mid-physmem `M` (half of the
//! configured maximum): `[GUEST_MEM_START_VA, M)` grows upward from the
//! program break, and the mmap arena grows downward from the top, with the
//! topmost 2 MiB reserved for monitor-injected pages (VDSO, trampolines,
//! IDT stubs). Physical regions presented to the driver double in size from
//! 2 MiB up to `M/2` in the bottom zone and halve mirror-symmetrically in
//! the top zone, so the slot for any address falls out of leading-zeros
//! arithmetic — no linear scan.
//!
//! The whole guest space is one contiguous anonymous `MAP_NORESERVE`
//! reservation in the monitor, which makes `gva → kma` a single add and
//! keeps the region table immutable after VM creation (safe to read from
//! any thread).

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use vm_memory::MmapRegion;

use crate::error::MemError;
use crate::mmap::MmapCb;
use crate::{Gva, KM_PAGE_SIZE, Kma, rounddown, roundup, x86};

/// Lowest payload-visible guest address.
pub const GUEST_MEM_START_VA: Gva = 2 << 20;

/// Size of the monitor-reserved area at the very top of the guest space.
pub const MONITOR_RESERVED_SIZE: u64 = 2 << 20;

/// Smallest supported guest physical memory size.
pub const GUEST_MIN_PHYSMEM: u64 = 32 << 20;

/// Largest supported guest physical memory size. Bounded by the number of
/// 2 MiB-leaf page-directory pages that fit in the reserved slot.
pub const GUEST_MAX_PHYSMEM: u64 = 256 << 30;

/// A physical memory slot presented to the virtualization driver.
#[derive(Debug, Clone, Copy)]
pub struct PhysRegion {
    /// Driver slot id.
    pub slot: u32,
    /// First guest-physical byte.
    pub guest_base: u64,
    /// Region size in bytes.
    pub size: u64,
    /// Offset of the region within the monitor backing reservation.
    pub host_offset: u64,
}

/// The guest memory manager.
///
/// Owns the backing reservation, the physical region table (fixed at
/// creation), the program break pair, and the mmap control block.
pub struct MemManager {
    backing: MmapRegion,
    regions: Vec<PhysRegion>,
    max_physmem: u64,
    mid: u64,
    mid_idx: usize,
    last_idx: usize,
    /// Program break: highest used address of the bottom zone.
    brk: AtomicU64,
    /// Top break: lowest address of the mmap arena.
    tbrk: AtomicU64,
    /// Serializes brk/tbrk movement (values themselves are lock-free reads).
    brk_mutex: Mutex<()>,
    /// The mmap engine control block (busy/free lists, own mutex).
    pub(crate) mmaps: MmapCb,
}

// SAFETY: the raw backing pointer is only dereferenced through translation
// methods; the reservation itself is immutable after creation.
unsafe impl Send for MemManager {}
// SAFETY: see above; interior mutability is confined to atomics and mutexes.
unsafe impl Sync for MemManager {}

impl MemManager {
    /// Creates the layout for `max_physmem` bytes of guest memory, reserves
    /// the backing, and initializes the reserved slot (GDT, IDT, page
    /// tables).
    ///
    /// # Errors
    ///
    /// Fails if the size is unsupported or the reservation cannot be made.
    pub fn new(max_physmem: u64) -> Result<Self, MemError> {
        if !max_physmem.is_power_of_two() {
            return Err(MemError::BadSize { size: max_physmem, reason: "must be a power of two" });
        }
        if !(GUEST_MIN_PHYSMEM..=GUEST_MAX_PHYSMEM).contains(&max_physmem) {
            return Err(MemError::BadSize { size: max_physmem, reason: "outside supported range" });
        }

        let mid = max_physmem / 2;
        let mid_idx = (63 - mid.leading_zeros() as usize) - 21; // slots 1..=mid_idx
        let last_idx = 2 * mid_idx + 1;

        let backing = MmapRegion::build(
            None,
            max_physmem as usize,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
        )
        .map_err(|_| MemError::Backing { slot: 0, size: max_physmem })?;

        let mut regions = Vec::with_capacity(last_idx + 1);
        regions.push(PhysRegion {
            slot: 0,
            guest_base: x86::RSV_MEM_START,
            size: x86::RSV_MEM_SIZE,
            host_offset: x86::RSV_MEM_START,
        });
        for i in 1..=mid_idx {
            let base = 1u64 << (20 + i);
            regions.push(PhysRegion { slot: i as u32, guest_base: base, size: base, host_offset: base });
        }
        for j in 1..=mid_idx {
            let m = mid_idx - j + 1;
            let base = max_physmem - (1u64 << (21 + m));
            let size = 1u64 << (20 + m);
            regions.push(PhysRegion {
                slot: (mid_idx + j) as u32,
                guest_base: base,
                size,
                host_offset: base,
            });
        }
        regions.push(PhysRegion {
            slot: last_idx as u32,
            guest_base: max_physmem - MONITOR_RESERVED_SIZE,
            size: MONITOR_RESERVED_SIZE,
            host_offset: max_physmem - MONITOR_RESERVED_SIZE,
        });

        let tbrk_init = max_physmem - MONITOR_RESERVED_SIZE;
        let mem = Self {
            backing,
            regions,
            max_physmem,
            mid,
            mid_idx,
            last_idx,
            brk: AtomicU64::new(GUEST_MEM_START_VA),
            tbrk: AtomicU64::new(tbrk_init),
            brk_mutex: Mutex::new(()),
            mmaps: MmapCb::new(),
        };

        // SAFETY: the reserved area sits inside the freshly created backing
        // and the page-directory pages for max_physmem fit in it (checked by
        // the GUEST_MAX_PHYSMEM bound above).
        unsafe {
            let rsv = mem.backing.as_ptr().add(x86::RSV_MEM_START as usize);
            x86::init_gdt_idt(rsv);
            x86::init_pml4(rsv, max_physmem);
        }
        tracing::info!(
            target: "mem",
            max_physmem = format_args!("{max_physmem:#x}"),
            mid = format_args!("{:#x}", mem.mid),
            slots = mem.regions.len(),
            "guest memory layout created"
        );
        Ok(mem)
    }

    /// The physical region table, for driver installation and snapshot.
    #[must_use]
    pub fn regions(&self) -> &[PhysRegion] {
        &self.regions
    }

    /// Monitor address of a region's first byte.
    #[must_use]
    pub fn region_host_addr(&self, reg: &PhysRegion) -> u64 {
        self.backing.as_ptr() as u64 + reg.host_offset
    }

    /// Configured maximum guest physical memory.
    #[must_use]
    pub fn max_physmem(&self) -> u64 {
        self.max_physmem
    }

    /// The mid-address splitting the two zones.
    #[must_use]
    pub fn mid(&self) -> u64 {
        self.mid
    }

    /// Current program break.
    #[must_use]
    pub fn brk(&self) -> Gva {
        self.brk.load(Ordering::Acquire)
    }

    /// Current top break (lowest mmap-arena address).
    #[must_use]
    pub fn tbrk(&self) -> Gva {
        self.tbrk.load(Ordering::Acquire)
    }

    /// Slot index for a guest address. The address must be payload-visible
    /// (`GUEST_MEM_START_VA ≤ gva < max_physmem`).
    #[must_use]
    pub fn gva_to_slot(&self, gva: Gva) -> usize {
        debug_assert!((GUEST_MEM_START_VA..self.max_physmem).contains(&gva));
        if gva < self.mid {
            (63 - gva.leading_zeros() as usize) - 20
        } else {
            let d = self.max_physmem - gva;
            if d <= MONITOR_RESERVED_SIZE {
                return self.last_idx;
            }
            let m = (63 - (d - 1).leading_zeros() as usize) - 20;
            self.mid_idx + (self.mid_idx - m + 1)
        }
    }

    /// Translates a guest virtual address to the monitor address mapping
    /// the same byte, or `None` if the address is outside the union of the
    /// currently installed zones. Never traps.
    #[must_use]
    pub fn gva_to_kma(&self, gva: Gva) -> Option<Kma> {
        let in_bottom = (GUEST_MEM_START_VA..self.brk()).contains(&gva);
        let in_top = (self.tbrk()..self.max_physmem).contains(&gva);
        if !in_bottom && !in_top {
            return None;
        }
        // SAFETY: gva < max_physmem, so the offset stays inside the backing
        // reservation.
        Some(unsafe { self.backing.as_ptr().add(gva as usize) })
    }

    /// Like [`Self::gva_to_kma`] but skips the zone check. Only for
    /// addresses already validated on this call path.
    #[must_use]
    pub fn gva_to_kma_nocheck(&self, gva: Gva) -> Kma {
        debug_assert!(gva < self.max_physmem);
        // SAFETY: callers pass addresses below max_physmem (debug-asserted),
        // which stay inside the backing reservation.
        unsafe { self.backing.as_ptr().add(gva as usize) }
    }

    /// Inverse translation. Fails fast on a monitor address outside the
    /// guest backing.
    ///
    /// # Errors
    ///
    /// Returns [`MemError::BadKma`] for addresses outside the reservation.
    pub fn kma_to_gva(&self, kma: Kma) -> Result<Gva, MemError> {
        let base = self.backing.as_ptr() as u64;
        let addr = kma as u64;
        if addr < base || addr >= base + self.max_physmem {
            return Err(MemError::BadKma { kma: addr });
        }
        Ok(addr - base)
    }

    /// Sets the program break. `newbrk == 0` queries the current value.
    /// Returns the resulting break, or a negative errno the way the guest
    /// expects it.
    pub fn set_brk(&self, newbrk: Gva) -> i64 {
        if newbrk == 0 {
            return self.brk() as i64;
        }
        let _g = self.brk_mutex.lock().expect("brk mutex poisoned");
        let cur = self.brk();
        let want = roundup(newbrk, KM_PAGE_SIZE);
        if newbrk < GUEST_MEM_START_VA || want > self.mid {
            return -(libc::ENOMEM as i64);
        }
        if want < cur {
            // Release the pages so a later re-extension reads zeros again.
            // SAFETY: [want, cur) lies inside the backing reservation.
            unsafe {
                libc::madvise(
                    self.backing.as_ptr().add(want as usize).cast::<libc::c_void>(),
                    (cur - want) as usize,
                    libc::MADV_DONTNEED,
                );
            }
        }
        self.brk.store(want, Ordering::Release);
        tracing::debug!(target: "mem", brk = format_args!("{want:#x}"), "brk moved");
        newbrk as i64
    }

    /// Moves the top break. `want == 0` queries the current value. Growth
    /// (downward) and reclaim (upward) are both clamped to the arena zone.
    /// Returns the resulting tbrk, or a negative errno.
    pub(crate) fn mem_tbrk(&self, want: Gva) -> i64 {
        if want == 0 {
            return self.tbrk() as i64;
        }
        let _g = self.brk_mutex.lock().expect("brk mutex poisoned");
        let cur = self.tbrk();
        let want = rounddown(want, KM_PAGE_SIZE);
        if want < self.mid || want > self.max_physmem - MONITOR_RESERVED_SIZE {
            return -(libc::ENOMEM as i64);
        }
        if want > cur {
            // Arena shrank: release the reclaimed range.
            // SAFETY: [cur, want) lies inside the backing reservation.
            unsafe {
                libc::madvise(
                    self.backing.as_ptr().add(cur as usize).cast::<libc::c_void>(),
                    (want - cur) as usize,
                    libc::MADV_DONTNEED,
                );
            }
        }
        self.tbrk.store(want, Ordering::Release);
        tracing::debug!(target: "mem", tbrk = format_args!("{want:#x}"), "tbrk moved");
        want as i64
    }

    /// Adopts another manager's break pair and copies both zones' contents
    /// into this backing. Used by the fork child, whose fresh VM needs the
    /// parent's (copy-on-write) guest memory under a new reservation.
    pub(crate) fn adopt_contents_from(&self, other: &MemManager) {
        debug_assert_eq!(self.max_physmem, other.max_physmem);
        let brk = other.brk();
        let tbrk = other.tbrk();
        self.brk.store(brk, Ordering::Release);
        self.tbrk.store(tbrk, Ordering::Release);
        let bottom = (GUEST_MEM_START_VA, brk);
        let top = (tbrk, self.max_physmem);
        for (lo, hi) in [bottom, top] {
            if hi <= lo {
                continue;
            }
            // Parts of the arena sit PROT_NONE (free regions); loosen the
            // source so the copy can read it. The mmap lists are re-applied
            // onto the new backing right after this.
            // SAFETY: both reservations span max_physmem and the ranges lie
            // inside them; the source is this process's quiesced pre-fork
            // image.
            unsafe {
                libc::mprotect(
                    other.backing.as_ptr().add(lo as usize).cast::<libc::c_void>(),
                    (hi - lo) as usize,
                    libc::PROT_READ,
                );
                std::ptr::copy_nonoverlapping(
                    other.backing.as_ptr().add(lo as usize),
                    self.backing.as_ptr().add(lo as usize),
                    (hi - lo) as usize,
                );
            }
        }
    }

    /// Reads a plain-data value from guest memory. `None` if any byte of
    /// the value is unmapped.
    #[must_use]
    pub fn read_obj<T: Copy>(&self, gva: Gva) -> Option<T> {
        let size = std::mem::size_of::<T>() as u64;
        let p = self.gva_to_kma(gva)?;
        self.gva_to_kma(gva + size - 1)?;
        // SAFETY: both ends of the value translated, and the backing is one
        // contiguous mapping, so the whole range is readable.
        Some(unsafe { p.cast::<T>().read_unaligned() })
    }

    /// Writes a plain-data value into guest memory. `false` if unmapped.
    pub fn write_obj<T: Copy>(&self, gva: Gva, val: T) -> bool {
        let size = std::mem::size_of::<T>() as u64;
        let Some(p) = self.gva_to_kma(gva) else { return false };
        if self.gva_to_kma(gva + size - 1).is_none() {
            return false;
        }
        // SAFETY: both ends translated; contiguous backing.
        unsafe { p.cast::<T>().write_unaligned(val) };
        true
    }

    /// Copies bytes out of guest memory. `None` if the range is unmapped.
    #[must_use]
    pub fn read_bytes(&self, gva: Gva, len: usize) -> Option<Vec<u8>> {
        if len == 0 {
            return Some(Vec::new());
        }
        let p = self.gva_to_kma(gva)?;
        self.gva_to_kma(gva + len as u64 - 1)?;
        let mut out = vec![0u8; len];
        // SAFETY: both ends translated; contiguous backing.
        unsafe { std::ptr::copy_nonoverlapping(p, out.as_mut_ptr(), len) };
        Some(out)
    }

    /// Reads a NUL-terminated guest string of at most `max` bytes.
    #[must_use]
    pub fn read_cstr(&self, gva: Gva, max: usize) -> Option<String> {
        let mut out = Vec::new();
        for i in 0..max as u64 {
            let b: u8 = self.read_obj(gva + i)?;
            if b == 0 {
                return String::from_utf8(out).ok();
            }
            out.push(b);
        }
        None
    }

    /// Copies bytes into guest memory. `false` if the range is unmapped.
    pub fn write_bytes(&self, gva: Gva, data: &[u8]) -> bool {
        if data.is_empty() {
            return true;
        }
        let Some(p) = self.gva_to_kma(gva) else { return false };
        if self.gva_to_kma(gva + data.len() as u64 - 1).is_none() {
            return false;
        }
        // SAFETY: both ends translated; contiguous backing.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), p, data.len()) };
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mgr() -> MemManager {
        MemManager::new(32 << 30).expect("layout")
    }

    #[test]
    fn rejects_bad_sizes() {
        assert!(MemManager::new((32 << 30) + 1).is_err());
        assert!(MemManager::new(16 << 20).is_err());
        assert!(MemManager::new(512 << 30).is_err());
    }

    #[test]
    fn regions_tile_the_space() {
        let m = mgr();
        let regs = m.regions();
        // Slot 0 covers the reserved area below 2 MiB.
        assert_eq!(regs[0].guest_base, KM_PAGE_SIZE);
        // Payload regions tile [2 MiB, max) without gaps or overlap.
        let mut expect = GUEST_MEM_START_VA;
        for r in &regs[1..] {
            assert_eq!(r.guest_base, expect, "gap before slot {}", r.slot);
            expect = r.guest_base + r.size;
        }
        assert_eq!(expect, m.max_physmem());
        // Mirror symmetry: sizes read the same from both ends.
        let sizes: Vec<u64> = regs[1..regs.len() - 1].iter().map(|r| r.size).collect();
        let mut rev = sizes.clone();
        rev.reverse();
        assert_eq!(sizes, rev);
    }

    #[test]
    fn slot_arithmetic_matches_regions() {
        let m = mgr();
        for r in &m.regions()[1..] {
            for gva in [r.guest_base, r.guest_base + r.size / 2, r.guest_base + r.size - 1] {
                let slot = m.gva_to_slot(gva);
                assert_eq!(slot as u32, r.slot, "gva {gva:#x}");
            }
        }
    }

    #[test]
    fn translation_respects_zones() {
        let m = mgr();
        assert!(m.gva_to_kma(GUEST_MEM_START_VA).is_none(), "brk starts empty");
        assert_eq!(m.set_brk(GUEST_MEM_START_VA + 0x1000), (GUEST_MEM_START_VA + 0x1000) as i64);
        let kma = m.gva_to_kma(GUEST_MEM_START_VA).expect("mapped after brk move");
        assert_eq!(m.kma_to_gva(kma).unwrap(), GUEST_MEM_START_VA);
        // Top zone: monitor-reserved area is translatable.
        assert!(m.gva_to_kma(m.max_physmem() - 0x1000).is_some());
        // The hole between brk and tbrk is not.
        assert!(m.gva_to_kma(m.mid()).is_none());
    }

    #[test]
    fn brk_bounds() {
        let m = mgr();
        assert_eq!(m.set_brk(0), GUEST_MEM_START_VA as i64);
        assert_eq!(m.set_brk(m.mid() + KM_PAGE_SIZE), -(libc::ENOMEM as i64));
        let want = GUEST_MEM_START_VA + 10 * KM_PAGE_SIZE;
        assert_eq!(m.set_brk(want), want as i64);
        // Shrink back, then regrow: memory reads zero.
        assert_eq!(m.set_brk(GUEST_MEM_START_VA + KM_PAGE_SIZE), (GUEST_MEM_START_VA + KM_PAGE_SIZE) as i64);
        assert_eq!(m.set_brk(want), want as i64);
        assert_eq!(m.read_obj::<u64>(want - 8), Some(0));
    }

    #[test]
    fn guest_rw_helpers() {
        let m = mgr();
        m.set_brk(GUEST_MEM_START_VA + 0x10000);
        assert!(m.write_obj::<u64>(GUEST_MEM_START_VA + 8, 0xdead_beef));
        assert_eq!(m.read_obj::<u64>(GUEST_MEM_START_VA + 8), Some(0xdead_beef));
        assert!(!m.write_obj::<u64>(m.mid(), 1), "hole rejects writes");
        let data = vec![7u8; 4096];
        assert!(m.write_bytes(GUEST_MEM_START_VA, &data));
        assert_eq!(m.read_bytes(GUEST_MEM_START_VA, 4096).unwrap(), data);
    }
}
