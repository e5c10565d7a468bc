//! The guest mmap engine.
//!
//! Address ranges live on two lists: `busy` (mapped, payload-visible) and
//! `free` (carved out of the arena but currently unmapped). Both are kept
//! sorted by start address and non-overlapping; adjacent busy regions with
//! identical properties are merged, free regions always merge. A free
//! region that ends up at the top break is given back to the arena by
//! raising `tbrk`.
//!
//! All list operations run under a single mutex covering the entire
//! operation. Merging can be disabled wholesale (`recovery mode`) while a
//! snapshot is being reconstructed, so region boundaries survive exactly.

use std::sync::Mutex;

use crate::filesys::FdTable;
use crate::mem::MemManager;
use crate::{Gva, KM_PAGE_SIZE, rounddown, roundup};

// Not exported by every libc version the monitor builds against.
const MAP_FIXED_NOREPLACE: i32 = 0x10_0000;

/// Monitor-internal state of a region, invisible to the guest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonFlags {
    /// Region was allocated by the monitor itself (guest stacks and the
    /// like); guest munmap/mprotect sweeps skip it.
    pub monitor: bool,
    /// Backing pages are known-zero; no release needed before reuse.
    pub clean: bool,
    /// Monitor pages exposed into the guest (VDSO, trampolines). Never
    /// host-mprotected and never handed to the guest for modification.
    pub part_of_monitor: bool,
}

/// A single mapped (busy) or carved-but-unmapped (free) region.
#[derive(Debug, Clone, PartialEq)]
pub struct MmapReg {
    /// First guest address of the region.
    pub start: Gva,
    /// Region size in bytes (page multiple).
    pub size: u64,
    /// Guest mmap flags as passed in.
    pub flags: i32,
    /// PROT_* protection; 0 for free regions.
    pub protection: i32,
    /// Monitor-internal flags.
    pub km: MonFlags,
    /// Backing file path, if file-mapped (or a monitor tag like "[vdso]").
    pub filename: Option<String>,
    /// Offset into the backing file.
    pub offset: i64,
}

impl MmapReg {
    fn end(&self) -> Gva {
        self.start + self.size
    }
}

pub(crate) struct MmapLists {
    free: Vec<MmapReg>,
    busy: Vec<MmapReg>,
    recovery_mode: bool,
}

/// The mmap control block: both lists behind the single engine mutex.
pub struct MmapCb {
    inner: Mutex<MmapLists>,
}

impl MmapCb {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(MmapLists { free: Vec::new(), busy: Vec::new(), recovery_mode: false }),
        }
    }
}

/// Returns true when two adjacent regions may be merged into one.
///
/// Free regions always qualify (normalized to PROT_NONE, no file). Busy
/// regions must agree on protection, flags, monitor flags, and file
/// identity with contiguous offsets.
fn ok_to_concat(recovery: bool, left: &MmapReg, right: &MmapReg) -> bool {
    if recovery {
        return false;
    }
    if left.end() != right.start {
        return false;
    }
    match (&left.filename, &right.filename) {
        (None, None) => {}
        (Some(l), Some(r)) => {
            if l != r || left.offset + left.size as i64 != right.offset {
                return false;
            }
        }
        _ => return false,
    }
    left.protection == right.protection && left.flags == right.flags && left.km == right.km
}

/// One full merge pass over a sorted list.
fn merge_list(recovery: bool, list: &mut Vec<MmapReg>) {
    let mut i = 0;
    while i + 1 < list.len() {
        if ok_to_concat(recovery, &list[i], &list[i + 1]) {
            let right = list.remove(i + 1);
            list[i].size += right.size;
        } else {
            i += 1;
        }
    }
}

fn insert_sorted(list: &mut Vec<MmapReg>, reg: MmapReg) {
    let idx = list.partition_point(|r| r.start < reg.start);
    debug_assert!(idx == 0 || list[idx - 1].end() <= reg.start, "overlap on the left");
    debug_assert!(idx == list.len() || reg.end() <= list[idx].start, "overlap on the right");
    list.insert(idx, reg);
}

impl MemManager {
    // ── host-side page operations through KMA ───────────────────────

    /// Applies a region's protection to its host mapping and releases the
    /// physical pages of regions that became anonymous garbage.
    fn host_protect(&self, reg: &mut MmapReg) {
        if !reg.km.part_of_monitor {
            // SAFETY: the region lies inside the backing reservation; the
            // engine mutex serializes host mapping changes.
            let rc = unsafe {
                libc::mprotect(
                    self.gva_to_kma_nocheck(reg.start).cast::<libc::c_void>(),
                    reg.size as usize,
                    reg.protection,
                )
            };
            if rc != 0 {
                tracing::warn!(
                    target: "mmap",
                    start = format_args!("{:#x}", reg.start),
                    size = format_args!("{:#x}", reg.size),
                    prot = reg.protection,
                    "host mprotect failed"
                );
            }
        }
        self.make_clean(reg);
    }

    /// Drops the physical pages behind an anonymous region so the guest
    /// sees zeros on next touch.
    fn make_clean(&self, reg: &mut MmapReg) {
        if reg.protection != libc::PROT_NONE && !reg.km.clean && reg.filename.is_none() {
            // SAFETY: the range lies inside the backing reservation.
            unsafe {
                libc::madvise(
                    self.gva_to_kma_nocheck(reg.start).cast::<libc::c_void>(),
                    reg.size as usize,
                    libc::MADV_DONTNEED,
                );
            }
            reg.km.clean = true;
            tracing::trace!(
                target: "mmap",
                start = format_args!("{:#x}", reg.start),
                size = format_args!("{:#x}", reg.size),
                "region zeroed"
            );
        }
    }

    // ── list manipulation under the engine mutex ────────────────────

    fn insert_busy(&self, lists: &mut MmapLists, mut reg: MmapReg) {
        self.host_protect(&mut reg);
        insert_sorted(&mut lists.busy, reg);
        merge_list(lists.recovery_mode, &mut lists.busy);
    }

    /// Inserts into the free list with normalized fields, merges, and gives
    /// arena space back to `tbrk` when the lowest free region touches it.
    fn insert_free(&self, lists: &mut MmapLists, mut reg: MmapReg) {
        reg.protection = libc::PROT_NONE;
        reg.flags = 0;
        reg.filename = None;
        reg.offset = 0;
        reg.km.clean = false;
        // Freed space may sit unused for a long time; give the physical
        // pages back now (the region is anonymous by this point).
        // SAFETY: the range lies inside the backing reservation.
        unsafe {
            libc::madvise(
                self.gva_to_kma_nocheck(reg.start).cast::<libc::c_void>(),
                reg.size as usize,
                libc::MADV_DONTNEED,
            );
        }
        self.host_protect(&mut reg);
        insert_sorted(&mut lists.free, reg);
        merge_list(lists.recovery_mode, &mut lists.free);
        if let Some(first) = lists.free.first()
            && first.start == self.tbrk()
        {
            let end = first.end();
            self.mem_tbrk(end);
            lists.free.remove(0);
        }
    }

    /// Splits the busy region straddling `at` so a region boundary exists
    /// there. Monitor regions are never split.
    fn split_busy_at(&self, lists: &mut MmapLists, at: Gva) {
        let Some(idx) = lists.busy.iter().position(|r| r.start < at && at < r.end()) else {
            return;
        };
        let reg = &mut lists.busy[idx];
        if reg.km.monitor || reg.km.part_of_monitor {
            return;
        }
        let mut right = reg.clone();
        let left_size = at - reg.start;
        reg.size = left_size;
        right.start = at;
        right.size -= left_size;
        if right.filename.is_some() {
            right.offset += left_size as i64;
        }
        lists.busy.insert(idx + 1, right);
    }

    /// Checks that busy regions cover `[addr, addr+size)` without holes and
    /// without touching monitor regions.
    fn busy_check_contiguous(&self, lists: &MmapLists, addr: Gva, size: u64) -> bool {
        let mut cursor = addr;
        let end = addr + size;
        for reg in &lists.busy {
            if reg.end() <= cursor {
                continue;
            }
            if reg.start > cursor {
                return false; // hole
            }
            if reg.km.monitor || reg.km.part_of_monitor {
                return false; // stepped on a monitor region
            }
            cursor = reg.end();
            if cursor >= end {
                return true;
            }
        }
        false
    }

    /// Changes protection on every busy region fully inside the range,
    /// splitting at the boundaries first.
    fn apply_mprotect(&self, lists: &mut MmapLists, addr: Gva, size: u64, prot: i32) {
        self.split_busy_at(lists, addr);
        self.split_busy_at(lists, addr + size);
        for idx in 0..lists.busy.len() {
            let (start, end, skip) = {
                let r = &lists.busy[idx];
                (r.start, r.end(), r.km.monitor || r.km.part_of_monitor)
            };
            if end <= addr || start >= addr + size {
                continue;
            }
            if skip {
                tracing::warn!(
                    target: "mmap",
                    addr = format_args!("{addr:#x}"),
                    size = format_args!("{size:#x}"),
                    reg = format_args!("{start:#x}"),
                    "range conflicts with monitor region"
                );
                continue;
            }
            let mut reg = lists.busy[idx].clone();
            reg.protection = prot;
            self.host_protect(&mut reg);
            lists.busy[idx] = reg;
        }
        merge_list(lists.recovery_mode, &mut lists.busy);
    }

    /// Moves every busy region fully inside the range to the free list,
    /// splitting at the boundaries first. Shared and file-backed mappings
    /// are converted back to private anonymous memory so the kernel drops
    /// its file references.
    fn apply_unmap(&self, lists: &mut MmapLists, addr: Gva, size: u64) {
        self.split_busy_at(lists, addr);
        self.split_busy_at(lists, addr + size);
        let mut idx = 0;
        while idx < lists.busy.len() {
            let (start, end, skip) = {
                let r = &lists.busy[idx];
                (r.start, r.end(), r.km.monitor || r.km.part_of_monitor)
            };
            if end <= addr {
                idx += 1;
                continue;
            }
            if start >= addr + size {
                break;
            }
            if skip {
                tracing::warn!(
                    target: "mmap",
                    addr = format_args!("{addr:#x}"),
                    reg = format_args!("{start:#x}"),
                    "munmap range conflicts with monitor region"
                );
                idx += 1;
                continue;
            }
            let mut reg = lists.busy.remove(idx);
            if (reg.flags & libc::MAP_SHARED) != 0 || reg.filename.is_some() {
                let kma = self.gva_to_kma_nocheck(reg.start);
                let new_flags =
                    (reg.flags & !libc::MAP_SHARED) | libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
                // SAFETY: MAP_FIXED overwrite of a range inside the backing
                // reservation, serialized by the engine mutex.
                let p = unsafe {
                    libc::mmap(
                        kma.cast::<libc::c_void>(),
                        reg.size as usize,
                        reg.protection,
                        new_flags | libc::MAP_FIXED,
                        -1,
                        0,
                    )
                };
                if p == kma.cast::<libc::c_void>() {
                    reg.flags = new_flags;
                    reg.filename = None;
                } else {
                    tracing::warn!(
                        target: "mmap",
                        start = format_args!("{:#x}", reg.start),
                        "could not convert mapping back to anonymous"
                    );
                }
            }
            self.insert_free(lists, reg);
        }
    }

    /// Replaces every region in a fully-covered range with a single fresh
    /// busy region (the MAP_FIXED rewrite path; the host mapping was
    /// already rewritten by the caller).
    fn apply_fixed_overwrite(
        &self,
        lists: &mut MmapLists,
        addr: Gva,
        size: u64,
        prot: i32,
        flags: i32,
        filename: Option<String>,
        offset: i64,
    ) {
        self.split_busy_at(lists, addr);
        self.split_busy_at(lists, addr + size);
        lists.busy.retain(|r| r.end() <= addr || r.start >= addr + size);
        let reg = MmapReg {
            start: addr,
            size,
            flags: flags & !libc::MAP_FIXED,
            protection: prot,
            km: MonFlags { clean: filename.is_none(), ..MonFlags::default() },
            filename,
            offset,
        };
        insert_sorted(&mut lists.busy, reg);
        merge_list(lists.recovery_mode, &mut lists.busy);
    }

    // ── region allocation ───────────────────────────────────────────

    /// Carves an address range from the free list (first fit, lowest
    /// address) or grows the arena by lowering `tbrk`. Returns the start
    /// address or a negative errno.
    fn add_region(
        &self,
        lists: &mut MmapLists,
        size: u64,
        prot: i32,
        flags: i32,
        hostfd: i32,
        monitor: bool,
    ) -> i64 {
        let existing_flags;
        let mut reg = if let Some(idx) = lists.free.iter().position(|r| r.size >= size) {
            existing_flags = lists.free[idx].flags;
            if lists.free[idx].size > size {
                // Keep the extra room in the free list.
                let mut busy = lists.free[idx].clone();
                lists.free[idx].start += size;
                lists.free[idx].size -= size;
                busy.size = size;
                busy
            } else {
                lists.free.remove(idx)
            }
        } else {
            existing_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
            let want = self.tbrk() - size;
            let got = self.mem_tbrk(want);
            if got != want as i64 {
                return if got < 0 { got } else { -i64::from(libc::ENOMEM) };
            }
            MmapReg {
                start: want,
                size,
                flags: 0,
                protection: 0,
                km: MonFlags::default(),
                filename: None,
                offset: 0,
            }
        };
        reg.flags = flags;
        reg.protection = prot;
        reg.km = MonFlags { monitor, ..MonFlags::default() };
        reg.filename = None;
        reg.offset = 0;

        if (existing_flags ^ flags) & (libc::MAP_PRIVATE | libc::MAP_SHARED) != 0 {
            // Change of sharing: rebuild the host mapping in place.
            let kma = self.gva_to_kma_nocheck(reg.start);
            // SAFETY: MAP_FIXED overwrite inside the backing reservation,
            // serialized by the engine mutex.
            let p = unsafe {
                libc::mmap(
                    kma.cast::<libc::c_void>(),
                    reg.size as usize,
                    reg.protection,
                    libc::MAP_FIXED | flags,
                    hostfd,
                    0,
                )
            };
            if p != kma.cast::<libc::c_void>() {
                let err = std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::ENOMEM);
                self.insert_free(lists, reg);
                return -i64::from(err);
            }
        }

        let start = reg.start;
        self.insert_busy(lists, reg);
        start as i64
    }

    // ── guest-facing operations ─────────────────────────────────────

    /// Guest `mmap`. Returns the mapped address or a negative errno.
    #[allow(clippy::too_many_arguments)]
    pub fn guest_mmap(
        &self,
        fdt: &dyn FdTable,
        gva: Gva,
        size: u64,
        prot: i32,
        flags: i32,
        fd: i32,
        offset: i64,
    ) -> i64 {
        self.guest_mmap_impl(fdt, gva, size, prot, flags, fd, offset, false)
    }

    /// Anonymous read-write private mapping made on behalf of the monitor
    /// (guest thread stacks and similar). Returns address or negative errno.
    pub fn monitor_mmap(&self, size: u64) -> i64 {
        self.guest_mmap_impl(
            &crate::filesys::NoFds,
            0,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
            true,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn guest_mmap_impl(
        &self,
        fdt: &dyn FdTable,
        gva: Gva,
        size: u64,
        prot: i32,
        flags: i32,
        mut fd: i32,
        offset: i64,
        monitor: bool,
    ) -> i64 {
        tracing::debug!(
            target: "mmap",
            gva = format_args!("{gva:#x}"),
            size = format_args!("{size:#x}"),
            prot,
            flags = format_args!("{flags:#x}"),
            fd,
            "mmap"
        );
        if size == 0 || size >= self.mid() {
            return -i64::from(libc::ENOMEM);
        }
        if flags & MAP_FIXED_NOREPLACE != 0 {
            return -i64::from(libc::EINVAL);
        }
        let fixed = flags & libc::MAP_FIXED != 0;
        if fixed && gva == 0 {
            return -i64::from(libc::EPERM);
        }
        if flags & libc::MAP_ANONYMOUS == 0 && fd < 0 {
            return -i64::from(libc::EBADF);
        }
        if flags & libc::MAP_ANONYMOUS != 0 {
            fd = -1; // per mmap(2), fd is ignored for anonymous mappings
        }
        let size = roundup(size, KM_PAGE_SIZE);

        let mut lists = self.mmaps.inner.lock().expect("mmap mutex poisoned");

        let hostfd = if fd >= 0 {
            match fdt.host_fd(fd) {
                Some(h) => h,
                None => return -i64::from(libc::EBADF),
            }
        } else {
            -1
        };

        let gva = if fixed {
            if !self.busy_check_contiguous(&lists, gva, size) {
                return -i64::from(libc::EINVAL);
            }
            gva
        } else {
            let got = self.add_region(&mut lists, size, prot, flags, hostfd, monitor);
            if got < 0 {
                return got;
            }
            got as u64
        };

        if !fixed && fd < 0 {
            return gva as i64; // plain anonymous mapping, done
        }

        // File-backed or fixed: rewrite the host mapping so the kernel
        // installs file pages, then collapse the covered regions into one.
        let kma = self.gva_to_kma_nocheck(gva);
        // SAFETY: MAP_FIXED overwrite of a carved range inside the backing
        // reservation, serialized by the engine mutex.
        let p = unsafe {
            libc::mmap(
                kma.cast::<libc::c_void>(),
                size as usize,
                prot,
                flags | libc::MAP_FIXED,
                hostfd,
                offset,
            )
        };
        if p != kma.cast::<libc::c_void>() {
            let err = std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::ENOMEM);
            return -i64::from(err);
        }
        let filename = if fd >= 0 { fdt.fd_name(fd) } else { None };
        let offset = if filename.is_some() { offset } else { 0 };
        self.apply_fixed_overwrite(&mut lists, gva, size, prot, flags, filename, offset);
        gva as i64
    }

    /// Guest `munmap`. Returns 0 or a negative errno. Pages inside the
    /// range that were never mapped are fine, per munmap(2).
    pub fn guest_munmap(&self, addr: Gva, size: u64) -> i64 {
        tracing::debug!(
            target: "mmap",
            addr = format_args!("{addr:#x}"),
            size = format_args!("{size:#x}"),
            "munmap"
        );
        if addr != roundup(addr, KM_PAGE_SIZE) || size == 0 {
            return -i64::from(libc::EINVAL);
        }
        let size = roundup(size, KM_PAGE_SIZE);
        let mut lists = self.mmaps.inner.lock().expect("mmap mutex poisoned");
        self.apply_unmap(&mut lists, addr, size);
        0
    }

    /// Guest `mprotect`. Returns 0 or a negative errno.
    pub fn guest_mprotect(&self, addr: Gva, size: u64, prot: i32) -> i64 {
        tracing::debug!(
            target: "mmap",
            addr = format_args!("{addr:#x}"),
            size = format_args!("{size:#x}"),
            prot,
            "mprotect"
        );
        let allowed = libc::PROT_READ
            | libc::PROT_WRITE
            | libc::PROT_EXEC
            | libc::PROT_GROWSDOWN
            | libc::PROT_GROWSUP;
        if prot & !allowed != 0 {
            return -i64::from(libc::EINVAL);
        }
        if addr != rounddown(addr, KM_PAGE_SIZE) || size == 0 {
            return -i64::from(libc::EINVAL);
        }
        let size = roundup(size, KM_PAGE_SIZE);

        // Below the break the page-table protections were fixed at load
        // time; only the host mapping changes.
        if addr >= crate::mem::GUEST_MEM_START_VA && addr + size <= self.brk() {
            // SAFETY: the range lies inside the bottom zone of the backing.
            let rc = unsafe {
                libc::mprotect(
                    self.gva_to_kma_nocheck(addr).cast::<libc::c_void>(),
                    size as usize,
                    prot,
                )
            };
            return if rc == 0 {
                0
            } else {
                -i64::from(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL))
            };
        }

        let mut lists = self.mmaps.inner.lock().expect("mmap mutex poisoned");
        if !self.busy_check_contiguous(&lists, addr, size) {
            return -i64::from(libc::ENOMEM); // holes in range, per mprotect(2)
        }
        self.apply_mprotect(&mut lists, addr, size, prot);
        0
    }

    /// Guest `madvise`; only `MADV_DONTNEED` is honored.
    pub fn guest_madvise(&self, addr: Gva, size: u64, advice: i32) -> i64 {
        if advice != libc::MADV_DONTNEED {
            return -i64::from(libc::EINVAL);
        }
        if addr != rounddown(addr, KM_PAGE_SIZE) || size == 0 {
            return -i64::from(libc::EINVAL);
        }
        let size = roundup(size, KM_PAGE_SIZE);
        let lists = self.mmaps.inner.lock().expect("mmap mutex poisoned");
        if !self.busy_check_contiguous(&lists, addr, size) {
            return -i64::from(libc::ENOMEM);
        }
        // SAFETY: fully-mapped range inside the backing reservation.
        let rc = unsafe {
            libc::madvise(self.gva_to_kma_nocheck(addr).cast::<libc::c_void>(), size as usize, advice)
        };
        if rc == 0 {
            0
        } else {
            -i64::from(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL))
        }
    }

    /// Guest `msync` over a fully-mapped range.
    pub fn guest_msync(&self, addr: Gva, size: u64, flags: i32) -> i64 {
        if addr != rounddown(addr, KM_PAGE_SIZE) {
            return -i64::from(libc::EINVAL);
        }
        let size = roundup(size, KM_PAGE_SIZE);
        let lists = self.mmaps.inner.lock().expect("mmap mutex poisoned");
        if !self.busy_check_contiguous(&lists, addr, size) {
            return -i64::from(libc::ENOMEM);
        }
        // SAFETY: fully-mapped range inside the backing reservation.
        let rc = unsafe {
            libc::msync(self.gva_to_kma_nocheck(addr).cast::<libc::c_void>(), size as usize, flags)
        };
        if rc == 0 {
            0
        } else {
            -i64::from(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL))
        }
    }

    /// Guest `mremap`. Returns the (possibly moved) address or a negative
    /// errno.
    pub fn guest_mremap(&self, old_addr: Gva, old_size: u64, size: u64, flags: i32) -> i64 {
        tracing::debug!(
            target: "mmap",
            old_addr = format_args!("{old_addr:#x}"),
            old_size = format_args!("{old_size:#x}"),
            size = format_args!("{size:#x}"),
            flags,
            "mremap"
        );
        if old_addr % KM_PAGE_SIZE != 0 || old_size == 0 || size == 0 || flags & !libc::MREMAP_MAYMOVE != 0
        {
            return -i64::from(libc::EINVAL);
        }
        let old_size = roundup(old_size, KM_PAGE_SIZE);
        let size = roundup(size, KM_PAGE_SIZE);
        if old_size == size {
            return old_addr as i64;
        }

        let mut lists = self.mmaps.inner.lock().expect("mmap mutex poisoned");
        let Some(idx) = lists.busy.iter().position(|r| r.start <= old_addr && old_addr < r.end())
        else {
            return -i64::from(libc::EFAULT);
        };
        let reg = &lists.busy[idx];
        if reg.end() < old_addr + old_size {
            return -i64::from(libc::EFAULT); // must be within one homogeneous map
        }
        if reg.km.monitor || reg.km.part_of_monitor {
            return -i64::from(libc::EFAULT);
        }

        if size < old_size {
            // Shrink: drop the tail.
            self.apply_unmap(&mut lists, old_addr + size, old_size - size);
            return old_addr as i64;
        }

        let needed = size - old_size;
        let (reg_end, reg_prot, reg_flags, reg_clean) =
            (reg.end(), reg.protection, reg.flags, reg.km.clean);

        // Grow in place when the request ends at the region edge and the
        // free neighbor right above is large enough.
        let next_busy_start =
            lists.busy.get(idx + 1).map_or(u64::MAX, |r| r.start);
        if reg_end == old_addr + old_size && next_busy_start.saturating_sub(reg_end) >= needed {
            if let Some(didx) =
                lists.free.iter().position(|r| r.start == reg_end && r.size >= needed)
            {
                let mut grown = lists.busy[idx].clone();
                grown.size += needed;
                if reg_clean {
                    // The extension was not part of the clean region; scrub it.
                    let mut extra = MmapReg {
                        start: reg_end,
                        size: needed,
                        flags: reg_flags,
                        protection: libc::PROT_WRITE,
                        km: MonFlags::default(),
                        filename: None,
                        offset: 0,
                    };
                    self.make_clean(&mut extra);
                }
                self.host_protect(&mut grown);
                lists.busy[idx] = grown;
                if lists.free[didx].size == needed {
                    lists.free.remove(didx);
                } else {
                    lists.free[didx].start += needed;
                    lists.free[didx].size -= needed;
                }
                merge_list(lists.recovery_mode, &mut lists.busy);
                return old_addr as i64;
            }
        }

        if flags & libc::MREMAP_MAYMOVE == 0 {
            return -i64::from(libc::ENOMEM);
        }

        // Allocate a fresh range, copy, drop the old mapping.
        let new_addr = self.add_region(&mut lists, size, reg_prot, reg_flags, -1, false);
        if new_addr < 0 {
            return new_addr;
        }
        let new_addr = new_addr as u64;
        // SAFETY: both ranges lie inside the backing reservation and cannot
        // overlap (the new range was just carved from free space).
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.gva_to_kma_nocheck(old_addr),
                self.gva_to_kma_nocheck(new_addr),
                old_size as usize,
            );
        }
        self.apply_unmap(&mut lists, old_addr, old_size);
        new_addr as i64
    }

    // ── monitor-side helpers ────────────────────────────────────────

    /// Records a monitor address range exposed into the guest (VDSO,
    /// trampolines) so it shows up in core dumps and the region walk.
    pub fn monitor_pages_in_guest(&self, gva: Gva, size: u64, protection: i32, tag: &str) {
        let mut lists = self.mmaps.inner.lock().expect("mmap mutex poisoned");
        let reg = MmapReg {
            start: gva,
            size,
            flags: 0,
            protection,
            km: MonFlags { part_of_monitor: true, ..MonFlags::default() },
            filename: Some(tag.to_string()),
            offset: 0,
        };
        insert_sorted(&mut lists.busy, reg);
        merge_list(lists.recovery_mode, &mut lists.busy);
    }

    /// Enables or disables region consolidation. Only set during snapshot
    /// recovery, which is single threaded by definition.
    pub fn mmap_set_recovery_mode(&self, mode: bool) {
        self.mmaps.inner.lock().expect("mmap mutex poisoned").recovery_mode = mode;
    }

    /// Labels the region containing `base` with a filename (from the
    /// NT_FILE note during restore). Regions below the arena are skipped.
    pub fn mmap_set_filename(&self, base: Gva, filename: &str) {
        if base < self.tbrk() {
            return;
        }
        let mut lists = self.mmaps.inner.lock().expect("mmap mutex poisoned");
        if let Some(reg) = lists.busy.iter_mut().find(|r| r.start <= base && base < r.end())
            && reg.filename.is_none()
        {
            reg.filename = Some(filename.to_string());
        }
    }

    /// Rebuilds one busy region verbatim during snapshot recovery.
    pub(crate) fn recover_busy_region(&self, reg: MmapReg) {
        let mut lists = self.mmaps.inner.lock().expect("mmap mutex poisoned");
        debug_assert!(lists.recovery_mode);
        insert_sorted(&mut lists.busy, reg);
    }

    /// Adopts another manager's region lists, re-applying each busy
    /// region's protection to this backing (fork child path; the contents
    /// were already copied).
    pub(crate) fn adopt_mmaps_from(&self, other: &MemManager) {
        let src = other.mmaps.inner.lock().expect("mmap mutex poisoned");
        let mut dst = self.mmaps.inner.lock().expect("mmap mutex poisoned");
        dst.busy = src.busy.clone();
        dst.free = src.free.clone();
        dst.recovery_mode = src.recovery_mode;
        for reg in &dst.busy {
            if reg.km.part_of_monitor {
                continue;
            }
            // SAFETY: the region lies inside this manager's reservation.
            unsafe {
                libc::mprotect(
                    self.gva_to_kma_nocheck(reg.start).cast::<libc::c_void>(),
                    reg.size as usize,
                    reg.protection,
                );
            }
        }
        for reg in &dst.free {
            // SAFETY: as above.
            unsafe {
                libc::mprotect(
                    self.gva_to_kma_nocheck(reg.start).cast::<libc::c_void>(),
                    reg.size as usize,
                    libc::PROT_NONE,
                );
            }
        }
    }

    /// Snapshot of the busy list for coredump/snapshot region walks.
    #[must_use]
    pub fn busy_regions(&self) -> Vec<MmapReg> {
        self.mmaps.inner.lock().expect("mmap mutex poisoned").busy.clone()
    }

    /// Number of busy regions (test and status surface).
    #[must_use]
    pub fn busy_region_count(&self) -> usize {
        self.mmaps.inner.lock().expect("mmap mutex poisoned").busy.len()
    }

    /// True when the arena-range `[gva, gva+size)` is mapped with at least
    /// `prot` on every page.
    #[must_use]
    pub fn mmap_prot_check(&self, gva: Gva, size: u64, prot: i32) -> bool {
        let lists = self.mmaps.inner.lock().expect("mmap mutex poisoned");
        let mut cursor = gva;
        let end = gva + size.max(1);
        for reg in &lists.busy {
            if reg.end() <= cursor {
                continue;
            }
            if reg.start > cursor {
                return false;
            }
            if reg.protection & prot != prot {
                return false;
            }
            cursor = reg.end();
            if cursor >= end {
                return true;
            }
        }
        false
    }

    /// Verifies the list invariants: sorted, non-overlapping, maximally
    /// merged outside recovery mode. Test/debug surface.
    pub fn mmap_check_invariants(&self) -> std::result::Result<(), String> {
        let lists = self.mmaps.inner.lock().expect("mmap mutex poisoned");
        for (name, list) in [("busy", &lists.busy), ("free", &lists.free)] {
            for w in list.windows(2) {
                if w[0].end() > w[1].start {
                    return Err(format!(
                        "{name} list overlap: {:#x}+{:#x} vs {:#x}",
                        w[0].start, w[0].size, w[1].start
                    ));
                }
                if ok_to_concat(lists.recovery_mode, &w[0], &w[1]) {
                    return Err(format!(
                        "{name} list not maximally merged at {:#x}",
                        w[1].start
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesys::NoFds;
    use crate::mem::MemManager;

    fn mgr() -> MemManager {
        MemManager::new(32 << 30).expect("layout")
    }

    const RW: i32 = libc::PROT_READ | libc::PROT_WRITE;
    const ANON: i32 = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

    #[test]
    fn mmap_munmap_roundtrip() {
        let m = mgr();
        let baseline = m.busy_region_count();
        let tbrk0 = m.tbrk();
        let got = m.guest_mmap(&NoFds, 0, 1 << 20, RW, ANON, -1, 0);
        assert!(got > 0, "mmap failed: {got}");
        let gva = got as u64;
        assert!(m.write_obj::<u64>(gva, 42));
        assert_eq!(m.read_obj::<u64>(gva), Some(42));
        assert_eq!(m.guest_munmap(gva, 1 << 20), 0);
        assert_eq!(m.busy_region_count(), baseline);
        assert_eq!(m.tbrk(), tbrk0, "arena reclaimed");
        m.mmap_check_invariants().unwrap();
    }

    #[test]
    fn free_list_reuse_is_first_fit() {
        let m = mgr();
        let a = m.guest_mmap(&NoFds, 0, 4 << 20, RW, ANON, -1, 0) as u64;
        let b = m.guest_mmap(&NoFds, 0, 4 << 20, RW, ANON, -1, 0) as u64;
        assert!(b < a, "arena grows downward");
        assert_eq!(m.guest_munmap(a, 4 << 20), 0);
        // Freed range sits above the arena bottom, so the next mmap of the
        // same size must reuse it (first fit from low addresses would pick
        // the lowest free region; with one region it is `a`).
        let c = m.guest_mmap(&NoFds, 0, 4 << 20, RW, ANON, -1, 0) as u64;
        assert_eq!(c, a);
        m.mmap_check_invariants().unwrap();
    }

    #[test]
    fn fixed_replacement_splits_into_five() {
        let m = mgr();
        let got = m.guest_mmap(&NoFds, 0, 1 << 30, libc::PROT_NONE, ANON, -1, 0);
        assert!(got > 0);
        let base = got as u64;
        let fixed_at = base + (100 << 20);
        let rc = m.guest_mmap(&NoFds, fixed_at, 200 << 20, RW, ANON | libc::MAP_FIXED, -1, 0);
        assert_eq!(rc, fixed_at as i64);
        // Two PROT_NONE pieces around the RW piece.
        let regs = m.busy_regions();
        let inside: Vec<_> =
            regs.iter().filter(|r| r.start >= base && r.start < base + (1 << 30)).collect();
        assert_eq!(inside.len(), 3);
        assert_eq!(inside[1].protection, RW);
        assert_eq!(inside[1].start, fixed_at);
        // Fresh anonymous MAP_FIXED memory reads zero.
        assert_eq!(m.read_obj::<u64>(base + (200 << 20)), Some(0));
        m.mmap_check_invariants().unwrap();
    }

    #[test]
    fn fixed_requires_coverage() {
        let m = mgr();
        let hole = m.tbrk() - (64 << 20);
        let rc = m.guest_mmap(&NoFds, hole, 1 << 20, RW, ANON | libc::MAP_FIXED, -1, 0);
        assert_eq!(rc, -i64::from(libc::EINVAL));
    }

    #[test]
    fn fixed_noreplace_rejected() {
        let m = mgr();
        let rc = m.guest_mmap(&NoFds, 0, 1 << 20, RW, ANON | MAP_FIXED_NOREPLACE, -1, 0);
        assert_eq!(rc, -i64::from(libc::EINVAL));
    }

    #[test]
    fn mprotect_splits_and_merges_back() {
        let m = mgr();
        let gva = m.guest_mmap(&NoFds, 0, 16 << 20, RW, ANON, -1, 0) as u64;
        let n0 = m.busy_region_count();
        assert_eq!(m.guest_mprotect(gva + (4 << 20), 4 << 20, libc::PROT_READ), 0);
        assert_eq!(m.busy_region_count(), n0 + 2);
        assert_eq!(m.guest_mprotect(gva + (4 << 20), 4 << 20, RW), 0);
        // The clean flags may differ after the scrub, but the merged count
        // cannot exceed the split count.
        assert!(m.busy_region_count() <= n0 + 2);
        m.mmap_check_invariants().unwrap();
    }

    #[test]
    fn mprotect_hole_is_enomem() {
        let m = mgr();
        let gva = m.guest_mmap(&NoFds, 0, 4 << 20, RW, ANON, -1, 0) as u64;
        assert_eq!(m.guest_munmap(gva + (1 << 20), 1 << 20), 0);
        assert_eq!(m.guest_mprotect(gva, 4 << 20, libc::PROT_READ), -i64::from(libc::ENOMEM));
    }

    #[test]
    fn mremap_grow_in_place_and_move() {
        let m = mgr();
        let a = m.guest_mmap(&NoFds, 0, 8 << 20, RW, ANON, -1, 0) as u64;
        assert!(m.write_obj::<u64>(a, 0x1122_3344));
        // Nothing mapped above `a` (it is at the arena bottom edge), so
        // growing requires a move unless free space sits right above.
        let b = m.guest_mremap(a, 8 << 20, 16 << 20, libc::MREMAP_MAYMOVE);
        assert!(b > 0);
        assert_eq!(m.read_obj::<u64>(b as u64), Some(0x1122_3344), "contents moved");
        m.mmap_check_invariants().unwrap();
    }

    #[test]
    fn mremap_shrink_truncates_tail() {
        let m = mgr();
        let a = m.guest_mmap(&NoFds, 0, 8 << 20, RW, ANON, -1, 0) as u64;
        assert_eq!(m.guest_mremap(a, 8 << 20, 4 << 20, 0), a as i64);
        assert!(m.mmap_prot_check(a, 4 << 20, RW));
        assert!(!m.mmap_prot_check(a + (4 << 20), 1, RW));
        m.mmap_check_invariants().unwrap();
    }

    #[test]
    fn madvise_requires_full_mapping() {
        let m = mgr();
        let a = m.guest_mmap(&NoFds, 0, 2 << 20, RW, ANON, -1, 0) as u64;
        assert_eq!(m.guest_madvise(a, 2 << 20, libc::MADV_DONTNEED), 0);
        assert_eq!(m.guest_madvise(a, 4 << 20, libc::MADV_DONTNEED), -i64::from(libc::ENOMEM));
        assert_eq!(m.guest_madvise(a, 2 << 20, libc::MADV_WILLNEED), -i64::from(libc::EINVAL));
    }

    #[test]
    fn monitor_regions_survive_guest_sweeps() {
        let m = mgr();
        let top = m.max_physmem() - (2 << 20);
        m.monitor_pages_in_guest(top, 4096, libc::PROT_READ | libc::PROT_EXEC, "[vdso]");
        assert_eq!(m.guest_munmap(top, 4096), 0); // skipped, not an error
        let regs = m.busy_regions();
        assert!(regs.iter().any(|r| r.filename.as_deref() == Some("[vdso]")));
    }
}
