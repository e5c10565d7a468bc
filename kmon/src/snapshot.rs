//! Snapshot capture and restore.
//!
//! Capture rides on the core writer: pause everything, refuse if the guest
//! holds state that cannot be reconstructed, write the extended core, then
//! resume (live) or shut down. Restore runs in place of loading a new
//! payload: memory comes back from the PT_LOAD segments with consolidation
//! disabled so region boundaries survive exactly, then the notes are
//! applied in a fixed order, and finally the VCPU threads start as if the
//! guest had just been running.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;

use crate::elfcore::{
    self, Elf64Ehdr, Elf64Phdr, KM_NT_NAME, NT_AUXV, NT_FILE, NT_KM_DYNLINKER, NT_KM_EVENTFD,
    NT_KM_FILE, NT_KM_GUEST, NT_KM_IOCONTEXTS, NT_KM_MONITOR, NT_KM_SIGHAND, NT_KM_SOCKET,
    NT_KM_VCPU, NT_PRSTATUS, NtFileHdr, NtGuest, NtMonitor, NtVcpu, PF_R, PF_W, PF_X, PT_LOAD,
    PT_NOTE, Prstatus, greg, pod_from_bytes,
};
use crate::error::{KmError, Result, SnapshotError};
use crate::machine::Machine;
use crate::mmap::{MmapReg, MonFlags};
use crate::payload::Payload;
use crate::signals::GuestStack;
use crate::vcpu::{self, Vcpu};
use crate::{Gva, driver, x86};

fn bad_image(path: &Path, reason: impl Into<String>) -> KmError {
    KmError::Snapshot(SnapshotError::BadImage {
        path: path.display().to_string(),
        reason: reason.into(),
    })
}

/// Takes a snapshot of the running guest into the configured snapshot
/// path.
///
/// # Errors
///
/// Fails non-destructively when the guest holds unrestorable state or the
/// file cannot be written; the guest keeps running (live) either way.
pub fn take(
    m: &Arc<Machine>,
    initiator: Option<&Arc<Vcpu>>,
    label: &str,
    description: &str,
    live: bool,
) -> Result<()> {
    let blockers = m.fdt.snapshot_blockers();
    if !blockers.is_empty() {
        return Err(KmError::Snapshot(SnapshotError::Blocked { reason: blockers.join("; ") }));
    }
    let path = m.config.snapshot_path.clone();
    crate::coredump::dump_core(m, initiator, &path, label, description, live, 0)?;
    tracing::info!(target: "coredump", path = %path.display(), live, "snapshot taken");
    Ok(())
}

/// Serves `snapshot_getdata`: copies the configured input blob into guest
/// memory. Returns bytes read or a negative errno.
pub fn getdata(m: &Machine, buf_gva: Gva, len: u64) -> i64 {
    if m.mem.gva_to_kma(buf_gva).is_none() {
        return -i64::from(libc::EFAULT);
    }
    let Some(path) = m.config.snapshot_input.as_ref() else {
        return 0;
    };
    let mut data = Vec::new();
    match File::open(path).and_then(|mut f| f.read_to_end(&mut data)) {
        Ok(_) => {}
        Err(e) => return -i64::from(e.raw_os_error().unwrap_or(libc::EIO)),
    }
    data.truncate(len as usize);
    if !m.mem.write_bytes(buf_gva, &data) {
        return -i64::from(libc::EFAULT);
    }
    data.len() as i64
}

/// Serves `snapshot_putdata`: writes a guest blob to the configured output
/// file. Returns bytes written or a negative errno.
pub fn putdata(m: &Machine, buf_gva: Gva, len: u64) -> i64 {
    let Some(data) = m.mem.read_bytes(buf_gva, len as usize) else {
        return -i64::from(libc::EFAULT);
    };
    let Some(path) = m.config.snapshot_output.as_ref() else {
        return 0;
    };
    match File::create(path).and_then(|mut f| f.write_all(&data)) {
        Ok(()) => data.len() as i64,
        Err(e) => -i64::from(e.raw_os_error().unwrap_or(libc::EIO)),
    }
}

/// Restores a guest from an extended core file. Invoked on a fresh machine
/// in place of loading a new payload; on success the VCPU threads are
/// running and the caller proceeds to the main event loop.
///
/// # Errors
///
/// Fails on a malformed image or a backend mismatch.
pub fn restore(m: &Arc<Machine>, path: &Path) -> Result<()> {
    let file = File::open(path).map_err(|e| {
        KmError::Snapshot(SnapshotError::Io { path: path.display().to_string(), source: e })
    })?;
    // SAFETY: mapping a regular file read-only for parsing.
    let map = unsafe { Mmap::map(&file) }.map_err(|e| {
        KmError::Snapshot(SnapshotError::Io { path: path.display().to_string(), source: e })
    })?;

    let ehdr: Elf64Ehdr =
        pod_from_bytes(&map).ok_or_else(|| bad_image(path, "short ELF header"))?;
    if !ehdr.ident_ok() || ehdr.e_type != elfcore::ET_CORE || ehdr.e_machine != elfcore::EM_X86_64 {
        return Err(bad_image(path, "not an x86-64 core file"));
    }
    let mut phdrs = Vec::with_capacity(ehdr.e_phnum as usize);
    for i in 0..ehdr.e_phnum as usize {
        let off = ehdr.e_phoff as usize + i * std::mem::size_of::<Elf64Phdr>();
        let ph: Elf64Phdr = pod_from_bytes(map.get(off..).unwrap_or_default())
            .ok_or_else(|| bad_image(path, "short program header table"))?;
        phdrs.push(ph);
    }
    let note_ph = phdrs
        .iter()
        .find(|p| p.p_type == PT_NOTE)
        .ok_or_else(|| bad_image(path, "no PT_NOTE"))?;
    let note_buf = map
        .get(note_ph.p_offset as usize..(note_ph.p_offset + note_ph.p_filesz) as usize)
        .ok_or_else(|| bad_image(path, "PT_NOTE out of bounds"))?;
    let notes = elfcore::parse_notes(note_buf);

    // Backend identity gate comes first; restoring half a machine on the
    // wrong backend would be destructive.
    let mon = notes
        .iter()
        .find(|n| n.owner == KM_NT_NAME && n.ntype == NT_KM_MONITOR)
        .ok_or_else(|| bad_image(path, "no monitor note"))?;
    let mon_hdr: NtMonitor =
        pod_from_bytes(mon.desc).ok_or_else(|| bad_image(path, "short monitor note"))?;
    let running = m.driver.vm_type().identity();
    if mon_hdr.monitor_type != running {
        return Err(KmError::Snapshot(SnapshotError::BackendMismatch {
            found: mon_hdr.monitor_type,
            running,
        }));
    }

    // Memory, with consolidation off so boundaries come back verbatim.
    m.mem.mmap_set_recovery_mode(true);
    recover_memory(m, path, &map, &phdrs)?;

    // Notes in fixed order: vcpus, file labels, payload identity, signal
    // table, fd table, iocontexts.
    recover_vcpus(m, path, &notes)?;
    for n in &notes {
        if n.owner != KM_NT_NAME {
            continue;
        }
        match n.ntype {
            NT_KM_GUEST => {
                *m.guest.write().expect("payload lock poisoned") = parse_guest_note(path, n.desc)?;
            }
            NT_KM_DYNLINKER => {
                *m.dynlinker.write().expect("payload lock poisoned") =
                    parse_guest_note(path, n.desc)?;
            }
            NT_KM_SIGHAND => m.signals.recover_sighand_note(n.desc),
            NT_KM_FILE | NT_KM_SOCKET | NT_KM_EVENTFD => m.fdt.recover_note(n.ntype, n.desc),
            NT_KM_IOCONTEXTS => m.iocontexts.recover_note(n.desc),
            _ => {}
        }
    }
    if let Some(n) = notes.iter().find(|n| n.owner == elfcore::CORE_NT_NAME && n.ntype == NT_AUXV) {
        *m.auxv.lock().expect("auxv poisoned") = n.desc.to_vec();
    }
    apply_file_labels(m, &notes);
    m.mem.mmap_set_recovery_mode(false);

    // Start everything back up.
    let mut started = 0;
    for v in m.vcpus.all() {
        if v.state() == vcpu::VcpuState::Starting {
            vcpu::run_vcpu_thread(m, &v)?;
            started += 1;
        }
    }
    tracing::info!(target: "coredump", path = %path.display(), vcpus = started, "snapshot restored");
    Ok(())
}

fn pf_to_prot(flags: u32) -> i32 {
    let mut prot = 0;
    if flags & PF_R != 0 {
        prot |= libc::PROT_READ;
    }
    if flags & PF_W != 0 {
        prot |= libc::PROT_WRITE;
    }
    if flags & PF_X != 0 {
        prot |= libc::PROT_EXEC;
    }
    prot
}

fn recover_memory(m: &Arc<Machine>, path: &Path, map: &Mmap, phdrs: &[Elf64Phdr]) -> Result<()> {
    let mid = m.mem.mid();
    for ph in phdrs.iter().filter(|p| p.p_type == PT_LOAD) {
        if ph.p_vaddr < crate::mem::GUEST_MEM_START_VA || ph.p_vaddr + ph.p_memsz > m.mem.max_physmem()
        {
            return Err(bad_image(path, format!("load segment outside guest space: {:#x}", ph.p_vaddr)));
        }
        if ph.p_vaddr < mid {
            // Bottom zone: grow the break over the segment.
            let end = ph.p_vaddr + ph.p_memsz;
            if m.mem.brk() < end && m.mem.set_brk(end) < 0 {
                return Err(bad_image(path, "cannot grow brk over load segment"));
            }
        } else {
            // Arena zone: pull tbrk down and rebuild the region record.
            if m.mem.tbrk() > ph.p_vaddr && m.mem.mem_tbrk(ph.p_vaddr) < 0 {
                return Err(bad_image(path, "cannot grow arena over load segment"));
            }
            m.mem.recover_busy_region(MmapReg {
                start: ph.p_vaddr,
                size: ph.p_memsz,
                flags: libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                protection: pf_to_prot(ph.p_flags),
                km: MonFlags::default(),
                filename: None,
                offset: 0,
            });
        }
        let data = map
            .get(ph.p_offset as usize..(ph.p_offset + ph.p_filesz) as usize)
            .ok_or_else(|| bad_image(path, "load segment out of file bounds"))?;
        // The backing starts fully writable; protections are applied below.
        // SAFETY: the destination range was bounds-checked against the
        // guest space above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                m.mem.gva_to_kma_nocheck(ph.p_vaddr),
                data.len(),
            );
        }
    }
    // Now that contents are in place, apply the recorded protections.
    for ph in phdrs.iter().filter(|p| p.p_type == PT_LOAD && p.p_vaddr >= mid) {
        // SAFETY: ranges checked above; applying segment protection.
        unsafe {
            libc::mprotect(
                m.mem.gva_to_kma_nocheck(ph.p_vaddr).cast::<libc::c_void>(),
                ph.p_memsz as usize,
                pf_to_prot(ph.p_flags),
            );
        }
    }
    Ok(())
}

fn recover_vcpus(m: &Arc<Machine>, path: &Path, notes: &[elfcore::Note<'_>]) -> Result<()> {
    let prstatus: Vec<Prstatus> = notes
        .iter()
        .filter(|n| n.owner == elfcore::CORE_NT_NAME && n.ntype == NT_PRSTATUS)
        .filter_map(|n| pod_from_bytes(n.desc))
        .collect();
    if prstatus.is_empty() {
        return Err(bad_image(path, "no PRSTATUS notes"));
    }

    let mut restored = 0usize;
    for n in notes.iter().filter(|n| n.owner == KM_NT_NAME && n.ntype == NT_KM_VCPU) {
        let hdr: NtVcpu =
            pod_from_bytes(n.desc).ok_or_else(|| bad_image(path, "short vcpu note"))?;
        let tid = hdr.vcpu_id as i32 + 1;
        let pr = prstatus
            .iter()
            .find(|p| p.pr_pid == tid)
            .ok_or_else(|| bad_image(path, format!("no PRSTATUS for tid {tid}")))?;

        let v = vcpu::vcpu_restore(m, tid)
            .map_err(|e| bad_image(path, format!("vcpu {tid} restore failed: errno {}", -e)))?;

        let mut regs = kvm_bindings::kvm_regs {
            r15: pr.pr_reg[greg::R15],
            r14: pr.pr_reg[greg::R14],
            r13: pr.pr_reg[greg::R13],
            r12: pr.pr_reg[greg::R12],
            rbp: pr.pr_reg[greg::RBP],
            rbx: pr.pr_reg[greg::RBX],
            r11: pr.pr_reg[greg::R11],
            r10: pr.pr_reg[greg::R10],
            r9: pr.pr_reg[greg::R9],
            r8: pr.pr_reg[greg::R8],
            rax: pr.pr_reg[greg::RAX],
            rcx: pr.pr_reg[greg::RCX],
            rdx: pr.pr_reg[greg::RDX],
            rsi: pr.pr_reg[greg::RSI],
            rdi: pr.pr_reg[greg::RDI],
            rip: pr.pr_reg[greg::RIP],
            rflags: pr.pr_reg[greg::EFLAGS] | x86::X86_RFLAGS_FIXED,
            rsp: pr.pr_reg[greg::RSP],
            ..Default::default()
        };
        if regs.rflags == 0 {
            regs.rflags = x86::X86_RFLAGS_FIXED;
        }
        v.write_regs(regs);
        let mut sregs = v.read_sregs();
        sregs.fs.base = hdr.guest_thr;
        sregs.gs.base = pr.pr_reg[greg::GS_BASE];
        v.write_sregs(sregs);

        let fp_off = std::mem::size_of::<NtVcpu>();
        let fmt = driver::FpFormat::from_u32(hdr.fp_format);
        if fmt != driver::FpFormat::None && n.desc.len() > fp_off {
            if let Err(e) = v.hv().fpstate_restore(&n.desc[fp_off..], fmt) {
                return Err(bad_image(path, format!("vcpu {tid} fpstate: {e}")));
            }
        }

        {
            let mut guest = v.guest.lock().expect("vcpu guest state poisoned");
            guest.stack_top = hdr.stack_top;
            guest.guest_thr = hdr.guest_thr;
            guest.set_child_tid = hdr.set_child_tid;
            guest.clear_child_tid = hdr.clear_child_tid;
            guest.sigaltstack = GuestStack {
                ss_sp: hdr.sigaltstack_sp,
                ss_flags: hdr.sigaltstack_flags as i32,
                pad: 0,
                ss_size: hdr.sigaltstack_size,
            };
            guest.mapself_base = hdr.mapself_base;
            guest.mapself_size = hdr.mapself_size;
        }
        {
            let mut thr = v.thr.lock().expect("thr mutex poisoned");
            thr.hypercall = hdr.hypercall;
            thr.restart = hdr.restart != 0;
        }
        m.signals.set_thread_mask(v.id, hdr.sigmask);
        restored += 1;
    }
    if restored == 0 {
        return Err(bad_image(path, "no vcpu notes"));
    }
    Ok(())
}

fn parse_guest_note(path: &Path, desc: &[u8]) -> Result<Option<Payload>> {
    let hdr: NtGuest = pod_from_bytes(desc).ok_or_else(|| bad_image(path, "short guest note"))?;
    let mut off = std::mem::size_of::<NtGuest>();
    let mut phdrs = Vec::with_capacity(hdr.ehdr.e_phnum as usize);
    for _ in 0..hdr.ehdr.e_phnum {
        let ph: Elf64Phdr = pod_from_bytes(desc.get(off..).unwrap_or_default())
            .ok_or_else(|| bad_image(path, "short guest phdrs"))?;
        phdrs.push(ph);
        off += std::mem::size_of::<Elf64Phdr>();
    }
    let name_bytes = desc.get(off..).unwrap_or_default();
    let end = name_bytes.iter().position(|b| *b == 0).unwrap_or(name_bytes.len());
    let filename = String::from_utf8_lossy(&name_bytes[..end]).into_owned();
    let entry = hdr.ehdr.e_entry + hdr.load_adjust;
    Ok(Some(Payload { filename, ehdr: hdr.ehdr, phdrs, load_adjust: hdr.load_adjust, entry }))
}

fn apply_file_labels(m: &Machine, notes: &[elfcore::Note<'_>]) {
    let Some(n) =
        notes.iter().find(|n| n.owner == elfcore::CORE_NT_NAME && n.ntype == NT_FILE)
    else {
        return;
    };
    let Some(hdr) = pod_from_bytes::<NtFileHdr>(n.desc) else { return };
    let triples = std::mem::size_of::<NtFileHdr>();
    let names_off = triples + hdr.count as usize * 24;
    let mut name_cursor = names_off;
    for i in 0..hdr.count as usize {
        let off = triples + i * 24;
        let Some(start) = pod_from_bytes::<u64>(n.desc.get(off..).unwrap_or_default()) else {
            return;
        };
        let rest = n.desc.get(name_cursor..).unwrap_or_default();
        let end = rest.iter().position(|b| *b == 0).unwrap_or(rest.len());
        let name = String::from_utf8_lossy(&rest[..end]).into_owned();
        name_cursor += end + 1;
        m.mmap_set_filename_checked(start, &name);
    }
}

impl Machine {
    fn mmap_set_filename_checked(&self, start: u64, name: &str) {
        if !name.is_empty() {
            self.mem.mmap_set_filename(start, name);
        }
    }
}

/// Verifies a snapshot file is structurally valid and produced by a
/// compatible backend, without touching machine state. Used by tooling and
/// the round-trip tests.
///
/// # Errors
///
/// Same classification as [`restore`].
pub fn verify(path: &Path, running_identity: Option<u32>) -> Result<SnapshotSummary> {
    let mut file = File::open(path).map_err(|e| {
        KmError::Snapshot(SnapshotError::Io { path: path.display().to_string(), source: e })
    })?;
    file.seek(SeekFrom::Start(0)).ok();
    // SAFETY: mapping a regular file read-only for parsing.
    let map = unsafe { Mmap::map(&file) }.map_err(|e| {
        KmError::Snapshot(SnapshotError::Io { path: path.display().to_string(), source: e })
    })?;
    let ehdr: Elf64Ehdr =
        pod_from_bytes(&map).ok_or_else(|| bad_image(path, "short ELF header"))?;
    if !ehdr.ident_ok() || ehdr.e_type != elfcore::ET_CORE {
        return Err(bad_image(path, "not a core file"));
    }
    let mut summary = SnapshotSummary::default();
    for i in 0..ehdr.e_phnum as usize {
        let off = ehdr.e_phoff as usize + i * std::mem::size_of::<Elf64Phdr>();
        let ph: Elf64Phdr = pod_from_bytes(map.get(off..).unwrap_or_default())
            .ok_or_else(|| bad_image(path, "short phdrs"))?;
        match ph.p_type {
            PT_LOAD => summary.loads += 1,
            PT_NOTE => {
                let buf = map
                    .get(ph.p_offset as usize..(ph.p_offset + ph.p_filesz) as usize)
                    .ok_or_else(|| bad_image(path, "PT_NOTE out of bounds"))?;
                for n in elfcore::parse_notes(buf) {
                    match (n.owner, n.ntype) {
                        (KM_NT_NAME, NT_KM_VCPU) => summary.vcpus += 1,
                        (KM_NT_NAME, NT_KM_MONITOR) => {
                            let hdr: NtMonitor = pod_from_bytes(n.desc)
                                .ok_or_else(|| bad_image(path, "short monitor note"))?;
                            summary.monitor_type = Some(hdr.monitor_type);
                            if let Some(run) = running_identity
                                && hdr.monitor_type != run
                            {
                                return Err(KmError::Snapshot(SnapshotError::BackendMismatch {
                                    found: hdr.monitor_type,
                                    running: run,
                                }));
                            }
                        }
                        _ => summary.other_notes += 1,
                    }
                }
            }
            _ => {}
        }
    }
    if summary.monitor_type.is_none() {
        return Err(bad_image(path, "no monitor note"));
    }
    Ok(summary)
}

/// What [`verify`] found in a snapshot file.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotSummary {
    /// Number of PT_LOAD segments.
    pub loads: usize,
    /// Number of VCPU notes.
    pub vcpus: usize,
    /// Backend identity recorded in the monitor note.
    pub monitor_type: Option<u32>,
    /// Count of all other notes.
    pub other_notes: usize,
}
