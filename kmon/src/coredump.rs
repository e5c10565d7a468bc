//! Extended ELF core writer.
//!
//! Used both for fault coredumps and for snapshots: the file is a standard
//! `ET_CORE` image debuggers can open, with monitor-private notes carrying
//! everything needed to resume. Layout: ELF header, program headers, one
//! PT_NOTE holding all notes, then one PT_LOAD per guest ELF load segment
//! (the last one extended to the program break) and one per busy mmap
//! region that is mapped and not monitor-internal.

use std::fs::File;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Arc;

use crate::elfcore::{
    self, CORE_NT_NAME, Elf64Ehdr, Elf64Phdr, KM_NT_NAME, NT_AUXV, NT_FILE, NT_KM_DYNLINKER,
    NT_KM_GUEST, NT_KM_IOCONTEXTS, NT_KM_MONITOR, NT_KM_SIGHAND, NT_KM_VCPU, NT_PRSTATUS,
    NtFileHdr, NtGuest, NtMonitor, NtVcpu, PF_R, PF_W, PF_X, PT_LOAD, PT_NOTE, Prstatus, bytes_of,
    greg,
};
use crate::error::{KmError, Result, SnapshotError};
use crate::machine::Machine;
use crate::payload::Payload;
use crate::vcpu::{self, PauseKind, Vcpu};
use crate::{KM_PAGE_SIZE, rounddown, roundup};

/// One planned PT_LOAD segment.
#[derive(Debug, Clone, Copy)]
struct LoadSeg {
    gva: u64,
    size: u64,
    flags: u32,
}

fn prot_to_pf(prot: i32) -> u32 {
    let mut f = 0;
    if prot & libc::PROT_READ != 0 {
        f |= PF_R;
    }
    if prot & libc::PROT_WRITE != 0 {
        f |= PF_W;
    }
    if prot & libc::PROT_EXEC != 0 {
        f |= PF_X;
    }
    f
}

fn phdr_to_pf(p_flags: u32) -> u32 {
    p_flags & (PF_R | PF_W | PF_X)
}

/// The PT_LOAD plan: guest ELF loads extended to brk, then the busy mmap
/// regions worth dumping.
fn plan_loads(m: &Machine) -> Vec<LoadSeg> {
    let mut out = Vec::new();
    let brk = m.mem.brk();
    {
        let guest = m.guest.read().expect("payload lock poisoned");
        if let Some(p) = guest.as_ref() {
            let mut loads: Vec<&elfcore::Elf64Phdr> =
                p.phdrs.iter().filter(|ph| ph.p_type == PT_LOAD).collect();
            loads.sort_by_key(|ph| ph.p_vaddr);
            for (i, ph) in loads.iter().enumerate() {
                let start = rounddown(ph.p_vaddr + p.load_adjust, KM_PAGE_SIZE);
                let mut end = roundup(ph.p_vaddr + p.load_adjust + ph.p_memsz, KM_PAGE_SIZE);
                if i == loads.len() - 1 {
                    end = end.max(brk); // bottom zone runs to the break
                }
                if end > start {
                    out.push(LoadSeg { gva: start, size: end - start, flags: phdr_to_pf(ph.p_flags) });
                }
            }
        } else if brk > crate::mem::GUEST_MEM_START_VA {
            out.push(LoadSeg {
                gva: crate::mem::GUEST_MEM_START_VA,
                size: brk - crate::mem::GUEST_MEM_START_VA,
                flags: PF_R | PF_W,
            });
        }
    }
    for reg in m.mem.busy_regions() {
        if reg.protection == libc::PROT_NONE || reg.km.part_of_monitor {
            continue;
        }
        out.push(LoadSeg { gva: reg.start, size: reg.size, flags: prot_to_pf(reg.protection) });
    }
    out
}

fn prstatus_for(m: &Machine, vcpu: &Vcpu, cursig: i16) -> Prstatus {
    let regs = vcpu.read_regs();
    let sregs = vcpu.read_sregs();
    let mut pr = Prstatus { pr_cursig: cursig, ..Prstatus::default() };
    pr.pr_info[0] = i32::from(cursig);
    pr.pr_pid = vcpu.tid();
    pr.pr_ppid = m.ppid();
    pr.pr_pgrp = m.pid();
    pr.pr_sid = m.pid();
    let r = &mut pr.pr_reg;
    r[greg::R15] = regs.r15;
    r[greg::R14] = regs.r14;
    r[greg::R13] = regs.r13;
    r[greg::R12] = regs.r12;
    r[greg::RBP] = regs.rbp;
    r[greg::RBX] = regs.rbx;
    r[greg::R11] = regs.r11;
    r[greg::R10] = regs.r10;
    r[greg::R9] = regs.r9;
    r[greg::R8] = regs.r8;
    r[greg::RAX] = regs.rax;
    r[greg::RCX] = regs.rcx;
    r[greg::RDX] = regs.rdx;
    r[greg::RSI] = regs.rsi;
    r[greg::RDI] = regs.rdi;
    r[greg::ORIG_RAX] = u64::MAX;
    r[greg::RIP] = regs.rip;
    r[greg::CS] = u64::from(sregs.cs.selector);
    r[greg::EFLAGS] = regs.rflags;
    r[greg::RSP] = regs.rsp;
    r[greg::SS] = u64::from(sregs.ss.selector);
    r[greg::FS_BASE] = sregs.fs.base;
    r[greg::GS_BASE] = sregs.gs.base;
    r[greg::DS] = u64::from(sregs.ds.selector);
    r[greg::ES] = u64::from(sregs.es.selector);
    r[greg::FS] = u64::from(sregs.fs.selector);
    r[greg::GS] = u64::from(sregs.gs.selector);
    pr.pr_fpvalid = 1;
    pr
}

fn nt_vcpu_for(m: &Machine, vcpu: &Vcpu) -> Vec<u8> {
    let guest = *vcpu.guest.lock().expect("vcpu guest state poisoned");
    let thr = vcpu.thr.lock().expect("thr mutex poisoned");
    let hdr = NtVcpu {
        vcpu_id: vcpu.id as u32,
        pad: 0,
        stack_top: guest.stack_top,
        guest_thr: guest.guest_thr,
        set_child_tid: guest.set_child_tid,
        clear_child_tid: guest.clear_child_tid,
        sigaltstack_sp: guest.sigaltstack.ss_sp,
        sigaltstack_flags: guest.sigaltstack.ss_flags as u32,
        pad2: 0,
        sigaltstack_size: guest.sigaltstack.ss_size,
        mapself_base: guest.mapself_base,
        mapself_size: guest.mapself_size,
        hypercall: thr.hypercall,
        restart: u16::from(thr.restart),
        fp_format: m.driver.fp_format() as u32,
        sigmask: m.signals.thread_mask(vcpu.id),
    };
    drop(thr);
    let mut desc = bytes_of(&hdr).to_vec();
    let mut fp = vec![0u8; m.driver.fpstate_size()];
    if vcpu.hv().fpstate_save(&mut fp).is_ok() {
        desc.extend_from_slice(&fp);
    }
    desc
}

fn nt_guest_for(p: &Payload) -> Vec<u8> {
    let hdr = NtGuest { load_adjust: p.load_adjust, ehdr: p.ehdr };
    let mut desc = bytes_of(&hdr).to_vec();
    for ph in &p.phdrs {
        desc.extend_from_slice(bytes_of(ph));
    }
    desc.extend_from_slice(p.filename.as_bytes());
    desc.push(0);
    desc
}

fn nt_file_for(m: &Machine) -> Vec<u8> {
    let regs: Vec<_> =
        m.mem.busy_regions().into_iter().filter(|r| r.filename.is_some()).collect();
    let hdr = NtFileHdr { count: regs.len() as u64, page_size: KM_PAGE_SIZE };
    let mut desc = bytes_of(&hdr).to_vec();
    for r in &regs {
        desc.extend_from_slice(&r.start.to_le_bytes());
        desc.extend_from_slice(&(r.start + r.size).to_le_bytes());
        desc.extend_from_slice(&((r.offset as u64) / KM_PAGE_SIZE).to_le_bytes());
    }
    for r in &regs {
        desc.extend_from_slice(r.filename.as_deref().unwrap_or("").as_bytes());
        desc.push(0);
    }
    desc
}

fn build_notes(
    m: &Machine,
    ordered: &[Arc<Vcpu>],
    cursig: i16,
    label: &str,
    description: &str,
) -> Vec<u8> {
    let mut w = elfcore::NoteWriter::new();

    // Debuggers treat the first PRSTATUS as the current thread, so the
    // initiator (or faulting VCPU) goes first.
    for (i, v) in ordered.iter().enumerate() {
        let sig = if i == 0 { cursig } else { 0 };
        w.add(CORE_NT_NAME, NT_PRSTATUS, bytes_of(&prstatus_for(m, v, sig)));
    }
    w.add(CORE_NT_NAME, NT_AUXV, &m.auxv.lock().expect("auxv poisoned"));
    let nt_file = nt_file_for(m);
    if nt_file.len() > std::mem::size_of::<NtFileHdr>() {
        w.add(CORE_NT_NAME, NT_FILE, &nt_file);
    }

    let mon = NtMonitor {
        monitor_type: m.driver.vm_type().identity(),
        label_length: label.len() as u32 + 1,
        description_length: description.len() as u32 + 1,
    };
    let mut mon_desc = bytes_of(&mon).to_vec();
    mon_desc.extend_from_slice(label.as_bytes());
    mon_desc.push(0);
    mon_desc.extend_from_slice(description.as_bytes());
    mon_desc.push(0);
    w.add(KM_NT_NAME, NT_KM_MONITOR, &mon_desc);

    if let Some(p) = m.guest.read().expect("payload lock poisoned").as_ref() {
        w.add(KM_NT_NAME, NT_KM_GUEST, &nt_guest_for(p));
    }
    if let Some(p) = m.dynlinker.read().expect("payload lock poisoned").as_ref() {
        w.add(KM_NT_NAME, NT_KM_DYNLINKER, &nt_guest_for(p));
    }
    for v in ordered {
        w.add(KM_NT_NAME, NT_KM_VCPU, &nt_vcpu_for(m, v));
    }
    let sighand = m.signals.sighand_note();
    if !sighand.is_empty() {
        w.add(KM_NT_NAME, NT_KM_SIGHAND, &sighand);
    }
    for (ntype, desc) in m.fdt.snapshot_notes() {
        w.add(KM_NT_NAME, ntype, &desc);
    }
    let ioctx = m.iocontexts.to_note();
    if !ioctx.is_empty() {
        w.add(KM_NT_NAME, NT_KM_IOCONTEXTS, &ioctx);
    }
    w.finish()
}

/// Write chunk size for guest memory.
const DUMP_CHUNK: u64 = 1 << 20;

fn write_segment(m: &Machine, file: &File, seg: &LoadSeg, file_off: u64) -> Result<()> {
    let fd = file.as_raw_fd();
    // SAFETY: positioning an owned descriptor.
    if unsafe { libc::lseek64(fd, file_off as i64, libc::SEEK_SET) } < 0 {
        return Err(KmError::Io(std::io::Error::last_os_error()));
    }
    let mut done = 0;
    while done < seg.size {
        let chunk = DUMP_CHUNK.min(seg.size - done);
        let kma = m.mem.gva_to_kma_nocheck(seg.gva + done);
        // SAFETY: the range lies inside the backing reservation; EFAULT
        // from an unreadable page is handled below.
        let rc = unsafe { libc::write(fd, kma.cast::<libc::c_void>(), chunk as usize) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EFAULT) {
                // Unreadable guest pages leave a hole in the file.
                // SAFETY: plain seek.
                if unsafe { libc::lseek64(fd, chunk as i64, libc::SEEK_CUR) } < 0 {
                    return Err(KmError::Io(std::io::Error::last_os_error()));
                }
                done += chunk;
                continue;
            }
            return Err(KmError::Io(err));
        }
        done += rc as u64;
    }
    Ok(())
}

/// Dumps the machine into an extended core file at `path`.
///
/// Pauses every VCPU (excluding the initiator, which is already out of the
/// guest), writes the image, and resumes iff `live`.
///
/// # Errors
///
/// Fails on file I/O errors; the guest is left intact either way.
pub fn dump_core(
    m: &Arc<Machine>,
    initiator: Option<&Arc<Vcpu>>,
    path: &Path,
    label: &str,
    description: &str,
    live: bool,
    cursig: i16,
) -> Result<()> {
    vcpu::pause_all(m, initiator.map(|v| v.as_ref()), PauseKind::All);
    let result = dump_core_paused(m, initiator, path, label, description, cursig);
    if live {
        vcpu::resume_all(m);
    }
    result
}

fn dump_core_paused(
    m: &Arc<Machine>,
    initiator: Option<&Arc<Vcpu>>,
    path: &Path,
    label: &str,
    description: &str,
    cursig: i16,
) -> Result<()> {
    // Initiator (or faulting VCPU) first; debuggers call that "current".
    let mut ordered: Vec<Arc<Vcpu>> = Vec::new();
    if let Some(v) = initiator {
        ordered.push(Arc::clone(v));
    }
    for v in m.vcpus.all() {
        if v.state() == vcpu::VcpuState::ParkedIdle {
            continue;
        }
        if initiator.is_some_and(|i| i.id == v.id) {
            continue;
        }
        ordered.push(v);
    }

    let notes = build_notes(m, &ordered, cursig, label, description);
    let loads = plan_loads(m);

    // Regions mapped without read permission cannot be dumped as-is;
    // loosen them for the copy and put the protection back after.
    let mut loosened = Vec::new();
    for reg in m.mem.busy_regions() {
        if reg.protection != libc::PROT_NONE
            && reg.protection & libc::PROT_READ == 0
            && !reg.km.part_of_monitor
        {
            // SAFETY: the region lies inside the backing reservation.
            unsafe {
                libc::mprotect(
                    m.mem.gva_to_kma_nocheck(reg.start).cast::<libc::c_void>(),
                    reg.size as usize,
                    reg.protection | libc::PROT_READ,
                );
            }
            loosened.push(reg);
        }
    }

    let result = (|| -> Result<()> {
        let mut file = File::create(path).map_err(|e| {
            KmError::Snapshot(SnapshotError::Io { path: path.display().to_string(), source: e })
        })?;

        let phnum = 1 + loads.len() as u16;
        let ehdr = Elf64Ehdr::core(phnum);
        let headers_size =
            std::mem::size_of::<Elf64Ehdr>() as u64 + u64::from(phnum) * std::mem::size_of::<Elf64Phdr>() as u64;
        let note_off = headers_size;
        let mut data_off = roundup(note_off + notes.len() as u64, KM_PAGE_SIZE);

        let mut phdrs = Vec::with_capacity(phnum as usize);
        phdrs.push(Elf64Phdr {
            p_type: PT_NOTE,
            p_flags: PF_R,
            p_offset: note_off,
            p_filesz: notes.len() as u64,
            ..Elf64Phdr::default()
        });
        for seg in &loads {
            phdrs.push(Elf64Phdr {
                p_type: PT_LOAD,
                p_flags: seg.flags,
                p_offset: data_off,
                p_vaddr: seg.gva,
                p_paddr: 0,
                p_filesz: seg.size,
                p_memsz: seg.size,
                p_align: KM_PAGE_SIZE,
            });
            data_off += roundup(seg.size, KM_PAGE_SIZE);
        }

        file.write_all(bytes_of(&ehdr))?;
        for ph in &phdrs {
            file.write_all(bytes_of(ph))?;
        }
        file.write_all(&notes)?;
        for (seg, ph) in loads.iter().zip(phdrs.iter().skip(1)) {
            write_segment(m, &file, seg, ph.p_offset)?;
        }
        file.flush()?;
        Ok(())
    })();

    for reg in loosened {
        // SAFETY: as above; restoring the recorded protection.
        unsafe {
            libc::mprotect(
                m.mem.gva_to_kma_nocheck(reg.start).cast::<libc::c_void>(),
                reg.size as usize,
                reg.protection,
            );
        }
    }

    if result.is_ok() {
        tracing::info!(
            target: "coredump",
            path = %path.display(),
            vcpus = ordered.len(),
            loads = loads.len(),
            "core written"
        );
    }
    result
}
