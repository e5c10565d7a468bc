//! Hypercall numbering, argument record, and the dispatch table.
//!
//! The payload invokes a hypercall with `outl (u32)&HcArgs, PORT_BASE + n`
//! where `n` is the Linux x86-64 syscall number for calls with a direct
//! mapping, plus a small monitor-specific range above the syscall numbers.
//! The 32-bit OUT datum is the low half of the guest pointer to the
//! argument record; the guest runtime keeps the record in low memory.
//!
//! Every handler has the same contract: translate any pointer-bearing
//! argument through `gva_to_kma` (uniformly answering `-EFAULT` for a bad
//! pointer without touching the host call), write the payload's return
//! value into `hc_ret`, and tell the run loop how to proceed.

use std::sync::atomic::Ordering;
use std::sync::{Arc, LazyLock};

use crate::machine::Machine;
use crate::signals::{self, GuestStack, KmSigAction, SigSet};
use crate::vcpu::{self, Vcpu};
use crate::{Gva, snapshot};

/// First I/O port of the hypercall range.
pub const HC_PORT_BASE: u16 = 0x8000;

/// One past the highest hypercall number.
pub const HC_TABLE_SIZE: usize = 512;

/// True when a port lies in the hypercall range.
#[must_use]
pub fn is_hypercall_port(port: u16) -> bool {
    (HC_PORT_BASE..HC_PORT_BASE + HC_TABLE_SIZE as u16).contains(&port)
}

// Monitor-specific call numbers, above the syscall range.

/// Injected-IDT-stub fault report.
pub const HC_GUEST_INTERRUPT: u16 = 500;
/// Deferred unmap of the calling thread's own stack, then stop.
pub const HC_UNMAPSELF: u16 = 501;
/// Snapshot request.
pub const HC_SNAPSHOT: u16 = 502;
/// Read the application blob saved alongside a snapshot.
pub const HC_SNAPSHOT_GETDATA: u16 = 503;
/// Write an application blob alongside the snapshot.
pub const HC_SNAPSHOT_PUTDATA: u16 = 504;
/// dlopen-family seam (resolved by an external collaborator).
pub const HC_DLOPEN: u16 = 505;
/// dlsym through the same seam.
pub const HC_DLSYM: u16 = 506;
/// dlclose through the same seam.
pub const HC_DLCLOSE: u16 = 507;

/// The in-guest-memory hypercall argument record.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct HcArgs {
    /// Up to six syscall-style arguments.
    pub arg: [u64; 6],
    /// The payload's return value, written by the handler.
    pub hc_ret: u64,
    /// Guest-visible errno for callers that want it split out.
    pub hc_errno: u32,
    /// Reserved.
    pub pad: u32,
}

/// What the run loop does after a hypercall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HcStatus {
    /// Resume the guest.
    Continue,
    /// The calling guest thread stopped.
    Stop,
    /// The whole payload called `exit_group`.
    AllStop,
    /// A non-thread clone: the top-level loop performs the host fork.
    DoFork,
}

type HcFn = fn(&Arc<Machine>, &Arc<Vcpu>, u16, &mut HcArgs) -> HcStatus;

/// Linux x86-64 syscall numbers the dispatcher maps directly.
mod sysno {
    pub const READ: u16 = 0;
    pub const WRITE: u16 = 1;
    pub const OPEN: u16 = 2;
    pub const CLOSE: u16 = 3;
    pub const FSTAT: u16 = 5;
    pub const LSEEK: u16 = 8;
    pub const MMAP: u16 = 9;
    pub const MPROTECT: u16 = 10;
    pub const MUNMAP: u16 = 11;
    pub const BRK: u16 = 12;
    pub const RT_SIGACTION: u16 = 13;
    pub const RT_SIGPROCMASK: u16 = 14;
    pub const RT_SIGRETURN: u16 = 15;
    pub const PREAD64: u16 = 17;
    pub const PWRITE64: u16 = 18;
    pub const READV: u16 = 19;
    pub const WRITEV: u16 = 20;
    pub const SCHED_YIELD: u16 = 24;
    pub const MREMAP: u16 = 25;
    pub const MSYNC: u16 = 26;
    pub const MADVISE: u16 = 28;
    pub const DUP: u16 = 32;
    pub const NANOSLEEP: u16 = 35;
    pub const GETPID: u16 = 39;
    pub const CLONE: u16 = 56;
    pub const FORK: u16 = 57;
    pub const VFORK: u16 = 58;
    pub const EXECVE: u16 = 59;
    pub const EXIT: u16 = 60;
    pub const KILL: u16 = 62;
    pub const UNAME: u16 = 63;
    pub const FCNTL: u16 = 72;
    pub const GETUID: u16 = 102;
    pub const GETGID: u16 = 104;
    pub const GETEUID: u16 = 107;
    pub const GETEGID: u16 = 108;
    pub const GETPPID: u16 = 110;
    pub const SIGALTSTACK: u16 = 131;
    pub const RT_SIGPENDING: u16 = 127;
    pub const RT_SIGTIMEDWAIT: u16 = 128;
    pub const RT_SIGSUSPEND: u16 = 130;
    pub const ARCH_PRCTL: u16 = 158;
    pub const GETTID: u16 = 186;
    pub const TKILL: u16 = 200;
    pub const FUTEX: u16 = 202;
    pub const IO_SETUP: u16 = 206;
    pub const IO_DESTROY: u16 = 207;
    pub const SET_TID_ADDRESS: u16 = 218;
    pub const CLOCK_GETTIME: u16 = 228;
    pub const EXIT_GROUP: u16 = 231;
    pub const TGKILL: u16 = 234;
    pub const OPENAT: u16 = 257;
    pub const GETRANDOM: u16 = 318;
}

fn errno_ret(rc: i64) -> u64 {
    rc as u64
}

fn host_errno() -> i64 {
    -i64::from(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL))
}

/// Runs a raw host syscall and folds the kernel convention into a signed
/// result.
///
/// # Safety
///
/// The caller must pass arguments valid for the given syscall number; any
/// pointer arguments must reference memory that stays alive for the call.
unsafe fn raw_syscall(num: libc::c_long, args: [u64; 6]) -> i64 {
    // SAFETY: forwarded verbatim under the caller's contract.
    let rc = unsafe {
        libc::syscall(num, args[0], args[1], args[2], args[3], args[4], args[5])
    };
    if rc == -1 { host_errno() } else { rc }
}

// ── Dispatch ────────────────────────────────────────────────────────

static TABLE: LazyLock<[Option<HcFn>; HC_TABLE_SIZE]> = LazyLock::new(|| {
    let mut t: [Option<HcFn>; HC_TABLE_SIZE] = [None; HC_TABLE_SIZE];
    use sysno as s;
    // memory
    t[s::BRK as usize] = Some(hc_brk);
    t[s::MMAP as usize] = Some(hc_mmap);
    t[s::MPROTECT as usize] = Some(hc_mprotect);
    t[s::MUNMAP as usize] = Some(hc_munmap);
    t[s::MREMAP as usize] = Some(hc_mremap);
    t[s::MADVISE as usize] = Some(hc_madvise);
    t[s::MSYNC as usize] = Some(hc_msync);
    // signals
    t[s::RT_SIGACTION as usize] = Some(hc_rt_sigaction);
    t[s::RT_SIGPROCMASK as usize] = Some(hc_rt_sigprocmask);
    t[s::RT_SIGPENDING as usize] = Some(hc_rt_sigpending);
    t[s::RT_SIGTIMEDWAIT as usize] = Some(hc_rt_sigtimedwait);
    t[s::RT_SIGSUSPEND as usize] = Some(hc_rt_sigsuspend);
    t[s::SIGALTSTACK as usize] = Some(hc_sigaltstack);
    t[s::KILL as usize] = Some(hc_kill);
    t[s::TKILL as usize] = Some(hc_tkill);
    t[s::TGKILL as usize] = Some(hc_tgkill);
    // threads and process
    t[s::CLONE as usize] = Some(hc_clone);
    t[s::FORK as usize] = Some(hc_fork);
    t[s::VFORK as usize] = Some(hc_fork);
    t[s::EXECVE as usize] = Some(hc_execve);
    t[s::EXIT as usize] = Some(hc_exit);
    t[s::EXIT_GROUP as usize] = Some(hc_exit_group);
    t[s::SET_TID_ADDRESS as usize] = Some(hc_set_tid_address);
    t[s::GETTID as usize] = Some(hc_gettid);
    t[s::GETPID as usize] = Some(hc_getpid);
    t[s::GETPPID as usize] = Some(hc_getppid);
    t[s::GETUID as usize] = Some(hc_getid);
    t[s::GETGID as usize] = Some(hc_getid);
    t[s::GETEUID as usize] = Some(hc_getid);
    t[s::GETEGID as usize] = Some(hc_getid);
    t[s::ARCH_PRCTL as usize] = Some(hc_arch_prctl);
    t[s::SCHED_YIELD as usize] = Some(hc_sched_yield);
    t[s::FUTEX as usize] = Some(hc_futex);
    t[s::UNAME as usize] = Some(hc_uname);
    t[s::NANOSLEEP as usize] = Some(hc_nanosleep);
    t[s::CLOCK_GETTIME as usize] = Some(hc_clock_gettime);
    t[s::GETRANDOM as usize] = Some(hc_getrandom);
    // file I/O through the filesystem collaborator
    t[s::READ as usize] = Some(hc_prw);
    t[s::WRITE as usize] = Some(hc_prw);
    t[s::PREAD64 as usize] = Some(hc_prw);
    t[s::PWRITE64 as usize] = Some(hc_prw);
    t[s::READV as usize] = Some(hc_prwv);
    t[s::WRITEV as usize] = Some(hc_prwv);
    t[s::OPEN as usize] = Some(hc_open);
    t[s::OPENAT as usize] = Some(hc_openat);
    t[s::CLOSE as usize] = Some(hc_close);
    t[s::LSEEK as usize] = Some(hc_lseek);
    t[s::DUP as usize] = Some(hc_dup);
    t[s::FCNTL as usize] = Some(hc_fcntl);
    t[s::FSTAT as usize] = Some(hc_fstat);
    // async IO contexts
    t[s::IO_SETUP as usize] = Some(hc_io_setup);
    t[s::IO_DESTROY as usize] = Some(hc_io_destroy);
    // monitor-specific range
    t[HC_GUEST_INTERRUPT as usize] = Some(hc_guest_interrupt);
    t[HC_UNMAPSELF as usize] = Some(hc_unmapself);
    t[HC_SNAPSHOT as usize] = Some(hc_snapshot);
    t[HC_SNAPSHOT_GETDATA as usize] = Some(hc_snapshot_getdata);
    t[HC_SNAPSHOT_PUTDATA as usize] = Some(hc_snapshot_putdata);
    t[HC_DLOPEN as usize] = Some(hc_dl);
    t[HC_DLSYM as usize] = Some(hc_dl);
    t[HC_DLCLOSE as usize] = Some(hc_dl);
    t
});

/// Decodes and runs one hypercall. `value` is the low half of the guest
/// pointer to the argument record.
pub fn dispatch(m: &Arc<Machine>, vcpu: &Arc<Vcpu>, port: u16, value: u32) -> HcStatus {
    let hc = port - HC_PORT_BASE;
    {
        let mut thr = vcpu.thr.lock().expect("thr mutex poisoned");
        thr.hypercall = hc;
        thr.restart = false;
    }
    vcpu.hypercall_returns_signal.store(false, Ordering::Release);

    // rt_sigreturn bypasses argument translation entirely: it restores the
    // register banks from the frame and never writes hc_ret.
    if hc == sysno::RT_SIGRETURN {
        signals::rt_sigreturn(m, vcpu);
        return HcStatus::Continue;
    }

    let args_gva = Gva::from(value);
    let Some(kma) = m.mem.gva_to_kma(args_gva) else {
        tracing::warn!(target: "vcpu", hc, args = format_args!("{args_gva:#x}"), "bad hypercall args pointer");
        m.post_fault(vcpu, libc::SIGSEGV, 1 /* SEGV_MAPERR */, args_gva);
        return HcStatus::Continue;
    };
    vcpu.hcarg_gva.store(args_gva, Ordering::Release);
    // SAFETY: the record was translated above; the guest thread that owns
    // it is blocked in this very hypercall, so the monitor is the only
    // writer.
    let args = unsafe { &mut *kma.cast::<HcArgs>() };

    let Some(handler) = TABLE.get(hc as usize).copied().flatten() else {
        tracing::debug!(target: "vcpu", hc, "unimplemented hypercall");
        args.hc_ret = errno_ret(-i64::from(libc::ENOSYS));
        args.hc_errno = libc::ENOSYS as u32;
        return HcStatus::Continue;
    };
    let status = handler(m, vcpu, hc, args);
    if status != HcStatus::DoFork {
        // The fork result lands later, from the rendezvous.
        let ret = args.hc_ret as i64;
        args.hc_errno = if ret < 0 { (-ret) as u32 } else { 0 };
    }
    tracing::trace!(target: "vcpu", vcpu_id = vcpu.id, hc, "hypercall");
    status
}

// ── Memory handlers ─────────────────────────────────────────────────

fn hc_brk(m: &Arc<Machine>, _vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    args.hc_ret = errno_ret(m.mem.set_brk(args.arg[0]));
    HcStatus::Continue
}

fn hc_mmap(m: &Arc<Machine>, _vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    args.hc_ret = errno_ret(m.mem.guest_mmap(
        m.fdt.as_ref(),
        args.arg[0],
        args.arg[1],
        args.arg[2] as i32,
        args.arg[3] as i32,
        args.arg[4] as i32,
        args.arg[5] as i64,
    ));
    HcStatus::Continue
}

fn hc_mprotect(m: &Arc<Machine>, _vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    args.hc_ret = errno_ret(m.mem.guest_mprotect(args.arg[0], args.arg[1], args.arg[2] as i32));
    HcStatus::Continue
}

fn hc_munmap(m: &Arc<Machine>, vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    let (addr, size) = (args.arg[0], args.arg[1]);
    // Detached threads unmap their own stack right before exiting; the
    // monitor still needs that stack to deliver the result and accept the
    // exit call, so the unmap is recorded and deferred to thread stop.
    let stack_top = vcpu.guest.lock().expect("vcpu guest state poisoned").stack_top;
    if addr <= stack_top && stack_top < addr + size {
        let mut guest = vcpu.guest.lock().expect("vcpu guest state poisoned");
        debug_assert!(guest.mapself_size == 0);
        guest.mapself_base = addr;
        guest.mapself_size = size;
        args.hc_ret = 0;
        tracing::debug!(target: "mmap", addr = format_args!("{addr:#x}"), "self-stack munmap deferred");
        return HcStatus::Continue;
    }
    args.hc_ret = errno_ret(m.mem.guest_munmap(addr, size));
    HcStatus::Continue
}

fn hc_mremap(m: &Arc<Machine>, _vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    args.hc_ret = errno_ret(m.mem.guest_mremap(
        args.arg[0],
        args.arg[1],
        args.arg[2],
        args.arg[3] as i32,
    ));
    HcStatus::Continue
}

fn hc_madvise(m: &Arc<Machine>, _vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    args.hc_ret = errno_ret(m.mem.guest_madvise(args.arg[0], args.arg[1], args.arg[2] as i32));
    HcStatus::Continue
}

fn hc_msync(m: &Arc<Machine>, _vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    args.hc_ret = errno_ret(m.mem.guest_msync(args.arg[0], args.arg[1], args.arg[2] as i32));
    HcStatus::Continue
}

// ── Signal handlers ─────────────────────────────────────────────────

/// The guest's `k_sigaction` wire layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct GuestSigactionWire {
    handler: u64,
    flags: u64,
    restorer: u64,
    mask: u64,
}

fn hc_rt_sigaction(m: &Arc<Machine>, _vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    let (signo, new_gva, old_gva, setsize) =
        (args.arg[0] as i32, args.arg[1], args.arg[2], args.arg[3]);
    if setsize != 8 {
        args.hc_ret = errno_ret(-i64::from(libc::EINVAL));
        return HcStatus::Continue;
    }
    let new = if new_gva != 0 {
        let Some(w) = m.mem.read_obj::<GuestSigactionWire>(new_gva) else {
            args.hc_ret = errno_ret(-i64::from(libc::EFAULT));
            return HcStatus::Continue;
        };
        Some(KmSigAction {
            handler: w.handler,
            flags: w.flags as u32,
            restorer: w.restorer,
            mask: w.mask,
        })
    } else {
        None
    };
    if old_gva != 0 && m.mem.gva_to_kma(old_gva).is_none() {
        args.hc_ret = errno_ret(-i64::from(libc::EFAULT));
        return HcStatus::Continue;
    }
    let mut old = KmSigAction::default();
    let rc = m.signals.sigaction(signo, new, if old_gva != 0 { Some(&mut old) } else { None });
    if rc == 0 && old_gva != 0 {
        let w = GuestSigactionWire {
            handler: old.handler,
            flags: u64::from(old.flags),
            restorer: old.restorer,
            mask: old.mask,
        };
        m.mem.write_obj(old_gva, w);
    }
    args.hc_ret = errno_ret(rc);
    HcStatus::Continue
}

fn hc_rt_sigprocmask(m: &Arc<Machine>, vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    let (how, set_gva, old_gva, setsize) =
        (args.arg[0] as i32, args.arg[1], args.arg[2], args.arg[3]);
    if setsize != 8 {
        args.hc_ret = errno_ret(-i64::from(libc::EINVAL));
        return HcStatus::Continue;
    }
    let set = if set_gva != 0 {
        match m.mem.read_obj::<SigSet>(set_gva) {
            Some(s) => Some(s),
            None => {
                args.hc_ret = errno_ret(-i64::from(libc::EFAULT));
                return HcStatus::Continue;
            }
        }
    } else {
        None
    };
    let mut old: SigSet = 0;
    let rc =
        m.signals.sigprocmask(vcpu.id, how, set, if old_gva != 0 { Some(&mut old) } else { None });
    if rc == 0 && old_gva != 0 && !m.mem.write_obj(old_gva, old) {
        args.hc_ret = errno_ret(-i64::from(libc::EFAULT));
        return HcStatus::Continue;
    }
    args.hc_ret = errno_ret(rc);
    HcStatus::Continue
}

fn hc_rt_sigpending(m: &Arc<Machine>, vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    let (set_gva, setsize) = (args.arg[0], args.arg[1]);
    if setsize != 8 {
        args.hc_ret = errno_ret(-i64::from(libc::EINVAL));
        return HcStatus::Continue;
    }
    let pending = m.signals.pending_set(vcpu.id);
    args.hc_ret = if m.mem.write_obj(set_gva, pending) {
        0
    } else {
        errno_ret(-i64::from(libc::EFAULT))
    };
    HcStatus::Continue
}

fn hc_rt_sigtimedwait(m: &Arc<Machine>, vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    let (set_gva, info_gva, timeout_gva, setsize) =
        (args.arg[0], args.arg[1], args.arg[2], args.arg[3]);
    if setsize != 8 {
        args.hc_ret = errno_ret(-i64::from(libc::EINVAL));
        return HcStatus::Continue;
    }
    let Some(set) = m.mem.read_obj::<SigSet>(set_gva) else {
        args.hc_ret = errno_ret(-i64::from(libc::EFAULT));
        return HcStatus::Continue;
    };
    let deadline = if timeout_gva != 0 {
        let Some(ts) = m.mem.read_obj::<[i64; 2]>(timeout_gva) else {
            args.hc_ret = errno_ret(-i64::from(libc::EFAULT));
            return HcStatus::Continue;
        };
        Some(
            std::time::Instant::now()
                + std::time::Duration::new(ts[0].max(0) as u64, (ts[1].max(0) as u32).min(999_999_999)),
        )
    } else {
        None
    };
    match m.signals.wait_from_set(vcpu.id, set, deadline, &m.exit_group) {
        Some(info) => {
            if info_gva != 0 {
                m.mem.write_obj(info_gva, signals::GuestSiginfo::encode(&info));
            }
            args.hc_ret = info.signo as u64;
        }
        None => {
            args.hc_ret = errno_ret(-i64::from(if deadline.is_some() {
                libc::EAGAIN
            } else {
                libc::EINTR
            }));
        }
    }
    HcStatus::Continue
}

fn hc_rt_sigsuspend(m: &Arc<Machine>, vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    let (mask_gva, setsize) = (args.arg[0], args.arg[1]);
    if setsize != 8 {
        args.hc_ret = errno_ret(-i64::from(libc::EINVAL));
        return HcStatus::Continue;
    }
    let Some(mask) = m.mem.read_obj::<SigSet>(mask_gva) else {
        args.hc_ret = errno_ret(-i64::from(libc::EFAULT));
        return HcStatus::Continue;
    };
    m.signals.sigsuspend_enter(vcpu.id, mask);
    m.signals.wait_deliverable(vcpu.id, &m.exit_group);
    // Always EINTR; the pending signal is delivered on the way back into
    // the guest, under the caller-supplied mask. sigreturn reverts it.
    args.hc_ret = errno_ret(-i64::from(libc::EINTR));
    HcStatus::Continue
}

fn hc_sigaltstack(m: &Arc<Machine>, vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    let (new_gva, old_gva) = (args.arg[0], args.arg[1]);
    let rsp = vcpu.read_regs().rsp;
    let mut guest = vcpu.guest.lock().expect("vcpu guest state poisoned");
    if old_gva != 0 {
        let mut out = guest.sigaltstack;
        if out.ss_size == 0 {
            out.ss_flags = signals::SS_DISABLE;
        } else if guest.sigaltstack.ss_sp <= rsp
            && rsp < guest.sigaltstack.ss_sp + guest.sigaltstack.ss_size
        {
            out.ss_flags = signals::SS_ONSTACK;
        }
        if !m.mem.write_obj(old_gva, out) {
            args.hc_ret = errno_ret(-i64::from(libc::EFAULT));
            return HcStatus::Continue;
        }
    }
    if new_gva != 0 {
        let Some(new) = m.mem.read_obj::<GuestStack>(new_gva) else {
            args.hc_ret = errno_ret(-i64::from(libc::EFAULT));
            return HcStatus::Continue;
        };
        // The stack in use cannot be replaced.
        if guest.sigaltstack.ss_size != 0
            && guest.sigaltstack.ss_sp <= rsp
            && rsp < guest.sigaltstack.ss_sp + guest.sigaltstack.ss_size
        {
            args.hc_ret = errno_ret(-i64::from(libc::EPERM));
            return HcStatus::Continue;
        }
        if new.ss_flags & signals::SS_DISABLE != 0 {
            guest.sigaltstack = GuestStack::default();
        } else {
            if new.ss_size < 2048 {
                args.hc_ret = errno_ret(-i64::from(libc::ENOMEM));
                return HcStatus::Continue;
            }
            guest.sigaltstack = new;
        }
    }
    args.hc_ret = 0;
    HcStatus::Continue
}

fn hc_kill(m: &Arc<Machine>, vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    let (pid, signo) = (args.arg[0] as i32, args.arg[1] as i32);
    args.hc_ret = errno_ret(m.post_kill(vcpu, pid, signo));
    HcStatus::Continue
}

fn hc_tkill(m: &Arc<Machine>, vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    let (tid, signo) = (args.arg[0] as i32, args.arg[1] as i32);
    args.hc_ret = errno_ret(m.post_tkill(vcpu, tid, signo));
    HcStatus::Continue
}

fn hc_tgkill(m: &Arc<Machine>, vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    let (tgid, tid, signo) = (args.arg[0] as i32, args.arg[1] as i32, args.arg[2] as i32);
    if tgid != m.pid() {
        args.hc_ret = errno_ret(-i64::from(libc::ESRCH));
        return HcStatus::Continue;
    }
    args.hc_ret = errno_ret(m.post_tkill(vcpu, tid, signo));
    HcStatus::Continue
}

// ── Thread and process handlers ─────────────────────────────────────

const CLONE_VM: u64 = 0x100;
const CLONE_THREAD: u64 = 0x10000;
const CLONE_SETTLS: u64 = 0x80000;
const CLONE_PARENT_SETTID: u64 = 0x100000;
const CLONE_CHILD_CLEARTID: u64 = 0x200000;
const CLONE_CHILD_SETTID: u64 = 0x1000000;

fn hc_clone(m: &Arc<Machine>, vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    let flags = args.arg[0];
    if flags & CLONE_THREAD == 0 {
        // Process clone: the host fork happens on the top-level loop.
        return HcStatus::DoFork;
    }
    if flags & CLONE_VM == 0 {
        args.hc_ret = errno_ret(-i64::from(libc::EINVAL));
        return HcStatus::Continue;
    }
    let child_stack = args.arg[1];
    let (ptid, ctid, newtls) = (args.arg[2], args.arg[3], args.arg[4]);
    args.hc_ret = errno_ret(clone_thread(m, vcpu, flags, child_stack, ptid, ctid, newtls));
    HcStatus::Continue
}

/// `clone(CLONE_THREAD)`: acquire a VCPU, seed it with the parent's
/// context, and activate its thread. Returns the child tid or `-errno`.
fn clone_thread(
    m: &Arc<Machine>,
    parent: &Arc<Vcpu>,
    flags: u64,
    child_stack: Gva,
    ptid: Gva,
    ctid: Gva,
    newtls: Gva,
) -> i64 {
    if child_stack == 0 || m.mem.gva_to_kma(child_stack - 8).is_none() {
        return -i64::from(libc::EINVAL);
    }
    let child = match vcpu::vcpu_get(m) {
        Ok(c) => c,
        Err(e) => return e,
    };

    // The child resumes at the instruction after the OUT with RAX = 0.
    parent.hv().sync_rip();
    parent.invalidate_regs();
    let mut regs = parent.read_regs();
    let mut sp = child_stack & !7u64;
    sp -= (sp + 8) % 16; // odd 8-byte boundary for the clone trampoline
    regs.rax = 0;
    regs.rsp = sp;
    child.write_regs(regs);

    let mut sregs = parent.read_sregs();
    if flags & CLONE_SETTLS != 0 {
        sregs.fs.base = newtls;
    }
    child.write_sregs(sregs);

    // FP state follows the parent.
    let mut fp = vec![0u8; m.driver.fpstate_size()];
    if parent.hv().fpstate_save(&mut fp).is_ok()
        && let Err(e) = child.hv().fpstate_restore(&fp, m.driver.fp_format())
    {
        tracing::warn!(target: "vcpu", error = %e, "clone fpstate copy failed");
    }

    let child_tid = child.tid();
    {
        let mut guest = child.guest.lock().expect("vcpu guest state poisoned");
        guest.stack_top = sp;
        guest.guest_thr = if flags & CLONE_SETTLS != 0 { newtls } else { 0 };
        guest.set_child_tid = if flags & CLONE_CHILD_SETTID != 0 { ctid } else { 0 };
        guest.clear_child_tid = if flags & CLONE_CHILD_CLEARTID != 0 { ctid } else { 0 };
    }
    if flags & CLONE_CHILD_SETTID != 0 && ctid != 0 {
        m.mem.write_obj::<u32>(ctid, child_tid as u32);
    }
    if flags & CLONE_PARENT_SETTID != 0 && ptid != 0 && !m.mem.write_obj::<u32>(ptid, child_tid as u32)
    {
        vcpu::vcpu_put(m, &child);
        return -i64::from(libc::EFAULT);
    }

    if let Err(e) = vcpu::run_vcpu_thread(m, &child) {
        tracing::warn!(target: "vcpu", error = %e, "child thread spawn failed");
        vcpu::vcpu_put(m, &child);
        return -i64::from(libc::EAGAIN);
    }
    tracing::debug!(target: "fork", parent = parent.tid(), child = child_tid, "thread cloned");
    i64::from(child_tid)
}

fn hc_fork(_m: &Arc<Machine>, _vcpu: &Arc<Vcpu>, _hc: u16, _args: &mut HcArgs) -> HcStatus {
    HcStatus::DoFork
}

fn hc_execve(m: &Arc<Machine>, vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    args.hc_ret = errno_ret(crate::exec::guest_execve(m, vcpu, args.arg[0], args.arg[1], args.arg[2]));
    HcStatus::Continue
}

fn hc_exit(m: &Arc<Machine>, vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    tracing::debug!(target: "vcpu", tid = vcpu.tid(), status = args.arg[0], "thread exit");
    let _ = m;
    HcStatus::Stop
}

fn hc_exit_group(m: &Arc<Machine>, _vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    m.set_exit_status(args.arg[0] as i32);
    HcStatus::AllStop
}

fn hc_set_tid_address(m: &Arc<Machine>, vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    let _ = m;
    let mut guest = vcpu.guest.lock().expect("vcpu guest state poisoned");
    guest.clear_child_tid = args.arg[0];
    args.hc_ret = vcpu.tid() as u64;
    HcStatus::Continue
}

fn hc_gettid(_m: &Arc<Machine>, vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    args.hc_ret = vcpu.tid() as u64;
    HcStatus::Continue
}

fn hc_getpid(m: &Arc<Machine>, _vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    args.hc_ret = m.pid() as u64;
    HcStatus::Continue
}

fn hc_getppid(m: &Arc<Machine>, _vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    args.hc_ret = m.ppid() as u64;
    HcStatus::Continue
}

fn hc_getid(_m: &Arc<Machine>, _vcpu: &Arc<Vcpu>, hc: u16, args: &mut HcArgs) -> HcStatus {
    // SAFETY: id syscalls take no arguments and cannot fail.
    args.hc_ret = unsafe { raw_syscall(libc::c_long::from(hc), [0; 6]) as u64 };
    HcStatus::Continue
}

const ARCH_SET_FS: u64 = 0x1002;
const ARCH_GET_FS: u64 = 0x1003;

fn hc_arch_prctl(m: &Arc<Machine>, vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    match args.arg[0] {
        ARCH_SET_FS => {
            // FS.base carries the guest pthread pointer.
            if m.mem.gva_to_kma(args.arg[1]).is_none() {
                args.hc_ret = errno_ret(-i64::from(libc::EPERM));
                return HcStatus::Continue;
            }
            let mut sregs = vcpu.read_sregs();
            sregs.fs.base = args.arg[1];
            vcpu.write_sregs(sregs);
            vcpu.guest.lock().expect("vcpu guest state poisoned").guest_thr = args.arg[1];
            args.hc_ret = 0;
        }
        ARCH_GET_FS => {
            let thr = vcpu.guest.lock().expect("vcpu guest state poisoned").guest_thr;
            args.hc_ret = if m.mem.write_obj(args.arg[1], thr) {
                0
            } else {
                errno_ret(-i64::from(libc::EFAULT))
            };
        }
        _ => args.hc_ret = errno_ret(-i64::from(libc::ENOTSUP)),
    }
    HcStatus::Continue
}

fn hc_sched_yield(_m: &Arc<Machine>, _vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    // SAFETY: no arguments.
    args.hc_ret = unsafe { raw_syscall(libc::SYS_sched_yield, [0; 6]) as u64 };
    HcStatus::Continue
}

fn hc_futex(m: &Arc<Machine>, _vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    let Some(uaddr) = m.mem.gva_to_kma(args.arg[0]) else {
        args.hc_ret = errno_ret(-i64::from(libc::EFAULT));
        return HcStatus::Continue;
    };
    let op = args.arg[1];
    // arg4 is either a timeout pointer or val2 depending on the op; both
    // pointer-bearing variants translate, the rest pass through.
    const FUTEX_WAIT: u64 = 0;
    const FUTEX_WAIT_BITSET: u64 = 9;
    const FUTEX_CMD_MASK: u64 = 0x7f;
    let a3 = match op & FUTEX_CMD_MASK {
        FUTEX_WAIT | FUTEX_WAIT_BITSET if args.arg[3] != 0 => {
            match m.mem.gva_to_kma(args.arg[3]) {
                Some(p) => p as u64,
                None => {
                    args.hc_ret = errno_ret(-i64::from(libc::EFAULT));
                    return HcStatus::Continue;
                }
            }
        }
        _ => args.arg[3],
    };
    let a4 = if args.arg[4] != 0 {
        match m.mem.gva_to_kma(args.arg[4]) {
            Some(p) => p as u64,
            None => args.arg[4], // requeue target value, not a pointer, for some ops
        }
    } else {
        0
    };
    // SAFETY: uaddr and any pointer arguments were translated to live
    // monitor mappings above.
    args.hc_ret = unsafe {
        raw_syscall(libc::SYS_futex, [uaddr as u64, op, args.arg[2], a3, a4, args.arg[5]]) as u64
    };
    HcStatus::Continue
}

fn hc_uname(m: &Arc<Machine>, _vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    const FIELD: usize = 65;
    let gva = args.arg[0];
    if m.mem.gva_to_kma(gva).is_none() || m.mem.gva_to_kma(gva + (6 * FIELD - 1) as u64).is_none() {
        args.hc_ret = errno_ret(-i64::from(libc::EFAULT));
        return HcStatus::Continue;
    }
    let mut buf = [0u8; 6 * FIELD];
    let put = |buf: &mut [u8; 6 * FIELD], idx: usize, s: &str| {
        let b = s.as_bytes();
        let n = b.len().min(FIELD - 1);
        buf[idx * FIELD..idx * FIELD + n].copy_from_slice(&b[..n]);
    };
    put(&mut buf, 0, "Linux");
    put(&mut buf, 1, "kmon");
    put(&mut buf, 2, "5.15.0");
    put(&mut buf, 3, "#1 SMP kmon");
    put(&mut buf, 4, "x86_64");
    m.mem.write_bytes(gva, &buf);
    args.hc_ret = 0;
    HcStatus::Continue
}

fn hc_nanosleep(m: &Arc<Machine>, _vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    let Some(req) = m.mem.gva_to_kma(args.arg[0]) else {
        args.hc_ret = errno_ret(-i64::from(libc::EFAULT));
        return HcStatus::Continue;
    };
    let rem = if args.arg[1] != 0 {
        match m.mem.gva_to_kma(args.arg[1]) {
            Some(p) => p as u64,
            None => {
                args.hc_ret = errno_ret(-i64::from(libc::EFAULT));
                return HcStatus::Continue;
            }
        }
    } else {
        0
    };
    // SAFETY: both pointers translated above.
    args.hc_ret = unsafe { raw_syscall(libc::SYS_nanosleep, [req as u64, rem, 0, 0, 0, 0]) as u64 };
    HcStatus::Continue
}

fn hc_clock_gettime(m: &Arc<Machine>, _vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    let Some(ts) = m.mem.gva_to_kma(args.arg[1]) else {
        args.hc_ret = errno_ret(-i64::from(libc::EFAULT));
        return HcStatus::Continue;
    };
    // SAFETY: the timespec pointer was translated above.
    args.hc_ret =
        unsafe { raw_syscall(libc::SYS_clock_gettime, [args.arg[0], ts as u64, 0, 0, 0, 0]) as u64 };
    HcStatus::Continue
}

fn hc_getrandom(m: &Arc<Machine>, _vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    let Some(buf) = m.mem.gva_to_kma(args.arg[0]) else {
        args.hc_ret = errno_ret(-i64::from(libc::EFAULT));
        return HcStatus::Continue;
    };
    if args.arg[1] > 0 && m.mem.gva_to_kma(args.arg[0] + args.arg[1] - 1).is_none() {
        args.hc_ret = errno_ret(-i64::from(libc::EFAULT));
        return HcStatus::Continue;
    }
    // SAFETY: the buffer range was translated above.
    args.hc_ret = unsafe {
        raw_syscall(libc::SYS_getrandom, [buf as u64, args.arg[1], args.arg[2], 0, 0, 0]) as u64
    };
    HcStatus::Continue
}

// ── File I/O handlers (through the filesystem collaborator) ─────────

fn translate_fd(m: &Machine, guest_fd: u64) -> Result<i32, i64> {
    m.fdt.host_fd(guest_fd as i32).ok_or(-i64::from(libc::EBADF))
}

fn hc_prw(m: &Arc<Machine>, _vcpu: &Arc<Vcpu>, hc: u16, args: &mut HcArgs) -> HcStatus {
    let hostfd = match translate_fd(m, args.arg[0]) {
        Ok(fd) => fd,
        Err(e) => {
            args.hc_ret = errno_ret(e);
            return HcStatus::Continue;
        }
    };
    let Some(buf) = m.mem.gva_to_kma(args.arg[1]) else {
        args.hc_ret = errno_ret(-i64::from(libc::EFAULT));
        return HcStatus::Continue;
    };
    if args.arg[2] > 0 && m.mem.gva_to_kma(args.arg[1] + args.arg[2] - 1).is_none() {
        args.hc_ret = errno_ret(-i64::from(libc::EFAULT));
        return HcStatus::Continue;
    }
    // SAFETY: the buffer range was translated above; read/pread ignore the
    // offset argument when the call number says so.
    args.hc_ret = unsafe {
        raw_syscall(
            libc::c_long::from(hc),
            [hostfd as u64, buf as u64, args.arg[2], args.arg[3], 0, 0],
        ) as u64
    };
    HcStatus::Continue
}

/// Guest iovec layout.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct GuestIovec {
    base: u64,
    len: u64,
}

fn hc_prwv(m: &Arc<Machine>, _vcpu: &Arc<Vcpu>, hc: u16, args: &mut HcArgs) -> HcStatus {
    const IOV_MAX: u64 = 1024;
    let hostfd = match translate_fd(m, args.arg[0]) {
        Ok(fd) => fd,
        Err(e) => {
            args.hc_ret = errno_ret(e);
            return HcStatus::Continue;
        }
    };
    let iovcnt = args.arg[2];
    if iovcnt > IOV_MAX {
        args.hc_ret = errno_ret(-i64::from(libc::EINVAL));
        return HcStatus::Continue;
    }
    let mut host_iov = Vec::with_capacity(iovcnt as usize);
    for i in 0..iovcnt {
        let Some(gv) = m.mem.read_obj::<GuestIovec>(args.arg[1] + i * 16) else {
            args.hc_ret = errno_ret(-i64::from(libc::EFAULT));
            return HcStatus::Continue;
        };
        let base = if gv.len == 0 {
            std::ptr::null_mut()
        } else {
            match m.mem.gva_to_kma(gv.base) {
                Some(p) => p,
                None => {
                    args.hc_ret = errno_ret(-i64::from(libc::EFAULT));
                    return HcStatus::Continue;
                }
            }
        };
        host_iov.push(libc::iovec { iov_base: base.cast::<libc::c_void>(), iov_len: gv.len as usize });
    }
    // SAFETY: every iovec base was translated; the vector outlives the call.
    args.hc_ret = unsafe {
        raw_syscall(
            libc::c_long::from(hc),
            [hostfd as u64, host_iov.as_ptr() as u64, iovcnt, args.arg[3], 0, 0],
        ) as u64
    };
    HcStatus::Continue
}

fn hc_open(m: &Arc<Machine>, vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    // open(path, flags, mode) == openat(AT_FDCWD, ...)
    let shifted = HcArgs {
        arg: [libc::AT_FDCWD as u64, args.arg[0], args.arg[1], args.arg[2], 0, 0],
        ..*args
    };
    let mut tmp = shifted;
    let st = hc_openat(m, vcpu, sysno::OPENAT, &mut tmp);
    args.hc_ret = tmp.hc_ret;
    st
}

fn hc_openat(m: &Arc<Machine>, _vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    let dirfd = args.arg[0] as i32;
    let host_dirfd = if dirfd == libc::AT_FDCWD {
        libc::AT_FDCWD
    } else {
        match translate_fd(m, args.arg[0]) {
            Ok(fd) => fd,
            Err(e) => {
                args.hc_ret = errno_ret(e);
                return HcStatus::Continue;
            }
        }
    };
    let Some(path) = m.mem.read_cstr(args.arg[1], libc::PATH_MAX as usize) else {
        args.hc_ret = errno_ret(-i64::from(libc::EFAULT));
        return HcStatus::Continue;
    };
    let cpath = std::ffi::CString::new(path.clone()).unwrap_or_default();
    // SAFETY: cpath is a valid NUL-terminated string for the call duration.
    let rc = unsafe {
        raw_syscall(
            libc::SYS_openat,
            [host_dirfd as u64, cpath.as_ptr() as u64, args.arg[2], args.arg[3], 0, 0],
        )
    };
    if rc >= 0 {
        m.fdt.install(rc as i32, rc as i32, Some(path));
    }
    args.hc_ret = errno_ret(rc);
    HcStatus::Continue
}

fn hc_close(m: &Arc<Machine>, _vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    let hostfd = match translate_fd(m, args.arg[0]) {
        Ok(fd) => fd,
        Err(e) => {
            args.hc_ret = errno_ret(e);
            return HcStatus::Continue;
        }
    };
    // SAFETY: plain close of a translated descriptor.
    let rc = unsafe { raw_syscall(libc::SYS_close, [hostfd as u64, 0, 0, 0, 0, 0]) };
    if rc == 0 {
        m.fdt.remove(args.arg[0] as i32);
    }
    args.hc_ret = errno_ret(rc);
    HcStatus::Continue
}

fn hc_lseek(m: &Arc<Machine>, _vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    let hostfd = match translate_fd(m, args.arg[0]) {
        Ok(fd) => fd,
        Err(e) => {
            args.hc_ret = errno_ret(e);
            return HcStatus::Continue;
        }
    };
    // SAFETY: no pointer arguments.
    args.hc_ret = unsafe {
        raw_syscall(libc::SYS_lseek, [hostfd as u64, args.arg[1], args.arg[2], 0, 0, 0]) as u64
    };
    HcStatus::Continue
}

fn hc_dup(m: &Arc<Machine>, _vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    let hostfd = match translate_fd(m, args.arg[0]) {
        Ok(fd) => fd,
        Err(e) => {
            args.hc_ret = errno_ret(e);
            return HcStatus::Continue;
        }
    };
    // SAFETY: no pointer arguments.
    let rc = unsafe { raw_syscall(libc::SYS_dup, [hostfd as u64, 0, 0, 0, 0, 0]) };
    if rc >= 0 {
        m.fdt.install(rc as i32, rc as i32, m.fdt.fd_name(args.arg[0] as i32));
    }
    args.hc_ret = errno_ret(rc);
    HcStatus::Continue
}

fn hc_fcntl(m: &Arc<Machine>, _vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    let hostfd = match translate_fd(m, args.arg[0]) {
        Ok(fd) => fd,
        Err(e) => {
            args.hc_ret = errno_ret(e);
            return HcStatus::Continue;
        }
    };
    let cmd = args.arg[1] as i32;
    match cmd {
        libc::F_GETFL | libc::F_SETFL | libc::F_GETFD | libc::F_SETFD | libc::F_DUPFD
        | libc::F_DUPFD_CLOEXEC => {
            // SAFETY: value-argument fcntl commands only.
            let rc = unsafe {
                raw_syscall(libc::SYS_fcntl, [hostfd as u64, args.arg[1], args.arg[2], 0, 0, 0])
            };
            if rc >= 0 && (cmd == libc::F_DUPFD || cmd == libc::F_DUPFD_CLOEXEC) {
                m.fdt.install(rc as i32, rc as i32, m.fdt.fd_name(args.arg[0] as i32));
            }
            args.hc_ret = errno_ret(rc);
        }
        _ => args.hc_ret = errno_ret(-i64::from(libc::EINVAL)),
    }
    HcStatus::Continue
}

fn hc_fstat(m: &Arc<Machine>, _vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    let hostfd = match translate_fd(m, args.arg[0]) {
        Ok(fd) => fd,
        Err(e) => {
            args.hc_ret = errno_ret(e);
            return HcStatus::Continue;
        }
    };
    let statbuf_len = std::mem::size_of::<libc::stat>() as u64;
    let Some(buf) = m.mem.gva_to_kma(args.arg[1]) else {
        args.hc_ret = errno_ret(-i64::from(libc::EFAULT));
        return HcStatus::Continue;
    };
    if m.mem.gva_to_kma(args.arg[1] + statbuf_len - 1).is_none() {
        args.hc_ret = errno_ret(-i64::from(libc::EFAULT));
        return HcStatus::Continue;
    }
    // SAFETY: the stat buffer range was translated above.
    args.hc_ret =
        unsafe { raw_syscall(libc::SYS_fstat, [hostfd as u64, buf as u64, 0, 0, 0, 0]) as u64 };
    HcStatus::Continue
}

// ── Async-IO contexts ───────────────────────────────────────────────

fn hc_io_setup(m: &Arc<Machine>, _vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    let Some(ctx_gva) = Some(args.arg[1]).filter(|g| m.mem.gva_to_kma(*g).is_some()) else {
        args.hc_ret = errno_ret(-i64::from(libc::EFAULT));
        return HcStatus::Continue;
    };
    let mut host_ctx: u64 = 0;
    // SAFETY: host_ctx lives on this stack for the call duration.
    let rc = unsafe {
        raw_syscall(
            libc::SYS_io_setup,
            [args.arg[0], std::ptr::addr_of_mut!(host_ctx) as u64, 0, 0, 0, 0],
        )
    };
    if rc == 0 {
        let guest_id = m.iocontexts.insert(host_ctx);
        m.mem.write_obj(ctx_gva, guest_id);
    }
    args.hc_ret = errno_ret(rc);
    HcStatus::Continue
}

fn hc_io_destroy(m: &Arc<Machine>, _vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    let Some(host_ctx) = m.iocontexts.remove(args.arg[0]) else {
        args.hc_ret = errno_ret(-i64::from(libc::EINVAL));
        return HcStatus::Continue;
    };
    // SAFETY: no pointer arguments.
    args.hc_ret = unsafe { raw_syscall(libc::SYS_io_destroy, [host_ctx, 0, 0, 0, 0, 0]) as u64 };
    HcStatus::Continue
}

// ── Monitor-specific handlers ───────────────────────────────────────

fn hc_guest_interrupt(m: &Arc<Machine>, vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    let (vector, error_code, fault_addr) = (args.arg[0], args.arg[1], args.arg[2]);
    let (signo, code) = match vector {
        0 => (libc::SIGFPE, 1),                                // #DE → FPE_INTDIV
        6 => (libc::SIGILL, 2),                                // #UD → ILL_ILLOPN
        13 => (libc::SIGSEGV, libc::SI_KERNEL),                // #GP
        14 if error_code & 1 == 0 => (libc::SIGSEGV, 1),       // #PF → SEGV_MAPERR
        14 => (libc::SIGSEGV, 2),                              // #PF → SEGV_ACCERR
        _ => (libc::SIGBUS, libc::SI_KERNEL),
    };
    tracing::debug!(
        target: "signals",
        vcpu_id = vcpu.id,
        vector,
        fault_addr = format_args!("{fault_addr:#x}"),
        "guest interrupt"
    );
    m.post_fault(vcpu, signo, code, fault_addr);
    args.hc_ret = 0;
    HcStatus::Continue
}

fn hc_unmapself(m: &Arc<Machine>, vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    let _ = m;
    let mut guest = vcpu.guest.lock().expect("vcpu guest state poisoned");
    guest.mapself_base = args.arg[0];
    guest.mapself_size = args.arg[1];
    tracing::debug!(
        target: "mmap",
        tid = vcpu.tid(),
        base = format_args!("{:#x}", args.arg[0]),
        "unmapself recorded, stopping thread"
    );
    HcStatus::Stop
}

fn hc_snapshot(m: &Arc<Machine>, vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    let live = args.arg[0] != 0;
    let label = if args.arg[1] != 0 {
        m.mem.read_cstr(args.arg[1], 256).unwrap_or_default()
    } else {
        String::new()
    };
    let description = if args.arg[2] != 0 {
        m.mem.read_cstr(args.arg[2], 1024).unwrap_or_default()
    } else {
        String::new()
    };
    match snapshot::take(m, Some(vcpu), &label, &description, live) {
        Ok(()) => {
            args.hc_ret = 0;
            if live { HcStatus::Continue } else { HcStatus::AllStop }
        }
        Err(e) => {
            tracing::warn!(target: "coredump", error = %e, "snapshot refused");
            args.hc_ret = errno_ret(-i64::from(libc::EBUSY));
            HcStatus::Continue
        }
    }
}

fn hc_snapshot_getdata(m: &Arc<Machine>, _vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    args.hc_ret = errno_ret(snapshot::getdata(m, args.arg[0], args.arg[1]));
    HcStatus::Continue
}

fn hc_snapshot_putdata(m: &Arc<Machine>, _vcpu: &Arc<Vcpu>, _hc: u16, args: &mut HcArgs) -> HcStatus {
    args.hc_ret = errno_ret(snapshot::putdata(m, args.arg[0], args.arg[1]));
    HcStatus::Continue
}

fn hc_dl(m: &Arc<Machine>, _vcpu: &Arc<Vcpu>, hc: u16, args: &mut HcArgs) -> HcStatus {
    // Dynamic-loading requests resolve through an external collaborator.
    args.hc_ret = errno_ret(m.dl.resolve(hc, args.arg[0], args.arg[1]));
    HcStatus::Continue
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_range() {
        assert!(is_hypercall_port(HC_PORT_BASE));
        assert!(is_hypercall_port(HC_PORT_BASE + 231));
        assert!(!is_hypercall_port(HC_PORT_BASE - 1));
        assert!(!is_hypercall_port(HC_PORT_BASE + HC_TABLE_SIZE as u16));
    }

    #[test]
    fn table_covers_core_calls() {
        for hc in [
            sysno::MMAP,
            sysno::BRK,
            sysno::RT_SIGACTION,
            sysno::CLONE,
            sysno::EXIT_GROUP,
            HC_SNAPSHOT,
            HC_UNMAPSELF,
            HC_GUEST_INTERRUPT,
        ] {
            assert!(TABLE[hc as usize].is_some(), "missing handler {hc}");
        }
        // rt_sigreturn is dispatched out of band, never through the table.
        assert!(TABLE[sysno::RT_SIGRETURN as usize].is_none());
    }

    #[test]
    fn hcargs_layout() {
        assert_eq!(std::mem::size_of::<HcArgs>(), 64);
        assert_eq!(std::mem::offset_of!(HcArgs, hc_ret), 48);
        assert_eq!(std::mem::offset_of!(HcArgs, hc_errno), 56);
    }
}
