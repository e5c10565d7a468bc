//! Guest signal subsystem.
//!
//! One process-wide sigaction table, one process-pending queue, and one
//! pending queue per VCPU (thread), all guarded by a single signal mutex.
//! Queues hold value entries drawn from a bounded pool so posting never
//! allocates on the delivery path. Delivery synthesizes the Linux x86-64
//! signal frame in guest memory and redirects the VCPU to the handler; the
//! `rt_sigreturn` hypercall unwinds it.
//!
//! The monitor reserves `SIGRTMAX-1` on the host (`SIGVCPUSTOP`) to kick
//! VCPUs out of the blocking run ioctl; it never becomes guest-visible.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::machine::Machine;
use crate::vcpu::Vcpu;
use crate::{Gva, elfcore};

/// Number of guest signals (1-based signo, `1..NSIG`).
pub const NSIG: usize = 64;

/// Guest signal set: bit `signo-1` set means the signal is a member.
pub type SigSet = u64;

/// `SIG_DFL` handler sentinel.
pub const SIG_DFL: Gva = 0;
/// `SIG_IGN` handler sentinel.
pub const SIG_IGN: Gva = 1;

/// `sigaction` flag: deliver on the alternate stack.
pub const SA_ONSTACK: u32 = 0x0800_0000;
/// `sigaction` flag: don't add the signal to the mask during delivery.
pub const SA_NODEFER: u32 = 0x4000_0000;
/// `sigaction` flag: handler takes siginfo.
pub const SA_SIGINFO: u32 = 0x0000_0004;
/// `sigaction` flag: an explicit restorer trampoline is provided.
pub const SA_RESTORER: u32 = 0x0400_0000;

/// `sigaltstack` flag: thread is executing on the alternate stack.
pub const SS_ONSTACK: i32 = 1;
/// `sigaltstack` flag: alternate stack is disabled.
pub const SS_DISABLE: i32 = 2;

/// The host signal reserved to break VCPUs out of the run ioctl.
#[must_use]
pub fn sig_vcpu_stop() -> i32 {
    libc::SIGRTMAX() - 1
}

/// Adds `signo` to a set.
pub fn sigaddset(set: &mut SigSet, signo: i32) {
    if (1..NSIG as i32).contains(&signo) {
        *set |= 1u64 << (signo - 1);
    }
}

/// Removes `signo` from a set.
pub fn sigdelset(set: &mut SigSet, signo: i32) {
    if (1..NSIG as i32).contains(&signo) {
        *set &= !(1u64 << (signo - 1));
    }
}

/// Membership test.
#[must_use]
pub fn sigismember(set: SigSet, signo: i32) -> bool {
    (1..NSIG as i32).contains(&signo) && set & (1u64 << (signo - 1)) != 0
}

/// One guest sigaction table entry (matches the guest's `k_sigaction`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KmSigAction {
    /// Guest handler address, or the `SIG_DFL`/`SIG_IGN` sentinels.
    pub handler: Gva,
    /// `SA_*` flags.
    pub flags: u32,
    /// Guest restorer trampoline.
    pub restorer: Gva,
    /// Signals blocked while the handler runs.
    pub mask: SigSet,
}

/// The monitor-side essence of a queued signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SigInfo {
    /// Signal number.
    pub signo: i32,
    /// `si_errno`.
    pub errno: i32,
    /// `si_code`.
    pub code: i32,
    /// Faulting address for synchronous signals.
    pub addr: Gva,
    /// Sending pid for kill-family signals.
    pub pid: i32,
    /// Sending uid for kill-family signals.
    pub uid: u32,
}

#[derive(Debug, Clone, Copy)]
struct SigEntry {
    info: SigInfo,
    synchronous: bool,
}

/// Per-thread signal state, indexed by VCPU id in the hub.
#[derive(Debug, Default)]
struct ThreadSig {
    mask: SigSet,
    saved_mask: SigSet,
    in_sigsuspend: bool,
    pending: Vec<SigEntry>,
}

struct SigInner {
    actions: [KmSigAction; NSIG],
    process_pending: Vec<SigEntry>,
    threads: Vec<ThreadSig>,
}

/// The process-wide signal hub: sigaction table plus every pending queue,
/// all under one mutex.
pub struct SignalHub {
    inner: Mutex<SigInner>,
    wait_cv: Condvar,
}

/// Bound on queued-but-undelivered signals per process, mirroring the
/// bounded entry pool.
const PENDING_MAX: usize = 1024;

impl Default for SignalHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalHub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        let mut process_pending = Vec::new();
        process_pending.reserve_exact(PENDING_MAX);
        Self {
            inner: Mutex::new(SigInner {
                actions: [KmSigAction::default(); NSIG],
                process_pending,
                threads: Vec::new(),
            }),
            wait_cv: Condvar::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SigInner> {
        self.inner.lock().expect("signal mutex poisoned")
    }

    /// Makes room for a thread's state when a VCPU slot is allocated.
    pub fn ensure_thread(&self, vcpu_id: usize) {
        let mut inner = self.lock();
        while inner.threads.len() <= vcpu_id {
            let mut t = ThreadSig::default();
            t.pending.reserve_exact(64);
            inner.threads.push(t);
        }
    }

    /// Resets a thread's state when its VCPU is reused for a new thread.
    pub fn reset_thread(&self, vcpu_id: usize) {
        let mut inner = self.lock();
        if let Some(t) = inner.threads.get_mut(vcpu_id) {
            t.mask = 0;
            t.saved_mask = 0;
            t.in_sigsuspend = false;
            t.pending.clear();
        }
    }

    /// Guest `rt_sigaction`. Returns 0 or a negative errno.
    pub fn sigaction(
        &self,
        signo: i32,
        new: Option<KmSigAction>,
        old: Option<&mut KmSigAction>,
    ) -> i64 {
        if !(1..NSIG as i32).contains(&signo) {
            return -i64::from(libc::EINVAL);
        }
        if new.is_some() && (signo == libc::SIGKILL || signo == libc::SIGSTOP) {
            return -i64::from(libc::EINVAL);
        }
        let mut inner = self.lock();
        let idx = (signo - 1) as usize;
        if let Some(out) = old {
            *out = inner.actions[idx];
        }
        if let Some(act) = new {
            inner.actions[idx] = act;
        }
        0
    }

    /// Current action for a signal.
    #[must_use]
    pub fn action(&self, signo: i32) -> KmSigAction {
        self.lock().actions[(signo - 1) as usize]
    }

    /// The whole table for snapshot notes.
    #[must_use]
    pub fn sighand_note(&self) -> Vec<u8> {
        let inner = self.lock();
        let mut buf = Vec::new();
        for (i, act) in inner.actions.iter().enumerate() {
            if *act == KmSigAction::default() {
                continue;
            }
            let rec = elfcore::NtSighand {
                size: std::mem::size_of::<elfcore::NtSighand>() as u32,
                signo: (i + 1) as u32,
                handler: act.handler,
                flags: act.flags,
                pad: 0,
                restorer: act.restorer,
                mask: act.mask,
            };
            buf.extend_from_slice(elfcore::bytes_of(&rec));
        }
        buf
    }

    /// Rebuilds the table from a snapshot note.
    pub fn recover_sighand_note(&self, mut desc: &[u8]) {
        let mut inner = self.lock();
        let rec_size = std::mem::size_of::<elfcore::NtSighand>();
        while let Some(rec) = elfcore::pod_from_bytes::<elfcore::NtSighand>(desc) {
            let signo = rec.signo as usize;
            if (1..=NSIG).contains(&signo) {
                inner.actions[signo - 1] = KmSigAction {
                    handler: rec.handler,
                    flags: rec.flags,
                    restorer: rec.restorer,
                    mask: rec.mask,
                };
            }
            desc = &desc[rec_size..];
        }
    }

    /// Guest `rt_sigprocmask`. Returns 0 or a negative errno.
    pub fn sigprocmask(&self, vcpu_id: usize, how: i32, set: Option<SigSet>, old: Option<&mut SigSet>) -> i64 {
        let mut inner = self.lock();
        let t = &mut inner.threads[vcpu_id];
        if let Some(out) = old {
            *out = t.mask;
        }
        if let Some(set) = set {
            // SIGKILL and SIGSTOP can never be blocked.
            let set = {
                let mut s = set;
                sigdelset(&mut s, libc::SIGKILL);
                sigdelset(&mut s, libc::SIGSTOP);
                s
            };
            match how {
                libc::SIG_BLOCK => t.mask |= set,
                libc::SIG_UNBLOCK => t.mask &= !set,
                libc::SIG_SETMASK => t.mask = set,
                _ => return -i64::from(libc::EINVAL),
            }
        }
        0
    }

    /// A thread's blocked mask.
    #[must_use]
    pub fn thread_mask(&self, vcpu_id: usize) -> SigSet {
        self.lock().threads[vcpu_id].mask
    }

    /// Overwrites a thread's blocked mask (sigreturn, restore).
    pub fn set_thread_mask(&self, vcpu_id: usize, mask: SigSet) {
        self.lock().threads[vcpu_id].mask = mask;
    }

    /// Union of pending signals visible to a thread (`rt_sigpending`).
    #[must_use]
    pub fn pending_set(&self, vcpu_id: usize) -> SigSet {
        let inner = self.lock();
        let mut set = 0;
        for e in &inner.process_pending {
            sigaddset(&mut set, e.info.signo);
        }
        for e in &inner.threads[vcpu_id].pending {
            sigaddset(&mut set, e.info.signo);
        }
        set
    }

    /// Queues a thread-directed signal. Returns false when the pool is
    /// exhausted (the signal is dropped, as the kernel does for RT floods).
    pub fn post_thread(&self, vcpu_id: usize, info: SigInfo, synchronous: bool) -> bool {
        let mut inner = self.lock();
        let t = &mut inner.threads[vcpu_id];
        if t.pending.len() >= t.pending.capacity() {
            tracing::warn!(target: "signals", vcpu_id, signo = info.signo, "thread pending queue full");
            return false;
        }
        t.pending.push(SigEntry { info, synchronous });
        self.wait_cv.notify_all();
        true
    }

    /// Queues a process-directed signal.
    pub fn post_process(&self, info: SigInfo) -> bool {
        let mut inner = self.lock();
        if inner.process_pending.len() >= PENDING_MAX {
            tracing::warn!(target: "signals", signo = info.signo, "process pending queue full");
            return false;
        }
        inner.process_pending.push(SigEntry { info, synchronous: false });
        self.wait_cv.notify_all();
        true
    }

    /// True when a thread has an unblocked deliverable signal.
    #[must_use]
    pub fn has_deliverable(&self, vcpu_id: usize) -> bool {
        let inner = self.lock();
        let mask = inner.threads[vcpu_id].mask;
        inner.threads[vcpu_id].pending.iter().any(|e| !sigismember(mask, e.info.signo))
            || inner.process_pending.iter().any(|e| !sigismember(mask, e.info.signo))
    }

    /// True when any thread could deliver `signo` right now (used to pick a
    /// wake target for process-directed signals).
    #[must_use]
    pub fn thread_accepts(&self, vcpu_id: usize, signo: i32) -> bool {
        let inner = self.lock();
        inner
            .threads
            .get(vcpu_id)
            .is_some_and(|t| !sigismember(t.mask, signo))
    }

    /// Dequeues the highest-priority unblocked signal for a thread:
    /// synchronous faults first, then thread FIFO, then process FIFO.
    pub fn dequeue(&self, vcpu_id: usize) -> Option<SigInfo> {
        let mut inner = self.lock();
        let mask = inner.threads[vcpu_id].mask;
        let t = &mut inner.threads[vcpu_id];
        if let Some(idx) = t
            .pending
            .iter()
            .position(|e| e.synchronous && !sigismember(mask, e.info.signo))
            .or_else(|| t.pending.iter().position(|e| !sigismember(mask, e.info.signo)))
        {
            return Some(t.pending.remove(idx).info);
        }
        if let Some(idx) =
            inner.process_pending.iter().position(|e| !sigismember(mask, e.info.signo))
        {
            return Some(inner.process_pending.remove(idx).info);
        }
        None
    }

    /// Dequeues a pending signal from `set` regardless of the blocked mask
    /// (`rt_sigtimedwait` semantics).
    pub fn dequeue_from_set(&self, vcpu_id: usize, set: SigSet) -> Option<SigInfo> {
        let mut inner = self.lock();
        let t = &mut inner.threads[vcpu_id];
        if let Some(idx) = t.pending.iter().position(|e| sigismember(set, e.info.signo)) {
            return Some(t.pending.remove(idx).info);
        }
        if let Some(idx) = inner.process_pending.iter().position(|e| sigismember(set, e.info.signo))
        {
            return Some(inner.process_pending.remove(idx).info);
        }
        None
    }

    /// Blocks until a signal from `set` is pending, a deadline passes, or
    /// `stop` is raised. Returns the dequeued signal if one arrived.
    pub fn wait_from_set(
        &self,
        vcpu_id: usize,
        set: SigSet,
        deadline: Option<Instant>,
        stop: &AtomicBool,
    ) -> Option<SigInfo> {
        let mut inner = self.lock();
        loop {
            {
                let t = &mut inner.threads[vcpu_id];
                if let Some(idx) = t.pending.iter().position(|e| sigismember(set, e.info.signo)) {
                    return Some(t.pending.remove(idx).info);
                }
            }
            if let Some(idx) =
                inner.process_pending.iter().position(|e| sigismember(set, e.info.signo))
            {
                return Some(inner.process_pending.remove(idx).info);
            }
            if stop.load(Ordering::Acquire) {
                return None;
            }
            let wait = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return None;
                    }
                    d - now
                }
                None => Duration::from_millis(100),
            };
            let (guard, _) = self
                .wait_cv
                .wait_timeout(inner, wait)
                .expect("signal mutex poisoned");
            inner = guard;
        }
    }

    /// Blocks until the thread has an unblocked deliverable signal or
    /// `stop` is raised (`rt_sigsuspend` body).
    pub fn wait_deliverable(&self, vcpu_id: usize, stop: &AtomicBool) {
        let mut inner = self.lock();
        loop {
            let mask = inner.threads[vcpu_id].mask;
            let ready = inner.threads[vcpu_id]
                .pending
                .iter()
                .chain(inner.process_pending.iter())
                .any(|e| !sigismember(mask, e.info.signo));
            if ready || stop.load(Ordering::Acquire) {
                return;
            }
            let (guard, _) = self
                .wait_cv
                .wait_timeout(inner, Duration::from_millis(100))
                .expect("signal mutex poisoned");
            inner = guard;
        }
    }

    /// Atomically installs the sigsuspend mask, saving the previous one.
    pub fn sigsuspend_enter(&self, vcpu_id: usize, mask: SigSet) {
        let mut inner = self.lock();
        let t = &mut inner.threads[vcpu_id];
        t.saved_mask = t.mask;
        let mut m = mask;
        sigdelset(&mut m, libc::SIGKILL);
        sigdelset(&mut m, libc::SIGSTOP);
        t.mask = m;
        t.in_sigsuspend = true;
    }

    /// Restores the pre-sigsuspend mask after the waking signal's handler
    /// returned. This is sigsuspend's destructor, called from sigreturn.
    pub fn sigsuspend_revert(&self, vcpu_id: usize) {
        let mut inner = self.lock();
        let t = &mut inner.threads[vcpu_id];
        if t.in_sigsuspend {
            tracing::debug!(
                target: "signals",
                vcpu_id,
                saved = format_args!("{:#x}", t.saved_mask),
                "sigsuspend mask reverted"
            );
            t.mask = t.saved_mask;
            t.in_sigsuspend = false;
        }
    }

    /// Wakes every waiter (shutdown, pause).
    pub fn broadcast(&self) {
        self.wait_cv.notify_all();
    }
}

// ── Guest signal frame (Linux x86-64 rt frame layout) ───────────────

/// Guest `sigcontext` as the kernel lays it out inside `ucontext`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct GuestSigcontext {
    /// r8..r15.
    pub r8: u64,
    /// r9.
    pub r9: u64,
    /// r10.
    pub r10: u64,
    /// r11.
    pub r11: u64,
    /// r12.
    pub r12: u64,
    /// r13.
    pub r13: u64,
    /// r14.
    pub r14: u64,
    /// r15.
    pub r15: u64,
    /// rdi.
    pub rdi: u64,
    /// rsi.
    pub rsi: u64,
    /// rbp.
    pub rbp: u64,
    /// rbx.
    pub rbx: u64,
    /// rdx.
    pub rdx: u64,
    /// rax.
    pub rax: u64,
    /// rcx.
    pub rcx: u64,
    /// rsp.
    pub rsp: u64,
    /// rip.
    pub rip: u64,
    /// rflags.
    pub eflags: u64,
    /// cs.
    pub cs: u16,
    /// gs.
    pub gs: u16,
    /// fs.
    pub fs: u16,
    /// ss.
    pub ss: u16,
    /// Fault error code.
    pub err: u64,
    /// Fault trap number.
    pub trapno: u64,
    /// Mask in force before the signal.
    pub oldmask: u64,
    /// Faulting address.
    pub cr2: u64,
    /// Guest address of the FP state area.
    pub fpstate: u64,
    /// Reserved.
    pub reserved: [u64; 8],
}

/// Guest `stack_t`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct GuestStack {
    /// Stack base.
    pub ss_sp: u64,
    /// SS_* flags.
    pub ss_flags: i32,
    /// Padding.
    pub pad: i32,
    /// Stack size.
    pub ss_size: u64,
}

/// Guest `ucontext`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct GuestUcontext {
    /// Flags.
    pub uc_flags: u64,
    /// Linked context (unused).
    pub uc_link: u64,
    /// The stack in use when the signal arrived.
    pub uc_stack: GuestStack,
    /// Saved machine context.
    pub uc_mcontext: GuestSigcontext,
    /// Mask to restore on sigreturn.
    pub uc_sigmask: u64,
}

/// Guest `siginfo_t` (fixed 128-byte kernel layout).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct GuestSiginfo {
    /// Signal number.
    pub si_signo: i32,
    /// Errno.
    pub si_errno: i32,
    /// Code.
    pub si_code: i32,
    /// Padding.
    pub pad: i32,
    /// Union area.
    pub fields: [u64; 14],
}

impl Default for GuestSiginfo {
    fn default() -> Self {
        Self { si_signo: 0, si_errno: 0, si_code: 0, pad: 0, fields: [0; 14] }
    }
}

impl GuestSiginfo {
    /// Encodes a monitor [`SigInfo`] into the kernel wire layout.
    #[must_use]
    pub fn encode(info: &SigInfo) -> Self {
        let mut out =
            Self { si_signo: info.signo, si_errno: info.errno, si_code: info.code, ..Self::default() };
        if info.addr != 0 {
            out.fields[0] = info.addr; // si_addr for faults
        } else {
            out.fields[0] = (info.pid as u32 as u64) | (u64::from(info.uid) << 32); // si_pid, si_uid
        }
        out
    }
}

/// What delivery decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Nothing deliverable.
    None,
    /// A handler frame was installed; re-enter the guest.
    Delivered,
    /// Default action terminates the process.
    Fatal {
        /// The fatal signal.
        signo: i32,
        /// Whether POSIX calls for a core dump.
        core: bool,
    },
}

fn default_action_ignores(signo: i32) -> bool {
    matches!(signo, libc::SIGCHLD | libc::SIGURG | libc::SIGWINCH | libc::SIGCONT)
}

fn default_action_stops(signo: i32) -> bool {
    matches!(signo, libc::SIGSTOP | libc::SIGTSTP | libc::SIGTTIN | libc::SIGTTOU)
}

fn default_action_cores(signo: i32) -> bool {
    matches!(
        signo,
        libc::SIGQUIT
            | libc::SIGILL
            | libc::SIGTRAP
            | libc::SIGABRT
            | libc::SIGBUS
            | libc::SIGFPE
            | libc::SIGSEGV
            | libc::SIGXCPU
            | libc::SIGXFSZ
            | libc::SIGSYS
    )
}

/// Delivers the next unblocked pending signal to `vcpu`, if any.
///
/// `in_hypercall` marks delivery while unwinding an interrupted hypercall:
/// the dispatcher must then not overwrite RDI with the hypercall return.
pub fn deliver_next_signal(m: &Machine, vcpu: &Vcpu, in_hypercall: bool) -> Disposition {
    loop {
        let Some(info) = m.signals.dequeue(vcpu.id) else {
            return Disposition::None;
        };
        let act = m.signals.action(info.signo);
        match act.handler {
            SIG_IGN => continue,
            SIG_DFL => {
                if default_action_ignores(info.signo) {
                    continue;
                }
                if default_action_stops(info.signo) {
                    // No job control inside the VM; log and drop.
                    tracing::warn!(target: "signals", signo = info.signo, "stop signal ignored");
                    continue;
                }
                return Disposition::Fatal {
                    signo: info.signo,
                    core: default_action_cores(info.signo),
                };
            }
            _ => {
                if !deliver_signal(m, vcpu, &info, &act, in_hypercall) {
                    // The frame could not be written (stack gone); the
                    // kernel force-kills in this situation.
                    return Disposition::Fatal { signo: libc::SIGSEGV, core: true };
                }
                return Disposition::Delivered;
            }
        }
    }
}

/// Builds the signal frame for `info` and points the VCPU at the handler.
/// False when the frame cannot be written (dead stack).
pub fn deliver_signal(
    m: &Machine,
    vcpu: &Vcpu,
    info: &SigInfo,
    act: &KmSigAction,
    in_hypercall: bool,
) -> bool {
    let mut regs = vcpu.read_regs();
    let sregs = vcpu.read_sregs();
    let old_mask = m.signals.thread_mask(vcpu.id);

    let (altstack, on_altstack) = {
        let guest = vcpu.guest.lock().expect("vcpu guest state poisoned");
        let on = guest.sigaltstack.ss_size != 0
            && guest.sigaltstack.ss_sp <= regs.rsp
            && regs.rsp < guest.sigaltstack.ss_sp + guest.sigaltstack.ss_size;
        (guest.sigaltstack, on)
    };

    // Pick the stack: alternate stack if requested, installed, and not
    // already in use; otherwise the interrupted RSP below the red zone.
    let mut sp = if act.flags & SA_ONSTACK != 0
        && altstack.ss_size != 0
        && altstack.ss_flags & SS_DISABLE == 0
        && !on_altstack
    {
        altstack.ss_sp + altstack.ss_size
    } else {
        regs.rsp - 128
    };

    // FP area first (64-byte aligned), then the frame record.
    let fp_size = m.driver.fpstate_size() as u64;
    sp = (sp - fp_size) & !63;
    let fpstate_gva = sp;
    let frame_size = 8 // restorer return address
        + std::mem::size_of::<GuestUcontext>() as u64
        + std::mem::size_of::<GuestSiginfo>() as u64;
    sp = ((sp - frame_size) & !15) - 8; // handler entry: RSP ≡ 8 (mod 16)
    let frame_gva = sp;
    let uc_gva = frame_gva + 8;
    let si_gva = uc_gva + std::mem::size_of::<GuestUcontext>() as u64;

    let mut fp = vec![0u8; fp_size as usize];
    if let Err(e) = vcpu.hv().fpstate_save(&mut fp) {
        tracing::warn!(target: "signals", error = %e, "fpstate save for frame failed");
    }
    if !m.mem.write_bytes(fpstate_gva, &fp) {
        tracing::warn!(target: "signals", rsp = format_args!("{:#x}", regs.rsp), "signal frame unmapped");
        return false;
    }

    let uc = GuestUcontext {
        uc_flags: 0,
        uc_link: 0,
        uc_stack: altstack,
        uc_mcontext: GuestSigcontext {
            r8: regs.r8,
            r9: regs.r9,
            r10: regs.r10,
            r11: regs.r11,
            r12: regs.r12,
            r13: regs.r13,
            r14: regs.r14,
            r15: regs.r15,
            rdi: regs.rdi,
            rsi: regs.rsi,
            rbp: regs.rbp,
            rbx: regs.rbx,
            rdx: regs.rdx,
            rax: regs.rax,
            rcx: regs.rcx,
            rsp: regs.rsp,
            rip: regs.rip,
            eflags: regs.rflags,
            cs: sregs.cs.selector,
            gs: sregs.gs.selector,
            fs: sregs.fs.selector,
            ss: sregs.ss.selector,
            err: 0,
            trapno: 0,
            oldmask: old_mask,
            cr2: info.addr,
            fpstate: fpstate_gva,
            reserved: [0; 8],
        },
        uc_sigmask: old_mask,
    };
    let si = GuestSiginfo::encode(info);

    if !m.mem.write_obj(frame_gva, act.restorer)
        || !m.mem.write_obj(uc_gva, uc)
        || !m.mem.write_obj(si_gva, si)
    {
        tracing::warn!(target: "signals", frame = format_args!("{frame_gva:#x}"), "signal frame write failed");
        return false;
    }

    // Redirect the VCPU into the handler per the SysV signal ABI.
    regs.rip = act.handler;
    regs.rsp = frame_gva;
    regs.rdi = info.signo as u64;
    regs.rsi = si_gva;
    regs.rdx = uc_gva;
    regs.rax = 0;
    regs.rflags &= !0x400; // clear DF
    vcpu.write_regs(regs);

    // New blocked mask: sa_mask plus the signal itself unless SA_NODEFER.
    let mut new_mask = old_mask | act.mask;
    if act.flags & SA_NODEFER == 0 {
        sigaddset(&mut new_mask, info.signo);
    }
    sigdelset(&mut new_mask, libc::SIGKILL);
    sigdelset(&mut new_mask, libc::SIGSTOP);
    m.signals.set_thread_mask(vcpu.id, new_mask);

    if in_hypercall {
        vcpu.hypercall_returns_signal.store(true, Ordering::Release);
    }
    tracing::debug!(
        target: "signals",
        vcpu_id = vcpu.id,
        signo = info.signo,
        handler = format_args!("{:#x}", act.handler),
        frame = format_args!("{frame_gva:#x}"),
        "signal delivered"
    );
    true
}

/// `rt_sigreturn`: restores registers, FP state, and the pre-signal mask
/// from the frame under the current RSP. The only hypercall that bypasses
/// the normal dispatcher result path.
pub fn rt_sigreturn(m: &Machine, vcpu: &Vcpu) {
    let regs = vcpu.read_regs();
    // The restorer's RET popped the return address; RSP points at ucontext.
    let uc_gva = regs.rsp;
    let Some(uc) = m.mem.read_obj::<GuestUcontext>(uc_gva) else {
        tracing::warn!(target: "signals", rsp = format_args!("{uc_gva:#x}"), "sigreturn frame unmapped");
        m.signals.post_thread(vcpu.id, SigInfo { signo: libc::SIGSEGV, code: 1, addr: uc_gva, ..SigInfo::default() }, true);
        return;
    };

    let mc = &uc.uc_mcontext;
    let mut new_regs = regs;
    new_regs.r8 = mc.r8;
    new_regs.r9 = mc.r9;
    new_regs.r10 = mc.r10;
    new_regs.r11 = mc.r11;
    new_regs.r12 = mc.r12;
    new_regs.r13 = mc.r13;
    new_regs.r14 = mc.r14;
    new_regs.r15 = mc.r15;
    new_regs.rdi = mc.rdi;
    new_regs.rsi = mc.rsi;
    new_regs.rbp = mc.rbp;
    new_regs.rbx = mc.rbx;
    new_regs.rdx = mc.rdx;
    new_regs.rax = mc.rax;
    new_regs.rcx = mc.rcx;
    new_regs.rsp = mc.rsp;
    new_regs.rip = mc.rip;
    new_regs.rflags = mc.eflags;
    vcpu.write_regs(new_regs);

    if mc.fpstate != 0 {
        let fp_size = m.driver.fpstate_size();
        if let Some(fp) = m.mem.read_bytes(mc.fpstate, fp_size)
            && let Err(e) = vcpu.hv().fpstate_restore(&fp, m.driver.fp_format())
        {
            tracing::warn!(target: "signals", error = %e, "fpstate restore on sigreturn failed");
        }
    }

    m.signals.set_thread_mask(vcpu.id, uc.uc_sigmask);
    m.signals.sigsuspend_revert(vcpu.id);
    tracing::debug!(
        target: "signals",
        vcpu_id = vcpu.id,
        rip = format_args!("{:#x}", mc.rip),
        "sigreturn"
    );
}

/// Installs the host no-op handler for the reserved VCPU-kick signal. Must
/// run before any VCPU thread starts.
pub fn install_vcpustop_handler() {
    extern "C" fn noop(_sig: libc::c_int) {
        // Intentionally empty — only needs to interrupt the run ioctl.
    }
    // SAFETY: installing a no-op handler for a reserved real-time signal;
    // the handler itself touches nothing.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = noop as *const () as libc::sighandler_t;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(sig_vcpu_stop(), &sa, std::ptr::null_mut());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_ops() {
        let mut s: SigSet = 0;
        sigaddset(&mut s, libc::SIGUSR1);
        assert!(sigismember(s, libc::SIGUSR1));
        assert!(!sigismember(s, libc::SIGUSR2));
        sigdelset(&mut s, libc::SIGUSR1);
        assert_eq!(s, 0);
    }

    #[test]
    fn sigaction_roundtrip_is_identity() {
        let hub = SignalHub::new();
        let act = KmSigAction { handler: 0x40_0000, flags: SA_SIGINFO, restorer: 0x40_1000, mask: 0xf0 };
        assert_eq!(hub.sigaction(libc::SIGUSR1, Some(act), None), 0);
        let mut old = KmSigAction::default();
        assert_eq!(hub.sigaction(libc::SIGUSR1, None, Some(&mut old)), 0);
        assert_eq!(old, act);
        // Write old back; table unchanged.
        assert_eq!(hub.sigaction(libc::SIGUSR1, Some(old), None), 0);
        assert_eq!(hub.action(libc::SIGUSR1), act);
    }

    #[test]
    fn kill_and_stop_are_protected() {
        let hub = SignalHub::new();
        assert_eq!(
            hub.sigaction(libc::SIGKILL, Some(KmSigAction::default()), None),
            -i64::from(libc::EINVAL)
        );
        hub.ensure_thread(0);
        let mut all: SigSet = !0;
        assert_eq!(hub.sigprocmask(0, libc::SIG_SETMASK, Some(all), None), 0);
        all = hub.thread_mask(0);
        assert!(!sigismember(all, libc::SIGKILL));
        assert!(!sigismember(all, libc::SIGSTOP));
    }

    #[test]
    fn dequeue_priority_sync_first_then_fifo() {
        let hub = SignalHub::new();
        hub.ensure_thread(0);
        hub.post_thread(0, SigInfo { signo: libc::SIGUSR1, ..SigInfo::default() }, false);
        hub.post_thread(0, SigInfo { signo: libc::SIGUSR2, ..SigInfo::default() }, false);
        hub.post_thread(0, SigInfo { signo: libc::SIGSEGV, addr: 0x1000, ..SigInfo::default() }, true);
        assert_eq!(hub.dequeue(0).unwrap().signo, libc::SIGSEGV);
        assert_eq!(hub.dequeue(0).unwrap().signo, libc::SIGUSR1);
        assert_eq!(hub.dequeue(0).unwrap().signo, libc::SIGUSR2);
        assert!(hub.dequeue(0).is_none());
    }

    #[test]
    fn blocked_signals_stay_queued() {
        let hub = SignalHub::new();
        hub.ensure_thread(0);
        let mut m: SigSet = 0;
        sigaddset(&mut m, libc::SIGUSR1);
        hub.sigprocmask(0, libc::SIG_SETMASK, Some(m), None);
        hub.post_thread(0, SigInfo { signo: libc::SIGUSR1, ..SigInfo::default() }, false);
        assert!(!hub.has_deliverable(0));
        assert!(hub.dequeue(0).is_none());
        assert!(sigismember(hub.pending_set(0), libc::SIGUSR1));
        hub.sigprocmask(0, libc::SIG_SETMASK, Some(0), None);
        assert!(hub.has_deliverable(0));
        assert_eq!(hub.dequeue(0).unwrap().signo, libc::SIGUSR1);
    }

    #[test]
    fn sigsuspend_saves_and_reverts() {
        let hub = SignalHub::new();
        hub.ensure_thread(0);
        let mut orig: SigSet = 0;
        sigaddset(&mut orig, libc::SIGUSR2);
        hub.sigprocmask(0, libc::SIG_SETMASK, Some(orig), None);
        hub.sigsuspend_enter(0, 0);
        assert_eq!(hub.thread_mask(0), 0);
        hub.sigsuspend_revert(0);
        assert_eq!(hub.thread_mask(0), orig);
        // Revert is idempotent.
        hub.sigsuspend_revert(0);
        assert_eq!(hub.thread_mask(0), orig);
    }

    #[test]
    fn process_queue_feeds_any_thread() {
        let hub = SignalHub::new();
        hub.ensure_thread(0);
        hub.ensure_thread(1);
        hub.post_process(SigInfo { signo: libc::SIGTERM, ..SigInfo::default() });
        assert!(hub.has_deliverable(1));
        assert_eq!(hub.dequeue(1).unwrap().signo, libc::SIGTERM);
        assert!(!hub.has_deliverable(0));
    }

    #[test]
    fn sighand_note_roundtrip() {
        let hub = SignalHub::new();
        let act = KmSigAction { handler: 0x1234, flags: SA_ONSTACK, restorer: 0x5678, mask: 0xff };
        hub.sigaction(libc::SIGUSR1, Some(act), None);
        let note = hub.sighand_note();
        let hub2 = SignalHub::new();
        hub2.recover_sighand_note(&note);
        assert_eq!(hub2.action(libc::SIGUSR1), act);
        assert_eq!(hub2.action(libc::SIGUSR2), KmSigAction::default());
    }
}
