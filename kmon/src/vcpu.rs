//! VCPU lifecycle and the run loop.
//!
//! One host thread runs at most one VCPU. VCPUs are long-lived: a guest
//! thread exit parks its VCPU on an idle list and the next
//! `clone(CLONE_THREAD)` reuses it, thread and all. The run loop decodes
//! VM exits, dispatches hypercalls, and honors the cooperative pause
//! barrier used by snapshot, fork, and debugger attach.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use kvm_bindings::{kvm_regs, kvm_sregs};

use crate::driver::{KVM_MAX_VCPUS, VcpuHandle, VmExit};
use crate::hypercall::{self, HcStatus};
use crate::machine::Machine;
use crate::signals::{self, Disposition, GuestStack};
use crate::x86;
use crate::{Gva, KM_PAGE_SIZE};

/// Stack size for VCPU host threads.
const VCPU_THREAD_STACK: usize = 256 << 10;

/// Scheduling state of a VCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuState {
    /// Idle, parked for reuse; the host thread waits on the thread condvar.
    ParkedIdle,
    /// Being initialized for a new guest thread.
    Starting,
    /// Blocked in the driver's run ioctl.
    InGuest,
    /// Executing a hypercall in the monitor.
    Hypercall,
    /// Hypercall interrupted by the VCPU-stop kick.
    HcallInt,
    /// Held at the pause barrier.
    Paused,
}

/// State protected by the per-VCPU thread mutex.
#[derive(Debug)]
pub struct ThrState {
    /// Current scheduling state.
    pub state: VcpuState,
    /// Hypercall number in flight (for snapshot restart bookkeeping).
    pub hypercall: u16,
    /// Whether the in-flight hypercall must restart after restore.
    pub restart: bool,
    /// Raised by [`run_vcpu_thread`] once the VCPU is fully seeded; the
    /// host thread must not enter the guest before this, or a reused VCPU
    /// could run with half-initialized registers.
    pub activated: bool,
}

/// Guest-thread context carried by a VCPU.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuestThread {
    /// Top of the guest thread's stack.
    pub stack_top: Gva,
    /// Guest pthread pointer (FS.base).
    pub guest_thr: Gva,
    /// Address to write the child tid to on start.
    pub set_child_tid: Gva,
    /// Address to clear and futex-wake on exit.
    pub clear_child_tid: Gva,
    /// Alternate signal stack.
    pub sigaltstack: GuestStack,
    /// Deferred self-stack unmap base (0 when unused).
    pub mapself_base: Gva,
    /// Deferred self-stack unmap size.
    pub mapself_size: u64,
    /// Host tid of the VCPU thread, for the stop kick.
    pub host_tid: i32,
}

/// Debugger-facing per-VCPU state (consumed by the external GDB stub).
#[derive(Debug, Clone, Copy, Default)]
pub struct GdbVcpuState {
    /// Hardware debug register shadows (DR0–DR3).
    pub dr_regs: [u64; 4],
    /// Whether the stub wants this thread held.
    pub hold: bool,
}

#[derive(Default)]
struct RegsCache {
    regs: kvm_regs,
    sregs: kvm_sregs,
    regs_valid: bool,
    sregs_valid: bool,
}

/// A long-lived virtual CPU record.
pub struct Vcpu {
    /// Unique id; the guest tid is `id + 1`.
    pub id: usize,
    handle: Box<dyn VcpuHandle>,
    /// Scheduling state under its mutex.
    pub thr: Mutex<ThrState>,
    /// Signaled on every lifecycle transition.
    pub thr_cv: Condvar,
    regs_cache: Mutex<RegsCache>,
    /// Guest-thread context.
    pub guest: Mutex<GuestThread>,
    /// Debugger state.
    pub gdb: Mutex<GdbVcpuState>,
    /// Set while a delivered signal unwinds an interrupted hypercall, so
    /// the dispatcher does not overwrite RDI with the hypercall result.
    pub hypercall_returns_signal: AtomicBool,
    /// Guest address of the current hypercall argument record; the fork
    /// path writes the child-side result through it.
    pub hcarg_gva: std::sync::atomic::AtomicU64,
}

impl Vcpu {
    fn new(id: usize, handle: Box<dyn VcpuHandle>) -> Self {
        Self {
            id,
            handle,
            thr: Mutex::new(ThrState {
                state: VcpuState::Starting,
                hypercall: 0,
                restart: false,
                activated: false,
            }),
            thr_cv: Condvar::new(),
            regs_cache: Mutex::new(RegsCache::default()),
            guest: Mutex::new(GuestThread::default()),
            gdb: Mutex::new(GdbVcpuState::default()),
            hypercall_returns_signal: AtomicBool::new(false),
            hcarg_gva: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// The guest-visible thread id for this VCPU.
    #[must_use]
    pub fn tid(&self) -> i32 {
        self.id as i32 + 1
    }

    /// The backend handle.
    #[must_use]
    pub fn hv(&self) -> &dyn VcpuHandle {
        self.handle.as_ref()
    }

    /// Current scheduling state.
    #[must_use]
    pub fn state(&self) -> VcpuState {
        self.thr.lock().expect("thr mutex poisoned").state
    }

    pub(crate) fn set_state(&self, state: VcpuState) {
        let mut thr = self.thr.lock().expect("thr mutex poisoned");
        thr.state = state;
        self.thr_cv.notify_all();
    }

    /// General registers through the cache.
    #[must_use]
    pub fn read_regs(&self) -> kvm_regs {
        let mut cache = self.regs_cache.lock().expect("regs cache poisoned");
        if !cache.regs_valid {
            match self.handle.get_regs() {
                Ok(r) => {
                    cache.regs = r;
                    cache.regs_valid = true;
                }
                Err(e) => tracing::warn!(target: "vcpu", id = self.id, error = %e, "get_regs failed"),
            }
        }
        cache.regs
    }

    /// Writes general registers through the cache.
    pub fn write_regs(&self, regs: kvm_regs) {
        let mut cache = self.regs_cache.lock().expect("regs cache poisoned");
        cache.regs = regs;
        cache.regs_valid = true;
        if let Err(e) = self.handle.set_regs(&regs) {
            tracing::warn!(target: "vcpu", id = self.id, error = %e, "set_regs failed");
        }
    }

    /// Special registers through the cache.
    #[must_use]
    pub fn read_sregs(&self) -> kvm_sregs {
        let mut cache = self.regs_cache.lock().expect("regs cache poisoned");
        if !cache.sregs_valid {
            match self.handle.get_sregs() {
                Ok(r) => {
                    cache.sregs = r;
                    cache.sregs_valid = true;
                }
                Err(e) => tracing::warn!(target: "vcpu", id = self.id, error = %e, "get_sregs failed"),
            }
        }
        cache.sregs
    }

    /// Writes special registers through the cache.
    pub fn write_sregs(&self, sregs: kvm_sregs) {
        let mut cache = self.regs_cache.lock().expect("regs cache poisoned");
        cache.sregs = sregs;
        cache.sregs_valid = true;
        if let Err(e) = self.handle.set_sregs(&sregs) {
            tracing::warn!(target: "vcpu", id = self.id, error = %e, "set_sregs failed");
        }
    }

    /// Drops cached register banks after the guest ran.
    pub fn invalidate_regs(&self) {
        let mut cache = self.regs_cache.lock().expect("regs cache poisoned");
        cache.regs_valid = false;
        cache.sregs_valid = false;
    }

    /// Points the VCPU at a fresh guest entry: `RIP = start`, `RDI = arg`,
    /// stack top aligned so that `RSP + 8` is 16-byte aligned per the
    /// clone-trampoline ABI.
    pub fn set_to_run(&self, start: Gva, stack_top: Gva, arg: u64) {
        let mut sp = stack_top & !7u64;
        sp -= (sp + 8) % 16;
        let regs = kvm_regs {
            rip: start,
            rsp: sp,
            rdi: arg,
            rflags: x86::X86_RFLAGS_FIXED,
            ..Default::default()
        };
        self.write_regs(regs);
    }

    /// True when `sp` lies on the installed alternate stack.
    #[must_use]
    pub fn on_altstack(&self, sp: Gva) -> bool {
        let guest = self.guest.lock().expect("vcpu guest state poisoned");
        guest.sigaltstack.ss_size != 0
            && guest.sigaltstack.ss_sp <= sp
            && sp < guest.sigaltstack.ss_sp + guest.sigaltstack.ss_size
    }
}

struct TableInner {
    vcpus: Vec<Option<Arc<Vcpu>>>,
    idle: Vec<usize>,
    run_cnt: usize,
    threads: Vec<Option<std::thread::JoinHandle<()>>>,
}

/// The VCPU arena: slots indexed by id, plus the idle free-list and the
/// live-thread count, all under the VCPU mutex.
pub struct VcpuTable {
    inner: Mutex<TableInner>,
}

impl Default for VcpuTable {
    fn default() -> Self {
        Self::new()
    }
}

impl VcpuTable {
    /// Creates an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                vcpus: Vec::new(),
                idle: Vec::new(),
                run_cnt: 0,
                threads: Vec::new(),
            }),
        }
    }

    /// VCPU by id.
    #[must_use]
    pub fn by_id(&self, id: usize) -> Option<Arc<Vcpu>> {
        let inner = self.inner.lock().expect("vcpu mutex poisoned");
        inner.vcpus.get(id).and_then(Clone::clone)
    }

    /// VCPU by guest tid.
    #[must_use]
    pub fn by_tid(&self, tid: i32) -> Option<Arc<Vcpu>> {
        if tid < 1 {
            return None;
        }
        self.by_id((tid - 1) as usize)
    }

    /// Every allocated VCPU, in id order.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Vcpu>> {
        let inner = self.inner.lock().expect("vcpu mutex poisoned");
        inner.vcpus.iter().flatten().cloned().collect()
    }

    /// Count of VCPUs with live guest threads.
    #[must_use]
    pub fn run_cnt(&self) -> usize {
        self.inner.lock().expect("vcpu mutex poisoned").run_cnt
    }

    /// Number of allocated VCPU slots.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.inner.lock().expect("vcpu mutex poisoned").vcpus.len()
    }
}

/// Allocates a VCPU: pops the idle list, or creates a fresh slot through
/// the driver. Returns a negative errno (guest-visible) on failure.
pub fn vcpu_get(m: &Machine) -> Result<Arc<Vcpu>, i64> {
    let mut inner = m.vcpus.inner.lock().expect("vcpu mutex poisoned");
    if let Some(id) = inner.idle.pop() {
        let vcpu = inner.vcpus[id].as_ref().expect("idle vcpu missing").clone();
        drop(inner);
        m.signals.reset_thread(vcpu.id);
        {
            let mut guest = vcpu.guest.lock().expect("vcpu guest state poisoned");
            let host_tid = guest.host_tid;
            *guest = GuestThread { host_tid, ..GuestThread::default() };
        }
        vcpu.hypercall_returns_signal.store(false, Ordering::Release);
        if let Err(e) = vcpu.hv().init_fpu() {
            tracing::warn!(target: "vcpu", id = vcpu.id, error = %e, "fpu reinit failed");
        }
        vcpu.set_state(VcpuState::Starting);
        tracing::debug!(target: "vcpu", id = vcpu.id, "idle VCPU reused");
        return Ok(vcpu);
    }

    drop(inner);
    vcpu_create_slot(m)
}

/// Creates a brand-new VCPU slot at the end of the arena.
fn vcpu_create_slot(m: &Machine) -> Result<Arc<Vcpu>, i64> {
    let mut inner = m.vcpus.inner.lock().expect("vcpu mutex poisoned");
    let id = inner.vcpus.len();
    if id >= KVM_MAX_VCPUS {
        return Err(-i64::from(libc::EAGAIN));
    }
    let handle = match m.driver.create_vcpu(id) {
        Ok(h) => h,
        Err(e) => {
            tracing::warn!(target: "vcpu", id, error = %e, "vcpu create failed");
            return Err(-i64::from(libc::EAGAIN));
        }
    };
    let vcpu = Arc::new(Vcpu::new(id, handle));
    if let Err(e) = vcpu.hv().init_fpu() {
        tracing::warn!(target: "vcpu", id, error = %e, "fpu init failed");
    }
    inner.vcpus.push(Some(vcpu.clone()));
    inner.threads.push(None);
    drop(inner);
    m.signals.ensure_thread(id);
    tracing::debug!(target: "vcpu", id, "VCPU created");
    Ok(vcpu)
}

/// Recreates the VCPU for a specific tid during snapshot restore. Slots
/// below the requested id are allocated and parked idle so later notes
/// (and future `clone` calls) can claim them.
pub fn vcpu_restore(m: &Machine, tid: i32) -> Result<Arc<Vcpu>, i64> {
    if tid < 1 {
        return Err(-i64::from(libc::EINVAL));
    }
    let want = (tid - 1) as usize;
    {
        // Claim the exact slot if it was parked by an earlier backfill.
        let mut inner = m.vcpus.inner.lock().expect("vcpu mutex poisoned");
        if let Some(pos) = inner.idle.iter().position(|id| *id == want) {
            inner.idle.remove(pos);
            let vcpu = inner.vcpus[want].as_ref().expect("idle vcpu missing").clone();
            drop(inner);
            vcpu.set_state(VcpuState::Starting);
            return Ok(vcpu);
        }
    }
    if m.vcpus.allocated() > want {
        return Err(-i64::from(libc::EINVAL)); // slot exists and is active
    }
    loop {
        let vcpu = vcpu_create_slot(m)?;
        match vcpu.id.cmp(&want) {
            std::cmp::Ordering::Equal => return Ok(vcpu),
            std::cmp::Ordering::Less => vcpu_put(m, &vcpu),
            std::cmp::Ordering::Greater => return Err(-i64::from(libc::EINVAL)),
        }
    }
}

/// Parks a VCPU for reuse.
pub fn vcpu_put(m: &Machine, vcpu: &Vcpu) {
    vcpu.set_state(VcpuState::ParkedIdle);
    let mut inner = m.vcpus.inner.lock().expect("vcpu mutex poisoned");
    debug_assert!(!inner.idle.contains(&vcpu.id));
    inner.idle.push(vcpu.id);
}

/// Activates a VCPU: first activation spawns the host thread; later ones
/// wake the parked thread. The run count is raised before release.
pub fn run_vcpu_thread(m: &Arc<Machine>, vcpu: &Arc<Vcpu>) -> std::io::Result<()> {
    let mut inner = m.vcpus.inner.lock().expect("vcpu mutex poisoned");
    inner.run_cnt += 1;
    {
        let mut thr = vcpu.thr.lock().expect("thr mutex poisoned");
        thr.activated = true;
    }
    let needs_thread = inner.threads[vcpu.id].is_none();
    if needs_thread {
        let m2 = Arc::clone(m);
        let v2 = Arc::clone(vcpu);
        let handle = std::thread::Builder::new()
            .name(format!("vcpu-{}", vcpu.id))
            .stack_size(VCPU_THREAD_STACK)
            .spawn(move || vcpu_thread_main(&m2, &v2))?;
        inner.threads[vcpu.id] = Some(handle);
    } else {
        vcpu.thr_cv.notify_all();
    }
    Ok(())
}

/// Per-thread setup plus the park/activate cycle.
fn vcpu_thread_main(m: &Arc<Machine>, vcpu: &Arc<Vcpu>) {
    {
        let mut guest = vcpu.guest.lock().expect("vcpu guest state poisoned");
        // SAFETY: gettid has no side effects.
        guest.host_tid = unsafe { libc::syscall(libc::SYS_gettid) as i32 };
    }
    // The stop kick must be deliverable to this thread.
    // SAFETY: manipulating this thread's own signal mask.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, signals::sig_vcpu_stop());
        libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut());
    }

    loop {
        {
            let mut thr = vcpu.thr.lock().expect("thr mutex poisoned");
            while !thr.activated {
                if m.exit_group.load(Ordering::Acquire) {
                    return;
                }
                thr = vcpu.thr_cv.wait(thr).expect("thr mutex poisoned");
            }
            thr.activated = false;
            thr.state = VcpuState::Starting;
        }
        run_vcpu(m, vcpu);
        if m.exit_group.load(Ordering::Acquire) {
            return;
        }
    }
}

/// Holds the thread while the global pause flag is up.
fn pause_point(m: &Machine, vcpu: &Vcpu) {
    if !m.pause.requested.load(Ordering::Acquire) {
        return;
    }
    let prev = vcpu.state();
    vcpu.set_state(VcpuState::Paused);
    let mut guard = m.pause.mtx.lock().expect("pause mutex poisoned");
    m.pause.cv.notify_all();
    while m.pause.requested.load(Ordering::Acquire) && !m.exit_group.load(Ordering::Acquire) {
        guard = m.pause.cv.wait(guard).expect("pause mutex poisoned");
    }
    drop(guard);
    vcpu.set_state(prev);
}

/// The run loop for one activation of a VCPU. Returns when the guest
/// thread stops, the process exits, or the monitor must tear down.
fn run_vcpu(m: &Arc<Machine>, vcpu: &Arc<Vcpu>) {
    loop {
        pause_point(m, vcpu);
        if m.exit_group.load(Ordering::Acquire) {
            return;
        }

        match signals::deliver_next_signal(m, vcpu, false) {
            Disposition::Fatal { signo, core } => {
                m.fatal_signal_exit(vcpu, signo, core);
                return;
            }
            Disposition::Delivered | Disposition::None => {}
        }

        vcpu.set_state(VcpuState::InGuest);
        let exit = vcpu.hv().run();
        vcpu.invalidate_regs();
        vcpu.set_state(VcpuState::Hypercall);

        match exit {
            Ok(VmExit::Intr) => {
                // Kicked out to re-check pending signals or the pause flag.
                continue;
            }
            Ok(VmExit::IoOut { port, value }) if hypercall::is_hypercall_port(port) => {
                let status = hypercall::dispatch(m, vcpu, port, value);
                match status {
                    HcStatus::Continue => {
                        // A signal that arrived while the hypercall was in
                        // flight (EINTR unwind) is delivered before
                        // re-entry; the flag tells the dispatcher the
                        // handler frame owns the argument registers now.
                        if m.signals.has_deliverable(vcpu.id) {
                            if let Disposition::Fatal { signo, core } =
                                signals::deliver_next_signal(m, vcpu, true)
                            {
                                m.fatal_signal_exit(vcpu, signo, core);
                                return;
                            }
                        }
                    }
                    HcStatus::Stop => {
                        vcpu_stopped(m, vcpu);
                        return;
                    }
                    HcStatus::AllStop => {
                        m.exit_all(Some(vcpu.as_ref()));
                        return;
                    }
                    HcStatus::DoFork => {
                        crate::fork::fork_rendezvous(m, vcpu);
                    }
                }
            }
            Ok(VmExit::IoOut { port, .. }) => {
                tracing::warn!(target: "vcpu", id = vcpu.id, port, "stray port write");
                m.post_fault(vcpu, libc::SIGSEGV, 0x80, 0);
            }
            Ok(VmExit::Debug) => {
                // The debugger observer drives pause/resume; without one
                // attached the trap surfaces to the guest.
                m.post_fault(vcpu, libc::SIGTRAP, 0, vcpu.read_regs().rip);
            }
            Ok(VmExit::Shutdown) => {
                tracing::warn!(target: "vcpu", id = vcpu.id, "triple fault");
                m.post_fault(vcpu, libc::SIGSEGV, libc::SI_KERNEL, 0);
            }
            Ok(VmExit::FailEntry { reason }) => {
                tracing::warn!(target: "vcpu", id = vcpu.id, reason, "VM entry failure");
                m.post_fault(vcpu, libc::SIGBUS, libc::SI_KERNEL, 0);
            }
            Ok(VmExit::InternalError { suberror }) => {
                tracing::warn!(target: "vcpu", id = vcpu.id, suberror, "backend internal error");
                m.post_fault(vcpu, libc::SIGBUS, libc::SI_KERNEL, 0);
            }
            Ok(VmExit::Hlt | VmExit::Unsupported { .. }) => {
                m.post_fault(vcpu, libc::SIGILL, libc::SI_KERNEL, vcpu.read_regs().rip);
            }
            Err(e) => {
                tracing::error!(target: "vcpu", id = vcpu.id, error = %e, "run ioctl failed");
                m.exit_all(Some(vcpu.as_ref()));
                return;
            }
        }
    }
}

/// A guest thread stopped: honor the pthread tid ABI, run any deferred
/// self-unmap, park the VCPU, and if it was the last live thread wake the
/// main loop for teardown.
pub fn vcpu_stopped(m: &Machine, vcpu: &Vcpu) {
    let (ctid, mapself_base, mapself_size) = {
        let mut guest = vcpu.guest.lock().expect("vcpu guest state poisoned");
        let out = (guest.clear_child_tid, guest.mapself_base, guest.mapself_size);
        guest.clear_child_tid = 0;
        guest.mapself_base = 0;
        guest.mapself_size = 0;
        out
    };
    if ctid != 0 && m.mem.write_obj::<u32>(ctid, 0) {
        if let Some(kma) = m.mem.gva_to_kma(ctid) {
            // SAFETY: kma points at the mapped guest word just written; the
            // futex wake only reads it.
            unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    kma,
                    libc::FUTEX_WAKE,
                    i32::MAX,
                    0usize,
                    0usize,
                    0usize,
                );
            }
        }
    }
    if mapself_size > 0 {
        // The deferred unmap of the thread's own stack, now safe to do.
        m.mem.guest_munmap(mapself_base, mapself_size);
    }

    vcpu_put(m, vcpu);
    let last = {
        let mut inner = m.vcpus.inner.lock().expect("vcpu mutex poisoned");
        inner.run_cnt -= 1;
        inner.run_cnt == 0
    };
    tracing::debug!(target: "vcpu", id = vcpu.id, last, "guest thread stopped");
    if last {
        m.notify_shutdown();
    }
}

/// Pause-barrier scope selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseKind {
    /// Kick only VCPUs blocked in the run ioctl.
    GuestOnly,
    /// Kick in-guest and in-hypercall VCPUs alike.
    All,
}

/// The cooperative pause barrier.
pub struct PauseCtl {
    /// Raised while a pause is in force.
    pub requested: AtomicBool,
    /// Protects the barrier waits.
    pub mtx: Mutex<()>,
    /// VCPUs wait here while paused; the initiator waits here for them.
    pub cv: Condvar,
}

impl Default for PauseCtl {
    fn default() -> Self {
        Self { requested: AtomicBool::new(false), mtx: Mutex::new(()), cv: Condvar::new() }
    }
}

/// Brings every VCPU except `initiator` to the pause barrier and returns
/// once they are all there.
pub fn pause_all(m: &Machine, initiator: Option<&Vcpu>, kind: PauseKind) {
    m.pause.requested.store(true, Ordering::Release);
    let vcpus = m.vcpus.all();
    for v in &vcpus {
        if initiator.is_some_and(|i| i.id == v.id) {
            continue;
        }
        let state = v.state();
        let kick = match kind {
            PauseKind::GuestOnly => state == VcpuState::InGuest,
            PauseKind::All => matches!(state, VcpuState::InGuest | VcpuState::Hypercall),
        };
        if kick {
            let host_tid = v.guest.lock().expect("vcpu guest state poisoned").host_tid;
            if host_tid != 0 {
                // SAFETY: directing the reserved no-op signal at a monitor
                // thread only breaks it out of a blocking call.
                unsafe {
                    libc::syscall(
                        libc::SYS_tgkill,
                        libc::getpid(),
                        host_tid,
                        signals::sig_vcpu_stop(),
                    );
                }
            }
            if state == VcpuState::Hypercall {
                v.set_state(VcpuState::HcallInt);
            }
        }
        v.thr_cv.notify_all();
    }
    m.signals.broadcast();

    let mut guard = m.pause.mtx.lock().expect("pause mutex poisoned");
    loop {
        let pending = m
            .vcpus
            .all()
            .iter()
            .filter(|v| !initiator.is_some_and(|i| i.id == v.id))
            .filter(|v| !matches!(v.state(), VcpuState::Paused | VcpuState::ParkedIdle))
            .count();
        if pending == 0 || m.exit_group.load(Ordering::Acquire) {
            break;
        }
        let (g, _) = m
            .pause
            .cv
            .wait_timeout(guard, std::time::Duration::from_millis(10))
            .expect("pause mutex poisoned");
        guard = g;
    }
    tracing::debug!(target: "vcpu", "all VCPUs paused");
}

/// Releases the pause barrier.
pub fn resume_all(m: &Machine) {
    m.pause.requested.store(false, Ordering::Release);
    let _g = m.pause.mtx.lock().expect("pause mutex poisoned");
    m.pause.cv.notify_all();
}

/// Guest stack size allocated for the payload's main thread.
pub const GUEST_STACK_SIZE: u64 = 2 << 20;

/// Allocates a guest stack and returns its top, or a negative errno.
pub fn alloc_guest_stack(m: &Machine) -> i64 {
    let got = m.mem.monitor_mmap(GUEST_STACK_SIZE);
    if got < 0 {
        return got;
    }
    (got as u64 + GUEST_STACK_SIZE - KM_PAGE_SIZE) as i64
}
