//! The process-wide machine: driver, memory, signals, VCPU arena, and the
//! lifecycle flags, composed into one value passed by reference everywhere.
//!
//! The main thread owns the event loop: it waits on the two eventfds
//! (`intr_fd` for wakeups such as fork requests, `shutdown_fd` for the
//! final barrier) and tears the machine down in reverse allocation order
//! once the last VCPU stops.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::driver::{KvmDriver, VmDriver};
use crate::error::{KmError, Result};
use crate::filesys::{FdTable, PassthroughFds};
use crate::fork::ForkCtl;
use crate::iocontext::IoContextTable;
use crate::mem::MemManager;
use crate::payload::Payload;
use crate::signals::{self, SigInfo, SignalHub};
use crate::vcpu::{self, PauseCtl, Vcpu, VcpuState, VcpuTable};
use crate::{Gva, KM_PAGE_SIZE, roundup};

/// Dynamic-loading collaborator seam. The guest is statically linked but
/// may request dynamic resolution; an external component can serve it.
pub trait DlResolver: Send + Sync {
    /// Resolves one dlopen-family hypercall. Returns a guest value or a
    /// negative errno.
    fn resolve(&self, hc: u16, arg1: u64, arg2: u64) -> i64;
}

/// The default resolver: dynamic loading is not provided.
pub struct NoDl;

impl DlResolver for NoDl {
    fn resolve(&self, _hc: u16, _arg1: u64, _arg2: u64) -> i64 {
        -i64::from(libc::ENOSYS)
    }
}

/// Machine construction parameters.
pub struct MachineConfig {
    /// Guest physical memory size in bytes (power of two).
    pub guest_physmem: u64,
    /// Explicit backend device node, if any.
    pub device_override: Option<String>,
    /// Where fault coredumps go.
    pub coredump_path: PathBuf,
    /// Where snapshots go.
    pub snapshot_path: PathBuf,
    /// Side file served to `snapshot_getdata`.
    pub snapshot_input: Option<PathBuf>,
    /// Side file filled by `snapshot_putdata`.
    pub snapshot_output: Option<PathBuf>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            guest_physmem: 32 << 30,
            device_override: None,
            coredump_path: PathBuf::from("kmcore"),
            snapshot_path: PathBuf::from("kmsnap"),
            snapshot_input: None,
            snapshot_output: None,
        }
    }
}

/// Monitor-assigned process identity, preserved across fork and exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PidInfo {
    /// Pid of the tracing parent monitor (0 when not traced).
    pub trace_pid: i32,
    /// Monitor-assigned parent pid (1 for the leader).
    pub ppid: i32,
    /// This payload's monitor-assigned pid.
    pub pid: i32,
    /// The pid the next forked payload receives.
    pub next_pid: i32,
}

impl Default for PidInfo {
    fn default() -> Self {
        Self { trace_pid: 0, ppid: 1, pid: 2, next_pid: 3 }
    }
}

fn make_eventfd() -> Result<OwnedFd> {
    // SAFETY: eventfd(2) with valid flags; ownership is taken immediately.
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(KmError::Io(std::io::Error::last_os_error()));
    }
    // SAFETY: fd was just returned by eventfd and is owned by no one else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn eventfd_write(fd: &OwnedFd) {
    let val: u64 = 1;
    // SAFETY: writing 8 bytes from a stack value to an owned eventfd.
    unsafe {
        libc::write(fd.as_raw_fd(), std::ptr::from_ref(&val).cast::<libc::c_void>(), 8);
    }
}

fn eventfd_read(fd: &OwnedFd) -> u64 {
    let mut val: u64 = 0;
    loop {
        // SAFETY: reading 8 bytes into a stack value from an owned eventfd.
        let rc = unsafe {
            libc::read(fd.as_raw_fd(), std::ptr::from_mut(&mut val).cast::<libc::c_void>(), 8)
        };
        if rc == 8 {
            return val;
        }
        if rc < 0 && std::io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            return 0;
        }
    }
}

/// The machine.
pub struct Machine {
    /// The virtualization driver.
    pub driver: Box<dyn VmDriver>,
    /// Guest memory manager.
    pub mem: MemManager,
    /// Signal hub.
    pub signals: SignalHub,
    /// VCPU arena.
    pub vcpus: VcpuTable,
    /// The cooperative pause barrier.
    pub pause: PauseCtl,
    /// Raised once `exit_group` is being processed.
    pub exit_group: AtomicBool,
    exit_status: AtomicI32,
    /// Wakes the main event loop.
    pub intr_fd: OwnedFd,
    /// The final shutdown barrier.
    pub shutdown_fd: OwnedFd,
    /// Monitor-assigned pid chain.
    pub pidinfo: Mutex<PidInfo>,
    /// Auxiliary vector handed to the payload (dumped in NT_AUXV).
    pub auxv: Mutex<Vec<u8>>,
    /// The loaded payload descriptor.
    pub guest: RwLock<Option<Payload>>,
    /// The dynamic linker descriptor, if one was loaded.
    pub dynlinker: RwLock<Option<Payload>>,
    /// Filesystem collaborator.
    pub fdt: Box<dyn FdTable>,
    /// Dynamic-loading collaborator.
    pub dl: Box<dyn DlResolver>,
    /// Async-IO context table.
    pub iocontexts: IoContextTable,
    /// Fork rendezvous between VCPU threads and the main loop.
    pub fork: ForkCtl,
    /// Construction parameters (paths consulted at runtime).
    pub config: MachineConfig,
}

impl Machine {
    /// Builds the machine: opens the backend, reserves and installs guest
    /// memory, creates the eventfd pair, and installs the host handler for
    /// the reserved VCPU-kick signal.
    ///
    /// # Errors
    ///
    /// Fails when no backend device is usable or memory setup fails.
    pub fn new(config: MachineConfig) -> Result<Arc<Self>> {
        let driver = KvmDriver::open(config.device_override.as_deref())?;
        let mem = MemManager::new(config.guest_physmem)?;
        for reg in mem.regions() {
            driver.install_region(reg.slot, reg.guest_base, reg.size, mem.region_host_addr(reg))?;
        }
        signals::install_vcpustop_handler();
        let machine = Arc::new(Self {
            driver: Box::new(driver),
            mem,
            signals: SignalHub::new(),
            vcpus: VcpuTable::new(),
            pause: PauseCtl::default(),
            exit_group: AtomicBool::new(false),
            exit_status: AtomicI32::new(0),
            intr_fd: make_eventfd()?,
            shutdown_fd: make_eventfd()?,
            pidinfo: Mutex::new(PidInfo::default()),
            auxv: Mutex::new(Vec::new()),
            guest: RwLock::new(None),
            dynlinker: RwLock::new(None),
            fdt: Box::new(PassthroughFds::new()),
            dl: Box::new(NoDl),
            iocontexts: IoContextTable::default(),
            fork: ForkCtl::default(),
            config,
        });
        tracing::info!(
            target: "kvm",
            vm_type = ?machine.driver.vm_type(),
            physmem = format_args!("{:#x}", machine.mem.max_physmem()),
            "machine initialized"
        );
        Ok(machine)
    }

    /// Monitor-assigned payload pid.
    #[must_use]
    pub fn pid(&self) -> i32 {
        self.pidinfo.lock().expect("pidinfo poisoned").pid
    }

    /// Monitor-assigned parent pid.
    #[must_use]
    pub fn ppid(&self) -> i32 {
        self.pidinfo.lock().expect("pidinfo poisoned").ppid
    }

    /// Takes the next fork pid from the chain.
    pub fn alloc_next_pid(&self) -> i32 {
        let mut info = self.pidinfo.lock().expect("pidinfo poisoned");
        let pid = info.next_pid;
        info.next_pid += 1;
        pid
    }

    /// Records the payload's exit status.
    pub fn set_exit_status(&self, status: i32) {
        self.exit_status.store(status, Ordering::Release);
    }

    /// The payload's exit status.
    #[must_use]
    pub fn exit_status(&self) -> i32 {
        self.exit_status.load(Ordering::Acquire)
    }

    /// Wakes the main event loop.
    pub fn notify_intr(&self) {
        eventfd_write(&self.intr_fd);
    }

    /// Signals the final shutdown barrier.
    pub fn notify_shutdown(&self) {
        eventfd_write(&self.shutdown_fd);
    }

    /// Posts a synchronous fault to a VCPU's own queue; it is delivered
    /// before the guest next runs.
    pub fn post_fault(&self, vcpu: &Vcpu, signo: i32, code: i32, addr: Gva) {
        self.signals.post_thread(
            vcpu.id,
            SigInfo { signo, errno: 0, code, addr, pid: 0, uid: 0 },
            true,
        );
    }

    fn kick_vcpu(&self, target: &Vcpu) {
        if target.state() == VcpuState::InGuest {
            let host_tid = target.guest.lock().expect("vcpu guest state poisoned").host_tid;
            if host_tid != 0 {
                // SAFETY: the reserved no-op signal only interrupts the run
                // ioctl of a monitor thread.
                unsafe {
                    libc::syscall(
                        libc::SYS_tgkill,
                        libc::getpid(),
                        host_tid,
                        signals::sig_vcpu_stop(),
                    );
                }
            }
        }
        self.signals.broadcast();
    }

    /// Thread-directed signal (`tkill`/`tgkill`). Returns 0 or `-errno`.
    pub fn post_tkill(&self, sender: &Vcpu, tid: i32, signo: i32) -> i64 {
        if !(0..signals::NSIG as i32).contains(&signo) {
            return -i64::from(libc::EINVAL);
        }
        let Some(target) = self.vcpus.by_tid(tid) else {
            return -i64::from(libc::ESRCH);
        };
        if target.state() == VcpuState::ParkedIdle {
            return -i64::from(libc::ESRCH);
        }
        if signo == 0 {
            return 0; // existence probe
        }
        let info = SigInfo {
            signo,
            errno: 0,
            code: -6, // SI_TKILL
            addr: 0,
            pid: self.pid(),
            uid: 0,
        };
        self.signals.post_thread(target.id, info, false);
        tracing::debug!(target: "signals", from = sender.tid(), tid, signo, "tkill");
        self.kick_vcpu(&target);
        0
    }

    /// Process-directed signal (`kill`). Returns 0 or `-errno`.
    pub fn post_kill(&self, sender: &Vcpu, pid: i32, signo: i32) -> i64 {
        if !(0..signals::NSIG as i32).contains(&signo) {
            return -i64::from(libc::EINVAL);
        }
        if pid != self.pid() && pid != 0 {
            // Cross-payload signaling needs the process collaborator.
            return -i64::from(libc::ESRCH);
        }
        if signo == 0 {
            return 0;
        }
        let info = SigInfo { signo, errno: 0, code: 0, addr: 0, pid: self.pid(), uid: 0 };
        self.signals.post_process(info);
        tracing::debug!(target: "signals", from = sender.tid(), signo, "kill");
        // Wake a VCPU that can take it, preferring one already out of the
        // guest (it will pick the signal up at the top of its loop).
        let mut kicked = false;
        for v in self.vcpus.all() {
            if v.state() == VcpuState::ParkedIdle || !self.signals.thread_accepts(v.id, signo) {
                continue;
            }
            if v.state() != VcpuState::InGuest {
                v.thr_cv.notify_all();
                kicked = true;
                break;
            }
        }
        if !kicked
            && let Some(v) = self
                .vcpus
                .all()
                .into_iter()
                .find(|v| v.state() == VcpuState::InGuest && self.signals.thread_accepts(v.id, signo))
        {
            self.kick_vcpu(&v);
        }
        self.signals.broadcast();
        0
    }

    /// Full access validation: payload program headers below the break,
    /// the mmap busy list above the arena bottom.
    #[must_use]
    pub fn is_gva_accessible(&self, gva: Gva, size: u64, prot: i32) -> bool {
        if self.mem.gva_to_kma(gva).is_none() {
            return false;
        }
        if gva < self.mem.brk() {
            let guest = self.guest.read().expect("payload lock poisoned");
            if guest.as_ref().is_some_and(|p| p.gva_accessible(gva, size, prot)) {
                return true;
            }
            let dl = self.dynlinker.read().expect("payload lock poisoned");
            return dl.as_ref().is_some_and(|p| p.gva_accessible(gva, size, prot));
        }
        self.mem.mmap_prot_check(gva, size, prot)
    }

    /// `exit_group` and fatal teardown: raise the flag, unpark everything,
    /// and wake the main loop for the final barrier.
    pub fn exit_all(&self, initiator: Option<&Vcpu>) {
        if self.exit_group.swap(true, Ordering::AcqRel) {
            return; // already going down
        }
        tracing::info!(target: "vcpu", status = self.exit_status(), "exit_group");
        for v in self.vcpus.all() {
            if initiator.is_some_and(|i| i.id == v.id) {
                continue;
            }
            self.kick_vcpu(&v);
            v.thr_cv.notify_all();
        }
        {
            let _g = self.pause.mtx.lock().expect("pause mutex poisoned");
            self.pause.cv.notify_all();
        }
        self.signals.broadcast();
        self.notify_shutdown();
    }

    /// An unhandled default-action signal terminates the payload; POSIX
    /// core-dump signals also produce the extended core file.
    pub fn fatal_signal_exit(self: &Arc<Self>, vcpu: &Arc<Vcpu>, signo: i32, core: bool) {
        tracing::warn!(target: "signals", tid = vcpu.tid(), signo, core, "fatal signal");
        if core {
            let path = self.config.coredump_path.clone();
            if let Err(e) = crate::coredump::dump_core(
                self,
                Some(vcpu),
                &path,
                "",
                "terminated by signal",
                false,
                signo as i16,
            ) {
                tracing::warn!(target: "coredump", error = %e, "coredump failed");
            } else {
                tracing::info!(target: "coredump", path = %path.display(), "core dumped");
            }
        }
        self.set_exit_status(128 + signo);
        self.exit_all(Some(vcpu.as_ref()));
    }

    /// Seeds the machine with a loaded payload: sets the break past the
    /// loaded image, records the descriptor, and prepares VCPU 0 with the
    /// initial stack (argc/argv/envp/auxv per the SysV start ABI).
    ///
    /// # Errors
    ///
    /// Fails when the stack cannot be allocated or written.
    pub fn start(self: &Arc<Self>, payload: Payload, argv: &[String], envp: &[String]) -> Result<()> {
        let brk = roundup(payload.load_end(), KM_PAGE_SIZE);
        let rc = self.mem.set_brk(brk);
        if rc < 0 {
            return Err(KmError::Io(std::io::Error::from_raw_os_error(-rc as i32)));
        }
        let entry = payload.entry;
        *self.guest.write().expect("payload lock poisoned") = Some(payload);

        let vcpu = vcpu::vcpu_get(self)
            .map_err(|e| KmError::Io(std::io::Error::from_raw_os_error(-e as i32)))?;
        let stack_top = vcpu::alloc_guest_stack(self);
        if stack_top < 0 {
            return Err(KmError::Io(std::io::Error::from_raw_os_error(-stack_top as i32)));
        }
        let sp = self.build_start_stack(stack_top as u64, argv, envp)?;
        {
            let mut guest = vcpu.guest.lock().expect("vcpu guest state poisoned");
            guest.stack_top = stack_top as u64;
        }
        vcpu.set_to_run(entry, sp, 0);
        // set_to_run aligns for a call frame; _start expects RSP at argc.
        let mut regs = vcpu.read_regs();
        regs.rsp = sp;
        vcpu.write_regs(regs);
        vcpu::run_vcpu_thread(self, &vcpu)?;
        tracing::info!(
            target: "vcpu",
            entry = format_args!("{entry:#x}"),
            sp = format_args!("{sp:#x}"),
            "payload started"
        );
        Ok(())
    }

    /// Builds the SysV process-start stack below `stack_top` and returns
    /// the initial RSP (pointing at argc).
    fn build_start_stack(&self, stack_top: u64, argv: &[String], envp: &[String]) -> Result<u64> {
        let mut strings_at = stack_top;
        let mut argv_ptrs = Vec::with_capacity(argv.len());
        let mut envp_ptrs = Vec::with_capacity(envp.len());
        let efault = || KmError::Io(std::io::Error::from_raw_os_error(libc::EFAULT));
        for (list, ptrs) in [(argv, &mut argv_ptrs), (envp, &mut envp_ptrs)] {
            for s in list {
                let bytes = s.as_bytes();
                strings_at -= bytes.len() as u64 + 1;
                if !self.mem.write_bytes(strings_at, bytes)
                    || !self.mem.write_obj::<u8>(strings_at + bytes.len() as u64, 0)
                {
                    return Err(efault());
                }
                ptrs.push(strings_at);
            }
        }

        // auxv: minimal but honest — page size, pid-ish entries, null.
        let auxv: Vec<(u64, u64)> = vec![(6, KM_PAGE_SIZE), (0, 0)]; // AT_PAGESZ, AT_NULL
        {
            let mut saved = self.auxv.lock().expect("auxv poisoned");
            saved.clear();
            for (k, v) in &auxv {
                saved.extend_from_slice(&k.to_le_bytes());
                saved.extend_from_slice(&v.to_le_bytes());
            }
        }

        let words = 1 + argv_ptrs.len() + 1 + envp_ptrs.len() + 1 + auxv.len() * 2;
        let mut sp = (strings_at - (words as u64) * 8) & !15u64;
        let start_sp = sp;
        let mut put = |val: u64, sp: &mut u64| -> Result<()> {
            if !self.mem.write_obj(*sp, val) {
                return Err(efault());
            }
            *sp += 8;
            Ok(())
        };
        put(argv.len() as u64, &mut sp)?;
        for p in &argv_ptrs {
            put(*p, &mut sp)?;
        }
        put(0, &mut sp)?;
        for p in &envp_ptrs {
            put(*p, &mut sp)?;
        }
        put(0, &mut sp)?;
        for (k, v) in &auxv {
            put(*k, &mut sp)?;
            put(*v, &mut sp)?;
        }
        Ok(start_sp)
    }

    /// The main event loop: services fork requests until the shutdown
    /// barrier fires, then returns the payload's exit status.
    pub fn run(self: &Arc<Self>) -> i32 {
        loop {
            let mut fds = [
                libc::pollfd { fd: self.intr_fd.as_raw_fd(), events: libc::POLLIN, revents: 0 },
                libc::pollfd { fd: self.shutdown_fd.as_raw_fd(), events: libc::POLLIN, revents: 0 },
            ];
            // SAFETY: polling two owned descriptors with a valid array.
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), 2, -1) };
            if rc < 0 {
                if std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                break;
            }
            if fds[0].revents & libc::POLLIN != 0 {
                eventfd_read(&self.intr_fd);
                crate::fork::service_requests(self);
            }
            if fds[1].revents & libc::POLLIN != 0 {
                eventfd_read(&self.shutdown_fd);
                if self.vcpus.run_cnt() == 0 || self.exit_group.load(Ordering::Acquire) {
                    break;
                }
            }
        }
        self.exit_all(None);
        tracing::info!(target: "vcpu", status = self.exit_status(), "machine done");
        self.exit_status()
    }
}
