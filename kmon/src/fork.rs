//! Fork plumbing.
//!
//! A non-thread `clone`/`fork` hypercall cannot fork the host process from
//! a VCPU thread: the child would lose every other thread mid-flight, and
//! the backend VM does not survive a fork anyway (it is tied to the
//! creating address space). The requesting VCPU synchronizes its RIP past
//! the OUT instruction, parks on a rendezvous, and wakes the main event
//! loop, which pauses everything and performs the host fork. The child
//! builds a fresh machine around a copy of the quiesced guest memory and
//! resumes the single forking VCPU with a zero fork result; the parent
//! resumes and hands back the monitor-assigned child pid.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex};

use kvm_bindings::{kvm_regs, kvm_sregs};

use crate::machine::{Machine, MachineConfig};
use crate::vcpu::{self, PauseKind, Vcpu};

struct ForkReq {
    vcpu_id: usize,
    /// None while in flight; the signed fork result once serviced.
    result: Option<i64>,
}

/// Rendezvous state between requesting VCPU threads and the main loop.
#[derive(Default)]
pub struct ForkCtl {
    pending: Mutex<Vec<ForkReq>>,
    done_cv: Condvar,
}

/// Offset of `hc_ret` within the hypercall argument record.
const HC_RET_OFFSET: u64 = 48;

/// Called on the VCPU thread when its hypercall returned `DoFork`. Blocks
/// until the main loop serviced the fork, then writes the result into the
/// guest's argument record.
pub fn fork_rendezvous(m: &Arc<Machine>, vcpu: &Arc<Vcpu>) {
    // The child resumes at the instruction after the OUT; fix RIP now so
    // the forked register image is correct.
    vcpu.hv().sync_rip();
    vcpu.invalidate_regs();
    let _ = vcpu.read_regs();

    {
        let mut pending = m.fork.pending.lock().expect("fork queue poisoned");
        pending.push(ForkReq { vcpu_id: vcpu.id, result: None });
    }
    m.notify_intr();

    let result = {
        let mut pending = m.fork.pending.lock().expect("fork queue poisoned");
        loop {
            if let Some(idx) =
                pending.iter().position(|r| r.vcpu_id == vcpu.id && r.result.is_some())
            {
                break pending.remove(idx).result.unwrap_or(-i64::from(libc::EAGAIN));
            }
            if m.exit_group.load(Ordering::Acquire) {
                break -i64::from(libc::EINTR);
            }
            let (guard, _) = m
                .fork
                .done_cv
                .wait_timeout(pending, std::time::Duration::from_millis(50))
                .expect("fork queue poisoned");
            pending = guard;
        }
    };

    let hcarg = vcpu.hcarg_gva.load(Ordering::Acquire);
    if hcarg != 0 {
        m.mem.write_obj(hcarg + HC_RET_OFFSET, result as u64);
    }
    tracing::debug!(target: "fork", tid = vcpu.tid(), result, "fork serviced");
}

/// Runs on the main thread when the event loop is woken: services every
/// queued fork request.
pub fn service_requests(m: &Arc<Machine>) {
    loop {
        let vcpu_id = {
            let pending = m.fork.pending.lock().expect("fork queue poisoned");
            match pending.iter().find(|r| r.result.is_none()) {
                Some(r) => r.vcpu_id,
                None => return,
            }
        };
        let Some(vcpu) = m.vcpus.by_id(vcpu_id) else { return };
        let result = do_fork(m, &vcpu);
        let mut pending = m.fork.pending.lock().expect("fork queue poisoned");
        if let Some(req) = pending.iter_mut().find(|r| r.vcpu_id == vcpu_id && r.result.is_none())
        {
            req.result = Some(result);
        }
        m.fork.done_cv.notify_all();
    }
}

/// Pauses the machine around the host fork. Returns the monitor-assigned
/// child pid (or `-errno`) on the parent side; the child never comes back
/// through here — it rebuilds and runs to completion in
/// [`child_after_fork`].
fn do_fork(m: &Arc<Machine>, vcpu: &Arc<Vcpu>) -> i64 {
    vcpu::pause_all(m, Some(vcpu.as_ref()), PauseKind::All);
    let child_pid = m.alloc_next_pid();

    // The child re-creates its VM and seeds the replacement VCPU from this
    // context.
    let regs = vcpu.read_regs();
    let sregs = vcpu.read_sregs();
    let mut fp = vec![0u8; m.driver.fpstate_size()];
    let fp_ok = vcpu.hv().fpstate_save(&mut fp).is_ok();

    // SAFETY: fork(2) from the main thread with every VCPU quiesced at the
    // pause barrier; the child rebuilds everything that does not survive.
    let rc = unsafe { libc::fork() };
    match rc {
        0 => {
            let ctx = ForkChildCtx {
                child_pid,
                regs,
                sregs,
                fp: if fp_ok { Some(fp) } else { None },
                guest: *vcpu.guest.lock().expect("vcpu guest state poisoned"),
                hcarg_gva: vcpu.hcarg_gva.load(Ordering::Acquire),
            };
            child_after_fork(m, &ctx)
        }
        -1 => {
            let err = std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EAGAIN);
            vcpu::resume_all(m);
            -i64::from(err)
        }
        _ => {
            tracing::info!(target: "fork", child_pid, host_pid = rc, "payload forked");
            vcpu::resume_all(m);
            i64::from(child_pid)
        }
    }
}

struct ForkChildCtx {
    child_pid: i32,
    regs: kvm_regs,
    sregs: kvm_sregs,
    fp: Option<Vec<u8>>,
    guest: vcpu::GuestThread,
    hcarg_gva: u64,
}

/// Child-side rebuild: fresh VM and eventfds, the parent's guest memory
/// copied under the new reservation, one VCPU carrying the forker's
/// register image, pid chain advanced. Runs the machine to completion and
/// exits the process with the payload's status.
fn child_after_fork(parent: &Arc<Machine>, ctx: &ForkChildCtx) -> ! {
    let (ppid, _pid) = {
        let info = parent.pidinfo.lock().expect("pidinfo poisoned");
        (info.pid, info.next_pid)
    };
    let config = MachineConfig {
        guest_physmem: parent.mem.max_physmem(),
        device_override: parent.config.device_override.clone(),
        coredump_path: parent.config.coredump_path.clone(),
        snapshot_path: parent.config.snapshot_path.clone(),
        snapshot_input: parent.config.snapshot_input.clone(),
        snapshot_output: parent.config.snapshot_output.clone(),
    };
    let child = match Machine::new(config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(target: "fork", error = %e, "child machine rebuild failed");
            std::process::exit(1);
        }
    };

    // Memory first (contents, break pair, region lists), then identity.
    child.mem.adopt_contents_from(&parent.mem);
    child.mem.adopt_mmaps_from(&parent.mem);
    {
        let mut info = child.pidinfo.lock().expect("pidinfo poisoned");
        info.ppid = ppid;
        info.pid = ctx.child_pid;
        // Fork pids of the child come from a disjoint range.
        info.next_pid = ctx.child_pid * 1000 + 1;
    }
    *child.guest.write().expect("payload lock poisoned") =
        parent.guest.read().expect("payload lock poisoned").clone();
    *child.dynlinker.write().expect("payload lock poisoned") =
        parent.dynlinker.read().expect("payload lock poisoned").clone();
    child.signals.recover_sighand_note(&parent.signals.sighand_note());

    let new_vcpu = match vcpu::vcpu_get(&child) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(target: "fork", errno = -e, "child vcpu rebuild failed");
            std::process::exit(1);
        }
    };
    let mut regs = ctx.regs;
    regs.rax = 0;
    new_vcpu.write_regs(regs);
    new_vcpu.write_sregs(ctx.sregs);
    if let Some(fp) = &ctx.fp
        && let Err(e) = new_vcpu.hv().fpstate_restore(fp, child.driver.fp_format())
    {
        tracing::warn!(target: "fork", error = %e, "child fpstate restore failed");
    }
    {
        let mut dst = new_vcpu.guest.lock().expect("vcpu guest state poisoned");
        let host_tid = dst.host_tid;
        *dst = ctx.guest;
        dst.host_tid = host_tid;
    }
    // The child's fork() returns 0 through the argument record.
    if ctx.hcarg_gva != 0 {
        child.mem.write_obj::<u64>(ctx.hcarg_gva + HC_RET_OFFSET, 0);
    }
    if let Err(e) = vcpu::run_vcpu_thread(&child, &new_vcpu) {
        tracing::error!(target: "fork", error = %e, "child vcpu thread spawn failed");
        std::process::exit(1);
    }
    tracing::info!(target: "fork", pid = ctx.child_pid, ppid, "child payload running");
    let status = child.run();
    std::process::exit(status);
}
