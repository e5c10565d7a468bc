//! Exec handoff.
//!
//! When the guest calls `execve`, the monitor re-executes itself with the
//! new payload, handing over descriptor and identity state through ASCII
//! environment variables. The successor detects `KM_EXEC_VERS` at startup
//! and recovers instead of initializing from scratch:
//!
//! ```text
//! KM_EXEC_VERS=2,<nfdmap>
//! KM_EXEC_VMFDS=<kvm>,<vm>,<vcpu>,...
//! KM_EXEC_EVENTFDS=<intr>,<shutdown>
//! KM_EXEC_GUESTFDS=<gfd>:<hfd>,...
//! KM_EXEC_PIDINFO=<tracepid>,<ppid>,<pid>,<nextpid>
//! KM_EXEC_GDBINFO=<enabled>,<wait>
//! ```

use std::ffi::CString;
use std::os::fd::AsRawFd;
use std::sync::Arc;

use crate::error::{ExecError, KmError, Result};
use crate::machine::{Machine, PidInfo};
use crate::vcpu::{self, PauseKind, Vcpu};
use crate::Gva;

/// Handoff protocol version.
pub const KM_EXEC_VERNUM: u32 = 2;

const VAR_VERS: &str = "KM_EXEC_VERS";
const VAR_VMFDS: &str = "KM_EXEC_VMFDS";
const VAR_EVENTFDS: &str = "KM_EXEC_EVENTFDS";
const VAR_GUESTFDS: &str = "KM_EXEC_GUESTFDS";
const VAR_PIDINFO: &str = "KM_EXEC_PIDINFO";
const VAR_GDBINFO: &str = "KM_EXEC_GDBINFO";

/// Everything a successor monitor recovers from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRecovery {
    /// Protocol version found.
    pub version: u32,
    /// Highest guest descriptor in the map.
    pub nfdmap: i32,
    /// Device, VM, and VCPU descriptors of the predecessor.
    pub vm_fds: Vec<i32>,
    /// `(intr_fd, shutdown_fd)` of the predecessor.
    pub eventfds: (i32, i32),
    /// Guest→host descriptor pairs to re-install.
    pub guest_fds: Vec<(i32, i32)>,
    /// Monitor-assigned pid chain.
    pub pidinfo: PidInfo,
}

/// Builds the handoff variables from live machine state.
#[must_use]
pub fn build_env(m: &Machine) -> Vec<(String, String)> {
    let guest_fds = m.fdt.handoff_pairs();
    let (kvm_fd, vm_fd) = m.driver.raw_fds();
    let mut vmfds = format!("{kvm_fd},{vm_fd}");
    for v in m.vcpus.all() {
        vmfds.push_str(&format!(",{}", v.hv().raw_fd()));
    }
    let info = *m.pidinfo.lock().expect("pidinfo poisoned");
    vec![
        (VAR_VERS.to_string(), format!("{},{}", KM_EXEC_VERNUM, m.fdt.max_guest_fd())),
        (VAR_VMFDS.to_string(), vmfds),
        (
            VAR_EVENTFDS.to_string(),
            format!("{},{}", m.intr_fd.as_raw_fd(), m.shutdown_fd.as_raw_fd()),
        ),
        (
            VAR_GUESTFDS.to_string(),
            guest_fds.iter().map(|(g, h)| format!("{g}:{h}")).collect::<Vec<_>>().join(","),
        ),
        (
            VAR_PIDINFO.to_string(),
            format!("{},{},{},{}", info.trace_pid, info.ppid, info.pid, info.next_pid),
        ),
        (VAR_GDBINFO.to_string(), "0,0".to_string()),
    ]
}

fn parse_i32_list(var: &'static str, val: &str) -> Result<Vec<i32>> {
    val.split(',')
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i32>().map_err(|_| {
                KmError::Exec(ExecError::BadVar { var, reason: format!("bad integer '{s}'") })
            })
        })
        .collect()
}

/// Parses the handoff variables from an environment snapshot. Returns
/// `Ok(None)` when no handoff is present (normal startup).
///
/// # Errors
///
/// Fails on a malformed or version-mismatched handoff.
pub fn parse_env(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Option<ExecRecovery>> {
    let Some(vers) = lookup(VAR_VERS) else {
        return Ok(None);
    };
    let mut it = vers.splitn(2, ',');
    let version: u32 = it.next().and_then(|s| s.parse().ok()).ok_or(KmError::Exec(
        ExecError::BadVar { var: VAR_VERS, reason: "missing version".to_string() },
    ))?;
    if version != KM_EXEC_VERNUM {
        return Err(KmError::Exec(ExecError::Version { got: version, expected: KM_EXEC_VERNUM }));
    }
    let nfdmap: i32 = it.next().and_then(|s| s.parse().ok()).ok_or(KmError::Exec(
        ExecError::BadVar { var: VAR_VERS, reason: "missing fd-map size".to_string() },
    ))?;

    let vm_fds = parse_i32_list(VAR_VMFDS, &lookup(VAR_VMFDS).unwrap_or_default())?;
    let ev = parse_i32_list(VAR_EVENTFDS, &lookup(VAR_EVENTFDS).unwrap_or_default())?;
    if ev.len() != 2 {
        return Err(KmError::Exec(ExecError::BadVar {
            var: VAR_EVENTFDS,
            reason: format!("expected 2 descriptors, got {}", ev.len()),
        }));
    }
    let mut guest_fds = Vec::new();
    if let Some(gf) = lookup(VAR_GUESTFDS) {
        for pair in gf.split(',').filter(|s| !s.is_empty()) {
            let (g, h) = pair.split_once(':').ok_or_else(|| {
                KmError::Exec(ExecError::BadVar {
                    var: VAR_GUESTFDS,
                    reason: format!("bad pair '{pair}'"),
                })
            })?;
            let g: i32 = g.parse().map_err(|_| {
                KmError::Exec(ExecError::BadVar {
                    var: VAR_GUESTFDS,
                    reason: format!("bad guest fd '{g}'"),
                })
            })?;
            let h: i32 = h.parse().map_err(|_| {
                KmError::Exec(ExecError::BadVar {
                    var: VAR_GUESTFDS,
                    reason: format!("bad host fd '{h}'"),
                })
            })?;
            guest_fds.push((g, h));
        }
    }
    let pids = parse_i32_list(VAR_PIDINFO, &lookup(VAR_PIDINFO).unwrap_or_default())?;
    if pids.len() != 4 {
        return Err(KmError::Exec(ExecError::BadVar {
            var: VAR_PIDINFO,
            reason: format!("expected 4 pids, got {}", pids.len()),
        }));
    }
    Ok(Some(ExecRecovery {
        version,
        nfdmap,
        vm_fds,
        eventfds: (ev[0], ev[1]),
        guest_fds,
        pidinfo: PidInfo { trace_pid: pids[0], ppid: pids[1], pid: pids[2], next_pid: pids[3] },
    }))
}

/// Looks for a handoff in the process environment.
///
/// # Errors
///
/// Fails on a malformed handoff; `Ok(None)` means normal startup.
pub fn detect() -> Result<Option<ExecRecovery>> {
    parse_env(&|name| std::env::var(name).ok())
}

/// Applies a recovered handoff to a freshly built machine: the pid chain
/// and the guest descriptor map carry over. The predecessor's VM
/// descriptors are closed — the successor built its own VM (the exec'd
/// payload starts from a clean address space anyway) — and its eventfds
/// are superseded by the new pair.
pub fn apply_recovery(m: &Machine, rec: &ExecRecovery) {
    *m.pidinfo.lock().expect("pidinfo poisoned") = rec.pidinfo;
    for (g, h) in &rec.guest_fds {
        m.fdt.install(*g, *h, None);
    }
    for fd in rec.vm_fds.iter().chain([rec.eventfds.0, rec.eventfds.1].iter()) {
        if *fd > 2 {
            // SAFETY: closing descriptors the predecessor deliberately
            // leaked to us; nothing else in this process owns them.
            unsafe { libc::close(*fd) };
        }
    }
    tracing::info!(
        target: "exec",
        pid = rec.pidinfo.pid,
        guest_fds = rec.guest_fds.len(),
        "exec handoff recovered"
    );
}

/// Guest `execve`: pauses the machine and re-executes the monitor binary
/// with the handoff environment plus the guest-supplied environment.
/// Returns a negative errno only on failure (on success it does not
/// return).
pub fn guest_execve(m: &Arc<Machine>, vcpu: &Arc<Vcpu>, path_gva: Gva, argv_gva: Gva, envp_gva: Gva) -> i64 {
    let Some(path) = m.mem.read_cstr(path_gva, libc::PATH_MAX as usize) else {
        return -i64::from(libc::EFAULT);
    };
    let Some(argv) = read_string_vec(m, argv_gva) else {
        return -i64::from(libc::EFAULT);
    };
    let Some(guest_env) = read_string_vec(m, envp_gva) else {
        return -i64::from(libc::EFAULT);
    };

    let self_exe = match std::fs::read_link("/proc/self/exe") {
        Ok(p) => p,
        Err(e) => return -i64::from(e.raw_os_error().unwrap_or(libc::ENOENT)),
    };

    vcpu::pause_all(m, Some(vcpu.as_ref()), PauseKind::All);

    let mut cargs: Vec<CString> = Vec::with_capacity(argv.len() + 2);
    cargs.push(CString::new(self_exe.to_string_lossy().into_owned()).unwrap_or_default());
    cargs.push(CString::new(path.clone()).unwrap_or_default());
    for a in argv.iter().skip(1) {
        cargs.push(CString::new(a.clone()).unwrap_or_default());
    }
    let mut cenv: Vec<CString> = Vec::new();
    for e in &guest_env {
        if !e.starts_with("KM_EXEC_") {
            cenv.push(CString::new(e.clone()).unwrap_or_default());
        }
    }
    for (k, v) in build_env(m) {
        cenv.push(CString::new(format!("{k}={v}")).unwrap_or_default());
    }
    let argp: Vec<*const libc::c_char> = cargs
        .iter()
        .map(|c| c.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();
    let envp: Vec<*const libc::c_char> = cenv
        .iter()
        .map(|c| c.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();

    tracing::info!(target: "exec", payload = %path, "re-executing monitor for execve");
    // SAFETY: argument and environment vectors are NUL-terminated arrays of
    // valid C strings that outlive the call; on success the process image
    // is replaced.
    unsafe { libc::execve(cargs[0].as_ptr(), argp.as_ptr(), envp.as_ptr()) };

    let err = std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::ENOENT);
    tracing::warn!(target: "exec", errno = err, "execve failed, resuming guest");
    vcpu::resume_all(m);
    -i64::from(err)
}

fn read_string_vec(m: &Machine, vec_gva: Gva) -> Option<Vec<String>> {
    let mut out = Vec::new();
    if vec_gva == 0 {
        return Some(out);
    }
    for i in 0..4096u64 {
        let p: u64 = m.mem.read_obj(vec_gva + i * 8)?;
        if p == 0 {
            return Some(out);
        }
        out.push(m.mem.read_cstr(p, 64 << 10)?);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_in(map: HashMap<&'static str, String>) -> impl Fn(&str) -> Option<String> {
        move |name| map.get(name).cloned()
    }

    #[test]
    fn absent_handoff_is_normal_startup() {
        let look = lookup_in(HashMap::new());
        assert!(parse_env(&look).unwrap().is_none());
    }

    #[test]
    fn round_trip() {
        let mut map = HashMap::new();
        map.insert(VAR_VERS, "2,7".to_string());
        map.insert(VAR_VMFDS, "3,4,5,6".to_string());
        map.insert(VAR_EVENTFDS, "8,9".to_string());
        map.insert(VAR_GUESTFDS, "0:0,1:1,5:12".to_string());
        map.insert(VAR_PIDINFO, "0,1,2,3".to_string());
        map.insert(VAR_GDBINFO, "0,0".to_string());
        let rec = parse_env(&lookup_in(map)).unwrap().expect("handoff");
        assert_eq!(rec.version, 2);
        assert_eq!(rec.nfdmap, 7);
        assert_eq!(rec.vm_fds, vec![3, 4, 5, 6]);
        assert_eq!(rec.eventfds, (8, 9));
        assert_eq!(rec.guest_fds, vec![(0, 0), (1, 1), (5, 12)]);
        assert_eq!(rec.pidinfo.pid, 2);
        assert_eq!(rec.pidinfo.next_pid, 3);
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let mut map = HashMap::new();
        map.insert(VAR_VERS, "1,4".to_string());
        let err = parse_env(&lookup_in(map)).unwrap_err();
        assert!(matches!(err, KmError::Exec(ExecError::Version { got: 1, .. })));
    }

    #[test]
    fn malformed_pairs_are_rejected() {
        let mut map = HashMap::new();
        map.insert(VAR_VERS, "2,4".to_string());
        map.insert(VAR_EVENTFDS, "8,9".to_string());
        map.insert(VAR_GUESTFDS, "0:0,banana".to_string());
        map.insert(VAR_PIDINFO, "0,1,2,3".to_string());
        assert!(parse_env(&lookup_in(map)).is_err());
    }
}
