//! Management interface.
//!
//! A small line-delimited JSON protocol over a Unix socket, served by a
//! dedicated thread: one request per line, one response per line. Today it
//! answers status queries and triggers live snapshots; the socket is also
//! where an operator tooling hook belongs.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use serde::{Deserialize, Serialize};

use crate::machine::Machine;

/// One management request.
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum MgmtRequest {
    /// Take a snapshot.
    Snapshot {
        /// Label recorded in the monitor note.
        label: Option<String>,
        /// Description recorded in the monitor note.
        description: Option<String>,
        /// Keep the guest running afterwards (default true).
        live: Option<bool>,
    },
    /// Report machine status.
    Status,
}

/// Reply envelope.
#[derive(Debug, Serialize)]
pub struct MgmtResponse {
    /// Whether the request succeeded.
    pub ok: bool,
    /// Error text when it did not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Status payload for status requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<MgmtStatus>,
}

/// Machine status summary.
#[derive(Debug, Serialize)]
pub struct MgmtStatus {
    /// Monitor-assigned payload pid.
    pub pid: i32,
    /// VCPUs with live guest threads.
    pub vcpus_running: usize,
    /// Allocated VCPU slots.
    pub vcpus_allocated: usize,
    /// Current program break.
    pub brk: u64,
    /// Current arena bottom.
    pub tbrk: u64,
    /// Busy mmap regions.
    pub mmap_regions: usize,
    /// Whether exit_group is in progress.
    pub exiting: bool,
}

fn handle_request(m: &Arc<Machine>, req: &MgmtRequest) -> MgmtResponse {
    match req {
        MgmtRequest::Status => MgmtResponse {
            ok: true,
            error: None,
            status: Some(MgmtStatus {
                pid: m.pid(),
                vcpus_running: m.vcpus.run_cnt(),
                vcpus_allocated: m.vcpus.allocated(),
                brk: m.mem.brk(),
                tbrk: m.mem.tbrk(),
                mmap_regions: m.mem.busy_region_count(),
                exiting: m.exit_group.load(Ordering::Acquire),
            }),
        },
        MgmtRequest::Snapshot { label, description, live } => {
            let result = crate::snapshot::take(
                m,
                None,
                label.as_deref().unwrap_or(""),
                description.as_deref().unwrap_or(""),
                live.unwrap_or(true),
            );
            match result {
                Ok(()) => MgmtResponse { ok: true, error: None, status: None },
                Err(e) => MgmtResponse { ok: false, error: Some(e.to_string()), status: None },
            }
        }
    }
}

fn serve_conn(m: &Arc<Machine>, stream: UnixStream) {
    let mut writer = match stream.try_clone() {
        Ok(w) => w,
        Err(_) => return,
    };
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let resp = match serde_json::from_str::<MgmtRequest>(&line) {
            Ok(req) => handle_request(m, &req),
            Err(e) => MgmtResponse { ok: false, error: Some(format!("bad request: {e}")), status: None },
        };
        let Ok(mut out) = serde_json::to_vec(&resp) else { break };
        out.push(b'\n');
        if writer.write_all(&out).is_err() {
            break;
        }
    }
}

/// Binds the management socket and serves it on a named thread. The
/// listener thread lives for the rest of the process.
///
/// # Errors
///
/// Fails when the socket cannot be bound.
pub fn spawn(m: Arc<Machine>, path: &Path) -> std::io::Result<()> {
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)?;
    tracing::info!(target: "proc", socket = %path.display(), "management socket listening");
    std::thread::Builder::new().name("mgmt".to_string()).spawn(move || {
        for conn in listener.incoming() {
            match conn {
                Ok(stream) => serve_conn(&m, stream),
                Err(e) => {
                    tracing::warn!(target: "proc", error = %e, "management accept failed");
                    break;
                }
            }
        }
    })?;
    Ok(())
}
