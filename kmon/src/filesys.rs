//! The filesystem collaborator seam.
//!
//! Guest file descriptors are translated by an external component; the core
//! only needs three things from it: guest→host fd translation when a
//! hypercall touches a descriptor, a name for mmap region labeling, and the
//! fd-table notes for snapshot. [`PassthroughFds`] is the identity mapping
//! used by the CLI and tests.

use std::sync::Mutex;

/// Guest file-descriptor services the dispatcher consumes.
pub trait FdTable: Send + Sync {
    /// Host descriptor behind a guest descriptor, or `None` if the guest fd
    /// does not resolve (the caller reports `EBADF`).
    fn host_fd(&self, guest_fd: i32) -> Option<i32>;

    /// Path behind a guest descriptor, for mmap region labels and NT_FILE.
    fn fd_name(&self, guest_fd: i32) -> Option<String>;

    /// Records a descriptor the guest obtained (open/dup results).
    fn install(&self, guest_fd: i32, host_fd: i32, name: Option<String>);

    /// Drops a guest descriptor.
    fn remove(&self, guest_fd: i32);

    /// Highest guest descriptor ever issued, for the exec handoff header.
    fn max_guest_fd(&self) -> i32;

    /// `(guest_fd, host_fd)` pairs for exec handoff.
    fn handoff_pairs(&self) -> Vec<(i32, i32)>;

    /// Serialized fd-table notes for the snapshot engine (already in final
    /// note-descriptor layout, one blob per note).
    fn snapshot_notes(&self) -> Vec<(u32, Vec<u8>)>;

    /// Rebuilds one descriptor from a snapshot note.
    fn recover_note(&self, ntype: u32, desc: &[u8]);

    /// Descriptor state that cannot be meaningfully restored (epoll sets
    /// with pending events, pipes with buffered bytes, connected-but-not-
    /// accepted sockets). A non-empty answer blocks the snapshot.
    fn snapshot_blockers(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Identity mapping: guest fds are host fds. Stdin/out/err work out of the
/// box; descriptors the guest opens are tracked for names and handoff.
#[derive(Default)]
pub struct PassthroughFds {
    entries: Mutex<Vec<(i32, i32, Option<String>)>>,
}

impl PassthroughFds {
    /// Creates the passthrough table with the three standard descriptors.
    #[must_use]
    pub fn new() -> Self {
        let t = Self::default();
        for fd in 0..3 {
            t.install(fd, fd, None);
        }
        t
    }
}

impl FdTable for PassthroughFds {
    fn host_fd(&self, guest_fd: i32) -> Option<i32> {
        let entries = self.entries.lock().expect("fd table poisoned");
        entries.iter().find(|(g, _, _)| *g == guest_fd).map(|(_, h, _)| *h)
    }

    fn fd_name(&self, guest_fd: i32) -> Option<String> {
        let entries = self.entries.lock().expect("fd table poisoned");
        entries.iter().find(|(g, _, _)| *g == guest_fd).and_then(|(_, _, n)| n.clone())
    }

    fn install(&self, guest_fd: i32, host_fd: i32, name: Option<String>) {
        let mut entries = self.entries.lock().expect("fd table poisoned");
        entries.retain(|(g, _, _)| *g != guest_fd);
        entries.push((guest_fd, host_fd, name));
    }

    fn remove(&self, guest_fd: i32) {
        let mut entries = self.entries.lock().expect("fd table poisoned");
        entries.retain(|(g, _, _)| *g != guest_fd);
    }

    fn max_guest_fd(&self) -> i32 {
        let entries = self.entries.lock().expect("fd table poisoned");
        entries.iter().map(|(g, _, _)| *g).max().unwrap_or(2)
    }

    fn handoff_pairs(&self) -> Vec<(i32, i32)> {
        let entries = self.entries.lock().expect("fd table poisoned");
        entries.iter().map(|(g, h, _)| (*g, *h)).collect()
    }

    fn snapshot_notes(&self) -> Vec<(u32, Vec<u8>)> {
        Vec::new() // nothing beyond std descriptors to reconstruct
    }

    fn recover_note(&self, _ntype: u32, _desc: &[u8]) {}
}

/// The empty table used for monitor-internal allocations that must never
/// resolve a guest descriptor.
pub struct NoFds;

impl FdTable for NoFds {
    fn host_fd(&self, _guest_fd: i32) -> Option<i32> {
        None
    }
    fn fd_name(&self, _guest_fd: i32) -> Option<String> {
        None
    }
    fn install(&self, _guest_fd: i32, _host_fd: i32, _name: Option<String>) {}
    fn remove(&self, _guest_fd: i32) {}
    fn max_guest_fd(&self) -> i32 {
        -1
    }
    fn handoff_pairs(&self) -> Vec<(i32, i32)> {
        Vec::new()
    }
    fn snapshot_notes(&self) -> Vec<(u32, Vec<u8>)> {
        Vec::new()
    }
    fn recover_note(&self, _ntype: u32, _desc: &[u8]) {}
}
