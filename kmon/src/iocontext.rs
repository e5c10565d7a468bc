//! Async-IO context id mapping.
//!
//! The guest's `io_setup` returns an opaque context id; the monitor issues
//! the host call and hands the guest a small ordinal instead of the host's
//! kernel pointer, so the mapping survives snapshot and restore. The table
//! serializes into the NT_KM_IOCONTEXTS note.

use std::sync::Mutex;

use crate::elfcore::{NtIocontext, bytes_of, pod_from_bytes};

/// One live mapping from a guest-visible id to the host context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoContext {
    /// Id the guest holds.
    pub guest_id: u64,
    /// Id the host kernel issued.
    pub host_id: u64,
}

/// The process-wide aio context table.
#[derive(Default)]
pub struct IoContextTable {
    inner: Mutex<IoContextInner>,
}

#[derive(Default)]
struct IoContextInner {
    next_guest_id: u64,
    entries: Vec<IoContext>,
}

impl IoContextTable {
    /// Registers a host context and returns the guest-visible id.
    pub fn insert(&self, host_id: u64) -> u64 {
        let mut inner = self.inner.lock().expect("iocontext table poisoned");
        inner.next_guest_id += 1;
        let guest_id = inner.next_guest_id;
        inner.entries.push(IoContext { guest_id, host_id });
        guest_id
    }

    /// Host context behind a guest id.
    #[must_use]
    pub fn host_id(&self, guest_id: u64) -> Option<u64> {
        let inner = self.inner.lock().expect("iocontext table poisoned");
        inner.entries.iter().find(|c| c.guest_id == guest_id).map(|c| c.host_id)
    }

    /// Drops a mapping (guest `io_destroy`). Returns the host id to tear
    /// down, or `None` for an unknown guest id.
    pub fn remove(&self, guest_id: u64) -> Option<u64> {
        let mut inner = self.inner.lock().expect("iocontext table poisoned");
        let idx = inner.entries.iter().position(|c| c.guest_id == guest_id)?;
        Some(inner.entries.swap_remove(idx).host_id)
    }

    /// Serializes the table for the NT_KM_IOCONTEXTS note.
    #[must_use]
    pub fn to_note(&self) -> Vec<u8> {
        let inner = self.inner.lock().expect("iocontext table poisoned");
        let mut buf = Vec::with_capacity(inner.entries.len() * std::mem::size_of::<NtIocontext>());
        for c in &inner.entries {
            buf.extend_from_slice(bytes_of(&NtIocontext { guest_id: c.guest_id, host_id: c.host_id }));
        }
        buf
    }

    /// Rebuilds the table from a note. Host ids are recorded as-is; the
    /// restore path re-issues `io_setup` and rewrites them.
    pub fn recover_note(&self, mut desc: &[u8]) {
        let mut inner = self.inner.lock().expect("iocontext table poisoned");
        inner.entries.clear();
        while let Some(e) = pod_from_bytes::<NtIocontext>(desc) {
            inner.entries.push(IoContext { guest_id: e.guest_id, host_id: e.host_id });
            inner.next_guest_id = inner.next_guest_id.max(e.guest_id);
            desc = &desc[std::mem::size_of::<NtIocontext>()..];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_stable_ordinals() {
        let t = IoContextTable::default();
        let a = t.insert(0xdead_0000);
        let b = t.insert(0xbeef_0000);
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(t.host_id(a), Some(0xdead_0000));
        assert_eq!(t.remove(a), Some(0xdead_0000));
        assert_eq!(t.host_id(a), None);
        assert_eq!(t.insert(0x1234), 3, "ids never reused");
    }

    #[test]
    fn note_round_trip() {
        let t = IoContextTable::default();
        t.insert(10);
        t.insert(20);
        let note = t.to_note();
        let u = IoContextTable::default();
        u.recover_note(&note);
        assert_eq!(u.host_id(1), Some(10));
        assert_eq!(u.host_id(2), Some(20));
        assert_eq!(u.insert(30), 3);
    }
}
