//! # kmon
//!
//! User-space monitor that runs statically- or dynamically-linked x86-64 ELF
//! payloads ("guests") in ring 0 of a dedicated hardware VM. All operating
//! system services — file I/O, memory mapping, signals, scheduling, process
//! control — are satisfied by the monitor translating guest hypercalls into
//! host system calls. Functionally, kmon is the kernel of the guest.
//!
//! **Requires Linux with `/dev/kvm` (or a compatible module at `/dev/kmm`).**
//! On other platforms the crate builds but exposes only the error types.
//!
//! ## Architecture
//!
//! - [`machine`] — the process-wide [`Machine`](machine::Machine) value:
//!   driver, memory, signals, VCPU arena, lifecycle flags
//! - [`driver`] — uniform operations over the two virtualization backends
//! - [`mem`] / [`mmap`] — the flat guest address space and the mmap engine
//! - [`signals`] — pending queues, sigaction table, frame synthesis
//! - [`vcpu`] — VCPU lifecycle, run loop, pause barrier
//! - [`hypercall`] — the dispatch table translating guest requests
//! - [`snapshot`] / [`coredump`] — extended ELF core capture and restore
//!
//! The ELF loader, filesystem translation, and the GDB stub are external
//! collaborators: the core consumes a [`payload::Payload`] descriptor, a
//! [`filesys::FdTable`] implementation, and exposes the pause barrier.

pub mod elfcore;
pub mod error;
pub mod payload;

#[cfg(target_os = "linux")]
pub mod coredump;
#[cfg(target_os = "linux")]
pub mod driver;
#[cfg(target_os = "linux")]
pub mod exec;
#[cfg(target_os = "linux")]
pub mod filesys;
#[cfg(target_os = "linux")]
pub mod fork;
#[cfg(target_os = "linux")]
pub mod hypercall;
#[cfg(target_os = "linux")]
pub mod iocontext;
#[cfg(target_os = "linux")]
pub mod machine;
#[cfg(target_os = "linux")]
pub mod mem;
#[cfg(target_os = "linux")]
pub mod mgmt;
#[cfg(target_os = "linux")]
pub mod mmap;
#[cfg(target_os = "linux")]
pub mod signals;
#[cfg(target_os = "linux")]
pub mod snapshot;
#[cfg(target_os = "linux")]
pub mod vcpu;
#[cfg(target_os = "linux")]
pub mod x86;

// Re-export primary API types at crate root for convenience.
pub use error::{KmError, Result};
pub use payload::Payload;

#[cfg(target_os = "linux")]
pub use machine::{Machine, MachineConfig};

/// Guest virtual address: the address as the payload sees it.
pub type Gva = u64;

/// Guest physical address.
pub type Gpa = u64;

/// Monitor address: a pointer in the monitor process mapping the same byte
/// as some [`Gva`].
pub type Kma = *mut u8;

/// Guest page size. The monitor manages guest memory in 4 KiB pages backed
/// by 2 MiB leaves in the guest page table.
pub const KM_PAGE_SIZE: u64 = 4096;

/// Round `x` up to the next multiple of power-of-two `align`.
#[must_use]
pub const fn roundup(x: u64, align: u64) -> u64 {
    (x + align - 1) & !(align - 1)
}

/// Round `x` down to a multiple of power-of-two `align`.
#[must_use]
pub const fn rounddown(x: u64, align: u64) -> u64 {
    x & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(roundup(0, KM_PAGE_SIZE), 0);
        assert_eq!(roundup(1, KM_PAGE_SIZE), KM_PAGE_SIZE);
        assert_eq!(roundup(KM_PAGE_SIZE, KM_PAGE_SIZE), KM_PAGE_SIZE);
        assert_eq!(rounddown(KM_PAGE_SIZE + 1, KM_PAGE_SIZE), KM_PAGE_SIZE);
        assert_eq!(rounddown(KM_PAGE_SIZE - 1, KM_PAGE_SIZE), 0);
    }
}
