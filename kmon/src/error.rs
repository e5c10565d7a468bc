//! Error types for the kmon monitor.
//!
//! These errors surface to the embedding host (the CLI, the management
//! thread, tests). Failures the *guest* is meant to see never travel through
//! this module: hypercall handlers report them as negative Linux errnos in
//! the hypercall return slot.

use thiserror::Error;

/// The main error type for all monitor operations.
#[derive(Error, Debug)]
pub enum KmError {
    /// Error from the virtualization driver layer.
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    /// Error from the guest memory manager.
    #[error("memory error: {0}")]
    Mem(#[from] MemError),

    /// Error during snapshot capture or restore.
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Error during exec handoff to a successor monitor.
    #[error("exec error: {0}")]
    Exec(#[from] ExecError),

    /// Plain host I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the driver abstraction over the virtualization backends.
#[derive(Error, Debug)]
pub enum DriverError {
    /// No usable virtualization device could be opened.
    #[error("cannot open virtualization device '{device}': {source}")]
    DeviceOpen {
        /// The device node that failed to open.
        device: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The backend reported an API version this monitor does not speak.
    #[error("backend API version mismatch: got {got}, expected {expected}")]
    ApiVersion {
        /// Version reported by the backend.
        got: i32,
        /// Version this monitor was built against.
        expected: i32,
    },

    /// A backend ioctl failed.
    #[error("backend ioctl '{op}' failed: {source}")]
    Ioctl {
        /// Name of the failing operation.
        op: &'static str,
        /// The underlying errno.
        #[source]
        source: std::io::Error,
    },

    /// The VCPU limit of the backend was reached.
    #[error("cannot create VCPU {id}: backend VCPU limit reached")]
    VcpuLimit {
        /// The VCPU id that could not be created.
        id: usize,
    },

    /// A floating-point state buffer had the wrong size for the backend.
    #[error("fpstate buffer size {got} does not match backend size {expected}")]
    FpStateSize {
        /// Provided buffer size.
        got: usize,
        /// Size the backend requires.
        expected: usize,
    },

    /// A floating-point state blob was tagged with a format this backend
    /// cannot consume.
    #[error("fpstate format {got} not restorable on this backend (native {native})")]
    FpFormat {
        /// Format tag found in the blob.
        got: u32,
        /// The backend's native format tag.
        native: u32,
    },
}

/// Errors raised by the guest memory manager.
#[derive(Error, Debug)]
pub enum MemError {
    /// The requested guest physical memory size is not supported.
    #[error("unsupported guest memory size {size:#x}: {reason}")]
    BadSize {
        /// The requested size in bytes.
        size: u64,
        /// Why the size was rejected.
        reason: &'static str,
    },

    /// Failed to reserve host backing for a physical region.
    #[error("cannot reserve host backing for slot {slot} ({size:#x} bytes)")]
    Backing {
        /// The region slot.
        slot: u32,
        /// The region size.
        size: u64,
    },

    /// A monitor address does not fall inside any guest region.
    #[error("monitor address {kma:#x} is outside guest memory")]
    BadKma {
        /// The offending monitor address.
        kma: u64,
    },
}

/// Errors raised by the snapshot/restore engine.
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// The guest holds state that cannot be meaningfully restored.
    #[error("guest state prevents snapshot: {reason}")]
    Blocked {
        /// Human-readable description of the blocking state.
        reason: String,
    },

    /// The file is not an extended core file this monitor understands.
    #[error("bad snapshot file '{path}': {reason}")]
    BadImage {
        /// Path of the offending file.
        path: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The snapshot was taken under an incompatible backend.
    #[error("snapshot backend mismatch: file has {found}, running {running}")]
    BackendMismatch {
        /// Backend recorded in the file.
        found: u32,
        /// Backend the monitor is running on.
        running: u32,
    },

    /// I/O failure while writing or reading the core file.
    #[error("snapshot I/O on '{path}': {source}")]
    Io {
        /// Path of the core file.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised during exec handoff.
#[derive(Error, Debug)]
pub enum ExecError {
    /// A handoff environment variable was missing or malformed.
    #[error("bad handoff variable {var}: {reason}")]
    BadVar {
        /// The variable name.
        var: &'static str,
        /// What was wrong with its value.
        reason: String,
    },

    /// The successor monitor speaks a different handoff version.
    #[error("handoff version mismatch: got {got}, expected {expected}")]
    Version {
        /// Version found in the environment.
        got: u32,
        /// Version this monitor implements.
        expected: u32,
    },
}

/// Type alias for `Result<T, KmError>`.
pub type Result<T> = std::result::Result<T, KmError>;
