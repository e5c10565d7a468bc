//! Abstraction over the two supported hardware virtualization backends.
//!
//! Both backends speak the KVM ioctl surface; they differ in the device node
//! they live behind and in the layout of extended floating-point state. The
//! rest of the monitor talks to [`VmDriver`] and [`VcpuHandle`] only, which
//! is what lets a snapshot refuse restore across incompatible backends while
//! everything above the driver stays backend-agnostic.

use std::ffi::CString;
use std::sync::Mutex;

use kvm_bindings::{
    CpuId, KVM_MAX_CPUID_ENTRIES, kvm_fpu, kvm_regs, kvm_sregs, kvm_userspace_memory_region,
    kvm_xcrs, kvm_xsave,
};
use kvm_ioctls::{Cap, Kvm, VcpuExit, VcpuFd, VmFd};

use crate::error::DriverError;
use crate::x86;

/// Device node for the stock KVM backend.
pub const DEVICE_KVM: &str = "/dev/kvm";
/// Device node for the compatible kernel-module backend.
pub const DEVICE_KMM: &str = "/dev/kmm";

/// Maximum VCPUs a VM may have (kernel `KVM_MAX_VCPUS`).
pub const KVM_MAX_VCPUS: usize = 288;

/// Which backend a VM runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmType {
    /// Kernel Virtual Machine via `/dev/kvm`.
    Kvm,
    /// The compatible kernel module via `/dev/kmm`.
    Kmm,
}

impl VmType {
    /// The identity tag recorded in snapshot monitor notes.
    #[must_use]
    pub fn identity(self) -> u32 {
        match self {
            Self::Kvm => 0,
            Self::Kmm => 1,
        }
    }
}

/// Format tag for serialized extended floating-point state.
///
/// The tag travels with every FP blob in snapshots and signal frames so a
/// restore can tell what it is looking at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FpFormat {
    /// No FP data present.
    None = 0,
    /// `kvm_fpu` (legacy FXSAVE image).
    KvmFpu = 1,
    /// `kvm_xsave` region.
    KvmXsave = 2,
    /// The kernel-module backend's XSAVE blob.
    KmmXsave = 3,
}

impl FpFormat {
    /// Decodes a tag from a note field.
    #[must_use]
    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => Self::KvmFpu,
            2 => Self::KvmXsave,
            3 => Self::KmmXsave,
            _ => Self::None,
        }
    }
}

/// Decoded reason for a VCPU exit from the run ioctl.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmExit {
    /// `OUT` to an I/O port; `value` is the 32-bit datum the guest wrote.
    IoOut {
        /// The port number.
        port: u16,
        /// The low 32 bits written by the guest.
        value: u32,
    },
    /// Debug exit (breakpoint or single-step).
    Debug,
    /// Guest executed HLT.
    Hlt,
    /// Triple fault or other shutdown condition.
    Shutdown,
    /// VM entry failed in hardware.
    FailEntry {
        /// Hardware-reported failure reason.
        reason: u64,
    },
    /// Backend internal error.
    InternalError {
        /// Backend sub-error code.
        suberror: u32,
    },
    /// The run ioctl was interrupted by a host signal.
    Intr,
    /// Any exit the monitor does not handle.
    Unsupported {
        /// Raw exit-reason value.
        reason: u64,
    },
}

/// Uniform operations over a virtual machine.
pub trait VmDriver: Send + Sync {
    /// Which backend this VM runs on.
    fn vm_type(&self) -> VmType;

    /// Installs a guest physical region backed by monitor memory.
    ///
    /// # Errors
    ///
    /// Fails if the backend rejects the slot.
    fn install_region(
        &self,
        slot: u32,
        guest_pa: u64,
        size: u64,
        host_addr: u64,
    ) -> Result<(), DriverError>;

    /// Creates a VCPU with the given id, installing CPUID and the fixed
    /// long-mode special-register image.
    ///
    /// # Errors
    ///
    /// Fails with [`DriverError::VcpuLimit`] when the backend is out of
    /// VCPUs, or on any other ioctl failure.
    fn create_vcpu(&self, id: usize) -> Result<Box<dyn VcpuHandle>, DriverError>;

    /// Size in bytes of this backend's serialized FP state.
    fn fpstate_size(&self) -> usize;

    /// This backend's native FP state format tag.
    fn fp_format(&self) -> FpFormat;

    /// Raw descriptors `(device_fd, vm_fd)` for exec handoff.
    fn raw_fds(&self) -> (i32, i32);
}

/// Uniform operations over a single VCPU.
pub trait VcpuHandle: Send + Sync {
    /// Runs the VCPU until the next exit (blocking).
    ///
    /// # Errors
    ///
    /// Fails on a run-ioctl error other than `EINTR`/`EAGAIN` (those are
    /// reported as [`VmExit::Intr`]).
    fn run(&self) -> Result<VmExit, DriverError>;

    /// Forces the backend to refresh its register cache (notably RIP) by a
    /// no-op run with immediate-exit set. Needed where post-`OUT` RIP
    /// placement differs between backends.
    fn sync_rip(&self);

    /// Reads the general-purpose register bank.
    ///
    /// # Errors
    ///
    /// Propagates the backend ioctl failure.
    fn get_regs(&self) -> Result<kvm_regs, DriverError>;
    /// Writes the general-purpose register bank.
    ///
    /// # Errors
    ///
    /// Propagates the backend ioctl failure.
    fn set_regs(&self, regs: &kvm_regs) -> Result<(), DriverError>;
    /// Reads the special register bank.
    ///
    /// # Errors
    ///
    /// Propagates the backend ioctl failure.
    fn get_sregs(&self) -> Result<kvm_sregs, DriverError>;
    /// Writes the special register bank.
    ///
    /// # Errors
    ///
    /// Propagates the backend ioctl failure.
    fn set_sregs(&self, sregs: &kvm_sregs) -> Result<(), DriverError>;
    /// Reads the extended control registers.
    ///
    /// # Errors
    ///
    /// Propagates the backend ioctl failure.
    fn get_xcrs(&self) -> Result<kvm_xcrs, DriverError>;
    /// Writes the extended control registers.
    ///
    /// # Errors
    ///
    /// Propagates the backend ioctl failure.
    fn set_xcrs(&self, xcrs: &kvm_xcrs) -> Result<(), DriverError>;

    /// Serializes FP/extended state into `buf` (must be
    /// [`VmDriver::fpstate_size`] bytes).
    ///
    /// # Errors
    ///
    /// Fails on size mismatch or ioctl failure.
    fn fpstate_save(&self, buf: &mut [u8]) -> Result<(), DriverError>;

    /// Restores FP/extended state from a blob tagged with `format`.
    ///
    /// # Errors
    ///
    /// Fails with [`DriverError::FpFormat`] when the tag is not this
    /// backend's native format.
    fn fpstate_restore(&self, buf: &[u8], format: FpFormat) -> Result<(), DriverError>;

    /// Initializes the FPU to the fixed boot state (x87 and SSE exceptions
    /// masked).
    ///
    /// # Errors
    ///
    /// Propagates the backend ioctl failure.
    fn init_fpu(&self) -> Result<(), DriverError>;

    /// Raw descriptor for exec handoff.
    fn raw_fd(&self) -> i32;
}

fn ioctl_err(op: &'static str, e: kvm_ioctls::Error) -> DriverError {
    DriverError::Ioctl {
        op,
        source: std::io::Error::from_raw_os_error(e.errno()),
    }
}

/// The KVM-ioctl-surface driver serving both backends.
pub struct KvmDriver {
    kvm: Kvm,
    vm: VmFd,
    vm_type: VmType,
    xsave: bool,
    cpuid: CpuId,
}

impl KvmDriver {
    /// Opens a VM on an explicit device node.
    ///
    /// # Errors
    ///
    /// Fails if the device cannot be opened, speaks the wrong API version,
    /// or VM creation fails.
    pub fn open_at(device: &str) -> Result<Self, DriverError> {
        let vm_type = if device == DEVICE_KMM { VmType::Kmm } else { VmType::Kvm };
        let device_path = CString::new(device).map_err(|_| DriverError::DeviceOpen {
            device: device.to_string(),
            source: std::io::Error::from_raw_os_error(libc::EINVAL),
        })?;
        let kvm = Kvm::new_with_path(device_path).map_err(|e| DriverError::DeviceOpen {
            device: device.to_string(),
            source: std::io::Error::from_raw_os_error(e.errno()),
        })?;
        let version = kvm.get_api_version();
        if version != kvm_bindings::KVM_API_VERSION as i32 {
            return Err(DriverError::ApiVersion {
                got: version,
                expected: kvm_bindings::KVM_API_VERSION as i32,
            });
        }
        let vm = kvm.create_vm().map_err(|e| ioctl_err("create_vm", e))?;
        let xsave = kvm.check_extension(Cap::Xsave);
        let cpuid = kvm
            .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
            .map_err(|e| ioctl_err("get_supported_cpuid", e))?;
        tracing::info!(
            target: "kvm",
            device,
            api_version = version,
            xsave,
            "virtual machine created"
        );
        Ok(Self { kvm, vm, vm_type, xsave, cpuid })
    }

    /// Opens a VM, preferring the kernel-module backend when present and
    /// falling back to stock KVM.
    ///
    /// # Errors
    ///
    /// Fails when neither device is usable.
    pub fn open(device_override: Option<&str>) -> Result<Self, DriverError> {
        if let Some(dev) = device_override {
            return Self::open_at(dev);
        }
        match Self::open_at(DEVICE_KMM) {
            Ok(vm) => Ok(vm),
            Err(_) => Self::open_at(DEVICE_KVM),
        }
    }
}

impl VmDriver for KvmDriver {
    fn vm_type(&self) -> VmType {
        self.vm_type
    }

    fn install_region(
        &self,
        slot: u32,
        guest_pa: u64,
        size: u64,
        host_addr: u64,
    ) -> Result<(), DriverError> {
        let region = kvm_userspace_memory_region {
            slot,
            guest_phys_addr: guest_pa,
            memory_size: size,
            userspace_addr: host_addr,
            flags: 0,
        };
        // SAFETY: host_addr points to a mapping owned by the memory manager
        // that outlives the VM fd; the backend only reads/writes inside it.
        unsafe {
            self.vm
                .set_user_memory_region(region)
                .map_err(|e| ioctl_err("set_user_memory_region", e))?;
        }
        tracing::debug!(
            target: "kvm",
            slot,
            guest_pa = format_args!("{guest_pa:#x}"),
            size = format_args!("{size:#x}"),
            "memory region installed"
        );
        Ok(())
    }

    fn create_vcpu(&self, id: usize) -> Result<Box<dyn VcpuHandle>, DriverError> {
        if id >= KVM_MAX_VCPUS {
            return Err(DriverError::VcpuLimit { id });
        }
        let fd = self.vm.create_vcpu(id as u64).map_err(|e| {
            if e.errno() == libc::EAGAIN || e.errno() == libc::EINVAL {
                DriverError::VcpuLimit { id }
            } else {
                ioctl_err("create_vcpu", e)
            }
        })?;
        fd.set_cpuid2(&self.cpuid).map_err(|e| ioctl_err("set_cpuid2", e))?;
        let vcpu = KvmVcpu {
            fd: Mutex::new(fd),
            vm_type: self.vm_type,
            xsave: self.xsave,
            fpstate_size: self.fpstate_size(),
        };
        vcpu.init_long_mode()?;
        Ok(Box::new(vcpu))
    }

    fn fpstate_size(&self) -> usize {
        match (self.vm_type, self.xsave) {
            (VmType::Kvm, false) => std::mem::size_of::<kvm_fpu>(),
            // The module backend serializes through the same xsave region.
            (VmType::Kvm, true) | (VmType::Kmm, _) => std::mem::size_of::<kvm_xsave>(),
        }
    }

    fn fp_format(&self) -> FpFormat {
        match (self.vm_type, self.xsave) {
            (VmType::Kvm, false) => FpFormat::KvmFpu,
            (VmType::Kvm, true) => FpFormat::KvmXsave,
            (VmType::Kmm, _) => FpFormat::KmmXsave,
        }
    }

    fn raw_fds(&self) -> (i32, i32) {
        use std::os::fd::AsRawFd;
        (self.kvm.as_raw_fd(), self.vm.as_raw_fd())
    }
}

/// A VCPU on the KVM ioctl surface.
pub struct KvmVcpu {
    fd: Mutex<VcpuFd>,
    vm_type: VmType,
    xsave: bool,
    fpstate_size: usize,
}

impl KvmVcpu {
    fn init_long_mode(&self) -> Result<(), DriverError> {
        let fd = self.fd.lock().expect("vcpu fd poisoned");
        let sregs = fd.get_sregs().map_err(|e| ioctl_err("get_sregs", e))?;
        let sregs = x86::long_mode_sregs(sregs);
        fd.set_sregs(&sregs).map_err(|e| ioctl_err("set_sregs", e))
    }
}

impl VcpuHandle for KvmVcpu {
    fn run(&self) -> Result<VmExit, DriverError> {
        let mut fd = self.fd.lock().expect("vcpu fd poisoned");
        match fd.run() {
            Ok(VcpuExit::IoOut(port, data)) => {
                let mut raw = [0u8; 4];
                let n = data.len().min(4);
                raw[..n].copy_from_slice(&data[..n]);
                Ok(VmExit::IoOut { port, value: u32::from_le_bytes(raw) })
            }
            Ok(VcpuExit::Debug(_)) => Ok(VmExit::Debug),
            Ok(VcpuExit::Hlt) => Ok(VmExit::Hlt),
            Ok(VcpuExit::Shutdown) => Ok(VmExit::Shutdown),
            Ok(VcpuExit::FailEntry(reason, _cpu)) => Ok(VmExit::FailEntry { reason }),
            Ok(VcpuExit::InternalError) => Ok(VmExit::InternalError { suberror: 0 }),
            Ok(other) => {
                tracing::warn!(target: "kvm", ?other, "unsupported VCPU exit");
                Ok(VmExit::Unsupported { reason: 0 })
            }
            Err(e) if e.errno() == libc::EINTR || e.errno() == libc::EAGAIN => Ok(VmExit::Intr),
            Err(e) => Err(ioctl_err("vcpu_run", e)),
        }
    }

    fn sync_rip(&self) {
        let mut fd = self.fd.lock().expect("vcpu fd poisoned");
        // A no-op entry: the backend writes its cached registers back out,
        // advancing RIP past the trapping OUT where the hardware left it
        // pointing at the instruction itself.
        fd.set_kvm_immediate_exit(1);
        let _ = fd.run();
        fd.set_kvm_immediate_exit(0);
    }

    fn get_regs(&self) -> Result<kvm_regs, DriverError> {
        let fd = self.fd.lock().expect("vcpu fd poisoned");
        fd.get_regs().map_err(|e| ioctl_err("get_regs", e))
    }

    fn set_regs(&self, regs: &kvm_regs) -> Result<(), DriverError> {
        let fd = self.fd.lock().expect("vcpu fd poisoned");
        fd.set_regs(regs).map_err(|e| ioctl_err("set_regs", e))
    }

    fn get_sregs(&self) -> Result<kvm_sregs, DriverError> {
        let fd = self.fd.lock().expect("vcpu fd poisoned");
        fd.get_sregs().map_err(|e| ioctl_err("get_sregs", e))
    }

    fn set_sregs(&self, sregs: &kvm_sregs) -> Result<(), DriverError> {
        let fd = self.fd.lock().expect("vcpu fd poisoned");
        fd.set_sregs(sregs).map_err(|e| ioctl_err("set_sregs", e))
    }

    fn get_xcrs(&self) -> Result<kvm_xcrs, DriverError> {
        let fd = self.fd.lock().expect("vcpu fd poisoned");
        fd.get_xcrs().map_err(|e| ioctl_err("get_xcrs", e))
    }

    fn set_xcrs(&self, xcrs: &kvm_xcrs) -> Result<(), DriverError> {
        let fd = self.fd.lock().expect("vcpu fd poisoned");
        fd.set_xcrs(xcrs).map_err(|e| ioctl_err("set_xcrs", e))
    }

    fn fpstate_save(&self, buf: &mut [u8]) -> Result<(), DriverError> {
        if buf.len() != self.fpstate_size {
            return Err(DriverError::FpStateSize { got: buf.len(), expected: self.fpstate_size });
        }
        let fd = self.fd.lock().expect("vcpu fd poisoned");
        if self.xsave || self.vm_type == VmType::Kmm {
            let xsave = fd.get_xsave().map_err(|e| ioctl_err("get_xsave", e))?;
            // SAFETY: kvm_xsave is a plain repr(C) byte region; buf length
            // was checked against its size above.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    std::ptr::from_ref(&xsave).cast::<u8>(),
                    buf.as_mut_ptr(),
                    buf.len(),
                );
            }
        } else {
            let fpu = fd.get_fpu().map_err(|e| ioctl_err("get_fpu", e))?;
            // SAFETY: kvm_fpu is a plain repr(C) struct; buf length was
            // checked against its size above.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    std::ptr::from_ref(&fpu).cast::<u8>(),
                    buf.as_mut_ptr(),
                    buf.len(),
                );
            }
        }
        Ok(())
    }

    fn fpstate_restore(&self, buf: &[u8], format: FpFormat) -> Result<(), DriverError> {
        let native = match (self.vm_type, self.xsave) {
            (VmType::Kvm, false) => FpFormat::KvmFpu,
            (VmType::Kvm, true) => FpFormat::KvmXsave,
            (VmType::Kmm, _) => FpFormat::KmmXsave,
        };
        if format != native {
            return Err(DriverError::FpFormat { got: format as u32, native: native as u32 });
        }
        if buf.len() != self.fpstate_size {
            return Err(DriverError::FpStateSize { got: buf.len(), expected: self.fpstate_size });
        }
        let fd = self.fd.lock().expect("vcpu fd poisoned");
        match format {
            FpFormat::KvmFpu => {
                let mut fpu = kvm_fpu::default();
                // SAFETY: buf length equals size_of::<kvm_fpu>() and the
                // struct is plain repr(C) data.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        buf.as_ptr(),
                        std::ptr::from_mut(&mut fpu).cast::<u8>(),
                        buf.len(),
                    );
                }
                fd.set_fpu(&fpu).map_err(|e| ioctl_err("set_fpu", e))
            }
            FpFormat::KvmXsave | FpFormat::KmmXsave => {
                let mut xsave = kvm_xsave::default();
                // SAFETY: buf length equals size_of::<kvm_xsave>() and the
                // region is plain bytes.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        buf.as_ptr(),
                        std::ptr::from_mut(&mut xsave).cast::<u8>(),
                        buf.len(),
                    );
                }
                fd.set_xsave(&xsave).map_err(|e| ioctl_err("set_xsave", e))
            }
            FpFormat::None => Ok(()),
        }
    }

    fn init_fpu(&self) -> Result<(), DriverError> {
        let fd = self.fd.lock().expect("vcpu fd poisoned");
        let fpu = kvm_fpu {
            fcw: 0x37F,    // x87 control word: all exceptions masked
            mxcsr: 0x1F80, // SSE control: all exceptions masked
            ..Default::default()
        };
        fd.set_fpu(&fpu).map_err(|e| ioctl_err("set_fpu", e))
    }

    fn raw_fd(&self) -> i32 {
        use std::os::fd::AsRawFd;
        self.fd.lock().expect("vcpu fd poisoned").as_raw_fd()
    }
}
