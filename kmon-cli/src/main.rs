//! kmon — run an x86-64 ELF payload inside a hardware VM.
//!
//! The monitor is the payload's kernel: every system service is a
//! hypercall translated to the host. This binary parses arguments, loads a
//! statically-linked payload (or restores a snapshot), and runs the
//! machine to completion.
//!
//! **Requires Linux with `/dev/kvm` (or a compatible module at
//! `/dev/kmm`).** On other platforms the build succeeds but nothing can be
//! started.

use std::path::PathBuf;

use clap::Parser;

/// kmon — user-space unikernel monitor.
#[derive(Parser)]
#[command(name = "kmon", version, about)]
struct Cli {
    /// Path to the payload ELF (statically linked). Omit with --restore.
    payload: Option<PathBuf>,

    /// Arguments passed to the payload.
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,

    /// Guest physical memory size in MiB (power of two).
    #[arg(long, default_value = "32768")]
    memory_mib: u64,

    /// Virtualization device node (default: /dev/kmm, then /dev/kvm).
    #[arg(long)]
    device: Option<String>,

    /// Restore from a snapshot file instead of loading a payload.
    #[arg(long)]
    restore: Option<PathBuf>,

    /// Where snapshots are written.
    #[arg(long, default_value = "kmsnap")]
    snapshot: PathBuf,

    /// Where fault coredumps are written.
    #[arg(long, default_value = "kmcore")]
    coredump: PathBuf,

    /// Side file served to the guest's snapshot-getdata call.
    #[arg(long)]
    snapshot_input: Option<PathBuf>,

    /// Side file filled by the guest's snapshot-putdata call.
    #[arg(long)]
    snapshot_output: Option<PathBuf>,

    /// Management socket path; enables the management thread.
    #[arg(long)]
    mgmt: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    #[cfg(target_os = "linux")]
    {
        match run(cli) {
            Ok(status) => std::process::exit(status),
            Err(e) => {
                tracing::error!("kmon failed: {e}");
                std::process::exit(1);
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = cli;
        eprintln!("kmon requires Linux with KVM support.");
        std::process::exit(1);
    }
}

#[cfg(target_os = "linux")]
fn run(cli: Cli) -> Result<i32, Box<dyn std::error::Error>> {
    use kmon::machine::{Machine, MachineConfig};

    let config = MachineConfig {
        guest_physmem: cli.memory_mib << 20,
        device_override: cli.device,
        coredump_path: cli.coredump,
        snapshot_path: cli.snapshot,
        snapshot_input: cli.snapshot_input,
        snapshot_output: cli.snapshot_output,
    };
    let machine = Machine::new(config)?;

    if let Some(path) = &cli.mgmt {
        kmon::mgmt::spawn(machine.clone(), path)?;
    }

    // A successor after guest execve recovers identity instead of starting
    // fresh.
    if let Some(rec) = kmon::exec::detect()? {
        kmon::exec::apply_recovery(&machine, &rec);
    }

    if let Some(snap) = &cli.restore {
        kmon::snapshot::restore(&machine, snap)?;
    } else {
        let payload_path = cli
            .payload
            .as_ref()
            .ok_or("either a payload path or --restore is required")?;
        let payload = loader::load(&machine, payload_path)?;
        let mut argv = vec![payload_path.display().to_string()];
        argv.extend(cli.args.iter().cloned());
        let envp: Vec<String> = std::env::vars()
            .filter(|(k, _)| !k.starts_with("KM_EXEC_"))
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        machine.start(payload, &argv, &envp)?;
    }

    Ok(machine.run())
}

/// Minimal static-ELF loader. The monitor core only consumes the payload
/// descriptor; producing it (and mapping the segments) is this front end's
/// job. Only `ET_EXEC` images linked for the guest's bottom zone are
/// accepted.
#[cfg(target_os = "linux")]
mod loader {
    use std::fs;
    use std::path::Path;

    use kmon::elfcore::{Elf64Ehdr, Elf64Phdr, PT_LOAD, pod_from_bytes};
    use kmon::machine::Machine;
    use kmon::payload::Payload;

    const ET_EXEC: u16 = 2;

    pub fn load(m: &Machine, path: &Path) -> Result<Payload, Box<dyn std::error::Error>> {
        let image = fs::read(path)?;
        let ehdr: Elf64Ehdr = pod_from_bytes(&image).ok_or("short ELF header")?;
        if !ehdr.ident_ok() {
            return Err("not a 64-bit little-endian ELF".into());
        }
        if ehdr.e_type != ET_EXEC {
            return Err("only statically-linked ET_EXEC payloads are supported".into());
        }
        let mut phdrs = Vec::with_capacity(ehdr.e_phnum as usize);
        for i in 0..ehdr.e_phnum as usize {
            let off = ehdr.e_phoff as usize + i * std::mem::size_of::<Elf64Phdr>();
            let ph: Elf64Phdr =
                pod_from_bytes(image.get(off..).unwrap_or_default()).ok_or("short phdr table")?;
            phdrs.push(ph);
        }
        let payload = Payload {
            filename: path.display().to_string(),
            ehdr,
            phdrs: phdrs.clone(),
            load_adjust: 0,
            entry: ehdr.e_entry,
        };

        // The break must cover the image before its bytes can land.
        let end = payload.load_end();
        if m.mem.set_brk(end) < 0 {
            return Err("payload does not fit the guest bottom zone".into());
        }
        for ph in phdrs.iter().filter(|p| p.p_type == PT_LOAD) {
            let data = image
                .get(ph.p_offset as usize..(ph.p_offset + ph.p_filesz) as usize)
                .ok_or("load segment out of file bounds")?;
            if !m.mem.write_bytes(ph.p_vaddr, data) {
                return Err(format!("cannot place segment at {:#x}", ph.p_vaddr).into());
            }
        }
        tracing::info!(
            entry = format_args!("{:#x}", payload.entry),
            segments = payload.phdrs.len(),
            "payload loaded"
        );
        Ok(payload)
    }
}
