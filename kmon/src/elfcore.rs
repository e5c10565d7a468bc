//! ELF64 core-file structures and the extended note codec.
//!
//! Snapshots are standard ELF core files (`ET_CORE`, `EM_X86_64`) extended
//! with private notes carrying monitor state. Unmodified debuggers open
//! them as core dumps; the monitor can also resume from them. The note
//! owner string for private notes is `KMSP`; private note types are 32-bit
//! ASCII tags beginning `0x4b4d` ("KM").

/// Note owner string for monitor-private notes.
pub const KM_NT_NAME: &str = "KMSP";
/// Note owner string for standard core notes.
pub const CORE_NT_NAME: &str = "CORE";

/// Identifies the backend that produced the dump.
pub const NT_KM_MONITOR: u32 = 0x4b4d_4d4e; // "KMMN"
/// Per-VCPU monitor state.
pub const NT_KM_VCPU: u32 = 0x4b4d_5052; // "KMPR"
/// The guest executable's ELF identity.
pub const NT_KM_GUEST: u32 = 0x4b4d_4754; // "KMGT"
/// The dynamic linker's ELF identity.
pub const NT_KM_DYNLINKER: u32 = 0x4b4d_444c; // "KMDL"
/// One open file descriptor.
pub const NT_KM_FILE: u32 = 0x4b4d_4644; // "KMFD"
/// One open socket.
pub const NT_KM_SOCKET: u32 = 0x4b4d_534b; // "KMSK"
/// One eventfd/epoll descriptor.
pub const NT_KM_EVENTFD: u32 = 0x4b4d_4556; // "KMEV"
/// The process sigaction table.
pub const NT_KM_SIGHAND: u32 = 0x4b4d_5348; // "KMSH"
/// The async-IO context id mapping.
pub const NT_KM_IOCONTEXTS: u32 = 0x4b4d_494f; // "KMIO"

/// Standard core note: general registers + process info.
pub const NT_PRSTATUS: u32 = 1;
/// Standard core note: auxiliary vector.
pub const NT_AUXV: u32 = 6;
/// Standard core note: mapped-files table.
pub const NT_FILE: u32 = 0x4649_4c45; // "FILE"

/// ELF magic.
pub const ELFMAG: [u8; 4] = [0x7f, b'E', b'L', b'F'];
/// 64-bit class.
pub const ELFCLASS64: u8 = 2;
/// Little-endian data.
pub const ELFDATA2LSB: u8 = 1;
/// Current ELF version.
pub const EV_CURRENT: u8 = 1;
/// Core file type.
pub const ET_CORE: u16 = 4;
/// x86-64 machine.
pub const EM_X86_64: u16 = 62;
/// Loadable segment.
pub const PT_LOAD: u32 = 1;
/// Note segment.
pub const PT_NOTE: u32 = 4;
/// Segment readable.
pub const PF_R: u32 = 4;
/// Segment writable.
pub const PF_W: u32 = 2;
/// Segment executable.
pub const PF_X: u32 = 1;

/// ELF64 file header.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elf64Ehdr {
    /// Identification bytes.
    pub e_ident: [u8; 16],
    /// Object file type.
    pub e_type: u16,
    /// Machine architecture.
    pub e_machine: u16,
    /// Object file version.
    pub e_version: u32,
    /// Entry point.
    pub e_entry: u64,
    /// Program header table offset.
    pub e_phoff: u64,
    /// Section header table offset.
    pub e_shoff: u64,
    /// Processor flags.
    pub e_flags: u32,
    /// ELF header size.
    pub e_ehsize: u16,
    /// Program header entry size.
    pub e_phentsize: u16,
    /// Program header count.
    pub e_phnum: u16,
    /// Section header entry size.
    pub e_shentsize: u16,
    /// Section header count.
    pub e_shnum: u16,
    /// Section name string table index.
    pub e_shstrndx: u16,
}

impl Elf64Ehdr {
    /// A core-file header template with `phnum` program headers following
    /// immediately after it.
    #[must_use]
    pub fn core(phnum: u16) -> Self {
        let mut e_ident = [0u8; 16];
        e_ident[..4].copy_from_slice(&ELFMAG);
        e_ident[4] = ELFCLASS64;
        e_ident[5] = ELFDATA2LSB;
        e_ident[6] = EV_CURRENT;
        Self {
            e_ident,
            e_type: ET_CORE,
            e_machine: EM_X86_64,
            e_version: 1,
            e_entry: 0,
            e_phoff: std::mem::size_of::<Self>() as u64,
            e_shoff: 0,
            e_flags: 0,
            e_ehsize: std::mem::size_of::<Self>() as u16,
            e_phentsize: std::mem::size_of::<Elf64Phdr>() as u16,
            e_phnum: phnum,
            e_shentsize: 0,
            e_shnum: 0,
            e_shstrndx: 0,
        }
    }

    /// True when the identification bytes name a little-endian ELF64 file.
    #[must_use]
    pub fn ident_ok(&self) -> bool {
        self.e_ident[..4] == ELFMAG
            && self.e_ident[4] == ELFCLASS64
            && self.e_ident[5] == ELFDATA2LSB
    }
}

/// ELF64 program header.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Elf64Phdr {
    /// Segment type.
    pub p_type: u32,
    /// Segment flags.
    pub p_flags: u32,
    /// File offset.
    pub p_offset: u64,
    /// Virtual address.
    pub p_vaddr: u64,
    /// Physical address.
    pub p_paddr: u64,
    /// Bytes in the file image.
    pub p_filesz: u64,
    /// Bytes in the memory image.
    pub p_memsz: u64,
    /// Alignment.
    pub p_align: u64,
}

/// ELF64 note header; name and descriptor follow, each padded to 4 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf64Nhdr {
    /// Length of the owner name, including NUL.
    pub n_namesz: u32,
    /// Length of the descriptor.
    pub n_descsz: u32,
    /// Note type.
    pub n_type: u32,
}

/// Reinterprets a plain-data struct as bytes.
#[must_use]
pub fn bytes_of<T: Copy>(v: &T) -> &[u8] {
    // SAFETY: T is constrained to Copy plain-data structs in this module;
    // reading its object representation is well defined.
    unsafe { std::slice::from_raw_parts(std::ptr::from_ref(v).cast::<u8>(), std::mem::size_of::<T>()) }
}

/// Reads a plain-data struct from the front of a byte slice. `None` if the
/// slice is too short.
#[must_use]
pub fn pod_from_bytes<T: Copy>(b: &[u8]) -> Option<T> {
    if b.len() < std::mem::size_of::<T>() {
        return None;
    }
    // SAFETY: length checked; read_unaligned handles any alignment.
    Some(unsafe { b.as_ptr().cast::<T>().read_unaligned() })
}

const fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Serializes a sequence of ELF notes into one PT_NOTE image.
#[derive(Default)]
pub struct NoteWriter {
    buf: Vec<u8>,
}

impl NoteWriter {
    /// Creates an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one note.
    pub fn add(&mut self, owner: &str, ntype: u32, desc: &[u8]) {
        let nhdr = Elf64Nhdr {
            n_namesz: (owner.len() + 1) as u32,
            n_descsz: desc.len() as u32,
            n_type: ntype,
        };
        self.buf.extend_from_slice(bytes_of(&nhdr));
        self.buf.extend_from_slice(owner.as_bytes());
        self.buf.push(0);
        self.buf.resize(align4(self.buf.len()), 0);
        self.buf.extend_from_slice(desc);
        self.buf.resize(align4(self.buf.len()), 0);
    }

    /// The finished PT_NOTE image.
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    /// Current image size.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when no notes were added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// One parsed note.
#[derive(Debug, Clone)]
pub struct Note<'a> {
    /// Owner string without the trailing NUL.
    pub owner: &'a str,
    /// Note type tag.
    pub ntype: u32,
    /// Descriptor bytes.
    pub desc: &'a [u8],
}

/// Iterates the notes of a PT_NOTE image.
pub fn parse_notes(mut buf: &[u8]) -> Vec<Note<'_>> {
    let mut out = Vec::new();
    while buf.len() >= std::mem::size_of::<Elf64Nhdr>() {
        let Some(nhdr) = pod_from_bytes::<Elf64Nhdr>(buf) else { break };
        let name_off = std::mem::size_of::<Elf64Nhdr>();
        let name_end = name_off + nhdr.n_namesz as usize;
        let desc_off = align4(name_end);
        let desc_end = desc_off + nhdr.n_descsz as usize;
        if desc_end > buf.len() {
            break;
        }
        let owner = if nhdr.n_namesz == 0 {
            ""
        } else {
            std::str::from_utf8(&buf[name_off..name_end - 1]).unwrap_or("")
        };
        out.push(Note { owner, ntype: nhdr.n_type, desc: &buf[desc_off..desc_end] });
        buf = &buf[align4(desc_end)..];
    }
    out
}

// ── Private note descriptors ────────────────────────────────────────

/// NT_KM_MONITOR descriptor. NUL-terminated label and description strings
/// follow.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NtMonitor {
    /// Backend identity (0 = KVM, 1 = the kernel-module backend).
    pub monitor_type: u32,
    /// Length of the label string that follows, including NUL.
    pub label_length: u32,
    /// Length of the description string that follows, including NUL.
    pub description_length: u32,
}

/// NT_KM_VCPU descriptor. Floating-point data in `fp_format` layout
/// follows.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NtVcpu {
    /// VCPU id.
    pub vcpu_id: u32,
    /// Reserved.
    pub pad: u32,
    /// Guest stack top.
    pub stack_top: u64,
    /// Guest TLS pointer (FS.base).
    pub guest_thr: u64,
    /// `set_child_tid` address.
    pub set_child_tid: u64,
    /// `clear_child_tid` address.
    pub clear_child_tid: u64,
    /// Alternate signal stack base.
    pub sigaltstack_sp: u64,
    /// Alternate stack flags.
    pub sigaltstack_flags: u32,
    /// Reserved.
    pub pad2: u32,
    /// Alternate stack size.
    pub sigaltstack_size: u64,
    /// Deferred self-unmap base.
    pub mapself_base: u64,
    /// Deferred self-unmap size.
    pub mapself_size: u64,
    /// Hypercall in flight at pause time.
    pub hypercall: u16,
    /// Whether that hypercall must restart on resume.
    pub restart: u16,
    /// Format tag of the FP data that follows.
    pub fp_format: u32,
    /// The thread's blocked-signal mask.
    pub sigmask: u64,
}

/// NT_KM_GUEST / NT_KM_DYNLINKER descriptor. The program header table and
/// a NUL-terminated filename follow.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NtGuest {
    /// Relocation adjustment applied at load time.
    pub load_adjust: u64,
    /// The payload's ELF header.
    pub ehdr: Elf64Ehdr,
}

/// NT_KM_SIGHAND entry, one per installed action.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NtSighand {
    /// Size of this record (forward compatibility).
    pub size: u32,
    /// Signal number.
    pub signo: u32,
    /// Guest handler address (or SIG_DFL/SIG_IGN sentinels).
    pub handler: u64,
    /// sigaction flags.
    pub flags: u32,
    /// Reserved.
    pub pad: u32,
    /// Guest restorer address.
    pub restorer: u64,
    /// Blocked mask during handler execution.
    pub mask: u64,
}

/// NT_KM_IOCONTEXTS entry: one guest↔host aio context pair.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NtIocontext {
    /// The id the guest holds.
    pub guest_id: u64,
    /// The id the host kernel issued.
    pub host_id: u64,
}

/// Header of the standard NT_FILE note; `count` `[start,end,offset]`
/// triples follow, then the NUL-terminated path strings.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NtFileHdr {
    /// Number of mapped-file entries.
    pub count: u64,
    /// Page size the offsets are expressed in.
    pub page_size: u64,
}

/// x86-64 `elf_prstatus`, as debuggers expect it in NT_PRSTATUS.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Prstatus {
    /// Signal info: signo, code, errno.
    pub pr_info: [i32; 3],
    /// Current signal.
    pub pr_cursig: i16,
    /// Padding.
    pub pad0: u16,
    /// Pending signals.
    pub pr_sigpend: u64,
    /// Held signals.
    pub pr_sighold: u64,
    /// Thread id.
    pub pr_pid: i32,
    /// Parent pid.
    pub pr_ppid: i32,
    /// Process group.
    pub pr_pgrp: i32,
    /// Session id.
    pub pr_sid: i32,
    /// User/system/cumulative times (four timevals).
    pub pr_times: [u64; 8],
    /// General registers in `user_regs_struct` order.
    pub pr_reg: [u64; 27],
    /// FP registers valid flag.
    pub pr_fpvalid: i32,
    /// Padding.
    pub pad1: u32,
}

impl Default for Prstatus {
    fn default() -> Self {
        // SAFETY: Prstatus is plain repr(C) integer data; all-zero is valid.
        unsafe { std::mem::zeroed() }
    }
}

/// Indices into [`Prstatus::pr_reg`] (x86-64 `user_regs_struct` order).
pub mod greg {
    /// r15
    pub const R15: usize = 0;
    /// r14
    pub const R14: usize = 1;
    /// r13
    pub const R13: usize = 2;
    /// r12
    pub const R12: usize = 3;
    /// rbp
    pub const RBP: usize = 4;
    /// rbx
    pub const RBX: usize = 5;
    /// r11
    pub const R11: usize = 6;
    /// r10
    pub const R10: usize = 7;
    /// r9
    pub const R9: usize = 8;
    /// r8
    pub const R8: usize = 9;
    /// rax
    pub const RAX: usize = 10;
    /// rcx
    pub const RCX: usize = 11;
    /// rdx
    pub const RDX: usize = 12;
    /// rsi
    pub const RSI: usize = 13;
    /// rdi
    pub const RDI: usize = 14;
    /// orig_rax
    pub const ORIG_RAX: usize = 15;
    /// rip
    pub const RIP: usize = 16;
    /// cs
    pub const CS: usize = 17;
    /// eflags
    pub const EFLAGS: usize = 18;
    /// rsp
    pub const RSP: usize = 19;
    /// ss
    pub const SS: usize = 20;
    /// fs_base
    pub const FS_BASE: usize = 21;
    /// gs_base
    pub const GS_BASE: usize = 22;
    /// ds
    pub const DS: usize = 23;
    /// es
    pub const ES: usize = 24;
    /// fs
    pub const FS: usize = 25;
    /// gs
    pub const GS: usize = 26;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prstatus_layout_is_336_bytes() {
        assert_eq!(std::mem::size_of::<Prstatus>(), 336);
    }

    #[test]
    fn ehdr_phdr_sizes() {
        assert_eq!(std::mem::size_of::<Elf64Ehdr>(), 64);
        assert_eq!(std::mem::size_of::<Elf64Phdr>(), 56);
        assert_eq!(std::mem::size_of::<Elf64Nhdr>(), 12);
    }

    #[test]
    fn notes_round_trip() {
        let mut w = NoteWriter::new();
        let vcpu = NtVcpu { vcpu_id: 3, stack_top: 0x8000_0000, sigmask: 0xff, ..Default::default() };
        w.add(KM_NT_NAME, NT_KM_VCPU, bytes_of(&vcpu));
        w.add(CORE_NT_NAME, NT_AUXV, &[1, 2, 3, 4, 5]);
        let img = w.finish();
        assert_eq!(img.len() % 4, 0);

        let notes = parse_notes(&img);
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].owner, KM_NT_NAME);
        assert_eq!(notes[0].ntype, NT_KM_VCPU);
        let back: NtVcpu = pod_from_bytes(notes[0].desc).unwrap();
        assert_eq!(back, vcpu);
        assert_eq!(notes[1].owner, CORE_NT_NAME);
        assert_eq!(notes[1].desc, &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn core_header_identifies_itself() {
        let e = Elf64Ehdr::core(7);
        assert!(e.ident_ok());
        assert_eq!(e.e_type, ET_CORE);
        assert_eq!(e.e_machine, EM_X86_64);
        assert_eq!(e.e_phnum, 7);
    }
}
