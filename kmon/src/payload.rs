//! The loaded-payload descriptor the core consumes.
//!
//! The ELF loader is an external collaborator: it maps the executable (and
//! optionally the dynamic linker) into the bottom zone and hands the core a
//! [`Payload`] describing what it placed where. The core uses it for access
//! validation below the break, for coredump program headers, and to record
//! the guest identity in snapshots.

use crate::Gva;
use crate::elfcore::{Elf64Ehdr, Elf64Phdr, PF_R, PF_W, PF_X, PT_LOAD};

/// Descriptor of one loaded ELF object (the payload or its dynamic linker).
#[derive(Debug, Clone)]
pub struct Payload {
    /// Path the object was loaded from.
    pub filename: String,
    /// The object's ELF header as read from the file.
    pub ehdr: Elf64Ehdr,
    /// The object's program headers as read from the file.
    pub phdrs: Vec<Elf64Phdr>,
    /// Relocation adjustment the loader applied to every virtual address.
    pub load_adjust: u64,
    /// Adjusted entry point.
    pub entry: Gva,
}

impl Payload {
    /// True when `[gva, gva+size)` lies inside one PT_LOAD of this object
    /// with at least `prot` access (`PROT_*` bits).
    #[must_use]
    pub fn gva_accessible(&self, gva: Gva, size: u64, prot: i32) -> bool {
        for phdr in &self.phdrs {
            if phdr.p_type != PT_LOAD {
                continue;
            }
            let lo = phdr.p_vaddr + self.load_adjust;
            let hi = lo + phdr.p_memsz;
            if gva < lo || gva + size > hi {
                continue;
            }
            let mut rprot = 0;
            if phdr.p_flags & PF_R != 0 {
                rprot |= 0x1; // PROT_READ
            }
            if phdr.p_flags & PF_W != 0 {
                rprot |= 0x2; // PROT_WRITE
            }
            if phdr.p_flags & PF_X != 0 {
                rprot |= 0x4; // PROT_EXEC
            }
            return rprot != 0 && (prot & rprot) == prot;
        }
        false
    }

    /// Highest adjusted end address of any PT_LOAD; the loader sets the
    /// initial program break here.
    #[must_use]
    pub fn load_end(&self) -> Gva {
        self.phdrs
            .iter()
            .filter(|p| p.p_type == PT_LOAD)
            .map(|p| p.p_vaddr + self.load_adjust + p.p_memsz)
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phdr(vaddr: u64, memsz: u64, flags: u32) -> Elf64Phdr {
        Elf64Phdr { p_type: PT_LOAD, p_flags: flags, p_vaddr: vaddr, p_memsz: memsz, ..Default::default() }
    }

    fn payload() -> Payload {
        Payload {
            filename: "payload.km".to_string(),
            ehdr: Elf64Ehdr::core(0),
            phdrs: vec![
                phdr(0x20_0000, 0x1000, PF_R | PF_X),
                phdr(0x20_2000, 0x2000, PF_R | PF_W),
            ],
            load_adjust: 0,
            entry: 0x20_0000,
        }
    }

    #[test]
    fn access_follows_phdr_flags() {
        let p = payload();
        assert!(p.gva_accessible(0x20_0000, 16, 0x4 | 0x1)); // r-x
        assert!(!p.gva_accessible(0x20_0000, 16, 0x2)); // not writable
        assert!(p.gva_accessible(0x20_2000, 0x2000, 0x2));
        assert!(!p.gva_accessible(0x20_1000, 16, 0x1)); // hole between loads
    }

    #[test]
    fn load_end_is_highest_segment_end() {
        assert_eq!(payload().load_end(), 0x20_4000);
    }
}
