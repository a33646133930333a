//! ELF64 parsing beyond plain `PT_LOAD` segments: section headers, the
//! `.dynamic` table, the dynamic symbol table, and `.rela.dyn`/`.rela.plt`
//! relocations.
//!
//! `elf_rs` (used here for header validation, program headers and the entry
//! point, the same surface `kernel::init` and `storage_manager::bootstrap`
//! already use) has no dynamic-linking support, so everything below reads
//! the ELF64 on-disk layout directly out of the file bytes - the same way
//! `elf_file.cc`'s `Elf64_Shdr*`/`Elf64_Dyn*` casts over a memory span do,
//! just field-by-field instead of by pointer cast.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use perception_abi::Error;

const DT_NEEDED: i64 = 1;

pub const SHT_DYNSYM: u32 = 11;
pub const SHT_DYNAMIC: u32 = 6;

pub const R_X86_64_64: u32 = 1;
pub const R_X86_64_GLOB_DAT: u32 = 6;
pub const R_X86_64_JUMP_SLOT: u32 = 7;
pub const R_X86_64_RELATIVE: u32 = 8;
pub const R_X86_64_DTPMOD64: u32 = 16;

pub const STB_LOCAL: u8 = 0;
pub const STB_WEAK: u8 = 2;
pub const SHN_UNDEF: u16 = 0;

fn u16_at(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(b[off..off + 2].try_into().unwrap())
}
fn u32_at(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(b[off..off + 4].try_into().unwrap())
}
fn u64_at(b: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(b[off..off + 8].try_into().unwrap())
}
fn i64_at(b: &[u8], off: usize) -> i64 {
    i64::from_le_bytes(b[off..off + 8].try_into().unwrap())
}

#[derive(Clone, Copy)]
pub struct SectionHeader {
    pub sh_type: u32,
    pub sh_addr: u64,
    pub sh_offset: u64,
    pub sh_size: u64,
}

#[derive(Clone, Copy)]
pub struct Sym {
    pub name_off: u32,
    pub info: u8,
    pub shndx: u16,
    pub value: u64,
}

impl Sym {
    pub fn bind(&self) -> u8 {
        self.info >> 4
    }
}

#[derive(Clone, Copy)]
pub struct Rela {
    pub offset: u64,
    pub sym_index: u32,
    pub kind: u32,
    pub addend: i64,
}

/// A tuple-of-arrays pointer, e.g. `.init_array`: base address and element
/// count once loaded at some module offset.
#[derive(Clone, Copy)]
pub struct ArrayRef {
    pub addr: u64,
    pub count: u64,
}

/// A parsed, section-indexed view of one ELF64 file. Does not itself hold
/// any child-process state; [`crate::load`] drives the actual loading.
pub struct ElfImage {
    bytes: Vec<u8>,
    e_type: u16,
    e_entry: u64,
    dynamic: Option<SectionHeader>,
    dynsym: Option<SectionHeader>,
    dynstr: Option<SectionHeader>,
    rela_dyn: Option<SectionHeader>,
    rela_plt: Option<SectionHeader>,
    preinit_array: Option<SectionHeader>,
    init_array: Option<SectionHeader>,
    fini_array: Option<SectionHeader>,
    init: Option<SectionHeader>,
    fini: Option<SectionHeader>,
    program_headers: Vec<elf_rs::ProgramHeaderEntry>,
    highest_vaddr: u64,
}

const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;

impl ElfImage {
    pub fn parse(bytes: Vec<u8>) -> Result<Self, Error> {
        if bytes.len() < 64 {
            return Err(Error::InvalidArgument);
        }
        let elf = match elf_rs::Elf::from_bytes(&bytes).map_err(|_| Error::InvalidArgument)? {
            elf_rs::Elf::Elf64(elf) => elf,
            elf_rs::Elf::Elf32(_) => return Err(Error::InvalidArgument),
        };
        let e_type = u16_at(&bytes, 0x10);
        let e_entry = elf.header().entry_point();
        let program_headers: Vec<_> = elf.program_headers().collect();

        let e_shoff = u64_at(&bytes, 0x28) as usize;
        let e_shentsize = u16_at(&bytes, 0x3a) as usize;
        let e_shnum = u16_at(&bytes, 0x3c) as usize;
        let e_shstrndx = u16_at(&bytes, 0x3e) as usize;

        let mut raw_sections = Vec::with_capacity(e_shnum);
        for i in 0..e_shnum {
            let base = e_shoff + i * e_shentsize;
            if base + 64 > bytes.len() {
                return Err(Error::InvalidArgument);
            }
            raw_sections.push((
                u32_at(&bytes, base), // sh_name
                SectionHeader { sh_type: u32_at(&bytes, base + 4), sh_addr: u64_at(&bytes, base + 16), sh_offset: u64_at(&bytes, base + 24), sh_size: u64_at(&bytes, base + 32) },
            ));
        }

        let shstrtab_off = raw_sections.get(e_shstrndx).map(|(_, s)| s.sh_offset as usize);
        let section_name = |name_off: u32| -> Option<&str> {
            let base = shstrtab_off? + name_off as usize;
            let end = bytes[base..].iter().position(|&b| b == 0)? + base;
            core::str::from_utf8(&bytes[base..end]).ok()
        };

        let mut image = Self {
            bytes,
            e_type,
            e_entry,
            dynamic: None,
            dynsym: None,
            dynstr: None,
            rela_dyn: None,
            rela_plt: None,
            preinit_array: None,
            init_array: None,
            fini_array: None,
            init: None,
            fini: None,
            program_headers,
            highest_vaddr: 0,
        };

        for (name_off, header) in &raw_sections {
            match section_name(*name_off) {
                Some(".dynamic") => image.dynamic = Some(*header),
                Some(".dynsym") => image.dynsym = Some(*header),
                Some(".dynstr") => image.dynstr = Some(*header),
                Some(".rela.dyn") => image.rela_dyn = Some(*header),
                Some(".rela.plt") => image.rela_plt = Some(*header),
                Some(".preinit_array") => image.preinit_array = Some(*header),
                Some(".init_array") => image.init_array = Some(*header),
                Some(".fini_array") => image.fini_array = Some(*header),
                Some(".init") => image.init = Some(*header),
                Some(".fini") => image.fini = Some(*header),
                _ => {}
            }
        }

        image.highest_vaddr = image.compute_highest_vaddr();
        Ok(image)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_executable(&self) -> bool {
        self.e_type == ET_EXEC || self.e_type == ET_DYN
    }

    pub fn entry_point(&self) -> u64 {
        self.e_entry
    }

    pub fn program_headers(&self) -> &[elf_rs::ProgramHeaderEntry] {
        &self.program_headers
    }

    fn compute_highest_vaddr(&self) -> u64 {
        const PAGE: u64 = 4096;
        let mut highest = 0u64;
        for ph in &self.program_headers {
            if ph.ph_type() == elf_rs::ProgramType::LOAD {
                highest = highest.max(ph.vaddr() + ph.memsz());
            }
        }
        (highest + PAGE - 1) & !(PAGE - 1)
    }

    pub fn highest_virtual_address(&self) -> u64 {
        self.highest_vaddr
    }

    fn dynstr_at(&self, off: u32) -> Option<&str> {
        let section = self.dynstr?;
        let base = section.sh_offset as usize + off as usize;
        let end = self.bytes[base..].iter().position(|&b| b == 0)? + base;
        core::str::from_utf8(&self.bytes[base..end]).ok()
    }

    /// Names of every `DT_NEEDED` entry in `.dynamic`, in file order.
    pub fn dependent_libraries(&self) -> Vec<String> {
        let mut out = Vec::new();
        let Some(section) = self.dynamic else { return out };
        let count = section.sh_size as usize / 16;
        for i in 0..count {
            let base = section.sh_offset as usize + i * 16;
            if base + 16 > self.bytes.len() {
                break;
            }
            let tag = i64_at(&self.bytes, base);
            if tag != DT_NEEDED {
                continue;
            }
            let val = u64_at(&self.bytes, base + 8) as u32;
            if let Some(name) = self.dynstr_at(val) {
                out.push(name.to_string());
            }
        }
        out
    }

    fn dynsym_count(&self) -> usize {
        self.dynsym.map(|s| s.sh_size as usize / 24).unwrap_or(0)
    }

    fn sym(&self, index: usize) -> Option<Sym> {
        let section = self.dynsym?;
        let base = section.sh_offset as usize + index * 24;
        if base + 24 > self.bytes.len() {
            return None;
        }
        Some(Sym { name_off: u32_at(&self.bytes, base), info: self.bytes[base + 4], shndx: u16_at(&self.bytes, base + 6), value: u64_at(&self.bytes, base + 8) })
    }

    pub fn sym_name(&self, sym: &Sym) -> Option<&str> {
        self.dynstr_at(sym.name_off)
    }

    /// Every exported (non-local, defined) dynamic symbol, skipping the
    /// reserved index-0 "undefined" entry.
    pub fn exported_symbols(&self) -> Vec<(String, Sym)> {
        let mut out = Vec::new();
        for i in 1..self.dynsym_count() {
            let Some(sym) = self.sym(i) else { continue };
            if sym.shndx == SHN_UNDEF || sym.bind() == STB_LOCAL {
                continue;
            }
            let Some(name) = self.sym_name(&sym) else { continue };
            out.push((name.to_string(), sym));
        }
        out
    }

    fn relas(&self, section: Option<SectionHeader>) -> Vec<Rela> {
        let Some(section) = section else { return Vec::new() };
        let count = section.sh_size as usize / 24;
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let base = section.sh_offset as usize + i * 24;
            if base + 24 > self.bytes.len() {
                break;
            }
            let info = u64_at(&self.bytes, base + 8);
            out.push(Rela { offset: u64_at(&self.bytes, base), sym_index: (info >> 32) as u32, kind: info as u32, addend: i64_at(&self.bytes, base + 16) });
        }
        out
    }

    /// Every relocation this module needs fixed up, `.rela.dyn` then
    /// `.rela.plt`.
    pub fn relocations(&self) -> Vec<Rela> {
        let mut out = self.relas(self.rela_dyn);
        out.extend(self.relas(self.rela_plt));
        out
    }

    pub fn relocation_symbol(&self, rela: &Rela) -> Option<Sym> {
        self.sym(rela.sym_index as usize)
    }

    pub fn preinit_array(&self) -> Option<ArrayRef> {
        self.preinit_array.map(|s| ArrayRef { addr: s.sh_addr, count: s.sh_size / 8 })
    }
    pub fn init_array(&self) -> Option<ArrayRef> {
        self.init_array.map(|s| ArrayRef { addr: s.sh_addr, count: s.sh_size / 8 })
    }
    pub fn fini_array(&self) -> Option<ArrayRef> {
        self.fini_array.map(|s| ArrayRef { addr: s.sh_addr, count: s.sh_size / 8 })
    }
    /// A bare `.init`/`.fini` function, reported the same shape as an
    /// array entry (one address, `sh_size` standing in for a one-element
    /// count so callers can treat it uniformly); matches the original
    /// loader's documented "flakey" fallback for binaries without
    /// `.init_array`/`.fini_array`.
    pub fn init_function(&self) -> Option<ArrayRef> {
        self.init.map(|s| ArrayRef { addr: s.sh_addr, count: s.sh_size })
    }
    pub fn fini_function(&self) -> Option<ArrayRef> {
        self.fini.map(|s| ArrayRef { addr: s.sh_addr, count: s.sh_size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_endian_reads_match_byte_layout() {
        let bytes = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        assert_eq!(u16_at(&bytes, 0), 0x0201);
        assert_eq!(u32_at(&bytes, 0), 0x04030201);
        assert_eq!(u64_at(&bytes, 0), 0x0807060504030201);
        assert_eq!(i64_at(&bytes, 0), 0x0807060504030201);
    }

    #[test]
    fn sym_bind_is_top_nibble_of_info() {
        let sym = Sym { name_off: 0, info: (STB_WEAK << 4) | 0x2, shndx: 1, value: 0 };
        assert_eq!(sym.bind(), STB_WEAK);
    }
}
