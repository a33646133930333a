//! Bootstraps the ELF loader service itself as a plain `PT_LOAD`-segment
//! copy, the same shallow algorithm `kernel::init::spawn_init_process` uses
//! to start this very process - no dynamic linking, since the loader
//! cannot depend on itself to resolve its own shared-library needs.
//!
//! Every other executable in the system goes through the loader's full
//! algorithm instead; this is a one-time bootstrap, not a general-purpose
//! loader.

use alloc::vec;

use perception::abi::{Error, Pid, ProcessFlags};
use perception::{mem, process};

use crate::vfs::Vfs;

pub fn launch(vfs: &Vfs, path: &str) -> Result<Pid, Error> {
    let entry = vfs.resolve(path)?;
    let mut bytes = vec![0u8; entry.data_length as usize];
    vfs.read_entry(&entry, 0, &mut bytes)?;

    let elf = match elf_rs::Elf::from_bytes(&bytes).map_err(|_| Error::InvalidArgument)? {
        elf_rs::Elf::Elf64(elf) => elf,
        elf_rs::Elf::Elf32(_) => return Err(Error::InvalidArgument),
    };

    let child = process::create_process(b"loader", ProcessFlags::LAUNCHER)?;
    let result = load_segments(&elf, &bytes, child);
    match result {
        Ok(()) => {
            process::start_execution(child, elf.header().entry_point())?;
            Ok(child)
        }
        Err(e) => {
            let _ = process::destroy_child_process(child);
            Err(e)
        }
    }
}

fn load_segments(elf: &elf_rs::Elf64<'_>, bytes: &[u8], child: Pid) -> Result<(), Error> {
    const PAGE_SIZE: u64 = mem::PAGE_SIZE;

    for ph in elf.program_headers() {
        if ph.ph_type() != elf_rs::ProgramType::LOAD {
            continue;
        }

        let va_start = ph.vaddr() & !(PAGE_SIZE - 1);
        let va_end = (ph.vaddr() + ph.memsz() + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let writable = ph.flags() & 0b10 != 0;
        let page_count = (va_end - va_start) / PAGE_SIZE;

        let (p_offset, p_filesz) = (ph.offset() as usize, ph.filesz() as usize);
        let file_bytes = &bytes[p_offset..p_offset + p_filesz];
        let file_off = (ph.vaddr() - va_start) as usize;

        let staging = mem::allocate_pages(page_count)?;
        let dst = unsafe { core::slice::from_raw_parts_mut(staging as *mut u8, (page_count * PAGE_SIZE) as usize) };
        for (i, slot) in dst.iter_mut().enumerate() {
            *slot = if i >= file_off && i - file_off < file_bytes.len() { file_bytes[i - file_off] } else { 0 };
        }

        for i in 0..page_count {
            let src_va = staging + i * PAGE_SIZE;
            let dst_va = va_start + i * PAGE_SIZE;
            process::set_child_memory_page(child, src_va, dst_va, writable)?;
        }
    }

    Ok(())
}
