//! The storage manager: mounts the boot ISO-9660 image, serves the VFS RPC
//! protocol ([`perception::storage`]) and memory-mapped files over it, and
//! bootstraps the ELF loader service as its first child once mounted.
//!
//! This is the one process the kernel starts directly (see
//! `kernel::init::spawn_init_process`); every other process in the system,
//! including the loader, comes up through [`perception::loader::
//! launch_application`] once this one is serving `/`.

#![no_std]
#![no_main]
#![feature(alloc_error_handler)]

extern crate alloc;

mod block_device;
mod bootstrap;
mod iso9660;
mod mmf;
mod vfs;

use alloc::format;
use alloc::vec::Vec;

use perception::abi::Error;
use perception::{ipc, mem, process, services};
use perception::storage as proto;

use block_device::{MappedImage, SECTOR_SIZE};
use iso9660::{Entry, Iso9660};
use mmf::MmfTable;
use vfs::Vfs;

const BOOT_MOUNT_NAME: &str = "cdrom0";
const LOADER_PATH: &str = "/cdrom0/loader";

/// Laid down at a fixed address in this process by `kernel::init::
/// spawn_init_process` before its first thread runs.
#[repr(C)]
struct BootInfo {
    initrd_phys_base: u64,
    initrd_size: u64,
}

#[no_mangle]
pub extern "C" fn _start(boot_info_va: u64) -> ! {
    perception::heap::init();

    let boot_info = unsafe { &*(boot_info_va as *const BootInfo) };
    let pages = boot_info.initrd_size.div_ceil(mem::PAGE_SIZE);
    let base = mem::map_physical_memory(boot_info.initrd_phys_base, pages).expect("storage_manager: failed to map initrd");

    let device = unsafe { MappedImage::new(base as *const u8, boot_info.initrd_size as usize) };
    let fs = Iso9660::mount(device).expect("storage_manager: initrd is not a valid ISO-9660 image");

    let mut vfs = Vfs::new();
    vfs.mount(BOOT_MOUNT_NAME, fs);

    services::register(proto::SERVICE_NAME, proto::MESSAGE_ID).expect("storage_manager: failed to register service");

    if let Err(e) = bootstrap::launch(&vfs, LOADER_PATH) {
        process::debug_print(&format!("storage_manager: failed to bootstrap loader: {:?}\n", e));
    }

    let mut mmfs = MmfTable::new();
    let mut known_clients: Vec<u64> = Vec::new();

    loop {
        let (id, sender, a1, a2, a3, a4, a5) = ipc::receive_blocking();

        if id == 0 {
            // Kernel-origin death notification: `a1` carries the dead pid.
            vfs.close_all_for(a1);
            known_clients.retain(|&p| p != a1);
            continue;
        }

        if id == proto::MESSAGE_ID {
            if !known_clients.contains(&sender) {
                let _ = process::notify_upon_process_death(sender);
                known_clients.push(sender);
            }
            handle_request(&mut vfs, &mut mmfs, sender, a1, a2, a3, a4, a5);
            continue;
        }

        if mmfs.owns_message_id(id) {
            if let Some(fs) = vfs.first_mount_fs() {
                let _ = mmfs.handle_page_miss(fs, id, a1);
            }
        }
    }
}

/// Dispatches one client RPC: `method` is the operation tag, the remaining
/// four words are that method's own argument layout (see
/// [`perception::storage`]'s client-side senders for each shape).
fn handle_request(vfs: &mut Vfs, mmfs: &mut MmfTable, sender: u64, method: u64, a2: u64, a3: u64, a4: u64, a5: u64) {
    match method {
        proto::METHOD_OPEN_FILE => reply(sender, with_path(a2, a4, |path| handle_open_file(vfs, sender, path))),
        proto::METHOD_OPEN_MEMORY_MAPPED_FILE => {
            reply(sender, with_path(a2, a4, |path| handle_open_mmf(vfs, mmfs, sender, path)))
        }
        proto::METHOD_CHECK_PERMISSIONS => reply(sender, with_path(a2, a4, |path| handle_check_permissions(vfs, path))),
        proto::METHOD_GET_FILE_STATISTICS => {
            reply(sender, with_path(a2, a4, |path| handle_get_file_statistics(vfs, path)))
        }
        proto::METHOD_READ_DIRECTORY => reply_with_page(sender, with_path(a2, a4, |path| handle_read_directory(vfs, path, a3))),
        proto::METHOD_READ_FILE => reply_with_page(sender, handle_read_file(vfs, sender, a2, a3, a4)),
        proto::METHOD_CLOSE_FILE => reply(sender, handle_close_file(vfs, sender, a2)),
        _ => reply(sender, Err(Error::Unimplemented)),
    }
}

/// Reads the path out of the page transferred alongside the request
/// (`len` bytes at `page`), runs `f` with it, and frees the page
/// regardless of outcome.
fn with_path<T>(len: u64, page: u64, f: impl FnOnce(&str) -> Result<T, Error>) -> Result<T, Error> {
    let bytes = unsafe { core::slice::from_raw_parts(page as *const u8, len as usize) };
    let path = core::str::from_utf8(bytes).map_err(|_| Error::InvalidArgument);
    let result = path.and_then(f);
    let _ = mem::release_pages(page);
    result
}

fn reply(sender: u64, result: Result<(u64, u64, u64, u64), Error>) {
    match result {
        Ok((r1, r2, r3, r4)) => {
            let _ = ipc::send(sender, 0, Error::Ok.to_retval() as u64, r1, r2, r3, r4);
        }
        Err(e) => {
            let _ = ipc::send(sender, 0, e.to_retval() as u64, 0, 0, 0, 0);
        }
    }
}

/// Like [`reply`] but for the two methods whose success reply transfers a
/// page back to the caller (`ReadDirectory`, `ReadFile`): `Ok` carries
/// `(scalar1, scalar2, page_to_transfer)`.
fn reply_with_page(sender: u64, result: Result<(u64, u64, u64), Error>) {
    match result {
        Ok((r1, r2, page)) => {
            let _ = ipc::send_with_pages(sender, 0, Error::Ok.to_retval() as u64, r1, r2, page, 1);
        }
        Err(e) => {
            let _ = ipc::send(sender, 0, e.to_retval() as u64, 0, 0, 0, 0);
        }
    }
}

fn handle_open_file(vfs: &mut Vfs, sender: u64, path: &str) -> Result<(u64, u64, u64, u64), Error> {
    let (handle, entry) = vfs.open(sender, path)?;
    Ok((handle, entry.data_length as u64, SECTOR_SIZE as u64, 0))
}

fn handle_open_mmf(vfs: &mut Vfs, mmfs: &mut MmfTable, sender: u64, path: &str) -> Result<(u64, u64, u64, u64), Error> {
    let (handle, entry) = vfs.open(sender, path)?;
    let (segment, _lazy_id) = mmfs.open(entry, sender)?;
    Ok((handle, segment, 0, 0))
}

fn handle_check_permissions(vfs: &Vfs, path: &str) -> Result<(u64, u64, u64, u64), Error> {
    match vfs.resolve(path) {
        Ok(_) => Ok((1, 1, 1, 0)),
        Err(Error::FileNotFound) => Ok((0, 0, 0, 0)),
        Err(e) => Err(e),
    }
}

fn handle_get_file_statistics(vfs: &Vfs, path: &str) -> Result<(u64, u64, u64, u64), Error> {
    match vfs.resolve(path) {
        Ok(entry) => Ok((1, entry.is_directory as u64, entry.data_length as u64, SECTOR_SIZE as u64)),
        Err(Error::FileNotFound) => Ok((0, 0, 0, 0)),
        Err(e) => Err(e),
    }
}

fn handle_read_directory(vfs: &Vfs, path: &str, first_index: u64) -> Result<(u64, u64, u64), Error> {
    let entries = vfs.list_directory(path)?;
    let start = (first_index as usize).min(entries.len());
    let count = proto::DIRECTORY_PAGE_SIZE.min(entries.len() - start);
    let has_more = (start + count < entries.len()) as u64;

    let page = mem::allocate_pages(1)?;
    unsafe { write_directory_page(page, &entries[start..start + count]) };
    Ok((count as u64, has_more, page))
}

/// # Safety
/// `page` must point to one free, writable page.
unsafe fn write_directory_page(page: u64, entries: &[Entry]) {
    let out = core::slice::from_raw_parts_mut(page as *mut proto::DirectoryEntry, proto::DIRECTORY_PAGE_SIZE);
    for (i, entry) in entries.iter().enumerate() {
        let mut name = [0u8; proto::ENTRY_NAME_LEN];
        let bytes = entry.name.as_bytes();
        let len = bytes.len().min(name.len());
        name[..len].copy_from_slice(&bytes[..len]);
        out[i] = proto::DirectoryEntry { name, name_len: len as u8, is_directory: entry.is_directory, size_in_bytes: entry.data_length as u64 };
    }
}

fn handle_read_file(vfs: &Vfs, sender: u64, handle: u64, offset: u64, max_len: u64) -> Result<(u64, u64, u64), Error> {
    let open = vfs.get_open(handle, sender)?;
    let len = max_len.min(mem::PAGE_SIZE) as usize;
    let page = mem::allocate_pages(1)?;
    let buf = unsafe { core::slice::from_raw_parts_mut(page as *mut u8, len) };
    let read = vfs.read_entry(&open.entry, offset, buf)?;
    Ok((read as u64, 0, page))
}

fn handle_close_file(vfs: &mut Vfs, sender: u64, handle: u64) -> Result<(u64, u64, u64, u64), Error> {
    vfs.close(handle, sender)?;
    Ok((0, 0, 0, 0))
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    process::debug_print(&format!("storage_manager panic: {}\n", info));
    process::terminate_this_process()
}
