//! The ELF loader: resolves an executable's dynamic dependencies, assembles
//! a new process's address space page by page, fixes up its relocations,
//! and starts it running.
//!
//! Started by `storage_manager::bootstrap` as the first child off the boot
//! ISO; every process after it (including reloads of the same program)
//! comes up through [`perception::loader::launch_application`] talking to
//! this service.

#![no_std]
#![no_main]
#![feature(alloc_error_handler)]

extern crate alloc;

mod cache;
mod elf;
mod load;

use alloc::format;

use perception::abi::Error;
use perception::{ipc, mem, process, services};
use perception::loader as proto;

use cache::ElfCache;

#[no_mangle]
pub extern "C" fn _start() -> ! {
    perception::heap::init();

    services::register(proto::SERVICE_NAME, proto::MESSAGE_ID).expect("loader: failed to register service");

    let mut cache = ElfCache::new();

    loop {
        let (id, sender, a1, a2, _a3, a4, _a5) = ipc::receive_blocking();

        if id == 0 {
            // Kernel-origin death notification. Nothing here is keyed off a
            // client's pid (the cache is keyed by path, not by requester),
            // so there is nothing to clean up.
            continue;
        }

        if id != proto::MESSAGE_ID {
            continue;
        }

        match a1 {
            proto::METHOD_LAUNCH_APPLICATION => {
                reply(sender, with_path(a2, a4, |path| load::launch_application(&mut cache, path)))
            }
            _ => reply(sender, Err(Error::Unimplemented)),
        }
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

fn reply(sender: u64, result: Result<perception_abi::Pid, Error>) {
    match result {
        Ok(pid) => {
            let _ = ipc::send(sender, 0, Error::Ok.to_retval() as u64, pid, 0, 0, 0);
        }
        Err(e) => {
            let _ = ipc::send(sender, 0, e.to_retval() as u64, 0, 0, 0, 0);
        }
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    process::debug_print(&format!("loader panic: {}\n", info));
    process::terminate_this_process()
}
