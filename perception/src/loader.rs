//! Client wrapper for the ELF loader service: launch a named executable
//! and get back its new process id.

use perception_abi::{Error, Pid};

use crate::{ipc, mem, services};

pub const SERVICE_NAME: &[u8] = b"perception.devices.Loader";
pub const MESSAGE_ID: u64 = 200;

pub const METHOD_LAUNCH_APPLICATION: u64 = 1;

/// Asks the loader to start `name` (an executable path as the storage
/// manager understands it), returning the new process's id.
pub fn launch_application(name: &str) -> Result<Pid, Error> {
    let target = services::query(SERVICE_NAME)?;
    let page = mem::allocate_pages(1)?;
    let bytes = name.as_bytes();
    let len = bytes.len().min(mem::PAGE_SIZE as usize);
    unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), page as *mut u8, len) };
    ipc::send_with_pages(target, MESSAGE_ID, METHOD_LAUNCH_APPLICATION, len as u64, 0, page, 1)?;

    let (_id, _sender, status, pid, _, _, _) = ipc::receive_blocking();
    let err = Error::from_retval(status as i64);
    if err.is_ok() {
        Ok(pid)
    } else {
        Err(err)
    }
}
