//! Client wrapper for the storage manager service: file lookup, directory
//! listing, permission/statistics queries and memory-mapped files over
//! whatever the storage manager has mounted.
//!
//! Every call here shares one registered message id
//! ([`MESSAGE_ID`]) multiplexed by a method tag in the request's first
//! payload word, the pattern previewed in [`crate::ipc`]'s module doc. A
//! path is too long to fit in the five payload words a [`perception_abi::
//! Message`] carries, so it travels as a page transferred with the
//! request (see [`crate::ipc::send_with_pages`]); the storage manager
//! frees that page once it has copied the path out.

use alloc::vec::Vec;

use perception_abi::{Error, Pid};

use crate::{ipc, mem, services};

pub const SERVICE_NAME: &[u8] = b"perception.StorageManager";
/// Chosen by convention, distinct from every other well-known service's
/// message id in this tree (see [`crate::loader::MESSAGE_ID`]).
pub const MESSAGE_ID: u64 = 100;

pub const METHOD_OPEN_FILE: u64 = 1;
pub const METHOD_OPEN_MEMORY_MAPPED_FILE: u64 = 2;
pub const METHOD_READ_DIRECTORY: u64 = 3;
pub const METHOD_CHECK_PERMISSIONS: u64 = 4;
pub const METHOD_GET_FILE_STATISTICS: u64 = 5;
pub const METHOD_READ_FILE: u64 = 6;
pub const METHOD_CLOSE_FILE: u64 = 7;

/// Directory entries are returned twelve at a time in a transferred page,
/// mirroring the pagination [`perception_abi::ProcessDirEntry`] already
/// uses for `GetProcesses`.
pub const DIRECTORY_PAGE_SIZE: usize = 12;
pub const ENTRY_NAME_LEN: usize = 48;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DirectoryEntry {
    pub name: [u8; ENTRY_NAME_LEN],
    pub name_len: u8,
    pub is_directory: bool,
    pub size_in_bytes: u64,
}

impl DirectoryEntry {
    pub fn name(&self) -> &[u8] {
        &self.name[..self.name_len as usize]
    }
}

pub struct FileStatistics {
    pub exists: bool,
    pub is_directory: bool,
    pub size_in_bytes: u64,
    pub optimal_operation_size: u64,
}

pub struct OpenFile {
    pub handle: u64,
    pub size_in_bytes: u64,
    pub optimal_operation_size: u64,
}

fn storage_manager_pid() -> Result<Pid, Error> {
    services::query(SERVICE_NAME)
}

/// Copies `path` into a fresh page and sends it as a page-transferring
/// request tagged with `method`; `scalar` is the one extra payload word
/// every call besides `ReadDirectory` leaves unused.
fn call_with_path(method: u64, path: &str, scalar: u64) -> Result<(u64, u64, u64, u64), Error> {
    let target = storage_manager_pid()?;
    let page = mem::allocate_pages(1)?;
    let bytes = path.as_bytes();
    let len = bytes.len().min(mem::PAGE_SIZE as usize);
    unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), page as *mut u8, len) };
    ipc::send_with_pages(target, MESSAGE_ID, method, len as u64, scalar, page, 1)?;
    let (_id, _sender, status, r1, r2, r3, r4) = ipc::receive_blocking();
    let err = Error::from_retval(status as i64);
    if !err.is_ok() {
        return Err(err);
    }
    let _ = r4;
    Ok((r1, r2, r3, r4))
}

pub fn open_file(path: &str) -> Result<OpenFile, Error> {
    let (handle, size, optimal, _) = call_with_path(METHOD_OPEN_FILE, path, 0)?;
    Ok(OpenFile { handle, size_in_bytes: size, optimal_operation_size: optimal })
}

pub fn check_permissions(path: &str) -> Result<(bool, bool, bool, bool), Error> {
    let (exists, can_read, can_write, can_execute) = call_with_path(METHOD_CHECK_PERMISSIONS, path, 0)?;
    Ok((exists != 0, can_read != 0, can_write != 0, can_execute != 0))
}

pub fn get_file_statistics(path: &str) -> Result<FileStatistics, Error> {
    let (exists, is_directory, size, optimal) = call_with_path(METHOD_GET_FILE_STATISTICS, path, 0)?;
    Ok(FileStatistics { exists: exists != 0, is_directory: is_directory != 0, size_in_bytes: size, optimal_operation_size: optimal })
}

/// Opens `path` as a memory-mapped file, returning the file handle and the
/// lazily-allocated shared-memory segment backing it. The caller still
/// has to [`crate::shared_memory::join`] the segment itself.
pub fn open_memory_mapped_file(path: &str) -> Result<(u64, u64), Error> {
    let (handle, segment_id, _, _) = call_with_path(METHOD_OPEN_MEMORY_MAPPED_FILE, path, 0)?;
    Ok((handle, segment_id))
}

/// Lists up to [`DIRECTORY_PAGE_SIZE`] entries of `path` starting at
/// `first_index`, returning them alongside whether more entries follow.
pub fn read_directory(path: &str, first_index: u64) -> Result<(Vec<DirectoryEntry>, bool), Error> {
    let target = storage_manager_pid()?;
    let page = mem::allocate_pages(1)?;
    let bytes = path.as_bytes();
    let len = bytes.len().min(mem::PAGE_SIZE as usize);
    unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), page as *mut u8, len) };
    ipc::send_with_pages(target, MESSAGE_ID, METHOD_READ_DIRECTORY, len as u64, first_index, page, 1)?;

    let (_id, _sender, status, count, has_more, reply_page, _page_count) = ipc::receive_blocking();
    let err = Error::from_retval(status as i64);
    if !err.is_ok() {
        return Err(err);
    }

    let count = (count as usize).min(DIRECTORY_PAGE_SIZE);
    let base = reply_page as *const DirectoryEntry;
    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        entries.push(unsafe { *base.add(i) });
    }
    let _ = mem::release_pages(reply_page);
    Ok((entries, has_more != 0))
}

/// Reads up to one page worth of bytes from `handle` starting at `offset`.
/// Larger reads are the caller's responsibility to loop.
pub fn read_file(handle: u64, offset: u64, max_len: u64) -> Result<Vec<u8>, Error> {
    let target = storage_manager_pid()?;
    let max_len = max_len.min(mem::PAGE_SIZE);
    ipc::send(target, MESSAGE_ID, METHOD_READ_FILE, handle, offset, max_len, 0)?;

    let (_id, _sender, status, len, _unused, data_page, _page_count) = ipc::receive_blocking();
    let err = Error::from_retval(status as i64);
    if !err.is_ok() {
        return Err(err);
    }

    let len = (len as usize).min(mem::PAGE_SIZE as usize);
    let mut data = alloc::vec![0u8; len];
    unsafe { core::ptr::copy_nonoverlapping(data_page as *const u8, data.as_mut_ptr(), len) };
    let _ = mem::release_pages(data_page);
    Ok(data)
}

pub fn close_file(handle: u64) -> Result<(), Error> {
    let target = storage_manager_pid()?;
    ipc::send(target, MESSAGE_ID, METHOD_CLOSE_FILE, handle, 0, 0, 0)?;
    let (_id, _sender, status, _, _, _, _) = ipc::receive_blocking();
    let err = Error::from_retval(status as i64);
    if err.is_ok() {
        Ok(())
    } else {
        Err(err)
    }
}
