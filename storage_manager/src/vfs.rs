//! Mount table and path resolution, plus the per-process open-file-handle
//! table that makes closing a process close its files too.
//!
//! Path resolution strips the leading slash and splits on the first
//! remaining slash to get a mount name and an inner path; `/Libraries` and
//! `/Applications` are special-cased to alias the first filesystem ever
//! mounted, since this tree never mounts more than the one boot image.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use perception_abi::{Error, Pid};

use crate::block_device::MappedImage;
use crate::iso9660::{Entry, Iso9660};

const ALIAS_PREFIXES: [&str; 2] = ["Libraries", "Applications"];

pub struct Mount {
    pub name: String,
    pub fs: Iso9660<MappedImage>,
}

pub struct OpenFile {
    pub opener: Pid,
    pub entry: Entry,
}

pub struct Vfs {
    mounts: Vec<Mount>,
    /// Name of the first mount, used to resolve `/Libraries` and
    /// `/Applications`. `None` until the first [`Vfs::mount`] call.
    first_mount: Option<String>,
    next_handle: u64,
    handles: BTreeMap<u64, OpenFile>,
}

impl Vfs {
    pub const fn new() -> Self {
        Self { mounts: Vec::new(), first_mount: None, next_handle: 1, handles: BTreeMap::new() }
    }

    pub fn mount(&mut self, name: &str, fs: Iso9660<MappedImage>) {
        if self.first_mount.is_none() {
            self.first_mount = Some(name.to_string());
        }
        self.mounts.push(Mount { name: name.to_string(), fs });
    }

    fn find_mount(&self, name: &str) -> Option<&Mount> {
        self.mounts.iter().find(|m| m.name.eq_ignore_ascii_case(name))
    }

    /// The first-mounted filesystem, the only one a lazy-page-miss handler
    /// needs to read from in a tree that never mounts more than one device.
    pub fn first_mount_fs(&self) -> Option<&Iso9660<MappedImage>> {
        self.mounts.first().map(|m| &m.fs)
    }

    /// Splits `path` into `(mount name, remaining components)`, resolving
    /// the `/Libraries`/`/Applications` aliases. Returns
    /// `Error::Unimplemented` for an alias with nothing mounted yet (there
    /// is no later mount event in this tree to wake a blocked caller for,
    /// so the "block until mounted" behaviour degenerates to an immediate
    /// failure here).
    fn resolve_mount_and_path<'a>(&self, path: &'a str) -> Result<(&Mount, Vec<&'a str>), Error> {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        let mut parts = trimmed.split('/').filter(|s| !s.is_empty());
        let first = parts.next().ok_or(Error::InvalidArgument)?;
        let rest: Vec<&str> = parts.collect();

        let mount_name = if ALIAS_PREFIXES.iter().any(|p| p.eq_ignore_ascii_case(first)) {
            self.first_mount.as_deref().ok_or(Error::Unimplemented)?
        } else {
            first
        };

        let mount = self.find_mount(mount_name).ok_or(Error::FileNotFound)?;
        Ok((mount, rest))
    }

    pub fn resolve(&self, path: &str) -> Result<Entry, Error> {
        let (mount, rest) = self.resolve_mount_and_path(path)?;
        mount.fs.resolve(&rest)
    }

    pub fn list_directory(&self, path: &str) -> Result<Vec<Entry>, Error> {
        let entry = self.resolve(path)?;
        if !entry.is_directory {
            return Err(Error::InvalidArgument);
        }
        let (mount, _) = self.resolve_mount_and_path(path)?;
        mount.fs.list_directory(crate::iso9660::DirectoryRef { extent_lba: entry.extent_lba, data_length: entry.data_length })
    }

    pub fn read(&self, path: &str, offset: u64, buf: &mut [u8]) -> Result<usize, Error> {
        let entry = self.resolve(path)?;
        let (mount, _) = self.resolve_mount_and_path(path)?;
        mount.fs.read(&entry, offset, buf)
    }

    /// Reads directly from an already-resolved [`Entry`] (an open file
    /// handle's), via the first mounted filesystem - the only one there is
    /// in a tree that never mounts more than one device.
    pub fn read_entry(&self, entry: &Entry, offset: u64, buf: &mut [u8]) -> Result<usize, Error> {
        let fs = self.first_mount_fs().ok_or(Error::FileNotFound)?;
        fs.read(entry, offset, buf)
    }

    pub fn open(&mut self, opener: Pid, path: &str) -> Result<(u64, Entry), Error> {
        let entry = self.resolve(path)?;
        let handle = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(handle, OpenFile { opener, entry: entry.clone() });
        Ok((handle, entry))
    }

    pub fn get_open(&self, handle: u64, caller: Pid) -> Result<&OpenFile, Error> {
        let open = self.handles.get(&handle).ok_or(Error::InvalidArgument)?;
        if open.opener != caller {
            return Err(Error::NotAllowed);
        }
        Ok(open)
    }

    pub fn close(&mut self, handle: u64, caller: Pid) -> Result<(), Error> {
        let open = self.handles.get(&handle).ok_or(Error::InvalidArgument)?;
        if open.opener != caller {
            return Err(Error::NotAllowed);
        }
        self.handles.remove(&handle);
        Ok(())
    }

    /// Drops every handle `opener` held, called when its death notification
    /// arrives.
    pub fn close_all_for(&mut self, opener: Pid) {
        self.handles.retain(|_, open| open.opener != opener);
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_device::SECTOR_SIZE;

    const PVD_SECTOR: usize = 16;
    const ROOT_RECORD_OFFSET: usize = 156;
    const ROOT_LBA: u32 = 20;
    const FILE_LBA: u32 = 21;
    const FILE_CONTENTS: &[u8] = b"contents";

    fn write_record(bytes: &mut [u8], offset: usize, extent_lba: u32, data_length: u32, is_directory: bool, ident: &[u8]) {
        bytes[offset] = (33 + ident.len()) as u8;
        bytes[offset + 2..offset + 6].copy_from_slice(&extent_lba.to_le_bytes());
        bytes[offset + 10..offset + 14].copy_from_slice(&data_length.to_le_bytes());
        bytes[offset + 25] = if is_directory { 0x02 } else { 0x00 };
        bytes[offset + 32] = ident.len() as u8;
        bytes[offset + 33..offset + 33 + ident.len()].copy_from_slice(ident);
    }

    fn build_mounted_vfs(mount_name: &str) -> Vfs {
        let mut bytes = alloc::vec![0u8; SECTOR_SIZE * 22];

        let pvd = PVD_SECTOR * SECTOR_SIZE;
        bytes[pvd] = 1;
        bytes[pvd + 1..pvd + 6].copy_from_slice(b"CD001");
        write_record(&mut bytes, pvd + ROOT_RECORD_OFFSET, ROOT_LBA, SECTOR_SIZE as u32, true, &[0u8]);

        let root = ROOT_LBA as usize * SECTOR_SIZE;
        write_record(&mut bytes, root, ROOT_LBA, SECTOR_SIZE as u32, true, &[0u8]);
        write_record(&mut bytes, root + 34, ROOT_LBA, SECTOR_SIZE as u32, true, &[1u8]);
        write_record(&mut bytes, root + 68, FILE_LBA, FILE_CONTENTS.len() as u32, false, b"DATA.TXT;1");

        let file = FILE_LBA as usize * SECTOR_SIZE;
        bytes[file..file + FILE_CONTENTS.len()].copy_from_slice(FILE_CONTENTS);

        let image = unsafe { MappedImage::new(bytes.as_ptr(), bytes.len()) };
        core::mem::forget(bytes);
        let fs = Iso9660::mount(image).unwrap();

        let mut vfs = Vfs::new();
        vfs.mount(mount_name, fs);
        vfs
    }

    #[test]
    fn resolves_through_the_mount_name() {
        let vfs = build_mounted_vfs("cdrom0");
        let entry = vfs.resolve("/cdrom0/data.txt").unwrap();
        assert_eq!(entry.data_length as usize, FILE_CONTENTS.len());
    }

    #[test]
    fn libraries_and_applications_alias_the_first_mount() {
        let vfs = build_mounted_vfs("cdrom0");
        assert!(vfs.resolve("/Libraries/data.txt").is_ok());
        assert!(vfs.resolve("/Applications/data.txt").is_ok());
    }

    #[test]
    fn unknown_mount_name_is_file_not_found() {
        let vfs = build_mounted_vfs("cdrom0");
        assert_eq!(vfs.resolve("/nope/data.txt").unwrap_err(), Error::FileNotFound);
    }

    #[test]
    fn open_close_tracks_ownership_and_close_all_for_clears_by_owner() {
        let mut vfs = build_mounted_vfs("cdrom0");
        let (handle, _) = vfs.open(1, "/cdrom0/data.txt").unwrap();
        assert!(vfs.get_open(handle, 1).is_ok());
        assert_eq!(vfs.get_open(handle, 2).unwrap_err(), Error::NotAllowed);

        vfs.close_all_for(1);
        assert_eq!(vfs.get_open(handle, 1).unwrap_err(), Error::InvalidArgument);
    }

    #[test]
    fn close_by_non_opener_is_rejected() {
        let mut vfs = build_mounted_vfs("cdrom0");
        let (handle, _) = vfs.open(1, "/cdrom0/data.txt").unwrap();
        assert_eq!(vfs.close(handle, 2).unwrap_err(), Error::NotAllowed);
        vfs.close(handle, 1).unwrap();
        assert_eq!(vfs.get_open(handle, 1).unwrap_err(), Error::InvalidArgument);
    }
}
