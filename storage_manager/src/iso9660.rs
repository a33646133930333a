//! A read-only ISO-9660 reader: primary volume descriptor, directory
//! record scanning, and the Rock Ridge `NM` extension for names longer
//! than the base standard's 8.3-ish limit.
//!
//! Sector size is fixed at 2048 bytes, as is true of every ISO-9660 image
//! this kernel boots from. Directory records are scanned linearly - there
//! is no secondary index - matching the primitive reference algorithm the
//! format itself describes.

use alloc::string::String;
use alloc::vec::Vec;

use perception_abi::Error;

use crate::block_device::{BlockDevice, SECTOR_SIZE};

const PRIMARY_VOLUME_DESCRIPTOR_SECTOR: u64 = 16;
const ROOT_DIRECTORY_RECORD_OFFSET: usize = 156;

#[derive(Debug, Clone, Copy)]
pub struct DirectoryRef {
    pub extent_lba: u32,
    pub data_length: u32,
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub name: String,
    pub is_directory: bool,
    pub extent_lba: u32,
    pub data_length: u32,
}

pub struct Iso9660<D: BlockDevice> {
    device: D,
    pub root: DirectoryRef,
}

impl<D: BlockDevice> Iso9660<D> {
    /// Reads the primary volume descriptor and pulls the root directory's
    /// own directory record out of it, per the standard's fixed layout.
    pub fn mount(device: D) -> Result<Self, Error> {
        let mut sector = [0u8; SECTOR_SIZE];
        device.read_sector(PRIMARY_VOLUME_DESCRIPTOR_SECTOR, &mut sector)?;

        if sector[0] != 1 || &sector[1..6] != b"CD001" {
            return Err(Error::InvalidArgument);
        }

        let root = parse_directory_record(&sector[ROOT_DIRECTORY_RECORD_OFFSET..]).ok_or(Error::InvalidArgument)?;
        Ok(Self { device, root: DirectoryRef { extent_lba: root.extent_lba, data_length: root.data_length } })
    }

    /// Linearly scans every sector of `dir`'s extent, collecting one
    /// [`Entry`] per directory record (skipping the `.`/`..` self and
    /// parent records every ISO-9660 directory starts with).
    pub fn list_directory(&self, dir: DirectoryRef) -> Result<Vec<Entry>, Error> {
        let mut entries = Vec::new();
        let sector_count = (dir.data_length as usize).div_ceil(SECTOR_SIZE);
        let mut sector = [0u8; SECTOR_SIZE];

        for i in 0..sector_count {
            self.device.read_sector(dir.extent_lba as u64 + i as u64, &mut sector)?;
            let mut offset = 0usize;
            while offset < SECTOR_SIZE {
                let len = sector[offset] as usize;
                if len == 0 {
                    break;
                }
                if let Some(record) = parse_directory_record(&sector[offset..offset + len.min(SECTOR_SIZE - offset)]) {
                    if record.name != "\u{0}" && record.name != "\u{1}" {
                        entries.push(record);
                    }
                }
                offset += len;
            }
        }
        Ok(entries)
    }

    /// Resolves `path` (already split into components by the caller's
    /// VFS layer) starting from the root directory.
    pub fn resolve(&self, components: &[&str]) -> Result<Entry, Error> {
        let mut dir = self.root;
        let mut current = Entry { name: String::new(), is_directory: true, extent_lba: dir.extent_lba, data_length: dir.data_length };

        for (i, component) in components.iter().enumerate() {
            let entries = self.list_directory(dir)?;
            let found = entries.into_iter().find(|e| e.name.eq_ignore_ascii_case(component)).ok_or(Error::FileNotFound)?;
            let is_last = i == components.len() - 1;
            if !is_last && !found.is_directory {
                return Err(Error::FileNotFound);
            }
            dir = DirectoryRef { extent_lba: found.extent_lba, data_length: found.data_length };
            current = found;
        }
        Ok(current)
    }

    /// Reads `len` bytes of `entry`'s extent starting at byte `offset`,
    /// rounded down internally to whole sectors as callers are expected to
    /// align their own requests to [`SECTOR_SIZE`] (the MMF server's
    /// `optimal_operation_size`).
    pub fn read(&self, entry: &Entry, offset: u64, buf: &mut [u8]) -> Result<usize, Error> {
        if offset >= entry.data_length as u64 {
            return Ok(0);
        }
        let remaining = (entry.data_length as u64 - offset) as usize;
        let to_read = buf.len().min(remaining);

        let mut sector = [0u8; SECTOR_SIZE];
        let mut read = 0;
        while read < to_read {
            let abs = offset as usize + read;
            let lba = entry.extent_lba as u64 + (abs / SECTOR_SIZE) as u64;
            let sector_off = abs % SECTOR_SIZE;
            self.device.read_sector(lba, &mut sector)?;
            let n = (SECTOR_SIZE - sector_off).min(to_read - read);
            buf[read..read + n].copy_from_slice(&sector[sector_off..sector_off + n]);
            read += n;
        }
        Ok(read)
    }
}

/// Parses one directory record starting at `bytes[0]`. Both-endian
/// (little-then-big) 32-bit fields are read from their little-endian half
/// only; System Use fields past the fixed 33-byte header (plus the
/// identifier and its padding byte) are scanned for a Rock Ridge `NM`
/// entry, which overrides the plain ISO-9660 identifier when present.
fn parse_directory_record(bytes: &[u8]) -> Option<Entry> {
    let len = *bytes.first()? as usize;
    if len == 0 || len > bytes.len() {
        return None;
    }

    let extent_lba = u32::from_le_bytes(bytes[2..6].try_into().ok()?);
    let data_length = u32::from_le_bytes(bytes[10..14].try_into().ok()?);
    let file_flags = *bytes.get(25)?;
    let is_directory = file_flags & 0x02 != 0;
    let id_len = *bytes.get(32)? as usize;
    let id_start = 33;
    let id_end = id_start + id_len;
    if id_end > len {
        return None;
    }
    let raw_name = &bytes[id_start..id_end];

    let plain_name = if raw_name == [0u8] {
        String::from("\u{0}")
    } else if raw_name == [1u8] {
        String::from("\u{1}")
    } else {
        strip_version(core::str::from_utf8(raw_name).unwrap_or(""))
    };

    let su_start = id_end + if id_len % 2 == 0 { 1 } else { 0 };
    let name = find_rock_ridge_name(&bytes[su_start.min(len)..len]).unwrap_or(plain_name);

    Some(Entry { name, is_directory, extent_lba, data_length })
}

/// Strips a trailing `;<revision>` and the file-version-number separator
/// ISO-9660 appends to every plain identifier.
fn strip_version(name: &str) -> String {
    match name.find(';') {
        Some(pos) => String::from(&name[..pos]),
        None => String::from(name),
    }
}

/// Walks the System Use Sharing Protocol entries looking for Rock Ridge's
/// `NM` (alternate name) entry: signature `b"NM"`, length byte, version
/// byte, flags byte, then the name bytes.
fn find_rock_ridge_name(system_use: &[u8]) -> Option<String> {
    let mut offset = 0;
    let mut name = String::new();
    while offset + 4 <= system_use.len() {
        let signature = &system_use[offset..offset + 2];
        let entry_len = system_use[offset + 2] as usize;
        if entry_len < 4 || offset + entry_len > system_use.len() {
            break;
        }
        if signature == b"NM" {
            let flags = system_use[offset + 4];
            let text = &system_use[offset + 5..offset + entry_len];
            if let Ok(s) = core::str::from_utf8(text) {
                name.push_str(s);
            }
            // Bit 0 of the flags byte ("CONTINUE") means another NM entry
            // follows with the rest of the name; keep scanning instead of
            // returning early.
            if flags & 0x01 == 0 {
                return Some(name);
            }
        }
        offset += entry_len;
    }
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_version_removes_revision_suffix() {
        assert_eq!(strip_version("HELLO.TXT;1"), "HELLO.TXT");
        assert_eq!(strip_version("NOVERSION"), "NOVERSION");
    }

    #[test]
    fn rock_ridge_name_overrides_plain_identifier() {
        let mut su = Vec::new();
        su.extend_from_slice(b"NM");
        su.push(4 + 9); // entry length
        su.push(1); // version
        su.push(0); // flags, no CONTINUE bit
        su.extend_from_slice(b"long-name");
        assert_eq!(find_rock_ridge_name(&su).as_deref(), Some("long-name"));
    }

    #[test]
    fn rock_ridge_name_joins_continuation_entries() {
        let mut su = Vec::new();
        su.extend_from_slice(b"NM");
        su.push(4 + 4);
        su.push(1);
        su.push(0x01); // CONTINUE bit set
        su.extend_from_slice(b"part");
        su.extend_from_slice(b"NM");
        su.push(4 + 4);
        su.push(1);
        su.push(0x00);
        su.extend_from_slice(b"rest");
        assert_eq!(find_rock_ridge_name(&su).as_deref(), Some("partrest"));
    }

    fn write_directory_record(sector: &mut [u8], offset: usize, extent_lba: u32, data_length: u32, is_directory: bool, ident: &[u8]) -> usize {
        let pad = if ident.len() % 2 == 0 { 1 } else { 0 };
        let len = 33 + ident.len() + pad;
        sector[offset] = len as u8;
        sector[offset + 2..offset + 6].copy_from_slice(&extent_lba.to_le_bytes());
        sector[offset + 10..offset + 14].copy_from_slice(&data_length.to_le_bytes());
        sector[offset + 25] = if is_directory { 0x02 } else { 0x00 };
        sector[offset + 32] = ident.len() as u8;
        sector[offset + 33..offset + 33 + ident.len()].copy_from_slice(ident);
        len
    }

    struct FakeDevice {
        sectors: BTreeMap<u64, [u8; SECTOR_SIZE]>,
    }

    impl FakeDevice {
        fn new() -> Self {
            Self { sectors: BTreeMap::new() }
        }
        fn put(&mut self, lba: u64, sector: [u8; SECTOR_SIZE]) {
            self.sectors.insert(lba, sector);
        }
    }

    impl BlockDevice for FakeDevice {
        fn read_sector(&self, lba: u64, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), Error> {
            *buf = *self.sectors.get(&lba).ok_or(Error::InvalidArgument)?;
            Ok(())
        }
        fn sector_count(&self) -> u64 {
            self.sectors.len() as u64
        }
    }

    use alloc::collections::BTreeMap;

    fn build_test_image() -> FakeDevice {
        const ROOT_LBA: u32 = 20;
        const FILE_LBA: u32 = 21;
        const ROOT_SIZE: u32 = SECTOR_SIZE as u32;
        const FILE_CONTENTS: &[u8] = b"Hello, world!";

        let mut device = FakeDevice::new();

        let mut pvd = [0u8; SECTOR_SIZE];
        pvd[0] = 1;
        pvd[1..6].copy_from_slice(b"CD001");
        write_directory_record(&mut pvd, ROOT_DIRECTORY_RECORD_OFFSET, ROOT_LBA, ROOT_SIZE, true, &[0u8]);
        device.put(PRIMARY_VOLUME_DESCRIPTOR_SECTOR, pvd);

        let mut root_dir = [0u8; SECTOR_SIZE];
        let mut offset = 0;
        offset += write_directory_record(&mut root_dir, offset, ROOT_LBA, ROOT_SIZE, true, &[0u8]);
        offset += write_directory_record(&mut root_dir, offset, ROOT_LBA, ROOT_SIZE, true, &[1u8]);
        write_directory_record(&mut root_dir, offset, FILE_LBA, FILE_CONTENTS.len() as u32, false, b"HELLO.TXT;1");
        device.put(ROOT_LBA as u64, root_dir);

        let mut file_sector = [0u8; SECTOR_SIZE];
        file_sector[..FILE_CONTENTS.len()].copy_from_slice(FILE_CONTENTS);
        device.put(FILE_LBA as u64, file_sector);

        device
    }

    #[test]
    fn mount_reads_root_directory_record() {
        let fs = Iso9660::mount(build_test_image()).unwrap();
        assert_eq!(fs.root.extent_lba, 20);
    }

    #[test]
    fn mount_rejects_non_iso9660_image() {
        let mut device = FakeDevice::new();
        device.put(PRIMARY_VOLUME_DESCRIPTOR_SECTOR, [0u8; SECTOR_SIZE]);
        assert_eq!(Iso9660::mount(device).unwrap_err(), Error::InvalidArgument);
    }

    #[test]
    fn list_directory_skips_dot_and_dotdot_and_strips_version() {
        let fs = Iso9660::mount(build_test_image()).unwrap();
        let entries = fs.list_directory(fs.root).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "HELLO.TXT");
        assert!(!entries[0].is_directory);
    }

    #[test]
    fn resolve_finds_file_case_insensitively() {
        let fs = Iso9660::mount(build_test_image()).unwrap();
        let entry = fs.resolve(&["hello.txt"]).unwrap();
        assert_eq!(entry.data_length as usize, b"Hello, world!".len());
    }

    #[test]
    fn resolve_missing_file_fails() {
        let fs = Iso9660::mount(build_test_image()).unwrap();
        assert_eq!(fs.resolve(&["missing.txt"]).unwrap_err(), Error::FileNotFound);
    }

    #[test]
    fn read_returns_file_bytes() {
        let fs = Iso9660::mount(build_test_image()).unwrap();
        let entry = fs.resolve(&["hello.txt"]).unwrap();
        let mut buf = [0u8; 13];
        let n = fs.read(&entry, 0, &mut buf).unwrap();
        assert_eq!(n, 13);
        assert_eq!(&buf, b"Hello, world!");
    }

    #[test]
    fn read_past_end_of_file_returns_zero() {
        let fs = Iso9660::mount(build_test_image()).unwrap();
        let entry = fs.resolve(&["hello.txt"]).unwrap();
        let mut buf = [0u8; 4];
        let n = fs.read(&entry, 100, &mut buf).unwrap();
        assert_eq!(n, 0);
    }
}
