//! The narrow interface an ISO-9660 reader needs from whatever holds the
//! actual bytes. No concrete disk/optical driver exists in this tree (that
//! would be its own driver process, out of scope here); the one
//! implementation below serves a filesystem image already mapped into
//! this process's address space, handed to it at startup.

use perception_abi::Error;

pub const SECTOR_SIZE: usize = 2048;

pub trait BlockDevice {
    /// Reads exactly one `SECTOR_SIZE`-byte sector numbered `lba` into `buf`.
    fn read_sector(&self, lba: u64, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), Error>;

    /// Total number of sectors backing the device.
    fn sector_count(&self) -> u64;
}

/// A filesystem image already resident in this process's address space
/// (mapped in by [`crate::main`] from the physical range its launcher
/// described), read by direct slice indexing rather than any port-I/O
/// round trip.
pub struct MappedImage {
    bytes: &'static [u8],
}

impl MappedImage {
    /// # Safety
    /// `base` must point to `len` readable bytes for the lifetime of this
    /// process.
    pub unsafe fn new(base: *const u8, len: usize) -> Self {
        Self { bytes: core::slice::from_raw_parts(base, len) }
    }
}

impl BlockDevice for MappedImage {
    fn read_sector(&self, lba: u64, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), Error> {
        let start = lba as usize * SECTOR_SIZE;
        let end = start + SECTOR_SIZE;
        let slice = self.bytes.get(start..end).ok_or(Error::InvalidArgument)?;
        buf.copy_from_slice(slice);
        Ok(())
    }

    fn sector_count(&self) -> u64 {
        (self.bytes.len() / SECTOR_SIZE) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_sector_at_correct_offset() {
        let mut bytes = alloc::vec![0u8; SECTOR_SIZE * 3];
        bytes[SECTOR_SIZE..SECTOR_SIZE + 5].copy_from_slice(b"hello");
        let image = unsafe { MappedImage::new(bytes.as_ptr(), bytes.len()) };

        let mut buf = [0u8; SECTOR_SIZE];
        image.read_sector(1, &mut buf).unwrap();
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(image.sector_count(), 3);
    }

    #[test]
    fn out_of_range_sector_is_an_error() {
        let bytes = alloc::vec![0u8; SECTOR_SIZE];
        let image = unsafe { MappedImage::new(bytes.as_ptr(), bytes.len()) };
        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(image.read_sector(5, &mut buf).unwrap_err(), Error::InvalidArgument);
    }
}
