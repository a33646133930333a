//! The ELF-file cache: `LoadOrIncrementElfFile`/`DecrementElfFile` from
//! `elf_file_cache.h`, reworked as a weak-reference cache so Rust's own
//! `Arc` refcounting does the "decrement to zero removes the entry" part
//! instead of a hand-rolled counter.
//!
//! A file's bytes are read once through the storage manager's
//! memory-mapped-file service (the same path the original loader's
//! `elf_loader.cc` takes) and then held as a private copy, so later lookups
//! of the same path by other modules' dependency walks are pure cache hits
//! with no further IPC.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::{Arc, Weak};

use perception::{shared_memory, storage};
use perception_abi::Error;

use crate::elf::ElfImage;

pub struct ElfCache {
    entries: BTreeMap<String, Weak<ElfImage>>,
}

impl ElfCache {
    pub fn new() -> Self {
        Self { entries: BTreeMap::new() }
    }

    /// Looks up `path` in the cache, upgrading a surviving weak entry, or
    /// loads and parses it fresh and caches the result.
    pub fn load_or_increment(&mut self, path: &str) -> Result<Arc<ElfImage>, Error> {
        if let Some(existing) = self.entries.get(path).and_then(Weak::upgrade) {
            return Ok(existing);
        }

        let image = Arc::new(read_and_parse(path)?);
        self.entries.insert(path.to_string(), Arc::downgrade(&image));
        Ok(image)
    }

    /// Drops entries whose last strong reference is already gone, so the
    /// map doesn't grow unboundedly across a long-running loader.
    pub fn compact(&mut self) {
        self.entries.retain(|_, weak| weak.strong_count() > 0);
    }
}

impl Default for ElfCache {
    fn default() -> Self {
        Self::new()
    }
}

fn read_and_parse(path: &str) -> Result<ElfImage, Error> {
    let stats = storage::get_file_statistics(path)?;
    if !stats.exists {
        return Err(Error::FileNotFound);
    }

    let (handle, segment) = storage::open_memory_mapped_file(path)?;
    let result = (|| {
        let base = shared_memory::join(segment)?;
        let bytes = unsafe { core::slice::from_raw_parts(base as *const u8, stats.size_in_bytes as usize) }.to_vec();
        let _ = shared_memory::leave(segment);
        ElfImage::parse(bytes)
    })();
    let _ = storage::close_file(handle);
    result
}

pub fn canonical_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_name_strips_directories() {
        assert_eq!(canonical_name("/Libraries/libc.so"), "libc.so");
        assert_eq!(canonical_name("libc.so"), "libc.so");
        assert_eq!(canonical_name("/cdrom0/loader"), "loader");
    }

}
