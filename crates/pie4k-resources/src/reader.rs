//! Resource reader facade: the one type downstream code talks to (§4.G).

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use hashbrown::HashMap;
use lru::LruCache;
use pie4k_shared::error::{Pie4kError, Result};
use tracing::{debug, error, warn};

use crate::archive::ArchiveMember;
use crate::keyindex::KeyIndex;
use crate::locator::Locator;
use crate::types::{NormalizedName, ResourceInfo};

const ARCHIVE_CACHE_CAPACITY: usize = 16;

/// Parses a key/index file once, then serves resource reads and sizes by
/// lazily opening and caching member archives.
pub struct ResourceReader {
    index: KeyIndex,
    game_path: PathBuf,
    cache_dir: PathBuf,
    retain_cache: bool,
    cache: Mutex<LruCache<u32, ArchiveMember>>,
}

impl ResourceReader {
    pub fn open(
        key_path: &Path,
        game_path: &Path,
        game_type: &str,
        known_bad: &[String],
        retain_cache: bool,
    ) -> Result<Self> {
        let index = KeyIndex::load(key_path, game_path, known_bad)?;
        let cache_dir = std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".pie4kcache")
            .join(game_type);

        debug!(
            archives = index.archive_count(),
            resources = index.resources.len(),
            "parsed key index"
        );

        Ok(ResourceReader {
            index,
            game_path: game_path.to_path_buf(),
            cache_dir,
            retain_cache,
            cache: Mutex::new(LruCache::new(
                std::num::NonZeroUsize::new(ARCHIVE_CACHE_CAPACITY).unwrap(),
            )),
        })
    }

    /// Resolve `(name, type)` to a [`ResourceInfo`], without reading any
    /// archive bytes.
    pub fn resource_info(&self, name: &str, type_code: u16) -> Result<ResourceInfo> {
        let key = (NormalizedName::from_raw(name.as_bytes()), type_code);
        let locator = *self.index.resources.get(&key).ok_or_else(|| Pie4kError::ResourceNotFound {
            name: name.to_string(),
            type_code,
        })?;

        let archive_index = locator.archive_index();
        let (offset, size) = Self::map_io_to_not_found(self.locate(locator, type_code), name, type_code)?;
        Ok(ResourceInfo {
            name: key.0,
            type_code,
            archive_index,
            locator,
            offset,
            size,
        })
    }

    /// Read resource bytes by `(name, type)`.
    pub fn read(&self, name: &str, type_code: u16) -> Result<Vec<u8>> {
        let key = (NormalizedName::from_raw(name.as_bytes()), type_code);
        let locator = *self.index.resources.get(&key).ok_or_else(|| Pie4kError::ResourceNotFound {
            name: name.to_string(),
            type_code,
        })?;
        Self::map_io_to_not_found(self.read_bytes(locator, type_code), name, type_code)
    }

    /// Read resource bytes directly by locator (used once the caller
    /// already has a [`ResourceInfo`] in hand).
    pub fn read_locator(&self, locator: Locator, type_code: u16) -> Result<Vec<u8>> {
        let name = format!("locator:{:#010x}", locator.raw);
        Self::map_io_to_not_found(self.read_bytes(locator, type_code), &name, type_code)
    }

    fn read_bytes(&self, locator: Locator, type_code: u16) -> Result<Vec<u8>> {
        let is_tileset = type_code == TILESET_TYPE_CODE;
        self.with_archive(locator.archive_index(), |archive| {
            if is_tileset {
                archive.read_tileset(locator)
            } else {
                archive.read_file(locator)
            }
        })
    }

    /// Seek/read failures on archives or cache files are mapped to
    /// `ResourceNotFound` for callers, with the original error logged at
    /// `error` first (§7 "IOError ... Mapped to ResourceNotFound for
    /// callers; logged at error"). `IndexIntegrity` is left as-is — it is
    /// a distinct, fatal-for-the-archive error class under §7, not an
    /// I/O failure.
    fn map_io_to_not_found<T>(result: Result<T>, name: &str, type_code: u16) -> Result<T> {
        result.map_err(|e| match e {
            Pie4kError::Io { path, source } => {
                error!(name, type_code = format!("{type_code:#06x}"), path = %path.display(), error = %source, "archive I/O failure, reporting resource not found");
                Pie4kError::ResourceNotFound { name: name.to_string(), type_code }
            }
            other => other,
        })
    }

    fn size_of(&self, locator: Locator, type_code: u16) -> Result<u32> {
        self.locate(locator, type_code).map(|(_offset, size)| size)
    }

    /// Resolve a locator to its in-archive `(offset, size)` without
    /// reading the payload.
    fn locate(&self, locator: Locator, type_code: u16) -> Result<(u32, u32)> {
        let is_tileset = type_code == TILESET_TYPE_CODE;
        self.with_archive(locator.archive_index(), |archive| {
            if is_tileset {
                let idx = locator.tileset_index();
                archive
                    .tile_entries
                    .iter()
                    .find(|e| e.locator.tileset_index() == idx)
                    .map(|e| (e.offset, e.num_tiles * e.tile_size))
                    .ok_or_else(|| Pie4kError::IndexIntegrity {
                        path: PathBuf::new(),
                        reason: "tileset locator not found while sizing".to_string(),
                    })
            } else {
                let idx = locator.file_index();
                archive
                    .file_entries
                    .iter()
                    .find(|e| e.locator.file_index() == idx)
                    .map(|e| (e.offset, e.size))
                    .ok_or_else(|| Pie4kError::IndexIntegrity {
                        path: PathBuf::new(),
                        reason: "locator not found while sizing".to_string(),
                    })
            }
        })
    }

    /// Build a flat `(name, type) → size` view across every archive,
    /// opening each one exactly once. Callers drive this through the
    /// scheduler as a high-priority batch (§4.G "Global size index").
    pub fn build_global_size_index(&self) -> HashMap<(NormalizedName, u16), u32> {
        let mut out = HashMap::with_capacity(self.index.resources.len());
        for (key, locator) in self.index.resources.iter() {
            match self.size_of(*locator, key.1) {
                Ok(size) => {
                    out.insert(key.clone(), size);
                }
                Err(e) => warn!(name = %key.0 .0, "failed to size resource: {e}"),
            }
        }
        out
    }

    fn with_archive<T>(&self, archive_index: u32, f: impl FnOnce(&ArchiveMember) -> Result<T>) -> Result<T> {
        let entry = self
            .index
            .archives
            .get(archive_index as usize)
            .ok_or_else(|| Pie4kError::IndexIntegrity {
                path: PathBuf::new(),
                reason: format!("archive index {archive_index} out of range"),
            })?;
        let resolved = entry.resolved_path.clone().ok_or_else(|| Pie4kError::IndexIntegrity {
            path: PathBuf::from(&entry.path),
            reason: "archive could not be resolved on disk".to_string(),
        })?;

        let mut cache = self.cache.lock().expect("archive cache mutex poisoned");
        if !cache.contains(&archive_index) {
            let member = ArchiveMember::open(&resolved, &self.cache_dir, self.retain_cache)?;
            cache.put(archive_index, member);
        }
        let member = cache.get(&archive_index).expect("just inserted");
        f(member)
    }

    /// All resource names present for `type_code`, for batch drivers that
    /// need to walk every resource of one type rather than look one up by
    /// name.
    pub fn names_for_type(&self, type_code: u16) -> Vec<String> {
        self.index
            .resources
            .keys()
            .filter(|(_, t)| *t == type_code)
            .map(|(name, _)| name.0.clone())
            .collect()
    }

    pub fn game_path(&self) -> &Path {
        &self.game_path
    }

    /// Remove the decompression cache directory unless retention is
    /// enabled (§4.G "Cache hygiene").
    pub fn cleanup(&self) {
        if self.retain_cache {
            return;
        }
        if self.cache_dir.is_dir() {
            let _ = std::fs::remove_dir_all(&self.cache_dir);
        }
    }
}

/// BioWare's TIS (tileset) resource type code.
const TILESET_TYPE_CODE: u16 = 0x3eb;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_key_and_archive(dir: &Path) {
        let data_dir = dir.join("data");
        std::fs::create_dir_all(&data_dir).unwrap();

        let payload = b"resource-bytes";
        let file_offset = 20u32 + 16; // header + one file entry
        let mut archive = Vec::new();
        archive.extend_from_slice(b"BIFF");
        archive.extend_from_slice(b"V1 ");
        archive.extend_from_slice(&1u32.to_le_bytes());
        archive.extend_from_slice(&0u32.to_le_bytes());
        archive.extend_from_slice(&20u32.to_le_bytes());
        archive.extend_from_slice(&5u32.to_le_bytes()); // locator
        archive.extend_from_slice(&file_offset.to_le_bytes());
        archive.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        archive.extend_from_slice(&0x3eeu16.to_le_bytes());
        archive.extend_from_slice(&0u16.to_le_bytes());
        archive.extend_from_slice(payload);
        std::fs::write(data_dir.join("data1.bif"), &archive).unwrap();

        let archive_name = b"data1.bif";
        let header_len = 24u32;
        let archive_table_offset = header_len;
        let filename_offset = archive_table_offset + 12;
        let resource_table_offset = filename_offset + archive_name.len() as u32;

        let mut key = Vec::new();
        key.extend_from_slice(b"KEY ");
        key.extend_from_slice(b"V1  ");
        key.extend_from_slice(&1u32.to_le_bytes());
        key.extend_from_slice(&1u32.to_le_bytes());
        key.extend_from_slice(&archive_table_offset.to_le_bytes());
        key.extend_from_slice(&resource_table_offset.to_le_bytes());
        key.extend_from_slice(&4096u32.to_le_bytes());
        key.extend_from_slice(&filename_offset.to_le_bytes());
        key.extend_from_slice(&(archive_name.len() as u16).to_le_bytes());
        key.extend_from_slice(&0u16.to_le_bytes());
        key.extend_from_slice(archive_name);
        key.extend_from_slice(b"SPELL01\0");
        key.extend_from_slice(&0x3eeu16.to_le_bytes());
        key.extend_from_slice(&5u32.to_le_bytes());

        let mut f = std::fs::File::create(dir.join("chitin.key")).unwrap();
        f.write_all(&key).unwrap();
    }

    #[test]
    fn reads_resource_bytes_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        write_key_and_archive(dir.path());

        let reader = ResourceReader::open(
            &dir.path().join("chitin.key"),
            dir.path(),
            "bg1",
            &[],
            false,
        )
        .unwrap();

        let bytes = reader.read("SPELL01", 0x3ee).unwrap();
        assert_eq!(bytes, b"resource-bytes");

        let info = reader.resource_info("SPELL01", 0x3ee).unwrap();
        assert_eq!(info.size, 14);
    }

    #[test]
    fn archive_io_failure_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        write_key_and_archive(dir.path());
        let reader = ResourceReader::open(
            &dir.path().join("chitin.key"),
            dir.path(),
            "bg1",
            &[],
            false,
        )
        .unwrap();

        // Resolved, but the bytes behind it vanish before the first read —
        // a genuine Io failure, not a missing-entry IndexIntegrity one.
        std::fs::remove_file(dir.path().join("data").join("data1.bif")).unwrap();

        assert!(matches!(
            reader.read("SPELL01", 0x3ee),
            Err(Pie4kError::ResourceNotFound { .. })
        ));
        assert!(matches!(
            reader.resource_info("SPELL01", 0x3ee),
            Err(Pie4kError::ResourceNotFound { .. })
        ));
    }

    #[test]
    fn missing_resource_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        write_key_and_archive(dir.path());
        let reader = ResourceReader::open(
            &dir.path().join("chitin.key"),
            dir.path(),
            "bg1",
            &[],
            false,
        )
        .unwrap();
        assert!(matches!(
            reader.read("NOSUCH01", 0x3ee),
            Err(Pie4kError::ResourceNotFound { .. })
        ));
    }
}
