//! Key/index file parsing (§4.G steps 1-4).

use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt};
use hashbrown::HashMap;
use pie4k_shared::error::{Pie4kError, Result};
use pie4k_shared::fs::{find_case_insensitive, read_file_with_limit, MAX_KEYFILE_BYTES};

use crate::locator::Locator;
use crate::types::{ArchiveEntry, NormalizedName};

const SIG: &[u8; 4] = b"KEY ";
const VER: &[u8; 4] = b"V1  ";
const HEADER_LEN: usize = 24;
const ARCHIVE_ENTRY_LEN: usize = 12;
const RESOURCE_ENTRY_LEN: usize = 14;

/// Directory variants the original system tries when resolving a
/// key-file-relative archive path against the actual game install.
const DATA_DIR_VARIANTS: &[&str] = &["data", "Data", "DATA", "movies", "Movies", "MOVIES"];

/// Parsed key/index file: the archive table and the global resource index.
///
/// Built once at startup and never mutated afterward (§3 lifecycle note).
#[derive(Debug)]
pub struct KeyIndex {
    pub archives: Vec<ArchiveEntry>,
    pub resources: HashMap<(NormalizedName, u16), Locator>,
}

impl KeyIndex {
    /// Parse `path` and resolve each archive entry against `game_path`,
    /// skipping any resource whose normalized name appears in
    /// `known_bad`.
    pub fn load(path: &Path, game_path: &Path, known_bad: &[String]) -> Result<Self> {
        let bytes = read_file_with_limit(path, MAX_KEYFILE_BYTES)?;
        if bytes.len() < HEADER_LEN {
            return Err(Pie4kError::IndexIntegrity {
                path: path.to_path_buf(),
                reason: "file shorter than the 24-byte header".to_string(),
            });
        }

        let sig = &bytes[0..4];
        let ver = &bytes[4..8];
        if sig != SIG || ver != VER {
            return Err(Pie4kError::IndexIntegrity {
                path: path.to_path_buf(),
                reason: format!("bad signature/version: {:?}/{:?}", sig, ver),
            });
        }

        let mut header = &bytes[8..HEADER_LEN];
        let archive_count = header.read_u32::<LittleEndian>().map_err(io_err(path))?;
        let resource_count = header.read_u32::<LittleEndian>().map_err(io_err(path))?;
        let archive_table_offset = header.read_u32::<LittleEndian>().map_err(io_err(path))? as usize;
        let resource_table_offset = header.read_u32::<LittleEndian>().map_err(io_err(path))? as usize;

        let archives = Self::read_archive_table(
            path,
            &bytes,
            archive_table_offset,
            archive_count,
            game_path,
        )?;

        let known_bad_set: hashbrown::HashSet<String> = known_bad.iter().cloned().collect();
        let resources = Self::read_resource_table(
            path,
            &bytes,
            resource_table_offset,
            resource_count,
            &known_bad_set,
        )?;

        Ok(KeyIndex { archives, resources })
    }

    fn read_archive_table(
        path: &Path,
        bytes: &[u8],
        offset: usize,
        count: u32,
        game_path: &Path,
    ) -> Result<Vec<ArchiveEntry>> {
        let mut archives = Vec::with_capacity(count as usize);
        let mut cursor = offset;
        let data_root = game_path.join("data");

        for _ in 0..count {
            let end = cursor + ARCHIVE_ENTRY_LEN;
            let entry_bytes = bytes.get(cursor..end).ok_or_else(|| Pie4kError::IndexIntegrity {
                path: path.to_path_buf(),
                reason: "archive table entry overruns file".to_string(),
            })?;
            let mut r = entry_bytes;
            let file_size = r.read_u32::<LittleEndian>().map_err(io_err(path))?;
            let filename_offset = r.read_u32::<LittleEndian>().map_err(io_err(path))? as usize;
            let filename_length = r.read_u16::<LittleEndian>().map_err(io_err(path))? as usize;
            let _flags = r.read_u16::<LittleEndian>().map_err(io_err(path))?;

            let raw = bytes
                .get(filename_offset..filename_offset + filename_length)
                .ok_or_else(|| Pie4kError::IndexIntegrity {
                    path: path.to_path_buf(),
                    reason: "archive filename extent overruns file".to_string(),
                })?;
            let end_nul = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            let raw_path = String::from_utf8_lossy(&raw[..end_nul]).replace('\\', "/");

            let resolved_path = Self::resolve_archive_path(&data_root, &raw_path);
            archives.push(ArchiveEntry {
                file_size,
                path: raw_path,
                resolved_path,
            });
            cursor = end;
        }
        Ok(archives)
    }

    fn resolve_archive_path(data_root: &Path, raw_path: &str) -> Option<PathBuf> {
        let file_name = Path::new(raw_path).file_name()?.to_str()?.to_string();
        let direct = data_root.join(&file_name);
        if direct.is_file() {
            return Some(direct);
        }
        if let Some(found) = find_case_insensitive(data_root, &file_name) {
            return Some(found);
        }
        for variant in DATA_DIR_VARIANTS {
            let dir = data_root.parent().unwrap_or(data_root).join(variant);
            if !dir.is_dir() {
                continue;
            }
            if let Some(found) = find_case_insensitive(&dir, &file_name) {
                return Some(found);
            }
        }
        None
    }

    fn read_resource_table(
        path: &Path,
        bytes: &[u8],
        offset: usize,
        count: u32,
        known_bad: &hashbrown::HashSet<String>,
    ) -> Result<HashMap<(NormalizedName, u16), Locator>> {
        let mut resources = HashMap::with_capacity(count as usize);
        let mut cursor = offset;

        for _ in 0..count {
            let end = cursor + RESOURCE_ENTRY_LEN;
            let entry_bytes = bytes.get(cursor..end).ok_or_else(|| Pie4kError::IndexIntegrity {
                path: path.to_path_buf(),
                reason: "resource table entry overruns file".to_string(),
            })?;
            let name = NormalizedName::from_raw(&entry_bytes[0..8]);
            let mut r = &entry_bytes[8..14];
            let type_code = r.read_u16::<LittleEndian>().map_err(io_err(path))?;
            let raw_locator = r.read_u32::<LittleEndian>().map_err(io_err(path))?;

            cursor = end;
            if known_bad.contains(&name.0) {
                continue;
            }
            let locator = Locator::new(raw_locator);
            resources.insert((name, type_code), locator);
        }
        Ok(resources)
    }

    pub fn archive_count(&self) -> usize {
        self.archives.len()
    }
}

fn io_err(path: &Path) -> impl Fn(std::io::Error) -> Pie4kError + '_ {
    move |e| Pie4kError::io(path.to_path_buf(), e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn build_key_file(archive_path: &str, resource_name: &[u8; 8], type_code: u16, locator: u32) -> Vec<u8> {
        let archive_name_bytes = archive_path.as_bytes();
        let header_len = HEADER_LEN as u32;
        let archive_table_offset = header_len;
        let archive_entry_len = ARCHIVE_ENTRY_LEN as u32;
        let filename_offset = archive_table_offset + archive_entry_len;
        let resource_table_offset = filename_offset + archive_name_bytes.len() as u32;

        let mut buf = Vec::new();
        buf.extend_from_slice(SIG);
        buf.extend_from_slice(VER);
        buf.extend_from_slice(&1u32.to_le_bytes()); // archive_count
        buf.extend_from_slice(&1u32.to_le_bytes()); // resource_count
        buf.extend_from_slice(&archive_table_offset.to_le_bytes());
        buf.extend_from_slice(&resource_table_offset.to_le_bytes());

        // archive table entry
        buf.extend_from_slice(&4096u32.to_le_bytes()); // file_size
        buf.extend_from_slice(&filename_offset.to_le_bytes());
        buf.extend_from_slice(&(archive_name_bytes.len() as u16).to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes()); // flags
        buf.extend_from_slice(archive_name_bytes);

        // resource table entry
        buf.extend_from_slice(resource_name);
        buf.extend_from_slice(&type_code.to_le_bytes());
        buf.extend_from_slice(&locator.to_le_bytes());

        buf
    }

    #[test]
    fn parses_minimal_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        std::fs::create_dir_all(&data_dir).unwrap();
        std::fs::write(data_dir.join("data1.bif"), b"stub").unwrap();

        let key_bytes = build_key_file("data1.bif", b"SPELL01\0", 0x3ee, 5);
        let key_path = dir.path().join("chitin.key");
        let mut f = std::fs::File::create(&key_path).unwrap();
        f.write_all(&key_bytes).unwrap();

        let idx = KeyIndex::load(&key_path, dir.path(), &[]).unwrap();
        assert_eq!(idx.archives.len(), 1);
        assert!(idx.archives[0].found());
        let locator = idx
            .resources
            .get(&(NormalizedName("SPELL01".to_string()), 0x3ee))
            .unwrap();
        assert_eq!(locator.file_index(), 5);
    }

    #[test]
    fn rejects_bad_signature() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.key");
        std::fs::write(&path, vec![0u8; 24]).unwrap();
        assert!(KeyIndex::load(&path, dir.path(), &[]).is_err());
    }

    #[test]
    fn skips_known_bad_resource() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        std::fs::create_dir_all(&data_dir).unwrap();
        std::fs::write(data_dir.join("data1.bif"), b"stub").unwrap();

        let key_bytes = build_key_file("data1.bif", b"BADRES01", 0x3ee, 5);
        let key_path = dir.path().join("chitin.key");
        std::fs::write(&key_path, &key_bytes).unwrap();

        let idx = KeyIndex::load(&key_path, dir.path(), &["BADRES01".to_string()]).unwrap();
        assert!(idx.resources.is_empty());
    }
}
