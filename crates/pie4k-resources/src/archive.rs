//! Member archive parsing: BIFF (uncompressed) and BIFC (compressed),
//! per §4.G "Archive open" and §6's table layouts.

use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt};
use hashbrown::HashMap;
use pie4k_shared::error::{Pie4kError, Result};
use pie4k_shared::fs::{read_file_with_limit, MAX_ARCHIVE_BYTES};

use crate::compressed::decompress_to_cache;
use crate::locator::Locator;

const BIFF_SIG: &[u8; 4] = b"BIFF";
const BIFC_SIG: &[u8; 4] = b"BIFC";
const BIFF_HEADER_LEN: usize = 20;
const FILE_ENTRY_LEN: usize = 16;
const TILE_ENTRY_LEN: usize = 20;

const TIS_SIG: &[u8; 4] = b"TIS ";
const TIS_VER: &[u8; 4] = b"V1  ";
const TIS_TILE_SIZE: u32 = 5120;
const TIS_HEADER_SIZE: u32 = 24;
const TIS_TILE_DIM: u32 = 64;

#[derive(Debug, Clone, Copy)]
pub struct FileEntry {
    pub locator: Locator,
    pub offset: u32,
    pub size: u32,
    pub type_code: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct TileEntry {
    pub locator: Locator,
    pub offset: u32,
    pub num_tiles: u32,
    pub tile_size: u32,
    pub type_code: u16,
}

/// A parsed, lazily-opened member archive. Lives in the reader's LRU
/// cache for the duration of a batch (§3 `ArchiveMember` lifecycle).
#[derive(Debug)]
pub struct ArchiveMember {
    bytes: Vec<u8>,
    pub file_entries: Vec<FileEntry>,
    pub tile_entries: Vec<TileEntry>,
    pub size_index: HashMap<u32, u32>,
}

impl ArchiveMember {
    /// Open `path`, transparently decompressing if it is BIFC. `cache_dir`
    /// and `retain_cache` are only consulted for compressed archives.
    pub fn open(path: &Path, cache_dir: &Path, retain_cache: bool) -> Result<Self> {
        let raw = read_file_with_limit(path, MAX_ARCHIVE_BYTES)?;
        let sig = raw.get(0..4).ok_or_else(|| Pie4kError::IndexIntegrity {
            path: path.to_path_buf(),
            reason: "archive shorter than a signature".to_string(),
        })?;

        let bytes = if sig == BIFC_SIG {
            let cached_path = decompress_to_cache(path, &raw, cache_dir, retain_cache)?;
            read_file_with_limit(&cached_path, MAX_ARCHIVE_BYTES)?
        } else {
            raw
        };

        Self::parse(path, bytes)
    }

    fn parse(path: &Path, bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < BIFF_HEADER_LEN {
            return Err(Pie4kError::IndexIntegrity {
                path: path.to_path_buf(),
                reason: "archive shorter than its 20-byte header".to_string(),
            });
        }
        let sig = &bytes[0..4];
        let ver = &bytes[4..8];
        if sig != BIFF_SIG || (ver != b"V1 " && ver != b"V2 ") {
            return Err(Pie4kError::IndexIntegrity {
                path: path.to_path_buf(),
                reason: format!("bad archive signature/version: {:?}/{:?}", sig, ver),
            });
        }

        let mut header = &bytes[8..BIFF_HEADER_LEN];
        let file_count = header.read_u32::<LittleEndian>().map_err(io_err(path))?;
        let tile_count = header.read_u32::<LittleEndian>().map_err(io_err(path))?;
        let file_offset = header.read_u32::<LittleEndian>().map_err(io_err(path))? as usize;

        let mut file_entries = Vec::with_capacity(file_count as usize);
        let mut cursor = file_offset;
        for _ in 0..file_count {
            let end = cursor + FILE_ENTRY_LEN;
            let entry = bytes.get(cursor..end).ok_or_else(overrun(path, "file table"))?;
            let mut r = entry;
            let locator = Locator::new(r.read_u32::<LittleEndian>().map_err(io_err(path))?);
            let offset = r.read_u32::<LittleEndian>().map_err(io_err(path))?;
            let size = r.read_u32::<LittleEndian>().map_err(io_err(path))?;
            let type_code = r.read_u16::<LittleEndian>().map_err(io_err(path))?;
            file_entries.push(FileEntry { locator, offset, size, type_code });
            cursor = end;
        }

        let mut tile_entries = Vec::with_capacity(tile_count as usize);
        for _ in 0..tile_count {
            let end = cursor + TILE_ENTRY_LEN;
            let entry = bytes.get(cursor..end).ok_or_else(overrun(path, "tile table"))?;
            let mut r = entry;
            let locator = Locator::new(r.read_u32::<LittleEndian>().map_err(io_err(path))?);
            let offset = r.read_u32::<LittleEndian>().map_err(io_err(path))?;
            let num_tiles = r.read_u32::<LittleEndian>().map_err(io_err(path))?;
            let tile_size = r.read_u32::<LittleEndian>().map_err(io_err(path))?;
            let type_code = r.read_u16::<LittleEndian>().map_err(io_err(path))?;
            tile_entries.push(TileEntry { locator, offset, num_tiles, tile_size, type_code });
            cursor = end;
        }

        let mut size_index = HashMap::with_capacity(file_entries.len() + tile_entries.len());
        for f in &file_entries {
            size_index.insert(f.locator.raw, f.size);
        }
        for t in &tile_entries {
            size_index.insert(t.locator.raw, t.num_tiles * t.tile_size);
        }

        Ok(ArchiveMember { bytes, file_entries, tile_entries, size_index })
    }

    /// Dereference a non-tileset resource by the low 14 bits of its
    /// locator (§4.G "Dereference").
    pub fn read_file(&self, locator: Locator) -> Result<Vec<u8>> {
        let file_index = locator.file_index();
        let entry = self
            .file_entries
            .iter()
            .find(|e| e.locator.file_index() == file_index)
            .ok_or_else(|| Pie4kError::IndexIntegrity {
                path: PathBuf::new(),
                reason: format!("no file entry for locator {:#010x}", locator.raw),
            })?;
        self.slice(entry.offset, entry.size)
    }

    /// Dereference a tileset resource, prefixing the synthesized 24-byte
    /// `TIS ` header (§4.G, §6).
    pub fn read_tileset(&self, locator: Locator) -> Result<Vec<u8>> {
        let tileset_index = locator.tileset_index();
        let entry = self
            .tile_entries
            .iter()
            .find(|e| e.locator.tileset_index() == tileset_index)
            .ok_or_else(|| Pie4kError::IndexIntegrity {
                path: PathBuf::new(),
                reason: format!("no tile entry for tileset index {}", tileset_index),
            })?;

        let payload = self.slice(entry.offset, entry.num_tiles * entry.tile_size)?;
        let mut out = Vec::with_capacity(TIS_HEADER_SIZE as usize + payload.len());
        out.extend_from_slice(TIS_SIG);
        out.extend_from_slice(TIS_VER);
        out.extend_from_slice(&entry.num_tiles.to_le_bytes());
        out.extend_from_slice(&TIS_TILE_SIZE.to_le_bytes());
        out.extend_from_slice(&TIS_HEADER_SIZE.to_le_bytes());
        out.extend_from_slice(&TIS_TILE_DIM.to_le_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    fn slice(&self, offset: u32, size: u32) -> Result<Vec<u8>> {
        let start = offset as usize;
        let end = start + size as usize;
        self.bytes
            .get(start..end)
            .map(|s| s.to_vec())
            .ok_or_else(|| Pie4kError::IndexIntegrity {
                path: PathBuf::new(),
                reason: format!("resource extent {}..{} overruns archive", start, end),
            })
    }

    pub fn size_of(&self, locator: Locator) -> Option<u32> {
        self.size_index.get(&locator.raw).copied()
    }
}

fn io_err(path: &Path) -> impl Fn(std::io::Error) -> Pie4kError + '_ {
    move |e| Pie4kError::io(path.to_path_buf(), e)
}

fn overrun<'a>(path: &'a Path, table: &'static str) -> impl Fn() -> Pie4kError + 'a {
    move || Pie4kError::IndexIntegrity {
        path: path.to_path_buf(),
        reason: format!("{table} entry overruns file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_biff(file_entries: &[(u32, u32, u32, u16)]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(BIFF_SIG);
        buf.extend_from_slice(b"V1 ");
        buf.extend_from_slice(&(file_entries.len() as u32).to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // tile_count
        buf.extend_from_slice(&(BIFF_HEADER_LEN as u32).to_le_bytes()); // file_offset
        for (locator, offset, size, type_code) in file_entries {
            buf.extend_from_slice(&locator.to_le_bytes());
            buf.extend_from_slice(&offset.to_le_bytes());
            buf.extend_from_slice(&size.to_le_bytes());
            buf.extend_from_slice(&type_code.to_le_bytes());
            buf.extend_from_slice(&0u16.to_le_bytes()); // pad
        }
        buf
    }

    #[test]
    fn reads_file_entry_at_offset() {
        let data = b"hello-world-payload!!!!";
        let offset = BIFF_HEADER_LEN as u32 + FILE_ENTRY_LEN as u32;
        let mut bytes = build_biff(&[(5, offset, data.len() as u32, 0x3ee)]);
        bytes.extend_from_slice(data);

        let archive = ArchiveMember::parse(Path::new("test.bif"), bytes).unwrap();
        let out = archive.read_file(Locator::new(5)).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn rejects_short_header() {
        let err = ArchiveMember::parse(Path::new("t.bif"), vec![0u8; 4]);
        assert!(err.is_err());
    }
}
