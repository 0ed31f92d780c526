//! Filesystem helpers shared across the pipeline.

use std::path::Path;

use crate::error::{Pie4kError, Result};

/// Maximum allowed archive size for a single in-memory read.
pub const MAX_ARCHIVE_BYTES: u64 = 4 * 1024 * 1024 * 1024; // 4 GiB
/// Maximum allowed key/index file size.
pub const MAX_KEYFILE_BYTES: u64 = 64 * 1024 * 1024; // 64 MiB

/// Read a file into memory, refusing anything past `max_bytes`.
pub fn read_file_with_limit(path: &Path, max_bytes: u64) -> Result<Vec<u8>> {
    let metadata = std::fs::metadata(path).map_err(|e| Pie4kError::io(path.to_path_buf(), e))?;
    if metadata.len() > max_bytes {
        return Err(Pie4kError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("file too large: {} bytes (max {})", metadata.len(), max_bytes),
            ),
        });
    }
    std::fs::read(path).map_err(|e| Pie4kError::io(path.to_path_buf(), e))
}

/// Case-insensitive sibling lookup: given a directory and a desired file
/// name, scan the directory for an entry matching case-insensitively.
/// Used to resolve archive paths per §4.G (filesystems on Linux/macOS are
/// usually case-sensitive, but the key file was written on Windows).
pub fn find_case_insensitive(dir: &Path, name: &str) -> Option<std::path::PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy().eq_ignore_ascii_case(name) {
            return Some(entry.path());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive_lookup_finds_sibling() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Data1.bif"), b"x").unwrap();
        let found = find_case_insensitive(dir.path(), "data1.bif").unwrap();
        assert_eq!(found.file_name().unwrap(), "Data1.bif");
    }

    #[test]
    fn read_file_with_limit_rejects_oversized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, vec![0u8; 16]).unwrap();
        assert!(read_file_with_limit(&path, 4).is_err());
        assert!(read_file_with_limit(&path, 16).is_ok());
    }
}
