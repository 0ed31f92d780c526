//! Shared value types for the resource layer (§3).

use std::path::PathBuf;

use crate::locator::Locator;

/// ASCII-uppercased, NUL-trimmed, max-8-char resource name. Names are
/// unique per type within a `KeyIndex` (§3 invariant).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NormalizedName(pub String);

impl NormalizedName {
    /// Normalize raw bytes from a key-file resource table entry: truncate
    /// at the first NUL, uppercase the ASCII remainder, and cap the
    /// result at 8 characters.
    pub fn from_raw(raw: &[u8]) -> Self {
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let text = String::from_utf8_lossy(&raw[..end]);
        let upper: String = text.chars().take(8).map(|c| c.to_ascii_uppercase()).collect();
        NormalizedName(upper)
    }
}

/// One entry in a key file's archive table, resolved (or not) against the
/// filesystem.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub file_size: u32,
    pub path: String,
    pub resolved_path: Option<PathBuf>,
}

impl ArchiveEntry {
    pub fn found(&self) -> bool {
        self.resolved_path.is_some()
    }
}

/// Projection of a resource index lookup, handed to codec collaborators
/// (§3 `ResourceInfo`).
#[derive(Debug, Clone)]
pub struct ResourceInfo {
    pub name: NormalizedName,
    pub type_code: u16,
    pub archive_index: u32,
    pub locator: Locator,
    pub offset: u32,
    pub size: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_truncates_and_uppercases() {
        let n = NormalizedName::from_raw(b"spell01\0\0");
        assert_eq!(n.0, "SPELL01");
    }

    #[test]
    fn normalizes_caps_at_eight_chars() {
        let n = NormalizedName::from_raw(b"abcdefghij");
        assert_eq!(n.0, "ABCDEFGH");
    }
}
