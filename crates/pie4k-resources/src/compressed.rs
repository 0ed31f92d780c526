//! BIFC compressed archive decompression to an on-disk cache (§3
//! `CompressedArchive`, §6 "On-disk cache layout").

use std::io::Read;
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt};
use flate2::read::ZlibDecoder;
use pie4k_shared::error::{Pie4kError, Result};

const BIFC_SIG: &[u8; 4] = b"BIFC";
const MIN_DECOMPRESSED_SIZE: usize = 8;

/// Decompress a BIFC-prefixed buffer into `<cache_dir>/<archive_stem>.decompressed`,
/// reusing an existing cache file untouched when `retain_cache` is set and
/// the file is already present.
pub fn decompress_to_cache(
    source_path: &Path,
    raw: &[u8],
    cache_dir: &Path,
    retain_cache: bool,
) -> Result<PathBuf> {
    let stem = source_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("archive");
    let cache_path = cache_dir.join(format!("{stem}.decompressed"));

    if retain_cache && cache_path.is_file() {
        return Ok(cache_path);
    }

    std::fs::create_dir_all(cache_dir).map_err(|e| Pie4kError::io(cache_dir.to_path_buf(), e))?;

    let decompressed = decompress_blocks(source_path, raw)?;
    if decompressed.len() < MIN_DECOMPRESSED_SIZE
        || (&decompressed[0..4] != b"BIFF" && &decompressed[0..4] != b"KEY ")
    {
        return Err(Pie4kError::Compression(format!(
            "{}: decompressed payload failed the integrity check",
            source_path.display()
        )));
    }

    let tmp_path = cache_dir.join(format!("{stem}.decompressed.tmp"));
    std::fs::write(&tmp_path, &decompressed).map_err(|e| Pie4kError::io(tmp_path.clone(), e))?;
    std::fs::rename(&tmp_path, &cache_path).map_err(|e| Pie4kError::io(cache_path.clone(), e))?;

    Ok(cache_path)
}

fn decompress_blocks(source_path: &Path, raw: &[u8]) -> Result<Vec<u8>> {
    if raw.get(0..4) != Some(BIFC_SIG) {
        return Err(Pie4kError::IndexIntegrity {
            path: source_path.to_path_buf(),
            reason: "missing BIFC signature".to_string(),
        });
    }
    let mut cursor = &raw[4..];
    let uncompressed_length = cursor.read_u32::<LittleEndian>().map_err(|e| {
        Pie4kError::Io { path: source_path.to_path_buf(), source: e }
    })? as usize;

    let mut out = Vec::with_capacity(uncompressed_length);
    let mut offset = 8usize;

    while out.len() < uncompressed_length {
        let mut header = raw
            .get(offset..offset + 8)
            .ok_or_else(|| Pie4kError::Compression("truncated block header".to_string()))?;
        let uncompressed_block = header.read_u32::<LittleEndian>().unwrap() as usize;
        let compressed_block = header.read_u32::<LittleEndian>().unwrap() as usize;
        offset += 8;

        let block_data = raw
            .get(offset..offset + compressed_block)
            .ok_or_else(|| Pie4kError::Compression("truncated block payload".to_string()))?;
        offset += compressed_block;

        let mut decoder = ZlibDecoder::new(block_data);
        let mut block_out = Vec::with_capacity(uncompressed_block);
        decoder
            .read_to_end(&mut block_out)
            .map_err(|e| Pie4kError::Compression(format!("zlib error: {e}")))?;

        if block_out.len() != uncompressed_block {
            return Err(Pie4kError::Compression(format!(
                "block size mismatch: expected {uncompressed_block}, got {}",
                block_out.len()
            )));
        }
        out.extend_from_slice(&block_out);
    }

    out.truncate(uncompressed_length);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zlib_compress(data: &[u8]) -> Vec<u8> {
        let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn decompresses_two_blocks_matching_s3() {
        let block_a: Vec<u8> = vec![0, 1, 2, 3, 4, 5];
        let block_b: Vec<u8> = vec![6, 7, 8, 9];
        let compressed_a = zlib_compress(&block_a);
        let compressed_b = zlib_compress(&block_b);

        let mut raw = Vec::new();
        raw.extend_from_slice(BIFC_SIG);
        raw.extend_from_slice(&10u32.to_le_bytes());
        raw.extend_from_slice(&(block_a.len() as u32).to_le_bytes());
        raw.extend_from_slice(&(compressed_a.len() as u32).to_le_bytes());
        raw.extend_from_slice(&compressed_a);
        raw.extend_from_slice(&(block_b.len() as u32).to_le_bytes());
        raw.extend_from_slice(&(compressed_b.len() as u32).to_le_bytes());
        raw.extend_from_slice(&compressed_b);

        let decompressed = decompress_blocks(Path::new("t.bifc"), &raw).unwrap();
        assert_eq!(decompressed, vec![0u8, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn rejects_block_size_mismatch() {
        let block = vec![1u8, 2, 3];
        let compressed = zlib_compress(&block);
        let mut raw = Vec::new();
        raw.extend_from_slice(BIFC_SIG);
        raw.extend_from_slice(&99u32.to_le_bytes()); // wrong uncompressed size
        raw.extend_from_slice(&compressed);
        assert!(decompress_blocks(Path::new("t.bifc"), &raw).is_err());
    }
}
