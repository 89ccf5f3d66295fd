//! ZIP-of-PAKs handling: some firmware downloads ship a ZIP wrapping one or
//! more PAK archives rather than a bare PAK. This module only classifies and
//! extracts the member bytes; the façade opens each resulting blob as its
//! own `Firmware`.

use crate::error::{FwError, Result};
use crate::pak;
use crate::util::sha256_bytes;
use std::collections::HashSet;
use std::io::{Cursor, Read};

/// A blob is a PAK iff its first four bytes are the PAK magic.
pub fn is_pak(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && bytes[..4] == pak::MAGIC
}

/// A blob looks like a ZIP iff it carries a local-file-header or
/// end-of-central-directory signature at the start (the `zip` crate itself
/// scans the central directory, but a cheap magic check lets callers
/// classify without paying for that scan).
pub fn is_zip(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && (bytes[..4] == *b"PK\x03\x04" || bytes[..4] == *b"PK\x05\x06")
}

/// Scan a ZIP archive for PAK members, returning each member's raw bytes.
/// Duplicate PAKs (common when a vendor ships the same firmware twice under
/// different member names) are de-duplicated by SHA-256 of the member's
/// bytes — the rule this crate picked over the original's mixed
/// equality/name-based de-duplication (spec §9 Open Question, see
/// `DESIGN.md`).
pub fn extract_paks_from_zip(bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
    let cursor = Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(cursor)
        .map_err(|e| FwError::DecoderFailed("zip", e.to_string()))?;

    let mut seen = HashSet::new();
    let mut paks = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| FwError::DecoderFailed("zip", e.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut buf)
            .map_err(|e| FwError::DecoderFailed("zip", e.to_string()))?;
        if !is_pak(&buf) {
            continue;
        }
        let digest = sha256_bytes(&buf);
        if seen.insert(digest) {
            paks.push(buf);
        }
    }

    if paks.is_empty() {
        return Err(FwError::NoPaksInZip);
    }
    Ok(paks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn build_zip(members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let cursor = Cursor::new(&mut buf);
            let mut writer = zip::ZipWriter::new(cursor);
            let options = zip::write::FileOptions::default()
                .compression_method(zip::CompressionMethod::Stored);
            for (name, content) in members {
                writer.start_file(*name, options).unwrap();
                writer.write_all(content).unwrap();
            }
            writer.finish().unwrap();
        }
        buf
    }

    fn fake_pak(tag: u8) -> Vec<u8> {
        let mut v = pak::MAGIC.to_vec();
        v.extend(std::iter::repeat(tag).take(60));
        v
    }

    #[test]
    fn detects_pak_and_zip_magics() {
        assert!(is_pak(&fake_pak(1)));
        assert!(!is_pak(b"PK\x03\x04junk"));
        assert!(is_zip(b"PK\x03\x04junk"));
        assert!(!is_zip(&fake_pak(1)));
    }

    #[test]
    fn extracts_paks_and_skips_non_pak_members() {
        let a = fake_pak(0xAA);
        let zip_bytes = build_zip(&[("a.pak", &a), ("readme.txt", b"hello")]);
        let paks = extract_paks_from_zip(&zip_bytes).unwrap();
        assert_eq!(paks.len(), 1);
        assert_eq!(paks[0], a);
    }

    #[test]
    fn dedups_identical_pak_bytes_by_sha256() {
        let a = fake_pak(0xBB);
        let zip_bytes = build_zip(&[("a.pak", &a), ("b.pak", &a)]);
        let paks = extract_paks_from_zip(&zip_bytes).unwrap();
        assert_eq!(paks.len(), 1);
    }

    #[test]
    fn fails_when_zip_has_no_pak_members() {
        let zip_bytes = build_zip(&[("readme.txt", b"hello")]);
        assert!(matches!(extract_paks_from_zip(&zip_bytes), Err(FwError::NoPaksInZip)));
    }
}
