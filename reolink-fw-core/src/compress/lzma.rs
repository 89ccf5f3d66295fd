//! Raw LZMA and XZ streams, both single-member. `xz2` wraps liblzma, giving
//! us a streaming decoder for both container formats without needing to
//! hand-roll the range coder.

use crate::error::{FwError, Result};
use std::io::Read;
use xz2::read::XzDecoder;
use xz2::stream::Stream;

pub const XZ_MAGIC: [u8; 6] = [0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00];
/// LZMA alone (`.lzma`) starts with a properties byte followed by a 4-byte
/// little-endian dictionary size; there's no fixed magic, so detection
/// relies on the properties byte being in the valid `0..=224` range and the
/// caller already having ruled out every other known magic.
pub fn looks_like_lzma_header(bytes: &[u8]) -> bool {
    bytes.len() >= 13 && bytes[0] <= 224
}

pub fn decompress_xz(bytes: &[u8]) -> Result<Vec<u8>> {
    if bytes.len() < 6 || bytes[..6] != XZ_MAGIC {
        return Err(FwError::BadMagic("xz"));
    }
    let mut decoder = XzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| FwError::DecoderFailed("xz", e.to_string()))?;
    Ok(out)
}

/// Decode a raw (headerless) LZMA1 stream: 1 properties byte, 4-byte LE
/// dictionary size, 8-byte LE uncompressed size (often `0xFFFFFFFFFFFFFFFF`
/// meaning "unknown, read until end-of-stream marker").
pub fn decompress_lzma(bytes: &[u8]) -> Result<Vec<u8>> {
    if bytes.len() < 13 {
        return Err(FwError::Truncated("lzma header"));
    }
    let stream = Stream::new_lzma_decoder(u64::MAX)
        .map_err(|e| FwError::DecoderFailed("lzma", e.to_string()))?;
    let mut decoder = XzDecoder::new_stream(bytes, stream);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| FwError::DecoderFailed("lzma", e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_xz_magic() {
        assert!(matches!(
            decompress_xz(b"not an xz stream at all"),
            Err(FwError::BadMagic("xz"))
        ));
    }

    #[test]
    fn rejects_truncated_lzma_header() {
        assert!(matches!(
            decompress_lzma(&[0u8; 4]),
            Err(FwError::Truncated("lzma header"))
        ));
    }
}
