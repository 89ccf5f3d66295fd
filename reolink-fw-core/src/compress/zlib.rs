//! Zlib (RFC 1950), used by SquashFS/CramFS data- and metadata-block
//! compression when the image's compressor id selects "zlib"/"gzip" mode.

use crate::error::{FwError, Result};
use flate2::read::ZlibDecoder;
use std::io::Read;

pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| FwError::DecoderFailed("zlib", e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn round_trips() {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"squashfs metadata block").unwrap();
        let compressed = enc.finish().unwrap();
        assert_eq!(decompress(&compressed).unwrap(), b"squashfs metadata block");
    }
}
