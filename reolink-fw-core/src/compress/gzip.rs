//! Single-member gzip, as used to wrap the `.config` blob extracted from a
//! kernel image between the `IKCFG_ST`/`IKCFG_ED` markers.

use crate::error::{FwError, Result};
use flate2::read::MultiGzDecoder;
use std::io::Read;

pub const MAGIC: [u8; 2] = [0x1F, 0x8B];

pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    if bytes.len() < 2 || bytes[..2] != MAGIC {
        return Err(FwError::BadMagic("gzip"));
    }
    // MultiGzDecoder tolerates a concatenated-member stream, which is the
    // only variation observed in practice even though the format only ever
    // carries a single logical member here.
    let mut decoder = MultiGzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| FwError::DecoderFailed("gzip", e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn round_trips_a_gzip_member() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"hello, kernel config").unwrap();
        let compressed = enc.finish().unwrap();
        let out = decompress(&compressed).unwrap();
        assert_eq!(out, b"hello, kernel config");
    }

    #[test]
    fn rejects_bad_magic() {
        assert!(matches!(
            decompress(b"PK\x03\x04"),
            Err(FwError::BadMagic("gzip"))
        ));
    }
}
