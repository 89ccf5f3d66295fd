//! The compression kit: BCL, legacy LZ4 framing, raw LZMA/XZ, gzip, zlib.
//! Each decompressor takes the full byte slice starting at its header and
//! returns the full decompressed output; failures are reported as one of
//! the specific [`FwError`] kinds (truncated input, bad magic/header,
//! decoder failure) rather than a generic I/O error.

pub mod bcl;
pub mod gzip;
pub mod lz4_legacy;
pub mod lzma;
pub mod zlib;

use crate::error::{FwError, Result};

/// The compression magics the kernel-decompression dispatch (façade §4.8
/// step 7) searches for, in the order they're probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelCodec {
    Lz4Legacy,
    Xz,
    Lzma,
    Gzip,
}

impl KernelCodec {
    /// Find the earliest occurrence of any recognised compression magic in
    /// `haystack`, returning its byte offset and which codec matched.
    pub fn find_first(haystack: &[u8]) -> Option<(usize, KernelCodec)> {
        let candidates: [(&[u8], KernelCodec); 3] = [
            (&lz4_legacy::MAGIC, KernelCodec::Lz4Legacy),
            (&lzma::XZ_MAGIC, KernelCodec::Xz),
            (&gzip::MAGIC, KernelCodec::Gzip),
        ];
        let mut best: Option<(usize, KernelCodec)> = None;
        for (magic, codec) in candidates {
            if let Some(pos) = find_subslice(haystack, magic) {
                if best.map(|(p, _)| pos < p).unwrap_or(true) {
                    best = Some((pos, codec));
                }
            }
        }
        best
    }

    pub fn decompress(self, bytes: &[u8]) -> Result<Vec<u8>> {
        match self {
            KernelCodec::Lz4Legacy => lz4_legacy::decompress(bytes),
            KernelCodec::Xz => lzma::decompress_xz(bytes),
            KernelCodec::Lzma => lzma::decompress_lzma(bytes),
            KernelCodec::Gzip => gzip::decompress(bytes),
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Decompress a U-Boot payload given the bytes immediately at the section
/// start: BCL if it carries the BCL magic, otherwise returned unchanged
/// (some variants ship U-Boot uncompressed).
pub fn decompress_uboot_payload(bytes: &[u8]) -> Result<Vec<u8>> {
    if bytes.len() >= 4 && u32::from_le_bytes(bytes[..4].try_into().unwrap()) == bcl::MAGIC {
        bcl::decompress(bytes)
    } else {
        Ok(bytes.to_vec())
    }
}

/// Dispatch the kernel payload decompression rule from §4.8 step 7: LZMA/XZ
/// immediately after the legacy image header decompresses as a single
/// stream; otherwise anchor on `" -- System halted"` and search forward
/// from there for a known magic.
pub fn decompress_kernel_payload(after_header: &[u8]) -> Result<Vec<u8>> {
    if after_header.len() >= 6 && after_header[..6] == lzma::XZ_MAGIC {
        return lzma::decompress_xz(after_header);
    }
    if lzma::looks_like_lzma_header(after_header) {
        if let Ok(out) = lzma::decompress_lzma(after_header) {
            return Ok(out);
        }
    }

    const ANCHOR: &[u8] = b" -- System halted";
    let anchor_pos =
        find_subslice(after_header, ANCHOR).ok_or(FwError::SystemHaltedNotFound)?;
    let search_region = &after_header[anchor_pos..];
    let (offset, codec) = KernelCodec::find_first(search_region)
        .ok_or(FwError::NoKnownCompressionInKernel)?;
    codec.decompress(&search_region[offset..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_earliest_magic_among_several() {
        let mut haystack = vec![0u8; 16];
        haystack.extend_from_slice(&gzip::MAGIC);
        haystack.extend_from_slice(&[0u8; 8]);
        haystack.extend_from_slice(&lz4_legacy::MAGIC);
        let (pos, codec) = KernelCodec::find_first(&haystack).unwrap();
        assert_eq!(pos, 16);
        assert_eq!(codec, KernelCodec::Gzip);
    }

    #[test]
    fn kernel_dispatch_requires_system_halted_anchor() {
        let mut data = vec![0u8; 4096];
        data.extend_from_slice(&gzip::MAGIC);
        assert!(matches!(
            decompress_kernel_payload(&data),
            Err(FwError::SystemHaltedNotFound)
        ));
    }

    #[test]
    fn kernel_dispatch_rejects_when_no_codec_found_past_anchor() {
        let mut data = b" -- System halted".to_vec();
        data.extend_from_slice(&[0u8; 32]);
        assert!(matches!(
            decompress_kernel_payload(&data),
            Err(FwError::NoKnownCompressionInKernel)
        ));
    }
}
