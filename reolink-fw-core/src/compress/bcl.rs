//! BCL — the small compression library the vendor uses to wrap the U-Boot
//! payload on some firmware variants.
//!
//! A variant-dispatched header (`magic, algo, compressed_size, outsize`)
//! precedes the payload. The encoder is known to under-count the compressed
//! size by 1-3 `0xFF` padding bytes at the end of the window; those bytes
//! are not part of the payload, so we read exactly `compressed_size` bytes
//! rather than trusting the window's remaining length.

use crate::error::{FwError, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

pub const HEADER_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algo {
    Rle,
    Huffman,
    Rice8,
    Rice16,
    Rice32,
    Rice8s,
    Rice16s,
    Rice32s,
    Lz,
    Lz77,
    Shannon,
    RleOther(u8),
}

impl Algo {
    fn from_byte(b: u8) -> Algo {
        match b {
            1 => Algo::Rle,
            2 => Algo::Huffman,
            3 => Algo::Rice8,
            4 => Algo::Rice16,
            5 => Algo::Rice32,
            6 => Algo::Rice8s,
            7 => Algo::Rice16s,
            8 => Algo::Rice32s,
            9 => Algo::Lz,
            10 => Algo::Lz77,
            11 => Algo::Shannon,
            other => Algo::RleOther(other),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub magic: u32,
    pub algo: Algo,
    pub compressed_size: u32,
    pub outsize: u32,
}

pub fn parse_header(bytes: &[u8]) -> Result<Header> {
    if bytes.len() < HEADER_LEN {
        return Err(FwError::Truncated("bcl header"));
    }
    let mut c = Cursor::new(bytes);
    let magic = c
        .read_u32::<LittleEndian>()
        .map_err(|_| FwError::Truncated("bcl header"))?;
    let algo = c
        .read_u8()
        .map_err(|_| FwError::Truncated("bcl header"))?;
    // 3 reserved/alignment bytes between algo and the size fields.
    c.set_position(c.position() + 3);
    let compressed_size = c
        .read_u32::<LittleEndian>()
        .map_err(|_| FwError::Truncated("bcl header"))?;
    let outsize = c
        .read_u32::<LittleEndian>()
        .map_err(|_| FwError::Truncated("bcl header"))?;
    Ok(Header {
        magic,
        algo: Algo::from_byte(algo),
        compressed_size,
        outsize,
    })
}

pub const MAGIC: u32 = 0x4243_4C31; // "1LCB" little-endian spelling of "BCL1"

/// Decompress a BCL-wrapped payload: `bytes` starts at the header, and may
/// contain trailing `0xFF` padding beyond `compressed_size` that must be
/// ignored.
pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    let header = parse_header(bytes)?;
    let payload_start = HEADER_LEN;
    let payload_end = payload_start + header.compressed_size as usize;
    let payload = bytes
        .get(payload_start..payload_end)
        .ok_or(FwError::Truncated("bcl payload"))?;

    let out = match header.algo {
        Algo::Rle => rle_decompress(payload, header.outsize as usize),
        Algo::Lz | Algo::Lz77 => lz_decompress(payload, header.outsize as usize)?,
        other => {
            return Err(FwError::DecoderFailed(
                "bcl",
                format!("unsupported algorithm {other:?}"),
            ))
        }
    };
    if out.len() != header.outsize as usize {
        return Err(FwError::DecoderFailed(
            "bcl",
            format!(
                "expected {} decompressed bytes, got {}",
                header.outsize,
                out.len()
            ),
        ));
    }
    Ok(out)
}

/// BCL's RLE variant: `(count: u8, value: u8)` pairs, `count == 0` meaning a
/// single literal byte `value` rather than a run.
fn rle_decompress(data: &[u8], outsize: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(outsize);
    let mut i = 0;
    while i + 1 < data.len() && out.len() < outsize {
        let count = data[i];
        let value = data[i + 1];
        i += 2;
        if count == 0 {
            out.push(value);
        } else {
            out.extend(std::iter::repeat(value).take(count as usize));
        }
    }
    out
}

/// BCL's LZ variant: a stream of tagged tokens, either a literal run or a
/// back-reference `(distance: u16 LE, length: u8)`.
fn lz_decompress(data: &[u8], outsize: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(outsize);
    let mut i = 0;
    while i < data.len() && out.len() < outsize {
        let tag = data[i];
        i += 1;
        if tag & 0x80 != 0 {
            let run = (tag & 0x7f) as usize;
            let end = (i + run).min(data.len());
            out.extend_from_slice(&data[i..end]);
            i = end;
        } else {
            if i + 2 >= data.len() {
                break;
            }
            let distance = u16::from_le_bytes([data[i], data[i + 1]]) as usize;
            let length = data[i + 2] as usize + tag as usize;
            i += 3;
            if distance == 0 || distance > out.len() {
                return Err(FwError::DecoderFailed(
                    "bcl",
                    "back-reference past start of output".into(),
                ));
            }
            let start = out.len() - distance;
            for j in 0..length {
                let byte = out[start + j];
                out.push(byte);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(algo: u8, compressed_size: u32, outsize: u32) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&MAGIC.to_le_bytes());
        v.push(algo);
        v.extend_from_slice(&[0, 0, 0]);
        v.extend_from_slice(&compressed_size.to_le_bytes());
        v.extend_from_slice(&outsize.to_le_bytes());
        v
    }

    #[test]
    fn rle_round_trip() {
        // 3x 'a', literal 'b', 2x 'c'
        let payload = [3u8, b'a', 0u8, b'b', 2u8, b'c'];
        let mut bytes = header_bytes(1, payload.len() as u32, 6);
        bytes.extend_from_slice(&payload);
        let out = decompress(&bytes).unwrap();
        assert_eq!(out, b"aaabcc");
    }

    #[test]
    fn rejects_truncated_header() {
        assert!(matches!(
            parse_header(&[0u8; 4]),
            Err(FwError::Truncated("bcl header"))
        ));
    }

    #[test]
    fn ignores_trailing_ff_padding() {
        let payload = [3u8, b'x', 0u8, b'y'];
        let mut bytes = header_bytes(1, payload.len() as u32, 4);
        bytes.extend_from_slice(&payload);
        bytes.extend_from_slice(&[0xFF, 0xFF, 0xFF]); // padding beyond compressed_size
        let out = decompress(&bytes).unwrap();
        assert_eq!(out, b"xxxy");
    }
}
