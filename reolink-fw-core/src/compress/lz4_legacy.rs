//! The legacy LZ4 "frame" format used to compress these devices' kernel
//! images: magic `02 21 4C 18`, then repeating `{u32 block_size, block_size
//! bytes}` records, each block independently LZ4-compressed (raw block
//! format, no frame headers).
//!
//! The original decodes blocks until the next `size` field no longer looks
//! like a real block header — in practice this manifests either as a
//! trailing run of zero bytes or a size that would overrun the input. We
//! follow the rule in the spec: stop once the next declared block size
//! equals the number of bytes already decompressed (the value then serves
//! as a terminator rather than a length).

use crate::error::{FwError, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

pub const MAGIC: [u8; 4] = [0x02, 0x21, 0x4C, 0x18];

/// Size of the scratch buffer each block is decompressed into.
const BLOCK_DECOMPRESS_CAP: usize = 8 * 1024 * 1024;

pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    if bytes.len() < 4 || bytes[..4] != MAGIC {
        return Err(FwError::BadMagic("lz4 legacy frame"));
    }
    let mut c = Cursor::new(&bytes[4..]);
    let mut out = Vec::new();

    loop {
        let block_size = match c.read_u32::<LittleEndian>() {
            Ok(n) => n as usize,
            Err(_) => break, // ran out of header quadruplets: done.
        };
        // The terminator rule from the spec: once the declared size equals
        // what we've already produced, the stream is over.
        if block_size == out.len() {
            break;
        }
        if block_size == 0 || block_size > BLOCK_DECOMPRESS_CAP {
            break;
        }
        let start = c.position() as usize;
        let end = start + block_size;
        let block = bytes[4..]
            .get(start..end)
            .ok_or(FwError::Truncated("lz4 legacy block"))?;
        let decompressed = decompress_block(block, BLOCK_DECOMPRESS_CAP)?;
        out.extend_from_slice(&decompressed);
        c.set_position(end as u64);
    }

    Ok(out)
}

/// Decompress one raw LZ4 block (no frame, no checksum): a sequence of
/// `(token, literals, [offset, match])` sequences as specified by the LZ4
/// block format.
fn decompress_block(block: &[u8], cap: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut i = 0usize;
    while i < block.len() {
        let token = block[i];
        i += 1;
        let mut literal_len = (token >> 4) as usize;
        if literal_len == 15 {
            loop {
                let b = *block
                    .get(i)
                    .ok_or(FwError::Truncated("lz4 literal length"))?;
                i += 1;
                literal_len += b as usize;
                if b != 255 {
                    break;
                }
            }
        }
        let lit_end = i + literal_len;
        let literals = block
            .get(i..lit_end)
            .ok_or(FwError::Truncated("lz4 literals"))?;
        out.extend_from_slice(literals);
        i = lit_end;

        if i >= block.len() {
            break; // last sequence in the block has no match part.
        }

        let offset = u16::from_le_bytes([
            *block.get(i).ok_or(FwError::Truncated("lz4 offset"))?,
            *block.get(i + 1).ok_or(FwError::Truncated("lz4 offset"))?,
        ]) as usize;
        i += 2;
        if offset == 0 || offset > out.len() {
            return Err(FwError::DecoderFailed(
                "lz4-legacy",
                "match offset out of range".into(),
            ));
        }

        let mut match_len = (token & 0x0f) as usize + 4;
        if (token & 0x0f) == 15 {
            loop {
                let b = *block.get(i).ok_or(FwError::Truncated("lz4 match length"))?;
                i += 1;
                match_len += b as usize;
                if b != 255 {
                    break;
                }
            }
        }

        let start = out.len() - offset;
        for j in 0..match_len {
            let byte = out[start + j];
            out.push(byte);
        }
        if out.len() > cap {
            return Err(FwError::DecoderFailed(
                "lz4-legacy",
                "decompressed block exceeds scratch cap".into(),
            ));
        }
    }
    Ok(out)
}

/// Encode `data` as a minimal single-block legacy LZ4 frame (all literals,
/// no matches). Used only by tests to exercise the round trip the spec's
/// testable properties call for; never used by the decoder itself.
#[cfg(test)]
pub fn encode_legacy_all_literals(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);

    let mut block = Vec::new();
    let mut remaining = data.len();
    let mut pos = 0;
    if remaining < 15 {
        block.push((remaining as u8) << 4);
    } else {
        block.push(0xF0);
        remaining -= 15;
        while remaining >= 255 {
            block.push(255);
            remaining -= 255;
        }
        block.push(remaining as u8);
    }
    let _ = &mut pos;
    block.extend_from_slice(data);

    out.extend_from_slice(&(block.len() as u32).to_le_bytes());
    out.extend_from_slice(&block);
    // Terminator: next quadruplet equals cumulative decompressed length.
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_literals() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(3);
        let encoded = encode_legacy_all_literals(&data);
        let decoded = decompress(&encoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn rejects_bad_magic() {
        assert!(matches!(
            decompress(b"nope"),
            Err(FwError::BadMagic("lz4 legacy frame"))
        ));
    }

    #[test]
    fn empty_after_magic_decodes_to_empty() {
        let out = decompress(&MAGIC).unwrap();
        assert!(out.is_empty());
    }
}
