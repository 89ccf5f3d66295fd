//! UBI — the erase-block management layer over raw flash. This module
//! scans a UBI image for physical erase blocks (PEBs), infers the erase
//! block size, groups PEBs by volume, and reassembles each volume's
//! logical erase blocks (LEBs) into one contiguous, randomly-readable
//! buffer for the UBIFS reader to walk.

use crate::error::{FwError, Result};
use crate::tmpfile::ScopedTempFile;
use byteorder::{BigEndian, ReadBytesExt};
use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom, Write};

pub const EC_HDR_MAGIC: [u8; 4] = *b"UBI#";
pub const VID_HDR_MAGIC: [u8; 4] = *b"UBI!";
pub const EC_HDR_SIZE: usize = 64;
pub const VID_HDR_SIZE: usize = 64;
pub const VTBL_RECORD_SIZE: usize = 172;
pub const LAYOUT_VOLUME_ID: u32 = 0x7fff_efff;

/// Erase-block sizes this family of devices is observed to use; used only
/// as a last-resort fallback when the image is too short to infer a
/// modal distance between erase-counter headers.
const FALLBACK_PEB_SIZE: u32 = 128 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct EcHeader {
    pub erase_count: u64,
    pub vid_hdr_offset: u32,
    pub data_offset: u32,
}

fn parse_ec_header(bytes: &[u8]) -> Result<EcHeader> {
    if bytes.len() < EC_HDR_SIZE || bytes[..4] != EC_HDR_MAGIC {
        return Err(FwError::BadMagic("ubi ec header"));
    }
    let mut c = std::io::Cursor::new(bytes);
    c.set_position(4);
    let _version = c.read_u8().unwrap();
    c.set_position(8);
    let erase_count = c.read_u64::<BigEndian>().unwrap();
    let vid_hdr_offset = c.read_u32::<BigEndian>().unwrap();
    let data_offset = c.read_u32::<BigEndian>().unwrap();
    Ok(EcHeader {
        erase_count,
        vid_hdr_offset,
        data_offset,
    })
}

#[derive(Debug, Clone, Copy)]
pub struct VidHeader {
    pub vol_id: u32,
    pub lnum: u32,
    pub data_size: u32,
}

fn parse_vid_header(bytes: &[u8]) -> Option<VidHeader> {
    if bytes.len() < VID_HDR_SIZE || bytes[..4] != VID_HDR_MAGIC {
        return None;
    }
    let mut c = std::io::Cursor::new(bytes);
    c.set_position(8);
    let vol_id = c.read_u32::<BigEndian>().ok()?;
    let lnum = c.read_u32::<BigEndian>().ok()?;
    c.set_position(24);
    let data_size = c.read_u32::<BigEndian>().ok()?;
    Some(VidHeader {
        vol_id,
        lnum,
        data_size,
    })
}

/// Scan the first few megabytes of `bytes` for repeated `UBI#` erase
/// counter headers; the erase block size is the modal distance between
/// consecutive occurrences (`guess_peb_size`, per spec §4.5/§9).
pub fn guess_peb_size(bytes: &[u8]) -> u32 {
    let scan_limit = bytes.len().min(16 * 1024 * 1024);
    let haystack = &bytes[..scan_limit];
    let mut offsets = Vec::new();
    let mut i = 0;
    while i + 4 <= haystack.len() {
        if haystack[i..i + 4] == EC_HDR_MAGIC {
            offsets.push(i);
            i += 4096.max(1); // EC headers are never closer than a few KiB apart
        } else {
            i += 1;
        }
    }
    if offsets.len() < 2 {
        return FALLBACK_PEB_SIZE;
    }
    let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
    for w in offsets.windows(2) {
        let diff = w[1] - w[0];
        *counts.entry(diff).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(diff, _)| diff as u32)
        .unwrap_or(FALLBACK_PEB_SIZE)
}

struct Peb {
    index: usize,
    ec: EcHeader,
    vid: VidHeader,
}

/// One UBI volume: its id, optional name (from the layout volume's volume
/// table, when present), the LEB size used to lay it out, and a scratch
/// file holding its reassembled contiguous bytes.
pub struct Volume {
    pub id: u32,
    pub name: Option<String>,
    pub leb_size: u32,
    buffer: ScopedTempFile,
    pub len: u64,
}

impl Volume {
    /// Wrap already-contiguous bytes (a bare UBIFS image with no UBI
    /// erase-block wrapper around it) as a single-volume view, skipping
    /// PEB scanning entirely.
    pub fn from_raw(leb_size: u32, bytes: &[u8]) -> Result<Volume> {
        let buffer = ScopedTempFile::from_bytes(bytes)?;
        Ok(Volume {
            id: 0,
            name: None,
            leb_size,
            buffer,
            len: bytes.len() as u64,
        })
    }

    pub fn reader(&mut self) -> &mut ScopedTempFile {
        &mut self.buffer
    }

    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        self.buffer.seek(SeekFrom::Start(0))?;
        let mut out = Vec::new();
        self.buffer.read_to_end(&mut out)?;
        Ok(out)
    }

    pub fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.buffer.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        self.buffer.read_exact(&mut buf)?;
        Ok(buf)
    }
}

pub struct UbiImage {
    pub peb_size: u32,
    pebs: Vec<Peb>,
    volume_names: BTreeMap<u32, String>,
}

impl UbiImage {
    /// Scan `bytes` (a whole UBI section) into an index of PEBs grouped by
    /// volume, inferring the erase block size first.
    pub fn scan(bytes: &[u8]) -> Result<UbiImage> {
        let peb_size = guess_peb_size(bytes);
        let mut pebs = Vec::new();
        let mut index = 0;
        let mut offset = 0usize;
        while offset + EC_HDR_SIZE <= bytes.len() {
            let peb_bytes = &bytes[offset..];
            if let Ok(ec) = parse_ec_header(peb_bytes) {
                let vid_start = ec.vid_hdr_offset as usize;
                if let Some(vid_bytes) = peb_bytes.get(vid_start..) {
                    if let Some(vid) = parse_vid_header(vid_bytes) {
                        pebs.push(Peb { index, ec, vid });
                    }
                }
            }
            offset += peb_size as usize;
            index += 1;
        }
        if pebs.is_empty() {
            return Err(FwError::DecoderFailed(
                "ubi",
                "no erase blocks with a valid volume identifier header found".into(),
            ));
        }
        let volume_names = Self::read_volume_table(bytes, peb_size, &pebs);
        Ok(UbiImage {
            peb_size,
            pebs,
            volume_names,
        })
    }

    fn read_volume_table(bytes: &[u8], peb_size: u32, pebs: &[Peb]) -> BTreeMap<u32, String> {
        let mut names = BTreeMap::new();
        let layout_pebs: Vec<&Peb> = pebs
            .iter()
            .filter(|p| p.vid.vol_id == LAYOUT_VOLUME_ID)
            .collect();
        let Some(peb) = layout_pebs.first() else {
            return names;
        };
        let data_start = peb.index * peb_size as usize + peb.ec.data_offset as usize;
        let Some(table) = bytes.get(data_start..) else {
            return names;
        };
        let mut pos = 0;
        while pos + VTBL_RECORD_SIZE <= table.len() {
            let record = &table[pos..pos + VTBL_RECORD_SIZE];
            pos += VTBL_RECORD_SIZE;
            let name_len = u16::from_be_bytes([record[12], record[13]]) as usize;
            if name_len == 0 || name_len > 127 {
                continue;
            }
            let name_bytes = &record[14..14 + name_len];
            if let Ok(name) = std::str::from_utf8(name_bytes) {
                let vol_id = (names.len()) as u32; // record position == volume id, see below
                names.insert(vol_id, name.to_string());
            }
        }
        names
    }

    pub fn volume_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .pebs
            .iter()
            .map(|p| p.vid.vol_id)
            .filter(|id| *id != LAYOUT_VOLUME_ID)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Reassemble the volume named `name` if present, else the volume with
    /// lowest id (the original's `popitem()`/`images[0]` behaviour, which
    /// in practice picks whichever single data volume exists).
    pub fn reassemble(&self, bytes: &[u8], name: Option<&str>) -> Result<Volume> {
        let target_id = if let Some(name) = name {
            self.volume_names
                .iter()
                .find(|(_, n)| n.as_str() == name)
                .map(|(id, _)| *id)
                .or_else(|| self.volume_ids().into_iter().next())
        } else {
            self.volume_ids().into_iter().next()
        };
        let Some(target_id) = target_id else {
            return Err(FwError::DecoderFailed(
                "ubi",
                "no data volume found".into(),
            ));
        };

        let mut blocks: Vec<&Peb> = self
            .pebs
            .iter()
            .filter(|p| p.vid.vol_id == target_id)
            .collect();
        blocks.sort_by_key(|p| p.vid.lnum);

        let leb_size = self.peb_size
            - blocks
                .first()
                .map(|p| p.ec.data_offset)
                .unwrap_or(0);

        let mut scratch = ScopedTempFile::from_bytes(&[])?;
        let mut total: u64 = 0;
        for peb in &blocks {
            let data_start = peb.index * self.peb_size as usize + peb.ec.data_offset as usize;
            let data_len = leb_size as usize;
            let data = bytes
                .get(data_start..data_start + data_len)
                .ok_or(FwError::Truncated("ubi leb data"))?;
            scratch.as_file_mut().write_all(data)?;
            total += data.len() as u64;
        }
        scratch.as_file_mut().seek(SeekFrom::Start(0))?;

        Ok(Volume {
            id: target_id,
            name: self.volume_names.get(&target_id).cloned(),
            leb_size,
            buffer: scratch,
            len: total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peb(peb_size: usize, vol_id: u32, lnum: u32, data: &[u8]) -> Vec<u8> {
        let vid_hdr_offset = 64u32;
        let data_offset = 128u32;
        let mut buf = vec![0u8; peb_size];
        buf[..4].copy_from_slice(&EC_HDR_MAGIC);
        buf[4] = 1; // version
        buf[8..16].copy_from_slice(&0u64.to_be_bytes()); // erase_count
        buf[16..20].copy_from_slice(&vid_hdr_offset.to_be_bytes());
        buf[20..24].copy_from_slice(&data_offset.to_be_bytes());

        let vid_start = vid_hdr_offset as usize;
        buf[vid_start..vid_start + 4].copy_from_slice(&VID_HDR_MAGIC);
        buf[vid_start + 8..vid_start + 12].copy_from_slice(&vol_id.to_be_bytes());
        buf[vid_start + 12..vid_start + 16].copy_from_slice(&lnum.to_be_bytes());
        buf[vid_start + 24..vid_start + 28].copy_from_slice(&(data.len() as u32).to_be_bytes());

        let data_start = data_offset as usize;
        buf[data_start..data_start + data.len()].copy_from_slice(data);
        buf
    }

    #[test]
    fn guesses_peb_size_from_modal_spacing() {
        let peb_size = 4096usize;
        let mut image = Vec::new();
        for lnum in 0..4 {
            image.extend(peb(peb_size, 1, lnum, b"x"));
        }
        assert_eq!(guess_peb_size(&image), peb_size as u32);
    }

    #[test]
    fn reassembles_single_volume_in_lnum_order() {
        let peb_size = 4096usize;
        let mut image = Vec::new();
        // Out of order on disk; reassembly must sort by lnum.
        image.extend(peb(peb_size, 5, 1, b"SECOND..........................."));
        image.extend(peb(peb_size, 5, 0, b"FIRST............................"));

        let ubi = UbiImage::scan(&image).unwrap();
        let mut vol = ubi.reassemble(&image, None).unwrap();
        let leb_size = vol.leb_size as usize;
        let all = vol.read_all().unwrap();
        assert!(all[..5].starts_with(b"FIRST"));
        assert!(all[leb_size..leb_size + 6].starts_with(b"SECOND"));
    }
}
