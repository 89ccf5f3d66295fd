//! The PAK container: the vendor's proprietary archive format wrapping a
//! firmware's boot loader, kernel, device tree, and file-system sections.
//!
//! The header's exact field layout — in particular, the width of the
//! MTD-partition subarray — is not published anywhere; this module commits
//! to one layout (documented in `DESIGN.md`, Open Question #1) and validates
//! every candidate section count against it rather than trusting whichever
//! count merely manages to deserialise.

use crate::byteio::{ByteSource, Window};
use crate::error::{FwError, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use std::sync::Arc;

pub const MAGIC: [u8; 4] = [0x13, 0x59, 0x72, 0x32];

const PREAMBLE_LEN: usize = 12; // magic(4) + hw_id(4) + reserved(4)
const SECTION_NAME_LEN: usize = 24;
const SECTION_DESC_LEN: usize = SECTION_NAME_LEN + 4 + 4 + 4; // name, start, len, reserved
const MTD_NAME_LEN: usize = 24;
const MTD_DESC_LEN: usize = MTD_NAME_LEN + 4 + 4; // name, start, len

/// The logical name sets the façade resolves against actual section names
/// (spec §4.4): first match, in listed order, among sections with nonzero
/// length.
pub const UBOOT_NAMES: &[&str] = &["uboot", "uboot1", "BOOT"];
pub const KERNEL_NAMES: &[&str] = &["kernel", "KERNEL"];
/// Membership set for the rootfs/application sections — *not* a priority
/// order. The façade picks among these by PAK order (`app` always wins
/// when present; see [`Pak::fs_sections`] and spec §4.8 step 3).
pub const FS_NAMES: &[&str] = &["fs", "rootfs", "app"];

/// Bounded linear search order for section-count inference (spec §4.4,
/// §9): the 8-14 band first (it covers every observed firmware), then the
/// small counts, then the long tail.
pub fn candidate_section_counts() -> impl Iterator<Item = u32> {
    (8..14).chain(1..8).chain(14..30)
}

#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub start: u64,
    pub len: u64,
}

#[derive(Debug, Clone)]
pub struct MtdPart {
    pub name: String,
    pub start: u64,
    pub len: u64,
}

#[derive(Debug, Clone)]
pub struct Header {
    pub section_count: u32,
    pub mtd_count: u32,
    pub sections: Vec<Section>,
    pub mtd_parts: Vec<MtdPart>,
}

pub fn header_size(section_count: u32, mtd_count: u32) -> usize {
    PREAMBLE_LEN
        + section_count as usize * SECTION_DESC_LEN
        + mtd_count as usize * MTD_DESC_LEN
}

fn read_name(buf: &[u8]) -> Result<String> {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let raw = &buf[..end];
    if !raw.iter().all(|&b| b.is_ascii_graphic() || b == b' ') {
        return Err(FwError::BadMagic("pak section name (non-ASCII)"));
    }
    Ok(String::from_utf8_lossy(raw).to_string())
}

/// Parse a PAK header assuming `section_count` sections and
/// `mtd_part_count` (default: `section_count`) MTD partitions. Validates
/// every offset/length against `source_len` and every name against ASCII
/// plausibility so that a wrong guess is rejected rather than silently
/// accepted as a corrupt layout (spec §9, Open Question #1).
pub fn parse_header(bytes: &[u8], section_count: u32, mtd_part_count: u32, source_len: u64) -> Result<Header> {
    let needed = header_size(section_count, mtd_part_count);
    if bytes.len() < needed {
        return Err(FwError::Truncated("pak header"));
    }
    if bytes[..4] != MAGIC {
        return Err(FwError::BadMagic("pak"));
    }

    let mut c = Cursor::new(bytes);
    c.set_position(PREAMBLE_LEN as u64);

    let mut sections = Vec::with_capacity(section_count as usize);
    for _ in 0..section_count {
        let mut name_buf = [0u8; SECTION_NAME_LEN];
        c.read_exact(&mut name_buf)
            .map_err(|_| FwError::Truncated("pak section name"))?;
        let name = read_name(&name_buf)?;
        let start = c
            .read_u32::<LittleEndian>()
            .map_err(|_| FwError::Truncated("pak section start"))? as u64;
        let len = c
            .read_u32::<LittleEndian>()
            .map_err(|_| FwError::Truncated("pak section len"))? as u64;
        let _reserved = c.read_u32::<LittleEndian>();
        if len != 0 && start.checked_add(len).map(|e| e > source_len).unwrap_or(true) {
            return Err(FwError::BadMagic("pak section out of bounds"));
        }
        sections.push(Section { name, start, len });
    }

    let mut mtd_parts = Vec::with_capacity(mtd_part_count as usize);
    for _ in 0..mtd_part_count {
        let mut name_buf = [0u8; MTD_NAME_LEN];
        c.read_exact(&mut name_buf)
            .map_err(|_| FwError::Truncated("pak mtd name"))?;
        let name = read_name(&name_buf)?;
        let start = c
            .read_u32::<LittleEndian>()
            .map_err(|_| FwError::Truncated("pak mtd start"))? as u64;
        let len = c
            .read_u32::<LittleEndian>()
            .map_err(|_| FwError::Truncated("pak mtd len"))? as u64;
        mtd_parts.push(MtdPart { name, start, len });
    }

    let mut seen_names = std::collections::HashSet::new();
    for s in &sections {
        if !s.name.is_empty() && s.len != 0 && !seen_names.insert(s.name.clone()) {
            return Err(FwError::BadMagic("pak duplicate section name"));
        }
    }

    Ok(Header {
        section_count,
        mtd_count: mtd_part_count,
        sections,
        mtd_parts,
    })
}

/// Try every candidate section count in the pinned probe order, returning
/// the first one that parses into a structurally consistent header.
pub fn guess_section_count(bytes: &[u8], source_len: u64) -> Option<(u32, Header)> {
    for count in candidate_section_counts() {
        if let Ok(header) = parse_header(bytes, count, count, source_len) {
            return Some((count, header));
        }
    }
    None
}

/// A parsed PAK archive bound to a byte source. Holds one `Arc` reference
/// to the source for as long as the `Pak` lives; section windows hold
/// their own clone so the source outlives the `Pak` if a window escapes it.
pub struct Pak {
    source: Arc<dyn ByteSource>,
    pub header: Header,
}

impl Pak {
    pub fn open(source: Arc<dyn ByteSource>) -> Result<Pak> {
        let len = source.len();
        let probe_len = len.min(4096) as usize;
        let mut probe = vec![0u8; probe_len];
        source.read_at(0, &mut probe)?;
        if probe.len() < 4 || probe[..4] != MAGIC {
            return Err(FwError::BadMagic("pak"));
        }

        // Candidate headers can be larger than the initial probe window;
        // grow it on demand up to the full source length.
        let mut bytes = probe;
        let (_, header) = loop {
            if let Some(found) = guess_section_count(&bytes, len) {
                break found;
            }
            if bytes.len() as u64 >= len {
                return Err(FwError::BadMagic("pak (no section count guess parsed)"));
            }
            let grown = (bytes.len() as u64 * 2).min(len) as usize;
            let mut grown_buf = vec![0u8; grown];
            source.read_at(0, &mut grown_buf)?;
            bytes = grown_buf;
        };

        Ok(Pak { source, header })
    }

    pub fn sections(&self) -> &[Section] {
        &self.header.sections
    }

    pub fn section_by_name(&self, name: &str) -> Option<&Section> {
        self.header
            .sections
            .iter()
            .find(|s| s.name == name && s.len != 0)
    }

    /// Resolve a logical name (e.g. `"uboot"`) against the first matching
    /// real section name in the priority list, skipping zero-length
    /// sections.
    pub fn section_by_logical_name(&self, names: &[&str]) -> Option<&Section> {
        names.iter().find_map(|n| self.section_by_name(n))
    }

    /// Every nonzero-length rootfs/application section (`fs`, `rootfs`,
    /// `app`), in the order the PAK header itself lists them — the order
    /// the façade's application-FS selection (spec §4.8 step 3) depends on.
    pub fn fs_sections(&self) -> Vec<&Section> {
        self.header
            .sections
            .iter()
            .filter(|s| s.len != 0 && FS_NAMES.contains(&s.name.as_str()))
            .collect()
    }

    pub fn open_section(&self, section: &Section) -> Window {
        Window::new(Arc::clone(&self.source), section.start, section.len)
    }

    pub fn source(&self) -> &Arc<dyn ByteSource> {
        &self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byteio::MemSource;

    fn build_pak(sections: &[(&str, u32, u32)]) -> Vec<u8> {
        let count = sections.len() as u32;
        let mut body_len = 0u32;
        for (_, _, len) in sections {
            body_len += len;
        }
        let total = header_size(count, count) as u32 + body_len;

        let mut v = vec![0u8; PREAMBLE_LEN];
        v[..4].copy_from_slice(&MAGIC);

        let mut data_cursor = header_size(count, count) as u32;
        let mut descriptors = Vec::new();
        let mut payload = Vec::new();
        for (name, _unused, len) in sections {
            let mut name_buf = [0u8; SECTION_NAME_LEN];
            name_buf[..name.len()].copy_from_slice(name.as_bytes());
            descriptors.extend_from_slice(&name_buf);
            descriptors.extend_from_slice(&data_cursor.to_le_bytes());
            descriptors.extend_from_slice(&len.to_le_bytes());
            descriptors.extend_from_slice(&0u32.to_le_bytes());
            payload.extend(std::iter::repeat(0xABu8).take(*len as usize));
            data_cursor += len;
        }
        v.extend_from_slice(&descriptors);
        // mtd table (same count, all zero-length/empty names)
        for _ in 0..count {
            v.extend_from_slice(&[0u8; MTD_NAME_LEN]);
            v.extend_from_slice(&0u32.to_le_bytes());
            v.extend_from_slice(&0u32.to_le_bytes());
        }
        v.extend_from_slice(&payload);
        assert_eq!(v.len() as u32, total);
        v
    }

    #[test]
    fn guesses_section_count_and_opens_sections() {
        let bytes = build_pak(&[("uboot", 0, 16), ("kernel", 0, 32), ("fs", 0, 64)]);
        let len = bytes.len() as u64;
        let source: Arc<dyn ByteSource> = Arc::new(MemSource::new(bytes));
        let pak = Pak::open(source).unwrap();
        assert_eq!(pak.header.section_count, 3);
        let kernel = pak.section_by_logical_name(KERNEL_NAMES).unwrap();
        assert_eq!(kernel.len, 32);
        let mut w = pak.open_section(kernel);
        let content = w.read_to_end().unwrap();
        assert_eq!(content, vec![0xABu8; 32]);
        let _ = len;
    }

    #[test]
    fn fs_sections_preserves_pak_order_and_skips_empty() {
        let bytes = build_pak(&[
            ("uboot", 0, 4),
            ("kernel", 0, 8),
            ("rootfs", 0, 16),
            ("app", 0, 32),
            ("fdt", 0, 0), // zero-length, must be excluded everywhere
        ]);
        let source: Arc<dyn ByteSource> = Arc::new(MemSource::new(bytes));
        let pak = Pak::open(source).unwrap();
        let names: Vec<&str> = pak.fs_sections().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["rootfs", "app"]);
    }

    #[test]
    fn section_count_is_stable_across_reopens() {
        let bytes = build_pak(&[("uboot", 0, 4), ("kernel", 0, 8)]);
        let source: Arc<dyn ByteSource> = Arc::new(MemSource::new(bytes));
        let a = Pak::open(Arc::clone(&source)).unwrap();
        let b = Pak::open(source).unwrap();
        assert_eq!(a.header.section_count, b.header.section_count);
    }

    #[test]
    fn rejects_non_pak_bytes() {
        let source: Arc<dyn ByteSource> = Arc::new(MemSource::new(vec![0u8; 64]));
        assert!(matches!(Pak::open(source), Err(FwError::BadMagic(_))));
    }
}
