//! The flattened-device-tree (FDT) header: big-endian, version 17,
//! last-compatible 16. Two FDTs may be present in a firmware; the façade
//! keeps the first one whose `model` property is non-empty.

use crate::error::{FwError, Result};
use byteorder::{BigEndian, ReadBytesExt};
use regex::bytes::Regex;
use std::io::Cursor;
use std::sync::OnceLock;

pub const MAGIC: u32 = 0xD00D_FEED;
pub const HEADER_LEN: usize = 40;
pub const EXPECTED_VERSION: u32 = 17;
pub const EXPECTED_LAST_COMP_VERSION: u32 = 16;

#[derive(Debug, Clone, Copy)]
pub struct FdtHeader {
    pub magic: u32,
    pub total_size: u32,
    pub off_dt_struct: u32,
    pub off_dt_strings: u32,
    pub off_mem_rsvmap: u32,
    pub version: u32,
    pub last_comp_version: u32,
    pub boot_cpuid_phys: u32,
    pub size_dt_strings: u32,
    pub size_dt_struct: u32,
}

pub fn parse(bytes: &[u8]) -> Result<FdtHeader> {
    if bytes.len() < HEADER_LEN {
        return Err(FwError::Truncated("fdt header"));
    }
    let mut c = Cursor::new(bytes);
    let magic = c.read_u32::<BigEndian>().unwrap();
    if magic != MAGIC {
        return Err(FwError::BadMagic("fdt header"));
    }
    let total_size = c.read_u32::<BigEndian>().unwrap();
    let off_dt_struct = c.read_u32::<BigEndian>().unwrap();
    let off_dt_strings = c.read_u32::<BigEndian>().unwrap();
    let off_mem_rsvmap = c.read_u32::<BigEndian>().unwrap();
    let version = c.read_u32::<BigEndian>().unwrap();
    let last_comp_version = c.read_u32::<BigEndian>().unwrap();
    let boot_cpuid_phys = c.read_u32::<BigEndian>().unwrap();
    let size_dt_strings = c.read_u32::<BigEndian>().unwrap();
    let size_dt_struct = c.read_u32::<BigEndian>().unwrap();
    if version != EXPECTED_VERSION || last_comp_version != EXPECTED_LAST_COMP_VERSION {
        return Err(FwError::BadMagic("fdt header (version mismatch)"));
    }
    Ok(FdtHeader {
        magic,
        total_size,
        off_dt_struct,
        off_dt_strings,
        off_mem_rsvmap,
        version,
        last_comp_version,
        boot_cpuid_phys,
        size_dt_strings,
        size_dt_struct,
    })
}

fn fdt_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)\xD0\x0D\xFE\xED.{16}\x00{3}\x11\x00{3}\x10.{12}").unwrap()
    })
}

/// Locate every byte offset in `haystack` that looks like the start of a
/// version-17 FDT header (magic + version/last-comp-version pinned), in
/// the order they occur.
pub fn find_candidates(haystack: &[u8]) -> Vec<usize> {
    fdt_regex()
        .find_iter(haystack)
        .map(|m| m.start())
        .collect()
}

/// Walk the FDT's flattened struct block for a top-level `model` property,
/// returning its string value. This is a minimal walk: it does not build a
/// full tree, just enough to find `model` under the root node.
pub fn find_model(bytes: &[u8], header: &FdtHeader) -> Option<String> {
    const FDT_BEGIN_NODE: u32 = 0x1;
    const FDT_END_NODE: u32 = 0x2;
    const FDT_PROP: u32 = 0x3;
    const FDT_NOP: u32 = 0x4;
    const FDT_END: u32 = 0x9;

    let struct_start = header.off_dt_struct as usize;
    let struct_end = struct_start + header.size_dt_struct as usize;
    let strings_start = header.off_dt_strings as usize;
    let strings = bytes.get(strings_start..strings_start + header.size_dt_strings as usize)?;
    let struct_block = bytes.get(struct_start..struct_end)?;

    let mut pos = 0usize;
    while pos + 4 <= struct_block.len() {
        let tag = u32::from_be_bytes(struct_block[pos..pos + 4].try_into().ok()?);
        pos += 4;
        match tag {
            t if t == FDT_BEGIN_NODE => {
                // NUL-terminated name, padded to 4 bytes.
                let name_start = pos;
                let name_end = struct_block[name_start..]
                    .iter()
                    .position(|&b| b == 0)
                    .map(|i| name_start + i)?;
                pos = align4(name_end + 1);
            }
            t if t == FDT_END_NODE || t == FDT_NOP => {}
            t if t == FDT_PROP => {
                let len = u32::from_be_bytes(struct_block.get(pos..pos + 4)?.try_into().ok()?)
                    as usize;
                pos += 4;
                let nameoff =
                    u32::from_be_bytes(struct_block.get(pos..pos + 4)?.try_into().ok()?) as usize;
                pos += 4;
                let value = struct_block.get(pos..pos + len)?;
                pos = align4(pos + len);

                let name_end = strings[nameoff..].iter().position(|&b| b == 0)?;
                let prop_name = &strings[nameoff..nameoff + name_end];
                if prop_name == b"model" {
                    let value_end = value.iter().position(|&b| b == 0).unwrap_or(value.len());
                    let model = String::from_utf8_lossy(&value[..value_end]).to_string();
                    if !model.is_empty() {
                        return Some(model);
                    }
                }
            }
            t if t == FDT_END => break,
            _ => break,
        }
    }
    None
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Walk the FDT's flattened struct block for a named top-level property
/// under the root node, the same minimal walk [`find_model`] does.
pub fn find_property(bytes: &[u8], header: &FdtHeader, prop: &str) -> Option<String> {
    const FDT_BEGIN_NODE: u32 = 0x1;
    const FDT_END_NODE: u32 = 0x2;
    const FDT_PROP: u32 = 0x3;
    const FDT_NOP: u32 = 0x4;
    const FDT_END: u32 = 0x9;

    let struct_start = header.off_dt_struct as usize;
    let struct_end = struct_start + header.size_dt_struct as usize;
    let strings_start = header.off_dt_strings as usize;
    let strings = bytes.get(strings_start..strings_start + header.size_dt_strings as usize)?;
    let struct_block = bytes.get(struct_start..struct_end)?;

    let mut pos = 0usize;
    while pos + 4 <= struct_block.len() {
        let tag = u32::from_be_bytes(struct_block[pos..pos + 4].try_into().ok()?);
        pos += 4;
        match tag {
            t if t == FDT_BEGIN_NODE => {
                let name_start = pos;
                let name_end = struct_block[name_start..]
                    .iter()
                    .position(|&b| b == 0)
                    .map(|i| name_start + i)?;
                pos = align4(name_end + 1);
            }
            t if t == FDT_END_NODE || t == FDT_NOP => {}
            t if t == FDT_PROP => {
                let len = u32::from_be_bytes(struct_block.get(pos..pos + 4)?.try_into().ok()?)
                    as usize;
                pos += 4;
                let nameoff =
                    u32::from_be_bytes(struct_block.get(pos..pos + 4)?.try_into().ok()?) as usize;
                pos += 4;
                let value = struct_block.get(pos..pos + len)?;
                pos = align4(pos + len);

                let name_end = strings[nameoff..].iter().position(|&b| b == 0)?;
                let prop_name = &strings[nameoff..nameoff + name_end];
                if prop_name == prop.as_bytes() {
                    let value_end = value.iter().position(|&b| b == 0).unwrap_or(value.len());
                    let found = String::from_utf8_lossy(&value[..value_end]).to_string();
                    if !found.is_empty() {
                        return Some(found);
                    }
                }
            }
            t if t == FDT_END => break,
            _ => break,
        }
    }
    None
}

/// Render the whole struct block as an indented dts-like text tree (the
/// `camera.dts` extraction deliverable). Property values that decode as a
/// single NUL-terminated printable string are quoted; anything else is
/// rendered as a byte array, matching `dtc`'s own fallback behaviour.
pub fn to_dts_text(bytes: &[u8], header: &FdtHeader) -> Option<String> {
    const FDT_BEGIN_NODE: u32 = 0x1;
    const FDT_END_NODE: u32 = 0x2;
    const FDT_PROP: u32 = 0x3;
    const FDT_NOP: u32 = 0x4;
    const FDT_END: u32 = 0x9;

    let struct_start = header.off_dt_struct as usize;
    let struct_end = struct_start + header.size_dt_struct as usize;
    let strings_start = header.off_dt_strings as usize;
    let strings = bytes.get(strings_start..strings_start + header.size_dt_strings as usize)?;
    let struct_block = bytes.get(struct_start..struct_end)?;

    let mut out = String::from("/dts-v1/;\n\n");
    let mut depth = 0usize;
    let mut pos = 0usize;
    while pos + 4 <= struct_block.len() {
        let tag = u32::from_be_bytes(struct_block[pos..pos + 4].try_into().ok()?);
        pos += 4;
        match tag {
            t if t == FDT_BEGIN_NODE => {
                let name_start = pos;
                let name_end = struct_block[name_start..]
                    .iter()
                    .position(|&b| b == 0)
                    .map(|i| name_start + i)?;
                let name = String::from_utf8_lossy(&struct_block[name_start..name_end]).to_string();
                pos = align4(name_end + 1);
                let label = if name.is_empty() { "/".to_string() } else { name };
                out.push_str(&"\t".repeat(depth));
                out.push_str(&label);
                out.push_str(" {\n");
                depth += 1;
            }
            t if t == FDT_END_NODE => {
                depth = depth.saturating_sub(1);
                out.push_str(&"\t".repeat(depth));
                out.push_str("};\n");
            }
            t if t == FDT_NOP => {}
            t if t == FDT_PROP => {
                let len = u32::from_be_bytes(struct_block.get(pos..pos + 4)?.try_into().ok()?)
                    as usize;
                pos += 4;
                let nameoff =
                    u32::from_be_bytes(struct_block.get(pos..pos + 4)?.try_into().ok()?) as usize;
                pos += 4;
                let value = struct_block.get(pos..pos + len)?;
                pos = align4(pos + len);

                let name_end = strings[nameoff..].iter().position(|&b| b == 0)?;
                let prop_name = String::from_utf8_lossy(&strings[nameoff..nameoff + name_end]);

                out.push_str(&"\t".repeat(depth));
                out.push_str(&prop_name);
                if len == 0 {
                    out.push_str(";\n");
                } else if let Some(text) = as_printable_string(value) {
                    out.push_str(&format!(" = \"{text}\";\n"));
                } else if len % 4 == 0 {
                    let cells: Vec<String> = value
                        .chunks_exact(4)
                        .map(|c| format!("0x{:08x}", u32::from_be_bytes(c.try_into().unwrap())))
                        .collect();
                    out.push_str(&format!(" = <{}>;\n", cells.join(" ")));
                } else {
                    let bytes_str: Vec<String> = value.iter().map(|b| format!("{b:02x}")).collect();
                    out.push_str(&format!(" = [{}];\n", bytes_str.join(" ")));
                }
            }
            t if t == FDT_END => break,
            _ => break,
        }
    }
    Some(out)
}

/// A property decodes as a plain string when it is one or more
/// NUL-terminated printable-ASCII runs filling the whole value exactly.
fn as_printable_string(value: &[u8]) -> Option<String> {
    if value.last() != Some(&0) {
        return None;
    }
    let body = &value[..value.len() - 1];
    if body.is_empty() || body.contains(&0) {
        return None;
    }
    if !body.iter().all(|&b| b.is_ascii_graphic() || b == b' ') {
        return None;
    }
    Some(String::from_utf8_lossy(body).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(struct_off: u32, struct_size: u32, strings_off: u32, strings_size: u32) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&MAGIC.to_be_bytes());
        v.extend_from_slice(&0u32.to_be_bytes()); // total_size, unused in test
        v.extend_from_slice(&struct_off.to_be_bytes());
        v.extend_from_slice(&strings_off.to_be_bytes());
        v.extend_from_slice(&0u32.to_be_bytes()); // off_mem_rsvmap
        v.extend_from_slice(&EXPECTED_VERSION.to_be_bytes());
        v.extend_from_slice(&EXPECTED_LAST_COMP_VERSION.to_be_bytes());
        v.extend_from_slice(&0u32.to_be_bytes()); // boot_cpuid_phys
        v.extend_from_slice(&strings_size.to_be_bytes());
        v.extend_from_slice(&struct_size.to_be_bytes());
        v
    }

    #[test]
    fn rejects_wrong_version() {
        let mut bytes = header_bytes(40, 0, 40, 0);
        bytes[20..24].copy_from_slice(&99u32.to_be_bytes()); // version
        assert!(matches!(parse(&bytes), Err(FwError::BadMagic(_))));
    }

    #[test]
    fn finds_model_property_in_struct_block() {
        let strings = b"model\0compatible\0";
        let strings_off = 40;
        let strings_size = strings.len() as u32;

        let mut structb = Vec::new();
        structb.extend_from_slice(&1u32.to_be_bytes()); // FDT_BEGIN_NODE
        structb.extend_from_slice(b"\0\0\0\0"); // root node name "" + pad
        structb.extend_from_slice(&3u32.to_be_bytes()); // FDT_PROP
        let value = b"IPC-1234\0";
        structb.extend_from_slice(&(value.len() as u32).to_be_bytes());
        structb.extend_from_slice(&0u32.to_be_bytes()); // nameoff -> "model"
        structb.extend_from_slice(value);
        while structb.len() % 4 != 0 {
            structb.push(0);
        }
        structb.extend_from_slice(&9u32.to_be_bytes()); // FDT_END

        let struct_off = strings_off + strings.len() as u32;
        let hdr_bytes = header_bytes(struct_off, structb.len() as u32, strings_off, strings_size);

        let mut image = vec![0u8; strings_off as usize];
        image.extend_from_slice(strings);
        image.extend_from_slice(&structb);

        let header = parse(&hdr_bytes).unwrap();
        assert_eq!(find_model(&image, &header).as_deref(), Some("IPC-1234"));
    }

    #[test]
    fn renders_dts_text_with_nested_node_and_string_property() {
        let strings = b"model\0";
        let strings_off = 40;
        let strings_size = strings.len() as u32;

        let mut structb = Vec::new();
        structb.extend_from_slice(&1u32.to_be_bytes()); // root FDT_BEGIN_NODE
        structb.extend_from_slice(b"\0\0\0\0"); // root name "" + pad
        structb.extend_from_slice(&3u32.to_be_bytes()); // FDT_PROP
        let value = b"IPC-1234\0";
        structb.extend_from_slice(&(value.len() as u32).to_be_bytes());
        structb.extend_from_slice(&0u32.to_be_bytes()); // nameoff -> "model"
        structb.extend_from_slice(value);
        while structb.len() % 4 != 0 {
            structb.push(0);
        }
        structb.extend_from_slice(&1u32.to_be_bytes()); // child FDT_BEGIN_NODE
        structb.extend_from_slice(b"soc\0");
        structb.extend_from_slice(&2u32.to_be_bytes()); // FDT_END_NODE (child)
        structb.extend_from_slice(&2u32.to_be_bytes()); // FDT_END_NODE (root)
        structb.extend_from_slice(&9u32.to_be_bytes()); // FDT_END

        let struct_off = strings_off + strings.len() as u32;
        let hdr_bytes = header_bytes(struct_off, structb.len() as u32, strings_off, strings_size);

        let mut image = vec![0u8; strings_off as usize];
        image.extend_from_slice(strings);
        image.extend_from_slice(&structb);

        let header = parse(&hdr_bytes).unwrap();
        let text = to_dts_text(&image, &header).unwrap();
        assert!(text.starts_with("/dts-v1/;\n"));
        assert!(text.contains("model = \"IPC-1234\";"));
        assert!(text.contains("soc {"));
        assert!(text.contains("};"));
    }
}
