//! The 64-byte big-endian legacy U-Boot image header, used for both the
//! U-Boot and kernel sections on some firmware variants.

use crate::error::{FwError, Result};
use byteorder::{BigEndian, ReadBytesExt};
use std::io::Cursor;

pub const MAGIC: u32 = 0x2705_1956;
pub const HEADER_LEN: usize = 64;
const NAME_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Arm,
    Mips,
    Arm64,
    Unknown(u8),
}

impl Arch {
    fn from_byte(b: u8) -> Arch {
        match b {
            2 => Arch::Arm,
            5 => Arch::Mips,
            22 => Arch::Arm64,
            other => Arch::Unknown(other),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Arch::Arm => "ARM",
            Arch::Mips => "MIPS",
            Arch::Arm64 => "AArch64",
            Arch::Unknown(_) => "Unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Os {
    Linux,
    Unknown(u8),
}

impl Os {
    fn from_byte(b: u8) -> Os {
        match b {
            5 => Os::Linux,
            other => Os::Unknown(other),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Os::Linux => "Linux",
            Os::Unknown(_) => "Unknown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LegacyImageHeader {
    pub magic: u32,
    pub header_crc: u32,
    pub timestamp: u32,
    pub data_size: u32,
    pub load_addr: u32,
    pub entry_point: u32,
    pub data_crc: u32,
    pub os: Os,
    pub arch: Arch,
    pub image_type: u8,
    pub compression: u8,
    pub name: String,
}

pub fn parse(bytes: &[u8]) -> Result<LegacyImageHeader> {
    if bytes.len() < HEADER_LEN {
        return Err(FwError::Truncated("uimage header"));
    }
    let mut c = Cursor::new(bytes);
    let magic = c.read_u32::<BigEndian>().unwrap();
    if magic != MAGIC {
        return Err(FwError::BadMagic("uimage header"));
    }
    let header_crc = c.read_u32::<BigEndian>().unwrap();
    let timestamp = c.read_u32::<BigEndian>().unwrap();
    let data_size = c.read_u32::<BigEndian>().unwrap();
    let load_addr = c.read_u32::<BigEndian>().unwrap();
    let entry_point = c.read_u32::<BigEndian>().unwrap();
    let data_crc = c.read_u32::<BigEndian>().unwrap();
    let os = Os::from_byte(c.read_u8().unwrap());
    let arch = Arch::from_byte(c.read_u8().unwrap());
    let image_type = c.read_u8().unwrap();
    let compression = c.read_u8().unwrap();
    let mut name_bytes = [0u8; NAME_LEN];
    c.read_exact(&mut name_bytes)
        .map_err(|_| FwError::Truncated("uimage header name"))?;
    let end = name_bytes.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
    let name = String::from_utf8_lossy(&name_bytes[..end]).to_string();

    Ok(LegacyImageHeader {
        magic,
        header_crc,
        timestamp,
        data_size,
        load_addr,
        entry_point,
        data_crc,
        os,
        arch,
        image_type,
        compression,
        name,
    })
}

/// The MStar/SigmaStar U-Boot variant wraps its payload in a legacy image
/// header with OS byte `0x11` and type byte `0x02` — neither a real OS nor
/// a real image type, just this vendor's marker for "LZMA-compressed
/// U-Boot blob follows".
pub fn is_mstar_wrapped(bytes: &[u8]) -> bool {
    bytes.len() >= HEADER_LEN && bytes[4 + 4 * 6] == 0x11 && bytes[4 + 4 * 6 + 2] == 0x02
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header(os: u8, arch: u8, name: &str) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&MAGIC.to_be_bytes());
        for _ in 0..6 {
            v.extend_from_slice(&0u32.to_be_bytes());
        }
        v.push(os);
        v.push(arch);
        v.push(0); // type
        v.push(0); // compression
        let mut name_bytes = [0u8; NAME_LEN];
        name_bytes[..name.len()].copy_from_slice(name.as_bytes());
        v.extend_from_slice(&name_bytes);
        v
    }

    #[test]
    fn parses_arch_and_os() {
        let h = parse(&sample_header(5, 2, "Linux Kernel")).unwrap();
        assert_eq!(h.os, Os::Linux);
        assert_eq!(h.arch, Arch::Arm);
        assert_eq!(h.name, "Linux Kernel");
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = sample_header(5, 2, "x");
        bytes[0] = 0;
        assert!(matches!(parse(&bytes), Err(FwError::BadMagic(_))));
    }

    #[test]
    fn unknown_arch_and_os_map_to_unknown() {
        let h = parse(&sample_header(99, 99, "")).unwrap();
        assert_eq!(h.os.name(), "Unknown");
        assert_eq!(h.arch.name(), "Unknown");
    }
}
