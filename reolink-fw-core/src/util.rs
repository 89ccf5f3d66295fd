//! Small utilities shared by every other module: SHA-256 streaming and the
//! magic-byte enum used for file-system and container dispatch.

use sha2::{Digest, Sha256};
use std::io::Read;

/// Stream `reader` through SHA-256 without holding the whole input in
/// memory, returning the lowercase hex digest.
pub fn sha256_hex(mut reader: impl Read) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// The four-way (five, counting UBI's inner dispatch) magic-byte family
/// recognised at the start of an application file-system section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageMagic {
    SquashFs,
    CramFs,
    Ubi,
    Ubifs,
    Uimage,
    Unknown,
}

pub const SQUASHFS_MAGIC: [u8; 4] = *b"hsqs";
pub const CRAMFS_MAGIC: [u8; 4] = [0x45, 0x3D, 0xCD, 0x28]; // "E=\xcd("
pub const UBI_EC_HDR_MAGIC: [u8; 4] = *b"UBI#";
pub const UBIFS_NODE_MAGIC: [u8; 4] = [0x31, 0x18, 0x10, 0x06];

impl ImageMagic {
    pub fn detect(bytes: &[u8]) -> ImageMagic {
        if bytes.len() < 4 {
            return ImageMagic::Unknown;
        }
        let head: [u8; 4] = bytes[..4].try_into().unwrap();
        if head == SQUASHFS_MAGIC {
            ImageMagic::SquashFs
        } else if head == CRAMFS_MAGIC {
            ImageMagic::CramFs
        } else if head == UBI_EC_HDR_MAGIC {
            ImageMagic::Ubi
        } else if head == UBIFS_NODE_MAGIC {
            ImageMagic::Ubifs
        } else if u32::from_be_bytes(head) == crate::headers::uimage::MAGIC {
            ImageMagic::Uimage
        } else {
            ImageMagic::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_squashfs_and_cramfs_and_ubi() {
        assert_eq!(ImageMagic::detect(b"hsqs...."), ImageMagic::SquashFs);
        assert_eq!(
            ImageMagic::detect(&[0x45, 0x3D, 0xCD, 0x28, 0, 0]),
            ImageMagic::CramFs
        );
        assert_eq!(ImageMagic::detect(b"UBI#xxxx"), ImageMagic::Ubi);
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
