//! CramFS: the older, simpler read-only file system some of these
//! devices still ship for their rootfs. One flat inode table reached by
//! directory entries embedded inline (no separate metadata blocks the way
//! SquashFS has); file data is split into independently zlib-compressed
//! blocks with a leading index of cumulative end offsets.

use crate::compress::zlib;
use crate::error::{FwError, Result};

pub const MAGIC: [u8; 4] = [0x45, 0x3D, 0xCD, 0x28];
const SUPERBLOCK_LEN: usize = 64;
const INODE_LEN: usize = 12;

#[derive(Debug, Clone, Copy)]
pub struct SuperBlock {
    pub size: u32,
    pub blocks: u32,
    pub files: u32,
    pub block_size: u32,
}

fn le32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(b[at..at + 4].try_into().unwrap())
}

pub fn parse_superblock(bytes: &[u8]) -> Result<SuperBlock> {
    if bytes.len() < SUPERBLOCK_LEN || bytes[..4] != MAGIC {
        return Err(FwError::BadMagic("cramfs"));
    }
    Ok(SuperBlock {
        size: le32(bytes, 4),
        blocks: le32(bytes, 36),
        files: le32(bytes, 40),
        block_size: 4096, // fixed for every format revision this family uses
    })
}

#[derive(Debug, Clone, Copy)]
pub struct Inode {
    pub mode: u16,
    pub size: u32,
    pub namelen_words: u8,
    pub offset: u32, // byte offset into the image, already *4 from the on-disk word count
}

fn parse_inode(bytes: &[u8]) -> Inode {
    let word0 = le32(bytes, 0);
    let word1 = le32(bytes, 4);
    let word2 = le32(bytes, 8);
    let mode = (word0 & 0xFFFF) as u16;
    let size = word1 & 0x00FF_FFFF;
    let namelen_words = (word2 & 0x3F) as u8;
    let offset = (word2 >> 6) * 4;
    Inode {
        mode,
        size,
        namelen_words,
        offset,
    }
}

pub const S_IFMT: u16 = 0o170000;
pub const S_IFDIR: u16 = 0o040000;
pub const S_IFLNK: u16 = 0o120000;

#[derive(Debug, Clone)]
pub struct Entry {
    pub name: String,
    pub inode: Inode,
}

pub struct CramFs<'a> {
    bytes: &'a [u8],
    pub superblock: SuperBlock,
    root: Inode,
}

impl<'a> CramFs<'a> {
    pub fn open(bytes: &'a [u8]) -> Result<CramFs<'a>> {
        let superblock = parse_superblock(bytes)?;
        let root = parse_inode(
            bytes
                .get(SUPERBLOCK_LEN..SUPERBLOCK_LEN + INODE_LEN)
                .ok_or(FwError::Truncated("cramfs root inode"))?,
        );
        Ok(CramFs {
            bytes,
            superblock,
            root,
        })
    }

    pub fn root(&self) -> Inode {
        self.root
    }

    pub fn is_dir(inode: &Inode) -> bool {
        inode.mode & S_IFMT == S_IFDIR
    }

    pub fn is_symlink(inode: &Inode) -> bool {
        inode.mode & S_IFMT == S_IFLNK
    }

    /// Walk the inode/name pairs packed at `dir.offset`, one 12-byte
    /// header plus a name padded to a multiple of 4 bytes, until the
    /// directory's total listed size is consumed.
    pub fn read_dir(&self, dir: &Inode) -> Result<Vec<Entry>> {
        if !Self::is_dir(dir) {
            return Err(FwError::DecoderFailed("cramfs", "not a directory inode".into()));
        }
        let mut entries = Vec::new();
        let mut pos = dir.offset as usize;
        let end = pos + dir.size as usize;
        while pos < end {
            let header = self
                .bytes
                .get(pos..pos + INODE_LEN)
                .ok_or(FwError::Truncated("cramfs directory entry"))?;
            let inode = parse_inode(header);
            pos += INODE_LEN;
            let name_len = inode.namelen_words as usize * 4;
            let name_bytes = self
                .bytes
                .get(pos..pos + name_len)
                .ok_or(FwError::Truncated("cramfs entry name"))?;
            let trimmed = name_bytes
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(name_bytes.len());
            let name = String::from_utf8_lossy(&name_bytes[..trimmed]).to_string();
            pos += name_len;
            entries.push(Entry { name, inode });
        }
        Ok(entries)
    }

    pub fn select(&self, path: &str) -> Result<Inode> {
        let mut current = self.root;
        for component in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            let entries = self.read_dir(&current)?;
            let entry = entries
                .iter()
                .find(|e| e.name == component)
                .ok_or(FwError::MissingSection("cramfs path component"))?;
            current = entry.inode;
        }
        Ok(current)
    }

    pub fn symlink_target(&self, inode: &Inode) -> Result<String> {
        let raw = self.file_contents(inode)?;
        Ok(String::from_utf8_lossy(&raw).to_string())
    }

    /// Decompress a regular file: a leading array of cumulative
    /// end-offsets (one `u32` per block, relative to right after the
    /// index itself), followed by each block's independently
    /// zlib-compressed bytes.
    pub fn file_contents(&self, inode: &Inode) -> Result<Vec<u8>> {
        let block_size = self.superblock.block_size as usize;
        let block_count = (inode.size as usize).div_ceil(block_size).max(1);
        let index_len = block_count * 4;
        let index_start = inode.offset as usize;
        let index = self
            .bytes
            .get(index_start..index_start + index_len)
            .ok_or(FwError::Truncated("cramfs block index"))?;

        let data_start = index_start + index_len;
        let mut out = Vec::with_capacity(inode.size as usize);
        let mut block_start = data_start;
        for i in 0..block_count {
            let end_offset = le32(index, i * 4) as usize;
            let block_end = data_start + end_offset;
            let compressed = self
                .bytes
                .get(block_start..block_end)
                .ok_or(FwError::Truncated("cramfs data block"))?;
            if compressed.is_empty() {
                out.extend(std::iter::repeat(0u8).take(block_size.min(inode.size as usize - out.len())));
            } else {
                out.extend(zlib::decompress(compressed)?);
            }
            block_start = block_end;
        }
        out.truncate(inode.size as usize);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_magic() {
        assert!(matches!(parse_superblock(&[0u8; 64]), Err(FwError::BadMagic(_))));
    }

    #[test]
    fn parses_inode_bitfields() {
        let mode = 0o040755u16; // directory
        let uid = 0u16;
        let size = 100u32;
        let gid = 0u8;
        let namelen_words = 2u8; // up to 8 bytes of name
        let offset_words = 20u32;

        let word0 = mode as u32 | ((uid as u32) << 16);
        let word1 = size | ((gid as u32) << 24);
        let word2 = namelen_words as u32 | (offset_words << 6);

        let mut buf = [0u8; INODE_LEN];
        buf[0..4].copy_from_slice(&word0.to_le_bytes());
        buf[4..8].copy_from_slice(&word1.to_le_bytes());
        buf[8..12].copy_from_slice(&word2.to_le_bytes());

        let inode = parse_inode(&buf);
        assert_eq!(inode.mode, mode);
        assert_eq!(inode.size, size);
        assert_eq!(inode.namelen_words, namelen_words);
        assert_eq!(inode.offset, offset_words * 4);
        assert!(CramFs::is_dir(&inode));
    }
}
