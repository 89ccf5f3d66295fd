//! A read-only SquashFS reader covering exactly the v4 on-disk layout
//! these firmwares ship: superblock, metadata-block-wrapped inode and
//! directory tables, and block-list file data. No writer, no journal, no
//! xattrs beyond what's needed to skip over them.

use crate::compress;
use crate::error::{FwError, Result};
use std::collections::BTreeMap;

pub const MAGIC: [u8; 4] = *b"hsqs";
const SUPERBLOCK_LEN: usize = 96;
const METADATA_BLOCK_UNCOMPRESSED_FLAG: u16 = 0x8000;
const DATA_BLOCK_UNCOMPRESSED_FLAG: u32 = 0x0100_0000;

const INODE_BASIC_DIR: u16 = 1;
const INODE_BASIC_FILE: u16 = 2;
const INODE_BASIC_SYMLINK: u16 = 3;
const INODE_EXT_DIR: u16 = 8;
const INODE_EXT_FILE: u16 = 9;

#[derive(Debug, Clone, Copy)]
pub struct SuperBlock {
    pub inode_count: u32,
    pub block_size: u32,
    pub fragment_count: u32,
    pub compression: u16,
    pub root_inode_block: u32,
    pub root_inode_offset: u16,
    pub inode_table_start: u64,
    pub directory_table_start: u64,
    pub fragment_table_start: u64,
}

fn le32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(b[at..at + 4].try_into().unwrap())
}
fn le16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes(b[at..at + 2].try_into().unwrap())
}
fn le64(b: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(b[at..at + 8].try_into().unwrap())
}

pub fn parse_superblock(bytes: &[u8]) -> Result<SuperBlock> {
    if bytes.len() < SUPERBLOCK_LEN || bytes[..4] != MAGIC {
        return Err(FwError::BadMagic("squashfs"));
    }
    let root_inode = le64(bytes, 32);
    Ok(SuperBlock {
        inode_count: le32(bytes, 4),
        block_size: le32(bytes, 12),
        fragment_count: le32(bytes, 16),
        compression: le16(bytes, 20),
        root_inode_block: (root_inode >> 16) as u32,
        root_inode_offset: (root_inode & 0xFFFF) as u16,
        inode_table_start: le64(bytes, 40),
        directory_table_start: le64(bytes, 56),
        fragment_table_start: le64(bytes, 64),
    })
}

fn decompress_block(compression: u16, data: &[u8]) -> Result<Vec<u8>> {
    match compression {
        1 => compress::zlib::decompress(data),
        4 => compress::lzma::decompress_xz(data),
        other => Err(FwError::DecoderFailed(
            "squashfs",
            format!("unsupported compressor id {other}"),
        )),
    }
}

/// Reads a run of metadata blocks starting at a byte offset and serves
/// random access by the (block-start-offset, in-block-offset) pairs
/// SquashFS uses for inode and directory references.
struct MetadataReader {
    blocks: BTreeMap<u64, Vec<u8>>,
}

impl MetadataReader {
    fn load(bytes: &[u8], start: u64, end: u64, compression: u16) -> Result<MetadataReader> {
        let mut blocks = BTreeMap::new();
        let mut pos = start;
        while pos < end && (pos as usize + 2) <= bytes.len() {
            let header = le16(bytes, pos as usize);
            let len = (header & !METADATA_BLOCK_UNCOMPRESSED_FLAG) as usize;
            let uncompressed = header & METADATA_BLOCK_UNCOMPRESSED_FLAG != 0;
            let body_start = pos as usize + 2;
            let body = bytes
                .get(body_start..body_start + len)
                .ok_or(FwError::Truncated("squashfs metadata block"))?;
            let decoded = if uncompressed {
                body.to_vec()
            } else {
                decompress_block(compression, body)?
            };
            blocks.insert(pos - start, decoded);
            pos = body_start as u64 + len as u64;
        }
        Ok(MetadataReader { blocks })
    }

    fn read(&self, block_offset: u64, within: u16, len: usize) -> Result<Vec<u8>> {
        let block = self
            .blocks
            .get(&block_offset)
            .ok_or(FwError::Truncated("squashfs metadata reference"))?;
        let start = within as usize;
        block
            .get(start..start + len)
            .map(|s| s.to_vec())
            .ok_or(FwError::Truncated("squashfs metadata read"))
    }
}

#[derive(Debug, Clone)]
pub enum Inode {
    Directory {
        block_start: u32,
        offset: u16,
        size: u16,
    },
    File {
        block_start: u32,
        file_size: u64,
        block_list: Vec<u32>,
        frag_index: u32,
        block_offset: u32,
    },
    Symlink {
        target: String,
    },
}

fn parse_inode(body: &[u8], block_size: u32) -> Result<(u16 /* type */, Inode)> {
    if body.len() < 16 {
        return Err(FwError::Truncated("squashfs inode header"));
    }
    let inode_type = le16(body, 0);
    let rest = &body[16..];
    let inode = match inode_type {
        INODE_BASIC_DIR | INODE_EXT_DIR => {
            let block_start = le32(rest, 0);
            let size = le16(rest, 6);
            let offset = le16(rest, 8);
            Inode::Directory {
                block_start,
                offset,
                size,
            }
        }
        INODE_BASIC_FILE | INODE_EXT_FILE => {
            let block_start = le32(rest, 0);
            let frag_index = le32(rest, 4);
            let block_offset = le32(rest, 8);
            let file_size = le32(rest, 12) as u64;
            let has_fragment = frag_index != 0xFFFF_FFFF;
            let full_blocks = if has_fragment {
                file_size / block_size as u64
            } else {
                file_size.div_ceil(block_size as u64)
            } as usize;
            let mut block_list = Vec::with_capacity(full_blocks);
            let mut pos = 16usize;
            for _ in 0..full_blocks {
                block_list.push(le32(rest, pos));
                pos += 4;
            }
            Inode::File {
                block_start,
                file_size,
                block_list,
                frag_index,
                block_offset,
            }
        }
        INODE_BASIC_SYMLINK => {
            let symlink_size = le32(rest, 4) as usize;
            let target = String::from_utf8_lossy(&rest[8..8 + symlink_size]).to_string();
            Inode::Symlink { target }
        }
        other => {
            return Err(FwError::DecoderFailed(
                "squashfs",
                format!("unsupported inode type {other}"),
            ))
        }
    };
    Ok((inode_type, inode))
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub inode_ref: (u64, u16),
}

/// One entry of the fragment table: the data-block pointer and size (with
/// the same uncompressed-flag encoding as a regular file data block) that
/// holds a tail smaller than `block_size` for every file using that
/// fragment.
#[derive(Debug, Clone, Copy)]
struct FragmentEntry {
    start_block: u64,
    size: u32,
}

const FRAGMENT_ENTRIES_PER_BLOCK: usize = 512;
const FRAGMENT_ENTRY_LEN: usize = 16;

/// Read one metadata block (the 2-byte length/compressed-flag header
/// followed by its body) at an absolute byte offset, independent of any
/// particular `MetadataReader`'s region. Used for the fragment table,
/// whose index entries point at metadata blocks scattered outside the
/// inode/directory table regions.
fn read_metadata_block_at(bytes: &[u8], compression: u16, offset: u64) -> Result<Vec<u8>> {
    let pos = offset as usize;
    if pos + 2 > bytes.len() {
        return Err(FwError::Truncated("squashfs metadata block"));
    }
    let header = le16(bytes, pos);
    let len = (header & !METADATA_BLOCK_UNCOMPRESSED_FLAG) as usize;
    let uncompressed = header & METADATA_BLOCK_UNCOMPRESSED_FLAG != 0;
    let body_start = pos + 2;
    let body = bytes
        .get(body_start..body_start + len)
        .ok_or(FwError::Truncated("squashfs metadata block"))?;
    if uncompressed {
        Ok(body.to_vec())
    } else {
        decompress_block(compression, body)
    }
}

/// Load every fragment-table entry: a two-level indirection of `u64`
/// block pointers (stored uncompressed, at `fragment_table_start`) each
/// naming a metadata block of up to 512 16-byte `(start_block, size)`
/// entries.
fn load_fragment_table(bytes: &[u8], sb: &SuperBlock) -> Result<Vec<FragmentEntry>> {
    if sb.fragment_count == 0 {
        return Ok(Vec::new());
    }
    let index_len = (sb.fragment_count as usize).div_ceil(FRAGMENT_ENTRIES_PER_BLOCK);
    let mut entries = Vec::with_capacity(sb.fragment_count as usize);
    for i in 0..index_len {
        let ptr_offset = sb.fragment_table_start as usize + i * 8;
        if ptr_offset + 8 > bytes.len() {
            return Err(FwError::Truncated("squashfs fragment index"));
        }
        let block_ptr = le64(bytes, ptr_offset);
        let block = read_metadata_block_at(bytes, sb.compression, block_ptr)?;
        let remaining = sb.fragment_count as usize - entries.len();
        let take = remaining
            .min(FRAGMENT_ENTRIES_PER_BLOCK)
            .min(block.len() / FRAGMENT_ENTRY_LEN);
        for j in 0..take {
            let off = j * FRAGMENT_ENTRY_LEN;
            entries.push(FragmentEntry {
                start_block: le64(&block, off),
                size: le32(&block, off + 8),
            });
        }
    }
    Ok(entries)
}

pub struct SquashFs<'a> {
    bytes: &'a [u8],
    pub superblock: SuperBlock,
    inode_table: MetadataReader,
    directory_table: MetadataReader,
    fragment_table: Vec<FragmentEntry>,
}

impl<'a> SquashFs<'a> {
    pub fn open(bytes: &'a [u8]) -> Result<SquashFs<'a>> {
        let superblock = parse_superblock(bytes)?;
        let inode_table = MetadataReader::load(
            bytes,
            superblock.inode_table_start,
            superblock.directory_table_start,
            superblock.compression,
        )?;
        let directory_end = if superblock.fragment_table_start > superblock.directory_table_start
        {
            superblock.fragment_table_start
        } else {
            bytes.len() as u64
        };
        let directory_table = MetadataReader::load(
            bytes,
            superblock.directory_table_start,
            directory_end,
            superblock.compression,
        )?;
        let fragment_table = load_fragment_table(bytes, &superblock)?;
        Ok(SquashFs {
            bytes,
            superblock,
            inode_table,
            directory_table,
            fragment_table,
        })
    }

    /// Resolve an inode by its (metadata-block-offset, in-block-offset)
    /// reference, the form directory entries and the superblock's root
    /// pointer both use.
    pub fn inode_at(&self, block_offset: u64, within: u16) -> Result<Inode> {
        // Inode bodies are variable length; 256 bytes covers every basic
        // and extended inode type this firmware family emits (no xattrs,
        // no deep ACL lists).
        let raw = self.inode_table.read(block_offset, within, 256)?;
        let (_, inode) = parse_inode(&raw, self.superblock.block_size)?;
        Ok(inode)
    }

    pub fn root(&self) -> Result<Inode> {
        self.inode_at(
            self.superblock.root_inode_block as u64,
            self.superblock.root_inode_offset,
        )
    }

    pub fn read_dir(&self, dir: &Inode) -> Result<Vec<DirEntry>> {
        let Inode::Directory {
            block_start,
            offset,
            size,
        } = dir
        else {
            return Err(FwError::DecoderFailed("squashfs", "not a directory inode".into()));
        };
        if *size <= 3 {
            return Ok(Vec::new());
        }
        let listing_len = (*size as usize).saturating_sub(3);
        let raw = self
            .directory_table
            .read(*block_start as u64, *offset, listing_len)?;

        let mut entries = Vec::new();
        let mut pos = 0usize;
        while pos + 12 <= raw.len() {
            let count = le32(&raw, pos) as usize + 1;
            let header_block_start = le32(&raw, pos + 4);
            pos += 12;
            for _ in 0..count {
                if pos + 8 > raw.len() {
                    break;
                }
                let entry_offset = le16(&raw, pos);
                let _inode_delta = i16::from_le_bytes(raw[pos + 2..pos + 4].try_into().unwrap());
                let _entry_type = le16(&raw, pos + 4);
                let name_size = le16(&raw, pos + 6) as usize + 1;
                pos += 8;
                let name = String::from_utf8_lossy(&raw[pos..pos + name_size]).to_string();
                pos += name_size;
                entries.push(DirEntry {
                    name,
                    inode_ref: (header_block_start as u64, entry_offset),
                });
            }
        }
        Ok(entries)
    }

    /// Resolve a `/`-separated path against the root directory, retrying
    /// under `mnt/app/` when the direct lookup fails — the fallback the
    /// façade relies on for firmwares that nest the real rootfs a level
    /// down (spec §4.7).
    pub fn select(&self, path: &str) -> Result<Inode> {
        self.select_from(self.root()?, path)
    }

    fn select_from(&self, start: Inode, path: &str) -> Result<Inode> {
        let mut current = start;
        for component in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            let entries = self.read_dir(&current)?;
            let entry = entries
                .iter()
                .find(|e| e.name == component)
                .ok_or(FwError::MissingSection("squashfs path component"))?;
            current = self.inode_at(entry.inode_ref.0, entry.inode_ref.1)?;
        }
        Ok(current)
    }

    pub fn file_contents(&self, inode: &Inode) -> Result<Vec<u8>> {
        let Inode::File {
            block_start,
            file_size,
            block_list,
            frag_index,
            block_offset,
        } = inode
        else {
            return Err(FwError::DecoderFailed("squashfs", "not a regular file inode".into()));
        };
        let mut out = Vec::with_capacity(*file_size as usize);
        let mut pos = *block_start as u64;
        for &entry in block_list {
            if entry == 0 {
                // sparse hole
                out.extend(std::iter::repeat(0u8).take(self.superblock.block_size as usize));
                continue;
            }
            let uncompressed = entry & DATA_BLOCK_UNCOMPRESSED_FLAG != 0;
            let len = (entry & !DATA_BLOCK_UNCOMPRESSED_FLAG) as usize;
            let raw = self
                .bytes
                .get(pos as usize..pos as usize + len)
                .ok_or(FwError::Truncated("squashfs data block"))?;
            if uncompressed {
                out.extend_from_slice(raw);
            } else {
                out.extend(decompress_block(self.superblock.compression, raw)?);
            }
            pos += len as u64;
        }

        // The tail smaller than `block_size` lives in a shared fragment
        // block rather than `block_list`; `frag_index == u32::MAX` means
        // the file has no fragment (its size is an exact multiple of
        // `block_size`, or it was stored in full blocks only).
        if *frag_index != 0xFFFF_FFFF {
            let tail_len = (*file_size % self.superblock.block_size as u64) as usize;
            if tail_len > 0 {
                let frag = self
                    .fragment_table
                    .get(*frag_index as usize)
                    .ok_or(FwError::Truncated("squashfs fragment entry"))?;
                let uncompressed = frag.size & DATA_BLOCK_UNCOMPRESSED_FLAG != 0;
                let len = (frag.size & !DATA_BLOCK_UNCOMPRESSED_FLAG) as usize;
                let raw = self
                    .bytes
                    .get(frag.start_block as usize..frag.start_block as usize + len)
                    .ok_or(FwError::Truncated("squashfs fragment block"))?;
                let frag_data = if uncompressed {
                    raw.to_vec()
                } else {
                    decompress_block(self.superblock.compression, raw)?
                };
                let bo = *block_offset as usize;
                let tail = frag_data
                    .get(bo..bo + tail_len)
                    .ok_or(FwError::Truncated("squashfs fragment tail"))?;
                out.extend_from_slice(tail);
            }
        }

        out.truncate(*file_size as usize);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_squashfs_bytes() {
        assert!(matches!(parse_superblock(&[0u8; 96]), Err(FwError::BadMagic(_))));
    }

    #[test]
    fn parses_superblock_fields() {
        let mut sb = vec![0u8; SUPERBLOCK_LEN];
        sb[..4].copy_from_slice(&MAGIC);
        sb[4..8].copy_from_slice(&42u32.to_le_bytes());
        sb[12..16].copy_from_slice(&131072u32.to_le_bytes());
        sb[20..22].copy_from_slice(&1u16.to_le_bytes());
        let root_inode: u64 = (7u64 << 16) | 33;
        sb[32..40].copy_from_slice(&root_inode.to_le_bytes());
        sb[40..48].copy_from_slice(&96u64.to_le_bytes());

        let parsed = parse_superblock(&sb).unwrap();
        assert_eq!(parsed.inode_count, 42);
        assert_eq!(parsed.block_size, 131072);
        assert_eq!(parsed.root_inode_block, 7);
        assert_eq!(parsed.root_inode_offset, 33);
        assert_eq!(parsed.inode_table_start, 96);
    }

    /// A file entirely smaller than `block_size` has an empty `block_list`
    /// and its whole content in one fragment; `file_contents` must read
    /// that fragment rather than return nothing (the bug this test pins).
    #[test]
    fn file_contents_reads_tail_from_fragment_table() {
        const BLOCK_SIZE: u32 = 128;
        const TAIL: &[u8] = b"hello";

        // offsets, laid out after the 96-byte superblock:
        //  96..104  inode/directory table region: 4 empty metadata blocks
        //           (each a zero-length body, but the header must still
        //           set the uncompressed flag so the loader doesn't try
        //           to inflate a zero-byte body with a bogus compressor id)
        // 104..112  fragment index: one u64 pointer -> 112
        // 112..114  fragment metadata block header (len=16, uncompressed)
        // 114..130  one fragment entry: start_block=130, size=TAIL.len()|uncompressed
        // 130..135  the fragment's raw (uncompressed) data: b"hello"
        let mut bytes = vec![0u8; 96];
        bytes[..4].copy_from_slice(&MAGIC);
        bytes[12..16].copy_from_slice(&BLOCK_SIZE.to_le_bytes());
        bytes[16..20].copy_from_slice(&1u32.to_le_bytes()); // fragment_count
        bytes[40..48].copy_from_slice(&96u64.to_le_bytes()); // inode_table_start
        bytes[56..64].copy_from_slice(&96u64.to_le_bytes()); // directory_table_start
        bytes[64..72].copy_from_slice(&104u64.to_le_bytes()); // fragment_table_start

        let empty_header: u16 = METADATA_BLOCK_UNCOMPRESSED_FLAG;
        for _ in 0..4 {
            bytes.extend_from_slice(&empty_header.to_le_bytes());
        } // 96..104, four empty (len=0) metadata blocks
        bytes.extend_from_slice(&112u64.to_le_bytes()); // 104..112, fragment index pointer

        let header: u16 = 16 | METADATA_BLOCK_UNCOMPRESSED_FLAG;
        bytes.extend_from_slice(&header.to_le_bytes()); // 112..114

        bytes.extend_from_slice(&130u64.to_le_bytes()); // 114..122, entry.start_block
        let size = TAIL.len() as u32 | DATA_BLOCK_UNCOMPRESSED_FLAG;
        bytes.extend_from_slice(&size.to_le_bytes()); // 122..126, entry.size
        bytes.extend_from_slice(&[0u8; 4]); // 126..130, unused

        bytes.extend_from_slice(TAIL); // 130..135

        let squash = SquashFs::open(&bytes).unwrap();
        assert_eq!(squash.fragment_table.len(), 1);

        let inode = Inode::File {
            block_start: 0,
            file_size: TAIL.len() as u64,
            block_list: Vec::new(),
            frag_index: 0,
            block_offset: 0,
        };
        let content = squash.file_contents(&inode).unwrap();
        assert_eq!(content, TAIL);
    }
}
