//! The file-system dispatch layer: whichever of SquashFS, CramFS, or
//! UBI(FS) a firmware's application section turns out to hold, behind one
//! interface the façade can extract from without caring which it got.
//! UBI nests: its payload is itself one of the other three, so `FsKind`
//! is a tagged union that can wrap itself once (spec's Design Notes).

use crate::cramfs::{self, CramFs};
use crate::error::{FwError, Result};
use crate::squashfs::{self, SquashFs};
use crate::ubi::UbiImage;
use crate::ubifs::{self, Ubifs};
use crate::util::ImageMagic;
use std::fs;
use std::path::Path;

pub enum FsKind {
    SquashFs(Vec<u8>),
    CramFs(Vec<u8>),
    Ubifs(Ubifs),
    Ubi(Box<FsKind>),
}

impl FsKind {
    /// Detect and open whichever file system the application section's
    /// bytes hold, recursing through UBI's erase-block layer when present.
    /// An unrecognised top-level magic is `unrecognised-image-type`; an
    /// unrecognised magic after unwrapping UBI is `unknown-fs-in-ubi`
    /// (spec §4.8 state machine).
    pub fn open(bytes: &[u8]) -> Result<FsKind> {
        Self::open_inner(bytes, false)
    }

    fn open_inner(bytes: &[u8], in_ubi: bool) -> Result<FsKind> {
        match ImageMagic::detect(bytes) {
            ImageMagic::SquashFs => {
                SquashFs::open(bytes)?; // validate before committing
                Ok(FsKind::SquashFs(bytes.to_vec()))
            }
            ImageMagic::CramFs => {
                CramFs::open(bytes)?;
                Ok(FsKind::CramFs(bytes.to_vec()))
            }
            ImageMagic::Ubifs => Ok(FsKind::Ubifs(open_ubifs_bytes(bytes)?)),
            ImageMagic::Ubi if !in_ubi => {
                let ubi = UbiImage::scan(bytes)?;
                let mut volume = ubi.reassemble(bytes, Some("app")).or_else(|_| ubi.reassemble(bytes, None))?;
                let inner_bytes = volume.read_all()?;
                let inner = Self::open_inner(&inner_bytes, true)?;
                Ok(FsKind::Ubi(Box::new(inner)))
            }
            _ if in_ubi => Err(FwError::UnknownFsInUbi),
            _ => Err(FwError::UnrecognisedImageType),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            FsKind::SquashFs(_) => "squashfs",
            FsKind::CramFs(_) => "cramfs",
            FsKind::Ubifs(_) => "ubifs",
            FsKind::Ubi(inner) => inner.kind_name(),
        }
    }

    /// Read one file's full contents by path, trying `/mnt/app/<path>` if
    /// the direct lookup fails (spec §4.7's fallback for nested rootfs).
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        match self {
            FsKind::SquashFs(bytes) => {
                let squash = SquashFs::open(bytes)?;
                let inode = squash
                    .select(path)
                    .or_else(|_| squash.select(&format!("mnt/app/{path}")))?;
                squash.file_contents(&inode)
            }
            FsKind::CramFs(bytes) => {
                let cram = CramFs::open(bytes)?;
                let inode = cram
                    .select(path)
                    .or_else(|_| cram.select(&format!("mnt/app/{path}")))?;
                cram.file_contents(&inode)
            }
            FsKind::Ubifs(ubifs) => {
                let record = ubifs
                    .select(path)
                    .or_else(|| ubifs.select(&format!("mnt/app/{path}")))
                    .ok_or(FwError::MissingSection("ubifs path component"))?;
                Ok(ubifs.file_contents(record))
            }
            FsKind::Ubi(inner) => inner.read_file(path),
        }
    }

    /// Extract the whole tree under `dest`. UBIFS payloads never
    /// overwrite existing files regardless of `force` (the asymmetric
    /// rule the original extractor applies); SquashFS/CramFS respect
    /// `force` like every other section.
    pub fn extract(&self, dest: &Path, force: bool) -> Result<()> {
        match self {
            FsKind::SquashFs(bytes) => {
                let squash = SquashFs::open(bytes)?;
                extract_squashfs_dir(&squash, squash.root()?, dest, force)
            }
            FsKind::CramFs(bytes) => {
                let cram = CramFs::open(bytes)?;
                extract_cramfs_dir(&cram, cram.root(), dest, force)
            }
            FsKind::Ubifs(ubifs) => {
                let root = ubifs.root().ok_or(FwError::MissingSection("ubifs root inode"))?;
                extract_ubifs_dir(ubifs, root, dest, false)
            }
            FsKind::Ubi(inner) => inner.extract(dest, force),
        }
    }
}

fn open_ubifs_bytes(bytes: &[u8]) -> Result<Ubifs> {
    // A bare UBIFS image (no UBI erase-block wrapper) still needs a
    // `Volume`-shaped view; wrap it as a single, whole-image volume sized
    // by the LEB size the superblock itself reports.
    let leb_size = ubifs::peek_leb_size(bytes)?;
    let mut volume = crate::ubi::Volume::from_raw(leb_size, bytes)?;
    Ubifs::open(&mut volume)
}

/// SquashFS/CramFS extraction respects `force`: a pre-existing destination
/// file is overwritten when `force` is set, otherwise the whole extraction
/// fails with `exists` (spec §4.8 step 11). Returns whether the caller
/// should go ahead and write.
fn ensure_writable(path: &Path, force: bool) -> Result<bool> {
    if !path.exists() {
        return Ok(true);
    }
    if force {
        return Ok(true);
    }
    Err(FwError::Exists(path.display().to_string()))
}

/// UBIFS extraction never overwrites and never fails on a pre-existing
/// file, regardless of `force` (spec §4.5/§4.8 — the asymmetric rule the
/// original extractor applies, since `ubireader` has no overwrite knob).
fn ubifs_writable(path: &Path) -> bool {
    !path.exists()
}

fn extract_squashfs_dir(fs: &SquashFs, dir: squashfs::Inode, dest: &Path, force: bool) -> Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs.read_dir(&dir)? {
        let child_path = dest.join(&entry.name);
        let child_inode = fs.inode_at(entry.inode_ref.0, entry.inode_ref.1)?;
        match child_inode {
            squashfs::Inode::Directory { .. } => {
                extract_squashfs_dir(fs, child_inode, &child_path, force)?;
            }
            squashfs::Inode::Symlink { ref target } => {
                write_symlink(target, &child_path, force)?;
            }
            squashfs::Inode::File { .. } => {
                if ensure_writable(&child_path, force)? {
                    fs::write(&child_path, fs.file_contents(&child_inode)?)?;
                }
            }
        }
    }
    Ok(())
}

fn extract_cramfs_dir(fs: &CramFs, dir: cramfs::Inode, dest: &Path, force: bool) -> Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs.read_dir(&dir)? {
        let child_path = dest.join(&entry.name);
        if CramFs::is_dir(&entry.inode) {
            extract_cramfs_dir(fs, entry.inode, &child_path, force)?;
        } else if CramFs::is_symlink(&entry.inode) {
            let target = fs.symlink_target(&entry.inode)?;
            write_symlink(&target, &child_path, force)?;
        } else if ensure_writable(&child_path, force)? {
            fs::write(&child_path, fs.file_contents(&entry.inode)?)?;
        }
    }
    Ok(())
}

fn extract_ubifs_dir(fs: &Ubifs, dir: &ubifs::InodeRecord, dest: &Path, _force: bool) -> Result<()> {
    fs::create_dir_all(dest)?;
    for dent in &dir.dents {
        let Some(child) = fs.inode(dent.inum) else {
            continue;
        };
        let child_path = dest.join(&dent.name);
        if Ubifs::is_directory(child) {
            extract_ubifs_dir(fs, child, &child_path, false)?;
        } else if Ubifs::is_symlink(child) {
            let target = String::from_utf8_lossy(
                &child.ino.as_ref().map(|i| i.data.clone()).unwrap_or_default(),
            )
            .to_string();
            if ubifs_writable(&child_path) {
                write_symlink_unconditionally(&target, &child_path)?;
            }
        } else if ubifs_writable(&child_path) {
            fs::write(&child_path, fs.file_contents(child))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn write_symlink(target: &str, path: &Path, force: bool) -> Result<()> {
    if path.exists() {
        if !force {
            return Err(FwError::Exists(path.display().to_string()));
        }
        fs::remove_file(path)?;
    }
    std::os::unix::fs::symlink(target, path)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_symlink(target: &str, path: &Path, force: bool) -> Result<()> {
    // No portable symlink primitive off Unix; record the link target as
    // a plain text file rather than silently dropping it.
    if path.exists() && !force {
        return Err(FwError::Exists(path.display().to_string()));
    }
    fs::write(path, target)?;
    Ok(())
}

#[cfg(unix)]
fn write_symlink_unconditionally(target: &str, path: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, path)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_symlink_unconditionally(target: &str, path: &Path) -> Result<()> {
    fs::write(path, target)?;
    Ok(())
}
