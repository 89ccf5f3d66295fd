//! Input acceptance (spec §6): classify `file_or_url`, fetch/cache as
//! needed, and split a ZIP wrapper into its member PAKs. Every other
//! command operates on the resulting list of byte sources.

use crate::{cache, fetch};
use anyhow::{Context, Result};
use reolink_fw_core::archive;
use reolink_fw_core::byteio::{ByteSource, FileSource, MemSource};
use reolink_fw_core::FwError;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One PAK ready to open, plus the name its extraction directory (or
/// `info` header) should be labelled with when one is known.
pub struct ResolvedPak {
    pub label: Option<String>,
    pub source: Arc<dyn ByteSource>,
}

pub fn resolve(file_or_url: &str, use_cache: bool) -> Result<Vec<ResolvedPak>> {
    if fetch::is_url(file_or_url) {
        resolve_url(file_or_url, use_cache)
    } else if fetch::is_local_file(file_or_url) {
        resolve_file(Path::new(file_or_url))
    } else {
        Err(FwError::NotUrlOrFile(file_or_url.to_string()).into())
    }
}

fn resolve_url(url: &str, use_cache: bool) -> Result<Vec<ResolvedPak>> {
    let bytes = if use_cache {
        if let Some(cached) = cache::get(url) {
            cached
        } else {
            let fresh = fetch::download(url)?;
            let _ = cache::put(url, &fresh);
            fresh
        }
    } else {
        fetch::download(url)?
    };
    classify_bytes(bytes, None)
}

fn resolve_file(path: &Path) -> Result<Vec<ResolvedPak>> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string());

    if archive::is_pak(&bytes) {
        let source: Arc<dyn ByteSource> =
            Arc::new(FileSource::open(path).with_context(|| format!("opening {}", path.display()))?);
        return Ok(vec![ResolvedPak {
            label: stem,
            source,
        }]);
    }
    classify_bytes(bytes, stem)
}

fn classify_bytes(bytes: Vec<u8>, label: Option<String>) -> Result<Vec<ResolvedPak>> {
    if archive::is_pak(&bytes) {
        return Ok(vec![ResolvedPak {
            label,
            source: Arc::new(MemSource::new(bytes)),
        }]);
    }
    if archive::is_zip(&bytes) {
        let paks = archive::extract_paks_from_zip(&bytes)?;
        return Ok(paks
            .into_iter()
            .map(|b| ResolvedPak {
                label: None,
                source: Arc::new(MemSource::new(b)) as Arc<dyn ByteSource>,
            })
            .collect());
    }
    Err(FwError::NotZipOrPak.into())
}

/// The directory name `extract` persists a PAK's tree under: its resolved
/// label (filename stem) when known, otherwise the PAK's own SHA-256.
pub fn dest_dir_name(resolved: &ResolvedPak, sha256: &str) -> String {
    resolved.label.clone().unwrap_or_else(|| sha256.to_string())
}

pub fn cwd_or(dest: Option<PathBuf>) -> Result<PathBuf> {
    Ok(dest.unwrap_or(std::env::current_dir()?))
}
