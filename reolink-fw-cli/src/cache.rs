//! The on-disk download cache (spec §6, §5): `<system-temp>/reolinkfwcache`,
//! entries named `SHA256(url)` unless the URL carries a `name` query
//! parameter, in which case the bytes are stored under that name and a
//! companion file named `SHA256(url)` records the name as a pointer.

use anyhow::Result;
use reolink_fw_core::util::sha256_bytes;
use std::fs;
use std::path::{Path, PathBuf};

const ONE_GIB: u64 = 1024 * 1024 * 1024;

pub fn cache_dir() -> PathBuf {
    std::env::temp_dir().join("reolinkfwcache")
}

/// Pull the `name` query parameter out of a URL, if present, without
/// pulling in a full URL-parsing dependency for one field.
fn name_query_param(url: &str) -> Option<String> {
    let query = url.split_once('?')?.1;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == "name").then(|| value.to_string())
    })
}

fn entry_filename(url: &str) -> String {
    name_query_param(url).unwrap_or_else(|| sha256_bytes(url.as_bytes()))
}

/// Read a cached response body for `url`, if a usable entry exists.
/// Any I/O failure (missing, truncated, permission-denied) is treated as a
/// cache miss rather than propagated, per the "tolerate partial files by
/// falling back to a re-fetch" resource-model rule.
pub fn get(url: &str) -> Option<Vec<u8>> {
    let path = cache_dir().join(entry_filename(url));
    fs::read(path).ok().filter(|b| !b.is_empty())
}

/// Store `bytes` for `url`, skipping silently when the cache is already at
/// capacity or the filesystem is nearly full (spec §6's "iff total size <
/// 1 GiB and free disk >= 1 GiB" gate).
pub fn put(url: &str, bytes: &[u8]) -> Result<()> {
    let dir = cache_dir();
    fs::create_dir_all(&dir)?;

    if !has_room(&dir, bytes.len() as u64) {
        return Ok(());
    }

    let entry_path = dir.join(entry_filename(url));
    fs::write(&entry_path, bytes)?;

    if let Some(name) = name_query_param(url) {
        let pointer_path = dir.join(sha256_bytes(url.as_bytes()));
        fs::write(pointer_path, name)?;
    }

    Ok(())
}

fn has_room(dir: &Path, incoming: u64) -> bool {
    let total: u64 = fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .filter_map(|e| e.metadata().ok())
                .map(|m| m.len())
                .sum()
        })
        .unwrap_or(0);
    if total + incoming >= ONE_GIB {
        return false;
    }
    free_space(dir).map(|free| free >= ONE_GIB).unwrap_or(true)
}

#[cfg(unix)]
fn free_space(dir: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(dir.as_os_str().as_bytes()).ok()?;
    // SAFETY: `c_path` is a valid NUL-terminated C string and `stat` is a
    // plain-old-data struct zero-initialised before the call.
    unsafe {
        let mut stat: libc::statvfs = std::mem::zeroed();
        if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
            return None;
        }
        Some(stat.f_bavail as u64 * stat.f_frsize as u64)
    }
}

#[cfg(not(unix))]
fn free_space(_dir: &Path) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_name_query_param() {
        assert_eq!(
            name_query_param("https://cdn.example/x?name=firmware.pak&id=1"),
            Some("firmware.pak".to_string())
        );
        assert_eq!(name_query_param("https://cdn.example/x"), None);
    }

    #[test]
    fn entry_filename_prefers_name_param_over_hash() {
        assert_eq!(
            entry_filename("https://cdn.example/x?name=firmware.pak"),
            "firmware.pak"
        );
        let hashed = entry_filename("https://cdn.example/x");
        assert_eq!(hashed.len(), 64);
    }

    #[test]
    fn missing_entry_is_a_cache_miss() {
        assert!(get("https://cdn.example/definitely-not-cached-xyz").is_none());
    }
}
