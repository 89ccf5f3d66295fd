//! A scoped temporary-file abstraction backing the UBI intermediate buffer
//! (the reassembled logical-erase-block stream needs to be handed to the
//! UBIFS reader as something seekable; we don't want to require the whole
//! image resident twice).
//!
//! On Linux, an anonymous `memfd_create` file eliminates disk I/O entirely;
//! everywhere else we fall back to a named temp file that is unlinked when
//! the handle drops.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

pub struct ScopedTempFile {
    file: File,
}

impl ScopedTempFile {
    /// Write `bytes` to a fresh scratch file and return a handle positioned
    /// at its start.
    pub fn from_bytes(bytes: &[u8]) -> io::Result<Self> {
        let mut file = Self::create()?;
        file.file.write_all(bytes)?;
        file.file.seek(SeekFrom::Start(0))?;
        Ok(file)
    }

    #[cfg(target_os = "linux")]
    fn create() -> io::Result<Self> {
        use std::ffi::CStr;
        use std::os::fd::FromRawFd;

        let name = CStr::from_bytes_with_nul(b"reolinkfw-tmp\0").unwrap();
        // SAFETY: `name` is a valid NUL-terminated C string, and a
        // successful return is always a newly-owned, open file descriptor.
        let fd = unsafe { libc::memfd_create(name.as_ptr(), 0) };
        if fd >= 0 {
            // SAFETY: `fd` was just returned by `memfd_create` and is owned
            // by nobody else; wrapping it in `File` gives it exactly one
            // owner, which will close it on drop.
            let file = unsafe { File::from_raw_fd(fd) };
            return Ok(Self { file });
        }
        Self::create_on_disk()
    }

    #[cfg(not(target_os = "linux"))]
    fn create() -> io::Result<Self> {
        Self::create_on_disk()
    }

    fn create_on_disk() -> io::Result<Self> {
        let file = tempfile::tempfile()?;
        Ok(Self { file })
    }

    pub fn as_file(&self) -> &File {
        &self.file
    }

    pub fn as_file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    pub fn len(&self) -> io::Result<u64> {
        self.file.metadata().map(|m| m.len())
    }
}

impl Read for ScopedTempFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for ScopedTempFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_bytes_through_scratch_file() {
        let mut f = ScopedTempFile::from_bytes(b"ubi intermediate buffer").unwrap();
        let mut out = Vec::new();
        f.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"ubi intermediate buffer");
    }

    #[test]
    fn len_matches_written_bytes() {
        let f = ScopedTempFile::from_bytes(&[0u8; 4096]).unwrap();
        assert_eq!(f.len().unwrap(), 4096);
    }
}
