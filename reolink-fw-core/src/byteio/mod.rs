//! Random-access byte sources and the window reader built on top of them.
//!
//! Every higher layer (PAK sections, UBI volumes, file-system images) reads
//! through a [`Window`] rather than holding a copy of its bytes. A window is
//! a `(start, length, cursor)` view onto a parent [`ByteSource`]; the parent
//! is reference-counted (`Arc`) so it is only actually released once every
//! window over it has been dropped, no matter how many nested windows exist.

use std::fs::File;
use std::io;
use std::ops::Range;
use std::sync::{Arc, Mutex};

/// A seekable byte stream of known length, shared behind an `Arc`.
pub trait ByteSource: Send + Sync {
    /// Total length of the source in bytes.
    fn len(&self) -> u64;

    /// Read `buf.len()` bytes starting at `offset`, returning how many were
    /// actually read (fewer than `buf.len()` only at EOF).
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
}

/// An in-memory byte source (a downloaded blob, a decompressed payload, ...).
#[derive(Debug)]
pub struct MemSource {
    bytes: Arc<[u8]>,
}

impl MemSource {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }
}

impl ByteSource for MemSource {
    fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let offset = offset as usize;
        if offset >= self.bytes.len() {
            return Ok(0);
        }
        let end = (offset + buf.len()).min(self.bytes.len());
        let n = end - offset;
        buf[..n].copy_from_slice(&self.bytes[offset..end]);
        Ok(n)
    }
}

/// An on-disk byte source, for firmware files too large to want fully
/// resident (or simply left where the caller put them).
pub struct FileSource {
    file: Mutex<File>,
    len: u64,
}

impl FileSource {
    pub fn open(path: impl AsRef<std::path::Path>) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            len,
        })
    }
}

impl ByteSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        use std::io::{Read, Seek, SeekFrom};
        let mut file = self.file.lock().expect("file source mutex poisoned");
        file.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            match file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }
}

/// Origin for [`Window::seek`], mirroring `std::io::SeekFrom` but scoped to
/// the window rather than the parent source.
#[derive(Debug, Clone, Copy)]
pub enum SeekFrom {
    Start(u64),
    End(i64),
    Current(i64),
}

/// A `(start, length, cursor)` view onto a parent [`ByteSource`].
///
/// Reads never cross `start + length`. Multiple windows may alias the same
/// parent; the parent's backing resource (an open file, a mapped buffer) is
/// only released once the last `Arc` clone referencing it drops.
#[derive(Clone)]
pub struct Window {
    source: Arc<dyn ByteSource>,
    start: u64,
    length: u64,
    cursor: u64,
    closed: bool,
}

impl Window {
    /// Open a window over `[start, start+length)` of `source`. Clamps
    /// `length` so the window never reads past the end of `source`.
    pub fn new(source: Arc<dyn ByteSource>, start: u64, length: u64) -> Self {
        let max_len = source.len().saturating_sub(start);
        Self {
            source,
            start,
            length: length.min(max_len),
            cursor: 0,
            closed: false,
        }
    }

    /// A window over the whole of `source`.
    pub fn whole(source: Arc<dyn ByteSource>) -> Self {
        let length = source.len();
        Self::new(source, 0, length)
    }

    /// A sub-window relative to this window's own `[0, len())` range,
    /// letting nested formats (e.g. UBI inside a PAK section) be opened
    /// without copying.
    pub fn sub_window(&self, inner_offset: u64, inner_len: u64) -> Window {
        Window::new(Arc::clone(&self.source), self.start + inner_offset, inner_len)
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn tell(&self) -> u64 {
        self.cursor
    }

    pub fn range(&self) -> Range<u64> {
        self.start..self.start + self.length
    }

    pub fn seek(&mut self, from: SeekFrom) -> io::Result<u64> {
        let target = match from {
            SeekFrom::Start(n) => n as i128,
            SeekFrom::Current(n) => self.cursor as i128 + n as i128,
            SeekFrom::End(n) => self.length as i128 + n as i128,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of window",
            ));
        }
        self.cursor = target as u64;
        Ok(self.cursor)
    }

    /// Read up to `n` bytes, advancing the cursor. Never reads past the end
    /// of the window; a cursor already at or past the end yields an empty
    /// vector rather than an error.
    pub fn read(&mut self, n: usize) -> io::Result<Vec<u8>> {
        if self.closed || self.cursor >= self.length {
            return Ok(Vec::new());
        }
        let avail = (self.length - self.cursor).min(n as u64) as usize;
        let mut buf = vec![0u8; avail];
        let got = self
            .source
            .read_at(self.start + self.cursor, &mut buf)?;
        buf.truncate(got);
        self.cursor += got as u64;
        Ok(buf)
    }

    /// Read exactly `n` bytes or fail with `UnexpectedEof`.
    pub fn read_exact(&mut self, n: usize) -> io::Result<Vec<u8>> {
        let buf = self.read(n)?;
        if buf.len() != n {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("expected {n} bytes, got {}", buf.len()),
            ));
        }
        Ok(buf)
    }

    /// Peek up to `n` bytes without advancing the cursor.
    pub fn peek(&mut self, n: usize) -> io::Result<Vec<u8>> {
        let saved = self.cursor;
        let out = self.read(n)?;
        self.cursor = saved;
        Ok(out)
    }

    /// Read the whole window into a fresh buffer, from the current cursor.
    pub fn read_to_end(&mut self) -> io::Result<Vec<u8>> {
        let remaining = (self.length - self.cursor.min(self.length)) as usize;
        self.read(remaining)
    }

    /// Idempotent: marks the window as no longer readable. Does not affect
    /// sibling windows or the parent source, which is released by the
    /// ordinary `Arc` drop mechanics once every window (and the container
    /// that opened them) has gone out of scope.
    pub fn close(&mut self) {
        self.closed = true;
    }
}

impl io::Read for Window {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = Window::read(self, buf.len())?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }
}

impl io::Seek for Window {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let from = match pos {
            io::SeekFrom::Start(n) => SeekFrom::Start(n),
            io::SeekFrom::Current(n) => SeekFrom::Current(n),
            io::SeekFrom::End(n) => SeekFrom::End(n),
        };
        Window::seek(self, from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src(bytes: &[u8]) -> Arc<dyn ByteSource> {
        Arc::new(MemSource::new(bytes.to_vec()))
    }

    #[test]
    fn reads_never_cross_window_end() {
        let s = src(b"0123456789");
        let mut w = Window::new(s, 2, 4); // "2345"
        assert_eq!(w.read_to_end().unwrap(), b"2345");
        assert_eq!(w.read(10).unwrap(), b"");
    }

    #[test]
    fn peek_does_not_advance_cursor() {
        let s = src(b"abcdef");
        let mut w = Window::whole(s);
        assert_eq!(w.peek(3).unwrap(), b"abc");
        assert_eq!(w.tell(), 0);
        assert_eq!(w.read(3).unwrap(), b"abc");
        assert_eq!(w.tell(), 3);
    }

    #[test]
    fn seek_before_start_fails() {
        let s = src(b"abcdef");
        let mut w = Window::whole(s);
        assert!(w.seek(SeekFrom::Current(-1)).is_err());
    }

    #[test]
    fn sub_window_nests_without_copy() {
        let s = src(b"HEADER0123456789TRAILER");
        let outer = Window::new(s, 6, 10); // "0123456789"
        let mut inner = outer.sub_window(2, 4); // "2345"
        assert_eq!(inner.read_to_end().unwrap(), b"2345");
    }

    #[test]
    fn close_is_idempotent_and_empties_reads() {
        let s = src(b"abcdef");
        let mut w = Window::whole(s);
        w.close();
        w.close();
        assert_eq!(w.read(10).unwrap(), b"");
    }

    #[test]
    fn window_clamps_length_to_source() {
        let s = src(b"short");
        let w = Window::new(s, 2, 1000);
        assert_eq!(w.len(), 3);
    }
}
