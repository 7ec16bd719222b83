// SPDX-License-Identifier: GPL-3.0-only

//! Positioned-I/O building blocks.
//!
//! The payload sources (local file, zip member, remote URL) all expose the
//! [`ReadAt`] capability. Cursor-style [`Read`]/[`Seek`] views are derived
//! from it mechanically, so format code can stay written against the
//! standard traits.

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
    sync::{Arc, RwLock},
};

use num_traits::ToPrimitive;

use crate::util;

/// Positioned reads. `read_at` must not change any shared cursor state
/// visible to other callers. Whether concurrent calls are allowed is up to
/// the implementation; sources that cannot support it serialize internally.
pub trait ReadAt {
    /// Read up to `buf.len()` bytes at `offset`. Returns the number of
    /// bytes read; 0 means end of stream.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Total size of the underlying data in bytes.
    fn size(&self) -> io::Result<u64>;

    /// Read exactly `buf.len()` bytes at `offset` or fail.
    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            match self.read_at(buf, offset) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "Failed to fill whole buffer",
                    ));
                }
                Ok(n) => {
                    let tmp = buf;
                    buf = &mut tmp[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }
}

impl<T: ReadAt + ?Sized> ReadAt for &T {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        (**self).read_at(buf, offset)
    }

    fn size(&self) -> io::Result<u64> {
        (**self).size()
    }
}

impl<T: ReadAt + ?Sized> ReadAt for Arc<T> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        (**self).read_at(buf, offset)
    }

    fn size(&self) -> io::Result<u64> {
        (**self).size()
    }
}

/// Positioned writes. Safe to share across threads for implementations
/// backed by a kernel file descriptor.
pub trait WriteAt {
    /// Write up to `buf.len()` bytes at `offset`. Returns the number of
    /// bytes written.
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;

    /// Write all of `buf` at `offset` or fail.
    fn write_all_at(&self, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write_at(buf, offset) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "Failed to write whole buffer",
                    ));
                }
                Ok(n) => {
                    buf = &buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Write `size` zero bytes at `offset`, reusing a shared scratch buffer
    /// instead of allocating.
    fn write_zeros_at(&self, mut size: u64, mut offset: u64) -> io::Result<()> {
        while size > 0 {
            let to_write = size.min(util::ZEROS.len() as u64) as usize;
            self.write_all_at(&util::ZEROS[..to_write], offset)?;
            offset += to_write as u64;
            size -= to_write as u64;
        }

        Ok(())
    }
}

impl<T: WriteAt + ?Sized> WriteAt for &T {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        (**self).write_at(buf, offset)
    }
}

impl<T: WriteAt + ?Sized> WriteAt for Arc<T> {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        (**self).write_at(buf, offset)
    }
}

/// Common function for reading a structure from a reader.
pub trait FromReader<R: Read>: Sized {
    type Error;

    fn from_reader(reader: R) -> Result<Self, Self::Error>;
}

/// Extensions for readers to read and discard data (eg. for skipping
/// signature blobs or advancing a decompression stream).
pub trait ReadDiscardExt {
    fn read_discard(&mut self, size: u64) -> io::Result<u64>;

    fn read_discard_exact(&mut self, size: u64) -> io::Result<()> {
        let n = self.read_discard(size)?;
        if n != size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("Expected to read {size} bytes, but reached EOF after {n} bytes"),
            ));
        }
        Ok(())
    }
}

impl<R: Read> ReadDiscardExt for R {
    fn read_discard(&mut self, size: u64) -> io::Result<u64> {
        io::copy(&mut self.take(size), &mut io::sink())
    }
}

/// Extensions for file-like types to reopen themselves.
pub trait Reopen: Sized {
    /// Open a new handle to the same file. The new handle is independently
    /// seekable and the file offset is initially set to 0.
    fn reopen(&self) -> io::Result<Self>;
}

fn checked_seek_position(base: u64, offset: i64) -> io::Result<u64> {
    base.to_i64()
        .and_then(|s| s.checked_add(offset))
        .and_then(|s| s.to_u64())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "Offset would be before the start of the file",
            )
        })
}

/// A [`Read`]/[`Seek`] view over a [`ReadAt`] source. The cursor is plain
/// state in this struct, so independent views never disturb each other.
#[derive(Debug)]
pub struct CursorReader<R: ReadAt> {
    inner: R,
    pos: u64,
}

impl<R: ReadAt> CursorReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, pos: 0 }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: ReadAt> Read for CursorReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read_at(buf, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: ReadAt> Seek for CursorReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = match pos {
            SeekFrom::Start(o) => o,
            SeekFrom::End(o) => checked_seek_position(self.inner.size()?, o)?,
            SeekFrom::Current(o) => checked_seek_position(self.pos, o)?,
        };

        Ok(self.pos)
    }
}

/// A [`Write`] view over a [`WriteAt`] target, starting at a fixed offset.
/// Decompressors can stream into this to land their output at a precise
/// position in a shared file.
pub struct CursorWriter<W: WriteAt> {
    inner: W,
    pos: u64,
}

impl<W: WriteAt> CursorWriter<W> {
    pub fn new(inner: W, offset: u64) -> Self {
        Self { inner, pos: offset }
    }

    /// Current absolute write position.
    pub fn position(&self) -> u64 {
        self.pos
    }
}

impl<W: WriteAt> Write for CursorWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write_at(buf, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A reader wrapper that implements [`Seek`], but only for reporting the
/// current file position.
pub struct CountingReader<R> {
    inner: R,
    offset: u64,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, offset: 0 }
    }

    pub fn finish(self) -> (R, u64) {
        (self.inner, self.offset)
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.offset += n as u64;
        Ok(n)
    }
}

impl<R: Read> Seek for CountingReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        if pos == SeekFrom::Current(0) {
            Ok(self.offset)
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Can only report current offset",
            ))
        }
    }
}

/// A reader wrapper that only allows reading a specific section of a file.
#[derive(Debug)]
pub struct SectionReader<R> {
    inner: R,
    start: u64,
    size: u64,
    pos: u64,
}

impl<R: Read + Seek> SectionReader<R> {
    pub fn new(mut inner: R, start: u64, size: u64) -> io::Result<Self> {
        inner.seek(SeekFrom::Start(start))?;

        Ok(Self {
            inner,
            start,
            size,
            pos: 0,
        })
    }
}

impl<R: Read + Seek> Read for SectionReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let to_read = self.size.saturating_sub(self.pos).min(buf.len() as u64) as usize;
        let n = self.inner.read(&mut buf[..to_read])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for SectionReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = match pos {
            SeekFrom::Start(o) => o,
            SeekFrom::End(o) => checked_seek_position(self.size, o)?,
            SeekFrom::Current(o) => checked_seek_position(self.pos, o)?,
        };

        let raw_pos = self.inner.seek(SeekFrom::Start(self.start + self.pos))?;
        Ok(raw_pos - self.start)
    }
}

/// A file wrapper that uses a userspace file offset. A reopened instance
/// uses the same underlying kernel file descriptor, but a new userspace file
/// offset, initially set to 0.
#[derive(Debug)]
pub struct PSeekFile {
    // The lock is needed because flush() takes a `&mut self`.
    file: Arc<RwLock<File>>,
    offset: u64,
}

impl PSeekFile {
    pub fn new(file: File) -> Self {
        Self {
            file: Arc::new(RwLock::new(file)),
            offset: 0,
        }
    }

    pub fn set_len(&self, size: u64) -> io::Result<()> {
        let file_locked = self.file.read().unwrap();
        file_locked.set_len(size)
    }
}

impl ReadAt for PSeekFile {
    /// Read data at an offset. The kernel's file position *will* be changed.
    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::os::windows::fs::FileExt;
        self.file.read().unwrap().seek_read(buf, offset)
    }

    /// Read data at an offset. The kernel's file position will *not* be
    /// changed.
    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        self.file.read().unwrap().read_at(buf, offset)
    }

    fn size(&self) -> io::Result<u64> {
        let file_locked = self.file.read().unwrap();
        Ok(file_locked.metadata()?.len())
    }
}

impl WriteAt for PSeekFile {
    /// Write data at an offset. The kernel's file position *will* be
    /// changed.
    #[cfg(windows)]
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        use std::os::windows::fs::FileExt;
        self.file.read().unwrap().seek_write(buf, offset)
    }

    /// Write data at an offset. The kernel's file position will *not* be
    /// changed.
    #[cfg(unix)]
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        self.file.read().unwrap().write_at(buf, offset)
    }
}

impl Reopen for PSeekFile {
    fn reopen(&self) -> io::Result<Self> {
        Ok(Self {
            file: self.file.clone(),
            offset: 0,
        })
    }
}

impl Read for PSeekFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = ReadAt::read_at(self, buf, self.offset)?;
        self.offset += n as u64;
        Ok(n)
    }
}

impl Write for PSeekFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = WriteAt::write_at(self, buf, self.offset)?;
        self.offset += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.write().unwrap().flush()
    }
}

impl Seek for PSeekFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.offset = match pos {
            SeekFrom::Start(o) => o,
            SeekFrom::End(o) => {
                let file_size = self.file.read().unwrap().metadata()?.len();
                checked_seek_position(file_size, o)?
            }
            SeekFrom::Current(o) => checked_seek_position(self.offset, o)?,
        };

        Ok(self.offset)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Cursor, Read, Seek, SeekFrom, Write},
        sync::Mutex,
    };

    use super::{
        CountingReader, CursorReader, CursorWriter, PSeekFile, ReadAt, ReadDiscardExt, Reopen,
        SectionReader, WriteAt,
    };

    /// In-memory [`ReadAt`]/[`WriteAt`] target for tests.
    pub(crate) struct MemFile(pub Mutex<Vec<u8>>);

    impl MemFile {
        pub fn new(data: Vec<u8>) -> Self {
            Self(Mutex::new(data))
        }
    }

    impl ReadAt for MemFile {
        fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
            let data = self.0.lock().unwrap();
            let offset = offset.min(data.len() as u64) as usize;
            let n = buf.len().min(data.len() - offset);
            buf[..n].copy_from_slice(&data[offset..offset + n]);
            Ok(n)
        }

        fn size(&self) -> std::io::Result<u64> {
            Ok(self.0.lock().unwrap().len() as u64)
        }
    }

    impl WriteAt for MemFile {
        fn write_at(&self, buf: &[u8], offset: u64) -> std::io::Result<usize> {
            let mut data = self.0.lock().unwrap();
            let end = offset as usize + buf.len();
            if data.len() < end {
                data.resize(end, 0);
            }
            data[offset as usize..end].copy_from_slice(buf);
            Ok(buf.len())
        }
    }

    #[test]
    fn read_discard() {
        let mut reader = Cursor::new(b"foobar");
        reader.read_discard_exact(3).unwrap();

        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ba");

        let n = reader.read_discard(2).unwrap();
        assert_eq!(n, 1);

        assert_eq!(reader.stream_position().unwrap(), 6);
    }

    #[test]
    fn counting_reader() {
        let raw_reader = Cursor::new(b"foobar");
        let mut reader = CountingReader::new(raw_reader);

        let mut buf = [0u8; 6];
        reader.read_exact(&mut buf[..3]).unwrap();
        reader.read_exact(&mut buf[3..6]).unwrap();
        assert_eq!(&buf, b"foobar");

        let (mut raw_reader, size) = reader.finish();
        assert_eq!(raw_reader.stream_position().unwrap(), 6);
        assert_eq!(size, 6);
    }

    #[test]
    fn cursor_reader() {
        let source = MemFile::new(b"foobar".to_vec());
        let mut reader = CursorReader::new(&source);

        let mut buf = [0u8; 3];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"foo");

        reader.seek(SeekFrom::End(-2)).unwrap();
        reader.read_exact(&mut buf[..2]).unwrap();
        assert_eq!(&buf[..2], b"ar");

        reader.seek(SeekFrom::Start(1)).unwrap();
        reader.seek(SeekFrom::Current(2)).unwrap();
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"bar");

        assert!(reader.seek(SeekFrom::Current(-100)).is_err());
    }

    #[test]
    fn cursor_writer() {
        let target = MemFile::new(vec![0u8; 8]);
        let mut writer = CursorWriter::new(&target, 2);

        writer.write_all(b"foo").unwrap();
        writer.write_all(b"bar").unwrap();
        assert_eq!(writer.position(), 8);

        assert_eq!(&*target.0.lock().unwrap(), b"\0\0foobar");
    }

    #[test]
    fn read_write_exact_at() {
        let target = MemFile::new(vec![0u8; 4]);

        target.write_all_at(b"ab", 2).unwrap();
        target.write_zeros_at(1, 2).unwrap();

        let mut buf = [0u8; 2];
        target.read_exact_at(&mut buf, 2).unwrap();
        assert_eq!(&buf, b"\0b");

        assert!(target.read_exact_at(&mut buf, 3).is_err());
    }

    #[test]
    fn section_reader() {
        let raw_reader = Cursor::new(b"fooinnerbar");
        let mut reader = SectionReader::new(raw_reader, 3, 5).unwrap();

        let mut buf = [0u8; 5];
        reader.read_exact(&mut buf[..3]).unwrap();
        reader.read_exact(&mut buf[3..5]).unwrap();
        assert_eq!(&buf, b"inner");

        let n = reader.read_discard(1).unwrap();
        assert_eq!(n, 0);

        buf = *b"\0\0\0\0\0";
        reader.seek(SeekFrom::Start(4)).unwrap();
        reader.read_exact(&mut buf[..1]).unwrap();
        assert_eq!(&buf[..1], b"r");

        buf = *b"\0\0\0\0\0";
        reader.seek(SeekFrom::End(-4)).unwrap();
        reader.read_exact(&mut buf[..4]).unwrap();
        assert_eq!(&buf[..4], b"nner");
    }

    #[test]
    fn pseek_file() {
        let raw_file = tempfile::tempfile().unwrap();
        let mut a = PSeekFile::new(raw_file);
        let mut b = a.reopen().unwrap();
        let mut c = b.reopen().unwrap();

        b.write_all(b"foobar").unwrap();
        c.write_all(b"hello").unwrap();
        b.write_all(b"world").unwrap();
        c.seek(SeekFrom::Start(0)).unwrap();
        c.write_all(b"hi").unwrap();

        let mut buf = [0u8; 11];
        a.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hillorworld");

        a.set_len(4).unwrap();
        assert_eq!(ReadAt::size(&a).unwrap(), 4);
    }
}
