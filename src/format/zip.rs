// SPDX-License-Identifier: GPL-3.0-only

//! Seekable view of the `payload.bin` member of an OTA zip.
//!
//! OTA zips store the payload either uncompressed (the common case, since
//! the payload data is already compressed) or deflated. Stored entries are
//! cheap to access at any offset. Deflated entries only decompress forward,
//! so this reader keeps at most one open inflate stream and restarts it when
//! a read lands anywhere other than the stream's current position. The
//! extraction dispatcher sorts its reads to stay on the cheap path.

use std::{
    io::{self, Read},
    sync::{Arc, Mutex},
};

use flate2::read::DeflateDecoder;
use thiserror::Error;
use tracing::debug;
use zip::{result::ZipError, CompressionMethod, ZipArchive};

use crate::stream::{CursorReader, ReadAt, ReadDiscardExt, SectionReader};

/// Entry name suffix used to locate the payload. Some OTAs nest the file in
/// a subdirectory, so only the suffix is matched.
pub const PAYLOAD_NAME: &str = "payload.bin";

#[derive(Debug, Error)]
pub enum Error {
    #[error("No entry named {PAYLOAD_NAME:?} in archive")]
    PayloadEntryNotFound,
    #[error("Unsupported compression method for {0:?}: {1:?}")]
    UnsupportedCompression(String, CompressionMethod),
    #[error("Zip error")]
    Zip(#[from] ZipError),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Method {
    Stored,
    Deflated,
}

type EntryReader<R> = DeflateDecoder<SectionReader<CursorReader<Arc<R>>>>;

#[derive(Debug)]
enum DeflateState<R: ReadAt> {
    NoStream,
    Stream {
        /// Uncompressed offset the stream was opened at.
        start: u64,
        /// Bytes produced since `start`.
        pos: u64,
        decoder: EntryReader<R>,
    },
}

/// A [`ReadAt`] view of the payload entry inside a zip archive overlaid on
/// any positioned-read source. A single mutex serializes all reads.
#[derive(Debug)]
pub struct ZipPayloadReader<R: ReadAt> {
    source: Arc<R>,
    /// Absolute offset of the entry's raw data within the archive.
    data_start: u64,
    compressed_size: u64,
    uncompressed_size: u64,
    method: Method,
    state: Mutex<DeflateState<R>>,
}

impl<R: ReadAt> ZipPayloadReader<R> {
    /// Locate the payload entry in the archive's central directory. The
    /// first entry whose name ends with [`PAYLOAD_NAME`] wins.
    pub fn new(source: R) -> Result<Self> {
        let source = Arc::new(source);
        let mut archive = ZipArchive::new(CursorReader::new(Arc::clone(&source)))?;
        let mut found = None;

        for index in 0..archive.len() {
            let entry = archive.by_index_raw(index)?;

            if entry.name().ends_with(PAYLOAD_NAME) {
                found = Some((
                    entry.name().to_owned(),
                    entry.compression(),
                    entry.data_start(),
                    entry.compressed_size(),
                    entry.size(),
                ));
                break;
            }
        }

        let (name, compression, data_start, compressed_size, uncompressed_size) =
            found.ok_or(Error::PayloadEntryNotFound)?;

        let method = match compression {
            CompressionMethod::Stored => Method::Stored,
            CompressionMethod::Deflated => Method::Deflated,
            other => return Err(Error::UnsupportedCompression(name, other)),
        };

        debug!("Found {name:?}: method={method:?} offset={data_start} size={uncompressed_size}");

        Ok(Self {
            source,
            data_start,
            compressed_size,
            uncompressed_size,
            method,
            state: Mutex::new(DeflateState::NoStream),
        })
    }

    fn open_stream(&self) -> io::Result<EntryReader<R>> {
        let raw = SectionReader::new(
            CursorReader::new(Arc::clone(&self.source)),
            self.data_start,
            self.compressed_size,
        )?;

        Ok(DeflateDecoder::new(raw))
    }

    fn read_at_deflated(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();

        let resumable = matches!(
            &*state,
            DeflateState::Stream { start, pos, .. } if start + pos == offset
        );

        if !resumable {
            if !matches!(&*state, DeflateState::NoStream) {
                debug!("Reopening decompression stream for offset {offset}");
            }

            let mut decoder = self.open_stream()?;
            decoder.read_discard_exact(offset)?;

            *state = DeflateState::Stream {
                start: offset,
                pos: 0,
                decoder,
            };
        }

        let result = match &mut *state {
            DeflateState::Stream { pos, decoder, .. } => match decoder.read(buf) {
                Ok(n) => {
                    *pos += n as u64;
                    Ok(n)
                }
                Err(e) => Err(e),
            },
            DeflateState::NoStream => unreachable!(),
        };

        if result.is_err() {
            // The stream position is no longer trustworthy.
            *state = DeflateState::NoStream;
        }

        result
    }
}

impl<R: ReadAt> ReadAt for ZipPayloadReader<R> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.uncompressed_size {
            return Ok(0);
        }

        let remain = self.uncompressed_size - offset;
        let len = if (buf.len() as u64) > remain {
            remain as usize
        } else {
            buf.len()
        };
        let buf = &mut buf[..len];

        match self.method {
            Method::Stored => {
                let _guard = self.state.lock().unwrap();
                self.source.read_at(buf, self.data_start + offset)
            }
            Method::Deflated => self.read_at_deflated(buf, offset),
        }
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.uncompressed_size)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Cursor, Write},
        sync::Mutex,
    };

    use zip::{write::FileOptions, CompressionMethod, ZipWriter};

    use super::{Error, ZipPayloadReader};
    use crate::stream::ReadAt;

    #[derive(Debug)]
    struct MemSource(Mutex<Vec<u8>>);

    impl ReadAt for MemSource {
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

    fn build_zip(payload_name: &str, payload: &[u8], method: CompressionMethod) -> MemSource {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = FileOptions::default().compression_method(method);

        writer
            .start_file(
                "META-INF/com/android/metadata",
                FileOptions::default().compression_method(CompressionMethod::Stored),
            )
            .unwrap();
        writer.write_all(b"ota-type=AB\n").unwrap();

        writer.start_file(payload_name, options).unwrap();
        writer.write_all(payload).unwrap();

        let buf = writer.finish().unwrap().into_inner();
        MemSource(Mutex::new(buf))
    }

    fn payload_data() -> Vec<u8> {
        // Compressible but position-dependent content.
        (0..4096u32).flat_map(|i| (i % 251).to_le_bytes()).collect()
    }

    #[test]
    fn stored_entry_random_access() {
        let data = payload_data();
        let source = build_zip("payload.bin", &data, CompressionMethod::Stored);
        let reader = ZipPayloadReader::new(source).unwrap();

        assert_eq!(reader.size().unwrap(), data.len() as u64);

        let mut buf = [0u8; 16];
        reader.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, &data[..16]);

        reader.read_exact_at(&mut buf, 1000).unwrap();
        assert_eq!(&buf, &data[1000..1016]);

        reader.read_exact_at(&mut buf, 8).unwrap();
        assert_eq!(&buf, &data[8..24]);
    }

    #[test]
    fn deflated_entry_forward_and_backward() {
        let data = payload_data();
        let source = build_zip("payload.bin", &data, CompressionMethod::Deflated);
        let reader = ZipPayloadReader::new(source).unwrap();

        assert_eq!(reader.size().unwrap(), data.len() as u64);

        let mut buf = [0u8; 64];

        // Sequential reads continue the same stream.
        reader.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(&buf[..], &data[..64]);
        reader.read_exact_at(&mut buf, 64).unwrap();
        assert_eq!(&buf[..], &data[64..128]);

        // Forward jump discards the gap.
        reader.read_exact_at(&mut buf, 4096).unwrap();
        assert_eq!(&buf[..], &data[4096..4160]);

        // Backward seek reopens the stream.
        reader.read_exact_at(&mut buf, 16).unwrap();
        assert_eq!(&buf[..], &data[16..80]);
    }

    #[test]
    fn reads_clamp_to_entry_size() {
        let data = payload_data();
        let source = build_zip("payload.bin", &data, CompressionMethod::Stored);
        let reader = ZipPayloadReader::new(source).unwrap();

        let mut buf = [0u8; 32];
        let n = reader.read_at(&mut buf, data.len() as u64 - 5).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf[..n], &data[data.len() - 5..]);

        let n = reader.read_at(&mut buf, data.len() as u64).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn nested_entry_name_matches() {
        let data = payload_data();
        let source = build_zip("firmware/payload.bin", &data, CompressionMethod::Stored);
        let reader = ZipPayloadReader::new(source).unwrap();

        let mut buf = [0u8; 8];
        reader.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, &data[..8]);
    }

    #[test]
    fn missing_payload_entry() {
        let source = build_zip("other.bin", b"data", CompressionMethod::Stored);
        let err = ZipPayloadReader::new(source).unwrap_err();

        assert!(matches!(err, Error::PayloadEntryNotFound));
    }
}
