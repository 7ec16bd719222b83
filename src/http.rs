// SPDX-License-Identifier: GPL-3.0-only

//! Range-request HTTP source with a chunk cache.
//!
//! Presents a [`ReadAt`] view over a remote URL. Reads are split into
//! fixed-size chunks which are fetched with `Range` GETs and cached, so the
//! zip machinery layered on top can poke around the central directory
//! without re-downloading anything.

use std::{
    collections::HashMap,
    io::{self, Read},
    sync::{Arc, Mutex},
    time::Duration,
};

use thiserror::Error;
use tracing::{debug, warn};

use crate::stream::ReadAt;

const TIMEOUT: Duration = Duration::from_secs(60);

pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Server may not support Range requests (HTTP {0} to a ranged request)")]
    RangeNotSupported(u16),
    #[error("Unexpected HTTP status: {0}")]
    UnexpectedStatus(u16),
    #[error("Missing or invalid Content-Length header")]
    InvalidContentLength,
    #[error("Missing or invalid Content-Range header: {0:?}")]
    InvalidContentRange(String),
    #[error("HTTP request failed")]
    Request(#[from] attohttpc::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
struct CacheEntry {
    data: Arc<Vec<u8>>,
    last_used: u64,
}

#[derive(Debug, Default)]
struct ChunkCache {
    chunks: HashMap<u64, CacheEntry>,
    cached_bytes: u64,
    clock: u64,
}

impl ChunkCache {
    fn get(&mut self, start: u64) -> Option<Arc<Vec<u8>>> {
        self.clock += 1;
        let clock = self.clock;

        self.chunks.get_mut(&start).map(|entry| {
            entry.last_used = clock;
            Arc::clone(&entry.data)
        })
    }

    fn insert(&mut self, start: u64, data: Arc<Vec<u8>>, limit: Option<u64>) {
        self.clock += 1;

        self.cached_bytes += data.len() as u64;

        if let Some(old) = self.chunks.insert(
            start,
            CacheEntry {
                data,
                last_used: self.clock,
            },
        ) {
            self.cached_bytes -= old.data.len() as u64;
        }

        if let Some(limit) = limit {
            // The entry just inserted has the newest timestamp, so it is
            // never the eviction victim while anything else remains.
            while self.cached_bytes > limit && self.chunks.len() > 1 {
                let victim = self
                    .chunks
                    .iter()
                    .min_by_key(|(_, entry)| entry.last_used)
                    .map(|(&start, _)| start)
                    .unwrap();

                let old = self.chunks.remove(&victim).unwrap();
                self.cached_bytes -= old.data.len() as u64;
            }
        }
    }
}

/// A remote file accessed through HTTP byte-range requests.
///
/// Downloaded chunks are kept for the lifetime of the reader. Without a
/// cache limit the cache grows with every distinct chunk touched; callers
/// that expect to sweep large files should pass a byte budget, which evicts
/// the least-recently-used chunks.
#[derive(Debug)]
pub struct HttpRangeReader {
    url: String,
    size: u64,
    chunk_size: u64,
    cache_limit: Option<u64>,
    cache: Mutex<ChunkCache>,
}

impl HttpRangeReader {
    pub fn new(url: &str) -> Result<Self> {
        Self::with_options(url, DEFAULT_CHUNK_SIZE, None)
    }

    pub fn with_options(url: &str, chunk_size: u64, cache_limit: Option<u64>) -> Result<Self> {
        assert!(chunk_size > 0, "Chunk size must be non-zero");

        let (size, ranges_advertised) = probe_size(url)?;
        if !ranges_advertised {
            warn!("Server did not advertise byte-range support, continuing anyway");
        }

        debug!("Remote file is {size} bytes");

        Ok(Self {
            url: url.to_owned(),
            size,
            chunk_size,
            cache_limit,
            cache: Mutex::new(ChunkCache::default()),
        })
    }

    fn chunk_len(&self, start: u64) -> u64 {
        self.chunk_size.min(self.size - start)
    }

    /// Download one chunk. The cache lock must not be held; a concurrent
    /// fetch of the same chunk is wasteful but harmless (last writer wins).
    fn fetch_chunk(&self, start: u64) -> Result<Vec<u8>> {
        let end = start + self.chunk_len(start) - 1;

        debug!("Fetching chunk {start}-{end}");

        let mut response = attohttpc::get(&self.url)
            .connect_timeout(TIMEOUT)
            .read_timeout(TIMEOUT)
            .header("Range", format!("bytes={start}-{end}"))
            .send()?;

        match response.status().as_u16() {
            206 => {}
            200 => return Err(Error::RangeNotSupported(200)),
            status => return Err(Error::UnexpectedStatus(status)),
        }

        let mut data = Vec::with_capacity((end - start + 1) as usize);
        response.read_to_end(&mut data)?;

        Ok(data)
    }

    fn chunk_at(&self, start: u64) -> Result<Arc<Vec<u8>>> {
        {
            let mut cache = self.cache.lock().unwrap();
            if let Some(data) = cache.get(start) {
                return Ok(data);
            }
        }

        let data = Arc::new(self.fetch_chunk(start)?);

        let mut cache = self.cache.lock().unwrap();
        cache.insert(start, Arc::clone(&data), self.cache_limit);

        Ok(data)
    }
}

impl ReadAt for HttpRangeReader {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if buf.is_empty() || offset >= self.size {
            return Ok(0);
        }

        let remain = self.size - offset;
        let want = if (buf.len() as u64) > remain {
            remain as usize
        } else {
            buf.len()
        };

        let mut filled = 0;

        while filled < want {
            let pos = offset + filled as u64;
            let chunk_start = pos - pos % self.chunk_size;

            let chunk = self
                .chunk_at(chunk_start)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

            let skip = (pos - chunk_start) as usize;
            if skip >= chunk.len() {
                // The server sent less than the requested range.
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("Server returned a short chunk at offset {chunk_start}"),
                ));
            }

            let n = (chunk.len() - skip).min(want - filled);
            buf[filled..filled + n].copy_from_slice(&chunk[skip..skip + n]);
            filled += n;
        }

        Ok(filled)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.size)
    }
}

/// Determine the total size of the remote file. Prefers a HEAD request;
/// falls back to a one-byte ranged GET for servers that reject HEAD or
/// omit Content-Length. Returns the size and whether the server advertised
/// `Accept-Ranges: bytes`.
fn probe_size(url: &str) -> Result<(u64, bool)> {
    let head = attohttpc::head(url)
        .connect_timeout(TIMEOUT)
        .read_timeout(TIMEOUT)
        .send();

    if let Ok(response) = head {
        if matches!(response.status().as_u16(), 200 | 202 | 204) {
            let ranges_advertised = response
                .headers()
                .get("Accept-Ranges")
                .and_then(|v| v.to_str().ok())
                .map_or(false, |v| v.contains("bytes"));

            let size = response
                .headers()
                .get("Content-Length")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());

            if let Some(size) = size.filter(|&s| s > 0) {
                return Ok((size, ranges_advertised));
            }
        }
    }

    debug!("HEAD request failed, probing with a ranged GET");

    let response = attohttpc::get(url)
        .connect_timeout(TIMEOUT)
        .read_timeout(TIMEOUT)
        .header("Range", "bytes=0-0")
        .send()?;

    match response.status().as_u16() {
        206 => {
            let raw = response
                .headers()
                .get("Content-Range")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_owned();

            // Format: `bytes 0-0/TOTAL`. A total of `*` means the server
            // does not know the size, which we cannot work with.
            let total = raw
                .rsplit_once('/')
                .and_then(|(_, total)| total.trim().parse::<u64>().ok())
                .ok_or_else(|| Error::InvalidContentRange(raw.clone()))?;

            if total == 0 {
                return Err(Error::InvalidContentLength);
            }

            Ok((total, true))
        }
        200 => Err(Error::RangeNotSupported(200)),
        status => Err(Error::UnexpectedStatus(status)),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::{TcpListener, TcpStream},
        thread,
    };

    use super::{Error, HttpRangeReader};
    use crate::stream::ReadAt;

    #[derive(Clone, Copy)]
    enum Behavior {
        /// HEAD works and reports Accept-Ranges; GETs honor Range.
        Full,
        /// HEAD is rejected; GETs honor Range.
        NoHead,
        /// Range requests are ignored and answered with the whole body.
        NoRanges,
    }

    fn read_request(stream: &mut TcpStream) -> String {
        let mut raw = Vec::new();
        let mut buf = [0u8; 1024];

        loop {
            let n = stream.read(&mut buf).unwrap();
            raw.extend_from_slice(&buf[..n]);

            if n == 0 || raw.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }

        String::from_utf8(raw).unwrap()
    }

    fn parse_range(request: &str) -> Option<(u64, u64)> {
        let line = request
            .lines()
            .find(|l| l.to_ascii_lowercase().starts_with("range:"))?;
        let spec = line.split_once('=')?.1.trim();
        let (start, end) = spec.split_once('-')?;

        Some((start.parse().ok()?, end.parse().ok()?))
    }

    fn handle_connection(mut stream: TcpStream, body: &[u8], behavior: Behavior) {
        let request = read_request(&mut stream);
        let is_head = request.starts_with("HEAD");
        let range = parse_range(&request);

        let response = if is_head {
            match behavior {
                Behavior::Full => format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nAccept-Ranges: bytes\r\n\
                     Connection: close\r\n\r\n",
                    body.len(),
                ),
                Behavior::NoHead | Behavior::NoRanges => {
                    "HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\n\
                     Connection: close\r\n\r\n"
                        .to_owned()
                }
            }
        } else {
            match (behavior, range) {
                (Behavior::NoRanges, _) | (_, None) => {
                    let mut response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len(),
                    );
                    response.push_str(std::str::from_utf8(body).unwrap());
                    response
                }
                (_, Some((start, end))) => {
                    let end = end.min(body.len() as u64 - 1);
                    let slice = &body[start as usize..=end as usize];
                    let mut response = format!(
                        "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\n\
                         Content-Range: bytes {start}-{end}/{}\r\nConnection: close\r\n\r\n",
                        slice.len(),
                        body.len(),
                    );
                    response.push_str(std::str::from_utf8(slice).unwrap());
                    response
                }
            }
        };

        stream.write_all(response.as_bytes()).unwrap();
    }

    fn spawn_server(body: &'static [u8], behavior: Behavior) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else {
                    break;
                };

                handle_connection(stream, body, behavior);
            }
        });

        format!("http://{addr}/payload.zip")
    }

    const BODY: &[u8] = b"The quick brown fox jumps over the lazy dog";

    #[test]
    fn init_via_head() {
        let url = spawn_server(BODY, Behavior::Full);
        let reader = HttpRangeReader::new(&url).unwrap();

        assert_eq!(reader.size().unwrap(), BODY.len() as u64);
    }

    #[test]
    fn init_via_range_probe() {
        let url = spawn_server(BODY, Behavior::NoHead);
        let reader = HttpRangeReader::new(&url).unwrap();

        assert_eq!(reader.size().unwrap(), BODY.len() as u64);
    }

    #[test]
    fn rejects_server_without_range_support() {
        let url = spawn_server(BODY, Behavior::NoRanges);
        let err = HttpRangeReader::new(&url).unwrap_err();

        assert!(matches!(err, Error::RangeNotSupported(200)));
        assert!(err.to_string().contains("may not support Range"));
    }

    #[test]
    fn reads_span_chunks() {
        let url = spawn_server(BODY, Behavior::Full);
        let reader = HttpRangeReader::with_options(&url, 8, None).unwrap();

        let mut buf = vec![0u8; BODY.len()];
        reader.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(buf, BODY);

        let mut buf = [0u8; 9];
        reader.read_exact_at(&mut buf, 4).unwrap();
        assert_eq!(&buf, b"quick bro");
    }

    #[test]
    fn reads_clamp_at_end_of_file() {
        let url = spawn_server(BODY, Behavior::Full);
        let reader = HttpRangeReader::with_options(&url, 8, None).unwrap();

        let mut buf = [0u8; 16];
        let n = reader.read_at(&mut buf, BODY.len() as u64 - 3).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf[..n], b"dog");

        let n = reader.read_at(&mut buf, BODY.len() as u64 + 10).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn chunks_are_cached() {
        let url = spawn_server(BODY, Behavior::Full);
        let reader = HttpRangeReader::with_options(&url, 8, None).unwrap();

        let mut buf = [0u8; 4];
        reader.read_exact_at(&mut buf, 0).unwrap();
        reader.read_exact_at(&mut buf, 2).unwrap();

        let cache = reader.cache.lock().unwrap();
        assert_eq!(cache.chunks.len(), 1);
        assert_eq!(cache.cached_bytes, 8);
    }

    #[test]
    fn cache_limit_evicts_oldest() {
        let url = spawn_server(BODY, Behavior::Full);
        let reader = HttpRangeReader::with_options(&url, 8, Some(16)).unwrap();

        let mut buf = [0u8; 4];
        reader.read_exact_at(&mut buf, 0).unwrap();
        reader.read_exact_at(&mut buf, 8).unwrap();
        reader.read_exact_at(&mut buf, 16).unwrap();

        let cache = reader.cache.lock().unwrap();
        assert_eq!(cache.chunks.len(), 2);
        assert!(!cache.chunks.contains_key(&0));
        assert!(cache.chunks.contains_key(&16));
    }
}
