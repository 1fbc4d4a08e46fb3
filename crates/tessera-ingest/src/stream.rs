//! Byte-stream adapters used while expanding containers.
//!
//! Container bytes are fed to the decompressor in fixed-size chunks through a
//! progress adapter that counts *compressed* bytes consumed, the only place the
//! total is known ahead of time.

use std::io::{self, Read};

use flate2::read::GzDecoder;

/// Default chunk size fed to decompressors.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Caps every read at `chunk_size` bytes.
pub struct ChunkedReader<R> {
    inner: R,
    chunk_size: usize,
}

impl<R: Read> ChunkedReader<R> {
    /// Wraps `inner`. A zero chunk size is treated as one byte.
    pub fn new(inner: R, chunk_size: usize) -> Self {
        Self {
            inner,
            chunk_size: chunk_size.max(1),
        }
    }
}

impl<R: Read> Read for ChunkedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.chunk_size);
        self.inner.read(&mut buf[..n])
    }
}

/// Reports the running total of bytes read after every read.
pub struct ProgressReader<R, F> {
    inner: R,
    consumed: u64,
    callback: F,
}

impl<R: Read, F: FnMut(u64)> ProgressReader<R, F> {
    /// Wraps `inner`, calling `callback(total_bytes_read)` as bytes flow.
    pub fn new(inner: R, callback: F) -> Self {
        Self {
            inner,
            consumed: 0,
            callback,
        }
    }

    /// Bytes read so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }
}

impl<R: Read, F: FnMut(u64)> Read for ProgressReader<R, F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.consumed += n as u64;
            (self.callback)(self.consumed);
        }
        Ok(n)
    }
}

/// Streaming gzip decompression of `data`, fed in `chunk_size` pieces.
/// `on_progress` receives the fraction of compressed input consumed.
pub fn gunzip_reader<'a, F>(
    data: &'a [u8],
    chunk_size: usize,
    mut on_progress: F,
) -> impl Read + 'a
where
    F: FnMut(f64) + 'a,
{
    let total = data.len().max(1) as f64;
    let progress = ProgressReader::new(ChunkedReader::new(data, chunk_size), move |n| {
        on_progress((n as f64 / total).min(1.0))
    });
    GzDecoder::new(progress)
}

/// Reads at most `limit` bytes. Returns `Err(len)` with the full length when
/// the stream is longer, draining the remainder without keeping it.
pub fn read_limited<R: Read>(mut reader: R, limit: u64) -> io::Result<Result<Vec<u8>, u64>> {
    let mut buf = Vec::new();
    (&mut reader).take(limit).read_to_end(&mut buf)?;
    let rest = io::copy(&mut reader, &mut io::sink())?;
    if rest > 0 {
        Ok(Err(buf.len() as u64 + rest))
    } else {
        Ok(Ok(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn test_chunked_reader_caps_reads() {
        let data = vec![7u8; 100];
        let mut r = ChunkedReader::new(&data[..], 16);
        let mut buf = [0u8; 64];
        assert_eq!(r.read(&mut buf).unwrap(), 16);
        let mut rest = Vec::new();
        r.read_to_end(&mut rest).unwrap();
        assert_eq!(rest.len(), 84);
    }

    #[test]
    fn test_progress_reader_counts() {
        let data = vec![1u8; 1000];
        let mut seen = Vec::new();
        {
            let mut r = ProgressReader::new(ChunkedReader::new(&data[..], 300), |n| seen.push(n));
            io::copy(&mut r, &mut io::sink()).unwrap();
        }
        assert_eq!(seen, vec![300, 600, 900, 1000]);
    }

    #[test]
    fn test_gunzip_reports_compressed_fraction() {
        let plain: Vec<u8> = (0..200_000u32).flat_map(|i| i.to_le_bytes()).collect();
        let packed = gzip(&plain);
        let mut fractions = Vec::new();
        let mut out = Vec::new();
        gunzip_reader(&packed, 4096, |f| fractions.push(f))
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, plain);
        assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(fractions.last().copied(), Some(1.0));
    }

    #[test]
    fn test_gunzip_rejects_garbage() {
        let mut out = Vec::new();
        assert!(gunzip_reader(b"not gzip at all", 4, |_| {})
            .read_to_end(&mut out)
            .is_err());
    }

    #[test]
    fn test_read_limited() {
        let data = vec![0u8; 50];
        assert_eq!(read_limited(&data[..], 50).unwrap(), Ok(data.clone()));
        assert_eq!(read_limited(&data[..], 49).unwrap(), Err(50));
    }
}
