//! Archive expansion.
//!
//! A container is expanded in one synchronous pass into [`WorkItem`]s so no
//! decoder state is held across an await. Leaf entries larger than the size
//! ceiling are drained and recorded by length only; nested containers are
//! always read in full.

use std::io::{Cursor, Read};

use bytes::Bytes;
use tar::EntryType;
use tracing::debug;

use crate::error::{IngestError, IngestResult};
use crate::stream::{gunzip_reader, read_limited};

/// Recognized container formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    /// `.zip`
    Zip,
    /// `.tar.gz` or `.tgz`
    TarGz,
    /// Any other `.gz`: one compressed member
    Gzip,
}

impl ContainerKind {
    /// Detects a container from a file name's suffix.
    pub fn detect(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".zip") {
            Some(ContainerKind::Zip)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(ContainerKind::TarGz)
        } else if lower.ends_with(".gz") {
            Some(ContainerKind::Gzip)
        } else {
            None
        }
    }
}

/// Bytes of one expanded entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Entry contents
    Bytes(Bytes),
    /// Over the size ceiling; only the length is known
    TooLarge(u64),
}

/// One entry produced by expanding a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    /// Full path, outermost input first
    pub path: Vec<String>,
    /// Contents
    pub payload: Payload,
}

impl WorkItem {
    /// The container kind of this entry, if it is one.
    pub fn container(&self) -> Option<ContainerKind> {
        self.path.last().and_then(|name| ContainerKind::detect(name))
    }
}

/// Limits applied while expanding.
#[derive(Debug, Clone, Copy)]
pub struct ExpandLimits {
    /// Leaf files above this many bytes are not kept
    pub size_limit: u64,
    /// Compressed bytes fed to the decompressor per read
    pub chunk_size: usize,
}

/// Appends an entry name to `parent`, dropping empty and `.` segments.
pub fn child_path(parent: &[String], name: &str) -> Vec<String> {
    let mut path = parent.to_vec();
    path.extend(
        name.split('/')
            .filter(|s| !s.is_empty() && *s != ".")
            .map(str::to_string),
    );
    path
}

fn read_entry<R: Read>(
    reader: R,
    path: Vec<String>,
    limits: &ExpandLimits,
) -> std::io::Result<WorkItem> {
    let is_container = path.last().and_then(|n| ContainerKind::detect(n)).is_some();
    let limit = if is_container { u64::MAX } else { limits.size_limit };
    let payload = match read_limited(reader, limit)? {
        Ok(data) => Payload::Bytes(Bytes::from(data)),
        Err(len) => Payload::TooLarge(len),
    };
    Ok(WorkItem { path, payload })
}

fn corrupt(path: &[String], reason: impl ToString) -> IngestError {
    IngestError::CorruptArchive {
        path: path.join("/"),
        reason: reason.to_string(),
    }
}

/// Expands the container at `path`. `on_progress` receives the fraction of
/// the container consumed.
pub fn expand(
    kind: ContainerKind,
    path: &[String],
    data: &[u8],
    limits: &ExpandLimits,
    on_progress: &mut dyn FnMut(f64),
) -> IngestResult<Vec<WorkItem>> {
    let items = match kind {
        ContainerKind::Zip => expand_zip(path, data, limits, on_progress)?,
        ContainerKind::TarGz => expand_tar_gz(path, data, limits, on_progress)?,
        ContainerKind::Gzip => expand_gzip(path, data, limits, on_progress)?,
    };
    debug!(path = %path.join("/"), ?kind, entries = items.len(), "expanded container");
    Ok(items)
}

fn expand_zip(
    path: &[String],
    data: &[u8],
    limits: &ExpandLimits,
    on_progress: &mut dyn FnMut(f64),
) -> IngestResult<Vec<WorkItem>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data)).map_err(|e| corrupt(path, e))?;
    let total = archive.len();
    let mut items = Vec::with_capacity(total);
    for i in 0..total {
        let entry = archive.by_index(i).map_err(|e| corrupt(path, e))?;
        if entry.is_dir() {
            continue;
        }
        let child = child_path(path, entry.name());
        items.push(read_entry(entry, child, limits).map_err(|e| corrupt(path, e))?);
        on_progress((i + 1) as f64 / total as f64);
    }
    Ok(items)
}

fn expand_tar_gz(
    path: &[String],
    data: &[u8],
    limits: &ExpandLimits,
    on_progress: &mut dyn FnMut(f64),
) -> IngestResult<Vec<WorkItem>> {
    let mut archive = tar::Archive::new(gunzip_reader(data, limits.chunk_size, on_progress));
    let mut items = Vec::new();
    for entry in archive.entries().map_err(|e| corrupt(path, e))? {
        let entry = entry.map_err(|e| corrupt(path, e))?;
        if entry.header().entry_type() != EntryType::Regular {
            continue;
        }
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let child = child_path(path, &name);
        items.push(read_entry(entry, child, limits).map_err(|e| corrupt(path, e))?);
    }
    Ok(items)
}

fn expand_gzip(
    path: &[String],
    data: &[u8],
    limits: &ExpandLimits,
    on_progress: &mut dyn FnMut(f64),
) -> IngestResult<Vec<WorkItem>> {
    let name = path.last().map(String::as_str).unwrap_or("");
    let inner = &name[..name.len().saturating_sub(3)];
    let inner = if inner.is_empty() { "data" } else { inner };
    let reader = gunzip_reader(data, limits.chunk_size, on_progress);
    let item = read_entry(reader, child_path(path, inner), limits).map_err(|e| corrupt(path, e))?;
    Ok(vec![item])
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    const LIMITS: ExpandLimits = ExpandLimits {
        size_limit: 1024,
        chunk_size: 64,
    };

    fn zip_of(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut w = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in entries {
            if name.ends_with('/') {
                w.add_directory(name.trim_end_matches('/'), SimpleFileOptions::default()).unwrap();
            } else {
                w.start_file(*name, SimpleFileOptions::default()).unwrap();
                w.write_all(data).unwrap();
            }
        }
        w.finish().unwrap().into_inner()
    }

    fn tar_gz_of(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let enc = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(enc);
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_entry_type(EntryType::Regular);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        let mut dir = tar::Header::new_gnu();
        dir.set_entry_type(EntryType::Directory);
        dir.set_size(0);
        dir.set_mode(0o755);
        dir.set_cksum();
        builder.append_data(&mut dir, "somedir/", std::io::empty()).unwrap();
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn path(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_detect() {
        assert_eq!(ContainerKind::detect("a.zip"), Some(ContainerKind::Zip));
        assert_eq!(ContainerKind::detect("a.TAR.GZ"), Some(ContainerKind::TarGz));
        assert_eq!(ContainerKind::detect("a.tgz"), Some(ContainerKind::TarGz));
        assert_eq!(ContainerKind::detect("a.json.gz"), Some(ContainerKind::Gzip));
        assert_eq!(ContainerKind::detect("a.json"), None);
    }

    #[test]
    fn test_child_path_skips_dot_segments() {
        let p = child_path(&path(&["x.zip"]), "./a//b/./c.json");
        assert_eq!(p, path(&["x.zip", "a", "b", "c.json"]));
    }

    #[test]
    fn test_zip_skips_directories() {
        let data = zip_of(&[("dir/", &b""[..]), ("dir/a.json", &b"[]"[..]), ("b.csv", &b"x\n1\n"[..])]);
        let mut fractions = Vec::new();
        let items = expand(ContainerKind::Zip, &path(&["x.zip"]), &data, &LIMITS, &mut |f| fractions.push(f))
            .unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].path, path(&["x.zip", "dir", "a.json"]));
        assert_eq!(items[0].payload, Payload::Bytes(Bytes::from_static(b"[]")));
        assert_eq!(fractions.last().copied(), Some(1.0));
    }

    #[test]
    fn test_size_ceiling_applies_to_leaves_only() {
        let big = vec![b'x'; 2000];
        let nested = zip_of(&[("inner.json", &big[..])]);
        let data = zip_of(&[("big.json", &big[..]), ("nested.zip", &nested[..])]);
        let items = expand(ContainerKind::Zip, &path(&["x.zip"]), &data, &LIMITS, &mut |_| {}).unwrap();
        assert_eq!(items[0].payload, Payload::TooLarge(2000));
        assert!(matches!(items[1].payload, Payload::Bytes(_)));
        assert_eq!(items[1].container(), Some(ContainerKind::Zip));
    }

    #[test]
    fn test_tar_gz_regular_files_only() {
        let data = tar_gz_of(&[("./a/one.json", &b"[1]"[..]), ("two.txt", &b"hi"[..])]);
        let items = expand(ContainerKind::TarGz, &path(&["x.tar.gz"]), &data, &LIMITS, &mut |_| {}).unwrap();
        let paths: Vec<_> = items.iter().map(|i| i.path.join("/")).collect();
        assert_eq!(paths, vec!["x.tar.gz/a/one.json", "x.tar.gz/two.txt"]);
    }

    #[test]
    fn test_plain_gzip_member_name() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"{}").unwrap();
        let data = enc.finish().unwrap();
        let items = expand(ContainerKind::Gzip, &path(&["log.json.gz"]), &data, &LIMITS, &mut |_| {}).unwrap();
        assert_eq!(items[0].path, path(&["log.json.gz", "log.json"]));
        assert_eq!(items[0].payload, Payload::Bytes(Bytes::from_static(b"{}")));
    }

    #[test]
    fn test_corrupt_archives() {
        for kind in [ContainerKind::Zip, ContainerKind::TarGz, ContainerKind::Gzip] {
            let err = expand(kind, &path(&["bad"]), b"definitely not an archive", &LIMITS, &mut |_| {})
                .unwrap_err();
            assert!(matches!(err, IngestError::CorruptArchive { ref path, .. } if path == "bad"), "{:?}", kind);
        }
    }
}
