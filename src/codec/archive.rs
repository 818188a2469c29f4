//! Full-backup archive stream built on `tar`.
//!
//! Entry paths are `apps/<package>/<domain token>/<relative path>`; the
//! domain directory itself is written with an empty relative path.

use crate::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::fs::{File, Metadata};
use std::io::{self, Read, Write};
use std::path::Path;
use tar::{Archive, Builder, EntryType, Header};
use tracing::{debug, warn};

/// Top-level directory of every archive entry
pub const APPS_DIR: &str = "apps";

const BLOCK_SIZE: u64 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
}

/// Metadata carried for one file or directory in the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub package: String,
    /// Domain token, e.g. `f` or `shared/0`
    pub domain: String,
    /// `/`-separated path relative to the domain root; empty for the root itself
    pub path: String,
    pub kind: EntryKind,
    /// Permission bits; `None` means "do not restore mode or mtime"
    pub mode: Option<u32>,
    pub modified: DateTime<Utc>,
    pub size: u64,
}

impl ArchiveEntry {
    /// Build an entry from `lstat` metadata of a file found under a domain root
    pub fn from_metadata(
        package: &str,
        domain: &str,
        relative: &Path,
        metadata: &Metadata,
    ) -> Self {
        let kind = if metadata.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };

        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::MetadataExt;
            Some(metadata.mode() & 0o7777)
        };
        #[cfg(not(unix))]
        let mode = Some(if kind == EntryKind::Directory { 0o700 } else { 0o600 });

        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        let path = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");

        Self {
            package: package.to_string(),
            domain: domain.to_string(),
            path,
            kind,
            mode,
            modified,
            size: if kind == EntryKind::File { metadata.len() } else { 0 },
        }
    }

    /// Path of this entry inside the archive
    pub fn archive_path(&self) -> String {
        if self.path.is_empty() {
            format!("{}/{}/{}", APPS_DIR, self.package, self.domain)
        } else {
            format!("{}/{}/{}/{}", APPS_DIR, self.package, self.domain, self.path)
        }
    }

    /// Split an archive path back into `(package, domain, relative path)`
    pub fn parse_archive_path(raw: &str) -> Option<(String, String, String)> {
        let mut parts = raw.trim_end_matches('/').splitn(3, '/');
        if parts.next()? != APPS_DIR {
            return None;
        }
        let package = parts.next().filter(|p| !p.is_empty())?;
        let rest = parts.next()?;

        let (domain, path) = match rest.split_once('/') {
            Some(("shared", tail)) => match tail.split_once('/') {
                Some((index, path)) => (format!("shared/{}", index), path),
                None => (format!("shared/{}", tail), ""),
            },
            Some((domain, path)) => (domain.to_string(), path),
            None => (rest.to_string(), ""),
        };
        if domain.is_empty() {
            return None;
        }
        Some((package.to_string(), domain, path.to_string()))
    }

    /// Bytes this entry occupies in a tar stream
    pub fn encoded_len(&self) -> u64 {
        BLOCK_SIZE + self.size.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
    }
}

/// Receives files accepted by the tree walker
pub trait ArchiveOutput {
    /// Encode one file or directory; `source` is the canonical path to read
    /// file contents from. Returns the number of stream bytes accounted.
    fn encode_file(&mut self, entry: &ArchiveEntry, source: &Path) -> Result<u64>;
}

/// Writes accepted files into a tar stream
pub struct TarArchiveWriter<W: Write> {
    builder: Builder<W>,
}

impl<W: Write> TarArchiveWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            builder: Builder::new(inner),
        }
    }

    /// Write the end-of-archive marker and return the underlying stream
    pub fn finish(self) -> Result<W> {
        Ok(self.builder.into_inner()?)
    }
}

impl<W: Write> ArchiveOutput for TarArchiveWriter<W> {
    fn encode_file(&mut self, entry: &ArchiveEntry, source: &Path) -> Result<u64> {
        let mut header = Header::new_gnu();
        header.set_mode(entry.mode.unwrap_or(0o600));
        header.set_mtime(entry.modified.timestamp().max(0) as u64);

        let path = entry.archive_path();
        match entry.kind {
            EntryKind::Directory => {
                header.set_entry_type(EntryType::Directory);
                header.set_size(0);
                self.builder.append_data(&mut header, &path, io::empty())?;
            }
            EntryKind::File => {
                header.set_entry_type(EntryType::Regular);
                header.set_size(entry.size);
                let file = File::open(source)?;
                let mut body = file.take(entry.size);
                self.builder.append_data(&mut header, &path, &mut body)?;
                if body.limit() != 0 {
                    return Err(Error::protocol(format!(
                        "{} shrank while being archived",
                        source.display()
                    )));
                }
            }
        }

        debug!("Archived {}", path);
        Ok(entry.encoded_len())
    }
}

/// Counts what a backup would write without writing anything
#[derive(Debug, Default, Clone)]
pub struct MeasuringOutput {
    total_bytes: u64,
    entries: u64,
}

impl MeasuringOutput {
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }
}

impl ArchiveOutput for MeasuringOutput {
    fn encode_file(&mut self, entry: &ArchiveEntry, _source: &Path) -> Result<u64> {
        let len = entry.encoded_len();
        self.total_bytes += len;
        self.entries += 1;
        Ok(len)
    }
}

/// Decodes a tar stream written by [`TarArchiveWriter`]
pub struct TarArchiveReader<R: Read> {
    archive: Archive<R>,
}

impl<R: Read> TarArchiveReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            archive: Archive::new(inner),
        }
    }

    /// Visit every file and directory entry in order.
    ///
    /// `visit` receives the entry metadata and a reader over its payload.
    /// Payload left unread by the visitor is skipped. Entries whose path
    /// does not follow the `apps/<package>/<domain>/...` layout, and entry
    /// types other than regular files and directories, are skipped.
    pub fn decode_stream<F>(&mut self, mut visit: F) -> Result<u64>
    where
        F: FnMut(&ArchiveEntry, &mut dyn Read) -> Result<()>,
    {
        let mut visited = 0u64;
        for entry in self.archive.entries()? {
            let mut entry = entry?;
            let raw_path = String::from_utf8_lossy(&entry.path_bytes()).into_owned();

            let kind = match entry.header().entry_type() {
                EntryType::Regular | EntryType::Continuous => EntryKind::File,
                EntryType::Directory => EntryKind::Directory,
                other => {
                    debug!("Skipping archive entry {} of type {:?}", raw_path, other);
                    continue;
                }
            };

            let Some((package, domain, path)) = ArchiveEntry::parse_archive_path(&raw_path) else {
                warn!("Skipping archive entry with unexpected path {}", raw_path);
                continue;
            };

            let header = entry.header();
            let mtime = header.mtime().unwrap_or(0);
            let meta = ArchiveEntry {
                package,
                domain,
                path,
                kind,
                mode: header.mode().ok(),
                modified: Utc
                    .timestamp_opt(mtime as i64, 0)
                    .single()
                    .unwrap_or_else(Utc::now),
                size: entry.size(),
            };

            visit(&meta, &mut entry)?;
            visited += 1;
        }
        Ok(visited)
    }
}
