//! Full restore from an archive stream.
//!
//! Every entry's payload is consumed whether or not it is written, so a
//! refused entry never desynchronizes the stream.

use crate::codec::{EntryKind, TarArchiveReader};
use crate::domain::{Domain, DomainResolver};
use crate::paths::{apply_mode_and_mtime, contained_path};
use crate::scheme::BackupScheme;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, span, warn, Level};

const RESTORE_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RestoreStats {
    pub files: u64,
    pub directories: u64,
    /// Entries consumed without being written
    pub skipped: u64,
    pub bytes: u64,
}

/// Where a restored entry goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreTarget {
    pub path: PathBuf,
    /// Whether archived mode and mtime are applied
    pub keep_metadata: bool,
}

pub struct FullRestore<'a> {
    package: &'a str,
    resolver: &'a DomainResolver,
    scheme: &'a BackupScheme,
}

impl<'a> FullRestore<'a> {
    pub fn new(package: &'a str, resolver: &'a DomainResolver, scheme: &'a BackupScheme) -> Self {
        Self {
            package,
            resolver,
            scheme,
        }
    }

    /// Domain root that restored data may be written under
    fn domain_root(&self, domain: Domain) -> Option<(PathBuf, bool)> {
        match domain {
            Domain::NoBackup | Domain::DeviceNoBackup | Domain::SharedVolume(_) => None,
            Domain::ManagedExternal => Some((self.resolver.directory_for(domain)?, false)),
            other => Some((self.resolver.directory_for(other)?, true)),
        }
    }

    /// Map a wire `(domain, relative path)` to a destination, or `None` if
    /// the entry must be drained instead: unknown or non-restorable domain,
    /// a path escaping its domain root, or a path the scheme rules out.
    pub fn resolve_destination(&self, domain_token: &str, relative: &str) -> Option<RestoreTarget> {
        let Some(domain) = Domain::from_token(domain_token) else {
            warn!("Unrecognized restore domain '{}'", domain_token);
            return None;
        };
        let (root, keep_metadata) = self.domain_root(domain)?;

        let Some(path) = contained_path(&root, relative) else {
            if !relative.is_empty() {
                warn!("Dropping path escape attempt {}/{}", domain_token, relative);
            }
            return None;
        };
        if !self.scheme.is_eligible(self.resolver, &path) {
            debug!("{} not eligible for restore", path.display());
            return None;
        }
        Some(RestoreTarget { path, keep_metadata })
    }

    pub fn run<R: Read>(&self, reader: &mut TarArchiveReader<R>) -> Result<RestoreStats> {
        let span = span!(Level::INFO, "full_restore", package = self.package);
        let _enter = span.enter();

        let mut stats = RestoreStats::default();
        reader.decode_stream(|entry, data| {
            let target = if entry.package == self.package {
                self.resolve_destination(&entry.domain, &entry.path)
            } else {
                warn!("Entry {} belongs to another package", entry.archive_path());
                None
            };

            let mode = match &target {
                Some(t) if t.keep_metadata => entry.mode,
                _ => None,
            };
            let written = restore_file(
                data,
                entry.size,
                entry.kind,
                mode,
                entry.modified,
                target.as_ref().map(|t| t.path.as_path()),
            )?;

            match (written, entry.kind) {
                (true, EntryKind::File) => stats.files += 1,
                (true, EntryKind::Directory) => stats.directories += 1,
                (false, _) => stats.skipped += 1,
            }
            stats.bytes += entry.size;
            Ok(())
        })?;

        info!(
            "Restored {} files and {} directories, skipped {}",
            stats.files, stats.directories, stats.skipped
        );
        Ok(stats)
    }
}

/// Consume one entry's payload, writing it to `destination` when given.
///
/// Returns whether the entry was materialized. A write failure removes the
/// partial file but the payload is still drained; only a read failure on
/// `data` is an error. `mode` of `None` leaves permissions and mtime alone.
pub fn restore_file(
    data: &mut dyn Read,
    size: u64,
    kind: EntryKind,
    mode: Option<u32>,
    modified: DateTime<Utc>,
    destination: Option<&Path>,
) -> Result<bool> {
    let mut out_path = destination.map(Path::to_path_buf);
    let mut out_file = None;

    if let Some(path) = destination {
        let opened = match kind {
            EntryKind::Directory => fs::create_dir_all(path),
            EntryKind::File => open_for_restore(path).map(|file| out_file = Some(file)),
        };
        if let Err(e) = opened {
            warn!("Unable to create {}: {}", path.display(), e);
            out_path = None;
        }
    }

    let mut buffer = vec![0u8; RESTORE_BUFFER_SIZE];
    let mut remaining = size;
    while remaining > 0 {
        let want = buffer.len().min(remaining as usize);
        let n = data.read(&mut buffer[..want])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("entry payload ended with {} bytes missing", remaining),
            )
            .into());
        }
        remaining -= n as u64;

        if let Some(file) = out_file.as_mut() {
            if let Err(e) = file.write_all(&buffer[..n]) {
                warn!("Write failed, dropping partial file: {}", e);
                out_file = None;
                if let Some(path) = out_path.take() {
                    let _ = fs::remove_file(path);
                }
            }
        }
    }
    drop(out_file);

    let Some(path) = out_path else {
        return Ok(false);
    };
    if let Some(mode) = mode {
        if let Err(e) = apply_mode_and_mtime(&path, mode, modified) {
            warn!("Unable to restore metadata of {}: {}", path.display(), e);
        }
    }
    Ok(true)
}

fn open_for_restore(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    File::create(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::TarArchiveWriter;
    use crate::domain::AppDataLayout;
    use crate::walker::{FullBackup, FullBackupOptions, IgnoreQuota};
    use pretty_assertions::assert_eq;
    use std::io::Cursor;
    use tar::{Builder, EntryType, Header};
    use tempfile::TempDir;
    use walkdir::WalkDir;

    fn resolver(root: &Path) -> Result<DomainResolver> {
        DomainResolver::new(
            &AppDataLayout {
                data_dir: root.join("data"),
                device_data_dir: root.join("de"),
                external_files_dir: Some(root.join("ext")),
                native_library_dir: None,
            },
            Vec::new(),
        )
    }

    fn raw_entry(builder: &mut Builder<Vec<u8>>, path: &str, body: &[u8]) -> io::Result<()> {
        let mut header = Header::new_old();
        let name = &mut header.as_old_mut().name;
        name[..path.len()].copy_from_slice(path.as_bytes());
        header.set_size(body.len() as u64);
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();
        builder.append(&header, body)
    }

    #[test]
    fn test_backup_then_restore() -> Result<()> {
        let source = TempDir::new()?;
        let data = source.path().join("data");
        fs::create_dir_all(data.join("files/notes"))?;
        fs::create_dir_all(data.join("no_backup"))?;
        fs::write(data.join("files/notes/a.txt"), b"alpha")?;
        fs::write(data.join("toplevel.cfg"), b"cfg")?;

        let source_resolver = resolver(source.path())?;
        let scheme = BackupScheme::new("com.example", None);
        let mut writer = TarArchiveWriter::new(Vec::new());
        FullBackup::new("com.example", &source_resolver, &scheme, FullBackupOptions::default())
            .run(&mut writer, &mut IgnoreQuota)?;
        let archive = writer.finish()?;

        let target = TempDir::new()?;
        let target_resolver = resolver(target.path())?;
        let stats = FullRestore::new("com.example", &target_resolver, &scheme)
            .run(&mut TarArchiveReader::new(Cursor::new(archive)))?;

        let restored = target.path().join("data");
        assert_eq!(fs::read(restored.join("files/notes/a.txt"))?, b"alpha");
        assert_eq!(fs::read(restored.join("toplevel.cfg"))?, b"cfg");
        assert_eq!(stats.files, 2);
        Ok(())
    }

    #[test]
    fn test_escaping_entries_are_drained() -> Result<()> {
        let temp = TempDir::new()?;
        let resolver = resolver(temp.path())?;
        let scheme = BackupScheme::new("com.example", None);

        let mut builder = Builder::new(Vec::new());
        raw_entry(&mut builder, "apps/com.example/f/../../../evil.txt", b"pwned")?;
        raw_entry(&mut builder, "apps/com.example/nb/token", b"secret")?;
        raw_entry(&mut builder, "apps/com.other/f/theirs.txt", b"nope")?;
        raw_entry(&mut builder, "apps/com.example/f/ok.txt", b"fine")?;
        let archive = builder.into_inner()?;

        let stats = FullRestore::new("com.example", &resolver, &scheme)
            .run(&mut TarArchiveReader::new(Cursor::new(archive)))?;
        assert_eq!(stats.skipped, 3);
        assert_eq!(stats.files, 1);

        let files: Vec<PathBuf> = WalkDir::new(temp.path())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.path().strip_prefix(temp.path()).unwrap().to_path_buf())
            .collect();
        assert_eq!(files, vec![PathBuf::from("data/files/ok.txt")]);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_dotdot_through_symlink_is_drained() -> Result<()> {
        let temp = TempDir::new()?;
        let resolver = resolver(temp.path())?;
        let scheme = BackupScheme::new("com.example", None);
        let outside = temp.path().join("outside");
        fs::create_dir_all(temp.path().join("data/files"))?;
        fs::create_dir_all(&outside)?;
        std::os::unix::fs::symlink(&outside, temp.path().join("data/files/link"))?;

        let restore = FullRestore::new("com.example", &resolver, &scheme);
        assert_eq!(restore.resolve_destination("f", "link/secret"), None);
        assert_eq!(restore.resolve_destination("f", "missing/../link/secret"), None);

        let mut builder = Builder::new(Vec::new());
        raw_entry(&mut builder, "apps/com.example/f/missing/../link/secret", b"pwned")?;
        let archive = builder.into_inner()?;
        let stats = restore.run(&mut TarArchiveReader::new(Cursor::new(archive)))?;

        assert_eq!(stats.skipped, 1);
        assert!(!outside.join("secret").exists());
        Ok(())
    }

    #[test]
    fn test_excluded_destination_is_drained() -> Result<()> {
        let temp = TempDir::new()?;
        let resolver = resolver(temp.path())?;
        let xml = r#"<full-backup-content>
            <exclude domain="file" path="skip.txt"/>
        </full-backup-content>"#;
        let scheme = BackupScheme::new("com.example", Some(xml.to_string()));

        let files = resolver.directory_for(Domain::Files).unwrap();
        let restore = FullRestore::new("com.example", &resolver, &scheme);
        assert_eq!(
            restore.resolve_destination("f", "keep.txt"),
            Some(RestoreTarget {
                path: files.join("keep.txt"),
                keep_metadata: true
            })
        );
        assert_eq!(restore.resolve_destination("f", "skip.txt"), None);
        Ok(())
    }

    #[test]
    fn test_external_domain_skips_metadata() -> Result<()> {
        let temp = TempDir::new()?;
        let resolver = resolver(temp.path())?;
        let scheme = BackupScheme::new("com.example", None);
        let target = FullRestore::new("com.example", &resolver, &scheme)
            .resolve_destination("ef", "photo.jpg")
            .unwrap();
        assert!(!target.keep_metadata);
        Ok(())
    }

    #[test]
    fn test_restore_file_drains_without_destination() -> Result<()> {
        let mut data = Cursor::new(vec![7u8; 100_000]);
        let written =
            restore_file(&mut data, 70_000, EntryKind::File, Some(0o600), Utc::now(), None)?;
        assert!(!written);
        assert_eq!(data.position(), 70_000);

        let mut short = Cursor::new(vec![1u8; 10]);
        assert!(restore_file(&mut short, 20, EntryKind::File, None, Utc::now(), None).is_err());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_restore_file_masks_mode() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let temp = TempDir::new()?;
        let path = temp.path().join("x/y.bin");
        let mut data = Cursor::new(b"payload".to_vec());
        let mode = Some(0o4777);
        assert!(restore_file(&mut data, 7, EntryKind::File, mode, Utc::now(), Some(&path))?);
        assert_eq!(fs::metadata(&path)?.permissions().mode() & 0o7777, 0o700);
        Ok(())
    }
}
