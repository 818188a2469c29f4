//! Backup of a fixed list of files from one directory.
//!
//! State snapshot:
//!
//! ```text
//! [version: i32][count: i32]{[name: string][mtime_ms: i64][mode: i32][size: i64][crc32: i64]}*
//! ```
//!
//! Entity payload: `[version: i32][mode: u32]` followed by the file bytes.

use super::{BackupHelper, RestoreEntity};
use crate::codec::{read_string, write_string, EntityOutput};
use crate::paths::{contained_path, restore_mode};
use crate::{Error, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};

pub const FILE_STATE_VERSION: i32 = 1;
pub const FILE_PAYLOAD_VERSION: i32 = 1;

const PAYLOAD_HEADER_LEN: usize = 8;

/// What the last pass saw of one file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    pub mtime_ms: i64,
    pub mode: i32,
    pub size: i64,
    pub crc32: i64,
}

impl FileRecord {
    /// Stat and checksum a file on disk
    pub fn snapshot(path: &Path) -> io::Result<Self> {
        let metadata = fs::metadata(path)?;
        let mtime_ms = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::MetadataExt;
            (metadata.mode() & 0o7777) as i32
        };
        #[cfg(not(unix))]
        let mode = 0o600;

        let mut hasher = crc32fast::Hasher::new();
        let mut file = File::open(path)?;
        let mut buf = [0u8; 8192];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok(Self {
            mtime_ms,
            mode,
            size: metadata.len() as i64,
            crc32: hasher.finalize() as i64,
        })
    }
}

/// Read a file-set snapshot; anything unusable yields an empty map
pub fn read_file_state(old_state: Option<&mut dyn Read>) -> BTreeMap<String, FileRecord> {
    let Some(input) = old_state else {
        return BTreeMap::new();
    };

    let mut parse = || -> io::Result<BTreeMap<String, FileRecord>> {
        let mut state = BTreeMap::new();
        let version = input.read_i32::<BigEndian>()?;
        if version > FILE_STATE_VERSION {
            warn!("Prior file state from unrecognized version {}", version);
            return Ok(state);
        }
        let count = input.read_i32::<BigEndian>()?;
        for _ in 0..count.max(0) {
            let name = read_string(&mut *input)?;
            let record = FileRecord {
                mtime_ms: input.read_i64::<BigEndian>()?,
                mode: input.read_i32::<BigEndian>()?,
                size: input.read_i64::<BigEndian>()?,
                crc32: input.read_i64::<BigEndian>()?,
            };
            state.insert(name, record);
        }
        Ok(state)
    };

    match parse() {
        Ok(state) => state,
        Err(e) => {
            debug!("No usable prior file state: {}", e);
            BTreeMap::new()
        }
    }
}

pub fn write_file_state(
    new_state: &mut dyn Write,
    records: &BTreeMap<String, FileRecord>,
) -> Result<()> {
    new_state.write_i32::<BigEndian>(FILE_STATE_VERSION)?;
    new_state.write_i32::<BigEndian>(records.len() as i32)?;
    for (name, record) in records {
        write_string(&mut *new_state, name)?;
        new_state.write_i64::<BigEndian>(record.mtime_ms)?;
        new_state.write_i32::<BigEndian>(record.mode)?;
        new_state.write_i64::<BigEndian>(record.size)?;
        new_state.write_i64::<BigEndian>(record.crc32)?;
    }
    Ok(())
}

/// Helper that mirrors a named set of files under `base_dir`
pub struct FileBackupHelper {
    base_dir: PathBuf,
    files: Vec<String>,
    restored: BTreeSet<String>,
}

impl FileBackupHelper {
    pub fn new<I, S>(base_dir: impl Into<PathBuf>, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            base_dir: base_dir.into(),
            files: files.into_iter().map(Into::into).collect(),
            restored: BTreeSet::new(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn send_file(
        name: &str,
        path: &Path,
        record: &FileRecord,
        data: &mut dyn EntityOutput,
    ) -> Result<()> {
        let contents = fs::read(path).map_err(|e| Error::Payload {
            key: name.to_string(),
            reason: e.to_string(),
        })?;
        let size = i32::try_from(PAYLOAD_HEADER_LEN + contents.len()).map_err(|_| Error::Payload {
            key: name.to_string(),
            reason: format!("file of {} bytes is too large", contents.len()),
        })?;

        let mut header = Vec::with_capacity(PAYLOAD_HEADER_LEN);
        header.write_i32::<BigEndian>(FILE_PAYLOAD_VERSION)?;
        header.write_u32::<BigEndian>(record.mode as u32)?;

        data.write_entity_header(name, size)?;
        data.write_entity_data(&header)?;
        data.write_entity_data(&contents)?;
        Ok(())
    }

    fn write_restored(path: &Path, entity: &mut RestoreEntity<'_>) -> io::Result<()> {
        let payload = entity.read_payload()?;
        if payload.len() < PAYLOAD_HEADER_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "payload shorter than its header",
            ));
        }
        let mut header = &payload[..PAYLOAD_HEADER_LEN];
        let version = header.read_i32::<BigEndian>()?;
        if version > FILE_PAYLOAD_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("payload from unrecognized version {}", version),
            ));
        }
        let mode = header.read_u32::<BigEndian>()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, &payload[PAYLOAD_HEADER_LEN..])?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(restore_mode(mode)))?;
        }
        #[cfg(not(unix))]
        let _ = restore_mode(mode);
        Ok(())
    }
}

impl BackupHelper for FileBackupHelper {
    fn perform_backup(
        &mut self,
        old_state: Option<&mut dyn Read>,
        data: &mut dyn EntityOutput,
        new_state: &mut dyn Write,
    ) -> Result<()> {
        let old = read_file_state(old_state);
        let mut records = BTreeMap::new();

        for name in &self.files {
            let Some(path) = contained_path(&self.base_dir, name) else {
                warn!("File '{}' lies outside {}, skipping", name, self.base_dir.display());
                continue;
            };

            let record = match FileRecord::snapshot(&path) {
                Ok(record) => record,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    if old.contains_key(name) {
                        debug!("File '{}' deleted, sending deletion", name);
                        data.write_tombstone(name)?;
                    }
                    continue;
                }
                Err(e) => {
                    warn!("Unable to examine '{}': {}", path.display(), e);
                    continue;
                }
            };

            if old.get(name) != Some(&record) {
                debug!("File '{}' changed, sending {} bytes", name, record.size);
                match Self::send_file(name, &path, &record, data) {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!("{}", e);
                        continue;
                    }
                }
            }
            records.insert(name.clone(), record);
        }

        write_file_state(new_state, &records)
    }

    fn restore_entity(&mut self, entity: &mut RestoreEntity<'_>) -> Result<()> {
        let name = entity.key().to_string();
        let Some(path) = contained_path(&self.base_dir, &name) else {
            warn!("Refusing to restore '{}' outside {}", name, self.base_dir.display());
            return Ok(());
        };

        if entity.is_tombstone() {
            match fs::remove_file(&path) {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Unable to remove {}: {}", path.display(), e),
            }
            self.restored.remove(&name);
            return Ok(());
        }

        match Self::write_restored(&path, entity) {
            Ok(()) => {
                self.restored.insert(name);
            }
            Err(e) => {
                warn!("Unable to restore {}: {}", path.display(), e);
                let _ = fs::remove_file(&path);
            }
        }
        Ok(())
    }

    fn write_new_state_description(&mut self, new_state: &mut dyn Write) -> Result<()> {
        let mut records = BTreeMap::new();
        for name in &self.restored {
            let Some(path) = contained_path(&self.base_dir, name) else {
                continue;
            };
            match FileRecord::snapshot(&path) {
                Ok(record) => {
                    records.insert(name.clone(), record);
                }
                Err(e) => debug!("Restored file '{}' not recorded: {}", name, e),
            }
        }
        write_file_state(new_state, &records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{EntityReader, EntityWriter};
    use crate::dispatcher::HelperDispatcher;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;
    use tempfile::TempDir;
    use walkdir::WalkDir;

    type Pass = (Vec<(String, i32)>, Vec<u8>, Vec<u8>);

    fn backup(helper: &mut FileBackupHelper, old: Option<&[u8]>) -> Result<Pass> {
        let mut sink = EntityWriter::new(Vec::new());
        let mut state = Vec::new();
        let mut old = old.map(|s| Cursor::new(s.to_vec()));
        helper.perform_backup(old.as_mut().map(|c| c as &mut dyn Read), &mut sink, &mut state)?;
        let data = sink.finish()?;

        let mut reader = EntityReader::new(Cursor::new(data.clone()));
        let mut seen = Vec::new();
        while let Some(header) = reader.read_next_header()? {
            seen.push((header.key, header.size));
        }
        Ok((seen, data, state))
    }

    #[test]
    fn test_unchanged_files_are_not_resent() -> Result<()> {
        let temp = TempDir::new()?;
        fs::write(temp.path().join("a.txt"), b"alpha")?;
        fs::write(temp.path().join("b.txt"), b"bravo")?;
        let mut helper = FileBackupHelper::new(temp.path(), ["a.txt", "b.txt", "missing.txt"]);

        let (first, _, state) = backup(&mut helper, None)?;
        assert_eq!(first, vec![("a.txt".to_string(), 13), ("b.txt".to_string(), 13)]);

        let (second, _, second_state) = backup(&mut helper, Some(&state))?;
        assert!(second.is_empty());
        assert_eq!(second_state, state);
        Ok(())
    }

    #[test]
    fn test_changed_and_deleted_files() -> Result<()> {
        let temp = TempDir::new()?;
        fs::write(temp.path().join("a.txt"), b"alpha")?;
        fs::write(temp.path().join("b.txt"), b"bravo")?;
        let mut helper = FileBackupHelper::new(temp.path(), ["a.txt", "b.txt"]);
        let (_, _, state) = backup(&mut helper, None)?;

        fs::write(temp.path().join("a.txt"), b"alpha, but longer")?;
        fs::remove_file(temp.path().join("b.txt"))?;
        let (second, _, state) = backup(&mut helper, Some(&state))?;
        assert_eq!(second, vec![("a.txt".to_string(), 25), ("b.txt".to_string(), -1)]);

        let records = read_file_state(Some(&mut Cursor::new(state)));
        assert_eq!(records.keys().collect::<Vec<_>>(), vec!["a.txt"]);
        Ok(())
    }

    #[test]
    fn test_restore_roundtrip_records_restored_files() -> Result<()> {
        let source = TempDir::new()?;
        fs::create_dir_all(source.path().join("sub"))?;
        fs::write(source.path().join("sub/notes.txt"), b"remember")?;
        let mut producer = HelperDispatcher::new();
        producer.add_helper(
            "files",
            Box::new(FileBackupHelper::new(source.path(), ["sub/notes.txt"])),
        )?;
        let mut sink = EntityWriter::new(Vec::new());
        producer.perform_backup(None, &mut sink, &mut Cursor::new(Vec::new()))?;
        let data = sink.finish()?;

        let target = TempDir::new()?;
        let mut consumer = HelperDispatcher::new();
        consumer.add_helper(
            "files",
            Box::new(FileBackupHelper::new(target.path(), ["sub/notes.txt"])),
        )?;
        let mut restored_state = Cursor::new(Vec::new());
        consumer.perform_restore(
            &mut EntityReader::new(Cursor::new(data)),
            1,
            &mut restored_state,
        )?;
        assert_eq!(fs::read(target.path().join("sub/notes.txt"))?, b"remember");

        // the restored state suppresses an immediate resend
        let mut sink = EntityWriter::new(Vec::new());
        restored_state.set_position(0);
        let report = consumer.perform_backup(
            Some(&mut restored_state),
            &mut sink,
            &mut Cursor::new(Vec::new()),
        )?;
        assert_eq!(report.replayed, vec!["files".to_string()]);
        assert_eq!(sink.entities_written(), 0);
        Ok(())
    }

    #[test]
    fn test_traversal_key_writes_nothing_outside_base() -> Result<()> {
        let temp = TempDir::new()?;
        let base = temp.path().join("app/files");
        fs::create_dir_all(&base)?;

        let mut writer = EntityWriter::new(Vec::new());
        writer.write_entity_header("x:../../etc/passwd", 12)?;
        writer.write_entity_data(&[0, 0, 0, 1, 0, 0, 1, 0xa4])?;
        writer.write_entity_data(b"root")?;
        let data = writer.finish()?;

        let mut dispatcher = HelperDispatcher::new();
        dispatcher.add_helper("x", Box::new(FileBackupHelper::new(&base, Vec::<String>::new())))?;
        dispatcher.perform_restore(
            &mut EntityReader::new(Cursor::new(data)),
            1,
            &mut Cursor::new(Vec::new()),
        )?;

        let written: Vec<_> = WalkDir::new(temp.path())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .collect();
        assert!(written.is_empty());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_dotdot_key_cannot_follow_symlink_out() -> Result<()> {
        let temp = TempDir::new()?;
        let base = temp.path().join("app/files");
        let outside = temp.path().join("outside");
        fs::create_dir_all(&base)?;
        fs::create_dir_all(&outside)?;
        std::os::unix::fs::symlink(&outside, base.join("link"))?;

        let mut writer = EntityWriter::new(Vec::new());
        writer.write_entity_header("x:missing/../link/secret", 12)?;
        writer.write_entity_data(&[0, 0, 0, 1, 0, 0, 1, 0xa4])?;
        writer.write_entity_data(b"root")?;
        let data = writer.finish()?;

        let mut dispatcher = HelperDispatcher::new();
        dispatcher.add_helper("x", Box::new(FileBackupHelper::new(&base, Vec::<String>::new())))?;
        dispatcher.perform_restore(
            &mut EntityReader::new(Cursor::new(data)),
            1,
            &mut Cursor::new(Vec::new()),
        )?;

        assert!(!outside.join("secret").exists());
        Ok(())
    }

    #[test]
    fn test_restore_tombstone_removes_file() -> Result<()> {
        let temp = TempDir::new()?;
        fs::write(temp.path().join("old.txt"), b"stale")?;
        let mut helper = FileBackupHelper::new(temp.path(), ["old.txt"]);

        let mut empty = io::empty();
        let mut entity = RestoreEntity::new("old.txt".to_string(), -1, 1, &mut empty);
        helper.restore_entity(&mut entity)?;
        assert!(!temp.path().join("old.txt").exists());
        Ok(())
    }
}
