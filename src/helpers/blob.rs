//! Checksum-diffed backup of a fixed set of configuration blobs.
//!
//! Each key's payload is prefixed with the producer's blob version and
//! zlib-compressed; the CRC32 of the *compressed* bytes is the change
//! detector. State snapshot layout:
//!
//! ```text
//! [version: i32][count: i32]{[key: u16-length string][checksum: i64]}*
//! ```

use super::{BackupHelper, RestoreEntity};
use crate::codec::{read_string, write_string, EntityOutput};
use crate::{Error, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io::{self, Cursor, Read, Write};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Version of the checksum state snapshot
pub const BLOB_STATE_VERSION: i32 = 1;

/// Checksum recorded for a key whose payload is absent
pub const ABSENT_CHECKSUM: i64 = -1;

/// Producer and consumer of the raw blobs
pub trait BlobSource {
    /// Current payload for `key`, or `None` when there is nothing to back up
    fn backup_payload(&mut self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Apply a restored payload; `None` means the key was deleted
    fn apply_restored_payload(&mut self, key: &str, payload: Option<Vec<u8>>) -> Result<()>;
}

/// One `(key, checksum)` pair of a state snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChecksumRecord {
    pub key: String,
    pub checksum: i64,
}

/// Read a checksum snapshot.
///
/// Missing, truncated or unreadable state and snapshots from a newer
/// version all yield an empty map, which forces every key to be resent.
pub fn read_checksum_state(old_state: Option<&mut dyn Read>) -> HashMap<String, i64> {
    let Some(input) = old_state else {
        return HashMap::new();
    };

    let mut parse = || -> io::Result<HashMap<String, i64>> {
        let mut state = HashMap::new();
        let version = input.read_i32::<BigEndian>()?;
        if version > BLOB_STATE_VERSION {
            warn!("Prior blob state from unrecognized version {}", version);
            return Ok(state);
        }
        let count = input.read_i32::<BigEndian>()?;
        for _ in 0..count.max(0) {
            let key = read_string(&mut *input)?;
            let checksum = input.read_i64::<BigEndian>()?;
            state.insert(key, checksum);
        }
        Ok(state)
    };

    match parse() {
        Ok(state) => state,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            debug!("No usable prior blob state");
            HashMap::new()
        }
        Err(e) => {
            warn!("Error examining prior blob state: {}", e);
            HashMap::new()
        }
    }
}

/// Write a checksum snapshot; an empty slice forces a full resend next pass
pub fn write_checksum_state(new_state: &mut dyn Write, records: &[ChecksumRecord]) -> Result<()> {
    new_state.write_i32::<BigEndian>(BLOB_STATE_VERSION)?;
    new_state.write_i32::<BigEndian>(records.len() as i32)?;
    for record in records {
        write_string(&mut *new_state, &record.key)?;
        new_state.write_i64::<BigEndian>(record.checksum)?;
    }
    Ok(())
}

/// Change-detection checksum over the compressed payload
pub fn blob_checksum(compressed: Option<&[u8]>) -> i64 {
    match compressed {
        Some(bytes) => crc32fast::hash(bytes) as i64,
        None => ABSENT_CHECKSUM,
    }
}

/// Helper that diffs a fixed, ordered key list against the last pass
pub struct BlobBackupHelper<S: BlobSource> {
    version: i32,
    keys: Vec<String>,
    source: S,
}

impl<S: BlobSource> BlobBackupHelper<S> {
    /// Keys are processed in the given order and must be unique
    pub fn new<I, K>(version: i32, keys: I, source: S) -> Result<Self>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        let mut seen = HashSet::new();
        if let Some(dup) = keys.iter().find(|k| !seen.insert(k.as_str())) {
            return Err(Error::Configuration {
                reason: format!("blob key '{}' listed twice", dup),
            });
        }
        Ok(Self { version, keys, source })
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    fn deflate(&self, payload: &[u8]) -> io::Result<Vec<u8>> {
        let mut sink = Vec::with_capacity(payload.len() / 2 + 8);
        sink.write_i32::<BigEndian>(self.version)?;
        let mut encoder = ZlibEncoder::new(sink, Compression::default());
        encoder.write_all(payload)?;
        encoder.finish()
    }

    /// `Ok(None)` when the payload comes from a newer producer version
    fn inflate(&self, compressed: &[u8]) -> io::Result<Option<Vec<u8>>> {
        let mut source = Cursor::new(compressed);
        let version = source.read_i32::<BigEndian>()?;
        if version > self.version {
            warn!("Saved payload from unrecognized version {}", version);
            return Ok(None);
        }
        let mut payload = Vec::new();
        ZlibDecoder::new(source).read_to_end(&mut payload)?;
        Ok(Some(payload))
    }

    fn diff_keys(
        &mut self,
        old: &HashMap<String, i64>,
        data: &mut dyn EntityOutput,
        records: &mut Vec<ChecksumRecord>,
    ) -> Result<()> {
        for key in &self.keys {
            let raw = self.source.backup_payload(key).map_err(|e| Error::Payload {
                key: key.clone(),
                reason: e.to_string(),
            })?;
            let payload = raw
                .as_deref()
                .map(|bytes| self.deflate(bytes))
                .transpose()
                .map_err(|e| Error::Payload {
                    key: key.clone(),
                    reason: e.to_string(),
                })?;

            let checksum = blob_checksum(payload.as_deref());
            records.push(ChecksumRecord {
                key: key.clone(),
                checksum,
            });

            if old.get(key) == Some(&checksum) {
                continue;
            }
            match payload {
                Some(bytes) => {
                    let size = i32::try_from(bytes.len()).map_err(|_| Error::Payload {
                        key: key.clone(),
                        reason: format!("compressed payload of {} bytes is too large", bytes.len()),
                    })?;
                    debug!("Blob '{}' changed, sending {} bytes", key, size);
                    data.write_entity_header(key, size)?;
                    data.write_entity_data(&bytes)?;
                }
                None => {
                    debug!("Blob '{}' now empty, sending deletion", key);
                    data.write_tombstone(key)?;
                }
            }
        }
        Ok(())
    }
}

impl<S: BlobSource> BackupHelper for BlobBackupHelper<S> {
    fn perform_backup(
        &mut self,
        old_state: Option<&mut dyn Read>,
        data: &mut dyn EntityOutput,
        new_state: &mut dyn Write,
    ) -> Result<()> {
        let old = read_checksum_state(old_state);
        let mut records = Vec::with_capacity(self.keys.len());

        let outcome = self.diff_keys(&old, data, &mut records);
        if let Err(e) = &outcome {
            warn!("Unable to record blob state, forcing full resend next pass: {}", e);
            records.clear();
        }

        // the snapshot is written even when nothing changed
        write_checksum_state(new_state, &records)?;

        match outcome {
            Err(e) if e.is_fatal() => Err(e),
            _ => Ok(()),
        }
    }

    fn restore_entity(&mut self, entity: &mut RestoreEntity<'_>) -> Result<()> {
        let key = entity.key().to_string();
        if !self.keys.iter().any(|k| *k == key) {
            warn!("Unrecognized blob key '{}', ignoring", key);
            return Ok(());
        }

        let payload = if entity.is_tombstone() {
            None
        } else {
            let compressed = match entity.read_payload() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Truncated payload for blob '{}': {}", key, e);
                    return Ok(());
                }
            };
            match self.inflate(&compressed) {
                Ok(Some(payload)) => Some(payload),
                Ok(None) => return Ok(()),
                Err(e) => {
                    warn!("Corrupt payload for blob '{}': {}", key, e);
                    return Ok(());
                }
            }
        };

        if let Err(e) = self.source.apply_restored_payload(&key, payload) {
            warn!("Exception restoring blob '{}': {}", key, e);
        }
        Ok(())
    }

    fn write_new_state_description(&mut self, new_state: &mut dyn Write) -> Result<()> {
        // restored data is never trusted as already checksummed
        write_checksum_state(new_state, &[])
    }
}

/// Blob source backed by one file per key.
///
/// A missing file backs up as "no payload"; restoring a deletion removes
/// the file.
#[derive(Debug, Clone, Default)]
pub struct FileBlobSource {
    files: BTreeMap<String, PathBuf>,
}

impl FileBlobSource {
    pub fn new(files: BTreeMap<String, PathBuf>) -> Self {
        Self { files }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    fn path_for(&self, key: &str) -> Result<&PathBuf> {
        self.files.get(key).ok_or_else(|| Error::Configuration {
            reason: format!("no file configured for blob key '{}'", key),
        })
    }
}

impl BlobSource for FileBlobSource {
    fn backup_payload(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)?) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn apply_restored_payload(&mut self, key: &str, payload: Option<Vec<u8>>) -> Result<()> {
        let path = self.path_for(key)?;
        match payload {
            Some(bytes) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(path, bytes)?;
            }
            None => match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            },
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{EntityReader, EntityWriter};
    use crate::dispatcher::HelperDispatcher;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::rc::Rc;
    use tempfile::TempDir;

    type Applied = Rc<RefCell<Vec<(String, Option<Vec<u8>>)>>>;

    /// In-memory producer; `None` values model "nothing to back up"
    #[derive(Default)]
    struct MapSource {
        current: BTreeMap<String, Option<Vec<u8>>>,
        applied: Vec<(String, Option<Vec<u8>>)>,
        fail_on: Option<String>,
    }

    impl MapSource {
        fn with(entries: &[(&str, Option<&str>)]) -> Self {
            Self {
                current: entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.map(|s| s.as_bytes().to_vec())))
                    .collect(),
                ..Default::default()
            }
        }
    }

    impl BlobSource for MapSource {
        fn backup_payload(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
            if self.fail_on.as_deref() == Some(key) {
                return Err(Error::Configuration {
                    reason: "provider unavailable".to_string(),
                });
            }
            Ok(self.current.get(key).cloned().flatten())
        }

        fn apply_restored_payload(&mut self, key: &str, payload: Option<Vec<u8>>) -> Result<()> {
            self.applied.push((key.to_string(), payload));
            Ok(())
        }
    }

    struct Pass {
        entities: Vec<(String, i32)>,
        data: Vec<u8>,
        state: Vec<u8>,
    }

    fn run_pass(helper: &mut BlobBackupHelper<MapSource>, old_state: Option<&[u8]>) -> Pass {
        let mut sink = EntityWriter::new(Vec::new());
        let mut state = Vec::new();
        let mut old = old_state.map(|s| Cursor::new(s.to_vec()));
        helper
            .perform_backup(old.as_mut().map(|c| c as &mut dyn Read), &mut sink, &mut state)
            .unwrap();
        let data = sink.finish().unwrap();

        let mut reader = EntityReader::new(Cursor::new(data.clone()));
        let mut entities = Vec::new();
        while let Some(header) = reader.read_next_header().unwrap() {
            entities.push((header.key, header.size));
        }
        Pass { entities, data, state }
    }

    fn records(state: &[u8]) -> HashMap<String, i64> {
        read_checksum_state(Some(&mut Cursor::new(state.to_vec())))
    }

    #[test]
    fn test_second_pass_with_unchanged_input_is_silent() {
        let source = MapSource::with(&[
            ("settings", Some("volume=7;ringtone=chime")),
            ("theme", Some("dark")),
        ]);
        let mut helper = BlobBackupHelper::new(3, ["settings", "theme"], source).unwrap();

        let first = run_pass(&mut helper, None);
        assert_eq!(first.entities.len(), 2);

        let second = run_pass(&mut helper, Some(&first.state));
        assert!(second.entities.is_empty());
        assert_eq!(second.state, first.state);
    }

    #[test]
    fn test_one_byte_change_resends_only_that_key() {
        let source = MapSource::with(&[("a", Some("alpha")), ("b", Some("bravo"))]);
        let mut helper = BlobBackupHelper::new(1, ["a", "b"], source).unwrap();
        let first = run_pass(&mut helper, None);

        helper
            .source_mut()
            .current
            .insert("b".to_string(), Some(b"bravO".to_vec()));
        let second = run_pass(&mut helper, Some(&first.state));

        assert_eq!(second.entities.len(), 1);
        assert_eq!(second.entities[0].0, "b");
        let before = records(&first.state);
        let after = records(&second.state);
        assert_eq!(before["a"], after["a"]);
        assert_ne!(before["b"], after["b"]);
    }

    #[test]
    fn test_payload_becoming_empty_sends_tombstone() {
        let source = MapSource::with(&[("a", Some("alpha"))]);
        let mut helper = BlobBackupHelper::new(1, ["a"], source).unwrap();
        let first = run_pass(&mut helper, None);

        helper.source_mut().current.insert("a".to_string(), None);
        let second = run_pass(&mut helper, Some(&first.state));
        assert_eq!(second.entities, vec![("a".to_string(), -1)]);
        assert_eq!(records(&second.state)["a"], ABSENT_CHECKSUM);

        let third = run_pass(&mut helper, Some(&second.state));
        assert!(third.entities.is_empty());
    }

    #[test]
    fn test_producer_failure_blanks_state() {
        let mut source = MapSource::with(&[("a", Some("alpha")), ("b", Some("bravo"))]);
        source.fail_on = Some("b".to_string());
        let mut helper = BlobBackupHelper::new(1, ["a", "b"], source).unwrap();

        let pass = run_pass(&mut helper, None);
        assert_eq!(pass.entities.len(), 1);
        assert!(records(&pass.state).is_empty());

        helper.source_mut().fail_on = None;
        let retry = run_pass(&mut helper, Some(&pass.state));
        assert_eq!(retry.entities.len(), 2);
    }

    #[test]
    fn test_old_state_tolerance() {
        assert!(read_checksum_state(None).is_empty());

        let mut truncated = Vec::new();
        write_checksum_state(
            &mut truncated,
            &[ChecksumRecord { key: "a".into(), checksum: 5 }],
        )
        .unwrap();
        truncated.truncate(truncated.len() - 3);
        assert!(records(&truncated).is_empty());

        let mut future = Vec::new();
        future.write_i32::<BigEndian>(BLOB_STATE_VERSION + 1).unwrap();
        future.write_i32::<BigEndian>(0).unwrap();
        assert!(records(&future).is_empty());
    }

    #[test]
    fn test_roundtrip_through_dispatcher() -> Result<()> {
        let source = MapSource::with(&[
            ("settings", Some("volume=7")),
            ("gone", None),
            ("theme", Some("dark")),
        ]);
        let mut dispatcher = HelperDispatcher::new();
        dispatcher.add_helper(
            "prefs",
            Box::new(BlobBackupHelper::new(2, ["settings", "gone", "theme"], source)?),
        )?;

        let mut sink = EntityWriter::new(Vec::new());
        dispatcher.perform_backup(None, &mut sink, &mut Cursor::new(Vec::new()))?;
        let data = sink.finish()?;

        let target = BlobBackupHelper::new(2, ["settings", "gone", "theme"], MapSource::default())?;
        let applied: Applied = Rc::new(RefCell::new(Vec::new()));

        struct Shared(BlobBackupHelper<MapSource>, Applied);
        impl BackupHelper for Shared {
            fn perform_backup(
                &mut self,
                old_state: Option<&mut dyn Read>,
                data: &mut dyn EntityOutput,
                new_state: &mut dyn Write,
            ) -> Result<()> {
                self.0.perform_backup(old_state, data, new_state)
            }
            fn restore_entity(&mut self, entity: &mut RestoreEntity<'_>) -> Result<()> {
                self.0.restore_entity(entity)?;
                self.1.borrow_mut().extend(self.0.source_mut().applied.drain(..));
                Ok(())
            }
            fn write_new_state_description(&mut self, new_state: &mut dyn Write) -> Result<()> {
                self.0.write_new_state_description(new_state)
            }
        }

        let mut restorer = HelperDispatcher::new();
        restorer.add_helper("prefs", Box::new(Shared(target, applied.clone())))?;
        restorer.perform_restore(
            &mut EntityReader::new(Cursor::new(data)),
            2,
            &mut Cursor::new(Vec::new()),
        )?;

        let applied = applied.borrow();
        assert_eq!(
            *applied,
            vec![
                ("settings".to_string(), Some(b"volume=7".to_vec())),
                ("gone".to_string(), None),
                ("theme".to_string(), Some(b"dark".to_vec())),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_restore_rejects_newer_payload_version_and_unknown_keys() -> Result<()> {
        let producer = BlobBackupHelper::new(5, ["a"], MapSource::with(&[("a", Some("x"))]))?;
        let compressed = producer.deflate(b"x")?;

        let mut consumer = BlobBackupHelper::new(4, ["a"], MapSource::default())?;
        let mut data = Cursor::new(compressed.clone());
        let mut entity = RestoreEntity::new("a".into(), compressed.len() as i32, 1, &mut data);
        consumer.restore_entity(&mut entity)?;

        let mut data = Cursor::new(compressed.clone());
        let mut entity = RestoreEntity::new("zz".into(), compressed.len() as i32, 1, &mut data);
        consumer.restore_entity(&mut entity)?;

        assert!(consumer.source().applied.is_empty());
        Ok(())
    }

    #[test]
    fn test_state_after_restore_forces_resend() -> Result<()> {
        let source = MapSource::with(&[("a", Some("alpha"))]);
        let mut helper = BlobBackupHelper::new(1, ["a"], source)?;
        let mut state = Vec::new();
        helper.write_new_state_description(&mut state)?;
        assert!(records(&state).is_empty());

        let pass = run_pass(&mut helper, Some(&state));
        assert_eq!(pass.entities.len(), 1);
        assert!(!pass.data.is_empty());
        Ok(())
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        assert!(BlobBackupHelper::new(1, ["a", "a"], MapSource::default()).is_err());
    }

    #[test]
    fn test_file_blob_source() -> Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("conf/app.json");
        let mut files = BTreeMap::new();
        files.insert("app".to_string(), path.clone());
        let mut source = FileBlobSource::new(files);

        assert_eq!(source.backup_payload("app")?, None);
        source.apply_restored_payload("app", Some(b"{}".to_vec()))?;
        assert_eq!(source.backup_payload("app")?, Some(b"{}".to_vec()));
        source.apply_restored_payload("app", None)?;
        assert!(!path.exists());
        assert!(source.backup_payload("missing").is_err());
        Ok(())
    }
}
