//! Pluggable key/value backup helpers.
//!
//! A helper owns one key prefix in the multiplexed entity stream and one
//! chunk of the shared state file. The [`crate::dispatcher::HelperDispatcher`]
//! only ever talks to the [`BackupHelper`] trait.

pub mod blob;
pub mod file;

pub use blob::{BlobBackupHelper, BlobSource, ChecksumRecord, FileBlobSource};
pub use file::FileBackupHelper;

use crate::codec::EntityOutput;
use crate::Result;
use std::io::{self, Read, Write};

/// Capability interface shared by every helper variant
pub trait BackupHelper {
    /// Emit changed entities to `data` and write a fresh state snapshot.
    ///
    /// `old_state` is this helper's snapshot from the previous pass, or
    /// `None` when there is none. Keys written to `data` are helper-local;
    /// the dispatcher has already installed the prefix.
    fn perform_backup(
        &mut self,
        old_state: Option<&mut dyn Read>,
        data: &mut dyn EntityOutput,
        new_state: &mut dyn Write,
    ) -> Result<()>;

    /// Consume one restored entity addressed to this helper
    fn restore_entity(&mut self, entity: &mut RestoreEntity<'_>) -> Result<()>;

    /// Write the state snapshot that follows a restore pass
    fn write_new_state_description(&mut self, new_state: &mut dyn Write) -> Result<()>;
}

/// One entity delivered to a helper during restore, with its prefix removed
pub struct RestoreEntity<'a> {
    key: String,
    size: i32,
    app_version: i64,
    data: &'a mut dyn Read,
}

impl<'a> RestoreEntity<'a> {
    pub fn new(key: String, size: i32, app_version: i64, data: &'a mut dyn Read) -> Self {
        Self {
            key,
            size,
            app_version,
            data,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Declared payload size; negative for tombstones
    pub fn size(&self) -> i32 {
        self.size
    }

    pub fn is_tombstone(&self) -> bool {
        self.size < 0
    }

    /// Version of the application that produced the data set
    pub fn app_version(&self) -> i64 {
        self.app_version
    }

    /// Read the whole payload; fails if the stream ends early
    pub fn read_payload(&mut self) -> io::Result<Vec<u8>> {
        let mut payload = vec![0u8; self.size.max(0) as usize];
        self.data.read_exact(&mut payload)?;
        Ok(payload)
    }
}

impl Read for RestoreEntity<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.data.read(buf)
    }
}
