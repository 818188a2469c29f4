//! Multiplexes several backup helpers through one state file and one
//! entity stream.
//!
//! Backup replays helpers in the order their chunks appear in the old state
//! file, then runs the helpers that had no chunk in lexicographic prefix
//! order. Restore routes each `"<prefix>:<key>"` entity to its helper and
//! afterwards lets every helper write its state, again in prefix order.

use crate::codec::{ChunkReader, ChunkWriter, EntityOutput, EntityReader, KEY_PREFIX_SEPARATOR};
use crate::helpers::{BackupHelper, RestoreEntity};
use crate::{Error, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Read, Seek, Write};
use tracing::{debug, info, span, warn, Level};

/// What a backup pass did, in invocation order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackupPassReport {
    /// Helpers run because their chunk was found in the old state
    pub replayed: Vec<String>,
    /// Helpers run afterwards because they had no old chunk
    pub added: Vec<String>,
    /// Old-state chunks with no registered helper
    pub skipped_chunks: Vec<String>,
    /// Bytes of new state written, headers excluded
    pub state_bytes: u64,
}

impl BackupPassReport {
    /// Every helper in the order it was invoked
    pub fn invocation_order(&self) -> Vec<&str> {
        self.replayed
            .iter()
            .chain(self.added.iter())
            .map(String::as_str)
            .collect()
    }
}

/// What a restore pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestorePassReport {
    /// Entities delivered per helper prefix
    pub delivered: BTreeMap<String, u64>,
    /// Entities drained because no helper claimed them
    pub dropped: u64,
    /// Helpers that wrote a new state snapshot, in order
    pub state_written: Vec<String>,
}

/// Registry of helpers keyed by prefix
#[derive(Default)]
pub struct HelperDispatcher {
    helpers: BTreeMap<String, Box<dyn BackupHelper>>,
}

impl HelperDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a helper under `prefix`.
    ///
    /// Prefixes must be unique, non-empty and free of the key separator.
    pub fn add_helper(
        &mut self,
        prefix: impl Into<String>,
        helper: Box<dyn BackupHelper>,
    ) -> Result<()> {
        let prefix = prefix.into();
        if prefix.is_empty() || prefix.contains(KEY_PREFIX_SEPARATOR) {
            return Err(Error::Configuration {
                reason: format!("invalid helper prefix '{}'", prefix),
            });
        }
        if self.helpers.contains_key(&prefix) {
            return Err(Error::Configuration {
                reason: format!("helper prefix '{}' registered twice", prefix),
            });
        }
        self.helpers.insert(prefix, helper);
        Ok(())
    }

    /// Registered prefixes in lexicographic order
    pub fn prefixes(&self) -> impl Iterator<Item = &str> {
        self.helpers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.helpers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.helpers.is_empty()
    }

    /// Run one backup pass across all helpers.
    ///
    /// Unreadable or malformed old state ends the replay phase early; any
    /// failure writing `data` or `new_state` aborts the pass.
    pub fn perform_backup<W: Write + Seek>(
        &mut self,
        old_state: Option<&mut dyn Read>,
        data: &mut dyn EntityOutput,
        new_state: &mut W,
    ) -> Result<BackupPassReport> {
        let span = span!(Level::INFO, "perform_backup", helpers = self.helpers.len());
        let _enter = span.enter();

        let mut report = BackupPassReport::default();
        let mut pending: BTreeSet<String> = self.helpers.keys().cloned().collect();
        let mut chunks = ChunkWriter::new(new_state);

        if let Some(old) = old_state {
            let mut reader = ChunkReader::new(old);
            loop {
                let header = match reader.read_next() {
                    Ok(Some(header)) => header,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Unreadable old state chunk, treating as end of state: {}", e);
                        break;
                    }
                };

                let helper = if pending.remove(&header.prefix) {
                    self.helpers.get_mut(&header.prefix)
                } else {
                    None
                };

                match helper {
                    Some(helper) => {
                        let mut body = reader.chunk_body(header.size);
                        report.state_bytes += backup_one(
                            &header.prefix,
                            helper.as_mut(),
                            Some(&mut body),
                            data,
                            &mut chunks,
                        )?;
                        if let Err(e) = io::copy(&mut body, &mut io::sink()) {
                            warn!("Old state ended inside chunk '{}': {}", header.prefix, e);
                            break;
                        }
                        report.replayed.push(header.prefix);
                    }
                    None => {
                        debug!(
                            "Skipping old state chunk '{}' ({} bytes)",
                            header.prefix, header.size
                        );
                        if let Err(e) = reader.skip(header.size) {
                            warn!("Old state ended inside chunk '{}': {}", header.prefix, e);
                            break;
                        }
                        report.skipped_chunks.push(header.prefix);
                    }
                }
            }
        }

        for prefix in pending {
            if let Some(helper) = self.helpers.get_mut(&prefix) {
                report.state_bytes +=
                    backup_one(&prefix, helper.as_mut(), None, data, &mut chunks)?;
                report.added.push(prefix);
            }
        }
        data.set_key_prefix(None);

        info!(
            "Backup pass complete: {} replayed, {} new, {} stale chunks dropped",
            report.replayed.len(),
            report.added.len(),
            report.skipped_chunks.len()
        );
        Ok(report)
    }

    /// Run one restore pass, then have every helper write its new state
    pub fn perform_restore<R: Read, W: Write + Seek>(
        &mut self,
        input: &mut EntityReader<R>,
        app_version: i64,
        new_state: &mut W,
    ) -> Result<RestorePassReport> {
        let span = span!(Level::INFO, "perform_restore", app_version);
        let _enter = span.enter();

        let mut report = RestorePassReport::default();
        let mut complained = false;

        while let Some(header) = input.read_next_header()? {
            let routed = match split_key(&header.key) {
                Some((prefix, key)) => {
                    self.helpers.get_mut(prefix).map(|helper| (prefix, key, helper))
                }
                None => None,
            };

            match routed {
                Some((prefix, key, helper)) => {
                    let mut entity =
                        RestoreEntity::new(key.to_string(), header.size, app_version, &mut *input);
                    match helper.restore_entity(&mut entity) {
                        Ok(()) => {}
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => warn!("Helper '{}' failed to restore '{}': {}", prefix, key, e),
                    }
                    *report.delivered.entry(prefix.to_string()).or_insert(0) += 1;
                }
                None => {
                    if !complained {
                        warn!("Restore entity '{}' has no matching helper; dropping", header.key);
                        complained = true;
                    }
                    report.dropped += 1;
                }
            }

            input.skip_entity_data()?;
        }

        let mut chunks = ChunkWriter::new(new_state);
        for (prefix, helper) in self.helpers.iter_mut() {
            chunks.write_chunk(prefix, |state| helper.write_new_state_description(state))?;
            report.state_written.push(prefix.clone());
        }

        info!(
            "Restore pass complete: {} entities delivered, {} dropped",
            report.delivered.values().sum::<u64>(),
            report.dropped
        );
        Ok(report)
    }
}

fn backup_one<W: Write + Seek>(
    prefix: &str,
    helper: &mut dyn BackupHelper,
    old_state: Option<&mut dyn Read>,
    data: &mut dyn EntityOutput,
    chunks: &mut ChunkWriter<&mut W>,
) -> Result<u64> {
    debug!("Running backup helper '{}'", prefix);
    data.set_key_prefix(Some(prefix));
    chunks.write_chunk(prefix, |state| helper.perform_backup(old_state, data, state))
}

/// Split `"<prefix>:<key>"`; `None` when there is no non-empty prefix
fn split_key(raw: &str) -> Option<(&str, &str)> {
    match raw.split_once(KEY_PREFIX_SEPARATOR) {
        Some((prefix, key)) if !prefix.is_empty() => Some((prefix, key)),
        _ => None,
    }
}
