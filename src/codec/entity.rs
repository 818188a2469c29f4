//! Key/value entity stream.
//!
//! ```text
//! [magic: u32 "Data"][key_len: u32][size: i32][key bytes][size payload bytes]
//! ```
//!
//! A negative `size` is a tombstone: the key was deleted and no payload
//! bytes follow.

use super::{read_exact_or_eof, KEY_PREFIX_SEPARATOR};
use crate::{Error, Result};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use std::io::{self, Read, Write};

const ENTITY_MAGIC: u32 = 0x4461_7461;

/// Keys longer than this are treated as stream corruption
pub const MAX_KEY_LEN: usize = 64 * 1024;

/// Size value written for tombstones
pub const TOMBSTONE_SIZE: i32 = -1;

/// Sink for backup entities, as seen by a helper.
pub trait EntityOutput {
    /// Prefix prepended (as `"<prefix>:"`) to every key written afterwards
    fn set_key_prefix(&mut self, prefix: Option<&str>);

    /// Start an entity of `size` payload bytes; a negative size is a tombstone
    fn write_entity_header(&mut self, key: &str, size: i32) -> Result<()>;

    /// Append payload bytes to the entity started by the last header
    fn write_entity_data(&mut self, data: &[u8]) -> Result<()>;

    fn write_tombstone(&mut self, key: &str) -> Result<()> {
        self.write_entity_header(key, TOMBSTONE_SIZE)
    }
}

/// Header of one entity in the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityHeader {
    pub key: String,
    pub size: i32,
}

impl EntityHeader {
    pub fn is_tombstone(&self) -> bool {
        self.size < 0
    }
}

/// Append-only entity stream writer
pub struct EntityWriter<W: Write> {
    inner: W,
    prefix: Option<String>,
    pending: u64,
    entities_written: u64,
}

impl<W: Write> EntityWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            prefix: None,
            pending: 0,
            entities_written: 0,
        }
    }

    /// Number of entity headers written so far, tombstones included
    pub fn entities_written(&self) -> u64 {
        self.entities_written
    }

    /// Flush and hand back the underlying stream
    pub fn finish(mut self) -> Result<W> {
        if self.pending != 0 {
            return Err(Error::protocol(format!(
                "last entity is missing {} payload bytes",
                self.pending
            )));
        }
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> EntityOutput for EntityWriter<W> {
    fn set_key_prefix(&mut self, prefix: Option<&str>) {
        self.prefix = prefix.map(str::to_string);
    }

    fn write_entity_header(&mut self, key: &str, size: i32) -> Result<()> {
        if self.pending != 0 {
            return Err(Error::protocol(format!(
                "entity '{}' started while {} payload bytes of the previous one are missing",
                key, self.pending
            )));
        }

        let full_key = match &self.prefix {
            Some(prefix) => format!("{}{}{}", prefix, KEY_PREFIX_SEPARATOR, key),
            None => key.to_string(),
        };
        if full_key.len() > MAX_KEY_LEN {
            return Err(Error::protocol(format!(
                "entity key of {} bytes is too long",
                full_key.len()
            )));
        }

        self.inner.write_u32::<BigEndian>(ENTITY_MAGIC)?;
        self.inner.write_u32::<BigEndian>(full_key.len() as u32)?;
        self.inner.write_i32::<BigEndian>(size)?;
        self.inner.write_all(full_key.as_bytes())?;

        self.pending = size.max(0) as u64;
        self.entities_written += 1;
        Ok(())
    }

    fn write_entity_data(&mut self, data: &[u8]) -> Result<()> {
        if data.len() as u64 > self.pending {
            return Err(Error::protocol(format!(
                "{} payload bytes written but only {} declared",
                data.len(),
                self.pending
            )));
        }
        self.inner.write_all(data)?;
        self.pending -= data.len() as u64;
        Ok(())
    }
}

/// Sequential entity stream reader.
///
/// Implements [`Read`] over the payload of the current entity only.
pub struct EntityReader<R: Read> {
    inner: R,
    remaining: u64,
}

impl<R: Read> EntityReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, remaining: 0 }
    }

    /// Advance to the next entity header, skipping any unread payload.
    ///
    /// Returns `Ok(None)` at a clean end of stream.
    pub fn read_next_header(&mut self) -> Result<Option<EntityHeader>> {
        self.skip_entity_data()?;

        let mut fixed = [0u8; 12];
        if !read_exact_or_eof(&mut self.inner, &mut fixed)? {
            return Ok(None);
        }

        let magic = BigEndian::read_u32(&fixed[0..4]);
        if magic != ENTITY_MAGIC {
            return Err(Error::protocol(format!("bad entity magic {:#010x}", magic)));
        }
        let key_len = BigEndian::read_u32(&fixed[4..8]) as usize;
        if key_len > MAX_KEY_LEN {
            return Err(Error::protocol(format!("entity key length {} is implausible", key_len)));
        }
        let size = BigEndian::read_i32(&fixed[8..12]);

        let mut key = vec![0u8; key_len];
        self.inner.read_exact(&mut key)?;
        let key =
            String::from_utf8(key).map_err(|_| Error::protocol("entity key is not valid UTF-8"))?;

        self.remaining = size.max(0) as u64;
        Ok(Some(EntityHeader { key, size }))
    }

    /// Payload bytes of the current entity not yet consumed
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Drain whatever is left of the current entity's payload
    pub fn skip_entity_data(&mut self) -> Result<()> {
        if self.remaining == 0 {
            return Ok(());
        }
        let expected = self.remaining;
        let skipped = io::copy(&mut (&mut self.inner).take(expected), &mut io::sink())?;
        self.remaining = 0;
        if skipped != expected {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("entity payload truncated: {} of {} bytes", skipped, expected),
            )));
        }
        Ok(())
    }
}

impl<R: Read> Read for EntityReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let max = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = self.inner.read(&mut buf[..max])?;
        self.remaining -= n as u64;
        Ok(n)
    }
}
