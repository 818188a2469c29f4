//! Framed state snapshot file.
//!
//! ```text
//! [header_size: i32][version: i32][data_size: i32][name_len: i32][name, zero padded to 4][data]
//! ```
//!
//! The writer reserves header space, lets a helper stream its body, then
//! seeks back and fills in the real body size. Only the state file needs to
//! be seekable; the entity stream is append-only.

use super::{pad4, read_exact_or_eof};
use crate::{Error, Result};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use serde::Serialize;
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Chunk header format version
pub const CHUNK_HEADER_VERSION: i32 = 1;

const FIXED_HEADER_LEN: usize = 16;

/// Upper bound on a prefix stored in a chunk header
const MAX_PREFIX_LEN: usize = 4096;

/// One helper's region of the state file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkHeader {
    pub prefix: String,
    pub size: u64,
}

fn header_len(prefix: &str) -> usize {
    FIXED_HEADER_LEN + pad4(prefix.len())
}

/// Writes chunks into a seekable state file
pub struct ChunkWriter<W: Write + Seek> {
    inner: W,
}

impl<W: Write + Seek> ChunkWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Reserve header space for `prefix` at the current position
    pub fn reserve(&mut self, prefix: &str) -> Result<u64> {
        if prefix.len() > MAX_PREFIX_LEN {
            return Err(Error::protocol(format!(
                "chunk prefix of {} bytes exceeds {}",
                prefix.len(),
                MAX_PREFIX_LEN
            )));
        }
        let position = self.inner.stream_position()?;
        self.inner.write_all(&vec![0u8; header_len(prefix)])?;
        Ok(position)
    }

    /// Backpatch the header reserved at `position` with the real body size.
    ///
    /// The stream is left positioned at the end of the body.
    pub fn commit(&mut self, prefix: &str, size: u64, position: u64) -> Result<()> {
        let data_size = i32::try_from(size).map_err(|_| {
            Error::protocol(format!("state chunk '{}' is too large ({} bytes)", prefix, size))
        })?;
        let header_size = header_len(prefix);

        let mut header = Vec::with_capacity(header_size);
        header.write_i32::<BigEndian>(header_size as i32)?;
        header.write_i32::<BigEndian>(CHUNK_HEADER_VERSION)?;
        header.write_i32::<BigEndian>(data_size)?;
        header.write_i32::<BigEndian>(prefix.len() as i32)?;
        header.extend_from_slice(prefix.as_bytes());
        header.resize(header_size, 0);

        let end = self.inner.stream_position()?;
        self.inner.seek(SeekFrom::Start(position))?;
        self.inner.write_all(&header)?;
        self.inner.seek(SeekFrom::Start(end))?;
        Ok(())
    }

    /// Reserve a header, let `body` stream the chunk contents, then commit.
    ///
    /// Returns the body size recorded in the header.
    pub fn write_chunk<F>(&mut self, prefix: &str, body: F) -> Result<u64>
    where
        F: FnOnce(&mut dyn Write) -> Result<()>,
    {
        let position = self.reserve(prefix)?;
        body(&mut self.inner)?;
        let end = self.inner.stream_position()?;
        let size = end - position - header_len(prefix) as u64;
        self.commit(prefix, size, position)?;
        Ok(size)
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Reads chunk headers sequentially from a state file
pub struct ChunkReader<R: Read> {
    inner: R,
}

impl<R: Read> ChunkReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read the next chunk header.
    ///
    /// `Ok(None)` at a clean end of file; malformed headers are errors and it
    /// is up to the caller whether to treat them as the end of the file.
    pub fn read_next(&mut self) -> Result<Option<ChunkHeader>> {
        let mut fixed = [0u8; FIXED_HEADER_LEN];
        if !read_exact_or_eof(&mut self.inner, &mut fixed)? {
            return Ok(None);
        }

        let header_size = BigEndian::read_i32(&fixed[0..4]);
        let version = BigEndian::read_i32(&fixed[4..8]);
        let data_size = BigEndian::read_i32(&fixed[8..12]);
        let name_len = BigEndian::read_i32(&fixed[12..16]);

        if version != CHUNK_HEADER_VERSION {
            return Err(Error::protocol(format!("unknown chunk header version {}", version)));
        }
        if data_size < 0 {
            return Err(Error::protocol(format!("negative chunk size {}", data_size)));
        }
        if name_len < 0 || name_len as usize > MAX_PREFIX_LEN {
            return Err(Error::protocol(format!("bad chunk name length {}", name_len)));
        }
        let name_len = name_len as usize;
        if header_size < 0 || header_size as usize != FIXED_HEADER_LEN + pad4(name_len) {
            return Err(Error::protocol(format!(
                "chunk header size {} does not match name length {}",
                header_size, name_len
            )));
        }

        let mut name = vec![0u8; pad4(name_len)];
        self.inner.read_exact(&mut name)?;
        name.truncate(name_len);
        let prefix = String::from_utf8(name)
            .map_err(|_| Error::protocol("chunk prefix is not valid UTF-8"))?;

        Ok(Some(ChunkHeader {
            prefix,
            size: data_size as u64,
        }))
    }

    /// A reader bounded to the body of the chunk whose header was just read
    pub fn chunk_body(&mut self, size: u64) -> io::Take<&mut R> {
        (&mut self.inner).take(size)
    }

    /// Skip over a chunk body without interpreting it
    pub fn skip(&mut self, size: u64) -> Result<()> {
        let skipped = io::copy(&mut self.chunk_body(size), &mut io::sink())?;
        if skipped != size {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("state chunk truncated: {} of {} bytes", skipped, size),
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    #[test]
    fn test_reserve_then_commit_backpatches_size() -> Result<()> {
        let mut writer = ChunkWriter::new(Cursor::new(Vec::new()));

        let size = writer.write_chunk("prefs", |out| {
            out.write_all(b"hello state")?;
            Ok(())
        })?;
        assert_eq!(size, 11);
        writer.write_chunk("db", |_| Ok(()))?;

        let bytes = writer.into_inner().into_inner();
        let mut reader = ChunkReader::new(Cursor::new(bytes));

        let first = reader.read_next()?.unwrap();
        assert_eq!(first, ChunkHeader { prefix: "prefs".to_string(), size: 11 });
        let mut body = Vec::new();
        reader.chunk_body(first.size).read_to_end(&mut body)?;
        assert_eq!(body, b"hello state");

        let second = reader.read_next()?.unwrap();
        assert_eq!(second, ChunkHeader { prefix: "db".to_string(), size: 0 });
        assert!(reader.read_next()?.is_none());
        Ok(())
    }

    #[test]
    fn test_skip_unknown_chunk() -> Result<()> {
        let mut writer = ChunkWriter::new(Cursor::new(Vec::new()));
        writer.write_chunk("gone", |out| {
            out.write_all(&[7u8; 33])?;
            Ok(())
        })?;
        writer.write_chunk("kept", |out| {
            out.write_all(b"x")?;
            Ok(())
        })?;

        let mut reader = ChunkReader::new(Cursor::new(writer.into_inner().into_inner()));
        let gone = reader.read_next()?.unwrap();
        reader.skip(gone.size)?;
        let kept = reader.read_next()?.unwrap();
        assert_eq!(kept.prefix, "kept");
        Ok(())
    }

    #[test]
    fn test_negative_size_is_rejected() {
        let mut bytes = Vec::new();
        bytes.write_i32::<BigEndian>(20).unwrap();
        bytes.write_i32::<BigEndian>(CHUNK_HEADER_VERSION).unwrap();
        bytes.write_i32::<BigEndian>(-5).unwrap();
        bytes.write_i32::<BigEndian>(1).unwrap();
        bytes.extend_from_slice(b"p\0\0\0");

        let mut reader = ChunkReader::new(Cursor::new(bytes));
        assert!(matches!(reader.read_next(), Err(Error::Protocol { .. })));
    }

    #[test]
    fn test_truncated_header_is_error_not_eof() {
        let mut reader = ChunkReader::new(Cursor::new(vec![0u8, 0, 0, 20, 0, 0]));
        assert!(reader.read_next().is_err());
    }
}
