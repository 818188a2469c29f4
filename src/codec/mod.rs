//! Wire codec for state files, entity streams and full-backup archives.
//!
//! Three formats live here:
//!
//! - [`chunk`]: the framed state snapshot file shared by every registered
//!   helper (one chunk per helper prefix, header backpatched after the
//!   helper has written its body).
//! - [`entity`]: the key/value backup data stream, a sequence of
//!   `(key, signed size)` headers each followed by `size` payload bytes.
//!   A negative size marks a deletion and carries no payload.
//! - [`archive`]: the tar stream produced by the domain tree walker.
//!
//! All integers are big-endian.

pub mod archive;
pub mod chunk;
pub mod entity;

pub use archive::{
    ArchiveEntry, ArchiveOutput, EntryKind, MeasuringOutput, TarArchiveReader, TarArchiveWriter,
};
pub use chunk::{ChunkHeader, ChunkReader, ChunkWriter};
pub use entity::{EntityHeader, EntityOutput, EntityReader, EntityWriter};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Separator between a helper prefix and the helper-local entity key
pub const KEY_PREFIX_SEPARATOR: char = ':';

/// Write a length-prefixed UTF-8 string (`[u16 len][bytes]`)
pub fn write_string<W: Write + ?Sized>(out: &mut W, value: &str) -> io::Result<()> {
    let len = u16::try_from(value.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("string of {} bytes is too long to encode", value.len()),
        )
    })?;
    out.write_u16::<BigEndian>(len)?;
    out.write_all(value.as_bytes())
}

/// Read a string written by [`write_string`]
pub fn read_string<R: Read + ?Sized>(input: &mut R) -> io::Result<String> {
    let len = input.read_u16::<BigEndian>()? as usize;
    let mut buf = vec![0u8; len];
    input.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Fill `buf` completely, or report a clean end of stream.
///
/// Returns `Ok(false)` when the stream ends before the first byte, and an
/// `UnexpectedEof` error when it ends part way through.
pub(crate) fn read_exact_or_eof<R: Read + ?Sized>(
    input: &mut R,
    buf: &mut [u8],
) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream ended after {} of {} header bytes", filled, buf.len()),
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Round a length up to the next multiple of four
pub(crate) fn pad4(len: usize) -> usize {
    (len + 3) & !3
}
