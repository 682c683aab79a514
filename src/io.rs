//! Byte-level read and write primitives over a duplex channel

use std::io::{self, Read, Write};

use tracing::{debug, warn};

/// Result of a single non-blocking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(usize),
    /// Nothing available right now.
    WouldBlock,
    /// The peer closed its end.
    Eof,
}

/// Progress made by [`read_into`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Complete,
    Pending,
}

/// Read whatever is immediately available into `buf`.
pub fn read_some<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<ReadOutcome> {
    if buf.is_empty() {
        return Ok(ReadOutcome::Data(0));
    }
    loop {
        match reader.read(buf) {
            Ok(0) => return Ok(ReadOutcome::Eof),
            Ok(n) => return Ok(ReadOutcome::Data(n)),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadOutcome::WouldBlock),
            Err(e) => return Err(e),
        }
    }
}

/// Fill `dst[*index..]` from `reader`, advancing `index` past every byte read.
///
/// Stops when `dst` is full or the reader would block. End of stream before
/// `dst` is full is reported as [`io::ErrorKind::UnexpectedEof`].
pub fn read_into<R: Read + ?Sized>(
    reader: &mut R,
    dst: &mut [u8],
    index: &mut usize,
) -> io::Result<Progress> {
    while *index < dst.len() {
        match read_some(reader, &mut dst[*index..])? {
            ReadOutcome::Data(n) => {
                debug!("read {} bytes, {} of {} filled", n, *index + n, dst.len());
                *index += n;
            }
            ReadOutcome::WouldBlock => return Ok(Progress::Pending),
            ReadOutcome::Eof => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("peer closed after {} of {} bytes", *index, dst.len()),
                ))
            }
        }
    }
    Ok(Progress::Complete)
}

/// Write all of `buf` in one logical call.
///
/// Returns the number of bytes written, which is less than `buf.len()` when
/// the writer stops accepting data part way through. An error before any
/// byte is written is returned as is.
pub fn write_all<W: Write + ?Sized>(writer: &mut W, buf: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < buf.len() {
        match writer.write(&buf[written..]) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if written == 0 => return Err(e),
            Err(e) => {
                warn!("write stopped after {} of {} bytes: {}", written, buf.len(), e);
                break;
            }
        }
    }
    if written == buf.len() {
        writer.flush()?;
    }
    Ok(written)
}
