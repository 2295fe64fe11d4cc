//! Length-prefixed login frames.
//!
//! Before the multiplexer takes over the connection, the login handshake
//! exchanges documents framed as `[len:2 BE][body]`. The only exception is the
//! answer to a terms-and-conditions resource request, which uses a 4-byte
//! length.

use std::io::{Read, Write};

use crate::{Result, WireError};

/// Upper bound for 4-byte-prefixed answers (prevents allocation attacks).
pub const MAX_LONG_FRAME: usize = 1 << 20;

/// Read a `u16`-prefixed frame.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len = [0u8; 2];
    reader.read_exact(&mut len)?;
    let mut body = vec![0u8; usize::from(u16::from_be_bytes(len))];
    reader.read_exact(&mut body)?;
    Ok(body)
}

/// Write a `u16`-prefixed frame and flush.
pub fn write_frame<W: Write + ?Sized>(writer: &mut W, body: &[u8]) -> Result<()> {
    let len = u16::try_from(body.len()).map_err(|_| WireError::FrameTooLarge {
        len: body.len(),
        max: usize::from(u16::MAX),
    })?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(body)?;
    writer.flush()?;
    Ok(())
}

/// Read a `u32`-prefixed frame of at most [`MAX_LONG_FRAME`] bytes.
pub fn read_long_frame<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_LONG_FRAME {
        return Err(WireError::FrameTooLarge {
            len,
            max: MAX_LONG_FRAME,
        });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(body)
}

/// Write a `u32`-prefixed frame and flush.
pub fn write_long_frame<W: Write + ?Sized>(writer: &mut W, body: &[u8]) -> Result<()> {
    if body.len() > MAX_LONG_FRAME {
        return Err(WireError::FrameTooLarge {
            len: body.len(),
            max: MAX_LONG_FRAME,
        });
    }
    writer.write_all(&(body.len() as u32).to_be_bytes())?;
    writer.write_all(body)?;
    writer.flush()?;
    Ok(())
}
