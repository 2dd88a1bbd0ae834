//! 64-bit integer codecs over plain byte slices.
//!
//! Every operation validates `offset` before touching the slice, so a
//! failed write leaves the bytes unchanged.

use std::ops::Range;

use crate::error::ScriptError;

const WIDTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// Byte range `[offset, offset + 8)` if it lies inside a slice of `len` bytes.
pub fn window(len: usize, offset: i64) -> Result<Range<usize>, ScriptError> {
    let out_of_range = || ScriptError::InvalidOffset {
        offset,
        width: WIDTH,
        len,
    };
    let start = usize::try_from(offset).map_err(|_| out_of_range())?;
    let end = start.checked_add(WIDTH).ok_or_else(out_of_range)?;
    if end > len {
        return Err(out_of_range());
    }
    Ok(start..end)
}

fn read_raw(bytes: &[u8], offset: i64, endian: Endian) -> Result<u64, ScriptError> {
    let range = window(bytes.len(), offset)?;
    let mut raw = [0u8; WIDTH];
    raw.copy_from_slice(&bytes[range]);
    Ok(match endian {
        Endian::Little => u64::from_le_bytes(raw),
        Endian::Big => u64::from_be_bytes(raw),
    })
}

fn write_raw(bytes: &mut [u8], offset: i64, value: u64, endian: Endian) -> Result<(), ScriptError> {
    let range = window(bytes.len(), offset)?;
    let raw = match endian {
        Endian::Little => value.to_le_bytes(),
        Endian::Big => value.to_be_bytes(),
    };
    bytes[range].copy_from_slice(&raw);
    Ok(())
}

pub fn read_i64(bytes: &[u8], offset: i64, endian: Endian) -> Result<i64, ScriptError> {
    read_raw(bytes, offset, endian).map(|v| v as i64)
}

pub fn read_u64(bytes: &[u8], offset: i64, endian: Endian) -> Result<u64, ScriptError> {
    read_raw(bytes, offset, endian)
}

pub fn write_i64(bytes: &mut [u8], offset: i64, value: i64, endian: Endian) -> Result<(), ScriptError> {
    write_raw(bytes, offset, value as u64, endian)
}

pub fn write_u64(bytes: &mut [u8], offset: i64, value: u64, endian: Endian) -> Result<(), ScriptError> {
    write_raw(bytes, offset, value, endian)
}
