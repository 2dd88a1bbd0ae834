//! Bridge between host byte sequences and guest buffer objects.
//!
//! A guest buffer is an object map describing a byte window:
//!
//! ```text
//! #{ buffer: <blob>, offset: <int>, length: <int> }
//! ```
//!
//! Guest code builds them with `Buffer::from(..)` / `Buffer::alloc(..)`; the
//! host reads them back with [`bytes_from_guest_buffer`].

pub mod codec;
pub(crate) mod extensions;

use std::ops::Range;

use rhai::{Blob, Dynamic, Map};

use crate::error::ScriptError;

pub const FIELD_DATA: &str = "buffer";
pub const FIELD_OFFSET: &str = "offset";
pub const FIELD_LENGTH: &str = "length";

/// Whether `value` is buffer-shaped: an object exposing a `buffer` field.
pub fn is_buffer(value: &Dynamic) -> bool {
    value
        .read_lock::<Map>()
        .is_some_and(|map| map.contains_key(FIELD_DATA))
}

/// Copy the bytes a guest buffer view describes.
pub fn bytes_from_guest_buffer(value: &Dynamic) -> Result<Vec<u8>, ScriptError> {
    let view = value
        .read_lock::<Map>()
        .ok_or_else(|| ScriptError::invalid_buffer(format!("expected an object, got {}", value.type_name())))?;
    let range = view_range(&view)?;
    let data = data_field(&view)?;
    let bytes = data
        .read_lock::<Blob>()
        .ok_or_else(|| ScriptError::invalid_buffer("`buffer` field is not binary data"))?;
    Ok(bytes[range].to_vec())
}

fn data_field(view: &Map) -> Result<&Dynamic, ScriptError> {
    view.get(FIELD_DATA)
        .ok_or_else(|| ScriptError::invalid_buffer("object has no `buffer` field"))
}

/// Validated byte range of a view inside its underlying data.
pub(crate) fn view_range(view: &Map) -> Result<Range<usize>, ScriptError> {
    let data_len = data_field(view)?
        .read_lock::<Blob>()
        .map(|bytes| bytes.len())
        .ok_or_else(|| ScriptError::invalid_buffer("`buffer` field is not binary data"))?;
    let offset = integer_field(view, FIELD_OFFSET);
    let length = integer_field(view, FIELD_LENGTH);
    check_view(offset, length, data_len)
}

/// Missing or non-numeric fields read as -1 and fail the bounds check.
fn integer_field(view: &Map, name: &str) -> i64 {
    let Some(value) = view.get(name) else {
        return -1;
    };
    if let Ok(i) = value.as_int() {
        return i;
    }
    match value.as_float() {
        Ok(f) if f.is_finite() => f.trunc() as i64,
        _ => -1,
    }
}

fn check_view(offset: i64, length: i64, data_len: usize) -> Result<Range<usize>, ScriptError> {
    let out_of_bounds = || {
        ScriptError::invalid_buffer(format!(
            "offset {offset} and length {length} exceed buffer of {data_len} bytes"
        ))
    };
    let (Ok(start), Ok(len)) = (usize::try_from(offset), usize::try_from(length)) else {
        return Err(out_of_bounds());
    };
    let end = start.checked_add(len).ok_or_else(out_of_bounds)?;
    // An empty view may sit at the very end of its data; anything else must start inside it.
    if end > data_len || (start >= data_len && len > 0) {
        return Err(out_of_bounds());
    }
    Ok(start..end)
}
