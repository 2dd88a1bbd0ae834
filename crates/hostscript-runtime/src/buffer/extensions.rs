//! 64-bit integer methods on guest buffer objects.
//!
//! Offsets are relative to the view's own `offset` and bounded by its
//! `length`. Any validation failure aborts the guest call.

use rhai::{Blob, Dynamic, Engine, INT, Map};

use super::codec::{self, Endian};
use super::{FIELD_DATA, view_range};
use crate::error::{GuestResult, ScriptError, guest_error};

const ENDIANS: [(&str, Endian); 2] = [("LE", Endian::Little), ("BE", Endian::Big)];

pub(crate) fn register(engine: &mut Engine) {
    for (suffix, endian) in ENDIANS {
        engine.register_fn(
            format!("readBigInt64{suffix}"),
            move |view: &mut Map, offset: Dynamic| -> GuestResult<INT> {
                let offset = offset_arg(&offset)?;
                with_view(view, |bytes| codec::read_i64(bytes, offset, endian)).map_err(range_error)
            },
        );

        engine.register_fn(
            format!("readBigUInt64{suffix}"),
            move |view: &mut Map, offset: Dynamic| -> GuestResult<Dynamic> {
                let offset = offset_arg(&offset)?;
                let value = with_view(view, |bytes| codec::read_u64(bytes, offset, endian))
                    .map_err(range_error)?;
                Ok(match INT::try_from(value) {
                    Ok(small) => Dynamic::from_int(small),
                    Err(_) => Dynamic::from(value),
                })
            },
        );

        engine.register_fn(
            format!("writeBigInt64{suffix}"),
            move |view: &mut Map, value: Dynamic, offset: Dynamic| -> GuestResult<()> {
                let value = signed_arg(&value)?;
                let offset = offset_arg(&offset)?;
                with_view_mut(view, |bytes| codec::write_i64(bytes, offset, value, endian))
                    .map_err(range_error)
            },
        );

        engine.register_fn(
            format!("writeBigUInt64{suffix}"),
            move |view: &mut Map, value: Dynamic, offset: Dynamic| -> GuestResult<()> {
                let value = unsigned_arg(&value)?;
                let offset = offset_arg(&offset)?;
                with_view_mut(view, |bytes| codec::write_u64(bytes, offset, value, endian))
                    .map_err(range_error)
            },
        );
    }
}

fn range_error(err: ScriptError) -> Box<rhai::EvalAltResult> {
    guest_error(format!("RangeError: {err}"))
}

fn offset_arg(offset: &Dynamic) -> GuestResult<INT> {
    offset
        .as_int()
        .map_err(|t| guest_error(format!("TypeError: invalid offset of type {t}")))
}

fn signed_arg(value: &Dynamic) -> GuestResult<i64> {
    if let Ok(i) = value.as_int() {
        return Ok(i);
    }
    if let Some(u) = value.read_lock::<u64>() {
        return i64::try_from(*u)
            .map_err(|_| guest_error(format!("RangeError: value {} does not fit a signed 64-bit integer", *u)));
    }
    Err(guest_error(format!(
        "TypeError: invalid value of type {}",
        value.type_name()
    )))
}

fn unsigned_arg(value: &Dynamic) -> GuestResult<u64> {
    if let Ok(i) = value.as_int() {
        return u64::try_from(i)
            .map_err(|_| guest_error(format!("RangeError: value {i} must not be negative")));
    }
    if let Some(u) = value.read_lock::<u64>() {
        return Ok(*u);
    }
    Err(guest_error(format!(
        "TypeError: invalid value of type {}",
        value.type_name()
    )))
}

fn with_view<T>(
    view: &Map,
    op: impl FnOnce(&[u8]) -> Result<T, ScriptError>,
) -> Result<T, ScriptError> {
    let range = view_range(view)?;
    let data = view
        .get(FIELD_DATA)
        .and_then(|data| data.read_lock::<Blob>())
        .ok_or_else(|| ScriptError::invalid_buffer("`buffer` field is not binary data"))?;
    op(&data[range])
}

fn with_view_mut<T>(
    view: &mut Map,
    op: impl FnOnce(&mut [u8]) -> Result<T, ScriptError>,
) -> Result<T, ScriptError> {
    let range = view_range(view)?;
    let mut data = view
        .get_mut(FIELD_DATA)
        .and_then(|data| data.write_lock::<Blob>())
        .ok_or_else(|| ScriptError::invalid_buffer("`buffer` field is not binary data"))?;
    op(&mut data[range])
}
