//! Conversion of guest return values into typed records.
//!
//! A handler reports its results as an array of objects:
//!
//! ```text
//! [ #{ id: "d1", table: "meters", cid: "c7", time: 1700000000000,
//!      values: #{ t: 21.5, raw: <buffer> } } ]
//! ```

use std::collections::BTreeMap;

use rhai::{Array, Dynamic, INT, Map};
use serde::Serialize;

use crate::buffer::{bytes_from_guest_buffer, is_buffer};
use crate::error::ScriptError;
use crate::value::HostValue;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedRecord {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(rename = "cid", skip_serializing_if = "Option::is_none")]
    pub sub_id: Option<String>,
    #[serde(rename = "time")]
    pub timestamp_millis: i64,
    pub values: BTreeMap<String, HostValue>,
}

/// Field names read from each record object.
#[derive(Debug, Clone)]
pub struct RecordKeys {
    pub id: String,
    pub table: String,
    pub sub_id: String,
    pub time: String,
    pub values: String,
}

impl Default for RecordKeys {
    fn default() -> Self {
        Self {
            id: "id".into(),
            table: "table".into(),
            sub_id: "cid".into(),
            time: "time".into(),
            values: "values".into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResultParser {
    keys: RecordKeys,
}

/// Parse with the default field names.
pub fn parse_result(value: &Dynamic) -> Result<Vec<ParsedRecord>, ScriptError> {
    ResultParser::default().parse(value)
}

/// Unit and NaN mean "no value" throughout the parser.
fn is_absent(value: &Dynamic) -> bool {
    value.is_unit() || value.as_float().is_ok_and(f64::is_nan)
}

impl ResultParser {
    pub fn new(keys: RecordKeys) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &RecordKeys {
        &self.keys
    }

    pub fn parse(&self, value: &Dynamic) -> Result<Vec<ParsedRecord>, ScriptError> {
        if is_absent(value) {
            return Ok(Vec::new());
        }
        let items = value.read_lock::<Array>().ok_or_else(|| {
            ScriptError::type_mismatch(
                None,
                None,
                format!("expected an array of records, got {}", value.type_name()),
            )
        })?;

        items
            .iter()
            .enumerate()
            .map(|(index, item)| self.parse_record(index, item))
            .collect()
    }

    fn parse_record(&self, index: usize, item: &Dynamic) -> Result<ParsedRecord, ScriptError> {
        let record = item.read_lock::<Map>().ok_or_else(|| {
            ScriptError::type_mismatch(
                Some(index),
                None,
                format!("expected an object, got {}", item.type_name()),
            )
        })?;

        let id = record
            .get(self.keys.id.as_str())
            .and_then(|v| v.clone().into_string().ok())
            .ok_or_else(|| self.missing(index, &self.keys.id))?;

        let values = record
            .get(self.keys.values.as_str())
            .and_then(|v| v.read_lock::<Map>())
            .ok_or_else(|| self.missing(index, &self.keys.values))?;

        Ok(ParsedRecord {
            id,
            table: optional_string(&record, index, &self.keys.table)?,
            sub_id: optional_string(&record, index, &self.keys.sub_id)?,
            timestamp_millis: timestamp(&record, index, &self.keys.time)?,
            values: export_values(&values, index)?,
        })
    }

    fn missing(&self, index: usize, field: &str) -> ScriptError {
        ScriptError::MissingField {
            index,
            field: field.to_string(),
        }
    }
}

fn optional_string(record: &Map, index: usize, key: &str) -> Result<Option<String>, ScriptError> {
    match record.get(key) {
        None => Ok(None),
        Some(value) if is_absent(value) => Ok(None),
        Some(value) => value
            .clone()
            .into_string()
            .map(Some)
            .map_err(|t| ScriptError::type_mismatch(Some(index), Some(key), format!("expected a string, got {t}"))),
    }
}

fn timestamp(record: &Map, index: usize, key: &str) -> Result<i64, ScriptError> {
    let Some(value) = record.get(key).filter(|v| !is_absent(v)) else {
        return Ok(0);
    };
    if let Ok(millis) = value.as_int() {
        return Ok(millis);
    }
    match value.as_float() {
        Ok(f) if f.is_finite() => Ok(f.trunc() as INT),
        _ => Err(ScriptError::type_mismatch(
            Some(index),
            Some(key),
            format!("expected a millisecond timestamp, got {}", value.type_name()),
        )),
    }
}

fn export_values(values: &Map, index: usize) -> Result<BTreeMap<String, HostValue>, ScriptError> {
    let mut out = BTreeMap::new();
    for (name, value) in values {
        if is_absent(value) {
            continue;
        }
        let host = if is_buffer(value) {
            bytes_from_guest_buffer(value)
                .map(HostValue::Bytes)
                .map_err(|e| match e {
                    ScriptError::InvalidBuffer { reason, .. } => ScriptError::InvalidBuffer {
                        index: Some(index),
                        field: Some(name.to_string()),
                        reason,
                    },
                    other => other,
                })?
        } else {
            HostValue::from_dynamic(value)
                .map_err(|e| ScriptError::type_mismatch(Some(index), Some(name.as_str()), e.to_string()))?
        };
        out.insert(name.to_string(), host);
    }
    Ok(out)
}
