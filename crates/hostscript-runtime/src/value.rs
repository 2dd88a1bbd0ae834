use std::collections::BTreeMap;

use rhai::{Array, Blob, Dynamic, Map};
use serde::Serialize;

use crate::error::ScriptError;

/// A value crossing the host/guest boundary in host form.
///
/// Conversion into the guest is total; conversion out of the guest fails
/// with [`ScriptError::InvalidArgument`] for guest values that have no host
/// form (function pointers, timestamps, opaque custom types).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum HostValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<HostValue>),
    Map(BTreeMap<String, HostValue>),
}

impl HostValue {
    /// Convert into a guest-native value.
    ///
    /// Unsigned values that do not fit the guest integer stay `u64`.
    pub fn to_dynamic(&self) -> Dynamic {
        match self {
            HostValue::Null => Dynamic::UNIT,
            HostValue::Bool(b) => Dynamic::from_bool(*b),
            HostValue::Int(i) => Dynamic::from_int(*i),
            HostValue::UInt(u) => match i64::try_from(*u) {
                Ok(i) => Dynamic::from_int(i),
                Err(_) => Dynamic::from(*u),
            },
            HostValue::Float(f) => Dynamic::from_float(*f),
            HostValue::String(s) => Dynamic::from(s.clone()),
            HostValue::Bytes(b) => Dynamic::from_blob(b.clone()),
            HostValue::Array(items) => {
                Dynamic::from_array(items.iter().map(HostValue::to_dynamic).collect::<Array>())
            }
            HostValue::Map(entries) => {
                let map: Map = entries
                    .iter()
                    .map(|(k, v)| (k.as_str().into(), v.to_dynamic()))
                    .collect();
                Dynamic::from_map(map)
            }
        }
    }

    /// Export a guest value to its natural host representation.
    pub fn from_dynamic(value: &Dynamic) -> Result<Self, ScriptError> {
        let value = value.flatten_clone();

        if value.is_unit() {
            return Ok(HostValue::Null);
        }
        if let Ok(b) = value.as_bool() {
            return Ok(HostValue::Bool(b));
        }
        if let Ok(i) = value.as_int() {
            return Ok(HostValue::Int(i));
        }
        if let Ok(f) = value.as_float() {
            return Ok(HostValue::Float(f));
        }
        if let Ok(c) = value.as_char() {
            return Ok(HostValue::String(c.to_string()));
        }
        if value.is_string() {
            return value
                .into_string()
                .map(HostValue::String)
                .map_err(|t| ScriptError::InvalidArgument(format!("cannot export {t}")));
        }
        if value.is_blob() {
            let bytes: Blob = value.cast();
            return Ok(HostValue::Bytes(bytes));
        }
        if value.is_array() {
            let items: Array = value.cast();
            return items
                .iter()
                .map(HostValue::from_dynamic)
                .collect::<Result<Vec<_>, _>>()
                .map(HostValue::Array);
        }
        if value.is_map() {
            let map: Map = value.cast();
            let mut entries = BTreeMap::new();
            for (key, item) in &map {
                entries.insert(key.to_string(), HostValue::from_dynamic(item)?);
            }
            return Ok(HostValue::Map(entries));
        }
        if value.is::<u64>() {
            return Ok(HostValue::UInt(value.cast::<u64>()));
        }

        Err(ScriptError::InvalidArgument(format!(
            "guest value of type {} has no host representation",
            value.type_name()
        )))
    }
}

impl From<bool> for HostValue {
    fn from(v: bool) -> Self {
        HostValue::Bool(v)
    }
}

impl From<i64> for HostValue {
    fn from(v: i64) -> Self {
        HostValue::Int(v)
    }
}

impl From<i32> for HostValue {
    fn from(v: i32) -> Self {
        HostValue::Int(v.into())
    }
}

impl From<u64> for HostValue {
    fn from(v: u64) -> Self {
        HostValue::UInt(v)
    }
}

impl From<f64> for HostValue {
    fn from(v: f64) -> Self {
        HostValue::Float(v)
    }
}

impl From<&str> for HostValue {
    fn from(v: &str) -> Self {
        HostValue::String(v.to_string())
    }
}

impl From<String> for HostValue {
    fn from(v: String) -> Self {
        HostValue::String(v)
    }
}

impl From<Vec<u8>> for HostValue {
    fn from(v: Vec<u8>) -> Self {
        HostValue::Bytes(v)
    }
}

impl From<Vec<HostValue>> for HostValue {
    fn from(v: Vec<HostValue>) -> Self {
        HostValue::Array(v)
    }
}

impl From<BTreeMap<String, HostValue>> for HostValue {
    fn from(v: BTreeMap<String, HostValue>) -> Self {
        HostValue::Map(v)
    }
}

impl From<serde_json::Value> for HostValue {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => HostValue::Null,
            serde_json::Value::Bool(b) => HostValue::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    HostValue::Int(i)
                } else if let Some(u) = n.as_u64() {
                    HostValue::UInt(u)
                } else {
                    HostValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => HostValue::String(s),
            serde_json::Value::Array(items) => {
                HostValue::Array(items.into_iter().map(HostValue::from).collect())
            }
            serde_json::Value::Object(entries) => HostValue::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, HostValue::from(v)))
                    .collect(),
            ),
        }
    }
}

/// One argument for a guest `handler` call.
///
/// Guest values pass through untouched; host values are converted.
#[derive(Debug, Clone)]
pub enum Arg {
    Host(HostValue),
    Guest(Dynamic),
}

impl Arg {
    pub fn host(value: impl Into<HostValue>) -> Self {
        Arg::Host(value.into())
    }

    pub(crate) fn into_dynamic(self) -> Dynamic {
        match self {
            Arg::Host(value) => value.to_dynamic(),
            Arg::Guest(value) => value,
        }
    }
}

impl From<HostValue> for Arg {
    fn from(v: HostValue) -> Self {
        Arg::Host(v)
    }
}

impl From<Dynamic> for Arg {
    fn from(v: Dynamic) -> Self {
        Arg::Guest(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_objects_become_guest_maps() {
        let host = HostValue::from(serde_json::json!({
            "name": "pump-7",
            "readings": [1, 2.5, null],
            "on": true
        }));
        let guest = host.to_dynamic();
        assert!(guest.is_map());

        let back = HostValue::from_dynamic(&guest).unwrap();
        assert_eq!(back, host);
    }

    #[test]
    fn large_unsigned_survives_the_guest() {
        let host = HostValue::UInt(u64::MAX);
        let guest = host.to_dynamic();
        assert!(guest.is::<u64>());
        assert_eq!(HostValue::from_dynamic(&guest).unwrap(), host);
    }

    #[test]
    fn small_unsigned_becomes_guest_integer() {
        let guest = HostValue::UInt(42).to_dynamic();
        assert_eq!(guest.as_int().unwrap(), 42);
    }

    #[test]
    fn bytes_become_blobs() {
        let guest = HostValue::Bytes(vec![1, 2, 3]).to_dynamic();
        assert!(guest.is_blob());
    }

    #[test]
    fn unsupported_guest_values_are_rejected() {
        let fn_ptr = Dynamic::from(rhai::FnPtr::new("handler").unwrap());
        let err = HostValue::from_dynamic(&fn_ptr).unwrap_err();
        assert!(matches!(err, ScriptError::InvalidArgument(_)));
    }

    #[test]
    fn guest_args_pass_through() {
        let arg = Arg::from(Dynamic::from_int(7));
        assert_eq!(arg.into_dynamic().as_int().unwrap(), 7);
    }
}
