use std::fmt::Display;

use rhai::EvalAltResult;
use thiserror::Error;

use crate::value::HostValue;

/// Result type of host functions called from guest code.
pub(crate) type GuestResult<T> = Result<T, Box<EvalAltResult>>;

/// Abort the current guest call with `err` as a runtime error.
pub(crate) fn guest_error(err: impl Display) -> Box<EvalAltResult> {
    err.to_string().into()
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to load bundled library {name}: {message}")]
    ScriptLoad { name: String, message: String },

    #[error("compile failed for script {identity}: {message}")]
    Compile { identity: String, message: String },

    #[error("script {identity} does not define a `handler` function")]
    HandlerMissing { identity: String },

    #[error("script {identity} failed to reload earlier and is unchanged: {reason}")]
    StaleReload { identity: String, reason: String },

    #[error("no cached script for identity {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid buffer{}: {reason}", location(.index, .field))]
    InvalidBuffer {
        index: Option<usize>,
        field: Option<String>,
        reason: String,
    },

    #[error("offset {offset} out of range: {width} bytes needed, buffer length is {len}")]
    InvalidOffset { offset: i64, width: usize, len: usize },

    #[error("result record {index} is missing field `{field}`")]
    MissingField { index: usize, field: String },

    #[error("type mismatch{}: {message}", location(.index, .field))]
    TypeMismatch {
        index: Option<usize>,
        field: Option<String>,
        message: String,
    },

    #[error("script {identity} failed: {message}")]
    Execution {
        identity: String,
        message: String,
        /// Value passed to `throw`, when the guest threw one.
        thrown: Option<HostValue>,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ScriptError {
    pub(crate) fn invalid_buffer(reason: impl Into<String>) -> Self {
        Self::InvalidBuffer {
            index: None,
            field: None,
            reason: reason.into(),
        }
    }

    pub(crate) fn type_mismatch(index: Option<usize>, field: Option<&str>, message: impl Into<String>) -> Self {
        Self::TypeMismatch {
            index,
            field: field.map(str::to_string),
            message: message.into(),
        }
    }
}

fn location(index: &Option<usize>, field: &Option<String>) -> String {
    match (index, field) {
        (Some(i), Some(f)) => format!(" in record {i} field `{f}`"),
        (Some(i), None) => format!(" in record {i}"),
        (None, Some(f)) => format!(" in field `{f}`"),
        (None, None) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_error_mentions_record_and_field() {
        let err = ScriptError::InvalidBuffer {
            index: Some(2),
            field: Some("raw".into()),
            reason: "offset 9 beyond data length 4".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid buffer in record 2 field `raw`: offset 9 beyond data length 4"
        );
    }

    #[test]
    fn unlocated_mismatch_has_no_location_suffix() {
        let err = ScriptError::type_mismatch(None, None, "result is not an array");
        assert_eq!(err.to_string(), "type mismatch: result is not an array");
    }
}
