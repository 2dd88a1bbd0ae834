//! Embedded script runtime for hostscript.
//!
//! Provides [`ScriptRuntime`], the single interface between a host
//! application and guest scripts. Scripts are compiled once per identity,
//! cached with their own state container, recompiled in place when their
//! text changes and evicted after sitting idle.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use hostscript_runtime::{Arg, RuntimeConfig, ScriptRuntime, parse_result};
//!
//! # fn run() -> Result<(), hostscript_runtime::ScriptError> {
//! let runtime = ScriptRuntime::new(RuntimeConfig::default())?;
//!
//! let script = r#"
//!     fn handler(reading) {
//!         [#{ id: "meter-1", time: reading.at, values: #{ kwh: reading.kwh * 2 } }]
//!     }
//! "#;
//! let reading = serde_json::json!({ "at": 1700000000000_i64, "kwh": 4.5 });
//!
//! let result = runtime.run_by_id_and_script("meter-1", script, vec![Arg::host(reading)])?;
//! let records = parse_result(&result)?;
//!
//! // Later calls can skip the script text entirely.
//! let again = runtime.run_by_id("meter-1", vec![Arg::host(serde_json::json!({ "at": 0, "kwh": 1 }))])?;
//! # let _ = (records, again);
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod cache;
pub mod config;
pub mod error;
pub mod factory;
pub mod host_api;
pub mod instance;
pub mod library;
pub mod logger;
pub mod parser;
pub mod runtime;
pub mod state;
pub mod stdlib;
pub mod value;
pub mod xml;

pub use config::RuntimeConfig;
pub use error::ScriptError;
pub use instance::{LoadOutcome, ScriptInstance, digest};
pub use library::{LibraryProgram, LibrarySet, LibrarySource};
pub use logger::ScriptLogger;
pub use parser::{ParsedRecord, RecordKeys, ResultParser, parse_result};
pub use runtime::ScriptRuntime;
pub use value::{Arg, HostValue};

/// Guest value type, re-exported so hosts need not depend on the engine crate.
pub use rhai::Dynamic;
