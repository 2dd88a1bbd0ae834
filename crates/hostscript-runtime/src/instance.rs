use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Duration;

use rhai::{AST, CallFnOptions, Dynamic, Engine, EvalAltResult, Scope};
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::buffer::bytes_from_guest_buffer;
use crate::error::ScriptError;
use crate::factory::{Globals, STATE_GLOBAL};
use crate::library::{BUFFER_NAMESPACE, LibrarySet};
use crate::state::StateHandle;
use crate::value::{Arg, HostValue};

/// Entry point every guest script must define.
pub const HANDLER: &str = "handler";

/// SHA-256 hex digest of a script's text.
///
/// Used both as the fingerprint of loaded text and as the identity of
/// scripts run without an explicit one.
pub fn digest(script: &str) -> String {
    hex::encode(Sha256::digest(script.as_bytes()))
}

/// What [`ScriptInstance::ensure_script`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Unchanged,
    Loaded,
    Reloaded,
}

struct LoadedScript {
    ast: AST,
    fingerprint: String,
}

/// Text that failed to reload over a working script.
struct FailedReload {
    fingerprint: String,
    reason: String,
}

/// Everything guarded by the instance lock. Fingerprint and handler live in
/// the same `LoadedScript`, so they are always replaced together.
struct GuestState {
    engine: Engine,
    scope: Scope<'static>,
    script: Option<LoadedScript>,
    failed_reload: Option<FailedReload>,
}

/// One guest engine with its own state container and exclusive lock.
///
/// At most one call runs inside an instance at a time; calls for the same
/// instance queue on its lock, including while a guest sleeps.
pub struct ScriptInstance {
    identity: String,
    guest: Mutex<GuestState>,
    globals: Globals,
    state: StateHandle,
    libraries: Arc<LibrarySet>,
    last_access: Mutex<Instant>,
}

fn loaded_fingerprint(guest: &GuestState) -> Option<String> {
    guest.script.as_ref().map(|loaded| loaded.fingerprint.clone())
}

impl fmt::Debug for ScriptInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never block on the guest lock; a call may be in flight.
        let (fingerprint, busy) = match self.guest.try_lock() {
            Ok(guest) => (loaded_fingerprint(&guest), false),
            Err(TryLockError::Poisoned(poisoned)) => (loaded_fingerprint(&poisoned.into_inner()), false),
            Err(TryLockError::WouldBlock) => (None, true),
        };
        f.debug_struct("ScriptInstance")
            .field("identity", &self.identity)
            .field("fingerprint", &fingerprint)
            .field("busy", &busy)
            .finish_non_exhaustive()
    }
}

impl ScriptInstance {
    pub(crate) fn new(
        identity: &str,
        engine: Engine,
        globals: Globals,
        state: StateHandle,
        libraries: Arc<LibrarySet>,
    ) -> Self {
        Self {
            identity: identity.to_string(),
            guest: Mutex::new(GuestState {
                engine,
                scope: Scope::new(),
                script: None,
                failed_reload: None,
            }),
            globals,
            state,
            libraries,
            last_access: Mutex::new(Instant::now()),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// The per-instance state container bound as `state`.
    pub fn state(&self) -> &StateHandle {
        &self.state
    }

    /// Fingerprint of the script currently serving calls.
    pub fn fingerprint(&self) -> Option<String> {
        loaded_fingerprint(&self.lock())
    }

    /// Make `script` the loaded script, compiling only when its text changed.
    ///
    /// A failed reload leaves the previous script serving. Supplying the
    /// same failing text again returns [`ScriptError::StaleReload`] without
    /// recompiling.
    pub fn ensure_script(&self, script: &str) -> Result<LoadOutcome, ScriptError> {
        let mut guest = self.lock();
        self.load_locked(&mut guest, script)
    }

    /// Call `handler` with `args`.
    pub fn invoke(&self, args: Vec<Arg>) -> Result<Dynamic, ScriptError> {
        let args = args.into_iter().map(Arg::into_dynamic).collect();
        let mut guest = self.lock();
        self.invoke_locked(&mut guest, args)
    }

    /// Load `script` if needed and call `handler`, under one hold of the lock.
    pub fn invoke_script(&self, script: &str, args: Vec<Arg>) -> Result<Dynamic, ScriptError> {
        let args = args.into_iter().map(Arg::into_dynamic).collect();
        let mut guest = self.lock();
        self.load_locked(&mut guest, script)?;
        self.invoke_locked(&mut guest, args)
    }

    /// Bind `value` as a global named `key`, visible to the guest by name.
    pub fn set_obj(&self, key: &str, value: impl Into<Arg>) -> Result<(), ScriptError> {
        if !is_identifier(key) {
            return Err(ScriptError::InvalidArgument(format!(
                "`{key}` is not a valid global name"
            )));
        }
        if key == STATE_GLOBAL {
            return Err(ScriptError::InvalidArgument(format!(
                "`{key}` is reserved for the instance state container"
            )));
        }
        let value = value.into().into_dynamic();
        let mut globals = self.globals.write().unwrap_or_else(PoisonError::into_inner);
        globals.insert(key.to_string(), value);
        Ok(())
    }

    /// Build a guest buffer over a copy of `bytes` using the guest's own
    /// `Buffer::from` constructor.
    pub fn buffer_from_bytes(&self, bytes: &[u8]) -> Result<Dynamic, ScriptError> {
        let program = self
            .libraries
            .get(BUFFER_NAMESPACE)
            .filter(|program| program.defines("from", 1))
            .ok_or_else(|| {
                ScriptError::InvalidArgument(format!("`{BUFFER_NAMESPACE}::from` is not available"))
            })?;

        let guest = self.lock();
        let mut scope = Scope::new();
        guest
            .engine
            .call_fn_with_options::<Dynamic>(
                CallFnOptions::new().eval_ast(false),
                &mut scope,
                program.ast(),
                "from",
                vec![Dynamic::from_blob(bytes.to_vec())],
            )
            .map_err(|e| self.execution_error(&e))
    }

    pub fn bytes_from_buffer(&self, value: &Dynamic) -> Result<Vec<u8>, ScriptError> {
        bytes_from_guest_buffer(value)
    }

    pub(crate) fn touch(&self) {
        *self.last_access.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        let last = *self.last_access.lock().unwrap_or_else(PoisonError::into_inner);
        now.saturating_duration_since(last)
    }

    /// Whether a call currently holds the instance lock.
    pub(crate) fn is_busy(&self) -> bool {
        matches!(self.guest.try_lock(), Err(TryLockError::WouldBlock))
    }

    // A guest that panicked mid-call leaves the lock poisoned; the engine is
    // still usable, so keep serving.
    fn lock(&self) -> MutexGuard<'_, GuestState> {
        self.guest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load_locked(&self, guest: &mut GuestState, script: &str) -> Result<LoadOutcome, ScriptError> {
        let fingerprint = digest(script);

        if guest
            .script
            .as_ref()
            .is_some_and(|loaded| loaded.fingerprint == fingerprint)
        {
            return Ok(LoadOutcome::Unchanged);
        }

        if let Some(failed) = guest
            .failed_reload
            .as_ref()
            .filter(|failed| failed.fingerprint == fingerprint)
        {
            return Err(ScriptError::StaleReload {
                identity: self.identity.clone(),
                reason: failed.reason.clone(),
            });
        }

        let reloading = guest.script.is_some();
        match self.compile_and_run(guest, script) {
            Ok(ast) => {
                guest.script = Some(LoadedScript { ast, fingerprint });
                guest.failed_reload = None;
                if reloading {
                    tracing::info!(identity = %self.identity, "Script reloaded");
                    Ok(LoadOutcome::Reloaded)
                } else {
                    tracing::info!(identity = %self.identity, "Script loaded");
                    Ok(LoadOutcome::Loaded)
                }
            }
            Err(err) => {
                if reloading {
                    tracing::warn!(
                        identity = %self.identity,
                        "Script reload failed, keeping previous script: {err}"
                    );
                    guest.failed_reload = Some(FailedReload {
                        fingerprint,
                        reason: err.to_string(),
                    });
                }
                Err(err)
            }
        }
    }

    fn compile_and_run(&self, guest: &mut GuestState, script: &str) -> Result<AST, ScriptError> {
        let ast = guest.engine.compile(script).map_err(|e| ScriptError::Compile {
            identity: self.identity.clone(),
            message: e.to_string(),
        })?;

        guest
            .engine
            .run_ast_with_scope(&mut guest.scope, &ast)
            .map_err(|e| self.execution_error(&e))?;

        if !ast.iter_functions().any(|f| f.name == HANDLER) {
            return Err(ScriptError::HandlerMissing {
                identity: self.identity.clone(),
            });
        }
        Ok(ast)
    }

    fn invoke_locked(&self, guest: &mut GuestState, args: Vec<Dynamic>) -> Result<Dynamic, ScriptError> {
        let GuestState {
            engine,
            scope,
            script,
            ..
        } = guest;
        let loaded = script.as_ref().ok_or_else(|| ScriptError::HandlerMissing {
            identity: self.identity.clone(),
        })?;

        engine
            .call_fn_with_options::<Dynamic>(
                CallFnOptions::new().eval_ast(false).rewind_scope(true),
                scope,
                &loaded.ast,
                HANDLER,
                args,
            )
            .map_err(|e| self.execution_error(&e))
    }

    fn execution_error(&self, err: &EvalAltResult) -> ScriptError {
        let thrown = match err.unwrap_inner() {
            EvalAltResult::ErrorRuntime(value, _) => HostValue::from_dynamic(value).ok(),
            _ => None,
        };
        ScriptError::Execution {
            identity: self.identity.clone(),
            message: err.to_string(),
            thrown,
        }
    }
}

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::factory::InstanceFactory;

    fn instance(identity: &str) -> ScriptInstance {
        let libraries = Arc::new(LibrarySet::load_bundled().unwrap());
        InstanceFactory::new(libraries, &RuntimeConfig::default())
            .new_instance(identity)
            .unwrap()
    }

    #[test]
    fn digest_is_sha256_hex() {
        assert_eq!(
            digest(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn same_text_is_not_recompiled() {
        let instance = instance("counter");
        let script = r#"
            state.set("loads", state.get_or("loads", 0) + 1);
            fn handler() { state.get("loads") }
        "#;
        assert_eq!(instance.ensure_script(script).unwrap(), LoadOutcome::Loaded);
        assert_eq!(instance.ensure_script(script).unwrap(), LoadOutcome::Unchanged);
        assert_eq!(instance.invoke(Vec::new()).unwrap().as_int().unwrap(), 1);
        assert_eq!(instance.fingerprint(), Some(digest(script)));
    }

    #[test]
    fn missing_handler_is_reported() {
        let err = instance("nohandler").ensure_script("let x = 1;").unwrap_err();
        assert!(matches!(err, ScriptError::HandlerMissing { .. }));
    }

    #[test]
    fn thrown_values_are_carried_out() {
        let instance = instance("thrower");
        instance
            .ensure_script(r#"fn handler(code) { throw #{ code: code }; }"#)
            .unwrap();
        match instance.invoke(vec![Arg::host(7)]).unwrap_err() {
            ScriptError::Execution { thrown, .. } => {
                let expected = HostValue::Map([("code".to_string(), HostValue::Int(7))].into());
                assert_eq!(thrown, Some(expected));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn set_obj_binds_globals_for_functions() {
        let instance = instance("globals");
        instance.set_obj("site", Arg::host("north")).unwrap();
        instance
            .ensure_script(r#"fn handler() { site + "-" + limit }"#)
            .unwrap();
        instance.set_obj("limit", Arg::host(10)).unwrap();
        let value = instance.invoke(Vec::new()).unwrap();
        assert_eq!(value.into_string().unwrap(), "north-10");
    }

    #[test]
    fn set_obj_rejects_bad_names() {
        let instance = instance("names");
        for key in ["", "1st", "has space", "state"] {
            let err = instance.set_obj(key, Arg::host(1)).unwrap_err();
            assert!(matches!(err, ScriptError::InvalidArgument(_)), "{key:?}");
        }
    }

    #[test]
    fn buffer_constructor_wraps_bytes() {
        let instance = instance("buffers");
        let buffer = instance.buffer_from_bytes(&[1, 2, 3]).unwrap();
        assert!(crate::buffer::is_buffer(&buffer));
        assert_eq!(instance.bytes_from_buffer(&buffer).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn missing_buffer_constructor_is_invalid_argument() {
        let factory = InstanceFactory::new(Arc::new(LibrarySet::default()), &RuntimeConfig::default());
        let instance = factory.new_instance("bare").unwrap();
        let err = instance.buffer_from_bytes(&[1]).unwrap_err();
        assert!(matches!(err, ScriptError::InvalidArgument(_)));
    }

    #[test]
    fn idle_lock_is_not_busy() {
        assert!(!instance("idle").is_busy());
    }

    #[test]
    fn debug_output_names_identity_and_fingerprint() {
        let instance = instance("dbg");
        let text = "fn handler() { 1 }";
        instance.ensure_script(text).unwrap();
        let shown = format!("{instance:?}");
        assert!(shown.contains("\"dbg\""));
        assert!(shown.contains(&digest(text)));
        assert!(shown.contains("busy: false"));
    }
}
