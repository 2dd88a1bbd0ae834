use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use rhai::packages::{Package, StandardPackage};
use rhai::{Dynamic, Engine, Module, Scope, Shared};

use crate::buffer;
use crate::config::{EngineConfig, RuntimeConfig};
use crate::error::ScriptError;
use crate::instance::ScriptInstance;
use crate::library::LibrarySet;
use crate::logger::{SCRIPT_TARGET, ScriptLogger};
use crate::state::StateHandle;
use crate::stdlib::HostModules;

pub(crate) const STATE_GLOBAL: &str = "state";
pub(crate) const LOGGER_GLOBAL: &str = "logger";

/// Host values visible to guest code by plain name, from top-level
/// statements and script functions alike.
pub(crate) type Globals = Arc<RwLock<HashMap<String, Dynamic>>>;

/// Builds fresh guest instances with the preloaded libraries and host
/// bindings in place.
///
/// Everything shared between instances (compiled libraries, the standard
/// package and the host-native modules) is built once here; each instance
/// gets its own engine, scope, state container and globals.
pub struct InstanceFactory {
    libraries: Arc<LibrarySet>,
    std_package: Shared<Module>,
    host_modules: HostModules,
    logger: ScriptLogger,
    limits: EngineConfig,
}

impl InstanceFactory {
    pub fn new(libraries: Arc<LibrarySet>, config: &RuntimeConfig) -> Self {
        Self {
            libraries,
            std_package: StandardPackage::new().as_shared_module(),
            host_modules: HostModules::standard(),
            logger: ScriptLogger::from(&config.logger),
            limits: config.engine.clone(),
        }
    }

    /// Replace the logger handed to new instances.
    pub fn with_logger(mut self, logger: ScriptLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn libraries(&self) -> &Arc<LibrarySet> {
        &self.libraries
    }

    /// Build one instance for `identity`, with no user script loaded yet.
    pub fn new_instance(&self, identity: &str) -> Result<ScriptInstance, ScriptError> {
        let mut engine = Engine::new_raw();
        engine.register_global_module(self.std_package.clone());
        engine.set_max_call_levels(self.limits.max_call_levels);
        engine.set_max_expr_depths(self.limits.max_expr_depth, self.limits.max_expr_depth);
        route_output(&mut engine, identity);

        StateHandle::register(&mut engine);
        ScriptLogger::register(&mut engine);
        buffer::extensions::register(&mut engine);

        let state = StateHandle::new();
        let globals: Globals = Arc::new(RwLock::new(HashMap::from([
            (STATE_GLOBAL.to_string(), Dynamic::from(state.clone())),
            (LOGGER_GLOBAL.to_string(), Dynamic::from(self.logger.clone())),
        ])));
        let resolver = Arc::clone(&globals);
        // `on_var` is flagged as a volatile API; no stable hook lets script
        // functions see host globals.
        #[allow(deprecated)]
        engine.on_var(move |name, index, _context| {
            // Locals already placed in scope shadow host globals.
            if index > 0 {
                return Ok(None);
            }
            let globals = resolver.read().unwrap_or_else(PoisonError::into_inner);
            Ok(globals.get(name).cloned())
        });

        for (namespace, module) in self.host_modules.iter() {
            engine.register_static_module(namespace, module);
        }

        for program in self.libraries.iter() {
            let module = Module::eval_ast_as_new(Scope::new(), program.ast(), &engine).map_err(|e| {
                ScriptError::ScriptLoad {
                    name: program.name().to_string(),
                    message: e.to_string(),
                }
            })?;
            engine.register_static_module(program.namespace(), module.into());
        }

        tracing::debug!(identity, libraries = self.libraries.len(), "Instance created");

        Ok(ScriptInstance::new(
            identity,
            engine,
            globals,
            state,
            Arc::clone(&self.libraries),
        ))
    }
}

fn route_output(engine: &mut Engine, identity: &str) {
    let print_identity = identity.to_string();
    engine.on_print(move |text| {
        tracing::info!(target: SCRIPT_TARGET, identity = %print_identity, "{text}");
    });

    let debug_identity = identity.to_string();
    engine.on_debug(move |text, source, pos| {
        tracing::debug!(
            target: SCRIPT_TARGET,
            identity = %debug_identity,
            source,
            position = %pos,
            "{text}"
        );
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::LibrarySource;

    fn factory() -> InstanceFactory {
        let libraries = Arc::new(LibrarySet::load_bundled().unwrap());
        InstanceFactory::new(libraries, &RuntimeConfig::default())
    }

    #[test]
    fn instances_have_independent_state() {
        let factory = factory();
        let a = factory.new_instance("a").unwrap();
        let b = factory.new_instance("b").unwrap();
        a.state().set("seen", Dynamic::from_int(1));
        assert!(a.state().get("seen").is_some());
        assert!(b.state().get("seen").is_none());
    }

    #[test]
    fn fresh_instance_has_no_script() {
        let instance = factory().new_instance("fresh").unwrap();
        assert!(instance.fingerprint().is_none());
        let err = instance.invoke(Vec::new()).unwrap_err();
        assert!(matches!(err, ScriptError::HandlerMissing { .. }));
    }

    #[test]
    fn library_that_fails_at_load_time_is_a_script_load_error() {
        let libraries = LibrarySet::load_all(vec![LibrarySource::new(
            "packages/explodes.rhai",
            "explodes",
            r#"throw "boom";"#,
        )])
        .unwrap();
        let factory = InstanceFactory::new(Arc::new(libraries), &RuntimeConfig::default());
        match factory.new_instance("x") {
            Err(ScriptError::ScriptLoad { name, .. }) => assert_eq!(name, "packages/explodes.rhai"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected a load failure"),
        }
    }

    #[test]
    fn later_libraries_see_earlier_namespaces() {
        let libraries = LibrarySet::load_all(vec![
            LibrarySource::new("base.rhai", "base", "fn two() { 2 }"),
            LibrarySource::new("derived.rhai", "derived", "fn four() { base::two() * 2 }"),
        ])
        .unwrap();
        let factory = InstanceFactory::new(Arc::new(libraries), &RuntimeConfig::default());
        let instance = factory.new_instance("x").unwrap();
        instance
            .ensure_script("fn handler() { derived::four() }")
            .unwrap();
        let value = instance.invoke(Vec::new()).unwrap();
        assert_eq!(value.as_int().unwrap(), 4);
    }
}
