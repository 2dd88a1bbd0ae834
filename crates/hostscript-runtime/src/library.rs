use std::borrow::Cow;

use rhai::{AST, Engine};

use crate::config::EngineConfig;
use crate::error::ScriptError;

/// Namespace the buffer constructor library is bound under.
pub const BUFFER_NAMESPACE: &str = "Buffer";

/// Source text of one helper library, identified by a logical path.
#[derive(Debug, Clone)]
pub struct LibrarySource {
    pub name: Cow<'static, str>,
    pub namespace: Cow<'static, str>,
    pub source: Cow<'static, str>,
}

impl LibrarySource {
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        namespace: impl Into<Cow<'static, str>>,
        source: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            source: source.into(),
        }
    }
}

/// Immutable compiled unit of a helper library.
#[derive(Debug, Clone)]
pub struct LibraryProgram {
    name: String,
    namespace: String,
    ast: AST,
}

impl LibraryProgram {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn ast(&self) -> &AST {
        &self.ast
    }

    /// Whether the library defines a function `name` taking `arity` parameters.
    pub fn defines(&self, name: &str, arity: usize) -> bool {
        self.ast
            .iter_functions()
            .any(|f| f.name == name && f.params.len() == arity)
    }
}

/// The ordered set of preloaded helper libraries.
///
/// Compiled once before any instance is created and shared read-only by
/// every instance afterwards. Later libraries may call into earlier ones.
#[derive(Debug, Clone, Default)]
pub struct LibrarySet {
    programs: Vec<LibraryProgram>,
}

impl LibrarySet {
    /// The helper libraries shipped with the runtime, in preload order.
    pub fn bundled_sources() -> Vec<LibrarySource> {
        vec![
            LibrarySource::new(
                "packages/buffer.rhai",
                BUFFER_NAMESPACE,
                include_str!("../packages/buffer.rhai"),
            ),
            LibrarySource::new(
                "packages/lodash.rhai",
                "lodash",
                include_str!("../packages/lodash.rhai"),
            ),
            LibrarySource::new(
                "packages/formula.rhai",
                "formulajs",
                include_str!("../packages/formula.rhai"),
            ),
        ]
    }

    pub fn load_bundled() -> Result<Self, ScriptError> {
        Self::load_bundled_with(&EngineConfig::default())
    }

    pub fn load_bundled_with(limits: &EngineConfig) -> Result<Self, ScriptError> {
        Self::load_all_with(Self::bundled_sources(), limits)
    }

    /// Compile every source exactly once, in the order given, under the
    /// default engine limits.
    ///
    /// Any failure is a [`ScriptError::ScriptLoad`]; callers treat it as fatal.
    pub fn load_all(sources: impl IntoIterator<Item = LibrarySource>) -> Result<Self, ScriptError> {
        Self::load_all_with(sources, &EngineConfig::default())
    }

    /// Like [`LibrarySet::load_all`], compiling under `limits`.
    ///
    /// A bare engine uses much smaller expression depths in debug builds,
    /// so the limits must match the ones instances run with.
    pub fn load_all_with(
        sources: impl IntoIterator<Item = LibrarySource>,
        limits: &EngineConfig,
    ) -> Result<Self, ScriptError> {
        let mut engine = Engine::new_raw();
        engine.set_max_expr_depths(limits.max_expr_depth, limits.max_expr_depth);
        let mut programs = Vec::new();

        for source in sources {
            let ast = engine
                .compile(source.source.as_ref())
                .map_err(|e| ScriptError::ScriptLoad {
                    name: source.name.to_string(),
                    message: e.to_string(),
                })?;

            tracing::debug!(
                library = %source.name,
                namespace = %source.namespace,
                functions = ast.iter_functions().count(),
                "Library compiled"
            );

            programs.push(LibraryProgram {
                name: source.name.into_owned(),
                namespace: source.namespace.into_owned(),
                ast,
            });
        }

        Ok(Self { programs })
    }

    pub fn iter(&self) -> impl Iterator<Item = &LibraryProgram> {
        self.programs.iter()
    }

    pub fn get(&self, namespace: &str) -> Option<&LibraryProgram> {
        self.programs.iter().find(|p| p.namespace == namespace)
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }
}
