//! The `logger` global bound into every instance.

use std::sync::Arc;

use rhai::{Dynamic, Engine};

use crate::config::LoggerConfig;

/// Target of every event emitted on behalf of a guest script.
pub const SCRIPT_TARGET: &str = "hostscript::script";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Default)]
struct Tags {
    project: Option<String>,
    module: Option<String>,
    group: Option<String>,
    key: Option<String>,
}

/// Contextual logger handed to guests. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct ScriptLogger {
    tags: Arc<Tags>,
}

macro_rules! script_event {
    ($level:expr, $tags:expr, $message:expr) => {{
        let tags = $tags;
        let message = $message;
        match $level {
            LogLevel::Debug => tracing::debug!(
                target: SCRIPT_TARGET,
                project = tags.project.as_deref(),
                module = tags.module.as_deref(),
                group = tags.group.as_deref(),
                key = tags.key.as_deref(),
                "{message}"
            ),
            LogLevel::Info => tracing::info!(
                target: SCRIPT_TARGET,
                project = tags.project.as_deref(),
                module = tags.module.as_deref(),
                group = tags.group.as_deref(),
                key = tags.key.as_deref(),
                "{message}"
            ),
            LogLevel::Warn => tracing::warn!(
                target: SCRIPT_TARGET,
                project = tags.project.as_deref(),
                module = tags.module.as_deref(),
                group = tags.group.as_deref(),
                key = tags.key.as_deref(),
                "{message}"
            ),
            LogLevel::Error => tracing::error!(
                target: SCRIPT_TARGET,
                project = tags.project.as_deref(),
                module = tags.module.as_deref(),
                group = tags.group.as_deref(),
                key = tags.key.as_deref(),
                "{message}"
            ),
        }
    }};
}

/// Registers `name` for every arity from zero up to the number of idents.
macro_rules! register_arities {
    ($engine:expr, $name:expr, $level:expr;) => {
        $engine.register_fn($name, move |logger: ScriptLogger| {
            logger.emit($level, &[]);
        });
    };
    ($engine:expr, $name:expr, $level:expr; $first:ident $($rest:ident)*) => {
        $engine.register_fn($name, move |logger: ScriptLogger, $first: Dynamic, $($rest: Dynamic),*| {
            logger.emit($level, &[$first, $($rest),*]);
        });
        register_arities!($engine, $name, $level; $($rest)*);
    };
}

impl ScriptLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_project(self, project: impl Into<String>) -> Self {
        self.retag(|tags| tags.project = Some(project.into()))
    }

    pub fn with_module(self, module: impl Into<String>) -> Self {
        self.retag(|tags| tags.module = Some(module.into()))
    }

    pub fn with_group(self, group: impl Into<String>) -> Self {
        self.retag(|tags| tags.group = Some(group.into()))
    }

    pub fn with_key(self, key: impl Into<String>) -> Self {
        self.retag(|tags| tags.key = Some(key.into()))
    }

    pub fn project(&self) -> Option<&str> {
        self.tags.project.as_deref()
    }

    pub fn key(&self) -> Option<&str> {
        self.tags.key.as_deref()
    }

    fn retag(self, edit: impl FnOnce(&mut Tags)) -> Self {
        let mut tags = Tags::clone(&self.tags);
        edit(&mut tags);
        Self {
            tags: Arc::new(tags),
        }
    }

    fn emit(&self, level: LogLevel, args: &[Dynamic]) {
        let message = args
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        script_event!(level, &self.tags, message);
    }

    pub(crate) fn register(engine: &mut Engine) {
        engine.register_type_with_name::<ScriptLogger>("Logger");

        for (name, level) in [
            ("Debug", LogLevel::Debug),
            ("Info", LogLevel::Info),
            ("Warn", LogLevel::Warn),
            ("Error", LogLevel::Error),
        ] {
            register_arities!(engine, name, level; a b c d e f g h);
        }
    }
}

impl From<&LoggerConfig> for ScriptLogger {
    fn from(config: &LoggerConfig) -> Self {
        Self {
            tags: Arc::new(Tags {
                project: config.project.clone(),
                module: config.module.clone(),
                group: config.group.clone(),
                key: config.key.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_leave_the_source_logger_untouched() {
        let base = ScriptLogger::new().with_project("plant-a");
        let keyed = base.clone().with_key("meter-9");
        assert_eq!(base.key(), None);
        assert_eq!(keyed.project(), Some("plant-a"));
        assert_eq!(keyed.key(), Some("meter-9"));
    }

    #[test]
    fn guest_calls_accept_one_to_three_arguments() {
        let mut engine = Engine::new();
        ScriptLogger::register(&mut engine);
        let mut scope = rhai::Scope::new();
        scope.push_constant("logger", ScriptLogger::new().with_module("decoder"));

        engine
            .run_with_scope(
                &mut scope,
                r#"
                    logger.Debug("one");
                    logger.Info("two", 2);
                    logger.Warn("three", 3, [3]);
                    logger.Error(#{ code: 500 });
                "#,
            )
            .unwrap();
    }

    #[test]
    fn any_argument_count_up_to_eight_is_accepted() {
        let mut engine = Engine::new();
        ScriptLogger::register(&mut engine);
        let mut scope = rhai::Scope::new();
        scope.push_constant("logger", ScriptLogger::new());
        engine
            .run_with_scope(
                &mut scope,
                r#"
                    logger.Info();
                    logger.Warn(1, 2, 3, 4);
                    logger.Error(1, 2, 3, 4, 5, 6, 7, 8);
                "#,
            )
            .unwrap();
    }

    #[test]
    fn built_from_config_tags() {
        let config = LoggerConfig {
            group: Some("edge".into()),
            ..LoggerConfig::default()
        };
        let logger = ScriptLogger::from(&config);
        assert_eq!(logger.tags.group.as_deref(), Some("edge"));
        assert_eq!(logger.project(), None);
    }
}
