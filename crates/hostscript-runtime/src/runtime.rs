use std::sync::{Arc, Weak};

use rhai::Dynamic;
use tokio::task::JoinHandle;

use crate::cache::ScriptCache;
use crate::config::RuntimeConfig;
use crate::error::ScriptError;
use crate::factory::InstanceFactory;
use crate::instance::{ScriptInstance, digest};
use crate::library::LibrarySet;
use crate::logger::ScriptLogger;
use crate::value::Arg;

/// The embedded script runtime.
///
/// `ScriptRuntime` owns the preloaded library set and the script cache. It
/// is the single point of contact between the host application and guest
/// execution.
///
/// # Threading
///
/// `ScriptRuntime` is `Send + Sync` and is typically wrapped in `Arc`. Guest
/// calls block the calling thread; async hosts should run them with
/// `tokio::task::spawn_blocking`. Calls for different identities run in
/// parallel, calls for the same identity are serialized.
pub struct ScriptRuntime {
    config: RuntimeConfig,
    cache: ScriptCache,
}

impl ScriptRuntime {
    /// Compile the bundled libraries and build an empty runtime.
    ///
    /// Fails with [`ScriptError::ScriptLoad`] if a bundled library does not
    /// compile; the runtime cannot serve anything without them.
    pub fn new(config: RuntimeConfig) -> Result<Self, ScriptError> {
        let libraries = LibrarySet::load_bundled_with(&config.engine)?;
        tracing::debug!(libraries = libraries.len(), "Bundled libraries loaded");
        Ok(Self::with_libraries(config, libraries))
    }

    pub fn with_libraries(config: RuntimeConfig, libraries: LibrarySet) -> Self {
        let factory = InstanceFactory::new(Arc::new(libraries), &config);
        Self {
            cache: ScriptCache::new(factory),
            config,
        }
    }

    /// Use `logger` for every instance created from now on.
    pub fn with_logger(self, logger: ScriptLogger) -> Self {
        let Self { config, cache } = self;
        let factory = cache.into_factory().with_logger(logger);
        Self {
            cache: ScriptCache::new(factory),
            config,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Run `script` under an identity derived from its own text.
    pub fn run(&self, script: &str, args: Vec<Arg>) -> Result<Dynamic, ScriptError> {
        self.run_by_id_and_script(&digest(script), script, args)
    }

    /// Load `script` into the instance for `identity` if needed, then call it.
    ///
    /// Loading and calling happen under one hold of the instance lock, so
    /// the call always runs the text it supplied.
    pub fn run_by_id_and_script(
        &self,
        identity: &str,
        script: &str,
        args: Vec<Arg>,
    ) -> Result<Dynamic, ScriptError> {
        let instance = self.cache.get_or_create(identity, script)?;
        instance.invoke_script(script, args)
    }

    /// Call the script already cached under `identity`.
    pub fn run_by_id(&self, identity: &str, args: Vec<Arg>) -> Result<Dynamic, ScriptError> {
        let instance = self.cache.lookup(identity)?;
        instance.invoke(args)
    }

    pub fn acquire(&self, identity: &str, script: &str) -> Result<Arc<ScriptInstance>, ScriptError> {
        self.cache.acquire(identity, script)
    }

    pub fn lookup(&self, identity: &str) -> Result<Arc<ScriptInstance>, ScriptError> {
        self.cache.lookup(identity)
    }

    pub fn evict(&self, identity: &str) -> bool {
        self.cache.evict(identity)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Evict entries idle for the configured TTL. Returns how many went.
    pub fn sweep_expired(&self) -> usize {
        self.cache.sweep_expired(self.config.idle_ttl())
    }

    /// Start the background sweep on the current tokio runtime.
    ///
    /// The task holds only a weak reference and ends once the runtime is
    /// dropped; abort the handle to stop it earlier.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let runtime: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval();
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                let Some(runtime) = runtime.upgrade() else {
                    tracing::debug!("Script runtime dropped, sweeper exiting");
                    break;
                };
                let removed = runtime.sweep_expired();
                if removed > 0 {
                    tracing::info!(removed, "Evicted idle script instances");
                }
            }
        })
    }
}
