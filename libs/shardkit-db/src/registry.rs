//! Process-wide registry of backends keyed by alias.
//!
//! The registry is an explicitly constructed object: the application builds one
//! at startup (normally exactly one per process) and shares it as an `Arc`.
//! Tests build fresh instances.
//!
//! The backend set is produced once by a pluggable [`RegistryInitializer`].
//! Initialization is double-checked under a mutex; afterwards the set is an
//! immutable map and lookups take no lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::alias::normalize_alias;
use crate::backend::BackendHandle;
use crate::config::{BackendConfig, RegistryConfig, load_config};
use crate::driver::{DriverCatalog, DriverSession};
use crate::hub::ServiceHub;
use crate::{DbError, Result};

/// Produces the backend configurations of a registry.
pub trait RegistryInitializer: Send + Sync {
    /// # Errors
    /// Returns an error if the configuration cannot be obtained.
    fn backends(&self) -> Result<Vec<BackendConfig>>;
}

/// Reads backends from a single YAML or JSON file. This is the default initializer.
#[derive(Debug, Clone)]
pub struct FileRegistryInitializer {
    path: PathBuf,
}

impl FileRegistryInitializer {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RegistryInitializer for FileRegistryInitializer {
    fn backends(&self) -> Result<Vec<BackendConfig>> {
        let cfg: RegistryConfig = load_config(&self.path)?;
        Ok(cfg.backends)
    }
}

/// Fixed, in-code list of backends.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistryInitializer {
    backends: Vec<BackendConfig>,
}

impl StaticRegistryInitializer {
    #[must_use]
    pub fn new(backends: Vec<BackendConfig>) -> Self {
        Self { backends }
    }
}

impl RegistryInitializer for StaticRegistryInitializer {
    fn backends(&self) -> Result<Vec<BackendConfig>> {
        Ok(self.backends.clone())
    }
}

type HandleMap = HashMap<String, Arc<BackendHandle>>;

/// Thread-safe set of [`BackendHandle`]s keyed by normalized alias.
pub struct BackendRegistry {
    initializer: Arc<dyn RegistryInitializer>,
    drivers: DriverCatalog,
    handles: OnceLock<HandleMap>,
    init_lock: Mutex<()>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("initialized", &self.is_initialized())
            .field("backends", &self.handles.get().map(HashMap::len))
            .finish_non_exhaustive()
    }
}

impl BackendRegistry {
    /// Registry using the bundled drivers.
    #[must_use]
    pub fn new(initializer: Arc<dyn RegistryInitializer>) -> Self {
        Self::with_drivers(initializer, DriverCatalog::with_defaults())
    }

    #[must_use]
    pub fn with_drivers(initializer: Arc<dyn RegistryInitializer>, drivers: DriverCatalog) -> Self {
        Self {
            initializer,
            drivers,
            handles: OnceLock::new(),
            init_lock: Mutex::new(()),
        }
    }

    /// Registry whose initializer is resolved from `hub`, falling back to `default`.
    #[must_use]
    pub fn from_hub(
        hub: &ServiceHub,
        default: Arc<dyn RegistryInitializer>,
        drivers: DriverCatalog,
    ) -> Self {
        let initializer = hub.get::<dyn RegistryInitializer>().unwrap_or_else(|| {
            tracing::debug!("no registry initializer registered, using default");
            default
        });
        Self::with_drivers(initializer, drivers)
    }

    /// Build the backend set. Subsequent calls are no-ops.
    ///
    /// # Errors
    /// - `DbError::EmptyRegistry` if the initializer yields no backends
    /// - `DbError::InvalidAlias` / `DbError::DuplicateAlias` for bad aliases
    /// - `DbError::UnknownDriver` if a backend names an unregistered driver
    /// - any error returned by the initializer
    pub fn initialize(&self) -> Result<()> {
        if self.handles.get().is_some() {
            return Ok(());
        }

        let _guard = self.init_lock.lock();
        if self.handles.get().is_some() {
            return Ok(());
        }

        let configs = self.initializer.backends()?;
        if configs.is_empty() {
            return Err(DbError::EmptyRegistry);
        }

        let mut map = HandleMap::with_capacity(configs.len());
        for config in configs {
            let factory = self
                .drivers
                .get(&config.driver)
                .ok_or_else(|| DbError::UnknownDriver {
                    alias: config.alias.clone(),
                    driver: config.driver.clone(),
                })?;
            let handle = BackendHandle::new(config, factory)?;
            let alias = handle.alias().to_owned();
            if map.insert(alias.clone(), Arc::new(handle)).is_some() {
                return Err(DbError::DuplicateAlias(alias));
            }
        }

        tracing::info!(backends = map.len(), "backend registry initialized");
        // Unset here: the init lock is held and was re-checked above.
        self.handles.get_or_init(|| map);
        Ok(())
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.handles.get().is_some()
    }

    fn map(&self) -> Result<&HandleMap> {
        self.handles
            .get()
            .ok_or(DbError::NotInitialized("backend registry"))
    }

    /// Handle for `alias` (trimmed, case-insensitive).
    ///
    /// # Errors
    /// `DbError::NotInitialized` before [`initialize`](Self::initialize),
    /// `DbError::AliasNotFound` for an unknown alias.
    pub fn get_handle(&self, alias: &str) -> Result<Arc<BackendHandle>> {
        let map = self.map()?;
        let key = normalize_alias(alias);
        map.get(&key)
            .cloned()
            .ok_or(DbError::AliasNotFound(key))
    }

    /// Handles for `aliases`, in the same order. An empty slice returns every handle.
    ///
    /// # Errors
    /// Same as [`get_handle`](Self::get_handle) for any alias in the list.
    pub fn get_handles<S: AsRef<str>>(&self, aliases: &[S]) -> Result<Vec<Arc<BackendHandle>>> {
        let map = self.map()?;
        if aliases.is_empty() {
            return Ok(map.values().cloned().collect());
        }
        aliases.iter().map(|a| self.get_handle(a.as_ref())).collect()
    }

    /// Some handle of the registry, used as the default backend.
    ///
    /// Which handle is returned is unspecified and may differ between processes.
    /// Callers that need a stable default must pass an explicit alias.
    ///
    /// # Errors
    /// `DbError::NotInitialized` before [`initialize`](Self::initialize).
    pub fn get_first_handle(&self) -> Result<Arc<BackendHandle>> {
        self.map()?
            .values()
            .next()
            .cloned()
            .ok_or(DbError::EmptyRegistry)
    }

    /// Open a new, independent driver session on `alias`.
    ///
    /// # Errors
    /// Lookup errors as in [`get_handle`](Self::get_handle), or `DbError::Backend`.
    pub fn open_session(&self, alias: &str) -> Result<Box<dyn DriverSession>> {
        self.get_handle(alias)?.open_session()
    }

    /// All aliases, sorted.
    ///
    /// # Errors
    /// `DbError::NotInitialized` before [`initialize`](Self::initialize).
    pub fn aliases(&self) -> Result<Vec<String>> {
        let mut aliases: Vec<_> = self.map()?.keys().cloned().collect();
        aliases.sort();
        Ok(aliases)
    }

    /// Number of backends; zero before initialization.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.get().map_or(0, HashMap::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
        backends: Vec<BackendConfig>,
    }

    impl RegistryInitializer for Counting {
        fn backends(&self) -> Result<Vec<BackendConfig>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(5));
            Ok(self.backends.clone())
        }
    }

    fn registry(backends: Vec<BackendConfig>) -> BackendRegistry {
        BackendRegistry::new(Arc::new(StaticRegistryInitializer::new(backends)))
    }

    #[test]
    fn lookups_before_initialize_fail() {
        let r = registry(vec![BackendConfig::memory("a")]);
        assert!(matches!(r.get_handle("a"), Err(DbError::NotInitialized(_))));
        assert!(matches!(r.get_first_handle(), Err(DbError::NotInitialized(_))));
        assert!(matches!(
            r.get_handles::<&str>(&[]),
            Err(DbError::NotInitialized(_))
        ));
        assert!(r.is_empty());
    }

    #[test]
    fn concurrent_initialize_runs_initializer_once() {
        let init = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            backends: vec![BackendConfig::memory("a"), BackendConfig::memory("b")],
        });
        let r = Arc::new(BackendRegistry::new(init.clone()));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let r = Arc::clone(&r);
                std::thread::spawn(move || r.initialize())
            })
            .collect();
        for t in threads {
            t.join().unwrap().unwrap();
        }

        assert_eq!(init.calls.load(Ordering::SeqCst), 1);
        assert_eq!(r.len(), 2);
    }

    #[test]
    fn empty_initializer_is_a_configuration_error() {
        let r = registry(Vec::new());
        assert!(matches!(r.initialize(), Err(DbError::EmptyRegistry)));
        assert!(!r.is_initialized());
    }

    #[test]
    fn duplicate_normalized_alias_is_rejected() {
        let r = registry(vec![BackendConfig::memory("Main"), BackendConfig::memory(" main ")]);
        match r.initialize() {
            Err(DbError::DuplicateAlias(a)) => assert_eq!(a, "main"),
            other => panic!("expected DuplicateAlias, got {other:?}"),
        }
        assert!(!r.is_initialized());
    }

    #[test]
    fn unknown_driver_is_rejected() {
        let r = registry(vec![BackendConfig::new("a", "oracle")]);
        assert!(matches!(r.initialize(), Err(DbError::UnknownDriver { .. })));
    }

    #[test]
    fn lookup_is_normalized_and_reports_alias() {
        let r = registry(vec![BackendConfig::memory("Orders")]);
        r.initialize().unwrap();

        assert_eq!(r.get_handle("  ORDERS ").unwrap().alias(), "orders");
        let err = r.get_handle("Missing").unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn get_handles_semantics() {
        let r = registry(vec![
            BackendConfig::memory("a"),
            BackendConfig::memory("b").read_only(true),
        ]);
        r.initialize().unwrap();

        assert_eq!(r.get_handles::<&str>(&[]).unwrap().len(), 2);
        let picked = r.get_handles(&["B"]).unwrap();
        assert_eq!(picked.len(), 1);
        assert!(picked[0].is_read_only());
        assert!(matches!(
            r.get_handles(&["a", "c"]),
            Err(DbError::AliasNotFound(_))
        ));
        assert_eq!(r.aliases().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn first_handle_is_a_member() {
        let r = registry(vec![BackendConfig::memory("a"), BackendConfig::memory("b")]);
        r.initialize().unwrap();
        let first = r.get_first_handle().unwrap();
        assert!(["a", "b"].contains(&first.alias()));
    }

    #[test]
    fn sessions_are_independent() {
        let r = registry(vec![BackendConfig::memory("a")]);
        r.initialize().unwrap();
        let mut s1 = r.open_session("a").unwrap();
        let s2 = r.open_session("a").unwrap();
        s1.begin(None).unwrap();
        assert!(s1.is_transaction_active());
        assert!(!s2.is_transaction_active());
    }

    #[test]
    fn hub_initializer_takes_precedence() {
        let hub = ServiceHub::new();
        hub.register::<dyn RegistryInitializer>(Arc::new(StaticRegistryInitializer::new(vec![
            BackendConfig::memory("from_hub"),
        ])));
        let fallback = Arc::new(StaticRegistryInitializer::new(vec![BackendConfig::memory(
            "fallback",
        )]));

        let r = BackendRegistry::from_hub(&hub, fallback.clone(), DriverCatalog::with_defaults());
        r.initialize().unwrap();
        assert!(r.get_handle("from_hub").is_ok());

        let r =
            BackendRegistry::from_hub(&ServiceHub::new(), fallback, DriverCatalog::with_defaults());
        r.initialize().unwrap();
        assert!(r.get_handle("fallback").is_ok());
    }
}
