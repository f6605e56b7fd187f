//! A single configured backend.

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::Result;
use crate::alias::validate_alias;
use crate::config::BackendConfig;
use crate::driver::{Driver, DriverFactory, DriverSession};

/// Alias, configuration, read-only flag and the lazily built driver of one backend.
///
/// The driver is built on first use and then shared by every session opened
/// against this alias for the rest of the process lifetime.
pub struct BackendHandle {
    alias: String,
    config: BackendConfig,
    read_only: bool,
    factory: Arc<dyn DriverFactory>,
    driver: OnceLock<Arc<dyn Driver>>,
    build_lock: Mutex<()>,
}

impl std::fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendHandle")
            .field("alias", &self.alias)
            .field("driver", &self.config.driver)
            .field("read_only", &self.read_only)
            .field("built", &self.driver.get().is_some())
            .finish_non_exhaustive()
    }
}

impl BackendHandle {
    /// # Errors
    /// Returns `DbError::InvalidAlias` if the configured alias is blank.
    pub fn new(config: BackendConfig, factory: Arc<dyn DriverFactory>) -> Result<Self> {
        let alias = validate_alias(&config.alias)?;
        Ok(Self {
            alias,
            read_only: config.read_only,
            config,
            factory,
            driver: OnceLock::new(),
            build_lock: Mutex::new(()),
        })
    }

    /// Normalized alias.
    #[must_use]
    pub fn alias(&self) -> &str {
        &self.alias
    }

    #[must_use]
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Driver of this backend, building it on first call.
    ///
    /// # Errors
    /// Returns `DbError::Backend` if the factory fails; a later call retries.
    pub fn driver(&self) -> Result<Arc<dyn Driver>> {
        if let Some(driver) = self.driver.get() {
            return Ok(Arc::clone(driver));
        }

        let _guard = self.build_lock.lock();
        if let Some(driver) = self.driver.get() {
            return Ok(Arc::clone(driver));
        }

        let driver = self.factory.build(&self.config)?;
        tracing::info!(alias = %self.alias, driver = driver.name(), "backend driver built");
        Ok(Arc::clone(self.driver.get_or_init(|| driver)))
    }

    /// Open a new independent session. Sessions are never pooled here.
    ///
    /// # Errors
    /// Returns `DbError::Backend` if the driver cannot be built or refuses a session.
    pub fn open_session(&self) -> Result<Box<dyn DriverSession>> {
        let session = self.driver()?.open_session()?;
        tracing::debug!(alias = %self.alias, "session opened");
        Ok(session)
    }
}
