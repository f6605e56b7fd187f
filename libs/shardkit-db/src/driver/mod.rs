//! Storage driver contract.
//!
//! The registry never talks to a storage engine directly. Each backend names a
//! driver identifier; the [`DriverCatalog`] maps that identifier to a
//! [`DriverFactory`] which builds the long-lived [`Driver`] from the backend's
//! configuration. Every unit of work then opens its own [`DriverSession`].
//!
//! Driver errors are plain `anyhow::Error`s and reach callers untouched as
//! `DbError::Backend`.

pub mod memory;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::config::BackendConfig;
use crate::query::{Expr, Query, QueryResult};

/// Result type for driver calls.
pub type DriverResult<T> = anyhow::Result<T>;

/// Transaction isolation level.
///
/// Drivers that support fewer levels map to the nearest stronger one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Allows dirty reads. Not recommended for most use cases.
    ReadUncommitted,
    /// Prevents dirty reads. This is the default for most databases.
    #[default]
    ReadCommitted,
    /// Prevents dirty reads and non-repeatable reads.
    RepeatableRead,
    /// Full serialization of transactions. Highest isolation level.
    Serializable,
}

/// Long-lived, shareable driver built once per backend.
pub trait Driver: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Open a new independent session.
    ///
    /// # Errors
    /// Returns an error if the backend cannot hand out a session.
    fn open_session(&self) -> DriverResult<Box<dyn DriverSession>>;
}

/// Builds a [`Driver`] from a backend configuration.
pub trait DriverFactory: Send + Sync {
    /// # Errors
    /// Returns an error if the settings are invalid or the backend is unreachable.
    fn build(&self, config: &BackendConfig) -> DriverResult<Arc<dyn Driver>>;
}

impl<F> DriverFactory for F
where
    F: Fn(&BackendConfig) -> DriverResult<Arc<dyn Driver>> + Send + Sync,
{
    fn build(&self, config: &BackendConfig) -> DriverResult<Arc<dyn Driver>> {
        self(config)
    }
}

/// One open session. Owned by exactly one unit of work; never shared across threads.
///
/// Rows are JSON objects keyed by field name.
pub trait DriverSession: Send {
    /// # Errors
    /// Backend failure.
    fn begin(&mut self, isolation: Option<IsolationLevel>) -> DriverResult<()>;

    /// # Errors
    /// Backend failure, including constraint violations detected at commit.
    fn commit(&mut self) -> DriverResult<()>;

    /// # Errors
    /// Backend failure.
    fn rollback(&mut self) -> DriverResult<()>;

    fn is_transaction_active(&self) -> bool;

    /// Insert a new row.
    ///
    /// # Errors
    /// Backend failure.
    fn save(&mut self, entity_type: &str, row: Value) -> DriverResult<()>;

    /// Replace an existing row.
    ///
    /// # Errors
    /// Backend failure.
    fn update(&mut self, entity_type: &str, row: Value) -> DriverResult<()>;

    /// Insert or replace, depending on whether the identifier exists.
    ///
    /// # Errors
    /// Backend failure.
    fn save_or_update(&mut self, entity_type: &str, row: Value) -> DriverResult<()>;

    /// Remove the row with the same identifier as `row`.
    ///
    /// # Errors
    /// Backend failure.
    fn delete(&mut self, entity_type: &str, row: Value) -> DriverResult<()>;

    /// Bulk delete by query; `None` deletes every row of the type.
    /// Returns the number of rows scheduled for deletion.
    ///
    /// # Errors
    /// Backend failure.
    fn delete_where(&mut self, entity_type: &str, filter: Option<&Expr>) -> DriverResult<u64>;

    /// Name of the identifier property of `entity_type`, if it has one.
    fn identifier_property(&self, entity_type: &str) -> Option<String>;

    /// Run all queries in one round trip and return their results in order.
    ///
    /// # Errors
    /// Backend failure.
    fn execute_batch(&mut self, queries: &[Query]) -> DriverResult<Vec<QueryResult>>;

    /// Push pending writes to the backend.
    ///
    /// # Errors
    /// Backend failure.
    fn flush(&mut self) -> DriverResult<()>;

    /// Release the session. Called at most once.
    ///
    /// # Errors
    /// Backend failure.
    fn close(&mut self) -> DriverResult<()>;
}

/// Capability table mapping driver identifiers to factories.
#[derive(Clone, Default)]
pub struct DriverCatalog {
    factories: HashMap<String, Arc<dyn DriverFactory>>,
}

impl DriverCatalog {
    /// Empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with the bundled drivers (`memory`).
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut catalog = Self::new();
        catalog.register(memory::MEMORY_DRIVER, Arc::new(memory::MemoryDriverFactory));
        catalog
    }

    /// Register or replace a factory. Identifiers are case-insensitive.
    pub fn register(&mut self, id: &str, factory: Arc<dyn DriverFactory>) {
        self.factories.insert(id.trim().to_lowercase(), factory);
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<dyn DriverFactory>> {
        self.factories.get(&id.trim().to_lowercase()).cloned()
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(&id.trim().to_lowercase())
    }
}

impl fmt::Debug for DriverCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.factories.keys().collect();
        ids.sort();
        f.debug_struct("DriverCatalog").field("drivers", &ids).finish()
    }
}
