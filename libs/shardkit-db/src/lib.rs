#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! `ShardKit` storage abstraction crate.
//!
//! This crate keeps a registry of independently configured storage backends
//! keyed by alias, routes logical entity types to those aliases, and runs
//! unit-of-work scoped operations and paged queries against exactly one backend.
//!
//! # Building blocks
//! - [`BackendRegistry`]: process-wide set of [`BackendHandle`]s, built once by a
//!   pluggable [`RegistryInitializer`].
//! - [`AliasRouter`]: maps an entity type plus runtime keys to an alias; rules are
//!   hot-reloadable and swapped atomically.
//! - [`UnitOfWork`]: binds one operation scope to one backend session and owns the
//!   local transaction.
//! - [`Repository`]: typed CRUD plus the two-phase count + page query protocol.
//!
//! The storage engine itself sits behind the [`driver`] traits. The bundled
//! [`MemoryDriver`] is a complete in-process backend used for tests and local runs.
//!
//! # Example
//! ```rust
//! use shardkit_db::{
//!     BackendConfig, BackendRegistry, Expr, Repository, StaticRegistryInitializer, UnitOfWork,
//! };
//! use std::sync::Arc;
//!
//! #[derive(serde::Serialize, serde::Deserialize)]
//! struct Order {
//!     id: i64,
//!     status: String,
//! }
//!
//! impl shardkit_db::Entity for Order {
//!     const ENTITY_TYPE: &'static str = "order";
//!     type Key = i64;
//! }
//!
//! # fn main() -> shardkit_db::Result<()> {
//! let settings = serde_json::json!({ "entities": { "order": { "id": "id" } } });
//! let registry = BackendRegistry::new(Arc::new(StaticRegistryInitializer::new(vec![
//!     BackendConfig::memory("main").with_settings(settings),
//! ])));
//! registry.initialize()?;
//!
//! let uow = UnitOfWork::open(&registry, Some("main"))?;
//! let orders = Repository::<Order>::new(&uow);
//! orders.insert(&Order { id: 1, status: "open".to_owned() })?;
//! uow.commit()?;
//!
//! let page = orders.find_page(Some(Expr::eq("status", "open")), &[], 10, 1)?;
//! assert_eq!(page.total_count, 1);
//! # Ok(())
//! # }
//! ```

pub mod alias;
pub mod backend;
pub mod config;
pub mod driver;
pub mod hub;
pub mod paging;
pub mod query;
pub mod registry;
pub mod repository;
pub mod routing;
pub mod uow;

pub use alias::normalize_alias;
pub use backend::BackendHandle;
pub use config::{BackendConfig, RegistryConfig, RouteConfig, RouterConfig, load_config};
pub use driver::memory::MemoryDriver;
pub use driver::{Driver, DriverCatalog, DriverFactory, DriverSession, IsolationLevel};
pub use hub::ServiceHub;
pub use paging::{Page, PageRequest};
pub use query::{CompareOperator, Expr, OrderKey, Projection, Query, QueryResult, SortDir};
pub use registry::{
    BackendRegistry, FileRegistryInitializer, RegistryInitializer, StaticRegistryInitializer,
};
pub use repository::{Entity, Repository};
pub use routing::router::{AliasRouter, RouterInitializer, RoutingRule, RuleSet};
pub use routing::watch::RouterWatcher;
pub use routing::{RouteKey, RoutingStrategy, StrategyCatalog};
pub use uow::{AmbientTransaction, ScopedAmbient, TxState, UnitOfWork, UowOptions};

use thiserror::Error;

/// Library-local result type.
pub type Result<T> = std::result::Result<T, DbError>;

/// Broad failure category of a [`DbError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad or empty configuration, rejected at load time.
    Configuration,
    /// A requested alias, route or mapping does not exist.
    Lookup,
    /// The operation is not allowed in the current state.
    State,
    /// A query could not be built.
    Query,
    /// Failure reported by the storage driver, passed through untouched.
    Backend,
}

/// Typed error for the registry, router, unit of work and repositories.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Invalid alias: {0:?}")]
    InvalidAlias(String),

    #[error("Registry initializer returned no backends")]
    EmptyRegistry,

    #[error("Duplicate backend alias '{0}'")]
    DuplicateAlias(String),

    #[error("Unknown driver '{driver}' for backend '{alias}'")]
    UnknownDriver { alias: String, driver: String },

    #[error("Invalid routing rule #{index}: {reason}")]
    InvalidRoute { index: usize, reason: String },

    #[error("Duplicate routing rule for entity type '{0}'")]
    DuplicateRoute(String),

    #[error("Invalid settings for routing strategy '{strategy}': {reason}")]
    InvalidStrategy { strategy: String, reason: String },

    #[error("Configuration file not found: {0}")]
    ConfigMissing(String),

    #[error("Failed to load configuration: {0}")]
    ConfigLoad(#[from] Box<figment::Error>),

    #[error("Failed to watch configuration: {0}")]
    Watch(#[from] notify::Error),

    #[error("Backend alias '{0}' not found")]
    AliasNotFound(String),

    #[error("No routing rule for entity type '{0}'")]
    RouteNotFound(String),

    #[error("Routing strategy for '{0}' returned a blank alias")]
    BlankAlias(String),

    #[error("Routing strategy '{strategy}' cannot route keys: {reason}")]
    UnroutableKey { strategy: String, reason: String },

    #[error("Entity type '{0}' has no identifier property")]
    MissingIdentifier(String),

    #[error("{0} is not initialized")]
    NotInitialized(&'static str),

    #[error("Storage '{0}' is read-only")]
    ReadOnlyStorage(String),

    #[error("Unit of work for '{0}' is already disposed")]
    Disposed(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Unexpected multi-query result: {0}")]
    BatchShape(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl DbError {
    /// Category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            DbError::InvalidAlias(_)
            | DbError::EmptyRegistry
            | DbError::DuplicateAlias(_)
            | DbError::UnknownDriver { .. }
            | DbError::InvalidRoute { .. }
            | DbError::DuplicateRoute(_)
            | DbError::InvalidStrategy { .. }
            | DbError::ConfigMissing(_)
            | DbError::ConfigLoad(_)
            | DbError::Watch(_) => ErrorKind::Configuration,
            DbError::AliasNotFound(_)
            | DbError::RouteNotFound(_)
            | DbError::BlankAlias(_)
            | DbError::UnroutableKey { .. }
            | DbError::MissingIdentifier(_) => ErrorKind::Lookup,
            DbError::NotInitialized(_) | DbError::ReadOnlyStorage(_) | DbError::Disposed(_) => {
                ErrorKind::State
            }
            DbError::InvalidQuery(_) | DbError::Serialization(_) => ErrorKind::Query,
            DbError::BatchShape(_) | DbError::Backend(_) => ErrorKind::Backend,
        }
    }
}

impl From<figment::Error> for DbError {
    fn from(e: figment::Error) -> Self {
        DbError::ConfigLoad(Box::new(e))
    }
}
