//! The alias router and its rule set.
//!
//! The active [`RuleSet`] is immutable and replaced wholesale on every install.
//! Readers take a snapshot (`ArcSwap::load_full`) and finish against it even if a
//! reload swaps in a new set meanwhile; installs are serialized by a mutex.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use super::{RouteKey, RoutingStrategy, StrategyCatalog};
use crate::alias::normalize_alias;
use crate::config::{RouterConfig, load_config};
use crate::hub::ServiceHub;
use crate::repository::Entity;
use crate::{DbError, Result};

/// Supplies routing configuration instead of the router's own file.
pub trait RouterInitializer: Send + Sync {
    /// # Errors
    /// Returns an error if the configuration cannot be obtained.
    fn routes(&self) -> Result<RouterConfig>;
}

/// Binds one entity type to a routing strategy.
#[derive(Clone)]
pub struct RoutingRule {
    entity_type: String,
    strategy_id: String,
    strategy: Arc<dyn RoutingStrategy>,
}

impl std::fmt::Debug for RoutingRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingRule")
            .field("entity_type", &self.entity_type)
            .field("strategy", &self.strategy_id)
            .finish_non_exhaustive()
    }
}

impl RoutingRule {
    #[must_use]
    pub fn new(
        entity_type: impl Into<String>,
        strategy_id: impl Into<String>,
        strategy: Arc<dyn RoutingStrategy>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            strategy_id: strategy_id.into(),
            strategy,
        }
    }

    #[must_use]
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    #[must_use]
    pub fn strategy_id(&self) -> &str {
        &self.strategy_id
    }

    /// Normalized alias for `keys`.
    ///
    /// # Errors
    /// `DbError::BlankAlias` if the strategy returns a blank alias, or the strategy's own error.
    pub fn alias(&self, keys: &[RouteKey]) -> Result<String> {
        let alias = normalize_alias(&self.strategy.alias(keys)?);
        if alias.is_empty() {
            return Err(DbError::BlankAlias(self.entity_type.clone()));
        }
        Ok(alias)
    }

    /// Every normalized alias of the strategy.
    ///
    /// # Errors
    /// `DbError::BlankAlias` if any entry is blank, or the strategy's own error.
    pub fn aliases(&self) -> Result<Vec<String>> {
        self.strategy
            .aliases()?
            .iter()
            .map(|a| {
                let alias = normalize_alias(a);
                if alias.is_empty() {
                    Err(DbError::BlankAlias(self.entity_type.clone()))
                } else {
                    Ok(alias)
                }
            })
            .collect()
    }
}

/// Immutable set of rules, at most one per entity type.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: HashMap<String, RoutingRule>,
}

impl RuleSet {
    /// Build a complete rule set from parsed configuration.
    ///
    /// The whole set is rejected on the first bad entry; nothing partial is returned.
    ///
    /// # Errors
    /// - `DbError::InvalidRoute` for a blank entity type or strategy identifier,
    ///   or a strategy that cannot be built
    /// - `DbError::DuplicateRoute` if an entity type appears twice
    pub fn build(config: &RouterConfig, catalog: &StrategyCatalog) -> Result<Self> {
        let mut rules = HashMap::with_capacity(config.routes.len());
        for (index, route) in config.routes.iter().enumerate() {
            let entity_type = route.entity_type.trim();
            if entity_type.is_empty() {
                return Err(DbError::InvalidRoute {
                    index,
                    reason: "blank entity type".to_owned(),
                });
            }
            let strategy_id = route.strategy.trim();
            if strategy_id.is_empty() {
                return Err(DbError::InvalidRoute {
                    index,
                    reason: format!("blank strategy for '{entity_type}'"),
                });
            }
            if rules.contains_key(entity_type) {
                return Err(DbError::DuplicateRoute(entity_type.to_owned()));
            }
            let strategy = catalog
                .build(strategy_id, &route.settings)
                .map_err(|e| DbError::InvalidRoute {
                    index,
                    reason: format!("'{entity_type}': {e}"),
                })?;
            rules.insert(
                entity_type.to_owned(),
                RoutingRule::new(entity_type, strategy_id, strategy),
            );
        }
        Ok(Self { rules })
    }

    #[must_use]
    pub fn get(&self, entity_type: &str) -> Option<&RoutingRule> {
        self.rules.get(entity_type.trim())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Entity types with a rule, sorted.
    #[must_use]
    pub fn entity_types(&self) -> Vec<&str> {
        let mut types: Vec<_> = self.rules.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

/// Resolves entity types and runtime keys to backend aliases.
pub struct AliasRouter {
    catalog: StrategyCatalog,
    rules: ArcSwap<RuleSet>,
    config_path: Mutex<Option<PathBuf>>,
    install_lock: Mutex<()>,
    generation: AtomicU64,
}

impl std::fmt::Debug for AliasRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AliasRouter")
            .field("rules", &self.rules.load().len())
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

impl AliasRouter {
    /// Router with no rules.
    #[must_use]
    pub fn new(catalog: StrategyCatalog) -> Self {
        Self {
            catalog,
            rules: ArcSwap::from_pointee(RuleSet::default()),
            config_path: Mutex::new(None),
            install_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Router loaded from the initializer registered in `hub`, or from
    /// `default_path` when none is registered.
    ///
    /// # Errors
    /// Same as [`install`](Self::install) / [`initialize`](Self::initialize).
    pub fn from_hub(
        hub: &ServiceHub,
        catalog: StrategyCatalog,
        default_path: &Path,
    ) -> Result<Self> {
        let router = Self::new(catalog);
        if let Some(init) = hub.get::<dyn RouterInitializer>() {
            router.install(&init.routes()?)?;
        } else {
            router.initialize(default_path)?;
        }
        Ok(router)
    }

    /// Load rules from `path` and make them active. A missing file yields zero rules.
    ///
    /// On success the path is remembered for [`reload`](Self::reload).
    ///
    /// # Errors
    /// Parse errors and rule validation errors; the active rules and the
    /// remembered path stay unchanged.
    pub fn initialize(&self, path: &Path) -> Result<()> {
        let _guard = self.install_lock.lock();
        self.load_and_store(path)?;
        *self.config_path.lock() = Some(path.to_path_buf());
        Ok(())
    }

    /// Re-run [`initialize`](Self::initialize) on the remembered path.
    ///
    /// # Errors
    /// `DbError::NotInitialized` if the router was never initialized from a file.
    pub fn reload(&self) -> Result<()> {
        let _guard = self.install_lock.lock();
        let path = self
            .config_path
            .lock()
            .clone()
            .ok_or(DbError::NotInitialized("alias router config path"))?;
        self.load_and_store(&path)
    }

    /// Build a rule set from parsed configuration and swap it in.
    ///
    /// # Errors
    /// Rule validation errors from [`RuleSet::build`]; nothing is installed then.
    pub fn install(&self, config: &RouterConfig) -> Result<()> {
        let _guard = self.install_lock.lock();
        self.store(config)
    }

    // Callers hold `install_lock` so a slower reader of an older file can
    // never swap its rules in after a newer set.
    fn load_and_store(&self, path: &Path) -> Result<()> {
        let config = match load_config::<RouterConfig>(path) {
            Ok(cfg) => cfg,
            Err(DbError::ConfigMissing(p)) => {
                tracing::warn!(path = %p, "routing config not found, starting with no rules");
                RouterConfig::default()
            }
            Err(e) => return Err(e),
        };
        self.store(&config)
    }

    fn store(&self, config: &RouterConfig) -> Result<()> {
        let set = RuleSet::build(config, &self.catalog)?;
        let count = set.len();
        self.rules.store(Arc::new(set));
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(rules = count, generation, "routing rules installed");
        Ok(())
    }

    /// Snapshot of the active rules.
    #[must_use]
    pub fn rules(&self) -> Arc<RuleSet> {
        self.rules.load_full()
    }

    /// Number of successful installs so far.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn config_path(&self) -> Option<PathBuf> {
        self.config_path.lock().clone()
    }

    /// Alias for `entity_type` and `keys`, normalized.
    ///
    /// # Errors
    /// `DbError::RouteNotFound`, `DbError::BlankAlias`, or the strategy's error.
    pub fn get_alias(&self, entity_type: &str, keys: &[RouteKey]) -> Result<String> {
        let rules = self.rules.load();
        let rule = rules
            .get(entity_type)
            .ok_or_else(|| DbError::RouteNotFound(entity_type.to_owned()))?;
        let alias = rule.alias(keys)?;
        tracing::trace!(entity_type, alias = %alias, "alias routed");
        Ok(alias)
    }

    /// Every alias `entity_type` can be routed to, normalized.
    ///
    /// # Errors
    /// `DbError::RouteNotFound`, `DbError::BlankAlias`, or the strategy's error.
    pub fn get_aliases(&self, entity_type: &str) -> Result<Vec<String>> {
        let rules = self.rules.load();
        rules
            .get(entity_type)
            .ok_or_else(|| DbError::RouteNotFound(entity_type.to_owned()))?
            .aliases()
    }

    /// [`get_alias`](Self::get_alias) for an entity's type.
    ///
    /// # Errors
    /// Same as [`get_alias`](Self::get_alias).
    pub fn alias_for<E: Entity>(&self, keys: &[RouteKey]) -> Result<String> {
        self.get_alias(E::ENTITY_TYPE, keys)
    }

    /// [`get_aliases`](Self::get_aliases) for an entity's type.
    ///
    /// # Errors
    /// Same as [`get_aliases`](Self::get_aliases).
    pub fn aliases_for<E: Entity>(&self) -> Result<Vec<String>> {
        self.get_aliases(E::ENTITY_TYPE)
    }
}
