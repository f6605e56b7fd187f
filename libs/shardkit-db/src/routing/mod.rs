//! Entity-type to backend-alias routing.
//!
//! A routing rule binds an entity type to a [`RoutingStrategy`]. Strategies are
//! named in configuration and built through a [`StrategyCatalog`], a table of
//! constructor functions keyed by identifier.
//!
//! Bundled strategies:
//! - `constant`: `{ alias: a }` or `{ aliases: [a, b] }`; always routes to the first alias.
//! - `hash`: `{ aliases: [s0, s1, ...] }`; xxh3 of the key values picks the alias.
//! - `modulo`: `{ aliases: [s0, s1, ...] }`; first integer key modulo the alias count.

pub mod router;
pub mod watch;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use uuid::Uuid;
use xxhash_rust::xxh3::Xxh3;

use crate::{DbError, Result};

/// Runtime key value used to pick a shard.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RouteKey {
    Int(i64),
    Uint(u64),
    Str(String),
    Uuid(Uuid),
}

impl RouteKey {
    /// Integer view of the key, if it has one.
    #[must_use]
    pub fn as_i128(&self) -> Option<i128> {
        match self {
            RouteKey::Int(v) => Some(i128::from(*v)),
            RouteKey::Uint(v) => Some(i128::from(*v)),
            RouteKey::Str(_) | RouteKey::Uuid(_) => None,
        }
    }

    fn hash_into(&self, hasher: &mut Xxh3) {
        // Tag byte keeps 1 and Str("1") apart. Integers share one widened
        // form so Int(k) and Uint(k) land on the same shard.
        match self {
            RouteKey::Int(v) => {
                hasher.update(b"n");
                hasher.update(&i128::from(*v).to_le_bytes());
            }
            RouteKey::Uint(v) => {
                hasher.update(b"n");
                hasher.update(&i128::from(*v).to_le_bytes());
            }
            RouteKey::Str(s) => {
                hasher.update(b"s");
                hasher.update(s.as_bytes());
            }
            RouteKey::Uuid(u) => {
                hasher.update(b"g");
                hasher.update(u.as_bytes());
            }
        }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteKey::Int(v) => write!(f, "{v}"),
            RouteKey::Uint(v) => write!(f, "{v}"),
            RouteKey::Str(s) => f.write_str(s),
            RouteKey::Uuid(u) => write!(f, "{u}"),
        }
    }
}

impl From<i32> for RouteKey {
    fn from(v: i32) -> Self {
        RouteKey::Int(i64::from(v))
    }
}

impl From<i64> for RouteKey {
    fn from(v: i64) -> Self {
        RouteKey::Int(v)
    }
}

impl From<u32> for RouteKey {
    fn from(v: u32) -> Self {
        RouteKey::Uint(u64::from(v))
    }
}

impl From<u64> for RouteKey {
    fn from(v: u64) -> Self {
        RouteKey::Uint(v)
    }
}

impl From<&str> for RouteKey {
    fn from(v: &str) -> Self {
        RouteKey::Str(v.to_owned())
    }
}

impl From<String> for RouteKey {
    fn from(v: String) -> Self {
        RouteKey::Str(v)
    }
}

impl From<Uuid> for RouteKey {
    fn from(v: Uuid) -> Self {
        RouteKey::Uuid(v)
    }
}

/// Computes backend aliases for one entity type.
///
/// Returned aliases are normalized by the router; strategies may return them in any case.
pub trait RoutingStrategy: Send + Sync {
    /// Alias for the given key values.
    ///
    /// # Errors
    /// Returns an error if the keys cannot be routed.
    fn alias(&self, keys: &[RouteKey]) -> Result<String>;

    /// Every alias this strategy can route to.
    ///
    /// # Errors
    /// Returns an error if the strategy cannot enumerate its aliases.
    fn aliases(&self) -> Result<Vec<String>>;
}

/// Constructor of a strategy from its settings block.
pub type StrategyConstructor =
    Arc<dyn Fn(&serde_json::Value) -> Result<Arc<dyn RoutingStrategy>> + Send + Sync>;

/// Table of routing strategy constructors keyed by identifier.
#[derive(Clone, Default)]
pub struct StrategyCatalog {
    constructors: HashMap<String, StrategyConstructor>,
}

impl fmt::Debug for StrategyCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.constructors.keys().collect();
        ids.sort();
        f.debug_struct("StrategyCatalog").field("strategies", &ids).finish()
    }
}

impl StrategyCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with `constant`, `hash` and `modulo`.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut catalog = Self::new();
        catalog.register("constant", |s| {
            Ok(Arc::new(ConstantStrategy::from_settings(s)?) as Arc<dyn RoutingStrategy>)
        });
        catalog.register("hash", |s| {
            Ok(Arc::new(HashStrategy::from_settings(s)?) as Arc<dyn RoutingStrategy>)
        });
        catalog.register("modulo", |s| {
            Ok(Arc::new(ModuloStrategy::from_settings(s)?) as Arc<dyn RoutingStrategy>)
        });
        catalog
    }

    /// Register or replace a constructor. Identifiers are trimmed and case-insensitive.
    pub fn register<F>(&mut self, id: &str, constructor: F)
    where
        F: Fn(&serde_json::Value) -> Result<Arc<dyn RoutingStrategy>> + Send + Sync + 'static,
    {
        self.constructors
            .insert(id.trim().to_lowercase(), Arc::new(constructor));
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.constructors.contains_key(&id.trim().to_lowercase())
    }

    /// Build the strategy `id` from `settings`.
    ///
    /// # Errors
    /// `DbError::InvalidStrategy` if `id` is unknown or the constructor fails.
    pub fn build(
        &self,
        id: &str,
        settings: &serde_json::Value,
    ) -> Result<Arc<dyn RoutingStrategy>> {
        let key = id.trim().to_lowercase();
        let ctor = self
            .constructors
            .get(&key)
            .ok_or_else(|| DbError::InvalidStrategy {
                strategy: id.to_owned(),
                reason: "unknown strategy".to_owned(),
            })?;
        ctor(settings).map_err(|e| match e {
            e @ DbError::InvalidStrategy { .. } => e,
            other => DbError::InvalidStrategy {
                strategy: id.to_owned(),
                reason: other.to_string(),
            },
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct AliasListSettings {
    #[serde(default)]
    alias: Option<String>,
    #[serde(default)]
    aliases: Vec<String>,
}

fn alias_list(strategy: &str, settings: &serde_json::Value) -> Result<Vec<String>> {
    let parsed: AliasListSettings =
        serde_json::from_value(settings.clone()).map_err(|e| DbError::InvalidStrategy {
            strategy: strategy.to_owned(),
            reason: e.to_string(),
        })?;
    let list: Vec<String> = parsed.alias.into_iter().chain(parsed.aliases).collect();
    if list.is_empty() {
        return Err(DbError::InvalidStrategy {
            strategy: strategy.to_owned(),
            reason: "no aliases configured".to_owned(),
        });
    }
    Ok(list)
}

/// Routes every key to the same alias.
#[derive(Debug, Clone)]
pub struct ConstantStrategy {
    aliases: Vec<String>,
}

impl ConstantStrategy {
    /// # Errors
    /// `DbError::InvalidStrategy` if no alias is configured.
    pub fn from_settings(settings: &serde_json::Value) -> Result<Self> {
        Ok(Self {
            aliases: alias_list("constant", settings)?,
        })
    }

    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            aliases: vec![alias.into()],
        }
    }
}

impl RoutingStrategy for ConstantStrategy {
    fn alias(&self, _keys: &[RouteKey]) -> Result<String> {
        Ok(self.aliases[0].clone())
    }

    fn aliases(&self) -> Result<Vec<String>> {
        Ok(self.aliases.clone())
    }
}

/// Spreads keys over a fixed alias list by xxh3 hash of all key values.
#[derive(Debug, Clone)]
pub struct HashStrategy {
    aliases: Vec<String>,
}

impl HashStrategy {
    /// # Errors
    /// `DbError::InvalidStrategy` if no alias is configured.
    pub fn from_settings(settings: &serde_json::Value) -> Result<Self> {
        Ok(Self {
            aliases: alias_list("hash", settings)?,
        })
    }
}

impl RoutingStrategy for HashStrategy {
    fn alias(&self, keys: &[RouteKey]) -> Result<String> {
        if keys.is_empty() {
            return Err(DbError::UnroutableKey {
                strategy: "hash".to_owned(),
                reason: "no key values given".to_owned(),
            });
        }
        let mut hasher = Xxh3::new();
        for key in keys {
            key.hash_into(&mut hasher);
        }
        let n = self.aliases.len() as u64;
        let idx = usize::try_from(hasher.digest() % n).unwrap_or_default();
        Ok(self.aliases[idx].clone())
    }

    fn aliases(&self) -> Result<Vec<String>> {
        Ok(self.aliases.clone())
    }
}

/// Routes by the first key, which must be an integer, modulo the alias count.
#[derive(Debug, Clone)]
pub struct ModuloStrategy {
    aliases: Vec<String>,
}

impl ModuloStrategy {
    /// # Errors
    /// `DbError::InvalidStrategy` if no alias is configured.
    pub fn from_settings(settings: &serde_json::Value) -> Result<Self> {
        Ok(Self {
            aliases: alias_list("modulo", settings)?,
        })
    }
}

impl RoutingStrategy for ModuloStrategy {
    fn alias(&self, keys: &[RouteKey]) -> Result<String> {
        let value = keys
            .first()
            .and_then(RouteKey::as_i128)
            .ok_or_else(|| DbError::UnroutableKey {
                strategy: "modulo".to_owned(),
                reason: "first key must be an integer".to_owned(),
            })?;
        let n = i128::try_from(self.aliases.len()).unwrap_or(i128::MAX);
        let idx = usize::try_from(value.rem_euclid(n)).unwrap_or_default();
        Ok(self.aliases[idx].clone())
    }

    fn aliases(&self) -> Result<Vec<String>> {
        Ok(self.aliases.clone())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn constant_accepts_single_or_list() {
        let s = ConstantStrategy::from_settings(&json!({ "alias": "A" })).unwrap();
        assert_eq!(s.alias(&[]).unwrap(), "A");

        let s = ConstantStrategy::from_settings(&json!({ "aliases": ["x", "y"] })).unwrap();
        assert_eq!(s.alias(&[RouteKey::from(1)]).unwrap(), "x");
        assert_eq!(s.aliases().unwrap(), vec!["x", "y"]);

        assert!(ConstantStrategy::from_settings(&json!({})).is_err());
        assert!(ConstantStrategy::from_settings(&serde_json::Value::Null).is_err());
    }

    #[test]
    fn hash_is_deterministic_and_in_range() {
        let s = HashStrategy::from_settings(&json!({ "aliases": ["s0", "s1", "s2"] })).unwrap();
        let mut seen = std::collections::HashSet::new();
        for id in 0..200_i64 {
            let a = s.alias(&[RouteKey::from(id)]).unwrap();
            assert_eq!(a, s.alias(&[RouteKey::from(id)]).unwrap());
            seen.insert(a);
        }
        assert_eq!(seen.len(), 3, "200 keys should touch every shard");
        assert!(s.alias(&[]).is_err());
    }

    #[test]
    fn hash_ignores_integer_width_and_sign_type() {
        let settings = json!({ "aliases": ["s0", "s1", "s2", "s3"] });
        let s = HashStrategy::from_settings(&settings).unwrap();
        for k in 0..64_u32 {
            assert_eq!(
                s.alias(&[RouteKey::from(i64::from(k))]).unwrap(),
                s.alias(&[RouteKey::from(u64::from(k))]).unwrap(),
                "key {k} split across shards"
            );
            assert_eq!(
                s.alias(&[RouteKey::from(k)]).unwrap(),
                s.alias(&[RouteKey::from(i32::try_from(k).unwrap())]).unwrap()
            );
        }
    }

    #[test]
    fn hash_distinguishes_key_kinds() {
        let mut a = Xxh3::new();
        RouteKey::from(1).hash_into(&mut a);
        let mut b = Xxh3::new();
        RouteKey::from("1").hash_into(&mut b);
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn modulo_uses_euclidean_remainder() {
        let s = ModuloStrategy::from_settings(&json!({ "aliases": ["a", "b", "c"] })).unwrap();
        assert_eq!(s.alias(&[RouteKey::from(4)]).unwrap(), "b");
        assert_eq!(s.alias(&[RouteKey::from(-1)]).unwrap(), "c");
        assert_eq!(s.alias(&[RouteKey::from(u64::MAX)]).unwrap(), "a");
        assert!(matches!(
            s.alias(&[RouteKey::from("x")]),
            Err(DbError::UnroutableKey { .. })
        ));
    }

    #[test]
    fn catalog_builds_and_reports_unknown() {
        let catalog = StrategyCatalog::with_defaults();
        assert!(catalog.contains(" HASH "));
        assert!(catalog.build("constant", &json!({ "alias": "a" })).is_ok());
        assert!(matches!(
            catalog.build("nope", &json!({})),
            Err(DbError::InvalidStrategy { .. })
        ));
        assert!(matches!(
            catalog.build("hash", &json!({ "aliases": 3 })),
            Err(DbError::InvalidStrategy { .. })
        ));
    }

    #[test]
    fn route_key_display() {
        let id = Uuid::nil();
        assert_eq!(RouteKey::from(id).to_string(), id.to_string());
        assert_eq!(RouteKey::from("k").to_string(), "k");
        assert_eq!(RouteKey::from(7_u32).to_string(), "7");
    }
}
