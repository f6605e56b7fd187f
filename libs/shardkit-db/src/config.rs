//! Configuration types for the backend registry and the alias router.
//!
//! Files are read with `figment`: a `.json` extension selects the JSON provider,
//! anything else is parsed as YAML.
//!
//! Registry file:
//! ```yaml
//! backends:
//!   - alias: orders_primary
//!     driver: memory
//!     settings:
//!       entities:
//!         order: { id: id }
//!   - alias: orders_replica
//!     read_only: true
//! ```
//!
//! Routing file:
//! ```yaml
//! routes:
//!   - entity_type: order
//!     strategy: hash
//!     settings:
//!       aliases: [shard_0, shard_1]
//! ```

use std::path::Path;

use figment::Figment;
use figment::providers::{Format, Json, Yaml};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::driver::memory::MEMORY_DRIVER;
use crate::{DbError, Result};

/// All backends of a registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

/// One backend: alias, driver identifier, read-only flag and driver settings.
///
/// `settings` is opaque to the registry and handed to the driver factory as is.
#[derive(Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub alias: String,
    #[serde(default = "default_driver")]
    pub driver: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub settings: serde_json::Value,
}

fn default_driver() -> String {
    MEMORY_DRIVER.to_owned()
}

impl BackendConfig {
    #[must_use]
    pub fn new(alias: impl Into<String>, driver: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            driver: driver.into(),
            read_only: false,
            settings: serde_json::Value::Null,
        }
    }

    /// Backend served by the bundled in-memory driver.
    #[must_use]
    pub fn memory(alias: impl Into<String>) -> Self {
        Self::new(alias, MEMORY_DRIVER)
    }

    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: serde_json::Value) -> Self {
        self.settings = settings;
        self
    }
}

// Settings may carry credentials.
impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("alias", &self.alias)
            .field("driver", &self.driver)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

/// All routing rules of a router.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// One routing rule as written in the configuration file.
///
/// Missing fields deserialize as blank so that validation can report them
/// with the rule's position instead of a generic parse error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteConfig {
    #[serde(default)]
    pub entity_type: String,
    #[serde(default)]
    pub strategy: String,
    #[serde(default)]
    pub settings: serde_json::Value,
}

impl RouteConfig {
    #[must_use]
    pub fn new(
        entity_type: impl Into<String>,
        strategy: impl Into<String>,
        settings: serde_json::Value,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            strategy: strategy.into(),
            settings,
        }
    }
}

/// Load and deserialize a configuration file.
///
/// # Errors
/// Returns `DbError::ConfigMissing` if `path` is not a file and
/// `DbError::ConfigLoad` if it cannot be parsed into `T`.
pub fn load_config<T: DeserializeOwned>(path: &Path) -> Result<T> {
    if !path.is_file() {
        return Err(DbError::ConfigMissing(path.display().to_string()));
    }

    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));

    let figment = if is_json {
        Figment::from(Json::file(path))
    } else {
        Figment::from(Yaml::file(path))
    };

    Ok(figment.extract()?)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn yaml_registry_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "backends.yaml",
            "backends:\n  - alias: Main\n  - alias: replica\n    read_only: true\n",
        );

        let cfg: RegistryConfig = load_config(&path).unwrap();
        assert_eq!(cfg.backends.len(), 2);
        assert_eq!(cfg.backends[0].alias, "Main");
        assert_eq!(cfg.backends[0].driver, MEMORY_DRIVER);
        assert!(!cfg.backends[0].read_only);
        assert!(cfg.backends[1].read_only);
    }

    #[test]
    fn json_router_keeps_blank_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "routes.json",
            r#"{ "routes": [ { "entity_type": "order", "settings": { "alias": "a" } } ] }"#,
        );

        let cfg: RouterConfig = load_config(&path).unwrap();
        assert_eq!(cfg.routes.len(), 1);
        assert_eq!(cfg.routes[0].entity_type, "order");
        assert!(cfg.routes[0].strategy.is_empty());
        assert_eq!(cfg.routes[0].settings["alias"], "a");
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config::<RegistryConfig>(&dir.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(err, DbError::ConfigMissing(_)));
    }

    #[test]
    fn debug_hides_settings() {
        let cfg = BackendConfig::memory("main")
            .with_settings(serde_json::json!({ "password": "hunter2" }));
        let printed = format!("{cfg:?}");
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("main"));
    }
}
