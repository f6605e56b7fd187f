//! Minimal type-keyed service hub.
//!
//! The registry and the router look up optional capabilities here
//! (`dyn RegistryInitializer`, `dyn RouterInitializer`) and fall back to their
//! built-in defaults when nothing is registered.
//!
//! - Key = `type_name::<T>()`, which works for `T = dyn Trait`.
//! - Value = `Arc<T>` stored as `Box<dyn Any + Send + Sync>` (downcast on read).
//! - Re-registering overwrites; `Arc`s already handed out stay valid.

use parking_lot::RwLock;
use std::{any::Any, collections::HashMap, fmt, sync::Arc};

use crate::{DbError, Result};

type Boxed = Box<dyn Any + Send + Sync>;

/// Registry of shared capabilities keyed by interface type.
#[derive(Default)]
pub struct ServiceHub {
    map: RwLock<HashMap<&'static str, Boxed>>,
}

impl fmt::Debug for ServiceHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let map = self.map.read();
        let mut keys: Vec<_> = map.keys().copied().collect();
        keys.sort_unstable();
        f.debug_struct("ServiceHub").field("services", &keys).finish()
    }
}

impl ServiceHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `service` under the interface type `T` (e.g. `dyn RegistryInitializer`).
    pub fn register<T>(&self, service: Arc<T>)
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.map
            .write()
            .insert(std::any::type_name::<T>(), Box::new(service));
    }

    /// Fetch the service registered under `T`, if any.
    #[must_use]
    pub fn get<T>(&self) -> Option<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let map = self.map.read();
        map.get(std::any::type_name::<T>())
            .and_then(|boxed| boxed.downcast_ref::<Arc<T>>())
            .cloned()
    }

    /// Like [`get`](Self::get), failing when nothing is registered.
    ///
    /// # Errors
    /// `DbError::NotInitialized` naming the missing interface.
    pub fn try_get<T>(&self) -> Result<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.get::<T>()
            .ok_or(DbError::NotInitialized(std::any::type_name::<T>()))
    }

    /// Remove the service registered under `T`, returning it.
    pub fn remove<T>(&self) -> Option<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let boxed = self.map.write().remove(std::any::type_name::<T>())?;
        boxed.downcast::<Arc<T>>().ok().map(|b| *b)
    }

    pub fn clear(&self) {
        self.map.write().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}
