//! Unit of work: one operation scope bound to one backend session.
//!
//! The session is opened eagerly when the unit of work is created and is owned
//! exclusively by it. The local transaction starts lazily on the first
//! mutating call. When an ambient transaction is active, no local transaction
//! is started and `commit` leaves the decision to the ambient owner.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use crate::backend::BackendHandle;
use crate::driver::{DriverSession, IsolationLevel};
use crate::query::{Expr, Query, QueryResult};
use crate::registry::BackendRegistry;
use crate::repository::Entity;
use crate::routing::RouteKey;
use crate::routing::router::AliasRouter;
use crate::{DbError, Result};

/// A transaction owned outside the unit of work, e.g. a distributed one.
pub trait AmbientTransaction: Send + Sync {
    fn is_active(&self) -> bool;
}

/// Flag-backed ambient transaction, active from creation until [`complete`](Self::complete).
#[derive(Debug)]
pub struct ScopedAmbient {
    active: AtomicBool,
}

impl Default for ScopedAmbient {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopedAmbient {
    #[must_use]
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(true),
        }
    }

    pub fn complete(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

impl AmbientTransaction for ScopedAmbient {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Options for [`UnitOfWork::open_with`].
#[derive(Clone, Default)]
pub struct UowOptions {
    /// Ambient transaction in scope, if any.
    pub ambient: Option<Arc<dyn AmbientTransaction>>,
    /// Isolation level for the lazily started local transaction.
    pub isolation: Option<IsolationLevel>,
}

impl fmt::Debug for UowOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UowOptions")
            .field("ambient", &self.ambient.as_ref().map(|a| a.is_active()))
            .field("isolation", &self.isolation)
            .finish()
    }
}

impl UowOptions {
    #[must_use]
    pub fn with_ambient(mut self, ambient: Arc<dyn AmbientTransaction>) -> Self {
        self.ambient = Some(ambient);
        self
    }

    #[must_use]
    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = Some(isolation);
        self
    }
}

/// Local transaction state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxState {
    NoTransaction,
    Active,
    Committed,
    RolledBack,
}

#[derive(Clone, Copy)]
enum WriteKind {
    New,
    Update,
    Save,
    Delete,
}

struct Inner {
    session: Option<Box<dyn DriverSession>>,
    state: TxState,
}

/// Operation scope bound to exactly one backend for its whole lifetime.
pub struct UnitOfWork {
    alias: String,
    read_only: bool,
    ambient: Option<Arc<dyn AmbientTransaction>>,
    isolation: Option<IsolationLevel>,
    inner: Mutex<Inner>,
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("UnitOfWork")
            .field("alias", &self.alias)
            .field("read_only", &self.read_only)
            .field("state", &inner.state)
            .field("disposed", &inner.session.is_none())
            .finish_non_exhaustive()
    }
}

impl UnitOfWork {
    /// Bind to `alias`, or to the registry's default handle when `None`.
    ///
    /// # Errors
    /// Registry lookup errors, or `DbError::Backend` if no session can be opened.
    pub fn open(registry: &BackendRegistry, alias: Option<&str>) -> Result<Self> {
        Self::open_with(registry, alias, UowOptions::default())
    }

    /// [`open`](Self::open) with explicit options.
    ///
    /// # Errors
    /// Same as [`open`](Self::open).
    pub fn open_with(
        registry: &BackendRegistry,
        alias: Option<&str>,
        options: UowOptions,
    ) -> Result<Self> {
        let handle = match alias {
            Some(alias) => registry.get_handle(alias)?,
            None => registry.get_first_handle()?,
        };
        Self::on_handle(&handle, options)
    }

    /// Bind to the backend the router picks for `E` and `keys`.
    ///
    /// # Errors
    /// Routing errors, then the same as [`open`](Self::open).
    pub fn open_routed<E: Entity>(
        registry: &BackendRegistry,
        router: &AliasRouter,
        keys: &[RouteKey],
        options: UowOptions,
    ) -> Result<Self> {
        let alias = router.alias_for::<E>(keys)?;
        Self::open_with(registry, Some(&alias), options)
    }

    /// Bind directly to `handle`.
    ///
    /// # Errors
    /// `DbError::Backend` if no session can be opened.
    pub fn on_handle(handle: &BackendHandle, options: UowOptions) -> Result<Self> {
        let session = handle.open_session()?;
        tracing::debug!(
            alias = handle.alias(),
            read_only = handle.is_read_only(),
            "unit of work opened"
        );
        Ok(Self {
            alias: handle.alias().to_owned(),
            read_only: handle.is_read_only(),
            ambient: options.ambient,
            isolation: options.isolation,
            inner: Mutex::new(Inner {
                session: Some(session),
                state: TxState::NoTransaction,
            }),
        })
    }

    #[must_use]
    pub fn storage_alias(&self) -> &str {
        &self.alias
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    #[must_use]
    pub fn tx_state(&self) -> TxState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.lock().session.is_none()
    }

    fn ambient_active(&self) -> bool {
        self.ambient.as_ref().is_some_and(|a| a.is_active())
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(DbError::ReadOnlyStorage(self.alias.clone()));
        }
        Ok(())
    }

    fn session<'a>(&self, inner: &'a mut Inner) -> Result<&'a mut dyn DriverSession> {
        match inner.session.as_deref_mut() {
            Some(session) => Ok(session),
            None => Err(DbError::Disposed(self.alias.clone())),
        }
    }

    fn begin_if_needed(&self, inner: &mut Inner, isolation: Option<IsolationLevel>) -> Result<()> {
        if self.ambient_active() {
            return Ok(());
        }
        let session = self.session(inner)?;
        if session.is_transaction_active() {
            return Ok(());
        }
        let level = isolation.or(self.isolation);
        session.begin(level)?;
        inner.state = TxState::Active;
        tracing::debug!(alias = %self.alias, isolation = ?level, "local transaction started");
        Ok(())
    }

    /// Start the local transaction unless one is already running or an
    /// ambient transaction is active.
    ///
    /// # Errors
    /// `DbError::ReadOnlyStorage` before touching the session, `DbError::Disposed`,
    /// or the driver's error.
    pub fn prepare_transaction(&self, isolation: Option<IsolationLevel>) -> Result<()> {
        self.ensure_writable()?;
        let mut inner = self.inner.lock();
        self.begin_if_needed(&mut inner, isolation)
    }

    fn with_write<R>(&self, op: impl FnOnce(&mut dyn DriverSession) -> Result<R>) -> Result<R> {
        self.ensure_writable()?;
        let mut inner = self.inner.lock();
        self.begin_if_needed(&mut inner, None)?;
        op(self.session(&mut inner)?)
    }

    fn register<'e, E, I>(&self, kind: WriteKind, entities: I) -> Result<()>
    where
        E: Entity + 'e,
        I: IntoIterator<Item = &'e E>,
    {
        let rows = entities
            .into_iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<Value>, _>>()?;
        if rows.is_empty() {
            return Ok(());
        }
        self.register_rows(E::ENTITY_TYPE, kind, rows)
    }

    fn register_rows(&self, entity_type: &str, kind: WriteKind, rows: Vec<Value>) -> Result<()> {
        self.with_write(|session| {
            for row in rows {
                match kind {
                    WriteKind::New => session.save(entity_type, row)?,
                    WriteKind::Update => session.update(entity_type, row)?,
                    WriteKind::Save => session.save_or_update(entity_type, row)?,
                    WriteKind::Delete => session.delete(entity_type, row)?,
                }
            }
            Ok(())
        })
    }

    /// Schedule an insert. `None` is a no-op.
    ///
    /// # Errors
    /// `DbError::ReadOnlyStorage`, `DbError::Disposed`, serialization or driver errors.
    pub fn register_new<E: Entity>(&self, entity: Option<&E>) -> Result<()> {
        self.register(WriteKind::New, entity)
    }

    /// Schedule an update. `None` is a no-op.
    ///
    /// # Errors
    /// Same as [`register_new`](Self::register_new).
    pub fn register_update<E: Entity>(&self, entity: Option<&E>) -> Result<()> {
        self.register(WriteKind::Update, entity)
    }

    /// Schedule an insert-or-update. `None` is a no-op.
    ///
    /// # Errors
    /// Same as [`register_new`](Self::register_new).
    pub fn register_save<E: Entity>(&self, entity: Option<&E>) -> Result<()> {
        self.register(WriteKind::Save, entity)
    }

    /// Schedule a delete. `None` is a no-op.
    ///
    /// # Errors
    /// Same as [`register_new`](Self::register_new).
    pub fn register_delete<E: Entity>(&self, entity: Option<&E>) -> Result<()> {
        self.register(WriteKind::Delete, entity)
    }

    /// Bulk [`register_new`](Self::register_new); an empty slice is a no-op.
    ///
    /// # Errors
    /// Same as [`register_new`](Self::register_new).
    pub fn register_new_all<E: Entity>(&self, entities: &[E]) -> Result<()> {
        self.register(WriteKind::New, entities)
    }

    /// Bulk [`register_update`](Self::register_update); an empty slice is a no-op.
    ///
    /// # Errors
    /// Same as [`register_new`](Self::register_new).
    pub fn register_update_all<E: Entity>(&self, entities: &[E]) -> Result<()> {
        self.register(WriteKind::Update, entities)
    }

    /// Bulk [`register_save`](Self::register_save); an empty slice is a no-op.
    ///
    /// # Errors
    /// Same as [`register_new`](Self::register_new).
    pub fn register_save_all<E: Entity>(&self, entities: &[E]) -> Result<()> {
        self.register(WriteKind::Save, entities)
    }

    /// Bulk [`register_delete`](Self::register_delete); an empty slice is a no-op.
    ///
    /// # Errors
    /// Same as [`register_new`](Self::register_new).
    pub fn register_delete_all<E: Entity>(&self, entities: &[E]) -> Result<()> {
        self.register(WriteKind::Delete, entities)
    }

    /// Schedule a bulk delete of rows whose identifier equals `key`.
    /// An absent key matches no rows and is not an error.
    ///
    /// # Errors
    /// `DbError::MissingIdentifier` if `entity_type` has no identifier property,
    /// otherwise the same as [`register_new`](Self::register_new).
    pub fn register_delete_by_key<K>(&self, entity_type: &str, key: &K) -> Result<()>
    where
        K: Serialize + ?Sized,
    {
        let key = serde_json::to_value(key)?;
        self.ensure_writable()?;
        let mut inner = self.inner.lock();
        // Resolved before begin so a missing identifier leaves no transaction behind.
        let prop = self
            .session(&mut inner)?
            .identifier_property(entity_type)
            .ok_or_else(|| DbError::MissingIdentifier(entity_type.to_owned()))?;
        self.begin_if_needed(&mut inner, None)?;
        self.session(&mut inner)?
            .delete_where(entity_type, Some(&Expr::eq(prop, key)))?;
        Ok(())
    }

    /// Schedule deletion of every row of `entity_type` matching `filter`.
    /// Returns the number of rows the driver reports as matched.
    ///
    /// # Errors
    /// Same as [`register_new`](Self::register_new).
    pub fn register_delete_where(&self, entity_type: &str, filter: Option<&Expr>) -> Result<u64> {
        self.with_write(|session| Ok(session.delete_where(entity_type, filter)?))
    }

    /// Schedule deletion of every row of `entity_type`.
    ///
    /// # Errors
    /// Same as [`register_new`](Self::register_new).
    pub fn register_clear(&self, entity_type: &str) -> Result<u64> {
        self.register_delete_where(entity_type, None)
    }

    /// Commit the local transaction.
    ///
    /// No-op without a local transaction or while an ambient transaction is active.
    /// A failed commit is rolled back and the commit error returned.
    ///
    /// # Errors
    /// `DbError::ReadOnlyStorage`, `DbError::Disposed`, or the driver's commit error.
    pub fn commit(&self) -> Result<()> {
        self.ensure_writable()?;
        let mut inner = self.inner.lock();
        let session = self.session(&mut inner)?;
        if self.ambient_active() || !session.is_transaction_active() {
            return Ok(());
        }

        match session.commit() {
            Ok(()) => {
                inner.state = TxState::Committed;
                tracing::debug!(alias = %self.alias, "local transaction committed");
                Ok(())
            }
            Err(err) => {
                if let Err(rb) = session.rollback() {
                    tracing::warn!(
                        alias = %self.alias,
                        error = %rb,
                        "rollback after failed commit failed"
                    );
                }
                inner.state = TxState::RolledBack;
                tracing::debug!(alias = %self.alias, error = %err, "commit failed, rolled back");
                Err(err.into())
            }
        }
    }

    /// Roll back the local transaction, if any.
    ///
    /// # Errors
    /// `DbError::Disposed` or the driver's error.
    pub fn rollback(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let session = self.session(&mut inner)?;
        if self.ambient_active() || !session.is_transaction_active() {
            return Ok(());
        }
        session.rollback()?;
        inner.state = TxState::RolledBack;
        tracing::debug!(alias = %self.alias, "local transaction rolled back");
        Ok(())
    }

    /// Push registered writes to the backend without committing.
    ///
    /// # Errors
    /// `DbError::Disposed` or the driver's error.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.session(&mut inner)?.flush()?;
        Ok(())
    }

    /// Run `queries` in one round trip. Reads never start a transaction.
    ///
    /// # Errors
    /// `DbError::Disposed` or the driver's error.
    pub fn execute_batch(&self, queries: &[Query]) -> Result<Vec<QueryResult>> {
        let mut inner = self.inner.lock();
        Ok(self.session(&mut inner)?.execute_batch(queries)?)
    }

    /// Identifier property of `entity_type` on this backend.
    ///
    /// # Errors
    /// `DbError::Disposed`.
    pub fn identifier_property(&self, entity_type: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock();
        Ok(self.session(&mut inner)?.identifier_property(entity_type))
    }

    /// Release the session, rolling back an uncommitted local transaction.
    /// Later calls are no-ops.
    ///
    /// # Errors
    /// The driver's rollback or close error; the session is released either way.
    pub fn dispose(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(mut session) = inner.session.take() else {
            return Ok(());
        };

        let rolled_back = if session.is_transaction_active() {
            inner.state = TxState::RolledBack;
            session.rollback()
        } else {
            Ok(())
        };
        let closed = session.close();
        tracing::debug!(alias = %self.alias, "unit of work disposed");
        rolled_back.and(closed).map_err(DbError::from)
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            tracing::warn!(alias = %self.alias, error = %e, "failed to release session");
        }
    }
}
