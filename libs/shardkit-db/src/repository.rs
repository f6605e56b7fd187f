//! Typed repositories over a unit of work.
//!
//! Reads go through [`UnitOfWork::execute_batch`]; paged reads send the count
//! query and the data query in one batch so both see the same snapshot.

use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::paging::{Page, PageRequest};
use crate::query::{Expr, OrderKey, Query, QueryResult};
use crate::uow::UnitOfWork;
use crate::{DbError, Result};

/// A persistent type stored as a JSON row under [`ENTITY_TYPE`](Self::ENTITY_TYPE).
pub trait Entity: Serialize + DeserializeOwned {
    /// Logical type name used by routing and by the driver.
    const ENTITY_TYPE: &'static str;
    /// Identifier value type.
    type Key: Serialize;
}

/// CRUD and query access to `E` through one unit of work.
///
/// An optional extra condition scopes every read and [`clear`](Self::clear);
/// it is ANDed in front of the caller's condition. Raw query paths
/// ([`find_by_query`](Self::find_by_query), [`multi_query`](Self::multi_query))
/// are not scoped.
pub struct Repository<'a, E: Entity> {
    uow: &'a UnitOfWork,
    default_order: Vec<OrderKey>,
    extra_condition: Option<Expr>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> std::fmt::Debug for Repository<'_, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("entity_type", &E::ENTITY_TYPE)
            .field("alias", &self.uow.storage_alias())
            .field("default_order", &self.default_order)
            .field("extra_condition", &self.extra_condition)
            .finish_non_exhaustive()
    }
}

impl<'a, E: Entity> Repository<'a, E> {
    #[must_use]
    pub fn new(uow: &'a UnitOfWork) -> Self {
        Self {
            uow,
            default_order: Vec::new(),
            extra_condition: None,
            _entity: PhantomData,
        }
    }

    /// Ordering used when a read passes none.
    #[must_use]
    pub fn with_default_order(mut self, order: Vec<OrderKey>) -> Self {
        self.default_order = order;
        self
    }

    /// Condition applied to every scoped read.
    #[must_use]
    pub fn with_extra_condition(mut self, condition: Expr) -> Self {
        self.extra_condition = Some(condition);
        self
    }

    #[must_use]
    pub fn unit_of_work(&self) -> &'a UnitOfWork {
        self.uow
    }

    fn scoped(&self, condition: Option<Expr>) -> Option<Expr> {
        Expr::and_opt(self.extra_condition.clone(), condition)
    }

    fn ordering(&self, order: &[OrderKey]) -> Vec<OrderKey> {
        if order.is_empty() {
            self.default_order.clone()
        } else {
            order.to_vec()
        }
    }

    fn key_condition(&self, key: &E::Key) -> Result<Expr> {
        let prop = self
            .uow
            .identifier_property(E::ENTITY_TYPE)?
            .ok_or_else(|| DbError::MissingIdentifier(E::ENTITY_TYPE.to_owned()))?;
        Ok(Expr::eq(prop, serde_json::to_value(key)?))
    }

    fn single(&self, query: &Query) -> Result<QueryResult> {
        let results = self.uow.execute_batch(std::slice::from_ref(query))?;
        match <[QueryResult; 1]>::try_from(results) {
            Ok([result]) => Ok(result),
            Err(results) => Err(DbError::BatchShape(format!(
                "expected 1 result for '{}', got {}",
                E::ENTITY_TYPE,
                results.len()
            ))),
        }
    }

    fn rows(&self, query: &Query) -> Result<Vec<E>> {
        match self.single(query)? {
            QueryResult::Rows(rows) => decode(rows),
            QueryResult::Count(_) => Err(DbError::BatchShape(format!(
                "expected rows for '{}', got a count",
                E::ENTITY_TYPE
            ))),
        }
    }

    fn count_query(&self, query: &Query) -> Result<u64> {
        match self.single(query)? {
            QueryResult::Count(n) => Ok(n),
            QueryResult::Rows(_) => Err(DbError::BatchShape(format!(
                "expected a count for '{}', got rows",
                E::ENTITY_TYPE
            ))),
        }
    }

    // Writes

    /// # Errors
    /// See [`UnitOfWork::register_new`].
    pub fn insert(&self, entity: &E) -> Result<()> {
        self.uow.register_new(Some(entity))
    }

    /// # Errors
    /// See [`UnitOfWork::register_new_all`].
    pub fn insert_all(&self, entities: &[E]) -> Result<()> {
        self.uow.register_new_all(entities)
    }

    /// # Errors
    /// See [`UnitOfWork::register_update`].
    pub fn update(&self, entity: &E) -> Result<()> {
        self.uow.register_update(Some(entity))
    }

    /// # Errors
    /// See [`UnitOfWork::register_update_all`].
    pub fn update_all(&self, entities: &[E]) -> Result<()> {
        self.uow.register_update_all(entities)
    }

    /// Insert or update.
    ///
    /// # Errors
    /// See [`UnitOfWork::register_save`].
    pub fn save(&self, entity: &E) -> Result<()> {
        self.uow.register_save(Some(entity))
    }

    /// # Errors
    /// See [`UnitOfWork::register_save_all`].
    pub fn save_all(&self, entities: &[E]) -> Result<()> {
        self.uow.register_save_all(entities)
    }

    /// # Errors
    /// See [`UnitOfWork::register_delete`].
    pub fn delete(&self, entity: &E) -> Result<()> {
        self.uow.register_delete(Some(entity))
    }

    /// # Errors
    /// See [`UnitOfWork::register_delete_all`].
    pub fn delete_all(&self, entities: &[E]) -> Result<()> {
        self.uow.register_delete_all(entities)
    }

    /// # Errors
    /// See [`UnitOfWork::register_delete_by_key`].
    pub fn delete_by_key(&self, key: &E::Key) -> Result<()> {
        self.uow.register_delete_by_key(E::ENTITY_TYPE, key)
    }

    /// Delete every row in scope: all rows, or those matching the extra condition.
    ///
    /// # Errors
    /// See [`UnitOfWork::register_delete_where`].
    pub fn clear(&self) -> Result<u64> {
        self.uow
            .register_delete_where(E::ENTITY_TYPE, self.extra_condition.as_ref())
    }

    // Reads

    /// Row with identifier `key`, if it exists in scope.
    ///
    /// # Errors
    /// `DbError::MissingIdentifier` if the entity type has no identifier, or query errors.
    pub fn get(&self, key: &E::Key) -> Result<Option<E>> {
        let query = Query::builder(E::ENTITY_TYPE)
            .filter_opt(self.scoped(Some(self.key_condition(key)?)))
            .limit(1)
            .build()?;
        Ok(self.rows(&query)?.into_iter().next())
    }

    /// # Errors
    /// Same as [`get`](Self::get).
    pub fn exists(&self, key: &E::Key) -> Result<bool> {
        let cond = self.key_condition(key)?;
        self.exists_where(Some(cond))
    }

    /// Every row in scope, in default order.
    ///
    /// # Errors
    /// Query or driver errors.
    pub fn find_all(&self) -> Result<Vec<E>> {
        self.find_where(None, &[])
    }

    /// Rows in scope matching `condition`, ordered by `order` or the default order.
    ///
    /// # Errors
    /// `DbError::InvalidQuery` for bad field names, driver errors.
    pub fn find_where(&self, condition: Option<Expr>, order: &[OrderKey]) -> Result<Vec<E>> {
        let query = Query::builder(E::ENTITY_TYPE)
            .filter_opt(self.scoped(condition))
            .order_by(self.ordering(order))
            .build()?;
        self.rows(&query)
    }

    /// # Errors
    /// Same as [`find_where`](Self::find_where).
    pub fn count(&self, condition: Option<Expr>) -> Result<u64> {
        let query = Query::builder(E::ENTITY_TYPE)
            .filter_opt(self.scoped(condition))
            .count()
            .build()?;
        self.count_query(&query)
    }

    /// # Errors
    /// Same as [`find_where`](Self::find_where).
    pub fn exists_where(&self, condition: Option<Expr>) -> Result<bool> {
        Ok(self.count(condition)? > 0)
    }

    /// One page of rows plus the unpaged total, fetched in a single batch.
    ///
    /// `page_size` below 0 is treated as 0 and `page_index` below 1 as 1.
    ///
    /// # Errors
    /// `DbError::InvalidQuery` before any round trip, `DbError::BatchShape` if the
    /// driver does not answer with a count followed by rows, driver errors.
    pub fn find_page(
        &self,
        condition: Option<Expr>,
        order: &[OrderKey],
        page_size: i64,
        page_index: i64,
    ) -> Result<Page<E>> {
        let request = PageRequest::new(page_size, page_index);
        let data = Query::builder(E::ENTITY_TYPE)
            .filter_opt(self.scoped(condition))
            .order_by(self.ordering(order))
            .offset(request.offset())
            .limit(request.size())
            .build()?;
        let count = data.count_of();

        let results = self.uow.execute_batch(&[count, data])?;
        let (total_count, rows) = match <[QueryResult; 2]>::try_from(results) {
            Ok([QueryResult::Count(total), QueryResult::Rows(rows)]) => (total, rows),
            Ok(_) => {
                return Err(DbError::BatchShape(
                    "expected a count followed by rows".to_owned(),
                ));
            }
            Err(results) => {
                return Err(DbError::BatchShape(format!(
                    "expected 2 results, got {}",
                    results.len()
                )));
            }
        };

        tracing::trace!(
            entity_type = E::ENTITY_TYPE,
            total_count,
            page_index = request.index(),
            "page fetched"
        );
        Ok(Page {
            items: decode(rows)?,
            total_count,
            page_size: request.size(),
            page_index: request.index(),
        })
    }

    /// Run a caller-built row query as is; the extra condition is not applied.
    ///
    /// # Errors
    /// `DbError::InvalidQuery` if `query` targets another entity type, driver errors.
    pub fn find_by_query(&self, query: &Query) -> Result<Vec<E>> {
        if query.entity_type() != E::ENTITY_TYPE {
            return Err(DbError::InvalidQuery(format!(
                "query targets '{}', repository serves '{}'",
                query.entity_type(),
                E::ENTITY_TYPE
            )));
        }
        self.rows(query)
    }

    /// Run several queries in one round trip; results come back in order.
    ///
    /// # Errors
    /// Driver errors.
    pub fn multi_query(&self, queries: &[Query]) -> Result<Vec<QueryResult>> {
        self.uow.execute_batch(queries)
    }
}

fn decode<E: DeserializeOwned>(rows: Vec<Value>) -> Result<Vec<E>> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(DbError::from))
        .collect()
}
