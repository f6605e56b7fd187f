//! In-process storage driver.
//!
//! Rows are JSON objects held in a shared store. Sessions buffer their writes;
//! a commit applies the whole buffer atomically, a rollback drops it. Reads see
//! committed state only, so a write registered in a session is not visible to
//! that session's own queries until it is committed (or flushed outside a
//! transaction).
//!
//! Settings:
//! ```yaml
//! settings:
//!   entities:
//!     order: { id: id }        # identifier property of "order"
//!     audit_entry: {}          # no identifier, insert-only
//! ```

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::Value;

use super::{Driver, DriverFactory, DriverResult, DriverSession, IsolationLevel};
use crate::config::BackendConfig;
use crate::query::{CompareOperator, Expr, Projection, Query, QueryResult};

/// Identifier of the bundled in-memory driver.
pub const MEMORY_DRIVER: &str = "memory";

#[derive(Debug, Default, Deserialize)]
struct MemorySettings {
    #[serde(default)]
    entities: HashMap<String, EntityMapping>,
}

#[derive(Debug, Default, Deserialize)]
struct EntityMapping {
    #[serde(default)]
    id: Option<String>,
}

/// Factory registered under [`MEMORY_DRIVER`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryDriverFactory;

impl DriverFactory for MemoryDriverFactory {
    fn build(&self, config: &BackendConfig) -> DriverResult<Arc<dyn Driver>> {
        let settings: MemorySettings = if config.settings.is_null() {
            MemorySettings::default()
        } else {
            serde_json::from_value(config.settings.clone())
                .map_err(|e| anyhow!("invalid memory driver settings for '{}': {e}", config.alias))?
        };

        let mut driver = MemoryDriver::new();
        for (entity_type, mapping) in settings.entities {
            if let Some(id) = mapping.id {
                driver = driver.with_identifier(entity_type, id);
            }
        }
        Ok(Arc::new(driver))
    }
}

type Tables = HashMap<String, Vec<Value>>;

/// Shared in-memory store. Cloning shares the same data.
#[derive(Clone, Default)]
pub struct MemoryDriver {
    identifiers: Arc<HashMap<String, String>>,
    tables: Arc<RwLock<Tables>>,
}

impl MemoryDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `entity_type` to its identifier property.
    #[must_use]
    pub fn with_identifier(
        mut self,
        entity_type: impl Into<String>,
        property: impl Into<String>,
    ) -> Self {
        Arc::make_mut(&mut self.identifiers).insert(entity_type.into(), property.into());
        self
    }

    /// Committed row count for `entity_type`.
    #[must_use]
    pub fn row_count(&self, entity_type: &str) -> usize {
        self.tables.read().get(entity_type).map_or(0, Vec::len)
    }
}

impl Driver for MemoryDriver {
    fn name(&self) -> &str {
        MEMORY_DRIVER
    }

    fn open_session(&self) -> DriverResult<Box<dyn DriverSession>> {
        Ok(Box::new(MemorySession {
            identifiers: Arc::clone(&self.identifiers),
            tables: Arc::clone(&self.tables),
            pending: Vec::new(),
            in_tx: false,
            closed: false,
        }))
    }
}

enum Op {
    Save(String, Value),
    Update(String, Value),
    SaveOrUpdate(String, Value),
    Delete(String, Value),
    DeleteWhere(String, Option<Expr>),
}

impl Op {
    fn entity_type(&self) -> &str {
        match self {
            Op::Save(t, _)
            | Op::Update(t, _)
            | Op::SaveOrUpdate(t, _)
            | Op::Delete(t, _)
            | Op::DeleteWhere(t, _) => t,
        }
    }
}

struct MemorySession {
    identifiers: Arc<HashMap<String, String>>,
    tables: Arc<RwLock<Tables>>,
    pending: Vec<Op>,
    in_tx: bool,
    closed: bool,
}

impl MemorySession {
    fn ensure_open(&self) -> DriverResult<()> {
        if self.closed {
            bail!("memory session is closed");
        }
        Ok(())
    }

    fn enqueue(&mut self, op: Op) -> DriverResult<()> {
        self.ensure_open()?;
        self.pending.push(op);
        Ok(())
    }

    /// Apply pending writes all-or-nothing.
    fn apply_pending(&mut self) -> DriverResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut guard = self.tables.write();
        // Only tables touched by the pending ops are staged.
        let mut staged = Tables::new();
        for op in &self.pending {
            let entity_type = op.entity_type();
            if !staged.contains_key(entity_type) {
                let current = guard.get(entity_type).cloned().unwrap_or_default();
                staged.insert(entity_type.to_owned(), current);
            }
            apply_op(&self.identifiers, &mut staged, op)?;
        }
        guard.extend(staged);
        self.pending.clear();
        Ok(())
    }
}

impl DriverSession for MemorySession {
    fn begin(&mut self, _isolation: Option<IsolationLevel>) -> DriverResult<()> {
        // Commits are applied under the store's write lock, so every level is serializable here.
        self.ensure_open()?;
        if self.in_tx {
            bail!("transaction already active");
        }
        self.in_tx = true;
        Ok(())
    }

    fn commit(&mut self) -> DriverResult<()> {
        self.ensure_open()?;
        if !self.in_tx {
            bail!("no active transaction to commit");
        }
        self.apply_pending()?;
        self.in_tx = false;
        Ok(())
    }

    fn rollback(&mut self) -> DriverResult<()> {
        self.ensure_open()?;
        self.pending.clear();
        self.in_tx = false;
        Ok(())
    }

    fn is_transaction_active(&self) -> bool {
        self.in_tx
    }

    fn save(&mut self, entity_type: &str, row: Value) -> DriverResult<()> {
        self.enqueue(Op::Save(entity_type.to_owned(), row))
    }

    fn update(&mut self, entity_type: &str, row: Value) -> DriverResult<()> {
        self.enqueue(Op::Update(entity_type.to_owned(), row))
    }

    fn save_or_update(&mut self, entity_type: &str, row: Value) -> DriverResult<()> {
        self.enqueue(Op::SaveOrUpdate(entity_type.to_owned(), row))
    }

    fn delete(&mut self, entity_type: &str, row: Value) -> DriverResult<()> {
        self.enqueue(Op::Delete(entity_type.to_owned(), row))
    }

    fn delete_where(&mut self, entity_type: &str, filter: Option<&Expr>) -> DriverResult<u64> {
        self.ensure_open()?;
        let matched = self.tables.read().get(entity_type).map_or(0, |rows| {
            rows.iter()
                .filter(|row| filter.is_none_or(|f| matches(f, row)))
                .count()
        });
        self.pending
            .push(Op::DeleteWhere(entity_type.to_owned(), filter.cloned()));
        Ok(matched as u64)
    }

    fn identifier_property(&self, entity_type: &str) -> Option<String> {
        self.identifiers.get(entity_type).cloned()
    }

    fn execute_batch(&mut self, queries: &[Query]) -> DriverResult<Vec<QueryResult>> {
        self.ensure_open()?;
        // One read lock for the whole batch: every sub-query sees the same snapshot.
        let tables = self.tables.read();
        Ok(queries.iter().map(|q| run_query(&tables, q)).collect())
    }

    fn flush(&mut self) -> DriverResult<()> {
        self.ensure_open()?;
        if self.in_tx {
            return Ok(());
        }
        self.apply_pending()
    }

    fn close(&mut self) -> DriverResult<()> {
        self.pending.clear();
        self.in_tx = false;
        self.closed = true;
        Ok(())
    }
}

fn identifier<'a>(
    identifiers: &'a HashMap<String, String>,
    entity_type: &str,
) -> DriverResult<&'a str> {
    identifiers
        .get(entity_type)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("entity type '{entity_type}' has no identifier property"))
}

fn id_value<'a>(row: &'a Value, prop: &str, entity_type: &str) -> DriverResult<&'a Value> {
    match field(row, prop) {
        Value::Null => bail!("'{entity_type}' row has no value for identifier '{prop}'"),
        v => Ok(v),
    }
}

fn position(rows: &[Value], prop: &str, id: &Value) -> Option<usize> {
    rows.iter().position(|r| field(r, prop) == id)
}

fn apply_op(
    identifiers: &HashMap<String, String>,
    tables: &mut Tables,
    op: &Op,
) -> DriverResult<()> {
    match op {
        Op::Save(entity_type, row) => {
            let rows = tables.entry(entity_type.clone()).or_default();
            if let Some(prop) = identifiers.get(entity_type) {
                let id = id_value(row, prop, entity_type)?;
                if position(rows, prop, id).is_some() {
                    bail!("duplicate identifier {id} for '{entity_type}'");
                }
            }
            rows.push(row.clone());
        }
        Op::Update(entity_type, row) => {
            let prop = identifier(identifiers, entity_type)?;
            let id = id_value(row, prop, entity_type)?;
            let rows = tables.entry(entity_type.clone()).or_default();
            let idx = position(rows, prop, id)
                .ok_or_else(|| anyhow!("no '{entity_type}' row with identifier {id} to update"))?;
            rows[idx] = row.clone();
        }
        Op::SaveOrUpdate(entity_type, row) => {
            let prop = identifier(identifiers, entity_type)?;
            let id = id_value(row, prop, entity_type)?;
            let rows = tables.entry(entity_type.clone()).or_default();
            match position(rows, prop, id) {
                Some(idx) => rows[idx] = row.clone(),
                None => rows.push(row.clone()),
            }
        }
        Op::Delete(entity_type, row) => {
            let prop = identifier(identifiers, entity_type)?;
            let id = id_value(row, prop, entity_type)?;
            let rows = tables.entry(entity_type.clone()).or_default();
            let idx = position(rows, prop, id)
                .ok_or_else(|| anyhow!("no '{entity_type}' row with identifier {id} to delete"))?;
            rows.remove(idx);
        }
        Op::DeleteWhere(entity_type, filter) => {
            if let Some(rows) = tables.get_mut(entity_type) {
                rows.retain(|row| !filter.as_ref().is_none_or(|f| matches(f, row)));
            }
        }
    }
    Ok(())
}

fn run_query(tables: &Tables, query: &Query) -> QueryResult {
    let empty = Vec::new();
    let rows = tables.get(query.entity_type()).unwrap_or(&empty);
    let mut hits: Vec<&Value> = rows
        .iter()
        .filter(|row| query.filter().is_none_or(|f| matches(f, row)))
        .collect();

    match query.projection() {
        Projection::Count => QueryResult::Count(hits.len() as u64),
        Projection::Rows => {
            if !query.order().is_empty() {
                hits.sort_by(|a, b| {
                    query
                        .order()
                        .iter()
                        .map(|key| {
                            let ord = total_cmp(field(a, &key.field), field(b, &key.field));
                            match key.dir {
                                crate::query::SortDir::Asc => ord,
                                crate::query::SortDir::Desc => ord.reverse(),
                            }
                        })
                        .find(|o| *o != Ordering::Equal)
                        .unwrap_or(Ordering::Equal)
                });
            }
            let offset = usize::try_from(query.offset()).unwrap_or(usize::MAX);
            let limit = query
                .limit()
                .map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));
            QueryResult::Rows(hits.into_iter().skip(offset).take(limit).cloned().collect())
        }
    }
}

static NULL: Value = Value::Null;

/// Resolve a dotted field path; missing segments read as null.
fn field<'a>(row: &'a Value, path: &str) -> &'a Value {
    path.split('.')
        .try_fold(row, |v, seg| v.get(seg))
        .unwrap_or(&NULL)
}

fn matches(expr: &Expr, row: &Value) -> bool {
    match expr {
        Expr::And(a, b) => matches(a, row) && matches(b, row),
        Expr::Or(a, b) => matches(a, row) || matches(b, row),
        Expr::Not(e) => !matches(e, row),
        Expr::IsNull(f) => field(row, f).is_null(),
        Expr::In(f, values) => {
            let v = field(row, f);
            values.iter().any(|candidate| cmp_values(v, candidate) == Some(Ordering::Equal))
        }
        Expr::Compare(f, op, value) => {
            let ord = cmp_values(field(row, f), value);
            match op {
                CompareOperator::Eq => ord == Some(Ordering::Equal),
                CompareOperator::Ne => ord != Some(Ordering::Equal),
                CompareOperator::Gt => ord == Some(Ordering::Greater),
                CompareOperator::Ge => matches!(ord, Some(Ordering::Greater | Ordering::Equal)),
                CompareOperator::Lt => ord == Some(Ordering::Less),
                CompareOperator::Le => matches!(ord, Some(Ordering::Less | Ordering::Equal)),
            }
        }
    }
}

/// Comparison of same-kind scalars; `None` when the values are not comparable.
fn cmp_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                Some(x.cmp(&y))
            } else if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
                Some(x.cmp(&y))
            } else {
                x.as_f64()?.partial_cmp(&y.as_f64()?)
            }
        }
        _ => None,
    }
}

fn kind_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order used for sorting: nulls first, then by kind, then by value.
fn total_cmp(a: &Value, b: &Value) -> Ordering {
    kind_rank(a)
        .cmp(&kind_rank(b))
        .then_with(|| cmp_values(a, b).unwrap_or(Ordering::Equal))
}
