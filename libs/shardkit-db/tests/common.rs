#![allow(clippy::unwrap_used, clippy::expect_used)]
#![allow(dead_code)]

//! Shared fixtures: an `Order` entity, memory-backed registries and a
//! recording driver that counts every session call.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use shardkit_db::driver::DriverResult;
use shardkit_db::{
    BackendConfig, BackendRegistry, Driver, DriverCatalog, DriverSession, Entity, Expr,
    IsolationLevel, Projection, Query, QueryResult, StaticRegistryInitializer,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub customer: String,
    pub status: String,
    pub total: i64,
}

impl Entity for Order {
    const ENTITY_TYPE: &'static str = "order";
    type Key = i64;
}

#[must_use]
pub fn order(id: i64, status: &str) -> Order {
    Order {
        id,
        customer: format!("c{}", id % 3),
        status: status.to_owned(),
        total: id * 10,
    }
}

/// Memory backend with `order.id` as the identifier.
#[must_use]
pub fn memory_backend(alias: &str) -> BackendConfig {
    BackendConfig::memory(alias).with_settings(json!({ "entities": { "order": { "id": "id" } } }))
}

/// Initialized registry over `backends`.
#[must_use]
pub fn registry(backends: Vec<BackendConfig>) -> BackendRegistry {
    let registry = BackendRegistry::new(Arc::new(StaticRegistryInitializer::new(backends)));
    registry.initialize().unwrap();
    registry
}

pub fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

/// Everything the recording driver saw, shared by all of its sessions.
#[derive(Default)]
pub struct Recorder {
    pub sessions: AtomicUsize,
    pub calls: Mutex<Vec<String>>,
    pub batches: Mutex<Vec<Vec<Query>>>,
    pub batch_reply: Mutex<Option<Vec<QueryResult>>>,
    pub fail_commit: AtomicBool,
}

impl Recorder {
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().push(call.to_owned());
    }
}

pub const RECORDING_DRIVER: &str = "recording";

/// Catalog with the bundled drivers plus a recording driver reporting to `recorder`.
#[must_use]
pub fn recording_catalog(recorder: &Arc<Recorder>) -> DriverCatalog {
    let recorder = Arc::clone(recorder);
    let mut catalog = DriverCatalog::with_defaults();
    catalog.register(
        RECORDING_DRIVER,
        Arc::new(move |_: &BackendConfig| -> DriverResult<Arc<dyn Driver>> {
            Ok(Arc::new(RecordingDriver {
                recorder: Arc::clone(&recorder),
            }))
        }),
    );
    catalog
}

/// Registry whose backends all use the recording driver.
#[must_use]
pub fn recording_registry(
    recorder: &Arc<Recorder>,
    backends: Vec<BackendConfig>,
) -> BackendRegistry {
    let registry = BackendRegistry::with_drivers(
        Arc::new(StaticRegistryInitializer::new(backends)),
        recording_catalog(recorder),
    );
    registry.initialize().unwrap();
    registry
}

struct RecordingDriver {
    recorder: Arc<Recorder>,
}

impl Driver for RecordingDriver {
    fn name(&self) -> &str {
        RECORDING_DRIVER
    }

    fn open_session(&self) -> DriverResult<Box<dyn DriverSession>> {
        self.recorder.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingSession {
            recorder: Arc::clone(&self.recorder),
            in_tx: false,
        }))
    }
}

struct RecordingSession {
    recorder: Arc<Recorder>,
    in_tx: bool,
}

impl DriverSession for RecordingSession {
    fn begin(&mut self, _isolation: Option<IsolationLevel>) -> DriverResult<()> {
        self.recorder.record("begin");
        self.in_tx = true;
        Ok(())
    }

    fn commit(&mut self) -> DriverResult<()> {
        self.recorder.record("commit");
        if self.recorder.fail_commit.load(Ordering::SeqCst) {
            anyhow::bail!("constraint violated");
        }
        self.in_tx = false;
        Ok(())
    }

    fn rollback(&mut self) -> DriverResult<()> {
        self.recorder.record("rollback");
        self.in_tx = false;
        Ok(())
    }

    fn is_transaction_active(&self) -> bool {
        self.in_tx
    }

    fn save(&mut self, _entity_type: &str, _row: Value) -> DriverResult<()> {
        self.recorder.record("save");
        Ok(())
    }

    fn update(&mut self, _entity_type: &str, _row: Value) -> DriverResult<()> {
        self.recorder.record("update");
        Ok(())
    }

    fn save_or_update(&mut self, _entity_type: &str, _row: Value) -> DriverResult<()> {
        self.recorder.record("save_or_update");
        Ok(())
    }

    fn delete(&mut self, _entity_type: &str, _row: Value) -> DriverResult<()> {
        self.recorder.record("delete");
        Ok(())
    }

    fn delete_where(&mut self, _entity_type: &str, _filter: Option<&Expr>) -> DriverResult<u64> {
        self.recorder.record("delete_where");
        Ok(0)
    }

    fn identifier_property(&self, entity_type: &str) -> Option<String> {
        self.recorder.record("identifier_property");
        (entity_type == Order::ENTITY_TYPE).then(|| "id".to_owned())
    }

    fn execute_batch(&mut self, queries: &[Query]) -> DriverResult<Vec<QueryResult>> {
        self.recorder.record("execute_batch");
        self.recorder.batches.lock().push(queries.to_vec());
        if let Some(reply) = self.recorder.batch_reply.lock().clone() {
            return Ok(reply);
        }
        Ok(queries
            .iter()
            .map(|q| match q.projection() {
                Projection::Count => QueryResult::Count(0),
                Projection::Rows => QueryResult::Rows(Vec::new()),
            })
            .collect())
    }

    fn flush(&mut self) -> DriverResult<()> {
        self.recorder.record("flush");
        Ok(())
    }

    fn close(&mut self) -> DriverResult<()> {
        self.recorder.record("close");
        Ok(())
    }
}
