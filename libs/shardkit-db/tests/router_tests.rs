#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Alias router loading, atomic rule replacement and hot reload.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use common::{Order, write_file};
use serde_json::json;
use shardkit_db::routing::ConstantStrategy;
use shardkit_db::{
    AliasRouter, DbError, ErrorKind, RouteConfig, RouterConfig, RoutingStrategy, StrategyCatalog,
};

const ROUTES: &str = r"
routes:
  - entity_type: order
    strategy: hash
    settings:
      aliases: [Shard_0, SHARD_1, shard_2]
  - entity_type: invoice
    strategy: constant
    settings:
      alias: ' Billing '
";

fn router() -> AliasRouter {
    AliasRouter::new(StrategyCatalog::with_defaults())
}

#[test]
fn loads_yaml_rules_and_normalizes_results() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "routes.yaml", ROUTES);
    let router = router();

    router.initialize(&path).unwrap();

    assert_eq!(router.rules().entity_types(), vec!["invoice", "order"]);
    assert_eq!(router.get_alias("invoice", &[]).unwrap(), "billing");
    assert_eq!(
        router.aliases_for::<Order>().unwrap(),
        vec!["shard_0", "shard_1", "shard_2"]
    );
    let alias = router.alias_for::<Order>(&[1234.into()]).unwrap();
    assert!(alias.starts_with("shard_"));
    assert_eq!(router.alias_for::<Order>(&[1234.into()]).unwrap(), alias);
}

#[test]
fn loads_json_rules() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(
        dir.path(),
        "routes.json",
        r#"{ "routes": [
            { "entity_type": "order", "strategy": "modulo", "settings": { "aliases": ["a", "b"] } }
        ] }"#,
    );
    let router = router();
    router.initialize(&path).unwrap();

    assert_eq!(router.get_alias("order", &[7.into()]).unwrap(), "b");
    assert!(matches!(
        router.get_alias("order", &["x".into()]),
        Err(DbError::UnroutableKey { .. })
    ));
}

#[test]
fn malformed_file_is_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "routes.yaml", "routes: [ {");

    let err = router().initialize(&path).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn reload_failure_keeps_previous_rules() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "routes.yaml", ROUTES);
    let router = router();
    router.initialize(&path).unwrap();

    write_file(
        dir.path(),
        "routes.yaml",
        "routes:\n  - entity_type: order\n    strategy: constant\n  \
         - entity_type: order\n    strategy: constant\n",
    );
    assert!(router.reload().is_err());
    assert_eq!(router.get_alias("invoice", &[]).unwrap(), "billing");
    assert_eq!(router.generation(), 1);

    std::fs::remove_file(&path).unwrap();
    router.reload().unwrap();
    assert!(router.rules().is_empty());
    assert!(matches!(
        router.get_alias("invoice", &[]),
        Err(DbError::RouteNotFound(_))
    ));
}

fn paired(alias: &str) -> RouterConfig {
    RouterConfig {
        routes: vec![
            RouteConfig::new("order", "constant", json!({ "alias": alias })),
            RouteConfig::new("invoice", "constant", json!({ "alias": alias })),
        ],
    }
}

#[test]
fn readers_never_observe_a_partial_rule_set() {
    let router = Arc::new(router());
    router.install(&paired("x")).unwrap();
    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let router = Arc::clone(&router);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut seen = 0_u64;
                loop {
                    let rules = router.rules();
                    let order = rules.get("order").unwrap().alias(&[]).unwrap();
                    let invoice = rules.get("invoice").unwrap().alias(&[]).unwrap();
                    assert_eq!(order, invoice);
                    seen += 1;
                    if stop.load(Ordering::Relaxed) {
                        break seen;
                    }
                }
            })
        })
        .collect();

    for i in 0..200 {
        router
            .install(&paired(if i % 2 == 0 { "y" } else { "x" }))
            .unwrap();
    }
    stop.store(true, Ordering::Relaxed);

    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }
    assert_eq!(router.generation(), 201);
}

#[test]
fn watcher_picks_up_file_changes() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "routes.yaml", ROUTES);
    let router = Arc::new(router());
    router.initialize(&path).unwrap();
    let watcher = router.watch(Duration::from_millis(100)).unwrap();
    assert_eq!(watcher.path(), path.as_path());

    write_file(
        dir.path(),
        "routes.yaml",
        "routes:\n  - entity_type: invoice\n    strategy: constant\n    \
         settings:\n      alias: archive\n",
    );

    let deadline = Instant::now() + Duration::from_secs(10);
    while router.get_alias("invoice", &[]).ok().as_deref() != Some("archive") {
        assert!(Instant::now() < deadline, "routing file change was not picked up");
        thread::sleep(Duration::from_millis(50));
    }
    assert!(matches!(
        router.get_alias("order", &[]),
        Err(DbError::RouteNotFound(_))
    ));
    drop(watcher);
}

#[test]
fn failed_initialize_keeps_the_remembered_path() {
    let dir = tempfile::tempdir().unwrap();
    let good = write_file(dir.path(), "routes.yaml", ROUTES);
    let bad = write_file(dir.path(), "broken.yaml", "routes: [ {");
    let router = router();
    router.initialize(&good).unwrap();

    assert!(router.initialize(&bad).is_err());

    assert_eq!(router.config_path().as_deref(), Some(good.as_path()));
    router.reload().unwrap();
    assert_eq!(router.get_alias("invoice", &[]).unwrap(), "billing");
    assert_eq!(router.generation(), 2);
}

#[test]
fn reload_waits_for_an_in_flight_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(
        dir.path(),
        "routes.yaml",
        "routes:\n  - entity_type: order\n    strategy: slow\n    \
         settings:\n      alias: old\n",
    );

    // The first build signals and then stalls, so the reload below overlaps it.
    let (entered_tx, entered_rx) = mpsc::channel();
    let mut catalog = StrategyCatalog::with_defaults();
    catalog.register("slow", move |settings| {
        if entered_tx.send(()).is_ok() {
            thread::sleep(Duration::from_millis(200));
        }
        Ok(Arc::new(ConstantStrategy::from_settings(settings)?) as Arc<dyn RoutingStrategy>)
    });
    let router = Arc::new(AliasRouter::new(catalog));

    let first = {
        let router = Arc::clone(&router);
        let path = path.clone();
        thread::spawn(move || router.initialize(&path))
    };
    entered_rx.recv().unwrap();
    write_file(
        dir.path(),
        "routes.yaml",
        "routes:\n  - entity_type: order\n    strategy: constant\n    \
         settings:\n      alias: new\n",
    );
    router.reload().unwrap();
    first.join().unwrap().unwrap();

    assert_eq!(router.get_alias("order", &[]).unwrap(), "new");
    assert_eq!(router.generation(), 2);
}
