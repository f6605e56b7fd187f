#![allow(clippy::unwrap_used, clippy::expect_used)]

//! CLI smoke tests for the shardkit binary.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::TempDir;

fn run_shardkit(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_shardkit"))
        .args(args)
        .env_remove("RUST_LOG")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .expect("Failed to execute shardkit")
}

fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

struct Fixture {
    _dir: TempDir,
    registry: String,
    routes: String,
}

fn fixture(routes: &str) -> Fixture {
    let dir = TempDir::new().unwrap();
    let registry = write(
        dir.path(),
        "backends.yaml",
        "backends:\n  - alias: A\n  - alias: b\n    read_only: true\n",
    );
    let routes = write(dir.path(), "routes.yaml", routes);
    Fixture {
        registry: registry.to_string_lossy().into_owned(),
        routes: routes.to_string_lossy().into_owned(),
        _dir: dir,
    }
}

const ROUTES: &str = "routes:\n  - entity_type: order\n    strategy: modulo\n    \
                      settings:\n      aliases: [a, b]\n";

#[test]
fn test_cli_help_command() {
    let output = run_shardkit(&["--help"]);

    assert!(output.status.success(), "Help command should succeed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Usage:"), "Should contain usage information");
    for cmd in ["check", "backends", "route", "aliases"] {
        assert!(stdout.contains(cmd), "Should list '{cmd}' subcommand");
    }
}

#[test]
fn test_check_accepts_consistent_configuration() {
    let f = fixture(ROUTES);
    let output = run_shardkit(&["--registry", &f.registry, "--routes", &f.routes, "check"]);

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Configuration is valid"));
    assert!(stdout.contains("2 backends, 1 routing rules"));
}

#[test]
fn test_check_rejects_route_to_unknown_backend() {
    let f = fixture(
        "routes:\n  - entity_type: order\n    strategy: constant\n    \
         settings:\n      alias: c\n",
    );
    let output = run_shardkit(&["--registry", &f.registry, "--routes", &f.routes, "check"]);

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("order -> c"));
}

#[test]
fn test_backends_lists_modes() {
    let f = fixture(ROUTES);
    let output = run_shardkit(&["--registry", &f.registry, "backends"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<_> = stdout.lines().collect();
    assert_eq!(lines, vec!["a\tmemory\tread-write", "b\tmemory\tread-only"]);
}

#[test]
fn test_route_and_aliases() {
    let f = fixture(ROUTES);

    let output = run_shardkit(&["--routes", &f.routes, "route", "--entity", "order", "--key", "3"]);
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "b");

    let output = run_shardkit(&["--routes", &f.routes, "aliases", "--entity", "order"]);
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).lines().collect::<Vec<_>>(), vec!["a", "b"]);

    let output = run_shardkit(&["--routes", &f.routes, "route", "--entity", "invoice"]);
    assert!(!output.status.success());
}

#[test]
fn test_missing_registry_fails() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("absent.yaml");
    let output = run_shardkit(&["--registry", missing.to_str().unwrap(), "backends"]);

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("invalid backend registry"));
}
