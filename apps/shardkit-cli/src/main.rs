// CLI tools are expected to print to stdout/stderr
#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shardkit_db::{AliasRouter, BackendRegistry, FileRegistryInitializer, RouteKey, StrategyCatalog};
use tracing_subscriber::EnvFilter;

/// ShardKit - inspect backend registry and alias routing configuration
#[derive(Parser)]
#[command(name = "shardkit")]
#[command(about = "ShardKit - inspect backend registry and alias routing configuration")]
#[command(version)]
struct Cli {
    /// Backend registry file (YAML or JSON)
    #[arg(long, default_value = "config/backends.yaml")]
    registry: PathBuf,

    /// Routing rules file (YAML or JSON); a missing file means no rules
    #[arg(long, default_value = "config/routes.yaml")]
    routes: PathBuf,

    /// Log verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load both files, cross-check routed aliases against the registry and exit
    Check,
    /// List configured backends
    Backends,
    /// Resolve the alias for an entity type and key values
    Route {
        #[arg(long)]
        entity: String,
        /// Key value; integers and UUIDs are detected, anything else is a string
        #[arg(long = "key")]
        keys: Vec<String>,
    },
    /// List every alias an entity type can be routed to
    Aliases {
        #[arg(long)]
        entity: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match &cli.command {
        Commands::Check => check(&cli.registry, &cli.routes),
        Commands::Backends => backends(&cli.registry),
        Commands::Route { entity, keys } => {
            let keys: Vec<RouteKey> = keys.iter().map(|k| parse_key(k)).collect();
            let alias = load_router(&cli.routes)?.get_alias(entity, &keys)?;
            println!("{alias}");
            Ok(())
        }
        Commands::Aliases { entity } => {
            for alias in load_router(&cli.routes)?.get_aliases(entity)? {
                println!("{alias}");
            }
            Ok(())
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_registry(path: &Path) -> Result<BackendRegistry> {
    let registry = BackendRegistry::new(Arc::new(FileRegistryInitializer::new(path)));
    registry
        .initialize()
        .with_context(|| format!("invalid backend registry {}", path.display()))?;
    Ok(registry)
}

fn load_router(path: &Path) -> Result<AliasRouter> {
    let router = AliasRouter::new(StrategyCatalog::with_defaults());
    router
        .initialize(path)
        .with_context(|| format!("invalid routing rules {}", path.display()))?;
    Ok(router)
}

fn check(registry_path: &Path, routes_path: &Path) -> Result<()> {
    tracing::info!("Checking configuration...");
    let registry = load_registry(registry_path)?;
    let router = load_router(routes_path)?;
    let rules = router.rules();

    let mut dangling = Vec::new();
    for entity_type in rules.entity_types() {
        for alias in router.get_aliases(entity_type)? {
            if registry.get_handle(&alias).is_err() {
                dangling.push(format!("{entity_type} -> {alias}"));
            }
        }
    }
    if !dangling.is_empty() {
        anyhow::bail!("routes point at unknown backends: {}", dangling.join(", "));
    }

    println!("Configuration is valid");
    println!("{} backends, {} routing rules", registry.len(), rules.len());
    Ok(())
}

fn backends(path: &Path) -> Result<()> {
    let registry = load_registry(path)?;
    for alias in registry.aliases()? {
        let handle = registry.get_handle(&alias)?;
        let mode = if handle.is_read_only() { "read-only" } else { "read-write" };
        println!("{alias}\t{}\t{mode}", handle.config().driver);
    }
    Ok(())
}

fn parse_key(raw: &str) -> RouteKey {
    if let Ok(v) = raw.parse::<i64>() {
        RouteKey::Int(v)
    } else if let Ok(v) = raw.parse::<u64>() {
        RouteKey::Uint(v)
    } else if let Ok(v) = raw.parse::<uuid::Uuid>() {
        RouteKey::Uuid(v)
    } else {
        RouteKey::Str(raw.to_owned())
    }
}
