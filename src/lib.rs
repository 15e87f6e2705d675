// src/lib.rs

pub mod cli;
pub mod collab;
pub mod config;
pub mod errors;
pub mod ingest;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod sched;
pub mod updater;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, bail};
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::collab::{Fetcher, Ingestor, LocalRegistry, LocalRepository, MemoryStore, Store};
use crate::config::loader::load_and_validate;
use crate::config::model::ConfigFile;
use crate::ingest::IngestSettings;
use crate::sched::{ResourcePool, TaskStatus, to_dot};
use crate::updater::Updater;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - the directory-backed registry and repository
/// - the record store, seeded from the config's wishes
/// - one task tree per wish
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<()> {
    let config_path = PathBuf::from(&args.config);
    let cfg = load_and_validate(&config_path)?;
    let root_dir = config_root_dir(&config_path);
    let settings = resolve_settings(&cfg, &root_dir);

    if args.dry_run {
        print_dry_run(&cfg, &settings)?;
        return Ok(());
    }

    let store = Arc::new(MemoryStore::new());
    for spec in cfg.wish_specs()? {
        store.upsert_wish(spec)?;
    }

    let fetcher: Arc<dyn Fetcher> = Arc::new(LocalRegistry::new(
        root_dir.join(&cfg.storage.registry_root),
        cfg.rate_limit_backoff(),
    ));
    let ingestor: Arc<dyn Ingestor> = Arc::new(LocalRepository::new(
        root_dir.join(&cfg.storage.repository_root),
    ));
    tokio::fs::create_dir_all(&settings.tar_cache_dir).await?;

    let pool = Arc::new(ResourcePool::new());
    let updater = Updater::new(pool, fetcher, ingestor, store.clone(), settings);

    let wish_ids: Vec<u64> = match args.wish {
        Some(id) => vec![id],
        None => store.wishes()?.iter().map(|w| w.id).collect(),
    };
    let roots = wish_ids
        .iter()
        .map(|id| updater.start_wish_update(*id))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    // Ctrl-C → interrupt every running wish update.
    {
        let updater = Arc::clone(&updater);
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            warn!("interrupt requested, aborting wish updates");
            updater.registry().interrupt_all(TaskStatus::Aborted);
        });
    }

    for root in &roots {
        root.wait_done().await;
    }

    for root in &roots {
        println!("{}", root.status_tree());
    }

    if let Some(path) = &args.graph {
        let dot: String = roots.iter().map(to_dot).collect();
        tokio::fs::write(path, dot).await?;
        info!(path = %path.display(), "task graph written");
    }

    let failed: Vec<&str> = roots
        .iter()
        .filter(|r| r.status() != TaskStatus::Success)
        .map(|r| r.name())
        .collect();
    if !failed.is_empty() {
        bail!("{} wish update(s) did not succeed: {}", failed.len(), failed.join(", "));
    }
    Ok(())
}

/// Directory that relative storage paths are resolved against.
///
/// - If the config path has a non-empty parent (e.g. "conf/Ducc.toml"),
///   we use that directory.
/// - If it's just a bare filename like "Ducc.toml" (parent = ""),
///   we fall back to the current working directory "."
fn config_root_dir(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    }
}

fn resolve_settings(cfg: &ConfigFile, root_dir: &Path) -> IngestSettings {
    let mut settings = cfg.ingest_settings();
    settings.tar_cache_dir = root_dir.join(&settings.tar_cache_dir);
    settings
}

/// Print wishes and resource limits without converting anything.
fn print_dry_run(cfg: &ConfigFile, settings: &IngestSettings) -> Result<()> {
    println!("ducc dry-run");
    println!("  scheduler.max_retries = {}", settings.max_retries);
    println!(
        "  scheduler.rate_limit_backoff_secs = {}",
        cfg.scheduler.rate_limit_backoff_secs
    );
    println!("  storage.tar_cache_dir = {}", settings.tar_cache_dir.display());
    println!("  storage.registry_root = {}", cfg.storage.registry_root.display());
    println!("  storage.repository_root = {}", cfg.storage.repository_root.display());
    println!();

    let specs = cfg.wish_specs()?;
    println!("wishes ({}):", specs.len());
    for (index, spec) in specs.iter().enumerate() {
        println!("  - #{} {} -> {}", index + 1, spec.input_uri, spec.cvmfs_repo);
        if spec.input.is_wildcard() {
            println!("      tags matching: {}", spec.input.tag.as_deref().unwrap_or("*"));
        }
    }
    println!();

    let pool = ResourcePool::new();
    for spec in &specs {
        settings.registry_resource(&pool, &spec.input.registry);
        settings.repository_resource(&pool, &spec.cvmfs_repo);
    }
    println!("resources ({}):", pool.len());
    for key in pool.keys() {
        if let Some(resource) = pool.get(&key) {
            println!("  - {key} (capacity {})", resource.capacity());
        }
    }

    debug!("dry-run complete (no conversion)");
    Ok(())
}
