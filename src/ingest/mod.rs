// src/ingest/mod.rs

//! The two coordinated operations of a conversion:
//!
//! - `download`: layer tarballs, deduplicated by compressed digest;
//! - `chain`: chain-step ingestion, deduplicated by (repository, chain id).
//!
//! Both run collaborator calls through [`run_exclusive`], so resource limits,
//! rate-limit backoff and retries behave the same everywhere.

pub mod chain;
pub mod download;

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::anyhow;
use tokio_util::sync::CancellationToken;

use crate::sched::{
    CONTAINER_REGISTRY_RESOURCE_PREFIX, CVMFS_REPOSITORY_RESOURCE_PREFIX, Resource, ResourcePool,
    Task, TaskStatus,
};

pub use chain::{ChainIngester, ChainKey, ChainLease, IngestedStep};
pub use download::{LayerTar, TarDownloader, TarLease};

/// Limits and locations shared by downloads and ingestion.
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub max_retries: u32,
    pub registry_concurrency: usize,
    /// Per-host overrides of `registry_concurrency`.
    pub registry_overrides: HashMap<String, usize>,
    pub repository_concurrency: usize,
    pub tar_cache_dir: PathBuf,
}

impl IngestSettings {
    pub fn registry_capacity(&self, host: &str) -> usize {
        self.registry_overrides
            .get(host)
            .copied()
            .unwrap_or(self.registry_concurrency)
    }

    /// The resource limiting concurrent requests to `host`.
    pub fn registry_resource(&self, pool: &ResourcePool, host: &str) -> Arc<Resource> {
        pool.create_or_get_resource(
            &format!("{CONTAINER_REGISTRY_RESOURCE_PREFIX}{host}"),
            self.registry_capacity(host),
        )
    }

    /// The resource limiting concurrent ingestion into `repo`.
    pub fn repository_resource(&self, pool: &ResourcePool, repo: &str) -> Arc<Resource> {
        pool.create_or_get_resource(
            &format!("{CVMFS_REPOSITORY_RESOURCE_PREFIX}{repo}"),
            self.repository_concurrency,
        )
    }
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            registry_concurrency: 4,
            registry_overrides: HashMap::new(),
            repository_concurrency: 1,
            tar_cache_dir: std::env::temp_dir().join("ducc-tars"),
        }
    }
}

/// Run `op` on a dedicated task that holds `resource`.
///
/// Failed attempts are retried up to `max_retries` times; a rate-limit error
/// puts `resource` into backoff first. Cancelling `cancel` interrupts the
/// task and waits for it to wind down.
pub async fn run_exclusive<T, F, Fut>(
    pool: &Arc<ResourcePool>,
    name: String,
    resource: Arc<Resource>,
    max_retries: u32,
    cancel: &CancellationToken,
    mut op: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let task = Task::new(name, pool, max_retries);
    task.add_required_resources([resource])?;

    let value: Mutex<Option<T>> = Mutex::new(None);
    let last_error: Mutex<Option<String>> = Mutex::new(None);

    let run = task.run(|_| {
        let attempt = op();
        let value = &value;
        let last_error = &last_error;
        async move {
            match attempt.await {
                Ok(v) => {
                    *value.lock().unwrap_or_else(PoisonError::into_inner) = Some(v);
                    Ok(())
                }
                Err(err) => {
                    *last_error.lock().unwrap_or_else(PoisonError::into_inner) =
                        Some(format!("{err:#}"));
                    Err(err)
                }
            }
        }
    });
    tokio::pin!(run);

    let status = tokio::select! {
        status = &mut run => status,
        _ = cancel.cancelled() => {
            task.interrupt(TaskStatus::Aborted);
            run.await
        }
    };

    match status {
        TaskStatus::Success => value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| anyhow!("task '{}' succeeded without a result", task.name())),
        TaskStatus::Aborted if cancel.is_cancelled() => {
            Err(anyhow!("task '{}' cancelled", task.name()))
        }
        status => {
            let detail = last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
                .unwrap_or_else(|| format!("finished with {status}"));
            Err(anyhow!(
                "task '{}' failed after {} retries: {detail}",
                task.name(),
                task.retries()
            ))
        }
    }
}
