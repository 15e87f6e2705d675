// src/ingest/chain.rs

//! Chain-step ingestion.
//!
//! Step `n` of a chain can only be ingested on top of step `n - 1`. The work
//! for a missing step `n` therefore requests step `n - 1` through the same
//! coordinator first, so images sharing a chain prefix share every prefix
//! step, each ingested once.

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::collab::{BoxFuture, Ingestor};
use crate::ingest::{IngestSettings, TarDownloader, run_exclusive};
use crate::model::{Chain, ImageRef};
use crate::sched::{Artifact, Coordinator, CoordinatorError, Lease, ResourcePool};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChainKey {
    pub repo: String,
    pub chain_id: String,
}

impl fmt::Display for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.repo, self.chain_id)
    }
}

/// A chain step present in the repository.
#[derive(Debug)]
pub struct IngestedStep {
    pub repo: String,
    pub chain_id: String,
    pub parent: Option<String>,
    /// True if the step was already in the repository.
    pub reused: bool,
}

impl Artifact for IngestedStep {}

pub type ChainLease = Lease<ChainKey, IngestedStep>;

pub struct ChainIngester {
    coordinator: Coordinator<ChainKey, IngestedStep>,
    downloader: Arc<TarDownloader>,
    ingestor: Arc<dyn Ingestor>,
    pool: Arc<ResourcePool>,
    settings: IngestSettings,
}

impl ChainIngester {
    pub fn new(
        downloader: Arc<TarDownloader>,
        ingestor: Arc<dyn Ingestor>,
        pool: Arc<ResourcePool>,
        settings: IngestSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            coordinator: Coordinator::new("chain-ingest"),
            downloader,
            ingestor,
            pool,
            settings,
        })
    }

    pub fn coordinator(&self) -> &Coordinator<ChainKey, IngestedStep> {
        &self.coordinator
    }

    pub fn downloader(&self) -> &Arc<TarDownloader> {
        &self.downloader
    }

    /// Lease chain step `step` of `chain` in `repo`, ingesting it and every
    /// missing predecessor step.
    pub fn ingest(
        self: &Arc<Self>,
        repo: &str,
        image: &ImageRef,
        chain: &Arc<Chain>,
        step: usize,
        cancel: &CancellationToken,
    ) -> BoxFuture<'static, Result<ChainLease, CoordinatorError>> {
        let this = Arc::clone(self);
        let repo = repo.to_string();
        let image = image.clone();
        let chain = Arc::clone(chain);
        let cancel = cancel.clone();

        Box::pin(async move {
            let Some(link) = chain.links.get(step) else {
                return Err(CoordinatorError::Failed {
                    key: format!("{repo}/{image}"),
                    message: format!("chain has no step {step}"),
                });
            };
            let key = ChainKey {
                repo: repo.clone(),
                chain_id: link.chain_id.clone(),
            };

            let worker = Arc::clone(&this);
            this.coordinator
                .request(key, &cancel, move |token| async move {
                    worker.ingest_step(repo, image, chain, step, token).await
                })
                .await
        })
    }

    async fn ingest_step(
        self: Arc<Self>,
        repo: String,
        image: ImageRef,
        chain: Arc<Chain>,
        step: usize,
        token: CancellationToken,
    ) -> anyhow::Result<IngestedStep> {
        let link = &chain.links[step];

        // A present step implies all of its predecessors are present.
        if self.ingestor.has_chain_step(&repo, &link.chain_id).await? {
            debug!(repo = %repo, chain_id = %link.chain_id, "chain step already present");
            return Ok(IngestedStep {
                repo,
                chain_id: link.chain_id.clone(),
                parent: link.parent.clone(),
                reused: true,
            });
        }

        // Held until this step is in place.
        let parent_lease = match step {
            0 => None,
            _ => Some(self.ingest(&repo, &image, &chain, step - 1, &token).await?),
        };

        let tar = self.downloader.download(&image, &link.layer, &token).await?;

        let resource = self.settings.repository_resource(&self.pool, &repo);
        run_exclusive(
            &self.pool,
            format!("Ingest chain step {}", link.chain_id),
            resource,
            self.settings.max_retries,
            &token,
            || {
                let ingestor = &self.ingestor;
                let repo = repo.as_str();
                let chain_id = link.chain_id.as_str();
                let parent = link.parent.as_deref();
                let path = tar.path.as_path();
                async move { Ok(ingestor.ingest_chain_step(repo, chain_id, parent, path).await?) }
            },
        )
        .await?;

        drop(tar);
        drop(parent_lease);

        Ok(IngestedStep {
            repo,
            chain_id: link.chain_id.clone(),
            parent: link.parent.clone(),
            reused: false,
        })
    }
}
