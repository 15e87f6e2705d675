// src/ingest/download.rs

//! Layer tarball downloads, one per compressed digest no matter how many
//! chain steps or images ask for it.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::collab::Fetcher;
use crate::ingest::{IngestSettings, run_exclusive};
use crate::model::{ImageRef, LayerDescriptor, digest_hex};
use crate::sched::{Artifact, Coordinator, CoordinatorError, Lease, ResourcePool};

/// A downloaded tarball in the local cache. Deleted with its last lease.
#[derive(Debug)]
pub struct LayerTar {
    pub digest: String,
    pub path: PathBuf,
    pub content_hash: String,
}

impl Artifact for LayerTar {
    fn cleanup(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(digest = %self.digest, path = %self.path.display(), "tarball removed"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                warn!(digest = %self.digest, path = %self.path.display(), error = %err, "failed to remove tarball")
            }
        }
    }
}

pub type TarLease = Lease<String, LayerTar>;

pub struct TarDownloader {
    coordinator: Coordinator<String, LayerTar>,
    fetcher: Arc<dyn Fetcher>,
    pool: Arc<ResourcePool>,
    settings: IngestSettings,
    sequence: AtomicU64,
}

impl TarDownloader {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        pool: Arc<ResourcePool>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            coordinator: Coordinator::new("tar-download"),
            fetcher,
            pool,
            settings,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn coordinator(&self) -> &Coordinator<String, LayerTar> {
        &self.coordinator
    }

    /// Lease the tarball of `layer`, downloading it unless a download for
    /// the same digest is in flight or still leased.
    pub async fn download(
        &self,
        image: &ImageRef,
        layer: &LayerDescriptor,
        cancel: &CancellationToken,
    ) -> Result<TarLease, CoordinatorError> {
        let fetcher = Arc::clone(&self.fetcher);
        let pool = Arc::clone(&self.pool);
        let resource = self.settings.registry_resource(&self.pool, &image.registry);
        let max_retries = self.settings.max_retries;
        let image = image.clone();
        let layer = layer.clone();
        // Each execution writes its own file, so a late cleanup of a previous
        // generation cannot remove a fresh download.
        let dest = self.settings.tar_cache_dir.join(format!(
            "{}-{}.tar",
            digest_hex(&layer.digest),
            self.sequence.fetch_add(1, Ordering::Relaxed)
        ));

        self.coordinator
            .request(layer.digest.clone(), cancel, move |token| async move {
                let fetched = run_exclusive(
                    &pool,
                    format!("Download layer {}", layer.digest),
                    resource,
                    max_retries,
                    &token,
                    || {
                        let fetcher = &fetcher;
                        let (image, layer, dest) = (&image, &layer, &dest);
                        async move { Ok(fetcher.fetch_tarball(image, layer, dest).await?) }
                    },
                )
                .await?;

                Ok(LayerTar {
                    digest: layer.digest.clone(),
                    path: fetched.path,
                    content_hash: fetched.content_hash,
                })
            })
            .await
    }
}
