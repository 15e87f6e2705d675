// src/collab/local.rs

//! Directory-backed registry and repository.
//!
//! Registry layout (the registry host of an image is not part of the path):
//!
//! ```text
//! <root>/<repository>/tags/<tag>            manifest JSON
//! <root>/<repository>/manifests/<hex>       manifest JSON for digest-pinned images
//! <root>/<repository>/RATE_LIMIT            optional, seconds; consumed on first hit
//! <root>/blobs/<hex>                        layer tarballs
//! ```
//!
//! Repository layout:
//!
//! ```text
//! <root>/<repo>/.chains/<xx>/<hex>/layer.tar
//! <root>/<repo>/.chains/<xx>/<hex>/parent
//! <root>/<repo>/.metadata/<repository:tag>/manifest.json
//! <root>/<repo>/.metadata/<repository:tag>/chain
//! ```

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;
use tracing::{debug, info, warn};

use crate::collab::{
    BoxFuture, CollabError, FetchedTarball, Fetcher, Ingestor, content_hash, filter_tags,
};
use crate::model::{ImageRef, LayerDescriptor, Manifest, digest_hex};

const RATE_LIMIT_FILE: &str = "RATE_LIMIT";

/// Registry served from a local directory tree.
#[derive(Debug, Clone)]
pub struct LocalRegistry {
    root: PathBuf,
    default_backoff: Duration,
}

impl LocalRegistry {
    pub fn new(root: impl Into<PathBuf>, default_backoff: Duration) -> Self {
        Self {
            root: root.into(),
            default_backoff,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn repository_dir(&self, image: &ImageRef) -> PathBuf {
        self.root.join(&image.repository)
    }

    /// Consume a pending `RATE_LIMIT` marker for `image`'s repository.
    async fn check_rate_limit(&self, image: &ImageRef) -> Result<(), CollabError> {
        let marker = self.repository_dir(image).join(RATE_LIMIT_FILE);
        let contents = match fs::read_to_string(&marker).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        fs::remove_file(&marker).await?;

        let retry_after = contents
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .unwrap_or(self.default_backoff);
        warn!(repository = %image.repository, ?retry_after, "registry signalled rate limiting");
        Err(CollabError::RateLimited { retry_after })
    }

    async fn read_manifest(&self, path: &Path) -> Result<Manifest, CollabError> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(CollabError::NotFound(format!(
                    "manifest {}",
                    path.display()
                )));
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }
}

impl Fetcher for LocalRegistry {
    fn fetch_tags<'a>(
        &'a self,
        image: &'a ImageRef,
        pattern: &'a str,
    ) -> BoxFuture<'a, Result<Vec<String>, CollabError>> {
        Box::pin(async move {
            self.check_rate_limit(image).await?;

            let dir = self.repository_dir(image).join("tags");
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    return Err(CollabError::NotFound(format!(
                        "repository {}",
                        image.repository_key()
                    )));
                }
                Err(err) => return Err(err.into()),
            };

            let mut tags = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                if let Some(name) = entry.file_name().to_str() {
                    tags.push(name.to_string());
                }
            }
            debug!(repository = %image.repository, count = tags.len(), "listed tags");
            filter_tags(tags, pattern)
        })
    }

    fn fetch_manifest<'a>(
        &'a self,
        image: &'a ImageRef,
    ) -> BoxFuture<'a, Result<Manifest, CollabError>> {
        Box::pin(async move {
            self.check_rate_limit(image).await?;

            let dir = self.repository_dir(image);
            let path = match (&image.digest, &image.tag) {
                (Some(digest), _) => dir.join("manifests").join(digest_hex(digest)),
                (None, Some(tag)) => dir.join("tags").join(tag),
                (None, None) => {
                    return Err(CollabError::Invalid(format!(
                        "image {image} has neither tag nor digest"
                    )));
                }
            };
            self.read_manifest(&path).await
        })
    }

    fn fetch_tarball<'a>(
        &'a self,
        image: &'a ImageRef,
        layer: &'a LayerDescriptor,
        dest: &'a Path,
    ) -> BoxFuture<'a, Result<FetchedTarball, CollabError>> {
        Box::pin(async move {
            self.check_rate_limit(image).await?;

            let blob = self.root.join("blobs").join(digest_hex(&layer.digest));
            let bytes = match fs::read(&blob).await {
                Ok(bytes) => bytes,
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    return Err(CollabError::NotFound(format!("blob {}", layer.digest)));
                }
                Err(err) => return Err(err.into()),
            };

            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).await?;
            }
            let staging = dest.with_extension("partial");
            if let Err(err) = write_staged(&staging, dest, &bytes).await {
                if let Err(cleanup) = fs::remove_file(&staging).await
                    && cleanup.kind() != ErrorKind::NotFound
                {
                    warn!(path = %staging.display(), error = %cleanup, "could not remove partial tarball");
                }
                return Err(err.into());
            }

            debug!(digest = %layer.digest, dest = %dest.display(), bytes = bytes.len(), "tarball fetched");
            Ok(FetchedTarball {
                path: dest.to_path_buf(),
                content_hash: content_hash(&bytes),
            })
        })
    }
}

/// Write `bytes` to `staging`, then move it to `dest`.
async fn write_staged(staging: &Path, dest: &Path, bytes: &[u8]) -> std::io::Result<()> {
    fs::write(staging, bytes).await?;
    fs::rename(staging, dest).await
}

/// Repository backed by a local directory tree.
#[derive(Debug, Clone)]
pub struct LocalRepository {
    root: PathBuf,
}

impl LocalRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of one chain step.
    pub fn chain_dir(&self, repo: &str, chain_id: &str) -> PathBuf {
        let hex = digest_hex(chain_id);
        let prefix = hex.get(..2).unwrap_or(hex);
        self.root
            .join(repo)
            .join(".chains")
            .join(prefix)
            .join(hex)
    }

    fn metadata_dir(&self, repo: &str, image: &ImageRef) -> PathBuf {
        self.root
            .join(repo)
            .join(".metadata")
            .join(image.simple_name())
    }
}

impl Ingestor for LocalRepository {
    fn has_chain_step<'a>(
        &'a self,
        repo: &'a str,
        chain_id: &'a str,
    ) -> BoxFuture<'a, Result<bool, CollabError>> {
        Box::pin(async move { Ok(fs::try_exists(self.chain_dir(repo, chain_id)).await?) })
    }

    fn ingest_chain_step<'a>(
        &'a self,
        repo: &'a str,
        chain_id: &'a str,
        parent: Option<&'a str>,
        tarball: &'a Path,
    ) -> BoxFuture<'a, Result<(), CollabError>> {
        Box::pin(async move {
            if let Some(parent) = parent
                && !fs::try_exists(self.chain_dir(repo, parent)).await?
            {
                return Err(CollabError::Invalid(format!(
                    "parent chain step {parent} is not ingested"
                )));
            }

            let target = self.chain_dir(repo, chain_id);
            let staging = target.with_extension("partial");
            if fs::try_exists(&staging).await? {
                fs::remove_dir_all(&staging).await?;
            }
            fs::create_dir_all(&staging).await?;
            fs::copy(tarball, staging.join("layer.tar")).await?;
            fs::write(staging.join("parent"), parent.unwrap_or("")).await?;

            if fs::try_exists(&target).await? {
                // Someone else completed the same step; keep theirs.
                fs::remove_dir_all(&staging).await?;
            } else {
                fs::rename(&staging, &target).await?;
            }

            info!(repo, chain_id, "chain step ingested");
            Ok(())
        })
    }

    fn published_manifest<'a>(
        &'a self,
        repo: &'a str,
        image: &'a ImageRef,
    ) -> BoxFuture<'a, Result<Option<Manifest>, CollabError>> {
        Box::pin(async move {
            let path = self.metadata_dir(repo, image).join("manifest.json");
            match fs::read(&path).await {
                Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
                Err(err) => Err(err.into()),
            }
        })
    }

    fn publish_image<'a>(
        &'a self,
        repo: &'a str,
        image: &'a ImageRef,
        manifest: &'a Manifest,
        chain_id: &'a str,
    ) -> BoxFuture<'a, Result<(), CollabError>> {
        Box::pin(async move {
            let dir = self.metadata_dir(repo, image);
            fs::create_dir_all(&dir).await?;
            fs::write(dir.join("manifest.json"), serde_json::to_vec_pretty(manifest)?).await?;
            fs::write(dir.join("chain"), chain_id).await?;
            info!(repo, image = %image, chain_id, "image published");
            Ok(())
        })
    }
}
