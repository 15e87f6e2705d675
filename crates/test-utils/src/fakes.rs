//! In-memory collaborators with call counters and fault injection.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ducc::collab::{
    BoxFuture, CollabError, FetchedTarball, Fetcher, Ingestor, content_hash, filter_tags,
};
use ducc::model::{ImageRef, LayerDescriptor, Manifest};

/// A scripted outcome for the next call on a key.
#[derive(Debug, Clone)]
pub enum Fault {
    RateLimited(Duration),
    Fail(String),
}

impl Fault {
    fn into_error(self) -> CollabError {
        match self {
            Fault::RateLimited(retry_after) => CollabError::RateLimited { retry_after },
            Fault::Fail(message) => CollabError::Other(message),
        }
    }
}

/// Per-key counters, latency, scripted faults and a concurrency gauge.
#[derive(Debug, Default)]
struct Instrumentation {
    calls: Mutex<HashMap<String, usize>>,
    faults: Mutex<HashMap<String, VecDeque<Fault>>>,
    latency: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Instrumentation {
    /// Count the call, wait out the latency and pop a scripted fault.
    async fn enter(&self, key: &str) -> Result<(), CollabError> {
        *self.calls.lock().unwrap().entry(key.to_string()).or_default() += 1;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let fault = self
            .faults
            .lock()
            .unwrap()
            .get_mut(key)
            .and_then(VecDeque::pop_front);
        match fault {
            Some(fault) => Err(fault.into_error()),
            None => Ok(()),
        }
    }

    fn calls(&self, key: &str) -> usize {
        self.calls.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    fn inject(&self, key: &str, fault: Fault) {
        self.faults
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push_back(fault);
    }
}

pub fn tags_key(image: &ImageRef) -> String {
    format!("tags:{}", image.repository_key())
}

pub fn manifest_key(image: &ImageRef) -> String {
    format!("manifest:{image}")
}

pub fn tarball_key(digest: &str) -> String {
    format!("tarball:{digest}")
}

pub fn ingest_key(repo: &str, chain_id: &str) -> String {
    format!("ingest:{repo}/{chain_id}")
}

/// Registry fake. Images are keyed by their full reference.
#[derive(Debug, Default)]
pub struct FakeFetcher {
    tags: Mutex<HashMap<String, Vec<String>>>,
    manifests: Mutex<HashMap<String, Manifest>>,
    instruments: Instrumentation,
}

impl FakeFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serve `manifest` for `image` and list its tag.
    pub fn add_image(&self, image: &str, manifest: Manifest) -> ImageRef {
        let image = ImageRef::parse(image).expect("valid image reference");
        if let Some(tag) = &image.tag {
            self.tags
                .lock()
                .unwrap()
                .entry(image.repository_key())
                .or_default()
                .push(tag.clone());
        }
        self.manifests
            .lock()
            .unwrap()
            .insert(image.to_string(), manifest);
        image
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.instruments.latency.lock().unwrap() = latency;
    }

    /// Make the next call on `key` fail with `fault`. Faults queue up.
    pub fn inject(&self, key: &str, fault: Fault) {
        self.instruments.inject(key, fault);
    }

    pub fn calls(&self, key: &str) -> usize {
        self.instruments.calls(key)
    }

    /// Highest number of calls observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.instruments.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Fetcher for FakeFetcher {
    fn fetch_tags<'a>(
        &'a self,
        image: &'a ImageRef,
        pattern: &'a str,
    ) -> BoxFuture<'a, Result<Vec<String>, CollabError>> {
        Box::pin(async move {
            self.instruments.enter(&tags_key(image)).await?;
            let tags = self
                .tags
                .lock()
                .unwrap()
                .get(&image.repository_key())
                .cloned()
                .unwrap_or_default();
            filter_tags(tags, pattern)
        })
    }

    fn fetch_manifest<'a>(
        &'a self,
        image: &'a ImageRef,
    ) -> BoxFuture<'a, Result<Manifest, CollabError>> {
        Box::pin(async move {
            self.instruments.enter(&manifest_key(image)).await?;
            self.manifests
                .lock()
                .unwrap()
                .get(&image.to_string())
                .cloned()
                .ok_or_else(|| CollabError::NotFound(format!("manifest for {image}")))
        })
    }

    fn fetch_tarball<'a>(
        &'a self,
        _image: &'a ImageRef,
        layer: &'a LayerDescriptor,
        dest: &'a Path,
    ) -> BoxFuture<'a, Result<FetchedTarball, CollabError>> {
        Box::pin(async move {
            self.instruments.enter(&tarball_key(&layer.digest)).await?;
            let bytes = layer.digest.as_bytes();
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(dest, bytes).await?;
            Ok(FetchedTarball {
                path: dest.to_path_buf(),
                content_hash: content_hash(bytes),
            })
        })
    }
}

/// A published image as seen by [`FakeIngestor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub manifest: Manifest,
    pub chain_id: String,
}

/// Repository fake. Records every ingested step in order.
#[derive(Debug, Default)]
pub struct FakeIngestor {
    steps: Mutex<BTreeMap<(String, String), Option<String>>>,
    order: Mutex<Vec<(String, String)>>,
    published: Mutex<HashMap<(String, String), Published>>,
    instruments: Instrumentation,
}

impl FakeIngestor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Pretend `chain_id` is already present in `repo`.
    pub fn add_step(&self, repo: &str, chain_id: &str) {
        self.steps
            .lock()
            .unwrap()
            .insert((repo.to_string(), chain_id.to_string()), None);
    }

    pub fn publish(&self, repo: &str, image: &ImageRef, manifest: Manifest, chain_id: &str) {
        self.published.lock().unwrap().insert(
            (repo.to_string(), image.to_string()),
            Published {
                manifest,
                chain_id: chain_id.to_string(),
            },
        );
    }

    /// `(repo, chain id)` of every ingestion, in completion order.
    pub fn ingested(&self) -> Vec<(String, String)> {
        self.order.lock().unwrap().clone()
    }

    pub fn has_step(&self, repo: &str, chain_id: &str) -> bool {
        self.steps
            .lock()
            .unwrap()
            .contains_key(&(repo.to_string(), chain_id.to_string()))
    }

    pub fn published(&self, repo: &str, image: &ImageRef) -> Option<Published> {
        self.published
            .lock()
            .unwrap()
            .get(&(repo.to_string(), image.to_string()))
            .cloned()
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.instruments.latency.lock().unwrap() = latency;
    }

    pub fn inject(&self, key: &str, fault: Fault) {
        self.instruments.inject(key, fault);
    }

    pub fn calls(&self, key: &str) -> usize {
        self.instruments.calls(key)
    }

    pub fn max_in_flight(&self) -> usize {
        self.instruments.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Ingestor for FakeIngestor {
    fn has_chain_step<'a>(
        &'a self,
        repo: &'a str,
        chain_id: &'a str,
    ) -> BoxFuture<'a, Result<bool, CollabError>> {
        Box::pin(async move { Ok(self.has_step(repo, chain_id)) })
    }

    fn ingest_chain_step<'a>(
        &'a self,
        repo: &'a str,
        chain_id: &'a str,
        parent: Option<&'a str>,
        tarball: &'a Path,
    ) -> BoxFuture<'a, Result<(), CollabError>> {
        Box::pin(async move {
            self.instruments.enter(&ingest_key(repo, chain_id)).await?;
            if let Some(parent) = parent
                && !self.has_step(repo, parent)
            {
                return Err(CollabError::Invalid(format!(
                    "parent step {parent} missing for {chain_id}"
                )));
            }
            if !tarball.exists() {
                return Err(CollabError::NotFound(format!(
                    "tarball {}",
                    tarball.display()
                )));
            }
            self.steps.lock().unwrap().insert(
                (repo.to_string(), chain_id.to_string()),
                parent.map(str::to_string),
            );
            self.order
                .lock()
                .unwrap()
                .push((repo.to_string(), chain_id.to_string()));
            Ok(())
        })
    }

    fn published_manifest<'a>(
        &'a self,
        repo: &'a str,
        image: &'a ImageRef,
    ) -> BoxFuture<'a, Result<Option<Manifest>, CollabError>> {
        Box::pin(async move { Ok(self.published(repo, image).map(|p| p.manifest)) })
    }

    fn publish_image<'a>(
        &'a self,
        repo: &'a str,
        image: &'a ImageRef,
        manifest: &'a Manifest,
        chain_id: &'a str,
    ) -> BoxFuture<'a, Result<(), CollabError>> {
        Box::pin(async move {
            if !self.has_step(repo, chain_id) {
                return Err(CollabError::Invalid(format!(
                    "cannot publish {image}: chain {chain_id} missing"
                )));
            }
            self.publish(repo, image, manifest.clone(), chain_id);
            Ok(())
        })
    }
}
