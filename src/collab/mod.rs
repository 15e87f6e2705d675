// src/collab/mod.rs

//! Contracts for the external collaborators the scheduler talks to.
//!
//! - [`Fetcher`]: the container registry (tags, manifests, layer tarballs).
//! - [`Ingestor`]: the CVMFS repository (chain steps, published images).
//! - [`Store`]: persistence of wishes, images and manifests.
//!
//! Directory-backed implementations live in [`local`], an in-memory store in
//! [`memory`].

pub mod local;
pub mod memory;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use globset::Glob;
use thiserror::Error;

use crate::model::{ImageRecord, ImageRef, LayerDescriptor, Manifest, Wish, WishSpec};

pub use local::{LocalRegistry, LocalRepository};
pub use memory::MemoryStore;

/// Boxed future returned by collaborator methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum CollabError {
    /// The collaborator asked us to slow down.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid data: {0}")]
    Invalid(String),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for CollabError {
    fn from(err: serde_json::Error) -> Self {
        CollabError::Invalid(err.to_string())
    }
}

/// A layer tarball placed on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedTarball {
    pub path: PathBuf,
    /// `blake3:<hex>` of the bytes written.
    pub content_hash: String,
}

/// Container registry access.
pub trait Fetcher: Send + Sync {
    /// Tags of `image`'s repository matching the glob `pattern`.
    fn fetch_tags<'a>(
        &'a self,
        image: &'a ImageRef,
        pattern: &'a str,
    ) -> BoxFuture<'a, Result<Vec<String>, CollabError>>;

    fn fetch_manifest<'a>(
        &'a self,
        image: &'a ImageRef,
    ) -> BoxFuture<'a, Result<Manifest, CollabError>>;

    /// Download `layer` of `image` to `dest`.
    fn fetch_tarball<'a>(
        &'a self,
        image: &'a ImageRef,
        layer: &'a LayerDescriptor,
        dest: &'a Path,
    ) -> BoxFuture<'a, Result<FetchedTarball, CollabError>>;
}

/// CVMFS repository access. Every call is all-or-nothing.
pub trait Ingestor: Send + Sync {
    fn has_chain_step<'a>(
        &'a self,
        repo: &'a str,
        chain_id: &'a str,
    ) -> BoxFuture<'a, Result<bool, CollabError>>;

    fn ingest_chain_step<'a>(
        &'a self,
        repo: &'a str,
        chain_id: &'a str,
        parent: Option<&'a str>,
        tarball: &'a Path,
    ) -> BoxFuture<'a, Result<(), CollabError>>;

    /// Manifest of `image` as last published into `repo`, if any.
    fn published_manifest<'a>(
        &'a self,
        repo: &'a str,
        image: &'a ImageRef,
    ) -> BoxFuture<'a, Result<Option<Manifest>, CollabError>>;

    /// Record `image` as converted, with its filesystem at `chain_id`.
    fn publish_image<'a>(
        &'a self,
        repo: &'a str,
        image: &'a ImageRef,
        manifest: &'a Manifest,
        chain_id: &'a str,
    ) -> BoxFuture<'a, Result<(), CollabError>>;
}

/// Persistence of wishes, images and their links.
pub trait Store: Send + Sync {
    fn wishes(&self) -> Result<Vec<Wish>, CollabError>;

    fn wish(&self, id: u64) -> Result<Option<Wish>, CollabError>;

    /// Insert a wish, or return the existing one with the same repository
    /// and input.
    fn upsert_wish(&self, spec: WishSpec) -> Result<Wish, CollabError>;

    fn upsert_image(&self, image: &ImageRef) -> Result<ImageRecord, CollabError>;

    fn images_for_wish(&self, wish_id: u64) -> Result<Vec<ImageRecord>, CollabError>;

    fn link_image(&self, wish_id: u64, image_id: u64) -> Result<(), CollabError>;

    fn unlink_image(&self, wish_id: u64, image_id: u64) -> Result<(), CollabError>;

    fn set_manifest(&self, image_id: u64, manifest: &Manifest) -> Result<(), CollabError>;

    fn manifest(&self, image_id: u64) -> Result<Option<Manifest>, CollabError>;
}

/// Keep the tags matching the glob `pattern`, sorted.
pub fn filter_tags<I, S>(tags: I, pattern: &str) -> Result<Vec<String>, CollabError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let matcher = Glob::new(pattern)
        .map_err(|e| CollabError::Invalid(format!("bad tag pattern '{pattern}': {e}")))?
        .compile_matcher();
    let mut matched: Vec<String> = tags
        .into_iter()
        .map(Into::into)
        .filter(|t| matcher.is_match(t.as_str()))
        .collect();
    matched.sort();
    matched.dedup();
    Ok(matched)
}

/// `blake3:<hex>` of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("blake3:{}", blake3::hash(bytes).to_hex())
}
