// src/model.rs

//! Domain values shared by the scheduler, the collaborators and the updater:
//! image references, manifests, layer chains and wishes.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::DuccError;

/// Media type of layers that must not be redistributed (and are skipped when
/// building chains).
pub const FOREIGN_LAYER_MEDIA_TYPE: &str =
    "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";

/// Tag used when an input names neither a tag nor a digest.
pub const DEFAULT_TAG: &str = "latest";

static IMAGE_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:(?P<scheme>[a-zA-Z][a-zA-Z0-9+.-]*)://)?(?P<registry>[^/@:]+(?::[0-9]+)?)/(?P<repository>[^:@]+?)/?(?::(?P<tag>[^:@/]+))?(?:@(?P<digest>[a-z0-9]+:[0-9a-fA-F]{32,}))?$",
    )
    .expect("image reference regex is valid")
});

/// A parsed image reference: `[scheme://]registry/repository[:tag][@digest]`.
///
/// The tag may be a glob (`*`, `?`, `[...]`), in which case the reference is
/// a wildcard that has to be expanded against the registry's tag list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    pub scheme: String,
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageRef {
    pub fn parse(input: &str) -> Result<Self, DuccError> {
        let input = input.trim();
        let caps = IMAGE_REF_RE
            .captures(input)
            .ok_or_else(|| DuccError::InvalidImageRef(input.to_string()))?;

        let scheme = caps
            .name("scheme")
            .map(|m| m.as_str().to_lowercase())
            .unwrap_or_else(|| "https".to_string());
        if scheme != "http" && scheme != "https" {
            return Err(DuccError::InvalidImageRef(format!(
                "unsupported protocol '{scheme}' in '{input}'"
            )));
        }

        let repository = caps["repository"].trim_matches('/').to_string();
        if repository.is_empty() {
            return Err(DuccError::InvalidImageRef(format!(
                "no repository in '{input}'"
            )));
        }

        let digest = caps.name("digest").map(|m| m.as_str().to_string());
        // A digest takes precedence over the tag.
        let tag = match (&digest, caps.name("tag")) {
            (Some(_), _) => None,
            (None, Some(tag)) => Some(tag.as_str().to_string()),
            (None, None) => Some(DEFAULT_TAG.to_string()),
        };

        Ok(Self {
            scheme,
            registry: caps["registry"].to_string(),
            repository,
            tag,
            digest,
        })
    }

    /// True if the tag is a glob pattern.
    pub fn is_wildcard(&self) -> bool {
        self.digest.is_none()
            && self
                .tag
                .as_deref()
                .is_some_and(|t| t.contains(['*', '?', '[']))
    }

    /// Same image with a concrete tag.
    pub fn with_tag(&self, tag: &str) -> Self {
        Self {
            tag: Some(tag.to_string()),
            digest: None,
            ..self.clone()
        }
    }

    /// `registry/repository`, the key used for tag listings.
    pub fn repository_key(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// `repository:tag` or `repository@digest`, without the registry.
    pub fn simple_name(&self) -> String {
        match (&self.tag, &self.digest) {
            (_, Some(digest)) => format!("{}@{digest}", self.repository),
            (Some(tag), None) => format!("{}:{tag}", self.repository),
            (None, None) => self.repository.clone(),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

impl FromStr for ImageRef {
    type Err = DuccError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A content descriptor as found in an image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub size: u64,
}

/// A layer entry of an image manifest.
///
/// `diff_id` is the digest of the uncompressed layer (taken from the image
/// config); when absent, the compressed digest stands in for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerDescriptor {
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_id: Option<String>,
}

impl LayerDescriptor {
    pub fn is_foreign(&self) -> bool {
        self.media_type == FOREIGN_LAYER_MEDIA_TYPE
    }

    pub fn diff_id(&self) -> &str {
        self.diff_id.as_deref().unwrap_or(&self.digest)
    }
}

/// Image manifest (schema 2 shape).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: String,
    pub config: Descriptor,
    pub layers: Vec<LayerDescriptor>,
}

impl Manifest {
    /// Layers that take part in the chain (foreign layers excluded).
    pub fn chain_layers(&self) -> impl Iterator<Item = &LayerDescriptor> {
        self.layers.iter().filter(|l| !l.is_foreign())
    }
}

/// One step of a layer chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainLink {
    pub chain_id: String,
    pub parent: Option<String>,
    pub layer: LayerDescriptor,
}

/// Ordered chain of layers: step `i` is the filesystem after applying
/// layers `0..=i`.
///
/// - `chain_id[0] = diff_id[0]`
/// - `chain_id[i] = "blake3:" + hex(BLAKE3(chain_id[i-1] + " " + diff_id[i]))`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chain {
    pub links: Vec<ChainLink>,
}

impl Chain {
    pub fn from_manifest(manifest: &Manifest) -> Self {
        let mut links: Vec<ChainLink> = Vec::with_capacity(manifest.layers.len());
        for layer in manifest.chain_layers() {
            let parent = links.last().map(|l| l.chain_id.clone());
            let chain_id = match &parent {
                None => layer.diff_id().to_string(),
                Some(prev) => {
                    let mut hasher = blake3::Hasher::new();
                    hasher.update(prev.as_bytes());
                    hasher.update(b" ");
                    hasher.update(layer.diff_id().as_bytes());
                    format!("blake3:{}", hasher.finalize().to_hex())
                }
            };
            links.push(ChainLink {
                chain_id,
                parent,
                layer: layer.clone(),
            });
        }
        Self { links }
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Identifier of the full image filesystem.
    pub fn top(&self) -> Option<&str> {
        self.links.last().map(|l| l.chain_id.as_str())
    }
}

/// Strip the algorithm prefix of a digest (`sha256:abcd` -> `abcd`).
pub fn digest_hex(digest: &str) -> &str {
    digest.split_once(':').map_or(digest, |(_, hex)| hex)
}

/// A request to keep an image (or a set of tags) converted in a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Wish {
    pub id: u64,
    pub cvmfs_repo: String,
    pub input_uri: String,
    pub input: ImageRef,
}

/// Identity of a wish before it is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WishSpec {
    pub cvmfs_repo: String,
    pub input: ImageRef,
    pub input_uri: String,
}

impl WishSpec {
    pub fn parse(cvmfs_repo: &str, input: &str) -> Result<Self, DuccError> {
        Ok(Self {
            cvmfs_repo: cvmfs_repo.to_string(),
            input: ImageRef::parse(input)?,
            input_uri: input.to_string(),
        })
    }
}

/// A concrete image tracked by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageRecord {
    pub id: u64,
    pub image: ImageRef,
}
