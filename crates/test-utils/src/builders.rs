#![allow(dead_code)]

use ducc::config::{ConfigFile, RawConfigFile, RegistrySection, WishConfig};
use ducc::model::{Descriptor, FOREIGN_LAYER_MEDIA_TYPE, LayerDescriptor, Manifest};

pub const LAYER_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";

/// `sha256:`-style digest derived from `seed`. Deterministic, 64 hex chars.
pub fn digest_of(seed: &str) -> String {
    format!("sha256:{}", blake3::hash(seed.as_bytes()).to_hex())
}

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile::default(),
        }
    }

    pub fn with_wish(mut self, cvmfs_repo: &str, input: &str) -> Self {
        self.config.wish.push(WishConfig {
            cvmfs_repo: cvmfs_repo.to_string(),
            input: input.to_string(),
        });
        self
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.config.scheduler.max_retries = n;
        self
    }

    pub fn with_registry_concurrency(mut self, n: usize) -> Self {
        self.config.scheduler.registry_concurrency = n;
        self
    }

    pub fn with_repository_concurrency(mut self, n: usize) -> Self {
        self.config.scheduler.repository_concurrency = n;
        self
    }

    pub fn with_registry_override(mut self, host: &str, concurrency: usize) -> Self {
        self.config.registry.insert(
            host.to_string(),
            RegistrySection {
                concurrency: Some(concurrency),
            },
        );
        self
    }

    pub fn build_raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for image manifests. Layers are named by seeds; digests and diff
/// ids are derived from them, so equal seeds give shared layers.
pub struct ManifestBuilder {
    config_seed: String,
    layers: Vec<LayerDescriptor>,
}

impl ManifestBuilder {
    pub fn new(config_seed: &str) -> Self {
        Self {
            config_seed: config_seed.to_string(),
            layers: Vec::new(),
        }
    }

    pub fn layer(mut self, seed: &str) -> Self {
        self.layers.push(layer(seed));
        self
    }

    pub fn layers(mut self, seeds: &[&str]) -> Self {
        self.layers.extend(seeds.iter().map(|s| layer(s)));
        self
    }

    pub fn foreign_layer(mut self, seed: &str) -> Self {
        let mut layer = layer(seed);
        layer.media_type = FOREIGN_LAYER_MEDIA_TYPE.to_string();
        self.layers.push(layer);
        self
    }

    pub fn build(self) -> Manifest {
        Manifest {
            schema_version: 2,
            media_type: MANIFEST_MEDIA_TYPE.to_string(),
            config: Descriptor {
                media_type: CONFIG_MEDIA_TYPE.to_string(),
                digest: digest_of(&format!("config:{}", self.config_seed)),
                size: 0,
            },
            layers: self.layers,
        }
    }
}

/// A regular layer derived from `seed`.
pub fn layer(seed: &str) -> LayerDescriptor {
    LayerDescriptor {
        media_type: LAYER_MEDIA_TYPE.to_string(),
        digest: digest_of(&format!("layer:{seed}")),
        size: seed.len() as u64,
        diff_id: Some(digest_of(&format!("diff:{seed}"))),
    }
}
