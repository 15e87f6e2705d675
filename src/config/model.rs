// src/config/model.rs

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::errors::Result;
use crate::ingest::IngestSettings;
use crate::model::WishSpec;

/// Configuration exactly as read from a TOML file, before validation.
///
/// ```toml
/// [scheduler]
/// max_retries = 3
/// registry_concurrency = 4
/// repository_concurrency = 1
/// rate_limit_backoff_secs = 30
///
/// [storage]
/// registry_root = "registry"
/// repository_root = "cvmfs"
///
/// [registry."registry.example.org"]
/// concurrency = 2
///
/// [[wish]]
/// cvmfs_repo = "unpacked.example.org"
/// input = "https://registry.example.org/library/ubuntu:2*"
/// ```
///
/// All sections are optional except that validation requires at least one
/// `[[wish]]`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub scheduler: SchedulerSection,

    #[serde(default)]
    pub storage: StorageSection,

    /// Per-host overrides, keyed by registry host.
    #[serde(default)]
    pub registry: BTreeMap<String, RegistrySection>,

    #[serde(default)]
    pub wish: Vec<WishConfig>,
}

/// Validated configuration. Obtain one through `ConfigFile::try_from`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub scheduler: SchedulerSection,
    pub storage: StorageSection,
    pub registry: BTreeMap<String, RegistrySection>,
    pub wish: Vec<WishConfig>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(raw: RawConfigFile) -> Self {
        Self {
            scheduler: raw.scheduler,
            storage: raw.storage,
            registry: raw.registry,
            wish: raw.wish,
        }
    }

    /// Limits and locations for downloads and ingestion.
    pub fn ingest_settings(&self) -> IngestSettings {
        let defaults = IngestSettings::default();
        let registry_overrides: HashMap<String, usize> = self
            .registry
            .iter()
            .filter_map(|(host, section)| section.concurrency.map(|c| (host.clone(), c)))
            .collect();

        IngestSettings {
            max_retries: self.scheduler.max_retries,
            registry_concurrency: self.scheduler.registry_concurrency,
            registry_overrides,
            repository_concurrency: self.scheduler.repository_concurrency,
            tar_cache_dir: self
                .storage
                .tar_cache_dir
                .clone()
                .unwrap_or(defaults.tar_cache_dir),
        }
    }

    pub fn rate_limit_backoff(&self) -> Duration {
        Duration::from_secs(self.scheduler.rate_limit_backoff_secs)
    }

    /// Parsed wishes, in file order.
    pub fn wish_specs(&self) -> Result<Vec<WishSpec>> {
        self.wish
            .iter()
            .map(|w| WishSpec::parse(&w.cvmfs_repo, &w.input))
            .collect()
    }
}

/// `[scheduler]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    /// Retries per collaborator call before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Capacity of each `container_registry_<host>` resource.
    #[serde(default = "default_registry_concurrency")]
    pub registry_concurrency: usize,

    /// Capacity of each `cvmfs_repository_<name>` resource.
    #[serde(default = "default_repository_concurrency")]
    pub repository_concurrency: usize,

    /// Backoff applied when a rate-limit signal carries no retry-after.
    #[serde(default = "default_rate_limit_backoff_secs")]
    pub rate_limit_backoff_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_registry_concurrency() -> usize {
    4
}

fn default_repository_concurrency() -> usize {
    1
}

fn default_rate_limit_backoff_secs() -> u64 {
    30
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            registry_concurrency: default_registry_concurrency(),
            repository_concurrency: default_repository_concurrency(),
            rate_limit_backoff_secs: default_rate_limit_backoff_secs(),
        }
    }
}

/// `[storage]` section. Relative paths are resolved against the directory
/// holding the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    /// Where layer tarballs are downloaded to. Defaults to a directory under
    /// the system temp dir.
    #[serde(default)]
    pub tar_cache_dir: Option<PathBuf>,

    #[serde(default = "default_registry_root")]
    pub registry_root: PathBuf,

    #[serde(default = "default_repository_root")]
    pub repository_root: PathBuf,
}

fn default_registry_root() -> PathBuf {
    PathBuf::from("registry")
}

fn default_repository_root() -> PathBuf {
    PathBuf::from("cvmfs")
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            tar_cache_dir: None,
            registry_root: default_registry_root(),
            repository_root: default_repository_root(),
        }
    }
}

/// `[registry.<host>]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistrySection {
    /// Overrides `scheduler.registry_concurrency` for this host.
    #[serde(default)]
    pub concurrency: Option<usize>,
}

/// One `[[wish]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WishConfig {
    pub cvmfs_repo: String,
    /// Image URI; the tag may be a glob.
    pub input: String,
}
