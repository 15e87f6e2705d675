// src/config/validate.rs

use std::collections::HashSet;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{DuccError, Result};
use crate::model::ImageRef;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = DuccError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    ensure_has_wishes(cfg)?;
    validate_scheduler(cfg)?;
    validate_registries(cfg)?;
    validate_wishes(cfg)?;
    Ok(())
}

fn ensure_has_wishes(cfg: &RawConfigFile) -> Result<()> {
    if cfg.wish.is_empty() {
        return Err(DuccError::ConfigError(
            "config must contain at least one [[wish]] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_scheduler(cfg: &RawConfigFile) -> Result<()> {
    if cfg.scheduler.registry_concurrency == 0 {
        return Err(DuccError::ConfigError(
            "[scheduler].registry_concurrency must be >= 1 (got 0)".to_string(),
        ));
    }
    if cfg.scheduler.repository_concurrency == 0 {
        return Err(DuccError::ConfigError(
            "[scheduler].repository_concurrency must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn validate_registries(cfg: &RawConfigFile) -> Result<()> {
    for (host, section) in &cfg.registry {
        if section.concurrency == Some(0) {
            return Err(DuccError::ConfigError(format!(
                "[registry.\"{host}\"].concurrency must be >= 1 (got 0)"
            )));
        }
    }
    Ok(())
}

fn validate_wishes(cfg: &RawConfigFile) -> Result<()> {
    let mut seen: HashSet<(&str, ImageRef)> = HashSet::new();
    for (index, wish) in cfg.wish.iter().enumerate() {
        let repo = wish.cvmfs_repo.trim();
        if repo.is_empty() {
            return Err(DuccError::ConfigError(format!(
                "wish #{} has an empty cvmfs_repo",
                index + 1
            )));
        }

        let input = ImageRef::parse(&wish.input).map_err(|e| {
            DuccError::ConfigError(format!("wish #{} has an invalid input: {e}", index + 1))
        })?;

        if !seen.insert((repo, input)) {
            return Err(DuccError::ConfigError(format!(
                "duplicate wish: '{}' into '{repo}'",
                wish.input
            )));
        }
    }
    Ok(())
}
