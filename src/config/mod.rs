// src/config/mod.rs

//! Configuration loading and validation.
//!
//! - `model`: the TOML-backed data model.
//! - `loader`: reading a config file from disk.
//! - `validate`: turning a `RawConfigFile` into a checked `ConfigFile`.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_from_path};
pub use model::{
    ConfigFile, RawConfigFile, RegistrySection, SchedulerSection, StorageSection, WishConfig,
};
