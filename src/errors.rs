// src/errors.rs

//! Crate-wide error aliases and helpers.

use thiserror::Error;

use crate::collab::CollabError;
use crate::sched::{CoordinatorError, TaskError};

#[derive(Error, Debug)]
pub enum DuccError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Wish not found: {0}")]
    WishNotFound(u64),

    #[error("Image not found: {0}")]
    ImageNotFound(u64),

    #[error("Invalid image reference: {0}")]
    InvalidImageRef(String),

    #[error("Task graph error: {0}")]
    Task(#[from] TaskError),

    #[error("Coordinated work error: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("Collaborator error: {0}")]
    Collab(#[from] CollabError),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, DuccError>;
