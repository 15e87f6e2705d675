// src/sched/mod.rs

//! Scheduling core.
//!
//! - `resource`: capacity-limited resources with backoff and ordered multi-acquire.
//! - `task`: hierarchical task graph with predecessors, retries and interrupts.
//! - `status`: status values, captured task logs and the status tree.
//! - `graph`: DOT rendering of a task graph.
//! - `coordinator`: deduplicated, reference-counted shared work.

pub mod coordinator;
pub mod graph;
pub mod resource;
pub mod status;
pub mod task;

pub use coordinator::{Artifact, Coordinator, CoordinatorError, Lease};
pub use graph::to_dot;
pub use resource::{
    CONTAINER_REGISTRY_RESOURCE_PREFIX, CVMFS_REPOSITORY_RESOURCE_PREFIX, Resource, ResourcePool,
    acquire_multiple, release_multiple,
};
pub use status::{LogLevel, LogLine, OnFailure, StatusNode, TaskLog, TaskStatus};
pub use task::{Task, TaskError};
