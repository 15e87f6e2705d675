// src/pipeline/mod.rs

//! Stage graphs over tagged values.
//!
//! - `tag`: correlation tags and the `Tagged` wrapper.
//! - `channel`: reference-counted channels between stages.
//! - `stages`: broadcast, scatter, gather, sync, sink and transform.
//! - `update_image`: the image-update workflow built from those stages.

pub mod channel;
pub mod stages;
pub mod tag;
pub mod update_image;

pub use channel::{Producer, RefCountedChannel, STAGE_CHANNEL_CAPACITY, link};
pub use stages::{broadcast, gather, scatter, sink, sync, sync_pair, transform};
pub use tag::{Tag, Tagged};
pub use update_image::{ImageJob, UpdateContext, UpdateImagePipeline};
