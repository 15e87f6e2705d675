// src/pipeline/channel.rs

//! Reference-counted channels between pipeline stages.
//!
//! Every upstream writer holds a [`Producer`]. The channel closes once the
//! last producer is dropped *and* the channel itself has been sealed with
//! [`RefCountedChannel::into_receiver`], so a stage fed by several producers
//! sees end-of-stream only after all of them are done.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// Capacity of every stage channel. One slot keeps stages in lock-step.
pub const STAGE_CHANNEL_CAPACITY: usize = 1;

/// Write half held by one upstream producer.
#[derive(Debug)]
pub struct Producer<T> {
    tx: mpsc::Sender<T>,
    producers: Arc<AtomicUsize>,
}

impl<T> Producer<T> {
    /// Send `value`, waiting for room. Fails once the reader has gone away,
    /// handing the value back.
    pub async fn send(&self, value: T) -> Result<(), T> {
        self.tx.send(value).await.map_err(|e| e.0)
    }
}

impl<T> Clone for Producer<T> {
    fn clone(&self) -> Self {
        self.producers.fetch_add(1, Ordering::AcqRel);
        Self {
            tx: self.tx.clone(),
            producers: Arc::clone(&self.producers),
        }
    }
}

impl<T> Drop for Producer<T> {
    fn drop(&mut self) {
        let left = self.producers.fetch_sub(1, Ordering::AcqRel) - 1;
        trace!(producers = left, "producer done");
    }
}

/// A channel that tracks how many producers still feed it.
#[derive(Debug)]
pub struct RefCountedChannel<T> {
    seed: mpsc::Sender<T>,
    rx: mpsc::Receiver<T>,
    producers: Arc<AtomicUsize>,
}

impl<T: Send + 'static> RefCountedChannel<T> {
    pub fn new() -> Self {
        let (seed, rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
        Self {
            seed,
            rx,
            producers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Register a new producer.
    pub fn producer(&self) -> Producer<T> {
        self.producers.fetch_add(1, Ordering::AcqRel);
        Producer {
            tx: self.seed.clone(),
            producers: Arc::clone(&self.producers),
        }
    }

    /// Number of producers not yet dropped.
    pub fn producers(&self) -> usize {
        self.producers.load(Ordering::Acquire)
    }

    /// Forward everything from `upstream` into this channel, as one more
    /// producer.
    pub fn connect(&self, upstream: mpsc::Receiver<T>) -> JoinHandle<()> {
        self.connect_with(upstream, |v| v)
    }

    /// Like [`RefCountedChannel::connect`], converting each value with `adapt`.
    pub fn connect_with<U, F>(&self, mut upstream: mpsc::Receiver<U>, adapt: F) -> JoinHandle<()>
    where
        U: Send + 'static,
        F: Fn(U) -> T + Send + 'static,
    {
        let producer = self.producer();
        tokio::spawn(async move {
            while let Some(value) = upstream.recv().await {
                if producer.send(adapt(value)).await.is_err() {
                    break;
                }
            }
        })
    }

    /// Stop accepting new producers and hand out the read half. The receiver
    /// sees end-of-stream once every existing producer is dropped.
    pub fn into_receiver(self) -> mpsc::Receiver<T> {
        self.rx
    }
}

impl<T: Send + 'static> Default for RefCountedChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A sealed channel with a single producer: the usual stage-to-stage link.
pub fn link<T: Send + 'static>() -> (Producer<T>, mpsc::Receiver<T>) {
    let channel = RefCountedChannel::new();
    let producer = channel.producer();
    (producer, channel.into_receiver())
}
