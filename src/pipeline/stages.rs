// src/pipeline/stages.rs

//! Generic pipeline stages.
//!
//! Each stage runs on its own tokio task, reads until its input closes, and
//! drops its producers on the way out so downstream stages see end-of-stream.
//! Every function returns the stage's `JoinHandle`.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, trace, warn};

use crate::pipeline::channel::Producer;
use crate::pipeline::tag::{Tag, Tagged};

/// Send every input item to all outputs.
pub fn broadcast<T>(mut input: mpsc::Receiver<T>, outputs: Vec<Producer<T>>) -> JoinHandle<()>
where
    T: Clone + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(value) = input.recv().await {
            for output in &outputs {
                if output.send(value.clone()).await.is_err() {
                    warn!("broadcast output closed early");
                }
            }
        }
        trace!(outputs = outputs.len(), "broadcast done");
    })
}

/// Split each item into correlated children produced by `split`.
///
/// Items whose split is empty produce nothing.
pub fn scatter<V, C, F>(
    mut input: mpsc::Receiver<Tagged<V>>,
    output: Producer<Tagged<C>>,
    split: F,
) -> JoinHandle<()>
where
    V: Send + 'static,
    C: Send + 'static,
    F: Fn(&V) -> Vec<C> + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(item) = input.recv().await {
            let children = item.scatter(split(&item.value));
            trace!(count = children.len(), "scattering");
            for child in children {
                if output.send(child).await.is_err() {
                    return;
                }
            }
        }
    })
}

/// Recombine the children of each scatter, ordered by their position,
/// under the parent's tags.
pub fn gather<V>(
    mut input: mpsc::Receiver<Tagged<V>>,
    output: Producer<Tagged<Vec<V>>>,
) -> JoinHandle<()>
where
    V: Send + 'static,
{
    tokio::spawn(async move {
        let mut pending: HashMap<u64, Vec<(usize, Tagged<V>)>> = HashMap::new();

        while let Some(item) = input.recv().await {
            let Some(Tag { id, seq, count }) = item.top().copied() else {
                warn!("gather received an untagged item, dropping it");
                continue;
            };

            let group = pending.entry(id).or_default();
            group.push((seq, item));
            if group.len() < count {
                continue;
            }

            let Some(mut group) = pending.remove(&id) else {
                continue;
            };
            group.sort_by_key(|(seq, _)| *seq);

            let mut tags = group[0].1.tags.clone();
            tags.pop();
            let values = group.into_iter().map(|(_, t)| t.value).collect();
            if output.send(Tagged { tags, value: values }).await.is_err() {
                return;
            }
        }

        if !pending.is_empty() {
            warn!(incomplete = pending.len(), "gather closed with incomplete groups");
        }
    })
}

/// N-way barrier: forward an item on every output only once an item with the
/// same tags has arrived on every input.
pub fn sync<V>(inputs: Vec<mpsc::Receiver<Tagged<V>>>, outputs: Vec<Producer<Tagged<V>>>) -> JoinHandle<()>
where
    V: Send + 'static,
{
    assert_eq!(inputs.len(), outputs.len(), "sync needs one output per input");
    let width = inputs.len();

    tokio::spawn(async move {
        let (tx, mut merged) = mpsc::channel::<(usize, Tagged<V>)>(width.max(1));
        for (lane, mut input) in inputs.into_iter().enumerate() {
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(item) = input.recv().await {
                    if tx.send((lane, item)).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        let mut waiting: HashMap<Vec<Tag>, Vec<Option<Tagged<V>>>> = HashMap::new();
        while let Some((lane, item)) = merged.recv().await {
            let slots = waiting
                .entry(item.tags.clone())
                .or_insert_with(|| (0..width).map(|_| None).collect());
            if slots[lane].is_some() {
                warn!(lane, "sync received a duplicate item, replacing it");
            }
            slots[lane] = Some(item);

            if slots.iter().all(Option::is_some) {
                let Some(key) = slots.iter().flatten().next().map(|t| t.tags.clone()) else {
                    continue;
                };
                let Some(ready) = waiting.remove(&key) else {
                    continue;
                };
                for (output, item) in outputs.iter().zip(ready.into_iter().flatten()) {
                    if output.send(item).await.is_err() {
                        warn!("sync output closed early");
                    }
                }
            }
        }

        if !waiting.is_empty() {
            warn!(unmatched = waiting.len(), "sync closed with unmatched items");
        }
    })
}

/// Two-input barrier for inputs of different types.
pub fn sync_pair<A, B>(
    mut left: mpsc::Receiver<Tagged<A>>,
    mut right: mpsc::Receiver<Tagged<B>>,
    left_out: Producer<Tagged<A>>,
    right_out: Producer<Tagged<B>>,
) -> JoinHandle<()>
where
    A: Send + 'static,
    B: Send + 'static,
{
    tokio::spawn(async move {
        let mut lefts: HashMap<Vec<Tag>, VecDeque<Tagged<A>>> = HashMap::new();
        let mut rights: HashMap<Vec<Tag>, VecDeque<Tagged<B>>> = HashMap::new();
        let (mut left_open, mut right_open) = (true, true);

        while left_open || right_open {
            let key = tokio::select! {
                item = left.recv(), if left_open => match item {
                    Some(item) => {
                        let key = item.tags.clone();
                        lefts.entry(key.clone()).or_default().push_back(item);
                        key
                    }
                    None => { left_open = false; continue; }
                },
                item = right.recv(), if right_open => match item {
                    Some(item) => {
                        let key = item.tags.clone();
                        rights.entry(key.clone()).or_default().push_back(item);
                        key
                    }
                    None => { right_open = false; continue; }
                },
            };

            let matched = match (lefts.get_mut(&key), rights.get_mut(&key)) {
                (Some(l), Some(r)) => l.pop_front().zip(r.pop_front()),
                _ => None,
            };
            lefts.retain(|_, q| !q.is_empty());
            rights.retain(|_, q| !q.is_empty());

            if let Some((l, r)) = matched {
                if left_out.send(l).await.is_err() || right_out.send(r).await.is_err() {
                    warn!("sync_pair output closed early");
                }
            }
        }

        if !lefts.is_empty() || !rights.is_empty() {
            warn!(
                left = lefts.len(),
                right = rights.len(),
                "sync_pair closed with unmatched items"
            );
        }
    })
}

/// Drain and drop everything. Resolves to the number of items drained.
pub fn sink<T>(mut input: mpsc::Receiver<T>) -> JoinHandle<usize>
where
    T: Send + 'static,
{
    tokio::spawn(async move {
        let mut drained = 0;
        while input.recv().await.is_some() {
            drained += 1;
        }
        debug!(drained, "sink done");
        drained
    })
}

/// Apply `f` to every item, running up to `concurrency` items at once.
///
/// Output order follows completion order. Items for which `f` yields `None`
/// are dropped.
pub fn transform<V, U, F, Fut>(
    mut input: mpsc::Receiver<Tagged<V>>,
    output: Producer<Tagged<U>>,
    concurrency: usize,
    f: F,
) -> JoinHandle<()>
where
    V: Send + 'static,
    U: Send + 'static,
    F: Fn(Tagged<V>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Tagged<U>>> + Send + 'static,
{
    tokio::spawn(async move {
        let f = Arc::new(f);
        let limit = Arc::new(Semaphore::new(concurrency.max(1)));
        let output = Arc::new(output);
        let mut running = JoinSet::new();

        while let Some(item) = input.recv().await {
            let Ok(permit) = Arc::clone(&limit).acquire_owned().await else {
                break;
            };
            let f = Arc::clone(&f);
            let output = Arc::clone(&output);
            running.spawn(async move {
                let _permit = permit;
                if let Some(result) = f(item).await {
                    let _ = output.send(result).await;
                }
            });
            // Reap finished items so the set does not grow without bound.
            while running.try_join_next().is_some() {}
        }

        while running.join_next().await.is_some() {}
    })
}
