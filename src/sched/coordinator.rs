// src/sched/coordinator.rs

//! Deduplicating work coordinator.
//!
//! Concurrent requests for the same key share one execution of the work.
//! Every successful requester gets a [`Lease`] on the shared artifact; the
//! artifact's [`Artifact::cleanup`] runs once the last lease is gone.
//!
//! Cancellation is per requester. A requester that gives up stops waiting
//! without affecting the others. The work itself is cancelled only when the
//! last waiter has given up.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Outcome shared with every waiter. `Clone` so a single failure can be
/// handed to all of them.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("work for '{key}' failed: {message}")]
    Failed { key: String, message: String },

    #[error("request for '{key}' was cancelled")]
    Cancelled { key: String },
}

/// A value produced by coordinated work.
pub trait Artifact: Send + Sync + 'static {
    /// Called exactly once, after the last lease on the artifact was released.
    fn cleanup(&self) {}
}

type Outcome<A> = Option<Result<Arc<A>, CoordinatorError>>;

enum Entry<A> {
    InFlight {
        generation: u64,
        waiters: usize,
        done: watch::Receiver<Outcome<A>>,
        cancel: CancellationToken,
    },
    Ready {
        generation: u64,
        artifact: Arc<A>,
        refs: usize,
    },
}

impl<A> Entry<A> {
    fn generation(&self) -> u64 {
        match self {
            Entry::InFlight { generation, .. } | Entry::Ready { generation, .. } => *generation,
        }
    }
}

struct Inner<K, A> {
    next_generation: u64,
    entries: HashMap<K, Entry<A>>,
}

/// Shares one execution per key among all concurrent requesters.
pub struct Coordinator<K, A> {
    name: &'static str,
    inner: Arc<Mutex<Inner<K, A>>>,
}

impl<K, A> Clone for Coordinator<K, A> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, A> fmt::Debug for Coordinator<K, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator").field("name", &self.name).finish()
    }
}

fn lock<K, A>(inner: &Mutex<Inner<K, A>>) -> MutexGuard<'_, Inner<K, A>> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K, A> Coordinator<K, A>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
    A: Artifact,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Arc::new(Mutex::new(Inner {
                next_generation: 0,
                entries: HashMap::new(),
            })),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of keys currently in flight or held by at least one lease.
    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_tracked(&self, key: &K) -> bool {
        lock(&self.inner).entries.contains_key(key)
    }

    /// Number of live leases for `key` (zero while in flight or untracked).
    pub fn lease_count(&self, key: &K) -> usize {
        match lock(&self.inner).entries.get(key) {
            Some(Entry::Ready { refs, .. }) => *refs,
            _ => 0,
        }
    }

    /// Obtain a lease on the artifact for `key`, running `work` only if no
    /// execution is in flight or ready for that key.
    ///
    /// `work` receives a token that fires once every waiter has cancelled;
    /// it is expected to wind down promptly and is always awaited to the end,
    /// so resources it holds are released normally. `cancel` cancels only
    /// this request.
    pub async fn request<F, Fut>(
        &self,
        key: K,
        cancel: &CancellationToken,
        work: F,
    ) -> Result<Lease<K, A>, CoordinatorError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<A>> + Send + 'static,
    {
        let (generation, mut done) = {
            let mut inner = lock(&self.inner);
            match inner.entries.get_mut(&key) {
                Some(Entry::Ready {
                    generation,
                    artifact,
                    refs,
                }) => {
                    *refs += 1;
                    trace!(coordinator = self.name, %key, refs = *refs, "reusing ready artifact");
                    return Ok(Lease::new(
                        key,
                        *generation,
                        Arc::clone(artifact),
                        Arc::clone(&self.inner),
                    ));
                }
                Some(Entry::InFlight {
                    generation,
                    waiters,
                    done,
                    ..
                }) => {
                    *waiters += 1;
                    trace!(coordinator = self.name, %key, waiters = *waiters, "joining in-flight work");
                    (*generation, done.clone())
                }
                None => {
                    let generation = inner.next_generation;
                    inner.next_generation += 1;
                    let token = CancellationToken::new();
                    let (tx, rx) = watch::channel(None);
                    inner.entries.insert(
                        key.clone(),
                        Entry::InFlight {
                            generation,
                            waiters: 1,
                            done: rx.clone(),
                            cancel: token.clone(),
                        },
                    );
                    drop(inner);

                    debug!(coordinator = self.name, %key, "starting work");
                    self.spawn_work(key.clone(), generation, token.clone(), tx, work(token));
                    (generation, rx)
                }
            }
        };

        // Gives the slot back if this future is dropped while waiting.
        let slot = WaiterSlot {
            coordinator: self,
            key: &key,
            generation,
            armed: true,
        };

        tokio::select! {
            outcome = done.wait_for(Option::is_some) => {
                let outcome = outcome.ok().and_then(|o| o.clone());
                slot.disarm();
                self.settle(key, generation, outcome)
            }
            _ = cancel.cancelled() => {
                drop(slot);
                Err(CoordinatorError::Cancelled { key: key.to_string() })
            }
        }
    }

    fn spawn_work<Fut>(
        &self,
        key: K,
        generation: u64,
        token: CancellationToken,
        done: watch::Sender<Outcome<A>>,
        work: Fut,
    ) where
        Fut: Future<Output = anyhow::Result<A>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let name = self.name;

        tokio::spawn(async move {
            let result = match work.await {
                Ok(artifact) => Ok(artifact),
                Err(_) if token.is_cancelled() => {
                    Err(CoordinatorError::Cancelled { key: key.to_string() })
                }
                Err(err) => Err(CoordinatorError::Failed {
                    key: key.to_string(),
                    message: format!("{err:#}"),
                }),
            };

            let mut orphan = None;
            let outcome = {
                let mut guard = lock(&inner);
                let current = matches!(
                    guard.entries.get(&key),
                    Some(Entry::InFlight { generation: g, .. }) if *g == generation
                );

                match result {
                    Ok(artifact) => {
                        let artifact = Arc::new(artifact);
                        if current {
                            let waiters = match guard.entries.get(&key) {
                                Some(Entry::InFlight { waiters, .. }) => *waiters,
                                _ => 0,
                            };
                            guard.entries.insert(
                                key.clone(),
                                Entry::Ready {
                                    generation,
                                    artifact: Arc::clone(&artifact),
                                    refs: waiters,
                                },
                            );
                        } else {
                            orphan = Some(Arc::clone(&artifact));
                        }
                        Ok(artifact)
                    }
                    Err(err) => {
                        if current {
                            guard.entries.remove(&key);
                        }
                        Err(err)
                    }
                }
            };

            match &outcome {
                Ok(_) => debug!(coordinator = name, %key, "work finished"),
                Err(err) => warn!(coordinator = name, %key, error = %err, "work failed"),
            }

            if let Some(artifact) = orphan {
                // Every waiter gave up before the work finished.
                debug!(coordinator = name, %key, "discarding unclaimed artifact");
                artifact.cleanup();
            }

            done.send_replace(Some(outcome));
        });
    }

    fn settle(
        &self,
        key: K,
        generation: u64,
        outcome: Outcome<A>,
    ) -> Result<Lease<K, A>, CoordinatorError> {
        match outcome {
            Some(Ok(artifact)) => Ok(Lease::new(
                key,
                generation,
                artifact,
                Arc::clone(&self.inner),
            )),
            Some(Err(err)) => Err(err),
            None => {
                // The work task went away without reporting (it panicked).
                let mut inner = lock(&self.inner);
                if inner
                    .entries
                    .get(&key)
                    .is_some_and(|e| e.generation() == generation)
                {
                    inner.entries.remove(&key);
                }
                Err(CoordinatorError::Failed {
                    key: key.to_string(),
                    message: "work terminated without a result".to_string(),
                })
            }
        }
    }

    /// A waiter stopped waiting. Cancels the work if it was the last one.
    fn abandon(&self, key: &K, generation: u64) {
        let mut cleanup = None;
        {
            let mut inner = lock(&self.inner);
            let remove = match inner.entries.get_mut(key) {
                Some(Entry::InFlight {
                    generation: g,
                    waiters,
                    cancel,
                    ..
                }) if *g == generation => {
                    *waiters -= 1;
                    if *waiters == 0 {
                        debug!(coordinator = self.name, %key, "last waiter gone, cancelling work");
                        cancel.cancel();
                        true
                    } else {
                        false
                    }
                }
                // The work finished while we were cancelling; the slot
                // reserved for us has to be given back.
                Some(Entry::Ready {
                    generation: g,
                    refs,
                    artifact,
                }) if *g == generation => {
                    *refs -= 1;
                    if *refs == 0 {
                        cleanup = Some(Arc::clone(artifact));
                        true
                    } else {
                        false
                    }
                }
                _ => false,
            };
            if remove {
                inner.entries.remove(key);
            }
        }
        if let Some(artifact) = cleanup {
            artifact.cleanup();
        }
    }
}

/// A waiter's reservation on an in-flight entry. Given back on drop unless
/// the waiter received its outcome.
struct WaiterSlot<'a, K, A>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
    A: Artifact,
{
    coordinator: &'a Coordinator<K, A>,
    key: &'a K,
    generation: u64,
    armed: bool,
}

impl<K, A> WaiterSlot<'_, K, A>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
    A: Artifact,
{
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<K, A> Drop for WaiterSlot<'_, K, A>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
    A: Artifact,
{
    fn drop(&mut self) {
        if self.armed {
            trace!(coordinator = self.coordinator.name, key = %self.key, "waiter dropped");
            self.coordinator.abandon(self.key, self.generation);
        }
    }
}

/// Shared handle on a coordinated artifact. Released on drop.
pub struct Lease<K, A>
where
    K: Eq + Hash + fmt::Display,
    A: Artifact,
{
    key: K,
    generation: u64,
    artifact: Arc<A>,
    inner: Arc<Mutex<Inner<K, A>>>,
    released: bool,
}

impl<K, A> Lease<K, A>
where
    K: Eq + Hash + fmt::Display,
    A: Artifact,
{
    fn new(key: K, generation: u64, artifact: Arc<A>, inner: Arc<Mutex<Inner<K, A>>>) -> Self {
        Self {
            key,
            generation,
            artifact,
            inner,
            released: false,
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn artifact(&self) -> &Arc<A> {
        &self.artifact
    }

    /// Explicit release. Equivalent to dropping the lease.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let last = {
            let mut inner = lock(&self.inner);
            match inner.entries.get_mut(&self.key) {
                Some(Entry::Ready {
                    generation, refs, ..
                }) if *generation == self.generation => {
                    *refs -= 1;
                    let last = *refs == 0;
                    if last {
                        inner.entries.remove(&self.key);
                    }
                    last
                }
                _ => {
                    if std::thread::panicking() {
                        return;
                    }
                    panic!("released a lease for untracked key '{}'", self.key);
                }
            }
        };

        if last {
            trace!(key = %self.key, "last lease released, cleaning up");
            self.artifact.cleanup();
        }
    }
}

impl<K, A> Deref for Lease<K, A>
where
    K: Eq + Hash + fmt::Display,
    A: Artifact,
{
    type Target = A;

    fn deref(&self) -> &A {
        &self.artifact
    }
}

impl<K, A> Drop for Lease<K, A>
where
    K: Eq + Hash + fmt::Display,
    A: Artifact,
{
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl<K, A> fmt::Debug for Lease<K, A>
where
    K: Eq + Hash + fmt::Display,
    A: Artifact,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("key", &self.key.to_string())
            .field("generation", &self.generation)
            .finish()
    }
}
