// src/sched/resource.rs

//! Capacity-limited, backoff-aware resources and the pool that owns them.
//!
//! A [`Resource`] is a counting semaphore with two extras:
//!
//! - a pool-assigned `lock_order`, used by [`acquire_multiple`] to acquire
//!   several resources in one globally consistent order (no circular waits);
//! - a "prohibited until" gate, used to pause every acquirer after an
//!   external collaborator signalled rate limiting.
//!
//! [`Resource::try_acquire`] deliberately ignores the prohibition window.
//! Callers that must honour backoff have to use [`Resource::acquire`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Key prefix for the per-host registry resources.
pub const CONTAINER_REGISTRY_RESOURCE_PREFIX: &str = "container_registry_";

/// Key prefix for the per-repository ingestion resources.
pub const CVMFS_REPOSITORY_RESOURCE_PREFIX: &str = "cvmfs_repository_";

#[derive(Debug)]
struct ResourceState {
    available: usize,
    prohibited_until: Option<Instant>,
}

/// A counting semaphore with deterministic lock order and a backoff gate.
#[derive(Debug)]
pub struct Resource {
    key: String,
    lock_order: u64,
    capacity: usize,
    state: Mutex<ResourceState>,
    wake: Notify,
}

impl Resource {
    fn new(key: String, lock_order: u64, capacity: usize) -> Self {
        Self {
            key,
            lock_order,
            capacity,
            state: Mutex::new(ResourceState {
                available: capacity,
                prohibited_until: None,
            }),
            wake: Notify::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn lock_order(&self) -> u64 {
        self.lock_order
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Currently free capacity.
    pub fn available(&self) -> usize {
        self.lock_state().available
    }

    /// End of the current backoff window, if one is set and still in the future.
    pub fn prohibited_until(&self) -> Option<Instant> {
        self.lock_state()
            .prohibited_until
            .filter(|until| Instant::now() < *until)
    }

    fn lock_state(&self) -> MutexGuard<'_, ResourceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait until a unit of capacity is free and no backoff window is active,
    /// then take it.
    ///
    /// Dropping the returned future before it completes leaves the resource
    /// untouched.
    pub async fn acquire(&self) {
        loop {
            // Register interest before inspecting the state so that a release
            // happening between the check and the await is not lost.
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.lock_state();
                let prohibited_until = state.prohibited_until;
                match prohibited_until {
                    Some(until) if Instant::now() < until => Some(until),
                    _ if state.available > 0 => {
                        state.available -= 1;
                        trace!(resource = %self.key, available = state.available, "acquired");
                        return;
                    }
                    _ => None,
                }
            };

            match deadline {
                Some(until) => {
                    trace!(resource = %self.key, "acquire blocked by backoff window");
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(until) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Take a unit of capacity if one is free right now.
    ///
    /// The backoff window is NOT consulted.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.lock_state();
        if state.available == 0 {
            return false;
        }
        state.available -= 1;
        true
    }

    /// Return a unit of capacity and wake one waiter.
    ///
    /// # Panics
    ///
    /// Panics if the resource is released more often than it was acquired.
    pub fn release(&self) {
        {
            let mut state = self.lock_state();
            if state.available >= self.capacity {
                panic!(
                    "resource '{}' released beyond its capacity of {}",
                    self.key, self.capacity
                );
            }
            state.available += 1;
            trace!(resource = %self.key, available = state.available, "released");
        }
        self.wake.notify_one();
    }

    /// Extend the backoff window to `until` if that is later than the current
    /// window. Never blocks the caller.
    pub fn prohibit_until(&self, until: Instant) {
        let extended = {
            let mut state = self.lock_state();
            match state.prohibited_until {
                Some(current) if current >= until => false,
                _ => {
                    state.prohibited_until = Some(until);
                    true
                }
            }
        };

        if extended {
            debug!(
                resource = %self.key,
                backoff_ms = until.saturating_duration_since(Instant::now()).as_millis() as u64,
                "backoff window extended"
            );
            // Waiters re-evaluate their deadline against the new window.
            self.wake.notify_waiters();
        }
    }

    /// Convenience wrapper around [`Resource::prohibit_until`].
    pub fn prohibit_for(&self, backoff: Duration) {
        self.prohibit_until(Instant::now() + backoff);
    }
}

/// Releases whatever was acquired if [`acquire_multiple`] is cancelled
/// half-way through.
struct PartialAcquire<'a> {
    acquired: Vec<&'a Resource>,
    complete: bool,
}

impl Drop for PartialAcquire<'_> {
    fn drop(&mut self) {
        if !self.complete {
            for resource in &self.acquired {
                resource.release();
            }
        }
    }
}

/// `resources` in ascending `lock_order`, each resource once.
fn distinct(resources: &[Arc<Resource>]) -> Vec<&Resource> {
    let mut ordered: Vec<&Resource> = resources.iter().map(|r| r.as_ref()).collect();
    ordered.sort_by_key(|r| r.lock_order);
    ordered.dedup_by(|a, b| std::ptr::eq(*a, *b));
    ordered
}

/// Acquire every resource in `resources`, in ascending `lock_order`.
/// A resource listed more than once is acquired once.
///
/// Every call site that needs more than one resource must go through this
/// function; the total order is what rules out circular waits.
pub async fn acquire_multiple(resources: &[Arc<Resource>]) {
    let ordered = distinct(resources);

    let mut guard = PartialAcquire {
        acquired: Vec::with_capacity(ordered.len()),
        complete: false,
    };

    for resource in ordered {
        resource.acquire().await;
        guard.acquired.push(resource);
    }

    guard.complete = true;
}

/// Release every resource in `resources`, matching [`acquire_multiple`]:
/// duplicates are released once.
pub fn release_multiple(resources: &[Arc<Resource>]) {
    for resource in distinct(resources) {
        resource.release();
    }
}

#[derive(Debug, Default)]
struct PoolInner {
    next_order: u64,
    resources: HashMap<String, Arc<Resource>>,
}

/// Registry of resources keyed by string, created lazily and shared.
#[derive(Debug, Default)]
pub struct ResourcePool {
    inner: Mutex<PoolInner>,
    next_task_id: AtomicU64,
}

impl ResourcePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the resource for `key`, creating it with `max_capacity` if it
    /// does not exist yet. The capacity of later calls is ignored.
    pub fn create_or_get_resource(&self, key: &str, max_capacity: usize) -> Arc<Resource> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = inner.resources.get(key) {
            return Arc::clone(existing);
        }

        let order = inner.next_order;
        inner.next_order += 1;

        let resource = Arc::new(Resource::new(key.to_string(), order, max_capacity));
        inner
            .resources
            .insert(key.to_string(), Arc::clone(&resource));

        debug!(resource = %key, capacity = max_capacity, lock_order = order, "created resource");
        resource
    }

    /// Look up an existing resource without creating it.
    pub fn get(&self, key: &str) -> Option<Arc<Resource>> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.resources.get(key).cloned()
    }

    /// Keys of all resources, sorted by lock order.
    pub fn keys(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<&Arc<Resource>> = inner.resources.values().collect();
        all.sort_by_key(|r| r.lock_order);
        all.into_iter().map(|r| r.key.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resources
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Process-local identifier for a task bound to this pool.
    pub(crate) fn next_task_id(&self) -> u64 {
        self.next_task_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}
