// src/sched/task.rs

//! Hierarchical, dependency-aware task graph.
//!
//! A [`Task`] has:
//!
//! - *children* (subtasks) that must reach a terminal state before the parent
//!   can complete, and that may not start before the parent has started;
//! - *successors* that may not start before this task has completed;
//! - *required resources* that are held from start until completion.
//!
//! The lifecycle is driven by the caller:
//!
//! ```text
//! start_when_ready() -> do work (with retry()) -> complete_when_ready(status)
//! ```
//!
//! [`Task::run`] wraps that sequence for the common case.
//!
//! Links are held as `Arc` downwards (parent -> child, predecessor ->
//! successor) and as `Weak` upwards, so a finished graph is freed as soon as
//! its root is dropped.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collab::CollabError;
use crate::sched::resource::{Resource, ResourcePool, acquire_multiple, release_multiple};
use crate::sched::status::{LogLevel, LogLine, OnFailure, StatusNode, TaskLog, TaskStatus};

/// Failures of graph construction and task start-up.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("task '{parent}' has already completed; cannot add child '{child}'")]
    ParentCompleted { parent: String, child: String },

    #[error("task '{predecessor}' has already completed; cannot add successor '{successor}'")]
    PredecessorCompleted {
        predecessor: String,
        successor: String,
    },

    #[error("task '{0}' has already started")]
    AlreadyStarted(String),

    #[error("task '{child}' already belongs to parent '{parent}'")]
    AlreadyHasParent { child: String, parent: String },

    #[error("task '{0}' cannot be related to itself")]
    SelfReference(String),

    #[error("task '{task}' not started: predecessor(s) {predecessors:?} did not succeed")]
    PredecessorFailed {
        task: String,
        predecessors: Vec<String>,
    },

    #[error("task '{task}' not started: parent '{parent}' terminated before starting")]
    ParentTerminated { task: String, parent: String },

    #[error("task '{task}' interrupted with status {status}")]
    Interrupted { task: String, status: TaskStatus },

    #[error("task '{0}' has no parent")]
    NoParent(String),
}

#[derive(Debug)]
struct ChildLink {
    child: Arc<Task>,
    on_failure: OnFailure,
}

#[derive(Debug)]
struct ParentLink {
    parent: Weak<Task>,
    name: String,
    done_tx: mpsc::UnboundedSender<u64>,
}

#[derive(Debug)]
struct SuccessorLink {
    successor: Arc<Task>,
}

#[derive(Debug)]
struct PredecessorLink {
    id: u64,
    name: String,
    on_failure: OnFailure,
}

#[derive(Debug)]
struct TaskState {
    status: TaskStatus,
    started: bool,
    done: bool,
    retries: u32,
    holds_resources: bool,
    resources: Vec<Arc<Resource>>,
    children: Vec<ChildLink>,
    children_pending: usize,
    parent: Option<ParentLink>,
    predecessors: Vec<PredecessorLink>,
    successors: Vec<SuccessorLink>,
    failed_predecessors: Vec<String>,
    interrupted: Option<TaskStatus>,
}

/// A node of the task graph. Always handled through `Arc<Task>`.
#[derive(Debug)]
pub struct Task {
    me: Weak<Task>,
    id: u64,
    name: String,
    pool: Arc<ResourcePool>,
    max_retries: u32,
    state: Mutex<TaskState>,
    status_tx: watch::Sender<TaskStatus>,
    pending_predecessors: watch::Sender<usize>,
    child_done_tx: mpsc::UnboundedSender<u64>,
    child_done_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<u64>>,
    cancel: CancellationToken,
    log: TaskLog,
}

impl Task {
    pub fn new(name: impl Into<String>, pool: &Arc<ResourcePool>, max_retries: u32) -> Arc<Self> {
        let (status_tx, _) = watch::channel(TaskStatus::Created);
        let (pending_predecessors, _) = watch::channel(0usize);
        let (child_done_tx, child_done_rx) = mpsc::unbounded_channel();

        let task = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            id: pool.next_task_id(),
            name: name.into(),
            pool: Arc::clone(pool),
            max_retries,
            state: Mutex::new(TaskState {
                status: TaskStatus::Created,
                started: false,
                done: false,
                retries: 0,
                holds_resources: false,
                resources: Vec::new(),
                children: Vec::new(),
                children_pending: 0,
                parent: None,
                predecessors: Vec::new(),
                successors: Vec::new(),
                failed_predecessors: Vec::new(),
                interrupted: None,
            }),
            status_tx,
            pending_predecessors,
            child_done_tx,
            child_done_rx: tokio::sync::Mutex::new(child_done_rx),
            cancel: CancellationToken::new(),
            log: TaskLog::new(),
        });
        debug!(task_id = task.id, task = %task.name, "task created");
        task
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &Arc<ResourcePool> {
        &self.pool
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn lock_state(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> TaskStatus {
        self.lock_state().status
    }

    pub fn is_done(&self) -> bool {
        self.lock_state().done
    }

    pub fn has_started(&self) -> bool {
        self.lock_state().started
    }

    pub fn retries(&self) -> u32 {
        self.lock_state().retries
    }

    pub fn resources(&self) -> Vec<Arc<Resource>> {
        self.lock_state().resources.clone()
    }

    pub fn children(&self) -> Vec<Arc<Task>> {
        self.lock_state()
            .children
            .iter()
            .map(|l| Arc::clone(&l.child))
            .collect()
    }

    pub fn successors(&self) -> Vec<Arc<Task>> {
        self.lock_state()
            .successors
            .iter()
            .map(|l| Arc::clone(&l.successor))
            .collect()
    }

    pub fn parent(&self) -> Option<Arc<Task>> {
        self.lock_state()
            .parent
            .as_ref()
            .and_then(|l| l.parent.upgrade())
    }

    /// Subscribe to status transitions.
    pub fn watch_status(&self) -> watch::Receiver<TaskStatus> {
        self.status_tx.subscribe()
    }

    /// Token cancelled as soon as the task is interrupted. Hand it to
    /// cancellable work started on behalf of this task.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // ---------------------------------------------------------------------
    // Captured log
    // ---------------------------------------------------------------------

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => debug!(task_id = self.id, task = %self.name, "{message}"),
            LogLevel::Info => info!(task_id = self.id, task = %self.name, "{message}"),
            LogLevel::Warn => warn!(task_id = self.id, task = %self.name, "{message}"),
            LogLevel::Error => error!(task_id = self.id, task = %self.name, "{message}"),
        }
        self.log.push(level, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    pub fn logs(&self) -> Vec<LogLine> {
        self.log.lines()
    }

    // ---------------------------------------------------------------------
    // Graph construction
    // ---------------------------------------------------------------------

    /// Declare resources to hold while running. Only allowed before start.
    pub fn add_required_resources<I>(&self, resources: I) -> Result<(), TaskError>
    where
        I: IntoIterator<Item = Arc<Resource>>,
    {
        let mut state = self.lock_state();
        if state.status != TaskStatus::Created {
            return Err(TaskError::AlreadyStarted(self.name.clone()));
        }
        for resource in resources {
            if !state.resources.iter().any(|held| Arc::ptr_eq(held, &resource)) {
                state.resources.push(resource);
            }
        }
        Ok(())
    }

    /// Shorthand for creating-or-getting a pool resource and requiring it.
    pub fn require(&self, key: &str, capacity: usize) -> Result<Arc<Resource>, TaskError> {
        let resource = self.pool.create_or_get_resource(key, capacity);
        self.add_required_resources([Arc::clone(&resource)])?;
        Ok(resource)
    }

    /// Attach `child` as a subtask of `self`.
    ///
    /// Fails once `self` has completed.
    pub fn add_child(&self, child: &Arc<Task>, on_failure: OnFailure) -> Result<(), TaskError> {
        if child.id == self.id {
            return Err(TaskError::SelfReference(self.name.clone()));
        }
        let (mut parent_state, mut child_state) = lock_pair(self, child);
        if parent_state.done {
            return Err(TaskError::ParentCompleted {
                parent: self.name.clone(),
                child: child.name.clone(),
            });
        }
        if let Some(existing) = &child_state.parent {
            return Err(TaskError::AlreadyHasParent {
                child: child.name.clone(),
                parent: existing.name.clone(),
            });
        }
        if child_state.done {
            return Err(TaskError::AlreadyStarted(child.name.clone()));
        }

        child_state.parent = Some(ParentLink {
            parent: self.me.clone(),
            name: self.name.clone(),
            done_tx: self.child_done_tx.clone(),
        });
        parent_state.children.push(ChildLink {
            child: Arc::clone(child),
            on_failure,
        });
        parent_state.children_pending += 1;

        let forward = parent_state.interrupted;
        drop(child_state);
        drop(parent_state);

        debug!(parent = %self.name, child = %child.name, ?on_failure, "child added");
        if let Some(status) = forward {
            child.interrupt(status);
        }
        Ok(())
    }

    /// Sequence `successor` after `self`.
    ///
    /// Fails once `self` has completed.
    pub fn add_successor(
        &self,
        successor: &Arc<Task>,
        on_failure: OnFailure,
    ) -> Result<(), TaskError> {
        if successor.id == self.id {
            return Err(TaskError::SelfReference(self.name.clone()));
        }

        let (mut pred_state, mut succ_state) = lock_pair(self, successor);
        if pred_state.done {
            return Err(TaskError::PredecessorCompleted {
                predecessor: self.name.clone(),
                successor: successor.name.clone(),
            });
        }
        if succ_state.started || succ_state.done {
            return Err(TaskError::AlreadyStarted(successor.name.clone()));
        }

        pred_state.successors.push(SuccessorLink {
            successor: Arc::clone(successor),
        });
        succ_state.predecessors.push(PredecessorLink {
            id: self.id,
            name: self.name.clone(),
            on_failure,
        });
        // Incremented under the predecessor's lock so a concurrent completion
        // cannot decrement first.
        successor.pending_predecessors.send_modify(|n| *n += 1);

        debug!(predecessor = %self.name, successor = %successor.name, ?on_failure, "successor added");
        Ok(())
    }

    /// `prerequisite` must succeed before `self` may start.
    pub fn add_prerequisite(&self, prerequisite: &Arc<Task>) -> Result<(), TaskError> {
        let me = self
            .me
            .upgrade()
            .ok_or_else(|| TaskError::SelfReference(self.name.clone()))?;
        prerequisite.add_successor(&me, OnFailure::Abort)
    }

    /// Add `successor` as a successor of `self` and as a sibling under the
    /// same parent.
    pub fn then(
        &self,
        successor: &Arc<Task>,
        on_predecessor_failure: OnFailure,
        on_child_failure: OnFailure,
    ) -> Result<(), TaskError> {
        let parent = self
            .parent()
            .ok_or_else(|| TaskError::NoParent(self.name.clone()))?;
        self.add_successor(successor, on_predecessor_failure)?;
        parent.add_child(successor, on_child_failure)
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Wait for the parent to start, for every predecessor to finish, and for
    /// all required resources; then move to RUNNING.
    ///
    /// On error the task has not acquired anything and should be finished
    /// with `complete_when_ready(TaskStatus::Aborted)`.
    pub async fn start_when_ready(&self) -> Result<(), TaskError> {
        let (parent, resources) = {
            let mut state = self.lock_state();
            if state.status != TaskStatus::Created {
                return Err(TaskError::AlreadyStarted(self.name.clone()));
            }
            state.status = TaskStatus::Waiting;
            let parent = state.parent.as_ref().and_then(|l| l.parent.upgrade());
            (parent, state.resources.clone())
        };
        self.status_tx.send_replace(TaskStatus::Waiting);

        if let Some(parent) = parent {
            let mut parent_status = parent.watch_status();
            tokio::select! {
                _ = parent_status.wait_for(|s| *s != TaskStatus::Created && *s != TaskStatus::Waiting) => {}
                _ = self.cancel.cancelled() => return Err(self.interrupted_error()),
            }
            if !parent.has_started() {
                return Err(TaskError::ParentTerminated {
                    task: self.name.clone(),
                    parent: parent.name.clone(),
                });
            }
        }

        let mut pending = self.pending_predecessors.subscribe();
        tokio::select! {
            _ = pending.wait_for(|n| *n == 0) => {}
            _ = self.cancel.cancelled() => return Err(self.interrupted_error()),
        }
        {
            let state = self.lock_state();
            if !state.failed_predecessors.is_empty() {
                return Err(TaskError::PredecessorFailed {
                    task: self.name.clone(),
                    predecessors: state.failed_predecessors.clone(),
                });
            }
        }

        tokio::select! {
            _ = acquire_multiple(&resources) => {}
            _ = self.cancel.cancelled() => return Err(self.interrupted_error()),
        }

        {
            let mut state = self.lock_state();
            if state.done {
                drop(state);
                release_multiple(&resources);
                return Err(TaskError::AlreadyStarted(self.name.clone()));
            }
            state.started = true;
            state.holds_resources = !resources.is_empty();
            state.status = TaskStatus::Running;
        }
        self.status_tx.send_replace(TaskStatus::Running);
        debug!(task_id = self.id, task = %self.name, resources = resources.len(), "task running");
        Ok(())
    }

    /// Wait for every subtask to finish, release resources, and settle on a
    /// terminal status.
    ///
    /// `requested` is the status produced by the task's own work. It is
    /// overridden with FAILED if any subtask with [`OnFailure::Abort`] did
    /// not succeed. Calling this again after completion returns the settled
    /// status.
    pub async fn complete_when_ready(&self, requested: TaskStatus) -> TaskStatus {
        let mut child_done = self.child_done_rx.lock().await;

        let mut final_status = if requested.is_terminal() {
            requested
        } else {
            warn!(task = %self.name, %requested, "non-terminal completion status, treating as FAILED");
            TaskStatus::Failed
        };

        {
            let state = self.lock_state();
            if state.done {
                return state.status;
            }
            if !state.started && state.children_pending > 0 {
                // Children are waiting for a start that will never happen.
                drop(state);
                self.interrupt_children(TaskStatus::Aborted, None);
            }
        }

        // Settling happens under the same lock that observes zero pending
        // children, so `add_child` cannot slip in between.
        let (resources, parent_link, successors) = loop {
            {
                let mut state = self.lock_state();
                if state.children_pending == 0 {
                    let resources = if state.holds_resources {
                        state.holds_resources = false;
                        state.resources.clone()
                    } else {
                        Vec::new()
                    };
                    state.status = final_status;
                    state.done = true;
                    let parent_link = state.parent.as_ref().map(|l| l.done_tx.clone());
                    let successors: Vec<Arc<Task>> = state
                        .successors
                        .iter()
                        .map(|l| Arc::clone(&l.successor))
                        .collect();
                    break (resources, parent_link, successors);
                }
            }

            let Some(child_id) = child_done.recv().await else {
                // Unreachable while `self` owns a sender; settle anyway.
                self.lock_state().children_pending = 0;
                continue;
            };

            let link = {
                let mut state = self.lock_state();
                state.children_pending = state.children_pending.saturating_sub(1);
                state
                    .children
                    .iter()
                    .find(|l| l.child.id == child_id)
                    .map(|l| (Arc::clone(&l.child), l.on_failure))
            };
            let Some((child, on_failure)) = link else {
                continue;
            };

            let child_status = child.status();
            debug!(parent = %self.name, child = %child.name, status = %child_status, "subtask finished");
            if on_failure == OnFailure::Abort && child_status != TaskStatus::Success {
                if final_status != TaskStatus::Failed {
                    self.error(format!(
                        "subtask '{}' finished with {child_status}, failing",
                        child.name
                    ));
                }
                final_status = TaskStatus::Failed;
                self.interrupt_children(TaskStatus::Aborted, Some(child_id));
            }
        };

        release_multiple(&resources);
        self.status_tx.send_replace(final_status);
        drop(child_done);

        match final_status {
            TaskStatus::Success => info!(task_id = self.id, task = %self.name, "task succeeded"),
            other => warn!(task_id = self.id, task = %self.name, status = %other, "task finished"),
        }
        self.log.push(LogLevel::Info, format!("finished with {final_status}"));

        if let Some(done_tx) = parent_link {
            // The parent only drops its receiver together with itself.
            let _ = done_tx.send(self.id);
        }
        for successor in successors {
            successor.predecessor_finished(self.id, final_status);
        }

        final_status
    }

    fn predecessor_finished(&self, predecessor_id: u64, status: TaskStatus) {
        {
            let mut state = self.lock_state();
            let link = state
                .predecessors
                .iter()
                .find(|l| l.id == predecessor_id)
                .map(|l| (l.name.clone(), l.on_failure));
            if let Some((name, OnFailure::Abort)) = link
                && status != TaskStatus::Success
            {
                state.failed_predecessors.push(name);
            }
        }
        self.pending_predecessors
            .send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Wait until the task has settled on a terminal status.
    pub async fn wait_done(&self) -> TaskStatus {
        let mut rx = self.status_tx.subscribe();
        match rx.wait_for(|s| s.is_terminal()).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        }
    }

    /// Ask for another attempt.
    ///
    /// Returns `false` once the retry budget is exhausted or the task has
    /// completed. Otherwise increments the retry count and, if resources are
    /// held, releases and re-acquires them (honouring any backoff window).
    pub async fn retry(&self) -> bool {
        let resources = {
            let mut state = self.lock_state();
            if state.done || state.retries >= self.max_retries {
                return false;
            }
            state.retries += 1;
            if state.children_pending > 0 {
                warn!(task = %self.name, "retrying while subtasks are still pending");
            }
            if state.holds_resources {
                state.resources.clone()
            } else {
                Vec::new()
            }
        };

        let attempt = self.retries();
        self.warn(format!("retrying (attempt {attempt} of {})", self.max_retries));

        if !resources.is_empty() {
            release_multiple(&resources);
            tokio::select! {
                _ = acquire_multiple(&resources) => {}
                _ = self.cancel.cancelled() => {
                    self.lock_state().holds_resources = false;
                    return false;
                }
            }
        }
        true
    }

    /// Record an interrupt and forward it to every subtask.
    ///
    /// The first interrupt wins. Running work observes it through
    /// [`Task::interrupted`] or [`Task::cancellation_token`].
    pub fn interrupt(&self, status: TaskStatus) {
        {
            let mut state = self.lock_state();
            if state.done || state.interrupted.is_some() {
                return;
            }
            state.interrupted = Some(status);
        }
        self.log(LogLevel::Warn, format!("interrupted ({status})"));
        self.cancel.cancel();
        self.interrupt_children(status, None);
    }

    fn interrupt_children(&self, status: TaskStatus, except: Option<u64>) {
        let children: Vec<Arc<Task>> = self
            .lock_state()
            .children
            .iter()
            .filter(|l| Some(l.child.id) != except)
            .map(|l| Arc::clone(&l.child))
            .collect();
        for child in children {
            child.interrupt(status);
        }
    }

    /// Resolves once the task has been interrupted, yielding the interrupt
    /// status.
    pub async fn interrupted(&self) -> TaskStatus {
        self.cancel.cancelled().await;
        self.interrupt_status().unwrap_or(TaskStatus::Aborted)
    }

    pub fn interrupt_status(&self) -> Option<TaskStatus> {
        self.lock_state().interrupted
    }

    fn interrupted_error(&self) -> TaskError {
        TaskError::Interrupted {
            task: self.name.clone(),
            status: self.interrupt_status().unwrap_or(TaskStatus::Aborted),
        }
    }

    /// Full lifecycle: start, run `action` with retries, complete.
    ///
    /// The returned future must be driven to completion once the task has
    /// started; use [`Task::interrupt`] to stop it early.
    ///
    /// A [`CollabError::RateLimited`] anywhere in the error chain puts every
    /// required resource into backoff before the retry re-acquires them. An
    /// interrupt drops the in-flight attempt and completes with the interrupt
    /// status.
    pub async fn run<F, Fut>(self: &Arc<Self>, mut action: F) -> TaskStatus
    where
        F: FnMut(Arc<Task>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        if let Err(err) = self.start_when_ready().await {
            self.warn(format!("not started: {err}"));
            return self.complete_when_ready(TaskStatus::Aborted).await;
        }

        let status = loop {
            let attempt = action(Arc::clone(self));
            let result = tokio::select! {
                result = attempt => result,
                status = self.interrupted() => break status,
            };

            match result {
                Ok(()) => break TaskStatus::Success,
                Err(err) => {
                    self.error(format!("{err:#}"));
                    if let Some(CollabError::RateLimited { retry_after, .. }) =
                        err.chain().find_map(|e| e.downcast_ref::<CollabError>())
                    {
                        for resource in self.resources() {
                            resource.prohibit_for(*retry_after);
                        }
                    }
                    if self.retry().await {
                        continue;
                    }
                    break self.interrupt_status().unwrap_or(TaskStatus::Failed);
                }
            }
        };

        self.complete_when_ready(status).await
    }

    /// Snapshot of this task and its subtasks.
    pub fn status_tree(&self) -> StatusNode {
        let (status, retries, children, successors) = {
            let state = self.lock_state();
            (
                state.status,
                state.retries,
                state
                    .children
                    .iter()
                    .map(|l| Arc::clone(&l.child))
                    .collect::<Vec<_>>(),
                state
                    .successors
                    .iter()
                    .map(|l| l.successor.name.clone())
                    .collect::<Vec<_>>(),
            )
        };
        StatusNode {
            id: self.id,
            name: self.name.clone(),
            status,
            retries,
            logs: self.log.lines(),
            children: children.iter().map(|c| c.status_tree()).collect(),
            successors,
        }
    }
}

/// Lock two tasks' states in id order.
fn lock_pair<'a>(
    first: &'a Task,
    second: &'a Task,
) -> (MutexGuard<'a, TaskState>, MutexGuard<'a, TaskState>) {
    if first.id < second.id {
        let a = first.lock_state();
        let b = second.lock_state();
        (a, b)
    } else {
        let b = second.lock_state();
        let a = first.lock_state();
        (a, b)
    }
}
