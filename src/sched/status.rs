// src/sched/status.rs

//! Task status values, per-task captured logs, and the status tree used for
//! human-readable reports.

use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Lifecycle of a task.
///
/// `Created -> Waiting -> Running -> {Success, Failed, Aborted}`.
/// Terminal states are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Created,
    Waiting,
    Running,
    Success,
    Failed,
    Aborted,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Aborted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Created => "CREATED",
            TaskStatus::Waiting => "WAITING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a failure on one side of a relationship does to the other side.
///
/// - For parent/child: `Abort` forces the parent to FAILED when the child
///   does not succeed; `Continue` lets the parent succeed anyway.
/// - For predecessor/successor: `Abort` prevents the successor from starting
///   when the predecessor does not succeed; `Continue` only waits for the
///   predecessor to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    Abort,
    Continue,
}

/// Severity of a captured task log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// One captured line, stamped with the time since the task was created.
#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub elapsed: Duration,
    pub level: LogLevel,
    pub message: String,
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:>8.3}s] [{}] {}",
            self.elapsed.as_secs_f64(),
            self.level,
            self.message
        )
    }
}

/// Log buffer owned by a single task.
#[derive(Debug)]
pub struct TaskLog {
    created: Instant,
    lines: Mutex<Vec<LogLine>>,
}

impl TaskLog {
    pub fn new() -> Self {
        Self {
            created: Instant::now(),
            lines: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, level: LogLevel, message: impl Into<String>) {
        let line = LogLine {
            elapsed: self.created.elapsed(),
            level,
            message: message.into(),
        };
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);
    }

    pub fn lines(&self) -> Vec<LogLine> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn text(&self) -> String {
        self.lines()
            .iter()
            .map(|l| l.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Default for TaskLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of a task and everything nested under it.
#[derive(Debug, Clone, Serialize)]
pub struct StatusNode {
    pub id: u64,
    pub name: String,
    pub status: TaskStatus,
    pub retries: u32,
    pub logs: Vec<LogLine>,
    pub children: Vec<StatusNode>,
    /// Names of tasks sequenced after this one.
    pub successors: Vec<String>,
}

impl StatusNode {
    /// Depth-first search by task name.
    pub fn find(&self, name: &str) -> Option<&StatusNode> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(name))
    }

    /// Total number of nodes in this tree.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(StatusNode::node_count).sum::<usize>()
    }

    fn write_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize, with_logs: bool) -> fmt::Result {
        let pad = "  ".repeat(depth);
        write!(f, "{pad}- {} [{}]", self.name, self.status)?;
        if self.retries > 0 {
            write!(f, " (retries: {})", self.retries)?;
        }
        writeln!(f)?;
        if with_logs {
            for line in &self.logs {
                writeln!(f, "{pad}    {line}")?;
            }
        }
        for child in &self.children {
            child.write_indented(f, depth + 1, with_logs)?;
        }
        Ok(())
    }
}

/// Renders an indented tree. The alternate form (`{:#}`) includes log lines.
impl fmt::Display for StatusNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_indented(f, 0, f.alternate())
    }
}
