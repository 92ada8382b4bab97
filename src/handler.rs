//! Task handler abstraction.
//!
//! A handler is opaque business logic for one (kind, version). It runs on a
//! blocking thread, may take arbitrarily long, and reports failure through
//! `HandlerError` rather than by tearing anything down.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::protocol::{ActivityRef, Progress, TaskAssignment, TaskResult};

/// Failure raised by a handler. The message is surfaced verbatim in the completion.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Executable unit of work for one (kind, version).
pub trait TaskHandler: Send + Sync {
    /// Run the task. May block.
    fn execute(
        &self,
        assignment: &TaskAssignment,
        ctx: &TaskContext,
    ) -> Result<TaskResult, HandlerError>;
}

impl<F> TaskHandler for F
where
    F: Fn(&TaskAssignment, &TaskContext) -> Result<TaskResult, HandlerError> + Send + Sync,
{
    fn execute(
        &self,
        assignment: &TaskAssignment,
        ctx: &TaskContext,
    ) -> Result<TaskResult, HandlerError> {
        self(assignment, ctx)
    }
}

/// Latest progress reported by a handler, read by the session's ticker.
#[derive(Debug, Default)]
struct ProgressState {
    percent: AtomicU8,
    detail: Mutex<ProgressDetail>,
}

#[derive(Debug, Default, Clone)]
struct ProgressDetail {
    message: Option<String>,
    checkpoint_ref: Option<String>,
}

/// Per-assignment context handed to the handler.
#[derive(Debug, Clone)]
pub struct TaskContext {
    activity: ActivityRef,
    cancel: CancellationToken,
    progress: Arc<ProgressState>,
}

impl TaskContext {
    pub fn new(activity: ActivityRef, cancel: CancellationToken) -> Self {
        Self {
            activity,
            cancel,
            progress: Arc::new(ProgressState::default()),
        }
    }

    pub fn activity(&self) -> &ActivityRef {
        &self.activity
    }

    /// True once the session has asked in-flight work to stop.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Record progress. Percent is clamped to 100.
    pub fn report_progress(&self, percent: u8, message: Option<String>) {
        self.progress
            .percent
            .store(percent.min(100), Ordering::Relaxed);
        let mut detail = self
            .progress
            .detail
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        detail.message = message;
    }

    /// Record a resumable checkpoint location.
    pub fn checkpoint(&self, checkpoint_ref: impl Into<String>) {
        let mut detail = self
            .progress
            .detail
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        detail.checkpoint_ref = Some(checkpoint_ref.into());
    }

    /// Current progress as a wire message.
    pub fn progress_snapshot(&self) -> Progress {
        let detail = self
            .progress
            .detail
            .lock()
            .map(|d| d.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone());
        Progress {
            activity_id: self.activity.activity_id.clone(),
            run_id: self.activity.run_id.clone(),
            percent: self.progress.percent.load(Ordering::Relaxed),
            message: detail.message,
            checkpoint_ref: detail.checkpoint_ref,
        }
    }
}
