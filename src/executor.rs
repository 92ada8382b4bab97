//! Execution offload: bounded, off-loop handler invocation.
//!
//! One `Executor` is shared by every session so the concurrency bound is
//! process-wide. A slot is held for exactly as long as the handler runs: the
//! permit travels into the blocking closure and is released when the handler
//! returns, whether or not anyone is still waiting for the answer.

use std::any::Any;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tracing::{debug, info, warn};

use crate::error::ExecutionError;
use crate::handler::TaskContext;
use crate::protocol::{Completion, TaskAssignment, TaskResult};
use crate::registry::HandlerRegistry;
use crate::validation;

/// Default number of concurrent handler invocations.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Runs handlers on the blocking pool, at most `max_concurrency` at a time.
#[derive(Debug)]
pub struct Executor {
    registry: Arc<HandlerRegistry>,
    slots: Arc<Semaphore>,
    max_concurrency: usize,
}

impl Executor {
    /// Create an executor. A zero limit is raised to one.
    pub fn new(registry: Arc<HandlerRegistry>, max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            registry,
            slots: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
        }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Slots currently free.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Handler invocations currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.max_concurrency
            .saturating_sub(self.slots.available_permits())
    }

    /// Execute one assignment and produce its completion. Never fails: every
    /// assignment-scoped error becomes an ERROR completion.
    pub async fn execute(&self, assignment: Arc<TaskAssignment>, ctx: TaskContext) -> Completion {
        let activity = assignment.activity();
        let task = assignment.key();

        match self.run(assignment, ctx).await {
            Ok(result) => {
                info!(activity = %activity, task = %task, "Task succeeded");
                Completion::success(&activity, result)
            }
            Err(e) => {
                warn!(activity = %activity, task = %task, error = %e, "Task failed");
                Completion::failure(&activity, e.to_string())
            }
        }
    }

    async fn run(
        &self,
        assignment: Arc<TaskAssignment>,
        ctx: TaskContext,
    ) -> Result<TaskResult, ExecutionError> {
        let key = assignment.key();

        // Unknown tasks are rejected before touching the pool.
        let handler = self
            .registry
            .lookup(&key)
            .ok_or_else(|| ExecutionError::NoHandler { task: key.clone() })?;

        let spec = self.registry.specification(&key);
        if let Some(spec) = &spec {
            validation::validate_inputs(spec, &assignment)?;
        }

        let permit = tokio::select! {
            // The semaphore is never closed, so an acquire error only means
            // no slot will ever be granted.
            permit = Arc::clone(&self.slots).acquire_owned() => {
                permit.map_err(|_| ExecutionError::Cancelled)?
            }
            _ = ctx.cancellation().cancelled() => return Err(ExecutionError::Cancelled),
        };
        debug!(
            activity_id = %assignment.activity_id,
            task = %key,
            available = self.slots.available_permits(),
            "Acquired execution slot"
        );

        let job = Arc::clone(&assignment);
        let result = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            handler.execute(&job, &ctx)
        })
        .await
        .map_err(|e| ExecutionError::HandlerFailed {
            message: join_error_message(e),
        })?
        .map_err(|e| ExecutionError::HandlerFailed { message: e.message })?;

        if let Some(spec) = &spec {
            validation::validate_outputs(spec, &assignment, &result)?;
        }

        Ok(result)
    }
}

fn join_error_message(err: JoinError) -> String {
    if err.is_panic() {
        format!("Handler panicked: {}", panic_message(err.into_panic()))
    } else {
        "Handler was cancelled".to_string()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
