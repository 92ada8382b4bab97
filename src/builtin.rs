//! Built-in task handlers registered by the worker binary.

use std::sync::Arc;
use std::time::Duration;

use crate::config::WorkerConfig;
use crate::handler::{HandlerError, TaskContext, TaskHandler};
use crate::protocol::{InputPayload, TaskAssignment, TaskKey, TaskResult};
use crate::registry::HandlerRegistry;

pub const PREPROCESS_KIND: &str = "video.preprocess";
pub const ECHO_KIND: &str = "builtin.echo";
pub const BUILTIN_VERSION: &str = "1.0.0";

// ── video.preprocess ────────────────────────────────────────────────────

/// Simulated preprocessing: a few timed steps, then a result artifact under
/// the assignment's upload prefix.
#[derive(Debug, Clone)]
pub struct PreprocessHandler {
    steps: u8,
    step_duration: Duration,
}

impl Default for PreprocessHandler {
    fn default() -> Self {
        Self {
            steps: 4,
            step_duration: Duration::from_millis(250),
        }
    }
}

impl PreprocessHandler {
    pub fn new(steps: u8, step_duration: Duration) -> Self {
        Self {
            steps: steps.max(1),
            step_duration,
        }
    }

    fn result_location(prefix: &str) -> String {
        let prefix = prefix.trim_end_matches('/');
        if prefix.is_empty() {
            "preprocess/result.json".to_string()
        } else {
            format!("{prefix}/preprocess/result.json")
        }
    }
}

impl TaskHandler for PreprocessHandler {
    fn execute(
        &self,
        assignment: &TaskAssignment,
        ctx: &TaskContext,
    ) -> Result<TaskResult, HandlerError> {
        for step in 0..self.steps {
            if ctx.is_cancelled() {
                return Err(HandlerError::new(format!(
                    "Preprocessing cancelled after {step} of {} steps",
                    self.steps
                )));
            }
            std::thread::sleep(self.step_duration);
            let percent = ((u32::from(step) + 1) * 100 / u32::from(self.steps)) as u8;
            ctx.report_progress(percent, Some(format!("step {}/{}", step + 1, self.steps)));
        }

        let location = Self::result_location(&assignment.upload_prefix);
        ctx.checkpoint(location.clone());
        Ok(TaskResult::reference(location))
    }
}

// ── builtin.echo ────────────────────────────────────────────────────────

/// Returns the first inline input (JSON or bytes) as the inline result.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

impl TaskHandler for EchoHandler {
    fn execute(
        &self,
        assignment: &TaskAssignment,
        _ctx: &TaskContext,
    ) -> Result<TaskResult, HandlerError> {
        assignment
            .inputs
            .iter()
            .find_map(|input| match &input.payload {
                Some(InputPayload::InlineJson(json)) => Some(json.as_bytes().to_vec()),
                Some(InputPayload::InlineBytes(bytes)) => Some(bytes.clone()),
                _ => None,
            })
            .map(TaskResult::inline)
            .ok_or_else(|| HandlerError::new("No inline input to echo"))
    }
}

/// Register every built-in handler.
pub fn register_builtin_handlers(registry: &mut HandlerRegistry) {
    registry.register(
        TaskKey::new(PREPROCESS_KIND, BUILTIN_VERSION),
        Arc::new(PreprocessHandler::default()),
    );
    registry.register(TaskKey::new(ECHO_KIND, BUILTIN_VERSION), Arc::new(EchoHandler));
    tracing::info!(count = registry.len(), "Registered built-in handlers");
}

/// Registry for the worker binary: built-ins plus any configured specification file.
pub fn worker_registry(config: &WorkerConfig) -> crate::error::Result<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    register_builtin_handlers(&mut registry);
    if let Some(ref path) = config.spec_path {
        registry.bind_specifications_from_file(path)?;
    }
    Ok(registry)
}
