//! Task stream data model: assignments, completions, progress and the envelope.

use serde::{Deserialize, Serialize};

use super::codec::{base64_opt, string_opt};
use crate::error::ProtocolError;

/// Handler selector: a task kind plus its version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    pub kind: String,
    pub version: String,
}

impl TaskKey {
    pub fn new(kind: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            version: version.into(),
        }
    }
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.version)
    }
}

/// Identity of one answered unit of work: the pair a Completion is keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivityRef {
    pub activity_id: String,
    pub run_id: String,
}

impl std::fmt::Display for ActivityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.activity_id, self.run_id)
    }
}

// ── Inputs ──────────────────────────────────────────────────────────────

/// The value carried by an input descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputPayload {
    /// External location (object store key, URL, ...).
    Ref(String),
    /// Textual JSON payload.
    InlineJson(String),
    /// Binary payload.
    InlineBytes(Vec<u8>),
}

/// One named input of an assignment. `payload: None` means "absent value".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "InputDescriptorWire", into = "InputDescriptorWire")]
pub struct InputDescriptor {
    pub name: String,
    pub media_type: String,
    pub payload: Option<InputPayload>,
}

impl InputDescriptor {
    pub fn new(name: impl Into<String>, media_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            media_type: media_type.into(),
            payload: None,
        }
    }

    pub fn with_ref(mut self, location: impl Into<String>) -> Self {
        self.payload = Some(InputPayload::Ref(location.into()));
        self
    }

    pub fn with_json(mut self, json: impl Into<String>) -> Self {
        self.payload = Some(InputPayload::InlineJson(json.into()));
        self
    }

    pub fn with_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.payload = Some(InputPayload::InlineBytes(bytes.into()));
        self
    }
}

/// Flat wire shape: three optional payload keys, at most one populated.
#[derive(Serialize, Deserialize)]
struct InputDescriptorWire {
    name: String,
    #[serde(default)]
    media_type: String,
    #[serde(
        rename = "ref",
        default,
        deserialize_with = "string_opt::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    reference: Option<String>,
    #[serde(
        default,
        deserialize_with = "string_opt::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    inline_json: Option<String>,
    #[serde(default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
    inline_bytes: Option<Vec<u8>>,
}

impl TryFrom<InputDescriptorWire> for InputDescriptor {
    type Error = ProtocolError;

    fn try_from(wire: InputDescriptorWire) -> Result<Self, Self::Error> {
        let mut payloads = [
            wire.reference.map(InputPayload::Ref),
            wire.inline_json.map(InputPayload::InlineJson),
            wire.inline_bytes.map(InputPayload::InlineBytes),
        ]
        .into_iter()
        .flatten();

        let payload = payloads.next();
        if payloads.next().is_some() {
            return Err(ProtocolError::ConflictingPayload { input: wire.name });
        }

        Ok(Self {
            name: wire.name,
            media_type: wire.media_type,
            payload,
        })
    }
}

impl From<InputDescriptor> for InputDescriptorWire {
    fn from(input: InputDescriptor) -> Self {
        let mut wire = Self {
            name: input.name,
            media_type: input.media_type,
            reference: None,
            inline_json: None,
            inline_bytes: None,
        };
        match input.payload {
            Some(InputPayload::Ref(r)) => wire.reference = Some(r),
            Some(InputPayload::InlineJson(j)) => wire.inline_json = Some(j),
            Some(InputPayload::InlineBytes(b)) => wire.inline_bytes = Some(b),
            None => {}
        }
        wire
    }
}

// ── Assignment ──────────────────────────────────────────────────────────

/// One unit of work pushed by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub activity_id: String,
    #[serde(default)]
    pub workflow_instance_id: String,
    #[serde(default)]
    pub run_id: String,
    pub task_kind: String,
    pub task_version: String,
    #[serde(default)]
    pub inputs: Vec<InputDescriptor>,
    /// Base location for result artifacts.
    #[serde(default)]
    pub upload_prefix: String,
    /// Advisory only.
    #[serde(default)]
    pub soft_deadline_unix: i64,
    /// Progress cadence in seconds; 0 disables progress emission.
    #[serde(default)]
    pub heartbeat_interval_s: u64,
}

impl TaskAssignment {
    pub fn new(
        activity_id: impl Into<String>,
        run_id: impl Into<String>,
        task_kind: impl Into<String>,
        task_version: impl Into<String>,
    ) -> Self {
        Self {
            activity_id: activity_id.into(),
            workflow_instance_id: String::new(),
            run_id: run_id.into(),
            task_kind: task_kind.into(),
            task_version: task_version.into(),
            inputs: Vec::new(),
            upload_prefix: String::new(),
            soft_deadline_unix: 0,
            heartbeat_interval_s: 0,
        }
    }

    pub fn with_input(mut self, input: InputDescriptor) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_upload_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.upload_prefix = prefix.into();
        self
    }

    pub fn with_heartbeat(mut self, interval_s: u64) -> Self {
        self.heartbeat_interval_s = interval_s;
        self
    }

    pub fn key(&self) -> TaskKey {
        TaskKey::new(&self.task_kind, &self.task_version)
    }

    pub fn activity(&self) -> ActivityRef {
        ActivityRef {
            activity_id: self.activity_id.clone(),
            run_id: self.run_id.clone(),
        }
    }

    /// Look up an input by name.
    pub fn input(&self, name: &str) -> Option<&InputDescriptor> {
        self.inputs.iter().find(|i| i.name == name)
    }
}

// ── Results ─────────────────────────────────────────────────────────────

/// What a handler produces on success.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskResult {
    pub result_ref: Option<String>,
    pub result_inline: Option<Vec<u8>>,
}

impl TaskResult {
    /// A result stored at an external location.
    pub fn reference(location: impl Into<String>) -> Self {
        Self {
            result_ref: Some(location.into()),
            result_inline: None,
        }
    }

    /// A result carried inline in the completion.
    pub fn inline(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            result_ref: None,
            result_inline: Some(bytes.into()),
        }
    }

    /// A success with no result payload.
    pub fn empty() -> Self {
        Self::default()
    }

    /// True when neither field carries data. Empty values count as unset,
    /// matching how they read back off the wire.
    pub fn is_empty(&self) -> bool {
        self.result_ref.as_deref().is_none_or(str::is_empty)
            && self.result_inline.as_deref().is_none_or(<[u8]>::is_empty)
    }
}

/// Terminal status of a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionStatus {
    Success,
    Error,
}

impl std::fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Terminal result for one assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub activity_id: String,
    pub run_id: String,
    pub status: CompletionStatus,
    #[serde(
        default,
        deserialize_with = "string_opt::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub result_ref: Option<String>,
    #[serde(default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
    pub result_inline: Option<Vec<u8>>,
    #[serde(
        default,
        deserialize_with = "string_opt::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub error: Option<String>,
}

impl Completion {
    /// Successful completion carrying the handler's result unchanged.
    pub fn success(activity: &ActivityRef, result: TaskResult) -> Self {
        Self {
            activity_id: activity.activity_id.clone(),
            run_id: activity.run_id.clone(),
            status: CompletionStatus::Success,
            result_ref: result.result_ref,
            result_inline: result.result_inline,
            error: None,
        }
    }

    /// Failed completion with a human-readable message.
    pub fn failure(activity: &ActivityRef, error: impl Into<String>) -> Self {
        Self {
            activity_id: activity.activity_id.clone(),
            run_id: activity.run_id.clone(),
            status: CompletionStatus::Error,
            result_ref: None,
            result_inline: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CompletionStatus::Success
    }

    pub fn activity(&self) -> ActivityRef {
        ActivityRef {
            activity_id: self.activity_id.clone(),
            run_id: self.run_id.clone(),
        }
    }
}

/// Progress report for a running assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub activity_id: String,
    pub run_id: String,
    /// 0..=100.
    pub percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_ref: Option<String>,
}

// ── Control messages ────────────────────────────────────────────────────

/// Connection greeting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

/// Informational capability advertisement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub max_concurrency: u32,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A single message on the task stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Hello(Hello),
    Capabilities(Capabilities),
    Assign(TaskAssignment),
    Completion(Completion),
    Progress(Progress),
}

impl Envelope {
    /// Short name of the carried variant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::Capabilities(_) => "capabilities",
            Self::Assign(_) => "assign",
            Self::Completion(_) => "completion",
            Self::Progress(_) => "progress",
        }
    }
}
