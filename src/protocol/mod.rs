//! Task stream protocol.
//!
//! - `model`: wire types (Envelope and its variants, assignment, completion)
//! - `codec`: one JSON document per frame

pub mod codec;
pub mod model;

pub use codec::{Inbound, decode, decode_bytes, decode_frame, decode_frame_bytes, encode};
pub use model::{
    ActivityRef, Capabilities, Completion, CompletionStatus, Envelope, Hello, InputDescriptor,
    InputPayload, Progress, TaskAssignment, TaskKey, TaskResult,
};
