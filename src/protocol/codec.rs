//! JSON framing for envelopes plus the serde helpers the wire shapes share.

use serde_json::Value;

use super::model::{ActivityRef, Envelope};
use crate::error::ProtocolError;

/// One decoded inbound frame.
#[derive(Debug)]
pub enum Inbound {
    Envelope(Envelope),
    /// An assign whose ids were readable but whose body was not. It still
    /// owes the orchestrator a completion.
    MalformedAssign {
        activity: ActivityRef,
        error: ProtocolError,
    },
    /// A well-formed non-assign message this worker could not decode, such
    /// as a type it does not know.
    Ignored { kind: String, error: ProtocolError },
}

/// Encode one envelope as a single JSON document.
pub fn encode(envelope: &Envelope) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Decode one JSON document into an envelope.
pub fn decode(text: &str) -> Result<Envelope, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

/// Decode a binary frame that carries UTF-8 JSON.
pub fn decode_bytes(bytes: &[u8]) -> Result<Envelope, ProtocolError> {
    let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::NonUtf8Frame)?;
    decode(text)
}

/// Decode a text frame. Frames that fail to decode are salvaged when they can
/// be answered or safely dropped; anything else is an error.
pub fn decode_frame(text: &str) -> Result<Inbound, ProtocolError> {
    let error = match decode(text) {
        Ok(envelope) => return Ok(Inbound::Envelope(envelope)),
        Err(e) => e,
    };

    let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(text) else {
        return Err(error);
    };
    let field = |name: &str| fields.get(name).and_then(Value::as_str);

    match field("type") {
        Some("assign") => match field("activity_id").filter(|id| !id.is_empty()) {
            Some(activity_id) => Ok(Inbound::MalformedAssign {
                activity: ActivityRef {
                    activity_id: activity_id.to_string(),
                    run_id: field("run_id").unwrap_or_default().to_string(),
                },
                error,
            }),
            None => Err(error),
        },
        Some(kind) => Ok(Inbound::Ignored {
            kind: kind.to_string(),
            error,
        }),
        None => Err(error),
    }
}

/// Binary counterpart of [`decode_frame`].
pub fn decode_frame_bytes(bytes: &[u8]) -> Result<Inbound, ProtocolError> {
    let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::NonUtf8Frame)?;
    decode_frame(text)
}

/// Optional string where `""` reads as absent (protobuf default-value semantics).
pub(crate) mod string_opt {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        Ok(raw.filter(|s| !s.is_empty()))
    }
}

/// Optional byte string carried as standard base64; `""` reads as absent.
pub(crate) mod base64_opt {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_some(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        match raw.as_deref() {
            None | Some("") => Ok(None),
            Some(encoded) => STANDARD
                .decode(encoded)
                .map(Some)
                .map_err(|e| serde::de::Error::custom(format!("invalid base64: {e}"))),
        }
    }
}
