//! Transport envelope: `{"type": <tag>, "payload": <any JSON>}`.

use crate::TopologyError;
use crate::primitives::MAX_ENVELOPE_BYTES;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tagged payload as it travels between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Wrap a payload under a message tag.
    #[must_use]
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Parse an envelope from raw JSON bytes.
    ///
    /// Inputs larger than `MAX_ENVELOPE_BYTES` are refused before parsing.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TopologyError> {
        if bytes.len() > MAX_ENVELOPE_BYTES {
            return Err(TopologyError::MessageMalformed {
                kind: "envelope".to_string(),
                reason: format!(
                    "{} bytes exceeds the {} byte limit",
                    bytes.len(),
                    MAX_ENVELOPE_BYTES
                ),
            });
        }
        serde_json::from_slice(bytes).map_err(|e| TopologyError::MessageMalformed {
            kind: "envelope".to_string(),
            reason: e.to_string(),
        })
    }

    /// Serialize the envelope to JSON bytes.
    pub fn to_vec(&self) -> Result<Vec<u8>, TopologyError> {
        serde_json::to_vec(self).map_err(|e| TopologyError::Serialization(e.to_string()))
    }
}
