//! Typed replication messages and their envelope codec.

use super::envelope::Envelope;
use crate::primitives::{
    EDGE_ADDED_MSG_TYPE, EDGE_DELETED_MSG_TYPE, EDGE_UPDATED_MSG_TYPE, NODE_ADDED_MSG_TYPE,
    NODE_DELETED_MSG_TYPE, NODE_UPDATED_MSG_TYPE, ORIGIN_GRAPH_DELETED_MSG_TYPE,
    SYNC_MSG_TYPE, SYNC_REPLY_MSG_TYPE, SYNC_REQUEST_MSG_TYPE,
};
use crate::{Edge, Node, TimeSlice, Timestamp, TopologyError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// PAYLOADS
// =============================================================================

/// A peer asking for the graph (optionally as of a time slice, optionally
/// narrowed by a filter expression).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SyncRequest {
    #[serde(default)]
    pub time_slice: Option<TimeSlice>,
    #[serde(default)]
    pub gremlin_filter: String,
}

/// Inbound shape of a sync request, including the legacy single `Time`.
#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SyncRequestWire {
    #[serde(default)]
    time: i64,
    #[serde(default)]
    time_slice: Option<TimeSlice>,
    #[serde(default)]
    gremlin_filter: String,
}

/// A full or filtered graph state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SyncSnapshot {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl SyncSnapshot {
    /// True when the snapshot carries no entity.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }
}

// =============================================================================
// MESSAGE
// =============================================================================

/// A replication message.
///
/// Tags this codec does not know decode to `Unknown` carrying the untouched
/// envelope, so newer peers can talk to older ones.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    SyncRequest(SyncRequest),
    Sync(SyncSnapshot),
    SyncReply(SyncSnapshot),
    OriginGraphDeleted(String),
    NodeAdded(Node),
    NodeUpdated(Node),
    NodeDeleted(Node),
    EdgeAdded(Edge),
    EdgeUpdated(Edge),
    EdgeDeleted(Edge),
    Unknown(Envelope),
}

impl Message {
    /// The wire tag of this message.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::SyncRequest(_) => SYNC_REQUEST_MSG_TYPE,
            Self::Sync(_) => SYNC_MSG_TYPE,
            Self::SyncReply(_) => SYNC_REPLY_MSG_TYPE,
            Self::OriginGraphDeleted(_) => ORIGIN_GRAPH_DELETED_MSG_TYPE,
            Self::NodeAdded(_) => NODE_ADDED_MSG_TYPE,
            Self::NodeUpdated(_) => NODE_UPDATED_MSG_TYPE,
            Self::NodeDeleted(_) => NODE_DELETED_MSG_TYPE,
            Self::EdgeAdded(_) => EDGE_ADDED_MSG_TYPE,
            Self::EdgeUpdated(_) => EDGE_UPDATED_MSG_TYPE,
            Self::EdgeDeleted(_) => EDGE_DELETED_MSG_TYPE,
            Self::Unknown(envelope) => &envelope.kind,
        }
    }

    /// Decode an envelope into a typed message.
    ///
    /// # Errors
    ///
    /// - `SyncRequestMalformed` when a `SyncRequest` payload is not an object
    /// - `SyncMalformed` when a `Sync`/`SyncReply` payload lacks `Nodes` or `Edges`
    /// - `MessageMalformed` when any other known payload fails to decode
    pub fn decode(envelope: Envelope) -> Result<Self, TopologyError> {
        let Envelope { kind, payload } = envelope;
        let message = match kind.as_str() {
            SYNC_REQUEST_MSG_TYPE => Self::SyncRequest(decode_sync_request(payload)?),
            SYNC_MSG_TYPE => Self::Sync(decode_snapshot(payload)?),
            SYNC_REPLY_MSG_TYPE => Self::SyncReply(decode_snapshot(payload)?),
            ORIGIN_GRAPH_DELETED_MSG_TYPE => {
                Self::OriginGraphDeleted(decode_entity(&kind, payload)?)
            }
            NODE_ADDED_MSG_TYPE => Self::NodeAdded(decode_entity(&kind, payload)?),
            NODE_UPDATED_MSG_TYPE => Self::NodeUpdated(decode_entity(&kind, payload)?),
            NODE_DELETED_MSG_TYPE => Self::NodeDeleted(decode_entity(&kind, payload)?),
            EDGE_ADDED_MSG_TYPE => Self::EdgeAdded(decode_entity(&kind, payload)?),
            EDGE_UPDATED_MSG_TYPE => Self::EdgeUpdated(decode_entity(&kind, payload)?),
            EDGE_DELETED_MSG_TYPE => Self::EdgeDeleted(decode_entity(&kind, payload)?),
            _ => {
                tracing::trace!(kind = %kind, "passing through unknown message");
                Self::Unknown(Envelope { kind, payload })
            }
        };
        Ok(message)
    }

    /// Encode into an envelope. `SyncRequest` always carries `TimeSlice`.
    pub fn encode(&self) -> Result<Envelope, TopologyError> {
        let payload = match self {
            Self::SyncRequest(request) => to_payload(request)?,
            Self::Sync(snapshot) | Self::SyncReply(snapshot) => to_payload(snapshot)?,
            Self::OriginGraphDeleted(origin) => Value::String(origin.clone()),
            Self::NodeAdded(node) | Self::NodeUpdated(node) | Self::NodeDeleted(node) => {
                to_payload(node)?
            }
            Self::EdgeAdded(edge) | Self::EdgeUpdated(edge) | Self::EdgeDeleted(edge) => {
                to_payload(edge)?
            }
            Self::Unknown(envelope) => return Ok(envelope.clone()),
        };
        Ok(Envelope::new(self.kind(), payload))
    }

    /// Parse raw JSON bytes into a typed message.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TopologyError> {
        Self::decode(Envelope::from_slice(bytes)?)
    }

    /// Serialize to raw JSON bytes.
    pub fn to_vec(&self) -> Result<Vec<u8>, TopologyError> {
        self.encode()?.to_vec()
    }
}

fn to_payload<T: Serialize>(value: &T) -> Result<Value, TopologyError> {
    serde_json::to_value(value).map_err(|e| TopologyError::Serialization(e.to_string()))
}

fn decode_entity<T: DeserializeOwned>(kind: &str, payload: Value) -> Result<T, TopologyError> {
    serde_json::from_value(payload).map_err(|e| TopologyError::MessageMalformed {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

fn decode_sync_request(payload: Value) -> Result<SyncRequest, TopologyError> {
    if !payload.is_object() {
        return Err(TopologyError::SyncRequestMalformed(
            "payload is not an object".to_string(),
        ));
    }
    let wire: SyncRequestWire = serde_json::from_value(payload)
        .map_err(|e| TopologyError::SyncRequestMalformed(e.to_string()))?;

    // An explicit slice wins; a non-zero legacy Time designates one instant.
    let time_slice = wire.time_slice.or_else(|| {
        (wire.time != 0).then(|| TimeSlice::instant(Timestamp::from_millis(wire.time)))
    });
    Ok(SyncRequest {
        time_slice,
        gremlin_filter: wire.gremlin_filter,
    })
}

fn decode_snapshot(payload: Value) -> Result<SyncSnapshot, TopologyError> {
    let Value::Object(mut fields) = payload else {
        return Err(TopologyError::SyncMalformed(
            "payload is not an object".to_string(),
        ));
    };
    let (Some(nodes), Some(edges)) = (fields.remove("Nodes"), fields.remove("Edges")) else {
        return Err(TopologyError::SyncMalformed(
            "payload must carry both Nodes and Edges".to_string(),
        ));
    };
    Ok(SyncSnapshot {
        nodes: decode_list(nodes)?,
        edges: decode_list(edges)?,
    })
}

/// A JSON array of entities; `null` reads as empty.
fn decode_list<T: DeserializeOwned>(value: Value) -> Result<Vec<T>, TopologyError> {
    if value.is_null() {
        return Ok(Vec::new());
    }
    serde_json::from_value(value).map_err(|e| TopologyError::SyncMalformed(e.to_string()))
}
