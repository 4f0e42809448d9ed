//! # API Request/Response Types
//!
//! This module defines the JSON structures for the HTTP API.

use serde::{Deserialize, Serialize};
use topostore_core::{
    Envelope, FilterResolver, Metadata, MetadataFilterResolver, TimeSlice, Timestamp,
    TopologyError,
};

// =============================================================================
// HEALTH RESPONSE
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

// =============================================================================
// STATUS RESPONSE
// =============================================================================

/// Graph status response.
///
/// `nodes`/`edges` count live entities in the durable store; the `cached_*`
/// counts come from the in-memory index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub nodes: usize,
    pub edges: usize,
    pub cached_nodes: usize,
    pub cached_edges: usize,
    pub mode: String,
    pub origin: String,
}

// =============================================================================
// MODE REQUEST/RESPONSE
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeRequest {
    pub mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeResponse {
    pub mode: String,
}

// =============================================================================
// MESSAGE RESPONSE
// =============================================================================

/// Result of applying one inbound replication message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    /// Envelope type that was applied.
    #[serde(rename = "type")]
    pub kind: String,
    /// Answer to send back to the peer, e.g. a `SyncReply`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<Envelope>,
}

// =============================================================================
// ERROR RESPONSE
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Whether the caller may retry after re-reading state.
    pub retryable: bool,
}

// =============================================================================
// READ QUERY
// =============================================================================

/// Query string shared by the read endpoints.
///
/// - `at`: read the graph as of this instant (ms)
/// - `from`/`to`: read everything alive during this interval (ms); `to`
///   defaults to now
/// - `filter`: JSON object of metadata equalities, e.g. `{"Type":"host"}`
///
/// Without `at` or `from` the live graph is read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadQuery {
    pub at: Option<i64>,
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub filter: Option<String>,
}

impl ReadQuery {
    /// The time slice this query asks for, if any.
    pub fn slice(&self) -> Result<Option<TimeSlice>, TopologyError> {
        match (self.at, self.from, self.to) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => Err(TopologyError::Config(
                "'at' cannot be combined with 'from'/'to'".to_string(),
            )),
            (Some(at), None, None) => Ok(Some(TimeSlice::instant(Timestamp::from_millis(at)))),
            (None, Some(from), to) => Ok(Some(TimeSlice::new(
                Timestamp::from_millis(from),
                to.map(Timestamp::from_millis).unwrap_or_else(Timestamp::now),
            ))),
            (None, None, Some(_)) => Err(TopologyError::Config(
                "'to' requires 'from'".to_string(),
            )),
            (None, None, None) => Ok(None),
        }
    }

    /// The metadata filter this query asks for (empty matches everything).
    pub fn filter(&self) -> Result<Metadata, TopologyError> {
        MetadataFilterResolver.resolve(self.filter.as_deref().unwrap_or_default())
    }
}
