//! # API Endpoint Handlers
//!
//! Every core call runs on the blocking pool under the configured request
//! deadline. A call that misses the deadline is answered with 504; the call
//! itself still runs to completion, so a write may land after the client gave
//! up on it.

use super::{
    AppState,
    types::{
        ErrorResponse, HealthResponse, MessageResponse, ModeRequest, ModeResponse, ReadQuery,
        StatusResponse,
    },
};
use crate::topology::Topology;
use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::time::Duration;
use topostore_core::{
    CacheMode, Edge, Envelope, Graph, GraphContext, Identifier, Message, Node, RevisionRecord,
    TimeSlice, TopologyError,
};

// =============================================================================
// ERRORS
// =============================================================================

/// Failure of one API call.
#[derive(Debug)]
pub enum ApiError {
    Core(TopologyError),
    Timeout(Duration),
    Internal(String),
}

impl From<TopologyError> for ApiError {
    fn from(e: TopologyError) -> Self {
        Self::Core(e)
    }
}

/// HTTP status for a core error.
pub fn status_for(error: &TopologyError) -> StatusCode {
    match error {
        TopologyError::NodeNotFound(_) | TopologyError::EdgeNotFound(_) => StatusCode::NOT_FOUND,
        TopologyError::Conflict { .. } => StatusCode::CONFLICT,
        TopologyError::SyncRequestMalformed(_)
        | TopologyError::SyncMalformed(_)
        | TopologyError::MessageMalformed { .. }
        | TopologyError::InvalidMode(_)
        | TopologyError::ReadOnlyContext
        | TopologyError::TimeTravelUnsupported
        | TopologyError::Config(_) => StatusCode::BAD_REQUEST,
        TopologyError::Storage(_)
        | TopologyError::Serialization(_)
        | TopologyError::Io(_)
        | TopologyError::LockPoisoned => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, retryable) = match self {
            Self::Core(e) => {
                let status = status_for(&e);
                if status.is_server_error() {
                    tracing::error!(error = %e, "request failed");
                }
                (status, e.to_string(), e.is_retryable())
            }
            Self::Timeout(deadline) => (
                StatusCode::GATEWAY_TIMEOUT,
                format!("deadline of {} ms exceeded", deadline.as_millis()),
                true,
            ),
            Self::Internal(reason) => {
                tracing::error!(%reason, "request task failed");
                (StatusCode::INTERNAL_SERVER_ERROR, reason, false)
            }
        };
        (status, Json(ErrorResponse { error, retryable })).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// =============================================================================
// BLOCKING BRIDGE
// =============================================================================

/// Run `op` against the topology on the blocking pool, bounded by the
/// request deadline.
async fn run_blocking<T, F>(state: &AppState, op: F) -> Result<T, ApiError>
where
    F: FnOnce(Topology) -> Result<T, TopologyError> + Send + 'static,
    T: Send + 'static,
{
    let topology = state.topology.clone();
    let task = tokio::task::spawn_blocking(move || op(topology));
    match tokio::time::timeout(state.request_timeout, task).await {
        Ok(Ok(result)) => result.map_err(ApiError::from),
        Ok(Err(join)) => Err(ApiError::Internal(join.to_string())),
        Err(_) => {
            tracing::warn!(
                deadline_ms = state.request_timeout.as_millis() as u64,
                "core call exceeded request deadline"
            );
            Err(ApiError::Timeout(state.request_timeout))
        }
    }
}

/// The graph as seen from `slice`, or live when `None`.
fn view(graph: &Graph, slice: Option<TimeSlice>) -> Result<Graph, TopologyError> {
    match slice {
        Some(slice) => graph.with_context(GraphContext::at(slice)),
        None => Ok(graph.clone()),
    }
}

// =============================================================================
// HEALTH & STATUS
// =============================================================================

/// Health check endpoint.
pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse::default())
}

/// Entity counts, cache mode and origin of this store.
pub async fn status_handler(State(state): State<AppState>) -> ApiResult<StatusResponse> {
    let status = run_blocking(&state, |t| {
        let (nodes, edges) = t.history.live_counts()?;
        Ok(StatusResponse {
            nodes,
            edges,
            cached_nodes: t.backend.memory().node_count()?,
            cached_edges: t.backend.memory().edge_count()?,
            mode: t.backend.mode().to_string(),
            origin: t.graph.config().origin().to_string(),
        })
    })
    .await?;
    Ok(Json(status))
}

// =============================================================================
// CACHE MODE
// =============================================================================

pub async fn get_mode_handler(State(state): State<AppState>) -> Json<ModeResponse> {
    Json(ModeResponse {
        mode: state.topology.backend.mode().to_string(),
    })
}

/// Switch the cache mode. Calls already in flight keep their routing.
pub async fn put_mode_handler(
    State(state): State<AppState>,
    Json(request): Json<ModeRequest>,
) -> ApiResult<ModeResponse> {
    let mode: CacheMode = request.mode.parse()?;
    state.topology.backend.set_mode(mode);
    Ok(Json(ModeResponse {
        mode: mode.to_string(),
    }))
}

// =============================================================================
// REPLICATION
// =============================================================================

/// Apply one replication envelope sent by a peer.
///
/// Unknown message types are accepted and ignored; a `SyncRequest` is
/// answered with the matching `SyncReply` in `reply`.
pub async fn message_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<MessageResponse> {
    let message = Message::decode(Envelope::from_slice(&body)?)?;
    let kind = message.kind().to_string();
    if let Message::Unknown(envelope) = &message {
        tracing::debug!(kind = %envelope.kind, "ignoring unknown message type");
    }

    let reply = run_blocking(&state, move |t| t.graph.apply(message)).await?;
    let reply = reply.map(|m| m.encode()).transpose()?;
    Ok(Json(MessageResponse { kind, reply }))
}

// =============================================================================
// NODES
// =============================================================================

pub async fn nodes_handler(
    State(state): State<AppState>,
    Query(query): Query<ReadQuery>,
) -> ApiResult<Vec<Node>> {
    let slice = query.slice()?;
    let filter = query.filter()?;
    let nodes = run_blocking(&state, move |t| view(&t.graph, slice)?.get_nodes(&filter)).await?;
    Ok(Json(nodes))
}

pub async fn node_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ReadQuery>,
) -> ApiResult<Node> {
    let slice = query.slice()?;
    let node = run_blocking(&state, move |t| {
        let id = Identifier::new(id);
        view(&t.graph, slice)?
            .get_node(&id)?
            .ok_or(TopologyError::NodeNotFound(id))
    })
    .await?;
    Ok(Json(node))
}

/// Edges touching a node, as parent or child.
pub async fn node_edges_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ReadQuery>,
) -> ApiResult<Vec<Edge>> {
    let slice = query.slice()?;
    let filter = query.filter()?;
    let edges = run_blocking(&state, move |t| {
        let graph = view(&t.graph, slice)?;
        let id = Identifier::new(id);
        let node = graph
            .get_node(&id)?
            .ok_or(TopologyError::NodeNotFound(id))?;
        graph.get_node_edges(&node, &filter)
    })
    .await?;
    Ok(Json(edges))
}

/// Every stored revision of a node, oldest first.
pub async fn node_history_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<RevisionRecord<Node>>> {
    let rows = run_blocking(&state, move |t| {
        let id = Identifier::new(id);
        let rows = t.history.node_history(&id)?;
        if rows.is_empty() {
            return Err(TopologyError::NodeNotFound(id));
        }
        Ok(rows)
    })
    .await?;
    Ok(Json(rows))
}

// =============================================================================
// EDGES
// =============================================================================

pub async fn edges_handler(
    State(state): State<AppState>,
    Query(query): Query<ReadQuery>,
) -> ApiResult<Vec<Edge>> {
    let slice = query.slice()?;
    let filter = query.filter()?;
    let edges = run_blocking(&state, move |t| view(&t.graph, slice)?.get_edges(&filter)).await?;
    Ok(Json(edges))
}

pub async fn edge_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ReadQuery>,
) -> ApiResult<Edge> {
    let slice = query.slice()?;
    let edge = run_blocking(&state, move |t| {
        let id = Identifier::new(id);
        view(&t.graph, slice)?
            .get_edge(&id)?
            .ok_or(TopologyError::EdgeNotFound(id))
    })
    .await?;
    Ok(Json(edge))
}

pub async fn edge_history_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<RevisionRecord<Edge>>> {
    let rows = run_blocking(&state, move |t| {
        let id = Identifier::new(id);
        let rows = t.history.edge_history(&id)?;
        if rows.is_empty() {
            return Err(TopologyError::EdgeNotFound(id));
        }
        Ok(rows)
    })
    .await?;
    Ok(Json(rows))
}
