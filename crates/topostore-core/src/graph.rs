//! # Graph Façade
//!
//! The entry point agents and replication peers talk to.
//!
//! `Graph` stamps entities (origin, host, timestamps, revisions), forwards
//! them to a `GraphBackend`, and tells every registered `GraphListener` what
//! changed. Inbound replication goes through `Graph::apply`.
//!
//! ## Revisions
//!
//! Each metadata change reads the live entity, bumps `Revision` by one, stamps
//! `UpdatedAt` and hands the result to `metadata_updated`. A change that leaves
//! the metadata as it was is a no-op and creates no revision. A stamp earlier
//! than the live revision's `UpdatedAt` is raised to it.
//!
//! ## Time-scoped views
//!
//! `with_context` returns a view whose reads are answered as of a time slice.
//! Such a view is read-only.

use crate::backend::GraphBackend;
use crate::primitives::DEFAULT_SERVICE;
use crate::sync::{Message, SyncSnapshot};
use crate::{
    Edge, Element, Entity, EntityRef, GraphContext, Identifier, Metadata, Node, Origin,
    TimeSlice, Timestamp, TopologyError,
};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, RwLock};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Identity stamped on every entity this graph creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphConfig {
    /// Service name, first half of the origin label.
    pub service: String,
    /// Collector host name.
    pub host: String,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            service: DEFAULT_SERVICE.to_string(),
            host: String::new(),
        }
    }
}

impl GraphConfig {
    #[must_use]
    pub fn new(service: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            host: host.into(),
        }
    }

    /// The `<service>.<host>` label of this collector.
    #[must_use]
    pub fn origin(&self) -> Origin {
        Origin::new(self.service.clone(), self.host.clone())
    }
}

// =============================================================================
// EVENTS & LISTENERS
// =============================================================================

/// A committed change of the graph.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphEvent {
    NodeAdded(Node),
    NodeUpdated(Node),
    NodeDeleted(Node),
    EdgeAdded(Edge),
    EdgeUpdated(Edge),
    EdgeDeleted(Edge),
}

impl From<GraphEvent> for Message {
    fn from(event: GraphEvent) -> Self {
        match event {
            GraphEvent::NodeAdded(node) => Self::NodeAdded(node),
            GraphEvent::NodeUpdated(node) => Self::NodeUpdated(node),
            GraphEvent::NodeDeleted(node) => Self::NodeDeleted(node),
            GraphEvent::EdgeAdded(edge) => Self::EdgeAdded(edge),
            GraphEvent::EdgeUpdated(edge) => Self::EdgeUpdated(edge),
            GraphEvent::EdgeDeleted(edge) => Self::EdgeDeleted(edge),
        }
    }
}

/// Receives every change after the backend accepted it.
pub trait GraphListener: Send + Sync {
    fn on_event(&self, event: &GraphEvent);
}

/// Forwards events as sync messages over a channel, for replication
/// subscribers.
#[derive(Debug)]
pub struct ChannelListener {
    sender: Sender<Message>,
}

impl ChannelListener {
    /// A listener plus the receiving end of its channel.
    #[must_use]
    pub fn new() -> (Self, Receiver<Message>) {
        let (sender, receiver) = mpsc::channel();
        (Self { sender }, receiver)
    }
}

impl GraphListener for ChannelListener {
    fn on_event(&self, event: &GraphEvent) {
        if self.sender.send(Message::from(event.clone())).is_err() {
            tracing::debug!("replication subscriber went away; event dropped");
        }
    }
}

/// Turns a sync request's filter expression into a metadata predicate.
pub trait FilterResolver: Send + Sync {
    fn resolve(&self, filter: &str) -> Result<Metadata, TopologyError>;
}

/// Accepts an empty filter (everything) or a JSON object of metadata
/// equalities such as `{"Type": "host"}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataFilterResolver;

impl FilterResolver for MetadataFilterResolver {
    fn resolve(&self, filter: &str) -> Result<Metadata, TopologyError> {
        if filter.trim().is_empty() {
            return Ok(Metadata::new());
        }
        match serde_json::from_str::<Value>(filter) {
            Ok(Value::Object(fields)) => Ok(fields.into_iter().collect()),
            Ok(_) => Err(TopologyError::SyncRequestMalformed(
                "filter must be a JSON object".to_string(),
            )),
            Err(e) => Err(TopologyError::SyncRequestMalformed(format!(
                "unsupported filter expression: {}",
                e
            ))),
        }
    }
}

// =============================================================================
// GRAPH
// =============================================================================

/// Mutation and read façade over a shared backend.
///
/// Cheap to clone: clones share the backend and the listener list.
#[derive(Clone)]
pub struct Graph {
    backend: Arc<dyn GraphBackend>,
    config: GraphConfig,
    context: GraphContext,
    listeners: Arc<RwLock<Vec<Arc<dyn GraphListener>>>>,
    resolver: Arc<dyn FilterResolver>,
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("config", &self.config)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl Graph {
    /// Build a graph over `backend` with the live context.
    #[must_use]
    pub fn new(backend: Arc<dyn GraphBackend>, config: GraphConfig) -> Self {
        Self {
            backend,
            config,
            context: GraphContext::live(),
            listeners: Arc::new(RwLock::new(Vec::new())),
            resolver: Arc::new(MetadataFilterResolver),
        }
    }

    /// Replace the resolver used to answer sync requests.
    #[must_use]
    pub fn with_filter_resolver(mut self, resolver: Arc<dyn FilterResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// A view of this graph scoped to `context`.
    ///
    /// Fails when the backend cannot serve reads in that scope.
    pub fn with_context(&self, context: GraphContext) -> Result<Self, TopologyError> {
        self.backend.check_context(&context)?;
        Ok(Self {
            context,
            ..self.clone()
        })
    }

    #[must_use]
    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    #[must_use]
    pub fn context(&self) -> GraphContext {
        self.context
    }

    /// Register a listener for every future change.
    pub fn add_listener(&self, listener: Arc<dyn GraphListener>) -> Result<(), TopologyError> {
        self.listeners
            .write()
            .map_err(|_| TopologyError::LockPoisoned)?
            .push(listener);
        Ok(())
    }

    fn notify(&self, event: GraphEvent) -> Result<(), TopologyError> {
        let listeners = self
            .listeners
            .read()
            .map_err(|_| TopologyError::LockPoisoned)?;
        for listener in listeners.iter() {
            listener.on_event(&event);
        }
        Ok(())
    }

    fn writable(&self) -> Result<(), TopologyError> {
        match self.context.time_slice {
            Some(_) => Err(TopologyError::ReadOnlyContext),
            None => Ok(()),
        }
    }

    fn slice(&self) -> Option<&TimeSlice> {
        self.context.time_slice.as_ref()
    }

    fn element(&self, id: Identifier, metadata: Metadata, t: Timestamp) -> Element {
        Element::new(id, metadata, t, self.config.host.clone(), self.config.origin())
    }

    fn live_node(&self, id: &Identifier) -> Result<Option<Node>, TopologyError> {
        Ok(self.backend.get_node(id, None)?.into_iter().next())
    }

    fn live_edge(&self, id: &Identifier) -> Result<Option<Edge>, TopologyError> {
        Ok(self.backend.get_edge(id, None)?.into_iter().next())
    }

    // -------------------------------------------------------------------------
    // Node mutations
    // -------------------------------------------------------------------------

    /// Build a first revision stamped with this collector's identity.
    /// Nothing is stored.
    #[must_use]
    pub fn create_node(&self, id: Identifier, metadata: Metadata, t: Timestamp) -> Node {
        Node::new(self.element(id, metadata, t))
    }

    /// Store a node. `false` if it already exists.
    pub fn add_node(&self, node: Node) -> Result<bool, TopologyError> {
        self.writable()?;
        let added = self.backend.node_added(&node)?;
        if added {
            tracing::debug!(id = %node.element.id, "node added");
            self.notify(GraphEvent::NodeAdded(node))?;
        }
        Ok(added)
    }

    /// Create and store a node stamped now.
    pub fn new_node(&self, id: Identifier, metadata: Metadata) -> Result<Node, TopologyError> {
        let node = self.create_node(id, metadata, Timestamp::now());
        self.add_node(node.clone())?;
        Ok(node)
    }

    /// Set one metadata key on a live node.
    pub fn add_metadata(
        &self,
        id: &Identifier,
        key: &str,
        value: impl Into<Value>,
        t: Timestamp,
    ) -> Result<bool, TopologyError> {
        let value = value.into();
        self.revise_node(id, t, |metadata| set_key(metadata, key, value))
    }

    /// Replace the whole metadata of a live node.
    pub fn set_metadata(
        &self,
        id: &Identifier,
        metadata: Metadata,
        t: Timestamp,
    ) -> Result<bool, TopologyError> {
        self.revise_node(id, t, |current| replace(current, metadata))
    }

    /// Remove one metadata key from a live node.
    pub fn del_metadata(
        &self,
        id: &Identifier,
        key: &str,
        t: Timestamp,
    ) -> Result<bool, TopologyError> {
        self.revise_node(id, t, |metadata| metadata.remove(key).is_some())
    }

    /// Delete a node at `t`, after each of its live edges.
    ///
    /// `false` if the node has no live revision.
    pub fn del_node(&self, id: &Identifier, t: Timestamp) -> Result<bool, TopologyError> {
        self.writable()?;
        let Some(mut node) = self.live_node(id)? else {
            return Ok(false);
        };
        for edge in self.backend.get_node_edges(&node, None, &Metadata::new())? {
            self.retire_edge(edge, t)?;
        }

        let t = not_before(&node.element, t);
        node.element.deleted_at = Some(t);
        let deleted = self.backend.node_deleted(&node)?;
        if deleted {
            tracing::debug!(%id, at = %t, "node deleted");
            self.notify(GraphEvent::NodeDeleted(node))?;
        }
        Ok(deleted)
    }

    fn revise_node(
        &self,
        id: &Identifier,
        t: Timestamp,
        change: impl FnOnce(&mut Metadata) -> bool,
    ) -> Result<bool, TopologyError> {
        self.writable()?;
        let Some(mut node) = self.live_node(id)? else {
            return Err(TopologyError::NodeNotFound(id.clone()));
        };
        if !change(&mut node.element.metadata) {
            return Ok(false);
        }
        next_revision(&mut node.element, t);

        let updated = self.backend.metadata_updated(EntityRef::Node(&node))?;
        if updated {
            self.notify(GraphEvent::NodeUpdated(node))?;
        }
        Ok(updated)
    }

    // -------------------------------------------------------------------------
    // Edge mutations
    // -------------------------------------------------------------------------

    /// Build a first edge revision. Nothing is stored.
    #[must_use]
    pub fn create_edge(
        &self,
        id: Identifier,
        parent: Identifier,
        child: Identifier,
        metadata: Metadata,
        t: Timestamp,
    ) -> Edge {
        Edge::new(self.element(id, metadata, t), parent, child)
    }

    /// Store an edge. `false` if it already exists or the backend refuses it.
    pub fn add_edge(&self, edge: Edge) -> Result<bool, TopologyError> {
        self.writable()?;
        let added = self.backend.edge_added(&edge)?;
        if added {
            tracing::debug!(id = %edge.element.id, parent = %edge.parent, child = %edge.child, "edge added");
            self.notify(GraphEvent::EdgeAdded(edge))?;
        }
        Ok(added)
    }

    /// Create and store an edge stamped now.
    pub fn new_edge(
        &self,
        id: Identifier,
        parent: Identifier,
        child: Identifier,
        metadata: Metadata,
    ) -> Result<Edge, TopologyError> {
        let edge = self.create_edge(id, parent, child, metadata, Timestamp::now());
        self.add_edge(edge.clone())?;
        Ok(edge)
    }

    /// Set one metadata key on a live edge.
    pub fn add_edge_metadata(
        &self,
        id: &Identifier,
        key: &str,
        value: impl Into<Value>,
        t: Timestamp,
    ) -> Result<bool, TopologyError> {
        let value = value.into();
        self.revise_edge(id, t, |metadata| set_key(metadata, key, value))
    }

    /// Replace the whole metadata of a live edge.
    pub fn set_edge_metadata(
        &self,
        id: &Identifier,
        metadata: Metadata,
        t: Timestamp,
    ) -> Result<bool, TopologyError> {
        self.revise_edge(id, t, |current| replace(current, metadata))
    }

    /// Delete an edge at `t`. `false` if it has no live revision.
    pub fn del_edge(&self, id: &Identifier, t: Timestamp) -> Result<bool, TopologyError> {
        self.writable()?;
        match self.live_edge(id)? {
            Some(edge) => self.retire_edge(edge, t),
            None => Ok(false),
        }
    }

    fn retire_edge(&self, mut edge: Edge, t: Timestamp) -> Result<bool, TopologyError> {
        let t = not_before(&edge.element, t);
        edge.element.deleted_at = Some(t);
        let deleted = self.backend.edge_deleted(&edge)?;
        if deleted {
            tracing::debug!(id = %edge.element.id, at = %t, "edge deleted");
            self.notify(GraphEvent::EdgeDeleted(edge))?;
        }
        Ok(deleted)
    }

    fn revise_edge(
        &self,
        id: &Identifier,
        t: Timestamp,
        change: impl FnOnce(&mut Metadata) -> bool,
    ) -> Result<bool, TopologyError> {
        self.writable()?;
        let Some(mut edge) = self.live_edge(id)? else {
            return Err(TopologyError::EdgeNotFound(id.clone()));
        };
        if !change(&mut edge.element.metadata) {
            return Ok(false);
        }
        next_revision(&mut edge.element, t);

        let updated = self.backend.metadata_updated(EntityRef::Edge(&edge))?;
        if updated {
            self.notify(GraphEvent::EdgeUpdated(edge))?;
        }
        Ok(updated)
    }

    // -------------------------------------------------------------------------
    // Reads (scoped to this view's context)
    // -------------------------------------------------------------------------

    pub fn get_node(&self, id: &Identifier) -> Result<Option<Node>, TopologyError> {
        Ok(self.backend.get_node(id, self.slice())?.into_iter().next())
    }

    pub fn get_edge(&self, id: &Identifier) -> Result<Option<Edge>, TopologyError> {
        Ok(self.backend.get_edge(id, self.slice())?.into_iter().next())
    }

    pub fn get_nodes(&self, filter: &Metadata) -> Result<Vec<Node>, TopologyError> {
        self.backend.get_nodes(self.slice(), filter)
    }

    pub fn get_edges(&self, filter: &Metadata) -> Result<Vec<Edge>, TopologyError> {
        self.backend.get_edges(self.slice(), filter)
    }

    pub fn get_node_edges(
        &self,
        node: &Node,
        filter: &Metadata,
    ) -> Result<Vec<Edge>, TopologyError> {
        self.backend.get_node_edges(node, self.slice(), filter)
    }

    pub fn get_edge_nodes(
        &self,
        edge: &Edge,
        parent_filter: &Metadata,
        child_filter: &Metadata,
    ) -> Result<(Vec<Node>, Vec<Node>), TopologyError> {
        self.backend
            .get_edge_nodes(edge, self.slice(), parent_filter, child_filter)
    }

    /// Nodes matching `filter` and the edges between them, as of `slice`
    /// (or this view's context when `None`).
    ///
    /// With an empty filter every edge is included.
    pub fn sync_snapshot(
        &self,
        slice: Option<&TimeSlice>,
        filter: &Metadata,
    ) -> Result<SyncSnapshot, TopologyError> {
        let slice = slice.or(self.slice());
        let nodes = self.backend.get_nodes(slice, filter)?;
        let mut edges = self.backend.get_edges(slice, &Metadata::new())?;
        if !filter.is_empty() {
            let kept: BTreeSet<&Identifier> = nodes.iter().map(|n| &n.element.id).collect();
            edges.retain(|edge| kept.contains(&edge.parent) && kept.contains(&edge.child));
        }
        Ok(SyncSnapshot { nodes, edges })
    }

    // -------------------------------------------------------------------------
    // Inbound replication
    // -------------------------------------------------------------------------

    /// Apply a message received from a peer.
    ///
    /// Returns the reply to send back, if the message calls for one (a
    /// `SyncRequest` is answered with a `SyncReply`).
    pub fn apply(&self, message: Message) -> Result<Option<Message>, TopologyError> {
        match message {
            Message::SyncRequest(request) => {
                let filter = self.resolver.resolve(&request.gremlin_filter)?;
                let snapshot = self.sync_snapshot(request.time_slice.as_ref(), &filter)?;
                tracing::debug!(nodes = snapshot.nodes.len(), edges = snapshot.edges.len(), "answering sync request");
                return Ok(Some(Message::SyncReply(snapshot)));
            }
            Message::Sync(snapshot) | Message::SyncReply(snapshot) => {
                for node in snapshot.nodes {
                    self.merge_node(node)?;
                }
                for edge in snapshot.edges {
                    self.merge_edge(edge)?;
                }
            }
            Message::OriginGraphDeleted(origin) => self.delete_origin(&origin)?,
            Message::NodeAdded(node) | Message::NodeUpdated(node) => self.merge_node(node)?,
            Message::NodeDeleted(node) => {
                self.del_node(node.id(), deletion_time(&node.element))?;
            }
            Message::EdgeAdded(edge) | Message::EdgeUpdated(edge) => self.merge_edge(edge)?,
            Message::EdgeDeleted(edge) => {
                self.del_edge(edge.id(), deletion_time(&edge.element))?;
            }
            Message::Unknown(envelope) => {
                tracing::trace!(kind = %envelope.kind, "ignoring unknown message");
            }
        }
        Ok(None)
    }

    /// Add a remote node, or take its revision if it is newer than ours.
    fn merge_node(&self, mut node: Node) -> Result<(), TopologyError> {
        self.writable()?;
        normalize_remote(&mut node.element);
        match self.live_node(node.id())? {
            None if !node.is_deleted() => {
                self.add_node(node)?;
            }
            Some(live) if live.revision() < node.revision() => {
                node.element.updated_at = not_before(&live.element, node.element.updated_at);
                if self.backend.metadata_updated(EntityRef::Node(&node))? {
                    self.notify(GraphEvent::NodeUpdated(node))?;
                }
            }
            _ => {
                tracing::debug!(id = %node.element.id, revision = node.revision(), "skipping stale remote node");
            }
        }
        Ok(())
    }

    fn merge_edge(&self, mut edge: Edge) -> Result<(), TopologyError> {
        self.writable()?;
        normalize_remote(&mut edge.element);
        match self.live_edge(edge.id())? {
            None if !edge.is_deleted() => {
                self.add_edge(edge)?;
            }
            Some(live) if live.revision() < edge.revision() => {
                edge.element.updated_at = not_before(&live.element, edge.element.updated_at);
                if self.backend.metadata_updated(EntityRef::Edge(&edge))? {
                    self.notify(GraphEvent::EdgeUpdated(edge))?;
                }
            }
            _ => {
                tracing::debug!(id = %edge.element.id, revision = edge.revision(), "skipping stale remote edge");
            }
        }
        Ok(())
    }

    /// Delete every live node and edge owned by `origin`.
    fn delete_origin(&self, origin: &str) -> Result<(), TopologyError> {
        self.writable()?;
        let t = Timestamp::now();
        let owned = |element: &Element| element.origin.to_string() == origin;

        let mut nodes = 0usize;
        for node in self.backend.get_nodes(None, &Metadata::new())? {
            if owned(&node.element) && self.del_node(node.id(), t)? {
                nodes += 1;
            }
        }
        let mut edges = 0usize;
        for edge in self.backend.get_edges(None, &Metadata::new())? {
            if owned(&edge.element) && self.del_edge(edge.id(), t)? {
                edges += 1;
            }
        }
        tracing::info!(origin, nodes, edges, "origin graph deleted");
        Ok(())
    }
}

/// Stamps taken from a clock that runs behind the stored revision are moved up
/// to it, so a revision never starts before the one it replaces.
fn not_before(element: &Element, t: Timestamp) -> Timestamp {
    t.max(element.updated_at)
}

/// Revisions count from 1 and a revision is never updated before it was created.
fn normalize_remote(element: &mut Element) {
    element.revision = element.revision.max(1);
    element.updated_at = element.updated_at.max(element.created_at);
}

fn next_revision(element: &mut Element, t: Timestamp) {
    element.revision = element.revision.saturating_add(1);
    element.updated_at = not_before(element, t);
}

fn set_key(metadata: &mut Metadata, key: &str, value: Value) -> bool {
    if metadata.get(key) == Some(&value) {
        return false;
    }
    metadata.insert(key, value);
    true
}

fn replace(current: &mut Metadata, metadata: Metadata) -> bool {
    if *current == metadata {
        return false;
    }
    *current = metadata;
    true
}

fn deletion_time(element: &Element) -> Timestamp {
    element.deleted_at.unwrap_or(element.updated_at)
}
