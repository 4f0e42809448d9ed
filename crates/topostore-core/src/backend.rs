//! # Backend Trait
//!
//! The capability set every graph backend exposes.
//!
//! The in-memory index, the redb revision store and the cached coordinator all
//! implement `GraphBackend`, so a different durable store can be substituted
//! behind `CachedBackend` without touching the coordinator or the façade.

use crate::{Edge, EntityRef, GraphContext, Identifier, Metadata, Node, TimeSlice, TopologyError};

/// Graph backend operations.
///
/// Mutations return `Ok(true)` when the backend state changed and `Ok(false)`
/// for a no-op (already present on add, already absent on delete). Reads take
/// an optional time slice: `None` asks for the live state.
///
/// All methods take `&self`; implementations synchronize internally so one
/// backend can be shared by every collector connection.
pub trait GraphBackend: Send + Sync {
    /// Record a new node.
    fn node_added(&self, node: &Node) -> Result<bool, TopologyError>;

    /// Terminate a node. `node.element.deleted_at` carries the deletion time.
    fn node_deleted(&self, node: &Node) -> Result<bool, TopologyError>;

    /// Nodes carrying `id`. Identifiers are not unique across merged collector
    /// streams, so the result is a sequence.
    fn get_node(&self, id: &Identifier, t: Option<&TimeSlice>)
    -> Result<Vec<Node>, TopologyError>;

    /// Edges incident to `node` whose metadata matches `filter`.
    fn get_node_edges(
        &self,
        node: &Node,
        t: Option<&TimeSlice>,
        filter: &Metadata,
    ) -> Result<Vec<Edge>, TopologyError>;

    /// Record a new edge.
    fn edge_added(&self, edge: &Edge) -> Result<bool, TopologyError>;

    /// Terminate an edge. `edge.element.deleted_at` carries the deletion time.
    fn edge_deleted(&self, edge: &Edge) -> Result<bool, TopologyError>;

    /// Edges carrying `id`.
    fn get_edge(&self, id: &Identifier, t: Option<&TimeSlice>)
    -> Result<Vec<Edge>, TopologyError>;

    /// Parent and child nodes of `edge`, each filtered by its own predicate.
    fn get_edge_nodes(
        &self,
        edge: &Edge,
        t: Option<&TimeSlice>,
        parent_filter: &Metadata,
        child_filter: &Metadata,
    ) -> Result<(Vec<Node>, Vec<Node>), TopologyError>;

    /// Record a new revision of a node or edge. The entity carries its bumped
    /// `Revision` and the new `UpdatedAt`.
    fn metadata_updated(&self, entity: EntityRef<'_>) -> Result<bool, TopologyError>;

    /// All nodes matching `filter`.
    fn get_nodes(&self, t: Option<&TimeSlice>, filter: &Metadata)
    -> Result<Vec<Node>, TopologyError>;

    /// All edges matching `filter`.
    fn get_edges(&self, t: Option<&TimeSlice>, filter: &Metadata)
    -> Result<Vec<Edge>, TopologyError>;

    /// Context-scoping hook: fail when this backend cannot serve reads scoped
    /// to `context`.
    fn check_context(&self, context: &GraphContext) -> Result<(), TopologyError>;
}
