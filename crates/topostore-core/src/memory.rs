//! # In-Memory Index
//!
//! Volatile backend holding only the current state of the graph.
//!
//! All data structures use `BTreeMap` so scans return entities in identifier
//! order. The index has no history: any read scoped to a time slice is
//! rejected with `TopologyError::TimeTravelUnsupported`.
//!
//! Inconsistent requests (deleting an absent entity, adding an edge whose
//! endpoints are unknown) return `Ok(false)` rather than an error.

use crate::backend::GraphBackend;
use crate::{
    Edge, Entity, EntityRef, GraphContext, Identifier, Metadata, Node, TimeSlice, TopologyError,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

// =============================================================================
// INDEX STATE
// =============================================================================

#[derive(Debug, Default)]
struct MemoryIndex {
    /// Node storage: ID -> Node
    nodes: BTreeMap<Identifier, Node>,

    /// Edge storage: ID -> Edge
    edges: BTreeMap<Identifier, Edge>,

    /// Adjacency: node ID -> IDs of incident edges
    adjacency: BTreeMap<Identifier, BTreeSet<Identifier>>,

    /// Secondary node index: (metadata key, JSON value) -> node IDs
    by_metadata: BTreeMap<(String, String), BTreeSet<Identifier>>,
}

impl MemoryIndex {
    fn index_node(&mut self, keys: &BTreeSet<String>, node: &Node) {
        for key in keys {
            if let Some(value) = node.metadata().get_field(key) {
                self.by_metadata
                    .entry((key.clone(), value.to_string()))
                    .or_default()
                    .insert(node.id().clone());
            }
        }
    }

    fn unindex_node(&mut self, keys: &BTreeSet<String>, node: &Node) {
        for key in keys {
            if let Some(value) = node.metadata().get_field(key) {
                let slot = (key.clone(), value.to_string());
                if let Some(ids) = self.by_metadata.get_mut(&slot) {
                    ids.remove(node.id());
                    if ids.is_empty() {
                        self.by_metadata.remove(&slot);
                    }
                }
            }
        }
    }

    fn detach_edge(&mut self, edge: &Edge) {
        for endpoint in [&edge.parent, &edge.child] {
            if let Some(ids) = self.adjacency.get_mut(endpoint) {
                ids.remove(edge.id());
            }
        }
    }
}

// =============================================================================
// MEMORY BACKEND
// =============================================================================

/// Current-state graph index.
///
/// Optionally keeps a secondary index over chosen metadata keys (for example
/// `MAC`), used by `get_nodes` when a filter names one of those keys.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    index: RwLock<MemoryIndex>,
    indexed_keys: BTreeSet<String>,
}

impl MemoryBackend {
    /// Create an empty index without secondary keys.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty index that maintains a lookup table for each key.
    #[must_use]
    pub fn with_indexed_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            index: RwLock::default(),
            indexed_keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    /// Number of nodes currently held.
    pub fn node_count(&self) -> Result<usize, TopologyError> {
        Ok(self.read()?.nodes.len())
    }

    /// Number of edges currently held.
    pub fn edge_count(&self) -> Result<usize, TopologyError> {
        Ok(self.read()?.edges.len())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryIndex>, TopologyError> {
        self.index.read().map_err(|_| TopologyError::LockPoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryIndex>, TopologyError> {
        self.index.write().map_err(|_| TopologyError::LockPoisoned)
    }

    /// Pick candidate node IDs from the secondary index, if the filter allows.
    ///
    /// Keys are resolved the way `Metadata::matches` resolves them, dotted
    /// paths included. Objects and arrays compare structurally, so their
    /// serialized form is not a reliable key and they are left to a scan.
    fn indexed_candidates(
        &self,
        index: &MemoryIndex,
        filter: &Metadata,
    ) -> Option<BTreeSet<Identifier>> {
        filter.iter().find_map(|(key, value)| {
            let scalar = !value.is_object() && !value.is_array();
            (scalar && self.indexed_keys.contains(key)).then(|| {
                index
                    .by_metadata
                    .get(&(key.clone(), value.to_string()))
                    .cloned()
                    .unwrap_or_default()
            })
        })
    }
}

/// Reject any time-scoped access.
fn live_only(t: Option<&TimeSlice>) -> Result<(), TopologyError> {
    match t {
        Some(_) => Err(TopologyError::TimeTravelUnsupported),
        None => Ok(()),
    }
}

/// An update must carry a higher revision and must not be stamped before the
/// revision it replaces.
fn supersedes<E: Entity>(stored: &E, incoming: &E) -> Result<(), TopologyError> {
    let stale = stored.revision() >= incoming.revision()
        || incoming.element().updated_at < stored.element().updated_at;
    if stale {
        return Err(TopologyError::Conflict {
            id: incoming.id().clone(),
            live: Some(stored.revision()),
            incoming: incoming.revision(),
        });
    }
    Ok(())
}

impl GraphBackend for MemoryBackend {
    fn node_added(&self, node: &Node) -> Result<bool, TopologyError> {
        let mut index = self.write()?;
        if index.nodes.contains_key(node.id()) {
            return Ok(false);
        }
        index.index_node(&self.indexed_keys, node);
        index.nodes.insert(node.id().clone(), node.clone());
        Ok(true)
    }

    fn node_deleted(&self, node: &Node) -> Result<bool, TopologyError> {
        let mut index = self.write()?;
        let Some(stored) = index.nodes.remove(node.id()) else {
            return Ok(false);
        };
        index.unindex_node(&self.indexed_keys, &stored);

        // Drop edges left dangling by the removal.
        let incident = index.adjacency.remove(node.id()).unwrap_or_default();
        for edge_id in incident {
            if let Some(edge) = index.edges.remove(&edge_id) {
                index.detach_edge(&edge);
            }
        }
        Ok(true)
    }

    fn get_node(
        &self,
        id: &Identifier,
        t: Option<&TimeSlice>,
    ) -> Result<Vec<Node>, TopologyError> {
        live_only(t)?;
        Ok(self.read()?.nodes.get(id).cloned().into_iter().collect())
    }

    fn get_node_edges(
        &self,
        node: &Node,
        t: Option<&TimeSlice>,
        filter: &Metadata,
    ) -> Result<Vec<Edge>, TopologyError> {
        live_only(t)?;
        let index = self.read()?;
        Ok(index
            .adjacency
            .get(node.id())
            .into_iter()
            .flatten()
            .filter_map(|edge_id| index.edges.get(edge_id))
            .filter(|edge| edge.metadata().matches(filter))
            .cloned()
            .collect())
    }

    fn edge_added(&self, edge: &Edge) -> Result<bool, TopologyError> {
        let mut index = self.write()?;
        if index.edges.contains_key(edge.id())
            || !index.nodes.contains_key(&edge.parent)
            || !index.nodes.contains_key(&edge.child)
        {
            return Ok(false);
        }
        for endpoint in [&edge.parent, &edge.child] {
            index
                .adjacency
                .entry(endpoint.clone())
                .or_default()
                .insert(edge.id().clone());
        }
        index.edges.insert(edge.id().clone(), edge.clone());
        Ok(true)
    }

    fn edge_deleted(&self, edge: &Edge) -> Result<bool, TopologyError> {
        let mut index = self.write()?;
        let Some(stored) = index.edges.remove(edge.id()) else {
            return Ok(false);
        };
        index.detach_edge(&stored);
        Ok(true)
    }

    fn get_edge(
        &self,
        id: &Identifier,
        t: Option<&TimeSlice>,
    ) -> Result<Vec<Edge>, TopologyError> {
        live_only(t)?;
        Ok(self.read()?.edges.get(id).cloned().into_iter().collect())
    }

    fn get_edge_nodes(
        &self,
        edge: &Edge,
        t: Option<&TimeSlice>,
        parent_filter: &Metadata,
        child_filter: &Metadata,
    ) -> Result<(Vec<Node>, Vec<Node>), TopologyError> {
        live_only(t)?;
        let index = self.read()?;
        let pick = |id: &Identifier, filter: &Metadata| -> Vec<Node> {
            index
                .nodes
                .get(id)
                .filter(|node| node.metadata().matches(filter))
                .cloned()
                .into_iter()
                .collect()
        };
        Ok((
            pick(&edge.parent, parent_filter),
            pick(&edge.child, child_filter),
        ))
    }

    fn metadata_updated(&self, entity: EntityRef<'_>) -> Result<bool, TopologyError> {
        let mut index = self.write()?;
        match entity {
            EntityRef::Node(node) => {
                let Some(stored) = index.nodes.get(node.id()).cloned() else {
                    return Ok(false);
                };
                supersedes(&stored, node)?;
                index.unindex_node(&self.indexed_keys, &stored);
                index.index_node(&self.indexed_keys, node);
                index.nodes.insert(node.id().clone(), node.clone());
                Ok(true)
            }
            EntityRef::Edge(edge) => {
                let Some(stored) = index.edges.get_mut(edge.id()) else {
                    return Ok(false);
                };
                supersedes(&*stored, edge)?;
                stored.element = edge.element.clone();
                Ok(true)
            }
        }
    }

    fn get_nodes(
        &self,
        t: Option<&TimeSlice>,
        filter: &Metadata,
    ) -> Result<Vec<Node>, TopologyError> {
        live_only(t)?;
        let index = self.read()?;
        let nodes = match self.indexed_candidates(&index, filter) {
            Some(ids) => ids
                .iter()
                .filter_map(|id| index.nodes.get(id))
                .filter(|node| node.metadata().matches(filter))
                .cloned()
                .collect(),
            None => index
                .nodes
                .values()
                .filter(|node| node.metadata().matches(filter))
                .cloned()
                .collect(),
        };
        Ok(nodes)
    }

    fn get_edges(
        &self,
        t: Option<&TimeSlice>,
        filter: &Metadata,
    ) -> Result<Vec<Edge>, TopologyError> {
        live_only(t)?;
        Ok(self
            .read()?
            .edges
            .values()
            .filter(|edge| edge.metadata().matches(filter))
            .cloned()
            .collect())
    }

    fn check_context(&self, context: &GraphContext) -> Result<(), TopologyError> {
        live_only(context.time_slice.as_ref())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::{Element, Origin, Timestamp};
    use serde_json::json;

    fn node(id: &str, metadata: Metadata) -> Node {
        Node::new(Element::new(
            Identifier::new(id),
            metadata,
            Timestamp::from_secs(1),
            "host1",
            Origin::new("unknown", "host1"),
        ))
    }

    fn edge(id: &str, parent: &str, child: &str) -> Edge {
        Edge::new(
            Element::new(
                Identifier::new(id),
                [("RelationType", json!("ownership"))].into_iter().collect(),
                Timestamp::from_secs(1),
                "host1",
                Origin::new("unknown", "host1"),
            ),
            Identifier::new(parent),
            Identifier::new(child),
        )
    }

    fn filter(key: &str, value: serde_json::Value) -> Metadata {
        [(key, value)].into_iter().collect()
    }

    #[test]
    fn add_and_lookup_node() {
        let memory = MemoryBackend::new();
        assert!(memory.node_added(&node("n1", Metadata::new())).unwrap());

        let found = memory.get_node(&Identifier::new("n1"), None).unwrap();
        assert_eq!(found.len(), 1);
        assert!(
            memory
                .get_node(&Identifier::new("n2"), None)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn duplicate_add_is_a_no_op() {
        let memory = MemoryBackend::new();
        assert!(memory.node_added(&node("n1", Metadata::new())).unwrap());
        assert!(!memory.node_added(&node("n1", Metadata::new())).unwrap());
        assert_eq!(memory.node_count().unwrap(), 1);
    }

    #[test]
    fn deleting_absent_entities_is_a_no_op() {
        let memory = MemoryBackend::new();
        assert!(!memory.node_deleted(&node("ghost", Metadata::new())).unwrap());
        assert!(!memory.edge_deleted(&edge("e1", "a", "b")).unwrap());
    }

    #[test]
    fn edge_requires_both_endpoints() {
        let memory = MemoryBackend::new();
        memory.node_added(&node("a", Metadata::new())).unwrap();
        assert!(!memory.edge_added(&edge("e1", "a", "b")).unwrap());

        memory.node_added(&node("b", Metadata::new())).unwrap();
        assert!(memory.edge_added(&edge("e1", "a", "b")).unwrap());
        assert_eq!(memory.edge_count().unwrap(), 1);
    }

    #[test]
    fn node_edges_and_edge_nodes() {
        let memory = MemoryBackend::new();
        memory
            .node_added(&node("a", filter("Type", json!("host"))))
            .unwrap();
        memory
            .node_added(&node("b", filter("Type", json!("veth"))))
            .unwrap();
        memory.node_added(&node("c", Metadata::new())).unwrap();
        memory.edge_added(&edge("ab", "a", "b")).unwrap();
        memory.edge_added(&edge("ac", "a", "c")).unwrap();

        let a = node("a", Metadata::new());
        assert_eq!(
            memory
                .get_node_edges(&a, None, &Metadata::new())
                .unwrap()
                .len(),
            2
        );
        assert!(
            memory
                .get_node_edges(&a, None, &filter("RelationType", json!("layer2")))
                .unwrap()
                .is_empty()
        );

        let (parents, children) = memory
            .get_edge_nodes(
                &edge("ab", "a", "b"),
                None,
                &filter("Type", json!("host")),
                &filter("Type", json!("bridge")),
            )
            .unwrap();
        assert_eq!(parents.len(), 1);
        assert!(children.is_empty());
    }

    #[test]
    fn deleting_node_drops_incident_edges() {
        let memory = MemoryBackend::new();
        memory.node_added(&node("a", Metadata::new())).unwrap();
        memory.node_added(&node("b", Metadata::new())).unwrap();
        memory.edge_added(&edge("ab", "a", "b")).unwrap();

        assert!(memory.node_deleted(&node("a", Metadata::new())).unwrap());
        assert_eq!(memory.edge_count().unwrap(), 0);
        let b = node("b", Metadata::new());
        assert!(
            memory
                .get_node_edges(&b, None, &Metadata::new())
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn time_scoped_reads_are_rejected() {
        let memory = MemoryBackend::new();
        let slice = TimeSlice::instant(Timestamp::from_secs(1));
        assert!(matches!(
            memory.get_nodes(Some(&slice), &Metadata::new()),
            Err(TopologyError::TimeTravelUnsupported)
        ));
        assert!(matches!(
            memory.check_context(&GraphContext::at(slice)),
            Err(TopologyError::TimeTravelUnsupported)
        ));
        assert!(memory.check_context(&GraphContext::live()).is_ok());
    }

    #[test]
    fn metadata_update_reindexes_secondary_keys() {
        let memory = MemoryBackend::with_indexed_keys(["MAC"]);
        let mut intf = node("eth0", filter("MAC", json!("aa:bb")));
        memory.node_added(&intf).unwrap();

        assert_eq!(
            memory
                .get_nodes(None, &filter("MAC", json!("aa:bb")))
                .unwrap()
                .len(),
            1
        );

        intf.element.metadata.insert("MAC", json!("cc:dd"));
        intf.element.revision = 2;
        assert!(memory.metadata_updated(EntityRef::Node(&intf)).unwrap());

        assert!(
            memory
                .get_nodes(None, &filter("MAC", json!("aa:bb")))
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            memory
                .get_nodes(None, &filter("MAC", json!("cc:dd")))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn stale_revision_conflicts_and_keeps_stored_state() {
        let memory = MemoryBackend::new();
        let mut n = node("n1", filter("MTU", json!(1500)));
        memory.node_added(&n).unwrap();

        n.element.metadata.insert("MTU", json!(9000));
        assert!(matches!(
            memory.metadata_updated(EntityRef::Node(&n)),
            Err(TopologyError::Conflict {
                live: Some(1),
                incoming: 1,
                ..
            })
        ));

        let stored = memory.get_node(&Identifier::new("n1"), None).unwrap();
        assert_eq!(stored[0].metadata().get("MTU"), Some(&json!(1500)));
    }

    #[test]
    fn update_stamped_before_the_stored_revision_conflicts() {
        let memory = MemoryBackend::new();
        memory.node_added(&node("a", Metadata::new())).unwrap();
        memory.node_added(&node("b", Metadata::new())).unwrap();
        memory.edge_added(&edge("ab", "a", "b")).unwrap();

        let mut early = node("a", filter("MTU", json!(1510)));
        early.element.revision = 2;
        early.element.updated_at = Timestamp(500);
        assert!(matches!(
            memory.metadata_updated(EntityRef::Node(&early)),
            Err(TopologyError::Conflict { .. })
        ));

        let mut early_edge = edge("ab", "a", "b");
        early_edge.element.revision = 2;
        early_edge.element.updated_at = Timestamp(500);
        assert!(matches!(
            memory.metadata_updated(EntityRef::Edge(&early_edge)),
            Err(TopologyError::Conflict { .. })
        ));
    }

    #[test]
    fn update_of_absent_entity_is_a_no_op() {
        let memory = MemoryBackend::new();
        let mut ghost = node("ghost", Metadata::new());
        ghost.element.revision = 2;
        assert!(!memory.metadata_updated(EntityRef::Node(&ghost)).unwrap());
    }

    #[test]
    fn dotted_indexed_key_matches_a_full_scan() {
        let plain = MemoryBackend::new();
        let indexed = MemoryBackend::with_indexed_keys(["Captures.ID"]);
        let captured = node("eth0", filter("Captures", json!({"ID": "c1"})));
        plain.node_added(&captured).unwrap();
        indexed.node_added(&captured).unwrap();

        let wanted = filter("Captures.ID", json!("c1"));
        assert_eq!(plain.get_nodes(None, &wanted).unwrap().len(), 1);
        assert_eq!(indexed.get_nodes(None, &wanted).unwrap().len(), 1);

        let mut moved = captured.clone();
        moved.element.metadata.insert("Captures", json!({"ID": "c2"}));
        moved.element.revision = 2;
        indexed.metadata_updated(EntityRef::Node(&moved)).unwrap();
        assert!(indexed.get_nodes(None, &wanted).unwrap().is_empty());
    }

    #[test]
    fn object_filter_on_indexed_key_compares_structurally() {
        let memory = MemoryBackend::with_indexed_keys(["Captures"]);
        memory
            .node_added(&node("eth0", filter("Captures", json!({"ID": "c1", "State": "up"}))))
            .unwrap();

        let reordered = filter("Captures", json!({"State": "up", "ID": "c1"}));
        assert_eq!(memory.get_nodes(None, &reordered).unwrap().len(), 1);
    }
}
