//! # redb-backed Revision History
//!
//! A durable, append-only graph store using the redb embedded database.
//!
//! Every mutation appends a row; no committed row is ever rewritten except to
//! stamp the end of its validity (`ArchivedAt`, `DeletedAt`). This makes it
//! possible to rebuild the graph as it was at any instant.
//!
//! ## Row Layout
//!
//! Rows are JSON documents with the durable field names
//! `ID, Host, Origin, Metadata, CreatedAt, UpdatedAt, ArchivedAt, DeletedAt,
//! Revision` (plus `Parent, Child` for edges), keyed by `(ID, row sequence)`.
//! The row sequence keeps earlier lifetimes of a re-created identifier intact.
//! A row is live when `DeletedAt IS NULL AND ArchivedAt IS NULL`; the
//! `live_*` tables point at that row for each identifier.
//!
//! ## Atomicity
//!
//! An update archives the live row and inserts its successor inside one redb
//! write transaction. redb admits a single writer at a time, so two updates of
//! the same identifier can never both build on the same previous revision: the
//! second one sees the new live revision and fails with
//! `TopologyError::Conflict`.

use crate::backend::GraphBackend;
use crate::primitives::SCHEMA_VERSION;
use crate::{
    Edge, Entity, EntityRef, GraphContext, Identifier, Metadata, Node, TimeSlice, Timestamp,
    TopologyError,
};
use redb::{
    Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition,
    WriteTransaction,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Node rows: (ID, row sequence) -> JSON row
const NODE_REVISIONS: TableDefinition<(&str, u64), &[u8]> =
    TableDefinition::new("node_revisions");

/// Edge rows: (ID, row sequence) -> JSON row
const EDGE_REVISIONS: TableDefinition<(&str, u64), &[u8]> =
    TableDefinition::new("edge_revisions");

/// Live node pointer: ID -> row sequence of the live row
const LIVE_NODES: TableDefinition<&str, u64> = TableDefinition::new("live_nodes");

/// Live edge pointer: ID -> row sequence of the live row
const LIVE_EDGES: TableDefinition<&str, u64> = TableDefinition::new("live_edges");

/// Live edge endpoints: (node ID, edge ID) -> role bits (1 = parent, 2 = child)
const EDGE_ENDPOINTS: TableDefinition<(&str, &str), u8> = TableDefinition::new("edge_endpoints");

/// Store metadata: key string -> value u64
const METADATA: TableDefinition<&str, u64> = TableDefinition::new("metadata");

const ROLE_PARENT: u8 = 1;
const ROLE_CHILD: u8 = 2;

// =============================================================================
// ROWS
// =============================================================================

/// One persisted revision of a node or edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionRecord<E> {
    #[serde(flatten)]
    pub entity: E,
    #[serde(rename = "ArchivedAt", default)]
    pub archived_at: Option<Timestamp>,
}

impl<E: Entity> RevisionRecord<E> {
    /// Whether this row is the live revision of its entity.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.archived_at.is_none() && self.entity.element().deleted_at.is_none()
    }

    /// End of this revision's validity, if it has one.
    #[must_use]
    pub fn valid_until(&self) -> Option<Timestamp> {
        match (self.archived_at, self.entity.element().deleted_at) {
            (Some(a), Some(d)) => Some(a.min(d)),
            (a, d) => a.or(d),
        }
    }

    /// Whether this revision was in effect at some point of `slice`.
    #[must_use]
    pub fn visible_in(&self, slice: &TimeSlice) -> bool {
        slice.overlaps(self.entity.element().updated_at, self.valid_until())
    }
}

fn encode<E: Entity>(record: &RevisionRecord<E>) -> Result<Vec<u8>, TopologyError> {
    serde_json::to_vec(record).map_err(|e| TopologyError::Serialization(e.to_string()))
}

fn decode<E: Entity>(bytes: &[u8]) -> Result<RevisionRecord<E>, TopologyError> {
    serde_json::from_slice(bytes).map_err(|e| TopologyError::Serialization(e.to_string()))
}

/// Table pair used for one entity kind.
trait Stored: Entity {
    const REVISIONS: TableDefinition<'static, (&'static str, u64), &'static [u8]>;
    const LIVE: TableDefinition<'static, &'static str, u64>;
}

impl Stored for Node {
    const REVISIONS: TableDefinition<'static, (&'static str, u64), &'static [u8]> =
        NODE_REVISIONS;
    const LIVE: TableDefinition<'static, &'static str, u64> = LIVE_NODES;
}

impl Stored for Edge {
    const REVISIONS: TableDefinition<'static, (&'static str, u64), &'static [u8]> =
        EDGE_REVISIONS;
    const LIVE: TableDefinition<'static, &'static str, u64> = LIVE_EDGES;
}

/// Read access shared by read-only and write-transaction revision tables.
trait RevisionTable: ReadableTable<(&'static str, u64), &'static [u8]> {}

impl<T: ReadableTable<(&'static str, u64), &'static [u8]>> RevisionTable for T {}

/// All rows of one identifier, oldest first.
fn rows_of<E: Entity>(
    table: &impl RevisionTable,
    id: &str,
) -> Result<Vec<(u64, RevisionRecord<E>)>, TopologyError> {
    let mut rows = Vec::new();
    for entry in table.range((id, 0u64)..=(id, u64::MAX))? {
        let (key, value) = entry?;
        rows.push((key.value().1, decode(value.value())?));
    }
    Ok(rows)
}

/// The row of `id` in effect during `slice`, latest first.
fn row_at<E: Entity>(
    table: &impl RevisionTable,
    id: &str,
    slice: &TimeSlice,
) -> Result<Option<E>, TopologyError> {
    Ok(rows_of::<E>(table, id)?
        .into_iter()
        .rev()
        .find(|(_, row)| row.visible_in(slice))
        .map(|(_, row)| row.entity))
}

/// Every entity as it was during `slice`, in identifier order.
fn all_at<E: Entity>(
    table: &impl RevisionTable,
    slice: &TimeSlice,
) -> Result<Vec<E>, TopologyError> {
    // Keys are ordered by (ID, sequence): a later visible row of the same ID
    // replaces an earlier one.
    let mut latest: BTreeMap<String, E> = BTreeMap::new();
    for entry in table.iter()? {
        let (key, value) = entry?;
        let row: RevisionRecord<E> = decode(value.value())?;
        if row.visible_in(slice) {
            latest.insert(key.value().0.to_string(), row.entity);
        }
    }
    Ok(latest.into_values().collect())
}

/// Highest row sequence stored for `id`, or 0.
fn last_sequence(table: &impl RevisionTable, id: &str) -> Result<u64, TopologyError> {
    match table.range((id, 0u64)..=(id, u64::MAX))?.next_back() {
        Some(entry) => Ok(entry?.0.value().1),
        None => Ok(0),
    }
}

// =============================================================================
// HISTORY STORE
// =============================================================================

/// A durable revision store using redb.
///
/// - Never overwrites a revision, only stamps its end of validity
/// - Serves both live reads and point-in-time reads
/// - Cascades node deletion onto live incident edges in the same transaction
pub struct HistoryStore {
    /// The redb database handle.
    db: Database,
}

impl std::fmt::Debug for HistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryStore").finish_non_exhaustive()
    }
}

impl HistoryStore {
    /// Open or create a revision store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TopologyError> {
        let db = Database::create(path.as_ref())?;

        // Initialize tables if they don't exist
        let write_txn = db.begin_write()?;
        {
            write_txn.open_table(NODE_REVISIONS)?;
            write_txn.open_table(EDGE_REVISIONS)?;
            write_txn.open_table(LIVE_NODES)?;
            write_txn.open_table(LIVE_EDGES)?;
            write_txn.open_table(EDGE_ENDPOINTS)?;

            let mut meta = write_txn.open_table(METADATA)?;
            let stored = meta.get("schema_version")?.map(|v| v.value());
            match stored {
                None => {
                    meta.insert("schema_version", SCHEMA_VERSION)?;
                }
                Some(version) if version != SCHEMA_VERSION => {
                    return Err(TopologyError::Storage(format!(
                        "Unsupported schema version: {} (expected {})",
                        version, SCHEMA_VERSION
                    )));
                }
                Some(_) => {}
            }
        }
        write_txn.commit()?;

        tracing::debug!(path = %path.as_ref().display(), "revision store opened");
        Ok(Self { db })
    }

    /// Compact the database file.
    pub fn compact(&mut self) -> Result<bool, TopologyError> {
        self.db
            .compact()
            .map_err(|e| TopologyError::Storage(e.to_string()))
    }

    /// Number of live nodes and live edges.
    pub fn live_counts(&self) -> Result<(usize, usize), TopologyError> {
        let read_txn = self.db.begin_read()?;
        let nodes = read_txn.open_table(LIVE_NODES)?.len()?;
        let edges = read_txn.open_table(LIVE_EDGES)?.len()?;
        Ok((nodes as usize, edges as usize))
    }

    /// Every persisted revision of a node, oldest first.
    pub fn node_history(&self, id: &Identifier) -> Result<Vec<RevisionRecord<Node>>, TopologyError> {
        self.history::<Node>(id)
    }

    /// Every persisted revision of an edge, oldest first.
    pub fn edge_history(&self, id: &Identifier) -> Result<Vec<RevisionRecord<Edge>>, TopologyError> {
        self.history::<Edge>(id)
    }

    fn history<E: Stored>(&self, id: &Identifier) -> Result<Vec<RevisionRecord<E>>, TopologyError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(E::REVISIONS)?;
        Ok(rows_of::<E>(&table, id.as_str())?
            .into_iter()
            .map(|(_, row)| row)
            .collect())
    }

    // -------------------------------------------------------------------------
    // Mutations
    // -------------------------------------------------------------------------

    /// Insert the first row of a new lifetime. `false` if a live row exists.
    fn create<E: Stored>(
        &self,
        entity: &E,
        link: impl FnOnce(&WriteTransaction) -> Result<(), TopologyError>,
    ) -> Result<bool, TopologyError> {
        let id = entity.id().as_str();
        let write_txn = self.db.begin_write()?;
        {
            let mut live = write_txn.open_table(E::LIVE)?;
            if live.get(id)?.is_some() {
                return Ok(false);
            }

            let mut revisions = write_txn.open_table(E::REVISIONS)?;
            let sequence = last_sequence(&revisions, id)?.saturating_add(1);
            let row = RevisionRecord {
                entity: entity.clone(),
                archived_at: None,
            };
            revisions.insert((id, sequence), encode(&row)?.as_slice())?;
            live.insert(id, sequence)?;
        }
        link(&write_txn)?;
        write_txn.commit()?;

        tracing::debug!(kind = E::KIND, id = %entity.id(), revision = entity.revision(), "revision created");
        Ok(true)
    }

    /// Archive the live row and append `entity` as its successor.
    fn revise<E: Stored>(&self, entity: &E) -> Result<bool, TopologyError> {
        let id = entity.id().as_str();
        let incoming = entity.revision();
        let write_txn = self.db.begin_write()?;
        {
            let mut live = write_txn.open_table(E::LIVE)?;
            let mut revisions = write_txn.open_table(E::REVISIONS)?;

            let Some(sequence) = live.get(id)?.map(|v| v.value()) else {
                tracing::warn!(kind = E::KIND, id = %entity.id(), incoming, "update of an entity with no live revision");
                return Err(TopologyError::Conflict {
                    id: entity.id().clone(),
                    live: None,
                    incoming,
                });
            };

            let current: RevisionRecord<E> = match revisions.get((id, sequence))? {
                Some(bytes) => decode(bytes.value())?,
                None => {
                    return Err(TopologyError::Storage(format!(
                        "live pointer of {} references missing row {}",
                        id, sequence
                    )));
                }
            };
            if current.entity.revision() >= incoming {
                tracing::warn!(kind = E::KIND, id = %entity.id(), live = current.entity.revision(), incoming, "stale revision rejected");
                return Err(TopologyError::Conflict {
                    id: entity.id().clone(),
                    live: Some(current.entity.revision()),
                    incoming,
                });
            }
            let stamped = entity.element().updated_at;
            let previous = current.entity.element().updated_at;
            if stamped < previous {
                tracing::warn!(kind = E::KIND, id = %entity.id(), updated_at = stamped.millis(), live_updated_at = previous.millis(), "revision stamped before the one it replaces");
                return Err(TopologyError::Conflict {
                    id: entity.id().clone(),
                    live: Some(current.entity.revision()),
                    incoming,
                });
            }

            let at = stamped;
            let archived = RevisionRecord {
                archived_at: Some(at),
                ..current
            };
            revisions.insert((id, sequence), encode(&archived)?.as_slice())?;

            let mut next = entity.clone();
            next.element_mut().created_at = archived.entity.element().created_at;
            let row = RevisionRecord {
                entity: next,
                archived_at: None,
            };
            let next_sequence = sequence.saturating_add(1);
            revisions.insert((id, next_sequence), encode(&row)?.as_slice())?;
            live.insert(id, next_sequence)?;
        }
        write_txn.commit()?;

        tracing::debug!(kind = E::KIND, id = %entity.id(), revision = incoming, "revision archived and superseded");
        Ok(true)
    }

    /// Stamp `DeletedAt = ArchivedAt = at` on the live row of `id`.
    ///
    /// Runs inside the caller's transaction; returns the retired row.
    fn retire<E: Stored>(
        write_txn: &WriteTransaction,
        id: &str,
        at: Timestamp,
    ) -> Result<Option<RevisionRecord<E>>, TopologyError> {
        let mut live = write_txn.open_table(E::LIVE)?;
        let Some(sequence) = live.remove(id)?.map(|v| v.value()) else {
            return Ok(None);
        };

        let mut revisions = write_txn.open_table(E::REVISIONS)?;
        let mut row: RevisionRecord<E> = match revisions.get((id, sequence))? {
            Some(bytes) => decode(bytes.value())?,
            None => return Ok(None),
        };
        // A row never closes before it opened.
        let at = at.max(row.entity.element().updated_at);
        row.entity.element_mut().deleted_at = Some(at);
        row.archived_at = Some(at);
        revisions.insert((id, sequence), encode(&row)?.as_slice())?;
        Ok(Some(row))
    }

    /// Retire a live edge and drop its endpoint entries.
    fn retire_edge(
        write_txn: &WriteTransaction,
        id: &str,
        at: Timestamp,
    ) -> Result<bool, TopologyError> {
        let Some(row) = Self::retire::<Edge>(write_txn, id, at)? else {
            return Ok(false);
        };
        let mut endpoints = write_txn.open_table(EDGE_ENDPOINTS)?;
        endpoints.remove((row.entity.parent.as_str(), id))?;
        endpoints.remove((row.entity.child.as_str(), id))?;
        Ok(true)
    }

    /// Live edge IDs incident to `node`.
    fn incident_edges(
        write_txn: &WriteTransaction,
        node: &str,
    ) -> Result<Vec<String>, TopologyError> {
        let endpoints = write_txn.open_table(EDGE_ENDPOINTS)?;
        let mut ids = Vec::new();
        for entry in endpoints.range((node, "")..)? {
            let (key, _) = entry?;
            let (owner, edge) = key.value();
            if owner != node {
                break;
            }
            ids.push(edge.to_string());
        }
        Ok(ids)
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    fn get<E: Stored>(
        &self,
        id: &Identifier,
        t: Option<&TimeSlice>,
    ) -> Result<Vec<E>, TopologyError> {
        let read_txn = self.db.begin_read()?;
        let revisions = read_txn.open_table(E::REVISIONS)?;
        let found = match t {
            Some(slice) => row_at::<E>(&revisions, id.as_str(), slice)?,
            None => {
                let live = read_txn.open_table(E::LIVE)?;
                let sequence = live.get(id.as_str())?.map(|v| v.value());
                match sequence {
                    Some(sequence) => match revisions.get((id.as_str(), sequence))? {
                        Some(bytes) => Some(decode::<E>(bytes.value())?.entity),
                        None => None,
                    },
                    None => None,
                }
            }
        };
        Ok(found.into_iter().collect())
    }

    fn scan<E: Stored>(
        &self,
        t: Option<&TimeSlice>,
        filter: &Metadata,
    ) -> Result<Vec<E>, TopologyError> {
        let read_txn = self.db.begin_read()?;
        let revisions = read_txn.open_table(E::REVISIONS)?;
        let entities = match t {
            Some(slice) => all_at::<E>(&revisions, slice)?,
            None => {
                let live = read_txn.open_table(E::LIVE)?;
                let mut entities = Vec::new();
                for entry in live.iter()? {
                    let (key, sequence) = entry?;
                    if let Some(bytes) = revisions.get((key.value(), sequence.value()))? {
                        entities.push(decode::<E>(bytes.value())?.entity);
                    }
                }
                entities
            }
        };
        Ok(entities
            .into_iter()
            .filter(|entity| entity.metadata().matches(filter))
            .collect())
    }
}

// =============================================================================
// GRAPHBACKEND TRAIT IMPLEMENTATION
// =============================================================================

impl GraphBackend for HistoryStore {
    fn node_added(&self, node: &Node) -> Result<bool, TopologyError> {
        self.create(node, |_| Ok(()))
    }

    fn node_deleted(&self, node: &Node) -> Result<bool, TopologyError> {
        let id = node.id().as_str();
        let at = node.element.deleted_at.unwrap_or(node.element.updated_at);

        let write_txn = self.db.begin_write()?;
        let edges = Self::incident_edges(&write_txn, id)?;
        for edge in &edges {
            Self::retire_edge(&write_txn, edge, at)?;
        }
        let changed = Self::retire::<Node>(&write_txn, id, at)?.is_some();
        write_txn.commit()?;

        if !edges.is_empty() {
            tracing::debug!(node = %node.id(), edges = edges.len(), at = %at, "cascade soft-delete of incident edges");
        }
        Ok(changed)
    }

    fn get_node(
        &self,
        id: &Identifier,
        t: Option<&TimeSlice>,
    ) -> Result<Vec<Node>, TopologyError> {
        self.get(id, t)
    }

    fn get_node_edges(
        &self,
        node: &Node,
        t: Option<&TimeSlice>,
        filter: &Metadata,
    ) -> Result<Vec<Edge>, TopologyError> {
        let edges = match t {
            Some(_) => self
                .scan::<Edge>(t, filter)?
                .into_iter()
                .filter(|edge| edge.touches(node.id()))
                .collect(),
            None => {
                let read_txn = self.db.begin_read()?;
                let endpoints = read_txn.open_table(EDGE_ENDPOINTS)?;
                let live = read_txn.open_table(LIVE_EDGES)?;
                let revisions = read_txn.open_table(EDGE_REVISIONS)?;
                let id = node.id().as_str();

                let mut edges = Vec::new();
                for entry in endpoints.range((id, "")..)? {
                    let (key, _) = entry?;
                    let (owner, edge_id) = key.value();
                    if owner != id {
                        break;
                    }
                    let Some(sequence) = live.get(edge_id)?.map(|v| v.value()) else {
                        continue;
                    };
                    if let Some(bytes) = revisions.get((edge_id, sequence))? {
                        let edge = decode::<Edge>(bytes.value())?.entity;
                        if edge.metadata().matches(filter) {
                            edges.push(edge);
                        }
                    }
                }
                edges
            }
        };
        Ok(edges)
    }

    fn edge_added(&self, edge: &Edge) -> Result<bool, TopologyError> {
        let id = edge.id().as_str();
        self.create(edge, |write_txn| {
            let mut endpoints = write_txn.open_table(EDGE_ENDPOINTS)?;
            if edge.parent == edge.child {
                endpoints.insert((edge.parent.as_str(), id), ROLE_PARENT | ROLE_CHILD)?;
            } else {
                endpoints.insert((edge.parent.as_str(), id), ROLE_PARENT)?;
                endpoints.insert((edge.child.as_str(), id), ROLE_CHILD)?;
            }
            Ok(())
        })
    }

    fn edge_deleted(&self, edge: &Edge) -> Result<bool, TopologyError> {
        let at = edge.element.deleted_at.unwrap_or(edge.element.updated_at);
        let write_txn = self.db.begin_write()?;
        let changed = Self::retire_edge(&write_txn, edge.id().as_str(), at)?;
        write_txn.commit()?;
        Ok(changed)
    }

    fn get_edge(
        &self,
        id: &Identifier,
        t: Option<&TimeSlice>,
    ) -> Result<Vec<Edge>, TopologyError> {
        self.get(id, t)
    }

    fn get_edge_nodes(
        &self,
        edge: &Edge,
        t: Option<&TimeSlice>,
        parent_filter: &Metadata,
        child_filter: &Metadata,
    ) -> Result<(Vec<Node>, Vec<Node>), TopologyError> {
        let parents = self
            .get::<Node>(&edge.parent, t)?
            .into_iter()
            .filter(|node| node.metadata().matches(parent_filter))
            .collect();
        let children = self
            .get::<Node>(&edge.child, t)?
            .into_iter()
            .filter(|node| node.metadata().matches(child_filter))
            .collect();
        Ok((parents, children))
    }

    fn metadata_updated(&self, entity: EntityRef<'_>) -> Result<bool, TopologyError> {
        match entity {
            EntityRef::Node(node) => self.revise(node),
            EntityRef::Edge(edge) => self.revise(edge),
        }
    }

    fn get_nodes(
        &self,
        t: Option<&TimeSlice>,
        filter: &Metadata,
    ) -> Result<Vec<Node>, TopologyError> {
        self.scan(t, filter)
    }

    fn get_edges(
        &self,
        t: Option<&TimeSlice>,
        filter: &Metadata,
    ) -> Result<Vec<Edge>, TopologyError> {
        self.scan(t, filter)
    }

    fn check_context(&self, _context: &GraphContext) -> Result<(), TopologyError> {
        Ok(())
    }
}
