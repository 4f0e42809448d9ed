//! # Core Type Definitions
//!
//! This module contains the value types shared by every backend:
//! - Identifiers and timestamps (`Identifier`, `Timestamp`, `TimeSlice`)
//! - Attribute sets (`Metadata`)
//! - Ownership labels (`Origin`)
//! - Graph entities (`Element`, `Node`, `Edge`, `Entity`, `EntityRef`)
//! - Read scoping (`GraphContext`)
//! - Error types (`TopologyError`)
//!
//! ## Wire Names
//!
//! Entities serialize with the field names of the durable record contract
//! (`ID`, `Host`, `Origin`, `Metadata`, `CreatedAt`, `UpdatedAt`, `DeletedAt`,
//! `Revision`, plus `Parent`/`Child` on edges). The same shape travels in sync
//! messages and is stored in the revision tables.

use crate::primitives::METADATA_PATH_SEPARATOR;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

// =============================================================================
// IDENTIFIERS & TIME
// =============================================================================

/// Opaque, stable identifier of a node or edge.
///
/// Assigned by the agent that discovers the object and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(pub String);

impl Identifier {
    /// Create a new identifier.
    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identifier {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Identifier {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Milliseconds since the Unix epoch.
///
/// Every lifecycle stamp and every persisted time is expressed in this unit.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Build a timestamp from whole seconds (`from_secs(1)` is `1000`).
    #[must_use]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(1000))
    }

    /// Build a timestamp from milliseconds.
    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Current wall-clock time. Clocks set before the epoch read as zero.
    #[must_use]
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0);
        Self(millis)
    }

    /// Raw millisecond value.
    #[must_use]
    pub const fn millis(self) -> i64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A closed interval `[start, last]` of time.
///
/// A slice with `start == last` designates a single instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TimeSlice {
    pub start: Timestamp,
    pub last: Timestamp,
}

impl TimeSlice {
    /// Create a slice. Bounds given in reverse order are swapped.
    #[must_use]
    pub fn new(start: Timestamp, last: Timestamp) -> Self {
        if start <= last {
            Self { start, last }
        } else {
            Self {
                start: last,
                last: start,
            }
        }
    }

    /// A slice covering exactly one instant.
    #[must_use]
    pub const fn instant(at: Timestamp) -> Self {
        Self {
            start: at,
            last: at,
        }
    }

    /// Whether a validity interval `[from, until)` intersects this slice.
    ///
    /// `until == None` means the interval is still open.
    #[must_use]
    pub fn overlaps(&self, from: Timestamp, until: Option<Timestamp>) -> bool {
        from <= self.last && until.is_none_or(|end| end > self.start)
    }
}

// =============================================================================
// METADATA
// =============================================================================

/// Ordered key/value attribute set attached to nodes and edges.
///
/// Values are arbitrary JSON (numbers, strings, nested maps and sequences)
/// and compare structurally.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, Value>);

impl Metadata {
    /// Create an empty attribute set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of top-level keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no key is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Top-level lookup.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Lookup by dotted path (`"Captures.ID"`), falling back to a top-level
    /// key that literally contains the separator.
    #[must_use]
    pub fn get_field(&self, path: &str) -> Option<&Value> {
        if let Some(value) = self.0.get(path) {
            return Some(value);
        }
        let mut parts = path.split(METADATA_PATH_SEPARATOR);
        let mut current = self.0.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    /// Set a key, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    /// Remove a key, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Iterate over entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// True when every entry of `filter` resolves to an equal value here.
    ///
    /// Filter keys may be dotted paths. An empty filter matches everything.
    #[must_use]
    pub fn matches(&self, filter: &Metadata) -> bool {
        filter
            .iter()
            .all(|(path, expected)| self.get_field(path) == Some(expected))
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl From<BTreeMap<String, Value>> for Metadata {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

// =============================================================================
// ORIGIN
// =============================================================================

/// Which collector produced an entity: a service identity plus a host.
///
/// Serialized as the single string `"<service>.<host>"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Origin {
    pub service: String,
    pub host: String,
}

impl Origin {
    /// Create an origin label.
    #[must_use]
    pub fn new(service: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            host: host.into(),
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.host)
    }
}

impl From<String> for Origin {
    fn from(s: String) -> Self {
        // Service names carry no separator; host names may.
        match s.split_once('.') {
            Some((service, host)) => Self::new(service, host),
            None => Self::new(s, ""),
        }
    }
}

impl From<Origin> for String {
    fn from(origin: Origin) -> Self {
        origin.to_string()
    }
}

// =============================================================================
// ENTITIES
// =============================================================================

/// Fields common to nodes and edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Element {
    #[serde(rename = "ID")]
    pub id: Identifier,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub origin: Origin,
    #[serde(default)]
    pub created_at: Timestamp,
    #[serde(default)]
    pub updated_at: Timestamp,
    #[serde(default)]
    pub deleted_at: Option<Timestamp>,
    #[serde(default = "first_revision")]
    pub revision: u64,
}

fn first_revision() -> u64 {
    1
}

impl Element {
    /// A fresh first revision stamped at `at`.
    #[must_use]
    pub fn new(
        id: Identifier,
        metadata: Metadata,
        at: Timestamp,
        host: impl Into<String>,
        origin: Origin,
    ) -> Self {
        Self {
            id,
            metadata,
            host: host.into(),
            origin,
            created_at: at,
            updated_at: at,
            deleted_at: None,
            revision: 1,
        }
    }
}

/// A topology object (host, interface, pod, service...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(flatten)]
    pub element: Element,
}

impl Node {
    /// Wrap element fields into a node.
    #[must_use]
    pub const fn new(element: Element) -> Self {
        Self { element }
    }
}

/// A relation between two nodes, stored as an independent entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    #[serde(flatten)]
    pub element: Element,
    #[serde(rename = "Parent")]
    pub parent: Identifier,
    #[serde(rename = "Child")]
    pub child: Identifier,
}

impl Edge {
    /// Wrap element fields and endpoints into an edge.
    #[must_use]
    pub const fn new(element: Element, parent: Identifier, child: Identifier) -> Self {
        Self {
            element,
            parent,
            child,
        }
    }

    /// Whether `node` is one of this edge's endpoints.
    #[must_use]
    pub fn touches(&self, node: &Identifier) -> bool {
        &self.parent == node || &self.child == node
    }
}

/// Behaviour shared by nodes and edges so that stores can be written once.
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Human-readable kind, used in logs and errors.
    const KIND: &'static str;

    fn element(&self) -> &Element;

    fn element_mut(&mut self) -> &mut Element;

    fn id(&self) -> &Identifier {
        &self.element().id
    }

    fn metadata(&self) -> &Metadata {
        &self.element().metadata
    }

    fn revision(&self) -> u64 {
        self.element().revision
    }

    /// Whether the entity carries a deletion stamp.
    fn is_deleted(&self) -> bool {
        self.element().deleted_at.is_some()
    }
}

impl Entity for Node {
    const KIND: &'static str = "node";

    fn element(&self) -> &Element {
        &self.element
    }

    fn element_mut(&mut self) -> &mut Element {
        &mut self.element
    }
}

impl Entity for Edge {
    const KIND: &'static str = "edge";

    fn element(&self) -> &Element {
        &self.element
    }

    fn element_mut(&mut self) -> &mut Element {
        &mut self.element
    }
}

/// Borrowed node-or-edge, the argument of `metadata_updated`.
#[derive(Debug, Clone, Copy)]
pub enum EntityRef<'a> {
    Node(&'a Node),
    Edge(&'a Edge),
}

impl EntityRef<'_> {
    /// Element fields of the referenced entity.
    #[must_use]
    pub fn element(&self) -> &Element {
        match self {
            Self::Node(node) => &node.element,
            Self::Edge(edge) => &edge.element,
        }
    }
}

// =============================================================================
// READ CONTEXT
// =============================================================================

/// Scope applied to reads: live state, or state within a time slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GraphContext {
    pub time_slice: Option<TimeSlice>,
}

impl GraphContext {
    /// The live (current) state.
    #[must_use]
    pub const fn live() -> Self {
        Self { time_slice: None }
    }

    /// State as of the given slice.
    #[must_use]
    pub const fn at(slice: TimeSlice) -> Self {
        Self {
            time_slice: Some(slice),
        }
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur in the topology store.
///
/// - A delete of an absent entity is not an error (it returns "no change")
/// - Unknown sync message types are not an error (they pass through)
/// - Storage failures always propagate; they are never turned into booleans
#[derive(Debug, Error)]
pub enum TopologyError {
    /// The durable store failed (open, transaction, table or commit).
    #[error("Storage error: {0}")]
    Storage(String),

    /// A record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(String),

    /// Configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A `SyncRequest` payload lacked its required structure.
    #[error("SyncRequest malformed: {0}")]
    SyncRequestMalformed(String),

    /// A `Sync`/`SyncReply` payload lacked `Nodes` or `Edges`.
    #[error("Sync/SyncReply malformed: {0}")]
    SyncMalformed(String),

    /// A node or edge message payload could not be decoded.
    #[error("{kind} message malformed: {reason}")]
    MessageMalformed { kind: String, reason: String },

    /// The live revision moved on (or vanished) before this update landed.
    #[error("Revision conflict on {id}: live revision {live:?}, incoming {incoming}")]
    Conflict {
        id: Identifier,
        live: Option<u64>,
        incoming: u64,
    },

    /// The requested node does not exist in the live graph.
    #[error("Node not found: {0}")]
    NodeNotFound(Identifier),

    /// The requested edge does not exist in the live graph.
    #[error("Edge not found: {0}")]
    EdgeNotFound(Identifier),

    /// A time-scoped read reached a backend without history.
    #[error("Backend keeps no history; time-scoped reads are unsupported")]
    TimeTravelUnsupported,

    /// A mutation was attempted through a time-scoped graph view.
    #[error("Graph view is scoped to a time slice and is read-only")]
    ReadOnlyContext,

    /// An unknown cache mode name was supplied.
    #[error("Invalid cache mode: {0}")]
    InvalidMode(String),

    /// A lock protecting in-memory state was poisoned by a panicking writer.
    #[error("Lock poisoned")]
    LockPoisoned,
}

impl TopologyError {
    /// Whether retrying the same call (after re-reading state) may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<redb::DatabaseError> for TopologyError {
    fn from(e: redb::DatabaseError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<redb::TransactionError> for TopologyError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<redb::TableError> for TopologyError {
    fn from(e: redb::TableError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<redb::StorageError> for TopologyError {
    fn from(e: redb::StorageError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<redb::CommitError> for TopologyError {
    fn from(e: redb::CommitError) -> Self {
        Self::Storage(e.to_string())
    }
}

// =============================================================================
// TESTS
// =============================================================================
