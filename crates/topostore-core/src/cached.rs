//! # Dual-Mode Backend
//!
//! `CachedBackend` fans writes out to the in-memory index and a durable
//! backend, and routes reads to whichever of the two can answer them.
//!
//! ## Routing
//!
//! | Call                | `CacheOnly` | `PersistentOnly` | `Default`            |
//! |---------------------|-------------|------------------|----------------------|
//! | add / delete        | memory      | persistent       | memory, persistent   |
//! | `metadata_updated`  | memory      | persistent       | persistent, memory   |
//! | live read           | memory      | persistent       | memory               |
//! | time-scoped read    | empty       | persistent       | persistent           |
//!
//! `metadata_updated` writes the durable store first: a rejected revision
//! (`TopologyError::Conflict`) must not reach the cache.
//!
//! The mode is read once per call, so a call in flight keeps the routing it
//! started with while new calls see a mode change immediately.

use crate::backend::GraphBackend;
use crate::memory::MemoryBackend;
use crate::storage::HistoryStore;
use crate::{Edge, EntityRef, GraphContext, Identifier, Metadata, Node, TimeSlice, TopologyError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

// =============================================================================
// CACHE MODE
// =============================================================================

/// Which backends a `CachedBackend` call reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CacheMode {
    /// In-memory index only; time-scoped reads yield nothing.
    CacheOnly = 0,
    /// Durable store only.
    PersistentOnly = 1,
    /// Both: writes everywhere, live reads from memory.
    #[default]
    Default = 2,
}

impl CacheMode {
    /// Canonical lowercase name, as used in config files and the HTTP API.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CacheOnly => "cache_only",
            Self::PersistentOnly => "persistent_only",
            Self::Default => "default",
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::CacheOnly,
            1 => Self::PersistentOnly,
            _ => Self::Default,
        }
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheMode {
    type Err = TopologyError;

    /// Accepts `cache_only`, `cache-only` and `CACHE_ONLY` spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "cache_only" => Ok(Self::CacheOnly),
            "persistent_only" => Ok(Self::PersistentOnly),
            "default" => Ok(Self::Default),
            _ => Err(TopologyError::InvalidMode(s.to_string())),
        }
    }
}

// =============================================================================
// CACHED BACKEND
// =============================================================================

enum Route {
    Memory,
    Persistent,
    Empty,
}

/// Mode-driven coordinator over an in-memory index and a durable backend.
pub struct CachedBackend {
    memory: MemoryBackend,
    persistent: Arc<dyn GraphBackend>,
    mode: AtomicU8,
}

impl fmt::Debug for CachedBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedBackend")
            .field("memory", &self.memory)
            .field("mode", &self.mode())
            .finish_non_exhaustive()
    }
}

impl CachedBackend {
    /// Combine an index with a durable backend, starting in `Default` mode.
    #[must_use]
    pub fn new(memory: MemoryBackend, persistent: Arc<dyn GraphBackend>) -> Self {
        Self {
            memory,
            persistent,
            mode: AtomicU8::new(CacheMode::Default as u8),
        }
    }

    /// Open a revision store at `path` and put an index in front of it.
    pub fn open<I, S>(path: impl AsRef<Path>, indexed_keys: I) -> Result<Self, TopologyError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = HistoryStore::open(path)?;
        Ok(Self::new(
            MemoryBackend::with_indexed_keys(indexed_keys),
            Arc::new(store),
        ))
    }

    /// Switch routing for every call started from now on.
    pub fn set_mode(&self, mode: CacheMode) {
        let previous = CacheMode::from_u8(self.mode.swap(mode as u8, Ordering::AcqRel));
        if previous != mode {
            tracing::info!(from = %previous, to = %mode, "cache mode changed");
        }
    }

    /// Current routing mode.
    #[must_use]
    pub fn mode(&self) -> CacheMode {
        CacheMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    /// The in-memory index.
    #[must_use]
    pub fn memory(&self) -> &MemoryBackend {
        &self.memory
    }

    /// The durable backend.
    #[must_use]
    pub fn persistent(&self) -> &Arc<dyn GraphBackend> {
        &self.persistent
    }

    /// Load the durable live state into the index.
    ///
    /// A freshly opened process starts with an empty index; without this,
    /// live reads in `Default` mode would not see what earlier runs stored.
    /// Returns how many nodes and edges were loaded.
    pub fn warm(&self) -> Result<(usize, usize), TopologyError> {
        let everything = Metadata::new();
        let mut nodes = 0;
        for node in self.persistent.get_nodes(None, &everything)? {
            if self.memory.node_added(&node)? {
                nodes += 1;
            }
        }
        let mut edges = 0;
        for edge in self.persistent.get_edges(None, &everything)? {
            if self.memory.edge_added(&edge)? {
                edges += 1;
            }
        }
        tracing::info!(nodes, edges, "cache warmed from durable store");
        Ok((nodes, edges))
    }

    fn route(&self, t: Option<&TimeSlice>) -> Route {
        let mode = self.mode();
        if t.is_none() && mode != CacheMode::PersistentOnly {
            Route::Memory
        } else if mode != CacheMode::CacheOnly {
            Route::Persistent
        } else {
            Route::Empty
        }
    }

    /// Memory first, then persistent. The durable result wins when both run.
    fn fan_out(
        &self,
        op: &'static str,
        id: &Identifier,
        write: impl Fn(&dyn GraphBackend) -> Result<bool, TopologyError>,
    ) -> Result<bool, TopologyError> {
        let mode = self.mode();
        let mut changed = false;
        if mode != CacheMode::PersistentOnly {
            changed = write(&self.memory)?;
        }
        if mode != CacheMode::CacheOnly {
            return write(self.persistent.as_ref()).inspect_err(|e| {
                if mode == CacheMode::Default {
                    tracing::warn!(op, %id, error = %e, "durable write failed after cache update");
                }
            });
        }
        Ok(changed)
    }
}

impl GraphBackend for CachedBackend {
    fn node_added(&self, node: &Node) -> Result<bool, TopologyError> {
        self.fan_out("node_added", &node.element.id, |b| b.node_added(node))
    }

    fn node_deleted(&self, node: &Node) -> Result<bool, TopologyError> {
        self.fan_out("node_deleted", &node.element.id, |b| b.node_deleted(node))
    }

    fn get_node(
        &self,
        id: &Identifier,
        t: Option<&TimeSlice>,
    ) -> Result<Vec<Node>, TopologyError> {
        match self.route(t) {
            Route::Memory => self.memory.get_node(id, t),
            Route::Persistent => self.persistent.get_node(id, t),
            Route::Empty => Ok(Vec::new()),
        }
    }

    fn get_node_edges(
        &self,
        node: &Node,
        t: Option<&TimeSlice>,
        filter: &Metadata,
    ) -> Result<Vec<Edge>, TopologyError> {
        match self.route(t) {
            Route::Memory => self.memory.get_node_edges(node, t, filter),
            Route::Persistent => self.persistent.get_node_edges(node, t, filter),
            Route::Empty => Ok(Vec::new()),
        }
    }

    fn edge_added(&self, edge: &Edge) -> Result<bool, TopologyError> {
        self.fan_out("edge_added", &edge.element.id, |b| b.edge_added(edge))
    }

    fn edge_deleted(&self, edge: &Edge) -> Result<bool, TopologyError> {
        self.fan_out("edge_deleted", &edge.element.id, |b| b.edge_deleted(edge))
    }

    fn get_edge(
        &self,
        id: &Identifier,
        t: Option<&TimeSlice>,
    ) -> Result<Vec<Edge>, TopologyError> {
        match self.route(t) {
            Route::Memory => self.memory.get_edge(id, t),
            Route::Persistent => self.persistent.get_edge(id, t),
            Route::Empty => Ok(Vec::new()),
        }
    }

    fn get_edge_nodes(
        &self,
        edge: &Edge,
        t: Option<&TimeSlice>,
        parent_filter: &Metadata,
        child_filter: &Metadata,
    ) -> Result<(Vec<Node>, Vec<Node>), TopologyError> {
        match self.route(t) {
            Route::Memory => self
                .memory
                .get_edge_nodes(edge, t, parent_filter, child_filter),
            Route::Persistent => self
                .persistent
                .get_edge_nodes(edge, t, parent_filter, child_filter),
            Route::Empty => Ok((Vec::new(), Vec::new())),
        }
    }

    fn metadata_updated(&self, entity: EntityRef<'_>) -> Result<bool, TopologyError> {
        let mode = self.mode();
        let mut changed = false;
        if mode != CacheMode::CacheOnly {
            changed = self.persistent.metadata_updated(entity)?;
        }
        if mode != CacheMode::PersistentOnly {
            let cached = self.memory.metadata_updated(entity)?;
            if mode == CacheMode::CacheOnly {
                changed = cached;
            }
        }
        Ok(changed)
    }

    fn get_nodes(
        &self,
        t: Option<&TimeSlice>,
        filter: &Metadata,
    ) -> Result<Vec<Node>, TopologyError> {
        match self.route(t) {
            Route::Memory => self.memory.get_nodes(t, filter),
            Route::Persistent => self.persistent.get_nodes(t, filter),
            Route::Empty => Ok(Vec::new()),
        }
    }

    fn get_edges(
        &self,
        t: Option<&TimeSlice>,
        filter: &Metadata,
    ) -> Result<Vec<Edge>, TopologyError> {
        match self.route(t) {
            Route::Memory => self.memory.get_edges(t, filter),
            Route::Persistent => self.persistent.get_edges(t, filter),
            Route::Empty => Ok(Vec::new()),
        }
    }

    fn check_context(&self, context: &GraphContext) -> Result<(), TopologyError> {
        self.persistent.check_context(context)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::{Element, Origin, Timestamp};
    use serde_json::json;
    use tempfile::tempdir;

    fn open() -> (tempfile::TempDir, CachedBackend) {
        let temp = tempdir().expect("temp dir");
        let backend =
            CachedBackend::open(temp.path().join("cache.redb"), ["MAC"]).expect("open backend");
        (temp, backend)
    }

    fn node(id: &str, secs: i64) -> Node {
        Node::new(Element::new(
            Identifier::new(id),
            [("MTU", json!(1500))].into_iter().collect(),
            Timestamp::from_secs(secs),
            "host1",
            Origin::new("unknown", "host1"),
        ))
    }

    /// Durable backend that rejects every call.
    struct Unavailable;

    impl GraphBackend for Unavailable {
        fn node_added(&self, _: &Node) -> Result<bool, TopologyError> {
            Err(TopologyError::Storage("disk gone".into()))
        }
        fn node_deleted(&self, _: &Node) -> Result<bool, TopologyError> {
            Err(TopologyError::Storage("disk gone".into()))
        }
        fn get_node(&self, _: &Identifier, _: Option<&TimeSlice>) -> Result<Vec<Node>, TopologyError> {
            Err(TopologyError::Storage("disk gone".into()))
        }
        fn get_node_edges(
            &self,
            _: &Node,
            _: Option<&TimeSlice>,
            _: &Metadata,
        ) -> Result<Vec<Edge>, TopologyError> {
            Err(TopologyError::Storage("disk gone".into()))
        }
        fn edge_added(&self, _: &Edge) -> Result<bool, TopologyError> {
            Err(TopologyError::Storage("disk gone".into()))
        }
        fn edge_deleted(&self, _: &Edge) -> Result<bool, TopologyError> {
            Err(TopologyError::Storage("disk gone".into()))
        }
        fn get_edge(&self, _: &Identifier, _: Option<&TimeSlice>) -> Result<Vec<Edge>, TopologyError> {
            Err(TopologyError::Storage("disk gone".into()))
        }
        fn get_edge_nodes(
            &self,
            _: &Edge,
            _: Option<&TimeSlice>,
            _: &Metadata,
            _: &Metadata,
        ) -> Result<(Vec<Node>, Vec<Node>), TopologyError> {
            Err(TopologyError::Storage("disk gone".into()))
        }
        fn metadata_updated(&self, _: EntityRef<'_>) -> Result<bool, TopologyError> {
            Err(TopologyError::Storage("disk gone".into()))
        }
        fn get_nodes(&self, _: Option<&TimeSlice>, _: &Metadata) -> Result<Vec<Node>, TopologyError> {
            Err(TopologyError::Storage("disk gone".into()))
        }
        fn get_edges(&self, _: Option<&TimeSlice>, _: &Metadata) -> Result<Vec<Edge>, TopologyError> {
            Err(TopologyError::Storage("disk gone".into()))
        }
        fn check_context(&self, _: &GraphContext) -> Result<(), TopologyError> {
            Err(TopologyError::Storage("disk gone".into()))
        }
    }

    #[test]
    fn mode_names_parse() {
        assert_eq!("cache_only".parse::<CacheMode>().unwrap(), CacheMode::CacheOnly);
        assert_eq!("PERSISTENT_ONLY".parse::<CacheMode>().unwrap(), CacheMode::PersistentOnly);
        assert_eq!("default".parse::<CacheMode>().unwrap(), CacheMode::Default);
        assert!(matches!(
            "sometimes".parse::<CacheMode>(),
            Err(TopologyError::InvalidMode(_))
        ));
        assert_eq!(CacheMode::CacheOnly.to_string(), "cache_only");
    }

    #[test]
    fn default_mode_writes_both_and_reads_live_from_memory() {
        let (_temp, backend) = open();
        assert_eq!(backend.mode(), CacheMode::Default);
        assert!(backend.node_added(&node("aaa", 1)).unwrap());

        assert_eq!(backend.memory().node_count().unwrap(), 1);
        let id = Identifier::new("aaa");
        assert_eq!(backend.persistent().get_node(&id, None).unwrap().len(), 1);

        // A time-scoped read reaches the durable store.
        let at = TimeSlice::instant(Timestamp::from_secs(2));
        assert_eq!(backend.get_node(&id, Some(&at)).unwrap().len(), 1);
    }

    #[test]
    fn cache_only_skips_durable_store() {
        let (_temp, backend) = open();
        backend.set_mode(CacheMode::CacheOnly);
        assert!(backend.node_added(&node("aaa", 1)).unwrap());

        let id = Identifier::new("aaa");
        assert_eq!(backend.get_node(&id, None).unwrap().len(), 1);
        assert!(backend.persistent().get_node(&id, None).unwrap().is_empty());

        let at = TimeSlice::instant(Timestamp::from_secs(2));
        assert!(backend.get_node(&id, Some(&at)).unwrap().is_empty());
        assert!(backend.get_nodes(Some(&at), &Metadata::new()).unwrap().is_empty());
    }

    #[test]
    fn cache_only_stale_update_is_a_retryable_conflict() {
        let (_temp, backend) = open();
        backend.set_mode(CacheMode::CacheOnly);
        let first = node("aaa", 1);
        backend.node_added(&first).unwrap();

        let mut stale = first.clone();
        stale.element.metadata.insert("MTU", json!(9000));
        let err = backend.metadata_updated(EntityRef::Node(&stale)).unwrap_err();
        assert!(err.is_retryable());

        let mut next = first.clone();
        next.element.revision = 2;
        next.element.metadata.insert("MTU", json!(9000));
        assert!(backend.metadata_updated(EntityRef::Node(&next)).unwrap());
    }

    #[test]
    fn persistent_only_skips_memory() {
        let (_temp, backend) = open();
        backend.set_mode(CacheMode::PersistentOnly);
        assert!(backend.node_added(&node("aaa", 1)).unwrap());

        assert_eq!(backend.memory().node_count().unwrap(), 0);
        let id = Identifier::new("aaa");
        assert_eq!(backend.get_node(&id, None).unwrap().len(), 1);
    }

    #[test]
    fn rejected_revision_never_reaches_the_cache() {
        let (_temp, backend) = open();
        let first = node("aaa", 1);
        backend.node_added(&first).unwrap();

        // Same revision as the live one: the durable store refuses it.
        let mut stale = first.clone();
        stale.element.metadata.insert("MTU", json!(9000));
        let result = backend.metadata_updated(EntityRef::Node(&stale));
        assert!(matches!(result, Err(TopologyError::Conflict { .. })));

        let cached = backend.memory().get_node(&Identifier::new("aaa"), None).unwrap();
        assert_eq!(cached[0].element.metadata.get("MTU"), Some(&json!(1500)));
    }

    #[test]
    fn warm_loads_live_state_after_reopen() {
        let temp = tempdir().expect("temp dir");
        let path = temp.path().join("cache.redb");
        {
            let backend = CachedBackend::open(&path, ["MAC"]).expect("open backend");
            backend.node_added(&node("aaa", 1)).unwrap();
            backend.node_added(&node("bbb", 1)).unwrap();
            let mut gone = node("bbb", 1);
            gone.element.deleted_at = Some(Timestamp::from_secs(2));
            backend.node_deleted(&gone).unwrap();
        }

        let backend = CachedBackend::open(&path, ["MAC"]).expect("reopen backend");
        assert!(backend.get_nodes(None, &Metadata::new()).unwrap().is_empty());
        assert_eq!(backend.warm().unwrap(), (1, 0));
        assert_eq!(backend.get_nodes(None, &Metadata::new()).unwrap().len(), 1);
    }

    #[test]
    fn durable_errors_propagate() {
        let backend = CachedBackend::new(MemoryBackend::new(), Arc::new(Unavailable));
        let result = backend.node_added(&node("aaa", 1));
        assert!(matches!(result, Err(TopologyError::Storage(_))));
        // The cache already accepted the write.
        assert_eq!(backend.memory().node_count().unwrap(), 1);

        backend.set_mode(CacheMode::CacheOnly);
        assert!(backend.node_added(&node("bbb", 1)).unwrap());
        assert!(backend.check_context(&GraphContext::live()).is_err());
    }
}
