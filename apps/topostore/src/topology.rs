//! # Topology Handle
//!
//! Opens the revision store, puts the in-memory index in front of it and
//! wires the graph façade on top. The CLI and the HTTP server share it.

use crate::config::Config;
use std::path::Path;
use std::sync::Arc;
use topostore_core::{
    CacheMode, CachedBackend, Graph, GraphConfig, HistoryStore, MemoryBackend, TopologyError,
};

/// The three views of one opened store.
///
/// Cloning is cheap: every field is shared.
#[derive(Debug, Clone)]
pub struct Topology {
    pub graph: Graph,
    pub backend: Arc<CachedBackend>,
    pub history: Arc<HistoryStore>,
}

impl Topology {
    /// Open the store named by `config`, warm the index and apply the
    /// configured mode.
    pub fn open(config: &Config) -> Result<Self, TopologyError> {
        Self::open_at(
            &config.storage.path,
            config.graph_config(),
            config.graph.indexed_keys.iter().cloned(),
            config.storage.mode,
        )
    }

    pub fn open_at<I>(
        path: &Path,
        graph_config: GraphConfig,
        indexed_keys: I,
        mode: CacheMode,
    ) -> Result<Self, TopologyError>
    where
        I: IntoIterator<Item = String>,
    {
        let history = Arc::new(HistoryStore::open(path)?);
        let backend = Arc::new(CachedBackend::new(
            MemoryBackend::with_indexed_keys(indexed_keys),
            history.clone(),
        ));
        backend.warm()?;
        backend.set_mode(mode);
        let graph = Graph::new(backend.clone(), graph_config);

        tracing::info!(path = %path.display(), %mode, "topology opened");
        Ok(Self {
            graph,
            backend,
            history,
        })
    }
}
