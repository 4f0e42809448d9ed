//! # topostore-core
//!
//! The temporal graph store of a distributed network-topology tracker.
//!
//! Collectors observe infrastructure objects (hosts, interfaces, pods,
//! services) and emit graph mutations. This crate holds the current topology,
//! keeps every revision so the graph can be rebuilt as it was at any instant,
//! and defines the messages peers exchange to replicate it.
//!
//! ## Layers
//!
//! - `memory`: current-state index, no history
//! - `storage`: redb revision store, append-only, point-in-time reads
//! - `cached`: mode-driven routing over the two
//! - `sync`: replication message codec
//! - `graph`: mutation façade, listeners, inbound replication
//!
//! ## Architectural Constraints
//!
//! - Pure Rust: no async, no network dependencies
//! - Every backend method takes `&self`; backends are `Send + Sync`
//! - A committed revision is never rewritten, only stamped as ended

// =============================================================================
// MODULES
// =============================================================================

pub mod backend;
pub mod cached;
pub mod graph;
pub mod memory;
pub mod primitives;
pub mod storage;
pub mod sync;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    Edge, Element, Entity, EntityRef, GraphContext, Identifier, Metadata, Node, Origin,
    TimeSlice, Timestamp, TopologyError,
};

// =============================================================================
// RE-EXPORTS: Backends
// =============================================================================

pub use backend::GraphBackend;
pub use cached::{CacheMode, CachedBackend};
pub use memory::MemoryBackend;
pub use storage::{HistoryStore, RevisionRecord};

// =============================================================================
// RE-EXPORTS: Replication & Façade
// =============================================================================

pub use graph::{
    ChannelListener, FilterResolver, Graph, GraphConfig, GraphEvent, GraphListener,
    MetadataFilterResolver,
};
pub use sync::{Envelope, Message, SyncRequest, SyncSnapshot};
