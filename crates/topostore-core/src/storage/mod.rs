//! # Storage Module
//!
//! Durable backends for the topology store.
//!
//! - `history`: redb revision store with point-in-time reads

mod history;

pub use history::{HistoryStore, RevisionRecord};
