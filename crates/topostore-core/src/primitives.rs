//! # Store Primitives
//!
//! Fixed constants of the topology store. These are compiled into the binary
//! and are immutable at runtime.

/// Separator used by dotted metadata paths (`"Captures.ID"`).
pub const METADATA_PATH_SEPARATOR: char = '.';

/// Service label used when a graph is built without an explicit service.
pub const DEFAULT_SERVICE: &str = "unknown";

/// On-disk layout version of the revision tables.
///
/// Increment this when making breaking changes to the persisted row layout.
pub const SCHEMA_VERSION: u64 = 1;

/// Maximum size of one serialized sync envelope (16 MiB).
///
/// Transports and the HTTP layer reject larger payloads before decoding.
pub const MAX_ENVELOPE_BYTES: usize = 16 * 1024 * 1024;

// =============================================================================
// SYNC MESSAGE TAGS
// =============================================================================

pub const SYNC_MSG_TYPE: &str = "Sync";
pub const SYNC_REQUEST_MSG_TYPE: &str = "SyncRequest";
pub const SYNC_REPLY_MSG_TYPE: &str = "SyncReply";
pub const ORIGIN_GRAPH_DELETED_MSG_TYPE: &str = "OriginGraphDeleted";
pub const NODE_UPDATED_MSG_TYPE: &str = "NodeUpdated";
pub const NODE_DELETED_MSG_TYPE: &str = "NodeDeleted";
pub const NODE_ADDED_MSG_TYPE: &str = "NodeAdded";
pub const EDGE_UPDATED_MSG_TYPE: &str = "EdgeUpdated";
pub const EDGE_DELETED_MSG_TYPE: &str = "EdgeDeleted";
pub const EDGE_ADDED_MSG_TYPE: &str = "EdgeAdded";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_tags_are_distinct() {
        let tags = [
            SYNC_MSG_TYPE,
            SYNC_REQUEST_MSG_TYPE,
            SYNC_REPLY_MSG_TYPE,
            ORIGIN_GRAPH_DELETED_MSG_TYPE,
            NODE_UPDATED_MSG_TYPE,
            NODE_DELETED_MSG_TYPE,
            NODE_ADDED_MSG_TYPE,
            EDGE_UPDATED_MSG_TYPE,
            EDGE_DELETED_MSG_TYPE,
            EDGE_ADDED_MSG_TYPE,
        ];
        let unique: std::collections::BTreeSet<_> = tags.iter().collect();
        assert_eq!(unique.len(), tags.len());
    }

    #[test]
    fn envelope_limit_is_sixteen_mib() {
        assert_eq!(MAX_ENVELOPE_BYTES, 16_777_216);
    }
}
