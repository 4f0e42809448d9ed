//! # CLI Command Implementations

use crate::api;
use crate::config::Config;
use crate::topology::Topology;
use serde_json::Value;
use std::path::{Path, PathBuf};
use topostore_core::{
    Envelope, FilterResolver, GraphContext, Identifier, Message, MetadataFilterResolver,
    TimeSlice, Timestamp, TopologyError,
};

// =============================================================================
// FILE SIZE LIMITS
// =============================================================================

/// Maximum size of a replay file (100 MB).
const MAX_REPLAY_FILE_SIZE: u64 = 100 * 1024 * 1024;

fn validate_file_size(path: &Path, max_size: u64) -> Result<(), TopologyError> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| TopologyError::Io(format!("Cannot read file metadata: {}", e)))?;

    if metadata.len() > max_size {
        return Err(TopologyError::Io(format!(
            "File size {} bytes exceeds maximum allowed {} bytes",
            metadata.len(),
            max_size
        )));
    }
    Ok(())
}

/// Canonicalize an input path and make sure it names a regular file.
fn validate_file_path(path: &Path) -> Result<PathBuf, TopologyError> {
    let canonical = path.canonicalize().map_err(|e| {
        TopologyError::Io(format!("Invalid file path '{}': {}", path.display(), e))
    })?;

    if !canonical.is_file() {
        return Err(TopologyError::Io(format!(
            "Path '{}' is not a regular file",
            path.display()
        )));
    }

    Ok(canonical)
}

fn print_json(value: &impl serde::Serialize) -> Result<(), TopologyError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| TopologyError::Serialization(e.to_string()))?;
    println!("{}", text);
    Ok(())
}

// =============================================================================
// SERVER COMMAND
// =============================================================================

/// Start the HTTP server.
pub async fn cmd_server(config: &Config) -> Result<(), TopologyError> {
    let topology = Topology::open(config)?;

    println!("topostore server starting...");
    println!();
    println!("Configuration:");
    println!("  Address:  {}", config.server.addr());
    println!("  Database: {}", config.storage.path.display());
    println!("  Mode:     {}", config.storage.mode);
    println!("  Origin:   {}", config.graph_config().origin());
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    api::run_server(topology, &config.server).await
}

// =============================================================================
// STATUS COMMAND
// =============================================================================

/// Show entity counts and storage settings.
pub fn cmd_status(config: &Config, json_mode: bool) -> Result<(), TopologyError> {
    let topology = Topology::open(config)?;
    let (nodes, edges) = topology.history.live_counts()?;

    if json_mode {
        return print_json(&serde_json::json!({
            "database": config.storage.path.to_string_lossy(),
            "mode": config.storage.mode.as_str(),
            "origin": config.graph_config().origin().to_string(),
            "nodes": nodes,
            "edges": edges,
            "indexed_keys": config.graph.indexed_keys,
        }));
    }

    println!("topostore Graph Status");
    println!("======================");
    println!("Database: {}", config.storage.path.display());
    println!("Mode:     {}", config.storage.mode);
    println!("Origin:   {}", config.graph_config().origin());
    println!();
    println!("Live nodes: {}", nodes);
    println!("Live edges: {}", edges);
    println!("Indexed:    {}", config.graph.indexed_keys.join(", "));

    Ok(())
}

// =============================================================================
// DUMP COMMAND
// =============================================================================

/// Build the `Sync` envelope `dump` writes.
pub fn dump_envelope(
    topology: &Topology,
    at: Option<i64>,
    filter: Option<&str>,
) -> Result<Envelope, TopologyError> {
    let filter = MetadataFilterResolver.resolve(filter.unwrap_or_default())?;
    let graph = match at {
        Some(at) => topology.graph.with_context(GraphContext::at(TimeSlice::instant(
            Timestamp::from_millis(at),
        )))?,
        None => topology.graph.clone(),
    };
    let snapshot = graph.sync_snapshot(None, &filter)?;
    Message::Sync(snapshot).encode()
}

/// Write the graph (live or as of `at`) as a `Sync` envelope.
pub fn cmd_dump(
    config: &Config,
    at: Option<i64>,
    filter: Option<&str>,
    output: Option<&Path>,
) -> Result<(), TopologyError> {
    let topology = Topology::open(config)?;
    let envelope = dump_envelope(&topology, at, filter)?;
    let text = serde_json::to_string_pretty(&envelope)
        .map_err(|e| TopologyError::Serialization(e.to_string()))?;

    match output {
        Some(path) => {
            std::fs::write(path, text).map_err(|e| {
                TopologyError::Io(format!("Cannot write '{}': {}", path.display(), e))
            })?;
            tracing::info!(path = %path.display(), "snapshot written");
        }
        None => println!("{}", text),
    }
    Ok(())
}

// =============================================================================
// HISTORY COMMAND
// =============================================================================

/// Print every stored revision of one node or edge.
pub fn cmd_history(config: &Config, id: &str, edge: bool) -> Result<(), TopologyError> {
    let topology = Topology::open(config)?;
    let id = Identifier::new(id);
    if edge {
        let rows = topology.history.edge_history(&id)?;
        if rows.is_empty() {
            return Err(TopologyError::EdgeNotFound(id));
        }
        print_json(&rows)
    } else {
        let rows = topology.history.node_history(&id)?;
        if rows.is_empty() {
            return Err(TopologyError::NodeNotFound(id));
        }
        print_json(&rows)
    }
}

// =============================================================================
// REPLAY COMMAND
// =============================================================================

/// Outcome of a replay run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ReplaySummary {
    pub applied: usize,
    pub unknown: usize,
}

/// Split replay input into envelopes.
///
/// A document starting with `[` is one JSON array; anything else holds one
/// envelope per non-blank line.
pub fn parse_envelopes(content: &str) -> Result<Vec<Envelope>, TopologyError> {
    if content.trim_start().starts_with('[') {
        let values: Vec<Value> = serde_json::from_str(content).map_err(|e| {
            TopologyError::MessageMalformed {
                kind: "envelope".to_string(),
                reason: e.to_string(),
            }
        })?;
        return values
            .into_iter()
            .map(|value| {
                serde_json::from_value(value).map_err(|e| TopologyError::MessageMalformed {
                    kind: "envelope".to_string(),
                    reason: e.to_string(),
                })
            })
            .collect();
    }

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(number, line)| {
            Envelope::from_slice(line.as_bytes()).map_err(|e| TopologyError::MessageMalformed {
                kind: "envelope".to_string(),
                reason: format!("line {}: {}", number + 1, e),
            })
        })
        .collect()
}

/// Apply envelopes in order. The first failure stops the run.
pub fn replay(topology: &Topology, envelopes: Vec<Envelope>) -> Result<ReplaySummary, TopologyError> {
    let mut summary = ReplaySummary::default();
    for envelope in envelopes {
        let message = Message::decode(envelope)?;
        if matches!(message, Message::Unknown(_)) {
            summary.unknown += 1;
            continue;
        }
        topology.graph.apply(message)?;
        summary.applied += 1;
    }
    Ok(summary)
}

/// Apply a file of replication envelopes.
pub fn cmd_replay(config: &Config, file: &Path, json_mode: bool) -> Result<(), TopologyError> {
    let path = validate_file_path(file)?;
    validate_file_size(&path, MAX_REPLAY_FILE_SIZE)?;
    let content = std::fs::read_to_string(&path)
        .map_err(|e| TopologyError::Io(format!("Cannot read '{}': {}", path.display(), e)))?;

    let topology = Topology::open(config)?;
    let summary = replay(&topology, parse_envelopes(&content)?)?;

    if json_mode {
        return print_json(&summary);
    }
    println!("Applied {} messages", summary.applied);
    if summary.unknown > 0 {
        println!("Skipped {} messages of unknown type", summary.unknown);
    }
    Ok(())
}

// =============================================================================
// INIT COMMAND
// =============================================================================

/// Create an empty database at the configured path.
pub fn cmd_init(config: &Config, force: bool) -> Result<(), TopologyError> {
    let path = &config.storage.path;
    if path.exists() {
        if !force {
            return Err(TopologyError::Io(format!(
                "Database already exists at {}. Use --force to overwrite.",
                path.display()
            )));
        }
        std::fs::remove_file(path).map_err(|e| {
            TopologyError::Io(format!("Cannot remove '{}': {}", path.display(), e))
        })?;
    }

    Topology::open(config)?;
    println!("Initialized empty database at {}", path.display());
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use topostore_core::Metadata;

    fn config_in(dir: &tempfile::TempDir) -> Config {
        let mut config = Config::default();
        config.storage.path = dir.path().join("cli.redb");
        config
    }

    #[test]
    fn envelopes_parse_from_lines_and_arrays() {
        let lines = "{\"type\":\"NodeDeleted\",\"payload\":{}}\n\n{\"type\":\"Ping\"}\n";
        assert_eq!(parse_envelopes(lines).unwrap().len(), 2);

        let array = r#"[{"type":"Ping"},{"type":"Pong","payload":null}]"#;
        let envelopes = parse_envelopes(array).unwrap();
        assert_eq!(envelopes[1].kind, "Pong");
    }

    #[test]
    fn bad_line_names_its_position() {
        let err = parse_envelopes("{\"type\":\"Ping\"}\nnot json\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn dump_then_replay_reproduces_the_graph() {
        let source_dir = tempfile::tempdir().unwrap();
        let source = Topology::open(&config_in(&source_dir)).unwrap();
        source
            .graph
            .new_node(Identifier::new("a"), Metadata::new())
            .unwrap();
        source
            .graph
            .new_node(Identifier::new("b"), Metadata::new())
            .unwrap();
        source
            .graph
            .new_edge(
                Identifier::new("ab"),
                Identifier::new("a"),
                Identifier::new("b"),
                Metadata::new(),
            )
            .unwrap();

        let envelope = dump_envelope(&source, None, None).unwrap();
        let unknown = Envelope::new("Ping", Value::Null);

        let target_dir = tempfile::tempdir().unwrap();
        let target = Topology::open(&config_in(&target_dir)).unwrap();
        let summary = replay(&target, vec![envelope, unknown]).unwrap();

        assert_eq!(summary, ReplaySummary { applied: 1, unknown: 1 });
        assert_eq!(target.history.live_counts().unwrap(), (2, 1));
    }

    #[test]
    fn init_refuses_to_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        cmd_init(&config, false).unwrap();
        assert!(matches!(cmd_init(&config, false), Err(TopologyError::Io(_))));
        cmd_init(&config, true).unwrap();
    }
}
