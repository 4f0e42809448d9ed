//! # Configuration
//!
//! Settings come from three layers, later ones winning:
//!
//! 1. A TOML file (`--config`), every key optional
//! 2. Environment variables
//! 3. Command-line flags
//!
//! ```toml
//! [graph]
//! service = "analyzer"
//! host = "node-1"
//! indexed_keys = ["MAC", "IPV4"]
//!
//! [storage]
//! path = "topology.redb"
//! mode = "default"          # cache_only | persistent_only | default
//!
//! [server]
//! host = "127.0.0.1"
//! port = 8082
//! request_timeout_ms = 5000
//! rate_limit = 100          # requests per second, 0 disables
//! cors_origins = ["http://localhost:3000"]   # ["*"] allows any origin
//! ```
//!
//! ## Environment
//!
//! - `TOPOSTORE_DB`: storage path
//! - `TOPOSTORE_MODE`: cache mode
//! - `TOPOSTORE_RATE_LIMIT`: requests per second
//! - `TOPOSTORE_CORS_ORIGINS`: comma-separated origins, replacing `cors_origins`
//!
//! `TOPOSTORE_API_KEY` is a secret and is read by the HTTP layer at startup.
//! It is never part of this structure.

use axum::http::HeaderValue;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use topostore_core::primitives::DEFAULT_SERVICE;
use topostore_core::{CacheMode, GraphConfig, TopologyError};

/// Maximum accepted size of a configuration file (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

/// `cors_origins` entry that admits every origin.
pub const ANY_ORIGIN: &str = "*";

const LOCAL_ORIGINS: [&str; 4] = [
    "http://localhost:3000",
    "http://localhost:8082",
    "http://127.0.0.1:3000",
    "http://127.0.0.1:8082",
];

// =============================================================================
// SECTIONS
// =============================================================================

/// Identity of this process and the index layout.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GraphSection {
    /// Service type stamped into every origin.
    pub service: String,
    /// Host name stamped on locally created entities.
    pub host: String,
    /// Metadata keys with a secondary index in memory.
    pub indexed_keys: Vec<String>,
}

impl Default for GraphSection {
    fn default() -> Self {
        Self {
            service: DEFAULT_SERVICE.to_string(),
            host: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            indexed_keys: vec!["MAC".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageSection {
    pub path: PathBuf,
    pub mode: CacheMode,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("topology.redb"),
            mode: CacheMode::Default,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    /// Deadline for one core call made on behalf of a request.
    pub request_timeout_ms: u64,
    /// Requests per second; `0` turns the limiter off.
    pub rate_limit: u32,
    /// Browser origins allowed to call the API. Empty allows none.
    pub cors_origins: Vec<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8082,
            request_timeout_ms: 5000,
            rate_limit: 100,
            cors_origins: LOCAL_ORIGINS.iter().map(|o| o.to_string()).collect(),
        }
    }
}

impl ServerSection {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Every origin must be `*` or a value usable in an
    /// `Access-Control-Allow-Origin` header.
    pub fn validate(&self) -> Result<(), TopologyError> {
        for origin in &self.cors_origins {
            if origin != ANY_ORIGIN && HeaderValue::from_str(origin).is_err() {
                return Err(TopologyError::Config(format!(
                    "invalid CORS origin '{}'",
                    origin
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// CONFIG
// =============================================================================

/// Complete application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub graph: GraphSection,
    pub storage: StorageSection,
    pub server: ServerSection,
}

impl Config {
    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, TopologyError> {
        toml::from_str(content).map_err(|e| TopologyError::Config(e.to_string()))
    }

    /// Read `path` (or start from defaults when `None`) and apply the
    /// process environment on top.
    pub fn load(path: Option<&Path>) -> Result<Self, TopologyError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.server.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, TopologyError> {
        let metadata = std::fs::metadata(path).map_err(|e| {
            TopologyError::Io(format!("Cannot read config '{}': {}", path.display(), e))
        })?;
        if metadata.len() > MAX_CONFIG_FILE_SIZE {
            return Err(TopologyError::Config(format!(
                "Config file size {} bytes exceeds maximum allowed {} bytes",
                metadata.len(),
                MAX_CONFIG_FILE_SIZE
            )));
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            TopologyError::Io(format!("Cannot read config '{}': {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Apply `TOPOSTORE_*` overrides read through `lookup`.
    ///
    /// Empty values are ignored. A value that does not parse is an error
    /// rather than a silent fallback.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), TopologyError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = var("TOPOSTORE_DB") {
            self.storage.path = PathBuf::from(path);
        }
        if let Some(mode) = var("TOPOSTORE_MODE") {
            self.storage.mode = mode.parse()?;
        }
        if let Some(limit) = var("TOPOSTORE_RATE_LIMIT") {
            self.server.rate_limit = limit.trim().parse().map_err(|e| {
                TopologyError::Config(format!("TOPOSTORE_RATE_LIMIT '{}': {}", limit, e))
            })?;
        }
        if let Some(origins) = var("TOPOSTORE_CORS_ORIGINS") {
            self.server.cors_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(str::to_string)
                .collect();
        }
        Ok(())
    }

    /// Identity handed to the graph façade.
    #[must_use]
    pub fn graph_config(&self) -> GraphConfig {
        GraphConfig::new(self.graph.service.clone(), self.graph.host.clone())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_document_yields_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.storage, StorageSection::default());
        assert_eq!(config.server, ServerSection::default());
        assert_eq!(config.graph.service, DEFAULT_SERVICE);
    }

    #[test]
    fn sections_are_parsed() {
        let config = Config::from_toml_str(
            r#"
            [graph]
            service = "analyzer"
            host = "node-1"
            indexed_keys = ["MAC", "IPV4"]

            [storage]
            path = "/var/lib/topostore/graph.redb"
            mode = "persistent_only"

            [server]
            port = 9000
            request_timeout_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.graph.service, "analyzer");
        assert_eq!(config.graph.indexed_keys, vec!["MAC", "IPV4"]);
        assert_eq!(config.storage.mode, CacheMode::PersistentOnly);
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.request_timeout(), Duration::from_millis(250));
        assert_eq!(config.graph_config().origin().to_string(), "analyzer.node-1");
    }

    #[test]
    fn unknown_keys_and_modes_are_rejected() {
        assert!(matches!(
            Config::from_toml_str("[storage]\nbogus = 1"),
            Err(TopologyError::Config(_))
        ));
        assert!(matches!(
            Config::from_toml_str("[storage]\nmode = \"sometimes\""),
            Err(TopologyError::Config(_))
        ));
    }

    #[test]
    fn environment_overrides_the_file() {
        let mut config = Config::from_toml_str("[server]\nrate_limit = 5").unwrap();
        config
            .apply_env(env(&[
                ("TOPOSTORE_DB", "/tmp/other.redb"),
                ("TOPOSTORE_MODE", "cache-only"),
                ("TOPOSTORE_RATE_LIMIT", "0"),
            ]))
            .unwrap();

        assert_eq!(config.storage.path, PathBuf::from("/tmp/other.redb"));
        assert_eq!(config.storage.mode, CacheMode::CacheOnly);
        assert_eq!(config.server.rate_limit, 0);
    }

    #[test]
    fn invalid_environment_values_fail() {
        let mut config = Config::default();
        assert!(matches!(
            config.apply_env(env(&[("TOPOSTORE_MODE", "sometimes")])),
            Err(TopologyError::InvalidMode(_))
        ));
        assert!(matches!(
            config.apply_env(env(&[("TOPOSTORE_RATE_LIMIT", "fast")])),
            Err(TopologyError::Config(_))
        ));
    }

    #[test]
    fn cors_origins_come_from_file_then_environment() {
        assert_eq!(Config::default().server.cors_origins.len(), 4);

        let mut config =
            Config::from_toml_str("[server]\ncors_origins = [\"https://ops.example\"]").unwrap();
        assert_eq!(config.server.cors_origins, vec!["https://ops.example"]);

        config
            .apply_env(env(&[(
                "TOPOSTORE_CORS_ORIGINS",
                "https://a.example, ,https://b.example",
            )]))
            .unwrap();
        assert_eq!(
            config.server.cors_origins,
            vec!["https://a.example", "https://b.example"]
        );
        config.server.validate().unwrap();
    }

    #[test]
    fn unusable_cors_origin_is_rejected() {
        let mut config = Config::default();
        config.server.cors_origins = vec![ANY_ORIGIN.to_string()];
        config.server.validate().unwrap();

        config.server.cors_origins = vec!["https://ok.example".to_string(), "bad\norigin".to_string()];
        assert!(matches!(
            config.server.validate(),
            Err(TopologyError::Config(_))
        ));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(Some(&dir.path().join("absent.toml")));
        assert!(matches!(result, Err(TopologyError::Io(_))));
    }
}
