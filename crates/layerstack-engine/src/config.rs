//! Layer configuration
//!
//! A layer can be described in JSON: which nodes exist, what they consume,
//! which are published, and which remote nodes are imported. Computations
//! are code, so they are bound by node name when the layer is built.
//!
//! ```json
//! {
//!   "name": "analysis",
//!   "nodes": [
//!     { "name": "sessions", "inputs": ["context"], "publish": true },
//!     { "name": "recommend", "inputs": ["sessions"], "plan": true }
//!   ],
//!   "imports": [
//!     { "name": "context", "remote": "http://127.0.0.1:2718", "staleness_threshold": 5 }
//!   ],
//!   "action_ledger": ".layerstack/actions.json"
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LayerError, Result};
use crate::registry::ImportBinding;

fn default_interval_ms() -> u64 {
    5_000
}

/// Configuration of a whole layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub imports: Vec<ImportConfig>,
    /// File the action ledger is persisted to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_ledger: Option<PathBuf>,
}

/// A locally computed node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    /// The node proposes actions
    #[serde(default)]
    pub plan: bool,
    #[serde(default)]
    pub publish: bool,
}

/// A node imported from another layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Local name of the import node
    pub name: String,
    /// Address of the remote layer
    pub remote: String,
    /// Name on the remote side; defaults to `name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_node: Option<String>,
    #[serde(default = "default_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staleness_threshold: Option<u32>,
    #[serde(default = "default_interval_ms")]
    pub request_timeout_ms: u64,
    /// Re-publish the imported value from this layer
    #[serde(default)]
    pub publish: bool,
}

impl ImportConfig {
    pub fn binding(&self) -> ImportBinding {
        let remote_node = self.remote_node.clone().unwrap_or_else(|| self.name.clone());
        let mut binding = ImportBinding::new(self.remote.clone(), remote_node)
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_request_timeout(Duration::from_millis(self.request_timeout_ms));
        if let Some(threshold) = self.staleness_threshold {
            binding = binding.with_staleness_threshold(threshold);
        }
        binding
    }
}

impl LayerConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        log::debug!("Loading layer config from {:?}", path);
        Self::from_json(&content)
    }

    /// Check the parts serde cannot
    ///
    /// Graph-level problems (unknown inputs, cycles, duplicates) are reported
    /// when the layer is built.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(LayerError::InvalidConfig("layer name is empty".into()));
        }
        for node in &self.nodes {
            if node.name.trim().is_empty() {
                return Err(LayerError::InvalidConfig("node with empty name".into()));
            }
        }
        for import in &self.imports {
            if import.remote.trim().is_empty() {
                return Err(LayerError::InvalidConfig(format!(
                    "import '{}' has no remote",
                    import.name
                )));
            }
            if import.poll_interval_ms == 0 {
                return Err(LayerError::InvalidConfig(format!(
                    "import '{}' has a zero poll interval",
                    import.name
                )));
            }
            if import.request_timeout_ms == 0 {
                return Err(LayerError::InvalidConfig(format!(
                    "import '{}' has a zero request timeout",
                    import.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ANALYSIS: &str = r#"{
        "name": "analysis",
        "nodes": [
            { "name": "sessions", "inputs": ["context"], "publish": true },
            { "name": "recommend", "inputs": ["sessions"], "plan": true }
        ],
        "imports": [
            { "name": "context", "remote": "http://127.0.0.1:2718", "staleness_threshold": 5 }
        ]
    }"#;

    #[test]
    fn test_parse_with_defaults() {
        let config = LayerConfig::from_json(ANALYSIS).unwrap();
        assert_eq!(config.nodes.len(), 2);
        assert!(config.nodes[1].plan);
        assert!(!config.nodes[1].publish);
        assert!(config.action_ledger.is_none());

        let binding = config.imports[0].binding();
        assert_eq!(binding.remote_node, "context");
        assert_eq!(binding.poll_interval, Duration::from_secs(5));
        assert_eq!(binding.staleness_threshold, Some(5));
    }

    #[test]
    fn test_rejects_zero_interval() {
        let json = r#"{
            "name": "l2",
            "imports": [{ "name": "ctx", "remote": "l1", "poll_interval_ms": 0 }]
        }"#;
        assert!(matches!(
            LayerConfig::from_json(json),
            Err(LayerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(matches!(
            LayerConfig::from_json("{ \"nodes\": [] }"),
            Err(LayerError::Serialization(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layer.json");
        std::fs::write(&path, ANALYSIS).unwrap();
        assert_eq!(LayerConfig::from_file(&path).unwrap().name, "analysis");
        assert!(matches!(
            LayerConfig::from_file(dir.path().join("missing.json")),
            Err(LayerError::Io(_))
        ));
    }
}
