// Logic configuration file
//
// One JSON document holds pages, block instances (with their bindings and
// last values) and advisory editor positions. Loading is lenient: block
// entries are kept as raw JSON and parsed one by one, so a single bad entry
// or an unknown block type never takes the rest of the file down. Unknown
// fields ride along untouched and are written back on save.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::bus::Address;
use crate::types::Result;
use crate::value::Value;

/// Purely organisational grouping of blocks in the editor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Persisted form of one block instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockConfig {
    pub instance_id: String,
    pub block_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_id: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub input_values: BTreeMap<String, Value>,
    #[serde(default)]
    pub output_values: BTreeMap<String, Value>,
    #[serde(default)]
    pub input_bindings: BTreeMap<String, String>,
    #[serde(default)]
    pub output_bindings: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

/// The whole config document. Blocks stay raw until parsed individually.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogicConfig {
    #[serde(default)]
    pub pages: Vec<Page>,
    #[serde(default)]
    pub blocks: Vec<serde_json::Value>,
    #[serde(default)]
    pub positions: serde_json::Map<String, serde_json::Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl LogicConfig {
    /// Parse the raw block entries. Returns the parsed configs and the raw
    /// entries that did not even have the mandatory shape — those are
    /// preserved verbatim so a save never silently drops them.
    pub fn parse_blocks(&self) -> (Vec<BlockConfig>, Vec<serde_json::Value>) {
        let mut parsed = Vec::new();
        let mut unparseable = Vec::new();
        for raw in &self.blocks {
            match serde_json::from_value::<BlockConfig>(raw.clone()) {
                Ok(cfg) => parsed.push(cfg),
                Err(_) => unparseable.push(raw.clone()),
            }
        }
        (parsed, unparseable)
    }

    pub fn push_block(&mut self, cfg: &BlockConfig) {
        if let Ok(raw) = serde_json::to_value(cfg) {
            self.blocks.push(raw);
        }
    }
}

pub fn load_config(path: &Path) -> Result<LogicConfig> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(serde_json::from_str(&raw)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(LogicConfig::default()),
        Err(e) => Err(e.into()),
    }
}

/// Atomic write: temp file, fsync, rename.
pub fn save_config_atomic(path: &Path, config: &LogicConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(serde_json::to_string_pretty(config)?.as_bytes())?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// A self-contained backup document bundling all four artifacts plus the
/// custom block sources, so a restore on a fresh install needs nothing else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub addresses: Vec<Address>,
    pub logic: LogicConfig,
    #[serde(default)]
    pub remanent: BTreeMap<String, serde_json::Value>,
    /// filename -> module source
    #[serde(default)]
    pub custom_blocks: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_file_is_empty_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("logic_config.json")).unwrap();
        assert!(config.pages.is_empty());
        assert!(config.blocks.is_empty());
    }

    #[test]
    fn test_unknown_fields_preserved() {
        let raw = json!({
            "pages": [],
            "blocks": [{
                "instance_id": "b1",
                "block_type": "NotGate",
                "future_field": {"nested": true}
            }],
            "positions": {"b1": {"x": 10, "y": 20}},
            "ui_theme": "dark"
        });
        let config: LogicConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(config.extra.get("ui_theme"), Some(&json!("dark")));

        let (parsed, unparseable) = config.parse_blocks();
        assert_eq!(parsed.len(), 1);
        assert!(unparseable.is_empty());
        assert_eq!(parsed[0].extra.get("future_field"), Some(&json!({"nested": true})));

        // fields survive a re-serialize
        let round = serde_json::to_value(&parsed[0]).unwrap();
        assert_eq!(round.get("future_field"), Some(&json!({"nested": true})));
    }

    #[test]
    fn test_malformed_block_entry_is_preserved_not_dropped() {
        let config: LogicConfig = serde_json::from_value(json!({
            "blocks": [
                {"instance_id": "good", "block_type": "NotGate"},
                {"this_is": "not a block"}
            ]
        }))
        .unwrap();
        let (parsed, unparseable) = config.parse_blocks();
        assert_eq!(parsed.len(), 1);
        assert_eq!(unparseable.len(), 1);
    }

    #[test]
    fn test_atomic_save_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logic_config.json");
        let mut config = LogicConfig::default();
        config.pages.push(Page {
            id: "p1".into(),
            name: "Ground floor".into(),
            description: String::new(),
            extra: Default::default(),
        });
        save_config_atomic(&path, &config).unwrap();
        let reloaded = load_config(&path).unwrap();
        assert_eq!(reloaded.pages.len(), 1);
        assert!(!path.with_extension("json.tmp").exists());
    }
}
