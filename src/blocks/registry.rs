// Block type registry
//
// Holds every available block type: built-ins compiled into the binary and
// user modules from the custom-blocks directory. A reload replaces the whole
// set of user entries atomically; per-file failures are logged and skipped.
// Nothing here ever deletes an unknown type from persisted configuration —
// instances of missing types are the scheduler's problem, not ours.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use super::builtin::{builtin_entries, BuiltinEntry};
use super::custom::CustomBlockDef;
use super::{Block, BlockDescriptor};
use crate::types::{Error, Result};

pub struct BlockRegistry {
    builtins: BTreeMap<String, BuiltinEntry>,
    custom: BTreeMap<String, Arc<CustomBlockDef>>,
}

/// Outcome of a custom-blocks directory scan.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub failed: Vec<String>,
}

impl BlockRegistry {
    /// Registry with only the built-in types.
    pub fn with_builtins() -> Self {
        let builtins = builtin_entries()
            .into_iter()
            .map(|e| (e.descriptor.type_key.clone(), e))
            .collect();
        Self {
            builtins,
            custom: BTreeMap::new(),
        }
    }

    /// Scan a directory of user modules, replacing all prior user entries.
    /// A file that fails to load is skipped; the scan continues.
    pub fn load_from_path(&mut self, dir: &Path) -> LoadReport {
        let mut report = LoadReport::default();
        let mut next: BTreeMap<String, Arc<CustomBlockDef>> = BTreeMap::new();

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "custom blocks directory not readable");
                self.custom = next;
                return report;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            match CustomBlockDef::load_file(&path) {
                Ok(def) => {
                    let key = def.descriptor.type_key.clone();
                    info!(file = %path.display(), type_key = %key, "loaded custom block");
                    report.loaded.push(key.clone());
                    next.insert(key, Arc::new(def));
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "skipping unloadable block module");
                    report.failed.push(path.display().to_string());
                }
            }
        }

        self.custom = next;
        report
    }

    /// All known type descriptors, built-ins first, sorted by numeric id.
    pub fn list_types(&self) -> Vec<BlockDescriptor> {
        let mut out: Vec<BlockDescriptor> = self
            .builtins
            .values()
            .map(|e| e.descriptor.clone())
            .chain(self.custom.values().map(|d| d.descriptor.clone()))
            .collect();
        out.sort_by_key(|d| d.id);
        out
    }

    pub fn resolve(&self, type_key: &str) -> Option<&BlockDescriptor> {
        self.builtins
            .get(type_key)
            .map(|e| &e.descriptor)
            .or_else(|| self.custom.get(type_key).map(|d| &d.descriptor))
    }

    /// Build a fresh block for the given type.
    pub fn instantiate(&self, type_key: &str) -> Result<(BlockDescriptor, Box<dyn Block>)> {
        if let Some(entry) = self.builtins.get(type_key) {
            return Ok((entry.descriptor.clone(), (entry.ctor)()));
        }
        if let Some(def) = self.custom.get(type_key) {
            return Ok((def.descriptor.clone(), def.instantiate()));
        }
        Err(Error::UnknownType(type_key.to_string()))
    }

    pub fn custom_type_keys(&self) -> Vec<String> {
        self.custom.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = BlockRegistry::with_builtins();
        for key in ["AndGate", "NotGate", "Timer", "Hysteresis", "MinMax"] {
            assert!(registry.resolve(key).is_some(), "{key} missing");
        }
        assert!(registry.resolve("Timer").unwrap().remanent);
        assert!(registry.resolve("DoesNotExist").is_none());
    }

    #[test]
    fn test_instantiate_unknown_type() {
        let registry = BlockRegistry::with_builtins();
        let err = match registry.instantiate("Sonos") {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert_eq!(err.kind(), "unknown-type");
    }

    #[test]
    fn test_load_from_path_isolates_failures() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("double.toml"),
            "id = 1\ntype = \"Double\"\nname = \"Double\"\n\
             [inputs.E1]\nname = \"V\"\ntype = \"real\"\n\
             [outputs.A1]\nname = \"R\"\ntype = \"real\"\nexpr = \"E1 * 2\"\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.toml"), "not really toml [").unwrap();
        std::fs::write(dir.path().join("ignored.txt"), "something else").unwrap();

        let mut registry = BlockRegistry::with_builtins();
        let report = registry.load_from_path(dir.path());
        assert_eq!(report.loaded, vec!["Double".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert!(registry.resolve("Double").is_some());

        // reload replaces prior user entries wholesale
        std::fs::remove_file(dir.path().join("double.toml")).unwrap();
        registry.load_from_path(dir.path());
        assert!(registry.resolve("Double").is_none());
        assert!(registry.resolve("AndGate").is_some());
    }
}
