// Remanent store
//
// One JSON map file `{ instance_id: state }` holding the opt-in state of
// remanent blocks, written atomically on every checkpoint and read once at
// startup. A snapshot that fails to parse is refused: the runtime starts
// without restored state and the file on disk stays as it was.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use tracing::{info, warn};

use crate::types::Result;

pub struct RemanentStore {
    path: PathBuf,
    entries: BTreeMap<String, serde_json::Value>,
}

impl RemanentStore {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<BTreeMap<String, serde_json::Value>>(&raw) {
                Ok(entries) => {
                    info!(path = %path.display(), count = entries.len(), "remanent snapshot loaded");
                    entries
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e,
                        "corrupt remanent snapshot refused, keeping file untouched");
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Self { path, entries }
    }

    pub fn restore(&self, instance_id: &str) -> Option<&serde_json::Value> {
        self.entries.get(instance_id)
    }

    pub fn store(&mut self, instance_id: &str, state: serde_json::Value) {
        self.entries.insert(instance_id.to_string(), state);
    }

    pub fn remove(&mut self, instance_id: &str) {
        self.entries.remove(instance_id);
    }

    pub fn entries(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.entries
    }

    pub fn replace_all(&mut self, entries: BTreeMap<String, serde_json::Value>) {
        self.entries = entries;
    }

    /// Write the snapshot file atomically: temp file, fsync, rename.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(serde_json::to_string_pretty(&self.entries)?.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
