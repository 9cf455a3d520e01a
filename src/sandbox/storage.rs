//! Per-script value storage behind `GM_getValue` and friends.
//!
//! Each script gets its own JSON file under the profile's `storage/`
//! directory. Values are cached in memory and written on every change.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::script::ScriptId;
use crate::store::FileSystem;

/// File name for a script's storage; ids may contain any character.
fn storage_file_name(id: &ScriptId) -> String {
    let safe: String = id
        .as_str()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect();
    format!("{}-{}.json", safe, &crate::hash::digest(id.as_str())[..8])
}

pub struct ScriptStorage {
    script_id: ScriptId,
    storage_path: PathBuf,
    fs: Arc<dyn FileSystem>,
    cache: BTreeMap<String, Value>,
    dirty: bool,
}

impl ScriptStorage {
    /// Open the storage of `script_id`, loading any existing values.
    ///
    /// Unreadable or corrupt files start out empty.
    pub fn new(script_id: &ScriptId, storage_dir: PathBuf, fs: Arc<dyn FileSystem>) -> Self {
        let storage_path = storage_dir.join(storage_file_name(script_id));

        let cache = match fs.read(&storage_path) {
            Ok(Some(contents)) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!(script = %script_id, "Discarding corrupt storage: {}", e);
                BTreeMap::new()
            }),
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                warn!(
                    script = %script_id,
                    path = %storage_path.display(),
                    "Failed to read storage: {}",
                    e
                );
                BTreeMap::new()
            }
        };

        Self {
            script_id: script_id.clone(),
            storage_path,
            fs,
            cache,
            dirty: false,
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.cache.get(key).cloned()
    }

    pub fn set(&mut self, key: &str, value: Value) -> Result<(), anyhow::Error> {
        self.cache.insert(key.to_string(), value);
        self.dirty = true;
        self.flush()
    }

    pub fn remove(&mut self, key: &str) -> Result<(), anyhow::Error> {
        if self.cache.remove(key).is_some() {
            self.dirty = true;
            self.flush()?;
        }
        Ok(())
    }

    /// Keys in sorted order.
    pub fn keys(&self) -> Vec<String> {
        self.cache.keys().cloned().collect()
    }

    pub fn flush(&mut self) -> Result<(), anyhow::Error> {
        if !self.dirty {
            return Ok(());
        }

        if let Some(parent) = self.storage_path.parent() {
            self.fs.create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to create storage directory for script '{}': {}",
                    self.script_id,
                    e
                )
            })?;
        }

        let contents = serde_json::to_string_pretty(&self.cache)?;
        self.fs.write(&self.storage_path, &contents).map_err(|e| {
            anyhow::anyhow!("Failed to write storage for script '{}': {}", self.script_id, e)
        })?;

        self.dirty = false;
        Ok(())
    }
}

impl Drop for ScriptStorage {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
