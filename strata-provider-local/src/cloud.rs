//! In-memory model of the simulated cloud account
//!
//! Objects are keyed by resource type and provider identifier. The whole
//! account serializes to a single JSON document so that it can outlive the
//! process.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// A stored object: the attributes it was created or last updated with, and
/// the values the service computed for it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredObject {
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
}

impl StoredObject {
    pub fn attribute_str(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(|v| v.as_str())
    }

    pub fn output_str(&self, name: &str) -> Option<&str> {
        self.outputs.get(name).and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cloud {
    /// Sequence for generated identifiers
    #[serde(default)]
    next_id: u64,
    #[serde(default)]
    objects: BTreeMap<String, BTreeMap<String, StoredObject>>,
}

#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error("Failed to read {path}: {message}")]
    Read { path: String, message: String },

    #[error("Failed to write {path}: {message}")]
    Write { path: String, message: String },
}

impl Cloud {
    /// Load a persisted account, or start empty if the file does not exist
    pub async fn load(path: &Path) -> Result<Self, CloudError> {
        let read_error = |message: String| CloudError::Read {
            path: path.display().to_string(),
            message,
        };
        match tokio::fs::read_to_string(path).await {
            Ok(content) => serde_json::from_str(&content).map_err(|e| read_error(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(read_error(e.to_string())),
        }
    }

    /// Write the account atomically (temp file + rename)
    pub async fn save(&self, path: &Path) -> Result<(), CloudError> {
        let write_error = |message: String| CloudError::Write {
            path: path.display().to_string(),
            message,
        };
        let content = serde_json::to_string_pretty(self).map_err(|e| write_error(e.to_string()))?;

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| write_error(e.to_string()))?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| write_error(e.to_string()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| write_error(e.to_string()))
    }

    /// Next generated identifier, e.g. `a1b2c3d`
    pub fn generate_id(&mut self) -> String {
        self.next_id += 1;
        // Spread sequential ids so they look like service-assigned ids
        format!("{:07x}", self.next_id.wrapping_mul(0x9E3779B1) & 0xfff_ffff)
    }

    pub fn get(&self, resource_type: &str, identifier: &str) -> Option<&StoredObject> {
        self.objects.get(resource_type)?.get(identifier)
    }

    pub fn get_mut(&mut self, resource_type: &str, identifier: &str) -> Option<&mut StoredObject> {
        self.objects.get_mut(resource_type)?.get_mut(identifier)
    }

    pub fn contains(&self, resource_type: &str, identifier: &str) -> bool {
        self.get(resource_type, identifier).is_some()
    }

    pub fn insert(&mut self, resource_type: &str, identifier: &str, object: StoredObject) {
        self.objects
            .entry(resource_type.to_string())
            .or_default()
            .insert(identifier.to_string(), object);
    }

    pub fn remove(&mut self, resource_type: &str, identifier: &str) -> Option<StoredObject> {
        let objects = self.objects.get_mut(resource_type)?;
        let removed = objects.remove(identifier);
        if objects.is_empty() {
            self.objects.remove(resource_type);
        }
        removed
    }

    /// Identifiers of objects of `resource_type` matching `predicate`
    pub fn find(
        &self,
        resource_type: &str,
        predicate: impl Fn(&StoredObject) -> bool,
    ) -> Vec<String> {
        self.objects
            .get(resource_type)
            .map(|objects| {
                objects
                    .iter()
                    .filter(|(_, object)| predicate(object))
                    .map(|(identifier, _)| identifier.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of stored objects of all types
    pub fn len(&self) -> usize {
        self.objects.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
