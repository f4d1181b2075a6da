//! State file structures for persisting infrastructure state
//!
//! The state file is forward compatible: fields this version does not know
//! about, at file or resource level, are kept and written back unchanged.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_core::graph::topological_sort;
use strata_core::resource::{ResourceId, State, Value};

use crate::backend::{BackendError, BackendResult};

/// The main state file structure that persists to the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateFile {
    /// State file format version
    pub version: u32,
    /// Monotonically increasing number for each state modification
    pub serial: u64,
    /// Unique identifier for this state lineage (prevents accidental overwrites)
    pub lineage: String,
    /// Version of Strata that last modified this state
    pub strata_version: String,
    /// All managed resources and their current state
    #[serde(default)]
    pub resources: Vec<ResourceState>,
    /// Fields written by newer versions
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl StateFile {
    /// Current state file format version
    pub const CURRENT_VERSION: u32 = 1;

    /// Create a new empty state file
    pub fn new() -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            serial: 0,
            lineage: uuid::Uuid::new_v4().to_string(),
            strata_version: env!("CARGO_PKG_VERSION").to_string(),
            resources: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }

    /// Parse and validate a serialized state file
    pub fn from_json(content: &str) -> BackendResult<Self> {
        let state: StateFile = serde_json::from_str(content)
            .map_err(|e| BackendError::invalid_state(format!("Failed to parse state file: {}", e)))?;
        state.validate()?;
        Ok(state)
    }

    pub fn to_json(&self) -> BackendResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| BackendError::Serialization(format!("Failed to serialize state: {}", e)))
    }

    /// Increment serial and update strata version for a new state write
    pub fn increment_serial(&mut self) {
        self.serial += 1;
        self.strata_version = env!("CARGO_PKG_VERSION").to_string();
    }

    /// Find a resource by type and name
    pub fn find_resource(&self, resource_type: &str, name: &str) -> Option<&ResourceState> {
        self.resources
            .iter()
            .find(|r| r.resource_type == resource_type && r.name == name)
    }

    /// Find a resource mutably by type and name
    pub fn find_resource_mut(
        &mut self,
        resource_type: &str,
        name: &str,
    ) -> Option<&mut ResourceState> {
        self.resources
            .iter_mut()
            .find(|r| r.resource_type == resource_type && r.name == name)
    }

    /// Add or update a resource in the state
    pub fn upsert_resource(&mut self, resource: ResourceState) {
        if let Some(existing) = self.find_resource_mut(&resource.resource_type, &resource.name) {
            *existing = resource;
        } else {
            self.resources.push(resource);
        }
    }

    /// Remove a resource from the state
    pub fn remove_resource(&mut self, resource_type: &str, name: &str) -> Option<ResourceState> {
        let pos = self
            .resources
            .iter()
            .position(|r| r.resource_type == resource_type && r.name == name)?;
        Some(self.resources.remove(pos))
    }

    /// Keep resources sorted by address so rewrites produce stable files
    pub fn sort_resources(&mut self) {
        self.resources
            .sort_by(|a, b| (&a.resource_type, &a.name).cmp(&(&b.resource_type, &b.name)));
    }

    /// Check that the file can be used as-is; never repairs anything
    pub fn validate(&self) -> BackendResult<()> {
        self.states().map(|_| ())
    }

    /// Recorded states keyed by resource, after validation.
    ///
    /// Rejects files from a newer format version, duplicate resources,
    /// unreadable values and dependency cycles between records.
    pub fn states(&self) -> BackendResult<HashMap<ResourceId, State>> {
        if self.version > Self::CURRENT_VERSION {
            return Err(BackendError::invalid_state(format!(
                "State file version {} is newer than supported version {}",
                self.version,
                Self::CURRENT_VERSION
            )));
        }

        let mut states = HashMap::with_capacity(self.resources.len());
        for resource in &self.resources {
            let state = resource.to_state()?;
            if states.insert(state.id.clone(), state).is_some() {
                return Err(BackendError::invalid_state(format!(
                    "Resource {} is recorded more than once",
                    resource.id()
                )));
            }
        }

        let edges: BTreeMap<ResourceId, BTreeSet<ResourceId>> = states
            .values()
            .map(|s| (s.id.clone(), s.dependencies.iter().cloned().collect()))
            .collect();
        if let Err(path) = topological_sort(&edges) {
            let path: Vec<String> = path.iter().map(|id| id.to_string()).collect();
            return Err(BackendError::invalid_state(format!(
                "Recorded dependencies form a cycle: {}",
                path.join(" -> ")
            )));
        }

        Ok(states)
    }

    /// Addresses of resources marked as protected from deletion
    pub fn protected(&self) -> BTreeSet<ResourceId> {
        self.resources
            .iter()
            .filter(|r| r.protected)
            .map(ResourceState::id)
            .collect()
    }
}

impl Default for StateFile {
    fn default() -> Self {
        Self::new()
    }
}

/// State of a single managed resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    /// Resource type (e.g., "dynamodb.table", "lambda.function")
    pub resource_type: String,
    /// Logical resource name from the configuration
    pub name: String,
    /// Provider name (e.g., "local")
    pub provider: String,
    /// Provider-assigned identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    /// Applied input attributes as JSON values
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
    /// Attributes computed by the provider
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
    /// Addresses of the resources this one depended on when applied
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Whether this resource is protected from deletion
    #[serde(default)]
    pub protected: bool,
    /// Fields written by newer versions
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ResourceState {
    /// Create a new resource state
    pub fn new(
        resource_type: impl Into<String>,
        name: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            provider: provider.into(),
            identifier: None,
            attributes: BTreeMap::new(),
            outputs: BTreeMap::new(),
            dependencies: Vec::new(),
            updated_at: None,
            protected: false,
            extra: serde_json::Map::new(),
        }
    }

    /// Persisted form of an applied state
    pub fn from_state(state: &State, provider: impl Into<String>) -> Self {
        let to_json = |map: &HashMap<String, Value>| {
            map.iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect::<BTreeMap<_, _>>()
        };
        let mut dependencies: Vec<String> = state.dependencies.iter().map(|d| d.to_string()).collect();
        dependencies.sort();

        Self {
            identifier: state.identifier.clone(),
            attributes: to_json(&state.attributes),
            outputs: to_json(&state.outputs),
            dependencies,
            updated_at: Some(Utc::now()),
            ..Self::new(&state.id.resource_type, &state.id.name, provider)
        }
    }

    pub fn id(&self) -> ResourceId {
        ResourceId::new(&self.resource_type, &self.name)
    }

    /// Core view of this record
    pub fn to_state(&self) -> BackendResult<State> {
        let id = self.id();
        let from_json = |map: &BTreeMap<String, serde_json::Value>| {
            map.iter()
                .map(|(k, v)| {
                    Value::from_json(v).map(|v| (k.clone(), v)).map_err(|e| {
                        BackendError::invalid_state(format!("{}: attribute '{}': {}", id, k, e))
                    })
                })
                .collect::<BackendResult<HashMap<_, _>>>()
        };
        let dependencies = self
            .dependencies
            .iter()
            .map(|d| {
                d.parse::<ResourceId>()
                    .map_err(|e| BackendError::invalid_state(format!("{}: {}", id, e)))
            })
            .collect::<BackendResult<Vec<_>>>()?;

        Ok(State {
            id: id.clone(),
            identifier: self.identifier.clone(),
            attributes: from_json(&self.attributes)?,
            outputs: from_json(&self.outputs)?,
            dependencies,
            exists: true,
        })
    }

    /// Set an attribute value
    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Mark this resource as protected
    pub fn with_protected(mut self, protected: bool) -> Self {
        self.protected = protected;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_state() -> State {
        State::existing(
            ResourceId::new("dynamodb.table", "users"),
            HashMap::from([
                ("name".to_string(), Value::string("Users")),
                ("read_capacity".to_string(), Value::Int(5)),
            ]),
        )
        .with_identifier("Users")
        .with_output("arn", Value::string("arn:local:dynamodb:table/Users"))
    }

    #[test]
    fn test_state_file_new() {
        let state = StateFile::new();
        assert_eq!(state.version, StateFile::CURRENT_VERSION);
        assert_eq!(state.serial, 0);
        assert!(!state.lineage.is_empty());
        assert!(state.resources.is_empty());
    }

    #[test]
    fn test_state_file_increment_serial() {
        let mut state = StateFile::new();
        state.increment_serial();
        state.increment_serial();
        assert_eq!(state.serial, 2);
    }

    #[test]
    fn test_state_file_upsert_and_remove() {
        let mut state = StateFile::new();
        state.upsert_resource(
            ResourceState::new("dynamodb.table", "users", "local")
                .with_attribute("name", serde_json::json!("Users")),
        );
        state.upsert_resource(
            ResourceState::new("dynamodb.table", "users", "local")
                .with_attribute("name", serde_json::json!("People")),
        );
        assert_eq!(state.resources.len(), 1);
        assert_eq!(
            state.resources[0].attributes.get("name"),
            Some(&serde_json::json!("People"))
        );

        assert!(state.remove_resource("dynamodb.table", "users").is_some());
        assert!(state.remove_resource("dynamodb.table", "users").is_none());
    }

    #[test]
    fn test_resource_state_conversion() {
        let function = ResourceId::new("lambda.function", "api");
        let state = table_state().with_dependencies(vec![function.clone()]);
        let record = ResourceState::from_state(&state, "local");

        assert_eq!(record.provider, "local");
        assert_eq!(record.dependencies, vec!["lambda.function.api".to_string()]);
        assert!(record.updated_at.is_some());
        assert_eq!(record.to_state().unwrap(), state);
    }

    #[test]
    fn test_unknown_fields_survive_rewrite() {
        let content = r#"{
            "version": 1,
            "serial": 7,
            "lineage": "abc",
            "strata_version": "9.9.9",
            "workspace": { "owner": "platform" },
            "resources": [
                {
                    "resource_type": "dynamodb.table",
                    "name": "users",
                    "provider": "local",
                    "identifier": "Users",
                    "attributes": { "name": "Users" },
                    "sensitive_attributes": ["name"]
                }
            ]
        }"#;

        let state = StateFile::from_json(content).unwrap();
        assert_eq!(state.extra["workspace"], serde_json::json!({ "owner": "platform" }));

        let rewritten = StateFile::from_json(&state.to_json().unwrap()).unwrap();
        assert_eq!(rewritten, state);
        assert_eq!(
            rewritten.resources[0].extra["sensitive_attributes"],
            serde_json::json!(["name"])
        );
    }

    #[test]
    fn test_newer_version_is_rejected() {
        let mut state = StateFile::new();
        state.version = StateFile::CURRENT_VERSION + 1;
        let err = StateFile::from_json(&state.to_json().unwrap()).unwrap_err();
        assert!(matches!(err, BackendError::InvalidState(_)));
    }

    #[test]
    fn test_malformed_content_is_invalid_state() {
        let err = StateFile::from_json("{ not json").unwrap_err();
        assert!(matches!(err, BackendError::InvalidState(_)));
    }

    #[test]
    fn test_duplicate_resources_are_rejected() {
        let mut state = StateFile::new();
        let record = ResourceState::from_state(&table_state(), "local");
        state.resources.push(record.clone());
        state.resources.push(record);

        let err = state.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid state file: Resource dynamodb.table.users is recorded more than once"
        );
    }

    #[test]
    fn test_dependency_cycle_is_rejected() {
        let a = ResourceId::new("node", "a");
        let b = ResourceId::new("node", "b");
        let mut state = StateFile::new();
        state.upsert_resource(ResourceState::from_state(
            &State::existing(a.clone(), HashMap::new()).with_dependencies(vec![b.clone()]),
            "local",
        ));
        state.upsert_resource(ResourceState::from_state(
            &State::existing(b, HashMap::new()).with_dependencies(vec![a]),
            "local",
        ));

        assert!(matches!(state.validate(), Err(BackendError::InvalidState(_))));
    }

    #[test]
    fn test_null_attribute_is_rejected() {
        let mut state = StateFile::new();
        state.upsert_resource(
            ResourceState::new("dynamodb.table", "users", "local")
                .with_attribute("name", serde_json::Value::Null),
        );
        assert!(matches!(state.validate(), Err(BackendError::InvalidState(_))));
    }

    #[test]
    fn test_protected_resources() {
        let mut state = StateFile::new();
        state.upsert_resource(ResourceState::new("dynamodb.table", "users", "local").with_protected(true));
        state.upsert_resource(ResourceState::new("iam.role", "exec", "local"));
        assert_eq!(
            state.protected(),
            BTreeSet::from([ResourceId::new("dynamodb.table", "users")])
        );
    }
}
