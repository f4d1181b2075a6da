//! Config - Already-parsed declarative configuration
//!
//! The configuration source hands the engine a mapping from resource address to
//! attribute expressions. On disk this is a JSON document:
//!
//! ```json
//! {
//!   "resources": {
//!     "dynamodb.table.users": { "attributes": { "name": "Users" } },
//!     "lambda.function.api": {
//!       "attributes": { "table": { "$ref": "dynamodb.table.users.name" } },
//!       "depends_on": ["iam.role_policy.access"]
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::graph::{GraphError, ResourceGraph};
use crate::resource::{AddressError, Resource, ResourceId, Value, ValueError};
use crate::schema::ValidationError;

/// Configuration error: nothing is applied when one of these is raised
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error("{address}: attribute '{attribute}': {source}")]
    Value {
        address: String,
        attribute: String,
        source: ValueError,
    },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("{}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("\n"))]
    Validation(Vec<ValidationError>),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfiguration {
    #[serde(default)]
    resources: BTreeMap<String, RawResource>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawResource {
    #[serde(default)]
    attributes: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    depends_on: Vec<String>,
}

/// Set of declared resources, before graph construction
#[derive(Debug, Clone, Default)]
pub struct Configuration {
    pub resources: Vec<Resource>,
}

impl Configuration {
    pub fn new(resources: Vec<Resource>) -> Self {
        Self { resources }
    }

    /// Read a configuration file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfiguration = serde_json::from_str(content)?;

        let mut resources = Vec::with_capacity(raw.resources.len());
        for (address, decl) in raw.resources {
            let id: ResourceId = address.parse()?;

            let mut resource = Resource::new(id.resource_type.clone(), id.name.clone());
            for (attribute, json) in decl.attributes {
                let value = Value::from_json(&json).map_err(|source| ConfigError::Value {
                    address: address.clone(),
                    attribute: attribute.clone(),
                    source,
                })?;
                resource.attributes.insert(attribute, value);
            }
            for dependency in decl.depends_on {
                resource.depends_on.push(dependency.parse()?);
            }
            resources.push(resource);
        }

        Ok(Self { resources })
    }

    /// Build the dependency graph for this configuration
    pub fn into_graph(self) -> Result<ResourceGraph, ConfigError> {
        Ok(ResourceGraph::build(self.resources)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "resources": {
            "dynamodb.table.users": {
                "attributes": { "name": "Users", "hash_key": "UserID" }
            },
            "lambda.function.api": {
                "attributes": {
                    "function_name": "user-api",
                    "environment": { "TABLE_NAME": { "$ref": "dynamodb.table.users.name" } }
                },
                "depends_on": ["dynamodb.table.users"]
            }
        }
    }"#;

    #[test]
    fn parse_resources_and_dependencies() {
        let config = Configuration::from_json_str(SAMPLE).unwrap();
        assert_eq!(config.resources.len(), 2);

        let function = config
            .resources
            .iter()
            .find(|r| r.id.resource_type == "lambda.function")
            .unwrap();
        assert_eq!(function.depends_on, vec![ResourceId::new("dynamodb.table", "users")]);
        assert!(matches!(
            function.attributes.get("environment"),
            Some(Value::Map(_))
        ));
    }

    #[test]
    fn unknown_top_level_field_is_rejected() {
        let result = Configuration::from_json_str(r#"{ "resource": {} }"#);
        assert!(matches!(result, Err(ConfigError::Json(_))));
    }

    #[test]
    fn bad_address_is_rejected() {
        let result = Configuration::from_json_str(r#"{ "resources": { "users": {} } }"#);
        assert!(matches!(result, Err(ConfigError::Address(_))));
    }

    #[test]
    fn bad_value_names_attribute() {
        let result = Configuration::from_json_str(
            r#"{ "resources": { "dynamodb.table.users": { "attributes": { "read_capacity": 1.5 } } } }"#,
        );
        match result {
            Err(ConfigError::Value { attribute, .. }) => assert_eq!(attribute, "read_capacity"),
            other => panic!("Expected Value error, got {:?}", other),
        }
    }

    #[test]
    fn from_path_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let graph = Configuration::from_path(file.path())
            .unwrap()
            .into_graph()
            .unwrap();
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn from_path_reports_missing_file() {
        let result = Configuration::from_path("/nonexistent/strata.json");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
