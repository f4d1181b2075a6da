//! Resource - Representing resources and their state

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

/// Unique identifier for a resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    /// Resource type (e.g., "dynamodb.table", "lambda.function")
    pub resource_type: String,
    /// Logical name given in the configuration
    pub name: String,
}

impl ResourceId {
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }

    /// Address form `<type>.<name>`
    pub fn address(&self) -> String {
        format!("{}.{}", self.resource_type, self.name)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)
    }
}

/// Malformed resource address
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Invalid resource address '{0}': expected <type>.<name>")]
pub struct AddressError(pub String);

fn is_valid_segment(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl FromStr for ResourceId {
    type Err = AddressError;

    /// Parse `<type>.<name>`. The type may contain dots, the name may not.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (resource_type, name) = s.rsplit_once('.').ok_or_else(|| AddressError(s.into()))?;
        if !is_valid_segment(name) || !resource_type.split('.').all(is_valid_segment) {
            return Err(AddressError(s.to_string()));
        }
        Ok(Self::new(resource_type, name))
    }
}

/// Attribute value of a resource
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Int(i64),
    Bool(bool),
    List(Vec<Value>),
    Map(HashMap<String, Value>),
    /// Reference to another resource's attribute
    Ref { target: ResourceId, attribute: String },
    /// String parts joined together once every part is resolved
    Concat(Vec<Value>),
    /// Value that will only be known after apply
    Unknown,
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn reference(target: ResourceId, attribute: impl Into<String>) -> Self {
        Value::Ref {
            target,
            attribute: attribute.into(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Collect every resource this value refers to
    pub fn collect_references<'a>(&'a self, refs: &mut BTreeSet<&'a ResourceId>) {
        match self {
            Value::Ref { target, .. } => {
                refs.insert(target);
            }
            Value::List(items) | Value::Concat(items) => {
                for item in items {
                    item.collect_references(refs);
                }
            }
            Value::Map(map) => {
                for v in map.values() {
                    v.collect_references(refs);
                }
            }
            _ => {}
        }
    }

    /// True if the value contains neither references nor unknowns
    pub fn is_known(&self) -> bool {
        match self {
            Value::Ref { .. } | Value::Unknown | Value::Concat(_) => false,
            Value::List(items) => items.iter().all(Value::is_known),
            Value::Map(map) => map.values().all(Value::is_known),
            _ => true,
        }
    }

    fn contains_unknown(&self) -> bool {
        match self {
            Value::Unknown => true,
            Value::List(items) | Value::Concat(items) => items.iter().any(Value::contains_unknown),
            Value::Map(map) => map.values().any(Value::contains_unknown),
            _ => false,
        }
    }

    /// Replace references using `lookup`.
    ///
    /// A `Concat` with any unknown part collapses to `Unknown`.
    pub fn resolve<F>(&self, lookup: &F) -> Result<Value, ResolveError>
    where
        F: Fn(&ResourceId, &str) -> Option<Value>,
    {
        match self {
            Value::Ref { target, attribute } => {
                lookup(target, attribute).ok_or_else(|| ResolveError::MissingAttribute {
                    target: target.clone(),
                    attribute: attribute.clone(),
                })
            }
            Value::List(items) => Ok(Value::List(
                items
                    .iter()
                    .map(|v| v.resolve(lookup))
                    .collect::<Result<_, _>>()?,
            )),
            Value::Map(map) => Ok(Value::Map(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), v.resolve(lookup)?)))
                    .collect::<Result<_, ResolveError>>()?,
            )),
            Value::Concat(parts) => {
                let resolved: Vec<Value> = parts
                    .iter()
                    .map(|v| v.resolve(lookup))
                    .collect::<Result<_, _>>()?;
                if resolved.iter().any(Value::contains_unknown) {
                    return Ok(Value::Unknown);
                }
                let mut joined = String::new();
                for part in &resolved {
                    match part {
                        Value::String(s) => joined.push_str(s),
                        Value::Int(n) => joined.push_str(&n.to_string()),
                        Value::Bool(b) => joined.push_str(&b.to_string()),
                        other => return Err(ResolveError::NotConcatenable(other.type_name())),
                    }
                }
                Ok(Value::String(joined))
            }
            other => Ok(other.clone()),
        }
    }

    pub(crate) fn type_name(&self) -> String {
        match self {
            Value::String(_) => "String".to_string(),
            Value::Int(_) => "Int".to_string(),
            Value::Bool(_) => "Bool".to_string(),
            Value::List(_) => "List".to_string(),
            Value::Map(_) => "Map".to_string(),
            Value::Ref { target, attribute } => format!("Ref({}.{})", target, attribute),
            Value::Concat(_) => "Concat".to_string(),
            Value::Unknown => "Unknown".to_string(),
        }
    }

    /// Encode as JSON. References and concatenations use the `$ref` / `$concat`
    /// object forms understood by [`Value::from_json`].
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Int(n) => serde_json::Value::Number((*n).into()),
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => {
                let obj: serde_json::Map<_, _> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect();
                serde_json::Value::Object(obj)
            }
            Value::Ref { target, attribute } => {
                serde_json::json!({ "$ref": format!("{}.{}", target, attribute) })
            }
            Value::Concat(parts) => {
                serde_json::json!({ "$concat": parts.iter().map(Value::to_json).collect::<Vec<_>>() })
            }
            Value::Unknown => serde_json::Value::Null,
        }
    }

    /// Decode from JSON.
    ///
    /// `{"$ref": "<type>.<name>.<attribute>"}` becomes a [`Value::Ref`] and
    /// `{"$concat": [...]}` a [`Value::Concat`].
    pub fn from_json(json: &serde_json::Value) -> Result<Value, ValueError> {
        match json {
            serde_json::Value::String(s) => Ok(Value::String(s.clone())),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Value::Int)
                .ok_or_else(|| ValueError::UnsupportedNumber(n.to_string())),
            serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
            serde_json::Value::Array(items) => Ok(Value::List(
                items.iter().map(Value::from_json).collect::<Result<_, _>>()?,
            )),
            serde_json::Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(reference) = map.get("$ref") {
                        return parse_reference(reference);
                    }
                    if let Some(parts) = map.get("$concat") {
                        let serde_json::Value::Array(parts) = parts else {
                            return Err(ValueError::InvalidConcat);
                        };
                        return Ok(Value::Concat(
                            parts.iter().map(Value::from_json).collect::<Result<_, _>>()?,
                        ));
                    }
                }
                Ok(Value::Map(
                    map.iter()
                        .map(|(k, v)| Ok((k.clone(), Value::from_json(v)?)))
                        .collect::<Result<_, ValueError>>()?,
                ))
            }
            serde_json::Value::Null => Err(ValueError::Null),
        }
    }
}

fn parse_reference(reference: &serde_json::Value) -> Result<Value, ValueError> {
    let serde_json::Value::String(path) = reference else {
        return Err(ValueError::InvalidReference(reference.to_string()));
    };
    let (address, attribute) = path
        .rsplit_once('.')
        .ok_or_else(|| ValueError::InvalidReference(path.clone()))?;
    if attribute.is_empty() {
        return Err(ValueError::InvalidReference(path.clone()));
    }
    let target: ResourceId = address
        .parse()
        .map_err(|_| ValueError::InvalidReference(path.clone()))?;
    Ok(Value::reference(target, attribute))
}

/// Error decoding a [`Value`] from JSON
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValueError {
    #[error("null is not a supported value")]
    Null,

    #[error("Unsupported number '{0}': only integers are allowed")]
    UnsupportedNumber(String),

    #[error("Invalid reference '{0}': expected <type>.<name>.<attribute>")]
    InvalidReference(String),

    #[error("$concat expects an array")]
    InvalidConcat,
}

/// Error resolving references inside a [`Value`]
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResolveError {
    #[error("{target} has no attribute '{attribute}'")]
    MissingAttribute {
        target: ResourceId,
        attribute: String,
    },

    #[error("Cannot concatenate a {0} value")]
    NotConcatenable(String),
}

/// Desired state declared in configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub id: ResourceId,
    pub attributes: HashMap<String, Value>,
    /// Explicit dependencies in addition to those implied by references
    pub depends_on: Vec<ResourceId>,
}

impl Resource {
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: ResourceId::new(resource_type, name),
            attributes: HashMap::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn with_dependency(mut self, id: ResourceId) -> Self {
        self.depends_on.push(id);
        self
    }

    /// All resources this one depends on, explicit and implicit
    pub fn dependencies(&self) -> BTreeSet<ResourceId> {
        let mut refs = BTreeSet::new();
        for value in self.attributes.values() {
            value.collect_references(&mut refs);
        }
        refs.into_iter()
            .cloned()
            .chain(self.depends_on.iter().cloned())
            .collect()
    }

    /// Resolve every attribute, keeping the id and dependencies
    pub fn resolve<F>(&self, lookup: &F) -> Result<Resource, ResolveError>
    where
        F: Fn(&ResourceId, &str) -> Option<Value>,
    {
        let attributes = self
            .attributes
            .iter()
            .map(|(k, v)| Ok((k.clone(), v.resolve(lookup)?)))
            .collect::<Result<_, ResolveError>>()?;
        Ok(Resource {
            id: self.id.clone(),
            attributes,
            depends_on: self.depends_on.clone(),
        })
    }
}

/// Last-applied state of a resource
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    pub id: ResourceId,
    /// Provider-assigned identifier (e.g., table name, API id)
    pub identifier: Option<String>,
    /// Applied input attributes
    pub attributes: HashMap<String, Value>,
    /// Attributes computed by the provider (e.g., arn)
    pub outputs: HashMap<String, Value>,
    /// Dependencies at the time the resource was applied
    pub dependencies: Vec<ResourceId>,
    /// Whether this state exists
    pub exists: bool,
}

impl State {
    pub fn not_found(id: ResourceId) -> Self {
        Self {
            id,
            identifier: None,
            attributes: HashMap::new(),
            outputs: HashMap::new(),
            dependencies: Vec::new(),
            exists: false,
        }
    }

    pub fn existing(id: ResourceId, attributes: HashMap<String, Value>) -> Self {
        Self {
            id,
            identifier: None,
            attributes,
            outputs: HashMap::new(),
            dependencies: Vec::new(),
            exists: true,
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn with_output(mut self, key: impl Into<String>, value: Value) -> Self {
        self.outputs.insert(key.into(), value);
        self
    }

    pub fn with_dependencies(mut self, dependencies: impl IntoIterator<Item = ResourceId>) -> Self {
        self.dependencies = dependencies.into_iter().collect();
        self
    }

    /// Look up an attribute for reference resolution.
    ///
    /// `id` resolves to the provider identifier, then inputs, then outputs.
    pub fn attribute(&self, name: &str) -> Option<Value> {
        if name == "id"
            && let Some(identifier) = &self.identifier
        {
            return Some(Value::String(identifier.clone()));
        }
        self.attributes
            .get(name)
            .or_else(|| self.outputs.get(name))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_address_with_dotted_type() {
        let id: ResourceId = "dynamodb.table.users".parse().unwrap();
        assert_eq!(id.resource_type, "dynamodb.table");
        assert_eq!(id.name, "users");
        assert_eq!(id.to_string(), "dynamodb.table.users");
    }

    #[test]
    fn reject_malformed_address() {
        assert!("users".parse::<ResourceId>().is_err());
        assert!("table.".parse::<ResourceId>().is_err());
        assert!("table..users".parse::<ResourceId>().is_err());
        assert!("table.us ers".parse::<ResourceId>().is_err());
    }

    #[test]
    fn from_json_reads_ref_and_concat() {
        let json = serde_json::json!({
            "$concat": [{ "$ref": "apigateway.api.http.execution_arn" }, "/*/*"]
        });
        let value = Value::from_json(&json).unwrap();
        assert_eq!(
            value,
            Value::Concat(vec![
                Value::reference(ResourceId::new("apigateway.api", "http"), "execution_arn"),
                Value::string("/*/*"),
            ])
        );
        assert_eq!(Value::from_json(&value.to_json()).unwrap(), value);
    }

    #[test]
    fn from_json_rejects_null_and_floats() {
        assert_eq!(Value::from_json(&serde_json::Value::Null), Err(ValueError::Null));
        assert!(matches!(
            Value::from_json(&serde_json::json!(1.5)),
            Err(ValueError::UnsupportedNumber(_))
        ));
    }

    #[test]
    fn object_with_other_keys_is_a_plain_map() {
        let json = serde_json::json!({ "$ref": "a.b.c", "other": 1 });
        assert!(matches!(Value::from_json(&json).unwrap(), Value::Map(_)));
    }

    #[test]
    fn dependencies_include_refs_and_explicit() {
        let table = ResourceId::new("dynamodb.table", "users");
        let role = ResourceId::new("iam.role", "exec");
        let resource = Resource::new("lambda.function", "api")
            .with_attribute("role", Value::reference(role.clone(), "arn"))
            .with_attribute(
                "environment",
                Value::Map(HashMap::from([(
                    "TABLE_NAME".to_string(),
                    Value::reference(table.clone(), "name"),
                )])),
            )
            .with_dependency(ResourceId::new("iam.role_policy", "access"));

        let deps = resource.dependencies();
        assert_eq!(deps.len(), 3);
        assert!(deps.contains(&table));
        assert!(deps.contains(&role));
    }

    #[test]
    fn resolve_concat_and_unknown() {
        let api = ResourceId::new("apigateway.api", "http");
        let value = Value::Concat(vec![
            Value::reference(api.clone(), "execution_arn"),
            Value::string("/*/*"),
        ]);

        let known = value
            .resolve(&|_, _| Some(Value::string("arn:api")))
            .unwrap();
        assert_eq!(known, Value::string("arn:api/*/*"));

        let unknown = value.resolve(&|_, _| Some(Value::Unknown)).unwrap();
        assert_eq!(unknown, Value::Unknown);

        let missing = value.resolve(&|_, _| None);
        assert!(matches!(missing, Err(ResolveError::MissingAttribute { .. })));
    }

    #[test]
    fn state_attribute_lookup_order() {
        let state = State::existing(
            ResourceId::new("dynamodb.table", "users"),
            HashMap::from([("name".to_string(), Value::string("Users"))]),
        )
        .with_identifier("Users")
        .with_output("arn", Value::string("arn:table/Users"));

        assert_eq!(state.attribute("id"), Some(Value::string("Users")));
        assert_eq!(state.attribute("name"), Some(Value::string("Users")));
        assert_eq!(state.attribute("arn"), Some(Value::string("arn:table/Users")));
        assert_eq!(state.attribute("missing"), None);
    }
}
