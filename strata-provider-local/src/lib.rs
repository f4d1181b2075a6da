//! Strata Local Provider
//!
//! A simulated cloud account serving the resource types of a serverless API:
//! DynamoDB tables, Lambda functions and permissions, IAM roles and inline
//! policies, and API Gateway v2 APIs, integrations, routes and stages.
//!
//! The account lives in memory and can be persisted to a JSON file, so that
//! successive CLI runs see the same objects. Calls can be throttled to
//! exercise the engine's retry path.

pub mod cloud;
pub mod schemas;
pub mod validation;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use strata_core::provider::{
    BoxFuture, Provider, ProviderError, ProviderResult, ResourceType, UpdateOutcome,
};
use strata_core::resource::{Resource, ResourceId, State, Value};
use strata_core::schema::ResourceSchema;
use tokio::sync::Mutex;

use crate::cloud::{Cloud, CloudError, StoredObject};

/// A resource type served by the local provider
pub struct LocalResourceType {
    name: &'static str,
    schema: fn() -> ResourceSchema,
}

impl ResourceType for LocalResourceType {
    fn name(&self) -> &'static str {
        self.name
    }

    fn schema(&self) -> ResourceSchema {
        (self.schema)()
    }
}

const RESOURCE_TYPES: &[(&str, fn() -> ResourceSchema)] = &[
    ("dynamodb.table", schemas::dynamodb::table_schema),
    ("iam.role", schemas::iam::role_schema),
    ("iam.role_policy", schemas::iam::role_policy_schema),
    ("lambda.function", schemas::lambda::function_schema),
    ("lambda.permission", schemas::lambda::permission_schema),
    ("apigateway.api", schemas::apigateway::api_schema),
    ("apigateway.integration", schemas::apigateway::integration_schema),
    ("apigateway.route", schemas::apigateway::route_schema),
    ("apigateway.stage", schemas::apigateway::stage_schema),
];

/// Settings of the simulated account
#[derive(Debug, Clone)]
pub struct LocalProviderConfig {
    pub region: String,
    pub account_id: String,
    /// Every Nth call fails with a transient throttling error
    pub throttle_every: Option<u64>,
    /// Simulated per-call latency
    pub latency: Duration,
    /// JSON file the account is loaded from and saved to
    pub persist_path: Option<PathBuf>,
}

impl Default for LocalProviderConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            account_id: "000000000000".to_string(),
            throttle_every: None,
            latency: Duration::ZERO,
            persist_path: None,
        }
    }
}

/// Local Provider
pub struct LocalProvider {
    config: LocalProviderConfig,
    cloud: Mutex<Cloud>,
    calls: AtomicU64,
}

impl LocalProvider {
    /// Create an empty in-memory account
    pub fn new(config: LocalProviderConfig) -> Self {
        Self {
            config,
            cloud: Mutex::new(Cloud::default()),
            calls: AtomicU64::new(0),
        }
    }

    /// Open the account persisted at `config.persist_path`, if any
    pub async fn open(config: LocalProviderConfig) -> Result<Self, CloudError> {
        let cloud = match &config.persist_path {
            Some(path) => Cloud::load(path).await?,
            None => Cloud::default(),
        };
        log::debug!(
            "Opened local cloud with {} objects ({})",
            cloud.len(),
            config
                .persist_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "in memory".to_string())
        );
        Ok(Self {
            config,
            cloud: Mutex::new(cloud),
            calls: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &LocalProviderConfig {
        &self.config
    }

    /// Delete an object behind the engine's back
    pub async fn evict(&self, resource_type: &str, identifier: &str) -> bool {
        let mut cloud = self.cloud.lock().await;
        let removed = cloud.remove(resource_type, identifier).is_some();
        if removed {
            log::warn!("Evicted {} {} out of band", resource_type, identifier);
        }
        removed
    }

    /// Change an attribute of an object behind the engine's back
    pub async fn tamper(
        &self,
        resource_type: &str,
        identifier: &str,
        attribute: &str,
        value: Value,
    ) -> bool {
        let mut cloud = self.cloud.lock().await;
        match cloud.get_mut(resource_type, identifier) {
            Some(object) => {
                object.attributes.insert(attribute.to_string(), value.to_json());
                true
            }
            None => false,
        }
    }

    /// Number of objects in the account
    pub async fn object_count(&self) -> usize {
        self.cloud.lock().await.len()
    }

    /// Simulate latency and throttling before a call reaches the service
    async fn admit(&self, id: &ResourceId, operation: &str) -> ProviderResult<()> {
        if !self.config.latency.is_zero() {
            tokio::time::sleep(self.config.latency).await;
        }
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(every) = self.config.throttle_every
            && every > 0
            && call % every == 0
        {
            log::debug!("Throttling {} of {} (call {})", operation, id, call);
            return Err(ProviderError::transient(format!(
                "ThrottlingException: Rate exceeded for {}",
                operation
            ))
            .for_resource(id.clone()));
        }
        Ok(())
    }

    /// Persist `next`, then make it the live account. A failed write leaves
    /// the account unchanged.
    async fn persist(&self, cloud: &mut Cloud, next: Cloud, id: &ResourceId) -> ProviderResult<()> {
        if let Some(path) = &self.config.persist_path {
            next.save(path).await.map_err(|e| {
                ProviderError::transient("Failed to persist local cloud")
                    .for_resource(id.clone())
                    .with_cause(e)
            })?;
        }
        *cloud = next;
        Ok(())
    }

    fn arn(&self, service: &str, resource: &str) -> String {
        let region = if service == "iam" {
            ""
        } else {
            self.config.region.as_str()
        };
        format!(
            "arn:aws:{}:{}:{}:{}",
            service, region, self.config.account_id, resource
        )
    }

    fn api_endpoint(&self, api_id: &str) -> String {
        format!(
            "https://{}.execute-api.{}.amazonaws.com",
            api_id, self.config.region
        )
    }

    /// Check that objects this one points at exist
    fn check_references(
        &self,
        cloud: &Cloud,
        id: &ResourceId,
        attrs: &Attributes,
    ) -> ProviderResult<()> {
        let missing = |what: String| {
            Err(ProviderError::new(format!("ResourceNotFoundException: {} does not exist", what))
                .for_resource(id.clone()))
        };

        match id.resource_type.as_str() {
            "iam.role_policy" => {
                let role = attrs.required_str(id, "role")?;
                if !cloud.contains("iam.role", role) {
                    return missing(format!("role {}", role));
                }
            }
            "lambda.function" => {
                let role_arn = attrs.required_str(id, "role")?;
                if cloud
                    .find("iam.role", |o| o.output_str("arn") == Some(role_arn))
                    .is_empty()
                {
                    return missing(format!("role {}", role_arn));
                }
            }
            "lambda.permission" => {
                let function = attrs.required_str(id, "function_name")?;
                if find_function(cloud, function).is_none() {
                    return missing(format!("function {}", function));
                }
            }
            "apigateway.integration" | "apigateway.stage" => {
                let api_id = attrs.required_str(id, "api_id")?;
                if !cloud.contains("apigateway.api", api_id) {
                    return missing(format!("api {}", api_id));
                }
            }
            "apigateway.route" => {
                let api_id = attrs.required_str(id, "api_id")?;
                if !cloud.contains("apigateway.api", api_id) {
                    return missing(format!("api {}", api_id));
                }
                if let Some(target) = attrs.optional_str("target") {
                    let integration = target.trim_start_matches("integrations/");
                    if !cloud.contains("apigateway.integration", &format!("{}/{}", api_id, integration)) {
                        return missing(format!("integration {}", integration));
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Identifier and computed outputs for a new object
    fn provision(
        &self,
        cloud: &mut Cloud,
        id: &ResourceId,
        attrs: &Attributes,
    ) -> ProviderResult<(String, BTreeMap<String, serde_json::Value>)> {
        let mut outputs = BTreeMap::new();
        let identifier = match id.resource_type.as_str() {
            "dynamodb.table" => {
                let name = attrs.required_str(id, "name")?;
                outputs.insert("arn".into(), self.arn("dynamodb", &format!("table/{}", name)).into());
                name.to_string()
            }
            "iam.role" => {
                let name = attrs.required_str(id, "name")?;
                outputs.insert("arn".into(), self.arn("iam", &format!("role/{}", name)).into());
                name.to_string()
            }
            "iam.role_policy" => format!(
                "{}:{}",
                attrs.required_str(id, "role")?,
                attrs.required_str(id, "name")?
            ),
            "lambda.function" => {
                let name = attrs.required_str(id, "function_name")?;
                let arn = self.arn("lambda", &format!("function:{}", name));
                let invoke_arn = format!(
                    "arn:aws:apigateway:{}:lambda:path/2015-03-31/functions/{}/invocations",
                    self.config.region, arn
                );
                outputs.insert("arn".into(), arn.into());
                outputs.insert("invoke_arn".into(), invoke_arn.into());
                name.to_string()
            }
            "lambda.permission" => {
                let function = attrs.required_str(id, "function_name")?;
                let function = find_function(cloud, function).unwrap_or_else(|| function.to_string());
                format!("{}:{}", function, attrs.required_str(id, "statement_id")?)
            }
            "apigateway.api" => {
                let api_id = cloud.generate_id();
                outputs.insert("api_id".into(), api_id.clone().into());
                outputs.insert("api_endpoint".into(), self.api_endpoint(&api_id).into());
                outputs.insert("execution_arn".into(), self.arn("execute-api", &api_id).into());
                outputs.insert(
                    "arn".into(),
                    format!("arn:aws:apigateway:{}::/apis/{}", self.config.region, api_id).into(),
                );
                api_id
            }
            "apigateway.integration" => {
                let integration_id = cloud.generate_id();
                outputs.insert("integration_id".into(), integration_id.clone().into());
                format!("{}/{}", attrs.required_str(id, "api_id")?, integration_id)
            }
            "apigateway.route" => {
                let route_id = cloud.generate_id();
                outputs.insert("route_id".into(), route_id.clone().into());
                format!("{}/{}", attrs.required_str(id, "api_id")?, route_id)
            }
            "apigateway.stage" => {
                let api_id = attrs.required_str(id, "api_id")?;
                let stage = attrs.required_str(id, "name")?;
                let invoke_url = if stage == "$default" {
                    format!("{}/", self.api_endpoint(api_id))
                } else {
                    format!("{}/{}", self.api_endpoint(api_id), stage)
                };
                outputs.insert("invoke_url".into(), invoke_url.into());
                format!("{}/{}", api_id, stage)
            }
            other => {
                return Err(ProviderError::new(format!("Unsupported resource type: {}", other))
                    .for_resource(id.clone()));
            }
        };
        Ok((identifier, outputs))
    }

    /// Objects that must be gone before `identifier` can be deleted, and
    /// objects the service removes along with it
    fn dependents(
        &self,
        cloud: &Cloud,
        resource_type: &str,
        identifier: &str,
    ) -> (Vec<(String, String)>, Vec<(&'static str, String)>) {
        let mut blocking = Vec::new();
        let mut cascade = Vec::new();
        match resource_type {
            "iam.role" => {
                for policy in cloud.find("iam.role_policy", |o| o.attribute_str("role") == Some(identifier)) {
                    blocking.push(("iam.role_policy".to_string(), policy));
                }
            }
            "lambda.function" => {
                let prefix = format!("{}:", identifier);
                for permission in cloud.find("lambda.permission", |_| true) {
                    if permission.starts_with(&prefix) {
                        cascade.push(("lambda.permission", permission));
                    }
                }
            }
            "apigateway.api" => {
                let prefix = format!("{}/", identifier);
                for child in ["apigateway.integration", "apigateway.route", "apigateway.stage"] {
                    for object in cloud.find(child, |_| true) {
                        if object.starts_with(&prefix) {
                            cascade.push((child, object));
                        }
                    }
                }
            }
            _ => {}
        }
        (blocking, cascade)
    }

    async fn read_object(&self, id: &ResourceId, identifier: &str) -> ProviderResult<State> {
        self.admit(id, "read").await?;
        let cloud = self.cloud.lock().await;
        match cloud.get(&id.resource_type, identifier) {
            Some(object) => object_state(id, identifier, object),
            None => Ok(State::not_found(id.clone())),
        }
    }

    async fn create_object(&self, resource: &Resource) -> ProviderResult<State> {
        let id = &resource.id;
        self.admit(id, "create").await?;
        let attrs = Attributes::concrete(resource)?;
        validate(id, &attrs)?;

        let mut cloud = self.cloud.lock().await;
        self.check_references(&cloud, id, &attrs)?;
        let mut next = cloud.clone();
        let (identifier, outputs) = self.provision(&mut next, id, &attrs)?;
        if next.contains(&id.resource_type, &identifier) {
            return Err(ProviderError::new(format!(
                "ResourceConflictException: {} {} already exists",
                id.resource_type, identifier
            ))
            .for_resource(id.clone()));
        }

        let object = StoredObject {
            attributes: attrs.to_json(),
            outputs,
        };
        let state = object_state(id, &identifier, &object)?;
        next.insert(&id.resource_type, &identifier, object);
        self.persist(&mut cloud, next, id).await?;
        log::info!("Created {} {}", id.resource_type, identifier);
        Ok(state)
    }

    async fn update_object(
        &self,
        id: &ResourceId,
        identifier: &str,
        to: &Resource,
    ) -> ProviderResult<UpdateOutcome> {
        self.admit(id, "update").await?;
        let attrs = Attributes::concrete(to)?;
        validate(id, &attrs)?;

        let schema = RESOURCE_TYPES
            .iter()
            .find(|(name, _)| *name == id.resource_type)
            .map(|(_, schema)| schema());

        let mut cloud = self.cloud.lock().await;
        let Some(existing) = cloud.get(&id.resource_type, identifier) else {
            return Err(ProviderError::new(format!(
                "ResourceNotFoundException: {} {} does not exist",
                id.resource_type, identifier
            ))
            .for_resource(id.clone()));
        };

        let desired = attrs.to_json();
        let immutable_changed = schema.as_ref().is_some_and(|schema| {
            schema
                .attributes
                .values()
                .filter(|a| a.force_new)
                .any(|a| existing.attributes.get(&a.name) != desired.get(&a.name))
        });
        if immutable_changed {
            log::debug!("{} cannot be updated in place", id);
            return Ok(UpdateOutcome::RequiresReplacement);
        }

        self.check_references(&cloud, id, &attrs)?;
        let object = StoredObject {
            attributes: desired,
            outputs: existing.outputs.clone(),
        };
        let state = object_state(id, identifier, &object)?;
        let mut next = cloud.clone();
        next.insert(&id.resource_type, identifier, object);
        self.persist(&mut cloud, next, id).await?;
        log::info!("Updated {} {}", id.resource_type, identifier);
        Ok(UpdateOutcome::Updated(state))
    }

    async fn delete_object(&self, id: &ResourceId, identifier: &str) -> ProviderResult<()> {
        self.admit(id, "delete").await?;
        let mut cloud = self.cloud.lock().await;
        if !cloud.contains(&id.resource_type, identifier) {
            log::debug!("{} {} is already gone", id.resource_type, identifier);
            return Ok(());
        }

        let (blocking, cascade) = self.dependents(&cloud, &id.resource_type, identifier);
        if !blocking.is_empty() {
            let names: Vec<String> = blocking
                .iter()
                .map(|(ty, ident)| format!("{} {}", ty, ident))
                .collect();
            return Err(ProviderError::new(format!(
                "DeleteConflict: {} {} is still referenced by {}",
                id.resource_type,
                identifier,
                names.join(", ")
            ))
            .for_resource(id.clone()));
        }

        let mut next = cloud.clone();
        for (child_type, child) in cascade {
            log::debug!("Removing {} {} with {}", child_type, child, identifier);
            next.remove(child_type, &child);
        }
        next.remove(&id.resource_type, identifier);
        self.persist(&mut cloud, next, id).await?;
        log::info!("Deleted {} {}", id.resource_type, identifier);
        Ok(())
    }
}

impl Provider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    fn resource_types(&self) -> Vec<Box<dyn ResourceType>> {
        RESOURCE_TYPES
            .iter()
            .map(|&(name, schema)| Box::new(LocalResourceType { name, schema }) as Box<dyn ResourceType>)
            .collect()
    }

    fn read(&self, id: &ResourceId, identifier: &str) -> BoxFuture<'_, ProviderResult<State>> {
        let id = id.clone();
        let identifier = identifier.to_string();
        Box::pin(async move { self.read_object(&id, &identifier).await })
    }

    fn create(&self, resource: &Resource) -> BoxFuture<'_, ProviderResult<State>> {
        let resource = resource.clone();
        Box::pin(async move { self.create_object(&resource).await })
    }

    fn update(
        &self,
        id: &ResourceId,
        identifier: &str,
        _from: &State,
        to: &Resource,
    ) -> BoxFuture<'_, ProviderResult<UpdateOutcome>> {
        let id = id.clone();
        let identifier = identifier.to_string();
        let to = to.clone();
        Box::pin(async move { self.update_object(&id, &identifier, &to).await })
    }

    fn delete(&self, id: &ResourceId, identifier: &str) -> BoxFuture<'_, ProviderResult<()>> {
        let id = id.clone();
        let identifier = identifier.to_string();
        Box::pin(async move { self.delete_object(&id, &identifier).await })
    }
}

/// Attributes of a call, all references already resolved
struct Attributes(HashMap<String, Value>);

impl Attributes {
    fn concrete(resource: &Resource) -> ProviderResult<Self> {
        let mut unresolved: Vec<&str> = resource
            .attributes
            .iter()
            .filter(|(_, v)| !v.is_known())
            .map(|(k, _)| k.as_str())
            .collect();
        if !unresolved.is_empty() {
            unresolved.sort();
            return Err(ProviderError::new(format!(
                "Attributes not resolved before the call: {}",
                unresolved.join(", ")
            ))
            .for_resource(resource.id.clone()));
        }
        Ok(Self(resource.attributes.clone()))
    }

    fn optional_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    fn required_str(&self, id: &ResourceId, name: &str) -> ProviderResult<&str> {
        self.optional_str(name).ok_or_else(|| {
            ProviderError::new(format!("ValidationException: '{}' is required", name))
                .for_resource(id.clone())
        })
    }

    fn to_json(&self) -> BTreeMap<String, serde_json::Value> {
        self.0.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()
    }
}

fn validate(id: &ResourceId, attrs: &Attributes) -> ProviderResult<()> {
    validation::validate_resource(&id.resource_type, &attrs.0).map_err(|errors| {
        let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
        ProviderError::new(format!("ValidationException: {}", messages.join("; ")))
            .for_resource(id.clone())
    })
}

/// Function identifier for a name or ARN
fn find_function(cloud: &Cloud, name_or_arn: &str) -> Option<String> {
    if cloud.contains("lambda.function", name_or_arn) {
        return Some(name_or_arn.to_string());
    }
    cloud
        .find("lambda.function", |o| o.output_str("arn") == Some(name_or_arn))
        .into_iter()
        .next()
}

fn object_state(id: &ResourceId, identifier: &str, object: &StoredObject) -> ProviderResult<State> {
    let decode = |map: &BTreeMap<String, serde_json::Value>| {
        map.iter()
            .map(|(k, v)| {
                Value::from_json(v).map(|v| (k.clone(), v)).map_err(|e| {
                    ProviderError::new(format!("Stored attribute '{}' is unreadable", k))
                        .for_resource(id.clone())
                        .with_cause(e)
                })
            })
            .collect::<ProviderResult<HashMap<_, _>>>()
    };

    let mut state = State::existing(id.clone(), decode(&object.attributes)?).with_identifier(identifier);
    state.outputs = decode(&object.outputs)?;
    Ok(state)
}
