//! Provider - Trait abstracting resource operations
//!
//! A Provider translates generic create/read/update/delete calls into the API
//! calls of one backend. Each resource type is served by exactly one Provider;
//! the [`ProviderRegistry`] routes calls by resource type and exposes the
//! schemas (and thereby the replacement policy) the differ relies on.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::resource::{Resource, ResourceId, State};
use crate::schema::ResourceSchema;

/// How the engine should treat a failed provider call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Throttling and similar; safe to retry with backoff
    Transient,
    /// Retrying will not help
    Permanent,
}

/// Error type for Provider operations
#[derive(Debug)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    pub resource_id: Option<ResourceId>,
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref id) = self.resource_id {
            write!(f, "[{}] {}", id, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for ProviderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|e| e.as_ref() as &dyn std::error::Error)
    }
}

impl ProviderError {
    /// A permanent error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Permanent,
            message: message.into(),
            resource_id: None,
            cause: None,
        }
    }

    /// An error the engine may retry
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Transient,
            ..Self::new(message)
        }
    }

    pub fn for_resource(mut self, id: ResourceId) -> Self {
        self.resource_id = Some(id);
        self
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ProviderErrorKind::Transient
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Return type for async operations
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Definition of resource types that a Provider can handle
pub trait ResourceType: Send + Sync {
    /// Resource type name (e.g., "dynamodb.table")
    fn name(&self) -> &'static str;

    /// Attribute schema, including which attributes force replacement
    fn schema(&self) -> ResourceSchema {
        ResourceSchema::new(self.name())
    }
}

/// Result of an in-place update
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Updated(State),
    /// The backend cannot apply the change in place
    RequiresReplacement,
}

/// Main Provider trait
///
/// All operations are async and involve side effects.
pub trait Provider: Send + Sync {
    /// Name of this Provider (e.g., "local")
    fn name(&self) -> &'static str;

    /// List of resource types this Provider can handle
    fn resource_types(&self) -> Vec<Box<dyn ResourceType>>;

    /// Get the live state of a resource by its provider identifier
    ///
    /// Returns `State::not_found()` if the resource does not exist.
    fn read(&self, id: &ResourceId, identifier: &str) -> BoxFuture<'_, ProviderResult<State>>;

    /// Create a resource
    ///
    /// Returns State with identifier set to the provider-assigned ID and the
    /// computed attributes in `outputs`.
    fn create(&self, resource: &Resource) -> BoxFuture<'_, ProviderResult<State>>;

    /// Update a resource in place
    fn update(
        &self,
        id: &ResourceId,
        identifier: &str,
        from: &State,
        to: &Resource,
    ) -> BoxFuture<'_, ProviderResult<UpdateOutcome>>;

    /// Delete a resource
    fn delete(&self, id: &ResourceId, identifier: &str) -> BoxFuture<'_, ProviderResult<()>>;
}

/// Provider implementation for Box<dyn Provider>
/// This enables dynamic dispatch for Providers
impl Provider for Box<dyn Provider> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn resource_types(&self) -> Vec<Box<dyn ResourceType>> {
        (**self).resource_types()
    }

    fn read(&self, id: &ResourceId, identifier: &str) -> BoxFuture<'_, ProviderResult<State>> {
        (**self).read(id, identifier)
    }

    fn create(&self, resource: &Resource) -> BoxFuture<'_, ProviderResult<State>> {
        (**self).create(resource)
    }

    fn update(
        &self,
        id: &ResourceId,
        identifier: &str,
        from: &State,
        to: &Resource,
    ) -> BoxFuture<'_, ProviderResult<UpdateOutcome>> {
        (**self).update(id, identifier, from, to)
    }

    fn delete(&self, id: &ResourceId, identifier: &str) -> BoxFuture<'_, ProviderResult<()>> {
        (**self).delete(id, identifier)
    }
}

/// Routes resource types to the Provider that serves them
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
    schemas: HashMap<String, ResourceSchema>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every resource type of `provider`. A later registration for the
    /// same resource type replaces the earlier one.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        for resource_type in provider.resource_types() {
            let name = resource_type.name().to_string();
            log::debug!("Registering {} for provider {}", name, provider.name());
            self.schemas.insert(name.clone(), resource_type.schema());
            self.providers.insert(name, Arc::clone(&provider));
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.register(provider);
        self
    }

    pub fn provider_for(&self, resource_type: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(resource_type).cloned()
    }

    /// Like [`provider_for`](Self::provider_for), as a permanent error for `id`
    pub fn require(&self, id: &ResourceId) -> ProviderResult<Arc<dyn Provider>> {
        self.provider_for(&id.resource_type).ok_or_else(|| {
            ProviderError::new(format!(
                "No provider handles resource type '{}'",
                id.resource_type
            ))
            .for_resource(id.clone())
        })
    }

    pub fn schemas(&self) -> &HashMap<String, ResourceSchema> {
        &self.schemas
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.providers.keys().collect();
        types.sort();
        f.debug_struct("ProviderRegistry")
            .field("resource_types", &types)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AttributeSchema, AttributeType};

    // Mock Provider for testing
    struct MockProvider;

    struct MockBucket;

    impl ResourceType for MockBucket {
        fn name(&self) -> &'static str {
            "mock.bucket"
        }

        fn schema(&self) -> ResourceSchema {
            ResourceSchema::new(self.name()).attribute(
                AttributeSchema::new("name", AttributeType::String)
                    .required()
                    .force_new(),
            )
        }
    }

    impl Provider for MockProvider {
        fn name(&self) -> &'static str {
            "mock"
        }

        fn resource_types(&self) -> Vec<Box<dyn ResourceType>> {
            vec![Box::new(MockBucket)]
        }

        fn read(&self, id: &ResourceId, _identifier: &str) -> BoxFuture<'_, ProviderResult<State>> {
            let id = id.clone();
            Box::pin(async move { Ok(State::not_found(id)) })
        }

        fn create(&self, resource: &Resource) -> BoxFuture<'_, ProviderResult<State>> {
            let id = resource.id.clone();
            let attrs = resource.attributes.clone();
            Box::pin(async move { Ok(State::existing(id, attrs).with_identifier("mock-id-123")) })
        }

        fn update(
            &self,
            id: &ResourceId,
            _identifier: &str,
            _from: &State,
            to: &Resource,
        ) -> BoxFuture<'_, ProviderResult<UpdateOutcome>> {
            let id = id.clone();
            let attrs = to.attributes.clone();
            Box::pin(async move { Ok(UpdateOutcome::Updated(State::existing(id, attrs))) })
        }

        fn delete(&self, _id: &ResourceId, _identifier: &str) -> BoxFuture<'_, ProviderResult<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn mock_provider_read_returns_not_found() {
        let provider = MockProvider;
        let id = ResourceId::new("mock.bucket", "example");
        let state = provider.read(&id, "mock-id-123").await.unwrap();
        assert!(!state.exists);
    }

    #[tokio::test]
    async fn boxed_provider_delegates() {
        let provider: Box<dyn Provider> = Box::new(MockProvider);
        let resource = Resource::new("mock.bucket", "example");
        let state = provider.create(&resource).await.unwrap();
        assert!(state.exists);
        assert_eq!(state.identifier, Some("mock-id-123".to_string()));
    }

    #[test]
    fn registry_routes_by_resource_type() {
        let registry = ProviderRegistry::new().with_provider(Arc::new(MockProvider));

        assert!(registry.provider_for("mock.bucket").is_some());
        assert!(registry.provider_for("other.thing").is_none());
        assert!(registry.schemas()["mock.bucket"].requires_replacement("name"));

        let err = registry
            .require(&ResourceId::new("other.thing", "x"))
            .err()
            .unwrap();
        assert_eq!(err.kind, ProviderErrorKind::Permanent);
        assert_eq!(
            err.to_string(),
            "[other.thing.x] No provider handles resource type 'other.thing'"
        );
    }

    #[test]
    fn error_kinds() {
        assert!(ProviderError::transient("Rate exceeded").is_transient());
        assert!(!ProviderError::new("Access denied").is_transient());
    }
}
