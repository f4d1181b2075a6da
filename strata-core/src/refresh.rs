//! Refresh - Reconcile recorded states with what the backend reports
//!
//! Reads are idempotent, so they are retried on any error. A resource the
//! backend no longer knows is dropped from state and will be planned for
//! creation again.

use std::collections::HashMap;

use crate::provider::{ProviderError, ProviderRegistry};
use crate::resource::{ResourceId, State};
use crate::retry::{RetryOn, RetryPolicy, with_retry};

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("Failed to refresh {id}: {source}")]
    Read {
        id: ResourceId,
        source: ProviderError,
    },

    #[error("{0} has no recorded provider identifier")]
    MissingIdentifier(ResourceId),
}

#[derive(Debug, Default)]
pub struct RefreshReport {
    /// Refreshed states of every resource that still exists
    pub states: HashMap<ResourceId, State>,
    /// Resources deleted outside the tool
    pub removed: Vec<ResourceId>,
    /// Resources whose attributes were changed outside the tool
    pub drifted: Vec<ResourceId>,
}

impl RefreshReport {
    pub fn has_changes(&self) -> bool {
        !self.removed.is_empty() || !self.drifted.is_empty()
    }
}

/// Read every recorded resource through its provider
pub async fn refresh(
    registry: &ProviderRegistry,
    states: &HashMap<ResourceId, State>,
    policy: &RetryPolicy,
) -> Result<RefreshReport, RefreshError> {
    let mut ids: Vec<&ResourceId> = states.keys().collect();
    ids.sort();

    let mut report = RefreshReport::default();
    for id in ids {
        let recorded = &states[id];
        let provider = registry.require(id).map_err(|source| RefreshError::Read {
            id: id.clone(),
            source,
        })?;
        let identifier = recorded
            .identifier
            .as_deref()
            .ok_or_else(|| RefreshError::MissingIdentifier(id.clone()))?;

        let label = format!("read {}", id);
        let live = with_retry(policy, RetryOn::Any, &label, || provider.read(id, identifier))
            .await
            .map_err(|source| RefreshError::Read {
                id: id.clone(),
                source,
            })?;

        if !live.exists {
            log::warn!("{} no longer exists, removing it from state", id);
            report.removed.push(id.clone());
            continue;
        }

        let refreshed = merge(recorded, live);
        if refreshed.attributes != recorded.attributes {
            log::warn!("{} has drifted from its recorded state", id);
            report.drifted.push(id.clone());
        }
        report.states.insert(id.clone(), refreshed);
    }

    Ok(report)
}

/// Recorded inputs are replaced by their live values; inputs the backend no
/// longer reports are dropped. Computed attributes the backend reports in
/// `attributes` are not adopted as inputs.
fn merge(recorded: &State, live: State) -> State {
    let attributes = recorded
        .attributes
        .keys()
        .filter_map(|key| live.attributes.get(key).map(|v| (key.clone(), v.clone())))
        .collect();
    let outputs = if live.outputs.is_empty() {
        recorded.outputs.clone()
    } else {
        live.outputs
    };

    State {
        id: recorded.id.clone(),
        identifier: live.identifier.or_else(|| recorded.identifier.clone()),
        attributes,
        outputs,
        dependencies: recorded.dependencies.clone(),
        exists: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::tests::TestProvider;
    use crate::provider::Provider;
    use crate::resource::Value;
    use std::sync::Arc;

    fn recorded(name: &str, key: &str) -> State {
        State::existing(
            ResourceId::new("test.item", name),
            HashMap::from([("key".to_string(), Value::string(key))]),
        )
        .with_identifier(format!("{}-id", name))
        .with_output("arn", Value::string(format!("arn:test:{}", name)))
    }

    fn setup(objects: &[(&str, &str)]) -> (Arc<TestProvider>, ProviderRegistry) {
        let provider = Arc::new(TestProvider::default());
        {
            let mut store = provider.objects.lock().unwrap();
            for (identifier, key) in objects {
                store.insert(
                    identifier.to_string(),
                    HashMap::from([
                        ("key".to_string(), Value::string(*key)),
                        ("created_at".to_string(), Value::string("now")),
                    ]),
                );
            }
        }
        let registry = ProviderRegistry::new().with_provider(provider.clone() as Arc<dyn Provider>);
        (provider, registry)
    }

    fn states(list: Vec<State>) -> HashMap<ResourceId, State> {
        list.into_iter().map(|s| (s.id.clone(), s)).collect()
    }

    #[tokio::test]
    async fn unchanged_resources_are_kept() {
        let (_, registry) = setup(&[("a-id", "a")]);
        let current = states(vec![recorded("a", "a")]);

        let report = refresh(&registry, &current, &RetryPolicy::no_retry())
            .await
            .unwrap();
        assert!(!report.has_changes());
        // computed attribute from the backend is not adopted; outputs survive
        assert_eq!(report.states, current);
    }

    #[tokio::test]
    async fn resources_deleted_out_of_band_are_removed() {
        let (_, registry) = setup(&[("a-id", "a")]);
        let current = states(vec![recorded("a", "a"), recorded("b", "b")]);

        let report = refresh(&registry, &current, &RetryPolicy::no_retry())
            .await
            .unwrap();
        assert_eq!(report.removed, vec![ResourceId::new("test.item", "b")]);
        assert_eq!(report.states.len(), 1);
    }

    #[tokio::test]
    async fn drift_replaces_recorded_attributes() {
        let (_, registry) = setup(&[("a-id", "changed")]);
        let current = states(vec![recorded("a", "a")]);

        let report = refresh(&registry, &current, &RetryPolicy::no_retry())
            .await
            .unwrap();
        let id = ResourceId::new("test.item", "a");
        assert_eq!(report.drifted, vec![id.clone()]);
        assert_eq!(
            report.states[&id].attributes.get("key"),
            Some(&Value::string("changed"))
        );
    }

    #[tokio::test]
    async fn missing_provider_aborts_refresh() {
        let (_, registry) = setup(&[]);
        let mut other = recorded("x", "x");
        other.id = ResourceId::new("other.kind", "x");
        let current = states(vec![other]);

        let err = refresh(&registry, &current, &RetryPolicy::no_retry())
            .await
            .unwrap_err();
        assert!(matches!(err, RefreshError::Read { .. }));
    }

    #[tokio::test]
    async fn missing_identifier_aborts_refresh() {
        let (_, registry) = setup(&[]);
        let mut state = recorded("a", "a");
        state.identifier = None;

        let err = refresh(&registry, &states(vec![state]), &RetryPolicy::no_retry())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "test.item.a has no recorded provider identifier");
    }

    #[tokio::test]
    async fn reads_in_address_order() {
        let (provider, registry) = setup(&[("a-id", "a"), ("b-id", "b")]);
        let current = states(vec![recorded("b", "b"), recorded("a", "a")]);

        refresh(&registry, &current, &RetryPolicy::no_retry())
            .await
            .unwrap();
        assert_eq!(provider.calls(), vec!["read a", "read b"]);
    }
}
