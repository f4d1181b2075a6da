//! Locked read-modify-write cycle over a state backend
//!
//! A session acquires the lock, reads and validates the state, accumulates
//! changes and writes them back. [`StateSession::close`] releases the lock and
//! must be called on every exit path.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use strata_core::executor::{ApplyReport, EntryOutcome};
use strata_core::provider::ProviderRegistry;
use strata_core::refresh::RefreshReport;
use strata_core::resource::{ResourceId, State};

use crate::backend::{BackendResult, StateBackend};
use crate::lock::LockInfo;
use crate::state::{ResourceState, StateFile};

pub struct StateSession {
    backend: Arc<dyn StateBackend>,
    lock: Option<LockInfo>,
    state: StateFile,
    states: HashMap<ResourceId, State>,
    dirty: bool,
}

impl StateSession {
    /// Lock the state and read it. The lock is released again if reading fails.
    pub async fn begin(
        backend: Arc<dyn StateBackend>,
        operation: &str,
        timeout: Duration,
    ) -> BackendResult<Self> {
        let lock = backend.acquire_lock(operation, timeout).await?;

        let loaded = match backend.read_state().await {
            Ok(state) => {
                let state = state.unwrap_or_default();
                state.states().map(|states| (state, states))
            }
            Err(e) => Err(e),
        };
        let (state, states) = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                if let Err(release_error) = backend.release_lock(&lock).await {
                    log::error!("Failed to release state lock {}: {}", lock.id, release_error);
                }
                return Err(e);
            }
        };

        log::debug!(
            "Loaded state '{}' serial {} with {} resources",
            backend.key(),
            state.serial,
            states.len()
        );
        Ok(Self {
            backend,
            lock: Some(lock),
            state,
            states,
            dirty: false,
        })
    }

    pub fn lock(&self) -> Option<&LockInfo> {
        self.lock.as_ref()
    }

    pub fn state_file(&self) -> &StateFile {
        &self.state
    }

    /// Recorded states, including changes recorded in this session
    pub fn current_states(&self) -> &HashMap<ResourceId, State> {
        &self.states
    }

    /// Resources marked as protected from deletion
    pub fn protected(&self) -> BTreeSet<ResourceId> {
        self.state.protected()
    }

    /// Whether changes were recorded since the last commit
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Record the outcome of every applied entry. Returns the number of
    /// resources written or removed.
    pub fn record(&mut self, report: &ApplyReport, registry: &ProviderRegistry) -> usize {
        let mut changed = 0;
        for outcome in report.outcomes() {
            match outcome {
                EntryOutcome::Deleted(id) => self.remove(id),
                other => {
                    if let Some(state) = other.state() {
                        let provider = registry
                            .provider_for(&state.id.resource_type)
                            .map(|p| p.name())
                            .unwrap_or("unknown");
                        self.upsert(state, provider);
                    }
                }
            }
            changed += 1;
        }
        changed
    }

    /// Replace recorded states with refreshed ones
    pub fn record_refresh(&mut self, report: &RefreshReport) {
        for id in &report.removed {
            self.remove(id);
        }
        for id in &report.drifted {
            if let Some(state) = report.states.get(id) {
                let provider = self
                    .state
                    .find_resource(&id.resource_type, &id.name)
                    .map(|r| r.provider.clone())
                    .unwrap_or_else(|| "unknown".to_string());
                self.upsert(state, &provider);
            }
        }
    }

    fn upsert(&mut self, state: &State, provider: &str) {
        let mut record = ResourceState::from_state(state, provider);
        if let Some(previous) = self
            .state
            .find_resource(&state.id.resource_type, &state.id.name)
        {
            record.protected = previous.protected;
            record.extra = previous.extra.clone();
        }
        self.state.upsert_resource(record);
        self.states.insert(state.id.clone(), state.clone());
        self.dirty = true;
    }

    fn remove(&mut self, id: &ResourceId) {
        self.state.remove_resource(&id.resource_type, &id.name);
        self.states.remove(id);
        self.dirty = true;
    }

    /// Write the state back under the lock
    pub async fn commit(&mut self) -> BackendResult<()> {
        let lock = self
            .lock
            .as_ref()
            .ok_or_else(|| crate::backend::BackendError::NotLockHolder("released".to_string()))?;

        self.state.sort_resources();
        self.state.increment_serial();
        self.backend.write_state(lock, &self.state).await?;
        self.dirty = false;
        log::info!(
            "Saved state '{}' (serial {})",
            self.backend.key(),
            self.state.serial
        );
        Ok(())
    }

    /// Release the lock
    pub async fn close(mut self) -> BackendResult<()> {
        match self.lock.take() {
            Some(lock) => self.backend.release_lock(&lock).await,
            None => Ok(()),
        }
    }
}

impl Drop for StateSession {
    fn drop(&mut self) {
        if let Some(lock) = &self.lock {
            log::warn!(
                "State session dropped without releasing lock {}; run force-unlock if it remains",
                lock.id
            );
        }
    }
}
