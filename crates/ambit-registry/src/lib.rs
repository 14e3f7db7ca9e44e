// Scope definition registry.
//
// Hosts the externally-stored ScopeDefinition collection for a deployment:
// an in-memory canonical table plus an append-only change feed with a
// monotone sequence cursor. Remote API servers mirror it by fetching a full
// snapshot and then polling the change feed; the in-process (loopback) path
// talks to it directly through the `DefinitionClient` trait.
//
// Status writes flow through the admission mutation here, so a changed
// namespace list always picks up a fresh scope id regardless of which
// server wrote it.
use ambit_api::admission::admit_status_update;
use ambit_api::validation::{ValidationError, validate_definition, validate_status_update};
use ambit_api::{ScopeDefinition, ScopeDefinitionSpec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio::sync::{RwLock, broadcast};

pub mod controller;
pub mod http;

pub use controller::ScopeController;

pub type Result<T> = std::result::Result<T, RegistryError>;

// Rolling change feed window; pollers that fall further behind than this
// must resnapshot.
const CHANGES_WINDOW: usize = 1024;
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("scope definition not found: {0}")]
    NotFound(String),
    #[error("conflict updating scope definition {0:?}")]
    Conflict(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("invalid scope definition: {0}")]
    Invalid(String),
    /// The requested cursor fell out of the rolling change window.
    #[error("change cursor {since} is outside the retained window (oldest {oldest})")]
    OutdatedCursor { since: u64, oldest: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Updated,
    Deleted,
}

/// One change feed entry. `definition` is present for `Updated`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DefinitionChange {
    pub seq: u64,
    pub op: ChangeOp,
    pub name: String,
    pub definition: Option<ScopeDefinition>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub items: Vec<ScopeDefinition>,
    pub next_seq: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeSet {
    pub items: Vec<DefinitionChange>,
    pub next_seq: u64,
}

#[derive(Debug, Default)]
struct RegistryState {
    definitions: HashMap<String, ScopeDefinition>,
    changes: VecDeque<DefinitionChange>,
    next_seq: u64,
}

impl RegistryState {
    fn record_change(&mut self, op: ChangeOp, name: String, definition: Option<ScopeDefinition>) {
        self.next_seq += 1;
        self.changes.push_back(DefinitionChange {
            seq: self.next_seq,
            op,
            name,
            definition,
        });
        while self.changes.len() > CHANGES_WINDOW {
            self.changes.pop_front();
        }
    }
}

#[derive(Debug)]
pub struct DefinitionRegistry {
    state: RwLock<RegistryState>,
    events: broadcast::Sender<String>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(RegistryState::default()),
            events,
        }
    }

    pub async fn get(&self, name: &str) -> Option<ScopeDefinition> {
        self.state.read().await.definitions.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<ScopeDefinition> {
        self.state.read().await.definitions.values().cloned().collect()
    }

    /// Creates or replaces the authored spec of a definition. The served
    /// status is reconciled asynchronously by the [`ScopeController`].
    pub async fn upsert_spec(&self, name: &str, spec: ScopeDefinitionSpec) -> Result<ScopeDefinition> {
        let updated = {
            let mut state = self.state.write().await;
            let mut def = state.definitions.get(name).cloned().unwrap_or_else(|| {
                ScopeDefinition {
                    metadata: ambit_api::ObjectMeta {
                        name: name.to_string(),
                        resource_version: 0,
                    },
                    ..Default::default()
                }
            });
            def.spec = spec;
            validate_definition(&def)?;
            def.metadata.resource_version += 1;
            state.definitions.insert(name.to_string(), def.clone());
            state.record_change(ChangeOp::Updated, name.to_string(), Some(def.clone()));
            def
        };
        let _ = self.events.send(name.to_string());
        Ok(updated)
    }

    /// Optimistic status write: fails with [`RegistryError::Conflict`] when
    /// the caller's resource version is stale. Applies the admission
    /// mutation and validation before committing.
    pub async fn update_status(&self, mut def: ScopeDefinition) -> Result<ScopeDefinition> {
        let name = def.metadata.name.clone();
        let updated = {
            let mut state = self.state.write().await;
            let Some(existing) = state.definitions.get(&name).cloned() else {
                return Err(RegistryError::NotFound(name));
            };
            if existing.metadata.resource_version != def.metadata.resource_version {
                return Err(RegistryError::Conflict(name));
            }
            admit_status_update(Some(&existing), &mut def)
                .map_err(|err| RegistryError::Invalid(err.to_string()))?;
            validate_status_update(&existing, &def)?;
            // Status writes never touch the spec.
            def.spec = existing.spec.clone();
            def.metadata.resource_version += 1;
            state.definitions.insert(name.clone(), def.clone());
            state.record_change(ChangeOp::Updated, name.clone(), Some(def.clone()));
            def
        };
        let _ = self.events.send(updated.metadata.name.clone());
        Ok(updated)
    }

    /// Removes a definition and emits a delete change. What consumers do
    /// with deletes is deliberately left to them.
    pub async fn delete(&self, name: &str) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if state.definitions.remove(name).is_none() {
                return Err(RegistryError::NotFound(name.to_string()));
            }
            state.record_change(ChangeOp::Deleted, name.to_string(), None);
        }
        let _ = self.events.send(name.to_string());
        Ok(())
    }

    pub async fn snapshot(&self) -> Snapshot {
        let state = self.state.read().await;
        Snapshot {
            items: state.definitions.values().cloned().collect(),
            next_seq: state.next_seq,
        }
    }

    /// All changes after `since`. Errs when `since` predates the retained
    /// window; the caller resnapshots.
    pub async fn changes(&self, since: u64) -> Result<ChangeSet> {
        let state = self.state.read().await;
        if let Some(oldest) = state.changes.front().map(|change| change.seq) {
            // A cursor older than the window start has missed entries.
            if since + 1 < oldest {
                return Err(RegistryError::OutdatedCursor { since, oldest });
            }
        } else if since < state.next_seq {
            return Err(RegistryError::OutdatedCursor {
                since,
                oldest: state.next_seq,
            });
        }
        Ok(ChangeSet {
            items: state
                .changes
                .iter()
                .filter(|change| change.seq > since)
                .cloned()
                .collect(),
            next_seq: state.next_seq,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.events.subscribe()
    }
}

impl Default for DefinitionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ambit_scope::DefinitionClient for DefinitionRegistry {
    async fn get(&self, name: &str) -> ambit_scope::source::Result<Option<ScopeDefinition>> {
        Ok(DefinitionRegistry::get(self, name).await)
    }

    async fn list(&self) -> ambit_scope::source::Result<Vec<ScopeDefinition>> {
        Ok(DefinitionRegistry::list(self).await)
    }

    async fn update_status(
        &self,
        def: ScopeDefinition,
    ) -> ambit_scope::source::Result<ScopeDefinition> {
        DefinitionRegistry::update_status(self, def)
            .await
            .map_err(|err| match err {
                RegistryError::Conflict(name) => ambit_scope::SourceError::Conflict(name),
                RegistryError::NotFound(name) => {
                    ambit_scope::SourceError::Invalid(format!("no such definition {name:?}"))
                }
                other => ambit_scope::SourceError::Invalid(other.to_string()),
            })
    }

    fn watch(&self) -> broadcast::Receiver<String> {
        self.subscribe()
    }
}
