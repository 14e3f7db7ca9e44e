// In-memory definition client for tests and examples.
//
// Unlike the real registry this fake applies no admission mutation or
// validation; tests drive status fields directly.
use crate::source::{DefinitionClient, Result, SourceError};
use ambit_api::ScopeDefinition;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{RwLock, broadcast};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct InMemoryDefinitions {
    definitions: RwLock<HashMap<String, ScopeDefinition>>,
    events: broadcast::Sender<String>,
    fail_status_updates: AtomicBool,
    conflict_status_updates: AtomicBool,
}

impl InMemoryDefinitions {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            definitions: RwLock::new(HashMap::new()),
            events,
            fail_status_updates: AtomicBool::new(false),
            conflict_status_updates: AtomicBool::new(false),
        }
    }

    /// Stores a definition verbatim (bumping its resource version) and
    /// emits a change event, as if an external writer updated it.
    pub async fn put(&self, mut def: ScopeDefinition) {
        let name = def.metadata.name.clone();
        {
            let mut definitions = self.definitions.write().await;
            let next = definitions
                .get(&name)
                .map(|existing| existing.metadata.resource_version + 1)
                .unwrap_or(1);
            def.metadata.resource_version = next;
            definitions.insert(name.clone(), def);
        }
        let _ = self.events.send(name);
    }

    pub async fn remove(&self, name: &str) {
        self.definitions.write().await.remove(name);
        let _ = self.events.send(name.to_string());
    }

    /// Makes subsequent status updates fail as unavailable.
    pub fn fail_status_updates(&self, fail: bool) {
        self.fail_status_updates.store(fail, Ordering::SeqCst);
    }

    /// Makes subsequent status updates fail with a conflict.
    pub fn conflict_status_updates(&self, conflict: bool) {
        self.conflict_status_updates.store(conflict, Ordering::SeqCst);
    }
}

impl Default for InMemoryDefinitions {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DefinitionClient for InMemoryDefinitions {
    async fn get(&self, name: &str) -> Result<Option<ScopeDefinition>> {
        Ok(self.definitions.read().await.get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<ScopeDefinition>> {
        Ok(self.definitions.read().await.values().cloned().collect())
    }

    async fn update_status(&self, mut def: ScopeDefinition) -> Result<ScopeDefinition> {
        if self.fail_status_updates.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable("status updates disabled".into()));
        }
        if self.conflict_status_updates.load(Ordering::SeqCst) {
            return Err(SourceError::Conflict(def.metadata.name.clone()));
        }
        let name = def.metadata.name.clone();
        {
            let mut definitions = self.definitions.write().await;
            let Some(existing) = definitions.get(&name) else {
                return Err(SourceError::Invalid(format!("no such definition {name:?}")));
            };
            if existing.metadata.resource_version != def.metadata.resource_version {
                return Err(SourceError::Conflict(name));
            }
            def.metadata.resource_version += 1;
            definitions.insert(name.clone(), def.clone());
        }
        let _ = self.events.send(name);
        Ok(def)
    }

    fn watch(&self) -> broadcast::Receiver<String> {
        self.events.subscribe()
    }
}
