// Scope resolver: reconciles scope definitions into live mappings.
//
// One resolver instance runs per API server. It owns the selector table and
// is its only writer; reconciliation runs on a single worker draining a
// keyed queue, which is what guarantees publish-then-expire ordering
// without locking the state machine.
use crate::mapping::{ExpireReason, ScopeMapping};
use crate::queue::KeyedQueue;
use crate::source::{DefinitionClient, SourceError};
use crate::stores::{ResourceStoreMapper, StoreError};
use ambit_api::{
    GroupResource, ScopeDefinition, ScopeSelector, ServerScopeVersion, parse_resource_version,
    set_server_scope_version,
};
use async_trait::async_trait;
use metrics::counter;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast, watch};

pub type Result<T> = std::result::Result<T, ResolveError>;

#[derive(thiserror::Error, Debug)]
pub enum ResolveError {
    /// The selector has no published mapping on this server. Clients that
    /// learned the scope elsewhere should retry once caches sync.
    #[error("unknown scope '{name}={value}'")]
    UnknownScope { name: String, value: String },
    /// No server has recorded progress for this store yet.
    #[error("no minimum resource version entry for store {0:?} found")]
    MissingMinimum(String),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Api(#[from] ambit_api::Error),
}

/// Resolves a scope selector into the currently published mapping.
#[async_trait]
pub trait ScopeResolver: Send + Sync {
    /// Non-blocking lookup of the published mapping for `(name, value)`.
    async fn resolve(&self, name: &str, value: &str) -> Result<Arc<ScopeMapping>>;

    /// The fleet-wide minimum acceptable starting resource version for the
    /// store holding `resource`, as recorded on the persisted definition.
    async fn minimum_resource_version(
        &self,
        selector: &ScopeSelector,
        resource: &GroupResource,
    ) -> Result<u64>;
}

pub struct DefaultScopeResolver {
    // Identifier for this API server in persisted progress records.
    api_server_id: String,
    client: Arc<dyn DefinitionClient>,
    store_mapper: Arc<dyn ResourceStoreMapper>,
    // Readers are the request path; the reconcile worker is the only writer.
    table: RwLock<HashMap<ScopeSelector, Arc<ScopeMapping>>>,
    queue: KeyedQueue,
}

impl DefaultScopeResolver {
    pub fn new(
        api_server_id: impl Into<String>,
        client: Arc<dyn DefinitionClient>,
        store_mapper: Arc<dyn ResourceStoreMapper>,
    ) -> Self {
        Self {
            api_server_id: api_server_id.into(),
            client,
            store_mapper,
            table: RwLock::new(HashMap::new()),
            queue: KeyedQueue::new(),
        }
    }

    /// Runs the reconciliation worker until `shutdown` fires, then drains
    /// cleanly: the in-flight item finishes, no new work is taken.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        tracing::info!("starting scope resolver");

        // Seed the queue with everything that already exists so resolve()
        // works before the first change event arrives.
        match self.client.list().await {
            Ok(defs) => {
                for def in defs {
                    self.queue.add(def.metadata.name);
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "initial scope definition list failed; relying on change events");
            }
        }

        let pump = tokio::spawn(event_pump(
            Arc::clone(&self.client),
            self.queue.clone(),
            shutdown.clone(),
        ));
        let stopper = {
            let queue = self.queue.clone();
            let mut shutdown = shutdown;
            tokio::spawn(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
                queue.shut_down();
            })
        };

        while let Some(key) = self.queue.get().await {
            counter!("ambit_scope_reconcile_total").increment(1);
            match self.process(&key).await {
                Ok(()) => self.queue.forget(&key),
                Err(ResolveError::Source(SourceError::Conflict(_))) => {
                    // Another server won the status write; retry silently.
                    tracing::debug!(key, "scope status update conflicted, requeueing");
                    self.queue.requeue_rate_limited(&key);
                }
                Err(err) => {
                    counter!("ambit_scope_reconcile_errors_total").increment(1);
                    tracing::warn!(key, error = %err, "failed to reconcile scope definition");
                    self.queue.requeue_rate_limited(&key);
                }
            }
            self.queue.done(&key);
        }

        let _ = pump.await;
        let _ = stopper.await;
        tracing::info!("shutting down scope resolver");
    }

    // Not safe for concurrent execution; only the single worker calls this.
    async fn process(&self, key: &str) -> Result<()> {
        let Some(def) = self.client.get(key).await? else {
            // Absent definition: either never existed or was deleted.
            // TODO: expire and remove the live mapping when the definition
            // is deleted; delete semantics are not settled yet.
            return Ok(());
        };
        let selector: ScopeSelector = match def.metadata.name.parse() {
            Ok(selector) => selector,
            Err(err) => {
                // Permanently malformed; retrying cannot help.
                tracing::error!(name = %def.metadata.name, error = %err, "dropping scope definition with malformed name");
                return Ok(());
            }
        };

        let existing = { self.table.read().await.get(&selector).cloned() };
        let previous = match existing {
            None => {
                self.publish(&selector, &def).await;
                tracing::debug!(scope = %selector, scope_id = %def.status.scope_id, "new scope configuration installed");
                return Ok(());
            }
            Some(current) if current.scope_id() == def.status.scope_id => {
                // Same generation; nothing to do.
                return Ok(());
            }
            Some(current) => current,
        };

        // The generation advanced. Publish the replacement first so new
        // requests observe it, then expire the predecessor.
        let fresh = self.publish(&selector, &def).await;
        previous.expire(ExpireReason::ConfigurationChanged);
        counter!("ambit_scope_mappings_expired_total").increment(1);

        if let Err(err) = self.record_progress(&def, fresh.scope_id()).await {
            // Roll back to an absent entry rather than exposing a mapping
            // whose progress was never persisted.
            self.clear(&selector).await;
            fresh.expire(ExpireReason::Internal);
            return Err(err);
        }
        tracing::debug!(
            scope = %selector,
            old_scope_id = %previous.scope_id(),
            scope_id = %fresh.scope_id(),
            "scope configuration updated"
        );
        Ok(())
    }

    // Records (server, store, scopeID, rv) for every known store on the
    // definition status and persists it.
    async fn record_progress(&self, def: &ScopeDefinition, scope_id: &str) -> Result<()> {
        let mut updated = def.clone();
        for store_id in self.store_mapper.stores() {
            let rv = self.store_mapper.current_resource_version(&store_id).await?;
            set_server_scope_version(
                &mut updated.status,
                ServerScopeVersion {
                    api_server_id: self.api_server_id.clone(),
                    store_id,
                    scope_id: scope_id.to_string(),
                    resource_version: rv.to_string(),
                },
            );
        }
        self.client.update_status(updated).await?;
        Ok(())
    }

    async fn publish(&self, selector: &ScopeSelector, def: &ScopeDefinition) -> Arc<ScopeMapping> {
        let mapping = Arc::new(ScopeMapping::new(
            selector.clone(),
            def.status.scope_id.clone(),
            def.status.namespaces.clone(),
        ));
        self.table
            .write()
            .await
            .insert(selector.clone(), Arc::clone(&mapping));
        mapping
    }

    async fn clear(&self, selector: &ScopeSelector) {
        self.table.write().await.remove(selector);
    }
}

#[async_trait]
impl ScopeResolver for DefaultScopeResolver {
    async fn resolve(&self, name: &str, value: &str) -> Result<Arc<ScopeMapping>> {
        let unknown = || ResolveError::UnknownScope {
            name: name.to_string(),
            value: value.to_string(),
        };
        let selector = ScopeSelector::new(name, value).map_err(|_| unknown())?;
        self.table
            .read()
            .await
            .get(&selector)
            .cloned()
            .ok_or_else(unknown)
    }

    async fn minimum_resource_version(
        &self,
        selector: &ScopeSelector,
        resource: &GroupResource,
    ) -> Result<u64> {
        let store_id = self.store_mapper.store_for_resource(resource);
        let def = self
            .client
            .get(&selector.definition_name())
            .await?
            .ok_or_else(|| ResolveError::UnknownScope {
                name: selector.name().to_string(),
                value: selector.value().to_string(),
            })?;
        for mrv in &def.status.minimum_resource_versions {
            if mrv.store_id == store_id {
                return Ok(parse_resource_version(&mrv.resource_version)?);
            }
        }
        Err(ResolveError::MissingMinimum(store_id))
    }
}

// Pumps definition change events into the keyed queue. A lagged broadcast
// receiver falls back to a full relist so no key is permanently missed.
async fn event_pump(
    client: Arc<dyn DefinitionClient>,
    queue: KeyedQueue,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut events = client.watch();

    enum Step {
        Shutdown,
        Added(String),
        Lagged(u64),
        Closed,
    }

    loop {
        let step = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => Step::Shutdown,
            event = events.recv() => match event {
                Ok(name) => Step::Added(name),
                Err(broadcast::error::RecvError::Lagged(skipped)) => Step::Lagged(skipped),
                Err(broadcast::error::RecvError::Closed) => Step::Closed,
            },
        };

        match step {
            Step::Shutdown => break,
            Step::Added(name) => queue.add(name),
            Step::Lagged(skipped) => {
                tracing::warn!(skipped, "scope definition event stream lagged, resyncing");
                match client.list().await {
                    Ok(defs) => {
                        for def in defs {
                            queue.add(def.metadata.name);
                        }
                    }
                    Err(err) => tracing::warn!(error = %err, "resync list failed"),
                }
            }
            Step::Closed => break,
        }
    }
}
