// Reconciles authored specs into served status.
//
// Watches definition changes and rewrites `status.namespaces` as the sorted
// deduplication of `spec.namespaces`. The status write runs through the
// admission mutation, which is where the new generation's scope id comes
// from; this controller never touches scope ids itself.
use crate::{DefinitionRegistry, RegistryError};
use ambit_api::normalized_namespaces;
use ambit_scope::KeyedQueue;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

pub struct ScopeController {
    registry: Arc<DefinitionRegistry>,
    queue: KeyedQueue,
}

impl ScopeController {
    pub fn new(registry: Arc<DefinitionRegistry>) -> Self {
        Self {
            registry,
            queue: KeyedQueue::new(),
        }
    }

    /// Runs a single reconcile worker until `shutdown` fires.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        tracing::info!("starting scope definition controller");

        for def in self.registry.list().await {
            self.queue.add(def.metadata.name);
        }

        let pump = {
            let mut events = self.registry.subscribe();
            let queue = self.queue.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.wait_for(|stop| *stop) => break,
                        event = events.recv() => match event {
                            Ok(name) => queue.add(name),
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                tracing::warn!(skipped, "scope controller event stream lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
            })
        };
        let stopper = {
            let queue = self.queue.clone();
            let mut shutdown = shutdown;
            tokio::spawn(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
                queue.shut_down();
            })
        };

        while let Some(key) = self.queue.get().await {
            match self.process(&key).await {
                Ok(()) => self.queue.forget(&key),
                Err(RegistryError::Conflict(_)) => {
                    tracing::debug!(key, "scope status write conflicted, requeueing");
                    self.queue.requeue_rate_limited(&key);
                }
                Err(err) => {
                    tracing::warn!(key, error = %err, "failed to reconcile scope spec");
                    self.queue.requeue_rate_limited(&key);
                }
            }
            self.queue.done(&key);
        }

        let _ = pump.await;
        let _ = stopper.await;
        tracing::info!("shutting down scope definition controller");
    }

    async fn process(&self, key: &str) -> Result<(), RegistryError> {
        let Some(def) = self.registry.get(key).await else {
            return Ok(());
        };
        let proposed: BTreeSet<&String> = def.spec.namespaces.iter().collect();
        let current: BTreeSet<&String> = def.status.namespaces.iter().collect();
        if proposed == current {
            // Status already reflects the spec.
            return Ok(());
        }
        let mut updated = def.clone();
        updated.status.namespaces = normalized_namespaces(&def.spec.namespaces);
        self.registry.update_status(updated).await?;
        tracing::debug!(key, "scope updated with new status namespaces");
        Ok(())
    }
}
