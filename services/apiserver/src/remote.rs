// Remote scope definition source.
//
// Mirrors a remote registry into process memory: a full snapshot seeds the
// mirror at startup, then the change feed is polled with a monotone cursor.
// Reads are served from the mirror; status writes go straight through.
// Fetch failures during steady state are non-fatal (the mirror just goes
// stale until the next successful poll), but a failed seed aborts startup.
use ambit_api::ScopeDefinition;
use ambit_registry::{ChangeOp, ChangeSet, Snapshot};
use ambit_scope::{DefinitionClient, SourceError};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, broadcast, watch};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(thiserror::Error, Debug)]
enum FetchError {
    // The cursor fell out of the registry's change window; resnapshot.
    #[error("change cursor outdated")]
    OutdatedCursor,
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub struct RemoteDefinitionClient {
    base_url: String,
    http: reqwest::Client,
    mirror: RwLock<HashMap<String, ScopeDefinition>>,
    events: broadcast::Sender<String>,
}

impl RemoteDefinitionClient {
    /// Seeds the mirror from a snapshot and starts the change feed poller.
    /// A failed seed is a startup error.
    pub async fn connect(
        base_url: &str,
        poll_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<Arc<Self>> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let client = Arc::new(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            mirror: RwLock::new(HashMap::new()),
            events,
        });
        let next_seq = client
            .seed_snapshot()
            .await
            .with_context(|| format!("seed scope definitions from {base_url}"))?;
        tokio::spawn(poll_changes(
            Arc::clone(&client),
            next_seq,
            poll_interval,
            shutdown,
        ));
        Ok(client)
    }

    async fn seed_snapshot(&self) -> Result<u64, FetchError> {
        let snapshot: Snapshot = self
            .http
            .get(format!("{}/v1/scopedefinitions/snapshot", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let names: Vec<String> = {
            let mut mirror = self.mirror.write().await;
            mirror.clear();
            snapshot
                .items
                .into_iter()
                .map(|def| {
                    let name = def.metadata.name.clone();
                    mirror.insert(name.clone(), def);
                    name
                })
                .collect()
        };
        for name in names {
            let _ = self.events.send(name);
        }
        Ok(snapshot.next_seq)
    }

    async fn fetch_changes(&self, since: u64) -> Result<ChangeSet, FetchError> {
        let response = self
            .http
            .get(format!(
                "{}/v1/scopedefinitions/changes?since={since}",
                self.base_url
            ))
            .send()
            .await?;
        if response.status() == StatusCode::GONE {
            return Err(FetchError::OutdatedCursor);
        }
        Ok(response.error_for_status()?.json().await?)
    }

    async fn apply_changes(&self, changes: &ChangeSet) {
        for change in &changes.items {
            {
                let mut mirror = self.mirror.write().await;
                match (change.op, &change.definition) {
                    (ChangeOp::Updated, Some(def)) => {
                        mirror.insert(change.name.clone(), def.clone());
                    }
                    (ChangeOp::Updated, None) => {
                        tracing::warn!(name = %change.name, "update change without a definition");
                        continue;
                    }
                    (ChangeOp::Deleted, _) => {
                        mirror.remove(&change.name);
                    }
                }
            }
            let _ = self.events.send(change.name.clone());
        }
    }
}

async fn poll_changes(
    client: Arc<RemoteDefinitionClient>,
    mut next_seq: u64,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => return,
            _ = tokio::time::sleep(interval) => {}
        }
        match client.fetch_changes(next_seq).await {
            Ok(changes) => {
                client.apply_changes(&changes).await;
                next_seq = changes.next_seq;
            }
            Err(FetchError::OutdatedCursor) => match client.seed_snapshot().await {
                Ok(seq) => next_seq = seq,
                Err(err) => {
                    tracing::warn!(error = %err, "resnapshot of scope definitions failed");
                }
            },
            Err(err) => {
                // Steady-state fetch failures are non-fatal; the mirror
                // converges on the next successful poll.
                tracing::warn!(error = %err, "scope definition change poll failed");
            }
        }
    }
}

#[async_trait]
impl DefinitionClient for RemoteDefinitionClient {
    async fn get(&self, name: &str) -> ambit_scope::source::Result<Option<ScopeDefinition>> {
        Ok(self.mirror.read().await.get(name).cloned())
    }

    async fn list(&self) -> ambit_scope::source::Result<Vec<ScopeDefinition>> {
        Ok(self.mirror.read().await.values().cloned().collect())
    }

    async fn update_status(
        &self,
        def: ScopeDefinition,
    ) -> ambit_scope::source::Result<ScopeDefinition> {
        let name = def.metadata.name.clone();
        let response = self
            .http
            .put(format!(
                "{}/v1/scopedefinitions/{name}/status",
                self.base_url
            ))
            .json(&def)
            .send()
            .await
            .map_err(|err| SourceError::Unavailable(err.to_string()))?;
        match response.status() {
            StatusCode::OK => {
                let updated: ScopeDefinition = response
                    .json()
                    .await
                    .map_err(|err| SourceError::Unavailable(err.to_string()))?;
                self.mirror
                    .write()
                    .await
                    .insert(updated.metadata.name.clone(), updated.clone());
                let _ = self.events.send(updated.metadata.name.clone());
                Ok(updated)
            }
            StatusCode::CONFLICT => Err(SourceError::Conflict(name)),
            status => Err(SourceError::Unavailable(format!(
                "status update for {name:?} failed: {status}"
            ))),
        }
    }

    fn watch(&self) -> broadcast::Receiver<String> {
        self.events.subscribe()
    }
}
