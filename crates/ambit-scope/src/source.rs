// The scope-definition source seam.
//
// Resolvers are clients of an externally owned ScopeDefinition collection.
// The trait is the narrow waist between this crate and whatever hosts that
// collection: the in-process registry in loopback deployments, an HTTP
// mirror of a remote registry otherwise, and plain fakes in tests.
use ambit_api::ScopeDefinition;
use async_trait::async_trait;
use tokio::sync::broadcast;

pub type Result<T> = std::result::Result<T, SourceError>;

#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    /// Optimistic concurrency failure on a status write; the caller should
    /// re-read and retry.
    #[error("conflict updating scope definition {0:?}")]
    Conflict(String),
    #[error("scope definition source unavailable: {0}")]
    Unavailable(String),
    #[error("invalid scope definition: {0}")]
    Invalid(String),
}

#[async_trait]
pub trait DefinitionClient: Send + Sync {
    /// Fetches one definition by name, or None if it does not exist.
    async fn get(&self, name: &str) -> Result<Option<ScopeDefinition>>;

    /// Lists all definitions. Used for the initial sync and to recover from
    /// a lagged event stream.
    async fn list(&self) -> Result<Vec<ScopeDefinition>>;

    /// Persists a status update, failing with [`SourceError::Conflict`] if
    /// the definition changed since it was read.
    async fn update_status(&self, def: ScopeDefinition) -> Result<ScopeDefinition>;

    /// Subscribes to definition change events. Each event is the name of a
    /// definition that was added, updated or deleted; consumers re-read the
    /// current state through [`DefinitionClient::get`].
    fn watch(&self) -> broadcast::Receiver<String>;
}
