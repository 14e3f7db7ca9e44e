// Physical storage topology behind a small interface.
//
// The resolver never talks to a backing store directly; it asks the mapper
// which store a resource lives in and what that store's current resource
// version is. Stores are opaque string identifiers.
use ambit_api::GroupResource;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("unrecognised store id {0:?}")]
    UnknownStore(String),
    #[error("store {store_id:?} unavailable: {message}")]
    Unavailable { store_id: String, message: String },
    #[error("invalid store configuration: {0}")]
    InvalidConfiguration(String),
}

/// A single backing store. Implementations must issue bounded reads; the
/// returned future is the cancellation point.
#[async_trait]
pub trait StoreBackend: Debug + Send + Sync {
    /// The store's current monotone resource version.
    async fn current_resource_version(&self) -> Result<u64>;
}

/// Maps `(group, resource)` pairs to the store they live in and exposes each
/// store's progress.
#[async_trait]
pub trait ResourceStoreMapper: Send + Sync {
    /// The store id for a resource. Falls back to the default store; never
    /// fails.
    fn store_for_resource(&self, resource: &GroupResource) -> String;

    /// All configured store ids (default plus overrides). Order irrelevant.
    fn stores(&self) -> Vec<String>;

    /// Current resource version of the named store.
    async fn current_resource_version(&self, store_id: &str) -> Result<u64>;
}

/// Static default-plus-overrides mapper over a table of backends.
#[derive(Debug)]
pub struct SimpleStoreMapper {
    default_store_id: String,
    overrides: HashMap<GroupResource, String>,
    backends: HashMap<String, Arc<dyn StoreBackend>>,
}

impl SimpleStoreMapper {
    pub fn new(
        default_store_id: impl Into<String>,
        overrides: HashMap<GroupResource, String>,
        backends: HashMap<String, Arc<dyn StoreBackend>>,
    ) -> Result<Self> {
        let default_store_id = default_store_id.into();
        if default_store_id.is_empty() {
            return Err(StoreError::InvalidConfiguration(
                "default store id must not be empty".into(),
            ));
        }
        if !backends.contains_key(&default_store_id) {
            return Err(StoreError::InvalidConfiguration(format!(
                "no backend configured for default store {default_store_id:?}"
            )));
        }
        for (resource, store_id) in &overrides {
            if store_id == &default_store_id {
                return Err(StoreError::InvalidConfiguration(format!(
                    "override for {resource} shadows the default store {default_store_id:?}"
                )));
            }
            if !backends.contains_key(store_id) {
                return Err(StoreError::InvalidConfiguration(format!(
                    "no backend configured for override store {store_id:?} ({resource})"
                )));
            }
        }
        Ok(Self {
            default_store_id,
            overrides,
            backends,
        })
    }

    pub fn default_store_id(&self) -> &str {
        &self.default_store_id
    }
}

#[async_trait]
impl ResourceStoreMapper for SimpleStoreMapper {
    fn store_for_resource(&self, resource: &GroupResource) -> String {
        self.overrides
            .get(resource)
            .cloned()
            .unwrap_or_else(|| self.default_store_id.clone())
    }

    fn stores(&self) -> Vec<String> {
        let mut ids: BTreeSet<&String> = self.overrides.values().collect();
        ids.insert(&self.default_store_id);
        ids.into_iter().cloned().collect()
    }

    async fn current_resource_version(&self, store_id: &str) -> Result<u64> {
        let backend = self
            .backends
            .get(store_id)
            .ok_or_else(|| StoreError::UnknownStore(store_id.to_string()))?;
        backend.current_resource_version().await
    }
}

/// Backend over a plain counter. Used in tests and anywhere the store's
/// progress is tracked in-process.
#[derive(Debug, Default)]
pub struct FixedStoreBackend {
    resource_version: AtomicU64,
}

impl FixedStoreBackend {
    pub fn new(resource_version: u64) -> Self {
        Self {
            resource_version: AtomicU64::new(resource_version),
        }
    }

    pub fn set(&self, resource_version: u64) {
        self.resource_version
            .store(resource_version, Ordering::SeqCst);
    }

    pub fn advance(&self) -> u64 {
        self.resource_version.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl StoreBackend for FixedStoreBackend {
    async fn current_resource_version(&self) -> Result<u64> {
        Ok(self.resource_version.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backends(ids: &[&str]) -> HashMap<String, Arc<dyn StoreBackend>> {
        ids.iter()
            .map(|id| {
                (
                    id.to_string(),
                    Arc::new(FixedStoreBackend::new(1)) as Arc<dyn StoreBackend>,
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn resolves_overrides_with_default_fallback() {
        let mut overrides = HashMap::new();
        overrides.insert(GroupResource::new("events.k8s.io", "events"), "store-b".to_string());
        let mapper = SimpleStoreMapper::new("store-a", overrides, backends(&["store-a", "store-b"]))
            .expect("mapper");

        assert_eq!(
            mapper.store_for_resource(&GroupResource::new("events.k8s.io", "events")),
            "store-b"
        );
        assert_eq!(
            mapper.store_for_resource(&GroupResource::new("", "pods")),
            "store-a"
        );

        let mut stores = mapper.stores();
        stores.sort();
        assert_eq!(stores, vec!["store-a", "store-b"]);
    }

    #[tokio::test]
    async fn rejects_missing_backends_and_shadowed_defaults() {
        let err = SimpleStoreMapper::new("store-a", HashMap::new(), backends(&["store-b"]))
            .expect_err("missing default backend");
        assert!(matches!(err, StoreError::InvalidConfiguration(_)));

        let mut overrides = HashMap::new();
        overrides.insert(GroupResource::new("", "pods"), "store-a".to_string());
        let err = SimpleStoreMapper::new("store-a", overrides, backends(&["store-a"]))
            .expect_err("override shadows default");
        assert!(matches!(err, StoreError::InvalidConfiguration(_)));
    }

    #[tokio::test]
    async fn current_resource_version_reads_the_backend() {
        let backend = Arc::new(FixedStoreBackend::new(41));
        let mut table: HashMap<String, Arc<dyn StoreBackend>> = HashMap::new();
        table.insert("store-a".to_string(), Arc::clone(&backend) as _);
        let mapper = SimpleStoreMapper::new("store-a", HashMap::new(), table).expect("mapper");

        assert_eq!(
            mapper.current_resource_version("store-a").await.expect("rv"),
            41
        );
        backend.advance();
        assert_eq!(
            mapper.current_resource_version("store-a").await.expect("rv"),
            42
        );
        assert!(matches!(
            mapper.current_resource_version("store-x").await,
            Err(StoreError::UnknownStore(_))
        ));
    }
}
