// In-process resource registry: the storage read/write path facade.
//
// Objects live in one of a small number of backing stores, each with its own
// monotone resource version. The scope core only ever sees the stores
// through the `StoreBackend` trait; this module is also where the resource
// version floor from scoped reads is enforced.
use crate::selectors::{LabelSelector, NAME_LABEL, NAMESPACE_LABEL};
use ambit_api::GroupResource;
use ambit_scope::{ResourceStoreMapper, SimpleStoreMapper, StoreBackend, StoreError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, broadcast};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    #[error(
        "resource version {requested} is older than the minimum supported resource version {minimum}"
    )]
    ResourceExpired { requested: u64, minimum: u64 },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceObject {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub resource_version: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceList {
    pub items: Vec<ResourceObject>,
    pub resource_version: String,
}

#[derive(Clone, Debug)]
pub struct ResourceEvent {
    pub resource: GroupResource,
    pub object: ResourceObject,
}

#[derive(Debug)]
struct ResourceStore {
    resource_version: AtomicU64,
    objects: RwLock<HashMap<GroupResource, Vec<ResourceObject>>>,
    events: broadcast::Sender<ResourceEvent>,
}

impl ResourceStore {
    fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            resource_version: AtomicU64::new(0),
            objects: RwLock::new(HashMap::new()),
            events,
        }
    }
}

#[async_trait]
impl StoreBackend for ResourceStore {
    async fn current_resource_version(&self) -> ambit_scope::stores::Result<u64> {
        Ok(self.resource_version.load(Ordering::SeqCst))
    }
}

/// Multi-store object registry keyed by `(group, resource)`.
#[derive(Debug)]
pub struct ObjectRegistry {
    stores: HashMap<String, Arc<ResourceStore>>,
    mapper: Arc<SimpleStoreMapper>,
}

impl ObjectRegistry {
    pub fn new(
        default_store_id: &str,
        overrides: HashMap<GroupResource, String>,
    ) -> Result<Self, StoreError> {
        let mut store_ids: BTreeSet<String> = overrides.values().cloned().collect();
        store_ids.insert(default_store_id.to_string());
        let stores: HashMap<String, Arc<ResourceStore>> = store_ids
            .into_iter()
            .map(|id| (id, Arc::new(ResourceStore::new())))
            .collect();
        let backends: HashMap<String, Arc<dyn StoreBackend>> = stores
            .iter()
            .map(|(id, store)| (id.clone(), Arc::clone(store) as Arc<dyn StoreBackend>))
            .collect();
        let mapper = Arc::new(SimpleStoreMapper::new(default_store_id, overrides, backends)?);
        Ok(Self { stores, mapper })
    }

    pub fn mapper(&self) -> Arc<SimpleStoreMapper> {
        Arc::clone(&self.mapper)
    }

    fn store_for(&self, resource: &GroupResource) -> &Arc<ResourceStore> {
        let store_id = self.mapper.store_for_resource(resource);
        self.stores
            .get(&store_id)
            .expect("mapper returned an unconfigured store id")
    }

    /// Writes an object, assigning it the store's next resource version and
    /// the automatic metadata labels the scope read path filters on.
    pub async fn insert(
        &self,
        resource: &GroupResource,
        mut object: ResourceObject,
    ) -> ResourceObject {
        let store = self.store_for(resource);
        let rv = store.resource_version.fetch_add(1, Ordering::SeqCst) + 1;
        object.resource_version = rv.to_string();
        if resource.resource == "namespaces" {
            object
                .labels
                .insert(NAME_LABEL.to_string(), object.name.clone());
        } else if !object.namespace.is_empty() {
            object
                .labels
                .insert(NAMESPACE_LABEL.to_string(), object.namespace.clone());
        }
        {
            let mut objects = store.objects.write().await;
            let list = objects.entry(resource.clone()).or_default();
            list.retain(|existing| {
                !(existing.name == object.name && existing.namespace == object.namespace)
            });
            list.push(object.clone());
        }
        let _ = store.events.send(ResourceEvent {
            resource: resource.clone(),
            object: object.clone(),
        });
        object
    }

    /// Lists objects matching the selector. Fails with `ResourceExpired`
    /// when the client's requested resource version is below the scope's
    /// per-store floor.
    pub async fn list(
        &self,
        resource: &GroupResource,
        selector: &LabelSelector,
        requested_rv: Option<u64>,
        minimum_rv: u64,
    ) -> Result<ResourceList, ReadError> {
        if let Some(requested) = requested_rv {
            if requested < minimum_rv {
                return Err(ReadError::ResourceExpired {
                    requested,
                    minimum: minimum_rv,
                });
            }
        }
        let store = self.store_for(resource);
        let objects = store.objects.read().await;
        let items = objects
            .get(resource)
            .map(|list| {
                list.iter()
                    .filter(|object| selector.matches(&object.labels))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(ResourceList {
            items,
            resource_version: store.resource_version.load(Ordering::SeqCst).to_string(),
        })
    }

    pub fn subscribe(&self, resource: &GroupResource) -> broadcast::Receiver<ResourceEvent> {
        self.store_for(resource).events.subscribe()
    }

    pub fn current_resource_version(&self, resource: &GroupResource) -> u64 {
        self.store_for(resource)
            .resource_version
            .load(Ordering::SeqCst)
    }
}
