// Shared harness: a single-process cluster with the loopback registry, the
// status controller, and a running resolver behind the real router.
use ambit_registry::{DefinitionRegistry, ScopeController};
use ambit_scope::{DefaultScopeResolver, DefinitionClient, ResourceStoreMapper, ScopeResolver};
use apiserver::app::{AppState, build_router};
use apiserver::resources::{ObjectRegistry, ResourceObject};
use axum::Router;
use axum::body::Body;
use axum::http::Request;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub struct TestCluster {
    pub registry: Arc<DefinitionRegistry>,
    pub objects: Arc<ObjectRegistry>,
    pub resolver: Arc<DefaultScopeResolver>,
    pub app: Router,
    shutdown: watch::Sender<bool>,
}

impl TestCluster {
    pub fn start() -> Self {
        let registry = Arc::new(DefinitionRegistry::new());
        let objects = Arc::new(ObjectRegistry::new("store-x", Default::default()).expect("objects"));
        let resolver = Arc::new(DefaultScopeResolver::new(
            "server-1",
            Arc::clone(&registry) as Arc<dyn DefinitionClient>,
            objects.mapper() as Arc<dyn ResourceStoreMapper>,
        ));

        let (shutdown, shutdown_rx) = watch::channel(false);
        {
            let controller = ScopeController::new(Arc::clone(&registry));
            let controller_shutdown = shutdown_rx.clone();
            tokio::spawn(async move { controller.run(controller_shutdown).await });
        }
        {
            let resolver = Arc::clone(&resolver);
            tokio::spawn(async move { resolver.run(shutdown_rx).await });
        }

        let state = AppState {
            server_id: "server-1".to_string(),
            objects: Arc::clone(&objects),
            resolver: Some(Arc::clone(&resolver) as Arc<dyn ScopeResolver>),
            default_scope_name: "workspace".to_string(),
            minimum_rv_check_interval: Duration::from_millis(20),
        };
        let app = build_router(state, Some(Arc::clone(&registry)), None);

        Self {
            registry,
            objects,
            resolver,
            app,
            shutdown,
        }
    }

    /// Authors a scope definition and waits until this server resolves it
    /// with the expected served namespace set.
    pub async fn define_scope(&self, name: &str, value: &str, namespaces: &[&str]) -> String {
        let definition_name = format!("{name}:{value}");
        self.registry
            .upsert_spec(
                &definition_name,
                ambit_api::ScopeDefinitionSpec {
                    namespaces: namespaces.iter().map(|s| s.to_string()).collect(),
                },
            )
            .await
            .expect("upsert spec");
        let mut expected: Vec<String> = namespaces.iter().map(|s| s.to_string()).collect();
        expected.sort();
        expected.dedup();
        for _ in 0..400 {
            if let Ok(mapping) = self.resolver.resolve(name, value).await {
                if mapping.namespaces() == expected.as_slice() && !mapping.is_expired() {
                    return mapping.scope_id().to_string();
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("scope {name}={value} never resolved to {expected:?}");
    }

    pub async fn add_pod(&self, name: &str, namespace: &str, app_label: &str) {
        let mut object = ResourceObject {
            name: name.to_string(),
            namespace: namespace.to_string(),
            ..Default::default()
        };
        object
            .labels
            .insert("app".to_string(), app_label.to_string());
        self.objects
            .insert(&ambit_api::GroupResource::new("", "pods"), object)
            .await;
    }

    pub async fn add_namespace(&self, name: &str) {
        self.objects
            .insert(
                &ambit_api::GroupResource::new("", "namespaces"),
                ResourceObject {
                    name: name.to_string(),
                    ..Default::default()
                },
            )
            .await;
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
    }
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

pub fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

pub async fn read_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

/// Names of the items in a list response, sorted.
pub fn item_names(list: &serde_json::Value) -> Vec<String> {
    let mut names: Vec<String> = list["items"]
        .as_array()
        .expect("items")
        .iter()
        .map(|item| item["name"].as_str().expect("name").to_string())
        .collect();
    names.sort();
    names
}
