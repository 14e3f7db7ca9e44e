// Ambit resource API server.
//
// Serves a multi-tenant resource API with optional request scoping: clients
// address a scope (query parameter, path prefix, or field selector) and the
// server transparently translates it into a namespace filter backed by a
// fleet-consistent mapping revision.
//
// Scope definitions come either from an in-process registry (loopback, the
// default) or from a remote registry mirrored over HTTP. Either way a
// resolver reconciles them into live mappings and reports this server's
// per-store progress back into the definition status.
use ambit_registry::{DefinitionRegistry, ScopeController};
use ambit_scope::{DefaultScopeResolver, DefinitionClient, ResourceStoreMapper, ScopeResolver};
use anyhow::Context;
use apiserver::app::{AppState, build_router};
use apiserver::config::ApiServerConfig;
use apiserver::observability::init_observability;
use apiserver::remote::RemoteDefinitionClient;
use apiserver::resources::ObjectRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const REMOTE_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ApiServerConfig::from_env_or_yaml()?;
    config.validate()?;
    let metrics = init_observability();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Resources live in the configured stores even when scoping is off;
    // without the feature flag there is just the single default store.
    let (default_store_id, overrides) = if config.request_scoping {
        let store_id = config
            .resource_store_id
            .clone()
            .context("resource store id required with request scoping enabled")?;
        (store_id, config.override_resource_store_ids.clone())
    } else {
        ("default".to_string(), Default::default())
    };
    let objects = Arc::new(
        ObjectRegistry::new(&default_store_id, overrides)
            .context("build resource store mapper")?,
    );

    let mut resolver: Option<Arc<dyn ScopeResolver>> = None;
    let mut loopback_definitions: Option<Arc<DefinitionRegistry>> = None;

    if config.request_scoping {
        let mapper = objects.mapper();
        // Probe every configured store up front; serving with an
        // unreachable store would hand out wrong consistency floors.
        for store_id in mapper.stores() {
            mapper
                .current_resource_version(&store_id)
                .await
                .with_context(|| format!("probe store {store_id:?}"))?;
        }

        let definitions: Arc<dyn DefinitionClient> = match &config.scope_registry_url {
            Some(url) => {
                let remote =
                    RemoteDefinitionClient::connect(url, REMOTE_POLL_INTERVAL, shutdown_rx.clone())
                        .await?;
                tracing::info!(registry = %url, "mirroring scope definitions from remote registry");
                remote
            }
            None => {
                // Loopback: host the registry and its controller in-process.
                let registry = Arc::new(DefinitionRegistry::new());
                let controller = ScopeController::new(Arc::clone(&registry));
                let controller_shutdown = shutdown_rx.clone();
                tokio::spawn(async move { controller.run(controller_shutdown).await });
                loopback_definitions = Some(Arc::clone(&registry));
                registry
            }
        };

        let scope_resolver = Arc::new(DefaultScopeResolver::new(
            config.server_id.clone(),
            definitions,
            mapper as Arc<dyn ResourceStoreMapper>,
        ));
        {
            let scope_resolver = Arc::clone(&scope_resolver);
            let resolver_shutdown = shutdown_rx.clone();
            tokio::spawn(async move { scope_resolver.run(resolver_shutdown).await });
        }
        resolver = Some(scope_resolver);
    }

    let state = AppState {
        server_id: config.server_id.clone(),
        objects,
        resolver,
        default_scope_name: config.default_scope_name.clone(),
        minimum_rv_check_interval: config.minimum_rv_check_interval,
    };
    let app = build_router(state, loopback_definitions, Some(metrics));

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("bind {}", config.bind_addr))?;
    tracing::info!(
        addr = %config.bind_addr,
        server_id = %config.server_id,
        request_scoping = config.request_scoping,
        "api server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("serve api")?;
    Ok(())
}
