//! API server application wiring.
//!
//! Builds the Axum router, installs the scope filter pipeline when request
//! scoping is enabled, and defines the shared application state injected
//! into handlers.
use crate::filters;
use crate::handlers;
use crate::resources::ObjectRegistry;
use ambit_registry::DefinitionRegistry;
use ambit_scope::ScopeResolver;
use axum::{Router, middleware, routing::get};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub server_id: String,
    pub objects: Arc<ObjectRegistry>,
    /// Present only when the request-scoping feature is enabled.
    pub resolver: Option<Arc<dyn ScopeResolver>>,
    /// Scope name used for the bare `?scope=<value>` query form.
    pub default_scope_name: String,
    /// How often watch gates re-check the fleet minimum.
    pub minimum_rv_check_interval: Duration,
}

pub fn build_router(
    state: AppState,
    definitions: Option<Arc<DefinitionRegistry>>,
    metrics: Option<PrometheusHandle>,
) -> Router {
    let scoping_enabled = state.resolver.is_some();

    let mut router = Router::new()
        .route(
            "/apis/:group/:resource",
            get(handlers::list).post(handlers::create),
        )
        .route("/apis/:group/:resource/watch", get(handlers::watch))
        .route("/healthz", get(handlers::health));

    if let Some(handle) = metrics {
        router = router.route("/metrics", get(move || async move { handle.render() }));
    }

    let mut app = router.with_state(state.clone());

    // Loopback deployments host the definition registry in-process.
    if let Some(definitions) = definitions {
        app = app.merge(ambit_registry::http::router(definitions));
    }
    let app = app.layer(TraceLayer::new_for_http());

    if !scoping_enabled {
        return app;
    }

    // The scope filters must run before routing: the path form rewrites the
    // request target, and Router::layer only runs after a route has
    // matched. Wrapping the whole router as a fallback service puts the
    // pipeline in front of route matching.
    Router::new().fallback_service(
        ServiceBuilder::new()
            .layer(middleware::from_fn_with_state(
                state.clone(),
                filters::with_scope_extraction,
            ))
            .layer(middleware::from_fn_with_state(
                state,
                filters::with_scope_resolution,
            ))
            .service(app),
    )
}
