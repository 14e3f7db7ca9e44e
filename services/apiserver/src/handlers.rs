// Resource read/write/watch handlers.
//
// Scoped requests arrive here with an `Arc<ScopeMapping>` extension set by
// the filter pipeline. Reads append the namespace translation to the label
// selector and enforce the per-store resource version floor; watches are
// additionally supervised by a scope watch gate.
use crate::app::AppState;
use crate::error::{ApiError, api_bad_request, api_internal, api_resource_expired};
use crate::resources::{ReadError, ResourceList, ResourceObject};
use crate::scoped_rv::rewrite_scoped_resource_version;
use crate::selectors::{LabelSelector, scope_namespace_requirement};
use ambit_api::GroupResource;
use ambit_scope::{
    ExpireReason, MinimumVersionChecker, ResolveError, ScopeMapping, ScopeResolver, ScopeWatchGate,
};
use axum::Json;
use axum::body::Body;
use axum::extract::{Extension, Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReadParams {
    #[serde(default)]
    label_selector: Option<String>,
    #[serde(default)]
    resource_version: Option<String>,
}

// The `core` path segment maps to the empty API group.
fn group_resource(group: &str, resource: &str) -> GroupResource {
    let group = if group == "core" { "" } else { group };
    GroupResource::new(group, resource)
}

fn parse_read_params(
    params: &ReadParams,
) -> Result<(LabelSelector, Option<u64>), ApiError> {
    let selector = match &params.label_selector {
        Some(raw) => LabelSelector::parse(raw).map_err(|err| api_bad_request(&err.to_string()))?,
        None => LabelSelector::default(),
    };
    let requested_rv = match &params.resource_version {
        Some(raw) => Some(
            ambit_api::parse_resource_version(raw)
                .map_err(|err| api_bad_request(&err.to_string()))?,
        ),
        None => None,
    };
    Ok((selector, requested_rv))
}

// The floor for a scoped read: the fleet minimum for this store, or zero
// while the scope has never transitioned.
async fn scope_floor(
    resolver: &Arc<dyn ScopeResolver>,
    mapping: &ScopeMapping,
    resource: &GroupResource,
) -> Result<u64, ApiError> {
    match resolver
        .minimum_resource_version(mapping.selector(), resource)
        .await
    {
        Ok(minimum) => Ok(minimum),
        Err(ResolveError::MissingMinimum(_)) => Ok(0),
        Err(err) => Err(api_internal(&format!(
            "looking up minimum resource version: {err}"
        ))),
    }
}

pub async fn list(
    State(state): State<AppState>,
    Path((group, resource)): Path<(String, String)>,
    Query(params): Query<ReadParams>,
    mapping: Option<Extension<Arc<ScopeMapping>>>,
) -> Result<Json<ResourceList>, ApiError> {
    let gr = group_resource(&group, &resource);
    let (mut selector, requested_rv) = parse_read_params(&params)?;

    let mut floor = 0;
    if let Some(Extension(mapping)) = &mapping {
        let resolver = state
            .resolver
            .as_ref()
            .ok_or_else(|| api_internal("scoped request without a resolver"))?;
        selector.push(scope_namespace_requirement(&resource, mapping.namespaces()));
        floor = scope_floor(resolver, mapping, &gr).await?;
    }

    let list = state
        .objects
        .list(&gr, &selector, requested_rv, floor)
        .await
        .map_err(read_error)?;
    Ok(Json(list))
}

pub async fn create(
    State(state): State<AppState>,
    Path((group, resource)): Path<(String, String)>,
    mapping: Option<Extension<Arc<ScopeMapping>>>,
    Json(mut object): Json<ResourceObject>,
) -> Result<(StatusCode, Json<ResourceObject>), ApiError> {
    let gr = group_resource(&group, &resource);
    // Scoped clients mark their writes with a generation-prefixed resource
    // version; storage only ever sees the real version.
    let (rewritten, _warned) = rewrite_scoped_resource_version(&object.resource_version);
    object.resource_version = rewritten;

    if let Some(Extension(mapping)) = &mapping {
        // Writes must land inside the scope they were addressed to.
        if !object.namespace.is_empty()
            && !mapping
                .namespaces()
                .iter()
                .any(|namespace| namespace == &object.namespace)
        {
            return Err(api_bad_request(&format!(
                "namespace {:?} is not part of scope {}",
                object.namespace,
                mapping.selector()
            )));
        }
    }

    let created = state.objects.insert(&gr, object).await;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn watch(
    State(state): State<AppState>,
    Path((group, resource)): Path<(String, String)>,
    Query(params): Query<ReadParams>,
    mapping: Option<Extension<Arc<ScopeMapping>>>,
) -> Result<Response, ApiError> {
    let gr = group_resource(&group, &resource);
    let (mut selector, requested_rv) = parse_read_params(&params)?;
    let initial_rv = requested_rv.unwrap_or_else(|| state.objects.current_resource_version(&gr));

    let Some(Extension(mapping)) = mapping else {
        // Unscoped watch: plain event stream, no gate.
        let events = state.objects.subscribe(&gr);
        return Ok(stream_response(events, selector, None));
    };

    let resolver = state
        .resolver
        .clone()
        .ok_or_else(|| api_internal("scoped request without a resolver"))?;
    let floor = scope_floor(&resolver, &mapping, &gr).await?;
    if initial_rv < floor {
        return Err(api_resource_expired(initial_rv, floor));
    }
    selector.push(scope_namespace_requirement(&resource, mapping.namespaces()));

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let gate = ScopeWatchGate::spawn(Arc::clone(&mapping), cancel_rx);
    gate.set_initial_resource_version(initial_rv)
        .map_err(|err| api_internal(&err.to_string()))?;
    let checker = MinimumVersionChecker::spawn(
        resolver,
        Arc::clone(&gate),
        gr.clone(),
        state.minimum_rv_check_interval,
    );

    let events = state.objects.subscribe(&gr);
    Ok(stream_response(
        events,
        selector,
        Some(WatchGuard {
            gate,
            checker,
            cancel_tx,
        }),
    ))
}

// Keeps the gate plumbing alive for the lifetime of the stream task.
struct WatchGuard {
    gate: Arc<ScopeWatchGate>,
    checker: MinimumVersionChecker,
    cancel_tx: watch::Sender<bool>,
}

fn stream_response(
    mut events: tokio::sync::broadcast::Receiver<crate::resources::ResourceEvent>,
    selector: LabelSelector,
    guard: Option<WatchGuard>,
) -> Response {
    let (frame_tx, mut frame_rx) = mpsc::channel::<Bytes>(32);

    tokio::spawn(async move {
        match guard {
            None => loop {
                match events.recv().await {
                    Ok(event) => {
                        if !selector.matches(&event.object.labels) {
                            continue;
                        }
                        if frame_tx.send(added_frame(&event.object)).await.is_err() {
                            return;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            },
            Some(guard) => {
                loop {
                    tokio::select! {
                        cause = guard.gate.terminated() => {
                            if let Some(frame) = termination_frame(&cause) {
                                let _ = frame_tx.send(frame).await;
                            }
                            break;
                        }
                        event = events.recv() => match event {
                            Ok(event) => {
                                if !selector.matches(&event.object.labels) {
                                    continue;
                                }
                                if frame_tx.send(added_frame(&event.object)).await.is_err() {
                                    break;
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
                guard.checker.cancel();
                // Dropping the sender ends the gate's supervisor cleanly if
                // it has not terminated already.
                let _ = guard.cancel_tx.send(true);
            }
        }
    });

    let stream = futures::stream::poll_fn(move |cx| {
        frame_rx
            .poll_recv(cx)
            .map(|frame| frame.map(Ok::<_, std::convert::Infallible>))
    });
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(stream))
        .expect("watch response")
}

fn added_frame(object: &ResourceObject) -> Bytes {
    let mut line = serde_json::json!({ "type": "ADDED", "object": object }).to_string();
    line.push('\n');
    Bytes::from(line)
}

// The final frame of a terminated scoped watch. Clean request exits send no
// error frame.
fn termination_frame(cause: &ExpireReason) -> Option<Bytes> {
    let error = match cause {
        ExpireReason::RequestClosed => return None,
        ExpireReason::ConfigurationChanged => serde_json::json!({
            "code": "resource_expired",
            "message": cause.to_string(),
        }),
        ExpireReason::MinimumRevisionExceeded { initial, minimum } => serde_json::json!({
            "code": "resource_expired",
            "message": cause.to_string(),
            "details": {
                "requested_resource_version": initial.to_string(),
                "minimum_resource_version": minimum.to_string(),
            },
        }),
        ExpireReason::Internal => serde_json::json!({
            "code": "internal",
            "message": cause.to_string(),
        }),
    };
    let mut line = serde_json::json!({ "type": "ERROR", "error": error }).to_string();
    line.push('\n');
    Some(Bytes::from(line))
}

fn read_error(err: ReadError) -> ApiError {
    match err {
        ReadError::ResourceExpired { requested, minimum } => {
            api_resource_expired(requested, minimum)
        }
    }
}

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}
