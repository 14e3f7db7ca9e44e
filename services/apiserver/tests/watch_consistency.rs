// End-to-end consistency: generation transitions record per-server
// progress, lists and watches enforce the derived resource version floor,
// and scoped watches terminate when their mapping is superseded.
mod common;

use ambit_api::{GroupResource, ScopeSelector};
use ambit_scope::ScopeResolver;
use axum::http::StatusCode;
use common::{TestCluster, get, read_json};
use std::time::Duration;
use tower::ServiceExt;

async fn wait_for_floor(cluster: &TestCluster, expected: u64) {
    let selector = ScopeSelector::new("workspace", "alpha").expect("selector");
    let pods = GroupResource::new("", "pods");
    for _ in 0..400 {
        if let Ok(minimum) = cluster
            .resolver
            .minimum_resource_version(&selector, &pods)
            .await
        {
            if minimum >= expected {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("floor never reached {expected}");
}

// A generation transition at store version N makes N the fleet floor:
// reads that claim an older version are expired.
#[tokio::test]
async fn generation_transition_enforces_the_resource_version_floor() {
    let cluster = TestCluster::start();
    cluster.define_scope("workspace", "alpha", &["ns-a"]).await;
    for i in 0..3 {
        cluster.add_pod(&format!("pod-{i}"), "ns-a", "foo").await;
    }

    // Advance the scope to a second generation; this server records the
    // store's current version (3) and the admission mutator derives the
    // floor from it.
    cluster
        .define_scope("workspace", "alpha", &["ns-a", "ns-b"])
        .await;
    wait_for_floor(&cluster, 3).await;

    let response = cluster
        .app
        .clone()
        .oneshot(get(
            "/scopes/workspace/alpha/apis/core/pods?resourceVersion=1",
        ))
        .await
        .expect("stale list");
    assert_eq!(response.status(), StatusCode::GONE);
    let body = read_json(response).await;
    assert_eq!(body["code"], "resource_expired");
    assert_eq!(body["details"]["requested_resource_version"], "1");
    assert_eq!(body["details"]["minimum_resource_version"], "3");

    let response = cluster
        .app
        .clone()
        .oneshot(get(
            "/scopes/workspace/alpha/apis/core/pods?resourceVersion=3",
        ))
        .await
        .expect("fresh list");
    assert_eq!(response.status(), StatusCode::OK);
    cluster.stop().await;
}

#[tokio::test]
async fn stale_watch_is_expired_before_streaming() {
    let cluster = TestCluster::start();
    cluster.define_scope("workspace", "alpha", &["ns-a"]).await;
    for i in 0..3 {
        cluster.add_pod(&format!("pod-{i}"), "ns-a", "foo").await;
    }
    cluster
        .define_scope("workspace", "alpha", &["ns-a", "ns-b"])
        .await;
    wait_for_floor(&cluster, 3).await;

    let response = cluster
        .app
        .clone()
        .oneshot(get(
            "/scopes/workspace/alpha/apis/core/pods/watch?resourceVersion=1",
        ))
        .await
        .expect("stale watch");
    assert_eq!(response.status(), StatusCode::GONE);
    let body = read_json(response).await;
    assert_eq!(body["code"], "resource_expired");
    cluster.stop().await;
}

#[tokio::test]
async fn scoped_watch_streams_events_and_terminates_on_reconfiguration() {
    let cluster = TestCluster::start();
    cluster.define_scope("workspace", "alpha", &["ns-a"]).await;

    let response = cluster
        .app
        .clone()
        .oneshot(get("/scopes/workspace/alpha/apis/core/pods/watch"))
        .await
        .expect("watch");
    assert_eq!(response.status(), StatusCode::OK);

    // Give the stream a moment to subscribe, then publish one event into
    // the scope and one outside it.
    tokio::time::sleep(Duration::from_millis(50)).await;
    cluster.add_pod("pod-in", "ns-a", "foo").await;
    cluster.add_pod("pod-out", "ns-z", "foo").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Supersede the mapping: the watch must terminate.
    cluster
        .define_scope("workspace", "alpha", &["ns-a", "ns-c"])
        .await;

    let body = tokio::time::timeout(
        Duration::from_secs(5),
        axum::body::to_bytes(response.into_body(), usize::MAX),
    )
    .await
    .expect("watch terminated")
    .expect("body");
    let text = String::from_utf8(body.to_vec()).expect("utf8");
    let frames: Vec<serde_json::Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).expect("frame"))
        .collect();

    assert!(
        frames
            .iter()
            .any(|frame| frame["type"] == "ADDED" && frame["object"]["name"] == "pod-in"),
        "missing ADDED frame in {text:?}"
    );
    assert!(
        !frames
            .iter()
            .any(|frame| frame["object"]["name"] == "pod-out"),
        "event leaked from outside the scope: {text:?}"
    );
    let last = frames.last().expect("frames");
    assert_eq!(last["type"], "ERROR");
    assert_eq!(last["error"]["code"], "resource_expired");
    assert_eq!(last["error"]["message"], "scope configuration changed");
    cluster.stop().await;
}

// A watch that starts below a floor raised mid-stream is torn down by the
// minimum version checker with both versions in the error.
#[tokio::test]
async fn floor_raised_mid_watch_expires_the_stream() {
    let cluster = TestCluster::start();
    cluster.define_scope("workspace", "alpha", &["ns-a"]).await;

    // Start a watch pinned at the store's current version (0).
    let response = cluster
        .app
        .clone()
        .oneshot(get(
            "/scopes/workspace/alpha/apis/core/pods/watch?resourceVersion=0",
        ))
        .await
        .expect("watch");
    assert_eq!(response.status(), StatusCode::OK);

    // Move the store forward and roll the scope twice: the second
    // transition records a floor above the watch's starting point. The
    // parent of this watch is generation one, so it expires first with
    // "scope configuration changed"; a watch on the *new* mapping would
    // instead trip the floor. Either way this stream must end.
    for i in 0..5 {
        cluster.add_pod(&format!("pod-{i}"), "ns-a", "foo").await;
    }
    cluster
        .define_scope("workspace", "alpha", &["ns-a", "ns-b"])
        .await;

    let body = tokio::time::timeout(
        Duration::from_secs(5),
        axum::body::to_bytes(response.into_body(), usize::MAX),
    )
    .await
    .expect("watch terminated")
    .expect("body");
    let text = String::from_utf8(body.to_vec()).expect("utf8");
    let last: serde_json::Value =
        serde_json::from_str(text.lines().last().expect("frames")).expect("frame");
    assert_eq!(last["type"], "ERROR");
    assert_eq!(last["error"]["code"], "resource_expired");
    cluster.stop().await;
}

// A watch that starts exactly at the floor is accepted and stays open: the
// checker keeps confirming `initial >= minimum` without terminating it.
#[tokio::test]
async fn watch_at_the_floor_stays_open() {
    let cluster = TestCluster::start();
    cluster.define_scope("workspace", "alpha", &["ns-a"]).await;
    for i in 0..3 {
        cluster.add_pod(&format!("pod-{i}"), "ns-a", "foo").await;
    }
    cluster
        .define_scope("workspace", "alpha", &["ns-a", "ns-b"])
        .await;
    wait_for_floor(&cluster, 3).await;

    // Cancel it client-side by dropping the body.
    let response = cluster
        .app
        .clone()
        .oneshot(get(
            "/scopes/workspace/alpha/apis/core/pods/watch?resourceVersion=3",
        ))
        .await
        .expect("watch at floor");
    assert_eq!(response.status(), StatusCode::OK);
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(response);
    cluster.stop().await;
}
