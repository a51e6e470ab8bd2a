#![allow(dead_code)]

//! In-process mock cluster node used by the integration tests.
//!
//! Serves the handful of endpoints the client talks to (topology,
//! stats, hilo next/return) on an ephemeral port, with switches to
//! simulate outages, conflicts, and a missing database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub struct NodeState {
    cluster_tag: String,
    failing: AtomicBool,
    missing_database: AtomicBool,
    request_refresh: AtomicBool,
    topology_body: Mutex<Option<String>>,
    topology_hits: AtomicU64,
    stats_hits: AtomicU64,
    hilo_hits: AtomicU64,
    hilo_counter: AtomicI64,
    hilo_batch: AtomicI64,
    hilo_conflicts: AtomicI64,
    last_next_params: Mutex<Option<HashMap<String, String>>>,
    returned_ranges: Mutex<Vec<(String, i64, i64)>>,
}

pub struct MockNode {
    url: String,
    state: Arc<NodeState>,
    server: JoinHandle<()>,
}

impl MockNode {
    pub async fn start(cluster_tag: &str) -> Self {
        let state = Arc::new(NodeState {
            cluster_tag: cluster_tag.to_string(),
            failing: AtomicBool::new(false),
            missing_database: AtomicBool::new(false),
            request_refresh: AtomicBool::new(false),
            topology_body: Mutex::new(None),
            topology_hits: AtomicU64::new(0),
            stats_hits: AtomicU64::new(0),
            hilo_hits: AtomicU64::new(0),
            hilo_counter: AtomicI64::new(0),
            hilo_batch: AtomicI64::new(32),
            hilo_conflicts: AtomicI64::new(0),
            last_next_params: Mutex::new(None),
            returned_ranges: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/databases/:db/topology", get(get_topology))
            .route("/databases/:db/stats", get(get_stats))
            .route("/databases/:db/hilo/next", get(hilo_next))
            .route("/databases/:db/hilo/return", put(hilo_return))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("http://{}", addr),
            state,
            server,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn cluster_tag(&self) -> &str {
        &self.state.cluster_tag
    }

    /// Serve this topology document from the topology endpoint.
    pub fn set_topology(&self, body: String) {
        *self.state.topology_body.lock().unwrap() = Some(body);
    }

    /// When set, every endpoint answers 503.
    pub fn set_failing(&self, failing: bool) {
        self.state.failing.store(failing, Ordering::SeqCst);
    }

    /// When set, every endpoint answers 500 with the Database-Missing
    /// header.
    pub fn set_missing_database(&self, missing: bool) {
        self.state.missing_database.store(missing, Ordering::SeqCst);
    }

    /// When set, stats responses carry a Refresh-Topology: true header.
    pub fn set_request_refresh(&self, refresh: bool) {
        self.state.request_refresh.store(refresh, Ordering::SeqCst);
    }

    /// Size of the ranges the hilo endpoint hands out.
    pub fn set_hilo_batch(&self, batch: i64) {
        self.state.hilo_batch.store(batch, Ordering::SeqCst);
    }

    /// Make the next `count` hilo range requests answer 409.
    pub fn set_hilo_conflicts(&self, count: i64) {
        self.state.hilo_conflicts.store(count, Ordering::SeqCst);
    }

    pub fn topology_hits(&self) -> u64 {
        self.state.topology_hits.load(Ordering::SeqCst)
    }

    pub fn stats_hits(&self) -> u64 {
        self.state.stats_hits.load(Ordering::SeqCst)
    }

    pub fn hilo_hits(&self) -> u64 {
        self.state.hilo_hits.load(Ordering::SeqCst)
    }

    /// Query parameters of the most recent hilo next-range request.
    pub fn last_next_params(&self) -> Option<HashMap<String, String>> {
        self.state.last_next_params.lock().unwrap().clone()
    }

    /// Ranges handed back via the return endpoint, as (tag, end, last).
    pub fn returned_ranges(&self) -> Vec<(String, i64, i64)> {
        self.state.returned_ranges.lock().unwrap().clone()
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// Topology document listing the given nodes in order.
pub fn topology_body(etag: i64, database: &str, nodes: &[&MockNode]) -> String {
    let entries: Vec<_> = nodes
        .iter()
        .map(|node| {
            json!({
                "Url": node.url(),
                "Database": database,
                "ClusterTag": node.cluster_tag(),
            })
        })
        .collect();
    json!({ "Etag": etag, "Nodes": entries }).to_string()
}

/// Poll a condition until it holds or the timeout elapses.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

fn outage(state: &NodeState, db: &str) -> Option<Response> {
    if state.missing_database.load(Ordering::SeqCst) {
        return Some(
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("Database-Missing", db.to_string())],
                "database does not exist",
            )
                .into_response(),
        );
    }
    if state.failing.load(Ordering::SeqCst) {
        return Some((StatusCode::SERVICE_UNAVAILABLE, "node is down").into_response());
    }
    None
}

async fn get_topology(State(state): State<Arc<NodeState>>, Path(db): Path<String>) -> Response {
    state.topology_hits.fetch_add(1, Ordering::SeqCst);
    if let Some(response) = outage(&state, &db) {
        return response;
    }
    match state.topology_body.lock().unwrap().clone() {
        Some(body) => (
            StatusCode::OK,
            [("Content-Type", "application/json")],
            body,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn get_stats(State(state): State<Arc<NodeState>>, Path(db): Path<String>) -> Response {
    state.stats_hits.fetch_add(1, Ordering::SeqCst);
    if let Some(response) = outage(&state, &db) {
        return response;
    }

    let body = Json(json!({ "CountOfDocuments": 0 }));
    if state.request_refresh.load(Ordering::SeqCst) {
        (StatusCode::OK, [("Refresh-Topology", "true")], body).into_response()
    } else {
        (StatusCode::OK, body).into_response()
    }
}

async fn hilo_next(
    State(state): State<Arc<NodeState>>,
    Path(db): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    state.hilo_hits.fetch_add(1, Ordering::SeqCst);
    if let Some(response) = outage(&state, &db) {
        return response;
    }

    *state.last_next_params.lock().unwrap() = Some(params.clone());

    if state.hilo_conflicts.fetch_sub(1, Ordering::SeqCst) > 0 {
        return (
            StatusCode::CONFLICT,
            Json(json!({
                "Type": "ConcurrencyException",
                "Message": "hilo range was taken by another client",
            })),
        )
            .into_response();
    }

    let tag = params.get("tag").cloned().unwrap_or_default();
    let separator = params
        .get("identityPartsSeparator")
        .cloned()
        .unwrap_or_else(|| "/".to_string());
    let batch = state.hilo_batch.load(Ordering::SeqCst);
    let high = state.hilo_counter.fetch_add(batch, Ordering::SeqCst) + batch;
    let low = high - batch + 1;

    (
        StatusCode::OK,
        Json(json!({
            "Prefix": format!("{}{}", tag, separator),
            "ServerTag": state.cluster_tag,
            "Low": low,
            "High": high,
            "LastSize": batch,
            "LastRangeAt": "2024-05-08T05:20:31.0000000Z",
        })),
    )
        .into_response()
}

async fn hilo_return(
    State(state): State<Arc<NodeState>>,
    Path(db): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let Some(response) = outage(&state, &db) {
        return response;
    }

    let tag = params.get("tag").cloned().unwrap_or_default();
    let end = params.get("end").and_then(|v| v.parse().ok()).unwrap_or(-1);
    let last = params.get("last").and_then(|v| v.parse().ok()).unwrap_or(-1);
    state.returned_ranges.lock().unwrap().push((tag, end, last));

    StatusCode::OK.into_response()
}
