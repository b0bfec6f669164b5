//! HTTP surface
//!
//! A thin `axum` router over the aggregator, calendar store, backup
//! producer, and stamper — handlers just pick the right response shape and
//! status code, all the actual work happens in those components. Grounded
//! on `otsserver/rpc.py`'s `RPCRequestHandler`: the same five endpoints,
//! the same cache-control split between "will never change" and
//! "check back soon" responses.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::aggregator::Aggregator;
use crate::backup::{Backup, BackupError};
use crate::calendar_store::{CalendarStore, StoreError};
use crate::ots::{Serializer, Timestamp};
use crate::stamper::{PendingReason, StamperHandle};

/// Largest digest a client may `POST` to `/digest`, matching the Python
/// server's own limit.
const MAX_DIGEST_LENGTH: usize = 64;

/// Shared state every handler reads from.
#[derive(Clone)]
pub struct AppState {
    uri: String,
    /// `None` for a pure backup mirror, which runs no aggregator of its
    /// own and so never accepts `/digest` submissions.
    aggregator: Option<Aggregator>,
    store: CalendarStore,
    backup: Arc<Backup>,
    /// `None` for a pure backup mirror, which runs no stamper of its own.
    stamper: Option<StamperHandle>,
}

impl AppState {
    #[must_use]
    pub fn new(
        uri: String,
        aggregator: Option<Aggregator>,
        store: CalendarStore,
        backup: Arc<Backup>,
        stamper: Option<StamperHandle>,
    ) -> Self {
        Self { uri, aggregator, store, backup, stamper }
    }
}

/// Build the router: `POST /digest`, `GET /timestamp/{hex}`, `GET /tip`,
/// `GET /experimental/backup/{n}`, `GET /status`.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/digest", post(post_digest))
        .route("/timestamp/:hex", get(get_timestamp))
        .route("/tip", get(get_tip))
        .route("/experimental/backup/:n", get(get_backup_chunk))
        .route("/status", get(get_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn post_digest(State(state): State<AppState>, body: Bytes) -> Response {
    if body.len() > MAX_DIGEST_LENGTH {
        return (StatusCode::BAD_REQUEST, "digest too long").into_response();
    }
    let Some(aggregator) = &state.aggregator else {
        return (StatusCode::NOT_FOUND, "this calendar is a read-only mirror").into_response();
    };

    match aggregator.submit(body.to_vec()).await {
        Ok(timestamp) => match serialize(&timestamp) {
            Ok(bytes) => octet_stream(StatusCode::OK, bytes, None),
            Err(err) => {
                log::error!("failed to serialize submitted timestamp: {err}");
                (StatusCode::INTERNAL_SERVER_ERROR, "serialization error").into_response()
            }
        },
        Err(err) => {
            log::error!("aggregator submit failed: {err}");
            (StatusCode::SERVICE_UNAVAILABLE, "aggregator unavailable").into_response()
        }
    }
}

async fn get_timestamp(State(state): State<AppState>, Path(hex): Path<String>) -> Response {
    let Ok(commitment) = hex::decode(&hex) else {
        return (StatusCode::BAD_REQUEST, "commitment must be hex-encoded bytes").into_response();
    };

    match state.store.get(&commitment) {
        Ok(timestamp) => match serialize(&timestamp) {
            Ok(bytes) => octet_stream(StatusCode::OK, bytes, Some("public, max-age=3600")),
            Err(err) => {
                log::error!("failed to serialize stored timestamp: {err}");
                (StatusCode::INTERNAL_SERVER_ERROR, "serialization error").into_response()
            }
        },
        Err(StoreError::NotFound(_)) => {
            let reason = state.stamper.as_ref().and_then(|s| s.status().reason_for(&commitment).cloned());
            let body = match reason {
                Some(PendingReason::Ingested | PendingReason::InMempool { .. }) => {
                    "Pending confirmation in Bitcoin blockchain".to_string()
                }
                Some(PendingReason::WaitingConfirmations { txid, confirmations_left }) => format!(
                    "Timestamped by transaction {txid}; waiting for {confirmations_left} more confirmations"
                ),
                None => "Not found".to_string(),
            };
            (StatusCode::NOT_FOUND, [(header::CACHE_CONTROL, "public, max-age=60")], body).into_response()
        }
        Err(err) => {
            log::error!("calendar store lookup failed: {err}");
            (StatusCode::INTERNAL_SERVER_ERROR, "store error").into_response()
        }
    }
}

async fn get_tip(State(state): State<AppState>) -> Response {
    let Some(stamper) = &state.stamper else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match stamper.status().tip {
        Some(tip) => octet_stream(StatusCode::OK, tip, Some("public, max-age=10")),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn get_backup_chunk(State(state): State<AppState>, Path(n): Path<u64>) -> Response {
    match state.backup.get_chunk(n) {
        Ok(bytes) => octet_stream(StatusCode::OK, bytes, Some("public, max-age=31536000")),
        Err(BackupError::NotFound(_)) => (StatusCode::NOT_FOUND, "chunk not yet available").into_response(),
        Err(err) => {
            log::error!("backup chunk {n} failed: {err}");
            (StatusCode::INTERNAL_SERVER_ERROR, "backup error").into_response()
        }
    }
}

#[derive(Serialize)]
struct Status {
    uri: String,
    is_mirror: bool,
    pending_commitments: usize,
    has_unconfirmed_tip: bool,
}

async fn get_status(State(state): State<AppState>) -> Response {
    let stamper_status = state.stamper.as_ref().map(|s| s.status());
    let body = Status {
        uri: state.uri,
        is_mirror: state.aggregator.is_none(),
        pending_commitments: stamper_status.as_ref().map_or(0, |s| s.pending.len()),
        has_unconfirmed_tip: stamper_status.is_some_and(|s| s.tip.is_some()),
    };
    axum::Json(body).into_response()
}

fn serialize(timestamp: &Timestamp) -> crate::ots::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut ser = Serializer::new(&mut buf);
    timestamp.serialize_recursive(&mut ser)?;
    Ok(buf)
}

fn octet_stream(status: StatusCode, bytes: Vec<u8>, cache_control: Option<&'static str>) -> Response {
    let headers = [(header::CONTENT_TYPE, "application/octet-stream")];
    match cache_control {
        Some(cache_control) => {
            (status, headers, [(header::CACHE_CONTROL, cache_control)], bytes).into_response()
        }
        None => (status, headers, bytes).into_response(),
    }
}
