use crate::state::AppState;
use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{SecondsFormat, Utc};
use dl_protocol::{ClientCounts, ClientsResponse, HttpError, MessageCounts, StatusResponse};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;

/// The broker sits behind a trusted terminator that forwards the
/// originating address; honor the first `X-Forwarded-For` entry when
/// present, otherwise fall back to the socket address.  An unparseable
/// forwarded address is treated as non-loopback.
pub(crate) fn is_loopback_caller(headers: &HeaderMap, peer: SocketAddr) -> bool {
    if let Some(raw) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        return raw
            .split(',')
            .next()
            .map(str::trim)
            .and_then(|s| s.parse::<IpAddr>().ok())
            .is_some_and(|ip| ip.is_loopback());
    }
    peer.ip().is_loopback()
}

pub(crate) async fn status_response(state: &AppState, loopback: bool) -> Json<StatusResponse> {
    let clients = state.client_list().await;
    let (total, by_type) = state.message_counts().await;
    Json(StatusResponse {
        status: "healthy".to_owned(),
        clients: ClientCounts {
            current: clients.len(),
            total: state.metrics.total_connections.load(Ordering::Relaxed),
            list: loopback.then_some(clients),
        },
        messages: MessageCounts { total, by_type },
        uptime: state.uptime_secs(),
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}

pub async fn health(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    status_response(&state, is_loopback_caller(&headers, remote))
        .await
        .into_response()
}

/// Registered-identity list, restricted to loopback callers.
pub async fn clients(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    if !is_loopback_caller(&headers, remote) {
        return (
            StatusCode::FORBIDDEN,
            Json(HttpError {
                error: "Forbidden".to_owned(),
            }),
        )
            .into_response();
    }
    Json(ClientsResponse {
        clients: state.client_list().await,
    })
    .into_response()
}

pub async fn fallback_404() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(HttpError {
            error: "Not found".to_owned(),
        }),
    )
}
