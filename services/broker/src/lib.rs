pub mod http;
pub mod router;
pub mod state;
pub mod ws;

pub use state::AppState;

use axum::{routing::get, Router};
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Bound on one status request/response cycle.  Upgraded signaling
/// connections are unaffected: the upgrade response itself is immediate and
/// the session runs outside the service stack.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws::root_handler))
        .route("/health", get(http::status::health))
        .route("/clients", get(http::status::clients))
        .fallback(http::status::fallback_404)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state)
}
