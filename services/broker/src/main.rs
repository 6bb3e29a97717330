use broker::state::AppState;
use dl_protocol::close_codes;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// Hard deadline for the drain after a termination signal.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::new(log_level))
        .with_writer(std::io::stderr.with_max_level(Level::ERROR).or_else(std::io::stdout))
        .init();

    let port = env::var("PORT").unwrap_or_else(|_| "8080".to_owned());
    let bind_addr = format!("0.0.0.0:{port}");

    let state = AppState::new();
    state.spawn_bucket_sweeper();
    let router = broker::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %bind_addr, "broker listening");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown(state))
    .await
    .expect("server error");
    info!("broker shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT), arms the drain watchdog, then
/// closes every registered channel before handing control back to the
/// graceful shutdown of the listener.  The watchdog is armed first so the
/// hard deadline holds no matter how the drain behaves.
async fn shutdown(state: AppState) {
    shutdown_signal().await;
    tokio::spawn(async {
        tokio::time::sleep(SHUTDOWN_DEADLINE).await;
        error!("drain deadline exceeded, forcing exit");
        std::process::exit(1);
    });
    state
        .close_all(close_codes::GOING_AWAY, "Server shutting down")
        .await;
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
