use crate::http::status::{is_loopback_caller, status_response};
use crate::router;
use crate::state::{AppState, PeerCommand, PeerHandle, RegisterOutcome};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use dl_protocol::{
    classify, close_codes, error_tags, validate_peer_id, Envelope, EnvelopeClass, ServerMessage,
    MAX_FRAME_BYTES,
};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Transport-level liveness probe cadence, independent of `ping` envelopes.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

const ALREADY_CONNECTED_MESSAGE: &str =
    "Un client est déjà connecté sous ce nom. Fermez l'onglet actif avant de vous reconnecter.";

/// `GET /` serves double duty: a WebSocket upgrade starts a signaling
/// session, anything else is answered by the status surface.  Both surfaces
/// share the one listener.
pub async fn root_handler(
    ws: Option<WebSocketUpgrade>,
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    match ws {
        Some(upgrade) => upgrade
            .max_message_size(MAX_FRAME_BYTES)
            .max_frame_size(MAX_FRAME_BYTES)
            .on_upgrade(move |socket| handle_socket(socket, state, remote))
            .into_response(),
        None => status_response(&state, is_loopback_caller(&headers, remote))
            .await
            .into_response(),
    }
}

pub(crate) async fn send_server(
    socket: &mut WebSocket,
    msg: &ServerMessage,
) -> Result<(), axum::Error> {
    if let Ok(json) = serde_json::to_string(msg) {
        socket.send(Message::Text(json)).await?;
    }
    Ok(())
}

async fn send_close(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn handle_socket(mut socket: WebSocket, state: AppState, remote: SocketAddr) {
    state.record_connection();

    let Some(id) = login_phase(&mut socket, &state, remote).await else {
        return;
    };

    let conn_id = Uuid::new_v4();
    let (mailbox, mut commands) = AppState::open_mailbox();
    let handle = PeerHandle {
        conn_id,
        mailbox,
    };

    let (clients, evicted) = match state.register(&id, handle).await {
        RegisterOutcome::Registered { clients, evicted } => (clients, evicted),
        RegisterOutcome::ProtectedInUse => {
            warn!(peer = %id, remote = %remote, "refusing duplicate claim of protected identity");
            let _ = send_server(
                &mut socket,
                &ServerMessage::LoginError {
                    error: error_tags::ALREADY_CONNECTED.to_owned(),
                    message: ALREADY_CONNECTED_MESSAGE.to_owned(),
                },
            )
            .await;
            send_close(&mut socket, close_codes::PROTECTED_IN_USE, "Identity already held").await;
            return;
        }
    };

    info!(peer = %id, remote = %remote, "peer logged in");
    if evicted {
        warn!(peer = %id, "evicted prior connection for ordinary identity");
        // Keep connect/disconnect fan-outs paired for observers of the
        // replaced identity.
        router::broadcast_peer_disconnected(&state, &id).await;
    }

    if send_server(
        &mut socket,
        &ServerMessage::LoginSuccess {
            id: id.clone(),
            clients,
        },
    )
    .await
    .is_err()
    {
        // The socket died before the registration was ever announced, so
        // remove the record without fanning out a departure.
        state.unregister(&id, conn_id).await;
        state.drop_bucket(&id).await;
        return;
    }
    router::broadcast_peer_connected(&state, &id).await;

    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.tick().await;

    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let envelope = match Envelope::parse(&text) {
                            Ok(envelope) => envelope,
                            Err(e) => {
                                warn!(peer = %id, error = %e, "discarding undecodable frame");
                                continue;
                            }
                        };
                        state.record_envelope(envelope.tag()).await;
                        if !state.check_rate(&id).await {
                            warn!(peer = %id, kind = %envelope.tag(), "rate limit exceeded");
                            if send_server(&mut socket, &ServerMessage::error(error_tags::RATE_LIMIT_EXCEEDED)).await.is_err() {
                                break;
                            }
                            continue;
                        }
                        if router::dispatch(&state, &id, envelope, &mut socket).await.is_err() {
                            error!(peer = %id, "write to peer failed");
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = socket.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(peer = %id, "peer disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        error!(peer = %id, error = %e, "channel error");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
            _ = keepalive.tick() => {
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            cmd = commands.recv() => {
                match cmd {
                    Some(PeerCommand::Send(text)) => {
                        if socket.send(Message::Text(text)).await.is_err() {
                            error!(peer = %id, "write to peer failed");
                            break;
                        }
                    }
                    Some(PeerCommand::Close { code, reason }) => {
                        info!(peer = %id, code, reason, "closing connection");
                        send_close(&mut socket, code, reason).await;
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    cleanup(&state, &id, conn_id).await;
}

/// Serves the connection until a valid login arrives.  Malformed frames are
/// discarded with a warning; well-formed non-login envelopes are answered
/// with `not_logged_in`; an invalid claimed identity is terminal.
async fn login_phase(
    socket: &mut WebSocket,
    state: &AppState,
    remote: SocketAddr,
) -> Option<String> {
    loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => {
                let envelope = match Envelope::parse(&text) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(remote = %remote, error = %e, "discarding undecodable frame");
                        continue;
                    }
                };
                state.record_envelope(envelope.tag()).await;
                if !matches!(classify(&envelope), EnvelopeClass::Login) {
                    let _ = send_server(socket, &ServerMessage::error(error_tags::NOT_LOGGED_IN))
                        .await;
                    continue;
                }
                let claimed = envelope.get("name").and_then(serde_json::Value::as_str);
                match claimed.and_then(validate_peer_id) {
                    Some(name) => return Some(name.to_owned()),
                    None => {
                        warn!(remote = %remote, claimed = ?claimed, "rejecting invalid identity");
                        let _ = send_server(socket, &ServerMessage::error(error_tags::INVALID_NAME))
                            .await;
                        send_close(socket, close_codes::INVALID_NAME, "Invalid identity").await;
                        return None;
                    }
                }
            }
            Some(Ok(Message::Ping(data))) => {
                let _ = socket.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Close(_))) | None => return None,
            Some(Err(e)) => {
                warn!(remote = %remote, error = %e, "channel error before login");
                return None;
            }
            Some(Ok(_)) => {}
        }
    }
}

async fn cleanup(state: &AppState, id: &str, conn_id: Uuid) {
    if state.unregister(id, conn_id).await {
        router::broadcast_peer_disconnected(state, id).await;
        info!(peer = %id, "peer unregistered");
    }
    state.drop_bucket(id).await;
}
