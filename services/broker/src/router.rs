use crate::state::{AppState, PeerCommand, PeerHandle};
use crate::ws::send_server;
use axum::extract::ws::WebSocket;
use chrono::Utc;
use dl_protocol::{
    classify, error_tags, validate_peer_id, Envelope, EnvelopeClass, RelayKind, ServerMessage,
};
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Dispatches one post-login envelope from `sender`.  Replies to the sender
/// go directly to its socket (we are on the owning task); deliveries to
/// other peers go through their mailboxes.  An `Err` means the sender's own
/// channel is no longer writable.
pub async fn dispatch(
    state: &AppState,
    sender: &str,
    mut envelope: Envelope,
    socket: &mut WebSocket,
) -> Result<(), axum::Error> {
    match classify(&envelope) {
        EnvelopeClass::Login => {
            warn!(peer = %sender, "ignoring login on an already-registered connection");
            Ok(())
        }
        EnvelopeClass::Ping => {
            send_server(
                socket,
                &ServerMessage::Pong {
                    timestamp: Utc::now().timestamp_millis(),
                },
            )
            .await
        }
        EnvelopeClass::Broadcast => {
            if envelope.tag() == "stream_stopped" {
                envelope.set_default("reason", Value::String("manual".to_owned()));
            }
            envelope.set_from(sender);
            if let Some(text) = envelope.to_text() {
                fan_out(state, &text, &[sender]).await;
            }
            Ok(())
        }
        EnvelopeClass::HybridRelay => {
            let target = match checked_target(&envelope) {
                Ok(target) => target,
                Err(reply) => return send_server(socket, &reply).await,
            };
            let Some(handle) = state.lookup(&target).await else {
                return send_server(socket, &ServerMessage::target_not_found(&target)).await;
            };
            if handle.mailbox.is_closed() {
                return send_server(socket, &ServerMessage::target_not_found(&target)).await;
            }
            envelope.set_from(sender);
            if let Some(text) = envelope.to_text() {
                deliver(&target, &handle, &text);
                // Observer copies let an operator console follow both ends'
                // VOX state.
                fan_out(state, &text, &[sender, target.as_str()]).await;
            }
            Ok(())
        }
        EnvelopeClass::Relay(kind) => {
            let target = match checked_target(&envelope) {
                Ok(target) => target,
                Err(reply) => return send_server(socket, &reply).await,
            };
            if let Err(reply) = check_relay_structure(&envelope, kind) {
                return send_server(socket, &reply).await;
            }
            relay(state, sender, envelope, &target, socket).await
        }
        EnvelopeClass::PermissiveRelay => {
            // Unknown tag with a target: forward as-is so new envelope kinds
            // work without broker changes.  Only the target is validated.
            let target = match checked_target(&envelope) {
                Ok(target) => target,
                Err(reply) => return send_server(socket, &reply).await,
            };
            relay(state, sender, envelope, &target, socket).await
        }
        EnvelopeClass::Other => {
            debug!(peer = %sender, kind = %envelope.tag(), "dropping unhandled envelope");
            Ok(())
        }
    }
}

/// Validates the `target` field: present, and a syntactically valid
/// identity.  Returns the owned target so the envelope can be mutated.
fn checked_target(envelope: &Envelope) -> Result<String, ServerMessage> {
    let Some(raw) = envelope.get("target") else {
        return Err(ServerMessage::error(error_tags::MISSING_TARGET));
    };
    raw.as_str()
        .and_then(validate_peer_id)
        .map(ToOwned::to_owned)
        .ok_or_else(|| ServerMessage::error(error_tags::INVALID_TARGET))
}

/// Per-tag structural rules.  Session descriptions must look like
/// `{type, sdp}` objects; candidate payloads are opaque beyond presence.
fn check_relay_structure(envelope: &Envelope, kind: RelayKind) -> Result<(), ServerMessage> {
    match kind {
        RelayKind::Offer => check_sdp_payload(envelope.get("offer")),
        RelayKind::Answer => check_sdp_payload(envelope.get("answer")),
        RelayKind::Candidate => match envelope.get("candidate") {
            Some(_) => Ok(()),
            None => Err(ServerMessage::error(error_tags::MISSING_CANDIDATE)),
        },
        RelayKind::RequestOffer => Ok(()),
    }
}

fn check_sdp_payload(payload: Option<&Value>) -> Result<(), ServerMessage> {
    let Some(payload) = payload else {
        return Err(ServerMessage::error(error_tags::MISSING_SDP));
    };
    let valid = payload.as_object().is_some_and(|o| {
        o.get("type").is_some_and(Value::is_string) && o.get("sdp").is_some_and(Value::is_string)
    });
    if valid {
        Ok(())
    } else {
        Err(ServerMessage::error(error_tags::INVALID_SDP))
    }
}

async fn relay(
    state: &AppState,
    sender: &str,
    mut envelope: Envelope,
    target: &str,
    socket: &mut WebSocket,
) -> Result<(), axum::Error> {
    let Some(handle) = state.lookup(target).await else {
        return send_server(socket, &ServerMessage::target_not_found(target)).await;
    };
    // Registered but mid-teardown counts as absent.
    if handle.mailbox.is_closed() {
        return send_server(socket, &ServerMessage::target_not_found(target)).await;
    }
    envelope.set_from(sender);
    if let Some(text) = envelope.to_text() {
        deliver(target, &handle, &text);
    }
    Ok(())
}

/// Sends one serialized envelope to every registered peer not named in
/// `exclude`.  Iterates a registry snapshot; no acknowledgment is awaited.
pub async fn fan_out(state: &AppState, text: &str, exclude: &[&str]) {
    for (id, handle) in state.snapshot().await {
        if exclude.contains(&id.as_str()) {
            continue;
        }
        deliver(&id, &handle, text);
    }
}

/// Posts to a peer's mailbox without blocking.  A full mailbox means the
/// peer has stopped draining its socket; the copy is dropped so one stuck
/// reader cannot stall anyone else.
fn deliver(id: &str, handle: &PeerHandle, text: &str) {
    match handle.mailbox.try_send(PeerCommand::Send(text.to_owned())) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            warn!(peer = %id, "peer mailbox full, dropping envelope");
        }
        // The peer is tearing down; its unregister will follow.
        Err(TrySendError::Closed(_)) => {}
    }
}

pub async fn broadcast_peer_connected(state: &AppState, peer: &str) {
    let msg = ServerMessage::PeerConnected {
        peer: peer.to_owned(),
    };
    if let Ok(text) = serde_json::to_string(&msg) {
        fan_out(state, &text, &[peer]).await;
    }
}

pub async fn broadcast_peer_disconnected(state: &AppState, peer: &str) {
    let msg = ServerMessage::PeerDisconnected {
        peer: peer.to_owned(),
    };
    if let Ok(text) = serde_json::to_string(&msg) {
        fan_out(state, &text, &[peer]).await;
    }
}
