// dl-protocol: signaling wire types, envelope classification, and identity rules.
//
// Client envelopes are open JSON objects discriminated by a top-level `type`
// field.  They stay schemaless on purpose: the broker forwards session
// descriptions and candidate records as opaque payloads and must preserve
// fields it does not understand.  Everything the broker itself emits with a
// fixed shape lives in the `ServerMessage` union below.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Protocol constants
// ---------------------------------------------------------------------------

/// Hard cap on a single inbound signaling frame.  Enforced at the transport
/// layer; an oversized frame terminates the connection.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Maximum length of a claimed identity, in code units, after trimming.
pub const MAX_PEER_ID_LEN: usize = 64;

/// Identities whose uniqueness is preserved by refusing duplicates rather
/// than evicting the incumbent: the two senders and the two media-receiver
/// endpoints.  An active broadcast (or the screen displaying it) must not be
/// displaced by a duplicate tab.
pub const PROTECTED_PEERS: [&str; 4] = ["nantes", "paris", "obs_nantes", "obs_paris"];

/// True if `id` names an operationally critical role.
pub fn is_protected(id: &str) -> bool {
    PROTECTED_PEERS.contains(&id)
}

/// Validates a claimed identity: trim surrounding whitespace, cap at
/// [`MAX_PEER_ID_LEN`] code units, restrict to `[A-Za-z0-9_-]`.  Returns
/// the sanitized identity on success.
pub fn validate_peer_id(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    let capped = match trimmed.char_indices().nth(MAX_PEER_ID_LEN) {
        Some((idx, _)) => &trimmed[..idx],
        None => trimmed,
    };
    if capped.is_empty() {
        return None;
    }
    capped
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        .then_some(capped)
}

/// Frozen error tags carried in `error` and `login_error` replies.
pub mod error_tags {
    pub const INVALID_NAME: &str = "invalid_name";
    pub const NOT_LOGGED_IN: &str = "not_logged_in";
    pub const ALREADY_CONNECTED: &str = "already_connected";
    pub const RATE_LIMIT_EXCEEDED: &str = "rate_limit_exceeded";
    pub const TARGET_NOT_FOUND: &str = "target_not_found";
    pub const MISSING_TARGET: &str = "missing_target";
    pub const INVALID_TARGET: &str = "invalid_target";
    pub const MISSING_SDP: &str = "missing_sdp";
    pub const INVALID_SDP: &str = "invalid_sdp";
    pub const MISSING_CANDIDATE: &str = "missing_candidate";
}

/// WebSocket close codes the broker emits.
pub mod close_codes {
    /// Shutdown in progress.
    pub const GOING_AWAY: u16 = 1001;
    /// The claimed identity failed validation.
    pub const INVALID_NAME: u16 = 4001;
    /// An ordinary identity was claimed again; the incumbent is evicted.
    pub const REPLACED: u16 = 4002;
    /// A protected identity is already held; the newcomer is refused.
    pub const PROTECTED_IN_USE: u16 = 4003;
}

// ---------------------------------------------------------------------------
// Client envelopes
// ---------------------------------------------------------------------------

/// Why an inbound frame could not be accepted as an envelope.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("envelope `type` must be a non-empty string")]
    MissingType,
}

/// One framed signaling message: an open JSON object with a mandatory
/// non-empty string `type` field.  Unknown fields are preserved verbatim so
/// relayed payloads pass through untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope(Map<String, Value>);

impl Envelope {
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(map) = value else {
            return Err(EnvelopeError::NotAnObject);
        };
        let tagged = matches!(
            map.get("type").and_then(Value::as_str),
            Some(tag) if !tag.is_empty()
        );
        if tagged {
            Ok(Self(map))
        } else {
            Err(EnvelopeError::MissingType)
        }
    }

    /// The `type` tag.  Guaranteed non-empty by [`Envelope::parse`].
    pub fn tag(&self) -> &str {
        self.0
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn has_target(&self) -> bool {
        self.0.contains_key("target")
    }

    /// Stamps the originator identity onto the envelope before re-emission.
    pub fn set_from(&mut self, id: &str) {
        self.0.insert("from".to_owned(), Value::String(id.to_owned()));
    }

    /// Inserts `value` under `key` only when the field is absent.
    pub fn set_default(&mut self, key: &str, value: Value) {
        self.0.entry(key.to_owned()).or_insert(value);
    }

    pub fn to_text(&self) -> Option<String> {
        serde_json::to_string(&self.0).ok()
    }
}

// ---------------------------------------------------------------------------
// Envelope classification
// ---------------------------------------------------------------------------

/// The relay tags that carry per-tag structural rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayKind {
    /// `offer`: requires an `offer` payload with string `type` and `sdp`.
    Offer,
    /// `answer`: requires an `answer` payload with string `type` and `sdp`.
    Answer,
    /// `candidate` / `ice-candidate`: requires an opaque `candidate` field.
    Candidate,
    /// `request_offer`: requires nothing beyond `target`.
    RequestOffer,
}

/// Handling class of an inbound envelope.  The router dispatches on this sum
/// instead of chaining string comparisons, so tests can cover it exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeClass {
    /// Identity claim; valid only as the first envelope on a connection.
    Login,
    /// Application-level keepalive probe, answered with a `pong`.
    Ping,
    /// Lifecycle/operational event fanned out to every other peer.
    Broadcast,
    /// The audio-suppression command: delivered to the target and, as an
    /// observer copy, to every other peer.
    HybridRelay,
    /// Targeted signaling message with structural validation.
    Relay(RelayKind),
    /// Unknown tag carrying a `target`: forwarded as-is for forward
    /// compatibility, with no structural validation.
    PermissiveRelay,
    /// Unknown tag without a `target`: logged and dropped.
    Other,
}

const BROADCAST_TAGS: [&str; 8] = [
    "stream_starting",
    "stream_stopping",
    "stream_started",
    "stream_stopped",
    "stream_heartbeat",
    "stream_error",
    "page_opened",
    "stream_restored",
];

pub fn classify(envelope: &Envelope) -> EnvelopeClass {
    match envelope.tag() {
        "login" => EnvelopeClass::Login,
        "ping" => EnvelopeClass::Ping,
        "audio_ducking" => EnvelopeClass::HybridRelay,
        "offer" => EnvelopeClass::Relay(RelayKind::Offer),
        "answer" => EnvelopeClass::Relay(RelayKind::Answer),
        "candidate" | "ice-candidate" => EnvelopeClass::Relay(RelayKind::Candidate),
        "request_offer" => EnvelopeClass::Relay(RelayKind::RequestOffer),
        tag if BROADCAST_TAGS.contains(&tag) => EnvelopeClass::Broadcast,
        _ if envelope.has_target() => EnvelopeClass::PermissiveRelay,
        _ => EnvelopeClass::Other,
    }
}

// ---------------------------------------------------------------------------
// Server -> client messages
// ---------------------------------------------------------------------------

/// Every fixed-shape message the broker originates, discriminated by the
/// same top-level `type` field clients use.
///
/// ```json
/// { "type": "login_success", "id": "nantes", "clients": ["nantes"] }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum ServerMessage {
    /// Identity claim accepted.  `clients` is the full registry snapshot at
    /// the moment of the reply, newcomer included.
    LoginSuccess { id: String, clients: Vec<String> },
    /// Identity claim refused.  `message` is a human-readable explanation
    /// for the operator; `error` stays machine-stable.
    LoginError { error: String, message: String },
    /// Typed error reply; `target` is set for target-resolution failures.
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    /// Answer to a `ping` envelope.  `timestamp` is milliseconds since epoch.
    Pong { timestamp: i64 },
    /// A peer completed login.
    PeerConnected { peer: String },
    /// A peer's channel closed.
    PeerDisconnected { peer: String },
}

impl ServerMessage {
    pub fn error(tag: &str) -> Self {
        Self::Error {
            error: tag.to_owned(),
            target: None,
        }
    }

    pub fn target_not_found(target: &str) -> Self {
        Self::Error {
            error: error_tags::TARGET_NOT_FOUND.to_owned(),
            target: Some(target.to_owned()),
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP status surface (frozen schema definitions)
// ---------------------------------------------------------------------------

/// Body of `GET /` and `GET /health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    pub clients: ClientCounts,
    pub messages: MessageCounts,
    /// Seconds since process start.
    pub uptime: u64,
    /// ISO-8601 wall-clock time of the reply.
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientCounts {
    /// Currently registered peers.
    pub current: usize,
    /// Lifetime accepted connections, including ones that never logged in.
    pub total: u64,
    /// Registered identities; present only for loopback callers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageCounts {
    pub total: u64,
    #[serde(rename = "byType")]
    pub by_type: BTreeMap<String, u64>,
}

/// Body of `GET /clients` for loopback callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientsResponse {
    pub clients: Vec<String>,
}

/// Frozen error envelope used by all non-2xx status responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpError {
    pub error: String,
}
