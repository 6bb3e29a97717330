use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::MaybeTlsStream;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type BoxError = Box<dyn std::error::Error + Send + Sync>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// One observed event on the client side of the signaling channel.
#[derive(Debug)]
pub enum WsEvent {
    Envelope(Value),
    /// Close frame, with code and reason when the server supplied one.
    Close(Option<(u16, String)>),
}

pub struct WsTestClient {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
}

impl WsTestClient {
    pub async fn connect(url: &str) -> Result<Self, BoxError> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (write, read) = ws_stream.split();
        Ok(Self { write, read })
    }

    /// Sends a login claim and returns the broker's first reply
    /// (`login_success` or an error envelope).
    pub async fn login(&mut self, name: &str) -> Result<Value, BoxError> {
        self.send_json(&json!({"type": "login", "name": name}))
            .await?;
        self.recv_json().await
    }

    pub async fn send_json(&mut self, value: &Value) -> Result<(), BoxError> {
        self.send_text(&value.to_string()).await
    }

    /// Sends raw frame text, bypassing JSON serialization, for
    /// malformed-frame tests.
    pub async fn send_text(&mut self, text: &str) -> Result<(), BoxError> {
        self.write
            .send(Message::Text(text.to_owned().into()))
            .await?;
        Ok(())
    }

    /// Next envelope from the broker.  Transport ping/pong frames are
    /// skipped; a close frame or stream end is an error.
    pub async fn recv_json(&mut self) -> Result<Value, BoxError> {
        match self.recv_event().await? {
            WsEvent::Envelope(value) => Ok(value),
            WsEvent::Close(frame) => Err(format!("connection closed by server: {frame:?}").into()),
        }
    }

    /// Skips envelopes until one with the given `type` tag arrives.  Bounded
    /// by the per-receive timeout, so an absent tag fails the test instead of
    /// hanging it.
    pub async fn recv_type(&mut self, tag: &str) -> Result<Value, BoxError> {
        loop {
            let value = self.recv_json().await?;
            if value.get("type").and_then(Value::as_str) == Some(tag) {
                return Ok(value);
            }
        }
    }

    /// Returns the next envelope within `timeout`, or `None` when the broker
    /// stayed silent.  Used to assert non-delivery (no self-echo).
    pub async fn try_recv_json(&mut self, timeout: Duration) -> Result<Option<Value>, BoxError> {
        match tokio::time::timeout(timeout, self.recv_event()).await {
            Ok(Ok(WsEvent::Envelope(value))) => Ok(Some(value)),
            Ok(Ok(WsEvent::Close(frame))) => {
                Err(format!("connection closed by server: {frame:?}").into())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    /// Skips envelopes until the server closes the connection, returning the
    /// close frame when one was sent.
    pub async fn recv_close(&mut self) -> Result<Option<(u16, String)>, BoxError> {
        loop {
            match self.recv_raw().await? {
                Some(Message::Close(frame)) => {
                    return Ok(frame.map(|f| (u16::from(f.code), f.reason.to_string())));
                }
                Some(_) => continue,
                None => return Ok(None),
            }
        }
    }

    pub async fn recv_event(&mut self) -> Result<WsEvent, BoxError> {
        loop {
            match self.recv_raw().await? {
                Some(Message::Text(text)) => {
                    return Ok(WsEvent::Envelope(serde_json::from_str(&text)?));
                }
                Some(Message::Close(frame)) => {
                    return Ok(WsEvent::Close(
                        frame.map(|f| (u16::from(f.code), f.reason.to_string())),
                    ));
                }
                Some(_) => continue,
                None => return Err("connection stream ended".into()),
            }
        }
    }

    async fn recv_raw(&mut self) -> Result<Option<Message>, BoxError> {
        match tokio::time::timeout(RECV_TIMEOUT, self.read.next()).await {
            Ok(Some(Ok(msg))) => Ok(Some(msg)),
            Ok(Some(Err(e))) => Err(e.into()),
            Ok(None) => Ok(None),
            Err(_) => Err("timed out waiting for a frame".into()),
        }
    }

    pub async fn close(&mut self) -> Result<(), BoxError> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }
}
