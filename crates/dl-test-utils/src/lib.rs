// dl-test-utils: shared test utilities for the signaling suite.
//
// Provides a raw-JSON WebSocket client for integration testing of the broker.
// The client deliberately speaks `serde_json::Value` rather than typed
// messages so suites can send malformed and partially-formed envelopes.

pub mod ws_client;

pub use ws_client::{WsEvent, WsTestClient};
