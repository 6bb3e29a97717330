//! Integration tests for targeted relays: structural validation, target
//! resolution, provenance stamping, and permissive forwarding.
use dl_test_utils::WsTestClient;
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;

async fn spawn_broker() -> SocketAddr {
    let state = broker::AppState::new();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            broker::build_router(state).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

fn ws_url(addr: SocketAddr) -> String {
    format!("ws://{addr}/")
}

#[tokio::test]
async fn offer_is_relayed_with_provenance() {
    let addr = spawn_broker().await;
    let mut sender = WsTestClient::connect(&ws_url(addr)).await.unwrap();
    sender.login("nantes").await.unwrap();
    let mut receiver = WsTestClient::connect(&ws_url(addr)).await.unwrap();
    receiver.login("obs_paris").await.unwrap();

    sender
        .send_json(&json!({
            "type": "offer",
            "target": "obs_paris",
            "offer": {"type": "offer", "sdp": "v=0\r\no=- 0 0 IN IP4 127.0.0.1"},
        }))
        .await
        .unwrap();

    let relayed = receiver.recv_type("offer").await.unwrap();
    assert_eq!(relayed["from"], "nantes");
    assert_eq!(relayed["target"], "obs_paris");
    assert_eq!(relayed["offer"]["sdp"], "v=0\r\no=- 0 0 IN IP4 127.0.0.1");
}

#[tokio::test]
async fn answer_and_candidates_flow_back() {
    let addr = spawn_broker().await;
    let mut sender = WsTestClient::connect(&ws_url(addr)).await.unwrap();
    sender.login("nantes").await.unwrap();
    let mut receiver = WsTestClient::connect(&ws_url(addr)).await.unwrap();
    receiver.login("obs_paris").await.unwrap();

    receiver
        .send_json(&json!({
            "type": "answer",
            "target": "nantes",
            "answer": {"type": "answer", "sdp": "v=0"},
        }))
        .await
        .unwrap();
    let relayed = sender.recv_type("answer").await.unwrap();
    assert_eq!(relayed["from"], "obs_paris");

    // Both candidate spellings reach the target.
    receiver
        .send_json(&json!({
            "type": "candidate",
            "target": "nantes",
            "candidate": {"candidate": "candidate:0 1 UDP 2122", "sdpMLineIndex": 0},
        }))
        .await
        .unwrap();
    let relayed = sender.recv_type("candidate").await.unwrap();
    assert_eq!(relayed["from"], "obs_paris");

    receiver
        .send_json(&json!({
            "type": "ice-candidate",
            "target": "nantes",
            "candidate": "candidate:1 1 UDP 2121",
        }))
        .await
        .unwrap();
    let relayed = sender.recv_type("ice-candidate").await.unwrap();
    assert_eq!(relayed["candidate"], "candidate:1 1 UDP 2121");
}

#[tokio::test]
async fn request_offer_relays_with_target_alone() {
    let addr = spawn_broker().await;
    let mut observer = WsTestClient::connect(&ws_url(addr)).await.unwrap();
    observer.login("obs_paris").await.unwrap();
    let mut sender = WsTestClient::connect(&ws_url(addr)).await.unwrap();
    sender.login("paris").await.unwrap();

    observer
        .send_json(&json!({"type": "request_offer", "target": "paris"}))
        .await
        .unwrap();
    let relayed = sender.recv_type("request_offer").await.unwrap();
    assert_eq!(relayed["from"], "obs_paris");
}

#[tokio::test]
async fn structural_failures_reply_with_specific_tags() {
    let addr = spawn_broker().await;
    let mut sender = WsTestClient::connect(&ws_url(addr)).await.unwrap();
    sender.login("nantes").await.unwrap();
    let mut receiver = WsTestClient::connect(&ws_url(addr)).await.unwrap();
    receiver.login("obs_paris").await.unwrap();
    // Drain the lifecycle event so the silence check below is strict.
    sender.recv_type("peer_connected").await.unwrap();

    let cases = [
        (json!({"type": "offer", "offer": {"type": "offer", "sdp": "v=0"}}), "missing_target"),
        (json!({"type": "offer", "target": "pas valide", "offer": {"type": "offer", "sdp": "v=0"}}), "invalid_target"),
        (json!({"type": "offer", "target": "obs_paris"}), "missing_sdp"),
        (json!({"type": "offer", "target": "obs_paris", "offer": "v=0"}), "invalid_sdp"),
        (json!({"type": "offer", "target": "obs_paris", "offer": {"type": "offer"}}), "invalid_sdp"),
        (json!({"type": "answer", "target": "obs_paris"}), "missing_sdp"),
        (json!({"type": "answer", "target": "obs_paris", "answer": {"type": "answer", "sdp": 9}}), "invalid_sdp"),
        (json!({"type": "candidate", "target": "obs_paris"}), "missing_candidate"),
    ];
    for (envelope, expected) in cases {
        sender.send_json(&envelope).await.unwrap();
        let reply = sender.recv_json().await.unwrap();
        assert_eq!(reply["type"], "error", "envelope: {envelope}");
        assert_eq!(reply["error"], expected, "envelope: {envelope}");
    }

    // None of the rejected envelopes reached the target.
    assert!(receiver
        .try_recv_json(Duration::from_millis(300))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn unknown_target_replies_target_not_found() {
    let addr = spawn_broker().await;
    let mut sender = WsTestClient::connect(&ws_url(addr)).await.unwrap();
    sender.login("nantes").await.unwrap();

    sender
        .send_json(&json!({
            "type": "offer",
            "target": "obs_paris",
            "offer": {"type": "offer", "sdp": "v=0"},
        }))
        .await
        .unwrap();
    let reply = sender.recv_json().await.unwrap();
    assert_eq!(reply["error"], "target_not_found");
    assert_eq!(reply["target"], "obs_paris");
}

#[tokio::test]
async fn unknown_tags_with_target_relay_permissively() {
    let addr = spawn_broker().await;
    let mut sender = WsTestClient::connect(&ws_url(addr)).await.unwrap();
    sender.login("operator-1").await.unwrap();
    let mut receiver = WsTestClient::connect(&ws_url(addr)).await.unwrap();
    receiver.login("nantes").await.unwrap();

    sender
        .send_json(&json!({
            "type": "projector_power",
            "target": "nantes",
            "on": false,
        }))
        .await
        .unwrap();
    let relayed = receiver.recv_type("projector_power").await.unwrap();
    assert_eq!(relayed["from"], "operator-1");
    assert_eq!(relayed["on"], false);
}

#[tokio::test]
async fn unknown_tags_without_target_are_dropped() {
    let addr = spawn_broker().await;
    let mut sender = WsTestClient::connect(&ws_url(addr)).await.unwrap();
    sender.login("operator-1").await.unwrap();
    let mut other = WsTestClient::connect(&ws_url(addr)).await.unwrap();
    other.login("nantes").await.unwrap();
    // Drain the lifecycle event so the silence checks below are strict.
    sender.recv_type("peer_connected").await.unwrap();

    sender
        .send_json(&json!({"type": "projector_power", "on": true}))
        .await
        .unwrap();
    assert!(
        other
            .try_recv_json(Duration::from_millis(300))
            .await
            .unwrap()
            .is_none(),
        "untargeted unknown tags must not be forwarded"
    );
    assert!(
        sender
            .try_recv_json(Duration::from_millis(100))
            .await
            .unwrap()
            .is_none(),
        "and must not produce an error reply"
    );
}
