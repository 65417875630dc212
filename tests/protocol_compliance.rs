//! graphql-transport-ws protocol compliance
//!
//! Handshake, state machine and close-code behavior over the memory
//! transport.

mod test_helpers;

use serde_json::json;

use gqlws_server::prelude::*;
use gqlws_server::test_utils::memory_transport_with;
use test_helpers::*;

#[tokio::test]
async fn test_connection_init_is_acknowledged() {
    let server = builder().build().unwrap();
    let (mut client, _task) = connect(&server);

    client.send(&Message::connection_init(None)).await;
    assert_eq!(client.recv_message().await, Message::connection_ack(None));
}

#[tokio::test]
async fn test_subscribe_before_init_closes_unauthorized() {
    let server = builder().build().unwrap();
    let (mut client, task) = connect(&server);

    client.send(&subscribe("2", "subscription{greetings}")).await;

    let (messages, code, reason) = client.recv_until_close().await;
    assert!(messages.is_empty(), "no message may precede the close: {messages:?}");
    assert_eq!(code, 4401);
    assert_eq!(reason, "Unauthorized");

    let closed = task.await.unwrap();
    assert_eq!(closed.code, 4401);
    assert!(!closed.was_acknowledged);
}

#[tokio::test]
async fn test_other_messages_before_init_close_bad_request() {
    for message in [
        Message::ping(None),
        Message::pong(None),
        Message::complete("1"),
    ] {
        let server = builder().build().unwrap();
        let (mut client, _task) = connect(&server);

        client.send(&message).await;
        let (messages, code, _) = client.recv_until_close().await;
        assert!(messages.is_empty());
        assert_eq!(code, 4400, "{} before init", message.message_type());
    }
}

#[tokio::test]
async fn test_second_init_closes_too_many_requests() {
    let server = builder().build().unwrap();
    let (mut client, _task) = connect(&server);
    client.init().await;

    client.send(&Message::connection_init(None)).await;
    let (messages, code, reason) = client.recv_until_close().await;

    assert_eq!(code, 4429);
    assert_eq!(reason, "Too many initialisation requests");
    assert!(
        !messages
            .iter()
            .any(|m| matches!(m, Message::ConnectionAck { .. })),
        "at most one ack per connection"
    );
}

#[tokio::test]
async fn test_repeated_init_while_initialising_closes_too_many_requests() {
    let server = builder().build().unwrap();
    let (mut client, _task) = connect(&server);

    client.send(&Message::connection_init(None)).await;
    client.send(&Message::connection_init(None)).await;

    let (messages, code, _) = client.recv_until_close().await;
    assert_eq!(code, 4429);
    assert_eq!(messages, vec![Message::connection_ack(None)]);
}

#[tokio::test]
async fn test_malformed_frames_close_bad_request() {
    let frames = [
        "{not json",
        "[]",
        r#"{"id":"1"}"#,
        r#"{"type":"start","id":"1"}"#,
        r#"{"type":"subscribe","id":"","payload":{"query":"{ a }"}}"#,
        r#"{"type":"subscribe","id":"1","payload":{}}"#,
        r#"{"type":"complete","id":"1","payload":{}}"#,
        r#"{"type":"ping","extra":true}"#,
    ];

    for frame in frames {
        let server = builder().build().unwrap();
        let (mut client, _task) = connect(&server);
        client.init().await;

        client.send_text(frame).await;
        let (messages, code, reason) = client.recv_until_close().await;
        assert!(messages.is_empty(), "{frame}: {messages:?}");
        assert_eq!(code, 4400, "{frame}");
        assert!(!reason.is_empty(), "{frame} should carry a reason");
    }
}

#[tokio::test]
async fn test_decode_reason_is_forwarded() {
    let server = builder().build().unwrap();
    let (mut client, _task) = connect(&server);
    client.init().await;

    client.send_text(r#"{"type":"start","id":"1"}"#).await;
    let (code, reason) = client.expect_close().await;
    assert_eq!(code, 4400);
    assert_eq!(reason, "Unknown message type 'start'");
}

#[tokio::test]
async fn test_binary_frame_closes_bad_request() {
    let server = builder().build().unwrap();
    let (mut client, _task) = connect(&server);
    client.init().await;

    client.send_binary(b"{\"type\":\"ping\"}".to_vec()).await;
    assert_eq!(client.expect_close().await.0, 4400);
}

#[tokio::test]
async fn test_server_message_from_client_closes_bad_request() {
    let server = builder().build().unwrap();
    let (mut client, _task) = connect(&server);
    client.init().await;

    client
        .send(&Message::next("1", ExecutionResult::from_data(json!({}))))
        .await;
    assert_eq!(client.expect_close().await.0, 4400);
}

#[tokio::test]
async fn test_client_ping_is_answered_with_echo() {
    let server = builder().build().unwrap();
    let (mut client, _task) = connect(&server);
    client.init().await;

    let mut payload = Payload::new();
    payload.insert("seq".to_string(), json!(7));
    client.send(&Message::ping(Some(payload.clone()))).await;
    assert_eq!(client.recv_message().await, Message::pong(Some(payload)));

    client.send(&Message::ping(None)).await;
    assert_eq!(client.recv_message().await, Message::pong(None));
}

#[tokio::test]
async fn test_client_pong_gets_no_reply() {
    let server = builder().build().unwrap();
    let (mut client, _task) = connect(&server);
    client.init().await;

    client.send(&Message::pong(None)).await;
    assert!(round_trip(&mut client).await.is_empty());
}

#[tokio::test]
async fn test_missing_subprotocol_closes_4406() {
    let server = builder().build().unwrap();
    let (transport, mut client) = memory_transport_with(TransportInfo::default());

    let closed = server.serve_connection(transport, None).await;
    assert_eq!(closed.code, 4406);
    assert_eq!(
        client.expect_close().await,
        (4406, "Subprotocol not acceptable".to_string())
    );
}

#[tokio::test]
async fn test_peer_close_ends_connection() {
    let server = builder().build().unwrap();
    let (mut client, task) = connect(&server);
    client.init().await;

    client.close(1000, "bye").await;
    let closed = task.await.unwrap();
    assert_eq!(closed.code, 1000);
    assert_eq!(closed.reason, "bye");
    assert!(closed.was_acknowledged);
    assert_eq!(server.connection_count(), 0);
}

#[tokio::test]
async fn test_abrupt_disconnect_reports_abnormal_closure() {
    let server = builder().build().unwrap();
    let (mut client, task) = connect(&server);
    client.init().await;

    client.disconnect();
    let closed = task.await.unwrap();
    assert_eq!(closed.code, 1006);
}
