//! Operation execution, multiplexing and cancellation

mod test_helpers;

use std::time::Duration;

use serde_json::{Map, json};

use gqlws_server::prelude::*;
use gqlws_server::test_utils::{GREETINGS, TestEngine};
use test_helpers::*;

#[tokio::test]
async fn test_query_yields_next_then_complete() {
    let server = builder().build().unwrap();
    let (mut client, _task) = connect(&server);
    client.init().await;

    let messages = client.run_operation("1", "{ getValue }").await;
    assert_eq!(messages.len(), 2);
    assert_eq!(next_data(&messages[0]), json!({ "getValue": "value" }));
    assert_eq!(messages[1], Message::complete("1"));
}

#[tokio::test]
async fn test_subscription_streams_in_order() {
    let server = builder().build().unwrap();
    let (mut client, _task) = connect(&server);
    client.init().await;

    let messages = client.run_operation("2", "subscription { greetings }").await;
    let greetings: Vec<_> = messages[..messages.len() - 1]
        .iter()
        .map(|m| next_data(m)["greetings"].clone())
        .collect();

    assert_eq!(greetings, GREETINGS.map(serde_json::Value::from).to_vec());
    assert_eq!(messages.last(), Some(&Message::complete("2")));
}

#[tokio::test]
async fn test_mutation_receives_variables() {
    let server = builder().build().unwrap();
    let (mut client, _task) = connect(&server);
    client.init().await;

    let mut variables = Map::new();
    variables.insert("value".to_string(), json!(42));
    client
        .send(&Message::subscribe(
            "m",
            SubscribePayload::new("mutation Set($value: Int) { setValue(value: $value) }")
                .with_operation_name("Set")
                .with_variables(variables),
        ))
        .await;

    assert_eq!(next_data(&client.recv_message().await), json!({ "setValue": 42 }));
    assert_eq!(client.recv_message().await, Message::complete("m"));
}

#[tokio::test]
async fn test_validation_error_sends_only_error() {
    let server = builder().build().unwrap();
    let (mut client, _task) = connect(&server);
    client.init().await;

    let messages = client.run_operation("1", "{ nope }").await;
    assert_eq!(messages.len(), 1);
    assert_eq!(
        error_message(&messages[0]),
        "Cannot query field \"nope\" on type \"Query\"."
    );

    // Nothing else follows for the failed operation
    assert!(round_trip(&mut client).await.is_empty());
}

#[tokio::test]
async fn test_syntax_error_sends_error() {
    let server = builder().build().unwrap();
    let (mut client, _task) = connect(&server);
    client.init().await;

    let messages = client.run_operation("1", "getValue").await;
    assert_eq!(messages.len(), 1);
    assert!(error_message(&messages[0]).starts_with("Syntax Error"));
}

#[tokio::test]
async fn test_request_error_is_reported_as_error() {
    let server = builder().build().unwrap();
    let (mut client, _task) = connect(&server);
    client.init().await;

    let messages = client.run_operation("1", "{ error }").await;
    assert_eq!(messages.len(), 1);
    assert_eq!(error_message(&messages[0]), "Query failed");
}

#[tokio::test]
async fn test_stream_error_terminates_with_single_error() {
    let server = builder().build().unwrap();
    let (mut client, _task) = connect(&server);
    client.init().await;

    let messages = client.run_operation("f", "subscription { failing }").await;
    assert_eq!(messages.len(), 2);
    assert_eq!(next_data(&messages[0]), json!({ "failing": 1 }));
    assert_eq!(error_message(&messages[1]), "Stream failed");
    assert!(round_trip(&mut client).await.is_empty());
}

#[tokio::test]
async fn test_failed_operation_keeps_connection_open() {
    let server = builder().build().unwrap();
    let (mut client, _task) = connect(&server);
    client.init().await;

    client.run_operation("1", "{ nope }").await;
    let messages = client.run_operation("2", "{ getValue }").await;
    assert_eq!(messages.last(), Some(&Message::complete("2")));
}

#[tokio::test]
async fn test_client_complete_cancels_stream() {
    let engine = TestEngine::new().with_tick_interval(Duration::from_millis(10));
    let server = builder_with_engine(&engine).build().unwrap();
    let (mut client, _task) = connect(&server);
    client.init().await;

    client.send(&subscribe("t", "subscription { ticks }")).await;
    assert_eq!(next_data(&client.recv_message().await), json!({ "ticks": 0 }));

    client.send(&Message::complete("t")).await;
    let in_flight = round_trip(&mut client).await;
    assert!(
        in_flight
            .iter()
            .all(|m| matches!(m, Message::Next { id, .. } if id == "t")),
        "only already-queued results may follow a client complete: {in_flight:?}"
    );

    // No complete is echoed and the stream stops producing
    assert_eq!(client.recv_within(Duration::from_millis(100)).await, None);
    assert!(eventually(|| engine.released_streams() == 1).await);
    assert_eq!(engine.started_streams(), 1);
}

#[tokio::test]
async fn test_complete_for_unknown_id_is_ignored() {
    let server = builder().build().unwrap();
    let (mut client, _task) = connect(&server);
    client.init().await;

    client.send(&Message::complete("never-started")).await;
    assert!(round_trip(&mut client).await.is_empty());
}

#[tokio::test]
async fn test_complete_after_natural_completion_is_ignored() {
    let server = builder().build().unwrap();
    let (mut client, _task) = connect(&server);
    client.init().await;

    client.run_operation("1", "{ getValue }").await;
    client.send(&Message::complete("1")).await;
    assert!(round_trip(&mut client).await.is_empty());
}

#[tokio::test]
async fn test_id_reusable_after_completion() {
    let server = builder().build().unwrap();
    let (mut client, _task) = connect(&server);
    client.init().await;

    for _ in 0..3 {
        let messages = client.run_operation("same", "{ getValue }").await;
        assert_eq!(messages.last(), Some(&Message::complete("same")));
    }
}

#[tokio::test]
async fn test_id_reusable_after_client_complete() {
    let engine = TestEngine::new();
    let server = builder_with_engine(&engine).build().unwrap();
    let (mut client, _task) = connect(&server);
    client.init().await;

    client.send(&subscribe("x", "subscription { ticks }")).await;
    client.recv_message().await;
    client.send(&Message::complete("x")).await;
    round_trip(&mut client).await;

    let messages = client.run_operation("x", "{ getValue }").await;
    assert_eq!(messages.last(), Some(&Message::complete("x")));
}

#[tokio::test]
async fn test_duplicate_active_id_closes_connection() {
    let engine = TestEngine::new();
    let server = builder_with_engine(&engine).build().unwrap();
    let (mut client, task) = connect(&server);
    client.init().await;

    client.send(&subscribe("dup", "subscription { ticks }")).await;
    client.recv_message().await;
    client.send(&subscribe("dup", "subscription { ticks }")).await;

    let (messages, code, reason) = client.recv_until_close().await;
    assert_eq!(code, 4409);
    assert_eq!(reason, "Subscriber for dup already exists");
    assert!(
        messages.iter().all(|m| matches!(m, Message::Next { .. })),
        "no error or complete for the duplicate: {messages:?}"
    );

    assert_eq!(task.await.unwrap().code, 4409);
    assert_eq!(engine.started_streams(), 1);
    assert_eq!(engine.released_streams(), 1);
}

#[tokio::test]
async fn test_concurrent_operations_keep_per_id_order() {
    let server = builder().build().unwrap();
    let (mut client, _task) = connect(&server);
    client.init().await;

    client.send(&subscribe("a", "subscription { greetings }")).await;
    client.send(&subscribe("b", "subscription { greetings }")).await;
    client.send(&subscribe("c", "{ getValue }")).await;

    let mut per_id: std::collections::HashMap<String, Vec<Message>> = Default::default();
    let mut completed = 0;
    while completed < 3 {
        let message = client.recv_message().await;
        if matches!(message, Message::Complete { .. }) {
            completed += 1;
        }
        let id = message.id().unwrap().to_string();
        per_id.entry(id).or_default().push(message);
    }

    for id in ["a", "b"] {
        let messages = &per_id[id];
        assert_eq!(messages.len(), GREETINGS.len() + 1);
        for (message, greeting) in messages.iter().zip(GREETINGS) {
            assert_eq!(next_data(message)["greetings"], greeting);
        }
        assert_eq!(messages.last(), Some(&Message::complete(id)));
    }
    assert_eq!(per_id["c"].len(), 2);
}

#[tokio::test]
async fn test_connection_close_cancels_operations() {
    let engine = TestEngine::new();
    let server = builder_with_engine(&engine).build().unwrap();
    let (mut client, task) = connect(&server);
    client.init().await;

    client.send(&subscribe("1", "subscription { ticks }")).await;
    client.send(&subscribe("2", "subscription { ticks }")).await;
    assert!(eventually(|| engine.started_streams() == 2).await);

    client.close(1000, "done").await;
    task.await.unwrap();
    assert_eq!(engine.released_streams(), 2);
}

#[tokio::test]
async fn test_root_value_per_operation_kind() {
    let server = builder()
        .root_value(OperationKind::Query, json!({ "answer": 42 }))
        .build()
        .unwrap();
    let (mut client, _task) = connect(&server);
    client.init().await;

    let messages = client.run_operation("1", "{ root }").await;
    assert_eq!(next_data(&messages[0]), json!({ "root": { "answer": 42 } }));
}
