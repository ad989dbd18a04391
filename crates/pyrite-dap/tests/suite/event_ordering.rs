use pyrite_wire::mock::{MockDebugServer, MockDebugServerConfig};
use pyrite_wire::WireEvent;
use serde_json::{json, Value};

use crate::harness::{is_event, is_response_to, is_success, spawn_server};

const APP: &str = "/srv/app.py";

fn position(transcript: &[Value], pred: impl Fn(&Value) -> bool) -> usize {
    transcript
        .iter()
        .position(pred)
        .unwrap_or_else(|| panic!("message missing from {transcript:?}"))
}

#[tokio::test]
async fn continue_response_precedes_the_next_stop() {
    let server = MockDebugServer::spawn().await.unwrap();
    let (client, server_task) = spawn_server();
    client.initialize_handshake().await;
    client.attach_mock(server.port()).await;
    client.set_breakpoints(APP, &[3, 7]).await;
    client.configuration_done().await;
    client.wait_for_stopped_reason("breakpoint").await;
    client.take_transcript().await;

    let seq = client.send_request("continue", json!({ "threadId": 1 })).await;
    let resp = client.wait_for_response(seq).await;
    assert_eq!(resp["body"]["allThreadsContinued"], json!(true));
    client.wait_for_stopped_reason("breakpoint").await;

    let transcript = client.take_transcript().await;
    let response = position(&transcript, |msg| is_response_to(msg, seq));
    let continued = position(&transcript, |msg| is_event(msg, "continued"));
    let stopped = position(&transcript, |msg| is_event(msg, "stopped"));
    assert!(response < continued && continued < stopped, "{transcript:?}");

    client.disconnect().await;
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn stop_racing_a_breakpoint_ack_follows_the_response() {
    let server = MockDebugServer::spawn_with_config(MockDebugServerConfig {
        event_before_breakpoint_ack: Some(WireEvent::StepComplete { thread_id: 1 }),
        ..Default::default()
    })
    .await
    .unwrap();
    let (client, server_task) = spawn_server();
    client.initialize_handshake().await;
    client.attach_mock(server.port()).await;
    client.set_breakpoints(APP, &[3]).await;
    client.configuration_done().await;
    client.wait_for_stopped_reason("breakpoint").await;
    client.take_transcript().await;

    let seq = client
        .send_request(
            "setBreakpoints",
            json!({ "source": { "path": APP }, "breakpoints": [{ "line": 3 }, { "line": 9 }] }),
        )
        .await;
    let resp = client.wait_for_response(seq).await;
    assert!(is_success(&resp), "{resp}");
    client.wait_for_stopped_reason("step").await;

    let transcript = client.take_transcript().await;
    let response = position(&transcript, |msg| is_response_to(msg, seq));
    let stopped = position(&transcript, |msg| is_event(msg, "stopped"));
    assert!(response < stopped, "{transcript:?}");

    client.disconnect().await;
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn sequence_numbers_increase_monotonically() {
    let server = MockDebugServer::spawn().await.unwrap();
    let (client, server_task) = spawn_server();
    client.initialize_handshake().await;
    client.attach_mock(server.port()).await;
    client.set_breakpoints(APP, &[3]).await;
    client.configuration_done().await;
    client.wait_for_stopped_reason("breakpoint").await;
    client.continue_().await;
    client.wait_for_event("terminated").await;

    let transcript = client.take_transcript().await;
    let seqs: Vec<i64> = transcript
        .iter()
        .filter_map(|msg| msg.get("seq").and_then(Value::as_i64))
        .collect();
    assert_eq!(seqs.len(), transcript.len());
    assert!(
        seqs.windows(2).all(|pair| pair[0] < pair[1]),
        "seq went backwards: {seqs:?}"
    );

    client.disconnect().await;
    server_task.await.unwrap().unwrap();
}
