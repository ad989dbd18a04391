use pyrite_wire::mock::{MockDebugServer, MockDebugServerConfig};
use serde_json::{json, Value};

use crate::harness::{is_success, message_of, spawn_server};

const APP: &str = "/srv/app.py";

fn lines_of(resp: &Value) -> Vec<i64> {
    resp.pointer("/body/breakpoints")
        .and_then(Value::as_array)
        .map(|bps| {
            bps.iter()
                .filter_map(|bp| bp.get("line").and_then(Value::as_i64))
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn set_breakpoints_replaces_and_clears_per_file() {
    let server = MockDebugServer::spawn().await.unwrap();
    let (client, server_task) = spawn_server();
    client.initialize_handshake().await;
    client.attach_mock(server.port()).await;

    let first = client.set_breakpoints(APP, &[3, 7]).await;
    assert_eq!(lines_of(&first), vec![3, 7]);
    let ids: Vec<i64> = first
        .pointer("/body/breakpoints")
        .and_then(Value::as_array)
        .unwrap()
        .iter()
        .filter_map(|bp| bp.get("id").and_then(Value::as_i64))
        .collect();
    assert_eq!(ids.len(), 2);
    assert_ne!(ids[0], ids[1]);
    assert_eq!(server.breakpoint_lines(APP), vec![3, 7]);

    let other = client.set_breakpoints("/srv/models.py", &[10]).await;
    assert_eq!(lines_of(&other), vec![10]);

    let replaced = client.set_breakpoints(APP, &[5]).await;
    assert_eq!(lines_of(&replaced), vec![5]);
    assert_eq!(server.breakpoint_lines(APP), vec![5]);
    assert_eq!(server.breakpoint_lines("/srv/models.py"), vec![10]);

    let cleared = client.set_breakpoints(APP, &[]).await;
    assert!(is_success(&cleared), "{cleared}");
    assert_eq!(
        cleared.pointer("/body/breakpoints"),
        Some(&json!([])),
        "{cleared}"
    );
    assert!(server.breakpoint_lines(APP).is_empty());
    assert_eq!(server.breakpoint_lines("/srv/models.py"), vec![10]);

    client.disconnect().await;
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn unverifiable_breakpoints_carry_a_message() {
    let server = MockDebugServer::spawn_with_config(MockDebugServerConfig {
        unverifiable_lines: vec![4],
        ..Default::default()
    })
    .await
    .unwrap();
    let (client, server_task) = spawn_server();
    client.initialize_handshake().await;
    client.attach_mock(server.port()).await;

    let resp = client.set_breakpoints(APP, &[4, 6]).await;
    let bps = resp.pointer("/body/breakpoints").cloned().unwrap();
    assert_eq!(bps[0]["verified"], json!(false));
    assert_eq!(bps[0]["line"], json!(4));
    assert_eq!(bps[0]["message"], json!("line has no executable code"));
    assert_eq!(bps[1]["verified"], json!(true));
    assert!(bps[1].get("message").is_none());
    assert_eq!(server.breakpoint_lines(APP), vec![6]);

    client.disconnect().await;
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn deprecated_lines_form_and_zero_based_lines() {
    let server = MockDebugServer::spawn().await.unwrap();
    let (client, server_task) = spawn_server();
    client
        .request_ok("initialize", json!({ "linesStartAt1": false }))
        .await;
    client.attach_mock(server.port()).await;

    let resp = client
        .request_ok(
            "setBreakpoints",
            json!({ "source": { "path": APP }, "lines": [6] }),
        )
        .await;
    assert_eq!(lines_of(&resp), vec![6]);
    assert_eq!(server.breakpoint_lines(APP), vec![7]);

    client.configuration_done().await;
    client.wait_for_stopped_reason("breakpoint").await;
    let trace = client.stack_trace(1).await;
    assert_eq!(
        trace
            .pointer("/body/stackFrames/0/line")
            .and_then(Value::as_i64),
        Some(6),
        "{trace}"
    );

    client.disconnect().await;
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn set_breakpoints_while_running_is_rejected() {
    let server = MockDebugServer::spawn_with_config(MockDebugServerConfig {
        hold_on_resume: true,
        ..Default::default()
    })
    .await
    .unwrap();
    let (client, server_task) = spawn_server();
    client.initialize_handshake().await;
    client.attach_mock(server.port()).await;
    client.configuration_done().await;

    let resp = client.set_breakpoints(APP, &[3]).await;
    assert!(!is_success(&resp), "{resp}");
    assert_eq!(
        message_of(&resp),
        "`setBreakpoints` is not valid while the session is running"
    );
    assert!(server.breakpoint_lines(APP).is_empty());

    client.disconnect().await;
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn exception_filters_reach_the_server() {
    let server = MockDebugServer::spawn_with_config(MockDebugServerConfig {
        exception_at_line: Some(5),
        ..Default::default()
    })
    .await
    .unwrap();
    let (client, server_task) = spawn_server();
    client.initialize_handshake().await;
    client.attach_mock(server.port()).await;

    client
        .request_ok("setExceptionBreakpoints", json!({ "filters": ["raised"] }))
        .await;
    let mode = server.exception_mode();
    assert!(mode.raised);
    assert!(!mode.uncaught);

    client.configuration_done().await;
    let stopped = client.wait_for_stopped_reason("exception").await;
    assert_eq!(
        stopped.pointer("/body/text").and_then(Value::as_str),
        Some("ValueError: bad value")
    );

    client.disconnect().await;
    server_task.await.unwrap().unwrap();
}
