use pyrite_wire::mock::{MockDebugServer, MockDebugServerConfig};
use serde_json::{json, Value};

use crate::harness::{is_success, message_of, spawn_server};

const APP: &str = "/srv/app.py";

fn names_of(resp: &Value) -> Vec<String> {
    resp.pointer("/body/variables")
        .and_then(Value::as_array)
        .map(|vars| {
            vars.iter()
                .filter_map(|var| var.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn ids_are_stable_within_a_stop_and_die_on_resume() {
    let server = MockDebugServer::spawn().await.unwrap();
    let (client, server_task) = spawn_server();
    client.initialize_handshake().await;
    client.attach_mock(server.port()).await;
    client.set_breakpoints(APP, &[3, 7]).await;
    client.configuration_done().await;
    client.wait_for_stopped_reason("breakpoint").await;

    let trace = client.stack_trace(1).await;
    assert_eq!(
        trace.pointer("/body/totalFrames").and_then(Value::as_i64),
        Some(2)
    );
    let again = client.stack_trace(1).await;
    assert_eq!(
        trace.pointer("/body/stackFrames"),
        again.pointer("/body/stackFrames"),
        "frame ids must not change within one stop"
    );

    let frame_id = client.first_frame_id(1).await;
    let locals = client.first_scope_variables_reference(frame_id).await;
    assert_eq!(client.first_scope_variables_reference(frame_id).await, locals);

    let vars = client.variables(locals).await;
    assert!(is_success(&vars), "{vars}");
    assert_eq!(names_of(&vars), vec!["x", "items"]);
    assert_eq!(vars.pointer("/body/variables/0/type"), Some(&json!("int")));
    assert_eq!(
        vars.pointer("/body/variables/0/variablesReference"),
        Some(&json!(0))
    );
    let items = vars
        .pointer("/body/variables/1/variablesReference")
        .and_then(Value::as_i64)
        .unwrap();
    assert_ne!(items, 0);
    let children = client.variables(items).await;
    assert_eq!(names_of(&children), vec!["0", "1"]);

    client.continue_().await;
    client.wait_for_stopped_reason("breakpoint").await;

    let stale_scope = client
        .request("scopes", json!({ "frameId": frame_id }))
        .await;
    assert!(!is_success(&stale_scope));
    assert_eq!(message_of(&stale_scope), format!("invalid reference {frame_id}"));

    let stale_vars = client.variables(items).await;
    assert!(!is_success(&stale_vars));
    assert_eq!(message_of(&stale_vars), format!("invalid reference {items}"));

    let new_frame = client.first_frame_id(1).await;
    assert_ne!(new_frame, frame_id, "ids are never reused across stops");
    let trace = client.stack_trace(1).await;
    assert_eq!(
        trace
            .pointer("/body/stackFrames/0/line")
            .and_then(Value::as_i64),
        Some(7)
    );

    client.disconnect().await;
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn stack_and_variable_paging() {
    let server = MockDebugServer::spawn().await.unwrap();
    let (client, server_task) = spawn_server();
    client.initialize_handshake().await;
    client.attach_mock(server.port()).await;
    client.set_breakpoints(APP, &[3]).await;
    client.configuration_done().await;
    client.wait_for_stopped_reason("breakpoint").await;

    let page = client
        .request_ok(
            "stackTrace",
            json!({ "threadId": 1, "startFrame": 1, "levels": 1 }),
        )
        .await;
    let frames = page
        .pointer("/body/stackFrames")
        .and_then(Value::as_array)
        .unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["name"], json!("<module>"));
    assert_eq!(page.pointer("/body/totalFrames"), Some(&json!(2)));

    let frame_id = client.first_frame_id(1).await;
    let locals = client.first_scope_variables_reference(frame_id).await;
    let tail = client
        .request_ok(
            "variables",
            json!({ "variablesReference": locals, "start": 1, "count": 5 }),
        )
        .await;
    assert_eq!(names_of(&tail), vec!["items"]);

    client.disconnect().await;
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn inspection_requires_a_stopped_debuggee() {
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

    for (command, args) in [
        ("threads", json!({})),
        ("stackTrace", json!({ "threadId": 1 })),
        ("scopes", json!({ "frameId": 1 })),
        ("variables", json!({ "variablesReference": 1 })),
        ("continue", json!({ "threadId": 1 })),
    ] {
        let resp = client.request(command, args).await;
        assert!(!is_success(&resp), "{command}: {resp}");
        assert_eq!(message_of(&resp), "not stopped", "{command}");
    }

    client.disconnect().await;
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn stepping_reports_step_stops() {
    let server = MockDebugServer::spawn().await.unwrap();
    let (client, server_task) = spawn_server();
    client.initialize_handshake().await;
    client.attach_mock(server.port()).await;
    client.set_breakpoints(APP, &[3]).await;
    client.configuration_done().await;
    client.wait_for_stopped_reason("breakpoint").await;

    client.request_ok("next", json!({ "threadId": 1 })).await;
    client.wait_for_event("continued").await;
    client.wait_for_stopped_reason("step").await;
    let trace = client.stack_trace(1).await;
    assert_eq!(
        trace
            .pointer("/body/stackFrames/0/line")
            .and_then(Value::as_i64),
        Some(4)
    );

    let bad = client.request("stepIn", json!({ "threadId": 99 })).await;
    assert!(!is_success(&bad));
    assert_eq!(message_of(&bad), "invalid reference 99");
    assert_eq!(server.step_calls(), 2);

    let threads = client.request_ok("threads", json!({})).await;
    assert_eq!(
        threads.pointer("/body/threads/0/name"),
        Some(&json!("MainThread"))
    );

    client.disconnect().await;
    server_task.await.unwrap().unwrap();
}
