use pyrite_wire::mock::{MockDebugServer, MockDebugServerConfig};
use serde_json::{json, Value};

use crate::harness::{
    is_event, is_success, message_of, pid_alive, read_pid_file, spawn_server, wait_until,
};

#[tokio::test]
async fn attach_disconnect_detaches_without_ending_the_debuggee() {
    let server = MockDebugServer::spawn_with_config(MockDebugServerConfig {
        hold_on_resume: true,
        ..Default::default()
    })
    .await
    .unwrap();

    let (client, server_task) = spawn_server();
    client.initialize_handshake().await;
    client.attach_mock(server.port()).await;
    client.set_breakpoints("/srv/app.py", &[4]).await;
    client.configuration_done().await;
    client.wait_for_stopped_reason("breakpoint").await;

    let resp = client.disconnect().await;
    assert!(is_success(&resp), "{resp}");
    client.wait_for_event("terminated").await;
    server_task.await.unwrap().unwrap();

    assert_eq!(server.detach_calls(), 1);
    assert!(!server.is_suspended(), "detach must leave the debuggee running");
    assert!(server.breakpoint_lines("/srv/app.py").is_empty());
    wait_until("debug server connection to close", || {
        server.active_connections() == 0
    })
    .await;

    let transcript = client.take_transcript().await;
    assert!(
        !transcript.iter().any(|msg| is_event(msg, "exited")),
        "attach sessions do not know an exit code: {transcript:?}"
    );
}

#[tokio::test]
async fn launch_disconnect_kills_the_debuggee() {
    let dir = tempfile::tempdir().unwrap();
    let program = dir.path().join("app.py");
    let pid_file = dir.path().join("debuggee.pid");

    let (client, server_task) = spawn_server();
    client.initialize_handshake().await;
    let launch = client
        .launch(json!({
            "program": program.to_str().unwrap(),
            "noDebug": true,
            "args": ["--pid-file", pid_file.to_str().unwrap(), "--sleep-ms", "30000"],
        }))
        .await;
    assert!(is_success(&launch), "{launch}");
    client.configuration_done().await;

    let pid = read_pid_file(&pid_file).await;
    assert!(pid_alive(pid));

    let resp = client.disconnect().await;
    assert!(is_success(&resp), "{resp}");
    client.wait_for_event("terminated").await;
    server_task.await.unwrap().unwrap();

    wait_until("debuggee to be killed", || !pid_alive(pid)).await;
}

#[tokio::test]
async fn every_request_after_terminate_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let program = dir.path().join("app.py");

    let (client, server_task) = spawn_server();
    client.initialize_handshake().await;
    let launch = client
        .launch(json!({
            "program": program.to_str().unwrap(),
            "noDebug": true,
            "args": ["--sleep-ms", "30000"],
        }))
        .await;
    assert!(is_success(&launch), "{launch}");

    client.request_ok("terminate", json!({})).await;
    client.wait_for_event("terminated").await;

    let threads = client.request("threads", json!({})).await;
    assert!(!is_success(&threads), "{threads}");
    assert_eq!(message_of(&threads), "session terminated");

    let again = client.request("terminate", json!({})).await;
    assert!(!is_success(&again), "{again}");
    assert_eq!(message_of(&again), "session terminated");

    // Still ends the connection even though the session is already gone.
    let resp = client.disconnect().await;
    assert!(!is_success(&resp), "{resp}");
    assert_eq!(message_of(&resp), "session terminated");
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn closing_the_editor_stream_stops_the_debuggee() {
    let dir = tempfile::tempdir().unwrap();
    let program = dir.path().join("app.py");
    let pid_file = dir.path().join("debuggee.pid");

    let (client, server_task) = spawn_server();
    client.initialize_handshake().await;
    let launch = client
        .launch(json!({
            "program": program.to_str().unwrap(),
            "noDebug": true,
            "args": ["--pid-file", pid_file.to_str().unwrap(), "--sleep-ms", "30000"],
        }))
        .await;
    assert!(is_success(&launch), "{launch}");
    let pid = read_pid_file(&pid_file).await;

    drop(client);
    server_task.await.unwrap().unwrap();
    wait_until("debuggee to be killed", || !pid_alive(pid)).await;
}

#[tokio::test]
async fn server_exit_reports_exit_code_and_output() {
    let server = MockDebugServer::spawn_with_config(MockDebugServerConfig {
        exit_code: 3,
        exit_output: Some("done\n".to_string()),
        ..Default::default()
    })
    .await
    .unwrap();

    let (client, server_task) = spawn_server();
    client.initialize_handshake().await;
    client.attach_mock(server.port()).await;
    client.configuration_done().await;

    let output = client.wait_for_event("output").await;
    assert_eq!(
        output.pointer("/body/output").and_then(Value::as_str),
        Some("done\n")
    );
    assert_eq!(
        output.pointer("/body/category").and_then(Value::as_str),
        Some("stdout")
    );
    let exited = client.wait_for_event("exited").await;
    assert_eq!(
        exited.pointer("/body/exitCode").and_then(Value::as_i64),
        Some(3)
    );
    client.wait_for_event("terminated").await;
    assert_eq!(server.detach_calls(), 0);

    client.disconnect().await;
    server_task.await.unwrap().unwrap();
}
