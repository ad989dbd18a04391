use pyrite_wire::mock::{MockDebugServer, MockDebugServerConfig};
use serde_json::{json, Value};

use crate::harness::{
    is_event, is_success, message_of, pid_alive, read_pid_file, spawn_server, unused_port,
    wait_until,
};

#[tokio::test]
async fn launch_stops_at_breakpoint_and_runs_to_exit() {
    let dir = tempfile::tempdir().unwrap();
    let program = dir.path().join("app.py");
    let program = program.to_str().unwrap();
    let pid_file = dir.path().join("debuggee.pid");
    let server = MockDebugServer::spawn().await.unwrap();

    let (client, server_task) = spawn_server();
    client.initialize_handshake().await;

    let launch = client
        .launch(json!({
            "program": program,
            "port": server.port(),
            "redirectOutput": true,
            "args": ["--pid-file", pid_file.to_str().unwrap(), "--sleep-ms", "30000"],
        }))
        .await;
    assert!(is_success(&launch), "launch failed: {launch}");
    assert!(
        server.debug_options().iter().any(|opt| opt == "RedirectOutput"),
        "debug options not forwarded: {:?}",
        server.debug_options()
    );

    let bp = client.set_breakpoints(program, &[7]).await;
    assert!(is_success(&bp), "{bp}");
    assert_eq!(
        bp.pointer("/body/breakpoints/0/verified")
            .and_then(Value::as_bool),
        Some(true),
        "{bp}"
    );
    assert_eq!(
        bp.pointer("/body/breakpoints/0/line").and_then(Value::as_i64),
        Some(7)
    );
    assert_eq!(server.breakpoint_lines(program), vec![7]);

    client.configuration_done().await;
    let stopped = client.wait_for_stopped_reason("breakpoint").await;
    assert_eq!(
        stopped.pointer("/body/threadId").and_then(Value::as_i64),
        Some(1)
    );
    assert!(
        stopped.pointer("/body/hitBreakpointIds/0").is_some(),
        "expected the hit breakpoint id: {stopped}"
    );

    let trace = client.stack_trace(1).await;
    assert!(is_success(&trace), "{trace}");
    assert_eq!(
        trace
            .pointer("/body/stackFrames/0/line")
            .and_then(Value::as_i64),
        Some(7)
    );
    assert_eq!(
        trace
            .pointer("/body/stackFrames/0/source/path")
            .and_then(Value::as_str),
        Some(program)
    );

    let pid = read_pid_file(&pid_file).await;
    client.continue_().await;

    let exited = client.wait_for_event("exited").await;
    assert_eq!(
        exited.pointer("/body/exitCode").and_then(Value::as_i64),
        Some(0)
    );
    client.wait_for_event("terminated").await;

    let transcript = client.take_transcript().await;
    let exited_at = transcript.iter().position(|msg| is_event(msg, "exited"));
    let terminated_at = transcript
        .iter()
        .position(|msg| is_event(msg, "terminated"));
    assert!(
        exited_at < terminated_at,
        "`exited` must precede `terminated`: {transcript:?}"
    );

    // The launcher still slept; the adapter owns it and stops it.
    wait_until("debuggee to be stopped", || !pid_alive(pid)).await;

    client.disconnect().await;
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn launch_waits_for_a_debug_server_that_comes_up_late() {
    let dir = tempfile::tempdir().unwrap();
    let program = dir.path().join("app.py");
    let port = unused_port().await;

    let (client, server_task) = spawn_server();
    client.initialize_handshake().await;

    let late = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        MockDebugServer::spawn_on_port(port).await.unwrap()
    });

    let launch = client
        .launch(json!({
            "program": program.to_str().unwrap(),
            "port": port,
            "args": ["--sleep-ms", "30000"],
        }))
        .await;
    assert!(is_success(&launch), "launch failed: {launch}");
    let server = late.await.unwrap();
    assert_eq!(server.connections(), 1);

    let disconnect = client.disconnect().await;
    assert!(is_success(&disconnect), "{disconnect}");
    client.wait_for_event("terminated").await;
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn launch_reports_a_missing_interpreter() {
    let dir = tempfile::tempdir().unwrap();
    let program = dir.path().join("app.py");

    let (client, server_task) = spawn_server();
    client.initialize_handshake().await;

    let launch = client
        .launch(json!({
            "program": program.to_str().unwrap(),
            "pythonPath": dir.path().join("no-such-python").to_str().unwrap(),
        }))
        .await;
    assert!(!is_success(&launch), "{launch}");
    assert!(
        message_of(&launch).contains("failed to launch"),
        "{launch}"
    );

    client.disconnect().await;
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn early_exit_reports_exit_code_and_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let program = dir.path().join("app.py");
    let port = unused_port().await;

    let (client, server_task) = spawn_server();
    client.initialize_handshake().await;

    let launch = client
        .launch(json!({
            "program": program.to_str().unwrap(),
            "port": port,
            "args": ["--stderr", "ModuleNotFoundError: No module named 'app'", "--exit-code", "1"],
        }))
        .await;
    assert!(!is_success(&launch), "{launch}");
    let message = message_of(&launch);
    assert!(message.contains("exited with code 1"), "{message}");
    assert!(message.contains("ModuleNotFoundError"), "{message}");

    client.disconnect().await;
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn debuggee_crash_surfaces_stderr_tail() {
    let dir = tempfile::tempdir().unwrap();
    let program = dir.path().join("app.py");
    let server = MockDebugServer::spawn_with_config(MockDebugServerConfig {
        hold_on_resume: true,
        ..Default::default()
    })
    .await
    .unwrap();

    let (client, server_task) = spawn_server();
    client.initialize_handshake().await;

    let launch = client
        .launch(json!({
            "program": program.to_str().unwrap(),
            "port": server.port(),
            "redirectOutput": true,
            "args": ["--sleep-ms", "1000", "--stderr", "Traceback: boom", "--exit-code", "2"],
        }))
        .await;
    assert!(is_success(&launch), "launch failed: {launch}");
    client.configuration_done().await;

    let exited = client.wait_for_event("exited").await;
    assert_eq!(
        exited.pointer("/body/exitCode").and_then(Value::as_i64),
        Some(2)
    );
    client.wait_for_event("terminated").await;

    let transcript = client.take_transcript().await;
    let report = transcript
        .iter()
        .filter(|msg| is_event(msg, "output"))
        .filter_map(|msg| msg.pointer("/body/output").and_then(Value::as_str))
        .find(|text| text.contains("terminated unexpectedly"))
        .unwrap_or_else(|| panic!("no crash report in {transcript:?}"));
    assert!(report.contains("Traceback: boom"), "{report}");

    client.disconnect().await;
    server_task.await.unwrap().unwrap();
}
