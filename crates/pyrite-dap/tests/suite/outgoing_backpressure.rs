use std::time::Duration;

use serde_json::{json, Value};

use crate::harness::{
    is_event, is_response_to, is_success, pid_alive, read_pid_file, spawn_server, wait_until,
};

const DEADLINE: Duration = Duration::from_secs(10);

fn flood_launch(program: &str, pid_file: &str) -> Value {
    json!({
        "program": program,
        "noDebug": true,
        "args": ["--pid-file", pid_file, "--flood"],
    })
}

#[tokio::test]
async fn requests_are_answered_while_the_debuggee_floods_output() {
    let dir = tempfile::tempdir().unwrap();
    let program = dir.path().join("app.py");
    let pid_file = dir.path().join("debuggee.pid");

    let (client, server_task) = spawn_server();
    client.initialize_handshake().await;
    let launch = client
        .launch(flood_launch(
            program.to_str().unwrap(),
            pid_file.to_str().unwrap(),
        ))
        .await;
    assert!(is_success(&launch), "{launch}");
    let pid = read_pid_file(&pid_file).await;

    // Let every queue between the debuggee and the editor fill up.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let seq = client.send_request("threads", json!({})).await;
    let threads = tokio::time::timeout(
        DEADLINE,
        client.skip_output_until("threads response", |msg| is_response_to(msg, seq)),
    )
    .await
    .expect("threads must not wait behind the output flood");
    assert!(is_success(&threads), "{threads}");

    let seq = client.send_request("disconnect", json!({})).await;
    let resp = client
        .skip_output_until("disconnect response", |msg| is_response_to(msg, seq))
        .await;
    assert!(is_success(&resp), "{resp}");
    client
        .skip_output_until("terminated event", |msg| is_event(msg, "terminated"))
        .await;

    tokio::time::timeout(DEADLINE, server_task)
        .await
        .expect("server task did not finish")
        .unwrap()
        .unwrap();
    wait_until("flooding debuggee to be killed", || !pid_alive(pid)).await;
}

#[tokio::test]
async fn dropping_the_editor_ends_a_flooding_session() {
    let dir = tempfile::tempdir().unwrap();
    let program = dir.path().join("app.py");
    let pid_file = dir.path().join("debuggee.pid");

    let (client, server_task) = spawn_server();
    client.initialize_handshake().await;
    let launch = client
        .launch(flood_launch(
            program.to_str().unwrap(),
            pid_file.to_str().unwrap(),
        ))
        .await;
    assert!(is_success(&launch), "{launch}");
    let pid = read_pid_file(&pid_file).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    drop(client);

    tokio::time::timeout(DEADLINE, server_task)
        .await
        .expect("server task did not finish")
        .unwrap()
        .unwrap();
    wait_until("flooding debuggee to be killed", || !pid_alive(pid)).await;
}
