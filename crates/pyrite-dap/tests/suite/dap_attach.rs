use std::time::{Duration, Instant};

use pyrite_wire::mock::{MockDebugServer, MockDebugServerConfig};
use serde_json::{json, Value};

use crate::harness::{
    is_success, message_of, spawn_server, spawn_server_with_options, test_server_options,
    unused_port,
};

fn holding_server_config() -> MockDebugServerConfig {
    MockDebugServerConfig {
        hold_on_resume: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn attach_to_closed_port_fails_within_timeout() {
    let port = unused_port().await;
    let options = test_server_options();
    let registry = options.registry.clone();
    let (client, server_task) = spawn_server_with_options(options);
    client.initialize_handshake().await;

    let started = Instant::now();
    let resp = client
        .attach(json!({ "host": "127.0.0.1", "port": port, "timeout": 300 }))
        .await;
    assert!(!is_success(&resp), "{resp}");
    assert!(
        message_of(&resp).contains("could not connect"),
        "{resp}"
    );
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "attach should give up after its timeout"
    );
    assert!(registry.is_empty(), "failed attach must not hold the endpoint");

    client.disconnect().await;
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn second_attach_to_same_endpoint_is_rejected() {
    let server = MockDebugServer::spawn_with_config(holding_server_config())
        .await
        .unwrap();
    let options = test_server_options();

    let (first, first_task) = spawn_server_with_options(options.clone());
    first.initialize_handshake().await;
    first.attach_mock(server.port()).await;

    let (second, second_task) = spawn_server_with_options(options);
    second.initialize_handshake().await;
    let rejected = second
        .attach(json!({ "host": "localhost", "port": server.port() }))
        .await;
    assert!(!is_success(&rejected), "{rejected}");
    assert_eq!(
        message_of(&rejected),
        format!("already attached to 127.0.0.1:{}", server.port())
    );
    assert_eq!(server.connections(), 1);

    // The same session attaching twice is rejected too.
    let again = first
        .attach(json!({ "host": "127.0.0.1", "port": server.port() }))
        .await;
    assert!(!is_success(&again), "{again}");
    assert!(message_of(&again).starts_with("already attached"), "{again}");

    // The first session is unaffected.
    let bp = first.set_breakpoints("/srv/app.py", &[3]).await;
    assert!(is_success(&bp), "{bp}");
    first.configuration_done().await;
    first.wait_for_stopped_reason("breakpoint").await;

    first.disconnect().await;
    first_task.await.unwrap().unwrap();
    second.disconnect().await;
    second_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn endpoint_is_released_after_disconnect() {
    let server = MockDebugServer::spawn_with_config(holding_server_config())
        .await
        .unwrap();
    let options = test_server_options();
    let registry = options.registry.clone();

    let (first, first_task) = spawn_server_with_options(options.clone());
    first.initialize_handshake().await;
    first.attach_mock(server.port()).await;
    assert!(registry.is_claimed(&format!("127.0.0.1:{}", server.port())));

    first.disconnect().await;
    first_task.await.unwrap().unwrap();
    assert!(registry.is_empty());

    let (second, second_task) = spawn_server_with_options(options);
    second.initialize_handshake().await;
    second.attach_mock(server.port()).await;
    second.disconnect().await;
    second_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn attach_translates_paths_both_ways() {
    let server = MockDebugServer::spawn().await.unwrap();
    let (client, server_task) = spawn_server();
    client.initialize_handshake().await;

    let resp = client
        .attach(json!({
            "host": "127.0.0.1",
            "port": server.port(),
            "pathMappings": [{ "localRoot": "/home/dev/shop", "remoteRoot": "/srv/app" }],
        }))
        .await;
    assert!(is_success(&resp), "{resp}");

    let local = "/home/dev/shop/orders/views.py";
    let bp = client.set_breakpoints(local, &[12]).await;
    assert!(is_success(&bp), "{bp}");
    assert_eq!(
        bp.pointer("/body/breakpoints/0/source/path")
            .and_then(Value::as_str),
        Some(local)
    );
    assert_eq!(server.breakpoint_lines("/srv/app/orders/views.py"), vec![12]);
    assert!(server.breakpoint_lines(local).is_empty());

    client.configuration_done().await;
    client.wait_for_stopped_reason("breakpoint").await;
    let trace = client.stack_trace(1).await;
    assert_eq!(
        trace
            .pointer("/body/stackFrames/0/source/path")
            .and_then(Value::as_str),
        Some(local),
        "{trace}"
    );
    assert_eq!(
        trace
            .pointer("/body/stackFrames/0/source/name")
            .and_then(Value::as_str),
        Some("views.py")
    );

    client.disconnect().await;
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn attach_forwards_debug_options() {
    let server = MockDebugServer::spawn().await.unwrap();
    let (client, server_task) = spawn_server();
    client.initialize_handshake().await;

    let resp = client
        .attach(json!({
            "host": "127.0.0.1",
            "port": server.port(),
            "redirectOutput": true,
            "django": true,
        }))
        .await;
    assert!(is_success(&resp), "{resp}");
    let options = server.debug_options();
    assert!(options.iter().any(|opt| opt == "RedirectOutput"), "{options:?}");
    assert!(options.iter().any(|opt| opt == "Django"), "{options:?}");

    client.disconnect().await;
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn attach_requires_a_port() {
    let (client, server_task) = spawn_server();
    client.initialize_handshake().await;

    let resp = client.attach(json!({ "host": "127.0.0.1" })).await;
    assert!(!is_success(&resp), "{resp}");
    assert!(message_of(&resp).contains("port"), "{resp}");

    client.disconnect().await;
    server_task.await.unwrap().unwrap();
}
