use std::time::{Duration, Instant};

use serde_json::json;

use crate::harness::{
    is_success, message_of, spawn_server_with_options, test_server_options, unused_port,
};

#[tokio::test]
async fn cancel_aborts_a_pending_attach() {
    let port = unused_port().await;
    let options = test_server_options();
    let registry = options.registry.clone();
    let (client, server_task) = spawn_server_with_options(options);
    client.initialize_handshake().await;

    let started = Instant::now();
    let attach = client
        .send_request(
            "attach",
            json!({ "host": "127.0.0.1", "port": port, "timeout": 30_000 }),
        )
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let cancel = client
        .request("cancel", json!({ "requestId": attach }))
        .await;
    assert!(is_success(&cancel), "{cancel}");

    let resp = client.wait_for_response(attach).await;
    assert!(!is_success(&resp), "{resp}");
    assert_eq!(message_of(&resp), "cancelled");
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(registry.is_empty());

    // The session can still attach afterwards.
    let retry = client.request("attach", json!({ "port": port, "timeout": 100 })).await;
    assert!(message_of(&retry).contains("could not connect"), "{retry}");

    client.disconnect().await;
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn cancel_for_unknown_request_is_acknowledged() {
    let (client, server_task) = spawn_server_with_options(test_server_options());
    let cancel = client
        .request("cancel", json!({ "requestId": 4242 }))
        .await;
    assert!(is_success(&cancel), "{cancel}");

    client.initialize_handshake().await;
    client.disconnect().await;
    server_task.await.unwrap().unwrap();
}
