use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;

use pyrite_dap::dap::DapReader;

use crate::harness::{is_success, message_of, spawn_server, test_server_options};

#[tokio::test]
async fn malformed_message_is_skipped_without_echoing_it() {
    let (client, server_stream) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server_stream);
    let options = test_server_options();
    let server_task =
        tokio::spawn(async move { pyrite_dap::run(server_read, server_write, options).await });

    let (client_read, mut client_write) = tokio::io::split(client);
    let mut reader = DapReader::new(client_read);

    let broken = br#"{"seq": 1, "type": "request", "command": "launch", "arguments": {"env": {"API_TOKEN": "hunter2"}"#;
    let initialize = serde_json::to_vec(&json!({
        "seq": 2,
        "type": "request",
        "command": "initialize",
        "arguments": {},
    }))
    .unwrap();
    for body in [&broken[..], &initialize[..]] {
        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        client_write.write_all(header.as_bytes()).await.unwrap();
        client_write.write_all(body).await.unwrap();
    }

    let resp: Value = reader.read_value().await.unwrap().unwrap();
    assert_eq!(resp["request_seq"], json!(2), "{resp}");
    assert!(is_success(&resp), "{resp}");
    assert!(!resp.to_string().contains("hunter2"));

    drop(client_write);
    drop(reader);
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn invalid_arguments_are_reported_without_values() {
    let (client, server_task) = spawn_server();
    client.initialize_handshake().await;

    let resp = client
        .request(
            "launch",
            json!({ "program": "app.py", "args": "--password=hunter2" }),
        )
        .await;
    assert!(!is_success(&resp), "{resp}");
    let message = message_of(&resp);
    assert!(message.starts_with("invalid arguments"), "{message}");
    assert!(!message.contains("hunter2"), "{message}");

    client.disconnect().await;
    server_task.await.unwrap().unwrap();
}
