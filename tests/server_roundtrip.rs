// ABOUTME: TCP front end tests: JSON request lines in, JSON response or NDJSON stream out

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use common::sh_config;
use kernelpool::server::KernelServer;
use kernelpool::KernelStatus;

struct Running {
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
    service: std::sync::Arc<kernelpool::KernelService>,
}

async fn start() -> Running {
    let config = sh_config();
    let service = common::service(&config);
    let server = KernelServer::bind(&config.listen_addr, std::sync::Arc::clone(&service))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();

    let (stop, rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        server
            .run(async {
                let _ = rx.await;
            })
            .await
            .unwrap();
    });

    Running {
        addr,
        stop,
        handle,
        service,
    }
}

impl Running {
    async fn finish(self) {
        self.service.pool().shutdown_all().await;
        self.stop.send(()).unwrap();
        self.handle.await.unwrap();
    }
}

async fn send(addr: SocketAddr, request: &str) -> Vec<Value> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    stream.write_all(b"\n").await.unwrap();

    let mut reply = String::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_string(&mut reply))
        .await
        .unwrap()
        .unwrap();

    reply
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[tokio::test]
async fn test_admin_operations() {
    let server = start().await;
    let addr = server.addr;

    let reply = send(addr, r#"{"op":"ready"}"#).await;
    assert_eq!(reply, vec![serde_json::json!({"statusCode": 200, "data": "ready"})]);

    let reply = send(addr, r#"{"op":"start","kernelId":"k1"}"#).await;
    assert_eq!(reply[0]["statusCode"], 200);

    let reply = send(addr, r#"{"op":"status","kernelId":"k1"}"#).await;
    assert_eq!(reply[0]["data"], "running");

    let reply = send(addr, r#"{"op":"interrupt","kernelId":"k1"}"#).await;
    assert_eq!(reply[0]["statusCode"], 200);

    let reply = send(addr, r#"{"op":"restart","kernelId":"k1"}"#).await;
    assert_eq!(reply[0]["statusCode"], 200);

    let reply = send(addr, r#"{"op":"shutdown","kernelId":"k1"}"#).await;
    assert_eq!(reply[0]["statusCode"], 200);

    let reply = send(addr, r#"{"op":"status","kernelId":"k1"}"#).await;
    assert_eq!(reply[0]["data"], "stopped");

    server.finish().await;
}

#[tokio::test]
async fn test_execute_over_tcp() {
    let server = start().await;

    let lines = send(server.addr, r#"{"op":"execute","kernelId":"k1","code":"print(1)"}"#).await;

    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["msg_type"], "execute_input");
    assert_eq!(lines[0]["content"]["execution_count"], 1);
    assert_eq!(lines[1]["msg_type"], "stream");

    server.finish().await;
}

#[tokio::test]
async fn test_start_failure_reports_500() {
    let server = start().await;

    let reply = send(
        server.addr,
        r#"{"op":"start","kernelId":"k1","kernelName":"cobol"}"#,
    )
    .await;
    assert_eq!(reply[0]["statusCode"], 500);
    assert!(reply[0]["message"].as_str().unwrap().contains("cobol"));

    server.finish().await;
}

#[tokio::test]
async fn test_malformed_lines_get_400() {
    let server = start().await;

    for bad in ["{}", "{\"op\":\"start\"}", "garbage"] {
        let reply = send(server.addr, bad).await;
        assert_eq!(reply[0]["statusCode"], 400, "request {bad}");
    }

    // Not valid UTF-8
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(b"{\"op\":\"status\",\"kernelId\":\"\xff\xfe\"}\n")
        .await
        .unwrap();
    let mut reply = String::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_string(&mut reply))
        .await
        .unwrap()
        .unwrap();
    let reply: Value = serde_json::from_str(reply.trim()).unwrap();
    assert_eq!(reply["statusCode"], 400);

    server.finish().await;
}

#[tokio::test]
async fn test_client_disconnect_mid_stream_keeps_kernel() {
    let server = start().await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(b"{\"op\":\"execute\",\"kernelId\":\"k1\",\"code\":\"1\"}\n")
        .await
        .unwrap();

    // Read one line, then hang up
    let mut reader = BufReader::new(stream);
    let mut first = String::new();
    tokio::time::timeout(Duration::from_secs(10), reader.read_line(&mut first))
        .await
        .unwrap()
        .unwrap();
    assert!(first.contains("execute_input"));
    drop(reader);

    // Let the abandoned execution's remaining events drain
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(server.service.pool().status("k1"), KernelStatus::Running);

    let lines = send(server.addr, r#"{"op":"execute","kernelId":"k1","code":"2"}"#).await;
    assert_eq!(lines[0]["content"]["execution_count"], 2);

    server.finish().await;
}
