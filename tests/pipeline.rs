//! End-to-end pipeline tests: config → wiring → HTTP GET
//!
//! These drive the full ingest-to-fanout path over real sockets: an
//! upstream (file or TCP), the intake buffer, the fan-out worker, and an
//! axum server answering plain HTTP requests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use restreamer::logging::NullLog;
use restreamer::server::{build_router, Config, StreamContext};
use restreamer::{PACKET_SIZE, SYNC_BYTE};

/// Deterministic TS payload of `count` packets
fn pattern(count: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(count * PACKET_SIZE);
    for index in 0..count {
        for offset in 0..PACKET_SIZE {
            data.push(if offset == 0 {
                SYNC_BYTE
            } else {
                (index + offset) as u8
            });
        }
    }
    data
}

/// Wire every stream in `config_json` and serve the router on an ephemeral
/// port. Returns the bound address and the stream contexts.
async fn serve(config_json: &str) -> (SocketAddr, Vec<Arc<StreamContext>>) {
    let config = Config::from_json(config_json).unwrap();

    let mut streams = Vec::new();
    for stream in &config.streams {
        streams.push(StreamContext::start(&config, stream, Arc::new(NullLog)).unwrap());
    }

    let router = build_router(streams.clone(), config.max_connections);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    (addr, streams)
}

async fn poll_check(addr: SocketAddr, path: &str, want: u16) {
    let http = reqwest::Client::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let status = http
            .get(format!("http://{addr}/check{path}"))
            .send()
            .await
            .unwrap()
            .status()
            .as_u16();
        if status == want {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "/check{path} never reached {want}, last {status}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn file_source_delivers_a_byte_exact_body() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pattern.ts");
    let content = pattern(1000);

    // the file does not exist yet: the first failover pass fails, which
    // leaves time to attach the subscriber before the stream drains
    let (addr, _streams) = serve(&format!(
        r#"{{
            "listen": "127.0.0.1:0",
            "timeout": 5,
            "inputbuffer": 100,
            "outputbuffer": 2000,
            "maxconnections": 1,
            "reconnect": 1,
            "streams": [ {{ "serve": "/s", "remote": "file://{}" }} ]
        }}"#,
        path.display()
    ))
    .await;

    let response = reqwest::get(format!("http://{addr}/s")).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "video/mpeg"
    );

    // subscriber is admitted; now let the upstream come up
    std::fs::write(&path, &content).unwrap();

    let body = tokio::time::timeout(Duration::from_secs(10), response.bytes())
        .await
        .expect("body never completed")
        .unwrap();
    assert_eq!(body.len(), 1000 * PACKET_SIZE);
    assert_eq!(&body[..], &content[..]);
}

#[tokio::test]
async fn leading_garbage_is_resynchronized_away() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("glitchy.ts");

    let packets = pattern(3);
    let mut content = vec![0x00, 0x10, 0xff, 0x46, 0x48, 0x99, 0x01, 0x02, 0x03];
    content.extend_from_slice(&[0x20; 8]);
    assert_eq!(content.len(), 17);
    content.extend_from_slice(&packets);

    let (addr, _streams) = serve(&format!(
        r#"{{
            "listen": "127.0.0.1:0",
            "outputbuffer": 64,
            "maxconnections": 1,
            "reconnect": 1,
            "streams": [ {{ "serve": "/glitch", "remote": "file://{}" }} ]
        }}"#,
        path.display()
    ))
    .await;

    let response = reqwest::get(format!("http://{addr}/glitch")).await.unwrap();
    std::fs::write(&path, &content).unwrap();

    let body = tokio::time::timeout(Duration::from_secs(10), response.bytes())
        .await
        .expect("body never completed")
        .unwrap();
    assert_eq!(body.len(), 3 * PACKET_SIZE);
    assert_eq!(&body[..], &packets[..]);
}

#[tokio::test]
async fn admission_caps_at_maxconnections() {
    // an upstream that connects and then stays silent keeps sessions open
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    tokio::spawn(async move {
        let mut sockets = Vec::new();
        loop {
            let (socket, _) = upstream.accept().await.unwrap();
            sockets.push(socket);
        }
    });

    let (addr, _streams) = serve(&format!(
        r#"{{
            "listen": "127.0.0.1:0",
            "maxconnections": 2,
            "reconnect": 1,
            "streams": [ {{ "serve": "/s", "remote": "tcp://{upstream_addr}" }} ]
        }}"#
    ))
    .await;

    let http = reqwest::Client::new();
    let first = http.get(format!("http://{addr}/s")).send().await.unwrap();
    let second = http.get(format!("http://{addr}/s")).send().await.unwrap();
    assert_eq!(first.status().as_u16(), 200);
    assert_eq!(second.status().as_u16(), 200);

    let third = http.get(format!("http://{addr}/s")).send().await.unwrap();
    assert_eq!(third.status().as_u16(), 503);
    assert_eq!(third.text().await.unwrap(), "503 service unavailable");

    // the denied request must not count against the set
    let health: serde_json::Value = http
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["viewer"], 2);
    assert_eq!(health["limit"], 2);

    // a freed slot is reusable
    drop(first);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let retry = http.get(format!("http://{addr}/s")).send().await.unwrap();
        if retry.status().as_u16() == 200 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "slot never became free"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn check_follows_the_upstream_connection() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let (drop_tx, drop_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let (mut socket, _) = upstream.accept().await.unwrap();
        // one frame proves the pull loop is live
        let mut frame = [7u8; PACKET_SIZE];
        frame[0] = SYNC_BYTE;
        socket.write_all(&frame).await.unwrap();
        let _ = drop_rx.await;
    });

    let (addr, _streams) = serve(&format!(
        r#"{{
            "listen": "127.0.0.1:0",
            "maxconnections": 1,
            "reconnect": 0,
            "streams": [ {{ "serve": "/live", "remote": "tcp://{upstream_addr}" }} ]
        }}"#
    ))
    .await;

    poll_check(addr, "/live", 200).await;

    // upstream goes away; with reconnecting disabled the client stays down
    drop(drop_tx);
    poll_check(addr, "/live", 404).await;

    let body = reqwest::get(format!("http://{addr}/check/live"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "404 not found");
}

#[tokio::test]
async fn stats_counts_ingested_packets() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("counted.ts");
    std::fs::write(&path, pattern(42)).unwrap();

    let (addr, streams) = serve(&format!(
        r#"{{
            "listen": "127.0.0.1:0",
            "maxconnections": 1,
            "reconnect": 0,
            "streams": [ {{ "serve": "/s", "remote": "file://{}" }} ]
        }}"#,
        path.display()
    ))
    .await;

    // wait for the file to drain
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while streams[0].stats.snapshot().packets_received < 42 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "file source never drained"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let stats: serde_json::Value = reqwest::get(format!("http://{addr}/stats"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let stream = &stats["streams"][0];
    assert_eq!(stream["name"], "/s");
    assert_eq!(stream["packets_received"], 42);
    assert_eq!(stream["bytes_received"], 42 * PACKET_SIZE as u64);
}
