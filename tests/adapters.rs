//! Node adapters against local SSE and WebSocket servers.

use std::sync::Arc;
use std::time::Duration;

use ethtop::beacon;
use ethtop::config::Config;
use ethtop::execution;
use ethtop::source::{EventKind, EventSink, NodeSource, SourceError};
use ethtop::supervisor::Supervisor;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(5);

/// Serve one SSE response with `body`, then close the connection.
async fn serve_sse_once(body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut request = vec![0u8; 4096];
        let n = stream.read(&mut request).await.expect("read request");
        let request = String::from_utf8_lossy(&request[..n]);
        assert!(request.starts_with("GET /eth/v1/events?topics=head "), "{request}");

        let head = "HTTP/1.1 200 OK\r\n\
                    Content-Type: text/event-stream\r\n\
                    Connection: close\r\n\r\n";
        stream.write_all(head.as_bytes()).await.expect("write head");
        // Split mid-frame to exercise incremental decoding.
        let (a, b) = body.split_at(body.len() / 2);
        stream.write_all(a.as_bytes()).await.expect("write body");
        stream.flush().await.expect("flush");
        tokio::time::sleep(Duration::from_millis(20)).await;
        stream.write_all(b.as_bytes()).await.expect("write body");
        stream.shutdown().await.expect("shutdown");
    });

    format!("http://{addr}")
}

#[tokio::test]
async fn test_beacon_stream_delivers_head_slots() {
    let body = ": keepalive\n\n\
                event: head\ndata: {\"slot\":\"100\",\"epoch_transition\":false}\n\n\
                event: block\ndata: {\"slot\":\"101\"}\n\n\
                event: head\r\ndata: {\"slot\":\"-4\"}\r\n\r\n\
                event: head\ndata: {\"slot\":\"128\",\"epoch_transition\":true}\n\n";
    let url = serve_sse_once(body).await;

    let client = beacon::Client::new(&url, TIMEOUT).expect("client");
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(16);
    let sink = EventSink::new(EventKind::Slots, tx, cancel.clone());

    let result = tokio::time::timeout(TIMEOUT, client.stream_slots(&sink, &cancel))
        .await
        .expect("stream ends in time");
    assert!(matches!(result, Err(SourceError::Disconnected(_))), "{result:?}");

    let first = rx.recv().await.expect("first slot");
    assert_eq!((first.slot, first.epoch, first.epoch_transition), (100, 3, false));
    let second = rx.recv().await.expect("second slot");
    assert_eq!((second.slot, second.epoch, second.epoch_transition), (128, 4, true));
    assert!(rx.try_recv().is_err());

    let stats = sink.stats().snapshot();
    assert_eq!(stats.delivered, 2);
    assert_eq!(stats.malformed, 1);
}

#[tokio::test]
async fn test_beacon_refused_connection_is_connect_error() {
    // Bind then drop to get a port nothing listens on.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let client = beacon::Client::new(&format!("http://{addr}"), TIMEOUT).expect("client");
    let cancel = CancellationToken::new();
    let (tx, _rx) = mpsc::channel(1);
    let sink = EventSink::new(EventKind::Slots, tx, cancel.clone());

    let result = client.stream_slots(&sink, &cancel).await;
    assert!(matches!(result, Err(SourceError::Connect { .. })), "{result:?}");
}

/// Accept connections, optionally send `preamble`, then stay silent.
async fn serve_silent(preamble: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut request = vec![0u8; 4096];
            let _ = stream.read(&mut request).await;
            let _ = stream.write_all(preamble.as_bytes()).await;
            held.push(stream);
        }
    });

    format!("http://{addr}")
}

#[tokio::test]
async fn test_beacon_silent_server_fails_to_connect() {
    let url = serve_silent("").await;

    let client = beacon::Client::new(&url, Duration::from_millis(200)).expect("client");
    let cancel = CancellationToken::new();
    let (tx, _rx) = mpsc::channel(1);
    let sink = EventSink::new(EventKind::Slots, tx, cancel.clone());

    let result = tokio::time::timeout(Duration::from_secs(3), client.stream_slots(&sink, &cancel))
        .await
        .expect("attempt gives up before the outer deadline");
    assert!(matches!(result, Err(SourceError::Connect { .. })), "{result:?}");
}

#[tokio::test]
async fn test_beacon_idle_stream_is_disconnected() {
    let url = serve_silent(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/event-stream\r\n\r\n\
         : connected\n\n",
    )
    .await;

    let client = beacon::Client::new(&url, Duration::from_millis(500))
        .expect("client")
        .with_idle_timeout(Duration::from_millis(200));
    let cancel = CancellationToken::new();
    let (tx, _rx) = mpsc::channel(1);
    let sink = EventSink::new(EventKind::Slots, tx, cancel.clone());

    let result = tokio::time::timeout(Duration::from_secs(3), client.stream_slots(&sink, &cancel))
        .await
        .expect("idle stream gives up before the outer deadline");
    match result {
        Err(SourceError::Disconnected(reason)) => assert!(reason.contains("idle"), "{reason}"),
        other => panic!("expected idle disconnect, got {other:?}"),
    }
}

#[tokio::test]
async fn test_supervisor_start_fails_against_silent_beacon() {
    let http = serve_silent("").await;
    let ws_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let ws_addr = ws_listener.local_addr().expect("addr");
    tokio::spawn(async move {
        while let Ok((stream, _)) = ws_listener.accept().await {
            tokio::spawn(async move {
                let mut ws = tokio_tungstenite::accept_async(stream).await.expect("handshake");
                let _ = ws.next().await;
                let reply = r#"{"jsonrpc":"2.0","id":1,"result":"0xfeed"}"#;
                let _ = ws.send(Message::Text(reply.to_string())).await;
                let _ = ws.next().await;
            });
        }
    });

    let mut cfg = Config::default();
    cfg.rpc.http = http;
    cfg.rpc.ws = format!("ws://{ws_addr}");
    cfg.subscription.connect_timeout = Duration::from_millis(200);

    let source = Arc::new(NodeSource::new(&cfg).expect("source"));
    let result = tokio::time::timeout(
        Duration::from_secs(3),
        Supervisor::start(source, &cfg.subscription, CancellationToken::new()),
    )
    .await
    .expect("start returns instead of hanging");

    let err = result.err().expect("silent beacon is fatal at startup");
    assert!(format!("{err:#}").contains("slots"), "{err:#}");
}

fn notification(number: u64) -> String {
    format!(
        r#"{{"jsonrpc":"2.0","method":"eth_subscription","params":{{"subscription":"0xfeed","result":{{"number":"0x{number:x}","hash":"0x{number:064x}","parentHash":"0x{:064x}","timestamp":"0x65a8f2c0"}}}}}}"#,
        number - 1
    )
}

#[tokio::test]
async fn test_execution_stream_delivers_heads_after_subscribing() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = tokio_tungstenite::accept_async(stream).await.expect("handshake");

        let request = match ws.next().await {
            Some(Ok(Message::Text(text))) => text,
            other => panic!("expected subscribe request, got {other:?}"),
        };
        assert!(request.contains("eth_subscribe"));
        assert!(request.contains("newHeads"));

        ws.send(Message::Text(r#"{"jsonrpc":"2.0","id":1,"result":"0xfeed"}"#.to_string()))
            .await
            .expect("reply");
        ws.send(Message::Text(notification(0x1b4))).await.expect("head");
        ws.send(Message::Text("{not json".to_string())).await.expect("garbage");
        ws.send(Message::Text(notification(0x1b5))).await.expect("head");
        ws.close(None).await.expect("close");
    });

    let client = execution::Client::new(&format!("ws://{addr}"), TIMEOUT).expect("client");
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(16);
    let sink = EventSink::new(EventKind::Heads, tx, cancel.clone());

    let result = tokio::time::timeout(TIMEOUT, client.stream_heads(&sink, &cancel))
        .await
        .expect("stream ends in time");
    assert!(matches!(result, Err(SourceError::Disconnected(_))), "{result:?}");

    let numbers: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok())
        .map(|h| h.number)
        .collect();
    assert_eq!(numbers, vec![0x1b4, 0x1b5]);

    let stats = sink.stats().snapshot();
    assert_eq!(stats.delivered, 2);
    assert_eq!(stats.malformed, 1);
}

#[tokio::test]
async fn test_execution_subscribe_error_is_connect_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = tokio_tungstenite::accept_async(stream).await.expect("handshake");
        let _ = ws.next().await;
        let reply = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"notifications not supported"}}"#;
        ws.send(Message::Text(reply.to_string())).await.expect("reply");
        // Hold the socket open; the client should give up on its own.
        let _ = ws.next().await;
    });

    let client = execution::Client::new(&format!("ws://{addr}"), TIMEOUT).expect("client");
    let cancel = CancellationToken::new();
    let (tx, _rx) = mpsc::channel(1);
    let sink = EventSink::new(EventKind::Heads, tx, cancel.clone());

    match client.stream_heads(&sink, &cancel).await {
        Err(SourceError::Connect { reason, .. }) => {
            assert!(reason.contains("notifications not supported"), "{reason}");
        }
        other => panic!("expected connect error, got {other:?}"),
    }
}
