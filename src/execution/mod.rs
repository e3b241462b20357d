use std::time::Duration;

use anyhow::{bail, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::source::{DecodeError, EventSink, SourceError};

/// Request id used for the single `eth_subscribe` call per connection.
const SUBSCRIBE_REQUEST_ID: u64 = 1;

/// One execution-layer chain head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadEvent {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    pub timestamp: u64,
}

/// A decoded JSON-RPC message received on the subscription socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcMessage {
    /// Reply to `eth_subscribe`, carrying the subscription id.
    Subscribed(String),
    /// `eth_subscription` notification for `newHeads`.
    Head(HeadEvent),
    /// JSON-RPC error reply.
    Error { code: i64, message: String },
    /// Anything else (other ids, unrelated methods).
    Other,
}

/// JSON body of the `eth_subscribe("newHeads")` request.
pub fn subscribe_request() -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": SUBSCRIBE_REQUEST_ID,
        "method": "eth_subscribe",
        "params": ["newHeads"],
    })
    .to_string()
}

/// Parse a `0x`-prefixed hex quantity.
pub fn parse_quantity(field: &'static str, value: &str) -> Result<u64, DecodeError> {
    value
        .strip_prefix("0x")
        .filter(|digits| !digits.is_empty())
        .and_then(|digits| u64::from_str_radix(digits, 16).ok())
        .ok_or_else(|| DecodeError::InvalidQuantity {
            field,
            value: value.to_string(),
        })
}

// --- JSON-RPC envelope structures ---

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
    #[serde(default)]
    params: Option<NotificationParams>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct NotificationParams {
    result: RawHeader,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHeader {
    number: String,
    hash: String,
    parent_hash: String,
    timestamp: String,
}

/// Decode one text frame from the subscription socket.
pub fn decode_message(text: &str) -> Result<RpcMessage, DecodeError> {
    let envelope: Envelope = serde_json::from_str(text)?;

    if let Some(err) = envelope.error {
        return Ok(RpcMessage::Error {
            code: err.code,
            message: err.message,
        });
    }

    if envelope.method.as_deref() == Some("eth_subscription") {
        let Some(params) = envelope.params else {
            return Ok(RpcMessage::Other);
        };
        let raw = params.result;
        return Ok(RpcMessage::Head(HeadEvent {
            number: parse_quantity("number", &raw.number)?,
            hash: raw.hash,
            parent_hash: raw.parent_hash,
            timestamp: parse_quantity("timestamp", &raw.timestamp)?,
        }));
    }

    let is_subscribe_reply = envelope
        .id
        .as_ref()
        .and_then(serde_json::Value::as_u64)
        == Some(SUBSCRIBE_REQUEST_ID);

    if is_subscribe_reply {
        if let Some(serde_json::Value::String(id)) = envelope.result {
            return Ok(RpcMessage::Subscribed(id));
        }
    }

    Ok(RpcMessage::Other)
}

/// Execution node WebSocket client.
pub struct Client {
    endpoint: String,
    connect_timeout: Duration,
}

impl Client {
    /// Create a new execution client for the given `ws://` / `wss://` URL.
    pub fn new(endpoint: &str, connect_timeout: Duration) -> Result<Self> {
        if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
            bail!("execution endpoint must be a ws(s) URL: {endpoint:?}");
        }

        let connect_timeout = if connect_timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            connect_timeout
        };

        Ok(Self {
            endpoint: endpoint.to_string(),
            connect_timeout,
        })
    }

    /// Subscribe to `newHeads` and deliver heads until cancelled, the sink
    /// closes, or the socket fails.
    pub async fn stream_heads(
        &self,
        sink: &EventSink<HeadEvent>,
        cancel: &CancellationToken,
    ) -> Result<(), SourceError> {
        let connect_err = |reason: String| SourceError::Connect {
            endpoint: self.endpoint.clone(),
            reason,
        };

        debug!(url = %self.endpoint, "subscribing to new heads");

        let connect = tokio::time::timeout(
            self.connect_timeout,
            connect_async(self.endpoint.as_str()),
        );
        let (mut ws, _) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = connect => match result {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => return Err(connect_err(e.to_string())),
                Err(_) => return Err(connect_err("connect timed out".to_string())),
            },
        };

        ws.send(Message::Text(subscribe_request()))
            .await
            .map_err(|e| connect_err(format!("sending eth_subscribe: {e}")))?;

        // Wait for the subscription id before reporting the stream as live.
        let subscription = loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = ws.close(None).await;
                    return Ok(());
                }
                msg = tokio::time::timeout(self.connect_timeout, ws.next()) => msg,
            };

            let text = match msg {
                Err(_) => return Err(connect_err("no eth_subscribe reply".to_string())),
                Ok(None) => return Err(connect_err("socket closed before subscribing".to_string())),
                Ok(Some(Err(e))) => return Err(connect_err(e.to_string())),
                Ok(Some(Ok(Message::Text(text)))) => text,
                Ok(Some(Ok(_))) => continue,
            };

            match decode_message(&text) {
                Ok(RpcMessage::Subscribed(id)) => break id,
                Ok(RpcMessage::Error { code, message }) => {
                    return Err(connect_err(format!("eth_subscribe failed ({code}): {message}")))
                }
                Ok(_) => continue,
                Err(e) => return Err(connect_err(format!("decoding eth_subscribe reply: {e}"))),
            }
        };

        sink.mark_established();
        info!(url = %self.endpoint, subscription = %subscription, "new heads subscription open");

        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = ws.close(None).await;
                    return Ok(());
                }
                msg = ws.next() => msg,
            };

            let text = match msg {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .unwrap_or_else(|| "no reason".to_string());
                    return Err(SourceError::Disconnected(format!("socket closed: {reason}")));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(SourceError::Disconnected(e.to_string())),
                None => return Err(SourceError::Disconnected("socket ended".to_string())),
            };

            match decode_message(&text) {
                Ok(RpcMessage::Head(head)) => {
                    if sink.deliver(head).await.is_err() {
                        let _ = ws.close(None).await;
                        return Ok(());
                    }
                }
                Ok(RpcMessage::Error { code, message }) => {
                    warn!(code, message = %message, "execution node reported an error");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "dropping malformed head notification");
                    sink.record_malformed();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOTIFICATION: &str = r#"{
        "jsonrpc": "2.0",
        "method": "eth_subscription",
        "params": {
            "subscription": "0x9ce59a13059e417087c02d3236a0b1cc",
            "result": {
                "number": "0x1b4",
                "hash": "0xdc0818cf78f21a8e70579cb46a43643f78291264dda342ae31049421c82d21ae",
                "parentHash": "0x6ebf4c1b4ecbd8e1a6fbd8b8e33c5f5e12b2bf8a5c1d2a1e8c3f0f0e9d8c7b6a",
                "timestamp": "0x65a8f2c0",
                "miner": "0x0000000000000000000000000000000000000000"
            }
        }
    }"#;

    #[test]
    fn test_subscribe_request_shape() {
        let v: serde_json::Value =
            serde_json::from_str(&subscribe_request()).expect("valid json");
        assert_eq!(v["method"], "eth_subscribe");
        assert_eq!(v["params"][0], "newHeads");
        assert_eq!(v["id"], 1);
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("number", "0x0").ok(), Some(0));
        assert_eq!(parse_quantity("number", "0x1b4").ok(), Some(436));
        assert!(parse_quantity("number", "0x").is_err());
        assert!(parse_quantity("number", "1b4").is_err());
        assert!(parse_quantity("number", "0xzz").is_err());
    }

    #[test]
    fn test_decode_subscription_reply() {
        let msg = decode_message(r#"{"jsonrpc":"2.0","id":1,"result":"0xabc"}"#)
            .expect("valid reply");
        assert_eq!(msg, RpcMessage::Subscribed("0xabc".to_string()));
    }

    #[test]
    fn test_decode_notification() {
        let head = match decode_message(NOTIFICATION).expect("valid notification") {
            RpcMessage::Head(head) => head,
            other => panic!("expected head, got {other:?}"),
        };
        assert_eq!(head.number, 436);
        assert_eq!(head.timestamp, 0x65a8_f2c0);
        assert!(head.hash.starts_with("0xdc08"));
        assert!(head.parent_hash.starts_with("0x6ebf"));
    }

    #[test]
    fn test_decode_error_reply() {
        let msg = decode_message(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"notifications not supported"}}"#,
        )
        .expect("valid error reply");
        assert_eq!(
            msg,
            RpcMessage::Error {
                code: -32601,
                message: "notifications not supported".to_string(),
            }
        );
    }

    #[test]
    fn test_decode_unrelated_reply_is_other() {
        let msg = decode_message(r#"{"jsonrpc":"2.0","id":7,"result":"0x1"}"#).expect("valid");
        assert_eq!(msg, RpcMessage::Other);
    }

    #[test]
    fn test_decode_bad_quantity_in_notification() {
        let bad = NOTIFICATION.replace("0x1b4", "436");
        assert!(matches!(
            decode_message(&bad),
            Err(DecodeError::InvalidQuantity { field: "number", .. })
        ));
    }

    #[test]
    fn test_client_rejects_http_endpoint() {
        assert!(Client::new("http://localhost:8546", Duration::from_secs(1)).is_err());
        assert!(Client::new("wss://node.example:8546", Duration::from_secs(1)).is_ok());
    }
}
