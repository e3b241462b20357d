pub mod sse;

use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::source::{DecodeError, EventSink, SourceError};

use self::sse::SseDecoder;

/// Slots per epoch on every EVM consensus network we display.
pub const SLOTS_PER_EPOCH: u64 = 32;

/// Path of the beacon node event stream, filtered to head events.
const HEAD_EVENTS_PATH: &str = "/eth/v1/events?topics=head";

/// Four mainnet slots without a byte means the stream is dead.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(48);

/// Epoch containing `slot`.
pub fn epoch_of(slot: u64) -> u64 {
    slot / SLOTS_PER_EPOCH
}

/// One consensus-layer slot observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotEvent {
    pub slot: u64,
    /// Always `slot / SLOTS_PER_EPOCH`; recomputed on ingestion.
    pub epoch: u64,
    /// First observed slot of a new epoch.
    pub epoch_transition: bool,
}

impl SlotEvent {
    pub fn new(slot: u64, epoch_transition: bool) -> Self {
        Self {
            slot,
            epoch: epoch_of(slot),
            epoch_transition,
        }
    }
}

// --- JSON payload of the `head` topic ---

#[derive(Deserialize)]
struct HeadTopicPayload {
    slot: serde_json::Value,
    #[serde(default)]
    epoch_transition: bool,
}

/// Decode the `data` of a `head` SSE frame into a slot event.
///
/// Beacon nodes encode `slot` as a decimal string; a bare JSON number is
/// accepted too. Anything else (negative, fractional, overflowing) is
/// rejected. Any epoch carried by the payload is ignored.
pub fn decode_head_event(data: &str) -> Result<SlotEvent, DecodeError> {
    let payload: HeadTopicPayload = serde_json::from_str(data)?;

    let slot = match &payload.slot {
        serde_json::Value::String(s) => s.parse::<u64>().ok(),
        serde_json::Value::Number(n) => n.as_u64(),
        _ => None,
    }
    .ok_or_else(|| DecodeError::InvalidSlot {
        value: payload.slot.to_string(),
    })?;

    Ok(SlotEvent::new(slot, payload.epoch_transition))
}

/// Beacon node event-stream client.
pub struct Client {
    http: reqwest::Client,
    endpoint: String,
    connect_timeout: Duration,
    idle_timeout: Duration,
}

impl Client {
    /// Create a new beacon node client for the given base URL.
    pub fn new(endpoint: &str, connect_timeout: Duration) -> Result<Self> {
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            bail!("beacon endpoint must be an http(s) URL: {endpoint:?}");
        }

        let timeout = if connect_timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            connect_timeout
        };

        // No overall request timeout: the event stream is open-ended.
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            connect_timeout: timeout,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        })
    }

    /// Give up on an open stream after `idle` without any bytes.
    ///
    /// Keep-alive comments count as traffic. Zero keeps the default.
    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        if !idle.is_zero() {
            self.idle_timeout = idle;
        }
        self
    }

    /// Full URL of the head event stream.
    pub fn events_url(&self) -> String {
        format!("{}{}", self.endpoint, HEAD_EVENTS_PATH)
    }

    /// Subscribe to head events and deliver them as slot events until
    /// cancelled, the sink closes, or the stream fails.
    pub async fn stream_slots(
        &self,
        sink: &EventSink<SlotEvent>,
        cancel: &CancellationToken,
    ) -> Result<(), SourceError> {
        let url = self.events_url();
        debug!(url = %url, "subscribing to beacon events");

        let request = self
            .http
            .get(&url)
            .header("Accept", "text/event-stream")
            .send();

        // Deadline covers the response headers, not only the TCP handshake.
        let response = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            response = tokio::time::timeout(self.connect_timeout, request) => match response {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    return Err(SourceError::Connect {
                        endpoint: url,
                        reason: e.to_string(),
                    })
                }
                Err(_) => {
                    return Err(SourceError::Connect {
                        endpoint: url,
                        reason: format!("no response within {:?}", self.connect_timeout),
                    })
                }
            },
        };

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Connect {
                endpoint: url,
                reason: format!("unexpected status {status}"),
            });
        }

        sink.mark_established();
        info!(url = %url, "beacon event stream open");

        let mut body = response.bytes_stream();
        let mut decoder = SseDecoder::new();

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                chunk = tokio::time::timeout(self.idle_timeout, body.next()) => chunk,
            };

            let chunk = match chunk {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(e))) => return Err(SourceError::Disconnected(e.to_string())),
                Ok(None) => {
                    return Err(SourceError::Disconnected(
                        "beacon event stream ended".to_string(),
                    ))
                }
                Err(_) => {
                    return Err(SourceError::Disconnected(format!(
                        "beacon event stream idle for {:?}",
                        self.idle_timeout
                    )))
                }
            };

            let frames = decoder.push(&chunk);
            for _ in 0..decoder.take_dropped_lines() {
                warn!(url = %url, "dropping oversized beacon event line");
                sink.record_malformed();
            }

            for frame in frames {
                if !frame.event.is_empty() && frame.event != "head" {
                    continue;
                }

                match decode_head_event(&frame.data) {
                    Ok(event) => {
                        if sink.deliver(event).await.is_err() {
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, data = %frame.data, "dropping malformed beacon event");
                        sink.record_malformed();
                    }
                }
            }
        }
    }
}
