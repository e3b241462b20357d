use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::beacon::{self, SlotEvent};
use crate::config::Config;
use crate::execution::{self, HeadEvent};
use crate::supervisor::stats::SubscriptionStats;

/// The two upstream event streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Heads,
    Slots,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Heads => "heads",
            Self::Slots => "slots",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a subscription attempt.
#[derive(Error, Debug)]
pub enum SourceError {
    /// The subscription could not be established at all.
    #[error("connecting to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    /// An established subscription was lost.
    #[error("subscription lost: {0}")]
    Disconnected(String),
}

/// A single upstream message that could not be turned into an event.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid slot value {value}")]
    InvalidSlot { value: String },

    #[error("invalid quantity {value:?} for {field}")]
    InvalidQuantity { field: &'static str, value: String },
}

/// The consumer side of a sink is gone or shutting down.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("event sink closed")]
pub struct SinkClosed;

/// Readiness slot fired once, on first establishment or first failure.
pub(crate) type ReadySender = oneshot::Sender<Result<(), SourceError>>;

/// Where an adapter delivers events for one subscription kind.
///
/// The same sink outlives reconnects: the supervisor hands it to every
/// subscription attempt, so events already queued are never lost.
pub struct EventSink<T> {
    kind: EventKind,
    tx: mpsc::Sender<T>,
    cancel: CancellationToken,
    stats: Arc<SubscriptionStats>,
    connected: AtomicBool,
    established_once: AtomicBool,
    ready: parking_lot::Mutex<Option<ReadySender>>,
}

impl<T: Send> EventSink<T> {
    /// Create a sink delivering into `tx` until `cancel` fires.
    pub fn new(kind: EventKind, tx: mpsc::Sender<T>, cancel: CancellationToken) -> Self {
        Self {
            kind,
            tx,
            cancel,
            stats: Arc::new(SubscriptionStats::new()),
            connected: AtomicBool::new(false),
            established_once: AtomicBool::new(false),
            ready: parking_lot::Mutex::new(None),
        }
    }

    /// Share delivery counters with the caller.
    pub fn with_stats(mut self, stats: Arc<SubscriptionStats>) -> Self {
        self.stats = stats;
        self
    }

    pub(crate) fn with_ready(self, ready: ReadySender) -> Self {
        *self.ready.lock() = Some(ready);
        self
    }

    pub fn stats(&self) -> &SubscriptionStats {
        &self.stats
    }

    /// Push one event, waiting while the queue is full.
    ///
    /// Returns `SinkClosed` once the consumer dropped its receiver or the
    /// subscription was cancelled; a blocked producer is released either way.
    pub async fn deliver(&self, event: T) -> Result<(), SinkClosed> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(SinkClosed),
            sent = self.tx.send(event) => {
                sent.map_err(|_| SinkClosed)?;
                self.stats.record_delivered();
                Ok(())
            }
        }
    }

    /// Called by the adapter once the upstream subscription is live.
    ///
    /// Every establishment after the first counts as a reconnect.
    pub fn mark_established(&self) {
        self.connected.store(true, Ordering::SeqCst);
        if self.established_once.swap(true, Ordering::SeqCst) {
            self.stats.record_reconnect();
        }
        if let Some(ready) = self.ready.lock().take() {
            let _ = ready.send(Ok(()));
        }
        info!(kind = %self.kind, "subscription established");
    }

    /// Count an upstream message that was dropped as undecodable.
    pub fn record_malformed(&self) {
        self.stats.record_malformed();
    }

    /// True when nothing will consume further events.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed() || self.cancel.is_cancelled()
    }

    /// Take the readiness slot if no attempt has reported yet.
    pub(crate) fn take_ready(&self) -> Option<ReadySender> {
        self.ready.lock().take()
    }

    /// Whether an attempt established since the last call, resetting the flag.
    pub(crate) fn take_connected(&self) -> bool {
        self.connected.swap(false, Ordering::SeqCst)
    }
}

/// Upstream capability that streams typed events into a sink.
///
/// Each call runs until `cancel` fires or the sink closes (returning `Ok`),
/// or until the transport fails (returning a [`SourceError`]). Adapters must
/// call [`EventSink::mark_established`] once the subscription is live so a
/// later failure is known to be transient.
pub trait EventSource: Send + Sync + 'static {
    /// Stream execution-layer chain heads.
    fn subscribe_heads(
        &self,
        sink: &EventSink<HeadEvent>,
        cancel: &CancellationToken,
    ) -> impl std::future::Future<Output = Result<(), SourceError>> + Send;

    /// Stream consensus-layer slot observations.
    fn subscribe_slots(
        &self,
        sink: &EventSink<SlotEvent>,
        cancel: &CancellationToken,
    ) -> impl std::future::Future<Output = Result<(), SourceError>> + Send;
}

/// Live node connection: beacon SSE for slots, execution WebSocket for heads.
pub struct NodeSource {
    beacon: beacon::Client,
    execution: execution::Client,
}

impl NodeSource {
    pub fn new(cfg: &Config) -> Result<Self> {
        let beacon = beacon::Client::new(&cfg.rpc.http, cfg.subscription.connect_timeout)
            .context("creating beacon client")?
            .with_idle_timeout(cfg.subscription.idle_timeout);
        let execution = execution::Client::new(&cfg.rpc.ws, cfg.subscription.connect_timeout)
            .context("creating execution client")?;

        Ok(Self { beacon, execution })
    }
}

impl EventSource for NodeSource {
    async fn subscribe_heads(
        &self,
        sink: &EventSink<HeadEvent>,
        cancel: &CancellationToken,
    ) -> Result<(), SourceError> {
        self.execution.stream_heads(sink, cancel).await
    }

    async fn subscribe_slots(
        &self,
        sink: &EventSink<SlotEvent>,
        cancel: &CancellationToken,
    ) -> Result<(), SourceError> {
        self.beacon.stream_slots(sink, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deliver_records_stats() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = EventSink::new(EventKind::Slots, tx, CancellationToken::new());

        sink.deliver(SlotEvent::new(5, false)).await.expect("queue open");

        assert_eq!(rx.recv().await.map(|ev| ev.slot), Some(5));
        assert_eq!(sink.stats().snapshot().delivered, 1);
    }

    #[tokio::test]
    async fn test_deliver_after_receiver_dropped() {
        let (tx, rx) = mpsc::channel::<SlotEvent>(1);
        let sink = EventSink::new(EventKind::Slots, tx, CancellationToken::new());
        drop(rx);

        assert!(sink.is_closed());
        assert_eq!(sink.deliver(SlotEvent::new(1, false)).await, Err(SinkClosed));
    }

    #[tokio::test]
    async fn test_cancel_releases_blocked_producer() {
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let sink = Arc::new(EventSink::new(EventKind::Slots, tx, cancel.clone()));

        sink.deliver(SlotEvent::new(1, false)).await.expect("first fits");

        let blocked = {
            let sink = Arc::clone(&sink);
            tokio::spawn(async move { sink.deliver(SlotEvent::new(2, false)).await })
        };

        tokio::task::yield_now().await;
        assert!(!blocked.is_finished());

        cancel.cancel();
        let result = blocked.await.expect("task joins");
        assert_eq!(result, Err(SinkClosed));
    }

    #[tokio::test]
    async fn test_mark_established_fires_ready_once() {
        let (tx, _rx) = mpsc::channel::<SlotEvent>(1);
        let (ready_tx, ready_rx) = oneshot::channel();
        let sink =
            EventSink::new(EventKind::Slots, tx, CancellationToken::new()).with_ready(ready_tx);

        sink.mark_established();
        assert!(ready_rx.await.expect("ready sent").is_ok());
        assert_eq!(sink.stats().snapshot().reconnects, 0);

        // Second establishment is only visible through the connected flag.
        sink.mark_established();
        assert!(sink.take_ready().is_none());
        assert!(sink.take_connected());
        assert!(!sink.take_connected());
        assert_eq!(sink.stats().snapshot().reconnects, 1);
    }

    #[test]
    fn test_event_kind_labels() {
        assert_eq!(EventKind::Heads.to_string(), "heads");
        assert_eq!(EventKind::Slots.as_str(), "slots");
    }
}
