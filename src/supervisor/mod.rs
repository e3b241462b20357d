pub mod backoff;
pub mod stats;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::beacon::SlotEvent;
use crate::config::SubscriptionConfig;
use crate::execution::HeadEvent;
use crate::source::{EventKind, EventSink, EventSource, SourceError};

use self::backoff::Backoff;
use self::stats::SubscriptionStats;

/// Head events are handed over one at a time.
pub const HEAD_QUEUE_CAPACITY: usize = 1;

/// How often delivery statistics are logged.
const STATS_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Receiving ends of the per-kind event queues.
pub struct Subscriptions {
    pub heads: mpsc::Receiver<HeadEvent>,
    pub slots: mpsc::Receiver<SlotEvent>,
}

/// One subscription attempt, boxed so both kinds share a supervision loop.
type SubscribeFn<S, T> =
    fn(Arc<S>, Arc<EventSink<T>>, CancellationToken) -> BoxFuture<'static, Result<(), SourceError>>;

fn subscribe_heads<S: EventSource>(
    source: Arc<S>,
    sink: Arc<EventSink<HeadEvent>>,
    cancel: CancellationToken,
) -> BoxFuture<'static, Result<(), SourceError>> {
    Box::pin(async move { source.subscribe_heads(&sink, &cancel).await })
}

fn subscribe_slots<S: EventSource>(
    source: Arc<S>,
    sink: Arc<EventSink<SlotEvent>>,
    cancel: CancellationToken,
) -> BoxFuture<'static, Result<(), SourceError>> {
    Box::pin(async move { source.subscribe_slots(&sink, &cancel).await })
}

/// Owns the producer tasks that keep one subscription per event kind alive.
pub struct Supervisor {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    head_stats: Arc<SubscriptionStats>,
    slot_stats: Arc<SubscriptionStats>,
}

impl Supervisor {
    /// Start the head and slot subscriptions.
    ///
    /// Returns once both are established. If either cannot be established on
    /// its first attempt, everything started so far is cancelled and the
    /// error is returned; later failures are retried with backoff.
    pub async fn start<S: EventSource>(
        source: Arc<S>,
        cfg: &SubscriptionConfig,
        cancel: CancellationToken,
    ) -> Result<(Self, Subscriptions)> {
        let (head_tx, head_rx) = mpsc::channel(HEAD_QUEUE_CAPACITY);
        let (slot_tx, slot_rx) = mpsc::channel(cfg.slot_buffer.max(1));

        let head_stats = Arc::new(SubscriptionStats::new());
        let slot_stats = Arc::new(SubscriptionStats::new());

        let mut supervisor = Self {
            cancel: cancel.child_token(),
            tasks: Vec::with_capacity(3),
            head_stats: Arc::clone(&head_stats),
            slot_stats: Arc::clone(&slot_stats),
        };

        let heads_ready = supervisor.spawn_subscription(
            EventKind::Heads,
            Arc::clone(&source),
            head_tx,
            head_stats,
            subscribe_heads::<S>,
            cfg,
        );
        let slots_ready = supervisor.spawn_subscription(
            EventKind::Slots,
            source,
            slot_tx,
            slot_stats,
            subscribe_slots::<S>,
            cfg,
        );

        for (kind, ready) in [(EventKind::Heads, heads_ready), (EventKind::Slots, slots_ready)] {
            if let Err(e) = Self::await_ready(kind, ready).await {
                supervisor.stop().await;
                return Err(e);
            }
        }

        supervisor.spawn_stats_reporter();
        info!(slot_buffer = cfg.slot_buffer, "subscriptions started");

        Ok((
            supervisor,
            Subscriptions {
                heads: head_rx,
                slots: slot_rx,
            },
        ))
    }

    /// Cancel all subscriptions and wait for the producer tasks to exit.
    pub async fn stop(mut self) {
        self.cancel.cancel();

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                debug!(error = %e, "subscription task join failed");
            }
        }

        info!("subscriptions stopped");
    }

    /// Delivery counters for one kind.
    pub fn stats(&self, kind: EventKind) -> &SubscriptionStats {
        match kind {
            EventKind::Heads => &self.head_stats,
            EventKind::Slots => &self.slot_stats,
        }
    }

    async fn await_ready(
        kind: EventKind,
        ready: oneshot::Receiver<Result<(), SourceError>>,
    ) -> Result<()> {
        match ready.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e).with_context(|| format!("establishing {kind} subscription")),
            Err(_) => Err(anyhow!("{kind} subscription stopped before it was established")),
        }
    }

    fn spawn_subscription<S: EventSource, T: Send + 'static>(
        &mut self,
        kind: EventKind,
        source: Arc<S>,
        tx: mpsc::Sender<T>,
        stats: Arc<SubscriptionStats>,
        subscribe: SubscribeFn<S, T>,
        cfg: &SubscriptionConfig,
    ) -> oneshot::Receiver<Result<(), SourceError>> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let cancel = self.cancel.child_token();
        let sink = Arc::new(
            EventSink::new(kind, tx, cancel.clone())
                .with_stats(stats)
                .with_ready(ready_tx),
        );
        let backoff = Backoff::new(cfg.backoff_initial, cfg.backoff_max);

        self.tasks.push(tokio::spawn(supervise(
            kind, source, sink, subscribe, backoff, cancel,
        )));

        ready_rx
    }

    /// Spawn background delivery stats reporter.
    fn spawn_stats_reporter(&mut self) {
        let cancel = self.cancel.clone();
        let head_stats = Arc::clone(&self.head_stats);
        let slot_stats = Arc::clone(&self.slot_stats);

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATS_REPORT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let kinds = [
                            (EventKind::Heads, &head_stats),
                            (EventKind::Slots, &slot_stats),
                        ];
                        for (kind, stats) in kinds {
                            let snap = stats.snapshot();
                            if snap.is_empty() {
                                continue;
                            }
                            info!(
                                kind = %kind,
                                delivered = snap.delivered,
                                malformed = snap.malformed,
                                reconnects = snap.reconnects,
                                "subscription stats (60s)",
                            );
                        }
                    }
                }
            }
        }));
    }
}

/// Keep one subscription alive until cancelled.
async fn supervise<S: EventSource, T: Send + 'static>(
    kind: EventKind,
    source: Arc<S>,
    sink: Arc<EventSink<T>>,
    subscribe: SubscribeFn<S, T>,
    mut backoff: Backoff,
    cancel: CancellationToken,
) {
    loop {
        let result = subscribe(Arc::clone(&source), Arc::clone(&sink), cancel.clone()).await;

        if cancel.is_cancelled() {
            debug!(kind = %kind, "subscription cancelled");
            return;
        }

        if sink.is_closed() {
            debug!(kind = %kind, "consumer gone, ending subscription");
            return;
        }

        let err = match result {
            Ok(()) => SourceError::Disconnected("upstream ended the subscription".to_string()),
            Err(e) => e,
        };

        // Never established: report to the caller instead of retrying.
        if let Some(ready) = sink.take_ready() {
            error!(kind = %kind, error = %err, "initial subscription failed");
            let _ = ready.send(Err(err));
            return;
        }

        if sink.take_connected() {
            backoff.reset();
        }

        let delay = backoff.next_delay();
        warn!(kind = %kind, error = %err, delay = ?delay, "subscription lost, resubscribing");

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(kind = %kind, "subscription cancelled during backoff");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
