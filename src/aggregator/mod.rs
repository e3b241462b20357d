//! Epoch/slot aggregation.
//!
//! The [`Aggregator`] is the single writer of [`AggregationState`]. Slot
//! events are bucketed by epoch in arrival order; finality is derived at
//! read time from the current latest epoch, so older buckets reclassify as
//! new epochs arrive without being touched.

use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, trace};

use crate::beacon::{epoch_of, SlotEvent};

/// Approximate finality of a slot, judged by epoch age.
///
/// This is a heuristic: real finality needs justification/finalization
/// checkpoints from the consensus layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Finality {
    /// In the latest epoch and marked as the epoch's first observed slot.
    ProposedNewEpoch,
    /// In the latest epoch.
    Proposed,
    /// One epoch behind the latest.
    Confirmed,
    /// Two or more epochs behind the latest.
    Finalized,
}

impl Finality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProposedNewEpoch => "proposed (new epoch)",
            Self::Proposed => "proposed",
            Self::Confirmed => "confirmed",
            Self::Finalized => "finalized",
        }
    }
}

impl fmt::Display for Finality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Slot events of one epoch, in arrival order.
#[derive(Debug, Default, Clone)]
pub struct EpochBucket {
    slots: Vec<SlotEvent>,
}

impl EpochBucket {
    pub fn slots(&self) -> &[SlotEvent] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Aggregated slot history. Read-only outside this module.
#[derive(Debug, Default)]
pub struct AggregationState {
    latest_epoch: u64,
    buckets: BTreeMap<u64, EpochBucket>,
}

impl AggregationState {
    /// Highest epoch observed so far (0 before any slot arrives).
    pub fn latest_epoch(&self) -> u64 {
        self.latest_epoch
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Number of epochs with at least one slot.
    pub fn epoch_count(&self) -> usize {
        self.buckets.len()
    }

    /// Total slot events across all buckets.
    pub fn total_slots(&self) -> usize {
        self.buckets.values().map(EpochBucket::len).sum()
    }

    pub fn bucket(&self, epoch: u64) -> Option<&EpochBucket> {
        self.buckets.get(&epoch)
    }

    /// Epochs with their buckets, most recent first.
    pub fn epochs_desc(&self) -> impl Iterator<Item = (u64, &EpochBucket)> + '_ {
        self.buckets.iter().rev().map(|(epoch, bucket)| (*epoch, bucket))
    }

    /// Classify a slot against the current latest epoch.
    pub fn classify(&self, event: &SlotEvent) -> Finality {
        let epoch = epoch_of(event.slot);
        let latest = self.latest_epoch;

        if epoch == latest {
            if event.epoch_transition {
                Finality::ProposedNewEpoch
            } else {
                Finality::Proposed
            }
        } else if Some(epoch) == latest.checked_sub(1) {
            Finality::Confirmed
        } else {
            Finality::Finalized
        }
    }

    fn insert(&mut self, event: SlotEvent) {
        self.buckets.entry(event.epoch).or_default().slots.push(event);
        self.latest_epoch = self.latest_epoch.max(event.epoch);
    }

    fn prune_below(&mut self, floor: u64) -> usize {
        let kept = self.buckets.split_off(&floor);
        let dropped = std::mem::replace(&mut self.buckets, kept);
        dropped.len()
    }
}

/// Single-writer owner of the aggregation state.
#[derive(Debug, Default)]
pub struct Aggregator {
    state: AggregationState,
    retain_epochs: Option<u64>,
}

impl Aggregator {
    /// Aggregator that keeps every epoch for the life of the process.
    pub fn new() -> Self {
        Self::default()
    }

    /// Aggregator that keeps only the `retain_epochs` most recent epochs.
    ///
    /// `None` keeps everything. Values below 1 are treated as 1.
    pub fn with_retention(retain_epochs: Option<u64>) -> Self {
        Self {
            state: AggregationState::default(),
            retain_epochs: retain_epochs.map(|n| n.max(1)),
        }
    }

    pub fn state(&self) -> &AggregationState {
        &self.state
    }

    /// Record one slot observation.
    ///
    /// The epoch is recomputed from the slot; any value the caller put in
    /// `event.epoch` is discarded. Out-of-order events land in their own
    /// epoch's bucket and never move `latest_epoch` backwards. Duplicates are
    /// appended as-is.
    pub fn ingest(&mut self, mut event: SlotEvent) {
        event.epoch = epoch_of(event.slot);

        if let Some(floor) = self.retention_floor() {
            if event.epoch < floor {
                trace!(
                    slot = event.slot,
                    epoch = event.epoch,
                    "ignoring slot outside retention window"
                );
                return;
            }
        }

        self.state.insert(event);

        if let Some(floor) = self.retention_floor() {
            let dropped = self.state.prune_below(floor);
            if dropped > 0 {
                debug!(dropped, floor, "pruned epochs outside retention window");
            }
        }
    }

    /// Oldest epoch kept under the retention policy, if any.
    fn retention_floor(&self) -> Option<u64> {
        let retain = self.retain_epochs?;
        if self.state.is_empty() {
            return None;
        }
        Some(self.state.latest_epoch.saturating_sub(retain - 1))
    }
}
