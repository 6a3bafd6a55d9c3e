//! Drop accounting, kept off the delivery path's critical section

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::capture::{ConnectionInfo, DropReason, Timestamp};

/// A frame the pipeline reported instead of delivering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropRecord {
    pub timestamp: Timestamp,
    /// The sequence number the dropped frame would have carried.
    pub sequence: u64,
    pub reason: DropReason,
    pub connection: ConnectionInfo,
}

/// Point-in-time view of a session's drop counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DropSnapshot {
    counts: [u64; DropReason::ALL.len()],
    last_drop_timestamp: Option<Timestamp>,
    last_drop_sequence: Option<u64>,
}

impl DropSnapshot {
    pub fn count(&self, reason: DropReason) -> u64 {
        self.counts[reason.index()]
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Reasons with a non-zero count.
    pub fn iter(&self) -> impl Iterator<Item = (DropReason, u64)> + '_ {
        DropReason::ALL
            .into_iter()
            .map(|reason| (reason, self.count(reason)))
            .filter(|(_, count)| *count > 0)
    }

    pub fn last_drop_timestamp(&self) -> Option<Timestamp> {
        self.last_drop_timestamp
    }

    pub fn last_drop_sequence(&self) -> Option<u64> {
        self.last_drop_sequence
    }

    fn apply(&mut self, record: &DropRecord) {
        self.counts[record.reason.index()] += 1;
        self.last_drop_timestamp = Some(record.timestamp);
        self.last_drop_sequence = Some(record.sequence);
    }
}

/// Per-session drop counters.
///
/// Every `record` publishes a whole new snapshot, so readers on other
/// threads see either all of an update or none of it, and never take a lock.
#[derive(Default)]
pub struct DropAccountant {
    current: ArcSwap<DropSnapshot>,
}

impl DropAccountant {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, record: &DropRecord) {
        self.current.rcu(|current| {
            let mut next = DropSnapshot::clone(current);
            next.apply(record);
            next
        });
        metrics::counter!("framesink_frames_dropped_total", "reason" => record.reason.as_str())
            .increment(1);
    }

    pub fn snapshot(&self) -> DropSnapshot {
        DropSnapshot::clone(&self.current.load())
    }

    /// Only called when a new session starts.
    pub(crate) fn reset(&self) {
        self.current.store(Arc::new(DropSnapshot::default()));
    }
}
