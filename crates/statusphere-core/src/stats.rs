use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::store::ApplyOutcome;

/// What happened to a frame received from the event stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Applied(ApplyOutcome),
    /// Commit for a collection that is not watched
    Filtered,
    /// Record failed validation
    Rejected,
    /// Identity or account event
    Ignored,
    Undecodable,
    ApplyFailed,
}

/// Counters for the ingestion pipeline
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestStats {
    pub received: u64,
    pub upserted: u64,
    pub deleted: u64,
    /// Deletes for rows that were not in the cache
    pub missing_deletes: u64,
    /// Upserts skipped because a later delete was already applied
    pub stale: u64,
    pub filtered: u64,
    pub rejected: u64,
    pub ignored: u64,
    pub undecodable: u64,
    pub apply_failures: u64,
    pub last_sequence: Option<i64>,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames whose position was offered to the cursor store
    pub fn handled(&self) -> u64 {
        self.received
            .saturating_sub(self.undecodable)
            .saturating_sub(self.apply_failures)
    }

    pub fn record(&mut self, outcome: FrameOutcome, sequence: Option<i64>) {
        self.received += 1;
        match outcome {
            FrameOutcome::Applied(ApplyOutcome::Upserted) => self.upserted += 1,
            FrameOutcome::Applied(ApplyOutcome::Stale) => self.stale += 1,
            FrameOutcome::Applied(ApplyOutcome::Deleted) => self.deleted += 1,
            FrameOutcome::Applied(ApplyOutcome::Missing) => self.missing_deletes += 1,
            FrameOutcome::Filtered => self.filtered += 1,
            FrameOutcome::Rejected => self.rejected += 1,
            FrameOutcome::Ignored => self.ignored += 1,
            FrameOutcome::Undecodable => self.undecodable += 1,
            FrameOutcome::ApplyFailed => self.apply_failures += 1,
        }
        if sequence.is_some() && outcome != FrameOutcome::ApplyFailed {
            self.last_sequence = sequence;
        }
    }
}

/// Thread-safe wrapper for ingest stats
#[derive(Debug, Clone)]
pub struct SharedIngestStats {
    inner: Arc<RwLock<IngestStats>>,
}

impl Default for SharedIngestStats {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedIngestStats {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(IngestStats::new())),
        }
    }

    pub fn record(&self, outcome: FrameOutcome, sequence: Option<i64>) {
        if let Ok(mut stats) = self.inner.write() {
            stats.record(outcome, sequence);
        }
    }

    pub fn snapshot(&self) -> IngestStats {
        self.inner.read().map(|s| s.clone()).unwrap_or_default()
    }
}
