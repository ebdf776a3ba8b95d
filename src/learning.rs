//! Output channel for an incremental learning collector.
//!
//! A pipeline may be given a `LearningSink`; it then publishes one
//! `LearningRecord` per processed frame. Publishing never blocks: when the
//! channel is full or the collector has gone away the record is dropped and
//! counted. Nothing flows back from the collector into the pipeline.

use crate::detection::{FusedDetection, StabilizedDetection};
use crate::frame::FrameRef;
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// What the pipeline knew after processing one frame.
#[derive(Debug, Clone, Serialize)]
pub struct LearningRecord {
    pub frame: FrameRef,
    pub fused: Vec<FusedDetection>,
    pub stabilized: Vec<StabilizedDetection>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct LearningStats {
    pub emitted: AtomicU64,
    pub delivered: AtomicU64,
    pub dropped: AtomicU64,
}

impl LearningStats {
    pub fn snapshot(&self) -> LearningStatsSnapshot {
        LearningStatsSnapshot {
            emitted: self.emitted.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearningStatsSnapshot {
    pub emitted: u64,
    pub delivered: u64,
    pub dropped: u64,
}

/// Bounded channel between pipelines and a learning collector.
pub struct LearningChannel {
    sender: Sender<LearningRecord>,
    receiver: Receiver<LearningRecord>,
    stats: Arc<LearningStats>,
}

impl LearningChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity.max(1));
        Self {
            sender,
            receiver,
            stats: Arc::new(LearningStats::default()),
        }
    }

    /// Handle given to a pipeline.
    pub fn sink(&self) -> LearningSink {
        LearningSink {
            sender: self.sender.clone(),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Handle for the collector side.
    pub fn receiver(&self) -> LearningReceiver {
        LearningReceiver {
            receiver: self.receiver.clone(),
            stats: Arc::clone(&self.stats),
        }
    }

    pub fn stats(&self) -> LearningStatsSnapshot {
        self.stats.snapshot()
    }
}

#[derive(Clone)]
pub struct LearningSink {
    sender: Sender<LearningRecord>,
    stats: Arc<LearningStats>,
}

impl LearningSink {
    /// Non-blocking publish. Returns false when the record was dropped.
    pub fn emit(&self, record: LearningRecord) -> bool {
        self.stats.emitted.fetch_add(1, Ordering::Relaxed);
        match self.sender.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(r)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(sequence = r.frame.sequence, "learning channel full, record dropped");
                false
            }
            Err(TrySendError::Disconnected(r)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(sequence = r.frame.sequence, "learning collector gone, record dropped");
                false
            }
        }
    }
}

impl std::fmt::Debug for LearningSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LearningSink")
            .field("pending", &self.sender.len())
            .finish()
    }
}

pub struct LearningReceiver {
    receiver: Receiver<LearningRecord>,
    stats: Arc<LearningStats>,
}

impl LearningReceiver {
    pub fn try_recv(&self) -> Option<LearningRecord> {
        let record = self.receiver.try_recv().ok()?;
        self.stats.delivered.fetch_add(1, Ordering::Relaxed);
        Some(record)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<LearningRecord> {
        let record = self.receiver.recv_timeout(timeout).ok()?;
        self.stats.delivered.fetch_add(1, Ordering::Relaxed);
        Some(record)
    }

    /// Everything currently queued.
    pub fn drain(&self) -> Vec<LearningRecord> {
        let mut records = Vec::new();
        while let Some(record) = self.try_recv() {
            records.push(record);
        }
        records
    }
}
