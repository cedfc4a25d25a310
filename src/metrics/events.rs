//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in the drain loop.
//! Events implement the `InternalEvent` trait which emits the corresponding
//! counter metric.

use metrics::counter;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Outcome of a single drain cycle.
#[derive(Debug, Clone, Copy)]
pub enum CycleOutcome {
    Drained,
    Empty,
}

impl CycleOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::Drained => "drained",
            CycleOutcome::Empty => "empty",
        }
    }
}

/// Event emitted once per completed drain cycle.
pub struct CycleCompleted {
    pub outcome: CycleOutcome,
}

impl InternalEvent for CycleCompleted {
    fn emit(self) {
        trace!(outcome = self.outcome.as_str(), "Cycle completed");
        counter!("feeder_cycles_total", "outcome" => self.outcome.as_str()).increment(1);
    }
}

/// Event emitted when the database confirms a committed batch.
pub struct BatchCommitted {
    pub bytes: u64,
    pub rows: u64,
}

impl InternalEvent for BatchCommitted {
    fn emit(self) {
        trace!(bytes = self.bytes, rows = self.rows, "Batch committed");
        counter!("feeder_batches_committed_total").increment(1);
        counter!("feeder_bytes_committed_total").increment(self.bytes);
        counter!("feeder_rows_committed_total").increment(self.rows);
    }
}
