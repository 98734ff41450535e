//! Domain event emission.
//!
//! Every component that reports something an operator may care about takes
//! an `Arc<dyn EventSink>` at construction. Event type names are collected
//! in [`names`] so emitters and tests agree on them.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Event type names.
pub mod names {
    /// A submission passed admission and validation.
    pub const SAGA_STARTED: &str = "saga.started";
    /// The saga moved to a new phase.
    pub const SAGA_PHASE: &str = "saga.phase";
    /// Enrichment failed and the local fallback was used.
    pub const SAGA_ENRICHMENT_DEGRADED: &str = "saga.enrichment_degraded";
    /// A delivery stage failed.
    pub const SAGA_STAGE_FAILED: &str = "saga.stage_failed";
    /// The saga produced its response.
    pub const SAGA_COMPLETED: &str = "saga.completed";
    /// An incomplete submission was queued for recovery.
    pub const QUEUE_ENQUEUED: &str = "queue.enqueued";
    /// The queue rejected a submission.
    pub const QUEUE_FULL: &str = "queue.full";
    /// A circuit opened.
    pub const CIRCUIT_OPENED: &str = "circuit.opened";
    /// A circuit admitted its first probe after cooldown.
    pub const CIRCUIT_HALF_OPEN: &str = "circuit.half_open";
    /// A circuit closed.
    pub const CIRCUIT_CLOSED: &str = "circuit.closed";
    /// A recovery sweep began.
    pub const RECOVERY_STARTED: &str = "recovery.started";
    /// A queued record completed and was removed.
    pub const RECOVERY_RECORD_RESOLVED: &str = "recovery.record_resolved";
    /// A queued record still has failing stages.
    pub const RECOVERY_RECORD_PENDING: &str = "recovery.record_pending";
    /// A queued record used its last automatic attempt without completing.
    pub const RECOVERY_RECORD_EXHAUSTED: &str = "recovery.record_exhausted";
    /// A cancelled attempt handed its record back to the queue.
    pub const RECOVERY_CLAIM_RELEASED: &str = "recovery.claim_released";
    /// A recovery sweep finished.
    pub const RECOVERY_FINISHED: &str = "recovery.finished";
}
