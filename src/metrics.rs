//! Metrics sinks for gate outcomes.
//!
//! Sinks are fire-and-forget. [`emit`] is the only way the gates call a sink;
//! it swallows panics so an observation can never change a decision.

use std::panic::{catch_unwind, AssertUnwindSafe};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::decision::GateOutcome;
use crate::job::{Job, JobId};

/// Receives gate outcomes.
pub trait MetricsSink: Send + Sync {
    /// Record one outcome for `job`. Must not block.
    fn observe(&self, outcome: GateOutcome, job: &Job);
}

/// Discards every observation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn observe(&self, _outcome: GateOutcome, _job: &Job) {}
}

/// Emits one `tracing` event per observation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn observe(&self, outcome: GateOutcome, job: &Job) {
        info!(
            outcome = %outcome,
            job_class = %job.job_class,
            job_id = %job.id_for_log(),
            queue = %job.queue_name,
            "Gate outcome"
        );
    }
}

/// Keeps every observation in order.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    observed: Mutex<Vec<(GateOutcome, Option<JobId>)>>,
}

impl RecordingMetrics {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Outcomes with the identity of the job they were observed for.
    pub fn observations(&self) -> Vec<(GateOutcome, Option<JobId>)> {
        self.observed.lock().clone()
    }

    /// Just the tags, in observation order.
    pub fn tags(&self) -> Vec<&'static str> {
        self.observed
            .lock()
            .iter()
            .map(|(outcome, _)| outcome.as_tag())
            .collect()
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        self.observed.lock().clear();
    }
}

impl MetricsSink for RecordingMetrics {
    fn observe(&self, outcome: GateOutcome, job: &Job) {
        self.observed.lock().push((outcome, job.job_id));
    }
}

/// Report `outcome` to `sink`, containing any panic it raises.
pub fn emit(sink: &dyn MetricsSink, outcome: GateOutcome, job: &Job) {
    if catch_unwind(AssertUnwindSafe(|| sink.observe(outcome, job))).is_err() {
        warn!(outcome = %outcome, job_class = %job.job_class, "Metrics sink panicked");
    }
}
