//! Gate decisions and the outcome tags reported to metrics.

use std::fmt;
use std::time::Duration;

/// The result of a single gate evaluation.
///
/// Decisions are ephemeral: they are consumed by the pipeline and never stored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// Let the job continue to the next stage.
    Proceed,
    /// Discard this instance; an equivalent run is already guaranteed.
    Drop,
    /// This instance will not run; a copy was submitted with the given delay.
    Reschedule(Duration),
}

impl Decision {
    /// Returns true for [`Decision::Proceed`].
    pub fn is_proceed(&self) -> bool {
        matches!(self, Decision::Proceed)
    }

    /// Returns true for [`Decision::Drop`].
    pub fn is_drop(&self) -> bool {
        matches!(self, Decision::Drop)
    }
}

/// Outcome of a throttle gate step, as reported to a metrics sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GateOutcome {
    /// Enqueue lock acquired.
    Enqueued,
    /// Enqueue lock already held by a pending equivalent job.
    EnqueueDropped,
    /// Reschedule copy let through without consulting the enqueue lock.
    EnqueueBypassed,
    /// Perform lock acquired; the body runs.
    Performed,
    /// Perform lock held, reschedule lock acquired; a copy was submitted.
    Rescheduled,
    /// Perform and reschedule locks both held.
    PerformDropped,
}

impl GateOutcome {
    /// The stable tag string for this outcome.
    pub fn as_tag(&self) -> &'static str {
        match self {
            GateOutcome::Enqueued => "enqueue.enqueued",
            GateOutcome::EnqueueDropped => "enqueue.dropped",
            GateOutcome::EnqueueBypassed => "enqueue.bypassed",
            GateOutcome::Performed => "perform.performed",
            GateOutcome::Rescheduled => "perform.rescheduled",
            GateOutcome::PerformDropped => "perform.dropped",
        }
    }
}

impl fmt::Display for GateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}
