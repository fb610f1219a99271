//! Job descriptors as seen by the gates.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Queue used when a job does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// Identity token of a single job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(uuid::Uuid);

impl JobId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A unit of work: a job class plus an ordered argument list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Logical job type
    pub job_class: String,
    /// Ordered job arguments
    pub arguments: Vec<Value>,
    /// Destination queue
    pub queue_name: String,
    /// Identity token; `None` means this instance must not be submitted or run
    pub job_id: Option<JobId>,
    /// Set only on reschedule copies so they pass the throttle enqueue gate
    #[serde(default)]
    pub skip_throttle_gate: bool,
}

impl Job {
    /// Create a job on the default queue with a fresh identity.
    pub fn new(job_class: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            job_class: job_class.into(),
            arguments,
            queue_name: DEFAULT_QUEUE.to_string(),
            job_id: Some(JobId::new()),
            skip_throttle_gate: false,
        }
    }

    /// Send this job to a different queue.
    pub fn on_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = queue_name.into();
        self
    }

    /// Canonical JSON of the argument list.
    pub fn serialized_arguments(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.arguments)?)
    }

    /// Build the copy submitted when a perform is rescheduled.
    ///
    /// The copy keeps class, arguments and queue, gets a new identity and is
    /// flagged to skip the throttle enqueue gate it is escaping.
    pub fn reschedule_copy(&self) -> Self {
        Self {
            job_class: self.job_class.clone(),
            arguments: self.arguments.clone(),
            queue_name: self.queue_name.clone(),
            job_id: Some(JobId::new()),
            skip_throttle_gate: true,
        }
    }

    /// Clear the identity token, marking this instance as dropped.
    pub fn clear_identity(&mut self) {
        self.job_id = None;
    }

    /// Whether the identity token has been cleared.
    pub fn is_dropped(&self) -> bool {
        self.job_id.is_none()
    }

    /// Identity for log fields; `-` once dropped.
    pub(crate) fn id_for_log(&self) -> String {
        self.job_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string())
    }
}
