//! The dedup and throttle gates.
//!
//! Gates are stateless: every decision is made by a set-if-absent against the
//! lock store, so the enqueue and perform halves of a protocol may run in
//! different processes.

mod dedup;
mod throttle;

pub use dedup::DedupGate;
pub use throttle::{ThrottleGate, ThrottlePolicy, DEFAULT_RESCHEDULE_MULTIPLIER};
