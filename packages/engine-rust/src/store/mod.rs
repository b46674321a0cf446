//! Per-queue runtime state and the queue registry.
//!
//! [`Queue`] holds one queue's pending sequence, inflight set, and retry
//! schedule behind a mutex and condition variable. [`QueueStore`] is the
//! registry that owns every queue, orchestrates persistence and dead-letter
//! routing, and recovers state at startup.

mod queue;
mod registry;
mod retry;

pub use queue::{
    AcceptOutcome, AwaitOutcome, DeadLetter, DeadLetterReason, DeadLetterTarget, NackOutcome,
    Queue, QueueInfo, SweepOutcome,
};
pub use registry::{QueueStore, SweepReport};
pub use retry::retry_delay_ms;
