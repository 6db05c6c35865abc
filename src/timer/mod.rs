//! Deadline Scheduler Module
//!
//! One-shot and periodic wake-ups keyed by absolute time. The event loop
//! asks the scheduler how long it may block, then drains whatever came due.
//!
//! Payloads are plain values (the server uses a small enum) rather than
//! callbacks, so the owner dispatches them with full access to its own state.

pub mod scheduler;

pub use scheduler::{Expired, Scheduler, SchedulerStats, TimerHandle, BUCKETS};
