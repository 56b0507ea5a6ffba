//! Resilience primitives: backoff schedule, jitter, single-use redialer.

pub mod backoff;

pub use backoff::{apply_jitter, jitter, Redialer, RedialerHandle, TIMEOUTS};
