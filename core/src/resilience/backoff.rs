//! Exponential backoff with jitter and cancellation.
//!
//! The base schedule grows roughly geometrically (each step is at least 5/3
//! of the previous one) and the last value repeats forever. A [`Redialer`] is
//! single-use: one campaign, then it is consumed. Its paired handle can
//! interrupt the wait between attempts but never an attempt in flight.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::debug;

/// Base wait durations between attempts, in order. Attempts past the end of
/// the schedule reuse the last entry.
pub const TIMEOUTS: [Duration; 9] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(11),
    Duration::from_secs(19),
    Duration::from_secs(37),
    Duration::from_secs(67),
    Duration::from_secs(113),
    Duration::from_secs(191),
];

/// Uniform random offset in `[-spread, +spread]`, in milliseconds.
pub fn jitter(spread: Duration) -> i64 {
    let spread_ms = spread.as_millis() as i64;
    if spread_ms == 0 {
        return 0;
    }
    rand::thread_rng().gen_range(-spread_ms..=spread_ms)
}

/// Apply a signed millisecond offset to a base duration, clamping at zero.
pub fn apply_jitter(base: Duration, offset_ms: i64) -> Duration {
    let total = base.as_millis() as i64 + offset_ms;
    Duration::from_millis(total.max(0) as u64)
}

/// Cancellation handle for a running [`Redialer`] campaign.
#[derive(Debug, Clone)]
pub struct RedialerHandle {
    stop_tx: mpsc::Sender<()>,
}

impl RedialerHandle {
    /// Interrupt the wait between attempts. An attempt already in flight
    /// runs to completion.
    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(());
    }
}

/// A single-use retry campaign over the backoff schedule.
pub struct Redialer {
    schedule: Vec<Duration>,
    stop_rx: mpsc::Receiver<()>,
}

impl Redialer {
    /// Redialer over the default [`TIMEOUTS`] schedule.
    pub fn new() -> (Self, RedialerHandle) {
        Self::with_schedule(TIMEOUTS.to_vec())
    }

    /// Redialer over a custom non-empty schedule.
    pub fn with_schedule(schedule: Vec<Duration>) -> (Self, RedialerHandle) {
        assert!(!schedule.is_empty(), "backoff schedule must not be empty");
        let (stop_tx, stop_rx) = mpsc::channel(1);
        (Self { schedule, stop_rx }, RedialerHandle { stop_tx })
    }

    /// Call `attempt` until it succeeds or the campaign is stopped; return
    /// the number of attempts performed. Waits `schedule[min(i, N-1)]` plus
    /// `jitter` between attempts.
    pub async fn retry<F, Fut, E, J>(self, attempt: F, jitter: J) -> u32
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        J: Fn(Duration) -> i64,
    {
        self.retry_after(Duration::ZERO, attempt, jitter).await
    }

    /// Like [`retry`](Self::retry), with an initial stop-interruptible delay
    /// before the first attempt.
    pub async fn retry_after<F, Fut, E, J>(
        mut self,
        delay: Duration,
        mut attempt: F,
        jitter: J,
    ) -> u32
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        J: Fn(Duration) -> i64,
    {
        if !delay.is_zero() {
            tokio::select! {
                _ = self.stop_rx.recv() => return 0,
                _ = sleep(delay) => {}
            }
        }
        let mut attempts: u32 = 0;
        loop {
            if attempt().await.is_ok() {
                return attempts + 1;
            }
            let idx = (attempts as usize).min(self.schedule.len() - 1);
            let base = self.schedule[idx];
            let wait = apply_jitter(base, jitter(base));
            attempts = attempts.wrapping_add(1);
            debug!(attempts, wait_ms = wait.as_millis() as u64, "attempt failed, backing off");
            tokio::select! {
                _ = self.stop_rx.recv() => return attempts,
                _ = sleep(wait) => {}
            }
        }
    }
}
