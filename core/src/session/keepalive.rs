//! Connection supervisor.
//!
//! `keep_connection` spawns a single long-lived coordinator that multiplexes
//! connectivity signals, redial-campaign results, and session errors, and
//! owns the decision to redial. At most one supervisor runs per session;
//! `stop_keep_connection` tears everything down and leaves the session in
//! `Shutdown`.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info};

use super::{Session, SessionError, SessionState};
use crate::resilience::{apply_jitter, Redialer};

/// Two redial campaigns within this window means we are thrashing; the next
/// one owes a backoff delay even if the session made progress in between.
const AUTO_REDIAL_TOO_QUICK: Duration = Duration::from_secs(2);

impl Session {
    /// Spawn the connection supervisor. Fails if one is already running.
    pub fn keep_connection(self: &Arc<Self>) -> Result<(), SessionError> {
        if self.supervisor_started.swap(true, Ordering::SeqCst) {
            return Err(SessionError::SupervisorRunning);
        }
        let sess = self.clone();
        let handle = tokio::spawn(async move { sess.do_keep_connection().await });
        *self.supervisor.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stop the supervisor (if running), stop any redial campaign, close the
    /// connection, and leave the session in `Shutdown`. Returns only after
    /// the supervisor has unwound.
    pub async fn stop_keep_connection(&self) {
        self.stop_redial();
        let _ = self.stop_tx.try_send(());
        let handle = self.supervisor.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.close_connection(false);
        self.set_state(SessionState::Shutdown);
    }

    /// Feed a connectivity signal from the environment into the supervisor.
    pub async fn has_connectivity(&self, online: bool) {
        let _ = self.conn_tx.send(online).await;
    }

    /// The supervisor body: a select loop over the stop signal, connectivity
    /// signals, redial-campaign completions, and session run errors.
    pub(crate) async fn do_keep_connection(self: Arc<Self>) {
        let mut conn_rx = self
            .conn_rx
            .lock()
            .unwrap()
            .take()
            .expect("connectivity channel already taken");
        let mut err_rx = self
            .err_rx
            .lock()
            .unwrap()
            .take()
            .expect("error channel already taken");
        let mut done_rx = self
            .done_rx
            .lock()
            .unwrap()
            .take()
            .expect("done channel already taken");
        let mut stop_rx = self
            .stop_rx
            .lock()
            .unwrap()
            .take()
            .expect("stop channel already taken");

        self.set_state(SessionState::Disconnected);
        loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    info!("session shutting down");
                    self.stop_redial();
                    self.close_connection(false);
                    self.set_state(SessionState::Shutdown);
                    return;
                }
                Some(online) = conn_rx.recv() => self.handle_connectivity(online),
                Some(attempts) = done_rx.recv() => {
                    info!("connected after {} attempts", attempts);
                }
                Some(err) = err_rx.recv() => {
                    error!(error = %err, "session error");
                    self.set_state(SessionState::Disconnected);
                    if self.last_connectivity() {
                        self.auto_redial();
                    }
                }
            }
        }
    }

    fn handle_connectivity(self: &Arc<Self>, online: bool) {
        self.set_last_conn(online);
        if online {
            let state = self.state();
            if !matches!(
                state,
                SessionState::Connected | SessionState::Started | SessionState::Running
            ) {
                debug!(%state, "connectivity regained, redialing");
                self.auto_redial();
            }
        } else {
            debug!("connectivity lost, disconnecting");
            self.stop_redial();
            self.close_connection(false);
            self.set_state(SessionState::Disconnected);
        }
    }

    /// Start a fresh redial campaign: stop any previous retrier, wait out
    /// the current backoff delay, then dial until it sticks. The attempt
    /// count is forwarded to the supervisor when the campaign ends.
    pub(crate) fn auto_redial(self: &Arc<Self>) {
        self.stop_redial();
        {
            let mut shared = self.shared.lock().unwrap();
            if let Some(last) = shared.last_auto_redial {
                if last.elapsed() < AUTO_REDIAL_TOO_QUICK {
                    shared.should_delay = true;
                }
            }
            shared.last_auto_redial = Some(Instant::now());
        }
        let delay = self.redial_delay();
        let (redialer, handle) = Redialer::new();
        self.shared.lock().unwrap().retrier = Some(handle);

        let sess = self.clone();
        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            let jitter_sess = sess.clone();
            let attempt_sess = sess.clone();
            let attempts = redialer
                .retry_after(
                    delay,
                    move || {
                        let sess = attempt_sess.clone();
                        async move { sess.dial().await }
                    },
                    move |spread| (jitter_sess.redial_jitter.lock().unwrap())(spread),
                )
                .await;
            let _ = done_tx.send(attempts).await;
        });
    }

    /// Stop the current redial campaign, if any. A single retrier is never
    /// reused: the next campaign builds a fresh one.
    pub(crate) fn stop_redial(&self) {
        if let Some(retrier) = self.shared.lock().unwrap().retrier.take() {
            retrier.stop();
        }
    }

    /// The delay the next redial campaign owes. Walks the backoff schedule
    /// while the session is marked as owing a delay, and resets to the head
    /// (returning zero) once it is not.
    pub(crate) fn redial_delay(&self) -> Duration {
        if let Some(hook) = self.redial_delay_hook.lock().unwrap().as_ref() {
            return hook(self);
        }
        self.redial_delay_inner()
    }

    fn redial_delay_inner(&self) -> Duration {
        let base = {
            let mut shared = self.shared.lock().unwrap();
            if !shared.should_delay {
                shared.redial_delay_index = 0;
                return Duration::ZERO;
            }
            let idx = shared.redial_delay_index.min(shared.redial_delays.len() - 1);
            let base = shared.redial_delays[idx];
            if shared.redial_delay_index + 1 < shared.redial_delays.len() {
                shared.redial_delay_index += 1;
            }
            base
        };
        let offset = (self.redial_jitter.lock().unwrap())(base);
        apply_jitter(base, offset)
    }
}
