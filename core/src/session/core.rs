//! Session core: host resolution, connect, handshake, and the message pump.
//!
//! Faults are never recovered here. Every error drives the session to
//! `Error` and propagates to the supervisor, which decides whether to
//! redial.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::{AddressedNotification, BroadcastNotification, Session, SessionError, SessionState};
use crate::network::connect::dial_host;
use crate::protocol::{
    ClientMessage, Notification, Protocol, ServerMessage, parse_duration, BROKEN_HOST_MISMATCH,
    PROTOCOL_WIRE_VERSION, SYSTEM_CHANNEL_ID,
};

impl Session {
    // ===== host resolution =====

    /// Make sure `delivery_hosts` is populated: from the fallback list, the
    /// cache while fresh, or a fresh endpoint fetch.
    pub(crate) async fn get_hosts(&self) -> Result<(), SessionError> {
        if let Some(fallback) = &self.fallback_hosts {
            self.shared.lock().unwrap().delivery_hosts = Some(fallback.clone());
            return Ok(());
        }
        let getter = self.host_getter.lock().unwrap().clone();
        let Some(getter) = getter else {
            return Err(SessionError::HostResolution(
                "no fallback hosts and no host endpoint configured".to_string(),
            ));
        };
        {
            let shared = self.shared.lock().unwrap();
            if shared.delivery_hosts.is_some() {
                if let Some(fetched_at) = shared.hosts_fetched_at {
                    if fetched_at.elapsed() < self.config.hosts_caching_expiry {
                        return Ok(());
                    }
                }
            }
        }
        match getter.get().await {
            Ok(remote) => {
                debug!(domain = %remote.domain, hosts = remote.hosts.len(), "got delivery hosts");
                let mut shared = self.shared.lock().unwrap();
                shared.delivery_hosts = Some(remote.hosts);
                shared.domain = Some(remote.domain);
                shared.hosts_fetched_at = Some(Instant::now());
                Ok(())
            }
            Err(e) => {
                self.set_state(SessionState::Error);
                Err(SessionError::HostResolution(e.to_string()))
            }
        }
    }

    /// Forget the resolved hosts and their cache timestamp, forcing the next
    /// `get_hosts` to refresh from the endpoint.
    pub(crate) fn reset_hosts(&self) {
        let mut shared = self.shared.lock().unwrap();
        shared.delivery_hosts = None;
        shared.domain = None;
        shared.hosts_fetched_at = None;
    }

    /// Prepare the rotation for a connection attempt. After a long quiet
    /// period the cursor starts over from the head of the list; otherwise it
    /// keeps probing where it left off.
    pub(crate) fn start_connection_attempt(&self) {
        let mut shared = self.shared.lock().unwrap();
        let stale = shared
            .last_attempt
            .map_or(true, |at| at.elapsed() > self.config.expect_all_repaired);
        if stale {
            shared.try_host = 0;
        }
        if shared.left_to_try == 0 {
            let n = shared.delivery_hosts.as_ref().map_or(0, |hosts| hosts.len());
            if n == 0 {
                panic!("should have got hosts from config or remote at this point");
            }
            shared.left_to_try = n;
        }
        shared.last_attempt = Some(Instant::now());
    }

    /// Next host in the rotation, or `None` once the attempt budget for this
    /// campaign is exhausted.
    pub(crate) fn next_host_to_try(&self) -> Option<String> {
        let mut shared = self.shared.lock().unwrap();
        if shared.left_to_try == 0 {
            return None;
        }
        let hosts = shared.delivery_hosts.as_ref()?;
        let host = hosts[shared.try_host].clone();
        shared.try_host = (shared.try_host + 1) % hosts.len();
        shared.left_to_try -= 1;
        Some(host)
    }

    /// Record a successful handshake: refill the attempt budget and back the
    /// cursor up one slot so the next campaign retries the host that just
    /// worked.
    pub(crate) fn started(&self) {
        {
            let mut shared = self.shared.lock().unwrap();
            if let Some(hosts) = &shared.delivery_hosts {
                let n = hosts.len();
                if n > 0 {
                    shared.left_to_try = n;
                    shared.try_host = (shared.try_host + n - 1) % n;
                }
            }
        }
        self.set_state(SessionState::Started);
    }

    // ===== connect =====

    /// Dial hosts from the rotation until one completes TCP+TLS, storing the
    /// connection. Always marks the session as owing a backoff delay; the
    /// handshake and pump clear it once real progress is made.
    pub(crate) async fn connect(&self) -> Result<(), SessionError> {
        self.set_should_delay();
        self.start_connection_attempt();
        let domain = self.shared.lock().unwrap().domain.clone();
        let mut last_err = String::new();
        loop {
            let Some(host) = self.next_host_to_try() else {
                self.set_state(SessionState::Error);
                let hosts = self.shared.lock().unwrap().delivery_hosts.clone();
                return Err(SessionError::Dial(format!(
                    "cannot connect to {:?}: {}",
                    hosts.unwrap_or_default(),
                    last_err
                )));
            };
            let server_name = domain
                .clone()
                .unwrap_or_else(|| host.split(':').next().unwrap_or(&host).to_string());
            match dial_host(
                &host,
                &server_name,
                self.tls.clone(),
                self.config.connect_timeout,
            )
            .await
            {
                Ok(stream) => {
                    debug!(host = %host, "connected");
                    *self.conn.lock().unwrap() = Some(Box::new(stream));
                    self.set_state(SessionState::Connected);
                    return Ok(());
                }
                Err(e) => {
                    debug!(host = %host, error = %e, "dial failed");
                    last_err = e.to_string();
                }
            }
        }
    }

    // ===== handshake =====

    /// Run the connect/connack exchange on the freshly dialed connection.
    pub(crate) async fn start(&self) -> Result<(), SessionError> {
        match self.do_start().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.set_state(SessionState::Error);
                Err(e)
            }
        }
    }

    async fn do_start(&self) -> Result<(), SessionError> {
        let mut conn = self
            .conn
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| SessionError::Handshake("no connection to start".to_string()))?;
        let exchange = self.config.exchange_timeout;

        // the version byte goes out raw, before any framed message
        tokio::time::timeout(exchange, async {
            conn.write_all(&[PROTOCOL_WIRE_VERSION]).await?;
            conn.flush().await
        })
        .await
        .map_err(|_| SessionError::Handshake("write wire version: deadline exceeded".into()))?
        .map_err(|e| SessionError::Handshake(format!("write wire version: {}", e)))?;

        let mut proto = {
            let protocolator = self.protocolator.lock().unwrap();
            let make = protocolator
                .as_ref()
                .expect("session has no protocol constructor");
            make(conn)
        };
        proto.set_deadline(Instant::now() + exchange);

        let levels = self.seen.lock().unwrap().get_all_levels()?;
        let (cookie, info) = {
            let shared = self.shared.lock().unwrap();
            (shared.cookie.clone(), self.config.info.clone())
        };
        proto
            .write_message(&ClientMessage::Connect {
                device_id: self.device_id.clone(),
                levels,
                info,
                cookie,
            })
            .await
            .map_err(|e| SessionError::Handshake(e.to_string()))?;

        let ack = proto
            .read_message()
            .await
            .map_err(|e| SessionError::Handshake(e.to_string()))?;
        if ack.msg_type != "connack" {
            return Err(SessionError::Handshake(format!(
                "expected CONNACK, got {:?}",
                ack.msg_type
            )));
        }
        let params = ack
            .params
            .ok_or_else(|| SessionError::Handshake("invalid CONNACK: missing params".into()))?;
        let ping_interval = parse_duration(&params.ping_interval)
            .map_err(|e| SessionError::Handshake(format!("invalid CONNACK ping interval: {}", e)))?;
        self.shared.lock().unwrap().ping_interval = ping_interval;
        debug!(ping_interval_ms = ping_interval.as_millis() as u64, "handshake complete");

        *self.proto.lock().unwrap() = Some(proto);
        self.started();
        Ok(())
    }

    // ===== message pump =====

    /// Read and dispatch server messages until something fails. The ack/nak
    /// for each message is written before the next message is read.
    pub(crate) async fn msg_loop(self: Arc<Self>) -> Result<(), SessionError> {
        let mut proto = self
            .proto
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| SessionError::Protocol("no protocol to run".to_string()))?;
        self.set_state(SessionState::Running);
        loop {
            let budget = self.config.exchange_timeout + self.ping_interval();
            proto.set_deadline(Instant::now() + budget);
            let msg = match proto.read_message().await {
                Ok(msg) => msg,
                Err(e) => {
                    self.set_state(SessionState::Error);
                    return Err(SessionError::Protocol(e.to_string()));
                }
            };
            match msg.msg_type.as_str() {
                "ping" => self.handle_ping(proto.as_mut()).await?,
                "broadcast" => self.handle_broadcast(proto.as_mut(), &msg).await?,
                "notifications" => self.handle_notifications(proto.as_mut(), &msg).await?,
                "setparams" => {
                    debug!("updated session cookie");
                    self.set_cookie(&msg.set_cookie);
                }
                "warn" | "connwarn" => warn!(reason = %msg.reason, "server warning"),
                "connbroken" => return Err(self.handle_conn_broken(&msg)),
                other => trace!(msg_type = %other, "ignoring unknown message type"),
            }
        }
    }

    /// Answer a server ping with a pong.
    pub(crate) async fn handle_ping(
        &self,
        proto: &mut (dyn Protocol + Send),
    ) -> Result<(), SessionError> {
        match proto.write_message(&ClientMessage::Pong).await {
            Ok(()) => {
                trace!("ping pong");
                self.clear_should_delay();
                Ok(())
            }
            Err(e) => {
                self.set_state(SessionState::Error);
                Err(SessionError::Protocol(e.to_string()))
            }
        }
    }

    /// Record, ack, decode, and emit a broadcast. Broadcasts for channels we
    /// do not recognize are acked and dropped.
    pub(crate) async fn handle_broadcast(
        &self,
        proto: &mut (dyn Protocol + Send),
        msg: &ServerMessage,
    ) -> Result<(), SessionError> {
        if msg.chan_id == SYSTEM_CHANNEL_ID {
            // the guard must drop before any await below
            let recorded = self
                .seen
                .lock()
                .unwrap()
                .set_level(&msg.chan_id, msg.top_level);
            if let Err(e) = recorded {
                if let Err(nak_err) = proto.write_message(&ClientMessage::Nak).await {
                    warn!(error = %nak_err, "failed to nak broadcast");
                }
                self.set_state(SessionState::Error);
                return Err(e.into());
            }
            self.write_ack(proto).await?;

            let decoded: Vec<serde_json::Map<String, serde_json::Value>> = msg
                .payloads
                .iter()
                .filter_map(|payload| match payload {
                    serde_json::Value::Object(object) => Some(object.clone()),
                    _ => None,
                })
                .collect();
            let dropped = msg.payloads.len() - decoded.len();
            if dropped > 0 {
                debug!(dropped, "dropped non-object broadcast payloads");
            }
            debug!(chan_id = %msg.chan_id, top_level = msg.top_level, "broadcast");
            let notification = BroadcastNotification {
                top_level: msg.top_level,
                decoded,
            };
            if self.config.broadcast_tx.send(notification).await.is_err() {
                self.set_state(SessionState::Error);
                return Err(SessionError::Protocol(
                    "broadcast consumer went away".to_string(),
                ));
            }
        } else {
            self.write_ack(proto).await?;
            debug!(chan_id = %msg.chan_id, "broadcast for unrecognized channel dropped");
        }
        self.clear_should_delay();
        Ok(())
    }

    /// Check addressees, filter against seen-state, ack, and emit the
    /// surviving unicast notifications.
    pub(crate) async fn handle_notifications(
        &self,
        proto: &mut (dyn Protocol + Send),
        msg: &ServerMessage,
    ) -> Result<(), SessionError> {
        let mut survivors: Vec<Notification> = Vec::with_capacity(msg.notifications.len());
        let mut addressee: HashMap<String, String> = HashMap::new();
        match &self.config.addressee_checker {
            Some(checker) => {
                checker.start_addressee_batch();
                for notification in &msg.notifications {
                    match checker.check_for_addressee(notification) {
                        Some(to) => {
                            addressee.insert(notification.msg_id.clone(), to);
                            survivors.push(notification.clone());
                        }
                        None => {
                            debug!(app_id = %notification.app_id, "dropping notification for missing addressee");
                        }
                    }
                }
            }
            None => {
                for notification in &msg.notifications {
                    addressee.insert(notification.msg_id.clone(), notification.app_id.clone());
                    survivors.push(notification.clone());
                }
            }
        }

        // the guard must drop before any await below
        let filtered = self.seen.lock().unwrap().filter_by_seen(survivors);
        let unseen = match filtered {
            Ok(unseen) => unseen,
            Err(e) => {
                if let Err(nak_err) = proto.write_message(&ClientMessage::Nak).await {
                    warn!(error = %nak_err, "failed to nak notifications");
                }
                self.set_state(SessionState::Error);
                return Err(e.into());
            }
        };
        self.write_ack(proto).await?;

        for notification in unseen {
            let to = addressee
                .remove(&notification.msg_id)
                .unwrap_or_else(|| notification.app_id.clone());
            let addressed = AddressedNotification { to, notification };
            if self.config.notifications_tx.send(addressed).await.is_err() {
                self.set_state(SessionState::Error);
                return Err(SessionError::Protocol(
                    "notifications consumer went away".to_string(),
                ));
            }
        }
        self.clear_should_delay();
        Ok(())
    }

    /// The server is dropping us; on host-mismatch the host cache is cleared
    /// so the next campaign refreshes from the endpoint.
    pub(crate) fn handle_conn_broken(&self, msg: &ServerMessage) -> SessionError {
        if msg.reason == BROKEN_HOST_MISMATCH {
            warn!("server reports host mismatch, clearing delivery hosts");
            self.reset_hosts();
        }
        self.set_state(SessionState::Error);
        SessionError::ConnBroken(msg.reason.clone())
    }

    async fn write_ack(&self, proto: &mut (dyn Protocol + Send)) -> Result<(), SessionError> {
        proto.write_message(&ClientMessage::Ack).await.map_err(|e| {
            self.set_state(SessionState::Error);
            SessionError::Protocol(e.to_string())
        })
    }

    // ===== run driver =====

    /// Composable driver for one session run: close any leftover connection,
    /// then resolve hosts, connect, and handshake in order (short-circuiting
    /// on error), and finally spawn the message pump. The pump's result goes
    /// to the supervisor's error channel; `closer(true)` runs when the pump
    /// exits.
    pub(crate) async fn run<C, G, H, S, L>(
        self: &Arc<Self>,
        closer: C,
        get_hosts: G,
        connect: H,
        start: S,
        pump: L,
    ) -> Result<(), SessionError>
    where
        C: Fn(bool) + Send + 'static,
        G: Future<Output = Result<(), SessionError>>,
        H: Future<Output = Result<(), SessionError>>,
        S: Future<Output = Result<(), SessionError>>,
        L: Future<Output = Result<(), SessionError>> + Send + 'static,
    {
        closer(false);
        get_hosts.await?;
        connect.await?;
        start.await?;
        let err_tx = self.err_tx.clone();
        let handle = tokio::spawn(async move {
            let result = pump.await;
            closer(true);
            if let Err(e) = result {
                let _ = err_tx.send(e).await;
            }
        });
        *self.pump.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// One full connection attempt: hosts, dial, handshake, pump.
    ///
    /// Panics if the protocol constructor has been unset; that is a
    /// programmer error, not a wire condition.
    pub async fn dial(self: &Arc<Self>) -> Result<(), SessionError> {
        assert!(
            self.protocolator.lock().unwrap().is_some(),
            "session has no protocol constructor"
        );
        let closer = {
            let sess = self.clone();
            move |after_pump: bool| sess.close_connection(after_pump)
        };
        let pump = {
            let sess = self.clone();
            async move { sess.msg_loop().await }
        };
        self.run(closer, self.get_hosts(), self.connect(), self.start(), pump)
            .await
    }
}
