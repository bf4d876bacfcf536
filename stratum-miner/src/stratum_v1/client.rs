//! Stratum v1 client implementation.
//!
//! This module contains the main client that manages the connection lifecycle,
//! protocol state, share submission, and event emission.
//!
//! One [`StratumV1Client`] owns one logical worker against one pool. Each TCP
//! connection is a *session* with its own `session_id`, subscription and
//! extranonce1. When a session ends for any reason its outstanding
//! submissions are dropped, and shares found under it are refused if they
//! arrive later.

use std::collections::HashMap;

use super::backoff::Backoff;
use super::connection::{ConnectionConfig, Connector, TcpConnector, Transport};
use super::error::{StratumError, StratumResult};
use super::messages::{
    AUTHORIZE_ID, ClientCommand, ClientEvent, FIRST_DYNAMIC_ID, JobNotification, JsonRpcMessage,
    PendingShare, RejectReason, SUBSCRIBE_ID, ShareStats, ShareStatus, ShareSubmission,
    SubmitParams, SubscribeResult, parse_set_difficulty, parse_set_extranonce,
};
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::types::Extranonce2;

/// Pool connection configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pool URL (stratum+tcp://host:port or host:port)
    pub url: String,

    /// Worker name as sent to the pool (`user.worker`)
    pub username: String,

    /// Worker password
    pub password: String,

    /// User agent string
    pub user_agent: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            username: String::new(),
            password: "x".to_string(),
            user_agent: concat!("stratum-miner/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Where the client is in the session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Subscribed,
    Authorized,
    Mining,
    /// Terminal: credentials refused or reconnects exhausted
    Faulted,
}

/// Per-connection protocol state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    /// Increments on every new TCP connection
    pub session_id: u64,
    pub subscription_id: Option<String>,
    pub extranonce1: Vec<u8>,
    pub extranonce2_size: usize,
    pub authorized: bool,
    /// A `mining.notify` has arrived on this connection
    pub has_job: bool,
}

/// Stratum v1 client.
///
/// Manages connection to a mining pool, handles the protocol lifecycle
/// (subscribe, authorize), reconnects with backoff, and emits events for
/// jobs and shares.
///
/// Handles Stratum's interleaved message pattern where notifications can
/// arrive between request/response pairs. During setup (subscribe/authorize),
/// we process notifications inline while waiting for responses. Once mining,
/// submits are fire-and-forget and their responses are matched through the
/// outstanding map.
pub struct StratumV1Client {
    pool: PoolConfig,
    config: ConnectionConfig,

    /// Where to send events
    event_tx: mpsc::Sender<ClientEvent>,

    /// Share submissions from the scheduler
    command_rx: mpsc::Receiver<ClientCommand>,

    shutdown: CancellationToken,

    /// Id for the next submit or ping. Never reset, so ids stay unique for
    /// the life of the client.
    next_id: u64,

    session: SessionInfo,

    /// When the current session was authorized
    authorized_at: Option<Instant>,

    /// Submits awaiting a response, keyed by request id
    outstanding: HashMap<u64, PendingShare>,

    stats: ShareStats,

    state_tx: watch::Sender<SessionState>,
}

impl StratumV1Client {
    /// Create a new Stratum v1 client.
    pub fn new(
        pool: PoolConfig,
        config: ConnectionConfig,
        event_tx: mpsc::Sender<ClientEvent>,
        command_rx: mpsc::Receiver<ClientCommand>,
        shutdown: CancellationToken,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        Self {
            pool,
            config,
            event_tx,
            command_rx,
            shutdown,
            next_id: FIRST_DYNAMIC_ID,
            session: SessionInfo::default(),
            authorized_at: None,
            outstanding: HashMap::new(),
            stats: ShareStats::default(),
            state_tx,
        }
    }

    /// Watch the session state.
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Get next message ID and increment counter.
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Session state");
        }
    }

    async fn emit(&mut self, event: ClientEvent) -> StratumResult<()> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| StratumError::Disconnected)
    }

    /// Connect to the pool and run until shutdown or a fatal error.
    pub async fn run(self) -> StratumResult<()> {
        let connector = TcpConnector::new(&self.pool.url, self.config.connect_timeout);
        self.run_with_connector(connector).await
    }

    /// Run the session loop, opening transports through `connector`.
    ///
    /// Transient failures reconnect after a backoff delay. A pool-forced
    /// cycle (`client.reconnect` or an unmanaged-session rejection) waits a
    /// short fixed pause and does not count as a failed attempt.
    /// Authorization failure and exhausted attempts fault the client.
    pub async fn run_with_connector<C: Connector>(mut self, mut connector: C) -> StratumResult<()> {
        let mut backoff = Backoff::new(self.config.backoff.clone());

        loop {
            if self.shutdown.is_cancelled() || self.event_tx.is_closed() {
                self.set_state(SessionState::Disconnected);
                return Ok(());
            }

            self.set_state(SessionState::Connecting);
            let connected = tokio::select! {
                result = connector.connect() => result,
                _ = self.shutdown.cancelled() => {
                    self.set_state(SessionState::Disconnected);
                    return Ok(());
                }
            };

            let outcome = match connected {
                Ok(mut conn) => {
                    let result = self.run_session(&mut conn).await;
                    self.end_session(&result).await;
                    result
                }
                Err(e) => Err(e),
            };

            if let Some(at) = self.authorized_at.take() {
                if backoff.observe_uptime(at.elapsed()) {
                    debug!("Connection was stable, backoff reset");
                }
            }

            let delay = match outcome {
                Ok(()) => {
                    self.set_state(SessionState::Disconnected);
                    return Ok(());
                }
                Err(e) if !e.is_transient() => return self.fault(e).await,
                Err(e @ (StratumError::Unmanaged(_) | StratumError::PoolReconnect)) => {
                    info!(reason = %e, "Pool forced a new session, reconnecting");
                    self.config.forced_reconnect_pause
                }
                Err(e) => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(
                            error = %e,
                            attempt = backoff.attempts(),
                            max_attempts = backoff.max_attempts(),
                            delay_ms = delay.as_millis() as u64,
                            "Pool connection failed, retrying"
                        );
                        delay
                    }
                    None => {
                        warn!(error = %e, "Pool connection failed, no attempts left");
                        return self
                            .fault(StratumError::ReconnectExhausted {
                                attempts: backoff.attempts(),
                            })
                            .await;
                    }
                },
            };

            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.shutdown.cancelled() => {
                    self.set_state(SessionState::Disconnected);
                    return Ok(());
                }
            }
        }
    }

    async fn fault(&mut self, error: StratumError) -> StratumResult<()> {
        self.set_state(SessionState::Faulted);
        warn!(error = %error, "Stratum client faulted");
        self.event_tx
            .send(ClientEvent::Fatal(error.to_string()))
            .await
            .ok();
        Err(error)
    }

    /// Drive one connection from handshake to disconnect.
    ///
    /// Returns `Ok(())` only on shutdown.
    async fn run_session(&mut self, conn: &mut dyn Transport) -> StratumResult<()> {
        self.session = SessionInfo {
            session_id: self.session.session_id + 1,
            ..SessionInfo::default()
        };
        let session_id = self.session.session_id;
        info!(pool = %self.pool.url, session_id, "Connected to pool");
        self.emit(ClientEvent::Connected { session_id }).await?;

        self.subscribe(conn).await?;
        self.authorize(conn).await?;
        self.main_loop(conn).await
    }

    /// Tear down a session. Pending submissions die with it.
    async fn end_session(&mut self, result: &StratumResult<()>) {
        self.session.authorized = false;
        if !self.outstanding.is_empty() {
            debug!(
                count = self.outstanding.len(),
                "Dropping submissions awaiting response"
            );
            self.outstanding.clear();
        }

        let reason = match result {
            Ok(()) => "shutdown".to_string(),
            Err(e) => e.to_string(),
        };
        info!(
            session_id = self.session.session_id,
            reason = %reason,
            submitted = self.stats.submitted,
            accepted = self.stats.accepted,
            rejected = self.stats.rejected,
            discarded = self.stats.discarded,
            "Disconnected from pool"
        );
        self.set_state(SessionState::Disconnected);
        self.event_tx
            .send(ClientEvent::Disconnected {
                session_id: self.session.session_id,
                reason,
            })
            .await
            .ok();
    }

    /// Send a request and wait for its response.
    ///
    /// Sends the request and then loops reading messages from the connection,
    /// handling notifications along the way, until the response arrives.
    /// This handles Stratum's message interleaving during the setup phase.
    ///
    /// Times out after `request_timeout` if no response is received. Responds
    /// immediately to shutdown requests.
    async fn send_request(
        &mut self,
        conn: &mut dyn Transport,
        id: u64,
        method: &str,
        params: Value,
    ) -> StratumResult<JsonRpcMessage> {
        let msg = JsonRpcMessage::request(id, method, params);
        conn.write_message(&msg).await?;

        let timeout_dur = self.config.request_timeout;
        tokio::time::timeout(timeout_dur, async {
            loop {
                tokio::select! {
                    result = conn.read_message() => {
                        let msg = match result {
                            Ok(Some(msg)) => msg,
                            Ok(None) => return Err(StratumError::Disconnected),
                            Err(StratumError::InvalidMessage(e)) => {
                                warn!(error = %e, "Received malformed message from pool, ignoring");
                                continue;
                            }
                            Err(e) => return Err(e),
                        };

                        match msg {
                            JsonRpcMessage::Response { id: resp_id, .. } if resp_id == id => {
                                return Ok(msg);
                            }
                            JsonRpcMessage::Response { id: other_id, .. } => {
                                warn!(msg_id = other_id, "Received response for different request");
                            }
                            JsonRpcMessage::Request { id: None, method, params } => {
                                match self.handle_notification(&method, &params).await {
                                    Err(
                                        e @ (StratumError::PoolReconnect
                                        | StratumError::Disconnected
                                        | StratumError::UnsupportedExtranonce2Size(_)),
                                    ) => {
                                        return Err(e);
                                    }
                                    Err(e) => warn!(error = %e, "Error handling notification during setup"),
                                    Ok(()) => {}
                                }
                            }
                            JsonRpcMessage::Request { id: Some(req_id), method, .. } => {
                                self.answer_server_request(conn, req_id, &method).await?;
                            }
                        }
                    }

                    _ = self.shutdown.cancelled() => {
                        return Err(StratumError::Disconnected);
                    }
                }
            }
        })
        .await
        .map_err(|_| StratumError::Timeout("response"))?
    }

    /// Subscribe to mining notifications.
    ///
    /// Sends `mining.subscribe` and waits for the response containing
    /// extranonce1 and extranonce2_size.
    async fn subscribe(&mut self, conn: &mut dyn Transport) -> StratumResult<()> {
        let user_agent = self.pool.user_agent.clone();
        let response = self
            .send_request(conn, SUBSCRIBE_ID, "mining.subscribe", json!([user_agent]))
            .await?;

        let sub = match response {
            JsonRpcMessage::Response {
                result: Some(result),
                error: None,
                ..
            } => SubscribeResult::from_result(&result).map_err(StratumError::SubscriptionFailed)?,
            JsonRpcMessage::Response {
                error: Some(error), ..
            } => return Err(StratumError::SubscriptionFailed(error.to_string())),
            _ => {
                return Err(StratumError::UnexpectedResponse(
                    "Invalid subscribe response".to_string(),
                ));
            }
        };
        check_extranonce2_size(sub.extranonce2_size)?;

        debug!(
            subscription_id = ?sub.subscription_id,
            extranonce1 = %hex::encode(&sub.extranonce1),
            extranonce2_size = sub.extranonce2_size,
            "Subscribed"
        );

        self.session.subscription_id = sub.subscription_id;
        self.session.extranonce1 = sub.extranonce1.clone();
        self.session.extranonce2_size = sub.extranonce2_size;
        self.set_state(SessionState::Subscribed);

        self.emit(ClientEvent::Subscribed {
            session_id: self.session.session_id,
            extranonce1: sub.extranonce1,
            extranonce2_size: sub.extranonce2_size,
        })
        .await
    }

    /// Authorize with the pool.
    ///
    /// A `false` result or an error response is final for this client:
    /// retrying the same credentials is pointless.
    async fn authorize(&mut self, conn: &mut dyn Transport) -> StratumResult<()> {
        let params = json!([&self.pool.username, &self.pool.password]);
        let response = self
            .send_request(conn, AUTHORIZE_ID, "mining.authorize", params)
            .await?;

        match response {
            JsonRpcMessage::Response {
                result: Some(Value::Bool(true)),
                error: None,
                ..
            } => {}
            JsonRpcMessage::Response {
                error: Some(error), ..
            } => return Err(StratumError::AuthorizationFailed(error.to_string())),
            JsonRpcMessage::Response { .. } => {
                return Err(StratumError::AuthorizationFailed(
                    "Pool returned false".to_string(),
                ));
            }
            _ => {
                return Err(StratumError::UnexpectedResponse(
                    "Invalid authorize response".to_string(),
                ));
            }
        }

        info!(worker = %self.pool.username, "Authorized");
        self.session.authorized = true;
        self.authorized_at = Some(Instant::now());
        self.set_state(SessionState::Authorized);
        // Work pushed ahead of the authorize response is already being mined
        if self.session.has_job {
            self.set_state(SessionState::Mining);
        }
        self.emit(ClientEvent::Authorized {
            session_id: self.session.session_id,
        })
        .await
    }

    /// Main event loop: notifications, submit responses, share commands and
    /// keep-alive.
    async fn main_loop(&mut self, conn: &mut dyn Transport) -> StratumResult<()> {
        let interval = self.config.keepalive_interval;
        let mut last_rx = Instant::now();
        let mut last_ping = last_rx;

        loop {
            let ping_at = last_rx.max(last_ping) + interval;
            let dead_at = last_rx + interval * 3;

            tokio::select! {
                msg = conn.read_message() => {
                    match msg {
                        Ok(Some(msg)) => {
                            last_rx = Instant::now();
                            self.handle_message(conn, msg).await?;
                        }
                        Ok(None) => {
                            info!("Connection closed by pool");
                            return Err(StratumError::Disconnected);
                        }
                        Err(StratumError::InvalidMessage(e)) => {
                            // Pool sent malformed message (e.g., error response with id=null)
                            last_rx = Instant::now();
                            warn!(error = %e, "Received malformed message from pool, ignoring");
                        }
                        Err(e) => return Err(e),
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        ClientCommand::SubmitShare(share) => self.submit(conn, share).await?,
                    }
                }

                _ = sleep_until(ping_at.min(dead_at)) => {
                    if Instant::now() >= dead_at {
                        warn!(silent_secs = (interval * 3).as_secs(), "No data from pool");
                        return Err(StratumError::Timeout("keep-alive"));
                    }
                    let id = self.next_id();
                    trace!(id, "Sending keep-alive ping");
                    conn.write_message(&JsonRpcMessage::request(id, "mining.ping", json!([])))
                        .await?;
                    last_ping = Instant::now();
                }

                _ = self.shutdown.cancelled() => {
                    return Ok(());
                }
            }
        }
    }

    async fn handle_message(
        &mut self,
        conn: &mut dyn Transport,
        msg: JsonRpcMessage,
    ) -> StratumResult<()> {
        match msg {
            JsonRpcMessage::Request {
                id: None,
                method,
                params,
            } => match self.handle_notification(&method, &params).await {
                Err(
                    e @ (StratumError::PoolReconnect
                    | StratumError::Disconnected
                    | StratumError::UnsupportedExtranonce2Size(_)),
                ) => Err(e),
                Err(e) => {
                    warn!(method = %method, error = %e, "Error handling notification");
                    Ok(())
                }
                Ok(()) => Ok(()),
            },
            JsonRpcMessage::Request {
                id: Some(id),
                method,
                ..
            } => self.answer_server_request(conn, id, &method).await,
            JsonRpcMessage::Response { id, result, error } => {
                match self.outstanding.remove(&id) {
                    Some(share) => self.handle_submit_response(share, result, error).await,
                    None => {
                        // Ping replies land here, including errors from
                        // pools that don't implement mining.ping
                        trace!(msg_id = id, "Response with no pending submission");
                        Ok(())
                    }
                }
            }
        }
    }

    /// Reply to the few requests pools send with an id.
    async fn answer_server_request(
        &mut self,
        conn: &mut dyn Transport,
        id: u64,
        method: &str,
    ) -> StratumResult<()> {
        let reply = match method {
            "mining.ping" => JsonRpcMessage::response(id, json!("pong")),
            "client.get_version" => JsonRpcMessage::response(id, json!(self.pool.user_agent)),
            _ => {
                warn!(method = %method, "Server sent unsupported request");
                JsonRpcMessage::error_response(id, json!([20, "Method not supported", null]))
            }
        };
        conn.write_message(&reply).await
    }

    /// Handle a notification from the pool.
    async fn handle_notification(&mut self, method: &str, params: &Value) -> StratumResult<()> {
        match method {
            "mining.notify" => self.handle_mining_notify(params).await,
            "mining.set_difficulty" => {
                let difficulty =
                    parse_set_difficulty(params).map_err(StratumError::InvalidMessage)?;
                debug!(difficulty = %difficulty, "Pool set difficulty");
                self.emit(ClientEvent::DifficultyChanged(difficulty)).await
            }
            "mining.set_extranonce" => {
                let (extranonce1, extranonce2_size) =
                    parse_set_extranonce(params).map_err(StratumError::InvalidMessage)?;
                check_extranonce2_size(extranonce2_size)?;
                debug!(
                    extranonce1 = %hex::encode(&extranonce1),
                    extranonce2_size,
                    "Pool set extranonce"
                );
                self.session.extranonce1 = extranonce1.clone();
                self.session.extranonce2_size = extranonce2_size;
                self.emit(ClientEvent::ExtranonceChanged {
                    session_id: self.session.session_id,
                    extranonce1,
                    extranonce2_size,
                })
                .await
            }
            "client.reconnect" => Err(StratumError::PoolReconnect),
            "client.show_message" => {
                info!(message = %params, "Message from pool");
                Ok(())
            }
            _ => {
                warn!(method = %method, "Unknown notification method");
                Ok(())
            }
        }
    }

    /// Handle mining.notify notification.
    async fn handle_mining_notify(&mut self, params: &Value) -> StratumResult<()> {
        let arr = params.as_array().ok_or_else(|| {
            StratumError::InvalidMessage("mining.notify params not an array".to_string())
        })?;

        let job = JobNotification::from_stratum_params(arr)
            .map_err(|e| StratumError::InvalidMessage(format!("Failed to parse job: {}", e)))?;

        self.session.has_job = true;
        let authorized = *self.state_tx.borrow() == SessionState::Authorized;
        if authorized {
            self.set_state(SessionState::Mining);
        }

        self.emit(ClientEvent::NewJob {
            session_id: self.session.session_id,
            job,
        })
        .await
    }

    /// Submit a share to the pool.
    ///
    /// Shares from an earlier session are dropped: their extranonce1 and job
    /// belong to a subscription the pool has forgotten.
    async fn submit(
        &mut self,
        conn: &mut dyn Transport,
        share: ShareSubmission,
    ) -> StratumResult<()> {
        if share.session_id != self.session.session_id || !self.session.authorized {
            self.stats.discarded += 1;
            debug!(
                job_id = %share.job_id,
                share_session = share.session_id,
                session_id = self.session.session_id,
                "Dropping share from previous session"
            );
            return Ok(());
        }

        let id = self.next_id();
        let params = SubmitParams {
            username: self.pool.username.clone(),
            job_id: share.job_id.clone(),
            extranonce2: share.extranonce2,
            ntime: share.ntime,
            nonce: share.nonce,
        };

        debug!(
            id,
            job_id = %share.job_id,
            extranonce2 = %share.extranonce2,
            nonce = format_args!("{:#010x}", share.nonce),
            "Submitting share"
        );
        conn.write_message(&JsonRpcMessage::request(
            id,
            "mining.submit",
            Value::Array(params.to_stratum_json()),
        ))
        .await?;

        self.stats.submitted += 1;
        self.outstanding.insert(
            id,
            PendingShare {
                job_id: share.job_id,
                extranonce2: share.extranonce2,
                ntime: share.ntime,
                nonce: share.nonce,
                correlation_id: id,
                status: ShareStatus::Pending,
                sent_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Resolve a pending share and emit ShareAccepted or ShareRejected.
    ///
    /// An unmanaged-session rejection ends the session so the run loop
    /// performs one full reconnect cycle.
    async fn handle_submit_response(
        &mut self,
        mut share: PendingShare,
        result: Option<Value>,
        error: Option<Value>,
    ) -> StratumResult<()> {
        let latency = share.sent_at.elapsed();
        let status = match (result, error) {
            (_, Some(error)) => ShareStatus::Rejected(RejectReason::classify(&error)),
            (Some(Value::Bool(true)), None) => ShareStatus::Accepted,
            _ => ShareStatus::Rejected(RejectReason::Other {
                code: None,
                message: "Pool returned false".to_string(),
            }),
        };
        share.resolve(status);

        match share.status {
            ShareStatus::Accepted => {
                self.stats.accepted += 1;
                self.emit(ClientEvent::ShareAccepted {
                    job_id: share.job_id,
                    nonce: share.nonce,
                    latency,
                })
                .await
            }
            ShareStatus::Rejected(reason) => {
                self.stats.rejected += 1;
                let unmanaged = reason.is_unmanaged();
                let message = reason.to_string();
                self.emit(ClientEvent::ShareRejected {
                    job_id: share.job_id,
                    reason,
                })
                .await?;

                if unmanaged {
                    return Err(StratumError::Unmanaged(message));
                }
                Ok(())
            }
            ShareStatus::Pending => Ok(()),
        }
    }
}

/// Every retry would be handed the same width, so an unusable one is final.
fn check_extranonce2_size(size: usize) -> StratumResult<()> {
    if size > Extranonce2::MAX_SIZE {
        return Err(StratumError::UnsupportedExtranonce2Size(size));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::connection::{MockConnector, MockTransport, MockTransportHandle};
    use super::*;
    use crate::types::{Difficulty, Extranonce2};
    use std::time::Duration;

    const NOTIFY_PREVHASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

    struct Harness {
        event_rx: mpsc::Receiver<ClientEvent>,
        command_tx: mpsc::Sender<ClientCommand>,
        transports: mpsc::UnboundedSender<MockTransport>,
        attempts: std::sync::Arc<std::sync::Mutex<Vec<Instant>>>,
        state: watch::Receiver<SessionState>,
        shutdown: CancellationToken,
        task: tokio::task::JoinHandle<StratumResult<()>>,
    }

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            keepalive_interval: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    fn spawn_client(config: ConnectionConfig) -> Harness {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (command_tx, command_rx) = mpsc::channel(64);
        let shutdown = CancellationToken::new();

        let pool = PoolConfig {
            url: "test:3333".to_string(),
            username: "alice.rig1".to_string(),
            password: "x".to_string(),
            user_agent: "test".to_string(),
        };

        let client = StratumV1Client::new(pool, config, event_tx, command_rx, shutdown.clone());
        let state = client.state();
        let (connector, transports, attempts) = MockConnector::new();
        let task = tokio::spawn(client.run_with_connector(connector));

        Harness {
            event_rx,
            command_tx,
            transports,
            attempts,
            state,
            shutdown,
            task,
        }
    }

    impl Harness {
        fn queue_transport(&self) -> MockTransportHandle {
            let (transport, handle) = MockTransport::pair();
            self.transports.send(transport).unwrap();
            handle
        }

        async fn next_event(&mut self) -> ClientEvent {
            self.event_rx.recv().await.expect("event channel closed")
        }

        async fn submit(&self, session_id: u64, job_id: &str, nonce: u32) {
            self.command_tx
                .send(ClientCommand::SubmitShare(ShareSubmission {
                    session_id,
                    job_id: job_id.to_string(),
                    extranonce2: Extranonce2::new(1, 4).unwrap(),
                    ntime: 0x5a5a5a5a,
                    nonce,
                }))
                .await
                .unwrap();
        }
    }

    /// Answer subscribe and authorize the way a healthy pool does.
    async fn handshake(pool: &mut MockTransportHandle) {
        let sub = pool.recv().await;
        assert_eq!(sub.id(), Some(SUBSCRIBE_ID));
        assert_eq!(sub.method(), Some("mining.subscribe"));
        pool.send(JsonRpcMessage::response(
            SUBSCRIBE_ID,
            json!([[["mining.notify", "sub1"]], "f000000f", 4]),
        ));

        let auth = pool.recv().await;
        assert_eq!(auth.id(), Some(AUTHORIZE_ID));
        match &auth {
            JsonRpcMessage::Request { method, params, .. } => {
                assert_eq!(method, "mining.authorize");
                assert_eq!(params, &json!(["alice.rig1", "x"]));
            }
            other => panic!("expected authorize request, got {:?}", other),
        }
        pool.send(JsonRpcMessage::response(AUTHORIZE_ID, json!(true)));
    }

    fn notify(job_id: &str, clean: bool) -> JsonRpcMessage {
        JsonRpcMessage::notification(
            "mining.notify",
            json!([
                job_id,
                NOTIFY_PREVHASH,
                "aa",
                "bb",
                [],
                "20000000",
                "1d00ffff",
                "5a5a5a5a",
                clean
            ]),
        )
    }

    /// Skip events until `pred` matches.
    async fn wait_for(h: &mut Harness, pred: impl Fn(&ClientEvent) -> bool) -> ClientEvent {
        loop {
            let event = h.next_event().await;
            if pred(&event) {
                return event;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_states_and_events() {
        let mut h = spawn_client(test_config());
        let mut pool = h.queue_transport();

        handshake(&mut pool).await;

        assert!(matches!(
            h.next_event().await,
            ClientEvent::Connected { session_id: 1 }
        ));
        match h.next_event().await {
            ClientEvent::Subscribed {
                session_id,
                extranonce1,
                extranonce2_size,
            } => {
                assert_eq!(session_id, 1);
                assert_eq!(extranonce1, vec![0xf0, 0x00, 0x00, 0x0f]);
                assert_eq!(extranonce2_size, 4);
            }
            other => panic!("expected Subscribed, got {:?}", other),
        }
        assert!(matches!(
            h.next_event().await,
            ClientEvent::Authorized { session_id: 1 }
        ));
        assert_eq!(*h.state.borrow(), SessionState::Authorized);

        pool.send(JsonRpcMessage::notification("mining.set_difficulty", json!([0.5])));
        pool.send(notify("job1", true));

        match h.next_event().await {
            ClientEvent::DifficultyChanged(d) => assert_eq!(d, Difficulty::new(0.5).unwrap()),
            other => panic!("expected DifficultyChanged, got {:?}", other),
        }
        match h.next_event().await {
            ClientEvent::NewJob { session_id, job } => {
                assert_eq!(session_id, 1);
                assert_eq!(job.job_id, "job1");
                assert!(job.clean_jobs);
            }
            other => panic!("expected NewJob, got {:?}", other),
        }
        assert_eq!(*h.state.borrow(), SessionState::Mining);

        h.shutdown.cancel();
        assert!((&mut h.task).await.unwrap().is_ok());
        assert_eq!(*h.state.borrow(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notifications_during_handshake_are_processed() {
        let mut h = spawn_client(test_config());
        let mut pool = h.queue_transport();

        let sub = pool.recv().await;
        // Pool pushes work before answering subscribe
        pool.send(JsonRpcMessage::notification("mining.set_difficulty", json!([8])));
        pool.send(JsonRpcMessage::response(
            sub.id().unwrap(),
            json!([null, "01", 2]),
        ));
        pool.recv().await;
        pool.send(JsonRpcMessage::response(AUTHORIZE_ID, json!(true)));

        let event = wait_for(&mut h, |e| matches!(e, ClientEvent::DifficultyChanged(_))).await;
        assert!(matches!(event, ClientEvent::DifficultyChanged(d) if d.as_f64() == 8.0));
        wait_for(&mut h, |e| matches!(e, ClientEvent::Authorized { .. })).await;

        h.shutdown.cancel();
        (&mut h.task).await.unwrap().unwrap();
    }

    /// Scenario A at the protocol level: one share, one `true`, one event.
    #[tokio::test(start_paused = true)]
    async fn test_share_accepted_exactly_once() {
        let mut h = spawn_client(test_config());
        let mut pool = h.queue_transport();
        handshake(&mut pool).await;
        pool.send(notify("jobA", true));
        wait_for(&mut h, |e| matches!(e, ClientEvent::NewJob { .. })).await;

        h.submit(1, "jobA", 0xdeadbeef).await;

        let submit = pool.recv().await;
        let id = submit.id().unwrap();
        assert!(id >= FIRST_DYNAMIC_ID);
        match &submit {
            JsonRpcMessage::Request { method, params, .. } => {
                assert_eq!(method, "mining.submit");
                assert_eq!(
                    params,
                    &json!(["alice.rig1", "jobA", "01000000", "5a5a5a5a", "deadbeef"])
                );
            }
            other => panic!("expected submit, got {:?}", other),
        }

        pool.send(JsonRpcMessage::response(id, json!(true)));
        // A duplicate response for the same id must not produce a second event
        pool.send(JsonRpcMessage::response(id, json!(true)));
        pool.send(JsonRpcMessage::notification("mining.set_difficulty", json!([2])));

        match h.next_event().await {
            ClientEvent::ShareAccepted { job_id, nonce, .. } => {
                assert_eq!(job_id, "jobA");
                assert_eq!(nonce, 0xdeadbeef);
            }
            other => panic!("expected ShareAccepted, got {:?}", other),
        }
        assert!(matches!(
            h.next_event().await,
            ClientEvent::DifficultyChanged(_)
        ));

        h.shutdown.cancel();
        (&mut h.task).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_share_rejections_are_classified_and_mining_continues() {
        let mut h = spawn_client(test_config());
        let mut pool = h.queue_transport();
        handshake(&mut pool).await;

        h.submit(1, "job1", 1).await;
        let id = pool.recv().await.id().unwrap();
        pool.send(JsonRpcMessage::error_response(
            id,
            json!([23, "Low difficulty share", null]),
        ));

        h.submit(1, "job2", 2).await;
        let id = pool.recv().await.id().unwrap();
        pool.send(JsonRpcMessage::response(id, json!(false)));

        let event = wait_for(&mut h, |e| matches!(e, ClientEvent::ShareRejected { .. })).await;
        match event {
            ClientEvent::ShareRejected { job_id, reason } => {
                assert_eq!(job_id, "job1");
                assert_eq!(reason, RejectReason::LowDifficulty);
            }
            _ => unreachable!(),
        }
        match h.next_event().await {
            ClientEvent::ShareRejected { job_id, reason } => {
                assert_eq!(job_id, "job2");
                assert!(matches!(reason, RejectReason::Other { code: None, .. }));
            }
            other => panic!("expected ShareRejected, got {:?}", other),
        }

        // Still connected
        pool.send(notify("job3", false));
        assert!(matches!(
            h.next_event().await,
            ClientEvent::NewJob { .. }
        ));

        h.shutdown.cancel();
        (&mut h.task).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_submission_ids_are_unique() {
        let mut h = spawn_client(test_config());
        let mut pool = h.queue_transport();
        handshake(&mut pool).await;

        for nonce in 0..20 {
            h.submit(1, "job", nonce).await;
        }

        let mut ids = std::collections::HashSet::new();
        for _ in 0..20 {
            let id = pool.recv().await.id().unwrap();
            assert!(id >= FIRST_DYNAMIC_ID);
            assert!(ids.insert(id), "id {} reused", id);
        }

        h.shutdown.cancel();
        (&mut h.task).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_share_from_old_session_is_dropped() {
        let mut h = spawn_client(test_config());
        let mut pool = h.queue_transport();
        handshake(&mut pool).await;

        h.submit(7, "old", 1).await;
        h.submit(1, "current", 2).await;

        match pool.recv().await {
            JsonRpcMessage::Request { params, .. } => assert_eq!(params[1], "current"),
            other => panic!("expected submit, got {:?}", other),
        }

        h.shutdown.cancel();
        (&mut h.task).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_line_does_not_disconnect() {
        let mut h = spawn_client(test_config());
        let mut pool = h.queue_transport();
        handshake(&mut pool).await;

        pool.send_malformed("{\"id\":null,\"result\":null,\"error\":[20,\"x\"]}");
        pool.send(JsonRpcMessage::notification("mining.notify", json!(["too", "short"])));
        pool.send(notify("job1", true));

        let event = wait_for(&mut h, |e| {
            matches!(e, ClientEvent::NewJob { .. } | ClientEvent::Disconnected { .. })
        })
        .await;
        assert!(matches!(event, ClientEvent::NewJob { .. }));

        h.shutdown.cancel();
        (&mut h.task).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_authorization_failure_faults_without_retry() {
        let mut h = spawn_client(test_config());
        let mut pool = h.queue_transport();
        // A second transport would be used if the client wrongly retried
        let mut spare = h.queue_transport();

        pool.recv().await;
        pool.send(JsonRpcMessage::response(
            SUBSCRIBE_ID,
            json!([null, "00", 4]),
        ));
        pool.recv().await;
        pool.send(JsonRpcMessage::error_response(
            AUTHORIZE_ID,
            json!([24, "Unauthorized worker", null]),
        ));

        let result = (&mut h.task).await.unwrap();
        assert!(matches!(result, Err(StratumError::AuthorizationFailed(_))));
        assert_eq!(*h.state.borrow(), SessionState::Faulted);

        let event = wait_for(&mut h, |e| matches!(e, ClientEvent::Fatal(_))).await;
        assert!(matches!(event, ClientEvent::Fatal(_)));
        assert_eq!(h.attempts.lock().unwrap().len(), 1);
        assert!(spare.try_recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_before_authorize_response_enters_mining() {
        let mut h = spawn_client(test_config());
        let mut pool = h.queue_transport();

        pool.recv().await;
        pool.send(JsonRpcMessage::response(
            SUBSCRIBE_ID,
            json!([null, "00", 4]),
        ));
        pool.recv().await;
        // Work arrives while the authorize response is still pending
        pool.send(notify("job1", true));
        pool.send(JsonRpcMessage::response(AUTHORIZE_ID, json!(true)));

        let event = wait_for(&mut h, |e| matches!(e, ClientEvent::NewJob { .. })).await;
        assert!(matches!(event, ClientEvent::NewJob { ref job, .. } if job.job_id == "job1"));
        wait_for(&mut h, |e| matches!(e, ClientEvent::Authorized { .. })).await;
        assert_eq!(*h.state.borrow(), SessionState::Mining);

        h.shutdown.cancel();
        (&mut h.task).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_extranonce2_faults_without_retry() {
        let mut h = spawn_client(test_config());
        let mut pool = h.queue_transport();
        let mut spare = h.queue_transport();

        pool.recv().await;
        pool.send(JsonRpcMessage::response(
            SUBSCRIBE_ID,
            json!([null, "00", 16]),
        ));

        let result = (&mut h.task).await.unwrap();
        assert!(matches!(
            result,
            Err(StratumError::UnsupportedExtranonce2Size(16))
        ));
        assert_eq!(*h.state.borrow(), SessionState::Faulted);
        assert_eq!(h.attempts.lock().unwrap().len(), 1);
        assert!(spare.try_recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_set_extranonce_faults() {
        let mut h = spawn_client(test_config());
        let mut pool = h.queue_transport();
        handshake(&mut pool).await;
        wait_for(&mut h, |e| matches!(e, ClientEvent::Authorized { .. })).await;

        pool.send(JsonRpcMessage::notification(
            "mining.set_extranonce",
            json!(["cafe", 12]),
        ));

        let result = (&mut h.task).await.unwrap();
        assert!(matches!(
            result,
            Err(StratumError::UnsupportedExtranonce2Size(12))
        ));
        assert_eq!(*h.state.borrow(), SessionState::Faulted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_authorize_false_faults() {
        let mut h = spawn_client(test_config());
        let mut pool = h.queue_transport();

        pool.recv().await;
        pool.send(JsonRpcMessage::response(SUBSCRIBE_ID, json!([null, "00", 4])));
        pool.recv().await;
        pool.send(JsonRpcMessage::response(AUTHORIZE_ID, json!(false)));

        assert!(matches!(
            (&mut h.task).await.unwrap(),
            Err(StratumError::AuthorizationFailed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_backoff_then_exhaustion() {
        let mut config = test_config();
        config.backoff.max_attempts = 4;
        let mut h = spawn_client(config);

        // Nothing queued: every connect is refused
        let result = (&mut h.task).await.unwrap();
        assert!(matches!(
            result,
            Err(StratumError::ReconnectExhausted { attempts: 4 })
        ));
        assert_eq!(*h.state.borrow(), SessionState::Faulted);

        let times = h.attempts.lock().unwrap().clone();
        assert_eq!(times.len(), 5);
        let gaps: Vec<u64> = times
            .windows(2)
            .map(|w| (w[1] - w[0]).as_secs())
            .collect();
        assert_eq!(gaps, vec![1, 2, 4, 8]);

        let event = wait_for(&mut h, |e| matches!(e, ClientEvent::Fatal(_))).await;
        assert!(matches!(event, ClientEvent::Fatal(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_pool_closes() {
        let mut h = spawn_client(test_config());
        let mut first = h.queue_transport();
        handshake(&mut first).await;
        wait_for(&mut h, |e| matches!(e, ClientEvent::Authorized { .. })).await;

        let mut second = h.queue_transport();
        drop(first);

        match wait_for(&mut h, |e| matches!(e, ClientEvent::Disconnected { .. })).await {
            ClientEvent::Disconnected { session_id, .. } => assert_eq!(session_id, 1),
            _ => unreachable!(),
        }

        handshake(&mut second).await;
        assert!(matches!(
            wait_for(&mut h, |e| matches!(e, ClientEvent::Authorized { .. })).await,
            ClientEvent::Authorized { session_id: 2 }
        ));

        // The reconnect waited for the first backoff step
        let times = h.attempts.lock().unwrap().clone();
        assert_eq!((times[1] - times[0]).as_secs(), 1);

        h.shutdown.cancel();
        (&mut h.task).await.unwrap().unwrap();
    }

    /// Scenario C: an unmanaged rejection triggers exactly one
    /// disconnect, reconnect, resubscribe, reauthorize cycle.
    #[tokio::test(start_paused = true)]
    async fn test_unmanaged_rejection_forces_one_reconnect_cycle() {
        let mut h = spawn_client(test_config());
        let mut first = h.queue_transport();
        let mut second = h.queue_transport();

        handshake(&mut first).await;
        first.send(notify("job1", true));
        wait_for(&mut h, |e| matches!(e, ClientEvent::NewJob { .. })).await;

        h.submit(1, "job1", 42).await;
        let id = first.recv().await.id().unwrap();
        first.send(JsonRpcMessage::error_response(
            id,
            json!([9250, "Hash not properly managed", null]),
        ));

        match h.next_event().await {
            ClientEvent::ShareRejected { reason, .. } => assert_eq!(reason, RejectReason::Unmanaged),
            other => panic!("expected ShareRejected, got {:?}", other),
        }
        assert!(matches!(
            h.next_event().await,
            ClientEvent::Disconnected { session_id: 1, .. }
        ));

        // Old transport is closed by the client
        assert!(first.try_recv().await.is_none());

        handshake(&mut second).await;
        assert!(matches!(
            h.next_event().await,
            ClientEvent::Connected { session_id: 2 }
        ));
        assert!(matches!(
            h.next_event().await,
            ClientEvent::Subscribed { session_id: 2, .. }
        ));
        assert!(matches!(
            h.next_event().await,
            ClientEvent::Authorized { session_id: 2 }
        ));

        // Exactly one cycle
        assert_eq!(h.attempts.lock().unwrap().len(), 2);

        // The session stays up; nothing more happens on its own
        second.send(notify("job2", true));
        assert!(matches!(
            h.next_event().await,
            ClientEvent::NewJob { session_id: 2, .. }
        ));

        h.shutdown.cancel();
        (&mut h.task).await.unwrap().unwrap();
        assert_eq!(h.attempts.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_reconnect_notification() {
        let mut h = spawn_client(test_config());
        let mut first = h.queue_transport();
        let mut second = h.queue_transport();

        handshake(&mut first).await;
        first.send(JsonRpcMessage::notification("client.reconnect", json!([])));

        wait_for(&mut h, |e| matches!(e, ClientEvent::Disconnected { .. })).await;
        handshake(&mut second).await;
        wait_for(&mut h, |e| matches!(e, ClientEvent::Authorized { session_id: 2 })).await;

        h.shutdown.cancel();
        (&mut h.task).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_pings_then_declares_dead() {
        let mut config = test_config();
        config.keepalive_interval = Duration::from_secs(30);
        let mut h = spawn_client(config);
        let mut pool = h.queue_transport();
        handshake(&mut pool).await;
        wait_for(&mut h, |e| matches!(e, ClientEvent::Authorized { .. })).await;

        let authorized = Instant::now();
        let ping = pool.recv().await;
        assert_eq!(ping.method(), Some("mining.ping"));
        assert!(ping.id().unwrap() >= FIRST_DYNAMIC_ID);
        assert_eq!((Instant::now() - authorized).as_secs(), 30);

        // A reply (even an error) counts as traffic and is absorbed
        pool.send(JsonRpcMessage::error_response(
            ping.id().unwrap(),
            json!([20, "Method not found", null]),
        ));

        // Then silence: two more pings, then the socket is declared dead
        assert_eq!(pool.recv().await.method(), Some("mining.ping"));
        assert_eq!(pool.recv().await.method(), Some("mining.ping"));
        match wait_for(&mut h, |e| matches!(e, ClientEvent::Disconnected { .. })).await {
            ClientEvent::Disconnected { reason, .. } => assert!(reason.contains("keep-alive")),
            _ => unreachable!(),
        }

        h.shutdown.cancel();
        (&mut h.task).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_answers_server_ping() {
        let mut h = spawn_client(test_config());
        let mut pool = h.queue_transport();
        handshake(&mut pool).await;
        wait_for(&mut h, |e| matches!(e, ClientEvent::Authorized { .. })).await;

        pool.send(JsonRpcMessage::request(55, "mining.ping", json!([])));
        assert_eq!(pool.recv().await, JsonRpcMessage::response(55, json!("pong")));

        h.shutdown.cancel();
        (&mut h.task).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_extranonce_updates_session() {
        let mut h = spawn_client(test_config());
        let mut pool = h.queue_transport();
        handshake(&mut pool).await;

        pool.send(JsonRpcMessage::notification(
            "mining.set_extranonce",
            json!(["abcd", 8]),
        ));

        match wait_for(&mut h, |e| matches!(e, ClientEvent::ExtranonceChanged { .. })).await {
            ClientEvent::ExtranonceChanged {
                session_id,
                extranonce1,
                extranonce2_size,
            } => {
                assert_eq!(session_id, 1);
                assert_eq!(extranonce1, vec![0xab, 0xcd]);
                assert_eq!(extranonce2_size, 8);
            }
            _ => unreachable!(),
        }

        h.shutdown.cancel();
        (&mut h.task).await.unwrap().unwrap();
    }
}
