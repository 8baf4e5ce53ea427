//! SignalR hub client over WebSocket

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use testrunner_common::TestRunStatus;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

use super::protocol::{self, HubMessage, RecordBuffer};
use super::{methods, reconnect_delay, NotifyError, RunNotifier};
use crate::config::HubConfig;

/// Produces the access token for each (re)connect
pub type TokenFactory = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Token factory reading `var` from the environment at connect time
pub fn env_token_factory(var: impl Into<String>) -> TokenFactory {
    let var = var.into();
    Arc::new(move || std::env::var(&var).ok().filter(|t| !t.is_empty()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NegotiateResponse {
    connection_token: Option<String>,
    connection_id: Option<String>,
    /// Redirect to another service (Azure SignalR)
    url: Option<String>,
    access_token: Option<String>,
    error: Option<String>,
}

type PendingMap = Mutex<HashMap<String, oneshot::Sender<Result<Value, NotifyError>>>>;

/// Resilient client for the test-run hub.
///
/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct HubClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: HubConfig,
    http: reqwest::Client,
    token_factory: TokenFactory,
    state: RwLock<ConnectionState>,
    /// Frames queued for the writer task of the live connection
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: PendingMap,
    next_invocation_id: AtomicU64,
    /// Bumped per connection so stale reader tasks cannot trigger reconnects
    generation: AtomicU64,
    groups: Mutex<BTreeSet<String>>,
    /// Serializes connection attempts
    connect_lock: tokio::sync::Mutex<()>,
    retry_scheduled: AtomicBool,
    stopped: AtomicBool,
}

impl HubClient {
    pub fn new(config: HubConfig, token_factory: TokenFactory) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                http: reqwest::Client::new(),
                token_factory,
                state: RwLock::new(ConnectionState::Disconnected),
                outbound: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                next_invocation_id: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                groups: Mutex::new(BTreeSet::new()),
                connect_lock: tokio::sync::Mutex::new(()),
                retry_scheduled: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Client whose token comes from `config.access_token_env`
    pub fn from_config(config: HubConfig) -> Self {
        let factory = env_token_factory(config.access_token_env.clone());
        Self::new(config, factory)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Run ids whose groups are re-joined after a reconnect
    pub fn joined_runs(&self) -> Vec<String> {
        self.inner.groups.lock().iter().cloned().collect()
    }

    /// Connect to the hub.
    ///
    /// A failed attempt is logged and retried once after the configured
    /// initial delay; it never fails the caller.
    pub async fn connect(&self) -> Result<(), NotifyError> {
        self.inner.stopped.store(false, Ordering::SeqCst);
        if let Err(e) = Inner::establish(&self.inner).await {
            warn!(error = %e, "Realtime hub connection failed, will retry");
            self.schedule_initial_retry();
        }
        Ok(())
    }

    fn schedule_initial_retry(&self) {
        if self.inner.retry_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.config.initial_retry_delay()).await;
            inner.retry_scheduled.store(false, Ordering::SeqCst);
            if inner.stopped.load(Ordering::SeqCst) {
                return;
            }
            match Inner::establish(&inner).await {
                Ok(()) => info!("Realtime hub connected on retry"),
                Err(e) => warn!(error = %e, "Realtime hub retry failed"),
            }
        });
    }

    /// Close the connection and stop reconnecting
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.outbound.lock().take();
        self.inner.fail_pending();
        self.inner.set_state(ConnectionState::Disconnected);
        info!("Realtime hub client stopped");
    }

    async fn ensure_connected(&self) -> Result<(), NotifyError> {
        if self.is_connected() {
            return Ok(());
        }
        self.inner.stopped.store(false, Ordering::SeqCst);
        Inner::establish(&self.inner).await
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.write();
        if *current != state {
            debug!(from = %*current, to = %state, "Hub connection state changed");
            *current = state;
        }
    }

    fn fail_pending(&self) {
        let pending: Vec<_> = self.pending.lock().drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(NotifyError::Closed));
        }
    }

    /// Negotiate, open the socket, handshake and start the I/O tasks
    async fn establish(inner: &Arc<Inner>) -> Result<(), NotifyError> {
        let _guard = inner.connect_lock.lock().await;
        if *inner.state.read() == ConnectionState::Connected {
            return Ok(());
        }
        let reconnecting = *inner.state.read() == ConnectionState::Reconnecting;
        if !reconnecting {
            inner.set_state(ConnectionState::Connecting);
        }

        match Self::open(inner).await {
            Ok(()) => {
                inner.set_state(ConnectionState::Connected);
                info!(url = %inner.config.hub_url(), "Connected to realtime hub");
                Self::rejoin_groups(inner).await;
                Ok(())
            }
            Err(e) => {
                if !reconnecting {
                    inner.set_state(ConnectionState::Disconnected);
                }
                Err(e)
            }
        }
    }

    async fn open(inner: &Arc<Inner>) -> Result<(), NotifyError> {
        let mut hub_url = inner.config.hub_url();
        let mut token = (inner.token_factory)();

        let mut negotiated = inner.negotiate(&hub_url, token.as_deref()).await?;
        if let Some(redirect) = negotiated.url.take() {
            debug!(url = %redirect, "Hub negotiation redirected");
            hub_url = redirect;
            token = negotiated.access_token.take().or(token);
            negotiated = inner.negotiate(&hub_url, token.as_deref()).await?;
        }

        let connection_token = negotiated
            .connection_token
            .or(negotiated.connection_id)
            .ok_or_else(|| NotifyError::Negotiate("missing connection token".to_string()))?;

        let ws_url = websocket_url(&hub_url, &connection_token, token.as_deref())?;
        let (socket, _) = tokio_tungstenite::connect_async(ws_url.as_str())
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        let (mut sink, mut stream) = socket.split();

        sink.send(Message::Text(protocol::handshake_request()))
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        let mut buffer = RecordBuffer::default();
        let leftover = tokio::time::timeout(inner.config.invocation_timeout(), async {
            while let Some(msg) = stream.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => return Err(NotifyError::Transport(e.to_string())),
                };
                let mut records = buffer.push(&text);
                if records.is_empty() {
                    continue;
                }
                let handshake = records.remove(0);
                return match protocol::parse_handshake_response(&handshake) {
                    Ok(()) => Ok(records),
                    Err(e) => Err(NotifyError::Handshake(e)),
                };
            }
            Err::<Vec<String>, NotifyError>(NotifyError::Closed)
        })
        .await
        .map_err(|_| NotifyError::Handshake("timed out".to_string()))??;

        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *inner.outbound.lock() = Some(tx);

        let keep_alive = inner.config.keep_alive_interval();
        tokio::spawn(async move {
            let mut rx = rx;
            let mut ticker = tokio::time::interval(keep_alive);
            ticker.tick().await;
            loop {
                let frame = tokio::select! {
                    frame = rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                    _ = ticker.tick() => HubMessage::Ping.encode(),
                };
                if let Err(e) = sink.send(Message::Text(frame)).await {
                    debug!(error = %e, "Hub writer stopped");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = inner.clone();
        tokio::spawn(async move {
            let mut closing = false;
            for record in leftover {
                closing |= reader.dispatch(&record);
            }
            while !closing {
                let Some(msg) = stream.next().await else { break };
                match msg {
                    Ok(Message::Text(text)) => {
                        for record in buffer.push(&text) {
                            closing |= reader.dispatch(&record);
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(frame = ?frame, "Hub closed the socket");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Hub socket error");
                        break;
                    }
                }
            }
            Inner::handle_disconnect(&reader, generation);
        });

        Ok(())
    }

    async fn negotiate(&self, hub_url: &str, token: Option<&str>) -> Result<NegotiateResponse, NotifyError> {
        let url = format!("{}/negotiate?negotiateVersion=1", hub_url.trim_end_matches('/'));
        let mut request = self.http.post(&url).timeout(self.config.invocation_timeout());
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| NotifyError::Negotiate(e.to_string()))?;
        if !response.status().is_success() {
            return Err(NotifyError::Negotiate(format!("{} returned {}", url, response.status())));
        }

        let negotiated: NegotiateResponse = response
            .json()
            .await
            .map_err(|e| NotifyError::Negotiate(e.to_string()))?;
        if let Some(error) = negotiated.error {
            return Err(NotifyError::Negotiate(error));
        }
        Ok(negotiated)
    }

    /// Handle one inbound record; returns true when the server closed the connection
    fn dispatch(&self, record: &str) -> bool {
        let message = match HubMessage::parse(record) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed hub record");
                return false;
            }
        };

        match message {
            HubMessage::Completion {
                invocation_id,
                result,
                error,
            } => {
                let Some(tx) = self.pending.lock().remove(&invocation_id) else {
                    trace!(invocation_id = %invocation_id, "Completion for unknown invocation");
                    return false;
                };
                let outcome = match error {
                    Some(message) => Err(NotifyError::Invocation {
                        method: invocation_id,
                        message,
                    }),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                let _ = tx.send(outcome);
                false
            }
            HubMessage::Invocation { target, .. } => {
                trace!(target = %target, "Hub invoked client method");
                false
            }
            HubMessage::Ping => false,
            HubMessage::Close { error, allow_reconnect } => {
                info!(error = ?error, allow_reconnect, "Hub requested close");
                if !allow_reconnect {
                    self.stopped.store(true, Ordering::SeqCst);
                }
                true
            }
            HubMessage::StreamItem { .. } | HubMessage::Other(_) => false,
        }
    }

    fn handle_disconnect(inner: &Arc<Inner>, generation: u64) {
        if inner.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        inner.outbound.lock().take();
        inner.fail_pending();

        if inner.stopped.load(Ordering::SeqCst) {
            inner.set_state(ConnectionState::Disconnected);
            return;
        }

        warn!("Realtime hub connection lost, reconnecting");
        inner.set_state(ConnectionState::Reconnecting);

        let inner = inner.clone();
        tokio::spawn(async move {
            let base = Duration::from_millis(inner.config.reconnect_base_delay_ms);
            let max = Duration::from_millis(inner.config.reconnect_max_delay_ms);
            let mut attempt: u32 = 0;

            loop {
                let delay = reconnect_delay(attempt, base, max);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling hub reconnect");
                tokio::time::sleep(delay).await;

                if inner.stopped.load(Ordering::SeqCst) {
                    return;
                }
                match Inner::establish(&inner).await {
                    Ok(()) => {
                        info!(attempt, "Realtime hub reconnected");
                        return;
                    }
                    Err(e) => {
                        attempt = attempt.saturating_add(1);
                        warn!(attempt, error = %e, "Hub reconnect attempt failed");
                        if inner
                            .config
                            .max_reconnect_attempts
                            .is_some_and(|max_attempts| attempt >= max_attempts)
                        {
                            warn!(attempt, "Giving up on realtime hub");
                            inner.set_state(ConnectionState::Disconnected);
                            return;
                        }
                    }
                }
            }
        });
    }

    async fn rejoin_groups(inner: &Arc<Inner>) {
        let groups: Vec<String> = inner.groups.lock().iter().cloned().collect();
        for run_id in groups {
            match inner.invoke(methods::JOIN_TEST_RUN, vec![Value::String(run_id.clone())]).await {
                Ok(_) => debug!(run_id = %run_id, "Re-joined run group"),
                Err(e) => warn!(run_id = %run_id, error = %e, "Failed to re-join run group"),
            }
        }
    }

    /// Invoke a hub method and wait for its completion
    async fn invoke(&self, method: &str, arguments: Vec<Value>) -> Result<Value, NotifyError> {
        let sender = self.outbound.lock().clone().ok_or(NotifyError::NotConnected)?;

        let id = (self.next_invocation_id.fetch_add(1, Ordering::SeqCst) + 1).to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);

        let frame = HubMessage::invocation(id.clone(), method, arguments).encode();
        if sender.send(frame).is_err() {
            self.pending.lock().remove(&id);
            return Err(NotifyError::Closed);
        }

        match tokio::time::timeout(self.config.invocation_timeout(), rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(NotifyError::Invocation { message, .. }))) => Err(NotifyError::Invocation {
                method: method.to_string(),
                message,
            }),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(NotifyError::Closed),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(NotifyError::Timeout(method.to_string()))
            }
        }
    }
}

/// `http(s)://host/hub` -> `ws(s)://host/hub?id=<token>&access_token=<token>`
fn websocket_url(hub_url: &str, connection_token: &str, access_token: Option<&str>) -> Result<reqwest::Url, NotifyError> {
    let ws_base = if let Some(rest) = hub_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = hub_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        hub_url.to_string()
    };

    let mut params = vec![("id", connection_token)];
    if let Some(token) = access_token {
        params.push(("access_token", token));
    }
    reqwest::Url::parse_with_params(&ws_base, &params)
        .map_err(|e| NotifyError::Transport(format!("invalid hub url {}: {}", ws_base, e)))
}

#[async_trait]
impl RunNotifier for HubClient {
    async fn join_run(&self, run_id: &str) -> Result<(), NotifyError> {
        let newly_added = self.inner.groups.lock().insert(run_id.to_string());
        if !newly_added && self.is_connected() {
            return Ok(());
        }

        self.ensure_connected().await?;
        self.inner
            .invoke(methods::JOIN_TEST_RUN, vec![Value::String(run_id.to_string())])
            .await?;
        debug!(run_id = %run_id, "Joined run group");
        Ok(())
    }

    async fn send_update(&self, run_id: &str, message: Value) -> Result<(), NotifyError> {
        self.ensure_connected().await?;
        self.inner
            .invoke(methods::SEND_TEST_UPDATE, vec![Value::String(run_id.to_string()), message])
            .await
            .map(|_| ())
    }

    async fn send_completed(&self, run_id: &str, result: &TestRunStatus) -> Result<(), NotifyError> {
        let result = serde_json::to_value(result).map_err(|e| NotifyError::Transport(e.to_string()))?;
        self.ensure_connected().await?;
        self.inner
            .invoke(methods::SEND_TEST_RUN_COMPLETED, vec![Value::String(run_id.to_string()), result])
            .await
            .map(|_| ())
    }

    async fn send_progress(&self, run_id: &str, update: Value) -> Result<(), NotifyError> {
        self.ensure_connected().await?;
        self.inner
            .invoke(methods::SEND_TEST_RUN_UPDATED, vec![Value::String(run_id.to_string()), update])
            .await
            .map(|_| ())
    }

    /// The hub has no leave method; the group is only dropped from the rejoin set
    async fn leave_run(&self, run_id: &str) -> Result<(), NotifyError> {
        if self.inner.groups.lock().remove(run_id) {
            debug!(run_id = %run_id, "Left run group");
        }
        Ok(())
    }
}
