//! Request/response correlation and notification routing on top of a
//! [`Connection`].
//!
//! A [`Session`] outlives individual connections. Each successful
//! [`Session::connect`] starts a new connection *generation* with its own
//! request id sequence; everything still arriving from an older generation
//! is dropped.

use crate::commands::{DELETE_CLIENT, GET_RPC_VERSION, GET_STATUS, GROUP_SET_CLIENTS};
use crate::config::SessionConfig;
use crate::connection::{Connection, TransportEvent};
use crate::error::{ControlError, Result};
use crate::mirror::{ClientEventKind, StateMirror};
use crate::protocol::{
    self, Message, Notification, Request, RequestId, Response, RpcError, METHOD_NOT_FOUND,
};
use crate::subscription::{
    DisconnectReason, EventBus, LifecycleEvent, LifecycleReceiver, StateEvent, StateReceiver,
    SubscriptionId,
};
use crate::types::{
    Client, ClientId, Endpoint, Group, ProtocolVersion, RpcVersion, ServerStatus, Stream, Volume,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, MutexGuard, PoisonError, Weak};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;

/// Where the session is in its connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionPhase {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// A call waiting for its response
struct PendingRequest {
    method: String,
    tx: oneshot::Sender<Result<Value>>,
}

enum Link {
    Idle,
    Connecting(Endpoint),
    Up {
        endpoint: Endpoint,
        connection: Connection,
    },
}

/// What is left to do after a connection was detached under the lock
struct Teardown {
    endpoint: Endpoint,
    pending: Vec<PendingRequest>,
}

struct SessionState {
    link: Link,
    /// Bumped on every connect attempt
    generation: u64,
    next_id: RequestId,
    pending: HashMap<RequestId, PendingRequest>,
}

impl SessionState {
    fn phase(&self) -> SessionPhase {
        match self.link {
            Link::Idle => SessionPhase::Disconnected,
            Link::Connecting(_) => SessionPhase::Connecting,
            Link::Up { .. } => SessionPhase::Connected,
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && matches!(self.link, Link::Up { .. })
    }

    /// Drop the current connection (if any) and take the calls it owed
    fn detach(&mut self) -> Option<Teardown> {
        let endpoint = match std::mem::replace(&mut self.link, Link::Idle) {
            Link::Idle => return None,
            Link::Connecting(endpoint) => endpoint,
            Link::Up {
                endpoint,
                connection,
            } => {
                connection.disconnect();
                endpoint
            }
        };
        Some(Teardown {
            endpoint,
            pending: self.pending.drain().map(|(_, pending)| pending).collect(),
        })
    }
}

struct Inner {
    config: SessionConfig,
    state: Mutex<SessionState>,
    mirror: std::sync::Mutex<StateMirror>,
    lifecycle_bus: EventBus<LifecycleEvent>,
    state_bus: EventBus<StateEvent>,
}

/// Client session for a control server
///
/// Cheap to clone; clones share the connection, the mirror and all
/// subscriptions.
///
/// # Example
///
/// ```no_run
/// use snapcast_control::{Endpoint, Session, SessionConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let session = Session::new(SessionConfig::default());
///     session.connect(Endpoint::new("192.168.1.10", 1705)).await?;
///
///     let status = session.get_status().await?;
///     for client in status.clients() {
///         println!("{}: {}%", client.visible_name(), client.volume().percent);
///     }
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        let capacity = config.event_capacity;
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(SessionState {
                    link: Link::Idle,
                    generation: 0,
                    next_id: 1,
                    pending: HashMap::new(),
                }),
                mirror: std::sync::Mutex::new(StateMirror::new()),
                lifecycle_bus: EventBus::new(capacity),
                state_bus: EventBus::new(capacity),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Connect to a control server
    ///
    /// Already being connected to `endpoint` is a no-op; a connection to a
    /// different endpoint is closed first. A failed attempt is reported
    /// both as the returned error and as one `Disconnected` lifecycle event.
    pub async fn connect(&self, endpoint: Endpoint) -> Result<()> {
        let (generation, previous) = {
            let mut state = self.inner.state.lock().await;
            match &state.link {
                Link::Up { endpoint: current, .. } if *current == endpoint => return Ok(()),
                Link::Connecting(_) => {
                    return Err(ControlError::Connect {
                        endpoint,
                        reason: "another connection attempt is in progress".to_string(),
                    })
                }
                _ => {}
            }

            let previous = state.detach();
            state.generation += 1;
            state.link = Link::Connecting(endpoint.clone());
            (state.generation, previous)
        };

        if let Some(previous) = previous {
            self.inner.finish_teardown(previous, DisconnectReason::Requested);
        }
        self.inner
            .lifecycle_bus
            .publish(LifecycleEvent::Connecting(endpoint.clone()));

        let result = Connection::connect(&endpoint, &self.inner.config).await;

        let mut state = self.inner.state.lock().await;
        if state.generation != generation || !matches!(state.link, Link::Connecting(_)) {
            // disconnect() ran meanwhile and already reported it
            if let Ok((connection, _)) = result {
                connection.disconnect();
            }
            return Err(ControlError::Connect {
                endpoint,
                reason: "connection attempt cancelled".to_string(),
            });
        }

        match result {
            Ok((connection, events)) => {
                state.link = Link::Up {
                    endpoint: endpoint.clone(),
                    connection,
                };
                state.next_id = 1;

                // published under the lock so that it precedes anything the
                // pump reports for this connection
                tracing::info!("Connected to {}", endpoint);
                self.inner
                    .lifecycle_bus
                    .publish(LifecycleEvent::Connected(endpoint));
                drop(state);

                tokio::spawn(pump(Arc::downgrade(&self.inner), events, generation));

                if self.inner.config.refresh_on_connect {
                    let session = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = session.get_status().await {
                            tracing::warn!("Initial status refresh failed: {}", e);
                        }
                    });
                }
                Ok(())
            }
            Err(e) => {
                state.link = Link::Idle;
                drop(state);

                tracing::warn!("{}", e);
                self.inner.lifecycle_bus.publish(LifecycleEvent::Disconnected {
                    endpoint,
                    reason: DisconnectReason::ConnectFailed(e.to_string()),
                });
                Err(e)
            }
        }
    }

    /// Close the connection
    ///
    /// Every pending call fails with [`ControlError::ConnectionLost`] right
    /// away. Does nothing when already disconnected.
    pub async fn disconnect(&self) {
        let teardown = self.inner.state.lock().await.detach();
        if let Some(teardown) = teardown {
            self.inner
                .finish_teardown(teardown, DisconnectReason::Requested);
        }
    }

    pub async fn phase(&self) -> SessionPhase {
        self.inner.state.lock().await.phase()
    }

    /// Endpoint of the current (or in-progress) connection
    pub async fn endpoint(&self) -> Option<Endpoint> {
        match &self.inner.state.lock().await.link {
            Link::Idle => None,
            Link::Connecting(endpoint) | Link::Up { endpoint, .. } => Some(endpoint.clone()),
        }
    }

    /// Send a request and wait for its response
    ///
    /// Resolves exactly once: with the result, with the server's error
    /// object as [`ControlError::Server`], with
    /// [`ControlError::ConnectionLost`] if the connection goes away first,
    /// or with [`ControlError::Timeout`] if a request timeout is configured.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let (id, generation, rx) = {
            let mut state = self.inner.state.lock().await;
            let id = state.next_id;
            let Link::Up { connection, .. } = &state.link else {
                return Err(ControlError::NotConnected);
            };
            connection.send(protocol::encode_request(method, id, params)?)?;

            // the pump needs this lock to resolve the call, so it cannot
            // see the response before the entry exists
            state.next_id += 1;
            let (tx, rx) = oneshot::channel();
            state.pending.insert(
                id,
                PendingRequest {
                    method: method.to_string(),
                    tx,
                },
            );
            (id, state.generation, rx)
        };

        let outcome = match self.inner.config.request_timeout {
            Some(limit) => match timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let mut state = self.inner.state.lock().await;
                    if state.generation == generation {
                        state.pending.remove(&id);
                    }
                    tracing::warn!("{} request {} timed out", method, id);
                    return Err(ControlError::Timeout);
                }
            },
            None => rx.await,
        };

        outcome.unwrap_or(Err(ControlError::ConnectionLost))
    }

    /// Send a notification; no response is expected
    pub async fn notify_server(&self, method: &str, params: Option<Value>) -> Result<()> {
        let state = self.inner.state.lock().await;
        let Link::Up { connection, .. } = &state.link else {
            return Err(ControlError::NotConnected);
        };
        connection.send(protocol::encode_notification(method, params)?)
    }

    /// Run `handler` with the params of every server notification named
    /// `method`
    ///
    /// Handlers run on their own task, after the mirror has been updated.
    /// A handler shares the state event buffer (`event_capacity`); if it
    /// falls that far behind, the oldest undelivered notifications are
    /// dropped with a warning and it carries on with the newer ones. Must
    /// be called from within a tokio runtime.
    pub fn on_notification<F>(&self, method: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(Option<Value>) + Send + Sync + 'static,
    {
        let method = method.into();
        self.inner.state_bus.subscribe_fn(move |event| {
            if let StateEvent::Notification {
                method: received,
                params,
            } = event
            {
                if received == method {
                    handler(params);
                }
            }
        })
    }

    /// Subscribe to connection lifecycle events
    pub fn subscribe_lifecycle(&self) -> LifecycleReceiver {
        self.inner.lifecycle_bus.subscribe()
    }

    /// Subscribe to state changes
    pub fn subscribe_state(&self) -> StateReceiver {
        self.inner.state_bus.subscribe()
    }

    /// Callback flavor of [`Session::subscribe_lifecycle`]
    pub fn on_lifecycle<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(LifecycleEvent) + Send + Sync + 'static,
    {
        self.inner.lifecycle_bus.subscribe_fn(handler)
    }

    /// Callback flavor of [`Session::subscribe_state`]
    pub fn on_state_change<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(StateEvent) + Send + Sync + 'static,
    {
        self.inner.state_bus.subscribe_fn(handler)
    }

    /// Remove any callback registered on this session
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.lifecycle_bus.unsubscribe(id) || self.inner.state_bus.unsubscribe(id)
    }

    /// Copy of the mirrored server state
    pub fn snapshot(&self) -> ServerStatus {
        self.inner.mirror().snapshot()
    }

    /// Remove a client from the mirror for good
    ///
    /// Deleted clients stay in the mirror (flagged) until purged. Returns
    /// false if the client was unknown.
    pub fn purge_client(&self, id: &str) -> bool {
        let purged = self.inner.mirror().purge_client(id);
        if purged {
            self.inner
                .state_bus
                .publish(StateEvent::ClientPurged(ClientId::from(id)));
        }
        purged
    }
}

impl Session {
    /// Schema generation of the connected server, as far as it is known
    pub(crate) fn protocol(&self) -> ProtocolVersion {
        self.inner.mirror().protocol()
    }

    /// Run `read` against the mirrored state without copying it
    pub(crate) fn with_status<R>(&self, read: impl FnOnce(&ServerStatus) -> R) -> R {
        read(self.inner.mirror().status())
    }

    pub(crate) fn update_client<F>(&self, id: &str, update: F)
    where
        F: FnOnce(&mut Client),
    {
        self.inner.update_client(id, update);
    }

    pub(crate) fn update_group<F>(&self, id: &str, update: F)
    where
        F: FnOnce(&mut Group),
    {
        self.inner.update_group(id, update);
    }

    /// Flag a known client as deleted, as `Client.OnDelete` would
    pub(crate) fn mark_client_deleted(&self, id: &str) {
        let client = self.with_status(|status| status.client(id).cloned());
        if let Some(client) = client {
            self.inner
                .apply_client_event(client, ClientEventKind::Deleted);
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl Inner {
    fn mirror(&self) -> MutexGuard<'_, StateMirror> {
        self.mirror.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish_teardown(&self, teardown: Teardown, reason: DisconnectReason) {
        let Teardown { endpoint, pending } = teardown;
        if !pending.is_empty() {
            tracing::info!("Failing {} pending requests", pending.len());
        }
        for request in pending {
            tracing::debug!("{} request dropped by disconnect", request.method);
            let _ = request.tx.send(Err(ControlError::ConnectionLost));
        }

        self.mirror().mark_stale();
        tracing::info!("Disconnected from {}: {}", endpoint, reason);
        self.lifecycle_bus
            .publish(LifecycleEvent::Disconnected { endpoint, reason });
    }

    async fn handle_line(&self, generation: u64, line: &[u8]) {
        let message = match protocol::decode_bytes(line) {
            Ok(message) => message,
            Err(e) => {
                let e = ControlError::from(e);
                tracing::warn!(
                    "Skipping malformed line ({}): {}",
                    e,
                    String::from_utf8_lossy(line)
                );
                return;
            }
        };

        match message {
            Message::Response(response) => self.handle_response(generation, response).await,
            Message::Notification(notification) => {
                if self.state.lock().await.is_current(generation) {
                    self.handle_notification(notification);
                }
            }
            Message::Request(request) => self.reject_request(generation, request).await,
        }
    }

    async fn handle_response(&self, generation: u64, response: Response) {
        let Some(id) = response.id else {
            tracing::warn!("Discarding response without id: {:?}", response.outcome);
            return;
        };

        let pending = {
            let mut state = self.state.lock().await;
            if state.generation != generation {
                tracing::debug!("Discarding response {} from a previous connection", id);
                return;
            }
            state.pending.remove(&id)
        };
        let Some(pending) = pending else {
            let e = ControlError::Protocol(format!("response with unknown id {}", id));
            tracing::warn!("Discarding response: {}", e);
            return;
        };

        let outcome = match response.outcome {
            Ok(result) => {
                self.apply_result(&pending.method, &result);
                Ok(result)
            }
            Err(RpcError {
                code,
                message,
                data,
            }) => Err(ControlError::Server {
                code,
                message,
                data,
            }),
        };
        let _ = pending.tx.send(outcome);
    }

    /// Feed results that describe server state into the mirror before the
    /// caller sees them
    fn apply_result(&self, method: &str, result: &Value) {
        match method {
            GET_STATUS => match ServerStatus::from_result(result.clone()) {
                Ok(status) => self.replace_status(status),
                Err(e) => tracing::warn!("Not mirroring unparseable status: {}", e),
            },
            // grouped servers answer these with the whole new status
            GROUP_SET_CLIENTS | DELETE_CLIENT if result.get("server").is_some() => {
                match ServerStatus::from_result(result.clone()) {
                    Ok(status) => self.replace_status(status),
                    Err(e) => tracing::warn!("Not mirroring unparseable {} result: {}", method, e),
                }
            }
            GET_RPC_VERSION => match RpcVersion::deserialize(result) {
                Ok(version) => self.mirror().set_protocol(version.into()),
                Err(e) => tracing::warn!("Unparseable RPC version: {}", e),
            },
            _ => {}
        }
    }

    fn replace_status(&self, status: ServerStatus) {
        let snapshot = {
            let mut mirror = self.mirror();
            if !mirror.apply_full_status(status) {
                return;
            }
            mirror.snapshot()
        };
        self.state_bus
            .publish(StateEvent::StatusReplaced(Arc::new(snapshot)));
    }

    fn apply_client_event(&self, client: Client, kind: ClientEventKind) {
        let changed = self.mirror().apply_client_event(client, kind);
        if let Some(client) = changed {
            self.state_bus.publish(StateEvent::ClientChanged {
                client: Box::new(client),
                kind,
            });
        }
    }

    fn update_client<F>(&self, id: &str, update: F)
    where
        F: FnOnce(&mut Client),
    {
        let changed = self.mirror().update_client(id, update);
        if let Some(client) = changed {
            self.state_bus.publish(StateEvent::ClientChanged {
                client: Box::new(client),
                kind: ClientEventKind::Updated,
            });
        }
    }

    fn update_group<F>(&self, id: &str, update: F)
    where
        F: FnOnce(&mut Group),
    {
        let changed = self.mirror().update_group(id, update);
        if let Some(group) = changed {
            self.state_bus
                .publish(StateEvent::GroupChanged(Box::new(group)));
        }
    }

    fn handle_notification(&self, notification: Notification) {
        let Notification { method, params } = notification;
        match &params {
            Some(params) => self.apply_notification(&method, params),
            None => tracing::debug!("{} without params", method),
        }
        self.state_bus
            .publish(StateEvent::Notification { method, params });
    }

    fn apply_notification(&self, method: &str, params: &Value) {
        if let Some(kind) = ClientEventKind::from_method(method) {
            let client = payload(params, &["data", "client"]).map(Client::deserialize);
            match client {
                Some(Ok(client)) => self.apply_client_event(client, kind),
                Some(Err(e)) => tracing::warn!("Ignoring {} with invalid client: {}", method, e),
                None => tracing::warn!("Ignoring {} without client data", method),
            }
            return;
        }

        match method {
            "Stream.OnUpdate" => match payload(params, &["data", "stream"]).map(Stream::deserialize) {
                Some(Ok(stream)) => {
                    if self.mirror().apply_stream_update(stream.clone()) {
                        self.state_bus
                            .publish(StateEvent::StreamChanged(Box::new(stream)));
                    }
                }
                Some(Err(e)) => tracing::warn!("Ignoring {} with invalid stream: {}", method, e),
                None => tracing::warn!("Ignoring {} without stream data", method),
            },
            "Server.OnUpdate" => {
                // {"server": {...}} is unwrapped by the parser itself
                let data = params.get("data").unwrap_or(params);
                match ServerStatus::from_result(data.clone()) {
                    Ok(status) => self.replace_status(status),
                    Err(e) => tracing::warn!("Ignoring {} with invalid status: {}", method, e),
                }
            }
            "Client.OnVolumeChanged" | "Client.OnLatencyChanged" | "Client.OnNameChanged" => {
                match FieldChange::deserialize(params) {
                    Ok(change) => {
                        let id = change.id.clone();
                        self.update_client(&id, |c| change.apply_to_client(c));
                    }
                    Err(e) => tracing::warn!("Ignoring invalid {}: {}", method, e),
                }
            }
            "Group.OnMute" | "Group.OnStreamChanged" | "Group.OnNameChanged" => {
                match FieldChange::deserialize(params) {
                    Ok(change) => {
                        let id = change.id.clone();
                        self.update_group(&id, |g| change.apply_to_group(g));
                    }
                    Err(e) => tracing::warn!("Ignoring invalid {}: {}", method, e),
                }
            }
            _ => tracing::debug!("No mirror handling for {}", method),
        }
    }

    /// Answer a request from the server; none are supported
    async fn reject_request(&self, generation: u64, request: Request) {
        tracing::warn!(
            "Rejecting server request {} (id {})",
            request.method,
            request.id
        );
        let error = RpcError {
            code: METHOD_NOT_FOUND,
            message: "Method not found".to_string(),
            data: None,
        };
        let line = match protocol::encode_error_response(request.id, &error) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("Failed to encode error response: {}", e);
                return;
            }
        };

        let state = self.state.lock().await;
        if !state.is_current(generation) {
            return;
        }
        if let Link::Up { connection, .. } = &state.link {
            if let Err(e) = connection.send(line) {
                tracing::warn!("Failed to answer server request: {}", e);
            }
        }
    }

    async fn handle_disconnect(&self, generation: u64, reason: DisconnectReason) {
        let teardown = {
            let mut state = self.state.lock().await;
            if !state.is_current(generation) {
                tracing::debug!("Ignoring close of a previous connection: {}", reason);
                return;
            }
            state.detach()
        };
        if let Some(teardown) = teardown {
            self.finish_teardown(teardown, reason);
        }
    }
}

/// Params of the single-field change notifications of grouped servers
#[derive(Deserialize)]
struct FieldChange {
    id: String,
    volume: Option<Volume>,
    latency: Option<i32>,
    name: Option<String>,
    mute: Option<bool>,
    stream_id: Option<String>,
}

impl FieldChange {
    fn apply_to_client(self, client: &mut Client) {
        if let Some(volume) = self.volume {
            client.config.volume = volume;
        }
        if let Some(latency) = self.latency {
            client.config.latency = latency;
        }
        if let Some(name) = self.name {
            client.config.name = name;
        }
    }

    fn apply_to_group(self, group: &mut Group) {
        if let Some(muted) = self.mute {
            group.muted = muted;
        }
        if let Some(stream_id) = self.stream_id {
            group.stream_id = stream_id;
        }
        if let Some(name) = self.name {
            group.name = name;
        }
    }
}

/// First of `keys` present in `params`
fn payload<'a>(params: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| params.get(*key))
}

/// Processes one connection's events in receipt order
async fn pump(
    inner: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    generation: u64,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            TransportEvent::Line(line) => inner.handle_line(generation, &line).await,
            TransportEvent::Disconnected(reason) => {
                inner.handle_disconnect(generation, reason).await;
                break;
            }
        }
    }
}
