//! Subscription connection manager
//!
//! One background task owns the WebSocket to the coordinator and speaks
//! `graphql-transport-ws`. Callers talk to it over a command channel and get
//! their events on a per-subscription channel.
//!
//! Connection lifecycle:
//!
//! ```text
//! Idle -> Connecting -> Connected -> Disconnected -> Connecting -> ...
//!                                  \-> Closed (after disconnect())
//! ```
//!
//! After an unexpected close or a failed handshake the task waits a fixed
//! delay, reconnects, and re-sends `subscribe` for every registered
//! subscription under its original id. There is no backoff growth.

use std::collections::BTreeMap;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::CoordinatorConfig;
use crate::error::{Error, Result};
use crate::protocol::{ClientMessage, ServerMessage, SUBPROTOCOL};
use crate::subscription::Topic;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Observable state of the shared connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    /// Handshake acknowledged; subscriptions are live
    Connected,
    /// Lost or failed; a reconnect is scheduled
    Disconnected,
    /// `disconnect()` was called; terminal
    Closed,
}

/// Client-chosen subscription id, stable across reconnects
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Event delivered to one subscriber
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// A `subscribe` frame went out on a fresh connection
    Subscribed,
    /// `data` of a `next` frame
    Data(Value),
    /// GraphQL errors from a `next` or `error` frame
    Errors(Vec<String>),
    /// The connection dropped; the subscription will be re-sent on reconnect
    Disconnected,
    /// The server completed the subscription, or the connection was closed for good
    Completed,
}

/// Connection settings
#[derive(Debug, Clone)]
pub struct WsOptions {
    pub url: String,
    pub api_key: Option<String>,
    pub handshake_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl From<&CoordinatorConfig> for WsOptions {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            url: config.ws_url.clone(),
            api_key: config.api_key.clone(),
            handshake_timeout: config.handshake_timeout(),
            reconnect_delay: config.reconnect_delay(),
        }
    }
}

impl WsOptions {
    fn init_payload(&self) -> Option<Value> {
        self.api_key
            .as_ref()
            .map(|key| json!({ "authorization": format!("Bearer {}", key) }))
    }
}

// ============================================
// Registry
// ============================================

struct Registration {
    topic: Topic,
    events: mpsc::UnboundedSender<SubscriptionEvent>,
}

/// Active subscriptions keyed by id; one registration per id.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: BTreeMap<SubscriptionId, Registration>,
}

impl SubscriptionRegistry {
    /// Register a subscription. Returns `false` if the id is already taken.
    pub fn insert(
        &mut self,
        id: SubscriptionId,
        topic: Topic,
        events: mpsc::UnboundedSender<SubscriptionEvent>,
    ) -> bool {
        if self.entries.contains_key(&id) {
            return false;
        }
        self.entries.insert(id, Registration { topic, events });
        true
    }

    pub fn remove(&mut self, id: &SubscriptionId) -> Option<Topic> {
        self.entries.remove(id).map(|r| r.topic)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn topics(&self) -> impl Iterator<Item = (&SubscriptionId, &Topic)> {
        self.entries.iter().map(|(id, r)| (id, &r.topic))
    }

    /// `subscribe` frames for every registration
    pub fn subscribe_frames(&self) -> Vec<(SubscriptionId, ClientMessage)> {
        self.entries
            .iter()
            .map(|(id, r)| (id.clone(), subscribe_frame(id, &r.topic)))
            .collect()
    }

    /// Send an event to one subscriber. A dropped receiver unregisters it.
    fn notify(&mut self, id: &SubscriptionId, event: SubscriptionEvent) -> bool {
        let Some(registration) = self.entries.get(id) else {
            return false;
        };
        if registration.events.send(event).is_err() {
            tracing::debug!(subscription = %id, "Subscriber went away");
            self.entries.remove(id);
            return false;
        }
        true
    }

    fn notify_all(&mut self, event: SubscriptionEvent) {
        let ids: Vec<SubscriptionId> = self.entries.keys().cloned().collect();
        for id in ids {
            self.notify(&id, event.clone());
        }
    }

    /// Route a server frame to its subscriber.
    ///
    /// Returns the id if its subscriber is gone and the server should be told.
    pub fn dispatch(&mut self, frame: ServerMessage) -> Option<SubscriptionId> {
        let id = SubscriptionId(frame.subscription_id()?.to_string());
        if !self.entries.contains_key(&id) {
            tracing::debug!(subscription = %id, "Frame for unknown subscription");
            return None;
        }

        let alive = match frame {
            ServerMessage::Next { payload, .. } => {
                let mut alive = true;
                if let Some(messages) = payload.error_messages() {
                    alive = self.notify(&id, SubscriptionEvent::Errors(messages));
                }
                match payload.data {
                    Some(data) if alive && !data.is_null() => {
                        self.notify(&id, SubscriptionEvent::Data(data))
                    }
                    _ => alive,
                }
            }
            ServerMessage::Error { payload, .. } => {
                let messages: Vec<String> = payload.into_iter().map(|e| e.message).collect();
                tracing::warn!(subscription = %id, ?messages, "Subscription rejected");
                self.notify(&id, SubscriptionEvent::Errors(messages));
                self.entries.remove(&id);
                return None;
            }
            ServerMessage::Complete { .. } => {
                self.notify(&id, SubscriptionEvent::Completed);
                self.entries.remove(&id);
                return None;
            }
            _ => true,
        };

        if alive {
            None
        } else {
            Some(id)
        }
    }
}

fn subscribe_frame(id: &SubscriptionId, topic: &Topic) -> ClientMessage {
    ClientMessage::Subscribe {
        id: id.to_string(),
        payload: topic.subscribe_payload(),
    }
}

// ============================================
// Manager
// ============================================

enum Command {
    Subscribe {
        id: SubscriptionId,
        topic: Topic,
        events: mpsc::UnboundedSender<SubscriptionEvent>,
    },
    Unsubscribe {
        id: SubscriptionId,
    },
    Disconnect {
        done: oneshot::Sender<()>,
    },
}

/// Handle to the background connection task.
pub struct ConnectionManager {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    handle: JoinHandle<()>,
}

impl ConnectionManager {
    /// Spawn the connection task. Connecting happens in the background.
    pub fn connect(options: WsOptions) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let handle = tokio::spawn(connection_loop(options, cmd_rx, state_tx));
        Self {
            cmd_tx,
            state_rx,
            handle,
        }
    }

    /// Register a subscription; it is (re)sent whenever the connection is up.
    pub async fn subscribe(
        &self,
        topic: Topic,
    ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<SubscriptionEvent>)> {
        let id = SubscriptionId::new();
        let (events, rx) = mpsc::unbounded_channel();
        tracing::debug!(subscription = %id, topic = %topic, "Subscribing");
        self.send(Command::Subscribe {
            id: id.clone(),
            topic,
            events,
        })
        .await?;
        Ok((id, rx))
    }

    /// Stop a subscription and tell the server.
    pub async fn unsubscribe(&self, id: &SubscriptionId) -> Result<()> {
        self.send(Command::Unsubscribe { id: id.clone() }).await
    }

    /// Close the socket and end the task.
    pub async fn disconnect(self) -> Result<()> {
        let (done, done_rx) = oneshot::channel();
        if self.send(Command::Disconnect { done }).await.is_ok() {
            let _ = done_rx.await;
        }
        let _ = self.handle.await;
        Ok(())
    }

    /// Watch connection state changes
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| Error::Transport("connection task has stopped".to_string()))
    }
}

/// Outcome of handling a command while no socket is usable
enum Offline {
    Continue,
    Shutdown(Option<oneshot::Sender<()>>),
}

fn handle_offline(command: Option<Command>, registry: &mut SubscriptionRegistry) -> Offline {
    match command {
        None => Offline::Shutdown(None),
        Some(Command::Subscribe { id, topic, events }) => {
            registry.insert(id, topic, events);
            Offline::Continue
        }
        Some(Command::Unsubscribe { id }) => {
            registry.remove(&id);
            Offline::Continue
        }
        Some(Command::Disconnect { done }) => Offline::Shutdown(Some(done)),
    }
}

fn shutdown(
    registry: &mut SubscriptionRegistry,
    state_tx: &watch::Sender<ConnectionState>,
    done: Option<oneshot::Sender<()>>,
) {
    registry.notify_all(SubscriptionEvent::Completed);
    registry.entries.clear();
    state_tx.send_replace(ConnectionState::Closed);
    tracing::info!("Subscription connection closed");
    if let Some(done) = done {
        let _ = done.send(());
    }
}

async fn connection_loop(
    options: WsOptions,
    mut cmd_rx: mpsc::Receiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
) {
    let mut registry = SubscriptionRegistry::default();
    let mut attempt: u64 = 0;

    loop {
        attempt += 1;
        state_tx.send_replace(ConnectionState::Connecting);
        tracing::debug!(url = %options.url, attempt, "Connecting to coordinator");

        // Keep serving commands while the handshake is in progress
        let opened = {
            let handshake = open(&options);
            tokio::pin!(handshake);
            loop {
                tokio::select! {
                    result = &mut handshake => break result,
                    cmd = cmd_rx.recv() => {
                        if let Offline::Shutdown(done) = handle_offline(cmd, &mut registry) {
                            shutdown(&mut registry, &state_tx, done);
                            return;
                        }
                    }
                }
            }
        };

        match opened {
            Ok(ws) => {
                state_tx.send_replace(ConnectionState::Connected);
                tracing::info!(url = %options.url, subscriptions = registry.len(), "Connected to coordinator");
                match run_session(ws, &mut registry, &mut cmd_rx).await {
                    SessionEnd::Shutdown(done) => {
                        shutdown(&mut registry, &state_tx, done);
                        return;
                    }
                    SessionEnd::Lost(reason) => {
                        tracing::warn!(reason = %reason, "Subscription connection lost");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(url = %options.url, error = %e, "Failed to connect to coordinator");
            }
        }

        registry.notify_all(SubscriptionEvent::Disconnected);
        state_tx.send_replace(ConnectionState::Disconnected);

        let delay = tokio::time::sleep(options.reconnect_delay);
        tokio::pin!(delay);
        loop {
            tokio::select! {
                _ = &mut delay => break,
                cmd = cmd_rx.recv() => {
                    if let Offline::Shutdown(done) = handle_offline(cmd, &mut registry) {
                        shutdown(&mut registry, &state_tx, done);
                        return;
                    }
                }
            }
        }
    }
}

/// Connect and complete the `connection_init` / `connection_ack` handshake.
async fn open(options: &WsOptions) -> Result<WsStream> {
    let mut request = options.url.as_str().into_client_request()?;
    request
        .headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));

    let (mut ws, _) = connect_async(request).await?;

    let init = ClientMessage::ConnectionInit {
        payload: options.init_payload(),
    };
    ws.send(Message::Text(init.encode()?)).await?;

    tokio::time::timeout(options.handshake_timeout, wait_for_ack(&mut ws))
        .await
        .map_err(|_| {
            Error::Handshake(format!(
                "no connection_ack within {:?}",
                options.handshake_timeout
            ))
        })??;
    Ok(ws)
}

async fn wait_for_ack(ws: &mut WsStream) -> Result<()> {
    while let Some(msg) = ws.next().await {
        match msg? {
            Message::Text(text) => match ServerMessage::decode(&text)? {
                ServerMessage::ConnectionAck { .. } => return Ok(()),
                ServerMessage::Ping { payload } => {
                    ws.send(Message::Text(ClientMessage::Pong { payload }.encode()?))
                        .await?;
                }
                other => {
                    return Err(Error::Handshake(format!(
                        "unexpected frame before connection_ack: {:?}",
                        other
                    )));
                }
            },
            Message::Close(frame) => {
                return Err(Error::Handshake(format!(
                    "closed during handshake: {:?}",
                    frame
                )));
            }
            _ => {}
        }
    }
    Err(Error::Handshake(
        "connection ended before connection_ack".to_string(),
    ))
}

enum SessionEnd {
    Shutdown(Option<oneshot::Sender<()>>),
    Lost(String),
}

async fn send_frame(sink: &mut WsSink, frame: &ClientMessage) -> Result<()> {
    sink.send(Message::Text(frame.encode()?)).await?;
    Ok(())
}

/// Serve one established connection until it drops or shutdown is requested.
async fn run_session(
    ws: WsStream,
    registry: &mut SubscriptionRegistry,
    cmd_rx: &mut mpsc::Receiver<Command>,
) -> SessionEnd {
    let (mut sink, mut stream): (WsSink, SplitStream<WsStream>) = ws.split();

    for (id, frame) in registry.subscribe_frames() {
        if let Err(e) = send_frame(&mut sink, &frame).await {
            return SessionEnd::Lost(e.to_string());
        }
        registry.notify(&id, SubscriptionEvent::Subscribed);
    }

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown(None);
                }
                Some(Command::Subscribe { id, topic, events }) => {
                    let frame = subscribe_frame(&id, &topic);
                    if !registry.insert(id.clone(), topic, events) {
                        continue;
                    }
                    if let Err(e) = send_frame(&mut sink, &frame).await {
                        return SessionEnd::Lost(e.to_string());
                    }
                    registry.notify(&id, SubscriptionEvent::Subscribed);
                }
                Some(Command::Unsubscribe { id }) => {
                    if registry.remove(&id).is_some() {
                        let frame = ClientMessage::Complete { id: id.to_string() };
                        if let Err(e) = send_frame(&mut sink, &frame).await {
                            return SessionEnd::Lost(e.to_string());
                        }
                    }
                }
                Some(Command::Disconnect { done }) => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown(Some(done));
                }
            },
            msg = stream.next() => match msg {
                None => return SessionEnd::Lost("stream ended".to_string()),
                Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                Some(Ok(Message::Text(text))) => match ServerMessage::decode(&text) {
                    Ok(ServerMessage::Ping { payload }) => {
                        if let Err(e) = send_frame(&mut sink, &ClientMessage::Pong { payload }).await {
                            return SessionEnd::Lost(e.to_string());
                        }
                    }
                    Ok(ServerMessage::Pong { .. }) | Ok(ServerMessage::ConnectionAck { .. }) => {}
                    Ok(frame) => {
                        if let Some(gone) = registry.dispatch(frame) {
                            let frame = ClientMessage::Complete { id: gone.to_string() };
                            if let Err(e) = send_frame(&mut sink, &frame).await {
                                return SessionEnd::Lost(e.to_string());
                            }
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Ignoring undecodable frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    return SessionEnd::Lost(format!("closed by server: {:?}", frame));
                }
                Some(Ok(_)) => {}
            },
        }
    }
}
