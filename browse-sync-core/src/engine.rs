//! Sync engine
//!
//! Owns one [`Store`] and applies everything that mutates it on a single
//! task, one input at a time: subscription events from the connection
//! manager, finished page fetches, and caller commands. Fetches run on their
//! own tasks and report back through a channel, so the loop never waits on
//! the network while holding the store.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::connection::{Connection, ConnectionKey, Direction, ListKind};
use crate::error::{Error, Result};
use crate::pagination::{FetchTicket, ListWindow, PageFetcher, PaginationCoordinator};
use crate::router::{self, Followup, Router, RouterStats};
use crate::store::{Store, StoreChange};
use crate::subscription::Topic;
use crate::transport::ws::{ConnectionManager, SubscriptionEvent, SubscriptionId};
use crate::types::EntityKind;

type ReadFn = Box<dyn FnOnce(&Store, &RouterStats) + Send>;

/// Requests from engine handles
enum Command {
    Watch {
        session_id: String,
        done: oneshot::Sender<Result<()>>,
    },
    Unwatch {
        session_id: String,
    },
    WatchTopic {
        topic: Topic,
        done: oneshot::Sender<Result<SubscriptionId>>,
    },
    UnwatchTopic {
        id: SubscriptionId,
    },
    LoadMore {
        key: ConnectionKey,
        direction: Direction,
    },
    Window {
        key: ConnectionKey,
        reply: oneshot::Sender<ListWindow>,
    },
    Read(ReadFn),
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Results produced by tasks the engine spawned
enum Completion {
    Subscription {
        topic: Topic,
        id: SubscriptionId,
        event: SubscriptionEvent,
    },
    Page {
        ticket: FetchTicket,
        result: Result<Connection<Value>>,
    },
    Node {
        kind: EntityKind,
        result: Result<Option<Value>>,
    },
}

struct Watch {
    subscriptions: Vec<SubscriptionId>,
    forwarders: Vec<JoinHandle<()>>,
}

/// Handle to a running engine
pub struct SyncEngine {
    cmd_tx: mpsc::Sender<Command>,
    changes: broadcast::Sender<StoreChange>,
    handle: JoinHandle<()>,
}

impl SyncEngine {
    /// Start the engine task.
    pub fn start<F: PageFetcher>(
        config: &SyncConfig,
        fetcher: Arc<F>,
        connection: ConnectionManager,
    ) -> Self {
        let store = Store::new(config);
        let changes = store.change_sender();
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (done_tx, done_rx) = mpsc::channel(256);

        let state = EngineState {
            store,
            router: Router::new(),
            pager: PaginationCoordinator::new(fetcher, config.page_size),
            connection: Some(connection),
            watches: HashMap::new(),
            topic_watches: HashMap::new(),
            seen_subscribed: HashMap::new(),
            done_tx,
        };
        let handle = tokio::spawn(state.run(cmd_rx, done_rx));

        Self {
            cmd_tx,
            changes,
            handle,
        }
    }

    /// Receive store change notifications
    pub fn changes(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    /// Subscribe to a session's topics and load the first page of its lists.
    ///
    /// Dropping the returned watch unsubscribes and cancels pending loads.
    pub async fn watch_session(&self, session_id: &str) -> Result<SessionWatch> {
        let (done, done_rx) = oneshot::channel();
        self.send(Command::Watch {
            session_id: session_id.to_string(),
            done,
        })
        .await?;
        done_rx.await.map_err(|_| stopped())??;
        Ok(SessionWatch {
            session_id: session_id.to_string(),
            cmd_tx: self.cmd_tx.clone(),
        })
    }

    /// Subscribe to a topic outside any session view, such as
    /// [`Topic::MemoryUpdated`] or [`Topic::SessionAdded`]. Its events are
    /// routed into the store like session events.
    ///
    /// Dropping the returned watch unsubscribes.
    pub async fn watch_topic(&self, topic: Topic) -> Result<TopicWatch> {
        let (done, done_rx) = oneshot::channel();
        self.send(Command::WatchTopic {
            topic: topic.clone(),
            done,
        })
        .await?;
        let id = done_rx.await.map_err(|_| stopped())??;
        Ok(TopicWatch {
            topic,
            id,
            cmd_tx: self.cmd_tx.clone(),
        })
    }

    /// Request the next page of a list. Progress shows up as store changes
    /// and in [`window`](Self::window).
    pub async fn load_more(&self, key: ConnectionKey, direction: Direction) -> Result<()> {
        self.send(Command::LoadMore { key, direction }).await
    }

    /// Current window and load state of a list
    pub async fn window(&self, key: ConnectionKey) -> Result<ListWindow> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Window { key, reply }).await?;
        rx.await.map_err(|_| stopped())
    }

    /// Run `f` against the store on the engine task
    pub async fn read<R, G>(&self, f: G) -> Result<R>
    where
        R: Send + 'static,
        G: FnOnce(&Store, &RouterStats) -> R + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let read: ReadFn = Box::new(move |store, stats| {
            let _ = reply.send(f(store, stats));
        });
        self.send(Command::Read(read)).await?;
        rx.await.map_err(|_| stopped())
    }

    /// Stop the engine and close the subscription connection
    pub async fn shutdown(self) -> Result<()> {
        let (done, done_rx) = oneshot::channel();
        if self.send(Command::Shutdown { done }).await.is_ok() {
            let _ = done_rx.await;
        }
        let _ = self.handle.await;
        Ok(())
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.cmd_tx.send(command).await.map_err(|_| stopped())
    }
}

fn stopped() -> Error {
    Error::Cancelled("sync engine has stopped".to_string())
}

/// Keeps a session subscribed while alive
pub struct SessionWatch {
    session_id: String,
    cmd_tx: mpsc::Sender<Command>,
}

impl SessionWatch {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for SessionWatch {
    fn drop(&mut self) {
        let command = Command::Unwatch {
            session_id: self.session_id.clone(),
        };
        send_on_drop(&self.cmd_tx, command);
    }
}

/// Keeps a topic subscribed while alive
pub struct TopicWatch {
    topic: Topic,
    id: SubscriptionId,
    cmd_tx: mpsc::Sender<Command>,
}

impl TopicWatch {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }
}

impl Drop for TopicWatch {
    fn drop(&mut self) {
        let command = Command::UnwatchTopic {
            id: self.id.clone(),
        };
        send_on_drop(&self.cmd_tx, command);
    }
}

/// Deliver a cleanup command from `Drop`.
///
/// A full channel hands the command to a task that waits for room; a closed
/// one means the engine already stopped and cleaned up.
fn send_on_drop(cmd_tx: &mpsc::Sender<Command>, command: Command) {
    match cmd_tx.try_send(command) {
        Ok(()) | Err(TrySendError::Closed(_)) => {}
        Err(TrySendError::Full(command)) => match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let cmd_tx = cmd_tx.clone();
                runtime.spawn(async move {
                    let _ = cmd_tx.send(command).await;
                });
            }
            Err(_) => {
                tracing::warn!("Engine command queue full outside a runtime, cleanup dropped");
            }
        },
    }
}

// ============================================
// Engine task
// ============================================

struct EngineState<F: PageFetcher> {
    store: Store,
    router: Router,
    pager: PaginationCoordinator<F>,
    connection: Option<ConnectionManager>,
    watches: HashMap<String, Watch>,
    /// Standalone topic subscriptions and their forwarders
    topic_watches: HashMap<SubscriptionId, JoinHandle<()>>,
    /// Topics that have been subscribed at least once; a repeat means a reconnect
    seen_subscribed: HashMap<Topic, u32>,
    done_tx: mpsc::Sender<Completion>,
}

impl<F: PageFetcher> EngineState<F> {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut done_rx: mpsc::Receiver<Completion>,
    ) {
        tracing::debug!("Sync engine started");
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Shutdown { done }) => {
                        self.stop().await;
                        let _ = done.send(());
                        return;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        self.stop().await;
                        return;
                    }
                },
                Some(completion) = done_rx.recv() => self.handle_completion(completion),
            }
        }
    }

    async fn stop(&mut self) {
        let sessions: Vec<String> = self.watches.keys().cloned().collect();
        for session_id in sessions {
            self.unwatch(&session_id).await;
        }
        let topics: Vec<SubscriptionId> = self.topic_watches.keys().cloned().collect();
        for id in topics {
            self.unwatch_topic(&id).await;
        }
        if let Some(connection) = self.connection.take() {
            let _ = connection.disconnect().await;
        }
        tracing::debug!(stats = ?self.router.stats(), "Sync engine stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Watch { session_id, done } => {
                let result = self.watch(&session_id).await;
                let _ = done.send(result);
            }
            Command::Unwatch { session_id } => self.unwatch(&session_id).await,
            Command::WatchTopic { topic, done } => {
                let result = self.watch_topic(topic).await;
                let _ = done.send(result);
            }
            Command::UnwatchTopic { id } => self.unwatch_topic(&id).await,
            Command::LoadMore { key, direction } => {
                if let Some(ticket) = self.pager.begin(&self.store, &key, direction) {
                    self.spawn_fetch(ticket);
                }
            }
            Command::Window { key, reply } => {
                let _ = reply.send(self.pager.window(&self.store, &key));
            }
            Command::Read(f) => f(&self.store, self.router.stats()),
            Command::Shutdown { .. } => {}
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Subscription { topic, id, event } => {
                self.handle_subscription(topic, &id, event)
            }
            Completion::Page { ticket, result } => {
                // Failures are recorded in the list's load state
                let _ = self.pager.complete(&mut self.store, ticket, result);
            }
            Completion::Node { kind, result } => match result {
                Ok(Some(node)) => {
                    if let Err(e) = router::apply_node(&mut self.store, kind, node) {
                        tracing::warn!(kind = %kind, error = %e, "Failed to store fetched node");
                    }
                }
                Ok(None) => tracing::debug!(kind = %kind, "Node not found"),
                Err(e) => tracing::warn!(kind = %kind, error = %e, "Node fetch failed"),
            },
        }
    }

    /// Whether events from subscription `id` should still reach the store
    fn is_live(&self, topic: &Topic, id: &SubscriptionId) -> bool {
        if self.topic_watches.contains_key(id) {
            return true;
        }
        topic
            .session_id()
            .and_then(|session_id| self.watches.get(session_id))
            .map_or(false, |watch| watch.subscriptions.contains(id))
    }

    fn handle_subscription(&mut self, topic: Topic, id: &SubscriptionId, event: SubscriptionEvent) {
        // Events queued before an unwatch must not recreate what it removed
        if !self.is_live(&topic, id) {
            tracing::trace!(topic = %topic, subscription = %id, "Dropping event for closed subscription");
            return;
        }
        match event {
            SubscriptionEvent::Data(payload) => {
                if let Some(followup) = self.router.route(&mut self.store, &payload) {
                    self.follow_up(followup);
                }
            }
            SubscriptionEvent::Errors(messages) => {
                tracing::warn!(topic = %topic, ?messages, "Subscription errors");
            }
            SubscriptionEvent::Subscribed => {
                let count = self.seen_subscribed.entry(topic.clone()).or_insert(0);
                *count += 1;
                // Events pushed while disconnected are gone; re-read the list instead
                if *count > 1 {
                    if let Some(key) = topic_list(&topic) {
                        tracing::debug!(topic = %topic, "Resubscribed, refreshing list");
                        self.follow_up(Followup::Refresh(key));
                    }
                }
            }
            SubscriptionEvent::Disconnected => {
                tracing::debug!(topic = %topic, "Subscription waiting for reconnect");
            }
            SubscriptionEvent::Completed => {
                tracing::debug!(topic = %topic, "Subscription completed");
            }
        }
    }

    fn follow_up(&mut self, followup: Followup) {
        match followup {
            Followup::Refresh(key) => {
                if let Some(ticket) = self.pager.begin_refresh(&self.store, &key) {
                    self.spawn_fetch(ticket);
                }
            }
            Followup::RefetchNode { kind, id } => {
                let fut = self.pager.fetcher().fetch_node(kind, &id);
                self.spawn_completion(async move {
                    Completion::Node {
                        kind,
                        result: fut.await,
                    }
                });
            }
        }
    }

    async fn watch(&mut self, session_id: &str) -> Result<()> {
        if self.watches.contains_key(session_id) {
            return Ok(());
        }
        let connection = self
            .connection
            .as_ref()
            .ok_or_else(|| Error::Transport("subscription connection closed".to_string()))?;

        let mut watch = Watch {
            subscriptions: Vec::new(),
            forwarders: Vec::new(),
        };
        for topic in Topic::for_session(session_id) {
            let (id, events) = connection.subscribe(topic.clone()).await?;
            watch.forwarders.push(self.forward(topic, id.clone(), events));
            watch.subscriptions.push(id);
        }
        self.watches.insert(session_id.to_string(), watch);

        let fut = self.pager.fetcher().fetch_session(session_id);
        self.spawn_completion(async move {
            Completion::Node {
                kind: EntityKind::Session,
                result: fut.await,
            }
        });
        for key in [
            ConnectionKey::messages(session_id),
            ConnectionKey::file_changes(session_id),
            ConnectionKey::hook_executions(session_id),
        ] {
            if let Some(ticket) = self.pager.begin_initial(&key) {
                self.spawn_fetch(ticket);
            }
        }

        tracing::info!(session_id, "Watching session");
        Ok(())
    }

    async fn unwatch(&mut self, session_id: &str) {
        let Some(watch) = self.watches.remove(session_id) else {
            return;
        };
        if let Some(connection) = &self.connection {
            for id in &watch.subscriptions {
                if let Err(e) = connection.unsubscribe(id).await {
                    tracing::debug!(subscription = %id, error = %e, "Unsubscribe failed");
                }
            }
        }
        for forwarder in watch.forwarders {
            forwarder.abort();
        }
        self.seen_subscribed
            .retain(|topic, _| topic.session_id() != Some(session_id));
        self.pager.forget_parent(session_id);
        for list in [ListKind::Messages, ListKind::FileChanges, ListKind::HookExecutions] {
            self.store
                .remove_connection(&ConnectionKey::new(session_id, list));
        }
        tracing::info!(session_id, "Stopped watching session");
    }

    async fn watch_topic(&mut self, topic: Topic) -> Result<SubscriptionId> {
        let connection = self
            .connection
            .as_ref()
            .ok_or_else(|| Error::Transport("subscription connection closed".to_string()))?;
        let (id, events) = connection.subscribe(topic.clone()).await?;
        tracing::info!(topic = %topic, subscription = %id, "Watching topic");
        let forwarder = self.forward(topic, id.clone(), events);
        self.topic_watches.insert(id.clone(), forwarder);
        Ok(id)
    }

    async fn unwatch_topic(&mut self, id: &SubscriptionId) {
        let Some(forwarder) = self.topic_watches.remove(id) else {
            return;
        };
        if let Some(connection) = &self.connection {
            if let Err(e) = connection.unsubscribe(id).await {
                tracing::debug!(subscription = %id, error = %e, "Unsubscribe failed");
            }
        }
        forwarder.abort();
        tracing::debug!(subscription = %id, "Stopped watching topic");
    }

    /// Pump one subscription's events into the completion channel
    fn forward(
        &self,
        topic: Topic,
        id: SubscriptionId,
        mut events: mpsc::UnboundedReceiver<SubscriptionEvent>,
    ) -> JoinHandle<()> {
        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let completion = Completion::Subscription {
                    topic: topic.clone(),
                    id: id.clone(),
                    event,
                };
                if done_tx.send(completion).await.is_err() {
                    break;
                }
            }
        })
    }

    fn spawn_fetch(&mut self, ticket: FetchTicket) {
        let fut = self.pager.fetch(&ticket);
        let tracked = ticket.clone();
        let handle = self.spawn_completion(async move {
            Completion::Page {
                ticket,
                result: fut.await,
            }
        });
        self.pager.track(&tracked, handle.abort_handle());
    }

    fn spawn_completion<T>(&self, task: T) -> JoinHandle<()>
    where
        T: std::future::Future<Output = Completion> + Send + 'static,
    {
        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            let completion = task.await;
            let _ = done_tx.send(completion).await;
        })
    }
}

/// The list a topic feeds, if it feeds one
fn topic_list(topic: &Topic) -> Option<ConnectionKey> {
    match topic {
        Topic::SessionMessageAdded { session_id } => Some(ConnectionKey::messages(session_id)),
        Topic::SessionFilesChanged { session_id } => Some(ConnectionKey::file_changes(session_id)),
        Topic::SessionHooksChanged { session_id } => {
            Some(ConnectionKey::hook_executions(session_id))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::PageRequest;
    use futures_util::future::BoxFuture;
    use serde_json::json;

    struct NoFetcher;

    impl PageFetcher for NoFetcher {
        fn fetch_page(
            &self,
            _key: &ConnectionKey,
            _request: PageRequest,
        ) -> BoxFuture<'static, Result<Connection<Value>>> {
            Box::pin(async { Ok(Connection::default()) })
        }

        fn fetch_session(&self, _session_id: &str) -> BoxFuture<'static, Result<Option<Value>>> {
            Box::pin(async { Ok(None) })
        }

        fn fetch_node(&self, _kind: EntityKind, _id: &str) -> BoxFuture<'static, Result<Option<Value>>> {
            Box::pin(async { Ok(None) })
        }
    }

    fn offline_state() -> EngineState<NoFetcher> {
        let (done_tx, _done_rx) = mpsc::channel(8);
        EngineState {
            store: Store::default(),
            router: Router::new(),
            pager: PaginationCoordinator::new(Arc::new(NoFetcher), 20),
            connection: None,
            watches: HashMap::new(),
            topic_watches: HashMap::new(),
            seen_subscribed: HashMap::new(),
            done_tx,
        }
    }

    fn message_added(id: &str, index: i64) -> SubscriptionEvent {
        SubscriptionEvent::Data(json!({"sessionMessageAdded": {
            "sessionId": "S1",
            "messageIndex": index,
            "newMessageEdge": {"cursor": format!("c{index}"), "node": {"id": id}}
        }}))
    }

    #[tokio::test]
    async fn test_events_after_unwatch_are_dropped() {
        let mut state = offline_state();
        let topic = Topic::SessionMessageAdded {
            session_id: "S1".to_string(),
        };
        let id = SubscriptionId::new();
        state.watches.insert(
            "S1".to_string(),
            Watch {
                subscriptions: vec![id.clone()],
                forwarders: Vec::new(),
            },
        );

        state.handle_subscription(topic.clone(), &id, message_added("m1", 1));
        assert!(state.store.contains(EntityKind::Message, "m1"));
        assert_eq!(state.store.pending_len(), 1);

        state.unwatch("S1").await;
        assert_eq!(state.store.pending_len(), 0);

        // Still queued when the watch went away
        state.handle_subscription(topic, &id, message_added("m2", 2));
        assert!(!state.store.contains(EntityKind::Message, "m2"));
        assert_eq!(state.store.pending_len(), 0);
        assert_eq!(state.router.stats().routed, 1);
    }

    #[tokio::test]
    async fn test_dropped_watch_unwatches_when_queue_is_full() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(1);
        let filled = cmd_tx.try_send(Command::LoadMore {
            key: ConnectionKey::messages("S1"),
            direction: Direction::Backward,
        });
        assert!(filled.is_ok());

        drop(SessionWatch {
            session_id: "S1".to_string(),
            cmd_tx: cmd_tx.clone(),
        });

        assert!(matches!(cmd_rx.recv().await, Some(Command::LoadMore { .. })));
        assert!(matches!(
            cmd_rx.recv().await,
            Some(Command::Unwatch { session_id }) if session_id == "S1"
        ));
    }

    #[tokio::test]
    async fn test_unknown_subscription_is_ignored() {
        let mut state = offline_state();
        let payload = SubscriptionEvent::Data(json!({"memoryUpdated": {"path": "/m", "timestamp": "t"}}));
        state.handle_subscription(Topic::MemoryUpdated, &SubscriptionId::new(), payload);
        assert_eq!(state.store.record_count(EntityKind::MemoryEvent), 0);
    }

    #[test]
    fn test_topic_list_mapping() {
        let topics = Topic::for_session("S1");
        let keys: Vec<_> = topics.iter().filter_map(topic_list).collect();
        assert_eq!(
            keys,
            vec![
                ConnectionKey::messages("S1"),
                ConnectionKey::file_changes("S1"),
                ConnectionKey::hook_executions("S1"),
            ]
        );
        assert!(topic_list(&Topic::MemoryUpdated).is_none());
    }
}
