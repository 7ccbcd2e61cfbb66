//! Subscription router
//!
//! Turns the `data` object of a `next` frame into a typed [`SyncEvent`] and
//! applies it to the [`Store`]. The event type is decided by which root field
//! the payload carries. Unknown or malformed payloads are logged, counted and
//! dropped; nothing here is fatal to the connection.

use std::collections::HashSet;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::connection::{Connection, ConnectionKey, InsertPosition};
use crate::error::{Error, Result};
use crate::node::{bare_session_id, decode_global_id};
use crate::store::{AppendOutcome, Record, Store};
use crate::subscription::{
    NodeUpdated, SessionAdded, SessionFilesChanged, SessionHooksChanged, SessionMessageAdded,
    SessionTodosChanged,
};
use crate::types::{EntityKind, MemoryEvent};

/// A typed inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    MessageAdded(SessionMessageAdded),
    FilesChanged(SessionFilesChanged),
    HooksChanged(SessionHooksChanged),
    TodosChanged(SessionTodosChanged),
    SessionAdded(SessionAdded),
    NodeUpdated(NodeUpdated),
    MemoryUpdated(MemoryEvent),
}

impl SyncEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::MessageAdded(_) => "sessionMessageAdded",
            SyncEvent::FilesChanged(_) => "sessionFilesChanged",
            SyncEvent::HooksChanged(_) => "sessionHooksChanged",
            SyncEvent::TodosChanged(_) => "sessionTodosChanged",
            SyncEvent::SessionAdded(_) => "sessionAdded",
            SyncEvent::NodeUpdated(_) => "nodeUpdated",
            SyncEvent::MemoryUpdated(_) => "memoryUpdated",
        }
    }
}

/// Work the engine must do after an event that carried no full node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Followup {
    /// Fetch the newest items of a loaded connection
    Refresh(ConnectionKey),
    /// Refetch one node by global id
    RefetchNode { kind: EntityKind, id: String },
}

/// Counters for routed and dropped payloads
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub routed: u64,
    pub unknown: u64,
    pub malformed: u64,
    pub failed: u64,
}

enum Classified {
    Event(SyncEvent),
    Unknown,
    Malformed(String),
}

fn field<T: DeserializeOwned>(payload: &Value, name: &str) -> Option<std::result::Result<T, String>> {
    let value = payload.get(name)?;
    Some(serde_json::from_value(value.clone()).map_err(|e| format!("{name}: {e}")))
}

fn classify_inner(payload: &Value) -> Classified {
    macro_rules! route {
        ($name:literal, $variant:ident) => {
            if let Some(parsed) = field(payload, $name) {
                return match parsed {
                    Ok(event) => Classified::Event(SyncEvent::$variant(event)),
                    Err(e) => Classified::Malformed(e),
                };
            }
        };
    }

    route!("sessionMessageAdded", MessageAdded);
    route!("sessionFilesChanged", FilesChanged);
    route!("sessionHooksChanged", HooksChanged);
    route!("sessionTodosChanged", TodosChanged);
    route!("sessionAdded", SessionAdded);
    route!("nodeUpdated", NodeUpdated);
    route!("memoryUpdated", MemoryUpdated);
    Classified::Unknown
}

/// Determine the event type from the payload shape.
///
/// Returns `None` for unknown or malformed payloads.
pub fn classify(payload: &Value) -> Option<SyncEvent> {
    match classify_inner(payload) {
        Classified::Event(event) => Some(event),
        Classified::Unknown => {
            tracing::warn!(%payload, "Dropping payload with unknown shape");
            None
        }
        Classified::Malformed(reason) => {
            tracing::warn!(reason = %reason, "Dropping malformed payload");
            None
        }
    }
}

/// Apply one event to the store.
pub fn apply(store: &mut Store, event: SyncEvent) -> Result<Option<Followup>> {
    match event {
        SyncEvent::MessageAdded(payload) => apply_message_added(store, payload),
        SyncEvent::FilesChanged(payload) => {
            let session_id = bare_session_id(&payload.session_id).to_string();
            store.upsert(
                EntityKind::Session,
                &session_id,
                object(json!({ "sessionId": session_id, "fileChangeCount": payload.file_count })),
            );
            Ok(stale(store, ConnectionKey::file_changes(&session_id)))
        }
        SyncEvent::HooksChanged(payload) => {
            let session_id = bare_session_id(&payload.session_id).to_string();
            tracing::debug!(
                session_id = %session_id,
                hook = ?payload.hook_name,
                plugin = ?payload.plugin_name,
                "Hook activity"
            );
            Ok(stale(store, ConnectionKey::hook_executions(&session_id)))
        }
        SyncEvent::TodosChanged(payload) => {
            let session_id = bare_session_id(&payload.session_id).to_string();
            let pending =
                (payload.todo_count - payload.in_progress_count - payload.completed_count).max(0);
            store.upsert(
                EntityKind::Session,
                &session_id,
                object(json!({
                    "sessionId": session_id,
                    "todoCounts": {
                        "total": payload.todo_count,
                        "pending": pending,
                        "inProgress": payload.in_progress_count,
                        "completed": payload.completed_count,
                    }
                })),
            );
            Ok(None)
        }
        SyncEvent::SessionAdded(payload) => {
            let key = ConnectionKey::sessions(payload.project_id.as_deref());
            match payload.new_session_edge {
                Some(edge) => {
                    store.append_to_connection(&key, edge, InsertPosition::Head)?;
                    Ok(None)
                }
                None => Ok(stale(store, key)),
            }
        }
        SyncEvent::NodeUpdated(payload) => {
            let kind = decode_global_id(&payload.id)
                .and_then(|gid| gid.kind())
                .or_else(|| payload.typename.parse().ok())
                .filter(|kind| *kind != EntityKind::MemoryEvent);
            Ok(kind.map(|kind| Followup::RefetchNode {
                kind,
                id: payload.id,
            }))
        }
        SyncEvent::MemoryUpdated(event) => {
            let id = format!(
                "{}@{}",
                event.path.as_deref().unwrap_or_default(),
                event.timestamp.as_deref().unwrap_or_default()
            );
            store.upsert_value(EntityKind::MemoryEvent, &id, serde_json::to_value(&event)?)?;
            Ok(None)
        }
    }
}

fn apply_message_added(store: &mut Store, payload: SessionMessageAdded) -> Result<Option<Followup>> {
    let session_id = bare_session_id(&payload.session_id).to_string();
    let key = ConnectionKey::messages(&session_id);

    let Some(mut edge) = payload.new_message_edge else {
        return Ok(stale(store, key));
    };

    let Value::Object(node) = &mut edge.node else {
        return Err(Error::Protocol(format!("{key}: message node is not an object")));
    };
    node.entry("messageIndex".to_string())
        .or_insert_with(|| json!(payload.message_index));
    node.entry("sessionId".to_string())
        .or_insert_with(|| json!(session_id));

    let outcome = store.append_to_connection(&key, edge, InsertPosition::Tail)?;
    if outcome == AppendOutcome::Inserted {
        let known = store
            .get_raw(EntityKind::Session, &session_id)
            .and_then(|r| r.get("messageCount"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let count = store.connection(&key).map_or(0, |c| c.total_count());
        if count > known {
            store.upsert(
                EntityKind::Session,
                &session_id,
                object(json!({ "sessionId": session_id, "messageCount": count })),
            );
        }
    }
    Ok(None)
}

/// Store a node fetched by id or with its session. Returns the node id.
///
/// A session's nested `todos` and `tasks` connections become records of
/// their own. The fetched todo list replaces the one stored before.
pub fn apply_node(store: &mut Store, kind: EntityKind, node: Value) -> Result<String> {
    let Value::Object(mut fields) = node else {
        return Err(Error::Protocol(format!("fetched {kind} is not an object")));
    };
    let id = fields
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Protocol(format!("fetched {kind} has no id")))?;

    if kind != EntityKind::Session {
        store.upsert(kind, &id, fields);
        return Ok(id);
    }

    let session_id = fields
        .get("sessionId")
        .and_then(Value::as_str)
        .unwrap_or_else(|| bare_session_id(&id))
        .to_string();
    let todos = fields.remove("todos").filter(|v| !v.is_null());
    let tasks = fields.remove("tasks").filter(|v| !v.is_null());
    store.upsert(kind, &id, fields);

    if let Some(todos) = todos {
        replace_todos(store, &session_id, nested_nodes(todos)?);
    }
    if let Some(tasks) = tasks {
        for mut task in nested_nodes(tasks)? {
            let Some(task_id) = task.get("id").and_then(Value::as_str).map(str::to_string) else {
                continue;
            };
            task.insert("sessionId".to_string(), json!(session_id));
            store.upsert(EntityKind::Task, &task_id, task);
        }
    }
    Ok(id)
}

fn nested_nodes(connection: Value) -> Result<Vec<Record>> {
    let connection: Connection<Value> = serde_json::from_value(connection)?;
    Ok(connection
        .edges
        .into_iter()
        .filter_map(|edge| match edge.node {
            Value::Object(node) => Some(node),
            _ => None,
        })
        .collect())
}

/// Swap a session's todo records for a freshly fetched list.
///
/// Todos without an id are keyed by session and position.
fn replace_todos(store: &mut Store, session_id: &str, todos: Vec<Record>) {
    let mut keep = HashSet::new();
    for (position, mut todo) in todos.into_iter().enumerate() {
        let id = todo
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{session_id}:todo:{position}"));
        todo.insert("sessionId".to_string(), json!(session_id));
        store.upsert(EntityKind::Todo, &id, todo);
        keep.insert(id);
    }

    let stale: Vec<String> = store
        .records(EntityKind::Todo)
        .filter(|(id, record)| {
            record.get("sessionId").and_then(Value::as_str) == Some(session_id)
                && !keep.contains(*id)
        })
        .map(|(id, _)| id.to_string())
        .collect();
    for id in stale {
        store.remove(EntityKind::Todo, &id);
    }
}

/// Mark a connection stale and ask for a refresh if it is loaded.
fn stale(store: &Store, key: ConnectionKey) -> Option<Followup> {
    if store.has_connection(&key) {
        store.mark_stale(&key);
        Some(Followup::Refresh(key))
    } else {
        None
    }
}

fn object(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        _ => Record::new(),
    }
}

/// Classifies and applies payloads, keeping counters.
#[derive(Debug, Default)]
pub struct Router {
    stats: RouterStats,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route one payload into the store. Never fails; problems are logged and counted.
    pub fn route(&mut self, store: &mut Store, payload: &Value) -> Option<Followup> {
        let event = match classify_inner(payload) {
            Classified::Event(event) => event,
            Classified::Unknown => {
                self.stats.unknown += 1;
                tracing::warn!(%payload, "Dropping payload with unknown shape");
                return None;
            }
            Classified::Malformed(reason) => {
                self.stats.malformed += 1;
                tracing::warn!(reason = %reason, "Dropping malformed payload");
                return None;
            }
        };

        let name = event.name();
        match apply(store, event) {
            Ok(followup) => {
                self.stats.routed += 1;
                tracing::trace!(event = name, ?followup, "Routed event");
                followup
            }
            Err(e) => {
                self.stats.failed += 1;
                tracing::warn!(event = name, error = %e, "Failed to apply event");
                None
            }
        }
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }
}
