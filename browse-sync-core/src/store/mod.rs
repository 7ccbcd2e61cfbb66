//! Normalized entity store
//!
//! Records are kept once per `(kind, id)` as JSON objects and merged field by
//! field. Connections hold ordered edge references into the record table, so a
//! node reachable from several lists (or delivered by both a page fetch and a
//! subscription) exists exactly once.
//!
//! Every mutation that changes something is announced on a broadcast channel
//! as a [`StoreChange`]. Mutations that change nothing are silent.

mod connection;
mod pending;

pub use connection::{ConnectionState, EdgeOrder, EdgeRef, InsertOutcome};
pub use pending::{PendingBuffer, PendingInsertion};

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::config::SyncConfig;
use crate::connection::{Connection, ConnectionKey, Direction, Edge, InsertPosition};
use crate::error::{Error, Result};
use crate::node::bare_session_id;
use crate::types::EntityKind;

/// Field map of one normalized record
pub type Record = Map<String, Value>;

/// Notification emitted after a mutation that changed the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    /// A record was inserted or had at least one field change
    Record { kind: EntityKind, id: String },
    /// A connection gained edges or new page info
    Connection { key: ConnectionKey },
    /// A connection is known to have new server-side items that no payload carried
    Stale { key: ConnectionKey },
}

/// Result of [`Store::append_to_connection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    Duplicate,
    Replaced { previous: String },
    /// The connection has not been populated; the edge waits in the pending buffer.
    Buffered,
}

/// Client-side cache of coordinator entities and connections.
pub struct Store {
    records: BTreeMap<(EntityKind, String), Record>,
    connections: BTreeMap<ConnectionKey, ConnectionState>,
    pending: PendingBuffer,
    changes: broadcast::Sender<StoreChange>,
}

impl Store {
    pub fn new(config: &SyncConfig) -> Self {
        Self::with_capacity(config.pending_buffer_capacity, config.change_channel_capacity)
    }

    pub fn with_capacity(pending_capacity: usize, change_capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(change_capacity.max(1));
        Self {
            records: BTreeMap::new(),
            connections: BTreeMap::new(),
            pending: PendingBuffer::new(pending_capacity),
            changes,
        }
    }

    /// Subscribe to change notifications
    pub fn changes(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    /// Sender side of the change channel, for handing out receivers after the
    /// store has moved onto another task
    pub fn change_sender(&self) -> broadcast::Sender<StoreChange> {
        self.changes.clone()
    }

    fn notify(&self, change: StoreChange) {
        // No receivers is fine; nobody is rendering yet
        let _ = self.changes.send(change);
    }

    // ============================================
    // Records
    // ============================================

    /// Merge `fields` into the record `(kind, id)`, creating it if needed.
    ///
    /// Each top-level field is last-write-wins. Returns `true` if the record
    /// was created or any field value differs from what was stored.
    ///
    /// Sessions are keyed by their bare session id whichever form of id the
    /// payload carries, so pushed counters and fetched metadata share one record.
    pub fn upsert(&mut self, kind: EntityKind, id: &str, fields: Record) -> bool {
        let id = record_key(kind, id, &fields);
        let changed = self.merge_record(kind, &id, fields);
        if changed {
            tracing::trace!(kind = %kind, id = %id, "Record changed");
            self.notify(StoreChange::Record { kind, id });
        }
        changed
    }

    /// Like [`Store::upsert`] for a JSON value; non-object values are rejected.
    pub fn upsert_value(&mut self, kind: EntityKind, id: &str, fields: Value) -> Result<bool> {
        match fields {
            Value::Object(map) => Ok(self.upsert(kind, id, map)),
            other => Err(Error::Protocol(format!(
                "{kind} {id}: expected an object, got {other}"
            ))),
        }
    }

    fn merge_record(&mut self, kind: EntityKind, id: &str, fields: Record) -> bool {
        let record = match self.records.get_mut(&(kind, id.to_string())) {
            Some(record) => record,
            None => {
                let mut record = fields;
                record
                    .entry("id".to_string())
                    .or_insert_with(|| Value::String(id.to_string()));
                self.records.insert((kind, id.to_string()), record);
                return true;
            }
        };

        let mut changed = false;
        for (field, value) in fields {
            if record.get(&field) != Some(&value) {
                record.insert(field, value);
                changed = true;
            }
        }
        changed
    }

    /// Delete one record. Connections that still reference it skip it on read.
    pub fn remove(&mut self, kind: EntityKind, id: &str) -> bool {
        let id = lookup_key(kind, id);
        let removed = self.records.remove(&(kind, id.clone())).is_some();
        if removed {
            self.notify(StoreChange::Record { kind, id });
        }
        removed
    }

    pub fn get_raw(&self, kind: EntityKind, id: &str) -> Option<&Record> {
        self.records.get(&(kind, lookup_key(kind, id)))
    }

    pub fn contains(&self, kind: EntityKind, id: &str) -> bool {
        self.records.contains_key(&(kind, lookup_key(kind, id)))
    }

    /// Typed read of one record. Records that no longer fit `T` read as `None`.
    pub fn get<T: DeserializeOwned>(&self, kind: EntityKind, id: &str) -> Option<T> {
        let record = self.get_raw(kind, id)?;
        match serde_json::from_value(Value::Object(record.clone())) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(kind = %kind, id, error = %e, "Record does not match its type");
                None
            }
        }
    }

    /// All records of one kind, ordered by id
    pub fn records(&self, kind: EntityKind) -> impl Iterator<Item = (&str, &Record)> {
        self.records
            .range((kind, String::new())..)
            .take_while(move |((k, _), _)| *k == kind)
            .map(|((_, id), record)| (id.as_str(), record))
    }

    /// Typed read of every record of one kind
    pub fn all<T: DeserializeOwned>(&self, kind: EntityKind) -> Vec<T> {
        self.records(kind)
            .filter_map(|(_, record)| serde_json::from_value(Value::Object(record.clone())).ok())
            .collect()
    }

    pub fn record_count(&self, kind: EntityKind) -> usize {
        self.records(kind).count()
    }

    // ============================================
    // Connections
    // ============================================

    pub fn connection(&self, key: &ConnectionKey) -> Option<&ConnectionState> {
        self.connections.get(key)
    }

    pub fn has_connection(&self, key: &ConnectionKey) -> bool {
        self.connections.contains_key(key)
    }

    /// Register an empty connection so live insertions land directly.
    ///
    /// Returns `true` if the connection was created; any buffered insertions
    /// for the key are replayed into it.
    pub fn ensure_connection(&mut self, key: &ConnectionKey) -> bool {
        if self.connections.contains_key(key) {
            return false;
        }
        self.connections.insert(
            key.clone(),
            ConnectionState::new(EdgeOrder::for_list(key.list)),
        );
        if self.replay_pending(key) > 0 {
            self.notify(StoreChange::Connection { key: key.clone() });
        }
        true
    }

    /// Drop a connection and its buffered insertions. Records stay.
    pub fn remove_connection(&mut self, key: &ConnectionKey) -> bool {
        self.pending.take_for(key);
        self.connections.remove(key).is_some()
    }

    /// Insert one edge, upserting its node.
    ///
    /// Never duplicates a node already in the connection. If the connection
    /// does not exist yet the edge is buffered until it is populated.
    pub fn append_to_connection(
        &mut self,
        key: &ConnectionKey,
        edge: Edge<Value>,
        position: InsertPosition,
    ) -> Result<AppendOutcome> {
        let edge_ref = self.absorb_node(key, edge)?;

        let Some(state) = self.connections.get_mut(key) else {
            tracing::debug!(
                connection = %key,
                node = %edge_ref.node_id,
                "Connection not loaded, buffering insertion"
            );
            let evicted = self.pending.push(PendingInsertion {
                key: key.clone(),
                edge: edge_ref,
                position,
            });
            if let Some(evicted) = evicted {
                tracing::warn!(
                    connection = %evicted.key,
                    node = %evicted.edge.node_id,
                    "Pending buffer full, dropped oldest insertion"
                );
            }
            return Ok(AppendOutcome::Buffered);
        };

        let outcome = match state.insert_live(edge_ref, position) {
            InsertOutcome::Inserted => AppendOutcome::Inserted,
            InsertOutcome::Duplicate => AppendOutcome::Duplicate,
            InsertOutcome::Replaced { previous } => {
                tracing::warn!(connection = %key, previous = %previous, "Edge replaced another with the same index");
                AppendOutcome::Replaced { previous }
            }
        };

        if outcome != AppendOutcome::Duplicate {
            self.notify(StoreChange::Connection { key: key.clone() });
        }
        Ok(outcome)
    }

    /// Merge a fetched page into the connection and update its page info.
    ///
    /// Creates the connection if needed and then replays buffered insertions
    /// for it. Returns the number of edges that were new to the connection.
    pub fn populate_connection(
        &mut self,
        key: &ConnectionKey,
        page: Connection<Value>,
        direction: Direction,
    ) -> Result<usize> {
        let mut edges = Vec::with_capacity(page.edges.len());
        for edge in page.edges {
            edges.push(self.absorb_node(key, edge)?);
        }

        let state = self
            .connections
            .entry(key.clone())
            .or_insert_with(|| ConnectionState::new(EdgeOrder::for_list(key.list)));
        let added = state.merge_page(edges, page.page_info, page.total_count, direction);
        let replayed = self.replay_pending(key);

        tracing::debug!(
            connection = %key,
            ?direction,
            added,
            replayed,
            "Populated connection"
        );
        self.notify(StoreChange::Connection { key: key.clone() });
        Ok(added + replayed)
    }

    /// Announce that a connection has unseen server-side items
    pub fn mark_stale(&self, key: &ConnectionKey) {
        self.notify(StoreChange::Stale { key: key.clone() });
    }

    /// Typed nodes of a connection, in connection order
    pub fn connection_nodes<T: DeserializeOwned>(&self, key: &ConnectionKey) -> Vec<T> {
        let Some(state) = self.connections.get(key) else {
            return Vec::new();
        };
        let kind = key.list.entity_kind();
        state
            .node_ids()
            .filter_map(|id| self.get::<T>(kind, id))
            .collect()
    }

    /// Insertions waiting for a connection to be populated
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_dropped(&self) -> usize {
        self.pending.dropped()
    }

    fn absorb_node(&mut self, key: &ConnectionKey, edge: Edge<Value>) -> Result<EdgeRef> {
        let Edge { node, cursor } = edge;
        let Value::Object(fields) = node else {
            return Err(Error::Protocol(format!("{key}: edge node is not an object")));
        };
        let node_id = fields
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Protocol(format!("{key}: edge node has no id")))?;

        let kind = key.list.entity_kind();
        let node_id = record_key(kind, &node_id, &fields);
        let order = EdgeOrder::for_list(key.list);
        let sort_key = order.sort_key(&Value::Object(fields.clone()));
        self.upsert(kind, &node_id, fields);

        Ok(EdgeRef {
            node_id,
            cursor,
            sort_key,
        })
    }

    fn replay_pending(&mut self, key: &ConnectionKey) -> usize {
        let queued = self.pending.take_for(key);
        if queued.is_empty() {
            return 0;
        }
        let Some(state) = self.connections.get_mut(key) else {
            return 0;
        };
        queued
            .into_iter()
            .filter(|p| state.insert(p.edge.clone(), p.position) != InsertOutcome::Duplicate)
            .count()
    }
}

/// Record key for an upsert: the bare session id for sessions, `id` otherwise
fn record_key(kind: EntityKind, id: &str, fields: &Record) -> String {
    match kind {
        EntityKind::Session => fields
            .get("sessionId")
            .and_then(Value::as_str)
            .unwrap_or_else(|| bare_session_id(id))
            .to_string(),
        _ => id.to_string(),
    }
}

fn lookup_key(kind: EntityKind, id: &str) -> String {
    match kind {
        EntityKind::Session => bare_session_id(id).to_string(),
        _ => id.to_string(),
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new(&SyncConfig::default())
    }
}
