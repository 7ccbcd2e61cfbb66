//! Relay-style connection types for cursor-based pagination.
//!
//! These match the coordinator's wire shape:
//! `edges[{node, cursor}]`, `pageInfo{...}`, `totalCount`.

use serde::{Deserialize, Serialize};

use crate::types::EntityKind;

/// Relay PageInfo for pagination metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PageInfo {
    /// Whether there are more items after the last edge.
    pub has_next_page: bool,
    /// Whether there are more items before the first edge.
    pub has_previous_page: bool,
    /// Cursor of the first edge.
    pub start_cursor: Option<String>,
    /// Cursor of the last edge.
    pub end_cursor: Option<String>,
}

/// An entity node paired with its opaque cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge<T> {
    pub node: T,
    pub cursor: String,
}

/// One page of a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection<T> {
    pub edges: Vec<Edge<T>>,
    #[serde(default)]
    pub page_info: PageInfo,
    #[serde(default)]
    pub total_count: i64,
}

impl<T> Default for Connection<T> {
    fn default() -> Self {
        Self {
            edges: Vec::new(),
            page_info: PageInfo::default(),
            total_count: 0,
        }
    }
}

/// Which way to page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Newer items, after `endCursor`
    Forward,
    /// Older items, before `startCursor`
    Backward,
}

/// Where a live insertion lands in a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPosition {
    Head,
    Tail,
}

/// Cursor window arguments (`first`/`after` or `last`/`before`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PageRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
}

impl PageRequest {
    pub fn forward(count: usize, after: Option<String>) -> Self {
        Self {
            first: Some(count),
            after,
            ..Default::default()
        }
    }

    pub fn backward(count: usize, before: Option<String>) -> Self {
        Self {
            last: Some(count),
            before,
            ..Default::default()
        }
    }

    pub fn direction(&self) -> Direction {
        if self.last.is_some() || self.before.is_some() {
            Direction::Backward
        } else {
            Direction::Forward
        }
    }
}

/// The paginated lists the client keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ListKind {
    Messages,
    FileChanges,
    HookExecutions,
    Sessions,
}

impl ListKind {
    /// GraphQL field name of the connection on its parent
    pub fn field(&self) -> &'static str {
        match self {
            ListKind::Messages => "messages",
            ListKind::FileChanges => "fileChanges",
            ListKind::HookExecutions => "hookExecutions",
            ListKind::Sessions => "sessions",
        }
    }

    /// Kind of the nodes held by this list
    pub fn entity_kind(&self) -> EntityKind {
        match self {
            ListKind::Messages => EntityKind::Message,
            ListKind::FileChanges => EntityKind::FileChange,
            ListKind::HookExecutions => EntityKind::HookExecution,
            ListKind::Sessions => EntityKind::Session,
        }
    }
}

impl std::fmt::Display for ListKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.field())
    }
}

/// Identifies one connection in the store, e.g. `S1.messages`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    pub parent: String,
    pub list: ListKind,
}

impl ConnectionKey {
    pub fn new(parent: impl Into<String>, list: ListKind) -> Self {
        Self {
            parent: parent.into(),
            list,
        }
    }

    pub fn messages(session_id: &str) -> Self {
        Self::new(session_id, ListKind::Messages)
    }

    pub fn file_changes(session_id: &str) -> Self {
        Self::new(session_id, ListKind::FileChanges)
    }

    pub fn hook_executions(session_id: &str) -> Self {
        Self::new(session_id, ListKind::HookExecutions)
    }

    /// Root-level session list (optionally scoped to a project)
    pub fn sessions(project_id: Option<&str>) -> Self {
        Self::new(project_id.unwrap_or("root"), ListKind::Sessions)
    }
}

impl std::fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.parent, self.list.field())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_key_display() {
        assert_eq!(ConnectionKey::messages("S1").to_string(), "S1.messages");
        assert_eq!(ConnectionKey::file_changes("S1").to_string(), "S1.fileChanges");
        assert_eq!(ConnectionKey::sessions(None).to_string(), "root.sessions");
    }

    #[test]
    fn test_page_request_direction() {
        assert_eq!(PageRequest::forward(10, None).direction(), Direction::Forward);
        assert_eq!(
            PageRequest::backward(10, Some("c1".to_string())).direction(),
            Direction::Backward
        );
    }

    #[test]
    fn test_connection_parses_wire_shape() {
        let value = serde_json::json!({
            "edges": [{"node": {"id": "m1"}, "cursor": "c1"}],
            "pageInfo": {"hasPreviousPage": true, "startCursor": "c1", "endCursor": "c1"},
            "totalCount": 7
        });
        let conn: Connection<serde_json::Value> = serde_json::from_value(value).unwrap();
        assert_eq!(conn.edges.len(), 1);
        assert_eq!(conn.edges[0].cursor, "c1");
        assert!(conn.page_info.has_previous_page);
        assert!(!conn.page_info.has_next_page);
        assert_eq!(conn.total_count, 7);
    }
}
