//! View projections
//!
//! Pure functions from a store snapshot to the aggregates a session view
//! shows. Nothing is cached: callers re-run them when the store announces a
//! change. Equal store contents always give equal results.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::connection::ConnectionKey;
use crate::store::Store;
use crate::types::{
    EntityKind, HookExecution, HookStats, HookTypeStat, Message, Session, Todo, TodoCounts,
    TodoStatus,
};

/// A session counts as active if it showed activity this recently
pub const ACTIVE_WINDOW_MINUTES: i64 = 5;

/// Everything a session header needs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub session: Option<Session>,
    pub message_count: i64,
    pub file_change_count: i64,
    pub todo_counts: TodoCounts,
    pub hook_stats: HookStats,
    pub last_activity: Option<DateTime<Utc>>,
    pub is_active: bool,
}

fn session(store: &Store, session_id: &str) -> Option<Session> {
    store.get(EntityKind::Session, session_id)
}

/// Todo counts for a session.
///
/// Counted from todo records when any are loaded, otherwise taken from the
/// counts pushed with the session.
pub fn todo_counts(store: &Store, session_id: &str) -> TodoCounts {
    let todos: Vec<Todo> = store
        .all::<Todo>(EntityKind::Todo)
        .into_iter()
        .filter(|t| t.session_id.as_deref() == Some(session_id))
        .collect();

    if todos.is_empty() {
        return session(store, session_id)
            .and_then(|s| s.todo_counts)
            .unwrap_or_default();
    }

    let mut counts = TodoCounts {
        total: todos.len() as i64,
        ..Default::default()
    };
    for todo in &todos {
        match todo.status {
            Some(TodoStatus::InProgress) => counts.in_progress += 1,
            Some(TodoStatus::Completed) => counts.completed += 1,
            Some(TodoStatus::Pending) | None => counts.pending += 1,
        }
    }
    counts
}

/// Pass/fail statistics over the loaded hook executions of a session
pub fn hook_stats(store: &Store, session_id: &str) -> HookStats {
    let executions: Vec<HookExecution> =
        store.connection_nodes(&ConnectionKey::hook_executions(session_id));

    let mut by_type: BTreeMap<String, (i64, i64)> = BTreeMap::new();
    let mut passed_hooks = 0;
    for execution in &executions {
        let passed = execution.passed.unwrap_or(false);
        if passed {
            passed_hooks += 1;
        }
        let bucket = by_type
            .entry(execution.hook_type.clone().unwrap_or_else(|| "unknown".to_string()))
            .or_default();
        bucket.0 += 1;
        if passed {
            bucket.1 += 1;
        }
    }

    let total_hooks = executions.len() as i64;
    HookStats {
        total_hooks,
        passed_hooks,
        failed_hooks: total_hooks - passed_hooks,
        pass_rate: if total_hooks == 0 {
            0.0
        } else {
            passed_hooks as f64 / total_hooks as f64
        },
        by_hook_type: by_type
            .into_iter()
            .map(|(hook_type, (total, passed))| HookTypeStat {
                hook_type,
                total,
                passed,
            })
            .collect(),
    }
}

/// Number of file changes, from whichever of the pushed counter and the
/// loaded list knows more
pub fn file_change_count(store: &Store, session_id: &str) -> i64 {
    let pushed = session(store, session_id)
        .and_then(|s| s.file_change_count)
        .unwrap_or(0);
    let listed = store
        .connection(&ConnectionKey::file_changes(session_id))
        .map_or(0, |c| c.total_count());
    pushed.max(listed)
}

/// Number of messages, same rule as [`file_change_count`]
pub fn message_count(store: &Store, session_id: &str) -> i64 {
    let pushed = session(store, session_id)
        .and_then(|s| s.message_count)
        .unwrap_or(0);
    let listed = store
        .connection(&ConnectionKey::messages(session_id))
        .map_or(0, |c| c.total_count());
    pushed.max(listed)
}

/// Latest timestamp among the session record and its loaded messages
pub fn last_activity(store: &Store, session_id: &str) -> Option<DateTime<Utc>> {
    let from_session = session(store, session_id).and_then(|s| s.updated_at.or(s.started_at));
    let from_messages = store
        .connection_nodes::<Message>(&ConnectionKey::messages(session_id))
        .into_iter()
        .filter_map(|m| m.timestamp)
        .max();
    from_session.max(from_messages)
}

/// Counts plus an "active" indicator, evaluated at `now`.
///
/// Active means a todo is in progress or there was activity within
/// [`ACTIVE_WINDOW_MINUTES`].
pub fn session_summary(store: &Store, session_id: &str, now: DateTime<Utc>) -> SessionSummary {
    let todo_counts = todo_counts(store, session_id);
    let last_activity = last_activity(store, session_id);
    let recent = last_activity
        .map_or(false, |at| now - at <= Duration::minutes(ACTIVE_WINDOW_MINUTES));

    SessionSummary {
        session_id: session_id.to_string(),
        session: session(store, session_id),
        message_count: message_count(store, session_id),
        file_change_count: file_change_count(store, session_id),
        todo_counts,
        hook_stats: hook_stats(store, session_id),
        last_activity,
        is_active: todo_counts.in_progress > 0 || recent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, Direction, Edge};
    use chrono::TimeZone;
    use serde_json::{json, Value};

    fn record(value: Value) -> crate::store::Record {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn hooks_page(nodes: Vec<Value>) -> Connection<Value> {
        Connection {
            edges: nodes
                .into_iter()
                .enumerate()
                .map(|(i, node)| Edge {
                    node,
                    cursor: format!("h{i}"),
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_hook_stats_buckets_by_type() {
        let mut store = Store::default();
        store
            .populate_connection(
                &ConnectionKey::hook_executions("S1"),
                hooks_page(vec![
                    json!({"id": "h1", "hookType": "Stop", "passed": true}),
                    json!({"id": "h2", "hookType": "Stop", "passed": false}),
                    json!({"id": "h3", "hookType": "PostToolUse", "passed": true}),
                    json!({"id": "h4", "hookType": "Stop", "passed": true}),
                ]),
                Direction::Forward,
            )
            .unwrap();

        let stats = hook_stats(&store, "S1");
        assert_eq!(stats.total_hooks, 4);
        assert_eq!(stats.passed_hooks, 3);
        assert_eq!(stats.failed_hooks, 1);
        assert!((stats.pass_rate - 0.75).abs() < f64::EPSILON);
        assert_eq!(
            stats.by_hook_type,
            vec![
                HookTypeStat {
                    hook_type: "PostToolUse".to_string(),
                    total: 1,
                    passed: 1
                },
                HookTypeStat {
                    hook_type: "Stop".to_string(),
                    total: 3,
                    passed: 2
                },
            ]
        );
    }

    #[test]
    fn test_hook_stats_empty() {
        let stats = hook_stats(&Store::default(), "S1");
        assert_eq!(stats.total_hooks, 0);
        assert_eq!(stats.pass_rate, 0.0);
        assert!(stats.by_hook_type.is_empty());
    }

    #[test]
    fn test_todo_counts_prefers_records() {
        let mut store = Store::default();
        store.upsert(
            EntityKind::Session,
            "S1",
            record(json!({"todoCounts": {"total": 9, "pending": 9, "inProgress": 0, "completed": 0}})),
        );
        assert_eq!(todo_counts(&store, "S1").total, 9);

        store.upsert(
            EntityKind::Todo,
            "t1",
            record(json!({"sessionId": "S1", "status": "in_progress"})),
        );
        store.upsert(
            EntityKind::Todo,
            "t2",
            record(json!({"sessionId": "S1", "status": "completed"})),
        );
        store.upsert(
            EntityKind::Todo,
            "t3",
            record(json!({"sessionId": "S2", "status": "pending"})),
        );
        assert_eq!(
            todo_counts(&store, "S1"),
            TodoCounts {
                total: 2,
                pending: 0,
                in_progress: 1,
                completed: 1
            }
        );
    }

    #[test]
    fn test_summary_is_deterministic_and_active() {
        let mut store = Store::default();
        store.upsert(
            EntityKind::Session,
            "Session:/p:S1",
            record(json!({
                "sessionId": "S1",
                "updatedAt": "2026-01-05T10:00:00Z",
                "fileChangeCount": 4
            })),
        );
        let now = Utc.with_ymd_and_hms(2026, 1, 5, 10, 3, 0).unwrap();

        let first = session_summary(&store, "S1", now);
        let second = session_summary(&store, "S1", now);
        assert_eq!(first, second);
        assert!(first.is_active);
        assert_eq!(first.file_change_count, 4);

        let later = Utc.with_ymd_and_hms(2026, 1, 5, 11, 0, 0).unwrap();
        assert!(!session_summary(&store, "S1", later).is_active);
    }
}
