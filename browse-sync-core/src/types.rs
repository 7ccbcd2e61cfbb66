//! Core domain types for browse-sync
//!
//! These types mirror the entities the coordinator exposes over GraphQL.
//! They are the typed view of records held in the normalized [`Store`](crate::store::Store);
//! every field that a partial payload may omit is optional.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Session** | One coding-agent run on a project, owned by the coordinator |
//! | **Message** | One line of the session transcript, ordered by `messageIndex` |
//! | **FileChange** | A file the agent touched, with hook validation state |
//! | **HookExecution** | One run of a plugin hook (lint, test, ...) |
//! | **Todo** | An item from the agent's todo list |
//! | **Task** | A tracked unit of work with outcome and confidence |
//! | **Checkpoint** | A snapshot taken for an agent or a session |
//!
//! Field names serialize in camelCase to match the coordinator's schema, so a
//! GraphQL node can be stored as-is and read back through these structs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================
// Entity kinds
// ============================================

/// Type of a normalized record. Identifiers are unique per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    Session,
    Message,
    FileChange,
    HookExecution,
    Todo,
    Task,
    Checkpoint,
    MemoryEvent,
}

impl EntityKind {
    /// GraphQL typename for this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Session => "Session",
            EntityKind::Message => "Message",
            EntityKind::FileChange => "FileChange",
            EntityKind::HookExecution => "HookExecution",
            EntityKind::Todo => "Todo",
            EntityKind::Task => "Task",
            EntityKind::Checkpoint => "Checkpoint",
            EntityKind::MemoryEvent => "MemoryEvent",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Session" => Ok(EntityKind::Session),
            "Message" => Ok(EntityKind::Message),
            "FileChange" => Ok(EntityKind::FileChange),
            "HookExecution" => Ok(EntityKind::HookExecution),
            "Todo" => Ok(EntityKind::Todo),
            "Task" => Ok(EntityKind::Task),
            "Checkpoint" => Ok(EntityKind::Checkpoint),
            "MemoryEvent" => Ok(EntityKind::MemoryEvent),
            _ => Err(format!("unknown entity kind: {}", s)),
        }
    }
}

// ============================================
// Sessions
// ============================================

/// A session as seen by the client. Created server-side, read-only here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Session {
    pub id: String,
    pub session_id: Option<String>,
    pub project_name: Option<String>,
    pub project_path: Option<String>,
    pub git_branch: Option<String>,
    pub summary: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub status: Option<String>,
    pub message_count: Option<i64>,
    pub file_change_count: Option<i64>,
    pub todo_counts: Option<TodoCounts>,
}

// ============================================
// Messages
// ============================================

/// A transcript message.
///
/// The coordinator sends a flat `messageType` plus an optional `toolName`;
/// [`Message::kind`] resolves the pair into a [`MessageKind`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Message {
    pub id: String,
    pub session_id: Option<String>,
    pub parent_id: Option<String>,
    pub agent_id: Option<String>,
    /// Position within the session; strictly increasing
    pub message_index: Option<i64>,
    pub message_type: Option<String>,
    pub tool_name: Option<String>,
    pub role: Option<String>,
    pub content: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub raw_json: Option<String>,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        MessageKind::discriminate(
            self.message_type.as_deref().unwrap_or_default(),
            self.tool_name.as_deref(),
            self.content.as_deref(),
            self.raw_json.as_deref(),
        )
    }

    /// Short single-line preview of the content
    pub fn preview(&self, max_chars: usize) -> String {
        let text = self.content.as_deref().unwrap_or_default();
        let line = text.lines().next().unwrap_or_default();
        if line.chars().count() <= max_chars {
            line.to_string()
        } else {
            let cut: String = line.chars().take(max_chars).collect();
            format!("{}...", cut)
        }
    }
}

/// Discriminated message variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    RegularUser,
    CommandUser,
    InterruptUser,
    MetaUser,
    ToolResultUser,
    Assistant,
    Summary,
    System,
    FileHistorySnapshot,
    HookRun,
    HookResult,
    HookCheckState,
    HookReference,
    HookValidation,
    HookScript,
    HookDatetime,
    HookFileChange,
    HookValidationCache,
    QueueOperation,
    McpToolCall,
    McpToolResult,
    ExposedToolCall,
    ExposedToolResult,
    MemoryQuery,
    MemoryLearn,
    SentimentAnalysis,
    Unknown,
}

impl MessageKind {
    /// Resolve the variant from the flat wire fields.
    ///
    /// `han_event` rows carry their real type in `tool_name`. User rows are
    /// split by content markers and the metadata flags found in `raw_json`.
    pub fn discriminate(
        message_type: &str,
        tool_name: Option<&str>,
        content: Option<&str>,
        raw_json: Option<&str>,
    ) -> Self {
        match message_type {
            "user" => Self::discriminate_user(content, raw_json),
            "assistant" => MessageKind::Assistant,
            "summary" => MessageKind::Summary,
            "system" => MessageKind::System,
            "file-history-snapshot" => MessageKind::FileHistorySnapshot,
            "hook_run" => MessageKind::HookRun,
            "hook_result" => MessageKind::HookResult,
            "queue-operation" => MessageKind::QueueOperation,
            "han_event" => Self::discriminate_event(tool_name),
            _ => MessageKind::Unknown,
        }
    }

    fn discriminate_user(content: Option<&str>, raw_json: Option<&str>) -> Self {
        if let Some(content) = content {
            if content.starts_with("This session is being continued from a previous conversation") {
                return MessageKind::Summary;
            }
        }

        let raw: Option<serde_json::Value> = raw_json.and_then(|r| serde_json::from_str(r).ok());
        let Some(raw) = raw else {
            return MessageKind::RegularUser;
        };

        let blocks = raw.pointer("/message/content").and_then(|c| c.as_array());
        if let Some(blocks) = blocks {
            let all_tool_results = !blocks.is_empty()
                && blocks
                    .iter()
                    .all(|b| b.get("type").and_then(|t| t.as_str()) == Some("tool_result"));
            if all_tool_results {
                return MessageKind::ToolResultUser;
            }
        }

        let text = raw
            .pointer("/message/content")
            .and_then(|c| c.as_str())
            .unwrap_or_default();
        if text.contains("<command-name>") {
            MessageKind::CommandUser
        } else if text.starts_with("[Request interrupted") {
            MessageKind::InterruptUser
        } else if raw.get("isMeta").and_then(|m| m.as_bool()) == Some(true) {
            MessageKind::MetaUser
        } else {
            MessageKind::RegularUser
        }
    }

    fn discriminate_event(tool_name: Option<&str>) -> Self {
        match tool_name {
            Some("hook_run") => MessageKind::HookRun,
            Some("hook_result") => MessageKind::HookResult,
            Some("hook_check_state") => MessageKind::HookCheckState,
            Some("hook_reference") => MessageKind::HookReference,
            Some("hook_validation") => MessageKind::HookValidation,
            Some("hook_script") => MessageKind::HookScript,
            Some("hook_datetime") => MessageKind::HookDatetime,
            Some("hook_file_change") => MessageKind::HookFileChange,
            Some("hook_validation_cache") => MessageKind::HookValidationCache,
            Some("queue_operation") => MessageKind::QueueOperation,
            Some("mcp_tool_call") => MessageKind::McpToolCall,
            Some("mcp_tool_result") => MessageKind::McpToolResult,
            Some("exposed_tool_call") => MessageKind::ExposedToolCall,
            Some("exposed_tool_result") => MessageKind::ExposedToolResult,
            Some("memory_query") => MessageKind::MemoryQuery,
            Some("memory_learn") => MessageKind::MemoryLearn,
            Some("sentiment_analysis") => MessageKind::SentimentAnalysis,
            _ => MessageKind::Unknown,
        }
    }

    /// Short label for list rendering
    pub fn label(&self) -> &'static str {
        match self {
            MessageKind::RegularUser
            | MessageKind::CommandUser
            | MessageKind::InterruptUser
            | MessageKind::MetaUser
            | MessageKind::ToolResultUser => "user",
            MessageKind::Assistant => "assistant",
            MessageKind::Summary => "summary",
            MessageKind::System | MessageKind::FileHistorySnapshot | MessageKind::QueueOperation => {
                "system"
            }
            MessageKind::HookRun
            | MessageKind::HookResult
            | MessageKind::HookCheckState
            | MessageKind::HookReference
            | MessageKind::HookValidation
            | MessageKind::HookScript
            | MessageKind::HookDatetime
            | MessageKind::HookFileChange
            | MessageKind::HookValidationCache => "hook",
            MessageKind::McpToolCall
            | MessageKind::McpToolResult
            | MessageKind::ExposedToolCall
            | MessageKind::ExposedToolResult => "tool",
            MessageKind::MemoryQuery | MessageKind::MemoryLearn => "memory",
            MessageKind::SentimentAnalysis => "sentiment",
            MessageKind::Unknown => "event",
        }
    }
}

// ============================================
// File changes
// ============================================

/// What happened to a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileChangeAction {
    Created,
    Modified,
    Deleted,
}

impl FileChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileChangeAction::Created => "created",
            FileChangeAction::Modified => "modified",
            FileChangeAction::Deleted => "deleted",
        }
    }
}

/// A file change recorded during a session. Validation state may be
/// superseded by later payloads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileChange {
    pub id: String,
    pub session_id: Option<String>,
    pub file_path: Option<String>,
    pub action: Option<FileChangeAction>,
    pub tool_name: Option<String>,
    pub recorded_at: Option<DateTime<Utc>>,
    pub is_validated: Option<bool>,
    pub validations: Option<Vec<FileValidation>>,
    pub missing_validations: Option<Vec<FileValidation>>,
}

/// A hook that validated (or should validate) a file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileValidation {
    pub plugin_name: Option<String>,
    pub hook_name: Option<String>,
    pub validated_at: Option<DateTime<Utc>>,
    pub directory: Option<String>,
}

// ============================================
// Todos
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    #[serde(alias = "PENDING")]
    Pending,
    #[serde(alias = "IN_PROGRESS")]
    InProgress,
    #[serde(alias = "COMPLETED")]
    Completed,
}

/// Todo item from the agent's todo list
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Todo {
    pub id: String,
    pub session_id: Option<String>,
    pub content: Option<String>,
    pub status: Option<TodoStatus>,
    /// Present-tense text shown while the todo is in progress
    pub active_form: Option<String>,
}

/// Todo counts by status (derived aggregate)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TodoCounts {
    pub total: i64,
    pub pending: i64,
    pub in_progress: i64,
    pub completed: i64,
}

// ============================================
// Tasks
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Fix,
    Implementation,
    Refactor,
    Research,
}

/// A tracked unit of work
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Task {
    pub id: String,
    pub session_id: Option<String>,
    pub task_id: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub task_type: Option<TaskType>,
    pub status: Option<TaskStatus>,
    pub outcome: Option<String>,
    pub confidence: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
}

// ============================================
// Hooks
// ============================================

/// One execution of a plugin hook
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HookExecution {
    pub id: String,
    pub session_id: Option<String>,
    /// Hook event type (Stop, PostToolUse, ...)
    pub hook_type: Option<String>,
    pub hook_name: Option<String>,
    /// Plugin that provided the hook
    pub hook_source: Option<String>,
    pub passed: Option<bool>,
    pub duration_ms: Option<i64>,
    pub exit_code: Option<i64>,
    pub executed_at: Option<DateTime<Utc>>,
}

/// Aggregated hook results, bucketed by hook type (derived aggregate)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookStats {
    pub total_hooks: i64,
    pub passed_hooks: i64,
    pub failed_hooks: i64,
    /// passed / total, 0.0 when there are no executions
    pub pass_rate: f64,
    pub by_hook_type: Vec<HookTypeStat>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookTypeStat {
    pub hook_type: String,
    pub total: i64,
    pub passed: i64,
}

// ============================================
// Checkpoints
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    Agent,
    Session,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Checkpoint {
    pub id: String,
    #[serde(rename = "type")]
    pub checkpoint_type: Option<CheckpointType>,
    pub created_at: Option<DateTime<Utc>>,
    pub file_count: Option<i64>,
    pub pattern_count: Option<i64>,
}

// ============================================
// Memory
// ============================================

/// Payload of the global `memoryUpdated` topic
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryEvent {
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub action: Option<String>,
    pub path: Option<String>,
    pub timestamp: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_kind_roundtrip_names() {
        for kind in [
            EntityKind::Session,
            EntityKind::Message,
            EntityKind::FileChange,
            EntityKind::HookExecution,
            EntityKind::Todo,
            EntityKind::Task,
            EntityKind::Checkpoint,
            EntityKind::MemoryEvent,
        ] {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
        }
        assert!("Widget".parse::<EntityKind>().is_err());
    }

    #[test]
    fn test_discriminate_event_messages() {
        let kind = MessageKind::discriminate("han_event", Some("hook_result"), None, None);
        assert_eq!(kind, MessageKind::HookResult);
        let kind = MessageKind::discriminate("han_event", Some("mcp_tool_call"), None, None);
        assert_eq!(kind, MessageKind::McpToolCall);
        let kind = MessageKind::discriminate("han_event", Some("something_new"), None, None);
        assert_eq!(kind, MessageKind::Unknown);
        let kind = MessageKind::discriminate("mystery", None, None, None);
        assert_eq!(kind, MessageKind::Unknown);
    }

    #[test]
    fn test_discriminate_user_messages() {
        assert_eq!(
            MessageKind::discriminate("user", None, Some("hello"), None),
            MessageKind::RegularUser
        );
        assert_eq!(
            MessageKind::discriminate(
                "user",
                None,
                Some("This session is being continued from a previous conversation that ran out"),
                None
            ),
            MessageKind::Summary
        );

        let tool_result = r#"{"message":{"content":[{"type":"tool_result","content":"ok"}]}}"#;
        assert_eq!(
            MessageKind::discriminate("user", None, None, Some(tool_result)),
            MessageKind::ToolResultUser
        );

        let command = r#"{"message":{"content":"<command-name>/clear</command-name>"}}"#;
        assert_eq!(
            MessageKind::discriminate("user", None, None, Some(command)),
            MessageKind::CommandUser
        );

        let meta = r#"{"isMeta":true,"message":{"content":"caveat"}}"#;
        assert_eq!(
            MessageKind::discriminate("user", None, None, Some(meta)),
            MessageKind::MetaUser
        );
    }

    #[test]
    fn test_message_deserializes_from_graphql_node() {
        let node = serde_json::json!({
            "id": "Message:m1",
            "messageIndex": 3,
            "messageType": "assistant",
            "content": "Done.\nSecond line",
            "timestamp": "2026-01-05T10:00:00Z"
        });
        let msg: Message = serde_json::from_value(node).unwrap();
        assert_eq!(msg.message_index, Some(3));
        assert_eq!(msg.kind(), MessageKind::Assistant);
        assert_eq!(msg.preview(80), "Done.");
        assert_eq!(msg.preview(2), "Do...");
    }

    #[test]
    fn test_task_enums_use_schema_casing() {
        let task: Task = serde_json::from_value(serde_json::json!({
            "id": "Task:t1",
            "type": "REFACTOR",
            "status": "ACTIVE"
        }))
        .unwrap();
        assert_eq!(task.task_type, Some(TaskType::Refactor));
        assert_eq!(task.status, Some(TaskStatus::Active));
    }
}
