//! Subscription topics and their typed payloads
//!
//! Each [`Topic`] knows its GraphQL document and variables. The payload
//! structs mirror what the coordinator pushes in the `data` of a `next` frame,
//! keyed by the topic's root field.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::connection::Edge;
use crate::protocol::SubscribePayload;

/// Node fields requested for messages, shared with page queries
pub const MESSAGE_FIELDS: &str =
    "id sessionId parentId agentId messageIndex messageType toolName role content timestamp rawJson";

/// Node fields requested for file changes
pub const FILE_CHANGE_FIELDS: &str = "id sessionId filePath action toolName recordedAt isValidated \
     validations { pluginName hookName validatedAt directory } \
     missingValidations { pluginName hookName directory }";

/// Node fields requested for hook executions
pub const HOOK_EXECUTION_FIELDS: &str =
    "id hookType hookName hookSource passed durationMs exitCode executedAt";

/// Node fields requested for sessions
pub const SESSION_FIELDS: &str = "id sessionId projectName projectPath gitBranch summary \
     startedAt updatedAt status messageCount \
     todoCounts { total pending inProgress completed }";

/// Node fields requested for todos
pub const TODO_FIELDS: &str = "id content status activeForm";

/// Node fields requested for tasks
pub const TASK_FIELDS: &str = "id taskId description type status outcome confidence \
     startedAt completedAt durationSeconds";

/// Node fields requested for checkpoints
pub const CHECKPOINT_FIELDS: &str = "id type createdAt fileCount patternCount";

/// A server-side event stream the client can subscribe to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    SessionMessageAdded { session_id: String },
    SessionFilesChanged { session_id: String },
    SessionHooksChanged { session_id: String },
    SessionTodosChanged { session_id: String },
    /// New sessions, optionally limited to one project
    SessionAdded { project_id: Option<String> },
    NodeUpdated { id: String },
    MemoryUpdated,
}

impl Topic {
    /// The four per-session topics a session view needs
    pub fn for_session(session_id: &str) -> Vec<Topic> {
        let session_id = session_id.to_string();
        vec![
            Topic::SessionMessageAdded {
                session_id: session_id.clone(),
            },
            Topic::SessionFilesChanged {
                session_id: session_id.clone(),
            },
            Topic::SessionHooksChanged {
                session_id: session_id.clone(),
            },
            Topic::SessionTodosChanged { session_id },
        ]
    }

    /// Root subscription field name
    pub fn field(&self) -> &'static str {
        match self {
            Topic::SessionMessageAdded { .. } => "sessionMessageAdded",
            Topic::SessionFilesChanged { .. } => "sessionFilesChanged",
            Topic::SessionHooksChanged { .. } => "sessionHooksChanged",
            Topic::SessionTodosChanged { .. } => "sessionTodosChanged",
            Topic::SessionAdded { .. } => "sessionAdded",
            Topic::NodeUpdated { .. } => "nodeUpdated",
            Topic::MemoryUpdated => "memoryUpdated",
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Topic::SessionMessageAdded { session_id }
            | Topic::SessionFilesChanged { session_id }
            | Topic::SessionHooksChanged { session_id }
            | Topic::SessionTodosChanged { session_id } => Some(session_id),
            _ => None,
        }
    }

    pub fn query(&self) -> String {
        match self {
            Topic::SessionMessageAdded { .. } => format!(
                "subscription SessionMessageAdded($sessionId: ID!) {{ \
                 sessionMessageAdded(sessionId: $sessionId) {{ sessionId messageIndex \
                 newMessageEdge {{ cursor node {{ {MESSAGE_FIELDS} }} }} }} }}"
            ),
            Topic::SessionFilesChanged { .. } => "subscription SessionFilesChanged($sessionId: ID!) { \
                 sessionFilesChanged(sessionId: $sessionId) { sessionId fileCount toolName } }"
                .to_string(),
            Topic::SessionHooksChanged { .. } => "subscription SessionHooksChanged($sessionId: ID!) { \
                 sessionHooksChanged(sessionId: $sessionId) { sessionId pluginName hookName eventType } }"
                .to_string(),
            Topic::SessionTodosChanged { .. } => "subscription SessionTodosChanged($sessionId: ID!) { \
                 sessionTodosChanged(sessionId: $sessionId) { sessionId todoCount inProgressCount completedCount } }"
                .to_string(),
            Topic::SessionAdded { .. } => format!(
                "subscription SessionAdded($projectId: ID) {{ \
                 sessionAdded(projectId: $projectId) {{ sessionId parentId projectId \
                 newSessionEdge {{ cursor node {{ {SESSION_FIELDS} }} }} }} }}"
            ),
            Topic::NodeUpdated { .. } => "subscription NodeUpdated($id: ID!) { \
                 nodeUpdated(id: $id) { id typename } }"
                .to_string(),
            Topic::MemoryUpdated => "subscription MemoryUpdated { \
                 memoryUpdated { type action path timestamp } }"
                .to_string(),
        }
    }

    pub fn variables(&self) -> Value {
        match self {
            Topic::SessionMessageAdded { session_id }
            | Topic::SessionFilesChanged { session_id }
            | Topic::SessionHooksChanged { session_id }
            | Topic::SessionTodosChanged { session_id } => json!({ "sessionId": session_id }),
            Topic::SessionAdded { project_id } => json!({ "projectId": project_id }),
            Topic::NodeUpdated { id } => json!({ "id": id }),
            Topic::MemoryUpdated => Value::Null,
        }
    }

    /// Body of the `subscribe` frame for this topic
    pub fn subscribe_payload(&self) -> SubscribePayload {
        SubscribePayload {
            query: self.query(),
            variables: self.variables(),
            operation_name: None,
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Topic::SessionAdded { project_id: None } | Topic::MemoryUpdated => {
                f.write_str(self.field())
            }
            Topic::SessionAdded {
                project_id: Some(id),
            }
            | Topic::NodeUpdated { id } => write!(f, "{}({})", self.field(), id),
            _ => write!(f, "{}({})", self.field(), self.session_id().unwrap_or_default()),
        }
    }
}

// ============================================
// Payloads
// ============================================

/// `sessionMessageAdded`: a message was appended to a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessageAdded {
    pub session_id: String,
    pub message_index: i64,
    #[serde(default)]
    pub new_message_edge: Option<Edge<Value>>,
}

/// `sessionFilesChanged`: the file change list grew
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionFilesChanged {
    pub session_id: String,
    pub file_count: i64,
    #[serde(default)]
    pub tool_name: Option<String>,
}

/// `sessionHooksChanged`: a hook ran
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHooksChanged {
    pub session_id: String,
    #[serde(default)]
    pub plugin_name: Option<String>,
    #[serde(default)]
    pub hook_name: Option<String>,
    #[serde(default)]
    pub event_type: Option<String>,
}

/// `sessionTodosChanged`: todo counts after the change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTodosChanged {
    pub session_id: String,
    pub todo_count: i64,
    #[serde(default)]
    pub in_progress_count: i64,
    #[serde(default)]
    pub completed_count: i64,
}

/// `sessionAdded`: a new session appeared
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAdded {
    pub session_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub new_session_edge: Option<Edge<Value>>,
}

/// `nodeUpdated`: a node changed and should be refetched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeUpdated {
    pub id: String,
    pub typename: String,
}
