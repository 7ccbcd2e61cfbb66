//! Plain-text rendering for the CLI views.

use browse_sync_core::format::{duration_ms, one_line, ratio, relative_time_opt};
use browse_sync_core::projection::SessionSummary;
use browse_sync_core::{FileChange, HookExecution, Message, MessageKind};
use chrono::{DateTime, Utc};

const PREVIEW_CHARS: usize = 80;

/// Role column for a message row.
pub fn message_label(msg: &Message) -> &'static str {
    match msg.kind() {
        // Tool results arrive as user rows; label them by what they carry.
        MessageKind::ToolResultUser => "tool",
        kind => kind.label(),
    }
}

/// Preview text for a message row.
pub fn message_preview(msg: &Message) -> String {
    match msg.tool_name.as_deref() {
        Some(tool) if msg.kind() != MessageKind::Assistant => {
            format!("{}: {}", tool, one_line(&msg.preview(PREVIEW_CHARS), 60))
        }
        _ => one_line(msg.content.as_deref().unwrap_or_default(), PREVIEW_CHARS),
    }
}

/// One row of the transcript
pub fn message_line(msg: &Message, now: DateTime<Utc>) -> String {
    let index = msg
        .message_index
        .map_or_else(|| "-".to_string(), |i| i.to_string());
    format!(
        "{:>5}  {:<10}  {:>8}  {}",
        index,
        message_label(msg),
        relative_time_opt(msg.timestamp, now),
        message_preview(msg)
    )
}

/// One row of the file change list
pub fn file_change_line(change: &FileChange, now: DateTime<Utc>) -> String {
    let action = change.action.map_or("?", |a| a.as_str());
    let validated = match change.is_validated {
        Some(true) => "validated",
        Some(false) => "unvalidated",
        None => "",
    };
    format!(
        "{:<9}  {:<40}  {:<12}  {:>8}  {}",
        action,
        change.file_path.as_deref().unwrap_or("<unknown>"),
        change.tool_name.as_deref().unwrap_or("-"),
        relative_time_opt(change.recorded_at, now),
        validated
    )
}

/// One row of the hook list
pub fn hook_line(hook: &HookExecution) -> String {
    let result = match hook.passed {
        Some(true) => "pass",
        Some(false) => "FAIL",
        None => "?",
    };
    format!(
        "{:<4}  {:<14}  {:<24}  {}",
        result,
        hook.hook_type.as_deref().unwrap_or("-"),
        hook.hook_name.as_deref().unwrap_or("-"),
        hook.duration_ms.map(duration_ms).unwrap_or_default()
    )
}

/// Header block for a session
pub fn summary_lines(summary: &SessionSummary, now: DateTime<Utc>) -> Vec<String> {
    let mut lines = Vec::new();
    let title = summary
        .session
        .as_ref()
        .and_then(|s| s.summary.clone().or_else(|| s.project_name.clone()))
        .unwrap_or_else(|| summary.session_id.clone());
    let marker = if summary.is_active { "*" } else { " " };
    lines.push(format!("{} {}", marker, one_line(&title, PREVIEW_CHARS)));

    if let Some(session) = &summary.session {
        if let Some(path) = &session.project_path {
            let branch = session.git_branch.as_deref().unwrap_or("-");
            lines.push(format!("  Project:   {} ({})", path, branch));
        }
    }

    let todos = &summary.todo_counts;
    let hooks = &summary.hook_stats;
    lines.push(format!("  Messages:  {}", summary.message_count));
    lines.push(format!("  Files:     {}", summary.file_change_count));
    lines.push(format!(
        "  Todos:     {} total, {} in progress, {} done",
        todos.total, todos.in_progress, todos.completed
    ));
    lines.push(format!(
        "  Hooks:     {} passed",
        ratio(hooks.passed_hooks, hooks.total_hooks)
    ));
    lines.push(format!(
        "  Activity:  {}",
        relative_time_opt(summary.last_activity, now)
    ));
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use browse_sync_core::{FileChangeAction, HookStats, TodoCounts};

    fn message(message_type: &str, content: &str) -> Message {
        Message {
            id: "m1".to_string(),
            message_index: Some(7),
            message_type: Some(message_type.to_string()),
            content: Some(content.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_message_line_flattens_content() {
        let now = Utc::now();
        let line = message_line(&message("assistant", "first\nsecond"), now);
        assert!(line.contains("first second"), "{line}");
        assert!(line.trim_start().starts_with('7'));
    }

    #[test]
    fn test_file_change_line() {
        let change = FileChange {
            id: "f1".to_string(),
            file_path: Some("src/main.rs".to_string()),
            action: Some(FileChangeAction::Modified),
            is_validated: Some(false),
            ..Default::default()
        };
        let line = file_change_line(&change, Utc::now());
        assert!(line.starts_with("modified"));
        assert!(line.contains("src/main.rs"));
        assert!(line.ends_with("unvalidated"));
    }

    #[test]
    fn test_summary_lines_mark_active() {
        let summary = SessionSummary {
            session_id: "S1".to_string(),
            session: None,
            message_count: 3,
            file_change_count: 1,
            todo_counts: TodoCounts {
                total: 2,
                pending: 1,
                in_progress: 1,
                completed: 0,
            },
            hook_stats: HookStats::default(),
            last_activity: None,
            is_active: true,
        };
        let lines = summary_lines(&summary, Utc::now());
        assert_eq!(lines[0], "* S1");
        assert!(lines.iter().any(|l| l == "  Messages:  3"));
        assert!(lines.iter().any(|l| l == "  Hooks:     0/0 passed"));
    }
}
