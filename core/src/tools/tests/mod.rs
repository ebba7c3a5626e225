pub mod executor_tests;
pub mod glob_tests;
pub mod shell_tests;

// Test utilities
use crate::events::{Broker, Subscription, ToolEvent};
use crate::tools::{ToolCall, ToolContext};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio_util::sync::CancellationToken;

/// Test helper to create a temporary directory
pub async fn create_temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Test helper to create a file, and its parent directories, with content
pub async fn create_temp_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.expect("Failed to create parent directories");
    }
    fs::write(&path, content).await.expect("Failed to write temp file");
    path
}

/// Test helper to build a tool context rooted at `dir` plus a subscription
/// to the tool events it publishes
pub fn setup_context(dir: &Path) -> (ToolContext, Subscription<ToolEvent>) {
    let events = Broker::new("tools", 1024);
    let subscription = events.subscribe();
    let ctx = ToolContext {
        session_id: "test-session".to_string(),
        working_dir: dir.to_path_buf(),
        cancel: CancellationToken::new(),
        events,
    };
    (ctx, subscription)
}

pub fn tool_call(name: &str, input: Value) -> ToolCall {
    ToolCall {
        id: "test_id".to_string(),
        name: name.to_string(),
        input,
    }
}

/// Test helper to drain every event published so far
pub fn collect_events(subscription: &mut Subscription<ToolEvent>) -> Vec<ToolEvent> {
    let mut events = Vec::new();
    while let Some(event) = subscription.try_recv() {
        events.push(event);
    }
    events
}

pub fn count_progress_events(events: &[ToolEvent]) -> usize {
    events.iter().filter(|e| matches!(e, ToolEvent::Progress { .. })).count()
}

pub fn count_stdout_events(events: &[ToolEvent]) -> usize {
    events.iter().filter(|e| matches!(e, ToolEvent::Stdout { .. })).count()
}

pub fn count_stderr_events(events: &[ToolEvent]) -> usize {
    events.iter().filter(|e| matches!(e, ToolEvent::Stderr { .. })).count()
}

/// Test helper to find the tool end event
pub fn find_tool_end_event(events: &[ToolEvent]) -> Option<(bool, u64)> {
    events.iter().find_map(|event| match event {
        ToolEvent::End { ok, duration_ms, .. } => Some((*ok, *duration_ms)),
        _ => None,
    })
}

pub fn ripgrep_available() -> bool {
    std::process::Command::new("rg")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// File names in a result list, sorted
pub fn file_names(paths: &[PathBuf]) -> Vec<String> {
    let mut names: Vec<String> = paths
        .iter()
        .filter_map(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
