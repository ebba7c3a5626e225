use super::*;
use crate::config::Config;
use crate::tools::{ToolExecutor, ToolRegistry};
use serde_json::json;
use std::sync::Arc;

fn setup_executor(dir: &Path) -> (ToolExecutor, Subscription<ToolEvent>) {
    let events = Broker::new("tools", 1024);
    let subscription = events.subscribe();
    let registry = Arc::new(ToolRegistry::builtin(&Config::new(dir), None));
    (ToolExecutor::new(registry, dir, events), subscription)
}

#[tokio::test]
async fn test_execute_publishes_lifecycle() {
    let temp_dir = create_temp_dir().await;
    create_temp_file(temp_dir.path(), "a.txt", "alpha").await;
    let (executor, mut events) = setup_executor(temp_dir.path());

    let response = executor
        .execute("s1", &tool_call("view", json!({"file_path": "a.txt"})), &CancellationToken::new())
        .await;
    assert!(!response.is_error());
    assert!(response.content().contains("alpha"));

    let events = collect_events(&mut events);
    assert!(matches!(
        &events[0],
        ToolEvent::Begin { session_id, tool, summary, .. }
            if session_id == "s1" && tool == "view" && summary == "view a.txt"
    ));
    assert_eq!(count_progress_events(&events), 1);
    assert!(matches!(find_tool_end_event(&events), Some((true, _))));
}

#[tokio::test]
async fn test_unknown_tool_is_error_response() {
    let temp_dir = create_temp_dir().await;
    let (executor, mut events) = setup_executor(temp_dir.path());

    let response = executor
        .execute("s1", &tool_call("deploy", json!({})), &CancellationToken::new())
        .await;
    assert!(response.is_error());
    assert_eq!(response.content(), "Invalid parameters: Tool not found: deploy");

    let events = collect_events(&mut events);
    assert_eq!(events.len(), 2);
    assert!(matches!(find_tool_end_event(&events), Some((false, _))));
}

#[tokio::test]
async fn test_invalid_arguments_never_reach_the_tool() {
    let temp_dir = create_temp_dir().await;
    let (executor, mut events) = setup_executor(temp_dir.path());

    let response = executor
        .execute("s1", &tool_call("write", json!({"file_path": "x.txt"})), &CancellationToken::new())
        .await;
    assert!(response.is_error());
    assert!(response.content().contains("Missing required field: content"));
    assert!(!temp_dir.path().join("x.txt").exists());
    assert_eq!(count_progress_events(&collect_events(&mut events)), 0);
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let temp_dir = create_temp_dir().await;
    let (executor, _events) = setup_executor(temp_dir.path());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let response = executor
        .execute("s1", &tool_call("bash", json!({"command": "touch ran"})), &cancel)
        .await;
    assert!(response.is_error());
    assert_eq!(response.content(), "Tool call was cancelled");
    assert!(!temp_dir.path().join("ran").exists());
}

#[tokio::test]
async fn test_output_is_capped() {
    let temp_dir = create_temp_dir().await;
    create_temp_file(temp_dir.path(), "big.txt", &"é".repeat(100)).await;
    let (executor, _events) = setup_executor(temp_dir.path());
    let executor = executor.with_max_output(22);

    let response = executor
        .execute("s1", &tool_call("view", json!({"file_path": "big.txt"})), &CancellationToken::new())
        .await;

    // Byte 22 falls inside a two-byte char, so the cut backs off to 21
    let expected = format!("     1|{}\n\n[Output truncated: 21 of 208 bytes shown]", "é".repeat(7));
    assert_eq!(response.content(), expected);
}
