use super::*;
use crate::tools::executors::BashTool;
use crate::tools::types::BashMetadata;
use crate::tools::{Tool, ToolError};
use serde_json::json;
use std::time::{Duration, Instant};

fn metadata(response: &crate::tools::ToolResponse) -> BashMetadata {
    serde_json::from_value(response.metadata.clone().unwrap()).unwrap()
}

#[tokio::test]
async fn test_bash_success_streams_stdout() {
    let temp_dir = create_temp_dir().await;
    let (ctx, mut events) = setup_context(temp_dir.path());

    let response = BashTool::new()
        .run(&ctx, &tool_call("bash", json!({"command": "echo 'Hello, World!'"})))
        .await
        .unwrap();

    assert!(!response.is_error());
    assert_eq!(response.content(), "Hello, World!");
    let metadata = metadata(&response);
    assert_eq!(metadata.exit_code, 0);
    assert!(!metadata.timed_out);

    let events = collect_events(&mut events);
    assert_eq!(count_progress_events(&events), 1);
    assert_eq!(count_stdout_events(&events), 1);
}

#[tokio::test]
async fn test_bash_runs_in_working_dir() {
    let temp_dir = create_temp_dir().await;
    create_temp_file(temp_dir.path(), "marker.txt", "").await;
    let (ctx, _events) = setup_context(temp_dir.path());

    let response = BashTool::new()
        .run(&ctx, &tool_call("bash", json!({"command": "ls"})))
        .await
        .unwrap();
    assert!(response.content().contains("marker.txt"));
}

#[tokio::test]
async fn test_bash_stderr_and_exit_code() {
    let temp_dir = create_temp_dir().await;
    let (ctx, mut events) = setup_context(temp_dir.path());

    let response = BashTool::new()
        .run(&ctx, &tool_call("bash", json!({"command": "echo out; echo err >&2; exit 3"})))
        .await
        .unwrap();

    assert!(response.is_error());
    assert!(response.content().contains("out"));
    assert!(response.content().contains("err"));
    assert!(response.content().ends_with("Exit code 3"));
    assert_eq!(metadata(&response).exit_code, 3);
    assert_eq!(count_stderr_events(&collect_events(&mut events)), 1);
}

#[tokio::test]
async fn test_bash_non_utf8_output_is_kept() {
    let temp_dir = create_temp_dir().await;
    let (ctx, mut events) = setup_context(temp_dir.path());

    let response = BashTool::new()
        .run(&ctx, &tool_call("bash", json!({"command": "printf 'a\\377b\\n'; echo after"})))
        .await
        .unwrap();
    assert!(!response.is_error());
    assert_eq!(response.content(), "a\u{FFFD}b\nafter");
    assert_eq!(count_stdout_events(&collect_events(&mut events)), 2);
}

#[tokio::test]
async fn test_bash_empty_output() {
    let temp_dir = create_temp_dir().await;
    let (ctx, _events) = setup_context(temp_dir.path());

    let response = BashTool::new()
        .run(&ctx, &tool_call("bash", json!({"command": "true"})))
        .await
        .unwrap();
    assert_eq!(response.content(), "no output");
}

#[tokio::test]
async fn test_bash_timeout_kills_command() {
    let temp_dir = create_temp_dir().await;
    let (ctx, _events) = setup_context(temp_dir.path());
    let start = Instant::now();

    let response = BashTool::new()
        .run(&ctx, &tool_call("bash", json!({"command": "sleep 10", "timeout": 200})))
        .await
        .unwrap();

    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(response.is_error());
    assert!(response.content().contains("timed out after 200 ms"));
    assert!(metadata(&response).timed_out);
}

#[tokio::test]
async fn test_bash_default_timeout_override() {
    let temp_dir = create_temp_dir().await;
    let (ctx, _events) = setup_context(temp_dir.path());

    let response = BashTool::new()
        .with_default_timeout(Duration::from_millis(100))
        .run(&ctx, &tool_call("bash", json!({"command": "sleep 10"})))
        .await
        .unwrap();
    assert!(metadata(&response).timed_out);
}

#[tokio::test]
async fn test_bash_cancel_stops_command() {
    let temp_dir = create_temp_dir().await;
    let (ctx, _events) = setup_context(temp_dir.path());
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });
    let start = Instant::now();

    let result = BashTool::new()
        .run(&ctx, &tool_call("bash", json!({"command": "sleep 10"})))
        .await;

    assert_eq!(result, Err(ToolError::Cancelled));
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_bash_refuses_network_commands() {
    let temp_dir = create_temp_dir().await;
    let (ctx, _events) = setup_context(temp_dir.path());

    let response = BashTool::new()
        .run(&ctx, &tool_call("bash", json!({"command": "curl https://example.com"})))
        .await
        .unwrap();
    assert!(response.is_error());
    assert_eq!(response.content(), "Command 'curl' is not allowed");
}

#[tokio::test]
async fn test_bash_empty_command() {
    let temp_dir = create_temp_dir().await;
    let (ctx, _events) = setup_context(temp_dir.path());

    let result = BashTool::new()
        .run(&ctx, &tool_call("bash", json!({"command": "   "})))
        .await;
    assert!(matches!(result, Err(ToolError::Parameter(_))));
}
