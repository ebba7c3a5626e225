use super::*;
use crate::tools::executors::glob::{glob_files, glob_with_ripgrep, glob_with_walk, GlobMatches};
use crate::tools::executors::GlobTool;
use crate::tools::types::GlobMetadata;
use crate::tools::Tool;
use serde_json::json;

async fn go_repo() -> tempfile::TempDir {
    let dir = create_temp_dir().await;
    for name in ["a.go", "b.go", "c.go", "vendor/x.go", "vendor/y.go", "src/d.go", ".hidden.go", ".config/e.go"] {
        create_temp_file(dir.path(), name, "package main\n").await;
    }
    dir
}

async fn numbered_files(count: usize) -> tempfile::TempDir {
    let dir = create_temp_dir().await;
    for i in 0..count {
        create_temp_file(dir.path(), &format!("file{}.txt", i), "x").await;
    }
    dir
}

/// Both search strategies, so each property is checked on each path
async fn both_paths(pattern: &str, root: &Path, limit: usize) -> Vec<(&'static str, GlobMatches)> {
    let cancel = CancellationToken::new();
    let mut results = vec![("walk", glob_with_walk(pattern, root, limit, &cancel).await.unwrap())];
    if ripgrep_available() {
        results.push(("ripgrep", glob_with_ripgrep(pattern, root, limit, &cancel).await.unwrap()));
    }
    results
}

#[tokio::test]
async fn test_top_level_pattern_skips_vendor() {
    let dir = go_repo().await;
    for (path, matches) in both_paths("*.go", dir.path(), 100).await {
        assert_eq!(file_names(&matches.files), vec!["a.go", "b.go", "c.go"], "{} path", path);
        assert!(!matches.truncated);
    }
}

#[tokio::test]
async fn test_recursive_pattern_skips_hidden_and_ignored() {
    let dir = go_repo().await;
    for (path, matches) in both_paths("**/*.go", dir.path(), 100).await {
        assert_eq!(file_names(&matches.files), vec!["a.go", "b.go", "c.go", "d.go"], "{} path", path);
        assert!(matches.files.iter().all(|f| f.is_absolute()));
    }
}

#[tokio::test]
async fn test_limit_below_match_count_truncates() {
    let dir = numbered_files(5).await;
    for (path, matches) in both_paths("*.txt", dir.path(), 3).await {
        assert_eq!(matches.files.len(), 3, "{} path", path);
        assert!(matches.truncated, "{} path", path);
    }
}

#[tokio::test]
async fn test_limit_at_or_above_match_count_returns_all() {
    let dir = numbered_files(5).await;
    for limit in [5, 10] {
        for (path, matches) in both_paths("*.txt", dir.path(), limit).await {
            assert_eq!(matches.files.len(), 5, "{} path", path);
            assert!(!matches.truncated, "{} path", path);
        }
    }
}

#[tokio::test]
async fn test_walk_orders_newest_first() {
    let dir = create_temp_dir().await;
    let old = create_temp_file(dir.path(), "old.rs", "").await;
    let new = create_temp_file(dir.path(), "new.rs", "").await;
    let earlier = std::time::SystemTime::now() - std::time::Duration::from_secs(3600);
    std::fs::File::options()
        .write(true)
        .open(&old)
        .unwrap()
        .set_modified(earlier)
        .unwrap();

    let matches = glob_with_walk("*.rs", dir.path(), 10, &CancellationToken::new()).await.unwrap();
    assert_eq!(matches.files, vec![new, old]);
}

#[tokio::test]
async fn test_cancelled_search() {
    let dir = numbered_files(3).await;
    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = glob_files("*.txt", dir.path(), 10, &cancel).await;
    assert_eq!(result, Err(crate::tools::ToolError::Cancelled));
}

#[tokio::test]
async fn test_glob_tool_output() {
    let dir = go_repo().await;
    let (ctx, mut events) = setup_context(dir.path());

    let response = GlobTool::new(2)
        .run(&ctx, &tool_call("glob", json!({"pattern": "*.go"})))
        .await
        .unwrap();
    assert!(!response.is_error());
    assert!(response.content().contains("Results are truncated"));
    let metadata: GlobMetadata = serde_json::from_value(response.metadata.unwrap()).unwrap();
    assert_eq!(metadata, GlobMetadata { number_of_files: 2, truncated: true });

    let events = collect_events(&mut events);
    assert_eq!(count_progress_events(&events), 1);
}

#[tokio::test]
async fn test_glob_tool_relative_path_and_no_matches() {
    let dir = go_repo().await;
    let (ctx, _events) = setup_context(dir.path());

    let response = GlobTool::default()
        .run(&ctx, &tool_call("glob", json!({"pattern": "*.go", "path": "src"})))
        .await
        .unwrap();
    assert!(response.content().ends_with("d.go"));

    let response = GlobTool::default()
        .run(&ctx, &tool_call("glob", json!({"pattern": "*.py"})))
        .await
        .unwrap();
    assert_eq!(response.content(), "No files found");
}

#[tokio::test]
async fn test_glob_tool_rejects_empty_pattern() {
    let dir = create_temp_dir().await;
    let (ctx, _events) = setup_context(dir.path());
    let result = GlobTool::default().run(&ctx, &tool_call("glob", json!({"pattern": " "}))).await;
    assert!(matches!(result, Err(crate::tools::ToolError::Parameter(_))));
}
