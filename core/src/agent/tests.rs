use super::*;
use crate::config::Config;
use crate::events::{PermissionEvent, Subscription, ToolEvent};
use crate::permission::PermissionService;
use crate::provider::{ModelInfo, ScriptedProvider, ScriptedTurn};
use crate::store::MemoryStore;
use crate::tools::ToolRegistry;
use serde_json::json;
use std::time::Duration;
use tempfile::TempDir;

struct Harness {
    agent: Agent,
    store: Arc<MemoryStore>,
    provider: Arc<ScriptedProvider>,
    permissions: Arc<PermissionService>,
    bus: EventBus,
    dir: TempDir,
}

fn harness_with_model(model: &str, turns: Vec<ScriptedTurn>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let bus = EventBus::default();
    let store = Arc::new(MemoryStore::new());
    let provider = Arc::new(ScriptedProvider::new(ModelInfo::for_model(model)).with_turns(turns));
    let permissions = Arc::new(PermissionService::new(bus.permissions.clone()));
    let registry = ToolRegistry::builtin(&Config::new(dir.path()), None);
    let executor = Arc::new(ToolExecutor::new(Arc::new(registry), dir.path(), bus.tools.clone()));
    let agent = Agent::new(
        store.clone(),
        provider.clone(),
        permissions.clone(),
        executor,
        bus.clone(),
        Arc::new(TaskSupervisor::new()),
    );
    Harness { agent, store, provider, permissions, bus, dir }
}

fn harness(turns: Vec<ScriptedTurn>) -> Harness {
    harness_with_model("scripted", turns)
}

async fn within<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("timed out")
}

async fn next_permission_request(sub: &mut Subscription<PermissionEvent>) -> String {
    loop {
        if let Some(PermissionEvent::Requested(request)) = within(sub.recv()).await {
            return request.id;
        }
    }
}

async fn new_session(h: &Harness) -> String {
    h.store.create_session("test").await.unwrap().id
}

#[tokio::test]
async fn test_run_with_empty_session_creates_and_selects_it_first() {
    let h = harness(vec![]);
    let mut sessions = h.bus.sessions.subscribe();
    let mut runs = h.bus.runs.subscribe();

    let handle = h.agent.run("", "list files\nin the repo", vec![]).await.unwrap();
    assert!(!handle.session_id.is_empty());

    // Published before run() returned, so before any assistant content
    match sessions.try_recv() {
        Some(SessionEvent::Selected(session)) => {
            assert_eq!(session.id, handle.session_id);
            assert_eq!(session.title, "list files");
        }
        other => panic!("expected SessionSelected, got {:?}", other),
    }

    let session_id = handle.session_id.clone();
    assert!(matches!(within(handle.wait()).await, RunOutcome::Completed { .. }));

    assert!(matches!(runs.recv().await, Some(RunEvent::Started { .. })));
    assert!(matches!(
        runs.recv().await,
        Some(RunEvent::ContentDelta { ref text, .. }) if text.contains("list files")
    ));
    assert!(matches!(runs.recv().await, Some(RunEvent::Completed { .. })));

    let messages = h.store.list_messages(&session_id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[1].finish_reason(), Some(FinishReason::EndTurn));
    assert_eq!(h.agent.state(&session_id), SessionState::Idle);
}

#[tokio::test]
async fn test_second_run_on_running_session_is_busy() {
    let h = harness(vec![ScriptedTurn::new().text("thinking").hang()]);
    let session_id = new_session(&h).await;

    let handle = h.agent.run(&session_id, "first", vec![]).await.unwrap();
    assert!(h.agent.is_busy());
    assert_eq!(h.agent.state(&session_id), SessionState::Running);

    let second = h.agent.run(&session_id, "second", vec![]).await;
    assert!(matches!(second, Err(AgentError::Busy(_))));

    // The rejected run wrote nothing
    let messages = h.store.list_messages(&session_id).await.unwrap();
    assert_eq!(messages.iter().filter(|m| m.role == MessageRole::User).count(), 1);

    assert!(h.agent.cancel(&session_id));
    assert_eq!(within(handle.wait()).await, RunOutcome::Cancelled);
    assert!(!h.agent.is_busy());
    assert_eq!(h.agent.state(&session_id), SessionState::Idle);
}

#[tokio::test]
async fn test_cancel_without_active_run_is_noop() {
    let h = harness(vec![]);
    let session_id = new_session(&h).await;
    let mut runs = h.bus.runs.subscribe();

    assert!(!h.agent.cancel(&session_id));
    assert!(!h.agent.cancel("no-such-session"));
    assert!(runs.try_recv().is_none());
    assert!(h.store.list_messages(&session_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_session() {
    let h = harness(vec![]);
    let result = h.agent.run("missing", "hi", vec![]).await;
    assert!(matches!(result, Err(AgentError::SessionNotFound(_))));
}

#[tokio::test]
async fn test_tool_calls_run_and_conversation_loops() {
    let h = harness(vec![
        ScriptedTurn::new()
            .text("Looking.")
            .tool_call("c1", "glob", json!({"pattern": "*.txt"}))
            .done(FinishReason::ToolUse),
        ScriptedTurn::new().text("Found it.").done(FinishReason::EndTurn),
    ]);
    std::fs::write(h.dir.path().join("notes.txt"), "hello").unwrap();
    let session_id = new_session(&h).await;
    let mut tools = h.bus.tools.subscribe();

    let handle = h.agent.run(&session_id, "find text files", vec![]).await.unwrap();
    assert!(matches!(within(handle.wait()).await, RunOutcome::Completed { .. }));

    let messages = h.store.list_messages(&session_id).await.unwrap();
    let roles: Vec<MessageRole> = messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![MessageRole::User, MessageRole::Assistant, MessageRole::Tool, MessageRole::Assistant]);

    let result = messages[2].tool_results().next().unwrap();
    assert_eq!(result.call_id, "c1");
    assert!(!result.is_error);
    assert!(result.content.contains("notes.txt"));
    assert_eq!(messages[3].text(), "Found it.");

    // The second request carries the tool round trip and the tool schemas
    let requests = h.provider.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].messages.len(), 3);
    assert!(!requests[1].tools.is_empty());

    assert!(matches!(tools.recv().await, Some(ToolEvent::Begin { ref tool, .. }) if tool == "glob"));
}

#[tokio::test]
async fn test_duplicate_call_ids_are_ignored() {
    let h = harness(vec![
        ScriptedTurn::new()
            .tool_call("c1", "glob", json!({"pattern": "*.rs"}))
            .tool_call("c1", "glob", json!({"pattern": "*.go"}))
            .done(FinishReason::ToolUse),
        ScriptedTurn::new().done(FinishReason::EndTurn),
    ]);
    let session_id = new_session(&h).await;

    let handle = h.agent.run(&session_id, "go", vec![]).await.unwrap();
    within(handle.wait()).await;

    let messages = h.store.list_messages(&session_id).await.unwrap();
    let results: Vec<_> = messages.iter().flat_map(|m| m.tool_results()).collect();
    assert_eq!(results.len(), 1);
}

#[tokio::test]
async fn test_call_id_reused_in_a_later_turn_is_answered() {
    let h = harness(vec![
        ScriptedTurn::new()
            .tool_call("call_0", "glob", json!({"pattern": "*.rs"}))
            .done(FinishReason::ToolUse),
        ScriptedTurn::new()
            .tool_call("call_0", "glob", json!({"pattern": "*.go"}))
            .done(FinishReason::ToolUse),
        ScriptedTurn::new().text("Nothing there.").done(FinishReason::EndTurn),
    ]);
    let session_id = new_session(&h).await;

    let handle = h.agent.run(&session_id, "look twice", vec![]).await.unwrap();
    assert!(matches!(within(handle.wait()).await, RunOutcome::Completed { .. }));

    let messages = h.store.list_messages(&session_id).await.unwrap();
    let calls = messages.iter().flat_map(|m| m.tool_calls()).count();
    let results: Vec<_> = messages.iter().flat_map(|m| m.tool_results()).collect();
    assert_eq!(calls, 2);
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|result| result.call_id == "call_0" && !result.is_error));
}

#[tokio::test]
async fn test_denied_permission_is_reported_to_the_model() {
    let h = harness(vec![
        ScriptedTurn::new()
            .tool_call("w1", "write", json!({"file_path": "out.txt", "content": "data"}))
            .done(FinishReason::ToolUse),
        ScriptedTurn::new().text("Understood.").done(FinishReason::EndTurn),
    ]);
    let session_id = new_session(&h).await;
    let mut permissions = h.bus.permissions.subscribe();

    let handle = h.agent.run(&session_id, "write a file", vec![]).await.unwrap();
    let request_id = next_permission_request(&mut permissions).await;
    h.permissions.deny(&request_id).unwrap();

    assert!(matches!(within(handle.wait()).await, RunOutcome::Completed { .. }));
    assert!(!h.dir.path().join("out.txt").exists());

    let messages = h.store.list_messages(&session_id).await.unwrap();
    let result = messages.iter().flat_map(|m| m.tool_results()).next().unwrap();
    assert!(result.is_error);
    assert_eq!(result.content, "permission denied");
}

#[tokio::test]
async fn test_granted_permission_runs_the_tool() {
    let h = harness(vec![
        ScriptedTurn::new()
            .tool_call("w1", "write", json!({"file_path": "out.txt", "content": "data"}))
            .done(FinishReason::ToolUse),
        ScriptedTurn::new().done(FinishReason::EndTurn),
    ]);
    let session_id = new_session(&h).await;
    let mut permissions = h.bus.permissions.subscribe();

    let handle = h.agent.run(&session_id, "write a file", vec![]).await.unwrap();
    let request_id = next_permission_request(&mut permissions).await;
    h.permissions.grant(&request_id).unwrap();

    within(handle.wait()).await;
    assert_eq!(std::fs::read_to_string(h.dir.path().join("out.txt")).unwrap(), "data");
}

#[tokio::test]
async fn test_cancel_answers_every_requested_call() {
    let h = harness(vec![ScriptedTurn::new()
        .tool_call("w1", "write", json!({"file_path": "a.txt", "content": "a"}))
        .tool_call("w2", "write", json!({"file_path": "b.txt", "content": "b"}))
        .done(FinishReason::ToolUse)]);
    let session_id = new_session(&h).await;
    let mut permissions = h.bus.permissions.subscribe();
    let mut runs = h.bus.runs.subscribe();

    let handle = h.agent.run(&session_id, "write two files", vec![]).await.unwrap();
    next_permission_request(&mut permissions).await;

    assert!(h.agent.cancel(&session_id));
    assert_eq!(within(handle.wait()).await, RunOutcome::Cancelled);
    assert!(h.permissions.pending_requests().is_empty());

    let messages = h.store.list_messages(&session_id).await.unwrap();
    let results: Vec<_> = messages.iter().flat_map(|m| m.tool_results()).collect();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].call_id, "w1");
    assert_eq!(results[1].call_id, "w2");
    assert!(results.iter().all(|r| r.is_error && r.content.contains("cancelled")));
    assert_eq!(messages.last().unwrap().finish_reason(), Some(FinishReason::Cancelled));

    let mut terminal = Vec::new();
    while let Some(event) = runs.try_recv() {
        if event.is_terminal() {
            terminal.push(event);
        }
    }
    assert_eq!(terminal.len(), 1);
    assert!(matches!(terminal[0], RunEvent::Cancelled { .. }));
    assert_eq!(h.agent.state(&session_id), SessionState::Idle);
}

#[tokio::test]
async fn test_cancel_all_stops_every_session() {
    let h = harness(vec![ScriptedTurn::new().hang(), ScriptedTurn::new().hang()]);
    let first = new_session(&h).await;
    let second = new_session(&h).await;

    let a = h.agent.run(&first, "one", vec![]).await.unwrap();
    let b = h.agent.run(&second, "two", vec![]).await.unwrap();
    h.agent.cancel_all();

    assert_eq!(within(a.wait()).await, RunOutcome::Cancelled);
    assert_eq!(within(b.wait()).await, RunOutcome::Cancelled);
    assert!(!h.agent.is_busy());
}

#[tokio::test]
async fn test_provider_failure_fails_the_run() {
    let h = harness(vec![ScriptedTurn::failing("connection refused")]);
    let session_id = new_session(&h).await;
    let mut runs = h.bus.runs.subscribe();

    let handle = h.agent.run(&session_id, "hi", vec![]).await.unwrap();
    match within(handle.wait()).await {
        RunOutcome::Failed { error } => assert!(error.contains("connection refused")),
        other => panic!("unexpected outcome {:?}", other),
    }

    let messages = h.store.list_messages(&session_id).await.unwrap();
    assert_eq!(messages.last().unwrap().finish_reason(), Some(FinishReason::Error));
    assert_eq!(h.agent.state(&session_id), SessionState::Idle);

    let mut failed = false;
    while let Some(event) = runs.try_recv() {
        failed |= matches!(event, RunEvent::Failed { .. });
    }
    assert!(failed);
}

#[tokio::test]
async fn test_stream_error_keeps_partial_text() {
    let h = harness(vec![ScriptedTurn::new().text("partial").error("overloaded")]);
    let session_id = new_session(&h).await;

    let handle = h.agent.run(&session_id, "hi", vec![]).await.unwrap();
    assert_eq!(
        within(handle.wait()).await,
        RunOutcome::Failed { error: "overloaded".to_string() }
    );

    let messages = h.store.list_messages(&session_id).await.unwrap();
    let last = messages.last().unwrap();
    assert_eq!(last.text(), "partial");
    assert_eq!(last.finish_reason(), Some(FinishReason::Error));
}

#[tokio::test]
async fn test_usage_and_cost_are_recorded() {
    let h = harness_with_model(
        "x-ai/grok-code-fast-1",
        vec![ScriptedTurn::new().text("done").usage(1_000_000, 1_000_000).done(FinishReason::EndTurn)],
    );
    let session_id = new_session(&h).await;
    let mut sessions = h.bus.sessions.subscribe();

    let handle = h.agent.run(&session_id, "hi", vec![]).await.unwrap();
    match within(handle.wait()).await {
        RunOutcome::Completed { usage } => assert_eq!(usage.total(), 2_000_000),
        other => panic!("unexpected outcome {:?}", other),
    }

    let session = h.store.get_session(&session_id).await.unwrap();
    assert_eq!(session.prompt_tokens, 1_000_000);
    assert_eq!(session.completion_tokens, 1_000_000);
    assert!((session.cost - 1.7).abs() < 1e-9);
    assert!(matches!(sessions.try_recv(), Some(SessionEvent::Updated(_))));
}

#[tokio::test]
async fn test_attachments_are_loaded() {
    let h = harness(vec![]);
    let file = h.dir.path().join("main.rs");
    std::fs::write(&file, "fn main() {}").unwrap();
    let session_id = new_session(&h).await;

    let handle = h.agent.run(&session_id, "explain", vec![Attachment::new(&file)]).await.unwrap();
    within(handle.wait()).await;

    let messages = h.store.list_messages(&session_id).await.unwrap();
    let attachment = messages[0].attachments().next().unwrap();
    assert_eq!(attachment.content.as_deref(), Some("fn main() {}"));
}

#[tokio::test]
async fn test_compaction_moves_history_start() {
    let h = harness(vec![]);
    let session_id = new_session(&h).await;
    let handle = h.agent.run(&session_id, "hello", vec![]).await.unwrap();
    within(handle.wait()).await;

    h.provider.push_turn(ScriptedTurn::new().text("We said hello.").usage(10, 5).done(FinishReason::EndTurn));
    let outcome = h.agent.compact_session(&session_id).await.unwrap();
    let CompactOutcome::Compacted { summary_message_id } = outcome else {
        panic!("expected compaction, got {:?}", outcome);
    };

    let summarize = h.provider.requests().pop().unwrap();
    assert!(summarize.tools.is_empty());
    assert_eq!(summarize.messages.last().unwrap().text(), prompt::SUMMARY_REQUEST);

    let session = h.store.get_session(&session_id).await.unwrap();
    assert_eq!(session.summary_message_id.as_deref(), Some(summary_message_id.as_str()));
    assert_eq!(session.prompt_tokens, 10 + "hello".len() as u64);

    let handle = h.agent.run(&session_id, "what next", vec![]).await.unwrap();
    within(handle.wait()).await;
    let next = h.provider.requests().pop().unwrap();
    assert_eq!(next.messages[0].text(), "We said hello.");
    assert_eq!(next.messages.len(), 2);
}

#[tokio::test]
async fn test_compaction_while_running_is_skipped() {
    let h = harness(vec![ScriptedTurn::new().hang()]);
    let session_id = new_session(&h).await;
    let handle = h.agent.run(&session_id, "long task", vec![]).await.unwrap();
    let before = h.store.list_messages(&session_id).await.unwrap();

    let outcome = h.agent.compact_session(&session_id).await.unwrap();
    assert!(matches!(outcome, CompactOutcome::Skipped(_)));
    assert_eq!(h.store.list_messages(&session_id).await.unwrap(), before);
    assert!(h.store.get_session(&session_id).await.unwrap().summary_message_id.is_none());

    h.agent.cancel(&session_id);
    within(handle.wait()).await;
}

#[tokio::test]
async fn test_compaction_of_empty_session_is_skipped() {
    let h = harness(vec![]);
    let session_id = new_session(&h).await;
    let outcome = h.agent.compact_session(&session_id).await.unwrap();
    assert!(matches!(outcome, CompactOutcome::Skipped(_)));
    assert!(!h.agent.is_busy());
}
