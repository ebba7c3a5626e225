use anyhow::{Context, Result};
use kite_core::{App, CompactOutcome, Config, EventBus, LspEvent, PermissionEvent, RunEvent, SessionEvent, ToolEvent};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

const HELP: &str = "Commands: /new  /cancel  /compact  /sessions  /status  /quit
Answer permission prompts with y (once), a (always for this session) or n.";

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    // Logs go to stderr so they never interleave with the conversation
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("KITE_LOG").unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
    info!("Starting kite");

    let config = Config::from_env().context("Failed to read configuration")?;
    let app = App::new(config).await?;
    println!(
        "kite ({}) in {}",
        app.provider.model().name,
        app.config.working_dir.display()
    );
    println!("{}", HELP);

    let printer = tokio::spawn(print_events(app.bus.clone()));
    let result = repl(&app).await;

    app.shutdown().await;
    let _ = printer.await;
    info!("kite shutting down");
    result
}

async fn repl(app: &App) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut session_id = String::new();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(request) = app.permissions.pending_requests().into_iter().next() {
            let answer = match line {
                "y" | "yes" => app.permissions.grant(&request.id),
                "a" | "always" => app.permissions.grant_persistent(&request.id),
                "n" | "no" => app.permissions.deny(&request.id),
                _ => {
                    println!("Answer y, a or n");
                    continue;
                }
            };
            if let Err(e) = answer {
                println!("{}", e);
            }
            continue;
        }

        match line {
            "/quit" | "/exit" => break,
            "/help" => println!("{}", HELP),
            "/new" => {
                app.agent.cancel(&session_id);
                session_id.clear();
                app.bus.sessions.publish(SessionEvent::Cleared);
            }
            "/cancel" => {
                if !app.agent.cancel(&session_id) {
                    println!("Nothing is running");
                }
            }
            "/compact" if session_id.is_empty() => println!("No session yet"),
            "/compact" => match app.agent.compact_session(&session_id).await {
                Ok(CompactOutcome::Compacted { .. }) => println!("Session compacted"),
                Ok(CompactOutcome::Skipped(reason)) => println!("{}", reason),
                Err(e) => println!("Compaction failed: {}", e),
            },
            "/sessions" => {
                for session in app.store.list_sessions().await? {
                    let marker = if session.id == session_id { "*" } else { " " };
                    println!(
                        "{} {}  {}  ({} tokens, ${:.4})",
                        marker,
                        &session.id[..8.min(session.id.len())],
                        session.title,
                        session.prompt_tokens + session.completion_tokens,
                        session.cost
                    );
                }
            }
            "/status" => {
                println!("{:?}", app.agent.state(&session_id));
                if let Some(lsp) = &app.lsp {
                    for (language, state) in lsp.status() {
                        println!("  {}: {:?}", language, state);
                    }
                    let summary = lsp.summary();
                    println!("  diagnostics: {} errors, {} warnings", summary.errors, summary.warnings);
                }
            }
            text => match app.agent.run(&session_id, text, Vec::new()).await {
                Ok(handle) => session_id = handle.session_id,
                Err(e) => println!("{}", e),
            },
        }
    }
    Ok(())
}

/// Render bus traffic until the bus shuts down
async fn print_events(bus: EventBus) {
    let mut sessions = bus.sessions.subscribe();
    let mut runs = bus.runs.subscribe();
    let mut permissions = bus.permissions.subscribe();
    let mut tools = bus.tools.subscribe();
    let mut lsp = bus.lsp.subscribe();

    loop {
        tokio::select! {
            Some(event) = sessions.recv() => match event {
                SessionEvent::Selected(session) => println!("[session {}: {}]", session.id, session.title),
                SessionEvent::Cleared => println!("[new session]"),
                SessionEvent::Updated(_) => {}
            },
            Some(event) = runs.recv() => match event {
                RunEvent::Started { .. } => {}
                RunEvent::ContentDelta { text, .. } => {
                    print!("{}", text);
                    let _ = std::io::stdout().flush();
                }
                RunEvent::Completed { usage, .. } => println!("\n[done, {} tokens]", usage.total()),
                RunEvent::Cancelled { .. } => println!("\n[cancelled]"),
                RunEvent::Failed { error, .. } => println!("\n[failed: {}]", error),
            },
            Some(event) = permissions.recv() => {
                if let PermissionEvent::Requested(request) = event {
                    println!(
                        "\n[permission] {} wants to {} {}: {}\nAllow? [y/a/n]",
                        request.tool_name,
                        request.action,
                        request.path.display(),
                        request.description
                    );
                }
            },
            Some(event) = tools.recv() => match event {
                ToolEvent::Begin { tool, summary, .. } => println!("\n[{}] {}", tool, summary),
                ToolEvent::End { ok: false, duration_ms, .. } => println!("[tool failed after {} ms]", duration_ms),
                _ => {}
            },
            Some(event) = lsp.recv() => {
                if let LspEvent::StateChanged { language, state, error } = event {
                    match error {
                        Some(error) => println!("[lsp {}: {:?} ({})]", language, state, error),
                        None => println!("[lsp {}: {:?}]", language, state),
                    }
                }
            },
            else => break,
        }
    }
}
