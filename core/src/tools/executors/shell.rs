use crate::events::ToolEvent;
use crate::tools::types::*;
use crate::tools::{parse_input, Tool, ToolCall, ToolContext, ToolError, ToolInfo, ToolResponse};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader as AsyncBufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::debug;

pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;
pub const MAX_TIMEOUT_MS: u64 = 600_000;
pub const MAX_OUTPUT_CHARS: usize = 30_000;
const PIPE_GRACE: Duration = Duration::from_millis(500);

/// Network and browser commands the bash tool refuses to run
pub const BANNED_COMMANDS: &[&str] = &[
    "alias", "curl", "curlie", "wget", "axel", "aria2c", "nc", "telnet", "lynx", "w3m", "links",
    "httpie", "xh", "http-prompt", "chrome", "firefox", "safari",
];

/// Shell command execution
pub struct BashTool {
    default_timeout: Duration,
}

impl BashTool {
    pub fn new() -> Self {
        Self { default_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS) }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

impl Default for BashTool {
    fn default() -> Self {
        Self::new()
    }
}

fn banned_command(command: &str) -> Option<&'static str> {
    command
        .split(|c: char| c == ';' || c == '&' || c == '|' || c == '\n')
        .filter_map(|segment| segment.split_whitespace().next())
        .find_map(|program| {
            let program = program.rsplit('/').next().unwrap_or(program);
            BANNED_COMMANDS.iter().copied().find(|banned| *banned == program)
        })
}

/// Keep the head and tail of oversized output
pub fn truncate_output(output: &str, max_chars: usize) -> String {
    let total = output.chars().count();
    if total <= max_chars {
        return output.to_string();
    }
    let half = max_chars / 2;
    let head: String = output.chars().take(half).collect();
    let tail: String = output.chars().skip(total - half).collect();
    let skipped_lines = output
        .chars()
        .skip(half)
        .take(total - 2 * half)
        .filter(|c| *c == '\n')
        .count();
    format!("{}\n\n... [{} lines truncated] ...\n\n{}", head, skipped_lines, tail)
}

fn pump<R>(reader: R, ctx: &ToolContext, call_id: &str, stderr: bool) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let events = ctx.events.clone();
    let call_id = call_id.to_string();
    tokio::spawn(async move {
        // Output is decoded per line so invalid UTF-8 never ends the stream
        let mut reader = AsyncBufReader::new(reader);
        let mut buf = Vec::new();
        let mut collected = String::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(call_id = %call_id, "output stream closed: {}", e);
                    break;
                }
            }
            let chunk = String::from_utf8_lossy(&buf).into_owned();
            let event = if stderr {
                ToolEvent::Stderr { call_id: call_id.clone(), chunk: chunk.clone() }
            } else {
                ToolEvent::Stdout { call_id: call_id.clone(), chunk: chunk.clone() }
            };
            events.publish(event);
            collected.push_str(&chunk);
        }
        collected
    })
}

/// Collect a pump's output. Background processes can keep a pipe open
/// after the shell exits, so the wait is bounded.
async fn drain(task: JoinHandle<String>) -> String {
    let abort = task.abort_handle();
    match tokio::time::timeout(PIPE_GRACE, task).await {
        Ok(Ok(output)) => output,
        _ => {
            abort.abort();
            String::new()
        }
    }
}

enum Exit {
    Finished(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl Tool for BashTool {
    fn info(&self) -> ToolInfo {
        ToolInfo::new(
            "bash",
            "Execute a shell command in the working directory and return its output. \
             Commands that time out or are cancelled are killed. Network tools such as curl \
             and wget are not allowed. Output longer than 30000 characters is truncated.",
        )
        .param("command", "string", "The command to execute", true)
        .param(
            "timeout",
            "number",
            "Optional timeout in milliseconds (default 60000, max 600000)",
            false,
        )
        .with_side_effects()
    }

    async fn run(&self, ctx: &ToolContext, call: &ToolCall) -> Result<ToolResponse, ToolError> {
        let args: BashArgs = parse_input(call)?;
        if args.command.trim().is_empty() {
            return Err(ToolError::Parameter("Empty command".to_string()));
        }
        if let Some(banned) = banned_command(&args.command) {
            return Ok(ToolResponse::error(format!("Command '{}' is not allowed", banned)));
        }

        let timeout = args
            .timeout
            .map(|ms| Duration::from_millis(ms.min(MAX_TIMEOUT_MS)))
            .unwrap_or(self.default_timeout);

        ctx.progress(&call.id, format!("Executing: {}", args.command));
        let start = Instant::now();

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&args.command)
            .current_dir(&ctx.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::Execution(format!("Failed to spawn command: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ToolError::Execution("Failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ToolError::Execution("Failed to capture stderr".to_string()))?;
        let stdout_task = pump(stdout, ctx, &call.id, false);
        let stderr_task = pump(stderr, ctx, &call.id, true);

        let exit = tokio::select! {
            status = child.wait() => Exit::Finished(
                status.map_err(|e| ToolError::Execution(format!("Process wait error: {}", e)))?,
            ),
            _ = tokio::time::sleep(timeout) => Exit::TimedOut,
            _ = ctx.cancel.cancelled() => Exit::Cancelled,
        };

        if !matches!(exit, Exit::Finished(_)) {
            if let Err(e) = child.kill().await {
                debug!(call_id = %call.id, "failed to kill command: {}", e);
            }
        }
        let (stdout_output, stderr_output) = futures::join!(drain(stdout_task), drain(stderr_task));

        let duration_ms = (start.elapsed().as_millis() as u64).max(1);

        let mut output = truncate_output(stdout_output.trim_end(), MAX_OUTPUT_CHARS);
        let stderr_trimmed = truncate_output(stderr_output.trim_end(), MAX_OUTPUT_CHARS);
        if !stderr_trimmed.is_empty() {
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str(&stderr_trimmed);
        }

        match exit {
            Exit::Cancelled => Err(ToolError::Cancelled),
            Exit::TimedOut => {
                output.push_str(&format!("\nCommand timed out after {} ms", timeout.as_millis()));
                Ok(ToolResponse::error(output.trim_start().to_string()).with_metadata(BashMetadata {
                    exit_code: -1,
                    duration_ms,
                    timed_out: true,
                }))
            }
            Exit::Finished(status) => {
                let exit_code = status.code().unwrap_or(-1);
                let metadata = BashMetadata { exit_code, duration_ms, timed_out: false };
                if exit_code != 0 {
                    output.push_str(&format!("\nExit code {}", exit_code));
                    return Ok(ToolResponse::error(output.trim_start().to_string()).with_metadata(metadata));
                }
                if output.is_empty() {
                    output = "no output".to_string();
                }
                Ok(ToolResponse::text(output).with_metadata(metadata))
            }
        }
    }
}
