use super::{is_ignored, is_ignored_name};
use crate::tools::types::*;
use crate::tools::{parse_input, Tool, ToolCall, ToolContext, ToolError, ToolInfo, ToolResponse};
use async_trait::async_trait;
use globset::GlobBuilder;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use walkdir::WalkDir;

pub const GLOB_LIMIT: usize = 100;

const GLOB_DESCRIPTION: &str = "Fast file pattern matching tool that finds files by name and pattern.

- '*' matches any sequence of non-separator characters
- '**' matches any sequence of characters, including separators
- '?' matches any single non-separator character
- '[...]' matches any character in the brackets

Examples: '*.js' finds JavaScript files in the search directory, '**/*.js' in any subdirectory,
'src/**/*.{ts,tsx}' TypeScript files under src.

Results are limited to 100 files. Hidden files and common dependency or build directories
are skipped. Use the grep tool to search file contents.";

#[derive(Debug, Clone, PartialEq)]
pub struct GlobMatches {
    pub files: Vec<PathBuf>,
    pub truncated: bool,
}

/// Find files under `root` matching `pattern`.
///
/// Tries `rg --files` first and falls back to an in-process walk. The two
/// paths order differently: ripgrep results by path length (shallowest
/// first), walk results by modification time (newest first), because only
/// the walk stats every match. Ripgrep also honours ignore files, the walk
/// does not.
pub async fn glob_files(
    pattern: &str,
    root: &Path,
    limit: usize,
    cancel: &CancellationToken,
) -> Result<GlobMatches, ToolError> {
    let root = absolute(root)?;
    match glob_with_ripgrep(pattern, &root, limit, cancel).await {
        Ok(matches) => Ok(matches),
        Err(ToolError::Cancelled) => Err(ToolError::Cancelled),
        Err(e) => {
            debug!("ripgrep fast path failed, walking instead: {}", e);
            glob_with_walk(pattern, &root, limit, cancel).await
        }
    }
}

fn absolute(root: &Path) -> Result<PathBuf, ToolError> {
    if root.is_absolute() {
        return Ok(root.to_path_buf());
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(root))
        .map_err(|e| ToolError::Execution(format!("Cannot resolve {}: {}", root.display(), e)))
}

pub(crate) async fn glob_with_ripgrep(
    pattern: &str,
    root: &Path,
    limit: usize,
    cancel: &CancellationToken,
) -> Result<GlobMatches, ToolError> {
    let anchored = if pattern.starts_with('/') {
        pattern.to_string()
    } else {
        format!("/{}", pattern)
    };

    let mut command = Command::new("rg");
    command
        .args(["--files", "--null", "--glob", anchored.as_str(), "-L"])
        .current_dir(root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::select! {
        output = command.output() => output
            .map_err(|e| ToolError::Execution(format!("ripgrep unavailable: {}", e)))?,
        _ = cancel.cancelled() => return Err(ToolError::Cancelled),
    };

    match output.status.code() {
        Some(0) => {}
        Some(1) => return Ok(GlobMatches { files: Vec::new(), truncated: false }),
        code => {
            return Err(ToolError::Execution(format!(
                "ripgrep exited with {:?}: {}",
                code,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    let mut files: Vec<PathBuf> = output
        .stdout
        .split(|byte| *byte == 0)
        .filter(|raw| !raw.is_empty())
        .map(|raw| PathBuf::from(String::from_utf8_lossy(raw).as_ref()))
        .filter(|relative| !is_ignored(relative))
        .map(|relative| root.join(relative))
        .collect();

    files.sort_by_key(|path| path.as_os_str().len());
    let truncated = files.len() > limit;
    files.truncate(limit);
    Ok(GlobMatches { files, truncated })
}

pub(crate) async fn glob_with_walk(
    pattern: &str,
    root: &Path,
    limit: usize,
    cancel: &CancellationToken,
) -> Result<GlobMatches, ToolError> {
    let matcher = GlobBuilder::new(pattern.trim_start_matches('/'))
        .literal_separator(true)
        .build()
        .map_err(|e| ToolError::Parameter(format!("Invalid glob pattern: {}", e)))?
        .compile_matcher();
    let root = root.to_path_buf();
    let cancel = cancel.clone();

    tokio::task::spawn_blocking(move || {
        let mut found: Vec<(PathBuf, SystemTime)> = Vec::new();
        let walker = WalkDir::new(&root)
            .follow_links(true)
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !is_ignored_name(entry.file_name()));

        for entry in walker {
            if cancel.is_cancelled() {
                return Err(ToolError::Cancelled);
            }
            // Unreadable entries are skipped
            let Ok(entry) = entry else { continue };
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&root) else { continue };
            if !matcher.is_match(relative) {
                continue;
            }

            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(UNIX_EPOCH);
            found.push((entry.path().to_path_buf(), modified));
            if found.len() >= limit * 2 {
                break;
            }
        }

        found.sort_by(|a, b| b.1.cmp(&a.1));
        let truncated = found.len() > limit;
        found.truncate(limit);
        Ok(GlobMatches {
            files: found.into_iter().map(|(path, _)| path).collect(),
            truncated,
        })
    })
    .await
    .map_err(|e| ToolError::Execution(format!("Glob walk failed: {}", e)))?
}

pub struct GlobTool {
    limit: usize,
}

impl GlobTool {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }
}

impl Default for GlobTool {
    fn default() -> Self {
        Self::new(GLOB_LIMIT)
    }
}

#[async_trait]
impl Tool for GlobTool {
    fn info(&self) -> ToolInfo {
        ToolInfo::new("glob", GLOB_DESCRIPTION)
            .param("pattern", "string", "The glob pattern to match files against", true)
            .param(
                "path",
                "string",
                "The directory to search in. Defaults to the current working directory.",
                false,
            )
    }

    async fn run(&self, ctx: &ToolContext, call: &ToolCall) -> Result<ToolResponse, ToolError> {
        let args: GlobArgs = parse_input(call)?;
        if args.pattern.trim().is_empty() {
            return Err(ToolError::Parameter("pattern is required".to_string()));
        }

        let root = match args.path.as_deref() {
            Some(path) if !path.is_empty() => ctx.resolve(path),
            _ => ctx.working_dir.clone(),
        };
        ctx.progress(&call.id, format!("Finding files matching {} in {}", args.pattern, root.display()));

        let matches = glob_files(&args.pattern, &root, self.limit, &ctx.cancel).await?;

        let output = if matches.files.is_empty() {
            "No files found".to_string()
        } else {
            let mut output = matches
                .files
                .iter()
                .map(|path| path.display().to_string())
                .collect::<Vec<_>>()
                .join("\n");
            if matches.truncated {
                output.push_str("\n\n(Results are truncated. Consider using a more specific path or pattern.)");
            }
            output
        };

        Ok(ToolResponse::text(output).with_metadata(GlobMetadata {
            number_of_files: matches.files.len(),
            truncated: matches.truncated,
        }))
    }
}
