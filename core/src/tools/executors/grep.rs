use super::is_ignored_name;
use crate::tools::types::*;
use crate::tools::{parse_input, Tool, ToolCall, ToolContext, ToolError, ToolInfo, ToolResponse};
use async_trait::async_trait;
use globset::{Glob, GlobMatcher};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

pub const GREP_LIMIT: usize = 100;
const MAX_LINE_CHARS: usize = 500;

const GREP_DESCRIPTION: &str = "Search file contents with a regular expression.

Returns matching lines grouped by file, files with the most recent changes first.
Use 'include' to restrict the search to files whose name matches a glob such as '*.rs' or '*.{ts,tsx}'.
Results are limited to 100 matching lines. Hidden files and dependency or build directories are skipped.";

pub struct GrepTool {
    limit: usize,
}

impl GrepTool {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }
}

impl Default for GrepTool {
    fn default() -> Self {
        Self::new(GREP_LIMIT)
    }
}

struct GrepOutcome {
    files: Vec<(GrepMatch, SystemTime)>,
    total: usize,
    truncated: bool,
}

fn search(
    regex: &Regex,
    include: Option<&GlobMatcher>,
    root: &Path,
    limit: usize,
    cancel: &CancellationToken,
) -> Result<GrepOutcome, ToolError> {
    let mut outcome = GrepOutcome { files: Vec::new(), total: 0, truncated: false };
    let walker = WalkDir::new(root)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_ignored_name(entry.file_name()));

    'walk: for entry in walker {
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }
        let Ok(entry) = entry else { continue };
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(include) = include {
            if !include.is_match(entry.file_name()) {
                continue;
            }
        }

        // Binary or unreadable files are skipped
        let Ok(content) = std::fs::read_to_string(entry.path()) else { continue };

        let mut lines = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if !regex.is_match(line) {
                continue;
            }
            if outcome.total >= limit {
                outcome.truncated = true;
                if !lines.is_empty() {
                    push_file(&mut outcome, entry.path(), lines);
                }
                break 'walk;
            }
            lines.push(GrepLine {
                ln: (index + 1) as u64,
                text: line.chars().take(MAX_LINE_CHARS).collect(),
            });
            outcome.total += 1;
        }
        if !lines.is_empty() {
            push_file(&mut outcome, entry.path(), lines);
        }
    }

    outcome.files.sort_by(|a, b| b.1.cmp(&a.1));
    Ok(outcome)
}

fn push_file(outcome: &mut GrepOutcome, path: &Path, lines: Vec<GrepLine>) {
    let modified = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(UNIX_EPOCH);
    outcome.files.push((
        GrepMatch { path: path.display().to_string(), lines },
        modified,
    ));
}

#[async_trait]
impl Tool for GrepTool {
    fn info(&self) -> ToolInfo {
        ToolInfo::new("grep", GREP_DESCRIPTION)
            .param("pattern", "string", "The regular expression to search for", true)
            .param(
                "path",
                "string",
                "The directory to search in. Defaults to the current working directory.",
                false,
            )
            .param("include", "string", "Only search files whose name matches this glob", false)
    }

    async fn run(&self, ctx: &ToolContext, call: &ToolCall) -> Result<ToolResponse, ToolError> {
        let args: GrepArgs = parse_input(call)?;
        if args.pattern.is_empty() {
            return Err(ToolError::Parameter("pattern is required".to_string()));
        }
        let regex = Regex::new(&args.pattern)
            .map_err(|e| ToolError::Parameter(format!("Invalid regex: {}", e)))?;
        let include = match args.include.as_deref() {
            Some(glob) if !glob.is_empty() => Some(
                Glob::new(glob)
                    .map_err(|e| ToolError::Parameter(format!("Invalid include pattern {}: {}", glob, e)))?
                    .compile_matcher(),
            ),
            _ => None,
        };
        let root: PathBuf = match args.path.as_deref() {
            Some(path) if !path.is_empty() => ctx.resolve(path),
            _ => ctx.working_dir.clone(),
        };

        ctx.progress(&call.id, format!("Searching for: {}", args.pattern));

        let limit = self.limit;
        let cancel = ctx.cancel.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            search(&regex, include.as_ref(), &root, limit, &cancel)
        })
        .await
        .map_err(|e| ToolError::Execution(format!("Search failed: {}", e)))??;

        if outcome.total == 0 {
            return Ok(ToolResponse::text("No matches found")
                .with_metadata(GrepMetadata { number_of_matches: 0, truncated: false }));
        }

        let mut output = format!("Found {} matches\n", outcome.total);
        for (file, _) in &outcome.files {
            output.push_str(&format!("{}:\n", file.path));
            for line in &file.lines {
                output.push_str(&format!("  Line {}: {}\n", line.ln, line.text));
            }
            output.push('\n');
        }
        if outcome.truncated {
            output.push_str("(Results are truncated. Consider using a more specific path or pattern.)");
        }

        Ok(ToolResponse::text(output.trim_end().to_string()).with_metadata(GrepMetadata {
            number_of_matches: outcome.total,
            truncated: outcome.truncated,
        }))
    }
}
