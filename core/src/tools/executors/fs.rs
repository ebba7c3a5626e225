use crate::lsp::LspManager;
use crate::tools::types::*;
use crate::tools::{parse_input, Tool, ToolCall, ToolContext, ToolError, ToolInfo, ToolResponse};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

const DEFAULT_READ_LIMIT: usize = 2000;
const MAX_LINE_LENGTH: usize = 2000;
const MAX_READ_SIZE: u64 = 250 * 1024;

/// Let the language server know about a file the agent touched.
/// Failures only cost diagnostics freshness.
async fn notify_lsp(lsp: &Option<Arc<LspManager>>, path: &Path) {
    if let Some(lsp) = lsp {
        if let Err(e) = lsp.open_file(path).await {
            debug!("Language server not notified about {}: {}", path.display(), e);
        }
    }
}

pub(crate) fn normalize_newlines(text: &str) -> String {
    if text.contains('\r') {
        text.replace("\r\n", "\n").replace('\r', "\n")
    } else {
        text.to_string()
    }
}

fn exactly_once(haystack: &str, needle: &str) -> Result<usize, ToolError> {
    let mut matches = haystack.match_indices(needle);
    let first = matches.next().ok_or_else(|| {
        ToolError::Execution(
            "old_string not found in file. Make sure it matches exactly, including whitespace and line breaks"
                .to_string(),
        )
    })?;
    if matches.next().is_some() {
        return Err(ToolError::Execution(
            "old_string appears multiple times in the file. Provide more surrounding context to make it unique"
                .to_string(),
        ));
    }
    Ok(first.0)
}

/// Read a file with line numbers
pub struct ViewTool {
    lsp: Option<Arc<LspManager>>,
}

impl ViewTool {
    pub fn new(lsp: Option<Arc<LspManager>>) -> Self {
        Self { lsp }
    }
}

#[async_trait]
impl Tool for ViewTool {
    fn info(&self) -> ToolInfo {
        ToolInfo::new(
            "view",
            "Read a file from the filesystem. Output lines are numbered starting at 1. \
             Use offset and limit to page through large files; at most 2000 lines are returned by default \
             and lines longer than 2000 characters are cut.",
        )
        .param("file_path", "string", "The path to the file to read", true)
        .param("offset", "number", "The line number to start reading from (0-based)", false)
        .param("limit", "number", "The number of lines to read (defaults to 2000)", false)
    }

    async fn run(&self, ctx: &ToolContext, call: &ToolCall) -> Result<ToolResponse, ToolError> {
        let args: ViewArgs = parse_input(call)?;
        if args.file_path.is_empty() {
            return Err(ToolError::Parameter("file_path is required".to_string()));
        }
        let path = ctx.resolve(&args.file_path);
        ctx.progress(&call.id, format!("Reading file: {}", path.display()));

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(_) => return Ok(ToolResponse::error(format!("File not found: {}", path.display()))),
        };
        if metadata.is_dir() {
            return Ok(ToolResponse::error(format!("Path is a directory, not a file: {}", path.display())));
        }
        if metadata.len() > MAX_READ_SIZE && args.offset.is_none() && args.limit.is_none() {
            return Ok(ToolResponse::error(format!(
                "File is too large ({} bytes). Use offset and limit to read it in parts",
                metadata.len()
            )));
        }

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| ToolError::Execution(format!("Failed to read file {}: {}", path.display(), e)))?;
        let content = normalize_newlines(&String::from_utf8_lossy(&bytes));

        let offset = args.offset.unwrap_or(0);
        let limit = args.limit.unwrap_or(DEFAULT_READ_LIMIT).max(1);
        let total_lines = content.lines().count();

        let mut output = String::new();
        let mut shown = 0;
        for (index, line) in content.lines().enumerate().skip(offset).take(limit) {
            let line = if line.chars().count() > MAX_LINE_LENGTH {
                format!("{}...", line.chars().take(MAX_LINE_LENGTH).collect::<String>())
            } else {
                line.to_string()
            };
            output.push_str(&format!("{:6}|{}\n", index + 1, line));
            shown += 1;
        }
        let truncated = offset + shown < total_lines;
        if truncated {
            output.push_str(&format!(
                "\n(File has more lines. Use offset {} to read beyond line {})\n",
                offset + shown,
                offset + shown
            ));
        }

        notify_lsp(&self.lsp, &path).await;

        Ok(ToolResponse::text(output).with_metadata(ViewMetadata {
            file_path: path.display().to_string(),
            total_lines,
            lines_shown: shown,
            truncated,
        }))
    }
}

/// Create or overwrite a file
pub struct WriteTool {
    lsp: Option<Arc<LspManager>>,
}

impl WriteTool {
    pub fn new(lsp: Option<Arc<LspManager>>) -> Self {
        Self { lsp }
    }
}

#[async_trait]
impl Tool for WriteTool {
    fn info(&self) -> ToolInfo {
        ToolInfo::new(
            "write",
            "Write content to a file, creating it and any missing parent directories, \
             or replacing it entirely if it exists. Prefer the edit tool for small changes.",
        )
        .param("file_path", "string", "The path to the file to write", true)
        .param("content", "string", "The full content to write", true)
        .with_side_effects()
    }

    async fn run(&self, ctx: &ToolContext, call: &ToolCall) -> Result<ToolResponse, ToolError> {
        let args: WriteArgs = parse_input(call)?;
        if args.file_path.is_empty() {
            return Err(ToolError::Parameter("file_path is required".to_string()));
        }
        let path = ctx.resolve(&args.file_path);
        ctx.progress(&call.id, format!("Writing to file: {}", path.display()));

        if path.is_dir() {
            return Ok(ToolResponse::error(format!("Path is a directory, not a file: {}", path.display())));
        }
        let created = !path.exists();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ToolError::Execution(format!("Failed to create parent directories for {}: {}", path.display(), e))
            })?;
        }
        if !created {
            if let Ok(existing) = tokio::fs::read_to_string(&path).await {
                if existing == args.content {
                    return Ok(ToolResponse::error(format!(
                        "File {} already contains exactly this content",
                        path.display()
                    )));
                }
            }
        }

        tokio::fs::write(&path, &args.content)
            .await
            .map_err(|e| ToolError::Execution(format!("Failed to write file {}: {}", path.display(), e)))?;

        notify_lsp(&self.lsp, &path).await;

        Ok(ToolResponse::text(format!("File successfully written: {}", path.display()))
            .with_metadata(WriteMetadata { bytes_written: args.content.len(), created }))
    }
}

/// Replace one exact occurrence of a string in a file
pub struct EditTool {
    lsp: Option<Arc<LspManager>>,
}

impl EditTool {
    pub fn new(lsp: Option<Arc<LspManager>>) -> Self {
        Self { lsp }
    }
}

fn line_delta(old: &str, new: &str) -> (usize, usize) {
    let removals = if old.is_empty() { 0 } else { old.lines().count() };
    let additions = if new.is_empty() { 0 } else { new.lines().count() };
    (additions, removals)
}

#[async_trait]
impl Tool for EditTool {
    fn info(&self) -> ToolInfo {
        ToolInfo::new(
            "edit",
            "Edit a file by replacing old_string with new_string. old_string must match exactly one \
             location in the file, including whitespace. With an empty old_string a new file is \
             created with new_string as its content.",
        )
        .param("file_path", "string", "The path to the file to modify", true)
        .param("old_string", "string", "The text to replace", true)
        .param("new_string", "string", "The text to replace it with", true)
        .with_side_effects()
    }

    async fn run(&self, ctx: &ToolContext, call: &ToolCall) -> Result<ToolResponse, ToolError> {
        let args: EditArgs = parse_input(call)?;
        if args.file_path.is_empty() {
            return Err(ToolError::Parameter("file_path is required".to_string()));
        }
        let path = ctx.resolve(&args.file_path);
        ctx.progress(&call.id, format!("Editing file: {}", path.display()));

        if args.old_string.is_empty() {
            if path.exists() {
                return Ok(ToolResponse::error(format!("File already exists: {}", path.display())));
            }
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ToolError::Execution(format!("Failed to create {}: {}", parent.display(), e)))?;
            }
            tokio::fs::write(&path, &args.new_string)
                .await
                .map_err(|e| ToolError::Execution(format!("Failed to write file {}: {}", path.display(), e)))?;
            notify_lsp(&self.lsp, &path).await;

            let (additions, removals) = line_delta("", &args.new_string);
            return Ok(ToolResponse::text(format!("File created: {}", path.display()))
                .with_metadata(EditMetadata { additions, removals, created: true }));
        }

        if args.old_string == args.new_string {
            return Err(ToolError::Parameter("old_string and new_string are identical".to_string()));
        }

        // Matching runs on LF text; a CRLF file is written back as CRLF
        let (current, crlf) = match tokio::fs::read_to_string(&path).await {
            Ok(content) => (normalize_newlines(&content), content.contains("\r\n")),
            Err(_) => return Ok(ToolResponse::error(format!("File not found: {}", path.display()))),
        };
        let needle = normalize_newlines(&args.old_string);
        let replacement = normalize_newlines(&args.new_string);

        let index = match exactly_once(&current, &needle) {
            Ok(index) => index,
            Err(e) => return Ok(ToolResponse::error(e.to_string())),
        };
        let mut updated = current.clone();
        updated.replace_range(index..index + needle.len(), &replacement);
        if crlf {
            updated = updated.replace('\n', "\r\n");
        }

        tokio::fs::write(&path, &updated)
            .await
            .map_err(|e| ToolError::Execution(format!("Failed to write file {}: {}", path.display(), e)))?;
        notify_lsp(&self.lsp, &path).await;

        let (additions, removals) = line_delta(&needle, &replacement);
        Ok(ToolResponse::text(format!("Content replaced in file: {}", path.display()))
            .with_metadata(EditMetadata { additions, removals, created: false }))
    }
}
