use crate::lsp::{Diagnostic, LspManager, Severity};
use crate::tools::types::*;
use crate::tools::{parse_input, Tool, ToolCall, ToolContext, ToolError, ToolInfo, ToolResponse};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const DIAGNOSTICS_WAIT: Duration = Duration::from_secs(3);

/// Language-server diagnostics for one file or the whole project
pub struct DiagnosticsTool {
    lsp: Arc<LspManager>,
    wait: Duration,
}

impl DiagnosticsTool {
    pub fn new(lsp: Arc<LspManager>) -> Self {
        Self { lsp, wait: DIAGNOSTICS_WAIT }
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }
}

fn format_diagnostic(path: &Path, diagnostic: &Diagnostic) -> String {
    let start = diagnostic.range.start;
    let source = diagnostic
        .source
        .as_deref()
        .map(|source| format!("[{}] ", source))
        .unwrap_or_default();
    format!(
        "{}: {}:{}:{} {}{}",
        diagnostic.severity(),
        path.display(),
        start.line + 1,
        start.character + 1,
        source,
        diagnostic.message
    )
}

fn format_section(title: &str, diagnostics: &BTreeMap<PathBuf, Vec<Diagnostic>>) -> String {
    let mut lines: Vec<(Severity, String)> = diagnostics
        .iter()
        .flat_map(|(path, list)| list.iter().map(move |d| (d.severity(), format_diagnostic(path, d))))
        .collect();
    lines.sort_by(|a, b| a.0.cmp(&b.0));

    let mut out = format!("<{}>\n", title);
    for (_, line) in lines {
        out.push_str(&line);
        out.push('\n');
    }
    out.push_str(&format!("</{}>\n", title));
    out
}

#[async_trait]
impl Tool for DiagnosticsTool {
    fn info(&self) -> ToolInfo {
        ToolInfo::new(
            "diagnostics",
            "Get errors and warnings reported by the language servers. With file_path, the file is \
             opened in its language server first and diagnostics for it are listed separately; \
             without it, diagnostics for the whole project are returned.",
        )
        .param("file_path", "string", "The file to get diagnostics for (optional)", false)
    }

    async fn run(&self, ctx: &ToolContext, call: &ToolCall) -> Result<ToolResponse, ToolError> {
        let args: DiagnosticsArgs = parse_input(call)?;
        let file = args
            .file_path
            .filter(|p| !p.is_empty())
            .map(|p| ctx.resolve(&p));

        if let Some(path) = &file {
            ctx.progress(&call.id, format!("Waiting for diagnostics: {}", path.display()));
            tokio::select! {
                waited = self.lsp.open_and_wait(path, self.wait) => match waited {
                    Ok(fresh) => debug!(path = %path.display(), fresh, "diagnostics wait finished"),
                    Err(e) => debug!("Could not open {} in a language server: {}", path.display(), e),
                },
                _ = ctx.cancel.cancelled() => return Err(ToolError::Cancelled),
            }
        }

        let all = self.lsp.diagnostics();
        let summary = self.lsp.summary();
        let mut output = String::new();

        if let Some(path) = &file {
            let own: BTreeMap<PathBuf, Vec<Diagnostic>> = all
                .get(path)
                .map(|list| BTreeMap::from([(path.clone(), list.clone())]))
                .unwrap_or_default();
            output.push_str(&format_section("file_diagnostics", &own));
        }

        let project: BTreeMap<PathBuf, Vec<Diagnostic>> = match &file {
            Some(path) => all.iter().filter(|(p, _)| *p != path).map(|(p, d)| (p.clone(), d.clone())).collect(),
            None => all.clone(),
        };
        output.push_str(&format_section("project_diagnostics", &project));

        output.push_str(&format!(
            "\n<diagnostic_summary>\nCurrent file: {} errors, {} warnings\nProject: {} errors, {} warnings\n</diagnostic_summary>\n",
            file.as_ref().and_then(|p| all.get(p)).map_or(0, |d| count(d, Severity::Error)),
            file.as_ref().and_then(|p| all.get(p)).map_or(0, |d| count(d, Severity::Warning)),
            summary.errors,
            summary.warnings,
        ));

        Ok(ToolResponse::text(output).with_metadata(DiagnosticsMetadata {
            errors: summary.errors,
            warnings: summary.warnings,
            files: all.len(),
        }))
    }
}

fn count(diagnostics: &[Diagnostic], severity: Severity) -> usize {
    diagnostics.iter().filter(|d| d.severity() == severity).count()
}
