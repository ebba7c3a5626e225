use crate::tools::executors::is_ignored_name;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use walkdir::WalkDir;

/// How to launch the server for one language
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// File extensions, without the dot
    pub extensions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initialization_options: Option<serde_json::Value>,
}

impl ServerConfig {
    pub fn new(command: &str, args: &[&str], extensions: &[&str]) -> Self {
        Self {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            extensions: extensions.iter().map(|e| e.to_string()).collect(),
            initialization_options: None,
        }
    }

    pub fn handles(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
    }
}

pub fn builtin_servers() -> HashMap<String, ServerConfig> {
    HashMap::from([
        ("rust".to_string(), ServerConfig::new("rust-analyzer", &[], &["rs"])),
        ("go".to_string(), ServerConfig::new("gopls", &[], &["go"])),
        (
            "typescript".to_string(),
            ServerConfig::new(
                "typescript-language-server",
                &["--stdio"],
                &["ts", "tsx", "js", "jsx", "mjs", "cjs"],
            ),
        ),
        (
            "python".to_string(),
            ServerConfig::new("pyright-langserver", &["--stdio"], &["py", "pyi"]),
        ),
        (
            "c".to_string(),
            ServerConfig::new("clangd", &[], &["c", "h", "cc", "cpp", "cxx", "hpp"]),
        ),
    ])
}

/// `languageId` sent with didOpen
pub fn language_id(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "rs" => "rust",
        "go" => "go",
        "ts" | "mts" | "cts" => "typescript",
        "tsx" => "typescriptreact",
        "js" | "mjs" | "cjs" => "javascript",
        "jsx" => "javascriptreact",
        "py" | "pyi" => "python",
        "c" | "h" => "c",
        "cc" | "cpp" | "cxx" | "hpp" => "cpp",
        "json" => "json",
        "md" => "markdown",
        _ => "plaintext",
    }
}

/// Languages with at least one source file under `root`, looking at no
/// more than `max_files` files
pub fn detect_languages(
    root: &Path,
    servers: &HashMap<String, ServerConfig>,
    max_files: usize,
) -> Vec<String> {
    let mut extensions = HashSet::new();
    let walker = WalkDir::new(root)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_ignored_name(entry.file_name()))
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .take(max_files);
    for entry in walker {
        if let Some(ext) = entry.path().extension().and_then(|e| e.to_str()) {
            extensions.insert(ext.to_ascii_lowercase());
        }
    }

    let found: BTreeSet<String> = servers
        .iter()
        .filter(|(_, config)| config.extensions.iter().any(|e| extensions.contains(e)))
        .map(|(language, _)| language.clone())
        .collect();
    found.into_iter().collect()
}
