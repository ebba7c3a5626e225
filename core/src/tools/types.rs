use serde::{Deserialize, Serialize};

// Glob tool types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobArgs {
    pub pattern: String,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobMetadata {
    pub number_of_files: usize,
    pub truncated: bool,
}

// Grep tool types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrepArgs {
    pub pattern: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub include: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrepLine {
    pub ln: u64,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrepMatch {
    pub path: String,
    pub lines: Vec<GrepLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrepMetadata {
    pub number_of_matches: usize,
    pub truncated: bool,
}

// Filesystem tool types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewArgs {
    pub file_path: String,
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewMetadata {
    pub file_path: String,
    pub total_lines: usize,
    pub lines_shown: usize,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteArgs {
    pub file_path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteMetadata {
    pub bytes_written: usize,
    pub created: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditArgs {
    pub file_path: String,
    pub old_string: String,
    pub new_string: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditMetadata {
    pub additions: usize,
    pub removals: usize,
    pub created: bool,
}

// Shell tool types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BashArgs {
    pub command: String,
    /// Milliseconds
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BashMetadata {
    pub exit_code: i32,
    pub duration_ms: u64,
    pub timed_out: bool,
}

// Diagnostics tool types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsArgs {
    #[serde(default)]
    pub file_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsMetadata {
    pub errors: usize,
    pub warnings: usize,
    pub files: usize,
}
