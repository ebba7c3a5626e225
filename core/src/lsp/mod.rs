//! Language server clients.
//!
//! One subprocess per project language, spoken to over JSON-RPC on stdio.
//! Each client's receive loop is the only writer of its diagnostic cache;
//! everything else reads point-in-time snapshots.

pub mod client;
pub mod manager;
pub mod protocol;
pub mod servers;
pub mod transport;

pub use client::{ClientState, DiagnosticCache, LspClient};
pub use manager::{DiagnosticSummary, LspManager};
pub use protocol::{Diagnostic, Position, Range, Severity};
pub use servers::{builtin_servers, ServerConfig};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LspError {
    #[error("Failed to start language server: {0}")]
    Spawn(String),

    #[error("Language server handshake failed: {0}")]
    Handshake(String),

    #[error("Language server I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Language server protocol error: {0}")]
    Protocol(String),

    #[error("Language server request timed out: {0}")]
    Timeout(String),

    #[error("Language server error {code}: {message}")]
    Response { code: i32, message: String },

    #[error("Language server for {0} is not running")]
    NotRunning(String),

    #[error("No language server handles {0}")]
    NoServer(PathBuf),
}
