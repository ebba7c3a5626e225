pub mod agent;
pub mod app;
pub mod config;
pub mod events;
pub mod lsp;
pub mod permission;
pub mod provider;
pub mod session;
pub mod store;
pub mod supervisor;
pub mod tools;

// Re-export main types for convenience
pub use agent::{Agent, AgentError, CompactOutcome, RunHandle, RunOutcome, SessionState};
pub use app::App;
pub use config::{Config, ProviderConfig};
pub use events::{Broker, EventBus, LspEvent, PermissionEvent, RunEvent, SessionEvent, Subscription, ToolEvent, TokenUsage};
pub use lsp::{LspManager, ServerConfig};
pub use permission::{AllowAll, Decision, PermissionGate, PermissionRequest, PermissionService};
pub use provider::{ModelInfo, Provider, ProviderEvent};
pub use session::{Attachment, ContentPart, FinishReason, Message, MessageRole, Session};
pub use store::{JsonFileStore, MemoryStore, Store, StoreError};
pub use supervisor::TaskSupervisor;
pub use tools::{Tool, ToolCall, ToolExecutor, ToolRegistry, ToolResponse};
