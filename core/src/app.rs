//! Composition root: builds every component from a [`Config`] and owns the
//! ordered shutdown.

use crate::agent::Agent;
use crate::config::Config;
use crate::events::EventBus;
use crate::lsp::LspManager;
use crate::permission::PermissionService;
use crate::provider::{self, Provider};
use crate::store::{JsonFileStore, Store};
use crate::supervisor::TaskSupervisor;
use crate::tools::{ToolExecutor, ToolRegistry};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

pub struct App {
    pub config: Config,
    pub bus: EventBus,
    pub store: Arc<dyn Store>,
    pub provider: Arc<dyn Provider>,
    pub permissions: Arc<PermissionService>,
    pub lsp: Option<Arc<LspManager>>,
    pub supervisor: Arc<TaskSupervisor>,
    pub agent: Agent,
}

impl App {
    /// Wire the runtime with a JSON store under the configured data dir
    pub async fn new(config: Config) -> Result<Self> {
        let store = JsonFileStore::open(&config.data_dir)
            .await
            .with_context(|| format!("Failed to open session store in {}", config.data_dir.display()))?;
        Self::with_store(config, Arc::new(store))
    }

    /// Wire the runtime around an existing store. Language-server discovery
    /// starts in the background and does not delay construction.
    pub fn with_store(config: Config, store: Arc<dyn Store>) -> Result<Self> {
        let bus = EventBus::new(config.bus_buffer);
        let provider = provider::from_config(&config.provider).context("Failed to configure the model provider")?;
        let permissions = Arc::new(
            PermissionService::new(bus.permissions.clone()).with_auto_approve(config.auto_approve),
        );
        let supervisor = Arc::new(TaskSupervisor::new());

        let lsp = config.lsp_enabled.then(|| {
            Arc::new(LspManager::new(
                config.working_dir.clone(),
                config.lsp_servers.clone(),
                bus.lsp.clone(),
            ))
        });
        if let Some(manager) = &lsp {
            let manager = manager.clone();
            let cancel = supervisor.child_token();
            supervisor.spawn("lsp-startup", async move {
                let started = manager.start_detected(&cancel).await;
                info!(servers = ?started, "language servers started");
            });
        }

        let registry = Arc::new(ToolRegistry::builtin(&config, lsp.clone()));
        let executor = Arc::new(
            ToolExecutor::new(registry, config.working_dir.clone(), bus.tools.clone())
                .with_max_output(config.max_tool_output),
        );
        let agent = Agent::new(
            store.clone(),
            provider.clone(),
            permissions.clone(),
            executor,
            bus.clone(),
            supervisor.clone(),
        )
        .with_max_tokens(config.provider.max_tokens);

        info!(
            model = %provider.model().id,
            working_dir = %config.working_dir.display(),
            "kite runtime ready"
        );
        Ok(Self { config, bus, store, provider, permissions, lsp, supervisor, agent })
    }

    /// Cancel runs, stop background tasks within the configured bound, stop
    /// the language servers, then close every bus subscription.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.agent.cancel_all();

        let aborted = self.supervisor.shutdown_all(self.config.supervisor_shutdown_timeout).await;
        if aborted > 0 {
            warn!(aborted, "background tasks were aborted during shutdown");
        }

        if let Some(lsp) = &self.lsp {
            lsp.shutdown_all(self.config.lsp_shutdown_timeout).await;
        }
        self.bus.shutdown();
    }
}
