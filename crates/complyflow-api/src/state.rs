//! Application state wiring the engine to its infrastructure.
//!
//! AppState holds the coordinator used by both the CLI and the REST API,
//! pinned to the SQLite execution repository.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use complyflow_core::notify::NotificationChannel;
use complyflow_core::task::TaskInvoker;
use complyflow_core::task::circuit::{CircuitBreakerInvoker, CircuitStatus};
use complyflow_core::workflow::coordinator::ExecutionCoordinator;
use complyflow_core::workflow::evaluator::StateMachineEvaluator;
use complyflow_core::workflow::registry::WorkflowRegistry;
use complyflow_infra::config::{database_url, load_engine_config, resolve_data_dir};
use complyflow_infra::notify::{LogNotificationChannel, WebhookNotificationChannel};
use complyflow_infra::sqlite::execution::SqliteExecutionRepository;
use complyflow_infra::sqlite::pool::DatabasePool;
use complyflow_infra::task::http::HttpTaskInvoker;
use complyflow_infra::task::simulated::SimulatedTaskInvoker;
use complyflow_types::config::EngineConfig;

pub type ConcreteCoordinator = ExecutionCoordinator<SqliteExecutionRepository>;

/// Command-line overrides applied on top of `config.toml`.
#[derive(Debug, Clone, Default)]
pub struct StartupOptions {
    pub simulate: bool,
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<ConcreteCoordinator>,
    pub config: Arc<EngineConfig>,
    pub data_dir: PathBuf,
    /// Circuit breakers around the HTTP backend; `None` when simulating.
    pub circuits: Option<Arc<CircuitBreakerInvoker<HttpTaskInvoker>>>,
}

impl AppState {
    /// Resolve the data directory, load config and wire everything.
    pub async fn init(options: StartupOptions) -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

        let mut config = load_engine_config(&data_dir).await;
        if options.simulate {
            config.backend.simulate = true;
        }
        Self::build(data_dir, config).await
    }

    /// Wire state for an explicit data directory and configuration.
    pub async fn build(data_dir: PathBuf, config: EngineConfig) -> anyhow::Result<Self> {
        let pool = DatabasePool::new(&database_url(&data_dir, &config))
            .await
            .context("failed to open execution database")?;
        let repo = Arc::new(SqliteExecutionRepository::new(pool));

        let registry = match &config.definitions_dir {
            Some(dir) => WorkflowRegistry::with_directory(dir)
                .with_context(|| format!("failed to load workflow definitions from {}", dir.display()))?,
            None => WorkflowRegistry::builtin().context("built-in workflow definitions are invalid")?,
        };
        tracing::info!(definitions = registry.len(), "workflow registry ready");

        let (invoker, circuits): (Arc<dyn TaskInvoker>, _) = if config.backend.simulate {
            tracing::info!("using simulated task backend");
            (Arc::new(SimulatedTaskInvoker::new()) as Arc<dyn TaskInvoker>, None)
        } else {
            let http = HttpTaskInvoker::new(&config.backend).context("failed to build HTTP client")?;
            let breaker = Arc::new(CircuitBreakerInvoker::new(
                http,
                config.circuit_breaker.clone(),
            ));
            tracing::info!(base_url = config.backend.base_url.as_str(), "using HTTP task backend");
            (breaker.clone() as Arc<dyn TaskInvoker>, Some(breaker))
        };

        let notifier: Arc<dyn NotificationChannel> = match &config.backend.notification_url {
            Some(url) => Arc::new(
                WebhookNotificationChannel::new(url.clone())
                    .context("failed to build notification client")?,
            ),
            None => Arc::new(LogNotificationChannel),
        };

        let evaluator =
            StateMachineEvaluator::new(invoker, Arc::new(registry), config.engine.clone());
        let coordinator = ExecutionCoordinator::new(repo, evaluator, config.engine.clone())
            .with_notifier(notifier);

        Ok(Self {
            coordinator: Arc::new(coordinator),
            config: Arc::new(config),
            data_dir,
            circuits,
        })
    }

    /// Breaker state per task resource (empty when simulating).
    pub fn circuit_statuses(&self) -> Vec<CircuitStatus> {
        self.circuits
            .as_ref()
            .map(|c| c.statuses())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub async fn for_tests() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_path_buf();
        std::mem::forget(dir);
        let mut config = EngineConfig::default();
        config.backend.simulate = true;
        Self::build(data_dir, config).await.unwrap()
    }
}
