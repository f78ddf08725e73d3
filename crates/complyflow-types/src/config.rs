//! Engine configuration types.
//!
//! `EngineConfig` represents `config.toml` in the data directory. Every
//! section and field has a default, so an empty or missing file is valid.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory of additional YAML workflow templates loaded at startup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definitions_dir: Option<PathBuf>,

    #[serde(default)]
    pub engine: ExecutionLimits,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

/// Bounds applied to every execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// Execution ceiling when the definition does not set one (24 hours).
    #[serde(default = "default_execution_timeout_secs")]
    pub execution_timeout_secs: u64,
    /// Per-invocation bound when the Task does not set one.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    /// State transitions allowed per execution before it is failed as runaway.
    #[serde(default = "default_max_transitions")]
    pub max_transitions: u64,
    #[serde(default = "default_list_limit")]
    pub default_list_limit: usize,
    #[serde(default = "default_max_list_limit")]
    pub max_list_limit: usize,
}

fn default_execution_timeout_secs() -> u64 {
    86_400
}

fn default_task_timeout_secs() -> u64 {
    300
}

fn default_max_transitions() -> u64 {
    25_000
}

fn default_list_limit() -> usize {
    50
}

fn default_max_list_limit() -> usize {
    1_000
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            execution_timeout_secs: default_execution_timeout_secs(),
            task_timeout_secs: default_task_timeout_secs(),
            max_transitions: default_max_transitions(),
            default_list_limit: default_list_limit(),
            max_list_limit: default_max_list_limit(),
        }
    }
}

/// Circuit breaker around the task backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive backend failures before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds the circuit stays open before a probe is allowed.
    #[serde(default = "default_open_duration_secs")]
    pub open_duration_secs: u64,
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_open_duration_secs() -> u64 {
    30
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_duration_secs: default_open_duration_secs(),
        }
    }
}

/// External task execution backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Serve canned results instead of calling `base_url`.
    #[serde(default)]
    pub simulate: bool,
    /// Webhook receiving terminal-status notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_url: Option<String>,
}

fn default_base_url() -> String {
    "http://127.0.0.1:9000".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            simulate: false,
            notification_url: None,
        }
    }
}

/// REST API listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Execution store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite file name, relative to the data directory.
    #[serde(default = "default_database_file")]
    pub database_file: String,
}

fn default_database_file() -> String {
    "complyflow.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_file: default_database_file(),
        }
    }
}
