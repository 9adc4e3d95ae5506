//! Process configuration: recognized keys from spec §6, loaded the way the
//! rest of this codebase's ancestor loads its own config — `figment`
//! layering defaults, an optional TOML file, then environment overrides.

use crate::Result;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub log_level: String,
    pub log_format: String,
    pub server: ServerSettings,
    pub cache: CacheSettings,
    pub worker: WorkerSettings,
    pub ipc: IpcSettings,
    pub session: SessionSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub bind_address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Hard cap on Σ cache entry sizes.
    pub budget_bytes: u64,
    /// Duration after which unused, non-resident entries may be evicted.
    pub idle_eviction_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub interpreter_path: PathBuf,
    pub script_path: PathBuf,
    pub transport: TransportKind,
    pub http_base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcSettings {
    pub inactivity_timeout_sec: u64,
    pub hard_timeout_sec_inference: u64,
    pub hard_timeout_sec_control: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    pub default_concurrency_per_worker: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            server: ServerSettings::default(),
            cache: CacheSettings::default(),
            worker: WorkerSettings::default(),
            ipc: IpcSettings::default(),
            session: SessionSettings::default(),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            budget_bytes: 10 * 1024 * 1024 * 1024, // 10 GB
            idle_eviction_secs: 24 * 3600,
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            interpreter_path: PathBuf::from("python3"),
            script_path: PathBuf::from("worker/main.py"),
            transport: TransportKind::Stdio,
            http_base_url: None,
        }
    }
}

impl Default for IpcSettings {
    fn default() -> Self {
        Self {
            inactivity_timeout_sec: 60,
            hard_timeout_sec_inference: 600,
            hard_timeout_sec_control: 30,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_concurrency_per_worker: 1,
        }
    }
}

impl OrchestratorConfig {
    /// Loads configuration from, in ascending precedence: built-in
    /// defaults, `config.toml` in the working directory (if present), then
    /// `ORCH_`-prefixed environment variables.
    pub fn load() -> Result<Self> {
        let mut figment =
            Figment::from(figment::providers::Serialized::defaults(Self::default()));

        let config_path = PathBuf::from("config.toml");
        if config_path.exists() {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment = figment.merge(Env::prefixed("ORCH_").split("_"));

        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(crate::OrchestratorError::Validation(
                "server.port cannot be 0".to_string(),
            ));
        }
        if self.cache.budget_bytes == 0 {
            return Err(crate::OrchestratorError::Validation(
                "cache.budget_bytes must be greater than 0".to_string(),
            ));
        }
        if self.session.default_concurrency_per_worker == 0 {
            return Err(crate::OrchestratorError::Validation(
                "session.default_concurrency_per_worker must be greater than 0".to_string(),
            ));
        }
        if self.worker.transport == TransportKind::Http && self.worker.http_base_url.is_none() {
            return Err(crate::OrchestratorError::Validation(
                "worker.http_base_url is required when worker.transport = \"http\"".to_string(),
            ));
        }
        Ok(())
    }
}
