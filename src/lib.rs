//! Orchestration tier for a fleet of GPU-resident generative-image inference
//! workers.
//!
//! Four subsystems make up the core:
//!
//! - [`pool`]: worker lifecycle, health, and load-balanced dispatch across
//!   per-GPU Python worker processes.
//! - [`cache`]: a process-wide, content-addressed cache of model weights
//!   sharing a single bounded memory budget, composed into suites.
//! - [`session`]: the state machine driving long-running inference jobs.
//! - [`ipc`]: framed request/response plumbing to worker subprocesses over
//!   stdio or a local HTTP bridge.
//!
//! [`api`] wires these together behind a thin HTTP surface; [`config`] and
//! [`metrics`] are the ambient configuration and observability layers.

pub mod api;
pub mod cache;
pub mod config;
pub mod core;
pub mod ipc;
pub mod metrics;
pub mod pool;
pub mod session;

use std::fmt;

/// Core error type for the orchestrator.
///
/// Large/foreign payloads are boxed to keep the enum small, following the
/// same rationale as boxing `figment::Error`/`std::io::Error` in any
/// thiserror enum that wraps third-party error types.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflicting state: {0}")]
    Conflict(String),

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("application failure: {0}")]
    ApplicationFailure(String),

    #[error("cache budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("worker missing: {0}")]
    WorkerMissing(String),

    #[error("worker not ready: {0}")]
    WorkerNotReady(String),

    #[error("model load failed: {0}")]
    LoadFailed(String),

    #[error("model file missing: {0}")]
    FileMissing(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("I/O error: {0}")]
    Io(Box<std::io::Error>),

    #[error("serialization error: {0}")]
    Serialization(Box<serde_json::Error>),

    #[error("configuration error: {0}")]
    Config(Box<figment::Error>),
}

impl From<std::io::Error> for OrchestratorError {
    fn from(err: std::io::Error) -> Self {
        OrchestratorError::Io(Box::new(err))
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::Serialization(Box::new(err))
    }
}

impl From<figment::Error> for OrchestratorError {
    fn from(err: figment::Error) -> Self {
        OrchestratorError::Config(Box::new(err))
    }
}

/// Result type used throughout the orchestrator's public API.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// The §7 error taxonomy tag, carried in the HTTP envelope's `error.code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    NotFound,
    Conflict,
    TransportFailure,
    ApplicationFailure,
    BudgetExceeded,
    Fatal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Conflict => "conflict",
            ErrorCategory::TransportFailure => "transport_failure",
            ErrorCategory::ApplicationFailure => "application_failure",
            ErrorCategory::BudgetExceeded => "budget_exceeded",
            ErrorCategory::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

impl OrchestratorError {
    /// The §7 taxonomy category this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        use OrchestratorError::*;
        match self {
            Validation(_) => ErrorCategory::Validation,
            NotFound(_) | WorkerMissing(_) | SessionNotFound(_) => ErrorCategory::NotFound,
            Conflict(_) | WorkerNotReady(_) => ErrorCategory::Conflict,
            TransportFailure(_) => ErrorCategory::TransportFailure,
            ApplicationFailure(_) | LoadFailed(_) => ErrorCategory::ApplicationFailure,
            BudgetExceeded(_) => ErrorCategory::BudgetExceeded,
            FileMissing(_) => ErrorCategory::Validation,
            Fatal(_) | Io(_) | Serialization(_) | Config(_) => ErrorCategory::Fatal,
        }
    }

    /// HTTP status code for the thin northbound API (§6).
    pub fn status_code(&self) -> u16 {
        match self.category() {
            ErrorCategory::Validation => 400,
            ErrorCategory::NotFound => 404,
            ErrorCategory::Conflict => 409,
            ErrorCategory::TransportFailure
            | ErrorCategory::ApplicationFailure
            | ErrorCategory::BudgetExceeded => 500,
            ErrorCategory::Fatal => 500,
        }
    }
}

/// Configures a `tracing` subscriber for the whole process.
///
/// `format` is one of `pretty`, `compact`, or `json`, matching the
/// recognized `log_format` values used across the ambient config.
pub fn init_tracing(log_level: &str, format: &str) -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match format {
        "json" => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_target(false)
            .try_init(),
        "compact" => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .with_target(false)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init(),
    };

    // A subscriber may already be installed (e.g. under `cargo test`); that
    // is not a startup failure.
    let _ = result;
    Ok(())
}
