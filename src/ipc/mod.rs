//! Worker IPC: frames requests to and responses from Python worker
//! subprocesses over either transport, isolates worker crashes, and
//! exposes one call surface to the rest of the core.
//!
//! A single-slot serialization mutex lives inside each transport
//! implementation, never in the pool's per-worker state lock — this is the
//! §9 design-note re-architecture from "lock held across blocking IPC" to
//! "lock protects only the queue/call-state, never the I/O itself".

pub mod http;
pub mod protocol;
pub mod stdio;

pub use http::HttpTransport;
pub use protocol::{message_type, RequestEnvelope, ResponseEnvelope};
pub use stdio::StdioTransport;

use crate::{OrchestratorError, Result};
use std::time::Duration;

/// Inactivity and hard deadlines for a single IPC call (spec §5/§6).
#[derive(Debug, Clone, Copy)]
pub struct CallDeadlines {
    pub inactivity: Duration,
    pub hard: Duration,
}

impl CallDeadlines {
    pub fn control(inactivity_sec: u64, hard_sec: u64) -> Self {
        Self {
            inactivity: Duration::from_secs(inactivity_sec),
            hard: Duration::from_secs(hard_sec),
        }
    }
}

/// The outcome of dispatching a call, distinguishing the two failure
/// categories spec §4.4/§7 require the caller to tell apart:
/// a transport failure destroys the worker's trust state, an application
/// failure does not.
pub enum CallOutcome {
    Success(ResponseEnvelope),
    ApplicationFailure(String),
}

/// One worker subprocess's IPC connection.
#[async_trait::async_trait]
pub trait WorkerIpc: Send + Sync {
    /// One-shot handshake after process start. Must succeed before any
    /// further call is accepted.
    async fn initialize(&self) -> Result<()>;

    /// Sends `request`, waits for the framed reply within `deadlines`.
    ///
    /// A transport-level problem (EOF, parse error, non-2xx, timeout) is
    /// returned as `Err(OrchestratorError::TransportFailure)`. A reply with
    /// `success: false` is returned as `Ok(CallOutcome::ApplicationFailure)`
    /// — the call failed but the connection, and the worker's trust state,
    /// remain intact.
    async fn call(
        &self,
        request: RequestEnvelope,
        deadlines: CallDeadlines,
    ) -> Result<CallOutcome>;

    /// Closes the connection: best-effort graceful shutdown, then force.
    async fn dispose(&self) -> Result<()>;
}

/// Classifies a raw [`ResponseEnvelope`] into the two IPC failure
/// categories.
pub fn classify(response: ResponseEnvelope) -> CallOutcome {
    if response.success {
        CallOutcome::Success(response)
    } else {
        CallOutcome::ApplicationFailure(
            response
                .error
                .unwrap_or_else(|| "worker reported failure with no message".to_string()),
        )
    }
}

pub(crate) fn transport_failure(context: &str, detail: impl std::fmt::Display) -> OrchestratorError {
    OrchestratorError::TransportFailure(format!("{context}: {detail}"))
}
