//! Inference Session Manager (spec §4.3): owns Session objects, drives
//! each through its state machine on its own spawned task, and surfaces
//! progress/cancellation to callers via snapshot reads. The Session record
//! is written only by its owning task; this module never locks a session's
//! fields for mutation from the outside, only for the snapshot copy.

pub mod session;

pub use session::{Session, SessionSnapshot, SessionState, TimingBreakdown};

use crate::cache::ModelCache;
use crate::config::IpcSettings;
use crate::ipc::{message_type, CallDeadlines, RequestEnvelope};
use crate::pool::{ModelLoadSpec, RunOutcome, WorkerPoolManager, WorkerState};
use crate::{OrchestratorError, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub model_id: String,
    pub message_type: String,
    pub payload: Map<String, Value>,
}

impl SessionRequest {
    pub fn inference(model_id: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            model_id: model_id.into(),
            message_type: message_type::GENERATE_SDXL_ENHANCED.to_string(),
            payload,
        }
    }
}

pub struct SessionManager {
    pool: Arc<WorkerPoolManager>,
    cache: Arc<ModelCache>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    ipc: IpcSettings,
}

impl SessionManager {
    pub fn new(pool: Arc<WorkerPoolManager>, cache: Arc<ModelCache>, ipc: IpcSettings) -> Self {
        Self {
            pool,
            cache,
            sessions: RwLock::new(HashMap::new()),
            ipc,
        }
    }

    /// Resolves a worker for `model_id`: reuse one it is already resident
    /// on (Ready or Busy — a same-worker queue is fine, the worker's
    /// concurrency cap serializes arrival order), otherwise place and load
    /// it via the Pool (spec §4.3 step 1).
    async fn resolve_worker(&self, model_id: &str) -> Result<String> {
        let status = self.pool.pool_status().await;
        if let Some(worker) = status.workers.iter().find(|w| {
            w.current_model.as_deref() == Some(model_id)
                && matches!(w.state, WorkerState::Ready | WorkerState::Busy)
        }) {
            return Ok(worker.gpu_id.clone());
        }

        let entry = self
            .cache
            .get(model_id)
            .await
            .ok_or_else(|| OrchestratorError::NotFound(format!("model not cached: {model_id}")))?;

        let gpu_id = self
            .pool
            .find_best_available(entry.type_tag)
            .await
            .ok_or_else(|| OrchestratorError::WorkerMissing("no available worker".to_string()))?;

        self.pool
            .load_model(
                &gpu_id,
                ModelLoadSpec {
                    model_id: entry.id.clone(),
                    display_name: entry.display_name.clone(),
                    path: entry.path.clone(),
                },
            )
            .await?;

        Ok(gpu_id)
    }

    /// Creates and schedules a Session, returning immediately with its id
    /// (spec §4.3 Create: steps 1-3, non-blocking).
    #[tracing::instrument(skip(self, request), fields(model_id = %request.model_id))]
    pub async fn create(self: &Arc<Self>, request: SessionRequest) -> Result<String> {
        let gpu_id = self.resolve_worker(&request.model_id).await?;

        let session_id = uuid::Uuid::new_v4().to_string();
        let session = Arc::new(Session::new(session_id.clone(), request.model_id.clone(), gpu_id));

        self.sessions
            .write()
            .await
            .insert(session_id.clone(), session.clone());

        let manager = self.clone();
        tokio::spawn(async move {
            manager.execute(session, request).await;
        });

        Ok(session_id)
    }

    /// Drives one session through Preprocessing → Running →
    /// Postprocessing → Completed, or to Failed on timeout/IPC failure
    /// (spec §4.3 Execute).
    async fn execute(&self, session: Arc<Session>, request: SessionRequest) {
        if !session.transition(SessionState::Preprocessing) {
            return;
        }
        session.set_progress(10);

        // Advisory: drop stale GPU state before dispatch. Best-effort —
        // failures here never fail the session.
        if let Err(e) = self.pool.cleanup_memory(&session.device_id).await {
            tracing::debug!("advisory cleanup_memory({}) failed: {e}", session.device_id);
        }

        if !session.transition(SessionState::Running) {
            return;
        }
        session.set_progress(25);

        let envelope = RequestEnvelope::new(request.message_type.clone(), session.id.clone())
            .with_payload(request.payload.clone());
        let deadlines = CallDeadlines {
            inactivity: std::time::Duration::from_secs(self.ipc.inactivity_timeout_sec),
            hard: std::time::Duration::from_secs(self.ipc.hard_timeout_sec_inference),
        };

        let outcome = self
            .pool
            .run_inference(&session.device_id, envelope, deadlines, Some(&session.cancel_token))
            .await;

        match outcome {
            Ok(RunOutcome::Completed(payload)) => {
                if !session.transition(SessionState::Postprocessing) {
                    return;
                }
                session.set_progress(90);
                let artifacts = extract_artifacts(&payload);
                session.mark_completed(artifacts);
            }
            Ok(RunOutcome::Cancelled) => {
                // The owning CancellationToken already drove the terminal
                // transition via SessionManager::cancel; nothing to do.
            }
            Err(e) => {
                session.mark_failed(e.to_string());
            }
        }
    }

    /// Best-effort, idempotent. Returns `false` if the session is unknown
    /// or already terminal.
    #[tracing::instrument(skip(self), fields(session_id = %session_id))]
    pub async fn cancel(&self, session_id: &str) -> Result<bool> {
        let session = self
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))?;
        Ok(session.cancel())
    }

    #[tracing::instrument(skip(self), fields(session_id = %session_id))]
    pub async fn get_status(&self, session_id: &str) -> Result<SessionSnapshot> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.snapshot())
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))
    }
}

/// Best-effort extraction of file-path artifacts from an opaque worker
/// response — the core never types this payload (spec §9 design note), so
/// this only recognizes the conventional `image_paths` array when present.
fn extract_artifacts(payload: &Map<String, Value>) -> Vec<String> {
    payload
        .get("image_paths")
        .and_then(Value::as_array)
        .map(|paths| {
            paths
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ModelCache;
    use crate::config::IpcSettings;
    use crate::core::{Device, StaticDeviceDiscovery};
    use crate::ipc::{CallOutcome, ResponseEnvelope, WorkerIpc};
    use crate::pool::{WorkerPoolManager, WorkerTransportFactory};
    use async_trait::async_trait;
    use std::time::Duration;

    struct EchoTransport;

    #[async_trait]
    impl WorkerIpc for EchoTransport {
        async fn initialize(&self) -> Result<()> {
            Ok(())
        }
        async fn call(&self, _request: RequestEnvelope, _deadlines: CallDeadlines) -> Result<CallOutcome> {
            let mut payload = Map::new();
            payload.insert(
                "image_paths".into(),
                Value::Array(vec![Value::String("/out/image.png".into())]),
            );
            Ok(CallOutcome::Success(ResponseEnvelope {
                success: true,
                error: None,
                payload,
            }))
        }
        async fn dispose(&self) -> Result<()> {
            Ok(())
        }
    }

    struct SlowTransport;

    #[async_trait]
    impl WorkerIpc for SlowTransport {
        async fn initialize(&self) -> Result<()> {
            Ok(())
        }
        async fn call(&self, _request: RequestEnvelope, _deadlines: CallDeadlines) -> Result<CallOutcome> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(CallOutcome::Success(ResponseEnvelope {
                success: true,
                error: None,
                payload: Map::new(),
            }))
        }
        async fn dispose(&self) -> Result<()> {
            Ok(())
        }
    }

    struct TestFactory {
        slow: bool,
    }

    impl WorkerTransportFactory for TestFactory {
        fn create(&self, _device: &Device) -> Result<Box<dyn WorkerIpc>> {
            if self.slow {
                Ok(Box::new(SlowTransport))
            } else {
                Ok(Box::new(EchoTransport))
            }
        }
    }

    async fn test_manager(slow: bool) -> (Arc<SessionManager>, Arc<ModelCache>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        tokio::fs::write(&path, vec![0u8; 1024]).await.unwrap();

        let cache = Arc::new(ModelCache::new(10 * 1024 * 1024 * 1024, 86400));
        cache.cache("m1", "Model One", &path, false).await.unwrap();

        let pool = Arc::new(WorkerPoolManager::new(cache.clone(), 1));
        let discovery = StaticDeviceDiscovery::new(vec![Device::new("gpu_0", "Test", 12 * 1024 * 1024 * 1024)]);
        pool.initialize(&discovery, &TestFactory { slow }).await.unwrap();

        let manager = Arc::new(SessionManager::new(
            pool,
            cache.clone(),
            IpcSettings {
                inactivity_timeout_sec: 60,
                hard_timeout_sec_inference: 600,
                hard_timeout_sec_control: 30,
            },
        ));
        (manager, cache, dir)
    }

    #[tokio::test]
    async fn create_runs_to_completion_and_records_artifacts() {
        let (manager, _cache, _dir) = test_manager(false).await;
        let session_id = manager
            .create(SessionRequest::inference("m1", Map::new()))
            .await
            .unwrap();

        let mut snapshot = manager.get_status(&session_id).await.unwrap();
        for _ in 0..50 {
            if snapshot.state.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            snapshot = manager.get_status(&session_id).await.unwrap();
        }

        assert_eq!(snapshot.state, SessionState::Completed);
        assert_eq!(snapshot.output_artifacts, vec!["/out/image.png".to_string()]);
    }

    #[tokio::test]
    async fn cancel_in_flight_transitions_to_cancelled_and_frees_worker() {
        let (manager, _cache, _dir) = test_manager(true).await;
        let session_id = manager
            .create(SessionRequest::inference("m1", Map::new()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let cancelled = manager.cancel(&session_id).await.unwrap();
        assert!(cancelled);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let snapshot = manager.get_status(&session_id).await.unwrap();
        assert_eq!(snapshot.state, SessionState::Cancelled);

        let again = manager.cancel(&session_id).await.unwrap();
        assert!(!again);
    }

    #[tokio::test]
    async fn unknown_session_status_is_not_found() {
        let (manager, _cache, _dir) = test_manager(false).await;
        let result = manager.get_status("does-not-exist").await;
        assert!(matches!(result, Err(OrchestratorError::SessionNotFound(_))));
    }
}
