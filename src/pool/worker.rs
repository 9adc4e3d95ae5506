//! A single Worker: one Python subprocess bound to exactly one Device.
//!
//! Mutable fields live behind one short-held `Mutex`, distinct from the IPC
//! transport's own single-slot queue — the pool never holds this lock
//! across a blocking IPC round trip (§9 design note). Concurrency-cap
//! admission is a `Semaphore`, whose FIFO wakeup order is what gives
//! same-worker sessions their arrival-order guarantee (spec §4.3).

use crate::core::{CancellationToken, Device};
use crate::ipc::{CallDeadlines, CallOutcome, RequestEnvelope, WorkerIpc};
use crate::{OrchestratorError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, Semaphore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Uninitialized,
    Ready,
    Busy,
    Error,
    Disposed,
}

/// The result of a cancellation-aware inference dispatch. A `Cancelled`
/// outcome means the caller's cancellation token fired before the worker's
/// reply arrived; the underlying call keeps running detached and its reply,
/// whenever it arrives, is discarded (spec §4.3: "any reply that arrives
/// afterwards is discarded").
pub enum RunOutcome {
    Completed(serde_json::Map<String, serde_json::Value>),
    Cancelled,
}

struct Mutable {
    state: WorkerState,
    current_model: Option<String>,
    model_load_timestamp: Option<u64>,
    model_byte_size: u64,
    active_sessions: u32,
    error_message: Option<String>,
}

impl Mutable {
    /// The single chokepoint for Worker state changes. Every transition is
    /// logged here, with the from/to states, so call sites never need their
    /// own ad hoc logging.
    fn set_state(&mut self, gpu_id: &str, next: WorkerState) {
        let prev = self.state;
        if prev != next {
            tracing::info!(gpu_id = %gpu_id, from = ?prev, to = ?next, "worker state transition");
        }
        self.state = next;
    }
}

/// A point-in-time, owned copy of a Worker's observable state — the only
/// form in which pool status and placement queries ever see a worker.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub device: Device,
    pub state: WorkerState,
    pub current_model: Option<String>,
    pub model_load_timestamp: Option<u64>,
    pub model_byte_size: u64,
    pub active_sessions: u32,
    pub last_activity: u64,
    pub error_message: Option<String>,
}

pub struct Worker {
    pub device: Device,
    transport: Arc<dyn WorkerIpc>,
    mutable: Mutex<Mutable>,
    last_activity: AtomicU64,
    concurrency: Semaphore,
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl Worker {
    pub fn new(device: Device, transport: Box<dyn WorkerIpc>, concurrency_cap: usize) -> Self {
        Self {
            device,
            transport: Arc::from(transport),
            mutable: Mutex::new(Mutable {
                state: WorkerState::Uninitialized,
                current_model: None,
                model_load_timestamp: None,
                model_byte_size: 0,
                active_sessions: 0,
                error_message: None,
            }),
            last_activity: AtomicU64::new(now()),
            concurrency: Semaphore::new(concurrency_cap.max(1)),
        }
    }

    fn touch(&self) {
        self.last_activity.store(now(), Ordering::Relaxed);
    }

    pub async fn snapshot(&self) -> WorkerSnapshot {
        let m = self.mutable.lock().await;
        WorkerSnapshot {
            device: self.device.clone(),
            state: m.state,
            current_model: m.current_model.clone(),
            model_load_timestamp: m.model_load_timestamp,
            model_byte_size: m.model_byte_size,
            active_sessions: m.active_sessions,
            last_activity: self.last_activity.load(Ordering::Relaxed),
            error_message: m.error_message.clone(),
        }
    }

    /// Runs the `initialize` handshake and transitions Uninitialized → Ready.
    pub async fn initialize(&self) -> Result<()> {
        self.transport.initialize().await?;
        let mut m = self.mutable.lock().await;
        m.set_state(&self.device.id, WorkerState::Ready);
        self.touch();
        Ok(())
    }

    pub async fn current_model(&self) -> Option<String> {
        self.mutable.lock().await.current_model.clone()
    }

    /// Records a failure without attempting any IPC — used when the
    /// initial `initialize` handshake itself fails, so the worker still
    /// appears in the pool (as Error) rather than being silently dropped.
    pub async fn mark_error(&self, message: String) {
        let mut m = self.mutable.lock().await;
        m.set_state(&self.device.id, WorkerState::Error);
        m.error_message = Some(message);
    }

    fn require_ready_or_busy(state: WorkerState, gpu_id: &str) -> Result<()> {
        match state {
            WorkerState::Ready | WorkerState::Busy => Ok(()),
            _ => Err(OrchestratorError::WorkerNotReady(gpu_id.to_string())),
        }
    }

    /// Sends `unload_model` over IPC and, on success, clears the resident
    /// model bookkeeping. Returns `Ok(false)` if nothing was loaded.
    pub async fn unload_model(&self) -> Result<bool> {
        let had_model = {
            let m = self.mutable.lock().await;
            m.current_model.clone()
        };
        let Some(model_id) = had_model else {
            return Ok(false);
        };

        let mut payload = serde_json::Map::new();
        payload.insert("model_id".into(), serde_json::Value::String(model_id));
        let request = RequestEnvelope::new(crate::ipc::message_type::UNLOAD_MODEL, "").with_payload(payload);
        let deadlines = CallDeadlines::control(60, 30);
        let outcome = self.transport.call(request, deadlines).await;

        let mut m = self.mutable.lock().await;
        match outcome {
            Ok(CallOutcome::Success(_)) | Ok(CallOutcome::ApplicationFailure(_)) => {
                m.current_model = None;
                m.model_load_timestamp = None;
                m.model_byte_size = 0;
                self.touch();
                Ok(true)
            }
            Err(e) => {
                m.set_state(&self.device.id, WorkerState::Error);
                m.error_message = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Sends `load_model` over IPC and records the new residency on
    /// success. The caller is responsible for the auto-unload rule and for
    /// updating the cache's resident-device set.
    pub async fn load_model(&self, model_id: &str, path: &std::path::Path, size_bytes: u64) -> Result<()> {
        {
            let m = self.mutable.lock().await;
            Self::require_ready_or_busy(m.state, &self.device.id)?;
        }

        let mut payload = serde_json::Map::new();
        payload.insert("model_id".into(), serde_json::Value::String(model_id.to_string()));
        payload.insert(
            "path".into(),
            serde_json::Value::String(path.display().to_string()),
        );
        let request = RequestEnvelope::new(crate::ipc::message_type::LOAD_MODEL, "").with_payload(payload);
        let deadlines = CallDeadlines::control(60, 30);

        let outcome = self.transport.call(request, deadlines).await;
        let mut m = self.mutable.lock().await;
        match outcome {
            Ok(CallOutcome::Success(_)) => {
                m.current_model = Some(model_id.to_string());
                m.model_load_timestamp = Some(now());
                m.model_byte_size = size_bytes;
                self.touch();
                Ok(())
            }
            Ok(CallOutcome::ApplicationFailure(msg)) => Err(OrchestratorError::LoadFailed(msg)),
            Err(e) => {
                m.set_state(&self.device.id, WorkerState::Error);
                m.error_message = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Sends an advisory `cleanup` message; does not change residency
    /// bookkeeping (the worker decides locally what to drop).
    pub async fn cleanup_memory(&self) -> Result<()> {
        let request = RequestEnvelope::new(crate::ipc::message_type::CLEANUP, "");
        let deadlines = CallDeadlines::control(60, 30);
        match self.transport.call(request, deadlines).await {
            Ok(_) => {
                self.touch();
                Ok(())
            }
            Err(e) => {
                let mut m = self.mutable.lock().await;
                m.set_state(&self.device.id, WorkerState::Error);
                m.error_message = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Acquires an admission slot (FIFO among waiters), marks the worker
    /// Busy for the duration of the call, dispatches the opaque request,
    /// and restores Ready(model) on return — Error on transport failure.
    ///
    /// When `cancel` is given and fires before the reply, the call is
    /// dispatched on a detached task (so its eventual reply is simply
    /// dropped) and this returns `RunOutcome::Cancelled` immediately,
    /// restoring the worker to Ready without waiting further.
    pub async fn run_inference(
        &self,
        request: RequestEnvelope,
        deadlines: CallDeadlines,
        cancel: Option<&CancellationToken>,
    ) -> Result<RunOutcome> {
        {
            let m = self.mutable.lock().await;
            Self::require_ready_or_busy(m.state, &self.device.id)?;
            if m.current_model.is_none() {
                return Err(OrchestratorError::WorkerNotReady(format!(
                    "{}: no model loaded",
                    self.device.id
                )));
            }
        }

        let _permit = self
            .concurrency
            .acquire()
            .await
            .map_err(|_| OrchestratorError::Fatal("worker semaphore closed".to_string()))?;

        {
            let mut m = self.mutable.lock().await;
            m.set_state(&self.device.id, WorkerState::Busy);
            m.active_sessions += 1;
        }

        let transport = self.transport.clone();
        let mut call_task = tokio::spawn(async move { transport.call(request, deadlines).await });

        let outcome = match cancel {
            Some(token) => {
                tokio::select! {
                    result = &mut call_task => Some(result),
                    _ = token.cancelled() => None,
                }
            }
            None => Some(call_task.await),
        };

        let mut m = self.mutable.lock().await;
        m.active_sessions = m.active_sessions.saturating_sub(1);
        self.touch();

        match outcome {
            None => {
                // Cancelled: the spawned task keeps running detached; its
                // reply, whenever it lands, is simply never read.
                m.set_state(&self.device.id, WorkerState::Ready);
                Ok(RunOutcome::Cancelled)
            }
            Some(Ok(Ok(CallOutcome::Success(response)))) => {
                m.set_state(&self.device.id, WorkerState::Ready);
                Ok(RunOutcome::Completed(response.payload))
            }
            Some(Ok(Ok(CallOutcome::ApplicationFailure(msg)))) => {
                m.set_state(&self.device.id, WorkerState::Ready);
                Err(OrchestratorError::ApplicationFailure(msg))
            }
            Some(Ok(Err(e))) => {
                m.set_state(&self.device.id, WorkerState::Error);
                m.error_message = Some(e.to_string());
                Err(e)
            }
            Some(Err(join_err)) => {
                m.set_state(&self.device.id, WorkerState::Error);
                m.error_message = Some(join_err.to_string());
                Err(OrchestratorError::Fatal(format!("inference task panicked: {join_err}")))
            }
        }
    }

    pub async fn dispose(&self) -> Result<()> {
        self.transport.dispose().await?;
        let mut m = self.mutable.lock().await;
        m.set_state(&self.device.id, WorkerState::Disposed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::ResponseEnvelope;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    struct StubTransport {
        fail_next: AtomicBool,
    }

    #[async_trait]
    impl WorkerIpc for StubTransport {
        async fn initialize(&self) -> Result<()> {
            Ok(())
        }

        async fn call(&self, _request: RequestEnvelope, _deadlines: CallDeadlines) -> Result<CallOutcome> {
            if self.fail_next.load(Ordering::SeqCst) {
                return Err(OrchestratorError::TransportFailure("stub eof".into()));
            }
            Ok(CallOutcome::Success(ResponseEnvelope {
                success: true,
                error: None,
                payload: serde_json::Map::new(),
            }))
        }

        async fn dispose(&self) -> Result<()> {
            Ok(())
        }
    }

    fn test_worker() -> Worker {
        Worker::new(
            Device::new("gpu_0", "Test", 12 * 1024 * 1024 * 1024),
            Box::new(StubTransport {
                fail_next: AtomicBool::new(false),
            }),
            1,
        )
    }

    #[tokio::test]
    async fn initialize_transitions_to_ready() {
        let worker = test_worker();
        worker.initialize().await.unwrap();
        let snap = worker.snapshot().await;
        assert_eq!(snap.state, WorkerState::Ready);
    }

    #[tokio::test]
    async fn load_then_unload_clears_current_model() {
        let worker = test_worker();
        worker.initialize().await.unwrap();
        worker
            .load_model("sdxl-base", std::path::Path::new("/models/base.safetensors"), 6 * 1024 * 1024 * 1024)
            .await
            .unwrap();
        assert_eq!(worker.current_model().await, Some("sdxl-base".to_string()));

        let unloaded = worker.unload_model().await.unwrap();
        assert!(unloaded);
        assert_eq!(worker.current_model().await, None);
    }

    #[tokio::test]
    async fn transport_failure_marks_worker_error() {
        let worker = test_worker_with_failing_call();
        worker.initialize().await.unwrap();
        worker
            .load_model("m", std::path::Path::new("/m.safetensors"), 1)
            .await
            .unwrap();
        let req = RequestEnvelope::new("generate_sdxl_enhanced", "s1");
        let result = worker
            .run_inference(req, CallDeadlines::control(60, 600), None)
            .await;
        assert!(result.is_err());
        assert_eq!(worker.snapshot().await.state, WorkerState::Error);
    }

    struct FlakyTransport {
        calls: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl WorkerIpc for FlakyTransport {
        async fn initialize(&self) -> Result<()> {
            Ok(())
        }

        async fn call(&self, _request: RequestEnvelope, _deadlines: CallDeadlines) -> Result<CallOutcome> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Ok(CallOutcome::Success(ResponseEnvelope {
                    success: true,
                    error: None,
                    payload: serde_json::Map::new(),
                }))
            } else {
                Err(OrchestratorError::TransportFailure("closed".into()))
            }
        }

        async fn dispose(&self) -> Result<()> {
            Ok(())
        }
    }

    fn test_worker_with_failing_call() -> Worker {
        Worker::new(
            Device::new("gpu_1", "Test", 8 * 1024 * 1024 * 1024),
            Box::new(FlakyTransport {
                calls: std::sync::atomic::AtomicU32::new(1),
            }),
            1,
        )
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
                payload: serde_json::Map::new(),
            }))
        }

        async fn dispose(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn cancellation_returns_worker_to_ready_without_waiting() {
        let worker = Worker::new(
            Device::new("gpu_0", "Test", 12 * 1024 * 1024 * 1024),
            Box::new(SlowTransport),
            1,
        );
        worker.initialize().await.unwrap();
        worker
            .load_model("m", std::path::Path::new("/m.safetensors"), 1)
            .await
            .unwrap();

        let token = CancellationToken::new();
        let req = RequestEnvelope::new("generate_sdxl_enhanced", "s1");

        let cancel_at = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        };
        let (result, _) = tokio::join!(
            worker.run_inference(req, CallDeadlines::control(60, 600), Some(&token)),
            cancel_at
        );

        assert!(matches!(result, Ok(RunOutcome::Cancelled)));
        assert_eq!(worker.snapshot().await.state, WorkerState::Ready);
    }
}
