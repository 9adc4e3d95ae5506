//! Worker Pool Manager (spec §4.1): owns Worker lifecycle, answers
//! placement queries, routes inference calls, and surfaces aggregate pool
//! state. Structural mutation of the worker map (insert/remove) happens
//! under one short-held pool mutex; everything about an individual
//! worker's state lives behind that worker's own lock (`pool::worker`).

pub mod placement;
pub mod worker;

pub use placement::{Recommendation, RecommendationKind, UtilizationSample};
pub use worker::{RunOutcome, Worker, WorkerSnapshot, WorkerState};

use crate::cache::{ComponentRole, ModelCache, ModelType, SuiteSpec};
use crate::core::{CancellationToken, Device, DeviceDiscovery};
use crate::ipc::{CallDeadlines, HttpTransport, RequestEnvelope, StdioTransport, WorkerIpc};
use crate::{OrchestratorError, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Spawns the IPC transport for a newly discovered device. Swapping the
/// implementation is how `worker.transport` (stdio vs http) is selected at
/// startup without the pool itself knowing which.
pub trait WorkerTransportFactory: Send + Sync {
    fn create(&self, device: &Device) -> Result<Box<dyn WorkerIpc>>;
}

pub struct StdioTransportFactory {
    pub interpreter_path: PathBuf,
    pub script_path: PathBuf,
}

impl WorkerTransportFactory for StdioTransportFactory {
    fn create(&self, _device: &Device) -> Result<Box<dyn WorkerIpc>> {
        Ok(Box::new(StdioTransport::spawn(
            &self.interpreter_path,
            &self.script_path,
        )?))
    }
}

pub struct HttpTransportFactory {
    pub base_url: String,
}

impl WorkerTransportFactory for HttpTransportFactory {
    fn create(&self, _device: &Device) -> Result<Box<dyn WorkerIpc>> {
        Ok(Box::new(HttpTransport::new(self.base_url.clone())))
    }
}

#[derive(Debug, Clone)]
pub struct ModelLoadSpec {
    pub model_id: String,
    pub display_name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LoadReport {
    pub gpu_id: String,
    pub model_id: String,
    pub size_bytes: u64,
    pub unloaded_previous: Option<String>,
    pub evicted: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct WorkerStatusView {
    pub gpu_id: String,
    pub state: WorkerState,
    pub current_model: Option<String>,
    pub active_sessions: u32,
    pub available_vram_bytes: u64,
    pub total_vram_bytes: u64,
    pub last_activity: u64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub workers: Vec<WorkerStatusView>,
    pub total_workers: usize,
    pub ready_workers: usize,
    pub busy_workers: usize,
    pub error_workers: usize,
}

#[derive(Debug, Clone)]
pub struct SuiteLoadReport {
    pub gpu_id: String,
    pub components: HashMap<String, std::result::Result<LoadReport, String>>,
}

#[derive(Debug, Clone)]
pub struct BatchLoadResult {
    pub per_gpu: HashMap<String, std::result::Result<LoadReport, String>>,
    pub any_succeeded: bool,
}

pub struct WorkerPoolManager {
    cache: Arc<ModelCache>,
    workers: RwLock<HashMap<String, Arc<Worker>>>,
    concurrency_cap: usize,
}

impl WorkerPoolManager {
    pub fn new(cache: Arc<ModelCache>, concurrency_cap: usize) -> Self {
        Self {
            cache,
            workers: RwLock::new(HashMap::new()),
            concurrency_cap: concurrency_cap.max(1),
        }
    }

    /// Enumerates devices and spawns one Worker per device. Device
    /// enumeration failing is the one fatal condition in an otherwise
    /// best-effort pool (spec §4.1); an individual worker's handshake
    /// failing just leaves that worker in Error, still present in the map.
    pub async fn initialize(
        &self,
        discovery: &dyn DeviceDiscovery,
        factory: &dyn WorkerTransportFactory,
    ) -> Result<()> {
        let devices = discovery.discover().await.map_err(|e| {
            OrchestratorError::Fatal(format!("device enumeration failed: {e}"))
        })?;

        let mut workers = self.workers.write().await;
        for device in devices {
            let transport = match factory.create(&device) {
                Ok(t) => t,
                Err(e) => {
                    tracing::error!("failed to spawn transport for {}: {e}", device.id);
                    continue;
                }
            };
            let worker = Arc::new(Worker::new(device.clone(), transport, self.concurrency_cap));
            if let Err(e) = worker.initialize().await {
                tracing::error!("worker {} failed to initialize: {e}", device.id);
                worker.mark_error(e.to_string()).await;
            }
            workers.insert(device.id.clone(), worker);
        }
        Ok(())
    }

    async fn get_worker(&self, gpu_id: &str) -> Result<Arc<Worker>> {
        self.workers
            .read()
            .await
            .get(gpu_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::WorkerMissing(gpu_id.to_string()))
    }

    #[tracing::instrument(skip(self, spec), fields(gpu_id, model_id = %spec.model_id))]
    pub async fn load_model(&self, gpu_id: &str, spec: ModelLoadSpec) -> Result<LoadReport> {
        let worker = self.get_worker(gpu_id).await?;
        let cache_outcome = self
            .cache
            .cache(&spec.model_id, &spec.display_name, &spec.path, false)
            .await?;

        let previous = worker.current_model().await;
        let mut unloaded_previous = None;
        if previous.as_deref() != Some(spec.model_id.as_str()) {
            if let Some(prev_id) = previous {
                match worker.unload_model().await {
                    Ok(true) => {
                        let _ = self.cache.unload_from_gpu(&prev_id, gpu_id).await;
                        unloaded_previous = Some(prev_id);
                    }
                    Ok(false) => {}
                    Err(e) => {
                        // Auto-unload rule (spec §4.1): a failed implicit
                        // unload is logged and the load proceeds anyway.
                        tracing::warn!("implicit unload of {prev_id} on {gpu_id} failed: {e}");
                    }
                }
            }
        }

        worker
            .load_model(&spec.model_id, &spec.path, cache_outcome.size_bytes)
            .await?;
        self.cache.load_to_gpu(&spec.model_id, gpu_id).await?;

        Ok(LoadReport {
            gpu_id: gpu_id.to_string(),
            model_id: spec.model_id,
            size_bytes: cache_outcome.size_bytes,
            unloaded_previous,
            evicted: cache_outcome.evicted,
        })
    }

    #[tracing::instrument(skip(self), fields(gpu_id))]
    pub async fn unload_model(&self, gpu_id: &str) -> Result<bool> {
        let worker = self.get_worker(gpu_id).await?;
        let previous = worker.current_model().await;
        let had = worker.unload_model().await?;
        if had {
            if let Some(prev_id) = previous {
                self.cache.unload_from_gpu(&prev_id, gpu_id).await?;
            }
        }
        Ok(had)
    }

    #[tracing::instrument(skip(self, request, deadlines, cancel), fields(gpu_id, message_type = %request.message_type))]
    pub async fn run_inference(
        &self,
        gpu_id: &str,
        request: RequestEnvelope,
        deadlines: CallDeadlines,
        cancel: Option<&CancellationToken>,
    ) -> Result<RunOutcome> {
        let worker = self.get_worker(gpu_id).await?;
        worker.run_inference(request, deadlines, cancel).await
    }

    pub async fn cleanup_memory(&self, gpu_id: &str) -> Result<bool> {
        let worker = self.get_worker(gpu_id).await?;
        worker.cleanup_memory().await?;
        Ok(true)
    }

    pub async fn pool_status(&self) -> PoolStatus {
        let workers = self.workers.read().await;
        let mut views = Vec::with_capacity(workers.len());
        let (mut ready, mut busy, mut error) = (0, 0, 0);
        for worker in workers.values() {
            let snap = worker.snapshot().await;
            match snap.state {
                WorkerState::Ready => ready += 1,
                WorkerState::Busy => busy += 1,
                WorkerState::Error => error += 1,
                _ => {}
            }
            views.push(WorkerStatusView {
                gpu_id: snap.device.id.clone(),
                state: snap.state,
                current_model: snap.current_model,
                active_sessions: snap.active_sessions,
                available_vram_bytes: snap.device.available_vram_bytes,
                total_vram_bytes: snap.device.total_vram_bytes,
                last_activity: snap.last_activity,
                error_message: snap.error_message,
            });
        }
        views.sort_by(|a, b| a.gpu_id.cmp(&b.gpu_id));
        PoolStatus {
            total_workers: views.len(),
            ready_workers: ready,
            busy_workers: busy,
            error_workers: error,
            workers: views,
        }
    }

    /// Resolves the snapshot + per-worker resident-model type, then
    /// delegates to the pure [`placement::find_best_available`].
    pub async fn find_best_available(&self, requested_type: ModelType) -> Option<String> {
        let workers = self.workers.read().await;
        let mut candidates = Vec::with_capacity(workers.len());
        for worker in workers.values() {
            let snap = worker.snapshot().await;
            let model_type = match &snap.current_model {
                Some(id) => self.cache.get(id).await.map(|e| e.type_tag),
                None => None,
            };
            candidates.push(placement::PlacementCandidate::from_snapshot(&snap, model_type));
        }
        placement::find_best_available(&candidates, requested_type)
    }

    pub async fn auto_balance(&self, samples: &[UtilizationSample]) -> Vec<Recommendation> {
        placement::auto_balance(samples)
    }

    /// Builds the `UtilizationSample` slice `auto_balance` needs by polling
    /// `metrics` for every worker currently in the pool. A worker the
    /// metrics source has no reading for (e.g. a vendor toolchain not
    /// available on this host) is skipped rather than assigned a fabricated
    /// utilization (spec §9: the metrics capability never fabricates values
    /// it can't actually observe).
    pub async fn utilization_samples(
        &self,
        metrics: &dyn crate::metrics::MetricsSource,
    ) -> Vec<UtilizationSample> {
        let workers = self.workers.read().await;
        let mut samples = Vec::with_capacity(workers.len());
        for worker in workers.values() {
            let snap = worker.snapshot().await;
            if let Some(reading) = metrics.snapshot(&snap.device.id).await {
                samples.push(UtilizationSample {
                    gpu_id: snap.device.id.clone(),
                    utilization_percent: reading.vram_used_percent,
                    has_resident_model: snap.current_model.is_some(),
                });
            }
        }
        samples
    }

    /// Convenience composition of [`Self::utilization_samples`] and
    /// [`placement::auto_balance`] for callers that just want live
    /// recommendations without managing the intermediate sample vector.
    pub async fn auto_balance_live(
        &self,
        metrics: &dyn crate::metrics::MetricsSource,
    ) -> Vec<Recommendation> {
        let samples = self.utilization_samples(metrics).await;
        placement::auto_balance(&samples)
    }

    /// Fans a single model load out across multiple GPUs (spec §4.1).
    /// Failures are isolated per GPU; the aggregate succeeds if any one
    /// GPU succeeded.
    pub async fn batch_load(
        &self,
        spec_template: ModelLoadSpec,
        gpu_ids: &[String],
        parallel: bool,
    ) -> BatchLoadResult {
        let mut per_gpu = HashMap::new();

        if parallel {
            let futures = gpu_ids.iter().map(|gpu_id| {
                let spec = spec_template.clone();
                async move { (gpu_id.clone(), self.load_model(gpu_id, spec).await) }
            });
            for (gpu_id, result) in futures::future::join_all(futures).await {
                per_gpu.insert(gpu_id, result.map_err(|e| e.to_string()));
            }
        } else {
            for gpu_id in gpu_ids {
                let result = self.load_model(gpu_id, spec_template.clone()).await;
                per_gpu.insert(gpu_id.clone(), result.map_err(|e| e.to_string()));
            }
        }

        let any_succeeded = per_gpu.values().any(|r| r.is_ok());
        BatchLoadResult { per_gpu, any_succeeded }
    }

    /// Caches every present suite component, then loads each successfully
    /// cached component onto `gpu_id`. Partial success is allowed at both
    /// stages (spec §4.1/§4.2).
    pub async fn load_suite(&self, gpu_id: &str, suite: &SuiteSpec) -> SuiteLoadReport {
        let cache_outcomes = self.cache.cache_suite(suite, false).await;
        let mut components = HashMap::new();

        for (role, outcome) in cache_outcomes {
            let component_name = role.as_str().to_string();
            match outcome {
                Ok(cache_outcome) => {
                    let path = suite
                        .components
                        .get(&role)
                        .cloned()
                        .unwrap_or_default();
                    let load_spec = ModelLoadSpec {
                        model_id: cache_outcome.id.clone(),
                        display_name: format!("{} ({component_name})", suite.name),
                        path,
                    };
                    let result = self
                        .load_model(gpu_id, load_spec)
                        .await
                        .map_err(|e| e.to_string());
                    components.insert(component_name, result);
                }
                Err(e) => {
                    components.insert(component_name, Err(e.to_string()));
                }
            }
        }

        SuiteLoadReport {
            gpu_id: gpu_id.to_string(),
            components,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StaticDeviceDiscovery;
    use crate::ipc::{CallOutcome, ResponseEnvelope};
    use async_trait::async_trait;

    struct StubIpc;

    #[async_trait]
    impl WorkerIpc for StubIpc {
        async fn initialize(&self) -> Result<()> {
            Ok(())
        }
        async fn call(&self, _request: RequestEnvelope, _deadlines: CallDeadlines) -> Result<CallOutcome> {
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

    struct StubFactory;

    impl WorkerTransportFactory for StubFactory {
        fn create(&self, _device: &Device) -> Result<Box<dyn WorkerIpc>> {
            Ok(Box::new(StubIpc))
        }
    }

    async fn test_pool(devices: Vec<Device>) -> WorkerPoolManager {
        let cache = Arc::new(ModelCache::new(10 * 1024 * 1024 * 1024, 86400));
        let pool = WorkerPoolManager::new(cache, 1);
        let discovery = StaticDeviceDiscovery::new(devices);
        pool.initialize(&discovery, &StubFactory).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn initialize_populates_ready_workers() {
        let pool = test_pool(vec![Device::new("gpu_0", "Test", 12 * 1024 * 1024 * 1024)]).await;
        let status = pool.pool_status().await;
        assert_eq!(status.total_workers, 1);
        assert_eq!(status.ready_workers, 1);
    }

    #[tokio::test]
    async fn find_best_available_picks_largest_free_vram() {
        let pool = test_pool(vec![
            Device::new("gpu_1", "A", 8 * 1024 * 1024 * 1024),
            Device::new("gpu_0", "B", 8 * 1024 * 1024 * 1024),
        ])
        .await;
        let chosen = pool.find_best_available(ModelType::Base).await;
        assert_eq!(chosen, Some("gpu_0".to_string()));
    }

    #[tokio::test]
    async fn auto_balance_live_skips_workers_with_no_metrics_reading() {
        use crate::metrics::{StubMetricsSource, UtilizationSnapshot};

        let pool = test_pool(vec![
            Device::new("gpu_0", "A", 8 * 1024 * 1024 * 1024),
            Device::new("gpu_1", "B", 8 * 1024 * 1024 * 1024),
        ])
        .await;

        let metrics = StubMetricsSource::new();
        metrics
            .set(
                "gpu_0",
                UtilizationSnapshot {
                    vram_used_percent: 92.0,
                    compute_util_percent: 0.0,
                },
            )
            .await;
        // gpu_1 deliberately left unset.

        let samples = pool.utilization_samples(&metrics).await;
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].gpu_id, "gpu_0");

        let recs = pool.auto_balance_live(&metrics).await;
        assert!(recs.iter().all(|r| r.gpu_id == "gpu_0"));
    }

    #[tokio::test]
    async fn load_model_implicitly_unloads_previous() {
        let dir = tempfile::tempdir().unwrap();
        let base_path = dir.path().join("base.safetensors");
        tokio::fs::write(&base_path, vec![0u8; 1024]).await.unwrap();
        let refiner_path = dir.path().join("refiner.safetensors");
        tokio::fs::write(&refiner_path, vec![0u8; 1024]).await.unwrap();

        let pool = test_pool(vec![Device::new("gpu_0", "Test", 12 * 1024 * 1024 * 1024)]).await;

        pool.load_model(
            "gpu_0",
            ModelLoadSpec {
                model_id: "sdxl-base".into(),
                display_name: "SDXL Base".into(),
                path: base_path,
            },
        )
        .await
        .unwrap();

        let report = pool
            .load_model(
                "gpu_0",
                ModelLoadSpec {
                    model_id: "sdxl-refiner".into(),
                    display_name: "SDXL Refiner".into(),
                    path: refiner_path,
                },
            )
            .await
            .unwrap();

        assert_eq!(report.unloaded_previous, Some("sdxl-base".to_string()));
        assert_eq!(report.model_id, "sdxl-refiner");
    }

    #[tokio::test]
    async fn load_model_against_missing_worker_fails() {
        let pool = test_pool(vec![]).await;
        let result = pool
            .load_model(
                "gpu_0",
                ModelLoadSpec {
                    model_id: "sdxl-base".into(),
                    display_name: "SDXL Base".into(),
                    path: PathBuf::from("/models/base.safetensors"),
                },
            )
            .await;
        assert!(matches!(result, Err(OrchestratorError::WorkerMissing(_))));
    }

    #[tokio::test]
    async fn batch_load_isolates_per_gpu_failure_and_succeeds_if_any_did() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base.safetensors");
        tokio::fs::write(&path, vec![0u8; 1024]).await.unwrap();

        let pool = test_pool(vec![Device::new("gpu_0", "Test", 12 * 1024 * 1024 * 1024)]).await;
        let spec = ModelLoadSpec {
            model_id: "sdxl-base".into(),
            display_name: "SDXL Base".into(),
            path,
        };

        let result = pool
            .batch_load(
                spec,
                &["gpu_0".to_string(), "gpu_missing".to_string()],
                true,
            )
            .await;

        assert!(result.any_succeeded);
        assert!(result.per_gpu.get("gpu_0").unwrap().is_ok());
        assert!(result.per_gpu.get("gpu_missing").unwrap().is_err());
    }

    #[tokio::test]
    async fn load_suite_loads_every_cached_component_onto_the_gpu() {
        let dir = tempfile::tempdir().unwrap();
        let base_path = dir.path().join("base.safetensors");
        tokio::fs::write(&base_path, vec![0u8; 512]).await.unwrap();
        let vae_path = dir.path().join("vae.safetensors");
        tokio::fs::write(&vae_path, vec![0u8; 256]).await.unwrap();
        let missing_path = dir.path().join("does-not-exist.safetensors");

        let pool = test_pool(vec![Device::new("gpu_0", "Test", 12 * 1024 * 1024 * 1024)]).await;

        let mut components = HashMap::new();
        components.insert(ComponentRole::Base, base_path);
        components.insert(ComponentRole::Vae, vae_path);
        components.insert(ComponentRole::Lora, missing_path);
        let suite = SuiteSpec {
            name: "portrait".to_string(),
            components,
        };

        let report = pool.load_suite("gpu_0", &suite).await;
        assert_eq!(report.gpu_id, "gpu_0");
        assert!(report.components.get("base").unwrap().is_ok());
        assert!(report.components.get("vae").unwrap().is_ok());
        assert!(report.components.get("lora").unwrap().is_err());

        let snap = pool.get_worker("gpu_0").await.unwrap().snapshot().await;
        assert_eq!(snap.current_model.as_deref(), Some("sdxl_portrait_vae"));
    }
}
