//! Pure placement and rebalancing algorithms (spec §4.1), kept free of any
//! lock or IPC concern so they can be tested as ordinary functions over a
//! snapshot — `find_best_available` is required to be "a pure function of
//! the observable worker map at call time" (spec §8).

use crate::cache::ModelType;
use crate::pool::worker::{WorkerSnapshot, WorkerState};

/// One worker's placement-relevant facts, decoupled from the live `Worker`
/// type so the algorithm itself never touches a lock.
#[derive(Debug, Clone)]
pub struct PlacementCandidate {
    pub gpu_id: String,
    pub state: WorkerState,
    pub available_vram_bytes: u64,
    pub current_model_type: Option<ModelType>,
}

impl PlacementCandidate {
    pub fn from_snapshot(snapshot: &WorkerSnapshot, current_model_type: Option<ModelType>) -> Self {
        Self {
            gpu_id: snapshot.device.id.clone(),
            state: snapshot.state,
            available_vram_bytes: snapshot.device.available_vram_bytes,
            current_model_type,
        }
    }
}

/// Among Ready workers with no resident model, picks the one with the
/// largest available VRAM, breaking ties by ascending device id. Falling
/// back to Ready-with-resident-model-of-the-requested-type (first by
/// ascending device id) if no idle candidate exists. `None` if the pool is
/// empty or nothing qualifies.
pub fn find_best_available(
    candidates: &[PlacementCandidate],
    requested_type: ModelType,
) -> Option<String> {
    let mut idle: Vec<&PlacementCandidate> = candidates
        .iter()
        .filter(|c| c.state == WorkerState::Ready && c.current_model_type.is_none())
        .collect();

    if !idle.is_empty() {
        idle.sort_by(|a, b| {
            b.available_vram_bytes
                .cmp(&a.available_vram_bytes)
                .then_with(|| a.gpu_id.cmp(&b.gpu_id))
        });
        return idle.first().map(|c| c.gpu_id.clone());
    }

    let mut matching: Vec<&PlacementCandidate> = candidates
        .iter()
        .filter(|c| c.state == WorkerState::Ready && c.current_model_type == Some(requested_type))
        .collect();
    matching.sort_by(|a, b| a.gpu_id.cmp(&b.gpu_id));
    matching.first().map(|c| c.gpu_id.clone())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecommendationKind {
    Migrate,
    Cleanup,
}

#[derive(Debug, Clone)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub gpu_id: String,
    pub target_gpu_id: Option<String>,
    pub expected_benefit: f32,
    pub priority: u8,
}

#[derive(Debug, Clone)]
pub struct UtilizationSample {
    pub gpu_id: String,
    pub utilization_percent: f32,
    pub has_resident_model: bool,
}

const HIGH_UTILIZATION_THRESHOLD: f32 = 85.0;
const LOW_UTILIZATION_THRESHOLD: f32 = 50.0;
const IDLE_UTILIZATION_THRESHOLD: f32 = 10.0;

/// Advisory-only recommendations (spec §4.1); never executed by the pool
/// itself.
pub fn auto_balance(samples: &[UtilizationSample]) -> Vec<Recommendation> {
    let mut recommendations = Vec::new();

    for sample in samples {
        if sample.utilization_percent > HIGH_UTILIZATION_THRESHOLD {
            if let Some(target) = samples
                .iter()
                .filter(|s| s.gpu_id != sample.gpu_id && s.utilization_percent < LOW_UTILIZATION_THRESHOLD)
                .min_by(|a, b| a.utilization_percent.total_cmp(&b.utilization_percent))
            {
                let benefit = ((sample.utilization_percent - target.utilization_percent) / 100.0).clamp(0.0, 1.0);
                recommendations.push(Recommendation {
                    kind: RecommendationKind::Migrate,
                    gpu_id: sample.gpu_id.clone(),
                    target_gpu_id: Some(target.gpu_id.clone()),
                    expected_benefit: benefit,
                    priority: 1,
                });
            }
        }

        if sample.has_resident_model && sample.utilization_percent < IDLE_UTILIZATION_THRESHOLD {
            recommendations.push(Recommendation {
                kind: RecommendationKind::Cleanup,
                gpu_id: sample.gpu_id.clone(),
                target_gpu_id: None,
                expected_benefit: (IDLE_UTILIZATION_THRESHOLD - sample.utilization_percent) / 100.0,
                priority: 2,
            });
        }
    }

    recommendations
}
