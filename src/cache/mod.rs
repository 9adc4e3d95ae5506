//! Shared-RAM model cache (spec §4.2): content-addressed storage for model
//! weights on the host, independent of which GPU/worker they are later
//! loaded onto. Loads never hold the map lock across disk I/O — the file is
//! staged (metadata + content hash) before the lock is acquired for the
//! insert-and-account step.

pub mod suite;
pub mod validate;

pub use suite::{ComponentRole, SuiteRecord, SuiteSpec};
pub use validate::{validate_paths, ModelFormat, ModelType, ValidationReport};

use crate::{OrchestratorError, Result};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct ModelEntry {
    pub id: String,
    pub display_name: String,
    pub path: PathBuf,
    pub type_tag: ModelType,
    pub size_bytes: u64,
    pub cached_at: u64,
    pub last_used: u64,
    /// Monotonic logical clock bumped every time `last_used` is refreshed.
    /// `last_used` alone is second-resolution and ties routinely within a
    /// single `#[tokio::test]`; eviction order sorts on this instead so LRU
    /// order is deterministic regardless of wall-clock granularity.
    pub last_used_seq: u64,
    pub use_count: u64,
    /// GPU device ids the model is currently resident on. Populated by
    /// [`ModelCache::load_to_gpu`], cleared by [`ModelCache::unload_from_gpu`].
    /// Independent per-component: a suite's VAE and base can each carry
    /// their own residency set on the same device (see DESIGN.md on the
    /// one-model-per-worker invariant and suites).
    pub resident_devices: HashSet<String>,
}

/// Result of a successful [`ModelCache::cache`] call.
#[derive(Debug, Clone)]
pub struct CacheOutcome {
    pub id: String,
    pub size_bytes: u64,
    pub evicted: Vec<String>,
}

struct Inner {
    entries: HashMap<String, ModelEntry>,
    total_bytes: u64,
    next_seq: u64,
}

impl Inner {
    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

pub struct ModelCache {
    inner: RwLock<Inner>,
    budget_bytes: u64,
    idle_eviction_secs: u64,
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl ModelCache {
    pub fn new(budget_bytes: u64, idle_eviction_secs: u64) -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                total_bytes: 0,
                next_seq: 0,
            }),
            budget_bytes,
            idle_eviction_secs,
        }
    }

    /// Caches a single model file under `id`, staging the read before
    /// acquiring the write lock for insertion. If `force` is false and an
    /// entry with the same id already exists, the existing entry is
    /// returned unchanged (idempotent re-cache).
    #[tracing::instrument(skip(self, path), fields(model_id = %id))]
    pub async fn cache(&self, id: &str, display_name: &str, path: &Path, force: bool) -> Result<CacheOutcome> {
        if !force {
            let guard = self.inner.read().await;
            if let Some(existing) = guard.entries.get(id) {
                return Ok(CacheOutcome {
                    id: existing.id.clone(),
                    size_bytes: existing.size_bytes,
                    evicted: Vec::new(),
                });
            }
        }

        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|_| OrchestratorError::FileMissing(path.display().to_string()))?;
        let size_bytes = metadata.len();
        let type_tag = validate::classify_by_size(size_bytes);

        // Staged outside the lock: content hash is read-only work against
        // the filesystem, never performed while holding `inner`.
        let _content_key = content_key(path).await?;

        let mut guard = self.inner.write().await;
        let evicted = make_room(&mut guard, size_bytes, self.budget_bytes, Some(id))?;
        let entry = ModelEntry {
            id: id.to_string(),
            display_name: display_name.to_string(),
            path: path.to_path_buf(),
            type_tag,
            size_bytes,
            cached_at: now(),
            last_used: now(),
            last_used_seq: guard.bump_seq(),
            use_count: 0,
            resident_devices: HashSet::new(),
        };
        guard.total_bytes += size_bytes;
        guard.entries.insert(id.to_string(), entry);

        Ok(CacheOutcome {
            id: id.to_string(),
            size_bytes,
            evicted,
        })
    }

    /// Caches every present component of a suite under the
    /// `sdxl_<name>_<component>` convention (spec §4.2). Partial success is
    /// allowed: a failing component does not roll back components already
    /// cached, and the remaining components are still attempted.
    #[tracing::instrument(skip(self, spec), fields(suite = %spec.name))]
    pub async fn cache_suite(
        &self,
        spec: &SuiteSpec,
        force: bool,
    ) -> Vec<(ComponentRole, Result<CacheOutcome>)> {
        let mut outcomes = Vec::with_capacity(spec.components.len());
        for role in ComponentRole::ALL {
            if let Some(path) = spec.components.get(&role) {
                let id = spec.component_id(role);
                let display_name = format!("{} ({})", spec.name, role.as_str());
                let result = self.cache(&id, &display_name, path, force).await;
                outcomes.push((role, result));
            }
        }
        outcomes
    }

    /// Removes an entry entirely, regardless of GPU residency bookkeeping —
    /// callers are responsible for unloading from any worker first.
    #[tracing::instrument(skip(self), fields(model_id = %id))]
    pub async fn uncache(&self, id: &str) -> Result<()> {
        let mut guard = self.inner.write().await;
        let entry = guard
            .entries
            .remove(id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("model not cached: {id}")))?;
        guard.total_bytes = guard.total_bytes.saturating_sub(entry.size_bytes);
        Ok(())
    }

    pub async fn is_cached(&self, id: &str) -> bool {
        self.inner.read().await.entries.contains_key(id)
    }

    pub async fn get(&self, id: &str) -> Option<ModelEntry> {
        self.inner.read().await.entries.get(id).cloned()
    }

    /// Marks an entry resident on `device_id` and bumps use accounting.
    /// Does not itself move bytes — the IPC layer instructs the worker to
    /// load the file; this call records the resulting state.
    #[tracing::instrument(skip(self), fields(model_id = %id, gpu_id = %device_id))]
    pub async fn load_to_gpu(&self, id: &str, device_id: &str) -> Result<()> {
        let mut guard = self.inner.write().await;
        let seq = guard.bump_seq();
        let entry = guard
            .entries
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("model not cached: {id}")))?;
        entry.resident_devices.insert(device_id.to_string());
        entry.last_used = now();
        entry.last_used_seq = seq;
        entry.use_count += 1;
        Ok(())
    }

    /// Clears the residency marker for `device_id`, leaving the cached
    /// bytes and the entry itself untouched.
    pub async fn unload_from_gpu(&self, id: &str, device_id: &str) -> Result<()> {
        let mut guard = self.inner.write().await;
        if let Some(entry) = guard.entries.get_mut(id) {
            entry.resident_devices.remove(device_id);
        }
        Ok(())
    }

    /// Evicts every entry idle for longer than the configured threshold and
    /// not currently resident on any device. Returns the evicted ids.
    ///
    /// The comparison is inclusive (`<=`) so an `idle_eviction_secs = 0`
    /// budget evicts an entry cached in the same wall-clock second as the
    /// sweep, rather than silently keeping it until the next second ticks
    /// over.
    #[tracing::instrument(skip(self))]
    pub async fn cleanup(&self) -> Vec<String> {
        let mut guard = self.inner.write().await;
        let cutoff = now().saturating_sub(self.idle_eviction_secs);
        let stale: Vec<String> = guard
            .entries
            .values()
            .filter(|e| e.resident_devices.is_empty() && e.last_used <= cutoff)
            .map(|e| e.id.clone())
            .collect();

        for id in &stale {
            if let Some(entry) = guard.entries.remove(id) {
                guard.total_bytes = guard.total_bytes.saturating_sub(entry.size_bytes);
            }
        }
        stale
    }

    pub async fn total_bytes(&self) -> u64 {
        self.inner.read().await.total_bytes
    }

    /// Derived suite view: groups cached entries whose id matches the
    /// suite naming convention.
    pub async fn suites(&self) -> Vec<SuiteRecord> {
        let guard = self.inner.read().await;
        let mut by_name: HashMap<String, HashMap<String, String>> = HashMap::new();
        for id in guard.entries.keys() {
            if let Some((name, role)) = suite::parse_suite_component(id) {
                by_name
                    .entry(name)
                    .or_default()
                    .insert(role.as_str().to_string(), id.clone());
            }
        }
        by_name
            .into_iter()
            .map(|(name, components)| SuiteRecord { name, components })
            .collect()
    }
}

/// Evicts least-recently-used, non-resident entries until `incoming_bytes`
/// fits under `budget_bytes`, or fails with [`OrchestratorError::BudgetExceeded`]
/// if even evicting everything evictable would not make room.
fn make_room(
    guard: &mut Inner,
    incoming_bytes: u64,
    budget_bytes: u64,
    keep_id: Option<&str>,
) -> Result<Vec<String>> {
    let mut evicted = Vec::new();
    if guard.total_bytes + incoming_bytes <= budget_bytes {
        return Ok(evicted);
    }

    let mut candidates: Vec<&ModelEntry> = guard
        .entries
        .values()
        .filter(|e| e.resident_devices.is_empty() && Some(e.id.as_str()) != keep_id)
        .collect();
    // `last_used` has 1-second resolution; `last_used_seq` is the
    // monotonic tie-break that gives deterministic LRU order for entries
    // cached within the same wall-clock second.
    candidates.sort_by_key(|e| e.last_used_seq);
    let candidate_ids: Vec<String> = candidates.into_iter().map(|e| e.id.clone()).collect();

    for id in candidate_ids {
        if guard.total_bytes + incoming_bytes <= budget_bytes {
            break;
        }
        if let Some(entry) = guard.entries.remove(&id) {
            guard.total_bytes = guard.total_bytes.saturating_sub(entry.size_bytes);
            evicted.push(id);
        }
    }

    if guard.total_bytes + incoming_bytes > budget_bytes {
        return Err(OrchestratorError::BudgetExceeded(format!(
            "cache budget {budget_bytes} bytes exceeded: {} in use, {incoming_bytes} requested",
            guard.total_bytes
        )));
    }

    Ok(evicted)
}

async fn content_key(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|_| OrchestratorError::FileMissing(path.display().to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_fixture(dir: &tempfile::TempDir, name: &str, size: usize) -> PathBuf {
        let path = dir.path().join(name);
        tokio::fs::write(&path, vec![0u8; size]).await.unwrap();
        path
    }

    #[tokio::test]
    async fn cache_and_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(&dir, "model.safetensors", 1024).await;
        let cache = ModelCache::new(10 * 1024 * 1024, 86400);

        let outcome = cache.cache("m1", "Model One", &path, false).await.unwrap();
        assert_eq!(outcome.size_bytes, 1024);
        assert!(cache.is_cached("m1").await);
        assert!(cache.get("m1").await.is_some());
    }

    #[tokio::test]
    async fn budget_enforcement_evicts_lru_non_resident() {
        let dir = tempfile::tempdir().unwrap();
        let small_budget = 1500u64;
        let cache = ModelCache::new(small_budget, 86400);

        let p1 = write_fixture(&dir, "a.safetensors", 1000).await;
        cache.cache("a", "A", &p1, false).await.unwrap();

        let p2 = write_fixture(&dir, "b.safetensors", 1000).await;
        let outcome = cache.cache("b", "B", &p2, false).await.unwrap();

        assert_eq!(outcome.evicted, vec!["a".to_string()]);
        assert!(!cache.is_cached("a").await);
        assert!(cache.is_cached("b").await);
    }

    #[tokio::test]
    async fn budget_exceeded_when_resident_entries_cannot_be_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ModelCache::new(1200, 86400);

        let p1 = write_fixture(&dir, "a.safetensors", 1000).await;
        cache.cache("a", "A", &p1, false).await.unwrap();
        cache.load_to_gpu("a", "gpu_0").await.unwrap();

        let p2 = write_fixture(&dir, "b.safetensors", 1000).await;
        let result = cache.cache("b", "B", &p2, false).await;
        assert!(matches!(result, Err(OrchestratorError::BudgetExceeded(_))));
    }

    #[tokio::test]
    async fn cache_suite_registers_components_under_naming_convention() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_fixture(&dir, "base.safetensors", 512).await;
        let vae = write_fixture(&dir, "vae.safetensors", 256).await;

        let mut components = HashMap::new();
        components.insert(ComponentRole::Base, base);
        components.insert(ComponentRole::Vae, vae);
        let spec = SuiteSpec {
            name: "portrait".to_string(),
            components,
        };

        let cache = ModelCache::new(10 * 1024 * 1024, 86400);
        let outcomes = cache.cache_suite(&spec, false).await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|(_, r)| r.is_ok()));
        assert!(cache.is_cached("sdxl_portrait_base").await);
        assert!(cache.is_cached("sdxl_portrait_vae").await);

        let suites = cache.suites().await;
        assert_eq!(suites.len(), 1);
        assert_eq!(suites[0].name, "portrait");
        assert_eq!(suites[0].components.len(), 2);
    }

    #[tokio::test]
    async fn cache_suite_partial_success_keeps_successful_components() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_fixture(&dir, "base.safetensors", 512).await;
        let missing = dir.path().join("does-not-exist.safetensors");

        let mut components = HashMap::new();
        components.insert(ComponentRole::Base, base);
        components.insert(ComponentRole::Vae, missing);
        let spec = SuiteSpec {
            name: "portrait".to_string(),
            components,
        };

        let cache = ModelCache::new(10 * 1024 * 1024, 86400);
        let outcomes = cache.cache_suite(&spec, false).await;
        assert_eq!(outcomes.len(), 2);
        assert!(cache.is_cached("sdxl_portrait_base").await);
        assert!(!cache.is_cached("sdxl_portrait_vae").await);
        assert!(outcomes
            .iter()
            .any(|(role, r)| *role == ComponentRole::Vae && r.is_err()));
    }

    #[tokio::test]
    async fn cleanup_evicts_only_idle_non_resident_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ModelCache::new(10 * 1024 * 1024, 0);

        let p1 = write_fixture(&dir, "a.safetensors", 100).await;
        cache.cache("a", "A", &p1, false).await.unwrap();
        cache.load_to_gpu("a", "gpu_0").await.unwrap();

        let p2 = write_fixture(&dir, "b.safetensors", 100).await;
        cache.cache("b", "B", &p2, false).await.unwrap();

        let evicted = cache.cleanup().await;
        assert_eq!(evicted, vec!["b".to_string()]);
        assert!(cache.is_cached("a").await);
        assert!(!cache.is_cached("b").await);
    }
}
