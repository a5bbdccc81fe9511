//! Performance optimizer - adaptive sizing, batching, caching and memory checks
//!
//! The optimizer wraps the coordinator without changing its contract: it
//! implements [`StageExecutor`] the same way, so `run_plan` can drive
//! either one.

use crate::core::{
    config::OptimizerConfig, ExecutionStatus, ExecutorError, OrchestratorError, RunFailure, Step,
    SyncPolicy, WorkspaceContext,
};
use crate::execution::{
    coordinator::{ParallelExecutionCoordinator, StageExecutor, StageResult, StepOutcome},
    executor::{ExecutorRegistry, StepExecutor, StepResult},
    planner::{ExecutionPlan, Stage},
    tracker::RunTracker,
};
use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const MIN_WORKERS: usize = 2;
const MAX_WORKERS: usize = 20;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Worker count for a plan: `clamp(2, 20, min(2 x cpus, max group + 2, parallel steps))`
pub fn optimal_workers(logical_cpus: usize, max_group_size: usize, total_parallel_steps: usize) -> usize {
    let candidate = (2 * logical_cpus)
        .min(max_group_size + 2)
        .min(total_parallel_steps);
    candidate.clamp(MIN_WORKERS, MAX_WORKERS)
}

/// Cache key: SHA-256 over id, name, type and canonical parameters
pub fn cache_key(step: &Step) -> String {
    // Parameters are a BTreeMap and nested objects serialize sorted, so the JSON is canonical
    let params = serde_json::to_string(&step.parameters).unwrap_or_default();
    let mut hasher = Sha256::new();
    for part in [&step.id, &step.name, &step.step_type, &params] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

struct CacheEntry {
    result: StepResult,
    stored_at: Instant,
    seq: u64,
}

/// Bounded cache of successful step results
pub struct ResultCache {
    capacity: usize,
    entries: Mutex<HashMap<String, CacheEntry>>,
    seq: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<StepResult> {
        let found = lock(&self.entries).get(key).map(|e| e.result.clone());
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Store a result; failures are never cached
    pub fn insert(&self, key: String, result: StepResult) {
        if !result.success {
            return;
        }
        let mut entries = lock(&self.entries);
        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            Self::evict_oldest(&mut entries, 1);
        }
        entries.insert(
            key,
            CacheEntry {
                result,
                stored_at: Instant::now(),
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
            },
        );
    }

    /// Drop the older half of the entries
    pub fn evict_half(&self) -> usize {
        let mut entries = lock(&self.entries);
        let count = entries.len().div_ceil(2);
        Self::evict_oldest(&mut entries, count);
        count
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    fn evict_oldest(entries: &mut HashMap<String, CacheEntry>, count: usize) {
        let mut by_age: Vec<(Instant, u64, String)> = entries
            .iter()
            .map(|(k, e)| (e.stored_at, e.seq, k.clone()))
            .collect();
        by_age.sort();
        for (_, _, key) in by_age.into_iter().take(count) {
            entries.remove(&key);
        }
    }
}

/// Last observed duration per step id
#[derive(Default)]
pub struct DurationHistory {
    durations: Mutex<HashMap<String, Duration>>,
}

impl DurationHistory {
    pub fn record(&self, step_id: &str, elapsed: Duration) {
        lock(&self.durations).insert(step_id.to_string(), elapsed);
    }

    pub fn get(&self, step_id: &str) -> Option<Duration> {
        lock(&self.durations).get(step_id).copied()
    }

    pub fn len(&self) -> usize {
        lock(&self.durations).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget half of the recorded steps
    pub fn evict_half(&self) {
        let mut durations = lock(&self.durations);
        let mut keys: Vec<String> = durations.keys().cloned().collect();
        keys.sort();
        let count = keys.len().div_ceil(2);
        for key in keys.into_iter().take(count) {
            durations.remove(&key);
        }
    }
}

/// Source of the process's resident memory
pub trait MemoryProbe: Send + Sync {
    /// Resident bytes, or `None` when unknown on this platform
    fn resident_bytes(&self) -> Option<u64>;
}

/// Reads `VmRSS` from `/proc/self/status`, which is in kB whatever the page size
pub struct ProcMemoryProbe;

/// Resident bytes from the text of a `/proc/<pid>/status` file
pub fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let mut fields = line["VmRSS:".len()..].split_whitespace();
    let value: u64 = fields.next()?.parse().ok()?;
    match fields.next() {
        Some("kB") | None => Some(value.saturating_mul(1024)),
        Some(_) => None,
    }
}

impl MemoryProbe for ProcMemoryProbe {
    fn resident_bytes(&self) -> Option<u64> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        parse_vm_rss(&status)
    }
}

/// Executor decorator adding result caching and duration tracking
pub struct CachingExecutor {
    inner: Arc<dyn StepExecutor>,
    cache: Option<Arc<ResultCache>>,
    history: Arc<DurationHistory>,
}

impl CachingExecutor {
    pub fn new(
        inner: Arc<dyn StepExecutor>,
        cache: Option<Arc<ResultCache>>,
        history: Arc<DurationHistory>,
    ) -> Self {
        Self {
            inner,
            cache,
            history,
        }
    }
}

#[async_trait]
impl StepExecutor for CachingExecutor {
    async fn execute(
        &self,
        step: &Step,
        context: &WorkspaceContext,
    ) -> Result<StepResult, ExecutorError> {
        let key = self.cache.as_ref().map(|_| cache_key(step));
        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            if let Some(hit) = cache.get(key) {
                debug!("Cache hit for step {}", step.id);
                return Ok(hit);
            }
        }

        let started = Instant::now();
        let result = self.inner.execute(step, context).await?;
        self.history.record(&step.id, started.elapsed());

        if let (Some(cache), Some(key)) = (&self.cache, key) {
            cache.insert(key, result.clone());
        }
        Ok(result)
    }

    fn render_script(&self, step: &Step) -> Result<String, ExecutorError> {
        self.inner.render_script(step)
    }
}

/// Counters reported at the end of an optimized run
///
/// `workers` belongs to a single run; the other counters accumulate across
/// every run sharing the optimizer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OptimizerStats {
    pub workers: usize,
    pub batches_run: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cleanups: u64,
}

/// Shared optimizer state; one instance serves every run of an engine
pub struct PerformanceOptimizer {
    config: OptimizerConfig,
    cache: Arc<ResultCache>,
    history: Arc<DurationHistory>,
    probe: Arc<dyn MemoryProbe>,
    logical_cpus: usize,
    stats: Mutex<OptimizerStats>,
}

impl PerformanceOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self::with_probe(config, Arc::new(ProcMemoryProbe))
    }

    pub fn with_probe(config: OptimizerConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            cache: Arc::new(ResultCache::new(config.cache_capacity)),
            history: Arc::new(DurationHistory::default()),
            probe,
            logical_cpus: num_cpus::get(),
            stats: Mutex::new(OptimizerStats::default()),
            config,
        }
    }

    /// Override the detected CPU count
    pub fn with_cpus(mut self, logical_cpus: usize) -> Self {
        self.logical_cpus = logical_cpus.max(1);
        self
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn history(&self) -> &DurationHistory {
        &self.history
    }

    /// Shared counters; `workers` is left at zero, see [`OptimizedRun::stats`]
    pub fn stats(&self) -> OptimizerStats {
        let mut stats = lock(&self.stats).clone();
        stats.cache_hits = self.cache.hits();
        stats.cache_misses = self.cache.misses();
        stats
    }

    pub fn workers_for(&self, plan: &ExecutionPlan) -> usize {
        optimal_workers(self.logical_cpus, plan.max_group_size(), plan.parallel_step_count())
    }

    /// Estimated runtime used for shortest-job-first ordering
    pub fn estimate(&self, step: &Step) -> Duration {
        let base = self
            .history
            .get(&step.id)
            .or_else(|| step.estimated_duration_secs.map(Duration::from_secs))
            .unwrap_or_else(|| Duration::from_secs(self.config.default_estimate_secs));
        let weight = self.config.dependency_weight_secs * step.depends_on.len() as u64;
        base + Duration::from_secs(weight)
    }

    /// Members sorted by ascending estimate; equal estimates keep stage order
    pub fn shortest_first(&self, steps: &[Step]) -> Vec<Step> {
        let mut ordered = steps.to_vec();
        ordered.sort_by_key(|s| self.estimate(s));
        ordered
    }

    /// Stage executor for one run of `plan`
    pub fn prepare(&self, plan: &ExecutionPlan, registry: &ExecutorRegistry) -> OptimizedRun<'_> {
        let workers = self.workers_for(plan);

        let cache = self.config.cache_enabled.then(|| self.cache.clone());
        let history = self.history.clone();
        let registry = registry.wrapped(|inner| {
            Arc::new(CachingExecutor::new(inner, cache.clone(), history.clone())) as Arc<dyn StepExecutor>
        });

        info!("Optimizer sized worker pool to {} for {} stage(s)", workers, plan.total_stages);
        OptimizedRun {
            optimizer: self,
            coordinator: ParallelExecutionCoordinator::with_workers(registry, workers),
        }
    }

    /// Run a cleanup pass when resident memory exceeds the threshold
    pub fn check_memory(&self) -> bool {
        let Some(resident) = self.probe.resident_bytes() else {
            return false;
        };
        let threshold = self.config.memory_threshold_mb.saturating_mul(1024 * 1024);
        if resident <= threshold {
            return false;
        }

        let evicted = self.cache.evict_half();
        self.history.evict_half();
        lock(&self.stats).cleanups += 1;
        warn!(
            "Resident memory {} MiB over {} MiB threshold; evicted {} cached results",
            resident / (1024 * 1024),
            self.config.memory_threshold_mb,
            evicted
        );
        true
    }

}

/// Coordinator wrapped with the optimizer's batching and ordering
pub struct OptimizedRun<'a> {
    optimizer: &'a PerformanceOptimizer,
    coordinator: ParallelExecutionCoordinator,
}

impl OptimizedRun<'_> {
    pub fn workers(&self) -> usize {
        self.coordinator.workers()
    }

    /// Shared counters plus this run's worker count
    pub fn stats(&self) -> OptimizerStats {
        OptimizerStats {
            workers: self.workers(),
            ..self.optimizer.stats()
        }
    }

    pub fn log_stats(&self) {
        let stats = self.stats();
        info!(
            "Optimizer: {} workers, {} batches, cache {} hits / {} misses, {} cleanups",
            stats.workers, stats.batches_run, stats.cache_hits, stats.cache_misses, stats.cleanups
        );
    }

    async fn cancel_all(
        &self,
        steps: &[Step],
        stage: &Stage,
        tracker: &RunTracker,
        reason: &str,
        result: &mut StageResult,
    ) {
        for step in steps {
            tracker.step_cancelled(step, Some(stage.index), reason).await;
            result.outcomes.push(StepOutcome {
                step_id: step.id.clone(),
                status: ExecutionStatus::Cancelled,
                output: String::new(),
                error: Some(reason.to_string()),
                delta: Default::default(),
                tolerated: false,
            });
        }
    }
}

#[async_trait]
impl<'a> StageExecutor for OptimizedRun<'a> {
    async fn execute_stage(
        &self,
        stage: &Stage,
        context: &WorkspaceContext,
        tracker: &RunTracker,
    ) -> StageResult {
        if !stage.is_parallel() {
            let result = self.coordinator.execute_stage(stage, context, tracker).await;
            self.optimizer.check_memory();
            return result;
        }

        let policy = stage.policy();
        let deadline = stage
            .timeout_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs));
        let ordered = self.optimizer.shortest_first(&stage.steps);
        let batch_size = self.optimizer.config.batch_size.max(1);
        let batches: Vec<&[Step]> = ordered.chunks(batch_size).collect();
        if batches.len() > 1 {
            debug!("Splitting {} into {} batches of {}", stage.label(), batches.len(), batch_size);
        }

        let mut result = StageResult::empty(stage.index);
        for (position, batch) in batches.iter().enumerate() {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                result.timed_out = true;
            }
            if result.timed_out {
                let error = OrchestratorError::Timeout {
                    scope: stage.label(),
                    seconds: stage.timeout_secs.unwrap_or_default(),
                };
                if result.failure.is_none() {
                    result.failure = Some(RunFailure {
                        stage_index: Some(stage.index),
                        step_id: None,
                        error: error.to_string(),
                    });
                }
                let rest: Vec<Step> = batches[position..].iter().flat_map(|b| b.iter().cloned()).collect();
                self.cancel_all(&rest, stage, tracker, &format!("cancelled: {}", error), &mut result)
                    .await;
                break;
            }

            let sub_stage = stage.with_steps(batch.to_vec());
            let sub_result = self
                .coordinator
                .execute_until(&sub_stage, context, tracker, deadline)
                .await;
            lock(&self.optimizer.stats).batches_run += 1;
            result.absorb(sub_result);
            self.optimizer.check_memory();

            let rest: Vec<Step> = batches[position + 1..].iter().flat_map(|b| b.iter().cloned()).collect();
            if rest.is_empty() {
                break;
            }
            let stop_reason = match (policy, &result.satisfied_by, &result.failure) {
                (SyncPolicy::WaitAny, Some(winner), _) => Some(format!(
                    "cancelled: step '{}' satisfied wait_any in {}",
                    winner,
                    stage.label()
                )),
                (SyncPolicy::FailFast, _, Some(failure)) => Some(format!(
                    "cancelled: step '{}' failed in fail_fast {}",
                    failure.step_id.as_deref().unwrap_or("?"),
                    stage.label()
                )),
                _ => None,
            };
            if let Some(reason) = stop_reason {
                self.cancel_all(&rest, stage, tracker, &reason, &mut result).await;
                break;
            }
        }

        let position: HashMap<&str, usize> = stage
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();
        result
            .outcomes
            .sort_by_key(|o| position.get(o.step_id.as_str()).copied().unwrap_or(usize::MAX));
        result.settle(policy);
        result
    }
}
