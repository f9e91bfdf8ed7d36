//! Execution manager facade
//!
//! Composes config verification, the concurrency gate, resource limits,
//! stats, the executor and the cluster submitter behind one entry point.

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::core::{ExecutionOutcome, ExecutionRequest, UserStats};
use crate::error::ExecError;
use crate::executor::Executor;
use crate::gate::{Admission, ConcurrencyGate};
use crate::hpc::{ClusterJobSpec, ClusterJobStatus, HpcSubmitter};
use crate::runner::{ProcessRunner, Runner};
use crate::sandbox::ResourceLimitBuilder;
use crate::stats::StatsTracker;
use crate::store::{CounterStore, RedisStore, StatsStore};

pub struct Manager {
    config: Arc<Config>,
    gate: ConcurrencyGate,
    stats: StatsTracker,
    executor: Executor,
    hpc: HpcSubmitter,
}

impl Manager {
    /// Verify the config and build every component over the given stores
    pub async fn new(
        config: Config,
        counters: Arc<dyn CounterStore>,
        stats: Arc<dyn StatsStore>,
    ) -> Result<Self, ExecError> {
        Self::with_runner(config, counters, stats, Arc::new(ProcessRunner::new())).await
    }

    /// Same as `new` with a custom process runner
    pub async fn with_runner(
        config: Config,
        counters: Arc<dyn CounterStore>,
        stats: Arc<dyn StatsStore>,
        runner: Arc<dyn Runner>,
    ) -> Result<Self, ExecError> {
        config.verify().await?;
        let config = Arc::new(config);

        let gate = ConcurrencyGate::new(counters, config.max_concurrent_jobs);
        let stats = StatsTracker::new(stats);
        let limits = ResourceLimitBuilder::new(&config.cgroup_dir, config.limits.clone());
        let executor = Executor::new(
            config.clone(),
            gate.clone(),
            limits,
            stats.clone(),
            runner.clone(),
        );
        let hpc = HpcSubmitter::new(config.clone(), runner);

        info!(
            "Execution manager ready: image={:?} max_concurrent_jobs={} timeout={}s (max {}s)",
            config.image,
            config.max_concurrent_jobs,
            config.default_timeout_secs,
            config.max_timeout_secs
        );

        Ok(Self {
            config,
            gate,
            stats,
            executor,
            hpc,
        })
    }

    /// Build a manager backed by Redis at `config.redis_url`
    pub async fn connect(config: Config) -> Result<Self, ExecError> {
        let store = Arc::new(RedisStore::connect(&config.redis_url).await?);
        Self::new(config, store.clone(), store).await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether a new execution would currently be admitted
    pub async fn can_execute(&self) -> Result<Admission, ExecError> {
        Ok(self.gate.admit().await?)
    }

    /// Run a script in the sandbox and wait for it
    pub async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome, ExecError> {
        self.executor.run(request).await
    }

    /// Stats for a user; store failures yield zeroed stats
    pub async fn get_user_stats(&self, user_id: &str) -> UserStats {
        match self.stats.get(user_id).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!("Failed to read stats for {}: {:#}", user_id, e);
                UserStats::default()
            }
        }
    }

    /// Hand a script off to the batch scheduler
    pub async fn submit_to_cluster(
        &self,
        user_id: &str,
        script_path: &str,
        spec: &ClusterJobSpec,
    ) -> Result<String, ExecError> {
        self.hpc.submit(user_id, script_path, spec).await
    }

    pub async fn get_cluster_job_status(&self, job_id: &str) -> Result<ClusterJobStatus, ExecError> {
        self.hpc.status(job_id).await
    }
}
