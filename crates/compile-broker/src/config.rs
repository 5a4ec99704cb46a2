//! Broker configuration (broker.toml)
//!
//! Per-tier worker limits and budgets plus broker-wide switches. Everything
//! has a default so a config file only needs to name what it changes.

use crate::backend::CompilerKind;
use crate::code_cache::CodeBlobKind;
use crate::method::{Tier, TIER_LIMIT};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

const M: u64 = 1024 * 1024;
const K: u64 = 1024;

/// Errors that can occur while loading a configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Validation error
    #[error("Invalid config: {0}")]
    ValidationError(String),
}

/// Debug window of compile IDs that may actually compile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileIdRange {
    /// First ID allowed to compile
    pub start: u32,
    /// First ID past the window
    pub stop: u32,
}

impl CompileIdRange {
    /// Whether `id` falls inside the window
    pub fn contains(&self, id: u32) -> bool {
        self.start <= id && id < self.stop
    }
}

/// Configuration for one compilation tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    /// Tier number requests refer to
    pub level: Tier,
    /// Which kind of back-end serves this tier
    pub compiler: CompilerKind,
    /// Whether requests for this tier are accepted
    pub enabled: bool,
    /// Maximum worker threads (the fixed count when the pool is static)
    pub max_workers: usize,
    /// Workers that are never retired
    pub min_workers: usize,
    /// Queue depth each worker is expected to absorb
    pub tasks_per_thread: usize,
    /// Free memory each additional worker needs
    pub per_worker_memory_budget: u64,
    /// Code cache headroom each additional worker needs
    pub per_worker_code_budget: u64,
    /// Idle time before a worker may retire
    pub retire_idle_ms: u64,
    /// Code cache segment this tier installs into
    pub blob_kind: CodeBlobKind,
    /// Initial capacity of each worker's buffer arena
    pub buffer_size: usize,
}

impl TierConfig {
    /// Cheap profiling tier
    pub fn c1(level: Tier) -> Self {
        let (c1_count, _) = default_compiler_counts(num_cpus::get());
        TierConfig {
            level,
            compiler: CompilerKind::C1,
            enabled: true,
            max_workers: c1_count,
            min_workers: 1,
            tasks_per_thread: 4,
            per_worker_memory_budget: 100 * M,
            per_worker_code_budget: 128 * K,
            retire_idle_ms: 500,
            blob_kind: CodeBlobKind::Profiled,
            buffer_size: 64 * 1024,
        }
    }

    /// Expensive optimizing tier
    pub fn c2(level: Tier) -> Self {
        let (_, c2_count) = default_compiler_counts(num_cpus::get());
        TierConfig {
            level,
            compiler: CompilerKind::C2,
            enabled: true,
            max_workers: c2_count,
            min_workers: 1,
            tasks_per_thread: 2,
            per_worker_memory_budget: 200 * M,
            per_worker_code_budget: 128 * K,
            retire_idle_ms: 100,
            blob_kind: CodeBlobKind::NonProfiled,
            buffer_size: 0,
        }
    }

    /// External compiler tier (optimizing, progress-polled by blocking requesters)
    pub fn external(level: Tier) -> Self {
        TierConfig {
            compiler: CompilerKind::External,
            ..TierConfig::c2(level)
        }
    }

    /// Set the maximum worker count
    pub fn with_workers(mut self, count: usize) -> Self {
        self.max_workers = count.max(1);
        self.min_workers = self.min_workers.min(self.max_workers).max(1);
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: String| Err(ConfigError::ValidationError(format!("tier {}: {}", self.level, msg)));
        if self.level >= TIER_LIMIT {
            return fail(format!("level must be below {}", TIER_LIMIT));
        }
        if self.min_workers == 0 {
            return fail("min_workers must be at least 1".to_string());
        }
        if self.min_workers > self.max_workers {
            return fail(format!(
                "min_workers ({}) exceeds max_workers ({})",
                self.min_workers, self.max_workers
            ));
        }
        if self.tasks_per_thread == 0 {
            return fail("tasks_per_thread must be non-zero".to_string());
        }
        if self.per_worker_memory_budget == 0 || self.per_worker_code_budget == 0 {
            return fail("per-worker budgets must be non-zero".to_string());
        }
        Ok(())
    }
}

impl Default for TierConfig {
    fn default() -> Self {
        TierConfig::c1(1)
    }
}

/// Broker-wide configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Grow and shrink worker pools at runtime
    pub dynamic_pool_enabled: bool,
    /// Allow idle workers to retire (dynamic pool only)
    pub reduce_workers_on_idle: bool,
    /// Requests are non-blocking unless a directive says otherwise
    pub background_compilation_default: bool,
    /// Whether the broker starts out accepting new jobs
    pub accept_new_jobs_default: bool,
    /// Length of one progress-poll slice for the external tier
    pub external_tier_progress_slice_ms: u64,
    /// Consecutive no-progress slices before a blocking requester gives up
    pub external_tier_progress_slices_max: u32,
    /// Bounded wait of an idle worker on an empty queue
    pub queue_wait_timeout_ms: u64,
    /// Stop (rather than disable) compilation when the code cache fills up
    pub code_cache_eviction: bool,
    /// Free bytes a tier's segment needs before a stopped broker restarts
    pub code_cache_restart_headroom: usize,
    /// Maximum live compile tasks
    pub max_live_tasks: usize,
    /// Log every compile into the per-thread log
    pub log_compilation: bool,
    /// Entries kept in each per-thread compile log
    pub thread_log_capacity: usize,
    /// Attach training records to tasks at enqueue
    pub record_training_data: bool,
    /// Debug window of compile IDs allowed to compile
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_id_range: Option<CompileIdRange>,
    /// Configured tiers
    pub tiers: Vec<TierConfig>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            dynamic_pool_enabled: true,
            reduce_workers_on_idle: true,
            background_compilation_default: true,
            accept_new_jobs_default: true,
            external_tier_progress_slice_ms: 1000,
            external_tier_progress_slices_max: 10,
            queue_wait_timeout_ms: 5000,
            code_cache_eviction: true,
            code_cache_restart_headroom: 256 * 1024,
            max_live_tasks: 10_000,
            log_compilation: false,
            thread_log_capacity: 64,
            record_training_data: false,
            compile_id_range: None,
            tiers: vec![TierConfig::c1(1), TierConfig::c2(4)],
        }
    }
}

impl BrokerConfig {
    /// Config with a single tier and a static pool
    pub fn single_tier(tier: TierConfig) -> Self {
        BrokerConfig {
            tiers: vec![tier],
            dynamic_pool_enabled: false,
            ..BrokerConfig::default()
        }
    }

    /// Parse from TOML text and validate
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BrokerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tiers.is_empty() {
            return Err(ConfigError::ValidationError("at least one tier is required".to_string()));
        }
        for (i, tier) in self.tiers.iter().enumerate() {
            tier.validate()?;
            if self.tiers[..i].iter().any(|t| t.level == tier.level) {
                return Err(ConfigError::ValidationError(format!(
                    "tier {} is configured twice",
                    tier.level
                )));
            }
        }
        if let Some(range) = self.compile_id_range {
            if range.start >= range.stop {
                return Err(ConfigError::ValidationError(format!(
                    "empty compile_id_range {}..{}",
                    range.start, range.stop
                )));
            }
        }
        if self.max_live_tasks == 0 {
            return Err(ConfigError::ValidationError("max_live_tasks must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Config for `level`, if configured
    pub fn tier(&self, level: Tier) -> Option<&TierConfig> {
        self.tiers.iter().find(|t| t.level == level)
    }
}

/// Default (cheap, expensive) worker counts for `cpus` processors.
///
/// Scales with log2(n) * log2(log2(n)); one third goes to the cheap tier.
pub fn default_compiler_counts(cpus: usize) -> (usize, usize) {
    let n = cpus.max(1) as f64;
    let log_cpu = n.log2().max(1.0);
    let loglog_cpu = log_cpu.log2().max(1.0);
    let count = ((log_cpu * loglog_cpu * 3.0 / 2.0) as usize).max(2);
    let c1 = (count / 3).max(1);
    let c2 = (count - c1).max(1);
    (c1, c2)
}
