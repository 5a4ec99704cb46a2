//! Tier number → back-end, queue and configuration

use crate::backend::{BackendError, CompilerBackend};
use crate::config::TierConfig;
use crate::method::Tier;
use crate::queue::CompileQueue;
use once_cell::sync::OnceCell;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Everything the broker keeps per enabled tier
pub(crate) struct TierRuntime {
    pub(crate) config: TierConfig,
    pub(crate) queue: CompileQueue,
    pub(crate) backend: Arc<dyn CompilerBackend>,
    /// Outcome of the one-time back-end initialization
    pub(crate) init: OnceCell<Result<(), BackendError>>,
}

impl TierRuntime {
    pub(crate) fn new(config: TierConfig, queue: CompileQueue, backend: Arc<dyn CompilerBackend>) -> Self {
        TierRuntime {
            config,
            queue,
            backend,
            init: OnceCell::new(),
        }
    }

    pub(crate) fn level(&self) -> Tier {
        self.config.level
    }

    /// Whether the back-end finished initializing successfully
    pub(crate) fn is_backend_ready(&self) -> bool {
        matches!(self.init.get(), Some(Ok(())))
    }

    /// The back-end initialization error, if it failed
    pub(crate) fn init_failure(&self) -> Option<&BackendError> {
        self.init.get().and_then(|r| r.as_ref().err())
    }
}

/// Enabled tiers, looked up by tier number
#[derive(Default)]
pub(crate) struct CompilerRegistry {
    tiers: FxHashMap<Tier, Arc<TierRuntime>>,
    order: Vec<Tier>,
}

impl CompilerRegistry {
    pub(crate) fn insert(&mut self, runtime: TierRuntime) {
        let level = runtime.level();
        if self.tiers.insert(level, Arc::new(runtime)).is_none() {
            self.order.push(level);
            self.order.sort_unstable();
        }
    }

    pub(crate) fn get(&self, tier: Tier) -> Option<&Arc<TierRuntime>> {
        self.tiers.get(&tier)
    }

    /// Tiers in ascending order
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<TierRuntime>> + '_ {
        self.order.iter().filter_map(|t| self.tiers.get(t))
    }

    pub(crate) fn levels(&self) -> Vec<Tier> {
        self.order.clone()
    }
}
