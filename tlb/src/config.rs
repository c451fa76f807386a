//! Runtime configuration for the translation subsystem.
//!
//! One field per option enumerated in the external-interfaces contract, with
//! defaults matching it exactly. Embedders construct a `Config`, tweak the
//! fields they care about, and pass it to `TlbCacheIntegrator::new`.

use crate::optimizer::OptimizerStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub tlb_capacity: usize,
    pub tlb_max_cpus: u32,

    pub cache_initial_sets: u64,
    pub cache_initial_ways: u64,
    pub cache_max_sets: u64,
    pub cache_max_ways: u64,
    pub cache_page_size: u64,
    pub cache_auto_tune_interval: u64,

    pub coordinator_max_depth: usize,
    pub coordinator_stall_queue: usize,
    pub coordinator_max_replays: u32,
    pub coordinator_stall_timeout_ms: u64,

    pub errors_burst_threshold: u32,
    pub errors_burst_window_ms: u64,
    pub errors_history_size: usize,
    pub errors_fault_rate_threshold: f64,
    pub errors_monitoring_interval_ms: u64,

    pub optimizer_strategy: OptimizerStrategy,
    pub optimizer_prefetch_depth: u32,
    pub optimizer_prefetch_distance: u64,

    pub walker_page_granularity_default: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tlb_capacity: 64,
            tlb_max_cpus: 64,

            cache_initial_sets: 64,
            cache_initial_ways: 4,
            cache_max_sets: 1024,
            cache_max_ways: 16,
            cache_page_size: 8 * 1024,
            cache_auto_tune_interval: 10_000,

            coordinator_max_depth: 8,
            coordinator_stall_queue: 16,
            coordinator_max_replays: 3,
            coordinator_stall_timeout_ms: 1_000,

            errors_burst_threshold: 10,
            errors_burst_window_ms: 1_000,
            errors_history_size: 256,
            errors_fault_rate_threshold: 0.1,
            errors_monitoring_interval_ms: 5_000,

            optimizer_strategy: OptimizerStrategy::Disabled,
            optimizer_prefetch_depth: 2,
            optimizer_prefetch_distance: 128,

            walker_page_granularity_default: 8 * 1024,
        }
    }
}

impl Config {
    /// Override TLB sizing. Chainable with the other `with_*` setters so
    /// callers can start from [`Config::default`] and adjust only what they
    /// need, rather than repeating every field.
    pub fn with_tlb(mut self, capacity: usize, max_cpus: u32) -> Self {
        self.tlb_capacity = capacity;
        self.tlb_max_cpus = max_cpus;
        self
    }

    pub fn with_cache_geometry(
        mut self,
        initial_sets: u64,
        initial_ways: u64,
        max_sets: u64,
        max_ways: u64,
    ) -> Self {
        self.cache_initial_sets = initial_sets;
        self.cache_initial_ways = initial_ways;
        self.cache_max_sets = max_sets;
        self.cache_max_ways = max_ways;
        self
    }

    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.cache_page_size = page_size;
        self.walker_page_granularity_default = page_size;
        self
    }

    pub fn with_coordinator_limits(
        mut self,
        max_depth: usize,
        stall_queue: usize,
        max_replays: u32,
        stall_timeout_ms: u64,
    ) -> Self {
        self.coordinator_max_depth = max_depth;
        self.coordinator_stall_queue = stall_queue;
        self.coordinator_max_replays = max_replays;
        self.coordinator_stall_timeout_ms = stall_timeout_ms;
        self
    }

    pub fn with_error_thresholds(
        mut self,
        burst_threshold: u32,
        burst_window_ms: u64,
        fault_rate_threshold: f64,
    ) -> Self {
        self.errors_burst_threshold = burst_threshold;
        self.errors_burst_window_ms = burst_window_ms;
        self.errors_fault_rate_threshold = fault_rate_threshold;
        self
    }

    pub fn with_optimizer_strategy(mut self, strategy: OptimizerStrategy) -> Self {
        self.optimizer_strategy = strategy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_setters_override_only_named_fields() {
        let cfg = Config::default()
            .with_tlb(32, 8)
            .with_page_size(4 * 1024)
            .with_optimizer_strategy(OptimizerStrategy::Banking);
        assert_eq!(cfg.tlb_capacity, 32);
        assert_eq!(cfg.tlb_max_cpus, 8);
        assert_eq!(cfg.cache_page_size, 4 * 1024);
        assert_eq!(cfg.walker_page_granularity_default, 4 * 1024);
        assert_eq!(cfg.optimizer_strategy, OptimizerStrategy::Banking);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.coordinator_max_depth, 8);
        assert_eq!(cfg.errors_burst_threshold, 10);
    }

    #[test]
    fn defaults_match_external_interface_contract() {
        let cfg = Config::default();
        assert_eq!(cfg.tlb_capacity, 64);
        assert_eq!(cfg.tlb_max_cpus, 64);
        assert_eq!(cfg.cache_auto_tune_interval, 10_000);
        assert_eq!(cfg.coordinator_max_depth, 8);
        assert_eq!(cfg.coordinator_stall_queue, 16);
        assert_eq!(cfg.coordinator_max_replays, 3);
        assert_eq!(cfg.coordinator_stall_timeout_ms, 1_000);
        assert_eq!(cfg.errors_burst_threshold, 10);
        assert_eq!(cfg.errors_burst_window_ms, 1_000);
        assert_eq!(cfg.errors_history_size, 256);
        assert_eq!(cfg.optimizer_prefetch_depth, 2);
        assert_eq!(cfg.optimizer_prefetch_distance, 128);
        assert_eq!(cfg.walker_page_granularity_default, 8 * 1024);
    }
}
