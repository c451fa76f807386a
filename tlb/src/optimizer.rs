//! PerformanceOptimizer: optional strategies layered on top of the base
//! TLB/cache — bank partitioning, stride-based prefetch, and an adaptive
//! mode that switches strategy in response to observed collision rate.
//!
//! Grounded on `original_source/AEJ/tlbperformanceoptimizer.h`: the same
//! strategy enum, the same bank counts (1/2/4/8), the same 16-entry stride
//! table with confidence counters (0..=10, promote at 3), and the same
//! adaptive-tick cadence/target.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerStrategy {
    Disabled,
    Banking,
    Prefetch,
    VictimCache,
    AdaptiveReplacement,
    ProcessPartitioning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankCount {
    One = 1,
    Two = 2,
    Four = 4,
    Eight = 8,
}

/// Deterministic splitmix64 hash, mirroring the cache's own partitioning
/// hash so bank assignment is reproducible across runs.
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Which bank `va` belongs to, under `banks`: `hash(va >> log2(page))` mod
/// the bank count, biased so loads prefer even banks and stores prefer odd
/// banks, letting a load and a store in flight at once proceed without
/// serializing on the same bank.
pub fn bank_for(va: u64, page_size: u64, banks: BankCount, is_load: bool) -> u64 {
    let bank_count = banks as u64;
    let vpage = va >> page_size.trailing_zeros();
    let mut bank = splitmix64(vpage) % bank_count;
    if bank_count > 1 && (bank % 2 == 0) != is_load {
        bank = (bank + 1) % bank_count;
    }
    bank
}

const STRIDE_TABLE_SIZE: usize = 16;
const CONFIDENCE_MAX: u8 = 10;
const CONFIDENCE_PROMOTE: u8 = 3;

#[derive(Debug, Clone, Copy)]
struct StrideSlot {
    last_address: u64,
    stride: i64,
    confidence: u8,
}

impl Default for StrideSlot {
    fn default() -> Self {
        Self {
            last_address: 0,
            stride: 0,
            confidence: 0,
        }
    }
}

/// Per-entry prefetch accounting named in the supplemental instrumentation:
/// how many prefetched entries were subsequently used (`hits`) versus
/// evicted unused (`wasted`).
#[derive(Debug, Default)]
pub struct PrefetchStats {
    pub issued: AtomicU64,
    pub hits: AtomicU64,
    pub wasted: AtomicU64,
}

impl PrefetchStats {
    pub fn hit_ratio(&self) -> f64 {
        let issued = self.issued.load(Ordering::Relaxed);
        if issued == 0 {
            return 0.0;
        }
        self.hits.load(Ordering::Relaxed) as f64 / issued as f64
    }
}

struct StrideTable {
    slots: [(u64, StrideSlot); STRIDE_TABLE_SIZE],
    next_victim: usize,
}

impl StrideTable {
    fn new() -> Self {
        Self {
            slots: [(0, StrideSlot::default()); STRIDE_TABLE_SIZE],
            next_victim: 0,
        }
    }

    fn slot_for(&mut self, pc: u64) -> &mut (u64, StrideSlot) {
        if let Some(idx) = self.slots.iter().position(|(k, s)| *k == pc && s.confidence > 0) {
            return &mut self.slots[idx];
        }
        if let Some(idx) = self.slots.iter().position(|(_, s)| s.confidence == 0) {
            self.slots[idx] = (pc, StrideSlot::default());
            return &mut self.slots[idx];
        }
        let idx = self.next_victim;
        self.next_victim = (self.next_victim + 1) % STRIDE_TABLE_SIZE;
        self.slots[idx] = (pc, StrideSlot::default());
        &mut self.slots[idx]
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AdaptiveTuning {
    pub strategy: Option<OptimizerStrategy>,
    pub collision_rate: f64,
}

pub struct PerformanceOptimizer {
    strategy: Mutex<OptimizerStrategy>,
    banks: BankCount,
    stride_table: Mutex<StrideTable>,
    prefetch_stats: PrefetchStats,
    prefetch_depth: u32,
    prefetch_distance: u64,
    last_adaptive_tick: Mutex<Instant>,
    adaptive_tick_interval: Duration,
    collision_reduction_target: f64,
}

impl PerformanceOptimizer {
    pub fn new(strategy: OptimizerStrategy, prefetch_depth: u32, prefetch_distance: u64) -> Self {
        Self {
            strategy: Mutex::new(strategy),
            banks: BankCount::Four,
            stride_table: Mutex::new(StrideTable::new()),
            prefetch_stats: PrefetchStats::default(),
            prefetch_depth,
            prefetch_distance,
            last_adaptive_tick: Mutex::new(Instant::now()),
            adaptive_tick_interval: Duration::from_millis(100),
            collision_reduction_target: 0.5,
        }
    }

    pub fn strategy(&self) -> OptimizerStrategy {
        *self.strategy.lock().unwrap()
    }

    pub fn set_strategy(&self, strategy: OptimizerStrategy) {
        *self.strategy.lock().unwrap() = strategy;
    }

    pub fn bank_for(&self, va: u64, page_size: u64, is_load: bool) -> u64 {
        bank_for(va, page_size, self.banks, is_load)
    }

    /// Observe an access at `pc` touching `address`; once confidence
    /// crosses `CONFIDENCE_PROMOTE`, return the addresses that should be
    /// prefetched (`prefetch_depth` entries spaced by the learned stride).
    pub fn observe_and_prefetch(&self, pc: u64, address: u64) -> Vec<u64> {
        if self.strategy() != OptimizerStrategy::Prefetch {
            return Vec::new();
        }
        let mut table = self.stride_table.lock().unwrap();
        let slot = table.slot_for(pc);
        let observed_stride = address as i64 - slot.1.last_address as i64;
        if slot.1.last_address != 0 && observed_stride == slot.1.stride && observed_stride != 0 {
            slot.1.confidence = (slot.1.confidence + 1).min(CONFIDENCE_MAX);
        } else {
            slot.1.stride = observed_stride;
            slot.1.confidence = 0;
        }
        slot.1.last_address = address;

        if slot.1.confidence < CONFIDENCE_PROMOTE {
            return Vec::new();
        }
        let stride = slot.1.stride;
        let depth = self.prefetch_depth as u64;
        drop(table);

        let mut addrs = Vec::with_capacity(self.prefetch_depth as usize);
        for i in 1..=depth {
            let target = (address as i64 + stride * i as i64).max(0) as u64;
            if target.abs_diff(address) > self.prefetch_distance * depth {
                break;
            }
            addrs.push(target);
        }
        self.prefetch_stats
            .issued
            .fetch_add(addrs.len() as u64, Ordering::Relaxed);
        addrs
    }

    pub fn record_prefetch_hit(&self) {
        self.prefetch_stats.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_prefetch_waste(&self) {
        self.prefetch_stats.wasted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn prefetch_stats(&self) -> &PrefetchStats {
        &self.prefetch_stats
    }

    /// When running `AdaptiveReplacement`, periodically compare the
    /// observed collision rate against the target and recommend a
    /// strategy switch. Returns `None` when the tick interval has not
    /// elapsed.
    pub fn maybe_adapt(&self, collision_rate: f64) -> Option<AdaptiveTuning> {
        if self.strategy() != OptimizerStrategy::AdaptiveReplacement {
            return None;
        }
        let mut last = self.last_adaptive_tick.lock().unwrap();
        if last.elapsed() < self.adaptive_tick_interval {
            return None;
        }
        *last = Instant::now();
        drop(last);

        let recommended = if collision_rate > self.collision_reduction_target {
            Some(OptimizerStrategy::Banking)
        } else {
            None
        };
        Some(AdaptiveTuning {
            strategy: recommended,
            collision_rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bank_for_respects_bank_count() {
        let page_size = 0x2000u64;
        assert_eq!(bank_for(0x1234, page_size, BankCount::One, true), 0);
        assert!(bank_for(0x1234, page_size, BankCount::Four, true) < 4);
    }

    #[test]
    fn bank_for_biases_loads_even_stores_odd() {
        let page_size = 0x2000u64;
        for va in (0..64).map(|i| i * page_size) {
            let load_bank = bank_for(va, page_size, BankCount::Four, true);
            let store_bank = bank_for(va, page_size, BankCount::Four, false);
            assert_eq!(load_bank % 2, 0, "load bank {load_bank} should be even");
            assert_eq!(store_bank % 2, 1, "store bank {store_bank} should be odd");
        }
    }

    #[test]
    fn prefetch_stays_silent_below_confidence_threshold() {
        let opt = PerformanceOptimizer::new(OptimizerStrategy::Prefetch, 2, 4096);
        assert!(opt.observe_and_prefetch(0x400, 0x1000).is_empty());
        assert!(opt.observe_and_prefetch(0x400, 0x1010).is_empty());
    }

    #[test]
    fn prefetch_fires_after_confidence_builds() {
        let opt = PerformanceOptimizer::new(OptimizerStrategy::Prefetch, 2, 4096);
        opt.observe_and_prefetch(0x400, 0x1000);
        opt.observe_and_prefetch(0x400, 0x1010);
        opt.observe_and_prefetch(0x400, 0x1020);
        opt.observe_and_prefetch(0x400, 0x1030);
        let addrs = opt.observe_and_prefetch(0x400, 0x1040);
        assert_eq!(addrs, vec![0x1050, 0x1060]);
    }

    #[test]
    fn disabled_strategy_never_prefetches() {
        let opt = PerformanceOptimizer::new(OptimizerStrategy::Disabled, 2, 4096);
        for i in 0..5 {
            assert!(opt.observe_and_prefetch(0x400, 0x1000 + i * 0x10).is_empty());
        }
    }

    #[test]
    fn adaptive_recommends_banking_on_high_collision_rate() {
        let opt = PerformanceOptimizer::new(OptimizerStrategy::AdaptiveReplacement, 2, 4096);
        let tuning = opt.maybe_adapt(0.9).expect("tick should fire on first call");
        assert_eq!(tuning.strategy, Some(OptimizerStrategy::Banking));
    }
}
