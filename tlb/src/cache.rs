//! TranslationCache: the process-wide, set-associative secondary cache of
//! recent translations.
//!
//! Grounded on `original_source/AEJ/AlphaTranslationCache.cpp`: power-of-two
//! set/way geometry asserted at construction, an auto-tune pass gated by a
//! throttle counter, LRU counters per (set, way), and a partitioned mode
//! that is enabled/disabled wholesale rather than incrementally. Concurrency
//! follows the teacher's single-logical-lock convention
//! (`lib/src/spinlock.rs`'s `IrqRwLock`), expressed here with
//! `std::sync::RwLock` since there is no interrupt context to disable.

use crate::entry::TlbEntry;
use crate::observer::{Event, Observer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// One action `auto_tune` can take, reported via `Event::AutoTune`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoTuneAction {
    None,
    ExpandSets,
    ExpandWays,
    ReduceWays,
    EnablePartitioning { partitions: u64 },
    DisablePartitioning,
}

const PARTITION_CHOICES: [u64; 3] = [4, 8, 16];

struct Geometry {
    sets: Vec<Vec<TlbEntry>>,
    lru: Vec<Vec<u64>>,
    active_sets: u64,
    active_ways: u64,
    partitions: u64,
    sequence: u64,
}

impl Geometry {
    fn new(sets: u64, ways: u64) -> Self {
        Self {
            sets: vec![vec![TlbEntry::invalid(); ways as usize]; sets as usize],
            lru: vec![vec![0u64; ways as usize]; sets as usize],
            active_sets: sets,
            active_ways: ways,
            partitions: 1,
            sequence: 0,
        }
    }

    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn all_valid_entries(&self) -> Vec<TlbEntry> {
        self.sets
            .iter()
            .flatten()
            .filter(|e| e.valid)
            .copied()
            .collect()
    }

    fn raw_set_index(&self, va: u64, page_size: u64) -> u64 {
        (va >> page_size.trailing_zeros()) & (self.active_sets - 1)
    }

    /// Deterministic splitmix64 hash, per the design note that the
    /// partitioning hash function must be explicit (not the host's
    /// unspecified thread-id hash) so tests are reproducible.
    fn splitmix64(mut x: u64) -> u64 {
        x = x.wrapping_add(0x9E3779B97F4A7C15);
        let mut z = x;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        z ^ (z >> 31)
    }

    fn set_index(&self, va: u64, page_size: u64, thread_id: u64) -> u64 {
        if self.partitions <= 1 {
            return self.raw_set_index(va, page_size);
        }
        let partition = Self::splitmix64(thread_id) % self.partitions;
        let sets_per_partition = self.active_sets / self.partitions;
        let local = (va >> page_size.trailing_zeros()) % sets_per_partition.max(1);
        partition * sets_per_partition + local
    }

    fn find_way(&self, set: u64, va_page: u64, asn: u32, kernel: bool, instruction: bool) -> Option<usize> {
        self.sets[set as usize]
            .iter()
            .position(|e| e.valid && e.matches(va_page, asn, instruction) && e.kernel_only == kernel)
    }

    /// Insert or overwrite an entry in `set`, preferring an invalid way,
    /// otherwise evicting the lowest-LRU way. Returns true if a valid entry
    /// was evicted.
    fn insert_into_set(&mut self, set: u64, entry: TlbEntry) -> bool {
        let seq = self.next_sequence();
        let set_idx = set as usize;
        let invalid_way = self.sets[set_idx].iter().position(|e| !e.valid);
        let (way, evicted) = match invalid_way {
            Some(w) => (w, false),
            None => {
                let w = (0..self.sets[set_idx].len())
                    .min_by_key(|&w| self.lru[set_idx][w])
                    .expect("ways is never zero");
                (w, true)
            }
        };
        self.sets[set_idx][way] = entry;
        self.lru[set_idx][way] = seq;
        evicted
    }
}

/// Running statistics consulted by `auto_tune`; reset at the start of each
/// tuning interval.
struct TuningWindow {
    lookups: AtomicU64,
    hits: AtomicU64,
    contention: AtomicU64,
}

impl TuningWindow {
    fn new() -> Self {
        Self {
            lookups: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            contention: AtomicU64::new(0),
        }
    }

    fn reset(&self) {
        self.lookups.store(0, Ordering::Relaxed);
        self.hits.store(0, Ordering::Relaxed);
        self.contention.store(0, Ordering::Relaxed);
    }

    fn hit_rate(&self) -> f64 {
        let lookups = self.lookups.load(Ordering::Relaxed) as f64;
        if lookups == 0.0 {
            return 1.0;
        }
        self.hits.load(Ordering::Relaxed) as f64 / lookups
    }
}

pub struct TranslationCache {
    geometry: RwLock<Geometry>,
    window: TuningWindow,
    op_counter: AtomicU64,
    evictions: AtomicU64,
    page_size: u64,
    max_sets: u64,
    max_ways: u64,
    auto_tune_interval: u64,
    observer: Option<Arc<dyn Observer>>,
}

impl TranslationCache {
    pub fn new(
        initial_sets: u64,
        initial_ways: u64,
        max_sets: u64,
        max_ways: u64,
        page_size: u64,
        auto_tune_interval: u64,
    ) -> Self {
        assert!(initial_sets.is_power_of_two(), "sets must be power of 2");
        assert!(page_size.is_power_of_two(), "page size must be power of 2");
        Self {
            geometry: RwLock::new(Geometry::new(initial_sets, initial_ways)),
            window: TuningWindow::new(),
            op_counter: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            page_size,
            max_sets,
            max_ways,
            auto_tune_interval,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    fn notify(&self, event: Event) {
        if let Some(observer) = &self.observer {
            observer.notify(event);
        }
    }

    fn page_of(&self, va: u64) -> u64 {
        va & !(self.page_size - 1)
    }

    /// Lock-free-feeling fast path: a shared read guard over the whole
    /// geometry. LRU bookkeeping on a hit is skipped in partitioned mode
    /// (only non-partitioned lookups update it), matching the geometry's
    /// own note on partitioned writes.
    ///
    /// Returns the whole matching entry, not just its physical address, so
    /// callers that rehydrate a `PerCpuTlb` from a cache hit carry forward
    /// the entry's real protection/privilege/instruction-kind bits instead
    /// of re-granting unconditional access.
    pub fn lookup(&self, va: u64, asn: u32, kernel: bool, instruction: bool, thread_id: u64) -> Option<TlbEntry> {
        self.window.lookups.fetch_add(1, Ordering::Relaxed);
        let page = self.page_of(va);

        let hit = {
            let geometry = match self.geometry.try_read() {
                Ok(g) => g,
                Err(_) => {
                    self.window.contention.fetch_add(1, Ordering::Relaxed);
                    self.geometry.read().unwrap()
                }
            };
            let set = geometry.set_index(va, self.page_size, thread_id);
            geometry
                .find_way(set, page, asn, kernel, instruction)
                .map(|way| (set, geometry.sets[set as usize][way]))
        };

        let Some((set, entry)) = hit else {
            self.maybe_auto_tune();
            return None;
        };

        self.window.hits.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut geometry) = self.geometry.try_write() {
            if geometry.partitions == 1 {
                if let Some(way) = geometry.find_way(set, page, asn, kernel, instruction) {
                    let seq = geometry.next_sequence();
                    geometry.lru[set as usize][way] = seq;
                }
            }
        }
        self.maybe_auto_tune();
        Some(entry)
    }

    pub fn insert(
        &self,
        entry: TlbEntry,
        thread_id: u64,
    ) {
        let mut geometry = self.geometry.write().unwrap();
        let set = geometry.set_index(entry.virtual_page, self.page_size, thread_id);
        let evicted = geometry.insert_into_set(set, entry);
        drop(geometry);
        if evicted {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        self.maybe_auto_tune();
    }

    pub fn invalidate_all(&self) {
        let mut geometry = self.geometry.write().unwrap();
        for set in &mut geometry.sets {
            for e in set {
                e.valid = false;
            }
        }
    }

    pub fn invalidate_asn(&self, asn: u32) {
        let mut geometry = self.geometry.write().unwrap();
        for set in &mut geometry.sets {
            for e in set {
                if e.valid && !e.global && e.asn == asn {
                    e.valid = false;
                }
            }
        }
    }

    pub fn invalidate_address(&self, va: u64, asn: Option<u32>) {
        let page = self.page_of(va);
        let mut geometry = self.geometry.write().unwrap();
        for set in &mut geometry.sets {
            for e in set {
                if !e.valid || e.virtual_page != page {
                    continue;
                }
                match asn {
                    Some(asn) if !e.global && e.asn != asn => continue,
                    _ => e.valid = false,
                }
            }
        }
    }

    pub fn invalidate_by_kind(&self, instruction: bool) {
        let mut geometry = self.geometry.write().unwrap();
        for set in &mut geometry.sets {
            for e in set {
                if e.valid && e.instruction == instruction {
                    e.valid = false;
                }
            }
        }
    }

    fn maybe_auto_tune(&self) {
        let count = self.op_counter.fetch_add(1, Ordering::Relaxed) + 1;
        if count % self.auto_tune_interval != 0 {
            return;
        }
        self.auto_tune();
    }

    /// Consult running statistics and reshape the cache if warranted.
    /// Runs entirely under the single write guard, so it cannot interleave
    /// with any other mutator (resolves the spec's open question on
    /// auto-tune/partitioning exclusivity).
    pub fn auto_tune(&self) {
        let lookups = self.window.lookups.load(Ordering::Relaxed);
        let hit_rate = self.window.hit_rate();
        let contention = self.window.contention.load(Ordering::Relaxed);

        let mut geometry = self.geometry.write().unwrap();
        let action = if contention > 1000 && geometry.partitions == 1 {
            AutoTuneAction::EnablePartitioning {
                partitions: PARTITION_CHOICES[0],
            }
        } else if hit_rate < 0.85 && lookups > 1000 && geometry.active_sets < self.max_sets {
            AutoTuneAction::ExpandSets
        } else if hit_rate < 0.85 && lookups > 1000 && geometry.active_ways < self.max_ways {
            AutoTuneAction::ExpandWays
        } else if hit_rate > 0.98 && lookups > 1000 && geometry.active_ways > 1 {
            AutoTuneAction::ReduceWays
        } else if geometry.partitions > 1 && contention < 100 {
            AutoTuneAction::DisablePartitioning
        } else {
            AutoTuneAction::None
        };

        let (new_sets, new_ways, new_partitions) = match action {
            AutoTuneAction::ExpandSets => ((geometry.active_sets * 2).min(self.max_sets), geometry.active_ways, geometry.partitions),
            AutoTuneAction::ExpandWays => (geometry.active_sets, (geometry.active_ways * 2).min(self.max_ways), geometry.partitions),
            AutoTuneAction::ReduceWays => (geometry.active_sets, (geometry.active_ways / 2).max(1), geometry.partitions),
            AutoTuneAction::EnablePartitioning { partitions } => (geometry.active_sets, geometry.active_ways, partitions),
            AutoTuneAction::DisablePartitioning => (geometry.active_sets, geometry.active_ways, 1),
            AutoTuneAction::None => (geometry.active_sets, geometry.active_ways, geometry.partitions),
        };

        if action != AutoTuneAction::None {
            self.rehome(&mut geometry, new_sets, new_ways, new_partitions);
        }
        drop(geometry);
        self.window.reset();

        if action != AutoTuneAction::None {
            self.notify(Event::AutoTune {
                action,
                new_sets,
                new_ways,
            });
        }
    }

    /// Rebuild storage at the new geometry and reinsert every currently
    /// valid entry, preserving invariant I2 (at most one authoritative
    /// entry per fingerprint survives the reshape).
    fn rehome(&self, geometry: &mut Geometry, new_sets: u64, new_ways: u64, new_partitions: u64) {
        let valid_entries = geometry.all_valid_entries();
        let mut fresh = Geometry::new(new_sets, new_ways);
        fresh.partitions = new_partitions;
        for entry in valid_entries {
            let set = fresh.set_index(entry.virtual_page, self.page_size, 0);
            fresh.insert_into_set(set, entry);
        }
        *geometry = fresh;
    }

    pub fn active_sets(&self) -> u64 {
        self.geometry.read().unwrap().active_sets
    }

    pub fn active_ways(&self) -> u64 {
        self.geometry.read().unwrap().active_ways
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}
