//! TLBCacheIntegrator: the single entry point a simulated CPU core calls to
//! turn a virtual address into a physical one, wiring together every other
//! component in this crate.
//!
//! Grounded on `original_source/AEJ/tlbSystem.cpp` and
//! `original_source/AEJ/Archive/tlbcacheintegrator.h`: the same miss path
//! (per-CPU TLB → shared cache → page-table walk, each level populating the
//! ones above it) and the same invalidation fan-out (a VA invalidation must
//! reach the per-CPU TLB, the shared cache, and the recent-translation map
//! kept for instrumentation).

use crate::cache::TranslationCache;
use crate::collab::{CacheController, CacheOp, CpuAgent, MemoryBackend};
use crate::collision::{CollisionDetector, OpKind, Priority};
use crate::config::Config;
use crate::coordinator::{OperationType, PipelineCoordinator, Stage};
use crate::entry::{AccessKind, Protection, TlbEntry};
use crate::error::{TranslationError, TranslationResult};
use crate::faults::{ErrorHandler, FaultKind, RecoveryAction};
use crate::observer::{Event, Observer};
use crate::optimizer::{OptimizerStrategy, PerformanceOptimizer};
use crate::system::TlbSystem;
use crate::translator::AddressTranslator;
use crate::walker::{PageTableWalker, TranslationOutcome};
use axp_abi::PhysAddr;
use log::trace;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Permission bits a walk's `TranslationOutcome` grants, for caching: the
/// walker already enforced these at fault time, so any entry rehydrated
/// from it must carry the same restriction forward rather than a blanket
/// grant.
fn protection_from_outcome(outcome: &TranslationOutcome) -> Protection {
    let mut protection = Protection::empty();
    if outcome.readable {
        protection |= Protection::READ;
    }
    if outcome.writable {
        protection |= Protection::WRITE;
    }
    if outcome.executable {
        protection |= Protection::EXECUTE;
    }
    protection
}

/// Which `CacheOp` a memory access maps onto when delegating to the
/// cache-hierarchy collaborator.
fn cache_op_for(op: AccessKind) -> CacheOp {
    match op {
        AccessKind::Write => CacheOp::Write,
        AccessKind::Read | AccessKind::Execute => CacheOp::Read,
    }
}

fn fault_kind_for(err: TranslationError) -> FaultKind {
    match err {
        TranslationError::NonCanonicalAddress { .. } => FaultKind::InvalidAddress,
        TranslationError::InvalidPte { .. } => FaultKind::PageFault,
        TranslationError::ProtectionRead { .. }
        | TranslationError::ProtectionWrite { .. }
        | TranslationError::ProtectionExec { .. } => FaultKind::ProtectionViolation,
        TranslationError::PrivilegeViolation { .. } => FaultKind::PrivilegeViolation,
        TranslationError::CpuAlreadyRegistered { .. } | TranslationError::CpuNotRegistered { .. } => {
            FaultKind::ResourceExhaustion
        }
        TranslationError::CollisionTableFull => FaultKind::ResourceExhaustion,
        TranslationError::PipelineQueueFull => FaultKind::ResourceExhaustion,
        TranslationError::UnknownOperation { .. } => FaultKind::TranslationFault,
        TranslationError::ReplayExhausted { .. } => FaultKind::TimeoutError,
    }
}

/// Which level of the hierarchy satisfied a request, for the per-level hit
/// counters named in the supplemental instrumentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitLevel {
    PerCpuTlb,
    SharedCache,
    PageTableWalk,
}

#[derive(Debug, Clone, Copy)]
pub struct Response {
    pub physical_address: u64,
    pub hit_level: HitLevel,
}

#[derive(Debug, Default)]
struct LevelStats {
    percpu: AtomicU64,
    shared_cache: AtomicU64,
    walk: AtomicU64,
    collisions: AtomicU64,
}

impl LevelStats {
    fn total(&self) -> u64 {
        self.percpu.load(Ordering::Relaxed)
            + self.shared_cache.load(Ordering::Relaxed)
            + self.walk.load(Ordering::Relaxed)
    }
}

/// Top-level facade: the only type an embedding simulator needs to touch
/// for ordinary memory-request traffic.
pub struct TlbCacheIntegrator {
    config: Config,
    tlb_system: TlbSystem,
    translation_cache: TranslationCache,
    translator: AddressTranslator,
    coordinator: PipelineCoordinator,
    collision: CollisionDetector,
    errors: ErrorHandler,
    optimizer: PerformanceOptimizer,
    memory: Arc<dyn MemoryBackend>,
    cpu_agent: Arc<dyn CpuAgent>,
    cache_controller: Option<Arc<dyn CacheController>>,
    observer: Option<Arc<dyn Observer>>,
    recent: Mutex<HashMap<(u32, u64), u64>>,
    level_stats: LevelStats,
}

impl TlbCacheIntegrator {
    pub fn new(
        config: Config,
        memory: Arc<dyn MemoryBackend>,
        cpu_agent: Arc<dyn CpuAgent>,
        cache_controller: Option<Arc<dyn CacheController>>,
        observer: Option<Arc<dyn Observer>>,
    ) -> Self {
        let tlb_system = match &observer {
            Some(o) => TlbSystem::new(config.tlb_max_cpus, config.tlb_capacity).with_observer(o.clone()),
            None => TlbSystem::new(config.tlb_max_cpus, config.tlb_capacity),
        };
        let translation_cache = {
            let c = TranslationCache::new(
                config.cache_initial_sets,
                config.cache_initial_ways,
                config.cache_max_sets,
                config.cache_max_ways,
                config.cache_page_size,
                config.cache_auto_tune_interval,
            );
            match &observer {
                Some(o) => c.with_observer(o.clone()),
                None => c,
            }
        };
        Self {
            coordinator: PipelineCoordinator::new(
                config.coordinator_max_depth,
                config.coordinator_stall_queue,
                config.coordinator_max_replays,
                config.coordinator_stall_timeout_ms,
            ),
            errors: ErrorHandler::new(
                config.errors_history_size,
                config.errors_burst_threshold,
                config.errors_burst_window_ms,
                config.errors_fault_rate_threshold,
                config.errors_monitoring_interval_ms,
            ),
            optimizer: PerformanceOptimizer::new(
                config.optimizer_strategy,
                config.optimizer_prefetch_depth,
                config.optimizer_prefetch_distance,
            ),
            collision: CollisionDetector::new(),
            tlb_system,
            translation_cache,
            translator: AddressTranslator::new(),
            memory,
            cpu_agent,
            cache_controller,
            observer,
            recent: Mutex::new(HashMap::new()),
            level_stats: LevelStats::default(),
            config,
        }
    }

    fn notify(&self, event: Event) {
        if let Some(observer) = &self.observer {
            observer.notify(event);
        }
    }

    pub fn register_cpu(&self, cpu_id: u32) -> TranslationResult<()> {
        self.tlb_system.register_cpu(cpu_id)
    }

    /// Resolve `va` for `cpu_id`, walking the hierarchy on a miss and
    /// populating every level above the one that satisfied the request.
    ///
    /// Runs the request through the pipeline coordinator (decode → TLB
    /// lookup → permission check → collision detect → complete) so the
    /// stage bookkeeping stays accurate even though this implementation
    /// resolves a request synchronously rather than across ticks.
    pub fn process_memory_request(
        &self,
        cpu_id: u32,
        va: u64,
        op: AccessKind,
        pid: u32,
        thread_id: u64,
    ) -> TranslationResult<Response> {
        self.translator.validate(va)?;

        let op_type = match op {
            AccessKind::Write => OperationType::Store,
            AccessKind::Execute => OperationType::InstructionFetch,
            AccessKind::Read => OperationType::Load,
        };
        let tb_index = self
            .translator
            .tb_index(va, self.config.cache_page_size, self.translation_cache.active_sets());
        let op_id = self.coordinator.submit(op_type, tb_index, va)?;
        self.coordinator.advance(op_id, Stage::AddressDecode)?;

        let result = self.resolve(cpu_id, va, op, pid, thread_id, op_id);

        match &result {
            Ok(_) => {
                self.coordinator.advance(op_id, Stage::TranslationComplete)?;
            }
            Err(err) => {
                let (_, action) = self.errors.report(fault_kind_for(*err), va);
                self.cpu_agent.on_fault(cpu_id, fault_kind_for(*err), va, pid);
                self.notify(Event::TranslationFault {
                    va,
                    asn: self.cpu_agent.current_asn(cpu_id),
                    error: *err,
                });
                if action == RecoveryAction::ResetPipeline || action == RecoveryAction::SystemHalt {
                    self.coordinator.drain();
                } else {
                    let _ = self.coordinator.advance(op_id, Stage::TranslationComplete);
                }
            }
        }
        result
    }

    fn resolve(
        &self,
        cpu_id: u32,
        va: u64,
        op: AccessKind,
        pid: u32,
        thread_id: u64,
        op_id: u64,
    ) -> TranslationResult<Response> {
        let asn = self.cpu_agent.current_asn(cpu_id);
        let privileged = self.cpu_agent.privilege_level(cpu_id) == crate::collab::PrivilegeLevel::Kernel;
        let instruction = matches!(op, AccessKind::Execute);
        let is_load = op != AccessKind::Write;

        self.coordinator.advance(op_id, Stage::TlbLookup)?;
        if let Ok(Some(entry)) = self.tlb_system.with_cpu(cpu_id, |tlb| {
            tlb.find(page_number_key(va, self.config.cache_page_size), asn, instruction, op, privileged)
        }) {
            self.level_stats.percpu.fetch_add(1, Ordering::Relaxed);
            self.translator.record_hit();
            let pa = entry.physical_for(va);
            self.remember(cpu_id, va, pa);
            self.dispatch_cache_op(pa, op, cpu_id);
            return Ok(Response {
                physical_address: pa,
                hit_level: HitLevel::PerCpuTlb,
            });
        }

        self.coordinator.advance(op_id, Stage::PermissionCheck)?;
        let tb_index = self
            .translator
            .tb_index(va, self.config.cache_page_size, self.translation_cache.active_sets());

        self.coordinator.advance(op_id, Stage::CollisionDetect)?;
        let kind = if op == AccessKind::Write {
            OpKind::Store
        } else {
            OpKind::Load
        };
        let slot = self.collision.register(va, tb_index, kind, thread_id);
        let collision_kind = self.collision.detect(tb_index, va, kind == OpKind::Load);
        let should_stall = self.collision.should_stall(collision_kind, kind == OpKind::Load, Priority::default());
        if should_stall {
            self.level_stats.collisions.fetch_add(1, Ordering::Relaxed);
            self.notify(Event::CollisionDetected {
                kind: collision_kind,
                tb_index,
                va,
            });
        }
        self.adapt_if_due();

        if let Some(entry) = self.translation_cache.lookup(va, asn, privileged, instruction, thread_id) {
            if slot.is_some() {
                self.collision.unregister(va, tb_index, thread_id);
            }
            self.level_stats.shared_cache.fetch_add(1, Ordering::Relaxed);
            self.translator.record_hit();
            let pa = entry.physical_for(va);
            self.tlb_system.insert(cpu_id, entry).ok();
            self.remember(cpu_id, va, pa);
            self.dispatch_cache_op(pa, op, cpu_id);
            self.observe_and_prefetch(thread_id, va);
            return Ok(Response {
                physical_address: pa,
                hit_level: HitLevel::SharedCache,
            });
        }

        let ptbr_pfn = self.cpu_agent.ptbr_pfn(cpu_id);
        let walker = PageTableWalker::new(self.memory.as_ref());
        let outcome = walker.translate_with_ptbr(va, op, privileged, ptbr_pfn);
        if slot.is_some() {
            self.collision.unregister(va, tb_index, thread_id);
        }
        let outcome = outcome?;

        self.level_stats.walk.fetch_add(1, Ordering::Relaxed);
        self.translator.record_miss();
        if self.optimizer.strategy() == OptimizerStrategy::Banking {
            let bank = self.optimizer.bank_for(va, self.config.cache_page_size, is_load);
            trace!("va {:#x} ({}) assigned to bank {}", va, if is_load { "load" } else { "store" }, bank);
        }
        let entry = TlbEntry::new(
            page_number_key(va, self.config.cache_page_size),
            outcome.physical_address & !(self.config.cache_page_size - 1),
            asn,
            protection_from_outcome(&outcome),
            outcome.software_asm,
            instruction,
            outcome.granularity,
            false,
        );
        self.translation_cache.insert(entry, thread_id);
        self.tlb_system.insert(cpu_id, entry).ok();
        self.remember(cpu_id, va, outcome.physical_address);

        self.dispatch_cache_op(outcome.physical_address, op, cpu_id);
        self.observe_and_prefetch(thread_id, va);

        Ok(Response {
            physical_address: outcome.physical_address,
            hit_level: HitLevel::PageTableWalk,
        })
    }

    /// Delegate to the cache hierarchy with the `CacheOp` matching the real
    /// access kind, and surface the resulting hit/level/coherency state to
    /// observers.
    fn dispatch_cache_op(&self, pa: u64, op: AccessKind, cpu_id: u32) {
        let Some(controller) = &self.cache_controller else {
            return;
        };
        let cache_op = cache_op_for(op);
        let outcome = match cache_op {
            CacheOp::Write => controller.write(PhysAddr::new(pa)),
            _ => controller.lookup(PhysAddr::new(pa)),
        };
        self.notify(Event::CacheCoherencyEvent {
            pa,
            source_cpu: cpu_id,
            op: cache_op,
            hit: outcome.hit,
            level: outcome.level,
            state: outcome.state,
        });
    }

    /// Feed this access to the stride-table prefetcher and issue any
    /// resulting prefetches against the cache hierarchy.
    fn observe_and_prefetch(&self, thread_id: u64, va: u64) {
        let targets = self.optimizer.observe_and_prefetch(thread_id, va);
        if targets.is_empty() {
            return;
        }
        if let Some(controller) = &self.cache_controller {
            for target in targets {
                controller.prefetch(PhysAddr::new(target));
            }
        }
    }

    /// Periodically compare the observed collision rate against the
    /// optimizer's target and apply any recommended strategy switch.
    fn adapt_if_due(&self) {
        let total = self.level_stats.total().max(1);
        let collisions = self.level_stats.collisions.load(Ordering::Relaxed);
        let rate = collisions as f64 / total as f64;
        if let Some(tuning) = self.optimizer.maybe_adapt(rate) {
            if let Some(strategy) = tuning.strategy {
                self.optimizer.set_strategy(strategy);
            }
        }
    }

    fn remember(&self, cpu_id: u32, va: u64, pa: u64) {
        self.recent.lock().unwrap().insert((cpu_id, va), pa);
    }

    pub fn invalidate_address_mapping(&self, va: u64, asn: Option<u32>) {
        self.tlb_system.invalidate_address_all_cpus(va, asn, None);
        self.translation_cache.invalidate_address(va, asn);
        let mut recent = self.recent.lock().unwrap();
        if let Some(controller) = &self.cache_controller {
            for (_, pa) in recent.iter().filter(|((_, key_va), _)| *key_va == va) {
                controller.invalidate(PhysAddr::new(*pa));
            }
        }
        recent.retain(|(_, key_va), _| *key_va != va);
    }

    pub fn flush_process_mappings(&self, asn: u32) {
        self.tlb_system.invalidate_asn_all_cpus(asn, None);
        self.translation_cache.invalidate_asn(asn);
        self.recent.lock().unwrap().clear();
    }

    pub fn flush_all_mappings(&self) {
        self.tlb_system.invalidate_all_cpus(None);
        self.translation_cache.invalidate_all();
        self.recent.lock().unwrap().clear();
    }

    pub fn level_stats(&self) -> (u64, u64, u64) {
        (
            self.level_stats.percpu.load(Ordering::Relaxed),
            self.level_stats.shared_cache.load(Ordering::Relaxed),
            self.level_stats.walk.load(Ordering::Relaxed),
        )
    }

    pub fn coordinator(&self) -> &PipelineCoordinator {
        &self.coordinator
    }

    pub fn errors(&self) -> &ErrorHandler {
        &self.errors
    }

    pub fn optimizer(&self) -> &PerformanceOptimizer {
        &self.optimizer
    }
}

/// Per-CPU TLB entries are keyed by full virtual page number (shift only),
/// not by a fixed page size, since granularity is resolved at the leaf.
fn page_number_key(va: u64, page_size: u64) -> u64 {
    va & !(page_size - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::PrivilegeLevel;
    use std::sync::Mutex as StdMutex;

    struct FlatMemory(StdMutex<Vec<u8>>);

    impl FlatMemory {
        fn new(size: usize) -> Self {
            Self(StdMutex::new(vec![0u8; size]))
        }
        fn set_pte(&self, addr: u64, pte: u64) {
            let mut g = self.0.lock().unwrap();
            let i = addr as usize;
            g[i..i + 8].copy_from_slice(&pte.to_le_bytes());
        }
    }

    impl MemoryBackend for FlatMemory {
        fn read_phys_u64(&self, addr: PhysAddr) -> u64 {
            let g = self.0.lock().unwrap();
            let i = addr.as_u64() as usize;
            u64::from_le_bytes(g[i..i + 8].try_into().unwrap())
        }
        fn write_phys_u64(&self, addr: PhysAddr, value: u64) {
            let mut g = self.0.lock().unwrap();
            let i = addr.as_u64() as usize;
            g[i..i + 8].copy_from_slice(&value.to_le_bytes());
        }
    }

    struct FixedCpu;
    impl CpuAgent for FixedCpu {
        fn privilege_level(&self, _cpu_id: u32) -> PrivilegeLevel {
            PrivilegeLevel::Kernel
        }
        fn current_asn(&self, _cpu_id: u32) -> u32 {
            1
        }
        fn ptbr_pfn(&self, _cpu_id: u32) -> u64 {
            0
        }
        fn on_fault(&self, _cpu_id: u32, _fault: FaultKind, _va: u64, _pid: u32) {}
    }

    fn setup() -> (TlbCacheIntegrator, Arc<FlatMemory>) {
        let mem = Arc::new(FlatMemory::new(1 << 20));
        let l1_idx = crate::pagetable::PageTableLevel::L1.index_of(0x3000);
        let l2_idx = crate::pagetable::PageTableLevel::L2.index_of(0x3000);
        let l3_idx = crate::pagetable::PageTableLevel::L3.index_of(0x3000);
        mem.set_pte(
            l1_idx * 8,
            crate::pagetable::PageTableEntry::new(0x2000 >> 13, crate::entry::Granularity::G8Kb, 1).0,
        );
        mem.set_pte(
            0x2000 + l2_idx * 8,
            crate::pagetable::PageTableEntry::new(0x4000 >> 13, crate::entry::Granularity::G8Kb, 1).0,
        );
        mem.set_pte(
            0x4000 + l3_idx * 8,
            crate::pagetable::PageTableEntry::new(0x9000, crate::entry::Granularity::G8Kb, 1).0,
        );

        let integrator = TlbCacheIntegrator::new(
            Config::default(),
            mem.clone(),
            Arc::new(FixedCpu),
            None,
            None,
        );
        integrator.register_cpu(0).unwrap();
        (integrator, mem)
    }

    #[test]
    fn miss_walks_then_hits_percpu_tlb_on_repeat() {
        let (integrator, _mem) = setup();
        let first = integrator
            .process_memory_request(0, 0x3000, AccessKind::Read, 1, 42)
            .expect("first request should walk the page table");
        assert_eq!(first.hit_level, HitLevel::PageTableWalk);
        assert_eq!(first.physical_address, 0x9000 << 13);

        let second = integrator
            .process_memory_request(0, 0x3000, AccessKind::Read, 1, 42)
            .expect("second request should hit the per-cpu tlb");
        assert_eq!(second.hit_level, HitLevel::PerCpuTlb);
        assert_eq!(second.physical_address, first.physical_address);
    }

    #[test]
    fn invalidate_address_forces_a_fresh_walk() {
        let (integrator, _mem) = setup();
        integrator
            .process_memory_request(0, 0x3000, AccessKind::Read, 1, 42)
            .unwrap();
        integrator.invalidate_address_mapping(0x3000 & !0x1FFF, None);
        let after = integrator
            .process_memory_request(0, 0x3000, AccessKind::Read, 1, 42)
            .unwrap();
        assert_eq!(after.hit_level, HitLevel::PageTableWalk);
    }

    #[test]
    fn invalid_pte_surfaces_as_error_and_reports_fault() {
        let (integrator, _mem) = setup();
        let err = integrator
            .process_memory_request(0, 0x5000, AccessKind::Read, 1, 42)
            .unwrap_err();
        assert!(matches!(err, TranslationError::InvalidPte { .. }));
    }
}
