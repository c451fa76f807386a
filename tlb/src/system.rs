//! TLBSystem: owns every registered CPU's `PerCpuTlb` and coordinates
//! broadcast invalidation.
//!
//! Grounded on the teacher's SMP shootdown machinery (`mm/src/tlb.rs`): the
//! same idea of "local flush first, then broadcast", but without IPIs or
//! interrupt vectors — this core runs on ordinary host threads, so a
//! broadcast is simply an iteration under the system's write guard with
//! acquire/release fences matching the concurrency model's requirement that
//! another CPU's subsequent translation observe the invalidation.

use crate::entry::TlbEntry;
use crate::error::{TranslationError, TranslationResult};
use crate::observer::{Event, InvalidationScope, Observer};
use crate::percpu::PerCpuTlb;
use std::collections::HashMap;
use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, RwLock};

pub struct TlbSystem {
    cpus: RwLock<HashMap<u32, PerCpuTlb>>,
    max_cpus: u32,
    capacity_per_cpu: usize,
    observer: Option<Arc<dyn Observer>>,
}

impl TlbSystem {
    pub fn new(max_cpus: u32, capacity_per_cpu: usize) -> Self {
        Self {
            cpus: RwLock::new(HashMap::new()),
            max_cpus,
            capacity_per_cpu,
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

    pub fn register_cpu(&self, cpu_id: u32) -> TranslationResult<()> {
        if cpu_id >= self.max_cpus {
            return Err(TranslationError::CpuAlreadyRegistered { cpu_id });
        }
        let mut cpus = self.cpus.write().unwrap();
        if cpus.contains_key(&cpu_id) {
            return Err(TranslationError::CpuAlreadyRegistered { cpu_id });
        }
        cpus.insert(cpu_id, PerCpuTlb::new(self.capacity_per_cpu));
        Ok(())
    }

    pub fn unregister_cpu(&self, cpu_id: u32) -> TranslationResult<()> {
        let mut cpus = self.cpus.write().unwrap();
        cpus.remove(&cpu_id)
            .map(|_| ())
            .ok_or(TranslationError::CpuNotRegistered { cpu_id })
    }

    pub fn with_cpu<R>(&self, cpu_id: u32, f: impl FnOnce(&mut PerCpuTlb) -> R) -> TranslationResult<R> {
        let mut cpus = self.cpus.write().unwrap();
        let tlb = cpus
            .get_mut(&cpu_id)
            .ok_or(TranslationError::CpuNotRegistered { cpu_id })?;
        Ok(f(tlb))
    }

    pub fn insert(&self, cpu_id: u32, entry: TlbEntry) -> TranslationResult<()> {
        self.with_cpu(cpu_id, |tlb| tlb.insert(entry))
    }

    /// Invalidate `scope` on every registered CPU except `except_cpu`.
    ///
    /// Releases and re-acquires the per-CPU mutation around each CPU so no
    /// single invalidation blocks forward progress of an unrelated lookup
    /// for longer than one CPU's worth of work, then fences so the write is
    /// visible to any CPU's subsequent translation (the linearization point
    /// required by property P7 is this function's return).
    fn broadcast(&self, scope: InvalidationScope, except_cpu: Option<u32>, mutate: impl Fn(&mut PerCpuTlb)) {
        let cpu_ids: Vec<u32> = {
            let cpus = self.cpus.read().unwrap();
            cpus.keys().copied().collect()
        };
        for cpu_id in cpu_ids {
            if Some(cpu_id) == except_cpu {
                continue;
            }
            let mut cpus = self.cpus.write().unwrap();
            if let Some(tlb) = cpus.get_mut(&cpu_id) {
                mutate(tlb);
            }
        }
        fence(Ordering::SeqCst);
        self.notify(Event::TlbInvalidated { scope });
    }

    pub fn invalidate_all_cpus(&self, except_cpu: Option<u32>) {
        self.broadcast(InvalidationScope::All, except_cpu, |tlb| tlb.invalidate_all());
    }

    pub fn invalidate_asn_all_cpus(&self, asn: u32, except_cpu: Option<u32>) {
        self.broadcast(InvalidationScope::Asn(asn), except_cpu, |tlb| {
            tlb.invalidate_asn(asn)
        });
    }

    pub fn invalidate_address_all_cpus(&self, va: u64, asn: Option<u32>, except_cpu: Option<u32>) {
        self.broadcast(InvalidationScope::Address { va, asn }, except_cpu, |tlb| {
            tlb.invalidate_address(va, asn)
        });
    }

    pub fn invalidate_instruction_kind_all_cpus(&self, instruction: bool, except_cpu: Option<u32>) {
        self.broadcast(InvalidationScope::InstructionKind(instruction), except_cpu, |tlb| {
            tlb.invalidate_instruction_kind(instruction)
        });
    }

    /// Record a new ASN for `cpu_id`. Per policy, a context switch also
    /// flushes that CPU's entries tagged with the *old* ASN, since Alpha's
    /// ASN space is commonly small enough that reuse is imminent.
    pub fn update_cpu_context(&self, cpu_id: u32, old_asn: u32, _new_asn: u32) -> TranslationResult<()> {
        self.with_cpu(cpu_id, |tlb| tlb.invalidate_asn(old_asn))
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.read().unwrap().len()
    }

    pub fn stats(&self, cpu_id: u32) -> TranslationResult<(u64, u64)> {
        let cpus = self.cpus.read().unwrap();
        let tlb = cpus
            .get(&cpu_id)
            .ok_or(TranslationError::CpuNotRegistered { cpu_id })?;
        Ok((tlb.hits(), tlb.misses()))
    }
}
