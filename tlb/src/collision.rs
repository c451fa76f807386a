//! CollisionDetector: prevents hazardous concurrent load/store ordering on
//! the same TLB index.
//!
//! Grounded on `original_source/AEJ/Archive/tlbcollisiondetector.h`: a
//! fixed-capacity slot table (4 concurrent operations), the same
//! `CollisionKind` classification and the same default priority
//! (`StorePriority`).

use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Load,
    Store,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionKind {
    None,
    LoadLoad,
    StoreStore,
    LoadStore,
    StoreLoad,
}

/// Stall-resolution policy when two in-flight operations collide on the
/// same `tb_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    LoadPriority,
    StorePriority,
    OldestFirst,
}

impl Default for Priority {
    fn default() -> Self {
        Self::StorePriority
    }
}

const MAX_CONCURRENT_OPERATIONS: usize = 4;

#[derive(Debug, Clone, Copy)]
struct InFlightOp {
    virtual_page: u64,
    tb_index: u64,
    kind: OpKind,
    thread_id: u64,
    start_time: Instant,
}

#[derive(Debug)]
struct Table {
    slots: [Option<InFlightOp>; MAX_CONCURRENT_OPERATIONS],
}

/// Tracks in-flight translation operations and reports hazardous overlaps
/// on a shared `tb_index`.
pub struct CollisionDetector {
    table: Mutex<Table>,
}

impl CollisionDetector {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table {
                slots: [None; MAX_CONCURRENT_OPERATIONS],
            }),
        }
    }

    /// Register a new in-flight operation. Returns the slot index, or
    /// `None` if the table is full.
    pub fn register(&self, virtual_page: u64, tb_index: u64, kind: OpKind, thread_id: u64) -> Option<usize> {
        let mut table = self.table.lock().unwrap();
        for (i, slot) in table.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(InFlightOp {
                    virtual_page,
                    tb_index,
                    kind,
                    thread_id,
                    start_time: Instant::now(),
                });
                return Some(i);
            }
        }
        None
    }

    /// Classify the worst collision against any other active operation
    /// sharing `tb_index`.
    pub fn detect(&self, tb_index: u64, _va: u64, is_load: bool) -> CollisionKind {
        let table = self.table.lock().unwrap();
        let mut worst = CollisionKind::None;
        for slot in table.slots.iter().flatten() {
            if slot.tb_index != tb_index {
                continue;
            }
            let kind = match (is_load, slot.kind) {
                (true, OpKind::Load) => CollisionKind::LoadLoad,
                (true, OpKind::Store) => CollisionKind::LoadStore,
                (false, OpKind::Store) => CollisionKind::StoreStore,
                (false, OpKind::Load) => CollisionKind::StoreLoad,
            };
            // LoadStore/StoreLoad are the only hazardous pairings worth
            // surfacing over a same-kind overlap; prefer them if present.
            worst = match (worst, kind) {
                (CollisionKind::None, k) => k,
                (w, CollisionKind::LoadStore) | (w, CollisionKind::StoreLoad) => {
                    let _ = w;
                    kind
                }
                (w, _) => w,
            };
        }
        worst
    }

    /// Whether the operation described by `kind`/`is_load` should stall,
    /// under `policy`.
    pub fn should_stall(&self, kind: CollisionKind, is_load: bool, policy: Priority) -> bool {
        match kind {
            CollisionKind::None => false,
            CollisionKind::LoadLoad | CollisionKind::StoreStore => false,
            CollisionKind::LoadStore | CollisionKind::StoreLoad => match policy {
                Priority::LoadPriority => !is_load,
                Priority::StorePriority => is_load,
                Priority::OldestFirst => true,
            },
        }
    }

    /// Remove the operation matching `va`/`tb_index`/`thread_id`.
    pub fn unregister(&self, virtual_page: u64, tb_index: u64, thread_id: u64) {
        let mut table = self.table.lock().unwrap();
        for slot in table.slots.iter_mut() {
            let matches = matches!(slot, Some(op)
                if op.virtual_page == virtual_page && op.tb_index == tb_index && op.thread_id == thread_id);
            if matches {
                *slot = None;
                return;
            }
        }
    }
}

impl Default for CollisionDetector {
    fn default() -> Self {
        Self::new()
    }
}
