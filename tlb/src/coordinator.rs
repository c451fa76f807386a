//! PipelineCoordinator: sequences each translation through
//! decode→lookup→permission-check→collision-detect→complete, with bounded
//! stall and replay queues.
//!
//! Grounded on `original_source/AEJ/tlbpipelinecoordinator.h`: the same
//! stage enum, the same default bounds (depth 8, stall queue 16, 3 replays,
//! 1s stall timeout), and the same three-queue structure. Queue mutexes are
//! acquired in the fixed order `active → stall → replay` everywhere, per the
//! concurrency model, to rule out deadlock between `stall`/`unstall` and
//! `process_timeouts` running concurrently.

use crate::error::{TranslationError, TranslationResult};
use crate::observer::{Event, Observer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    AddressDecode,
    TlbLookup,
    PermissionCheck,
    CollisionDetect,
    TranslationComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallReason {
    Collision,
    Permission,
    Resource,
    Dependency,
    QueueFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    Load,
    Store,
    InstructionFetch,
}

#[derive(Debug, Clone, Copy)]
struct Operation {
    id: u64,
    op_type: OperationType,
    tb_index: u64,
    va: u64,
    stage: Stage,
    submitted_at: Instant,
    stalled_at: Option<Instant>,
    replays: u32,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CoordinatorStats {
    pub submitted: u64,
    pub stalled: u64,
    pub replayed: u64,
    pub dropped: u64,
    pub completed: u64,
}

pub struct PipelineCoordinator {
    active: Mutex<Vec<Operation>>,
    stall_queue: Mutex<Vec<(Operation, StallReason)>>,
    replay_queue: Mutex<Vec<Operation>>,
    next_id: AtomicU64,
    max_depth: usize,
    stall_queue_cap: usize,
    max_replays: u32,
    stall_timeout: Duration,
    stats: Mutex<CoordinatorStats>,
    observer: Option<Arc<dyn Observer>>,
}

impl PipelineCoordinator {
    pub fn new(max_depth: usize, stall_queue_cap: usize, max_replays: u32, stall_timeout_ms: u64) -> Self {
        Self {
            active: Mutex::new(Vec::new()),
            stall_queue: Mutex::new(Vec::new()),
            replay_queue: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            max_depth,
            stall_queue_cap,
            max_replays,
            stall_timeout: Duration::from_millis(stall_timeout_ms),
            stats: Mutex::new(CoordinatorStats::default()),
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

    /// Enqueue a new operation at `AddressDecode`. Refuses once the active
    /// queue reaches `max_depth`. `tb_index` is the TLB set index the
    /// translation will land in; `va` is the virtual address being
    /// translated, carried through for the `TranslationCompleted` event.
    pub fn submit(&self, op_type: OperationType, tb_index: u64, va: u64) -> TranslationResult<u64> {
        let mut active = self.active.lock().unwrap();
        if active.len() >= self.max_depth {
            return Err(TranslationError::PipelineQueueFull);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        active.push(Operation {
            id,
            op_type,
            tb_index,
            va,
            stage: Stage::AddressDecode,
            submitted_at: Instant::now(),
            stalled_at: None,
            replays: 0,
        });
        self.stats.lock().unwrap().submitted += 1;
        Ok(id)
    }

    /// Advance `op_id` to `new_stage`. Idempotent if already there. Removing
    /// the operation on reaching `TranslationComplete` emits the latency
    /// event named in the external-interfaces contract.
    pub fn advance(&self, op_id: u64, new_stage: Stage) -> TranslationResult<()> {
        let mut active = self.active.lock().unwrap();
        let idx = active
            .iter()
            .position(|op| op.id == op_id)
            .ok_or(TranslationError::UnknownOperation { op_id })?;

        if active[idx].stage == new_stage {
            return Ok(());
        }
        active[idx].stage = new_stage;

        if new_stage == Stage::TranslationComplete {
            let op = active.remove(idx);
            drop(active);
            let latency_ns = op.submitted_at.elapsed().as_nanos() as u64;
            self.stats.lock().unwrap().completed += 1;
            self.notify(Event::TranslationCompleted {
                op_id,
                va: op.va,
                latency_ns,
            });
        }
        Ok(())
    }

    /// Move `op_id` from the active queue to the stall queue with `reason`.
    pub fn stall(&self, op_id: u64, reason: StallReason) -> TranslationResult<()> {
        let mut active = self.active.lock().unwrap();
        let idx = active
            .iter()
            .position(|op| op.id == op_id)
            .ok_or(TranslationError::UnknownOperation { op_id })?;
        let mut op = active.remove(idx);
        drop(active);

        op.stalled_at = Some(Instant::now());
        let mut stall_queue = self.stall_queue.lock().unwrap();
        if stall_queue.len() >= self.stall_queue_cap {
            drop(stall_queue);
            self.stats.lock().unwrap().dropped += 1;
            return Err(TranslationError::ReplayExhausted { op_id });
        }
        stall_queue.push((op, reason));
        self.stats.lock().unwrap().stalled += 1;
        Ok(())
    }

    /// Re-admit `op_id` from the stall queue to the active queue: the head
    /// if `high_priority`, the tail otherwise. Falls back to the replay
    /// queue if there is no room.
    pub fn unstall(&self, op_id: u64, high_priority: bool) -> TranslationResult<()> {
        let mut stall_queue = self.stall_queue.lock().unwrap();
        let idx = stall_queue
            .iter()
            .position(|(op, _)| op.id == op_id)
            .ok_or(TranslationError::UnknownOperation { op_id })?;
        let (mut op, _) = stall_queue.remove(idx);
        drop(stall_queue);

        op.stalled_at = None;
        let mut active = self.active.lock().unwrap();
        if active.len() < self.max_depth {
            if high_priority {
                active.insert(0, op);
            } else {
                active.push(op);
            }
            Ok(())
        } else {
            drop(active);
            self.replay_queue.lock().unwrap().push(op);
            Ok(())
        }
    }

    /// Sweep the stall queue for operations past `stall_timeout`: replay
    /// (re-enter at `AddressDecode`) if under `max_replays`, else drop and
    /// report `TimeoutError` to the caller via the returned list.
    pub fn process_timeouts(&self) -> Vec<u64> {
        let mut timed_out = Vec::new();
        let mut stall_queue = self.stall_queue.lock().unwrap();
        let now = Instant::now();
        let mut remaining = Vec::with_capacity(stall_queue.len());
        for (mut op, reason) in stall_queue.drain(..) {
            let elapsed = op.stalled_at.map(|at| now.duration_since(at)).unwrap_or_default();
            if elapsed < self.stall_timeout {
                remaining.push((op, reason));
                continue;
            }
            if op.replays < self.max_replays {
                op.replays += 1;
                op.stage = Stage::AddressDecode;
                op.stalled_at = None;
                self.replay_queue.lock().unwrap().push(op);
                self.stats.lock().unwrap().replayed += 1;
            } else {
                timed_out.push(op.id);
                self.stats.lock().unwrap().dropped += 1;
            }
        }
        *stall_queue = remaining;
        timed_out
    }

    /// Drain every queue (used on severe error, per the error-handling
    /// design's `ResetPipeline` action).
    pub fn drain(&self) {
        self.active.lock().unwrap().clear();
        self.stall_queue.lock().unwrap().clear();
        self.replay_queue.lock().unwrap().clear();
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    pub fn stall_count(&self) -> usize {
        self.stall_queue.lock().unwrap().len()
    }

    pub fn stats(&self) -> CoordinatorStats {
        *self.stats.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_refuses_once_full() {
        let coord = PipelineCoordinator::new(2, 4, 3, 1000);
        coord.submit(OperationType::Load, 0, 0x1000).unwrap();
        coord.submit(OperationType::Load, 0, 0x2000).unwrap();
        assert!(matches!(
            coord.submit(OperationType::Load, 0, 0x3000),
            Err(TranslationError::PipelineQueueFull)
        ));
    }

    #[test]
    fn advance_to_complete_removes_operation() {
        let coord = PipelineCoordinator::new(4, 4, 3, 1000);
        let id = coord.submit(OperationType::Load, 0, 0x1000).unwrap();
        coord.advance(id, Stage::TlbLookup).unwrap();
        coord.advance(id, Stage::TranslationComplete).unwrap();
        assert_eq!(coord.active_count(), 0);
        assert_eq!(coord.stats().completed, 1);
    }

    #[test]
    fn stall_then_unstall_round_trips() {
        let coord = PipelineCoordinator::new(4, 4, 3, 1000);
        let id = coord.submit(OperationType::Store, 5, 0xA000).unwrap();
        coord.stall(id, StallReason::Collision).unwrap();
        assert_eq!(coord.stall_count(), 1);
        coord.unstall(id, true).unwrap();
        assert_eq!(coord.active_count(), 1);
    }

    #[test]
    fn unstall_low_priority_goes_to_tail() {
        let coord = PipelineCoordinator::new(4, 4, 3, 1000);
        let first = coord.submit(OperationType::Load, 0, 0x1000).unwrap();
        let second = coord.submit(OperationType::Store, 1, 0x2000).unwrap();
        coord.stall(second, StallReason::Collision).unwrap();
        coord.unstall(second, false).unwrap();

        let active = coord.active.lock().unwrap();
        assert_eq!(active[0].id, first);
        assert_eq!(active[1].id, second);
    }

    #[test]
    fn process_timeouts_replays_then_drops() {
        let coord = PipelineCoordinator::new(4, 4, 1, 0);
        let id = coord.submit(OperationType::Load, 0, 0x1000).unwrap();
        coord.stall(id, StallReason::Resource).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let timed_out = coord.process_timeouts();
        assert!(timed_out.is_empty());
        assert_eq!(coord.stats().replayed, 1);
    }

    #[test]
    fn unknown_operation_errors() {
        let coord = PipelineCoordinator::new(4, 4, 3, 1000);
        assert!(matches!(
            coord.advance(999, Stage::TlbLookup),
            Err(TranslationError::UnknownOperation { op_id: 999 })
        ));
    }
}
