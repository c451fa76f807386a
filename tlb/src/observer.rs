//! Observability channel.
//!
//! The original source exposes Qt signals from every component. Those map
//! poorly onto a threaded Rust core, so subscribers instead implement
//! [`Observer`] and are invoked synchronously, after the state mutation that
//! produced the event has completed. No global tracer singleton exists;
//! every component that can emit events is constructed with (or without) an
//! observer handle explicitly.

use crate::error::TranslationError;

/// Scope of a TLB invalidation, reported with `Event::TlbInvalidated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationScope {
    All,
    Asn(u32),
    Address { va: u64, asn: Option<u32> },
    InstructionKind(bool),
}

/// One record in the typed event stream named in the external-interfaces
/// contract.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Event {
    TranslationCompleted {
        op_id: u64,
        va: u64,
        latency_ns: u64,
    },
    TranslationFault {
        va: u64,
        asn: u32,
        error: TranslationError,
    },
    TlbInvalidated {
        scope: InvalidationScope,
    },
    CollisionDetected {
        kind: crate::collision::CollisionKind,
        tb_index: u64,
        va: u64,
    },
    CacheCoherencyEvent {
        pa: u64,
        source_cpu: u32,
        op: crate::collab::CacheOp,
        hit: bool,
        level: u8,
        state: crate::collab::CoherencyState,
    },
    AutoTune {
        action: crate::cache::AutoTuneAction,
        new_sets: u64,
        new_ways: u64,
    },
}

/// A subscriber to the translation core's event stream.
///
/// Implementations must return promptly: they run on the thread that
/// produced the event, synchronously, with no internal locks held by the
/// core.
pub trait Observer: Send + Sync {
    fn notify(&self, event: Event);
}

/// An observer that discards every event; the default when no embedder
/// supplies one.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl Observer for NullObserver {
    fn notify(&self, _event: Event) {}
}
