//! ErrorHandler: classifies faults, maps each to a recovery action, and
//! watches for fault bursts and sustained high fault rates.
//!
//! Grounded on `original_source/AEJ/tlberrorhandler.h`: the same fault
//! taxonomy and severity levels, the same fixed (kind, severity) → action
//! table, and the same burst window/threshold. The bounded history ring
//! follows the same fixed-capacity-overwrite-oldest shape as the teacher's
//! `RingBuffer<T, N>` (`lib/src/ring_buffer.rs` in the donor tree), adapted
//! here to a plain `Vec`-backed ring since this core has no heapless-buffer
//! constraint.

use log::{error, warn};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    TranslationFault,
    ProtectionViolation,
    InvalidAddress,
    PageFault,
    PrivilegeViolation,
    AlignmentFault,
    BusError,
    HardwareFault,
    TimeoutError,
    ResourceExhaustion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    None,
    Retry,
    InvalidateEntry,
    FlushTlb,
    ResetPipeline,
    EscalateException,
    SystemHalt,
}

fn classify(kind: FaultKind) -> (Severity, RecoveryAction) {
    use FaultKind::*;
    use RecoveryAction::*;
    use Severity::*;
    match kind {
        TranslationFault => (Warning, Retry),
        ProtectionViolation => (Error, EscalateException),
        InvalidAddress => (Error, EscalateException),
        PageFault => (Info, Retry),
        PrivilegeViolation => (Error, EscalateException),
        AlignmentFault => (Warning, EscalateException),
        BusError => (Critical, ResetPipeline),
        HardwareFault => (Fatal, SystemHalt),
        TimeoutError => (Warning, InvalidateEntry),
        ResourceExhaustion => (Critical, FlushTlb),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FaultRecord {
    pub kind: FaultKind,
    pub severity: Severity,
    pub action: RecoveryAction,
    pub address: u64,
    pub at: Instant,
}

struct History {
    ring: VecDeque<FaultRecord>,
    capacity: usize,
}

impl History {
    fn new(capacity: usize) -> Self {
        Self {
            ring: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, record: FaultRecord) {
        if self.ring.len() == self.capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(record);
    }
}

/// Classifies faults, tracks burst/rate state, and recommends recovery
/// actions. Does not itself perform recovery; callers act on the returned
/// [`RecoveryAction`].
pub struct ErrorHandler {
    history: Mutex<History>,
    burst_threshold: u32,
    burst_window: Duration,
    fault_rate_threshold: f64,
    monitoring_interval: Duration,
    emergency: std::sync::atomic::AtomicBool,
    last_rate_check: Mutex<Instant>,
}

impl ErrorHandler {
    pub fn new(
        history_size: usize,
        burst_threshold: u32,
        burst_window_ms: u64,
        fault_rate_threshold: f64,
        monitoring_interval_ms: u64,
    ) -> Self {
        Self {
            history: Mutex::new(History::new(history_size)),
            burst_threshold,
            burst_window: Duration::from_millis(burst_window_ms),
            fault_rate_threshold,
            monitoring_interval: Duration::from_millis(monitoring_interval_ms),
            emergency: std::sync::atomic::AtomicBool::new(false),
            last_rate_check: Mutex::new(Instant::now()),
        }
    }

    /// Record a fault, classify it, and return the recommended action.
    /// Enters emergency mode if this push crosses the burst threshold
    /// within `burst_window`.
    pub fn report(&self, kind: FaultKind, address: u64) -> (Severity, RecoveryAction) {
        let (severity, mut action) = classify(kind);
        let record = FaultRecord {
            kind,
            severity,
            action,
            address,
            at: Instant::now(),
        };

        let mut history = self.history.lock().unwrap();
        history.push(record);
        let now = record.at;
        let recent = history
            .ring
            .iter()
            .rev()
            .take_while(|r| now.duration_since(r.at) <= self.burst_window)
            .count();
        drop(history);

        if recent as u32 >= self.burst_threshold {
            self.emergency.store(true, std::sync::atomic::Ordering::SeqCst);
            error!(
                "fault burst detected: {} faults within {:?}, entering emergency mode",
                recent, self.burst_window
            );
            action = RecoveryAction::SystemHalt.max_of(action);
        } else if self.in_emergency() {
            // Standing emergency-mode policy: critical-or-worse faults halt
            // outright, everything else forces a TLB flush.
            action = if severity >= Severity::Critical {
                RecoveryAction::SystemHalt
            } else {
                RecoveryAction::FlushTlb
            };
            warn!(
                "fault {:?} at {:#x} remapped to {:?} while in emergency mode",
                kind, address, action
            );
        } else if severity >= Severity::Error {
            warn!("translation fault {:?} at {:#x}: {:?}", kind, address, action);
        }

        (severity, action)
    }

    pub fn in_emergency(&self) -> bool {
        self.emergency.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn clear_emergency(&self) {
        self.emergency.store(false, std::sync::atomic::Ordering::SeqCst);
    }

    /// If `monitoring_interval` has elapsed since the last check, compute
    /// the fraction of faults (of any kind) among recorded history entries
    /// and compare against `fault_rate_threshold`. Returns `Some(rate)`
    /// when a check actually ran.
    pub fn maybe_check_fault_rate(&self, total_translations: u64) -> Option<f64> {
        let mut last = self.last_rate_check.lock().unwrap();
        if last.elapsed() < self.monitoring_interval {
            return None;
        }
        *last = Instant::now();
        drop(last);

        let history = self.history.lock().unwrap();
        let fault_count = history.ring.len() as u64;
        drop(history);

        let rate = if total_translations == 0 {
            0.0
        } else {
            fault_count as f64 / total_translations as f64
        };
        if rate > self.fault_rate_threshold {
            warn!(
                "sustained fault rate {:.4} exceeds threshold {:.4}",
                rate, self.fault_rate_threshold
            );
        }
        Some(rate)
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().unwrap().ring.len()
    }
}

impl RecoveryAction {
    /// Escalate to the more severe of two actions, ranked by the order
    /// declared on the enum.
    fn max_of(self, other: Self) -> Self {
        let rank = |a: &RecoveryAction| match a {
            RecoveryAction::None => 0,
            RecoveryAction::Retry => 1,
            RecoveryAction::InvalidateEntry => 2,
            RecoveryAction::FlushTlb => 3,
            RecoveryAction::ResetPipeline => 4,
            RecoveryAction::EscalateException => 5,
            RecoveryAction::SystemHalt => 6,
        };
        if rank(&self) >= rank(&other) {
            self
        } else {
            other
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_matches_severity_table() {
        let handler = ErrorHandler::new(256, 10, 1_000, 0.1, 5_000);
        let (sev, action) = handler.report(FaultKind::HardwareFault, 0x1000);
        assert_eq!(sev, Severity::Fatal);
        assert_eq!(action, RecoveryAction::SystemHalt);
    }

    #[test]
    fn burst_triggers_emergency_mode() {
        let handler = ErrorHandler::new(256, 3, 1_000, 0.1, 5_000);
        assert!(!handler.in_emergency());
        for _ in 0..3 {
            handler.report(FaultKind::TranslationFault, 0x1000);
        }
        assert!(handler.in_emergency());
    }

    /// Scenario 6: 10 TranslationFaults within 500ms tips the handler into
    /// emergency mode on the 10th, and a subsequent HardwareFault selects
    /// SystemHalt regardless of its own table entry.
    #[test]
    fn scenario_burst_to_emergency_then_hardware_fault_halts() {
        let handler = ErrorHandler::new(256, 10, 500, 0.1, 5_000);
        for i in 0..9 {
            let (_, action) = handler.report(FaultKind::TranslationFault, 0x1000 + i);
            assert!(!handler.in_emergency(), "should not enter emergency before the 10th fault");
            assert_eq!(action, RecoveryAction::Retry);
        }
        let (_, action) = handler.report(FaultKind::TranslationFault, 0x2000);
        assert!(handler.in_emergency());
        assert_eq!(action, RecoveryAction::SystemHalt);

        let (severity, action) = handler.report(FaultKind::HardwareFault, 0x3000);
        assert_eq!(severity, Severity::Fatal);
        assert_eq!(action, RecoveryAction::SystemHalt);
    }

    #[test]
    fn history_ring_is_bounded() {
        let handler = ErrorHandler::new(4, 100, 1_000, 0.1, 5_000);
        for i in 0..10 {
            handler.report(FaultKind::PageFault, i);
        }
        assert_eq!(handler.history_len(), 4);
    }

    #[test]
    fn fault_rate_check_respects_interval() {
        let handler = ErrorHandler::new(256, 100, 1_000, 0.1, 0);
        handler.report(FaultKind::PageFault, 0);
        assert!(handler.maybe_check_fault_rate(10).is_some());
    }

    #[test]
    fn emergency_mode_remaps_every_subsequent_report() {
        let handler = ErrorHandler::new(256, 3, 10, 0.1, 5_000);
        for _ in 0..3 {
            handler.report(FaultKind::TranslationFault, 0x1000);
        }
        assert!(handler.in_emergency());

        // Past the burst window, so this report no longer crosses the burst
        // threshold on its own -- emergency mode is a separate latch that
        // stays set regardless.
        std::thread::sleep(Duration::from_millis(20));

        // Non-critical fault reported after emergency latches: must flush,
        // not just whatever its own (kind, severity) table entry says.
        let (_, action) = handler.report(FaultKind::TranslationFault, 0x2000);
        assert_eq!(action, RecoveryAction::FlushTlb);

        // Critical-or-worse fault reported while still in emergency mode:
        // must halt.
        let (_, action) = handler.report(FaultKind::BusError, 0x3000);
        assert_eq!(action, RecoveryAction::SystemHalt);
    }

    proptest::proptest! {
        /// P6: emergency mode is entered exactly once N reports within the
        /// burst window reach `burst_threshold`, not before.
        #[test]
        fn emergency_mode_triggers_at_threshold(threshold in 2u32..20) {
            let handler = ErrorHandler::new(256, threshold, 60_000, 0.1, 5_000);
            for _ in 0..(threshold - 1) {
                handler.report(FaultKind::TranslationFault, 0x1000);
            }
            prop_assert!(!handler.in_emergency());
            handler.report(FaultKind::TranslationFault, 0x1000);
            prop_assert!(handler.in_emergency());
        }
    }
}
