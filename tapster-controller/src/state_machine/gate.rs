use std::sync::atomic::{AtomicBool, Ordering};

/// Admission flag for outside triggers.
///
/// The control task opens the gate while the machine sits idle and waits.
/// A trigger source claims it before requesting a pick, so a trigger that
/// arrives while a cycle runs is dropped instead of queued.
#[derive(Debug)]
pub struct TriggerGate {
    open: AtomicBool,
}

impl TriggerGate {
    pub const fn new() -> Self {
        Self {
            open: AtomicBool::new(false),
        }
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::Release);
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Closes the gate, true only for the one caller that found it open
    pub fn try_claim(&self) -> bool {
        self.open
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for TriggerGate {
    fn default() -> Self {
        Self::new()
    }
}
