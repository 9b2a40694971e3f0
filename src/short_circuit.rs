//! Short-circuiting controller.
//!
//! One process-wide switch. While engaged, trap handling skips the registered
//! events entirely and reports a fixed outcome.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::status::OPERATION_SUCCESSFUL;

/// Request/reply shape of the short-circuit switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShortCircuitRequest {
    /// Filled in by the engine.
    pub kernel_status: u64,
    pub is_short_circuiting: bool,
}

impl ShortCircuitRequest {
    pub fn new(is_short_circuiting: bool) -> Self {
        Self {
            kernel_status: 0,
            is_short_circuiting,
        }
    }
}

/// Global short-circuit state.
#[derive(Debug)]
pub struct ShortCircuit {
    active: AtomicBool,
    kernel_status: AtomicU64,
}

impl ShortCircuit {
    pub const fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            kernel_status: AtomicU64::new(OPERATION_SUCCESSFUL),
        }
    }

    /// Engage or release the override.
    pub fn set(&self, active: bool) {
        let was = self.active.swap(active, Ordering::SeqCst);
        self.kernel_status.store(OPERATION_SUCCESSFUL, Ordering::SeqCst);
        if was != active {
            log::info!(
                "short-circuit: {}",
                if active { "engaged" } else { "released" }
            );
        }
    }

    /// Current switch position and the status of the last change.
    pub fn get(&self) -> (bool, u64) {
        (
            self.active.load(Ordering::SeqCst),
            self.kernel_status.load(Ordering::SeqCst),
        )
    }

    /// Trap-path check.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Serve a request in place.
    pub fn handle(&self, request: &mut ShortCircuitRequest) {
        self.set(request.is_short_circuiting);
        let (active, status) = self.get();
        request.is_short_circuiting = active;
        request.kernel_status = status;
    }
}

impl Default for ShortCircuit {
    fn default() -> Self {
        Self::new()
    }
}
