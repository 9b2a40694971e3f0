//! Protected trap resources and their per-core state.
//!
//! A protected resource is a VMCS control that several independent users may
//! need at once. Its state is split in two axes:
//! - a reference count of enabled events that require it, and
//! - a set of [`PassingOver`] reasons held by the hypervisor itself.
//!
//! The physical control is on iff `refcount > 0 || !passing_over.is_empty()`.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bitflags::bitflags;

/// Trap controls shared between events.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    /// Exception bitmap.
    ExceptionBitmap = 0,
    /// Pin-based external-interrupt exiting.
    ExternalInterruptExiting = 1,
    /// RDTSC / RDTSCP exiting.
    RdtscRdtscpExiting = 2,
    /// MOV-DR exiting.
    MovToDebugRegisterExiting = 3,
    /// Control-register (CR0/CR4) access exiting.
    MovControlRegisterExiting = 4,
    /// CR3-load exiting.
    MovToCr3Exiting = 5,
}

impl ResourceKind {
    /// Number of resource kinds.
    pub const COUNT: usize = 6;

    /// Every resource kind, in index order.
    pub const ALL: [ResourceKind; Self::COUNT] = [
        ResourceKind::ExceptionBitmap,
        ResourceKind::ExternalInterruptExiting,
        ResourceKind::RdtscRdtscpExiting,
        ResourceKind::MovToDebugRegisterExiting,
        ResourceKind::MovControlRegisterExiting,
        ResourceKind::MovToCr3Exiting,
    ];

    /// Table index of this resource.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Short label for display.
    pub fn label(self) -> &'static str {
        match self {
            ResourceKind::ExceptionBitmap => "exception-bitmap",
            ResourceKind::ExternalInterruptExiting => "external-interrupt-exiting",
            ResourceKind::RdtscRdtscpExiting => "rdtsc-exiting",
            ResourceKind::MovToDebugRegisterExiting => "mov-dr-exiting",
            ResourceKind::MovControlRegisterExiting => "mov-cr-exiting",
            ResourceKind::MovToCr3Exiting => "mov-cr3-exiting",
        }
    }
}

bitflags! {
    /// Hypervisor-internal reasons keeping a resource on regardless of events.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PassingOver: u32 {
        /// #UD must trap so SYSCALL/SYSRET hooks can be emulated.
        const UD_EXCEPTIONS_FOR_SYSCALL_SYSRET_HOOK = 1 << 0;
        const EXCEPTION_EVENTS = 1 << 1;
        const INTERRUPT_EVENTS = 1 << 2;
        const TSC_EVENTS = 1 << 3;
        const MOV_TO_HW_DEBUG_REGS_EVENTS = 1 << 4;
        const MOV_TO_CONTROL_REGS_EVENTS = 1 << 5;
        /// Software breakpoints need #BP trapping.
        const BREAKPOINTS = 1 << 6;
    }
}

/// State of one resource on one core.
///
/// Fields are atomics so trap handlers can read them without locking; writers
/// are serialized by the owning core table.
#[derive(Debug)]
pub struct ResourceState {
    refcount: AtomicU32,
    passing_over: AtomicU32,
    /// Last value written to the hardware control.
    applied: AtomicBool,
}

impl ResourceState {
    pub const fn new() -> Self {
        Self {
            refcount: AtomicU32::new(0),
            passing_over: AtomicU32::new(0),
            applied: AtomicBool::new(false),
        }
    }

    /// Number of enabled events requiring this resource.
    #[inline]
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Reasons currently held by the hypervisor.
    #[inline]
    pub fn passing_over(&self) -> PassingOver {
        PassingOver::from_bits_truncate(self.passing_over.load(Ordering::Acquire))
    }

    /// Whether the resource should be physically on.
    #[inline]
    pub fn is_demanded(&self) -> bool {
        self.refcount() > 0 || !self.passing_over().is_empty()
    }

    /// Whether the hardware control is currently on.
    #[inline]
    pub fn is_applied(&self) -> bool {
        self.applied.load(Ordering::Acquire)
    }

    pub(crate) fn store_refcount(&self, value: u32) {
        self.refcount.store(value, Ordering::Release);
    }

    pub(crate) fn store_passing_over(&self, value: PassingOver) {
        self.passing_over.store(value.bits(), Ordering::Release);
    }

    pub(crate) fn store_applied(&self, on: bool) {
        self.applied.store(on, Ordering::Release);
    }

    /// Consistent copy for display and tests.
    pub fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            refcount: self.refcount(),
            passing_over: self.passing_over(),
            enabled: self.is_applied(),
        }
    }
}

impl Default for ResourceState {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable view of one [`ResourceState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceSnapshot {
    pub refcount: u32,
    pub passing_over: PassingOver,
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_match_all_table() {
        for (idx, kind) in ResourceKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), idx);
        }
    }

    #[test]
    fn demand_is_or_of_both_axes() {
        let state = ResourceState::new();
        assert!(!state.is_demanded());

        state.store_passing_over(PassingOver::BREAKPOINTS);
        assert!(state.is_demanded());

        state.store_passing_over(PassingOver::empty());
        state.store_refcount(2);
        assert!(state.is_demanded());
    }
}
