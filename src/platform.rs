//! Platform abstraction layer for the hypervisor side.
//!
//! This module abstracts the two things the engine needs from the platform:
//! delivering work to a given core and flipping trap controls on it. The mock
//! backend keeps everything in memory so the engine can be tested in user
//! space.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use axerrno::AxResult;

use crate::resource::ResourceKind;

/// Hypervisor operations used by the engine.
pub trait VmxOps: Send + Sync {
    /// Number of virtual processors.
    fn core_count(&self) -> usize;

    /// Run `f` on `core` and return once it finished there.
    ///
    /// Implementations signal the core (IPI/NMI or DPC) and block until it
    /// acknowledges. A core that cannot be reached simply never runs `f`.
    fn run_on(&self, core: usize, f: &mut (dyn FnMut() + Send));

    /// Turn a trap control on or off. Called on `core` itself.
    fn set_trap(&self, core: usize, resource: ResourceKind, enabled: bool) -> AxResult;
}

// =============================================================================
// Mock Implementation (test environment or no VMX hardware)
// =============================================================================

/// In-memory backend recording the physical trap state of each core.
pub struct MockVmx {
    /// One bit per `ResourceKind` per core.
    traps: Vec<AtomicU32>,
    failing: Vec<AtomicBool>,
    unresponsive: Vec<AtomicBool>,
    writes: AtomicU64,
}

impl MockVmx {
    pub fn new(cores: usize) -> Self {
        Self {
            traps: (0..cores).map(|_| AtomicU32::new(0)).collect(),
            failing: (0..cores).map(|_| AtomicBool::new(false)).collect(),
            unresponsive: (0..cores).map(|_| AtomicBool::new(false)).collect(),
            writes: AtomicU64::new(0),
        }
    }

    /// Physical state of `resource` on `core`.
    pub fn is_trapping(&self, core: usize, resource: ResourceKind) -> bool {
        self.traps
            .get(core)
            .map(|bits| bits.load(Ordering::Acquire) & (1 << resource.index()) != 0)
            .unwrap_or(false)
    }

    /// Whether any resource is on, on any core.
    pub fn any_trapping(&self) -> bool {
        self.traps.iter().any(|bits| bits.load(Ordering::Acquire) != 0)
    }

    /// Number of `set_trap` calls that reached the hardware.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Make every `set_trap` on `core` fail.
    pub fn fail_core(&self, core: usize, fail: bool) {
        if let Some(flag) = self.failing.get(core) {
            flag.store(fail, Ordering::SeqCst);
        }
    }

    /// Make `core` ignore delivered work.
    pub fn set_unresponsive(&self, core: usize, unresponsive: bool) {
        if let Some(flag) = self.unresponsive.get(core) {
            flag.store(unresponsive, Ordering::SeqCst);
        }
    }
}

impl VmxOps for MockVmx {
    fn core_count(&self) -> usize {
        self.traps.len()
    }

    fn run_on(&self, core: usize, f: &mut (dyn FnMut() + Send)) {
        let reachable = self
            .unresponsive
            .get(core)
            .map(|flag| !flag.load(Ordering::SeqCst))
            .unwrap_or(false);
        if !reachable {
            log::trace!("mock: core {} dropped delivered work", core);
            return;
        }
        f();
    }

    fn set_trap(&self, core: usize, resource: ResourceKind, enabled: bool) -> AxResult {
        let bits = match self.traps.get(core) {
            Some(bits) => bits,
            None => return axerrno::ax_err!(InvalidInput, "no such core"),
        };
        if self.failing[core].load(Ordering::SeqCst) {
            return axerrno::ax_err!(BadState, "mock trap write failure");
        }

        let mask = 1 << resource.index();
        if enabled {
            bits.fetch_or(mask, Ordering::AcqRel);
        } else {
            bits.fetch_and(!mask, Ordering::AcqRel);
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// =============================================================================
// Current CPU
// =============================================================================

/// Mock CPU ID for testing.
static MOCK_CPU_ID: AtomicU64 = AtomicU64::new(0);

/// Set mock CPU ID for testing.
pub fn set_mock_cpu_id(id: u32) {
    MOCK_CPU_ID.store(id as u64, Ordering::Relaxed);
}

/// Get current CPU ID.
#[cfg(all(not(test), feature = "axhal"))]
#[inline]
pub fn cpu_id() -> u32 {
    axhal::percpu::this_cpu_id() as u32
}

/// Get current CPU ID.
#[cfg(any(test, not(feature = "axhal")))]
#[inline]
pub fn cpu_id() -> u32 {
    MOCK_CPU_ID.load(Ordering::Relaxed) as u32
}

// =============================================================================
// Tests
// =============================================================================
