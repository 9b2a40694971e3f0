//! VMX debugger event engine
//!
//! Event lifecycle and protected trap-resource arbitration for a VMX based
//! kernel debugger. Independently registered debugging events share a small
//! set of per-core trap controls (exception bitmap, external-interrupt
//! exiting, RDTSC exiting, MOV-DR exiting, control-register exiting); this
//! crate reference-counts them, honours hypervisor-internal holds, and keeps
//! every core consistent while traps keep firing.
//!
//! # Features
//!
//! - `harness` - Remote test-harness handshake (default)
//! - `vmx` - Trap toggles on the current VMCS (x86_64 only)
//! - `axhal` - Real current-CPU lookup
//!
//! # Quick Start
//!
//! ```ignore
//! use vmxdbg_events::{ActionType, CallingStage, Config, EventKind};
//!
//! // Install the engine (call once, after the hypervisor is up)
//! let engine = vmxdbg_events::init(Config::new(cores), ops)?;
//! engine.enable_debugger();
//!
//! // Watch RDTSC on every core
//! let tag = engine.register_event(
//!     EventKind::TscInstructionExecution,
//!     [ActionType::BreakToDebugger].into_iter().collect(),
//!     CallingStage::PreEventEmulation,
//! )?;
//! engine.enable_event(tag)?;
//!
//! // From the exit handler
//! let outcome = engine.trigger_current(EventKind::TscInstructionExecution, CallingStage::PreEventEmulation);
//! ```

#![no_std]

extern crate alloc;

#[macro_use]
extern crate log;

use alloc::sync::Arc;

use spin::Mutex;

// =============================================================================
// Platform Abstraction (for testing support)
// =============================================================================

pub mod platform;

#[cfg(all(feature = "vmx", target_arch = "x86_64"))]
pub mod vmx;

// =============================================================================
// Engine
// =============================================================================

pub mod arbiter;
pub mod breakpoint;
pub mod broadcast;
pub mod config;
pub mod engine;
pub mod event;
pub mod registry;
pub mod resource;
pub mod short_circuit;
pub mod status;

#[cfg(feature = "harness")]
pub mod harness;

// Re-export key types for convenience
pub use arbiter::ResourceArbiter;
pub use breakpoint::{
    APPLY_TO_ALL_BREAKPOINTS, Breakpoint, BreakpointModification, BreakpointPacket, DebuggeeLink,
};
pub use broadcast::{BroadcastOptions, CoreAction, CoreRequest};
pub use config::Config;
pub use engine::{DebuggerEngine, ModifyAction, ModifyRequest, RequestState, TriggerOutcome};
pub use event::{
    APPLY_TO_ALL_TAG, ActionSet, ActionType, CallingStage, Event, EventHandle, EventInfo,
    EventKind, Tag,
};
pub use platform::{MockVmx, VmxOps};
pub use resource::{PassingOver, ResourceKind, ResourceSnapshot};
pub use short_circuit::ShortCircuitRequest;
pub use status::{Error, OPERATION_SUCCESSFUL, TriggeringStatus};

// =============================================================================
// Initialization
// =============================================================================

static ENGINE: Mutex<Option<Arc<DebuggerEngine>>> = Mutex::new(None);

/// Install the process-wide engine.
///
/// Replaces nothing: fails with `InvalidConfig` if an engine is already
/// installed. Call [`shutdown`] first to reinstall.
pub fn init(config: Config, ops: Arc<dyn VmxOps>) -> Result<Arc<DebuggerEngine>, Error> {
    info!("Initializing vmxdbg-events...");

    let mut slot = ENGINE.lock();
    if slot.is_some() {
        warn!("  - engine already installed");
        return Err(Error::InvalidConfig("engine already installed"));
    }

    let engine = Arc::new(DebuggerEngine::new(config, ops)?);
    info!("  - {} cores", engine.config().core_count);
    info!("  - exception mask {:#010x}", engine.config().exception_mask);
    #[cfg(feature = "harness")]
    info!("  - test harness enabled");

    *slot = Some(engine.clone());
    info!("vmxdbg-events initialization complete");
    Ok(engine)
}

/// The installed engine, if any.
pub fn engine() -> Option<Arc<DebuggerEngine>> {
    ENGINE.lock().clone()
}

/// Clear every event and breakpoint and uninstall the engine.
pub fn shutdown() -> Result<(), Error> {
    let Some(engine) = ENGINE.lock().take() else {
        return Ok(());
    };

    info!("Shutting down vmxdbg-events...");
    let result = engine.teardown();
    match &result {
        Ok(()) => info!("vmxdbg-events shut down"),
        Err(e) => error!("  - teardown incomplete: {}", e),
    }
    result
}
