//! Debugger engine: event registry, modify-request dispatcher and trap-time
//! evaluation entry, wired to the arbitrator and the broadcast coordinator.
//!
//! # Example
//!
//! ```ignore
//! use vmxdbg_events::{Config, DebuggerEngine, ModifyAction, ModifyRequest};
//!
//! let engine = DebuggerEngine::new(Config::new(4), ops)?;
//! engine.enable_debugger();
//!
//! let tag = engine.register_event(kind, actions, stage)?;
//! let mut req = ModifyRequest::new(tag, ModifyAction::Enable);
//! engine.modify(&mut req)?;
//! ```

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::{Mutex, RwLock};

use crate::arbiter::ResourceArbiter;
use crate::breakpoint::BreakpointTable;
use crate::broadcast::{BroadcastCoordinator, CoreAction, CoreRequest};
use crate::config::Config;
use crate::event::{APPLY_TO_ALL_TAG, ActionSet, CallingStage, Event, EventInfo, EventKind, Tag};
use crate::platform::{self, VmxOps};
use crate::registry::EventRegistry;
use crate::resource::{PassingOver, ResourceKind};
use crate::short_circuit::{ShortCircuit, ShortCircuitRequest};
use crate::status::{Error, OPERATION_SUCCESSFUL, TriggeringStatus};

/// Registry read attempts a trap makes before giving up on a busy writer.
const TRIGGER_READ_ATTEMPTS: usize = 64;

/// Operation named by a modify request.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyAction {
    QueryState = 0,
    Enable = 1,
    Disable = 2,
    Clear = 3,
}

impl TryFrom<u32> for ModifyAction {
    type Error = Error;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::QueryState),
            1 => Ok(Self::Enable),
            2 => Ok(Self::Disable),
            3 => Ok(Self::Clear),
            _ => Err(Error::InvalidModifyAction(code)),
        }
    }
}

/// Modify-events request. `kernel_status` and `is_enabled` are outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModifyRequest {
    pub tag: Tag,
    pub kernel_status: u64,
    pub action: ModifyAction,
    pub is_enabled: bool,
}

impl ModifyRequest {
    pub fn new(tag: Tag, action: ModifyAction) -> Self {
        Self {
            tag,
            kernel_status: 0,
            action,
            is_enabled: false,
        }
    }

    /// Target every registered event.
    pub fn all(action: ModifyAction) -> Self {
        Self::new(APPLY_TO_ALL_TAG, action)
    }
}

/// Stages a modify request goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    Resolving,
    Applying,
    Completed,
    Failed,
}

/// Result of evaluating one trap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerOutcome {
    pub status: TriggeringStatus,
    /// Events that fired, in registration order.
    pub matched: Vec<(Tag, ActionSet)>,
}

impl TriggerOutcome {
    fn bare(status: TriggeringStatus) -> Self {
        Self {
            status,
            matched: Vec::new(),
        }
    }
}

fn status_word(result: &Result<(), Error>) -> u64 {
    match result {
        Ok(()) => OPERATION_SUCCESSFUL,
        Err(e) => e.kernel_status(),
    }
}

/// The event lifecycle and resource arbitration subsystem.
pub struct DebuggerEngine {
    config: Config,
    ops: Arc<dyn VmxOps>,
    arbiter: ResourceArbiter,
    registry: RwLock<EventRegistry>,
    short_circuit: ShortCircuit,
    pub(crate) breakpoints: Mutex<BreakpointTable>,
    active: AtomicBool,
    /// Serializes modify requests; never taken on the trap path.
    pub(crate) control: Mutex<()>,
}

impl DebuggerEngine {
    /// Build an engine over `ops`. The debugger starts inactive.
    pub fn new(config: Config, ops: Arc<dyn VmxOps>) -> Result<Self, Error> {
        config.validate()?;
        if config.core_count > ops.core_count() {
            return Err(Error::InvalidConfig("more cores configured than the platform has"));
        }

        log::info!(
            "engine: {} cores, up to {} events",
            config.core_count,
            config.max_events
        );
        Ok(Self {
            arbiter: ResourceArbiter::with_capacity(
                config.core_count,
                config.max_events,
                ops.clone(),
            ),
            registry: RwLock::new(EventRegistry::new(config.max_events)),
            short_circuit: ShortCircuit::new(),
            breakpoints: Mutex::new(BreakpointTable::new()),
            active: AtomicBool::new(false),
            control: Mutex::new(()),
            config,
            ops,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Read access to the resource table.
    pub fn arbiter(&self) -> &ResourceArbiter {
        &self.arbiter
    }

    pub(crate) fn coordinator(&self) -> BroadcastCoordinator<'_> {
        BroadcastCoordinator::new(&self.arbiter, self.ops.as_ref())
    }

    // =========================================================================
    // Debugger activity
    // =========================================================================

    pub fn enable_debugger(&self) {
        if !self.active.swap(true, Ordering::SeqCst) {
            log::info!("engine: debugger enabled");
        }
    }

    pub fn disable_debugger(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            log::info!("engine: debugger disabled");
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    // =========================================================================
    // Registry
    // =========================================================================

    /// Register a new event. It starts disabled.
    pub fn register_event(
        &self,
        kind: EventKind,
        actions: ActionSet,
        stage: CallingStage,
    ) -> Result<Tag, Error> {
        self.registry.write().register(kind, actions, stage)
    }

    /// Register an event from a wire kind code.
    pub fn register_event_raw(
        &self,
        code: u32,
        actions: ActionSet,
        stage: CallingStage,
    ) -> Result<Tag, Error> {
        self.registry.write().register_raw(code, actions, stage)
    }

    pub fn lookup(&self, tag: Tag) -> Result<Event, Error> {
        self.registry.read().lookup(tag).cloned()
    }

    pub fn all_tags(&self) -> Vec<Tag> {
        self.registry.read().all_tags()
    }

    pub fn list_events(&self) -> Vec<EventInfo> {
        self.registry.read().list()
    }

    /// Whether `tag` currently holds its resources on `core`.
    pub fn is_applied_on(&self, core: usize, tag: Tag) -> bool {
        match self.registry.read().lookup(tag) {
            Ok(event) => self.arbiter.holds(core, event.slot),
            Err(_) => false,
        }
    }

    // =========================================================================
    // Modify-request dispatcher
    // =========================================================================

    fn transition(&self, tag: Tag, state: &mut RequestState, next: RequestState) {
        log::debug!("modify {:#x}: {:?} -> {:?}", tag, state, next);
        *state = next;
    }

    /// Serve a modify request, filling `kernel_status` and `is_enabled`.
    pub fn modify(&self, request: &mut ModifyRequest) -> Result<(), Error> {
        let _control = self.control.lock();
        let mut state = RequestState::Received;

        let result = self.run_modify(request, &mut state);
        let next = if result.is_ok() {
            RequestState::Completed
        } else {
            RequestState::Failed
        };
        self.transition(request.tag, &mut state, next);

        request.kernel_status = status_word(&result);
        if let Err(e) = &result {
            log::warn!("modify {:#x} ({:?}) failed: {}", request.tag, request.action, e);
        }
        result
    }

    fn run_modify(&self, request: &mut ModifyRequest, state: &mut RequestState) -> Result<(), Error> {
        if !self.is_active() {
            return Err(Error::DebuggerNotEnabled);
        }

        self.transition(request.tag, state, RequestState::Resolving);
        let targets = self.resolve(request.tag)?;

        self.transition(request.tag, state, RequestState::Applying);
        if request.action == ModifyAction::QueryState {
            let registry = self.registry.read();
            let mut all_enabled = !targets.is_empty();
            for tag in &targets {
                all_enabled &= registry.lookup(*tag)?.enabled;
            }
            request.is_enabled = all_enabled;
            return Ok(());
        }

        let result = self.apply_to_targets(&targets, request.action);
        request.is_enabled = request.action == ModifyAction::Enable && result.is_ok();
        result
    }

    /// One tag, or a snapshot of every tag for the sentinel.
    fn resolve(&self, tag: Tag) -> Result<Vec<Tag>, Error> {
        let registry = self.registry.read();
        if tag == APPLY_TO_ALL_TAG {
            return Ok(registry.all_tags());
        }
        registry.lookup(tag)?;
        Ok(alloc::vec![tag])
    }

    /// Apply `action` to each target; the first failure is reported after
    /// every target was attempted.
    fn apply_to_targets(&self, targets: &[Tag], action: ModifyAction) -> Result<(), Error> {
        let mut first_failure = None;

        for &tag in targets {
            let result = match action {
                ModifyAction::Enable => self.set_event_state(tag, true),
                ModifyAction::Disable => self.set_event_state(tag, false),
                ModifyAction::Clear => self.clear_event(tag),
                ModifyAction::QueryState => Ok(()),
            };
            if let Err(e) = result {
                if first_failure.is_none() {
                    first_failure = Some(e);
                }
            }
        }

        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Broadcast the event's resource demand (or its withdrawal) to every
    /// core. Delivery is idempotent per core, so repeating a request never
    /// moves the counts twice.
    fn set_event_state(&self, tag: Tag, enable: bool) -> Result<(), Error> {
        let handle = self.registry.read().lookup(tag)?.handle();
        let action = if enable {
            CoreAction::ApplyEvent(handle)
        } else {
            CoreAction::UnapplyEvent(handle)
        };

        let result = self.coordinator().broadcast(&CoreRequest::new(action));

        let mut registry = self.registry.write();
        let event = registry.lookup_mut(tag)?;
        if result.is_ok() {
            event.enabled = enable;
        }
        event.kernel_status = status_word(&result);
        log::debug!(
            "event {:#x} {} ({})",
            tag,
            if enable { "enabled" } else { "disabled" },
            if result.is_ok() { "ok" } else { "partial" }
        );
        result
    }

    /// Release every resource of the event, then delete it.
    fn clear_event(&self, tag: Tag) -> Result<(), Error> {
        self.set_event_state(tag, false)?;
        let slot = self.registry.read().lookup(tag)?.slot;
        let still_held = self.arbiter.held_anywhere(slot);
        self.registry.write().remove(tag, still_held).map(|_| ())
    }

    pub fn enable_event(&self, tag: Tag) -> Result<(), Error> {
        self.modify(&mut ModifyRequest::new(tag, ModifyAction::Enable))
    }

    pub fn disable_event(&self, tag: Tag) -> Result<(), Error> {
        self.modify(&mut ModifyRequest::new(tag, ModifyAction::Disable))
    }

    pub fn remove_event(&self, tag: Tag) -> Result<(), Error> {
        self.modify(&mut ModifyRequest::new(tag, ModifyAction::Clear))
    }

    pub fn query_event(&self, tag: Tag) -> Result<bool, Error> {
        let mut request = ModifyRequest::new(tag, ModifyAction::QueryState);
        self.modify(&mut request)?;
        Ok(request.is_enabled)
    }

    // =========================================================================
    // Hypervisor-internal demand
    // =========================================================================

    /// Broadcast an arbitrary core request.
    pub fn broadcast(&self, request: &CoreRequest) -> Result<(), Error> {
        let _control = self.control.lock();
        self.coordinator().broadcast(request)
    }

    /// Hold `resource` on every core for `reason`.
    pub fn set_passing_over(&self, resource: ResourceKind, reason: PassingOver) -> Result<(), Error> {
        self.broadcast(&CoreRequest::new(CoreAction::SetPassingOver { resource, reason }))
    }

    /// Drop `reason` on every core.
    pub fn clear_passing_over(
        &self,
        resource: ResourceKind,
        reason: PassingOver,
    ) -> Result<(), Error> {
        self.broadcast(&CoreRequest::new(CoreAction::ClearPassingOver { resource, reason }))
    }

    // =========================================================================
    // Short-circuiting
    // =========================================================================

    pub fn set_short_circuit(&self, active: bool) {
        self.short_circuit.set(active);
    }

    pub fn get_short_circuit(&self) -> (bool, u64) {
        self.short_circuit.get()
    }

    pub fn handle_short_circuit(&self, request: &mut ShortCircuitRequest) {
        self.short_circuit.handle(request);
    }

    // =========================================================================
    // Trap-time evaluation
    // =========================================================================

    /// Evaluate a trap of `kind` on `core`.
    ///
    /// Never blocks. Per-core membership is read from atomics, and the
    /// registry is only tried a bounded number of times: writers hold it for
    /// short bookkeeping, but a trap raised on the core of such a writer
    /// would otherwise spin forever. When the registry stays busy the trap
    /// is reported as successful with nothing matched.
    pub fn trigger(&self, core: usize, kind: EventKind, stage: CallingStage) -> TriggerOutcome {
        if !self.is_active() {
            return TriggerOutcome::bare(TriggeringStatus::DebuggerNotEnabled);
        }
        if self.short_circuit.is_active() {
            return TriggerOutcome::bare(TriggeringStatus::SuccessfulIgnoreEvent);
        }

        let mut registry = None;
        for _ in 0..TRIGGER_READ_ATTEMPTS {
            registry = self.registry.try_read();
            if registry.is_some() {
                break;
            }
            core::hint::spin_loop();
        }
        let Some(registry) = registry else {
            log::trace!("trigger: registry busy on core {}, {:?} skipped", core, kind);
            return TriggerOutcome::bare(TriggeringStatus::Successful);
        };

        let matched = registry
            .iter()
            .filter(|e| e.enabled && e.kind == kind && e.stage == stage)
            .filter(|e| self.arbiter.holds(core, e.slot))
            .map(|e| (e.tag, e.actions.clone()))
            .collect();

        TriggerOutcome {
            status: TriggeringStatus::Successful,
            matched,
        }
    }

    /// Evaluate a trap given its wire kind code.
    pub fn trigger_raw(&self, core: usize, code: u32, stage: CallingStage) -> TriggerOutcome {
        match EventKind::try_from(code) {
            Ok(kind) => self.trigger(core, kind, stage),
            Err(_) => TriggerOutcome::bare(TriggeringStatus::InvalidEventType),
        }
    }

    /// Evaluate a trap on the calling core.
    pub fn trigger_current(&self, kind: EventKind, stage: CallingStage) -> TriggerOutcome {
        self.trigger(platform::cpu_id() as usize, kind, stage)
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Clear every event and breakpoint, drop every passing-over reason and
    /// deactivate the debugger.
    ///
    /// Fails with the first error met, or with [`Error::ResourceStillOn`] for
    /// the first resource still counted, reserved or switched on afterwards.
    /// The debugger is inactive either way.
    pub fn teardown(&self) -> Result<(), Error> {
        let _control = self.control.lock();
        log::info!("engine: tearing down");

        let tags = self.registry.read().all_tags();
        let mut result = self.apply_to_targets(&tags, ModifyAction::Clear);

        if let Err(e) = self.drop_all_breakpoints() {
            result = result.and(Err(e));
        }

        for resource in ResourceKind::ALL {
            let request = CoreRequest::new(CoreAction::ClearPassingOver {
                resource,
                reason: PassingOver::all(),
            });
            if let Err(e) = self.coordinator().broadcast(&request) {
                result = result.and(Err(e));
            }
        }

        self.short_circuit.set(false);
        self.active.store(false, Ordering::SeqCst);

        for core in 0..self.arbiter.core_count() {
            for resource in ResourceKind::ALL {
                let still_on = self.arbiter.refcount(core, resource) != 0
                    || !self.arbiter.passing_over(core, resource).is_empty()
                    || self.arbiter.is_enabled(core, resource);
                if still_on {
                    log::error!(
                        "engine: {} still on for core {} after teardown",
                        resource.label(),
                        core
                    );
                    result = result.and(Err(Error::ResourceStillOn { core, resource }));
                }
            }
        }
        result
    }
}
