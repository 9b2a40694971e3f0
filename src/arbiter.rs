//! Protected resource arbitrator.
//!
//! Owns the resource state table (one [`CoreResources`] per core) and is the
//! only writer of it. Every mutation recomputes the demand of the touched
//! resource and writes the hardware control when the demand flips, so the
//! physical state always equals `refcount > 0 || passing_over != ∅`.
//!
//! Writers on one core are serialized by that core's lock. Trap handlers read
//! the atomics in [`ResourceState`] and the per-core applied bitmap without
//! taking it, so a trap raised while a writer holds the lock on the same core
//! (for instance from inside `set_trap`) never waits on it.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::{Mutex, MutexGuard};

use crate::config::Config;
use crate::event::{EventHandle, EventKind, Tag};
use crate::platform::VmxOps;
use crate::resource::{PassingOver, ResourceKind, ResourceSnapshot, ResourceState};
use crate::status::Error;

/// Writer-side state of one core.
struct CoreLocal {
    /// Events applied on this core.
    applied: BTreeMap<Tag, EventHandle>,
}

/// Resource table of one core.
pub struct CoreResources {
    core: usize,
    states: [ResourceState; ResourceKind::COUNT],
    /// One bit per event slot, mirrors `local.applied`.
    applied_bits: Vec<AtomicU64>,
    local: Mutex<CoreLocal>,
}

impl CoreResources {
    fn new(core: usize, slots: usize) -> Self {
        Self {
            core,
            states: core::array::from_fn(|_| ResourceState::new()),
            applied_bits: (0..slots.div_ceil(64)).map(|_| AtomicU64::new(0)).collect(),
            local: Mutex::new(CoreLocal {
                applied: BTreeMap::new(),
            }),
        }
    }

    #[inline]
    fn state(&self, resource: ResourceKind) -> &ResourceState {
        &self.states[resource.index()]
    }

    fn slot_word(&self, slot: usize) -> Option<(&AtomicU64, u64)> {
        self.applied_bits
            .get(slot / 64)
            .map(|word| (word, 1u64 << (slot % 64)))
    }

    fn is_slot_applied(&self, slot: usize) -> bool {
        self.slot_word(slot)
            .is_some_and(|(word, bit)| word.load(Ordering::Acquire) & bit != 0)
    }

    fn mark_slot(&self, slot: usize, applied: bool) {
        if let Some((word, bit)) = self.slot_word(slot) {
            if applied {
                word.fetch_or(bit, Ordering::Release);
            } else {
                word.fetch_and(!bit, Ordering::Release);
            }
        }
    }
}

/// Arbitrates the protected trap resources of every core.
pub struct ResourceArbiter {
    cores: Vec<CoreResources>,
    slots: usize,
    ops: Arc<dyn VmxOps>,
}

impl ResourceArbiter {
    pub fn new(core_count: usize, ops: Arc<dyn VmxOps>) -> Self {
        Self::with_capacity(core_count, Config::DEFAULT_MAX_EVENTS, ops)
    }

    /// Arbiter able to track events in slots `0..max_events`.
    pub fn with_capacity(core_count: usize, max_events: usize, ops: Arc<dyn VmxOps>) -> Self {
        Self {
            cores: (0..core_count)
                .map(|core| CoreResources::new(core, max_events))
                .collect(),
            slots: max_events,
            ops,
        }
    }

    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    fn core(&self, core: usize) -> Result<&CoreResources, Error> {
        self.cores.get(core).ok_or(Error::CoreUnresponsive(core))
    }

    fn lock(&self, core: usize) -> Result<(&CoreResources, MutexGuard<'_, CoreLocal>), Error> {
        let table = self.core(core)?;
        Ok((table, table.local.lock()))
    }

    // =========================================================================
    // Reads (lock-free)
    // =========================================================================

    pub fn refcount(&self, core: usize, resource: ResourceKind) -> u32 {
        self.cores
            .get(core)
            .map(|t| t.state(resource).refcount())
            .unwrap_or(0)
    }

    pub fn passing_over(&self, core: usize, resource: ResourceKind) -> PassingOver {
        self.cores
            .get(core)
            .map(|t| t.state(resource).passing_over())
            .unwrap_or(PassingOver::empty())
    }

    /// Whether the hardware control is on.
    pub fn is_enabled(&self, core: usize, resource: ResourceKind) -> bool {
        self.cores
            .get(core)
            .map(|t| t.state(resource).is_applied())
            .unwrap_or(false)
    }

    pub fn snapshot(&self, core: usize, resource: ResourceKind) -> Option<ResourceSnapshot> {
        self.cores.get(core).map(|t| t.state(resource).snapshot())
    }

    /// Whether the event in `slot` is applied on `core`. Never blocks.
    pub fn holds(&self, core: usize, slot: usize) -> bool {
        self.cores
            .get(core)
            .is_some_and(|t| t.is_slot_applied(slot))
    }

    /// Whether the event in `slot` is applied on any core.
    pub fn held_anywhere(&self, slot: usize) -> bool {
        self.cores.iter().any(|t| t.is_slot_applied(slot))
    }

    // =========================================================================
    // Single-resource adjustments
    // =========================================================================

    /// Bring the hardware in line with the demand of `resource`.
    fn sync(&self, table: &CoreResources, resource: ResourceKind) -> Result<(), Error> {
        let state = table.state(resource);
        let wanted = state.is_demanded();
        if wanted == state.is_applied() {
            return Ok(());
        }

        if let Err(e) = self.ops.set_trap(table.core, resource, wanted) {
            log::error!(
                "arbiter: core {} failed to turn {} {}: {:?}",
                table.core,
                resource.label(),
                if wanted { "on" } else { "off" },
                e
            );
            return Err(Error::Hardware {
                core: table.core,
                resource,
            });
        }
        state.store_applied(wanted);
        log::debug!(
            "arbiter: core {} {} -> {}",
            table.core,
            resource.label(),
            if wanted { "on" } else { "off" }
        );
        Ok(())
    }

    fn require_locked(
        &self,
        table: &CoreResources,
        resource: ResourceKind,
        tag: Tag,
    ) -> Result<(), Error> {
        let state = table.state(resource);
        let count = state.refcount();
        state.store_refcount(count + 1);
        if let Err(e) = self.sync(table, resource) {
            state.store_refcount(count);
            return Err(e);
        }
        log::trace!(
            "arbiter: core {} {} required by {:#x} (count={})",
            table.core,
            resource.label(),
            tag,
            count + 1
        );
        Ok(())
    }

    fn release_locked(
        &self,
        table: &CoreResources,
        resource: ResourceKind,
        tag: Tag,
    ) -> Result<(), Error> {
        let state = table.state(resource);
        let count = state.refcount();
        if count == 0 {
            log::error!(
                "arbiter: refcount underflow on core {} {} (released by {:#x})",
                table.core,
                resource.label(),
                tag
            );
            return Err(Error::ResourceUnderflow {
                core: table.core,
                resource,
            });
        }

        state.store_refcount(count - 1);
        if let Err(e) = self.sync(table, resource) {
            state.store_refcount(count);
            return Err(e);
        }
        log::trace!(
            "arbiter: core {} {} released by {:#x} (count={})",
            table.core,
            resource.label(),
            tag,
            count - 1
        );
        Ok(())
    }

    fn update_passing_over_locked(
        &self,
        table: &CoreResources,
        resource: ResourceKind,
        reason: PassingOver,
        set: bool,
    ) -> Result<(), Error> {
        let state = table.state(resource);
        let old = state.passing_over();
        let new = if set { old | reason } else { old - reason };
        if new == old {
            return Ok(());
        }

        state.store_passing_over(new);
        if let Err(e) = self.sync(table, resource) {
            state.store_passing_over(old);
            return Err(e);
        }
        Ok(())
    }

    /// Take one reference on `resource` for `tag`; turns it on at 0 -> 1.
    pub fn require(&self, core: usize, resource: ResourceKind, tag: Tag) -> Result<(), Error> {
        let (table, _guard) = self.lock(core)?;
        self.require_locked(table, resource, tag)
    }

    /// Drop one reference on `resource`; turns it off at 1 -> 0 unless a
    /// passing-over reason is held. Releasing at zero is a logic fault.
    pub fn release(&self, core: usize, resource: ResourceKind, tag: Tag) -> Result<(), Error> {
        let (table, _guard) = self.lock(core)?;
        self.release_locked(table, resource, tag)
    }

    /// Hold `resource` on for a hypervisor-internal reason.
    pub fn set_passing_over(
        &self,
        core: usize,
        resource: ResourceKind,
        reason: PassingOver,
    ) -> Result<(), Error> {
        let (table, _guard) = self.lock(core)?;
        self.update_passing_over_locked(table, resource, reason, true)
    }

    /// Drop a hypervisor-internal reason; turns the resource off when nothing
    /// else needs it.
    pub fn clear_passing_over(
        &self,
        core: usize,
        resource: ResourceKind,
        reason: PassingOver,
    ) -> Result<(), Error> {
        let (table, _guard) = self.lock(core)?;
        self.update_passing_over_locked(table, resource, reason, false)
    }

    // =========================================================================
    // Per-event application
    // =========================================================================

    /// Re-evaluate the reservation implied by `kind` after the applied set changed.
    fn refresh_reservation(
        &self,
        table: &CoreResources,
        local: &CoreLocal,
        kind: EventKind,
    ) -> Result<(), Error> {
        let Some((resource, reason)) = kind.reserved_passing_over() else {
            return Ok(());
        };
        let needed = local
            .applied
            .values()
            .any(|h| h.kind.reserved_passing_over() == Some((resource, reason)));
        self.update_passing_over_locked(table, resource, reason, needed)
    }

    /// Apply an event on `core`: require every resource its kind needs.
    ///
    /// Returns `false` when the event was already applied there.
    pub fn apply_event(&self, core: usize, handle: EventHandle) -> Result<bool, Error> {
        let EventHandle { tag, kind, slot } = handle;
        if slot >= self.slots {
            return Err(Error::RegistryFull);
        }
        let (table, mut local) = self.lock(core)?;
        if local.applied.contains_key(&tag) {
            return Ok(false);
        }

        let resources = kind.required_resources();
        for (idx, &resource) in resources.iter().enumerate() {
            if let Err(e) = self.require_locked(table, resource, tag) {
                for &taken in resources[..idx].iter().rev() {
                    let _ = self.release_locked(table, taken, tag);
                }
                return Err(e);
            }
        }

        local.applied.insert(tag, handle);
        if let Err(e) = self.refresh_reservation(table, &local, kind) {
            local.applied.remove(&tag);
            for &taken in resources.iter().rev() {
                let _ = self.release_locked(table, taken, tag);
            }
            return Err(e);
        }
        table.mark_slot(slot, true);
        Ok(true)
    }

    /// Undo [`apply_event`](Self::apply_event) on `core`.
    ///
    /// Returns `false` when the event was not applied there. On failure the
    /// event stays applied with its counts and reservation intact, so a retry
    /// does the whole release again.
    pub fn unapply_event(&self, core: usize, handle: EventHandle) -> Result<bool, Error> {
        let EventHandle { tag, kind, slot } = handle;
        let (table, mut local) = self.lock(core)?;
        let Some(entry) = local.applied.remove(&tag) else {
            return Ok(false);
        };

        if let Err(e) = self.refresh_reservation(table, &local, kind) {
            local.applied.insert(tag, entry);
            return Err(e);
        }

        let resources = kind.required_resources();
        for (idx, &resource) in resources.iter().enumerate() {
            if let Err(e) = self.release_locked(table, resource, tag) {
                for &given in resources[..idx].iter().rev() {
                    let _ = self.require_locked(table, given, tag);
                }
                local.applied.insert(tag, entry);
                let _ = self.refresh_reservation(table, &local, kind);
                return Err(e);
            }
        }

        table.mark_slot(slot, false);
        Ok(true)
    }
}
