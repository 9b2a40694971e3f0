//! Broadcast coordinator.
//!
//! Fans one [`CoreRequest`] out to every core. Each delivery carries its own
//! one-shot reply channel; the coordinator blocks on [`VmxOps::run_on`] and
//! then reads the reply, so "core N acknowledged" is an explicit step. A core
//! that never ran the request leaves its channel empty and is reported as
//! unresponsive.
//!
//! Aggregation: success only if every core replied success; otherwise the
//! first failing core in index order. Cores that succeeded keep their new
//! state; requests are idempotent per core so a retry converges.

use alloc::sync::Arc;

use spin::Mutex;

use crate::arbiter::ResourceArbiter;
use crate::event::EventHandle;
use crate::platform::VmxOps;
use crate::resource::{PassingOver, ResourceKind};
use crate::status::Error;

/// Four opaque parameters carried with a broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOptions {
    pub optional_param1: u64,
    pub optional_param2: u64,
    pub optional_param3: u64,
    pub optional_param4: u64,
}

/// Work executed on each core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreAction {
    /// Require the resources of an event.
    ApplyEvent(EventHandle),
    /// Release the resources of an event.
    UnapplyEvent(EventHandle),
    SetPassingOver {
        resource: ResourceKind,
        reason: PassingOver,
    },
    ClearPassingOver {
        resource: ResourceKind,
        reason: PassingOver,
    },
}

/// One broadcast message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreRequest {
    pub action: CoreAction,
    pub options: BroadcastOptions,
}

impl CoreRequest {
    pub fn new(action: CoreAction) -> Self {
        Self {
            action,
            options: BroadcastOptions::default(),
        }
    }

    pub fn with_options(mut self, options: BroadcastOptions) -> Self {
        self.options = options;
        self
    }
}

// =============================================================================
// One-shot reply channel
// =============================================================================

struct ReplySender<T>(Arc<Mutex<Option<T>>>);
struct ReplyReceiver<T>(Arc<Mutex<Option<T>>>);

fn reply_channel<T>() -> (ReplySender<T>, ReplyReceiver<T>) {
    let slot = Arc::new(Mutex::new(None));
    (ReplySender(slot.clone()), ReplyReceiver(slot))
}

impl<T> ReplySender<T> {
    fn send(self, value: T) {
        *self.0.lock() = Some(value);
    }
}

impl<T> ReplyReceiver<T> {
    fn try_recv(self) -> Option<T> {
        self.0.lock().take()
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// Execute `request` against the local table of `core`. Runs on that core.
pub fn handle_on_core(
    arbiter: &ResourceArbiter,
    core: usize,
    request: &CoreRequest,
) -> Result<(), Error> {
    log::trace!(
        "broadcast: core {} handling {:?} options={:?}",
        core,
        request.action,
        request.options
    );
    match request.action {
        CoreAction::ApplyEvent(handle) => arbiter.apply_event(core, handle).map(|_| ()),
        CoreAction::UnapplyEvent(handle) => arbiter.unapply_event(core, handle).map(|_| ()),
        CoreAction::SetPassingOver { resource, reason } => {
            arbiter.set_passing_over(core, resource, reason)
        }
        CoreAction::ClearPassingOver { resource, reason } => {
            arbiter.clear_passing_over(core, resource, reason)
        }
    }
}

/// Delivers requests to every core and merges their replies.
pub struct BroadcastCoordinator<'a> {
    arbiter: &'a ResourceArbiter,
    ops: &'a dyn VmxOps,
}

impl<'a> BroadcastCoordinator<'a> {
    pub fn new(arbiter: &'a ResourceArbiter, ops: &'a dyn VmxOps) -> Self {
        Self { arbiter, ops }
    }

    /// Deliver to one core and wait for its acknowledgment.
    pub fn deliver(&self, core: usize, request: &CoreRequest) -> Result<(), Error> {
        let (tx, rx) = reply_channel();
        let arbiter = self.arbiter;
        let mut tx = Some(tx);

        self.ops.run_on(core, &mut || {
            if let Some(tx) = tx.take() {
                tx.send(handle_on_core(arbiter, core, request));
            }
        });

        match rx.try_recv() {
            Some(reply) => reply,
            None => {
                log::warn!("broadcast: core {} did not acknowledge {:?}", core, request.action);
                Err(Error::CoreUnresponsive(core))
            }
        }
    }

    /// Deliver to every core in index order.
    pub fn broadcast(&self, request: &CoreRequest) -> Result<(), Error> {
        let mut first_failure = None;

        for core in 0..self.arbiter.core_count() {
            if let Err(e) = self.deliver(core, request) {
                log::warn!("broadcast: core {} failed: {}", core, e);
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
}
