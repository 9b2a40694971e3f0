//! Status codes and error types shared by the event engine.
//!
//! Two families of codes leave this crate:
//! - [`TriggeringStatus`], reported by the trap-time evaluation path.
//! - 64-bit kernel status words written back into modify requests and
//!   breakpoint packets. Every [`Error`] has one.

use crate::event::Tag;
use crate::resource::ResourceKind;

/// Kernel status written back when an operation completed.
pub const OPERATION_SUCCESSFUL: u64 = 0xffff_ffff;

/// Base of the error range of kernel status words.
const ERROR_BASE: u64 = 0xc000_0000;

pub const ERROR_INVALID_EVENT_TAG: u64 = ERROR_BASE + 0x01;
pub const ERROR_DEBUGGER_NOT_ENABLED: u64 = ERROR_BASE + 0x02;
pub const ERROR_INVALID_EVENT_KIND: u64 = ERROR_BASE + 0x03;
pub const ERROR_RESOURCE_UNDERFLOW: u64 = ERROR_BASE + 0x04;
pub const ERROR_EVENT_STILL_ACTIVE: u64 = ERROR_BASE + 0x05;
pub const ERROR_REGISTRY_FULL: u64 = ERROR_BASE + 0x06;
pub const ERROR_CORE_UNRESPONSIVE: u64 = ERROR_BASE + 0x07;
pub const ERROR_HARDWARE: u64 = ERROR_BASE + 0x08;
pub const ERROR_NOT_CONNECTED: u64 = ERROR_BASE + 0x09;
pub const ERROR_INVALID_BREAKPOINT_ID: u64 = ERROR_BASE + 0x0a;
pub const ERROR_INVALID_CONFIG: u64 = ERROR_BASE + 0x0b;
pub const ERROR_INVALID_MODIFY_ACTION: u64 = ERROR_BASE + 0x0c;
pub const ERROR_RESOURCE_STILL_ON: u64 = ERROR_BASE + 0x0d;

/// Outcome of evaluating a trap against the registered events.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggeringStatus {
    /// Events were evaluated (or there was nothing to evaluate).
    Successful = 0,
    /// The trap should not be emulated; the outcome was forced.
    SuccessfulIgnoreEvent = 1,
    /// The debugger is not active.
    DebuggerNotEnabled = 2,
    /// The trap named a kind outside the known set.
    InvalidEventType = 3,
}

impl TriggeringStatus {
    /// Same value as [`TriggeringStatus::Successful`]; the two names are one outcome.
    pub const SUCCESSFUL_NO_INITIALIZED: Self = Self::Successful;

    /// Whether a caller may treat this status as a non-error.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Successful | Self::SuccessfulIgnoreEvent)
    }

    /// Decode a raw status value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Successful),
            1 => Some(Self::SuccessfulIgnoreEvent),
            2 => Some(Self::DebuggerNotEnabled),
            3 => Some(Self::InvalidEventType),
            _ => None,
        }
    }
}

/// Errors raised by the registry, the arbitrator and the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No event carries this tag.
    InvalidEventTag(Tag),
    /// A modify request arrived while the debugger is inactive.
    DebuggerNotEnabled,
    /// The event kind code is outside the known set.
    InvalidEventKind(u32),
    /// `release` ran more often than `require` for one (core, resource).
    ResourceUnderflow { core: usize, resource: ResourceKind },
    /// The event still holds resources on at least one core.
    EventStillActive(Tag),
    /// The registry reached its configured capacity.
    RegistryFull,
    /// A core did not acknowledge a broadcast request.
    CoreUnresponsive(usize),
    /// Writing the trap control failed on a core.
    Hardware { core: usize, resource: ResourceKind },
    /// The debuggee link is down.
    NotConnected,
    /// No breakpoint carries this id.
    InvalidBreakpointId(u32),
    /// The engine configuration is unusable.
    InvalidConfig(&'static str),
    /// A modify request named an action code outside the known set.
    InvalidModifyAction(u32),
    /// A resource was still demanded or on after teardown.
    ResourceStillOn { core: usize, resource: ResourceKind },
}

impl Error {
    /// The kernel status word reported for this error.
    pub fn kernel_status(&self) -> u64 {
        match self {
            Self::InvalidEventTag(_) => ERROR_INVALID_EVENT_TAG,
            Self::DebuggerNotEnabled => ERROR_DEBUGGER_NOT_ENABLED,
            Self::InvalidEventKind(_) => ERROR_INVALID_EVENT_KIND,
            Self::ResourceUnderflow { .. } => ERROR_RESOURCE_UNDERFLOW,
            Self::EventStillActive(_) => ERROR_EVENT_STILL_ACTIVE,
            Self::RegistryFull => ERROR_REGISTRY_FULL,
            Self::CoreUnresponsive(_) => ERROR_CORE_UNRESPONSIVE,
            Self::Hardware { .. } => ERROR_HARDWARE,
            Self::NotConnected => ERROR_NOT_CONNECTED,
            Self::InvalidBreakpointId(_) => ERROR_INVALID_BREAKPOINT_ID,
            Self::InvalidConfig(_) => ERROR_INVALID_CONFIG,
            Self::InvalidModifyAction(_) => ERROR_INVALID_MODIFY_ACTION,
            Self::ResourceStillOn { .. } => ERROR_RESOURCE_STILL_ON,
        }
    }

    /// Rebuild an error from a kernel status word received over the wire.
    ///
    /// The payload of the original error does not travel with the status, so
    /// the caller supplies the target it asked about. Returns `Ok(())` for
    /// [`OPERATION_SUCCESSFUL`].
    pub fn from_kernel_status(status: u64, tag: Tag) -> Result<(), Self> {
        let err = match status {
            OPERATION_SUCCESSFUL => return Ok(()),
            ERROR_INVALID_EVENT_TAG => Self::InvalidEventTag(tag),
            ERROR_DEBUGGER_NOT_ENABLED => Self::DebuggerNotEnabled,
            ERROR_INVALID_EVENT_KIND => Self::InvalidEventKind(tag as u32),
            ERROR_EVENT_STILL_ACTIVE => Self::EventStillActive(tag),
            ERROR_REGISTRY_FULL => Self::RegistryFull,
            ERROR_NOT_CONNECTED => Self::NotConnected,
            ERROR_INVALID_BREAKPOINT_ID => Self::InvalidBreakpointId(tag as u32),
            ERROR_INVALID_MODIFY_ACTION => Self::InvalidModifyAction(tag as u32),
            ERROR_RESOURCE_STILL_ON => Self::ResourceStillOn {
                core: 0,
                resource: ResourceKind::ExceptionBitmap,
            },
            ERROR_CORE_UNRESPONSIVE => Self::CoreUnresponsive(0),
            ERROR_RESOURCE_UNDERFLOW => Self::ResourceUnderflow {
                core: 0,
                resource: ResourceKind::ExceptionBitmap,
            },
            ERROR_HARDWARE => Self::Hardware {
                core: 0,
                resource: ResourceKind::ExceptionBitmap,
            },
            _ => Self::InvalidConfig("unknown kernel status"),
        };
        Err(err)
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidEventTag(tag) => write!(f, "Invalid event tag: {:#x}", tag),
            Self::DebuggerNotEnabled => write!(f, "Debugger is not enabled"),
            Self::InvalidEventKind(code) => write!(f, "Invalid event kind: {}", code),
            Self::ResourceUnderflow { core, resource } => write!(
                f,
                "Resource reference count underflow: {:?} on core {}",
                resource, core
            ),
            Self::EventStillActive(tag) => {
                write!(f, "Event {:#x} still holds resources", tag)
            }
            Self::RegistryFull => write!(f, "Event registry is full"),
            Self::CoreUnresponsive(core) => write!(f, "Core {} did not acknowledge", core),
            Self::Hardware { core, resource } => {
                write!(f, "Failed to apply {:?} on core {}", resource, core)
            }
            Self::NotConnected => write!(f, "Debuggee is not connected"),
            Self::InvalidBreakpointId(id) => write!(f, "Invalid breakpoint id: {:#x}", id),
            Self::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            Self::InvalidModifyAction(code) => write!(f, "Invalid modify action: {}", code),
            Self::ResourceStillOn { core, resource } => {
                write!(f, "{:?} still on after teardown on core {}", resource, core)
            }
        }
    }
}

impl core::error::Error for Error {}
