//! Debugging event descriptors.
//!
//! An event is one registered interest in a class of traps, identified by a
//! 64-bit [`Tag`]. Its [`EventKind`] decides which protected resources it
//! needs while enabled.

use alloc::vec::Vec;

use crate::resource::{PassingOver, ResourceKind};
use crate::status::Error;

/// Unique identifier of a registered event.
pub type Tag = u64;

/// Sentinel meaning "every registered event". Never allocated as a tag.
pub const APPLY_TO_ALL_TAG: Tag = u64::MAX;

/// First tag handed out by a fresh registry.
pub const TAG_START_SEED: Tag = 0x100_0000;

/// Category of trap an event listens to.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    HiddenHookReadAndWrite = 0,
    HiddenHookRead = 1,
    HiddenHookWrite = 2,
    HiddenHookExecDetours = 3,
    HiddenHookExecCc = 4,
    SyscallHookEferSyscall = 5,
    SyscallHookEferSysret = 6,
    CpuidInstructionExecution = 7,
    RdmsrInstructionExecution = 8,
    WrmsrInstructionExecution = 9,
    InInstructionExecution = 10,
    OutInstructionExecution = 11,
    ExceptionOccurred = 12,
    ExternalInterruptOccurred = 13,
    DebugRegistersAccessed = 14,
    TscInstructionExecution = 15,
    PmcInstructionExecution = 16,
    VmcallInstructionExecution = 17,
    ControlRegisterModified = 18,
    ControlRegisterRead = 19,
}

impl EventKind {
    /// Protected resources an enabled event of this kind holds on every core.
    pub fn required_resources(self) -> &'static [ResourceKind] {
        use ResourceKind::*;
        match self {
            EventKind::ExceptionOccurred | EventKind::HiddenHookExecCc => &[ExceptionBitmap],
            EventKind::ExternalInterruptOccurred => &[ExternalInterruptExiting],
            EventKind::TscInstructionExecution => &[RdtscRdtscpExiting],
            EventKind::DebugRegistersAccessed => &[MovToDebugRegisterExiting],
            EventKind::ControlRegisterModified | EventKind::ControlRegisterRead => {
                &[MovControlRegisterExiting]
            }
            // EPT violations, MSR/IO bitmaps and unconditional exits.
            EventKind::HiddenHookReadAndWrite
            | EventKind::HiddenHookRead
            | EventKind::HiddenHookWrite
            | EventKind::HiddenHookExecDetours
            | EventKind::SyscallHookEferSyscall
            | EventKind::SyscallHookEferSysret
            | EventKind::CpuidInstructionExecution
            | EventKind::RdmsrInstructionExecution
            | EventKind::WrmsrInstructionExecution
            | EventKind::InInstructionExecution
            | EventKind::OutInstructionExecution
            | EventKind::PmcInstructionExecution
            | EventKind::VmcallInstructionExecution => &[],
        }
    }

    /// Hypervisor-internal reservation implied while such an event is applied.
    ///
    /// SYSCALL/SYSRET hooks clear EFER.SCE and emulate the resulting #UD, so
    /// the exception bitmap must keep trapping whatever the events ask for.
    pub fn reserved_passing_over(self) -> Option<(ResourceKind, PassingOver)> {
        match self {
            EventKind::SyscallHookEferSyscall | EventKind::SyscallHookEferSysret => Some((
                ResourceKind::ExceptionBitmap,
                PassingOver::UD_EXCEPTIONS_FOR_SYSCALL_SYSRET_HOOK,
            )),
            _ => None,
        }
    }

    /// Short label for display.
    pub fn label(self) -> &'static str {
        match self {
            EventKind::HiddenHookReadAndWrite => "monitor-rw",
            EventKind::HiddenHookRead => "monitor-r",
            EventKind::HiddenHookWrite => "monitor-w",
            EventKind::HiddenHookExecDetours => "epthook2",
            EventKind::HiddenHookExecCc => "epthook",
            EventKind::SyscallHookEferSyscall => "syscall",
            EventKind::SyscallHookEferSysret => "sysret",
            EventKind::CpuidInstructionExecution => "cpuid",
            EventKind::RdmsrInstructionExecution => "msrread",
            EventKind::WrmsrInstructionExecution => "msrwrite",
            EventKind::InInstructionExecution => "ioin",
            EventKind::OutInstructionExecution => "ioout",
            EventKind::ExceptionOccurred => "exception",
            EventKind::ExternalInterruptOccurred => "interrupt",
            EventKind::DebugRegistersAccessed => "dr",
            EventKind::TscInstructionExecution => "tsc",
            EventKind::PmcInstructionExecution => "pmc",
            EventKind::VmcallInstructionExecution => "vmcall",
            EventKind::ControlRegisterModified => "crwrite",
            EventKind::ControlRegisterRead => "crread",
        }
    }
}

impl TryFrom<u32> for EventKind {
    type Error = Error;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        let kind = match code {
            0 => EventKind::HiddenHookReadAndWrite,
            1 => EventKind::HiddenHookRead,
            2 => EventKind::HiddenHookWrite,
            3 => EventKind::HiddenHookExecDetours,
            4 => EventKind::HiddenHookExecCc,
            5 => EventKind::SyscallHookEferSyscall,
            6 => EventKind::SyscallHookEferSysret,
            7 => EventKind::CpuidInstructionExecution,
            8 => EventKind::RdmsrInstructionExecution,
            9 => EventKind::WrmsrInstructionExecution,
            10 => EventKind::InInstructionExecution,
            11 => EventKind::OutInstructionExecution,
            12 => EventKind::ExceptionOccurred,
            13 => EventKind::ExternalInterruptOccurred,
            14 => EventKind::DebugRegistersAccessed,
            15 => EventKind::TscInstructionExecution,
            16 => EventKind::PmcInstructionExecution,
            17 => EventKind::VmcallInstructionExecution,
            18 => EventKind::ControlRegisterModified,
            19 => EventKind::ControlRegisterRead,
            _ => return Err(Error::InvalidEventKind(code)),
        };
        Ok(kind)
    }
}

/// What to do when an event fires.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionType {
    BreakToDebugger = 0,
    RunScript = 1,
    RunCustomCode = 2,
}

/// When an event runs relative to the hypervisor's emulation of the trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallingStage {
    PreEventEmulation,
    PostEventEmulation,
}

/// Ordered set of actions: insertion order kept, duplicates dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionSet(Vec<ActionType>);

impl ActionSet {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Append an action unless it is already present.
    pub fn push(&mut self, action: ActionType) -> bool {
        if self.0.contains(&action) {
            return false;
        }
        self.0.push(action);
        true
    }

    pub fn contains(&self, action: ActionType) -> bool {
        self.0.contains(&action)
    }

    pub fn iter(&self) -> impl Iterator<Item = ActionType> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<ActionType> for ActionSet {
    fn from_iter<I: IntoIterator<Item = ActionType>>(iter: I) -> Self {
        let mut set = ActionSet::new();
        for action in iter {
            set.push(action);
        }
        set
    }
}

impl From<&[ActionType]> for ActionSet {
    fn from(actions: &[ActionType]) -> Self {
        actions.iter().copied().collect()
    }
}

/// What a core needs to know to apply or unapply an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHandle {
    pub tag: Tag,
    pub kind: EventKind,
    /// Dense index of the event, below the registry capacity. Reused only
    /// after the event was removed.
    pub slot: usize,
}

/// A registered debugging event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub tag: Tag,
    pub kind: EventKind,
    pub slot: usize,
    pub actions: ActionSet,
    pub stage: CallingStage,
    pub enabled: bool,
    /// Kernel status of the last modification.
    pub kernel_status: u64,
}

impl Event {
    pub(crate) fn new(
        tag: Tag,
        slot: usize,
        kind: EventKind,
        actions: ActionSet,
        stage: CallingStage,
    ) -> Self {
        Self {
            tag,
            kind,
            slot,
            actions,
            stage,
            enabled: false,
            kernel_status: crate::status::OPERATION_SUCCESSFUL,
        }
    }

    pub fn handle(&self) -> EventHandle {
        EventHandle {
            tag: self.tag,
            kind: self.kind,
            slot: self.slot,
        }
    }

    /// Lightweight copy for listing.
    pub fn info(&self) -> EventInfo {
        EventInfo {
            tag: self.tag,
            kind: self.kind,
            stage: self.stage,
            enabled: self.enabled,
            actions: self.actions.len(),
        }
    }
}

/// Display row for one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventInfo {
    pub tag: Tag,
    pub kind: EventKind,
    pub stage: CallingStage,
    pub enabled: bool,
    pub actions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_codes_round_trip() {
        for code in 0..20u32 {
            let kind = EventKind::try_from(code).unwrap();
            assert_eq!(kind as u32, code);
        }
        assert_eq!(EventKind::try_from(20), Err(Error::InvalidEventKind(20)));
    }

    #[test]
    fn exception_events_need_exception_bitmap() {
        assert_eq!(
            EventKind::ExceptionOccurred.required_resources(),
            &[ResourceKind::ExceptionBitmap]
        );
        assert!(EventKind::CpuidInstructionExecution.required_resources().is_empty());
    }

    #[test]
    fn control_register_events_share_cr_exiting() {
        for kind in [EventKind::ControlRegisterModified, EventKind::ControlRegisterRead] {
            assert_eq!(
                kind.required_resources(),
                &[ResourceKind::MovControlRegisterExiting]
            );
        }
    }

    #[test]
    fn syscall_hooks_reserve_ud_trapping() {
        let (resource, reason) = EventKind::SyscallHookEferSysret
            .reserved_passing_over()
            .unwrap();
        assert_eq!(resource, ResourceKind::ExceptionBitmap);
        assert_eq!(reason, PassingOver::UD_EXCEPTIONS_FOR_SYSCALL_SYSRET_HOOK);
        assert!(EventKind::ExceptionOccurred.reserved_passing_over().is_none());
    }

    #[test]
    fn action_set_keeps_order_and_drops_duplicates() {
        let set: ActionSet = [
            ActionType::RunScript,
            ActionType::BreakToDebugger,
            ActionType::RunScript,
        ]
        .into_iter()
        .collect();
        assert_eq!(set.len(), 2);
        let order: Vec<_> = set.iter().collect();
        assert_eq!(order, [ActionType::RunScript, ActionType::BreakToDebugger]);
    }
}
