//! Breakpoint list/modify.
//!
//! The debuggee keeps a table of software breakpoints. While at least one is
//! enabled, every core holds the exception bitmap through the
//! [`PassingOver::BREAKPOINTS`] reason. The debugger side only sends a
//! [`BreakpointPacket`] when its link to the debuggee is up.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use axerrno::AxResult;

use crate::broadcast::{CoreAction, CoreRequest};
use crate::engine::DebuggerEngine;
use crate::resource::{PassingOver, ResourceKind};
use crate::status::{Error, OPERATION_SUCCESSFUL};

/// Breakpoint id addressing every breakpoint.
pub const APPLY_TO_ALL_BREAKPOINTS: u32 = 0xffff_ffff;

/// What a breakpoint packet asks for.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointModification {
    List = 0,
    Enable = 1,
    Disable = 2,
    Clear = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Breakpoint {
    pub id: u32,
    pub address: u64,
    pub enabled: bool,
}

/// Packet exchanged between debugger and debuggee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakpointPacket {
    pub breakpoint_id: u32,
    pub request: BreakpointModification,
    /// Filled in by the debuggee.
    pub kernel_status: u64,
}

impl BreakpointPacket {
    pub fn new(breakpoint_id: u32, request: BreakpointModification) -> Self {
        Self {
            breakpoint_id,
            request,
            kernel_status: 0,
        }
    }
}

/// Breakpoints known to the debuggee, keyed by id.
#[derive(Debug, Default)]
pub struct BreakpointTable {
    entries: BTreeMap<u32, Breakpoint>,
    next_id: u32,
}

impl BreakpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an enabled breakpoint and return its id.
    ///
    /// Ids count up and wrap, skipping the apply-to-all sentinel and any id
    /// still in use.
    pub fn add(&mut self, address: u64) -> u32 {
        while self.next_id == APPLY_TO_ALL_BREAKPOINTS || self.entries.contains_key(&self.next_id)
        {
            self.next_id = self.next_id.wrapping_add(1);
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.entries.insert(
            id,
            Breakpoint {
                id,
                address,
                enabled: true,
            },
        );
        id
    }

    pub fn get(&self, id: u32) -> Option<&Breakpoint> {
        self.entries.get(&id)
    }

    pub fn list(&self) -> Vec<Breakpoint> {
        self.entries.values().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn any_enabled(&self) -> bool {
        self.entries.values().any(|bp| bp.enabled)
    }

    /// Apply a modification to one id or to all of them.
    pub fn modify(&mut self, id: u32, request: BreakpointModification) -> Result<(), Error> {
        if id != APPLY_TO_ALL_BREAKPOINTS && !self.entries.contains_key(&id) {
            return Err(Error::InvalidBreakpointId(id));
        }

        match request {
            BreakpointModification::List => {}
            BreakpointModification::Enable | BreakpointModification::Disable => {
                let enabled = request == BreakpointModification::Enable;
                self.entries
                    .values_mut()
                    .filter(|bp| id == APPLY_TO_ALL_BREAKPOINTS || bp.id == id)
                    .for_each(|bp| bp.enabled = enabled);
            }
            BreakpointModification::Clear => {
                if id == APPLY_TO_ALL_BREAKPOINTS {
                    self.entries.clear();
                } else {
                    self.entries.remove(&id);
                }
            }
        }
        Ok(())
    }
}

impl DebuggerEngine {
    /// Install a breakpoint at `address`. It starts enabled.
    pub fn add_breakpoint(&self, address: u64) -> Result<u32, Error> {
        let _control = self.control.lock();
        let id = self.breakpoints.lock().add(address);
        log::info!("breakpoint {:#x} added at {:#x}", id, address);
        self.sync_breakpoint_reservation()?;
        Ok(id)
    }

    pub fn list_breakpoints(&self) -> Vec<Breakpoint> {
        self.breakpoints.lock().list()
    }

    /// Serve a packet from the debugger, writing its status back.
    pub fn handle_breakpoint_packet(&self, packet: &mut BreakpointPacket) -> Result<(), Error> {
        let _control = self.control.lock();
        let modified = self
            .breakpoints
            .lock()
            .modify(packet.breakpoint_id, packet.request);
        let result = modified.and_then(|_| self.sync_breakpoint_reservation());

        packet.kernel_status = match &result {
            Ok(()) => OPERATION_SUCCESSFUL,
            Err(e) => e.kernel_status(),
        };
        if let Err(e) = &result {
            log::warn!(
                "breakpoint {:#x} {:?} failed: {}",
                packet.breakpoint_id,
                packet.request,
                e
            );
        }
        result
    }

    /// Hold or drop the exception bitmap on every core to match the table.
    /// Callers hold the control lock.
    fn sync_breakpoint_reservation(&self) -> Result<(), Error> {
        let needed = self.breakpoints.lock().any_enabled();
        self.coordinator().broadcast(&breakpoint_reservation(needed))
    }

    /// Forget every breakpoint. Callers already hold the control lock.
    pub(crate) fn drop_all_breakpoints(&self) -> Result<(), Error> {
        self.breakpoints.lock().modify(
            APPLY_TO_ALL_BREAKPOINTS,
            BreakpointModification::Clear,
        )?;
        self.coordinator().broadcast(&breakpoint_reservation(false))
    }
}

fn breakpoint_reservation(needed: bool) -> CoreRequest {
    let resource = ResourceKind::ExceptionBitmap;
    let reason = PassingOver::BREAKPOINTS;
    CoreRequest::new(if needed {
        CoreAction::SetPassingOver { resource, reason }
    } else {
        CoreAction::ClearPassingOver { resource, reason }
    })
}

// =============================================================================
// Debugger side
// =============================================================================

/// Connection from the debugger to a debuggee.
pub trait DebuggeeLink {
    fn is_connected(&self) -> bool;

    /// Send `packet` and wait for the debuggee to fill in its status.
    fn send_breakpoint_packet(&mut self, packet: &mut BreakpointPacket) -> AxResult;
}

/// Ask the debuggee to modify breakpoint `id`.
///
/// Nothing is sent unless the link is connected.
pub fn request_breakpoint_modification<L: DebuggeeLink + ?Sized>(
    link: &mut L,
    id: u32,
    request: BreakpointModification,
) -> Result<(), Error> {
    if !link.is_connected() {
        log::warn!("breakpoint {:?} needs a connected debuggee", request);
        return Err(Error::NotConnected);
    }

    let mut packet = BreakpointPacket::new(id, request);
    if let Err(e) = link.send_breakpoint_packet(&mut packet) {
        log::warn!("breakpoint packet not delivered: {:?}", e);
        return Err(Error::NotConnected);
    }
    Error::from_kernel_status(packet.kernel_status, id as u64)
}

/// Parse a breakpoint id argument: `all` or a hex value, `0x` optional.
pub fn parse_breakpoint_id(arg: &str) -> Option<u32> {
    let arg = arg.trim();
    if arg == "all" {
        return Some(APPLY_TO_ALL_BREAKPOINTS);
    }
    let digits = arg
        .strip_prefix("0x")
        .or_else(|| arg.strip_prefix("0X"))
        .unwrap_or(arg);
    u32::from_str_radix(digits, 16).ok()
}
