//! Trap controls on the current VMCS (x86_64 VMX).
//!
//! Every toggle is a read-modify-write of one VMCS control field and must run
//! on the core that owns the loaded VMCS; [`VmxTraps`] is driven through
//! [`VmxOps::run_on`] by the broadcast coordinator.

use core::arch::asm;

use axerrno::AxResult;

use crate::config::Config;
use crate::platform::VmxOps;
use crate::resource::ResourceKind;

/// VMCS field encodings used here.
pub mod fields {
    pub const PIN_BASED_VM_EXEC_CONTROL: u32 = 0x0000_4000;
    pub const CPU_BASED_VM_EXEC_CONTROL: u32 = 0x0000_4002;
    pub const EXCEPTION_BITMAP: u32 = 0x0000_4004;
    pub const CR0_GUEST_HOST_MASK: u32 = 0x0000_6000;
    pub const CR4_GUEST_HOST_MASK: u32 = 0x0000_6002;
}

const PIN_EXTERNAL_INTERRUPT_EXITING: u64 = 1 << 0;
const CPU_RDTSC_EXITING: u64 = 1 << 12;
const CPU_CR3_LOAD_EXITING: u64 = 1 << 15;
const CPU_CR3_STORE_EXITING: u64 = 1 << 16;
const CPU_MOV_DR_EXITING: u64 = 1 << 23;

/// Read a VMCS field of the current VMCS.
///
/// # Safety
///
/// VMX operation must be on and a VMCS current on this core.
unsafe fn vmread(field: u32) -> AxResult<u64> {
    let value: u64;
    let failed: u8;
    unsafe {
        asm!(
            "vmread {value}, {field}",
            "setna {failed}",
            field = in(reg) field as u64,
            value = out(reg) value,
            failed = out(reg_byte) failed,
            options(nostack)
        );
    }
    if failed != 0 {
        return axerrno::ax_err!(BadState, "vmread failed");
    }
    Ok(value)
}

/// Write a VMCS field of the current VMCS.
///
/// # Safety
///
/// VMX operation must be on and a VMCS current on this core.
unsafe fn vmwrite(field: u32, value: u64) -> AxResult {
    let failed: u8;
    unsafe {
        asm!(
            "vmwrite {field}, {value}",
            "setna {failed}",
            field = in(reg) field as u64,
            value = in(reg) value,
            failed = out(reg_byte) failed,
            options(nostack)
        );
    }
    if failed != 0 {
        return axerrno::ax_err!(BadState, "vmwrite failed");
    }
    Ok(())
}

/// Set or clear `bits` in a control field.
unsafe fn update_bits(field: u32, bits: u64, enabled: bool) -> AxResult {
    unsafe {
        let old = vmread(field)?;
        let new = if enabled { old | bits } else { old & !bits };
        if new != old {
            vmwrite(field, new)?;
        }
    }
    Ok(())
}

/// Runs `f` on `core` and returns after it completed there.
pub type RunOnFn = fn(core: usize, f: &mut (dyn FnMut() + Send));

/// Physical trap toggles on real VMX hardware.
pub struct VmxTraps {
    core_count: usize,
    run_on: RunOnFn,
    /// Vectors intercepted while the exception bitmap resource is on.
    exception_mask: u32,
    /// Guest-host mask bits the hypervisor keeps regardless of the debugger.
    cr0_baseline: u64,
    cr4_baseline: u64,
}

impl VmxTraps {
    /// Traps for the cores and exception mask named by `config`.
    pub fn new(config: &Config, run_on: RunOnFn) -> Self {
        Self {
            core_count: config.core_count,
            run_on,
            exception_mask: config.exception_mask,
            cr0_baseline: 0,
            cr4_baseline: 0,
        }
    }

    /// Guest-host mask bits to keep set when control-register exiting is off.
    pub fn with_cr_baseline(mut self, cr0: u64, cr4: u64) -> Self {
        self.cr0_baseline = cr0;
        self.cr4_baseline = cr4;
        self
    }
}

impl VmxOps for VmxTraps {
    fn core_count(&self) -> usize {
        self.core_count
    }

    fn run_on(&self, core: usize, f: &mut (dyn FnMut() + Send)) {
        (self.run_on)(core, f);
    }

    fn set_trap(&self, core: usize, resource: ResourceKind, enabled: bool) -> AxResult {
        if core >= self.core_count {
            return axerrno::ax_err!(InvalidInput, "no such core");
        }
        log::debug!(
            "vmx: core {} {} {}",
            core,
            resource.label(),
            if enabled { "on" } else { "off" }
        );

        // SAFETY: `set_trap` only runs from `run_on` on the owning core, with
        // its VMCS current.
        unsafe {
            match resource {
                ResourceKind::ExceptionBitmap => {
                    let mask = if enabled { self.exception_mask } else { 0 };
                    vmwrite(fields::EXCEPTION_BITMAP, mask as u64)
                }
                ResourceKind::ExternalInterruptExiting => update_bits(
                    fields::PIN_BASED_VM_EXEC_CONTROL,
                    PIN_EXTERNAL_INTERRUPT_EXITING,
                    enabled,
                ),
                ResourceKind::RdtscRdtscpExiting => {
                    update_bits(fields::CPU_BASED_VM_EXEC_CONTROL, CPU_RDTSC_EXITING, enabled)
                }
                ResourceKind::MovToDebugRegisterExiting => {
                    update_bits(fields::CPU_BASED_VM_EXEC_CONTROL, CPU_MOV_DR_EXITING, enabled)
                }
                ResourceKind::MovControlRegisterExiting => {
                    let (cr0, cr4) = if enabled {
                        (u64::MAX, u64::MAX)
                    } else {
                        (self.cr0_baseline, self.cr4_baseline)
                    };
                    vmwrite(fields::CR0_GUEST_HOST_MASK, cr0)?;
                    vmwrite(fields::CR4_GUEST_HOST_MASK, cr4)
                }
                ResourceKind::MovToCr3Exiting => update_bits(
                    fields::CPU_BASED_VM_EXEC_CONTROL,
                    CPU_CR3_LOAD_EXITING | CPU_CR3_STORE_EXITING,
                    enabled,
                ),
            }
        }
    }
}
