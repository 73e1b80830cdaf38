//! Host register file.
//!
//! Models the subset of the System Control Space the kernel touches,
//! closely enough that MPU programming, fault status handling and PendSV
//! requests can be observed from tests:
//!
//! - RBAR/RASR are banked per region and selected through RNR (or through
//!   the RBAR VALID/REGION fields, as on hardware).
//! - CFSR is write-one-to-clear.
//! - ICSR PENDSVSET/PENDSVCLR set and clear a pending flag that reads back
//!   through PENDSVSET.

use super::{Port, Register, CFSR_MMFSR_MASK, ICSR_PENDSVCLR, ICSR_PENDSVSET, MPU_REGIONS};

/// RBAR: use the REGION field instead of RNR.
const RBAR_VALID: u32 = 1 << 4;
/// RBAR: REGION field.
const RBAR_REGION_MASK: u32 = 0xF;
/// RBAR: ADDR field.
const RBAR_ADDR_MASK: u32 = !0x1F;
/// MMFSR: MMFAR holds a valid address.
const MMARVALID: u8 = 1 << 7;

/// One MPU region as seen through RBAR/RASR.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimRegion {
    /// Base address bits of RBAR.
    pub rbar: u32,
    /// Raw RASR.
    pub rasr: u32,
}

impl SimRegion {
    /// RASR ENABLE bit.
    pub fn enabled(&self) -> bool {
        self.rasr & 1 != 0
    }
}

/// In-memory port.
#[derive(Debug, Clone, Default)]
pub struct SimPort {
    mpu_ctrl: u32,
    rnr: u32,
    regions: [SimRegion; MPU_REGIONS],
    shcsr: u32,
    cfsr: u32,
    mmfar: u32,
    pendsv: bool,
    data_barriers: usize,
    instruction_barriers: usize,
}

impl SimPort {
    /// Register file in its reset state.
    pub const fn new() -> Self {
        Self {
            mpu_ctrl: 0,
            rnr: 0,
            regions: [SimRegion { rbar: 0, rasr: 0 }; MPU_REGIONS],
            shcsr: 0,
            cfsr: 0,
            mmfar: 0,
            pendsv: false,
            data_barriers: 0,
            instruction_barriers: 0,
        }
    }

    /// Contents of MPU region `number`.
    pub fn region(&self, number: u8) -> SimRegion {
        self.regions
            .get(usize::from(number))
            .copied()
            .unwrap_or_default()
    }

    /// Number of DSB and ISB instructions issued.
    pub fn barriers(&self) -> (usize, usize) {
        (self.data_barriers, self.instruction_barriers)
    }

    /// Latch a MemManage fault as hardware would before taking the
    /// exception. MMARVALID is set when an address is supplied.
    pub fn inject_memory_fault(&mut self, mmfsr: u8, address: Option<u32>) {
        let mut status = mmfsr;
        if let Some(address) = address {
            self.mmfar = address;
            status |= MMARVALID;
        }
        self.cfsr |= u32::from(status);
    }

    /// Consume a pending context switch, as taking PendSV does.
    pub fn take_pending_switch(&mut self) -> bool {
        core::mem::replace(&mut self.pendsv, false)
    }
}

impl Port for SimPort {
    fn read(&self, reg: Register) -> u32 {
        match reg {
            Register::MpuCtrl => self.mpu_ctrl,
            Register::MpuRnr => self.rnr,
            Register::MpuRbar => self.region(self.rnr as u8).rbar,
            Register::MpuRasr => self.region(self.rnr as u8).rasr,
            Register::Shcsr => self.shcsr,
            Register::Cfsr => self.cfsr,
            Register::Mmfar => self.mmfar,
            Register::Icsr => {
                if self.pendsv {
                    ICSR_PENDSVSET
                } else {
                    0
                }
            }
        }
    }

    fn write(&mut self, reg: Register, value: u32) {
        match reg {
            Register::MpuCtrl => self.mpu_ctrl = value & 0x7,
            Register::MpuRnr => self.rnr = value & 0xFF,
            Register::MpuRbar => {
                if value & RBAR_VALID != 0 {
                    self.rnr = value & RBAR_REGION_MASK;
                }
                if let Some(region) = self.regions.get_mut(self.rnr as usize) {
                    region.rbar = value & RBAR_ADDR_MASK;
                }
            }
            Register::MpuRasr => {
                if let Some(region) = self.regions.get_mut(self.rnr as usize) {
                    region.rasr = value;
                }
            }
            Register::Shcsr => self.shcsr = value,
            Register::Cfsr => self.cfsr &= !(value & CFSR_MMFSR_MASK),
            Register::Mmfar => self.mmfar = value,
            Register::Icsr => {
                if value & ICSR_PENDSVCLR != 0 {
                    self.pendsv = false;
                }
                if value & ICSR_PENDSVSET != 0 {
                    self.pendsv = true;
                }
            }
        }
    }

    fn data_barrier(&mut self) {
        self.data_barriers += 1;
    }

    fn instruction_barrier(&mut self) {
        self.instruction_barriers += 1;
    }
}
