//! # Architecture Abstraction Layer
//!
//! Provides the hardware boundary for the kernel. Everything above this
//! module talks to the processor through the [`Port`] trait: a handful of
//! memory-mapped system registers plus the barrier instructions the MPU
//! needs after reprogramming.
//!
//! Two ports exist:
//! - [`cortex_m4::CortexM4`]: the real System Control Space, used when
//!   building for a bare-metal ARM target.
//! - [`sim::SimPort`]: an in-memory register file used on the host for
//!   tests and the simulation binary.

use core::mem::size_of;
use core::ptr::NonNull;

use crate::task::TaskEntry;

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod cortex_m4;
pub mod sim;

/// Port selected for the current build target.
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub type ActivePort = cortex_m4::CortexM4;

/// Port selected for the current build target.
#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub type ActivePort = sim::SimPort;

// ---------------------------------------------------------------------------
// System registers
// ---------------------------------------------------------------------------

/// System registers the kernel reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    /// MPU Control Register (0xE000_ED94).
    MpuCtrl,
    /// MPU Region Number Register (0xE000_ED98).
    MpuRnr,
    /// MPU Region Base Address Register (0xE000_ED9C).
    MpuRbar,
    /// MPU Region Attribute and Size Register (0xE000_EDA0).
    MpuRasr,
    /// System Handler Control and State Register (0xE000_ED24).
    Shcsr,
    /// Configurable Fault Status Register (0xE000_ED28).
    Cfsr,
    /// MemManage Fault Address Register (0xE000_ED34).
    Mmfar,
    /// Interrupt Control and State Register (0xE000_ED04).
    Icsr,
}

/// MPU_CTRL: enable the MPU.
pub const MPU_CTRL_ENABLE: u32 = 1 << 0;
/// MPU_CTRL: privileged code falls back to the default memory map.
pub const MPU_CTRL_PRIVDEFENA: u32 = 1 << 2;
/// SHCSR: enable the MemManage exception.
pub const SHCSR_MEMFAULTENA: u32 = 1 << 16;
/// ICSR: set PendSV pending.
pub const ICSR_PENDSVSET: u32 = 1 << 28;
/// ICSR: clear PendSV pending.
pub const ICSR_PENDSVCLR: u32 = 1 << 27;
/// CFSR: MemManage fault status byte.
pub const CFSR_MMFSR_MASK: u32 = 0xFF;
/// Number of MPU regions on the Cortex-M4.
pub const MPU_REGIONS: usize = 8;

/// Hardware access used by the kernel.
pub trait Port {
    /// Read a system register.
    fn read(&self, reg: Register) -> u32;

    /// Write a system register.
    fn write(&mut self, reg: Register, value: u32);

    /// Data synchronization barrier (DSB).
    fn data_barrier(&mut self);

    /// Instruction synchronization barrier (ISB).
    fn instruction_barrier(&mut self);

    /// DSB followed by ISB. Required after the MPU is reprogrammed.
    fn barrier(&mut self) {
        self.data_barrier();
        self.instruction_barrier();
    }

    /// Read-modify-write a register.
    fn modify<F: FnOnce(u32) -> u32>(&mut self, reg: Register, f: F) {
        let value = self.read(reg);
        self.write(reg, f(value));
    }

    /// Request a deferred context switch by pending PendSV.
    fn pend_context_switch(&mut self) {
        self.write(Register::Icsr, ICSR_PENDSVSET);
    }

    /// Whether a context switch is pending.
    fn context_switch_pending(&self) -> bool {
        self.read(Register::Icsr) & ICSR_PENDSVSET != 0
    }
}

// ---------------------------------------------------------------------------
// Initial stack frame
// ---------------------------------------------------------------------------

/// Initial xPSR: only the Thumb bit set.
pub const INITIAL_XPSR: u32 = 0x0100_0000;

/// EXC_RETURN value for "return to Thread mode, use PSP".
pub const EXC_RETURN_THREAD_PSP: u32 = 0xFFFF_FFFD;

/// Context laid out exactly as a task's stack looks after PendSV has
/// saved it: the software-saved registers on top, the hardware exception
/// frame below.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitialFrame {
    /// R4–R11, saved by the PendSV handler.
    pub r4_r11: [u32; 8],
    /// R0–R3, stacked by hardware.
    pub r0_r3: [u32; 4],
    /// R12.
    pub r12: u32,
    /// Link register.
    pub lr: u32,
    /// Return address: the task entry.
    pub pc: u32,
    /// Program status.
    pub xpsr: u32,
}

static_assertions::const_assert_eq!(size_of::<InitialFrame>(), 16 * 4);

impl InitialFrame {
    /// Frame that starts executing `entry` in Thread mode on the PSP.
    pub fn for_entry(entry: TaskEntry) -> Self {
        Self {
            r4_r11: [0; 8],
            r0_r3: [0; 4],
            r12: 0,
            lr: EXC_RETURN_THREAD_PSP,
            // Exception return requires bit 0 clear; the Thumb state comes
            // from xPSR instead.
            pc: (entry as usize as u32) & !1,
            xpsr: INITIAL_XPSR,
        }
    }
}

/// Write an initial frame at the 8-byte aligned top of a stack and return
/// the saved stack pointer that points at it.
///
/// # Safety
/// `stack` must be valid for writes of `stack_size` bytes and
/// `stack_size` must be at least `size_of::<InitialFrame>() + 8`.
pub unsafe fn build_initial_frame(stack: NonNull<u8>, stack_size: usize, entry: TaskEntry) -> usize {
    let end = stack.as_ptr().add(stack_size);
    let top = end.sub(end as usize & 0x7);
    let frame = top.sub(size_of::<InitialFrame>()).cast::<InitialFrame>();
    frame.write_unaligned(InitialFrame::for_entry(entry));
    frame as usize
}

/// Sleep until the next interrupt. Used by the idle task.
#[inline]
pub fn wait_for_interrupt() {
    #[cfg(all(target_arch = "arm", target_os = "none"))]
    cortex_m::asm::wfi();
    #[cfg(not(all(target_arch = "arm", target_os = "none")))]
    core::hint::spin_loop();
}
