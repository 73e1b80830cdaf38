//! # Cortex-M4 Port Layer
//!
//! Hardware-specific code for the ARM Cortex-M4 (Thumb-2) processor with
//! an MPU. Implements [`Port`] over the System Control Space, the PendSV
//! context switch, SysTick configuration, the exception handlers the
//! kernel owns, and an ITM-backed logger.
//!
//! ## Context Switch Mechanism
//!
//! Tasks run in privileged Thread mode on the **PSP**; the kernel and
//! exception handlers run on the **MSP**. On exception entry the hardware
//! stacks R0–R3, R12, LR, PC and xPSR onto the process stack. PendSV saves
//! R4–R11 below that frame, hands the resulting stack pointer to the
//! kernel, and restores R4–R11 from whichever stack pointer comes back.
//!
//! ## Interrupt Priorities
//!
//! - MemManage: 0 (highest), so a protection fault is handled immediately
//! - SysTick: 0xFF
//! - PendSV: 0xFF, so a switch runs only after every other handler

use core::arch::{asm, global_asm};

use cortex_m::peripheral::scb::SystemHandler;
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{MPU, SCB, SYST};

use super::{Port, Register};
use crate::config::{SYSTEM_CLOCK_HZ, TICK_HZ};

// ---------------------------------------------------------------------------
// Register access
// ---------------------------------------------------------------------------

/// The processor's System Control Space.
///
/// Zero-sized: every access goes through the fixed peripheral addresses.
/// The kernel only touches it from inside a critical section.
#[derive(Debug, Default)]
pub struct CortexM4 {
    _private: (),
}

impl CortexM4 {
    /// Handle to the System Control Space.
    ///
    /// # Safety
    /// At most one `CortexM4` may be in use, and nothing else may write the
    /// MPU or fault registers behind its back.
    pub const unsafe fn steal() -> Self {
        Self { _private: () }
    }
}

impl Port for CortexM4 {
    fn read(&self, reg: Register) -> u32 {
        // SAFETY: fixed, always-mapped SCS addresses; reads have no side effects.
        unsafe {
            let mpu = &*MPU::PTR;
            let scb = &*SCB::PTR;
            match reg {
                Register::MpuCtrl => mpu.ctrl.read(),
                Register::MpuRnr => mpu.rnr.read(),
                Register::MpuRbar => mpu.rbar.read(),
                Register::MpuRasr => mpu.rasr.read(),
                Register::Shcsr => scb.shcsr.read(),
                Register::Cfsr => scb.cfsr.read(),
                Register::Mmfar => scb.mmfar.read(),
                Register::Icsr => scb.icsr.read(),
            }
        }
    }

    fn write(&mut self, reg: Register, value: u32) {
        // SAFETY: `&mut self` is the single owner of these registers.
        unsafe {
            let mpu = &*MPU::PTR;
            let scb = &*SCB::PTR;
            match reg {
                Register::MpuCtrl => mpu.ctrl.write(value),
                Register::MpuRnr => mpu.rnr.write(value),
                Register::MpuRbar => mpu.rbar.write(value),
                Register::MpuRasr => mpu.rasr.write(value),
                Register::Shcsr => scb.shcsr.write(value),
                Register::Cfsr => scb.cfsr.write(value),
                Register::Mmfar => scb.mmfar.write(value),
                Register::Icsr => scb.icsr.write(value),
            }
        }
    }

    #[inline]
    fn data_barrier(&mut self) {
        cortex_m::asm::dsb();
    }

    #[inline]
    fn instruction_barrier(&mut self) {
        cortex_m::asm::isb();
    }
}

// ---------------------------------------------------------------------------
// SysTick and priorities
// ---------------------------------------------------------------------------

/// Configure SysTick to fire at `TICK_HZ` from the processor clock.
pub fn configure_systick(syst: &mut SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

/// PendSV and SysTick lowest, MemManage highest.
pub fn set_interrupt_priorities(scb: &mut SCB) {
    // SAFETY: called once during bring-up, before any task runs, so no
    // priority-based critical section can be broken.
    unsafe {
        scb.set_priority(SystemHandler::MemoryManagement, 0x00);
        scb.set_priority(SystemHandler::SysTick, 0xFF);
        scb.set_priority(SystemHandler::PendSV, 0xFF);
    }
}

// ---------------------------------------------------------------------------
// First task launch
// ---------------------------------------------------------------------------

/// Switch Thread mode to the PSP and branch into the task
/// whose initial frame sits at `psp`.
///
/// # Safety
/// Must only be called once, with a stack pointer produced by
/// [`build_initial_frame`](super::build_initial_frame).
pub unsafe fn start_first_task(psp: usize) -> ! {
    asm!(
        "adds r0, #32",         // skip the software-saved R4-R11
        "msr psp, r0",
        "movs r0, #2",          // SPSEL = PSP, stay privileged for kernel calls
        "msr control, r0",
        "isb",
        "pop {{r0-r3, r12}}",
        "pop {{r4}}",           // LR, unused: tasks never return
        "pop {{r5}}",           // PC
        "pop {{r6}}",           // xPSR
        "orr r5, r5, #1",       // branch in Thumb state
        "cpsie i",
        "bx r5",
        in("r0") psp,
        options(noreturn)
    );
}

// ---------------------------------------------------------------------------
// PendSV handler (context switch)
// ---------------------------------------------------------------------------

global_asm!(
    ".section .text.PendSV,\"ax\",%progbits",
    ".global PendSV",
    ".type PendSV,%function",
    ".thumb_func",
    "PendSV:",
    "    mrs r0, psp",
    "    stmdb r0!, {{r4-r11}}",
    "    push {{r3, lr}}",
    "    bl {switch}",
    "    pop {{r3, lr}}",
    "    ldmia r0!, {{r4-r11}}",
    "    msr psp, r0",
    "    bx lr",
    ".size PendSV, . - PendSV",
    switch = sym pendsv_switch,
);

/// Store the outgoing stack pointer and return the incoming one.
extern "C" fn pendsv_switch(saved_sp: usize) -> usize {
    match crate::kernel::with_kernel(|kernel| kernel.switch_context(saved_sp)) {
        Some(next) => next.unwrap_or(saved_sp),
        None => saved_sp,
    }
}

// ---------------------------------------------------------------------------
// SysTick and MemManage handlers
// ---------------------------------------------------------------------------

/// SysTick exception handler: kernel tick entry point.
#[no_mangle]
pub extern "C" fn SysTick() {
    crate::kernel::process_timer_tick();
}

/// MemManage exception handler.
///
/// Suspends the faulting task and pends a switch away from it. A fault
/// with no task to blame halts the system.
#[no_mangle]
pub extern "C" fn MemoryManagement() {
    if let crate::fault::FaultOutcome::Halt = crate::fault::on_memory_fault() {
        loop {
            cortex_m::asm::wfi();
        }
    }
}

// ---------------------------------------------------------------------------
// ITM logger
// ---------------------------------------------------------------------------

/// `log` backend writing to ITM stimulus port 0.
pub struct ItmLogger;

impl log::Log for ItmLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        critical_section::with(|_| {
            // SAFETY: the ITM is used only by this logger and only inside a
            // critical section.
            let itm = unsafe { &mut *(cortex_m::peripheral::ITM::PTR as *mut cortex_m::peripheral::itm::RegisterBlock) };
            cortex_m::iprintln!(&mut itm.stim[0], "[{}] {}: {}", record.level(), record.target(), record.args());
        });
    }

    fn flush(&self) {}
}

static LOGGER: ItmLogger = ItmLogger;

/// Install the ITM logger.
pub fn init_logger(level: log::LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
