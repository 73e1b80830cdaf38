//! MemManage fault handling.
//!
//! A protection fault is blamed on the running task: it is suspended for
//! good and a context switch is pended so PendSV picks someone else on the
//! way out of the exception. The rest of the system keeps running.

use bitflags::bitflags;

use crate::arch::{Port, Register, CFSR_MMFSR_MASK};
use crate::kernel::{self, Kernel};
use crate::resource::ResourcePolicy;
use crate::task::{Pid, ProcessState};

bitflags! {
    /// MemManage Fault Status Register (CFSR[7:0]).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Mmfsr: u8 {
        /// Instruction fetch from a no-execute or unmapped address.
        const IACCVIOL = 1 << 0;
        /// Data access violation.
        const DACCVIOL = 1 << 1;
        /// Fault while unstacking on exception return.
        const MUNSTKERR = 1 << 3;
        /// Fault while stacking on exception entry.
        const MSTKERR = 1 << 4;
        /// Fault during lazy floating-point state preservation.
        const MLSPERR = 1 << 5;
        /// MMFAR holds the faulting address.
        const MMARVALID = 1 << 7;
    }
}

/// What the handler decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The task was suspended and a switch is pending.
    Suspended(Pid),
    /// No task to blame; the system should halt.
    Halt,
}

/// Decoded fault, as logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultReport {
    /// Faulting task, if one was running.
    pub pid: Option<Pid>,
    /// Status flags at the time of the fault.
    pub status: Mmfsr,
    /// Faulting address, when MMARVALID was set.
    pub address: Option<u32>,
    pub outcome: FaultOutcome,
}

impl<P: Port, R: ResourcePolicy> Kernel<P, R> {
    /// MemManage handler body.
    pub fn handle_memory_fault(&mut self) -> FaultReport {
        let raw = self.port.read(Register::Cfsr) & CFSR_MMFSR_MASK;
        let status = Mmfsr::from_bits_retain(raw as u8);
        let address = status
            .contains(Mmfsr::MMARVALID)
            .then(|| self.port.read(Register::Mmfar));
        let pid = self.scheduler.current;

        match (pid, address) {
            (Some(pid), Some(address)) => log::error!(
                "fault: task {} MMFSR {:#04x} ({:?}) at {:#010x}",
                pid,
                raw,
                status,
                address
            ),
            (Some(pid), None) => log::error!("fault: task {} MMFSR {:#04x} ({:?})", pid, raw, status),
            (None, _) => log::error!("fault: no running task, MMFSR {:#04x} ({:?})", raw, status),
        }

        // Write-one-to-clear.
        self.port.write(Register::Cfsr, CFSR_MMFSR_MASK);

        let outcome = match pid {
            Some(pid) => {
                // A yield may already have requeued it.
                self.scheduler.remove_from_ready(pid);
                if let Some(pcb) = self.scheduler.task_mut(pid) {
                    pcb.state = ProcessState::Suspended;
                }
                self.scheduler.current = None;
                self.port.pend_context_switch();
                log::warn!("fault: task {} suspended", pid);
                FaultOutcome::Suspended(pid)
            }
            None => FaultOutcome::Halt,
        };

        FaultReport {
            pid,
            status,
            address,
            outcome,
        }
    }
}

/// Exception entry point. Halts if the kernel is missing or busy.
pub fn on_memory_fault() -> FaultOutcome {
    kernel::with_kernel(|kernel| kernel.handle_memory_fault().outcome).unwrap_or(FaultOutcome::Halt)
}
