//! Resource admission.
//!
//! Every PCB records how many units of each resource class it holds and
//! the most it may claim. The kernel consults a [`ResourcePolicy`] once,
//! when a task is created; the default policy admits everything.

use crate::error::{KernelError, KernelResult};
use crate::task::{Pid, ResourceVector};

/// Decides whether a task with the given maximum claims may be created.
pub trait ResourcePolicy {
    /// Admit or reject task `pid` declaring `limits`.
    fn admit(&mut self, pid: Pid, limits: &ResourceVector) -> KernelResult<()>;
}

/// Admits every task.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unrestricted;

impl ResourcePolicy for Unrestricted {
    fn admit(&mut self, _pid: Pid, _limits: &ResourceVector) -> KernelResult<()> {
        Ok(())
    }
}

/// Rejects tasks whose claim in any class exceeds a fixed capacity.
#[derive(Debug, Clone, Copy)]
pub struct Capacity(pub ResourceVector);

impl ResourcePolicy for Capacity {
    fn admit(&mut self, pid: Pid, limits: &ResourceVector) -> KernelResult<()> {
        if limits.iter().zip(self.0.iter()).any(|(claim, cap)| claim > cap) {
            log::warn!("resource: task {} claims {:?}, capacity {:?}", pid, limits, self.0);
            return Err(KernelError::Rejected(pid));
        }
        Ok(())
    }
}
