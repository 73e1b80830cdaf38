//! Kernel error types.

use thiserror::Error;

use crate::memory::AllocError;
use crate::task::Pid;

/// Errors surfaced by kernel operations.
///
/// Conditions the kernel resolves locally (an empty ready set, a fault in a
/// task) are not represented here; see the scheduler and fault modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    /// The block allocator rejected a request.
    #[error("allocation failed: {0}")]
    Alloc(#[from] AllocError),
    /// Pid does not index the process table.
    #[error("pid {0} is out of range")]
    InvalidPid(Pid),
    /// Pid already names a live task.
    #[error("pid {0} is already in use")]
    PidInUse(Pid),
    /// An MPU region base does not satisfy the alignment-equals-size rule.
    #[error("region base {base:#010x} is not aligned to {alignment:#x}")]
    MisalignedRegion {
        /// Base address handed to the MPU.
        base: usize,
        /// Alignment the region encoding requires.
        alignment: usize,
    },
    /// The operation needs a running task and there is none.
    #[error("no task is running")]
    NoCurrentTask,
    /// No kernel instance has been installed.
    #[error("kernel not initialized")]
    NotInitialized,
    /// A bring-up step was called out of order.
    #[error("kernel is in stage {found:?}, expected {expected:?}")]
    InitOrder {
        /// Stage the step requires.
        expected: crate::kernel::Stage,
        /// Stage the kernel was in.
        found: crate::kernel::Stage,
    },
    /// A ready FIFO is at capacity.
    #[error("ready queue for priority {0} is full")]
    ReadyQueueFull(u8),
    /// The resource policy refused to admit the task.
    #[error("task {0} rejected by resource policy")]
    Rejected(Pid),
}

/// Result type for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;
