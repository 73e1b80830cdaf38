//! # Process Control Block
//!
//! Defines the task model for Warden. Each task owns a stack (and
//! optionally a private heap) carved from the block allocator, and the MPU
//! confines it to exactly those regions while it runs.
//!
//! PCBs live in the scheduler's fixed table and are never deallocated: a
//! task's pid is its index in that table.

use core::fmt;

use crate::config::{DEFAULT_TIME_SLICE, NUM_RESOURCES};

/// Task identifier: index into the process table.
pub type Pid = usize;

/// Task entry point. Tasks never return.
pub type TaskEntry = extern "C" fn() -> !;

// ---------------------------------------------------------------------------
// Task state machine
// ---------------------------------------------------------------------------

/// Execution state of a task.
///
/// ```text
///   ┌─────┐  create   ┌───────┐  schedule()  ┌─────────┐
///   │ New │ ────────► │ Ready │ ───────────► │ Running │
///   └─────┘           └───────┘ ◄─────────── └─────────┘
///                        ▲        preempt      │     │
///                        │                     │     │ MPU fault
///                        │   tick expiry       │     ▼
///                        │   ┌─────────┐ delay │  ┌───────────┐
///                        └── │ Blocked │ ◄─────┘  │ Suspended │
///                            └─────────┘          └───────────┘
/// ```
///
/// `Suspended` is terminal: nothing in the kernel resumes a faulted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// PCB populated, not yet queued.
    New,
    /// Waiting in a ready queue.
    Ready,
    /// Currently executing (or chosen to execute at the next switch).
    Running,
    /// Sleeping until `wake_up_tick`.
    Blocked,
    /// Stopped after a memory-protection fault.
    Suspended,
}

impl ProcessState {
    /// Upper-case name used in diagnostics.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Blocked => "BLOCKED",
            Self::Suspended => "SUSPENDED",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Task configuration
// ---------------------------------------------------------------------------

/// Per-class resource counts.
pub type ResourceVector = [u32; NUM_RESOURCES];

/// Parameters for [`Kernel::create`](crate::kernel::Kernel::create).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskConfig {
    /// Slot in the process table.
    pub pid: Pid,
    /// Priority (higher runs first). Values above the highest level are
    /// queued at the highest level.
    pub priority: u8,
    /// Size of the private heap region in bytes. `0` means no heap.
    pub heap_size: usize,
    /// Maximum claim per resource class. `None` means all zeros.
    pub resource_limits: Option<ResourceVector>,
}

impl TaskConfig {
    /// Configuration with no heap and no resource limits.
    pub const fn new(pid: Pid, priority: u8) -> Self {
        Self {
            pid,
            priority,
            heap_size: 0,
            resource_limits: None,
        }
    }

    /// Request a private heap region of `size` bytes.
    pub const fn with_heap(mut self, size: usize) -> Self {
        self.heap_size = size;
        self
    }

    /// Declare maximum resource claims.
    pub const fn with_resource_limits(mut self, limits: ResourceVector) -> Self {
        self.resource_limits = Some(limits);
        self
    }
}

/// Held and maximum resource counts. Recorded for an admission policy;
/// the scheduler never reads them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceAccount {
    /// Units currently held per class.
    pub held: ResourceVector,
    /// Declared maximum per class.
    pub max: ResourceVector,
}

// ---------------------------------------------------------------------------
// Process Control Block
// ---------------------------------------------------------------------------

/// Memory a task may touch, as programmed into the MPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Base address (aligned for the MPU).
    pub base: usize,
    /// Size in bytes as requested at creation.
    pub size: usize,
}

/// Process Control Block.
#[derive(Debug, Clone, Copy)]
pub struct Pcb {
    /// Identity and table index.
    pub pid: Pid,
    /// Stack region.
    pub stack: MemoryRegion,
    /// Optional private heap region.
    pub heap: Option<MemoryRegion>,
    /// Saved process stack pointer. Meaningful only while not running.
    pub stack_ptr: usize,
    /// Entry function.
    pub entry: TaskEntry,
    /// Current state.
    pub state: ProcessState,
    /// Priority given at creation.
    pub static_priority: u8,
    /// Priority used for queueing. Equal to `static_priority` today.
    pub dynamic_priority: u8,
    /// Ticks granted per slice.
    pub time_slice: u32,
    /// Ticks left in the current slice.
    pub slice_remaining: u32,
    /// Ticks spent running.
    pub total_cpu_runtime: u32,
    /// Tick at which a blocked task becomes ready.
    pub wake_up_tick: u32,
    /// Resource accounting.
    pub resources: ResourceAccount,
}

impl Pcb {
    /// A freshly created task in state `New`.
    pub fn new(config: &TaskConfig, entry: TaskEntry, stack: MemoryRegion, heap: Option<MemoryRegion>, stack_ptr: usize) -> Self {
        Self {
            pid: config.pid,
            stack,
            heap,
            stack_ptr,
            entry,
            state: ProcessState::New,
            static_priority: config.priority,
            dynamic_priority: config.priority,
            time_slice: DEFAULT_TIME_SLICE,
            slice_remaining: DEFAULT_TIME_SLICE,
            total_cpu_runtime: 0,
            wake_up_tick: 0,
            resources: ResourceAccount {
                held: [0; NUM_RESOURCES],
                max: config.resource_limits.unwrap_or([0; NUM_RESOURCES]),
            },
        }
    }

    /// Priority the scheduler queues this task under.
    #[inline]
    pub fn priority(&self) -> u8 {
        self.dynamic_priority
    }

    /// Refill the time slice. Called when the task is switched in.
    #[inline]
    pub fn refill_slice(&mut self) {
        self.slice_remaining = self.time_slice;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) extern "C" fn parked() -> ! {
        loop {
            core::hint::spin_loop();
        }
    }

    fn region() -> MemoryRegion {
        MemoryRegion { base: 0x2000_0800, size: 1024 }
    }

    #[test]
    fn new_pcb_is_new_with_equal_priorities() {
        let config = TaskConfig::new(3, 5);
        let pcb = Pcb::new(&config, parked, region(), None, 0x2000_0bc0);

        assert_eq!(pcb.pid, 3);
        assert_eq!(pcb.state, ProcessState::New);
        assert_eq!(pcb.static_priority, 5);
        assert_eq!(pcb.dynamic_priority, 5);
        assert_eq!(pcb.time_slice, DEFAULT_TIME_SLICE);
        assert_eq!(pcb.total_cpu_runtime, 0);
        assert_eq!(pcb.wake_up_tick, 0);
        assert_eq!(pcb.resources, ResourceAccount::default());
    }

    #[test]
    fn resource_limits_are_recorded() {
        let config = TaskConfig::new(1, 2).with_resource_limits([3, 0, 7]);
        let pcb = Pcb::new(&config, parked, region(), None, 0);
        assert_eq!(pcb.resources.max, [3, 0, 7]);
        assert_eq!(pcb.resources.held, [0; NUM_RESOURCES]);
    }

    #[test]
    fn builder_sets_heap() {
        let config = TaskConfig::new(2, 1).with_heap(512);
        assert_eq!(config.heap_size, 512);
        assert_eq!(config.resource_limits, None);
    }

    #[test]
    fn state_names() {
        assert_eq!(ProcessState::New.to_string(), "NEW");
        assert_eq!(ProcessState::Blocked.to_string(), "BLOCKED");
        assert_eq!(ProcessState::Suspended.as_str(), "SUSPENDED");
    }
}
