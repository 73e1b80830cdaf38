//! # Kernel
//!
//! The kernel context and the public API built on it.
//!
//! [`Kernel`] packages every piece of mutable kernel state (allocator,
//! process table, ready queues, tick counter, hardware port) into one
//! value. Host tests drive a `Kernel<SimPort>` directly; firmware uses the
//! single global instance through the free functions below, each of which
//! runs inside a critical section.
//!
//! ## Startup Sequence
//!
//! ```text
//! reset_handler (cortex-m-rt)
//!   └─► main()
//!         ├─► kernel::init(port)                ← install the kernel
//!         ├─► kernel::mem_init()                ← format the arena
//!         ├─► kernel::mpu_init_kernel_regions() ← static regions, MPU on
//!         ├─► kernel::process_init()            ← idle task
//!         ├─► kernel::process_create(..)        ← tasks (×N)
//!         └─► kernel::launch(core)              ← SysTick, first task (no return)
//! ```
//!
//! Each step checks the [`Stage`] the kernel is in and fails with
//! [`KernelError::InitOrder`] when called out of sequence.

use core::cell::RefCell;
use core::ptr::NonNull;

use critical_section::Mutex;

use crate::arch::{ActivePort, Port};
use crate::error::{KernelError, KernelResult};
use crate::memory::{self, AllocationStats, BlockAllocator};
use crate::mpu::{self, MemoryMap};
use crate::resource::{ResourcePolicy, Unrestricted};
use crate::scheduler::Scheduler;
use crate::sync;
use crate::task::{Pid, TaskConfig, TaskEntry};
use crate::timer::TickOutcome;

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Bring-up stage. Steps must run in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    /// Kernel value exists; nothing initialized.
    Created,
    /// Allocator arena formatted.
    MemoryReady,
    /// Static MPU regions programmed and MPU enabled.
    MpuReady,
    /// Idle task created; tasks may be added.
    SchedulerReady,
    /// First task dispatched.
    Running,
}

/// What a call to [`Kernel::schedule`] asks the caller to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Nothing was ready; the running task continues.
    Nothing,
    /// A task was chosen and a context switch is pending.
    Pending,
    /// No task has run yet: enter the chosen task's initial frame at this
    /// stack pointer.
    FirstEntry(usize),
}

/// Kernel context.
pub struct Kernel<P: Port, R: ResourcePolicy = Unrestricted> {
    pub(crate) allocator: BlockAllocator,
    pub(crate) map: MemoryMap,
    pub(crate) scheduler: Scheduler,
    pub(crate) port: P,
    pub(crate) policy: R,
    pub(crate) stage: Stage,
}

impl<P: Port> Kernel<P, Unrestricted> {
    /// Kernel over `port` that admits every task.
    pub const fn new(port: P) -> Self {
        Self::with_policy(port, Unrestricted)
    }
}

impl<P: Port, R: ResourcePolicy> Kernel<P, R> {
    /// Kernel over `port` consulting `policy` at task creation.
    pub const fn with_policy(port: P, policy: R) -> Self {
        Self {
            allocator: BlockAllocator::new(),
            map: MemoryMap::DEFAULT,
            scheduler: Scheduler::new(),
            port,
            policy,
            stage: Stage::Created,
        }
    }

    /// Use `map` for the static MPU regions.
    pub fn with_memory_map(mut self, map: MemoryMap) -> Self {
        self.map = map;
        self
    }

    /// Bring-up stage reached so far.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Process table and ready set.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Register port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Mutable register port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Block allocator over the arena.
    pub fn allocator(&self) -> &BlockAllocator {
        &self.allocator
    }

    /// Current tick count.
    pub fn ticks(&self) -> u32 {
        self.scheduler.tick_count
    }

    /// Fail unless the kernel is exactly at `expected`.
    pub(crate) fn require(&self, expected: Stage) -> KernelResult<()> {
        if self.stage != expected {
            return Err(KernelError::InitOrder {
                expected,
                found: self.stage,
            });
        }
        Ok(())
    }

    /// Fail unless the kernel has reached `expected`.
    pub(crate) fn require_at_least(&self, expected: Stage) -> KernelResult<()> {
        if self.stage < expected {
            return Err(KernelError::InitOrder {
                expected,
                found: self.stage,
            });
        }
        Ok(())
    }

    // -- memory ------------------------------------------------------------

    /// Format `arena` as the allocator's heap.
    pub fn mem_init(&mut self, arena: &'static mut [u8]) -> KernelResult<()> {
        self.require(Stage::Created)?;
        self.allocator.init(arena)?;
        self.stage = Stage::MemoryReady;
        Ok(())
    }

    /// Allocate `size` bytes, 8-byte aligned.
    pub fn alloc(&mut self, size: usize) -> KernelResult<NonNull<u8>> {
        self.require_at_least(Stage::MemoryReady)?;
        Ok(self.allocator.alloc(size)?)
    }

    /// Allocate `size` bytes aligned to `alignment`.
    pub fn alloc_aligned(&mut self, size: usize, alignment: usize) -> KernelResult<NonNull<u8>> {
        self.require_at_least(Stage::MemoryReady)?;
        Ok(self.allocator.alloc_aligned(size, alignment)?)
    }

    /// Return an allocation. Null is a no-op.
    pub fn free(&mut self, ptr: *mut u8) -> KernelResult<()> {
        self.require_at_least(Stage::MemoryReady)?;
        Ok(self.allocator.free(ptr)?)
    }

    /// Allocator counters.
    pub fn alloc_stats(&self) -> AllocationStats {
        self.allocator.stats()
    }

    // -- MPU ---------------------------------------------------------------

    /// Program the static regions for the configured memory map.
    pub fn mpu_init_kernel_regions(&mut self) -> KernelResult<()> {
        self.require(Stage::MemoryReady)?;
        mpu::init_kernel_regions(&mut self.port, &self.map);
        self.stage = Stage::MpuReady;
        Ok(())
    }

    /// Program the per-task regions for `pid`.
    pub fn mpu_configure_for_task(&mut self, pid: Pid) -> KernelResult<()> {
        self.require_at_least(Stage::MpuReady)?;
        let pcb = self.scheduler.task(pid).ok_or(KernelError::InvalidPid(pid))?;
        mpu::configure_for_task(&mut self.port, pcb)
    }

    // -- processes ---------------------------------------------------------

    /// Create the idle task and open the process table for creation.
    pub fn process_init(&mut self) -> KernelResult<()> {
        self.require(Stage::MpuReady)?;
        self.stage = Stage::SchedulerReady;
        if let Err(e) = self.create(crate::process::idle_task, TaskConfig::new(crate::config::IDLE_PID, 0)) {
            self.stage = Stage::MpuReady;
            return Err(e);
        }
        log::info!("kernel: scheduler ready");
        Ok(())
    }

    /// Perform the first dispatch and return the stack pointer to enter.
    pub fn start(&mut self) -> KernelResult<usize> {
        self.require(Stage::SchedulerReady)?;
        match self.schedule()? {
            Dispatch::FirstEntry(sp) => Ok(sp),
            _ => Err(KernelError::NoCurrentTask),
        }
    }
}

// ---------------------------------------------------------------------------
// Global instance
// ---------------------------------------------------------------------------

/// The firmware's kernel. `None` until [`init`] installs it.
static KERNEL: Mutex<RefCell<Option<Kernel<ActivePort>>>> = Mutex::new(RefCell::new(None));

/// Install the global kernel over `port`.
pub fn init(port: ActivePort) -> KernelResult<()> {
    sync::critical_section(|cs| {
        let mut slot = KERNEL.borrow_ref_mut(cs);
        if let Some(kernel) = slot.as_ref() {
            return Err(KernelError::InitOrder {
                expected: Stage::Created,
                found: kernel.stage,
            });
        }
        *slot = Some(Kernel::new(port));
        Ok(())
    })
}

/// Run `f` on the global kernel inside a critical section.
///
/// Returns `None` if no kernel is installed or it is already borrowed
/// further up the stack.
pub fn with_kernel<T, F>(f: F) -> Option<T>
where
    F: FnOnce(&mut Kernel<ActivePort>) -> T,
{
    sync::critical_section(|cs| {
        let mut slot = KERNEL.borrow(cs).try_borrow_mut().ok()?;
        slot.as_mut().map(f)
    })
}

/// Like [`with_kernel`], but a missing kernel is an error.
fn with_installed<T, F>(f: F) -> KernelResult<T>
where
    F: FnOnce(&mut Kernel<ActivePort>) -> KernelResult<T>,
{
    with_kernel(f).unwrap_or(Err(KernelError::NotInitialized))
}

/// Format the statically reserved arena.
pub fn mem_init() -> KernelResult<()> {
    with_installed(|kernel| {
        kernel.require(Stage::Created)?;
        let arena = memory::take_arena().ok_or(memory::AllocError::InvalidArena)?;
        kernel.mem_init(arena)
    })
}

/// Allocate from the kernel arena.
pub fn alloc(size: usize) -> KernelResult<NonNull<u8>> {
    with_installed(|kernel| kernel.alloc(size))
}

/// Allocate from the kernel arena with an explicit alignment.
pub fn alloc_aligned(size: usize, alignment: usize) -> KernelResult<NonNull<u8>> {
    with_installed(|kernel| kernel.alloc_aligned(size, alignment))
}

/// Return an allocation to the kernel arena.
pub fn free(ptr: *mut u8) -> KernelResult<()> {
    with_installed(|kernel| kernel.free(ptr))
}

/// Program the static MPU regions.
pub fn mpu_init_kernel_regions() -> KernelResult<()> {
    with_installed(Kernel::mpu_init_kernel_regions)
}

/// Program the per-task MPU regions for `pid`.
pub fn mpu_configure_for_task(pid: Pid) -> KernelResult<()> {
    with_installed(|kernel| kernel.mpu_configure_for_task(pid))
}

/// Create the idle task.
pub fn process_init() -> KernelResult<()> {
    with_installed(Kernel::process_init)
}

/// Create a task running `entry`.
pub fn process_create(entry: TaskEntry, config: TaskConfig) -> KernelResult<Pid> {
    with_installed(|kernel| kernel.create(entry, config))
}

/// Yield to the highest ready task.
pub fn process_schedule() -> KernelResult<Dispatch> {
    let dispatch = with_installed(Kernel::schedule)?;
    if let Dispatch::FirstEntry(sp) = dispatch {
        enter_first_task(sp);
    }
    Ok(dispatch)
}

/// Block the running task for `ticks` ticks. `0` yields.
pub fn os_delay(ticks: u32) -> KernelResult<()> {
    with_installed(|kernel| kernel.delay(ticks))
}

/// Timer interrupt entry point.
pub fn process_timer_tick() -> Option<TickOutcome> {
    with_kernel(Kernel::timer_tick)
}

/// First dispatch. Returns the stack pointer of the task to enter.
pub fn start() -> KernelResult<usize> {
    with_installed(Kernel::start)
}

#[cfg(all(target_arch = "arm", target_os = "none"))]
fn enter_first_task(sp: usize) -> ! {
    // SAFETY: `sp` points at an initial frame built at creation and no
    // task has run yet.
    unsafe { crate::arch::cortex_m4::start_first_task(sp) }
}

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
fn enter_first_task(sp: usize) {
    log::debug!("kernel: first entry at {:#010x}", sp);
}

/// Configure SysTick and exception priorities, then enter the first task.
/// **Does not return.**
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub fn launch(mut core: cortex_m::Peripherals) -> ! {
    use crate::arch::cortex_m4;

    cortex_m4::set_interrupt_priorities(&mut core.SCB);

    match start() {
        Ok(sp) => {
            cortex_m4::configure_systick(&mut core.SYST);
            enter_first_task(sp)
        }
        Err(e) => {
            log::error!("kernel: start failed: {}", e);
            loop {
                cortex_m::asm::wfi();
            }
        }
    }
}
