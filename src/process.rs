//! Task creation and dispatch.
//!
//! ## Dispatch paths
//!
//! - [`Kernel::schedule`]: a task gives up the CPU (yield, delay). The
//!   choice is made here and recorded as `next`; PendSV performs the swap.
//! - [`Kernel::switch_context`]: PendSV itself. Loads `next` if one was
//!   chosen, otherwise decides whether a tick wakeup, an expired slice, a
//!   fault or a creation warrants preempting the running task.
//!
//! A running task keeps the CPU unless a strictly higher level is ready,
//! or an equal level is ready and its slice is used up.

use core::ptr::NonNull;

use crate::arch::{self, build_initial_frame, Port};
use crate::config::{MAX_PROCESSES, NUM_RESOURCES, STACK_SIZE_BYTES};
use crate::error::{KernelError, KernelResult};
use crate::kernel::{Dispatch, Kernel, Stage};
use crate::memory::region::alignment_for;
use crate::mpu;
use crate::resource::ResourcePolicy;
use crate::scheduler::ReadyQueues;
use crate::task::{MemoryRegion, Pcb, Pid, ProcessState, TaskConfig, TaskEntry};

/// Runs when nothing else is ready.
pub(crate) extern "C" fn idle_task() -> ! {
    loop {
        arch::wait_for_interrupt();
    }
}

impl<P: Port, R: ResourcePolicy> Kernel<P, R> {
    /// Create a task running `entry`.
    ///
    /// Allocates an MPU-aligned stack (and the optional heap), writes the
    /// initial frame, and queues the task as READY. If it outranks the
    /// running task a context switch is pended.
    pub fn create(&mut self, entry: TaskEntry, config: TaskConfig) -> KernelResult<Pid> {
        self.require_at_least(Stage::SchedulerReady)?;

        let pid = config.pid;
        if pid >= MAX_PROCESSES {
            return Err(KernelError::InvalidPid(pid));
        }
        if self.scheduler.task(pid).is_some() {
            return Err(KernelError::PidInUse(pid));
        }
        let limits = config.resource_limits.unwrap_or([0; NUM_RESOURCES]);
        self.policy.admit(pid, &limits)?;

        let stack = self
            .allocator
            .alloc_aligned(STACK_SIZE_BYTES, alignment_for(STACK_SIZE_BYTES))
            .map_err(|e| {
                log::error!("process: task {} stack allocation failed: {}", pid, e);
                e
            })?;

        let heap = match self.alloc_heap(pid, config.heap_size) {
            Ok(heap) => heap,
            Err(e) => {
                self.release(stack, None);
                return Err(e);
            }
        };

        // SAFETY: `stack` is a fresh allocation of STACK_SIZE_BYTES bytes.
        let sp = unsafe { build_initial_frame(stack, STACK_SIZE_BYTES, entry) };
        let region = MemoryRegion {
            base: stack.as_ptr() as usize,
            size: STACK_SIZE_BYTES,
        };
        let pcb = Pcb::new(&config, entry, region, heap, sp);

        if let Err(e) = self.scheduler.insert(pcb).and_then(|()| self.scheduler.add_to_ready(pid)) {
            self.scheduler.remove(pid);
            self.release(stack, heap);
            return Err(e);
        }

        log::info!(
            "process: created task {} priority {} stack {:#010x} sp {:#010x}",
            pid,
            config.priority,
            region.base,
            sp
        );

        if let Some(running) = self.scheduler.current_priority() {
            if ReadyQueues::level_for(config.priority) > ReadyQueues::level_for(running) {
                self.port.pend_context_switch();
            }
        }
        Ok(pid)
    }

    fn alloc_heap(&mut self, pid: Pid, size: usize) -> KernelResult<Option<MemoryRegion>> {
        if size == 0 {
            return Ok(None);
        }
        match self.allocator.alloc_aligned(size, alignment_for(size)) {
            Ok(base) => Ok(Some(MemoryRegion {
                base: base.as_ptr() as usize,
                size,
            })),
            Err(e) => {
                log::error!("process: task {} heap allocation of {} bytes failed: {}", pid, size, e);
                Err(e.into())
            }
        }
    }

    fn release(&mut self, stack: NonNull<u8>, heap: Option<MemoryRegion>) {
        if let Some(heap) = heap {
            let _ = self.allocator.free(heap.base as *mut u8);
        }
        let _ = self.allocator.free(stack.as_ptr());
    }

    /// Choose the highest ready task to run next.
    ///
    /// The running task is requeued only if it is still RUNNING: a task
    /// that blocked itself stays out of the ready set. Before the first
    /// dispatch the chosen task is returned as [`Dispatch::FirstEntry`];
    /// afterwards it is recorded as `next` and PendSV is pended.
    pub fn schedule(&mut self) -> KernelResult<Dispatch> {
        let first = match self.stage {
            Stage::SchedulerReady => true,
            Stage::Running => false,
            found => {
                return Err(KernelError::InitOrder {
                    expected: Stage::SchedulerReady,
                    found,
                })
            }
        };

        if let Some(stale) = self.scheduler.next.take() {
            self.scheduler.return_to_ready(stale)?;
        }

        let Some(pid) = self.scheduler.pick_highest_ready() else {
            return Ok(Dispatch::Nothing);
        };

        let outgoing = self.scheduler.current;
        if let Some(current) = outgoing {
            if self.scheduler.task(current).map(|t| t.state) == Some(ProcessState::Running) {
                self.scheduler.add_to_ready(current)?;
            }
        }

        let incoming = self.activate(pid)?;
        log::debug!("sched: {:?} -> {}", outgoing, pid);

        if first {
            self.stage = Stage::Running;
            self.scheduler.current = Some(pid);
            log::info!("kernel: first dispatch to task {}", pid);
            Ok(Dispatch::FirstEntry(incoming.stack_ptr))
        } else {
            self.scheduler.next = Some(pid);
            self.port.pend_context_switch();
            Ok(Dispatch::Pending)
        }
    }

    /// Mark `pid` RUNNING with a fresh slice and map its regions.
    fn activate(&mut self, pid: Pid) -> KernelResult<Pcb> {
        let pcb = self.scheduler.task_mut(pid).ok_or(KernelError::InvalidPid(pid))?;
        pcb.state = ProcessState::Running;
        pcb.refill_slice();
        let pcb = *pcb;
        // A misaligned region has already been logged and left disabled.
        let _ = mpu::configure_for_task(&mut self.port, &pcb);
        Ok(pcb)
    }

    /// PendSV body: save the outgoing stack pointer and return the one to
    /// resume, or `None` to resume the same context.
    pub fn switch_context(&mut self, saved_sp: usize) -> Option<usize> {
        if let Some(pcb) = self.scheduler.current_task_mut() {
            pcb.stack_ptr = saved_sp;
        }

        let incoming = match self.scheduler.next.take() {
            Some(pid) => pid,
            None => self.preempt()?,
        };

        let sp = self.scheduler.task(incoming)?.stack_ptr;
        log::trace!("sched: switch {:?} -> {} sp {:#010x}", self.scheduler.current, incoming, sp);
        self.scheduler.current = Some(incoming);
        Some(sp)
    }

    /// Pick a task to replace the running one, if the preemption rule
    /// allows it.
    fn preempt(&mut self) -> Option<Pid> {
        let highest = self.scheduler.ready.highest_level()?;

        if let Some(running) = self.scheduler.current_task() {
            if running.state == ProcessState::Running {
                let level = ReadyQueues::level_for(running.priority());
                if highest < level || (highest == level && running.slice_remaining > 0) {
                    return None;
                }
                let pid = running.pid;
                if let Err(e) = self.scheduler.add_to_ready(pid) {
                    log::error!("sched: cannot requeue task {}: {}", pid, e);
                    return None;
                }
            }
        }

        let pid = self.scheduler.pick_highest_ready()?;
        self.activate(pid).ok()?;
        Some(pid)
    }

    /// Block the running task until `ticks` ticks have passed and yield.
    /// A delay of zero yields without blocking.
    pub fn delay(&mut self, ticks: u32) -> KernelResult<()> {
        self.require(Stage::Running)?;
        let now = self.scheduler.tick_count;
        let pcb = self
            .scheduler
            .current_task_mut()
            .ok_or(KernelError::NoCurrentTask)?;

        if ticks > 0 {
            pcb.wake_up_tick = now.wrapping_add(ticks);
            pcb.state = ProcessState::Blocked;
            log::debug!("process: task {} blocked until tick {}", pcb.pid, pcb.wake_up_tick);
        }
        self.schedule()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimPort;
    use crate::arch::InitialFrame;
    use crate::kernel::tests::{booted, service_switch};
    use crate::memory::leaked_arena;
    use crate::resource::Capacity;
    use crate::task::tests::parked;

    #[test]
    fn create_builds_aligned_stack_and_frame() {
        let mut kernel = booted();
        let pid = kernel.create(parked, TaskConfig::new(1, 2)).unwrap();
        let pcb = *kernel.scheduler().task(pid).unwrap();

        assert_eq!(pcb.state, ProcessState::Ready);
        assert_eq!(pcb.stack.base % alignment_for(STACK_SIZE_BYTES), 0);
        assert_eq!(pcb.stack.size, STACK_SIZE_BYTES);
        assert_eq!(pcb.heap, None);
        assert_eq!(pcb.stack_ptr, pcb.stack.base + STACK_SIZE_BYTES - core::mem::size_of::<InitialFrame>());

        let frame = unsafe { (pcb.stack_ptr as *const InitialFrame).read_unaligned() };
        assert_eq!(frame, InitialFrame::for_entry(parked));
        assert!(kernel.scheduler().ready.contains(pid));
    }

    #[test]
    fn create_with_heap_gets_aligned_region() {
        let mut kernel = booted();
        let pid = kernel.create(parked, TaskConfig::new(1, 1).with_heap(3000)).unwrap();
        let heap = kernel.scheduler().task(pid).unwrap().heap.unwrap();
        assert_eq!(heap.size, 3000);
        assert_eq!(heap.base % alignment_for(3000), 0);
    }

    #[test]
    fn create_rejects_bad_pids() {
        let mut kernel = booted();
        assert_eq!(
            kernel.create(parked, TaskConfig::new(MAX_PROCESSES, 1)),
            Err(KernelError::InvalidPid(MAX_PROCESSES))
        );
        assert_eq!(kernel.create(parked, TaskConfig::new(0, 1)), Err(KernelError::PidInUse(0)));
    }

    #[test]
    fn heap_failure_returns_the_stack() {
        let mut kernel = booted();
        let before = kernel.alloc_stats().bytes_in_use;
        let err = kernel
            .create(parked, TaskConfig::new(1, 1).with_heap(1 << 20))
            .unwrap_err();

        assert!(matches!(err, KernelError::Alloc(_)));
        assert_eq!(kernel.alloc_stats().bytes_in_use, before);
        assert!(kernel.scheduler().task(1).is_none());
        assert!(!kernel.scheduler().ready.contains(1));
    }

    #[test]
    fn stack_exhaustion_is_reported() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut kernel = Kernel::new(SimPort::new());
        // Room for the idle stack and one more, each behind alignment padding.
        kernel.mem_init(leaked_arena(6144)).unwrap();
        kernel.mpu_init_kernel_regions().unwrap();
        kernel.process_init().unwrap();

        assert!(kernel.create(parked, TaskConfig::new(1, 1)).is_ok());
        assert!(matches!(
            kernel.create(parked, TaskConfig::new(2, 1)),
            Err(KernelError::Alloc(_))
        ));
    }

    #[test]
    fn policy_can_reject() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut kernel = Kernel::with_policy(SimPort::new(), Capacity([1, 1, 1]));
        kernel.mem_init(leaked_arena(crate::config::HEAP_SIZE)).unwrap();
        kernel.mpu_init_kernel_regions().unwrap();
        kernel.process_init().unwrap();

        let err = kernel.create(parked, TaskConfig::new(1, 1).with_resource_limits([0, 2, 0]));
        assert_eq!(err, Err(KernelError::Rejected(1)));
        let pid = kernel
            .create(parked, TaskConfig::new(2, 1).with_resource_limits([1, 0, 1]))
            .unwrap();
        assert_eq!(kernel.scheduler().task(pid).unwrap().resources.max, [1, 0, 1]);
    }

    #[test]
    fn higher_priority_creation_pends_switch() {
        let mut kernel = booted();
        kernel.create(parked, TaskConfig::new(1, 2)).unwrap();
        kernel.start().unwrap();

        kernel.create(parked, TaskConfig::new(2, 2)).unwrap();
        assert!(!kernel.port().context_switch_pending());

        kernel.create(parked, TaskConfig::new(3, 5)).unwrap();
        assert!(kernel.port().context_switch_pending());
        assert_eq!(service_switch(&mut kernel), Some(3));
        assert_eq!(kernel.scheduler().task(1).unwrap().state, ProcessState::Ready);
        assert_eq!(kernel.scheduler().task(3).unwrap().state, ProcessState::Running);
    }

    #[test]
    fn dispatch_order_follows_priority_then_creation() {
        let mut kernel = booted();
        kernel.create(parked, TaskConfig::new(1, 1)).unwrap();
        kernel.create(parked, TaskConfig::new(2, 1)).unwrap();
        kernel.create(parked, TaskConfig::new(3, 2)).unwrap();

        kernel.start().unwrap();
        assert_eq!(kernel.scheduler().current, Some(3));

        kernel.delay(10).unwrap();
        assert_eq!(service_switch(&mut kernel), Some(1));
        kernel.delay(10).unwrap();
        assert_eq!(service_switch(&mut kernel), Some(2));
        kernel.delay(10).unwrap();
        assert_eq!(service_switch(&mut kernel), Some(crate::config::IDLE_PID));
    }

    #[test]
    fn blocked_task_is_never_requeued() {
        let mut kernel = booted();
        kernel.create(parked, TaskConfig::new(1, 3)).unwrap();
        kernel.start().unwrap();

        kernel.delay(5).unwrap();
        assert_eq!(kernel.scheduler().task(1).unwrap().state, ProcessState::Blocked);
        assert!(!kernel.scheduler().ready.contains(1));

        // A second decision before the switch lands must not requeue it either.
        kernel.schedule().unwrap();
        assert!(!kernel.scheduler().ready.contains(1));
        assert_eq!(kernel.scheduler().next, Some(crate::config::IDLE_PID));
    }

    #[test]
    fn unswitched_choice_is_not_lost() {
        let mut kernel = booted();
        kernel.create(parked, TaskConfig::new(1, 1)).unwrap();
        kernel.create(parked, TaskConfig::new(2, 1)).unwrap();
        kernel.start().unwrap();
        assert_eq!(kernel.scheduler().current, Some(1));

        assert_eq!(kernel.schedule().unwrap(), Dispatch::Pending);
        assert_eq!(kernel.scheduler().next, Some(2));
        assert_eq!(kernel.schedule().unwrap(), Dispatch::Pending);
        assert_eq!(kernel.scheduler().next, Some(2));
        assert!(kernel.scheduler().ready.contains(1));
        assert_eq!(service_switch(&mut kernel), Some(2));
    }

    #[test]
    fn schedule_with_nothing_ready_keeps_current() {
        let mut kernel = booted();
        kernel.start().unwrap();
        assert_eq!(kernel.scheduler().current, Some(crate::config::IDLE_PID));
        assert_eq!(kernel.schedule().unwrap(), Dispatch::Nothing);
        assert!(!kernel.port().context_switch_pending());
    }

    #[test]
    fn switch_context_saves_outgoing_sp() {
        let mut kernel = booted();
        kernel.create(parked, TaskConfig::new(1, 1)).unwrap();
        kernel.start().unwrap();
        kernel.delay(3).unwrap();

        let incoming = kernel.scheduler().task(0).unwrap().stack_ptr;
        assert_eq!(kernel.switch_context(0x2000_1234), Some(incoming));
        assert_eq!(kernel.scheduler().task(1).unwrap().stack_ptr, 0x2000_1234);
    }

    #[test]
    fn preemption_rule() {
        let mut kernel = booted();
        kernel.create(parked, TaskConfig::new(1, 3)).unwrap();
        kernel.create(parked, TaskConfig::new(2, 3)).unwrap();
        kernel.start().unwrap();

        // Equal level with slice left: keep running.
        assert_eq!(kernel.switch_context(0), None);
        assert_eq!(kernel.scheduler().current, Some(1));

        // Equal level, slice used up: rotate.
        kernel.scheduler.task_mut(1).unwrap().slice_remaining = 0;
        let sp = kernel.switch_context(0);
        assert_eq!(sp, Some(kernel.scheduler().task(2).unwrap().stack_ptr));
        assert_eq!(kernel.scheduler().current, Some(2));
        assert_eq!(kernel.scheduler().task(1).unwrap().state, ProcessState::Ready);
    }

    #[test]
    fn lower_priority_never_preempts() {
        let mut kernel = booted();
        kernel.create(parked, TaskConfig::new(1, 4)).unwrap();
        kernel.create(parked, TaskConfig::new(2, 2)).unwrap();
        kernel.start().unwrap();
        kernel.scheduler.task_mut(1).unwrap().slice_remaining = 0;

        assert_eq!(kernel.switch_context(0), None);
        assert_eq!(kernel.scheduler().current, Some(1));
    }

    #[test]
    fn zero_delay_yields() {
        let mut kernel = booted();
        kernel.create(parked, TaskConfig::new(1, 1)).unwrap();
        kernel.create(parked, TaskConfig::new(2, 1)).unwrap();
        kernel.start().unwrap();

        kernel.delay(0).unwrap();
        assert_eq!(kernel.scheduler().task(1).unwrap().state, ProcessState::Ready);
        assert_eq!(service_switch(&mut kernel), Some(2));
    }

    #[test]
    fn dispatch_maps_task_stack() {
        let mut kernel = booted();
        kernel.create(parked, TaskConfig::new(1, 1)).unwrap();
        kernel.start().unwrap();
        let base = kernel.scheduler().task(1).unwrap().stack.base;
        assert_eq!(kernel.port().region(mpu::REGION_STACK).rbar, base as u32);
        assert!(kernel.port().region(mpu::REGION_STACK).enabled());
    }
}
