//! Timer tick.
//!
//! Runs from the SysTick handler at `TICK_HZ`. Advances the tick counter,
//! charges the running task's slice, wakes sleepers and pends at most one
//! context switch: always after a wakeup, and after slice expiry only when
//! a task of equal or higher level is waiting.

use crate::arch::Port;
use crate::kernel::{Kernel, Stage};
use crate::resource::ResourcePolicy;
use crate::scheduler::ReadyQueues;
use crate::task::ProcessState;

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickOutcome {
    /// Tasks moved from BLOCKED to READY.
    pub woken: usize,
    /// Whether a context switch was pended.
    pub switch_requested: bool,
}

/// Whether `wake` has been reached at `now`, treating the counter as
/// wrapping. Valid for delays shorter than half the counter range.
#[inline]
pub(crate) fn deadline_reached(now: u32, wake: u32) -> bool {
    (now.wrapping_sub(wake) as i32) >= 0
}

impl<P: Port, R: ResourcePolicy> Kernel<P, R> {
    /// Advance time by one tick.
    pub fn timer_tick(&mut self) -> TickOutcome {
        let now = self.scheduler.tick_count.wrapping_add(1);
        self.scheduler.tick_count = now;

        if self.stage != Stage::Running {
            return TickOutcome::default();
        }

        let mut slice_expired = false;
        if let Some(running) = self.scheduler.current_task_mut() {
            if running.state == ProcessState::Running {
                running.total_cpu_runtime = running.total_cpu_runtime.wrapping_add(1);
                running.slice_remaining = running.slice_remaining.saturating_sub(1);
                slice_expired = running.slice_remaining == 0;
            }
        }

        let mut woken = 0;
        for slot in 0..self.scheduler.tasks.len() {
            let wake = match self.scheduler.task(slot) {
                Some(pcb) if pcb.state == ProcessState::Blocked => pcb.wake_up_tick,
                _ => continue,
            };
            if !deadline_reached(now, wake) {
                continue;
            }
            match self.scheduler.add_to_ready(slot) {
                Ok(()) => {
                    woken += 1;
                    log::trace!("timer: task {} woke at tick {}", slot, now);
                }
                Err(e) => log::error!("timer: cannot wake task {}: {}", slot, e),
            }
        }

        // A wakeup always pends; PendSV keeps the running task if it still
        // outranks everything ready.
        let switch_requested = woken > 0 || (slice_expired && self.preemption_due());
        if switch_requested {
            self.port.pend_context_switch();
        }

        TickOutcome {
            woken,
            switch_requested,
        }
    }

    /// Whether PendSV would replace the running task now.
    fn preemption_due(&self) -> bool {
        let Some(highest) = self.scheduler.ready.highest_level() else {
            return false;
        };
        match self.scheduler.current_task() {
            Some(running) if running.state == ProcessState::Running => {
                let level = ReadyQueues::level_for(running.priority());
                highest > level || (highest == level && running.slice_remaining == 0)
            }
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_TIME_SLICE, IDLE_PID};
    use crate::kernel::tests::{booted, service_switch};
    use crate::task::tests::parked;
    use crate::task::TaskConfig;

    #[test]
    fn wrapping_deadline() {
        assert!(deadline_reached(10, 10));
        assert!(deadline_reached(11, 10));
        assert!(!deadline_reached(9, 10));
        assert!(deadline_reached(2, u32::MAX - 1));
        assert!(!deadline_reached(u32::MAX - 1, 2));
    }

    #[test]
    fn ticks_before_start_only_count() {
        let mut kernel = booted();
        assert_eq!(kernel.timer_tick(), TickOutcome::default());
        assert_eq!(kernel.ticks(), 1);
    }

    #[test]
    fn delayed_task_wakes_exactly_on_time() {
        let mut kernel = booted();
        kernel.create(parked, TaskConfig::new(1, 2)).unwrap();
        kernel.start().unwrap();
        for _ in 0..3 {
            kernel.timer_tick();
        }

        kernel.delay(4).unwrap();
        assert_eq!(kernel.scheduler().task(1).unwrap().wake_up_tick, 7);
        assert_eq!(service_switch(&mut kernel), Some(IDLE_PID));

        for tick in 4..7 {
            let outcome = kernel.timer_tick();
            assert_eq!(kernel.ticks(), tick);
            assert_eq!(outcome.woken, 0);
            assert_eq!(kernel.scheduler().task(1).unwrap().state, ProcessState::Blocked);
        }

        let outcome = kernel.timer_tick();
        assert_eq!(outcome, TickOutcome { woken: 1, switch_requested: true });
        assert_eq!(kernel.scheduler().task(1).unwrap().state, ProcessState::Ready);
        assert_eq!(service_switch(&mut kernel), Some(1));
    }

    #[test]
    fn delay_survives_counter_wrap() {
        let mut kernel = booted();
        kernel.create(parked, TaskConfig::new(1, 2)).unwrap();
        kernel.start().unwrap();
        kernel.scheduler.tick_count = u32::MAX - 1;

        kernel.delay(3).unwrap();
        service_switch(&mut kernel);
        kernel.timer_tick();
        kernel.timer_tick();
        assert_eq!(kernel.scheduler().task(1).unwrap().state, ProcessState::Blocked);
        assert_eq!(kernel.timer_tick().woken, 1);
        assert_eq!(kernel.ticks(), 1);
    }

    #[test]
    fn several_wakeups_pend_once() {
        let mut kernel = booted();
        kernel.create(parked, TaskConfig::new(1, 3)).unwrap();
        kernel.create(parked, TaskConfig::new(2, 3)).unwrap();
        kernel.start().unwrap();

        kernel.delay(1).unwrap();
        service_switch(&mut kernel);
        kernel.delay(1).unwrap();
        assert_eq!(service_switch(&mut kernel), Some(IDLE_PID));

        let outcome = kernel.timer_tick();
        assert_eq!(outcome.woken, 2);
        assert!(outcome.switch_requested);
        assert_eq!(service_switch(&mut kernel), Some(1));
        assert!(!kernel.port().context_switch_pending());
    }

    #[test]
    fn lower_priority_wakeup_pends_but_does_not_preempt() {
        let mut kernel = booted();
        kernel.create(parked, TaskConfig::new(1, 1)).unwrap();
        kernel.start().unwrap();
        kernel.delay(2).unwrap();
        assert_eq!(service_switch(&mut kernel), Some(IDLE_PID));

        kernel.create(parked, TaskConfig::new(2, 4)).unwrap();
        assert_eq!(service_switch(&mut kernel), Some(2));

        assert_eq!(kernel.timer_tick().woken, 0);
        let outcome = kernel.timer_tick();
        assert_eq!(outcome, TickOutcome { woken: 1, switch_requested: true });
        assert_eq!(kernel.scheduler().task(1).unwrap().state, ProcessState::Ready);
        assert_eq!(service_switch(&mut kernel), Some(2));
        assert_eq!(kernel.scheduler().task(2).unwrap().state, ProcessState::Running);
        assert!(kernel.scheduler().ready.contains(1));
    }

    #[test]
    fn slice_expiry_rotates_equal_priority() {
        let mut kernel = booted();
        kernel.create(parked, TaskConfig::new(1, 2)).unwrap();
        kernel.create(parked, TaskConfig::new(2, 2)).unwrap();
        kernel.start().unwrap();

        for _ in 1..DEFAULT_TIME_SLICE {
            assert!(!kernel.timer_tick().switch_requested);
        }
        assert!(kernel.timer_tick().switch_requested);
        assert_eq!(service_switch(&mut kernel), Some(2));

        let runtime = kernel.scheduler().task(1).unwrap().total_cpu_runtime;
        assert_eq!(runtime, DEFAULT_TIME_SLICE);
        assert_eq!(kernel.scheduler().task(2).unwrap().slice_remaining, DEFAULT_TIME_SLICE);
    }

    #[test]
    fn lone_task_keeps_running_after_slice() {
        let mut kernel = booted();
        kernel.create(parked, TaskConfig::new(1, 2)).unwrap();
        kernel.start().unwrap();
        for _ in 0..DEFAULT_TIME_SLICE * 2 {
            assert!(!kernel.timer_tick().switch_requested);
        }
        assert_eq!(kernel.scheduler().current, Some(1));
    }
}
