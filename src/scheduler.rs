//! # Scheduler
//!
//! Process table, ready queues and the priority bitmap.
//!
//! ## Ready set
//!
//! One FIFO per priority level (0 = lowest) and a 32-bit bitmap with bit
//! `p` set exactly when FIFO `p` is non-empty. Every mutation of a FIFO
//! goes through [`ReadyQueues`], which keeps the two in step, so the
//! highest runnable level is one `leading_zeros` away.
//!
//! ## Selection
//!
//! [`Scheduler::pick_highest_ready`] takes the head of the highest
//! non-empty level. Ties within a level run in the order they became
//! ready. There is no aging: a busy high level starves lower ones.
//!
//! Dispatch policy (when to requeue the running task, when to switch)
//! lives on [`Kernel`](crate::kernel::Kernel); this module only owns the
//! data structures.

use heapless::Deque;

use crate::config::{MAX_PRIORITY, MAX_PROCESSES};
use crate::error::{KernelError, KernelResult};
use crate::task::{Pcb, Pid, ProcessState};

// ---------------------------------------------------------------------------
// Priority bitmap
// ---------------------------------------------------------------------------

/// One bit per priority level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PriorityBitmap(u32);

impl PriorityBitmap {
    /// No level set.
    pub const fn new() -> Self {
        Self(0)
    }

    /// Mark `level` non-empty.
    #[inline]
    pub fn set(&mut self, level: u8) {
        self.0 |= 1 << level;
    }

    /// Mark `level` empty.
    #[inline]
    pub fn clear(&mut self, level: u8) {
        self.0 &= !(1 << level);
    }

    /// Whether `level` is marked non-empty.
    #[inline]
    pub fn is_set(&self, level: u8) -> bool {
        self.0 & (1 << level) != 0
    }

    /// Highest set level.
    #[inline]
    pub fn highest(&self) -> Option<u8> {
        match self.0 {
            0 => None,
            bits => Some((31 - bits.leading_zeros()) as u8),
        }
    }

    /// No level set.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Raw bitmap word.
    #[inline]
    pub fn bits(&self) -> u32 {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Ready queues
// ---------------------------------------------------------------------------

type ReadyFifo = Deque<Pid, MAX_PROCESSES>;

/// Per-level FIFOs plus the bitmap summarizing them.
#[derive(Debug)]
pub struct ReadyQueues {
    levels: [ReadyFifo; MAX_PRIORITY],
    bitmap: PriorityBitmap,
}

impl Default for ReadyQueues {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyQueues {
    /// All levels empty.
    pub const fn new() -> Self {
        const EMPTY: ReadyFifo = Deque::new();
        Self {
            levels: [EMPTY; MAX_PRIORITY],
            bitmap: PriorityBitmap::new(),
        }
    }

    /// Level a priority is queued at.
    #[inline]
    pub fn level_for(priority: u8) -> u8 {
        priority.min((MAX_PRIORITY - 1) as u8)
    }

    /// Append `pid` at `priority` (clamped to the highest level).
    pub fn push(&mut self, pid: Pid, priority: u8) -> KernelResult<u8> {
        let level = Self::level_for(priority);
        self.levels[usize::from(level)]
            .push_back(pid)
            .map_err(|_| KernelError::ReadyQueueFull(level))?;
        self.bitmap.set(level);
        Ok(level)
    }

    /// Put `pid` back at the head of its level, ahead of older entries.
    pub fn push_front(&mut self, pid: Pid, priority: u8) -> KernelResult<u8> {
        let level = Self::level_for(priority);
        self.levels[usize::from(level)]
            .push_front(pid)
            .map_err(|_| KernelError::ReadyQueueFull(level))?;
        self.bitmap.set(level);
        Ok(level)
    }

    /// Dequeue the oldest entry of the highest non-empty level.
    pub fn pop_highest(&mut self) -> Option<Pid> {
        let level = self.bitmap.highest()?;
        let fifo = &mut self.levels[usize::from(level)];
        let pid = fifo.pop_front();
        if fifo.is_empty() {
            self.bitmap.clear(level);
        }
        pid
    }

    /// Highest non-empty level.
    #[inline]
    pub fn highest_level(&self) -> Option<u8> {
        self.bitmap.highest()
    }

    /// Snapshot of the occupancy bitmap.
    #[inline]
    pub fn bitmap(&self) -> PriorityBitmap {
        self.bitmap
    }

    /// Number of tasks queued at `level`.
    pub fn level_len(&self, level: u8) -> usize {
        self.levels.get(usize::from(level)).map_or(0, |fifo| fifo.len())
    }

    /// Whether `pid` is queued at any level.
    pub fn contains(&self, pid: Pid) -> bool {
        self.levels.iter().any(|fifo| fifo.iter().any(|&p| p == pid))
    }

    /// Drop `pid` from `priority`'s level, keeping the order of the rest.
    /// Returns whether it was queued there.
    pub fn remove(&mut self, pid: Pid, priority: u8) -> bool {
        let level = Self::level_for(priority);
        let fifo = &mut self.levels[usize::from(level)];
        let mut found = false;
        for _ in 0..fifo.len() {
            match fifo.pop_front() {
                Some(p) if p == pid => found = true,
                // Room is guaranteed: one entry was just popped.
                Some(p) => {
                    let _ = fifo.push_back(p);
                }
                None => break,
            }
        }
        if fifo.is_empty() {
            self.bitmap.clear(level);
        }
        found
    }

    /// Nothing queued at any level.
    pub fn is_empty(&self) -> bool {
        self.bitmap.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Scheduler state
// ---------------------------------------------------------------------------

/// Process table and scheduling state.
///
/// All tasks live inline in a fixed array indexed by pid. `current` is the
/// task whose context is loaded; `next` is a task chosen by
/// [`Kernel::schedule`](crate::kernel::Kernel::schedule) that the pending
/// context switch has not yet loaded.
#[derive(Debug)]
pub struct Scheduler {
    /// Process table. `None` marks a free slot.
    pub tasks: [Option<Pcb>; MAX_PROCESSES],
    /// Ready set.
    pub ready: ReadyQueues,
    /// Task whose context is loaded.
    pub current: Option<Pid>,
    /// Task selected for the next context switch.
    pub next: Option<Pid>,
    /// Ticks since start. Wraps.
    pub tick_count: u32,
    /// Number of occupied slots.
    pub task_count: usize,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Empty table, nothing running, tick zero.
    pub const fn new() -> Self {
        Self {
            tasks: [None; MAX_PROCESSES],
            ready: ReadyQueues::new(),
            current: None,
            next: None,
            tick_count: 0,
            task_count: 0,
        }
    }

    /// PCB for `pid`, if the slot is occupied.
    pub fn task(&self, pid: Pid) -> Option<&Pcb> {
        self.tasks.get(pid).and_then(Option::as_ref)
    }

    /// Mutable PCB for `pid`, if the slot is occupied.
    pub fn task_mut(&mut self, pid: Pid) -> Option<&mut Pcb> {
        self.tasks.get_mut(pid).and_then(Option::as_mut)
    }

    /// PCB of the task whose context is loaded.
    pub fn current_task(&self) -> Option<&Pcb> {
        self.current.and_then(|pid| self.task(pid))
    }

    /// Mutable PCB of the task whose context is loaded.
    pub fn current_task_mut(&mut self) -> Option<&mut Pcb> {
        let pid = self.current?;
        self.task_mut(pid)
    }

    /// Place a new PCB in its slot.
    pub fn insert(&mut self, pcb: Pcb) -> KernelResult<()> {
        let slot = self
            .tasks
            .get_mut(pcb.pid)
            .ok_or(KernelError::InvalidPid(pcb.pid))?;
        if slot.is_some() {
            return Err(KernelError::PidInUse(pcb.pid));
        }
        *slot = Some(pcb);
        self.task_count += 1;
        Ok(())
    }

    /// Empty the slot for `pid`. The task must not be queued or running.
    pub fn remove(&mut self, pid: Pid) -> Option<Pcb> {
        let pcb = self.tasks.get_mut(pid)?.take()?;
        self.task_count -= 1;
        Some(pcb)
    }

    /// Mark `pid` READY and append it to its priority's FIFO.
    pub fn add_to_ready(&mut self, pid: Pid) -> KernelResult<()> {
        let pcb = self
            .tasks
            .get_mut(pid)
            .and_then(Option::as_mut)
            .ok_or(KernelError::InvalidPid(pid))?;
        let level = self.ready.push(pid, pcb.priority())?;
        pcb.state = ProcessState::Ready;
        log::trace!("sched: task {} ready at level {}", pid, level);
        Ok(())
    }

    /// Return a task that was picked but never switched in. It keeps its
    /// place at the head of its level.
    pub fn return_to_ready(&mut self, pid: Pid) -> KernelResult<()> {
        let pcb = self
            .tasks
            .get_mut(pid)
            .and_then(Option::as_mut)
            .ok_or(KernelError::InvalidPid(pid))?;
        self.ready.push_front(pid, pcb.priority())?;
        pcb.state = ProcessState::Ready;
        Ok(())
    }

    /// Live tasks in pid order.
    pub fn tasks(&self) -> impl Iterator<Item = &Pcb> {
        self.tasks.iter().flatten()
    }

    /// Take `pid` out of the ready set. Returns whether it was queued.
    pub fn remove_from_ready(&mut self, pid: Pid) -> bool {
        match self.task(pid) {
            Some(pcb) => {
                let priority = pcb.priority();
                self.ready.remove(pid, priority)
            }
            None => false,
        }
    }

    /// Dequeue the head of the highest non-empty level.
    ///
    /// Entries whose task is no longer READY are discarded on the way.
    pub fn pick_highest_ready(&mut self) -> Option<Pid> {
        while let Some(pid) = self.ready.pop_highest() {
            match self.task(pid).map(|pcb| pcb.state) {
                Some(ProcessState::Ready) => return Some(pid),
                state => log::warn!("sched: dropping queued task {} in state {:?}", pid, state),
            }
        }
        None
    }

    /// Priority of the running task, if any.
    pub fn current_priority(&self) -> Option<u8> {
        self.current_task().map(Pcb::priority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::tests::parked;
    use crate::task::{MemoryRegion, TaskConfig};
    use quickcheck_macros::quickcheck;

    fn pcb(pid: Pid, priority: u8) -> Pcb {
        let stack = MemoryRegion { base: 0x2000_0000 + pid * 0x800, size: 1024 };
        Pcb::new(&TaskConfig::new(pid, priority), parked, stack, None, 0)
    }

    fn scheduler_with(priorities: &[(Pid, u8)]) -> Scheduler {
        let mut sched = Scheduler::new();
        for &(pid, priority) in priorities {
            sched.insert(pcb(pid, priority)).unwrap();
            sched.add_to_ready(pid).unwrap();
        }
        sched
    }

    #[test]
    fn bitmap_highest() {
        let mut bitmap = PriorityBitmap::new();
        assert_eq!(bitmap.highest(), None);
        bitmap.set(0);
        bitmap.set(5);
        assert_eq!(bitmap.highest(), Some(5));
        bitmap.clear(5);
        assert_eq!(bitmap.highest(), Some(0));
        assert!(bitmap.is_set(0));
        assert!(!bitmap.is_set(5));
    }

    #[test]
    fn higher_priority_first_then_creation_order() {
        let mut sched = scheduler_with(&[(1, 1), (2, 1), (3, 2)]);

        assert_eq!(sched.pick_highest_ready(), Some(3));
        assert_eq!(sched.pick_highest_ready(), Some(1));
        assert_eq!(sched.pick_highest_ready(), Some(2));
        assert_eq!(sched.pick_highest_ready(), None);
        assert!(sched.ready.bitmap().is_empty());
    }

    #[test]
    fn oversized_priority_is_clamped() {
        let mut sched = scheduler_with(&[(1, 200), (2, (MAX_PRIORITY - 1) as u8)]);
        let top = (MAX_PRIORITY - 1) as u8;

        assert_eq!(sched.ready.highest_level(), Some(top));
        assert_eq!(sched.ready.level_len(top), 2);
        assert_eq!(sched.pick_highest_ready(), Some(1));
        assert_eq!(sched.pick_highest_ready(), Some(2));
    }

    #[test]
    fn bit_clears_only_when_level_drains() {
        let mut sched = scheduler_with(&[(1, 3), (2, 3)]);
        sched.pick_highest_ready();
        assert!(sched.ready.bitmap().is_set(3));
        sched.pick_highest_ready();
        assert!(!sched.ready.bitmap().is_set(3));
    }

    #[test]
    fn returned_task_keeps_its_turn() {
        let mut sched = scheduler_with(&[(1, 2), (2, 2)]);
        let picked = sched.pick_highest_ready().unwrap();
        sched.return_to_ready(picked).unwrap();
        assert_eq!(sched.pick_highest_ready(), Some(1));
        assert_eq!(sched.pick_highest_ready(), Some(2));
    }

    #[test]
    fn removed_task_leaves_order_and_bit_consistent() {
        let mut sched = scheduler_with(&[(1, 2), (2, 2), (3, 2), (4, 1)]);
        assert!(sched.remove_from_ready(2));
        assert!(!sched.remove_from_ready(2));
        assert!(!sched.ready.contains(2));
        assert_eq!(sched.ready.level_len(2), 2);

        assert!(sched.remove_from_ready(4));
        assert!(!sched.ready.bitmap().is_set(1));

        assert_eq!(sched.pick_highest_ready(), Some(1));
        assert_eq!(sched.pick_highest_ready(), Some(3));
        assert_eq!(sched.pick_highest_ready(), None);
    }

    #[test]
    fn pick_skips_tasks_that_are_not_ready() {
        let mut sched = scheduler_with(&[(1, 3), (2, 3), (3, 1)]);
        sched.task_mut(1).unwrap().state = ProcessState::Suspended;
        sched.task_mut(2).unwrap().state = ProcessState::Blocked;

        assert_eq!(sched.pick_highest_ready(), Some(3));
        assert!(sched.ready.is_empty());
    }

    #[test]
    fn add_to_ready_marks_state() {
        let sched = scheduler_with(&[(4, 2)]);
        assert_eq!(sched.task(4).unwrap().state, ProcessState::Ready);
        assert!(sched.ready.contains(4));
    }

    #[test]
    fn insert_rejects_bad_slots() {
        let mut sched = scheduler_with(&[(1, 1)]);
        assert_eq!(sched.insert(pcb(1, 1)), Err(KernelError::PidInUse(1)));
        let mut stray = pcb(1, 1);
        stray.pid = MAX_PROCESSES;
        assert_eq!(sched.insert(stray), Err(KernelError::InvalidPid(MAX_PROCESSES)));
        assert_eq!(sched.add_to_ready(6), Err(KernelError::InvalidPid(6)));
    }

    #[test]
    fn full_level_reports_error() {
        let mut queues = ReadyQueues::new();
        for pid in 0..MAX_PROCESSES {
            queues.push(pid, 1).unwrap();
        }
        assert_eq!(queues.push(0, 1), Err(KernelError::ReadyQueueFull(1)));
        assert_eq!(queues.level_len(1), MAX_PROCESSES);
    }

    /// Random push/pop programs against a sorted reference model.
    #[quickcheck]
    fn bitmap_tracks_fifo_occupancy(ops: Vec<(bool, u8)>) -> bool {
        let mut queues = ReadyQueues::new();
        let mut model: Vec<Vec<Pid>> = vec![Vec::new(); MAX_PRIORITY];
        let mut next_pid = 0;

        for (push, priority) in ops {
            if push {
                let level = usize::from(ReadyQueues::level_for(priority));
                if model[level].len() == MAX_PROCESSES {
                    continue;
                }
                queues.push(next_pid, priority).unwrap();
                model[level].push(next_pid);
                next_pid += 1;
            } else {
                let expected = model
                    .iter_mut()
                    .rev()
                    .find(|fifo| !fifo.is_empty())
                    .map(|fifo| fifo.remove(0));
                if queues.pop_highest() != expected {
                    return false;
                }
            }

            let expected_bits = model
                .iter()
                .enumerate()
                .filter(|(_, fifo)| !fifo.is_empty())
                .fold(0u32, |bits, (level, _)| bits | 1 << level);
            if queues.bitmap().bits() != expected_bits {
                return false;
            }

            for (level, fifo) in model.iter().enumerate() {
                let level = level as u8;
                if queues.bitmap().is_set(level) == fifo.is_empty() {
                    return false;
                }
                if queues.level_len(level) != fifo.len() {
                    return false;
                }
            }
        }
        true
    }
}
