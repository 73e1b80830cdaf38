//! # Warden Configuration
//!
//! Compile-time constants governing the kernel. All limits are fixed at
//! compile time; the only dynamic memory is the block allocator's arena.

use static_assertions::const_assert;

/// Number of slots in the process table. A task's pid is its slot index.
pub const MAX_PROCESSES: usize = 8;

/// Number of priority levels. Level 0 is the lowest and belongs to the
/// idle task; `MAX_PRIORITY - 1` is the highest.
pub const MAX_PRIORITY: usize = 8;

/// Per-task stack size in 32-bit words. The byte size must be a power of
/// two so the whole stack maps onto a single MPU region.
pub const STACK_SIZE: usize = 256;

/// Per-task stack size in bytes.
pub const STACK_SIZE_BYTES: usize = STACK_SIZE * 4;

/// Size of the allocator arena in bytes. Task stacks and per-task heaps
/// are carved out of it.
pub const HEAP_SIZE: usize = 32 * 1024;

/// Alignment of the arena itself.
pub const ARENA_ALIGN: usize = 4096;

/// Number of resource classes tracked per task.
pub const NUM_RESOURCES: usize = 3;

/// Time slice in ticks granted to a task each time it is switched in.
pub const DEFAULT_TIME_SLICE: u32 = 5;

/// SysTick frequency in Hz.
pub const TICK_HZ: u32 = 1000;

/// System clock frequency in Hz (STM32F4 at 16 MHz HSI).
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;

/// Pid reserved for the idle task created by `process_init`.
pub const IDLE_PID: usize = 0;

const_assert!(MAX_PRIORITY <= 32);
const_assert!(MAX_PROCESSES > IDLE_PID);
const_assert!(STACK_SIZE_BYTES.is_power_of_two());
const_assert!(HEAP_SIZE % ARENA_ALIGN == 0);
