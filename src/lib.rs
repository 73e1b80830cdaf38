//! # Warden
//!
//! A preemptive, priority-based RTOS kernel for ARM Cortex-M4
//! microcontrollers with a Memory Protection Unit.
//!
//! ## Overview
//!
//! Every task is confined by the MPU to its own stack (and an optional
//! private heap). Both are carved from a single arena by a first-fit block
//! allocator, sized and aligned so that each allocation maps onto exactly
//! one MPU region. The scheduler keeps one FIFO per priority level and a
//! bitmap of non-empty levels; a protection fault suspends only the task
//! that caused it.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    Application Tasks                   │
//! ├────────────────────────────────────────────────────────┤
//! │                 Kernel API (kernel.rs)                 │
//! │   mem_init · process_create · os_delay · timer_tick    │
//! ├──────────────┬──────────────┬──────────────┬───────────┤
//! │  Scheduler   │  Dispatch    │  Timer/Fault │   Sync    │
//! │ scheduler.rs │  process.rs  │  timer.rs    │  sync.rs  │
//! │  ─ bitmap    │  ─ create    │  fault.rs    │           │
//! │  ─ queues    │  ─ schedule  │  ─ wakeups   │           │
//! ├──────────────┴──────────────┴──────────────┴───────────┤
//! │   Memory (memory/)           │   MPU (mpu.rs)          │
//! │   ─ block allocator          │   ─ static regions      │
//! │   ─ region-size codec        │   ─ per-task regions    │
//! ├──────────────────────────────┴─────────────────────────┤
//! │      Arch Port (arch/): Port trait · Cortex-M4 · sim   │
//! ├────────────────────────────────────────────────────────┤
//! │           ARM Cortex-M4 Hardware (Thumb-2)             │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Memory Model
//!
//! - **One arena**: `HEAP_SIZE` bytes, page-aligned, statically reserved
//! - **No `alloc`**: pure `core`; the process table and ready queues are
//!   fixed-capacity
//! - **Critical sections**: all shared kernel state sits behind a
//!   `critical_section::Mutex`
//!
//! ## Host builds
//!
//! Off-target the kernel runs against [`arch::sim::SimPort`], a software
//! register file, so the allocator, MPU programming and scheduler are all
//! unit-tested on the development machine.

#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod config;
pub mod error;
pub mod fault;
pub mod kernel;
pub mod memory;
pub mod mpu;
mod process;
pub mod resource;
pub mod scheduler;
pub mod sync;
pub mod task;
pub mod timer;

pub use error::{KernelError, KernelResult};
pub use kernel::{Dispatch, Kernel, Stage};
