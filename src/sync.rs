//! # Synchronization Primitives
//!
//! Interrupt-safe critical section abstraction. Every access to shared
//! kernel state (free list, process table, ready queues, bitmap) happens
//! inside one of these; there are no other locks in the kernel.
//!
//! On Cortex-M the implementation masks interrupts through PRIMASK
//! (`cortex-m`'s `critical-section-single-core`). On the host the
//! `critical-section` crate's `std` implementation is used instead, which
//! lets the scheduler be tested without hardware.

pub use critical_section::CriticalSection;

/// Execute a closure within a critical section (interrupts disabled).
///
/// Interrupts are disabled on entry and restored on exit, so the closure
/// observes and leaves kernel state atomically with respect to the
/// SysTick, MemManage and PendSV handlers.
///
/// # Usage
/// ```ignore
/// sync::critical_section(|cs| {
///     // Access shared state safely
/// });
/// ```
///
/// # Performance
/// Keep critical sections as short as possible to minimize interrupt latency.
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(CriticalSection<'_>) -> R,
{
    critical_section::with(f)
}
