//! # Warden Demo
//!
//! On a Cortex-M4 target this is the firmware image: it brings the kernel
//! up in order and runs three tasks, one of which deliberately violates
//! its MPU regions and gets suspended.
//!
//! | Task       | Priority | Behaviour                                  |
//! |------------|----------|--------------------------------------------|
//! | `sampler`  | 2        | Short burst of work, sleeps 100 ticks      |
//! | `reporter` | 1        | Logs a heartbeat, sleeps 500 ticks         |
//! | `rogue`    | 3        | Sleeps 1000 ticks, then executes from an   |
//! |            |          | execute-never region                       |
//!
//! On the host the same bring-up runs against the simulated port and a
//! scripted workload, logging every scheduling decision.

#![cfg_attr(all(target_arch = "arm", target_os = "none"), no_std)]
#![cfg_attr(all(target_arch = "arm", target_os = "none"), no_main)]

// ---------------------------------------------------------------------------
// Firmware
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "arm", target_os = "none"))]
mod firmware {
    use cortex_m_rt::entry;
    use panic_halt as _;

    use warden::arch::cortex_m4::{self, CortexM4};
    use warden::kernel;
    use warden::task::TaskConfig;
    use warden::KernelResult;

    extern "C" fn sampler() -> ! {
        let mut acc: u32 = 0;
        loop {
            for i in 0..2_000u32 {
                acc = acc.wrapping_add(i);
            }
            let _ = kernel::os_delay(100);
        }
    }

    extern "C" fn reporter() -> ! {
        let mut beats: u32 = 0;
        loop {
            beats = beats.wrapping_add(1);
            log::info!("reporter: heartbeat {}", beats);
            let _ = kernel::os_delay(500);
        }
    }

    extern "C" fn rogue() -> ! {
        let _ = kernel::os_delay(1000);
        log::warn!("rogue: jumping into the peripheral region");
        // SAFETY: none; this call is meant to raise IACCVIOL.
        let target = unsafe { core::mem::transmute::<usize, extern "C" fn()>(0x4000_0001) };
        target();
        loop {
            cortex_m::asm::nop();
        }
    }

    fn bring_up() -> KernelResult<()> {
        // SAFETY: nothing else touches the MPU or fault registers.
        kernel::init(unsafe { CortexM4::steal() })?;
        kernel::mem_init()?;
        kernel::mpu_init_kernel_regions()?;
        kernel::process_init()?;

        kernel::process_create(sampler, TaskConfig::new(1, 2))?;
        kernel::process_create(reporter, TaskConfig::new(2, 1).with_heap(1024))?;
        kernel::process_create(rogue, TaskConfig::new(3, 3))?;
        Ok(())
    }

    fn halt() -> ! {
        loop {
            cortex_m::asm::wfi();
        }
    }

    #[entry]
    fn main() -> ! {
        cortex_m4::init_logger(log::LevelFilter::Info);

        let Some(core) = cortex_m::Peripherals::take() else {
            halt()
        };
        if let Err(e) = bring_up() {
            log::error!("boot: {}", e);
            halt()
        }
        kernel::launch(core)
    }
}

// ---------------------------------------------------------------------------
// Host simulation
// ---------------------------------------------------------------------------

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
mod simulation {
    use warden::arch::sim::SimPort;
    use warden::fault::Mmfsr;
    use warden::memory::{self, AllocError};
    use warden::task::{Pid, TaskConfig};
    use warden::{Kernel, KernelResult};

    const RUN_TICKS: u32 = 200;
    const FAULT_AT: u32 = 120;

    /// Scripted behaviour of a simulated task: after running `burst` ticks
    /// it sleeps for `sleep` ticks.
    struct Script {
        pid: Pid,
        priority: u8,
        heap: usize,
        burst: u32,
        sleep: u32,
    }

    const SCRIPTS: [Script; 3] = [
        Script { pid: 1, priority: 2, heap: 0, burst: 3, sleep: 10 },
        Script { pid: 2, priority: 1, heap: 2048, burst: 8, sleep: 25 },
        Script { pid: 3, priority: 3, heap: 0, burst: 2, sleep: 30 },
    ];

    /// Pid the simulation makes fault.
    const ROGUE: Pid = 3;

    extern "C" fn simulated() -> ! {
        loop {
            core::hint::spin_loop();
        }
    }

    fn service_switch(kernel: &mut Kernel<SimPort>) {
        if kernel.port_mut().take_pending_switch() {
            let saved = kernel.scheduler().current_task().map_or(0, |pcb| pcb.stack_ptr);
            kernel.switch_context(saved);
        }
    }

    /// Bring the kernel up over `SimPort` and play the scripts.
    pub fn run() -> KernelResult<()> {
        let mut kernel = Kernel::new(SimPort::new());
        kernel.mem_init(memory::take_arena().ok_or(AllocError::InvalidArena)?)?;
        kernel.mpu_init_kernel_regions()?;
        kernel.process_init()?;

        for script in &SCRIPTS {
            let config = TaskConfig::new(script.pid, script.priority).with_heap(script.heap);
            kernel.create(simulated, config)?;
        }

        let sp = kernel.start()?;
        log::info!("sim: entering first task at {:#010x}", sp);

        let mut ran = [0u32; warden::config::MAX_PROCESSES];
        let mut trace = heapless::String::<256>::new();

        for tick in 1..=RUN_TICKS {
            kernel.timer_tick();
            service_switch(&mut kernel);

            let Some(pid) = kernel.scheduler().current else {
                continue;
            };
            if trace.len() < trace.capacity() {
                let _ = trace.push(char::from_digit(pid as u32, 10).unwrap_or('?'));
            }

            if tick == FAULT_AT && pid == ROGUE {
                kernel.port_mut().inject_memory_fault(Mmfsr::DACCVIOL.bits(), Some(0x2000_0000));
                kernel.handle_memory_fault();
                service_switch(&mut kernel);
                continue;
            }

            let Some(script) = SCRIPTS.iter().find(|s| s.pid == pid) else {
                continue;
            };
            ran[pid] += 1;
            if ran[pid] % script.burst == 0 {
                kernel.delay(script.sleep)?;
                service_switch(&mut kernel);
            }
        }

        log::info!("sim: timeline {}", trace);
        for pcb in kernel.scheduler().tasks() {
            log::info!(
                "sim: task {} {} priority {} runtime {} ticks",
                pcb.pid,
                pcb.state,
                pcb.static_priority,
                pcb.total_cpu_runtime
            );
        }
        let stats = kernel.alloc_stats();
        log::info!(
            "sim: {} allocations, {} bytes in use, {} bytes free",
            stats.total_allocations,
            stats.bytes_in_use,
            kernel.allocator().free_bytes()
        );
        Ok(())
    }
}

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(e) = simulation::run() {
        log::error!("sim: {}", e);
        std::process::exit(1);
    }
}
