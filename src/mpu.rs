//! # MPU Configurator
//!
//! Programs the ARMv7-M Memory Protection Unit.
//!
//! ## Region layout
//!
//! | Region | Contents              | Programmed by           |
//! |--------|-----------------------|-------------------------|
//! | 0      | Kernel code           | [`init_kernel_regions`] |
//! | 1      | Running task's stack  | [`configure_for_task`]  |
//! | 2      | Running task's heap   | [`configure_for_task`]  |
//! | 3      | Peripherals           | [`init_kernel_regions`] |
//! | 4      | System Control Space  | [`init_kernel_regions`] |
//!
//! The MPU runs with PRIVDEFENA set, so privileged code falls back to the
//! default memory map for anything outside these regions.
//!
//! Every sequence that changes active mappings ends with DSB + ISB.

use bitflags::bitflags;

use crate::arch::{Port, Register, MPU_CTRL_ENABLE, MPU_CTRL_PRIVDEFENA, SHCSR_MEMFAULTENA};
use crate::error::{KernelError, KernelResult};
use crate::memory::region::{alignment_for, region_encoding};
use crate::task::Pcb;

/// Region holding kernel code.
pub const REGION_KERNEL: u8 = 0;
/// Region holding the running task's stack.
pub const REGION_STACK: u8 = 1;
/// Region holding the running task's private heap.
pub const REGION_HEAP: u8 = 2;
/// Region covering the peripheral space.
pub const REGION_PERIPHERALS: u8 = 3;
/// Region covering the System Control Space.
pub const REGION_SCS: u8 = 4;

const RASR_SIZE_SHIFT: u32 = 1;
const RASR_TEX_SHIFT: u32 = 19;
const RASR_AP_SHIFT: u32 = 24;
const RBAR_ADDR_MASK: u32 = !0x1F;

// ---------------------------------------------------------------------------
// Region descriptors
// ---------------------------------------------------------------------------

bitflags! {
    /// Single-bit RASR fields.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionAttributes: u32 {
        /// Region enable.
        const ENABLE = 1 << 0;
        /// B bit.
        const BUFFERABLE = 1 << 16;
        /// C bit.
        const CACHEABLE = 1 << 17;
        /// S bit.
        const SHAREABLE = 1 << 18;
        /// Instruction fetches fault.
        const EXECUTE_NEVER = 1 << 28;
    }
}

/// RASR AP field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AccessPermission {
    /// No access at any privilege level.
    NoAccess = 0b000,
    /// Privileged read-write, unprivileged no access.
    PrivilegedOnly = 0b001,
    /// Privileged read-write, unprivileged read-only.
    UnprivilegedReadOnly = 0b010,
    /// Read-write at every privilege level.
    FullAccess = 0b011,
}

/// RASR TEX field. Combined with C and B it selects the memory type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemoryType {
    /// TEX=000: strongly-ordered, device or write-through normal memory,
    /// depending on C/B.
    Ordered = 0b000,
    /// TEX=001: normal memory (non-cacheable with C=B=0, write-back with
    /// C=B=1).
    Normal = 0b001,
}

/// One MPU region as written to RBAR/RASR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionDescriptor {
    /// Region number (RNR).
    pub number: u8,
    /// Base address. Must be aligned to the region size.
    pub base: u32,
    /// RASR SIZE field.
    pub size_bits: u8,
    /// Access permissions.
    pub access: AccessPermission,
    /// TEX field.
    pub memory: MemoryType,
    /// Remaining single-bit attributes, including ENABLE.
    pub attributes: RegionAttributes,
}

impl RegionDescriptor {
    /// RASR word for this descriptor.
    pub const fn rasr(&self) -> u32 {
        self.attributes.bits()
            | ((self.access as u32) << RASR_AP_SHIFT)
            | ((self.memory as u32) << RASR_TEX_SHIFT)
            | (((self.size_bits & 0x1F) as u32) << RASR_SIZE_SHIFT)
    }

    /// RBAR word for this descriptor (address bits only).
    pub const fn rbar(&self) -> u32 {
        self.base & RBAR_ADDR_MASK
    }

    fn program<P: Port>(&self, port: &mut P) {
        port.write(Register::MpuRnr, u32::from(self.number));
        port.write(Register::MpuRbar, self.rbar());
        port.write(Register::MpuRasr, self.rasr());
    }
}

fn disable_region<P: Port>(port: &mut P, number: u8) {
    port.write(Register::MpuRnr, u32::from(number));
    port.write(Register::MpuRasr, 0);
}

// ---------------------------------------------------------------------------
// Memory map
// ---------------------------------------------------------------------------

/// Static regions for one board's address layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMap {
    /// Start of kernel code.
    pub kernel_base: u32,
    /// SIZE field for the kernel region.
    pub kernel_size_bits: u8,
    /// Start of the peripheral space.
    pub peripheral_base: u32,
    /// SIZE field for the peripheral region.
    pub peripheral_size_bits: u8,
    /// Start of the System Control Space.
    pub scs_base: u32,
    /// SIZE field for the System Control Space region.
    pub scs_size_bits: u8,
}

impl MemoryMap {
    /// Code in on-chip flash at `0x0800_0000` (STM32F4).
    pub const FLASH: Self = Self {
        kernel_base: 0x0800_0000,
        kernel_size_bits: 18,
        peripheral_base: 0x4000_0000,
        peripheral_size_bits: 28,
        scs_base: 0xE000_0000,
        scs_size_bits: 28,
    };

    /// Code at address zero, as laid out by emulators.
    pub const EMULATED: Self = Self {
        kernel_base: 0x0000_0000,
        ..Self::FLASH
    };

    /// Map selected by the `qemu` feature.
    #[cfg(feature = "qemu")]
    pub const DEFAULT: Self = Self::EMULATED;
    /// Map selected by the `qemu` feature.
    #[cfg(not(feature = "qemu"))]
    pub const DEFAULT: Self = Self::FLASH;

    /// Descriptors for the kernel, peripheral and SCS regions.
    pub const fn static_regions(&self) -> [RegionDescriptor; 3] {
        let device = RegionAttributes::ENABLE
            .union(RegionAttributes::EXECUTE_NEVER)
            .union(RegionAttributes::BUFFERABLE)
            .union(RegionAttributes::SHAREABLE);
        [
            RegionDescriptor {
                number: REGION_KERNEL,
                base: self.kernel_base,
                size_bits: self.kernel_size_bits,
                access: AccessPermission::UnprivilegedReadOnly,
                memory: MemoryType::Ordered,
                attributes: RegionAttributes::ENABLE.union(RegionAttributes::CACHEABLE),
            },
            RegionDescriptor {
                number: REGION_PERIPHERALS,
                base: self.peripheral_base,
                size_bits: self.peripheral_size_bits,
                access: AccessPermission::FullAccess,
                memory: MemoryType::Ordered,
                attributes: device,
            },
            RegionDescriptor {
                number: REGION_SCS,
                base: self.scs_base,
                size_bits: self.scs_size_bits,
                access: AccessPermission::FullAccess,
                memory: MemoryType::Ordered,
                attributes: device,
            },
        ]
    }
}

impl Default for MemoryMap {
    fn default() -> Self {
        Self::DEFAULT
    }
}

// ---------------------------------------------------------------------------
// Task regions
// ---------------------------------------------------------------------------

/// Stack region: normal non-cacheable memory, read-write, never executable.
pub fn stack_region(base: usize, size: usize) -> RegionDescriptor {
    RegionDescriptor {
        number: REGION_STACK,
        base: base as u32,
        size_bits: region_encoding(size),
        access: AccessPermission::FullAccess,
        memory: MemoryType::Normal,
        attributes: RegionAttributes::ENABLE | RegionAttributes::EXECUTE_NEVER,
    }
}

/// Heap region: normal write-back memory, read-write, never executable.
pub fn heap_region(base: usize, size: usize) -> RegionDescriptor {
    RegionDescriptor {
        number: REGION_HEAP,
        base: base as u32,
        size_bits: region_encoding(size),
        access: AccessPermission::FullAccess,
        memory: MemoryType::Normal,
        attributes: RegionAttributes::ENABLE
            | RegionAttributes::EXECUTE_NEVER
            | RegionAttributes::CACHEABLE
            | RegionAttributes::BUFFERABLE,
    }
}

fn check_alignment(base: usize, size: usize) -> KernelResult<()> {
    let alignment = alignment_for(size);
    if alignment == usize::MAX || base % alignment != 0 {
        return Err(KernelError::MisalignedRegion { base, alignment });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Configuration sequences
// ---------------------------------------------------------------------------

fn enable<P: Port>(port: &mut P) {
    port.write(Register::MpuCtrl, MPU_CTRL_ENABLE | MPU_CTRL_PRIVDEFENA);
    port.barrier();
}

/// Program the static regions, enable MemManage faults and turn the MPU on.
pub fn init_kernel_regions<P: Port>(port: &mut P, map: &MemoryMap) {
    port.write(Register::MpuCtrl, 0);
    port.data_barrier();

    for region in map.static_regions() {
        region.program(port);
    }

    port.modify(Register::Shcsr, |shcsr| shcsr | SHCSR_MEMFAULTENA);
    enable(port);

    log::info!(
        "mpu: kernel {:#010x}, peripherals {:#010x}, scs {:#010x}",
        map.kernel_base,
        map.peripheral_base,
        map.scs_base
    );
}

/// Reprogram the stack and heap regions for `task`.
///
/// A misaligned region is left disabled and reported; the other region is
/// still programmed and the MPU is re-enabled either way so the static
/// regions stay enforced.
pub fn configure_for_task<P: Port>(port: &mut P, task: &Pcb) -> KernelResult<()> {
    port.write(Register::MpuCtrl, 0);
    port.data_barrier();

    let mut result = Ok(());

    match check_alignment(task.stack.base, task.stack.size) {
        Ok(()) => stack_region(task.stack.base, task.stack.size).program(port),
        Err(e) => {
            log::error!("mpu: task {} stack: {}", task.pid, e);
            disable_region(port, REGION_STACK);
            result = Err(e);
        }
    }

    match task.heap {
        Some(heap) => match check_alignment(heap.base, heap.size) {
            Ok(()) => heap_region(heap.base, heap.size).program(port),
            Err(e) => {
                log::error!("mpu: task {} heap: {}", task.pid, e);
                disable_region(port, REGION_HEAP);
                result = result.and(Err(e));
            }
        },
        None => disable_region(port, REGION_HEAP),
    }

    enable(port);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimPort;
    use crate::task::tests::parked;
    use crate::task::{MemoryRegion, TaskConfig};

    fn task(stack_base: usize, heap: Option<MemoryRegion>) -> Pcb {
        let stack = MemoryRegion { base: stack_base, size: 1024 };
        Pcb::new(&TaskConfig::new(1, 1), parked, stack, heap, stack_base + 960)
    }

    #[test]
    fn rasr_matches_field_layout() {
        let [kernel, peripherals, scs] = MemoryMap::FLASH.static_regions();
        // XN=0 AP=010 TEX=000 C=1 B=0 S=0 SIZE=18 EN=1
        assert_eq!(kernel.rasr(), (2 << 24) | (1 << 17) | (18 << 1) | 1);
        // XN=1 AP=011 TEX=000 C=0 B=1 S=1 SIZE=28 EN=1
        let device = (1 << 28) | (3 << 24) | (1 << 18) | (1 << 16) | (28 << 1) | 1;
        assert_eq!(peripherals.rasr(), device);
        assert_eq!(scs.rasr(), device);
    }

    #[test]
    fn task_region_attributes() {
        let stack = stack_region(0x2000_0800, 1024);
        assert_eq!(stack.rasr(), (1 << 28) | (3 << 24) | (1 << 19) | (10 << 1) | 1);
        let heap = heap_region(0x2000_1000, 4096);
        assert_eq!(
            heap.rasr(),
            (1 << 28) | (3 << 24) | (1 << 19) | (1 << 17) | (1 << 16) | (12 << 1) | 1
        );
    }

    #[test]
    fn kernel_regions_enable_mpu_and_memfault() {
        let mut port = SimPort::new();
        init_kernel_regions(&mut port, &MemoryMap::FLASH);

        assert_eq!(port.read(Register::MpuCtrl), MPU_CTRL_ENABLE | MPU_CTRL_PRIVDEFENA);
        assert_ne!(port.read(Register::Shcsr) & SHCSR_MEMFAULTENA, 0);
        assert_eq!(port.region(REGION_KERNEL).rbar, 0x0800_0000);
        assert_eq!(port.region(REGION_PERIPHERALS).rbar, 0x4000_0000);
        assert_eq!(port.region(REGION_SCS).rbar, 0xE000_0000);
        assert!(port.region(REGION_KERNEL).enabled());
        assert!(!port.region(REGION_STACK).enabled());
        let (dsb, isb) = port.barriers();
        assert!(dsb >= 2);
        assert_eq!(isb, 1);
    }

    #[test]
    fn emulated_map_only_moves_kernel_code() {
        let mut port = SimPort::new();
        init_kernel_regions(&mut port, &MemoryMap::EMULATED);
        assert_eq!(port.region(REGION_KERNEL).rbar, 0);
        assert_eq!(
            port.region(REGION_KERNEL).rasr,
            MemoryMap::FLASH.static_regions()[0].rasr()
        );
    }

    #[test]
    fn task_regions_programmed() {
        let mut port = SimPort::new();
        let heap = MemoryRegion { base: 0x2000_4000, size: 4096 };
        configure_for_task(&mut port, &task(0x2000_0800, Some(heap))).unwrap();

        assert_eq!(port.region(REGION_STACK).rbar, 0x2000_0800);
        assert_eq!(port.region(REGION_STACK).rasr, stack_region(0x2000_0800, 1024).rasr());
        assert_eq!(port.region(REGION_HEAP).rbar, 0x2000_4000);
        assert!(port.region(REGION_HEAP).enabled());
        assert_eq!(port.read(Register::MpuCtrl), MPU_CTRL_ENABLE | MPU_CTRL_PRIVDEFENA);
    }

    #[test]
    fn task_without_heap_disables_previous_heap_region() {
        let mut port = SimPort::new();
        let heap = MemoryRegion { base: 0x2000_4000, size: 4096 };
        configure_for_task(&mut port, &task(0x2000_0800, Some(heap))).unwrap();
        configure_for_task(&mut port, &task(0x2000_1000, None)).unwrap();

        assert!(!port.region(REGION_HEAP).enabled());
        assert_eq!(port.region(REGION_STACK).rbar, 0x2000_1000);
    }

    #[test]
    fn misaligned_stack_fails_open() {
        let mut port = SimPort::new();
        configure_for_task(&mut port, &task(0x2000_0800, None)).unwrap();

        let err = configure_for_task(&mut port, &task(0x2000_0400, None)).unwrap_err();
        assert_eq!(
            err,
            KernelError::MisalignedRegion { base: 0x2000_0400, alignment: 2048 }
        );
        assert!(!port.region(REGION_STACK).enabled());
        assert_eq!(port.read(Register::MpuCtrl), MPU_CTRL_ENABLE | MPU_CTRL_PRIVDEFENA);
    }
}
