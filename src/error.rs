use std::path::PathBuf;
use thiserror::Error;

use crate::types::IoWidth;

#[derive(Debug, Error)]
pub enum VMError {
    // Setup
    #[error("Cannot open virtualization device {path:?}: {source}")]
    DeviceUnavailable {
        path: PathBuf,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("KVM API version mismatch: have {actual}, want {expected}")]
    ApiVersionMismatch { expected: i32, actual: i32 },

    #[error("Failed to create VM: {0}")]
    CreateVm(#[source] kvm_ioctls::Error),

    #[error("Failed to create vCPU {id}: {source}")]
    CreateVcpu {
        id: u64,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("Failed to query vCPU run-state buffer size: {0}")]
    VcpuMmapSize(#[source] kvm_ioctls::Error),

    #[error("Failed to set user memory region (slot {slot}): {source}")]
    SetUserMemoryRegion {
        slot: u32,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("Cannot allocate {size:#x} bytes of guest memory: {reason}")]
    MemoryAllocation { size: usize, reason: String },

    #[error("Failed to create in-kernel IRQ chip: {0}")]
    CreateIrqChip(#[source] kvm_ioctls::Error),

    #[error("Failed to create PIT: {0}")]
    CreatePit(#[source] kvm_ioctls::Error),

    // Register transfer
    #[error("Failed to read vCPU registers: {0}")]
    GetRegisters(#[source] kvm_ioctls::Error),

    #[error("Failed to write vCPU registers: {0}")]
    SetRegisters(#[source] kvm_ioctls::Error),

    #[error("Failed to read vCPU special registers: {0}")]
    GetSpecialRegisters(#[source] kvm_ioctls::Error),

    #[error("Failed to write vCPU special registers: {0}")]
    SetSpecialRegisters(#[source] kvm_ioctls::Error),

    // Run loop
    #[error("vCPU {id} run failed: {source}")]
    VcpuRun {
        id: u64,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("vCPU {0} exit handler panicked")]
    HandlerPanicked(u64),

    // Interrupt injection
    #[error("vCPU {id}: an interrupt is already queued, IRQ {irq} not injected")]
    IrqAlreadyQueued { id: u64, irq: u32 },

    #[error("vCPU {id}: IRQ {irq} is not a valid interrupt number")]
    InvalidIrq { id: u64, irq: u32 },

    #[error("vCPU {id}: IRQ {irq} not injected, the in-kernel PIC handles interrupts")]
    IrqHandledByKernelPic { id: u64, irq: u32 },

    #[error("vCPU {id}: failed to inject IRQ {irq}: {source}")]
    InjectInterrupt {
        id: u64,
        irq: u32,
        #[source]
        source: kvm_ioctls::Error,
    },

    // Memory access
    #[error("Memory region of {size:#x} bytes is too small for {len:#x} bytes at offset {offset:#x}")]
    RegionTooSmall { size: usize, offset: usize, len: usize },

    #[error("Guest physical address {address:#x} (+{len:#x}) is not inside a single memory region")]
    InvalidGuestAddress { address: u64, len: usize },

    #[error("Memory region in slot {0} has been released")]
    RegionReleased(u32),

    #[error("Guest memory access failed: {0}")]
    GuestMemory(#[source] vm_memory::VolatileMemoryError),

    // Misuse
    #[error("vCPU {0} has already been started")]
    VcpuAlreadyStarted(u64),

    #[error("vCPU {0} has been shutdown")]
    VcpuHasBeenShutdown(u64),

    #[error("vCPU {0} has no exit handler installed")]
    NoExitHandler(u64),

    #[error("set_in() called while not handling an IN exit")]
    SetInOutsideIoIn,

    #[error("I/O width mismatch: have {have:?}, want {want:?}")]
    IoWidthMismatch { have: IoWidth, want: IoWidth },

    #[error("VM has been shutdown")]
    VmHasBeenShutdown,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Shutdown
    #[error("{0} vCPU(s) still running")]
    VcpusStillRunning(usize),

    // Configuration
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    IO(#[from] std::io::Error),
}

impl From<serde_json::Error> for VMError {
    fn from(err: serde_json::Error) -> Self { VMError::Config(err.to_string()) }
}

impl VMError {
    /// True for errors caused by calling the API in the wrong state rather
    /// than by the host or the guest.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            VMError::VcpuAlreadyStarted(_)
                | VMError::VcpuHasBeenShutdown(_)
                | VMError::NoExitHandler(_)
                | VMError::SetInOutsideIoIn
                | VMError::IoWidthMismatch { .. }
                | VMError::VmHasBeenShutdown
                | VMError::InvalidArgument(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, VMError>;
