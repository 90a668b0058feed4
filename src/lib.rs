//! Hypervisor control plane on KVM: virtual machines, guest memory, vCPU
//! threads and VM-exit decoding.
//!
//! A caller creates a [`VirtualMachine`], adds memory, loads a guest image,
//! creates vCPUs, installs an exit handler on each and starts them. Each vCPU
//! runs on its own thread and calls the handler for every decoded [`VMExit`]
//! until the handler asks it to stop.

mod config;
mod error;
mod types;
pub mod vmm;


pub use crate::config::{MemoryRegionConfig, VMConfig};
pub use crate::error::{Result, VMError};
pub use crate::types::{IoData, IoWidth, VcpuState};
pub use crate::vmm::exit::{DebugInfo, ExceptionInfo, ExceptionVector, ExitDecodeError, VMExit};
pub use crate::vmm::kvm_ctx::KvmContext;
pub use crate::vmm::memory::MemoryRegion;
pub use crate::vmm::registers::{DescriptorTable, Registers, Rflags, SegmentRegister};
pub use crate::vmm::vcpu::{CompletionHandler, ExitContext, ExitHandler, Vcpu};
pub use crate::vmm::vm::{VirtualMachine, PAGE_SIZE};
pub use crate::vmm::vmx::{decode_vmx_exit, EptViolation, VmxExit, VmxExitInfo, VmxExitReason, VmxInstructionError};
