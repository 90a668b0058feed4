use std::sync::Arc;

use kvm_bindings::{kvm_pit_config, kvm_userspace_memory_region};
use kvm_ioctls::VmFd;
use log::{debug, error, info, warn};

use super::kvm_ctx::KvmContext;
use super::memory::MemoryRegion;
use super::registers::Registers;
use super::vcpu::Vcpu;
use crate::config::VMConfig;
use crate::error::{Result, VMError};


pub const PAGE_SIZE: u64 = 0x1000;


/// A virtual machine: guest memory slots plus the vCPUs that run on them.
///
/// Shutdown order is vCPUs, then memory, then the VM handle.
pub struct VirtualMachine {
    ctx: Arc<KvmContext>,
    config: VMConfig,
    fd: Option<VmFd>,
    memory_regions: Vec<Arc<MemoryRegion>>,
    vcpus: Vec<Arc<Vcpu>>,
    next_slot: u32,
    next_vcpu_id: u64,
}


impl VirtualMachine {
    /// Creates a VM on the process-wide KVM handle.
    pub fn new(config: VMConfig) -> Result<Self> {
        let ctx = KvmContext::shared(&config)?;
        Self::with_context(ctx, config)
    }

    pub fn with_context(ctx: Arc<KvmContext>, config: VMConfig) -> Result<Self> {
        let fd = ctx.kvm.create_vm().map_err(VMError::CreateVm)?;
        info!("created VM (API version {})", ctx.api_version);
        let regions = config.memory.clone();
        let mut vm = Self {
            ctx,
            config,
            fd: Some(fd),
            memory_regions: vec![],
            vcpus: vec![],
            next_slot: 0,
            next_vcpu_id: 0,
        };
        for region in regions {
            vm.add_memory_region(region.guest_address, region.size, region.read_only)?;
        }
        Ok(vm)
    }

    pub fn config(&self) -> &VMConfig { &self.config }

    pub fn memory_regions(&self) -> &[Arc<MemoryRegion>] { &self.memory_regions }

    pub fn vcpus(&self) -> &[Arc<Vcpu>] { &self.vcpus }

    pub fn is_shutdown(&self) -> bool { self.fd.is_none() }

    /// Adds writable guest memory at `guest_address` in the next free slot.
    pub fn add_memory(&mut self, guest_address: u64, size: usize) -> Result<Arc<MemoryRegion>> {
        self.add_memory_region(guest_address, size, false)
    }

    /// Address and size must be page-aligned. Slots are never reused.
    pub fn add_memory_region(&mut self, guest_address: u64, size: usize, read_only: bool) -> Result<Arc<MemoryRegion>> {
        let fd = self.fd.as_ref().ok_or(VMError::VmHasBeenShutdown)?;
        if size == 0 {
            return Err(VMError::InvalidArgument("memory region size is zero".to_string()));
        }
        if guest_address % PAGE_SIZE != 0 || size as u64 % PAGE_SIZE != 0 {
            return Err(VMError::InvalidArgument(format!(
                "memory region {:#x}+{:#x} is not page-aligned",
                guest_address, size
            )));
        }

        let slot = self.next_slot;
        let region = MemoryRegion::create(size, guest_address, slot, read_only)?;
        // SAFETY: the mapping outlives the slot; shutdown removes the slot
        // before releasing the mapping.
        unsafe { fd.set_user_memory_region(region.kvm_region()?) }
            .map_err(|source| VMError::SetUserMemoryRegion { slot, source })?;
        self.next_slot += 1;

        info!(
            "added {}memory slot {}: {:#x}+{:#x}",
            if read_only { "read-only " } else { "" },
            slot,
            guest_address,
            size
        );
        let region = Arc::new(region);
        self.memory_regions.push(Arc::clone(&region));
        Ok(region)
    }

    /// The region holding `guest_address`, if any.
    pub fn memory_region_containing(&self, guest_address: u64) -> Option<&Arc<MemoryRegion>> {
        self.memory_regions.iter().find(|r| r.contains(guest_address, 1))
    }

    pub fn read_guest(&self, guest_address: u64, buf: &mut [u8]) -> Result<()> {
        let (region, offset) = self.locate(guest_address, buf.len())?;
        region.read_slice(buf, offset)
    }

    pub fn write_guest(&self, guest_address: u64, bytes: &[u8]) -> Result<()> {
        let (region, offset) = self.locate(guest_address, bytes.len())?;
        region.write_slice(bytes, offset)
    }

    /// Creates the in-kernel interrupt controller and timer.
    pub fn add_pic_and_pit(&self) -> Result<()> {
        let fd = self.fd.as_ref().ok_or(VMError::VmHasBeenShutdown)?;
        fd.create_irq_chip().map_err(VMError::CreateIrqChip)?;
        fd.create_pit2(kvm_pit_config::default()).map_err(VMError::CreatePit)?;
        debug!("created in-kernel PIC and PIT");
        Ok(())
    }

    /// Creates a vCPU with the next id. `startup` edits its initial registers.
    pub fn create_vcpu<F: FnOnce(&mut Registers)>(&mut self, startup: F) -> Result<Arc<Vcpu>> {
        let fd = self.fd.as_ref().ok_or(VMError::VmHasBeenShutdown)?;
        let id = self.next_vcpu_id;
        let vcpu_fd = fd.create_vcpu(id).map_err(|source| VMError::CreateVcpu { id, source })?;
        // KVM holds the id from here on, even if the rest fails
        self.next_vcpu_id += 1;

        let regs = vcpu_fd.get_regs().map_err(VMError::GetRegisters)?;
        let sregs = vcpu_fd.get_sregs().map_err(VMError::GetSpecialRegisters)?;
        let mut registers = Registers::from_kvm(&regs, &sregs);
        startup(&mut registers);

        let vcpu = Arc::new(Vcpu::new(id, vcpu_fd, registers, self.ctx.vcpu_mmap_size, &self.config)?);
        info!("created vcpu {}", id);
        self.vcpus.push(Arc::clone(&vcpu));
        Ok(vcpu)
    }

    /// True if every vCPU has stopped.
    pub fn all_vcpus_shutdown(&self) -> bool { self.vcpus.iter().all(|v| v.is_shutdown()) }

    /// Stops all vCPUs, waiting up to the configured timeout for each.
    pub fn shutdown_all_vcpus(&self) -> bool {
        for vcpu in &self.vcpus {
            vcpu.request_shutdown();
        }
        for vcpu in &self.vcpus {
            if let Err(e) = vcpu.shutdown() {
                debug!("vcpu {}: {}", vcpu.id(), e);
            }
        }
        self.all_vcpus_shutdown()
    }

    /// Releases everything. Calling it again does nothing.
    ///
    /// Fails with `VcpusStillRunning`, leaving the VM intact, if a vCPU does
    /// not stop in time.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.fd.is_none() {
            return Ok(());
        }
        if !self.shutdown_all_vcpus() {
            let running = self.vcpus.iter().filter(|v| !v.is_shutdown()).count();
            return Err(VMError::VcpusStillRunning(running));
        }
        for vcpu in &self.vcpus {
            vcpu.join();
        }

        if let Some(fd) = self.fd.as_ref() {
            for region in &self.memory_regions {
                let remove = kvm_userspace_memory_region {
                    slot: region.slot(),
                    guest_phys_addr: region.guest_address(),
                    memory_size: 0,
                    ..Default::default()
                };
                // SAFETY: a zero-sized region deletes the slot.
                if let Err(e) = unsafe { fd.set_user_memory_region(remove) } {
                    warn!("memory slot {}: failed to remove: {}", region.slot(), e);
                }
                region.release();
            }
        }
        self.fd = None;
        info!("VM shut down ({} vcpus, {} memory slots)", self.vcpus.len(), self.memory_regions.len());
        Ok(())
    }

    fn locate(&self, guest_address: u64, len: usize) -> Result<(&MemoryRegion, usize)> {
        if self.fd.is_none() {
            return Err(VMError::VmHasBeenShutdown);
        }
        self.memory_regions
            .iter()
            .find(|r| r.contains(guest_address, len))
            .map(|r| (r.as_ref(), (guest_address - r.guest_address()) as usize))
            .ok_or(VMError::InvalidGuestAddress { address: guest_address, len })
    }
}


impl Drop for VirtualMachine {
    fn drop(&mut self) {
        if self.fd.is_none() {
            return;
        }
        warn!("VM dropped without shutdown");
        if let Err(e) = self.shutdown() {
            error!("VM shutdown on drop failed: {}", e);
        }
    }
}
