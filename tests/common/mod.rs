#![allow(dead_code)]

use std::fs::OpenOptions;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hvkit::{
    ExitContext, MemoryRegion, Registers, SegmentRegister, VMConfig, VMExit, Vcpu, VirtualMachine,
};

pub const GUEST_BASE: u64 = 0x1000;
pub const GUEST_SIZE: usize = 0x2000;
pub const DATA_SELECTOR: u16 = 0x100;

const RUN_TIMEOUT: Duration = Duration::from_secs(5);


/// Tests that need a real KVM bail out early when the device is missing.
pub fn kvm_available() -> bool {
    let ok = OpenOptions::new().read(true).write(true).open("/dev/kvm").is_ok();
    if !ok {
        eprintln!("skipping: /dev/kvm is not available");
    }
    ok
}


pub struct Guest {
    pub vm: VirtualMachine,
    pub region: Arc<MemoryRegion>,
    pub vcpu: Arc<Vcpu>,
}


/// 8 KiB of memory at 0x1000 with `program` at its start.
///
/// CS base is 0 and IP 0x1000, so execution starts at the first byte; DS
/// (and ES unless `adjust` changes it) points at the region.
pub fn real_mode_guest(program: &[u8], adjust: impl FnOnce(&mut Registers)) -> anyhow::Result<Guest> {
    let mut vm = VirtualMachine::new(VMConfig::default())?;
    let region = vm.add_memory(GUEST_BASE, GUEST_SIZE)?;
    region.load_binary(program, 0)?;

    let vcpu = vm.create_vcpu(|regs| {
        regs.setup_real_mode();
        regs.cs = SegmentRegister::real_mode(0, 0x9b);
        regs.rip = GUEST_BASE;
        regs.ds = SegmentRegister::real_mode(DATA_SELECTOR, 0x93);
        regs.es = regs.ds;
        adjust(regs);
    })?;
    Ok(Guest { vm, region, vcpu })
}


/// Runs the vCPU until `handler` stops it and returns every exit seen.
///
/// Exits the test does not expect stop the guest so a bad program cannot
/// spin forever.
pub fn run<F>(vcpu: &Vcpu, mut handler: F) -> anyhow::Result<Vec<VMExit>>
where
    F: FnMut(&mut ExitContext<'_>, &VMExit) -> Option<bool> + Send + 'static,
{
    let exits = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&exits);
    vcpu.set_exit_handler(move |ctx, exit| {
        if *exit == VMExit::Interrupted {
            return false;
        }
        seen.lock().unwrap().push(exit.clone());
        handler(ctx, exit).unwrap_or(true)
    })?;
    vcpu.start()?;
    anyhow::ensure!(vcpu.wait_for_completion(RUN_TIMEOUT), "vcpu did not stop");
    if let Some(e) = vcpu.take_error() {
        return Err(e.into());
    }
    let exits = exits.lock().unwrap().clone();
    Ok(exits)
}


/// Handler for programs that only end in HLT.
pub fn until_hlt(_: &mut ExitContext<'_>, exit: &VMExit) -> Option<bool> {
    match exit {
        VMExit::Hlt => Some(true),
        _ => None,
    }
}
