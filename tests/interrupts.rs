mod common;

use common::{kvm_available, real_mode_guest, run, until_hlt, GUEST_BASE, GUEST_SIZE};
use hvkit::{IoData, SegmentRegister, VMConfig, VMError, VMExit, VirtualMachine};

const VECTOR: u8 = 0x20;


#[test]
fn queued_irq_runs_its_handler_first() -> anyhow::Result<()> {
    if !kvm_available() {
        return Ok(());
    }
    // mov al, 1; out 0x80, al; hlt
    let mut guest = real_mode_guest(&[0xb0, 0x01, 0xe6, 0x80, 0xf4], |regs| {
        regs.ss = SegmentRegister::real_mode(0, 0x93);
        regs.set_sp(0xf00);
        regs.rflags.set_interrupt_enable(true);
    })?;
    // mov al, 0x42; out 0x80, al; hlt
    guest.region.load_binary(&[0xb0, 0x42, 0xe6, 0x80, 0xf4], 0x100)?;
    let low = guest.vm.add_memory(0, 0x1000)?;
    low.write_obj(GUEST_BASE as u16 + 0x100, usize::from(VECTOR) * 4)?;
    low.write_obj(0u16, usize::from(VECTOR) * 4 + 2)?;

    guest.vcpu.queue_irq(VECTOR);
    assert_eq!(guest.vcpu.pending_irq(), Some(VECTOR));
    let exits = run(&guest.vcpu, |_, exit| match exit {
        VMExit::IoOut { .. } => Some(false),
        VMExit::Hlt => Some(true),
        _ => None,
    })?;
    assert_eq!(exits, vec![VMExit::IoOut { port: 0x80, data: IoData::Byte(0x42) }, VMExit::Hlt]);
    assert_eq!(guest.vcpu.pending_irq(), None);
    Ok(())
}


#[test]
fn irq_waits_while_interrupts_are_disabled() -> anyhow::Result<()> {
    if !kvm_available() {
        return Ok(());
    }
    let guest = real_mode_guest(&[0xf4], |regs| regs.rflags.set_interrupt_enable(false))?;
    guest.vcpu.queue_irq(VECTOR);
    guest.vcpu.queue_irq(VECTOR + 1);

    assert_eq!(run(&guest.vcpu, until_hlt)?, vec![VMExit::Hlt]);
    // the later one replaced the first and is still pending
    assert_eq!(guest.vcpu.pending_irq(), Some(VECTOR + 1));
    guest.vcpu.clear_pending_irq();
    assert_eq!(guest.vcpu.pending_irq(), None);
    Ok(())
}


#[test]
fn kernel_pic_refuses_injected_irqs() -> anyhow::Result<()> {
    if !kvm_available() {
        return Ok(());
    }
    let mut vm = VirtualMachine::new(VMConfig::default())?;
    vm.add_pic_and_pit()?;
    let region = vm.add_memory(GUEST_BASE, GUEST_SIZE)?;
    region.load_binary(&[0xf4], 0)?;
    let vcpu = vm.create_vcpu(|regs| {
        regs.setup_real_mode();
        regs.cs = SegmentRegister::real_mode(0, 0x9b);
        regs.rip = GUEST_BASE;
        regs.rflags.set_interrupt_enable(true);
    })?;

    vcpu.queue_irq(VECTOR);
    let err = run(&vcpu, until_hlt).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<VMError>(),
        Some(VMError::IrqHandledByKernelPic { id: 0, irq: 0x20 })
    ));
    assert!(vcpu.is_shutdown());
    vm.shutdown()?;
    Ok(())
}
