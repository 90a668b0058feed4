use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use kvm_bindings::{kvm_interrupt, kvm_run, KVMIO};
use kvm_ioctls::VcpuFd;
use log::{debug, error, info, trace, warn};
use vmm_sys_util::ioctl::ioctl_with_ref;
use vmm_sys_util::{ioctl_ioc_nr, ioctl_iow_nr};

use super::completion::Completion;
use super::exit::{decode_exit, KvmExit, VMExit};
use super::registers::Registers;
use crate::config::VMConfig;
use crate::error::{Result, VMError};
use crate::types::{IoData, IoWidth, VcpuState};


/// Called on the vCPU thread for every exit. Returning `true` stops the vCPU.
pub type ExitHandler = Box<dyn FnMut(&mut ExitContext<'_>, &VMExit) -> bool + Send>;

/// Called once when the vCPU stops, with the fatal error if there was one.
pub type CompletionHandler = Box<dyn FnOnce(Option<&VMError>) + Send>;


// Not wrapped by kvm-ioctls. Only valid with the IRQ chip in user space.
ioctl_iow_nr!(KVM_INTERRUPT, KVMIO, 0x86, kvm_interrupt);


fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(PoisonError::into_inner) }


/// What an exit handler can touch while the vCPU is paused on an exit.
pub struct ExitContext<'a> {
    vcpu_id: u64,
    registers: &'a mut Registers,
    run: &'a mut [u8],
    in_slot: Option<(usize, IoWidth)>,
    answered: bool,
}


impl<'a> ExitContext<'a> {
    pub(crate) fn new(
        vcpu_id: u64,
        registers: &'a mut Registers,
        run: &'a mut [u8],
        in_slot: Option<(usize, IoWidth)>,
    ) -> Self {
        Self { vcpu_id, registers, run, in_slot, answered: false }
    }

    pub fn vcpu_id(&self) -> u64 { self.vcpu_id }

    /// Registers as of this exit.
    pub fn registers(&self) -> &Registers { &*self.registers }

    /// Changes are loaded into the vCPU before it resumes.
    pub fn registers_mut(&mut self) -> &mut Registers { &mut *self.registers }

    /// Supplies the value the guest reads for the current IN or MMIO read.
    pub fn set_in(&mut self, data: IoData) -> Result<()> {
        let (offset, width) = self.in_slot.ok_or(VMError::SetInOutsideIoIn)?;
        if data.width() != width {
            return Err(VMError::IoWidthMismatch { have: data.width(), want: width });
        }
        let size = self.run.len();
        let written = self.run.get_mut(offset..).map_or(false, |slot| data.write_le(slot));
        if !written {
            return Err(VMError::RegionTooSmall { size, offset, len: width.bytes() });
        }
        self.answered = true;
        Ok(())
    }

    pub(crate) fn expects_answer(&self) -> bool { self.in_slot.is_some() }

    pub(crate) fn answered(&self) -> bool { self.answered }
}


struct VcpuShared {
    id: u64,
    state: Mutex<VcpuState>,
    registers: Mutex<Registers>,
    // Held by the vCPU thread for as long as it runs.
    fd: Mutex<Option<VcpuFd>>,
    run_size: usize,
    stop_requested: AtomicBool,
    shutdown: AtomicBool,
    exit_handler: Mutex<Option<ExitHandler>>,
    completion_handler: Mutex<Option<CompletionHandler>>,
    completion: Completion,
    error: Mutex<Option<VMError>>,
    pending_irq: Mutex<Option<u8>>,
}


/// A virtual CPU with its own execution thread.
pub struct Vcpu {
    shared: Arc<VcpuShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_name: String,
    stack_size: Option<usize>,
    shutdown_timeout: Duration,
}


impl Vcpu {
    pub(crate) fn new(
        id: u64,
        fd: VcpuFd,
        registers: Registers,
        run_size: usize,
        config: &VMConfig,
    ) -> Result<Self> {
        let shared = VcpuShared {
            id,
            state: Mutex::new(VcpuState::Created),
            registers: Mutex::new(registers),
            fd: Mutex::new(Some(fd)),
            run_size,
            stop_requested: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            exit_handler: Mutex::new(None),
            completion_handler: Mutex::new(None),
            completion: Completion::new()?,
            error: Mutex::new(None),
            pending_irq: Mutex::new(None),
        };
        Ok(Self {
            shared: Arc::new(shared),
            thread: Mutex::new(None),
            thread_name: format!("{}-{}", config.vcpu_thread_name, id),
            stack_size: config.vcpu_stack_size,
            shutdown_timeout: config.vcpu_shutdown_timeout(),
        })
    }

    pub fn id(&self) -> u64 { self.shared.id }

    pub fn state(&self) -> VcpuState { *lock(&self.shared.state) }

    pub fn set_exit_handler<F>(&self, handler: F) -> Result<()>
    where
        F: FnMut(&mut ExitContext<'_>, &VMExit) -> bool + Send + 'static,
    {
        self.ensure_created()?;
        *lock(&self.shared.exit_handler) = Some(Box::new(handler));
        Ok(())
    }

    pub fn set_completion_handler<F>(&self, handler: F) -> Result<()>
    where
        F: FnOnce(Option<&VMError>) + Send + 'static,
    {
        self.ensure_created()?;
        *lock(&self.shared.completion_handler) = Some(Box::new(handler));
        Ok(())
    }

    /// Starts the execution thread. A vCPU can be started only once.
    pub fn start(&self) -> Result<()> {
        let mut state = lock(&self.shared.state);
        match *state {
            VcpuState::Running => return Err(VMError::VcpuAlreadyStarted(self.id())),
            VcpuState::Stopped => return Err(VMError::VcpuHasBeenShutdown(self.id())),
            VcpuState::Created => {}
        }
        let handler = lock(&self.shared.exit_handler).take().ok_or(VMError::NoExitHandler(self.id()))?;

        let mut builder = thread::Builder::new().name(self.thread_name.clone());
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }
        let shared = Arc::clone(&self.shared);
        let handle = builder.spawn(move || vcpu_thread(shared, handler))?;
        *state = VcpuState::Running;
        *lock(&self.thread) = Some(handle);
        info!("vcpu {}: started", self.id());
        Ok(())
    }

    /// Copy of the register snapshot.
    ///
    /// While the vCPU runs this is the state as of the last exit.
    pub fn registers(&self) -> Registers { lock(&self.shared.registers).clone() }

    /// Edits the snapshot; the vCPU picks it up on its next entry.
    pub fn update_registers<F: FnOnce(&mut Registers)>(&self, f: F) -> Result<()> {
        if self.state() == VcpuState::Stopped {
            return Err(VMError::VcpuHasBeenShutdown(self.id()));
        }
        f(&mut lock(&self.shared.registers));
        Ok(())
    }

    /// Queues `irq` for injection on the next entry with RFLAGS.IF set.
    ///
    /// Replaces any IRQ still pending. Needs the IRQ chip in user space, so
    /// not together with `add_pic_and_pit`.
    pub fn queue_irq(&self, irq: u8) {
        if let Some(old) = lock(&self.shared.pending_irq).replace(irq) {
            debug!("vcpu {}: IRQ {} replaced by {}", self.id(), old, irq);
        }
        trace!("vcpu {}: queued IRQ {}", self.id(), irq);
    }

    pub fn clear_pending_irq(&self) { lock(&self.shared.pending_irq).take(); }

    pub fn pending_irq(&self) -> Option<u8> { *lock(&self.shared.pending_irq) }

    /// Asks the run loop to stop before its next entry into the guest.
    ///
    /// A guest that never exits is not interrupted.
    pub fn request_shutdown(&self) { self.shared.stop_requested.store(true, Ordering::SeqCst); }

    /// Stops the vCPU and waits up to the configured timeout for its thread.
    ///
    /// A vCPU that was never started is stopped at once: its completion
    /// handler fires and it can no longer be started.
    pub fn shutdown(&self) -> Result<()> {
        {
            let mut state = lock(&self.shared.state);
            if *state == VcpuState::Created {
                *state = VcpuState::Stopped;
                drop(state);
                lock(&self.shared.fd).take();
                lock(&self.shared.exit_handler).take();
                debug!("vcpu {}: stopped before start", self.id());
                finish(&self.shared, Ok(()));
                return Ok(());
            }
        }
        self.request_shutdown();
        if !self.wait_for_completion(self.shutdown_timeout) {
            warn!("vcpu {}: still running after {:?}", self.id(), self.shutdown_timeout);
            return Err(VMError::VcpusStillRunning(1));
        }
        self.join();
        Ok(())
    }

    /// Returns true once the vCPU has stopped.
    pub fn wait_for_completion(&self, timeout: Duration) -> bool { self.shared.completion.wait_timeout(timeout) }

    pub fn is_shutdown(&self) -> bool { self.shared.shutdown.load(Ordering::SeqCst) }

    /// The error that stopped the vCPU, if any. Returned once.
    pub fn take_error(&self) -> Option<VMError> { lock(&self.shared.error).take() }

    pub(crate) fn join(&self) {
        if let Some(handle) = lock(&self.thread).take() {
            if handle.join().is_err() {
                error!("vcpu {}: thread panicked", self.id());
            }
        }
    }

    fn ensure_created(&self) -> Result<()> {
        match self.state() {
            VcpuState::Created => Ok(()),
            VcpuState::Running => Err(VMError::VcpuAlreadyStarted(self.id())),
            VcpuState::Stopped => Err(VMError::VcpuHasBeenShutdown(self.id())),
        }
    }
}


impl std::fmt::Debug for Vcpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vcpu")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("thread", &self.thread_name)
            .finish()
    }
}


fn vcpu_thread(shared: Arc<VcpuShared>, mut handler: ExitHandler) {
    let result = {
        let mut fd = lock(&shared.fd);
        let result = match fd.as_mut() {
            Some(vcpu) => run_loop(&shared, vcpu, &mut handler),
            None => Err(VMError::VcpuHasBeenShutdown(shared.id)),
        };
        // closes the vCPU and unmaps its run state
        fd.take();
        result
    };
    drop(handler);
    finish(&shared, result);
}


fn finish(shared: &VcpuShared, result: Result<()>) {
    match &result {
        Ok(()) => info!("vcpu {}: stopped", shared.id),
        Err(e) => error!("vcpu {}: stopped on error: {}", shared.id, e),
    }
    *lock(&shared.state) = VcpuState::Stopped;
    shared.shutdown.store(true, Ordering::SeqCst);

    let completion_handler = lock(&shared.completion_handler).take();
    if let Some(handler) = completion_handler {
        handler(result.as_ref().err());
    }
    if let Err(e) = result {
        *lock(&shared.error) = Some(e);
    }
    shared.completion.signal();
}


fn push_registers(fd: &VcpuFd, registers: &Registers) -> Result<()> {
    fd.set_sregs(&registers.to_kvm_sregs()).map_err(VMError::SetSpecialRegisters)?;
    fd.set_regs(&registers.to_kvm_regs()).map_err(VMError::SetRegisters)?;
    Ok(())
}


fn pull_registers(fd: &VcpuFd) -> Result<Registers> {
    let regs = fd.get_regs().map_err(VMError::GetRegisters)?;
    let sregs = fd.get_sregs().map_err(VMError::GetSpecialRegisters)?;
    Ok(Registers::from_kvm(&regs, &sregs))
}


// Loading registers while KVM still owes the guest the result of an IN
// drops that result, so only push what KVM does not already hold.
fn needs_push(synced: Option<&Registers>, current: &Registers) -> bool { synced != Some(current) }


fn inject_interrupt(fd: &VcpuFd, id: u64, irq: u8) -> Result<()> {
    let irq = u32::from(irq);
    let arg = kvm_interrupt { irq };
    // SAFETY: `fd` is an open vCPU and KVM only reads `arg`.
    let ret = unsafe { ioctl_with_ref(fd, KVM_INTERRUPT(), &arg) };
    if ret == 0 {
        debug!("vcpu {}: injected IRQ {}", id, irq);
        return Ok(());
    }
    let source = kvm_ioctls::Error::last();
    Err(match source.errno() {
        libc::EEXIST => VMError::IrqAlreadyQueued { id, irq },
        libc::EINVAL => VMError::InvalidIrq { id, irq },
        libc::ENXIO => VMError::IrqHandledByKernelPic { id, irq },
        _ => VMError::InjectInterrupt { id, irq, source },
    })
}


fn call_handler(id: u64, handler: &mut ExitHandler, ctx: &mut ExitContext<'_>, exit: &VMExit) -> Result<bool> {
    panic::catch_unwind(AssertUnwindSafe(|| handler(ctx, exit))).map_err(|_| VMError::HandlerPanicked(id))
}


fn run_loop(shared: &VcpuShared, fd: &mut VcpuFd, handler: &mut ExitHandler) -> Result<()> {
    let id = shared.id;
    // What KVM holds as of the last exit; nothing before the first entry.
    let mut synced: Option<Registers> = None;
    loop {
        if shared.stop_requested.load(Ordering::SeqCst) {
            debug!("vcpu {}: shutdown requested", id);
            return Ok(());
        }

        let current = lock(&shared.registers).clone();
        if needs_push(synced.as_ref(), &current) {
            push_registers(fd, &current)?;
        }
        if current.rflags.interrupt_enable() {
            let irq = lock(&shared.pending_irq).take();
            if let Some(irq) = irq {
                inject_interrupt(fd, id, irq)?;
            }
        }
        synced = Some(current);

        match fd.run() {
            Ok(_) => {}
            Err(e) if io::Error::from_raw_os_error(e.errno()).kind() == io::ErrorKind::Interrupted => {
                trace!("vcpu {}: run interrupted, re-entering", id);
                // The guest may have made progress before the signal.
                let pulled = pull_registers(fd)?;
                let mut snapshot = lock(&shared.registers);
                if synced.as_ref() == Some(&*snapshot) {
                    *snapshot = pulled.clone();
                }
                drop(snapshot);
                synced = Some(pulled);
                continue;
            }
            Err(source) => return Err(VMError::VcpuRun { id, source }),
        }
        let mut registers = pull_registers(fd)?;
        *lock(&shared.registers) = registers.clone();
        synced = Some(registers.clone());

        let run_ptr: *mut kvm_run = fd.get_kvm_run();
        // SAFETY: the run state stays mapped while `fd` lives and nothing
        // else references it until the next `run()`.
        let exit = KvmExit::from_kvm_run(unsafe { &*run_ptr });
        let run = unsafe { std::slice::from_raw_parts_mut(run_ptr.cast::<u8>(), shared.run_size) };

        let mut stop = false;
        for pending in decode_exit(&exit, run) {
            trace!("vcpu {}: {}", id, pending.exit);
            if let Some((offset, width)) = pending.in_slot {
                if let Some(slot) = run.get_mut(offset..offset + width.bytes()) {
                    slot.fill(0);
                }
            }
            let mut ctx = ExitContext::new(id, &mut registers, run, pending.in_slot);
            stop = call_handler(id, handler, &mut ctx, &pending.exit)?;
            if ctx.expects_answer() && !ctx.answered() {
                warn!("vcpu {}: {} was not answered, guest reads zero", id, pending.exit);
            }
            if stop {
                break;
            }
        }

        // an edit makes the snapshot differ from `synced`, so it is pushed
        if synced.as_ref() != Some(&registers) {
            *lock(&shared.registers) = registers;
        }
        if stop {
            debug!("vcpu {}: exit handler requested stop", id);
            return Ok(());
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_in_writes_at_slot_offset() {
        let mut registers = Registers::default();
        let mut run = [0u8; 16];
        let mut ctx = ExitContext::new(0, &mut registers, &mut run, Some((5, IoWidth::Dword)));
        ctx.set_in(IoData::Dword(0xdead_c0de)).unwrap();
        assert!(ctx.answered());
        assert_eq!(&run[4..10], &[0, 0xde, 0xc0, 0xad, 0xde, 0]);
    }

    #[test]
    fn set_in_rejects_wrong_width() {
        let mut registers = Registers::default();
        let mut run = [0u8; 16];
        let mut ctx = ExitContext::new(0, &mut registers, &mut run, Some((0, IoWidth::Word)));
        let err = ctx.set_in(IoData::Byte(1)).unwrap_err();
        assert!(matches!(err, VMError::IoWidthMismatch { have: IoWidth::Byte, want: IoWidth::Word }));
        assert!(err.is_misuse());
        assert!(!ctx.answered());
    }

    #[test]
    fn set_in_outside_in_exit_is_misuse() {
        let mut registers = Registers::default();
        let mut run = [0u8; 16];
        let mut ctx = ExitContext::new(3, &mut registers, &mut run, None);
        assert!(matches!(ctx.set_in(IoData::Byte(1)), Err(VMError::SetInOutsideIoIn)));
        assert!(!ctx.expects_answer());
        assert_eq!(ctx.vcpu_id(), 3);
    }

    #[test]
    fn set_in_slot_past_run_state_fails() {
        let mut registers = Registers::default();
        let mut run = [0u8; 4];
        let mut ctx = ExitContext::new(0, &mut registers, &mut run, Some((2, IoWidth::Dword)));
        assert!(matches!(ctx.set_in(IoData::Dword(1)), Err(VMError::RegionTooSmall { offset: 2, len: 4, .. })));
    }

    #[test]
    fn registers_are_pushed_only_when_kvm_lacks_them() {
        let pulled = Registers::default();
        // first entry always loads the startup registers
        assert!(needs_push(None, &pulled));
        assert!(!needs_push(Some(&pulled), &pulled.clone()));

        let mut edited = pulled.clone();
        edited.set_ax(1);
        assert!(needs_push(Some(&pulled), &edited));
    }

    #[test]
    fn handler_panic_becomes_an_error() {
        let mut handler: ExitHandler = Box::new(|_: &mut ExitContext<'_>, exit: &VMExit| match exit {
            VMExit::Hlt => panic!("guest halted"),
            _ => true,
        });
        let mut registers = Registers::default();
        let mut run = [0u8; 4];
        let mut ctx = ExitContext::new(7, &mut registers, &mut run, None);
        assert!(matches!(call_handler(7, &mut handler, &mut ctx, &VMExit::Hlt), Err(VMError::HandlerPanicked(7))));
        // the handler is still callable afterwards
        assert!(call_handler(7, &mut handler, &mut ctx, &VMExit::Interrupted).unwrap());
    }

    #[test]
    fn handler_register_edits_are_visible() {
        let mut registers = Registers::default();
        let mut run = [0u8; 4];
        let mut ctx = ExitContext::new(0, &mut registers, &mut run, None);
        ctx.registers_mut().set_ax(0x55aa);
        assert_eq!(ctx.registers().ax(), 0x55aa);
        drop(ctx);
        assert_eq!(registers.rax, 0x55aa);
    }
}
