use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::warn;
use vmm_sys_util::epoll::{ControlOperation, Epoll, EpollEvent, EventSet};
use vmm_sys_util::eventfd::{EventFd, EFD_NONBLOCK};


/// One-shot completion signal backed by an eventfd.
///
/// The counter is never drained, so once signaled the fd stays readable and
/// every waiter sees it.
#[derive(Debug)]
pub struct Completion {
    evt: EventFd,
    epoll: Epoll,
    done: AtomicBool,
}


impl Completion {
    pub fn new() -> io::Result<Self> {
        let evt = EventFd::new(EFD_NONBLOCK)?;
        let epoll = Epoll::new()?;
        epoll.ctl(ControlOperation::Add, evt.as_raw_fd(), EpollEvent::new(EventSet::IN, 0))?;
        Ok(Self { evt, epoll, done: AtomicBool::new(false) })
    }

    pub fn signal(&self) {
        self.done.store(true, Ordering::SeqCst);
        if let Err(e) = self.evt.write(1) {
            warn!("completion eventfd write failed: {}", e);
        }
    }

    pub fn is_signaled(&self) -> bool { self.done.load(Ordering::SeqCst) }

    /// Returns true if signaled before `timeout` elapsed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = match Instant::now().checked_add(timeout) {
            Some(deadline) => deadline,
            None => {
                self.wait();
                return self.is_signaled();
            }
        };
        loop {
            if self.is_signaled() {
                return true;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return false;
            }
            // round up so a sub-millisecond remainder still blocks
            let ms = left.as_micros().div_ceil(1000).min(i32::MAX as u128) as i32;
            if !self.poll(ms) {
                return self.is_signaled();
            }
        }
    }

    pub fn wait(&self) {
        while !self.is_signaled() {
            if !self.poll(-1) {
                return;
            }
        }
    }

    // False if epoll itself failed.
    fn poll(&self, timeout_ms: i32) -> bool {
        let mut events = [EpollEvent::default()];
        match self.epoll.wait(timeout_ms, &mut events) {
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => true,
            Err(e) => {
                warn!("completion wait failed: {}", e);
                false
            }
        }
    }
}
