use std::{io, mem, ptr, thread};

use crossbeam_channel::Sender;
use libc::c_int;
use log::{error, info};

use crate::models::message::Shutdown;

/// SIGINT and SIGTERM, blocked so that only `sigwait` observes them.
pub struct TerminationSignals {
    set: libc::sigset_t,
}

impl TerminationSignals {
    /// Blocks the signals in the calling thread. Threads spawned afterwards
    /// inherit the mask, so call this before starting any.
    pub fn block() -> io::Result<Self> {
        let mut set: libc::sigset_t = unsafe { mem::zeroed() };
        unsafe {
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, libc::SIGINT);
            libc::sigaddset(&mut set, libc::SIGTERM);
        }
        let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, ptr::null_mut()) };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(Self { set })
    }

    /// Turns each received signal into a shutdown request.
    pub fn forward(self, shutdown: Sender<Shutdown>) -> io::Result<thread::JoinHandle<()>> {
        thread::Builder::new().name("signals".into()).spawn(move || loop {
            let mut signal: c_int = 0;
            let rc = unsafe { libc::sigwait(&self.set, &mut signal) };
            if rc != 0 {
                error!("sigwait failed: {}", io::Error::from_raw_os_error(rc));
                return;
            }
            info!("received signal {}", signal);
            // Full means a shutdown is already pending.
            let _ = shutdown.try_send(Shutdown::Signal(signal));
        })
    }
}
