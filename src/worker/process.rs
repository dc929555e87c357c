use std::{
    io,
    os::fd::OwnedFd,
    process::{Child, Command, Stdio},
    thread,
    time::Instant,
};

use crossbeam_channel::{bounded, Receiver};
use libc::c_int;
use log::{error, warn};

use crate::{
    error::SignalError,
    models::task::{ExitEvent, ExitOutcome, Role, SharedLiveness, TaskSpec},
};

/// Where one standard stream of a child is attached.
#[derive(Debug)]
pub enum Binding {
    Inherit,
    #[cfg(test)]
    Null,
    /// Duplicated for every spawn, so the original stays open across restarts.
    Fd(OwnedFd),
}

impl Binding {
    fn stdio(&self) -> io::Result<Stdio> {
        match self {
            Binding::Inherit => Ok(Stdio::inherit()),
            #[cfg(test)]
            Binding::Null => Ok(Stdio::null()),
            Binding::Fd(fd) => Ok(Stdio::from(fd.try_clone()?)),
        }
    }
}

/// Standard streams a task's processes are bound to.
#[derive(Debug)]
pub struct TaskIo {
    pub stdin: Binding,
    pub stdout: Binding,
    pub stderr: Binding,
}

impl TaskIo {
    #[cfg(test)]
    pub fn null() -> Self {
        Self {
            stdin: Binding::Null,
            stdout: Binding::Null,
            stderr: Binding::Null,
        }
    }
}

pub fn spawn(spec: &TaskSpec, io: &TaskIo) -> io::Result<Child> {
    Command::new(&spec.path)
        .args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k, v)))
        .stdin(io.stdin.stdio()?)
        .stdout(io.stdout.stdio()?)
        .stderr(io.stderr.stdio()?)
        .spawn()
}

/// Sends `signal` to the live process of `record`, if any.
///
/// The lock is held across `kill`, and the waiter only reaps while holding
/// it, so the pid cannot have been recycled.
pub fn deliver(record: &SharedLiveness, signal: c_int) -> Result<u32, SignalError> {
    let guard = record.lock();
    let pid = guard.pid.ok_or(SignalError::NoProcess)?;
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc == 0 {
        Ok(pid)
    } else {
        Err(SignalError::Delivery {
            pid,
            source: io::Error::last_os_error(),
        })
    }
}

/// Starts a thread that blocks until `child` exits, records the exit and
/// reports it on the returned channel.
pub fn spawn_waiter(role: Role, mut child: Child, started: Instant, record: SharedLiveness) -> Receiver<ExitEvent> {
    let (tx, rx) = bounded(1);
    let pid = child.id();

    thread::spawn(move || {
        if let Err(e) = wait_exited(pid) {
            warn!("[{}] waitid on pid {} failed: {}", role, pid, e);
        }

        let mut guard = record.lock();
        let outcome = match child.wait() {
            Ok(status) => ExitOutcome::from_status(status),
            Err(e) => {
                error!("[{}] failed to wait for pid {}: {}", role, pid, e);
                ExitOutcome::WaitFailed(e.to_string())
            }
        };
        let exited = Instant::now();
        guard.mark_exited(outcome.clone(), exited);
        drop(guard);

        let _ = tx.send(ExitEvent {
            role,
            pid,
            outcome,
            started,
            exited,
        });
    });

    rx
}

/// Blocks until `pid` has exited without reaping it.
fn wait_exited(pid: u32) -> io::Result<()> {
    loop {
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}
