use std::{io, time::Instant};

use crossbeam_channel::{after, select, Receiver, RecvError, Sender};
use log::{debug, error, info, warn};

use crate::{
    models::{
        message::Ack,
        task::{Direction, ExitEvent, Role, SharedLiveness, TaskConfig, TaskSpec},
    },
    worker::process::{deliver, spawn, spawn_waiter, TaskIo},
};

/// The single thread of control owning one task's processes.
pub struct Worker {
    pub role: Role,
    pub spec: TaskSpec,
    pub io: TaskIo,
    pub config: TaskConfig,
    pub record: SharedLiveness,
    pub up: Receiver<Ack>,
    pub down: Receiver<Ack>,
    pub exits: Sender<ExitEvent>,
}

enum Flow {
    Continue,
    Stop,
}

enum Generation {
    Exited(Result<ExitEvent, RecvError>),
    /// Stop requested. `ack` is `None` when the task handle went away;
    /// `exit` is set when the process had already exited on its own.
    Stopped {
        ack: Option<Ack>,
        exit: Option<Result<ExitEvent, RecvError>>,
    },
}

impl Worker {
    /// Idles until an up request arrives, supervises until the task is
    /// down again, and repeats. Returns once the task handle is dropped.
    pub fn run(self) {
        loop {
            select! {
                recv(self.up) -> ack => match ack {
                    Ok(ack) => self.supervise(ack),
                    Err(_) => break,
                },
                recv(self.down) -> ack => match ack {
                    Ok(ack) => ack.accept(),
                    Err(_) => break,
                },
            }
        }
        debug!("[{}] task handle dropped, run-loop exiting", self.role);
    }

    fn supervise(&self, ack: Ack) {
        self.record.set_want(Direction::Up);
        let mut pending = Some(ack);

        loop {
            let (pid, exited) = match self.launch() {
                Ok(generation) => generation,
                Err(e) => {
                    error!("[{}] failed to start {}: {}", self.role, self.spec.path, e);
                    if let Some(ack) = pending.take() {
                        ack.reject();
                    }
                    match self.cooldown(&mut pending) {
                        Flow::Continue => continue,
                        Flow::Stop => return,
                    }
                }
            };
            if let Some(ack) = pending.take() {
                ack.accept();
            }

            match self.watch(&exited) {
                Generation::Exited(Ok(event)) => {
                    self.publish(&event);
                    if event.outcome.is_clean() {
                        info!("[{}] {} (pid {}) exited cleanly, not restarting", self.role, self.spec.path, pid);
                        self.record.set_want(Direction::Down);
                        return;
                    }
                    warn!("[{}] {} (pid {}) {} after {:?}", self.role, self.spec.path, pid, event.outcome, event.lifetime());
                    if event.lifetime() < self.config.fast_crash_window {
                        if let Flow::Stop = self.cooldown(&mut pending) {
                            return;
                        }
                    }
                }
                Generation::Exited(Err(_)) => {
                    error!("[{}] lost track of pid {}", self.role, pid);
                    self.record.set_want(Direction::Down);
                    return;
                }
                Generation::Stopped { ack, exit } => {
                    self.stop(pid, &exited, exit);
                    if let Some(ack) = ack {
                        ack.accept();
                    }
                    return;
                }
            }
        }
    }

    /// Spawns one process generation and starts its waiter.
    fn launch(&self) -> io::Result<(u32, Receiver<ExitEvent>)> {
        debug_assert!(!self.record.lock().is_running(), "previous generation still live");
        let child = spawn(&self.spec, &self.io)?;
        let pid = child.id();
        let started = Instant::now();
        self.record.lock().mark_started(pid, started);
        info!("[{}] started {} (pid {})", self.role, self.spec.path, pid);

        Ok((pid, spawn_waiter(self.role, child, started, self.record.clone())))
    }

    /// Waits for the running generation to exit or for a stop request.
    /// A stop request wins whenever both are ready.
    fn watch(&self, exited: &Receiver<ExitEvent>) -> Generation {
        loop {
            select! {
                recv(self.down) -> ack => return Generation::Stopped { ack: ack.ok(), exit: None },
                recv(self.up) -> ack => match ack {
                    Ok(ack) => ack.accept(),
                    Err(_) => return Generation::Stopped { ack: None, exit: None },
                },
                recv(exited) -> event => {
                    return match self.down.try_recv() {
                        Ok(ack) => Generation::Stopped { ack: Some(ack), exit: Some(event) },
                        Err(_) => Generation::Exited(event),
                    };
                }
            }
        }
    }

    fn stop(&self, pid: u32, exited: &Receiver<ExitEvent>, exit: Option<Result<ExitEvent, RecvError>>) {
        self.record.set_want(Direction::Down);
        let exit = exit.unwrap_or_else(|| {
            info!("[{}] stopping {} (pid {})", self.role, self.spec.path, pid);
            if let Err(e) = deliver(&self.record, libc::SIGTERM) {
                warn!("[{}] {}", self.role, e);
            }
            exited.recv()
        });
        // Requested stops are not exit events for observers.
        match exit {
            Ok(event) => info!("[{}] {} (pid {}) stopped: {}", self.role, self.spec.path, pid, event.outcome),
            Err(_) => error!("[{}] lost track of pid {}", self.role, pid),
        }
    }

    /// Sleeps for the restart delay. A down request cuts the pause short and
    /// ends supervision; an up request becomes the pending acknowledgment.
    fn cooldown(&self, pending: &mut Option<Ack>) -> Flow {
        let timer = after(self.config.restart_delay);
        loop {
            select! {
                recv(timer) -> _ => return Flow::Continue,
                recv(self.down) -> ack => {
                    self.record.set_want(Direction::Down);
                    if let Some(ack) = pending.take() {
                        ack.reject();
                    }
                    if let Ok(ack) = ack {
                        ack.accept();
                    }
                    info!("[{}] stopped while waiting to restart {}", self.role, self.spec.path);
                    return Flow::Stop;
                }
                recv(self.up) -> ack => match ack {
                    Ok(ack) => {
                        if let Some(stale) = pending.replace(ack) {
                            stale.reject();
                        }
                    }
                    Err(_) => {
                        self.record.set_want(Direction::Down);
                        return Flow::Stop;
                    }
                },
            }
        }
    }

    fn publish(&self, event: &ExitEvent) {
        // Unbounded; only fails once every observer is gone.
        let _ = self.exits.send(event.clone());
    }
}
