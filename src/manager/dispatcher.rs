use std::sync::Arc;

use crossbeam_channel::Sender;
use log::{debug, info};

use crate::{
    manager::task::Task,
    models::{
        message::{Command, ControlServer, Shutdown, COMMANDS},
        task::Direction,
    },
};

/// Serializes control commands against the two tasks. `up` and `down`
/// act on the service only.
pub struct Dispatcher {
    service: Arc<Task>,
    logger: Arc<Task>,
    shutdown: Sender<Shutdown>,
}

impl Dispatcher {
    pub fn new(service: Arc<Task>, logger: Arc<Task>, shutdown: Sender<Shutdown>) -> Self {
        Self { service, logger, shutdown }
    }

    /// Answers commands one at a time until `exit` arrives or every client
    /// is gone.
    pub fn serve(&self, server: ControlServer) {
        for line in server.commands.iter() {
            let Some(response) = self.handle(Command::parse(&line)) else {
                return;
            };
            if server.responses.send(response).is_err() {
                debug!("control client left before reading its response");
            }
        }
    }

    /// Returns the response line, or `None` once shutdown was requested.
    pub fn handle(&self, command: Command) -> Option<String> {
        match command {
            Command::Up => Some(self.transition(Direction::Up)),
            Command::Down => Some(self.transition(Direction::Down)),
            Command::Status => Some(format!("{}\n{}", self.service.status(), self.logger.status())),
            Command::Exit => {
                info!("exit requested over control channel");
                // Full means a shutdown is already pending.
                let _ = self.shutdown.try_send(Shutdown::Command);
                None
            }
            Command::Unknown(_) => Some(COMMANDS.join(", ")),
        }
    }

    fn transition(&self, direction: Direction) -> String {
        if self.service.wants(direction) {
            return self.service.status();
        }
        match self.service.transition(direction) {
            Ok(()) => self.service.status(),
            Err(e) => e.to_string(),
        }
    }
}
