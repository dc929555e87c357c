use crossbeam_channel::{bounded, Receiver, Sender};

use crate::error::ControlError;

pub const UP: &str = "up";
pub const DOWN: &str = "down";
pub const STATUS: &str = "status";
pub const EXIT: &str = "exit";

/// Commands understood by the dispatcher, in the order they are advertised.
pub const COMMANDS: [&str; 4] = [UP, DOWN, STATUS, EXIT];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Up,
    Down,
    Status,
    Exit,
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        match line.trim() {
            UP => Command::Up,
            DOWN => Command::Down,
            STATUS => Command::Status,
            EXIT => Command::Exit,
            other => Command::Unknown(other.to_string()),
        }
    }
}

/// One-shot answer slot attached to a transition request.
#[derive(Debug)]
pub struct Ack(Sender<bool>);

impl Ack {
    pub fn pair() -> (Ack, Receiver<bool>) {
        let (tx, rx) = bounded(1);
        (Ack(tx), rx)
    }

    pub fn accept(self) {
        self.answer(true)
    }

    pub fn reject(self) {
        self.answer(false)
    }

    // The requester may already have timed out and gone away.
    fn answer(self, ok: bool) {
        let _ = self.0.send(ok);
    }
}

/// Why the supervisor is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Signal(i32),
    Command,
}

/// Caller side of the command/response rendezvous.
#[derive(Debug, Clone)]
pub struct ControlClient {
    commands: Sender<String>,
    responses: Receiver<String>,
}

impl ControlClient {
    /// Sends one command and waits for its response.
    pub fn request(&self, command: &str) -> Result<String, ControlError> {
        self.commands
            .send(command.to_string())
            .map_err(|_| ControlError::Closed)?;
        self.responses.recv().map_err(|_| ControlError::Closed)
    }
}

/// Dispatcher side of the command/response rendezvous.
#[derive(Debug)]
pub struct ControlServer {
    pub commands: Receiver<String>,
    pub responses: Sender<String>,
}

/// Both directions are zero-capacity, so at most one command is in flight.
pub fn control_channel() -> (ControlClient, ControlServer) {
    let (cmd_tx, cmd_rx) = bounded(0);
    let (resp_tx, resp_rx) = bounded(0);
    (
        ControlClient { commands: cmd_tx, responses: resp_rx },
        ControlServer { commands: cmd_rx, responses: resp_tx },
    )
}
