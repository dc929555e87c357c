use std::io;

use thiserror::Error;

use crate::models::task::Role;

/// Failure of a synchronous `Task::transition`. Each variant carries the
/// task's status line at the time of failure.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("{status}")]
    Rejected { status: String },

    #[error("timeout: {status}")]
    Timeout { status: String },

    /// The run-loop dropped the request without answering it.
    #[error("unresponsive: {status}")]
    Unresponsive { status: String },
}

#[derive(Error, Debug)]
pub enum SignalError {
    #[error("process not running")]
    NoProcess,

    #[error("signal delivery to pid {pid} failed: {source}")]
    Delivery {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("control channel closed")]
    Closed,
}

/// Failures that abort the whole supervisor.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("failed to create output pipe: {0}")]
    Pipe(#[source] io::Error),

    #[error("failed to start {role}: {source}")]
    Startup {
        role: Role,
        #[source]
        source: TaskError,
    },

    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn thread: {0}")]
    Thread(#[source] io::Error),
}
