use std::{
    fmt,
    os::unix::process::ExitStatusExt,
    process::ExitStatus,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

/// Which of the two supervised processes a task drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Service,
    Logger,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Service => f.write_str("service"),
            Role::Logger => f.write_str("logger"),
        }
    }
}

/// Desired state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    Up,
    #[default]
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => f.write_str("up"),
            Direction::Down => f.write_str("down"),
        }
    }
}

/// Command line a task is bound to for its whole life.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub path: String,
    pub args: Vec<String>,
    /// Added on top of the supervisor's own environment.
    pub env: Vec<(String, String)>,
}

impl TaskSpec {
    pub fn new<I, S>(path: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            path: path.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: vec![],
        }
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }
}

/// Timings of the run-loop and of `transition`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskConfig {
    /// Pause before respawning after a failed spawn or a fast crash.
    pub restart_delay: Duration,
    /// A crash this soon after spawn counts as a fast crash.
    pub fast_crash_window: Duration,
    pub transition_timeout: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            restart_delay: Duration::from_secs(1),
            fast_crash_window: Duration::from_secs(1),
            transition_timeout: Duration::from_secs(7),
        }
    }
}

/// How a process generation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Exited(i32),
    Signaled { signal: i32, core_dumped: bool },
    WaitFailed(String),
}

impl ExitOutcome {
    pub fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            ExitOutcome::Exited(code)
        } else if let Some(signal) = status.signal() {
            ExitOutcome::Signaled {
                signal,
                core_dumped: status.core_dumped(),
            }
        } else {
            ExitOutcome::WaitFailed(format!("unrecognized wait status {}", status.into_raw()))
        }
    }

    /// A zero exit status is an intentional stop.
    pub fn is_clean(&self) -> bool {
        matches!(self, ExitOutcome::Exited(0))
    }
}

impl Default for ExitOutcome {
    fn default() -> Self {
        ExitOutcome::Exited(0)
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Exited(code) => write!(f, "exit status {}", code),
            ExitOutcome::Signaled { signal, core_dumped } => {
                write!(f, "signal: {}", signal_name(*signal))?;
                if *core_dumped {
                    f.write_str(" (core dumped)")?;
                }
                Ok(())
            }
            ExitOutcome::WaitFailed(reason) => write!(f, "wait failed: {}", reason),
        }
    }
}

fn signal_name(signal: i32) -> String {
    let name = match signal {
        libc::SIGHUP => "hangup",
        libc::SIGINT => "interrupt",
        libc::SIGQUIT => "quit",
        libc::SIGILL => "illegal instruction",
        libc::SIGABRT => "aborted",
        libc::SIGBUS => "bus error",
        libc::SIGFPE => "floating point exception",
        libc::SIGKILL => "killed",
        libc::SIGUSR1 => "user defined signal 1",
        libc::SIGSEGV => "segmentation fault",
        libc::SIGUSR2 => "user defined signal 2",
        libc::SIGPIPE => "broken pipe",
        libc::SIGALRM => "alarm clock",
        libc::SIGTERM => "terminated",
        other => return format!("signal {}", other),
    };
    name.to_string()
}

/// One observed process exit, as published to exit observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitEvent {
    pub role: Role,
    pub pid: u32,
    pub outcome: ExitOutcome,
    pub started: Instant,
    pub exited: Instant,
}

impl ExitEvent {
    pub fn lifetime(&self) -> Duration {
        self.exited.saturating_duration_since(self.started)
    }
}

/// Liveness record of a task. Written by the run-loop and its waiter,
/// read by status queries and signal delivery.
#[derive(Debug, Default)]
pub struct Liveness {
    pub want: Direction,
    /// Set iff a spawned process has not been reaped yet.
    pub pid: Option<u32>,
    pub started: Option<Instant>,
    pub exited: Option<Instant>,
    pub last_exit: ExitOutcome,
}

impl Liveness {
    pub fn is_running(&self) -> bool {
        self.pid.is_some()
    }

    pub fn mark_started(&mut self, pid: u32, at: Instant) {
        self.pid = Some(pid);
        self.started = Some(at);
    }

    pub fn mark_exited(&mut self, outcome: ExitOutcome, at: Instant) {
        self.pid = None;
        self.exited = Some(at);
        self.last_exit = outcome;
    }

    pub fn describe(&self, path: &str, now: Instant) -> String {
        match (self.pid, self.started, self.exited) {
            (Some(pid), Some(started), _) => format!(
                "{}: {} (pid {}) {:?}",
                path,
                Direction::Up,
                pid,
                now.saturating_duration_since(started)
            ),
            (None, _, Some(exited)) => format!(
                "{}: {} ({}) {:?}",
                path,
                Direction::Down,
                self.last_exit,
                now.saturating_duration_since(exited)
            ),
            _ => format!("{}: {} ({})", path, Direction::Down, self.last_exit),
        }
    }
}

/// Liveness record shared between the run-loop and its callers.
#[derive(Debug, Clone, Default)]
pub struct SharedLiveness(Arc<Mutex<Liveness>>);

impl SharedLiveness {
    pub fn lock(&self) -> MutexGuard<'_, Liveness> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_want(&self, want: Direction) {
        self.lock().want = want;
    }
}
