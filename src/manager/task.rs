use std::{io, thread, time::Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use libc::c_int;

use crate::{
    error::{SignalError, TaskError},
    models::{
        message::Ack,
        task::{Direction, ExitEvent, Role, SharedLiveness, TaskConfig, TaskSpec},
    },
    worker::{
        process::{deliver, TaskIo},
        worker::Worker,
    },
};

/// Something that can have a signal delivered to its live process.
pub trait SignalTarget {
    /// Returns the pid the signal was delivered to.
    fn signal(&self, signal: c_int) -> Result<u32, SignalError>;
}

/// Handle to one supervised process and its run-loop.
///
/// Dropping the handle stops the run-loop; a running process is sent
/// SIGTERM first.
pub struct Task {
    role: Role,
    spec: TaskSpec,
    config: TaskConfig,
    record: SharedLiveness,
    up: Sender<Ack>,
    down: Sender<Ack>,
    exits: Receiver<ExitEvent>,
}

impl Task {
    /// Creates the task and starts its run-loop. The task stays idle until
    /// the first `transition(Direction::Up)`.
    pub fn spawn(role: Role, spec: TaskSpec, config: TaskConfig, io: TaskIo) -> io::Result<Self> {
        let (up_tx, up_rx) = bounded(1);
        let (down_tx, down_rx) = bounded(1);
        let (exit_tx, exit_rx) = unbounded();
        let record = SharedLiveness::default();

        let worker = Worker {
            role,
            spec: spec.clone(),
            io,
            config,
            record: record.clone(),
            up: up_rx,
            down: down_rx,
            exits: exit_tx,
        };
        thread::Builder::new()
            .name(format!("{}-run-loop", role))
            .spawn(move || worker.run())?;

        Ok(Self {
            role,
            spec,
            config,
            record,
            up: up_tx,
            down: down_tx,
            exits: exit_rx,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Asks the run-loop to move to `direction` and blocks until it answers
    /// or the transition timeout runs out.
    pub fn transition(&self, direction: Direction) -> Result<(), TaskError> {
        let deadline = Instant::now() + self.config.transition_timeout;
        let (ack, answer) = Ack::pair();
        let queue = match direction {
            Direction::Up => &self.up,
            Direction::Down => &self.down,
        };

        match queue.send_deadline(ack, deadline) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => return Err(TaskError::Timeout { status: self.status() }),
            Err(SendTimeoutError::Disconnected(_)) => {
                return Err(TaskError::Unresponsive { status: self.status() })
            }
        }

        match answer.recv_deadline(deadline) {
            Ok(true) => Ok(()),
            Ok(false) => Err(TaskError::Rejected { status: self.status() }),
            Err(RecvTimeoutError::Timeout) => Err(TaskError::Timeout { status: self.status() }),
            Err(RecvTimeoutError::Disconnected) => Err(TaskError::Unresponsive { status: self.status() }),
        }
    }

    /// Whether the run-loop's desired state currently equals `direction`.
    pub fn wants(&self, direction: Direction) -> bool {
        self.record.lock().want == direction
    }

    pub fn status(&self) -> String {
        let now = Instant::now();
        self.record.lock().describe(&self.spec.path, now)
    }

    pub fn signal(&self, signal: c_int) -> Result<u32, SignalError> {
        deliver(&self.record, signal)
    }

    /// Signal-only view of this task, for observers on other threads.
    pub fn process(&self) -> ProcessHandle {
        ProcessHandle {
            record: self.record.clone(),
        }
    }

    /// Every exit of this task's processes. Each event reaches one receiver.
    pub fn exits(&self) -> Receiver<ExitEvent> {
        self.exits.clone()
    }
}

#[derive(Debug, Clone)]
pub struct ProcessHandle {
    record: SharedLiveness,
}

impl SignalTarget for ProcessHandle {
    fn signal(&self, signal: c_int) -> Result<u32, SignalError> {
        deliver(&self.record, signal)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::task::ExitOutcome;
    use std::time::Duration;

    pub(crate) fn quick() -> TaskConfig {
        TaskConfig {
            restart_delay: Duration::from_millis(200),
            fast_crash_window: Duration::from_millis(200),
            transition_timeout: Duration::from_secs(2),
        }
    }

    pub(crate) fn sh(script: &str) -> TaskSpec {
        TaskSpec::new("sh", ["-c", script])
    }

    pub(crate) fn pid_of(status: &str) -> u32 {
        let rest = status.split("(pid ").nth(1).expect("status has no pid");
        rest.split(')').next().unwrap().parse().unwrap()
    }

    fn task(spec: TaskSpec, config: TaskConfig) -> Task {
        Task::spawn(Role::Service, spec, config, TaskIo::null()).unwrap()
    }

    #[test]
    fn idle_task_reports_never_run() {
        let task = task(TaskSpec::new("sleep", ["30"]), quick());
        assert_eq!(task.status(), "sleep: down (exit status 0)");
        assert!(task.wants(Direction::Down));
        assert!(matches!(task.signal(libc::SIGTERM), Err(SignalError::NoProcess)));
    }

    #[test]
    fn clean_exit_is_not_restarted() {
        let task = task(TaskSpec::new("sleep", ["0.1"]), quick());
        let exits = task.exits();

        task.transition(Direction::Up).unwrap();
        let event = exits.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(event.outcome.is_clean());

        assert!(exits.recv_timeout(Duration::from_millis(600)).is_err());
        assert!(task.status().starts_with("sleep: down (exit status 0)"));
        assert!(task.wants(Direction::Down));
    }

    #[test]
    fn fast_crash_waits_before_respawning() {
        let config = quick();
        let task = task(sh("exit 1"), config);
        let exits = task.exits();

        task.transition(Direction::Up).unwrap();
        let first = exits.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = exits.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(first.outcome, ExitOutcome::Exited(1));
        assert_ne!(first.pid, second.pid);
        assert!(second.started.duration_since(first.exited) >= config.restart_delay);
        assert!(task.wants(Direction::Up));

        task.transition(Direction::Down).unwrap();
        assert!(task.wants(Direction::Down));
    }

    #[test]
    fn slow_crash_respawns_immediately() {
        let config = TaskConfig {
            restart_delay: Duration::from_secs(5),
            fast_crash_window: Duration::from_millis(100),
            transition_timeout: Duration::from_secs(2),
        };
        let task = task(sh("sleep 0.3; exit 1"), config);
        let exits = task.exits();

        task.transition(Direction::Up).unwrap();
        let first = exits.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = exits.recv_timeout(Duration::from_secs(3)).unwrap();

        assert!(second.started.duration_since(first.exited) < Duration::from_secs(1));
        task.transition(Direction::Down).unwrap();
    }

    #[test]
    fn down_then_up_starts_a_fresh_process() {
        let task = task(TaskSpec::new("sleep", ["30"]), quick());
        let exits = task.exits();

        task.transition(Direction::Up).unwrap();
        let before = pid_of(&task.status());

        task.transition(Direction::Down).unwrap();
        assert!(task.status().starts_with("sleep: down (signal: terminated)"));
        assert!(exits.try_recv().is_err(), "requested stop was published as an exit");

        task.transition(Direction::Up).unwrap();
        let after = pid_of(&task.status());
        assert_ne!(before, after);

        task.transition(Direction::Down).unwrap();
    }

    #[test]
    fn redundant_requests_are_acknowledged() {
        let task = task(TaskSpec::new("sleep", ["30"]), quick());

        task.transition(Direction::Down).unwrap();
        task.transition(Direction::Up).unwrap();
        let pid = pid_of(&task.status());
        task.transition(Direction::Up).unwrap();
        assert_eq!(pid_of(&task.status()), pid);

        task.transition(Direction::Down).unwrap();
    }

    #[test]
    fn spawn_failure_is_rejected_and_retried() {
        let task = task(TaskSpec::new("/nonexistent/logsv-test", Vec::<String>::new()), quick());

        let err = task.transition(Direction::Up).unwrap_err();
        assert!(matches!(err, TaskError::Rejected { .. }));
        assert_eq!(err.to_string(), "/nonexistent/logsv-test: down (exit status 0)");
        assert!(task.wants(Direction::Up));

        task.transition(Direction::Down).unwrap();
        assert!(task.wants(Direction::Down));
    }

    #[test]
    fn unanswered_down_times_out_and_kill_recovers() {
        let config = TaskConfig {
            transition_timeout: Duration::from_millis(500),
            ..quick()
        };
        let task = task(sh("trap '' TERM; exec sleep 30"), config);

        task.transition(Direction::Up).unwrap();
        thread::sleep(Duration::from_millis(300));

        let err = task.transition(Direction::Down).unwrap_err();
        assert!(matches!(err, TaskError::Timeout { .. }));
        assert!(err.to_string().starts_with("timeout: sh: up (pid "));

        task.signal(libc::SIGKILL).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !task.status().starts_with("sh: down (signal: killed)") {
            assert!(Instant::now() < deadline, "kill not observed: {}", task.status());
            thread::sleep(Duration::from_millis(20));
        }
        assert!(task.wants(Direction::Down));
    }
}
