use std::{
    io,
    net::SocketAddr,
    os::fd::OwnedFd,
    sync::Arc,
    thread,
};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, info, warn};

use crate::{
    app::listener,
    error::SupervisorError,
    manager::{coordinator::forward_exits, dispatcher::Dispatcher, task::Task},
    models::{
        message::{control_channel, Shutdown},
        task::{Direction, Role, TaskConfig, TaskSpec},
    },
    worker::process::{Binding, TaskIo},
};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Control protocol address; `None` disables the listener.
    pub listen: Option<String>,
    pub service: TaskSpec,
    pub logger: TaskSpec,
    /// Send SIGALRM to the logger whenever the service exits.
    pub alarm: bool,
    pub tasks: TaskConfig,
}

/// The running service/logger pair plus everything driving it.
pub struct Supervisor {
    service: Arc<Task>,
    logger: Arc<Task>,
    shutdown_tx: Sender<Shutdown>,
    shutdown_rx: Receiver<Shutdown>,
    local_addr: Option<SocketAddr>,
}

impl Supervisor {
    /// Wires the pipe, brings the logger and then the service up, and starts
    /// the dispatcher, exit coordinator and listener.
    pub fn start(config: SupervisorConfig) -> Result<Self, SupervisorError> {
        let socket = config.listen.as_deref().map(listener::bind).transpose()?;

        let (reader, writer) = io::pipe().map_err(SupervisorError::Pipe)?;
        let writer = OwnedFd::from(writer);
        let writer_err = writer.try_clone().map_err(SupervisorError::Pipe)?;

        let service = Task::spawn(
            Role::Service,
            config.service,
            config.tasks,
            TaskIo {
                stdin: Binding::Inherit,
                stdout: Binding::Fd(writer),
                stderr: Binding::Fd(writer_err),
            },
        )
        .map_err(SupervisorError::Thread)?;
        let logger = Task::spawn(
            Role::Logger,
            config.logger,
            config.tasks,
            TaskIo {
                stdin: Binding::Fd(OwnedFd::from(reader)),
                stdout: Binding::Inherit,
                stderr: Binding::Inherit,
            },
        )
        .map_err(SupervisorError::Thread)?;
        let service = Arc::new(service);
        let logger = Arc::new(logger);

        // The consumer has to be ready before the producer writes.
        for task in [&logger, &service] {
            task.transition(Direction::Up)
                .map_err(|source| SupervisorError::Startup { role: task.role(), source })?;
            info!("[{}] {}", task.role(), task.status());
        }

        let (shutdown_tx, shutdown_rx) = bounded(1);
        let (control, server) = control_channel();

        let dispatcher = Dispatcher::new(service.clone(), logger.clone(), shutdown_tx.clone());
        spawn_named("dispatcher", move || dispatcher.serve(server))?;

        let (service_exits, logger_exits) = (service.exits(), logger.exits());
        let alarm_target = logger.process();
        let alarm = config.alarm;
        spawn_named("exit-coordinator", move || {
            let tally = forward_exits(service_exits, logger_exits, alarm_target, alarm);
            debug!("exit coordinator finished: {:?}", tally);
        })?;

        let local_addr = match socket {
            Some(socket) => {
                let addr = socket.local_addr().map_err(|source| SupervisorError::Listen {
                    addr: config.listen.clone().unwrap_or_default(),
                    source,
                })?;
                spawn_named("listener", move || listener::serve(socket, control))?;
                Some(addr)
            }
            None => None,
        };

        Ok(Self {
            service,
            logger,
            shutdown_tx,
            shutdown_rx,
            local_addr,
        })
    }

    pub fn service(&self) -> &Task {
        &self.service
    }

    pub fn logger(&self) -> &Task {
        &self.logger
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Sender that triggers shutdown, for the signal forwarder.
    pub fn trigger(&self) -> Sender<Shutdown> {
        self.shutdown_tx.clone()
    }

    /// Blocks until a shutdown is requested.
    pub fn wait(&self) -> Shutdown {
        // We hold a sender ourselves, so this only returns with a message.
        self.shutdown_rx.recv().unwrap_or(Shutdown::Command)
    }

    /// Stops the service, then the logger, killing whichever does not stop
    /// in time.
    pub fn shutdown(&self) {
        for task in [&self.service, &self.logger] {
            match task.transition(Direction::Down) {
                Ok(()) => info!("[{}] {}", task.role(), task.status()),
                Err(e) => {
                    warn!("[{}] failed to stop ({}), sending SIGKILL", task.role(), e);
                    if let Err(e) = task.signal(libc::SIGKILL) {
                        warn!("[{}] {}", task.role(), e);
                    }
                }
            }
        }
    }
}

fn spawn_named<F>(name: &str, f: F) -> Result<(), SupervisorError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map(drop)
        .map_err(SupervisorError::Thread)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::task::tests::{quick, sh};
    use std::{
        fs,
        io::{BufRead, BufReader, Write},
        net::TcpStream,
        time::{Duration, Instant},
    };

    fn config(service: TaskSpec, logger: TaskSpec) -> SupervisorConfig {
        SupervisorConfig {
            listen: None,
            service,
            logger,
            alarm: false,
            tasks: quick(),
        }
    }

    fn eventually(what: &str, mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn service_output_reaches_logger() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("out.log");
        let logger = sh(&format!("exec cat >> '{}'", log.display()));
        let service = sh("echo to-stdout; echo to-stderr >&2; exec sleep 30");

        let supervisor = Supervisor::start(config(service, logger)).unwrap();

        eventually("logger output", || {
            let text = fs::read_to_string(&log).unwrap_or_default();
            text.contains("to-stdout") && text.contains("to-stderr")
        });
        supervisor.shutdown();
        assert!(supervisor.service().wants(Direction::Down));
        assert!(supervisor.logger().wants(Direction::Down));
    }

    #[test]
    fn alarm_is_forwarded_once_per_service_exit() {
        let dir = tempfile::tempdir().unwrap();
        let alarms = dir.path().join("alarms");
        let logger = sh(&format!(
            "trap 'echo alarm >> \"{}\"' ALRM; while :; do sleep 0.05; done",
            alarms.display()
        ));
        let service = TaskSpec::new("sleep", ["0.3"]);

        let supervisor = Supervisor::start(SupervisorConfig {
            alarm: true,
            ..config(service, logger)
        })
        .unwrap();

        eventually("service exit", || supervisor.service().status().starts_with("sleep: down"));
        thread::sleep(Duration::from_millis(500));
        let text = fs::read_to_string(&alarms).unwrap();
        assert_eq!(text.lines().filter(|l| *l == "alarm").count(), 1);

        supervisor.shutdown();
    }

    #[test]
    fn requested_stop_sends_no_alarm() {
        let dir = tempfile::tempdir().unwrap();
        let alarms = dir.path().join("alarms");
        let logger = sh(&format!(
            "trap 'echo alarm >> \"{}\"' ALRM; while :; do sleep 0.05; done",
            alarms.display()
        ));

        let supervisor = Supervisor::start(SupervisorConfig {
            alarm: true,
            ..config(TaskSpec::new("sleep", ["30"]), logger)
        })
        .unwrap();
        thread::sleep(Duration::from_millis(200));

        supervisor.service().transition(Direction::Down).unwrap();
        thread::sleep(Duration::from_millis(500));

        let text = fs::read_to_string(&alarms).unwrap_or_default();
        assert_eq!(text.lines().filter(|l| *l == "alarm").count(), 0);

        supervisor.shutdown();
    }

    #[test]
    fn control_protocol_over_tcp() {
        let supervisor = Supervisor::start(SupervisorConfig {
            listen: Some("127.0.0.1:0".into()),
            ..config(TaskSpec::new("sleep", ["30"]), TaskSpec::new("sleep", ["30"]))
        })
        .unwrap();
        let addr = supervisor.local_addr().unwrap();

        let mut stream = TcpStream::connect(addr).unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut line = String::new();

        stream.write_all(b"down\n").unwrap();
        reader.read_line(&mut line).unwrap();
        assert!(line.starts_with("sleep: down (signal: terminated)"), "{}", line);

        stream.write_all(b"exit\n").unwrap();
        assert_eq!(supervisor.wait(), Shutdown::Command);
        supervisor.shutdown();
        assert!(supervisor.logger().status().starts_with("sleep: down"));
    }

    #[test]
    fn hung_service_is_killed_at_shutdown() {
        let supervisor = Supervisor::start(SupervisorConfig {
            tasks: TaskConfig {
                transition_timeout: Duration::from_millis(500),
                ..quick()
            },
            ..config(sh("trap '' TERM; exec sleep 30"), TaskSpec::new("sleep", ["30"]))
        })
        .unwrap();
        thread::sleep(Duration::from_millis(300));

        supervisor.shutdown();
        eventually("forced kill", || {
            supervisor.service().status().starts_with("sh: down (signal: killed)")
        });
    }

    #[test]
    fn failed_startup_is_fatal() {
        let result = Supervisor::start(config(
            TaskSpec::new("/nonexistent/logsv-service", Vec::<String>::new()),
            TaskSpec::new("sleep", ["30"]),
        ));
        match result {
            Err(SupervisorError::Startup { role, .. }) => assert_eq!(role, Role::Service),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("startup should fail"),
        }
    }
}
