use crossbeam_channel::{never, select, Receiver};
use log::{debug, warn};

use crate::{manager::task::SignalTarget, models::task::ExitEvent};

/// Counts of what the coordinator observed before its channels closed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExitTally {
    pub service_exits: usize,
    pub logger_exits: usize,
    pub alarms_sent: usize,
}

/// Watches both exit channels and, when `alarm` is set, sends SIGALRM to
/// the logger on every service exit. Returns once both channels close.
pub fn forward_exits<L: SignalTarget>(
    service_exits: Receiver<ExitEvent>,
    logger_exits: Receiver<ExitEvent>,
    logger: L,
    alarm: bool,
) -> ExitTally {
    let mut tally = ExitTally::default();
    let mut service_open = true;
    let mut logger_open = true;
    let closed = never();

    while service_open || logger_open {
        let service = if service_open { &service_exits } else { &closed };
        let logged = if logger_open { &logger_exits } else { &closed };

        select! {
            recv(service) -> event => match event {
                Ok(event) => {
                    tally.service_exits += 1;
                    debug!("{} pid {} exited: {}", event.role, event.pid, event.outcome);
                    if alarm {
                        tally.alarms_sent += 1;
                        match logger.signal(libc::SIGALRM) {
                            Ok(pid) => debug!("sent SIGALRM to logger (pid {})", pid),
                            Err(e) => warn!("error sending exit signal to logger: {}", e),
                        }
                    }
                }
                Err(_) => service_open = false,
            },
            recv(logged) -> event => match event {
                Ok(event) => {
                    tally.logger_exits += 1;
                    debug!("{} pid {} exited: {}", event.role, event.pid, event.outcome);
                }
                Err(_) => logger_open = false,
            },
        }
    }

    tally
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::SignalError,
        models::task::{ExitOutcome, Role},
    };
    use crossbeam_channel::unbounded;
    use std::{cell::RefCell, time::Instant};

    #[derive(Default)]
    struct Recorder {
        sent: RefCell<Vec<i32>>,
        present: bool,
    }

    impl SignalTarget for &Recorder {
        fn signal(&self, signal: i32) -> Result<u32, SignalError> {
            self.sent.borrow_mut().push(signal);
            if self.present {
                Ok(7)
            } else {
                Err(SignalError::NoProcess)
            }
        }
    }

    fn exit(role: Role, pid: u32) -> ExitEvent {
        let now = Instant::now();
        ExitEvent {
            role,
            pid,
            outcome: ExitOutcome::Exited(1),
            started: now,
            exited: now,
        }
    }

    #[test]
    fn one_alarm_per_service_exit() {
        let (svc_tx, svc_rx) = unbounded();
        let (log_tx, log_rx) = unbounded();
        let logger = Recorder { present: true, ..Default::default() };

        svc_tx.send(exit(Role::Service, 1)).unwrap();
        svc_tx.send(exit(Role::Service, 2)).unwrap();
        log_tx.send(exit(Role::Logger, 3)).unwrap();
        drop((svc_tx, log_tx));

        let tally = forward_exits(svc_rx, log_rx, &logger, true);

        assert_eq!(tally, ExitTally { service_exits: 2, logger_exits: 1, alarms_sent: 2 });
        assert_eq!(*logger.sent.borrow(), vec![libc::SIGALRM, libc::SIGALRM]);
    }

    #[test]
    fn failed_delivery_is_not_fatal() {
        let (svc_tx, svc_rx) = unbounded();
        let (_, log_rx) = unbounded::<ExitEvent>();
        let logger = Recorder::default();

        svc_tx.send(exit(Role::Service, 1)).unwrap();
        svc_tx.send(exit(Role::Service, 2)).unwrap();
        drop(svc_tx);

        let tally = forward_exits(svc_rx, log_rx, &logger, true);
        assert_eq!(tally.alarms_sent, 2);
    }

    #[test]
    fn alarm_disabled_sends_nothing() {
        let (svc_tx, svc_rx) = unbounded();
        let (_, log_rx) = unbounded::<ExitEvent>();
        let logger = Recorder { present: true, ..Default::default() };

        svc_tx.send(exit(Role::Service, 1)).unwrap();
        drop(svc_tx);

        let tally = forward_exits(svc_rx, log_rx, &logger, false);
        assert_eq!(tally.service_exits, 1);
        assert!(logger.sent.borrow().is_empty());
    }
}
