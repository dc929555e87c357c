use std::time::Duration;

use clap::Parser;

use crate::{
    app::supervisor::SupervisorConfig,
    models::task::{TaskConfig, TaskSpec},
};

#[derive(Parser, Debug)]
#[command(name = "logsv", version)]
#[command(about = "Keeps a service and its logger running, with the service's output piped into the logger")]
pub struct Cli {
    /// Listen address for the control protocol; empty disables it
    #[arg(long, default_value = "")]
    pub laddr: String,

    /// Service command to run
    #[arg(long = "sv.cmd", default_value = "tee")]
    pub sv_cmd: String,

    /// Service command argument (may be specified multiple times)
    #[arg(long = "sv.arg", allow_hyphen_values = true)]
    pub sv_args: Vec<String>,

    /// KEY=VALUE added to the service environment (may be specified multiple times)
    #[arg(long = "sv.env", value_parser = parse_env)]
    pub sv_env: Vec<(String, String)>,

    /// Logger command to run
    #[arg(long = "log.cmd", default_value = "tee")]
    pub log_cmd: String,

    /// Logger command argument (may be specified multiple times)
    #[arg(long = "log.arg", allow_hyphen_values = true)]
    pub log_args: Vec<String>,

    /// KEY=VALUE added to the logger environment (may be specified multiple times)
    #[arg(long = "log.env", value_parser = parse_env)]
    pub log_env: Vec<(String, String)>,

    /// Send SIGALRM to the logger when the service exits
    #[arg(long = "log.alarm")]
    pub log_alarm: bool,

    /// Delay before restarting after a failed spawn or a fast crash
    #[arg(long, default_value_t = 1000)]
    pub restart_wait_ms: u64,

    /// Crashes within this long of spawning count as fast crashes
    #[arg(long, default_value_t = 1000)]
    pub fast_crash_ms: u64,

    /// How long an up/down transition may take
    #[arg(long, default_value_t = 7000)]
    pub timeout_ms: u64,
}

impl Cli {
    pub fn into_config(self) -> SupervisorConfig {
        SupervisorConfig {
            listen: Some(self.laddr).filter(|addr| !addr.is_empty()),
            service: TaskSpec::new(self.sv_cmd, self.sv_args).with_env(self.sv_env),
            logger: TaskSpec::new(self.log_cmd, self.log_args).with_env(self.log_env),
            alarm: self.log_alarm,
            tasks: TaskConfig {
                restart_delay: Duration::from_millis(self.restart_wait_ms),
                fast_crash_window: Duration::from_millis(self.fast_crash_ms),
                transition_timeout: Duration::from_millis(self.timeout_ms),
            },
        }
    }
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{}`", s)),
    }
}
