//! Command line and environment configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use rt_audit::{Facility, DEFAULT_IDENT_PREFIX};

/// rt: run an interactive shell and record its output to syslog.
#[derive(Debug, Parser)]
#[command(name = "rt", version, about = "Run a shell on a pty, recording its output to syslog line by line")]
pub struct Cli {
    /// Shell to launch
    #[arg(long, env = "RT_SHELL", default_value = "/bin/bash")]
    pub shell: PathBuf,

    /// Syslog identifier to log under (default: <ident-prefix>-<login name>)
    #[arg(long, env = "RT_IDENT")]
    pub ident: Option<String>,

    /// Prefix for the identifier derived from the login name
    #[arg(long, env = "RT_IDENT_PREFIX", default_value = DEFAULT_IDENT_PREFIX)]
    pub ident_prefix: String,

    /// Syslog facility (auth, authpriv, user, daemon, local0..local7)
    #[arg(long, env = "RT_FACILITY", default_value_t = Facility::Auth)]
    pub facility: Facility,

    /// Longest wait, in milliseconds, between checks that the shell is alive
    #[arg(
        long = "exit-check-ms",
        env = "RT_EXIT_CHECK_MS",
        default_value_t = 250,
        value_parser = clap::value_parser!(u64).range(1..=60_000)
    )]
    pub exit_check_ms: u64,

    /// Log diagnostics at debug level (overridden by RT_LOG)
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    pub fn exit_check_interval(&self) -> Duration {
        Duration::from_millis(self.exit_check_ms)
    }

    /// Default log filter when RT_LOG is unset.
    pub fn default_log_filter(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else {
            "warn"
        }
    }
}
