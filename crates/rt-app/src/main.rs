//! rt — audited terminal sessions.
//!
//! Allocates a pty, starts a shell on it, and relays the user's terminal to
//! the shell while every line the shell prints is written to syslog.

mod cli;

use std::fs::File;
use std::io::{self, Stdin};
use std::os::fd::AsFd;

use anyhow::{Context, Result};
use clap::Parser;
use rt_audit::{AuditSink, SyslogSink, SESSION_BEGIN_MARKER};
use rt_pty::{RawModeGuard, RelayLoop, RelayState, TerminalMode};

use cli::Cli;

fn main() {
    let cli = Cli::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().filter_or("RT_LOG", cli.default_log_filter()),
    )
    .init();

    if let Err(e) = run(&cli) {
        let (code, message) = report(&e);
        eprintln!("{message}");
        std::process::exit(code);
    }
}

/// Exit status and diagnostic line for a failed session.
fn report(err: &anyhow::Error) -> (i32, String) {
    (1, format!("rt: {err:#}"))
}

fn run(cli: &Cli) -> Result<()> {
    let pty = rt_pty::allocate()?;
    let child = rt_pty::launch(pty.slave_path(), &cli.shell)?;

    // The shell gets ^C through the pty; we must not die from it.
    rt_pty::ignore_interrupts().context("failed to ignore SIGINT")?;

    let ident = match &cli.ident {
        Some(ident) => ident.clone(),
        None => rt_audit::session_ident(&cli.ident_prefix)?,
    };
    let mut sink = SyslogSink::open(&ident, cli.facility)
        .with_context(|| format!("failed to open syslog as {ident}"))?;
    sink.append(SESSION_BEGIN_MARKER);

    let stdin = io::stdin();
    let input = stdin
        .as_fd()
        .try_clone_to_owned()
        .context("failed to duplicate stdin")?;
    let state = RelayState::new(File::from(input), pty.into_master())?;

    let mut relay = RelayLoop::new(state, child, io::stdout().lock(), sink)
        .with_exit_check_interval(cli.exit_check_interval());
    if let Some(guard) = raw_mode(&stdin)? {
        relay = relay.with_terminal(guard);
    }

    let outcome = relay.run()?;
    let status = match outcome.exit.code() {
        Some(code) => format!("status {code}"),
        None => format!("{:?}", outcome.exit),
    };
    log::info!(
        "session ended ({status}): {} records, {} bytes out",
        outcome.stats.records,
        outcome.stats.bytes_out
    );

    Ok(())
}

/// Put the controlling terminal in raw mode, if there is one.
fn raw_mode(stdin: &Stdin) -> Result<Option<RawModeGuard>> {
    let mode = match TerminalMode::capture(stdin) {
        Ok(mode) => mode,
        Err(e) if e.is_not_a_tty() => {
            log::warn!("stdin is not a terminal; relaying without raw mode");
            return Ok(None);
        }
        Err(e) => return Err(e).context("failed to read terminal mode"),
    };
    let guard = RawModeGuard::engage(mode).context("failed to enter raw mode")?;
    Ok(Some(guard))
}
