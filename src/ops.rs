use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use chrono::Local;
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;

use crate::config::target::{ConnectionTarget, TargetError};
use crate::invoker::{CommandInvoker, SnapshotInvoker, SnapshotResult};
use crate::quiesce::{LockState, QuiesceController, QuiesceError, QuiescePolicy};
use crate::report::{self, HostOutcome, RunReport};
use crate::session::NodeSession;
use crate::session::mongo::MongoSession;

#[derive(Debug, Error)]
pub enum RunFailure {
    #[error(transparent)]
    Config(#[from] TargetError),
    #[error(transparent)]
    Quiesce(#[from] QuiesceError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RunFailure {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunFailure::Config(_) => 2,
            RunFailure::Quiesce(err) => err.exit_code(),
            RunFailure::Other(_) => 1,
        }
    }
}

pub struct RunOptions {
    pub snapshot_cmd: String,
    pub poll_interval: Duration,
    pub lock_timeout: Duration,
    pub all_hosts: bool,
    pub json: bool,
}

pub fn do_run(uri: &str, opts: &RunOptions) -> Result<(), RunFailure> {
    let target = ConnectionTarget::parse(uri)?;

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        ctrlc::set_handler(move || cancel.store(true, Ordering::SeqCst))
            .map_err(|e| anyhow!("failed to install interrupt handler: {e}"))?;
    }

    let invoker = CommandInvoker::new(&opts.snapshot_cmd);
    let started_at = Local::now();
    let run_id = report::run_id(&format!("{}|{}", uri, started_at.to_rfc3339()));
    if !opts.json {
        println!("{} {}", "i".yellow().bold(), format!("Run {}", run_id).yellow());
    }

    let mut outcomes = Vec::new();
    let mut worst: Option<QuiesceError> = None;
    for (host, port) in target.snapshot_hosts(opts.all_hosts) {
        let begun = Instant::now();
        let mut reached = LockState::Unlocked;
        let result = run_host(
            &target,
            host,
            *port,
            &invoker,
            opts,
            Arc::clone(&cancel),
            &mut reached,
        );

        let (snapshot_taken, detail) = match &result {
            Ok(res) => (true, res.detail.clone()),
            Err(err) => (false, Some(err.to_string())),
        };
        if !opts.json {
            report_host(host, *port, &result);
        }
        outcomes.push(HostOutcome {
            host: format!("{host}:{port}"),
            lock_state_reached: reached,
            snapshot_taken,
            detail,
            duration_ms: begun.elapsed().as_millis() as u64,
        });

        let interrupted = matches!(result, Err(QuiesceError::Cancelled { .. }));
        if let Err(err) = result {
            worst = Some(match worst.take() {
                Some(prev) if severity(&prev) >= severity(&err) => prev,
                _ => err,
            });
        }
        if interrupted {
            break;
        }
    }

    let report = RunReport {
        run_id,
        snapshot_cmd: invoker.name().to_string(),
        started_at,
        finished_at: Local::now(),
        hosts: outcomes,
    };
    if opts.json {
        println!("{}", report::to_json(&report)?);
    } else {
        println!("{}", report::render_table(&report));
    }

    match worst {
        None => Ok(()),
        Some(err) => Err(err.into()),
    }
}

fn run_host(
    target: &ConnectionTarget,
    host: &str,
    port: u16,
    invoker: &dyn SnapshotInvoker,
    opts: &RunOptions,
    cancel: Arc<AtomicBool>,
    reached: &mut LockState,
) -> Result<SnapshotResult, QuiesceError> {
    if !opts.json {
        println!(
            "{} {}",
            "i".yellow().bold(),
            format!("Connecting to {}", target.redacted_uri(host, port)).yellow()
        );
    }
    let session =
        MongoSession::connect(target, host, port).map_err(|source| QuiesceError::Connection {
            host: host.to_string(),
            source,
        })?;

    let policy = QuiescePolicy {
        poll_interval: opts.poll_interval,
        lock_timeout: opts.lock_timeout,
    };
    let controller = QuiesceController::new(session, invoker, policy, cancel);

    let bar = (!opts.json).then(|| create_progress_bar(&format!("Quiescing {host}")));
    let result = controller.run(&mut |state| {
        *reached = state;
        if let Some(bar) = &bar {
            bar.set_message(phase_message(state, host));
        }
    });
    if let Some(bar) = bar {
        match &result {
            Ok(_) => bar.finish_with_message(format!("Snapshot of {host} complete")),
            Err(_) => bar.finish_and_clear(),
        }
    }
    result
}

fn report_host(host: &str, port: u16, result: &Result<SnapshotResult, QuiesceError>) {
    match result {
        Ok(_) => {
            println!(
                "{} {}",
                "✔".green().bold(),
                format!("Snapshot of {host}:{port} complete").green()
            );
        }
        Err(err) if err.is_critical() => {
            eprintln!("{} {}: {}", "!".red().bold(), "CRITICAL".red().bold(), err);
            eprintln!(
                "{} {}",
                "!".red().bold(),
                format!("{host}:{port} may still be write-locked; run fsyncUnlock on it manually")
                    .red()
            );
        }
        Err(err) => {
            eprintln!("{} {}: {}", "!".yellow().bold(), "Failed".yellow(), err);
        }
    }
}

/// Reports the in-flight flush-lock operations on every listed host without
/// taking the lock.
pub fn do_check(uri: &str) -> Result<(), RunFailure> {
    let target = ConnectionTarget::parse(uri)?;
    for (host, port) in &target.hosts {
        let mut session = MongoSession::connect(&target, host, *port).map_err(|source| {
            QuiesceError::Connection {
                host: host.clone(),
                source,
            }
        })?;
        let pending = session
            .in_flight_lock_ops()
            .map_err(|source| QuiesceError::Introspection {
                host: host.clone(),
                source,
            })?;
        session.close();

        if pending == 0 {
            println!(
                "{} {}",
                "✔".green().bold(),
                format!("{host}:{port} has no in-flight flush-lock operations").green()
            );
        } else {
            println!(
                "{} {}",
                "!".yellow().bold(),
                format!("{host}:{port} has {pending} in-flight flush-lock operation(s)").yellow()
            );
        }
    }
    Ok(())
}

pub fn do_version() {
    println!("{} {}", "mongosnap".bold(), env!("CARGO_PKG_VERSION").cyan());
}

/// Rank for picking the error a multi-host run terminates with. A node left
/// locked dominates everything else.
fn severity(err: &QuiesceError) -> u8 {
    match err {
        QuiesceError::CriticalUnlockFailure { .. } => 6,
        QuiesceError::Cancelled { .. } => 5,
        QuiesceError::SnapshotFailed { .. } => 4,
        QuiesceError::LockConfirmationTimeout { .. } => 3,
        QuiesceError::Introspection { .. } => 3,
        QuiesceError::LockRejected { .. } => 2,
        QuiesceError::Connection { .. } => 1,
    }
}

fn phase_message(state: LockState, host: &str) -> String {
    match state {
        LockState::LockRequested => format!("Flush-and-lock requested on {host}"),
        LockState::LockConfirmed => format!("Lock confirmed on {host}; capturing snapshot"),
        LockState::Unlocking => format!("Releasing lock on {host}"),
        LockState::Unlocked | LockState::Done => format!("Quiescing {host}"),
    }
}

fn create_progress_bar(prefix: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap()
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ "),
    );
    bar.set_message(prefix.to_string());
    bar.enable_steady_tick(std::time::Duration::from_millis(80));
    bar
}
