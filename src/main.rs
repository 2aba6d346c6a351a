pub mod config;
mod cli;
mod invoker;
mod ops;
mod quiesce;
mod report;
mod session;

use std::time::Duration;

use clap::Parser;

use cli::{Cli, Commands};

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {}", err);
        std::process::exit(err.exit_code());
    }
}

fn run() -> Result<(), ops::RunFailure> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            uri,
            snapshot_cmd,
            poll_interval_ms,
            lock_timeout_ms,
            all_hosts,
            json,
        } => {
            let opts = ops::RunOptions {
                snapshot_cmd,
                poll_interval: Duration::from_millis(poll_interval_ms),
                lock_timeout: Duration::from_millis(lock_timeout_ms),
                all_hosts,
                json,
            };
            ops::do_run(&uri, &opts)
        }
        Commands::Check { uri } => ops::do_check(&uri),
        Commands::Version => {
            ops::do_version();
            Ok(())
        }
    }
}
