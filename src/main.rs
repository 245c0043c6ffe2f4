//! `statekeep` command-line entry point.

use std::sync::Arc;

use anyhow::Result;
use chrono::Local;
use clap::Parser;

use statekeep::cli::Cli;
use statekeep::commands;
use statekeep::logging::{Logger, init_subscriber, run_log_name};
use statekeep::snapshot::snapshot_id;

fn main() -> Result<()> {
    let _ = enable_ansi_support::enable_ansi_support();
    let args = Cli::parse();

    let Some((operation, opts)) = args.command.operation() else {
        let name = args.command.name();
        init_subscriber(args.verbose, name);
        commands::version::run(&Logger::new(name));
        return Ok(());
    };

    let snapshot = commands::run::snapshot_dir(operation, opts, Local::now().naive_local())?;
    let run = run_log_name(operation.as_str(), Some(&snapshot_id(&snapshot)));
    init_subscriber(args.verbose, &run);
    let log = Arc::new(Logger::new(&run));
    commands::run::run(operation, opts, &snapshot, &log)
}
