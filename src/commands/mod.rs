//! Subcommand orchestration: turn parsed CLI options into an engine run.
pub mod run;
pub mod version;
