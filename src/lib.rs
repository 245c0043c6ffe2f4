//! Template-driven machine configuration backup and restore.
//!
//! A YAML template describes files, registry values and installed
//! applications to capture from a machine. A template's shared section is
//! inherited by the machine-specific and conditional sections that match the
//! current host, which override or extend it item by item. Templates also
//! declare prerequisites and lifecycle stages. The engine resolves the effective
//! template for the current host, then runs one of four operations
//! against a snapshot directory.
//!
//! - **[`template`]**: parse, merge and resolve templates
//! - **[`extractors`]**: capture and apply one item category each
//! - **[`engine`]**: the run state machine and its report
//! - **[`commands`]**: CLI subcommand orchestration
#![deny(clippy::or_fun_call)]
#![deny(clippy::bool_to_int_with_if)]

pub mod cli;
pub mod commands;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod exec;
pub mod extractors;
pub mod logging;
pub mod platform;
pub mod prerequisites;
pub mod snapshot;
pub mod stages;
pub mod template;
pub mod warning;
