//! CLI module for resumr - command-line interface and subcommands.
//!
//! `run` hosts the scheduler in the foreground. The other commands read or
//! maintain the persisted state directly.

pub mod commands;

pub use commands::Cli;
