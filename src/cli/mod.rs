//! CLI module for the strata provisioning tool.
//!
//! This module provides the command-line interface for planning and applying
//! resource templates.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
