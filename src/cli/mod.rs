//! CLI module for the nebula reconciler.
//!
//! This module provides the command-line interface for planning, applying
//! and inspecting OpenNebula resources.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
