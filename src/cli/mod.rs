//! Command-line interface handlers

pub mod commands;

pub use commands::{cmd_config, cmd_simulate, load_settings, CliResult, SimulateOptions, SimulationReport};
