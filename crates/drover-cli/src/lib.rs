//! # drover-cli
//!
//! Command-line front end: parses arguments, initializes logging, loads
//! the config, and wires the node together for `drover start`.

mod commands;

pub use commands::Cli;
