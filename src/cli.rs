//! CLI domain: parse, route, and output only.
//! No model logic; a single route table dispatches to the suite runner,
//! the scenarios and the configuration.

mod output;
mod parse;
mod route;

pub use output::{format_run_report, format_section_heading, map_error};
pub use parse::{Cli, Commands, ConfigCommands, OutputFormat};
pub use route::{CommandOutput, RunContext};
