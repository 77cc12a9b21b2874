//! Integration tests for the realm management model

mod cli_commands;
mod config_layering;
mod scenarios;
mod shared_monitor;
mod suites_run;
mod test_utils;
