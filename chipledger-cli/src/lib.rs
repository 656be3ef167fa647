//! Command-line front end for the chip ledger.
//!
//! The binary wires these modules to `clap`; keeping them in a library lets
//! the integration tests drive each command directly.

pub mod commands;
pub mod config;

pub use commands::{
    BalanceSheet, inspect_report, open_store, parse_balances, repair_store, settle_report,
    sync_once,
};
pub use config::{AppConfig, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH};
