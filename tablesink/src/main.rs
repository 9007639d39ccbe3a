//! The tablesink binary.
//!
//! Receives OTLP metrics from serving endpoints, keeps the maximum value of every series per flush
//! cycle, and upserts the results into a rolling per-minute history table.
//!
//! ```text
//! tablesink run --config ./config
//! tablesink config show --config ./config
//! ```

mod cli;
mod cliapp;
mod setup;

use std::process;

pub fn main() {
    let exit_code = match cli::execute() {
        Ok(()) => 0,
        Err(err) => {
            tablesink_log::ensure_error(&err);
            1
        }
    };

    process::exit(exit_code);
}
