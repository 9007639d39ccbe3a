//! Configuration for the tablesink CLI and server.
//!
//! The configuration is read from a `config.yml` file in a configuration directory. Individual
//! values can be overridden from the command line or environment with [`OverridableConfig`].

#![warn(missing_docs)]

mod config;

pub use self::config::*;
