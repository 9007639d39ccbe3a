//! Foundational system components for tablesink's services.
//!
//! Services are long-running tasks that own their state and receive messages through an
//! [`Interface`]. The [`Controller`] coordinates process shutdown across all of them.
#![warn(missing_docs)]

mod controller;
mod service;

pub use self::controller::*;
pub use self::service::*;
