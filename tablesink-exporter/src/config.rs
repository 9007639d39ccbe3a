use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables of the flush cycle and the batch writer.
///
/// All time values are in seconds.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ExporterConfig {
    /// Time between the first sample of a cycle and the flush of that cycle.
    ///
    /// Defaults to `60` seconds.
    pub flush_interval: u64,

    /// Maximum number of series upserted by a single statement.
    ///
    /// Defaults to `50`.
    pub chunk_size: usize,

    /// Number of attempts per chunk, including the first one.
    ///
    /// Defaults to `3`.
    pub retries: u32,

    /// Delay between two attempts of the same chunk.
    ///
    /// Defaults to `5` seconds.
    pub retry_backoff: u64,

    /// Maximum time a single statement attempt may take.
    ///
    /// Defaults to `120` seconds.
    pub statement_timeout: u64,
}

impl ExporterConfig {
    /// Returns the flush interval as a duration.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval)
    }

    /// Returns the backoff between attempts as a duration.
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff)
    }

    /// Returns the per-attempt statement timeout as a duration.
    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.statement_timeout)
    }
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            flush_interval: 60,
            chunk_size: 50,
            retries: 3,
            retry_backoff: 5,
            statement_timeout: 120,
        }
    }
}
