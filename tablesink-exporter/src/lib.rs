//! Aggregation and export of serving endpoint metrics into a table store.
//!
//! Samples are aggregated in a [`MetricBuffer`] that keeps the maximum value per series. A
//! [`FlushService`] drains the buffer once per flush cycle and hands the drained entries to a
//! [`BatchWriter`], which upserts them in chunks into a table with a rolling per-minute history
//! of every series.
//!
//! # Example
//!
//! ```no_run
//! use tablesink_exporter::{
//!     BatchWriter, DatabricksConfig, DatabricksExecutor, ExporterConfig, SeriesKey,
//!     TableExporter,
//! };
//!
//! # async fn run(databricks: DatabricksConfig) -> Result<(), Box<dyn std::error::Error>> {
//! let config = ExporterConfig::default();
//! let executor = DatabricksExecutor::new(&databricks)?;
//! let writer = BatchWriter::new(executor, "main.serving.metrics".parse()?, &config);
//!
//! let exporter = TableExporter::start(writer, config.flush_interval());
//! exporter.push_sample(SeriesKey::new("cpu_usage", "adb-1.net", "llama")?, 42.0);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod buffer;
mod config;
mod databricks;
mod key;
mod sample;
mod service;
mod statement;
mod statsd;
mod store;
mod writer;

pub mod otlp;
pub mod window;

#[cfg(any(test, feature = "test"))]
pub mod testutils;

pub use self::buffer::*;
pub use self::config::*;
pub use self::databricks::*;
pub use self::key::*;
pub use self::sample::*;
pub use self::service::*;
pub use self::statement::*;
pub use self::store::*;
pub use self::writer::*;
