//! The OTLP/HTTP receiver of tablesink.
//!
//! Accepts OTLP metrics over HTTP, expands them into samples, and hands them to the
//! [`TableExporter`](tablesink_exporter::TableExporter). The server runs as a
//! [`Service`] and stops when the [`Controller`] signals a shutdown.

#![warn(missing_docs)]

mod endpoints;
mod server;
mod service;
mod statsd;

use std::sync::Arc;

use anyhow::Result;
use tablesink_config::Config;
use tablesink_system::{Controller, ServiceRunner, Shutdown};

pub use self::server::*;
pub use self::service::*;

/// Runs the receiver and exporter until shutdown.
///
/// This creates a tokio runtime, starts the exporter and the HTTP server, and blocks until both
/// have stopped after a shutdown signal. Services that do not stop within the shutdown grace
/// period are abandoned. The grace period outlasts a statement that is running when the shutdown
/// begins, so that the exporter's final flush is never cut off mid-statement.
pub fn run(config: Config) -> Result<()> {
    let config = Arc::new(config);
    tablesink_log::info!("tablesink server starting");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("main-rt")
        .enable_all()
        .build()?;

    runtime.block_on(async {
        Controller::start(config.shutdown_timeout());
        let grace_period = config.shutdown_grace_period();

        let mut runner = ServiceRunner::new();
        let state = ServiceState::start(Arc::clone(&config), &mut runner)?;
        runner.start(HttpServer::new(config, state)?);

        let mut shutdown = Controller::shutdown_handle();
        let deadline = async move {
            let Shutdown { timeout } = shutdown.notified().await;
            if timeout.is_some() {
                tokio::time::sleep(grace_period).await;
            }
        };

        tokio::select! {
            () = runner.join() => (),
            () = deadline => tablesink_log::warn!("services did not stop within the shutdown grace period"),
        }

        anyhow::Ok(())
    })?;

    tablesink_log::info!("tablesink shutdown complete");
    Ok(())
}
