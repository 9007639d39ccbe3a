use std::sync::Arc;

use anyhow::{Context, Result};
use tablesink_config::Config;
use tablesink_exporter::{BatchWriter, DatabricksExecutor, TableExporter};
use tablesink_system::ServiceRunner;

#[derive(Debug)]
struct StateInner {
    config: Arc<Config>,
    exporter: TableExporter,
}

/// Server state shared by all request handlers.
#[derive(Clone, Debug)]
pub struct ServiceState {
    inner: Arc<StateInner>,
}

impl ServiceState {
    /// Connects to the store and starts the exporter in `runner`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: Arc<Config>, runner: &mut ServiceRunner) -> Result<Self> {
        let table = config.table()?.clone();
        let executor = DatabricksExecutor::new(config.databricks())
            .context("failed to set up the store connection")?;

        tablesink_log::info!(
            table = table.as_str(),
            warehouse = executor.warehouse_id(),
            "store configured"
        );

        let writer = BatchWriter::new(executor, table, config.exporter());
        let exporter = TableExporter::start_in(runner, writer, config.exporter().flush_interval());

        Ok(Self::new(config, exporter))
    }

    /// Creates state from an already running exporter.
    pub fn new(config: Arc<Config>, exporter: TableExporter) -> Self {
        Self {
            inner: Arc::new(StateInner { config, exporter }),
        }
    }

    /// Returns the server configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Returns the exporter handle receiving all samples.
    pub fn exporter(&self) -> &TableExporter {
        &self.inner.exporter
    }
}
