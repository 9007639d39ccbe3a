use std::time::Duration;

use tablesink_statsd::metric;
use tablesink_system::{Controller, Shutdown, ShutdownHandle};
use tokio::time::Instant;

use crate::config::ExporterConfig;
use crate::key::SeriesKey;
use crate::statement::{Statement, TableName, merge_statement};
use crate::statsd::{ExporterCounters, ExporterTimers};
use crate::store::{StatementExecutor, StoreError};

/// Outcome of writing one drained buffer to the store.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FlushReport {
    /// Number of chunks written or attempted.
    pub chunks: usize,
    /// Number of chunks that failed after all attempts.
    pub chunks_failed: usize,
    /// Number of series upserted.
    pub rows_written: usize,
    /// Number of series whose values were lost for this cycle.
    pub rows_lost: usize,
}

impl FlushReport {
    /// Returns `true` if every chunk was written.
    pub fn is_complete(&self) -> bool {
        self.chunks_failed == 0
    }
}

#[derive(Debug, thiserror::Error)]
enum ChunkError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("shutdown deadline reached before the chunk was written")]
    Deadline,
}

/// Writes drained entries to the store in chunks.
///
/// Chunks are written sequentially. Every chunk becomes a single upsert statement that is
/// attempted up to the configured number of times, with a fixed backoff in between. A chunk
/// that still fails is logged and dropped, and writing continues with the next chunk. Failed
/// entries are not returned to the buffer.
///
/// Once a shutdown has been requested, the writer has the shutdown timeout left from the moment
/// it notices. Statements are never abandoned while running. Instead, every attempt receives a
/// statement timeout that ends at the deadline, and no attempt or backoff starts past it.
#[derive(Debug)]
pub struct BatchWriter<E> {
    executor: E,
    table: TableName,
    chunk_size: usize,
    retries: u32,
    retry_backoff: Duration,
    statement_timeout: Duration,
    shutdown: ShutdownHandle,
    observed_shutdown: Option<Shutdown>,
    deadline: Option<Instant>,
}

impl<E: StatementExecutor> BatchWriter<E> {
    /// Creates a writer for `table`.
    pub fn new(executor: E, table: TableName, config: &ExporterConfig) -> Self {
        Self {
            executor,
            table,
            chunk_size: config.chunk_size.max(1),
            retries: config.retries.max(1),
            retry_backoff: config.retry_backoff(),
            statement_timeout: config.statement_timeout(),
            shutdown: Controller::shutdown_handle(),
            observed_shutdown: None,
            deadline: None,
        }
    }

    /// Returns the table this writer upserts into.
    pub fn table(&self) -> &TableName {
        &self.table
    }

    /// Writes all entries and reports the result.
    ///
    /// This never fails. Failures of individual chunks are logged and reflected in the report.
    pub async fn flush(&mut self, entries: Vec<(SeriesKey, f64)>) -> FlushReport {
        let mut report = FlushReport::default();

        for chunk in entries.chunks(self.chunk_size) {
            report.chunks += 1;

            let statement = merge_statement(&self.table, chunk);
            match self.write_chunk(&statement).await {
                Ok(()) => {
                    tablesink_log::debug!(
                        rows = chunk.len(),
                        chunk = report.chunks,
                        "flushed metrics chunk"
                    );
                    report.rows_written += chunk.len();
                    metric!(counter(ExporterCounters::RowsWritten) += chunk.len() as i64);
                }
                Err(error) => {
                    tablesink_log::error!(
                        error = &error as &dyn std::error::Error,
                        tags.table = self.table.as_str(),
                        rows = chunk.len(),
                        "failed to flush metrics chunk"
                    );
                    report.chunks_failed += 1;
                    report.rows_lost += chunk.len();
                    metric!(counter(ExporterCounters::ChunksFailed) += 1);
                    metric!(counter(ExporterCounters::RowsLost) += chunk.len() as i64);
                }
            }
        }

        report
    }

    /// Returns the deadline for all remaining work, if a shutdown has been requested.
    ///
    /// A later shutdown, such as an immediate one after a graceful one, can only shorten it.
    fn deadline(&mut self) -> Option<Instant> {
        let shutdown = self.shutdown.get();
        if shutdown.is_some() && shutdown != self.observed_shutdown {
            self.observed_shutdown = shutdown;

            let timeout = shutdown.and_then(|s| s.timeout).unwrap_or_default();
            let deadline = Instant::now() + timeout;
            self.deadline = Some(self.deadline.map_or(deadline, |d| d.min(deadline)));
        }

        self.deadline
    }

    /// Returns the timeout for the next attempt, or `None` if no time is left.
    fn attempt_timeout(&mut self) -> Option<Duration> {
        let Some(deadline) = self.deadline() else {
            return Some(self.statement_timeout);
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        (!remaining.is_zero()).then(|| remaining.min(self.statement_timeout))
    }

    /// Sleeps for the retry backoff unless that would cross the shutdown deadline.
    async fn backoff(&mut self) -> Result<(), ChunkError> {
        let wake = Instant::now() + self.retry_backoff;

        if self.deadline().is_none() {
            tokio::select! {
                () = tokio::time::sleep_until(wake) => return Ok(()),
                _ = self.shutdown.notified() => (),
            }
        }

        match self.deadline() {
            Some(deadline) if wake >= deadline => Err(ChunkError::Deadline),
            _ => {
                tokio::time::sleep_until(wake).await;
                Ok(())
            }
        }
    }

    async fn write_chunk(&mut self, statement: &Statement) -> Result<(), ChunkError> {
        let mut attempt = 1;

        loop {
            let timeout = self.attempt_timeout().ok_or(ChunkError::Deadline)?;
            metric!(counter(ExporterCounters::ChunkAttempts) += 1);

            let start = Instant::now();
            let result = self.executor.execute(statement, timeout).await;
            metric!(
                timer(ExporterTimers::StatementDuration) = start.elapsed(),
                success = if result.is_ok() { "true" } else { "false" },
            );

            match result {
                Ok(()) => return Ok(()),
                Err(error) if attempt < self.retries => {
                    tablesink_log::warn!(
                        error = &error as &dyn std::error::Error,
                        attempt,
                        backoff = ?self.retry_backoff,
                        "flush failed for chunk, retrying"
                    );
                    metric!(counter(ExporterCounters::ChunkRetries) += 1);
                    self.backoff().await?;
                    attempt += 1;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::testutils::MemoryTable;

    fn table() -> Arc<MemoryTable> {
        Arc::new(MemoryTable::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ))
    }

    fn writer(table: &Arc<MemoryTable>, chunk_size: usize) -> BatchWriter<Arc<MemoryTable>> {
        let config = ExporterConfig {
            chunk_size,
            ..Default::default()
        };
        BatchWriter::new(
            Arc::clone(table),
            "main.serving.metrics".parse().unwrap(),
            &config,
        )
    }

    fn entries(count: usize) -> Vec<(SeriesKey, f64)> {
        (0..count)
            .map(|i| (SeriesKey::new(format!("m{i}"), "h1", "ep1").unwrap(), i as f64))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunking() {
        tablesink_log::init_test!();

        let store = table();
        let report = writer(&store, 50).flush(entries(120)).await;

        assert_eq!(store.calls(), vec![50, 50, 20]);
        assert_eq!(
            report,
            FlushReport {
                chunks: 3,
                chunks_failed: 0,
                rows_written: 120,
                rows_lost: 0,
            }
        );
        assert_eq!(store.len(), 120);
        assert_eq!(store.row("m7", "h1", "ep1").unwrap().values, vec![7.0; 60]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exact_multiple_of_chunk_size() {
        let store = table();
        let report = writer(&store, 50).flush(entries(100)).await;

        assert_eq!(store.calls(), vec![50, 50]);
        assert_eq!(report.chunks, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_flush() {
        let store = table();
        let report = writer(&store, 50).flush(Vec::new()).await;

        assert!(store.calls().is_empty());
        assert_eq!(report, FlushReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        tablesink_log::init_test!();

        let store = table();
        store.fail_next(2);

        let start = Instant::now();
        let report = writer(&store, 50).flush(entries(10)).await;

        assert_eq!(store.calls(), vec![10, 10, 10]);
        assert!(report.is_complete());
        assert_eq!(report.rows_written, 10);
        // Two backoffs between three attempts.
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_backoff_after_last_attempt() {
        let store = table();
        store.fail_next(3);

        let start = Instant::now();
        let report = writer(&store, 50).flush(entries(10)).await;

        assert_eq!(store.calls().len(), 3);
        assert_eq!(report.chunks_failed, 1);
        assert_eq!(report.rows_lost, 10);
        assert!(store.is_empty());
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_chunk_does_not_affect_others() {
        tablesink_log::init_test!();

        let store = table();
        store.fail_series("m75");

        let report = writer(&store, 50).flush(entries(150)).await;

        // Three chunks, the failing one attempted three times.
        assert_eq!(store.calls(), vec![50, 50, 50, 50, 50]);
        assert_eq!(
            report,
            FlushReport {
                chunks: 3,
                chunks_failed: 1,
                rows_written: 100,
                rows_lost: 50,
            }
        );
        assert_eq!(store.len(), 100);
        assert!(store.row("m75", "h1", "ep1").is_none());
        assert!(store.row("m74", "h1", "ep1").is_some());
        assert!(store.row("m100", "h1", "ep1").is_some());
    }

    #[test]
    fn test_emits_metrics() {
        let store = table();
        store.fail_next(1);
        let mut writer = writer(&store, 50);

        // The capturing client is thread local, so drive the flush on this thread.
        let mut report = None;
        let captures = tablesink_statsd::with_capturing_test_client(|| {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            report = Some(runtime.block_on(writer.flush(entries(3))));
        });

        assert!(report.unwrap().is_complete());
        assert!(captures.contains(&"exporter.chunk.retry:1|c".to_owned()));
        assert!(captures.contains(&"exporter.rows.written:3|c".to_owned()));
        assert_eq!(
            captures
                .iter()
                .filter(|c| c.starts_with("exporter.chunk.attempt:"))
                .count(),
            2
        );
    }
}
