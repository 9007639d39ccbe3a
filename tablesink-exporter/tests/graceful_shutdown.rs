use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tablesink_exporter::{
    BatchWriter, ExporterConfig, PARAMS_PER_ROW, SeriesKey, Statement, StatementExecutor,
    StoreError, TableExporter,
};
use tablesink_system::{Controller, ServiceRunner, ShutdownMode};

const INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct RecordingStore {
    calls: Mutex<Vec<usize>>,
}

impl StatementExecutor for RecordingStore {
    async fn execute(&self, statement: &Statement, _timeout: Duration) -> Result<(), StoreError> {
        self.calls.lock().push(statement.params.len() / PARAMS_PER_ROW);
        Ok(())
    }
}

fn key(name: &str) -> SeriesKey {
    SeriesKey::new(name, "h1", "ep1").unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_graceful_shutdown_flushes_remaining_samples() {
    tablesink_log::init_test!();

    let store = Arc::new(RecordingStore::default());
    let writer = BatchWriter::new(
        Arc::clone(&store),
        "main.serving.metrics".parse().unwrap(),
        &ExporterConfig::default(),
    );

    let mut runner = ServiceRunner::new();
    let exporter = TableExporter::start_in(&mut runner, writer, INTERVAL);

    exporter.push_sample(key("cpu"), 1.0);
    exporter.push_sample(key("mem"), 2.0);
    exporter.push_sample(key("cpu"), 4.0);

    // The handle stays alive, so only the shutdown can stop the service.
    Controller::shutdown(ShutdownMode::Graceful);
    runner.join().await;

    assert_eq!(*store.calls.lock(), vec![2]);
    assert!(exporter.is_empty());

    // The flush timer died with the service.
    tokio::time::sleep(INTERVAL * 2).await;
    assert_eq!(*store.calls.lock(), vec![2]);
}
