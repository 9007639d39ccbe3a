use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tablesink_exporter::{
    BatchWriter, ExporterConfig, SeriesKey, Statement, StatementExecutor, StoreError,
    TableExporter,
};
use tablesink_system::{Controller, ServiceRunner, ShutdownMode};

const INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct RecordingStore {
    statements: Mutex<usize>,
}

impl StatementExecutor for RecordingStore {
    async fn execute(&self, _statement: &Statement, _timeout: Duration) -> Result<(), StoreError> {
        *self.statements.lock() += 1;
        Ok(())
    }
}

fn key(name: &str) -> SeriesKey {
    SeriesKey::new(name, "h1", "ep1").unwrap()
}

#[test]
fn test_immediate_shutdown_drops_buffered_samples() {
    let store = Arc::new(RecordingStore::default());

    // The capturing client is thread local, so the service runs on this thread.
    let captures = tablesink_statsd::with_capturing_test_client(|| {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();

        runtime.block_on(async {
            let writer = BatchWriter::new(
                Arc::clone(&store),
                "main.serving.metrics".parse().unwrap(),
                &ExporterConfig::default(),
            );

            let mut runner = ServiceRunner::new();
            let exporter = TableExporter::start_in(&mut runner, writer, INTERVAL);

            exporter.push_sample(key("cpu"), 1.0);
            exporter.push_sample(key("mem"), 2.0);

            Controller::shutdown(ShutdownMode::Immediate);
            runner.join().await;

            // Nothing was drained, the samples went down with the service.
            assert_eq!(exporter.len(), 2);
        });
    });

    assert_eq!(*store.statements.lock(), 0);
    assert!(captures.contains(&"exporter.samples.dropped:2|c|#reason:shutdown".to_owned()));
}
