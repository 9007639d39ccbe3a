use tablesink_statsd::{CounterMetric, DistributionMetric, GaugeMetric, TimerMetric};

/// Counter metrics for the exporter.
pub enum ExporterCounters {
    /// Number of samples added to the buffer.
    SamplesAccepted,

    /// Number of samples that were not buffered.
    ///
    /// This metric is tagged with:
    ///  - `reason`: Why the sample was dropped, one of `invalid_label`, `nan`,
    ///    `unsupported`, or `shutdown`.
    SamplesDropped,

    /// Number of completed flush cycles.
    Flushes,

    /// Number of statement executions, including retries.
    ChunkAttempts,

    /// Number of statement executions that were retried after a failure.
    ChunkRetries,

    /// Number of chunks that failed after exhausting all attempts.
    ChunksFailed,

    /// Number of series successfully upserted.
    RowsWritten,

    /// Number of series lost because their chunk failed.
    RowsLost,
}

impl CounterMetric for ExporterCounters {
    fn name(&self) -> &'static str {
        match *self {
            Self::SamplesAccepted => "exporter.samples.accepted",
            Self::SamplesDropped => "exporter.samples.dropped",
            Self::Flushes => "exporter.flush",
            Self::ChunkAttempts => "exporter.chunk.attempt",
            Self::ChunkRetries => "exporter.chunk.retry",
            Self::ChunksFailed => "exporter.chunk.failed",
            Self::RowsWritten => "exporter.rows.written",
            Self::RowsLost => "exporter.rows.lost",
        }
    }
}

/// Gauge metrics for the exporter.
pub enum ExporterGauges {
    /// Number of series in the buffer, reported after each flush cycle.
    BufferedSeries,
}

impl GaugeMetric for ExporterGauges {
    fn name(&self) -> &'static str {
        match *self {
            Self::BufferedSeries => "exporter.buffer.series",
        }
    }
}

/// Timer metrics for the exporter.
pub enum ExporterTimers {
    /// Time spent writing all chunks of a flush cycle.
    FlushDuration,

    /// Time spent executing a single statement attempt.
    ///
    /// This metric is tagged with:
    ///  - `success`: `true` or `false`.
    StatementDuration,
}

impl TimerMetric for ExporterTimers {
    fn name(&self) -> &'static str {
        match *self {
            Self::FlushDuration => "exporter.flush.duration",
            Self::StatementDuration => "exporter.statement.duration",
        }
    }
}

/// Distribution metrics for the exporter.
pub enum ExporterDistributions {
    /// Number of series drained in a flush cycle.
    FlushSize,
}

impl DistributionMetric for ExporterDistributions {
    fn name(&self) -> &'static str {
        match *self {
            Self::FlushSize => "exporter.flush.size",
        }
    }
}
