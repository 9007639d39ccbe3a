use tablesink_statsd::{CounterMetric, TimerMetric};

/// Counter metrics for the HTTP server.
pub enum ServerCounters {
    /// Number of times the HTTP server was started.
    ServerStarting,

    /// Number of OTLP metrics requests.
    ///
    /// This metric is tagged with:
    ///  - `status`: `accepted`, `invalid`, or `unsupported_media_type`.
    OtlpRequests,
}

impl CounterMetric for ServerCounters {
    fn name(&self) -> &'static str {
        match self {
            Self::ServerStarting => "server.starting",
            Self::OtlpRequests => "server.otlp.requests",
        }
    }
}

/// Timer metrics for the HTTP server.
pub enum ServerTimers {
    /// Time spent expanding an OTLP payload and buffering its samples.
    OtlpIngestion,
}

impl TimerMetric for ServerTimers {
    fn name(&self) -> &'static str {
        match self {
            Self::OtlpIngestion => "server.otlp.ingestion",
        }
    }
}
