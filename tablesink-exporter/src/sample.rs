use std::collections::BTreeMap;
use std::fmt;

use crate::key::{InvalidLabelError, SeriesKey};

/// The kind of metric a sample was reported as.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MetricKind {
    /// An instantaneous measurement.
    Gauge,
    /// A cumulative or delta sum.
    Sum,
    /// An explicit bucket histogram.
    Histogram,
    /// An exponential bucket histogram.
    ExponentialHistogram,
    /// A quantile summary.
    Summary,
}

impl MetricKind {
    /// Returns `true` for kinds that are aggregated into the buffer.
    ///
    /// Only gauges and sums carry a single number per data point.
    pub fn is_aggregated(self) -> bool {
        matches!(self, Self::Gauge | Self::Sum)
    }

    /// Returns the name of the kind for logs and metric tags.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gauge => "gauge",
            Self::Sum => "sum",
            Self::Histogram => "histogram",
            Self::ExponentialHistogram => "exponential_histogram",
            Self::Summary => "summary",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single labeled measurement as received from an ingestion adapter.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    /// The metric name.
    pub name: String,
    /// All labels attached to the measurement.
    pub labels: BTreeMap<String, String>,
    /// The measured value.
    pub value: f64,
    /// The kind of metric this sample belongs to.
    pub kind: MetricKind,
}

impl Sample {
    /// Derives the series this sample aggregates into.
    pub fn series_key(&self) -> Result<SeriesKey, InvalidLabelError> {
        SeriesKey::from_labels(&self.name, &self.labels)
    }
}
