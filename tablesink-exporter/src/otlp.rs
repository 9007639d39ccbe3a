//! OTLP metrics ingestion.
//!
//! Expands OTLP `MetricsData` payloads into [`Sample`]s. The wire format of an OTLP/HTTP
//! `ExportMetricsServiceRequest` is identical to `MetricsData`, so request bodies can be passed
//! in directly.

use std::collections::BTreeMap;

use opentelemetry_proto::tonic::common::v1::KeyValue;
use opentelemetry_proto::tonic::common::v1::any_value::Value as OtelValue;
use opentelemetry_proto::tonic::metrics::v1::metric::Data;
use opentelemetry_proto::tonic::metrics::v1::number_data_point::Value as NumberValue;
use opentelemetry_proto::tonic::metrics::v1::{MetricsData, NumberDataPoint};
use prost::Message as _;

use crate::sample::{MetricKind, Sample};

/// Encoding of an OTLP payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OtlpFormat {
    /// OTLP/JSON.
    Json,
    /// Binary protobuf.
    Protobuf,
}

impl OtlpFormat {
    /// Determines the format from a `Content-Type` header value.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match mime.as_str() {
            "application/json" => Some(Self::Json),
            "application/x-protobuf" | "application/protobuf" => Some(Self::Protobuf),
            _ => None,
        }
    }

    /// Returns the `Content-Type` header value of this format.
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Protobuf => "application/x-protobuf",
        }
    }
}

/// An OTLP payload could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum OtlpError {
    /// The payload is not valid OTLP/JSON.
    #[error("invalid json payload")]
    InvalidJson(#[source] serde_json::Error),
    /// The payload is not a valid protobuf message.
    #[error("invalid protobuf payload")]
    InvalidProtobuf(#[source] prost::DecodeError),
}

/// Expands an OTLP metrics payload into samples.
///
/// Gauges and sums produce one sample per data point. All other metric types are passed on with
/// their kind and a value of `0`, so that the caller decides whether to skip them.
pub fn expand<F>(format: OtlpFormat, payload: &[u8], produce: F) -> Result<(), OtlpError>
where
    F: FnMut(Sample),
{
    let metrics_data = parse_metrics_data(format, payload)?;
    expand_metrics_data(metrics_data, produce);
    Ok(())
}

fn parse_metrics_data(format: OtlpFormat, payload: &[u8]) -> Result<MetricsData, OtlpError> {
    match format {
        OtlpFormat::Json => serde_json::from_slice(payload).map_err(|e| {
            tablesink_log::debug!(
                error = &e as &dyn std::error::Error,
                "failed to parse metrics data as json"
            );
            OtlpError::InvalidJson(e)
        }),
        OtlpFormat::Protobuf => MetricsData::decode(payload).map_err(|e| {
            tablesink_log::debug!(
                error = &e as &dyn std::error::Error,
                "failed to parse metrics data as protobuf"
            );
            OtlpError::InvalidProtobuf(e)
        }),
    }
}

/// Expands decoded metrics data into samples.
pub fn expand_metrics_data<F>(metrics_data: MetricsData, mut produce: F)
where
    F: FnMut(Sample),
{
    for resource_metrics in metrics_data.resource_metrics {
        let resource_labels = resource_metrics
            .resource
            .map(|resource| labels(&resource.attributes, BTreeMap::new()))
            .unwrap_or_default();

        for scope_metrics in resource_metrics.scope_metrics {
            for metric in scope_metrics.metrics {
                let Some(data) = metric.data else {
                    continue;
                };

                let (kind, data_points) = match data {
                    Data::Gauge(gauge) => (MetricKind::Gauge, gauge.data_points),
                    Data::Sum(sum) => (MetricKind::Sum, sum.data_points),
                    Data::Histogram(_) => {
                        produce(unsupported(&metric.name, MetricKind::Histogram));
                        continue;
                    }
                    Data::ExponentialHistogram(_) => {
                        produce(unsupported(&metric.name, MetricKind::ExponentialHistogram));
                        continue;
                    }
                    Data::Summary(_) => {
                        produce(unsupported(&metric.name, MetricKind::Summary));
                        continue;
                    }
                };

                for data_point in data_points {
                    produce(Sample {
                        name: metric.name.clone(),
                        labels: labels(&data_point.attributes, resource_labels.clone()),
                        value: number_value(&data_point),
                        kind,
                    });
                }
            }
        }
    }
}

fn unsupported(name: &str, kind: MetricKind) -> Sample {
    Sample {
        name: name.to_owned(),
        labels: BTreeMap::new(),
        value: 0.0,
        kind,
    }
}

/// Returns the value of a data point as float, treating missing values as `0`.
fn number_value(data_point: &NumberDataPoint) -> f64 {
    match data_point.value {
        Some(NumberValue::AsDouble(value)) => value,
        Some(NumberValue::AsInt(value)) => value as f64,
        None => 0.0,
    }
}

/// Adds attributes to a set of labels, overwriting existing keys.
///
/// Only scalar attribute values are converted. Arrays and key-value lists are skipped.
fn labels(attributes: &[KeyValue], mut labels: BTreeMap<String, String>) -> BTreeMap<String, String> {
    for attribute in attributes {
        let value = match attribute.value.as_ref().and_then(|v| v.value.as_ref()) {
            Some(OtelValue::StringValue(s)) => s.clone(),
            Some(OtelValue::BoolValue(b)) => b.to_string(),
            Some(OtelValue::IntValue(i)) => i.to_string(),
            Some(OtelValue::DoubleValue(d)) => d.to_string(),
            Some(OtelValue::BytesValue(bytes)) => String::from_utf8_lossy(bytes).into_owned(),
            Some(OtelValue::ArrayValue(_) | OtelValue::KvlistValue(_)) | None => continue,
        };
        labels.insert(attribute.key.clone(), value);
    }
    labels
}
