//! OTLP/HTTP metrics ingestion.

use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodRouter, post};
use bytes::Bytes;
use opentelemetry_proto::tonic::collector::metrics::v1::{
    ExportMetricsPartialSuccess, ExportMetricsServiceResponse,
};
use prost::Message as _;
use tablesink_config::Config;
use tablesink_exporter::otlp::{self, OtlpFormat};
use tablesink_statsd::metric;

use crate::service::ServiceState;
use crate::statsd::{ServerCounters, ServerTimers};

async fn handle(State(state): State<ServiceState>, headers: HeaderMap, body: Bytes) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    let Some(format) = OtlpFormat::from_content_type(content_type) else {
        metric!(
            counter(ServerCounters::OtlpRequests) += 1,
            status = "unsupported_media_type",
        );
        return StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response();
    };

    let mut samples = Vec::new();
    let result = metric!(timer(ServerTimers::OtlpIngestion), {
        otlp::expand(format, &body, |sample| samples.push(sample))
    });

    if let Err(error) = result {
        metric!(counter(ServerCounters::OtlpRequests) += 1, status = "invalid");
        return (StatusCode::BAD_REQUEST, error.to_string()).into_response();
    }

    let summary = state.exporter().push_samples(samples);
    tablesink_log::trace!(
        accepted = summary.accepted,
        skipped = summary.skipped,
        rejected = summary.rejected,
        "received otlp metrics"
    );
    metric!(counter(ServerCounters::OtlpRequests) += 1, status = "accepted");

    let partial_success = (summary.rejected > 0).then(|| ExportMetricsPartialSuccess {
        rejected_data_points: summary.rejected as i64,
        error_message: "data points with invalid labels or values were dropped".to_owned(),
    });

    export_response(format, ExportMetricsServiceResponse { partial_success })
}

/// Encodes an export response in the encoding of the request.
fn export_response(format: OtlpFormat, response: ExportMetricsServiceResponse) -> Response {
    let body = match format {
        OtlpFormat::Protobuf => response.encode_to_vec(),
        OtlpFormat::Json => match serde_json::to_vec(&response) {
            Ok(body) => body,
            Err(error) => {
                tablesink_log::error!(
                    error = &error as &dyn std::error::Error,
                    "failed to serialize otlp response"
                );
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        },
    };

    ([(header::CONTENT_TYPE, format.content_type())], body).into_response()
}

pub fn route(config: &Config) -> MethodRouter<ServiceState> {
    post(handle).route_layer(DefaultBodyLimit::max(config.max_body_size()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use chrono::{TimeZone, Utc};
    use opentelemetry_proto::tonic::common::v1::any_value::Value as OtelValue;
    use opentelemetry_proto::tonic::common::v1::{AnyValue, KeyValue};
    use opentelemetry_proto::tonic::metrics::v1::metric::Data;
    use opentelemetry_proto::tonic::metrics::v1::number_data_point::Value as NumberValue;
    use opentelemetry_proto::tonic::metrics::v1::{
        Gauge, Metric, MetricsData, NumberDataPoint, ResourceMetrics, ScopeMetrics,
    };
    use opentelemetry_proto::tonic::resource::v1::Resource;
    use tablesink_exporter::testutils::MemoryTable;
    use tablesink_exporter::{BatchWriter, TableExporter};
    use tower::ServiceExt;

    use super::*;

    fn attribute(key: &str, value: &str) -> KeyValue {
        KeyValue {
            key: key.to_owned(),
            value: Some(AnyValue {
                value: Some(OtelValue::StringValue(value.to_owned())),
            }),
        }
    }

    fn metrics_data(host: &str, values: &[f64]) -> MetricsData {
        MetricsData {
            resource_metrics: vec![ResourceMetrics {
                resource: Some(Resource {
                    attributes: vec![
                        attribute("server.address", host),
                        attribute("metrics_path", "/serving-endpoints/llama/metrics"),
                    ],
                    ..Default::default()
                }),
                scope_metrics: vec![ScopeMetrics {
                    metrics: vec![Metric {
                        name: "cpu_usage".to_owned(),
                        data: Some(Data::Gauge(Gauge {
                            data_points: values
                                .iter()
                                .map(|value| NumberDataPoint {
                                    value: Some(NumberValue::AsDouble(*value)),
                                    ..Default::default()
                                })
                                .collect(),
                        })),
                        ..Default::default()
                    }],
                    ..Default::default()
                }],
                ..Default::default()
            }],
        }
    }

    fn setup() -> (axum::Router, Arc<MemoryTable>, TableExporter) {
        let config = Arc::new(Config::from_yaml_str("{}").unwrap());
        let table = Arc::new(MemoryTable::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let writer = BatchWriter::new(
            Arc::clone(&table),
            "metrics".parse().unwrap(),
            config.exporter(),
        );
        let exporter = TableExporter::start(writer, config.exporter().flush_interval());
        let state = ServiceState::new(Arc::clone(&config), exporter.clone());

        let router = axum::Router::new()
            .route("/v1/metrics", route(&config))
            .with_state(state);

        (router, table, exporter)
    }

    fn request(content_type: &str, body: impl Into<Body>) -> Request<Body> {
        Request::post("/v1/metrics")
            .header(header::CONTENT_TYPE, content_type)
            .body(body.into())
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_protobuf_request() {
        tablesink_log::init_test!();
        let (router, table, exporter) = setup();

        let payload = metrics_data("adb-1.net", &[3.0, 7.0, 5.0]).encode_to_vec();
        let response = router
            .oneshot(request("application/x-protobuf", payload))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/x-protobuf"
        );

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let decoded = ExportMetricsServiceResponse::decode(body).unwrap();
        assert_eq!(decoded.partial_success, None);

        assert_eq!(exporter.len(), 1);
        exporter.flush_now().await.unwrap();
        let row = table.row("cpu_usage", "adb-1.net", "llama").unwrap();
        assert_eq!(row.values, vec![7.0; 60]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_json_request() {
        let (router, _, exporter) = setup();

        let payload = serde_json::to_vec(&metrics_data("adb-1.net", &[1.0])).unwrap();
        let response = router
            .oneshot(request("application/json; charset=utf-8", payload))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(value.is_object());
        assert_eq!(exporter.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_success() {
        let (router, _, exporter) = setup();

        let payload = metrics_data("bad|host", &[1.0]).encode_to_vec();
        let response = router
            .oneshot(request("application/x-protobuf", payload))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let decoded = ExportMetricsServiceResponse::decode(body).unwrap();
        assert_eq!(decoded.partial_success.unwrap().rejected_data_points, 1);
        assert!(exporter.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_payload() {
        let (router, _, exporter) = setup();

        let response = router
            .oneshot(request("application/json", "not json"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(exporter.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_content_type() {
        let (router, _, _) = setup();

        let response = router
            .oneshot(request("text/plain", "cpu_usage 1"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }
}
