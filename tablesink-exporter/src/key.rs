//! Identity of a buffered series.
//!
//! Every series is identified by the triple of metric name, host, and serving endpoint. Inside
//! the exporter this triple is carried as a [`SeriesKey`], which is validated once on
//! construction. For logs and external interchange it encodes to a single string where the three
//! parts are joined by [`SEPARATOR`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

/// Reserved character joining the parts of an encoded series key.
pub const SEPARATOR: char = '|';

/// Label carrying the host of the serving endpoint.
pub const HOST_LABEL: &str = "server.address";

/// Label carrying the scrape path, from which the serving endpoint is extracted.
pub const METRICS_PATH_LABEL: &str = "metrics_path";

static ENDPOINT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/serving-endpoints/([^/]+)/metrics").unwrap());

/// A label value contains the reserved [`SEPARATOR`].
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("{field} contains the reserved separator: {value:?}")]
pub struct InvalidLabelError {
    field: &'static str,
    value: String,
}

impl InvalidLabelError {
    /// The name of the offending field.
    pub fn field(&self) -> &'static str {
        self.field
    }
}

/// An encoded key does not consist of exactly three parts.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("malformed series key {key:?}: expected 3 parts, found {parts}")]
pub struct MalformedKeyError {
    key: String,
    parts: usize,
}

/// The composite identity of a series.
///
/// None of the parts contains [`SEPARATOR`], which makes the encoding through [`Display`] and the
/// decoding through [`FromStr`] lossless. Host and endpoint may be empty.
///
/// [`Display`]: fmt::Display
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SeriesKey {
    metric_name: String,
    host: String,
    serving_endpoint: String,
}

impl SeriesKey {
    /// Creates a validated key.
    pub fn new(
        metric_name: impl Into<String>,
        host: impl Into<String>,
        serving_endpoint: impl Into<String>,
    ) -> Result<Self, InvalidLabelError> {
        Ok(Self {
            metric_name: check_label("metric_name", metric_name.into())?,
            host: check_label("host", host.into())?,
            serving_endpoint: check_label("serving_endpoint", serving_endpoint.into())?,
        })
    }

    /// Derives the key of a sample from its name and labels.
    ///
    /// The host is taken verbatim from the [`HOST_LABEL`]. The serving endpoint is the path
    /// segment following `/serving-endpoints/` in the [`METRICS_PATH_LABEL`]. Missing labels and
    /// paths that do not match yield empty parts.
    pub fn from_labels(
        metric_name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Self, InvalidLabelError> {
        let host = labels.get(HOST_LABEL).map(String::as_str).unwrap_or_default();
        let endpoint = labels
            .get(METRICS_PATH_LABEL)
            .and_then(|path| ENDPOINT_REGEX.captures(path))
            .and_then(|captures| captures.get(1))
            .map_or("", |m| m.as_str());

        Self::new(metric_name, host, endpoint)
    }

    /// The name of the metric.
    pub fn metric_name(&self) -> &str {
        &self.metric_name
    }

    /// The host that reported the metric, possibly empty.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The serving endpoint the metric belongs to, possibly empty.
    pub fn serving_endpoint(&self) -> &str {
        &self.serving_endpoint
    }

    /// Splits the key into its parts.
    pub fn into_parts(self) -> (String, String, String) {
        (self.metric_name, self.host, self.serving_endpoint)
    }
}

fn check_label(field: &'static str, value: String) -> Result<String, InvalidLabelError> {
    if value.contains(SEPARATOR) {
        return Err(InvalidLabelError { field, value });
    }
    Ok(value)
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            self.metric_name, self.host, self.serving_endpoint
        )
    }
}

impl FromStr for SeriesKey {
    type Err = MalformedKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(SEPARATOR).collect();
        let [metric_name, host, serving_endpoint] = parts.as_slice() else {
            return Err(MalformedKeyError {
                key: s.to_owned(),
                parts: parts.len(),
            });
        };

        Ok(Self {
            metric_name: (*metric_name).to_owned(),
            host: (*host).to_owned(),
            serving_endpoint: (*serving_endpoint).to_owned(),
        })
    }
}

/// Encodes the parts of a series into a single string key.
pub fn encode(
    metric_name: &str,
    host: &str,
    serving_endpoint: &str,
) -> Result<String, InvalidLabelError> {
    SeriesKey::new(metric_name, host, serving_endpoint).map(|key| key.to_string())
}

/// Decodes a string key into the metric name, host, and serving endpoint.
pub fn decode(key: &str) -> Result<(String, String, String), MalformedKeyError> {
    key.parse::<SeriesKey>().map(SeriesKey::into_parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn test_encode() {
        assert_eq!(
            encode("cpu_usage", "h1", "ep1").unwrap(),
            "cpu_usage|h1|ep1"
        );
        assert_eq!(encode("cpu_usage", "", "").unwrap(), "cpu_usage||");
    }

    #[test]
    fn test_encode_rejects_separator() {
        let error = encode("cpu|usage", "h1", "ep1").unwrap_err();
        assert_eq!(error.field(), "metric_name");

        let error = SeriesKey::new("cpu", "h|1", "ep1").unwrap_err();
        assert_eq!(error.field(), "host");
        assert_eq!(
            error.to_string(),
            r#"host contains the reserved separator: "h|1""#
        );
    }

    #[test]
    fn test_decode() {
        assert_eq!(
            decode("cpu_usage|h1|ep1").unwrap(),
            ("cpu_usage".to_owned(), "h1".to_owned(), "ep1".to_owned())
        );
        assert_eq!(
            decode("cpu_usage||").unwrap(),
            ("cpu_usage".to_owned(), String::new(), String::new())
        );
    }

    #[test]
    fn test_decode_malformed() {
        insta::assert_snapshot!(
            decode("a|b").unwrap_err(),
            @r#"malformed series key "a|b": expected 3 parts, found 2"#
        );
        assert!(decode("a|b|c|d").is_err());
        assert!(decode("abc").is_err());
    }

    #[test]
    fn test_round_trip() {
        let key = SeriesKey::new("requests_total", "10.0.0.1:8080", "llama").unwrap();
        assert_eq!(key.to_string().parse::<SeriesKey>().unwrap(), key);
    }

    #[test]
    fn test_from_labels() {
        let key = SeriesKey::from_labels(
            "requests_total",
            &labels(&[
                ("server.address", "adb-1.azuredatabricks.net"),
                ("metrics_path", "/api/2.0/serving-endpoints/llama-70b/metrics"),
                ("job", "ignored"),
            ]),
        )
        .unwrap();

        assert_eq!(key.metric_name(), "requests_total");
        assert_eq!(key.host(), "adb-1.azuredatabricks.net");
        assert_eq!(key.serving_endpoint(), "llama-70b");
    }

    #[test]
    fn test_from_labels_missing() {
        let key = SeriesKey::from_labels(
            "requests_total",
            &labels(&[("metrics_path", "/metrics")]),
        )
        .unwrap();

        assert_eq!(key.to_string(), "requests_total||");
    }

    #[test]
    fn test_from_labels_invalid_host() {
        let result = SeriesKey::from_labels(
            "requests_total",
            &labels(&[("server.address", "a|b")]),
        );
        assert!(result.is_err());
    }
}
