use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tablesink_exporter::{CANCEL_TIMEOUT, DatabricksConfig, ExporterConfig, TableName};
use tablesink_log::LogConfig;

/// Placeholder for secrets in rendered configuration.
const REDACTED: &str = "[redacted]";

/// Defines the source of a config error.
#[derive(Debug)]
enum ConfigErrorSource {
    /// An error occurring independently.
    None,
    /// An error originating from a configuration file.
    File(PathBuf),
    /// An error originating in a field override (an env var, or a CLI parameter).
    FieldOverride(String),
}

impl fmt::Display for ConfigErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigErrorSource::None => Ok(()),
            ConfigErrorSource::File(file_name) => {
                write!(f, " (file {})", file_name.display())
            }
            ConfigErrorSource::FieldOverride(name) => write!(f, " (field {name})"),
        }
    }
}

/// Indicates config related errors.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigErrorKind {
    /// Failed to open the file.
    #[error("could not open config file")]
    CouldNotOpenFile,
    /// Failed to render the configuration.
    #[error("could not write config")]
    CouldNotWrite,
    /// Parsing YAML failed.
    #[error("could not parse yaml config file")]
    BadYaml,
    /// Invalid config value.
    #[error("invalid config value")]
    InvalidValue,
    /// A value required to run is not configured.
    #[error("missing config value")]
    MissingValue,
}

/// Indicates config related errors.
#[derive(Debug)]
pub struct ConfigError {
    origin: ConfigErrorSource,
    kind: ConfigErrorKind,
    cause: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl ConfigError {
    #[inline]
    fn new(kind: ConfigErrorKind) -> Self {
        Self {
            origin: ConfigErrorSource::None,
            kind,
            cause: None,
        }
    }

    #[inline]
    fn wrap<E>(inner: E, kind: ConfigErrorKind) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self {
            origin: ConfigErrorSource::None,
            kind,
            cause: Some(Box::new(inner)),
        }
    }

    #[inline]
    fn for_field<E>(inner: E, field: &'static str) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::wrap(inner, ConfigErrorKind::InvalidValue).field(field)
    }

    #[inline]
    fn file(mut self, p: impl AsRef<Path>) -> Self {
        self.origin = ConfigErrorSource::File(p.as_ref().to_path_buf());
        self
    }

    #[inline]
    fn field(mut self, name: &'static str) -> Self {
        self.origin = ConfigErrorSource::FieldOverride(name.to_owned());
        self
    }

    /// Returns the error kind of the error.
    pub fn kind(&self) -> ConfigErrorKind {
        self.kind
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind, self.origin)
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_deref().map(|e| e as &(dyn Error + 'static))
    }
}

/// A configured value is out of its allowed range.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct OutOfRange(&'static str);

trait ConfigObject: DeserializeOwned + Serialize {
    /// The basename of the config file.
    fn name() -> &'static str;

    /// The full filename of the config file, including the file extension.
    fn path(base: &Path) -> PathBuf {
        base.join(format!("{}.yml", Self::name()))
    }

    /// Loads the config file from a file within the given directory location.
    fn load(base: &Path) -> Result<Self, ConfigError> {
        let path = Self::path(base);

        let f = fs::File::open(&path)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotOpenFile).file(&path))?;

        serde_yaml::from_reader(io::BufReader::new(f))
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml).file(&path))
    }
}

/// Structure used to hold information about configuration overrides via
/// CLI parameters or environment variables.
#[derive(Debug, Default)]
pub struct OverridableConfig {
    /// The workspace host of the store.
    pub store_host: Option<String>,
    /// The HTTP path of the SQL warehouse.
    pub store_http_path: Option<String>,
    /// The access token of the store.
    pub store_token: Option<String>,
    /// The fully qualified target table.
    pub table: Option<String>,
    /// The host the HTTP server should bind to.
    pub host: Option<String>,
    /// The port the HTTP server should bind to.
    pub port: Option<String>,
    /// Shutdown timeout in seconds.
    pub shutdown_timeout: Option<String>,
}

/// Connection to the table store.
#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(default)]
struct Store {
    #[serde(flatten)]
    databricks: DatabricksConfig,
    /// The target table, as a one- to three-part identifier.
    table: Option<TableName>,
}

/// Settings of the OTLP receiver.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Http {
    /// The host to bind the HTTP server to.
    host: IpAddr,
    /// The port to bind the HTTP server to.
    ///
    /// Defaults to `4318`, the standard OTLP/HTTP port.
    port: u16,
}

impl Default for Http {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 4318,
        }
    }
}

/// Control the metrics.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Metrics {
    /// Hostname and port of the statsd server.
    ///
    /// Defaults to `None`.
    statsd: Option<String>,
    /// Common prefix that should be added to all metrics.
    ///
    /// Defaults to `"tablesink"`.
    prefix: String,
    /// Default tags to apply to all metrics.
    default_tags: BTreeMap<String, String>,
    /// Emitted metrics will be buffered to optimize performance.
    ///
    /// Defaults to `true`.
    buffering: bool,
    /// Global sample rate for all emitted metrics between `0.0` and `1.0`.
    ///
    /// Defaults to `1.0` (100%).
    sample_rate: f32,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            statsd: None,
            prefix: "tablesink".into(),
            default_tags: BTreeMap::new(),
            buffering: true,
            sample_rate: 1.0,
        }
    }
}

/// Controls various limits.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Limits {
    /// The maximum size of an OTLP request body in bytes.
    max_body_size: usize,
    /// The maximum number of seconds to wait for pending flushes after receiving a shutdown
    /// signal.
    shutdown_timeout: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_body_size: 10 * 1024 * 1024,
            shutdown_timeout: 10,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct ConfigValues {
    #[serde(default)]
    store: Store,
    #[serde(default)]
    exporter: ExporterConfig,
    #[serde(default)]
    http: Http,
    #[serde(default)]
    limits: Limits,
    #[serde(default)]
    logging: LogConfig,
    #[serde(default)]
    metrics: Metrics,
}

impl ConfigObject for ConfigValues {
    fn name() -> &'static str {
        "config"
    }
}

/// Config struct.
pub struct Config {
    values: ConfigValues,
    path: PathBuf,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("path", &self.path)
            .field("values", &self.values)
            .finish()
    }
}

impl Config {
    /// Loads a config from a given config folder.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = std::env::current_dir()
            .map(|x| x.join(path.as_ref()))
            .unwrap_or_else(|_| path.as_ref().to_path_buf());

        let config = Config {
            values: ConfigValues::load(&path)?,
            path: path.clone(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Creates a config from a YAML string.
    ///
    /// This is mostly useful for tests.
    pub fn from_yaml_str(yaml: &str) -> Result<Config, ConfigError> {
        let config = Config {
            values: serde_yaml::from_str(yaml)
                .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml))?,
            path: PathBuf::new(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Override configuration with values coming from other sources (e.g. env variables or
    /// command line parameters).
    pub fn apply_override(
        &mut self,
        overrides: OverridableConfig,
    ) -> Result<&mut Self, ConfigError> {
        let store = &mut self.values.store;

        if let Some(host) = overrides.store_host {
            store.databricks.host = host;
        }

        if let Some(http_path) = overrides.store_http_path {
            store.databricks.http_path = http_path;
        }

        if let Some(token) = overrides.store_token {
            store.databricks.token = token;
        }

        if let Some(table) = overrides.table {
            store.table = Some(
                table
                    .parse::<TableName>()
                    .map_err(|err| ConfigError::for_field(err, "table"))?,
            );
        }

        let http = &mut self.values.http;

        if let Some(host) = overrides.host {
            http.host = host
                .parse()
                .map_err(|err| ConfigError::for_field(err, "host"))?;
        }

        if let Some(port) = overrides.port {
            http.port = port
                .parse()
                .map_err(|err| ConfigError::for_field(err, "port"))?;
        }

        if let Some(shutdown_timeout) = overrides.shutdown_timeout {
            self.values.limits.shutdown_timeout = shutdown_timeout
                .parse()
                .map_err(|err| ConfigError::for_field(err, "shutdown_timeout"))?;
        }

        Ok(self)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let exporter = &self.values.exporter;

        if exporter.flush_interval == 0 {
            return Err(ConfigError::for_field(
                OutOfRange("flush interval must be positive"),
                "exporter.flush_interval",
            ));
        }

        if exporter.chunk_size == 0 {
            return Err(ConfigError::for_field(
                OutOfRange("chunk size must be positive"),
                "exporter.chunk_size",
            ));
        }

        if exporter.retries == 0 {
            return Err(ConfigError::for_field(
                OutOfRange("at least one attempt is required"),
                "exporter.retries",
            ));
        }

        if !(0.0..=1.0).contains(&self.values.metrics.sample_rate) {
            return Err(ConfigError::for_field(
                OutOfRange("sample rate must be between 0 and 1"),
                "metrics.sample_rate",
            ));
        }

        Ok(())
    }

    /// Checks if the config is already initialized.
    pub fn config_exists<P: AsRef<Path>>(path: P) -> bool {
        fs::metadata(ConfigValues::path(path.as_ref())).is_ok()
    }

    /// Returns the path of the config directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Dumps out a YAML string of the values.
    ///
    /// The store token is replaced with a placeholder.
    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        let mut value = serde_yaml::to_value(&self.values)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotWrite))?;

        if let Some(token) = value
            .get_mut("store")
            .and_then(|store| store.get_mut("token"))
            .filter(|token| token.as_str().is_some_and(|t| !t.is_empty()))
        {
            *token = serde_yaml::Value::String(REDACTED.to_owned());
        }

        serde_yaml::to_string(&value)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotWrite))
    }

    /// Returns the connection settings of the store.
    pub fn databricks(&self) -> &DatabricksConfig {
        &self.values.store.databricks
    }

    /// Returns the table to upsert metrics into.
    pub fn table(&self) -> Result<&TableName, ConfigError> {
        self.values
            .store
            .table
            .as_ref()
            .ok_or_else(|| ConfigError::new(ConfigErrorKind::MissingValue).field("store.table"))
    }

    /// Returns the settings of the flush cycle and writer.
    pub fn exporter(&self) -> &ExporterConfig {
        &self.values.exporter
    }

    /// Returns the socket address the HTTP server binds to.
    pub fn listen_addr(&self) -> SocketAddr {
        (self.values.http.host, self.values.http.port).into()
    }

    /// Returns the maximum size of an OTLP request body.
    pub fn max_body_size(&self) -> usize {
        self.values.limits.max_body_size
    }

    /// Returns the maximum time to wait for pending work on shutdown.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.values.limits.shutdown_timeout)
    }

    /// Returns how long to wait for services to stop after a graceful shutdown.
    ///
    /// The exporter spends at most the shutdown timeout on remaining work, counted from when it
    /// notices the shutdown. A statement that is already running delays this until it completes
    /// or times out and has been cancelled.
    pub fn shutdown_grace_period(&self) -> Duration {
        self.shutdown_timeout() + self.values.exporter.statement_timeout() + CANCEL_TIMEOUT
    }

    /// Returns the logging configuration.
    pub fn logging(&self) -> &LogConfig {
        &self.values.logging
    }

    /// Returns the address of the statsd server, if configured.
    pub fn statsd_addr(&self) -> Option<&str> {
        self.values.metrics.statsd.as_deref()
    }

    /// Return the prefix for statsd metrics.
    pub fn metrics_prefix(&self) -> &str {
        &self.values.metrics.prefix
    }

    /// Returns the default tags for statsd metrics.
    pub fn metrics_default_tags(&self) -> &BTreeMap<String, String> {
        &self.values.metrics.default_tags
    }

    /// Returns true if metrics buffering is enabled, false otherwise.
    pub fn metrics_buffering(&self) -> bool {
        self.values.metrics.buffering
    }

    /// Returns the global sample rate for all metrics.
    pub fn metrics_sample_rate(&self) -> f32 {
        self.values.metrics.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(yaml: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.yml"), yaml).unwrap();
        dir
    }

    #[test]
    fn test_load_from_path() {
        let dir = write_config(
            r#"
store:
  host: adb-123.azuredatabricks.net
  http_path: /sql/1.0/warehouses/abc
  token: dapi-secret
  table: main.serving.metrics
exporter:
  flush_interval: 30
  chunk_size: 25
http:
  port: 9000
metrics:
  statsd: 127.0.0.1:8125
"#,
        );

        let config = Config::from_path(dir.path()).unwrap();
        assert_eq!(config.databricks().host, "adb-123.azuredatabricks.net");
        assert_eq!(config.table().unwrap().as_str(), "main.serving.metrics");
        assert_eq!(config.exporter().flush_interval(), Duration::from_secs(30));
        assert_eq!(config.exporter().chunk_size, 25);
        assert_eq!(config.exporter().retries, 3);
        assert_eq!(config.listen_addr(), "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.statsd_addr(), Some("127.0.0.1:8125"));
        assert_eq!(config.metrics_prefix(), "tablesink");
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(10));
        assert!(Config::config_exists(dir.path()));
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_yaml_str("{}").unwrap();
        assert_eq!(config.exporter(), &ExporterConfig::default());
        assert_eq!(config.listen_addr(), "127.0.0.1:4318".parse().unwrap());
        assert_eq!(config.max_body_size(), 10 * 1024 * 1024);
        assert_eq!(config.statsd_addr(), None);
        assert!(config.metrics_buffering());
    }

    #[test]
    fn test_grace_period_covers_running_statement() {
        let config = Config::from_yaml_str(
            r#"
exporter:
  statement_timeout: 30
limits:
  shutdown_timeout: 10
"#,
        )
        .unwrap();

        assert_eq!(config.shutdown_timeout(), Duration::from_secs(10));
        assert_eq!(config.shutdown_grace_period(), Duration::from_secs(45));
        assert!(config.shutdown_grace_period() > config.exporter().statement_timeout());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let error = Config::from_path(dir.path()).unwrap_err();

        assert_eq!(error.kind(), ConfigErrorKind::CouldNotOpenFile);
        assert!(error.to_string().ends_with("config.yml)"));
        assert!(error.source().is_some());
        assert!(!Config::config_exists(dir.path()));
    }

    #[test]
    fn test_bad_yaml() {
        let dir = write_config("exporter: [1, 2");
        let error = Config::from_path(dir.path()).unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::BadYaml);
    }

    #[test]
    fn test_invalid_table_in_file() {
        let dir = write_config("store:\n  table: a.b.c.d\n");
        let error = Config::from_path(dir.path()).unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::BadYaml);
    }

    #[test]
    fn test_zero_values_rejected() {
        let error = Config::from_yaml_str("exporter:\n  chunk_size: 0\n").unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::InvalidValue);
        insta::assert_snapshot!(error.to_string(), @"invalid config value (field exporter.chunk_size)");

        let error = Config::from_yaml_str("exporter:\n  flush_interval: 0\n").unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::InvalidValue);

        let error = Config::from_yaml_str("exporter:\n  retries: 0\n").unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::InvalidValue);
    }

    #[test]
    fn test_missing_table() {
        let config = Config::from_yaml_str("{}").unwrap();
        let error = config.table().unwrap_err();

        assert_eq!(error.kind(), ConfigErrorKind::MissingValue);
        insta::assert_snapshot!(error.to_string(), @"missing config value (field store.table)");
    }

    #[test]
    fn test_apply_override() {
        let mut config = Config::from_yaml_str("store:\n  token: from-file\n").unwrap();

        config
            .apply_override(OverridableConfig {
                store_host: Some("adb-1.net".to_owned()),
                store_token: Some("from-env".to_owned()),
                table: Some("metrics".to_owned()),
                port: Some("4000".to_owned()),
                shutdown_timeout: Some("30".to_owned()),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(config.databricks().host, "adb-1.net");
        assert_eq!(config.databricks().token, "from-env");
        assert_eq!(config.table().unwrap().as_str(), "metrics");
        assert_eq!(config.listen_addr().port(), 4000);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_override() {
        let mut config = Config::from_yaml_str("{}").unwrap();

        let error = config
            .apply_override(OverridableConfig {
                table: Some("a.b.c.d".to_owned()),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::InvalidValue);
        assert_eq!(error.to_string(), "invalid config value (field table)");

        let error = config
            .apply_override(OverridableConfig {
                port: Some("not-a-port".to_owned()),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(error.to_string(), "invalid config value (field port)");
    }

    #[test]
    fn test_yaml_redacts_token() {
        let config = Config::from_yaml_str(
            "store:\n  host: adb-1.net\n  token: dapi-secret\n  table: main.serving.metrics\n",
        )
        .unwrap();

        let yaml = config.to_yaml_string().unwrap();
        assert!(!yaml.contains("dapi-secret"));
        assert!(yaml.contains("[redacted]"));
        assert!(yaml.contains("table: main.serving.metrics"));

        // Rendering must not change the loaded values.
        assert_eq!(config.databricks().token, "dapi-secret");
    }
}
