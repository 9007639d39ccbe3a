//! Statement execution against a Databricks SQL warehouse.
//!
//! Uses the [Statement Execution API]: statements are submitted with their parameters, awaited
//! synchronously for a bounded time, and then polled until they reach a terminal state. When the
//! statement timeout elapses first, the statement is cancelled.
//!
//! [Statement Execution API]: https://docs.databricks.com/api/workspace/statementexecution

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use url::Url;

use crate::statement::{Statement, StatementParam};
use crate::store::{ConnectorInitError, StatementExecutor, StoreError};

/// Longest time the API may hold a submit request open.
const MAX_WAIT_TIMEOUT: Duration = Duration::from_secs(50);

/// Shortest non-zero wait timeout accepted by the API.
const MIN_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay between two status requests of a pending statement.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound for a cancel request after a statement timed out.
pub const CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

static WAREHOUSE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/?sql/[^/]+/(?:warehouses|endpoints)/([^/]+)/?$").unwrap());

/// Connection settings of a Databricks SQL warehouse.
#[derive(Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabricksConfig {
    /// Workspace hostname, optionally with scheme.
    pub host: String,
    /// HTTP path of the warehouse, such as `/sql/1.0/warehouses/abc123`.
    pub http_path: String,
    /// Personal access token or OAuth token.
    pub token: String,
}

impl std::fmt::Debug for DatabricksConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabricksConfig")
            .field("host", &self.host)
            .field("http_path", &self.http_path)
            .field("token", &"[redacted]")
            .finish()
    }
}

/// Extracts the warehouse id from an HTTP path.
fn warehouse_id(http_path: &str) -> Option<&str> {
    WAREHOUSE_REGEX
        .captures(http_path)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str())
}

/// Builds the base URL of the workspace, defaulting to `https`.
fn base_url(host: &str) -> Result<Url, ConnectorInitError> {
    let host = host.trim_end_matches('/');
    let result = if host.contains("://") {
        Url::parse(host)
    } else {
        Url::parse(&format!("https://{host}"))
    };

    result.map_err(|error| ConnectorInitError::InvalidHost(host.to_owned(), error))
}

#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    warehouse_id: &'a str,
    statement: &'a str,
    parameters: Vec<ParameterSpec>,
    wait_timeout: String,
    on_wait_timeout: &'static str,
}

#[derive(Debug, PartialEq, Serialize)]
struct ParameterSpec {
    name: String,
    value: String,
    #[serde(rename = "type")]
    ty: &'static str,
}

impl ParameterSpec {
    fn new(index: usize, param: &StatementParam) -> Self {
        let (value, ty) = match param {
            StatementParam::String(value) => (value.clone(), "STRING"),
            StatementParam::Double(value) if value.is_infinite() => {
                let value = if *value > 0.0 { "Infinity" } else { "-Infinity" };
                (value.to_owned(), "DOUBLE")
            }
            StatementParam::Double(value) => (value.to_string(), "DOUBLE"),
        };

        Self {
            name: Statement::param_name(index),
            value,
            ty,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatementResponse {
    statement_id: String,
    status: StatementStatus,
}

#[derive(Debug, Deserialize)]
struct StatementStatus {
    state: StatementState,
    #[serde(default)]
    error: Option<ServiceError>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum StatementState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
    Closed,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceError {
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl ServiceError {
    fn describe(&self) -> String {
        match (&self.error_code, &self.message) {
            (Some(code), Some(message)) => format!("{code}: {message}"),
            (None, Some(message)) => message.clone(),
            (Some(code), None) => code.clone(),
            (None, None) => "unknown error".to_owned(),
        }
    }
}

/// Executes statements on a Databricks SQL warehouse over HTTP.
#[derive(Debug)]
pub struct DatabricksExecutor {
    client: reqwest::Client,
    statements_url: Url,
    warehouse_id: String,
    token: String,
    poll_interval: Duration,
}

impl DatabricksExecutor {
    /// Creates an executor for the configured warehouse.
    ///
    /// No connection is established until the first statement is executed.
    pub fn new(config: &DatabricksConfig) -> Result<Self, ConnectorInitError> {
        if config.host.trim().is_empty() {
            return Err(ConnectorInitError::EmptyHost);
        }
        if config.token.is_empty() {
            return Err(ConnectorInitError::EmptyToken);
        }

        let warehouse_id = warehouse_id(&config.http_path)
            .ok_or_else(|| ConnectorInitError::InvalidHttpPath(config.http_path.clone()))?
            .to_owned();

        let base = base_url(config.host.trim())?;
        let statements_url = base
            .join("api/2.0/sql/statements/")
            .map_err(|error| ConnectorInitError::InvalidHost(config.host.clone(), error))?;

        let client = reqwest::Client::builder()
            .gzip(true)
            .user_agent(concat!("tablesink/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ConnectorInitError::Client)?;

        Ok(Self {
            client,
            statements_url,
            warehouse_id,
            token: config.token.clone(),
            poll_interval: POLL_INTERVAL,
        })
    }

    /// Returns the id of the warehouse statements are executed on.
    pub fn warehouse_id(&self) -> &str {
        &self.warehouse_id
    }

    async fn submit(
        &self,
        statement: &Statement,
        wait_timeout: Duration,
    ) -> Result<StatementResponse, StoreError> {
        let parameters = statement
            .params
            .iter()
            .enumerate()
            .map(|(index, param)| ParameterSpec::new(index, param))
            .collect();

        let request = ExecuteRequest {
            warehouse_id: &self.warehouse_id,
            statement: &statement.sql,
            parameters,
            wait_timeout: format!("{}s", wait_timeout.as_secs()),
            on_wait_timeout: "CONTINUE",
        };

        let response = self
            .client
            .post(self.statements_url.clone())
            .bearer_auth(&self.token)
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;

        parse_response(response).await
    }

    async fn status(&self, statement_id: &str) -> Result<StatementResponse, StoreError> {
        let url = self.statement_url(statement_id, "")?;

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport_error)?;

        parse_response(response).await
    }

    async fn cancel(&self, statement_id: &str) {
        let result = match self.statement_url(statement_id, "/cancel") {
            Ok(url) => self
                .client
                .post(url)
                .bearer_auth(&self.token)
                .timeout(CANCEL_TIMEOUT)
                .send()
                .await
                .and_then(|response| response.error_for_status())
                .map(drop)
                .map_err(transport_error),
            Err(error) => Err(error),
        };

        if let Err(error) = result {
            tablesink_log::warn!(
                error = &error as &dyn std::error::Error,
                statement_id,
                "failed to cancel statement"
            );
        }
    }

    fn statement_url(&self, statement_id: &str, suffix: &str) -> Result<Url, StoreError> {
        self.statements_url
            .join(&format!("{statement_id}{suffix}"))
            .map_err(|error| StoreError::Failed(format!("invalid statement id: {error}")))
    }
}

impl StatementExecutor for DatabricksExecutor {
    async fn execute(&self, statement: &Statement, timeout: Duration) -> Result<(), StoreError> {
        let deadline = Instant::now() + timeout;

        let wait_timeout = if timeout < MIN_WAIT_TIMEOUT {
            Duration::ZERO
        } else {
            Duration::from_secs(timeout.min(MAX_WAIT_TIMEOUT).as_secs())
        };

        let mut response = tokio::time::timeout_at(deadline, self.submit(statement, wait_timeout))
            .await
            .map_err(|_| StoreError::Timeout(timeout))??;

        loop {
            let StatementResponse {
                statement_id,
                status,
            } = response;

            match status.state {
                StatementState::Succeeded => return Ok(()),
                StatementState::Failed | StatementState::Canceled | StatementState::Closed => {
                    let error = status.error.unwrap_or_default();
                    return Err(StoreError::Failed(error.describe()));
                }
                StatementState::Pending | StatementState::Running => {}
            }

            if Instant::now() + self.poll_interval >= deadline {
                self.cancel(&statement_id).await;
                return Err(StoreError::Timeout(timeout));
            }

            tokio::time::sleep(self.poll_interval).await;

            response = match tokio::time::timeout_at(deadline, self.status(&statement_id)).await {
                Ok(result) => result?,
                Err(_) => {
                    self.cancel(&statement_id).await;
                    return Err(StoreError::Timeout(timeout));
                }
            };
        }
    }
}

fn transport_error(error: reqwest::Error) -> StoreError {
    StoreError::Unavailable(Box::new(error))
}

async fn parse_response(response: reqwest::Response) -> Result<StatementResponse, StoreError> {
    let status = response.status();
    if status.is_success() {
        return response.json().await.map_err(transport_error);
    }

    let body: ServiceError = response.json().await.unwrap_or_default();
    let message = format!("{status}: {}", body.describe());

    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(StoreError::Unavailable(message.into()))
    } else {
        Err(StoreError::Failed(message))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::{Path, State};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{Value, json};

    use super::*;

    fn config(host: &str, http_path: &str, token: &str) -> DatabricksConfig {
        DatabricksConfig {
            host: host.to_owned(),
            http_path: http_path.to_owned(),
            token: token.to_owned(),
        }
    }

    #[test]
    fn test_warehouse_id() {
        assert_eq!(warehouse_id("/sql/1.0/warehouses/abc123"), Some("abc123"));
        assert_eq!(warehouse_id("sql/1.0/warehouses/abc123/"), Some("abc123"));
        assert_eq!(warehouse_id("/sql/1.0/endpoints/abc123"), Some("abc123"));
        assert_eq!(warehouse_id("/sql/protocolv1/o/123/0123-abc"), None);
        assert_eq!(warehouse_id(""), None);
    }

    #[test]
    fn test_new_validates_config() {
        let path = "/sql/1.0/warehouses/abc123";

        assert!(matches!(
            DatabricksExecutor::new(&config("", path, "token")),
            Err(ConnectorInitError::EmptyHost)
        ));
        assert!(matches!(
            DatabricksExecutor::new(&config("adb-1.azuredatabricks.net", path, "")),
            Err(ConnectorInitError::EmptyToken)
        ));
        assert!(matches!(
            DatabricksExecutor::new(&config("adb-1.azuredatabricks.net", "/sql", "token")),
            Err(ConnectorInitError::InvalidHttpPath(_))
        ));

        let executor =
            DatabricksExecutor::new(&config("adb-1.azuredatabricks.net", path, "token")).unwrap();
        assert_eq!(executor.warehouse_id(), "abc123");
        assert_eq!(
            executor.statements_url.as_str(),
            "https://adb-1.azuredatabricks.net/api/2.0/sql/statements/"
        );
    }

    #[test]
    fn test_config_debug_redacts_token() {
        let config = config("host", "/sql/1.0/warehouses/x", "dapi-secret");
        assert!(!format!("{config:?}").contains("dapi-secret"));
    }

    #[test]
    fn test_parameter_specs() {
        let params = [
            StatementParam::String("cpu".to_owned()),
            StatementParam::Double(1.5),
            StatementParam::Double(42.0),
            StatementParam::Double(f64::NEG_INFINITY),
        ];

        let specs: Vec<_> = params
            .iter()
            .enumerate()
            .map(|(index, param)| ParameterSpec::new(index, param))
            .collect();

        insta::assert_json_snapshot!(specs, @r#"
        [
          {
            "name": "p0",
            "value": "cpu",
            "type": "STRING"
          },
          {
            "name": "p1",
            "value": "1.5",
            "type": "DOUBLE"
          },
          {
            "name": "p2",
            "value": "42",
            "type": "DOUBLE"
          },
          {
            "name": "p3",
            "value": "-Infinity",
            "type": "DOUBLE"
          }
        ]
        "#);
    }

    #[derive(Default)]
    struct MockWarehouse {
        polls: AtomicUsize,
        cancels: AtomicUsize,
        pending_polls: usize,
        final_state: &'static str,
    }

    async fn spawn_warehouse(warehouse: Arc<MockWarehouse>) -> String {
        async fn submit(
            State(warehouse): State<Arc<MockWarehouse>>,
            Json(body): Json<Value>,
        ) -> Json<Value> {
            assert_eq!(body["warehouse_id"], "abc123");
            assert_eq!(body["parameters"][0]["name"], "p0");
            let state = if warehouse.pending_polls == 0 {
                warehouse.final_state
            } else {
                "PENDING"
            };
            Json(json!({"statement_id": "s1", "status": {"state": state}}))
        }

        async fn status(
            State(warehouse): State<Arc<MockWarehouse>>,
            Path(id): Path<String>,
        ) -> Json<Value> {
            assert_eq!(id, "s1");
            let polls = warehouse.polls.fetch_add(1, Ordering::SeqCst) + 1;
            let state = if polls >= warehouse.pending_polls {
                warehouse.final_state
            } else {
                "RUNNING"
            };
            Json(json!({
                "statement_id": "s1",
                "status": {
                    "state": state,
                    "error": {"error_code": "BAD_REQUEST", "message": "table not found"}
                }
            }))
        }

        async fn cancel(State(warehouse): State<Arc<MockWarehouse>>) -> Json<Value> {
            warehouse.cancels.fetch_add(1, Ordering::SeqCst);
            Json(json!({}))
        }

        let app = Router::new()
            .route("/api/2.0/sql/statements/", post(submit))
            .route("/api/2.0/sql/statements/{id}", get(status))
            .route("/api/2.0/sql/statements/{id}/cancel", post(cancel))
            .with_state(warehouse);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        format!("http://{addr}")
    }

    fn executor(host: &str) -> DatabricksExecutor {
        let mut executor =
            DatabricksExecutor::new(&config(host, "/sql/1.0/warehouses/abc123", "token")).unwrap();
        executor.poll_interval = Duration::from_millis(10);
        executor
    }

    fn statement() -> Statement {
        Statement {
            sql: "SELECT :p0".to_owned(),
            params: vec![StatementParam::String("x".to_owned())],
        }
    }

    #[tokio::test]
    async fn test_execute_polls_until_success() {
        let warehouse = Arc::new(MockWarehouse {
            pending_polls: 2,
            final_state: "SUCCEEDED",
            ..Default::default()
        });
        let host = spawn_warehouse(warehouse.clone()).await;

        let result = executor(&host)
            .execute(&statement(), Duration::from_secs(10))
            .await;

        assert!(result.is_ok());
        assert_eq!(warehouse.polls.load(Ordering::SeqCst), 2);
        assert_eq!(warehouse.cancels.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_execute_reports_failure() {
        let warehouse = Arc::new(MockWarehouse {
            pending_polls: 1,
            final_state: "FAILED",
            ..Default::default()
        });
        let host = spawn_warehouse(warehouse).await;

        let error = executor(&host)
            .execute(&statement(), Duration::from_secs(10))
            .await
            .unwrap_err();

        assert_eq!(
            error.to_string(),
            "statement failed: BAD_REQUEST: table not found"
        );
    }

    #[tokio::test]
    async fn test_execute_cancels_on_timeout() {
        let warehouse = Arc::new(MockWarehouse {
            pending_polls: usize::MAX,
            final_state: "SUCCEEDED",
            ..Default::default()
        });
        let host = spawn_warehouse(warehouse.clone()).await;

        let error = executor(&host)
            .execute(&statement(), Duration::from_millis(200))
            .await
            .unwrap_err();

        assert!(matches!(error, StoreError::Timeout(_)));
        assert_eq!(warehouse.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_unreachable() {
        // Nothing listens on the discard port.
        let error = executor("http://127.0.0.1:9")
            .execute(&statement(), Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(error, StoreError::Unavailable(_)));
    }
}
