use std::error::Error;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::statement::Statement;

/// A boxed error from a store transport.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// An error executing a statement against the store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("store is unavailable")]
    Unavailable(#[source] BoxError),
    /// The statement did not complete within its timeout.
    #[error("statement timed out after {0:?}")]
    Timeout(Duration),
    /// The store rejected or failed the statement.
    #[error("statement failed: {0}")]
    Failed(String),
}

/// Creating a store client failed.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorInitError {
    /// No store host was configured.
    #[error("store host is empty")]
    EmptyHost,
    /// The store host is not a valid URL or hostname.
    #[error("invalid store host {0:?}")]
    InvalidHost(String, #[source] url::ParseError),
    /// The HTTP path does not identify a warehouse.
    #[error("invalid http path {0:?}: expected /sql/1.0/warehouses/<id>")]
    InvalidHttpPath(String),
    /// No access token was configured.
    #[error("store access token is empty")]
    EmptyToken,
    /// The HTTP client could not be created.
    #[error("failed to build http client")]
    Client(#[source] reqwest::Error),
}

/// Executes parameterized statements against a table store.
///
/// Implementations must resolve within `timeout`. A statement that does not complete in time
/// fails with [`StoreError::Timeout`], and implementations should make a best effort to cancel
/// it on the store.
pub trait StatementExecutor: Send + Sync + 'static {
    /// Executes a statement and waits for it to complete.
    fn execute(
        &self,
        statement: &Statement,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

impl<T: StatementExecutor> StatementExecutor for Arc<T> {
    fn execute(
        &self,
        statement: &Statement,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        self.as_ref().execute(statement, timeout)
    }
}
