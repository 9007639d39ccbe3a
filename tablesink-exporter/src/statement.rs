use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use itertools::Itertools;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::key::SeriesKey;
use crate::window::WINDOW_SLOTS;

/// Number of statement parameters bound per series.
pub const PARAMS_PER_ROW: usize = 4;

static TABLE_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[A-Za-z0-9_]+|`[^`]+`)(?:\.(?:[A-Za-z0-9_]+|`[^`]+`)){0,2}$").unwrap()
});

/// The table name is not a valid one- to three-part identifier.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("invalid table name {0:?}: expected [catalog.][schema.]table")]
pub struct InvalidTableNameError(String);

/// A validated, possibly qualified table name.
///
/// Table names cannot be bound as statement parameters. They are interpolated into statements
/// and therefore restricted to plain or backquoted identifiers.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct TableName(String);

impl TableName {
    /// Returns the table name as written in statements.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TableName {
    type Error = InvalidTableNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if TABLE_NAME_REGEX.is_match(&value) {
            Ok(Self(value))
        } else {
            Err(InvalidTableNameError(value))
        }
    }
}

impl FromStr for TableName {
    type Err = InvalidTableNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_owned())
    }
}

impl From<TableName> for String {
    fn from(value: TableName) -> Self {
        value.0
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A value bound to a statement parameter.
#[derive(Clone, Debug, PartialEq)]
pub enum StatementParam {
    /// A string value.
    String(String),
    /// A double precision float.
    Double(f64),
}

/// A parameterized statement ready for execution.
///
/// Parameters are bound by position. The statement text refers to the parameter at index `i` as
/// `:p{i}`.
#[derive(Clone, Debug, PartialEq)]
pub struct Statement {
    /// The statement text.
    pub sql: String,
    /// Parameters in order of their index.
    pub params: Vec<StatementParam>,
}

impl Statement {
    /// Returns the name of the parameter at `index`.
    pub fn param_name(index: usize) -> String {
        format!("p{index}")
    }
}

/// Builds a single statement that upserts all `entries` into `table`.
///
/// Each entry binds four parameters: metric name, host, serving endpoint, and value. Matching
/// rows advance their window by the whole minutes elapsed since their last write. Rows that do
/// not exist yet are created with the value in every slot.
pub fn merge_statement(table: &TableName, entries: &[(SeriesKey, f64)]) -> Statement {
    let mut params = Vec::with_capacity(entries.len() * PARAMS_PER_ROW);
    for (key, value) in entries {
        params.push(StatementParam::String(key.metric_name().to_owned()));
        params.push(StatementParam::String(key.host().to_owned()));
        params.push(StatementParam::String(key.serving_endpoint().to_owned()));
        params.push(StatementParam::Double(*value));
    }

    let rows = (0..entries.len())
        .map(|row| {
            let base = row * PARAMS_PER_ROW;
            (base..base + PARAMS_PER_ROW)
                .map(|index| format!(":p{index}"))
                .join(", ")
        })
        .map(|row| format!("({row})"))
        .join(", ");

    let slots = WINDOW_SLOTS;
    let elapsed = "timestampdiff(MINUTE, target.updated_at, current_timestamp())";
    let sql = format!(
        "MERGE INTO {table} AS target
USING (
  SELECT col1 AS metric_name, col2 AS host, col3 AS serving_endpoint, col4 AS new_value
  FROM VALUES {rows}
) AS source
ON target.metric_name = source.metric_name
  AND target.host = source.host
  AND target.serving_endpoint = source.serving_endpoint
WHEN MATCHED THEN UPDATE SET
  metric_values = CASE
    WHEN {elapsed} >= {slots} THEN array_repeat(source.new_value, {slots})
    WHEN {elapsed} >= 1 THEN concat(
      slice(target.metric_values, CAST({elapsed} AS INT) + 1, {slots}),
      array_repeat(source.new_value, CAST({elapsed} AS INT))
    )
    ELSE target.metric_values
  END,
  updated_at = CASE
    WHEN {elapsed} >= 1 THEN current_timestamp()
    ELSE target.updated_at
  END
WHEN NOT MATCHED THEN INSERT (metric_name, host, serving_endpoint, metric_values, updated_at)
  VALUES (
    source.metric_name,
    source.host,
    source.serving_endpoint,
    array_repeat(source.new_value, {slots}),
    current_timestamp()
  )"
    );

    Statement { sql, params }
}
