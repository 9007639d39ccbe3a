//! Test helpers for code writing to a table store.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::statement::{PARAMS_PER_ROW, Statement, StatementParam};
use crate::store::{StatementExecutor, StoreError};
use crate::window::{SeriesRow, elapsed_minutes, merge_row};

type RowKey = (String, String, String);

#[derive(Debug)]
struct State {
    rows: BTreeMap<RowKey, SeriesRow>,
    now: DateTime<Utc>,
    calls: Vec<usize>,
    fail_next: usize,
    failing_series: BTreeSet<String>,
}

/// An in-memory table that applies upsert statements like the real store.
///
/// Statements are interpreted through their parameters only: every group of four parameters is
/// upserted as one row with [`merge_row`] against a manually controlled clock. Failures can be
/// injected for a number of calls or for every statement touching a given metric.
#[derive(Debug)]
pub struct MemoryTable {
    state: Mutex<State>,
}

impl MemoryTable {
    /// Creates an empty table whose clock starts at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(State {
                rows: BTreeMap::new(),
                now,
                calls: Vec::new(),
                fail_next: 0,
                failing_series: BTreeSet::new(),
            }),
        }
    }

    /// Moves the clock of the table forward.
    pub fn advance(&self, duration: chrono::Duration) {
        self.state.lock().now += duration;
    }

    /// Sets the clock of the table.
    pub fn set_now(&self, now: DateTime<Utc>) {
        self.state.lock().now = now;
    }

    /// Fails the next `count` statements.
    pub fn fail_next(&self, count: usize) {
        self.state.lock().fail_next = count;
    }

    /// Fails every statement that upserts the given metric.
    pub fn fail_series(&self, metric_name: &str) {
        self.state
            .lock()
            .failing_series
            .insert(metric_name.to_owned());
    }

    /// Returns the number of rows of every statement executed so far, including failed ones.
    pub fn calls(&self) -> Vec<usize> {
        self.state.lock().calls.clone()
    }

    /// Returns the stored row of a series.
    pub fn row(&self, metric_name: &str, host: &str, serving_endpoint: &str) -> Option<SeriesRow> {
        let key = (
            metric_name.to_owned(),
            host.to_owned(),
            serving_endpoint.to_owned(),
        );
        self.state.lock().rows.get(&key).cloned()
    }

    /// Returns the number of stored rows.
    pub fn len(&self) -> usize {
        self.state.lock().rows.len()
    }

    /// Returns `true` if no rows are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn apply(&self, statement: &Statement) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.calls.push(statement.params.len() / PARAMS_PER_ROW);

        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(StoreError::Failed("injected failure".to_owned()));
        }

        let mut upserts = Vec::new();
        for params in statement.params.chunks(PARAMS_PER_ROW) {
            let [
                StatementParam::String(name),
                StatementParam::String(host),
                StatementParam::String(endpoint),
                StatementParam::Double(value),
            ] = params
            else {
                return Err(StoreError::Failed("unexpected parameter layout".to_owned()));
            };

            if state.failing_series.contains(name) {
                return Err(StoreError::Unavailable(
                    format!("series {name} is unavailable").into(),
                ));
            }

            upserts.push(((name.clone(), host.clone(), endpoint.clone()), *value));
        }

        let now = state.now;
        for (key, value) in upserts {
            let old = state.rows.get(&key);
            let elapsed = old.map_or(0, |row| elapsed_minutes(row.updated_at, now));
            let row = merge_row(old, value, elapsed, now);
            state.rows.insert(key, row);
        }

        Ok(())
    }
}

impl StatementExecutor for MemoryTable {
    async fn execute(&self, statement: &Statement, _timeout: Duration) -> Result<(), StoreError> {
        self.apply(statement)
    }
}
