//! Rolling per-minute history of a stored series.
//!
//! Each stored row keeps exactly [`WINDOW_SLOTS`] values, oldest first, together with the time
//! the most recent slot was written. Every upsert advances the window by the number of whole
//! minutes elapsed since that time and fills the new slots with the upserted value.
//!
//! [`merge_row`] is the reference definition of this rule. The `MERGE` statement built in
//! [`statement`](crate::statement) expresses the same rule in SQL, so that the store applies it
//! atomically.

use chrono::{DateTime, Utc};

/// Number of per-minute slots in the history of every series.
pub const WINDOW_SLOTS: usize = 60;

/// The stored state of a single series.
#[derive(Clone, Debug, PartialEq)]
pub struct SeriesRow {
    /// Per-minute values, oldest first.
    pub values: Vec<f64>,
    /// Time of the last slot write.
    pub updated_at: DateTime<Utc>,
}

impl SeriesRow {
    /// Creates a row where every slot holds `value`.
    pub fn filled(value: f64, updated_at: DateTime<Utc>) -> Self {
        Self {
            values: vec![value; WINDOW_SLOTS],
            updated_at,
        }
    }
}

/// Returns the number of whole minutes between `since` and `now`.
///
/// Partial minutes are truncated toward zero. The result is negative if `now` lies before
/// `since`.
pub fn elapsed_minutes(since: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - since).num_minutes()
}

/// Applies an upserted value to a stored row.
///
/// - Without a stored row, all slots are filled with `value`.
/// - If `elapsed_minutes` covers the whole window, all slots are replaced.
/// - Otherwise, for every elapsed minute the oldest slot is dropped and `value` is appended.
/// - Less than a minute, including negative clock skew, leaves the row unchanged.
///
/// `updated_at` moves to `now` whenever at least one slot was written.
pub fn merge_row(
    old: Option<&SeriesRow>,
    value: f64,
    elapsed_minutes: i64,
    now: DateTime<Utc>,
) -> SeriesRow {
    let Some(old) = old else {
        return SeriesRow::filled(value, now);
    };

    match usize::try_from(elapsed_minutes) {
        Ok(shift) if shift >= WINDOW_SLOTS => SeriesRow::filled(value, now),
        Ok(shift) if shift >= 1 => {
            let mut values = Vec::with_capacity(WINDOW_SLOTS);
            values.extend_from_slice(old.values.get(shift..).unwrap_or_default());
            values.resize(values.len() + shift, value);
            SeriesRow {
                values,
                updated_at: now,
            }
        }
        _ => old.clone(),
    }
}
