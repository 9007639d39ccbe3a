use hashbrown::HashMap;
use hashbrown::hash_map::Entry;
use parking_lot::Mutex;

use crate::key::SeriesKey;

/// Scheduling state of a [`MetricBuffer`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FlushState {
    /// No flush is pending.
    #[default]
    Idle,
    /// A flush has been scheduled or is in progress.
    Armed,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<SeriesKey, f64>,
    state: FlushState,
}

/// Aggregates samples into the maximum value observed per series.
///
/// The buffer also tracks whether a flush is pending. Arming and completion of flush cycles are
/// serialized with sample insertion under the same lock, so that a push can never fall between
/// the buffer being drained and the scheduler going idle.
///
/// The lock is only held for in-memory map operations.
#[derive(Debug, Default)]
pub struct MetricBuffer {
    inner: Mutex<Inner>,
}

impl MetricBuffer {
    /// Creates an empty, idle buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a sample for the given series.
    ///
    /// The buffered value is only replaced if the new value is strictly greater. Returns `true` if
    /// this push armed the scheduler, in which case the caller is responsible for scheduling the
    /// flush.
    ///
    /// NaN values are ignored. They neither create an entry nor arm the scheduler.
    pub fn push_sample(&self, key: SeriesKey, value: f64) -> bool {
        if value.is_nan() {
            return false;
        }

        let mut inner = self.inner.lock();

        match inner.entries.entry(key) {
            Entry::Occupied(mut entry) => {
                if value > *entry.get() {
                    entry.insert(value);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(value);
            }
        }

        if inner.state == FlushState::Idle {
            inner.state = FlushState::Armed;
            true
        } else {
            false
        }
    }

    /// Takes all buffered entries and leaves the buffer empty.
    ///
    /// The flush state is left untouched. Call [`complete_cycle`](Self::complete_cycle) once the
    /// drained entries have been written.
    pub fn drain_all(&self) -> Vec<(SeriesKey, f64)> {
        let entries = std::mem::take(&mut self.inner.lock().entries);
        entries.into_iter().collect()
    }

    /// Ends a flush cycle.
    ///
    /// If samples arrived while the flush was in progress, the buffer stays armed and this
    /// returns `true`. The caller must then schedule the next flush. Otherwise the buffer goes
    /// idle and the next push arms it again.
    pub fn complete_cycle(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.entries.is_empty() {
            inner.state = FlushState::Idle;
            false
        } else {
            inner.state = FlushState::Armed;
            true
        }
    }

    /// Returns the current flush state.
    pub fn state(&self) -> FlushState {
        self.inner.lock().state
    }

    /// Returns `true` if no series are buffered.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Returns the number of buffered series.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }
}
