//! StatsD reporting for the exporter and the server.
//!
//! Metric names are declared as enums implementing one of [`CounterMetric`], [`GaugeMetric`],
//! [`DistributionMetric`] or [`TimerMetric`], and recorded with the [`metric!`] macro:
//!
//! ```
//! use tablesink_statsd::{metric, CounterMetric};
//!
//! enum Counters {
//!     SamplesAccepted,
//! }
//!
//! impl CounterMetric for Counters {
//!     fn name(&self) -> &'static str {
//!         match self {
//!             Self::SamplesAccepted => "samples.accepted",
//!         }
//!     }
//! }
//!
//! metric!(counter(Counters::SamplesAccepted) += 1, reason = "example");
//! ```
//!
//! Until [`init`] or [`set_client`] is called, every metric is discarded.
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::Arc;

use cadence::{
    BufferedUdpMetricSink, Metric, MetricBuilder, MetricError, MetricSink, QueuingMetricSink,
    StatsdClient, UdpMetricSink,
};
use parking_lot::RwLock;
use rand::Rng;

/// Number of metrics the background sink queues before dropping new ones.
const QUEUE_CAPACITY: usize = 100_000;

/// Fraction of metrics to send, clamped to `0.0..=1.0`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SampleRate(f64);

impl SampleRate {
    fn sampled(self) -> bool {
        match self.0 {
            rate if rate <= 0.0 => false,
            rate if rate >= 1.0 => true,
            rate => rand::rng().random_bool(rate),
        }
    }
}

impl From<f64> for SampleRate {
    fn from(value: f64) -> Self {
        Self(value.clamp(0.0, 1.0))
    }
}

impl From<SampleRate> for f64 {
    fn from(value: SampleRate) -> Self {
        value.0
    }
}

/// Parameters for [`init`].
#[derive(Debug)]
pub struct MetricsClientConfig<'a, A> {
    /// Prepended to every metric name, separated by a dot.
    pub prefix: &'a str,
    /// Address of the StatsD server.
    pub host: A,
    /// Tags attached to every metric.
    pub default_tags: BTreeMap<String, String>,
    /// Fraction of metrics that are sent.
    pub default_sample_rate: SampleRate,
    /// Packs several metrics into one datagram.
    pub buffering: bool,
}

/// The installed StatsD client together with its defaults.
#[derive(Debug)]
pub struct MetricsClient {
    client: StatsdClient,
    default_tags: BTreeMap<String, String>,
    sample_rate: SampleRate,
}

impl MetricsClient {
    /// Creates a client writing to an arbitrary cadence sink.
    pub fn from_sink<S>(prefix: &str, sink: S, sample_rate: SampleRate) -> Self
    where
        S: MetricSink + Send + Sync + std::panic::RefUnwindSafe + 'static,
    {
        Self {
            client: StatsdClient::from_sink(prefix, sink),
            default_tags: BTreeMap::new(),
            sample_rate,
        }
    }

    /// Returns the underlying cadence client.
    pub fn statsd(&self) -> &StatsdClient {
        &self.client
    }

    /// Adds the default tags and sends the metric if it is sampled.
    #[doc(hidden)]
    pub fn send_metric<'a, T>(&'a self, mut metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        if !self.sample_rate.sampled() {
            return;
        }

        for (key, value) in &self.default_tags {
            metric = metric.with_tag(key, value);
        }
        if self.sample_rate.0 < 1.0 {
            metric = metric.with_sampling_rate(self.sample_rate.0);
        }

        if let Err(error) = metric.try_send() {
            tablesink_log::error!(
                error = &error as &dyn std::error::Error,
                queue_capacity = QUEUE_CAPACITY,
                "failed to send metric",
            );
        }
    }
}

static GLOBAL_CLIENT: RwLock<Option<Arc<MetricsClient>>> = RwLock::new(None);

thread_local! {
    // Tests swap this without affecting other threads.
    static THREAD_CLIENT: RefCell<Option<Arc<MetricsClient>>> = RefCell::new(GLOBAL_CLIENT.read().clone());
}

/// Installs `client` globally.
pub fn set_client(client: MetricsClient) {
    let client = Arc::new(client);
    *GLOBAL_CLIENT.write() = Some(Arc::clone(&client));
    THREAD_CLIENT.with(|cell| cell.replace(Some(client)));
}

/// Connects to the StatsD server and installs the client globally.
pub fn init<A: ToSocketAddrs>(config: MetricsClientConfig<'_, A>) -> Result<(), MetricError> {
    let Some(addr) = config.host.to_socket_addrs()?.next() else {
        return Err(MetricError::from((
            cadence::ErrorKind::InvalidInput,
            "statsd host did not resolve to an address",
        )));
    };

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;

    let client = if config.buffering {
        let sink = BufferedUdpMetricSink::from(addr, socket)?;
        StatsdClient::from_sink(
            config.prefix,
            QueuingMetricSink::with_capacity(sink, QUEUE_CAPACITY),
        )
    } else {
        let sink = UdpMetricSink::from(addr, socket)?;
        StatsdClient::from_sink(
            config.prefix,
            QueuingMetricSink::with_capacity(sink, QUEUE_CAPACITY),
        )
    };

    tablesink_log::info!(
        sample_rate = f64::from(config.default_sample_rate),
        "reporting metrics to statsd at {addr}"
    );

    set_client(MetricsClient {
        client,
        default_tags: config.default_tags,
        sample_rate: config.default_sample_rate,
    });

    Ok(())
}

/// Calls `f` with the current client, or returns the default if none is installed.
#[inline(always)]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&MetricsClient) -> R,
    R: Default,
{
    THREAD_CLIENT.with(|cell| match cell.borrow().as_deref() {
        Some(client) => f(client),
        None => R::default(),
    })
}

/// Runs `f` with a capturing client on the current thread and returns the emitted lines.
pub fn with_capturing_test_client(f: impl FnOnce()) -> Vec<String> {
    let (rx, sink) = cadence::SpyMetricSink::new();
    let client = MetricsClient::from_sink("", sink, 1.0.into());

    THREAD_CLIENT.with(|cell| {
        let previous = cell.replace(Some(Arc::new(client)));
        f();
        cell.replace(previous);
    });

    rx.try_iter()
        .map(|line| String::from_utf8_lossy(&line).into_owned())
        .collect()
}

/// Name of a counter, incremented with `metric!(counter(..) += n)`.
pub trait CounterMetric {
    /// Metric name without the global prefix.
    fn name(&self) -> &'static str;
}

/// Name of a gauge, set with `metric!(gauge(..) = n)`.
pub trait GaugeMetric {
    /// Metric name without the global prefix.
    fn name(&self) -> &'static str;
}

/// Name of a distribution, recorded with `metric!(distribution(..) = n)`.
pub trait DistributionMetric {
    /// Metric name without the global prefix.
    fn name(&self) -> &'static str;
}

/// Name of a timer.
///
/// Timers accept a [`Duration`](std::time::Duration) and are sent as distributions in
/// milliseconds. A block can be timed directly:
///
/// ```
/// use tablesink_statsd::{metric, TimerMetric};
///
/// struct Merge;
///
/// impl TimerMetric for Merge {
///     fn name(&self) -> &'static str {
///         "merge"
///     }
/// }
///
/// let rows = metric!(timer(Merge), table = "metrics", { 50 });
/// assert_eq!(rows, 50);
/// ```
pub trait TimerMetric {
    /// Metric name without the global prefix.
    fn name(&self) -> &'static str;
}

#[doc(hidden)]
pub mod _pred {
    pub use cadence::prelude::*;
}

/// Records a metric on the current client.
///
/// Tags follow the value as `key = value` pairs. Keys may contain dots.
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        match $value {
            0 => {}
            value => $crate::with_client(|client| {
                use $crate::_pred::*;
                client.send_metric(
                    client.statsd().count_with_tags($crate::CounterMetric::name(&$id), value)
                        $(.with_tag(stringify!($($k).*), $v))*
                )
            }),
        }
    };

    (gauge($id:expr) = $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.statsd().gauge_with_tags($crate::GaugeMetric::name(&$id), $value)
                    $(.with_tag(stringify!($($k).*), $v))*
            )
        })
    };

    (distribution($id:expr) = $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.statsd().distribution_with_tags($crate::DistributionMetric::name(&$id), $value)
                    $(.with_tag(stringify!($($k).*), $v))*
            )
        })
    };

    (timer($id:expr) = $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            let millis = $value.as_secs_f64() * 1e3;
            client.send_metric(
                client.statsd().distribution_with_tags($crate::TimerMetric::name(&$id), millis)
                    $(.with_tag(stringify!($($k).*), $v))*
            )
        })
    };

    (timer($id:expr), $($($k:ident).* = $v:expr,)* $block:block) => {{
        let start = std::time::Instant::now();
        let rv = $block;
        $crate::metric!(timer($id) = start.elapsed() $(, $($k).* = $v)*);
        rv
    }};
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use cadence::NopMetricSink;

    use super::*;

    enum Counters {
        Rows,
    }

    impl CounterMetric for Counters {
        fn name(&self) -> &'static str {
            match self {
                Self::Rows => "rows",
            }
        }
    }

    struct Buffered;

    impl GaugeMetric for Buffered {
        fn name(&self) -> &'static str {
            "buffered"
        }
    }

    struct ChunkSize;

    impl DistributionMetric for ChunkSize {
        fn name(&self) -> &'static str {
            "chunk_size"
        }
    }

    struct Flush;

    impl TimerMetric for Flush {
        fn name(&self) -> &'static str {
            "flush"
        }
    }

    #[test]
    fn test_counter_with_tags() {
        let captures = with_capturing_test_client(|| {
            metric!(counter(Counters::Rows) += 50, store.table = "main.metrics");
            metric!(counter(Counters::Rows) += 0);
        });

        assert_eq!(captures, ["rows:50|c|#store.table:main.metrics"]);
    }

    #[test]
    fn test_gauge_and_distribution() {
        let captures = with_capturing_test_client(|| {
            metric!(gauge(Buffered) = 12);
            metric!(distribution(ChunkSize) = 50, table = "metrics");
        });

        assert_eq!(captures, ["buffered:12|g", "chunk_size:50|d|#table:metrics"]);
    }

    #[test]
    fn test_timer_in_millis() {
        let captures = with_capturing_test_client(|| {
            metric!(timer(Flush) = Duration::from_millis(1500), outcome = "ok");
        });

        assert_eq!(captures, ["flush:1500|d|#outcome:ok"]);
    }

    #[test]
    fn test_timed_block_returns_value() {
        let mut value = 0;
        let captures = with_capturing_test_client(|| {
            value = metric!(timer(Flush), outcome = "ok", { 7 });
        });

        assert_eq!(value, 7);
        assert!(captures[0].starts_with("flush:"));
        assert!(captures[0].ends_with("|d|#outcome:ok"));
    }

    #[test]
    fn test_zero_sample_rate_drops_metrics() {
        assert!(!SampleRate::from(0.0).sampled());
        assert!(SampleRate::from(1.0).sampled());
        assert_eq!(f64::from(SampleRate::from(3.0)), 1.0);
    }

    #[test]
    fn test_set_client_replaces_thread_client() {
        let before = with_client(|client| Some(client.sample_rate));
        set_client(MetricsClient::from_sink("", NopMetricSink, 0.25.into()));
        let after = with_client(|client| Some(client.sample_rate));

        assert_ne!(before, after);
        assert_eq!(after, Some(SampleRate::from(0.25)));
    }
}
