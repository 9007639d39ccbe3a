use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tablesink_statsd::metric;
use tablesink_system::{
    Addr, AsyncResponse, Controller, FromMessage, Interface, NoResponse, Receiver, Request,
    Sender, Service, ServiceRunner, Shutdown,
};
use tokio::time::{Instant, Sleep};

use crate::buffer::{FlushState, MetricBuffer};
use crate::key::SeriesKey;
use crate::sample::Sample;
use crate::statsd::{ExporterCounters, ExporterDistributions, ExporterGauges, ExporterTimers};
use crate::store::StatementExecutor;
use crate::writer::{BatchWriter, FlushReport};

/// Schedules a flush of the buffer after the flush interval.
///
/// Sent by [`TableExporter`] whenever a push arms the buffer. Scheduling while a flush is
/// already pending has no effect.
#[derive(Debug)]
pub struct ScheduleFlush;

/// Flushes the buffer immediately and responds with the result.
#[derive(Debug)]
pub struct FlushNow;

/// The interface of the [`FlushService`].
#[derive(Debug)]
pub enum FlushServiceMessage {
    /// Arms the flush timer.
    Schedule(ScheduleFlush),
    /// Flushes without waiting for the timer.
    FlushNow(FlushNow, Sender<FlushReport>),
}

impl FlushServiceMessage {
    /// Returns the name of the message variant.
    pub fn variant(&self) -> &'static str {
        match self {
            Self::Schedule(_) => "schedule",
            Self::FlushNow(_, _) => "flush_now",
        }
    }
}

impl Interface for FlushServiceMessage {}

impl FromMessage<ScheduleFlush> for FlushServiceMessage {
    type Response = NoResponse;

    fn from_message(message: ScheduleFlush, _: ()) -> Self {
        Self::Schedule(message)
    }
}

impl FromMessage<FlushNow> for FlushServiceMessage {
    type Response = AsyncResponse<FlushReport>;

    fn from_message(message: FlushNow, sender: Sender<FlushReport>) -> Self {
        Self::FlushNow(message, sender)
    }
}

/// Service that flushes a [`MetricBuffer`] to the store.
///
/// The service owns the flush timer. The timer is armed by a [`ScheduleFlush`] message, which is
/// sent for the first sample of every cycle, and fires once after the flush interval. A flush
/// drains the buffer and writes the drained entries with the [`BatchWriter`]. Only after the
/// writer completes does the cycle end. If samples arrived in the meantime, the timer is armed
/// again right away.
///
/// On graceful shutdown, the remaining samples are flushed once more. The same happens when all
/// [`TableExporter`] handles have been dropped.
pub struct FlushService<E> {
    buffer: Arc<MetricBuffer>,
    writer: BatchWriter<E>,
    flush_interval: Duration,
    next_flush: Pin<Box<Sleep>>,
    armed: bool,
}

impl<E: StatementExecutor> FlushService<E> {
    /// Creates a new flush service for the given buffer.
    pub fn new(buffer: Arc<MetricBuffer>, writer: BatchWriter<E>, flush_interval: Duration) -> Self {
        Self {
            buffer,
            writer,
            flush_interval,
            next_flush: Box::pin(tokio::time::sleep(Duration::ZERO)),
            armed: false,
        }
    }

    fn arm(&mut self) {
        self.armed = true;
        self.next_flush
            .as_mut()
            .reset(Instant::now() + self.flush_interval);
    }

    async fn flush(&mut self) -> FlushReport {
        let entries = self.buffer.drain_all();

        let report = if entries.is_empty() {
            tablesink_log::info!("no metrics to flush");
            FlushReport::default()
        } else {
            metric!(distribution(ExporterDistributions::FlushSize) = entries.len() as u64);
            let start = Instant::now();
            let report = self.writer.flush(entries).await;
            metric!(timer(ExporterTimers::FlushDuration) = start.elapsed());

            tablesink_log::info!(
                chunks = report.chunks,
                chunks_failed = report.chunks_failed,
                rows_written = report.rows_written,
                rows_lost = report.rows_lost,
                "flushed metrics buffer"
            );
            report
        };

        if self.buffer.complete_cycle() {
            self.arm();
        } else {
            self.armed = false;
        }

        metric!(counter(ExporterCounters::Flushes) += 1);
        metric!(gauge(ExporterGauges::BufferedSeries) = self.buffer.len() as u64);

        report
    }

    fn handle_schedule(&mut self) {
        if self.armed {
            tablesink_log::trace!("flush already scheduled");
            return;
        }

        // A manual flush may have completed the cycle while this message was queued.
        if self.buffer.state() == FlushState::Idle {
            tablesink_log::trace!("flush cycle already completed");
            return;
        }

        self.arm();
    }

    async fn handle_message(&mut self, message: FlushServiceMessage) {
        match message {
            FlushServiceMessage::Schedule(ScheduleFlush) => self.handle_schedule(),
            FlushServiceMessage::FlushNow(FlushNow, sender) => sender.send(self.flush().await),
        }
    }

    async fn handle_shutdown(&mut self, shutdown: Shutdown) {
        tablesink_log::info!("exporter shutting down");

        if shutdown.timeout.is_some() && !self.buffer.is_empty() {
            self.flush().await;
        }
    }
}

impl<E: StatementExecutor> Service for FlushService<E> {
    type Interface = FlushServiceMessage;

    async fn run(mut self, mut rx: Receiver<Self::Interface>) {
        let mut shutdown = Controller::shutdown_handle();

        tablesink_log::info!(table = self.writer.table().as_str(), "exporter started");

        loop {
            tokio::select! {
                biased;

                _ = &mut self.next_flush, if self.armed => {
                    self.flush().await;
                }
                message = rx.recv() => match message {
                    Some(message) => {
                        tablesink_log::trace!(message = message.variant(), "handling message");
                        self.handle_message(message).await;
                    }
                    None => {
                        tablesink_log::info!("exporter handles dropped, flushing remaining metrics");
                        if !self.buffer.is_empty() {
                            self.flush().await;
                        }
                        break;
                    }
                },
                shutdown = shutdown.notified() => {
                    self.handle_shutdown(shutdown).await;
                    break;
                }
            }
        }
    }
}

impl<E> Drop for FlushService<E> {
    fn drop(&mut self) {
        let remaining = self.buffer.len();
        if remaining > 0 {
            tablesink_log::error!(remaining, "exporter dropping buffered metrics");
            metric!(
                counter(ExporterCounters::SamplesDropped) += remaining as i64,
                reason = "shutdown",
            );
        }
    }
}

/// Summary of a batch of samples handed to [`TableExporter::push_samples`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IngestSummary {
    /// Samples added to the buffer.
    pub accepted: usize,
    /// Samples of metric kinds that are not aggregated.
    pub skipped: usize,
    /// Samples dropped because of invalid labels or values.
    pub rejected: usize,
}

/// Cloneable handle to a running exporter.
///
/// Pushing samples never blocks on the store. Samples go straight into the shared buffer and
/// the flush service is only notified when a new flush cycle begins.
#[derive(Clone, Debug)]
pub struct TableExporter {
    buffer: Arc<MetricBuffer>,
    service: Addr<FlushServiceMessage>,
}

impl TableExporter {
    /// Starts a detached [`FlushService`] writing with `writer` and returns a handle to it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<E: StatementExecutor>(writer: BatchWriter<E>, flush_interval: Duration) -> Self {
        let buffer = Arc::new(MetricBuffer::new());
        let service = FlushService::new(Arc::clone(&buffer), writer, flush_interval);

        Self {
            buffer,
            service: service.start_detached(),
        }
    }

    /// Starts the [`FlushService`] in `runner`, so that its final flush can be awaited.
    pub fn start_in<E: StatementExecutor>(
        runner: &mut ServiceRunner,
        writer: BatchWriter<E>,
        flush_interval: Duration,
    ) -> Self {
        let buffer = Arc::new(MetricBuffer::new());
        let service = FlushService::new(Arc::clone(&buffer), writer, flush_interval);

        Self {
            buffer,
            service: runner.start(service),
        }
    }

    /// Records a single value for a series.
    ///
    /// NaN values are dropped.
    pub fn push_sample(&self, key: SeriesKey, value: f64) {
        if value.is_nan() {
            tablesink_log::debug!(key = %key, "dropping NaN sample");
            metric!(counter(ExporterCounters::SamplesDropped) += 1, reason = "nan");
            return;
        }

        metric!(counter(ExporterCounters::SamplesAccepted) += 1);
        if self.buffer.push_sample(key, value) {
            self.service.send(ScheduleFlush);
        }
    }

    /// Records a batch of samples from an ingestion adapter.
    ///
    /// Only gauges and sums are aggregated. Samples of other kinds are skipped, and samples
    /// whose labels contain the key separator are rejected.
    pub fn push_samples(&self, samples: impl IntoIterator<Item = Sample>) -> IngestSummary {
        let mut summary = IngestSummary::default();

        for sample in samples {
            if !sample.kind.is_aggregated() {
                tablesink_log::debug!(
                    metric_name = sample.name.as_str(),
                    kind = %sample.kind,
                    "skipping unsupported metric type"
                );
                metric!(
                    counter(ExporterCounters::SamplesDropped) += 1,
                    reason = "unsupported",
                );
                summary.skipped += 1;
                continue;
            }

            let key = match sample.series_key() {
                Ok(key) => key,
                Err(error) => {
                    tablesink_log::debug!(
                        error = &error as &dyn std::error::Error,
                        metric_name = sample.name.as_str(),
                        "dropping sample with invalid label"
                    );
                    metric!(
                        counter(ExporterCounters::SamplesDropped) += 1,
                        reason = "invalid_label",
                    );
                    summary.rejected += 1;
                    continue;
                }
            };

            if sample.value.is_nan() {
                summary.rejected += 1;
            } else {
                summary.accepted += 1;
            }
            self.push_sample(key, sample.value);
        }

        summary
    }

    /// Flushes the buffer without waiting for the flush timer.
    pub fn flush_now(&self) -> Request<FlushReport> {
        self.service.send(FlushNow)
    }

    /// Returns `true` if no samples are buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Returns the number of buffered series.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }
}
