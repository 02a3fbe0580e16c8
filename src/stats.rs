//! Delivery counters and rate-limited drop warnings.
//!
//! Every failure the pipeline absorbs instead of surfacing to producers is
//! counted here. The per-reason counters are per log group (the unit that
//! flows through the lanes); `records_dropped` totals the records inside
//! those groups.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::warn;
use parking_lot::Mutex;

/// Default spacing between coalesced drop warnings.
pub const DEFAULT_WARN_INTERVAL: Duration = Duration::from_secs(5);

/// Categorises why a group was dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Lane saturated with no fallback.
    BufferFull,
    /// Submitted after shutdown began.
    Closed,
    /// No connection could take the package and overflow was not eligible.
    NoHealthyConnection,
    /// Every permitted attempt failed.
    RetriesExhausted,
    /// Still pending when the shutdown deadline elapsed.
    Shutdown,
    /// Payload could not be encoded or exceeded the frame limit.
    Serialise,
}

impl DropReason {
    fn describe(self) -> &'static str {
        match self {
            DropReason::BufferFull => "because the lane buffer was full",
            DropReason::Closed => "after the transport was closed",
            DropReason::NoHealthyConnection => "because no healthy connection was available",
            DropReason::RetriesExhausted => "after exhausting retries",
            DropReason::Shutdown => "because the shutdown deadline elapsed",
            DropReason::Serialise => "because they could not be serialised",
        }
    }
}

/// Point-in-time copy of [`DeliveryStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sent: u64,
    pub retried: u64,
    pub redirected_overflow: u64,
    pub dropped_buffer_full: u64,
    pub dropped_closed: u64,
    pub dropped_no_connection: u64,
    pub retries_exhausted: u64,
    pub dropped_on_shutdown: u64,
    pub dropped_serialise: u64,
    /// Records inside every dropped group.
    pub records_dropped: u64,
    pub health_checks_failed: u64,
    pub connection_resets: u64,
}

impl StatsSnapshot {
    /// Total groups dropped for any reason.
    pub fn total_dropped(&self) -> u64 {
        self.dropped_buffer_full
            + self.dropped_closed
            + self.dropped_no_connection
            + self.retries_exhausted
            + self.dropped_on_shutdown
            + self.dropped_serialise
    }
}

pub struct DeliveryStats {
    sent: AtomicU64,
    retried: AtomicU64,
    redirected_overflow: AtomicU64,
    dropped_buffer_full: AtomicU64,
    dropped_closed: AtomicU64,
    dropped_no_connection: AtomicU64,
    retries_exhausted: AtomicU64,
    dropped_on_shutdown: AtomicU64,
    dropped_serialise: AtomicU64,
    records_dropped: AtomicU64,
    health_checks_failed: AtomicU64,
    connection_resets: AtomicU64,
    warner: DropWarner,
}

impl DeliveryStats {
    pub fn new(warn_interval: Duration) -> Self {
        Self {
            sent: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            redirected_overflow: AtomicU64::new(0),
            dropped_buffer_full: AtomicU64::new(0),
            dropped_closed: AtomicU64::new(0),
            dropped_no_connection: AtomicU64::new(0),
            retries_exhausted: AtomicU64::new(0),
            dropped_on_shutdown: AtomicU64::new(0),
            dropped_serialise: AtomicU64::new(0),
            records_dropped: AtomicU64::new(0),
            health_checks_failed: AtomicU64::new(0),
            connection_resets: AtomicU64::new(0),
            warner: DropWarner::new(warn_interval),
        }
    }

    /// Count a dropped group of `records` records and emit a coalesced
    /// warning when due.
    pub fn record_drop(&self, reason: DropReason, records: usize) {
        let counter = match reason {
            DropReason::BufferFull => &self.dropped_buffer_full,
            DropReason::Closed => &self.dropped_closed,
            DropReason::NoHealthyConnection => &self.dropped_no_connection,
            DropReason::RetriesExhausted => &self.retries_exhausted,
            DropReason::Shutdown => &self.dropped_on_shutdown,
            DropReason::Serialise => &self.dropped_serialise,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.records_dropped
            .fetch_add(records as u64, Ordering::Relaxed);
        self.warner.note(|count| {
            warn!(
                "femtotransport: {count} log groups dropped in the last interval (latest {})",
                reason.describe()
            );
        });
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overflow_redirect(&self) {
        self.redirected_overflow.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_health_check_failure(&self) {
        self.health_checks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reset(&self) {
        self.connection_resets.fetch_add(1, Ordering::Relaxed);
    }

    /// Emit any pending drop warning immediately.
    pub fn flush_warnings(&self) {
        self.warner.flush(|count| {
            warn!("femtotransport: {count} log groups dropped since the last report");
        });
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            redirected_overflow: self.redirected_overflow.load(Ordering::Relaxed),
            dropped_buffer_full: self.dropped_buffer_full.load(Ordering::Relaxed),
            dropped_closed: self.dropped_closed.load(Ordering::Relaxed),
            dropped_no_connection: self.dropped_no_connection.load(Ordering::Relaxed),
            retries_exhausted: self.retries_exhausted.load(Ordering::Relaxed),
            dropped_on_shutdown: self.dropped_on_shutdown.load(Ordering::Relaxed),
            dropped_serialise: self.dropped_serialise.load(Ordering::Relaxed),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
            health_checks_failed: self.health_checks_failed.load(Ordering::Relaxed),
            connection_resets: self.connection_resets.load(Ordering::Relaxed),
        }
    }
}

impl Default for DeliveryStats {
    fn default() -> Self {
        Self::new(DEFAULT_WARN_INTERVAL)
    }
}

/// Coalesces drop warnings so a saturated pipeline reports at most once per
/// interval instead of once per group.
struct DropWarner {
    interval: Duration,
    pending: AtomicU64,
    last_report: Mutex<Option<Instant>>,
}

impl DropWarner {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            pending: AtomicU64::new(0),
            last_report: Mutex::new(None),
        }
    }

    /// Count one drop and call `report` with the pending total if the
    /// interval since the last report has elapsed. The first drop is
    /// reported immediately.
    fn note(&self, report: impl FnOnce(u64)) {
        self.pending.fetch_add(1, Ordering::Relaxed);
        // A contended lock means another thread is reporting right now.
        let Some(mut last) = self.last_report.try_lock() else {
            return;
        };
        if (*last).is_some_and(|at| at.elapsed() < self.interval) {
            return;
        }
        let count = self.pending.swap(0, Ordering::Relaxed);
        if count > 0 {
            *last = Some(Instant::now());
            report(count);
        }
    }

    /// Report whatever is pending, regardless of the interval.
    fn flush(&self, report: impl FnOnce(u64)) {
        let count = self.pending.swap(0, Ordering::Relaxed);
        if count > 0 {
            *self.last_report.lock() = Some(Instant::now());
            report(count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logtest::Logger;
    use serial_test::serial;

    #[test]
    fn drops_are_counted_by_reason() {
        let stats = DeliveryStats::default();
        stats.record_drop(DropReason::BufferFull, 1);
        stats.record_drop(DropReason::RetriesExhausted, 50);
        stats.record_drop(DropReason::RetriesExhausted, 2);
        stats.record_sent();
        let snap = stats.snapshot();
        assert_eq!(snap.dropped_buffer_full, 1);
        assert_eq!(snap.retries_exhausted, 2);
        assert_eq!(snap.sent, 1);
        assert_eq!(snap.total_dropped(), 3);
        assert_eq!(snap.records_dropped, 53);
    }

    #[test]
    fn warner_reports_first_drop_then_waits_for_interval() {
        let warner = DropWarner::new(Duration::from_secs(60));
        let mut reports = Vec::new();
        warner.note(|count| reports.push(count));
        warner.note(|count| reports.push(count));
        warner.note(|count| reports.push(count));
        assert_eq!(reports, [1]);
        warner.flush(|count| reports.push(count));
        assert_eq!(reports, [1, 2]);
        warner.flush(|count| reports.push(count));
        assert_eq!(reports, [1, 2]);
    }

    #[test]
    fn zero_interval_reports_every_drop() {
        let warner = DropWarner::new(Duration::ZERO);
        let mut reports = Vec::new();
        for _ in 0..3 {
            warner.note(|count| reports.push(count));
        }
        assert_eq!(reports, [1, 1, 1]);
    }

    #[test]
    #[serial]
    fn first_drop_logs_a_warning() {
        let mut logger = Logger::start();
        let stats = DeliveryStats::new(Duration::from_secs(60));
        stats.record_drop(DropReason::Closed, 1);
        let log = std::iter::from_fn(|| logger.pop())
            .find(|r| r.args().contains("femtotransport"))
            .expect("no warning produced");
        assert_eq!(log.level(), log::Level::Warn);
        assert!(log.args().contains("1 log groups dropped"));
        assert!(log.args().contains("after the transport was closed"));
    }
}
