//! Delivery of ready batches through the connection pool.
//!
//! Each group in a batch becomes one [`TransportPackage`]. A package is sent
//! on a connection picked for the lane's pool; a failed send counts against
//! that connection and the package is tried again, possibly elsewhere, until
//! [`RETRY_COUNT`](crate::config::RETRY_COUNT) attempts have failed. When the
//! pool has nothing selectable the group is redirected to the overflow lane
//! if it qualifies, and dropped otherwise.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use log::{debug, warn};

use crate::batcher::Batch;
use crate::classifier::Lane;
use crate::config::SharedConfig;
use crate::error::TransportError;
use crate::lanes::LaneBuffers;
use crate::log_record::LogGroup;
use crate::package::{RetryDecision, TransportPackage};
use crate::pool::{ConnectionPool, PoolRole};
use crate::stats::{DeliveryStats, DropReason};

/// What happened to a single group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Moved to the overflow lane because its pool had no connection.
    Redirected,
    Dropped(DropReason),
}

/// Per-batch tally, mostly for tests and debug logging.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub sent: usize,
    pub redirected: usize,
    pub dropped: usize,
}

impl BatchReport {
    fn record(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Sent => self.sent += 1,
            Delivery::Redirected => self.redirected += 1,
            Delivery::Dropped(_) => self.dropped += 1,
        }
    }
}

pub struct Dispatcher {
    config: SharedConfig,
    pool: Arc<ConnectionPool>,
    lanes: Arc<LaneBuffers>,
    stats: Arc<DeliveryStats>,
    abandoned: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        config: SharedConfig,
        pool: Arc<ConnectionPool>,
        lanes: Arc<LaneBuffers>,
        stats: Arc<DeliveryStats>,
    ) -> Self {
        Self {
            config,
            pool,
            lanes,
            stats,
            abandoned: AtomicBool::new(false),
        }
    }

    /// Deliver every group of `batch` in order.
    pub fn dispatch(&self, batch: Batch) -> BatchReport {
        let mut report = BatchReport::default();
        let lane = batch.lane;
        for group in batch.groups {
            report.record(self.deliver(group, lane));
        }
        if report.dropped > 0 {
            debug!(
                "femtotransport: {lane} batch delivered {} groups, dropped {}",
                report.sent, report.dropped
            );
        }
        report
    }

    /// Deliver one group. Failures are absorbed and counted.
    pub fn deliver(&self, group: LogGroup, lane: Lane) -> Delivery {
        let records = group.len();
        if self.is_abandoned() {
            return self.drop_group(DropReason::Shutdown, records);
        }
        let mut package = match TransportPackage::for_group(group, lane, &self.config) {
            Ok(package) => package,
            Err(err) => {
                warn!("femtotransport: could not encode {lane} log group: {err}");
                return self.drop_group(DropReason::Serialise, records);
            }
        };
        if package.payload.len() > self.config.max_frame_size {
            warn!(
                "femtotransport: {lane} log group of {} bytes exceeds the frame limit",
                package.payload.len()
            );
            return self.drop_group(DropReason::Serialise, records);
        }

        let role = PoolRole::for_lane(lane);
        loop {
            let conn = match self.pool.select(role) {
                Ok(conn) => conn,
                Err(TransportError::NoHealthyConnection(_)) => {
                    return self.degrade(package, lane, role);
                }
                Err(err) => {
                    warn!("femtotransport: connection selection failed: {err}");
                    return self.drop_group(DropReason::NoHealthyConnection, records);
                }
            };
            match conn.send(&mut package) {
                Ok(()) => {
                    self.pool.report_success(&conn);
                    self.stats.record_sent();
                    return Delivery::Sent;
                }
                Err(err) => {
                    self.pool.report_failure(&conn, Instant::now());
                    debug!(
                        "femtotransport: package {} failed on {} connection {}: {err}",
                        package.id,
                        conn.role(),
                        conn.slot()
                    );
                }
            }
            match package.record_failure() {
                RetryDecision::Retry => {
                    self.stats.record_retry();
                    if self.is_abandoned() {
                        return self.drop_group(DropReason::Shutdown, records);
                    }
                }
                RetryDecision::Exhausted => {
                    let err = TransportError::RetriesExhausted {
                        id: package.id,
                        attempts: package.retry_count(),
                    };
                    debug!("femtotransport: {err}");
                    return self.drop_group(DropReason::RetriesExhausted, records);
                }
            }
        }
    }

    /// Degraded mode: the lane's pool has no selectable connection.
    fn degrade(&self, package: TransportPackage, lane: Lane, role: PoolRole) -> Delivery {
        let Some((group, _)) = package.into_group() else {
            return self.drop_group(DropReason::NoHealthyConnection, 0);
        };
        if lane == Lane::Overflow {
            return self.drop_group(DropReason::NoHealthyConnection, group.len());
        }
        // Rejections are counted by the lane buffers.
        match self.lanes.redirect_to_overflow(group, role) {
            Ok(_) => Delivery::Redirected,
            Err(TransportError::Closed) => Delivery::Dropped(DropReason::Closed),
            Err(TransportError::BufferFull(_)) => Delivery::Dropped(DropReason::BufferFull),
            Err(_) => Delivery::Dropped(DropReason::NoHealthyConnection),
        }
    }

    fn drop_group(&self, reason: DropReason, records: usize) -> Delivery {
        self.stats.record_drop(reason, records);
        Delivery::Dropped(reason)
    }

    /// Give up on anything not yet sent. Used once the shutdown deadline has
    /// passed.
    pub fn abandon(&self) {
        self.abandoned.store(true, Ordering::SeqCst);
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst)
    }

    /// Count groups that will never be dispatched.
    pub fn discard(&self, groups: impl IntoIterator<Item = LogGroup>) -> usize {
        let mut count = 0;
        for group in groups {
            self.stats.record_drop(DropReason::Shutdown, group.len());
            count += 1;
        }
        count
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}
