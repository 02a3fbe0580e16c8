//! Bounded lane buffers feeding the batchers.
//!
//! Each lane is a bounded crossbeam channel. Producers never wait on the
//! normal or overflow lanes: a full normal lane spills eligible groups into
//! the overflow lane and drops the rest. The hi-pri lane follows the
//! configured [`HiPriOverflowPolicy`]. Every rejected group is counted in
//! [`DeliveryStats`].

use std::sync::Arc;

use crossbeam_channel::{Receiver, SendError, SendTimeoutError, Sender, TrySendError, bounded};
use parking_lot::RwLock;

use crate::classifier::{self, Lane};
use crate::config::{HiPriOverflowPolicy, SharedConfig};
use crate::error::TransportError;
use crate::log_record::LogGroup;
use crate::pool::PoolRole;
use crate::stats::{DeliveryStats, DropReason};

#[derive(Clone)]
struct LaneSenders {
    normal: Sender<LogGroup>,
    hipri: Sender<LogGroup>,
    overflow: Sender<LogGroup>,
}

impl LaneSenders {
    fn get(&self, lane: Lane) -> &Sender<LogGroup> {
        match lane {
            Lane::Normal => &self.normal,
            Lane::HiPri => &self.hipri,
            Lane::Overflow => &self.overflow,
        }
    }
}

/// Consumer halves of the lanes, handed to the lane workers.
pub struct LaneReceivers {
    pub normal: Receiver<LogGroup>,
    pub hipri: Receiver<LogGroup>,
    pub overflow: Receiver<LogGroup>,
}

impl LaneReceivers {
    pub fn into_vec(self) -> Vec<(Lane, Receiver<LogGroup>)> {
        vec![
            (Lane::Normal, self.normal),
            (Lane::HiPri, self.hipri),
            (Lane::Overflow, self.overflow),
        ]
    }
}

/// Producer side of the three lanes.
pub struct LaneBuffers {
    senders: RwLock<Option<LaneSenders>>,
    config: SharedConfig,
    stats: Arc<DeliveryStats>,
}

impl LaneBuffers {
    pub fn new(config: SharedConfig, stats: Arc<DeliveryStats>) -> (Self, LaneReceivers) {
        let (normal_tx, normal_rx) = bounded(config.channel_size);
        let (hipri_tx, hipri_rx) = bounded(config.hipri_channel_size);
        let (overflow_tx, overflow_rx) = bounded(config.overflow_channel_size);
        let buffers = Self {
            senders: RwLock::new(Some(LaneSenders {
                normal: normal_tx,
                hipri: hipri_tx,
                overflow: overflow_tx,
            })),
            config,
            stats,
        };
        let receivers = LaneReceivers {
            normal: normal_rx,
            hipri: hipri_rx,
            overflow: overflow_rx,
        };
        (buffers, receivers)
    }

    /// Classify `group` and enqueue it, returning the lane it landed in.
    pub fn submit(&self, group: LogGroup) -> Result<Lane, TransportError> {
        let lane = classifier::classify(&group, &self.config, self.is_saturated(Lane::Normal));
        self.enqueue(group, lane)
    }

    /// Enqueue `group` into `lane`, applying the lane's fallback policy.
    pub fn enqueue(&self, group: LogGroup, lane: Lane) -> Result<Lane, TransportError> {
        let Some(senders) = self.senders.read().clone() else {
            return self.closed(&group);
        };
        match lane {
            Lane::Normal => match senders.normal.try_send(group) {
                Ok(()) => Ok(Lane::Normal),
                Err(TrySendError::Full(group)) => {
                    if classifier::overflow_eligible(&group, &self.config) {
                        self.spill(&senders, group)
                    } else {
                        self.reject(Lane::Normal, &group)
                    }
                }
                Err(TrySendError::Disconnected(group)) => self.closed(&group),
            },
            Lane::Overflow => self.spill(&senders, group),
            Lane::HiPri => self.enqueue_hipri(&senders.hipri, group),
        }
    }

    /// Move a group that found no connection in the `role` pool into the
    /// overflow lane, if it qualifies.
    ///
    /// An ineligible group is dropped and reported as
    /// [`TransportError::NoHealthyConnection`].
    pub fn redirect_to_overflow(
        &self,
        group: LogGroup,
        role: PoolRole,
    ) -> Result<Lane, TransportError> {
        if !classifier::overflow_eligible(&group, &self.config) {
            self.stats
                .record_drop(DropReason::NoHealthyConnection, group.len());
            return Err(TransportError::NoHealthyConnection(role));
        }
        self.enqueue(group, Lane::Overflow)
    }

    fn spill(&self, senders: &LaneSenders, group: LogGroup) -> Result<Lane, TransportError> {
        match senders.overflow.try_send(group) {
            Ok(()) => {
                self.stats.record_overflow_redirect();
                Ok(Lane::Overflow)
            }
            Err(TrySendError::Full(group)) => self.reject(Lane::Overflow, &group),
            Err(TrySendError::Disconnected(group)) => self.closed(&group),
        }
    }

    fn enqueue_hipri(&self, tx: &Sender<LogGroup>, group: LogGroup) -> Result<Lane, TransportError> {
        match self.config.hipri_overflow_policy {
            HiPriOverflowPolicy::Drop => match tx.try_send(group) {
                Ok(()) => Ok(Lane::HiPri),
                Err(TrySendError::Full(group)) => self.reject(Lane::HiPri, &group),
                Err(TrySendError::Disconnected(group)) => self.closed(&group),
            },
            HiPriOverflowPolicy::Block => match tx.send(group) {
                Ok(()) => Ok(Lane::HiPri),
                Err(SendError(group)) => self.closed(&group),
            },
            HiPriOverflowPolicy::Timeout(dur) => match tx.send_timeout(group, dur) {
                Ok(()) => Ok(Lane::HiPri),
                Err(SendTimeoutError::Timeout(group)) => self.reject(Lane::HiPri, &group),
                Err(SendTimeoutError::Disconnected(group)) => self.closed(&group),
            },
        }
    }

    fn reject(&self, lane: Lane, group: &LogGroup) -> Result<Lane, TransportError> {
        self.stats.record_drop(DropReason::BufferFull, group.len());
        Err(TransportError::BufferFull(lane))
    }

    fn closed(&self, group: &LogGroup) -> Result<Lane, TransportError> {
        self.stats.record_drop(DropReason::Closed, group.len());
        Err(TransportError::Closed)
    }

    /// Whether `lane` currently holds as many groups as it can.
    pub fn is_saturated(&self, lane: Lane) -> bool {
        self.senders
            .read()
            .as_ref()
            .is_some_and(|s| s.get(lane).is_full())
    }

    /// Number of groups waiting in `lane`.
    pub fn len(&self, lane: Lane) -> usize {
        self.senders.read().as_ref().map_or(0, |s| s.get(lane).len())
    }

    /// Stop accepting groups. Lane workers observe the disconnect once they
    /// have drained what was already queued.
    pub fn close(&self) {
        self.senders.write().take();
    }

    pub fn is_closed(&self) -> bool {
        self.senders.read().is_none()
    }
}
