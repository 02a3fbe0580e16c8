//! Size- and time-bounded batching for a single lane.
//!
//! The batcher is a plain accumulator driven by the lane worker: it never
//! blocks and never reads the clock itself, which keeps the emission rules
//! testable with synthetic instants.

use std::time::{Duration, Instant};

use crate::classifier::Lane;
use crate::log_record::LogGroup;

/// Groups emitted together to the dispatcher, in lane order.
#[derive(Debug)]
pub struct Batch {
    pub lane: Lane,
    pub groups: Vec<LogGroup>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

pub struct Batcher {
    lane: Lane,
    target_size: usize,
    interval: Duration,
    pending: Vec<LogGroup>,
    first_at: Option<Instant>,
}

impl Batcher {
    pub fn new(lane: Lane, target_size: usize, interval: Duration) -> Self {
        Self {
            lane,
            target_size: target_size.max(1),
            interval,
            pending: Vec::with_capacity(target_size.max(1)),
            first_at: None,
        }
    }

    /// Add `group`; returns a full batch once the target size is reached.
    pub fn push(&mut self, group: LogGroup, now: Instant) -> Option<Batch> {
        if self.pending.is_empty() {
            self.first_at = Some(now);
        }
        self.pending.push(group);
        if self.pending.len() >= self.target_size {
            return self.take();
        }
        None
    }

    /// Instant at which the current partial batch must be emitted.
    pub fn deadline(&self) -> Option<Instant> {
        self.first_at.map(|first| first + self.interval)
    }

    /// Emit the partial batch if its interval has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<Batch> {
        match self.deadline() {
            Some(deadline) if now >= deadline => self.take(),
            _ => None,
        }
    }

    /// Emit whatever is pending, used on shutdown.
    pub fn flush(&mut self) -> Option<Batch> {
        self.take()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn take(&mut self) -> Option<Batch> {
        self.first_at = None;
        if self.pending.is_empty() {
            return None;
        }
        let groups = std::mem::replace(&mut self.pending, Vec::with_capacity(self.target_size));
        Some(Batch {
            lane: self.lane,
            groups,
        })
    }
}
