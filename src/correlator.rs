//! Groups records sharing a correlation id before classification.
//!
//! Open groups live in a single map guarded by one mutex, so an append can
//! never interleave with the idle sweep that flushes the same group. The
//! same lock carries the closed flag set by [`Correlator::drain`]: once the
//! final drain has run, correlated records are refused instead of being
//! parked in a group nobody will flush.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::TransportError;
use crate::log_record::{CorrelationData, LogGroup, LogRecord};

struct OpenGroup {
    group: LogGroup,
    opened: Instant,
    last_append: Instant,
}

impl OpenGroup {
    fn new(correlation: CorrelationData, now: Instant) -> Self {
        Self {
            group: LogGroup::correlated(correlation),
            opened: now,
            last_append: now,
        }
    }
}

#[derive(Default)]
struct Groups {
    open: HashMap<String, OpenGroup>,
    closed: bool,
}

pub struct Correlator {
    groups: Mutex<Groups>,
    idle_window: Duration,
}

impl Correlator {
    pub fn new(idle_window: Duration) -> Self {
        Self {
            groups: Mutex::new(Groups::default()),
            idle_window,
        }
    }

    /// Register correlation data ahead of its records.
    ///
    /// Returns `false` when a group for the id is already open (the first
    /// registration keeps ownership of the data) or the correlator has been
    /// drained.
    pub fn open(&self, correlation: CorrelationData) -> bool {
        self.open_at(correlation, Instant::now())
    }

    pub fn open_at(&self, correlation: CorrelationData, now: Instant) -> bool {
        let mut groups = self.groups.lock();
        if groups.closed || groups.open.contains_key(&correlation.correlation_id) {
            return false;
        }
        let id = correlation.correlation_id.clone();
        groups.open.insert(id, OpenGroup::new(correlation, now));
        true
    }

    /// Route `record` into its group.
    ///
    /// Uncorrelated records are returned immediately as singleton groups;
    /// correlated records are held until the group is closed or swept.
    /// Correlated records arriving after [`drain`](Self::drain) fail with
    /// [`TransportError::Closed`].
    pub fn accept(&self, record: LogRecord) -> Result<Option<LogGroup>, TransportError> {
        self.accept_at(record, Instant::now())
    }

    pub fn accept_at(
        &self,
        record: LogRecord,
        now: Instant,
    ) -> Result<Option<LogGroup>, TransportError> {
        let Some(id) = record.correlation_id.clone() else {
            return Ok(Some(LogGroup::singleton(record)));
        };
        let mut groups = self.groups.lock();
        if groups.closed {
            return Err(TransportError::Closed);
        }
        let entry = groups
            .open
            .entry(id)
            .or_insert_with_key(|id| OpenGroup::new(CorrelationData::new(id.as_str(), ""), now));
        entry.group.push(record);
        entry.last_append = now;
        Ok(None)
    }

    /// Flush the group for `correlation_id` on an explicit close signal.
    pub fn close(&self, correlation_id: &str) -> Option<LogGroup> {
        let removed = self.groups.lock().open.remove(correlation_id)?;
        (!removed.group.is_empty()).then_some(removed.group)
    }

    /// Flush every group idle for at least the configured window.
    pub fn sweep(&self, now: Instant) -> Vec<LogGroup> {
        let mut groups = self.groups.lock();
        let idle: Vec<String> = groups
            .open
            .iter()
            .filter(|(_, g)| now.saturating_duration_since(g.last_append) >= self.idle_window)
            .map(|(id, _)| id.clone())
            .collect();
        let mut flushed: Vec<OpenGroup> =
            idle.iter().filter_map(|id| groups.open.remove(id)).collect();
        drop(groups);
        flushed.sort_by_key(|g| g.opened);
        flushed
            .into_iter()
            .map(|g| g.group)
            .filter(|g| !g.is_empty())
            .collect()
    }

    /// Flush every open group regardless of age and stop accepting
    /// correlated records.
    pub fn drain(&self) -> Vec<LogGroup> {
        let mut flushed: Vec<OpenGroup> = {
            let mut groups = self.groups.lock();
            groups.closed = true;
            groups.open.drain().map(|(_, g)| g).collect()
        };
        flushed.sort_by_key(|g| g.opened);
        flushed
            .into_iter()
            .map(|g| g.group)
            .filter(|g| !g.is_empty())
            .collect()
    }

    /// Number of groups currently held open.
    pub fn pending(&self) -> usize {
        self.groups.lock().open.len()
    }
}
