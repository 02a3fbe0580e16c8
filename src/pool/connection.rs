//! A single pooled connection and its health state machine.

use std::{
    fmt, io,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::error::TransportError;
use crate::package::TransportPackage;
use crate::transport::{PackageStream, StreamInfo};

use super::PoolRole;
use super::backoff::{ResetBackoff, ResetPolicy};

/// Health of a pooled connection.
///
/// `Healthy -> Suspect -> Unhealthy -> (reset) -> Suspect -> Healthy`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    /// At least one recent failure, or freshly reset and not yet confirmed.
    Suspect,
    /// Excluded from selection until reset.
    Unhealthy,
}

impl HealthState {
    pub fn is_selectable(self) -> bool {
        self != HealthState::Unhealthy
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthState::Healthy => "healthy",
            HealthState::Suspect => "suspect",
            HealthState::Unhealthy => "unhealthy",
        })
    }
}

struct Health {
    state: HealthState,
    failures: u32,
    last_used: Option<Instant>,
    opened_at: Option<Instant>,
    reset_at: Option<Instant>,
    backoff: ResetBackoff,
    /// Role a promoted backup is currently serving.
    serving: Option<PoolRole>,
}

/// Point-in-time view of a connection, for stats and tests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub role: PoolRole,
    pub slot: usize,
    pub state: HealthState,
    pub failures: u32,
    pub serving: Option<PoolRole>,
    pub connection_id: Option<String>,
}

/// One slot of the pool. The stream and the health record have separate
/// locks so selection never waits behind an in-flight send.
pub struct PooledConnection {
    role: PoolRole,
    slot: usize,
    /// Backups at the front of the backup list prefer hi-pri duty.
    prefers_hipri: bool,
    stream: Mutex<Option<Box<dyn PackageStream>>>,
    info: Mutex<Option<StreamInfo>>,
    health: Mutex<Health>,
    next_id: AtomicU64,
}

impl PooledConnection {
    pub(crate) fn new(role: PoolRole, slot: usize, prefers_hipri: bool, policy: ResetPolicy) -> Self {
        Self {
            role,
            slot,
            prefers_hipri,
            stream: Mutex::new(None),
            info: Mutex::new(None),
            health: Mutex::new(Health {
                state: HealthState::Unhealthy,
                failures: 0,
                last_used: None,
                opened_at: None,
                reset_at: None,
                backoff: ResetBackoff::new(policy),
                serving: None,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn role(&self) -> PoolRole {
        self.role
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub(crate) fn prefers_hipri(&self) -> bool {
        self.prefers_hipri
    }

    pub fn state(&self) -> HealthState {
        self.health.lock().state
    }

    pub fn is_selectable(&self) -> bool {
        self.state().is_selectable()
    }

    pub fn connection_id(&self) -> Option<String> {
        self.info.lock().as_ref().map(|info| info.connection_id.clone())
    }

    pub fn status(&self) -> ConnectionStatus {
        let health = self.health.lock();
        ConnectionStatus {
            role: self.role,
            slot: self.slot,
            state: health.state,
            failures: health.failures,
            serving: health.serving,
            connection_id: self.connection_id(),
        }
    }

    /// Send `package` on this connection, stamping it with the next
    /// sequence id of the stream.
    pub fn send(&self, package: &mut TransportPackage) -> Result<(), TransportError> {
        let mut guard = self.stream.lock();
        let Some(stream) = guard.as_mut() else {
            return Err(TransportError::SendFailed(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection is not open",
            )));
        };
        package.id = self.next_id.fetch_add(1, Ordering::Relaxed);
        stream.send(package).map_err(TransportError::SendFailed)
    }

    /// Install a freshly opened stream, closing any previous one.
    pub(crate) fn install(&self, stream: Box<dyn PackageStream>, now: Instant, confirmed: bool) {
        let info = stream.info().clone();
        let previous = self.stream.lock().replace(stream);
        *self.info.lock() = Some(info);
        if let Some(mut previous) = previous {
            previous.close();
        }
        let mut health = self.health.lock();
        health.opened_at = Some(now);
        health.reset_at = None;
        health.failures = 0;
        health.backoff.record_success();
        health.state = if confirmed {
            HealthState::Healthy
        } else {
            HealthState::Suspect
        };
    }

    /// Close the stream, leaving the slot unhealthy.
    pub(crate) fn close(&self) {
        if let Some(mut stream) = self.stream.lock().take() {
            stream.close();
        }
        let mut health = self.health.lock();
        health.state = HealthState::Unhealthy;
        health.reset_at = None;
    }

    /// A send or probe succeeded. Unhealthy connections stay unhealthy until
    /// they are reset.
    pub fn record_success(&self) -> HealthState {
        let mut health = self.health.lock();
        if health.state != HealthState::Unhealthy {
            health.failures = 0;
            health.state = HealthState::Healthy;
        }
        health.state
    }

    /// A send or probe failed. Reaching `threshold` consecutive failures
    /// marks the connection unhealthy and schedules its reset.
    pub fn record_failure(&self, threshold: u32, now: Instant) -> HealthState {
        let mut health = self.health.lock();
        if health.state == HealthState::Unhealthy {
            return health.state;
        }
        health.failures = health.failures.saturating_add(1);
        if health.failures >= threshold {
            health.state = HealthState::Unhealthy;
            let delay = health.backoff.next_delay();
            health.reset_at = Some(now + delay);
        } else {
            health.state = HealthState::Suspect;
        }
        health.state
    }

    /// Mark a slot that could not be opened and schedule another attempt.
    pub(crate) fn schedule_reset(&self, now: Instant) -> Duration {
        let mut health = self.health.lock();
        health.state = HealthState::Unhealthy;
        let delay = health.backoff.next_delay();
        health.reset_at = Some(now + delay);
        delay
    }

    pub(crate) fn reset_due(&self, now: Instant) -> bool {
        let health = self.health.lock();
        health.state == HealthState::Unhealthy && health.reset_at.is_some_and(|at| now >= at)
    }

    pub(crate) fn rotation_due(&self, now: Instant, interval: Duration) -> bool {
        let health = self.health.lock();
        health.state.is_selectable()
            && health
                .opened_at
                .is_some_and(|opened| now.duration_since(opened) >= interval)
    }

    /// Postpone the next rotation after a failed attempt to reopen.
    pub(crate) fn defer_rotation(&self, now: Instant) {
        self.health.lock().opened_at = Some(now);
    }

    pub(crate) fn last_used(&self) -> Option<Instant> {
        self.health.lock().last_used
    }

    pub(crate) fn mark_used(&self, now: Instant) {
        self.health.lock().last_used = Some(now);
    }

    pub(crate) fn serving(&self) -> Option<PoolRole> {
        self.health.lock().serving
    }

    pub(crate) fn set_serving(&self, role: Option<PoolRole>) {
        self.health.lock().serving = role;
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("role", &self.role)
            .field("slot", &self.slot)
            .field("state", &self.state())
            .finish()
    }
}
