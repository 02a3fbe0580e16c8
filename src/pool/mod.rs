//! Connection pool manager.
//!
//! The pool owns a fixed number of slots per role: normal, hi-pri and
//! backup. Dispatchers ask for a connection by role; when a role has no
//! selectable primary, a backup is promoted to serve it until a primary
//! becomes selectable again. Each slot carries its own health state behind a
//! per-connection lock shared by the dispatchers and the health checker.

mod backoff;
mod connection;

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Instant,
};

use log::{info, warn};
use parking_lot::Mutex;

pub use backoff::{ResetBackoff, ResetPolicy};
pub use connection::{ConnectionStatus, HealthState, PooledConnection};

use crate::classifier::Lane;
use crate::config::{ClientConfig, DeliveryMethod, SharedConfig};
use crate::error::TransportError;
use crate::stats::DeliveryStats;
use crate::transport::{Connector, OpenStreamRequest};

/// Role a pooled connection was configured for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PoolRole {
    Normal,
    HiPri,
    Backup,
}

impl PoolRole {
    /// Pool serving a lane. Overflow traffic shares the normal pool.
    pub fn for_lane(lane: Lane) -> Self {
        match lane {
            Lane::HiPri => PoolRole::HiPri,
            Lane::Normal | Lane::Overflow => PoolRole::Normal,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PoolRole::Normal => "normal",
            PoolRole::HiPri => "hi-pri",
            PoolRole::Backup => "backup",
        }
    }

    fn cursor(self) -> usize {
        match self {
            PoolRole::HiPri => 1,
            PoolRole::Normal | PoolRole::Backup => 0,
        }
    }
}

impl fmt::Display for PoolRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct ConnectionPool {
    config: SharedConfig,
    connector: Arc<dyn Connector>,
    stats: Arc<DeliveryStats>,
    client_id: String,
    normal: Vec<Arc<PooledConnection>>,
    hipri: Vec<Arc<PooledConnection>>,
    backups: Vec<Arc<PooledConnection>>,
    cursors: [AtomicUsize; 2],
    /// Serialises promotion decisions so a backup never serves two roles.
    assignment: Mutex<()>,
}

impl ConnectionPool {
    /// Create every slot and try to open its stream. Slots that fail to open
    /// start unhealthy with a reset scheduled.
    pub fn open(
        config: SharedConfig,
        connector: Arc<dyn Connector>,
        stats: Arc<DeliveryStats>,
        client_id: impl Into<String>,
    ) -> Self {
        let policy = ResetPolicy::new(
            config.health_check_interval,
            config.connection_reset_interval,
        );
        let slots = |role: PoolRole, count: usize| -> Vec<Arc<PooledConnection>> {
            (0..count)
                .map(|slot| Arc::new(PooledConnection::new(role, slot, false, policy)))
                .collect()
        };
        let backup_count =
            config.number_of_backup_connections + config.number_of_hipri_backup_connections;
        let backups = (0..backup_count)
            .map(|slot| {
                let prefers_hipri = slot < config.number_of_hipri_backup_connections;
                Arc::new(PooledConnection::new(PoolRole::Backup, slot, prefers_hipri, policy))
            })
            .collect();
        let pool = Self {
            normal: slots(PoolRole::Normal, config.number_of_connections),
            hipri: slots(PoolRole::HiPri, config.number_of_hipri_connections),
            backups,
            config,
            connector,
            stats,
            client_id: client_id.into(),
            cursors: [AtomicUsize::new(0), AtomicUsize::new(0)],
            assignment: Mutex::new(()),
        };
        let now = Instant::now();
        for conn in pool.connections() {
            pool.reopen(conn, now, true);
        }
        pool
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn stats(&self) -> &DeliveryStats {
        &self.stats
    }

    /// Every slot: normal, hi-pri, then backups.
    pub fn connections(&self) -> impl Iterator<Item = &Arc<PooledConnection>> {
        self.normal
            .iter()
            .chain(self.hipri.iter())
            .chain(self.backups.iter())
    }

    pub fn primaries(&self, role: PoolRole) -> &[Arc<PooledConnection>] {
        match role {
            PoolRole::Normal => &self.normal,
            PoolRole::HiPri => &self.hipri,
            PoolRole::Backup => &self.backups,
        }
    }

    pub fn backups(&self) -> &[Arc<PooledConnection>] {
        &self.backups
    }

    pub fn status(&self) -> Vec<ConnectionStatus> {
        self.connections().map(|conn| conn.status()).collect()
    }

    /// Pick a connection for `role`, promoting a backup if no primary is
    /// selectable.
    pub fn select(&self, role: PoolRole) -> Result<Arc<PooledConnection>, TransportError> {
        let now = Instant::now();
        let primaries: Vec<&Arc<PooledConnection>> = self
            .primaries(role)
            .iter()
            .filter(|conn| conn.is_selectable())
            .collect();
        let chosen = if primaries.is_empty() {
            self.promoted(role)
        } else {
            self.release_promotions(role);
            self.pick(role, &primaries)
        };
        let conn = chosen.ok_or(TransportError::NoHealthyConnection(role))?;
        conn.mark_used(now);
        Ok(conn)
    }

    fn pick(&self, role: PoolRole, candidates: &[&Arc<PooledConnection>]) -> Option<Arc<PooledConnection>> {
        if candidates.is_empty() {
            return None;
        }
        match self.config.delivery_method {
            DeliveryMethod::ClientSpecified => candidates.first().map(|conn| Arc::clone(conn)),
            DeliveryMethod::RoundRobin => {
                let start = self.cursors[role.cursor()].fetch_add(1, Ordering::Relaxed)
                    % candidates.len();
                candidates
                    .iter()
                    .cycle()
                    .skip(start)
                    .take(candidates.len())
                    .min_by_key(|conn| conn.last_used())
                    .map(|conn| Arc::clone(conn))
            }
        }
    }

    /// Backup serving `role`, promoting one if needed. Hi-pri may take over
    /// a backup serving the normal role when no other is free.
    fn promoted(&self, role: PoolRole) -> Option<Arc<PooledConnection>> {
        if role == PoolRole::Backup {
            return None;
        }
        let _guard = self.assignment.lock();
        let serving: Vec<&Arc<PooledConnection>> = self
            .backups
            .iter()
            .filter(|conn| conn.serving() == Some(role) && conn.is_selectable())
            .collect();
        if !serving.is_empty() {
            return self.pick(role, &serving);
        }

        let wants_hipri = role == PoolRole::HiPri;
        let free = self
            .backups
            .iter()
            .filter(|conn| conn.serving().is_none() && conn.is_selectable());
        let candidate = free
            .clone()
            .find(|conn| conn.prefers_hipri() == wants_hipri)
            .or_else(|| free.clone().next());
        if let Some(conn) = candidate {
            conn.set_serving(Some(role));
            info!(
                "femtotransport: promoted backup connection {} to serve the {role} pool",
                conn.slot()
            );
            return Some(Arc::clone(conn));
        }

        if wants_hipri {
            let taken = self.backups.iter().find(|conn| {
                conn.serving() == Some(PoolRole::Normal) && conn.is_selectable()
            })?;
            taken.set_serving(Some(PoolRole::HiPri));
            warn!(
                "femtotransport: backup connection {} reassigned from the normal pool to the hi-pri pool",
                taken.slot()
            );
            return Some(Arc::clone(taken));
        }
        None
    }

    /// Return backups serving `role` to the free list.
    fn release_promotions(&self, role: PoolRole) {
        if !self.backups.iter().any(|conn| conn.serving() == Some(role)) {
            return;
        }
        let _guard = self.assignment.lock();
        for conn in &self.backups {
            if conn.serving() == Some(role) {
                conn.set_serving(None);
                info!(
                    "femtotransport: demoted backup connection {} from the {role} pool",
                    conn.slot()
                );
            }
        }
    }

    pub fn report_success(&self, conn: &PooledConnection) -> HealthState {
        conn.record_success()
    }

    /// Count a failed send or probe against `conn`.
    pub fn report_failure(&self, conn: &PooledConnection, now: Instant) -> HealthState {
        let before = conn.state();
        let state = conn.record_failure(self.config.health_check_failure_threshold, now);
        if state == HealthState::Unhealthy && before != HealthState::Unhealthy {
            warn!(
                "femtotransport: {} connection {} marked unhealthy after {} consecutive failures",
                conn.role(),
                conn.slot(),
                self.config.health_check_failure_threshold
            );
            if conn.serving().is_some() {
                let _guard = self.assignment.lock();
                conn.set_serving(None);
            }
        }
        state
    }

    /// Reset unhealthy slots whose backoff has elapsed, rotate connections
    /// older than the reset interval and demote backups no longer needed.
    pub fn maintain(&self, now: Instant) {
        for conn in self.connections() {
            if conn.reset_due(now) {
                self.reset(conn, now);
            } else if conn.rotation_due(now, self.config.connection_reset_interval) {
                self.rotate(conn, now);
            }
        }
        for role in [PoolRole::Normal, PoolRole::HiPri] {
            if self.primaries(role).iter().any(|conn| conn.is_selectable()) {
                self.release_promotions(role);
            }
        }
    }

    /// Close and reopen `conn`. A successful reset leaves the connection
    /// suspect until a send or probe succeeds on it.
    pub fn reset(&self, conn: &PooledConnection, now: Instant) -> bool {
        conn.close();
        let reopened = self.reopen(conn, now, false);
        if reopened {
            self.stats.record_reset();
            info!(
                "femtotransport: reset {} connection {}",
                conn.role(),
                conn.slot()
            );
        }
        reopened
    }

    fn rotate(&self, conn: &PooledConnection, now: Instant) {
        let confirmed = conn.state() == HealthState::Healthy;
        match self.connector.open_stream(&self.request(conn)) {
            Ok(stream) => {
                conn.install(stream, now, confirmed);
                self.stats.record_reset();
            }
            Err(err) => {
                conn.defer_rotation(now);
                warn!(
                    "femtotransport: could not rotate {} connection {}: {err}",
                    conn.role(),
                    conn.slot()
                );
            }
        }
    }

    fn reopen(&self, conn: &PooledConnection, now: Instant, confirmed: bool) -> bool {
        match self.connector.open_stream(&self.request(conn)) {
            Ok(stream) => {
                conn.install(stream, now, confirmed);
                true
            }
            Err(err) => {
                let delay = conn.schedule_reset(now);
                warn!(
                    "femtotransport: failed to open {} connection {}: {err}; retrying in {delay:?}",
                    conn.role(),
                    conn.slot()
                );
                false
            }
        }
    }

    fn request(&self, conn: &PooledConnection) -> OpenStreamRequest {
        OpenStreamRequest {
            client_id: self.client_id.clone(),
            role: conn.role(),
            slot: conn.slot(),
            hipri: conn.role() == PoolRole::HiPri
                || (conn.role() == PoolRole::Backup && conn.prefers_hipri()),
        }
    }

    /// Close every stream. Slots stay unhealthy afterwards.
    pub fn close_all(&self) {
        for conn in self.connections() {
            conn.close();
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("client_id", &self.client_id)
            .field("normal", &self.normal)
            .field("hipri", &self.hipri)
            .field("backups", &self.backups)
            .finish()
    }
}
