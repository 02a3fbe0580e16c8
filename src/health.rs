//! Out-of-band health checking and pool maintenance.
//!
//! Every pooled connection gets its own probe thread ticking at
//! `health_check_interval`, so a saturated dispatcher never delays a probe
//! past the send currently holding the stream. A separate maintenance thread
//! resets unhealthy connections once their backoff elapses, rotates old ones
//! and demotes backups that are no longer needed.

use std::{
    io,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, bounded, select, tick};
use log::{debug, warn};

use crate::error::TransportError;
use crate::package::TransportPackage;
use crate::pool::{ConnectionPool, HealthState, PooledConnection};

const MAX_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

/// Send one probe on `conn` and feed the outcome into its health state.
///
/// Unhealthy connections are not probed; they recover only through a reset.
pub fn check_connection(
    pool: &ConnectionPool,
    conn: &PooledConnection,
) -> Result<HealthState, TransportError> {
    if !conn.is_selectable() {
        return Ok(conn.state());
    }
    let mut probe = TransportPackage::health_check(pool.config())?;
    match conn.send(&mut probe) {
        Ok(()) => Ok(pool.report_success(conn)),
        Err(err) => {
            pool.stats().record_health_check_failure();
            let state = pool.report_failure(conn, Instant::now());
            debug!(
                "femtotransport: health check failed on {} connection {} ({state}): {err}",
                conn.role(),
                conn.slot()
            );
            Err(probe_error(err, conn))
        }
    }
}

fn probe_error(err: TransportError, conn: &PooledConnection) -> TransportError {
    match err {
        TransportError::SendFailed(io)
            if matches!(io.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) =>
        {
            TransportError::HealthCheckTimeout(
                conn.connection_id()
                    .unwrap_or_else(|| format!("{}-{}", conn.role(), conn.slot())),
            )
        }
        other => other,
    }
}

/// Probe and maintenance threads for one pool.
pub struct HealthChecker {
    shutdown_tx: Option<Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl HealthChecker {
    pub fn spawn(pool: Arc<ConnectionPool>) -> Self {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let interval = pool.config().health_check_interval;
        let mut handles: Vec<JoinHandle<()>> = pool
            .connections()
            .map(|conn| {
                let pool = Arc::clone(&pool);
                let conn = Arc::clone(conn);
                let shutdown_rx = shutdown_rx.clone();
                thread::spawn(move || probe_loop(&pool, &conn, interval, &shutdown_rx))
            })
            .collect();
        let maintenance_interval = interval.min(MAX_MAINTENANCE_INTERVAL);
        handles.push(thread::spawn(move || {
            maintenance_loop(&pool, maintenance_interval, &shutdown_rx)
        }));
        Self {
            shutdown_tx: Some(shutdown_tx),
            handles,
        }
    }

    /// Stop every thread and wait for them to exit.
    pub fn stop(&mut self) {
        // Dropping the sender disconnects every receiver at once.
        self.shutdown_tx.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("femtotransport: health check thread panicked");
            }
        }
    }
}

impl Drop for HealthChecker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn probe_loop(
    pool: &ConnectionPool,
    conn: &PooledConnection,
    interval: Duration,
    shutdown_rx: &Receiver<()>,
) {
    let ticker = tick(interval);
    loop {
        select! {
            recv(ticker) -> _ => {
                let _ = check_connection(pool, conn);
            }
            recv(shutdown_rx) -> _ => break,
        }
    }
}

fn maintenance_loop(pool: &ConnectionPool, interval: Duration, shutdown_rx: &Receiver<()>) {
    let ticker = tick(interval);
    loop {
        select! {
            recv(ticker) -> at => pool.maintain(at.unwrap_or_else(|_| Instant::now())),
            recv(shutdown_rx) -> _ => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::pool::PoolRole;
    use crate::stats::DeliveryStats;
    use crate::test_utils::{Fault, RecordingConnector};

    fn pool(connector: &RecordingConnector, threshold: u32) -> ConnectionPool {
        let config = ClientConfig {
            health_check_failure_threshold: threshold,
            health_check_interval: Duration::from_millis(10),
            ..ClientConfig::default()
        };
        ConnectionPool::open(
            config.into_shared(),
            Arc::new(connector.clone()),
            Arc::new(DeliveryStats::default()),
            "health",
        )
    }

    #[test]
    fn unhealthy_exactly_at_threshold_and_healthy_only_after_reset_and_probe() {
        let connector = RecordingConnector::new();
        let pool = pool(&connector, 2);
        let conn = Arc::clone(&pool.primaries(PoolRole::Normal)[0]);
        connector.inject(PoolRole::Normal, 0, Fault::HealthCheck);

        assert!(check_connection(&pool, &conn).is_err());
        assert_eq!(conn.state(), HealthState::Suspect);
        assert!(check_connection(&pool, &conn).is_err());
        assert_eq!(conn.state(), HealthState::Unhealthy);

        connector.heal(PoolRole::Normal, 0);
        assert_eq!(check_connection(&pool, &conn).unwrap(), HealthState::Unhealthy);

        assert!(pool.reset(&conn, Instant::now()));
        assert_eq!(conn.state(), HealthState::Suspect);
        assert_eq!(check_connection(&pool, &conn).unwrap(), HealthState::Healthy);
        assert_eq!(pool.stats().snapshot().health_checks_failed, 2);
    }

    #[test]
    fn successful_probe_clears_failures() {
        let connector = RecordingConnector::new();
        let pool = pool(&connector, 3);
        let conn = Arc::clone(&pool.primaries(PoolRole::HiPri)[0]);
        connector.inject(PoolRole::HiPri, 0, Fault::HealthCheck);
        let _ = check_connection(&pool, &conn);
        let _ = check_connection(&pool, &conn);
        connector.heal(PoolRole::HiPri, 0);
        check_connection(&pool, &conn).unwrap();
        assert_eq!(conn.status().failures, 0);
        assert_eq!(conn.state(), HealthState::Healthy);
    }

    #[test]
    fn timed_out_probe_is_reported_as_timeout() {
        let err = TransportError::SendFailed(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        let connector = RecordingConnector::new();
        let pool = pool(&connector, 3);
        let conn = &pool.primaries(PoolRole::Normal)[0];
        assert!(matches!(
            probe_error(err, conn),
            TransportError::HealthCheckTimeout(id) if id.starts_with("health-normal-0")
        ));
    }

    #[test]
    fn checker_threads_probe_every_connection_and_stop() {
        let connector = RecordingConnector::new();
        let pool = Arc::new(pool(&connector, 3));
        let mut checker = HealthChecker::spawn(Arc::clone(&pool));
        let probed_all = connector.wait_for(Duration::from_secs(2), |c| {
            let probes: std::collections::HashSet<_> = c
                .sent()
                .into_iter()
                .filter(|p| p.kind == crate::package::PackageKind::HealthCheck)
                .map(|p| (p.role, p.slot))
                .collect();
            probes.len() == pool.connections().count()
        });
        checker.stop();
        assert!(probed_all);
    }
}
