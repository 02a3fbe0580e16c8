//! Application-facing entry point.
//!
//! [`TransportClient`] wires the pipeline together: producers call
//! [`emit`](TransportClient::emit), records are grouped by the correlator,
//! classified into a lane, batched by that lane's worker and delivered by the
//! dispatcher through the connection pool. Delivery failures never reach the
//! caller; they are retried, redirected or dropped and counted in
//! [`StatsSnapshot`].

mod worker;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Instant,
};

use crossbeam_channel::{Receiver, Sender, bounded};
use log::{info, warn};
use parking_lot::Mutex;

use crate::classifier::Lane;
use crate::config::{ClientConfig, SharedConfig};
use crate::correlator::Correlator;
use crate::dispatcher::Dispatcher;
use crate::error::{ConfigError, TransportError};
use crate::health::HealthChecker;
use crate::lanes::LaneBuffers;
use crate::log_record::{CorrelationData, LogRecord};
use crate::pool::{ConnectionPool, ConnectionStatus};
use crate::stats::{DeliveryStats, DropReason, StatsSnapshot};
use crate::transport::{Connector, TcpConnector};

struct Pipeline {
    correlator: Arc<Correlator>,
    lanes: Arc<LaneBuffers>,
    dispatcher: Arc<Dispatcher>,
    pool: Arc<ConnectionPool>,
    accepting: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    done_rx: Receiver<Lane>,
    sweeper: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
    health: Mutex<Option<HealthChecker>>,
}

pub struct TransportClient {
    config: SharedConfig,
    stats: Arc<DeliveryStats>,
    client_id: String,
    /// `None` when the configuration disables the client.
    pipeline: Option<Pipeline>,
}

impl TransportClient {
    /// Validate `config`, open the pool through `connector` and start the
    /// lane, sweeper and health-check threads.
    pub fn new(config: ClientConfig, connector: Arc<dyn Connector>) -> Result<Self, ConfigError> {
        config.validate()?;
        let config = config.into_shared();
        let stats = Arc::new(DeliveryStats::new(config.warn_interval));
        let client_id = client_id(&config.app_name);
        if !config.enabled {
            info!("femtotransport: client disabled by configuration");
            return Ok(Self {
                config,
                stats,
                client_id,
                pipeline: None,
            });
        }

        let pool = Arc::new(ConnectionPool::open(
            Arc::clone(&config),
            connector,
            Arc::clone(&stats),
            client_id.clone(),
        ));
        let (lanes, receivers) = LaneBuffers::new(Arc::clone(&config), Arc::clone(&stats));
        let lanes = Arc::new(lanes);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&config),
            Arc::clone(&pool),
            Arc::clone(&lanes),
            Arc::clone(&stats),
        ));

        let (done_tx, done_rx) = bounded(Lane::ALL.len());
        let workers = receivers
            .into_vec()
            .into_iter()
            .map(|(lane, rx)| {
                worker::spawn_lane_worker(
                    lane,
                    rx,
                    Arc::clone(&dispatcher),
                    &config,
                    done_tx.clone(),
                )
            })
            .collect();

        let correlator = Arc::new(Correlator::new(config.correlation_idle_window));
        let (sweep_tx, sweep_rx) = bounded::<()>(0);
        let sweeper = worker::spawn_sweeper(
            Arc::clone(&correlator),
            Arc::clone(&lanes),
            config.correlation_sweep_interval,
            sweep_rx,
        );
        let health = HealthChecker::spawn(Arc::clone(&pool));

        Ok(Self {
            config,
            stats,
            client_id,
            pipeline: Some(Pipeline {
                correlator,
                lanes,
                dispatcher,
                pool,
                accepting: AtomicBool::new(true),
                workers: Mutex::new(workers),
                done_rx,
                sweeper: Mutex::new(Some((sweep_tx, sweeper))),
                health: Mutex::new(Some(health)),
            }),
        })
    }

    /// Build a client speaking to `config.endpoint` over TCP, TLS or a Unix
    /// socket.
    pub fn connect(config: ClientConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let connector = TcpConnector::from_config(&config)?;
        Self::new(config, Arc::new(connector))
    }

    /// Submit a record. Never blocks on delivery and never fails; rejected
    /// records are counted.
    pub fn emit(&self, record: LogRecord) {
        let _ = self.try_emit(record);
    }

    /// Like [`emit`](Self::emit) but reports where the record went.
    ///
    /// Returns `Ok(None)` when the record was filtered out or is being held
    /// in an open correlation group.
    pub fn try_emit(&self, record: LogRecord) -> Result<Option<Lane>, TransportError> {
        let Some(pipeline) = &self.pipeline else {
            return Ok(None);
        };
        if !record.is_audit() && !record.level.at_least(self.config.level) {
            return Ok(None);
        }
        if !pipeline.accepting.load(Ordering::SeqCst) {
            self.stats.record_drop(DropReason::Closed, 1);
            return Err(TransportError::Closed);
        }
        // Shutdown may have drained the correlator since the check above.
        match pipeline.correlator.accept(record) {
            Ok(Some(group)) => pipeline.lanes.submit(group).map(Some),
            Ok(None) => Ok(None),
            Err(err) => {
                self.stats.record_drop(DropReason::Closed, 1);
                Err(err)
            }
        }
    }

    /// Start collecting records carrying `correlation.correlation_id` into
    /// one group. Returns `false` if the id is already open or the client is
    /// shutting down.
    pub fn open_correlation(&self, correlation: CorrelationData) -> bool {
        match &self.pipeline {
            Some(pipeline) if pipeline.accepting.load(Ordering::SeqCst) => {
                pipeline.correlator.open(correlation)
            }
            _ => false,
        }
    }

    /// Flush the group for `correlation_id` now instead of waiting for it to
    /// go idle.
    pub fn close_correlation(&self, correlation_id: &str) -> Result<Option<Lane>, TransportError> {
        let Some(pipeline) = &self.pipeline else {
            return Ok(None);
        };
        match pipeline.correlator.close(correlation_id) {
            Some(group) => pipeline.lanes.submit(group).map(Some),
            None => Ok(None),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn connection_status(&self) -> Vec<ConnectionStatus> {
        self.pipeline
            .as_ref()
            .map(|pipeline| pipeline.pool.status())
            .unwrap_or_default()
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.pipeline.is_some()
    }

    /// Stop accepting records, flush what is buffered and close the pool.
    ///
    /// Flushing is bounded by `connection_shutdown_timeout`; whatever is
    /// still pending afterwards is dropped and counted. Calling this more
    /// than once is harmless.
    pub fn shutdown(&self) {
        let Some(pipeline) = &self.pipeline else {
            return;
        };
        if !pipeline.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        let timeout = self.config.connection_shutdown_timeout;
        let deadline = Instant::now() + timeout;

        if let Some((sweep_tx, handle)) = pipeline.sweeper.lock().take() {
            drop(sweep_tx);
            if handle.join().is_err() {
                warn!("femtotransport: correlation sweeper panicked");
            }
        }
        for group in pipeline.correlator.drain() {
            let _ = pipeline.lanes.submit(group);
        }
        pipeline.lanes.close();

        let expected = pipeline.workers.lock().len();
        let mut finished = wait_for_workers(&pipeline.done_rx, expected, deadline);
        if finished < expected {
            warn!("femtotransport: lanes not drained within {timeout:?}; dropping the remainder");
            pipeline.dispatcher.abandon();
            let grace = Instant::now() + self.config.send_timeout;
            finished += wait_for_workers(&pipeline.done_rx, expected - finished, grace);
        }

        if let Some(mut health) = pipeline.health.lock().take() {
            health.stop();
        }
        let workers = std::mem::take(&mut *pipeline.workers.lock());
        if finished < expected {
            warn!("femtotransport: lane workers did not shut down in time");
        } else {
            for handle in workers {
                if handle.join().is_err() {
                    warn!("femtotransport: lane worker panicked");
                }
            }
        }
        pipeline.pool.close_all();
        self.stats.flush_warnings();
    }
}

fn wait_for_workers(done_rx: &Receiver<Lane>, expected: usize, deadline: Instant) -> usize {
    let mut finished = 0;
    while finished < expected && done_rx.recv_deadline(deadline).is_ok() {
        finished += 1;
    }
    finished
}

fn client_id(app_name: &str) -> String {
    let prefix = if app_name.is_empty() {
        "femtotransport"
    } else {
        app_name
    };
    format!("{prefix}-{:08x}", rand::random::<u32>())
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportClient")
            .field("client_id", &self.client_id)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests;
