//! Client-side log transport.
//!
//! Records emitted by an application are grouped by correlation id,
//! classified into a normal, hi-pri or overflow lane, batched per lane and
//! delivered over a pool of health-checked streaming connections. Producers
//! never block on delivery: failures are retried, redirected or dropped and
//! counted.
//!
//! ```no_run
//! use femtotransport::{ClientConfig, Level, LogRecord, TransportClient};
//!
//! let config = ClientConfig::from_path("transport.json")?;
//! let client = TransportClient::connect(config)?;
//! client.emit(LogRecord::new(Level::Warn, "disk almost full"));
//! client.shutdown();
//! # Ok::<(), femtotransport::ConfigError>(())
//! ```

pub mod batcher;
pub mod classifier;
mod client;
pub mod config;
pub mod correlator;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod lanes;
pub mod level;
pub mod log_record;
pub mod package;
pub mod pool;
pub mod stats;
#[cfg(any(test, feature = "test-util"))]
pub mod test_utils;
pub mod transport;

pub use client::TransportClient;
pub use classifier::Lane;
pub use config::{ClientConfig, DeliveryMethod, HiPriOverflowPolicy, RETRY_COUNT, SharedConfig};
pub use error::{ConfigError, TransportError};
pub use level::{Level, LogType, ParseLevelError};
pub use log_record::{ContextValue, CorrelationData, ErrorInfo, LogGroup, LogRecord};
pub use package::{PackageKind, TransportPackage};
pub use pool::{ConnectionStatus, HealthState, PoolRole};
pub use stats::{DropReason, StatsSnapshot};
pub use transport::{Connector, OpenStreamRequest, PackageStream, StreamInfo, TcpConnector};
