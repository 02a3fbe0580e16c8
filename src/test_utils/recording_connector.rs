//! An in-memory [`Connector`] that records every package it is handed.
//!
//! Individual slots can be told to refuse opening, fail data sends or fail
//! health checks, which lets pool and pipeline tests drive the health state
//! machine without sockets.

use std::{
    collections::HashSet,
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::Deserialize;

use crate::package::{PackageKind, TransportPackage};
use crate::pool::PoolRole;
use crate::transport::{Connector, OpenStreamRequest, PackageStream, StreamInfo};

/// Which operations a slot should fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Fault {
    Open,
    Send,
    HealthCheck,
}

/// A package accepted by a recording stream.
#[derive(Clone, Debug)]
pub struct SentPackage {
    pub role: PoolRole,
    pub slot: usize,
    pub connection_id: String,
    pub id: u64,
    pub kind: PackageKind,
    /// Messages of the records in the group, in order. Empty for probes.
    pub messages: Vec<String>,
    pub correlation_id: Option<String>,
    pub overflow: bool,
}

/// One call to [`PackageStream::send`], successful or not.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attempt {
    pub role: PoolRole,
    pub slot: usize,
    pub kind: PackageKind,
    pub ok: bool,
}

#[derive(Default)]
struct Shared {
    sent: Mutex<Vec<SentPackage>>,
    attempts: Mutex<Vec<Attempt>>,
    faults: Mutex<HashSet<(PoolRole, usize, Fault)>>,
    requests: Mutex<Vec<OpenStreamRequest>>,
    opened: AtomicUsize,
    streams: AtomicU64,
    all_down: AtomicBool,
    send_delay: Mutex<Duration>,
}

#[derive(Clone, Default)]
pub struct RecordingConnector {
    shared: Arc<Shared>,
}

impl RecordingConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject(&self, role: PoolRole, slot: usize, fault: Fault) {
        self.shared.faults.lock().insert((role, slot, fault));
    }

    /// Remove every fault injected for the slot.
    pub fn heal(&self, role: PoolRole, slot: usize) {
        self.shared
            .faults
            .lock()
            .retain(|(r, s, _)| !(*r == role && *s == slot));
    }

    /// Fail every open and send while `down` is set.
    pub fn set_all_down(&self, down: bool) {
        self.shared.all_down.store(down, Ordering::SeqCst);
    }

    /// Sleep for `delay` inside every send.
    pub fn set_send_delay(&self, delay: Duration) {
        *self.shared.send_delay.lock() = delay;
    }

    pub fn sent(&self) -> Vec<SentPackage> {
        self.shared.sent.lock().clone()
    }

    /// Accepted log packages, excluding health probes.
    pub fn logs(&self) -> Vec<SentPackage> {
        self.sent()
            .into_iter()
            .filter(|p| p.kind != PackageKind::HealthCheck)
            .collect()
    }

    /// Messages of every accepted log package, flattened in send order.
    pub fn messages(&self) -> Vec<String> {
        self.logs().into_iter().flat_map(|p| p.messages).collect()
    }

    pub fn attempts(&self) -> Vec<Attempt> {
        self.shared.attempts.lock().clone()
    }

    /// Every successful open request, in order.
    pub fn requests(&self) -> Vec<OpenStreamRequest> {
        self.shared.requests.lock().clone()
    }

    /// Number of streams opened so far.
    pub fn opened(&self) -> usize {
        self.shared.opened.load(Ordering::SeqCst)
    }

    /// Poll until `predicate` holds or `timeout` elapses.
    pub fn wait_for(&self, timeout: Duration, predicate: impl Fn(&Self) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if predicate(self) {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        predicate(self)
    }

    fn has_fault(&self, role: PoolRole, slot: usize, fault: Fault) -> bool {
        self.shared.all_down.load(Ordering::SeqCst)
            || self.shared.faults.lock().contains(&(role, slot, fault))
    }
}

impl Connector for RecordingConnector {
    fn open_stream(&self, request: &OpenStreamRequest) -> io::Result<Box<dyn PackageStream>> {
        if self.has_fault(request.role, request.slot, Fault::Open) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "injected open failure",
            ));
        }
        self.shared.requests.lock().push(request.clone());
        self.shared.opened.fetch_add(1, Ordering::SeqCst);
        let serial = self.shared.streams.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingStream {
            connector: self.clone(),
            role: request.role,
            slot: request.slot,
            info: StreamInfo {
                connection_id: format!("{}-{}-{}-{serial}", request.client_id, request.role, request.slot),
                streaming_endpoint: "memory".into(),
            },
        }))
    }
}

struct RecordingStream {
    connector: RecordingConnector,
    role: PoolRole,
    slot: usize,
    info: StreamInfo,
}

#[derive(Deserialize)]
struct DecodedRecord {
    message: String,
}

#[derive(Deserialize)]
struct DecodedCorrelation {
    correlation_id: String,
}

#[derive(Deserialize)]
struct DecodedLogs {
    overflow: bool,
    #[serde(default)]
    correlation: Option<DecodedCorrelation>,
    logs: Vec<DecodedRecord>,
}

impl PackageStream for RecordingStream {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn send(&mut self, package: &TransportPackage) -> io::Result<()> {
        let delay = *self.connector.shared.send_delay.lock();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        let fault = match package.kind {
            PackageKind::HealthCheck => Fault::HealthCheck,
            PackageKind::Log | PackageKind::HiPriLog => Fault::Send,
        };
        let ok = !self.connector.has_fault(self.role, self.slot, fault);
        self.connector.shared.attempts.lock().push(Attempt {
            role: self.role,
            slot: self.slot,
            kind: package.kind,
            ok,
        });
        if !ok {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "injected send failure"));
        }
        let (messages, correlation_id, overflow) = match package.kind {
            PackageKind::HealthCheck => (Vec::new(), None, false),
            PackageKind::Log | PackageKind::HiPriLog => {
                let decoded: DecodedLogs = rmp_serde::from_slice(&package.payload)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
                (
                    decoded.logs.into_iter().map(|r| r.message).collect(),
                    decoded.correlation.map(|c| c.correlation_id),
                    decoded.overflow,
                )
            }
        };
        self.connector.shared.sent.lock().push(SentPackage {
            role: self.role,
            slot: self.slot,
            connection_id: self.info.connection_id.clone(),
            id: package.id,
            kind: package.kind,
            messages,
            correlation_id,
            overflow,
        });
        Ok(())
    }
}
