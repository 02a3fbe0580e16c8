//! Transport packages and their MessagePack payloads.
//!
//! A [`TransportPackage`] is created by the dispatcher just before the first
//! send attempt. Its payload is encoded once; the sequence id is assigned by
//! the connection stream on every attempt, so retries on another connection
//! stay monotonic for that stream.

use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use rmp_serde::Serializer;
use serde::Serialize;

use crate::classifier::Lane;
use crate::config::{ClientConfig, RETRY_COUNT};
use crate::error::TransportError;
use crate::log_record::{ContextValue, CorrelationData, ErrorInfo, LogGroup, LogRecord};

/// Package type carried in the frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PackageKind {
    Log,
    HiPriLog,
    HealthCheck,
}

impl PackageKind {
    pub const fn code(self) -> u8 {
        match self {
            PackageKind::Log => 0,
            PackageKind::HiPriLog => 1,
            PackageKind::HealthCheck => 2,
        }
    }

    pub fn for_lane(lane: Lane) -> Self {
        match lane {
            Lane::HiPri => PackageKind::HiPriLog,
            Lane::Normal | Lane::Overflow => PackageKind::Log,
        }
    }
}

/// Domain object a package was built from.
#[derive(Debug)]
pub enum PackageData {
    Logs { group: LogGroup, lane: Lane },
    HealthCheck,
}

/// Outcome of recording a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Another attempt is permitted.
    Retry,
    /// The package reached [`RETRY_COUNT`] failed attempts.
    Exhausted,
}

#[derive(Debug)]
pub struct TransportPackage {
    /// Sequence id assigned by the stream the package was last sent on.
    pub id: u64,
    pub kind: PackageKind,
    pub data: PackageData,
    pub payload: Vec<u8>,
    retry_count: u8,
}

impl TransportPackage {
    /// Build a log package for `group` travelling through `lane`.
    pub fn for_group(
        group: LogGroup,
        lane: Lane,
        config: &ClientConfig,
    ) -> Result<Self, TransportError> {
        let payload = encode(&WireLogs::new(&group, lane, config))?;
        Ok(Self {
            id: 0,
            kind: PackageKind::for_lane(lane),
            data: PackageData::Logs { group, lane },
            payload,
            retry_count: 0,
        })
    }

    /// Build a health-check probe.
    pub fn health_check(config: &ClientConfig) -> Result<Self, TransportError> {
        let payload = encode(&WireHealthCheck {
            app_name: &config.app_name,
            sent_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        })?;
        Ok(Self {
            id: 0,
            kind: PackageKind::HealthCheck,
            data: PackageData::HealthCheck,
            payload,
            retry_count: 0,
        })
    }

    /// Failed attempts recorded so far.
    pub fn retry_count(&self) -> u8 {
        self.retry_count
    }

    /// Record a failed attempt and decide whether another is allowed.
    pub fn record_failure(&mut self) -> RetryDecision {
        if self.retry_count < RETRY_COUNT {
            self.retry_count += 1;
        }
        if self.retry_count < RETRY_COUNT {
            RetryDecision::Retry
        } else {
            RetryDecision::Exhausted
        }
    }

    /// Give back the log group, if this is a log package.
    pub fn into_group(self) -> Option<(LogGroup, Lane)> {
        match self.data {
            PackageData::Logs { group, lane } => Some((group, lane)),
            PackageData::HealthCheck => None,
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, TransportError> {
    let mut buf = Vec::with_capacity(256);
    value.serialize(&mut Serializer::new(&mut buf).with_struct_map())?;
    Ok(buf)
}

#[derive(Serialize)]
struct WireRecord<'a> {
    timestamp: String,
    level: u8,
    #[serde(rename = "type")]
    log_type: u8,
    weight: i32,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a ErrorInfo>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    context: &'a BTreeMap<String, ContextValue>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    context_fields: &'a BTreeMap<String, Vec<String>>,
}

impl<'a> From<&'a LogRecord> for WireRecord<'a> {
    fn from(record: &'a LogRecord) -> Self {
        Self {
            timestamp: record
                .timestamp
                .to_rfc3339_opts(SecondsFormat::Nanos, true),
            level: record.level.code(),
            log_type: record.log_type.into(),
            weight: record.weight,
            message: &record.message,
            error: record.error.as_ref(),
            context: &record.context,
            context_fields: &record.context_fields,
        }
    }
}

#[derive(Serialize)]
struct WireLogs<'a> {
    app_name: &'a str,
    overflow: bool,
    labels: &'a BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation: Option<&'a CorrelationData>,
    logs: Vec<WireRecord<'a>>,
}

impl<'a> WireLogs<'a> {
    fn new(group: &'a LogGroup, lane: Lane, config: &'a ClientConfig) -> Self {
        Self {
            app_name: &config.app_name,
            overflow: lane == Lane::Overflow,
            labels: &config.common_labels,
            correlation: group.correlation.as_ref(),
            logs: group.records.iter().map(WireRecord::from).collect(),
        }
    }
}

#[derive(Serialize)]
struct WireHealthCheck<'a> {
    app_name: &'a str,
    sent_at: String,
}
