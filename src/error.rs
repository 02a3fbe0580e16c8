//! Error types surfaced by the transport pipeline.

use std::io;

use thiserror::Error;

use crate::classifier::Lane;
use crate::pool::PoolRole;

/// Errors produced while moving records towards the server.
///
/// Only ingress errors (`BufferFull`, `Closed`) ever reach producers; the
/// remaining variants are handled inside the pipeline and reported through
/// [`DeliveryStats`](crate::stats::DeliveryStats).
#[derive(Debug, Error)]
pub enum TransportError {
    /// Lane saturated with no fallback available.
    #[error("{0} lane is full")]
    BufferFull(Lane),
    /// No selectable connection exists for the role.
    #[error("no healthy connection in the {0} pool")]
    NoHealthyConnection(PoolRole),
    /// A single send attempt failed; retryable.
    #[error("send failed: {0}")]
    SendFailed(#[source] io::Error),
    /// A package failed every permitted attempt.
    #[error("package {id} dropped after {attempts} attempts")]
    RetriesExhausted { id: u64, attempts: u8 },
    /// A health probe did not complete in time.
    #[error("health check timed out on connection {0}")]
    HealthCheckTimeout(String),
    /// The pipeline has been shut down.
    #[error("transport is closed")]
    Closed,
    /// The payload could not be encoded.
    #[error("failed to serialise package: {0}")]
    Serialise(#[from] rmp_serde::encode::Error),
}

/// Errors raised while loading or validating a [`ClientConfig`](crate::config::ClientConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid user supplied configuration.
    #[error("invalid client configuration: {0}")]
    Invalid(String),
    /// The configuration document could not be parsed.
    #[error(transparent)]
    Parse(#[from] serde_json::Error),
    /// Underlying I/O error whilst reading the configuration.
    #[error(transparent)]
    Io(#[from] io::Error),
}
