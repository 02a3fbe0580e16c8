//! Boundary with the transport collaborator.
//!
//! The dispatcher and health checker depend only on [`Connector`] and
//! [`PackageStream`]: open a stream, send a package, close it. The wire
//! encoding of the frame is the stream's business. [`TcpConnector`] is the
//! bundled implementation writing length-prefixed MessagePack frames over
//! TCP, TLS or Unix domain sockets.

mod tcp;

use std::io;

use crate::package::TransportPackage;
use crate::pool::PoolRole;

pub use tcp::{SocketTransport, TcpConnector, TcpTransport, TlsOptions, UnixTransport, frame_package};

/// Parameters for opening one pooled stream.
#[derive(Clone, Debug)]
pub struct OpenStreamRequest {
    /// Client identity shared by every stream of this process.
    pub client_id: String,
    /// Role the pool slot was configured for.
    pub role: PoolRole,
    /// Index of the slot within its role.
    pub slot: usize,
    /// The stream will carry hi-pri traffic: a hi-pri primary, or a backup
    /// reserved for hi-pri duty. Connectors may tune such streams for latency.
    pub hipri: bool,
}

/// Identity returned by the server (or transport) for an opened stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamInfo {
    pub connection_id: String,
    pub streaming_endpoint: String,
}

/// An open streaming connection to the logging server.
pub trait PackageStream: Send {
    fn info(&self) -> &StreamInfo;

    /// Deliver one package. Implementations must bound the call by their
    /// configured send timeout and report a timeout as an error.
    fn send(&mut self, package: &TransportPackage) -> io::Result<()>;

    /// Release the underlying resources.
    fn close(&mut self) {}
}

/// Opens streams for the connection pool.
pub trait Connector: Send + Sync {
    fn open_stream(&self, request: &OpenStreamRequest) -> io::Result<Box<dyn PackageStream>>;
}
