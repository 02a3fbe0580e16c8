//! Socket transport writing framed packages.
//!
//! Every package is written as a big-endian `u32` length followed by the
//! package sequence id (`u64`, big-endian), the package type byte and the
//! MessagePack payload. The length covers everything after itself.

use std::{
    io::{self, Write},
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use log::debug;
use native_tls::{TlsConnector, TlsStream};

#[cfg(unix)]
use std::os::unix::net::UnixStream;

use crate::config::ClientConfig;
use crate::package::TransportPackage;

use super::{Connector, OpenStreamRequest, PackageStream, StreamInfo};

const HEADER_LEN: usize = 9;

/// Transport targeted by the connector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketTransport {
    /// TCP transport with optional TLS.
    Tcp(TcpTransport),
    /// Unix domain socket transport.
    Unix(UnixTransport),
}

impl SocketTransport {
    /// Parse `host:port`, `tls://host:port` or `unix:/path/to/socket`.
    pub fn from_endpoint(endpoint: &str) -> io::Result<Self> {
        let endpoint = endpoint.trim();
        if let Some(path) = endpoint.strip_prefix("unix:") {
            return Ok(Self::Unix(UnixTransport {
                path: PathBuf::from(path),
            }));
        }
        let (tls, rest) = match endpoint.strip_prefix("tls://") {
            Some(rest) => (true, rest),
            None => (false, endpoint.strip_prefix("tcp://").unwrap_or(endpoint)),
        };
        let (host, port) = rest.rsplit_once(':').ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("endpoint '{endpoint}' is missing a port"),
            )
        })?;
        let port: u16 = port.parse().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("endpoint '{endpoint}' has an invalid port"),
            )
        })?;
        let host = host.trim_start_matches('[').trim_end_matches(']').to_owned();
        Ok(Self::Tcp(TcpTransport {
            tls: tls.then(|| TlsOptions {
                domain: host.clone(),
                insecure_skip_verify: false,
            }),
            host,
            port,
        }))
    }

    fn describe(&self) -> String {
        match self {
            SocketTransport::Tcp(tcp) => format!("{}:{}", tcp.host, tcp.port),
            SocketTransport::Unix(unix) => format!("unix:{}", unix.path.display()),
        }
    }
}

/// TCP transport configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcpTransport {
    /// Hostname or IP address to connect to.
    pub host: String,
    /// TCP port number.
    pub port: u16,
    /// Optional TLS configuration.
    pub tls: Option<TlsOptions>,
}

impl TcpTransport {
    fn socket_addrs(&self) -> io::Result<Vec<SocketAddr>> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map(|iter| iter.collect())
    }
}

/// Unix domain socket configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnixTransport {
    /// Path to the socket file.
    pub path: PathBuf,
}

/// TLS connection options.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsOptions {
    /// Domain name presented during the TLS handshake.
    pub domain: String,
    /// Skip certificate validation when true (intended for tests).
    pub insecure_skip_verify: bool,
}

impl TlsOptions {
    fn connector(&self) -> io::Result<TlsConnector> {
        let mut builder = TlsConnector::builder();
        if self.insecure_skip_verify {
            builder.danger_accept_invalid_certs(true);
            builder.danger_accept_invalid_hostnames(true);
        }
        builder.build().map_err(io::Error::other)
    }
}

enum ActiveConnection {
    PlainTcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl ActiveConnection {
    fn set_write_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        match self {
            ActiveConnection::PlainTcp(stream) => stream.set_write_timeout(Some(timeout)),
            ActiveConnection::Tls(stream) => stream.get_ref().set_write_timeout(Some(timeout)),
            #[cfg(unix)]
            ActiveConnection::Unix(stream) => stream.set_write_timeout(Some(timeout)),
        }
    }

    fn set_nodelay(&mut self, nodelay: bool) -> io::Result<()> {
        match self {
            ActiveConnection::PlainTcp(stream) => stream.set_nodelay(nodelay),
            ActiveConnection::Tls(stream) => stream.get_ref().set_nodelay(nodelay),
            #[cfg(unix)]
            ActiveConnection::Unix(_) => Ok(()),
        }
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        match self {
            ActiveConnection::PlainTcp(stream) => {
                stream.write_all(frame)?;
                stream.flush()
            }
            ActiveConnection::Tls(stream) => {
                stream.write_all(frame)?;
                stream.flush()
            }
            #[cfg(unix)]
            ActiveConnection::Unix(stream) => {
                stream.write_all(frame)?;
                stream.flush()
            }
        }
    }

    fn shutdown(&mut self) {
        let _ = match self {
            ActiveConnection::PlainTcp(stream) => stream.shutdown(std::net::Shutdown::Both),
            ActiveConnection::Tls(stream) => stream.shutdown(),
            #[cfg(unix)]
            ActiveConnection::Unix(stream) => stream.shutdown(std::net::Shutdown::Both),
        };
    }
}

fn connect_tcp(config: &TcpTransport, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in config.socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no addresses resolved for {}:{}", config.host, config.port),
        )
    }))
}

fn connect_transport(
    transport: &SocketTransport,
    connect_timeout: Duration,
) -> io::Result<ActiveConnection> {
    match transport {
        SocketTransport::Tcp(config) => {
            let stream = connect_tcp(config, connect_timeout)?;
            if let Some(tls) = &config.tls {
                let connector = tls.connector()?;
                stream.set_read_timeout(Some(connect_timeout))?;
                stream.set_write_timeout(Some(connect_timeout))?;
                let stream = connector
                    .connect(&tls.domain, stream)
                    .map_err(io::Error::other)?;
                stream.get_ref().set_read_timeout(None)?;
                Ok(ActiveConnection::Tls(Box::new(stream)))
            } else {
                Ok(ActiveConnection::PlainTcp(stream))
            }
        }
        SocketTransport::Unix(config) => {
            #[cfg(unix)]
            {
                let stream = UnixStream::connect(&config.path)?;
                Ok(ActiveConnection::Unix(stream))
            }
            #[cfg(not(unix))]
            {
                let _ = (config, connect_timeout);
                Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "unix domain sockets are not supported on this platform",
                ))
            }
        }
    }
}

/// Frame `package` with its length, sequence id and type byte.
///
/// Returns `None` when the payload exceeds `max_size`.
pub fn frame_package(package: &TransportPackage, max_size: usize) -> Option<Vec<u8>> {
    if package.payload.len() > max_size {
        return None;
    }
    let body_len = package.payload.len().checked_add(HEADER_LEN)?;
    let len = u32::try_from(body_len).ok()?;
    let mut framed = Vec::with_capacity(body_len.checked_add(4)?);
    framed.extend(len.to_be_bytes());
    framed.extend(package.id.to_be_bytes());
    framed.push(package.kind.code());
    framed.extend_from_slice(&package.payload);
    Some(framed)
}

/// [`Connector`] opening one socket per pooled connection.
pub struct TcpConnector {
    transport: SocketTransport,
    connect_timeout: Duration,
    write_timeout: Duration,
    max_frame_size: usize,
    opened: AtomicU64,
}

impl TcpConnector {
    pub fn new(transport: SocketTransport) -> Self {
        let defaults = ClientConfig::default();
        Self {
            transport,
            connect_timeout: defaults.connect_timeout,
            write_timeout: defaults.send_timeout,
            max_frame_size: defaults.max_frame_size,
            opened: AtomicU64::new(0),
        }
    }

    /// Build a connector for `config.endpoint` using its timeouts.
    pub fn from_config(config: &ClientConfig) -> io::Result<Self> {
        let transport = SocketTransport::from_endpoint(&config.endpoint)?;
        Ok(Self {
            connect_timeout: config.connect_timeout,
            write_timeout: config.send_timeout,
            max_frame_size: config.max_frame_size,
            ..Self::new(transport)
        })
    }
}

impl Connector for TcpConnector {
    fn open_stream(&self, request: &OpenStreamRequest) -> io::Result<Box<dyn PackageStream>> {
        let mut connection = connect_transport(&self.transport, self.connect_timeout)?;
        connection.set_write_timeout(self.write_timeout)?;
        if request.hipri {
            connection.set_nodelay(true)?;
        }
        let serial = self.opened.fetch_add(1, Ordering::Relaxed);
        let info = StreamInfo {
            connection_id: format!(
                "{}-{}-{}-{serial}",
                request.client_id, request.role, request.slot
            ),
            streaming_endpoint: self.transport.describe(),
        };
        debug!(
            "femtotransport: opened {} stream {} (hipri: {})",
            request.role, info.connection_id, request.hipri
        );
        Ok(Box::new(SocketStream {
            connection,
            info,
            max_frame_size: self.max_frame_size,
        }))
    }
}

struct SocketStream {
    connection: ActiveConnection,
    info: StreamInfo,
    max_frame_size: usize,
}

impl PackageStream for SocketStream {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn send(&mut self, package: &TransportPackage) -> io::Result<()> {
        let frame = frame_package(package, self.max_frame_size)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "frame too large"))?;
        self.connection.write_frame(&frame)
    }

    fn close(&mut self) {
        self.connection.shutdown();
    }
}
