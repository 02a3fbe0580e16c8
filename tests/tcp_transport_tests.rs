//! Framing over real sockets.

use std::io::{self, Read};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, unbounded};
use femtotransport::transport::SocketTransport;
use femtotransport::{
    ClientConfig, Connector, Lane, Level, LogGroup, LogRecord, OpenStreamRequest, PackageKind,
    PoolRole, TcpConnector, TransportClient, TransportPackage,
};
use rstest::rstest;
use serde::Deserialize;

#[derive(Debug)]
struct Frame {
    id: u64,
    kind: u8,
    payload: Vec<u8>,
}

#[derive(Deserialize)]
struct Logs {
    app_name: String,
    logs: Vec<Record>,
}

#[derive(Deserialize)]
struct Record {
    message: String,
}

fn read_frame(stream: &mut impl Read) -> io::Result<Frame> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len)?;
    let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
    stream.read_exact(&mut body)?;
    let (header, payload) = body.split_at(9);
    Ok(Frame {
        id: u64::from_be_bytes(header[..8].try_into().expect("8 bytes")),
        kind: header[8],
        payload: payload.to_vec(),
    })
}

/// Accept connections forever, forwarding every frame read.
fn serve(listener: TcpListener) -> Receiver<Frame> {
    let (tx, rx) = unbounded();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            let tx = tx.clone();
            thread::spawn(move || {
                while let Ok(frame) = read_frame(&mut stream) {
                    if tx.send(frame).is_err() {
                        break;
                    }
                }
            });
        }
    });
    rx
}

fn request(role: PoolRole) -> OpenStreamRequest {
    OpenStreamRequest {
        client_id: "tcp-tests".into(),
        role,
        slot: 0,
        hipri: role == PoolRole::HiPri,
    }
}

fn package(message: &str, lane: Lane) -> TransportPackage {
    TransportPackage::for_group(
        LogGroup::singleton(LogRecord::new(Level::Info, message)),
        lane,
        &ClientConfig {
            app_name: "tcp-tests".into(),
            ..ClientConfig::default()
        },
    )
    .expect("encodable")
}

#[rstest]
fn frames_carry_id_kind_and_payload() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        (read_frame(&mut stream).unwrap(), read_frame(&mut stream).unwrap())
    });

    let connector = TcpConnector::from_config(&ClientConfig {
        endpoint: addr.to_string(),
        ..ClientConfig::default()
    })
    .unwrap();
    let mut stream = connector.open_stream(&request(PoolRole::HiPri)).unwrap();
    assert!(stream.info().connection_id.starts_with("tcp-tests-hi-pri-0"));
    assert_eq!(stream.info().streaming_endpoint, addr.to_string());

    let mut first = package("first", Lane::HiPri);
    first.id = 7;
    let mut second = package("second", Lane::Normal);
    second.id = 8;
    stream.send(&first).unwrap();
    stream.send(&second).unwrap();
    stream.close();

    let (a, b) = handle.join().unwrap();
    assert_eq!((a.id, a.kind), (7, PackageKind::HiPriLog.code()));
    assert_eq!((b.id, b.kind), (8, PackageKind::Log.code()));
    let logs: Logs = rmp_serde::from_slice(&a.payload).unwrap();
    assert_eq!(logs.app_name, "tcp-tests");
    assert_eq!(logs.logs[0].message, "first");
}

#[rstest]
fn refused_connection_is_an_error() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let connector = TcpConnector::from_config(&ClientConfig {
        endpoint: addr.to_string(),
        connect_timeout: Duration::from_millis(200),
        ..ClientConfig::default()
    })
    .unwrap();
    assert!(connector.open_stream(&request(PoolRole::Normal)).is_err());
}

#[rstest]
fn oversized_package_is_rejected_before_writing() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let accept = thread::spawn(move || listener.accept().map(|(stream, _)| stream));
    let connector = TcpConnector::from_config(&ClientConfig {
        endpoint: addr.to_string(),
        max_frame_size: 8,
        ..ClientConfig::default()
    })
    .unwrap();
    let mut stream = connector.open_stream(&request(PoolRole::Normal)).unwrap();
    let err = stream.send(&package("too long for eight bytes", Lane::Normal)).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    let _server: TcpStream = accept.join().unwrap().unwrap();
}

#[cfg(unix)]
#[rstest]
fn unix_socket_endpoint_is_supported() {
    use std::os::unix::net::UnixListener;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("logs.sock");
    let listener = UnixListener::bind(&path).unwrap();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        read_frame(&mut stream).unwrap()
    });

    let transport = SocketTransport::from_endpoint(&format!("unix:{}", path.display())).unwrap();
    let connector = TcpConnector::new(transport);
    let mut stream = connector.open_stream(&request(PoolRole::Backup)).unwrap();
    let mut pkg = package("over unix", Lane::Normal);
    pkg.id = 1;
    stream.send(&pkg).unwrap();
    let frame = handle.join().unwrap();
    assert_eq!(frame.id, 1);
}

#[rstest]
fn client_delivers_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let frames = serve(listener);

    let client = TransportClient::connect(ClientConfig {
        app_name: "tcp-client".into(),
        endpoint: addr.to_string(),
        send_batch_logs_interval: Duration::from_millis(10),
        health_check_interval: Duration::from_millis(50),
        ..ClientConfig::default()
    })
    .unwrap();
    client.emit(LogRecord::new(Level::Warn, "over the wire"));

    let mut saw_log = false;
    let mut saw_probe = false;
    while !(saw_log && saw_probe) {
        let frame = frames
            .recv_timeout(Duration::from_secs(3))
            .expect("frame within timeout");
        if frame.kind == PackageKind::HealthCheck.code() {
            saw_probe = true;
        } else {
            let logs: Logs = rmp_serde::from_slice(&frame.payload).unwrap();
            assert_eq!(logs.logs[0].message, "over the wire");
            saw_log = true;
        }
    }
    client.shutdown();
    assert_eq!(client.stats().sent, 1);
}
