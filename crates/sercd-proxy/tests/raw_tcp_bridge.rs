//! Integration tests for the raw TCP bridge engine under the supervisor.
//!
//! These tests use real loopback sockets (`127.0.0.1`) and a
//! [`MockSerialDevice`] standing in for the serial line.  Each test picks a
//! free port by binding to port 0 first.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use sercd_core::{ProxyConfig, ProxyState};
use sercd_proxy::application::device_access::DeviceAccess;
use sercd_proxy::application::state_machine::{NotificationSink, ProxyStateMachine};
use sercd_proxy::application::supervisor::Supervisor;
use sercd_proxy::infrastructure::bridge::raw_tcp::RawTcpEngine;
use sercd_proxy::infrastructure::device::mock::{MockAccessProbe, MockPortOpener, MockSerialDevice};
use sercd_proxy::infrastructure::notification::mock::RecordingNotificationSink;

const DEVICE: &str = "/dev/ttyUSB0";

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn bridge() -> (Supervisor, MockSerialDevice, Arc<RecordingNotificationSink>) {
    let device = MockSerialDevice::new();
    let probe = Arc::new(MockAccessProbe::new());
    probe.grant(DEVICE);
    let ports = Arc::new(MockPortOpener::new());
    ports.add_device(DEVICE, device.clone());

    let sink = Arc::new(RecordingNotificationSink::new());
    let machine = Arc::new(ProxyStateMachine::new(
        Arc::clone(&sink) as Arc<dyn NotificationSink>
    ));
    let supervisor = Supervisor::new(
        Arc::new(DeviceAccess::new(probe, ports)),
        Arc::new(RawTcpEngine::new(Duration::from_millis(10))),
        machine,
    );
    (supervisor, device, sink)
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn connect(addr: SocketAddr) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                stream
                    .set_read_timeout(Some(Duration::from_secs(2)))
                    .unwrap();
                return stream;
            }
            Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
            Err(e) => panic!("could not connect to bridge at {addr}: {e}"),
        }
    }
}

#[test]
fn test_bytes_flow_both_ways_through_the_bridge() {
    // Arrange
    let (supervisor, device, _sink) = bridge();
    let config = ProxyConfig::new(DEVICE, "127.0.0.1", free_port()).unwrap();
    let addr = config.socket_addr();
    supervisor.start(config).unwrap();
    let mut client = connect(addr);
    assert!(wait_for(|| supervisor.state() == ProxyState::PortOpened));

    // Act: network → serial
    client.write_all(b"AT\r\n").unwrap();
    assert!(wait_for(|| device.written() == b"AT\r\n".to_vec()));

    // Act: serial → network
    device.feed(b"OK\r\n");
    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).unwrap();

    // Assert
    assert_eq!(&reply, b"OK\r\n");
    supervisor.stop();
    assert_eq!(supervisor.state(), ProxyState::Stopped);
    assert_eq!(device.close_count(), 1);
}

#[test]
fn test_client_disconnect_returns_to_ready_and_accepts_again() {
    let (supervisor, device, _sink) = bridge();
    let config = ProxyConfig::new(DEVICE, "127.0.0.1", free_port()).unwrap();
    let addr = config.socket_addr();
    supervisor.start(config).unwrap();

    let first = connect(addr);
    assert!(wait_for(|| supervisor.state() == ProxyState::PortOpened));
    drop(first);
    assert!(wait_for(|| supervisor.state() == ProxyState::Ready));

    let mut second = connect(addr);
    assert!(wait_for(|| supervisor.state() == ProxyState::PortOpened));
    second.write_all(b"again").unwrap();
    assert!(wait_for(|| device.written() == b"again".to_vec()));

    supervisor.stop();
    assert_eq!(device.close_count(), 1);
}

#[test]
fn test_second_client_is_dropped_while_first_is_served() {
    // Arrange
    let (supervisor, device, _sink) = bridge();
    let config = ProxyConfig::new(DEVICE, "127.0.0.1", free_port()).unwrap();
    let addr = config.socket_addr();
    supervisor.start(config).unwrap();
    let mut first = connect(addr);
    assert!(wait_for(|| supervisor.state() == ProxyState::PortOpened));

    // Act
    let mut second = connect(addr);
    let mut buf = [0u8; 1];
    let second_result = second.read(&mut buf);

    // Assert: the intruder sees its connection closed, the first still works.
    match second_result {
        Ok(n) => assert_eq!(n, 0),
        Err(e) => assert!(
            !matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ),
            "second client was not dropped: {e}"
        ),
    }
    first.write_all(b"still here").unwrap();
    assert!(wait_for(|| device.written() == b"still here".to_vec()));
    assert_eq!(supervisor.state(), ProxyState::PortOpened);

    supervisor.stop();
}

#[test]
fn test_stop_while_client_connected_is_prompt() {
    let (supervisor, device, sink) = bridge();
    let config = ProxyConfig::new(DEVICE, "127.0.0.1", free_port()).unwrap();
    let addr = config.socket_addr();
    supervisor.start(config).unwrap();
    let _client = connect(addr);
    assert!(wait_for(|| supervisor.state() == ProxyState::PortOpened));

    let started = Instant::now();
    supervisor.stop();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(supervisor.state(), ProxyState::Stopped);
    assert_eq!(sink.publish_count(ProxyState::Crashed), 0);
    assert_eq!(device.close_count(), 1);
}

#[test]
fn test_port_in_use_crashes_the_session() {
    // Arrange: occupy the port before the bridge binds it.
    let occupied = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();
    let (supervisor, device, sink) = bridge();
    let config = ProxyConfig::new(DEVICE, "127.0.0.1", port).unwrap();

    // Act
    supervisor.start(config).unwrap();

    // Assert
    assert!(wait_for(|| supervisor.state() == ProxyState::Crashed));
    assert_eq!(sink.publish_count(ProxyState::Crashed), 1);
    supervisor.stop();
    assert_eq!(device.close_count(), 1);
    drop(occupied);
}
