// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

mod common;

use portfwd::{UdpForwarder, UdpForwarderOptions};
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

fn free_port() -> u16 {
    UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// An echo server that replies to every datagram it receives with the same
/// bytes, until `stop` signals it to exit.
fn spawn_echo_server(port: u16, stop: Arc<std::sync::atomic::AtomicBool>) -> std::thread::JoinHandle<()> {
    let socket = UdpSocket::bind(("127.0.0.1", port)).unwrap();
    socket.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
    std::thread::spawn(move || {
        let mut buf = [0u8; 1024];
        while !stop.load(std::sync::atomic::Ordering::Acquire) {
            match socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    let _ = socket.send_to(&buf[..n], from);
                }
                Err(_) => continue,
            }
        }
    })
}

#[test]
fn udp_round_trip_with_two_clients() {
    common::init_logging();
    let remote_port = free_port();
    let local_port = free_port();
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let echo = spawn_echo_server(remote_port, stop.clone());

    let mut forwarder = UdpForwarder::new();
    forwarder
        .add_entry(local_port, "127.0.0.1", remote_port)
        .unwrap();
    forwarder.start().unwrap();
    std::thread::sleep(Duration::from_millis(100));

    let client_a = UdpSocket::bind("127.0.0.1:0").unwrap();
    client_a.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let client_b = UdpSocket::bind("127.0.0.1:0").unwrap();
    client_b.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    client_a.send_to(b"from-a", ("127.0.0.1", local_port)).unwrap();
    client_b.send_to(b"from-b", ("127.0.0.1", local_port)).unwrap();

    let mut buf = [0u8; 16];
    let (n, _) = client_a.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"from-a");
    let (n, _) = client_b.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"from-b");

    stop.store(true, std::sync::atomic::Ordering::Release);
    forwarder.stop();
    echo.join().unwrap();
}

/// Checks the forwarder keeps working for a client across a gap longer
/// than the configured idle timeout: whether or not the original mapping
/// was actually swept in between, a fresh datagram from the same client
/// must still be forwarded and answered.
#[test]
fn udp_idle_client_mapping_times_out() {
    common::init_logging();
    let remote_port = free_port();
    let local_port = free_port();
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let echo = spawn_echo_server(remote_port, stop.clone());

    let options = UdpForwarderOptions {
        client_timeout: Duration::from_millis(200),
    };
    let mut forwarder = UdpForwarder::with_options(Arc::new(portfwd::StdResolver), options);
    forwarder
        .add_entry(local_port, "127.0.0.1", remote_port)
        .unwrap();
    forwarder.start().unwrap();
    std::thread::sleep(Duration::from_millis(100));

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    client.send_to(b"ping", ("127.0.0.1", local_port)).unwrap();
    let mut buf = [0u8; 16];
    let (n, _) = client.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"ping");

    // Wait well past the configured idle timeout so the client mapping is
    // swept; a fresh datagram afterward must still establish a new mapping
    // and be forwarded rather than silently dropped.
    std::thread::sleep(Duration::from_millis(600));

    client.send_to(b"ping-again", ("127.0.0.1", local_port)).unwrap();
    let (n, _) = client.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"ping-again");

    stop.store(true, std::sync::atomic::Ordering::Release);
    forwarder.stop();
    echo.join().unwrap();
}
