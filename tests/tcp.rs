// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

mod common;

use portfwd::TcpForwarder;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Spawns a background echo server on `port` that closes once it has
/// echoed one connection's worth of bytes back.
fn spawn_echo_server(port: u16) -> std::thread::JoinHandle<()> {
    let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
    std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => stream.write_all(&buf[..n]).unwrap(),
                Err(_) => break,
            }
        }
    })
}

#[test]
fn tcp_echo_round_trip() {
    common::init_logging();
    let remote_port = free_port();
    let local_port = free_port();
    let echo = spawn_echo_server(remote_port);

    let mut forwarder = TcpForwarder::new();
    forwarder
        .add_entry(local_port, "127.0.0.1", remote_port)
        .unwrap();
    forwarder.start().unwrap();

    // give the accept thread a moment to bind and listen
    std::thread::sleep(Duration::from_millis(100));

    let mut client = TcpStream::connect(("127.0.0.1", local_port)).unwrap();
    client.write_all(b"hello forwarder").unwrap();

    let mut response = [0u8; 32];
    let n = client.read(&mut response).unwrap();
    assert_eq!(&response[..n], b"hello forwarder");

    drop(client);
    forwarder.stop();
    echo.join().unwrap();
}

#[test]
fn tcp_parallel_connections_are_served() {
    let remote_port = free_port();
    let local_port = free_port();

    let listener = TcpListener::bind(("127.0.0.1", remote_port)).unwrap();
    let server = std::thread::spawn(move || {
        let mut handles = Vec::new();
        for _ in 0..8 {
            let (mut stream, _) = listener.accept().unwrap();
            handles.push(std::thread::spawn(move || {
                let mut buf = [0u8; 64];
                let n = stream.read(&mut buf).unwrap();
                stream.write_all(&buf[..n]).unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    });

    let mut forwarder = TcpForwarder::new();
    forwarder
        .add_entry(local_port, "127.0.0.1", remote_port)
        .unwrap();
    forwarder.start().unwrap();
    std::thread::sleep(Duration::from_millis(100));

    let mut clients = Vec::new();
    for i in 0..8u8 {
        let mut client = TcpStream::connect(("127.0.0.1", local_port)).unwrap();
        client.write_all(&[i]).unwrap();
        clients.push(client);
    }
    for (i, client) in clients.iter_mut().enumerate() {
        let mut buf = [0u8; 1];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(buf[0], i as u8);
    }

    server.join().unwrap();
    forwarder.stop();
}

#[test]
fn duplicate_port_add_entry_is_idempotent() {
    let remote_port = free_port();
    let other_remote_port = free_port();
    let local_port = free_port();

    let forwarder = TcpForwarder::new();
    forwarder
        .add_entry(local_port, "127.0.0.1", remote_port)
        .unwrap();
    // A second add_entry for the same local_port must not replace the
    // first rule, and must not error.
    forwarder
        .add_entry(local_port, "127.0.0.1", other_remote_port)
        .unwrap();
}

#[test]
fn rebind_after_remove_succeeds() {
    let remote_port = free_port();
    let local_port = free_port();
    let echo = spawn_echo_server(remote_port);

    let mut forwarder = TcpForwarder::new();
    forwarder
        .add_entry(local_port, "127.0.0.1", remote_port)
        .unwrap();
    forwarder.start().unwrap();
    std::thread::sleep(Duration::from_millis(100));

    forwarder.remove_entry(local_port);
    std::thread::sleep(Duration::from_millis(50));

    let new_remote_port = free_port();
    let echo2 = spawn_echo_server(new_remote_port);
    forwarder
        .add_entry(local_port, "127.0.0.1", new_remote_port)
        .unwrap();
    std::thread::sleep(Duration::from_millis(100));

    let mut client = TcpStream::connect(("127.0.0.1", local_port)).unwrap();
    client.write_all(b"rebound").unwrap();
    let mut response = [0u8; 16];
    let n = client.read(&mut response).unwrap();
    assert_eq!(&response[..n], b"rebound");

    drop(client);
    forwarder.stop();
    let _ = echo.join();
    echo2.join().unwrap();
}

#[test]
fn restart_after_stop_resumes_forwarding() {
    let remote_port = free_port();
    let local_port = free_port();

    let mut forwarder = TcpForwarder::new();
    forwarder
        .add_entry(local_port, "127.0.0.1", remote_port)
        .unwrap();
    forwarder.start().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    forwarder.stop();

    let echo = spawn_echo_server(remote_port);
    forwarder.start().unwrap();
    std::thread::sleep(Duration::from_millis(100));

    let mut client = TcpStream::connect(("127.0.0.1", local_port)).unwrap();
    client.write_all(b"restarted").unwrap();
    let mut response = [0u8; 16];
    let n = client.read(&mut response).unwrap();
    assert_eq!(&response[..n], b"restarted");

    drop(client);
    forwarder.stop();
    echo.join().unwrap();
}

#[test]
fn bind_conflict_returns_bind_failed() {
    let remote_port = free_port();
    let local_port = free_port();
    // Hold the local port open so the forwarder's own bind fails.
    let _blocker = TcpListener::bind(("127.0.0.1", local_port)).unwrap();

    let mut forwarder = TcpForwarder::new();
    forwarder
        .add_entry(local_port, "127.0.0.1", remote_port)
        .unwrap();
    let err = forwarder.start().unwrap_err();
    assert_eq!(err, portfwd::BoundaryError::BindFailed);
}
