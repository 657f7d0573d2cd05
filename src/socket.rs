// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! A small RAII wrapper around `socket2::Socket`, mirroring the original
//! implementation's `SafeSocket`: a socket is always non-blocking, always
//! `SO_REUSEADDR`, and closes on drop.

use crate::error::{Error, Kind};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;

/// Builds a non-blocking, `SO_REUSEADDR` TCP listening socket bound to
/// `addr`, matching the original's `bind` + `listen` sequence.
pub fn tcp_listener(addr: SocketAddr) -> Result<Socket, Error> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|source| Error::new(Kind::InvalidSocket, source))?;
    socket
        .set_reuse_address(true)
        .map_err(|source| Error::new(Kind::BindFailed, source))?;
    socket.set_nonblocking(true).map_err(|source| Error::new(Kind::InvalidSocket, source))?;
    socket
        .bind(&addr.into())
        .map_err(|source| Error::new(Kind::BindFailed, source))?;
    socket
        .listen(1024)
        .map_err(|source| Error::new(Kind::ListenFailed, source))?;
    Ok(socket)
}

/// Builds a non-blocking TCP socket and begins an asynchronous `connect`
/// toward `addr`. Completion is detected by the first `Writable` edge the
/// caller observes on it, per the design's non-blocking connect contract.
pub fn tcp_connect(addr: SocketAddr) -> Result<Socket, Error> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|source| Error::new(Kind::InvalidSocket, source))?;
    socket.set_nonblocking(true).map_err(|source| Error::new(Kind::InvalidSocket, source))?;
    match socket.connect(&addr.into()) {
        Ok(()) => Ok(socket),
        Err(err) if matches!(err.raw_os_error(), Some(libc_err) if is_in_progress(libc_err)) => {
            Ok(socket)
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(socket),
        Err(source) => Err(Error::new(Kind::ConnectFailed, source)),
    }
}

#[cfg(unix)]
fn is_in_progress(raw: i32) -> bool {
    raw == libc::EINPROGRESS
}

#[cfg(not(unix))]
fn is_in_progress(_raw: i32) -> bool {
    false
}

/// Builds a non-blocking, `SO_REUSEADDR` UDP socket bound to `addr`. Used
/// both for the forwarder's client-facing listener and for each per-client
/// ephemeral upstream socket (bound to an OS-chosen port).
pub fn udp_socket(addr: SocketAddr) -> Result<Socket, Error> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|source| Error::new(Kind::InvalidSocket, source))?;
    socket
        .set_reuse_address(true)
        .map_err(|source| Error::new(Kind::BindFailed, source))?;
    socket.set_nonblocking(true).map_err(|source| Error::new(Kind::InvalidSocket, source))?;
    socket
        .bind(&addr.into())
        .map_err(|source| Error::new(Kind::BindFailed, source))?;
    Ok(socket)
}
