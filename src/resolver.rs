// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Name resolution is an external collaborator per the design: the engines
//! only need *something* that turns `(host, port)` into a resolved IPv4
//! endpoint for the right protocol. [`StdResolver`] is the default,
//! blocking, `getaddrinfo`-backed implementation; embedders may substitute
//! their own (e.g. to resolve against a private directory instead of DNS).

use crate::error::{Error, Kind};
use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs};

/// The two transport protocols a caller may resolve an endpoint for. Present
/// purely so implementations can pick `SOCK_STREAM`/`SOCK_DGRAM` correctly;
/// [`StdResolver`] does not distinguish between them since
/// `std::net::ToSocketAddrs` resolves addresses, not socket types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// Resolves `(host, port)` to a single IPv4 endpoint for the given
/// protocol. Implementations may block; forwarder control-plane calls
/// always invoke this outside of any held lock.
pub trait AddressResolver: Send + Sync {
    fn resolve(&self, protocol: Protocol, host: &str, port: u16) -> Result<SocketAddr, Error>;
}

/// Resolves via the platform resolver (`getaddrinfo` underneath
/// `ToSocketAddrs`), keeping only the first IPv4 result, matching the
/// original implementation's `hints.ai_family = AF_INET`.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdResolver;

impl AddressResolver for StdResolver {
    fn resolve(&self, _protocol: Protocol, host: &str, port: u16) -> Result<SocketAddr, Error> {
        let candidates = (host, port)
            .to_socket_addrs()
            .map_err(|source| Error::new(Kind::NameResolutionFailed, source))?;

        candidates
            .filter_map(|addr| match addr {
                SocketAddr::V4(v4) => Some(SocketAddr::V4(v4)),
                SocketAddr::V6(_) => None,
            })
            .next()
            .ok_or_else(|| Error::other(Kind::NameResolutionFailed))
    }
}

/// The fixed bind policy: local listeners only ever bind to loopback.
pub(crate) fn loopback(port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(std::net::Ipv4Addr::LOCALHOST, port))
}
