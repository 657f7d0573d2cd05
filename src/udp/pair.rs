// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use mio::net::UdpSocket;
use std::net::SocketAddr;
use std::time::Instant;

/// A NAT-like mapping from one client's datagrams, received on one local
/// port, to the ephemeral upstream socket forwarding them to the
/// configured remote endpoint. Torn down by the idle sweep once no traffic
/// has crossed it for longer than the client timeout.
pub struct UdpPair {
    pub upstream: UdpSocket,
    pub local_port: u16,
    pub client_addr: SocketAddr,
    pub remote: SocketAddr,
    pub last_activity: Instant,
}

impl UdpPair {
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn idle_since(&self, now: Instant, timeout: std::time::Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn idle_since_respects_the_timeout_boundary() {
        let upstream = UdpSocket::from_std(std::net::UdpSocket::bind("127.0.0.1:0").unwrap());
        let now = Instant::now();
        let mut pair = UdpPair {
            upstream,
            local_port: 9000,
            client_addr: "127.0.0.1:1".parse().unwrap(),
            remote: "127.0.0.1:2".parse().unwrap(),
            last_activity: now,
        };
        assert!(!pair.idle_since(now, Duration::from_secs(30)));
        pair.touch(now + Duration::from_secs(10));
        assert!(!pair.idle_since(now + Duration::from_secs(35), Duration::from_secs(30)));
        assert!(pair.idle_since(now + Duration::from_secs(41), Duration::from_secs(30)));
    }
}
