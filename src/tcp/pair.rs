// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use mio::net::TcpStream;
use std::collections::VecDeque;

/// Which leg of a [`ConnectedPair`] a socket token refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Client,
    Upstream,
}

impl Side {
    pub fn other(self) -> Self {
        match self {
            Side::Client => Side::Upstream,
            Side::Upstream => Side::Client,
        }
    }
}

/// One direction's in-flight bytes: read from `Side`, queued to be written
/// to `Side::other()`.
pub struct Buffer {
    bytes: VecDeque<u8>,
    soft_cap: usize,
}

impl Buffer {
    fn new(soft_cap: usize) -> Self {
        Self {
            bytes: VecDeque::new(),
            soft_cap,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.bytes.extend(data);
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether this buffer is over the soft watermark, i.e. the source side
    /// should stop being polled for `Readable` until it drains.
    pub fn over_watermark(&self) -> bool {
        self.bytes.len() >= self.soft_cap
    }

    /// Drains up to `socket`'s write capacity from the front of the buffer.
    /// Returns the number of bytes written.
    pub fn drain_into(&mut self, socket: &mut TcpStream) -> std::io::Result<usize> {
        use std::io::Write;
        let (front, _) = self.bytes.as_slices();
        if front.is_empty() {
            return Ok(0);
        }
        let written = socket.write(front)?;
        self.bytes.drain(..written);
        Ok(written)
    }
}

/// Per-side half-close state: whether reads from this side have seen EOF
/// (or an error/`Closed` edge), and whether this side's write half has
/// since been shut down (which only happens once its peer's queued bytes
/// are fully drained into it).
#[derive(Default, Clone, Copy)]
struct HalfClose {
    read_closed: bool,
    write_shutdown: bool,
}

/// A client socket bridged to an upstream socket, with one buffer per
/// direction and the half-close bookkeeping needed to drain a peer's last
/// bytes before shutting its write half down.
pub struct ConnectedPair {
    pub id: u64,
    pub client: TcpStream,
    pub upstream: TcpStream,
    pub upstream_connected: bool,
    /// Bytes read from the client, queued to be written to upstream.
    pub client_to_upstream: Buffer,
    /// Bytes read from upstream, queued to be written to the client.
    pub upstream_to_client: Buffer,
    client_state: HalfClose,
    upstream_state: HalfClose,
}

impl ConnectedPair {
    pub fn new(id: u64, client: TcpStream, upstream: TcpStream, buffer_soft_cap: usize) -> Self {
        Self {
            id,
            client,
            upstream,
            upstream_connected: false,
            client_to_upstream: Buffer::new(buffer_soft_cap),
            upstream_to_client: Buffer::new(buffer_soft_cap),
            client_state: HalfClose::default(),
            upstream_state: HalfClose::default(),
        }
    }

    pub fn socket(&mut self, side: Side) -> &mut TcpStream {
        match side {
            Side::Client => &mut self.client,
            Side::Upstream => &mut self.upstream,
        }
    }

    /// The buffer fed by reads from `side` (written out to `side.other()`).
    pub fn outbound_from(&mut self, side: Side) -> &mut Buffer {
        match side {
            Side::Client => &mut self.client_to_upstream,
            Side::Upstream => &mut self.upstream_to_client,
        }
    }

    fn state(&self, side: Side) -> HalfClose {
        match side {
            Side::Client => self.client_state,
            Side::Upstream => self.upstream_state,
        }
    }

    fn state_mut(&mut self, side: Side) -> &mut HalfClose {
        match side {
            Side::Client => &mut self.client_state,
            Side::Upstream => &mut self.upstream_state,
        }
    }

    /// Marks `side` as seen-closed: further reads on it are skipped, but its
    /// peer keeps draining whatever was already queued for `side`.
    pub fn mark_read_closed(&mut self, side: Side) {
        self.state_mut(side).read_closed = true;
    }

    pub fn read_closed(&self, side: Side) -> bool {
        self.state(side).read_closed
    }

    /// Whether `side`'s buffer (fed by reads from `side.other()`) has fully
    /// drained and `side.other()` has seen EOF: `side`'s write half should
    /// now be shut down.
    pub fn ready_to_shutdown_write(&self, side: Side) -> bool {
        !self.state(side).write_shutdown
            && self.state(side.other()).read_closed
            && self.outbound_peek(side.other()).is_empty()
    }

    fn outbound_peek(&self, side: Side) -> &Buffer {
        match side {
            Side::Client => &self.client_to_upstream,
            Side::Upstream => &self.upstream_to_client,
        }
    }

    pub fn mark_write_shutdown(&mut self, side: Side) {
        self.state_mut(side).write_shutdown = true;
    }

    pub fn write_shutdown(&self, side: Side) -> bool {
        self.state(side).write_shutdown
    }

    /// Whether both legs have seen EOF and had their write halves shut
    /// down, i.e. the pair is safe to tear down.
    pub fn fully_closed(&self) -> bool {
        self.client_state.read_closed
            && self.upstream_state.read_closed
            && self.client_state.write_shutdown
            && self.upstream_state.write_shutdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_reports_over_watermark_at_the_cap() {
        let mut buf = Buffer::new(8);
        buf.push(&[0u8; 7]);
        assert!(!buf.over_watermark());
        buf.push(&[0u8; 1]);
        assert!(buf.over_watermark());
    }

    #[test]
    fn side_other_is_its_own_inverse() {
        assert_eq!(Side::Client.other(), Side::Upstream);
        assert_eq!(Side::Upstream.other(), Side::Client);
    }
}
