// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! `TcpDataBridge`: one of the fixed pool of worker threads that own a
//! shard of connected pairs and drive their bidirectional byte copying.
//! New pairs arrive over a channel from the accept loop, round-robined
//! across the pool; once assigned, a pair never moves bridges.

use crate::readiness::{Readiness, ReadinessDispatcher, ReadinessWaker};
use crate::tcp::pair::{ConnectedPair, Side};
use mio::Token;
use std::collections::HashMap;
use std::net::Shutdown;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

const WAIT_TIMEOUT: Duration = Duration::from_millis(200);

/// A new pair handed from the accept loop to a bridge, upstream connect
/// already in flight (non-blocking) but not yet confirmed complete.
pub struct NewPair {
    pub pair: ConnectedPair,
}

enum Owner {
    Client(u64),
    Upstream(u64),
}

pub struct TcpDataBridge {
    dispatcher: ReadinessDispatcher,
    incoming: Receiver<NewPair>,
    pairs: HashMap<u64, ConnectedPair>,
    tokens: HashMap<Token, Owner>,
    next_token: usize,
    stop: Arc<std::sync::atomic::AtomicBool>,
}

impl TcpDataBridge {
    pub fn new(
        incoming: Receiver<NewPair>,
        stop: Arc<std::sync::atomic::AtomicBool>,
    ) -> std::io::Result<(Self, ReadinessWaker)> {
        let dispatcher = ReadinessDispatcher::new(256)?;
        let waker = dispatcher.waker();
        Ok((
            Self {
                dispatcher,
                incoming,
                pairs: HashMap::new(),
                tokens: HashMap::new(),
                next_token: 0,
                stop,
            },
            waker,
        ))
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// The worker loop: waits for readiness, drains newly-assigned pairs,
    /// services events, and tears down any pair that finished draining.
    pub fn run(mut self) {
        while !self.stop.load(std::sync::atomic::Ordering::Acquire) {
            self.accept_new_pairs();

            let notifications = match self.dispatcher.wait(Some(WAIT_TIMEOUT)) {
                Ok(n) => n,
                Err(err) => {
                    tracing::warn!(?err, "tcp bridge dispatcher wait failed");
                    continue;
                }
            };

            for note in notifications {
                self.handle_event(note.token, note.readiness);
            }

            self.reap_closed_pairs();
        }
    }

    fn accept_new_pairs(&mut self) {
        while let Ok(NewPair { mut pair }) = self.incoming.try_recv() {
            let client_token = self.alloc_token();
            let upstream_token = self.alloc_token();

            if let Err(err) =
                self.dispatcher
                    .register(&mut pair.client, client_token, Readiness::READABLE)
            {
                tracing::warn!(?err, pair_id = pair.id, "failed to register client socket");
                continue;
            }
            if let Err(err) = self.dispatcher.register(
                &mut pair.upstream,
                upstream_token,
                Readiness::WRITABLE,
            ) {
                tracing::warn!(?err, pair_id = pair.id, "failed to register upstream socket");
                continue;
            }

            self.tokens.insert(client_token, Owner::Client(pair.id));
            self.tokens.insert(upstream_token, Owner::Upstream(pair.id));
            self.pairs.insert(pair.id, pair);
        }
    }

    fn handle_event(&mut self, token: Token, readiness: Readiness) {
        let (pair_id, side) = match self.tokens.get(&token) {
            Some(Owner::Client(id)) => (*id, Side::Client),
            Some(Owner::Upstream(id)) => (*id, Side::Upstream),
            None => return,
        };

        let Some(pair) = self.pairs.get_mut(&pair_id) else {
            return;
        };

        if side == Side::Upstream && !pair.upstream_connected {
            if !Self::confirm_connect(pair) {
                pair.mark_read_closed(Side::Client);
                pair.mark_read_closed(Side::Upstream);
                self.rearm(pair_id);
                return;
            }
        }

        if readiness.contains(Readiness::READABLE) && !pair.read_closed(side) {
            Self::read_into_buffer(pair, side);
        }

        if readiness.contains(Readiness::WRITABLE) {
            Self::drain_buffer_to(pair, side);
        }

        if readiness.contains(Readiness::CLOSED) {
            pair.mark_read_closed(side);
        }

        for side in [Side::Client, Side::Upstream] {
            if pair.ready_to_shutdown_write(side) {
                let _ = pair.socket(side).shutdown(Shutdown::Write);
                pair.mark_write_shutdown(side);
            }
        }

        self.rearm(pair_id);
    }

    /// Checks `SO_ERROR` on a socket whose first `Writable` edge after a
    /// non-blocking `connect()` just fired. Returns whether the connection
    /// completed successfully.
    fn confirm_connect(pair: &mut ConnectedPair) -> bool {
        match pair.upstream.take_error() {
            Ok(None) => {
                pair.upstream_connected = true;
                true
            }
            _ => false,
        }
    }

    fn read_into_buffer(pair: &mut ConnectedPair, side: Side) {
        use std::io::Read;
        if pair.outbound_from(side).over_watermark() {
            return;
        }
        let mut chunk = [0u8; 4096];
        let mut total = 0usize;
        loop {
            if total >= crate::constants::READ_BURST_CAP {
                break;
            }
            match pair.socket(side).read(&mut chunk) {
                Ok(0) => {
                    pair.mark_read_closed(side);
                    break;
                }
                Ok(n) => {
                    total += n;
                    pair.outbound_from(side).push(&chunk[..n]);
                    if pair.outbound_from(side).over_watermark() {
                        break;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    pair.mark_read_closed(side);
                    break;
                }
            }
        }
        Self::drain_buffer_to(pair, side.other());
    }

    /// Flushes bytes destined for `side` (queued by reads from
    /// `side.other()`) into `side`'s socket.
    fn drain_buffer_to(pair: &mut ConnectedPair, side: Side) {
        loop {
            let buf = match side {
                Side::Client => &mut pair.upstream_to_client,
                Side::Upstream => &mut pair.client_to_upstream,
            };
            if buf.is_empty() {
                break;
            }
            let socket = match side {
                Side::Client => &mut pair.client,
                Side::Upstream => &mut pair.upstream,
            };
            match buf.drain_into(socket) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    pair.mark_read_closed(side);
                    pair.mark_read_closed(side.other());
                    break;
                }
            }
        }
    }

    fn rearm(&mut self, pair_id: u64) {
        let Some(pair) = self.pairs.get_mut(&pair_id) else {
            return;
        };
        for side in [Side::Client, Side::Upstream] {
            if pair.write_shutdown(side) && pair.read_closed(side.other()) {
                continue;
            }
            let want_read = !pair.read_closed(side) && !pair.outbound_from(side).over_watermark();
            let want_write = match side {
                Side::Client => !pair.upstream_to_client.is_empty(),
                Side::Upstream => !pair.client_to_upstream.is_empty() || !pair.upstream_connected,
            };
            let mut mask = Readiness::empty();
            if want_read {
                mask |= Readiness::READABLE;
            }
            if want_write {
                mask |= Readiness::WRITABLE;
            }
            if mask.is_empty() {
                mask = Readiness::READABLE;
            }
            let token = self
                .tokens
                .iter()
                .find(|(_, owner)| match (owner, side) {
                    (Owner::Client(id), Side::Client) => *id == pair_id,
                    (Owner::Upstream(id), Side::Upstream) => *id == pair_id,
                    _ => false,
                })
                .map(|(token, _)| *token);
            if let Some(token) = token {
                let socket = pair.socket(side);
                let _ = reregister(&self.dispatcher, socket, token, mask);
            }
        }
    }

    fn reap_closed_pairs(&mut self) {
        let done: Vec<u64> = self
            .pairs
            .iter()
            .filter(|(_, pair)| pair.fully_closed())
            .map(|(id, _)| *id)
            .collect();
        for id in done {
            if let Some(mut pair) = self.pairs.remove(&id) {
                let _ = self.dispatcher.deregister(&mut pair.client);
                let _ = self.dispatcher.deregister(&mut pair.upstream);
            }
            self.tokens.retain(|_, owner| !matches!(owner,
                Owner::Client(pid) | Owner::Upstream(pid) if *pid == id));
        }
    }
}

fn reregister(
    dispatcher: &ReadinessDispatcher,
    socket: &mut mio::net::TcpStream,
    token: Token,
    mask: Readiness,
) -> std::io::Result<()> {
    dispatcher.reregister(socket, token, mask)
}

/// A handle the accept loop uses to hand a new pair to one bridge and wake
/// its worker thread up to register it.
#[derive(Clone)]
pub struct BridgeHandle {
    pub sender: Sender<NewPair>,
    pub waker: ReadinessWaker,
}

impl BridgeHandle {
    pub fn dispatch(&self, pair: ConnectedPair) -> Result<(), ()> {
        self.sender.send(NewPair { pair }).map_err(|_| ())?;
        self.waker.wake().map_err(|_| ())
    }
}
