// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The UDP forwarding engine: a single worker thread owns every listening
//! socket and every client's ephemeral upstream socket, relaying datagrams
//! both ways and sweeping idle client mappings on a timer.

mod entry;
mod pair;

pub use entry::UdpEntry;

use crate::constants::CLIENT_TIMEOUT;
use crate::error::BoundaryError;
use crate::readiness::{Readiness, ReadinessDispatcher, ReadinessWaker};
use crate::resolver::{AddressResolver, Protocol, StdResolver};
use crate::routing::RoutingTable;
use mio::net::UdpSocket;
use mio::Token;
use pair::UdpPair;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const DATAGRAM_MAX: usize = 64 * 1024;
/// Worker wait timeout; short enough that the idle sweep (gated on elapsed
/// time, checked every iteration) still runs close to its real cadence.
const WAIT_TIMEOUT: Duration = Duration::from_secs(1);
/// Pair socket tokens live above this watermark so they never collide with
/// a listener's `Token(local_port)`.
const PAIR_TOKEN_BASE: usize = 1 << 17;

#[derive(Clone, Copy, Debug)]
pub struct ForwarderOptions {
    pub client_timeout: Duration,
}

impl Default for ForwarderOptions {
    fn default() -> Self {
        Self {
            client_timeout: CLIENT_TIMEOUT,
        }
    }
}

struct Running {
    worker_handle: JoinHandle<()>,
    registry: mio::Registry,
    waker: ReadinessWaker,
}

/// A user-space UDP port forwarder with NAT-like per-client upstream
/// socket mapping and an idle timeout sweep.
pub struct UdpForwarder {
    routing: Arc<RoutingTable<UdpEntry>>,
    listeners: Arc<Mutex<HashMap<u16, UdpSocket>>>,
    resolver: Arc<dyn AddressResolver>,
    options: ForwarderOptions,
    stop_flag: Arc<AtomicBool>,
    running: Option<Running>,
}

impl UdpForwarder {
    pub fn new() -> Self {
        Self::with_options(Arc::new(StdResolver), ForwarderOptions::default())
    }

    pub fn with_options(resolver: Arc<dyn AddressResolver>, options: ForwarderOptions) -> Self {
        Self {
            routing: Arc::new(RoutingTable::new()),
            listeners: Arc::new(Mutex::new(HashMap::new())),
            resolver,
            options,
            stop_flag: Arc::new(AtomicBool::new(true)),
            running: None,
        }
    }

    pub fn add_entry(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<(), BoundaryError> {
        let remote = self
            .resolver
            .resolve(Protocol::Udp, remote_host, remote_port)
            .map_err(BoundaryError::from)?;

        if !self.routing.insert_if_absent(local_port, UdpEntry { remote }) {
            return Ok(());
        }

        if let Some(running) = &self.running {
            if let Err(err) = self.bind_and_register(local_port, &running.registry) {
                self.routing.remove(local_port);
                return Err(err.into());
            }
        }

        Ok(())
    }

    pub fn remove_entry(&self, local_port: u16) {
        self.routing.remove(local_port);
        if let Some(running) = &self.running {
            if let Some(mut listener) = self.listeners.lock().remove(&local_port) {
                let _ = running.registry.deregister(&mut listener);
            }
        }
    }

    fn bind_and_register(
        &self,
        local_port: u16,
        registry: &mio::Registry,
    ) -> Result<(), crate::error::Error> {
        let socket = crate::socket::udp_socket(crate::resolver::loopback(local_port))?;
        let mut listener = UdpSocket::from_std(socket.into());
        registry
            .register(&mut listener, Token(local_port as usize), mio::Interest::READABLE)
            .map_err(|source| crate::error::Error::new(crate::error::Kind::BindFailed, source))?;
        self.listeners.lock().insert(local_port, listener);
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), BoundaryError> {
        if self.running.is_some() {
            return Ok(());
        }
        self.stop_flag.store(false, Ordering::Release);

        let dispatcher = ReadinessDispatcher::new(256).map_err(|_| BoundaryError::Unknown)?;
        let waker = dispatcher.waker();
        let registry = dispatcher
            .registry()
            .try_clone()
            .map_err(|_| BoundaryError::Unknown)?;

        let mut existing_ports = Vec::new();
        self.routing.for_each(|port, _| existing_ports.push(port));
        for port in existing_ports {
            self.bind_and_register(port, &registry)
                .map_err(|_| BoundaryError::BindFailed)?;
        }

        let worker_handle = {
            let listeners = self.listeners.clone();
            let routing = self.routing.clone();
            let stop_flag = self.stop_flag.clone();
            let client_timeout = self.options.client_timeout;
            std::thread::Builder::new()
                .name("udp-worker".into())
                .spawn(move || worker_loop(dispatcher, listeners, routing, stop_flag, client_timeout))
                .map_err(|_| BoundaryError::Unknown)?
        };

        self.running = Some(Running {
            worker_handle,
            registry,
            waker,
        });
        Ok(())
    }

    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Release);
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.waker.wake();
        let _ = running.worker_handle.join();
        self.listeners.lock().clear();
    }
}

impl Default for UdpForwarder {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for UdpForwarder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    mut dispatcher: ReadinessDispatcher,
    listeners: Arc<Mutex<HashMap<u16, UdpSocket>>>,
    routing: Arc<RoutingTable<UdpEntry>>,
    stop_flag: Arc<AtomicBool>,
    client_timeout: Duration,
) {
    let mut pairs: HashMap<(u16, SocketAddr), UdpPair> = HashMap::new();
    let mut token_to_key: HashMap<Token, (u16, SocketAddr)> = HashMap::new();
    let mut next_token = PAIR_TOKEN_BASE;
    let mut last_sweep = Instant::now();
    let mut buf = [0u8; DATAGRAM_MAX];

    while !stop_flag.load(Ordering::Acquire) {
        let notifications = match dispatcher.wait(Some(WAIT_TIMEOUT)) {
            Ok(n) => n,
            Err(err) => {
                tracing::warn!(?err, "udp dispatcher wait failed");
                continue;
            }
        };

        for note in notifications {
            if !note.readiness.contains(Readiness::READABLE) {
                continue;
            }
            if note.token.0 < PAIR_TOKEN_BASE {
                handle_listener_readable(
                    note.token.0 as u16,
                    &listeners,
                    &routing,
                    &mut pairs,
                    &mut token_to_key,
                    &mut next_token,
                    &mut dispatcher,
                    &mut buf,
                );
            } else if let Some(&key) = token_to_key.get(&note.token) {
                handle_upstream_readable(key, &listeners, &mut pairs, &mut buf);
            }
        }

        let now = Instant::now();
        if now.saturating_duration_since(last_sweep) > client_timeout {
            sweep_idle_pairs(&mut pairs, &mut token_to_key, &mut dispatcher, now, client_timeout);
            last_sweep = now;
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_listener_readable(
    local_port: u16,
    listeners: &Arc<Mutex<HashMap<u16, UdpSocket>>>,
    routing: &Arc<RoutingTable<UdpEntry>>,
    pairs: &mut HashMap<(u16, SocketAddr), UdpPair>,
    token_to_key: &mut HashMap<Token, (u16, SocketAddr)>,
    next_token: &mut usize,
    dispatcher: &mut ReadinessDispatcher,
    buf: &mut [u8],
) {
    loop {
        let received = {
            let mut listeners = listeners.lock();
            let Some(listener) = listeners.get_mut(&local_port) else {
                return;
            };
            listener.recv_from(buf)
        };

        let (n, client_addr) = match received {
            Ok(v) => v,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(err) => {
                tracing::debug!(?err, local_port, "udp recv failed");
                return;
            }
        };

        let Some(entry) = routing.get_cloned(local_port) else {
            continue;
        };

        let key = (local_port, client_addr);
        if !pairs.contains_key(&key) {
            match spawn_upstream(local_port, client_addr, entry.remote, next_token, dispatcher) {
                Ok(pair) => {
                    token_to_key.insert(Token(*next_token - 1), key);
                    pairs.insert(key, pair);
                }
                Err(err) => {
                    tracing::debug!(?err, local_port, "udp upstream socket create failed");
                    continue;
                }
            }
        }

        let now = Instant::now();
        if let Some(pair) = pairs.get_mut(&key) {
            pair.touch(now);
            if let Err(err) = pair.upstream.send_to(&buf[..n], entry.remote) {
                tracing::debug!(?err, local_port, "udp send to upstream failed");
            }
        }
    }
}

fn spawn_upstream(
    local_port: u16,
    client_addr: SocketAddr,
    remote: SocketAddr,
    next_token: &mut usize,
    dispatcher: &mut ReadinessDispatcher,
) -> Result<UdpPair, crate::error::Error> {
    let unspecified = match remote {
        SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
    };
    let socket = crate::socket::udp_socket(unspecified)?;
    let mut upstream = UdpSocket::from_std(socket.into());
    let token = Token(*next_token);
    *next_token += 1;
    dispatcher
        .register(&mut upstream, token, Readiness::READABLE)
        .map_err(|source| crate::error::Error::new(crate::error::Kind::BindFailed, source))?;
    Ok(UdpPair {
        upstream,
        local_port,
        client_addr,
        remote,
        last_activity: Instant::now(),
    })
}

fn handle_upstream_readable(
    key: (u16, SocketAddr),
    listeners: &Arc<Mutex<HashMap<u16, UdpSocket>>>,
    pairs: &mut HashMap<(u16, SocketAddr), UdpPair>,
    buf: &mut [u8],
) {
    loop {
        let Some(pair) = pairs.get_mut(&key) else {
            return;
        };
        let received = pair.upstream.recv_from(buf);
        let (n, _from) = match received {
            Ok(v) => v,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(err) => {
                tracing::debug!(?err, local_port = key.0, "udp recv from upstream failed");
                return;
            }
        };
        pair.touch(Instant::now());

        let mut listeners = listeners.lock();
        if let Some(listener) = listeners.get_mut(&key.0) {
            if let Err(err) = listener.send_to(&buf[..n], key.1) {
                tracing::debug!(?err, local_port = key.0, "udp reply send failed");
            }
        }
    }
}

fn sweep_idle_pairs(
    pairs: &mut HashMap<(u16, SocketAddr), UdpPair>,
    token_to_key: &mut HashMap<Token, (u16, SocketAddr)>,
    dispatcher: &mut ReadinessDispatcher,
    now: Instant,
    client_timeout: Duration,
) {
    let idle: Vec<(u16, SocketAddr)> = pairs
        .iter()
        .filter(|(_, pair)| pair.idle_since(now, client_timeout))
        .map(|(key, _)| *key)
        .collect();

    for key in idle {
        if let Some(mut pair) = pairs.remove(&key) {
            let _ = dispatcher.deregister(&mut pair.upstream);
        }
        token_to_key.retain(|_, k| *k != key);
    }
}
