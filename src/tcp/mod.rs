// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The TCP forwarding engine: an accept thread that owns every listening
//! socket plus a fixed pool of [`bridge::TcpDataBridge`] worker threads that
//! each own a shard of connected pairs.

mod bridge;
mod entry;
mod pair;

pub use entry::TcpEntry;
pub use pair::Side;

use crate::constants::{BRIDGE_COUNT, BUFFER_SOFT_CAP};
use crate::error::BoundaryError;
use crate::readiness::{Readiness, ReadinessDispatcher, ReadinessWaker};
use crate::resolver::{AddressResolver, Protocol, StdResolver};
use crate::routing::RoutingTable;
use bridge::{BridgeHandle, TcpDataBridge};
use mio::net::TcpListener;
use mio::Token;
use pair::ConnectedPair;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Tunables a caller can override via [`TcpForwarder::with_options`];
/// [`Default`] matches the fixed constants used by [`TcpForwarder::new`].
#[derive(Clone, Copy, Debug)]
pub struct ForwarderOptions {
    pub buffer_soft_cap: usize,
    pub bridge_count: usize,
}

impl Default for ForwarderOptions {
    fn default() -> Self {
        Self {
            buffer_soft_cap: BUFFER_SOFT_CAP,
            bridge_count: BRIDGE_COUNT,
        }
    }
}

struct Running {
    accept_handle: JoinHandle<()>,
    accept_registry: mio::Registry,
    accept_waker: ReadinessWaker,
    bridges: Vec<BridgeHandle>,
    bridge_handles: Vec<JoinHandle<()>>,
}

/// A user-space TCP port forwarder: `add_entry`/`remove_entry` manage the
/// routing table, `start`/`stop` manage the worker threads.
pub struct TcpForwarder {
    routing: Arc<RoutingTable<TcpEntry>>,
    listeners: Arc<Mutex<HashMap<u16, TcpListener>>>,
    resolver: Arc<dyn AddressResolver>,
    options: ForwarderOptions,
    next_pair_id: Arc<AtomicU64>,
    next_bridge: Arc<AtomicUsize>,
    stop_flag: Arc<AtomicBool>,
    running: Option<Running>,
}

impl TcpForwarder {
    pub fn new() -> Self {
        Self::with_options(Arc::new(StdResolver), ForwarderOptions::default())
    }

    pub fn with_options(resolver: Arc<dyn AddressResolver>, options: ForwarderOptions) -> Self {
        Self {
            routing: Arc::new(RoutingTable::new()),
            listeners: Arc::new(Mutex::new(HashMap::new())),
            resolver,
            options,
            next_pair_id: Arc::new(AtomicU64::new(0)),
            next_bridge: Arc::new(AtomicUsize::new(0)),
            stop_flag: Arc::new(AtomicBool::new(true)),
            running: None,
        }
    }

    /// Adds a forwarding rule from `local_port` to `remote_host:remote_port`.
    /// A second call for a `local_port` already present is a silent no-op:
    /// it does not replace the existing rule and is not an error.
    pub fn add_entry(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<(), BoundaryError> {
        let remote = self
            .resolver
            .resolve(Protocol::Tcp, remote_host, remote_port)
            .map_err(BoundaryError::from)?;

        if !self.routing.insert_if_absent(local_port, TcpEntry { remote }) {
            return Ok(());
        }

        if let Some(running) = &self.running {
            if let Err(err) = self.bind_and_register(local_port, &running.accept_registry) {
                self.routing.remove(local_port);
                return Err(err.into());
            }
            let _ = running.accept_waker.wake();
        }

        Ok(())
    }

    pub fn remove_entry(&self, local_port: u16) {
        self.routing.remove(local_port);
        if let Some(running) = &self.running {
            if let Some(mut listener) = self.listeners.lock().remove(&local_port) {
                let _ = running.accept_registry.deregister(&mut listener);
            }
        }
    }

    fn bind_and_register(
        &self,
        local_port: u16,
        registry: &mio::Registry,
    ) -> Result<(), crate::error::Error> {
        let socket = crate::socket::tcp_listener(crate::resolver::loopback(local_port))?;
        let mut listener = TcpListener::from_std(socket.into());
        registry
            .register(&mut listener, Token(local_port as usize), mio::Interest::READABLE)
            .map_err(|source| {
                crate::error::Error::new(crate::error::Kind::BindFailed, source)
            })?;
        self.listeners.lock().insert(local_port, listener);
        Ok(())
    }

    /// Starts the accept thread and the fixed bridge pool. Idempotent: a
    /// second call while already running does nothing.
    pub fn start(&mut self) -> Result<(), BoundaryError> {
        if self.running.is_some() {
            return Ok(());
        }
        self.stop_flag.store(false, Ordering::Release);

        let mut bridges = Vec::with_capacity(self.options.bridge_count);
        let mut bridge_handles = Vec::with_capacity(self.options.bridge_count);
        for index in 0..self.options.bridge_count {
            let (tx, rx) = mpsc::channel();
            let (worker, waker) = TcpDataBridge::new(rx, self.stop_flag.clone())
                .map_err(|_| BoundaryError::Unknown)?;
            let handle = std::thread::Builder::new()
                .name(format!("tcp-bridge-{index}"))
                .spawn(move || worker.run())
                .map_err(|_| BoundaryError::Unknown)?;
            bridges.push(BridgeHandle { sender: tx, waker });
            bridge_handles.push(handle);
        }

        let dispatcher = ReadinessDispatcher::new(256).map_err(|_| BoundaryError::Unknown)?;
        let accept_waker = dispatcher.waker();
        let accept_registry = dispatcher
            .registry()
            .try_clone()
            .map_err(|_| BoundaryError::Unknown)?;

        let mut existing_ports = Vec::new();
        self.routing.for_each(|port, _| existing_ports.push(port));
        for port in existing_ports {
            self.bind_and_register(port, &accept_registry)
                .map_err(|_| BoundaryError::BindFailed)?;
        }

        let accept_handle = {
            let listeners = self.listeners.clone();
            let routing = self.routing.clone();
            let bridges = bridges.clone();
            let next_pair_id = self.next_pair_id.clone();
            let next_bridge = self.next_bridge.clone();
            let stop_flag = self.stop_flag.clone();
            let buffer_soft_cap = self.options.buffer_soft_cap;
            std::thread::Builder::new()
                .name("tcp-accept".into())
                .spawn(move || {
                    accept_loop(
                        dispatcher,
                        listeners,
                        routing,
                        bridges,
                        next_pair_id,
                        next_bridge,
                        stop_flag,
                        buffer_soft_cap,
                    )
                })
                .map_err(|_| BoundaryError::Unknown)?
        };

        self.running = Some(Running {
            accept_handle,
            accept_registry,
            accept_waker,
            bridges,
            bridge_handles,
        });
        Ok(())
    }

    /// Stops the accept thread and every bridge worker, and closes all
    /// listening sockets. A forwarder stopped this way can be `start`ed
    /// again; the routing table survives a stop/start cycle.
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Release);
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.accept_waker.wake();
        for bridge in &running.bridges {
            let _ = bridge.waker.wake();
        }
        let _ = running.accept_handle.join();
        for handle in running.bridge_handles {
            let _ = handle.join();
        }
        self.listeners.lock().clear();
    }
}

impl Default for TcpForwarder {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TcpForwarder {
    fn drop(&mut self) {
        self.stop();
    }
}

#[allow(clippy::too_many_arguments)]
fn accept_loop(
    mut dispatcher: ReadinessDispatcher,
    listeners: Arc<Mutex<HashMap<u16, TcpListener>>>,
    routing: Arc<RoutingTable<TcpEntry>>,
    bridges: Vec<BridgeHandle>,
    next_pair_id: Arc<AtomicU64>,
    next_bridge: Arc<AtomicUsize>,
    stop_flag: Arc<AtomicBool>,
    buffer_soft_cap: usize,
) {
    while !stop_flag.load(Ordering::Acquire) {
        let notifications = match dispatcher.wait(Some(std::time::Duration::from_millis(200))) {
            Ok(n) => n,
            Err(err) => {
                tracing::warn!(?err, "tcp accept dispatcher wait failed");
                continue;
            }
        };

        for note in notifications {
            if !note.readiness.intersects(Readiness::READABLE | Readiness::ACCEPT_READY) {
                continue;
            }
            let local_port = note.token.0 as u16;
            accept_ready_connections(
                local_port,
                &listeners,
                &routing,
                &bridges,
                &next_pair_id,
                &next_bridge,
                buffer_soft_cap,
            );
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn accept_ready_connections(
    local_port: u16,
    listeners: &Arc<Mutex<HashMap<u16, TcpListener>>>,
    routing: &Arc<RoutingTable<TcpEntry>>,
    bridges: &[BridgeHandle],
    next_pair_id: &Arc<AtomicU64>,
    next_bridge: &Arc<AtomicUsize>,
    buffer_soft_cap: usize,
) {
    loop {
        let accepted = {
            let mut listeners = listeners.lock();
            let Some(listener) = listeners.get_mut(&local_port) else {
                return;
            };
            listener.accept()
        };

        let (client, _peer) = match accepted {
            Ok(pair) => pair,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(err) => {
                tracing::warn!(?err, local_port, "accept failed");
                return;
            }
        };

        let Some(entry) = routing.get_cloned(local_port) else {
            // Entry was removed between the readiness edge and this accept;
            // drop the connection silently.
            continue;
        };

        let upstream_socket = match crate::socket::tcp_connect(entry.remote) {
            Ok(socket) => socket,
            Err(err) => {
                tracing::warn!(?err, local_port, "upstream connect failed");
                continue;
            }
        };
        let upstream = mio::net::TcpStream::from_std(upstream_socket.into());

        let id = next_pair_id.fetch_add(1, Ordering::Relaxed);
        let index = next_bridge.fetch_add(1, Ordering::Relaxed) % bridges.len();
        let connected_pair = ConnectedPair::new(id, client, upstream, buffer_soft_cap);
        if bridges[index].dispatch(connected_pair).is_err() {
            tracing::warn!(local_port, "bridge channel closed, dropping connection");
        }
    }
}
