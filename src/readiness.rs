// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The `ReadinessDispatcher` abstraction from the design: edge-triggered,
//! per-socket readiness notification, implemented once over `mio::Poll` and
//! shared by the TCP bridge loop, the TCP accept loop, and the UDP worker
//! loop. `mio` gives us edge-triggered semantics uniformly across
//! `epoll`/`kqueue`/IOCP, which is exactly the contract spec'd: a later
//! signal only fires for interest that arrives after a transition back to
//! not-ready.

use bitflags::bitflags;
use mio::{event::Source, Events, Interest, Poll, Registry, Token};
use std::{io, time::Duration};

bitflags! {
    /// The readiness edges a registration can be interested in, and the set
    /// a single wakeup reports for one socket.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Readiness: u8 {
        const READABLE = 0b0001;
        const WRITABLE = 0b0010;
        const CLOSED = 0b0100;
        /// Semantically identical to `READABLE` on a listening socket; kept
        /// as a distinct name because the design calls it out as its own
        /// interest.
        const ACCEPT_READY = 0b1000;
    }
}

impl Readiness {
    fn from_mio(event: &mio::event::Event) -> Self {
        let mut flags = Readiness::empty();
        if event.is_readable() {
            flags |= Readiness::READABLE | Readiness::ACCEPT_READY;
        }
        if event.is_writable() {
            flags |= Readiness::WRITABLE;
        }
        if event.is_read_closed() || event.is_write_closed() || event.is_error() {
            flags |= Readiness::CLOSED;
        }
        flags
    }

    fn to_interest(self) -> Option<Interest> {
        let mut interest = None;
        let mut add = |i: Interest| {
            interest = Some(match interest {
                Some(existing) => existing.add(i),
                None => i,
            });
        };
        if self.intersects(Readiness::READABLE | Readiness::ACCEPT_READY) {
            add(Interest::READABLE);
        }
        if self.contains(Readiness::WRITABLE) {
            add(Interest::WRITABLE);
        }
        interest
    }
}

/// One readiness notification delivered by [`ReadinessDispatcher::wait`].
#[derive(Clone, Copy, Debug)]
pub struct Notification {
    pub token: Token,
    pub readiness: Readiness,
}

/// Token reserved for the dispatcher's own wake source (used to interrupt a
/// blocked `wait` from another thread, e.g. on `stop()`).
const WAKE_TOKEN: Token = Token(usize::MAX);

/// A readiness dispatcher private to one worker thread (one `TcpDataBridge`,
/// the TCP accept loop, or the single UDP worker). `Registry` handles are
/// `Clone` and safe to use concurrently from other threads (the
/// control-plane calling `register`/`deregister` while the worker blocks in
/// `wait`), matching the design's requirement that `add_entry`/
/// `remove_entry` never need to synchronize with the worker's wait loop
/// beyond the shared routing-table mutex.
pub struct ReadinessDispatcher {
    poll: Poll,
    waker: std::sync::Arc<mio::Waker>,
    events: Events,
}

impl ReadinessDispatcher {
    pub fn new(capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = std::sync::Arc::new(mio::Waker::new(poll.registry(), WAKE_TOKEN)?);
        Ok(Self {
            poll,
            waker,
            events: Events::with_capacity(capacity.max(1)),
        })
    }

    /// A cloneable handle usable to register/reregister/deregister sources
    /// from any thread, including while this dispatcher's owning thread is
    /// blocked inside `wait`.
    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// A handle that can wake a blocked `wait` from any thread.
    pub fn waker(&self) -> ReadinessWaker {
        ReadinessWaker(self.waker.clone())
    }

    pub fn register<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interest: Readiness,
    ) -> io::Result<()> {
        let interest = interest.to_interest().unwrap_or(Interest::READABLE);
        self.poll.registry().register(source, token, interest)
    }

    /// Re-registering replaces the previous mask, matching the design's
    /// edge-triggered re-arm contract.
    pub fn reregister<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interest: Readiness,
    ) -> io::Result<()> {
        let interest = interest.to_interest().unwrap_or(Interest::READABLE);
        self.poll.registry().reregister(source, token, interest)
    }

    pub fn deregister<S: Source + ?Sized>(&self, source: &mut S) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Blocks until at least one registered source is ready or `timeout`
    /// elapses, then returns every notification observed this wakeup
    /// (`consume` folded in: `mio` hands us the accumulated edge set per
    /// source in one batch, so there is no separate consume step).
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Notification>> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(err) => return Err(err),
        }

        let mut out = Vec::with_capacity(self.events.iter().count());
        for event in self.events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            out.push(Notification {
                token: event.token(),
                readiness: Readiness::from_mio(event),
            });
        }
        Ok(out)
    }
}

/// A thread-safe handle that interrupts a blocked [`ReadinessDispatcher::wait`].
#[derive(Clone)]
pub struct ReadinessWaker(std::sync::Arc<mio::Waker>);

impl ReadinessWaker {
    pub fn wake(&self) -> io::Result<()> {
        self.0.wake()
    }
}

impl std::ops::Deref for ReadinessWaker {
    type Target = mio::Waker;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
