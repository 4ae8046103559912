//! In-process transport engine.
//!
//! Sessions live in one registry guarded by a mutex; every state change
//! notifies a single condvar that blocking operations wait on. Stream
//! sessions receive into a bounded byte pipe, message sessions into a
//! bounded queue of whole messages.
//!
//! Handshakes:
//! - client/server: the connector queues in the listener's backlog and is
//!   established when the listener accepts it
//! - rendezvous: established when the session bound at the target address
//!   is itself rendezvous-connecting back to this session's address

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::ring::RingBuffer;
use super::{Engine, OptionValue, Readiness, SocketHandle, SocketOption};
use crate::kind::Flavor;

/// Receive window of a stream session.
const STREAM_WINDOW: usize = 64 * 1024;

const EPHEMERAL_PORT_START: u16 = 40000;

/// Upper bound on how long a blocked operation sleeps before re-checking
/// deadlines.
const BLOCKING_RECHECK: Duration = Duration::from_millis(20);

/// Memory engine configuration.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Time after which a pending handshake fails with `TimedOut`.
    pub handshake_timeout: Duration,

    /// Initial receive buffer of a message session: bytes it can hold
    /// before senders would block.
    pub message_capacity: usize,

    /// Largest message accepted by `send` on a message session.
    pub max_message_size: usize,

    /// Maximum number of live sessions, if limited.
    pub max_sessions: Option<usize>,
}

impl MemoryConfig {
    /// 5 s handshake timeout, 64 KiB message limits, no session cap.
    pub fn new() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            message_capacity: 64 * 1024,
            max_message_size: 64 * 1024,
            max_sessions: None,
        }
    }

    /// Sets the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets the per-session message queue capacity in bytes.
    pub fn with_message_capacity(mut self, capacity: usize) -> Self {
        self.message_capacity = capacity;
        self
    }

    /// Sets the largest sendable message.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Caps the number of live sessions.
    pub fn with_max_sessions(mut self, limit: usize) -> Self {
        self.max_sessions = Some(limit);
        self
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters exposed for tests and diagnostics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    /// Sessions opened, including sessions created by accept.
    pub opened: u64,

    /// Invocations of `SocketHandle::close`, repeated calls included.
    pub close_calls: u64,

    /// Sessions currently alive.
    pub live: usize,
}

/// Engine whose sessions live in process memory.
#[derive(Clone)]
pub struct MemoryEngine {
    shared: Arc<Shared>,
}

impl MemoryEngine {
    /// Creates an engine with the given configuration.
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                next_id: AtomicU64::new(1),
                opened: AtomicU64::new(0),
                close_calls: AtomicU64::new(0),
                registry: Mutex::new(Registry::new()),
                changed: Condvar::new(),
            }),
        }
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &MemoryConfig {
        &self.shared.config
    }

    /// Returns a snapshot of the engine counters.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            opened: self.shared.opened.load(Ordering::Acquire),
            close_calls: self.shared.close_calls.load(Ordering::Acquire),
            live: self.shared.registry.lock().sessions.len(),
        }
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

impl fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("stats", &self.stats())
            .finish()
    }
}

impl Engine for MemoryEngine {
    fn open(&self, flavor: Flavor) -> io::Result<Box<dyn SocketHandle>> {
        let mut reg = self.shared.registry.lock();
        if let Some(limit) = self.shared.config.max_sessions {
            if reg.sessions.len() >= limit {
                return Err(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    "session limit reached",
                ));
            }
        }
        let id = self.shared.insert(&mut *reg, Session::new(flavor, &self.shared.config));
        log::trace!("opened session {} ({:?})", id, flavor);
        Ok(Box::new(MemoryHandle {
            id,
            flavor,
            shared: self.shared.clone(),
        }))
    }
}

struct Shared {
    config: MemoryConfig,
    next_id: AtomicU64,
    opened: AtomicU64,
    close_calls: AtomicU64,
    registry: Mutex<Registry>,
    changed: Condvar,
}

impl Shared {
    fn insert(&self, reg: &mut Registry, session: Session) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        reg.sessions.insert(id, session);
        self.opened.fetch_add(1, Ordering::AcqRel);
        id
    }

    /// Runs `attempt` until it yields a value. A non-blocking session gets
    /// `WouldBlock` instead of waiting.
    fn drive<T>(
        &self,
        id: u64,
        mut attempt: impl FnMut(&mut Registry) -> io::Result<Option<T>>,
    ) -> io::Result<T> {
        let mut reg = self.registry.lock();
        loop {
            if let Some(value) = attempt(&mut *reg)? {
                return Ok(value);
            }
            if !reg.session(id)?.blocking {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.changed.wait_for(&mut reg, BLOCKING_RECHECK);
        }
    }
}

struct Registry {
    sessions: HashMap<u64, Session>,
    bound: HashMap<(Flavor, SocketAddr), Vec<u64>>,
    next_port: u16,
}

impl Registry {
    fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            bound: HashMap::new(),
            next_port: EPHEMERAL_PORT_START,
        }
    }

    fn session(&self, id: u64) -> io::Result<&Session> {
        self.sessions.get(&id).ok_or_else(session_closed)
    }

    fn session_mut(&mut self, id: u64) -> io::Result<&mut Session> {
        self.sessions.get_mut(&id).ok_or_else(session_closed)
    }

    fn bind(&mut self, id: u64, addr: SocketAddr) -> io::Result<SocketAddr> {
        let (flavor, reuse) = {
            let session = self.session(id)?;
            if session.local.is_some() {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "already bound"));
            }
            (session.flavor, session.reuse_address)
        };

        let addr = if addr.port() == 0 {
            let port = self.next_port;
            self.next_port = self.next_port.wrapping_add(1).max(EPHEMERAL_PORT_START);
            SocketAddr::new(addr.ip(), port)
        } else {
            addr
        };

        let conflict = self.bound.get(&(flavor, addr)).is_some_and(|ids| {
            ids.iter().any(|other| {
                !reuse
                    || self
                        .sessions
                        .get(other)
                        .is_some_and(|s| !s.reuse_address)
            })
        });
        if conflict {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{} already in use", addr),
            ));
        }

        self.bound.entry((flavor, addr)).or_default().push(id);
        self.session_mut(id)?.local = Some(addr);
        Ok(addr)
    }

    fn bound_at(&self, flavor: Flavor, addr: SocketAddr) -> impl Iterator<Item = u64> + '_ {
        self.bound
            .get(&(flavor, addr))
            .into_iter()
            .flat_map(|ids| ids.iter().copied())
    }

    fn is_connecting(&self, id: u64) -> bool {
        self.sessions
            .get(&id)
            .is_some_and(|s| matches!(s.phase, Phase::Connecting { .. }))
    }

    fn poll_handshake(&mut self, id: u64) -> io::Result<Option<()>> {
        let session = self.session_mut(id)?;
        match session.phase {
            Phase::Established { .. } => Ok(Some(())),
            Phase::Connecting { deadline, .. } => {
                if Instant::now() >= deadline {
                    session.phase = Phase::Failed(io::ErrorKind::TimedOut);
                    Err(io::Error::new(io::ErrorKind::TimedOut, "handshake timed out"))
                } else {
                    Ok(None)
                }
            }
            Phase::Failed(kind) => Err(kind.into()),
            Phase::Idle | Phase::Listening { .. } => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no connect in progress",
            )),
        }
    }
}

struct Session {
    flavor: Flavor,
    blocking: bool,
    reuse_address: bool,
    rendezvous: bool,
    send_buffer: usize,
    receive_buffer: usize,
    local: Option<SocketAddr>,
    phase: Phase,
    inbox: Inbox,
    peer_closed: bool,
}

impl Session {
    fn new(flavor: Flavor, config: &MemoryConfig) -> Self {
        let (inbox, buffer) = match flavor {
            Flavor::Stream => (Inbox::Stream(Box::new(RingBuffer::new())), STREAM_WINDOW),
            Flavor::Message => (
                Inbox::Message {
                    queue: VecDeque::new(),
                    bytes: 0,
                },
                config.message_capacity,
            ),
        };
        Self {
            flavor,
            blocking: true,
            reuse_address: false,
            rendezvous: false,
            send_buffer: buffer,
            receive_buffer: buffer,
            local: None,
            phase: Phase::Idle,
            inbox,
            peer_closed: false,
        }
    }

    fn connecting_to(&self, target: SocketAddr) -> bool {
        matches!(self.phase, Phase::Connecting { target: t, .. } if t == target)
    }

    /// Bytes waiting in the inbox.
    fn queued(&self) -> usize {
        match &self.inbox {
            Inbox::Stream(pipe) => STREAM_WINDOW - pipe.remaining(),
            Inbox::Message { bytes, .. } => *bytes,
        }
    }

    /// Inbox bytes still accepted under the receive buffer size.
    fn room(&self) -> usize {
        self.receive_buffer.saturating_sub(self.queued())
    }
}

enum Phase {
    Idle,
    Listening {
        backlog: usize,
        queue: VecDeque<u64>,
    },
    Connecting {
        target: SocketAddr,
        deadline: Instant,
    },
    Established {
        peer: u64,
        peer_addr: SocketAddr,
    },
    Failed(io::ErrorKind),
}

enum Inbox {
    Stream(Box<RingBuffer<STREAM_WINDOW>>),
    Message {
        queue: VecDeque<Vec<u8>>,
        bytes: usize,
    },
}

impl Inbox {
    fn is_empty(&self) -> bool {
        match self {
            Inbox::Stream(pipe) => pipe.is_empty(),
            Inbox::Message { queue, .. } => queue.is_empty(),
        }
    }
}

fn session_closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "session closed")
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "session is not connected")
}

struct MemoryHandle {
    id: u64,
    flavor: Flavor,
    shared: Arc<Shared>,
}

impl fmt::Debug for MemoryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryHandle")
            .field("id", &self.id)
            .field("flavor", &self.flavor)
            .finish()
    }
}

impl SocketHandle for MemoryHandle {
    fn id(&self) -> u64 {
        self.id
    }

    fn flavor(&self) -> Flavor {
        self.flavor
    }

    fn set_blocking(&self, blocking: bool) -> io::Result<()> {
        let mut reg = self.shared.registry.lock();
        reg.session_mut(self.id)?.blocking = blocking;
        Ok(())
    }

    fn is_blocking(&self) -> bool {
        let reg = self.shared.registry.lock();
        reg.sessions.get(&self.id).is_some_and(|s| s.blocking)
    }

    fn set_option(&self, option: SocketOption, value: OptionValue) -> io::Result<()> {
        let mut reg = self.shared.registry.lock();
        let session = reg.session_mut(self.id)?;
        match (option, value) {
            (SocketOption::ReuseAddress, OptionValue::Bool(v)) => session.reuse_address = v,
            (SocketOption::Rendezvous, OptionValue::Bool(v)) => {
                if !matches!(session.phase, Phase::Idle) {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "rendezvous mode must be set before connect",
                    ));
                }
                session.rendezvous = v;
            }
            (SocketOption::SendBuffer | SocketOption::ReceiveBuffer, OptionValue::Size(0)) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{:?} must be non-zero", option),
                ));
            }
            (SocketOption::SendBuffer, OptionValue::Size(v)) => session.send_buffer = v,
            (SocketOption::ReceiveBuffer, OptionValue::Size(v)) => {
                // A stream inbox cannot grow past its pipe.
                session.receive_buffer = match session.flavor {
                    Flavor::Stream => v.min(STREAM_WINDOW),
                    Flavor::Message => v,
                };
            }
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{:?} does not take {:?}", option, value),
                ));
            }
        }
        Ok(())
    }

    fn option(&self, option: SocketOption) -> io::Result<OptionValue> {
        let reg = self.shared.registry.lock();
        let session = reg.session(self.id)?;
        Ok(match option {
            SocketOption::ReuseAddress => OptionValue::Bool(session.reuse_address),
            SocketOption::Rendezvous => OptionValue::Bool(session.rendezvous),
            SocketOption::SendBuffer => OptionValue::Size(session.send_buffer),
            SocketOption::ReceiveBuffer => OptionValue::Size(session.receive_buffer),
        })
    }

    fn bind(&self, addr: SocketAddr) -> io::Result<SocketAddr> {
        let mut reg = self.shared.registry.lock();
        let bound = reg.bind(self.id, addr)?;
        log::trace!("session {} bound to {}", self.id, bound);
        Ok(bound)
    }

    fn listen(&self, backlog: usize) -> io::Result<()> {
        let mut reg = self.shared.registry.lock();
        let session = reg.session_mut(self.id)?;
        if session.local.is_none() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "listen on unbound session"));
        }
        match session.phase {
            Phase::Idle => {
                session.phase = Phase::Listening {
                    backlog: backlog.max(1),
                    queue: VecDeque::new(),
                };
                Ok(())
            }
            Phase::Listening { .. } => Ok(()),
            _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "session is connecting or connected")),
        }
    }

    fn accept(&self) -> io::Result<Box<dyn SocketHandle>> {
        let shared = &self.shared;
        let id = shared.drive(self.id, |reg| {
            let (local, flavor) = {
                let listener = reg.session(self.id)?;
                if !matches!(listener.phase, Phase::Listening { .. }) {
                    return Err(io::Error::new(io::ErrorKind::InvalidInput, "session is not listening"));
                }
                (listener.local.ok_or_else(not_connected)?, listener.flavor)
            };

            // Connectors that timed out or closed while queued are skipped.
            let connector = loop {
                let next = match &mut reg.session_mut(self.id)?.phase {
                    Phase::Listening { queue, .. } => queue.pop_front(),
                    _ => None,
                };
                match next {
                    None => return Ok(None),
                    Some(c) if reg.is_connecting(c) => break c,
                    Some(_) => continue,
                }
            };
            let connector_addr = reg.session(connector)?.local.ok_or_else(not_connected)?;

            let mut server = Session::new(flavor, &shared.config);
            server.local = Some(local);
            server.phase = Phase::Established {
                peer: connector,
                peer_addr: connector_addr,
            };
            let server_id = shared.insert(reg, server);
            reg.session_mut(connector)?.phase = Phase::Established {
                peer: server_id,
                peer_addr: local,
            };
            shared.changed.notify_all();
            log::trace!(
                "session {} accepted {} as session {}",
                self.id,
                connector_addr,
                server_id
            );
            Ok(Some(server_id))
        })?;
        Ok(Box::new(MemoryHandle {
            id,
            flavor: self.flavor,
            shared: self.shared.clone(),
        }))
    }

    fn connect(&self, addr: SocketAddr) -> io::Result<bool> {
        let deadline = Instant::now() + self.shared.config.handshake_timeout;
        let blocking = {
            let mut reg = self.shared.registry.lock();
            let session = reg.session(self.id)?;
            match session.phase {
                Phase::Idle => {}
                Phase::Connecting { .. } => {
                    return Err(io::Error::new(io::ErrorKind::AlreadyExists, "connect in progress"));
                }
                Phase::Established { .. } => {
                    return Err(io::Error::new(io::ErrorKind::AlreadyExists, "already connected"));
                }
                Phase::Listening { .. } | Phase::Failed(_) => {
                    return Err(io::Error::new(io::ErrorKind::InvalidInput, "session cannot connect"));
                }
            }
            let (flavor, rendezvous, blocking, bound) =
                (session.flavor, session.rendezvous, session.blocking, session.local);
            let local = match bound {
                Some(local) => local,
                None => reg.bind(self.id, SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))?,
            };

            if rendezvous {
                let peer = reg.bound_at(flavor, addr).find(|p| {
                    reg.sessions
                        .get(p)
                        .is_some_and(|s| s.rendezvous && s.connecting_to(local))
                });
                if let Some(peer) = peer {
                    reg.session_mut(peer)?.phase = Phase::Established {
                        peer: self.id,
                        peer_addr: local,
                    };
                    reg.session_mut(self.id)?.phase = Phase::Established {
                        peer,
                        peer_addr: addr,
                    };
                    self.shared.changed.notify_all();
                    log::trace!("session {} rendezvous with {} established", self.id, addr);
                    return Ok(true);
                }
            } else {
                let listener = reg.bound_at(flavor, addr).find(|l| {
                    reg.sessions
                        .get(l)
                        .is_some_and(|s| matches!(s.phase, Phase::Listening { .. }))
                });
                let queued = match listener.and_then(|l| reg.sessions.get_mut(&l)) {
                    Some(Session {
                        phase: Phase::Listening { backlog, queue },
                        ..
                    }) if queue.len() < *backlog => {
                        queue.push_back(self.id);
                        true
                    }
                    _ => false,
                };
                if !queued {
                    reg.session_mut(self.id)?.phase = Phase::Failed(io::ErrorKind::ConnectionRefused);
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        format!("no listener accepting at {}", addr),
                    ));
                }
            }

            reg.session_mut(self.id)?.phase = Phase::Connecting {
                target: addr,
                deadline,
            };
            self.shared.changed.notify_all();
            blocking
        };

        if !blocking {
            return Ok(false);
        }
        self.shared
            .drive(self.id, |reg| reg.poll_handshake(self.id))
            .map(|()| true)
    }

    fn finish_connect(&self) -> io::Result<bool> {
        match self.shared.drive(self.id, |reg| reg.poll_handshake(self.id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let shared = &self.shared;
        shared.drive(self.id, |reg| {
            let session = reg.session(self.id)?;
            let Phase::Established { peer, .. } = session.phase else {
                return Err(not_connected());
            };
            let send_limit = session.send_buffer;
            if session.flavor == Flavor::Message
                && (buf.is_empty() || buf.len() > shared.config.max_message_size.min(send_limit))
            {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("message of {} bytes cannot be sent", buf.len()),
                ));
            }
            if buf.is_empty() {
                return Ok(Some(0));
            }

            let Some(receiver) = reg.sessions.get_mut(&peer) else {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer closed"));
            };
            let room = receiver.room();
            let sent = match &mut receiver.inbox {
                Inbox::Stream(pipe) => pipe.write(&buf[..buf.len().min(room).min(send_limit)]),
                Inbox::Message { queue, bytes } => {
                    // An oversized message still fits into an empty queue.
                    if *bytes > 0 && buf.len() > room {
                        0
                    } else {
                        queue.push_back(buf.to_vec());
                        *bytes += buf.len();
                        buf.len()
                    }
                }
            };
            if sent == 0 {
                return Ok(None);
            }
            shared.changed.notify_all();
            Ok(Some(sent))
        })
    }

    fn receive(&self, buf: &mut [u8]) -> io::Result<usize> {
        let shared = &self.shared;
        shared.drive(self.id, |reg| {
            let session = reg.session_mut(self.id)?;
            if !matches!(session.phase, Phase::Established { .. }) {
                return Err(not_connected());
            }
            let peer_closed = session.peer_closed;
            let received = match &mut session.inbox {
                Inbox::Stream(pipe) if !pipe.is_empty() => Some(pipe.read(buf)),
                Inbox::Message { queue, bytes, .. } => match queue.pop_front() {
                    Some(message) => {
                        *bytes -= message.len();
                        // Like a datagram, the tail of an oversized message is dropped.
                        let n = message.len().min(buf.len());
                        buf[..n].copy_from_slice(&message[..n]);
                        Some(n)
                    }
                    None => None,
                },
                Inbox::Stream(_) => None,
            };
            match received {
                Some(n) => {
                    shared.changed.notify_all();
                    Ok(Some(n))
                }
                None if peer_closed => Ok(Some(0)),
                None => Ok(None),
            }
        })
    }

    fn readiness(&self) -> Readiness {
        let reg = self.shared.registry.lock();
        let Some(session) = reg.sessions.get(&self.id) else {
            return Readiness::default();
        };
        let mut readiness = Readiness::default();
        match &session.phase {
            Phase::Idle => {}
            Phase::Listening { queue, .. } => {
                readiness.acceptable = queue.iter().any(|c| reg.is_connecting(*c));
            }
            Phase::Connecting { deadline, .. } => {
                readiness.connect_failed = Instant::now() >= *deadline;
            }
            Phase::Failed(_) => readiness.connect_failed = true,
            Phase::Established { peer, .. } => {
                readiness.connect_finished = true;
                readiness.readable = !session.inbox.is_empty() || session.peer_closed;
                // A vanished peer reads as writable so the next send reports the error.
                readiness.writable = reg.sessions.get(peer).is_none_or(|p| p.room() > 0);
            }
        }
        readiness
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        let reg = self.shared.registry.lock();
        reg.sessions.get(&self.id).and_then(|s| s.local)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        let reg = self.shared.registry.lock();
        match reg.sessions.get(&self.id)?.phase {
            Phase::Established { peer_addr, .. } => Some(peer_addr),
            _ => None,
        }
    }

    fn close(&self) -> io::Result<()> {
        self.shared.close_calls.fetch_add(1, Ordering::AcqRel);
        let mut reg = self.shared.registry.lock();
        let Some(session) = reg.sessions.remove(&self.id) else {
            return Ok(());
        };

        if let Some(local) = session.local {
            let key = (session.flavor, local);
            if let Some(ids) = reg.bound.get_mut(&key) {
                ids.retain(|id| *id != self.id);
                if ids.is_empty() {
                    reg.bound.remove(&key);
                }
            }
        }
        match session.phase {
            Phase::Established { peer, .. } => {
                if let Some(peer) = reg.sessions.get_mut(&peer) {
                    peer.peer_closed = true;
                }
            }
            Phase::Listening { queue, .. } => {
                for connector in queue {
                    if let Some(c) = reg.sessions.get_mut(&connector) {
                        if matches!(c.phase, Phase::Connecting { .. }) {
                            c.phase = Phase::Failed(io::ErrorKind::ConnectionRefused);
                        }
                    }
                }
            }
            _ => {}
        }
        self.shared.changed.notify_all();
        log::trace!("session {} closed", self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn localhost(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn listener(engine: &MemoryEngine, flavor: Flavor) -> (Box<dyn SocketHandle>, SocketAddr) {
        let handle = engine.open(flavor).unwrap();
        let addr = handle.bind(localhost(0)).unwrap();
        handle.listen(8).unwrap();
        (handle, addr)
    }

    fn connected_pair(engine: &MemoryEngine, flavor: Flavor) -> (Box<dyn SocketHandle>, Box<dyn SocketHandle>) {
        let (server, addr) = listener(engine, flavor);
        let client = engine.open(flavor).unwrap();
        client.set_blocking(false).unwrap();
        assert!(!client.connect(addr).unwrap());
        let accepted = server.accept().unwrap();
        assert!(client.finish_connect().unwrap());
        (client, accepted)
    }

    #[test]
    fn test_open_and_close_stats() {
        let engine = MemoryEngine::default();
        let handle = engine.open(Flavor::Stream).unwrap();
        assert_eq!(engine.stats().live, 1);

        handle.close().unwrap();
        handle.close().unwrap();
        let stats = engine.stats();
        assert_eq!(stats.opened, 1);
        assert_eq!(stats.close_calls, 2);
        assert_eq!(stats.live, 0);
    }

    #[test]
    fn test_session_limit() {
        let engine = MemoryEngine::new(MemoryConfig::new().with_max_sessions(1));
        let _first = engine.open(Flavor::Stream).unwrap();
        let err = engine.open(Flavor::Stream).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::OutOfMemory);
    }

    #[test]
    fn test_bind_conflict_and_reuse() {
        let engine = MemoryEngine::default();
        let a = engine.open(Flavor::Stream).unwrap();
        let b = engine.open(Flavor::Stream).unwrap();
        a.bind(localhost(7000)).unwrap();
        assert_eq!(b.bind(localhost(7000)).unwrap_err().kind(), io::ErrorKind::AddrInUse);

        let c = engine.open(Flavor::Stream).unwrap();
        let d = engine.open(Flavor::Stream).unwrap();
        for h in [&c, &d] {
            h.set_option(SocketOption::ReuseAddress, OptionValue::Bool(true)).unwrap();
        }
        c.bind(localhost(7001)).unwrap();
        d.bind(localhost(7001)).unwrap();

        // Same port, other flavor: separate namespace.
        let m = engine.open(Flavor::Message).unwrap();
        m.bind(localhost(7000)).unwrap();
    }

    #[test]
    fn test_connect_refused_without_listener() {
        let engine = MemoryEngine::default();
        let client = engine.open(Flavor::Stream).unwrap();
        let err = client.connect(localhost(7100)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
        assert!(client.readiness().connect_failed);
    }

    #[test]
    fn test_handshake_completes_on_accept() {
        let engine = MemoryEngine::default();
        let (server, addr) = listener(&engine, Flavor::Stream);
        server.set_blocking(false).unwrap();
        assert_eq!(server.accept().unwrap_err().kind(), io::ErrorKind::WouldBlock);

        let client = engine.open(Flavor::Stream).unwrap();
        client.set_blocking(false).unwrap();
        assert!(!client.connect(addr).unwrap());
        assert!(!client.finish_connect().unwrap());
        assert!(server.readiness().acceptable);

        let accepted = server.accept().unwrap();
        assert!(client.finish_connect().unwrap());
        assert_eq!(accepted.peer_addr(), client.local_addr());
        assert_eq!(client.peer_addr(), Some(addr));
    }

    #[test]
    fn test_blocking_connect_waits_for_accept() {
        let engine = MemoryEngine::default();
        let (server, addr) = listener(&engine, Flavor::Stream);
        let client = engine.open(Flavor::Stream).unwrap();

        let connector = thread::spawn(move || client.connect(addr).map(|done| (done, client)));
        let accepted = server.accept().unwrap();
        let (done, client) = connector.join().unwrap().unwrap();
        assert!(done);
        assert!(client.readiness().connect_finished);
        assert!(accepted.readiness().writable);
    }

    #[test]
    fn test_handshake_timeout() {
        let engine = MemoryEngine::new(MemoryConfig::new().with_handshake_timeout(Duration::from_millis(30)));
        let (_server, addr) = listener(&engine, Flavor::Stream);
        let client = engine.open(Flavor::Stream).unwrap();
        client.set_blocking(false).unwrap();
        client.connect(addr).unwrap();

        thread::sleep(Duration::from_millis(60));
        assert!(client.readiness().connect_failed);
        assert_eq!(client.finish_connect().unwrap_err().kind(), io::ErrorKind::TimedOut);
        assert_eq!(client.finish_connect().unwrap_err().kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_closing_listener_refuses_backlog() {
        let engine = MemoryEngine::default();
        let (server, addr) = listener(&engine, Flavor::Stream);
        let client = engine.open(Flavor::Stream).unwrap();
        client.set_blocking(false).unwrap();
        client.connect(addr).unwrap();

        server.close().unwrap();
        assert_eq!(
            client.finish_connect().unwrap_err().kind(),
            io::ErrorKind::ConnectionRefused
        );
    }

    #[test]
    fn test_rendezvous_is_symmetric() {
        let engine = MemoryEngine::default();
        let a = engine.open(Flavor::Stream).unwrap();
        let b = engine.open(Flavor::Stream).unwrap();
        for h in [&a, &b] {
            h.set_option(SocketOption::Rendezvous, OptionValue::Bool(true)).unwrap();
            h.set_blocking(false).unwrap();
        }
        let a_addr = a.bind(localhost(7200)).unwrap();
        let b_addr = b.bind(localhost(7201)).unwrap();

        assert!(!a.connect(b_addr).unwrap());
        assert!(b.connect(a_addr).unwrap());
        assert!(a.finish_connect().unwrap());
        assert_eq!(a.peer_addr(), Some(b_addr));
        assert_eq!(b.peer_addr(), Some(a_addr));
    }

    #[test]
    fn test_stream_transfer_and_eof() {
        let engine = MemoryEngine::default();
        let (client, server) = connected_pair(&engine, Flavor::Stream);
        server.set_blocking(false).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(server.receive(&mut buf).unwrap_err().kind(), io::ErrorKind::WouldBlock);

        assert_eq!(client.send(b"hello").unwrap(), 5);
        assert!(server.readiness().readable);
        assert_eq!(server.receive(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");

        client.close().unwrap();
        assert!(server.readiness().readable);
        assert_eq!(server.receive(&mut buf).unwrap(), 0);
        assert_eq!(server.send(b"x").unwrap_err().kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_stream_backpressure() {
        let engine = MemoryEngine::default();
        let (client, _server) = connected_pair(&engine, Flavor::Stream);

        let chunk = vec![0x5A; STREAM_WINDOW + 100];
        assert_eq!(client.send(&chunk).unwrap(), STREAM_WINDOW);
        assert!(!client.readiness().writable);
        assert_eq!(client.send(b"more").unwrap_err().kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_receive_buffer_caps_stream_window() {
        let engine = MemoryEngine::default();
        let (client, server) = connected_pair(&engine, Flavor::Stream);
        server.set_option(SocketOption::ReceiveBuffer, OptionValue::Size(16)).unwrap();

        assert_eq!(client.send(&[7u8; 100]).unwrap(), 16);
        assert!(!client.readiness().writable);
        assert_eq!(client.send(b"more").unwrap_err().kind(), io::ErrorKind::WouldBlock);

        let mut buf = [0u8; 8];
        assert_eq!(server.receive(&mut buf).unwrap(), 8);
        assert!(client.readiness().writable);
        assert_eq!(client.send(&[7u8; 100]).unwrap(), 8);
    }

    #[test]
    fn test_stream_buffer_options() {
        let engine = MemoryEngine::default();
        let (client, server) = connected_pair(&engine, Flavor::Stream);
        client.set_option(SocketOption::SendBuffer, OptionValue::Size(8)).unwrap();
        assert_eq!(client.send(&[1u8; 100]).unwrap(), 8);

        server
            .set_option(SocketOption::ReceiveBuffer, OptionValue::Size(STREAM_WINDOW * 4))
            .unwrap();
        assert_eq!(
            server.option(SocketOption::ReceiveBuffer).unwrap(),
            OptionValue::Size(STREAM_WINDOW)
        );
        let err = server
            .set_option(SocketOption::SendBuffer, OptionValue::Size(0))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_message_buffer_options() {
        let engine = MemoryEngine::default();
        let (client, server) = connected_pair(&engine, Flavor::Message);
        server.set_option(SocketOption::ReceiveBuffer, OptionValue::Size(10)).unwrap();

        assert_eq!(client.send(&[1u8; 8]).unwrap(), 8);
        assert_eq!(client.send(&[2u8; 8]).unwrap_err().kind(), io::ErrorKind::WouldBlock);
        assert_eq!(client.send(&[2u8; 2]).unwrap(), 2);
        assert!(!client.readiness().writable);

        client.set_option(SocketOption::SendBuffer, OptionValue::Size(4)).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(server.receive(&mut buf).unwrap(), 8);
        assert_eq!(server.receive(&mut buf).unwrap(), 2);
        assert_eq!(client.send(&[3u8; 8]).unwrap_err().kind(), io::ErrorKind::InvalidInput);
        assert_eq!(client.send(&[3u8; 4]).unwrap(), 4);
    }

    #[test]
    fn test_message_boundaries() {
        let engine = MemoryEngine::default();
        let (client, server) = connected_pair(&engine, Flavor::Message);

        client.send(b"first").unwrap();
        client.send(b"second message").unwrap();
        assert_eq!(client.send(b"").unwrap_err().kind(), io::ErrorKind::InvalidInput);

        let mut buf = [0u8; 64];
        let n = server.receive(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"first");
        let n = server.receive(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"second message");
    }

    #[test]
    fn test_blocked_receive_unblocks_on_close() {
        let engine = MemoryEngine::default();
        let (client, _server) = connected_pair(&engine, Flavor::Stream);
        client.set_blocking(true).unwrap();
        let client: Arc<dyn SocketHandle> = Arc::from(client);

        let reader = {
            let client = client.clone();
            thread::spawn(move || {
                let mut buf = [0u8; 8];
                client.receive(&mut buf)
            })
        };
        thread::sleep(Duration::from_millis(50));
        client.close().unwrap();
        let err = reader.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn test_rendezvous_option_locked_after_connect() {
        let engine = MemoryEngine::default();
        let (_server, addr) = listener(&engine, Flavor::Stream);
        let client = engine.open(Flavor::Stream).unwrap();
        client.set_blocking(false).unwrap();
        client.connect(addr).unwrap();
        let err = client
            .set_option(SocketOption::Rendezvous, OptionValue::Bool(true))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
