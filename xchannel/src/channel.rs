//! Socket channels.
//!
//! A [`Channel`] wraps one engine session together with its [`Kind`] and
//! connection state. All operations take `&self`; a channel is shared
//! between threads through `Arc`.
//!
//! Locking:
//! - `inner` guards the connection state. It is never held across a
//!   blocking engine call, so `close` can always make progress.
//! - `connect_lock` is held for the duration of an engine connect and by
//!   `configure_blocking`, so the blocking mode cannot change under an
//!   in-flight handshake.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::engine::{OptionValue, SocketHandle, SocketOption};
use crate::error::{Error, Result};
use crate::kind::{Flavor, Kind};
use crate::ops::Ops;
use crate::provider::Provider;
use crate::rendezvous;
use crate::state::ConnectionState;

/// Outcome of a read, write, send or receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// This many bytes were transferred.
    Bytes(usize),

    /// Non-blocking channel could not make progress.
    WouldBlock,

    /// Peer shut down the connection in order.
    Eof,
}

impl Transfer {
    /// Returns the byte count, if bytes were transferred.
    pub fn bytes(self) -> Option<usize> {
        match self {
            Transfer::Bytes(n) => Some(n),
            _ => None,
        }
    }

    /// True for [`Transfer::WouldBlock`].
    pub fn is_would_block(self) -> bool {
        self == Transfer::WouldBlock
    }

    /// True for [`Transfer::Eof`].
    pub fn is_eof(self) -> bool {
        self == Transfer::Eof
    }
}

struct Inner {
    state: ConnectionState,
    blocking: bool,
    listening: bool,
    /// An engine connect call is in flight.
    connecting: bool,
    /// Engine error kind of a failed handshake.
    failure: Option<io::ErrorKind>,
}

impl Inner {
    fn failure(&self) -> Error {
        let kind = self.failure.unwrap_or(io::ErrorKind::ConnectionAborted);
        Error::ConnectionFailed(io::Error::new(kind, "handshake failed"))
    }

    /// Moves to `next`, refusing moves the state machine does not allow.
    fn transition(&mut self, op: &'static str, next: ConnectionState) -> Result<()> {
        if !self.state.can_transition(next) {
            return Err(Error::IllegalState {
                op,
                state: self.state,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Outcome for a connect or finish_connect that finds the state
    /// already settled by another thread.
    fn settled(&self, op: &'static str) -> Result<bool> {
        match self.state {
            ConnectionState::Connected => Ok(true),
            ConnectionState::Closed => Err(Error::ChannelClosed),
            ConnectionState::ConnectFailed => Err(self.failure()),
            state => Err(Error::IllegalState { op, state }),
        }
    }

    fn fail(&mut self, op: &'static str, err: io::Error) -> Result<bool> {
        self.transition(op, ConnectionState::ConnectFailed)?;
        self.failure = Some(err.kind());
        Err(Error::ConnectionFailed(err))
    }
}

/// Channel over one transport engine session.
pub struct Channel {
    provider: Provider,
    handle: Box<dyn SocketHandle>,
    kind: Kind,
    inner: Mutex<Inner>,
    connect_lock: Mutex<()>,
    closed: AtomicBool,
}

impl Channel {
    fn new(provider: Provider, handle: Box<dyn SocketHandle>, kind: Kind, state: ConnectionState) -> Self {
        let blocking = provider.config().blocking;
        Self {
            provider,
            handle,
            kind,
            inner: Mutex::new(Inner {
                state,
                blocking,
                listening: false,
                connecting: false,
                failure: None,
            }),
            connect_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Wraps a freshly opened, unconnected handle.
    pub(crate) fn open(provider: Provider, handle: Box<dyn SocketHandle>, kind: Kind) -> Result<Arc<Channel>> {
        // On any error below, dropping `channel` releases the handle.
        let channel = Channel::new(provider, handle, kind, ConnectionState::Unconnected);
        if kind == Kind::Rendezvous {
            rendezvous::prepare(channel.handle.as_ref())?;
        }
        channel.handle.set_blocking(channel.provider.config().blocking)?;
        log::debug!("channel {} opened as {:?}", channel.id(), kind);
        Ok(Arc::new(channel))
    }

    /// Wraps a handle produced by accept; it is already connected.
    fn accepted(provider: Provider, handle: Box<dyn SocketHandle>, kind: Kind) -> Result<Arc<Channel>> {
        let channel = Channel::new(provider, handle, kind, ConnectionState::Connected);
        channel.handle.set_blocking(channel.provider.config().blocking)?;
        Ok(Arc::new(channel))
    }

    /// Engine session id of the underlying handle.
    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    /// Role of this channel.
    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// Transport flavor of the underlying session.
    pub fn flavor(&self) -> Flavor {
        self.handle.flavor()
    }

    /// Provider that created this channel.
    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// False once `close` has run.
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Whether operations block.
    pub fn is_blocking(&self) -> bool {
        self.inner.lock().blocking
    }

    /// True only once the handshake has finished.
    pub fn is_connect_finished(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// True while a connect has started but not finished.
    pub fn is_connection_pending(&self) -> bool {
        self.state() == ConnectionState::ConnectPending
    }

    /// True after a successful `listen`.
    pub fn is_listening(&self) -> bool {
        self.inner.lock().listening
    }

    /// Selector operations this channel may register interest in.
    pub fn valid_ops(&self) -> Ops {
        self.kind.valid_ops()
    }

    /// Bound local address.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.handle.local_addr()
    }

    /// Peer address once connected.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.handle.peer_addr()
    }

    /// Switches between blocking and non-blocking mode.
    ///
    /// Waits for an in-flight blocking connect to return first.
    pub fn configure_blocking(&self, blocking: bool) -> Result<()> {
        let _in_flight = self.connect_lock.lock();
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::Closed {
            return Err(Error::ChannelClosed);
        }
        self.handle.set_blocking(blocking)?;
        inner.blocking = blocking;
        log::trace!("channel {} blocking={}", self.id(), blocking);
        Ok(())
    }

    /// Sets a socket option on the underlying session.
    pub fn set_option(&self, option: SocketOption, value: OptionValue) -> Result<()> {
        self.ensure_open()?;
        self.handle.set_option(option, value)?;
        Ok(())
    }

    /// Reads a socket option from the underlying session.
    pub fn option(&self, option: SocketOption) -> Result<OptionValue> {
        self.ensure_open()?;
        Ok(self.handle.option(option)?)
    }

    /// Binds to a local address, returning the address actually bound.
    pub fn bind(&self, addr: SocketAddr) -> Result<SocketAddr> {
        {
            let inner = self.inner.lock();
            match inner.state {
                ConnectionState::Unconnected => {}
                ConnectionState::Closed => return Err(Error::ChannelClosed),
                state => return Err(Error::IllegalState { op: "bind", state }),
            }
        }
        let bound = self.handle.bind(addr)?;
        log::debug!("channel {} bound to {}", self.id(), bound);
        Ok(bound)
    }

    /// Starts listening. A zero backlog uses the provider's default.
    pub fn listen(&self, backlog: usize) -> Result<()> {
        if self.kind != Kind::Accept {
            return Err(self.unsupported("listen"));
        }
        let backlog = if backlog == 0 {
            self.provider.config().listen_backlog
        } else {
            backlog
        };
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::Closed {
            return Err(Error::ChannelClosed);
        }
        self.handle.listen(backlog)?;
        inner.listening = true;
        log::debug!("channel {} listening (backlog {})", self.id(), backlog);
        Ok(())
    }

    /// Accepts a pending connection.
    ///
    /// Returns `Ok(None)` when non-blocking and nothing is pending.
    pub fn accept(&self) -> Result<Option<Arc<Channel>>> {
        if self.kind != Kind::Accept {
            return Err(self.unsupported("accept"));
        }
        {
            let inner = self.inner.lock();
            if inner.state == ConnectionState::Closed {
                return Err(Error::ChannelClosed);
            }
            if !inner.listening {
                return Err(Error::NotListening);
            }
        }
        match self.handle.accept() {
            Ok(handle) => {
                let channel = Channel::accepted(
                    self.provider.clone(),
                    handle,
                    Kind::connector(self.flavor()),
                )?;
                log::debug!(
                    "channel {} accepted channel {} from {:?}",
                    self.id(),
                    channel.id(),
                    channel.remote_addr()
                );
                Ok(Some(channel))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(self.engine_error(e)),
        }
    }

    /// Connects to `addr`.
    ///
    /// In blocking mode this returns `Ok(true)` once connected. In
    /// non-blocking mode it starts the handshake and returns whether it
    /// already finished; poll [`finish_connect`](Self::finish_connect) after.
    pub fn connect(&self, addr: SocketAddr) -> Result<bool> {
        {
            let mut inner = self.inner.lock();
            match inner.state {
                ConnectionState::Closed => return Err(Error::ChannelClosed),
                _ if !self.kind.can_connect() => return Err(self.unsupported("connect")),
                ConnectionState::Unconnected => {}
                ConnectionState::ConnectPending => return Err(Error::ConnectionPending),
                ConnectionState::Connected => return Err(Error::AlreadyConnected),
                ConnectionState::ConnectFailed => return Err(inner.failure()),
            }
            inner.transition("connect", ConnectionState::ConnectPending)?;
            inner.connecting = true;
        }
        log::debug!("channel {} connecting to {}", self.id(), addr);

        let _in_flight = self.connect_lock.lock();
        let outcome = self.handle.connect(addr);

        let mut inner = self.inner.lock();
        inner.connecting = false;
        if inner.state != ConnectionState::ConnectPending {
            return inner.settled("connect");
        }
        match outcome {
            Ok(true) => {
                inner.transition("connect", ConnectionState::Connected)?;
                log::debug!("channel {} connected to {}", self.id(), addr);
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(e) => {
                log::debug!("channel {} connect to {} failed: {}", self.id(), addr, e);
                inner.fail("connect", e)
            }
        }
    }

    /// Completes a non-blocking connect.
    ///
    /// Returns `true` once connected and `false` while the handshake is
    /// pending. A definitive failure moves the channel to
    /// `ConnectFailed`; this and every later operation but `close` then
    /// fail with [`Error::ConnectionFailed`].
    ///
    /// While the `connect` call itself is still running on another thread
    /// the handshake counts as pending and this returns `false`.
    pub fn finish_connect(&self) -> Result<bool> {
        {
            let inner = self.inner.lock();
            if inner.state != ConnectionState::ConnectPending {
                return inner.settled("finish_connect");
            }
            if inner.connecting {
                return Ok(false);
            }
        }

        let outcome = self.handle.finish_connect();

        // Re-check: close or another finisher may have run meanwhile.
        let mut inner = self.inner.lock();
        if inner.state != ConnectionState::ConnectPending {
            return inner.settled("finish_connect");
        }
        match outcome {
            Ok(true) => {
                inner.transition("finish_connect", ConnectionState::Connected)?;
                log::debug!("channel {} connected to {:?}", self.id(), self.remote_addr());
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(e) => {
                log::debug!("channel {} handshake failed: {}", self.id(), e);
                inner.fail("finish_connect", e)
            }
        }
    }

    /// Reads from a stream channel.
    pub fn read(&self, buf: &mut [u8]) -> Result<Transfer> {
        self.receive_from_engine("read", Flavor::Stream, buf)
    }

    /// Writes to a stream channel.
    pub fn write(&self, buf: &[u8]) -> Result<Transfer> {
        self.send_to_engine("write", Flavor::Stream, buf)
    }

    /// Receives one message. A message longer than `buf` is truncated.
    pub fn receive(&self, buf: &mut [u8]) -> Result<Transfer> {
        self.receive_from_engine("receive", Flavor::Message, buf)
    }

    /// Sends one whole message.
    pub fn send(&self, message: &[u8]) -> Result<Transfer> {
        self.send_to_engine("send", Flavor::Message, message)
    }

    /// Closes the channel and releases its handle.
    ///
    /// Idempotent: only the first call releases the handle, later calls
    /// return `Ok(())`. An engine error from the release is returned by
    /// that first call; the channel is closed either way.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::Closed {
            return Ok(());
        }
        inner.transition("close", ConnectionState::Closed)?;
        inner.listening = false;
        self.closed.store(true, Ordering::Release);
        let released = self.handle.close();
        drop(inner);

        match released {
            Ok(()) => {
                log::debug!("channel {} closed", self.id());
                Ok(())
            }
            Err(e) => {
                log::warn!("channel {} closed, engine release failed: {}", self.id(), e);
                Err(Error::Io(e))
            }
        }
    }

    /// Readiness of this channel translated into selector operations.
    pub(crate) fn ready_ops(&self) -> Ops {
        if !self.is_open() {
            return Ops::NONE;
        }
        let readiness = self.handle.readiness();
        let inner = self.inner.lock();
        let mut ops = Ops::NONE;
        match (self.kind, inner.state) {
            (Kind::Accept, _) => {
                if inner.listening && readiness.acceptable {
                    ops |= Ops::ACCEPT;
                }
            }
            (_, ConnectionState::ConnectPending) => {
                if readiness.connect_finished || readiness.connect_failed {
                    ops |= Ops::CONNECT;
                }
            }
            (_, ConnectionState::ConnectFailed) => ops |= Ops::CONNECT,
            (_, ConnectionState::Connected) => {
                if readiness.readable {
                    ops |= Ops::READ;
                }
                if readiness.writable {
                    ops |= Ops::WRITE;
                }
            }
            _ => {}
        }
        log::trace!("channel {} readiness {:?} -> {:?}", self.id(), readiness, ops);
        ops & self.valid_ops()
    }

    fn receive_from_engine(&self, op: &'static str, flavor: Flavor, buf: &mut [u8]) -> Result<Transfer> {
        self.ensure_connected(op, flavor)?;
        if buf.is_empty() {
            return Ok(Transfer::Bytes(0));
        }
        match self.handle.receive(buf) {
            Ok(0) => Ok(Transfer::Eof),
            Ok(n) => {
                log::trace!("channel {} {} {} bytes", self.id(), op, n);
                Ok(Transfer::Bytes(n))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Transfer::WouldBlock),
            Err(e) => Err(self.engine_error(e)),
        }
    }

    fn send_to_engine(&self, op: &'static str, flavor: Flavor, buf: &[u8]) -> Result<Transfer> {
        self.ensure_connected(op, flavor)?;
        if buf.is_empty() && flavor == Flavor::Stream {
            return Ok(Transfer::Bytes(0));
        }
        match self.handle.send(buf) {
            Ok(n) => {
                log::trace!("channel {} {} {} bytes", self.id(), op, n);
                Ok(Transfer::Bytes(n))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Transfer::WouldBlock),
            Err(e) => Err(self.engine_error(e)),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::ChannelClosed)
        }
    }

    fn ensure_connected(&self, op: &'static str, flavor: Flavor) -> Result<()> {
        let inner = self.inner.lock();
        match inner.state {
            ConnectionState::Closed => Err(Error::ChannelClosed),
            _ if self.kind == Kind::Accept || self.flavor() != flavor => Err(self.unsupported(op)),
            ConnectionState::Connected => Ok(()),
            ConnectionState::ConnectFailed => Err(inner.failure()),
            state => Err(Error::IllegalState { op, state }),
        }
    }

    fn unsupported(&self, op: &'static str) -> Error {
        Error::Unsupported { op, kind: self.kind }
    }

    /// An engine error that races a concurrent close reports the close.
    fn engine_error(&self, err: io::Error) -> Error {
        if self.is_open() {
            Error::Io(err)
        } else {
            Error::ChannelClosed
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.is_open() {
            let _ = self.close();
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id())
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}
