//! Transport engine capability.
//!
//! The channel layer consumes the engine only through the [`Engine`] and
//! [`SocketHandle`] traits. An engine owns the real protocol (framing,
//! retransmission, congestion control); a handle is one engine session.
//!
//! # Implementations
//!
//! - `MemoryEngine`: in-process sessions for tests and examples
//!
//! # Conventions
//!
//! Handle operations return `std::io::Result`. A non-blocking operation
//! that cannot make progress fails with `io::ErrorKind::WouldBlock`; a
//! stream receive returning `Ok(0)` for a non-empty buffer means the peer
//! shut down. Blocking operations must return with an error once the
//! handle is closed from another thread.

mod memory;
mod ring;

use std::fmt;
use std::io;
use std::net::SocketAddr;

use crate::kind::Flavor;

pub use memory::{EngineStats, MemoryConfig, MemoryEngine};

/// Factory for engine sessions.
pub trait Engine: Send + Sync {
    /// Opens a new unconnected session of the given flavor.
    fn open(&self, flavor: Flavor) -> io::Result<Box<dyn SocketHandle>>;
}

/// One transport engine session.
///
/// All methods take `&self`: a handle may be used from a blocked reader
/// and a closing thread at the same time.
pub trait SocketHandle: Send + Sync + fmt::Debug {
    /// Engine-assigned session id.
    fn id(&self) -> u64;

    /// Flavor the session was opened with.
    fn flavor(&self) -> Flavor;

    /// Sets the blocking mode of subsequent operations.
    fn set_blocking(&self, blocking: bool) -> io::Result<()>;

    /// Returns the blocking mode.
    fn is_blocking(&self) -> bool;

    /// Sets a socket option.
    fn set_option(&self, option: SocketOption, value: OptionValue) -> io::Result<()>;

    /// Reads a socket option.
    fn option(&self, option: SocketOption) -> io::Result<OptionValue>;

    /// Binds the session to a local address, returning the bound address.
    fn bind(&self, addr: SocketAddr) -> io::Result<SocketAddr>;

    /// Puts a bound session into listening mode.
    fn listen(&self, backlog: usize) -> io::Result<()>;

    /// Accepts a pending connection.
    fn accept(&self) -> io::Result<Box<dyn SocketHandle>>;

    /// Starts a handshake with `addr`.
    ///
    /// Returns `true` if the handshake already finished. In blocking mode
    /// this waits for the handshake and only returns `true` or an error.
    fn connect(&self, addr: SocketAddr) -> io::Result<bool>;

    /// Polls a pending handshake.
    ///
    /// Returns `true` once established, `false` while pending, and an error
    /// on definitive failure.
    fn finish_connect(&self) -> io::Result<bool>;

    /// Sends bytes (stream) or one whole message (message flavor).
    fn send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Receives bytes (stream) or one whole message (message flavor).
    fn receive(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Queries readiness without blocking.
    fn readiness(&self) -> Readiness;

    /// Local address, if bound.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Peer address, if connected.
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Releases the session. Idempotent at the engine level.
    fn close(&self) -> io::Result<()>;
}

/// Readiness of an engine session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    /// Handshake completed.
    pub connect_finished: bool,

    /// Handshake failed definitively.
    pub connect_failed: bool,

    /// A connection is waiting to be accepted.
    pub acceptable: bool,

    /// Data (or end of stream) can be received.
    pub readable: bool,

    /// Data can be sent.
    pub writable: bool,
}

/// Socket options understood by the channel layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketOption {
    /// Allow several sessions to bind the same address.
    ReuseAddress,

    /// Symmetric rendezvous handshake instead of client/server.
    Rendezvous,

    /// Send buffer size in bytes. Caps a single send.
    SendBuffer,

    /// Receive buffer size in bytes. Caps the bytes queued for reading.
    ReceiveBuffer,
}

/// Value of a socket option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionValue {
    /// Flag option.
    Bool(bool),

    /// Size option.
    Size(usize),
}

impl OptionValue {
    /// Returns the flag value, if this is a flag.
    pub fn as_bool(self) -> Option<bool> {
        match self {
            OptionValue::Bool(v) => Some(v),
            OptionValue::Size(_) => None,
        }
    }

    /// Returns the size value, if this is a size.
    pub fn as_size(self) -> Option<usize> {
        match self {
            OptionValue::Size(v) => Some(v),
            OptionValue::Bool(_) => None,
        }
    }
}
