//! Error types for the channel layer.
//!
//! The channel layer never swallows an engine error; it only adds state
//! validation in front of the engine. Would-block is not an error at this
//! level, see [`Transfer`](crate::Transfer).

use std::io;

use thiserror::Error;

use crate::kind::{Flavor, Kind};
use crate::ops::Ops;
use crate::state::ConnectionState;

/// Broad class of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Operation invoked in the wrong state or on a closed object.
    State,

    /// Connect or rendezvous handshake failed.
    Handshake,

    /// I/O failure on an established connection.
    Io,

    /// Engine could not allocate a session.
    Resource,

    /// Invalid interest set or incompatible channel/selector pairing.
    KindMismatch,
}

/// Errors returned by channels, providers and selectors.
#[derive(Debug, Error)]
pub enum Error {
    /// Operation is not valid in the channel's current connection state.
    #[error("operation `{op}` is not valid in state {state:?}")]
    IllegalState {
        /// Operation name.
        op: &'static str,
        /// State the channel was in.
        state: ConnectionState,
    },

    /// Operation is not supported by the channel's kind.
    #[error("operation `{op}` is not supported by {kind:?} channels")]
    Unsupported {
        /// Operation name.
        op: &'static str,
        /// Kind of the channel.
        kind: Kind,
    },

    /// Channel has been closed.
    #[error("channel is closed")]
    ChannelClosed,

    /// Another connect is already in progress on this channel.
    #[error("connect already in progress")]
    ConnectionPending,

    /// Channel is already connected.
    #[error("channel is already connected")]
    AlreadyConnected,

    /// Accept called on a channel that is not listening.
    #[error("channel is not listening")]
    NotListening,

    /// Handshake failed; the channel is unusable and must be closed.
    #[error("connection failed: {0}")]
    ConnectionFailed(#[source] io::Error),

    /// Interest set is not a subset of the channel's valid operations.
    #[error("interest {requested:?} is not a subset of valid ops {valid:?}")]
    InvalidInterest {
        /// Requested interest set.
        requested: Ops,
        /// Operations valid for the channel.
        valid: Ops,
    },

    /// Channel flavor does not match the selector's flavor.
    #[error("{channel:?} channel cannot be registered with a {selector:?} selector")]
    FlavorMismatch {
        /// Flavor of the channel.
        channel: Flavor,
        /// Flavor of the selector.
        selector: Flavor,
    },

    /// Kind cannot be hosted by the provider's flavor.
    #[error("{kind:?} channels cannot be opened by a {flavor:?} provider")]
    KindMismatch {
        /// Requested kind.
        kind: Kind,
        /// Flavor of the provider.
        flavor: Flavor,
    },

    /// Selector has been closed.
    #[error("selector is closed")]
    SelectorClosed,

    /// Selection key has been cancelled.
    #[error("selection key is cancelled")]
    CancelledKey,

    /// Engine could not allocate a session.
    #[error("engine could not open a session: {0}")]
    Resource(#[source] io::Error),

    /// I/O error reported by the engine on an established connection.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Returns the category of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::IllegalState { .. }
            | Error::Unsupported { .. }
            | Error::ChannelClosed
            | Error::ConnectionPending
            | Error::AlreadyConnected
            | Error::NotListening
            | Error::SelectorClosed
            | Error::CancelledKey => ErrorCategory::State,
            Error::ConnectionFailed(_) => ErrorCategory::Handshake,
            Error::InvalidInterest { .. }
            | Error::FlavorMismatch { .. }
            | Error::KindMismatch { .. } => ErrorCategory::KindMismatch,
            Error::Resource(_) => ErrorCategory::Resource,
            Error::Io(_) => ErrorCategory::Io,
        }
    }
}

/// Result alias for channel operations.
pub type Result<T> = core::result::Result<T, Error>;
