//! Rendezvous channel preparation.
//!
//! In a rendezvous handshake both peers bind a known address and connect
//! to each other at the same time; neither side listens. Both addresses
//! must be reusable so the two sessions can share a port with other
//! rendezvous attempts.

use std::io;

use crate::engine::{OptionValue, SocketHandle, SocketOption};

/// Applies the rendezvous options to a fresh handle.
///
/// Order matters: address reuse is enabled before rendezvous mode.
pub(crate) fn prepare(handle: &dyn SocketHandle) -> io::Result<()> {
    handle.set_option(SocketOption::ReuseAddress, OptionValue::Bool(true))?;
    handle.set_option(SocketOption::Rendezvous, OptionValue::Bool(true))?;
    log::trace!("session {} prepared for rendezvous", handle.id());
    Ok(())
}
