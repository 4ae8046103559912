//! # XChannel - Socket Channels over a Reliable Datagram Transport
//!
//! XChannel puts a readiness-based channel API on top of a reliable
//! datagram transport engine:
//!
//! - **Channel kinds**: accept, stream connect, rendezvous and message
//!   channels share one [`Channel`] type tagged with a [`Kind`]
//! - **Connection state machine**: blocking and non-blocking connect with
//!   sticky handshake failures
//! - **Rendezvous**: symmetric connect where both peers dial each other
//! - **Selectors**: readiness multiplexing with interest masks, wakeups and
//!   timeouts
//! - **Pluggable engine**: anything implementing [`Engine`]; an in-process
//!   [`MemoryEngine`] is included
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Application Layer                     │
//! ├─────────────────────────────────────────────────────────┤
//! │                    Channel Layer                         │
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────────┐   │
//! │  │  Providers  │ │  Channels   │ │    Selectors    │   │
//! │  └─────────────┘ └─────────────┘ └─────────────────┘   │
//! ├─────────────────────────────────────────────────────────┤
//! │                    Engine Capability                     │
//! │  ┌─────────────────────────────────────────────────┐   │
//! │  │        Engine / SocketHandle (MemoryEngine)      │   │
//! │  └─────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use xchannel::{Config, MemoryEngine, Ops, Providers};
//!
//! # fn main() -> xchannel::Result<()> {
//! let providers = Providers::new(Arc::new(MemoryEngine::default()), Config::default());
//! let stream = providers.stream();
//!
//! let server = stream.open_server_socket()?;
//! let addr = server.bind("127.0.0.1:9000".parse().unwrap())?;
//! server.listen(0)?;
//! server.configure_blocking(false)?;
//!
//! let selector = stream.open_selector();
//! selector.register(&server, Ops::ACCEPT)?;
//!
//! let client = stream.open_socket()?;
//! client.configure_blocking(false)?;
//! client.connect(addr)?;
//!
//! selector.select()?;
//! for key in selector.selected_keys() {
//!     if key.is_acceptable() {
//!         let _accepted = server.accept()?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod kind;
pub mod ops;
pub mod provider;
mod rendezvous;
pub mod selector;
pub mod state;

// Re-export commonly used types
pub use channel::{Channel, Transfer};
pub use config::Config;
pub use engine::{Engine, MemoryConfig, MemoryEngine, OptionValue, SocketHandle, SocketOption};
pub use error::{Error, ErrorCategory, Result};
pub use kind::{Flavor, Kind};
pub use ops::Ops;
pub use provider::{Provider, Providers};
pub use selector::{SelectionKey, Selector};
pub use state::ConnectionState;

/// Default listen backlog
pub const DEFAULT_LISTEN_BACKLOG: usize = 128;

/// Default selector re-query interval in milliseconds
pub const DEFAULT_SELECT_POLL_INTERVAL_MS: u64 = 10;
