//! Channel and selector factories.

use std::fmt;
use std::sync::Arc;

use crate::channel::Channel;
use crate::config::Config;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::kind::{Flavor, Kind};
use crate::selector::Selector;

struct ProviderInner {
    flavor: Flavor,
    engine: Arc<dyn Engine>,
    config: Config,
}

/// Creates channels and selectors of one transport flavor.
///
/// Cheap to clone; every channel keeps a clone of the provider that made it.
#[derive(Clone)]
pub struct Provider {
    inner: Arc<ProviderInner>,
}

impl Provider {
    /// Creates a provider of `flavor` over `engine`.
    pub fn new(flavor: Flavor, engine: Arc<dyn Engine>, config: Config) -> Self {
        Self {
            inner: Arc::new(ProviderInner {
                flavor,
                engine,
                config,
            }),
        }
    }

    /// Flavor of every channel this provider opens.
    pub fn flavor(&self) -> Flavor {
        self.inner.flavor
    }

    /// Configuration applied to new channels and selectors.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Opens an engine session and wraps it in a channel of `kind`.
    ///
    /// Fails with [`Error::KindMismatch`] if this provider's flavor cannot
    /// host `kind`, and with [`Error::Resource`] if the engine cannot
    /// allocate a session.
    pub fn open_channel(&self, kind: Kind) -> Result<Arc<Channel>> {
        let flavor = self.flavor();
        if !kind.supports(flavor) {
            return Err(Error::KindMismatch { kind, flavor });
        }
        let handle = self.inner.engine.open(flavor).map_err(|e| {
            log::warn!("engine could not open a {:?} session: {}", flavor, e);
            Error::Resource(e)
        })?;
        Channel::open(self.clone(), handle, kind)
    }

    /// Opens a client channel: `Connect` for streams, `Message` for messages.
    pub fn open_socket(&self) -> Result<Arc<Channel>> {
        self.open_channel(Kind::connector(self.flavor()))
    }

    /// Opens a listening-side channel.
    pub fn open_server_socket(&self) -> Result<Arc<Channel>> {
        self.open_channel(Kind::Accept)
    }

    /// Opens a channel prepared for a rendezvous handshake.
    pub fn open_rendezvous(&self) -> Result<Arc<Channel>> {
        self.open_channel(Kind::Rendezvous)
    }

    /// Opens a selector for channels of this provider's flavor.
    pub fn open_selector(&self) -> Arc<Selector> {
        Arc::new(Selector::new(self.clone()))
    }

    /// Whether both values refer to the same provider.
    pub fn same(&self, other: &Provider) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("flavor", &self.inner.flavor)
            .field("config", &self.inner.config)
            .finish()
    }
}

/// The stream and message providers over one engine.
#[derive(Debug, Clone)]
pub struct Providers {
    stream: Provider,
    message: Provider,
}

impl Providers {
    /// Builds both providers over one engine.
    pub fn new(engine: Arc<dyn Engine>, config: Config) -> Self {
        Self {
            stream: Provider::new(Flavor::Stream, engine.clone(), config.clone()),
            message: Provider::new(Flavor::Message, engine, config),
        }
    }

    /// Stream provider.
    pub fn stream(&self) -> &Provider {
        &self.stream
    }

    /// Message provider.
    pub fn message(&self) -> &Provider {
        &self.message
    }

    /// Provider for `flavor`.
    pub fn for_flavor(&self, flavor: Flavor) -> &Provider {
        match flavor {
            Flavor::Stream => &self.stream,
            Flavor::Message => &self.message,
        }
    }
}
