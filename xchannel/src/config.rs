//! Provider configuration.

use std::time::Duration;

use crate::{DEFAULT_LISTEN_BACKLOG, DEFAULT_SELECT_POLL_INTERVAL_MS};

/// Configuration shared by a provider and the channels and selectors it creates.
#[derive(Debug, Clone)]
pub struct Config {
    /// Initial blocking mode of new channels.
    pub blocking: bool,

    /// How often a waiting selector re-queries readiness.
    pub select_poll_interval: Duration,

    /// Backlog used by `listen` when the caller passes zero.
    pub listen_backlog: usize,
}

impl Config {
    /// Blocking channels, 10 ms selector poll, backlog 128.
    pub fn new() -> Self {
        Self {
            blocking: true,
            select_poll_interval: Duration::from_millis(DEFAULT_SELECT_POLL_INTERVAL_MS),
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
        }
    }

    /// Sets the initial blocking mode.
    pub fn with_blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    /// Sets the selector re-query interval, at least 1 ms.
    pub fn with_select_poll_interval(mut self, interval: Duration) -> Self {
        // A zero interval would turn the selector wait into a busy loop.
        self.select_poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Sets the default listen backlog, at least 1.
    pub fn with_listen_backlog(mut self, backlog: usize) -> Self {
        self.listen_backlog = backlog.max(1);
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
