//! Connection state machine of a channel.

/// Connection state of a channel.
///
/// ```text
/// Unconnected ──> ConnectPending ──> Connected ──> Closed
///                       │
///                       └──> ConnectFailed ──> Closed
/// ```
///
/// Every state may move to `Closed`; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handle is open, no connect issued.
    Unconnected,

    /// Handshake started, not yet finished.
    ConnectPending,

    /// Handshake finished.
    Connected,

    /// Handshake failed; the channel must be closed.
    ConnectFailed,

    /// Handle released.
    Closed,
}

impl ConnectionState {
    /// Returns true if the state machine allows moving from `self` to `next`.
    pub const fn can_transition(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Unconnected, ConnectPending)
                | (Unconnected, Connected)
                | (ConnectPending, Connected)
                | (ConnectPending, ConnectFailed)
                | (Unconnected | ConnectPending | Connected | ConnectFailed, Closed)
        )
    }
}
