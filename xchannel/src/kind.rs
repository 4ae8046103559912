//! Channel roles and transport flavors.
//!
//! Kind-specific behavior is a lookup in a fixed table rather than a
//! trait hierarchy: every channel is the same type carrying a [`Kind`] tag.

use crate::ops::Ops;

/// Transport flavor of an engine session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flavor {
    /// Byte stream, no message boundaries.
    Stream,

    /// Whole messages, boundaries preserved.
    Message,
}

/// Role of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Listening channel that accepts incoming connections.
    Accept,

    /// Stream client, or the server side of an accepted stream connection.
    Connect,

    /// Symmetric connect where both peers dial each other.
    Rendezvous,

    /// Message-oriented client, or the server side of an accepted message connection.
    Message,
}

/// Dispatch table entry for a kind.
struct KindTraits {
    valid_ops: Ops,
    connect_allowed: bool,
    stream: bool,
    message: bool,
}

const CONNECTOR_OPS: Ops = Ops::CONNECT.union(Ops::READ).union(Ops::WRITE);

impl Kind {
    const fn traits(self) -> KindTraits {
        match self {
            Kind::Accept => KindTraits {
                valid_ops: Ops::ACCEPT,
                connect_allowed: false,
                stream: true,
                message: true,
            },
            Kind::Connect => KindTraits {
                valid_ops: CONNECTOR_OPS,
                connect_allowed: true,
                stream: true,
                message: false,
            },
            Kind::Rendezvous => KindTraits {
                valid_ops: CONNECTOR_OPS,
                connect_allowed: true,
                stream: true,
                message: true,
            },
            Kind::Message => KindTraits {
                valid_ops: CONNECTOR_OPS,
                connect_allowed: true,
                stream: false,
                message: true,
            },
        }
    }

    /// Selector operations a channel of this kind may register interest in.
    pub const fn valid_ops(self) -> Ops {
        self.traits().valid_ops
    }

    /// Whether `connect` is a valid operation for this kind.
    pub const fn can_connect(self) -> bool {
        self.traits().connect_allowed
    }

    /// Whether a provider of `flavor` can host channels of this kind.
    pub const fn supports(self, flavor: Flavor) -> bool {
        let traits = self.traits();
        match flavor {
            Flavor::Stream => traits.stream,
            Flavor::Message => traits.message,
        }
    }

    /// Kind of the connector channels a provider of `flavor` opens,
    /// and of the channels produced by accepting on it.
    pub const fn connector(flavor: Flavor) -> Kind {
        match flavor {
            Flavor::Stream => Kind::Connect,
            Flavor::Message => Kind::Message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Kind; 4] = [Kind::Accept, Kind::Connect, Kind::Rendezvous, Kind::Message];

    #[test]
    fn test_valid_ops_table() {
        assert_eq!(Kind::Accept.valid_ops(), Ops::ACCEPT);
        for kind in [Kind::Connect, Kind::Rendezvous, Kind::Message] {
            assert_eq!(kind.valid_ops(), Ops::CONNECT | Ops::READ | Ops::WRITE);
        }
    }

    #[test]
    fn test_valid_ops_never_empty() {
        let universe = Ops::READ | Ops::WRITE | Ops::CONNECT | Ops::ACCEPT;
        for kind in ALL {
            assert!(!kind.valid_ops().is_empty());
            assert!(kind.valid_ops().is_subset_of(universe));
        }
    }

    #[test]
    fn test_connect_allowed() {
        assert!(!Kind::Accept.can_connect());
        assert!(Kind::Connect.can_connect());
        assert!(Kind::Rendezvous.can_connect());
        assert!(Kind::Message.can_connect());
    }

    #[test]
    fn test_flavor_support() {
        assert!(Kind::Connect.supports(Flavor::Stream));
        assert!(!Kind::Connect.supports(Flavor::Message));
        assert!(Kind::Message.supports(Flavor::Message));
        assert!(!Kind::Message.supports(Flavor::Stream));
        for flavor in [Flavor::Stream, Flavor::Message] {
            assert!(Kind::Accept.supports(flavor));
            assert!(Kind::Rendezvous.supports(flavor));
            assert!(Kind::connector(flavor).supports(flavor));
        }
    }
}
