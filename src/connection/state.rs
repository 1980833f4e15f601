//! Connection lifecycle and migration states

use std::fmt;

/// Lifecycle state of a flow
///
/// Transitions happen strictly through the handlers in
/// [`super::Connection`]; every `(state, event)` pair either has a defined
/// transition or is an explicit drop.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum State {
    /// Unconnected; datagram flows send and receive here
    Init,
    /// SYN sent, awaiting SYN+ACK
    Request,
    /// Server-side child spawned from a pending request; a valid
    /// acknowledgement promotes it to Connected
    Respond,
    /// Established
    Connected,
    /// Local close sent FIN, nothing acknowledged yet
    FinWait1,
    /// Our FIN was acknowledged, awaiting the peer's
    FinWait2,
    /// Both sides closed simultaneously, awaiting our FIN's acknowledgement
    Closing,
    /// Peer closed first; we may still send
    CloseWait,
    /// Local close after the peer's; awaiting the final acknowledgement
    LastAck,
    /// Lingering so late retransmissions die on the wire
    TimeWait,
    /// Passive open; spawns request state for incoming SYNs
    Listen,
    /// Terminal; all resources released
    Closed,
}

impl State {
    /// States in which a peer address is established and packets are sent
    /// directly rather than through service resolution
    pub(crate) fn is_connected_family(self) -> bool {
        matches!(
            self,
            Self::Connected | Self::FinWait1 | Self::FinWait2 | Self::Closing | Self::CloseWait
        )
    }

    /// States in which any incoming version number is acceptable
    pub(crate) fn accepts_any_verno(self) -> bool {
        matches!(self, Self::Listen | Self::Request)
    }

    /// States from which a migration request may be sent
    pub(crate) fn may_migrate(self) -> bool {
        !matches!(self, Self::Request | Self::Listen | Self::Closed)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Migration handshake sub-state, orthogonal to [`State`]
///
/// Active in any post-handshake lifecycle state; completing a handshake
/// returns to `Initial` (or to `RsynSent` when both sides migrated at once).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum SalState {
    /// No migration in progress
    Initial,
    /// We sent an RSYN and await its acknowledgement
    RsynSent,
    /// The peer sent an RSYN; data flow to it is frozen until completion
    RsynRecv,
    /// Both sides sent RSYNs concurrently
    RsynSentRecv,
}

impl fmt::Display for SalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
