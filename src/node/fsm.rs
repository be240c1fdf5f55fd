//! The per-pair state machine's states (§4.F).
//!
//! Transitions are driven by handler functions in [`super::initiator`] and
//! [`super::responder`] reacting to [`crate::event_loop::Event`] variants —
//! the "tagged enum instead of per-class callbacks" redesign guidance of
//! spec §9, collapsed here to a plain state enum plus free functions rather
//! than a second enum of transition messages, since the event loop's own
//! `Event` already carries everything a transition needs.

/// `state` from the Node record (§3), monotonic along the happy path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Created,
    DescriptionsExchange,
    IceCandidatesExchange,
    Connected,
    Disconnected,
    Timeout,
    NegotiationError,
}

impl NodeState {
    /// True for any state on the happy-path CREATED → CONNECTED trajectory.
    pub fn is_negotiating(self) -> bool {
        matches!(
            self,
            Self::Created | Self::DescriptionsExchange | Self::IceCandidatesExchange
        )
    }

    /// True for any of the three terminal branches.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Timeout | Self::NegotiationError)
    }

    /// Whether ICE candidates may be sent/accepted directly in this state
    /// (as opposed to being suspended or discarded outright).
    pub fn accepts_ice(self) -> bool {
        matches!(self, Self::IceCandidatesExchange | Self::Connected)
    }
}
