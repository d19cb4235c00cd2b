//! One-hop forwarding of call-setup messages.
//!
//! The relay keeps no call state. It looks up the target's connection and
//! forwards the payload untouched with the sender attached as `from`.

use std::sync::Arc;

use tracing::debug;

use parley_shared::protocol::{ServerEvent, SignalDelivery};
use parley_shared::types::UserId;

use crate::registry::ConnectionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    End,
    Reject,
}

impl SignalKind {
    fn into_event(self, delivery: SignalDelivery) -> ServerEvent {
        match self {
            Self::Offer => ServerEvent::CallOffer(delivery),
            Self::Answer => ServerEvent::CallAnswered(delivery),
            Self::Candidate => ServerEvent::IceCandidate(delivery),
            Self::End => ServerEvent::CallEnded(delivery),
            Self::Reject => ServerEvent::CallDeclined(delivery),
        }
    }
}

#[derive(Clone)]
pub struct SignalingRelay {
    registry: Arc<ConnectionRegistry>,
}

impl SignalingRelay {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Forward to `target`. Returns whether a live connection took it.
    pub fn relay(
        &self,
        from: UserId,
        kind: SignalKind,
        target: UserId,
        payload: serde_json::Value,
    ) -> bool {
        let event = kind.into_event(SignalDelivery { from, payload });
        let delivered = self.registry.send(&target, event);
        if !delivered {
            debug!(from = %from, target = %target, kind = ?kind, "Signal target not connected");
        }
        delivered
    }
}
