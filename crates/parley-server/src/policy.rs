//! Per-recipient messaging policy.

use parley_shared::types::UserId;
use parley_store::User;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    /// Not an error: the sender gets a dm-blocked event naming the recipient.
    Reject { recipient_label: String },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyGate;

impl PolicyGate {
    pub fn new() -> Self {
        Self
    }

    /// May `sender` open or continue a direct conversation with `recipient`?
    pub fn check_direct(&self, sender: UserId, recipient: &User) -> PolicyDecision {
        if recipient.allow_direct_messages {
            return PolicyDecision::Allow;
        }

        debug!(sender = %sender, recipient = %recipient.id, "Direct message blocked by recipient setting");
        PolicyDecision::Reject {
            recipient_label: recipient.display_name(),
        }
    }
}
