//! Core data model.
//!
//! An item is an event id plus an opaque payload. Its lifecycle state is
//! never stored as such; it is implied by which Redis collections hold
//! the event id and whether a lease key exists.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

/// A claimed unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Caller-assigned id, unique within its queue.
    pub event_id: String,

    /// Opaque payload. The queue never interprets it.
    pub payload: Vec<u8>,
}

impl Item {
    /// Payload as UTF-8, replacing invalid sequences.
    pub fn payload_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Waiting in the unclaimed list.
    Unclaimed,
    /// In the claimed list with a live lease.
    ClaimedLeased,
    /// In the claimed list, lease gone. Due for recovery.
    ClaimedExpired,
    /// Removed entirely. Terminal.
    Acknowledged,
}

impl ItemState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: ItemState) -> bool {
        use ItemState::*;
        matches!(
            (self, to),
            (Unclaimed, ClaimedLeased)
                | (ClaimedLeased, Acknowledged)
                | (ClaimedLeased, ClaimedExpired) // lease ran out
                | (ClaimedLeased, Unclaimed)      // released by its consumer
                | (ClaimedExpired, Unclaimed)     // recovered
                | (ClaimedExpired, Acknowledged) // late ack before the sweep ran
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemState::Acknowledged)
    }
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ItemState::Unclaimed => "unclaimed",
            ItemState::ClaimedLeased => "claimed_leased",
            ItemState::ClaimedExpired => "claimed_expired",
            ItemState::Acknowledged => "acknowledged",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Result of acknowledging an item. Both variants are success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ack {
    /// The item was claimed and is now gone.
    Acknowledged,
    /// The item was not in the claimed list (already acknowledged or recovered).
    NotClaimed,
}

/// Result of a recovery attempt. All variants are success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recovery {
    /// Lease had expired; the item is back in the unclaimed list.
    Restored,
    /// Lease is still held; nothing changed.
    LeaseValid,
    /// The item was not in the claimed list.
    NotClaimed,
}

/// Summary of one recovery sweep over a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub queue: String,
    /// Claimed entries examined.
    pub scanned: usize,
    /// Entries moved back to the unclaimed list.
    pub restored: usize,
    /// Entries whose lease was still live.
    pub leased: usize,
}

/// Point-in-time sizes of a queue's collections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub unclaimed: u64,
    pub claimed: u64,
    pub consumers: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_paths_are_legal() {
        use ItemState::*;
        assert!(Unclaimed.can_transition_to(ClaimedLeased));
        assert!(ClaimedLeased.can_transition_to(Acknowledged));
        assert!(ClaimedLeased.can_transition_to(ClaimedExpired));
        assert!(ClaimedExpired.can_transition_to(Unclaimed));
    }

    #[test]
    fn acknowledged_is_terminal() {
        use ItemState::*;
        assert!(Acknowledged.is_terminal());
        for to in [Unclaimed, ClaimedLeased, ClaimedExpired, Acknowledged] {
            assert!(!Acknowledged.can_transition_to(to), "acknowledged -> {to}");
        }
        assert!(!Unclaimed.can_transition_to(Acknowledged));
        assert!(!Unclaimed.can_transition_to(ClaimedExpired));
    }

    #[test]
    fn states_display_in_snake_case() {
        assert_eq!(ItemState::ClaimedExpired.to_string(), "claimed_expired");
        assert_eq!(
            serde_json::to_string(&ItemState::ClaimedLeased).unwrap(),
            "\"claimed_leased\""
        );
    }
}
