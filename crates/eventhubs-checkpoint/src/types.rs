//! Checkpoint Store Type Definitions
//!
//! ## Types Overview
//!
//! ### Ownership
//! One consumer's claim over one partition of one event hub, within one consumer
//! group. The `etag` is the concurrency token from the last successful write and
//! is what makes a claim a compare-and-swap.
//!
//! ### Checkpoint
//! The last processed position within one partition, so a new owner can resume
//! where the previous one left off.
//!
//! ### ClaimOutcome
//! Per-item result of a batch ownership claim. Losing a race is an ordinary
//! outcome, not an error.
//!
//! ## Design Decisions
//!
//! - Records are keyed by (namespace, event hub, consumer group, partition id)
//! - Records are never deleted; staleness is judged by `last_modified_time`
//! - Timestamps are `chrono::DateTime<Utc>` because they come from the store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ownership of a single partition.
///
/// A record with an empty `owner_id` has never been claimed. A record with no
/// `etag` has never been written; claiming it creates the slot in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ownership {
    /// Consumer group the claim belongs to
    pub consumer_group: String,

    /// Event hub name
    pub event_hub_name: String,

    /// Fully qualified namespace, e.g. `ns.servicebus.windows.net`
    pub fully_qualified_namespace: String,

    /// Partition id (opaque string, usually "0", "1", ...)
    pub partition_id: String,

    /// Id of the owning consumer instance (empty = unowned)
    pub owner_id: String,

    /// Concurrency token from the last successful write
    pub etag: Option<String>,

    /// Time of the last successful write, as reported by the store
    pub last_modified_time: Option<DateTime<Utc>>,
}

impl Ownership {
    /// Create an unowned, never-written record for a partition.
    pub fn unowned(
        fully_qualified_namespace: impl Into<String>,
        event_hub_name: impl Into<String>,
        consumer_group: impl Into<String>,
        partition_id: impl Into<String>,
    ) -> Self {
        Self {
            consumer_group: consumer_group.into(),
            event_hub_name: event_hub_name.into(),
            fully_qualified_namespace: fully_qualified_namespace.into(),
            partition_id: partition_id.into(),
            owner_id: String::new(),
            etag: None,
            last_modified_time: None,
        }
    }

    /// Same record with a different owner. The etag is kept so the claim is
    /// conditional on nobody having written the slot since it was read.
    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = owner_id.into();
        self
    }

    /// True if nobody holds this partition.
    pub fn is_unowned(&self) -> bool {
        self.owner_id.is_empty()
    }
}

/// Last processed position within a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub consumer_group: String,
    pub event_hub_name: String,
    pub fully_qualified_namespace: String,
    pub partition_id: String,

    /// Service-assigned offset of the last processed event
    pub offset: Option<i64>,

    /// Sequence number of the last processed event
    pub sequence_number: Option<i64>,
}

impl Checkpoint {
    /// True if the checkpoint carries a position to resume from.
    pub fn has_position(&self) -> bool {
        self.offset.is_some() || self.sequence_number.is_some()
    }
}

/// Why a claim did not land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LostReason {
    /// Another writer changed the slot since it was read (stale etag), or
    /// created it first.
    Conflict,

    /// The write for this item failed for a non-contention reason.
    Transient(String),
}

/// Result of claiming a single ownership in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The write succeeded. Carries the store-assigned etag and timestamp.
    Claimed(Ownership),

    /// The write did not succeed.
    Lost {
        partition_id: String,
        reason: LostReason,
    },
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed(_))
    }

    pub fn partition_id(&self) -> &str {
        match self {
            ClaimOutcome::Claimed(o) => &o.partition_id,
            ClaimOutcome::Lost { partition_id, .. } => partition_id,
        }
    }
}

/// Keep only the ownerships whose write succeeded, in input order.
pub fn claimed(outcomes: Vec<ClaimOutcome>) -> Vec<Ownership> {
    outcomes
        .into_iter()
        .filter_map(|outcome| match outcome {
            ClaimOutcome::Claimed(ownership) => Some(ownership),
            ClaimOutcome::Lost { .. } => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unowned_record() {
        let o = Ownership::unowned("ns", "hub", "$Default", "3");
        assert!(o.is_unowned());
        assert!(o.etag.is_none());
        assert!(o.last_modified_time.is_none());

        let o = o.with_owner("client-a");
        assert_eq!(o.owner_id, "client-a");
        assert!(!o.is_unowned());
    }

    #[test]
    fn test_claimed_keeps_successes_in_order() {
        let a = Ownership::unowned("ns", "hub", "cg", "0").with_owner("a");
        let c = Ownership::unowned("ns", "hub", "cg", "2").with_owner("a");

        let outcomes = vec![
            ClaimOutcome::Claimed(a.clone()),
            ClaimOutcome::Lost {
                partition_id: "1".to_string(),
                reason: LostReason::Conflict,
            },
            ClaimOutcome::Claimed(c.clone()),
        ];

        assert_eq!(outcomes[1].partition_id(), "1");
        assert!(!outcomes[1].is_claimed());
        assert_eq!(claimed(outcomes), vec![a, c]);
    }

    #[test]
    fn test_checkpoint_position() {
        let mut cp = Checkpoint {
            consumer_group: "cg".to_string(),
            event_hub_name: "hub".to_string(),
            fully_qualified_namespace: "ns".to_string(),
            partition_id: "0".to_string(),
            offset: None,
            sequence_number: None,
        };
        assert!(!cp.has_position());

        cp.sequence_number = Some(202);
        assert!(cp.has_position());
    }
}
