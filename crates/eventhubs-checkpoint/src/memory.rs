//! In-memory checkpoint store.
//!
//! Behaves like the blob store (etag compare-and-swap, store-assigned
//! timestamps) but lives in process memory. Several processors sharing one
//! `Arc<InMemoryCheckpointStore>` coordinate exactly like processors sharing a
//! storage container.
//!
//! Records are kept in ordered maps, so listings come back sorted by partition
//! id. Tests rely on that for deterministic expectations.

use crate::clock::{Clock, SystemClock};
use crate::error::{CheckpointStoreError, Result};
use crate::types::{Checkpoint, ClaimOutcome, LostReason, Ownership};
use crate::CheckpointStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// (namespace, event hub, consumer group, partition id)
type RecordKey = (String, String, String, String);

pub struct InMemoryCheckpointStore {
    ownerships: RwLock<BTreeMap<RecordKey, Ownership>>,
    checkpoints: RwLock<BTreeMap<RecordKey, Checkpoint>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Store whose write timestamps come from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            ownerships: RwLock::new(BTreeMap::new()),
            checkpoints: RwLock::new(BTreeMap::new()),
            clock,
        }
    }

    /// Backdate an ownership so every processor treats it as expired.
    ///
    /// The etag is left alone, so the next claimer still needs the current one.
    /// Returns false if the record doesn't exist.
    pub async fn expire_ownership(&self, ownership: &Ownership) -> bool {
        let key = ownership_key(ownership);
        let mut ownerships = self.ownerships.write().await;

        match ownerships.get_mut(&key) {
            Some(stored) => {
                stored.last_modified_time = Some(DateTime::<Utc>::UNIX_EPOCH);
                debug!(
                    partition_id = %stored.partition_id,
                    owner_id = %stored.owner_id,
                    "Expired ownership"
                );
                true
            }
            None => false,
        }
    }
}

impl Default for InMemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn list_ownership(
        &self,
        fully_qualified_namespace: &str,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<Ownership>> {
        let ownerships = self.ownerships.read().await;
        Ok(ownerships
            .iter()
            .filter(|(key, _)| in_scope(key, fully_qualified_namespace, event_hub_name, consumer_group))
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn claim_ownership(&self, ownerships: Vec<Ownership>) -> Result<Vec<ClaimOutcome>> {
        for o in &ownerships {
            validate_scope(
                &o.fully_qualified_namespace,
                &o.event_hub_name,
                &o.consumer_group,
                &o.partition_id,
            )?;
        }

        let now = self.clock.now();
        let mut stored = self.ownerships.write().await;
        let mut outcomes = Vec::with_capacity(ownerships.len());

        for mut ownership in ownerships {
            let key = ownership_key(&ownership);

            let matches = match (stored.get(&key), ownership.etag.as_ref()) {
                (Some(existing), Some(etag)) => existing.etag.as_ref() == Some(etag),
                (None, None) => true,
                _ => false,
            };

            if !matches {
                debug!(
                    partition_id = %ownership.partition_id,
                    owner_id = %ownership.owner_id,
                    "Ownership claim lost, etag mismatch"
                );
                outcomes.push(ClaimOutcome::Lost {
                    partition_id: ownership.partition_id,
                    reason: LostReason::Conflict,
                });
                continue;
            }

            ownership.etag = Some(Uuid::new_v4().to_string());
            ownership.last_modified_time = Some(now);
            stored.insert(key, ownership.clone());
            outcomes.push(ClaimOutcome::Claimed(ownership));
        }

        Ok(outcomes)
    }

    async fn list_checkpoints(
        &self,
        fully_qualified_namespace: &str,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<Checkpoint>> {
        let checkpoints = self.checkpoints.read().await;
        Ok(checkpoints
            .iter()
            .filter(|(key, _)| in_scope(key, fully_qualified_namespace, event_hub_name, consumer_group))
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn update_checkpoint(&self, checkpoint: Checkpoint) -> Result<()> {
        validate_scope(
            &checkpoint.fully_qualified_namespace,
            &checkpoint.event_hub_name,
            &checkpoint.consumer_group,
            &checkpoint.partition_id,
        )?;

        let key = (
            checkpoint.fully_qualified_namespace.clone(),
            checkpoint.event_hub_name.clone(),
            checkpoint.consumer_group.clone(),
            checkpoint.partition_id.clone(),
        );
        self.checkpoints.write().await.insert(key, checkpoint);
        Ok(())
    }
}

fn ownership_key(o: &Ownership) -> RecordKey {
    (
        o.fully_qualified_namespace.clone(),
        o.event_hub_name.clone(),
        o.consumer_group.clone(),
        o.partition_id.clone(),
    )
}

fn in_scope(key: &RecordKey, namespace: &str, event_hub: &str, consumer_group: &str) -> bool {
    key.0 == namespace && key.1 == event_hub && key.2 == consumer_group
}

/// Reject records that can't be addressed in the store.
pub(crate) fn validate_scope(
    namespace: &str,
    event_hub: &str,
    consumer_group: &str,
    partition_id: &str,
) -> Result<()> {
    let missing = [
        ("fully_qualified_namespace", namespace),
        ("event_hub_name", event_hub),
        ("consumer_group", consumer_group),
        ("partition_id", partition_id),
    ]
    .into_iter()
    .find(|(_, value)| value.is_empty());

    match missing {
        Some((field, _)) => Err(CheckpointStoreError::InvalidArgument(format!(
            "{} must not be empty",
            field
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::claimed;

    fn ownership(partition_id: &str, owner: &str) -> Ownership {
        Ownership::unowned("ns", "hub", "cg", partition_id).with_owner(owner)
    }

    // ----- 1. Claim semantics -----

    #[tokio::test]
    async fn test_claim_creates_slot_without_etag() {
        let store = InMemoryCheckpointStore::new();

        let outcomes = store.claim_ownership(vec![ownership("0", "a")]).await.unwrap();
        let won = claimed(outcomes);

        assert_eq!(won.len(), 1);
        assert!(won[0].etag.is_some(), "store must assign an etag");
        assert!(won[0].last_modified_time.is_some());
    }

    #[tokio::test]
    async fn test_claim_without_etag_loses_when_slot_exists() {
        let store = InMemoryCheckpointStore::new();
        store.claim_ownership(vec![ownership("0", "a")]).await.unwrap();

        let outcomes = store.claim_ownership(vec![ownership("0", "b")]).await.unwrap();
        assert_eq!(
            outcomes,
            vec![ClaimOutcome::Lost {
                partition_id: "0".to_string(),
                reason: LostReason::Conflict,
            }]
        );
    }

    #[tokio::test]
    async fn test_only_one_writer_wins_with_same_etag() {
        let store = InMemoryCheckpointStore::new();
        let original = claimed(store.claim_ownership(vec![ownership("0", "a")]).await.unwrap())
            .remove(0);

        let first = original.clone().with_owner("b");
        let second = original.with_owner("c");

        let results = store.claim_ownership(vec![first, second]).await.unwrap();
        assert!(results[0].is_claimed());
        assert!(!results[1].is_claimed(), "second writer holds a stale etag");

        let listed = store.list_ownership("ns", "hub", "cg").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].owner_id, "b");
    }

    #[tokio::test]
    async fn test_claim_with_etag_on_missing_slot_is_lost() {
        let store = InMemoryCheckpointStore::new();
        let mut o = ownership("0", "a");
        o.etag = Some("does-not-exist".to_string());

        let outcomes = store.claim_ownership(vec![o]).await.unwrap();
        assert!(!outcomes[0].is_claimed());
    }

    #[tokio::test]
    async fn test_claim_rejects_empty_partition_id() {
        let store = InMemoryCheckpointStore::new();
        let err = store.claim_ownership(vec![ownership("", "a")]).await;
        assert!(matches!(err, Err(CheckpointStoreError::InvalidArgument(_))));
    }

    // ----- 2. Timestamps and expiry hook -----

    #[tokio::test]
    async fn test_timestamps_come_from_clock() {
        let clock = Arc::new(ManualClock::default());
        let store = InMemoryCheckpointStore::with_clock(clock.clone());

        let won = claimed(store.claim_ownership(vec![ownership("0", "a")]).await.unwrap());
        assert_eq!(won[0].last_modified_time, Some(clock.now()));
    }

    #[tokio::test]
    async fn test_expire_ownership_backdates_record() {
        let store = InMemoryCheckpointStore::new();
        let won = claimed(store.claim_ownership(vec![ownership("0", "a")]).await.unwrap());

        assert!(store.expire_ownership(&won[0]).await);
        assert!(!store.expire_ownership(&ownership("9", "a")).await);

        let listed = store.list_ownership("ns", "hub", "cg").await.unwrap();
        assert_eq!(listed[0].last_modified_time, Some(DateTime::<Utc>::UNIX_EPOCH));
        assert_eq!(listed[0].etag, won[0].etag, "expiry must not change the etag");
    }

    // ----- 3. Checkpoints -----

    #[tokio::test]
    async fn test_checkpoint_upsert_and_scope() {
        let store = InMemoryCheckpointStore::new();
        let cp = Checkpoint {
            consumer_group: "cg".to_string(),
            event_hub_name: "hub".to_string(),
            fully_qualified_namespace: "ns".to_string(),
            partition_id: "0".to_string(),
            offset: Some(101),
            sequence_number: Some(202),
        };

        store.update_checkpoint(cp.clone()).await.unwrap();
        store
            .update_checkpoint(Checkpoint {
                offset: Some(102),
                sequence_number: Some(203),
                ..cp.clone()
            })
            .await
            .unwrap();

        let listed = store.list_checkpoints("ns", "hub", "cg").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].offset, Some(102));
        assert_eq!(listed[0].sequence_number, Some(203));

        assert!(store.list_checkpoints("ns", "hub", "other").await.unwrap().is_empty());
    }
}
