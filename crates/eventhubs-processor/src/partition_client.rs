//! Per-partition handle handed out by the processor.
//!
//! A `ProcessorPartitionClient` exists for every partition this processor won.
//! It knows where reading should start and records progress through the
//! checkpoint store. Closing it releases the processor's local slot for the
//! partition, so a later cycle can hand out a fresh client if the partition is
//! still owned.

use crate::config::StartPosition;
use crate::error::{ProcessorError, Result};
use eventhubs_checkpoint::{Checkpoint, CheckpointStore, Ownership};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Partitions with a live client, keyed by partition id.
///
/// Each client gets a generation number so closing a stale client never
/// evicts the one that replaced it.
#[derive(Clone, Default)]
pub(crate) struct PartitionRegistry {
    live: Arc<Mutex<HashMap<String, u64>>>,
    next_generation: Arc<AtomicU64>,
}

impl PartitionRegistry {
    /// Reserve the slot for a partition. Returns None if a live client holds it.
    pub(crate) async fn reserve(&self, partition_id: &str) -> Option<u64> {
        let mut live = self.live.lock().await;
        if live.contains_key(partition_id) {
            return None;
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        live.insert(partition_id.to_string(), generation);
        Some(generation)
    }

    pub(crate) async fn release(&self, partition_id: &str, generation: u64) {
        let mut live = self.live.lock().await;
        if live.get(partition_id) == Some(&generation) {
            live.remove(partition_id);
        }
    }

    pub(crate) async fn live_partitions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.live.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

pub struct ProcessorPartitionClient {
    ownership: Ownership,
    start_position: StartPosition,
    prefetch: u32,
    checkpoint_store: Arc<dyn CheckpointStore>,
    registry: PartitionRegistry,
    generation: u64,
    closed: AtomicBool,
}

impl ProcessorPartitionClient {
    pub(crate) fn new(
        ownership: Ownership,
        start_position: StartPosition,
        prefetch: u32,
        checkpoint_store: Arc<dyn CheckpointStore>,
        registry: PartitionRegistry,
        generation: u64,
    ) -> Self {
        Self {
            ownership,
            start_position,
            prefetch,
            checkpoint_store,
            registry,
            generation,
            closed: AtomicBool::new(false),
        }
    }

    pub fn partition_id(&self) -> &str {
        &self.ownership.partition_id
    }

    /// The ownership as claimed when this client was created.
    pub fn ownership(&self) -> &Ownership {
        &self.ownership
    }

    /// Where reading should begin: just after the last checkpoint, or the
    /// configured start position when there is none.
    pub fn start_position(&self) -> &StartPosition {
        &self.start_position
    }

    pub fn prefetch(&self) -> u32 {
        self.prefetch
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Record that everything up to and including this event was processed.
    pub async fn update_checkpoint(&self, sequence_number: i64, offset: Option<i64>) -> Result<()> {
        if self.is_closed() {
            return Err(ProcessorError::Closed);
        }

        let checkpoint = Checkpoint {
            consumer_group: self.ownership.consumer_group.clone(),
            event_hub_name: self.ownership.event_hub_name.clone(),
            fully_qualified_namespace: self.ownership.fully_qualified_namespace.clone(),
            partition_id: self.ownership.partition_id.clone(),
            offset,
            sequence_number: Some(sequence_number),
        };

        self.checkpoint_store.update_checkpoint(checkpoint).await?;

        debug!(
            partition_id = %self.ownership.partition_id,
            sequence_number = sequence_number,
            offset = ?offset,
            "Checkpoint updated"
        );
        Ok(())
    }

    /// Stop using this partition. Idempotent.
    ///
    /// Does not give up ownership in the store: the ownership lapses unless
    /// the processor renews it, which it keeps doing while it is running.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.registry
            .release(&self.ownership.partition_id, self.generation)
            .await;

        info!(
            partition_id = %self.ownership.partition_id,
            owner_id = %self.ownership.owner_id,
            "Partition client closed"
        );
    }
}

impl std::fmt::Debug for ProcessorPartitionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorPartitionClient")
            .field("partition_id", &self.ownership.partition_id)
            .field("owner_id", &self.ownership.owner_id)
            .field("start_position", &self.start_position)
            .field("prefetch", &self.prefetch)
            .field("closed", &self.is_closed())
            .finish()
    }
}
