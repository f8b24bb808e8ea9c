//! Event Hubs Checkpoint Store
//!
//! Shared storage for partition ownership and consumer checkpoints. This is the
//! only thing processors in a consumer group share: there is no coordinator, every
//! instance lists ownerships, decides what to claim, and claims it with a
//! conditional write.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌─────────────┐
//! │ Processor A │   │ Processor B │   │ Processor C │
//! └──────┬──────┘   └──────┬──────┘   └──────┬──────┘
//!        │ list / claim (If-Match etag)      │
//!        └─────────────────┼─────────────────┘
//!                          ▼
//!                ┌───────────────────┐
//!                │  CheckpointStore  │ ◄── You are here
//!                │ (blob / in-memory)│
//!                └───────────────────┘
//! ```
//!
//! ## Components
//!
//! - [`CheckpointStore`]: the storage contract
//! - [`InMemoryCheckpointStore`]: process-local store for tests and simulation
//! - [`BlobCheckpointStore`]: object store backed implementation (Azure Blob in
//!   production, `object_store::memory::InMemory` in tests)
//! - [`Clock`]: injectable time source
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use eventhubs_checkpoint::{claimed, CheckpointStore, InMemoryCheckpointStore, Ownership};
//!
//! # async fn example() -> eventhubs_checkpoint::Result<()> {
//! let store = InMemoryCheckpointStore::new();
//!
//! let wanted = Ownership::unowned("ns.servicebus.windows.net", "orders", "$Default", "0")
//!     .with_owner("processor-a");
//!
//! let won = claimed(store.claim_ownership(vec![wanted]).await?);
//! assert_eq!(won.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod blob;
pub mod clock;
pub mod error;
pub mod memory;
pub mod types;

pub use blob::BlobCheckpointStore;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CheckpointStoreError, Result};
pub use memory::InMemoryCheckpointStore;
pub use types::{claimed, Checkpoint, ClaimOutcome, LostReason, Ownership};

use async_trait::async_trait;

/// Storage contract for ownerships and checkpoints.
///
/// Implementations must be safe to share between tasks and between processes:
/// the only coordination primitive is the etag compare-and-swap performed by
/// [`claim_ownership`](CheckpointStore::claim_ownership).
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// List every ownership record ever written in a scope.
    ///
    /// Partitions that were never claimed have no record and are absent.
    /// Records of other namespaces, event hubs or consumer groups are never
    /// returned.
    async fn list_ownership(
        &self,
        fully_qualified_namespace: &str,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<Ownership>>;

    /// Claim a batch of ownerships.
    ///
    /// Each item is an independent compare-and-swap:
    /// - with an `etag`, the write lands only if the stored etag still matches
    /// - without an `etag`, the write creates the slot only if it doesn't exist
    ///
    /// # Returns
    ///
    /// One [`ClaimOutcome`] per input, in input order. `Claimed` items carry the
    /// new etag and last-modified time assigned by the store.
    ///
    /// # Errors
    ///
    /// Only failures that prevent the whole batch from being attempted. Per-item
    /// failures (contention or otherwise) are reported as `ClaimOutcome::Lost`.
    async fn claim_ownership(&self, ownerships: Vec<Ownership>) -> Result<Vec<ClaimOutcome>>;

    /// List every checkpoint in a scope.
    async fn list_checkpoints(
        &self,
        fully_qualified_namespace: &str,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<Checkpoint>>;

    /// Create or overwrite the checkpoint for a partition. Unconditional.
    async fn update_checkpoint(&self, checkpoint: Checkpoint) -> Result<()>;
}
