//! Event Hubs Processor
//!
//! Client-side partition load balancing for Event Hubs consumer groups.
//! Any number of processors, in any number of processes, share the partitions
//! of an event hub using nothing but a checkpoint store with conditional
//! writes. No coordinator, no membership protocol.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────┐
//! │                    Processor                      │
//! │                                                   │
//! │  every update_interval:                           │
//! │    ProcessorLoadBalancer ──► CheckpointStore      │
//! │      list ownerships, claim (etag CAS)            │
//! │    list checkpoints                               │
//! │    new ProcessorPartitionClient per won partition │
//! │                                                   │
//! │  next_partition_client() ◄── queue                │
//! └───────────────────────────────────────────────────┘
//! ```
//!
//! ## Components
//!
//! - [`Processor`]: lifecycle (`start`/`stop`/`run`/`close`) and the dispatch loop
//! - [`ProcessorLoadBalancer`]: one cycle of snapshot → fair share → select → claim
//! - [`ProcessorPartitionClient`]: start position and checkpointing for one partition
//! - [`EventHubClient`]: the partition list and the consumer's identity
//!
//! ## Example
//!
//! ```rust,no_run
//! use eventhubs_checkpoint::InMemoryCheckpointStore;
//! use eventhubs_processor::{ConsumerClientDetails, Processor, StaticEventHub};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> eventhubs_processor::Result<()> {
//! let event_hub = StaticEventHub::with_partition_count(
//!     ConsumerClientDetails::new("ns.servicebus.windows.net", "orders", "$Default", "worker-1"),
//!     8,
//! );
//!
//! let processor = Processor::builder()
//!     .checkpoint_store(Arc::new(InMemoryCheckpointStore::new()))
//!     .event_hub(Arc::new(event_hub))
//!     .build()?;
//!
//! let cancel = CancellationToken::new();
//! processor.start(&cancel).await?;
//!
//! let partition = processor.next_partition_client(&cancel).await?;
//! partition.update_checkpoint(42, Some(4200)).await?;
//!
//! processor.stop().await?;
//! processor.close().await?;
//! # Ok(())
//! # }
//! ```

mod cancel;
pub mod config;
pub mod consumer;
pub mod error;
pub mod load_balancer;
pub mod partition_client;
pub mod processor;
pub mod random;

pub use config::{ProcessorOptions, ProcessorStrategy, StartPosition, StartPositions};
pub use consumer::{ConsumerClientDetails, EventHubClient, EventHubProperties, StaticEventHub};
pub use error::{ProcessorError, Result};
pub use load_balancer::{LoadBalancerInfo, ProcessorLoadBalancer};
pub use partition_client::ProcessorPartitionClient;
pub use processor::{
    start_position_for, Processor, ProcessorBuilder, ProcessorState, ProcessorStats,
};
pub use random::{FirstIndex, Randomizer, SeededRandomizer, ThreadRandomizer};
