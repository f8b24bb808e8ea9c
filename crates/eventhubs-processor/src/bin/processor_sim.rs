//! Processor Simulation Binary
//!
//! Runs several processors in one process against a shared checkpoint store and
//! logs how ownership of the partitions converges.
//!
//! # Environment Variables
//!
//! - `SIM_PROCESSORS`: Number of processors to run (default: 3)
//! - `SIM_PARTITIONS`: Number of partitions in the simulated event hub (default: 8)
//! - `SIM_DURATION_SECS`: How long to run before shutting down (default: 60)
//! - `SIM_CLIENT_PREFIX`: Prefix for processor client ids (default: hostname-based)
//! - `EVENTHUB_NAMESPACE`: Fully qualified namespace (default: sim.servicebus.windows.net)
//! - `EVENTHUB_NAME`: Event hub name (default: sim)
//! - `EVENTHUB_CONSUMER_GROUP`: Consumer group (default: $Default)
//! - `CHECKPOINT_STORE`: `memory` or `azure` (default: memory)
//! - `CHECKPOINT_CONTAINER`: Blob container when `CHECKPOINT_STORE=azure`
//! - `AZURE_STORAGE_ACCOUNT_NAME`, `AZURE_STORAGE_ACCOUNT_KEY`: Azure credentials
//! - `PROCESSOR_*`: Processor options, see `ProcessorOptions::from_env`
//!
//! # Example
//!
//! ```bash
//! export SIM_PROCESSORS=4
//! export SIM_PARTITIONS=16
//! export PROCESSOR_UPDATE_INTERVAL_MS=500
//! export PROCESSOR_STRATEGY=greedy
//! cargo run --bin processor-sim
//! ```

use eventhubs_checkpoint::{BlobCheckpointStore, CheckpointStore, InMemoryCheckpointStore};
use eventhubs_processor::{
    ConsumerClientDetails, Processor, ProcessorError, ProcessorOptions, StaticEventHub,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Setup logging
    let log_level = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info".to_string())
        .parse()
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Load configuration from environment
    let processor_count = env_parse("SIM_PROCESSORS", 3usize);
    let partition_count = env_parse("SIM_PARTITIONS", 8usize);
    let duration = Duration::from_secs(env_parse("SIM_DURATION_SECS", 60u64));

    let client_prefix = std::env::var("SIM_CLIENT_PREFIX").unwrap_or_else(|_| {
        hostname::get()
            .ok()
            .and_then(|h| h.to_str().map(|s| format!("processor-{}", s)))
            .unwrap_or_else(|| format!("processor-{}", uuid::Uuid::new_v4()))
    });

    let namespace = std::env::var("EVENTHUB_NAMESPACE")
        .unwrap_or_else(|_| "sim.servicebus.windows.net".to_string());
    let event_hub_name = std::env::var("EVENTHUB_NAME").unwrap_or_else(|_| "sim".to_string());
    let consumer_group =
        std::env::var("EVENTHUB_CONSUMER_GROUP").unwrap_or_else(|_| "$Default".to_string());

    let options = ProcessorOptions::from_env()?;

    info!("Configuration:");
    info!("  Processors: {}", processor_count);
    info!("  Partitions: {}", partition_count);
    info!("  Duration: {:?}", duration);
    info!("  Event hub: {}/{}/{}", namespace, event_hub_name, consumer_group);
    info!("  Strategy: {}", options.load_balancing_strategy);
    info!("  Update interval: {:?}", options.update_interval);
    info!("  Partition expiration: {:?}", options.partition_expiration_duration);

    let checkpoint_store: Arc<dyn CheckpointStore> =
        match std::env::var("CHECKPOINT_STORE").as_deref() {
            Ok("azure") => {
                let container = std::env::var("CHECKPOINT_CONTAINER")
                    .map_err(|_| "CHECKPOINT_CONTAINER is required for the azure store")?;
                info!("  Checkpoint store: azure blob container {}", container);
                Arc::new(BlobCheckpointStore::azure_from_env(&container)?)
            }
            Ok("memory") | Err(_) => {
                info!("  Checkpoint store: in-memory");
                Arc::new(InMemoryCheckpointStore::new())
            }
            Ok(other) => return Err(format!("unknown CHECKPOINT_STORE '{}'", other).into()),
        };

    let shutdown = CancellationToken::new();
    let mut processors = Vec::with_capacity(processor_count);
    let mut consumers = Vec::with_capacity(processor_count);

    for i in 0..processor_count {
        let details = ConsumerClientDetails::new(
            namespace.clone(),
            event_hub_name.clone(),
            consumer_group.clone(),
            format!("{}-{}", client_prefix, i),
        );

        let processor = Arc::new(
            Processor::builder()
                .checkpoint_store(Arc::clone(&checkpoint_store))
                .event_hub(Arc::new(StaticEventHub::with_partition_count(
                    details,
                    partition_count,
                )))
                .options(options.clone())
                .build()?,
        );

        processor.start(&shutdown).await?;
        consumers.push(tokio::spawn(consume_partitions(
            Arc::clone(&processor),
            shutdown.clone(),
        )));
        processors.push(processor);
    }

    info!("✅ {} processors started", processor_count);

    let report_every = options.update_interval.max(Duration::from_secs(1));
    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                info!("Simulation time elapsed");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            _ = tokio::time::sleep(report_every) => {
                if let Err(e) = report_distribution(
                    checkpoint_store.as_ref(),
                    &namespace,
                    &event_hub_name,
                    &consumer_group,
                ).await {
                    warn!(error = %e, "Failed to list ownership");
                }
            }
        }
    }

    shutdown.cancel();

    for processor in &processors {
        if let Err(e) = processor.stop().await {
            error!(client_id = %processor.client_id(), error = %e, "Processor stopped with error");
        }
        processor.close().await?;
    }

    for consumer in consumers {
        if let Err(e) = consumer.await {
            warn!(error = %e, "Partition consumer task failed");
        }
    }

    for processor in &processors {
        let stats = processor.get_stats().await;
        info!(
            client_id = %processor.client_id(),
            cycles = stats.cycles,
            failed_cycles = stats.failed_cycles,
            owned_partitions = stats.owned_partitions,
            partition_clients_created = stats.partition_clients_created,
            "Final processor stats"
        );
    }

    info!("👋 Simulation finished");
    Ok(())
}

/// Take every partition client the processor hands out and checkpoint it once
async fn consume_partitions(processor: Arc<Processor>, shutdown: CancellationToken) {
    loop {
        let partition = match processor.next_partition_client(&shutdown).await {
            Ok(partition) => partition,
            Err(ProcessorError::Cancelled) | Err(ProcessorError::Closed) => return,
            Err(e) => {
                warn!(client_id = %processor.client_id(), error = %e, "Failed to get partition client");
                return;
            }
        };

        info!(
            client_id = %processor.client_id(),
            partition_id = %partition.partition_id(),
            start_position = ?partition.start_position(),
            "Processing partition"
        );

        if let Err(e) = partition.update_checkpoint(0, Some(0)).await {
            warn!(
                partition_id = %partition.partition_id(),
                error = %e,
                "Failed to checkpoint"
            );
        }
    }
}

async fn report_distribution(
    store: &dyn CheckpointStore,
    namespace: &str,
    event_hub_name: &str,
    consumer_group: &str,
) -> eventhubs_checkpoint::Result<()> {
    let ownerships = store
        .list_ownership(namespace, event_hub_name, consumer_group)
        .await?;

    let mut by_owner: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for o in ownerships {
        by_owner.entry(o.owner_id).or_default().push(o.partition_id);
    }

    for (owner, partitions) in &by_owner {
        info!(owner = %owner, count = partitions.len(), partitions = ?partitions, "Ownership");
    }
    Ok(())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
