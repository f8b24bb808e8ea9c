//! Multi-Processor Integration Tests
//!
//! Several processors share one checkpoint store and must converge:
//! - Every partition owned, each owner holding floor or ceil of the fair share
//! - Same result over the blob store (object_store InMemory backend)
//! - A stopped processor's partitions are picked up after they expire
//! - No partition ever has two live partition clients at steady state

use eventhubs_checkpoint::{BlobCheckpointStore, CheckpointStore, InMemoryCheckpointStore};
use eventhubs_processor::{
    ConsumerClientDetails, Processor, ProcessorStrategy, SeededRandomizer, StaticEventHub,
};
use object_store::memory::InMemory;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "ns.servicebus.windows.net";
const EVENT_HUB: &str = "orders";
const CONSUMER_GROUP: &str = "$Default";

fn processor(
    store: Arc<dyn CheckpointStore>,
    client_id: &str,
    partitions: usize,
    strategy: ProcessorStrategy,
    seed: u64,
) -> Arc<Processor> {
    Arc::new(
        Processor::builder()
            .checkpoint_store(store)
            .event_hub(Arc::new(StaticEventHub::with_partition_count(
                ConsumerClientDetails::new(NAMESPACE, EVENT_HUB, CONSUMER_GROUP, client_id),
                partitions,
            )))
            .strategy(strategy)
            .update_interval(Duration::from_millis(20))
            .partition_expiration_duration(Duration::from_millis(500))
            .randomizer(Arc::new(SeededRandomizer::new(seed)))
            .build()
            .unwrap(),
    )
}

async fn distribution(store: &dyn CheckpointStore) -> BTreeMap<String, usize> {
    let mut by_owner = BTreeMap::new();
    for o in store
        .list_ownership(NAMESPACE, EVENT_HUB, CONSUMER_GROUP)
        .await
        .unwrap()
    {
        *by_owner.entry(o.owner_id).or_insert(0) += 1;
    }
    by_owner
}

fn is_balanced(by_owner: &BTreeMap<String, usize>, owners: &[&str], total: usize) -> bool {
    let min = total / owners.len();
    let max = if total % owners.len() > 0 { min + 1 } else { min };

    by_owner.len() == owners.len()
        && owners.iter().all(|o| by_owner.contains_key(*o))
        && by_owner.values().sum::<usize>() == total
        && by_owner.values().all(|&n| n == min || n == max)
}

/// Poll the store until the expected owners share the partitions fairly
async fn wait_for_balance(store: &dyn CheckpointStore, owners: &[&str], total: usize) {
    let result = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            if is_balanced(&distribution(store).await, owners, total) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;

    assert!(
        result.is_ok(),
        "did not converge: {:?}",
        distribution(store).await
    );
}

async fn start_all(processors: &[Arc<Processor>], cancel: &CancellationToken) {
    for p in processors {
        p.start(cancel).await.unwrap();
    }
}

async fn stop_all(processors: &[Arc<Processor>]) {
    for p in processors {
        p.stop().await.unwrap();
    }
}

#[tokio::test]
async fn test_balanced_processors_converge() {
    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let owners = ["client-a", "client-b", "client-c"];
    let processors: Vec<_> = owners
        .iter()
        .enumerate()
        .map(|(i, id)| processor(Arc::clone(&store), id, 8, ProcessorStrategy::Balanced, i as u64))
        .collect();

    let cancel = CancellationToken::new();
    start_all(&processors, &cancel).await;

    wait_for_balance(store.as_ref(), &owners, 8).await;

    stop_all(&processors).await;
}

#[tokio::test]
async fn test_greedy_processors_converge() {
    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let owners = ["client-a", "client-b", "client-c", "client-d"];
    let processors: Vec<_> = owners
        .iter()
        .enumerate()
        .map(|(i, id)| processor(Arc::clone(&store), id, 10, ProcessorStrategy::Greedy, i as u64))
        .collect();

    let cancel = CancellationToken::new();
    start_all(&processors, &cancel).await;

    wait_for_balance(store.as_ref(), &owners, 10).await;

    stop_all(&processors).await;
}

#[tokio::test]
async fn test_processors_converge_over_blob_store() {
    let store: Arc<dyn CheckpointStore> =
        Arc::new(BlobCheckpointStore::new(Arc::new(InMemory::new())));
    let owners = ["client-a", "client-b"];
    let processors: Vec<_> = owners
        .iter()
        .enumerate()
        .map(|(i, id)| processor(Arc::clone(&store), id, 5, ProcessorStrategy::Balanced, i as u64))
        .collect();

    let cancel = CancellationToken::new();
    start_all(&processors, &cancel).await;

    wait_for_balance(store.as_ref(), &owners, 5).await;

    stop_all(&processors).await;
}

#[tokio::test]
async fn test_stopped_processor_partitions_are_taken_over() {
    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let processors: Vec<_> = ["client-a", "client-b", "client-c"]
        .iter()
        .enumerate()
        .map(|(i, id)| processor(Arc::clone(&store), id, 6, ProcessorStrategy::Balanced, i as u64))
        .collect();

    let cancel = CancellationToken::new();
    start_all(&processors, &cancel).await;
    wait_for_balance(store.as_ref(), &["client-a", "client-b", "client-c"], 6).await;

    // client-c goes away; its ownerships stop being renewed and expire
    processors[2].stop().await.unwrap();

    wait_for_balance(store.as_ref(), &["client-a", "client-b"], 6).await;

    stop_all(&processors[..2]).await;
}

#[tokio::test]
async fn test_each_partition_handed_out_once_at_steady_state() {
    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let owners = ["client-a", "client-b"];
    let processors: Vec<_> = owners
        .iter()
        .enumerate()
        .map(|(i, id)| processor(Arc::clone(&store), id, 4, ProcessorStrategy::Greedy, i as u64))
        .collect();

    let cancel = CancellationToken::new();
    start_all(&processors, &cancel).await;
    wait_for_balance(store.as_ref(), &owners, 4).await;

    // Let a few more cycles run on the settled layout
    tokio::time::sleep(Duration::from_millis(100)).await;
    stop_all(&processors).await;

    let by_owner = distribution(store.as_ref()).await;
    for (p, owner) in processors.iter().zip(owners) {
        let live = p.live_partitions().await;
        let mut unique = live.clone();
        unique.dedup();
        assert_eq!(live, unique, "{} has duplicate clients", owner);
        assert!(
            live.len() >= by_owner[owner],
            "{} should have a client for every partition it owns",
            owner
        );
    }
}
