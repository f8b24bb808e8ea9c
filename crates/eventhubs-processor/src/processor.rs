//! Processor - drives load balancing and hands out partition clients.
//!
//! ## Lifecycle
//!
//! ```text
//! Stopped ──start()──► Running ──stop() / cancel──► Stopped ──close()──► Closed
//! ```
//!
//! `run()` drives the same loop on the caller's task instead of spawning one.
//!
//! ## Each Cycle
//!
//! 1. Load balance: renew current ownerships, claim more if below fair share
//! 2. List checkpoints for the consumer group
//! 3. For every owned partition without a live client, create one starting
//!    after its checkpoint and queue it for [`Processor::next_partition_client`]
//!
//! A failed cycle is logged and retried after the normal interval. Only
//! configuration errors end the loop.
//!
//! Partitions lost to another processor are not forcibly taken away from their
//! clients here; the transport notices when the service moves the partition.

use crate::cancel::cancellable;
use crate::config::{ProcessorOptions, ProcessorStrategy, StartPosition, StartPositions};
use crate::consumer::{ConsumerClientDetails, EventHubClient};
use crate::error::{ProcessorError, Result};
use crate::load_balancer::ProcessorLoadBalancer;
use crate::partition_client::{PartitionRegistry, ProcessorPartitionClient};
use crate::random::Randomizer;
use eventhubs_checkpoint::{Checkpoint, CheckpointStore, Clock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Processor lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Stopped,
    Running,
    Closed,
}

/// Processor statistics
#[derive(Debug, Default, Clone)]
pub struct ProcessorStats {
    /// Load balancing cycles attempted
    pub cycles: u64,

    /// Cycles that ended in an error
    pub failed_cycles: u64,

    /// Partitions owned after the last successful cycle
    pub owned_partitions: usize,

    /// Partition clients handed out so far
    pub partition_clients_created: u64,

    /// Duration of the last successful cycle in milliseconds
    pub last_cycle_ms: u64,
}

struct RunningTask {
    handle: JoinHandle<Result<()>>,
    cancel: CancellationToken,
}

pub struct Processor {
    dispatcher: Arc<Dispatcher>,
    ready_rx: Mutex<mpsc::UnboundedReceiver<Arc<ProcessorPartitionClient>>>,
    task: RwLock<Option<RunningTask>>,
    closed: AtomicBool,
    /// Wakes callers parked in `next_partition_client` on close
    closing: CancellationToken,
}

impl Processor {
    pub fn builder() -> ProcessorBuilder {
        ProcessorBuilder::new()
    }

    pub fn client_id(&self) -> &str {
        &self.dispatcher.details.client_id
    }

    pub fn options(&self) -> &ProcessorOptions {
        &self.dispatcher.options
    }

    pub async fn state(&self) -> ProcessorState {
        if self.closed.load(Ordering::Acquire) {
            return ProcessorState::Closed;
        }
        match self.task.read().await.as_ref() {
            Some(task) if !task.handle.is_finished() => ProcessorState::Running,
            _ => ProcessorState::Stopped,
        }
    }

    pub async fn is_running(&self) -> bool {
        self.state().await == ProcessorState::Running
    }

    /// Start load balancing on a background task.
    ///
    /// The loop runs until [`stop`](Self::stop) is called or `cancel` fires.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        // Checked under the task lock so a concurrent close() is ordered
        let mut task_guard = self.task.write().await;

        if self.closed.load(Ordering::Acquire) {
            return Err(ProcessorError::Closed);
        }

        if let Some(task) = task_guard.as_ref() {
            if !task.handle.is_finished() {
                return Err(ProcessorError::AlreadyRunning);
            }
        }

        info!(
            client_id = %self.dispatcher.details.client_id,
            strategy = %self.dispatcher.options.load_balancing_strategy,
            interval_ms = self.dispatcher.options.update_interval.as_millis() as u64,
            "Starting processor"
        );

        let task_cancel = cancel.child_token();
        let dispatcher = Arc::clone(&self.dispatcher);
        let loop_cancel = task_cancel.clone();

        let handle = tokio::spawn(async move {
            let result = dispatcher.run_loop(&loop_cancel).await;
            if let Err(e) = &result {
                error!(
                    client_id = %dispatcher.details.client_id,
                    error = %e,
                    "Processor loop terminated"
                );
            }
            result
        });

        *task_guard = Some(RunningTask {
            handle,
            cancel: task_cancel,
        });

        Ok(())
    }

    /// Stop the background loop and wait for it to finish. No-op when stopped.
    ///
    /// Returns the error that ended the loop, if it ended on its own with one.
    pub async fn stop(&self) -> Result<()> {
        let task = self.task.write().await.take();

        if let Some(task) = task {
            task.cancel.cancel();
            let result = task.handle.await?;

            info!(
                client_id = %self.dispatcher.details.client_id,
                "Processor stopped"
            );
            return result;
        }

        Ok(())
    }

    /// Run load balancing on the current task until `cancel` fires.
    ///
    /// Independent of [`start`](Self::start)/[`stop`](Self::stop).
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProcessorError::Closed);
        }
        self.dispatcher.run_loop(cancel).await
    }

    /// One load balancing cycle over the given partitions.
    pub async fn dispatch(&self, partition_ids: &[String], cancel: &CancellationToken) -> Result<()> {
        self.dispatcher.dispatch(partition_ids, cancel).await
    }

    /// Wait for the next partition this processor acquired.
    ///
    /// # Errors
    ///
    /// - `Cancelled`: `cancel` fired before a partition became available
    /// - `Closed`: the processor was closed
    pub async fn next_partition_client(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<ProcessorPartitionClient>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProcessorError::Closed);
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(ProcessorError::Cancelled),
            _ = self.closing.cancelled() => Err(ProcessorError::Closed),
            client = async {
                let mut rx = self.ready_rx.lock().await;
                rx.recv().await
            } => client.ok_or(ProcessorError::Closed),
        }
    }

    /// Close a stopped processor, closing partition clients nobody picked up.
    ///
    /// # Errors
    ///
    /// - `StillRunning`: call [`stop`](Self::stop) first
    pub async fn close(&self) -> Result<()> {
        {
            let task_guard = self.task.write().await;
            if matches!(task_guard.as_ref(), Some(task) if !task.handle.is_finished()) {
                return Err(ProcessorError::StillRunning);
            }

            if self.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
        }
        self.closing.cancel();

        let mut rx = self.ready_rx.lock().await;
        let mut drained = 0usize;
        while let Ok(client) = rx.try_recv() {
            client.close().await;
            drained += 1;
        }

        info!(
            client_id = %self.dispatcher.details.client_id,
            drained = drained,
            "Processor closed"
        );
        Ok(())
    }

    /// Partition ids with a live partition client
    pub async fn live_partitions(&self) -> Vec<String> {
        self.dispatcher.registry.live_partitions().await
    }

    pub async fn get_stats(&self) -> ProcessorStats {
        self.dispatcher.stats.read().await.clone()
    }
}

/// Everything one load balancing loop needs; shared between the processor
/// and its background task.
struct Dispatcher {
    details: ConsumerClientDetails,
    options: ProcessorOptions,
    event_hub: Arc<dyn EventHubClient>,
    checkpoint_store: Arc<dyn CheckpointStore>,
    load_balancer: ProcessorLoadBalancer,
    registry: PartitionRegistry,
    ready_tx: mpsc::UnboundedSender<Arc<ProcessorPartitionClient>>,
    stats: RwLock<ProcessorStats>,
}

impl Dispatcher {
    async fn run_loop(&self, cancel: &CancellationToken) -> Result<()> {
        let properties = match cancellable(cancel, self.event_hub.get_event_hub_properties()).await {
            Ok(properties) => properties,
            Err(ProcessorError::Cancelled) => return Ok(()),
            Err(e) => return Err(e),
        };

        let mut partition_ids = properties.partition_ids;
        if self.options.maximum_number_of_partitions > 0 {
            partition_ids.truncate(self.options.maximum_number_of_partitions);
        }

        info!(
            client_id = %self.details.client_id,
            event_hub = %properties.name,
            partitions = partition_ids.len(),
            "Processor loop started"
        );

        while !cancel.is_cancelled() {
            match self.dispatch(&partition_ids, cancel).await {
                Ok(()) => {}
                Err(ProcessorError::Cancelled) => break,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    self.stats.write().await.failed_cycles += 1;
                    warn!(
                        client_id = %self.details.client_id,
                        error = %e,
                        "Load balancing cycle failed"
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.options.update_interval) => {}
            }
        }

        let stats = self.stats.read().await;
        info!(
            client_id = %self.details.client_id,
            cycles = stats.cycles,
            failed_cycles = stats.failed_cycles,
            owned_partitions = stats.owned_partitions,
            "Processor loop stopped"
        );
        Ok(())
    }

    async fn dispatch(&self, partition_ids: &[String], cancel: &CancellationToken) -> Result<()> {
        let started = Instant::now();
        self.stats.write().await.cycles += 1;

        let owned = self.load_balancer.load_balance(partition_ids, cancel).await?;
        self.stats.write().await.owned_partitions = owned.len();

        let checkpoints: HashMap<String, Checkpoint> = cancellable(
            cancel,
            self.checkpoint_store.list_checkpoints(
                &self.details.fully_qualified_namespace,
                &self.details.event_hub_name,
                &self.details.consumer_group,
            ),
        )
        .await?
        .into_iter()
        .map(|c| (c.partition_id.clone(), c))
        .collect();

        let mut created = 0u64;
        for ownership in &owned {
            let Some(generation) = self.registry.reserve(&ownership.partition_id).await else {
                continue;
            };

            let start_position = match start_position_for(
                &ownership.partition_id,
                checkpoints.get(&ownership.partition_id),
                &self.options.start_positions,
            ) {
                Ok(position) => position,
                Err(e) => {
                    self.registry.release(&ownership.partition_id, generation).await;
                    return Err(e);
                }
            };

            let client = Arc::new(ProcessorPartitionClient::new(
                ownership.clone(),
                start_position,
                self.options.prefetch,
                Arc::clone(&self.checkpoint_store),
                self.registry.clone(),
                generation,
            ));

            info!(
                client_id = %self.details.client_id,
                partition_id = %ownership.partition_id,
                start_position = ?client.start_position(),
                "Acquired partition"
            );

            if self.ready_tx.send(client).is_err() {
                // Receiver is owned by the processor, gone only while dropping
                self.registry.release(&ownership.partition_id, generation).await;
                return Err(ProcessorError::Closed);
            }
            // Counted per client so a cycle failing later still records it
            self.stats.write().await.partition_clients_created += 1;
            created += 1;
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.stats.write().await.last_cycle_ms = elapsed_ms;

        debug!(
            client_id = %self.details.client_id,
            owned = owned.len(),
            new_clients = created,
            elapsed_ms = elapsed_ms,
            "Load balancing cycle complete"
        );
        Ok(())
    }
}

/// Where a new partition client starts reading.
///
/// A checkpoint wins over configuration: resume just after its offset, or
/// after its sequence number if it has no offset. Without a checkpoint the
/// per-partition override applies, then the default.
pub fn start_position_for(
    partition_id: &str,
    checkpoint: Option<&Checkpoint>,
    start_positions: &StartPositions,
) -> Result<StartPosition> {
    match checkpoint {
        Some(cp) => match (cp.offset, cp.sequence_number) {
            (Some(offset), _) => Ok(StartPosition::Offset {
                offset,
                inclusive: false,
            }),
            (None, Some(sequence_number)) => Ok(StartPosition::SequenceNumber {
                sequence_number,
                inclusive: false,
            }),
            (None, None) => Err(ProcessorError::InvalidCheckpoint {
                partition_id: partition_id.to_string(),
            }),
        },
        None => Ok(start_positions.for_partition(partition_id)),
    }
}

/// Builder for [`Processor`]
pub struct ProcessorBuilder {
    options: ProcessorOptions,
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    event_hub: Option<Arc<dyn EventHubClient>>,
    randomizer: Option<Arc<dyn Randomizer>>,
    clock: Option<Arc<dyn Clock>>,
}

impl ProcessorBuilder {
    pub fn new() -> Self {
        Self {
            options: ProcessorOptions::default(),
            checkpoint_store: None,
            event_hub: None,
            randomizer: None,
            clock: None,
        }
    }

    /// Replace all options at once
    pub fn options(mut self, options: ProcessorOptions) -> Self {
        self.options = options;
        self
    }

    /// Set checkpoint store (required)
    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    /// Set the event hub client the processor balances partitions of (required)
    pub fn event_hub(mut self, event_hub: Arc<dyn EventHubClient>) -> Self {
        self.event_hub = Some(event_hub);
        self
    }

    /// Set load balancing strategy
    pub fn strategy(mut self, strategy: ProcessorStrategy) -> Self {
        self.options.load_balancing_strategy = strategy;
        self
    }

    /// Set time between load balancing cycles
    pub fn update_interval(mut self, interval: Duration) -> Self {
        self.options.update_interval = interval;
        self
    }

    /// Set ownership expiration
    pub fn partition_expiration_duration(mut self, duration: Duration) -> Self {
        self.options.partition_expiration_duration = duration;
        self
    }

    /// Set start positions for partitions without a checkpoint
    pub fn start_positions(mut self, positions: StartPositions) -> Self {
        self.options.start_positions = positions;
        self
    }

    /// Set prefetch count handed to partition clients
    pub fn prefetch(mut self, prefetch: u32) -> Self {
        self.options.prefetch = prefetch;
        self
    }

    /// Only balance the first N partitions (0 = all)
    pub fn maximum_number_of_partitions(mut self, max: usize) -> Self {
        self.options.maximum_number_of_partitions = max;
        self
    }

    /// Set the source of randomness for partition selection
    pub fn randomizer(mut self, randomizer: Arc<dyn Randomizer>) -> Self {
        self.randomizer = Some(randomizer);
        self
    }

    /// Set the clock used for expiration decisions
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the processor
    pub fn build(self) -> Result<Processor> {
        let checkpoint_store = self
            .checkpoint_store
            .ok_or_else(|| ProcessorError::Configuration("checkpoint_store is required".to_string()))?;

        let event_hub = self
            .event_hub
            .ok_or_else(|| ProcessorError::Configuration("event_hub is required".to_string()))?;

        if self.options.update_interval.is_zero() {
            return Err(ProcessorError::Configuration(
                "update_interval must be greater than zero".to_string(),
            ));
        }

        let details = event_hub.details().clone();
        if details.client_id.is_empty() {
            return Err(ProcessorError::Configuration("client_id is required".to_string()));
        }

        let mut load_balancer = ProcessorLoadBalancer::new(
            Arc::clone(&checkpoint_store),
            details.clone(),
            self.options.load_balancing_strategy,
            self.options.partition_expiration_duration,
        );
        if let Some(randomizer) = self.randomizer {
            load_balancer = load_balancer.with_randomizer(randomizer);
        }
        if let Some(clock) = self.clock {
            load_balancer = load_balancer.with_clock(clock);
        }

        let (ready_tx, ready_rx) = mpsc::unbounded_channel();

        Ok(Processor {
            dispatcher: Arc::new(Dispatcher {
                details,
                options: self.options,
                event_hub,
                checkpoint_store,
                load_balancer,
                registry: PartitionRegistry::default(),
                ready_tx,
                stats: RwLock::new(ProcessorStats::default()),
            }),
            ready_rx: Mutex::new(ready_rx),
            task: RwLock::new(None),
            closed: AtomicBool::new(false),
            closing: CancellationToken::new(),
        })
    }
}

impl Default for ProcessorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
