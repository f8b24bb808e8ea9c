//! Processor Load Balancer - Lease-Based Partition Distribution
//!
//! Every processor in a consumer group runs its own load balancer. There is no
//! leader: each one lists the ownerships in the checkpoint store, works out its
//! fair share, and claims partitions with etag-guarded writes. Conflicting
//! claims are resolved by the store, losers simply try again next cycle.
//!
//! ## How It Works
//!
//! 1. **Snapshot**: list ownerships, synthesize records for never-claimed
//!    partitions, split live records by owner from unowned/expired ones
//! 2. **Fair Share**: `max_allowed = ceil(partitions / owners)`, where this
//!    processor always counts as an owner
//! 3. **Decide**: claim more only while below the fair share
//! 4. **Select**: pick from unowned/expired partitions first, then steal from
//!    owners above the fair share
//! 5. **Claim**: write current ∪ selected; renewing what we hold and taking
//!    what we picked in one batch
//!
//! ## Strategies
//!
//! - **Balanced**: at most one free and one stolen partition per cycle, so
//!   ownership moves gradually
//! - **Greedy**: everything needed to reach the fair share in one cycle
//!
//! A processor that already holds more than its share keeps renewing all of it.
//! Excess is shed by attrition: other processors steal it.
//!
//! ## Example
//!
//! ```rust,no_run
//! use eventhubs_checkpoint::InMemoryCheckpointStore;
//! use eventhubs_processor::{ConsumerClientDetails, ProcessorLoadBalancer, ProcessorStrategy};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> eventhubs_processor::Result<()> {
//! let load_balancer = ProcessorLoadBalancer::new(
//!     Arc::new(InMemoryCheckpointStore::new()),
//!     ConsumerClientDetails::new("ns.servicebus.windows.net", "orders", "$Default", "client-1"),
//!     ProcessorStrategy::Balanced,
//!     Duration::from_secs(60),
//! );
//!
//! let partitions: Vec<String> = (0..4).map(|i| i.to_string()).collect();
//! let owned = load_balancer.load_balance(&partitions, &CancellationToken::new()).await?;
//! println!("Now owning {} partitions", owned.len());
//! # Ok(())
//! # }
//! ```

use crate::cancel::cancellable;
use crate::config::ProcessorStrategy;
use crate::consumer::ConsumerClientDetails;
use crate::error::Result;
use crate::random::{take_random, Randomizer, ThreadRandomizer};
use eventhubs_checkpoint::{claimed, CheckpointStore, Clock, Ownership, SystemClock};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Expiration used when a zero duration is configured
const DEFAULT_EXPIRATION: Duration = Duration::from_secs(60);

/// Snapshot of the ownership landscape for one cycle
#[derive(Debug, Clone, Default)]
pub struct LoadBalancerInfo {
    /// Partitions this processor owns
    pub current: Vec<Ownership>,

    /// Partitions nobody owns, including expired and never-claimed ones
    pub unowned_or_expired: Vec<Ownership>,

    /// Every partition of every other owner holding more than `max_allowed`
    pub above_max: Vec<Ownership>,

    /// Fair share per owner, rounded up
    pub max_allowed: usize,

    /// Partitions don't divide evenly, so some owners hold `max_allowed` and
    /// others `max_allowed - 1`
    pub extra_partition_possible: bool,

    /// The listing exactly as the store returned it
    pub raw: Vec<Ownership>,
}

pub struct ProcessorLoadBalancer {
    checkpoint_store: Arc<dyn CheckpointStore>,
    details: ConsumerClientDetails,
    strategy: ProcessorStrategy,
    partition_expiration_duration: Duration,
    randomizer: Arc<dyn Randomizer>,
    clock: Arc<dyn Clock>,
}

impl ProcessorLoadBalancer {
    /// Create a load balancer. A zero expiration falls back to one minute.
    pub fn new(
        checkpoint_store: Arc<dyn CheckpointStore>,
        details: ConsumerClientDetails,
        strategy: ProcessorStrategy,
        partition_expiration_duration: Duration,
    ) -> Self {
        let partition_expiration_duration = if partition_expiration_duration.is_zero() {
            DEFAULT_EXPIRATION
        } else {
            partition_expiration_duration
        };

        Self {
            checkpoint_store,
            details,
            strategy,
            partition_expiration_duration,
            randomizer: Arc::new(ThreadRandomizer),
            clock: Arc::new(SystemClock),
        }
    }

    /// Use a custom source of randomness for partition selection
    pub fn with_randomizer(mut self, randomizer: Arc<dyn Randomizer>) -> Self {
        self.randomizer = randomizer;
        self
    }

    /// Use a custom clock for expiration decisions
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.details.client_id
    }

    pub fn strategy(&self) -> ProcessorStrategy {
        self.strategy
    }

    pub fn partition_expiration_duration(&self) -> Duration {
        self.partition_expiration_duration
    }

    /// Run one load balancing cycle.
    ///
    /// # Returns
    ///
    /// The ownerships this processor holds after the cycle: everything it
    /// renewed or newly claimed. Claims lost to another processor are left out
    /// and reconsidered next cycle.
    ///
    /// # Errors
    ///
    /// - `Store`: listing or claiming failed as a whole
    /// - `Cancelled`: `cancel` fired while a store call was in flight
    pub async fn load_balance(
        &self,
        partition_ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Ownership>> {
        if partition_ids.is_empty() {
            debug!(client_id = %self.details.client_id, "No partitions to balance");
            return Ok(Vec::new());
        }

        let mut info = self.get_available_partitions(partition_ids, cancel).await?;

        let claim_more = should_claim_more(&info);

        debug!(
            client_id = %self.details.client_id,
            current = info.current.len(),
            unowned_or_expired = info.unowned_or_expired.len(),
            above_max = info.above_max.len(),
            max_allowed = info.max_allowed,
            extra_partition_possible = info.extra_partition_possible,
            claim_more = claim_more,
            "Load balancing snapshot"
        );

        let mut to_claim = std::mem::take(&mut info.current);
        let renewing = to_claim.len();

        if claim_more {
            let selected = match self.strategy {
                ProcessorStrategy::Balanced => self.balanced_selection(&mut info),
                ProcessorStrategy::Greedy => self.greedy_selection(&mut info, renewing),
            };

            to_claim.extend(
                selected
                    .into_iter()
                    .map(|o| o.with_owner(self.details.client_id.clone())),
            );
        }

        if to_claim.is_empty() {
            return Ok(Vec::new());
        }

        let requested = to_claim.len();
        let outcomes = cancellable(
            cancel,
            self.checkpoint_store.claim_ownership(to_claim),
        )
        .await?;
        let owned = claimed(outcomes);

        if requested > renewing {
            info!(
                client_id = %self.details.client_id,
                strategy = %self.strategy,
                requested_new = requested - renewing,
                owned = owned.len(),
                lost = requested - owned.len(),
                "Claimed partitions"
            );
        }

        Ok(owned)
    }

    /// Build the ownership snapshot for a cycle.
    ///
    /// Listing is deduplicated by partition id (first record wins), restricted
    /// to `partition_ids`, and padded with unowned records for partitions that
    /// were never claimed. Calling this twice without writes in between gives
    /// the same result.
    pub async fn get_available_partitions(
        &self,
        partition_ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<LoadBalancerInfo> {
        let raw = cancellable(
            cancel,
            self.checkpoint_store.list_ownership(
                &self.details.fully_qualified_namespace,
                &self.details.event_hub_name,
                &self.details.consumer_group,
            ),
        )
        .await?;

        let wanted: HashSet<&str> = partition_ids.iter().map(String::as_str).collect();
        let now = self.clock.now();

        let mut seen: HashSet<String> = HashSet::new();
        let mut unowned_or_expired = Vec::new();

        // This processor always counts as an owner, even before it holds anything
        let mut by_owner: BTreeMap<String, Vec<Ownership>> = BTreeMap::new();
        by_owner.insert(self.details.client_id.clone(), Vec::new());

        for ownership in &raw {
            if !wanted.contains(ownership.partition_id.as_str())
                || !seen.insert(ownership.partition_id.clone())
            {
                continue;
            }

            if self.is_expired(ownership, now) {
                unowned_or_expired.push(ownership.clone());
            } else {
                by_owner
                    .entry(ownership.owner_id.clone())
                    .or_default()
                    .push(ownership.clone());
            }
        }

        for partition_id in partition_ids {
            if seen.insert(partition_id.clone()) {
                unowned_or_expired.push(Ownership::unowned(
                    self.details.fully_qualified_namespace.clone(),
                    self.details.event_hub_name.clone(),
                    self.details.consumer_group.clone(),
                    partition_id.clone(),
                ));
            }
        }

        let total = seen.len();
        let owners = by_owner.len();
        let max_allowed = total / owners + usize::from(total % owners != 0);
        let extra_partition_possible = total % owners != 0;

        let current = by_owner
            .remove(&self.details.client_id)
            .unwrap_or_default();

        let above_max = by_owner
            .into_values()
            .filter(|owned| owned.len() > max_allowed)
            .flatten()
            .collect();

        Ok(LoadBalancerInfo {
            current,
            unowned_or_expired,
            above_max,
            max_allowed,
            extra_partition_possible,
            raw,
        })
    }

    /// A record is expired if nobody owns it, it was never written, or it
    /// hasn't been renewed for longer than the expiration duration.
    fn is_expired(&self, ownership: &Ownership, now: chrono::DateTime<chrono::Utc>) -> bool {
        if ownership.is_unowned() {
            return true;
        }

        match ownership.last_modified_time {
            None => true,
            Some(last_modified) => match (now - last_modified).to_std() {
                Ok(elapsed) => elapsed > self.partition_expiration_duration,
                // Modified in the future (clock skew): still fresh
                Err(_) => false,
            },
        }
    }

    /// One free partition and one stolen partition, when available.
    fn balanced_selection(&self, info: &mut LoadBalancerInfo) -> Vec<Ownership> {
        let mut selected = Vec::with_capacity(2);

        if let Some(o) = take_random(self.randomizer.as_ref(), &mut info.unowned_or_expired) {
            selected.push(o);
        }

        if let Some(o) = take_random(self.randomizer.as_ref(), &mut info.above_max) {
            selected.push(o);
        }

        selected
    }

    /// Free partitions up to the fair share, then steal for the remainder.
    fn greedy_selection(&self, info: &mut LoadBalancerInfo, current: usize) -> Vec<Ownership> {
        let wanted = info.max_allowed.saturating_sub(current);
        let mut selected = Vec::with_capacity(wanted);

        while selected.len() < wanted {
            match take_random(self.randomizer.as_ref(), &mut info.unowned_or_expired) {
                Some(o) => selected.push(o),
                None => break,
            }
        }

        while selected.len() < wanted {
            match take_random(self.randomizer.as_ref(), &mut info.above_max) {
                Some(o) => selected.push(o),
                None => break,
            }
        }

        selected
    }
}

/// Whether this processor is below its fair share.
///
/// When partitions don't divide evenly, being one short of `max_allowed` is
/// already fair; only claim then if something is actually up for grabs.
fn should_claim_more(info: &LoadBalancerInfo) -> bool {
    let current = info.current.len();

    if current >= info.max_allowed {
        false
    } else if info.extra_partition_possible && current == info.max_allowed - 1 {
        !info.unowned_or_expired.is_empty() || !info.above_max.is_empty()
    } else {
        true
    }
}
