use crate::{
    client_metrics::{
        LOAD_BALANCING_DURATION_SECONDS, OWNERSHIP_CLAIMS_TOTAL, OWNERSHIP_CLAIM_CONFLICTS_TOTAL,
        PARTITION_STEALS_TOTAL,
    },
    errors::Result,
    event_handler::CloseReason,
    options::{LoadBalancingStrategy, ProcessorOptions},
    pump_manager::PartitionPumpManager,
};

use async_trait::async_trait;
use metrics::{counter, histogram};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, info, warn};
use tributary_core::{Checkpoint, Clock, OwnershipStore, PartitionOwnership};

/// Enumerates the partitions of the event hub.
#[async_trait]
pub trait PartitionSource: Send + Sync + 'static {
    async fn partition_ids(&self) -> Result<Vec<String>>;
}

/// A partition claimed away from another active owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Steal {
    pub(crate) from_owner: String,
    pub(crate) request: PartitionOwnership,
}

/// What one instance asks the store for in a single pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ClaimPlan {
    // partitions this instance should hold once balanced
    pub(crate) target: usize,
    // partitions the snapshot shows as actively owned by this instance
    pub(crate) owned: Vec<String>,
    pub(crate) renewals: Vec<PartitionOwnership>,
    pub(crate) claims: Vec<PartitionOwnership>,
    pub(crate) steal: Option<Steal>,
}

impl ClaimPlan {
    fn requests(&self) -> Vec<PartitionOwnership> {
        self.renewals
            .iter()
            .chain(self.claims.iter())
            .chain(self.steal.iter().map(|steal| &steal.request))
            .cloned()
            .collect()
    }
}

/// Computes the claims of one balancing pass from an ownership snapshot.
///
/// Deterministic: active owners are ordered by owner id, partitions keep the
/// enumeration order of the partition source.
#[derive(Debug, Clone)]
pub(crate) struct ClaimPlanner {
    pub(crate) event_hub_name: String,
    pub(crate) consumer_group: String,
    pub(crate) owner_id: String,
    pub(crate) expiration: Duration,
    pub(crate) strategy: LoadBalancingStrategy,
}

impl ClaimPlanner {
    pub(crate) fn plan(
        &self,
        partitions: &[String],
        records: &[PartitionOwnership],
        now: SystemTime,
    ) -> ClaimPlan {
        if partitions.is_empty() {
            return ClaimPlan::default();
        }

        let by_partition: HashMap<&str, &PartitionOwnership> = records
            .iter()
            .map(|record| (record.partition_id.as_str(), record))
            .collect();

        // this instance counts as an active owner even while it holds nothing
        let mut owners: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        owners.insert(self.owner_id.as_str(), Vec::new());
        let mut claimable = Vec::new();

        for partition_id in partitions {
            let record = by_partition.get(partition_id.as_str()).copied();
            match record.and_then(|r| r.is_active(now, self.expiration).then(|| r.owner())) {
                Some(Some(owner)) => owners.entry(owner).or_default().push(partition_id),
                _ => claimable.push(partition_id.as_str()),
            }
        }

        let min_per_owner = partitions.len() / owners.len();
        let remainder = partitions.len() % owners.len();
        let targets: BTreeMap<&str, usize> = owners
            .keys()
            .enumerate()
            .map(|(rank, owner)| (*owner, min_per_owner + usize::from(rank < remainder)))
            .collect();
        let target = targets
            .get(self.owner_id.as_str())
            .copied()
            .unwrap_or(min_per_owner);

        let owned: Vec<&str> = owners
            .get(self.owner_id.as_str())
            .cloned()
            .unwrap_or_default();
        let mut plan = ClaimPlan {
            target,
            owned: owned.iter().map(|p| p.to_string()).collect(),
            renewals: owned
                .iter()
                .map(|p| self.claim_for(p, by_partition.get(p).copied()))
                .collect(),
            ..Default::default()
        };

        if owned.len() >= target {
            return plan;
        }

        let wanted = match self.strategy {
            LoadBalancingStrategy::Balanced => 1,
            LoadBalancingStrategy::Greedy => target - owned.len(),
        };
        plan.claims = claimable
            .iter()
            .take(wanted)
            .map(|p| self.claim_for(p, by_partition.get(p).copied()))
            .collect();
        if !plan.claims.is_empty() {
            return plan;
        }

        // nothing free: take one partition from the most loaded owner above its target,
        // ties broken by owner id
        let victim = owners
            .iter()
            .filter(|(owner, _)| **owner != self.owner_id.as_str())
            .filter(|(owner, held)| held.len() > targets.get(*owner).copied().unwrap_or(0))
            .max_by(|a, b| a.1.len().cmp(&b.1.len()).then_with(|| b.0.cmp(a.0)));

        if let Some((owner, held)) = victim {
            if let Some(partition_id) = held.first() {
                plan.steal = Some(Steal {
                    from_owner: owner.to_string(),
                    request: self.claim_for(partition_id, by_partition.get(partition_id).copied()),
                });
            }
        }
        plan
    }

    // Conditional claim: carries the etag of the record it overwrites.
    fn claim_for(
        &self,
        partition_id: &str,
        record: Option<&PartitionOwnership>,
    ) -> PartitionOwnership {
        match record {
            Some(record) => record.clone().with_owner(self.owner_id.clone()),
            None => PartitionOwnership::new(&self.event_hub_name, &self.consumer_group, partition_id)
                .with_owner(self.owner_id.clone()),
        }
    }
}

/// Outcome of one `run_once` pass, for logging and simulations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    /// False when the pass aborted on a store or enumeration failure.
    pub completed: bool,
    pub partition_count: usize,
    pub target: usize,
    /// Partitions owned by this instance once the pass completed.
    pub owned: Vec<String>,
    pub claimed: Vec<String>,
    pub stolen: Vec<String>,
    /// Partitions whose pumps were stopped because ownership was lost.
    pub lost: Vec<String>,
}

/// Periodic coordination step dividing the partitions among the active instances
/// of a consumer group, through conditional writes to the ownership store.
pub struct PartitionLoadBalancer {
    store: Arc<dyn OwnershipStore>,
    source: Arc<dyn PartitionSource>,
    pumps: Arc<PartitionPumpManager>,
    clock: Arc<dyn Clock>,
    planner: ClaimPlanner,
}

impl PartitionLoadBalancer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        event_hub_name: impl Into<String>,
        consumer_group: impl Into<String>,
        owner_id: impl Into<String>,
        store: Arc<dyn OwnershipStore>,
        source: Arc<dyn PartitionSource>,
        pumps: Arc<PartitionPumpManager>,
        clock: Arc<dyn Clock>,
        options: &ProcessorOptions,
    ) -> Self {
        PartitionLoadBalancer {
            store,
            source,
            pumps,
            clock,
            planner: ClaimPlanner {
                event_hub_name: event_hub_name.into(),
                consumer_group: consumer_group.into(),
                owner_id: owner_id.into(),
                expiration: options.partition_ownership_expiration(),
                strategy: options.strategy,
            },
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.planner.owner_id
    }

    pub fn pump_manager(&self) -> &Arc<PartitionPumpManager> {
        &self.pumps
    }

    /// Runs one balancing pass.
    ///
    /// Failures of the partition source or the store abort the pass without any
    /// claim or pump change; they are logged, never returned.
    pub async fn run_once(&self) -> PassSummary {
        let started = Instant::now();
        let summary = self.balance().await;
        histogram!(LOAD_BALANCING_DURATION_SECONDS.name).record(started.elapsed().as_secs_f64());
        summary
    }

    async fn balance(&self) -> PassSummary {
        let owner_id = self.planner.owner_id.as_str();
        let mut summary = PassSummary::default();

        let partitions = match self.source.partition_ids().await {
            Ok(partitions) => partitions,
            Err(e) => {
                warn!(owner_id = %owner_id, error = %e, "unable to enumerate partitions, skipping load balancing pass");
                return summary;
            }
        };
        summary.partition_count = partitions.len();
        if partitions.is_empty() {
            debug!(owner_id = %owner_id, "no partitions available, nothing to balance");
            summary.completed = true;
            return summary;
        }

        let records = match self
            .store
            .list_ownership(&self.planner.event_hub_name, &self.planner.consumer_group)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                warn!(owner_id = %owner_id, error = %e, "unable to list ownership, skipping load balancing pass");
                return summary;
            }
        };

        let plan = self.planner.plan(&partitions, &records, self.clock.now());
        summary.target = plan.target;
        debug!(
            owner_id = %owner_id,
            partitions = partitions.len(),
            owned = plan.owned.len(),
            target = plan.target,
            claims = plan.claims.len(),
            steal = plan.steal.is_some(),
            "computed ownership plan"
        );

        let requests = plan.requests();
        let accepted = if requests.is_empty() {
            Vec::new()
        } else {
            match self.store.claim_ownership(requests.clone()).await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(owner_id = %owner_id, error = %e, "ownership claim failed, skipping load balancing pass");
                    return summary;
                }
            }
        };

        let owned: BTreeMap<String, PartitionOwnership> = accepted
            .into_iter()
            .filter(|record| record.is_owned_by(owner_id))
            .map(|record| (record.partition_id.clone(), record))
            .collect();
        self.record_claims(&plan, &requests, &owned, &mut summary);

        self.reconcile_pumps(&owned, &mut summary).await;
        summary.owned = owned.keys().cloned().collect();
        summary.completed = true;
        summary
    }

    fn record_claims(
        &self,
        plan: &ClaimPlan,
        requests: &[PartitionOwnership],
        owned: &BTreeMap<String, PartitionOwnership>,
        summary: &mut PassSummary,
    ) {
        let owner_id = self.planner.owner_id.as_str();
        let conflicts: Vec<&str> = requests
            .iter()
            .map(|r| r.partition_id.as_str())
            .filter(|p| !owned.contains_key(*p))
            .collect();
        if !conflicts.is_empty() {
            counter!(OWNERSHIP_CLAIM_CONFLICTS_TOTAL.name).increment(conflicts.len() as u64);
            debug!(owner_id = %owner_id, partitions = ?conflicts, "claims lost to a concurrent writer");
        }

        for claim in plan.claims.iter().filter(|c| owned.contains_key(&c.partition_id)) {
            counter!(OWNERSHIP_CLAIMS_TOTAL.name).increment(1);
            info!(owner_id = %owner_id, partition_id = %claim.partition_id, "claimed partition");
            summary.claimed.push(claim.partition_id.clone());
        }
        if let Some(steal) = plan
            .steal
            .as_ref()
            .filter(|s| owned.contains_key(&s.request.partition_id))
        {
            counter!(OWNERSHIP_CLAIMS_TOTAL.name).increment(1);
            counter!(PARTITION_STEALS_TOTAL.name).increment(1);
            info!(
                owner_id = %owner_id,
                partition_id = %steal.request.partition_id,
                from_owner = %steal.from_owner,
                "stole partition to rebalance"
            );
            summary.stolen.push(steal.request.partition_id.clone());
        }
    }

    // Starts pumps for newly owned partitions, stops pumps of partitions no longer owned.
    async fn reconcile_pumps(
        &self,
        owned: &BTreeMap<String, PartitionOwnership>,
        summary: &mut PassSummary,
    ) {
        let running: BTreeSet<String> = self.pumps.running_partitions().into_iter().collect();

        for partition_id in running.iter().filter(|p| !owned.contains_key(*p)) {
            info!(owner_id = %self.planner.owner_id, partition_id = %partition_id, "ownership lost, stopping pump");
            self.pumps
                .stop_partition_pump(partition_id, CloseReason::LostOwnership)
                .await;
            summary.lost.push(partition_id.clone());
        }

        let to_start: Vec<&PartitionOwnership> = owned
            .values()
            .filter(|record| !running.contains(&record.partition_id))
            .collect();
        if to_start.is_empty() {
            return;
        }

        let checkpoints: HashMap<String, Checkpoint> = match self
            .store
            .list_checkpoints(&self.planner.event_hub_name, &self.planner.consumer_group)
            .await
        {
            Ok(checkpoints) => checkpoints
                .into_iter()
                .map(|c| (c.partition_id.clone(), c))
                .collect(),
            Err(e) => {
                warn!(owner_id = %self.planner.owner_id, error = %e, "unable to list checkpoints, pumps start on the next pass");
                return;
            }
        };

        for record in to_start {
            self.pumps
                .start_partition_pump(record, checkpoints.get(&record.partition_id));
        }
    }

    /// Clears this instance's owner id on every record it holds so peers can claim
    /// them at once. Returns the number of partitions released.
    pub async fn relinquish_ownership(&self) -> usize {
        let owner_id = self.planner.owner_id.as_str();
        let records = match self
            .store
            .list_ownership(&self.planner.event_hub_name, &self.planner.consumer_group)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                warn!(owner_id = %owner_id, error = %e, "unable to list ownership, nothing relinquished");
                return 0;
            }
        };

        let released: Vec<PartitionOwnership> = records
            .into_iter()
            .filter(|record| record.is_owned_by(owner_id))
            .map(|record| record.with_owner(""))
            .collect();
        if released.is_empty() {
            return 0;
        }

        match self.store.claim_ownership(released).await {
            Ok(accepted) => {
                info!(owner_id = %owner_id, released = accepted.len(), "relinquished partition ownership");
                accepted.len()
            }
            Err(e) => {
                warn!(owner_id = %owner_id, error = %e, "unable to relinquish ownership");
                0
            }
        }
    }
}

#[cfg(test)]
#[path = "load_balancer_test.rs"]
mod tests;
