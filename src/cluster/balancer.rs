use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::collector::SnapshotCollector;
use crate::config::balancing::BalancingConfig;
use crate::config::settings::Settings;
use crate::constraints::ConstraintResolver;
use crate::core::guest::GuestId;
use crate::core::resources::Resources;
use crate::core::snapshot::ClusterSnapshot;
use crate::errors::handlers::RetryHandler;
use crate::errors::{BalancerResult, ConstraintConflict};
use crate::migration::executor::{ExecutorOptions, MigrationExecutor};
use crate::migration::ledger::{MigrationLedger, MigrationRecord, MigrationStatus};
use crate::migration::primitive::RelocationPrimitive;
use crate::monitoring::pressure::PressureEvaluator;
use crate::scheduler::{Plan, Planner, ProposedMove};

pub const BALANCING_DISABLED_NOTE: &str = "balancing disabled in config";

/// Result of planning one pass without touching the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub pass_id: Uuid,
    pub analyzed_at: DateTime<Utc>,
    pub config: BalancingConfig,
    pub snapshot: ClusterSnapshot,
    pub plan: Plan,
    pub conflicts: Vec<ConstraintConflict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drift: Option<Drift>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Retarget {
    pub guest: GuestId,
    pub previous_target: String,
    pub target: String,
}

/// How a plan differs from an earlier one for the same cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Drift {
    pub previous_pass: Uuid,
    pub added: Vec<ProposedMove>,
    pub dropped: Vec<ProposedMove>,
    pub retargeted: Vec<Retarget>,
    pub spread_delta: f64,
}

impl Drift {
    pub fn between(previous: &Analysis, current: &Plan) -> Self {
        let before: BTreeMap<GuestId, &ProposedMove> =
            previous.plan.moves.iter().map(|m| (m.guest, m)).collect();
        let after: BTreeMap<GuestId, &ProposedMove> = current.moves.iter().map(|m| (m.guest, m)).collect();

        let added = after
            .iter()
            .filter(|(id, _)| !before.contains_key(*id))
            .map(|(_, m)| (*m).clone())
            .collect();
        let dropped = before
            .iter()
            .filter(|(id, _)| !after.contains_key(*id))
            .map(|(_, m)| (*m).clone())
            .collect();
        let retargeted = after
            .iter()
            .filter_map(|(id, m)| {
                before
                    .get(id)
                    .filter(|old| old.target != m.target)
                    .map(|old| Retarget {
                        guest: *id,
                        previous_target: old.target.clone(),
                        target: m.target.clone(),
                    })
            })
            .collect();

        Self {
            previous_pass: previous.pass_id,
            added,
            dropped,
            retargeted,
            spread_delta: current.balance.spread - previous.plan.balance.spread,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.dropped.is_empty() && self.retargeted.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub proposed: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl ExecutionSummary {
    pub fn tally(records: &[MigrationRecord]) -> Self {
        let mut summary = Self::default();
        for record in records {
            match record.status {
                MigrationStatus::Proposed | MigrationStatus::Executing => summary.proposed += 1,
                MigrationStatus::Completed => summary.completed += 1,
                MigrationStatus::Failed => summary.failed += 1,
                MigrationStatus::Skipped => summary.skipped += 1,
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub pass_id: Uuid,
    pub dry_run: bool,
    pub notes: Vec<String>,
    pub plan: Plan,
    pub conflicts: Vec<ConstraintConflict>,
    pub records: Vec<MigrationRecord>,
    pub summary: ExecutionSummary,
    pub snapshot_after: ClusterSnapshot,
}

/// Runs balancing passes, one at a time.
pub struct Balancer {
    collector: Arc<dyn SnapshotCollector>,
    ledger: Arc<MigrationLedger>,
    executor: MigrationExecutor,
    evaluator: PressureEvaluator,
    retry: RetryHandler,
    poll_interval: Duration,
    pass_lock: Mutex<()>,
}

impl Balancer {
    pub fn new(
        settings: &Settings,
        collector: Arc<dyn SnapshotCollector>,
        primitive: Arc<dyn RelocationPrimitive>,
        ledger: Arc<MigrationLedger>,
    ) -> Self {
        Self {
            collector,
            executor: MigrationExecutor::new(primitive, Arc::clone(&ledger)),
            ledger,
            evaluator: PressureEvaluator::new(&settings.pressure),
            retry: RetryHandler::new(
                settings.collector.retries,
                Duration::from_millis(settings.collector.retry_backoff_ms),
            ),
            poll_interval: settings.relocation.poll_interval(),
            pass_lock: Mutex::new(()),
        }
    }

    pub fn ledger(&self) -> &Arc<MigrationLedger> {
        &self.ledger
    }

    async fn snapshot(&self, cluster: &str, config: &BalancingConfig) -> BalancerResult<ClusterSnapshot> {
        let collector = &self.collector;
        let inventory = self.retry.handle(|| collector.collect(cluster)).await?;
        Ok(ClusterSnapshot::from_inventory(inventory, config, &self.evaluator)?)
    }

    async fn plan_pass(
        &self,
        cluster: &str,
        config: &BalancingConfig,
        previous: Option<&Analysis>,
    ) -> BalancerResult<Analysis> {
        config.validate()?;
        let mut snapshot = self.snapshot(cluster, config).await?;
        let resolution = ConstraintResolver::new(config).resolve(&mut snapshot);
        let plan = Planner::new(config).plan(&mut snapshot, &resolution);
        let drift = previous.map(|p| Drift::between(p, &plan));
        Ok(Analysis {
            pass_id: Uuid::new_v4(),
            analyzed_at: Utc::now(),
            config: config.clone(),
            snapshot,
            plan,
            conflicts: resolution.conflicts,
            drift,
        })
    }

    /// Plans a pass. `previous`, when given, is diffed against the new plan.
    pub async fn analyze(
        &self,
        cluster: &str,
        config: &BalancingConfig,
        previous: Option<&Analysis>,
    ) -> BalancerResult<Analysis> {
        let _pass = self.pass_lock.lock().await;
        let analysis = self.plan_pass(cluster, config, previous).await?;
        info!(
            pass_id = %analysis.pass_id,
            cluster,
            moves = analysis.plan.moves.len(),
            balanced = analysis.plan.balance.balanced,
            "Analysis finished"
        );
        Ok(analysis)
    }

    /// Plans a pass, records it, and relocates guests unless this is a dry run.
    pub async fn execute(
        &self,
        cluster: &str,
        config: &BalancingConfig,
        dry_run: bool,
        cancel: CancellationToken,
    ) -> BalancerResult<ExecutionOutcome> {
        let _pass = self.pass_lock.lock().await;
        let mut notes = Vec::new();
        let mut dry_run = dry_run;
        if !dry_run && !config.enable {
            warn!(cluster, "Balancing disabled, running as dry run");
            notes.push(BALANCING_DISABLED_NOTE.to_string());
            dry_run = true;
        }

        let analysis = self.plan_pass(cluster, config, None).await?;
        let mut proposed = Vec::with_capacity(analysis.plan.moves.len());
        for m in &analysis.plan.moves {
            proposed.push(self.ledger.record_proposed(analysis.pass_id, m, dry_run).await?);
        }

        let options = ExecutorOptions::from_config(config, dry_run, self.poll_interval);
        let records = self.executor.execute(proposed, &options, cancel).await;

        let mut snapshot_after = analysis.snapshot;
        for record in records.iter().filter(|r| r.status == MigrationStatus::Completed) {
            snapshot_after.apply_completed(record.guest, &record.target);
        }
        let summary = ExecutionSummary::tally(&records);
        info!(
            pass_id = %analysis.pass_id,
            cluster,
            dry_run,
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            "Execution finished"
        );

        Ok(ExecutionOutcome {
            pass_id: analysis.pass_id,
            dry_run,
            notes,
            plan: analysis.plan,
            conflicts: analysis.conflicts,
            records,
            summary,
            snapshot_after,
        })
    }

    /// Best node for a new guest of the given size.
    pub async fn best_node(
        &self,
        cluster: &str,
        config: &BalancingConfig,
        demand: Resources,
    ) -> BalancerResult<Option<String>> {
        config.validate()?;
        let snapshot = self.snapshot(cluster, config).await?;
        Ok(Planner::new(config).best_node(&snapshot, demand))
    }
}
