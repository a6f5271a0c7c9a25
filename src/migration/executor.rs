use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::ledger::{MigrationLedger, MigrationRecord, MigrationStatus};
use super::primitive::{
    PollStatus, Preflight, RelocationHandle, RelocationPrimitive, RelocationRequest, RelocationStatus,
};
use crate::config::balancing::BalancingConfig;
use crate::errors::{log_failure, BalancerError, RelocationError};

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub dry_run: bool,
    pub live: bool,
    pub concurrency: usize,
    pub per_node: usize,
    pub job_timeout: Duration,
    pub poll_interval: Duration,
}

impl ExecutorOptions {
    pub fn from_config(config: &BalancingConfig, dry_run: bool, poll_interval: Duration) -> Self {
        Self {
            dry_run,
            live: config.live,
            concurrency: config.concurrency(),
            per_node: config.parallel_jobs_per_node.max(1),
            job_timeout: config.job_timeout(),
            poll_interval,
        }
    }
}

/// Carries proposed ledger records through the relocation primitive.
pub struct MigrationExecutor {
    primitive: Arc<dyn RelocationPrimitive>,
    ledger: Arc<MigrationLedger>,
}

enum Dispatch {
    Permits(Vec<OwnedSemaphorePermit>),
    Cancelled,
}

impl MigrationExecutor {
    pub fn new(primitive: Arc<dyn RelocationPrimitive>, ledger: Arc<MigrationLedger>) -> Self {
        Self { primitive, ledger }
    }

    /// Runs (or, for a dry run, leaves untouched) the given proposed records, in order.
    /// Dispatched relocations settle their records even if this future is dropped.
    pub async fn execute(
        &self,
        records: Vec<MigrationRecord>,
        options: &ExecutorOptions,
        cancel: CancellationToken,
    ) -> Vec<MigrationRecord> {
        if options.dry_run {
            info!(moves = records.len(), "Dry run, nothing dispatched");
            return records;
        }

        let ids: Vec<u64> = records.iter().map(|r| r.id).collect();
        let batch = tokio::spawn(run_batch(
            Arc::clone(&self.primitive),
            Arc::clone(&self.ledger),
            records,
            options.clone(),
            cancel,
        ));
        match batch.await {
            Ok(finished) => finished,
            Err(e) => {
                error!(error = %e, "Relocation batch panicked");
                let mut finished = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Ok(record) = self.ledger.get(id).await {
                        finished.push(record);
                    }
                }
                finished
            }
        }
    }
}

async fn run_batch(
    primitive: Arc<dyn RelocationPrimitive>,
    ledger: Arc<MigrationLedger>,
    records: Vec<MigrationRecord>,
    options: ExecutorOptions,
    cancel: CancellationToken,
) -> Vec<MigrationRecord> {
    let global = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let nodes: BTreeSet<&str> = records
        .iter()
        .flat_map(|r| [r.source.as_str(), r.target.as_str()])
        .collect();
    let per_node: BTreeMap<String, Arc<Semaphore>> = nodes
        .into_iter()
        .map(|n| (n.to_string(), Arc::new(Semaphore::new(options.per_node.max(1)))))
        .collect();

    let mut jobs = JoinSet::new();
    let mut undispatched = Vec::new();
    let mut pending = records.into_iter();
    for record in pending.by_ref() {
        let permits = match acquire(&global, &per_node, &record, &cancel).await {
            Dispatch::Permits(permits) => permits,
            Dispatch::Cancelled => {
                undispatched.push(record);
                break;
            }
        };
        let id = record.id;
        let job = {
            let primitive = Arc::clone(&primitive);
            let ledger = Arc::clone(&ledger);
            let options = options.clone();
            tokio::spawn(async move { run_job(primitive.as_ref(), ledger.as_ref(), record, &options).await })
        };
        let ledger = Arc::clone(&ledger);
        jobs.spawn(async move {
            let outcome = match job.await {
                Ok(record) => Some(record),
                Err(e) => {
                    error!(id, error = %e, "Relocation task panicked");
                    settle_abandoned(&ledger, id).await
                }
            };
            drop(permits);
            outcome
        });
    }
    undispatched.extend(pending);

    let mut finished = Vec::new();
    if !undispatched.is_empty() {
        warn!(count = undispatched.len(), "Cancelled, skipping undispatched moves");
    }
    for record in undispatched {
        finished.push(
            settle(
                &ledger,
                record,
                MigrationStatus::Skipped,
                Some("cancelled before dispatch".to_string()),
            )
            .await,
        );
    }

    while let Some(joined) = jobs.join_next().await {
        match joined {
            Ok(Some(record)) => finished.push(record),
            Ok(None) => {}
            Err(e) => error!(error = %e, "Relocation task panicked"),
        }
    }
    finished.sort_by_key(|r| r.id);
    finished
}

/// Global permit first, then per-node permits in node-name order.
async fn acquire(
    global: &Arc<Semaphore>,
    per_node: &BTreeMap<String, Arc<Semaphore>>,
    record: &MigrationRecord,
    cancel: &CancellationToken,
) -> Dispatch {
    if cancel.is_cancelled() {
        return Dispatch::Cancelled;
    }
    let mut semaphores = vec![Arc::clone(global)];
    let nodes: BTreeSet<&str> = [record.source.as_str(), record.target.as_str()].into_iter().collect();
    semaphores.extend(nodes.into_iter().filter_map(|n| per_node.get(n).cloned()));

    let mut permits = Vec::with_capacity(semaphores.len());
    for semaphore in semaphores {
        tokio::select! {
            _ = cancel.cancelled() => return Dispatch::Cancelled,
            permit = semaphore.acquire_owned() => match permit {
                Ok(permit) => permits.push(permit),
                Err(_) => return Dispatch::Cancelled,
            },
        }
    }
    Dispatch::Permits(permits)
}

/// Closes out a record whose job died: failed once dispatched, skipped before that.
async fn settle_abandoned(ledger: &MigrationLedger, id: u64) -> Option<MigrationRecord> {
    let record = match ledger.get(id).await {
        Ok(record) => record,
        Err(e) => {
            log_failure("ledger lookup", e);
            return None;
        }
    };
    let to = match record.status {
        MigrationStatus::Proposed => MigrationStatus::Skipped,
        MigrationStatus::Executing => MigrationStatus::Failed,
        _ => return Some(record),
    };
    Some(settle(ledger, record, to, Some("relocation task panicked".to_string())).await)
}

/// Applies a transition, falling back to the record as it was if the ledger refuses.
async fn settle(
    ledger: &MigrationLedger,
    record: MigrationRecord,
    to: MigrationStatus,
    error: Option<String>,
) -> MigrationRecord {
    match ledger.transition(record.id, to, error).await {
        Ok(updated) => updated,
        Err(e) => {
            log_failure("ledger transition", e);
            record
        }
    }
}

/// Dispatches and polls; `started` holds the handle while the relocation is in flight.
async fn relocate_and_wait(
    primitive: &dyn RelocationPrimitive,
    request: &RelocationRequest,
    poll_interval: Duration,
    started: &mut Option<RelocationHandle>,
) -> Result<(), RelocationError> {
    let handle = match primitive.relocate(request).await? {
        RelocationStatus::Completed => return Ok(()),
        RelocationStatus::Pending(handle) => started.insert(handle).clone(),
    };
    loop {
        tokio::time::sleep(poll_interval).await;
        match primitive.poll(request, &handle).await? {
            PollStatus::Running => continue,
            PollStatus::Completed => return Ok(()),
            PollStatus::Failed(message) => {
                return Err(RelocationError::Failed {
                    guest: request.guest_name.clone(),
                    message,
                })
            }
        }
    }
}

async fn run_job(
    primitive: &dyn RelocationPrimitive,
    ledger: &MigrationLedger,
    record: MigrationRecord,
    options: &ExecutorOptions,
) -> MigrationRecord {
    let request = RelocationRequest {
        guest: record.guest,
        guest_name: record.guest_name.clone(),
        kind: record.kind,
        source: record.source.clone(),
        target: record.target.clone(),
        live: options.live,
    };

    match primitive.preflight(&request).await {
        Ok(Preflight::Ready) => {}
        Ok(Preflight::Stale(reason)) => {
            info!(guest = %request.guest_name, reason = %reason, "Preflight failed, skipping move");
            return settle(ledger, record, MigrationStatus::Skipped, Some(reason)).await;
        }
        Err(e) => {
            let e = log_failure("relocation preflight", e);
            return settle(ledger, record, MigrationStatus::Skipped, Some(e.to_string())).await;
        }
    }

    let record = settle(ledger, record, MigrationStatus::Executing, None).await;
    if record.status != MigrationStatus::Executing {
        return record;
    }
    info!(
        guest = %request.guest_name,
        source = %request.source,
        target = %request.target,
        live = request.live,
        "Relocating guest"
    );

    let mut started = None;
    let outcome = tokio::time::timeout(
        options.job_timeout,
        relocate_and_wait(primitive, &request, options.poll_interval, &mut started),
    )
    .await;
    match outcome {
        Ok(Ok(())) => {
            info!(guest = %request.guest_name, target = %request.target, "Relocation completed");
            settle(ledger, record, MigrationStatus::Completed, None).await
        }
        Ok(Err(e)) => {
            let e = log_failure("relocation", BalancerError::from(e));
            settle(ledger, record, MigrationStatus::Failed, Some(e.to_string())).await
        }
        Err(_) => {
            if let Some(handle) = &started {
                primitive.abandon(&request, handle).await;
            }
            let e = log_failure(
                "relocation",
                BalancerError::Timeout {
                    guest: request.guest_name.clone(),
                    seconds: options.job_timeout.as_secs(),
                },
            );
            settle(ledger, record, MigrationStatus::Failed, Some(e.to_string())).await
        }
    }
}
