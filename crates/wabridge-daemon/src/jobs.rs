//! Bulk jobs over one identity's client.
//!
//! Each job runs on its own task. The client is fetched from the pool again
//! before every item, so a reconnected or re-paired client is picked up and a
//! destroyed or logged-out identity ends the job with a partial report.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use wabridge_core::{ClientError, IdentityId, OperatorId, WaClient};

use crate::error::BridgeError;
use crate::pool::{ClientPool, PooledClient};
use crate::reclaim::ActiveIdentities;

/// Outcome of a bulk job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub attempted: usize,
    pub succeeded: usize,
    /// `(item, reason)` per failed item.
    pub failures: Vec<(String, String)>,
    /// Why the job ended before the last item, if it did.
    pub stopped: Option<String>,
    pub cancelled: bool,
}

/// Handle to a running job.
#[derive(Debug)]
pub struct JobHandle {
    pub id: Uuid,
    cancel: Arc<AtomicBool>,
    task: JoinHandle<JobReport>,
}

impl JobHandle {
    /// Ask the job to stop at the next item boundary.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub async fn join(self) -> Result<JobReport, JoinError> {
        self.task.await
    }
}

#[derive(Debug)]
struct JobEntry {
    operator: OperatorId,
    identity_id: IdentityId,
    cancel: Arc<AtomicBool>,
}

/// Spawns jobs and keeps a table of the running ones.
#[derive(Clone)]
pub struct JobRunner {
    pool: ClientPool,
    call_timeout: Duration,
    jobs: Arc<Mutex<HashMap<Uuid, JobEntry>>>,
}

impl JobRunner {
    pub fn new(pool: ClientPool, call_timeout: Duration) -> Self {
        Self {
            pool,
            call_timeout,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `op` over `items` with `identity_id`'s client, pausing `delay`
    /// between items. Every call is bounded by the call timeout.
    pub fn spawn<T, F, Fut>(
        &self,
        operator: OperatorId,
        identity_id: IdentityId,
        items: Vec<T>,
        delay: Duration,
        op: F,
    ) -> JobHandle
    where
        T: Display + Send + 'static,
        F: Fn(Arc<dyn WaClient>, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ClientError>> + Send,
    {
        let id = Uuid::new_v4();
        let cancel = Arc::new(AtomicBool::new(false));
        self.jobs.lock().insert(
            id,
            JobEntry {
                operator,
                identity_id,
                cancel: Arc::clone(&cancel),
            },
        );

        let runner = self.clone();
        let flag = Arc::clone(&cancel);
        let task = tokio::spawn(async move {
            let report = runner.run(id, identity_id, items, delay, op, &flag).await;
            runner.jobs.lock().remove(&id);
            info!(
                job_id = %id,
                operator,
                identity_id,
                attempted = report.attempted,
                succeeded = report.succeeded,
                failed = report.failures.len(),
                cancelled = report.cancelled,
                "Job finished"
            );
            report
        });

        info!(job_id = %id, operator, identity_id, "Job started");
        JobHandle { id, cancel, task }
    }

    async fn run<T, F, Fut>(
        &self,
        id: Uuid,
        identity_id: IdentityId,
        items: Vec<T>,
        delay: Duration,
        op: F,
        cancel: &AtomicBool,
    ) -> JobReport
    where
        T: Display,
        F: Fn(Arc<dyn WaClient>, T) -> Fut,
        Fut: Future<Output = Result<(), ClientError>>,
    {
        let mut report = JobReport::default();
        let mut last: Option<PooledClient> = None;
        let total = items.len();

        for (index, item) in items.into_iter().enumerate() {
            if cancel.load(Ordering::SeqCst) {
                report.cancelled = true;
                break;
            }

            let pooled = match self.pool.get_or_create(identity_id).await {
                Ok(pooled) => pooled,
                Err(
                    e @ (BridgeError::NotFound(_)
                    | BridgeError::LoggedOut { .. }
                    | BridgeError::Forbidden(_)),
                ) => {
                    warn!(job_id = %id, identity_id, error = %e, "Identity gone, stopping job");
                    report.stopped = Some(e.to_string());
                    break;
                }
                Err(e) => {
                    report.attempted += 1;
                    report.failures.push((item.to_string(), e.to_string()));
                    pause(index, total, delay).await;
                    continue;
                }
            };

            if let Some(previous) = &last
                && !previous.same_client(&pooled)
            {
                info!(
                    job_id = %id,
                    identity_id,
                    generation = pooled.generation,
                    "Client replaced, continuing with the new one"
                );
            }
            last = Some(pooled.clone());

            report.attempted += 1;
            let label = item.to_string();
            match timeout(self.call_timeout, op(Arc::clone(&pooled.client), item)).await {
                Ok(Ok(())) => report.succeeded += 1,
                Ok(Err(e)) => {
                    debug!(job_id = %id, item = %label, error = %e, "Item failed");
                    report.failures.push((label, e.to_string()));
                }
                Err(_) => {
                    debug!(job_id = %id, item = %label, "Item timed out");
                    report.failures.push((
                        label,
                        format!("timed out after {}s", self.call_timeout.as_secs()),
                    ));
                }
            }

            pause(index, total, delay).await;
        }
        report
    }

    /// Cancel `job_id` if it belongs to `operator`.
    pub fn cancel(&self, operator: OperatorId, job_id: Uuid) -> bool {
        let jobs = self.jobs.lock();
        match jobs.get(&job_id) {
            Some(entry) if entry.operator == operator => {
                entry.cancel.store(true, Ordering::SeqCst);
                debug!(job_id = %job_id, operator, "Job cancel requested");
                true
            }
            _ => false,
        }
    }

    /// Running jobs of `operator`.
    pub fn jobs_for(&self, operator: OperatorId) -> Vec<Uuid> {
        self.jobs
            .lock()
            .iter()
            .filter(|(_, entry)| entry.operator == operator)
            .map(|(id, _)| *id)
            .collect()
    }
}

/// Wait `delay` unless `index` was the last item.
async fn pause(index: usize, total: usize, delay: Duration) {
    if index + 1 < total && !delay.is_zero() {
        sleep(delay).await;
    }
}

#[async_trait]
impl ActiveIdentities for JobRunner {
    async fn active_identity_ids(&self) -> HashSet<IdentityId> {
        self.jobs.lock().values().map(|e| e.identity_id).collect()
    }
}
