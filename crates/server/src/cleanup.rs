//! Cleanup runs and the scheduler that triggers them.
//!
//! A run evicts a group's cache entries whose last activity is older than the
//! policy's retention window. The `running` state lives in the metadata store,
//! so a trigger that arrives while a run holds the policy is skipped.

use crate::error::CleanupError;
use crate::metrics::{
    CLEANUP_DELETED_BYTES, CLEANUP_DELETED_ENTRIES, CLEANUP_RUN_DURATION, CLEANUP_RUNS,
};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use uuid::Uuid;
use vreg_core::CleanupStatus;
use vreg_core::cleanup::{DEFAULT_CADENCE_DAYS, eviction_cutoff, next_run_after};
use vreg_core::config::CleanupConfig;
use vreg_metadata::models::{CleanupPolicyRow, CleanupRunRecord};
use vreg_metadata::{MetadataResult, MetadataStore};

const MAX_FINISH_BACKOFF: Duration = Duration::from_secs(30);

/// What started a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Scheduled,
    Manual,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
        }
    }
}

/// Counters accumulated over one run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub deleted_entries: u64,
    pub deleted_bytes: u64,
    pub batches: u32,
    /// The batch limit stopped the run before the backlog was empty.
    pub truncated: bool,
}

/// Result of asking for a run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Another run held the policy, or the policy is disabled or missing.
    Skipped,
    Completed { summary: RunSummary },
    Failed { summary: RunSummary, message: String },
}

/// Receives run results for policies that ask to be notified.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn run_succeeded(&self, group_id: Uuid, summary: &RunSummary);
    async fn run_failed(&self, group_id: Uuid, summary: &RunSummary, message: &str);
}

/// Writes notifications to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn run_succeeded(&self, group_id: Uuid, summary: &RunSummary) {
        tracing::info!(
            group_id = %group_id,
            deleted_entries = summary.deleted_entries,
            deleted_bytes = summary.deleted_bytes,
            "cleanup notification: run succeeded"
        );
    }

    async fn run_failed(&self, group_id: Uuid, summary: &RunSummary, message: &str) {
        tracing::warn!(
            group_id = %group_id,
            deleted_entries = summary.deleted_entries,
            error = %message,
            "cleanup notification: run failed"
        );
    }
}

/// Executes cleanup runs against the metadata store.
pub struct CleanupRunner {
    metadata: Arc<dyn MetadataStore>,
    config: CleanupConfig,
    notifier: Arc<dyn Notifier>,
}

impl CleanupRunner {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        config: CleanupConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            metadata,
            config,
            notifier,
        }
    }

    /// Run cleanup for one group.
    ///
    /// Errors only when the run state itself could not be read or written;
    /// eviction failures are recorded on the policy and reported as
    /// [`RunOutcome::Failed`].
    #[tracing::instrument(skip(self))]
    pub async fn run(&self, group_id: Uuid, trigger: RunTrigger) -> MetadataResult<RunOutcome> {
        if !self
            .metadata
            .try_begin_cleanup_run(group_id, OffsetDateTime::now_utc())
            .await?
        {
            tracing::info!("cleanup run skipped: policy is running, disabled or missing");
            CLEANUP_RUNS.with_label_values(&["skipped"]).inc();
            return Ok(RunOutcome::Skipped);
        }

        let started = Instant::now();
        let mut summary = RunSummary::default();
        let result = self.evict(group_id, &mut summary).await;
        let finished_at = OffsetDateTime::now_utc();

        let policy = self.metadata.get_cleanup_policy(group_id).await.ok().flatten();
        let cadence_days = policy
            .as_ref()
            .map_or(DEFAULT_CADENCE_DAYS, |p| p.cadence_days);

        let (status, failure_message) = match &result {
            Ok(()) => (CleanupStatus::Completed, None),
            Err(e) => (CleanupStatus::Failed, Some(e.to_string())),
        };
        let record = CleanupRunRecord {
            status,
            finished_at,
            deleted_size: i64::try_from(summary.deleted_bytes).unwrap_or(i64::MAX),
            deleted_entries_count: i64::try_from(summary.deleted_entries).unwrap_or(i64::MAX),
            failure_message: failure_message.clone(),
            next_run_at: next_run_after(finished_at, cadence_days),
        };
        self.finish_run(group_id, &record).await?;

        let duration = started.elapsed();
        CLEANUP_RUN_DURATION.observe(duration.as_secs_f64());
        CLEANUP_RUNS.with_label_values(&[status.as_str()]).inc();

        tracing::info!(
            outcome = status.as_str(),
            deleted_entries = summary.deleted_entries,
            deleted_bytes = summary.deleted_bytes,
            batches = summary.batches,
            truncated = summary.truncated,
            duration_ms = duration.as_millis() as u64,
            error = failure_message.as_deref(),
            "cleanup run finished"
        );

        match failure_message {
            None => {
                if policy.as_ref().is_some_and(|p| p.notify_on_success) {
                    self.notifier.run_succeeded(group_id, &summary).await;
                }
                Ok(RunOutcome::Completed { summary })
            }
            Some(message) => {
                if policy.as_ref().is_some_and(|p| p.notify_on_failure) {
                    self.notifier.run_failed(group_id, &summary, &message).await;
                }
                Ok(RunOutcome::Failed { summary, message })
            }
        }
    }

    async fn evict(&self, group_id: Uuid, summary: &mut RunSummary) -> Result<(), CleanupError> {
        let mut policy = self.load_policy(group_id).await?;

        loop {
            if summary.batches >= self.config.max_batches {
                summary.truncated = true;
                tracing::warn!(
                    batches = summary.batches,
                    "cleanup batch limit reached, remaining entries wait for the next run"
                );
                return Ok(());
            }

            let now = OffsetDateTime::now_utc();
            let cutoff = eviction_cutoff(now, policy.keep_n_days_after_download);
            let batch = self
                .metadata
                .list_evictable(group_id, cutoff, self.config.batch_size)
                .await?;
            if batch.is_empty() {
                return Ok(());
            }

            for entry in &batch {
                // The entry may have been downloaded since it was listed.
                if let Some(deleted) = self
                    .metadata
                    .delete_if_evictable(entry.entry_id, cutoff, now)
                    .await?
                {
                    let size = u64::try_from(deleted.size_bytes).unwrap_or(0);
                    summary.deleted_entries += 1;
                    summary.deleted_bytes += size;
                    CLEANUP_DELETED_ENTRIES.inc();
                    CLEANUP_DELETED_BYTES.inc_by(size);
                }
            }
            summary.batches += 1;

            if batch.len() < self.config.batch_size as usize {
                return Ok(());
            }
            if let Some(delay_ms) = self.config.batch_delay_ms {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            policy = self.load_policy(group_id).await?;
        }
    }

    /// Record a run's result, retrying with backoff. A result that is never
    /// recorded leaves the policy `running` until its lease expires.
    async fn finish_run(&self, group_id: Uuid, record: &CleanupRunRecord) -> MetadataResult<()> {
        let mut backoff = Duration::from_millis(self.config.finish_backoff_ms);
        let mut attempt = 1;
        loop {
            match self.metadata.finish_cleanup_run(group_id, record).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.config.finish_attempts => {
                    tracing::warn!(
                        group_id = %group_id,
                        attempt,
                        error = %e,
                        "failed to record cleanup run result, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_FINISH_BACKOFF);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn load_policy(&self, group_id: Uuid) -> Result<CleanupPolicyRow, CleanupError> {
        let policy = self
            .metadata
            .get_cleanup_policy(group_id)
            .await?
            .ok_or(CleanupError::PolicyMissing)?;
        if !policy.enabled {
            return Err(CleanupError::PolicyDisabled);
        }
        Ok(policy)
    }

    /// Start every due policy. Returns how many runs completed or failed.
    ///
    /// Runs whose lease expired are reclaimed first so they become due again.
    pub async fn run_due(self: &Arc<Self>) -> MetadataResult<usize> {
        self.reclaim_expired_runs().await?;

        let due = self
            .metadata
            .list_due_cleanup_policies(OffsetDateTime::now_utc())
            .await?;

        let mut ran = 0;
        for policy in due {
            match run_guarded(self.clone(), policy.group_id, RunTrigger::Scheduled).await {
                Ok(RunOutcome::Skipped) => {}
                Ok(_) => ran += 1,
                Err(e) => tracing::error!(
                    group_id = %policy.group_id,
                    error = %e,
                    "cleanup run could not record its state"
                ),
            }
        }
        Ok(ran)
    }

    /// Mark runs a previous process left `running` as failed.
    pub async fn recover_orphans(&self) -> MetadataResult<u64> {
        let now = OffsetDateTime::now_utc();
        let recovered = self.metadata.recover_orphaned_cleanup_runs(now, now).await?;
        if recovered > 0 {
            tracing::warn!(
                count = recovered,
                "marked cleanup runs from a previous process as failed"
            );
        }
        Ok(recovered)
    }

    /// Fail runs that have held `running` longer than the configured lease.
    pub async fn reclaim_expired_runs(&self) -> MetadataResult<u64> {
        let now = OffsetDateTime::now_utc();
        let lease = time::Duration::seconds(
            i64::try_from(self.config.run_lease_secs).unwrap_or(i64::MAX),
        );
        let started_before = now
            .checked_sub(lease)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        let reclaimed = self
            .metadata
            .recover_orphaned_cleanup_runs(started_before, now)
            .await?;
        if reclaimed > 0 {
            tracing::warn!(
                count = reclaimed,
                lease_secs = self.config.run_lease_secs,
                "reclaimed cleanup runs that outlived their lease"
            );
            CLEANUP_RUNS
                .with_label_values(&["reclaimed"])
                .inc_by(reclaimed);
        }
        Ok(reclaimed)
    }
}

/// Run `group_id` on a separate task so a panicking run cannot leave the
/// policy `running`.
pub async fn run_guarded(
    runner: Arc<CleanupRunner>,
    group_id: Uuid,
    trigger: RunTrigger,
) -> MetadataResult<RunOutcome> {
    let task_runner = runner.clone();
    let handle = tokio::spawn(async move { task_runner.run(group_id, trigger).await });

    match handle.await {
        Ok(result) => result,
        Err(join_err) => {
            let message = format!("cleanup run aborted: {join_err}");
            tracing::error!(group_id = %group_id, error = %message, "cleanup task ended abnormally");
            CLEANUP_RUNS.with_label_values(&["failed"]).inc();
            let now = OffsetDateTime::now_utc();
            let record = CleanupRunRecord {
                status: CleanupStatus::Failed,
                finished_at: now,
                deleted_size: 0,
                deleted_entries_count: 0,
                failure_message: Some(message.clone()),
                next_run_at: next_run_after(now, DEFAULT_CADENCE_DAYS),
            };
            runner.finish_run(group_id, &record).await?;
            Ok(RunOutcome::Failed {
                summary: RunSummary::default(),
                message,
            })
        }
    }
}

/// Spawn the scheduler loop.
pub fn spawn_scheduler(runner: Arc<CleanupRunner>) -> JoinHandle<()> {
    let interval = runner.config.tick_interval();
    tokio::spawn(async move {
        tracing::info!(interval_secs = interval.as_secs(), "cleanup scheduler started");
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = runner.run_due().await {
                tracing::error!(error = %e, "failed to list due cleanup policies");
            }
        }
    })
}
