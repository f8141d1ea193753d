//! Blob deletion worker.
//!
//! Drains the blob deletion queue: every released object key is deleted from
//! the object store at least once. Failed deletions are retried with
//! exponential backoff and parked after `max_attempts`.

use crate::metrics::{BLOB_GC_DELETED, BLOB_GC_FAILURES, BLOB_GC_PARKED};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use vreg_core::config::BlobGcConfig;
use vreg_metadata::{MetadataResult, MetadataStore};
use vreg_storage::ObjectStore;

/// Counts from one worker pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlobGcStats {
    pub claimed: usize,
    pub deleted: usize,
    pub failed: usize,
    pub parked: usize,
}

pub struct BlobGcWorker {
    metadata: Arc<dyn MetadataStore>,
    storage: Arc<dyn ObjectStore>,
    config: BlobGcConfig,
}

impl BlobGcWorker {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        storage: Arc<dyn ObjectStore>,
        config: BlobGcConfig,
    ) -> Self {
        Self {
            metadata,
            storage,
            config,
        }
    }

    /// Process the tasks due at `now`.
    pub async fn run_once(&self, now: OffsetDateTime) -> MetadataResult<BlobGcStats> {
        let tasks = self
            .metadata
            .claim_due_blob_deletions(now, self.config.max_attempts, self.config.batch_size)
            .await?;

        let mut stats = BlobGcStats {
            claimed: tasks.len(),
            ..Default::default()
        };

        for task in tasks {
            let outcome = match self.storage.delete(&task.object_key).await {
                Ok(()) => Ok(()),
                // Already gone: a previous attempt got further than its bookkeeping.
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => {
                    self.metadata.complete_blob_deletion(&task.object_key).await?;
                    BLOB_GC_DELETED.inc();
                    stats.deleted += 1;
                }
                Err(e) => {
                    let attempts = u32::try_from(task.attempts).unwrap_or(0) + 1;
                    let next_attempt_at = now + self.config.retry_delay(attempts);
                    let recorded = self
                        .metadata
                        .fail_blob_deletion(&task.object_key, &e.to_string(), next_attempt_at)
                        .await?;
                    BLOB_GC_FAILURES.inc();
                    stats.failed += 1;

                    if u32::try_from(recorded).unwrap_or(0) >= self.config.max_attempts {
                        BLOB_GC_PARKED.inc();
                        stats.parked += 1;
                        tracing::error!(
                            object_key = %task.object_key,
                            attempts = recorded,
                            error = %e,
                            "blob deletion exhausted its attempts, needs operator attention"
                        );
                    } else {
                        tracing::warn!(
                            object_key = %task.object_key,
                            attempts = recorded,
                            retry_at = %next_attempt_at,
                            error = %e,
                            "blob deletion failed, will retry"
                        );
                    }
                }
            }
        }

        if stats.claimed > 0 {
            tracing::debug!(
                claimed = stats.claimed,
                deleted = stats.deleted,
                failed = stats.failed,
                "blob deletion pass finished"
            );
        }
        Ok(stats)
    }

    /// Spawn the worker loop.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let interval = self.config.interval();
        tokio::spawn(async move {
            tracing::info!(interval_secs = interval.as_secs(), "blob deletion worker started");
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = self.run_once(OffsetDateTime::now_utc()).await {
                    tracing::error!(error = %e, "blob deletion pass failed");
                }
            }
        })
    }
}
