//! Cleanup policy state machine and retention arithmetic.

use serde::{Deserialize, Serialize};
use std::fmt;
use time::{Duration, OffsetDateTime};

/// Cadences (in days) a cleanup policy may run at.
pub const ALLOWED_CADENCE_DAYS: [i32; 5] = [1, 7, 14, 30, 90];

/// Bounds for `keep_n_days_after_download`.
pub const MIN_KEEP_DAYS: i32 = 1;
pub const MAX_KEEP_DAYS: i32 = 365;
pub const DEFAULT_KEEP_DAYS: i32 = 30;
pub const DEFAULT_CADENCE_DAYS: i32 = 7;

/// Run state of a cleanup policy.
///
/// `idle → running → {completed, failed}`; a finished policy re-enters
/// `running` on its next trigger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

impl CleanupStatus {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse from string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(crate::Error::InvalidCleanupPolicy(format!(
                "unknown status: {other}"
            ))),
        }
    }

    /// Whether a run may start from this state.
    pub fn can_start(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(&self, next: CleanupStatus) -> bool {
        match (self, next) {
            (Self::Running, Self::Completed | Self::Failed) => true,
            (from, Self::Running) => from.can_start(),
            _ => false,
        }
    }
}

impl fmt::Display for CleanupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validate administrator-supplied policy settings.
pub fn validate_settings(cadence_days: i32, keep_n_days_after_download: i32) -> crate::Result<()> {
    if !ALLOWED_CADENCE_DAYS.contains(&cadence_days) {
        return Err(crate::Error::InvalidCleanupPolicy(format!(
            "cadence must be one of {ALLOWED_CADENCE_DAYS:?} days, got {cadence_days}"
        )));
    }
    if !(MIN_KEEP_DAYS..=MAX_KEEP_DAYS).contains(&keep_n_days_after_download) {
        return Err(crate::Error::InvalidCleanupPolicy(format!(
            "keep_n_days_after_download must be between {MIN_KEEP_DAYS} and {MAX_KEEP_DAYS}, got {keep_n_days_after_download}"
        )));
    }
    Ok(())
}

/// Entries whose last activity is strictly before this instant are evictable.
pub fn eviction_cutoff(now: OffsetDateTime, keep_n_days_after_download: i32) -> OffsetDateTime {
    now - Duration::days(i64::from(keep_n_days_after_download))
}

/// Next scheduled run after `from`.
pub fn next_run_after(from: OffsetDateTime, cadence_days: i32) -> OffsetDateTime {
    from + Duration::days(i64::from(cadence_days))
}

/// Last activity used for retention: last download, or creation if never downloaded.
pub fn last_activity(
    last_downloaded_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
) -> OffsetDateTime {
    last_downloaded_at.unwrap_or(created_at)
}
