// pg-s3-backup/src/backup/retention.rs
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::info;

use super::s3_storage::{ObjectListing, ObjectStore};
use crate::errors::{BackupError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub deleted: Vec<String>,
    pub kept: usize,
}

/// Deletes every object under `prefix` last modified at or before `now - window_days`.
///
/// A window of zero days (or less) disables the sweep entirely. Storage
/// failures come back as [`BackupError::Retention`]; whatever was deleted
/// before the failure stays deleted.
pub async fn sweep(
    store: &dyn ObjectStore,
    prefix: &str,
    window_days: i64,
    now: DateTime<Utc>,
) -> Result<SweepSummary> {
    if window_days <= 0 {
        return Ok(SweepSummary::default());
    }

    let cutoff = Duration::try_days(window_days)
        .and_then(|window| now.checked_sub_signed(window))
        .ok_or_else(|| {
            BackupError::Retention(format!("retention window of {} days is out of range", window_days))
        })?;
    info!(
        "[retention] Deleting objects in s3://{}/{} older than {} days (<= {})",
        store.bucket(),
        prefix,
        window_days,
        cutoff.to_rfc3339()
    );

    let mut summary = SweepSummary::default();
    let mut listing = ObjectListing::new(store, prefix);
    while let Some(object) = listing.next_object().await.map_err(as_retention_error)? {
        if object.last_modified <= cutoff {
            info!("[retention] delete {}", object.key);
            store.delete(&object.key).await.map_err(as_retention_error)?;
            summary.deleted.push(object.key);
        } else {
            summary.kept += 1;
        }
    }

    info!(
        "[retention] {} objects deleted, {} kept",
        summary.deleted.len(),
        summary.kept
    );
    Ok(summary)
}

fn as_retention_error(err: BackupError) -> BackupError {
    match err {
        BackupError::Retention(_) => err,
        other => BackupError::Retention(other.to_string()),
    }
}
