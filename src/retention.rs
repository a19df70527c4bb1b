// ABOUTME: Age-based retention sweep over a job's dump artifact directory
// ABOUTME: Deletes only files it can positively identify as expired artifacts

use chrono::{NaiveDateTime, TimeDelta};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::JobDefinition;
use crate::error::BackupError;
use crate::naming;

/// What one sweep did.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub deleted: Vec<PathBuf>,
    pub kept: usize,
    /// Files with the artifact extension whose names are not canonical artifact names.
    pub skipped: Vec<PathBuf>,
    pub errors: Vec<BackupError>,
}

impl SweepReport {
    pub fn deleted_count(&self) -> usize {
        self.deleted.len()
    }
}

/// Oldest creation time that is still kept, or `None` when retention is disabled.
pub fn cutoff(now: NaiveDateTime, retention_days: i64) -> Option<NaiveDateTime> {
    if retention_days <= 0 {
        return None;
    }
    now.checked_sub_signed(TimeDelta::try_days(retention_days)?)
}

/// An artifact expires when it was created strictly before the cutoff.
pub fn is_expired(created_at: NaiveDateTime, now: NaiveDateTime, retention_days: i64) -> bool {
    match cutoff(now, retention_days) {
        Some(cutoff) => created_at < cutoff,
        None => false,
    }
}

/// Delete expired artifacts in `dir`.
///
/// Only regular files whose names parse as artifact timestamps are
/// candidates; directories and foreign files are never touched. A
/// `retention_days` of zero (or less) disables the sweep. Deletion
/// failures are collected and the sweep moves on to the next file.
pub async fn sweep(dir: &Path, retention_days: i64, now: NaiveDateTime) -> SweepReport {
    let mut report = SweepReport::default();
    let Some(cutoff) = cutoff(now, retention_days) else {
        debug!(dir = %dir.display(), "Retention disabled, nothing to sweep");
        return report;
    };

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            report.errors.push(BackupError::artifact_io(dir, e));
            return report;
        }
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                report.errors.push(BackupError::artifact_io(dir, e));
                break;
            }
        };
        let path = entry.path();

        match entry.file_type().await {
            Ok(file_type) if file_type.is_file() => {}
            Ok(_) => continue,
            Err(e) => {
                report.errors.push(BackupError::artifact_io(&path, e));
                continue;
            }
        }

        let Some(file_name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if !file_name.ends_with(&format!(".{}", naming::ARTIFACT_EXTENSION)) {
            continue;
        }

        let Some(created_at) = naming::parse_name(&file_name) else {
            debug!(file = %path.display(), "Not an artifact name, leaving it alone");
            report.skipped.push(path);
            continue;
        };

        if created_at >= cutoff {
            report.kept += 1;
            continue;
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(file = %path.display(), "Deleted expired artifact");
                report.deleted.push(path);
            }
            Err(e) => {
                warn!(file = %path.display(), "Failed to delete expired artifact: {}", e);
                report.errors.push(BackupError::artifact_io(&path, e));
            }
        }
    }

    info!(
        dir = %dir.display(),
        deleted = report.deleted.len(),
        kept = report.kept,
        skipped = report.skipped.len(),
        errors = report.errors.len(),
        "Retention sweep finished"
    );
    report
}

/// Sweep the artifact directory of `job`. Jobs without a dump destination have nothing to sweep.
pub async fn sweep_job(job: &JobDefinition, now: NaiveDateTime) -> SweepReport {
    if job.destination_folder.as_os_str().is_empty() {
        return SweepReport::default();
    }
    info!(job = %job.name, "Deleting expired backups");
    sweep(&job.destination_folder, job.retention_days, now).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"x").unwrap();
        path
    }

    #[test]
    fn test_cutoff_boundary_is_kept() {
        let now = at(2024, 3, 10, 0, 0, 0);
        assert!(!is_expired(at(2024, 3, 3, 0, 0, 0), now, 7));
        assert!(is_expired(at(2024, 3, 2, 23, 59, 59), now, 7));
    }

    #[test]
    fn test_zero_or_negative_retention_disables() {
        let now = at(2024, 3, 10, 0, 0, 0);
        assert_eq!(cutoff(now, 0), None);
        assert_eq!(cutoff(now, -3), None);
        assert!(!is_expired(at(2000, 1, 1, 0, 0, 0), now, 0));
    }

    #[test]
    fn test_huge_retention_does_not_overflow() {
        let now = at(2024, 3, 10, 0, 0, 0);
        assert!(!is_expired(at(2000, 1, 1, 0, 0, 0), now, i64::MAX));
    }

    #[tokio::test]
    async fn test_sweep_deletes_only_expired_artifacts() {
        let dir = TempDir::new().unwrap();
        let now = at(2024, 3, 10, 0, 0, 0);
        let old_a = touch(dir.path(), &naming::new_name(at(2024, 2, 1, 3, 0, 0)));
        let old_b = touch(dir.path(), &naming::new_name(at(2024, 3, 2, 23, 59, 59)));
        let fresh = touch(dir.path(), &naming::new_name(at(2024, 3, 9, 3, 0, 0)));
        let foreign = touch(dir.path(), "notanartifact.tar");

        let report = sweep(dir.path(), 7, now).await;

        assert_eq!(report.deleted_count(), 2);
        assert!(report.errors.is_empty());
        assert!(!old_a.exists());
        assert!(!old_b.exists());
        assert!(fresh.exists());
        assert!(foreign.exists());
        assert_eq!(report.kept, 1);
        assert_eq!(report.skipped, vec![foreign]);
    }

    #[tokio::test]
    async fn test_sweep_keeps_artifact_exactly_at_cutoff() {
        let dir = TempDir::new().unwrap();
        let boundary = touch(dir.path(), &naming::new_name(at(2024, 3, 3, 0, 0, 0)));

        let report = sweep(dir.path(), 7, at(2024, 3, 10, 0, 0, 0)).await;

        assert_eq!(report.deleted_count(), 0);
        assert!(boundary.exists());
    }

    #[tokio::test]
    async fn test_sweep_ignores_directories_and_other_extensions() {
        let dir = TempDir::new().unwrap();
        let old_name = naming::new_name(at(2020, 1, 1, 0, 0, 0));
        std::fs::create_dir(dir.path().join(&old_name)).unwrap();
        let readme = touch(dir.path(), "readme.txt");
        let gz = touch(dir.path(), &format!("{}.gz", old_name));

        let report = sweep(dir.path(), 1, at(2024, 3, 10, 0, 0, 0)).await;

        assert_eq!(report.deleted_count(), 0);
        assert!(dir.path().join(&old_name).is_dir());
        assert!(readme.exists());
        assert!(gz.exists());
    }

    #[tokio::test]
    async fn test_disabled_sweep_touches_nothing() {
        let dir = TempDir::new().unwrap();
        let old = touch(dir.path(), &naming::new_name(at(2000, 1, 1, 0, 0, 0)));

        let report = sweep(dir.path(), 0, at(2024, 3, 10, 0, 0, 0)).await;

        assert_eq!(report.deleted_count(), 0);
        assert!(old.exists());
    }

    #[tokio::test]
    async fn test_missing_directory_is_reported_not_fatal() {
        let dir = TempDir::new().unwrap();
        let report = sweep(&dir.path().join("absent"), 7, at(2024, 3, 10, 0, 0, 0)).await;
        assert_eq!(report.deleted_count(), 0);
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(report.errors[0], BackupError::ArtifactIo { .. }));
    }
}
