//! # Backup Scheduler
//!
//! Copies each store to `backup_dir/YYYY/MM/<stem>_YYYY-MM-DD.json` once per
//! UTC day. Running twice for the same date is a no-op, and an existing
//! destination file is never overwritten.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Datelike, NaiveDate, Utc};
use tokio::sync::Mutex;

use super::store::JsonStore;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BackupReport {
    pub copied: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug)]
pub struct BackupScheduler {
    stores: Vec<Arc<JsonStore>>,
    backup_dir: PathBuf,
    last_run: Mutex<Option<NaiveDate>>,
}

impl BackupScheduler {
    pub fn new(stores: Vec<Arc<JsonStore>>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            stores,
            backup_dir: backup_dir.into(),
            last_run: Mutex::new(None),
        }
    }

    /// Destination of `store`'s copy for `date`.
    pub fn archive_path(&self, store: &JsonStore, date: NaiveDate) -> PathBuf {
        let stem = store
            .path()
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "store".to_string());

        self.backup_dir
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{}_{}.json", stem, date.format("%Y-%m-%d")))
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub async fn run_today(&self) -> BackupReport {
        self.run_for(Utc::now().date_naive()).await
    }

    /// Backs up every store for `date`. A date is remembered only once all
    /// its copies succeeded, so a failed day is retried on the next run.
    pub async fn run_for(&self, date: NaiveDate) -> BackupReport {
        let mut last_run = self.last_run.lock().await;
        if *last_run == Some(date) {
            log::debug!("Backup for {} already done", date);
            return BackupReport::default();
        }

        let mut report = BackupReport::default();
        for store in &self.stores {
            let dest = self.archive_path(store, date);
            if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
                report.skipped += 1;
                continue;
            }

            match store.snapshot_to(&dest).await {
                Ok(true) => {
                    log::info!("Backed up {} to {}", store.path().display(), dest.display());
                    report.copied += 1;
                }
                Ok(false) => {
                    log::debug!("Nothing to back up at {}", store.path().display());
                    report.skipped += 1;
                }
                Err(e) => {
                    log::error!("Backup of {} failed: {}", store.path().display(), e);
                    report.failed += 1;
                }
            }
        }

        if report.failed == 0 {
            *last_run = Some(date);
        }
        report
    }
}
