// pg-s3-backup/src/backup/logic.rs
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{error, info, warn};

use super::archive::create_tar_gz_archive;
use super::db_dump::{DumpInvoker, local_artifact_stem};
use super::retention::{self, SweepSummary};
use super::s3_storage::ObjectStore;
use crate::config::BackupConfig;
use crate::errors::{BackupError, Result};
use crate::utils::command::CommandRunner;
use crate::utils::databases::list_databases;

/// Timestamp layout used in object keys, e.g. `20240630T120000Z`.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Identity of one invocation: where its objects go in the bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRun {
    base_prefix: String,
    instance_name: String,
    timestamp: String,
}

impl BackupRun {
    pub fn new(base_prefix: &str, instance_name: &str, started_at: DateTime<Utc>) -> Self {
        BackupRun {
            base_prefix: base_prefix.trim_matches('/').to_string(),
            instance_name: instance_name.to_string(),
            timestamp: started_at.format(TIMESTAMP_FORMAT).to_string(),
        }
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    /// Every run of this instance lives below this prefix (trailing slash included).
    pub fn instance_prefix(&self) -> String {
        if self.base_prefix.is_empty() {
            format!("{}/", self.instance_name)
        } else {
            format!("{}/{}/", self.base_prefix, self.instance_name)
        }
    }

    pub fn prefix(&self) -> String {
        format!("{}{}", self.instance_prefix(), self.timestamp)
    }

    pub fn globals_key(&self) -> String {
        format!("{}/globals.sql", self.prefix())
    }

    pub fn database_key(&self, db: &str) -> String {
        format!("{}/{}.dump", self.prefix(), db)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    Init,
    GlobalsDump,
    GlobalsUpload,
    Enumerate,
    DatabaseDump,
    DatabaseUpload,
    Retention,
    Done,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStage::Init => "init",
            RunStage::GlobalsDump => "globals-dump",
            RunStage::GlobalsUpload => "globals-upload",
            RunStage::Enumerate => "enumerate",
            RunStage::DatabaseDump => "database-dump",
            RunStage::DatabaseUpload => "database-upload",
            RunStage::Retention => "retention",
            RunStage::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RetentionOutcome {
    Disabled,
    Swept(SweepSummary),
    Failed { message: String },
}

/// What a successful run did, logged as JSON at the end.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub instance: String,
    pub prefix: String,
    pub databases: Vec<String>,
    pub uploaded_keys: Vec<String>,
    pub retention: RetentionOutcome,
}

struct Uploaded {
    databases: Vec<String>,
    keys: Vec<String>,
}

/// Globals, then every database, strictly one after another; the first hard
/// failure ends the run and skips retention.
pub struct BackupPipeline<'a> {
    config: &'a BackupConfig,
    runner: &'a dyn CommandRunner,
    store: &'a dyn ObjectStore,
}

impl<'a> BackupPipeline<'a> {
    pub fn new(
        config: &'a BackupConfig,
        runner: &'a dyn CommandRunner,
        store: &'a dyn ObjectStore,
    ) -> Self {
        BackupPipeline {
            config,
            runner,
            store,
        }
    }

    pub async fn execute(&self, started_at: DateTime<Utc>) -> Result<RunReport> {
        let run = BackupRun::new(
            &self.config.spaces.folder_prefix,
            &self.config.instance_name,
            started_at,
        );
        enter(RunStage::Init);
        info!(
            "🚀 Backup run {} of {}:{} to s3://{}/{}",
            run.timestamp(),
            self.config.postgres.host,
            self.config.postgres.port,
            self.store.bucket(),
            run.prefix()
        );

        // The workspace is gone by the time this returns, whatever the outcome.
        let uploaded = self.dump_and_upload(&run).await?;

        enter(RunStage::Retention);
        let retention = self.apply_retention(&run).await;

        enter(RunStage::Done);
        Ok(RunReport {
            instance: self.config.instance_name.clone(),
            prefix: run.prefix(),
            databases: uploaded.databases,
            uploaded_keys: uploaded.keys,
            retention,
        })
    }

    async fn create_workspace(&self) -> Result<TempDir> {
        let workspace = match &self.config.temp_dump_root {
            Some(root) => {
                tokio::fs::create_dir_all(root).await?;
                tempfile::Builder::new().prefix("pg-backup-").tempdir_in(root)?
            }
            None => tempfile::Builder::new().prefix("pg-backup-").tempdir()?,
        };
        info!("📂 Workspace created at {}", workspace.path().display());
        Ok(workspace)
    }

    async fn dump_and_upload(&self, run: &BackupRun) -> Result<Uploaded> {
        let workspace = self.create_workspace().await?;
        let result = self.dump_and_upload_in(workspace.path(), run).await;

        let location = workspace.path().to_path_buf();
        if let Err(e) = workspace.close() {
            warn!("Could not remove workspace {}: {}", location.display(), e);
        }
        if let Err(e) = &result {
            error!("❌ Backup aborted: {}", e);
        }
        result
    }

    async fn dump_and_upload_in(&self, dir: &Path, run: &BackupRun) -> Result<Uploaded> {
        let dumper = DumpInvoker::new(
            self.runner,
            &self.config.tools,
            &self.config.postgres,
            self.config.dump_jobs,
        );
        let mut keys = Vec::new();

        enter(RunStage::GlobalsDump);
        let globals = dumper.dump_globals(dir).await?;
        enter(RunStage::GlobalsUpload);
        let key = run.globals_key();
        self.store.upload(&globals, &key).await?;
        keys.push(key);

        enter(RunStage::Enumerate);
        let databases =
            list_databases(self.runner, &self.config.tools.psql, &self.config.postgres).await?;

        for db in &databases {
            info!("🔍 Backing up database: {}", db);
            enter(RunStage::DatabaseDump);
            let dump_dir = dumper.dump_database(db, dir).await?;
            let archive =
                package(db, dump_dir.clone(), dir.join(format!("{}.tar.gz", local_artifact_stem(db))))
                    .await?;
            discard(&dump_dir).await;

            enter(RunStage::DatabaseUpload);
            let key = run.database_key(db);
            self.store.upload(&archive, &key).await?;
            discard(&archive).await;
            keys.push(key);
        }

        Ok(Uploaded { databases, keys })
    }

    async fn apply_retention(&self, run: &BackupRun) -> RetentionOutcome {
        if self.config.retention_days <= 0 {
            return RetentionOutcome::Disabled;
        }
        match retention::sweep(
            self.store,
            &run.instance_prefix(),
            self.config.retention_days,
            Utc::now(),
        )
        .await
        {
            Ok(summary) => RetentionOutcome::Swept(summary),
            Err(e) => {
                warn!("[retention] Warning: {}", e);
                RetentionOutcome::Failed {
                    message: e.to_string(),
                }
            }
        }
    }
}

fn enter(stage: RunStage) {
    tracing::debug!(%stage, "entering stage");
}

/// Tars and gzips a dump directory off the async runtime.
async fn package(db: &str, dump_dir: PathBuf, archive_path: PathBuf) -> Result<PathBuf> {
    let db_name = db.to_string();
    tokio::task::spawn_blocking(move || create_tar_gz_archive(&dump_dir, &db_name, &archive_path))
        .await
        .map_err(|e| BackupError::Package {
            db: db.to_string(),
            message: format!("packaging task failed: {}", e),
        })?
}

/// Frees disk early; the workspace removal catches anything left behind.
async fn discard(path: &Path) {
    let removed = if path.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    if let Err(e) = removed {
        warn!("Could not remove {}: {}", path.display(), e);
    }
}
