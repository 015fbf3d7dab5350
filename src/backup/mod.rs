pub(crate) mod archive;
pub(crate) mod db_dump;
pub(crate) mod logic;
pub(crate) mod retention;
pub(crate) mod s3_storage;

use chrono::Utc;

use crate::config::BackupConfig;
use crate::errors::Result;
use crate::utils::command::ProcessRunner;
use logic::{BackupPipeline, RunReport};
use s3_storage::S3Storage;

/// Public entry point for the backup process: real pg tools, real S3.
pub async fn run_backup_flow(config: &BackupConfig) -> Result<RunReport> {
    let store = S3Storage::connect(&config.spaces).await;
    let runner = ProcessRunner;
    BackupPipeline::new(config, &runner, &store)
        .execute(Utc::now())
        .await
}
