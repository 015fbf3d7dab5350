//! PostgreSQL to S3 backup job
//!
//! Dumps cluster globals and every database, uploads the artifacts to an
//! S3-compatible bucket and optionally prunes old runs.

// pg-s3-backup/src/main.rs
mod backup;
mod config;
mod errors;
mod utils;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use config::BackupConfig;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let (code, line) = outcome(&run_app().await);
    if code == 0 {
        println!("{}", line);
    } else {
        eprintln!("{}", line);
    }
    ExitCode::from(code)
}

/// Process exit status and final status line for a finished run.
fn outcome(result: &Result<()>) -> (u8, String) {
    match result {
        Ok(()) => (
            0,
            "[done] Backup complete without blocking writes (pg_dump uses an MVCC snapshot).".to_string(),
        ),
        Err(e) => (1, format!("[fatal] {:#}", e)),
    }
}

async fn run_app() -> Result<()> {
    let config = BackupConfig::from_env()
        .context("Failed to load backup configuration from environment")?;

    let report = backup::run_backup_flow(&config)
        .await
        .context("Backup process failed")?;

    info!(
        "Run report: {}",
        serde_json::to_string(&report).context("Failed to serialise run report")?
    );
    println!("[info] Databases backed up: {:?}", report.databases);
    Ok(())
}
