// pg-s3-backup/src/backup/db_dump.rs
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::{PgConnection, ToolPaths};
use crate::errors::{BackupError, Result};
use crate::utils::command::{CommandRunner, CommandSpec};

pub const GLOBALS_FILE_NAME: &str = "globals.sql";

/// File-system safe stem for a database's local artifacts. Database names may contain path separators.
pub fn local_artifact_stem(db: &str) -> String {
    db.replace(['/', '\\'], "_")
}

/// Runs pg_dumpall and pg_dump for one backup run.
pub struct DumpInvoker<'a> {
    runner: &'a dyn CommandRunner,
    tools: &'a ToolPaths,
    postgres: &'a PgConnection,
    jobs: u32,
}

impl<'a> DumpInvoker<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        tools: &'a ToolPaths,
        postgres: &'a PgConnection,
        jobs: u32,
    ) -> Self {
        DumpInvoker {
            runner,
            tools,
            postgres,
            jobs,
        }
    }

    fn connection_args(&self) -> Vec<String> {
        vec![
            "--host".to_string(),
            self.postgres.host.clone(),
            "--port".to_string(),
            self.postgres.port.to_string(),
            "--username".to_string(),
            self.postgres.user.clone(),
            "--no-password".to_string(),
        ]
    }

    /// Dumps roles, tablespaces and other cluster-wide objects to `{dir}/globals.sql`.
    pub async fn dump_globals(&self, dir: &Path) -> Result<PathBuf> {
        let out = dir.join(GLOBALS_FILE_NAME);
        let spec = CommandSpec::new(&self.tools.pg_dumpall)
            .arg("--globals-only")
            .args(self.connection_args())
            .arg("--quote-all-identifiers")
            .arg("-f")
            .arg(&out)
            .envs(self.postgres.child_env());

        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| BackupError::GlobalsDump {
                stderr: format!("failed to start {}: {}", self.tools.pg_dumpall, e),
            })?;
        if !output.success() {
            return Err(BackupError::GlobalsDump {
                stderr: output.diagnostics(),
            });
        }

        info!("✓ Globals dumped to {}", out.display());
        Ok(out)
    }

    /// Dumps one database in directory format to `{dir}/{db}.dir`, with `jobs` pg_dump workers.
    pub async fn dump_database(&self, db: &str, dir: &Path) -> Result<PathBuf> {
        let out_dir = dir.join(format!("{}.dir", local_artifact_stem(db)));
        let spec = CommandSpec::new(&self.tools.pg_dump)
            .arg("--format=directory")
            .arg(format!("--jobs={}", self.jobs))
            .args(self.connection_args())
            .args(["--blobs", "--quote-all-identifiers", "--verbose"])
            .arg("--file")
            .arg(&out_dir)
            .arg(db)
            .envs(self.postgres.child_env());

        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| BackupError::DatabaseDump {
                db: db.to_string(),
                stderr: format!("failed to start {}: {}", self.tools.pg_dump, e),
            })?;
        if !output.success() {
            return Err(BackupError::DatabaseDump {
                db: db.to_string(),
                stderr: output.diagnostics(),
            });
        }

        // pg_dump --verbose reports progress on stderr even on success.
        debug!("pg_dump {} output:\n{}", db, output.stderr.trim_end());
        info!("✓ Database {} dumped to {}", db, out_dir.display());
        Ok(out_dir)
    }
}
