// pg-s3-backup/src/utils/databases.rs
use tracing::info;

use crate::config::PgConnection;
use crate::errors::{BackupError, Result};
use crate::utils::command::{CommandRunner, CommandSpec};

/// Non-template databases in server collation order.
pub const LIST_DATABASES_QUERY: &str =
    "SELECT datname FROM pg_database WHERE datistemplate = false ORDER BY datname;";

/// Database psql connects to while listing.
const MAINTENANCE_DB: &str = "postgres";

/// Builds a libpq conninfo string, quoting values that need it.
pub fn conninfo(pg: &PgConnection, dbname: &str) -> String {
    format!(
        "host={} port={} user={} dbname={} sslmode={}",
        quote_conninfo_value(&pg.host),
        pg.port,
        quote_conninfo_value(&pg.user),
        quote_conninfo_value(dbname),
        quote_conninfo_value(&pg.ssl_mode),
    )
}

fn quote_conninfo_value(value: &str) -> String {
    let plain = !value.is_empty()
        && !value
            .chars()
            .any(|c| c.is_whitespace() || c == '\'' || c == '\\');
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
    }
}

/// Asks the server which databases exist. Without this list the run cannot continue.
pub async fn list_databases(
    runner: &dyn CommandRunner,
    psql: &str,
    pg: &PgConnection,
) -> Result<Vec<String>> {
    let spec = CommandSpec::new(psql)
        .arg(conninfo(pg, MAINTENANCE_DB))
        .args(["-X", "-Aqt", "-c", LIST_DATABASES_QUERY])
        .envs(pg.child_env());

    let output = runner
        .run(&spec)
        .await
        .map_err(|e| BackupError::ListDatabases {
            stderr: format!("failed to start {}: {}", psql, e),
        })?;
    if !output.success() {
        return Err(BackupError::ListDatabases {
            stderr: output.diagnostics(),
        });
    }

    let databases: Vec<String> = output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    info!("[info] Databases found: {:?}", databases);
    Ok(databases)
}
