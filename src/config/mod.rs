// pg-s3-backup/src/config/mod.rs
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use url::Url;

use crate::errors::{BackupError, Result};

pub const DEFAULT_PG_HOST: &str = "postgres";
pub const DEFAULT_PG_PORT: u16 = 5432;
pub const DEFAULT_PG_USER: &str = "postgres";
pub const DEFAULT_SSL_MODE: &str = "prefer";
pub const DEFAULT_REGION: &str = "fr-par";
pub const DEFAULT_FOLDER_PREFIX: &str = "pg-backups";
pub const DEFAULT_SSE_MODE: &str = "AES256";
pub const DEFAULT_DUMP_JOBS: u32 = 4;
pub const DEFAULT_MULTIPART_CHUNK_MB: u64 = 64;
/// S3 rejects multipart parts smaller than 5 MiB (except the last one).
pub const MIN_MULTIPART_CHUNK_MB: u64 = 5;
/// S3 rejects parts larger than 5 GiB.
pub const MAX_MULTIPART_CHUNK_MB: u64 = 5 * 1024;

/// Connection parameters handed to psql, pg_dump and pg_dumpall.
#[derive(Clone)]
pub struct PgConnection {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub ssl_mode: String,
}

impl PgConnection {
    /// Environment for a child libpq process. The password never appears on a command line.
    pub fn child_env(&self) -> Vec<(String, String)> {
        vec![
            ("PGPASSWORD".to_string(), self.password.clone()),
            ("PGSSLMODE".to_string(), self.ssl_mode.clone()),
        ]
    }
}

impl fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgConnection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// S3-compatible object storage target (Scaleway, DigitalOcean Spaces, MinIO...).
#[derive(Clone)]
pub struct SpacesConfig {
    pub endpoint_url: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    pub folder_prefix: String,
    pub sse_mode: String,
    pub multipart_chunk_bytes: u64,
}

impl fmt::Debug for SpacesConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpacesConfig")
            .field("endpoint_url", &self.endpoint_url)
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("bucket_name", &self.bucket_name)
            .field("folder_prefix", &self.folder_prefix)
            .field("sse_mode", &self.sse_mode)
            .field("multipart_chunk_bytes", &self.multipart_chunk_bytes)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ToolPaths {
    pub psql: String,
    pub pg_dump: String,
    pub pg_dumpall: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        ToolPaths {
            psql: "psql".to_string(),
            pg_dump: "pg_dump".to_string(),
            pg_dumpall: "pg_dumpall".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub postgres: PgConnection,
    pub spaces: SpacesConfig,
    pub tools: ToolPaths,
    pub instance_name: String,
    /// Days to keep; zero or negative disables retention.
    pub retention_days: i64,
    pub dump_jobs: u32,
    pub temp_dump_root: Option<PathBuf>,
}

impl BackupConfig {
    /// Loads `.env` (if any) and reads the process environment.
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = dotenv::dotenv() {
            tracing::debug!("Loaded environment overrides from {}", path.display());
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let required = [
            "AWS_ACCESS_KEY_ID",
            "AWS_SECRET_ACCESS_KEY",
            "S3_BUCKET",
            "S3_ENDPOINT",
        ];
        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|key| get(*key).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(BackupError::Config(format!(
                "missing S3 settings: {}",
                missing.join(", ")
            )));
        }

        let host = get("PGHOST").unwrap_or_else(|| DEFAULT_PG_HOST.to_string());
        let port = parse_or("PGPORT", get("PGPORT"), DEFAULT_PG_PORT)?;
        let postgres = PgConnection {
            host: host.clone(),
            port,
            user: get("PGUSER").unwrap_or_else(|| DEFAULT_PG_USER.to_string()),
            password: lookup("PGPASSWORD").unwrap_or_default(),
            ssl_mode: get("PGSSLMODE").unwrap_or_else(|| DEFAULT_SSL_MODE.to_string()),
        };

        let endpoint_url = get("S3_ENDPOINT").unwrap_or_default();
        validate_endpoint(&endpoint_url)?;

        let chunk_mb = parse_or(
            "S3_MULTIPART_CHUNK_MB",
            get("S3_MULTIPART_CHUNK_MB"),
            DEFAULT_MULTIPART_CHUNK_MB,
        )?;
        if !(MIN_MULTIPART_CHUNK_MB..=MAX_MULTIPART_CHUNK_MB).contains(&chunk_mb) {
            return Err(BackupError::Config(format!(
                "S3_MULTIPART_CHUNK_MB must be between {} and {}, got {}",
                MIN_MULTIPART_CHUNK_MB, MAX_MULTIPART_CHUNK_MB, chunk_mb
            )));
        }
        let multipart_chunk_bytes = chunk_mb.checked_mul(1024 * 1024).ok_or_else(|| {
            BackupError::Config(format!("S3_MULTIPART_CHUNK_MB is too large: {}", chunk_mb))
        })?;

        let spaces = SpacesConfig {
            endpoint_url,
            region: get("AWS_DEFAULT_REGION").unwrap_or_else(|| DEFAULT_REGION.to_string()),
            access_key_id: get("AWS_ACCESS_KEY_ID").unwrap_or_default(),
            secret_access_key: get("AWS_SECRET_ACCESS_KEY").unwrap_or_default(),
            bucket_name: get("S3_BUCKET").unwrap_or_default(),
            folder_prefix: get("S3_PREFIX").unwrap_or_else(|| DEFAULT_FOLDER_PREFIX.to_string()),
            sse_mode: lookup("S3_SSE").unwrap_or_else(|| DEFAULT_SSE_MODE.to_string()),
            multipart_chunk_bytes,
        };

        let dump_jobs = parse_or("PG_DUMP_JOBS", get("PG_DUMP_JOBS"), DEFAULT_DUMP_JOBS)?;
        if dump_jobs == 0 {
            return Err(BackupError::Config(
                "PG_DUMP_JOBS must be at least 1".to_string(),
            ));
        }

        let defaults = ToolPaths::default();
        let tools = ToolPaths {
            psql: get("PSQL_BIN").unwrap_or(defaults.psql),
            pg_dump: get("PG_DUMP_BIN").unwrap_or(defaults.pg_dump),
            pg_dumpall: get("PG_DUMPALL_BIN").unwrap_or(defaults.pg_dumpall),
        };

        Ok(BackupConfig {
            instance_name: get("INSTANCE_NAME").unwrap_or_else(|| format!("{}-{}", host, port)),
            retention_days: parse_or("RETENTION_DAYS", get("RETENTION_DAYS"), 0)?,
            dump_jobs,
            temp_dump_root: get("TEMP_DUMP_ROOT").map(PathBuf::from),
            postgres,
            spaces,
            tools,
        })
    }
}

fn parse_or<T>(key: &str, value: Option<String>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match value {
        Some(raw) => raw.trim().parse::<T>().map_err(|e| {
            BackupError::Config(format!("{} has invalid value '{}': {}", key, raw, e))
        }),
        None => Ok(default),
    }
}

fn validate_endpoint(endpoint: &str) -> Result<()> {
    let parsed = Url::parse(endpoint)
        .map_err(|e| BackupError::Config(format!("S3_ENDPOINT '{}' is not a URL: {}", endpoint, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(BackupError::Config(format!(
            "S3_ENDPOINT must use http or https, got '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    const STORAGE: [(&str, &str); 4] = [
        ("AWS_ACCESS_KEY_ID", "key"),
        ("AWS_SECRET_ACCESS_KEY", "secret"),
        ("S3_BUCKET", "backups"),
        ("S3_ENDPOINT", "https://s3.fr-par.scw.cloud"),
    ];

    #[test]
    fn test_defaults_applied_when_only_storage_is_set() -> anyhow::Result<()> {
        let config = BackupConfig::from_lookup(lookup_from(&STORAGE))?;

        assert_eq!(config.postgres.host, "postgres");
        assert_eq!(config.postgres.port, 5432);
        assert_eq!(config.postgres.user, "postgres");
        assert_eq!(config.postgres.password, "");
        assert_eq!(config.postgres.ssl_mode, "prefer");
        assert_eq!(config.instance_name, "postgres-5432");
        assert_eq!(config.retention_days, 0);
        assert_eq!(config.dump_jobs, 4);
        assert_eq!(config.spaces.region, "fr-par");
        assert_eq!(config.spaces.folder_prefix, "pg-backups");
        assert_eq!(config.spaces.sse_mode, "AES256");
        assert_eq!(config.spaces.multipart_chunk_bytes, 64 * 1024 * 1024);
        assert_eq!(config.tools.pg_dump, "pg_dump");
        assert!(config.temp_dump_root.is_none());
        Ok(())
    }

    #[test]
    fn test_missing_storage_settings_are_reported_together() {
        let result = BackupConfig::from_lookup(lookup_from(&[
            ("AWS_ACCESS_KEY_ID", "key"),
            ("S3_BUCKET", ""),
        ]));
        match result {
            Err(BackupError::Config(msg)) => {
                assert!(msg.contains("AWS_SECRET_ACCESS_KEY"));
                assert!(msg.contains("S3_BUCKET"));
                assert!(msg.contains("S3_ENDPOINT"));
                assert!(!msg.contains("AWS_ACCESS_KEY_ID"));
            }
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_instance_name_follows_host_and_port() -> anyhow::Result<()> {
        let mut pairs = STORAGE.to_vec();
        pairs.push(("PGHOST", "db.internal"));
        pairs.push(("PGPORT", "6543"));
        let config = BackupConfig::from_lookup(lookup_from(&pairs))?;
        assert_eq!(config.instance_name, "db.internal-6543");

        pairs.push(("INSTANCE_NAME", "primary"));
        let config = BackupConfig::from_lookup(lookup_from(&pairs))?;
        assert_eq!(config.instance_name, "primary");
        Ok(())
    }

    #[test]
    fn test_invalid_numbers_are_config_errors() {
        for (key, value) in [
            ("PGPORT", "not-a-port"),
            ("RETENTION_DAYS", "seven"),
            ("PG_DUMP_JOBS", "0"),
            ("S3_MULTIPART_CHUNK_MB", "1"),
            ("S3_MULTIPART_CHUNK_MB", "5121"),
            ("S3_MULTIPART_CHUNK_MB", "99999999999999"),
        ] {
            let mut pairs = STORAGE.to_vec();
            pairs.push((key, value));
            let result = BackupConfig::from_lookup(lookup_from(&pairs));
            assert!(
                matches!(result, Err(BackupError::Config(_))),
                "{}={} should be rejected",
                key,
                value
            );
        }
    }

    #[test]
    fn test_largest_part_size_is_accepted() -> anyhow::Result<()> {
        let mut pairs = STORAGE.to_vec();
        pairs.push(("S3_MULTIPART_CHUNK_MB", "5120"));
        let config = BackupConfig::from_lookup(lookup_from(&pairs))?;
        assert_eq!(config.spaces.multipart_chunk_bytes, 5 * 1024 * 1024 * 1024);
        Ok(())
    }

    #[test]
    fn test_endpoint_must_be_http_url() {
        let mut pairs = STORAGE.to_vec();
        pairs[3] = ("S3_ENDPOINT", "s3.fr-par.scw.cloud");
        assert!(BackupConfig::from_lookup(lookup_from(&pairs)).is_err());

        pairs[3] = ("S3_ENDPOINT", "ftp://s3.fr-par.scw.cloud");
        assert!(BackupConfig::from_lookup(lookup_from(&pairs)).is_err());
    }

    #[test]
    fn test_secrets_are_redacted_in_debug_output() -> anyhow::Result<()> {
        let mut pairs = STORAGE.to_vec();
        pairs.push(("PGPASSWORD", "hunter2"));
        let config = BackupConfig::from_lookup(lookup_from(&pairs))?;
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("\"secret\""));
        assert_eq!(config.postgres.child_env()[0], ("PGPASSWORD".to_string(), "hunter2".to_string()));
        Ok(())
    }
}
