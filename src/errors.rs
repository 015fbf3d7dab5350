use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Listing databases failed: {stderr}")]
    ListDatabases { stderr: String },

    #[error("pg_dumpall --globals-only failed: {stderr}")]
    GlobalsDump { stderr: String },

    #[error("pg_dump of database '{db}' failed: {stderr}")]
    DatabaseDump { db: String, stderr: String },

    #[error("Packaging dump of database '{db}' failed: {message}")]
    Package { db: String, message: String },

    #[error(
        "Failed to upload {} to {bucket}/{key}: {} - {}",
        .local_path.display(),
        .provider_code.as_deref().unwrap_or("Unknown"),
        .provider_message.as_deref().unwrap_or("no message from provider")
    )]
    Upload {
        local_path: PathBuf,
        bucket: String,
        key: String,
        provider_code: Option<String>,
        provider_message: Option<String>,
    },

    #[error("Storage {operation} on {bucket}/{target} failed: {message}")]
    Storage {
        operation: &'static str,
        bucket: String,
        target: String,
        message: String,
    },

    #[error("Retention sweep failed: {0}")]
    Retention(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BackupError>;
