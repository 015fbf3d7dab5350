// pg-s3-backup/src/backup/archive.rs
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tar::{Builder, HeaderMode};
use tracing::info;
use walkdir::WalkDir;

use super::db_dump::local_artifact_stem;
use crate::errors::{BackupError, Result};

/// Top-level directory used inside a database's archive.
///
/// tar refuses absolute entry names and `..` components, both of which are
/// legal database names. Separators become `_` and a name made only of dots
/// becomes the same number of underscores.
pub fn archive_root_name(db: &str) -> String {
    let stem = local_artifact_stem(db);
    if stem.is_empty() || stem.chars().all(|c| c == '.') {
        "_".repeat(stem.len().max(1))
    } else {
        stem
    }
}

/// Creates a GZipped TAR archive of a directory-format dump.
///
/// Every entry is stored under the [`archive_root_name`] of `db`, so
/// extracting archives from different databases side by side never collides. Entries are written in
/// file-name order with deterministic headers, and file contents are
/// streamed through the encoder rather than buffered.
///
/// # Arguments
/// * `source_dir` - The pg_dump output directory.
/// * `db` - The database the dump belongs to.
/// * `archive_dest_path` - Where the `.tar.gz` file is written.
pub fn create_tar_gz_archive(
    source_dir: &Path,
    db: &str,
    archive_dest_path: &Path,
) -> Result<PathBuf> {
    let root_name = archive_root_name(db);
    let package_error = |message: String| BackupError::Package {
        db: db.to_string(),
        message,
    };

    if !source_dir.is_dir() {
        return Err(package_error(format!(
            "source for archival is not a directory: {}",
            source_dir.display()
        )));
    }

    info!(
        "Creating tar.gz archive from {} to {}",
        source_dir.display(),
        archive_dest_path.display()
    );

    let archive_file = File::create(archive_dest_path).map_err(|e| {
        package_error(format!(
            "failed to create archive file {}: {}",
            archive_dest_path.display(),
            e
        ))
    })?;
    let enc = GzEncoder::new(BufWriter::new(archive_file), Compression::default());
    let mut tar_builder = Builder::new(enc);
    tar_builder.mode(HeaderMode::Deterministic);

    for entry in WalkDir::new(source_dir).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            package_error(format!("failed to walk {}: {}", source_dir.display(), e))
        })?;
        let path = entry.path();
        let relative = path.strip_prefix(source_dir).map_err(|e| {
            package_error(format!(
                "failed to strip prefix {} from {}: {}",
                source_dir.display(),
                path.display(),
                e
            ))
        })?;
        let name = Path::new(&root_name).join(relative);

        if entry.file_type().is_dir() {
            tar_builder.append_dir(&name, path).map_err(|e| {
                package_error(format!("failed to append directory {}: {}", path.display(), e))
            })?;
        } else if entry.file_type().is_file() {
            tar_builder.append_path_with_name(path, &name).map_err(|e| {
                package_error(format!(
                    "failed to append file {} as {}: {}",
                    path.display(),
                    name.display(),
                    e
                ))
            })?;
        }
    }

    let encoder = tar_builder
        .into_inner()
        .map_err(|e| package_error(format!("failed to finish tar stream: {}", e)))?;
    let writer = encoder
        .finish()
        .map_err(|e| package_error(format!("failed to finish gzip stream: {}", e)))?;
    writer
        .into_inner()
        .map_err(|e| package_error(format!("failed to flush archive: {}", e.error())))?
        .sync_all()
        .map_err(|e| package_error(format!("failed to sync archive: {}", e)))?;

    info!(
        "✓ Tar.gz archive created successfully at {}",
        archive_dest_path.display()
    );
    Ok(archive_dest_path.to_path_buf())
}
