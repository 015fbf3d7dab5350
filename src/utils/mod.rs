pub mod command;
pub mod databases;

use std::io;
use std::path::PathBuf;
use which::which;

/// Resolves a PostgreSQL client tool (name or path) against PATH.
pub fn find_executable(program: &str) -> io::Result<PathBuf> {
    which(program).map_err(|e| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!(
                "{} executable not found ({}). Please ensure PostgreSQL client tools are installed and in your PATH.",
                program, e
            ),
        )
    })
}
