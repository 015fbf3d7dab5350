// Test doubles for the two external systems: PostgreSQL client tools and object storage.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::backup::s3_storage::{ObjectPage, ObjectStore, StoredObject};
use crate::errors::{BackupError, Result};
use crate::utils::command::{CommandOutput, CommandRunner, CommandSpec};

/// Pretends to be psql / pg_dumpall / pg_dump, writing plausible artifacts to disk.
#[derive(Default)]
pub struct FakeRunner {
    pub databases: Vec<String>,
    pub fail_listing: bool,
    pub fail_globals: bool,
    pub failing_databases: HashSet<String>,
    pub recorded: Mutex<Vec<CommandSpec>>,
}

impl FakeRunner {
    pub fn with_databases(names: &[&str]) -> Self {
        FakeRunner {
            databases: names.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn failing_database(mut self, name: &str) -> Self {
        self.failing_databases.insert(name.to_string());
        self
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.recorded.lock().unwrap().clone()
    }

    pub fn programs(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.program).collect()
    }

    fn value_after(args: &[OsString], flag: &str) -> Option<PathBuf> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(PathBuf::from)
    }

    fn failed(stderr: &str) -> CommandOutput {
        CommandOutput {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    fn succeeded(stdout: String) -> CommandOutput {
        CommandOutput {
            exit_code: Some(0),
            stdout,
            stderr: String::new(),
        }
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, spec: &CommandSpec) -> io::Result<CommandOutput> {
        self.recorded.lock().unwrap().push(spec.clone());

        match spec.program.as_str() {
            "psql" => {
                if self.fail_listing {
                    return Ok(Self::failed("psql: error: connection refused"));
                }
                let mut stdout = self.databases.join("\n");
                stdout.push('\n');
                Ok(Self::succeeded(stdout))
            }
            "pg_dumpall" => {
                if self.fail_globals {
                    return Ok(Self::failed("pg_dumpall: error: role \"backup\" does not exist"));
                }
                let out = Self::value_after(&spec.args, "-f").expect("pg_dumpall called without -f");
                std::fs::write(out, "CREATE ROLE app;\n")?;
                Ok(Self::succeeded(String::new()))
            }
            "pg_dump" => {
                let db = spec
                    .args
                    .last()
                    .map(|a| a.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if self.failing_databases.contains(&db) {
                    return Ok(Self::failed(&format!(
                        "pg_dump: error: database \"{}\" is corrupt",
                        db
                    )));
                }
                let dir = Self::value_after(&spec.args, "--file").expect("pg_dump called without --file");
                std::fs::create_dir_all(&dir)?;
                std::fs::write(dir.join("toc.dat"), format!("toc for {}", db))?;
                std::fs::write(dir.join("3001.dat.gz"), vec![7u8; 2048])?;
                Ok(Self::succeeded(String::new()))
            }
            other => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} executable not found", other),
            )),
        }
    }
}

/// In-memory bucket with paged listings and call recording.
pub struct MemoryStore {
    page_size: usize,
    objects: Mutex<Vec<StoredObject>>,
    uploads: Mutex<Vec<(PathBuf, String)>>,
    deletes: Mutex<Vec<String>>,
    list_calls: Mutex<usize>,
    fail_listing: Mutex<bool>,
    failing_upload_keys: Mutex<HashSet<String>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::with_page_size(1000)
    }
}

impl MemoryStore {
    pub fn with_page_size(page_size: usize) -> Self {
        MemoryStore {
            page_size,
            objects: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
            list_calls: Mutex::new(0),
            fail_listing: Mutex::new(false),
            failing_upload_keys: Mutex::new(HashSet::new()),
        }
    }

    pub fn insert(&self, key: &str, last_modified: DateTime<Utc>) {
        self.objects.lock().unwrap().push(StoredObject {
            key: key.to_string(),
            last_modified,
        });
    }

    pub fn fail_listing(&self) {
        *self.fail_listing.lock().unwrap() = true;
    }

    pub fn fail_upload_of(&self, key: &str) {
        self.failing_upload_keys.lock().unwrap().insert(key.to_string());
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().iter().map(|o| o.key.clone()).collect()
    }

    pub fn uploaded_keys(&self) -> Vec<String> {
        self.uploads.lock().unwrap().iter().map(|(_, k)| k.clone()).collect()
    }

    pub fn uploaded_paths(&self) -> Vec<PathBuf> {
        self.uploads.lock().unwrap().iter().map(|(p, _)| p.clone()).collect()
    }

    pub fn deleted_keys(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }

    pub fn list_calls(&self) -> usize {
        *self.list_calls.lock().unwrap()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn bucket(&self) -> &str {
        "memory"
    }

    async fn upload(&self, local_path: &Path, key: &str) -> Result<()> {
        self.uploads
            .lock()
            .unwrap()
            .push((local_path.to_path_buf(), key.to_string()));

        if self.failing_upload_keys.lock().unwrap().contains(key) {
            return Err(BackupError::Upload {
                local_path: local_path.to_path_buf(),
                bucket: "memory".to_string(),
                key: key.to_string(),
                provider_code: Some("InternalError".to_string()),
                provider_message: Some("We encountered an internal error".to_string()),
            });
        }
        if !local_path.is_file() {
            return Err(BackupError::Upload {
                local_path: local_path.to_path_buf(),
                bucket: "memory".to_string(),
                key: key.to_string(),
                provider_code: None,
                provider_message: Some("local artifact is missing".to_string()),
            });
        }

        self.insert(key, Utc::now());
        Ok(())
    }

    async fn list_page(&self, prefix: &str, continuation: Option<String>) -> Result<ObjectPage> {
        *self.list_calls.lock().unwrap() += 1;
        if *self.fail_listing.lock().unwrap() {
            return Err(BackupError::Storage {
                operation: "list",
                bucket: "memory".to_string(),
                target: prefix.to_string(),
                message: "SlowDown - Please reduce your request rate".to_string(),
            });
        }

        // Key-ordered like S3; the token is the last key handed out, so deletes between pages are safe.
        let mut matching: Vec<StoredObject> = self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|o| o.key.starts_with(prefix))
            .filter(|o| continuation.as_ref().map_or(true, |after| o.key > *after))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.key.cmp(&b.key));

        let truncated = matching.len() > self.page_size;
        matching.truncate(self.page_size);
        let next_token = if truncated {
            matching.last().map(|o| o.key.clone())
        } else {
            None
        };

        Ok(ObjectPage {
            objects: matching,
            next_token,
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.deletes.lock().unwrap().push(key.to_string());
        self.objects.lock().unwrap().retain(|o| o.key != key);
        Ok(())
    }
}
