// pg-s3-backup/src/utils/command.rs
use async_trait::async_trait;
use std::ffi::OsString;
use std::io;
use std::process::Stdio;
use tokio::process::Command;
use tracing::info;

use super::find_executable;

/// An external command described as an argument vector. Nothing here is ever
/// handed to a shell.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<OsString>,
    pub envs: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        CommandSpec {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs(mut self, envs: Vec<(String, String)>) -> Self {
        self.envs.extend(envs);
        self
    }

    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    /// Human readable command line for logs. Environment values are left out.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in self.args_lossy() {
            line.push(' ');
            if arg.is_empty() || arg.contains(char::is_whitespace) || arg.contains('"') {
                line.push_str(&format!("{:?}", arg));
            } else {
                line.push_str(&arg);
            }
        }
        line
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stderr for error reports, falling back to the exit status when the tool printed nothing.
    pub fn diagnostics(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        match self.exit_code {
            Some(code) => format!("exited with status {} and no error output", code),
            None => "terminated by signal".to_string(),
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs the command to completion. `Err` means it could not be started at all.
    async fn run(&self, spec: &CommandSpec) -> io::Result<CommandOutput>;
}

/// Runs commands as real child processes, capturing stdout and stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> io::Result<CommandOutput> {
        let program = find_executable(&spec.program)?;
        info!("[cmd] {}", spec.display());

        let output = Command::new(&program)
            .args(&spec.args)
            .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .output()
            .await?;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
