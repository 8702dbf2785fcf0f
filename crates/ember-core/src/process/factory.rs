//! Spawn configuration for worker processes.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use crate::config::ProcessOptions;
use crate::error::Result;

use super::worker::{WorkerEvents, WorkerProcess};

/// Worker bootstrap shipped with the crate: a loopback HTTP server that loads
/// and invokes modules.
pub const DEFAULT_BOOTSTRAP: &str = include_str!("../scripts/bootstrap.mjs");

/// Executable used when none is configured.
pub const DEFAULT_EXECUTABLE: &str = "node";

/// Variable that tells the runtime whether it runs in development.
pub const RUNTIME_ENV_VAR: &str = "NODE_ENV";

/// Fallback source for the hosting environment name.
pub const HOSTING_ENV_VAR: &str = "EMBER_ENVIRONMENT";

/// Everything needed to start one worker.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: PathBuf,
    /// Arguments as passed to the OS on Unix (bootstrap unescaped).
    pub args: Vec<String>,
    /// Canonical single-string command line with the bootstrap quoted and escaped.
    pub command_line: String,
    pub working_dir: PathBuf,
    /// Variables layered over the inherited environment.
    pub env: BTreeMap<String, String>,
}

impl SpawnSpec {
    /// Build a `Command` for this spec.
    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.program);

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            command.raw_arg(&self.command_line);
        }
        #[cfg(not(windows))]
        command.args(&self.args);

        command.current_dir(&self.working_dir).envs(&self.env);
        command
    }
}

/// Creates worker processes from [`ProcessOptions`].
#[derive(Debug, Clone)]
pub struct ProcessFactory {
    options: ProcessOptions,
    bootstrap: Arc<str>,
}

impl ProcessFactory {
    pub fn new(options: ProcessOptions) -> Self {
        Self {
            options,
            bootstrap: Arc::from(DEFAULT_BOOTSTRAP),
        }
    }

    /// Replace the embedded bootstrap script.
    pub fn with_bootstrap(mut self, script: impl Into<String>) -> Self {
        self.bootstrap = Arc::from(script.into());
        self
    }

    pub fn options(&self) -> &ProcessOptions {
        &self.options
    }

    /// Resolve the spawn configuration for a worker of this host process.
    pub fn spawn_spec(&self) -> SpawnSpec {
        let host_pid = std::process::id();
        let port = self.options.port;

        let mut args = self.options.runtime_flags.clone();
        args.extend([
            "--input-type=module".to_string(),
            "-e".to_string(),
            self.bootstrap.to_string(),
            "--".to_string(),
            "--parentPid".to_string(),
            host_pid.to_string(),
            "--port".to_string(),
            port.to_string(),
        ]);

        let mut command_line = String::new();
        for flag in &self.options.runtime_flags {
            command_line.push_str(flag);
            command_line.push(' ');
        }
        command_line.push_str(&format!(
            "--input-type=module -e \"{}\" -- --parentPid {} --port {}",
            escape_inline_script(&self.bootstrap),
            host_pid,
            port
        ));

        SpawnSpec {
            program: self.executable(),
            args,
            command_line,
            working_dir: self.options.project_path.clone(),
            env: self.environment(),
        }
    }

    /// Spawn a worker and attach `events` to its output and exit.
    pub fn spawn(&self, events: Arc<dyn WorkerEvents>) -> Result<WorkerProcess> {
        let spec = self.spawn_spec();
        tracing::debug!(
            "Spawning worker: {} (cwd {})",
            spec.program.display(),
            spec.working_dir.display()
        );
        let worker = WorkerProcess::start(spec.command(), events)?;
        tracing::info!(pid = worker.pid(), "Worker process started");
        Ok(worker)
    }

    fn executable(&self) -> PathBuf {
        if let Some(path) = &self.options.executable_path {
            return path.clone();
        }
        which::which(DEFAULT_EXECUTABLE).unwrap_or_else(|_| PathBuf::from(DEFAULT_EXECUTABLE))
    }

    fn environment(&self) -> BTreeMap<String, String> {
        let mut env = self.options.environment_variables.clone();

        if !env.contains_key(RUNTIME_ENV_VAR) && std::env::var_os(RUNTIME_ENV_VAR).is_none() {
            let hosting = self
                .options
                .hosting_environment
                .clone()
                .or_else(|| std::env::var(HOSTING_ENV_VAR).ok());
            if let Some(name) = hosting {
                env.insert(RUNTIME_ENV_VAR.to_string(), runtime_mode(&name).to_string());
            }
        }

        env
    }
}

fn runtime_mode(hosting_environment: &str) -> &'static str {
    if hosting_environment.eq_ignore_ascii_case("development") {
        "development"
    } else {
        "production"
    }
}

/// Escape a script for use inside a double-quoted command-line argument.
///
/// Backslashes are literal unless they precede a double quote or end the
/// string; those runs are doubled, and every double quote gets a backslash.
pub fn escape_inline_script(script: &str) -> String {
    let mut escaped = String::with_capacity(script.len() + 16);
    let mut backslashes = 0usize;

    for c in script.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                push_backslashes(&mut escaped, backslashes * 2 + 1);
                escaped.push('"');
                backslashes = 0;
            }
            _ => {
                push_backslashes(&mut escaped, backslashes);
                escaped.push(c);
                backslashes = 0;
            }
        }
    }
    push_backslashes(&mut escaped, backslashes * 2);

    escaped
}

fn push_backslashes(out: &mut String, count: usize) {
    out.extend(std::iter::repeat_n('\\', count));
}
