//! Engine configuration.
//!
//! Every section deserializes with defaults, so a JSON file only needs the
//! fields it overrides:
//!
//! ```json
//! {
//!   "process": { "project_path": "./scripts" },
//!   "invocation": { "timeout_ms": 10000, "num_retries": 2 },
//!   "watch": { "enabled": true }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EmberConfig {
    pub process: ProcessOptions,
    pub invocation: InvocationOptions,
    pub watch: WatchOptions,
    pub concurrency: Concurrency,
}

impl EmberConfig {
    /// Load configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("invalid config {}: {}", path.display(), e)))
    }
}

/// How worker processes are spawned.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessOptions {
    /// Working directory of the worker; also the root for file modules.
    pub project_path: PathBuf,
    /// Runtime executable. Resolved from `PATH` when unset.
    pub executable_path: Option<PathBuf>,
    /// Flags placed before the bootstrap arguments.
    pub runtime_flags: Vec<String>,
    /// Variables layered over the inherited environment.
    pub environment_variables: BTreeMap<String, String>,
    /// Hosting environment name ("Development", "Production", ...).
    /// Falls back to `EMBER_ENVIRONMENT`.
    pub hosting_environment: Option<String>,
    /// Port the worker listens on. `0` lets the OS choose.
    pub port: u16,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            project_path: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            executable_path: None,
            runtime_flags: Vec::new(),
            environment_variables: BTreeMap::new(),
            hosting_environment: None,
            port: 0,
        }
    }
}

/// Timeouts and retry budgets.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InvocationOptions {
    /// Per-attempt timeout. `None` waits forever.
    pub timeout_ms: Option<u64>,
    /// How long a freshly spawned worker has to complete the handshake.
    pub connection_timeout_ms: u64,
    /// Retries against the same worker.
    pub num_retries: u32,
    /// Retries that replace the worker first.
    pub num_process_retries: u32,
    /// Extra spawn attempts when a worker fails to handshake.
    pub num_connection_retries: u32,
    /// Allow process retries for errors raised by the invoked code itself.
    pub process_retries_for_script_errors: bool,
}

impl InvocationOptions {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

impl Default for InvocationOptions {
    fn default() -> Self {
        Self {
            timeout_ms: Some(60_000),
            connection_timeout_ms: 5_000,
            num_retries: 1,
            num_process_retries: 1,
            num_connection_retries: 2,
            process_retries_for_script_errors: false,
        }
    }
}

/// File watching that triggers worker replacement.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchOptions {
    pub enabled: bool,
    /// Root to watch. Defaults to the project path.
    pub directory: Option<PathBuf>,
    /// File name patterns (`*` and `?` wildcards).
    pub patterns: Vec<String>,
    pub recursive: bool,
    /// Drain in-flight invocations before replacing the worker.
    pub graceful_shutdown: bool,
    /// Debounce window for bursts of file events.
    pub debounce_ms: u64,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: None,
            patterns: ["*.js", "*.jsx", "*.ts", "*.tsx", "*.json", "*.html"]
                .into_iter()
                .map(String::from)
                .collect(),
            recursive: true,
            graceful_shutdown: true,
            debounce_ms: 200,
        }
    }
}

/// Number of workers behind one service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Concurrency {
    /// A single worker.
    #[default]
    None,
    /// A round-robin pool. `degree == 0` uses the available parallelism.
    MultiProcess { degree: usize },
}

impl Concurrency {
    /// Resolved number of workers.
    pub fn degree(&self) -> usize {
        match *self {
            Concurrency::None => 1,
            Concurrency::MultiProcess { degree: 0 } => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            Concurrency::MultiProcess { degree } => degree,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EmberConfig::default();
        assert_eq!(config.invocation.timeout(), Some(Duration::from_secs(60)));
        assert_eq!(config.invocation.num_retries, 1);
        assert_eq!(config.invocation.num_process_retries, 1);
        assert!(!config.invocation.process_retries_for_script_errors);
        assert!(!config.watch.enabled);
        assert!(config.watch.patterns.contains(&"*.js".to_string()));
        assert_eq!(config.concurrency.degree(), 1);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let json = r#"{
            "invocation": { "timeout_ms": null, "num_retries": 3 },
            "concurrency": { "mode": "multi_process", "degree": 4 }
        }"#;
        let config: EmberConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.invocation.timeout(), None);
        assert_eq!(config.invocation.num_retries, 3);
        assert_eq!(config.invocation.connection_timeout_ms, 5_000);
        assert_eq!(config.concurrency.degree(), 4);
        assert_eq!(config.process.port, 0);
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ember.json");
        std::fs::write(&path, r#"{ "watch": { "enabled": true, "recursive": false } }"#).unwrap();

        let config = EmberConfig::from_json_file(&path).unwrap();
        assert!(config.watch.enabled);
        assert!(!config.watch.recursive);

        let missing = EmberConfig::from_json_file(dir.path().join("nope.json"));
        assert!(matches!(missing, Err(Error::Config(_))));
    }
}
