//! Ember: invoke JavaScript modules in out-of-process workers.
//!
//! [`Ember`] owns a pool of workers built from an [`EmberConfig`] and talks to
//! them over loopback HTTP. Workers are started lazily, replaced when they
//! fail, and optionally recycled when watched source files change.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use ember::{CancellationToken, Ember, EmberConfig};
//! use serde_json::json;
//!
//! let ember = Ember::new(&EmberConfig::default())?;
//! let sum: i64 = ember
//!     .invoke_from_string(
//!         "export const add = (a, b) => a + b;",
//!         Some("adder"),
//!         Some("add"),
//!         vec![json!(1), json!(2)],
//!         &CancellationToken::new(),
//!     )
//!     .await?;
//! ```
//!
//! For code that cannot thread an `Ember` handle through, [`global`] holds one
//! process-wide instance.

pub mod global;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

pub use ember_core::{
    CancellationToken, Concurrency, EmberConfig, Error, InvocationOptions, InvocationRequest,
    ProcessOptions, RequestStream, Result, WatchOptions, WorkerProcess,
};
use ember_core::{HttpTransport, Pool};

/// Pool-backed invocation service.
pub struct Ember {
    pool: Pool<HttpTransport>,
}

impl Ember {
    /// Build the worker pool. No process starts until the first invocation.
    ///
    /// Must be called inside a Tokio runtime when file watching is enabled.
    pub fn new(config: &EmberConfig) -> Result<Self> {
        let pool = Pool::from_config(config, HttpTransport::new)?;
        tracing::debug!(
            size = pool.size(),
            project = %config.process.project_path.display(),
            "Ember service created"
        );
        Ok(Self { pool })
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(&EmberConfig::from_json_file(path)?)
    }

    pub fn pool(&self) -> &Pool<HttpTransport> {
        &self.pool
    }

    /// Invoke and deserialize the result. `Ok(None)` means the cache lookup missed.
    pub async fn invoke<R: DeserializeOwned>(
        &self,
        request: InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<R>> {
        self.pool.invoke(request, cancel).await
    }

    pub async fn invoke_from_file<R: DeserializeOwned>(
        &self,
        path: impl Into<PathBuf>,
        export_name: Option<&str>,
        args: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<R> {
        self.pool
            .invoke_from_file(path, export_name, args, cancel)
            .await
    }

    pub async fn invoke_from_string<R: DeserializeOwned>(
        &self,
        source: impl Into<String>,
        cache_key: Option<&str>,
        export_name: Option<&str>,
        args: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<R> {
        self.pool
            .invoke_from_string(source, cache_key, export_name, args, cancel)
            .await
    }

    pub async fn invoke_from_stream<R: DeserializeOwned>(
        &self,
        stream: RequestStream,
        cache_key: Option<&str>,
        export_name: Option<&str>,
        args: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<R> {
        self.pool
            .invoke_from_stream(stream, cache_key, export_name, args, cancel)
            .await
    }

    pub async fn invoke_from_cache<R: DeserializeOwned>(
        &self,
        cache_key: &str,
        export_name: Option<&str>,
        args: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<Option<R>> {
        self.pool
            .invoke_from_cache(cache_key, export_name, args, cancel)
            .await
    }

    pub async fn invoke_from_string_cached<R: DeserializeOwned>(
        &self,
        source_factory: impl FnOnce() -> String + Send,
        cache_key: &str,
        export_name: Option<&str>,
        args: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<R> {
        self.pool
            .invoke_from_string_cached(source_factory, cache_key, export_name, args, cancel)
            .await
    }

    pub async fn invoke_from_stream_cached<R: DeserializeOwned>(
        &self,
        stream_factory: impl FnOnce() -> RequestStream + Send,
        cache_key: &str,
        export_name: Option<&str>,
        args: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<R> {
        self.pool
            .invoke_from_stream_cached(stream_factory, cache_key, export_name, args, cancel)
            .await
    }

    /// Start (if needed) the first member's worker and wait for its handshake.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<Arc<WorkerProcess>> {
        let members = self.pool.members();
        match members.first() {
            Some(member) => member.connect(cancel).await,
            None => Err(Error::Disposed),
        }
    }

    pub async fn move_to_new_process(&self) -> Result<()> {
        self.pool.move_to_new_process().await
    }

    /// Dispose every worker. Inside a Tokio runtime the processes are
    /// killed on the blocking pool and this does not wait for them.
    pub fn dispose(&self) {
        self.pool.dispose();
    }
}

impl Drop for Ember {
    fn drop(&mut self) {
        self.pool.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_starts_no_process() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = EmberConfig {
            process: ProcessOptions {
                project_path: temp.path().to_path_buf(),
                ..ProcessOptions::default()
            },
            concurrency: Concurrency::MultiProcess { degree: 3 },
            ..EmberConfig::default()
        };
        let ember = Ember::new(&config).unwrap();
        assert_eq!(ember.pool().size(), 3);
        assert!(ember.pool().members().iter().all(|m| m.worker_pid().is_none()));
    }

    #[tokio::test]
    async fn test_disposed_service_rejects_calls() {
        let ember = Ember::new(&EmberConfig::default()).unwrap();
        ember.dispose();
        let result = ember
            .invoke_from_file::<Value>("index.js", None, Vec::new(), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::Disposed)));
    }

    #[test]
    fn test_from_json_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("ember.json");
        std::fs::write(
            &path,
            r#"{ "concurrency": { "mode": "multi_process", "degree": 2 } }"#,
        )
        .unwrap();
        let ember = Ember::from_json_file(&path).unwrap();
        assert_eq!(ember.pool().size(), 2);

        assert!(matches!(
            Ember::from_json_file(temp.path().join("missing.json")),
            Err(Error::Config(_))
        ));
    }
}
