//! Round-robin pool of orchestrators.
//!
//! Each member owns its own worker. Calls are spread by an atomic cursor with
//! no affinity, and retries stay inside whichever member took the call.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::EmberConfig;
use crate::error::{Error, Result};
use crate::invoke::Orchestrator;
use crate::request::{InvocationRequest, RequestStream};

/// Fixed set of orchestrators with round-robin dispatch.
pub struct Pool<T: crate::transport::Transport> {
    members: Vec<Orchestrator<T>>,
    cursor: AtomicUsize,
}

impl<T: crate::transport::Transport> Pool<T> {
    pub fn new(members: Vec<Orchestrator<T>>) -> Result<Self> {
        if members.is_empty() {
            return Err(Error::InvalidArgument(
                "a pool needs at least one member".to_string(),
            ));
        }
        Ok(Self {
            members,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Build `config.concurrency.degree()` members, one transport each.
    pub fn from_config(
        config: &EmberConfig,
        mut transport: impl FnMut() -> Result<T>,
    ) -> Result<Self> {
        let degree = config.concurrency.degree();
        let members = (0..degree)
            .map(|_| Orchestrator::new(config, transport()?))
            .collect::<Result<Vec<_>>>()?;
        tracing::info!(size = degree, "Created worker pool");
        Self::new(members)
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn members(&self) -> &[Orchestrator<T>] {
        &self.members
    }

    /// Member for the next call.
    fn next(&self) -> &Orchestrator<T> {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.members.len();
        &self.members[index]
    }

    pub async fn invoke<R: DeserializeOwned>(
        &self,
        request: InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<R>> {
        self.next().invoke(request, cancel).await
    }

    pub async fn invoke_bytes(
        &self,
        request: InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<u8>>> {
        self.next().invoke_bytes(request, cancel).await
    }

    pub async fn invoke_from_file<R: DeserializeOwned>(
        &self,
        path: impl Into<PathBuf>,
        export_name: Option<&str>,
        args: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<R> {
        self.next()
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
        self.next()
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
        self.next()
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
        self.next()
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
        self.next()
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
        self.next()
            .invoke_from_stream_cached(stream_factory, cache_key, export_name, args, cancel)
            .await
    }

    /// Replace the worker of every member.
    pub async fn move_to_new_process(&self) -> Result<()> {
        for member in &self.members {
            member.move_to_new_process().await?;
        }
        Ok(())
    }

    /// Dispose every member. See [`Orchestrator::dispose`] for when this blocks.
    pub fn dispose(&self) {
        for member in &self.members {
            member.dispose();
        }
    }
}
