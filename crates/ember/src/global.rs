//! Process-wide Ember instance.
//!
//! The instance lives behind an explicit handle: [`initialize`] creates it,
//! [`configure`] swaps in a new one built from a different configuration, and
//! [`dispose`] tears it down. Invocations clone the current `Arc` and release
//! the lock before awaiting, so a concurrent `configure` never blocks on them.

use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{CancellationToken, Ember, EmberConfig, Error, RequestStream, Result};

static INSTANCE: RwLock<Option<Arc<Ember>>> = RwLock::new(None);

/// Create the process-wide instance. Fails if one already exists.
pub fn initialize(config: &EmberConfig) -> Result<Arc<Ember>> {
    let mut slot = INSTANCE.write().unwrap_or_else(PoisonError::into_inner);
    if slot.is_some() {
        return Err(Error::Config(
            "Ember is already initialized; use `global::configure` to replace it".to_string(),
        ));
    }
    let ember = Arc::new(Ember::new(config)?);
    *slot = Some(ember.clone());
    tracing::info!("Global Ember instance initialized");
    Ok(ember)
}

/// Replace the process-wide instance, disposing the previous one.
///
/// Calls already running on the old instance fail with [`Error::Disposed`]
/// once they need a worker again.
pub fn configure(config: &EmberConfig) -> Result<Arc<Ember>> {
    let ember = Arc::new(Ember::new(config)?);
    let previous = INSTANCE
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .replace(ember.clone());
    if let Some(previous) = previous {
        tracing::info!("Replacing global Ember instance");
        previous.dispose();
    }
    Ok(ember)
}

/// Dispose and clear the process-wide instance. A no-op when none exists.
pub fn dispose() {
    let previous = INSTANCE
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if let Some(previous) = previous {
        previous.dispose();
    }
}

/// The current instance.
pub fn instance() -> Result<Arc<Ember>> {
    INSTANCE
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .ok_or_else(|| {
            Error::Config(
                "Ember is not initialized; call `global::initialize` first".to_string(),
            )
        })
}

pub fn is_initialized() -> bool {
    INSTANCE
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .is_some()
}

pub async fn invoke_from_file<R: DeserializeOwned>(
    path: impl Into<PathBuf>,
    export_name: Option<&str>,
    args: Vec<Value>,
    cancel: &CancellationToken,
) -> Result<R> {
    instance()?
        .invoke_from_file(path, export_name, args, cancel)
        .await
}

pub async fn invoke_from_string<R: DeserializeOwned>(
    source: impl Into<String>,
    cache_key: Option<&str>,
    export_name: Option<&str>,
    args: Vec<Value>,
    cancel: &CancellationToken,
) -> Result<R> {
    instance()?
        .invoke_from_string(source, cache_key, export_name, args, cancel)
        .await
}

pub async fn invoke_from_stream<R: DeserializeOwned>(
    stream: RequestStream,
    cache_key: Option<&str>,
    export_name: Option<&str>,
    args: Vec<Value>,
    cancel: &CancellationToken,
) -> Result<R> {
    instance()?
        .invoke_from_stream(stream, cache_key, export_name, args, cancel)
        .await
}

pub async fn invoke_from_cache<R: DeserializeOwned>(
    cache_key: &str,
    export_name: Option<&str>,
    args: Vec<Value>,
    cancel: &CancellationToken,
) -> Result<Option<R>> {
    instance()?
        .invoke_from_cache(cache_key, export_name, args, cancel)
        .await
}

pub async fn invoke_from_string_cached<R: DeserializeOwned>(
    source_factory: impl FnOnce() -> String + Send,
    cache_key: &str,
    export_name: Option<&str>,
    args: Vec<Value>,
    cancel: &CancellationToken,
) -> Result<R> {
    instance()?
        .invoke_from_string_cached(source_factory, cache_key, export_name, args, cancel)
        .await
}

pub async fn invoke_from_stream_cached<R: DeserializeOwned>(
    stream_factory: impl FnOnce() -> RequestStream + Send,
    cache_key: &str,
    export_name: Option<&str>,
    args: Vec<Value>,
    cancel: &CancellationToken,
) -> Result<R> {
    instance()?
        .invoke_from_stream_cached(stream_factory, cache_key, export_name, args, cancel)
        .await
}

pub async fn move_to_new_process() -> Result<()> {
    instance()?.move_to_new_process().await
}
