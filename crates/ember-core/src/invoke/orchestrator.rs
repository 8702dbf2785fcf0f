//! The invocation state machine for one worker slot.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{EmberConfig, InvocationOptions, WatchOptions};
use crate::error::{Error, Result};
use crate::handshake::{base_url, parse_handshake};
use crate::process::{ProcessFactory, ProcessState, StatusCell, WorkerEvents, WorkerProcess};
use crate::request::{InvocationRequest, RequestStream};
use crate::transport::{
    ResponseBody, Transport, TransportError, TransportRequest, TransportResponse,
};
use crate::watch::FileWatcher;

use super::retry::{Failure, RetryBudget, RetryDecision};

/// Outcome of one connect/swap, shared by every caller waiting on the gate.
type PendingWorker = Shared<BoxFuture<'static, std::result::Result<Arc<WorkerProcess>, String>>>;

/// Invokes functions in one worker process, replacing it as needed.
///
/// Cloning is cheap; clones share the worker slot.
pub struct Orchestrator<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for Orchestrator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<T: Transport> {
    factory: ProcessFactory,
    options: InvocationOptions,
    transport: T,
    /// Current worker. Locked only to read or replace the `Arc`.
    current: RwLock<Option<Arc<WorkerProcess>>>,
    /// Single-flight gate for connect and swap.
    gate: tokio::sync::Mutex<Option<PendingWorker>>,
    /// In-flight exchanges; present only with graceful shutdown.
    in_flight: Option<TaskTracker>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl<T: Transport> Orchestrator<T> {
    /// Build from the full configuration.
    ///
    /// Must be called inside a Tokio runtime when file watching is enabled.
    pub fn new(config: &EmberConfig, transport: T) -> Result<Self> {
        Self::with_factory(
            ProcessFactory::new(config.process.clone()),
            config.invocation.clone(),
            config.watch.clone(),
            transport,
        )
    }

    pub fn with_factory(
        factory: ProcessFactory,
        options: InvocationOptions,
        watch: WatchOptions,
        transport: T,
    ) -> Result<Self> {
        let graceful = watch.enabled && watch.graceful_shutdown;
        let orchestrator = Self {
            inner: Arc::new(Inner {
                options,
                transport,
                current: RwLock::new(None),
                gate: tokio::sync::Mutex::new(None),
                in_flight: graceful.then(TaskTracker::new),
                watch_task: Mutex::new(None),
                disposed: AtomicBool::new(false),
                factory,
            }),
        };

        if watch.enabled {
            let root = watch
                .directory
                .clone()
                .unwrap_or_else(|| orchestrator.inner.factory.options().project_path.clone());
            let watcher = FileWatcher::new(&root, &watch)?;
            let handle = tokio::runtime::Handle::try_current().map_err(|_| {
                Error::Config("file watching requires a Tokio runtime".to_string())
            })?;
            tracing::info!("Watching {} for changes", root.display());
            let task = handle.spawn(watch_loop(Arc::downgrade(&orchestrator.inner), watcher));
            *lock(&orchestrator.inner.watch_task) = Some(task);
        }

        Ok(orchestrator)
    }

    /// Invoke and deserialize the result. `Ok(None)` means the cache lookup missed.
    pub async fn invoke<R: DeserializeOwned>(
        &self,
        request: InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<R>> {
        match self.invoke_raw(request, cancel).await? {
            Some(body) => body.decode().map(Some),
            None => Ok(None),
        }
    }

    /// Invoke and return the raw response bytes.
    pub async fn invoke_bytes(
        &self,
        request: InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<u8>>> {
        Ok(self
            .invoke_raw(request, cancel)
            .await?
            .map(ResponseBody::into_bytes))
    }

    pub async fn invoke_from_file<R: DeserializeOwned>(
        &self,
        path: impl Into<PathBuf>,
        export_name: Option<&str>,
        args: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<R> {
        let request = with_export(InvocationRequest::file(path), export_name).with_args(args);
        self.invoke_found(request, cancel).await
    }

    pub async fn invoke_from_string<R: DeserializeOwned>(
        &self,
        source: impl Into<String>,
        cache_key: Option<&str>,
        export_name: Option<&str>,
        args: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<R> {
        let mut request =
            with_export(InvocationRequest::inline(source), export_name).with_args(args);
        if let Some(key) = cache_key {
            request = request.with_cache_key(key);
        }
        self.invoke_found(request, cancel).await
    }

    pub async fn invoke_from_stream<R: DeserializeOwned>(
        &self,
        stream: RequestStream,
        cache_key: Option<&str>,
        export_name: Option<&str>,
        args: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<R> {
        let mut request =
            with_export(InvocationRequest::stream(stream), export_name).with_args(args);
        if let Some(key) = cache_key {
            request = request.with_cache_key(key);
        }
        self.invoke_found(request, cancel).await
    }

    /// Invoke a module the worker cached earlier. `Ok(None)` on a cache miss.
    pub async fn invoke_from_cache<R: DeserializeOwned>(
        &self,
        cache_key: &str,
        export_name: Option<&str>,
        args: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<Option<R>> {
        let request =
            with_export(InvocationRequest::cached(cache_key), export_name).with_args(args);
        self.invoke(request, cancel).await
    }

    /// Try the worker's cache first; on a miss send the source from
    /// `source_factory`, cached under `cache_key`.
    pub async fn invoke_from_string_cached<R: DeserializeOwned>(
        &self,
        source_factory: impl FnOnce() -> String + Send,
        cache_key: &str,
        export_name: Option<&str>,
        args: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<R> {
        if let Some(value) = self
            .invoke_from_cache(cache_key, export_name, args.clone(), cancel)
            .await?
        {
            return Ok(value);
        }
        self.invoke_from_string(source_factory(), Some(cache_key), export_name, args, cancel)
            .await
    }

    /// Stream counterpart of [`Self::invoke_from_string_cached`].
    pub async fn invoke_from_stream_cached<R: DeserializeOwned>(
        &self,
        stream_factory: impl FnOnce() -> RequestStream + Send,
        cache_key: &str,
        export_name: Option<&str>,
        args: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<R> {
        if let Some(value) = self
            .invoke_from_cache(cache_key, export_name, args.clone(), cancel)
            .await?
        {
            return Ok(value);
        }
        self.invoke_from_stream(stream_factory(), Some(cache_key), export_name, args, cancel)
            .await
    }

    /// Replace the current worker, draining in-flight calls first when
    /// graceful shutdown is enabled. A no-op if no worker was started.
    pub async fn move_to_new_process(&self) -> Result<()> {
        let current = read(&self.inner.current).clone();
        let Some(current) = current else {
            return Ok(());
        };
        let drain = self.inner.in_flight.is_some();
        self.acquire(Some(&current), drain, &CancellationToken::new())
            .await
            .map(|_| ())
    }

    /// Ensure a worker is running and handshaken, and return it.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<Arc<WorkerProcess>> {
        self.acquire(None, false, cancel).await
    }

    /// Pid of the current worker, if any.
    pub fn worker_pid(&self) -> Option<u32> {
        read(&self.inner.current).as_ref().map(|w| w.pid())
    }

    /// State of the attached worker.
    ///
    /// [`ProcessState::NotStarted`] while no worker is attached: before the
    /// first connect and while a swap is in progress.
    pub fn state(&self) -> ProcessState {
        if self.inner.disposed.load(Ordering::Acquire) {
            return ProcessState::Disposed;
        }
        read(&self.inner.current)
            .as_ref()
            .map_or(ProcessState::NotStarted, |w| w.state())
    }

    /// Whether the current worker has completed its handshake.
    pub fn is_connected(&self) -> bool {
        read(&self.inner.current)
            .as_ref()
            .is_some_and(|w| w.is_connected())
    }

    /// Stop watching and dispose the current worker. Later calls fail with
    /// [`Error::Disposed`].
    ///
    /// Inside a Tokio runtime the kill and the bounded wait for the process
    /// run on the blocking pool and this returns at once. Outside one it
    /// blocks until the worker has exited.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    /// Invoke with retries; the core loop behind every public operation.
    pub async fn invoke_raw(
        &self,
        mut request: InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<ResponseBody>> {
        request.validate()?;

        let mut budget = RetryBudget::new(&self.inner.options);
        let origin = request.stream_position().await?;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let worker = self.acquire(None, false, cancel).await?;
            let failure = match self.attempt(&worker, &mut request, cancel).await? {
                Ok(outcome) => return Ok(outcome),
                Err(failure) => failure,
            };

            if !request.is_retryable() {
                tracing::warn!(
                    pid = worker.pid(),
                    "Invocation failed with a non-seekable stream, not retrying: {}",
                    failure
                );
                return Err(failure.into_error());
            }

            match budget.next(&failure) {
                RetryDecision::Surface => {
                    tracing::warn!(attempt, "Invocation failed, no retries left: {}", failure);
                    return Err(failure.into_error());
                }
                RetryDecision::SameProcess => {
                    tracing::warn!(
                        attempt,
                        pid = worker.pid(),
                        "Invocation failed, retrying in the same worker: {}",
                        failure
                    );
                }
                RetryDecision::NewProcess => {
                    tracing::warn!(
                        attempt,
                        pid = worker.pid(),
                        "Invocation failed, retrying in a new worker: {}",
                        failure
                    );
                    self.acquire(Some(&worker), false, cancel).await?;
                }
            }

            if let Some(position) = origin
                && request.rewind(position).await?
            {
                tracing::debug!(position, "Rewound request stream");
            }
        }
    }

    /// One exchange with `worker`.
    ///
    /// The outer error aborts the invocation (cancellation, unreadable stream);
    /// the inner one goes to the retry policy.
    async fn attempt(
        &self,
        worker: &WorkerProcess,
        request: &mut InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<std::result::Result<Option<ResponseBody>, Failure>> {
        let Some(endpoint) = worker.endpoint() else {
            return Ok(Err(Failure::Transport(TransportError::Io(format!(
                "worker {} has no endpoint",
                worker.pid()
            )))));
        };

        // Encoding reads the stream, so it races cancellation and the timeout too.
        let exchange = async {
            let (header, payload) = request.encode().await?;
            let send = self
                .inner
                .transport
                .send(endpoint, TransportRequest { header, payload });
            Ok::<_, Error>(match &self.inner.in_flight {
                Some(tracker) => tracker.track_future(send).await,
                None => send.await,
            })
        };

        let response = match self.inner.options.timeout() {
            Some(limit) => tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                response = tokio::time::timeout(limit, exchange) => match response {
                    Ok(response) => response?,
                    Err(_) => return Ok(Err(Failure::Timeout(limit))),
                },
            },
            None => tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                response = exchange => response?,
            },
        };

        Ok(match response {
            Ok(TransportResponse::Success(body)) => Ok(Some(body)),
            Ok(TransportResponse::NotFound) => Ok(None),
            Err(e) => Err(Failure::Transport(e)),
        })
    }

    /// Invoke an operation that sends its source; a 404 here is an error.
    async fn invoke_found<R: DeserializeOwned>(
        &self,
        request: InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<R> {
        self.invoke(request, cancel).await?.ok_or_else(|| Error::Invocation {
            message: "the worker reported the module as not found".to_string(),
            stack: None,
        })
    }

    /// Return a connected worker other than `stale`, connecting or swapping
    /// through the single-flight gate when needed.
    async fn acquire(
        &self,
        stale: Option<&Arc<WorkerProcess>>,
        drain: bool,
        cancel: &CancellationToken,
    ) -> Result<Arc<WorkerProcess>> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed);
        }
        if let Some(worker) = self.inner.usable(stale) {
            return Ok(worker);
        }

        let pending = {
            let mut gate = self.inner.gate.lock().await;
            if let Some(worker) = self.inner.usable(stale) {
                return Ok(worker);
            }
            match gate.as_ref().filter(|pending| pending.peek().is_none()) {
                Some(pending) => pending.clone(),
                None => {
                    // Detach the outgoing worker so new callers wait for the replacement.
                    let outgoing = write(&self.inner.current).take();
                    let task = tokio::spawn(replace(self.inner.clone(), outgoing, drain));
                    let pending: PendingWorker = task
                        .map(|joined| {
                            joined.unwrap_or_else(|e| Err(format!("connect task failed: {}", e)))
                        })
                        .boxed()
                        .shared();
                    *gate = Some(pending.clone());
                    pending
                }
            }
        };

        let result = tokio::select! {
            result = pending.clone() => result,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };

        {
            let mut gate = self.inner.gate.lock().await;
            if gate.as_ref().is_some_and(|p| p.ptr_eq(&pending)) {
                *gate = None;
            }
        }

        result.map_err(Error::Connection)
    }
}

impl<T: Transport> Inner<T> {
    fn usable(&self, stale: Option<&Arc<WorkerProcess>>) -> Option<Arc<WorkerProcess>> {
        let current = read(&self.current);
        let worker = current.as_ref()?;
        if !worker.is_connected() || stale.is_some_and(|s| Arc::ptr_eq(s, worker)) {
            return None;
        }
        Some(worker.clone())
    }

    /// Spawn workers until one completes the handshake or the budget runs out.
    async fn connect(&self) -> std::result::Result<Arc<WorkerProcess>, String> {
        let attempts = self.options.num_connection_retries + 1;
        let limit = self.options.connection_timeout();
        let mut last_status = String::from("not started");

        for attempt in 1..=attempts {
            if self.disposed.load(Ordering::Acquire) {
                return Err(Error::Disposed.to_string());
            }

            let worker = self
                .factory
                .spawn(Arc::new(HandshakeListener))
                .map(Arc::new)
                .map_err(|e| format!("failed to start worker: {}", e))?;

            match worker.wait_for_handshake(limit).await {
                ProcessState::Connected => {
                    // Checked under the lock `dispose` takes, so a worker is
                    // never stored after disposal.
                    let stored = {
                        let mut current = write(&self.current);
                        let live = !self.disposed.load(Ordering::Acquire);
                        if live {
                            *current = Some(worker.clone());
                        }
                        live
                    };
                    if stored {
                        return Ok(worker);
                    }
                    dispose_in_background(worker).await;
                    return Err(Error::Disposed.to_string());
                }
                ProcessState::Connecting => {
                    last_status = format!("sent no handshake within {} ms", limit.as_millis());
                }
                _ => last_status = worker.exit_status(),
            }

            tracing::warn!(
                pid = worker.pid(),
                attempt,
                "Worker failed to connect: {}",
                last_status
            );
            dispose_in_background(worker).await;
        }

        Err(format!(
            "no worker connected after {} attempt(s); the last process {}. Increase \
             `invocation.connection_timeout_ms` or `invocation.num_connection_retries` \
             if the worker is slow to start",
            attempts, last_status
        ))
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = lock(&self.watch_task).take() {
            task.abort();
        }
        let Some(worker) = write(&self.current).take() else {
            return;
        };
        tracing::info!(pid = worker.pid(), "Disposing worker");
        match tokio::runtime::Handle::try_current() {
            // A task dropped unrun at shutdown still disposes through `Drop`.
            Ok(runtime) => {
                runtime.spawn_blocking(move || worker.dispose());
            }
            Err(_) => worker.dispose(),
        }
    }
}

impl<T: Transport> Drop for Inner<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Body of the single-flight task: retire `outgoing`, then connect a new worker.
async fn replace<T: Transport>(
    inner: Arc<Inner<T>>,
    outgoing: Option<Arc<WorkerProcess>>,
    drain: bool,
) -> std::result::Result<Arc<WorkerProcess>, String> {
    if let Some(old) = outgoing {
        if drain && let Some(tracker) = &inner.in_flight {
            tracing::info!(
                pid = old.pid(),
                in_flight = tracker.len(),
                "Draining in-flight invocations"
            );
            tracker.close();
            tracker.wait().await;
            tracker.reopen();
        }
        tracing::info!(pid = old.pid(), "Retiring worker ({})", old.exit_status());
        dispose_in_background(old).await;
    }
    inner.connect().await
}

async fn dispose_in_background(worker: Arc<WorkerProcess>) {
    let _ = tokio::task::spawn_blocking(move || worker.dispose()).await;
}

/// Swap workers whenever the watcher reports a matching change.
async fn watch_loop<T: Transport>(inner: Weak<Inner<T>>, mut watcher: FileWatcher) {
    while let Some(path) = watcher.recv().await {
        let Some(inner) = inner.upgrade() else { break };

        watcher.pause();
        tracing::info!("File changed: {}; moving to a new worker", path.display());
        let orchestrator = Orchestrator { inner };
        if let Err(e) = orchestrator.move_to_new_process().await {
            tracing::error!("Failed to move to a new worker: {}", e);
        }
        drop(orchestrator);
        watcher.resume();
    }
}

/// Stdout/stderr handler that completes the handshake.
struct HandshakeListener;

impl WorkerEvents for HandshakeListener {
    fn on_stdout(&self, status: &StatusCell, message: String) {
        if status.state().is_starting()
            && let Some(addr) = parse_handshake(&message)
        {
            let endpoint = base_url(addr);
            if status.mark_connected(endpoint.clone()) {
                tracing::info!(pid = status.pid(), "Connected to worker at {}", endpoint);
            }
            return;
        }
        tracing::debug!(pid = status.pid(), "{}", message);
    }

    fn on_exit(&self, status: &StatusCell) {
        tracing::warn!(pid = status.pid(), "Worker exited: {:?}", status.state());
    }
}

fn with_export(request: InvocationRequest, export_name: Option<&str>) -> InvocationRequest {
    match export_name {
        Some(name) => request.with_export(name),
        None => request,
    }
}

fn read<V>(lock: &RwLock<V>) -> std::sync::RwLockReadGuard<'_, V> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<V>(lock: &RwLock<V>) -> std::sync::RwLockWriteGuard<'_, V> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<V>(mutex: &Mutex<V>) -> std::sync::MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
