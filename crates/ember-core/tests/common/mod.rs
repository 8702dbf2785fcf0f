//! Shared fixtures: shell-script workers and a scripted transport.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Cursor, SeekFrom};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use ember_core::{
    EmberConfig, InvocationOptions, ProcessOptions, ResponseBody, Transport, TransportError,
    TransportRequest, TransportResponse,
};
use serde_json::Value;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};
use tokio::sync::Barrier;

/// Worker that handshakes on a pid-derived port, then idles.
pub const HANDSHAKING_WORKER: &str = r#"#!/bin/sh
echo $$ >> "$EMBER_SPAWN_LOG"
printf '[Ember: Listening on IP - 127.0.0.1 Port - %d]\0\n' $(( $$ % 50000 + 10000 ))
exec sleep 60
"#;

/// Worker that handshakes only after half a second.
pub const SLOW_STARTING_WORKER: &str = r#"#!/bin/sh
echo $$ >> "$EMBER_SPAWN_LOG"
sleep 0.5
printf '[Ember: Listening on IP - 127.0.0.1 Port - %d]\0\n' $(( $$ % 50000 + 10000 ))
exec sleep 60
"#;

/// Worker that ignores SIGTERM, so only the follow-up kill stops it.
pub const STUBBORN_WORKER: &str = r#"#!/bin/sh
echo $$ >> "$EMBER_SPAWN_LOG"
trap '' TERM
printf '[Ember: Listening on IP - 127.0.0.1 Port - %d]\0\n' $(( $$ % 50000 + 10000 ))
exec sleep 60
"#;

/// Worker that never handshakes.
pub const SILENT_WORKER: &str = r#"#!/bin/sh
echo $$ >> "$EMBER_SPAWN_LOG"
exec sleep 60
"#;

/// Worker that exits before handshaking.
pub const CRASHING_WORKER: &str = r#"#!/bin/sh
echo $$ >> "$EMBER_SPAWN_LOG"
echo "cannot start" >&2
exit 3
"#;

/// Temporary project with an executable worker script.
pub struct Fixture {
    pub dir: TempDir,
    pub script: PathBuf,
    pub spawn_log: PathBuf,
}

impl Fixture {
    pub fn new(script: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let script_path = dir.path().join("worker.sh");
        fs::write(&script_path, script).unwrap();
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755)).unwrap();
        let spawn_log = dir.path().join("spawns.log");
        Self {
            dir,
            script: script_path,
            spawn_log,
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn config(&self, invocation: InvocationOptions) -> EmberConfig {
        let mut environment_variables = BTreeMap::new();
        environment_variables.insert(
            "EMBER_SPAWN_LOG".to_string(),
            self.spawn_log.display().to_string(),
        );
        EmberConfig {
            process: ProcessOptions {
                project_path: self.dir.path().to_path_buf(),
                executable_path: Some(self.script.clone()),
                environment_variables,
                ..ProcessOptions::default()
            },
            invocation,
            ..EmberConfig::default()
        }
    }

    /// Number of worker processes started so far.
    pub fn spawns(&self) -> usize {
        self.pids().len()
    }

    /// Pids of the worker processes started so far, oldest first.
    pub fn pids(&self) -> Vec<u32> {
        fs::read_to_string(&self.spawn_log)
            .map(|log| log.lines().filter_map(|l| l.trim().parse().ok()).collect())
            .unwrap_or_default()
    }
}

pub fn invocation(retries: u32, process_retries: u32) -> InvocationOptions {
    InvocationOptions {
        timeout_ms: Some(5_000),
        connection_timeout_ms: 5_000,
        num_retries: retries,
        num_process_retries: process_retries,
        num_connection_retries: 0,
        process_retries_for_script_errors: false,
    }
}

/// Scripted reply for one call.
#[derive(Debug, Clone)]
pub enum Reply {
    Json(Value),
    NotFound,
    Io,
    Callee,
    Hang,
    /// Answer with the value after a delay.
    Slow(Duration, Value),
    /// Fail with an I/O error once every caller holding the barrier arrives.
    FailTogether(Arc<Barrier>),
}

/// One recorded call.
#[derive(Debug, Clone)]
pub struct Call {
    pub endpoint: String,
    pub header: Value,
    pub payload: Option<Vec<u8>>,
}

type Script = dyn Fn(usize) -> Reply + Send + Sync;

/// Transport that records calls and answers from a script keyed by call index.
#[derive(Clone)]
pub struct FakeTransport {
    calls: Arc<Mutex<Vec<Call>>>,
    script: Arc<Script>,
}

impl FakeTransport {
    pub fn new(script: impl Fn(usize) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            script: Arc::new(script),
        }
    }

    pub fn always(reply: Reply) -> Self {
        Self::new(move |_| reply.clone())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Transport for FakeTransport {
    async fn send(
        &self,
        endpoint: &str,
        request: TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        let index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Call {
                endpoint: endpoint.to_string(),
                header: serde_json::from_slice(&request.header).unwrap(),
                payload: request.payload,
            });
            calls.len() - 1
        };

        match (self.script)(index) {
            Reply::Json(value) => Ok(TransportResponse::Success(ResponseBody::json(
                serde_json::to_vec(&value).unwrap(),
            ))),
            Reply::NotFound => Ok(TransportResponse::NotFound),
            Reply::Io => Err(TransportError::Io("connection reset by peer".to_string())),
            Reply::Callee => Err(TransportError::Callee {
                message: "boom".to_string(),
                stack: Some("Error: boom\n    at main (index.js:1:7)".to_string()),
            }),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Err(TransportError::Io("hung".to_string()))
            }
            Reply::Slow(delay, value) => {
                tokio::time::sleep(delay).await;
                Ok(TransportResponse::Success(ResponseBody::json(
                    serde_json::to_vec(&value).unwrap(),
                )))
            }
            Reply::FailTogether(barrier) => {
                barrier.wait().await;
                Err(TransportError::Io("connection reset by peer".to_string()))
            }
        }
    }
}

/// Seekable cursor that counts seeks back to an absolute position.
pub struct CountingCursor {
    inner: Cursor<Vec<u8>>,
    rewinds: Arc<AtomicUsize>,
}

impl CountingCursor {
    pub fn new(bytes: impl Into<Vec<u8>>) -> (Self, Arc<AtomicUsize>) {
        let rewinds = Arc::new(AtomicUsize::new(0));
        let cursor = Self {
            inner: Cursor::new(bytes.into()),
            rewinds: rewinds.clone(),
        };
        (cursor, rewinds)
    }
}

impl AsyncRead for CountingCursor {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncSeek for CountingCursor {
    fn start_seek(mut self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        if matches!(position, SeekFrom::Start(_)) {
            self.rewinds.fetch_add(1, Ordering::SeqCst);
        }
        Pin::new(&mut self.inner).start_seek(position)
    }

    fn poll_complete(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Pin::new(&mut self.inner).poll_complete(cx)
    }
}

/// Whether a process with `pid` is still alive.
pub fn is_alive(pid: u32) -> bool {
    // SAFETY: signal 0 only checks for existence.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// Poll until `pid` is gone; false if it outlives `limit`.
pub async fn exits_within(pid: u32, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while is_alive(pid) {
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    true
}
