//! The interpreter process abstraction (one per Session) and its two
//! implementations: a real subprocess running the bundled Python driver,
//! and an in-memory fake used by the pool/execution-loop tests.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use sandbox_protocol::WorkerMessage;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::CoreError;

/// The driver script embedded at build time and written out verbatim to
/// spawn each worker subprocess. Kept as a single script rather than a
/// package so the worker has no filesystem footprint beyond its own file.
pub const KERNEL_WORKER_SCRIPT: &str = include_str!("../resources/kernel_worker.py");

#[async_trait]
pub trait Worker: Send + Sync {
    /// Submit one code fragment. Returns immediately; failures surface as
    /// an `error` Worker Message on the iopub channel rather than here.
    async fn submit(&self, code: &str, silent: bool) -> Result<(), CoreError>;

    /// Receive the next Worker Message, or `None` if the channel is closed
    /// (the process exited or `shutdown` was already called).
    async fn recv(&self) -> Option<WorkerMessage>;

    /// Best-effort asynchronous interrupt of the in-flight execution.
    async fn interrupt(&self) -> Result<(), CoreError>;

    /// Terminate the process. Idempotent.
    async fn shutdown(&self) -> Result<(), CoreError>;
}

/// A worker backed by a real `python3` subprocess speaking line-delimited
/// JSON on stdin/stdout.
pub struct ProcessWorker {
    child: Mutex<Child>,
    stdin: Mutex<tokio::process::ChildStdin>,
    iopub_rx: Mutex<mpsc::Receiver<WorkerMessage>>,
}

impl ProcessWorker {
    pub async fn spawn(workdir: &Path) -> Result<Self, CoreError> {
        let mut child = Command::new("python3")
            .arg("-u")
            .arg("-c")
            .arg(KERNEL_WORKER_SCRIPT)
            .current_dir(workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CoreError::WorkerUnavailable(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CoreError::WorkerUnavailable("worker has no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CoreError::WorkerUnavailable("worker has no stdout".to_string()))?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(pump_stdout(stdout, tx));

        Ok(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            iopub_rx: Mutex::new(rx),
        })
    }
}

async fn pump_stdout(stdout: tokio::process::ChildStdout, tx: mpsc::Sender<WorkerMessage>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<WorkerMessage>(&line) {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, line, "worker emitted an unparseable message");
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "worker stdout read failed");
                break;
            }
        }
    }
}

#[async_trait]
impl Worker for ProcessWorker {
    async fn submit(&self, code: &str, silent: bool) -> Result<(), CoreError> {
        let request = serde_json::json!({ "code": code, "silent": silent });
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| CoreError::WorkerUnavailable(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| CoreError::WorkerUnavailable(e.to_string()))
    }

    async fn recv(&self) -> Option<WorkerMessage> {
        self.iopub_rx.lock().await.recv().await
    }

    async fn interrupt(&self) -> Result<(), CoreError> {
        let child = self.child.lock().await;
        if let Some(pid) = child.id() {
            send_sigint(pid as i32);
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), CoreError> {
        let mut child = self.child.lock().await;
        let _ = child.start_kill();
        let _ = child.wait().await;
        Ok(())
    }
}

#[cfg(unix)]
fn send_sigint(pid: i32) {
    // SAFETY: pid came from the child handle we spawned; sending SIGINT to a
    // process we own cannot corrupt memory or other processes' state.
    unsafe {
        libc::kill(pid, libc::SIGINT);
    }
}

#[cfg(not(unix))]
fn send_sigint(_pid: i32) {}
