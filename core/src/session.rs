//! A Session wraps a Worker with identity, a working directory, an
//! activity clock, a busy flag, and a monotonic execution counter.
//! Ownership is exclusive: the Manager owns the set of Sessions, a running
//! Execution Loop borrows one for the duration of a single execution.

use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::error;
use tracing::warn;

use crate::error::CoreError;
use crate::manifest::FileManifest;
use crate::worker::Worker;

pub const RESERVE_ID_PREFIX: &str = "reserve_";

/// One interpreter process plus everything the Manager and Execution Loop
/// need to track about it. `busy` is the only field that may be mutated
/// concurrently with reads elsewhere, so it is a standalone atomic rather
/// than living behind the Manager's mutex. `manifest` gets its own lock
/// because an active session may be reused (and its manifest updated)
/// through a shared `Arc<Session>`, not just through an owning `&mut`.
pub struct Session {
    pub id: String,
    pub workdir: PathBuf,
    pub worker: Arc<dyn Worker>,
    pub manifest: Mutex<FileManifest>,
    pub created_at: Instant,
    last_activity_secs: AtomicU64,
    epoch: Instant,
    busy: AtomicBool,
    exec_count: AtomicU64,
}

impl Session {
    /// Construct a session for `id` rooted at `workdir`, starting its
    /// worker and running the one-time priming submission. `workdir` must
    /// already exist.
    pub async fn start(
        id: String,
        workdir: PathBuf,
        spawn_worker: impl std::future::Future<Output = Result<Arc<dyn Worker>, CoreError>>,
    ) -> Result<Self, CoreError> {
        let worker = spawn_worker.await?;
        let manifest = FileManifest::load(&workdir).await;
        let epoch = Instant::now();
        let session = Self {
            id,
            workdir,
            worker,
            manifest: Mutex::new(manifest),
            created_at: epoch,
            last_activity_secs: AtomicU64::new(0),
            epoch,
            busy: AtomicBool::new(false),
            exec_count: AtomicU64::new(0),
        };
        session.prime().await;
        Ok(session)
    }

    async fn prime(&self) {
        const PRIMING_CODE: &str = r#"
import matplotlib
matplotlib.use("Agg")
import matplotlib.pyplot as plt
plt.rcParams["figure.max_open_warning"] = 0
"#;
        if let Err(e) = self.worker.submit(PRIMING_CODE, true).await {
            warn!(session_id = %self.id, error = %e, "priming submission failed");
            return;
        }
        loop {
            match self.worker.recv().await {
                Some(sandbox_protocol::WorkerMessage::Status(p))
                    if p.state == sandbox_protocol::wire::ExecutionState::Idle =>
                {
                    break;
                }
                Some(_) => continue,
                None => {
                    warn!(session_id = %self.id, "worker closed during priming");
                    break;
                }
            }
        }
    }

    /// Stop worker channels, shut down the process, and recursively remove
    /// `workdir`. All three steps are attempted even if an earlier one
    /// fails; errors are logged and aggregated rather than short-circuiting.
    pub async fn stop(&self) {
        if let Err(e) = self.worker.shutdown().await {
            error!(session_id = %self.id, error = %e, "worker shutdown failed");
        }
        if let Err(e) = tokio::fs::remove_dir_all(&self.workdir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                error!(session_id = %self.id, error = %e, workdir = %self.workdir.display(), "failed to remove session workdir");
            }
        }
    }

    pub fn touch(&self) {
        self.last_activity_secs
            .store(self.epoch.elapsed().as_secs(), Ordering::SeqCst);
    }

    pub fn is_idle(&self, ttl: Duration) -> bool {
        let last = self.last_activity_secs.load(Ordering::SeqCst);
        self.epoch.elapsed().as_secs().saturating_sub(last) > ttl.as_secs()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Seconds since `epoch` at the last `touch()`, or 0 if never touched.
    pub fn last_activity_secs(&self) -> u64 {
        self.last_activity_secs.load(Ordering::SeqCst)
    }

    /// CAS-style transition `false -> true`. Returns `false` (and does not
    /// mutate state) if the session was already busy, so the Execution
    /// Loop can refuse reentrant execution on the same session.
    pub fn try_begin_busy(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn end_busy(&self) {
        self.busy.store(false, Ordering::SeqCst);
    }

    pub fn next_exec_count(&self) -> u64 {
        self.exec_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn exec_count_snapshot(&self) -> u64 {
        self.exec_count.load(Ordering::SeqCst)
    }

    /// Rebind a pooled session to a freshly dispensed id and working
    /// directory: submit a silent `chdir` fragment and wait for the
    /// matching `status(idle)` within a short fixed budget. On failure the
    /// caller must destroy the session rather than dispense it.
    pub async fn rebind(&mut self, new_id: String, new_workdir: PathBuf) -> Result<(), CoreError> {
        tokio::fs::create_dir_all(&new_workdir).await?;
        let chdir_code = format!("import os\nos.chdir({:?})\n", new_workdir.display().to_string());

        let submit = self.worker.submit(&chdir_code, true);
        tokio::time::timeout(Duration::from_secs(2), submit)
            .await
            .map_err(|_| CoreError::WorkerUnavailable("chdir submission timed out".to_string()))??;

        let wait_idle = async {
            loop {
                match self.worker.recv().await {
                    Some(sandbox_protocol::WorkerMessage::Status(p))
                        if p.state == sandbox_protocol::wire::ExecutionState::Idle =>
                    {
                        return Ok(());
                    }
                    Some(sandbox_protocol::WorkerMessage::Error(e)) => {
                        return Err(CoreError::WorkerUnavailable(e.evalue));
                    }
                    Some(_) => continue,
                    None => {
                        return Err(CoreError::WorkerUnavailable(
                            "worker closed during rebind".to_string(),
                        ))
                    }
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(2), wait_idle)
            .await
            .map_err(|_| CoreError::WorkerUnavailable("chdir did not complete in time".to_string()))??;

        self.id = new_id;
        self.workdir = new_workdir;
        self.manifest = Mutex::new(FileManifest::load(&self.workdir).await);
        self.reset();
        Ok(())
    }

    /// Clear `exec_count` and `busy`; the manifest is left intact — callers
    /// that want it emptied do so explicitly (see pool release).
    pub fn reset(&self) {
        self.exec_count.store(0, Ordering::SeqCst);
        self.busy.store(false, Ordering::SeqCst);
        self.touch();
    }

    pub fn is_reserve(&self) -> bool {
        self.id.starts_with(RESERVE_ID_PREFIX)
    }

    pub async fn clear_manifest(&self) -> std::io::Result<()> {
        self.manifest.lock().await.clear().await
    }
}

/// Remove every entry in `dir` without removing `dir` itself. Used when
/// returning a session to the pool, where the directory is kept but its
/// contents must not leak into the next client.
pub async fn empty_dir(dir: &Path) -> std::io::Result<()> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let file_type = entry.file_type().await?;
        if file_type.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::fake::FakeWorker;

    async fn started_session(id: &str, workdir: PathBuf) -> Session {
        Session::start(id.to_string(), workdir, async {
            Ok(Arc::new(FakeWorker::scripted(vec![])) as Arc<dyn Worker>)
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn fresh_session_is_not_busy_and_not_idle() {
        let dir = tempfile::tempdir().unwrap();
        let session = started_session("s1", dir.path().to_path_buf()).await;
        assert!(!session.is_busy());
        session.touch();
        assert!(!session.is_idle(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn try_begin_busy_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let session = started_session("s1", dir.path().to_path_buf()).await;
        assert!(session.try_begin_busy());
        assert!(!session.try_begin_busy());
        session.end_busy();
        assert!(session.try_begin_busy());
    }

    #[tokio::test]
    async fn exec_count_is_monotonic_until_reset() {
        let dir = tempfile::tempdir().unwrap();
        let session = started_session("s1", dir.path().to_path_buf()).await;
        assert_eq!(session.next_exec_count(), 1);
        assert_eq!(session.next_exec_count(), 2);
        session.reset();
        assert_eq!(session.next_exec_count(), 1);
    }

    #[tokio::test]
    async fn reserve_id_is_recognized() {
        let dir = tempfile::tempdir().unwrap();
        let session = started_session("reserve_abc", dir.path().to_path_buf()).await;
        assert!(session.is_reserve());
    }

    #[tokio::test]
    async fn stop_removes_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = dir.path().join("sess");
        tokio::fs::create_dir_all(&workdir).await.unwrap();
        let session = started_session("s1", workdir.clone()).await;
        session.stop().await;
        assert!(!workdir.exists());
    }

    #[tokio::test]
    async fn empty_dir_keeps_directory_but_clears_contents() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.txt"), b"x").await.unwrap();
        tokio::fs::create_dir(dir.path().join("sub")).await.unwrap();

        empty_dir(dir.path()).await.unwrap();

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }
}
