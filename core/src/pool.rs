//! Warm pool, active session map, acquisition/reuse/eviction, background
//! refill, and idle cleanup. `active` and `pool` share one mutex; anything
//! that touches both holds it across the whole step, per the concurrency
//! contract.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::error;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::config::Config;
use crate::downloader::Downloader;
use crate::error::CoreError;
use crate::session::empty_dir;
use crate::session::Session;
use crate::session::RESERVE_ID_PREFIX;
use crate::worker::ProcessWorker;
use crate::worker::Worker;

pub struct FileRequest {
    pub id: String,
    pub url: String,
}

pub struct AcquireRequest {
    pub session_id: Option<String>,
    pub file_urls: Vec<String>,
    pub files: Vec<FileRequest>,
    pub download_timeout: std::time::Duration,
}

pub struct AcquireOutcome {
    pub session: Arc<Session>,
    pub downloaded_files: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: String,
    pub workdir: String,
    pub created_at_secs: u64,
    pub last_activity_secs: u64,
    pub busy: bool,
    pub exec_count: u64,
}

struct ManagerState {
    active: HashMap<String, Arc<Session>>,
    pool: VecDeque<Session>,
}

pub struct SessionManager {
    config: Config,
    downloader: Downloader,
    state: Mutex<ManagerState>,
    started_at: Instant,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
    refill_task: Mutex<Option<JoinHandle<()>>>,
}

async fn spawn_process_worker(workdir: std::path::PathBuf) -> Result<Arc<dyn Worker>, CoreError> {
    let worker = ProcessWorker::spawn(&workdir).await?;
    Ok(Arc::new(worker))
}

impl SessionManager {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config,
            downloader: Downloader::new(),
            state: Mutex::new(ManagerState {
                active: HashMap::new(),
                pool: VecDeque::new(),
            }),
            started_at: Instant::now(),
            cleanup_task: Mutex::new(None),
            refill_task: Mutex::new(None),
        })
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn default_execution_timeout(&self) -> std::time::Duration {
        self.config.default_execution_timeout
    }

    /// Worker output-channel read failure: the session's process is
    /// presumed dead, so it is stopped and dropped from `active` rather
    /// than released back to the pool.
    pub async fn forget_session(&self, id: &str) {
        let removed = self.state.lock().await.active.remove(id);
        if let Some(session) = removed {
            session.stop().await;
        }
    }

    #[cfg(test)]
    pub(crate) fn config_for_test(&self) -> &Config {
        &self.config
    }

    #[cfg(test)]
    pub(crate) async fn insert_active_for_test(&self, id: String, session: Arc<Session>) {
        self.state.lock().await.active.insert(id, session);
    }

    /// Launch the Cleanup Loop and Refill Loop, then synchronously prime
    /// the pool up to `pool_target`.
    pub async fn start(self: &Arc<Self>) {
        let cleanup_self = Arc::clone(self);
        let cleanup_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_self.config.cleanup_interval);
            loop {
                ticker.tick().await;
                cleanup_self.reap_idle().await;
            }
        });
        *self.cleanup_task.lock().await = Some(cleanup_handle);

        let refill_self = Arc::clone(self);
        let refill_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(refill_self.config.pool_refill_interval);
            loop {
                ticker.tick().await;
                refill_self.refill_once().await;
            }
        });
        *self.refill_task.lock().await = Some(refill_handle);

        self.refill_once().await;
    }

    /// Cancel both background tasks, then drain `active` and `pool` in
    /// that order, stopping every session. Best-effort: per-session errors
    /// never prevent the remaining sessions from being stopped.
    pub async fn stop(&self) {
        if let Some(handle) = self.cleanup_task.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.refill_task.lock().await.take() {
            handle.abort();
        }

        let (active, pool) = {
            let mut state = self.state.lock().await;
            (
                std::mem::take(&mut state.active),
                std::mem::take(&mut state.pool),
            )
        };
        for (_, session) in active {
            session.stop().await;
        }
        for session in pool {
            session.stop().await;
        }
    }

    async fn refill_once(&self) {
        let deficit = {
            let state = self.state.lock().await;
            self.config.pool_target.saturating_sub(state.pool.len())
        };
        for _ in 0..deficit {
            match self.create_reserve_session().await {
                Ok(session) => {
                    self.state.lock().await.pool.push_back(session);
                }
                Err(e) => {
                    warn!(error = %e, "pool refill failed, stopping this tick");
                    break;
                }
            }
        }
    }

    async fn create_reserve_session(&self) -> Result<Session, CoreError> {
        let id = format!("{RESERVE_ID_PREFIX}{}", Uuid::new_v4());
        let workdir = self.config.session_workdir(&id);
        tokio::fs::create_dir_all(&workdir).await?;
        Session::start(id, workdir.clone(), spawn_process_worker(workdir)).await
    }

    async fn reap_idle(&self) {
        let idle_ttl = self.config.idle_ttl;
        let to_remove: Vec<String> = {
            let state = self.state.lock().await;
            state
                .active
                .iter()
                .filter(|(_, s)| !s.is_busy() && s.is_idle(idle_ttl))
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in to_remove {
            let removed = self.state.lock().await.active.remove(&id);
            if let Some(session) = removed {
                info!(session_id = %id, "idle cleanup");
                session.stop().await;
            }
        }
    }

    /// Acquire a session per the acquisition protocol: reuse an active
    /// session by id, dispense from the pool, or create fresh.
    pub async fn acquire(&self, request: AcquireRequest) -> Result<AcquireOutcome, CoreError> {
        if let Some(ref id) = request.session_id {
            let existing = self.state.lock().await.active.get(id).cloned();
            if let Some(session) = existing {
                session.touch();
                let (downloaded, errors) =
                    process_file_requests(&session, &self.downloader, &request).await?;
                return Ok(AcquireOutcome {
                    session,
                    downloaded_files: downloaded,
                    errors,
                });
            }
        }
        self.acquire_new(request).await
    }

    async fn acquire_new(&self, request: AcquireRequest) -> Result<AcquireOutcome, CoreError> {
        {
            let state = self.state.lock().await;
            if state.active.len() >= self.config.capacity_max {
                drop(state);
                self.evict_one().await;
            }
        }

        let new_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let new_workdir = self.config.session_workdir(&new_id);

        let pooled = self.state.lock().await.pool.pop_front();
        let session = match pooled {
            Some(mut candidate) => {
                match candidate.rebind(new_id.clone(), new_workdir.clone()).await {
                    Ok(()) => candidate,
                    Err(e) => {
                        warn!(error = %e, "pooled session failed to rebind, destroying it");
                        candidate.stop().await;
                        tokio::fs::create_dir_all(&new_workdir).await?;
                        Session::start(
                            new_id.clone(),
                            new_workdir.clone(),
                            spawn_process_worker(new_workdir.clone()),
                        )
                        .await?
                    }
                }
            }
            None => {
                tokio::fs::create_dir_all(&new_workdir).await?;
                Session::start(
                    new_id.clone(),
                    new_workdir.clone(),
                    spawn_process_worker(new_workdir.clone()),
                )
                .await?
            }
        };

        let session = Arc::new(session);
        let (downloaded, errors) =
            process_file_requests(&session, &self.downloader, &request).await?;

        self.state
            .lock()
            .await
            .active
            .insert(new_id, Arc::clone(&session));

        Ok(AcquireOutcome {
            session,
            downloaded_files: downloaded,
            errors,
        })
    }

    async fn evict_one(&self) {
        let victim_id = {
            let state = self.state.lock().await;
            state
                .active
                .iter()
                .filter(|(_, s)| !s.is_busy())
                .min_by_key(|(_, s)| s.created_at)
                .map(|(id, _)| id.clone())
        };
        let Some(victim_id) = victim_id else {
            return;
        };
        let removed = self.state.lock().await.active.remove(&victim_id);
        if let Some(session) = removed {
            info!(session_id = %victim_id, "evicted under capacity pressure");
            self.release_to_pool_or_stop(session).await;
        }
    }

    /// Terminate a client-visible session: remove it from `active` and
    /// attempt to return it to the pool.
    pub async fn terminate(&self, id: &str) -> Result<(), CoreError> {
        let removed = self.state.lock().await.active.remove(id);
        let session = removed.ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        self.release_to_pool_or_stop(session).await;
        Ok(())
    }

    async fn release_to_pool_or_stop(&self, session: Arc<Session>) {
        let have_room = self.state.lock().await.pool.len() < self.config.pool_target;
        if !have_room {
            session.stop().await;
            return;
        }

        match Arc::try_unwrap(session) {
            Ok(session) => match self.reclaim_for_pool(&session).await {
                Ok(()) => {
                    self.state.lock().await.pool.push_back(session);
                }
                Err(e) => {
                    error!(error = %e, "failed to reclaim session for pool reuse, stopping instead");
                    session.stop().await;
                }
            },
            Err(shared) => {
                warn!("session still referenced elsewhere at release time, stopping instead of pooling");
                shared.stop().await;
            }
        }
    }

    async fn reclaim_for_pool(&self, session: &Session) -> std::io::Result<()> {
        session.reset();
        empty_dir(&session.workdir).await?;
        session.clear_manifest().await
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.state.lock().await.active.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        self.state
            .lock()
            .await
            .active
            .values()
            .map(|s| SessionSummary {
                id: s.id.clone(),
                workdir: s.workdir.display().to_string(),
                created_at_secs: s.created_at.elapsed().as_secs(),
                last_activity_secs: s.last_activity_secs(),
                busy: s.is_busy(),
                exec_count: s.exec_count_snapshot(),
            })
            .collect()
    }

    pub async fn interrupt(&self, id: &str) -> Result<(), CoreError> {
        let session = self
            .get(id)
            .await
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        session.worker.interrupt().await
    }
}

/// Reconcile `session`'s manifest against its workdir, then process the
/// request's `file_urls` (legacy, id-less) and `files` (id-bearing) via
/// the Downloader, updating the manifest for id-bearing downloads. Never
/// returns an error for individual download failures; they accumulate in
/// the returned error-message list instead.
async fn process_file_requests(
    session: &Session,
    downloader: &Downloader,
    request: &AcquireRequest,
) -> Result<(Vec<String>, Vec<String>), CoreError> {
    {
        let mut manifest = session.manifest.lock().await;
        manifest.reconcile(&session.workdir).await?;
    }

    let mut downloaded = Vec::new();
    let mut errors = Vec::new();

    for url in &request.file_urls {
        match downloader
            .fetch(url, &session.workdir, request.download_timeout, false)
            .await
        {
            Ok(filename) => downloaded.push(filename),
            Err(e) => errors.push(e.to_string()),
        }
    }

    for file in &request.files {
        let already_present = {
            let manifest = session.manifest.lock().await;
            manifest.has(&file.id).then(|| manifest.name_of(&file.id).map(str::to_string)).flatten()
        };
        if let Some(filename) = already_present {
            downloaded.push(filename);
            continue;
        }

        match downloader
            .fetch(&file.url, &session.workdir, request.download_timeout, false)
            .await
        {
            Ok(filename) => {
                session
                    .manifest
                    .lock()
                    .await
                    .put(file.id.clone(), filename.clone())
                    .await?;
                downloaded.push(filename);
            }
            Err(e) => errors.push(format!("failed to download file {}: {e}", file.id)),
        }
    }

    Ok((downloaded, errors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::fake::FakeWorker;

    fn test_config(root: &std::path::Path) -> Config {
        let mut cfg = Config::default();
        cfg.workdir_root = root.to_path_buf();
        cfg.pool_target = 0;
        cfg.capacity_max = 2;
        cfg
    }

    async fn fake_session(id: &str, workdir: std::path::PathBuf) -> Session {
        tokio::fs::create_dir_all(&workdir).await.unwrap();
        Session::start(id.to_string(), workdir, async {
            Ok(Arc::new(FakeWorker::scripted(vec![])) as Arc<dyn Worker>)
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn list_reports_only_active_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(test_config(dir.path()));
        let session = fake_session("s1", dir.path().join("s1")).await;
        manager.state.lock().await.active.insert("s1".to_string(), Arc::new(session));

        let summaries = manager.list().await;
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].id, "s1");
        assert!(!summaries[0].busy);
    }

    #[tokio::test]
    async fn terminate_unknown_session_errors() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(test_config(dir.path()));
        let err = manager.terminate("missing").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn terminate_with_no_pool_room_stops_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(test_config(dir.path()));
        let workdir = dir.path().join("s1");
        let session = fake_session("s1", workdir.clone()).await;
        manager
            .state
            .lock()
            .await
            .active
            .insert("s1".to_string(), Arc::new(session));

        manager.terminate("s1").await.unwrap();

        assert!(manager.get("s1").await.is_none());
        assert!(manager.state.lock().await.pool.is_empty());
        assert!(!workdir.exists());
    }
}
