//! The per-call state machine that drives a Session to completion: submits
//! code, pumps Worker Messages into Output Events, enforces the execution
//! timeout by interrupting the Worker, and guarantees the busy/touch
//! epilogue regardless of how the loop terminates.

use std::sync::Arc;
use std::time::Duration;

use sandbox_protocol::translate;
use sandbox_protocol::OutputEvent;
use sandbox_protocol::WorkerMessage;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::error;

use crate::error::CoreError;
use crate::pool::AcquireRequest;
use crate::pool::SessionManager;
use crate::session::Session;

const MESSAGE_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct ExecuteRequest {
    pub code: String,
    pub session_id: Option<String>,
    pub timeout: Option<Duration>,
}

/// Drive one execution to completion, returning a stream of Output Events.
/// Acquisition, the busy/idle poll loop, and the guaranteed epilogue all
/// happen inline; everything downstream just consumes the stream.
pub async fn execute(
    manager: &Arc<SessionManager>,
    request: ExecuteRequest,
) -> Result<impl futures::Stream<Item = OutputEvent>, CoreError> {
    let outcome = manager
        .acquire(AcquireRequest {
            session_id: request.session_id,
            file_urls: Vec::new(),
            files: Vec::new(),
            download_timeout: Duration::from_secs(30),
        })
        .await?;
    let session = outcome.session;

    if !session.try_begin_busy() {
        return Err(CoreError::SessionBusy(session.id.clone()));
    }

    let (tx, rx) = mpsc::channel(256);
    let manager = Arc::clone(manager);
    let timeout = request.timeout.unwrap_or(manager_default_timeout(&manager));
    let code = request.code;

    tokio::spawn(async move {
        run_to_completion(manager, session, code, timeout, tx).await;
    });

    Ok(ReceiverStream::new(rx))
}

fn manager_default_timeout(manager: &SessionManager) -> Duration {
    manager.default_execution_timeout()
}

async fn run_to_completion(
    manager: Arc<SessionManager>,
    session: Arc<Session>,
    code: String,
    timeout: Duration,
    tx: mpsc::Sender<OutputEvent>,
) {
    session.next_exec_count();
    let start = Instant::now();
    let deadline = start + timeout;

    if let Err(e) = session.worker.submit(&code, false).await {
        let _ = tx.send(OutputEvent::error(e.to_string(), vec![])).await;
        session.end_busy();
        session.touch();
        return;
    }

    loop {
        let now = Instant::now();
        if now >= deadline {
            interrupt_and_report(&session, &tx).await;
            break;
        }
        let wait = (deadline - now).min(MESSAGE_POLL_INTERVAL);

        match tokio::time::timeout(wait, session.worker.recv()).await {
            Ok(Some(message)) => {
                if emit(&message, &tx).await.is_err() {
                    // Client disconnected: the worker is still mid-fragment,
                    // so interrupt it before releasing `busy`, or the next
                    // acquire on this session could submit new code that
                    // interleaves with this one.
                    if let Err(e) = session.worker.interrupt().await {
                        error!(session_id = %session.id, error = %e, "interrupt on disconnect failed");
                    }
                    break;
                }
                if is_idle(&message) {
                    break;
                }
                if Instant::now() >= deadline {
                    interrupt_and_report(&session, &tx).await;
                    break;
                }
            }
            Ok(None) => {
                let _ = tx
                    .send(OutputEvent::error("worker channel closed", vec![]))
                    .await;
                manager.forget_session(&session.id).await;
                break;
            }
            Err(_elapsed) => continue,
        }
    }

    session.end_busy();
    session.touch();
}

async fn emit(message: &WorkerMessage, tx: &mpsc::Sender<OutputEvent>) -> Result<(), ()> {
    if let Some(event) = translate(message) {
        tx.send(event).await.map_err(|_| ())?;
    }
    Ok(())
}

fn is_idle(message: &WorkerMessage) -> bool {
    matches!(
        message,
        WorkerMessage::Status(sandbox_protocol::wire::StatusPayload {
            state: sandbox_protocol::wire::ExecutionState::Idle
        })
    )
}

async fn interrupt_and_report(session: &Session, tx: &mpsc::Sender<OutputEvent>) {
    if let Err(e) = session.worker.interrupt().await {
        error!(session_id = %session.id, error = %e, "interrupt failed");
    }
    let _ = tx
        .send(OutputEvent::error("Execution timeout", vec![]))
        .await;
}

/// Aggregate a full Output Event stream into the `/execute_sync` envelope.
pub async fn aggregate(
    mut stream: impl futures::Stream<Item = OutputEvent> + Unpin,
) -> AggregatedOutput {
    use futures::StreamExt;

    let mut out = AggregatedOutput::default();
    while let Some(event) = stream.next().await {
        match event {
            OutputEvent::Text { text } => out.texts.push(text),
            OutputEvent::Image { image, .. } => out.images.push(image),
            OutputEvent::Error { error, traceback } => out.errors.push(AggregatedError { error, traceback }),
        }
    }
    out
}

#[derive(Debug, Default, serde::Serialize)]
pub struct AggregatedOutput {
    pub texts: Vec<String>,
    pub images: Vec<String>,
    pub errors: Vec<AggregatedError>,
}

#[derive(Debug, serde::Serialize)]
pub struct AggregatedError {
    pub error: String,
    pub traceback: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::worker::fake::FakeWorker;
    use crate::worker::Worker;
    use futures::StreamExt;
    use sandbox_protocol::wire::StreamName;
    use sandbox_protocol::wire::StreamPayload;

    fn test_manager(root: &std::path::Path) -> Arc<SessionManager> {
        let mut cfg = Config::default();
        cfg.workdir_root = root.to_path_buf();
        cfg.pool_target = 0;
        SessionManager::new(cfg)
    }

    async fn seed_active_session(
        manager: &Arc<SessionManager>,
        id: &str,
        worker: Arc<dyn Worker>,
    ) {
        let workdir = manager.config_for_test().session_workdir(id);
        tokio::fs::create_dir_all(&workdir).await.unwrap();
        let session = Session::start(id.to_string(), workdir, async { Ok(worker) })
            .await
            .unwrap();
        manager.insert_active_for_test(id.to_string(), Arc::new(session)).await;
    }

    #[tokio::test]
    async fn execute_streams_translated_events_then_completes() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path());
        let worker = Arc::new(FakeWorker::scripted(vec![WorkerMessage::Stream(StreamPayload {
            name: StreamName::Stdout,
            text: "hi\n".into(),
        })])) as Arc<dyn Worker>;
        seed_active_session(&manager, "s1", worker).await;

        let stream = execute(
            &manager,
            ExecuteRequest {
                code: "print('hi')".to_string(),
                session_id: Some("s1".to_string()),
                timeout: Some(Duration::from_secs(5)),
            },
        )
        .await
        .unwrap();

        let events: Vec<_> = stream.collect().await;
        assert_eq!(events, vec![OutputEvent::text("hi\n")]);
    }

    #[tokio::test]
    async fn execute_rejects_reentrant_call_on_busy_session() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path());
        let worker = Arc::new(FakeWorker::silent()) as Arc<dyn Worker>;
        seed_active_session(&manager, "s1", worker).await;

        let session = manager.get("s1").await.unwrap();
        assert!(session.try_begin_busy());

        let err = execute(
            &manager,
            ExecuteRequest {
                code: "1+1".to_string(),
                session_id: Some("s1".to_string()),
                timeout: Some(Duration::from_secs(5)),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::SessionBusy(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn execute_times_out_and_interrupts() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path());
        let worker = Arc::new(FakeWorker::silent());
        seed_active_session(&manager, "s1", worker.clone()).await;

        let stream = execute(
            &manager,
            ExecuteRequest {
                code: "while True: pass".to_string(),
                session_id: Some("s1".to_string()),
                timeout: Some(Duration::from_millis(50)),
            },
        )
        .await
        .unwrap();

        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], OutputEvent::Error { error, .. } if error == "Execution timeout"));
        assert!(worker.interrupted.load(std::sync::atomic::Ordering::SeqCst));
    }
}
