//! Background job execution.
//!
//! Deferred plugin invocations run here on a bounded worker pool. Each job
//! walks a forward-only state machine (Pending to Running to one terminal
//! state), reports coalesced monotonic progress through the gateway and
//! honors cooperative cancellation via a `CancellationToken` checked at
//! plugin checkpoints. GPU-bound kinds additionally serialize on a fair
//! async mutex, so at most one such job runs system-wide and waiters are
//! served in arrival order.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::ToolError;
use crate::gateway::EventGateway;
use crate::session::SessionManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    ImageGeneration,
    DocumentAnalysis,
}

impl JobKind {
    /// Whether this kind must hold the exclusive device lock while running.
    pub fn exclusive(&self) -> bool {
        matches!(self, Self::ImageGeneration)
    }
}

pub type JobFuture = Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send>>;

/// Everything the executor needs to run a deferred invocation.
pub struct JobSpec {
    pub kind: JobKind,
    /// Event name prefix, e.g. `image_generation` yields
    /// `image_generation_progress` / `_result` / `_error`.
    pub event_prefix: &'static str,
    /// Document this job holds, released when the job finishes.
    pub document_id: Option<String>,
    /// Keep the completed value as the session's last artifact.
    pub store_artifact: bool,
    pub run: Box<dyn FnOnce(JobContext) -> JobFuture + Send>,
}

/// Handed to the job body. Dropping it ends the progress stream.
pub struct JobContext {
    pub job_id: Uuid,
    pub session_id: Uuid,
    progress: watch::Sender<u8>,
    cancel: CancellationToken,
}

impl JobContext {
    pub fn report_progress(&self, percent: u8) {
        let _ = self.progress.send(percent.min(100));
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancellation checkpoint. Plugins call this between units of work.
    pub fn checkpoint(&self) -> Result<(), ToolError> {
        if self.cancel.is_cancelled() {
            Err(ToolError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Token clone for work moved onto blocking threads.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

struct JobRecord {
    id: Uuid,
    session_id: Uuid,
    call_id: Uuid,
    kind: JobKind,
    event_prefix: &'static str,
    document_id: Option<String>,
    store_artifact: bool,
    status: parking_lot::Mutex<JobStatus>,
    cancel: CancellationToken,
    created_at: Instant,
    finished_at: parking_lot::Mutex<Option<Instant>>,
}

impl JobRecord {
    fn status(&self) -> JobStatus {
        *self.status.lock()
    }

    /// Forward-only transition; anything else is rejected.
    fn transition(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        let mut status = self.status.lock();
        let allowed = matches!(
            (*status, to),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        );
        if allowed {
            *status = to;
        }
        allowed
    }

    fn mark_finished(&self) {
        *self.finished_at.lock() = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub workers: usize,
    /// How long finished jobs stay queryable before the sweep removes them.
    pub retention: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            retention: Duration::from_secs(300),
        }
    }
}

pub struct JobExecutor {
    jobs: DashMap<Uuid, Arc<JobRecord>>,
    gateway: Arc<EventGateway>,
    sessions: Arc<SessionManager>,
    workers: Arc<Semaphore>,
    device_lock: Arc<AsyncMutex<()>>,
    retention: Duration,
}

impl JobExecutor {
    pub fn new(
        gateway: Arc<EventGateway>,
        sessions: Arc<SessionManager>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            jobs: DashMap::new(),
            gateway,
            sessions,
            workers: Arc::new(Semaphore::new(config.workers.max(1))),
            device_lock: Arc::new(AsyncMutex::new(())),
            retention: config.retention,
        }
    }

    pub fn status(&self, job_id: Uuid) -> Option<JobStatus> {
        self.jobs.get(&job_id).map(|r| r.status())
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn running_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|r| r.status() == JobStatus::Running)
            .count()
    }

    /// Start a job under a pre-allocated id. Returns immediately; the body
    /// runs on the worker pool.
    #[instrument(skip(self, spec), fields(kind = ?spec.kind))]
    pub fn submit(self: &Arc<Self>, job_id: Uuid, session_id: Uuid, call_id: Uuid, spec: JobSpec) {
        let record = Arc::new(JobRecord {
            id: job_id,
            session_id,
            call_id,
            kind: spec.kind,
            event_prefix: spec.event_prefix,
            document_id: spec.document_id,
            store_artifact: spec.store_artifact,
            status: parking_lot::Mutex::new(JobStatus::Pending),
            cancel: CancellationToken::new(),
            created_at: Instant::now(),
            finished_at: parking_lot::Mutex::new(None),
        });
        self.jobs.insert(job_id, record.clone());

        let executor = self.clone();
        let run = spec.run;
        tokio::spawn(async move {
            if let Ok(session) = executor.sessions.get(session_id) {
                session.track_job(job_id).await;
            }
            executor.drive(record, run).await;
        });
    }

    /// Request cancellation. Returns false when the job is unknown or has
    /// already finished. The transition and terminal event are performed by
    /// the job's own task.
    pub fn cancel(&self, job_id: Uuid) -> bool {
        match self.jobs.get(&job_id) {
            Some(record) if !record.status().is_terminal() => {
                debug!(job_id = %job_id, "cancellation requested");
                record.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn cancel_all(&self, job_ids: &[Uuid]) {
        for id in job_ids {
            self.cancel(*id);
        }
    }

    async fn drive(
        self: Arc<Self>,
        record: Arc<JobRecord>,
        run: Box<dyn FnOnce(JobContext) -> JobFuture + Send>,
    ) {
        // Exclusive kinds queue here in arrival order; the async mutex is
        // fair, so a second image job waits behind the first. The device
        // lock comes before the worker permit: jobs queued on the device
        // hold no worker slot, so other kinds keep running.
        let _device = if record.kind.exclusive() {
            tokio::select! {
                guard = self.device_lock.clone().lock_owned() => Some(guard),
                _ = record.cancel.cancelled() => {
                    self.finish(&record, Err(ToolError::Cancelled)).await;
                    return;
                }
            }
        } else {
            None
        };

        let _permit = tokio::select! {
            permit = self.workers.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => return,
            },
            _ = record.cancel.cancelled() => {
                self.finish(&record, Err(ToolError::Cancelled)).await;
                return;
            }
        };

        if record.cancel.is_cancelled() {
            self.finish(&record, Err(ToolError::Cancelled)).await;
            return;
        }

        record.transition(JobStatus::Running);
        info!(job_id = %record.id, call_id = %record.call_id, kind = ?record.kind, "job running");

        let (progress_tx, progress_rx) = watch::channel(0u8);
        let relay = self.spawn_progress_relay(&record, progress_rx);

        let ctx = JobContext {
            job_id: record.id,
            session_id: record.session_id,
            progress: progress_tx,
            cancel: record.cancel.clone(),
        };
        let result = run(ctx).await;

        // The context (and with it the progress sender) is gone once the
        // body returns; draining the relay before the terminal event keeps
        // the terminal event last.
        let _ = relay.await;
        drop(_device);
        self.finish(&record, result).await;
    }

    /// Forwards progress to the gateway, coalescing to the latest value and
    /// dropping anything non-increasing.
    fn spawn_progress_relay(
        &self,
        record: &Arc<JobRecord>,
        mut rx: watch::Receiver<u8>,
    ) -> JoinHandle<()> {
        let gateway = self.gateway.clone();
        let session_id = record.session_id;
        let job_id = record.id;
        let event = format!("{}_progress", record.event_prefix);
        tokio::spawn(async move {
            let mut last_sent: i16 = -1;
            while rx.changed().await.is_ok() {
                let value = *rx.borrow_and_update();
                if i16::from(value) <= last_sent {
                    continue;
                }
                last_sent = i16::from(value);
                gateway.try_send(
                    session_id,
                    event.clone(),
                    json!({ "job_id": job_id, "progress": value }),
                );
            }
        })
    }

    /// Terminal handling: a cancelled token wins over any body result, so a
    /// job never reports completion after cancellation was requested.
    async fn finish(&self, record: &Arc<JobRecord>, result: Result<Value, ToolError>) {
        let result = if record.cancel.is_cancelled() {
            Err(ToolError::Cancelled)
        } else {
            result
        };

        let (event, payload, artifact) = match result {
            Ok(value) => {
                record.transition(JobStatus::Completed);
                let artifact = record.store_artifact.then(|| value.clone());
                let mut payload = match value {
                    Value::Object(map) => map,
                    other => {
                        let mut map = serde_json::Map::new();
                        map.insert("value".into(), other);
                        map
                    }
                };
                payload.insert("job_id".into(), json!(record.id));
                (
                    format!("{}_result", record.event_prefix),
                    Value::Object(payload),
                    artifact,
                )
            }
            Err(error) => {
                if matches!(error, ToolError::Cancelled) {
                    record.transition(JobStatus::Cancelled);
                } else {
                    record.transition(JobStatus::Failed);
                    warn!(job_id = %record.id, error = %error, "job failed");
                }
                (
                    format!("{}_error", record.event_prefix),
                    json!({ "job_id": record.id, "error": error.to_payload() }),
                    None,
                )
            }
        };
        record.mark_finished();
        info!(job_id = %record.id, status = record.status().as_str(), "job finished");

        self.sessions
            .finish_job(
                record.session_id,
                record.id,
                record.document_id.as_deref(),
                artifact,
            )
            .await;
        self.gateway.send(record.session_id, event, payload).await;
    }

    /// Periodic sweep: drop finished jobs past the retention window and
    /// cancel jobs whose owning session no longer exists.
    pub fn spawn_expiry(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let executor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                executor.sweep();
            }
        })
    }

    fn sweep(&self) {
        let retention = self.retention;
        let mut orphans = Vec::new();
        self.jobs.retain(|id, record| {
            if record.status().is_terminal() {
                let expired = (*record.finished_at.lock())
                    .map(|t| t.elapsed() >= retention)
                    .unwrap_or(false);
                return !expired;
            }
            if !self.sessions.contains(record.session_id)
                && record.created_at.elapsed() >= retention
            {
                orphans.push(*id);
            }
            true
        });
        for id in orphans {
            debug!(job_id = %id, "cancelling orphaned job");
            self.cancel(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Event;
    use tokio::sync::{mpsc, oneshot};

    fn harness() -> (Arc<JobExecutor>, Arc<EventGateway>, Arc<SessionManager>) {
        let gateway = Arc::new(EventGateway::new());
        let sessions = Arc::new(SessionManager::new());
        let executor = Arc::new(JobExecutor::new(
            gateway.clone(),
            sessions.clone(),
            ExecutorConfig::default(),
        ));
        (executor, gateway, sessions)
    }

    async fn drain_until_terminal(rx: &mut mpsc::Receiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let terminal = event.event.ends_with("_result") || event.event.ends_with("_error");
            events.push(event);
            if terminal {
                break;
            }
        }
        events
    }

    #[test]
    fn status_transitions_are_forward_only() {
        let record = JobRecord {
            id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            call_id: Uuid::new_v4(),
            kind: JobKind::DocumentAnalysis,
            event_prefix: "document_analysis",
            document_id: None,
            store_artifact: false,
            status: parking_lot::Mutex::new(JobStatus::Pending),
            cancel: CancellationToken::new(),
            created_at: Instant::now(),
            finished_at: parking_lot::Mutex::new(None),
        };
        assert!(record.transition(JobStatus::Running));
        assert!(record.transition(JobStatus::Completed));
        assert!(!record.transition(JobStatus::Failed));
        assert!(!record.transition(JobStatus::Running));
        assert_eq!(record.status(), JobStatus::Completed);
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_terminal_event_is_last() {
        let (executor, gateway, sessions) = harness();
        let session = sessions.open();
        let mut rx = gateway.register(session.id);

        let job_id = Uuid::new_v4();
        executor.submit(
            job_id,
            session.id,
            Uuid::new_v4(),
            JobSpec {
                kind: JobKind::ImageGeneration,
                event_prefix: "image_generation",
                document_id: None,
                store_artifact: true,
                run: Box::new(|ctx| {
                    Box::pin(async move {
                        for pct in [0u8, 25, 50, 75, 100] {
                            ctx.checkpoint()?;
                            ctx.report_progress(pct);
                            tokio::task::yield_now().await;
                        }
                        Ok(json!({"image_id": "img-1"}))
                    })
                }),
            },
        );

        let events = drain_until_terminal(&mut rx).await;
        let terminal = events.last().unwrap();
        assert_eq!(terminal.event, "image_generation_result");
        assert_eq!(terminal.payload["image_id"], "img-1");
        assert_eq!(terminal.payload["job_id"], json!(job_id));

        let progress: Vec<u64> = events[..events.len() - 1]
            .iter()
            .map(|e| {
                assert_eq!(e.event, "image_generation_progress");
                e.payload["progress"].as_u64().unwrap()
            })
            .collect();
        assert!(progress.windows(2).all(|w| w[0] < w[1]));

        assert_eq!(executor.status(job_id), Some(JobStatus::Completed));
        assert!(session.clear_last_artifact().await);
    }

    #[tokio::test]
    async fn cancelled_job_never_completes() {
        let (executor, gateway, sessions) = harness();
        let session = sessions.open();
        let mut rx = gateway.register(session.id);

        let (started_tx, started_rx) = oneshot::channel();
        let job_id = Uuid::new_v4();
        executor.submit(
            job_id,
            session.id,
            Uuid::new_v4(),
            JobSpec {
                kind: JobKind::DocumentAnalysis,
                event_prefix: "document_analysis",
                document_id: None,
                store_artifact: false,
                run: Box::new(|ctx| {
                    Box::pin(async move {
                        let _ = started_tx.send(());
                        loop {
                            ctx.checkpoint()?;
                            tokio::time::sleep(Duration::from_millis(5)).await;
                        }
                    })
                }),
            },
        );

        started_rx.await.unwrap();
        assert!(executor.cancel(job_id));

        let events = drain_until_terminal(&mut rx).await;
        let terminal = events.last().unwrap();
        assert_eq!(terminal.event, "document_analysis_error");
        assert_eq!(terminal.payload["error"]["code"], "cancelled");
        assert_eq!(executor.status(job_id), Some(JobStatus::Cancelled));
        assert!(!executor.cancel(job_id));
    }

    #[tokio::test]
    async fn exclusive_jobs_run_one_at_a_time() {
        let (executor, gateway, sessions) = harness();
        let session = sessions.open();
        let _rx = gateway.register(session.id);

        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (running_tx, running_rx) = oneshot::channel::<()>();
        let first = Uuid::new_v4();
        executor.submit(
            first,
            session.id,
            Uuid::new_v4(),
            JobSpec {
                kind: JobKind::ImageGeneration,
                event_prefix: "image_generation",
                document_id: None,
                store_artifact: false,
                run: Box::new(|_ctx| {
                    Box::pin(async move {
                        let _ = running_tx.send(());
                        let _ = release_rx.await;
                        Ok(json!({}))
                    })
                }),
            },
        );
        running_rx.await.unwrap();

        let second = Uuid::new_v4();
        executor.submit(
            second,
            session.id,
            Uuid::new_v4(),
            JobSpec {
                kind: JobKind::ImageGeneration,
                event_prefix: "image_generation",
                document_id: None,
                store_artifact: false,
                run: Box::new(|_ctx| Box::pin(async move { Ok(json!({})) })),
            },
        );

        // The second job queues behind the device lock.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(executor.status(second), Some(JobStatus::Pending));
        assert_eq!(executor.running_count(), 1);

        release_tx.send(()).unwrap();
        for _ in 0..100 {
            if executor.status(second) == Some(JobStatus::Completed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(executor.status(first), Some(JobStatus::Completed));
        assert_eq!(executor.status(second), Some(JobStatus::Completed));
    }

    #[tokio::test]
    async fn queued_exclusive_jobs_do_not_hold_worker_slots() {
        let gateway = Arc::new(EventGateway::new());
        let sessions = Arc::new(SessionManager::new());
        let executor = Arc::new(JobExecutor::new(
            gateway.clone(),
            sessions.clone(),
            ExecutorConfig {
                workers: 2,
                ..ExecutorConfig::default()
            },
        ));
        let session = sessions.open();
        let _rx = gateway.register(session.id);

        let (running_tx, running_rx) = oneshot::channel::<()>();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let blocker = Uuid::new_v4();
        executor.submit(
            blocker,
            session.id,
            Uuid::new_v4(),
            JobSpec {
                kind: JobKind::ImageGeneration,
                event_prefix: "image_generation",
                document_id: None,
                store_artifact: false,
                run: Box::new(|_ctx| {
                    Box::pin(async move {
                        let _ = running_tx.send(());
                        let _ = release_rx.await;
                        Ok(json!({}))
                    })
                }),
            },
        );
        running_rx.await.unwrap();

        // Two more image jobs queue on the device; with only two worker
        // slots they must not occupy the free one while they wait.
        for _ in 0..2 {
            executor.submit(
                Uuid::new_v4(),
                session.id,
                Uuid::new_v4(),
                JobSpec {
                    kind: JobKind::ImageGeneration,
                    event_prefix: "image_generation",
                    document_id: None,
                    store_artifact: false,
                    run: Box::new(|_ctx| Box::pin(async move { Ok(json!({})) })),
                },
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let analysis = Uuid::new_v4();
        executor.submit(
            analysis,
            session.id,
            Uuid::new_v4(),
            JobSpec {
                kind: JobKind::DocumentAnalysis,
                event_prefix: "document_analysis",
                document_id: None,
                store_artifact: false,
                run: Box::new(|_ctx| Box::pin(async move { Ok(json!({})) })),
            },
        );

        // The analysis job finishes while the first image job still runs.
        for _ in 0..200 {
            if executor.status(analysis) == Some(JobStatus::Completed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(executor.status(analysis), Some(JobStatus::Completed));
        assert_eq!(executor.status(blocker), Some(JobStatus::Running));
        release_tx.send(()).unwrap();
    }

    #[tokio::test]
    async fn pending_job_can_be_cancelled_before_it_runs() {
        let (executor, gateway, sessions) = harness();
        let session = sessions.open();
        let mut rx = gateway.register(session.id);

        let (running_tx, running_rx) = oneshot::channel::<()>();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let blocker = Uuid::new_v4();
        executor.submit(
            blocker,
            session.id,
            Uuid::new_v4(),
            JobSpec {
                kind: JobKind::ImageGeneration,
                event_prefix: "image_generation",
                document_id: None,
                store_artifact: false,
                run: Box::new(|_ctx| {
                    Box::pin(async move {
                        let _ = running_tx.send(());
                        let _ = release_rx.await;
                        Ok(json!({}))
                    })
                }),
            },
        );
        running_rx.await.unwrap();

        let queued = Uuid::new_v4();
        executor.submit(
            queued,
            session.id,
            Uuid::new_v4(),
            JobSpec {
                kind: JobKind::ImageGeneration,
                event_prefix: "image_generation",
                document_id: None,
                store_artifact: false,
                run: Box::new(|_ctx| Box::pin(async move { Ok(json!({})) })),
            },
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(executor.cancel(queued));

        let events = drain_until_terminal(&mut rx).await;
        assert_eq!(events.last().unwrap().event, "image_generation_error");
        for _ in 0..100 {
            if executor.status(queued) == Some(JobStatus::Cancelled) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(executor.status(queued), Some(JobStatus::Cancelled));
        release_tx.send(()).unwrap();
    }
}
