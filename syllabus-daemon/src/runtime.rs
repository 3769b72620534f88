use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use syllabus_core::config::{self, SyncConfig};
use syllabus_core::paths::{run_dir, socket_path, STAGING_SUFFIX};
use syllabus_core::types::{ConflictPolicy, ContentId};
use syllabus_remote::RemoteClient;
use syllabus_sync::{
    conflict_queue, state_store, CycleReport, CycleStatus, Scheduler, SyncError, Trigger,
};

use crate::error::{io_err, DaemonError};
use crate::protocol::{DaemonRequest, DaemonResponse};

pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

type Reply = oneshot::Sender<Result<SyncSummary, String>>;
type CycleResult = Option<Result<CycleReport, SyncError>>;

struct SyncJob {
    trigger: Trigger,
    respond_to: Option<Reply>,
}

/// Everything the daemon tasks share.
struct Shared {
    root: PathBuf,
    config: SyncConfig,
    remote: Arc<dyn RemoteClient>,
    policy: Option<ConflictPolicy>,
    scheduler: Scheduler,
    started_at: DateTime<Utc>,
}

impl Shared {
    fn new(
        root: PathBuf,
        config: SyncConfig,
        remote: Arc<dyn RemoteClient>,
        policy: Option<ConflictPolicy>,
    ) -> Self {
        Self {
            scheduler: Scheduler::new(root.clone()),
            root,
            config,
            remote,
            policy,
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub trigger: Trigger,
    pub status: CycleStatus,
    pub ops: usize,
    pub converged: usize,
    pub parked: Vec<ContentId>,
    pub committed: bool,
    pub sequence: u64,
    pub retries: u32,
    pub duration_ms: u64,
}

impl SyncSummary {
    fn new(trigger: Trigger, report: &CycleReport) -> Self {
        Self {
            trigger,
            status: report.status(),
            ops: report.ops.len(),
            converged: report.converged.len(),
            parked: report.parked.clone(),
            committed: report.committed,
            sequence: report.sequence,
            retries: report.retries,
            duration_ms: report.duration_ms,
        }
    }
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(root: &Path, policy: Option<ConflictPolicy>) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(root.to_path_buf(), policy))
}

/// Run the daemon for the repository at `root`.
pub async fn run(root: PathBuf, policy: Option<ConflictPolicy>) -> Result<(), DaemonError> {
    let config = config::load_at(&root)?;
    let effective = config.resolve_policy(policy)?;
    let remote: Arc<dyn RemoteClient> = Arc::from(syllabus_remote::connect(&root, &config.remote));
    tracing::info!(
        root = %root.display(),
        backend = remote.backend(),
        policy = %effective,
        interval_secs = ?config.schedule.interval_secs,
        watch = config.schedule.watch,
        "daemon starting"
    );
    let shared = Arc::new(Shared::new(root, config, remote, policy));

    let (sync_tx, sync_rx) = mpsc::channel::<SyncJob>(64);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let ticker_handle = {
        let shutdown = shutdown_tx.clone();
        let shared = shared.clone();
        let sync_tx = sync_tx.clone();
        tokio::spawn(async move {
            let result = interval_task(shared, sync_tx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let watcher_handle = {
        let shutdown = shutdown_tx.clone();
        let shared = shared.clone();
        let sync_tx = sync_tx.clone();
        tokio::spawn(async move {
            let result = watcher_task(shared, sync_tx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let processor_handle = {
        let shutdown = shutdown_tx.clone();
        let shared = shared.clone();
        tokio::spawn(async move {
            let result = sync_processor_task(shared, sync_rx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let shared = shared.clone();
        let sync_tx = sync_tx.clone();
        tokio::spawn(async move {
            let result =
                socket_server_task(shared, sync_tx, shutdown.clone(), shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (ticker_result, watcher_result, processor_result, socket_result, signal_result) = tokio::join!(
        ticker_handle,
        watcher_handle,
        processor_handle,
        socket_handle,
        signal_handle
    );

    handle_join("interval", ticker_result)?;
    handle_join("watcher", watcher_result)?;
    handle_join("sync_processor", processor_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    tracing::info!("daemon stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

async fn interval_task(
    shared: Arc<Shared>,
    sync_tx: mpsc::Sender<SyncJob>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let Some(secs) = shared.config.schedule.interval_secs.filter(|s| *s > 0) else {
        let _ = shutdown_rx.recv().await;
        return Ok(());
    };
    let mut interval = tokio::time::interval(Duration::from_secs(secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => enqueue(&sync_tx, Trigger::Interval).await?,
        }
    }
    Ok(())
}

async fn watcher_task(
    shared: Arc<Shared>,
    sync_tx: mpsc::Sender<SyncJob>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    if !shared.config.schedule.watch {
        let _ = shutdown_rx.recv().await;
        return Ok(());
    }
    let content_root = shared.config.content_root_at(&shared.root);
    if !content_root.exists() {
        fs::create_dir_all(&content_root).map_err(|e| io_err(&content_root, e))?;
    }
    // FSEvents reports real paths (/private/var/... on macOS).
    let content_root = fs::canonicalize(&content_root).unwrap_or(content_root);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;
    watcher.watch(&content_root, RecursiveMode::Recursive)?;
    tracing::debug!(path = %content_root.display(), "watching content tree");

    let mut debounce = Debouncer::new(DEBOUNCE_WINDOW);
    loop {
        let deadline = debounce.deadline();
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                if !is_relevant_event_kind(&event.kind) {
                    continue;
                }
                if event.paths.iter().any(|p| is_content_path(p, &content_root)) {
                    debounce.touch(Instant::now());
                }
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                debounce.clear();
                enqueue(&sync_tx, Trigger::Watch).await?;
            }
        }
    }
    Ok(())
}

/// Trailing-edge debounce: fires once the tree has been quiet for `window`.
#[derive(Debug)]
struct Debouncer {
    window: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
        }
    }

    fn touch(&mut self, now: Instant) {
        self.deadline = Some(now + self.window);
    }

    fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn clear(&mut self) {
        self.deadline = None;
    }
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Whether a change under `content_root` can affect the next cycle.
fn is_content_path(path: &Path, content_root: &Path) -> bool {
    let Ok(rel) = path.strip_prefix(content_root) else {
        return false;
    };
    if path.to_string_lossy().ends_with(STAGING_SUFFIX) {
        return false;
    }
    !rel.components().any(|c| match c {
        Component::Normal(name) => name.to_string_lossy().starts_with('.'),
        _ => false,
    })
}

async fn enqueue(sync_tx: &mpsc::Sender<SyncJob>, trigger: Trigger) -> Result<(), DaemonError> {
    sync_tx
        .send(SyncJob {
            trigger,
            respond_to: None,
        })
        .await
        .map_err(|_| DaemonError::ChannelClosed("sync queue"))
}

async fn enqueue_sync(
    sync_tx: &mpsc::Sender<SyncJob>,
    trigger: Trigger,
) -> Result<SyncSummary, DaemonError> {
    let (tx, rx) = oneshot::channel();
    sync_tx
        .send(SyncJob {
            trigger,
            respond_to: Some(tx),
        })
        .await
        .map_err(|_| DaemonError::ChannelClosed("sync queue"))?;

    let outcome = rx
        .await
        .map_err(|_| DaemonError::ChannelClosed("sync response"))?;
    outcome.map_err(DaemonError::Protocol)
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

/// Runs cycles one at a time. Jobs that arrive while a cycle is in flight
/// fold into a single follow-up cycle whose result answers all of them.
async fn sync_processor_task(
    shared: Arc<Shared>,
    mut sync_rx: mpsc::Receiver<SyncJob>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut in_flight: Option<(Trigger, JoinHandle<CycleResult>)> = None;
    let mut waiting: Vec<Reply> = Vec::new();
    let mut follow_up: Vec<Reply> = Vec::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            maybe_job = sync_rx.recv() => {
                let Some(job) = maybe_job else { break };
                if in_flight.is_some() {
                    shared.scheduler.coalesce(job.trigger);
                    follow_up.extend(job.respond_to);
                } else {
                    waiting.extend(job.respond_to);
                    in_flight = Some((job.trigger, spawn_cycle(&shared, job.trigger)));
                }
            }
            joined = join_cycle(&mut in_flight), if in_flight.is_some() => {
                let trigger = in_flight.take().map(|(t, _)| t).unwrap_or(Trigger::Manual);
                let result = joined
                    .map_err(|err| DaemonError::Protocol(format!("sync task join error: {err}")))?;
                let outcome = match result {
                    Some(Ok(report)) => Ok(SyncSummary::new(trigger, &report)),
                    Some(Err(err)) => Err(err.to_string()),
                    None => Err("cycle already in flight".to_string()),
                };
                for reply in waiting.drain(..) {
                    let _ = reply.send(outcome.clone());
                }
                if let Some(next) = shared.scheduler.take_pending() {
                    tracing::info!(trigger = %next, waiters = follow_up.len(), "running coalesced follow-up cycle");
                    waiting = std::mem::take(&mut follow_up);
                    in_flight = Some((next, spawn_cycle(&shared, next)));
                }
            }
        }
    }

    if let Some((_, handle)) = in_flight {
        shared.scheduler.cancel();
        let _ = handle.await;
    }
    Ok(())
}

fn spawn_cycle(shared: &Arc<Shared>, trigger: Trigger) -> JoinHandle<CycleResult> {
    let shared = shared.clone();
    tokio::task::spawn_blocking(move || {
        shared
            .scheduler
            .run(trigger, &shared.config, shared.remote.as_ref(), shared.policy)
    })
}

async fn join_cycle(
    in_flight: &mut Option<(Trigger, JoinHandle<CycleResult>)>,
) -> Result<CycleResult, tokio::task::JoinError> {
    match in_flight {
        Some((_, handle)) => handle.await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Socket server
// ---------------------------------------------------------------------------

async fn socket_server_task(
    shared: Arc<Shared>,
    sync_tx: mpsc::Sender<SyncJob>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let run = run_dir(&shared.root);
    if !run.exists() {
        fs::create_dir_all(&run).map_err(|e| io_err(&run, e))?;
    }

    let socket = socket_path(&shared.root);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "daemon socket listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let shared = shared.clone();
                let sync_tx = sync_tx.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, shared, sync_tx, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    shared: Arc<Shared>,
    sync_tx: mpsc::Sender<SyncJob>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let response = match request.cmd.as_str() {
            "status" => DaemonResponse::ok(build_status_payload(&shared).await),
            "sync" => {
                let trigger = request.source.unwrap_or(Trigger::Manual);
                match enqueue_sync(&sync_tx, trigger).await {
                    Ok(summary) => DaemonResponse::ok(json!(summary)),
                    Err(err) => DaemonResponse::error(err.to_string()),
                }
            }
            "cancel" => {
                let cancelled = shared.scheduler.cancel();
                DaemonResponse::ok(json!({ "cancelled": cancelled }))
            }
            "stop" => {
                shared.scheduler.cancel();
                let _ = shutdown_tx.send(());
                DaemonResponse::ok(json!({ "stopping": true }))
            }
            other => DaemonResponse::error(format!("unknown command '{other}'")),
        };

        write_response(&mut writer, &response).await?;
        if request.cmd == "stop" {
            break;
        }
    }

    Ok(())
}

async fn build_status_payload(shared: &Shared) -> Value {
    let scheduler = shared.scheduler.status();

    let root = shared.root.clone();
    let stored = tokio::task::spawn_blocking(move || {
        let state = state_store::load_at(&root);
        let queue = conflict_queue::load_at(&root);
        (state, queue)
    })
    .await;
    let (state, parked) = match stored {
        Ok((state, queue)) => (
            state.map_err(|e| tracing::warn!(error = %e, "status: state unreadable")).ok(),
            queue.map(|q| q.len()).unwrap_or(0),
        ),
        Err(_) => (None, 0),
    };

    json!({
        "running": true,
        "root": shared.root.display().to_string(),
        "socket": socket_path(&shared.root).display().to_string(),
        "backend": shared.remote.backend(),
        "started_at": shared.started_at,
        "interval_secs": shared.config.schedule.interval_secs,
        "watch": shared.config.schedule.watch,
        "scheduler": scheduler,
        "state_sequence": state.as_ref().map(|s| s.sequence),
        "last_synced_at": state.as_ref().and_then(|s| s.synced_at),
        "tracked_items": state.as_ref().map(|s| s.len()),
        "parked_conflicts": parked,
    })
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_env("SYLLABUS_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use syllabus_core::config::{HierarchyRule, RemoteConfig, RetrySettings};
    use syllabus_remote::{MemoryRemote, RemoteOp};
    use syllabus_sync::SchedulerState;
    use tempfile::TempDir;
    use tokio::time::advance;

    fn shared_with(remote: Arc<MemoryRemote>) -> (TempDir, Arc<Shared>) {
        let root = TempDir::new().expect("root");
        fs::create_dir_all(root.path().join("content")).expect("content");
        fs::write(root.path().join("content/intro.md"), "# Intro\n").expect("write");
        let mut config = SyncConfig::new(RemoteConfig::Memory, HierarchyRule::PathDepth)
            .with_policy(ConflictPolicy::Manual);
        config.retry = RetrySettings::immediate(2);
        let shared = Shared::new(root.path().to_path_buf(), config, remote, None);
        (root, Arc::new(shared))
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn debounce_fires_once_after_quiet_window() {
        let mut debounce = Debouncer::new(Duration::from_millis(100));
        assert!(debounce.deadline().is_none());

        let start = Instant::now();
        for _ in 0..5 {
            debounce.touch(Instant::now());
            advance(Duration::from_millis(10)).await;
        }
        let deadline = debounce.deadline().expect("armed");
        assert_eq!(deadline, start + Duration::from_millis(40) + Duration::from_millis(100));

        tokio::time::sleep_until(deadline).await;
        debounce.clear();
        assert!(debounce.deadline().is_none());
    }

    #[test]
    fn hidden_and_staging_paths_do_not_trigger() {
        let root = Path::new("/repo/content");
        assert!(is_content_path(&root.join("intro.md"), root));
        assert!(is_content_path(&root.join("units/index.md"), root));
        assert!(!is_content_path(&root.join("intro.md.syllabus.tmp"), root));
        assert!(!is_content_path(&root.join(".git/HEAD"), root));
        assert!(!is_content_path(Path::new("/repo/.syllabus/state.json"), root));
    }

    #[tokio::test]
    async fn status_payload_before_any_cycle() {
        let (_root, shared) = shared_with(Arc::new(MemoryRemote::new()));

        let payload = build_status_payload(&shared).await;

        assert_eq!(payload["running"], json!(true));
        assert_eq!(payload["backend"], json!("memory"));
        assert_eq!(payload["scheduler"]["state"], json!("idle"));
        assert_eq!(payload["scheduler"]["cycles"], json!(0));
        assert_eq!(payload["parked_conflicts"], json!(0));
        assert_eq!(payload["state_sequence"], json!(0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn jobs_during_a_cycle_fold_into_one_follow_up() {
        let remote = Arc::new(MemoryRemote::new());
        remote.set_hook(Arc::new(|op| {
            if op == RemoteOp::List {
                std::thread::sleep(Duration::from_millis(200));
            }
        }));
        let (_root, shared) = shared_with(remote.clone());
        let (sync_tx, sync_rx) = mpsc::channel(8);
        let (shutdown_tx, _) = broadcast::channel(1);
        let processor = tokio::spawn(sync_processor_task(
            shared.clone(),
            sync_rx,
            shutdown_tx.subscribe(),
        ));

        let first = {
            let tx = sync_tx.clone();
            tokio::spawn(async move { enqueue_sync(&tx, Trigger::Manual).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = {
            let tx = sync_tx.clone();
            tokio::spawn(async move { enqueue_sync(&tx, Trigger::Webhook).await })
        };
        let third = {
            let tx = sync_tx.clone();
            tokio::spawn(async move { enqueue_sync(&tx, Trigger::Watch).await })
        };

        let first = first.await.expect("join").expect("first cycle");
        let second = second.await.expect("join").expect("follow-up");
        let third = third.await.expect("join").expect("follow-up");

        assert_eq!(first.trigger, Trigger::Manual);
        assert_eq!(first.ops, 1);
        assert_eq!(second.trigger, Trigger::Webhook);
        assert_eq!(third.trigger, Trigger::Webhook);
        assert_eq!(second.ops, 0);
        assert_eq!(shared.scheduler.status().cycles, 2);
        assert_eq!(shared.scheduler.state(), SchedulerState::Idle);

        let _ = shutdown_tx.send(());
        processor.await.expect("join").expect("processor");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_cycle_is_reported_to_the_waiter() {
        let remote = Arc::new(MemoryRemote::new());
        remote.fail(
            RemoteOp::List,
            syllabus_remote::RemoteError::Permanent("unauthorized".into()),
            1,
        );
        let (_root, shared) = shared_with(remote);
        let (sync_tx, sync_rx) = mpsc::channel(8);
        let (shutdown_tx, _) = broadcast::channel(1);
        let processor = tokio::spawn(sync_processor_task(shared, sync_rx, shutdown_tx.subscribe()));

        let err = enqueue_sync(&sync_tx, Trigger::Manual).await.unwrap_err();
        assert!(matches!(err, DaemonError::Protocol(msg) if msg.contains("unauthorized")));

        let _ = shutdown_tx.send(());
        processor.await.expect("join").expect("processor");
    }
}
