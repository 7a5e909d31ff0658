mod container;
mod ipc;
mod output_router;
mod queue;
mod registry;
mod scheduler;
mod util;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use agenthost_core::{
    container::ContainerInput, load_config, AgentHostConfig, PgPool, RegisteredGroup, RouterEvent,
    RuntimeKind, ScheduledTask, TaskRunLog,
};
use anyhow::Context;
use axum::extract::{Path as AxumPath, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use clap::{Parser, Subcommand};
use container::mounts::GroupInfo;
use container::runner::{self, RunConfig};
use container::security;
use futures::stream::{self, Stream};
use queue::{GroupQueue, SubmitOutcome};
use registry::GroupRegistry;
use output_router::OutputRouter;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "agenthostd", version, about = "Multi-group AI-agent host orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the agenthostd HTTP service.
    Serve(ServeArgs),
    /// Print the effective configuration as JSON.
    PrintConfig(PrintConfigArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    #[arg(long, default_value = "config/agenthost.toml")]
    config: PathBuf,
    #[arg(long)]
    bind: Option<String>,
}

#[derive(clap::Args, Debug)]
struct PrintConfigArgs {
    #[arg(long, default_value = "config/agenthost.toml")]
    config: PathBuf,
}

#[derive(Clone)]
struct AppState {
    started_at: Instant,
    config: Arc<AgentHostConfig>,
    registry: Arc<GroupRegistry>,
    store: Arc<PgPool>,
    queue: Arc<GroupQueue>,
    router: Arc<OutputRouter>,
    run_config: Arc<RunConfig>,
    active_chats: Arc<Mutex<HashSet<String>>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve(ServeArgs {
        config: PathBuf::from("config/agenthost.toml"),
        bind: None,
    })) {
        Command::Serve(args) => serve(args).await,
        Command::PrintConfig(args) => print_config(args),
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn print_config(args: PrintConfigArgs) -> anyhow::Result<()> {
    let cfg = load_config(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    println!("{}", serde_json::to_string_pretty(&cfg)?);
    Ok(())
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = load_config(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    let bind = config.server.bind.clone();

    runner::ensure_runtime_available()
        .await
        .context("container runtime health check failed")?;
    runner::cleanup_orphans().await;

    let dsn = config
        .storage
        .postgres_dsn
        .clone()
        .filter(|d| !d.trim().is_empty())
        .context("storage.postgres_dsn is required to start agenthostd")?;
    let store = PgPool::new(dsn);
    store.connect().await.context("failed to connect to Postgres")?;
    info!("postgres persistence layer connected");

    let project_root = std::env::current_dir().context("failed to resolve current working directory")?;
    let groups_dir = project_root.join(&config.storage.groups_dir);
    let data_dir = project_root.join(&config.daemon.data_dir);

    let registry = Arc::new(GroupRegistry::new(Arc::new(store.clone()), groups_dir.clone()));
    let rehydrated = registry.rehydrate().await.context("failed to rehydrate group registry")?;
    info!(count = rehydrated, "registry rehydrated from store (groups and router state)");
    let session_count = store.get_all_sessions().await.context("failed to rehydrate sessions")?.len();
    info!(count = session_count, "sessions rehydrated from store");
    registry
        .ensure_main(&config.daemon.main_group_folder)
        .await
        .context("failed to ensure main group exists")?;

    let queue = Arc::new(GroupQueue::new(Duration::from_millis(config.daemon.idle_timeout_ms)));
    let router = Arc::new(OutputRouter::new());

    let allowlist = security::load_allowlist(&security::default_allowlist_path());
    let run_config = Arc::new(RunConfig {
        project_root: project_root.clone(),
        groups_dir,
        data_dir: data_dir.clone(),
        timezone: config.scheduler.timezone.clone(),
        allowlist,
    });

    let state = AppState {
        started_at: Instant::now(),
        config: Arc::new(config.clone()),
        registry,
        store: Arc::new(store.clone()),
        queue: queue.clone(),
        router: router.clone(),
        run_config,
        active_chats: Arc::new(Mutex::new(HashSet::new())),
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let sched_state = state.clone();
    let sched_config = scheduler::SchedulerConfig {
        poll_interval: Duration::from_millis(state.config.scheduler.poll_interval_ms),
        timezone: state.config.scheduler.timezone.clone(),
    };
    let sched_store = store.clone();
    let sched_shutdown = shutdown_rx.clone();
    let scheduler_handle = tokio::spawn(async move {
        let callback: scheduler::TaskCallback = Box::new(move |due| {
            let state = sched_state.clone();
            tokio::spawn(async move {
                dispatch_scheduled_task(state, due).await;
            });
        });
        scheduler::run_scheduler_loop(sched_config, sched_store, callback, sched_shutdown).await;
    });

    let ipc_config = ipc::MediatorConfig {
        data_dir,
        poll_interval: Duration::from_millis(state.config.daemon.ipc_poll_interval_ms),
        main_group_folder: state.config.daemon.main_group_folder.clone(),
        assistant_name: state.config.daemon.assistant_name.clone(),
        timezone: state.config.scheduler.timezone.clone(),
    };
    let ipc_ctx = ipc::MediatorContext {
        registry: state.registry.clone(),
        store: state.store.clone(),
        router: state.router.clone(),
    };
    let ipc_shutdown = shutdown_rx.clone();
    let ipc_handle = tokio::spawn(async move {
        ipc::run_ipc_loop(ipc_config, ipc_ctx, ipc_shutdown).await;
    });

    let app = Router::new()
        .route("/api/chat", post(post_chat))
        .route("/api/groups", get(get_groups).post(post_groups))
        .route("/api/groups/{folder}/session", delete(delete_session))
        .route("/api/health", get(health))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(middleware::from_fn(cors_middleware))
        .layer(axum::extract::DefaultBodyLimit::max(config.server.max_body_bytes))
        .fallback(fallback)
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind listener on {bind}"))?;
    info!(bind = %bind, "agenthostd listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server exited unexpectedly")?;

    let _ = shutdown_tx.send(true);
    info!("draining group queue");
    queue.shutdown(Duration::from_secs(10)).await;
    let _ = scheduler_handle.await;
    let _ = ipc_handle.await;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

async fn cors_middleware(req: axum::extract::Request, next: Next) -> Response {
    let origin = req
        .headers()
        .get(axum::http::header::ORIGIN)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("*"));

    if req.method() == Method::OPTIONS {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        headers.insert(
            axum::http::header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, DELETE, OPTIONS"),
        );
        headers.insert(
            axum::http::header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type, Authorization"),
        );
        return (StatusCode::NO_CONTENT, headers).into_response();
    }

    let mut response = next.run(req).await;
    response.headers_mut().insert(axum::http::header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    response
}

async fn auth_middleware(State(state): State<AppState>, req: axum::extract::Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS || req.uri().path() == "/api/health" {
        return next.run(req).await;
    }

    if let Some(expected) = &state.config.server.bearer_token {
        if expected.trim().is_empty() {
            return next.run(req).await;
        }
        let header = req
            .headers()
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if header != Some(expected.as_str()) {
            return (StatusCode::UNAUTHORIZED, "invalid or missing bearer token").into_response();
        }
    }

    next.run(req).await
}

async fn fallback() -> StatusCode {
    StatusCode::NOT_FOUND
}

// ---------------------------------------------------------------------------
// HTTP handlers
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ChatRequest {
    prompt: String,
    #[serde(rename = "groupId")]
    group_id: Option<String>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorBody { error: message.into() })).into_response()
}

async fn post_chat(State(state): State<AppState>, Json(req): Json<ChatRequest>) -> Response {
    if req.prompt.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "prompt must not be empty");
    }

    let raw_group = req.group_id.clone().unwrap_or_else(|| state.config.daemon.main_group_folder.clone());
    let folder = match registry::normalize_group_id(&raw_group) {
        Ok(f) => f,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "invalid groupId"),
    };
    let is_main = folder == state.config.daemon.main_group_folder;

    let group = RegisteredGroup {
        jid: folder.clone(),
        name: raw_group,
        folder: folder.clone(),
        trigger: String::new(),
        added_at: util::now_rfc3339(),
        container_config: None,
        runtime: None,
        model: None,
    };
    let group = match state.registry.get_or_register(group).await {
        Ok(g) => g,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    {
        let mut active = state.active_chats.lock().await;
        if active.contains(&folder) {
            return error_response(StatusCode::CONFLICT, "a chat stream is already active for this group");
        }
        active.insert(folder.clone());
    }

    let (token, rx) = state.router.subscribe(&folder).await;
    state.queue.mark_observed(&folder).await;

    let session_id = state.store.get_session(&folder).await.unwrap_or(None);
    let input = ContainerInput {
        prompt: req.prompt,
        session_id,
        chat_jid: folder.clone(),
        folder: folder.clone(),
        is_main,
        env: Default::default(),
    };
    let line = match serde_json::to_string(&input) {
        Ok(l) => l,
        Err(e) => {
            state.router.unsubscribe(&folder, token).await;
            state.active_chats.lock().await.remove(&folder);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };

    let outcome = state.queue.submit(&folder, line).await;
    match outcome {
        SubmitOutcome::Start => {
            let runtime = resolve_runtime(&state, &group);
            spawn_group_runs(state.clone(), folder.clone(), runtime, is_main, input, None);
        }
        SubmitOutcome::Piped | SubmitOutcome::Queued => {}
        SubmitOutcome::Rejected => {
            state.router.unsubscribe(&folder, token).await;
            state.active_chats.lock().await.remove(&folder);
            return error_response(StatusCode::CONFLICT, "group is at capacity");
        }
    }

    let guard = SseGuard {
        router: state.router.clone(),
        active_chats: state.active_chats.clone(),
        folder: folder.clone(),
        token,
    };

    let event_stream = stream::unfold((rx, guard, false), |(mut rx, guard, done_sent)| async move {
        if done_sent {
            return None;
        }
        let event = rx.recv().await?;
        let is_done = matches!(event, RouterEvent::Done { .. });
        Some((Ok::<Event, std::convert::Infallible>(to_sse_event(event)), (rx, guard, is_done)))
    });

    Sse::new(event_stream).keep_alive(KeepAlive::default()).into_response()
}

fn to_sse_event(event: RouterEvent) -> Event {
    match event {
        RouterEvent::Message { text } => Event::default()
            .event("message")
            .json_data(serde_json::json!({ "text": text }))
            .expect("message event is always serializable"),
        RouterEvent::Error { error } => Event::default()
            .event("error")
            .json_data(serde_json::json!({ "error": error }))
            .expect("error event is always serializable"),
        RouterEvent::Done { session_id } => Event::default()
            .event("done")
            .json_data(serde_json::json!({ "sessionId": session_id }))
            .expect("done event is always serializable"),
    }
}

struct SseGuard {
    router: Arc<OutputRouter>,
    active_chats: Arc<Mutex<HashSet<String>>>,
    folder: String,
    token: output_router::SubscriptionToken,
}

impl Drop for SseGuard {
    fn drop(&mut self) {
        let router = self.router.clone();
        let active_chats = self.active_chats.clone();
        let folder = self.folder.clone();
        let token = self.token;
        tokio::spawn(async move {
            router.unsubscribe(&folder, token).await;
            active_chats.lock().await.remove(&folder);
        });
    }
}

#[derive(Serialize)]
struct GroupSummary {
    id: String,
    name: String,
    folder: String,
    added_at: String,
}

async fn get_groups(State(state): State<AppState>) -> Json<Vec<GroupSummary>> {
    let groups = state.registry.list().await;
    Json(
        groups
            .into_iter()
            .map(|g| GroupSummary {
                id: g.jid,
                name: g.name,
                folder: g.folder,
                added_at: g.added_at,
            })
            .collect(),
    )
}

#[derive(Deserialize)]
struct CreateGroupRequest {
    name: String,
    folder: Option<String>,
}

#[derive(Serialize)]
struct CreateGroupResponse {
    id: String,
    name: String,
    folder: String,
}

async fn post_groups(State(state): State<AppState>, Json(req): Json<CreateGroupRequest>) -> Response {
    if req.name.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "name must not be empty");
    }
    let raw_folder = req.folder.clone().unwrap_or_else(|| req.name.clone());
    let folder = match registry::normalize_group_id(&raw_folder) {
        Ok(f) => f,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "invalid folder"),
    };

    let group = RegisteredGroup {
        jid: folder.clone(),
        name: req.name.clone(),
        folder: folder.clone(),
        trigger: String::new(),
        added_at: util::now_rfc3339(),
        container_config: None,
        runtime: None,
        model: None,
    };

    match state.registry.register(group).await {
        Ok(g) => (
            StatusCode::CREATED,
            Json(CreateGroupResponse {
                id: g.jid,
                name: g.name,
                folder: g.folder,
            }),
        )
            .into_response(),
        Err(registry::RegistryError::AlreadyExists(_)) => {
            error_response(StatusCode::CONFLICT, "group already exists")
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Serialize)]
struct StopResponse {
    status: &'static str,
}

async fn delete_session(State(state): State<AppState>, AxumPath(folder): AxumPath<String>) -> Response {
    if state.queue.stop(&folder).await {
        Json(StopResponse { status: "stopped" }).into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// ---------------------------------------------------------------------------
// Container-run orchestration shared by HTTP chat and the scheduler
// ---------------------------------------------------------------------------

fn resolve_runtime(state: &AppState, group: &RegisteredGroup) -> RuntimeKind {
    group
        .runtime
        .as_deref()
        .and_then(RuntimeKind::parse)
        .or_else(|| RuntimeKind::parse(&state.config.runtimes.default_runtime))
        .unwrap_or(RuntimeKind::Claude)
}

/// Spawn the background task that drives a group's container through
/// however many turns its standard input receives before it exits, then
/// keeps spawning fresh containers for whatever the queue hands back from
/// `finish_run` until the group goes idle.
fn spawn_group_runs(
    state: AppState,
    folder: String,
    runtime: RuntimeKind,
    is_main: bool,
    first_input: ContainerInput,
    first_task_id: Option<String>,
) {
    tokio::spawn(async move {
        let mut current = first_input;
        let mut task_id = first_task_id;
        loop {
            run_one_turn(&state, &folder, runtime, is_main, current, task_id.take()).await;

            match state.queue.finish_run(&folder).await {
                Some(next_line) => match serde_json::from_str::<ContainerInput>(&next_line) {
                    Ok(next_input) => current = next_input,
                    Err(e) => {
                        error!(group = %folder, error = %e, "failed to decode pending prompt, dropping it");
                        break;
                    }
                },
                None => break,
            }
        }
    });
}

async fn run_one_turn(
    state: &AppState,
    folder: &str,
    runtime: RuntimeKind,
    is_main: bool,
    input: ContainerInput,
    task_id: Option<String>,
) {
    state.registry.touch(folder).await;
    let tasks_json = build_tasks_snapshot(&state.store, folder, is_main).await;
    let groups_json = build_groups_snapshot(&state.registry, folder, is_main).await;
    runner::write_snapshots(&state.run_config.data_dir, folder, &tasks_json, &groups_json).await;

    let group_meta = state.registry.get(folder).await;
    let container_config = group_meta
        .as_ref()
        .and_then(|g| g.container_config.clone())
        .and_then(|v| serde_json::from_value(v).ok());
    let group_info = GroupInfo {
        folder: folder.to_string(),
        name: group_meta.map(|g| g.name).unwrap_or_else(|| folder.to_string()),
        container_config,
    };

    let started = Instant::now();
    let result = runner::run(&group_info, runtime, is_main, input, &state.run_config, &state.queue, &state.router).await;

    match result {
        Ok(outcome) => {
            if let Some(sid) = &outcome.new_session_id {
                if let Err(e) = state.store.set_session(folder, sid).await {
                    warn!(group = folder, error = %e, "failed to persist session id");
                }
            }
            if let Some(id) = task_id {
                record_task_completion(state, &id, started.elapsed(), outcome.error.as_deref()).await;
            }
        }
        Err(e) => {
            error!(group = folder, error = %e, "container run failed to start");
            state.router.emit(folder, RouterEvent::Error { error: e.to_string() }).await;
            if let Some(id) = task_id {
                record_task_completion(state, &id, started.elapsed(), Some(e.to_string().as_str())).await;
            }
        }
    }
}

async fn record_task_completion(state: &AppState, task_id: &str, duration: Duration, error: Option<&str>) {
    let summary = scheduler::result_summary(None, error);
    if let Err(e) = state.store.record_task_result(task_id, &summary).await {
        warn!(task_id, error = %e, "failed to record task result");
    }
    let log = TaskRunLog {
        task_id: task_id.to_string(),
        run_at: util::now_rfc3339(),
        duration_ms: duration.as_millis() as i64,
        status: if error.is_some() { "error".to_string() } else { "success".to_string() },
        result: if error.is_none() { Some(summary) } else { None },
        error: error.map(|e| e.to_string()),
    };
    if let Err(e) = state.store.log_task_run(&log).await {
        warn!(task_id, error = %e, "failed to log task run");
    }
}

async fn dispatch_scheduled_task(state: AppState, due: scheduler::DueTask) {
    let folder = due.group_folder.clone();
    let group = match state.registry.get(&folder).await {
        Some(g) => g,
        None => {
            warn!(group = folder, task_id = %due.id, "scheduled task targets unregistered group, pausing");
            let update = agenthost_core::TaskUpdate {
                prompt: None,
                schedule_type: None,
                schedule_value: None,
                next_run: None,
                status: Some("paused".to_string()),
            };
            let _ = state.store.update_task(&due.id, &update).await;
            return;
        }
    };

    let is_main = folder == state.config.daemon.main_group_folder;
    let session_id = if due.context_mode == "group" {
        state.store.get_session(&folder).await.unwrap_or(None)
    } else {
        None
    };

    let input = ContainerInput {
        prompt: due.prompt,
        session_id,
        chat_jid: due.target_jid,
        folder: folder.clone(),
        is_main,
        env: Default::default(),
    };
    let line = match serde_json::to_string(&input) {
        Ok(l) => l,
        Err(e) => {
            error!(task_id = %due.id, error = %e, "failed to serialize scheduled task input");
            return;
        }
    };

    match state.queue.submit(&folder, line).await {
        SubmitOutcome::Start => {
            let runtime = resolve_runtime(&state, &group);
            spawn_group_runs(state.clone(), folder, runtime, is_main, input, Some(due.id));
        }
        SubmitOutcome::Piped | SubmitOutcome::Queued => {
            info!(group = folder, task_id = %due.id, "scheduled task prompt enqueued behind live container");
        }
        SubmitOutcome::Rejected => {
            warn!(group = folder, task_id = %due.id, "scheduled task dropped: group at capacity");
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskSnapshotView {
    #[serde(rename = "taskId")]
    id: String,
    group_folder: String,
    #[serde(rename = "chatJid")]
    target_jid: String,
    prompt: String,
    schedule_type: String,
    schedule_value: String,
    context_mode: String,
    next_run: Option<String>,
    status: String,
    created_at: String,
}

impl From<ScheduledTask> for TaskSnapshotView {
    fn from(t: ScheduledTask) -> Self {
        Self {
            id: t.id,
            group_folder: t.group_folder,
            target_jid: t.target_jid,
            prompt: t.prompt,
            schedule_type: t.schedule_type,
            schedule_value: t.schedule_value,
            context_mode: t.context_mode,
            next_run: t.next_run,
            status: t.status,
            created_at: t.created_at,
        }
    }
}

async fn build_tasks_snapshot(store: &PgPool, folder: &str, is_main: bool) -> String {
    let tasks = if is_main {
        store.get_all_tasks().await.unwrap_or_default()
    } else {
        store.get_tasks_for_group(folder).await.unwrap_or_default()
    };
    let views: Vec<TaskSnapshotView> = tasks.into_iter().map(Into::into).collect();
    serde_json::to_string(&views).unwrap_or_else(|_| "[]".to_string())
}

#[derive(Serialize)]
struct GroupSnapshotView {
    id: String,
    name: String,
    #[serde(rename = "lastActivity")]
    last_activity: Option<String>,
    #[serde(rename = "isRegistered")]
    is_registered: bool,
}

async fn build_groups_snapshot(registry: &GroupRegistry, folder: &str, is_main: bool) -> String {
    let groups = registry.list().await;
    let filtered: Vec<RegisteredGroup> = if is_main {
        groups
    } else {
        groups.into_iter().filter(|g| g.folder == folder).collect()
    };

    let mut views = Vec::with_capacity(filtered.len());
    for g in filtered {
        let last_activity = registry.last_activity(&g.folder).await;
        views.push(GroupSnapshotView {
            id: g.jid,
            name: g.name,
            last_activity,
            is_registered: true,
        });
    }
    serde_json::to_string(&views).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_runtime_prefers_group_override() {
        let config = AgentHostConfig::default();
        let state_config = Arc::new(config);
        let group = RegisteredGroup {
            jid: "g".into(),
            name: "g".into(),
            folder: "g".into(),
            trigger: String::new(),
            added_at: String::new(),
            container_config: None,
            runtime: Some("codex".into()),
            model: None,
        };
        let runtime = group
            .runtime
            .as_deref()
            .and_then(RuntimeKind::parse)
            .or_else(|| RuntimeKind::parse(&state_config.runtimes.default_runtime))
            .unwrap_or(RuntimeKind::Claude);
        assert_eq!(runtime, RuntimeKind::Codex);
    }

    #[test]
    fn resolve_runtime_falls_back_to_configured_default() {
        let group = RegisteredGroup {
            jid: "g".into(),
            name: "g".into(),
            folder: "g".into(),
            trigger: String::new(),
            added_at: String::new(),
            container_config: None,
            runtime: None,
            model: None,
        };
        let runtime = group
            .runtime
            .as_deref()
            .and_then(RuntimeKind::parse)
            .or_else(|| RuntimeKind::parse("gemini"))
            .unwrap_or(RuntimeKind::Claude);
        assert_eq!(runtime, RuntimeKind::Gemini);
    }

    #[test]
    fn to_sse_event_maps_event_names() {
        let msg = to_sse_event(RouterEvent::Message { text: "hi".into() });
        assert!(format!("{msg:?}").contains("message"));
        let done = to_sse_event(RouterEvent::Done { session_id: Some("s1".into()) });
        assert!(format!("{done:?}").contains("done"));
    }

    #[test]
    fn group_snapshot_view_uses_camel_case_wire_fields() {
        let view = GroupSnapshotView {
            id: "g".into(),
            name: "Group".into(),
            last_activity: Some("2026-07-28T00:00:00Z".into()),
            is_registered: true,
        };
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["lastActivity"], "2026-07-28T00:00:00Z");
        assert_eq!(json["isRegistered"], true);
        assert!(json.get("last_activity").is_none());
    }

    #[test]
    fn task_snapshot_view_uses_camel_case_wire_fields() {
        let task = ScheduledTask {
            id: "task-1".into(),
            group_folder: "eng".into(),
            target_jid: "eng".into(),
            prompt: "report status".into(),
            schedule_type: "cron".into(),
            schedule_value: "*/5 * * * *".into(),
            context_mode: "isolated".into(),
            next_run: Some("2026-07-28T00:05:00Z".into()),
            last_run: None,
            last_result: None,
            status: "active".into(),
            created_at: "2026-07-28T00:00:00Z".into(),
        };
        let view: TaskSnapshotView = task.into();
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["taskId"], "task-1");
        assert_eq!(json["chatJid"], "eng");
        assert_eq!(json["scheduleType"], "cron");
        assert_eq!(json["scheduleValue"], "*/5 * * * *");
        assert_eq!(json["contextMode"], "isolated");
        assert_eq!(json["nextRun"], "2026-07-28T00:05:00Z");
        assert_eq!(json["createdAt"], "2026-07-28T00:00:00Z");
        assert!(json.get("created_at").is_none());
    }

    #[test]
    fn group_snapshot_view_omits_last_activity_when_untouched() {
        let view = GroupSnapshotView {
            id: "g".into(),
            name: "Group".into(),
            last_activity: None,
            is_registered: true,
        };
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["lastActivity"], serde_json::Value::Null);
    }
}
