use std::collections::HashMap;
use std::convert::Infallible;
use std::path::PathBuf;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_stream::wrappers::BroadcastStream;

use super::AppState;
use crate::consolidation::{Consolidation, MergePlan, MergePreview, MergeResult, MergeStrategy, Resolution};
use crate::coordination::{Partition, PartitionStrategy, partition_task};
use crate::bus::{Message, MessagePriority, QueueReport};
use crate::error::{ErrorCode, MusterError};
use crate::monitor::ResourceStats;
use crate::registry::{Worker, WorkerStatus};
use crate::supervisor::{LogLine, SpawnRequest, TermReason};
use crate::vcs::WorktreeInfo;

pub struct ApiError(MusterError);

impl From<MusterError> for ApiError {
    fn from(err: MusterError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.code();
        let status = match code {
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::CapacityExceeded => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::VcsUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "code": code.as_str(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

// ---- Workers ----

#[derive(Debug, Deserialize)]
pub struct WorkerFilter {
    pub status: Option<String>,
    pub project: Option<PathBuf>,
}

pub async fn list_workers(
    State(state): State<AppState>,
    Query(filter): Query<WorkerFilter>,
) -> ApiResult<Vec<Worker>> {
    let registry = state.engine.registry();
    let mut workers = match &filter.status {
        Some(status) => {
            let status = WorkerStatus::parse(status).ok_or_else(|| {
                MusterError::Validation(format!("unknown status {status}"))
            })?;
            registry.by_status(status)
        }
        None => registry.list(),
    };
    if let Some(project) = &filter.project {
        workers.retain(|w| &w.project == project);
    }
    Ok(Json(workers))
}

pub async fn get_worker(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Worker> {
    let worker = state
        .engine
        .registry()
        .get(&id)
        .ok_or_else(|| MusterError::NotFound(format!("worker {id}")))?;
    Ok(Json(worker))
}

fn default_count() -> usize {
    1
}

#[derive(Debug, Deserialize)]
pub struct SpawnBody {
    pub project: PathBuf,
    pub name: String,
    #[serde(default)]
    pub worker_type: Option<String>,
    #[serde(default)]
    pub task: Option<String>,
    pub base_revision: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default = "default_count")]
    pub count: usize,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

pub async fn spawn_workers(
    State(state): State<AppState>,
    Json(body): Json<SpawnBody>,
) -> ApiResult<Vec<Worker>> {
    if body.count < 1 || body.count > 10 {
        return Err(MusterError::Validation("count must be between 1 and 10".into()).into());
    }
    if body.count > 1 && body.branch.is_some() {
        return Err(
            MusterError::Validation("a custom branch requires count = 1".into()).into(),
        );
    }

    let mut created = Vec::new();
    for i in 0..body.count {
        let name = if body.count == 1 {
            body.name.clone()
        } else {
            format!("{}-{}", body.name, i + 1)
        };

        let mut request = SpawnRequest::new(&body.project, name, &body.base_revision);
        request.worker_type = body.worker_type.clone().unwrap_or_else(|| "worker".into());
        request.task = body.task.clone();
        request.branch = body.branch.clone();
        request.command = body.command.clone();
        request.args = body.args.clone();
        request.env = body.env.clone();
        request.metadata = body.metadata.clone();

        match state.engine.supervisor().spawn(request).await {
            Ok(worker) => created.push(worker),
            Err(e) if created.is_empty() => return Err(e.into()),
            Err(e) => {
                tracing::warn!(error = %e, "Partial spawn batch");
                break;
            }
        }
    }
    Ok(Json(created))
}

#[derive(Debug, Deserialize, Default)]
pub struct TerminateBody {
    #[serde(default)]
    pub reason: Option<TermReason>,
}

pub async fn terminate_worker(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<TerminateBody>>,
) -> ApiResult<Value> {
    let reason = body
        .and_then(|b| b.0.reason)
        .unwrap_or(TermReason::UserInitiated);

    match state.engine.supervisor().terminate(&id, reason) {
        Ok(()) => Ok(Json(json!({"terminated": true}))),
        // Idempotent on the wire: a worker that already reached a terminal
        // state is a successful no-op; an unknown id is 404.
        Err(MusterError::NotFound(_)) if state.engine.registry().get(&id).is_some() => {
            Ok(Json(json!({"terminated": false})))
        }
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_log_count")]
    pub count: usize,
}

fn default_log_count() -> usize {
    100
}

pub async fn worker_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Value> {
    let (lines, total): (Vec<LogLine>, usize) =
        state.engine.supervisor().logs(&id, query.offset, query.count)?;
    Ok(Json(json!({"lines": lines, "total": total})))
}

pub async fn worker_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ResourceStats> {
    if state.engine.registry().get(&id).is_none() {
        return Err(MusterError::NotFound(format!("worker {id}")).into());
    }
    let stats = state.engine.monitor().stats(&id).unwrap_or(ResourceStats {
        current_memory_bytes: 0,
        peak_memory_bytes: 0,
        current_cpu_percent: 0.0,
        average_cpu_percent: 0.0,
        uptime_ms: 0,
    });
    Ok(Json(stats))
}

pub async fn send_to_worker(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<Value>,
) -> ApiResult<Value> {
    state.engine.supervisor().send(&id, &payload).await?;
    Ok(Json(json!({"sent": true})))
}

// ---- Messages ----

#[derive(Debug, Deserialize)]
pub struct SendMessageBody {
    pub kind: String,
    #[serde(default)]
    pub source: Option<String>,
    pub target: String,
    #[serde(default)]
    pub worktree: Option<String>,
    pub payload: Value,
    #[serde(default)]
    pub priority: Option<MessagePriority>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

pub async fn send_message(
    State(state): State<AppState>,
    Json(body): Json<SendMessageBody>,
) -> ApiResult<Message> {
    let mut message = Message::new(
        body.kind,
        body.source.unwrap_or_else(|| "orchestrator".into()),
        body.target,
        body.payload,
    );
    if let Some(priority) = body.priority {
        message = message.with_priority(priority);
    }
    if let Some(worktree) = body.worktree {
        message = message.with_worktree(worktree);
    }
    if let Some(timeout_ms) = body.timeout_ms {
        message = message.with_timeout_ms(timeout_ms);
    }

    let queued = state.engine.bus().send(message).await?;
    Ok(Json(queued))
}

#[derive(Debug, Deserialize)]
pub struct BroadcastBody {
    pub kind: String,
    #[serde(default)]
    pub source: Option<String>,
    pub payload: Value,
    #[serde(default)]
    pub worktree: Option<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub priority: Option<MessagePriority>,
}

pub async fn broadcast_message(
    State(state): State<AppState>,
    Json(body): Json<BroadcastBody>,
) -> ApiResult<Vec<Message>> {
    let queued = state
        .engine
        .bus()
        .broadcast(
            &body.kind,
            body.source.as_deref().unwrap_or("orchestrator"),
            body.payload,
            body.worktree.as_deref(),
            &body.exclude,
            body.priority.unwrap_or_default(),
        )
        .await;
    Ok(Json(queued))
}

#[derive(Debug, Deserialize)]
pub struct ReportQuery {
    pub worker: Option<String>,
}

pub async fn queue_report(
    State(state): State<AppState>,
    Query(query): Query<ReportQuery>,
) -> ApiResult<QueueReport> {
    Ok(Json(state.engine.bus().queue_report(query.worker.as_deref())))
}

// ---- Worktrees ----

#[derive(Debug, Deserialize)]
pub struct WorktreeQuery {
    pub project: PathBuf,
}

pub async fn list_worktrees(
    State(state): State<AppState>,
    Query(query): Query<WorktreeQuery>,
) -> ApiResult<Vec<WorktreeInfo>> {
    Ok(Json(state.engine.worker_worktrees(&query.project).await?))
}

pub async fn worktree_diff(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
) -> ApiResult<Value> {
    let worker = state
        .engine
        .registry()
        .get(&worker_id)
        .ok_or_else(|| MusterError::NotFound(format!("worker {worker_id}")))?;
    let diff = state
        .engine
        .vcs()
        .diff_against_base(&worker.worktree_path, &worker.base_revision)
        .await?;
    Ok(Json(json!({"worker": worker_id, "base": worker.base_revision, "diff": diff})))
}

// ---- Consolidations ----

#[derive(Debug, Deserialize)]
pub struct CreateConsolidationBody {
    #[serde(default)]
    pub id: Option<String>,
    pub project: PathBuf,
    pub base_revision: String,
    pub participants: Vec<String>,
    #[serde(default)]
    pub strategy: Option<MergeStrategy>,
}

pub async fn create_consolidation(
    State(state): State<AppState>,
    Json(body): Json<CreateConsolidationBody>,
) -> ApiResult<Consolidation> {
    let consolidation = state
        .engine
        .consolidator()
        .create(
            body.id,
            body.project,
            body.base_revision,
            body.participants,
            body.strategy,
        )
        .await?;
    Ok(Json(consolidation))
}

pub async fn list_consolidations(State(state): State<AppState>) -> ApiResult<Vec<Consolidation>> {
    Ok(Json(state.engine.consolidator().list().await))
}

pub async fn get_consolidation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Consolidation> {
    Ok(Json(state.engine.consolidator().get(&id).await?))
}

pub async fn delete_consolidation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    state.engine.consolidator().delete(&id).await?;
    Ok(Json(json!({"deleted": true})))
}

pub async fn analyze_consolidation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<MergePreview> {
    Ok(Json(state.engine.consolidator().analyze(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct ResolveBody {
    pub resolutions: Vec<Resolution>,
}

pub async fn resolve_consolidation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ResolveBody>,
) -> ApiResult<MergePlan> {
    Ok(Json(
        state
            .engine
            .consolidator()
            .resolve(&id, body.resolutions)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct ExportBody {
    pub target_branch: String,
    #[serde(default)]
    pub message: Option<String>,
}

pub async fn export_consolidation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ExportBody>,
) -> ApiResult<MergeResult> {
    let message = body
        .message
        .unwrap_or_else(|| format!("Consolidated merge {id}"));
    Ok(Json(
        state
            .engine
            .consolidator()
            .export(&id, &body.target_branch, &message)
            .await?,
    ))
}

// ---- Coordination ----

#[derive(Debug, Deserialize)]
pub struct BarrierBody {
    pub id: String,
    pub expected: Vec<String>,
    pub timeout_ms: u64,
}

pub async fn create_barrier(
    State(state): State<AppState>,
    Json(body): Json<BarrierBody>,
) -> ApiResult<Value> {
    // Outcomes surface on the event stream; the handle itself is not held.
    let _handle = state.engine.coordinator().create_barrier(
        &body.id,
        body.expected,
        Duration::from_millis(body.timeout_ms),
    )?;
    Ok(Json(json!({"id": body.id, "created": true})))
}

#[derive(Debug, Deserialize)]
pub struct SignalBody {
    pub worker: String,
}

pub async fn signal_barrier(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SignalBody>,
) -> ApiResult<Value> {
    let arrived = state.engine.coordinator().signal_barrier(&body.worker, &id)?;
    Ok(Json(json!({"id": id, "arrived": arrived})))
}

#[derive(Debug, Deserialize)]
pub struct ElectionBody {
    pub id: String,
    pub candidates: Vec<String>,
    pub timeout_ms: u64,
}

pub async fn conduct_election(
    State(state): State<AppState>,
    Json(body): Json<ElectionBody>,
) -> ApiResult<Value> {
    let _handle = state.engine.coordinator().conduct_election(
        &body.id,
        body.candidates,
        Duration::from_millis(body.timeout_ms),
    )?;
    Ok(Json(json!({"id": body.id, "created": true})))
}

#[derive(Debug, Deserialize)]
pub struct VoteBody {
    pub voter: String,
    pub candidate: String,
}

pub async fn cast_vote(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<VoteBody>,
) -> ApiResult<Value> {
    state
        .engine
        .coordinator()
        .cast_vote(&id, &body.voter, &body.candidate)?;
    Ok(Json(json!({"id": id, "voted": true})))
}

#[derive(Debug, Deserialize)]
pub struct PartitionBody {
    pub task: Value,
    pub agents: usize,
    #[serde(default)]
    pub strategy: Option<String>,
}

pub async fn partition(
    State(_state): State<AppState>,
    Json(body): Json<PartitionBody>,
) -> ApiResult<Vec<Partition>> {
    let strategy = match body.strategy.as_deref() {
        None => PartitionStrategy::RoundRobin,
        Some(name) => PartitionStrategy::parse(name)
            .ok_or_else(|| MusterError::Validation(format!("unknown strategy {name}")))?,
    };
    Ok(Json(partition_task(&body.task, body.agents, strategy)?))
}

// ---- Events ----

pub async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let rx = state.engine.events().subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| async move {
        let event = result.ok()?;
        let data = serde_json::to_string(&event).ok()?;
        Some(Ok(Event::default().event(event.topic()).data(data)))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
