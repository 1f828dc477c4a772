//! HTTP API and WebSocket surface.
//!
//! Every response carries `X-Request-ID`; handlers run under a 30 s
//! timeout and a panic-recovery boundary that converts panics into
//! `internal` errors.

use crate::admin::{AdminAuth, ConfigStore, Flags};
use crate::admission::AdmissionPipeline;
use crate::breaker::BreakerRegistry;
use crate::diff;
use crate::health::HealthChecker;
use crate::hub::Hub;
use crate::metrics::{Metrics, METRICS};
use axum::{
    body::{Body, Bytes},
    extract::{
        ws::{Message, WebSocket},
        Path as AxPath, Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, HeaderValue, Request, Response, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response as AxResponse},
    routing::{get, post},
    Json, Router,
};
use beacon_db::{ExecutionRepo, ExecutionRow, JobRepo};
use beacon_protocol::http_types::{
    CrossRegionResults, ErrorResponse, ExecutionView, HealthState, JobDetail, JobSummary,
    ListExecutionsResponse, ListJobsResponse, RegionOutcome, SubmitJobResponse,
    TransparencyRootResponse,
};
use beacon_protocol::{ApiError, JobStatus};
use beacon_transparency::TransparencyLog;
use serde::Deserialize;
use serde_json::{json, Value};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, Instrument};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub admission: Arc<AdmissionPipeline>,
    pub jobs: Arc<JobRepo>,
    pub executions: Arc<ExecutionRepo>,
    pub log: Arc<TransparencyLog>,
    pub hub: Arc<Hub>,
    pub health: Arc<HealthChecker>,
    pub breakers: Arc<BreakerRegistry>,
    pub config_store: Arc<ConfigStore>,
    pub flags: Arc<Flags>,
    pub auth: Arc<AdminAuth>,
}

/// Build the full router.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/jobs", post(submit_job).get(list_jobs))
        .route("/jobs/cross-region", post(submit_job))
        .route("/jobs/{id}", get(get_job))
        .route("/executions", get(list_executions))
        .route("/executions/{id}/cross-region", get(cross_region_results))
        .route("/executions/{id}/diff-analysis", get(diff_analysis))
        .route("/transparency/root", get(transparency_root))
        .route("/transparency/proof", get(transparency_proof))
        .route("/metrics", get(metrics_handler));

    let router = Router::new()
        .nest("/api/v1", api)
        .route("/health", get(health_live))
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(ws_upgrade))
        .route("/admin/config", get(get_admin_config).put(put_admin_config))
        .route("/admin/flags", get(get_admin_flags).put(put_admin_flags))
        .with_state(state);
    with_middleware(router)
}

/// Layers are nested last-added-outermost. `request_context` must end up
/// outermost: panics and timeouts recover inside it, so even those
/// responses get stamped with `X-Request-ID`, and the request span it
/// opens puts the id on every log line, the panic report included.
fn with_middleware(router: Router) -> Router {
    router
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TimeoutLayer::new(Duration::from_secs(
            beacon_protocol::defaults::REQUEST_TIMEOUT_SECS,
        )))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(request_context))
}

/// Wrap `ApiError` for axum responses.
struct Rejection(ApiError);

impl IntoResponse for Rejection {
    fn into_response(self) -> AxResponse {
        let status =
            StatusCode::from_u16(self.0.kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(ErrorResponse { error: self.0 })).into_response()
    }
}

impl From<ApiError> for Rejection {
    fn from(error: ApiError) -> Self {
        Self(error)
    }
}

impl From<beacon_db::DbError> for Rejection {
    fn from(error: beacon_db::DbError) -> Self {
        Self(ApiError::new(
            beacon_protocol::ErrorKind::Database,
            error.to_string(),
        ))
    }
}

async fn request_context(req: Request<Body>, next: Next) -> AxResponse {
    Metrics::inc(&METRICS.http_requests);
    let request_id = Uuid::new_v4().to_string();
    let span = tracing::info_span!("request", request_id = %request_id);
    let mut response = next.run(req).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response<Body> {
    let detail = err
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| err.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic".to_string());
    // Fires inside the request span, so the line carries the request id.
    error!(%detail, "Handler panicked");

    let body = serde_json::to_string(&ErrorResponse {
        error: ApiError::internal(
            "internal error, correlate logs via the X-Request-ID header",
        ),
    })
    .unwrap_or_else(|_| r#"{"error":{"type":"internal","message":"internal error"}}"#.to_string());

    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

// ---------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------

async fn submit_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, Rejection> {
    let ip = client_ip(&headers);
    let id = state.admission.admit(&body, &ip).await?;
    Ok((StatusCode::ACCEPTED, Json(SubmitJobResponse { id })))
}

async fn list_jobs(State(state): State<AppState>) -> Result<Json<ListJobsResponse>, Rejection> {
    let rows = state.jobs.list_recent(50).await?;
    let jobs = rows
        .into_iter()
        .map(|row| JobSummary {
            status: row.status().unwrap_or(JobStatus::Queued),
            id: row.jobspec_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
        .collect();
    Ok(Json(ListJobsResponse { jobs }))
}

#[derive(Debug, Deserialize)]
struct JobQuery {
    include: Option<String>,
}

async fn get_job(
    State(state): State<AppState>,
    AxPath(id): AxPath<String>,
    Query(query): Query<JobQuery>,
) -> Result<Json<JobDetail>, Rejection> {
    let row = state
        .jobs
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("job {id} not found")))?;

    let executions = if query.include.as_deref() == Some("executions") {
        let rows = state.executions.list_for_job(&id).await?;
        Some(rows.into_iter().map(execution_view).collect())
    } else {
        None
    };

    Ok(Json(JobDetail {
        status: row.status().unwrap_or(JobStatus::Queued),
        spec: row.spec_value().unwrap_or(Value::Null),
        id: row.jobspec_id,
        created_at: row.created_at,
        updated_at: row.updated_at,
        executions,
    }))
}

// ---------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PageQuery {
    page: Option<u32>,
    per_page: Option<u32>,
}

async fn list_executions(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<ListExecutionsResponse>, Rejection> {
    let page = query.page.unwrap_or(1).max(1);
    let per_page = query.per_page.unwrap_or(50).clamp(1, 200);
    let rows = state.executions.list_page(page, per_page).await?;
    Ok(Json(ListExecutionsResponse {
        executions: rows.into_iter().map(execution_view).collect(),
        page,
        per_page,
    }))
}

/// `:id` accepts a job id, or an execution id which resolves to its job.
async fn resolve_job_rows(
    state: &AppState,
    id: &str,
) -> Result<(String, Vec<ExecutionRow>), Rejection> {
    let rows = state.executions.list_for_job(id).await?;
    if !rows.is_empty() {
        return Ok((id.to_string(), rows));
    }

    if let Ok(execution_id) = id.parse::<i64>() {
        if let Some(execution) = state.executions.get(execution_id).await? {
            let job_id = execution.job_id.clone();
            let rows = state.executions.list_for_job(&job_id).await?;
            return Ok((job_id, rows));
        }
    }

    Err(ApiError::not_found(format!("no executions for {id}")).into())
}

async fn cross_region_results(
    State(state): State<AppState>,
    AxPath(id): AxPath<String>,
) -> Result<Json<CrossRegionResults>, Rejection> {
    let (job_id, rows) = resolve_job_rows(&state, &id).await?;

    let mut regions: BTreeMap<String, Vec<ExecutionRow>> = BTreeMap::new();
    for row in rows {
        regions.entry(row.region.clone()).or_default().push(row);
    }

    let regions = regions
        .into_iter()
        .map(|(region, rows)| {
            let completed = rows
                .iter()
                .filter(|r| r.status() == Some(beacon_protocol::ExecutionStatus::Completed))
                .count();
            let failed = rows.len() - completed;
            RegionOutcome {
                region,
                completed,
                failed,
                executions: rows.into_iter().map(execution_view).collect(),
            }
        })
        .collect();

    Ok(Json(CrossRegionResults { job_id, regions }))
}

async fn diff_analysis(
    State(state): State<AppState>,
    AxPath(id): AxPath<String>,
) -> Result<Json<beacon_protocol::http_types::DiffAnalysis>, Rejection> {
    let (job_id, rows) = resolve_job_rows(&state, &id).await?;
    Ok(Json(diff::analyze(&job_id, &rows)))
}

fn execution_view(row: ExecutionRow) -> ExecutionView {
    ExecutionView {
        id: row.id,
        status: row
            .status()
            .unwrap_or(beacon_protocol::ExecutionStatus::Created),
        question_id: row.question_id_opt().map(str::to_string),
        output: row.output_value(),
        receipt: row.receipt_value(),
        job_id: row.job_id,
        provider_id: row.provider_id,
        region: row.region,
        model_id: row.model_id,
        started_at: row.started_at,
        completed_at: row.completed_at,
        region_claimed: row.region_claimed,
        region_observed: row.region_observed,
        region_verified: row.region_verified,
        verification_method: row.verification_method,
        evidence_ref: row.evidence_ref,
    }
}

// ---------------------------------------------------------------------
// Transparency
// ---------------------------------------------------------------------

async fn transparency_root(
    State(state): State<AppState>,
) -> Result<Json<TransparencyRootResponse>, Rejection> {
    let (root, size) = state.log.root_info().await;
    Ok(Json(TransparencyRootResponse { root, size }))
}

#[derive(Debug, Deserialize)]
struct ProofQuery {
    index: Option<u64>,
    execution_id: Option<i64>,
    ipfs_cid: Option<String>,
}

async fn transparency_proof(
    State(state): State<AppState>,
    Query(query): Query<ProofQuery>,
) -> Result<Json<beacon_protocol::http_types::ProofResponse>, Rejection> {
    let index = if let Some(index) = query.index {
        index
    } else if let Some(execution_id) = query.execution_id {
        state
            .log
            .repo()
            .get_by_execution(execution_id)
            .await?
            .ok_or_else(|| ApiError::not_found("no log entry for that execution"))?
            .log_index as u64
    } else if let Some(cid) = &query.ipfs_cid {
        state
            .log
            .repo()
            .get_by_cid(cid)
            .await?
            .ok_or_else(|| ApiError::not_found("no log entry for that CID"))?
            .log_index as u64
    } else {
        return Err(ApiError::validation(
            "one of index, execution_id, or ipfs_cid is required",
        )
        .into());
    };

    let proof = state
        .log
        .proof_at(index)
        .await
        .ok_or_else(|| ApiError::not_found(format!("log index {index} out of range")))?;
    Ok(Json(proof))
}

// ---------------------------------------------------------------------
// Health & metrics
// ---------------------------------------------------------------------

async fn health_live() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn health_ready(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.health.readiness().await;
    let status = match report.status {
        HealthState::Down => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (status, Json(report))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = METRICS.prometheus_format(&state.breakers.prometheus_series());
    (
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

// ---------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------

async fn ws_upgrade(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> AxResponse {
    upgrade.on_upgrade(move |socket| ws_client(state.hub.clone(), socket))
}

async fn ws_client(hub: Arc<Hub>, mut socket: WebSocket) {
    let (id, mut rx) = hub.subscribe();
    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(message) = outbound else { break };
                if socket.send(Message::Text(message.into())).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => {
                // Drain pings and detect disconnects; client text is ignored.
                match inbound {
                    Some(Ok(_)) => {}
                    _ => break,
                }
            }
        }
    }
    hub.unsubscribe(id);
}

// ---------------------------------------------------------------------
// Admin
// ---------------------------------------------------------------------

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn require_read(state: &AppState, headers: &HeaderMap) -> Result<(), Rejection> {
    if state.auth.role_for(bearer_token(headers)).can_read_admin() {
        Ok(())
    } else {
        Err(ApiError::auth("admin or operator token required").into())
    }
}

fn require_write(state: &AppState, headers: &HeaderMap) -> Result<(), Rejection> {
    if state.auth.role_for(bearer_token(headers)).can_write_admin() {
        Ok(())
    } else {
        Err(ApiError::auth("admin token required").into())
    }
}

async fn get_admin_config(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<crate::admin::AdminConfig>, Rejection> {
    require_read(&state, &headers)?;
    Ok(Json(state.config_store.snapshot()))
}

async fn put_admin_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(update): Json<Value>,
) -> Result<Json<crate::admin::AdminConfig>, Rejection> {
    require_write(&state, &headers)?;
    let updated = state
        .config_store
        .apply(&update)
        .map_err(ApiError::validation)?;
    Ok(Json(updated))
}

async fn get_admin_flags(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, Rejection> {
    require_read(&state, &headers)?;
    Ok(Json(state.flags.snapshot()))
}

async fn put_admin_flags(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(update): Json<Value>,
) -> Result<Json<Value>, Rejection> {
    require_write(&state, &headers)?;
    state.flags.apply(&update);
    Ok(Json(state.flags.snapshot()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use std::io;
    use std::sync::Mutex;
    use tower::ServiceExt;

    /// Captures log output so tests can assert on it.
    #[derive(Clone, Default)]
    struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

    impl CaptureWriter {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl io::Write for CaptureWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CaptureWriter {
        type Writer = CaptureWriter;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test]
    async fn panic_response_is_internal_and_carries_request_id() {
        let logs = CaptureWriter::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let router = with_middleware(Router::new().route(
            "/boom",
            get(|| async {
                panic!("executor state poisoned");
                #[allow(unreachable_code)]
                ()
            }),
        ));

        let response = router
            .oneshot(Request::builder().uri("/boom").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let request_id = response
            .headers()
            .get("x-request-id")
            .expect("panic responses carry X-Request-ID")
            .to_str()
            .unwrap()
            .to_string();

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["type"], "internal");

        // The panic log line carries the same id via the request span.
        let captured = logs.contents();
        assert!(captured.contains("Handler panicked"));
        assert!(captured.contains(&request_id));
    }

    #[tokio::test]
    async fn plain_responses_carry_request_id_too() {
        let router =
            with_middleware(Router::new().route("/ping", get(|| async { "pong" })));
        let response = router
            .oneshot(Request::builder().uri("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-request-id").is_some());
    }
}
