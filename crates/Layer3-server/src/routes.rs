//! HTTP routes
//!
//! Every registered function gets two static routes:
//! - `POST /{name}` launches and returns at once
//! - `POST /{name}/keep-connection` launches and answers with the result
//!
//! Everything else lives under the reserved `/function`, `/task` and
//! `/terminate` prefixes.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use fnjob_foundation::Error;
use fnjob_task::{JobDispatcher, LaunchResult, Rejection};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Fixed API paths, as listed by `GET /`
pub const API_PATHS: &[&str] = &[
    "/function/list/data",
    "/function/list/text",
    "/function/definition/{function_name}",
    "/function/running-count/{function_name}",
    "/task/info/{task_id}",
    "/task/done/{task_id}",
    "/task/result/{task_id}",
    "/task/list/{function_name}",
    "/terminate/function/{function_name}",
    "/terminate/task/{task_id}",
];

/// Shared state of every handler
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<JobDispatcher>,
    /// Polling interval of keep-connection requests
    pub poll_interval: Duration,
}

// ============================================================================
// Errors
// ============================================================================

/// Handler failure, rendered as `{"message": ...}`
#[derive(Debug)]
pub enum ApiError {
    NotFound,
    Unexpected,
    Internal(Error),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError::Internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, "Not Found".to_string()),
            ApiError::Unexpected => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Something Unexpected.".to_string(),
            ),
            ApiError::Internal(e) => {
                warn!("Request failed: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        (status, Json(json!({ "message": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// Router
// ============================================================================

/// Build the router for every function registered in `dispatcher`
pub fn router(dispatcher: Arc<JobDispatcher>, poll_interval: Duration) -> Router {
    let mut router = Router::new()
        .route("/", get(index))
        .route("/function/list/data", get(function_list_data))
        .route("/function/list/text", get(function_list_text))
        .route("/function/definition/{*function_name}", get(function_definition))
        .route("/function/running-count/{*function_name}", get(running_count))
        .route("/task/info/{task_id}", get(task_info))
        .route("/task/done/{task_id}", get(task_done))
        .route("/task/result/{task_id}", get(task_result))
        .route("/task/list/{*function_name}", get(task_list))
        .route("/terminate/function/{*function_name}", post(terminate_function))
        .route("/terminate/task/{task_id}", post(terminate_task));

    for definition in dispatcher.registry().definitions() {
        let name = definition.function_name.clone();
        let blocking_name = name.clone();

        router = router
            .route(
                &definition.async_path(),
                post(move |State(state): State<AppState>, body: Bytes| {
                    let name = name.clone();
                    async move { launch(state, &name, body).await }
                }),
            )
            .route(
                &definition.blocking_path(),
                post(move |State(state): State<AppState>, body: Bytes| {
                    let name = blocking_name.clone();
                    async move { launch_and_wait(state, &name, body).await }
                }),
            );
        debug!("Added: {}", definition.async_path());
    }

    router.with_state(AppState {
        dispatcher,
        poll_interval,
    })
}

// ============================================================================
// Launch
// ============================================================================

/// An unparsable or non-object body counts as no arguments
fn parse_arguments(body: &[u8]) -> Map<String, Value> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

fn rejection_status(result: &LaunchResult) -> StatusCode {
    match result.rejection {
        None => StatusCode::OK,
        Some(Rejection::Validation) => StatusCode::BAD_REQUEST,
        Some(Rejection::OverConcurrency) => StatusCode::TOO_MANY_REQUESTS,
        Some(Rejection::ShuttingDown) => StatusCode::SERVICE_UNAVAILABLE,
        Some(Rejection::UnknownFunction) => StatusCode::NOT_FOUND,
    }
}

async fn launch(state: AppState, function_name: &str, body: Bytes) -> ApiResult<Response> {
    let arguments = parse_arguments(&body);
    let payload = Value::Object(arguments.clone());
    info!("Task requested: /{} payload={}", function_name, payload);

    let result = state.dispatcher.launch(function_name, &arguments).await?;
    Ok((rejection_status(&result), Json(result)).into_response())
}

async fn launch_and_wait(state: AppState, function_name: &str, body: Bytes) -> ApiResult<Response> {
    let arguments = parse_arguments(&body);
    let payload = Value::Object(arguments.clone());
    info!(
        "Task requested: /{}/keep-connection payload={}",
        function_name, payload
    );

    let result = state.dispatcher.launch(function_name, &arguments).await?;
    if !result.accepted {
        return Ok((rejection_status(&result), Json(result)).into_response());
    }

    info!("Start polling: {} task_id={}", function_name, result.task_id);
    let record = state
        .dispatcher
        .wait_for_terminal(&result.task_id, state.poll_interval)
        .await?
        .ok_or(ApiError::Unexpected)?;

    Ok(Json(record.result).into_response())
}

// ============================================================================
// Functions
// ============================================================================

async fn index() -> String {
    let mut text = API_PATHS.join("\n");
    text.push('\n');
    text
}

async fn function_list_data(State(state): State<AppState>) -> Response {
    let definitions: Vec<_> = state.dispatcher.registry().definitions().collect();
    Json(definitions).into_response()
}

async fn function_list_text(State(state): State<AppState>) -> String {
    state.dispatcher.registry().to_text()
}

async fn function_definition(
    State(state): State<AppState>,
    Path(function_name): Path<String>,
) -> ApiResult<Response> {
    let definition = state
        .dispatcher
        .registry()
        .lookup(&function_name)
        .ok_or(ApiError::NotFound)?;
    Ok(Json(definition).into_response())
}

async fn running_count(
    State(state): State<AppState>,
    Path(function_name): Path<String>,
) -> ApiResult<Json<u32>> {
    state
        .dispatcher
        .current_running_count(&function_name)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

// ============================================================================
// Tasks
// ============================================================================

async fn task_info(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Response> {
    let record = state
        .dispatcher
        .get_status(&task_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(record).into_response())
}

async fn task_done(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<bool>> {
    let record = state
        .dispatcher
        .get_status(&task_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(record.is_done()))
}

async fn task_result(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let record = state
        .dispatcher
        .get_status(&task_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(record.result))
}

async fn task_list(
    State(state): State<AppState>,
    Path(function_name): Path<String>,
) -> ApiResult<Response> {
    let records = state.dispatcher.list_by_function(&function_name).await?;
    Ok(Json(records).into_response())
}

// ============================================================================
// Termination
// ============================================================================

async fn terminate_function(
    State(state): State<AppState>,
    Path(function_name): Path<String>,
) -> ApiResult<Json<Value>> {
    state.dispatcher.terminate_function(&function_name).await?;
    Ok(Json(json!({})))
}

async fn terminate_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.dispatcher.terminate_task(&task_id).await?;
    Ok(Json(json!({})))
}
