use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info_span, warn};
use zimage_core::{
    encode_error, handle_job, ErrorKind, LifecycleState, ProcessLifecycle,
    UNKNOWN_FAILURE_MESSAGE,
};

#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<ProcessLifecycle>,
}

/// A job as delivered by the dispatcher.
#[derive(Deserialize, Debug)]
pub struct JobEnvelope {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "empty_input")]
    pub input: Value,
}

fn empty_input() -> Value {
    Value::Object(Default::default())
}

#[derive(Serialize, Debug)]
struct HealthResponse {
    state: LifecycleState,
    jobs_served: u64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/run", post(run_job_handler))
        .route("/runsync", post(run_job_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn run_job_handler(
    State(state): State<AppState>,
    payload: Result<Json<JobEnvelope>, JsonRejection>,
) -> Response {
    let job = match payload {
        Ok(Json(job)) => job,
        Err(rejection) => {
            warn!("Rejected job body: {}", rejection.body_text());
            let output = encode_error(ErrorKind::InvalidInput, rejection.body_text());
            return (StatusCode::BAD_REQUEST, Json(output)).into_response();
        }
    };

    let lifecycle = state.lifecycle.clone();
    let span = info_span!("job", id = job.id.as_deref().unwrap_or("-"));
    let result = tokio::task::spawn_blocking(move || {
        let _entered = span.enter();
        match lifecycle.engine() {
            Some(engine) => Some(handle_job(engine, &job.input)),
            None => {
                warn!("Job refused, worker is {}", lifecycle.state());
                None
            }
        }
    })
    .await;

    match result {
        Ok(Some(output)) => Json(output).into_response(),
        Ok(None) => {
            let message = format!("Worker is not ready (state: {})", state.lifecycle.state());
            let output = encode_error(ErrorKind::Unknown, message);
            (StatusCode::SERVICE_UNAVAILABLE, Json(output)).into_response()
        }
        Err(e) => {
            error!("Job panicked: {e}");
            Json(encode_error(ErrorKind::Unknown, UNKNOWN_FAILURE_MESSAGE)).into_response()
        }
    }
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let lifecycle = &state.lifecycle;
    let health = HealthResponse {
        state: lifecycle.state(),
        jobs_served: lifecycle.engine().map_or(0, |engine| engine.jobs_served()),
    };
    let status = match health.state {
        LifecycleState::Ready => StatusCode::OK,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(health))
}
