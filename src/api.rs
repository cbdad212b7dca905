use crate::aggregator::ObjectCreatedEvent;
use crate::allocator::GroupIdAllocator;
use crate::config::{ApiConfig, Config};
use crate::error::PipelineError;
use crate::group_store::{GroupStatus, GroupStore};
use crate::object_store::ObjectStore;
use crate::pipeline::MergePipeline;
use crate::retry::RetryPolicy;
use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub allocator: Arc<GroupIdAllocator>,
    pub groups: Arc<dyn GroupStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub pipeline: Arc<MergePipeline>,
    /// Bucket receiving client uploads
    pub valid_bucket: String,
    /// Bucket holding merged outputs
    pub output_bucket: String,
    pub presigned_url_expiry: Duration,
    pub upload_url_expiry: Duration,
    pub allowed_upload_extensions: Vec<String>,
    /// Bounded wait-and-retry before answering "still processing"
    pub poll_retry: RetryPolicy,
}

#[derive(Debug, Serialize)]
struct GroupResponse {
    #[serde(rename = "groupId")]
    group_id: String,
}

#[derive(Debug, Serialize)]
struct ErrorMessage {
    #[serde(rename = "errorMessage")]
    error_message: String,
}

#[derive(Debug, Serialize)]
struct StillProcessing {
    message: String,
}

#[derive(Debug, Serialize)]
struct DownloadUrlResponse {
    presigned_url: String,
}

#[derive(Debug, Serialize)]
struct UploadUrlResponse {
    #[serde(rename = "uploadUrl")]
    upload_url: String,
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorMessage {
            error_message: message.into(),
        }),
    )
        .into_response()
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/groups", post(create_group))
        .route("/api/v1/status", get(poll_status))
        .route("/api/v1/upload-url", get(upload_url))
        .route("/api/v1/events", post(object_created))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "merge-service"
    }))
}

/// Allocate a fresh group id
#[instrument(skip(state))]
async fn create_group(State(state): State<AppState>) -> Response {
    match state.allocator.allocate().await {
        Ok(group_id) => (StatusCode::OK, Json(GroupResponse { group_id })).into_response(),
        Err(e) => {
            error!(error = %e, "Group id allocation failed");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Could not generate a unique groupId after multiple attempts.",
            )
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    #[serde(rename = "groupId")]
    group_id: Option<String>,
}

/// Poll the merge status of a group.
///
/// PENDING/IN_PROGRESS → bounded wait, then 202. SUCCESS → 200 with a
/// short-lived download URL. FAILED → 400. Unknown group → 404.
#[instrument(skip(state))]
async fn poll_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Response {
    let Some(group_id) = query.group_id.filter(|id| !id.is_empty()) else {
        return json_error(
            StatusCode::BAD_REQUEST,
            "Missing \"groupId\" query parameter",
        );
    };

    let mut attempts = 0;
    loop {
        attempts += 1;

        let record = match state.groups.get(&group_id).await {
            Ok(record) => record,
            Err(e) => {
                error!(group_id = %group_id, error = %e, "Status lookup failed");
                return json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
            }
        };

        let Some(record) = record else {
            return json_error(StatusCode::NOT_FOUND, format!("Unknown groupId {group_id}"));
        };

        match record.status {
            GroupStatus::Success => {
                let output_key = format!("{group_id}/merged_output.pdf");
                return match state
                    .objects
                    .presign_get(&state.output_bucket, &output_key, state.presigned_url_expiry)
                    .await
                {
                    Ok(presigned_url) => {
                        (StatusCode::OK, Json(DownloadUrlResponse { presigned_url }))
                            .into_response()
                    }
                    Err(e) => {
                        error!(group_id = %group_id, error = %e, "Presigning download URL failed");
                        json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
                    }
                };
            }
            GroupStatus::Failed => {
                return json_error(
                    StatusCode::BAD_REQUEST,
                    format!("Merge failed for groupId {group_id}"),
                );
            }
            GroupStatus::Pending | GroupStatus::InProgress => {
                if attempts >= state.poll_retry.max_attempts() {
                    return (
                        StatusCode::ACCEPTED,
                        Json(StillProcessing {
                            message: "Files are still being processed".to_string(),
                        }),
                    )
                        .into_response();
                }
                state.poll_retry.wait().await;
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct UploadUrlQuery {
    filename: Option<String>,
    /// Group id the upload belongs to
    tag: Option<String>,
}

/// Issue a time-limited upload URL for one input file
#[instrument(skip(state))]
async fn upload_url(
    State(state): State<AppState>,
    Query(query): Query<UploadUrlQuery>,
) -> Response {
    let (Some(filename), Some(tag)) = (
        query.filename.filter(|f| !f.is_empty()),
        query.tag.filter(|t| !t.is_empty()),
    ) else {
        return json_error(
            StatusCode::BAD_REQUEST,
            "Missing \"filename\" or \"tag\" query parameter",
        );
    };

    let lowered = filename.to_lowercase();
    if !state
        .allowed_upload_extensions
        .iter()
        .any(|ext| lowered.ends_with(ext.as_str()))
    {
        return json_error(
            StatusCode::BAD_REQUEST,
            format!(
                "Only {} files are allowed",
                state.allowed_upload_extensions.join(", ")
            ),
        );
    }

    let key = format!("{tag}/{filename}");
    match state
        .objects
        .presign_put(&state.valid_bucket, &key, state.upload_url_expiry)
        .await
    {
        Ok(upload_url) => (StatusCode::OK, Json(UploadUrlResponse { upload_url })).into_response(),
        Err(e) => {
            error!(key = %key, error = %e, "Presigning upload URL failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Object-created notification intake.
///
/// The response is not consumed by the event source; side effects are the
/// contract. Pipeline failures are logged and answered 202 so the trigger
/// infrastructure applies its own whole-invocation retry policy.
#[instrument(skip(state, body))]
async fn object_created(State(state): State<AppState>, body: Bytes) -> Response {
    let event = match ObjectCreatedEvent::parse(&body) {
        Ok(event) => event,
        Err(e) => {
            metrics::counter!("merge.events.malformed").increment(1);
            return json_error(StatusCode::BAD_REQUEST, e.to_string());
        }
    };

    match state.pipeline.handle_event(&event).await {
        Ok(outcome) => {
            info!(?outcome, "Event processed");
        }
        Err(PipelineError::MalformedEvent(message)) => {
            metrics::counter!("merge.events.malformed").increment(1);
            return json_error(StatusCode::BAD_REQUEST, message);
        }
        Err(e) => {
            // Pollers observe the FAILED status; the event source only needs
            // to know the notification was accepted.
            error!(error = %e, "Pipeline invocation failed");
        }
    }

    StatusCode::ACCEPTED.into_response()
}

/// Start the HTTP API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> anyhow::Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting merge service API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(crate::shutdown_signal())
        .await
        .context("API server error")?;

    Ok(())
}

/// Assemble application state from loaded configuration and store handles
pub fn build_state(
    config: &Config,
    groups: Arc<dyn GroupStore>,
    objects: Arc<dyn ObjectStore>,
) -> AppState {
    use crate::aggregator::FileAggregator;
    use crate::quarantine::Quarantine;

    let allocator = Arc::new(GroupIdAllocator::new(
        groups.clone(),
        RetryPolicy::immediate(config.merge.alloc_max_attempts),
        config.group_ttl(),
    ));

    let pipeline = Arc::new(MergePipeline::new(
        FileAggregator::new(objects.clone(), config.merge.input_extension.clone()),
        objects.clone(),
        groups.clone(),
        Quarantine::new(
            objects.clone(),
            config.s3.invalid_bucket.clone(),
            config.merge.quarantine_concurrency,
        ),
        config.s3.output_bucket.clone(),
        config.merge.delete_inputs_after_merge,
    ));

    AppState {
        allocator,
        groups,
        objects,
        pipeline,
        valid_bucket: config.s3.valid_bucket.clone(),
        output_bucket: config.s3.output_bucket.clone(),
        presigned_url_expiry: config.presigned_url_expiry(),
        upload_url_expiry: config.upload_url_expiry(),
        allowed_upload_extensions: config.merge.allowed_upload_extensions.clone(),
        poll_retry: RetryPolicy::new(
            config.merge.max_poll_attempts,
            config.poll_wait_interval(),
        ),
    }
}
