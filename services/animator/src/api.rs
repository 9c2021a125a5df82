use crate::checkout::{ChargeSession, Checkout};
use crate::config::ApiConfig;
use crate::error::{RetryClass, ServiceError};
use crate::job::{BlobRef, Job, JobId, MigrationMarker};
use crate::job_store::JobStore;
use crate::migration::{CookieMigrationReport, Migrator, SignInOutcome};
use crate::processor::{JobStatus, Processor};
use crate::storage::Blob;
use crate::webhook::{parse_event, WebhookError, WebhookVerifier, SIGNATURE_HEADER};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Header naming the uploader's identity
pub const OWNER_HEADER: &str = "x-owner-id";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<Processor>,
    pub checkout: Arc<Checkout>,
    pub migrator: Arc<Migrator>,
    pub store: Arc<dyn JobStore>,
    /// `None` when no webhook secret is configured
    pub webhook: Option<WebhookVerifier>,
    /// Request body cap for uploads; size validation happens below it
    pub upload_body_limit: usize,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub code: String,
    pub retry: RetryClass,
}

/// Service error rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError {
    error: ServiceError,
    /// Payment endpoints report unknown jobs as bad requests and processor
    /// failures as bad gateway
    payments: bool,
}

impl ApiError {
    fn payments(error: ServiceError) -> Self {
        Self {
            error,
            payments: true,
        }
    }

    fn status(&self) -> StatusCode {
        match (&self.error, self.payments) {
            (ServiceError::Validation(_), _) => StatusCode::BAD_REQUEST,
            (ServiceError::NotFound(_), false) => StatusCode::NOT_FOUND,
            (ServiceError::NotFound(_), true) => StatusCode::BAD_REQUEST,
            (ServiceError::Conflict(_), _) => StatusCode::CONFLICT,
            (ServiceError::Upstream(_), false) => StatusCode::INTERNAL_SERVER_ERROR,
            (ServiceError::Upstream(_), true) => StatusCode::BAD_GATEWAY,
            (ServiceError::Integrity(_), _) => StatusCode::BAD_REQUEST,
            (ServiceError::Forbidden(_), _) => StatusCode::FORBIDDEN,
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(error: ServiceError) -> Self {
        Self {
            error,
            payments: false,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.error, code = self.error.code(), "Request failed");
        }

        let body = ErrorResponse {
            success: false,
            error: self.error.to_string(),
            code: self.error.code().to_string(),
            retry: self.error.retry_class(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

fn parse_job_id(raw: &str) -> std::result::Result<JobId, ServiceError> {
    Ok(JobId::parse(raw)?)
}

/// JSON body whose rejection is handled by the handler
type JsonPayload<T> = std::result::Result<Json<T>, JsonRejection>;

/// Unwrap a JSON body, turning extractor rejections into validation errors
fn json_body<T>(payload: JsonPayload<T>) -> std::result::Result<T, ServiceError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| ServiceError::Validation(rejection.body_text()))
}

/// Processing response
#[derive(Debug, Serialize)]
pub struct ProcessResponse {
    pub success: bool,
    pub output_ref: BlobRef,
    pub preview_ref: Option<BlobRef>,
    pub reused: bool,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub success: bool,
    pub job: Job,
}

#[derive(Debug, Deserialize)]
pub struct CreateIntentRequest {
    pub job_id: String,
    pub owner_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateIntentResponse {
    pub success: bool,
    #[serde(flatten)]
    pub session: ChargeSession,
}

#[derive(Debug, Deserialize)]
pub struct VerifyPaymentRequest {
    pub charge_intent_id: String,
    pub job_id: String,
}

#[derive(Debug, Serialize)]
pub struct VerifyPaymentResponse {
    pub success: bool,
    pub job: Job,
}

#[derive(Debug, Serialize)]
pub struct UnlockResponse {
    pub success: bool,
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct CookieMigrationRequest {
    pub job_ids: Vec<String>,
    pub to_owner: String,
}

#[derive(Debug, Serialize)]
pub struct CookieMigrationResponse {
    pub success: bool,
    #[serde(flatten)]
    pub report: CookieMigrationReport,
}

#[derive(Debug, Deserialize)]
pub struct IdentityMigrationRequest {
    pub from_owner: String,
    pub to_owner: String,
}

#[derive(Debug, Serialize)]
pub struct IdentityMigrationResponse {
    pub success: bool,
    pub migrated: u64,
}

#[derive(Debug, Deserialize)]
pub struct SignInRequest {
    pub previous_owner: Option<String>,
    pub new_owner: String,
}

#[derive(Debug, Serialize)]
pub struct SignInResponse {
    pub success: bool,
    #[serde(flatten)]
    pub outcome: SignInOutcome,
}

#[derive(Debug, Serialize)]
pub struct PendingMigrationsResponse {
    pub pending: Vec<MigrationMarker>,
}

#[derive(Debug, Serialize)]
pub struct OwnerJobsResponse {
    pub jobs: Vec<JobStatus>,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
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
        }
    } else {
        CorsLayer::new()
    };

    let upload_limit = DefaultBodyLimit::max(state.upload_body_limit);

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/uploads/:job_id", put(upload).layer(upload_limit))
        .route("/jobs/:job_id", get(job_status))
        .route("/owners/:owner/jobs", get(owner_jobs))
        .route("/process/:job_id", post(process_job))
        .route("/payment/create-intent", post(create_payment_intent))
        .route("/payment/verify", post(verify_payment))
        .route("/payment/webhook", post(payment_webhook))
        .route("/unlock/:job_id", post(unlock_job))
        .route("/migrate/cookie", post(migrate_cookie))
        .route("/migrate/identity", post(migrate_identity))
        .route("/auth/complete", post(complete_sign_in))
        .route("/auth/pending/:owner", get(pending_migrations))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "animator-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Store an upload and register its job
#[instrument(skip(state, headers, body), fields(size_bytes = body.len()))]
async fn upload(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<UploadResponse> {
    let job_id = parse_job_id(&job_id)?;
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ServiceError::Validation("Missing Content-Type header".to_string()))?;
    let owner_id = headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from);

    let job = state
        .processor
        .register_upload(&job_id, Blob::new(body.to_vec(), content_type), owner_id)
        .await?;

    Ok(Json(UploadResponse { success: true, job }))
}

async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<JobStatus> {
    let job_id = parse_job_id(&job_id)?;
    Ok(Json(state.processor.status(&job_id).await?))
}

/// Gallery view of an owner's jobs; outputs stay hidden until purchase
async fn owner_jobs(
    State(state): State<AppState>,
    Path(owner): Path<String>,
) -> ApiResult<OwnerJobsResponse> {
    let jobs = state.processor.jobs_for_owner(&owner).await?;
    Ok(Json(OwnerJobsResponse { jobs }))
}

async fn process_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<ProcessResponse> {
    let job_id = parse_job_id(&job_id)?;
    let outcome = state.processor.process(&job_id).await?;

    Ok(Json(ProcessResponse {
        success: true,
        output_ref: outcome.output_ref,
        preview_ref: outcome.preview_ref,
        reused: outcome.reused,
    }))
}

async fn create_payment_intent(
    State(state): State<AppState>,
    payload: JsonPayload<CreateIntentRequest>,
) -> ApiResult<CreateIntentResponse> {
    let request = json_body(payload).map_err(ApiError::payments)?;
    let job_id = parse_job_id(&request.job_id).map_err(ApiError::payments)?;
    let owner_id = request.owner_id.filter(|o| !o.trim().is_empty());

    let session = state
        .checkout
        .create_charge_intent(&job_id, owner_id)
        .await
        .map_err(ApiError::payments)?;

    Ok(Json(CreateIntentResponse {
        success: true,
        session,
    }))
}

async fn verify_payment(
    State(state): State<AppState>,
    payload: JsonPayload<VerifyPaymentRequest>,
) -> ApiResult<VerifyPaymentResponse> {
    let request = json_body(payload).map_err(ApiError::payments)?;
    let job_id = parse_job_id(&request.job_id).map_err(ApiError::payments)?;
    if request.charge_intent_id.trim().is_empty() {
        return Err(ApiError::payments(ServiceError::Validation(
            "Missing charge_intent_id".to_string(),
        )));
    }

    let job = state
        .checkout
        .verify_and_unlock(&job_id, &request.charge_intent_id)
        .await
        .map_err(ApiError::payments)?;

    Ok(Json(VerifyPaymentResponse { success: true, job }))
}

/// Signed processor callback. Only signature problems are reported back; a
/// verified event is always acknowledged.
async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(ref verifier) = state.webhook else {
        error!("Webhook received but no webhook secret is configured");
        return webhook_rejection(WebhookError::NotConfigured);
    };

    let Some(signature) = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) else {
        return webhook_rejection(WebhookError::MissingSignature);
    };

    if let Err(e) = verifier.verify(&body, signature, chrono::Utc::now().timestamp()) {
        return webhook_rejection(e);
    }

    match parse_event(&body) {
        Ok(event) => state.checkout.handle_webhook_event(event).await,
        Err(e) => {
            warn!(error = %e, "Acknowledging webhook event that could not be parsed");
            metrics::counter!("animator.webhooks.unparsed").increment(1);
        }
    }
    Json(serde_json::json!({ "received": true })).into_response()
}

fn webhook_rejection(error: WebhookError) -> Response {
    warn!(error = %error, "Rejected webhook");
    metrics::counter!("animator.webhooks.rejected").increment(1);

    let error = match error {
        WebhookError::NotConfigured => ServiceError::Upstream(error.to_string()),
        other => ServiceError::Validation(other.to_string()),
    };
    ApiError::from(error).into_response()
}

async fn unlock_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<UnlockResponse> {
    let job_id = parse_job_id(&job_id)?;
    let asset = state.checkout.unlock(&job_id).await?;

    Ok(Json(UnlockResponse {
        success: true,
        url: asset.url,
    }))
}

async fn migrate_cookie(
    State(state): State<AppState>,
    payload: JsonPayload<CookieMigrationRequest>,
) -> ApiResult<CookieMigrationResponse> {
    let request = json_body(payload)?;
    let report = state
        .migrator
        .migrate_cookie_jobs(&request.job_ids, &request.to_owner)
        .await?;

    Ok(Json(CookieMigrationResponse {
        success: true,
        report,
    }))
}

async fn migrate_identity(
    State(state): State<AppState>,
    payload: JsonPayload<IdentityMigrationRequest>,
) -> ApiResult<IdentityMigrationResponse> {
    let request = json_body(payload)?;
    let migrated = state
        .migrator
        .migrate_identity(&request.from_owner, &request.to_owner)
        .await?;

    Ok(Json(IdentityMigrationResponse {
        success: true,
        migrated,
    }))
}

async fn complete_sign_in(
    State(state): State<AppState>,
    payload: JsonPayload<SignInRequest>,
) -> ApiResult<SignInResponse> {
    let request = json_body(payload)?;
    let outcome = state
        .migrator
        .complete_sign_in(request.previous_owner.as_deref(), &request.new_owner)
        .await?;

    Ok(Json(SignInResponse {
        success: true,
        outcome,
    }))
}

async fn pending_migrations(
    State(state): State<AppState>,
    Path(owner): Path<String>,
) -> ApiResult<PendingMigrationsResponse> {
    let pending = state.migrator.pending_for(&owner).await?;
    Ok(Json(PendingMigrationsResponse { pending }))
}

/// Start the HTTP API server; returns once `shutdown` is cancelled and
/// in-flight requests have drained
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryJobStore;
    use crate::job::{CompletedAttempt, NewJob};
    use crate::payments::{ChargeIntent, IntentStatus, MockPaymentProcessor, PaymentError, Price};
    use crate::processor::ProcessorSettings;
    use crate::storage::MemoryBlobStore;
    use crate::transform::tests::png_fixture;
    use crate::transform::MockImageTransformer;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    const WEBHOOK_SECRET: &str = "whsec_test";

    struct Harness {
        router: Router,
        store: Arc<MemoryJobStore>,
    }

    fn harness(transformer: MockImageTransformer, payments: MockPaymentProcessor) -> Harness {
        harness_with_webhook(transformer, payments, true)
    }

    fn harness_with_webhook(
        transformer: MockImageTransformer,
        payments: MockPaymentProcessor,
        webhook_configured: bool,
    ) -> Harness {
        let store = Arc::new(MemoryJobStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let settings = ProcessorSettings {
            max_upload_bytes: 10 * 1024 * 1024,
            preview_enabled: true,
            overlay_alpha: 0.5,
            stale_after: Duration::from_secs(900),
        };

        let state = AppState {
            processor: Arc::new(Processor::new(
                store.clone(),
                blobs.clone(),
                Arc::new(transformer),
                settings,
            )),
            checkout: Arc::new(Checkout::new(store.clone(), Arc::new(payments), blobs)),
            migrator: Arc::new(Migrator::new(store.clone(), 100)),
            store: store.clone(),
            webhook: webhook_configured
                .then(|| WebhookVerifier::new(WEBHOOK_SECRET, Duration::from_secs(300))),
            upload_body_limit: 11 * 1024 * 1024,
        };

        Harness {
            router: create_router(state, &ApiConfig::default()),
            store,
        }
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = tokio_test::assert_ok!(router.clone().oneshot(request).await);
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn post_empty(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_and_ready() {
        let h = harness(MockImageTransformer::new(), MockPaymentProcessor::new());

        let get = |uri: &str| Request::builder().uri(uri).body(Body::empty()).unwrap();
        let (status, body) = send(&h.router, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");

        let (status, body) = send(&h.router, get("/ready")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");
    }

    #[tokio::test]
    async fn test_upload_then_process_twice() {
        let mut transformer = MockImageTransformer::new();
        transformer
            .expect_transform()
            .times(1)
            .returning(|_| Ok(Blob::new(png_fixture(32, 32), "image/png")));
        let h = harness(transformer, MockPaymentProcessor::new());

        let upload = Request::builder()
            .method("PUT")
            .uri("/uploads/abc")
            .header(header::CONTENT_TYPE, "image/png")
            .header(OWNER_HEADER, "anon-1")
            .body(Body::from(png_fixture(16, 16)))
            .unwrap();
        let (status, body) = send(&h.router, upload).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["job"]["state"], "created");
        assert_eq!(body["job"]["owner_id"], "anon-1");

        let (status, first) = send(&h.router, post_empty("/process/abc")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["success"], true);
        assert_eq!(first["output_ref"]["bucket"], "output");
        assert_eq!(first["output_ref"]["key"], "abc_out.png");
        assert_eq!(first["preview_ref"]["key"], "abc.png");

        let (status, second) = send(&h.router, post_empty("/process/abc")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["output_ref"], first["output_ref"]);
        assert_eq!(second["reused"], true);

        let status_req = Request::builder().uri("/jobs/abc").body(Body::empty()).unwrap();
        let (status, view) = send(&h.router, status_req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["state"], "output_ready");
        assert!(view["output_url"].is_null());
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let mut payments = MockPaymentProcessor::new();
        payments.expect_fetch_price().returning(|| {
            Err(PaymentError::Api {
                status: 500,
                message: "processor down".to_string(),
            })
        });
        let h = harness(MockImageTransformer::new(), payments);

        let (status, body) = send(&h.router, post_empty("/process/missing")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "NOT_FOUND");
        assert_eq!(body["retry"], "fix_input");

        let (status, body) = send(&h.router, post_empty("/process/bad.id")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_FAILED");

        let (status, _) = send(
            &h.router,
            post_json(
                "/payment/verify",
                serde_json::json!({"job_id": "missing", "charge_intent_id": "pi_1"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &h.router,
            post_json("/migrate/identity", serde_json::json!({"from_owner": "anon1", "to_owner": "anon1"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_FAILED");

        // Finished, unpurchased job: unlock is forbidden, checkout hits the processor
        let job_id = JobId::parse("done").unwrap();
        h.store
            .insert_if_absent(&NewJob {
                job_id: job_id.clone(),
                input_key: "done.png".to_string(),
                input_content_type: "image/png".to_string(),
                owner_id: None,
            })
            .await
            .unwrap();
        h.store.begin_attempt(&job_id, chrono::Utc::now()).await.unwrap();
        h.store
            .complete_attempt(
                &job_id,
                1,
                &CompletedAttempt {
                    output_key: "done_out.png".to_string(),
                    preview_key: Some("done.png".to_string()),
                },
            )
            .await
            .unwrap();

        let (status, body) = send(&h.router, post_empty("/unlock/done")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "FORBIDDEN");

        let (status, body) = send(
            &h.router,
            post_json("/payment/create-intent", serde_json::json!({"job_id": "done"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["retry"], "retry_later");
    }

    fn webhook_request(payload: &str, signature: Option<String>) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri("/payment/webhook");
        if let Some(signature) = signature {
            builder = builder.header(SIGNATURE_HEADER, signature);
        }
        builder.body(Body::from(payload.to_string())).unwrap()
    }

    #[tokio::test]
    async fn test_webhook_signature_handling() {
        let h = harness(MockImageTransformer::new(), MockPaymentProcessor::new());
        let payload = r#"{"type":"customer.created","data":{"object":{"id":"cus_1"}}}"#;

        let (status, _) = send(&h.router, webhook_request(payload, None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let now = chrono::Utc::now().timestamp();
        let forged = format!("t={},v1={}", now, "ab".repeat(32));
        let (status, _) = send(&h.router, webhook_request(payload, Some(forged))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let verifier = WebhookVerifier::new(WEBHOOK_SECRET, Duration::from_secs(300));
        let signed = format!("t={},v1={}", now, verifier.sign(now, payload.as_bytes()));
        let (status, body) = send(&h.router, webhook_request(payload, Some(signed))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["received"], true);
    }

    #[tokio::test]
    async fn test_webhook_without_secret_is_server_error() {
        let h = harness_with_webhook(MockImageTransformer::new(), MockPaymentProcessor::new(), false);
        let (status, _) = send(&h.router, webhook_request("{}", Some("t=1,v1=00".into()))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_sign_in_and_cookie_migration() {
        let h = harness(MockImageTransformer::new(), MockPaymentProcessor::new());
        for (id, owner) in [("x", None), ("y", Some("other"))] {
            h.store
                .insert_if_absent(&NewJob {
                    job_id: JobId::parse(id).unwrap(),
                    input_key: format!("{id}.png"),
                    input_content_type: "image/png".to_string(),
                    owner_id: owner.map(String::from),
                })
                .await
                .unwrap();
        }

        let (status, body) = send(
            &h.router,
            post_json(
                "/migrate/cookie",
                serde_json::json!({"job_ids": ["x", "y", "z"], "to_owner": "user-1"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["migrated"], serde_json::json!(["x"]));
        assert_eq!(body["alreadyClaimed"], serde_json::json!(["y"]));
        assert_eq!(body["notFound"], serde_json::json!(["z"]));

        let (status, body) = send(
            &h.router,
            post_json(
                "/auth/complete",
                serde_json::json!({"previous_owner": "user-1", "new_owner": "user-2"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "merged");
        assert_eq!(body["migrated"], 1);

        let pending = Request::builder()
            .uri("/auth/pending/user-2")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&h.router, pending).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pending"], serde_json::json!([]));
    }

    async fn ready_job(store: &MemoryJobStore, id: &str, owner: Option<&str>) -> JobId {
        let job_id = JobId::parse(id).unwrap();
        store
            .insert_if_absent(&NewJob {
                job_id: job_id.clone(),
                input_key: format!("{id}.png"),
                input_content_type: "image/png".to_string(),
                owner_id: owner.map(String::from),
            })
            .await
            .unwrap();
        let claimed = store.begin_attempt(&job_id, chrono::Utc::now()).await.unwrap().unwrap();
        store
            .complete_attempt(
                &job_id,
                claimed.attempts,
                &CompletedAttempt {
                    output_key: format!("{id}_out.png"),
                    preview_key: Some(format!("{id}.png")),
                },
            )
            .await
            .unwrap()
            .unwrap();
        job_id
    }

    fn signed_webhook(payload: &str) -> Request<Body> {
        let now = chrono::Utc::now().timestamp();
        let verifier = WebhookVerifier::new(WEBHOOK_SECRET, Duration::from_secs(300));
        let signature = format!("t={},v1={}", now, verifier.sign(now, payload.as_bytes()));
        webhook_request(payload, Some(signature))
    }

    #[tokio::test]
    async fn test_sparse_webhook_intent_unlocks_job() {
        let mut payments = MockPaymentProcessor::new();
        payments.expect_retrieve_intent().times(1).returning(|id| {
            Ok(ChargeIntent {
                id: id.to_string(),
                status: IntentStatus::Succeeded,
                amount: 299,
                currency: "usd".to_string(),
                client_secret: None,
                metadata: std::collections::HashMap::from([(
                    "job_id".to_string(),
                    "abc".to_string(),
                )]),
            })
        });
        payments.expect_fetch_price().returning(|| {
            Ok(Price {
                id: "price_123".to_string(),
                unit_amount: Some(299),
                currency: "usd".to_string(),
                product: None,
            })
        });
        let h = harness(MockImageTransformer::new(), payments);
        let job_id = ready_job(&h.store, "abc", None).await;

        // No status or amount in the event object; both come from the processor
        let payload = r#"{"type":"payment_intent.succeeded","data":{"object":{"id":"pi_1","metadata":{"job_id":"abc"}}}}"#;
        let (status, body) = send(&h.router, signed_webhook(payload)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["received"], true);
        assert!(h.store.get(&job_id).await.unwrap().unwrap().purchased);
    }

    #[tokio::test]
    async fn test_signed_unparseable_webhook_is_acknowledged() {
        let mut payments = MockPaymentProcessor::new();
        payments.expect_retrieve_intent().never();
        let h = harness(MockImageTransformer::new(), payments);

        for payload in [
            "not json",
            r#"{"type":"payment_intent.succeeded","data":{"object":{"amount":299}}}"#,
        ] {
            let (status, body) = send(&h.router, signed_webhook(payload)).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["received"], true);
        }
    }

    #[tokio::test]
    async fn test_rejections_use_error_body() {
        let h = harness(MockImageTransformer::new(), MockPaymentProcessor::new());

        let (status, body) = send(&h.router, webhook_request("{}", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "VALIDATION_FAILED");
        assert_eq!(body["retry"], "fix_input");

        let malformed = Request::builder()
            .method("POST")
            .uri("/payment/create-intent")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{\"job_id\":"))
            .unwrap();
        let (status, body) = send(&h.router, malformed).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "VALIDATION_FAILED");

        let (status, body) = send(
            &h.router,
            post_json("/migrate/identity", serde_json::json!({"from_owner": "anon1"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_FAILED");
        assert!(body["error"].as_str().unwrap().contains("to_owner"));

        let without_secret =
            harness_with_webhook(MockImageTransformer::new(), MockPaymentProcessor::new(), false);
        let (status, body) = send(&without_secret.router, signed_webhook("{}")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_owner_jobs_listing() {
        let h = harness(MockImageTransformer::new(), MockPaymentProcessor::new());
        let job_id = ready_job(&h.store, "abc", Some("user-1")).await;
        ready_job(&h.store, "theirs", Some("user-2")).await;

        let list = |owner: &str| {
            Request::builder()
                .uri(format!("/owners/{owner}/jobs"))
                .body(Body::empty())
                .unwrap()
        };

        let (status, body) = send(&h.router, list("user-1")).await;
        assert_eq!(status, StatusCode::OK);
        let jobs = body["jobs"].as_array().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0]["job_id"], "abc");
        assert_eq!(jobs[0]["preview_url"], "memory://preview/abc.png");
        assert!(jobs[0]["output_url"].is_null());

        h.store.mark_purchased(&job_id, "pi_1", 299).await.unwrap();
        let (_, body) = send(&h.router, list("user-1")).await;
        assert_eq!(body["jobs"][0]["output_url"], "memory://output/abc_out.png");
    }
}
