//! HTTP API server implementation

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use crate::core::config::ServiceConfig;
use crate::core::errors::TranslationError;
use crate::core::models::{LoadedModelInfo, TranslationRequest, TranslationResponse};
use crate::core::translator::Translator;

/// Application state
#[derive(Clone)]
pub struct AppState {
    translator: Arc<Translator>,
}

/// Health check response
#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    status: String,
    service: String,
    version: String,
}

/// Loaded models response
#[derive(Serialize, ToSchema)]
pub struct ModelsResponse {
    object: String,
    data: Vec<LoadedModelInfo>,
}

/// Error response
#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    /// What went wrong
    pub error: ErrorDetail,
}

/// Error body
#[derive(Serialize, ToSchema)]
pub struct ErrorDetail {
    /// Human-readable message
    pub message: String,
    /// Machine-readable code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// `invalid_request_error` or `api_error`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
}

/// Error wrapper turning translation failures into HTTP responses
pub struct ApiError(TranslationError);

impl From<TranslationError> for ApiError {
    fn from(err: TranslationError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            TranslationError::InvalidLanguage { .. } => StatusCode::BAD_REQUEST,
            TranslationError::ModelNotFound { .. } => StatusCode::NOT_FOUND,
            TranslationError::InputTooLong { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            TranslationError::ApiError { .. } | TranslationError::NetworkError { .. } => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_type = if self.0.is_client_error() {
            "invalid_request_error"
        } else {
            "api_error"
        };

        (
            status,
            Json(ErrorResponse {
                error: ErrorDetail {
                    message: self.0.to_string(),
                    code: Some(self.0.code().to_string()),
                    r#type: Some(error_type.to_string()),
                },
            }),
        )
            .into_response()
    }
}

/// OpenAPI document served at `/api-docs/openapi.json`
#[derive(OpenApi)]
#[openapi(
    paths(health_check, get_models, translate),
    components(schemas(
        TranslationRequest,
        TranslationResponse,
        LoadedModelInfo,
        ModelsResponse,
        HealthResponse,
        ErrorResponse,
        ErrorDetail
    )),
    tags((name = "translation", description = "OPUS-MT translation"))
)]
pub struct ApiDoc;

/// Health check handler
#[utoipa::path(get, path = "/", tag = "translation", responses((status = 200, body = HealthResponse)))]
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Models currently loaded in memory
#[utoipa::path(get, path = "/models", tag = "translation", responses((status = 200, body = ModelsResponse)))]
async fn get_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        object: "list".to_string(),
        data: state.translator.loaded_models(),
    })
}

/// Translate text from `src_lang` to `tgt_lang`
#[utoipa::path(
    post,
    path = "/translate",
    tag = "translation",
    request_body = TranslationRequest,
    responses(
        (status = 200, body = TranslationResponse),
        (status = 400, description = "Invalid language code", body = ErrorResponse),
        (status = 404, description = "No model for the language pair", body = ErrorResponse),
        (status = 413, description = "Input exceeds the token limit", body = ErrorResponse),
        (status = 422, description = "Malformed request body"),
        (status = 500, description = "Translation failed", body = ErrorResponse)
    )
)]
async fn translate(
    State(state): State<AppState>,
    Json(payload): Json<TranslationRequest>,
) -> Result<Json<TranslationResponse>, ApiError> {
    match state.translator.translate(&payload).await {
        Ok(response) => Ok(Json(response)),
        Err(e) => {
            warn!("Translation {}->{} failed: {}", payload.src_lang, payload.tgt_lang, e);
            Err(e.into())
        }
    }
}

/// Build the router
pub fn router(translator: Arc<Translator>) -> Router {
    let state = AppState { translator };

    Router::new()
        .route("/", get(health_check))
        .route("/models", get(get_models))
        .route("/translate", post(translate))
        .merge(SwaggerUi::new("/swagger").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

/// Run the HTTP server
pub async fn run_server(config: ServiceConfig) -> anyhow::Result<()> {
    let translator = Arc::new(Translator::from_config(&config)?);
    let app = router(translator);

    // Bind address
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
