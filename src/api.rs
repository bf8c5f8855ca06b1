use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::{
    error::WorkflowError,
    media::{FileSelection, FileUpload, MediaAsset},
    verdict::VerdictModel,
    workflow::{WorkflowController, WorkflowSnapshot},
};

/// 上传时携带文件名的请求头
pub const FILE_NAME_HEADER: &str = "x-file-name";

// ==========================================
// 1. 应用状态 (Shared State)
// ==========================================
// 控制器内部自带锁，这里只需要 Arc 共享。
pub struct AppState {
    pub controller: Arc<WorkflowController>,
    pub max_upload_bytes: usize,
}

// ==========================================
// 2. 错误响应
// ==========================================

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

pub struct ApiError(pub WorkflowError);

impl From<WorkflowError> for ApiError {
    fn from(err: WorkflowError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0 {
            WorkflowError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            WorkflowError::InvalidState(_) | WorkflowError::Superseded { .. } => {
                StatusCode::CONFLICT
            }
            WorkflowError::BackendUnavailable(_) | WorkflowError::MalformedReport(_) => {
                StatusCode::BAD_GATEWAY
            }
            WorkflowError::AnalysisTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.0.kind(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

// ==========================================
// 3. API 路由构建
// ==========================================
pub fn app(state: Arc<AppState>) -> Router {
    let body_limit = state.max_upload_bytes;
    Router::new()
        .route("/state", get(get_state))
        .route("/asset", put(select_asset).delete(clear_asset))
        .route("/asset/preview", get(get_preview))
        .route("/analyze", post(analyze))
        .route("/history", get(get_history).delete(clear_history))
        .route("/reset", post(reset))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive()) // ⚠️ 开发模式：允许所有跨域
        .with_state(state)
}

// ==========================================
// 4. 处理函数 (Handlers)
// ==========================================

async fn get_state(State(state): State<Arc<AppState>>) -> Json<WorkflowSnapshot> {
    Json(state.controller.snapshot())
}

/// 接口：暂存文件
///
/// 请求体是文件原始字节，`content-type` 决定媒体类别，文件名放在 `x-file-name`。
/// 空请求体且没有文件名视为“没有选择文件”。
async fn select_asset(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<MediaAsset>, ApiError> {
    let name = header_str(&headers, FILE_NAME_HEADER).unwrap_or_default();
    let content_type = header_str(&headers, header::CONTENT_TYPE.as_str())
        .unwrap_or_else(|| "application/octet-stream".to_string());

    let selection = if body.is_empty() && name.is_empty() {
        FileSelection::empty()
    } else {
        FileUpload::new(name, content_type, body.to_vec()).into()
    };

    info!(bytes = body.len(), "select file requested");
    let asset = state.controller.select_file(selection)?;
    Ok(Json(asset))
}

async fn clear_asset(State(state): State<Arc<AppState>>) -> StatusCode {
    state.controller.clear();
    StatusCode::NO_CONTENT
}

async fn get_preview(State(state): State<Arc<AppState>>) -> Response {
    match state.controller.preview() {
        Some(preview) => (
            [(header::CONTENT_TYPE, preview.content_type().to_string())],
            preview.bytes().to_vec(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// 接口：对当前素材发起分析，等待判决
async fn analyze(State(state): State<Arc<AppState>>) -> Result<Json<VerdictModel>, ApiError> {
    info!("analysis requested");
    let verdict = state.controller.invoke_analysis().await?;
    Ok(Json(verdict))
}

async fn get_history(State(state): State<Arc<AppState>>) -> Json<Vec<VerdictModel>> {
    Json(state.controller.history())
}

async fn clear_history(State(state): State<Arc<AppState>>) -> StatusCode {
    state.controller.clear_history();
    StatusCode::NO_CONTENT
}

async fn reset(State(state): State<Arc<AppState>>) -> StatusCode {
    state.controller.reset();
    StatusCode::NO_CONTENT
}

fn header_str(headers: &HeaderMap, key: &str) -> Option<String> {
    headers
        .get(key)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
