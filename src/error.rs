use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// 统一错误类型
///
/// 业务上的"未匹配"、"卡被拒"都不是错误，只会出现在统计结果中。
#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("repository unavailable: {0}")]
    Repository(String),
    #[error("payment gateway failure: {0}")]
    Gateway(String),
    #[error("export failed: {0}")]
    Export(String),
    /// 批处理因存储故障中止；已提交的部分保持不变
    #[error("batch aborted after {processed} items: {source}")]
    BatchAborted {
        processed: usize,
        #[source]
        source: Box<AppError>,
    },
}

impl AppError {
    pub fn not_found(what: impl Into<String>) -> Self {
        AppError::NotFound(what.into())
    }

    pub fn conflict(what: impl Into<String>) -> Self {
        AppError::Conflict(what.into())
    }

    pub fn validation(what: impl Into<String>) -> Self {
        AppError::Validation(what.into())
    }

    pub fn aborted(processed: usize, source: AppError) -> Self {
        AppError::BatchAborted {
            processed,
            source: Box::new(source),
        }
    }
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Gateway(_) => StatusCode::BAD_GATEWAY,
            AppError::Repository(_) | AppError::Export(_) | AppError::BatchAborted { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        let body = json!({ "success": false, "message": self.to_string() });
        (status, Json(body)).into_response()
    }
}

impl From<csv::Error> for AppError {
    fn from(err: csv::Error) -> Self {
        AppError::Export(err.to_string())
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Repository(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
