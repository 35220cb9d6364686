//! 统一错误处理
//!
//! - `DeployError`: 编排核心的错误分类，每个变体对应一个机器可读的 `ErrorKind`
//! - `ApiError`: HTTP 层错误，实现 `IntoResponse`

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 机器可读的错误类型
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connectivity,
    ExternalTool,
    VerificationTimeout,
    NoRollbackCandidate,
    NotFound,
    ConfirmationDeclined,
    Backup,
    Cancelled,
    TargetBusy,
    InvalidInput,
    InvalidTransition,
    Registry,
    Config,
}

impl ErrorKind {
    /// 转换为字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connectivity => "connectivity",
            ErrorKind::ExternalTool => "external_tool",
            ErrorKind::VerificationTimeout => "verification_timeout",
            ErrorKind::NoRollbackCandidate => "no_rollback_candidate",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ConfirmationDeclined => "confirmation_declined",
            ErrorKind::Backup => "backup",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::TargetBusy => "target_busy",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::Registry => "registry",
            ErrorKind::Config => "config",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 编排错误
#[derive(Debug, Error)]
pub enum DeployError {
    /// 目标主机不可达
    #[error("target {target} is unreachable: {detail}")]
    Connectivity { target: String, detail: String },

    /// 远程命令非零退出
    #[error("`{stage}` exited with code {exit_code}: {stderr}")]
    ExternalTool {
        stage: String,
        exit_code: i32,
        stderr: String,
    },

    /// 健康检查在预算内未通过
    #[error("{endpoint} not healthy after {attempts} attempts (last: {last})")]
    VerificationTimeout {
        endpoint: String,
        attempts: u32,
        last: String,
    },

    /// 没有可回滚的版本
    #[error("no rollback candidate for {repository} other than {current}")]
    NoRollbackCandidate { repository: String, current: String },

    #[error("{0} not found")]
    NotFound(String),

    /// 破坏性操作未确认
    #[error("confirmation declined: {0}")]
    ConfirmationDeclined(String),

    #[error("backup failed: {0}")]
    Backup(String),

    #[error("operation cancelled")]
    Cancelled,

    /// 同一目标已有操作在进行
    #[error("another operation is already running on {0}")]
    TargetBusy(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: &'static str, to: &'static str },

    #[error("registry error: {0}")]
    Registry(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl DeployError {
    /// 获取错误类型
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeployError::Connectivity { .. } => ErrorKind::Connectivity,
            DeployError::ExternalTool { .. } => ErrorKind::ExternalTool,
            DeployError::VerificationTimeout { .. } => ErrorKind::VerificationTimeout,
            DeployError::NoRollbackCandidate { .. } => ErrorKind::NoRollbackCandidate,
            DeployError::NotFound(_) => ErrorKind::NotFound,
            DeployError::ConfirmationDeclined(_) => ErrorKind::ConfirmationDeclined,
            DeployError::Backup(_) => ErrorKind::Backup,
            DeployError::Cancelled => ErrorKind::Cancelled,
            DeployError::TargetBusy(_) => ErrorKind::TargetBusy,
            DeployError::InvalidInput(_) => ErrorKind::InvalidInput,
            DeployError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            DeployError::Registry(_) => ErrorKind::Registry,
            DeployError::Config(_) => ErrorKind::Config,
        }
    }

    pub fn connectivity(target: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Connectivity {
            target: target.into(),
            detail: detail.into(),
        }
    }

    pub fn backup(detail: impl Into<String>) -> Self {
        Self::Backup(detail.into())
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }
}

/// 编排结果类型别名
pub type DeployResult<T> = Result<T, DeployError>;

/// API 错误响应结构
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }
}

/// 统一 API 错误类型
#[derive(Debug)]
pub enum ApiError {
    /// 401 - 未授权（API Key 无效或缺失）
    Unauthorized,
    /// 404 - 资源未找到
    NotFound(String),
    /// 400 - 请求无效
    BadRequest(String),
    /// 编排错误，按 ErrorKind 映射状态码
    Deploy(DeployError),
}

impl ApiError {
    pub fn unauthorized() -> Self {
        Self::Unauthorized
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }
}

impl From<DeployError> for ApiError {
    fn from(err: DeployError) -> Self {
        ApiError::Deploy(err)
    }
}

/// ErrorKind 对应的 HTTP 状态码
fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound | ErrorKind::NoRollbackCandidate => StatusCode::NOT_FOUND,
        ErrorKind::InvalidInput | ErrorKind::ConfirmationDeclined => StatusCode::BAD_REQUEST,
        ErrorKind::TargetBusy | ErrorKind::InvalidTransition => StatusCode::CONFLICT,
        ErrorKind::Connectivity | ErrorKind::Registry => StatusCode::BAD_GATEWAY,
        ErrorKind::VerificationTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::ExternalTool
        | ErrorKind::Backup
        | ErrorKind::Cancelled
        | ErrorKind::Config => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Invalid or missing API key".to_string(),
            ),
            ApiError::NotFound(resource) => (
                StatusCode::NOT_FOUND,
                "not_found",
                format!("{} not found", resource),
            ),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::Deploy(err) => {
                let kind = err.kind();
                (status_for(kind), kind.as_str(), err.to_string())
            }
        };

        let body = ErrorResponse::new(error_type, message);
        (status, Json(body)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Unauthorized => write!(f, "Unauthorized"),
            ApiError::NotFound(r) => write!(f, "Not found: {}", r),
            ApiError::BadRequest(m) => write!(f, "Bad request: {}", m),
            ApiError::Deploy(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ApiError {}

/// 便捷类型别名
pub type ApiResult<T> = Result<T, ApiError>;
