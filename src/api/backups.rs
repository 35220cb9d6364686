//! 备份管理 API
//!
//! 包含 /backups, /backups/:name/restore 端点

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::domain::backup::BackupRecord;
use crate::domain::target::DeploymentTarget;
use crate::error::{ApiError, ApiResult};
use crate::middleware::RequireApiKey;
use crate::services::backup::RestoreReport;
use crate::state::app_state::get_shutdown_token;
use crate::state::AppState;

/// 目标查询参数
#[derive(Debug, Deserialize)]
pub struct HostQuery {
    pub host: String,
    pub user: Option<String>,
}

/// 创建备份请求
#[derive(Debug, Deserialize)]
pub struct BackupRequest {
    pub host: String,
    pub user: Option<String>,
    /// 备份名（默认时间戳）
    pub name: Option<String>,
}

/// 恢复请求
#[derive(Debug, Deserialize)]
pub struct RestoreRequest {
    pub host: String,
    pub user: Option<String>,
    /// 确认令牌，必须为 `yes-destroy-current-state`
    pub confirm: Option<String>,
}

/// 备份列表响应
#[derive(Debug, Serialize)]
pub struct BackupListResponse {
    pub target: String,
    pub backups: Vec<BackupRecord>,
}

/// 创建备份管理路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/backups", get(list_backups).post(create_backup))
        .route("/backups/:name/restore", post(restore_backup))
}

fn resolve_target(state: &AppState, host: &str, user: Option<String>) -> ApiResult<DeploymentTarget> {
    let host = host.trim();
    if host.is_empty() {
        return Err(ApiError::bad_request("host is required"));
    }
    let mut target = state.config.target(host);
    if let Some(user) = user.filter(|u| !u.is_empty()) {
        target.user = user;
    }
    Ok(target)
}

/// 列出备份
///
/// GET /backups?host=
async fn list_backups(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HostQuery>,
) -> ApiResult<Json<BackupListResponse>> {
    let target = resolve_target(&state, &query.host, query.user)?;
    let cancel = get_shutdown_token().child_token();
    let backups = state.backups.list(&target, &cancel).await?.collect().await;
    Ok(Json(BackupListResponse {
        target: target.key(),
        backups,
    }))
}

/// 创建备份
///
/// POST /backups
/// 需要 API Key
async fn create_backup(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Json(request): Json<BackupRequest>,
) -> ApiResult<Json<BackupRecord>> {
    let target = resolve_target(&state, &request.host, request.user)?;
    let cancel = get_shutdown_token().child_token();
    let record = state
        .backups
        .backup(&target, request.name.as_deref(), &cancel)
        .await?;
    Ok(Json(record))
}

/// 从备份恢复（破坏性）
///
/// POST /backups/:name/restore
/// 需要 API Key 和确认令牌
async fn restore_backup(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(request): Json<RestoreRequest>,
) -> ApiResult<Json<RestoreReport>> {
    let target = resolve_target(&state, &request.host, request.user)?;
    let cancel = get_shutdown_token().child_token();
    let report = state
        .backups
        .restore(&target, &name, request.confirm.as_deref(), &cancel)
        .await?;
    Ok(Json(report))
}
