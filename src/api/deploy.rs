//! 部署管理 API
//!
//! 包含 /deployments, /deployments/recent, /deployments/:id 端点

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

use crate::domain::artifact::{is_valid_tag, ArtifactReference};
use crate::domain::deploy::{DeploymentAttempt, RunRecord};
use crate::error::{ApiError, ApiResult, DeployError};
use crate::middleware::RequireApiKey;
use crate::services::deploy::DeployOptions;
use crate::state::app_state::get_shutdown_token;
use crate::state::AppState;

/// 触发部署请求
#[derive(Debug, Clone, Deserialize)]
pub struct DeployRequest {
    /// 目标主机
    pub host: String,
    /// 镜像 tag
    pub tag: String,
    /// SSH 用户（默认取配置）
    pub user: Option<String>,
    /// 运行 ID（来自 CI），为空时自动生成
    pub run_id: Option<String>,
    #[serde(default)]
    pub auto_rollback: bool,
    /// 预先确认自动回滚
    #[serde(default)]
    pub confirm_rollback: bool,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub safety_backup: bool,
    #[serde(default)]
    pub smoke_test: bool,
}

/// 触发部署响应
#[derive(Debug, Serialize)]
pub struct DeployAccepted {
    pub run_id: String,
    pub target: String,
    pub image: String,
    pub status: &'static str,
    pub status_url: String,
}

/// 历史查询参数
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// 返回数量限制，默认 20
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// 目标过滤（`user@host:port`）
    pub target: Option<String>,
}

fn default_limit() -> usize {
    20
}

/// 历史响应
#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub attempts: Vec<DeploymentAttempt>,
    pub total: usize,
}

/// 运行状态响应
#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub id: String,
    /// 该运行的全部尝试（部署及其回滚）
    pub attempts: Vec<DeploymentAttempt>,
    /// 没有产生尝试时的结果（no-op 或开始前被拒绝）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<RunRecord>,
}

/// 创建部署管理路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/deployments", post(trigger_deploy))
        .route("/deployments/recent", get(recent_deployments))
        .route("/deployments/:id", get(get_deployment))
}

/// 触发部署
///
/// POST /deployments
/// 需要 API Key。请求只做校验，部署在后台执行
async fn trigger_deploy(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Json(request): Json<DeployRequest>,
) -> ApiResult<impl IntoResponse> {
    if request.host.trim().is_empty() {
        return Err(ApiError::bad_request("host is required"));
    }
    if !is_valid_tag(&request.tag) {
        return Err(ApiError::bad_request(format!("invalid tag '{}'", request.tag)));
    }

    let mut target = state.config.target(request.host.trim());
    if let Some(user) = request.user.filter(|u| !u.is_empty()) {
        target.user = user;
    }
    if state.locks.is_locked(&target) {
        return Err(DeployError::TargetBusy(target.host_key()).into());
    }

    let artifact = ArtifactReference::new(state.controller.repository(), request.tag.clone());
    let run_id = request
        .run_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let opts = DeployOptions {
        auto_rollback: request.auto_rollback,
        confirmed: request.confirm_rollback,
        force: request.force,
        safety_backup: request.safety_backup,
        smoke_test: request.smoke_test,
        health: state.config.verify_options(),
        run_id: Some(run_id.clone()),
    };

    let response = DeployAccepted {
        run_id: run_id.clone(),
        target: target.key(),
        image: artifact.image(),
        status: "accepted",
        status_url: format!("/deployments/{}", run_id),
    };

    info!(run_id = %run_id, target = %target, image = %artifact.image(), "Deployment requested");

    let controller = state.controller.clone();
    tokio::spawn(async move {
        let cancel = get_shutdown_token().child_token();
        match controller.deploy(target, artifact, &opts, &cancel).await {
            Ok(report) => match report.failure() {
                Some(failure) => error!(run_id = %report.run_id, kind = %failure.kind, "{}", failure.detail),
                None => info!(run_id = %report.run_id, noop = report.noop, "Deployment finished"),
            },
            Err(e) => error!(run_id = %run_id, kind = %e.kind(), error = %e, "Deployment rejected"),
        }
    });

    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// 获取最近的部署尝试
///
/// GET /deployments/recent
async fn recent_deployments(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let attempts = state
        .attempts
        .history(query.limit.min(100), query.target.as_deref())
        .await;
    let total = attempts.len();
    Json(HistoryResponse { attempts, total })
}

/// 按运行 ID 或尝试 ID 查询
///
/// GET /deployments/:id
async fn get_deployment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<RunResponse>> {
    let attempts = state.attempts.find(&id).await;
    let run = state.attempts.run(&id).await;
    if attempts.is_empty() && run.is_none() {
        return Err(ApiError::not_found(format!("Deployment '{}'", id)));
    }
    Ok(Json(RunResponse { id, attempts, run }))
}
