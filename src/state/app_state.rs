//! 应用状态
//!
//! 根据环境配置组装控制器、备份管理器等组件，CLI 与 HTTP API 共用

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// 全局 shutdown token，用于优雅关闭所有后台任务
static GLOBAL_SHUTDOWN: std::sync::OnceLock<CancellationToken> = std::sync::OnceLock::new();

/// 获取全局 shutdown token
pub fn get_shutdown_token() -> CancellationToken {
    GLOBAL_SHUTDOWN
        .get_or_init(CancellationToken::new)
        .clone()
}

/// 触发全局 shutdown
pub fn trigger_shutdown() {
    if let Some(token) = GLOBAL_SHUTDOWN.get() {
        token.cancel();
    }
}

use crate::config::env::constants::HEALTH_REQUEST_TIMEOUT_SECS;
use crate::config::env::EnvConfig;
use crate::error::DeployResult;
use crate::infra::executor::{RemoteExecutor, SshExecutor};
use crate::infra::probe::HttpHealthProbe;
use crate::infra::registry::RegistryClient;
use crate::services::backup::BackupManager;
use crate::services::deploy::{ControllerSettings, DeploymentController};
use crate::services::health::HealthVerifier;
use crate::services::rollback::RollbackSelector;
use crate::services::smoke::SmokeTester;

use super::attempt_store::AttemptStore;
use super::target_locks::TargetLocks;

/// 应用状态
pub struct AppState {
    /// API 密钥（用于验证请求）
    pub api_key: String,
    /// 环境配置
    pub config: EnvConfig,
    /// 服务启动时间
    pub started_at: DateTime<Utc>,
    /// 部署控制器
    pub controller: DeploymentController,
    /// 备份管理器
    pub backups: BackupManager,
    /// 部署尝试存储
    pub attempts: Arc<AttemptStore>,
    /// 目标锁（控制器和备份管理器共享）
    pub locks: TargetLocks,
}

impl AppState {
    /// 使用 ssh 执行器和真实的仓库 / 健康探测创建
    pub fn new(config: EnvConfig) -> DeployResult<Self> {
        let executor: Arc<dyn RemoteExecutor> = Arc::new(SshExecutor::default());
        Self::with_executor(config, executor)
    }

    /// 使用指定执行器创建
    pub fn with_executor(config: EnvConfig, executor: Arc<dyn RemoteExecutor>) -> DeployResult<Self> {
        tracing::info!(
            api_key_len = config.api_key.len(),
            port = config.port,
            ssh_user = %config.ssh.user,
            repository = %config.registry.repository(),
            registry = %config.registry.url,
            app_dir = %config.app.dir,
            backup_dir = %config.backup.dir,
            "Loaded configuration"
        );

        let request_timeout = Duration::from_secs(HEALTH_REQUEST_TIMEOUT_SECS);
        let locks = TargetLocks::new();
        let attempts = Arc::new(AttemptStore::new());

        let registry = Arc::new(RegistryClient::new(config.registry.url.clone())?);
        let selector = RollbackSelector::new(registry, config.tag_policy(), config.registry.tag_window);
        let verifier = HealthVerifier::new(Arc::new(HttpHealthProbe::new(request_timeout)?));
        let backups = BackupManager::new(executor.clone(), locks.clone(), config.store_layout());

        let settings = ControllerSettings {
            repository: config.registry.repository(),
            health_url: config.app.health_url.clone(),
            layout: config.compose_layout()?,
            reachability: config.reachability_policy(),
        };
        let controller = DeploymentController::new(
            executor,
            selector,
            verifier,
            backups.clone(),
            locks.clone(),
            attempts.clone(),
            settings,
        )
        .with_smoke_tester(SmokeTester::new(request_timeout)?);

        Ok(Self {
            api_key: config.api_key.clone(),
            config,
            started_at: Utc::now(),
            controller,
            backups,
            attempts,
            locks,
        })
    }
}
