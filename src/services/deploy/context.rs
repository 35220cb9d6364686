//! 部署上下文
//!
//! 一次部署（或回滚）周期的只读上下文：运行 ID、目标、制品、健康端点和取消令牌。
//! 创建后不再修改，各步骤只借用

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::artifact::ArtifactReference;
use crate::domain::target::DeploymentTarget;
use crate::error::{DeployError, DeployResult};
use crate::infra::command::CommandOutput;
use crate::infra::executor::{RemoteCommand, RemoteExecutor};

/// 部署执行上下文
#[derive(Clone)]
pub struct DeployContext {
    /// 运行 ID（部署与其自动回滚共用）
    pub run_id: String,
    pub target: DeploymentTarget,
    pub artifact: ArtifactReference,
    /// 健康端点
    pub health_endpoint: String,
    /// 取消令牌
    pub cancel_token: CancellationToken,
    executor: Arc<dyn RemoteExecutor>,
}

impl DeployContext {
    pub fn new(
        run_id: impl Into<String>,
        target: DeploymentTarget,
        artifact: ArtifactReference,
        health_endpoint: impl Into<String>,
        cancel_token: CancellationToken,
        executor: Arc<dyn RemoteExecutor>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            target,
            artifact,
            health_endpoint: health_endpoint.into(),
            cancel_token,
            executor,
        }
    }

    /// 同一运行内换一个制品（回滚周期）
    pub fn for_artifact(&self, artifact: ArtifactReference) -> Self {
        Self {
            artifact,
            ..self.clone()
        }
    }

    /// 执行远程命令，非零退出视为失败
    pub async fn exec(&self, command: &RemoteCommand) -> DeployResult<CommandOutput> {
        if self.is_cancelled() {
            return Err(DeployError::Cancelled);
        }
        debug!(
            run_id = %self.run_id,
            target = %self.target,
            stage = command.stage,
            "Executing deploy step"
        );
        self.executor
            .run_checked(&self.target, command, &self.cancel_token)
            .await
    }

    /// 执行远程命令，退出码由调用方判断
    pub async fn exec_unchecked(&self, command: &RemoteCommand) -> DeployResult<CommandOutput> {
        self.executor.run(&self.target, command, &self.cancel_token).await
    }

    /// CRUD 冒烟检查的基础地址（健康端点去掉 `/health`）
    pub fn service_base_url(&self) -> &str {
        self.health_endpoint
            .strip_suffix("/health")
            .unwrap_or(&self.health_endpoint)
    }

    /// 检查是否被取消
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::testing::FakeHost;
    use crate::services::deploy::compose::stage;

    fn ctx(host: Arc<FakeHost>, cancel: CancellationToken) -> DeployContext {
        DeployContext::new(
            "run-1",
            DeploymentTarget::new("h", "deploy"),
            ArtifactReference::new("org/app", "v1"),
            "http://h:3000/health",
            cancel,
            host,
        )
    }

    #[tokio::test]
    async fn test_exec_maps_failures() {
        let host = FakeHost::new();
        host.fail_stage(stage::PULL_IMAGE, 1);
        let c = ctx(host.clone(), CancellationToken::new());
        let layout = FakeHost::compose_layout();

        assert!(c.exec(&layout.prerequisites()).await.is_ok());
        let err = c.exec(&layout.pull_image(&c.artifact)).await.unwrap_err();
        assert!(matches!(err, DeployError::ExternalTool { exit_code: 1, .. }));
    }

    #[tokio::test]
    async fn test_exec_after_cancel() {
        let host = FakeHost::new();
        let cancel = CancellationToken::new();
        let c = ctx(host.clone(), cancel.clone());
        cancel.cancel();

        let err = c.exec(&FakeHost::compose_layout().probe()).await.unwrap_err();
        assert!(matches!(err, DeployError::Cancelled));
        assert_eq!(host.command_count(), 0);
    }

    #[test]
    fn test_service_base_url() {
        let c = ctx(FakeHost::new(), CancellationToken::new());
        assert_eq!(c.service_base_url(), "http://h:3000");
        let other = c.for_artifact(ArtifactReference::new("org/app", "v0"));
        assert_eq!(other.run_id, "run-1");
        assert_eq!(other.artifact.tag, "v0");
    }
}
