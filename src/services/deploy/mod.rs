//! 部署服务模块
//!
//! 部署控制器：在目标主机上安装配置、启动制品、做健康验证，
//! 验证失败时按回滚策略切回上一个已知可用的版本（最多一次）。
//!
//! 同一目标的部署、回滚、备份、恢复互斥，后来者直接收到 `TargetBusy`

pub mod compose;
pub mod context;

use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::domain::artifact::{is_valid_tag, ArtifactReference};
use crate::domain::backup::SAFETY_PREFIX;
use crate::domain::deploy::{AttemptOutcome, DeployPhase, DeploymentAttempt, RunRecord};
use crate::domain::health::HealthCheckResult;
use crate::domain::rollback::{ConfirmedRollback, HealthOutcome, RollbackDecision, RollbackSummary};
use crate::domain::target::DeploymentTarget;
use crate::error::{DeployError, DeployResult, ErrorKind};
use crate::infra::executor::{RemoteCommand, RemoteExecutor};
use crate::services::backup::BackupManager;
use crate::services::health::{HealthVerifier, VerifyOptions};
use crate::services::retry::{RetryError, RetryPolicy};
use crate::services::rollback::RollbackSelector;
use crate::services::smoke::SmokeTester;
use crate::state::attempt_store::AttemptStore;
use crate::state::target_locks::TargetLocks;

pub use compose::ComposeLayout;
pub use context::DeployContext;

/// 部署选项
#[derive(Clone, Debug, Default)]
pub struct DeployOptions {
    /// 验证失败后自动选择回滚候选
    pub auto_rollback: bool,
    /// 预先确认回滚决策（`--yes`）
    pub confirmed: bool,
    /// 即使目标已运行同一制品也重新部署
    pub force: bool,
    /// 变更前先做安全备份
    pub safety_backup: bool,
    /// 健康检查后再跑 CRUD 冒烟检查
    pub smoke_test: bool,
    pub health: VerifyOptions,
    /// 外部指定的运行 ID（如 CI 的部署记录 ID），为空时自动生成
    pub run_id: Option<String>,
}

/// 失败步骤摘要
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct StepError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl From<&DeployError> for StepError {
    fn from(err: &DeployError) -> Self {
        Self {
            kind: err.kind(),
            detail: err.to_string(),
        }
    }
}

/// 回滚结果
#[derive(Clone, Debug, Serialize)]
pub struct RollbackReport {
    pub decision: RollbackDecision,
    /// 回滚尝试（决策未确认时为空）
    pub attempt: Option<DeploymentAttempt>,
    pub summary: Option<RollbackSummary>,
}

impl RollbackReport {
    pub fn executed(&self) -> bool {
        self.attempt.is_some()
    }
}

/// 部署结果
#[derive(Clone, Debug, Serialize)]
pub struct DeployReport {
    pub run_id: String,
    /// 部署尝试（no-op 时为空）
    pub attempt: Option<DeploymentAttempt>,
    pub rollback: Option<RollbackReport>,
    /// 自动回滚未能开始的原因
    pub rollback_error: Option<StepError>,
    /// 目标已运行该制品，未做任何变更
    pub noop: bool,
}

impl DeployReport {
    /// 部署是否成功（no-op 视为成功）
    pub fn succeeded(&self) -> bool {
        self.noop || self.attempt.as_ref().map_or(false, |a| a.is_succeeded())
    }

    /// 部署失败的原因
    pub fn failure(&self) -> Option<StepError> {
        let attempt = self.attempt.as_ref()?;
        match attempt.outcome {
            Some(AttemptOutcome::Failed { kind, ref detail, .. }) => Some(StepError {
                kind,
                detail: detail.clone(),
            }),
            _ => None,
        }
    }
}

/// 控制器配置
#[derive(Clone, Debug)]
pub struct ControllerSettings {
    /// 应用仓库 `<namespace>/<repo>`
    pub repository: String,
    /// 健康端点模板，`{host}` 替换为目标主机
    pub health_url: String,
    pub layout: ComposeLayout,
    /// 可达性探测策略（指数退避）
    pub reachability: RetryPolicy,
}

/// 部署控制器
#[derive(Clone)]
pub struct DeploymentController {
    executor: Arc<dyn RemoteExecutor>,
    selector: RollbackSelector,
    verifier: HealthVerifier,
    backups: BackupManager,
    locks: TargetLocks,
    attempts: Arc<AttemptStore>,
    settings: ControllerSettings,
    smoke: Option<SmokeTester>,
}

impl DeploymentController {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        selector: RollbackSelector,
        verifier: HealthVerifier,
        backups: BackupManager,
        locks: TargetLocks,
        attempts: Arc<AttemptStore>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            executor,
            selector,
            verifier,
            backups,
            locks,
            attempts,
            settings,
            smoke: None,
        }
    }

    pub fn with_smoke_tester(mut self, smoke: SmokeTester) -> Self {
        self.smoke = Some(smoke);
        self
    }

    pub fn repository(&self) -> &str {
        &self.settings.repository
    }

    pub fn selector(&self) -> &RollbackSelector {
        &self.selector
    }

    pub fn attempts(&self) -> &Arc<AttemptStore> {
        &self.attempts
    }

    /// 健康端点地址
    pub fn health_endpoint(&self, target: &DeploymentTarget) -> String {
        self.settings.health_url.replace("{host}", &target.host)
    }

    /// 只做健康验证，不改动目标
    pub async fn verify(
        &self,
        target: &DeploymentTarget,
        opts: &VerifyOptions,
        cancel: &CancellationToken,
    ) -> DeployResult<HealthCheckResult> {
        self.verifier
            .verify(&self.health_endpoint(target), opts, cancel)
            .await
    }

    /// 部署制品
    ///
    /// 获取目标租约和连通性确认之前失败时返回 `Err`，不产生尝试，
    /// 只留下一条运行级记录；尝试开始后的失败记录在报告的尝试结果里
    pub async fn deploy(
        &self,
        target: DeploymentTarget,
        artifact: ArtifactReference,
        opts: &DeployOptions,
        cancel: &CancellationToken,
    ) -> DeployResult<DeployReport> {
        let run_id = opts
            .run_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let target_key = target.key();
        let requested = artifact.clone();

        let result = self.run_deploy(run_id.clone(), target, artifact, opts, cancel).await;
        if let Err(ref e) = result {
            self.attempts
                .record_run(RunRecord::rejected(run_id, target_key, requested, e))
                .await;
        }
        result
    }

    async fn run_deploy(
        &self,
        run_id: String,
        target: DeploymentTarget,
        artifact: ArtifactReference,
        opts: &DeployOptions,
        cancel: &CancellationToken,
    ) -> DeployResult<DeployReport> {
        if !is_valid_tag(&artifact.tag) {
            return Err(DeployError::invalid_input(format!("invalid tag '{}'", artifact.tag)));
        }

        let _lease = self.locks.try_acquire(&target, "deploy")?;
        let target = self.ensure_reachable(target, cancel).await?;
        let health_endpoint = self.health_endpoint(&target);
        let ctx = DeployContext::new(
            run_id.clone(),
            target,
            artifact,
            health_endpoint,
            cancel.clone(),
            self.executor.clone(),
        );

        // 可变别名不代表固定版本，每次都重新拉取
        let mutable = self.selector.policy().is_mutable(&ctx.artifact.tag);
        if !opts.force && !mutable {
            if let Some(current) = self.verified_artifact(&ctx).await? {
                if current == ctx.artifact {
                    info!(
                        run_id = %run_id,
                        target = %ctx.target,
                        tag = %ctx.artifact.tag,
                        "Target already runs this artifact, nothing to do"
                    );
                    self.attempts
                        .record_run(RunRecord::noop(&run_id, ctx.target.key(), ctx.artifact.clone()))
                        .await;
                    return Ok(DeployReport {
                        run_id,
                        attempt: None,
                        rollback: None,
                        rollback_error: None,
                        noop: true,
                    });
                }
            }
        }

        info!(
            run_id = %run_id,
            target = %ctx.target,
            image = %ctx.artifact.image(),
            "Starting deployment"
        );

        let mut attempt = DeploymentAttempt::new(
            &run_id,
            ctx.target.key(),
            ctx.artifact.clone(),
            DeployPhase::Provisioned,
        );
        self.attempts.begin(&attempt).await?;
        let result = self.run_cycle(&ctx, &mut attempt, opts).await;
        let verification_failed = matches!(result, Err(DeployError::VerificationTimeout { .. }));
        self.complete(&mut attempt, result).await;

        let mut report = DeployReport {
            run_id,
            attempt: Some(attempt),
            rollback: None,
            rollback_error: None,
            noop: false,
        };

        // 只有验证失败才回滚；连接 / 工具错误和取消直接返回
        if verification_failed && opts.auto_rollback {
            match self.auto_rollback(&ctx, opts).await {
                Ok(rollback) => report.rollback = Some(rollback),
                Err(e) => {
                    error!(run_id = %ctx.run_id, target = %ctx.target, error = %e, "Automatic rollback not possible");
                    report.rollback_error = Some(StepError::from(&e));
                }
            }
        }

        Ok(report)
    }

    /// 为目标生成回滚决策（未确认）
    ///
    /// 以主机上安装的制品为当前版本（部署失败后即为失败的版本），
    /// `tag` 为空时由选择器挑选候选
    pub async fn plan_rollback(
        &self,
        target: &DeploymentTarget,
        tag: Option<&str>,
        cancel: &CancellationToken,
    ) -> DeployResult<RollbackDecision> {
        let target = self.ensure_reachable(target.clone(), cancel).await?;
        let health_endpoint = self.health_endpoint(&target);
        let ctx = DeployContext::new(
            "plan",
            target,
            ArtifactReference::new(self.settings.repository.clone(), ""),
            health_endpoint,
            cancel.clone(),
            self.executor.clone(),
        );
        let current = self
            .installed_artifact(&ctx)
            .await?
            .ok_or_else(|| DeployError::not_found(format!("deployed tag on {}", ctx.target)))?;

        let repository = &self.settings.repository;
        match tag {
            Some(tag) => self.selector.decide_explicit(repository, &current.tag, tag).await,
            None => self.selector.select(repository, &current.tag).await,
        }
    }

    /// 执行已确认的回滚，完成后重新做健康验证
    pub async fn execute_rollback(
        &self,
        target: DeploymentTarget,
        rollback: ConfirmedRollback,
        opts: &DeployOptions,
        cancel: &CancellationToken,
    ) -> DeployResult<RollbackReport> {
        let _lease = self.locks.try_acquire(&target, "rollback")?;
        let target = self.ensure_reachable(target, cancel).await?;
        let health_endpoint = self.health_endpoint(&target);
        let run_id = opts
            .run_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let ctx = DeployContext::new(
            run_id,
            target,
            rollback.candidate().clone(),
            health_endpoint,
            cancel.clone(),
            self.executor.clone(),
        );
        self.run_rollback(&ctx, rollback, opts).await
    }

    /// 运维触发的回滚：生成决策，`confirmed` 为 false 时拒绝执行
    pub async fn rollback(
        &self,
        target: DeploymentTarget,
        tag: Option<&str>,
        confirmed: bool,
        opts: &DeployOptions,
        cancel: &CancellationToken,
    ) -> DeployResult<RollbackReport> {
        let decision = self.plan_rollback(&target, tag, cancel).await?;
        let confirmed = decision.confirm_if(confirmed)?;
        self.execute_rollback(target, confirmed, opts, cancel).await
    }

    /// 在已持有租约的情况下选择并执行回滚
    async fn auto_rollback(&self, ctx: &DeployContext, opts: &DeployOptions) -> DeployResult<RollbackReport> {
        let decision = self
            .selector
            .select(&ctx.artifact.repository, &ctx.artifact.tag)
            .await?;

        if !opts.confirmed {
            warn!(
                run_id = %ctx.run_id,
                target = %ctx.target,
                candidate = %decision.candidate.tag,
                "Rollback candidate selected but not confirmed, leaving it to the operator"
            );
            return Ok(RollbackReport {
                decision,
                attempt: None,
                summary: None,
            });
        }

        let rollback = decision.confirm();
        let rollback_ctx = ctx.for_artifact(rollback.candidate().clone());
        self.run_rollback(&rollback_ctx, rollback, opts).await
    }

    /// 回滚周期：RollingBack → Deploying → Verifying
    ///
    /// 消费已确认的决策，回滚失败不会再次回滚
    async fn run_rollback(
        &self,
        ctx: &DeployContext,
        rollback: ConfirmedRollback,
        opts: &DeployOptions,
    ) -> DeployResult<RollbackReport> {
        let decision = rollback.into_decision();
        info!(
            run_id = %ctx.run_id,
            target = %ctx.target,
            from = %decision.current.tag,
            to = %decision.candidate.tag,
            "Rolling back"
        );

        let mut attempt = DeploymentAttempt::new(
            &ctx.run_id,
            ctx.target.key(),
            decision.candidate.clone(),
            DeployPhase::RollingBack,
        );
        self.attempts.begin(&attempt).await?;

        let cycle_opts = DeployOptions {
            auto_rollback: false,
            safety_backup: false,
            ..opts.clone()
        };
        let result = self.run_cycle(ctx, &mut attempt, &cycle_opts).await;
        let health_outcome = match result {
            Ok(()) => HealthOutcome::Healthy,
            Err(ref e) => HealthOutcome::Unhealthy { detail: e.to_string() },
        };
        self.complete(&mut attempt, result).await;

        let summary = RollbackSummary {
            previous: decision.current.tag.clone(),
            rolled_back_to: decision.candidate.tag.clone(),
            health_outcome,
        };
        Ok(RollbackReport {
            decision,
            attempt: Some(attempt),
            summary: Some(summary),
        })
    }

    /// 部署周期
    ///
    /// 从 Provisioned 开始时先检查前置条件（并可做安全备份），
    /// 从 RollingBack 开始时直接重新配置
    async fn run_cycle(
        &self,
        ctx: &DeployContext,
        attempt: &mut DeploymentAttempt,
        opts: &DeployOptions,
    ) -> DeployResult<()> {
        let layout = &self.settings.layout;

        if attempt.phase == DeployPhase::Provisioned {
            ctx.exec(&layout.prerequisites()).await?;
            if opts.safety_backup {
                self.safety_backup(ctx).await?;
            }
            self.enter(ctx, attempt, DeployPhase::Configured).await?;
        }
        // 从这里开始目标不再运行已验证的版本
        let host = ctx.target.host_key();
        self.attempts.mark_installed(&host, ctx.artifact.clone()).await;
        ctx.exec(&layout.clear_marker()).await?;
        ctx.exec(&layout.configure(&ctx.artifact)).await?;

        self.enter(ctx, attempt, DeployPhase::Deploying).await?;
        ctx.exec(&layout.pull_image(&ctx.artifact)).await?;
        ctx.exec(&layout.compose_up(&ctx.artifact)).await?;

        self.enter(ctx, attempt, DeployPhase::Verifying).await?;
        self.verifier
            .verify(&ctx.health_endpoint, &opts.health, &ctx.cancel_token)
            .await?;
        if opts.smoke_test {
            match self.smoke {
                Some(ref smoke) => smoke.run(ctx.service_base_url()).await?,
                None => warn!(run_id = %ctx.run_id, "Smoke test requested but no tester configured"),
            }
        }

        ctx.exec(&layout.write_marker(&ctx.artifact)).await?;
        self.attempts.remember_current(&host, ctx.artifact.clone()).await;
        Ok(())
    }

    async fn safety_backup(&self, ctx: &DeployContext) -> DeployResult<()> {
        let name = format!(
            "{}{}_{}",
            SAFETY_PREFIX,
            ctx.artifact.tag,
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        );
        let record = self
            .backups
            .backup_under_lease(&ctx.target, &name, &ctx.cancel_token)
            .await?;
        info!(run_id = %ctx.run_id, target = %ctx.target, backup = %record.name, "Safety backup taken");
        Ok(())
    }

    async fn enter(
        &self,
        ctx: &DeployContext,
        attempt: &mut DeploymentAttempt,
        phase: DeployPhase,
    ) -> DeployResult<()> {
        if ctx.is_cancelled() {
            return Err(DeployError::Cancelled);
        }
        attempt.advance(phase)?;
        info!(
            run_id = %ctx.run_id,
            target = %ctx.target,
            tag = %ctx.artifact.tag,
            phase = %phase,
            "Entered phase"
        );
        self.attempts.update(attempt).await;
        Ok(())
    }

    /// 写入终态并移入历史
    async fn complete(&self, attempt: &mut DeploymentAttempt, result: DeployResult<()>) {
        let recorded = match result {
            Ok(()) => {
                info!(attempt = %attempt.id, target = %attempt.target, tag = %attempt.artifact.tag, "Deployment succeeded");
                attempt.succeed()
            }
            Err(ref e) => {
                error!(
                    attempt = %attempt.id,
                    target = %attempt.target,
                    tag = %attempt.artifact.tag,
                    phase = %attempt.phase,
                    kind = %e.kind(),
                    error = %e,
                    "Deployment failed"
                );
                attempt.fail(e)
            }
        };
        if let Err(e) = recorded {
            error!(attempt = %attempt.id, error = %e, "Failed to record attempt outcome");
        }
        self.attempts.finish(attempt).await;
    }

    /// 带指数退避的可达性探测
    async fn ensure_reachable(
        &self,
        mut target: DeploymentTarget,
        cancel: &CancellationToken,
    ) -> DeployResult<DeploymentTarget> {
        let probe = self.settings.layout.probe();
        let result = self
            .settings
            .reachability
            .run(cancel, |attempt| {
                let executor = self.executor.clone();
                let target = target.clone();
                let probe = probe.clone();
                let cancel = cancel.clone();
                async move {
                    match executor.run(&target, &probe, &cancel).await {
                        Ok(_) => Ok(()),
                        Err(DeployError::Cancelled) => Err(DeployError::Cancelled),
                        Err(e) => {
                            warn!(target = %target, attempt, error = %e, "Target not reachable yet");
                            Err(e)
                        }
                    }
                }
            })
            .await;

        match result {
            Ok(()) => {
                target.mark_reachable();
                Ok(target)
            }
            Err(RetryError::Cancelled) => Err(DeployError::Cancelled),
            Err(RetryError::Exhausted { attempts, last }) => {
                target.mark_unreachable();
                error!(target = %target, attempts, error = %last, "Target unreachable");
                Err(last)
            }
        }
    }

    /// 最近一次验证通过且之后未被改动的制品：优先用本地记录，否则读远程标记
    async fn verified_artifact(&self, ctx: &DeployContext) -> DeployResult<Option<ArtifactReference>> {
        let host = ctx.target.host_key();
        if let Some(current) = self.attempts.current_artifact(&host).await {
            return Ok(Some(current));
        }

        let current = self.read_remote_tag(ctx, &self.settings.layout.read_marker()).await?;
        if let Some(ref current) = current {
            self.attempts.remember_current(&host, current.clone()).await;
        }
        Ok(current)
    }

    /// 主机上安装的制品，不论是否通过验证
    async fn installed_artifact(&self, ctx: &DeployContext) -> DeployResult<Option<ArtifactReference>> {
        let host = ctx.target.host_key();
        if let Some(installed) = self.attempts.installed_artifact(&host).await {
            return Ok(Some(installed));
        }

        let installed = self.read_remote_tag(ctx, &self.settings.layout.read_installed()).await?;
        if let Some(ref installed) = installed {
            self.attempts.remember_installed(&host, installed.clone()).await;
        }
        Ok(installed)
    }

    async fn read_remote_tag(
        &self,
        ctx: &DeployContext,
        command: &RemoteCommand,
    ) -> DeployResult<Option<ArtifactReference>> {
        let output = ctx.exec_unchecked(command).await?;
        let tag = output.stdout.trim();
        if !output.success() || !is_valid_tag(tag) {
            return Ok(None);
        }
        Ok(Some(ArtifactReference::new(self.settings.repository.clone(), tag)))
    }
}
